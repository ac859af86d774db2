use std::path::Path;

use tokio_util::sync::CancellationToken;

use super::rest::RestClient;
use super::tf_cli::{parse_workfold, parse_workspaces_detailed, run_tf};
use super::{Shelveset, TfsServer, UserInfo, WorkspaceHandle, WorkspaceInfo, WorkspaceMapping};
use crate::command::Tool;
use crate::error::Result;

/// Production [`TfsServer`]: workspace operations through `tf`, queries
/// through the REST API.
pub struct TfClient {
    collection_uri: String,
    tf: Tool,
    rest: RestClient,
}

impl TfClient {
    pub fn new(collection_uri: &str, tf: Tool, pat: Option<&str>) -> Result<Self> {
        Ok(Self {
            collection_uri: collection_uri.trim_end_matches('/').to_string(),
            tf,
            rest: RestClient::new(collection_uri, pat)?,
        })
    }

    fn collection_arg(&self) -> String {
        format!("/collection:{}", self.collection_uri)
    }

    fn tf(&self, what: &str, args: Vec<String>) -> Result<String> {
        run_tf(&self.tf, &args, None)?.into_result(what)
    }
}

impl TfsServer for TfClient {
    fn current_user(&self) -> Result<String> {
        self.rest.current_user()
    }

    fn workspace_for(&self, directory: &Path) -> Result<Option<WorkspaceInfo>> {
        let out = run_tf(
            &self.tf,
            &["workfold".to_string(), directory.display().to_string()],
            None,
        )?;
        if !out.status.success() {
            // "Unable to determine the workspace": not mapped.
            tracing::debug!(dir = %directory.display(), stderr = %out.stderr.trim(), "no workspace");
            return Ok(None);
        }
        Ok(parse_workfold(&out.stdout))
    }

    fn delete_mapping(&self, workspace: &WorkspaceHandle, mapping: &WorkspaceMapping) -> Result<()> {
        self.tf(
            "Cannot delete TFS mapping",
            vec![
                "workfold".to_string(),
                "/unmap".to_string(),
                format!("/workspace:{}", workspace.spec()),
                mapping.local_directory.display().to_string(),
            ],
        )
        .map(drop)
    }

    fn create_mapping(&self, workspace: &WorkspaceHandle, mapping: &WorkspaceMapping) -> Result<()> {
        self.tf(
            "Cannot create TFS mapping",
            vec![
                "workfold".to_string(),
                "/map".to_string(),
                mapping.server_folder.clone(),
                mapping.local_directory.display().to_string(),
                format!("/workspace:{}", workspace.spec()),
            ],
        )
        .map(drop)
    }

    fn query_workspaces(&self, owner: &str, computer: &str) -> Result<Vec<WorkspaceInfo>> {
        let text = self.tf(
            "Cannot query workspaces",
            vec![
                "workspaces".to_string(),
                format!("/owner:{owner}"),
                format!("/computer:{computer}"),
                "/format:detailed".to_string(),
                self.collection_arg(),
            ],
        )?;
        Ok(parse_workspaces_detailed(&text))
    }

    fn delete_workspace(&self, name: &str, owner: &str) -> Result<()> {
        self.tf(
            "Cannot delete workspace",
            vec![
                "workspace".to_string(),
                "/delete".to_string(),
                format!("{name};{owner}"),
                "/noprompt".to_string(),
                self.collection_arg(),
            ],
        )
        .map(drop)
    }

    fn get_latest(
        &self,
        _workspace: &WorkspaceHandle,
        directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        run_tf(
            &self.tf,
            &[
                "get".to_string(),
                directory.display().to_string(),
                "/recursive".to_string(),
                "/noprompt".to_string(),
            ],
            Some(cancel),
        )?
        .into_result("Cannot get latest version")
        .map(drop)
    }

    fn query_shelvesets(&self, name: Option<&str>, owner: Option<&str>) -> Result<Vec<Shelveset>> {
        self.rest.shelvesets(name, owner)
    }

    fn users(&self) -> Result<Vec<UserInfo>> {
        self.rest.valid_users()
    }
}
