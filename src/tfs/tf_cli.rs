//! Invoking the `tf` command-line client and parsing its text output.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{WorkspaceInfo, WorkspaceMapping};
use crate::command::Tool;
use crate::error::{BridgeError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct TfOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl TfOutput {
    pub fn into_result(self, what: &str) -> Result<String> {
        if self.status.success() {
            Ok(self.stdout)
        } else {
            let detail = if self.stderr.trim().is_empty() {
                self.stdout.trim().to_string()
            } else {
                self.stderr.trim().to_string()
            };
            Err(BridgeError::Server(format!("{what}: {detail}")))
        }
    }
}

/// Run `tf` to completion, killing it if `cancel` fires.
pub(crate) fn run_tf(
    tf: &Tool,
    args: &[String],
    cancel: Option<&CancellationToken>,
) -> Result<TfOutput> {
    tracing::trace!(program = %tf.program.display(), ?args, "tf");
    let mut child = Command::new(&tf.program)
        .args(&tf.leading_args)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain both pipes on their own threads so a chatty `tf get` cannot block.
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BridgeError::Canceled);
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(TfOutput {
        status,
        stdout: join_reader(stdout)?,
        stderr: join_reader(stderr)?,
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        pipe.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    })
}

fn join_reader(handle: Option<thread::JoinHandle<io::Result<String>>>) -> Result<String> {
    match handle {
        None => Ok(String::new()),
        Some(h) => h
            .join()
            .map_err(|_| BridgeError::Join("tf output reader panicked".to_string()))?
            .map_err(BridgeError::from),
    }
}

/// Parse `tf workfold <dir>` output.
///
/// ```text
/// ===================================================
/// Workspace : DEV1 (Jo Doe)
/// Collection: https://tfs.example.com/tfs/DefaultCollection
///  $/Proj/Main: C:\work\repo
/// ```
pub(crate) fn parse_workfold(text: &str) -> Option<WorkspaceInfo> {
    let mut name = None;
    let mut owner = String::new();
    let mut folders = Vec::new();

    for line in text.lines() {
        if let Some(mapping) = parse_mapping_line(line) {
            folders.push(mapping);
        } else if let Some((key, value)) = split_field(line)
            && key == "Workspace"
        {
            // `DEV1 (Jo Doe)`
            match value.rsplit_once(" (") {
                Some((n, o)) => {
                    name = Some(n.trim().to_string());
                    owner = o.trim_end_matches(')').trim().to_string();
                }
                None => name = Some(value.to_string()),
            }
        }
    }

    Some(WorkspaceInfo {
        name: name?,
        owner,
        computer: String::new(),
        folders,
    })
}

/// Parse `tf workspaces /format:detailed` output: one block per workspace,
/// separated by `=====` rules.
pub(crate) fn parse_workspaces_detailed(text: &str) -> Vec<WorkspaceInfo> {
    let mut out = Vec::new();
    let mut current: Option<WorkspaceInfo> = None;

    for line in text.lines() {
        if line.trim_start().starts_with("=====") {
            out.extend(current.take());
            continue;
        }
        if let Some(mapping) = parse_mapping_line(line) {
            if let Some(ws) = current.as_mut() {
                ws.folders.push(mapping);
            }
            continue;
        }
        let Some((key, value)) = split_field(line) else {
            continue;
        };
        match key {
            "Workspace" => {
                out.extend(current.take());
                current = Some(WorkspaceInfo {
                    name: value.to_string(),
                    owner: String::new(),
                    computer: String::new(),
                    folders: Vec::new(),
                });
            }
            "Owner" => {
                if let Some(ws) = current.as_mut() {
                    ws.owner = value.to_string();
                }
            }
            "Computer" => {
                if let Some(ws) = current.as_mut() {
                    ws.computer = value.to_string();
                }
            }
            _ => {}
        }
    }
    out.extend(current);
    out
}

/// ` $/Proj/Main: C:\work\repo`; cloaked folders are skipped.
fn parse_mapping_line(line: &str) -> Option<WorkspaceMapping> {
    let trimmed = line.trim();
    if !trimmed.starts_with("$/") {
        return None;
    }
    let (server, local) = trimmed.split_once(": ")?;
    let local = local.trim();
    if local.is_empty() {
        return None;
    }
    Some(WorkspaceMapping {
        server_folder: server.trim().to_string(),
        local_directory: PathBuf::from(local),
    })
}

fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_parse_workfold() {
        let text = "\
===============================================================================
Workspace : DEV1 (Jo Doe)
Collection: https://tfs.example.com/tfs/DefaultCollection
 $/Proj/Main: /work/repo
 (cloaked) $/Proj/Main/bin:
";
        let ws = parse_workfold(text).unwrap();
        assert_eq!(ws.name, "DEV1");
        assert_eq!(ws.owner, "Jo Doe");
        assert_eq!(
            ws.folders,
            vec![WorkspaceMapping::new("$/Proj/Main", "/work/repo")]
        );
        assert_eq!(ws.server_folder_for(Path::new("/work/repo")), Some("$/Proj/Main"));
    }

    #[test]
    fn test_parse_workfold_without_workspace() {
        assert!(parse_workfold("Unable to determine the workspace.").is_none());
    }

    #[test]
    fn test_parse_workspaces_detailed() {
        let text = "\
===============================================================================
Workspace : DEV1
Owner     : Jo Doe
Computer  : HOST
Comment   :
Collection: https://tfs.example.com/tfs/DefaultCollection
Permissions: Private
Location  : Server
File Time : Current

Working folders:

 $/Proj/Main: C:\\work\\repo

===============================================================================
Workspace : git-tfs-1a2b
Owner     : Jo Doe
Computer  : HOST
Comment   : Workspace created by git-tfs

Working folders:

 $/Proj/Main: C:\\Users\\jo\\AppData\\Local\\Temp\\git-tfs-1a2b
";
        let list = parse_workspaces_detailed(text);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "DEV1");
        assert_eq!(list[0].owner, "Jo Doe");
        assert_eq!(list[0].computer, "HOST");
        assert_eq!(list[0].folders.len(), 1);
        assert_eq!(list[1].name, "git-tfs-1a2b");
        assert!(list[1].maps_server_folder("$/Proj/Main"));
    }
}
