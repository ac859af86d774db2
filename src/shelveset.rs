//! Shelveset naming and web links.

use url::Url;

use crate::error::{BridgeError, Result};

/// Used when no template is configured: branch name plus commit count.
pub const DEFAULT_TEMPLATE: &str = "{branch}_{count}";

/// A shelveset the session is about to create, or has created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShelvesetData {
    pub name: String,
    /// Owner; `None` means the authenticated user.
    pub user: Option<String>,
}

impl ShelvesetData {
    pub fn new(name: impl Into<String>, user: Option<String>) -> Self {
        Self {
            name: name.into(),
            user,
        }
    }
}

/// Expand a shelveset name template.
///
/// `{branch}` / `{0}` is the branch name and `{count}` / `{1}` the number of
/// commits that will be shelved. Unknown placeholders are left as they are.
pub fn format_shelveset_name(template: &str, branch: &str, count: usize) -> String {
    let template = if template.trim().is_empty() {
        DEFAULT_TEMPLATE
    } else {
        template
    };
    let count = count.to_string();
    template
        .replace("{branch}", branch)
        .replace("{0}", branch)
        .replace("{count}", &count)
        .replace("{1}", &count)
}

/// Suggested shelveset name for the current branch.
///
/// When dirty files are about to be committed first, that commit counts too.
pub fn default_shelveset_name(
    template: &str,
    branch: &str,
    non_merge_commit_count: usize,
    will_commit_dirty: bool,
) -> String {
    let count = non_merge_commit_count + usize::from(will_commit_dirty);
    format_shelveset_name(template, branch, count)
}

/// Git refuses spaces in branch names; shelveset names often have them.
pub fn normalize_branch_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

/// Branch suggested when unshelving. Someone else's shelveset gets the
/// owner's name as a prefix.
pub fn suggested_branch_name(shelveset: &str, other_owner: Option<&str>) -> String {
    let raw = match other_owner {
        Some(owner) => format!("{}_{}", owner.trim(), shelveset.trim()),
        None => shelveset.trim().to_string(),
    };
    raw.chars()
        .map(|c| if c.is_whitespace() || c == '/' { '_' } else { c })
        .collect()
}

/// Web-access link to a shelveset (`{tfs}/_versionControl/shelveset?ss=name;owner`).
pub fn shelveset_url(tfs_uri: &str, name: &str, owner: &str) -> Result<String> {
    let base = tfs_uri.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/_versionControl/shelveset"))
        .map_err(|e| BridgeError::Config(format!("invalid TFS URI '{tfs_uri}': {e}")))?;
    url.query_pairs_mut()
        .append_pair("ss", &format!("{name};{owner}"));
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggested_branch_prefixes_other_owner() {
        assert_eq!(suggested_branch_name(" fix login ", None), "fix_login");
        assert_eq!(
            suggested_branch_name("wip/parser", Some("Ann Lee")),
            "Ann_Lee_wip_parser"
        );
    }

    #[test]
    fn test_format_named_and_positional_placeholders() {
        assert_eq!(
            format_shelveset_name("{branch}_{count}", "feature", 3),
            "feature_3"
        );
        assert_eq!(format_shelveset_name("wip-{0}-{1}", "main", 7), "wip-main-7");
        assert_eq!(format_shelveset_name("", "main", 1), "main_1");
        assert_eq!(format_shelveset_name("{other}", "main", 1), "{other}");
    }

    #[test]
    fn test_dirty_commit_counts_toward_name() {
        assert_eq!(default_shelveset_name("", "topic", 2, true), "topic_3");
        assert_eq!(default_shelveset_name("", "topic", 2, false), "topic_2");
    }

    #[test]
    fn test_normalize_branch_name() {
        assert_eq!(normalize_branch_name(" my shelve set "), "my_shelve_set");
    }

    #[test]
    fn test_shelveset_url_encodes_owner() {
        let url = shelveset_url("https://tfs.example.com/tfs/Coll/", "fix 1", "DOMAIN\\jo").unwrap();
        assert!(url.starts_with("https://tfs.example.com/tfs/Coll/_versionControl/shelveset?ss="));
        assert!(url.contains("fix+1%3BDOMAIN%5Cjo"));
        assert!(shelveset_url("not a uri", "a", "b").is_err());
    }
}
