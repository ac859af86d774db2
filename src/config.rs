//! Persisted settings plus environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::Tool;
use crate::error::{BridgeError, Result};
use crate::shelveset::DEFAULT_TEMPLATE;

/// How many recently used directories are kept.
const MAX_USED_DIRECTORIES: usize = 20;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Collection URI, e.g. `https://tfs.example.com/tfs/DefaultCollection`.
    #[serde(default)]
    pub tfs_uri: Option<String>,
    /// git-tfs command line; may include a host such as `mono`.
    #[serde(default)]
    pub git_tfs_command: Option<String>,
    #[serde(default)]
    pub tf_command: Option<String>,
    #[serde(default)]
    pub git_command: Option<String>,
    #[serde(default)]
    pub shelveset_template: Option<String>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub used_directories: Vec<PathBuf>,
    /// Personal access token. Environment only, never written to disk.
    #[serde(skip)]
    pub pat: Option<String>,
}

impl Settings {
    /// `$XDG_CONFIG_HOME/gittfs-shell/settings.json`, falling back to `~/.config`.
    pub fn file_path() -> Option<PathBuf> {
        let base = match env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => env::home_dir()?.join(".config"),
        };
        Some(base.join("gittfs-shell").join("settings.json"))
    }

    /// Missing or unreadable files yield defaults.
    pub fn load(path: &Path) -> Self {
        let Ok(data) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&data) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring malformed settings");
                Self::default()
            }
        }
    }

    /// Write atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(format!("cannot serialize settings: {e}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        if let Err(err) = fs::write(&tmp, content).and_then(|()| fs::rename(&tmp, path)) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Override fields from environment-style variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("TFS_URI") {
            self.tfs_uri = Some(v);
        }
        if let Some(v) = get("GIT_TFS_COMMAND") {
            self.git_tfs_command = Some(v);
        }
        if let Some(v) = get("TF_PATH") {
            self.tf_command = Some(v);
        }
        if let Some(v) = get("TFS_SHELVESET_TEMPLATE") {
            self.shelveset_template = Some(v);
        }
        if let Some(v) = get("TFS_PAT") {
            self.pat = Some(v);
        }
    }

    /// Make `dir` the current directory and move it to the front of the history.
    pub fn remember_directory(&mut self, dir: &Path) {
        self.directory = Some(dir.to_path_buf());
        self.used_directories.retain(|d| d != dir);
        self.used_directories.insert(0, dir.to_path_buf());
        self.used_directories.truncate(MAX_USED_DIRECTORIES);
    }

    pub fn tfs_uri(&self) -> Result<&str> {
        self.tfs_uri
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BridgeError::Config("TFS URI is not configured (set TFS_URI)".to_string()))
    }

    pub fn bridge_tool(&self) -> Result<Tool> {
        parse_tool(self.git_tfs_command.as_deref(), "git-tfs")
    }

    pub fn tf_tool(&self) -> Result<Tool> {
        parse_tool(self.tf_command.as_deref(), "tf")
    }

    pub fn git_program(&self) -> PathBuf {
        PathBuf::from(self.git_command.as_deref().unwrap_or("git"))
    }

    pub fn shelveset_template(&self) -> &str {
        self.shelveset_template
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_TEMPLATE)
    }
}

fn parse_tool(configured: Option<&str>, default: &str) -> Result<Tool> {
    let line = configured.unwrap_or(default);
    Tool::parse(line).ok_or_else(|| BridgeError::Config(format!("invalid command line '{line}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("nope.json"));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.shelveset_template(), DEFAULT_TEMPLATE);
        assert_eq!(settings.bridge_tool().unwrap(), Tool::new("git-tfs"));
        assert!(settings.tfs_uri().is_err());
    }

    #[test]
    fn test_save_load_keeps_pat_out_of_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg").join("settings.json");
        let mut settings = Settings {
            tfs_uri: Some("https://tfs.example.com/tfs/Coll".to_string()),
            pat: Some("secret".to_string()),
            ..Settings::default()
        };
        settings.remember_directory(Path::new("/work/a"));
        settings.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("secret"));
        assert!(!path.with_extension("tmp").exists());

        let loaded = Settings::load(&path);
        assert_eq!(loaded.tfs_uri, settings.tfs_uri);
        assert_eq!(loaded.directory.as_deref(), Some(Path::new("/work/a")));
        assert_eq!(loaded.pat, None);
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TFS_URI", "https://env/tfs/Coll"),
            ("GIT_TFS_COMMAND", "mono /opt/git-tfs/git-tfs.exe"),
            ("TFS_PAT", "token"),
            ("TF_PATH", "  "),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings {
            tf_command: Some("/usr/local/bin/tf".to_string()),
            ..Settings::default()
        };
        settings.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(settings.tfs_uri().unwrap(), "https://env/tfs/Coll");
        let tool = settings.bridge_tool().unwrap();
        assert_eq!(tool.program, PathBuf::from("mono"));
        assert_eq!(tool.leading_args, vec!["/opt/git-tfs/git-tfs.exe"]);
        assert_eq!(settings.pat.as_deref(), Some("token"));
        // Blank values do not override.
        assert_eq!(settings.tf_tool().unwrap(), Tool::new("/usr/local/bin/tf"));
    }

    #[test]
    fn test_remember_directory_moves_to_front() {
        let mut settings = Settings::default();
        settings.remember_directory(Path::new("/a"));
        settings.remember_directory(Path::new("/b"));
        settings.remember_directory(Path::new("/a"));
        assert_eq!(
            settings.used_directories,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }
}
