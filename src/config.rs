use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "raindrop-notes")]
#[command(about = "Syncs Raindrop.io highlights into markdown notes", long_about = None)]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config_path: Option<String>,
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".raindrop-notes")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

/// Replaces a leading `~` with the home directory, if there is one.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

pub const DEFAULT_API_BASE_URL: &str = "https://api.raindrop.io/rest/v1";
/// The Raindrop API refuses pages larger than this.
pub const MAX_PAGE_SIZE: u32 = 50;

fn default_max_threads() -> usize {
    4
}

fn default_sync_every() -> u64 {
    10
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_replace_attempts() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub target_dir: PathBuf,
    pub access_token: String,
    pub collections: Vec<i64>,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Minutes between two sync cycles.
    #[serde(default = "default_sync_every")]
    pub sync_every: u64,
    #[serde(default)]
    pub raindrop_template: Option<PathBuf>,
    #[serde(default)]
    pub highlight_template: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_replace_attempts")]
    pub replace_attempts: u32,
}

impl Config {
    pub fn new(path: &Path) -> Result<Self> {
        let mut cfg = Config::load_config(path)?;
        cfg.expand_home_dirs();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        let yaml_with_env = Config::substitute_env_vars(yaml_str);
        let mut cfg: Config = serde_yaml::from_str(&yaml_with_env)?;
        cfg.expand_home_dirs();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_every * 60)
    }

    fn load_config(path: &Path) -> Result<Config> {
        let yaml_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let yaml_with_env = Config::substitute_env_vars(&yaml_str);
        let config: Config = serde_yaml::from_str(&yaml_with_env)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    fn expand_home_dirs(&mut self) {
        self.target_dir = expand_home(&self.target_dir);
        for path in [
            &mut self.raindrop_template,
            &mut self.highlight_template,
            &mut self.log_file,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand_home(path);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.access_token.trim().is_empty() {
            bail!("access_token must not be empty");
        }
        if self.collections.is_empty() {
            bail!("collections must list at least one collection id");
        }
        if self.max_threads == 0 {
            bail!("max_threads must be at least 1");
        }
        if self.sync_every == 0 {
            bail!("sync_every must be at least 1 minute");
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            bail!("page_size must be between 1 and {}", MAX_PAGE_SIZE);
        }
        if self.replace_attempts == 0 {
            bail!("replace_attempts must be at least 1");
        }
        Ok(())
    }

    fn substitute_env_vars(yaml_str: &str) -> String {
        let mut result = yaml_str.to_string();
        let mut offset = 0;

        while let Some(start) = result[offset..].find("${") {
            let actual_start = offset + start;
            let Some(end) = result[actual_start..].find('}') else {
                break;
            };
            let var_name = &result[actual_start + 2..actual_start + end];

            // ${VAR:-default}
            let env_value = match var_name.split_once(":-") {
                Some((actual_var, default_val)) => {
                    env::var(actual_var).unwrap_or_else(|_| default_val.to_string())
                }
                None => env::var(var_name).unwrap_or_else(|_| {
                    eprintln!("warning: environment variable '{}' not found", var_name);
                    String::new()
                }),
            };

            result.replace_range(actual_start..actual_start + end + 1, &env_value);
            offset = actual_start + env_value.len();
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
target_dir: /tmp/notes
access_token: secret
collections: [101, 202]
"#;

    #[test]
    fn test_defaults_applied() {
        let cfg = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.target_dir, PathBuf::from("/tmp/notes"));
        assert_eq!(cfg.collections, vec![101, 202]);
        assert_eq!(cfg.max_threads, 4);
        assert_eq!(cfg.sync_every, 10);
        assert_eq!(cfg.page_size, 50);
        assert_eq!(cfg.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(cfg.replace_attempts, 5);
        assert!(cfg.raindrop_template.is_none());
        assert_eq!(cfg.sync_interval(), Duration::from_secs(600));
    }

    #[test]
    fn test_env_default_substitution() {
        let yaml = r#"
target_dir: ${RAINDROP_NOTES_TEST_UNSET_DIR:-/srv/notes}
access_token: abc
collections: [1]
sync_every: 3
highlight_template: templates/highlight.md
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.target_dir, PathBuf::from("/srv/notes"));
        assert_eq!(cfg.sync_every, 3);
        assert_eq!(
            cfg.highlight_template,
            Some(PathBuf::from("templates/highlight.md"))
        );
    }

    #[test]
    fn test_missing_env_var_becomes_empty_and_fails_validation() {
        let yaml = r#"
target_dir: /tmp/notes
access_token: "${RAINDROP_NOTES_TEST_UNSET_TOKEN}"
collections: [1]
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("access_token"));
    }

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home(Path::new("~/vault")), home.join("vault"));
        assert_eq!(expand_home(Path::new("/abs/~/x")), PathBuf::from("/abs/~/x"));
        assert_eq!(expand_home(Path::new("~other")), PathBuf::from("~other"));
    }

    #[test]
    fn test_rejects_zero_threads() {
        let yaml = format!("{}max_threads: 0\n", MINIMAL);
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_rejects_oversized_page() {
        let yaml = format!("{}page_size: 51\n", MINIMAL);
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, MINIMAL).unwrap();
        let cfg = Config::new(&path).unwrap();
        assert_eq!(cfg.access_token, "secret");
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = Config::new(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(format!("{:#}", err).contains("/definitely/not/here.yaml"));
    }
}
