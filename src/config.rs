use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::agent::AgentTimeouts;
use crate::cli::Cli;
use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = ".review-pool.toml";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub agent_binary: Option<String>,
    pub agent_model: Option<String>,
    pub max_concurrent: Option<usize>,
    pub max_turns: Option<u32>,
    pub spawn_timeout_secs: Option<u64>,
    pub silence_timeout_secs: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
    pub store_path: Option<String>,
    pub prompt_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub agent_binary: String,
    pub agent_model: Option<String>,
    pub max_concurrent: usize,
    pub max_turns: u32,
    pub spawn_timeout_secs: u64,
    pub silence_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub store_path: PathBuf,
    pub prompt_dir: Option<String>,
}

impl Config {
    /// Load the config file and merge CLI overrides on top.
    ///
    /// An explicit `--config` path must exist; the default path is optional.
    pub fn load(cli: &Cli) -> Result<Self> {
        let file_config = match cli.config.as_deref() {
            Some(path) => {
                let path = Path::new(path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                parse_config(&std::fs::read_to_string(path)?)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    parse_config(&std::fs::read_to_string(path)?)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        let config = merge(file_config, cli);
        config.validate()?;
        Ok(config)
    }

    pub fn timeouts(&self) -> AgentTimeouts {
        AgentTimeouts {
            spawn_confirm: Duration::from_secs(self.spawn_timeout_secs),
            silence: Duration::from_secs(self.silence_timeout_secs),
            stall: Duration::from_secs(self.stall_timeout_secs),
        }
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("max_concurrent", self.max_concurrent as u64),
            ("max_turns", u64::from(self.max_turns)),
            ("spawn_timeout_secs", self.spawn_timeout_secs),
            ("silence_timeout_secs", self.silence_timeout_secs),
            ("stall_timeout_secs", self.stall_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::ConfigValidation(format!("{name} must be > 0")));
            }
        }
        if self.agent_binary.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "agent_binary must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    let checks = [
        ("max_concurrent", config.max_concurrent.map(|v| v as u64)),
        ("max_turns", config.max_turns.map(u64::from)),
        ("spawn_timeout_secs", config.spawn_timeout_secs),
        ("silence_timeout_secs", config.silence_timeout_secs),
        ("stall_timeout_secs", config.stall_timeout_secs),
    ];
    for (name, value) in checks {
        if value == Some(0) {
            return Err(Error::ConfigValidation(format!("{name} must be > 0")));
        }
    }
    Ok(())
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Config {
    let defaults = AgentTimeouts::default();
    Config {
        agent_binary: cli
            .agent_binary
            .clone()
            .or(file.agent_binary)
            .unwrap_or_else(|| "claude".to_string()),
        agent_model: cli.agent_model.clone().or(file.agent_model),
        max_concurrent: cli.max_concurrent.or(file.max_concurrent).unwrap_or(4),
        max_turns: cli.max_turns.or(file.max_turns).unwrap_or(30),
        spawn_timeout_secs: cli
            .spawn_timeout
            .or(file.spawn_timeout_secs)
            .unwrap_or(defaults.spawn_confirm.as_secs()),
        silence_timeout_secs: cli
            .silence_timeout
            .or(file.silence_timeout_secs)
            .unwrap_or(defaults.silence.as_secs()),
        stall_timeout_secs: cli
            .stall_timeout
            .or(file.stall_timeout_secs)
            .unwrap_or(defaults.stall.as_secs()),
        store_path: cli
            .store_path
            .clone()
            .or(file.store_path)
            .map(PathBuf::from)
            .unwrap_or_else(|| crate::store::FileStore::default_path(Path::new("."))),
        prompt_dir: cli.prompt_dir.clone().or(file.prompt_dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn status_cli(extra: &[&str]) -> Cli {
        let mut args = vec!["review-pool"];
        args.extend_from_slice(extra);
        args.extend_from_slice(&["status", "--task-id", "t"]);
        Cli::parse_from(args)
    }

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
agent_binary = "/opt/analyzer"
agent_model = "opus"
max_concurrent = 2
max_turns = 12
spawn_timeout_secs = 10
silence_timeout_secs = 60
stall_timeout_secs = 300
store_path = "/tmp/reviews.toml"
prompt_dir = "prompts"
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.agent_binary.as_deref(), Some("/opt/analyzer"));
        assert_eq!(config.max_concurrent, Some(2));
        assert_eq!(config.stall_timeout_secs, Some(300));
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_parse_zero_concurrency() {
        let err = parse_config("max_concurrent = 0").unwrap_err();
        assert!(err.to_string().contains("max_concurrent must be > 0"));
    }

    #[test]
    fn test_parse_zero_timeout() {
        let err = parse_config("silence_timeout_secs = 0").unwrap_err();
        assert!(err.to_string().contains("silence_timeout_secs must be > 0"));
    }

    #[test]
    fn test_parse_unknown_field() {
        let err = parse_config(r#"bogus = "value""#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_cli_overrides_config() {
        let file = ConfigFile {
            agent_binary: Some("file-bin".to_string()),
            max_concurrent: Some(8),
            max_turns: Some(10),
            ..Default::default()
        };
        let cli = status_cli(&["--agent-binary", "cli-bin", "--max-turns", "5"]);
        let config = merge(file, &cli);
        assert_eq!(config.agent_binary, "cli-bin"); // CLI wins
        assert_eq!(config.max_turns, 5); // CLI wins
        assert_eq!(config.max_concurrent, 8); // file value kept
    }

    #[test]
    fn test_defaults_applied() {
        let config = merge(ConfigFile::default(), &status_cli(&[]));
        assert_eq!(config.agent_binary, "claude");
        assert_eq!(config.agent_model, None);
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.max_turns, 30);
        assert_eq!(config.timeouts(), AgentTimeouts::default());
        assert_eq!(
            config.store_path,
            PathBuf::from("./.review-pool/reviews.toml")
        );
    }

    #[test]
    fn test_cli_zero_rejected_on_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();
        let path = path.to_string_lossy().to_string();
        let cli = status_cli(&["--config", &path, "--stall-timeout", "0"]);
        let err = Config::load(&cli).unwrap_err();
        assert!(err.to_string().contains("stall_timeout_secs must be > 0"));
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let cli = status_cli(&["--config", "/nonexistent/review-pool.toml"]);
        let err = Config::load(&cli).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    #[serial_test::serial]
    fn test_default_config_file_is_optional() {
        let original = std::env::current_dir().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let without_file = Config::load(&status_cli(&[]));
        std::fs::write(DEFAULT_CONFIG_PATH, "max_turns = 7\n").unwrap();
        let with_file = Config::load(&status_cli(&[]));

        std::env::set_current_dir(original).unwrap();
        assert_eq!(without_file.unwrap().max_turns, 30);
        assert_eq!(with_file.unwrap().max_turns, 7);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_concurrent = 3\nagent_model = \"haiku\"\n").unwrap();
        let path = path.to_string_lossy().to_string();
        let config = Config::load(&status_cli(&["--config", &path])).unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.agent_model.as_deref(), Some("haiku"));
    }
}
