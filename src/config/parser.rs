use super::{AgentConfig, ConfigError, ServerConfig};
use crate::constants::{CONFIG_DIR_NAME, DATABASE_PATH_ENV, SERVER_URL_ENV};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SERVER_CONFIG_FILE: &str = "server.yaml";
const AGENT_CONFIG_FILE: &str = "agent.yaml";

/// Location of a config file under the platform config directory,
/// e.g. `~/.config/tasklink/server.yaml`
pub fn default_config_path(file_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(file_name))
}

/// Loads a YAML or TOML configuration file, picking the format from the extension
///
/// # Errors
///
/// Returns an error if the file cannot be read, has an unknown extension, or
/// does not parse into `T`
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let display = path.display().to_string();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
                path: display,
                source,
            })
        }
        Some("toml") => toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: display,
            source,
        }),
        _ => Err(ConfigError::UnsupportedFormat(display)),
    }
}

/// Explicit path, else the default location if it exists, else built-in defaults
fn load_or_default<T: DeserializeOwned + Default>(
    path: Option<&Path>,
    default_file: &str,
) -> Result<T, ConfigError> {
    if let Some(path) = path {
        info!("Loading configuration from {}", path.display());
        return load_config(path);
    }
    match default_config_path(default_file) {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            load_config(&path)
        }
        _ => {
            debug!("No configuration file found, using defaults");
            Ok(T::default())
        }
    }
}

pub fn load_server_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config: ServerConfig = load_or_default(path, SERVER_CONFIG_FILE)?;
    apply_server_env(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

pub fn load_agent_config(path: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    let mut config: AgentConfig = load_or_default(path, AGENT_CONFIG_FILE)?;
    apply_agent_env(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_server_env(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(path) = lookup(DATABASE_PATH_ENV).filter(|v| !v.is_empty()) {
        config.database_path = path;
    }
}

fn apply_agent_env(config: &mut AgentConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup(SERVER_URL_ENV).filter(|v| !v.is_empty()) {
        config.server_url = url;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_yaml_server_config_with_human_durations() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "server.yaml",
            "bind: 0.0.0.0:9000\nbroker:\n  agent_timeout: 2m\n  max_stream_iterations: 10\norchestrator:\n  remote_step_timeout: 1h 30m\n",
        );

        let config: ServerConfig = load_config(&path).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.broker.agent_timeout, Duration::from_secs(120));
        assert_eq!(config.broker.max_stream_iterations, 10);
        // Untouched fields keep their defaults.
        assert_eq!(config.broker.stream_poll_interval, Duration::from_secs(1));
        assert_eq!(
            config.orchestrator.remote_step_timeout,
            Duration::from_secs(5400)
        );
    }

    #[test]
    fn test_toml_agent_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "agent.toml",
            "server_url = \"http://broker:8080\"\nagent_id = \"scraper-1\"\nmax_retries = 3\nbase_retry_delay = 2\nexponential_backoff = false\n",
        );

        let config: AgentConfig = load_config(&path).unwrap();
        assert_eq!(config.agent_id.as_deref(), Some("scraper-1"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_retry_delay, Duration::from_secs(2));
        assert!(!config.exponential_backoff);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "agent.json", "{}");
        assert!(matches!(
            load_config::<AgentConfig>(&path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_bad_duration_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "agent.yaml", "heartbeat_interval: soon\n");
        assert!(matches!(
            load_config::<AgentConfig>(&path),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut server = ServerConfig::default();
        apply_server_env(&mut server, |key| {
            (key == DATABASE_PATH_ENV).then(|| "/var/lib/tasklink.db".to_string())
        });
        assert_eq!(server.database_path, "/var/lib/tasklink.db");

        let mut agent = AgentConfig::default();
        apply_agent_env(&mut agent, |_| Some(String::new()));
        assert_eq!(agent.server_url, AgentConfig::default().server_url);
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = AgentConfig {
            base_retry_delay: Duration::from_secs(60),
            max_retry_delay: Duration::from_secs(30),
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let agent = AgentConfig {
            heartbeat_interval: Duration::ZERO,
            ..AgentConfig::default()
        };
        match agent.validate() {
            Err(ConfigError::Invalid(message)) => assert!(message.contains("heartbeat_interval")),
            other => panic!("unexpected {:?}", other),
        }
        let agent = AgentConfig {
            health_check_interval: Duration::ZERO,
            ..AgentConfig::default()
        };
        assert!(agent.validate().is_err());

        assert!(ServerConfig::default().validate().is_ok());
        let mut server = ServerConfig::default();
        server.orchestrator.poll_interval = Duration::ZERO;
        match server.validate() {
            Err(ConfigError::Invalid(message)) => assert!(message.contains("poll_interval")),
            other => panic!("unexpected {:?}", other),
        }
        let mut server = ServerConfig::default();
        server.broker.reap_interval = Duration::ZERO;
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_padded_agent_id_is_rejected() {
        let config = AgentConfig {
            agent_id: Some(" scraper-1 ".to_string()),
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_interval_from_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "server.yaml", "orchestrator:\n  poll_interval: 0s\n");
        let config: ServerConfig = load_config(&path).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
