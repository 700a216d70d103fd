//! Node configuration loading.

use owtp_types::NodeConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable overriding the default config location.
pub const CONFIG_ENV: &str = "OWTP_CONFIG";

/// `$OWTP_CONFIG`, or `owtp.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("owtp.toml"))
}

/// Load the node configuration from a TOML file.
///
/// Missing or invalid files fall back to defaults with a warning; a node can
/// always start.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "OWTP: loaded configuration");
                    for problem in validate_config(&config) {
                        tracing::warn!(path = %config_path.display(), "OWTP: {}", problem);
                    }
                    return config;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %config_path.display(),
                        "OWTP: failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "OWTP: failed to read config, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "OWTP: config file not found, using defaults"
        );
    }

    NodeConfig::default()
}

/// Settings that load fine but will not behave as intended.
pub fn validate_config(config: &NodeConfig) -> Vec<String> {
    let mut problems = Vec::new();
    if config.request_timeout_ms == 0 {
        problems.push("request_timeout_ms is 0, every call will time out".to_string());
    }
    if config.timeout_sweep_ms > config.request_timeout_ms {
        problems.push(format!(
            "timeout_sweep_ms ({}) exceeds request_timeout_ms ({})",
            config.timeout_sweep_ms, config.request_timeout_ms
        ));
    }
    if config.heartbeat_interval_ms >= config.read_timeout_ms {
        problems.push(format!(
            "heartbeat_interval_ms ({}) must be below read_timeout_ms ({})",
            config.heartbeat_interval_ms, config.read_timeout_ms
        ));
    }
    let seed_ok = matches!(hex::decode(config.private_key.trim()), Ok(k) if k.len() == 32);
    if !config.private_key.is_empty() && !seed_ok {
        problems.push("private_key is not a 32-byte hex seed".to_string());
    }
    for listen in &config.listen {
        if listen.address.is_empty() && listen.receive_queue.is_empty() {
            problems.push(format!("{} listener has no address", listen.connect_type));
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use owtp_types::ConnectType;

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owtp.toml");
        std::fs::write(
            &path,
            r#"
request_timeout_ms = 5000
timeout_sweep_ms = 500

[[listen]]
address = "127.0.0.1:9420"
connect_type = "ws"
enable_key_agreement = true

[[listen]]
address = "127.0.0.1:9421"
connect_type = "http"
path = "/owtp"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.request_timeout_ms, 5000);
        assert_eq!(config.timeout_sweep_ms, 500);
        assert_eq!(config.heartbeat_interval_ms, NodeConfig::default().heartbeat_interval_ms);
        assert_eq!(config.listen.len(), 2);
        assert!(config.listen[0].enable_key_agreement);
        assert_eq!(config.listen[1].connect_type, ConnectType::Http);
        assert_eq!(config.listen[1].path, "/owtp");
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_load_config_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "request_timeout_ms = \"soon\"").unwrap();
        assert_eq!(load_config(Some(&path)), NodeConfig::default());
    }

    #[test]
    fn test_validate_config() {
        assert!(validate_config(&NodeConfig::default()).is_empty());

        let config = NodeConfig {
            request_timeout_ms: 1_000,
            timeout_sweep_ms: 5_000,
            heartbeat_interval_ms: 90_000,
            private_key: "abcd".to_string(),
            ..Default::default()
        };
        let problems = validate_config(&config);
        assert_eq!(problems.len(), 3);
    }
}
