//! Server configuration, loaded from TOML.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tickwire_core::RegistryKey;
use tickwire_net::protocol::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_PORT};
use tracing::warn;

/// Config file read when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/tickwire.toml";

/// Settings for the reference host and its control endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control endpoint listens on.
    pub bind_addr: SocketAddr,
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// How long shutdown waits for connections to finish closing.
    pub shutdown_grace_period_ms: u64,
    /// Largest frame a peer may send.
    pub max_frame_bytes: usize,
    /// Loaded optional extensions; gates plugin registration.
    pub extensions: Vec<String>,
    /// Commands left out of the registry.
    pub disabled_commands: Vec<RegistryKey>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            tick_rate: 20,
            shutdown_grace_period_ms: 1_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            extensions: Vec::new(),
            disabled_commands: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<ServerConfig>(&contents) {
                Ok(cfg) => cfg.sanitized(),
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    ServerConfig::default()
                }
            },
            Err(err) => {
                if path != Path::new(DEFAULT_CONFIG_PATH)
                    || err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                } else {
                    warn!(
                        "Server config not found at {}. Using defaults",
                        path.display()
                    );
                }
                ServerConfig::default()
            }
        }
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        Ok(())
    }

    /// Wall-clock length of one tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }

    /// Shutdown grace period.
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    fn sanitized(mut self) -> Self {
        if self.tick_rate == 0 {
            warn!("tick_rate must be positive; using 20");
            self.tick_rate = 20;
        }
        if self.max_frame_bytes == 0 {
            warn!("max_frame_bytes must be positive; using {DEFAULT_MAX_FRAME_BYTES}");
            self.max_frame_bytes = DEFAULT_MAX_FRAME_BYTES;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load_from_path(&dir.path().join("absent.toml"));
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(cfg.tick_interval(), Duration::from_millis(50));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickwire.toml");
        fs::write(
            &path,
            r#"
tick_rate = 10
extensions = ["bulk_edit"]
disabled_commands = ["send_system_chat"]
"#,
        )
        .unwrap();

        let cfg = ServerConfig::load_from_path(&path);
        assert_eq!(cfg.tick_rate, 10);
        assert_eq!(cfg.extensions, vec!["bulk_edit".to_string()]);
        assert_eq!(
            cfg.disabled_commands,
            vec![RegistryKey::parse("tickwire:send_system_chat").unwrap()]
        );
        assert_eq!(cfg.shutdown_grace_period(), Duration::from_secs(1));
    }

    #[test]
    fn malformed_file_falls_back_and_zero_rate_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "tick_rate = \"fast\"").unwrap();
        assert_eq!(ServerConfig::load_from_path(&broken), ServerConfig::default());

        let zero = dir.path().join("zero.toml");
        fs::write(&zero, "tick_rate = 0").unwrap();
        assert_eq!(ServerConfig::load_from_path(&zero).tick_rate, 20);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tickwire.toml");
        let cfg = ServerConfig {
            tick_rate: 40,
            extensions: vec!["bulk_edit".into()],
            ..ServerConfig::default()
        };
        cfg.save_to_path(&path).unwrap();
        assert_eq!(ServerConfig::load_from_path(&path), cfg);
    }
}
