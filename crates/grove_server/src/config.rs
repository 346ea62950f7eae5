//! Channel configuration, loaded from `channel/config.json`.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "channel/config.json";

/// TCP port clients connect to.
pub const CLIENT_PORT: u16 = 7575;

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    /// An ip address or a unix socket path.
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub db: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChannelConfig {
    pub database: DatabaseConfig,
    /// Login-control endpoint: `ip:port` or a unix socket path.
    pub listen: String,
}

impl ChannelConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        anyhow::ensure!(!config.listen.is_empty(), "listen address is empty");
        anyhow::ensure!(!config.database.host.is_empty(), "database host is empty");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_the_documented_shape() {
        let raw = r#"{
            "database": { "host": "127.0.0.1", "port": 3306, "user": "grove", "db": "grove" },
            "listen": "127.0.0.1:7979"
        }"#;
        let config: ChannelConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.database.port, 3306);
        assert_eq!(config.database.password, None);
        assert_eq!(config.listen, "127.0.0.1:7979");
    }

    #[test]
    fn rejects_out_of_range_ports() {
        let raw = r#"{
            "database": { "host": "h", "port": 123456, "user": "u", "db": "d" },
            "listen": "l"
        }"#;
        assert!(serde_json::from_str::<ChannelConfig>(raw).is_err());
    }
}
