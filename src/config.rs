use std::fmt;
use std::path::PathBuf;

/// Server settings, read once from `FIELDBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "fieldbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    /// Only one of the TLS certificate and key was given.
    PartialTls,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::PartialTls => write!(
                f,
                "both FIELDBOOK_TLS_CERT and FIELDBOOK_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let parsed = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::Invalid { var, value }),
            }
        };
        let port_var = |var: &'static str| -> Result<Option<u16>, ConfigError> {
            match parsed(var)? {
                None => Ok(None),
                Some(p) => u16::try_from(p).map(Some).map_err(|_| ConfigError::Invalid {
                    var,
                    value: p.to_string(),
                }),
            }
        };

        let max_connections = match parsed("FIELDBOOK_MAX_CONNECTIONS")? {
            None => defaults.max_connections,
            Some(0) => {
                return Err(ConfigError::Invalid {
                    var: "FIELDBOOK_MAX_CONNECTIONS",
                    value: "0".into(),
                });
            }
            Some(n) => n as usize,
        };

        let tls_cert = lookup("FIELDBOOK_TLS_CERT");
        let tls_key = lookup("FIELDBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            port: port_var("FIELDBOOK_PORT")?.unwrap_or(defaults.port),
            bind: lookup("FIELDBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("FIELDBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("FIELDBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            compact_threshold: parsed("FIELDBOOK_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: port_var("FIELDBOOK_METRICS_PORT")?,
            tls_cert,
            tls_key,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("fieldbook.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/fieldbook.wal"));
    }

    #[test]
    fn overrides() {
        let config = from_pairs(&[
            ("FIELDBOOK_PORT", "6000"),
            ("FIELDBOOK_BIND", "127.0.0.1"),
            ("FIELDBOOK_DATA_DIR", "/var/lib/fieldbook"),
            ("FIELDBOOK_MAX_CONNECTIONS", "8"),
            ("FIELDBOOK_COMPACT_THRESHOLD", "50"),
            ("FIELDBOOK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/fieldbook/fieldbook.wal"));
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = from_pairs(&[("FIELDBOOK_PORT", "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid { var: "FIELDBOOK_PORT", value: "lots".into() }
        );
        assert!(from_pairs(&[("FIELDBOOK_PORT", "70000")]).is_err());
        assert!(from_pairs(&[("FIELDBOOK_MAX_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn tls_needs_both_halves() {
        assert_eq!(
            from_pairs(&[("FIELDBOOK_TLS_CERT", "cert.pem")]).unwrap_err(),
            ConfigError::PartialTls
        );
        let config = from_pairs(&[
            ("FIELDBOOK_TLS_CERT", "cert.pem"),
            ("FIELDBOOK_TLS_KEY", "key.pem"),
        ])
        .unwrap();
        assert_eq!(config.tls_key.as_deref(), Some("key.pem"));
    }
}
