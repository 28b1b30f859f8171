//! Server settings, layered from `<config_dir>/tek-s3/settings.json` and
//! `TS3_`-prefixed environment variables.

use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::catalog;

/// Path of the listening socket for `unix:<mode>` endpoints.
#[cfg(unix)]
pub const UNIX_SOCKET_PATH: &str = "/run/tek-s3.sock";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// `"host:port"`, or on Linux `"unix:<octal-mode>"`. Defaults to
    /// `127.0.0.1:8080`.
    #[serde(default)]
    pub listen_endpoint: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Override of the base state directory (containers, tests).
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_endpoint: None,
            log_level: default_log_level(),
            state_dir: None,
        }
    }
}

/// Parsed listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEndpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { perms: u32 },
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(dir) = catalog::config_dir() {
            builder = builder.add_source(
                File::from(dir.join("settings.json"))
                    .format(FileFormat::Json)
                    .required(false),
            );
        }
        builder
            .add_source(Environment::with_prefix("TS3").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Validate and parse `listen_endpoint`; invalid values are fatal at
    /// startup.
    pub fn endpoint(&self) -> anyhow::Result<ListenEndpoint> {
        let Some(raw) = self.listen_endpoint.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(ListenEndpoint::Tcp {
                host: "127.0.0.1".to_owned(),
                port: 8080,
            });
        };
        if let Some(mode) = raw.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                let perms = u32::from_str_radix(mode, 8).map_err(|_| {
                    anyhow::anyhow!("Invalid listen_endpoint value: invalid socket mode")
                })?;
                return Ok(ListenEndpoint::Unix { perms });
            }
            #[cfg(not(unix))]
            {
                let _ = mode;
                anyhow::bail!("Invalid listen_endpoint value: unix sockets are not supported");
            }
        }
        let colon = raw
            .rfind(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid listen_endpoint value: ':' not found"))?;
        let (host, port) = raw.split_at(colon);
        let port: u32 = port[1..]
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid listen_endpoint value: invalid port number"))?;
        if !(1..=65535).contains(&port) {
            anyhow::bail!("Invalid listen_endpoint value: port number must be in range [1, 65535]");
        }
        Ok(ListenEndpoint::Tcp {
            host: host.to_owned(),
            port: port as u16,
        })
    }

    /// Location of the state file, honoring the `state_dir` override.
    pub fn state_path(&self) -> Option<PathBuf> {
        match &self.state_dir {
            Some(dir) => Some(dir.join("tek-s3").join("state.json")),
            None => catalog::default_state_path(),
        }
    }
}
