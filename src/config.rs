//! Application configuration.
//!
//! The configuration is loaded from a JSON file at
//! `$XDG_CONFIG_HOME/barlink/config.json`.  The top-level schema has one
//! section per concern so it can grow without breaking existing files.
//!
//! # Example
//!
//! ```json
//! {
//!   "client": { "retry_delay_ms": 1000, "request_timeout_ms": 5000 },
//!   "i3": { "socket": "/run/user/1000/i3/ipc-socket.1234" },
//!   "mpd": { "host": "/run/mpd/socket" }
//! }
//! ```
//!
//! Endpoints that are not configured are discovered from the environment
//! the same way the daemons' own command-line tools do it.

use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
///
/// Every field is optional — a minimal `{}` file is valid and all sections
/// fall back to their compiled-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection supervision settings shared by all clients.
    #[serde(default)]
    pub client: ClientConfig,

    /// i3 / sway IPC settings.
    #[serde(default)]
    pub i3: I3Config,

    /// MPD settings.
    #[serde(default)]
    pub mpd: MpdConfig,
}

/// Connection supervision settings.
///
/// All durations are in **milliseconds**.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Delay before reconnecting after a refused or lost connection.
    pub retry_delay_ms: u64,
    /// Deadline for each request, measured from the `command` call.
    /// `None` waits indefinitely.
    pub request_timeout_ms: Option<u64>,
    /// Upper bound on bytes taken from the socket per readiness event.
    pub read_chunk: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
            request_timeout_ms: None,
            read_chunk: 64 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// i3 / sway IPC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct I3Config {
    /// Socket path.  Discovered from the environment when unset.
    pub socket: Option<PathBuf>,
    /// Largest payload a frame may announce.  Default: 16 MiB.
    pub max_payload: usize,
}

impl Default for I3Config {
    fn default() -> Self {
        Self {
            socket: None,
            max_payload: 16 * 1024 * 1024,
        }
    }
}

impl I3Config {
    /// Resolve the IPC socket: the configured path, then `$I3SOCK`, then
    /// `$SWAYSOCK`, then `i3 --get-socketpath`.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        if let Some(path) = &self.socket {
            return Ok(Endpoint::Unix(path.clone()));
        }
        for var in ["I3SOCK", "SWAYSOCK"] {
            if let Some(path) = std::env::var_os(var).filter(|v| !v.is_empty()) {
                return Ok(Endpoint::Unix(PathBuf::from(path)));
            }
        }
        let output = std::process::Command::new("i3")
            .arg("--get-socketpath")
            .output()
            .map_err(|e| ConfigError(format!("failed to run i3 --get-socketpath: {}", e)))?;
        if !output.status.success() {
            return Err(ConfigError(format!(
                "i3 --get-socketpath exited with {}",
                output.status
            )));
        }
        let path = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if path.is_empty() {
            return Err(ConfigError("i3 --get-socketpath printed nothing".into()));
        }
        Ok(Endpoint::Unix(PathBuf::from(path)))
    }
}

/// MPD settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpdConfig {
    /// Socket path (starting with `/`) or host name.  Falls back to
    /// `$MPD_HOST`, then `localhost`.
    pub host: Option<String>,
    /// TCP port.  Falls back to `$MPD_PORT`, then 6600.
    pub port: Option<u16>,
    /// Prefix the server's first line must start with.
    pub greeting: String,
    /// Send `noidle` ahead of every command so a pending `idle` returns.
    pub interrupt_idle: bool,
    /// Longest line accepted from the server.  Default: 1 MiB.
    pub max_line: usize,
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            greeting: "OK MPD ".into(),
            interrupt_idle: true,
            max_line: 1024 * 1024,
        }
    }
}

impl MpdConfig {
    /// Resolve the server endpoint from this section and the environment.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let host = self
            .host
            .clone()
            .or_else(|| std::env::var("MPD_HOST").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "localhost".into());
        let port = match self.port {
            Some(port) => port,
            None => match std::env::var("MPD_PORT") {
                Ok(p) => p
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError(format!("invalid MPD_PORT: {:?}", p)))?,
                Err(_) => 6600,
            },
        };
        Ok(endpoint_for(&host, port))
    }
}

fn endpoint_for(host: &str, port: u16) -> Endpoint {
    if host.starts_with('/') {
        Endpoint::Unix(PathBuf::from(host))
    } else {
        Endpoint::Tcp(format!("{}:{}", host, port))
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| ConfigError(format!("failed to parse {}: {}", path.display(), e)))?;
        Ok(config)
    }
}

/// Error from loading a configuration file or resolving an endpoint.
#[derive(Debug, thiserror::Error)]
#[error("config error: {0}")]
pub struct ConfigError(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_full_config() {
        let json = r#"{
            "client": {
                "retry_delay_ms": 250,
                "request_timeout_ms": 5000,
                "read_chunk": 4096
            },
            "i3": { "socket": "/tmp/i3.sock", "max_payload": 1024 },
            "mpd": {
                "host": "/run/mpd/socket",
                "greeting": "OK MPD 0.23",
                "interrupt_idle": false,
                "max_line": 512
            }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.client.retry_delay(), Duration::from_millis(250));
        assert_eq!(cfg.client.request_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(cfg.client.read_chunk, 4096);
        assert_eq!(cfg.i3.max_payload, 1024);
        assert_eq!(
            cfg.i3.endpoint().unwrap(),
            Endpoint::Unix("/tmp/i3.sock".into())
        );
        assert_eq!(cfg.mpd.greeting, "OK MPD 0.23");
        assert!(!cfg.mpd.interrupt_idle);
        assert_eq!(cfg.mpd.max_line, 512);
    }

    #[test]
    fn deserialize_empty_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        let cd = ClientConfig::default();
        assert_eq!(cfg.client.retry_delay_ms, cd.retry_delay_ms);
        assert_eq!(cfg.client.request_timeout_ms, None);
        assert_eq!(cfg.client.read_chunk, cd.read_chunk);
        let md = MpdConfig::default();
        assert_eq!(cfg.mpd.greeting, md.greeting);
        assert_eq!(cfg.mpd.interrupt_idle, md.interrupt_idle);
        assert_eq!(cfg.i3.max_payload, I3Config::default().max_payload);
    }

    #[test]
    fn deserialize_partial_client() {
        let json = r#"{ "client": { "request_timeout_ms": 100 } }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.client.request_timeout(), Some(Duration::from_millis(100)));
        assert_eq!(cfg.client.retry_delay_ms, ClientConfig::default().retry_delay_ms);
    }

    #[test]
    fn unknown_top_level_keys_ignored() {
        let json = r#"{ "client": {}, "future_section": { "key": 42 } }"#;
        // Should not fail — unknown keys are silently ignored.
        let _cfg: Config = serde_json::from_str(json).unwrap();
    }

    #[test]
    fn mpd_host_selects_transport() {
        assert_eq!(
            endpoint_for("/run/mpd/socket", 6600),
            Endpoint::Unix("/run/mpd/socket".into())
        );
        assert_eq!(
            endpoint_for("music.lan", 6601),
            Endpoint::Tcp("music.lan:6601".into())
        );
    }

    #[test]
    fn configured_mpd_host_and_port_win() {
        let cfg = MpdConfig {
            host: Some("localhost".into()),
            port: Some(6700),
            ..MpdConfig::default()
        };
        assert_eq!(cfg.endpoint().unwrap(), Endpoint::Tcp("localhost:6700".into()));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/barlink/config.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
