use serde::Deserialize;
use std::path::PathBuf;
use tracing::error;

const DEFAULT_MAX_SESSIONS: usize = 10;
const DEFAULT_SESSION_PRUNE_DAYS: u32 = 30;
const DEFAULT_RELAY_URL: &str = "wss://relay.unbound.computer/ws";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Maximum concurrent sessions; 0 = unlimited (default: 10).
    max_sessions: Option<usize>,
    /// Log level filter string, e.g. "debug", "info,unbound_daemon=trace" (default: "info").
    log: Option<String>,
    /// How many days of idle/error sessions to keep before pruning (default: 30; 0 = never).
    session_prune_days: Option<u32>,
    /// Override the outbound publish relay URL.
    relay_url: Option<String>,
}

fn load_toml(data_dir: &std::path::Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub relay_socket_path: PathBuf,
    pub log: String,
    pub max_sessions: usize,
    /// How many days before idle/error sessions are pruned (0 = never).
    pub session_prune_days: u32,
    /// Outbound publish relay URL (`UNBOUND_RELAY_URL` env var).
    pub relay_url: String,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        data_dir: Option<PathBuf>,
        socket_path: Option<PathBuf>,
        relay_socket_path: Option<PathBuf>,
        log: Option<String>,
        max_sessions: Option<usize>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let max_sessions = max_sessions
            .or(toml.max_sessions)
            .unwrap_or(DEFAULT_MAX_SESSIONS);
        let session_prune_days = toml.session_prune_days.unwrap_or(DEFAULT_SESSION_PRUNE_DAYS);

        let relay_url = std::env::var("UNBOUND_RELAY_URL")
            .ok()
            .or(toml.relay_url)
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        let socket_path = socket_path
            .or_else(|| std::env::var("UNBOUND_SOCKET_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| data_dir.join("daemon.sock"));
        let relay_socket_path = relay_socket_path
            .or_else(|| {
                std::env::var("UNBOUND_RELAY_SOCKET_PATH")
                    .ok()
                    .map(PathBuf::from)
            })
            .unwrap_or_else(|| data_dir.join("relay.sock"));

        Self {
            data_dir,
            socket_path,
            relay_socket_path,
            log,
            max_sessions,
            session_prune_days,
            relay_url,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("unbound");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("unbound");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("unbound");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("unbound");
        }
    }
    PathBuf::from(".unbound")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_socket_paths_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::new(Some(dir.path().to_path_buf()), None, None, None, None);
        assert_eq!(cfg.socket_path, dir.path().join("daemon.sock"));
        assert_eq!(cfg.relay_socket_path, dir.path().join("relay.sock"));
        assert_eq!(cfg.max_sessions, DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn explicit_socket_path_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("custom.sock");
        let cfg = DaemonConfig::new(
            Some(dir.path().to_path_buf()),
            Some(custom.clone()),
            None,
            None,
            None,
        );
        assert_eq!(cfg.socket_path, custom);
    }
}
