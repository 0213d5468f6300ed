pub mod circuit_breaker;
pub mod config;
pub mod ipc;
pub mod relay;
pub mod ring;
pub mod security;
pub mod session;
pub mod storage;
pub mod supervisor;

// Re-export auth so main.rs can use unbound_daemon::auth directly.
pub use ipc::auth;

use std::sync::Arc;

use config::DaemonConfig;
use ipc::event::EventBroadcaster;
use ring::RingRegistry;
use session::SessionManager;
use storage::Storage;

/// Shared application state passed to every RPC handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub storage: Arc<Storage>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub session_manager: Arc<SessionManager>,
    pub ring_registry: Arc<RingRegistry>,
    pub started_at: std::time::Instant,
    /// Local socket auth token (`{data_dir}/auth_token`). Every new
    /// connection must send `auth.login` with this token before any other
    /// method call. Empty string means auth is disabled (not recommended).
    pub auth_token: String,
    /// Signalled by the `shutdown` RPC or an OS signal handler to unblock
    /// `ipc::run`'s accept loop for a graceful stop.
    pub shutdown: Arc<tokio::sync::Notify>,
}
