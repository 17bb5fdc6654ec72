//! CLI Quest - sandboxed terminal sessions for command-line challenges.
//!
//! A client starts a challenge over HTTP, then drives a shell in an isolated
//! container through a WebSocket. Each session owns one container; commands
//! pass a denylist first and run one at a time.

pub mod challenges;
pub mod config;
pub mod error;
pub mod http_server;
pub mod policy;
pub mod protocol;
pub mod provisioner;
pub mod registry;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod terminal;

pub use error::{ApiError, SandboxError, SessionError};
pub use registry::{RegistrySettings, SessionRegistry};
pub use session::{Session, SessionState};
pub use state::AppState;
