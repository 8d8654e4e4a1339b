//! Spawns application worker processes with lowered privileges, waits for
//! their startup handshake, and hands out pooled connections to them.
//!
//! ```text
//! Spawner::spawn(options)
//!   -> PrivilegeResolver     target uid / gid / supplementary groups
//!   -> check_app_root_access every directory on the way must be reachable
//!   -> launch                fork, drop privileges, chdir, exec
//!   -> read_handshake        Ready | ExplainableError | ProtocolError | Timeout
//!   -> ProcessHandle         sockets, connect password, sessions
//! ```
//!
//! Unix only.

mod access;
pub mod accounts;
mod config;
mod error;
pub mod handshake;
pub mod launcher;
mod options;
pub mod pool;
pub mod privilege;
mod process;
mod process_group;
pub mod request;
mod session;
mod spawner;

pub use accounts::AccountDatabase;
pub use accounts::SystemAccounts;
pub use config::SpawnerConfig;
pub use error::ConfigurationError;
pub use error::ENVVARS_ANNOTATION;
pub use error::ErrorKind;
pub use error::SpawnError;
pub use error::SpawnerError;
pub use options::Options;
pub use options::STARTUP_FILE_GROUP;
pub use process::ProcessHandle;
pub use session::Session;
pub use spawner::Spawner;
