#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod scheduler;
pub mod session;
pub mod streamer;
pub mod topic;
pub mod types;

pub use config::{ClientKind, PubMode, SessionConfig};
pub use error::ClientError;
pub use session::{SessionHandle, SessionState};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
