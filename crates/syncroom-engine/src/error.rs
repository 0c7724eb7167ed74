//! Engine errors.

use syncroom_types::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    /// Another participant holds the host address for this session.
    #[error("host identity {id} is already claimed after {attempts} attempts")]
    IdentityConflict { id: PeerId, attempts: u32 },

    #[error("protocol error: {0}")]
    Protocol(#[from] syncroom_protocol::ProtocolError),

    #[error("engine has been shut down")]
    ShutDown,

    #[error("engine task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
