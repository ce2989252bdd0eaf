use super::{CommunicatorState, TransportError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Only this variant is returned to callers of the lifecycle operations.
    #[error("cannot {operation} a communicator that is {state}")]
    InvalidState {
        operation: &'static str,
        state: CommunicatorState,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("could not decode line {line:?}")]
    Decode { line: String },

    #[error("listener failed: {0}")]
    Listener(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
}
