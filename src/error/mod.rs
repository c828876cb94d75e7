use thiserror::Error;
use tonic::Status;

/// Error kinds surfaced by the emulator registry. Each variant maps onto the
/// gRPC status code the real service answers with; the messages are part of
/// the observable contract and mirror the service verbatim.
#[derive(Error, Debug, Clone)]
pub enum EmulatorError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("Not yet implemented")]
    Unimplemented,
}

pub type Result<T> = std::result::Result<T, EmulatorError>;

impl From<EmulatorError> for Status {
    fn from(err: EmulatorError) -> Self {
        let message = err.to_string();
        match err {
            EmulatorError::InvalidArgument(_) => Status::invalid_argument(message),
            EmulatorError::NotFound(_) => Status::not_found(message),
            EmulatorError::AlreadyExists(_) => Status::already_exists(message),
            EmulatorError::FailedPrecondition(_) => Status::failed_precondition(message),
            EmulatorError::Unimplemented => Status::unimplemented(message),
        }
    }
}
