/// Errors that would host custom errors for the heartline modules, utilities, etc.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    //Heartline Errors
    #[error("HeartlineNotInitialized")]
    HeartlineNotInitialized,
    #[error("CallNotFound")]
    CallNotFound,
    #[error("CallNotInProgress")]
    CallNotInProgress,
    #[error("CallAlreadyInProgress")]
    CallAlreadyInProgress,
    #[error("FailedToSendSignal: {_0}")]
    FailedToSendSignal(String),
    #[error("InvalidSignal: {_0}")]
    InvalidSignal(String),
    #[error("NegotiationError: {_0}")]
    NegotiationError(String),
    #[error("Failed to access media devices: {_0}")]
    MediaAccessFailure(String),

    //Profile Errors
    #[error("Profile does not exist")]
    ProfileNotFound,

    //Signal Store Errors
    #[error("Signal store is unavailable")]
    SignalStoreUnavailable,

    //Misc
    #[error("{0}")]
    OtherWithContext(String),
    #[error("Sender Channel Unavailable")]
    SenderChannelUnavailable,
    #[error("Receiver Channel Unavailable")]
    ReceiverChannelUnavailable,
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("{0}")]
    UuidError(#[from] uuid::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error("An unknown error has occurred")]
    Other,
}
