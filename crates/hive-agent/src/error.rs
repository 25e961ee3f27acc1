use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to reach master: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("grpc call failed: {0}")]
    GrpcStatus(#[source] Box<tonic::Status>),

    #[error("master rejected request: {0}")]
    Rejected(String),

    #[error("invalid bind address {addr}: {reason}")]
    BindAddr { addr: String, reason: String },

    #[error("load engine failed: {0}")]
    Engine(String),

    #[error("agent cancelled")]
    Cancelled,
}

impl From<tonic::Status> for AgentError {
    fn from(status: tonic::Status) -> Self {
        AgentError::GrpcStatus(Box::new(status))
    }
}
