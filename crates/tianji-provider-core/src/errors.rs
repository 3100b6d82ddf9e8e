use tianji_common::{ErrorKind, GatewayError};

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("invalid provider config: {0}")]
    InvalidConfig(String),
    #[error("request not expressible for this provider: {0}")]
    InvalidRequest(String),
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn decode(err: impl std::fmt::Display) -> Self {
        ProviderError::Decode(err.to_string())
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unsupported(op) => {
                GatewayError::invalid_request(format!("operation not supported: {op}"))
            }
            ProviderError::InvalidRequest(msg) => GatewayError::invalid_request(msg),
            ProviderError::InvalidConfig(msg) => {
                GatewayError::new(ErrorKind::InternalError, msg)
            }
            ProviderError::Decode(msg) => GatewayError::new(
                ErrorKind::BadGateway,
                format!("upstream response could not be decoded: {msg}"),
            ),
            ProviderError::Other(msg) => GatewayError::internal(msg),
        }
    }
}
