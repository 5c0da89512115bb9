use thiserror::Error;

use crate::base::ChannelState;

/// Why a single HTTP exchange failed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
pub enum RequestError {
    #[error("non-200 return code")]
    Status,
    #[error("no data returned")]
    NoData,
    #[error("request timed out")]
    Timeout,
    #[error("server rejected the session id")]
    UnknownSessionId,
    #[error("bad data returned")]
    BadData,
    #[error("handler failed while processing data")]
    HandlerException,
    #[error("client is offline")]
    BrowserOffline,
}

impl RequestError {
    /// Stable numeric code, matching the order of the variants.
    pub fn code(self) -> u8 {
        match self {
            RequestError::Status => 0,
            RequestError::NoData => 1,
            RequestError::Timeout => 2,
            RequestError::UnknownSessionId => 3,
            RequestError::BadData => 4,
            RequestError::HandlerException => 5,
            RequestError::BrowserOffline => 6,
        }
    }

    /// Human readable description including the status code where one applies.
    pub fn describe(self, status: Option<u16>) -> String {
        match (self, status) {
            (RequestError::Status, Some(code)) => format!("non-200 return code ({code})"),
            (RequestError::Status, None) => "request failed without a status".to_string(),
            (other, _) => other.to_string(),
        }
    }
}

/// Channel-level failure reported to the handler before the channel closes.
///
/// The success case (`OK`, code 0) is expressed as `Ok(())` wherever a
/// `Result<(), ChannelError>` crosses the handler boundary.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
pub enum ChannelError {
    #[error("request failed")]
    RequestFailed,
    #[error("logged out")]
    LoggedOut,
    #[error("no data")]
    NoData,
    #[error("unknown session id")]
    UnknownSessionId,
    #[error("server stopped the channel")]
    Stop,
    #[error("network error")]
    Network,
    #[error("bad data")]
    BadData,
    #[error("bad response")]
    BadResponse,
}

impl ChannelError {
    pub const OK_CODE: u8 = 0;

    pub fn code(self) -> u8 {
        match self {
            ChannelError::RequestFailed => 2,
            ChannelError::LoggedOut => 4,
            ChannelError::NoData => 5,
            ChannelError::UnknownSessionId => 6,
            ChannelError::Stop => 7,
            ChannelError::Network => 8,
            ChannelError::BadData => 10,
            ChannelError::BadResponse => 11,
        }
    }

    /// Maps the last error of a request that could not be retried.
    pub fn from_request_error(error: RequestError) -> Self {
        match error {
            RequestError::NoData => ChannelError::NoData,
            RequestError::BadData => ChannelError::BadData,
            RequestError::UnknownSessionId => ChannelError::UnknownSessionId,
            RequestError::BrowserOffline => ChannelError::Network,
            _ => ChannelError::RequestFailed,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("response is not an array")]
    NotAnArray,
    #[error("message is not a key/value map")]
    NotAMap,
    #[error("malformed literal at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
}

/// Errors returned synchronously by the public channel API.
#[derive(Debug, Error)]
pub enum WebChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("operation not allowed in state {0:?}")]
    InvalidState(ChannelState),
    #[error("invalid channel url: {0}")]
    Url(#[from] url::ParseError),
    #[error("channel driver has shut down")]
    Driver,
}

pub type WebChannelResult<T> = Result<T, WebChannelError>;
