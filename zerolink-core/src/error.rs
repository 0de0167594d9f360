use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Library-internal error type. The public API surface flattens these into
/// [`ReturnCode`] values plus the thread-local errno where POSIX semantics
/// apply.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("identity: {0}")]
    Identity(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("service is not running")]
    ServiceNotRunning,
    #[error("operation not valid in the current state")]
    InvalidOp,
    #[error("invalid argument: {0}")]
    Arg(&'static str),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Collapse into the stable numeric code reported by the public API.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Error::ServiceNotRunning | Error::InvalidOp => ReturnCode::Service,
            Error::Arg(_) => ReturnCode::Arg,
            Error::Io(_) | Error::Protocol(_) => ReturnCode::General,
            Error::Config(_) | Error::Identity(_) | Error::Fatal(_) => ReturnCode::General,
        }
    }
}

// Map TOML deserialization errors into the config error domain without
// adding a new variant
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Stable return codes of the public API. Negative values are errors;
/// socket calls additionally set the thread-local errno.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok = 0,
    /// Socket-layer failure; consult errno.
    Socket = -1,
    /// The service (node and stack) is not up, or the call is invalid in
    /// the current lifecycle state.
    Service = -2,
    /// Structurally invalid argument.
    Arg = -3,
    /// Query found nothing.
    NoResult = -4,
    General = -5,
}

impl From<ReturnCode> for i32 {
    fn from(rc: ReturnCode) -> i32 {
        rc as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_are_stable() {
        assert_eq!(ReturnCode::Ok as i32, 0);
        assert_eq!(ReturnCode::Socket as i32, -1);
        assert_eq!(ReturnCode::Service as i32, -2);
        assert_eq!(ReturnCode::Arg as i32, -3);
        assert_eq!(ReturnCode::NoResult as i32, -4);
        assert_eq!(ReturnCode::General as i32, -5);
    }

    #[test]
    fn lifecycle_errors_map_to_service() {
        assert_eq!(Error::InvalidOp.return_code(), ReturnCode::Service);
        assert_eq!(Error::ServiceNotRunning.return_code(), ReturnCode::Service);
        assert_eq!(Error::Arg("addrlen").return_code(), ReturnCode::Arg);
    }
}
