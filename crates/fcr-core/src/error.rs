use thiserror::Error;

/// Numeric error-code ranges mirroring the taxonomy the external RPC boundary
/// carries typed exceptions back under: 1-13 generic, 100-199 user,
/// 200-299 device, 300-399 network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FcrErrorCode {
    Unknown = 1,
    Runtime = 2,
    Assertion = 3,
    Lookup = 4,
    StreamReader = 5,
    CommandExecutionTimeout = 6,
    NotImplemented = 7,
    Parsing = 8,
    Value = 9,
    Type = 10,
    Attribute = 11,
    Timeout = 12,
    Validation = 100,
    Permission = 101,
    UnsupportedDevice = 102,
    UnsupportedCommand = 103,
    DeviceError = 200,
    CommandExecutionError = 201,
    ConnectionError = 300,
    ConnectionTimeoutError = 301,
    InstanceOverloaded = 302,
}

impl FcrErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for FcrErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}

/// Single error type returned by every fallible operation in this crate.
/// `Session { .. }` is the "typed exception" (`SessionException`) the spec
/// describes the RPC boundary carrying back to `open_session`/`run_session`/
/// `close_session` callers.
#[derive(Error, Debug)]
pub enum FcrError {
    #[error("[{code}] {message}")]
    Session { code: FcrErrorCode, message: String },

    #[error("[{code}] unsupported device: {message}")]
    UnsupportedDevice { code: FcrErrorCode, message: String },

    #[error("[{code}] instance overloaded: {message}")]
    InstanceOverloaded { code: FcrErrorCode, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl FcrError {
    pub fn session(code: FcrErrorCode, message: impl Into<String>) -> Self {
        Self::Session {
            code,
            message: message.into(),
        }
    }

    pub fn unsupported_device(message: impl Into<String>) -> Self {
        Self::UnsupportedDevice {
            code: FcrErrorCode::UnsupportedDevice,
            message: message.into(),
        }
    }

    pub fn instance_overloaded(message: impl Into<String>) -> Self {
        Self::InstanceOverloaded {
            code: FcrErrorCode::InstanceOverloaded,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Session {
            code: FcrErrorCode::CommandExecutionTimeout,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Session {
            code: FcrErrorCode::ConnectionError,
            message: message.into(),
        }
    }

    pub fn connection_timeout(message: impl Into<String>) -> Self {
        Self::Session {
            code: FcrErrorCode::ConnectionTimeoutError,
            message: message.into(),
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Session {
            code: FcrErrorCode::Permission,
            message: message.into(),
        }
    }

    pub fn device_error(message: impl Into<String>) -> Self {
        Self::Session {
            code: FcrErrorCode::DeviceError,
            message: message.into(),
        }
    }

    pub fn stream_reader(message: impl Into<String>) -> Self {
        Self::Session {
            code: FcrErrorCode::StreamReader,
            message: message.into(),
        }
    }

    pub fn lookup(message: impl Into<String>) -> Self {
        Self::Session {
            code: FcrErrorCode::Lookup,
            message: message.into(),
        }
    }

    /// The numeric code this error maps to, for counter bookkeeping and for
    /// rendering the "typed exception" the RPC boundary carries back.
    pub fn code(&self) -> FcrErrorCode {
        match self {
            FcrError::Session { code, .. } => *code,
            FcrError::UnsupportedDevice { code, .. } => *code,
            FcrError::InstanceOverloaded { code, .. } => *code,
            FcrError::Io(_) => FcrErrorCode::StreamReader,
            FcrError::Ssh(_) => FcrErrorCode::ConnectionError,
            FcrError::Regex(_) => FcrErrorCode::Parsing,
            FcrError::Config(_) => FcrErrorCode::Validation,
        }
    }

    /// Human-readable message suitable for a `CommandResult::status` field.
    pub fn status_message(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, FcrError>;
