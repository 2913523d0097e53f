use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::DriverState;

/// Setup steps performed by `init`, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStep {
    CreateSocket,
    ResolveInterface,
    InstallErrorFilter,
    Bind,
    AssignIo,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupStep::CreateSocket => write!(f, "socket creation"),
            SetupStep::ResolveInterface => write!(f, "interface lookup"),
            SetupStep::InstallErrorFilter => write!(f, "error filter installation"),
            SetupStep::Bind => write!(f, "bind"),
            SetupStep::AssignIo => write!(f, "async I/O registration"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    // Configuration errors, reported without touching the socket
    #[error("driver is not closed (state: {0:?})")]
    NotClosed(DriverState),
    #[error("bitrate {0} cannot be configured, set it on the interface and pass 0")]
    UnsupportedBitrate(u32),
    #[error("invalid interface name {0:?}")]
    InvalidDevice(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    // Setup errors
    #[error("{step} failed: {source}")]
    Setup {
        step: SetupStep,
        #[source]
        source: io::Error,
    },

    // Operational errors
    #[error("driver is not open")]
    NotOpen,
    #[error("data length code {dlc} exceeds 8")]
    InvalidFrame { dlc: u8 },
    #[error("send lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("read aborted by socket teardown")]
    Aborted,
}

impl DriverError {
    /// OS error code recorded on the transport for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            DriverError::Setup { source, .. } => ErrorCode::from(source),
            DriverError::Write(e) | DriverError::Read(e) => ErrorCode::from(e),
            DriverError::NotClosed(_) => ErrorCode::from_errno(libc::EALREADY),
            DriverError::UnsupportedBitrate(_) => ErrorCode::from_errno(libc::EOPNOTSUPP),
            DriverError::InvalidDevice(_) | DriverError::Config(_) => {
                ErrorCode::from_errno(libc::EINVAL)
            }
            DriverError::InvalidFrame { .. } => ErrorCode::from_errno(libc::EINVAL),
            DriverError::NotOpen => ErrorCode::from_errno(libc::ENOTCONN),
            DriverError::LockTimeout(_) => ErrorCode::from_errno(libc::ETIMEDOUT),
            DriverError::ShortWrite { .. } => ErrorCode::from_errno(libc::EIO),
            DriverError::Aborted => ErrorCode::from_errno(libc::ECANCELED),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Host error number attached to the transport state. Zero means no error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ErrorCode(i32);

impl ErrorCode {
    pub const NONE: ErrorCode = ErrorCode(0);

    pub const fn from_errno(errno: i32) -> Self {
        Self(errno)
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    pub fn is_err(&self) -> bool {
        self.0 != 0
    }

    /// Human readable message as reported by the OS.
    pub fn message(&self) -> String {
        if self.is_err() {
            io::Error::from_raw_os_error(self.0).to_string()
        } else {
            "success".to_string()
        }
    }
}

impl From<&io::Error> for ErrorCode {
    fn from(err: &io::Error) -> Self {
        Self(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.0)
    }
}
