//! Error types for the request engine and the socket plumbing built on it

use nix::errno::Errno;
use std::convert::TryFrom;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for request and transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A request failed with a mapped status code
    #[error("Request failed: {0}")]
    Status(NtStatus),

    /// The peer closed the stream in an orderly way
    #[error("End of file")]
    EndOfFile,

    /// Timeout occurred
    #[error("Operation timed out")]
    Timeout,

    /// Allocation or registration failure while building a request
    #[error("Out of memory")]
    NoMemory,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Buffer too small
    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// Not implemented
    #[error("Feature not implemented: {0}")]
    NotImplemented(String),
}

impl Error {
    /// The unified status code for this error
    pub fn status(&self) -> NtStatus {
        match self {
            Error::Io(err) => NtStatus::from_io_error(err),
            Error::Status(status) => *status,
            Error::EndOfFile => NtStatus::EndOfFile,
            Error::Timeout => NtStatus::IoTimeout,
            Error::NoMemory => NtStatus::NoMemory,
            Error::Protocol(_) => NtStatus::InvalidNetworkResponse,
            Error::InvalidParameter(_) => NtStatus::InvalidParameter,
            Error::InvalidState(_) => NtStatus::InternalError,
            Error::BufferTooSmall { .. } => NtStatus::BufferTooSmall,
            Error::NotImplemented(_) => NtStatus::NotSupported,
        }
    }

    /// Check whether the peer shut the connection down in an orderly way
    pub fn is_end_of_file(&self) -> bool {
        matches!(self, Error::EndOfFile)
    }

    /// Check whether this error is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<NtStatus> for Error {
    fn from(status: NtStatus) -> Self {
        match status {
            NtStatus::EndOfFile => Error::EndOfFile,
            other => Error::Status(other),
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Io(io::Error::from(errno))
    }
}

/// SMB protocol status codes (subset of NTSTATUS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NtStatus {
    /// The operation completed successfully
    Success = 0x00000000,
    /// Generic failure
    Unsuccessful = 0xC0000001,
    /// The specified handle is invalid
    InvalidHandle = 0xC0000008,
    /// The parameter is incorrect
    InvalidParameter = 0xC000000D,
    /// End of file reached
    EndOfFile = 0xC0000011,
    /// Not enough memory
    NoMemory = 0xC0000017,
    /// Access denied
    AccessDenied = 0xC0000022,
    /// The buffer is too small
    BufferTooSmall = 0xC0000023,
    /// The object name is not found
    ObjectNameNotFound = 0xC0000034,
    /// Cannot create a file that already exists
    ObjectNameCollision = 0xC0000035,
    /// Disk full
    DiskFull = 0xC000007F,
    /// Insufficient resources
    InsufficientResources = 0xC000009A,
    /// The request timed out
    IoTimeout = 0xC00000B5,
    /// The request is not supported
    NotSupported = 0xC00000BB,
    /// The network is busy
    NetworkBusy = 0xC00000BF,
    /// The peer sent something that does not parse
    InvalidNetworkResponse = 0xC00000C3,
    /// Internal error
    InternalError = 0xC00000E5,
    /// Unexpected I/O error
    UnexpectedIoError = 0xC00000E9,
    /// Too many open files
    TooManyOpenedFiles = 0xC000011F,
    /// Pipe broken
    PipeBroken = 0xC000014B,
    /// Address component is not valid
    InvalidAddressComponent = 0xC0000207,
    /// The connection was disconnected
    ConnectionDisconnected = 0xC000020C,
    /// The connection was reset by the peer
    ConnectionReset = 0xC000020D,
    /// The remote system refused the connection
    ConnectionRefused = 0xC0000236,
    /// The address is already in use
    AddressAlreadyAssociated = 0xC0000238,
    /// The network is not reachable
    NetworkUnreachable = 0xC000023C,
    /// The remote system is not reachable
    HostUnreachable = 0xC000023D,
    /// The connection was aborted locally
    ConnectionAborted = 0xC0000241,
}

impl TryFrom<u32> for NtStatus {
    type Error = ();

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00000000 => Ok(NtStatus::Success),
            0xC0000001 => Ok(NtStatus::Unsuccessful),
            0xC0000008 => Ok(NtStatus::InvalidHandle),
            0xC000000D => Ok(NtStatus::InvalidParameter),
            0xC0000011 => Ok(NtStatus::EndOfFile),
            0xC0000017 => Ok(NtStatus::NoMemory),
            0xC0000022 => Ok(NtStatus::AccessDenied),
            0xC0000023 => Ok(NtStatus::BufferTooSmall),
            0xC0000034 => Ok(NtStatus::ObjectNameNotFound),
            0xC0000035 => Ok(NtStatus::ObjectNameCollision),
            0xC000007F => Ok(NtStatus::DiskFull),
            0xC000009A => Ok(NtStatus::InsufficientResources),
            0xC00000B5 => Ok(NtStatus::IoTimeout),
            0xC00000BB => Ok(NtStatus::NotSupported),
            0xC00000BF => Ok(NtStatus::NetworkBusy),
            0xC00000C3 => Ok(NtStatus::InvalidNetworkResponse),
            0xC00000E5 => Ok(NtStatus::InternalError),
            0xC00000E9 => Ok(NtStatus::UnexpectedIoError),
            0xC000011F => Ok(NtStatus::TooManyOpenedFiles),
            0xC000014B => Ok(NtStatus::PipeBroken),
            0xC0000207 => Ok(NtStatus::InvalidAddressComponent),
            0xC000020C => Ok(NtStatus::ConnectionDisconnected),
            0xC000020D => Ok(NtStatus::ConnectionReset),
            0xC0000236 => Ok(NtStatus::ConnectionRefused),
            0xC0000238 => Ok(NtStatus::AddressAlreadyAssociated),
            0xC000023C => Ok(NtStatus::NetworkUnreachable),
            0xC000023D => Ok(NtStatus::HostUnreachable),
            0xC0000241 => Ok(NtStatus::ConnectionAborted),
            _ => Err(()),
        }
    }
}

impl NtStatus {
    /// Check if this is a success status
    pub fn is_success(self) -> bool {
        self == NtStatus::Success
    }

    /// Check if this is an error status
    pub fn is_error(self) -> bool {
        (self as u32) & 0xC0000000 == 0xC0000000
    }

    /// Create from a raw u32 value
    pub fn from_u32(value: u32) -> Self {
        value.try_into().unwrap_or(NtStatus::Unsuccessful)
    }

    /// Map a unix errno into the unified status space
    pub fn from_errno(errno: i32) -> Self {
        match Errno::from_i32(errno) {
            Errno::EPERM | Errno::EACCES => NtStatus::AccessDenied,
            Errno::ENOENT => NtStatus::ObjectNameNotFound,
            Errno::EIO => NtStatus::UnexpectedIoError,
            Errno::EBADF => NtStatus::InvalidHandle,
            Errno::EINVAL => NtStatus::InvalidParameter,
            Errno::EEXIST => NtStatus::ObjectNameCollision,
            Errno::ENFILE | Errno::EMFILE => NtStatus::TooManyOpenedFiles,
            Errno::ENOSPC => NtStatus::DiskFull,
            Errno::ENOMEM | Errno::ENOBUFS => NtStatus::NoMemory,
            Errno::EPIPE => NtStatus::PipeBroken,
            Errno::EAGAIN => NtStatus::NetworkBusy,
            Errno::ETIMEDOUT => NtStatus::IoTimeout,
            Errno::ECONNREFUSED => NtStatus::ConnectionRefused,
            Errno::ECONNRESET => NtStatus::ConnectionReset,
            Errno::ECONNABORTED => NtStatus::ConnectionAborted,
            Errno::ENOTCONN => NtStatus::ConnectionDisconnected,
            Errno::ENETUNREACH | Errno::ENETDOWN => NtStatus::NetworkUnreachable,
            Errno::EHOSTUNREACH | Errno::EHOSTDOWN => NtStatus::HostUnreachable,
            Errno::EADDRINUSE => NtStatus::AddressAlreadyAssociated,
            Errno::EADDRNOTAVAIL => NtStatus::InvalidAddressComponent,
            Errno::EAFNOSUPPORT | Errno::EPROTONOSUPPORT | Errno::EOPNOTSUPP => {
                NtStatus::NotSupported
            }
            _ => NtStatus::Unsuccessful,
        }
    }

    /// Map an I/O error, preferring the raw OS error when there is one
    pub fn from_io_error(err: &io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Self::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof => NtStatus::EndOfFile,
            io::ErrorKind::TimedOut => NtStatus::IoTimeout,
            io::ErrorKind::WouldBlock => NtStatus::NetworkBusy,
            io::ErrorKind::ConnectionRefused => NtStatus::ConnectionRefused,
            io::ErrorKind::ConnectionReset => NtStatus::ConnectionReset,
            io::ErrorKind::ConnectionAborted => NtStatus::ConnectionAborted,
            io::ErrorKind::NotConnected => NtStatus::ConnectionDisconnected,
            io::ErrorKind::BrokenPipe => NtStatus::PipeBroken,
            io::ErrorKind::PermissionDenied => NtStatus::AccessDenied,
            io::ErrorKind::InvalidInput => NtStatus::InvalidParameter,
            io::ErrorKind::OutOfMemory => NtStatus::NoMemory,
            io::ErrorKind::Unsupported => NtStatus::NotSupported,
            _ => NtStatus::Unsuccessful,
        }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NtStatus::Success => "Success",
            NtStatus::Unsuccessful => "Unsuccessful",
            NtStatus::InvalidHandle => "Invalid handle",
            NtStatus::InvalidParameter => "Invalid parameter",
            NtStatus::EndOfFile => "End of file",
            NtStatus::NoMemory => "No memory",
            NtStatus::AccessDenied => "Access denied",
            NtStatus::BufferTooSmall => "Buffer too small",
            NtStatus::ObjectNameNotFound => "Object name not found",
            NtStatus::ObjectNameCollision => "Object name collision",
            NtStatus::DiskFull => "Disk full",
            NtStatus::InsufficientResources => "Insufficient resources",
            NtStatus::IoTimeout => "I/O timeout",
            NtStatus::NotSupported => "Not supported",
            NtStatus::NetworkBusy => "Network busy",
            NtStatus::InvalidNetworkResponse => "Invalid network response",
            NtStatus::InternalError => "Internal error",
            NtStatus::UnexpectedIoError => "Unexpected I/O error",
            NtStatus::TooManyOpenedFiles => "Too many opened files",
            NtStatus::PipeBroken => "Pipe broken",
            NtStatus::InvalidAddressComponent => "Invalid address component",
            NtStatus::ConnectionDisconnected => "Connection disconnected",
            NtStatus::ConnectionReset => "Connection reset",
            NtStatus::ConnectionRefused => "Connection refused",
            NtStatus::AddressAlreadyAssociated => "Address already associated",
            NtStatus::NetworkUnreachable => "Network unreachable",
            NtStatus::HostUnreachable => "Host unreachable",
            NtStatus::ConnectionAborted => "Connection aborted",
        };
        write!(f, "{} (0x{:08X})", msg, *self as u32)
    }
}
