use thiserror::Error;

/// The single error taxonomy spanning the engine. User-visible operations
/// (connect / accept / read / write / close) as well as internal protocol
/// plumbing all report through this family.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("io error")]
    IoError,
    #[error("connection interrupted")]
    Interrupted,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("device or resource busy")]
    Busy,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no socket could be created")]
    NotSocket,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("message too long")]
    MessageTooLong,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("not connected")]
    NotConnected,
    #[error("protocol error")]
    ProtocolError,
    #[error("wrong protocol type")]
    WrongProtocolType,
    #[error("operation canceled")]
    OperationCanceled,
    #[error("address in use")]
    AddressInUse,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("bad address")]
    BadAddress,
    #[error("message size")]
    MessageSize,
    #[error("network down")]
    NetworkDown,
    #[error("no buffer space")]
    NoBufferSpace,
    #[error("out of range")]
    OutOfRange,
    #[error("buffer is full")]
    BufferFull,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            Interrupted => Error::Interrupted,
            AddrInUse => Error::AddressInUse,
            AddrNotAvailable => Error::AddressNotAvailable,
            BrokenPipe => Error::BrokenPipe,
            ConnectionAborted => Error::ConnectionAborted,
            ConnectionRefused => Error::ConnectionRefused,
            ConnectionReset => Error::ConnectionReset,
            InvalidInput => Error::InvalidArgument,
            NotConnected => Error::NotConnected,
            _ => Error::IoError,
        }
    }
}
