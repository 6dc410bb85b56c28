use std::fmt;
use std::io;
use std::net;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level error surface used throughout the runtime. `Wait` means the
/// operation cannot make progress yet and should be retried on the next
/// readiness cycle; `Fatal` errors terminate the connection they occurred on.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Kernel-reported I/O failure on read/write/accept/connect.
    Socket(io::ErrorKind),
    /// Malformed protocol input. The payload names the violated rule.
    Parse(&'static str),
    /// Buffer growth refused by the configured ceiling.
    Resource(&'static str),
    /// API misuse; refused with a diagnostic, never surfaced as an event.
    Usage(&'static str),
    AddrParse,
    Tls(&'static str),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Socket(kind) => write!(f, "socket error: {:?}", kind),
            ErrorKind::Parse(what) => write!(f, "parse error: {}", what),
            ErrorKind::Resource(what) => write!(f, "resource error: {}", what),
            ErrorKind::Usage(what) => write!(f, "usage error: {}", what),
            ErrorKind::AddrParse => write!(f, "malformed address"),
            ErrorKind::Tls(what) => write!(f, "tls error: {}", what),
        }
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetError::Wait,
            kind => NetError::Fatal(ErrorKind::Socket(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::Fatal(ErrorKind::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}
