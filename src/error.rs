use std::fmt;

/// The two capability sets that failed to produce a non-empty intersection,
/// carried unchanged so the control path can render them into a bus `error` signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatMismatch {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
}

/// Errors surfaced to callers of the core object model and link data-plane.
///
/// Every fallible operation in the crate returns `Result<T, Error>`. The data
/// path (buffer relay) returns these directly to the sender and never logs;
/// the control path logs and converts them into a bus `error` message scoped
/// to the originating resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed request: null port, wrong direction, unknown id.
    InvalidArguments(&'static str),
    /// Client asked for a newer interface version than the global offers.
    VersionUnsupported { requested: u32, available: u32 },
    /// The access hook rejected the (client, target) pair.
    AccessDenied(String),
    /// A client-chosen local id collides with an existing resource.
    IdInUse(u32),
    /// A lookup (object, global, node, factory, port) missed.
    NotFound(&'static str),
    /// The negotiator found an empty intersection between two capability sets.
    IncompatibleFormats(FormatMismatch),
    /// The port is already linked and does not support fan-out.
    PortBusy,
    /// Buffer relay could not proceed synchronously.
    WouldBlock,
    /// The operation raced with destruction of one of its targets.
    Cancelled,
    /// The underlying node plugin refused the operation.
    PluginError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArguments(msg) => write!(f, "invalid arguments: {msg}"),
            Error::VersionUnsupported { requested, available } => write!(
                f,
                "requested version {requested} is not supported, global offers {available}"
            ),
            Error::AccessDenied(reason) => write!(f, "access denied: {reason}"),
            Error::IdInUse(id) => write!(f, "local id {id} is already bound"),
            Error::NotFound(what) => write!(f, "{what} not found"),
            Error::IncompatibleFormats(mismatch) => write!(
                f,
                "incompatible formats: {:?} does not intersect {:?}",
                mismatch.left, mismatch.right
            ),
            Error::PortBusy => write!(f, "port is already linked"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Cancelled => write!(f, "operation cancelled by concurrent destruction"),
            Error::PluginError(msg) => write!(f, "plugin error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
