use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use slog::{o, Drain, Logger};

pub mod header;

pub use header::{TapeHeader, TapeHeaderKind};

/// NDMP v4 wire status codes, as carried in message headers and reply
/// bodies.  The numeric values are fixed by the protocol.
#[repr(u32)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    TryFromPrimitive,
    strum_macros::Display,
)]
pub enum NdmpStatus {
    NoErr = 0,
    NotSupportedErr = 1,
    DeviceBusyErr = 2,
    DeviceOpenedErr = 3,
    NotAuthorizedErr = 4,
    PermissionErr = 5,
    DevNotOpenErr = 6,
    IoErr = 7,
    TimeoutErr = 8,
    IllegalArgsErr = 9,
    NoTapeLoadedErr = 10,
    WriteProtectErr = 11,
    EofErr = 12,
    EomErr = 13,
    FileNotFoundErr = 14,
    BadFileErr = 15,
    NoDeviceErr = 16,
    NoBusErr = 17,
    XdrDecodeErr = 18,
    IllegalStateErr = 19,
    UndefinedErr = 20,
    XdrEncodeErr = 21,
    NoMemErr = 22,
    ConnectErr = 23,
    SequenceNumErr = 24,
    ReadInProgressErr = 25,
    PreconditionErr = 26,
    ClassNotSupportedErr = 27,
    VersionNotSupportedErr = 28,
    ExtDuplClassesErr = 29,
    ExtDnIllegalErr = 30,
}

impl NdmpStatus {
    /// Decode a wire value, mapping anything out of range to
    /// `UndefinedErr` rather than failing the whole message.
    pub fn from_wire(v: u32) -> NdmpStatus {
        NdmpStatus::try_from(v).unwrap_or(NdmpStatus::UndefinedErr)
    }
}

/// The error type for every fallible operation in this workspace.
///
/// The variants follow the failure taxonomy of the device layer: startup
/// errors poison a connection permanently, transport errors tear it down,
/// server errors carry the NDMP status code from a well-formed reply, and
/// invariant errors indicate a server/protocol incompatibility that is
/// never retried.
#[derive(Debug, thiserror::Error)]
pub enum NdmpError {
    #[error("{0}")]
    Startup(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("error from NDMP server: {message}")]
    Server { code: NdmpStatus, message: String },

    #[error("protocol error: {0}")]
    Invariant(String),

    #[error("operation aborted")]
    Aborted,

    #[error("configuration error: {0}")]
    Config(String),
}

impl NdmpError {
    pub fn server(code: NdmpStatus) -> NdmpError {
        NdmpError::Server {
            code,
            message: code.to_string(),
        }
    }

    /// The NDMP status carried by this error, if it came from the server.
    pub fn code(&self) -> Option<NdmpStatus> {
        match self {
            NdmpError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NdmpError {
    fn from(e: std::io::Error) -> NdmpError {
        NdmpError::Transport(e.to_string())
    }
}

bitflags! {
    /// Status-flag bitmask reported to the embedding application.  The
    /// facade maps protocol errors onto these; raw NDMP codes never
    /// escape the device layer.  An empty set means success.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DeviceStatus: u32 {
        const DEVICE_ERROR     = 1 << 0;
        const DEVICE_BUSY      = 1 << 1;
        const VOLUME_MISSING   = 1 << 2;
        const VOLUME_UNLABELED = 1 << 3;
        const VOLUME_ERROR     = 1 << 4;
    }
}

impl DeviceStatus {
    pub const SUCCESS: DeviceStatus = DeviceStatus::empty();

    pub fn is_success(&self) -> bool {
        self.is_empty()
    }
}

/// Build a terminal logger in the usual drain stack.  Embedders that
/// already carry a `Logger` should pass their own instead.
pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
