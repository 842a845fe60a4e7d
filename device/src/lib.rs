//! Remote tape access over NDMPv4.
//!
//! The pieces here layer as follows: `connection` owns the control
//! connection (request/reply transactions and the notification inbox),
//! `tape` wraps a remote tape drive in the [`TapeDevice`] contract, and
//! `directtcp` runs bulk data transfers through the remote mover.  All
//! of it is synchronous; callers that want concurrency put each device
//! on its own thread.

use std::sync::Arc;

use ndmp_common::{DeviceStatus, NdmpError};
use ndmp_common::header::TapeHeader;

pub mod config;
pub mod connection;
pub mod directtcp;
pub mod tape;

#[cfg(test)]
mod sim_server_tests;

pub use config::{AuthMethod, TapeOptions};
pub use connection::{
    AbortHandle, NdmpConnection, NdmpPool, Notification, WaitSet,
};
pub use directtcp::DirectTcpConnection;
pub use tape::NdmpTapeDevice;

/// Fixed device block size.  NDMP tape agents generally refuse mover
/// record sizes below this, and the transfer window math assumes reads
/// and writes are in whole blocks.
pub const DEFAULT_BLOCK_SIZE: u32 = 32768;
pub const MIN_BLOCK_SIZE: u32 = 32768;
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// What a device session is currently doing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessMode {
    Null,
    Read,
    Write,
    Append,
}

/// Outcome of a robust (LEOM-aware) write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RobustWriteResult {
    /// Block is on the media.
    Ok,
    /// Block is on the media, and the drive signalled logical
    /// end-of-media while taking it.
    OkLeom,
    /// Block did not fit; the volume is full.
    NoSpace,
}

/// Static properties a device advertises to the layer above it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceCapabilities {
    pub block_size: u32,
    /// Exactly one accessor at a time; no shared concurrent sessions.
    pub exclusive: bool,
    /// The device performs best when fed continuously.
    pub streaming_desired: bool,
    pub appendable: bool,
    /// The device reports logical end-of-media before hard end-of-media.
    pub leom: bool,
}

/// The contract a tape-shaped device presents to the archive layer.
///
/// Logical media conditions (end-of-media, end-of-file) are reported
/// through [`is_eom`](Self::is_eom)/[`is_eof`](Self::is_eof) flags and
/// `Ok` returns, never as errors; `Err` means the operation itself
/// failed.
pub trait TapeDevice {
    /// Read and parse the volume header.  `SUCCESS` means a labeled
    /// volume whose label/time are now available; `VOLUME_UNLABELED`
    /// is a provably blank volume, not a failure.
    fn read_label(&mut self) -> DeviceStatus;

    fn start(
        &mut self,
        mode: AccessMode,
        label: &str,
        timestamp: &str,
    ) -> Result<(), NdmpError>;

    fn start_file(&mut self, name: &str) -> Result<(), NdmpError>;
    fn write_block(&mut self, data: &[u8]) -> Result<(), NdmpError>;
    fn finish_file(&mut self) -> Result<(), NdmpError>;

    /// Position to the start of the numbered file and return its header,
    /// or `None` past the end of recorded data.
    fn seek_file(
        &mut self,
        file: u32,
    ) -> Result<Option<TapeHeader>, NdmpError>;

    fn seek_block(&mut self, block: u64) -> Result<(), NdmpError>;

    /// Read one block.  `Ok(None)` is end-of-file (and sets
    /// [`is_eof`](Self::is_eof)).
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, NdmpError>;

    fn finish(&mut self) -> Result<(), NdmpError>;
    fn eject(&mut self) -> Result<(), NdmpError>;

    fn status(&self) -> DeviceStatus;
    fn capabilities(&self) -> DeviceCapabilities;
    fn access_mode(&self) -> AccessMode;
    fn volume_label(&self) -> Option<&str>;
    fn volume_time(&self) -> Option<&str>;
    fn file_num(&self) -> u32;
    fn block_num(&self) -> u64;
    /// Payload bytes read since the last `start_file`/`seek_file`.
    fn bytes_read(&self) -> u64;
    /// Bytes committed to media since the last `start_file`/`seek_file`,
    /// counting each block at the full device block size.
    fn bytes_written(&self) -> u64;
    fn is_eof(&self) -> bool;
    fn is_eom(&self) -> bool;
}

type DeviceConstructor = fn(
    &Arc<NdmpPool>,
    &str,
    &TapeOptions,
) -> Result<Box<dyn TapeDevice>, NdmpError>;

/// Maps a device-name scheme prefix to a constructor.  An explicit
/// object rather than a process global, so embedders control what gets
/// registered and with which pool.
pub struct DeviceRegistry {
    entries: Vec<(&'static str, DeviceConstructor)>,
}

impl DeviceRegistry {
    /// Registry with the built-in `ndmp:` scheme.
    pub fn new() -> DeviceRegistry {
        let mut reg = DeviceRegistry { entries: Vec::new() };
        reg.register("ndmp", |pool, rest, options| {
            Ok(Box::new(NdmpTapeDevice::open(pool, rest, options)?))
        });
        reg
    }

    pub fn register(
        &mut self,
        scheme: &'static str,
        ctor: DeviceConstructor,
    ) {
        self.entries.push((scheme, ctor));
    }

    /// Open `scheme:rest` against the given pool.
    pub fn open(
        &self,
        pool: &Arc<NdmpPool>,
        name: &str,
        options: &TapeOptions,
    ) -> Result<Box<dyn TapeDevice>, NdmpError> {
        let (scheme, rest) = name.split_once(':').ok_or_else(|| {
            NdmpError::Config(format!("device name '{name}' has no scheme"))
        })?;
        for (entry, ctor) in &self.entries {
            if *entry == scheme {
                return ctor(pool, rest, options);
            }
        }
        Err(NdmpError::Config(format!("unknown device scheme '{scheme}'")))
    }
}

impl Default for DeviceRegistry {
    fn default() -> DeviceRegistry {
        DeviceRegistry::new()
    }
}

/// Build a `Logger` suitable for tests.
#[cfg(test)]
pub(crate) fn csl() -> slog::Logger {
    use slog::{o, Drain};

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    slog::Logger::root(slog_term::FullFormat::new(plain).build().fuse(), o!())
}
