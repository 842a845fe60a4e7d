//! The remote tape drive, presented through the [`TapeDevice`] contract.
//!
//! A device is named `host[:port]@devicepath`; the control connection
//! and the remote tape-agent open both happen lazily, on the first
//! operation that needs them.  Media conditions come back as
//! `DeviceStatus` flags; wire-level failures come back as `NdmpError`s
//! and also fold into the status word.

use std::sync::{Arc, Mutex};

use slog::{o, warn, Logger};

use ndmp_common::header::{TapeHeader, TapeHeaderKind};
use ndmp_common::{DeviceStatus, NdmpError, NdmpStatus};
use ndmp_protocol::{TapeMtioOp, TapeOpenMode};

use crate::config::TapeOptions;
use crate::connection::{NdmpConnection, NdmpPool};
use crate::directtcp::PendingListen;
use crate::{
    AccessMode, DeviceCapabilities, RobustWriteResult, TapeDevice,
    DEFAULT_BLOCK_SIZE,
};

/// Parsed form of `host[:port]@devicepath`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DeviceName {
    pub hostname: String,
    pub port: u16,
    pub path: String,
}

impl DeviceName {
    fn parse(name: &str) -> Result<DeviceName, NdmpError> {
        let (host_part, path) = name.split_once('@').ok_or_else(|| {
            NdmpError::Config(format!(
                "invalid device name '{name}': no '@'"
            ))
        })?;
        if path.is_empty() {
            return Err(NdmpError::Config(format!(
                "invalid device name '{name}': empty device path"
            )));
        }
        let (hostname, port) = match host_part.split_once(':') {
            Some((h, p)) => {
                let port: u16 = p.parse().map_err(|_| {
                    NdmpError::Config(format!(
                        "invalid device name '{name}': bad port '{p}'"
                    ))
                })?;
                (h, port)
            }
            None => (host_part, 0),
        };
        if hostname.is_empty() {
            return Err(NdmpError::Config(format!(
                "invalid device name '{name}': empty hostname"
            )));
        }
        Ok(DeviceName {
            hostname: hostname.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

pub struct NdmpTapeDevice {
    pool: Arc<NdmpPool>,
    pub(crate) log: Logger,
    name: DeviceName,
    pub(crate) options: TapeOptions,

    conn: Option<Arc<Mutex<NdmpConnection>>>,
    tape_agent_open: bool,

    pub(crate) block_size: u32,
    read_block_size: u32,

    access_mode: AccessMode,
    status: DeviceStatus,
    volume_label: Option<String>,
    volume_time: Option<String>,
    file_num: u32,
    block_num: u64,
    bytes_read: u64,
    bytes_written: u64,
    is_eof: bool,
    is_eom: bool,

    pub(crate) pending_listen: Option<PendingListen>,
}

impl NdmpTapeDevice {
    pub fn open(
        pool: &Arc<NdmpPool>,
        name: &str,
        options: &TapeOptions,
    ) -> Result<NdmpTapeDevice, NdmpError> {
        options.validate()?;
        let name = DeviceName::parse(name)?;
        let log = pool.logger().new(o!(
            "device" => format!("{}@{}", name.hostname, name.path),
        ));
        let block_size = DEFAULT_BLOCK_SIZE;
        let read_block_size = if options.read_block_size != 0 {
            options.read_block_size
        } else {
            block_size
        };
        Ok(NdmpTapeDevice {
            pool: Arc::clone(pool),
            log,
            name,
            options: options.clone(),
            conn: None,
            tape_agent_open: false,
            block_size,
            read_block_size,
            access_mode: AccessMode::Null,
            status: DeviceStatus::SUCCESS,
            volume_label: None,
            volume_time: None,
            file_num: 0,
            block_num: 0,
            bytes_read: 0,
            bytes_written: 0,
            is_eof: false,
            is_eom: false,
            pending_listen: None,
        })
    }

    /// The control connection, established on first use.  A failed
    /// establishment still yields a connection object; its recorded
    /// startup error surfaces from the first transaction.
    pub(crate) fn conn(&mut self) -> Arc<Mutex<NdmpConnection>> {
        if self.conn.is_none() {
            let conn = NdmpConnection::connect(
                &self.pool,
                &self.name.hostname,
                self.name.port,
                &self.options,
            );
            self.conn = Some(Arc::new(Mutex::new(conn)));
        }
        Arc::clone(self.conn.as_ref().unwrap_or_else(|| unreachable!()))
    }

    /// Open the remote tape agent if it isn't already.  RAW mode, so
    /// this succeeds with no medium loaded; the block-size cross-check
    /// flags a mismatch without failing the open.
    fn ensure_tape_agent(&mut self) -> Result<(), NdmpError> {
        if self.tape_agent_open {
            return Ok(());
        }
        let conn = self.conn();
        let mut c = conn.lock().unwrap();
        c.tape_open(&self.name.path, TapeOpenMode::Raw)
            .map_err(|e| self.fail(e))?;
        self.tape_agent_open = true;
        match c.tape_get_state() {
            Ok(state) => {
                if let Some(bs) = state.block_size() {
                    if bs != 0 && bs != self.block_size {
                        warn!(
                            self.log,
                            "remote drive uses fixed block size {bs}, \
                             expected {}",
                            self.block_size
                        );
                        self.status |= DeviceStatus::DEVICE_ERROR;
                    }
                }
            }
            Err(e) => {
                warn!(self.log, "tape_get_state after open failed: {e}");
            }
        }
        Ok(())
    }

    /// Record the status-flag view of an error before propagating it.
    pub(crate) fn fail(&mut self, e: NdmpError) -> NdmpError {
        self.status |= match e.code() {
            Some(NdmpStatus::DeviceBusyErr) => DeviceStatus::DEVICE_BUSY,
            Some(NdmpStatus::NoTapeLoadedErr) => DeviceStatus::VOLUME_MISSING,
            Some(NdmpStatus::IoErr) | Some(NdmpStatus::WriteProtectErr) => {
                DeviceStatus::DEVICE_ERROR | DeviceStatus::VOLUME_ERROR
            }
            Some(_) => DeviceStatus::DEVICE_ERROR,
            None => DeviceStatus::DEVICE_ERROR,
        };
        e
    }

    fn rewind(&mut self) -> Result<(), NdmpError> {
        let conn = self.conn();
        let mut c = conn.lock().unwrap();
        c.tape_mtio(TapeMtioOp::Rew, 1).map_err(|e| self.fail(e))?;
        Ok(())
    }

    fn write_filemark(&mut self) -> Result<(), NdmpError> {
        let conn = self.conn();
        let mut c = conn.lock().unwrap();
        c.tape_mtio(TapeMtioOp::Eof, 1).map_err(|e| self.fail(e))?;
        Ok(())
    }

    /// One write attempt, with logical-EOM awareness.  A server IO_ERR
    /// means the volume is full with no early warning; EOM_ERR is the
    /// early warning itself, and the write that hit it is retried
    /// exactly once.
    fn robust_write(
        &mut self,
        data: &[u8],
    ) -> Result<RobustWriteResult, NdmpError> {
        let conn = self.conn();
        let mut c = conn.lock().unwrap();
        match c.tape_write(data) {
            Ok(_) => Ok(RobustWriteResult::Ok),
            Err(e) if e.code() == Some(NdmpStatus::IoErr) => {
                Ok(RobustWriteResult::NoSpace)
            }
            Err(e) if e.code() == Some(NdmpStatus::EomErr) => {
                match c.tape_write(data) {
                    Ok(_) => Ok(RobustWriteResult::OkLeom),
                    Err(e) if e.code() == Some(NdmpStatus::IoErr) => {
                        Ok(RobustWriteResult::NoSpace)
                    }
                    Err(e) => Err(self.fail(e)),
                }
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Write a header block via robust write, tracking LEOM.  NoSpace is
    /// an error for headers; there is no partial volume or partial file.
    fn write_header(&mut self, header: &TapeHeader) -> Result<(), NdmpError> {
        let block = header
            .to_block(self.block_size as usize)
            .map_err(|e| NdmpError::Invariant(e.to_string()))?;
        match self.robust_write(&block)? {
            RobustWriteResult::Ok => {}
            RobustWriteResult::OkLeom => self.is_eom = true,
            RobustWriteResult::NoSpace => {
                self.status |= DeviceStatus::VOLUME_ERROR;
                return Err(self.fail(NdmpError::server(NdmpStatus::EomErr)));
            }
        }
        Ok(())
    }

    fn read_label_inner(&mut self) -> Result<DeviceStatus, NdmpError> {
        self.ensure_tape_agent()?;

        let conn = self.conn();
        if let Err(e) = {
            let mut c = conn.lock().unwrap();
            c.tape_mtio(TapeMtioOp::Rew, 1)
        } {
            return match e.code() {
                Some(NdmpStatus::NoTapeLoadedErr) => {
                    Ok(DeviceStatus::VOLUME_MISSING)
                }
                _ => Err(self.fail(e)),
            };
        }

        let read = {
            let mut c = conn.lock().unwrap();
            c.tape_read(self.read_block_size)
        };
        let block = match read {
            Ok(block) => block,
            Err(e) => {
                return match e.code() {
                    // a provably empty volume, not a failure
                    Some(NdmpStatus::EofErr) => {
                        Ok(DeviceStatus::VOLUME_UNLABELED)
                    }
                    Some(NdmpStatus::NoTapeLoadedErr) => {
                        Ok(DeviceStatus::VOLUME_MISSING)
                    }
                    _ => Err(self.fail(e)),
                };
            }
        };

        let header = TapeHeader::parse(&block);
        if header.kind != TapeHeaderKind::TapeStart {
            return Ok(DeviceStatus::VOLUME_UNLABELED);
        }
        self.volume_label = Some(header.label);
        self.volume_time = Some(header.datestamp);
        Ok(DeviceStatus::SUCCESS)
    }
}

impl TapeDevice for NdmpTapeDevice {
    fn read_label(&mut self) -> DeviceStatus {
        self.volume_label = None;
        self.volume_time = None;
        let status = match self.read_label_inner() {
            Ok(status) => status,
            Err(e) => {
                warn!(self.log, "read_label failed: {e}");
                DeviceStatus::DEVICE_ERROR
            }
        };
        // re-reading the label settles the volume bits only; device-level
        // trouble recorded earlier stays
        self.status -= DeviceStatus::VOLUME_MISSING
            | DeviceStatus::VOLUME_UNLABELED
            | DeviceStatus::VOLUME_ERROR;
        self.status |= status;
        self.status
    }

    fn start(
        &mut self,
        mode: AccessMode,
        label: &str,
        timestamp: &str,
    ) -> Result<(), NdmpError> {
        self.ensure_tape_agent()?;
        self.is_eof = false;
        self.is_eom = false;
        self.file_num = 0;
        self.block_num = 0;
        self.bytes_read = 0;
        self.bytes_written = 0;

        match mode {
            AccessMode::Append => {
                self.status |= DeviceStatus::DEVICE_ERROR;
                return Err(NdmpError::Config(
                    "append mode is not supported".to_string(),
                ));
            }
            AccessMode::Write => {
                self.rewind()?;
                let header = TapeHeader::tapestart(label, timestamp);
                self.write_header(&header)?;
                self.write_filemark()?;
                self.volume_label = Some(label.to_string());
                self.volume_time = Some(timestamp.to_string());
            }
            AccessMode::Read => {
                if self.volume_label.is_none() {
                    let status = self.read_label();
                    if !status.is_success() {
                        return Err(NdmpError::Config(format!(
                            "cannot start reading an unlabeled or \
                             unreadable volume ({status:?})"
                        )));
                    }
                }
            }
            AccessMode::Null => {}
        }
        self.access_mode = mode;
        Ok(())
    }

    fn start_file(&mut self, name: &str) -> Result<(), NdmpError> {
        if self.access_mode != AccessMode::Write {
            return Err(NdmpError::Invariant(
                "start_file outside write mode".to_string(),
            ));
        }
        let timestamp = self.volume_time.clone().unwrap_or_default();
        let header = TapeHeader::file(name, &timestamp);
        self.write_header(&header)?;
        self.file_num += 1;
        self.block_num = 0;
        self.bytes_read = 0;
        self.bytes_written = 0;
        Ok(())
    }

    fn write_block(&mut self, data: &[u8]) -> Result<(), NdmpError> {
        if self.access_mode != AccessMode::Write {
            return Err(NdmpError::Invariant(
                "write_block outside write mode".to_string(),
            ));
        }
        let block_size = self.block_size as usize;
        if data.len() > block_size {
            return Err(NdmpError::Invariant(format!(
                "write_block of {} bytes exceeds the {} byte block size",
                data.len(),
                block_size
            )));
        }
        let result = if data.len() < block_size {
            // short final block, zero-padded to the device block size
            let mut padded = vec![0u8; block_size];
            padded[..data.len()].copy_from_slice(data);
            self.robust_write(&padded)?
        } else {
            self.robust_write(data)?
        };
        match result {
            RobustWriteResult::Ok => {}
            RobustWriteResult::OkLeom => self.is_eom = true,
            RobustWriteResult::NoSpace => {
                self.status |= DeviceStatus::VOLUME_ERROR;
                return Err(self.fail(NdmpError::server(NdmpStatus::EomErr)));
            }
        }
        self.block_num += 1;
        // a padded block still occupies a full block on media
        self.bytes_written += block_size as u64;
        Ok(())
    }

    fn finish_file(&mut self) -> Result<(), NdmpError> {
        if self.access_mode != AccessMode::Write {
            return Err(NdmpError::Invariant(
                "finish_file outside write mode".to_string(),
            ));
        }
        self.write_filemark()?;
        // fold the drive's view of the ending position into ours
        let conn = self.conn();
        let state = {
            let mut c = conn.lock().unwrap();
            c.tape_get_state()
        };
        match state {
            Ok(state) => {
                if let Some(file_num) = state.file_num() {
                    self.file_num = file_num;
                }
                if let Some(blockno) = state.blockno() {
                    self.block_num = blockno as u64;
                }
            }
            Err(e) => {
                warn!(self.log, "tape_get_state after filemark failed: {e}");
            }
        }
        Ok(())
    }

    fn seek_file(
        &mut self,
        file: u32,
    ) -> Result<Option<TapeHeader>, NdmpError> {
        self.ensure_tape_agent()?;
        self.is_eof = false;

        let conn = self.conn();
        let delta = file as i64 - self.file_num as i64;
        let resid = {
            let mut c = conn.lock().unwrap();
            if delta <= 0 {
                // we may be mid-file, so back over the target's filemark
                // and step forward again
                let r = c.tape_mtio(TapeMtioOp::Bsf, (-delta + 1) as u32);
                match r {
                    Ok(0) => c.tape_mtio(TapeMtioOp::Fsf, 1),
                    other => other,
                }
            } else {
                c.tape_mtio(TapeMtioOp::Fsf, delta as u32)
            }
        };
        match resid {
            Ok(0) => {}
            Ok(_) => {
                self.status |= DeviceStatus::VOLUME_ERROR;
                return Err(NdmpError::Invariant(format!(
                    "seek to file {file} came up short"
                )));
            }
            Err(e) => return Err(self.fail(e)),
        }
        self.file_num = file;
        self.block_num = 0;
        self.bytes_read = 0;
        self.bytes_written = 0;

        let read = {
            let mut c = conn.lock().unwrap();
            c.tape_read(self.read_block_size)
        };
        match read {
            Ok(block) => Ok(Some(TapeHeader::parse(&block))),
            // end of recorded data at this spot
            Err(e) if e.code() == Some(NdmpStatus::EofErr) => {
                Ok(Some(TapeHeader::tapeend("")))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn seek_block(&mut self, _block: u64) -> Result<(), NdmpError> {
        // the remote tape interface has no absolute block positioning
        self.status |= DeviceStatus::DEVICE_ERROR;
        Err(NdmpError::Config(
            "seek_block is not supported on NDMP devices".to_string(),
        ))
    }

    fn read_block(&mut self) -> Result<Option<Vec<u8>>, NdmpError> {
        self.ensure_tape_agent()?;
        let conn = self.conn();
        let read = {
            let mut c = conn.lock().unwrap();
            c.tape_read(self.read_block_size)
        };
        match read {
            Ok(block) => {
                self.block_num += 1;
                self.bytes_read += block.len() as u64;
                Ok(Some(block))
            }
            Err(e) if e.code() == Some(NdmpStatus::EofErr) => {
                self.is_eof = true;
                Ok(None)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn finish(&mut self) -> Result<(), NdmpError> {
        self.access_mode = AccessMode::Null;
        if !self.tape_agent_open {
            return Ok(());
        }
        self.tape_agent_open = false;
        let conn = self.conn();
        let res = {
            let mut c = conn.lock().unwrap();
            c.tape_close()
        };
        res.map_err(|e| self.fail(e))
    }

    fn eject(&mut self) -> Result<(), NdmpError> {
        self.ensure_tape_agent()?;
        let conn = self.conn();
        let res = {
            let mut c = conn.lock().unwrap();
            c.tape_mtio(TapeMtioOp::Off, 1).map(|_| ())
        };
        res.map_err(|e| self.fail(e))?;
        self.tape_agent_open = false;
        Ok(())
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            block_size: self.block_size,
            exclusive: true,
            streaming_desired: true,
            appendable: false,
            leom: true,
        }
    }

    fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    fn volume_label(&self) -> Option<&str> {
        self.volume_label.as_deref()
    }

    fn volume_time(&self) -> Option<&str> {
        self.volume_time.as_deref()
    }

    fn file_num(&self) -> u32 {
        self.file_num
    }

    fn block_num(&self) -> u64 {
        self.block_num
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn is_eof(&self) -> bool {
        self.is_eof
    }

    fn is_eom(&self) -> bool {
        self.is_eom
    }
}
