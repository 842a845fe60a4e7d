//! The NDMP control connection: one synchronous request/reply transaction
//! channel plus the inbox for the server's unprompted notifications.
//!
//! All wire exchanges on all connections serialize on a single pool-wide
//! mutex.  That is deliberately coarser than per-connection locking: the
//! transaction state is small, exchanges are short, and it keeps the
//! notification path and the reply path on one connection from ever
//! interleaving.

use std::fs::File;
use std::io::Write as _;
use std::net::TcpStream;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use bytes::BytesMut;
use slog::{debug, o, warn, Logger};

use ndmp_common::{NdmpError, NdmpStatus};
use ndmp_protocol::{
    auth::md5_digest, encode_message, read_frame, write_frame, AddrType,
    AuthAttrReply, AuthData, Body, ConfigGetAuthAttrRequest,
    ConnectClientAuthRequest, ConnectOpenRequest, ConnectionStatusReason,
    DataHaltReason, GenericReply, LogMessagePost, MessageCode, MessageHeader,
    MessageType, MoverGetStateReply, MoverHaltReason, MoverListenReply,
    MoverListenRequest, MoverMode, MoverPauseReason, MoverReadRequest,
    MoverConnectRequest, MoverSetRecordSizeRequest, MoverSetWindowRequest,
    NotifyConnectionStatusPost, NotifyDataHaltedPost, NotifyMoverHaltedPost,
    NotifyMoverPausedPost, Reply, ScsiExecuteCdbReply, ScsiExecuteCdbRequest,
    ScsiOpenRequest, TapeGetStateReply, TapeMtioOp, TapeMtioReply,
    TapeMtioRequest, TapeOpenMode, TapeOpenRequest, TapeReadReply,
    TapeReadRequest, TapeWriteReply, TapeWriteRequest, TcpAddr,
    AuthType, NDMP4_VERSION, NDMP_DEFAULT_PORT,
};

use crate::config::{AuthMethod, TapeOptions};

/// Shared state for every connection in the process: the transaction
/// mutex, the connection-id counter, and the root logger.  Explicitly
/// owned rather than module-global; construct one per embedding
/// application.
pub struct NdmpPool {
    log: Logger,
    xfer_lock: Mutex<()>,
    next_connid: AtomicU32,
}

impl NdmpPool {
    pub fn new(log: Logger) -> Arc<NdmpPool> {
        Arc::new(NdmpPool {
            log,
            xfer_lock: Mutex::new(()),
            next_connid: AtomicU32::new(1),
        })
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    fn next_connid(&self) -> u32 {
        self.next_connid.fetch_add(1, Ordering::Relaxed)
    }
}

bitflags! {
    /// Which notification slots a waiter is interested in.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct WaitSet: u32 {
        const DATA_HALT   = 1 << 0;
        const MOVER_HALT  = 1 << 1;
        const MOVER_PAUSE = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Notification {
    DataHalted(DataHaltReason),
    MoverHalted(MoverHaltReason),
    MoverPaused {
        reason: MoverPauseReason,
        seek_position: u64,
    },
}

/// At most one pending instance of each asynchronous signal.  A slot is
/// set only by unsolicited-message dispatch and cleared only by a waiter
/// that asked for it.
#[derive(Default)]
struct NotifyInbox {
    data_halt: Option<DataHaltReason>,
    mover_halt: Option<MoverHaltReason>,
    mover_pause: Option<(MoverPauseReason, u64)>,
}

impl NotifyInbox {
    fn take(&mut self, wanted: WaitSet) -> Option<Notification> {
        if wanted.contains(WaitSet::DATA_HALT) {
            if let Some(reason) = self.data_halt.take() {
                return Some(Notification::DataHalted(reason));
            }
        }
        if wanted.contains(WaitSet::MOVER_HALT) {
            if let Some(reason) = self.mover_halt.take() {
                return Some(Notification::MoverHalted(reason));
            }
        }
        if wanted.contains(WaitSet::MOVER_PAUSE) {
            if let Some((reason, seek_position)) = self.mover_pause.take() {
                return Some(Notification::MoverPaused {
                    reason,
                    seek_position,
                });
            }
        }
        None
    }
}

/// Cooperative cancellation for a notification wait.  `abort()` wakes the
/// waiter through a pipe; the waiter shuts the remote mover down before
/// returning, so an aborted session is never left running unwatched.
#[derive(Clone)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    rx: OwnedFd,
    tx: Mutex<File>,
    fired: AtomicBool,
}

impl AbortHandle {
    pub fn new() -> Result<AbortHandle, NdmpError> {
        let (rx, tx) = nix::unistd::pipe()
            .map_err(|e| NdmpError::Transport(e.to_string()))?;
        Ok(AbortHandle {
            inner: Arc::new(AbortInner {
                rx,
                tx: Mutex::new(File::from(tx)),
                fired: AtomicBool::new(false),
            }),
        })
    }

    pub fn abort(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        let mut tx = self.inner.tx.lock().unwrap();
        let _ = tx.write_all(b"!");
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.inner.rx.as_fd()
    }
}

/// One NDMP control connection.
///
/// A connection whose construction failed (unreachable host, bad
/// credentials, wrong protocol version) is still a connection object;
/// every operation on it reports the recorded startup failure.  Such an
/// object never owns a socket.  Dropping a connection sends no protocol
/// traffic.
pub struct NdmpConnection {
    pool: Arc<NdmpPool>,
    pub(crate) log: Logger,
    connid: u32,
    stream: Option<TcpStream>,
    startup_err: Option<String>,
    verbose: bool,
    seq: u32,
    inbox: NotifyInbox,
    last_err: Option<String>,
}

impl NdmpConnection {
    /// Open a control connection and authenticate.  Always returns an
    /// object; inspect the first operation's result (or `last_error`)
    /// for startup failures.
    pub fn connect(
        pool: &Arc<NdmpPool>,
        hostname: &str,
        port: u16,
        options: &TapeOptions,
    ) -> NdmpConnection {
        let connid = pool.next_connid();
        let log = pool.log.new(o!("connid" => connid));
        let mut conn = NdmpConnection {
            pool: Arc::clone(pool),
            log,
            connid,
            stream: None,
            startup_err: None,
            verbose: options.verbose,
            seq: 0,
            inbox: NotifyInbox::default(),
            last_err: None,
        };
        if let Err(e) = conn.handshake(hostname, port, options) {
            warn!(
                conn.log,
                "NDMP connection to {}:{} failed: {}", hostname, port, e
            );
            conn.stream = None;
            conn.startup_err = Some(e.to_string());
            conn.last_err = Some(e.to_string());
        }
        conn
    }

    fn handshake(
        &mut self,
        hostname: &str,
        port: u16,
        options: &TapeOptions,
    ) -> Result<(), NdmpError> {
        let port = if port == 0 { NDMP_DEFAULT_PORT } else { port };
        let stream = TcpStream::connect((hostname, port)).map_err(|e| {
            NdmpError::Startup(format!(
                "could not connect to {hostname}:{port}: {e}"
            ))
        })?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);

        // the server speaks first, with a connection-status post
        let (hdr, mut body) = self.recv_message()?;
        if hdr.message_type != MessageType::Request
            || hdr.code() != Some(MessageCode::NotifyConnectionStatus)
        {
            return Err(NdmpError::Startup(format!(
                "expected connection-status greeting, got message 0x{:x}",
                hdr.message
            )));
        }
        let post = NotifyConnectionStatusPost::decode(&mut body)
            .map_err(|e| NdmpError::Startup(format!("bad greeting: {e}")))?;
        if post.reason != ConnectionStatusReason::Connected {
            return Err(NdmpError::Startup(format!(
                "server refused connection: {}",
                post.text_reason
            )));
        }
        if post.protocol_version != NDMP4_VERSION {
            return Err(NdmpError::Startup(format!(
                "Only NDMPv4 is supported; got NDMPv{}",
                post.protocol_version
            )));
        }

        self.transact::<GenericReply>(
            MessageCode::ConnectOpen,
            &ConnectOpenRequest {
                version: NDMP4_VERSION,
            },
        )?;

        let auth = match options.auth {
            AuthMethod::Void => return Ok(()),
            AuthMethod::None => AuthData::None,
            AuthMethod::Text => AuthData::Text {
                id: options.username.clone(),
                password: options.password.clone(),
            },
            AuthMethod::Md5 => {
                let attr = self.transact::<AuthAttrReply>(
                    MessageCode::ConfigGetAuthAttr,
                    &ConfigGetAuthAttrRequest {
                        auth_type: AuthType::Md5,
                    },
                )?;
                AuthData::Md5 {
                    id: options.username.clone(),
                    digest: md5_digest(&options.password, &attr.challenge),
                }
            }
        };
        self.transact::<GenericReply>(
            MessageCode::ConnectClientAuth,
            &ConnectClientAuthRequest { auth },
        )?;
        Ok(())
    }

    pub fn connid(&self) -> u32 {
        self.connid
    }

    /// Most recent failure on this connection, for diagnostics.  Error
    /// propagation happens through `Result`s; this is a convenience
    /// accessor only.
    pub fn last_error(&self) -> Option<&str> {
        self.last_err.as_deref()
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, NdmpError> {
        if let Some(err) = &self.startup_err {
            return Err(NdmpError::Startup(err.clone()));
        }
        self.stream
            .as_mut()
            .ok_or_else(|| NdmpError::Transport("connection closed".into()))
    }

    /// A failed read or write leaves the wire at an unknown framing
    /// offset, so the stream is torn down rather than reused.  Later
    /// operations fail with a closed-connection error.
    fn transport_fail(&mut self, why: String) -> NdmpError {
        warn!(self.log, "transport failure, dropping connection: {why}");
        self.stream = None;
        self.last_err = Some(why.clone());
        NdmpError::Transport(why)
    }

    fn recv_message(
        &mut self,
    ) -> Result<(MessageHeader, BytesMut), NdmpError> {
        let verbose = self.verbose;
        let read = {
            let stream = self.stream_mut()?;
            read_frame(stream)
        };
        let mut frame = match read {
            Ok(frame) => frame,
            Err(e) => return Err(self.transport_fail(e.to_string())),
        };
        let hdr = MessageHeader::decode(&mut frame)
            .map_err(|e| NdmpError::Invariant(e.to_string()))?;
        if verbose {
            debug!(
                self.log,
                "recv {:?} 0x{:x}", hdr.message_type, hdr.message;
                "seq" => hdr.sequence,
                "reply_seq" => hdr.reply_sequence
            );
        }
        Ok((hdr, frame))
    }

    /// One request/reply exchange.  Unsolicited messages that arrive
    /// while the reply is pending feed the notification inbox; a reply
    /// that is out of sequence or malformed is a protocol error, and a
    /// header- or body-level NDMP status is a server error.
    fn transact<R: Reply>(
        &mut self,
        code: MessageCode,
        req: &impl Body,
    ) -> Result<R, NdmpError> {
        let res = self.transact_inner(code, req);
        if let Err(e) = &res {
            self.last_err = Some(e.to_string());
        }
        res
    }

    fn transact_inner<R: Reply>(
        &mut self,
        code: MessageCode,
        req: &impl Body,
    ) -> Result<R, NdmpError> {
        let pool = Arc::clone(&self.pool);
        let _guard = pool.xfer_lock.lock().unwrap();

        self.seq += 1;
        let seq = self.seq;
        let hdr = MessageHeader::request(seq, code);
        let buf = encode_message(&hdr, req);
        if self.verbose {
            debug!(self.log, "send {:?}", code; "seq" => seq);
        }
        let sent = {
            let stream = self.stream_mut()?;
            write_frame(stream, &buf)
        };
        if let Err(e) = sent {
            return Err(self.transport_fail(e.to_string()));
        }

        loop {
            let (rhdr, mut body) = self.recv_message()?;
            match rhdr.message_type {
                MessageType::Request => {
                    self.dispatch_unsolicited(&rhdr, body);
                }
                MessageType::Reply => {
                    if rhdr.reply_sequence != seq {
                        return Err(NdmpError::Invariant(format!(
                            "reply out of sequence: expected {seq}, got {}",
                            rhdr.reply_sequence
                        )));
                    }
                    if rhdr.error != NdmpStatus::NoErr {
                        return Err(NdmpError::server(rhdr.error));
                    }
                    let reply = R::decode(&mut body).map_err(|e| {
                        NdmpError::Invariant(format!(
                            "malformed {code:?} reply: {e}"
                        ))
                    })?;
                    if reply.status() != NdmpStatus::NoErr {
                        return Err(NdmpError::server(reply.status()));
                    }
                    return Ok(reply);
                }
            }
        }
    }

    /// Server-originated requests: the three stored notifications, log
    /// posts (forwarded to diagnostics only), and anything else, which is
    /// logged and dropped.
    fn dispatch_unsolicited(&mut self, hdr: &MessageHeader, mut body: BytesMut) {
        match hdr.code() {
            Some(MessageCode::NotifyDataHalted) => {
                match NotifyDataHaltedPost::decode(&mut body) {
                    Ok(post) => self.inbox.data_halt = Some(post.reason),
                    Err(e) => warn!(self.log, "bad data-halted post: {e}"),
                }
            }
            Some(MessageCode::NotifyMoverHalted) => {
                match NotifyMoverHaltedPost::decode(&mut body) {
                    Ok(post) => self.inbox.mover_halt = Some(post.reason),
                    Err(e) => warn!(self.log, "bad mover-halted post: {e}"),
                }
            }
            Some(MessageCode::NotifyMoverPaused) => {
                match NotifyMoverPausedPost::decode(&mut body) {
                    Ok(post) => {
                        self.inbox.mover_pause =
                            Some((post.reason, post.seek_position))
                    }
                    Err(e) => warn!(self.log, "bad mover-paused post: {e}"),
                }
            }
            Some(MessageCode::LogMessage) => {
                match LogMessagePost::decode(&mut body) {
                    Ok(post) => debug!(
                        self.log,
                        "server log: {}", post.entry;
                        "message_id" => post.message_id
                    ),
                    Err(e) => warn!(self.log, "bad log post: {e}"),
                }
            }
            Some(MessageCode::LogFile) => {
                debug!(self.log, "server file log post (ignored)");
            }
            _ => {
                warn!(
                    self.log,
                    "ignoring unexpected message 0x{:x}", hdr.message
                );
            }
        }
    }

    /// Block until one of the wanted notifications is queued, consuming
    /// and returning it.  Not cancellable short of closing the socket.
    pub fn wait_for_notify(
        &mut self,
        wanted: WaitSet,
    ) -> Result<Notification, NdmpError> {
        self.wait_for_notify_impl(wanted, None)
    }

    /// As `wait_for_notify`, but wakes when `abort` fires.  On abort the
    /// mover is aborted and stopped before `NdmpError::Aborted` comes
    /// back, so the remote session never stays ACTIVE/PAUSED with nobody
    /// watching it.
    pub fn wait_for_notify_abortable(
        &mut self,
        wanted: WaitSet,
        abort: &AbortHandle,
    ) -> Result<Notification, NdmpError> {
        self.wait_for_notify_impl(wanted, Some(abort))
    }

    fn wait_for_notify_impl(
        &mut self,
        wanted: WaitSet,
        abort: Option<&AbortHandle>,
    ) -> Result<Notification, NdmpError> {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        loop {
            if let Some(n) = self.inbox.take(wanted) {
                return Ok(n);
            }

            let aborted = {
                if let Some(err) = &self.startup_err {
                    return Err(NdmpError::Startup(err.clone()));
                }
                let stream = self.stream.as_ref().ok_or_else(|| {
                    NdmpError::Transport("connection closed".into())
                })?;
                let mut fds =
                    vec![PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
                if let Some(a) = abort {
                    fds.push(PollFd::new(a.fd(), PollFlags::POLLIN));
                }
                poll(&mut fds, PollTimeout::NONE)
                    .map_err(|e| NdmpError::Transport(e.to_string()))?;
                fds.len() > 1
                    && fds[1].revents().is_some_and(|r| !r.is_empty())
            };

            if aborted {
                if let Err(e) = self.mover_abort() {
                    warn!(self.log, "mover_abort on wait abort: {e}");
                }
                if let Err(e) = self.mover_stop() {
                    warn!(self.log, "mover_stop on wait abort: {e}");
                }
                return Err(NdmpError::Aborted);
            }

            // one message per wakeup, under the transaction lock
            let pool = Arc::clone(&self.pool);
            let guard = pool.xfer_lock.lock().unwrap();
            let (hdr, body) = self.recv_message()?;
            drop(guard);

            if hdr.message_type == MessageType::Request {
                self.dispatch_unsolicited(&hdr, body);
            } else {
                return Err(NdmpError::Invariant(format!(
                    "unexpected reply 0x{:x} while waiting for notification",
                    hdr.message
                )));
            }
        }
    }

    /*
     * Typed wire operations.  Each is exactly one transaction.
     */

    pub fn scsi_open(&mut self, device: &str) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(
            MessageCode::ScsiOpen,
            &ScsiOpenRequest {
                device: device.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn scsi_close(&mut self) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(MessageCode::ScsiClose, &())?;
        Ok(())
    }

    pub fn scsi_execute_cdb(
        &mut self,
        req: &ScsiExecuteCdbRequest,
    ) -> Result<ScsiExecuteCdbReply, NdmpError> {
        self.transact::<ScsiExecuteCdbReply>(MessageCode::ScsiExecuteCdb, req)
    }

    pub fn tape_open(
        &mut self,
        device: &str,
        mode: TapeOpenMode,
    ) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(
            MessageCode::TapeOpen,
            &TapeOpenRequest {
                device: device.to_string(),
                mode,
            },
        )?;
        Ok(())
    }

    pub fn tape_close(&mut self) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(MessageCode::TapeClose, &())?;
        Ok(())
    }

    /// Returns the residual count: the number of operations (spaces,
    /// filemarks) that could not be performed.
    pub fn tape_mtio(
        &mut self,
        op: TapeMtioOp,
        count: u32,
    ) -> Result<u32, NdmpError> {
        let reply = self.transact::<TapeMtioReply>(
            MessageCode::TapeMtio,
            &TapeMtioRequest { op, count },
        )?;
        Ok(reply.resid_count)
    }

    /// Returns the count of bytes actually moved to media.
    pub fn tape_write(&mut self, data: &[u8]) -> Result<u64, NdmpError> {
        let reply = self.transact::<TapeWriteReply>(
            MessageCode::TapeWrite,
            &TapeWriteRequest {
                data: data.to_vec(),
            },
        )?;
        Ok(reply.count as u64)
    }

    pub fn tape_read(&mut self, count: u32) -> Result<Vec<u8>, NdmpError> {
        let reply = self.transact::<TapeReadReply>(
            MessageCode::TapeRead,
            &TapeReadRequest { count },
        )?;
        Ok(reply.data)
    }

    pub fn tape_get_state(
        &mut self,
    ) -> Result<TapeGetStateReply, NdmpError> {
        self.transact::<TapeGetStateReply>(MessageCode::TapeGetState, &())
    }

    pub fn mover_set_record_size(
        &mut self,
        len: u32,
    ) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(
            MessageCode::MoverSetRecordSize,
            &MoverSetRecordSizeRequest { len },
        )?;
        Ok(())
    }

    pub fn mover_set_window(
        &mut self,
        offset: u64,
        length: u64,
    ) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(
            MessageCode::MoverSetWindow,
            &MoverSetWindowRequest { offset, length },
        )?;
        Ok(())
    }

    pub fn mover_read(
        &mut self,
        offset: u64,
        length: u64,
    ) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(
            MessageCode::MoverRead,
            &MoverReadRequest { offset, length },
        )?;
        Ok(())
    }

    pub fn mover_continue(&mut self) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(MessageCode::MoverContinue, &())?;
        Ok(())
    }

    pub fn mover_listen(
        &mut self,
        mode: MoverMode,
        addr_type: AddrType,
    ) -> Result<Vec<TcpAddr>, NdmpError> {
        let reply = self.transact::<MoverListenReply>(
            MessageCode::MoverListen,
            &MoverListenRequest { mode, addr_type },
        )?;
        Ok(reply.addrs)
    }

    pub fn mover_connect(
        &mut self,
        mode: MoverMode,
        addrs: &[TcpAddr],
    ) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(
            MessageCode::MoverConnect,
            &MoverConnectRequest {
                mode,
                addrs: addrs.to_vec(),
            },
        )?;
        Ok(())
    }

    pub fn mover_abort(&mut self) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(MessageCode::MoverAbort, &())?;
        Ok(())
    }

    pub fn mover_stop(&mut self) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(MessageCode::MoverStop, &())?;
        Ok(())
    }

    pub fn mover_close(&mut self) -> Result<(), NdmpError> {
        self.transact::<GenericReply>(MessageCode::MoverClose, &())?;
        Ok(())
    }

    pub fn mover_get_state(
        &mut self,
    ) -> Result<MoverGetStateReply, NdmpError> {
        self.transact::<MoverGetStateReply>(MessageCode::MoverGetState, &())
    }
}
