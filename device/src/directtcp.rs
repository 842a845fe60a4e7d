//! Bulk data transfer through the remote mover.
//!
//! The preferred path is DirectTCP: the mover itself is one endpoint of
//! the data connection, and transfers are metered with mover windows.
//! Servers that refuse a zero-length transfer window cannot be parked in
//! LISTEN before the window size is known, so the listener-for-writing
//! case falls back to IndirectTCP: we listen on a local socket ourselves,
//! advertise it under a reserved placeholder address, and once the first
//! window is known we start the real mover listener and hand its
//! addresses to the connected peer as text, one `ip:port` line each.

use std::io::Write as _;
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{debug, Logger};

use ndmp_common::{NdmpError, NdmpStatus};
use ndmp_protocol::{
    AddrType, MoverHaltReason, MoverMode, MoverPauseReason, MoverState,
    TcpAddr,
};

use crate::connection::{
    AbortHandle, NdmpConnection, Notification, WaitSet,
};
use crate::tape::NdmpTapeDevice;

/// Listen state between `listen` and `accept`.
pub(crate) struct PendingListen {
    mode: MoverMode,
    /// Local socket for the IndirectTCP fallback; `None` means the mover
    /// is listening directly.
    local: Option<TcpListener>,
}

/// What we believe the remote mover state machine is doing.  Updated on
/// every transition we cause or observe; the transfer loop refuses to
/// run against a mover in the wrong state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum MoverBelief {
    /// IndirectTCP only: the mover is untouched until the first round.
    Idle,
    Paused,
    Halted,
}

/// An established data connection, ready for transfer rounds.
pub struct DirectTcpConnection {
    conn: Arc<Mutex<NdmpConnection>>,
    log: Logger,
    mode: MoverMode,
    offset: u64,
    belief: MoverBelief,
    is_eof: bool,
    is_eom: bool,
    /// IndirectTCP: the accepted peer, waiting for the real mover
    /// addresses.  Consumed by the first transfer round.
    indirect_peer: Option<TcpStream>,
}

impl NdmpTapeDevice {
    /// Prepare to accept a data connection for writing (data flows from
    /// the peer to tape) or reading, returning the addresses the peer
    /// should connect to.
    pub fn listen(
        &mut self,
        for_writing: bool,
    ) -> Result<Vec<TcpAddr>, NdmpError> {
        let mode = mover_mode(for_writing);
        let conn = self.conn();
        let mut c = conn.lock().unwrap();

        c.mover_set_record_size(self.block_size)
            .map_err(|e| self.fail(e))?;

        // forced IndirectTCP skips the zero-window probe entirely
        let indirect = if for_writing && self.options.indirect {
            true
        } else {
            match c.mover_set_window(0, 0) {
                Ok(()) => false,
                Err(e)
                    if for_writing
                        && e.code() == Some(NdmpStatus::IllegalArgsErr) =>
                {
                    debug!(
                        self.log,
                        "server rejects a zero-length window; \
                         falling back to IndirectTCP"
                    );
                    true
                }
                Err(e) => return Err(self.fail(e)),
            }
        };

        let (addrs, local) = if indirect {
            let listener = TcpListener::bind(("0.0.0.0", 0))
                .map_err(|e| NdmpError::Transport(e.to_string()))?;
            let port = listener
                .local_addr()
                .map_err(|e| NdmpError::Transport(e.to_string()))?
                .port();
            // the broadcast address is never routable, so it serves as
            // the IndirectTCP marker; only the port is real
            (vec![TcpAddr::new(Ipv4Addr::BROADCAST, port)], Some(listener))
        } else {
            let addrs = c
                .mover_listen(mode, AddrType::Tcp)
                .map_err(|e| self.fail(e))?;
            (addrs, None)
        };
        self.pending_listen = Some(PendingListen { mode, local });
        Ok(addrs)
    }

    /// Wait for the peer of a previous `listen` to connect, and bring
    /// the mover to its first pause.
    pub fn accept(
        &mut self,
        abort: Option<&AbortHandle>,
    ) -> Result<DirectTcpConnection, NdmpError> {
        let pending = self.pending_listen.take().ok_or_else(|| {
            NdmpError::Invariant("accept without a listen".to_string())
        })?;
        let conn = self.conn();

        if let Some(listener) = pending.local {
            // IndirectTCP: the peer connects to us; the mover side is
            // deferred until the first transfer round
            let (peer, peer_addr) = listener
                .accept()
                .map_err(|e| NdmpError::Transport(e.to_string()))?;
            debug!(self.log, "IndirectTCP peer connected from {peer_addr}");
            return Ok(DirectTcpConnection {
                conn,
                log: self.log.clone(),
                mode: pending.mode,
                offset: 0,
                belief: MoverBelief::Idle,
                is_eof: false,
                is_eom: false,
                indirect_peer: Some(peer),
            });
        }

        finish_establish(&conn, pending.mode, abort)
            .map_err(|e| self.fail(e))?;
        Ok(DirectTcpConnection {
            conn,
            log: self.log.clone(),
            mode: pending.mode,
            offset: 0,
            belief: MoverBelief::Paused,
            is_eof: false,
            is_eom: false,
            indirect_peer: None,
        })
    }

    /// Connect the mover out to a peer that is listening.  Connector
    /// directions never need the IndirectTCP fallback.
    pub fn connect_to(
        &mut self,
        for_writing: bool,
        addrs: &[TcpAddr],
        abort: Option<&AbortHandle>,
    ) -> Result<DirectTcpConnection, NdmpError> {
        let mode = mover_mode(for_writing);
        let conn = self.conn();
        {
            let mut c = conn.lock().unwrap();
            c.mover_set_record_size(self.block_size)
                .map_err(|e| self.fail(e))?;
            c.mover_set_window(0, 0).map_err(|e| self.fail(e))?;
            c.mover_connect(mode, addrs).map_err(|e| self.fail(e))?;
        }
        finish_establish(&conn, mode, abort).map_err(|e| self.fail(e))?;
        Ok(DirectTcpConnection {
            conn,
            log: self.log.clone(),
            mode,
            offset: 0,
            belief: MoverBelief::Paused,
            is_eof: false,
            is_eom: false,
            indirect_peer: None,
        })
    }
}

/// Mover mode for a transfer direction.  The mode is named from the
/// mover's view: when we write tape, the mover reads the data connection.
fn mover_mode(for_writing: bool) -> MoverMode {
    if for_writing {
        MoverMode::Read
    } else {
        MoverMode::Write
    }
}

/// After the data connection exists (or has been requested), bring the
/// mover to its first pause.  A writing mover pauses by itself as soon
/// as the first byte meets the zero-length window; a reading mover gives
/// no notification when its connection comes up, so its state is polled
/// until it leaves LISTEN and then the full-range read is posted.
fn finish_establish(
    conn: &Arc<Mutex<NdmpConnection>>,
    mode: MoverMode,
    abort: Option<&AbortHandle>,
) -> Result<(), NdmpError> {
    let mut c = conn.lock().unwrap();

    if mode == MoverMode::Write {
        let mut delay = Duration::from_millis(50);
        loop {
            if c.mover_get_state()?.state != MoverState::Listen {
                break;
            }
            if let Some(a) = abort {
                if a.is_fired() {
                    let _ = c.mover_abort();
                    let _ = c.mover_stop();
                    return Err(NdmpError::Aborted);
                }
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(Duration::from_secs(1));
        }
        c.mover_read(0, u64::MAX)?;
    }

    let wanted = WaitSet::MOVER_PAUSE | WaitSet::MOVER_HALT;
    let n = match abort {
        Some(a) => c.wait_for_notify_abortable(wanted, a)?,
        None => c.wait_for_notify(wanted)?,
    };
    match n {
        Notification::MoverPaused {
            reason: MoverPauseReason::Seek | MoverPauseReason::Eow,
            ..
        } => Ok(()),
        other => Err(NdmpError::Invariant(format!(
            "unexpected mover event while establishing data \
             connection: {other:?}"
        ))),
    }
}

impl DirectTcpConnection {
    /// Current position in the byte stream, advanced by each round.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_eof(&self) -> bool {
        self.is_eof
    }

    pub fn is_eom(&self) -> bool {
        self.is_eom
    }

    /// One transfer round: move up to `size` bytes (everything left when
    /// `size` is 0) and return the count actually moved.  End-of-media
    /// and end-of-data conditions set [`is_eom`](Self::is_eom) /
    /// [`is_eof`](Self::is_eof) rather than failing.
    pub fn transfer(
        &mut self,
        size: u64,
        abort: Option<&AbortHandle>,
    ) -> Result<u64, NdmpError> {
        assert!(
            self.belief == MoverBelief::Paused
                || (self.belief == MoverBelief::Idle
                    && self.indirect_peer.is_some()),
            "transfer round against a mover believed {:?}",
            self.belief
        );
        let conn = Arc::clone(&self.conn);
        let mut c = conn.lock().unwrap();

        let before = c.mover_get_state()?.bytes_moved;

        let length = if size == 0 {
            u64::MAX - self.offset
        } else {
            size
        };
        c.mover_set_window(self.offset, length)?;

        if let Some(peer) = self.indirect_peer.take() {
            // deferred IndirectTCP: now that a window exists, start the
            // real listener and hand its addresses to the waiting peer;
            // the mover goes ACTIVE as soon as the peer reconnects
            let addrs = c.mover_listen(self.mode, AddrType::Tcp)?;
            debug!(self.log, "IndirectTCP handoff of {} address(es)", addrs.len());
            hand_off(peer, &addrs)
                .map_err(|e| NdmpError::Transport(e.to_string()))?;
        } else {
            c.mover_continue()?;
        }

        let wanted = WaitSet::MOVER_PAUSE | WaitSet::MOVER_HALT;
        let n = match abort {
            Some(a) => c.wait_for_notify_abortable(wanted, a)?,
            None => c.wait_for_notify(wanted)?,
        };
        match n {
            Notification::MoverPaused { reason, .. } => {
                self.belief = MoverBelief::Paused;
                match reason {
                    MoverPauseReason::Eom => self.is_eom = true,
                    MoverPauseReason::Eof => self.is_eof = true,
                    MoverPauseReason::Seek | MoverPauseReason::Eow => {}
                    other => {
                        return Err(NdmpError::Invariant(format!(
                            "mover paused for {other:?}"
                        )))
                    }
                }
            }
            Notification::MoverHalted(reason) => {
                self.belief = MoverBelief::Halted;
                match reason {
                    MoverHaltReason::ConnectClosed => self.is_eof = true,
                    other => {
                        return Err(NdmpError::Invariant(format!(
                            "mover halted for {other:?}"
                        )))
                    }
                }
            }
            Notification::DataHalted(reason) => {
                return Err(NdmpError::Invariant(format!(
                    "unexpected data-halted event ({reason:?}) during \
                     a mover transfer"
                )))
            }
        }

        let after = c.mover_get_state()?.bytes_moved;
        let moved = after.saturating_sub(before);
        self.offset += moved;
        Ok(moved)
    }

    /// Tear the data connection down and return the mover to IDLE.
    pub fn close(&mut self) -> Result<(), NdmpError> {
        self.indirect_peer = None;
        let conn = Arc::clone(&self.conn);
        let mut c = conn.lock().unwrap();
        if self.belief == MoverBelief::Paused {
            c.mover_close()?;
            match c.wait_for_notify(WaitSet::MOVER_HALT)? {
                Notification::MoverHalted(_) => {}
                other => {
                    return Err(NdmpError::Invariant(format!(
                        "unexpected mover event during close: {other:?}"
                    )))
                }
            }
            self.belief = MoverBelief::Halted;
        }
        if self.belief == MoverBelief::Halted {
            c.mover_stop()?;
            self.belief = MoverBelief::Idle;
        }
        Ok(())
    }
}

fn hand_off(
    mut peer: TcpStream,
    addrs: &[TcpAddr],
) -> std::io::Result<()> {
    for a in addrs {
        writeln!(peer, "{}:{}", a.ip, a.port)?;
    }
    peer.flush()?;
    peer.shutdown(Shutdown::Write)?;
    Ok(())
}
