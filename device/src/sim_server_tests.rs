//! End-to-end tests against an in-process simulated NDMP tape server.
//!
//! The simulator speaks enough of the v4 wire protocol to exercise every
//! client path: the connect/auth handshake, the tape agent over an
//! in-memory record list, and a mover state machine with real data
//! sockets.  Error injection knobs cover zero-window rejection, logical
//! end-of-media, and a full volume.

use std::io::{Read as _, Write as _};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ndmp_common::{DeviceStatus, NdmpError, NdmpStatus, TapeHeader, TapeHeaderKind};
use ndmp_protocol::{
    auth::md5_digest, encode_message, read_frame, write_frame, AuthAttrReply,
    AuthData, Body, ConnectClientAuthRequest, ConnectionStatusReason,
    GenericReply, MessageCode, MessageHeader, MoverConnectRequest,
    MoverGetStateReply, MoverHaltReason, MoverListenReply,
    MoverListenRequest, MoverMode, MoverPauseReason, MoverReadRequest,
    MoverSetRecordSizeRequest, MoverSetWindowRequest, MoverState,
    NotifyConnectionStatusPost, NotifyMoverHaltedPost, NotifyMoverPausedPost,
    TapeGetStateReply, TapeMtioOp, TapeMtioReply, TapeMtioRequest,
    TapeOpenMode,
    TapeReadReply, TapeReadRequest, TapeWriteReply, TapeWriteRequest,
    TcpAddr, NDMP4_VERSION,
};

use crate::config::{AuthMethod, TapeOptions};
use crate::connection::{AbortHandle, NdmpConnection, WaitSet};
use crate::tape::NdmpTapeDevice;
use crate::{
    csl, AccessMode, DeviceRegistry, NdmpPool, TapeDevice,
    DEFAULT_BLOCK_SIZE,
};

const BS: usize = DEFAULT_BLOCK_SIZE as usize;
const SIM_PASSWORD: &str = "sim-secret";
const SIM_CHALLENGE: [u8; 64] = [0x42; 64];

#[derive(Clone, Debug, PartialEq)]
enum SimRecord {
    Data(Vec<u8>),
    Filemark,
}

#[derive(Default, Clone)]
struct SimConfig {
    /// Refuse mover_set_window(_, 0) with ILLEGAL_ARGS.
    reject_zero_window: bool,
    /// Stream offset at which a mover-to-tape transfer pauses for EOM.
    mover_eom_at: Option<u64>,
    /// Record index whose tape_write reports EOM_ERR once (LEOM warning).
    tape_leom_at: Option<usize>,
    /// Record index whose tape_write reports IO_ERR (volume full).
    tape_full_at: Option<usize>,
    /// Fixed drive block size reported by tape_get_state (0 = variable).
    fixed_block_size: Option<u32>,
}

#[derive(Default)]
struct SimState {
    records: Vec<SimRecord>,
    mover_aborted: bool,
    mover_stopped: bool,
}

struct SimSession {
    cfg: SimConfig,
    state: Arc<Mutex<SimState>>,
    pos: usize,
    leom_fired: bool,
    record_size: u32,
    window_offset: u64,
    window_len: u64,
    bytes_moved: u64,
    stream_pos: u64,
    mover_state: MoverState,
    mover_mode: MoverMode,
    data_listener: Option<TcpListener>,
    peer: Option<TcpStream>,
}

fn send_msg(ctl: &mut TcpStream, hdr: &MessageHeader, body: &impl Body) {
    let buf = encode_message(hdr, body);
    write_frame(ctl, &buf).unwrap();
}

fn send_reply(
    ctl: &mut TcpStream,
    seq: &mut u32,
    req: &MessageHeader,
    body: &impl Body,
) {
    *seq += 1;
    send_msg(ctl, &MessageHeader::reply_to(req, *seq), body);
}

fn send_generic(
    ctl: &mut TcpStream,
    seq: &mut u32,
    req: &MessageHeader,
    error: NdmpStatus,
) {
    send_reply(ctl, seq, req, &GenericReply { error });
}

fn send_post(
    ctl: &mut TcpStream,
    seq: &mut u32,
    code: MessageCode,
    body: &impl Body,
) {
    *seq += 1;
    send_msg(ctl, &MessageHeader::request(*seq, code), body);
}

fn read_full(s: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match s.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn pause(
    sess: &mut SimSession,
    ctl: &mut TcpStream,
    seq: &mut u32,
    reason: MoverPauseReason,
) {
    sess.mover_state = MoverState::Paused;
    send_post(
        ctl,
        seq,
        MessageCode::NotifyMoverPaused,
        &NotifyMoverPausedPost {
            reason,
            seek_position: sess.stream_pos,
        },
    );
}

fn halt(
    sess: &mut SimSession,
    ctl: &mut TcpStream,
    seq: &mut u32,
    reason: MoverHaltReason,
) {
    sess.mover_state = MoverState::Halted;
    sess.peer = None;
    send_post(
        ctl,
        seq,
        MessageCode::NotifyMoverHalted,
        &NotifyMoverHaltedPost { reason },
    );
}

/// Consume the data connection into the tape until the window (or an
/// injected EOM) stops us, then notify.
fn mover_consume(sess: &mut SimSession, ctl: &mut TcpStream, seq: &mut u32) {
    sess.mover_state = MoverState::Active;
    let window_end = sess.window_offset.saturating_add(sess.window_len);
    loop {
        if sess.stream_pos >= window_end {
            pause(sess, ctl, seq, MoverPauseReason::Eow);
            return;
        }
        if let Some(eom) = sess.cfg.mover_eom_at {
            if sess.stream_pos >= eom {
                pause(sess, ctl, seq, MoverPauseReason::Eom);
                return;
            }
        }
        let mut buf = vec![0u8; sess.record_size as usize];
        let peer = sess.peer.as_mut().unwrap();
        match read_full(peer, &mut buf) {
            Ok(0) => {
                halt(sess, ctl, seq, MoverHaltReason::ConnectClosed);
                return;
            }
            Ok(n) => {
                buf.truncate(n);
                let mut st = sess.state.lock().unwrap();
                st.records.push(SimRecord::Data(buf));
                sess.pos = st.records.len();
                drop(st);
                sess.stream_pos += n as u64;
                sess.bytes_moved += n as u64;
            }
            Err(_) => {
                halt(sess, ctl, seq, MoverHaltReason::ConnectError);
                return;
            }
        }
    }
}

/// Stream tape records out over the data connection until the window
/// stops us or the data runs out, then notify.
fn mover_produce(sess: &mut SimSession, ctl: &mut TcpStream, seq: &mut u32) {
    sess.mover_state = MoverState::Active;
    let window_end = sess.window_offset.saturating_add(sess.window_len);
    loop {
        if sess.stream_pos >= window_end {
            pause(sess, ctl, seq, MoverPauseReason::Eow);
            return;
        }
        let rec = {
            let st = sess.state.lock().unwrap();
            st.records.get(sess.pos).cloned()
        };
        match rec {
            None => {
                pause(sess, ctl, seq, MoverPauseReason::Eof);
                return;
            }
            Some(SimRecord::Filemark) => {
                sess.pos += 1;
                pause(sess, ctl, seq, MoverPauseReason::Eof);
                return;
            }
            Some(SimRecord::Data(d)) => {
                let peer = sess.peer.as_mut().unwrap();
                if peer.write_all(&d).is_err() {
                    halt(sess, ctl, seq, MoverHaltReason::ConnectError);
                    return;
                }
                sess.pos += 1;
                sess.stream_pos += d.len() as u64;
                sess.bytes_moved += d.len() as u64;
            }
        }
    }
}

fn on_data_peer(sess: &mut SimSession, ctl: &mut TcpStream, seq: &mut u32) {
    if sess.mover_mode == MoverMode::Read {
        if sess.window_len == 0 {
            // parked on the zero-length window until the first real one
            pause(sess, ctl, seq, MoverPauseReason::Eow);
        } else {
            // IndirectTCP: the window was set before the listen
            mover_consume(sess, ctl, seq);
        }
    } else {
        // reading waits for the mover_read request
        sess.mover_state = MoverState::Active;
    }
}

fn handle_mtio(sess: &mut SimSession, op: TapeMtioOp, count: u32) -> (NdmpStatus, u32) {
    let mut st = sess.state.lock().unwrap();
    match op {
        TapeMtioOp::Rew => {
            sess.pos = 0;
            (NdmpStatus::NoErr, 0)
        }
        TapeMtioOp::Off => {
            sess.pos = 0;
            (NdmpStatus::NoErr, 0)
        }
        TapeMtioOp::Eof => {
            for _ in 0..count {
                st.records.truncate(sess.pos);
                st.records.push(SimRecord::Filemark);
                sess.pos += 1;
            }
            (NdmpStatus::NoErr, 0)
        }
        TapeMtioOp::Fsf => {
            let mut left = count;
            while left > 0 {
                match st.records[sess.pos..]
                    .iter()
                    .position(|r| *r == SimRecord::Filemark)
                {
                    Some(i) => {
                        sess.pos += i + 1;
                        left -= 1;
                    }
                    None => {
                        sess.pos = st.records.len();
                        break;
                    }
                }
            }
            (NdmpStatus::NoErr, left)
        }
        TapeMtioOp::Bsf => {
            let mut left = count;
            while left > 0 {
                match st.records[..sess.pos]
                    .iter()
                    .rposition(|r| *r == SimRecord::Filemark)
                {
                    Some(i) => {
                        sess.pos = i;
                        left -= 1;
                    }
                    None => {
                        sess.pos = 0;
                        break;
                    }
                }
            }
            (NdmpStatus::NoErr, left)
        }
        TapeMtioOp::Fsr | TapeMtioOp::Bsr => (NdmpStatus::NotSupportedErr, count),
    }
}

fn run_sim(listener: TcpListener, cfg: SimConfig, state: Arc<Mutex<SimState>>) {
    let (mut ctl, _) = match listener.accept() {
        Ok(x) => x,
        Err(_) => return,
    };
    ctl.set_nodelay(true).ok();

    let mut seq = 0u32;
    send_post(
        &mut ctl,
        &mut seq,
        MessageCode::NotifyConnectionStatus,
        &NotifyConnectionStatusPost {
            reason: ConnectionStatusReason::Connected,
            protocol_version: NDMP4_VERSION,
            text_reason: "sim ready".to_string(),
        },
    );

    let mut sess = SimSession {
        cfg,
        state,
        pos: 0,
        leom_fired: false,
        record_size: 0,
        window_offset: 0,
        window_len: 0,
        bytes_moved: 0,
        stream_pos: 0,
        mover_state: MoverState::Idle,
        mover_mode: MoverMode::Read,
        data_listener: None,
        peer: None,
    };

    ctl.set_read_timeout(Some(Duration::from_millis(20))).ok();
    loop {
        let accepted = match &sess.data_listener {
            Some(l) => {
                l.set_nonblocking(true).ok();
                l.accept().ok()
            }
            None => None,
        };
        if let Some((peer, _)) = accepted {
            peer.set_nonblocking(false).ok();
            peer.set_nodelay(true).ok();
            sess.peer = Some(peer);
            sess.data_listener = None;
            on_data_peer(&mut sess, &mut ctl, &mut seq);
        }

        // probe for a frame without risking a partial read
        let mut probe = [0u8; 1];
        match ctl.peek(&mut probe) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => return,
        }
        ctl.set_read_timeout(None).ok();
        let mut frame = match read_frame(&mut ctl) {
            Ok(f) => f,
            Err(_) => return,
        };
        ctl.set_read_timeout(Some(Duration::from_millis(20))).ok();
        let hdr = MessageHeader::decode(&mut frame).unwrap();

        match hdr.code() {
            Some(MessageCode::ConnectOpen) => {
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
            }
            Some(MessageCode::ConfigGetAuthAttr) => {
                send_reply(
                    &mut ctl,
                    &mut seq,
                    &hdr,
                    &AuthAttrReply {
                        error: NdmpStatus::NoErr,
                        challenge: SIM_CHALLENGE,
                    },
                );
            }
            Some(MessageCode::ConnectClientAuth) => {
                let req =
                    ConnectClientAuthRequest::decode(&mut frame).unwrap();
                let ok = match req.auth {
                    AuthData::None => true,
                    AuthData::Text { ref password, .. } => {
                        password == SIM_PASSWORD
                    }
                    AuthData::Md5 { digest, .. } => {
                        digest == md5_digest(SIM_PASSWORD, &SIM_CHALLENGE)
                    }
                };
                let error = if ok {
                    NdmpStatus::NoErr
                } else {
                    NdmpStatus::NotAuthorizedErr
                };
                send_generic(&mut ctl, &mut seq, &hdr, error);
            }
            Some(MessageCode::ScsiOpen) | Some(MessageCode::ScsiClose) => {
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
            }
            Some(MessageCode::TapeOpen) | Some(MessageCode::TapeClose) => {
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
            }
            Some(MessageCode::TapeMtio) => {
                let req = TapeMtioRequest::decode(&mut frame).unwrap();
                let (error, resid_count) =
                    handle_mtio(&mut sess, req.op, req.count);
                send_reply(
                    &mut ctl,
                    &mut seq,
                    &hdr,
                    &TapeMtioReply { error, resid_count },
                );
            }
            Some(MessageCode::TapeWrite) => {
                let req = TapeWriteRequest::decode(&mut frame).unwrap();
                let mut st = sess.state.lock().unwrap();
                st.records.truncate(sess.pos);
                let at = st.records.len();
                let error = if sess.cfg.tape_full_at == Some(at) {
                    NdmpStatus::IoErr
                } else if sess.cfg.tape_leom_at == Some(at)
                    && !sess.leom_fired
                {
                    sess.leom_fired = true;
                    NdmpStatus::EomErr
                } else {
                    let count = req.data.len() as u32;
                    st.records.push(SimRecord::Data(req.data));
                    sess.pos = st.records.len();
                    drop(st);
                    send_reply(
                        &mut ctl,
                        &mut seq,
                        &hdr,
                        &TapeWriteReply {
                            error: NdmpStatus::NoErr,
                            count,
                        },
                    );
                    continue;
                };
                drop(st);
                send_reply(
                    &mut ctl,
                    &mut seq,
                    &hdr,
                    &TapeWriteReply { error, count: 0 },
                );
            }
            Some(MessageCode::TapeRead) => {
                let _req = TapeReadRequest::decode(&mut frame).unwrap();
                let rec = {
                    let st = sess.state.lock().unwrap();
                    st.records.get(sess.pos).cloned()
                };
                let reply = match rec {
                    Some(SimRecord::Data(d)) => {
                        sess.pos += 1;
                        TapeReadReply {
                            error: NdmpStatus::NoErr,
                            data: d,
                        }
                    }
                    Some(SimRecord::Filemark) => {
                        sess.pos += 1;
                        TapeReadReply {
                            error: NdmpStatus::EofErr,
                            data: vec![],
                        }
                    }
                    None => TapeReadReply {
                        error: NdmpStatus::EofErr,
                        data: vec![],
                    },
                };
                send_reply(&mut ctl, &mut seq, &hdr, &reply);
            }
            Some(MessageCode::TapeGetState) => {
                let (file_num, blockno) = {
                    let st = sess.state.lock().unwrap();
                    let file_num = st.records[..sess.pos]
                        .iter()
                        .filter(|r| **r == SimRecord::Filemark)
                        .count() as u32;
                    let blockno = st.records[..sess.pos]
                        .iter()
                        .rev()
                        .take_while(|r| **r != SimRecord::Filemark)
                        .count() as u32;
                    (file_num, blockno)
                };
                send_reply(
                    &mut ctl,
                    &mut seq,
                    &hdr,
                    &TapeGetStateReply {
                        unsupported: 0,
                        error: NdmpStatus::NoErr,
                        flags: 0,
                        file_num,
                        soft_errors: 0,
                        block_size: sess.cfg.fixed_block_size.unwrap_or(0),
                        blockno,
                        total_space: 0,
                        space_remain: 0,
                    },
                );
            }
            Some(MessageCode::MoverSetRecordSize) => {
                let req =
                    MoverSetRecordSizeRequest::decode(&mut frame).unwrap();
                sess.record_size = req.len;
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
            }
            Some(MessageCode::MoverSetWindow) => {
                let req = MoverSetWindowRequest::decode(&mut frame).unwrap();
                if req.length == 0 && sess.cfg.reject_zero_window {
                    send_generic(
                        &mut ctl,
                        &mut seq,
                        &hdr,
                        NdmpStatus::IllegalArgsErr,
                    );
                } else {
                    sess.window_offset = req.offset;
                    sess.window_len = req.length;
                    send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
                }
            }
            Some(MessageCode::MoverListen) => {
                let req = MoverListenRequest::decode(&mut frame).unwrap();
                sess.mover_mode = req.mode;
                sess.mover_state = MoverState::Listen;
                let l = TcpListener::bind("127.0.0.1:0").unwrap();
                let port = l.local_addr().unwrap().port();
                sess.data_listener = Some(l);
                send_reply(
                    &mut ctl,
                    &mut seq,
                    &hdr,
                    &MoverListenReply {
                        error: NdmpStatus::NoErr,
                        addrs: vec![TcpAddr::new(Ipv4Addr::LOCALHOST, port)],
                    },
                );
            }
            Some(MessageCode::MoverConnect) => {
                let req = MoverConnectRequest::decode(&mut frame).unwrap();
                sess.mover_mode = req.mode;
                let a = &req.addrs[0];
                let peer = TcpStream::connect((a.ip, a.port)).unwrap();
                peer.set_nodelay(true).ok();
                sess.peer = Some(peer);
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
                on_data_peer(&mut sess, &mut ctl, &mut seq);
            }
            Some(MessageCode::MoverRead) => {
                let req = MoverReadRequest::decode(&mut frame).unwrap();
                sess.stream_pos = req.offset;
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
                pause(&mut sess, &mut ctl, &mut seq, MoverPauseReason::Seek);
            }
            Some(MessageCode::MoverContinue) => {
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
                if sess.mover_mode == MoverMode::Read {
                    mover_consume(&mut sess, &mut ctl, &mut seq);
                } else {
                    mover_produce(&mut sess, &mut ctl, &mut seq);
                }
            }
            Some(MessageCode::MoverGetState) => {
                send_reply(
                    &mut ctl,
                    &mut seq,
                    &hdr,
                    &MoverGetStateReply {
                        error: NdmpStatus::NoErr,
                        mode: sess.mover_mode,
                        state: sess.mover_state,
                        pause_reason: MoverPauseReason::Na,
                        halt_reason: MoverHaltReason::Na,
                        record_size: sess.record_size,
                        record_num: 0,
                        bytes_moved: sess.bytes_moved,
                        seek_position: sess.stream_pos,
                        bytes_left_to_read: 0,
                        window_offset: sess.window_offset,
                        window_length: sess.window_len,
                        data_connection_addr: vec![],
                    },
                );
            }
            Some(MessageCode::MoverAbort) => {
                sess.mover_state = MoverState::Halted;
                sess.state.lock().unwrap().mover_aborted = true;
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
            }
            Some(MessageCode::MoverStop) => {
                sess.mover_state = MoverState::Idle;
                sess.peer = None;
                sess.state.lock().unwrap().mover_stopped = true;
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
            }
            Some(MessageCode::MoverClose) => {
                send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);
                halt(&mut sess, &mut ctl, &mut seq, MoverHaltReason::ConnectClosed);
            }
            _ => {
                send_generic(
                    &mut ctl,
                    &mut seq,
                    &hdr,
                    NdmpStatus::NotSupportedErr,
                );
            }
        }
    }
}

struct SimServer {
    addr: SocketAddr,
    state: Arc<Mutex<SimState>>,
}

impl SimServer {
    fn start(cfg: SimConfig) -> SimServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(SimState::default()));
        let thread_state = Arc::clone(&state);
        thread::spawn(move || run_sim(listener, cfg, thread_state));
        SimServer { addr, state }
    }

    fn seed(&self, records: Vec<SimRecord>) {
        self.state.lock().unwrap().records = records;
    }

    fn options(&self) -> TapeOptions {
        TapeOptions {
            username: "sim".to_string(),
            password: SIM_PASSWORD.to_string(),
            auth: AuthMethod::Md5,
            verbose: false,
            indirect: false,
            read_block_size: 0,
        }
    }

    fn device_name(&self) -> String {
        format!("127.0.0.1:{}@/dev/nst0", self.addr.port())
    }

    fn device(&self, pool: &Arc<NdmpPool>) -> NdmpTapeDevice {
        NdmpTapeDevice::open(pool, &self.device_name(), &self.options())
            .unwrap()
    }
}

fn header_block(h: &TapeHeader) -> SimRecord {
    SimRecord::Data(h.to_block(BS).unwrap())
}

fn labeled_tape() -> Vec<SimRecord> {
    vec![
        header_block(&TapeHeader::tapestart("VOL1", "20260829")),
        SimRecord::Filemark,
        header_block(&TapeHeader::file("dump.0", "20260829")),
        SimRecord::Data(vec![0x11; BS]),
        SimRecord::Filemark,
    ]
}

#[test]
fn read_label_on_blank_volume() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);
    assert_eq!(dev.read_label(), DeviceStatus::VOLUME_UNLABELED);
    assert!(dev.volume_label().is_none());
}

#[test]
fn read_label_on_labeled_volume() {
    let srv = SimServer::start(SimConfig::default());
    srv.seed(labeled_tape());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);
    assert_eq!(dev.read_label(), DeviceStatus::SUCCESS);
    assert_eq!(dev.volume_label(), Some("VOL1"));
    assert_eq!(dev.volume_time(), Some("20260829"));
}

#[test]
fn registry_opens_ndmp_scheme() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let registry = DeviceRegistry::new();
    let mut dev = registry
        .open(&pool, &format!("ndmp:{}", srv.device_name()), &srv.options())
        .unwrap();
    assert_eq!(dev.read_label(), DeviceStatus::VOLUME_UNLABELED);
    assert!(registry
        .open(&pool, "cloud:whatever", &srv.options())
        .is_err());
}

#[test]
fn write_pads_short_final_block() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    dev.start(AccessMode::Write, "VOL1", "20260829").unwrap();
    dev.start_file("dump.0").unwrap();
    dev.write_block(&[0x7f; 100]).unwrap();
    dev.finish_file().unwrap();
    dev.finish().unwrap();

    let st = srv.state.lock().unwrap();
    // label, filemark, file header, data, filemark
    assert_eq!(st.records.len(), 5);
    match &st.records[3] {
        SimRecord::Data(d) => {
            assert_eq!(d.len(), BS);
            assert!(d[..100].iter().all(|b| *b == 0x7f));
            assert!(d[100..].iter().all(|b| *b == 0));
        }
        other => panic!("expected a data record, got {other:?}"),
    }
    match &st.records[0] {
        SimRecord::Data(d) => {
            let h = TapeHeader::parse(d);
            assert_eq!(h.kind, TapeHeaderKind::TapeStart);
            assert_eq!(h.label, "VOL1");
        }
        other => panic!("expected the volume label, got {other:?}"),
    }
}

#[test]
fn seek_file_is_idempotent() {
    let srv = SimServer::start(SimConfig::default());
    srv.seed(labeled_tape());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);
    assert!(dev.read_label().is_success());

    let first = dev.seek_file(1).unwrap().unwrap();
    assert_eq!(first.kind, TapeHeaderKind::File);
    assert_eq!(first.name, "dump.0");

    // seeking to the file we are already in lands at its start again
    let again = dev.seek_file(1).unwrap().unwrap();
    assert_eq!(again, first);

    // the block after the header is the file data
    let block = dev.read_block().unwrap().unwrap();
    assert_eq!(block, vec![0x11; BS]);
}

#[test]
fn seek_past_recorded_data_yields_tape_end() {
    let srv = SimServer::start(SimConfig::default());
    srv.seed(labeled_tape());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);
    assert!(dev.read_label().is_success());

    let h = dev.seek_file(2).unwrap().unwrap();
    assert_eq!(h.kind, TapeHeaderKind::TapeEnd);
}

#[test]
fn read_block_reports_eof_as_condition() {
    let srv = SimServer::start(SimConfig::default());
    srv.seed(labeled_tape());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);
    assert!(dev.read_label().is_success());

    dev.seek_file(1).unwrap();
    assert!(dev.read_block().unwrap().is_some());
    assert_eq!(dev.read_block().unwrap(), None);
    assert!(dev.is_eof());
}

#[test]
fn robust_write_retries_once_on_leom() {
    let srv = SimServer::start(SimConfig {
        // label and its filemark occupy 0 and 1, the file header is 2
        tape_leom_at: Some(3),
        ..Default::default()
    });
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    dev.start(AccessMode::Write, "VOL1", "20260829").unwrap();
    dev.start_file("dump.0").unwrap();
    dev.write_block(&[0x01; BS]).unwrap();
    assert!(dev.is_eom());

    let st = srv.state.lock().unwrap();
    assert_eq!(st.records.len(), 4);
}

#[test]
fn robust_write_reports_full_volume() {
    let srv = SimServer::start(SimConfig {
        tape_full_at: Some(3),
        ..Default::default()
    });
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    dev.start(AccessMode::Write, "VOL1", "20260829").unwrap();
    dev.start_file("dump.0").unwrap();
    let err = dev.write_block(&[0x01; BS]).unwrap_err();
    assert_eq!(err.code(), Some(NdmpStatus::EomErr));
    assert!(dev.status().contains(DeviceStatus::VOLUME_ERROR));
    assert!(!dev.is_eom());
}

#[test]
fn append_mode_is_rejected() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);
    assert!(dev.start(AccessMode::Append, "VOL1", "20260829").is_err());
}

#[test]
fn directtcp_write_offset_accounting() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    let addrs = dev.listen(true).unwrap();
    assert_eq!(addrs[0].ip, Ipv4Addr::LOCALHOST);
    let (ip, port) = (addrs[0].ip, addrs[0].port);
    let peer = thread::spawn(move || {
        let mut s = TcpStream::connect((ip, port)).unwrap();
        s.write_all(&vec![0xaa; BS * 2]).unwrap();
    });

    let mut xfer = dev.accept(None).unwrap();
    let n1 = xfer.transfer(BS as u64, None).unwrap();
    assert_eq!(n1, BS as u64);
    assert_eq!(xfer.offset(), BS as u64);

    let n2 = xfer.transfer(BS as u64, None).unwrap();
    assert_eq!(n2, BS as u64);
    assert_eq!(xfer.offset(), 2 * BS as u64);
    assert!(!xfer.is_eom());
    assert!(!xfer.is_eof());

    xfer.close().unwrap();
    peer.join().unwrap();

    let st = srv.state.lock().unwrap();
    assert_eq!(st.records.len(), 2);
    assert!(st
        .records
        .iter()
        .all(|r| *r == SimRecord::Data(vec![0xaa; BS])));
}

#[test]
fn directtcp_read_round_trip() {
    let srv = SimServer::start(SimConfig::default());
    srv.seed(vec![
        SimRecord::Data(vec![0x21; BS]),
        SimRecord::Data(vec![0x22; BS]),
    ]);
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    let addrs = dev.listen(false).unwrap();
    let (ip, port) = (addrs[0].ip, addrs[0].port);
    let peer = thread::spawn(move || {
        let mut s = TcpStream::connect((ip, port)).unwrap();
        let mut buf = vec![0u8; BS * 2];
        read_full(&mut s, &mut buf).unwrap();
        buf
    });

    let mut xfer = dev.accept(None).unwrap();
    let n = xfer.transfer(0, None).unwrap();
    assert_eq!(n, 2 * BS as u64);
    assert!(xfer.is_eof());

    let got = peer.join().unwrap();
    assert_eq!(&got[..BS], &[0x21; BS][..]);
    assert_eq!(&got[BS..], &[0x22; BS][..]);
    xfer.close().unwrap();
}

#[test]
fn mover_eom_pause_sets_flag_without_error() {
    let srv = SimServer::start(SimConfig {
        mover_eom_at: Some(BS as u64),
        ..Default::default()
    });
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    let addrs = dev.listen(true).unwrap();
    let (ip, port) = (addrs[0].ip, addrs[0].port);
    let peer = thread::spawn(move || {
        let mut s = TcpStream::connect((ip, port)).unwrap();
        s.write_all(&vec![0xbb; BS * 2]).unwrap();
        // leave the socket open so the pause is EOM, not a closed
        // connection; the mover shutdown below releases us
        let mut sink = Vec::new();
        let _ = s.read_to_end(&mut sink);
    });

    let mut xfer = dev.accept(None).unwrap();
    let n = xfer.transfer(2 * BS as u64, None).unwrap();
    assert_eq!(n, BS as u64);
    assert!(xfer.is_eom());

    xfer.close().unwrap();
    peer.join().unwrap();
}

fn indirect_peer(placeholder_port: u16, payload: Vec<u8>) {
    let mut s =
        TcpStream::connect(("127.0.0.1", placeholder_port)).unwrap();
    let mut text = String::new();
    s.read_to_string(&mut text).unwrap();
    let line = text.lines().next().unwrap();
    let (ip, port) = line.rsplit_once(':').unwrap();
    let mut d = TcpStream::connect((ip, port.parse::<u16>().unwrap())).unwrap();
    d.write_all(&payload).unwrap();
}

#[test]
fn forced_indirect_advertises_placeholder() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let mut options = srv.options();
    options.indirect = true;
    let mut dev =
        NdmpTapeDevice::open(&pool, &srv.device_name(), &options).unwrap();

    let addrs = dev.listen(true).unwrap();
    assert_eq!(addrs[0].ip, Ipv4Addr::BROADCAST);
    let port = addrs[0].port;
    let peer =
        thread::spawn(move || indirect_peer(port, vec![0xcc; BS]));

    let mut xfer = dev.accept(None).unwrap();
    let n = xfer.transfer(BS as u64, None).unwrap();
    assert_eq!(n, BS as u64);
    peer.join().unwrap();

    let st = srv.state.lock().unwrap();
    assert_eq!(st.records, vec![SimRecord::Data(vec![0xcc; BS])]);
}

#[test]
fn zero_window_rejection_falls_back_to_indirect() {
    let srv = SimServer::start(SimConfig {
        reject_zero_window: true,
        ..Default::default()
    });
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    let addrs = dev.listen(true).unwrap();
    assert_eq!(addrs[0].ip, Ipv4Addr::BROADCAST);
    let port = addrs[0].port;
    let peer =
        thread::spawn(move || indirect_peer(port, vec![0xdd; BS]));

    let mut xfer = dev.accept(None).unwrap();
    let n = xfer.transfer(BS as u64, None).unwrap();
    assert_eq!(n, BS as u64);
    peer.join().unwrap();
}

#[test]
fn mover_connect_writes_via_peer() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = l.local_addr().unwrap().port();
    let peer = thread::spawn(move || {
        let (mut s, _) = l.accept().unwrap();
        s.write_all(&vec![0x55; BS]).unwrap();
    });

    let mut xfer = dev
        .connect_to(true, &[TcpAddr::new(Ipv4Addr::LOCALHOST, port)], None)
        .unwrap();
    let n = xfer.transfer(BS as u64, None).unwrap();
    assert_eq!(n, BS as u64);
    xfer.close().unwrap();
    peer.join().unwrap();

    let st = srv.state.lock().unwrap();
    assert_eq!(st.records, vec![SimRecord::Data(vec![0x55; BS])]);
}

#[test]
fn abort_wakes_waiter_and_shuts_mover_down() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let mut conn = NdmpConnection::connect(
        &pool,
        "127.0.0.1",
        srv.addr.port(),
        &srv.options(),
    );
    assert!(conn.last_error().is_none());

    let handle = AbortHandle::new().unwrap();
    let fire = handle.clone();
    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        fire.abort();
    });

    let res = conn.wait_for_notify_abortable(WaitSet::MOVER_HALT, &handle);
    assert!(matches!(res, Err(NdmpError::Aborted)));
    t.join().unwrap();

    let st = srv.state.lock().unwrap();
    assert!(st.mover_aborted);
    assert!(st.mover_stopped);
}

#[test]
fn bad_password_poisons_the_connection() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let mut options = srv.options();
    options.password = "wrong".to_string();
    let mut conn =
        NdmpConnection::connect(&pool, "127.0.0.1", srv.addr.port(), &options);
    assert!(conn.last_error().is_some());

    // every subsequent operation reports the recorded startup failure
    let err = conn.tape_get_state().unwrap_err();
    assert!(matches!(err, NdmpError::Startup(_)));
    let err = conn.mover_continue().unwrap_err();
    assert!(matches!(err, NdmpError::Startup(_)));
}

#[test]
fn transport_failure_tears_down_the_connection() {
    // a server that answers the handshake, then sends a frame whose
    // record mark promises more bytes than ever arrive
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let t = thread::spawn(move || {
        let (mut ctl, _) = listener.accept().unwrap();
        let mut seq = 0u32;
        send_post(
            &mut ctl,
            &mut seq,
            MessageCode::NotifyConnectionStatus,
            &NotifyConnectionStatusPost {
                reason: ConnectionStatusReason::Connected,
                protocol_version: NDMP4_VERSION,
                text_reason: String::new(),
            },
        );
        let mut frame = read_frame(&mut ctl).unwrap();
        let hdr = MessageHeader::decode(&mut frame).unwrap();
        assert_eq!(hdr.code(), Some(MessageCode::ConnectOpen));
        send_generic(&mut ctl, &mut seq, &hdr, NdmpStatus::NoErr);

        // swallow the next request, reply with a truncated frame, hang up
        let _ = read_frame(&mut ctl).unwrap();
        ctl.write_all(&0x8000_0100u32.to_be_bytes()).unwrap();
        ctl.write_all(&[0u8; 16]).unwrap();
    });

    let pool = NdmpPool::new(csl());
    let options = TapeOptions {
        auth: AuthMethod::Void,
        ..TapeOptions::default()
    };
    let mut conn = NdmpConnection::connect(&pool, "127.0.0.1", port, &options);
    assert!(conn.last_error().is_none());

    let err = conn.tape_open("/dev/nst0", TapeOpenMode::Raw).unwrap_err();
    assert!(matches!(err, NdmpError::Transport(_)));
    t.join().unwrap();

    // the wire is mid-frame, so the stream must not be reused; the next
    // operation fails without touching a socket
    let err = conn.tape_get_state().unwrap_err();
    assert!(matches!(err, NdmpError::Transport(_)));
    assert!(conn.last_error().is_some());
}

#[test]
fn byte_counters_reset_per_file() {
    let srv = SimServer::start(SimConfig::default());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    dev.start(AccessMode::Write, "VOL1", "20260829").unwrap();
    dev.start_file("dump.0").unwrap();
    assert_eq!(dev.bytes_written(), 0);
    dev.write_block(&[0x7f; BS]).unwrap();
    dev.write_block(&[0x7f; 100]).unwrap();
    // the padded short block still occupies a full block on media
    assert_eq!(dev.bytes_written(), 2 * BS as u64);
    dev.finish_file().unwrap();

    dev.start_file("dump.1").unwrap();
    assert_eq!(dev.bytes_written(), 0);
    assert_eq!(dev.block_num(), 0);
    dev.finish_file().unwrap();
    dev.finish().unwrap();
}

#[test]
fn byte_counters_follow_reads() {
    let srv = SimServer::start(SimConfig::default());
    srv.seed(labeled_tape());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    dev.start(AccessMode::Read, "", "").unwrap();
    let hdr = dev.seek_file(1).unwrap().unwrap();
    assert_eq!(hdr.kind, TapeHeaderKind::File);
    assert_eq!(dev.bytes_read(), 0);

    let block = dev.read_block().unwrap().unwrap();
    assert_eq!(dev.bytes_read(), block.len() as u64);
    assert!(dev.read_block().unwrap().is_none());
    assert_eq!(dev.bytes_read(), BS as u64);
}

#[test]
fn device_error_outlives_label_reread() {
    let srv = SimServer::start(SimConfig {
        fixed_block_size: Some(DEFAULT_BLOCK_SIZE * 2),
        ..Default::default()
    });
    srv.seed(labeled_tape());
    let pool = NdmpPool::new(csl());
    let mut dev = srv.device(&pool);

    let first = dev.read_label();
    assert!(first.contains(DeviceStatus::DEVICE_ERROR));
    assert_eq!(dev.volume_label(), Some("VOL1"));

    // a reread settles the volume bits, but the drive mismatch stays
    let again = dev.read_label();
    assert!(again.contains(DeviceStatus::DEVICE_ERROR));
    assert!(!again.contains(DeviceStatus::VOLUME_UNLABELED));
}
