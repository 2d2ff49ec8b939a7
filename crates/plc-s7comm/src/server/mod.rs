//! The server core behind the registration/callback contract.
//!
//! The plugin talks to the wire through exactly this surface: register
//! areas (shared buffers or callback-backed), optionally install an RW
//! handler and an event sink, start and stop the listener, and poll the
//! connected-client count. The transport is ISO-on-TCP with the S7 job
//! subset the front end needs: setup communication, read var, write var.
//!
//! Shared areas are served directly under their own short lock. In
//! callback mode every operation is routed through the [`RwAreaHandler`],
//! which is where the on-demand synchronisation policy plugs in.

pub mod wire;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, trace};

use crate::areas::SharedBuffer;
use crate::codec::get_u16_be;
use crate::config::ServerSettings;
use self::wire::{
    AREA_DB, AREA_MK, AREA_PA, AREA_PE, CotpPdu, DATA_TS_BIT, DATA_TS_BYTE_BITS, FUNC_READ_VAR,
    FUNC_SETUP_COMMUNICATION, FUNC_WRITE_VAR, ITEM_SPEC_LEN, ItemRequest, RET_NO_OBJECT, RET_OK,
    RET_OUT_OF_RANGE, RET_UNSUPPORTED, S7Job, TS_BIT, build_connect_confirm, build_s7_ack,
    cotp_data, data_item_payload_len, parse_cotp, parse_item, parse_s7_job, tpkt_frame,
    tpkt_total_len,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaKind {
    Pe,
    Pa,
    Mk,
    Db,
}

impl AreaKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            AREA_PE => Some(AreaKind::Pe),
            AREA_PA => Some(AreaKind::Pa),
            AREA_MK => Some(AreaKind::Mk),
            AREA_DB => Some(AreaKind::Db),
            _ => None,
        }
    }
}

/// Registry key: system areas use number 0.
pub type AreaKey = (AreaKind, u16);

/// Description of one client operation handed to the RW handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwTag {
    pub kind: AreaKind,
    pub db_number: u16,
    /// Byte offset within the area.
    pub start: usize,
    /// Length in bytes.
    pub len: usize,
    /// Set for single-bit operations.
    pub bit: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Accept,
    Reject,
}

/// Per-operation callback contract for on-demand synchronisation.
pub trait RwAreaHandler: Send + Sync {
    fn area_read(&self, client: u32, tag: &RwTag, buf: &mut [u8]) -> AccessStatus;
    fn area_write(&self, client: u32, tag: &RwTag, data: &[u8]) -> AccessStatus;
}

/// How a registered area is served.
pub enum AreaBacking {
    /// Clients read and write this buffer directly (double buffering).
    Shared(SharedBuffer),
    /// Every operation goes through the RW handler.
    Callback { size_bytes: usize },
}

impl AreaBacking {
    fn size_bytes(&self) -> usize {
        match self {
            AreaBacking::Shared(buf) => buf.len(),
            AreaBacking::Callback { size_bytes } => *size_bytes,
        }
    }
}

#[derive(Debug)]
pub enum ServerEvent {
    Started { port: u16 },
    Stopped,
    ClientConnected { client: u32, peer: SocketAddr },
    ClientDisconnected { client: u32 },
    ClientRejected { peer: SocketAddr },
    DataRead { client: u32 },
    DataWrite { client: u32 },
}

pub type EventSink = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerParams {
    pub bind_address: String,
    pub port: u16,
    pub max_clients: usize,
    pub work_interval: Duration,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    pub ping_timeout: Duration,
    pub pdu_size: u16,
}

impl ServerParams {
    pub fn from_settings(s: &ServerSettings) -> Self {
        Self {
            bind_address: s.bind_address.clone(),
            port: s.port,
            max_clients: s.max_clients,
            work_interval: Duration::from_millis(s.work_interval_ms),
            send_timeout: Duration::from_millis(s.send_timeout_ms),
            recv_timeout: Duration::from_millis(s.recv_timeout_ms),
            ping_timeout: Duration::from_millis(s.ping_timeout_ms),
            pdu_size: s.pdu_size,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("server already running")]
    AlreadyRunning,
    #[error("area {0} registered twice")]
    DuplicateArea(String),
}

struct Shared {
    params: ServerParams,
    areas: RwLock<HashMap<AreaKey, AreaBacking>>,
    handler: RwLock<Option<Arc<dyn RwAreaHandler>>>,
    events: RwLock<Option<EventSink>>,
    run: AtomicBool,
    clients: AtomicUsize,
    next_client: AtomicU32,
}

impl Shared {
    fn emit(&self, event: &ServerEvent) {
        if let Some(sink) = self.events.read().as_ref() {
            sink(event);
        }
    }
}

/// The server instance owned by the plugin.
pub struct S7Server {
    shared: Arc<Shared>,
    accept_thread: Option<JoinHandle<()>>,
    local_port: Option<u16>,
}

impl S7Server {
    pub fn new(params: ServerParams) -> Self {
        Self {
            shared: Arc::new(Shared {
                params,
                areas: RwLock::new(HashMap::new()),
                handler: RwLock::new(None),
                events: RwLock::new(None),
                run: AtomicBool::new(false),
                clients: AtomicUsize::new(0),
                next_client: AtomicU32::new(0),
            }),
            accept_thread: None,
            local_port: None,
        }
    }

    fn register(&self, key: AreaKey, backing: AreaBacking) -> Result<(), ServerError> {
        let mut areas = self.shared.areas.write();
        if areas.contains_key(&key) {
            return Err(ServerError::DuplicateArea(format!("{key:?}")));
        }
        areas.insert(key, backing);
        Ok(())
    }

    /// Register an area served from a shared buffer.
    pub fn register_shared_area(
        &self,
        kind: AreaKind,
        number: u16,
        buffer: SharedBuffer,
    ) -> Result<(), ServerError> {
        self.register((kind, number), AreaBacking::Shared(buffer))
    }

    /// Register an area served through the RW handler.
    pub fn register_callback_area(
        &self,
        kind: AreaKind,
        number: u16,
        size_bytes: usize,
    ) -> Result<(), ServerError> {
        self.register((kind, number), AreaBacking::Callback { size_bytes })
    }

    pub fn set_rw_handler(&self, handler: Arc<dyn RwAreaHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    pub fn set_event_sink(&self, sink: EventSink) {
        *self.shared.events.write() = Some(sink);
    }

    /// Bind the listener and start the accept thread.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.accept_thread.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let addr = format!(
            "{}:{}",
            self.shared.params.bind_address, self.shared.params.port
        );
        let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        self.local_port = Some(port);

        self.shared.run.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("s7-server".into())
            .spawn(move || accept_loop(shared, listener))
            .expect("spawning the accept thread");
        self.accept_thread = Some(handle);
        self.shared.emit(&ServerEvent::Started { port });
        Ok(())
    }

    /// Stop the listener and wait for every client thread to drain.
    pub fn stop(&mut self) {
        if self.accept_thread.is_none() {
            return;
        }
        self.shared.run.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        self.local_port = None;
        self.shared.emit(&ServerEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.accept_thread.is_some()
    }

    /// The actual bound port (differs from the configured one when that
    /// was 0).
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.load(Ordering::SeqCst)
    }

    /// Serve one already-parsed COTP payload without a socket. Test seam
    /// for the session logic.
    pub fn handle_payload(&self, session: &mut Session, payload: &[u8]) -> Option<Vec<u8>> {
        session.handle_frame(&self.shared, payload)
    }

    pub fn new_session(&self, client: u32) -> Session {
        Session::new(client, self.shared.params.pdu_size)
    }
}

impl Drop for S7Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut clients = Vec::new();
    while shared.run.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if shared.clients.load(Ordering::SeqCst) >= shared.params.max_clients {
                    shared.emit(&ServerEvent::ClientRejected { peer });
                    continue;
                }
                let client = shared.next_client.fetch_add(1, Ordering::SeqCst) + 1;
                shared.clients.fetch_add(1, Ordering::SeqCst);
                shared.emit(&ServerEvent::ClientConnected { client, peer });
                let shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name(format!("s7-client-{client}"))
                    .spawn(move || serve_client(shared, stream, client))
                    .expect("spawning a client thread");
                clients.push(handle);
            }
            Err(err) if would_block(&err) => thread::sleep(shared.params.work_interval),
            Err(err) => {
                debug!(target: "s7.server", %err, "accept_error");
                thread::sleep(shared.params.work_interval);
            }
        }
    }
    for handle in clients {
        let _ = handle.join();
    }
}

fn serve_client(shared: Arc<Shared>, mut stream: TcpStream, client: u32) {
    let _ = stream.set_read_timeout(Some(shared.params.work_interval));
    let _ = stream.set_write_timeout(Some(shared.params.send_timeout));
    let mut session = Session::new(client, shared.params.pdu_size);
    let mut last_activity = Instant::now();

    while shared.run.load(Ordering::Acquire) {
        match read_tpkt(&mut stream, shared.params.recv_timeout) {
            Ok(Some(payload)) => {
                last_activity = Instant::now();
                if let Some(response) = session.handle_frame(&shared, &payload)
                    && stream.write_all(&response).is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                if last_activity.elapsed() > shared.params.ping_timeout {
                    trace!(target: "s7.server", client, "client_ping_timeout");
                    break;
                }
            }
            Err(_) => break,
        }
    }
    shared.clients.fetch_sub(1, Ordering::SeqCst);
    shared.emit(&ServerEvent::ClientDisconnected { client });
}

/// Read one TPKT frame. `Ok(None)` on an idle poll timeout before the
/// first byte; errors on disconnect, malformed framing, or a body that
/// stalls past the receive timeout.
fn read_tpkt(stream: &mut TcpStream, recv_timeout: Duration) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let first = match stream.read(&mut header) {
        Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
        Ok(n) => n,
        Err(err) if would_block(&err) => return Ok(None),
        Err(err) => return Err(err),
    };
    let deadline = Instant::now() + recv_timeout;
    read_remainder(stream, &mut header[first..], deadline)?;
    let total = tpkt_total_len(&header)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
    let mut payload = vec![0u8; total - header.len()];
    read_remainder(stream, &mut payload, deadline)?;
    Ok(Some(payload))
}

fn read_remainder(stream: &mut TcpStream, buf: &mut [u8], deadline: Instant) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(err) if would_block(&err) => {
                if Instant::now() > deadline {
                    return Err(io::ErrorKind::TimedOut.into());
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

enum BackingRef {
    Shared(SharedBuffer),
    Callback { size_bytes: usize },
}

/// Per-connection protocol state.
pub struct Session {
    client: u32,
    connected: bool,
    pdu_size: u16,
}

impl Session {
    fn new(client: u32, pdu_size: u16) -> Self {
        Self {
            client,
            connected: false,
            pdu_size,
        }
    }

    /// Negotiated PDU size (the configured one until setup communication).
    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    fn handle_frame(&mut self, shared: &Shared, payload: &[u8]) -> Option<Vec<u8>> {
        match parse_cotp(payload) {
            Ok(CotpPdu::ConnectRequest { src_ref, params }) => {
                self.connected = true;
                trace!(target: "s7.server", client = self.client, src_ref, "cotp_connect");
                Some(tpkt_frame(&build_connect_confirm(src_ref, params)))
            }
            Ok(CotpPdu::Data { payload }) => {
                if !self.connected {
                    return None;
                }
                let job = match parse_s7_job(payload) {
                    Ok(job) => job,
                    Err(err) => {
                        debug!(target: "s7.server", client = self.client, %err, "bad_s7_pdu");
                        return None;
                    }
                };
                let ack = self.dispatch(shared, &job);
                Some(tpkt_frame(&cotp_data(&ack)))
            }
            Err(err) => {
                debug!(target: "s7.server", client = self.client, %err, "bad_cotp_pdu");
                None
            }
        }
    }

    fn dispatch(&mut self, shared: &Shared, job: &S7Job<'_>) -> Vec<u8> {
        match job.params.first() {
            Some(&FUNC_SETUP_COMMUNICATION) if job.params.len() >= 8 => self.setup(shared, job),
            Some(&FUNC_READ_VAR) => self.read_var(shared, job),
            Some(&FUNC_WRITE_VAR) => self.write_var(shared, job),
            _ => build_s7_ack(job.pdu_ref, (0x81, 0x04), &[], &[]),
        }
    }

    fn setup(&mut self, shared: &Shared, job: &S7Job<'_>) -> Vec<u8> {
        let requested = get_u16_be(job.params, 6);
        let negotiated = if requested == 0 {
            shared.params.pdu_size
        } else {
            requested.clamp(240, shared.params.pdu_size)
        };
        self.pdu_size = negotiated;
        trace!(
            target: "s7.server",
            client = self.client,
            requested,
            negotiated,
            "pdu_negotiated"
        );
        let mut params = [0u8; 8];
        params[0] = FUNC_SETUP_COMMUNICATION;
        params[1..6].copy_from_slice(&job.params[1..6]);
        params[6..8].copy_from_slice(&negotiated.to_be_bytes());
        build_s7_ack(job.pdu_ref, (0, 0), &params, &[])
    }

    fn parse_items(params: &[u8]) -> Option<Vec<ItemRequest>> {
        let count = *params.get(1)? as usize;
        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            let offset = 2 + i * ITEM_SPEC_LEN;
            let spec = params.get(offset..offset + ITEM_SPEC_LEN)?;
            items.push(parse_item(spec).ok()?);
        }
        Some(items)
    }

    fn lookup(shared: &Shared, item: &ItemRequest) -> Option<(AreaKind, u16, BackingRef)> {
        let kind = AreaKind::from_code(item.area_code)?;
        let number = if kind == AreaKind::Db {
            item.db_number
        } else {
            0
        };
        let areas = shared.areas.read();
        let backing = match areas.get(&(kind, number))? {
            AreaBacking::Shared(buffer) => BackingRef::Shared(buffer.clone()),
            AreaBacking::Callback { size_bytes } => BackingRef::Callback {
                size_bytes: *size_bytes,
            },
        };
        Some((kind, number, backing))
    }

    fn read_var(&mut self, shared: &Shared, job: &S7Job<'_>) -> Vec<u8> {
        let Some(items) = Self::parse_items(job.params) else {
            return build_s7_ack(job.pdu_ref, (0x83, 0x04), &[], &[]);
        };
        let mut data = Vec::new();
        let last = items.len().saturating_sub(1);
        for (i, item) in items.iter().enumerate() {
            let (ret, transport, length, payload) = self.read_item(shared, item);
            data.push(ret);
            if ret == RET_OK {
                data.push(transport);
                data.extend_from_slice(&length.to_be_bytes());
                data.extend_from_slice(&payload);
                if payload.len() % 2 == 1 && i != last {
                    data.push(0);
                }
            } else {
                data.extend_from_slice(&[0, 0, 0]);
            }
        }
        let params = [FUNC_READ_VAR, items.len() as u8];
        build_s7_ack(job.pdu_ref, (0, 0), &params, &data)
    }

    fn read_item(&self, shared: &Shared, item: &ItemRequest) -> (u8, u8, u16, Vec<u8>) {
        const EMPTY: (u8, u8, u16, Vec<u8>) = (RET_NO_OBJECT, 0, 0, Vec::new());

        let Some(bytes) = item.byte_len() else {
            return (RET_UNSUPPORTED, 0, 0, Vec::new());
        };
        let Some((kind, number, backing)) = Self::lookup(shared, item) else {
            return EMPTY;
        };
        let offset = item.byte_offset();
        if offset + bytes > backing_size(&backing) {
            return (RET_OUT_OF_RANGE, 0, 0, Vec::new());
        }

        let mut data = vec![0u8; bytes];
        match backing {
            BackingRef::Shared(buffer) => {
                let locked = buffer.lock();
                data.copy_from_slice(&locked[offset..offset + bytes]);
            }
            BackingRef::Callback { .. } => {
                let handler = shared.handler.read().clone();
                let Some(handler) = handler else {
                    return EMPTY;
                };
                let tag = RwTag {
                    kind,
                    db_number: number,
                    start: offset,
                    len: bytes,
                    bit: (item.transport == TS_BIT).then(|| item.bit()),
                };
                if handler.area_read(self.client, &tag, &mut data) != AccessStatus::Accept {
                    return EMPTY;
                }
            }
        }
        shared.emit(&ServerEvent::DataRead {
            client: self.client,
        });

        if item.transport == TS_BIT {
            let bit = (data[0] >> item.bit()) & 1;
            (RET_OK, DATA_TS_BIT, 1, vec![bit])
        } else {
            (RET_OK, DATA_TS_BYTE_BITS, (bytes * 8) as u16, data)
        }
    }

    fn write_var(&mut self, shared: &Shared, job: &S7Job<'_>) -> Vec<u8> {
        let Some(items) = Self::parse_items(job.params) else {
            return build_s7_ack(job.pdu_ref, (0x83, 0x04), &[], &[]);
        };
        let mut results = Vec::with_capacity(items.len());
        let mut cursor = 0usize;
        let last = items.len().saturating_sub(1);
        for (i, item) in items.iter().enumerate() {
            // Data item header: return code, transport size, length.
            let Some(header) = job.data.get(cursor..cursor + 4) else {
                results.push(RET_UNSUPPORTED);
                break;
            };
            let transport = header[1];
            let length = get_u16_be(header, 2);
            let Ok(payload_len) = data_item_payload_len(transport, length) else {
                results.push(RET_UNSUPPORTED);
                break;
            };
            let Some(payload) = job.data.get(cursor + 4..cursor + 4 + payload_len) else {
                results.push(RET_UNSUPPORTED);
                break;
            };
            cursor += 4 + payload_len;
            if payload_len % 2 == 1 && i != last {
                cursor += 1;
            }
            results.push(self.write_item(shared, item, transport, payload));
        }
        shared.emit(&ServerEvent::DataWrite {
            client: self.client,
        });
        let params = [FUNC_WRITE_VAR, items.len() as u8];
        build_s7_ack(job.pdu_ref, (0, 0), &params, &results)
    }

    fn write_item(
        &self,
        shared: &Shared,
        item: &ItemRequest,
        transport: u8,
        payload: &[u8],
    ) -> u8 {
        let Some(bytes) = item.byte_len() else {
            return RET_UNSUPPORTED;
        };
        let is_bit = item.transport == TS_BIT || transport == DATA_TS_BIT;
        if !is_bit && payload.len() < bytes {
            return RET_UNSUPPORTED;
        }
        let Some((kind, number, backing)) = Self::lookup(shared, item) else {
            return RET_NO_OBJECT;
        };
        let offset = item.byte_offset();
        if offset + bytes > backing_size(&backing) {
            return RET_OUT_OF_RANGE;
        }

        match backing {
            BackingRef::Shared(buffer) => {
                let mut locked = buffer.lock();
                if is_bit {
                    let mask = 1u8 << item.bit();
                    if payload.first().is_some_and(|b| b & 1 != 0) {
                        locked[offset] |= mask;
                    } else {
                        locked[offset] &= !mask;
                    }
                } else {
                    locked[offset..offset + bytes].copy_from_slice(&payload[..bytes]);
                }
                RET_OK
            }
            BackingRef::Callback { .. } => {
                let handler = shared.handler.read().clone();
                let Some(handler) = handler else {
                    return RET_NO_OBJECT;
                };
                let tag = RwTag {
                    kind,
                    db_number: number,
                    start: offset,
                    len: bytes,
                    bit: is_bit.then(|| item.bit()),
                };
                match handler.area_write(self.client, &tag, payload) {
                    AccessStatus::Accept => RET_OK,
                    AccessStatus::Reject => RET_NO_OBJECT,
                }
            }
        }
    }
}

fn backing_size(backing: &BackingRef) -> usize {
    match backing {
        BackingRef::Shared(buffer) => buffer.len(),
        BackingRef::Callback { size_bytes } => *size_bytes,
    }
}
