//! IEC 60870-5-104 server (controlled station)
//!
//! The server accepts up to `max_connections` clients. Each connection runs
//! two tasks: the I/O loop (frames, windows, timers) and a dispatcher that
//! serializes handler invocations so no two handlers run concurrently on
//! the same connection.
//!
//! Redundancy: at most one connection is *active* in single-redundancy mode
//! and dispatches spontaneous data. Spontaneous ASDUs submitted while no
//! connection is active are buffered (bounded, oldest dropped) and replayed
//! in submission order when a client activates data transfer.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::session::MasterConnection;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::asdu::{Asdu, AsduPayload};
use crate::common::{
    AsduDecodeError, CloseReason, ConnectionEvent, IecError, Result,
};
use crate::iec104::apci::{Apci, Apdu, Iec104Codec, UFrame};
use crate::iec104::transmission::{StopConfirm, TimerEvent, TransmissionState};
use crate::params::{ApciParameters, AppLayerParameters};
use crate::session::{dispatch_asdu, dispatch_raw, ConnectionHandle, ServerHandler};

/// How the server treats concurrent clients that activate data transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedundancyMode {
    /// A STARTDT from a new client deactivates the previously active one
    Single,
    /// Multiple clients may be active simultaneously
    Multi,
}

/// IEC-104 server configuration
#[derive(Debug, Clone)]
pub struct Iec104ServerConfig {
    /// Listen address, e.g. `0.0.0.0:2404`
    pub bind_address: String,
    /// Common address of this controlled station
    pub common_address: u16,
    /// Application layer octet sizes
    pub app_layer: AppLayerParameters,
    /// APCI window and timer constants
    pub apci: ApciParameters,
    /// Maximum simultaneously open client connections
    pub max_connections: usize,
    /// Redundancy group behavior
    pub redundancy: RedundancyMode,
    /// Spontaneous events buffered while no connection is active
    pub event_buffer_size: usize,
}

impl Default for Iec104ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2404".to_string(),
            common_address: 1,
            app_layer: AppLayerParameters::default(),
            apci: ApciParameters::default(),
            max_connections: 4,
            redundancy: RedundancyMode::Single,
            event_buffer_size: 256,
        }
    }
}

impl Iec104ServerConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address
    pub fn with_bind_address<S: Into<String>>(mut self, address: S) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Set the common address of this station
    pub fn with_common_address(mut self, common_address: u16) -> Self {
        self.common_address = common_address;
        self
    }

    /// Set the application layer parameters
    pub fn with_app_layer(mut self, params: AppLayerParameters) -> Self {
        self.app_layer = params;
        self
    }

    /// Set the APCI parameters
    pub fn with_apci(mut self, params: ApciParameters) -> Self {
        self.apci = params;
        self
    }

    /// Set the connection establishment timeout
    pub fn with_t0(mut self, t0: std::time::Duration) -> Self {
        self.apci.t0 = t0;
        self
    }

    /// Set the send/test timeout
    pub fn with_t1(mut self, t1: std::time::Duration) -> Self {
        self.apci.t1 = t1;
        self
    }

    /// Set the acknowledgment delay
    pub fn with_t2(mut self, t2: std::time::Duration) -> Self {
        self.apci.t2 = t2;
        self
    }

    /// Set the idle test period
    pub fn with_t3(mut self, t3: std::time::Duration) -> Self {
        self.apci.t3 = t3;
        self
    }

    /// Set the maximum number of open connections
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the redundancy mode
    pub fn with_redundancy(mut self, mode: RedundancyMode) -> Self {
        self.redundancy = mode;
        self
    }

    /// Set the spontaneous event buffer capacity
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        self.app_layer.validate()?;
        self.apci.validate()?;
        if self.max_connections == 0 {
            return Err(IecError::ConfigError(
                "max_connections must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct ConnEntry {
    id: u64,
    handle: ConnectionHandle,
    active: bool,
}

struct EventBuffer {
    queue: VecDeque<Asdu>,
    capacity: usize,
    dropped: u64,
}

impl EventBuffer {
    fn push(&mut self, asdu: Asdu) {
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
            warn!(dropped = self.dropped, "event buffer full, oldest dropped");
        }
        self.queue.push_back(asdu);
    }
}

struct ServerShared {
    config: Iec104ServerConfig,
    handler: Arc<dyn ServerHandler>,
    connections: Mutex<Vec<ConnEntry>>,
    buffer: Mutex<EventBuffer>,
    next_id: AtomicU64,
}

impl ServerShared {
    async fn register(&self, handle: ConnectionHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().await.push(ConnEntry {
            id,
            handle,
            active: false,
        });
        id
    }

    async fn unregister(&self, id: u64) {
        self.connections.lock().await.retain(|c| c.id != id);
    }

    async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Mark a connection active; in single-redundancy mode the previously
    /// active connection is deactivated but keeps its queued frames.
    /// Returns buffered spontaneous events for replay, in order.
    async fn activate(&self, id: u64) -> Vec<Asdu> {
        let mut conns = self.connections.lock().await;
        for entry in conns.iter_mut() {
            if entry.id == id {
                entry.active = true;
            } else if self.config.redundancy == RedundancyMode::Single && entry.active {
                debug!(old = entry.id, new = id, "redundancy switch-over");
                entry.active = false;
            }
        }
        drop(conns);
        let mut buffer = self.buffer.lock().await;
        buffer.queue.drain(..).collect()
    }

    async fn deactivate(&self, id: u64) {
        let mut conns = self.connections.lock().await;
        if let Some(entry) = conns.iter_mut().find(|c| c.id == id) {
            entry.active = false;
        }
    }

    async fn active_handle(&self) -> Option<ConnectionHandle> {
        self.connections
            .lock()
            .await
            .iter()
            .find(|c| c.active && c.handle.is_ready())
            .map(|c| c.handle.clone())
    }

    async fn ready_handles(&self) -> Vec<ConnectionHandle> {
        self.connections
            .lock()
            .await
            .iter()
            .filter(|c| c.handle.is_ready())
            .map(|c| c.handle.clone())
            .collect()
    }
}

struct ServerRunning {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// IEC-104 server implementation
pub struct Iec104Server {
    shared: Arc<ServerShared>,
    running: Option<ServerRunning>,
}

impl Iec104Server {
    /// Create a new IEC-104 server with the handler receiving all requests
    pub fn new(config: Iec104ServerConfig, handler: Arc<dyn ServerHandler>) -> Self {
        let buffer = EventBuffer {
            queue: VecDeque::new(),
            capacity: config.event_buffer_size.max(1),
            dropped: 0,
        };
        Self {
            shared: Arc::new(ServerShared {
                config,
                handler,
                connections: Mutex::new(Vec::new()),
                buffer: Mutex::new(buffer),
                next_id: AtomicU64::new(1),
            }),
            running: None,
        }
    }

    /// Change the listen address; only effective before `start`
    pub fn set_local_address<S: Into<String>>(&mut self, address: S) -> Result<()> {
        let shared = Arc::get_mut(&mut self.shared)
            .ok_or_else(|| IecError::InvalidArgument("server already started".to_string()))?;
        shared.config.bind_address = address.into();
        Ok(())
    }

    /// Change the connection limit; only effective before `start`
    pub fn set_max_open_connections(&mut self, max: usize) -> Result<()> {
        let shared = Arc::get_mut(&mut self.shared)
            .ok_or_else(|| IecError::InvalidArgument("server already started".to_string()))?;
        shared.config.max_connections = max;
        Ok(())
    }

    /// Bind the listener and start accepting clients
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        self.shared.config.validate()?;
        let listener = TcpListener::bind(&self.shared.config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!("IEC-104 server listening on {local_addr}");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(self.shared.clone(), listener, cancel.clone()));
        self.running = Some(ServerRunning {
            cancel,
            task,
            local_addr,
        });
        Ok(())
    }

    /// The bound listen address (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Stop accepting and close every connection
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            let _ = running.task.await;
            // connection tasks observe their child tokens and unregister
            info!("IEC-104 server stopped");
        }
    }

    /// Number of currently open client connections
    pub async fn connection_count(&self) -> usize {
        self.shared.connection_count().await
    }

    /// Queue a spontaneous ASDU toward the active connection, or into the
    /// bounded replay buffer while no connection is active
    pub async fn enqueue_spontaneous(&self, asdu: Asdu) -> Result<()> {
        if let Some(handle) = self.shared.active_handle().await {
            match handle.send_payload(AsduPayload::Typed(asdu.clone())).await {
                Ok(()) => return Ok(()),
                Err(IecError::NotConnected) => {
                    debug!("active connection went away, buffering event");
                }
                Err(e) => return Err(e),
            }
        }
        self.shared.buffer.lock().await.push(asdu);
        Ok(())
    }

    /// Send an ASDU to every connection with active data transfer
    pub async fn broadcast_asdu(&self, asdu: Asdu) -> Result<()> {
        for handle in self.shared.ready_handles().await {
            if let Err(e) = handle.send_payload(AsduPayload::Typed(asdu.clone())).await {
                warn!(peer = ?handle.peer_deref(), "broadcast failed: {e}");
            }
        }
        Ok(())
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if shared.connection_count().await >= shared.config.max_connections {
                        warn!("rejecting {peer}: connection limit reached");
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("set_nodelay failed for {peer}: {e}");
                    }
                    info!("client connected: {peer}");
                    tokio::spawn(connection_task(
                        shared.clone(),
                        stream,
                        peer,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
}

/// Work items serialized through the per-connection dispatcher
enum Inbound {
    Asdu(Asdu),
    Raw {
        bytes: Vec<u8>,
        error: AsduDecodeError,
    },
    Event(ConnectionEvent),
}

async fn dispatch_task(
    shared: Arc<ServerShared>,
    handle: ConnectionHandle,
    mut rx: mpsc::Receiver<Inbound>,
) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            Inbound::Asdu(asdu) => {
                dispatch_asdu(
                    shared.handler.as_ref(),
                    &handle,
                    asdu,
                    shared.config.common_address,
                )
                .await
            }
            Inbound::Raw { bytes, error } => {
                dispatch_raw(shared.handler.as_ref(), &handle, bytes, error).await
            }
            Inbound::Event(event) => {
                shared
                    .handler
                    .handle_connection_event(handle.peer_deref(), &event)
                    .await;
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(IecError::NotConnected) => break,
            Err(e) => warn!("handler dispatch failed: {e}"),
        }
    }
}

async fn connection_task(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let params = shared.config.app_layer;
    let (data_tx, data_rx) = mpsc::channel(shared.config.apci.k as usize);
    let handle = ConnectionHandle::new(data_tx, params, Some(peer.to_string()), cancel.clone());
    let id = shared.register(handle.clone()).await;

    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let dispatcher = tokio::spawn(dispatch_task(shared.clone(), handle.clone(), inbound_rx));

    let tap_handler = shared.handler.clone();
    let codec = Iec104Codec::new(params).with_raw_tap(Arc::new(move |direction, bytes| {
        tap_handler.handle_raw_message(direction, bytes);
    }));
    let framed = Framed::new(stream, codec);
    let state = TransmissionState::new(shared.config.apci, Instant::now());

    let _ = inbound_tx.send(Inbound::Event(ConnectionEvent::Opened)).await;

    let reason = server_loop(
        framed,
        state,
        data_rx,
        &inbound_tx,
        &shared,
        &handle,
        id,
        &cancel,
    )
    .await;

    handle.set_ready(false);
    cancel.cancel();
    shared.deactivate(id).await;
    let _ = inbound_tx
        .send(Inbound::Event(ConnectionEvent::Closed(reason)))
        .await;
    drop(inbound_tx);
    let _ = dispatcher.await;
    shared.unregister(id).await;
    info!("client disconnected: {peer} ({reason})");
}

/// Next I-frame payload: replayed buffer first, then the live queue
async fn next_outbound(
    replay: &mut VecDeque<Asdu>,
    data_rx: &mut mpsc::Receiver<AsduPayload>,
) -> Option<AsduPayload> {
    if let Some(asdu) = replay.pop_front() {
        return Some(AsduPayload::Typed(asdu));
    }
    data_rx.recv().await
}

#[allow(clippy::too_many_arguments)]
async fn server_loop(
    mut framed: Framed<TcpStream, Iec104Codec>,
    mut state: TransmissionState,
    mut data_rx: mpsc::Receiver<AsduPayload>,
    inbound: &mpsc::Sender<Inbound>,
    shared: &Arc<ServerShared>,
    handle: &ConnectionHandle,
    id: u64,
    cancel: &CancellationToken,
) -> CloseReason {
    let mut replay: VecDeque<Asdu> = VecDeque::new();

    'conn: loop {
        // resolve elapsed timers
        loop {
            let now = Instant::now();
            match state.on_timer(now) {
                Some(TimerEvent::T1Expired) => break 'conn CloseReason::T1Expired,
                Some(TimerEvent::AckDue) => {
                    let nr = state.confirm_receive();
                    state.on_frame_sent(now);
                    if framed.send(Apdu::new_s_frame(nr)).await.is_err() {
                        break 'conn CloseReason::IoError;
                    }
                }
                Some(TimerEvent::SendTestAct) => {
                    state.on_frame_sent(now);
                    if framed.send(Apdu::new_u_frame(UFrame::TestFrAct)).await.is_err() {
                        break 'conn CloseReason::IoError;
                    }
                }
                None => break,
            }
        }

        // a deferred STOPDT con becomes due once the ack count caught up
        if state.take_pending_stop_con() {
            let now = Instant::now();
            if state.unconfirmed_received() > 0 {
                let nr = state.confirm_receive();
                if framed.send(Apdu::new_s_frame(nr)).await.is_err() {
                    break 'conn CloseReason::IoError;
                }
            }
            state.on_frame_sent(now);
            if framed.send(Apdu::new_u_frame(UFrame::StopDtCon)).await.is_err() {
                break 'conn CloseReason::IoError;
            }
            handle.set_ready(false);
            shared.deactivate(id).await;
            let _ = inbound.try_send(Inbound::Event(ConnectionEvent::Deactivated));
        }

        let deadline = tokio::time::Instant::from_std(state.next_deadline());

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break 'conn CloseReason::LocalStop,

            frame = framed.next() => {
                let now = Instant::now();
                match frame {
                    None => break 'conn CloseReason::RemoteClosed,
                    Some(Err(IecError::IoError(e))) => {
                        warn!("stream error: {e}");
                        break 'conn CloseReason::IoError;
                    }
                    Some(Err(e)) => {
                        warn!("framing error: {e}");
                        break 'conn CloseReason::FramingError;
                    }
                    Some(Ok(apdu)) => {
                        match handle_apdu(
                            &mut framed, &mut state, &mut replay, inbound, shared, handle, id, apdu, now,
                        ).await {
                            Ok(()) => {}
                            Err(reason) => break 'conn reason,
                        }
                    }
                }
            }

            Some(payload) = next_outbound(&mut replay, &mut data_rx), if state.can_send_i() => {
                let now = Instant::now();
                let (ns, nr) = state.on_i_sent(now);
                let apdu = Apdu { apci: Apci::IFrame { send_seq: ns, recv_seq: nr }, asdu: Some(payload) };
                if framed.send(apdu).await.is_err() {
                    break 'conn CloseReason::IoError;
                }
            }

            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_apdu(
    framed: &mut Framed<TcpStream, Iec104Codec>,
    state: &mut TransmissionState,
    replay: &mut VecDeque<Asdu>,
    inbound: &mpsc::Sender<Inbound>,
    shared: &Arc<ServerShared>,
    handle: &ConnectionHandle,
    id: u64,
    apdu: Apdu,
    now: Instant,
) -> std::result::Result<(), CloseReason> {
    match apdu.apci {
        Apci::IFrame { send_seq, recv_seq } => {
            state.on_i_received(send_seq, recv_seq, now)?;
            let item = match apdu.asdu {
                Some(AsduPayload::Typed(asdu)) => Inbound::Asdu(asdu),
                Some(AsduPayload::Raw { bytes, error }) => Inbound::Raw { bytes, error },
                None => return Ok(()),
            };
            // the dispatcher serializes handler calls; a stalled handler
            // backing up this queue is a resource failure, not a wait
            if inbound.try_send(item).is_err() {
                warn!("dispatch queue overflow");
                return Err(CloseReason::ResourceExhausted);
            }
            if state.ack_due() {
                let nr = state.confirm_receive();
                state.on_frame_sent(now);
                framed
                    .send(Apdu::new_s_frame(nr))
                    .await
                    .map_err(|_| CloseReason::IoError)?;
            }
        }
        Apci::SFrame { recv_seq } => {
            state.on_s_received(recv_seq, now)?;
        }
        Apci::UFrame(code) => match code {
            UFrame::StartDtAct => {
                state.on_start_act_received(now);
                state.on_frame_sent(now);
                framed
                    .send(Apdu::new_u_frame(UFrame::StartDtCon))
                    .await
                    .map_err(|_| CloseReason::IoError)?;
                handle.set_ready(true);
                let buffered = shared.activate(id).await;
                if !buffered.is_empty() {
                    debug!(count = buffered.len(), "replaying buffered events");
                    replay.extend(buffered);
                }
                let _ = inbound.try_send(Inbound::Event(ConnectionEvent::Activated));
            }
            UFrame::StopDtAct => match state.on_stop_act_received(now) {
                StopConfirm::Now => {
                    if state.unconfirmed_received() > 0 {
                        let nr = state.confirm_receive();
                        framed
                            .send(Apdu::new_s_frame(nr))
                            .await
                            .map_err(|_| CloseReason::IoError)?;
                    }
                    state.on_frame_sent(now);
                    framed
                        .send(Apdu::new_u_frame(UFrame::StopDtCon))
                        .await
                        .map_err(|_| CloseReason::IoError)?;
                    handle.set_ready(false);
                    shared.deactivate(id).await;
                    let _ = inbound.try_send(Inbound::Event(ConnectionEvent::Deactivated));
                }
                StopConfirm::Deferred => {
                    debug!("STOPDT con deferred until outstanding I-frames are acked");
                }
            },
            UFrame::TestFrAct => {
                state.on_test_act_received(now);
                state.on_frame_sent(now);
                framed
                    .send(Apdu::new_u_frame(UFrame::TestFrCon))
                    .await
                    .map_err(|_| CloseReason::IoError)?;
                let _ = inbound.try_send(Inbound::Event(ConnectionEvent::TestFrameReceived));
            }
            UFrame::TestFrCon => {
                state.on_test_con_received(now);
            }
            UFrame::StartDtCon | UFrame::StopDtCon => {
                warn!("confirmation U-frame received by controlled station");
                return Err(CloseReason::UnexpectedConfirmation);
            }
        },
    }
    Ok(())
}
