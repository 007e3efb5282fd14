//! IEC 60870-5-104 client (controlling station)
//!
//! The client owns one TCP connection to a server. All protocol work runs
//! on a single spawned I/O task per connection: one `select` multiplexes
//! socket frames, the outbound queue and the earliest t1/t2/t3 deadline.
//! Received ASDUs and connection events are delivered through the
//! subscription channel.

use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::asdu::{Asdu, AsduPayload, Cot, TypeId};
use crate::common::{
    CauseOfTransmission, CloseReason, ConnectionEvent, IecError, Result,
};
use crate::iec104::apci::{Apci, Apdu, Iec104Codec, UFrame};
use crate::iec104::transmission::{TimerEvent, TransmissionState};
use crate::information_objects::InformationObject;
use crate::params::{ApciParameters, AppLayerParameters};
use crate::session::MasterEvent;
use crate::time::Cp56Time2a;

/// IEC-104 client configuration
#[derive(Debug, Clone)]
pub struct Iec104ClientConfig {
    /// Server hostname or IP address
    pub host: String,
    /// Server TCP port
    pub port: u16,
    /// Maximum connection attempts
    pub max_retries: u32,
    /// Originator address placed into outgoing commands
    pub originator_address: u8,
    /// Application layer octet sizes
    pub app_layer: AppLayerParameters,
    /// APCI window and timer constants
    pub apci: ApciParameters,
    /// Capacity of the event subscription channel
    pub event_queue_size: usize,
    /// Report raw frames through the event channel
    pub raw_messages: bool,
}

impl Default for Iec104ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2404,
            max_retries: 3,
            originator_address: 0,
            app_layer: AppLayerParameters::default(),
            apci: ApciParameters::default(),
            event_queue_size: 256,
            raw_messages: false,
        }
    }
}

impl Iec104ClientConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the maximum connection attempts
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the originator address
    pub fn originator_address(mut self, originator: u8) -> Self {
        self.originator_address = originator;
        self
    }

    /// Set the application layer parameters
    pub fn app_layer(mut self, params: AppLayerParameters) -> Self {
        self.app_layer = params;
        self
    }

    /// Set the APCI parameters
    pub fn apci(mut self, params: ApciParameters) -> Self {
        self.apci = params;
        self
    }

    /// Report raw frames through the event channel
    pub fn raw_messages(mut self, enabled: bool) -> Self {
        self.raw_messages = enabled;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<Self> {
        self.app_layer.validate()?;
        self.apci.validate()?;
        if self.event_queue_size == 0 {
            return Err(IecError::ConfigError(
                "event_queue_size must be non-zero".to_string(),
            ));
        }
        Ok(self)
    }
}

enum CtrlCommand {
    StartDt(oneshot::Sender<Result<()>>),
    StopDt(oneshot::Sender<Result<()>>),
}

struct Running {
    data_tx: mpsc::Sender<AsduPayload>,
    ctrl_tx: mpsc::Sender<CtrlCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// IEC-104 client implementation
pub struct Iec104Client {
    config: Iec104ClientConfig,
    events_tx: mpsc::Sender<MasterEvent>,
    events_rx: Option<mpsc::Receiver<MasterEvent>>,
    running: Option<Running>,
}

impl Iec104Client {
    /// Create a new IEC-104 client
    pub fn new(config: Iec104ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_size);
        Self {
            config,
            events_tx,
            events_rx: Some(events_rx),
            running: None,
        }
    }

    /// Take the event subscription. ASDUs and connection events of every
    /// subsequent connection are delivered here.
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<MasterEvent>> {
        self.events_rx.take()
    }

    /// Whether an I/O task is currently attached
    pub fn is_connected(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.task.is_finished())
            .unwrap_or(false)
    }

    /// Connect to the configured server, retrying up to `max_retries`
    /// attempts bounded by t0 each
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let address = format!("{}:{}", self.config.host, self.config.port);
        let mut retries = 0;
        let mut last_error = String::new();

        while retries < self.config.max_retries {
            debug!("Connecting to IEC-104 server at {address}");
            match tokio::time::timeout(self.config.apci.t0, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => {
                    info!("Connected to IEC-104 server at {address}");
                    stream.set_nodelay(true)?;
                    return self.attach_transport(stream).await;
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!("Failed to connect to IEC-104 server: {last_error}");
                }
                Err(_) => {
                    last_error = "connection attempt timed out (t0)".to_string();
                    warn!("Connection to IEC-104 server timed out");
                }
            }
            retries += 1;
            if retries < self.config.max_retries {
                sleep(std::time::Duration::from_secs(1)).await;
            }
        }

        Err(IecError::ConnectionError(format!(
            "Failed to connect after {} retries: {}",
            self.config.max_retries, last_error
        )))
    }

    /// Run the protocol over an established byte stream. This is the seam
    /// where a TLS stream or an in-memory test transport drops in.
    pub async fn attach_transport<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_connected() {
            return Err(IecError::InvalidArgument(
                "client already connected".to_string(),
            ));
        }

        let mut codec = Iec104Codec::new(self.config.app_layer);
        if self.config.raw_messages {
            let tap_tx = self.events_tx.clone();
            codec = codec.with_raw_tap(std::sync::Arc::new(move |direction, bytes| {
                let _ = tap_tx.try_send(MasterEvent::RawMessage {
                    direction,
                    bytes: bytes.to_vec(),
                });
            }));
        }
        let framed = Framed::new(stream, codec);

        let (data_tx, data_rx) = mpsc::channel(self.config.apci.k as usize);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let state = TransmissionState::new(self.config.apci, Instant::now());

        let _ = self.events_tx.try_send(MasterEvent::Connection(ConnectionEvent::Opened));

        let task = tokio::spawn(client_loop(
            framed,
            state,
            data_rx,
            ctrl_rx,
            self.events_tx.clone(),
            cancel.clone(),
        ));

        self.running = Some(Running {
            data_tx,
            ctrl_tx,
            cancel,
            task,
        });
        Ok(())
    }

    fn running(&self) -> Result<&Running> {
        self.running
            .as_ref()
            .filter(|r| !r.task.is_finished())
            .ok_or(IecError::NotConnected)
    }

    /// Activate data transfer (STARTDT act) and wait for the confirmation
    pub async fn start_dt(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.running()?
            .ctrl_tx
            .send(CtrlCommand::StartDt(tx))
            .await
            .map_err(|_| IecError::NotConnected)?;
        rx.await.map_err(|_| IecError::NotConnected)?
    }

    /// Deactivate data transfer (STOPDT act) and wait for the confirmation
    pub async fn stop_dt(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.running()?
            .ctrl_tx
            .send(CtrlCommand::StopDt(tx))
            .await
            .map_err(|_| IecError::NotConnected)?;
        rx.await.map_err(|_| IecError::NotConnected)?
    }

    /// Queue an ASDU, waiting while the transport window is full
    pub async fn send_asdu(&self, asdu: Asdu) -> Result<()> {
        self.running()?
            .data_tx
            .send(AsduPayload::Typed(asdu))
            .await
            .map_err(|_| IecError::NotConnected)
    }

    /// Queue an ASDU without waiting
    pub fn try_send_asdu(&self, asdu: Asdu) -> Result<()> {
        self.running()?
            .data_tx
            .try_send(AsduPayload::Typed(asdu))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => IecError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => IecError::NotConnected,
            })
    }

    fn command_asdu(
        &self,
        type_id: TypeId,
        cause: CauseOfTransmission,
        common_address: u16,
        object: InformationObject,
    ) -> Result<Asdu> {
        let mut asdu = Asdu::new(self.config.app_layer, type_id, Cot::new(cause), common_address)
            .with_originator(self.config.originator_address);
        asdu.add_object(object)?;
        Ok(asdu)
    }

    /// Station or group interrogation (C_IC_NA_1, QOI 20 = station)
    pub async fn general_interrogation(&self, common_address: u16, qualifier: u8) -> Result<()> {
        let asdu = self.command_asdu(
            TypeId::InterrogationCommand,
            CauseOfTransmission::Activation,
            common_address,
            InformationObject::Interrogation {
                address: 0,
                qualifier,
            },
        )?;
        self.send_asdu(asdu).await
    }

    /// Counter interrogation (C_CI_NA_1)
    pub async fn counter_interrogation(&self, common_address: u16, qualifier: u8) -> Result<()> {
        let asdu = self.command_asdu(
            TypeId::CounterInterrogationCommand,
            CauseOfTransmission::Activation,
            common_address,
            InformationObject::CounterInterrogation {
                address: 0,
                qualifier,
            },
        )?;
        self.send_asdu(asdu).await
    }

    /// Read a single information object (C_RD_NA_1)
    pub async fn read_command(&self, common_address: u16, address: u32) -> Result<()> {
        let asdu = self.command_asdu(
            TypeId::ReadCommand,
            CauseOfTransmission::Request,
            common_address,
            InformationObject::Read { address },
        )?;
        self.send_asdu(asdu).await
    }

    /// Synchronize the remote clock (C_CS_NA_1)
    pub async fn clock_sync(&self, common_address: u16, time: Cp56Time2a) -> Result<()> {
        let asdu = self.command_asdu(
            TypeId::ClockSyncCommand,
            CauseOfTransmission::Activation,
            common_address,
            InformationObject::ClockSync {
                address: 0,
                timestamp: time,
            },
        )?;
        self.send_asdu(asdu).await
    }

    /// Application level test command (C_TS_NA_1)
    pub async fn test_command(&self, common_address: u16) -> Result<()> {
        let asdu = self.command_asdu(
            TypeId::TestCommand,
            CauseOfTransmission::Activation,
            common_address,
            InformationObject::TestCommand { address: 0 },
        )?;
        self.send_asdu(asdu).await
    }

    /// Stop data transfer if active and close the connection
    pub async fn disconnect(&mut self) {
        if let Some(running) = self.running.take() {
            // best effort STOPDT before closing, bounded by t1
            let (tx, rx) = oneshot::channel();
            if running.ctrl_tx.send(CtrlCommand::StopDt(tx)).await.is_ok() {
                let _ = tokio::time::timeout(self.config.apci.t1, rx).await;
            }
            running.cancel.cancel();
            let _ = running.task.await;
            info!("IEC-104 client disconnected");
        }
    }
}

struct PendingReplies {
    start: Option<oneshot::Sender<Result<()>>>,
    stop: Option<oneshot::Sender<Result<()>>>,
}

impl PendingReplies {
    fn fail_all(&mut self, reason: CloseReason) {
        for slot in [self.start.take(), self.stop.take()].into_iter().flatten() {
            let _ = slot.send(Err(IecError::ConnectionError(reason.to_string())));
        }
    }
}

async fn client_loop<S>(
    mut framed: Framed<S, Iec104Codec>,
    mut state: TransmissionState,
    mut data_rx: mpsc::Receiver<AsduPayload>,
    mut ctrl_rx: mpsc::Receiver<CtrlCommand>,
    events: mpsc::Sender<MasterEvent>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut pending = PendingReplies {
        start: None,
        stop: None,
    };

    let close_reason = 'conn: loop {
        // resolve elapsed timers before sleeping again
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
                    debug!("idle t3 elapsed, sending TESTFR act");
                    state.on_frame_sent(now);
                    if framed.send(Apdu::new_u_frame(UFrame::TestFrAct)).await.is_err() {
                        break 'conn CloseReason::IoError;
                    }
                }
                None => break,
            }
        }
        let deadline = tokio::time::Instant::from_std(state.next_deadline());

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                break 'conn CloseReason::LocalStop;
            }

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
                        match handle_apdu(&mut framed, &mut state, &mut pending, &events, apdu, now).await {
                            Ok(()) => {}
                            Err(reason) => break 'conn reason,
                        }
                    }
                }
            }

            Some(payload) = data_rx.recv(), if state.can_send_i() => {
                let now = Instant::now();
                let (ns, nr) = state.on_i_sent(now);
                let apdu = Apdu { apci: Apci::IFrame { send_seq: ns, recv_seq: nr }, asdu: Some(payload) };
                if framed.send(apdu).await.is_err() {
                    break 'conn CloseReason::IoError;
                }
            }

            Some(cmd) = ctrl_rx.recv() => {
                let now = Instant::now();
                match cmd {
                    CtrlCommand::StartDt(reply) => {
                        state.on_start_act_sent(now);
                        pending.start = Some(reply);
                        if framed.send(Apdu::new_u_frame(UFrame::StartDtAct)).await.is_err() {
                            break 'conn CloseReason::IoError;
                        }
                    }
                    CtrlCommand::StopDt(reply) => {
                        state.on_stop_act_sent(now);
                        pending.stop = Some(reply);
                        if framed.send(Apdu::new_u_frame(UFrame::StopDtAct)).await.is_err() {
                            break 'conn CloseReason::IoError;
                        }
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline) => {}
        }
    };

    pending.fail_all(close_reason);
    let _ = framed.close().await;
    if events
        .try_send(MasterEvent::Connection(ConnectionEvent::Closed(close_reason)))
        .is_err()
    {
        warn!("event queue full, close event dropped");
    }
    debug!("client connection closed: {close_reason}");
}

async fn handle_apdu<S>(
    framed: &mut Framed<S, Iec104Codec>,
    state: &mut TransmissionState,
    pending: &mut PendingReplies,
    events: &mpsc::Sender<MasterEvent>,
    apdu: Apdu,
    now: Instant,
) -> std::result::Result<(), CloseReason>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match apdu.apci {
        Apci::IFrame { send_seq, recv_seq } => {
            state.on_i_received(send_seq, recv_seq, now)?;
            match apdu.asdu {
                Some(AsduPayload::Typed(asdu)) => {
                    if events.try_send(MasterEvent::Asdu(asdu)).is_err() {
                        warn!("event queue full, dropping received ASDU");
                    }
                }
                Some(AsduPayload::Raw { error, .. }) => {
                    warn!(?error, "received undecodable ASDU");
                }
                None => {}
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
            UFrame::StartDtCon => {
                state.on_start_con_received(now)?;
                if let Some(reply) = pending.start.take() {
                    let _ = reply.send(Ok(()));
                }
                let _ = events.try_send(MasterEvent::Connection(ConnectionEvent::Activated));
            }
            UFrame::StopDtCon => {
                state.on_stop_con_received(now)?;
                if let Some(reply) = pending.stop.take() {
                    let _ = reply.send(Ok(()));
                }
                let _ = events.try_send(MasterEvent::Connection(ConnectionEvent::Deactivated));
            }
            UFrame::TestFrAct => {
                state.on_test_act_received(now);
                state.on_frame_sent(now);
                framed
                    .send(Apdu::new_u_frame(UFrame::TestFrCon))
                    .await
                    .map_err(|_| CloseReason::IoError)?;
                let _ = events.try_send(MasterEvent::Connection(ConnectionEvent::TestFrameReceived));
            }
            UFrame::TestFrCon => {
                state.on_test_con_received(now);
            }
            UFrame::StartDtAct | UFrame::StopDtAct => {
                warn!("activation U-frame received by controlling station");
                return Err(CloseReason::UnexpectedConfirmation);
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_validates() {
        let config = Iec104ClientConfig::new()
            .host("192.168.1.100")
            .port(2404)
            .max_retries(5)
            .originator_address(3)
            .build()
            .unwrap();
        assert_eq!(config.host, "192.168.1.100");
        assert_eq!(config.max_retries, 5);

        let mut bad = Iec104ClientConfig::new();
        bad.apci.w = bad.apci.k + 1;
        assert!(bad.build().is_err());
    }

    #[tokio::test]
    async fn calls_require_connection() {
        let client = Iec104Client::new(Iec104ClientConfig::default());
        assert!(matches!(
            client.try_send_asdu(
                Asdu::new(
                    AppLayerParameters::default(),
                    TypeId::TestCommand,
                    Cot::new(CauseOfTransmission::Activation),
                    1,
                )
            ),
            Err(IecError::NotConnected)
        ));
        assert!(matches!(client.start_dt().await, Err(IecError::NotConnected)));
    }
}
