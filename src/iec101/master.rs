//! IEC 60870-5-101 master (primary station)
//!
//! In unbalanced mode one master polls the configured slaves round-robin
//! over a shared half-duplex line: at most one link service is outstanding
//! at any time. Class 2 is polled cyclically; class 1 is fetched whenever a
//! secondary raises ACD; commands travel as confirmed user data.
//!
//! In balanced mode the master talks to a single peer and is additionally a
//! secondary station: it confirms the peer's user data and surfaces it
//! through the same event stream.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::asdu::{Asdu, Cot, TypeId};
use crate::common::{
    CauseOfTransmission, CloseReason, ConnectionEvent, IecError, Result,
};
use crate::iec101::ft12::{
    Ft12Codec, Ft12Frame, LinkControl, PrimaryFunction, SecondaryFunction,
};
use crate::iec101::link::{PrimaryAction, PrimaryEvent, PrimaryLink, SecondaryDecision, SecondaryLink};
use crate::information_objects::InformationObject;
use crate::params::{AppLayerParameters, LinkAddrSize, LinkLayerParameters, LinkMode};
use crate::session::MasterEvent;
use crate::time::Cp56Time2a;
use crate::transport::{open_serial, SerialConfig, Transport};

/// IEC-101 master configuration
#[derive(Debug, Clone)]
pub struct Iec101MasterConfig {
    /// Link layer constants
    pub link: LinkLayerParameters,
    /// Application layer octet sizes
    pub app_layer: AppLayerParameters,
    /// Originator address placed into outgoing commands
    pub originator_address: u8,
    /// Class 2 poll cadence per slave
    pub poll_interval: Duration,
    /// DIR bit on transmitted frames (balanced mode, station A side)
    pub dir: bool,
    /// Capacity of the event subscription channel
    pub event_queue_size: usize,
}

impl Default for Iec101MasterConfig {
    fn default() -> Self {
        Self {
            link: LinkLayerParameters::default(),
            app_layer: AppLayerParameters::default(),
            originator_address: 0,
            poll_interval: Duration::from_millis(500),
            dir: false,
            event_queue_size: 256,
        }
    }
}

impl Iec101MasterConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the link layer parameters
    pub fn link(mut self, params: LinkLayerParameters) -> Self {
        self.link = params;
        self
    }

    /// Set the application layer parameters
    pub fn app_layer(mut self, params: AppLayerParameters) -> Self {
        self.app_layer = params;
        self
    }

    /// Set the class 2 poll cadence
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the originator address
    pub fn originator_address(mut self, originator: u8) -> Self {
        self.originator_address = originator;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<Self> {
        self.link.validate()?;
        self.app_layer.validate()?;
        if self.poll_interval.is_zero() {
            return Err(IecError::ConfigError(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(self)
    }
}

enum MasterCmd {
    AddSlave(u16),
    SendConfirmed { address: u16, data: Vec<u8> },
    Broadcast { data: Vec<u8> },
}

struct Running {
    cmd_tx: mpsc::Sender<MasterCmd>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// IEC-101 master implementation
pub struct Iec101Master {
    config: Iec101MasterConfig,
    slaves: Vec<u16>,
    events_tx: mpsc::Sender<MasterEvent>,
    events_rx: Option<mpsc::Receiver<MasterEvent>>,
    running: Option<Running>,
}

impl Iec101Master {
    /// Create a new IEC-101 master
    pub fn new(config: Iec101MasterConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_size);
        Self {
            config,
            slaves: Vec::new(),
            events_tx,
            events_rx: Some(events_rx),
            running: None,
        }
    }

    /// Take the event subscription
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<MasterEvent>> {
        self.events_rx.take()
    }

    /// Register a slave link address (the single peer in balanced mode)
    pub async fn add_slave(&mut self, address: u16) -> Result<()> {
        if let Some(running) = &self.running {
            running
                .cmd_tx
                .send(MasterCmd::AddSlave(address))
                .await
                .map_err(|_| IecError::NotConnected)?;
        } else if !self.slaves.contains(&address) {
            self.slaves.push(address);
        }
        Ok(())
    }

    /// Start the master over an established byte stream
    pub fn start<S>(&mut self, transport: S) -> Result<()>
    where
        S: Transport + 'static,
    {
        if self.running.is_some() {
            return Err(IecError::InvalidArgument(
                "master already started".to_string(),
            ));
        }
        if self.config.link.mode == LinkMode::Balanced && self.slaves.len() > 1 {
            return Err(IecError::ConfigError(
                "balanced mode links exactly one peer".to_string(),
            ));
        }

        let framed = Framed::new(transport, Ft12Codec::new(self.config.link));
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(master_loop(
            framed,
            self.config.clone(),
            self.slaves.clone(),
            cmd_rx,
            self.events_tx.clone(),
            cancel.clone(),
        ));
        self.running = Some(Running {
            cmd_tx,
            cancel,
            task,
        });
        Ok(())
    }

    /// Open the serial port and start the master on it
    pub fn start_serial(&mut self, path: &str, serial: &SerialConfig) -> Result<()> {
        let stream = open_serial(path, serial)?;
        info!("IEC-101 master on serial port {path}");
        self.start(stream)
    }

    fn running(&self) -> Result<&Running> {
        self.running
            .as_ref()
            .filter(|r| !r.task.is_finished())
            .ok_or(IecError::NotConnected)
    }

    /// Queue an ASDU as confirmed user data toward one slave
    pub async fn send_asdu(&self, address: u16, asdu: Asdu) -> Result<()> {
        let data = asdu.encode()?;
        self.running()?
            .cmd_tx
            .send(MasterCmd::SendConfirmed { address, data })
            .await
            .map_err(|_| IecError::NotConnected)
    }

    /// Send an ASDU to the broadcast link address, unconfirmed
    pub async fn broadcast_asdu(&self, asdu: Asdu) -> Result<()> {
        let data = asdu.encode()?;
        self.running()?
            .cmd_tx
            .send(MasterCmd::Broadcast { data })
            .await
            .map_err(|_| IecError::NotConnected)
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

    /// Station or group interrogation toward one slave
    pub async fn general_interrogation(
        &self,
        link_address: u16,
        common_address: u16,
        qualifier: u8,
    ) -> Result<()> {
        let asdu = self.command_asdu(
            TypeId::InterrogationCommand,
            CauseOfTransmission::Activation,
            common_address,
            InformationObject::Interrogation {
                address: 0,
                qualifier,
            },
        )?;
        self.send_asdu(link_address, asdu).await
    }

    /// Clock synchronization toward one slave
    pub async fn clock_sync(
        &self,
        link_address: u16,
        common_address: u16,
        time: Cp56Time2a,
    ) -> Result<()> {
        let asdu = self.command_asdu(
            TypeId::ClockSyncCommand,
            CauseOfTransmission::Activation,
            common_address,
            InformationObject::ClockSync {
                address: 0,
                timestamp: time,
            },
        )?;
        self.send_asdu(link_address, asdu).await
    }

    /// Stop polling and close the line
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            let _ = running.task.await;
            info!("IEC-101 master stopped");
        }
    }
}

struct SlaveEntry {
    link: PrimaryLink,
    outbound: VecDeque<Vec<u8>>,
    next_attention: Instant,
}

impl SlaveEntry {
    fn new(address: u16, config: &Iec101MasterConfig, now: Instant) -> Self {
        Self {
            link: PrimaryLink::new(address, config.link, config.dir),
            outbound: VecDeque::new(),
            next_attention: now,
        }
    }
}

fn broadcast_link_address(size: LinkAddrSize) -> u16 {
    match size {
        LinkAddrSize::OneOctet => 0xFF,
        LinkAddrSize::TwoOctets => 0xFFFF,
    }
}

/// Pick the next link service to run, round-robin over the slaves
fn next_work(
    entries: &mut [SlaveEntry],
    rr: &mut usize,
    poll_interval: Duration,
    now: Instant,
) -> Option<(usize, Ft12Frame)> {
    let len = entries.len();
    for offset in 0..len {
        let i = (*rr + offset) % len;
        let entry = &mut entries[i];
        if !entry.link.is_available() {
            if now >= entry.next_attention {
                entry.next_attention = now + poll_interval;
                *rr = (i + 1) % len;
                return Some((i, entry.link.reset(now)));
            }
            continue;
        }
        if entry.link.can_transmit() {
            if let Some(data) = entry.outbound.pop_front() {
                if let Some(frame) = entry.link.send_confirmed(data, now) {
                    *rr = (i + 1) % len;
                    return Some((i, frame));
                }
            }
        }
        if entry.link.class1_pending() {
            if let Some(frame) = entry.link.request_class1(now) {
                *rr = (i + 1) % len;
                return Some((i, frame));
            }
        }
        if now >= entry.next_attention {
            if let Some(frame) = entry.link.request_class2(now) {
                entry.next_attention = now + poll_interval;
                *rr = (i + 1) % len;
                return Some((i, frame));
            }
        }
    }
    None
}

async fn master_loop<S>(
    mut framed: Framed<S, Ft12Codec>,
    config: Iec101MasterConfig,
    slaves: Vec<u16>,
    mut cmd_rx: mpsc::Receiver<MasterCmd>,
    events: mpsc::Sender<MasterEvent>,
    cancel: CancellationToken,
) where
    S: Transport + 'static,
{
    let now = Instant::now();
    let mut entries: Vec<SlaveEntry> = slaves
        .iter()
        .map(|&a| SlaveEntry::new(a, &config, now))
        .collect();
    let mut rr = 0usize;
    let mut current: Option<usize> = None;
    let balanced = config.link.mode == LinkMode::Balanced;
    let mut secondary = SecondaryLink::new(0);

    loop {
        let now = Instant::now();
        if current.is_none() && !entries.is_empty() {
            if let Some((i, frame)) = next_work(&mut entries, &mut rr, config.poll_interval, now) {
                if framed.send(frame).await.is_err() {
                    let _ = events.try_send(MasterEvent::Connection(ConnectionEvent::Closed(
                        CloseReason::IoError,
                    )));
                    return;
                }
                current = Some(i);
            }
        }

        // earliest deadline: the outstanding response or the next poll slot
        let mut deadline = now + config.poll_interval;
        if let Some(i) = current {
            if let Some(d) = entries[i].link.next_deadline() {
                deadline = d;
            }
        } else {
            for entry in &entries {
                if entry.next_attention < deadline {
                    deadline = entry.next_attention;
                }
            }
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            cmd = cmd_rx.recv() => match cmd {
                Some(MasterCmd::AddSlave(address)) => {
                    if !entries.iter().any(|e| e.link.address() == address) {
                        entries.push(SlaveEntry::new(address, &config, Instant::now()));
                    }
                }
                Some(MasterCmd::SendConfirmed { address, data }) => {
                    match entries.iter_mut().find(|e| e.link.address() == address) {
                        Some(entry) => entry.outbound.push_back(data),
                        None => warn!(address, "no such slave, command dropped"),
                    }
                }
                Some(MasterCmd::Broadcast { data }) => {
                    let frame = Ft12Frame::Variable {
                        control: LinkControl::primary(
                            config.dir,
                            false,
                            false,
                            PrimaryFunction::UserDataNoReply,
                        ),
                        address: broadcast_link_address(config.link.address_size),
                        user_data: data,
                    };
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            frame = framed.next() => match frame {
                None => {
                    let _ = events.try_send(MasterEvent::Connection(ConnectionEvent::Closed(
                        CloseReason::RemoteClosed,
                    )));
                    return;
                }
                Some(Err(e)) => {
                    warn!("line error: {e}");
                    let _ = events.try_send(MasterEvent::Connection(ConnectionEvent::Closed(
                        CloseReason::IoError,
                    )));
                    return;
                }
                Some(Ok(frame)) => {
                    let from_primary = frame.control().map(|c| c.prm).unwrap_or(false);
                    if balanced && from_primary {
                        if let Err(()) = handle_balanced_request(
                            &mut framed,
                            &mut secondary,
                            &config,
                            &events,
                            frame,
                        )
                        .await
                        {
                            return;
                        }
                    } else if let Some(i) = current {
                        let follow_up =
                            handle_response(&mut entries[i], &config, &events, frame).await;
                        if let Some(next) = follow_up {
                            if framed.send(next).await.is_err() {
                                break;
                            }
                        }
                        if entries[i].link.next_deadline().is_none() {
                            current = None;
                        }
                    } else {
                        debug!("unsolicited secondary frame ignored");
                    }
                }
            },

            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                if let Some(i) = current {
                    match entries[i].link.on_timeout(Instant::now()) {
                        PrimaryAction::Retransmit(frame) => {
                            if framed.send(frame).await.is_err() {
                                break;
                            }
                        }
                        PrimaryAction::LinkFailed(reason) => {
                            entries[i].next_attention = Instant::now() + config.poll_interval;
                            current = None;
                            let _ = events
                                .try_send(MasterEvent::Connection(ConnectionEvent::Closed(reason)));
                        }
                        PrimaryAction::None => {}
                    }
                }
            }
        }
    }

    let _ = events.try_send(MasterEvent::Connection(ConnectionEvent::Closed(
        CloseReason::LocalStop,
    )));
}

/// Returns the next frame of the establishment sequence when one is due
async fn handle_response(
    entry: &mut SlaveEntry,
    config: &Iec101MasterConfig,
    events: &mpsc::Sender<MasterEvent>,
    frame: Ft12Frame,
) -> Option<Ft12Frame> {
    match entry.link.on_frame(&frame, Instant::now()) {
        PrimaryEvent::Proceed(next) => return Some(next),
        PrimaryEvent::LinkAvailable => {
            let _ = events.try_send(MasterEvent::Connection(ConnectionEvent::Opened));
        }
        PrimaryEvent::UserData(data) => match Asdu::decode(&data, config.app_layer) {
            Ok(asdu) => {
                if events.try_send(MasterEvent::Asdu(asdu)).is_err() {
                    warn!("event queue full, dropping received ASDU");
                }
            }
            Err(e) => warn!(address = entry.link.address(), "undecodable ASDU: {e}"),
        },
        PrimaryEvent::Busy => {
            debug!(address = entry.link.address(), "secondary busy");
        }
        PrimaryEvent::Confirmed | PrimaryEvent::NoData | PrimaryEvent::None => {}
    }
    None
}

/// Balanced mode: answer the peer's primary frames and surface its data
async fn handle_balanced_request<S>(
    framed: &mut Framed<S, Ft12Codec>,
    secondary: &mut SecondaryLink,
    config: &Iec101MasterConfig,
    events: &mpsc::Sender<MasterEvent>,
    frame: Ft12Frame,
) -> std::result::Result<(), ()>
where
    S: Transport + 'static,
{
    let address = frame.address().unwrap_or(0);
    let decision = secondary.on_frame(&frame);
    let response = match decision {
        SecondaryDecision::Repeat(stored) => Some(stored),
        SecondaryDecision::Ignore => None,
        SecondaryDecision::Process(function, user_data) => {
            if let Some(data) = user_data {
                match Asdu::decode(&data, config.app_layer) {
                    Ok(asdu) => {
                        if events.try_send(MasterEvent::Asdu(asdu)).is_err() {
                            warn!("event queue full, dropping received ASDU");
                        }
                    }
                    Err(e) => warn!("undecodable ASDU from peer: {e}"),
                }
            }
            match function {
                PrimaryFunction::UserDataNoReply => None,
                PrimaryFunction::RequestLinkStatus => Some(Ft12Frame::Fixed {
                    control: LinkControl::secondary(
                        config.dir,
                        false,
                        false,
                        SecondaryFunction::LinkStatus,
                    ),
                    address,
                }),
                PrimaryFunction::RequestClass1 | PrimaryFunction::RequestClass2 => {
                    // balanced stations exchange data as confirmed user data
                    Some(Ft12Frame::Fixed {
                        control: LinkControl::secondary(
                            config.dir,
                            false,
                            false,
                            SecondaryFunction::NackNoData,
                        ),
                        address,
                    })
                }
                _ => {
                    if config.link.single_char_ack {
                        Some(Ft12Frame::SingleCharAck)
                    } else {
                        Some(Ft12Frame::Fixed {
                            control: LinkControl::secondary(
                                config.dir,
                                false,
                                false,
                                SecondaryFunction::Ack,
                            ),
                            address,
                        })
                    }
                }
            }
        }
    };
    if let Some(response) = response {
        secondary.store_response(response.clone());
        if framed.send(response).await.is_err() {
            let _ = events.try_send(MasterEvent::Connection(ConnectionEvent::Closed(
                CloseReason::IoError,
            )));
            return Err(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_validates() {
        let config = Iec101MasterConfig::new()
            .poll_interval(Duration::from_millis(250))
            .originator_address(2)
            .build()
            .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));

        let bad = Iec101MasterConfig::new().poll_interval(Duration::ZERO);
        assert!(bad.build().is_err());
    }

    #[test]
    fn round_robin_prefers_outbound_over_polls() {
        let config = Iec101MasterConfig::default();
        let now = Instant::now();
        let mut entries = vec![
            SlaveEntry::new(1, &config, now),
            SlaveEntry::new(2, &config, now),
        ];
        // mark both links available
        for entry in &mut entries {
            entry.link.reset(now);
            entry.link.on_frame(&Ft12Frame::SingleCharAck, now);
            entry.link.on_frame(&Ft12Frame::SingleCharAck, now);
        }
        entries[1].outbound.push_back(vec![0x01]);

        let mut rr = 1;
        let (i, frame) = next_work(&mut entries, &mut rr, config.poll_interval, now).unwrap();
        assert_eq!(i, 1);
        match frame {
            Ft12Frame::Variable { control, .. } => {
                assert_eq!(control.function, PrimaryFunction::UserDataConfirmed as u8);
            }
            other => panic!("expected user data, got {other:?}"),
        }
    }

    #[test]
    fn unavailable_link_is_reset_first() {
        let config = Iec101MasterConfig::default();
        let now = Instant::now();
        let mut entries = vec![SlaveEntry::new(7, &config, now)];
        let mut rr = 0;
        let (_, frame) = next_work(&mut entries, &mut rr, config.poll_interval, now).unwrap();
        match frame {
            Ft12Frame::Fixed { control, .. } => {
                assert_eq!(control.function, PrimaryFunction::RequestLinkStatus as u8);
            }
            other => panic!("expected the status request, got {other:?}"),
        }
        // a second call within the attention window does not hammer the line
        assert!(next_work(&mut entries, &mut rr, config.poll_interval, now).is_none());
    }
}
