//! IEC 60870-5-101 slave (secondary station)
//!
//! The slave answers the primary's polls from two pending queues: class 1
//! for high priority and spontaneous data, class 2 for cyclic and
//! background data. The ACD bit of every response advertises pending
//! class 1 data so the master knows to fetch it. Application requests
//! arriving as link user data go through the same [`ServerHandler`]
//! surface as the CS104 server; handler responses are queued as class 1.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::asdu::{Asdu, AsduPayload};
use crate::common::{ConnectionEvent, IecError, Result};
use crate::iec101::ft12::{
    Ft12Codec, Ft12Frame, LinkControl, PrimaryFunction, SecondaryFunction,
};
use crate::iec101::link::{SecondaryDecision, SecondaryLink};
use crate::params::{AppLayerParameters, LinkAddrSize, LinkLayerParameters};
use crate::session::{dispatch_asdu, dispatch_raw, ConnectionHandle, ServerHandler};
use crate::transport::{open_serial, SerialConfig, Transport};

/// IEC-101 slave configuration
#[derive(Debug, Clone)]
pub struct Iec101SlaveConfig {
    /// Link layer constants
    pub link: LinkLayerParameters,
    /// Application layer octet sizes
    pub app_layer: AppLayerParameters,
    /// Link address of this station
    pub link_address: u16,
    /// Common address of this station
    pub common_address: u16,
    /// Bound of each pending data queue
    pub queue_size: usize,
    /// DIR bit on transmitted frames (balanced wiring only)
    pub dir: bool,
}

impl Default for Iec101SlaveConfig {
    fn default() -> Self {
        Self {
            link: LinkLayerParameters::default(),
            app_layer: AppLayerParameters::default(),
            link_address: 1,
            common_address: 1,
            queue_size: 64,
            dir: false,
        }
    }
}

impl Iec101SlaveConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the link address of this station
    pub fn link_address(mut self, address: u16) -> Self {
        self.link_address = address;
        self
    }

    /// Set the common address of this station
    pub fn common_address(mut self, address: u16) -> Self {
        self.common_address = address;
        self
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

    /// Validate and build the configuration
    pub fn build(self) -> Result<Self> {
        self.link.validate()?;
        self.app_layer.validate()?;
        if self.queue_size == 0 {
            return Err(IecError::ConfigError(
                "queue_size must be non-zero".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Pending user data of both priority classes, encoded for the line
struct Queues {
    class1: Mutex<VecDeque<Vec<u8>>>,
    class2: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

impl Queues {
    async fn push_bounded(&self, queue: &Mutex<VecDeque<Vec<u8>>>, data: Vec<u8>) -> Result<()> {
        let mut q = queue.lock().await;
        if q.len() >= self.capacity {
            return Err(IecError::QueueFull);
        }
        q.push_back(data);
        Ok(())
    }

    /// Responses produced by handlers bypass the bound; dropping a
    /// confirmation would wedge the master
    async fn push_class1_response(&self, data: Vec<u8>) {
        self.class1.lock().await.push_back(data);
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// IEC-101 slave implementation
pub struct Iec101Slave {
    config: Iec101SlaveConfig,
    handler: Arc<dyn ServerHandler>,
    queues: Arc<Queues>,
    running: Option<Running>,
}

impl Iec101Slave {
    /// Create a new IEC-101 slave with the handler receiving all requests
    pub fn new(config: Iec101SlaveConfig, handler: Arc<dyn ServerHandler>) -> Self {
        let queues = Arc::new(Queues {
            class1: Mutex::new(VecDeque::new()),
            class2: Mutex::new(VecDeque::new()),
            capacity: config.queue_size.max(1),
        });
        Self {
            config,
            handler,
            queues,
            running: None,
        }
    }

    /// Queue spontaneous / high priority data (answered to class 1 polls)
    pub async fn enqueue_class1(&self, asdu: Asdu) -> Result<()> {
        let data = asdu.encode()?;
        self.queues.push_bounded(&self.queues.class1, data).await
    }

    /// Queue cyclic / background data (answered to class 2 polls)
    pub async fn enqueue_class2(&self, asdu: Asdu) -> Result<()> {
        let data = asdu.encode()?;
        self.queues.push_bounded(&self.queues.class2, data).await
    }

    /// Start the slave over an established byte stream
    pub fn start<S>(&mut self, transport: S) -> Result<()>
    where
        S: Transport + 'static,
    {
        if self.running.is_some() {
            return Err(IecError::InvalidArgument(
                "slave already started".to_string(),
            ));
        }
        let framed = Framed::new(transport, Ft12Codec::new(self.config.link));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(slave_loop(
            framed,
            self.config.clone(),
            self.handler.clone(),
            self.queues.clone(),
            cancel.clone(),
        ));
        self.running = Some(Running { cancel, task });
        Ok(())
    }

    /// Open the serial port and start the slave on it
    pub fn start_serial(&mut self, path: &str, serial: &SerialConfig) -> Result<()> {
        let stream = open_serial(path, serial)?;
        info!("IEC-101 slave on serial port {path}");
        self.start(stream)
    }

    /// Stop answering and close the line
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            let _ = running.task.await;
            info!("IEC-101 slave stopped");
        }
    }
}

fn broadcast_link_address(size: LinkAddrSize) -> u16 {
    match size {
        LinkAddrSize::OneOctet => 0xFF,
        LinkAddrSize::TwoOctets => 0xFFFF,
    }
}

async fn slave_loop<S>(
    mut framed: Framed<S, Ft12Codec>,
    config: Iec101SlaveConfig,
    handler: Arc<dyn ServerHandler>,
    queues: Arc<Queues>,
    cancel: CancellationToken,
) where
    S: Transport + 'static,
{
    let (data_tx, mut data_rx) = mpsc::channel(config.queue_size.max(16));
    let handle = ConnectionHandle::new(
        data_tx,
        config.app_layer,
        Some(format!("link:{}", config.link_address)),
        cancel.clone(),
    );
    let mut secondary = SecondaryLink::new(config.link_address);
    let broadcast = broadcast_link_address(config.link.address_size);

    loop {
        // handler output becomes class 1 data
        while let Ok(payload) = data_rx.try_recv() {
            if let Some(data) = encode_payload(payload) {
                queues.push_class1_response(data).await;
            }
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            frame = framed.next() => match frame {
                None => {
                    handler
                        .handle_connection_event(
                            handle.peer_deref(),
                            &ConnectionEvent::Closed(crate::common::CloseReason::RemoteClosed),
                        )
                        .await;
                    return;
                }
                Some(Err(e)) => {
                    warn!("line error: {e}");
                    return;
                }
                Some(Ok(frame)) => {
                    let Some(address) = frame.address() else { continue };
                    if address != config.link_address && address != broadcast {
                        continue;
                    }
                    let to_broadcast = address == broadcast;

                    match secondary.on_frame(&frame) {
                        SecondaryDecision::Ignore => {}
                        SecondaryDecision::Repeat(stored) => {
                            if framed.send(stored).await.is_err() {
                                return;
                            }
                        }
                        SecondaryDecision::Process(function, user_data) => {
                            let response = process_request(
                                function,
                                user_data,
                                to_broadcast,
                                &config,
                                &handler,
                                &handle,
                                &mut data_rx,
                                &queues,
                            )
                            .await;
                            if let Some(response) = response {
                                secondary.store_response(response.clone());
                                if framed.send(response).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            },
        }
    }

    handler
        .handle_connection_event(
            handle.peer_deref(),
            &ConnectionEvent::Closed(crate::common::CloseReason::LocalStop),
        )
        .await;
}

fn encode_payload(payload: AsduPayload) -> Option<Vec<u8>> {
    match payload {
        AsduPayload::Typed(asdu) => match asdu.encode() {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("dropping unencodable response: {e}");
                None
            }
        },
        AsduPayload::Raw { bytes, .. } => Some(bytes),
    }
}

/// Run the handler while draining its responses, so a handler producing
/// more frames than the channel holds cannot wedge the loop
async fn dispatch_user_data(
    data: Vec<u8>,
    config: &Iec101SlaveConfig,
    handler: &Arc<dyn ServerHandler>,
    handle: &ConnectionHandle,
    data_rx: &mut mpsc::Receiver<AsduPayload>,
    queues: &Arc<Queues>,
) {
    let dispatch = async {
        match Asdu::decode(&data, config.app_layer) {
            Ok(asdu) => {
                dispatch_asdu(handler.as_ref(), handle, asdu, config.common_address).await
            }
            Err(error) => dispatch_raw(handler.as_ref(), handle, data.clone(), error).await,
        }
    };
    tokio::pin!(dispatch);

    loop {
        tokio::select! {
            result = &mut dispatch => {
                if let Err(e) = result {
                    warn!("handler dispatch failed: {e}");
                }
                break;
            }
            Some(payload) = data_rx.recv() => {
                if let Some(encoded) = encode_payload(payload) {
                    queues.push_class1_response(encoded).await;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_request(
    function: PrimaryFunction,
    user_data: Option<Vec<u8>>,
    to_broadcast: bool,
    config: &Iec101SlaveConfig,
    handler: &Arc<dyn ServerHandler>,
    handle: &ConnectionHandle,
    data_rx: &mut mpsc::Receiver<AsduPayload>,
    queues: &Arc<Queues>,
) -> Option<Ft12Frame> {
    let address = config.link_address;
    let ack = |acd: bool| {
        if config.link.single_char_ack && !acd {
            Ft12Frame::SingleCharAck
        } else {
            Ft12Frame::Fixed {
                control: LinkControl::secondary(config.dir, acd, false, SecondaryFunction::Ack),
                address,
            }
        }
    };

    match function {
        PrimaryFunction::ResetRemoteLink => {
            debug!("link reset by primary");
            handle.set_ready(true);
            handler
                .handle_connection_event(handle.peer_deref(), &ConnectionEvent::Opened)
                .await;
            if to_broadcast {
                return None;
            }
            Some(ack(false))
        }
        PrimaryFunction::ResetUserProcess => {
            queues.class1.lock().await.clear();
            queues.class2.lock().await.clear();
            if to_broadcast {
                return None;
            }
            Some(ack(false))
        }
        PrimaryFunction::TestFunction => {
            if to_broadcast {
                return None;
            }
            Some(ack(false))
        }
        PrimaryFunction::RequestLinkStatus => {
            let acd = !queues.class1.lock().await.is_empty();
            Some(Ft12Frame::Fixed {
                control: LinkControl::secondary(
                    config.dir,
                    acd,
                    false,
                    SecondaryFunction::LinkStatus,
                ),
                address,
            })
        }
        PrimaryFunction::UserDataConfirmed | PrimaryFunction::UserDataNoReply => {
            if let Some(data) = user_data {
                dispatch_user_data(data, config, handler, handle, data_rx, queues).await;
            }
            // responses the handler just produced must raise ACD in the ack
            while let Ok(payload) = data_rx.try_recv() {
                if let Some(encoded) = encode_payload(payload) {
                    queues.push_class1_response(encoded).await;
                }
            }
            if function == PrimaryFunction::UserDataNoReply || to_broadcast {
                return None;
            }
            let acd = !queues.class1.lock().await.is_empty();
            Some(ack(acd))
        }
        PrimaryFunction::RequestClass1 => {
            let mut class1 = queues.class1.lock().await;
            match class1.pop_front() {
                Some(data) => {
                    let acd = !class1.is_empty();
                    Some(Ft12Frame::Variable {
                        control: LinkControl::secondary(
                            config.dir,
                            acd,
                            false,
                            SecondaryFunction::UserData,
                        ),
                        address,
                        user_data: data,
                    })
                }
                None => Some(Ft12Frame::Fixed {
                    control: LinkControl::secondary(
                        config.dir,
                        false,
                        false,
                        SecondaryFunction::NackNoData,
                    ),
                    address,
                }),
            }
        }
        PrimaryFunction::RequestClass2 => {
            let data = queues.class2.lock().await.pop_front();
            let acd = !queues.class1.lock().await.is_empty();
            match data {
                Some(data) => Some(Ft12Frame::Variable {
                    control: LinkControl::secondary(
                        config.dir,
                        acd,
                        false,
                        SecondaryFunction::UserData,
                    ),
                    address,
                    user_data: data,
                }),
                None => Some(Ft12Frame::Fixed {
                    control: LinkControl::secondary(
                        config.dir,
                        acd,
                        false,
                        SecondaryFunction::NackNoData,
                    ),
                    address,
                }),
            }
        }
    }
}
