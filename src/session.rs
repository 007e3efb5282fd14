//! User-facing session surface shared by the four roles
//!
//! Handlers never see a concrete connection type. They receive the
//! capability set of [`MasterConnection`], implemented by the CS104 server
//! connection and the CS101 slave link alike, so application code is
//! portable between the two transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::asdu::{patch_raw_cause, Asdu, AsduPayload, TypeId};
use crate::common::{
    AsduDecodeError, CauseOfTransmission, ConnectionEvent, Direction, IecError, Result,
};
use crate::information_objects::InformationObject;
use crate::params::{AppLayerParameters, CommonAddrSize};
use crate::time::{Cp16Time2a, Cp56Time2a};

/// Events delivered to a master (client) subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum MasterEvent {
    /// An ASDU arrived in the monitor direction
    Asdu(Asdu),
    /// Connection state changed or a protocol error was observed
    Connection(ConnectionEvent),
    /// Copy of a raw frame (only when raw message reporting is enabled)
    RawMessage {
        direction: Direction,
        bytes: Vec<u8>,
    },
}

/// Capability set a handler receives for the connection that delivered the
/// request
#[async_trait]
pub trait MasterConnection: Send + Sync {
    /// The connection can currently accept outbound ASDUs
    fn is_ready(&self) -> bool;

    /// Queue an ASDU for transmission in submission order
    async fn send_asdu(&self, asdu: Asdu) -> Result<()>;

    /// Confirm an activation: mirrors the request with COT act-con (or
    /// deact-con for deactivations) and the P/N flag
    async fn send_act_con(&self, asdu: &Asdu, negative: bool) -> Result<()>;

    /// Terminate an activation: mirrors the request with COT act-term
    async fn send_act_term(&self, asdu: &Asdu) -> Result<()>;

    /// The application layer parameters this connection speaks
    fn app_layer_parameters(&self) -> AppLayerParameters;

    /// Peer endpoint (socket address, or link address for CS101)
    fn peer_address(&self) -> Option<String>;

    /// Close the connection
    fn close(&self);
}

/// Server-side callback surface (CS104 server and CS101 slave)
///
/// Returning `Ok(true)` means the handler performed the protocol responses
/// itself through the connection capability set; `Ok(false)` asks the
/// library for the default behavior, which is a negative confirmation with
/// the matching mirror cause. Clock sync and test commands are always
/// confirmed by the library.
#[allow(unused_variables)]
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Any ASDU without a dedicated handler below
    async fn handle_asdu(
        &self,
        connection: &dyn MasterConnection,
        asdu: &Asdu,
    ) -> Result<bool> {
        Ok(false)
    }

    /// C_IC_NA_1 with the qualifier of interrogation
    async fn handle_interrogation(
        &self,
        connection: &dyn MasterConnection,
        asdu: &Asdu,
        qualifier: u8,
    ) -> Result<bool> {
        Ok(false)
    }

    /// C_CI_NA_1 with the qualifier of counter interrogation
    async fn handle_counter_interrogation(
        &self,
        connection: &dyn MasterConnection,
        asdu: &Asdu,
        qualifier: u8,
    ) -> Result<bool> {
        Ok(false)
    }

    /// C_RD_NA_1 for a single information object address
    async fn handle_read(
        &self,
        connection: &dyn MasterConnection,
        asdu: &Asdu,
        address: u32,
    ) -> Result<bool> {
        Ok(false)
    }

    /// C_CS_NA_1; return `Ok(true)` to accept the new wall-clock time.
    /// The library confirms with the received time either way.
    async fn handle_clock_sync(
        &self,
        connection: &dyn MasterConnection,
        asdu: &Asdu,
        time: &Cp56Time2a,
    ) -> Result<bool> {
        Ok(true)
    }

    /// C_RP_NA_1 with the qualifier of reset process
    async fn handle_reset_process(
        &self,
        connection: &dyn MasterConnection,
        asdu: &Asdu,
        qualifier: u8,
    ) -> Result<bool> {
        Ok(false)
    }

    /// C_CD_NA_1 with the acquired delay
    async fn handle_delay_acquisition(
        &self,
        connection: &dyn MasterConnection,
        asdu: &Asdu,
        delay: Cp16Time2a,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Copy of every raw frame crossing the wire
    fn handle_raw_message(&self, direction: Direction, bytes: &[u8]) {}

    /// Connection lifecycle and protocol error reporting
    async fn handle_connection_event(&self, peer: Option<&str>, event: &ConnectionEvent) {}
}

/// Mirror cause for confirming a request
pub(crate) fn confirmation_cause(request: &Asdu) -> CauseOfTransmission {
    if request.cause() == CauseOfTransmission::Deactivation {
        CauseOfTransmission::DeactivationConfirmation
    } else {
        CauseOfTransmission::ActivationConfirmation
    }
}

/// Handle to a live connection's outbound queue, shared between the I/O
/// task and user-visible capability objects
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    data_tx: mpsc::Sender<AsduPayload>,
    params: AppLayerParameters,
    peer: Option<String>,
    cancel: CancellationToken,
    ready: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(
        data_tx: mpsc::Sender<AsduPayload>,
        params: AppLayerParameters,
        peer: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            data_tx,
            params,
            peer,
            cancel,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn peer_deref(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Queue an outbound payload, waiting while the transport window is full
    pub async fn send_payload(&self, payload: AsduPayload) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(IecError::NotConnected);
        }
        self.data_tx
            .send(payload)
            .await
            .map_err(|_| IecError::NotConnected)
    }
}

#[async_trait]
impl MasterConnection for ConnectionHandle {
    fn is_ready(&self) -> bool {
        !self.cancel.is_cancelled() && self.ready.load(Ordering::SeqCst)
    }

    async fn send_asdu(&self, asdu: Asdu) -> Result<()> {
        self.send_payload(AsduPayload::Typed(asdu)).await
    }

    async fn send_act_con(&self, asdu: &Asdu, negative: bool) -> Result<()> {
        let response = asdu.with_cause(confirmation_cause(asdu), negative);
        self.send_payload(AsduPayload::Typed(response)).await
    }

    async fn send_act_term(&self, asdu: &Asdu) -> Result<()> {
        let response = asdu.with_cause(CauseOfTransmission::ActivationTermination, false);
        self.send_payload(AsduPayload::Typed(response)).await
    }

    fn app_layer_parameters(&self) -> AppLayerParameters {
        self.params
    }

    fn peer_address(&self) -> Option<String> {
        self.peer.clone()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Broadcast address for the configured common address size
pub(crate) fn broadcast_address(ca_size: CommonAddrSize) -> u16 {
    match ca_size {
        CommonAddrSize::OneOctet => 0xFF,
        CommonAddrSize::TwoOctets => 0xFFFF,
    }
}

/// Only station-wide commands may be addressed to the broadcast CA;
/// anything else at the broadcast address is a content error
fn accepts_broadcast(type_id: TypeId) -> bool {
    matches!(
        type_id,
        TypeId::InterrogationCommand
            | TypeId::CounterInterrogationCommand
            | TypeId::ClockSyncCommand
            | TypeId::TestCommand
            | TypeId::TestCommandWithCp56
            | TypeId::ResetProcessCommand
    )
}

async fn reply_negative(
    handler: &dyn ServerHandler,
    handle: &ConnectionHandle,
    response: Asdu,
    cause: CauseOfTransmission,
) -> Result<()> {
    handle.send_payload(AsduPayload::Typed(response)).await?;
    handler
        .handle_connection_event(
            handle.peer_deref(),
            &ConnectionEvent::NegativeConfirm { cause },
        )
        .await;
    Ok(())
}

/// Route a decoded ASDU to the server-side handler surface, applying the
/// default negative-confirmation behavior where the handler declines
pub(crate) async fn dispatch_asdu(
    handler: &dyn ServerHandler,
    handle: &ConnectionHandle,
    asdu: Asdu,
    local_ca: u16,
) -> Result<()> {
    let ca = asdu.common_address();
    let broadcast_ok = ca == broadcast_address(handle.params.ca_size)
        && accepts_broadcast(asdu.type_id());
    if ca != local_ca && !broadcast_ok {
        debug!(ca, local_ca, "ASDU for a different common address");
        let response = asdu.with_cause(CauseOfTransmission::UnknownCommonAddress, true);
        return reply_negative(
            handler,
            handle,
            response,
            CauseOfTransmission::UnknownCommonAddress,
        )
        .await;
    }

    match asdu.type_id() {
        TypeId::InterrogationCommand => {
            if !matches!(
                asdu.cause(),
                CauseOfTransmission::Activation | CauseOfTransmission::Deactivation
            ) {
                let response = asdu.with_cause(CauseOfTransmission::UnknownCauseOfTransmission, true);
                return reply_negative(
                    handler,
                    handle,
                    response,
                    CauseOfTransmission::UnknownCauseOfTransmission,
                )
                .await;
            }
            let qualifier = match asdu.objects().first() {
                Some(InformationObject::Interrogation { qualifier, .. }) => *qualifier,
                _ => 0,
            };
            if !handler.handle_interrogation(handle, &asdu, qualifier).await? {
                let response = asdu.with_cause(confirmation_cause(&asdu), true);
                return reply_negative(handler, handle, response, confirmation_cause(&asdu)).await;
            }
        }
        TypeId::CounterInterrogationCommand => {
            let qualifier = match asdu.objects().first() {
                Some(InformationObject::CounterInterrogation { qualifier, .. }) => *qualifier,
                _ => 0,
            };
            if !handler
                .handle_counter_interrogation(handle, &asdu, qualifier)
                .await?
            {
                let response = asdu.with_cause(confirmation_cause(&asdu), true);
                return reply_negative(handler, handle, response, confirmation_cause(&asdu)).await;
            }
        }
        TypeId::ReadCommand => {
            let address = asdu.objects().first().map_or(0, InformationObject::address);
            if !handler.handle_read(handle, &asdu, address).await? {
                let response = asdu.with_cause(CauseOfTransmission::UnknownInfoObjAddress, true);
                return reply_negative(
                    handler,
                    handle,
                    response,
                    CauseOfTransmission::UnknownInfoObjAddress,
                )
                .await;
            }
        }
        TypeId::ClockSyncCommand => {
            let time = match asdu.objects().first() {
                Some(InformationObject::ClockSync { timestamp, .. }) => *timestamp,
                _ => Cp56Time2a::default(),
            };
            let accepted = handler.handle_clock_sync(handle, &asdu, &time).await?;
            let response = asdu.with_cause(confirmation_cause(&asdu), !accepted);
            handle.send_payload(AsduPayload::Typed(response)).await?;
        }
        TypeId::TestCommand | TypeId::TestCommandWithCp56 => {
            let response = asdu.with_cause(confirmation_cause(&asdu), false);
            handle.send_payload(AsduPayload::Typed(response)).await?;
        }
        TypeId::ResetProcessCommand => {
            let qualifier = match asdu.objects().first() {
                Some(InformationObject::ResetProcess { qualifier, .. }) => *qualifier,
                _ => 0,
            };
            if !handler.handle_reset_process(handle, &asdu, qualifier).await? {
                let response = asdu.with_cause(confirmation_cause(&asdu), true);
                return reply_negative(handler, handle, response, confirmation_cause(&asdu)).await;
            }
        }
        TypeId::DelayAcquisitionCommand => {
            let delay = match asdu.objects().first() {
                Some(InformationObject::DelayAcquisition { delay, .. }) => *delay,
                _ => Cp16Time2a::default(),
            };
            if !handler
                .handle_delay_acquisition(handle, &asdu, delay)
                .await?
            {
                let response = asdu.with_cause(confirmation_cause(&asdu), true);
                return reply_negative(handler, handle, response, confirmation_cause(&asdu)).await;
            }
        }
        _ => {
            if !handler.handle_asdu(handle, &asdu).await? {
                if asdu.type_id().is_monitor() {
                    // monitor-direction data at a server has no confirmation slot
                    debug!(type_id = ?asdu.type_id(), "unhandled monitor ASDU dropped");
                } else if asdu.cause() == CauseOfTransmission::Activation
                    || asdu.cause() == CauseOfTransmission::Deactivation
                {
                    let response = asdu.with_cause(confirmation_cause(&asdu), true);
                    return reply_negative(handler, handle, response, confirmation_cause(&asdu))
                        .await;
                } else {
                    let response =
                        asdu.with_cause(CauseOfTransmission::UnknownCauseOfTransmission, true);
                    return reply_negative(
                        handler,
                        handle,
                        response,
                        CauseOfTransmission::UnknownCauseOfTransmission,
                    )
                    .await;
                }
            }
        }
    }
    Ok(())
}

/// Answer an undecodable ASDU with the standard mirror cause and keep the
/// connection open
pub(crate) async fn dispatch_raw(
    handler: &dyn ServerHandler,
    handle: &ConnectionHandle,
    mut bytes: Vec<u8>,
    error: AsduDecodeError,
) -> Result<()> {
    warn!(?error, "ASDU rejected, answering with mirror cause");
    let cause = match error {
        AsduDecodeError::UnknownType(_) => CauseOfTransmission::UnknownTypeIdentification,
        _ => CauseOfTransmission::UnknownCauseOfTransmission,
    };
    patch_raw_cause(&mut bytes, cause, true);
    handle.send_payload(AsduPayload::Raw { bytes, error }).await?;
    handler
        .handle_connection_event(
            handle.peer_deref(),
            &ConnectionEvent::NegativeConfirm { cause },
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asdu::Cot;
    use std::sync::Mutex;

    struct RecordingHandler {
        interrogations: Mutex<Vec<u8>>,
        events: Mutex<Vec<ConnectionEvent>>,
        accept_interrogation: bool,
    }

    impl RecordingHandler {
        fn new(accept_interrogation: bool) -> Self {
            Self {
                interrogations: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                accept_interrogation,
            }
        }
    }

    #[async_trait]
    impl ServerHandler for RecordingHandler {
        async fn handle_interrogation(
            &self,
            connection: &dyn MasterConnection,
            asdu: &Asdu,
            qualifier: u8,
        ) -> Result<bool> {
            self.interrogations.lock().unwrap().push(qualifier);
            if self.accept_interrogation {
                connection.send_act_con(asdu, false).await?;
                connection.send_act_term(asdu).await?;
            }
            Ok(self.accept_interrogation)
        }

        async fn handle_connection_event(&self, _peer: Option<&str>, event: &ConnectionEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn interrogation_asdu(ca: u16, qoi: u8) -> Asdu {
        let mut asdu = Asdu::new(
            AppLayerParameters::default(),
            TypeId::InterrogationCommand,
            Cot::new(CauseOfTransmission::Activation),
            ca,
        );
        asdu.add_object(InformationObject::Interrogation {
            address: 0,
            qualifier: qoi,
        })
        .unwrap();
        asdu
    }

    fn handle_pair() -> (ConnectionHandle, mpsc::Receiver<AsduPayload>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = ConnectionHandle::new(
            tx,
            AppLayerParameters::default(),
            Some("test".to_string()),
            CancellationToken::new(),
        );
        (handle, rx)
    }

    #[tokio::test]
    async fn interrogation_reaches_handler_with_qualifier() {
        let (handle, mut rx) = handle_pair();
        let handler = RecordingHandler::new(true);
        dispatch_asdu(&handler, &handle, interrogation_asdu(1, 20), 1)
            .await
            .unwrap();

        assert_eq!(*handler.interrogations.lock().unwrap(), vec![20]);
        // handler produced exactly one ACT_CON followed by one ACT_TERM
        match rx.recv().await.unwrap() {
            AsduPayload::Typed(con) => {
                assert_eq!(con.cause(), CauseOfTransmission::ActivationConfirmation);
                assert!(!con.cot().negative);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        match rx.recv().await.unwrap() {
            AsduPayload::Typed(term) => {
                assert_eq!(term.cause(), CauseOfTransmission::ActivationTermination);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn declined_interrogation_confirms_negatively() {
        let (handle, mut rx) = handle_pair();
        let handler = RecordingHandler::new(false);
        dispatch_asdu(&handler, &handle, interrogation_asdu(1, 20), 1)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            AsduPayload::Typed(con) => {
                assert_eq!(con.cause(), CauseOfTransmission::ActivationConfirmation);
                assert!(con.cot().negative);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_common_address_is_mirrored() {
        let (handle, mut rx) = handle_pair();
        let handler = RecordingHandler::new(true);
        dispatch_asdu(&handler, &handle, interrogation_asdu(9, 20), 1)
            .await
            .unwrap();

        assert!(handler.interrogations.lock().unwrap().is_empty());
        match rx.recv().await.unwrap() {
            AsduPayload::Typed(response) => {
                assert_eq!(
                    response.cause(),
                    CauseOfTransmission::UnknownCommonAddress
                );
                assert!(response.cot().negative);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_address_is_accepted() {
        let (handle, _rx) = handle_pair();
        let handler = RecordingHandler::new(true);
        dispatch_asdu(&handler, &handle, interrogation_asdu(0xFFFF, 21), 1)
            .await
            .unwrap();
        assert_eq!(*handler.interrogations.lock().unwrap(), vec![21]);
    }

    #[tokio::test]
    async fn broadcast_address_rejected_for_point_commands() {
        let (handle, mut rx) = handle_pair();
        let handler = RecordingHandler::new(true);
        let mut asdu = Asdu::new(
            AppLayerParameters::default(),
            TypeId::SingleCommand,
            Cot::new(CauseOfTransmission::Activation),
            0xFFFF,
        );
        asdu.add_object(InformationObject::SingleCommand {
            address: 2000,
            state: true,
            select: false,
            qualifier: 0,
        })
        .unwrap();
        dispatch_asdu(&handler, &handle, asdu, 1).await.unwrap();

        match rx.recv().await.unwrap() {
            AsduPayload::Typed(response) => {
                assert_eq!(
                    response.cause(),
                    CauseOfTransmission::UnknownCommonAddress
                );
                assert!(response.cot().negative);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_asdu_answered_with_mirror_cause() {
        let (handle, mut rx) = handle_pair();
        let handler = RecordingHandler::new(true);
        let raw = vec![200, 0x01, 0x06, 0x00, 0x01, 0x00, 0x64, 0x00, 0x00, 0x01];
        dispatch_raw(&handler, &handle, raw, AsduDecodeError::UnknownType(200))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            AsduPayload::Raw { bytes, .. } => assert_eq!(bytes[2], 44 | 0x40),
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(matches!(
            handler.events.lock().unwrap()[0],
            ConnectionEvent::NegativeConfirm {
                cause: CauseOfTransmission::UnknownTypeIdentification
            }
        ));
    }

    #[tokio::test]
    async fn clock_sync_confirmed_by_library() {
        let (handle, mut rx) = handle_pair();
        let handler = RecordingHandler::new(true);
        let mut asdu = Asdu::new(
            AppLayerParameters::default(),
            TypeId::ClockSyncCommand,
            Cot::new(CauseOfTransmission::Activation),
            1,
        );
        asdu.add_object(InformationObject::ClockSync {
            address: 0,
            timestamp: Cp56Time2a {
                day_of_month: 1,
                month: 1,
                year: 24,
                ..Default::default()
            },
        })
        .unwrap();
        dispatch_asdu(&handler, &handle, asdu, 1).await.unwrap();

        match rx.recv().await.unwrap() {
            AsduPayload::Typed(con) => {
                assert_eq!(con.cause(), CauseOfTransmission::ActivationConfirmation);
                assert!(!con.cot().negative);
                assert_eq!(con.type_id(), TypeId::ClockSyncCommand);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
