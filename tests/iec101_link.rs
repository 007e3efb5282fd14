//! CS101 master/slave scenarios over an in-memory line

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use voltage_iec60870::iec101::{
    Iec101Master, Iec101MasterConfig, Iec101Slave, Iec101SlaveConfig,
};
use voltage_iec60870::information_objects::InformationObject;
use voltage_iec60870::session::{MasterConnection, MasterEvent, ServerHandler};
use voltage_iec60870::{
    Asdu, CauseOfTransmission, ConnectionEvent, Cot, LinkLayerParameters, LinkMode,
    QualityDescriptor, Result, TypeId,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_link() -> LinkLayerParameters {
    LinkLayerParameters {
        ack_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

fn master_config() -> Iec101MasterConfig {
    Iec101MasterConfig::new()
        .link(fast_link())
        .poll_interval(Duration::from_millis(50))
        .build()
        .unwrap()
}

fn slave_config(link_address: u16) -> Iec101SlaveConfig {
    Iec101SlaveConfig::new()
        .link(fast_link())
        .link_address(link_address)
        .common_address(1)
        .build()
        .unwrap()
}

fn spontaneous_point(address: u32, value: bool) -> Asdu {
    let mut asdu = Asdu::new(
        voltage_iec60870::AppLayerParameters::default(),
        TypeId::SinglePoint,
        Cot::new(CauseOfTransmission::Spontaneous),
        1,
    );
    asdu.add_object(InformationObject::SinglePoint {
        address,
        value,
        quality: QualityDescriptor::default(),
    })
    .unwrap();
    asdu
}

async fn next_event(events: &mut mpsc::Receiver<MasterEvent>) -> MasterEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("event within deadline")
        .expect("event stream open")
}

async fn next_asdu(events: &mut mpsc::Receiver<MasterEvent>) -> Asdu {
    loop {
        if let MasterEvent::Asdu(asdu) = next_event(events).await {
            return asdu;
        }
    }
}

async fn wait_link_up(events: &mut mpsc::Receiver<MasterEvent>) {
    loop {
        if let MasterEvent::Connection(ConnectionEvent::Opened) = next_event(events).await {
            return;
        }
    }
}

#[derive(Default)]
struct RtuHandler {
    interrogations: StdMutex<Vec<u8>>,
}

#[async_trait]
impl ServerHandler for RtuHandler {
    async fn handle_interrogation(
        &self,
        connection: &dyn MasterConnection,
        asdu: &Asdu,
        qualifier: u8,
    ) -> Result<bool> {
        self.interrogations.lock().unwrap().push(qualifier);
        connection.send_act_con(asdu, false).await?;
        connection.send_act_term(asdu).await?;
        Ok(true)
    }
}

#[tokio::test]
async fn unbalanced_poll_delivers_class1_data() {
    let (master_end, slave_end) = tokio::io::duplex(4096);

    let handler = Arc::new(RtuHandler::default());
    let mut slave = Iec101Slave::new(slave_config(3), handler.clone());
    slave.start(slave_end).unwrap();

    let mut master = Iec101Master::new(master_config());
    master.add_slave(3).await.unwrap();
    let mut events = master.subscribe().unwrap();
    master.start(master_end).unwrap();

    wait_link_up(&mut events).await;

    // spontaneous data raises ACD; the master fetches it with a class 1 poll
    slave.enqueue_class1(spontaneous_point(100, true)).await.unwrap();
    slave.enqueue_class1(spontaneous_point(101, false)).await.unwrap();

    let first = next_asdu(&mut events).await;
    assert_eq!(first.cause(), CauseOfTransmission::Spontaneous);
    assert_eq!(first.objects()[0].address(), 100);

    let second = next_asdu(&mut events).await;
    assert_eq!(second.objects()[0].address(), 101);

    master.stop().await;
    slave.stop().await;
}

#[tokio::test]
async fn unbalanced_command_round_trip() {
    let (master_end, slave_end) = tokio::io::duplex(4096);

    let handler = Arc::new(RtuHandler::default());
    let mut slave = Iec101Slave::new(slave_config(3), handler.clone());
    slave.start(slave_end).unwrap();

    let mut master = Iec101Master::new(master_config());
    master.add_slave(3).await.unwrap();
    let mut events = master.subscribe().unwrap();
    master.start(master_end).unwrap();

    wait_link_up(&mut events).await;

    master.general_interrogation(3, 1, 20).await.unwrap();

    // the handler's ACT_CON and ACT_TERM come back as class 1 data
    let con = next_asdu(&mut events).await;
    assert_eq!(con.type_id(), TypeId::InterrogationCommand);
    assert_eq!(con.cause(), CauseOfTransmission::ActivationConfirmation);
    assert!(!con.cot().negative);

    let term = next_asdu(&mut events).await;
    assert_eq!(term.cause(), CauseOfTransmission::ActivationTermination);

    assert_eq!(*handler.interrogations.lock().unwrap(), vec![20]);

    master.stop().await;
    slave.stop().await;
}

#[tokio::test]
async fn class2_poll_delivers_cyclic_data() {
    let (master_end, slave_end) = tokio::io::duplex(4096);

    let handler = Arc::new(RtuHandler::default());
    let mut slave = Iec101Slave::new(slave_config(3), handler.clone());
    slave.start(slave_end).unwrap();

    let mut master = Iec101Master::new(master_config());
    master.add_slave(3).await.unwrap();
    let mut events = master.subscribe().unwrap();
    master.start(master_end).unwrap();

    wait_link_up(&mut events).await;

    let mut cyclic = Asdu::new(
        voltage_iec60870::AppLayerParameters::default(),
        TypeId::MeasuredValueFloat,
        Cot::new(CauseOfTransmission::Periodic),
        1,
    );
    cyclic
        .add_object(InformationObject::MeasuredValueFloat {
            address: 700,
            value: 49.98,
            quality: QualityDescriptor::default(),
        })
        .unwrap();
    slave.enqueue_class2(cyclic).await.unwrap();

    let received = next_asdu(&mut events).await;
    assert_eq!(received.cause(), CauseOfTransmission::Periodic);
    assert_eq!(received.objects()[0].address(), 700);

    master.stop().await;
    slave.stop().await;
}

#[tokio::test]
async fn link_failure_after_retry_budget() {
    // nothing on the other end of the line: resets go unanswered
    let (master_end, _dangling) = tokio::io::duplex(4096);

    let mut master = Iec101Master::new(master_config());
    master.add_slave(3).await.unwrap();
    let mut events = master.subscribe().unwrap();
    master.start(master_end).unwrap();

    loop {
        match next_event(&mut events).await {
            MasterEvent::Connection(ConnectionEvent::Closed(
                voltage_iec60870::CloseReason::LinkBroken,
            )) => break,
            _ => continue,
        }
    }

    master.stop().await;
}

#[tokio::test]
async fn balanced_stations_exchange_user_data() {
    let (a_end, b_end) = tokio::io::duplex(4096);

    let balanced = LinkLayerParameters {
        mode: LinkMode::Balanced,
        ack_timeout: Duration::from_millis(200),
        ..Default::default()
    };

    let mut station_a = Iec101Master::new(
        Iec101MasterConfig::new()
            .link(balanced)
            .poll_interval(Duration::from_millis(50))
            .build()
            .unwrap(),
    );
    station_a.add_slave(2).await.unwrap();
    let mut events_a = station_a.subscribe().unwrap();
    station_a.start(a_end).unwrap();

    let mut station_b = Iec101Master::new(
        Iec101MasterConfig::new()
            .link(balanced)
            .poll_interval(Duration::from_millis(50))
            .build()
            .unwrap(),
    );
    station_b.add_slave(1).await.unwrap();
    let mut events_b = station_b.subscribe().unwrap();
    station_b.start(b_end).unwrap();

    wait_link_up(&mut events_a).await;

    station_a
        .send_asdu(2, spontaneous_point(42, true))
        .await
        .unwrap();

    let received = next_asdu(&mut events_b).await;
    assert_eq!(received.objects()[0].address(), 42);
    assert_eq!(received.cause(), CauseOfTransmission::Spontaneous);

    station_a.stop().await;
    station_b.stop().await;
}
