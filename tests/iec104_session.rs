//! End-to-end CS104 client/server scenarios over loopback TCP

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use voltage_iec60870::iec104::{
    Iec104Client, Iec104ClientConfig, Iec104Server, Iec104ServerConfig,
};
use voltage_iec60870::information_objects::InformationObject;
use voltage_iec60870::session::{MasterConnection, MasterEvent, ServerHandler};
use voltage_iec60870::{
    ApciParameters, Asdu, CauseOfTransmission, ConnectionEvent, Cot, QualityDescriptor, Result,
    TypeId,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct StationHandler {
    interrogations: StdMutex<Vec<u8>>,
    events: StdMutex<Vec<ConnectionEvent>>,
}

#[async_trait]
impl ServerHandler for StationHandler {
    async fn handle_interrogation(
        &self,
        connection: &dyn MasterConnection,
        asdu: &Asdu,
        qualifier: u8,
    ) -> Result<bool> {
        self.interrogations.lock().unwrap().push(qualifier);

        connection.send_act_con(asdu, false).await?;

        let params = connection.app_layer_parameters();
        let mut data = Asdu::new(
            params,
            TypeId::SinglePoint,
            Cot::new(CauseOfTransmission::StationInterrogation),
            asdu.common_address(),
        );
        data.add_object(InformationObject::SinglePoint {
            address: 100,
            value: true,
            quality: QualityDescriptor::default(),
        })?;
        data.add_object(InformationObject::SinglePoint {
            address: 101,
            value: false,
            quality: QualityDescriptor::default(),
        })?;
        connection.send_asdu(data).await?;

        connection.send_act_term(asdu).await?;
        Ok(true)
    }

    async fn handle_connection_event(&self, _peer: Option<&str>, event: &ConnectionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

async fn start_server(handler: Arc<dyn ServerHandler>) -> (Iec104Server, u16) {
    let config = Iec104ServerConfig::new().with_bind_address("127.0.0.1:0");
    let mut server = Iec104Server::new(config, handler);
    server.start().await.expect("server start");
    let port = server.local_addr().expect("bound").port();
    (server, port)
}

fn client_for(port: u16) -> Iec104Client {
    let config = Iec104ClientConfig::new()
        .host("127.0.0.1")
        .port(port)
        .build()
        .expect("client config");
    Iec104Client::new(config)
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

#[tokio::test]
async fn s1_startdt_handshake() {
    init_tracing();
    let handler = Arc::new(StationHandler::default());
    let (mut server, port) = start_server(handler.clone()).await;

    let mut client = client_for(port);
    let mut events = client.subscribe().unwrap();
    client.connect().await.expect("connect");
    client.start_dt().await.expect("startdt confirmed");

    // the activation surfaced on the client event stream
    loop {
        match next_event(&mut events).await {
            MasterEvent::Connection(ConnectionEvent::Activated) => break,
            _ => continue,
        }
    }

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn s3_interrogation_one_con_one_term() {
    init_tracing();
    let handler = Arc::new(StationHandler::default());
    let (mut server, port) = start_server(handler.clone()).await;

    let mut client = client_for(port);
    let mut events = client.subscribe().unwrap();
    client.connect().await.unwrap();
    client.start_dt().await.unwrap();
    client.general_interrogation(1, 20).await.unwrap();

    let mut confirmations = 0;
    let mut terminations = 0;
    let mut points = Vec::new();
    loop {
        let asdu = next_asdu(&mut events).await;
        match asdu.cause() {
            CauseOfTransmission::ActivationConfirmation => {
                assert_eq!(asdu.type_id(), TypeId::InterrogationCommand);
                assert!(!asdu.cot().negative);
                confirmations += 1;
            }
            CauseOfTransmission::StationInterrogation => {
                assert_eq!(asdu.type_id(), TypeId::SinglePoint);
                points.extend(asdu.objects().iter().map(|o| o.address()));
            }
            CauseOfTransmission::ActivationTermination => {
                assert_eq!(asdu.type_id(), TypeId::InterrogationCommand);
                terminations += 1;
                break;
            }
            other => panic!("unexpected cause {other:?}"),
        }
    }

    assert_eq!(confirmations, 1, "exactly one ACT_CON per activation");
    assert_eq!(terminations, 1, "exactly one ACT_TERM per activation");
    assert_eq!(points, vec![100, 101]);
    assert_eq!(*handler.interrogations.lock().unwrap(), vec![20]);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn spontaneous_events_buffer_and_replay_in_order() {
    init_tracing();
    let handler = Arc::new(StationHandler::default());
    let (mut server, port) = start_server(handler.clone()).await;

    // no client is active yet: these must be buffered
    for i in 0..3u16 {
        let mut asdu = Asdu::new(
            voltage_iec60870::AppLayerParameters::default(),
            TypeId::MeasuredValueScaled,
            Cot::new(CauseOfTransmission::Spontaneous),
            1,
        );
        asdu.add_object(InformationObject::MeasuredValueScaled {
            address: 500 + i as u32,
            value: i as i16,
            quality: QualityDescriptor::default(),
        })
        .unwrap();
        server.enqueue_spontaneous(asdu).await.unwrap();
    }

    let mut client = client_for(port);
    let mut events = client.subscribe().unwrap();
    client.connect().await.unwrap();
    client.start_dt().await.unwrap();

    // replay preserves submission order
    for i in 0..3u32 {
        let asdu = next_asdu(&mut events).await;
        assert_eq!(asdu.cause(), CauseOfTransmission::Spontaneous);
        assert_eq!(asdu.objects()[0].address(), 500 + i);
    }

    // live dispatch once a connection is active
    let mut live = Asdu::new(
        voltage_iec60870::AppLayerParameters::default(),
        TypeId::SinglePoint,
        Cot::new(CauseOfTransmission::Spontaneous),
        1,
    );
    live.add_object(InformationObject::SinglePoint {
        address: 900,
        value: true,
        quality: QualityDescriptor::default(),
    })
    .unwrap();
    server.enqueue_spontaneous(live).await.unwrap();

    let asdu = next_asdu(&mut events).await;
    assert_eq!(asdu.objects()[0].address(), 900);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_command_confirmed_by_library() {
    init_tracing();
    let handler = Arc::new(StationHandler::default());
    let (mut server, port) = start_server(handler.clone()).await;

    let mut client = client_for(port);
    let mut events = client.subscribe().unwrap();
    client.connect().await.unwrap();
    client.start_dt().await.unwrap();
    client.test_command(1).await.unwrap();

    let asdu = next_asdu(&mut events).await;
    assert_eq!(asdu.type_id(), TypeId::TestCommand);
    assert_eq!(asdu.cause(), CauseOfTransmission::ActivationConfirmation);
    assert!(!asdu.cot().negative);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn unknown_common_address_is_answered_negatively() {
    init_tracing();
    let handler = Arc::new(StationHandler::default());
    let (mut server, port) = start_server(handler.clone()).await;

    let mut client = client_for(port);
    let mut events = client.subscribe().unwrap();
    client.connect().await.unwrap();
    client.start_dt().await.unwrap();

    // server is station 1; address station 99 instead
    client.general_interrogation(99, 20).await.unwrap();

    let asdu = next_asdu(&mut events).await;
    assert_eq!(asdu.cause(), CauseOfTransmission::UnknownCommonAddress);
    assert!(asdu.cot().negative);
    assert!(handler.interrogations.lock().unwrap().is_empty());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn s5_sequence_error_closes_connection() {
    init_tracing();
    let handler = Arc::new(StationHandler::default());
    let (mut server, port) = start_server(handler.clone()).await;

    // raw socket so we can violate the sequence on purpose
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    stream
        .write_all(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00]) // STARTDT act
        .await
        .unwrap();
    let mut con = [0u8; 6];
    stream.read_exact(&mut con).await.unwrap();
    assert_eq!(con, [0x68, 0x04, 0x0B, 0x00, 0x00, 0x00]); // STARTDT con

    // I-frame with N(S) = 1 while the server expects 0
    let asdu = [0x01, 0x01, 0x06, 0x00, 0x01, 0x00, 0x64, 0x00, 0x00, 0x01];
    let mut frame = vec![0x68, (4 + asdu.len()) as u8, 0x02, 0x00, 0x00, 0x00];
    frame.extend_from_slice(&asdu);
    stream.write_all(&frame).await.unwrap();

    // the server must drop the connection
    let mut buf = [0u8; 64];
    let closed = timeout(WAIT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break true,
                Ok(_) => continue,
                Err(_) => break true,
            }
        }
    })
    .await
    .expect("close within deadline");
    assert!(closed);

    // and report it through the connection event surface (the dispatcher
    // delivers the close event asynchronously)
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let saw_sequence_error = handler.events.lock().unwrap().iter().any(|e| {
            matches!(
                e,
                ConnectionEvent::Closed(voltage_iec60870::CloseReason::SequenceError)
            )
        });
        if saw_sequence_error {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "events: {:?}",
            handler.events.lock().unwrap()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.stop().await;
}

#[tokio::test]
async fn s6_idle_probe_keeps_connection_alive() {
    init_tracing();
    let handler = Arc::new(StationHandler::default());
    let (mut server, port) = start_server(handler.clone()).await;

    // short client timers so the idle probe fires quickly
    let apci = ApciParameters {
        t1: Duration::from_millis(600),
        t2: Duration::from_millis(200),
        t3: Duration::from_millis(800),
        ..Default::default()
    };
    let config = Iec104ClientConfig::new()
        .host("127.0.0.1")
        .port(port)
        .apci(apci)
        .build()
        .unwrap();
    let mut client = Iec104Client::new(config);
    let mut events = client.subscribe().unwrap();
    client.connect().await.unwrap();
    client.start_dt().await.unwrap();

    // several t3 periods of silence: TESTFR act/con cycles must keep the
    // connection open
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(client.is_connected(), "TESTFR con must prevent closure");

    // the connection still works
    client.general_interrogation(1, 20).await.unwrap();
    let asdu = next_asdu(&mut events).await;
    assert_eq!(asdu.cause(), CauseOfTransmission::ActivationConfirmation);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn max_connections_is_enforced() {
    init_tracing();
    let handler = Arc::new(StationHandler::default());
    let config = Iec104ServerConfig::new()
        .with_bind_address("127.0.0.1:0")
        .with_max_connections(1);
    let mut server = Iec104Server::new(config, handler);
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut first = client_for(port);
    first.connect().await.unwrap();
    first.start_dt().await.unwrap();

    // the second connection is accepted by the OS but closed by the server
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    second
        .write_all(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00])
        .await
        .unwrap();
    let mut buf = [0u8; 6];
    let closed = timeout(WAIT, async {
        matches!(second.read(&mut buf).await, Ok(0) | Err(_))
    })
    .await
    .expect("decision within deadline");
    assert!(closed, "second connection must be rejected");

    first.disconnect().await;
    server.stop().await;
}
