//! Post office tests driven directly through `PostOffice::handle`, with an
//! in-memory writer standing in for the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use tidemq::auth::{AllowAll, AuthProvider};
use tidemq::broker::{
    ClientConnection, Flow, InboundEvent, PacketWriter, PostOffice, PostOfficeConfig, SendError,
};
use tidemq::config::{AuthConfig, UserConfig};
use tidemq::persistence::{FjallBackend, PersistenceManager, StorageBackend};
use tidemq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    Subscribe, Subscription, Will, PROTOCOL_LEVEL_V31, PROTOCOL_NAME_V31,
};

#[derive(Default)]
struct MemoryWriter {
    sent: Mutex<Vec<Packet>>,
    closed: AtomicBool,
}

impl PacketWriter for MemoryWriter {
    fn send(&self, packet: Packet) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.sent.lock().push(packet);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct Client {
    conn: ClientConnection,
    writer: Arc<MemoryWriter>,
}

impl Client {
    fn new(id: u64) -> Self {
        let writer = Arc::new(MemoryWriter::default());
        Self {
            conn: ClientConnection::new(id, writer.clone()),
            writer,
        }
    }

    async fn send(&mut self, po: &PostOffice, packet: Packet) -> Flow {
        po.handle(&mut self.conn, InboundEvent::Packet(packet)).await
    }

    async fn lose(&mut self, po: &PostOffice) {
        po.handle(&mut self.conn, InboundEvent::ConnectionLost).await;
    }

    fn take(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.writer.sent.lock())
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        self.take()
            .into_iter()
            .filter_map(|p| match p {
                Packet::Publish(p) => Some(p.payload.to_vec()),
                _ => None,
            })
            .collect()
    }
}

fn connect(client_id: &str, clean_session: bool) -> Packet {
    Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        ..Default::default()
    }))
}

fn subscribe(filter: &str, qos: QoS) -> Packet {
    Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: filter.to_string(),
            qos,
        }],
    })
}

fn publish(topic: &str, qos: QoS, packet_id: Option<u16>, retain: bool, payload: &'static [u8]) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos,
        retain,
        topic: topic.into(),
        packet_id,
        payload: Bytes::from_static(payload),
    })
}

fn accepted(session_present: bool) -> Packet {
    Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted, session_present))
}

#[tokio::test]
async fn test_mqisdp_client_accepted() {
    let po = PostOffice::new(PostOfficeConfig::default(), Arc::new(AllowAll), None);
    let mut client = Client::new(1);
    let packet = Packet::Connect(Box::new(Connect {
        protocol_name: PROTOCOL_NAME_V31.to_string(),
        protocol_level: PROTOCOL_LEVEL_V31,
        client_id: "legacy".into(),
        ..Default::default()
    }));
    assert_eq!(client.send(&po, packet).await, Flow::Continue);
    assert_eq!(client.take(), vec![accepted(false)]);
}

#[tokio::test]
async fn test_bad_credentials_refused() {
    let auth = AuthConfig {
        enabled: true,
        allow_anonymous: false,
        users: vec![UserConfig {
            username: "alice".into(),
            password: "secret".into(),
        }],
    };
    let po = PostOffice::new(
        PostOfficeConfig::default(),
        Arc::new(AuthProvider::new(&auth)),
        None,
    );

    let login = |password: &'static [u8]| {
        Packet::Connect(Box::new(Connect {
            client_id: "c1".into(),
            username: Some("alice".into()),
            password: Some(Bytes::from_static(password)),
            ..Default::default()
        }))
    };

    let mut wrong = Client::new(1);
    assert_eq!(wrong.send(&po, login(b"nope")).await, Flow::Close);
    assert_eq!(
        wrong.take(),
        vec![Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::BadUsernameOrPassword,
            false
        ))]
    );
    assert!(po.registry().retrieve("c1").is_none());

    let mut anonymous = Client::new(2);
    assert_eq!(anonymous.send(&po, connect("c2", true)).await, Flow::Close);

    let mut right = Client::new(3);
    assert_eq!(right.send(&po, login(b"secret")).await, Flow::Continue);
    assert_eq!(right.take(), vec![accepted(false)]);
}

#[tokio::test]
async fn test_takeover_redelivers_inflight_to_new_connection() {
    let po = PostOffice::new(PostOfficeConfig::default(), Arc::new(AllowAll), None);

    let mut first = Client::new(1);
    first.send(&po, connect("dev", false)).await;
    first.send(&po, subscribe("cmd/#", QoS::AtLeastOnce)).await;
    first.take();

    let mut publisher = Client::new(2);
    publisher.send(&po, connect("ctl", true)).await;
    publisher
        .send(&po, publish("cmd/reboot", QoS::AtLeastOnce, Some(1), false, b"now"))
        .await;
    assert_eq!(first.payloads(), vec![b"now".to_vec()]);

    // same client id on a new connection while the first is still open
    let mut second = Client::new(3);
    second.send(&po, connect("dev", false)).await;
    let sent = second.take();
    assert_eq!(sent[0], accepted(true));
    let Packet::Publish(resent) = &sent[1] else {
        panic!("expected redelivered PUBLISH, got {:?}", sent[1]);
    };
    assert!(resent.dup);
    assert_eq!(resent.payload.as_ref(), b"now");

    assert!(first.writer.closed.load(Ordering::Acquire));
    first.lose(&po).await;

    // the new connection still owns the session
    publisher
        .send(&po, publish("cmd/stop", QoS::AtMostOnce, None, false, b"stop"))
        .await;
    assert_eq!(second.payloads(), vec![b"stop".to_vec()]);
}

#[tokio::test]
async fn test_will_honours_retain_and_max_qos() {
    let config = PostOfficeConfig {
        max_qos: QoS::AtLeastOnce,
        ..Default::default()
    };
    let po = PostOffice::new(config, Arc::new(AllowAll), None);

    let mut client = Client::new(1);
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "sensor".into(),
        will: Some(Will {
            topic: "status/sensor".into(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::ExactlyOnce,
            retain: true,
        }),
        ..Default::default()
    }));
    client.send(&po, packet).await;
    client.lose(&po).await;

    let retained = po.retained().get("status/sensor");
    assert!(retained.is_some_and(|m| m.qos == QoS::AtLeastOnce && m.payload.as_ref() == b"offline"));

    let mut late = Client::new(2);
    late.send(&po, connect("late", true)).await;
    late.take();
    late.send(&po, subscribe("status/+", QoS::ExactlyOnce)).await;
    assert_eq!(late.payloads(), vec![b"offline".to_vec()]);
}

#[tokio::test]
async fn test_offline_queue_drops_oldest() {
    let mut config = PostOfficeConfig::default();
    config.session_limits.max_queued_messages = 2;
    let po = PostOffice::new(config, Arc::new(AllowAll), None);

    let mut sub = Client::new(1);
    sub.send(&po, connect("sub", false)).await;
    sub.send(&po, subscribe("q", QoS::AtLeastOnce)).await;
    sub.send(&po, Packet::Disconnect).await;

    let mut publisher = Client::new(2);
    publisher.send(&po, connect("pub", true)).await;
    for (id, payload) in [(1, b"1" as &'static [u8]), (2, b"2"), (3, b"3")] {
        publisher
            .send(&po, publish("q", QoS::AtLeastOnce, Some(id), false, payload))
            .await;
    }

    let mut sub = Client::new(3);
    sub.send(&po, connect("sub", false)).await;
    assert_eq!(sub.payloads(), vec![b"2".to_vec(), b"3".to_vec()]);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(FjallBackend::open(dir.path()).unwrap());

    {
        let persistence = Arc::new(PersistenceManager::new(
            backend.clone(),
            Duration::from_millis(10),
            100,
        ));
        let po = PostOffice::new(
            PostOfficeConfig::default(),
            Arc::new(AllowAll),
            Some(persistence.clone()),
        );

        let mut sub = Client::new(1);
        sub.send(&po, connect("sub", false)).await;
        sub.send(&po, subscribe("news/#", QoS::ExactlyOnce)).await;
        sub.take();

        let mut publisher = Client::new(2);
        publisher.send(&po, connect("pub", true)).await;
        // in flight to the connected subscriber, never acknowledged
        publisher
            .send(&po, publish("news/a", QoS::AtLeastOnce, Some(1), false, b"inflight"))
            .await;
        sub.lose(&po).await;

        // queued while the subscriber is offline
        publisher
            .send(&po, publish("news/b", QoS::ExactlyOnce, Some(2), false, b"queued"))
            .await;
        publisher.send(&po, Packet::PubRel(PubRel::new(2))).await;
        publisher
            .send(&po, publish("news/c", QoS::AtMostOnce, None, true, b"retained"))
            .await;

        po.shutdown();
        persistence.shutdown().await.unwrap();
    }

    let persistence = Arc::new(PersistenceManager::new(
        backend.clone(),
        Duration::from_millis(10),
        100,
    ));
    let po = PostOffice::new(
        PostOfficeConfig::default(),
        Arc::new(AllowAll),
        Some(persistence.clone()),
    );
    po.restore(persistence.load_all().await.unwrap());
    assert_eq!(po.retained().len(), 1);

    let mut sub = Client::new(10);
    sub.send(&po, connect("sub", false)).await;
    let sent = sub.take();
    assert_eq!(sent[0], accepted(true));

    let publishes: Vec<&Publish> = sent[1..]
        .iter()
        .filter_map(|p| match p {
            Packet::Publish(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(publishes.len(), 2);
    assert_eq!(publishes[0].payload.as_ref(), b"inflight");
    assert!(publishes[0].dup);
    assert_eq!(publishes[1].payload.as_ref(), b"queued");
    assert_eq!(publishes[1].qos, QoS::ExactlyOnce);

    // subscriptions were restored into the matcher
    let mut publisher = Client::new(11);
    publisher.send(&po, connect("pub", true)).await;
    publisher
        .send(&po, publish("news/d", QoS::AtMostOnce, None, false, b"live"))
        .await;
    assert_eq!(sub.payloads(), vec![b"live".to_vec()]);

    let ack = PubAck::new(publishes[0].packet_id.unwrap());
    sub.send(&po, Packet::PubAck(ack)).await;
    let session = po.registry().retrieve("sub").unwrap();
    assert!(session.read().qos1_pending().is_empty());

    persistence.shutdown().await.unwrap();
}

/// Post office over `backend` with its stored state restored
async fn start(backend: &Arc<dyn StorageBackend>) -> (PostOffice, Arc<PersistenceManager>) {
    let persistence = Arc::new(PersistenceManager::new(
        backend.clone(),
        Duration::from_millis(10),
        100,
    ));
    let po = PostOffice::new(
        PostOfficeConfig::default(),
        Arc::new(AllowAll),
        Some(persistence.clone()),
    );
    po.restore(persistence.load_all().await.unwrap());
    (po, persistence)
}

// Stopping without `PostOffice::shutdown` leaves only what was written as
// the session changed.

#[tokio::test]
async fn test_completed_qos2_not_redelivered_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(FjallBackend::open(dir.path()).unwrap());

    {
        let (po, persistence) = start(&backend).await;

        let mut sub = Client::new(1);
        sub.send(&po, connect("sub", false)).await;
        sub.send(&po, subscribe("jobs", QoS::ExactlyOnce)).await;
        sub.send(&po, Packet::Disconnect).await;

        let mut publisher = Client::new(2);
        publisher.send(&po, connect("pub", true)).await;
        publisher
            .send(&po, publish("jobs", QoS::ExactlyOnce, Some(1), false, b"once"))
            .await;
        publisher.send(&po, Packet::PubRel(PubRel::new(1))).await;

        let mut sub = Client::new(3);
        sub.send(&po, connect("sub", false)).await;
        let sent = sub.take();
        let Some(Packet::Publish(delivered)) = sent.get(1) else {
            panic!("expected queued PUBLISH, got {:?}", sent);
        };
        let packet_id = delivered.packet_id.unwrap();

        sub.send(&po, Packet::PubRec(PubRec::new(packet_id))).await;
        assert_eq!(sub.take(), vec![Packet::PubRel(PubRel::new(packet_id))]);
        sub.send(&po, Packet::PubComp(PubComp::new(packet_id))).await;

        persistence.shutdown().await.unwrap();
    }

    let (po, persistence) = start(&backend).await;
    let mut sub = Client::new(10);
    sub.send(&po, connect("sub", false)).await;
    assert_eq!(sub.take(), vec![accepted(true)]);

    persistence.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_acknowledged_inbound_qos2_survives_crash() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(FjallBackend::open(dir.path()).unwrap());

    {
        let (po, persistence) = start(&backend).await;

        let mut publisher = Client::new(1);
        publisher.send(&po, connect("pub", false)).await;
        publisher.take();
        publisher
            .send(&po, publish("jobs", QoS::ExactlyOnce, Some(7), false, b"kept"))
            .await;
        assert_eq!(publisher.take(), vec![Packet::PubRec(PubRec::new(7))]);

        persistence.shutdown().await.unwrap();
    }

    let (po, persistence) = start(&backend).await;

    let mut sub = Client::new(10);
    sub.send(&po, connect("sub", true)).await;
    sub.send(&po, subscribe("jobs", QoS::AtLeastOnce)).await;
    sub.take();

    let mut publisher = Client::new(11);
    publisher.send(&po, connect("pub", false)).await;
    assert_eq!(publisher.take(), vec![accepted(true)]);
    publisher.send(&po, Packet::PubRel(PubRel::new(7))).await;
    assert_eq!(publisher.take(), vec![Packet::PubComp(PubComp::new(7))]);
    assert_eq!(sub.payloads(), vec![b"kept".to_vec()]);

    // released once; a retransmitted PUBREL dispatches nothing
    publisher.send(&po, Packet::PubRel(PubRel::new(7))).await;
    assert!(sub.payloads().is_empty());

    persistence.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_stored_qos_refuses_durable_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(FjallBackend::open(dir.path()).unwrap());

    let session = tidemq::Session::new("dev".into(), false, Default::default());
    let mut stored = tidemq::persistence::StoredSession::from_session(&session);
    stored.subscriptions.push(tidemq::persistence::StoredSubscription {
        filter: "a/b".into(),
        qos: 7,
    });
    backend.set_session("dev", &stored).await.unwrap();

    let (po, persistence) = start(&backend).await;
    assert!(po.matcher().matches("a/b").is_empty());

    let mut durable = Client::new(1);
    assert_eq!(durable.send(&po, connect("dev", false)).await, Flow::Close);
    assert_eq!(
        durable.take(),
        vec![Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::ServerUnavailable,
            false
        ))]
    );

    let mut clean = Client::new(2);
    assert_eq!(clean.send(&po, connect("dev", true)).await, Flow::Continue);
    assert_eq!(clean.take(), vec![accepted(false)]);

    persistence.shutdown().await.unwrap();
}

