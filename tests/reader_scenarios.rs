//! End-to-end reader scenarios against the in-memory broker and directory.
//!
//! Covers discovery reconciliation, credit flow control, drain-on-close,
//! single-message delivery, lease renewal and direct connection failure.

use std::sync::Arc;
use std::time::Duration;

use nsq_reader::discovery::MockDirectory;
use nsq_reader::transport::{MockBroker, MockTransport};
use nsq_reader::{Address, Reader, ReaderConfig, ReaderError, SingleMessageReader};

fn nsqd(name: &str) -> Address {
    Address::new(name, 4150)
}

fn lookupd() -> Address {
    Address::new("lookupd", 4161)
}

fn config() -> ReaderConfig {
    let mut config = ReaderConfig::new("events", "archive");
    config.close_timeout_ms = 50;
    config.lookupd_poll_interval_secs = 10;
    config
}

struct Harness {
    transport: MockTransport,
    directory: Arc<MockDirectory>,
}

impl Harness {
    fn new() -> Self {
        Self {
            transport: MockTransport::new(),
            directory: Arc::new(MockDirectory::new()),
        }
    }

    fn broker(&self, name: &str) -> MockBroker {
        self.transport.broker(&nsqd(name))
    }

    async fn reader(&self, config: ReaderConfig) -> Reader {
        Reader::start(config, Arc::new(self.transport.clone()), self.directory.clone())
            .await
            .unwrap()
    }
}

/// Connections follow the directory: added producers are connected,
/// vanished ones closed, unchanged ones left alone.
#[tokio::test(start_paused = true)]
async fn test_lookup_reconciliation() {
    let h = Harness::new();
    h.directory
        .set_producers(&lookupd(), vec![nsqd("a"), nsqd("b"), nsqd("c")]);

    let mut config = config();
    config.lookupd_http_addresses = vec![lookupd()];
    let reader = h.reader(config).await;

    for name in ["a", "b", "c"] {
        assert!(h.broker(name).wait_for(|b| b.count("SUB") == 1).await);
        assert!(h.broker(name).wait_for(|b| b.last_ready() == Some(1)).await);
    }
    assert_eq!(reader.connections(), vec![nsqd("a"), nsqd("b"), nsqd("c")]);

    h.directory
        .set_producers(&lookupd(), vec![nsqd("b"), nsqd("c"), nsqd("d")]);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(h.broker("d").wait_for(|b| b.count("SUB") == 1).await);
    assert!(h.broker("a").wait_for(|b| !b.is_connected()).await);
    assert_eq!(h.broker("a").count("CLS"), 1);
    assert_eq!(h.broker("b").connects(), 1);
    assert_eq!(h.broker("c").connects(), 1);
    assert_eq!(h.broker("b").count("CLS"), 0);
    assert_eq!(reader.connections(), vec![nsqd("b"), nsqd("c"), nsqd("d")]);

    reader.close().await.unwrap();
    for name in ["b", "c", "d"] {
        assert!(!h.broker(name).is_connected());
    }
}

/// An unchanged answer causes no connects or closes.
#[tokio::test(start_paused = true)]
async fn test_repeated_polls_are_idempotent() {
    let h = Harness::new();
    h.directory.set_producers(&lookupd(), vec![nsqd("a")]);

    let mut config = config();
    config.lookupd_http_addresses = vec![lookupd()];
    let reader = h.reader(config).await;
    assert!(h.broker("a").wait_for(|b| b.count("SUB") == 1).await);

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert!(h.directory.calls() >= 4);
    assert_eq!(h.broker("a").connects(), 1);
    assert_eq!(h.broker("a").count("CLS"), 0);

    reader.close().await.unwrap();
}

/// A broker reachable both directly and through the directory gets one
/// connection.
#[tokio::test]
async fn test_one_connection_per_address() {
    let h = Harness::new();
    h.directory.set_producers(&lookupd(), vec![nsqd("a")]);

    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd("a")];
    config.lookupd_http_addresses = vec![lookupd()];
    let reader = h.reader(config).await;

    assert!(h.broker("a").wait_for(|b| b.count("SUB") == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.broker("a").connects(), 1);
    assert_eq!(reader.connections(), vec![nsqd("a")]);

    reader.close().await.unwrap();
}

/// Never more unsettled messages than granted; the excess goes back
/// untouched.
#[tokio::test]
async fn test_credit_limits_in_flight() {
    let h = Harness::new();
    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd("a")];
    config.max_in_flight = 3;
    let mut reader = h.reader(config).await;
    let broker = h.broker("a");
    assert!(broker.wait_for(|b| b.last_ready() == Some(3)).await);

    let ids: Vec<_> = (0..5u8).map(|i| broker.deliver(&[i]).unwrap()).collect();
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(reader.next().await.unwrap().unwrap());
    }
    assert!(broker.wait_for(|b| b.requeued().len() == 2).await);
    assert_eq!(broker.requeued(), ids[3..].to_vec());

    for message in held {
        message.finish().await.unwrap();
    }
    assert_eq!(broker.finished(), ids[..3].to_vec());
    reader.close().await.unwrap();
}

/// A transport failure requeues every unsettled message and the reader
/// recovers through a new connection.
#[tokio::test]
async fn test_transport_error_requeues_in_flight() {
    let h = Harness::new();
    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd("a")];
    config.max_in_flight = 10;
    let mut reader = h.reader(config).await;
    let broker = h.broker("a");
    assert!(broker.wait_for(|b| b.last_ready() == Some(10)).await);

    let mut ids: Vec<_> = (0..10u8).map(|i| broker.deliver(&[i]).unwrap()).collect();
    let mut held = Vec::new();
    for _ in 0..10 {
        held.push(reader.next().await.unwrap().unwrap());
    }

    broker.fail_reads("malformed frame");
    assert!(broker.wait_for(|b| b.requeued().len() == 10).await);
    let mut requeued = broker.requeued();
    requeued.sort();
    ids.sort();
    assert_eq!(requeued, ids);

    for message in held {
        assert!(matches!(
            message.finish().await,
            Err(ReaderError::NotInFlight(_))
        ));
    }
    assert!(broker.finished().is_empty());

    assert!(broker.wait_for(|b| b.count("SUB") == 2).await);
    reader.close().await.unwrap();
}

/// Closing the reader requeues everything still unsettled before it
/// resolves.
#[tokio::test]
async fn test_close_drains_every_connection() {
    let h = Harness::new();
    h.directory.set_producers(&lookupd(), vec![nsqd("b")]);
    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd("a")];
    config.lookupd_http_addresses = vec![lookupd()];
    config.max_in_flight = 2;
    let mut reader = h.reader(config).await;
    for name in ["a", "b"] {
        assert!(h.broker(name).wait_for(|b| b.last_ready() == Some(2)).await);
    }

    let from_a = h.broker("a").deliver(b"a").unwrap();
    let from_b = h.broker("b").deliver(b"b").unwrap();
    let first = reader.next().await.unwrap().unwrap();
    let second = reader.next().await.unwrap().unwrap();

    reader.close().await.unwrap();
    assert_eq!(h.broker("a").requeued(), vec![from_a]);
    assert_eq!(h.broker("b").requeued(), vec![from_b]);
    for name in ["a", "b"] {
        assert_eq!(h.broker(name).count("CLS"), 1);
        assert!(!h.broker(name).is_connected());
    }
    drop((first, second));
}

/// With two brokers racing, the single-message reader keeps the first
/// message and returns the other untouched.
#[tokio::test]
async fn test_single_message_reader() {
    let h = Harness::new();
    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd("a"), nsqd("b")];
    let mut reader = SingleMessageReader::start(
        config,
        Arc::new(h.transport.clone()),
        h.directory.clone(),
    )
    .await
    .unwrap();
    let (a, b) = (h.broker("a"), h.broker("b"));
    assert!(a.wait_for(|x| x.last_ready() == Some(0)).await);
    assert!(b.wait_for(|x| x.last_ready() == Some(0)).await);

    let consumer = tokio::spawn(async move {
        let message = reader.next().await;
        (reader, message)
    });
    assert!(a.wait_for(|x| x.last_ready() == Some(1)).await);
    assert!(b.wait_for(|x| x.last_ready() == Some(1)).await);

    let id_a = a.deliver(b"a").unwrap();
    let id_b = b.deliver(b"b").unwrap();
    let (reader, message) = consumer.await.unwrap();
    let message = message.unwrap().unwrap();

    let (winner, loser, loser_id) = if message.id() == id_a {
        (&a, &b, id_b)
    } else {
        (&b, &a, id_a)
    };
    assert!(loser.wait_for(|x| x.requeued() == vec![loser_id]).await);
    assert!(winner.requeued().is_empty());
    assert_eq!(a.last_ready(), Some(0));
    assert_eq!(b.last_ready(), Some(0));

    message.finish().await.unwrap();
    assert_eq!(winner.finished().len(), 1);
    reader.close().await.unwrap();
}

/// A slow handler keeps its lease; settling stops the renewals.
#[tokio::test(start_paused = true)]
async fn test_lease_keepalive() {
    let h = Harness::new();
    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd("a")];
    config.lease_keepalive_interval_secs = 5;
    let mut reader = h.reader(config).await;
    let broker = h.broker("a");
    assert!(broker.wait_for(|b| b.last_ready() == Some(1)).await);

    let id = broker.deliver(b"slow").unwrap();
    let message = reader.next().await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(broker.touches(id), 3);

    message.requeue(Duration::from_secs(2)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(broker.touches(id), 3);

    reader.close().await.unwrap();
}

/// A direct broker that stays unreachable ends the stream with an error.
#[tokio::test(start_paused = true)]
async fn test_direct_connection_failure_is_surfaced() {
    let h = Harness::new();
    h.broker("a").set_refuse_connect(true);
    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd("a")];
    config.max_reconnect_attempts = 3;
    let mut reader = h.reader(config).await;

    match reader.next().await {
        Some(Err(ReaderError::DirectConnectionLost { address, attempts, .. })) => {
            assert_eq!(address, nsqd("a"));
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected item: {:?}", other),
    }
    assert!(reader.next().await.is_none());
    reader.close().await.unwrap();
}

/// A directory outage leaves existing connections in place.
#[tokio::test(start_paused = true)]
async fn test_directory_outage_keeps_connections() {
    let h = Harness::new();
    h.directory.set_producers(&lookupd(), vec![nsqd("a")]);
    let mut config = config();
    config.lookupd_http_addresses = vec![lookupd()];
    let reader = h.reader(config).await;
    assert!(h.broker("a").wait_for(|b| b.count("SUB") == 1).await);

    h.directory.set_failure(&lookupd(), "connection refused");
    tokio::time::sleep(Duration::from_secs(25)).await;

    assert!(h.broker("a").is_connected());
    assert_eq!(h.broker("a").count("CLS"), 0);
    assert_eq!(reader.connections(), vec![nsqd("a")]);
    reader.close().await.unwrap();
}
