use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::*;
use crate::discovery::{Directory, DiscoveryError, MockDirectory};
use crate::transport::MockTransport;

fn nsqd(n: u16) -> Address {
    Address::new(format!("nsqd-{n}"), 4150)
}

fn lookupd() -> Address {
    Address::new("lookupd-0", 4161)
}

fn config() -> ReaderConfig {
    let mut config = ReaderConfig::new("events", "archive");
    config.max_in_flight = 4;
    config.close_timeout_ms = 50;
    config
}

async fn start(
    config: ReaderConfig,
    transport: &MockTransport,
    directory: &Arc<MockDirectory>,
) -> Reader {
    Reader::start(config, Arc::new(transport.clone()), directory.clone())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let transport = MockTransport::new();
    let directory = Arc::new(MockDirectory::new());

    let result = Reader::start(config(), Arc::new(transport), directory).await;
    assert!(matches!(result, Err(ReaderError::Config(_))));
}

#[tokio::test]
async fn test_reader_fans_in_lookup_and_direct_connections() {
    let transport = MockTransport::new();
    let directory = Arc::new(MockDirectory::new());
    directory.set_producers(&lookupd(), vec![nsqd(1)]);

    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd(0)];
    config.lookupd_http_addresses = vec![lookupd()];
    let mut reader = start(config, &transport, &directory).await;

    let direct = transport.broker(&nsqd(0));
    let discovered = transport.broker(&nsqd(1));
    assert!(direct.wait_for(|b| b.count("SUB") == 1).await);
    assert!(discovered.wait_for(|b| b.count("SUB") == 1).await);
    assert!(direct.wait_for(|b| b.last_ready() == Some(4)).await);

    let first = direct.deliver(b"direct").unwrap();
    let message = reader.next().await.unwrap().unwrap();
    assert_eq!(message.id(), first);
    assert_eq!(message.address(), &nsqd(0));
    message.finish().await.unwrap();

    let second = discovered.deliver(b"discovered").unwrap();
    let message = reader.next().await.unwrap().unwrap();
    assert_eq!(message.id(), second);
    message.finish().await.unwrap();

    assert_eq!(reader.connections(), vec![nsqd(0), nsqd(1)]);
    reader.close().await.unwrap();
    assert!(!direct.is_connected());
    assert!(!discovered.is_connected());
}

#[tokio::test]
async fn test_direct_connection_loss_ends_stream() {
    let transport = MockTransport::new();
    let directory = Arc::new(MockDirectory::new());
    transport.broker(&nsqd(0)).set_refuse_connect(true);

    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd(0)];
    config.max_reconnect_attempts = 0;
    let mut reader = start(config, &transport, &directory).await;

    match reader.next().await {
        Some(Err(ReaderError::DirectConnectionLost { address, attempts, .. })) => {
            assert_eq!(address, nsqd(0));
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected item: {:?}", other),
    }
    assert!(reader.next().await.is_none());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_grant_reaches_every_connection() {
    let transport = MockTransport::new();
    let directory = Arc::new(MockDirectory::new());

    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd(0), nsqd(1)];
    let reader = start(config, &transport, &directory).await;
    for n in 0..2 {
        assert!(transport.broker(&nsqd(n)).wait_for(|b| b.last_ready() == Some(4)).await);
    }

    reader.grant(7).await;
    for n in 0..2 {
        assert_eq!(transport.broker(&nsqd(n)).last_ready(), Some(7));
    }
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_uses_current_credit() {
    let transport = MockTransport::new();
    let directory = Arc::new(MockDirectory::new());

    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd(0)];
    let reader = start(config, &transport, &directory).await;
    let broker = transport.broker(&nsqd(0));
    assert!(broker.wait_for(|b| b.last_ready() == Some(4)).await);

    reader.grant(2).await;
    broker.drop_connection();
    assert!(broker.wait_for(|b| b.count("SUB") == 2).await);
    assert!(broker.wait_for(|b| b.last_ready() == Some(2)).await);

    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_close_requeues_undelivered_and_unsettled() {
    let transport = MockTransport::new();
    let directory = Arc::new(MockDirectory::new());

    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd(0)];
    let mut reader = start(config, &transport, &directory).await;
    let broker = transport.broker(&nsqd(0));
    assert!(broker.wait_for(|b| b.count("RDY") == 1).await);

    let taken = broker.deliver(b"taken").unwrap();
    let queued = broker.deliver(b"queued").unwrap();
    let message = reader.next().await.unwrap().unwrap();
    assert_eq!(message.id(), taken);

    reader.close().await.unwrap();
    let mut requeued = broker.requeued();
    requeued.sort();
    let mut expected = vec![taken, queued];
    expected.sort();
    assert_eq!(requeued, expected);
    assert!(matches!(message.finish().await, Err(ReaderError::NotInFlight(_))));
}

#[tokio::test]
async fn test_reader_is_a_stream() {
    let transport = MockTransport::new();
    let directory = Arc::new(MockDirectory::new());

    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd(0)];
    let mut reader = start(config, &transport, &directory).await;
    let broker = transport.broker(&nsqd(0));
    assert!(broker.wait_for(|b| b.count("RDY") == 1).await);

    for body in [&b"a"[..], b"b", b"c"] {
        broker.deliver(body).unwrap();
    }
    let bodies: Vec<Vec<u8>> = (&mut reader)
        .take(3)
        .then(|item| async move {
            let message = item.unwrap();
            let body = message.body().to_vec();
            message.finish().await.unwrap();
            body
        })
        .collect()
        .await;
    assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    reader.close().await.unwrap();
}

/// Answers the first query, then crashes the lookup that asks again.
struct CrashingDirectory {
    producers: Vec<Address>,
    calls: AtomicUsize,
}

#[async_trait]
impl Directory for CrashingDirectory {
    async fn producers(
        &self,
        _lookup: &Address,
        _topic: &str,
    ) -> std::result::Result<Vec<Address>, DiscoveryError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            panic!("directory client crashed");
        }
        Ok(self.producers.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn test_close_tears_down_every_child_when_one_fails() {
    let transport = MockTransport::new();
    let directory = Arc::new(CrashingDirectory {
        producers: vec![nsqd(1)],
        calls: AtomicUsize::new(0),
    });

    let mut config = config();
    config.nsqd_tcp_addresses = vec![nsqd(0)];
    config.lookupd_http_addresses = vec![lookupd()];
    config.lookupd_poll_interval_secs = 10;
    let mut reader = Reader::start(config, Arc::new(transport.clone()), directory.clone())
        .await
        .unwrap();

    let direct = transport.broker(&nsqd(0));
    let discovered = transport.broker(&nsqd(1));
    assert!(direct.wait_for(|b| b.last_ready() == Some(4)).await);
    assert!(discovered.wait_for(|b| b.last_ready() == Some(4)).await);

    let from_direct = direct.deliver(b"direct").unwrap();
    let from_discovered = discovered.deliver(b"discovered").unwrap();
    let first = reader.next().await.unwrap().unwrap();
    let second = reader.next().await.unwrap().unwrap();

    // The second poll takes the lookup's task down.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(directory.calls.load(Ordering::SeqCst), 2);

    let result = reader.close().await;
    assert!(matches!(result, Err(ReaderError::Task(_))));
    assert_eq!(direct.requeued(), vec![from_direct]);
    assert_eq!(discovered.requeued(), vec![from_discovered]);
    for broker in [&direct, &discovered] {
        assert_eq!(broker.count("CLS"), 1);
        assert!(!broker.is_connected());
    }
    drop((first, second));
}
