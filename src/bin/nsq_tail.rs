//! nsq-tail - print every message of a topic/channel to stdout
//!
//! Usage: `nsq-tail [config.yaml]`. Configuration can also come entirely
//! from `NSQ_READER__*` environment variables.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use nsq_reader::utils::bootstrap::init_tracing;
use nsq_reader::{Message, Reader, ReaderConfig, SingleMessageReader};
use tracing::{error, info};

type BoxError = Box<dyn std::error::Error>;

enum Consumer {
    Batched(Reader),
    Single(SingleMessageReader),
}

impl Consumer {
    async fn next(&mut self) -> Option<nsq_reader::Result<Message>> {
        match self {
            Consumer::Batched(reader) => reader.next().await,
            Consumer::Single(reader) => reader.next().await,
        }
    }

    async fn close(self) -> nsq_reader::Result<()> {
        match self {
            Consumer::Batched(reader) => reader.close().await,
            Consumer::Single(reader) => reader.close().await,
        }
    }
}

/// Write and finish messages until the stream ends, `interrupt` fires or
/// `out` fails. A message that could not be written is requeued.
async fn tail<W, F>(consumer: &mut Consumer, out: &mut W, interrupt: F) -> Result<(), BoxError>
where
    W: Write,
    F: Future,
{
    tokio::pin!(interrupt);
    loop {
        let item = tokio::select! {
            item = consumer.next() => item,
            _ = &mut interrupt => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
        };
        match item {
            Some(Ok(message)) => {
                let written = out
                    .write_all(message.body())
                    .and_then(|()| out.write_all(b"\n"));
                if let Err(e) = written {
                    error!(error = %e, "Write failed");
                    if let Err(e) = message.requeue(Duration::ZERO).await {
                        error!(error = %e, "Requeue failed");
                    }
                    return Err(e.into());
                }
                if let Err(e) = message.finish().await {
                    error!(error = %e, "Finish failed");
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "Reader failed");
                return Err(e.into());
            }
            None => return Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = ReaderConfig::load(path.as_deref())?;
    info!(topic = %config.topic, channel = %config.channel, single = config.single_message, "Starting nsq-tail");

    let mut consumer = if config.single_message {
        Consumer::Single(SingleMessageReader::connect(config).await?)
    } else {
        Consumer::Batched(Reader::connect(config).await?)
    };

    let outcome = tail(&mut consumer, &mut std::io::stdout(), tokio::signal::ctrl_c()).await;

    // Drain before surfacing any error.
    consumer.close().await?;
    outcome
}
