//! Delivery of host messages across the process boundary.
//!
//! Responses and notifications are retried exactly once after
//! [`RETRY_DELAY`], and only when nothing reached the writer. Stream updates
//! are sent at most once. The streaming pipeline itself never retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use pal_core::protocol::{HostEvent, Outbound};
use pal_core::stream::StreamIncrement;

pub const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("message channel closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(String),
    /// Nothing was written; sending again cannot duplicate or tear a line.
    #[error("failed to deliver message: {0}")]
    Io(String),
    /// Part of the line may be on the wire already.
    #[error("message partially delivered: {0}")]
    Torn(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, message: &Outbound) -> Result<(), DeliveryError>;
}

/// Send once, and once more after [`RETRY_DELAY`] if the first attempt failed
/// before writing anything.
pub async fn deliver_with_retry(
    channel: &dyn MessageChannel,
    message: &Outbound,
) -> Result<(), DeliveryError> {
    match channel.send(message).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_retryable() => {
            debug!(error = %e, "delivery failed, retrying once");
            tokio::time::sleep(RETRY_DELAY).await;
            channel.send(message).await
        }
        Err(e) => Err(e),
    }
}

/// One JSON object per line on any async writer (stdout in host mode).
pub struct JsonLinesChannel<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> MessageChannel for JsonLinesChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: &Outbound) -> Result<(), DeliveryError> {
        let mut line =
            serde_json::to_vec(message).map_err(|e| DeliveryError::Encode(e.to_string()))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let mut written = 0;
        while written < line.len() {
            let result = writer.write(&line[written..]).await;
            match result {
                Ok(0) => {
                    let e = std::io::Error::from(std::io::ErrorKind::WriteZero);
                    return Err(torn(&mut *writer, written, e).await);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(torn(&mut *writer, written, e).await),
            }
        }
        // The line was handed over whole; a failed flush must not resend it.
        writer.flush().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => DeliveryError::Closed,
            _ => DeliveryError::Torn(e.to_string()),
        })
    }
}

/// Map a write failure after `written` bytes of a line went out. A torn line is
/// terminated so the next message starts on a fresh line.
async fn torn<W>(writer: &mut W, written: usize, e: std::io::Error) -> DeliveryError
where
    W: AsyncWrite + Unpin + Send,
{
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        return DeliveryError::Closed;
    }
    if written == 0 {
        return DeliveryError::Io(e.to_string());
    }
    warn!(written, error = %e, "line torn mid-write");
    if let Err(e) = writer.write_all(b"\n").await {
        debug!(error = %e, "could not terminate torn line");
    }
    DeliveryError::Torn(e.to_string())
}

/// Forward every published increment to `channel` as a `streamUpdate` event.
/// Each increment is sent at most once. Ends when the broadcaster is dropped.
pub fn spawn_forwarder(
    mut rx: broadcast::Receiver<StreamIncrement>,
    channel: Arc<dyn MessageChannel>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(increment) => {
                    let request_id = increment.request_id.clone();
                    let message = Outbound::Event(HostEvent::StreamUpdate(increment));
                    if let Err(e) = channel.send(&message).await {
                        warn!(%request_id, error = %e, "dropped stream update");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "stream forwarder lagged, dropped increments");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("stream forwarder channel closed");
                    break;
                }
            }
        }
    })
}
