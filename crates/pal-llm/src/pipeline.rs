//! Issue a streaming request, then drive its body to a terminal state.
//!
//! `issue` returns as soon as the response headers are in. From then on a
//! spawned read loop owns the body: it decodes SSE, publishes increments,
//! watches the session's cancellation token and enforces an idle timeout.
//! Exactly one terminal increment is published per request id.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use pal_core::errors::GatewayError;
use pal_core::ids::RequestId;
use pal_core::messages::{Conversation, WireMessage};
use pal_core::stream::{StreamEnd, StreamIncrement};
use pal_settings::{ApiSettings, CredentialResolver};

use crate::api::{self, AnthropicApi, MessagesRequest};
use crate::broadcast::IncrementBroadcaster;
use crate::registry::{SessionEntry, StreamRegistry};
use crate::sse::{classify, SseDecoder, SseEvent, StreamSignal};

/// Knobs for the streaming request and its read loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub max_tokens: u32,
    /// Longest gap between body chunks before the stream counts as dead.
    pub idle_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_settings(settings: &ApiSettings) -> Self {
        Self {
            max_tokens: settings.max_tokens,
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&ApiSettings::default())
    }
}

/// Returned by [`StreamPipeline::issue`] once the request has been accepted.
#[derive(Debug)]
pub struct StreamHandle {
    pub request_id: RequestId,
    pub completion: Completion,
}

/// Resolves when the read loop finishes: the full text on completion, an
/// empty string on cancellation, `StreamInterrupted` on a read failure.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<String, GatewayError>>,
}

impl Future for Completion {
    type Output = Result<String, GatewayError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(GatewayError::StreamInterrupted(
                    "stream task ended without a result".into(),
                ))
            })
        })
    }
}

/// Holds a deferred read loop back. The loop starts when this is fired or
/// dropped, or when the stream is cancelled first.
#[derive(Debug)]
pub struct StartSignal {
    tx: oneshot::Sender<()>,
}

impl StartSignal {
    pub fn start(self) {
        // A closed receiver means the loop already ended through cancellation.
        let _ = self.tx.send(());
    }
}

pub struct StreamPipeline {
    api: AnthropicApi,
    resolver: Arc<dyn CredentialResolver>,
    registry: Arc<StreamRegistry>,
    broadcaster: IncrementBroadcaster,
    config: PipelineConfig,
}

impl StreamPipeline {
    pub fn new(
        api: AnthropicApi,
        resolver: Arc<dyn CredentialResolver>,
        registry: Arc<StreamRegistry>,
        broadcaster: IncrementBroadcaster,
        config: PipelineConfig,
    ) -> Self {
        Self {
            api,
            resolver,
            registry,
            broadcaster,
            config,
        }
    }

    /// Pipeline with its own registry and broadcaster.
    pub fn from_settings(
        settings: &ApiSettings,
        resolver: Arc<dyn CredentialResolver>,
    ) -> Result<Self, GatewayError> {
        Ok(Self::new(
            AnthropicApi::new(settings)?,
            resolver,
            Arc::new(StreamRegistry::new()),
            IncrementBroadcaster::default(),
            PipelineConfig::from_settings(settings),
        ))
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &IncrementBroadcaster {
        &self.broadcaster
    }

    /// Send the prompt plus history and start streaming the answer.
    ///
    /// Errors here mean nothing was registered and no increment will ever be
    /// published for this call.
    pub async fn issue(
        &self,
        prompt: &str,
        conversation: &Conversation,
    ) -> Result<StreamHandle, GatewayError> {
        let (handle, start) = self.issue_deferred(prompt, conversation).await?;
        start.start();
        Ok(handle)
    }

    /// Like [`issue`](Self::issue), but no increment is published until the
    /// returned [`StartSignal`] fires. Lets the caller hand out the request id
    /// before any update for it can reach the same consumer.
    #[instrument(skip_all, fields(history = conversation.len()))]
    pub async fn issue_deferred(
        &self,
        prompt: &str,
        conversation: &Conversation,
    ) -> Result<(StreamHandle, StartSignal), GatewayError> {
        let credentials = self.resolver.resolve().await?;

        let mut messages = conversation.to_wire();
        messages.push(WireMessage::user(prompt));
        let body = MessagesRequest::streaming(&credentials.model, self.config.max_tokens, messages);

        let response = self
            .api
            .post_messages(&credentials.api_key, &body)
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = api::error_message(&text).unwrap_or_else(|| api::status_line(status));
            warn!(status = status.as_u16(), model = %credentials.model, "streaming request rejected");
            return Err(GatewayError::rejected(status.as_u16(), message));
        }

        let request_id = RequestId::new();
        let entry = SessionEntry::new(credentials.model.as_str());
        let cancel = entry.cancel.clone();
        if !self.registry.register(request_id.clone(), entry) {
            return Err(GatewayError::StreamInterrupted(format!(
                "request id {request_id} already registered"
            )));
        }
        info!(%request_id, model = %credentials.model, "stream started");

        let session = ReadLoop {
            request_id: request_id.clone(),
            cancel,
            registry: Arc::clone(&self.registry),
            broadcaster: self.broadcaster.clone(),
            idle_timeout: self.config.idle_timeout,
        };
        let (tx, rx) = oneshot::channel();
        let (start_tx, start_rx) = oneshot::channel();
        let span = info_span!("stream", %request_id);
        let byte_stream = response.bytes_stream();
        tokio::spawn(
            async move {
                tokio::select! {
                    biased;
                    () = session.cancel.cancelled() => {}
                    _ = start_rx => {}
                }
                let result = drive(session, byte_stream).await;
                if tx.send(result).is_err() {
                    debug!("completion receiver dropped");
                }
            }
            .instrument(span),
        );

        Ok((
            StreamHandle {
                request_id,
                completion: Completion { rx },
            },
            StartSignal { tx: start_tx },
        ))
    }

    /// Stop a live stream. `false` for unknown or already finished ids.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        let cancelled = self.registry.cancel(request_id);
        debug!(%request_id, cancelled, "cancel requested");
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }
}

/// Everything the read loop needs for one session.
struct ReadLoop {
    request_id: RequestId,
    cancel: CancellationToken,
    registry: Arc<StreamRegistry>,
    broadcaster: IncrementBroadcaster,
    idle_timeout: Duration,
}

impl ReadLoop {
    fn publish_text(&self, text: String) {
        self.broadcaster
            .publish(StreamIncrement::delta(self.request_id.clone(), text));
    }

    /// Remove the session and publish its terminal increment. A `cancel` that
    /// already took the entry wins over whatever end the loop reached.
    fn finish(&self, end: StreamEnd) -> StreamEnd {
        let removed = self.registry.remove(&self.request_id);
        let end = if !removed && self.cancel.is_cancelled() {
            StreamEnd::Cancelled
        } else {
            end
        };
        self.broadcaster
            .publish(StreamIncrement::terminal(self.request_id.clone(), end));
        end
    }

    fn completed(&self, text: String) -> Result<String, GatewayError> {
        match self.finish(StreamEnd::Completed) {
            StreamEnd::Cancelled => Ok(self.log_cancelled()),
            _ => {
                info!(chars = text.len(), "stream completed");
                Ok(text)
            }
        }
    }

    fn cancelled(&self) -> Result<String, GatewayError> {
        self.finish(StreamEnd::Cancelled);
        Ok(self.log_cancelled())
    }

    fn failed(&self, reason: String) -> Result<String, GatewayError> {
        match self.finish(StreamEnd::Failed) {
            StreamEnd::Cancelled => Ok(self.log_cancelled()),
            _ => {
                warn!(%reason, "stream failed");
                Err(GatewayError::StreamInterrupted(reason))
            }
        }
    }

    fn log_cancelled(&self) -> String {
        info!("stream cancelled");
        String::new()
    }

    /// Apply decoded events in order. `true` once `message_stop` is seen.
    fn apply(&self, events: Vec<SseEvent>, text: &mut String) -> Option<bool> {
        for event in events {
            if self.cancel.is_cancelled() {
                return None;
            }
            match classify(&event) {
                Ok(StreamSignal::TextDelta(delta)) => {
                    text.push_str(&delta);
                    self.publish_text(delta);
                }
                Ok(StreamSignal::Stop) => return Some(true),
                Ok(StreamSignal::Ignored) => {}
                Err(e) => {
                    warn!(kind = e.error_kind(), error = %e, "skipping SSE event");
                }
            }
        }
        Some(false)
    }
}

/// The read loop. Generic over the body so it can run against any byte
/// stream, not just a live response.
async fn drive<S, E>(session: ReadLoop, body: S) -> Result<String, GatewayError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::new();
    let mut text = String::new();

    loop {
        let next = tokio::select! {
            biased;
            () = session.cancel.cancelled() => return session.cancelled(),
            next = tokio::time::timeout(session.idle_timeout, body.next()) => next,
        };

        let (events, at_eof) = match next {
            Err(_) => {
                return session.failed(format!(
                    "idle timeout after {}s",
                    session.idle_timeout.as_secs()
                ))
            }
            Ok(Some(Err(e))) => return session.failed(e.to_string()),
            Ok(Some(Ok(chunk))) => (decoder.feed(&chunk), false),
            Ok(None) => (decoder.finish(), true),
        };

        match session.apply(events, &mut text) {
            None => return session.cancelled(),
            Some(true) => return session.completed(text),
            Some(false) if at_eof => {
                warn!("body ended without message_stop");
                return session.completed(text);
            }
            Some(false) => {}
        }
    }
}
