//! Host protocol dispatcher: one [`HostRequest`] in, one [`HostResponse`] out.
//!
//! Every response is written to the channel by the service itself, so for a
//! `callClaudeAPI` the reply carrying the request id always precedes the
//! stream's updates. Those updates go from the broadcaster to the channel via
//! [`relay::spawn_forwarder`](crate::relay::spawn_forwarder).

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use pal_core::classify::{classify, ErrorCategory};
use pal_core::errors::GatewayError;
use pal_core::messages::Conversation;
use pal_core::protocol::{
    HostEnvelope, HostEvent, HostRequest, HostResponse, NotificationKind, Outbound,
};
use pal_settings::{loader, ApiKey, SettingsStore};

use crate::pipeline::{StartSignal, StreamPipeline};
use crate::relay::{deliver_with_retry, MessageChannel};
use crate::verify::Verifier;

pub const API_KEY_NOTICE: &str = "API key issue detected. Please check your settings.";

pub struct HostService {
    pipeline: Arc<StreamPipeline>,
    verifier: Verifier,
    store: SettingsStore,
    channel: Arc<dyn MessageChannel>,
}

impl HostService {
    pub fn new(
        pipeline: Arc<StreamPipeline>,
        verifier: Verifier,
        store: SettingsStore,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            pipeline,
            verifier,
            store,
            channel,
        }
    }

    pub fn pipeline(&self) -> &Arc<StreamPipeline> {
        &self.pipeline
    }

    /// Read requests until `input` closes. Each line is handled on its own
    /// task, so a slow verify or issue never holds up a `stopStreaming`.
    /// On close every live stream is cancelled and unanswered requests are
    /// dropped.
    pub async fn serve<R>(self: Arc<Self>, input: R) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut tasks = JoinSet::new();
        let outcome = loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let service = Arc::clone(&self);
                    tasks.spawn(async move {
                        service.handle_line(&line).await;
                    });
                    while let Some(finished) = tasks.try_join_next() {
                        if let Err(e) = finished {
                            warn!(error = %e, "host request task failed");
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let cancelled = self.pipeline.cancel_all();
        info!(cancelled, unanswered = tasks.len(), "host input closed");
        tasks.shutdown().await;
        outcome
    }

    /// Parse and answer one line of the host channel.
    pub async fn handle_line(&self, line: &str) -> HostResponse {
        match serde_json::from_str::<HostEnvelope>(line) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => {
                warn!(error = %e, "unparseable host request");
                let response =
                    HostResponse::error(format!("invalid request: {e}"), ErrorCategory::Unknown);
                self.reply(&response).await;
                response
            }
        }
    }

    /// Answer one request on the channel and return the answer.
    pub async fn handle(&self, envelope: HostEnvelope) -> HostResponse {
        let HostEnvelope { id, request } = envelope;
        let (response, start) = self.dispatch(request).await;
        let response = response.with_id(id);
        self.reply(&response).await;
        if let Some(start) = start {
            start.start();
        }
        response
    }

    async fn reply(&self, response: &HostResponse) {
        let message = Outbound::Response(response.clone());
        if let Err(e) = deliver_with_retry(self.channel.as_ref(), &message).await {
            warn!(error = %e, "host response not delivered");
        }
    }

    #[instrument(skip_all, fields(action = request.action()))]
    async fn dispatch(&self, request: HostRequest) -> (HostResponse, Option<StartSignal>) {
        match request {
            HostRequest::CallClaudeApi {
                prompt,
                conversation,
            } => self.call(&prompt, &conversation).await,
            HostRequest::StopStreaming { request_id } => {
                (HostResponse::flag(self.pipeline.cancel(&request_id)), None)
            }
            HostRequest::VerifyApiKey { api_key } => {
                let key = ApiKey::new(api_key.unwrap_or_default());
                let response = match self.verifier.verify(&key).await {
                    Ok(models) => HostResponse::data(json!(models)),
                    Err(e) => error_response(&e),
                };
                (response, None)
            }
            HostRequest::SaveSettings { api_key, model } => {
                (self.save_settings(api_key, model), None)
            }
            HostRequest::GetSettings => (self.get_settings(), None),
        }
    }

    async fn call(
        &self,
        prompt: &str,
        conversation: &Conversation,
    ) -> (HostResponse, Option<StartSignal>) {
        match self.pipeline.issue_deferred(prompt, conversation).await {
            Ok((handle, start)) => {
                let request_id = handle.request_id.clone();
                let channel = Arc::clone(&self.channel);
                tokio::spawn(async move {
                    match handle.completion.await {
                        Ok(text) => debug!(chars = text.len(), "completion delivered"),
                        Err(e) => {
                            let message = classify(&e).user_message();
                            notify(channel.as_ref(), message, NotificationKind::Error).await;
                        }
                    }
                });
                (HostResponse::streaming(request_id), Some(start))
            }
            Err(e) => {
                if e.is_fatal() {
                    notify(self.channel.as_ref(), API_KEY_NOTICE.to_string(), NotificationKind::Error)
                        .await;
                }
                (error_response(&e), None)
            }
        }
    }

    fn save_settings(&self, api_key: Option<String>, model: Option<String>) -> HostResponse {
        if let Some(key) = api_key {
            if let Err(e) = self.store.save_api_key(&key) {
                return HostResponse::error(e.to_string(), ErrorCategory::Unknown);
            }
        }
        if let Some(model) = model {
            if let Err(e) = self.store.save_model(Some(&model)) {
                return HostResponse::error(e.to_string(), ErrorCategory::Unknown);
            }
        }
        HostResponse::ok()
    }

    /// Never includes the key itself.
    fn get_settings(&self) -> HostResponse {
        let settings = match self.store.load() {
            Ok(s) => s,
            Err(e) => return HostResponse::error(e.to_string(), ErrorCategory::Unknown),
        };
        let has_api_key = loader::env_api_key(|name| std::env::var(name).ok()).is_some()
            || matches!(self.store.stored_api_key(), Ok(Some(_)));
        HostResponse::data(json!({
            "hasApiKey": has_api_key,
            "model": settings.model_or_default(),
            "baseUrl": settings.api.base_url,
        }))
    }
}

fn error_response(error: &GatewayError) -> HostResponse {
    let classified = classify(error);
    debug!(kind = error.error_kind(), category = ?classified.category, "request failed");
    HostResponse::error(classified.raw, classified.category)
}

async fn notify(channel: &dyn MessageChannel, message: String, kind: NotificationKind) {
    let event = Outbound::Event(HostEvent::ShowNotification { message, kind });
    if let Err(e) = deliver_with_retry(channel, &event).await {
        warn!(error = %e, "notification not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use pal_settings::{ApiSettings, StaticResolver};
    use tokio::io::AsyncWriteExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::registry::SessionEntry;
    use crate::relay::{spawn_forwarder, DeliveryError};
    use pal_core::ids::RequestId;

    #[derive(Default)]
    struct Recorder {
        sent: std::sync::Mutex<Vec<Outbound>>,
    }

    #[async_trait]
    impl MessageChannel for Recorder {
        async fn send(&self, message: &Outbound) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    impl Recorder {
        fn notifications(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    Outbound::Event(HostEvent::ShowNotification { message, .. }) => {
                        Some(message.clone())
                    }
                    _ => None,
                })
                .collect()
        }

        fn responses(&self) -> Vec<HostResponse> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    Outbound::Response(r) => Some(r.clone()),
                    _ => None,
                })
                .collect()
        }

        fn snapshot(&self) -> Vec<Outbound> {
            self.sent.lock().unwrap().clone()
        }
    }

    /// Poll `ready` every 10ms for up to two seconds.
    async fn eventually(ready: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        service: Arc<HostService>,
        recorder: Arc<Recorder>,
    }

    fn fixture(base_url: String, resolver: StaticResolver) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = ApiSettings {
            base_url,
            ..ApiSettings::default()
        };
        let pipeline = Arc::new(StreamPipeline::from_settings(&settings, Arc::new(resolver)).unwrap());
        let verifier = Verifier::from_settings(&settings).unwrap();
        let recorder = Arc::new(Recorder::default());
        let service = Arc::new(HostService::new(
            pipeline,
            verifier,
            SettingsStore::open(dir.path()),
            recorder.clone(),
        ));
        Fixture {
            _dir: dir,
            service,
            recorder,
        }
    }

    #[tokio::test]
    async fn stop_unknown_request_is_not_success() {
        let f = fixture("http://127.0.0.1:9".into(), StaticResolver::new("sk"));
        let resp = f
            .service
            .handle_line(r#"{"id":1,"action":"stopStreaming","requestId":"req_missing"}"#)
            .await;
        assert!(!resp.success);
        assert_eq!(resp.id, Some(json!(1)));
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn call_without_key_reports_and_notifies() {
        let f = fixture("http://127.0.0.1:9".into(), StaticResolver::default());
        let resp = f
            .service
            .handle_line(r#"{"action":"callClaudeAPI","prompt":"hi"}"#)
            .await;
        assert!(!resp.success);
        assert_eq!(resp.category, Some(ErrorCategory::MissingCredential));
        assert!(resp.error.unwrap().contains("API key not found"));
        assert_eq!(f.recorder.notifications(), vec![API_KEY_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn call_streams_and_stop_after_completion_is_false() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"),
            )
            .mount(&server)
            .await;

        let f = fixture(server.uri(), StaticResolver::new("sk"));
        let mut rx = f.service.pipeline().broadcaster().subscribe();
        let resp = f
            .service
            .handle_line(r#"{"id":"a","action":"callClaudeAPI","prompt":"hi","conversation":{"messages":[]}}"#)
            .await;
        assert!(resp.success);
        assert_eq!(resp.streaming, Some(true));
        let request_id = resp.request_id.unwrap();

        let terminal = rx.recv().await.unwrap();
        assert_eq!(terminal.request_id, request_id);
        assert!(terminal.done);

        let stop = f
            .service
            .handle(HostEnvelope {
                id: None,
                request: HostRequest::StopStreaming { request_id },
            })
            .await;
        assert!(!stop.success);
    }

    #[tokio::test]
    async fn rejected_call_carries_category() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let f = fixture(server.uri(), StaticResolver::new("sk"));
        let resp = f
            .service
            .handle(HostEnvelope {
                id: None,
                request: HostRequest::CallClaudeApi {
                    prompt: "hi".into(),
                    conversation: Conversation::new(),
                },
            })
            .await;
        assert_eq!(resp.category, Some(ErrorCategory::RateLimited));
        assert!(f.recorder.notifications().is_empty());
    }

    #[tokio::test]
    async fn verify_without_key_fails_fast() {
        let f = fixture("http://127.0.0.1:9".into(), StaticResolver::new("sk"));
        let resp = f.service.handle_line(r#"{"action":"verifyApiKey"}"#).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("API key is required"));
        assert_eq!(resp.category, Some(ErrorCategory::InvalidCredential));
    }

    #[tokio::test]
    async fn save_then_get_settings() {
        let f = fixture("http://127.0.0.1:9".into(), StaticResolver::new("sk"));
        let resp = f
            .service
            .handle_line(r#"{"action":"saveSettings","apiKey":"sk-ant-1","model":"claude-3-haiku-20240307"}"#)
            .await;
        assert!(resp.success);

        let resp = f.service.handle_line(r#"{"action":"getSettings"}"#).await;
        let data = resp.data.unwrap();
        assert_eq!(data["hasApiKey"], true);
        assert_eq!(data["model"], "claude-3-haiku-20240307");
        assert!(!data.to_string().contains("sk-ant-1"));
    }

    #[tokio::test]
    async fn save_blank_key_is_error() {
        let f = fixture("http://127.0.0.1:9".into(), StaticResolver::new("sk"));
        let resp = f
            .service
            .handle_line(r#"{"action":"saveSettings","apiKey":"   "}"#)
            .await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("API key is required"));
    }

    #[tokio::test]
    async fn garbage_line_is_error_response() {
        let f = fixture("http://127.0.0.1:9".into(), StaticResolver::new("sk"));
        let resp = f.service.handle_line("not json").await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().starts_with("invalid request"));
    }

    #[tokio::test]
    async fn every_answer_is_written_to_the_channel() {
        let f = fixture("http://127.0.0.1:9".into(), StaticResolver::new("sk"));
        f.service
            .handle_line(r#"{"id":"x","action":"getSettings"}"#)
            .await;
        f.service.handle_line("not json").await;

        let responses = f.recorder.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, Some(json!("x")));
        assert!(responses[1].error.is_some());
    }

    #[tokio::test]
    async fn unauthorized_call_notifies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let f = fixture(server.uri(), StaticResolver::new("sk"));
        let resp = f
            .service
            .handle_line(r#"{"action":"callClaudeAPI","prompt":"hi"}"#)
            .await;
        assert_eq!(resp.category, Some(ErrorCategory::InvalidCredential));
        assert_eq!(f.recorder.notifications(), vec![API_KEY_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn stream_updates_follow_the_call_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
                "event: content_block_delta\n",
                "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hey\"}}\n\n",
                "event: message_stop\n",
                "data: {\"type\":\"message_stop\"}\n\n",
            )))
            .mount(&server)
            .await;

        let f = fixture(server.uri(), StaticResolver::new("sk"));
        let forwarder = spawn_forwarder(
            f.service.pipeline().broadcaster().subscribe(),
            f.recorder.clone(),
        );

        let resp = f
            .service
            .handle_line(r#"{"id":7,"action":"callClaudeAPI","prompt":"hi"}"#)
            .await;
        let request_id = resp.request_id.unwrap();

        let is_update = |m: &Outbound| {
            matches!(m, Outbound::Event(HostEvent::StreamUpdate(inc)) if inc.request_id == request_id)
        };
        eventually(|| {
            f.recorder.snapshot().iter().any(|m| {
                matches!(m, Outbound::Event(HostEvent::StreamUpdate(inc)) if inc.request_id == request_id && inc.done)
            })
        })
        .await;

        let sent = f.recorder.snapshot();
        let answered_at = sent
            .iter()
            .position(|m| matches!(m, Outbound::Response(r) if r.id == Some(json!(7))))
            .unwrap();
        let first_update = sent.iter().position(is_update).unwrap();
        assert!(answered_at < first_update, "sent: {sent:?}");
        forwarder.abort();
    }

    #[tokio::test]
    async fn stop_is_answered_while_verify_is_pending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": [{"id": "m"}]}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let f = fixture(server.uri(), StaticResolver::new("sk"));
        let (mut client, host_side) = tokio::io::duplex(1024);
        let serving = tokio::spawn(
            Arc::clone(&f.service).serve(tokio::io::BufReader::new(host_side)),
        );

        client
            .write_all(b"{\"id\":1,\"action\":\"verifyApiKey\",\"apiKey\":\"sk\"}\n")
            .await
            .unwrap();
        client
            .write_all(b"{\"id\":2,\"action\":\"stopStreaming\",\"requestId\":\"req_x\"}\n")
            .await
            .unwrap();

        eventually(|| !f.recorder.responses().is_empty()).await;
        let responses = f.recorder.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, Some(json!(2)));
        assert!(!responses[0].success);

        drop(client);
        serving.await.unwrap().unwrap();
        assert!(f.recorder.responses().iter().all(|r| r.id != Some(json!(1))));
    }

    #[tokio::test]
    async fn closing_input_cancels_live_streams() {
        let f = fixture("http://127.0.0.1:9".into(), StaticResolver::new("sk"));
        let entry = SessionEntry::new("m");
        let token = entry.cancel.clone();
        f.service
            .pipeline()
            .registry()
            .register(RequestId::new(), entry);

        let input = b"{\"action\":\"getSettings\"}\n\n".as_slice();
        Arc::clone(&f.service)
            .serve(tokio::io::BufReader::new(input))
            .await
            .unwrap();
        assert!(token.is_cancelled());
        assert!(f.service.pipeline().registry().is_empty());
    }
}
