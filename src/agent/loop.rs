//! Provider session - the streaming turn loop.
//!
//! A turn runs as an explicit bounded loop:
//!
//! ```text
//! send -> stream -> native tool calls? -> execute -> send again
//!                -> text directive?     -> execute -> send again
//!                -> plain text          -> done
//! ```
//!
//! Each pass re-trims history, sends the active tool schemas, and decodes
//! the streamed reply. Tool executions are counted per turn and the turn
//! stops at the configured maximum.

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::{tool_followup, ContextBuilder};
use super::sink::OutputSink;
use crate::config::ProviderConfig;
use crate::error::{MirrorError, Result};
use crate::providers::{ChatRequest, ChatTransport, ProviderKind, StreamDecoder};
use crate::session::{Conversation, ImageAttachment, Message, ToolCall};
use crate::tools::{FormattedResult, ToolExecutor, ToolGroupRegistry};

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed { text: String },
    Cancelled,
    TimedOut,
    MaxIterations { limit: usize },
    Failed { error: String },
}

/// Resolved settings for a provider session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub kind: ProviderKind,
    pub model: String,
    pub context_length: usize,
    pub max_tool_iterations: usize,
    pub history_limit: usize,
    pub image_history_limit: usize,
    pub request_timeout: Duration,
    pub slow_response_warning: Duration,
    pub system_prompt: Option<String>,
}

impl SessionSettings {
    /// Settings for `kind` with the default limits.
    pub fn for_kind(kind: ProviderKind) -> Self {
        let defaults = ProviderConfig::default();
        Self {
            kind,
            model: kind.default_model().to_string(),
            context_length: defaults.context_length as usize,
            max_tool_iterations: defaults.max_tool_iterations as usize,
            history_limit: defaults.history_limit,
            image_history_limit: defaults.image_history_limit,
            request_timeout: Duration::from_secs(defaults.request_timeout_secs),
            slow_response_warning: Duration::from_secs(defaults.slow_response_warning_secs),
            system_prompt: None,
        }
    }

    /// # Errors
    ///
    /// Fails when the provider tag is unknown.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let kind = ProviderKind::from_tag(&config.kind)?;
        Ok(Self {
            kind,
            model: config
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| kind.default_model().to_string()),
            context_length: config.context_length as usize,
            max_tool_iterations: config.max_tool_iterations as usize,
            history_limit: config.history_limit,
            image_history_limit: config.image_history_limit,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            slow_response_warning: Duration::from_secs(config.slow_response_warning_secs),
            system_prompt: config.system_prompt.clone(),
        })
    }
}

const ITERATION_LIMIT_SKIP: &str = "Skipped: tool iteration limit reached.";
const INTERRUPTED_SKIP: &str = "Skipped: interrupted.";

enum StreamResult {
    Complete(StreamDecoder),
    Cancelled,
    TimedOut,
}

struct TurnState {
    conversation: Conversation,
    iterations: usize,
}

/// A conversation with one chat backend.
///
/// All methods take `&self`; share the session as `Arc<ProviderSession>`.
/// Turns are serialised by an internal async mutex, while
/// [`ProviderSession::interrupt`] can be called at any time.
pub struct ProviderSession {
    settings: SessionSettings,
    context: ContextBuilder,
    transport: Arc<dyn ChatTransport>,
    executor: Arc<dyn ToolExecutor>,
    registry: Arc<ToolGroupRegistry>,
    sink: Arc<dyn OutputSink>,
    state: Mutex<TurnState>,
    cancel: std::sync::Mutex<CancellationToken>,
    running: AtomicBool,
}

impl ProviderSession {
    pub fn new(
        settings: SessionSettings,
        transport: Arc<dyn ChatTransport>,
        executor: Arc<dyn ToolExecutor>,
        registry: Arc<ToolGroupRegistry>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let context = ContextBuilder::new(settings.system_prompt.as_deref());
        Self {
            settings,
            context,
            transport,
            executor,
            registry,
            sink,
            state: Mutex::new(TurnState {
                conversation: Conversation::default(),
                iterations: 0,
            }),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Seed the system prompt and accept input.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        state.conversation.reset(Some(self.context.system_prompt()));
        state.iterations = 0;
        self.running.store(true, Ordering::SeqCst);
        info!(
            provider = %self.settings.kind,
            model = %self.settings.model,
            "Provider session started"
        );
    }

    /// Cancel any in-flight request, drop all history and stop accepting input.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.interrupt();
        let mut state = self.state.lock().await;
        state.conversation.reset(None);
        state.iterations = 0;
        info!(provider = %self.settings.kind, "Provider session stopped");
    }

    /// Cancel the in-flight request, if any. History is kept.
    pub fn interrupt(&self) {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        token.cancel();
    }

    /// Reset history to the system prompt.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.conversation.reset(Some(self.context.system_prompt()));
        state.iterations = 0;
    }

    /// API sessions have no terminal; the size is ignored.
    pub fn resize(&self, cols: u16, rows: u16) {
        debug!(cols, rows, "Ignoring resize for API session");
    }

    /// Copy of the current history.
    pub async fn history(&self) -> Vec<Message> {
        self.state.lock().await.conversation.messages().to_vec()
    }

    /// Run one user turn, including any tool follow-ups.
    ///
    /// Backend failures are reported to the sink and returned as
    /// [`TurnOutcome::Failed`]; the error return is reserved for calling a
    /// session that is not running.
    pub async fn send_input(&self, text: &str, image: Option<ImageAttachment>) -> Result<TurnOutcome> {
        if !self.is_running() {
            return Err(MirrorError::Provider("Session is not running".to_string()));
        }

        let mut state = self.state.lock().await;
        let token = self.fresh_token();

        self.registry.auto_load_by_intent(text).await;
        state
            .conversation
            .trim(self.settings.history_limit, self.settings.image_history_limit);
        let message = match image {
            Some(image) => Message::user_with_image(text, image),
            None => Message::user(text),
        };
        state.conversation.push(message);
        state.iterations = 0;

        let outcome = self.run_turn(&mut state, &token).await;

        let usage = state
            .conversation
            .estimate_context(self.settings.context_length);
        self.sink.on_context_usage(usage);
        self.sink.on_turn_end(&outcome);
        debug!(?outcome, used = usage.used, limit = usage.limit, "Turn finished");
        Ok(outcome)
    }

    fn fresh_token(&self) -> CancellationToken {
        let mut guard = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = CancellationToken::new();
        guard.clone()
    }

    async fn run_turn(&self, state: &mut TurnState, token: &CancellationToken) -> TurnOutcome {
        let native = self.settings.kind.supports_native_tools();
        let max = self.settings.max_tool_iterations;

        loop {
            if token.is_cancelled() {
                return TurnOutcome::Cancelled;
            }

            state
                .conversation
                .trim(self.settings.history_limit, self.settings.image_history_limit);
            let tools = self.registry.active_tools().await;
            let messages = self
                .context
                .build_messages(state.conversation.messages(), &tools, native);
            let body = ChatRequest {
                kind: self.settings.kind,
                model: &self.settings.model,
                messages: &messages,
                tools: &tools,
                context_length: self.settings.context_length,
            }
            .to_body();

            let decoder = match self.stream_response(&body, token).await {
                Ok(StreamResult::Complete(decoder)) => decoder,
                Ok(StreamResult::Cancelled) => {
                    info!("Request cancelled");
                    return TurnOutcome::Cancelled;
                }
                Ok(StreamResult::TimedOut) => {
                    let secs = self.settings.request_timeout.as_secs();
                    warn!(timeout_secs = secs, "Request timed out");
                    self.sink
                        .on_error(&format!("Request timed out after {}s", secs));
                    return TurnOutcome::TimedOut;
                }
                Err(e) => {
                    warn!(error = %e, "Request failed");
                    self.sink.on_error(&e.to_string());
                    return TurnOutcome::Failed {
                        error: e.to_string(),
                    };
                }
            };

            if let Some(error) = decoder.error() {
                warn!(error, "Backend reported an error");
                self.sink.on_error(error);
                return TurnOutcome::Failed {
                    error: error.to_string(),
                };
            }

            let text = decoder.text().to_string();

            if native && decoder.wants_tools() {
                let calls = decoder.tool_calls();
                state
                    .conversation
                    .push(Message::assistant_with_tools(&text, calls.clone()));

                if state.iterations >= max {
                    self.skip_calls(state, &calls, ITERATION_LIMIT_SKIP);
                    return self.max_iterations();
                }

                // Images follow the whole batch; tool results must stay contiguous
                let mut images = Vec::new();
                for (i, call) in calls.iter().enumerate() {
                    if token.is_cancelled() {
                        self.skip_calls(state, &calls[i..], INTERRUPTED_SKIP);
                        break;
                    }
                    let formatted = self.run_tool(&call.name, call.parsed_arguments()).await;
                    state
                        .conversation
                        .push(Message::tool_result(&call.id, &formatted.text));
                    if let Some(image) = self.vision_image(formatted.image) {
                        images.push((call.name.clone(), image));
                    }
                    state.iterations += 1;
                }
                for (name, image) in images {
                    state.conversation.push(Message::user_with_image(
                        &format!("Image returned by {}", name),
                        image,
                    ));
                }
                continue;
            }

            if !native {
                if let Some(call) = self.executor.parse_embedded_call(&text) {
                    if call.is_valid() {
                        state.conversation.push(Message::assistant(&text));
                        if state.iterations >= max {
                            return self.max_iterations();
                        }

                        let formatted = self.run_tool(&call.name, call.args).await;
                        state.iterations += 1;
                        let followup = tool_followup(&call.name, &formatted.text);
                        let message = match self.vision_image(formatted.image) {
                            Some(image) => Message::user_with_image(&followup, image),
                            None => Message::user(&followup),
                        };
                        state.conversation.push(message);
                        continue;
                    }
                    if let Some(error) = &call.error {
                        debug!(error = %error, "Ignoring malformed tool directive");
                    }
                }
            }

            state.conversation.push(Message::assistant(&text));
            return TurnOutcome::Completed { text };
        }
    }

    async fn stream_response(&self, body: &Value, token: &CancellationToken) -> Result<StreamResult> {
        let deadline = tokio::time::sleep(self.settings.request_timeout);
        let slow = tokio::time::sleep(self.settings.slow_response_warning);
        tokio::pin!(deadline);
        tokio::pin!(slow);
        let mut warned = false;

        let open = self.transport.open_stream(body);
        tokio::pin!(open);
        let mut stream = loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(StreamResult::Cancelled),
                _ = &mut deadline => return Ok(StreamResult::TimedOut),
                _ = &mut slow, if !warned => {
                    warned = true;
                    self.warn_slow();
                }
                opened = &mut open => break opened?,
            }
        };

        let mut decoder = StreamDecoder::new();
        let mut received = false;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(StreamResult::Cancelled),
                _ = &mut deadline => return Ok(StreamResult::TimedOut),
                _ = &mut slow, if !warned && !received => {
                    warned = true;
                    self.warn_slow();
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        received |= !bytes.is_empty();
                        for delta in decoder.feed(&bytes) {
                            self.sink.on_token(&delta);
                        }
                        if decoder.is_done() {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }
        }

        for delta in decoder.finish() {
            self.sink.on_token(&delta);
        }
        Ok(StreamResult::Complete(decoder))
    }

    fn warn_slow(&self) {
        let secs = self.settings.slow_response_warning.as_secs();
        warn!(after_secs = secs, model = %self.settings.model, "No response from model yet");
        self.sink.on_notice(&format!(
            "Still waiting for {} after {}s...",
            self.settings.model, secs
        ));
    }

    async fn run_tool(&self, name: &str, args: Value) -> FormattedResult {
        info!(tool = name, "Executing tool");
        self.sink.on_tool_start(name, &args);

        let outcome = self.executor.execute(name, args).await;
        self.registry.record_tool_call(name).await;
        self.registry.auto_unload_idle().await;

        let formatted = if outcome.success {
            self.executor.format_result(name, &outcome.result)
        } else {
            let error = outcome.error.as_deref().unwrap_or("Tool failed");
            warn!(tool = name, error, "Tool execution failed");
            FormattedResult::text(format!("Error: {}", error))
        };
        self.sink
            .on_tool_end(name, outcome.success, &formatted.text);
        formatted
    }

    fn vision_image(&self, image: Option<ImageAttachment>) -> Option<ImageAttachment> {
        image.filter(|_| self.settings.kind.supports_vision(&self.settings.model))
    }

    /// Answer unexecuted calls so the history stays valid for the next request.
    fn skip_calls(&self, state: &mut TurnState, calls: &[ToolCall], reason: &str) {
        for call in calls {
            state.conversation.push(Message::tool_result(&call.id, reason));
        }
    }

    fn max_iterations(&self) -> TurnOutcome {
        let limit = self.settings.max_tool_iterations;
        let notice = format!("Max tool iterations reached ({}). Stopping here.", limit);
        warn!(limit, "Tool iteration limit reached");
        self.sink.on_notice(&notice);
        TurnOutcome::MaxIterations { limit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::sink::{ChannelSink, SessionEvent};
    use crate::config::ToolsConfig;
    use crate::providers::ByteStream;
    use crate::tools::ToolOutcome;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc::UnboundedReceiver;

    type Script = Box<dyn Fn(usize) -> Vec<String> + Send + Sync>;

    /// Replies with scripted SSE chunks and records every request body.
    struct ScriptedTransport {
        script: Script,
        requests: std::sync::Mutex<Vec<Value>>,
    }

    impl ScriptedTransport {
        fn new(script: impl Fn(usize) -> Vec<String> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                requests: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<Value> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open_stream(&self, body: &Value) -> Result<ByteStream> {
            let n = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(body.clone());
                requests.len() - 1
            };
            let chunks: Vec<Result<Vec<u8>>> = (self.script)(n)
                .into_iter()
                .map(|c| Ok(c.into_bytes()))
                .collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    /// Never answers.
    struct SilentTransport;

    #[async_trait]
    impl ChatTransport for SilentTransport {
        async fn open_stream(&self, _body: &Value) -> Result<ByteStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl ChatTransport for FailingTransport {
        async fn open_stream(&self, _body: &Value) -> Result<ByteStream> {
            Err(MirrorError::Provider("http://x returned 500: boom".into()))
        }
    }

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolExecutor for CountingExecutor {
        async fn execute(&self, name: &str, _args: Value) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match name {
                "broken" => ToolOutcome::error("tool exploded"),
                "capture_screen" => ToolOutcome::ok(json!({
                    "text": "Screenshot captured.",
                    "image": "data:image/png;base64,AAAA"
                })),
                "slow_tool" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    ToolOutcome::text("finally done")
                }
                _ => ToolOutcome::text("3 unread messages"),
            }
        }
    }

    fn text_chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn tool_call_chunk(id: &str, name: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{
                "delta": {"tool_calls": [{"index": 0, "id": id, "function": {"name": name, "arguments": "{}"}}]},
                "finish_reason": "tool_calls"
            }]})
        )
    }

    fn batch_chunk(calls: &[(&str, &str)]) -> String {
        let tool_calls: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(index, (id, name))| {
                json!({"index": index, "id": id, "function": {"name": name, "arguments": "{}"}})
            })
            .collect();
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"tool_calls": tool_calls}, "finish_reason": "tool_calls"}]})
        )
    }

    fn settings(kind: ProviderKind) -> SessionSettings {
        SessionSettings {
            system_prompt: Some("test prompt".into()),
            ..SessionSettings::for_kind(kind)
        }
    }

    async fn session(
        settings: SessionSettings,
        transport: Arc<dyn ChatTransport>,
        executor: Arc<CountingExecutor>,
    ) -> (Arc<ProviderSession>, UnboundedReceiver<SessionEvent>) {
        let (sink, rx) = ChannelSink::new();
        let registry = Arc::new(ToolGroupRegistry::from_config(&ToolsConfig::default()));
        let session = Arc::new(ProviderSession::new(
            settings,
            transport,
            executor,
            registry,
            Arc::new(sink),
        ));
        session.start().await;
        (session, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_malformed_chunk_then_text() {
        let transport = ScriptedTransport::new(|_| {
            vec!["data: {broken\n\n".to_string(), text_chunk("hi"), "data: [DONE]\n\n".into()]
        });
        let (session, mut rx) = session(
            settings(ProviderKind::OpenAi),
            transport,
            Arc::new(CountingExecutor::default()),
        )
        .await;

        let outcome = session.send_input("hello", None).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed { text: "hi".into() });

        let events = drain(&mut rx);
        assert_eq!(events[0], SessionEvent::Token("hi".into()));
        assert!(events.iter().any(|e| matches!(e, SessionEvent::ContextUsage(_))));
        assert!(matches!(events.last(), Some(SessionEvent::TurnEnd(_))));
    }

    #[tokio::test]
    async fn test_native_tool_round() {
        let transport = ScriptedTransport::new(|n| match n {
            0 => vec![tool_call_chunk("call_1", "voice_inbox")],
            _ => vec![text_chunk("You have three messages.")],
        });
        let executor = Arc::new(CountingExecutor::default());
        let (session, mut rx) =
            session(settings(ProviderKind::OpenAi), transport.clone(), executor.clone()).await;

        let outcome = session.send_input("any messages?", None).await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                text: "You have three messages.".into()
            }
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let history = session.history().await;
        let roles: Vec<&str> = history.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "assistant"]);
        assert_eq!(history[2].tool_calls[0].name, "voice_inbox");
        assert_eq!(history[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(history[3].content, "3 unread messages");

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["tool_choice"], "auto");
        assert_eq!(requests[1]["messages"][3]["role"], "tool");

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::ToolEnd { name, success: true, .. } if name == "voice_inbox"
        )));
    }

    #[tokio::test]
    async fn test_batch_images_follow_all_tool_results() {
        let transport = ScriptedTransport::new(|n| match n {
            0 => vec![batch_chunk(&[("call_a", "capture_screen"), ("call_b", "voice_inbox")])],
            _ => vec![text_chunk("I see your desktop.")],
        });
        let settings = SessionSettings {
            model: "gpt-4o".into(),
            ..settings(ProviderKind::OpenAi)
        };
        let (session, _rx) =
            session(settings, transport.clone(), Arc::new(CountingExecutor::default())).await;

        session.send_input("what's on screen?", None).await.unwrap();

        let requests = transport.requests();
        let roles: Vec<&str> = requests[1]["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "tool", "user"]);

        let history = session.history().await;
        assert_eq!(history[3].content, "Screenshot captured.");
        assert_eq!(history[4].tool_call_id.as_deref(), Some("call_b"));
        assert_eq!(history[5].content, "Image returned by capture_screen");
        assert_eq!(history[5].image.as_ref().unwrap().data, "AAAA");
    }

    #[tokio::test]
    async fn test_interrupt_skips_rest_of_batch() {
        let transport = ScriptedTransport::new(|n| match n {
            0 => vec![batch_chunk(&[("call_a", "slow_tool"), ("call_b", "voice_inbox")])],
            _ => vec![text_chunk("unreachable")],
        });
        let executor = Arc::new(CountingExecutor::default());
        let (session, _rx) =
            session(settings(ProviderKind::OpenAi), transport.clone(), executor.clone()).await;

        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.send_input("run both", None).await })
        };
        tokio::time::sleep(Duration::from_millis(80)).await;
        session.interrupt();

        let outcome = runner.await.unwrap().unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.requests().len(), 1);

        let history = session.history().await;
        let roles: Vec<&str> = history.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "tool"]);
        assert_eq!(history[3].content, "finally done");
        assert_eq!(history[4].content, "Skipped: interrupted.");
    }

    #[tokio::test]
    async fn test_max_tool_iterations() {
        let transport = ScriptedTransport::new(|n| vec![tool_call_chunk(&format!("call_{}", n), "voice_status")]);
        let executor = Arc::new(CountingExecutor::default());
        let (session, mut rx) =
            session(settings(ProviderKind::Groq), transport.clone(), executor.clone()).await;

        let outcome = session.send_input("loop forever", None).await.unwrap();
        assert_eq!(outcome, TurnOutcome::MaxIterations { limit: 10 });
        assert_eq!(executor.calls.load(Ordering::SeqCst), 10);
        assert_eq!(transport.requests().len(), 11);

        let events = drain(&mut rx);
        assert!(events.contains(&SessionEvent::Notice(
            "Max tool iterations reached (10). Stopping here.".into()
        )));

        // Every call in history has an answer
        let history = session.history().await;
        let last = history.last().unwrap();
        assert_eq!(last.role.as_str(), "tool");
        assert!(last.content.starts_with("Skipped"));
    }

    #[tokio::test]
    async fn test_text_directive_round() {
        let transport = ScriptedTransport::new(|n| match n {
            0 => vec![text_chunk(r#"{"tool": "voice_inbox", "#), text_chunk(r#""args": {}}"#)],
            _ => vec![text_chunk("Three new messages.")],
        });
        let executor = Arc::new(CountingExecutor::default());
        let (session, _rx) =
            session(settings(ProviderKind::Ollama), transport.clone(), executor.clone()).await;

        let outcome = session.send_input("check my inbox", None).await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                text: "Three new messages.".into()
            }
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let requests = transport.requests();
        assert!(requests[0].get("tools").is_none());
        assert_eq!(requests[0]["options"]["num_ctx"], 32768);
        let system = requests[0]["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("- voice_inbox("));

        let followup = requests[1]["messages"][3]["content"].as_str().unwrap();
        assert!(followup.starts_with("Tool result from voice_inbox:\n3 unread messages"));
        assert!(followup.contains("under 100 words"));
    }

    #[tokio::test]
    async fn test_malformed_directive_is_plain_text() {
        let transport = ScriptedTransport::new(|_| vec![text_chunk(r#"{"tool": "voice_inbox", "args": {"#)]);
        let executor = Arc::new(CountingExecutor::default());
        let (session, _rx) =
            session(settings(ProviderKind::Jan), transport.clone(), executor.clone()).await;

        let outcome = session.send_input("hm", None).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_tool_becomes_result() {
        let transport = ScriptedTransport::new(|n| match n {
            0 => vec![tool_call_chunk("c", "broken")],
            _ => vec![text_chunk("Sorry, that failed.")],
        });
        let (session, _rx) = session(
            settings(ProviderKind::OpenAi),
            transport,
            Arc::new(CountingExecutor::default()),
        )
        .await;

        session.send_input("do it", None).await.unwrap();
        let history = session.history().await;
        assert_eq!(history[3].content, "Error: tool exploded");
    }

    #[tokio::test]
    async fn test_transport_error_records_nothing() {
        let (session, mut rx) = session(
            settings(ProviderKind::OpenAi),
            Arc::new(FailingTransport),
            Arc::new(CountingExecutor::default()),
        )
        .await;

        let outcome = session.send_input("hello", None).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        let history = session.history().await;
        assert_eq!(history.last().unwrap().role.as_str(), "user");
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::Error(m) if m.contains("500"))));
    }

    #[tokio::test]
    async fn test_timeout_and_slow_warning() {
        let settings = SessionSettings {
            request_timeout: Duration::from_millis(200),
            slow_response_warning: Duration::from_millis(20),
            ..settings(ProviderKind::OpenAi)
        };
        let (session, mut rx) = session(
            settings,
            Arc::new(SilentTransport),
            Arc::new(CountingExecutor::default()),
        )
        .await;

        let outcome = session.send_input("hello", None).await.unwrap();
        assert_eq!(outcome, TurnOutcome::TimedOut);

        let events = drain(&mut rx);
        let notices = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Notice(_)))
            .count();
        assert_eq!(notices, 1);
    }

    #[tokio::test]
    async fn test_interrupt_cancels() {
        let (session, _rx) = session(
            settings(ProviderKind::OpenAi),
            Arc::new(SilentTransport),
            Arc::new(CountingExecutor::default()),
        )
        .await;

        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.send_input("hello", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.interrupt();

        let outcome = runner.await.unwrap().unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert!(session.is_running());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let transport = ScriptedTransport::new(|_| vec![text_chunk("ok")]);
        let (session, _rx) = session(
            settings(ProviderKind::OpenAi),
            transport,
            Arc::new(CountingExecutor::default()),
        )
        .await;

        session.send_input("one", None).await.unwrap();
        assert_eq!(session.history().await.len(), 3);

        session.resize(80, 24);
        session.clear().await;
        let history = session.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "test prompt");

        session.stop().await;
        assert!(!session.is_running());
        assert!(session.history().await.is_empty());
        assert!(session.send_input("two", None).await.is_err());
    }

    #[tokio::test]
    async fn test_history_trimmed_between_turns() {
        let transport = ScriptedTransport::new(|_| vec![text_chunk("ok")]);
        let (session, _rx) = session(
            settings(ProviderKind::OpenAi),
            transport.clone(),
            Arc::new(CountingExecutor::default()),
        )
        .await;

        for i in 0..15 {
            session.send_input(&format!("turn {}", i), None).await.unwrap();
        }
        let last_request = transport.requests().pop().unwrap();
        let sent = last_request["messages"].as_array().unwrap();
        assert_eq!(sent[0]["role"], "system");
        assert_eq!(sent.len(), 21);
    }
}
