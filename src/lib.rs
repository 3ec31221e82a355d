pub mod agent;
mod assembler;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod inference;
pub mod ledger;
pub mod live;
pub mod message;
pub mod retry;
pub mod tools;
pub mod transcript;
pub mod turn;
pub mod types;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use assembler::{PersistFailure, Step, TurnAssembler};

pub use agent::{AgentConfig, AgentSource};
pub use config::TurnConfig;
pub use context::{TurnContext, TurnPhase};
pub use error::{
    ConfigError, InferenceError, LiveError, MessageError, SinkError, SourceError, TranscriptViolation,
    TurnError,
};
pub use events::{EventStream, TurnEvent};
pub use inference::{InferenceProvider, OpenAiProvider};
pub use ledger::{AppendGuard, AppendLedger};
pub use live::{ChannelLiveSink, LiveEvent, LiveSink, NoLiveSink};
pub use message::{Message, Role, ToolCall};
pub use retry::RetryPolicy;
pub use tools::{KnowledgeBase, ToolHandler, ToolRegistry};
pub use transcript::{
    BackendTranscript, FileTranscript, MemoryTranscript, NewMessage, PersistedMessage,
    TranscriptSink,
};
pub use turn::{TruncationReason, Turn, TurnStatus};
pub use types::{ContentBlock, InferenceRequest, InferenceResponse, StopReason, Usage};

/// One user input to answer.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    /// Persisted first, before any event is consumed.
    pub user_message: Option<String>,
}

impl TurnRequest {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_message: None,
        }
    }

    pub fn with_user_message(mut self, content: impl Into<String>) -> Self {
        self.user_message = Some(content.into());
        self
    }
}

/// Turns an event stream into a persisted transcript.
///
/// Cheap to clone. Clones share the transcript sink and the append ledger, so
/// turns for the same conversation run one after another no matter which
/// clone started them.
#[derive(Clone)]
pub struct TurnOrchestrator {
    transcript: Arc<dyn TranscriptSink>,
    ledger: Arc<AppendLedger>,
    config: TurnConfig,
}

impl TurnOrchestrator {
    pub fn new(transcript: impl TranscriptSink + 'static, config: TurnConfig) -> Self {
        Self {
            transcript: Arc::new(transcript),
            ledger: Arc::new(AppendLedger::new()),
            config,
        }
    }

    /// Share a ledger with orchestrators writing to the same store.
    pub fn with_ledger(mut self, ledger: Arc<AppendLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<AppendLedger> {
        &self.ledger
    }

    /// Raw messages of a conversation, ready to seed the next request.
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<serde_json::Value>, SinkError> {
        let transcript = self.transcript.as_ref();
        let messages = self
            .config
            .retry
            .run("list_messages", || transcript.list_messages(conversation_id))
            .await
            .map_err(|e| e.error)?;
        Ok(transcript::replay_history(&messages))
    }

    /// Run a turn to completion. No live output, no cancellation.
    pub async fn run<S>(&self, request: TurnRequest, events: S) -> Result<Turn, TurnError>
    where
        S: Stream<Item = Result<TurnEvent, SourceError>> + Send,
    {
        self.run_streaming(request, events, NoLiveSink, CancellationToken::new())
            .await
    }

    /// Run with client-disconnect support.
    pub async fn run_with_cancel<S>(
        &self,
        request: TurnRequest,
        events: S,
        cancel: CancellationToken,
    ) -> Result<Turn, TurnError>
    where
        S: Stream<Item = Result<TurnEvent, SourceError>> + Send,
    {
        self.run_streaming(request, events, NoLiveSink, cancel).await
    }

    /// Run with live output. Cancelling `cancel` tears the live sink down
    /// and gives the stream `drain_timeout` to finish before the turn is
    /// truncated.
    pub async fn run_streaming<S>(
        &self,
        request: TurnRequest,
        events: S,
        live: impl LiveSink + 'static,
        cancel: CancellationToken,
    ) -> Result<Turn, TurnError>
    where
        S: Stream<Item = Result<TurnEvent, SourceError>> + Send,
    {
        let turn_id = format!("turn_{}", uuid::Uuid::new_v4().simple());
        let span = tracing::info_span!(
            "turn",
            turn_id = %turn_id,
            conversation_id = %request.conversation_id
        );
        self.drive(turn_id, request, events, Box::new(live), cancel)
            .instrument(span)
            .await
    }

    async fn drive<S>(
        &self,
        turn_id: String,
        request: TurnRequest,
        events: S,
        live: Box<dyn LiveSink>,
        cancel: CancellationToken,
    ) -> Result<Turn, TurnError>
    where
        S: Stream<Item = Result<TurnEvent, SourceError>> + Send,
    {
        let mut events = std::pin::pin!(events);
        let guard = self.ledger.acquire(&request.conversation_id).await?;
        let mut assembler = TurnAssembler::new(
            &request.conversation_id,
            self.transcript.as_ref(),
            &self.config.retry,
            &guard,
            self.config.max_tool_output_chars,
            live,
        );
        info!(high_water = guard.high_water(), "turn started");

        if let Some(content) = request.user_message.as_deref() {
            if let Err(failure) = assembler.record_user(content).await {
                return Err(persistence_failed(turn_id, &request, assembler, failure));
            }
        }

        let mut drain_deadline: Option<Instant> = None;
        let status = loop {
            let next = match drain_deadline {
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        assembler.disconnect_live();
                        if self.config.drain_timeout.is_zero() {
                            info!("client disconnected, not draining");
                            break TurnStatus::Truncated(TruncationReason::ClientDisconnected);
                        }
                        info!(
                            drain_ms = self.config.drain_timeout.as_millis() as u64,
                            "client disconnected, draining"
                        );
                        drain_deadline = Some(Instant::now() + self.config.drain_timeout);
                        continue;
                    }
                    next = events.next() => next,
                },
                Some(deadline) => match tokio::time::timeout_at(deadline, events.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!("event stream did not finish within the drain timeout");
                        break TurnStatus::Truncated(TruncationReason::DrainTimeout);
                    }
                },
            };

            match next {
                Some(Ok(event)) => match assembler.apply(event).await {
                    Ok(Step::Continue) => {}
                    Ok(Step::Complete) => break TurnStatus::Complete,
                    Err(failure) => {
                        return Err(persistence_failed(turn_id, &request, assembler, failure))
                    }
                },
                Some(Err(e)) => {
                    warn!(error = %e, "event source failed");
                    break TurnStatus::Truncated(TruncationReason::SourceFailed(e.to_string()));
                }
                None => {
                    warn!(phase = ?assembler.phase(), "event stream ended before a final answer");
                    break TurnStatus::Truncated(TruncationReason::SourceEnded);
                }
            }
        };

        if status != TurnStatus::Complete {
            if let Err(failure) = assembler.truncate().await {
                return Err(persistence_failed(turn_id, &request, assembler, failure));
            }
        }

        let messages = assembler.into_messages();
        info!(status = %status, messages = messages.len(), "turn finished");
        Ok(Turn {
            turn_id,
            conversation_id: request.conversation_id,
            status,
            messages,
        })
    }
}

fn persistence_failed(
    turn_id: String,
    request: &TurnRequest,
    assembler: TurnAssembler<'_>,
    failure: PersistFailure,
) -> TurnError {
    warn!(
        attempts = failure.attempts,
        error = %failure.error,
        "transcript write failed, truncating turn"
    );
    let partial = Turn {
        turn_id,
        conversation_id: request.conversation_id.clone(),
        status: TurnStatus::Truncated(TruncationReason::PersistenceFailed(
            failure.error.to_string(),
        )),
        messages: assembler.into_messages(),
    };
    TurnError::Persistence {
        attempts: failure.attempts,
        source: failure.error,
        partial: Box::new(partial),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // --- Scripted sources ---

    fn script(events: Vec<TurnEvent>) -> impl Stream<Item = Result<TurnEvent, SourceError>> + Send {
        futures::stream::iter(events.into_iter().map(Ok))
    }

    /// Events followed by a source that never yields again.
    fn stalled(events: Vec<TurnEvent>) -> impl Stream<Item = Result<TurnEvent, SourceError>> + Send {
        script(events).chain(futures::stream::pending())
    }

    fn scenario_a() -> Vec<TurnEvent> {
        vec![
            TurnEvent::tool_start("c1", "search", json!({"q": "refund"})),
            TurnEvent::tool_end("c1", "policy: 30 days"),
            TurnEvent::model_end(Some("Refunds are accepted within 30 days.")),
        ]
    }

    // --- Flaky sink ---

    /// Fails every write from `fail_from` on, `failures` times in a row.
    struct FlakySink {
        inner: MemoryTranscript,
        writes: AtomicUsize,
        fail_from: usize,
        failures: usize,
        error: SinkError,
    }

    impl FlakySink {
        fn new(fail_from: usize, failures: usize, error: SinkError) -> Self {
            Self {
                inner: MemoryTranscript::new(),
                writes: AtomicUsize::new(0),
                fail_from,
                failures,
                error,
            }
        }
    }

    #[async_trait]
    impl TranscriptSink for FlakySink {
        async fn create_message(&self, message: NewMessage) -> Result<PersistedMessage, SinkError> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_from && n < self.fail_from + self.failures {
                return Err(self.error.clone());
            }
            self.inner.create_message(message).await
        }

        async fn list_messages(
            &self,
            conversation_id: &str,
        ) -> Result<Vec<PersistedMessage>, SinkError> {
            self.inner.list_messages(conversation_id).await
        }
    }

    /// Stores every write, but reports the first tool result as failed.
    struct LostAckSink {
        inner: Arc<MemoryTranscript>,
        acked_result: AtomicUsize,
    }

    #[async_trait]
    impl TranscriptSink for LostAckSink {
        async fn create_message(&self, message: NewMessage) -> Result<PersistedMessage, SinkError> {
            let is_result = message.role == Role::Tool;
            let stored = self.inner.create_message(message).await?;
            if is_result && self.acked_result.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SinkError::Unavailable("reply timed out".into()));
            }
            Ok(stored)
        }

        async fn list_messages(
            &self,
            conversation_id: &str,
        ) -> Result<Vec<PersistedMessage>, SinkError> {
            self.inner.list_messages(conversation_id).await
        }
    }

    fn orchestrator(store: &Arc<MemoryTranscript>) -> TurnOrchestrator {
        TurnOrchestrator::new(store.clone(), TurnConfig::default())
    }

    // --- Scenarios ---

    #[tokio::test]
    async fn single_tool_call_produces_three_messages() {
        let store = Arc::new(MemoryTranscript::new());
        let turn = orchestrator(&store)
            .run(TurnRequest::new("conv-1"), script(scenario_a()))
            .await
            .unwrap();

        assert!(turn.is_complete());
        turn.validate().unwrap();
        let messages = turn.decoded().unwrap();
        assert_eq!(messages.len(), 3);

        let Message::AssistantToolCalls { tool_calls } = &messages[0] else {
            panic!("expected tool calls, got {:?}", messages[0]);
        };
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].name, "search");
        assert!(tool_calls[0].id.starts_with("call_"));
        assert_eq!(tool_calls[0].arguments, r#"{"q":"refund"}"#);

        assert_eq!(
            messages[1],
            Message::ToolResult {
                tool_call_id: tool_calls[0].id.clone(),
                content: "policy: 30 days".into(),
            }
        );
        assert_eq!(turn.final_answer(), Some("Refunds are accepted within 30 days."));
        assert_eq!(store.len("conv-1"), 3);
    }

    #[tokio::test]
    async fn sequential_cycles_are_flushed_separately() {
        let store = Arc::new(MemoryTranscript::new());
        let events = vec![
            TurnEvent::tool_start("c1", "semantic_search", json!({"query": "x"})),
            TurnEvent::tool_end("c1", "error: 500"),
            TurnEvent::token("Let me try a keyword search."),
            TurnEvent::tool_start("c2", "keyword_search", json!({"query": "x"})),
            TurnEvent::tool_end("c2", "found"),
            TurnEvent::token("Here it is."),
            TurnEvent::model_end(None),
        ];
        let turn = orchestrator(&store)
            .run(TurnRequest::new("conv-1"), script(events))
            .await
            .unwrap();

        turn.validate().unwrap();
        let messages = turn.decoded().unwrap();
        assert_eq!(messages.len(), 5);
        let names: Vec<&str> = messages
            .iter()
            .filter_map(|m| match m {
                Message::AssistantToolCalls { tool_calls } => Some(tool_calls[0].name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, ["semantic_search", "keyword_search"]);
        // deliberation text from the first cycle is not part of the answer
        assert_eq!(turn.final_answer(), Some("Here it is."));
    }

    #[tokio::test]
    async fn plain_answer_is_one_message() {
        let store = Arc::new(MemoryTranscript::new());
        let events = vec![
            TurnEvent::token("Hi"),
            TurnEvent::token(" there"),
            TurnEvent::model_end(Some("Hi there")),
        ];
        let turn = orchestrator(&store)
            .run(TurnRequest::new("conv-1"), script(events))
            .await
            .unwrap();

        assert_eq!(turn.messages.len(), 1);
        assert_eq!(turn.final_answer(), Some("Hi there"));
        assert_eq!(turn.messages[0].raw_message["role"], "assistant");
    }

    #[tokio::test]
    async fn stream_ending_mid_tool_keeps_the_call() {
        let store = Arc::new(MemoryTranscript::new());
        let events = vec![TurnEvent::tool_start("r1", "semantic_search", json!({}))];
        let turn = orchestrator(&store)
            .run(TurnRequest::new("conv-1"), script(events))
            .await
            .unwrap();

        assert_eq!(
            turn.status,
            TurnStatus::Truncated(TruncationReason::SourceEnded)
        );
        assert_eq!(turn.messages.len(), 1);
        assert!(turn.messages[0].raw_message["tool_calls"].is_array());
        assert_eq!(turn.final_answer(), None);
        turn.validate().unwrap();
    }

    #[tokio::test]
    async fn unknown_tool_end_is_dropped() {
        let store = Arc::new(MemoryTranscript::new());
        let events = vec![
            TurnEvent::tool_end("ghost", "???"),
            TurnEvent::token("Nothing to do."),
            TurnEvent::model_end(None),
        ];
        let turn = orchestrator(&store)
            .run(TurnRequest::new("conv-1"), script(events))
            .await
            .unwrap();

        assert_eq!(turn.messages.len(), 1);
        assert_eq!(turn.final_answer(), Some("Nothing to do."));
    }

    #[tokio::test]
    async fn duplicate_results_and_starts_are_dropped() {
        let store = Arc::new(MemoryTranscript::new());
        let events = vec![
            TurnEvent::tool_start("r1", "search", json!({})),
            TurnEvent::tool_start("r1", "search", json!({})),
            TurnEvent::tool_end("r1", "first"),
            TurnEvent::tool_end("r1", "second"),
            TurnEvent::model_end(Some("done")),
        ];
        let turn = orchestrator(&store)
            .run(TurnRequest::new("conv-1"), script(events))
            .await
            .unwrap();

        turn.validate().unwrap();
        let messages = turn.decoded().unwrap();
        assert_eq!(messages.len(), 3);
        assert!(matches!(&messages[0], Message::AssistantToolCalls { tool_calls } if tool_calls.len() == 1));
        assert_eq!(messages[1].content(), Some("first"));
    }

    #[tokio::test]
    async fn parallel_calls_share_one_message() {
        let store = Arc::new(MemoryTranscript::new());
        let events = vec![
            TurnEvent::tool_start("r1", "semantic_search", json!({"query": "a"})),
            TurnEvent::tool_start("r2", "keyword_search", json!({"query": "b"})),
            TurnEvent::ToolBatchEnd,
            TurnEvent::tool_end("r2", "from keyword"),
            TurnEvent::tool_end("r1", "from semantic"),
            TurnEvent::model_end(Some("Combined answer.")),
        ];
        let turn = orchestrator(&store)
            .run(TurnRequest::new("conv-1"), script(events))
            .await
            .unwrap();

        turn.validate().unwrap();
        let messages = turn.decoded().unwrap();
        assert_eq!(messages.len(), 4);
        let Message::AssistantToolCalls { tool_calls } = &messages[0] else {
            panic!("expected tool calls");
        };
        assert_eq!(tool_calls.len(), 2);
        assert_eq!(messages[1].tool_call_id(), Some(tool_calls[1].id.as_str()));
        assert_eq!(messages[2].tool_call_id(), Some(tool_calls[0].id.as_str()));
        assert_eq!(turn.final_answer(), Some("Combined answer."));
    }

    #[tokio::test]
    async fn model_end_with_results_outstanding_continues() {
        let store = Arc::new(MemoryTranscript::new());
        let events = vec![
            TurnEvent::tool_start("r1", "search", json!({})),
            TurnEvent::model_end(None),
            TurnEvent::tool_end("r1", "late result"),
            TurnEvent::token("Answer."),
            TurnEvent::model_end(None),
        ];
        let turn = orchestrator(&store)
            .run(TurnRequest::new("conv-1"), script(events))
            .await
            .unwrap();

        turn.validate().unwrap();
        assert_eq!(turn.messages.len(), 3);
        assert_eq!(turn.final_answer(), Some("Answer."));
    }

    #[tokio::test]
    async fn user_message_is_persisted_first() {
        let store = Arc::new(MemoryTranscript::new());
        let turn = orchestrator(&store)
            .run(
                TurnRequest::new("conv-1").with_user_message("What is the refund policy?"),
                script(scenario_a()),
            )
            .await
            .unwrap();

        turn.validate().unwrap();
        assert_eq!(turn.messages.len(), 4);
        assert_eq!(turn.messages[0].role, Role::User);
        assert_eq!(
            turn.messages[0].content.as_deref(),
            Some("What is the refund policy?")
        );
    }

    #[tokio::test]
    async fn long_tool_output_is_truncated() {
        let store = Arc::new(MemoryTranscript::new());
        let config = TurnConfig::default().with_max_tool_output_chars(10);
        let events = vec![
            TurnEvent::tool_start("r1", "search", json!({})),
            TurnEvent::tool_end("r1", "x".repeat(50)),
            TurnEvent::model_end(Some("ok")),
        ];
        let turn = TurnOrchestrator::new(store.clone(), config)
            .run(TurnRequest::new("conv-1"), script(events))
            .await
            .unwrap();

        let result = turn.messages[1].content.as_deref().unwrap();
        assert!(result.starts_with(&"x".repeat(10)));
        assert!(result.ends_with("[40 more chars]"));
    }

    #[tokio::test]
    async fn source_error_truncates_and_keeps_progress() {
        let store = Arc::new(MemoryTranscript::new());
        let events = futures::stream::iter(vec![
            Ok(TurnEvent::tool_start("r1", "search", json!({}))),
            Ok(TurnEvent::tool_end("r1", "result")),
            Err(SourceError::Disconnected("socket closed".into())),
        ]);
        let turn = orchestrator(&store)
            .run(TurnRequest::new("conv-1"), events)
            .await
            .unwrap();

        assert!(matches!(
            turn.status,
            TurnStatus::Truncated(TruncationReason::SourceFailed(_))
        ));
        assert_eq!(turn.messages.len(), 2);
        assert!(turn.status.to_string().starts_with("incomplete"));
    }

    // --- Persistence ---

    #[tokio::test(start_paused = true)]
    async fn transient_write_failures_are_retried() {
        let sink = FlakySink::new(1, 2, SinkError::Unavailable("503".into()));
        let turn = TurnOrchestrator::new(sink, TurnConfig::default())
            .run(TurnRequest::new("conv-1"), script(scenario_a()))
            .await
            .unwrap();

        assert!(turn.is_complete());
        assert_eq!(turn.messages.len(), 3);
        turn.validate().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_the_partial_turn() {
        let sink = FlakySink::new(1, usize::MAX / 2, SinkError::Io("disk full".into()));
        let config = TurnConfig::default().with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        });
        let err = TurnOrchestrator::new(sink, config)
            .run(TurnRequest::new("conv-1"), script(scenario_a()))
            .await
            .unwrap_err();

        match err {
            TurnError::Persistence {
                attempts, partial, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(partial.messages.len(), 1);
                assert!(matches!(
                    partial.status,
                    TurnStatus::Truncated(TruncationReason::PersistenceFailed(_))
                ));
            }
            other => panic!("expected persistence error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_lost_ack_does_not_duplicate() {
        let store = Arc::new(MemoryTranscript::new());
        let sink = LostAckSink {
            inner: store.clone(),
            acked_result: AtomicUsize::new(0),
        };
        let turn = TurnOrchestrator::new(sink, TurnConfig::default())
            .run(TurnRequest::new("conv-1"), script(scenario_a()))
            .await
            .unwrap();

        assert_eq!(turn.messages.len(), 3);
        let stored = store.list_messages("conv-1").await.unwrap();
        assert_eq!(stored, turn.messages);

        let replayed = Turn {
            turn_id: "replay".into(),
            conversation_id: "conv-1".into(),
            status: TurnStatus::Complete,
            messages: stored,
        };
        replayed.validate().unwrap();
    }

    #[tokio::test]
    async fn rejected_write_is_not_retried() {
        let sink = FlakySink::new(
            0,
            1,
            SinkError::Rejected {
                status: 422,
                body: "unknown conversation".into(),
            },
        );
        let err = TurnOrchestrator::new(sink, TurnConfig::default())
            .run(TurnRequest::new("conv-1"), script(scenario_a()))
            .await
            .unwrap_err();

        match err {
            TurnError::Persistence {
                attempts, partial, ..
            } => {
                assert_eq!(attempts, 1);
                assert!(partial.messages.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    // --- Live output ---

    #[tokio::test]
    async fn live_sink_sees_tokens_and_tools() {
        let store = Arc::new(MemoryTranscript::new());
        let (live, mut rx) = ChannelLiveSink::channel(16);
        let mut events = scenario_a();
        events.insert(2, TurnEvent::token("Refunds are accepted"));
        let turn = orchestrator(&store)
            .run_streaming(
                TurnRequest::new("conv-1"),
                script(events),
                live,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(turn.is_complete());

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                LiveEvent::Token { .. } => "token",
                LiveEvent::ToolStarted { .. } => "tool_started",
                LiveEvent::ToolFinished { .. } => "tool_finished",
            });
        }
        assert_eq!(kinds, ["tool_started", "tool_finished", "token"]);
    }

    #[tokio::test]
    async fn full_live_channel_does_not_block_the_transcript() {
        let store = Arc::new(MemoryTranscript::new());
        let (live, rx) = ChannelLiveSink::channel(1);
        let events = (0..20)
            .map(|i| TurnEvent::token(format!("t{i} ")))
            .chain([TurnEvent::model_end(None)])
            .collect();
        let turn = orchestrator(&store)
            .run_streaming(
                TurnRequest::new("conv-1"),
                script(events),
                live,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(turn.is_complete());
        assert!(turn.final_answer().unwrap().starts_with("t0 t1 "));
        drop(rx);
    }

    #[tokio::test]
    async fn dropped_live_receiver_is_ignored() {
        let store = Arc::new(MemoryTranscript::new());
        let (live, rx) = ChannelLiveSink::channel(4);
        drop(rx);
        let turn = orchestrator(&store)
            .run_streaming(
                TurnRequest::new("conv-1"),
                script(scenario_a()),
                live,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(turn.messages.len(), 3);
    }

    // --- Cancellation ---

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_tool_truncates_after_drain() {
        let store = Arc::new(MemoryTranscript::new());
        let config = TurnConfig::default().with_drain_timeout(Duration::from_secs(2));
        let (live, mut rx) = ChannelLiveSink::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let turn = TurnOrchestrator::new(store.clone(), config)
            .run_streaming(
                TurnRequest::new("conv-1"),
                stalled(vec![TurnEvent::tool_start("r1", "search", json!({}))]),
                live,
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(
            turn.status,
            TurnStatus::Truncated(TruncationReason::DrainTimeout)
        );
        assert_eq!(turn.messages.len(), 1);
        assert!(turn.messages[0].raw_message["tool_calls"].is_array());
        // torn down before anything was sent
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_still_drains_a_finishing_stream() {
        let store = Arc::new(MemoryTranscript::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let turn = orchestrator(&store)
            .run_with_cancel(TurnRequest::new("conv-1"), script(scenario_a()), cancel)
            .await
            .unwrap();

        assert!(turn.is_complete());
        assert_eq!(turn.messages.len(), 3);
    }

    #[tokio::test]
    async fn zero_drain_timeout_stops_immediately() {
        let store = Arc::new(MemoryTranscript::new());
        let config = TurnConfig::default().with_drain_timeout(Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let turn = TurnOrchestrator::new(store.clone(), config)
            .run_with_cancel(TurnRequest::new("conv-1"), script(scenario_a()), cancel)
            .await
            .unwrap();

        assert_eq!(
            turn.status,
            TurnStatus::Truncated(TruncationReason::ClientDisconnected)
        );
        assert!(turn.messages.is_empty());
        assert!(store.is_empty("conv-1"));
    }

    // --- Concurrency and replay ---

    #[tokio::test]
    async fn same_conversation_turns_do_not_interleave() {
        let store = Arc::new(MemoryTranscript::new());
        let orchestrator = orchestrator(&store);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    let request =
                        TurnRequest::new("shared").with_user_message(format!("question {i}"));
                    orchestrator.run(request, script(scenario_a())).await
                })
            })
            .collect();

        let mut turns = Vec::new();
        for handle in handles {
            turns.push(handle.await.unwrap().unwrap());
        }

        let all = store.list_messages("shared").await.unwrap();
        assert_eq!(all.len(), 16);
        assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));
        for turn in &turns {
            let seqs: Vec<u64> = turn.messages.iter().map(|m| m.sequence).collect();
            assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1), "interleaved: {seqs:?}");
        }
        assert_eq!(orchestrator.ledger().high_water("shared"), 16);
    }

    #[tokio::test]
    async fn persisted_turn_replays_identically() {
        let store = Arc::new(MemoryTranscript::new());
        let orchestrator = orchestrator(&store);
        let turn = orchestrator
            .run(
                TurnRequest::new("conv-1").with_user_message("refund?"),
                script(scenario_a()),
            )
            .await
            .unwrap();

        let history = orchestrator.history("conv-1").await.unwrap();
        assert_eq!(history.len(), 4);
        let replayed: Vec<Message> = history
            .iter()
            .map(|raw| Message::from_raw(raw).unwrap())
            .collect();
        assert_eq!(replayed, turn.decoded().unwrap());
    }
}
