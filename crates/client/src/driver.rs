//! Turn driver — the IO half of a client turn.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parley_core::document::FileEntry;
use parley_core::error::StoreError;
use parley_core::message::Message;
use parley_core::store::ConversationStore;
use parley_core::stream::{ChatRequest, StreamEvent};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::parser::{FrameError, StreamParser};
use crate::state::{Applied, ConversationSession};

/// Raw bytes of one streamed turn.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ClientError>> + Send>>;

/// Opens the server-to-client event stream for one turn.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, ClientError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnStatus {
    Completed,
    Failed(String),
}

/// What happened during one driven turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub status: TurnStatus,
    /// The persisted-or-attempted assistant message of a completed turn.
    pub assistant: Option<Message>,
    pub frame_errors: Vec<FrameError>,
}

/// Drives turns for one user against a transport and a store.
pub struct TurnDriver {
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn ConversationStore>,
    user_id: String,
    persist_retries: u32,
    retry_delay: Duration,
}

impl TurnDriver {
    pub fn new(transport: Arc<dyn ChatTransport>, store: Arc<dyn ConversationStore>, user_id: impl Into<String>) -> Self {
        Self {
            transport,
            store,
            user_id: user_id.into(),
            persist_retries: 2,
            retry_delay: Duration::from_millis(200),
        }
    }

    /// Extra append attempts after a failed one.
    pub fn with_persist_retries(mut self, retries: u32) -> Self {
        self.persist_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run one turn.
    ///
    /// The user message is shown and persisted while the stream opens.
    /// `on_event` runs after each event is applied, for incremental rendering.
    pub async fn run_turn(
        &self,
        session: &mut ConversationSession,
        text: &str,
        files: &[FileEntry],
        mut on_event: impl FnMut(&ConversationSession, &StreamEvent, &Applied),
    ) -> Result<TurnReport, ClientError> {
        let user_message = session.submit(text)?;
        let request = ChatRequest {
            thread_id: session.thread_id().to_string(),
            org_id: session.org_id().to_string(),
            user_id: self.user_id.clone(),
            history: session.request_history(),
            new_message_text: user_message.content.clone(),
            message_id: Some(user_message.id.clone()),
            file_manifest: files.to_vec(),
        };

        let (persisted, opened) = tokio::join!(
            self.persist(session.thread_id(), session.org_id(), &user_message),
            self.transport.open(&request)
        );
        if let Err(err) = persisted {
            session.persist_failed(&user_message, &err);
        }

        let mut report = TurnReport {
            status: TurnStatus::Completed,
            assistant: None,
            frame_errors: Vec::new(),
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                session.transport_failed(err.to_string());
                report.status = TurnStatus::Failed(err.to_string());
                return Ok(report);
            }
        };

        let mut parser = StreamParser::new();
        let mut terminal: Option<Applied> = None;

        'read: while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %err, "Stream read failed");
                    break;
                }
            };
            let batch = parser.feed(&bytes);
            report.frame_errors.extend(batch.errors);
            for event in batch.events {
                let is_terminal = event.is_terminal();
                let applied = session.apply(event.clone());
                on_event(session, &event, &applied);
                if is_terminal {
                    terminal = Some(applied);
                    break 'read;
                }
            }
        }
        // Releasing the reader lets the server cancel whatever is still running.
        drop(stream);

        match terminal {
            Some(Applied::Finalized(message)) => {
                if let Err(err) = self.persist(session.thread_id(), session.org_id(), &message).await {
                    session.persist_failed(&message, &err);
                }
                report.assistant = Some(message);
            }
            Some(Applied::Aborted(reason)) => report.status = TurnStatus::Failed(reason),
            _ => {
                if let Err(err) = parser.finish() {
                    report.frame_errors.push(err);
                }
                let reason = "stream ended before the turn completed".to_string();
                session.transport_failed(reason.clone());
                report.status = TurnStatus::Failed(reason);
            }
        }
        Ok(report)
    }

    /// Append with bounded retries. Rejections are not retried.
    async fn persist(&self, thread_id: &str, org_id: &str, message: &Message) -> Result<String, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.append(thread_id, org_id, message).await {
                Ok(id) => {
                    debug!(message_id = %id, "Message persisted");
                    return Ok(id);
                }
                Err(err) if attempt < self.persist_retries && !matches!(err, StoreError::Rejected(_)) => {
                    attempt += 1;
                    warn!(attempt, error = %err, "Append failed, retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(err) => {
                    warn!(error = %err, "Append failed");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::message::Role;
    use parley_store::InMemoryStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays canned byte chunks and records the request it was opened with.
    struct CannedTransport {
        chunks: Vec<Vec<u8>>,
        seen: Mutex<Option<ChatRequest>>,
    }

    impl CannedTransport {
        fn new(body: &str, chunk_size: usize) -> Self {
            Self {
                chunks: body.as_bytes().chunks(chunk_size).map(|c| c.to_vec()).collect(),
                seen: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for CannedTransport {
        async fn open(&self, request: &ChatRequest) -> Result<ByteStream, ClientError> {
            *self.seen.lock().unwrap() = Some(request.clone());
            let chunks: Vec<Result<Vec<u8>, ClientError>> = self.chunks.iter().cloned().map(Ok).collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    struct RefusingTransport;

    #[async_trait]
    impl ChatTransport for RefusingTransport {
        async fn open(&self, _request: &ChatRequest) -> Result<ByteStream, ClientError> {
            Err(ClientError::Status {
                status: 502,
                body: "bad gateway".into(),
            })
        }
    }

    /// Fails the first `failures` appends, then delegates.
    struct FlakyStore {
        inner: InMemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ConversationStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn append(&self, thread_id: &str, org_id: &str, message: &Message) -> Result<String, StoreError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unreachable("connection refused".into()));
            }
            self.inner.append(thread_id, org_id, message).await
        }
        async fn last_message(&self, thread_id: &str, org_id: &str) -> Result<Option<Message>, StoreError> {
            self.inner.last_message(thread_id, org_id).await
        }
        async fn history(&self, thread_id: &str, org_id: &str) -> Result<Vec<Message>, StoreError> {
            self.inner.history(thread_id, org_id).await
        }
    }

    const HAPPY: &str = concat!(
        "event: token\ndata: {\"type\":\"token\",\"text\":\"Hi\"}\n\n",
        "event: token\ndata: {\"type\":\"token\",\"text\":\" there\"}\n\n",
        "event: done\ndata: {\"type\":\"done\"}\n\n",
    );

    fn driver(transport: Arc<dyn ChatTransport>, store: Arc<dyn ConversationStore>) -> TurnDriver {
        TurnDriver::new(transport, store, "u1").with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn completed_turn_persists_both_messages() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(CannedTransport::new(HAPPY, 7));
        let mut session = ConversationSession::new("t1", "acme", Vec::new());

        let mut tokens = String::new();
        let report = driver(transport.clone(), store.clone())
            .run_turn(&mut session, "hello", &[], |_, event, _| {
                if let StreamEvent::Token { text } = event {
                    tokens.push_str(text);
                }
            })
            .await
            .unwrap();

        assert_eq!(report.status, TurnStatus::Completed);
        assert_eq!(tokens, "Hi there");
        let stored = store.history("t1", "acme").await.unwrap();
        let stored: Vec<(Role, &str)> = stored.iter().map(|m| (m.role, m.content.as_str())).collect();
        assert_eq!(stored, vec![(Role::User, "hello"), (Role::Assistant, "Hi there")]);

        let seen = transport.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.new_message_text, "hello");
        assert!(seen.history.is_empty());
        assert_eq!(seen.message_id.as_deref(), Some(session.transcript()[0].id.as_str()));
    }

    #[tokio::test]
    async fn failed_turn_keeps_only_the_user_message() {
        let body = concat!(
            "data: {\"type\":\"token\",\"text\":\"par\"}\n\n",
            "data: {\"type\":\"error\",\"message\":\"Model invocation failed: down\"}\n\n",
        );
        let store = Arc::new(InMemoryStore::new());
        let mut session = ConversationSession::new("t1", "acme", Vec::new());
        let report = driver(Arc::new(CannedTransport::new(body, 5)), store.clone())
            .run_turn(&mut session, "hello", &[], |_, _, _| {})
            .await
            .unwrap();

        assert!(matches!(report.status, TurnStatus::Failed(ref m) if m.contains("down")));
        let stored = store.history("t1", "acme").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, Role::User);
        assert_eq!(session.transcript().len(), 1);
    }

    #[tokio::test]
    async fn stream_without_terminal_event_fails_the_turn() {
        let body = "data: {\"type\":\"token\",\"text\":\"par\"}\n\ndata: {\"type\":";
        let mut session = ConversationSession::new("t1", "acme", Vec::new());
        let report = driver(Arc::new(CannedTransport::new(body, 4)), Arc::new(InMemoryStore::new()))
            .run_turn(&mut session, "hello", &[], |_, _, _| {})
            .await
            .unwrap();

        assert!(matches!(report.status, TurnStatus::Failed(_)));
        assert!(matches!(report.frame_errors.last(), Some(FrameError::Truncated { .. })));
        assert!(session.error().is_some());
    }

    #[tokio::test]
    async fn transport_refusal_is_surfaced_inline() {
        let store = Arc::new(InMemoryStore::new());
        let mut session = ConversationSession::new("t1", "acme", Vec::new());
        let report = driver(Arc::new(RefusingTransport), store.clone())
            .run_turn(&mut session, "hello", &[], |_, _, _| {})
            .await
            .unwrap();

        assert!(matches!(report.status, TurnStatus::Failed(ref m) if m.contains("502")));
        assert_eq!(store.history("t1", "acme").await.unwrap().len(), 1);
        assert_eq!(session.transcript().len(), 1);
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::new(),
            failures: AtomicU32::new(2),
        });
        let mut session = ConversationSession::new("t1", "acme", Vec::new());
        driver(Arc::new(CannedTransport::new(HAPPY, 64)), store.clone())
            .run_turn(&mut session, "hello", &[], |_, _, _| {})
            .await
            .unwrap();

        assert!(session.notices().is_empty());
        assert_eq!(store.history("t1", "acme").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_add_a_notice() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::new(),
            failures: AtomicU32::new(100),
        });
        let mut session = ConversationSession::new("t1", "acme", Vec::new());
        let report = driver(Arc::new(CannedTransport::new(HAPPY, 64)), store)
            .with_persist_retries(1)
            .run_turn(&mut session, "hello", &[], |_, _, _| {})
            .await
            .unwrap();

        assert_eq!(report.status, TurnStatus::Completed);
        assert_eq!(session.notices().len(), 2);
        assert_eq!(session.transcript().len(), 2);
    }
}
