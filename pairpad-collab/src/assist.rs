//! Debounced suggestion requests.
//!
//! ```text
//! notify_edit ──► [pending, deadline = now + delay] ──fire──► SuggestionService
//!      ▲                  (rearmed on every edit)                    │
//!      │                                                  (seq, result)
//!      └───── suggestion cleared                                     ▼
//!                                               shown only if seq == latest
//! ```
//!
//! The requester is a single actor task. Rapid edits collapse into one request
//! carrying the buffer as of the last edit. Responses for anything but the most
//! recently issued request are dropped, as is any response that arrives while
//! a newer edit is still waiting for its timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Body of `POST /autocomplete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionQuery {
    pub code: String,
    pub cursor_position: usize,
    pub language: String,
}

impl SuggestionQuery {
    /// Query with the cursor at the end of `code`.
    pub fn at_end(code: impl Into<String>, language: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            cursor_position: code.chars().count(),
            code,
            language: language.into(),
        }
    }
}

/// Response of `POST /autocomplete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionResponse {
    pub suggestion: String,
}

/// Assist errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssistError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Suggestion service returned status {0}")]
    Status(u16),
    #[error("Malformed suggestion response: {0}")]
    Decode(String),
    #[error("Suggestion service unavailable: {0}")]
    Unavailable(String),
}

/// Produces a completion for a buffer.
#[async_trait]
pub trait SuggestionService: Send + Sync {
    async fn suggest(&self, query: SuggestionQuery) -> Result<String, AssistError>;
}

/// Fixed rules keyed on how the buffer ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSuggester;

impl HeuristicSuggester {
    pub fn suggest_for(code: &str) -> &'static str {
        let code = code.trim();
        if code.ends_with("def") {
            " my_function():\n    pass"
        } else if code.ends_with("print") {
            "('Hello World')"
        } else {
            " # mocked AI suggestion"
        }
    }
}

#[async_trait]
impl SuggestionService for HeuristicSuggester {
    async fn suggest(&self, query: SuggestionQuery) -> Result<String, AssistError> {
        Ok(Self::suggest_for(&query.code).to_string())
    }
}

/// Calls a remote `/autocomplete` endpoint.
#[derive(Debug, Clone)]
pub struct HttpSuggestionService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSuggestionService {
    /// `base_url` is the API root, e.g. `http://127.0.0.1:8000`.
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/autocomplete", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SuggestionService for HttpSuggestionService {
    async fn suggest(&self, query: SuggestionQuery) -> Result<String, AssistError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&query)
            .send()
            .await
            .map_err(|e| AssistError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AssistError::Status(status.as_u16()));
        }

        let body: SuggestionResponse = resp
            .json()
            .await
            .map_err(|e| AssistError::Decode(e.to_string()))?;
        Ok(body.suggestion)
    }
}

/// Requester configuration.
#[derive(Debug, Clone)]
pub struct AssistConfig {
    /// Quiet period after the last edit before a request is issued
    pub delay: Duration,
    /// Language tag sent with every query
    pub language: String,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(600),
            language: "python".to_string(),
        }
    }
}

enum AssistCommand {
    Edit(String),
    Clear,
    Take(oneshot::Sender<Option<String>>),
}

type Completion = (u64, Result<String, AssistError>);

/// Handle to a running requester. Dropping every handle stops the actor.
#[derive(Clone)]
pub struct AssistHandle {
    commands: mpsc::UnboundedSender<AssistCommand>,
    suggestion: watch::Receiver<Option<String>>,
    issued: Arc<AtomicU64>,
}

impl AssistHandle {
    /// Report a local edit: cancels the pending timer, clears the shown
    /// suggestion and rearms the timer with this buffer.
    pub fn notify_edit(&self, code: impl Into<String>) {
        let _ = self.commands.send(AssistCommand::Edit(code.into()));
    }

    /// Currently displayed suggestion.
    pub fn suggestion(&self) -> Option<String> {
        self.suggestion.borrow().clone()
    }

    /// Subscribe to suggestion changes.
    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.suggestion.clone()
    }

    /// Remove and return the displayed suggestion.
    pub async fn take_suggestion(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(AssistCommand::Take(tx)).ok()?;
        rx.await.ok().flatten()
    }

    pub fn clear(&self) {
        let _ = self.commands.send(AssistCommand::Clear);
    }

    /// Number of requests issued so far.
    pub fn issued_requests(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

/// Debounced requester actor.
pub struct AssistRequester {
    service: Arc<dyn SuggestionService>,
    config: AssistConfig,
    pending: Option<String>,
    deadline: Option<Instant>,
    latest_seq: u64,
    issued: Arc<AtomicU64>,
    suggestion: watch::Sender<Option<String>>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl AssistRequester {
    /// Start the actor and return its handle.
    pub fn spawn(service: Arc<dyn SuggestionService>, config: AssistConfig) -> AssistHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (suggestion_tx, suggestion_rx) = watch::channel(None);
        let issued = Arc::new(AtomicU64::new(0));

        let actor = Self {
            service,
            config,
            pending: None,
            deadline: None,
            latest_seq: 0,
            issued: issued.clone(),
            suggestion: suggestion_tx,
            completions: done_tx,
        };
        tokio::spawn(actor.run(cmd_rx, done_rx));

        AssistHandle {
            commands: cmd_tx,
            suggestion: suggestion_rx,
            issued,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<AssistCommand>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire();
                }
                Some((seq, result)) = completions.recv() => {
                    self.complete(seq, result);
                }
            }
        }
        log::debug!("Assist requester stopped after {} requests", self.latest_seq);
    }

    fn handle(&mut self, cmd: AssistCommand) {
        match cmd {
            AssistCommand::Edit(code) => {
                self.pending = Some(code);
                self.deadline = Some(Instant::now() + self.config.delay);
                self.suggestion.send_replace(None);
            }
            AssistCommand::Clear => {
                self.suggestion.send_replace(None);
            }
            AssistCommand::Take(reply) => {
                let _ = reply.send(self.suggestion.send_replace(None));
            }
        }
    }

    fn fire(&mut self) {
        self.deadline = None;
        let Some(code) = self.pending.take() else {
            return;
        };

        self.latest_seq += 1;
        self.issued.fetch_add(1, Ordering::Relaxed);
        let seq = self.latest_seq;
        log::debug!("Issuing suggestion request #{seq} ({} bytes)", code.len());

        let query = SuggestionQuery::at_end(code, self.config.language.clone());
        let service = self.service.clone();
        let done = self.completions.clone();
        tokio::spawn(async move {
            let result = service.suggest(query).await;
            let _ = done.send((seq, result));
        });
    }

    fn complete(&mut self, seq: u64, result: Result<String, AssistError>) {
        if seq != self.latest_seq || self.pending.is_some() {
            log::debug!("Discarding stale suggestion #{seq} (latest #{})", self.latest_seq);
            return;
        }
        match result {
            Ok(text) if !text.is_empty() => {
                self.suggestion.send_replace(Some(text));
            }
            Ok(_) => {}
            Err(e) => log::warn!("Suggestion request #{seq} failed: {e}"),
        }
    }
}
