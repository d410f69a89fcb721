//! Test doubles for the provider seam.
//!
//! [`MockProvider`] replays scripted turns and completions so engine flows
//! can run without a live text generation backend. Scripts are queues:
//! each [`stream_turn`](crate::provider::StoryProvider::stream_turn) call
//! consumes one scripted turn, each
//! [`complete`](crate::provider::StoryProvider::complete) call consumes one
//! scripted completion. An exhausted completion queue yields an empty
//! string, which downstream consumers treat as "nothing to do".

use crate::provider::{ProviderError, StoryProvider, StoryStream, TurnRequest};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

enum Script {
    Steps(Vec<Result<String, ProviderError>>),
    Channel(mpsc::UnboundedReceiver<Result<String, ProviderError>>),
}

/// Scripted [`StoryProvider`] for tests.
pub struct MockProvider {
    ready: AtomicBool,
    turns: Mutex<VecDeque<Script>>,
    completions: Mutex<VecDeque<String>>,
    turn_requests: Mutex<Vec<TurnRequest>>,
    completion_calls: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            turns: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            turn_requests: Mutex::new(Vec::new()),
            completion_calls: Mutex::new(Vec::new()),
        }
    }

    /// Flip the readiness flag reported by `is_ready`.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Queue one turn that streams the given chunks and ends cleanly.
    pub fn script_turn<S: Into<String>>(&self, chunks: Vec<S>) {
        let steps = chunks.into_iter().map(|c| Ok(c.into())).collect();
        self.turns.lock().unwrap().push_back(Script::Steps(steps));
    }

    /// Queue one turn that streams the given chunks and then fails.
    pub fn script_turn_with_error<S: Into<String>>(&self, chunks: Vec<S>, error: &str) {
        let mut steps: Vec<Result<String, ProviderError>> =
            chunks.into_iter().map(|c| Ok(c.into())).collect();
        steps.push(Err(ProviderError::Interrupted(error.to_string())));
        self.turns.lock().unwrap().push_back(Script::Steps(steps));
    }

    /// Queue one turn fed by hand. The returned sender pushes chunks (or a
    /// failure) into the stream; the stream stays open until the sender is
    /// dropped, which lets tests hold a turn mid-flight.
    pub fn manual_turn(&self) -> mpsc::UnboundedSender<Result<String, ProviderError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.turns.lock().unwrap().push_back(Script::Channel(rx));
        tx
    }

    /// Queue one `complete` response.
    pub fn script_completion(&self, text: impl Into<String>) {
        self.completions.lock().unwrap().push_back(text.into());
    }

    /// Turn requests seen so far, oldest first.
    pub fn turn_requests(&self) -> Vec<TurnRequest> {
        self.turn_requests.lock().unwrap().clone()
    }

    /// `(system, prompt)` pairs passed to `complete`, oldest first.
    pub fn completion_calls(&self) -> Vec<(String, String)> {
        self.completion_calls.lock().unwrap().clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoryProvider for MockProvider {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn stream_turn(&self, request: TurnRequest) -> Result<StoryStream, ProviderError> {
        self.turn_requests.lock().unwrap().push(request);
        let script = self.turns.lock().unwrap().pop_front();
        match script {
            Some(Script::Steps(steps)) => Ok(Box::pin(futures::stream::iter(steps))),
            Some(Script::Channel(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            None => Err(ProviderError::Request("no scripted turn queued".to_string())),
        }
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        _max_tokens: usize,
    ) -> Result<String, ProviderError> {
        self.completion_calls
            .lock()
            .unwrap()
            .push((system.to_string(), prompt.to_string()));
        let next = self.completions.lock().unwrap().pop_front();
        Ok(next.unwrap_or_default())
    }
}
