//! Per-turn orchestration.
//!
//! Drives one user turn through the state machine
//! `Idle → InputReceived → ContextAssembling → AwaitingModel → Streaming
//! → Complete | Failed`, with cooperative cancellation at every
//! suspension point (a cancelled turn leaves history unchanged).
//!
//! Failure policy: retrieval and web search are enrichment; their
//! failures downgrade the turn to general-knowledge mode with a warning.
//! Only the completion call itself is turn-fatal, and even then the
//! partial streamed text is kept in the transcript. Nothing here is
//! process-fatal.

use crate::completion::{CancelToken, ChatBackend, StreamError};
use crate::config::Config;
use crate::context::{self, ContextBudget};
use crate::embedding::{self, EmbeddingProvider};
use crate::models::{RetrievalHit, Role, WebSnippet};
use crate::session::Session;
use crate::websearch;

/// States of one user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    InputReceived,
    ContextAssembling,
    AwaitingModel,
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

/// An image attached to a turn. Vision takes precedence: retrieval and
/// web context are skipped for the turn.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TurnInput {
    pub text: String,
    pub image: Option<ImageAttachment>,
}

impl TurnInput {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub retrieval: bool,
    pub web_search: bool,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            retrieval: true,
            web_search: false,
        }
    }
}

/// Outcome of one turn.
#[derive(Debug)]
pub struct TurnReport {
    pub answer: String,
    pub phase: TurnPhase,
    pub retrieved: usize,
    pub web_results: usize,
    pub warnings: Vec<String>,
    /// Set exactly once when the completion call fails.
    pub error: Option<String>,
}

impl TurnReport {
    fn cancelled(partial: String) -> Self {
        Self {
            answer: partial,
            phase: TurnPhase::Cancelled,
            retrieved: 0,
            web_results: 0,
            warnings: Vec::new(),
            error: None,
        }
    }
}

/// Run one user turn against the session.
///
/// History is appended before this returns (user message, then the
/// assistant's full or partial answer), so the next turn's assembled
/// context reflects every turn that completed before it. A cancelled
/// turn appends nothing.
pub async fn run_turn(
    session: &mut Session,
    config: &Config,
    backend: &dyn ChatBackend,
    embedder: Option<&dyn EmbeddingProvider>,
    input: TurnInput,
    opts: &TurnOptions,
    cancel: &CancelToken,
    on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> TurnReport {
    let mut warnings: Vec<String> = Vec::new();

    // InputReceived → ContextAssembling
    if cancel.is_cancelled() {
        return TurnReport::cancelled(String::new());
    }

    let mut hits: Vec<RetrievalHit> = Vec::new();
    let mut snippets: Vec<WebSnippet> = Vec::new();

    let messages = if let Some(ref image) = input.image {
        // Vision and text retrieval are mutually exclusive in a turn.
        context::to_multimodal_messages(
            &config.assistant.persona,
            &input.text,
            &image.media_type,
            &image.bytes,
        )
    } else {
        if opts.retrieval {
            if let Some(index) = session.index.as_ref().filter(|ix| !ix.is_empty()) {
                match embedder {
                    Some(provider) => match embedding::embed_query(provider, &input.text).await {
                        Ok(query_vec) => {
                            if cancel.is_cancelled() {
                                return TurnReport::cancelled(String::new());
                            }
                            match index.query(&query_vec, config.retrieval.top_k) {
                                Ok(found) => hits = found,
                                Err(e) => warnings
                                    .push(format!("retrieval skipped (index error): {}", e)),
                            }
                        }
                        Err(e) => {
                            warnings.push(format!("retrieval skipped (embedding error): {}", e))
                        }
                    },
                    None => warnings
                        .push("retrieval skipped: no embedding provider configured".to_string()),
                }
            }
        }

        if opts.web_search {
            if cancel.is_cancelled() {
                return TurnReport::cancelled(String::new());
            }
            match websearch::fetch_snippets(&config.websearch, &input.text).await {
                Ok(found) => snippets = found,
                Err(e) => warnings.push(format!("web context omitted: {}", e)),
            }
        }

        let system = context::build_system_prompt(
            &config.assistant.persona,
            &hits,
            &snippets,
            &ContextBudget::from(&config.retrieval),
        );
        context::to_messages(
            &system,
            &session.history,
            config.session.history_window,
            &input.text,
        )
    };

    // ContextAssembling → AwaitingModel
    if cancel.is_cancelled() {
        return TurnReport::cancelled(String::new());
    }

    let (answer, final_phase, error) = if input.image.is_some() {
        // One-shot multimodal call; no token stream.
        match backend.complete(&messages).await {
            Ok(answer) => {
                on_token(&answer);
                (answer, TurnPhase::Complete, None)
            }
            Err(e) => (String::new(), TurnPhase::Failed, Some(e.to_string())),
        }
    } else {
        match backend.stream(&messages, cancel, on_token).await {
            Ok(answer) => (answer, TurnPhase::Complete, None),
            Err(StreamError::Cancelled { partial }) => {
                return TurnReport::cancelled(partial);
            }
            Err(StreamError::Api { partial, message }) => {
                (partial, TurnPhase::Failed, Some(message))
            }
        }
    };

    // Append-only, strictly ordered: the user message, then whatever
    // the assistant produced (full answer, or the preserved partial).
    session.append_turn(Role::User, input.text.clone());
    if !answer.is_empty() || final_phase == TurnPhase::Complete {
        session.append_turn(Role::Assistant, answer.clone());
    }

    TurnReport {
        answer,
        phase: final_phase,
        retrieved: hits.len(),
        web_results: snippets.len(),
        warnings,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::ChatMessage;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records the messages it receives and replies from a script.
    struct FakeBackend {
        reply: String,
        fail_with: Option<String>,
        partial: String,
        seen: Mutex<Vec<Vec<serde_json::Value>>>,
    }

    impl FakeBackend {
        fn answering(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fail_with: None,
                partial: String::new(),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing(partial: &str, message: &str) -> Self {
            Self {
                reply: String::new(),
                fail_with: Some(message.to_string()),
                partial: partial.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, messages: &[ChatMessage]) {
            let json: Vec<serde_json::Value> = messages
                .iter()
                .map(|m| serde_json::to_value(m).unwrap())
                .collect();
            self.seen.lock().unwrap().push(json);
        }

        fn last_request(&self) -> Vec<serde_json::Value> {
            self.seen.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.record(messages);
            match &self.fail_with {
                Some(msg) => anyhow::bail!("{}", msg),
                None => Ok(self.reply.clone()),
            }
        }

        async fn stream(
            &self,
            messages: &[ChatMessage],
            cancel: &CancelToken,
            on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> std::result::Result<String, StreamError> {
            self.record(messages);
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled {
                    partial: self.partial.clone(),
                });
            }
            if let Some(ref message) = self.fail_with {
                if !self.partial.is_empty() {
                    on_token(&self.partial);
                }
                return Err(StreamError::Api {
                    partial: self.partial.clone(),
                    message: message.clone(),
                });
            }
            on_token(&self.reply);
            Ok(self.reply.clone())
        }
    }

    fn config() -> Config {
        Config::default()
    }

    #[tokio::test]
    async fn happy_path_appends_both_turns() {
        let mut session = Session::new("t");
        let backend = FakeBackend::answering("the answer");
        let mut tokens = String::new();

        let report = run_turn(
            &mut session,
            &config(),
            &backend,
            None,
            TurnInput::text_only("the question"),
            &TurnOptions::default(),
            &CancelToken::new(),
            &mut |t: &str| tokens.push_str(t),
        )
        .await;

        assert_eq!(report.phase, TurnPhase::Complete);
        assert_eq!(report.answer, "the answer");
        assert_eq!(tokens, "the answer");
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[0].role, Role::User);
        assert_eq!(session.history[0].content, "the question");
        assert_eq!(session.history[1].content, "the answer");
    }

    #[tokio::test]
    async fn second_turn_sees_first_turn_verbatim() {
        let mut session = Session::new("t");
        let backend = FakeBackend::answering("answer one");
        run_turn(
            &mut session,
            &config(),
            &backend,
            None,
            TurnInput::text_only("question one"),
            &TurnOptions::default(),
            &CancelToken::new(),
            &mut |_| {},
        )
        .await;

        let backend2 = FakeBackend::answering("answer two");
        run_turn(
            &mut session,
            &config(),
            &backend2,
            None,
            TurnInput::text_only("question two"),
            &TurnOptions::default(),
            &CancelToken::new(),
            &mut |_| {},
        )
        .await;

        let request = backend2.last_request();
        // system + first user + first assistant + second user
        assert_eq!(request.len(), 4);
        assert_eq!(request[1]["content"], "question one");
        assert_eq!(request[2]["content"], "answer one");
        assert_eq!(request[3]["content"], "question two");
    }

    #[tokio::test]
    async fn stream_failure_keeps_partial_in_history() {
        let mut session = Session::new("t");
        let backend = FakeBackend::failing("half an ans", "quota exceeded");

        let report = run_turn(
            &mut session,
            &config(),
            &backend,
            None,
            TurnInput::text_only("q"),
            &TurnOptions::default(),
            &CancelToken::new(),
            &mut |_| {},
        )
        .await;

        assert_eq!(report.phase, TurnPhase::Failed);
        assert_eq!(report.error.as_deref(), Some("quota exceeded"));
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[1].content, "half an ans");
    }

    #[tokio::test]
    async fn failure_without_partial_appends_only_user_turn() {
        let mut session = Session::new("t");
        let backend = FakeBackend::failing("", "connection refused");

        let report = run_turn(
            &mut session,
            &config(),
            &backend,
            None,
            TurnInput::text_only("q"),
            &TurnOptions::default(),
            &CancelToken::new(),
            &mut |_| {},
        )
        .await;

        assert_eq!(report.phase, TurnPhase::Failed);
        assert_eq!(session.history.len(), 1);
        assert_eq!(session.history[0].role, Role::User);
    }

    #[tokio::test]
    async fn cancellation_leaves_history_unchanged() {
        let mut session = Session::new("t");
        let backend = FakeBackend::answering("never seen");
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = run_turn(
            &mut session,
            &config(),
            &backend,
            None,
            TurnInput::text_only("q"),
            &TurnOptions::default(),
            &cancel,
            &mut |_| {},
        )
        .await;

        assert_eq!(report.phase, TurnPhase::Cancelled);
        assert!(session.history.is_empty());
    }

    #[tokio::test]
    async fn image_turn_is_multimodal_and_skips_retrieval_context() {
        let mut session = Session::new("t");
        let backend = FakeBackend::answering("a photo of a contract");

        let report = run_turn(
            &mut session,
            &config(),
            &backend,
            None,
            TurnInput {
                text: "what is in this image?".to_string(),
                image: Some(ImageAttachment {
                    media_type: "image/png".to_string(),
                    bytes: vec![1, 2, 3],
                }),
            },
            &TurnOptions::default(),
            &CancelToken::new(),
            &mut |_| {},
        )
        .await;

        assert_eq!(report.phase, TurnPhase::Complete);
        assert_eq!(report.retrieved, 0);
        let request = backend.last_request();
        assert_eq!(request.len(), 2);
        // The user message is multimodal; the system prompt carries no
        // document-excerpt section.
        assert!(request[1]["content"].is_array());
        let system = request[0]["content"].as_str().unwrap();
        assert!(!system.contains("Document excerpts"));
    }

    #[tokio::test]
    async fn missing_embedder_downgrades_with_warning() {
        let mut session = Session::new("t");
        session.index = Some(crate::index::VectorIndex::build(
            "m",
            1,
            vec![crate::models::TextChunk {
                chunk_id: "c".to_string(),
                text: "indexed text".to_string(),
                source_name: "d.txt".to_string(),
                page_number: None,
                char_offset: 0,
                hash: String::new(),
            }],
            vec![vec![1.0]],
        )
        .unwrap());

        let backend = FakeBackend::answering("ok");
        let report = run_turn(
            &mut session,
            &config(),
            &backend,
            None,
            TurnInput::text_only("q"),
            &TurnOptions::default(),
            &CancelToken::new(),
            &mut |_| {},
        )
        .await;

        assert_eq!(report.phase, TurnPhase::Complete);
        assert_eq!(report.retrieved, 0);
        assert!(!report.warnings.is_empty());
        // The turn still went through without retrieval context.
        let last_request = backend.last_request();
        let system = last_request[0]["content"].as_str().unwrap();
        assert!(!system.contains("indexed text"));
    }
}
