//! Grounded answer generation.
//!
//! Three backends form a closed set: a hosted OpenAI-compatible API, a local
//! Ollama server and an offline extractive fallback. The first backend that
//! answers its liveness probe is selected once per generator and reused for
//! every call. A call that fails on the selected backend is answered by the
//! fallback instead; the selection itself is only changed by
//! [`AnswerGenerator::reprobe`].

mod fallback;
mod hosted;
mod local;

use std::{
    fmt,
    sync::{
        Arc,
        RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub use self::{
    fallback::{DISCLOSURE, INSUFFICIENT_INFORMATION, extractive_answer},
    hosted::{DEFAULT_HOSTED_MODEL, DEFAULT_HOSTED_URL, HostedBackend},
    local::{DEFAULT_LOCAL_URL, LocalBackend, PREFERRED_LOCAL_MODELS},
};
use crate::error::{Error, Result};

pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const SYSTEM_PROMPT: &str = "You are a medical knowledge assistant. Answer only from the supplied medical literature, using professional clinical terminology and well-organized paragraphs. If the literature does not contain the answer, say so.";

/// The backends an answer can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Hosted,
    Local,
    Fallback,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hosted => "hosted",
            Self::Local => "local",
            Self::Fallback => "fallback",
        })
    }
}

/// Why a backend call did not produce an answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed")]
    Auth,
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("backend returned an empty response")]
    EmptyResponse,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Map a non-success HTTP status to an error.
fn check_status(status: reqwest::StatusCode) -> std::result::Result<(), GenerationError> {
    match status.as_u16() {
        200..=299 => Ok(()),
        401 | 403 => Err(GenerationError::Auth),
        code => Err(GenerationError::Status(code)),
    }
}

/// Sampling parameters shared by the model backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decoding {
    pub temperature: f32,
    pub top_p: f32,
    /// Overrides the per-backend default token limit.
    pub max_tokens: Option<u32>,
}

impl Default for Decoding {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.9,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub hosted_url: String,
    pub hosted_model: String,
    pub api_key: Option<String>,
    pub local_url: String,
    pub local_model: Option<String>,
    pub decoding: Decoding,
    pub generation_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            hosted_url: DEFAULT_HOSTED_URL.to_string(),
            hosted_model: DEFAULT_HOSTED_MODEL.to_string(),
            api_key: None,
            local_url: DEFAULT_LOCAL_URL.to_string(),
            local_model: None,
            decoding: Decoding::default(),
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// A generated answer.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub backend_used: BackendKind,
    pub model_used: Option<String>,
    pub generation_latency: Duration,
    /// Set when the selected backend failed and the fallback answered.
    pub demoted_from: Option<BackendKind>,
}

/// The backend chosen by probing, with the model it will use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveBackend {
    pub kind: BackendKind,
    pub model: Option<String>,
}

impl ActiveBackend {
    fn fallback() -> Self {
        Self {
            kind: BackendKind::Fallback,
            model: None,
        }
    }
}

/// Backend selection progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Uninitialized,
    Probing,
    Selected(BackendKind),
}

fn user_prompt(question: &str, context: &str) -> String {
    format!(
        "Based on the medical literature below, answer the clinical question accurately. Include drug names, dosages, diagnostic criteria and treatment protocols when the literature gives them.\n\nMedical Literature:\n{context}\n\nClinical Question: {question}\n\nAnswer:"
    )
}

pub struct AnswerGenerator {
    hosted: HostedBackend,
    local: LocalBackend,
    generation_timeout: Duration,
    probe_timeout: Duration,
    selection: RwLock<Arc<Selection>>,
}

/// One round of backend selection. A reset starts a new round, so a
/// round still in flight cannot touch the state of its successor.
#[derive(Default)]
struct Selection {
    cell: OnceCell<ActiveBackend>,
    probing: AtomicBool,
}

/// Marks a selection round as in flight until dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AnswerGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("cannot create HTTP client: {e}")))?;

        Ok(Self {
            hosted: HostedBackend::new(
                client.clone(),
                &config.hosted_url,
                &config.hosted_model,
                config.api_key.clone(),
                config.decoding,
            ),
            local: LocalBackend::new(
                client,
                &config.local_url,
                config.local_model.clone(),
                config.decoding,
            ),
            generation_timeout: config.generation_timeout,
            probe_timeout: config.probe_timeout,
            selection: RwLock::new(Arc::default()),
        })
    }

    fn current(&self) -> Arc<Selection> {
        self.selection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The selected backend, probing on first use.
    ///
    /// Concurrent first callers share one probe.
    pub async fn backend(&self) -> ActiveBackend {
        let selection = self.current();
        selection
            .cell
            .get_or_init(|| async {
                let _in_flight = InFlight::start(&selection.probing);
                self.probe().await
            })
            .await
            .clone()
    }

    pub fn state(&self) -> SelectionState {
        let selection = self.current();
        match selection.cell.get() {
            Some(active) => SelectionState::Selected(active.kind),
            None if selection.probing.load(Ordering::SeqCst) => SelectionState::Probing,
            None => SelectionState::Uninitialized,
        }
    }

    /// Forget the current selection; the next call probes again.
    pub fn reprobe(&self) {
        let mut selection = self
            .selection
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *selection = Arc::default();
    }

    async fn probe(&self) -> ActiveBackend {
        match self.hosted.probe(self.probe_timeout).await {
            Ok(model) => {
                info!(backend = "hosted", %model, "selected generation backend");
                return ActiveBackend {
                    kind: BackendKind::Hosted,
                    model: Some(model),
                };
            }
            Err(e) => info!(error = %e, "hosted backend unavailable"),
        }

        match self.local.probe(self.probe_timeout).await {
            Ok(model) => {
                info!(backend = "local", %model, "selected generation backend");
                return ActiveBackend {
                    kind: BackendKind::Local,
                    model: Some(model),
                };
            }
            Err(e) => info!(error = %e, "local backend unavailable"),
        }

        info!(backend = "fallback", "no language model available");
        ActiveBackend::fallback()
    }

    /// Answer `question` from `context`.
    ///
    /// Never fails and never returns empty text: any backend failure is
    /// answered by the extractive fallback.
    pub async fn generate(&self, question: &str, context: &str) -> Answer {
        let started = Instant::now();
        let active = self.backend().await;

        let result = match (&active.kind, &active.model) {
            (BackendKind::Hosted, Some(model)) => {
                self.race(self.hosted.generate(model, question, context)).await
            }
            (BackendKind::Local, Some(model)) => {
                self.race(self.local.generate(model, question, context)).await
            }
            _ => Err(GenerationError::Unavailable("no model selected".to_string())),
        };

        match result {
            Ok(text) => Answer {
                text,
                backend_used: active.kind,
                model_used: active.model,
                generation_latency: started.elapsed(),
                demoted_from: None,
            },
            Err(e) => {
                let demoted_from = (active.kind != BackendKind::Fallback).then_some(active.kind);
                if let Some(kind) = demoted_from {
                    warn!(backend = %kind, error = %e, "generation failed, using extractive fallback");
                }
                Answer {
                    text: extractive_answer(question, context),
                    backend_used: BackendKind::Fallback,
                    model_used: None,
                    generation_latency: started.elapsed(),
                    demoted_from,
                }
            }
        }
    }

    async fn race<F>(&self, call: F) -> std::result::Result<String, GenerationError>
    where
        F: Future<Output = std::result::Result<String, GenerationError>>,
    {
        let text = tokio::time::timeout(self.generation_timeout, call)
            .await
            .unwrap_or(Err(GenerationError::Timeout))?;
        let text = text.trim();
        if text.is_empty() {
            Err(GenerationError::EmptyResponse)
        } else {
            Ok(text.to_string())
        }
    }
}

impl fmt::Debug for AnswerGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerGenerator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use mockito::Server;

    use super::*;

    const CONTEXT: &str = "[Source: dm.pdf - Page 2]\nMetformin is first-line therapy for type 2 diabetes. Exercise improves insulin sensitivity.";

    fn offline_config() -> GenerationConfig {
        GenerationConfig {
            api_key: None,
            local_url: "http://127.0.0.1:9".to_string(),
            probe_timeout: Duration::from_millis(500),
            ..GenerationConfig::default()
        }
    }

    #[tokio::test]
    async fn offline_selects_fallback() {
        let generator = AnswerGenerator::new(&offline_config()).unwrap();
        assert_eq!(generator.state(), SelectionState::Uninitialized);

        let answer = generator.generate("What is metformin used for?", CONTEXT).await;
        assert_eq!(answer.backend_used, BackendKind::Fallback);
        assert_eq!(answer.demoted_from, None);
        assert!(answer.text.contains("Metformin"));
        assert!(answer.text.ends_with(DISCLOSURE));
        assert_eq!(
            generator.state(),
            SelectionState::Selected(BackendKind::Fallback)
        );
    }

    #[tokio::test]
    async fn local_backend_is_selected_and_used() {
        let mut server = Server::new_async().await;
        let tags = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"phi3:mini"},{"name":"llama3.1:8b"}]}"#)
            .expect(1)
            .create_async()
            .await;
        let generate = server
            .mock("POST", "/api/generate")
            .with_status(200)
            .with_body(r#"{"response":"  Metformin is first-line.  ","done":true}"#)
            .expect(2)
            .create_async()
            .await;

        let config = GenerationConfig {
            local_url: server.url(),
            ..offline_config()
        };
        let generator = AnswerGenerator::new(&config).unwrap();

        for _ in 0..2 {
            let answer = generator.generate("metformin?", CONTEXT).await;
            assert_eq!(answer.backend_used, BackendKind::Local);
            assert_eq!(answer.model_used.as_deref(), Some("llama3.1:8b"));
            assert_eq!(answer.text, "Metformin is first-line.");
        }

        tags.assert_async().await;
        generate.assert_async().await;
    }

    #[tokio::test]
    async fn failed_call_is_demoted_without_changing_selection() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"mistral"}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/generate")
            .with_status(500)
            .create_async()
            .await;

        let config = GenerationConfig {
            local_url: server.url(),
            ..offline_config()
        };
        let generator = AnswerGenerator::new(&config).unwrap();

        let answer = generator.generate("metformin?", CONTEXT).await;
        assert_eq!(answer.backend_used, BackendKind::Fallback);
        assert_eq!(answer.demoted_from, Some(BackendKind::Local));
        assert!(!answer.text.is_empty());
        assert_eq!(
            generator.state(),
            SelectionState::Selected(BackendKind::Local)
        );
    }

    #[tokio::test]
    async fn empty_model_output_is_demoted() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"mistral"}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/generate")
            .with_status(200)
            .with_body(r#"{"response":"   "}"#)
            .create_async()
            .await;

        let config = GenerationConfig {
            local_url: server.url(),
            ..offline_config()
        };
        let generator = AnswerGenerator::new(&config).unwrap();
        let answer = generator.generate("metformin?", CONTEXT).await;
        assert_eq!(answer.demoted_from, Some(BackendKind::Local));
        assert!(!answer.text.trim().is_empty());
    }

    #[tokio::test]
    async fn hosted_is_preferred_over_local() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/models")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_body(r#"{"data":[]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"Use metformin."}}]}"#,
            )
            .create_async()
            .await;

        let config = GenerationConfig {
            hosted_url: server.url(),
            api_key: Some("secret".to_string()),
            ..offline_config()
        };
        let generator = AnswerGenerator::new(&config).unwrap();
        let answer = generator.generate("metformin?", CONTEXT).await;
        assert_eq!(answer.backend_used, BackendKind::Hosted);
        assert_eq!(answer.model_used.as_deref(), Some(DEFAULT_HOSTED_MODEL));
        assert_eq!(answer.text, "Use metformin.");
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let config = GenerationConfig {
            generation_timeout: Duration::from_millis(50),
            ..offline_config()
        };
        let generator = AnswerGenerator::new(&config).unwrap();
        let result = generator
            .race(std::future::pending::<std::result::Result<String, GenerationError>>())
            .await;
        assert_eq!(result, Err(GenerationError::Timeout));
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_probe() {
        let mut server = Server::new_async().await;
        let tags = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"mistral"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let config = GenerationConfig {
            local_url: server.url(),
            ..offline_config()
        };
        let generator = AnswerGenerator::new(&config).unwrap();
        let (a, b, c) = tokio::join!(
            generator.backend(),
            generator.backend(),
            generator.backend()
        );
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.kind, BackendKind::Local);
        tags.assert_async().await;
    }

    #[tokio::test]
    async fn reprobe_forces_a_new_selection() {
        let mut server = Server::new_async().await;
        let tags = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"mistral"}]}"#)
            .expect(2)
            .create_async()
            .await;

        let config = GenerationConfig {
            local_url: server.url(),
            ..offline_config()
        };
        let generator = AnswerGenerator::new(&config).unwrap();
        generator.backend().await;
        generator.reprobe();
        assert_eq!(generator.state(), SelectionState::Uninitialized);
        generator.backend().await;
        tags.assert_async().await;
    }

    #[test]
    fn stale_selection_round_does_not_clear_state_of_new_round() {
        let generator = AnswerGenerator::new(&offline_config()).unwrap();
        let stale = generator.current();
        let stale_flight = InFlight::start(&stale.probing);
        assert_eq!(generator.state(), SelectionState::Probing);

        generator.reprobe();
        assert_eq!(generator.state(), SelectionState::Uninitialized);
        let fresh = generator.current();
        let _fresh_flight = InFlight::start(&fresh.probing);

        drop(stale_flight);
        assert_eq!(generator.state(), SelectionState::Probing);
    }
}
