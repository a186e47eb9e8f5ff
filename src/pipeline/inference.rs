//! Inference: send one batch payload to the document-intelligence service.
//!
//! The pipeline only depends on the [`InferenceClient`] trait: one call in,
//! raw response text (or a classified [`InferenceError`]) out. The production
//! implementation, [`LlmInferenceClient`], drives any `edgequake-llm`
//! provider; tests plug in scripted clients.
//!
//! ## Retry Strategy
//!
//! [`infer_with_retry`] wraps every attempt in a timeout and retries
//! transient failures (rate limit, transport, timeout) with exponential
//! backoff (`retry_backoff_ms * 2^attempt`). A server-supplied
//! `retry-after` wins over the computed delay. Every delay is capped at
//! `api_timeout_secs`, so one batch never waits longer between attempts than
//! it may spend on an attempt. Authentication failures are returned on the
//! first attempt: no amount of retrying fixes a bad key.
//!
//! ## Document Mode
//!
//! Document payloads ride on the provider's inline-attachment channel as an
//! `application/pdf` part. Only providers that forward that part verbatim
//! ([`PDF_INLINE_PROVIDERS`]) can read it; the others turn it into an image
//! block and reject it, so [`LlmInferenceClient::from_config`] refuses them
//! up front instead of failing every batch.

use crate::cancel::CancelFlag;
use crate::config::{ExtractionConfig, ExtractionMode};
use crate::error::{ExtractError, InferenceError};
use crate::pipeline::payload::Payload;
use crate::prompts;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{
    ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError, ProviderFactory,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Model used when neither the config nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// Providers (by [`LLMProvider::name`]) that pass an inline
/// `application/pdf` part through to the model.
pub const PDF_INLINE_PROVIDERS: [&str; 2] = ["gemini", "vertex-ai"];

const PDF_MIME: &str = "application/pdf";

/// One external round trip per call.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, payload: &Payload) -> Result<String, InferenceError>;
}

// ── edgequake-llm implementation ─────────────────────────────────────────

/// [`InferenceClient`] over an `edgequake-llm` chat provider.
///
/// Text payloads are sent as a user message after the instructions. Document
/// payloads are attached to the user message as a base64
/// `application/pdf` inline part.
pub struct LlmInferenceClient {
    provider: Arc<dyn LLMProvider>,
    instructions: String,
    options: CompletionOptions,
}

impl LlmInferenceClient {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        let instructions = config
            .system_prompt
            .clone()
            .unwrap_or_else(|| prompts::default_instructions(config.mode));
        Self {
            provider,
            instructions,
            options: build_options(config),
        }
    }

    /// Resolve a provider from config/environment and wrap it.
    ///
    /// In document mode the provider must accept inline PDFs.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        let provider = resolve_provider(config)?;
        ensure_mode_supported(provider.as_ref(), config.mode)?;
        Ok(Self::new(provider, config))
    }

    fn build_messages(&self, payload: &Payload) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(&self.instructions)];
        match payload {
            Payload::Text(content) => {
                messages.push(ChatMessage::user(prompts::text_mode_user_message(content)));
            }
            Payload::Document { bytes, pages } => {
                let file = ImageData::new(STANDARD.encode(bytes), PDF_MIME);
                let text = format!(
                    "The attached PDF holds pages {:?} of the manifest. Generate ONLY the JSON.",
                    pages
                );
                messages.push(ChatMessage::user_with_images(text, vec![file]));
            }
        }
        messages
    }
}

#[async_trait]
impl InferenceClient for LlmInferenceClient {
    async fn infer(&self, payload: &Payload) -> Result<String, InferenceError> {
        let messages = self.build_messages(payload);
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_llm_error(&e))?;
        debug!(
            "{} input tokens, {} output tokens",
            response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }
}

/// Reject document mode on providers that cannot read an inline PDF.
pub fn ensure_mode_supported(
    provider: &dyn LLMProvider,
    mode: ExtractionMode,
) -> Result<(), ExtractError> {
    let name = provider.name();
    if mode == ExtractionMode::Text || PDF_INLINE_PROVIDERS.iter().any(|p| *p == name) {
        return Ok(());
    }
    Err(ExtractError::ProviderNotConfigured {
        provider: name.to_string(),
        hint: format!(
            "document mode sends the PDF as an inline {PDF_MIME} part, which only {} accept. \
             Use --mode text, or select one of those providers.",
            PDF_INLINE_PROVIDERS.join(" / ")
        ),
    })
}

/// Build `CompletionOptions` from the extraction config.
fn build_options(config: &ExtractionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

// ── Error classification ─────────────────────────────────────────────────

static RE_RETRY_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry[-_ ]after\D{0,4}(\d+)").unwrap());

/// An HTTP status only counts when it is labelled as one.
static RE_AUTH_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:status|http|code)(?:\s+code)?\s*[:=]?\s*(?:401|403)\b").unwrap()
});

static RE_RATE_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:status|http|code)(?:\s+code)?\s*[:=]?\s*429\b").unwrap()
});

/// Classify a typed provider error.
///
/// The variant decides wherever it is specific. Only the catch-all API and
/// provider variants fall back to reading the message.
pub fn classify_llm_error(error: &LlmError) -> InferenceError {
    match error {
        LlmError::AuthError(_) => InferenceError::Authentication(error.to_string()),
        LlmError::RateLimited(message) => InferenceError::RateLimited {
            detail: error.to_string(),
            retry_after_secs: retry_after(message),
        },
        LlmError::ApiError(_) | LlmError::ProviderError(_) | LlmError::Unknown(_) => {
            classify_provider_error(&error.to_string())
        }
        _ => InferenceError::Transport(error.to_string()),
    }
}

/// Classify a provider error by its message.
///
/// Used for errors whose type says nothing more than "the API failed":
/// vendor codes and labelled HTTP statuses in the text decide.
pub fn classify_provider_error(message: &str) -> InferenceError {
    let lower = message.to_lowercase();

    const AUTH: [&str; 5] = [
        "unauthorized",
        "authentication",
        "invalid api key",
        "invalid_api_key",
        "incorrect api key",
    ];
    const RATE: [&str; 4] = ["rate limit", "rate_limit", "too many requests", "quota"];

    if RE_AUTH_STATUS.is_match(message) || AUTH.iter().any(|k| lower.contains(k)) {
        InferenceError::Authentication(message.to_string())
    } else if RE_RATE_STATUS.is_match(message) || RATE.iter().any(|k| lower.contains(k)) {
        InferenceError::RateLimited {
            detail: message.to_string(),
            retry_after_secs: retry_after(message),
        }
    } else {
        InferenceError::Transport(message.to_string())
    }
}

fn retry_after(message: &str) -> Option<u64> {
    RE_RETRY_AFTER
        .captures(message)
        .and_then(|c| c[1].parse().ok())
}

// ── Retry driver ─────────────────────────────────────────────────────────

/// Result of [`infer_with_retry`].
#[derive(Debug)]
pub struct InferenceAttempt {
    pub result: Result<String, InferenceError>,
    /// Attempts actually made, including the first.
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Call `client` with per-attempt timeout and transient-failure retries.
///
/// Stops retrying early when `cancel` fires; the attempt already in flight
/// is allowed to finish.
pub async fn infer_with_retry(
    client: &dyn InferenceClient,
    payload: &Payload,
    config: &ExtractionConfig,
    batch_label: usize,
    cancel: &CancelFlag,
) -> InferenceAttempt {
    let start = Instant::now();
    let limit = Duration::from_secs(config.api_timeout_secs);
    let mut attempts = 0u32;
    let mut last_err = InferenceError::Transport("no attempt made".to_string());

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            if cancel.is_cancelled() {
                debug!("Batch {}: cancelled, not retrying", batch_label);
                break;
            }
            let delay = retry_delay(config, attempt, &last_err);
            warn!(
                "Batch {}: retry {}/{} after {}ms",
                batch_label,
                attempt,
                config.max_retries,
                delay.as_millis()
            );
            sleep(delay).await;
        }

        attempts += 1;
        let outcome = match timeout(limit, client.infer(payload)).await {
            Ok(r) => r,
            Err(_) => Err(InferenceError::Timeout {
                secs: config.api_timeout_secs,
            }),
        };

        match outcome {
            Ok(text) => {
                return InferenceAttempt {
                    result: Ok(text),
                    attempts,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
            Err(e) if !e.is_transient() => {
                warn!("Batch {}: {}", batch_label, e);
                last_err = e;
                break;
            }
            Err(e) => {
                warn!("Batch {}: attempt {} failed: {}", batch_label, attempt + 1, e);
                last_err = e;
            }
        }
    }

    InferenceAttempt {
        result: Err(last_err),
        attempts,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

/// Delay before retry number `attempt` (1-based): exponential backoff, or
/// the server's `retry-after` when longer, never above `api_timeout_secs`.
pub fn retry_delay(config: &ExtractionConfig, attempt: u32, last_err: &InferenceError) -> Duration {
    let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let mut backoff_ms = config.retry_backoff_ms.saturating_mul(factor);
    if let InferenceError::RateLimited {
        retry_after_secs: Some(secs),
        ..
    } = last_err
    {
        backoff_ms = backoff_ms.max(secs.saturating_mul(1000));
    }
    let ceiling_ms = config.api_timeout_secs.saturating_mul(1000);
    Duration::from_millis(backoff_ms.min(ceiling_ms))
}

// ── Provider resolution ──────────────────────────────────────────────────

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with `config.model` or
///    [`DEFAULT_MODEL`]; the factory reads the matching API key variable.
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Full auto-detection** via `ProviderFactory::from_env`.
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);

    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Name of the mode's default prompt, for logs.
pub fn prompt_label(config: &ExtractionConfig) -> &'static str {
    match (config.system_prompt.is_some(), config.mode) {
        (true, _) => "custom",
        (false, ExtractionMode::Text) => "text",
        (false, ExtractionMode::Document) => "document",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgequake_llm::{ChatRole, MockProvider};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed sequence of results, one per call.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, InferenceError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, InferenceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl InferenceClient for Scripted {
        async fn infer(&self, _payload: &Payload) -> Result<String, InferenceError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(InferenceError::Transport("script exhausted".into())))
        }
    }

    /// Never answers.
    struct Hanging;

    #[async_trait]
    impl InferenceClient for Hanging {
        async fn infer(&self, _payload: &Payload) -> Result<String, InferenceError> {
            std::future::pending().await
        }
    }

    fn fast_config(retries: u32) -> ExtractionConfig {
        ExtractionConfig::builder()
            .max_retries(retries)
            .retry_backoff_ms(1)
            .api_timeout_secs(1)
            .build()
            .unwrap()
    }

    fn payload() -> Payload {
        Payload::Text("--- Page 1 ---".into())
    }

    #[test]
    fn build_options_defaults() {
        let opts = build_options(&ExtractionConfig::default());
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[test]
    fn classifies_authentication_errors() {
        for msg in [
            "API error: 401 Unauthorized",
            "Incorrect API key provided: sk-...",
            "authentication_error: invalid x-api-key",
        ] {
            assert!(
                matches!(classify_provider_error(msg), InferenceError::Authentication(_)),
                "{msg}"
            );
        }
    }

    #[test]
    fn classifies_rate_limits_with_retry_after() {
        let e = classify_provider_error("HTTP 429 Too Many Requests; retry-after: 12");
        assert_eq!(
            e,
            InferenceError::RateLimited {
                detail: "HTTP 429 Too Many Requests; retry-after: 12".into(),
                retry_after_secs: Some(12),
            }
        );
        assert!(matches!(
            classify_provider_error("You exceeded your current quota"),
            InferenceError::RateLimited { retry_after_secs: None, .. }
        ));
    }

    #[test]
    fn everything_else_is_transport() {
        assert!(matches!(
            classify_provider_error("connection reset by peer"),
            InferenceError::Transport(_)
        ));
    }

    #[test]
    fn unlabelled_digit_runs_are_not_status_codes() {
        for msg in [
            "error sending request for url (https://api.openai.com/v1/chat/completions): \
             connection refused, request id req_84013",
            "upstream closed after 4290 bytes",
            "trace 1403-7a: socket hang up",
        ] {
            assert!(
                matches!(classify_provider_error(msg), InferenceError::Transport(_)),
                "{msg}"
            );
        }
        assert!(matches!(
            classify_provider_error("request failed with status code 403"),
            InferenceError::Authentication(_)
        ));
        assert!(matches!(
            classify_provider_error("HTTP 429: slow down"),
            InferenceError::RateLimited { .. }
        ));
    }

    #[test]
    fn typed_errors_are_classified_by_variant() {
        assert!(matches!(
            classify_llm_error(&LlmError::AuthError("bad key".into())),
            InferenceError::Authentication(_)
        ));
        assert!(matches!(
            classify_llm_error(&LlmError::RateLimited("retry after 7 seconds".into())),
            InferenceError::RateLimited {
                retry_after_secs: Some(7),
                ..
            }
        ));
        // The message would read as a 401 if it were matched as text.
        assert!(matches!(
            classify_llm_error(&LlmError::NetworkError("status 401 from proxy".into())),
            InferenceError::Transport(_)
        ));
        assert!(matches!(
            classify_llm_error(&LlmError::Timeout),
            InferenceError::Transport(_)
        ));
        assert!(matches!(
            classify_llm_error(&LlmError::ApiError("status: 401 Unauthorized".into())),
            InferenceError::Authentication(_)
        ));
        assert!(matches!(
            classify_llm_error(&LlmError::ApiError("overloaded, request req_4291".into())),
            InferenceError::Transport(_)
        ));
    }

    #[test]
    fn retry_delay_is_capped_by_the_call_timeout() {
        let config = ExtractionConfig::builder()
            .retry_backoff_ms(500)
            .api_timeout_secs(30)
            .build()
            .unwrap();
        let transport = InferenceError::Transport("reset".into());
        assert_eq!(retry_delay(&config, 1, &transport), Duration::from_millis(500));
        assert_eq!(retry_delay(&config, 3, &transport), Duration::from_millis(2000));
        assert_eq!(retry_delay(&config, 70, &transport), Duration::from_secs(30));

        let limited = |secs| InferenceError::RateLimited {
            detail: "429".into(),
            retry_after_secs: Some(secs),
        };
        assert_eq!(retry_delay(&config, 1, &limited(4)), Duration::from_secs(4));
        assert_eq!(retry_delay(&config, 1, &limited(86_400)), Duration::from_secs(30));
        assert_eq!(
            retry_delay(&config, 1, &limited(18_446_744_073_709_552)),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn huge_retry_after_waits_at_most_the_call_timeout() {
        let limited =
            classify_provider_error("HTTP 429 Too Many Requests; retry-after: 18446744073709552");
        assert!(matches!(
            limited,
            InferenceError::RateLimited {
                retry_after_secs: Some(18_446_744_073_709_552),
                ..
            }
        ));
        let client = Scripted::new(vec![Err(limited), Ok("[]".into())]);
        let started = Instant::now();
        let attempt =
            infer_with_retry(&client, &payload(), &fast_config(1), 1, &CancelFlag::new())
                .await;
        assert_eq!(attempt.result.unwrap(), "[]");
        assert_eq!(attempt.attempts, 2);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn document_payload_is_an_inline_pdf_part() {
        let config = ExtractionConfig::builder()
            .mode(ExtractionMode::Document)
            .build()
            .unwrap();
        let client = LlmInferenceClient::new(Arc::new(MockProvider::new()), &config);
        let messages = client.build_messages(&Payload::Document {
            bytes: b"%PDF-1.7".to_vec(),
            pages: vec![4, 5],
        });

        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].role, ChatRole::System));
        let user = &messages[1];
        assert!(matches!(user.role, ChatRole::User));
        assert!(user.content.contains("[4, 5]"));
        let parts = user.images.as_ref().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].mime_type, "application/pdf");
        assert_eq!(parts[0].data, STANDARD.encode(b"%PDF-1.7"));
    }

    #[test]
    fn text_payload_has_no_attachment() {
        let client =
            LlmInferenceClient::new(Arc::new(MockProvider::new()), &ExtractionConfig::default());
        let messages = client.build_messages(&payload());
        assert!(messages[1].images.is_none());
        assert!(messages[1].content.contains("--- Page 1 ---"));
    }

    #[test]
    fn document_mode_needs_an_inline_pdf_provider() {
        let mock = MockProvider::new();
        assert!(ensure_mode_supported(&mock, ExtractionMode::Text).is_ok());
        let err = ensure_mode_supported(&mock, ExtractionMode::Document).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::ProviderNotConfigured { ref provider, .. } if provider == "mock"
        ));

        let config = ExtractionConfig::builder()
            .mode(ExtractionMode::Document)
            .provider(Arc::new(MockProvider::new()))
            .build()
            .unwrap();
        assert!(LlmInferenceClient::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_success() {
        let client = Scripted::new(vec![
            Err(InferenceError::Transport("reset".into())),
            Ok("[]".into()),
        ]);
        let attempt =
            infer_with_retry(&client, &payload(), &fast_config(2), 1, &CancelFlag::new())
                .await;
        assert_eq!(attempt.result.unwrap(), "[]");
        assert_eq!(attempt.attempts, 2);
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retried() {
        let client = Scripted::new(vec![
            Err(InferenceError::Authentication("401".into())),
            Ok("[]".into()),
        ]);
        let attempt =
            infer_with_retry(&client, &payload(), &fast_config(3), 1, &CancelFlag::new())
                .await;
        assert!(matches!(attempt.result, Err(InferenceError::Authentication(_))));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let client = Scripted::new(vec![
            Err(InferenceError::Transport("a".into())),
            Err(InferenceError::Transport("b".into())),
        ]);
        let attempt =
            infer_with_retry(&client, &payload(), &fast_config(1), 1, &CancelFlag::new())
                .await;
        assert_eq!(attempt.result, Err(InferenceError::Transport("b".into())));
        assert_eq!(attempt.attempts, 2);
    }

    #[tokio::test]
    async fn hanging_call_times_out() {
        let attempt =
            infer_with_retry(&Hanging, &payload(), &fast_config(0), 1, &CancelFlag::new())
                .await;
        assert_eq!(attempt.result, Err(InferenceError::Timeout { secs: 1 }));
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let client = Scripted::new(vec![
            Err(InferenceError::Transport("a".into())),
            Ok("[]".into()),
        ]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let attempt = infer_with_retry(&client, &payload(), &fast_config(3), 1, &cancel).await;
        assert!(attempt.result.is_err());
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn prompt_label_reflects_override() {
        assert_eq!(prompt_label(&ExtractionConfig::default()), "text");
        let c = ExtractionConfig::builder().system_prompt("x").build().unwrap();
        assert_eq!(prompt_label(&c), "custom");
    }
}
