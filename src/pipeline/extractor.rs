//! Generative recipient extraction: the fallback when no pattern matches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{LlmError, OrderError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::patterns::{infer_country, normalize_country};
use crate::pipeline::types::{split_name, ParsedRecipient};
use crate::retry::{retry, RetryPolicy};

/// Default wall-clock limit for one model call.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);

const EXTRACT_MAX_TOKENS: u32 = 512;
const EXTRACT_TEMPERATURE: f32 = 0.0;

/// Input to the extractor.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub subject: &'a str,
    pub from: &'a str,
    pub text: &'a str,
    pub html: Option<&'a str>,
}

/// A validated generative result.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub recipient: ParsedRecipient,
    /// Message text as the model read it, if it returned one.
    pub message: Option<String>,
    pub image_reference: Option<String>,
}

/// Turns free-form email content into a recipient.
#[async_trait]
pub trait RecipientExtractor: Send + Sync {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<Extraction, OrderError>;
}

/// `RecipientExtractor` backed by an `LlmProvider`.
pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    timeout: Duration,
    default_country: String,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, default_country: impl Into<String>) -> Self {
        Self {
            llm,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_LLM_TIMEOUT,
            default_country: default_country.into(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call_once(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        match tokio::time::timeout(self.timeout, self.llm.complete(request.clone())).await {
            Ok(result) => result.map(|r| r.content),
            Err(_) => Err(LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl RecipientExtractor for LlmExtractor {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<Extraction, OrderError> {
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(&request)),
        ])
        .with_temperature(EXTRACT_TEMPERATURE)
        .with_max_tokens(EXTRACT_MAX_TOKENS);

        let raw = retry(
            self.retry,
            "llm_extract",
            |e: &LlmError| matches!(e, LlmError::RequestFailed { .. } | LlmError::Timeout { .. }),
            || self.call_once(&completion),
        )
        .await?;

        debug!(model = self.llm.model_name(), "Generative extraction returned");
        parse_extraction(&raw, &self.default_country).inspect_err(|e| {
            warn!(error = %e, raw_response = %raw, "Unusable generative extraction");
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You extract a postal mailing address and a short greeting from an email \
     asking for a postcard to be sent.\n\n\
     Respond with ONLY a JSON object in this exact shape:\n\
     {\"recipient\": {\"name\": \"...\", \"addressLine1\": \"...\", \"addressLine2\": \"...\", \
     \"city\": \"...\", \"state\": \"...\", \"zipCode\": \"...\", \"country\": \"...\"}, \
     \"message\": \"...\", \"imageReference\": \"...\"}\n\n\
     Rules:\n\
     - state is the two-letter US state or Canadian province code\n\
     - omit addressLine2, country and imageReference when not present\n\
     - message is the text to print on the card, without the address\n\
     - never invent address parts that are not in the email"
        .to_string()
}

fn build_user_prompt(request: &ExtractionRequest<'_>) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(&format!("From: {}\n", request.from));
    prompt.push_str(&format!("Subject: {}\n", request.subject));

    let body: String = request.text.chars().take(4000).collect();
    prompt.push_str(&format!("\nBody:\n{body}"));
    if request.text.trim().is_empty()
        && let Some(html) = request.html
    {
        let html: String = html.chars().take(4000).collect();
        prompt.push_str(&format!("\nHTML:\n{html}"));
    }
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractionResponse {
    recipient: Option<RawRecipient>,
    message: Option<Value>,
    image_reference: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecipient {
    name: Option<Value>,
    address_line1: Option<Value>,
    address_line2: Option<Value>,
    city: Option<Value>,
    state: Option<Value>,
    zip_code: Option<Value>,
    country: Option<Value>,
}

/// Non-empty text from a JSON string or number.
fn text(value: &Option<Value>) -> Option<String> {
    let s = match value.as_ref()? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn required(value: &Option<Value>, field: &str) -> Result<String, OrderError> {
    text(value).ok_or_else(|| OrderError::Validation(format!("Missing required field: {field}")))
}

/// Parse and validate a model response.
pub fn parse_extraction(raw: &str, default_country: &str) -> Result<Extraction, OrderError> {
    let json = extract_json_object(raw);
    let response: ExtractionResponse = serde_json::from_str(&json).map_err(|e| {
        OrderError::Parse(format!("Generative extractor returned invalid JSON: {e}"))
    })?;

    let r = response
        .recipient
        .ok_or_else(|| OrderError::Validation("Missing required field: recipient".into()))?;

    let name = required(&r.name, "recipient.name")?;
    let address_line1 = required(&r.address_line1, "recipient.addressLine1")?;
    let city = required(&r.city, "recipient.city")?;
    let region = required(&r.state, "recipient.state")?.to_ascii_uppercase();
    let postal_code = required(&r.zip_code, "recipient.zipCode")?.to_ascii_uppercase();

    let (first_name, last_name) = split_name(&name);
    let country_code = match text(&r.country) {
        Some(c) => normalize_country(&c)
            .map(str::to_string)
            .unwrap_or_else(|| c.to_ascii_uppercase()),
        None => infer_country(&region, default_country),
    };

    let recipient = ParsedRecipient {
        first_name,
        last_name,
        address_line1,
        address_line2: text(&r.address_line2),
        city,
        region,
        postal_code,
        country_code,
    };
    recipient.validate()?;

    Ok(Extraction {
        recipient,
        message: text(&response.message),
        image_reference: text(&response.image_reference),
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
