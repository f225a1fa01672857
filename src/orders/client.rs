//! OrderSubmitter: creates postcards through the print-mail HTTP API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::{Error, OrderError};
use crate::orders::types::{EffectiveMode, OrderResponse, OrderResult};
use crate::pipeline::render::RenderedPostcard;
use crate::pipeline::types::ParsedRecipient;
use crate::retry::{RetryPolicy, retry};
use crate::store::model::OrderMode;

const FALLBACK_PROVIDER_MESSAGE: &str = "Print-mail provider request failed";

/// Anything that can place a postcard order.
#[async_trait]
pub trait PostcardSubmitter: Send + Sync {
    /// Mode every order from this submitter is placed in.
    fn effective_mode(&self) -> EffectiveMode;

    async fn submit(
        &self,
        recipient: &ParsedRecipient,
        postcard: &RenderedPostcard,
    ) -> Result<OrderResult, OrderError>;
}

/// HTTP client for the print-mail provider.
pub struct OrderSubmitter {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    configured: OrderMode,
    effective: EffectiveMode,
    size: String,
    retry: RetryPolicy,
}

impl OrderSubmitter {
    pub fn new(config: &ProviderConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OrderError::Network(format!("Failed to build HTTP client: {e}")))?;

        let effective = EffectiveMode::resolve(config.mode, config.force_test_mode);
        if effective.overrides(config.mode) {
            warn!("Force test mode is on: live mode configured but orders will be placed in test mode");
        }
        let api_key = match effective.mode {
            OrderMode::Test => config.test_api_key.clone(),
            OrderMode::Live => config.live_api_key.clone(),
        };
        info!(
            mode = %effective.mode,
            forced_test_mode = effective.forced_test_mode,
            "Print-mail submitter ready"
        );

        Ok(Self {
            client,
            endpoint: format!("{}/postcards", config.base_url.trim_end_matches('/')),
            api_key,
            configured: config.mode,
            effective,
            size: config.postcard_size.clone(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Form fields for a postcard order.
    fn form_fields(
        &self,
        recipient: &ParsedRecipient,
        postcard: &RenderedPostcard,
    ) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("to[firstName]", recipient.first_name.clone()),
            ("to[lastName]", recipient.last_name.clone()),
            ("to[addressLine1]", recipient.address_line1.clone()),
        ];
        if let Some(line2) = &recipient.address_line2 {
            fields.push(("to[addressLine2]", line2.clone()));
        }
        fields.extend([
            ("to[city]", recipient.city.clone()),
            ("to[provinceOrState]", recipient.region.clone()),
            ("to[postalOrZip]", recipient.postal_code.clone()),
            ("to[countryCode]", recipient.country_code.clone()),
        ]);
        if let Some(front) = &postcard.front_html {
            fields.push(("frontHTML", front.clone()));
        }
        fields.push(("backHTML", postcard.back_html.clone()));
        fields.push(("size", self.size.clone()));
        fields
    }
}

#[async_trait]
impl PostcardSubmitter for OrderSubmitter {
    fn effective_mode(&self) -> EffectiveMode {
        self.effective
    }

    async fn submit(
        &self,
        recipient: &ParsedRecipient,
        postcard: &RenderedPostcard,
    ) -> Result<OrderResult, OrderError> {
        recipient.validate()?;
        if postcard.back_html.trim().is_empty() {
            return Err(OrderError::Validation("Missing required field: backHTML".into()));
        }
        if self.api_key.expose_secret().is_empty() {
            return Err(OrderError::Validation(format!(
                "No API key configured for {} mode",
                self.effective.mode
            )));
        }
        if self.effective.overrides(self.configured) {
            warn!(
                configured = %self.configured,
                "Force test mode overriding configured mode for this order"
            );
        }

        let fields = self.form_fields(recipient, postcard);
        debug!(endpoint = %self.endpoint, mode = %self.effective.mode, "Submitting postcard order");

        // Only connection failures are retried: no request reached the provider.
        let response = retry(
            self.retry,
            "provider_submit",
            |e: &reqwest::Error| e.is_connect(),
            || {
                self.client
                    .post(&self.endpoint)
                    .header("x-api-key", self.api_key.expose_secret())
                    .form(&fields)
                    .send()
            },
        )
        .await
        .map_err(network_error)?;

        let status = response.status();
        let body = response.text().await.map_err(network_error)?;

        if !status.is_success() {
            return Err(provider_error(status.as_u16(), &body));
        }

        let parsed: OrderResponse = serde_json::from_str(&body).map_err(|e| {
            OrderError::Provider {
                status: status.as_u16(),
                message: format!("Unreadable order response: {e}"),
                body: Some(body.clone()),
            }
        })?;

        info!(
            order_id = %parsed.id,
            status = parsed.status.as_deref().unwrap_or("unknown"),
            live = parsed.live,
            "Postcard order created"
        );

        Ok(OrderResult {
            order_id: parsed.id.clone(),
            status: parsed.status.clone(),
            effective: self.effective,
            response: parsed,
        })
    }
}

fn network_error(e: reqwest::Error) -> OrderError {
    if e.is_timeout() {
        OrderError::Network(format!("Print-mail provider timed out: {e}"))
    } else {
        OrderError::Network(format!("Print-mail provider unreachable: {e}"))
    }
}

/// Build a `Provider` error from a non-2xx body.
///
/// Uses `message` or `error.message` from a JSON body when present.
pub fn provider_error(status: u16, body: &str) -> OrderError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error").and_then(|e| e.get("message")))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_PROVIDER_MESSAGE.to_string());
    OrderError::Provider {
        status,
        message,
        body: (!body.is_empty()).then(|| body.to_string()),
    }
}
