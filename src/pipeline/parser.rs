//! ContentParser: recipient, message and images from an inbound email.
//!
//! Flow:
//! 1. Deterministic strategies, subject before body
//! 2. Generative extractor, only if no strategy matched
//! 3. Message text with address lines and leading headers removed
//! 4. Image attachments, base64-encoded; a referenced image goes first

use std::ops::Range;
use std::sync::{Arc, LazyLock};

use base64::{Engine, engine::general_purpose::STANDARD};
use regex::Regex;
use tracing::debug;

use crate::channels::email_types::{Attachment, InboundMessage, strip_html};
use crate::error::OrderError;
use crate::pipeline::extractor::{ExtractionRequest, RecipientExtractor};
use crate::pipeline::patterns::{AddressStrategy, Target, default_strategies, is_header_line};
use crate::pipeline::types::{EncodedImage, ParsedContent, RecipientSource};

static HTML_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>|</li\s*>|</tr\s*>").expect("valid regex")
});

pub struct ContentParser {
    strategies: Vec<Box<dyn AddressStrategy>>,
    extractor: Option<Arc<dyn RecipientExtractor>>,
    default_country: String,
}

impl ContentParser {
    /// Parser with the built-in strategies and no generative fallback.
    pub fn new(default_country: impl Into<String>) -> Self {
        Self {
            strategies: default_strategies(),
            extractor: None,
            default_country: default_country.into(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn RecipientExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn AddressStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Parse a message.
    ///
    /// Soft failures (no address, empty message) come back as
    /// `is_valid == false` with `errors`. Generative failures are `Err`.
    pub async fn parse(&self, message: &InboundMessage) -> Result<ParsedContent, OrderError> {
        let body = body_text(message.text.as_deref(), message.html.as_deref());
        let mut errors = Vec::new();

        let mut recipient = None;
        let mut source = None;
        let mut consumed: Option<Range<usize>> = None;
        let mut generated_message = None;
        let mut image_reference = None;

        for strategy in &self.strategies {
            let text = match strategy.target() {
                Target::Subject => message.subject.as_str(),
                Target::Body => body.as_str(),
            };
            if let Some(found) = strategy.parse(text, &self.default_country) {
                debug!(
                    message_id = %message.message_id,
                    strategy = strategy.name(),
                    "Address matched deterministically"
                );
                if strategy.target() == Target::Body {
                    consumed = Some(found.lines);
                }
                recipient = Some(found.recipient);
                source = Some(RecipientSource::Pattern(strategy.name()));
                break;
            }
        }

        if recipient.is_none() {
            match &self.extractor {
                Some(extractor) => {
                    debug!(message_id = %message.message_id, "No pattern matched, using generative extractor");
                    let extraction = extractor
                        .extract(ExtractionRequest {
                            subject: &message.subject,
                            from: &message.from,
                            text: &body,
                            html: message.html.as_deref(),
                        })
                        .await?;
                    recipient = Some(extraction.recipient);
                    source = Some(RecipientSource::Generative);
                    generated_message = extraction.message;
                    image_reference = extraction.image_reference;
                }
                None => errors.push("No recipient address found".to_string()),
            }
        }

        let text = match generated_message {
            Some(m) if !m.trim().is_empty() => m.trim().to_string(),
            _ => extract_message(&body, consumed),
        };
        if text.is_empty() {
            errors.push("Message text is empty".to_string());
        }

        let mut images = encode_images(&message.attachments);
        if let Some(reference) = image_reference.as_deref() {
            promote_referenced(&mut images, reference);
        }
        let is_valid = recipient.is_some() && !text.is_empty();

        Ok(ParsedContent {
            recipient,
            source,
            message: text,
            images,
            is_valid,
            errors,
        })
    }
}

/// Plain text if present, otherwise HTML flattened to lines.
pub fn body_text(text: Option<&str>, html: Option<&str>) -> String {
    if let Some(text) = text
        && !text.trim().is_empty()
    {
        return text.replace("\r\n", "\n");
    }
    match html {
        Some(html) => HTML_BREAK
            .replace_all(html, "\n")
            .lines()
            .map(strip_html)
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

/// Body lines minus the address block and any leading header lines.
pub fn extract_message(body: &str, consumed: Option<Range<usize>>) -> String {
    let kept: Vec<&str> = body
        .lines()
        .enumerate()
        .filter(|(idx, _)| !consumed.as_ref().is_some_and(|r| r.contains(idx)))
        .map(|(_, line)| line.trim_end())
        .skip_while(|line| line.trim().is_empty() || is_header_line(line))
        .collect();
    kept.join("\n").trim().to_string()
}

fn encode_images(attachments: &[Attachment]) -> Vec<EncodedImage> {
    attachments
        .iter()
        .filter(|a| a.is_image())
        .map(|a| EncodedImage {
            filename: a.filename.clone(),
            mime_type: a.mime_type.clone(),
            base64: STANDARD.encode(&a.content),
        })
        .collect()
}

/// Move the image the extractor named to the front, where the renderer
/// picks it up. Matches on the filename, ignoring case.
fn promote_referenced(images: &mut [EncodedImage], reference: &str) {
    let wanted = reference.trim().to_lowercase();
    if wanted.is_empty() {
        return;
    }
    let found = images.iter().position(|img| {
        let name = img.filename.to_lowercase();
        name == wanted || name.contains(&wanted)
    });
    if let Some(pos) = found {
        images[..=pos].rotate_right(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::pipeline::extractor::Extraction;
    use crate::pipeline::types::ParsedRecipient;

    fn message(subject: &str, text: Option<&str>, html: Option<&str>) -> InboundMessage {
        InboundMessage {
            message_id: "m-1".into(),
            uid: 1,
            from: "gran@example.com".into(),
            subject: subject.into(),
            text: text.map(str::to_string),
            html: html.map(str::to_string),
            attachments: vec![],
        }
    }

    struct FixedExtractor(Result<Extraction, OrderError>);

    #[async_trait]
    impl RecipientExtractor for FixedExtractor {
        async fn extract(&self, _request: ExtractionRequest<'_>) -> Result<Extraction, OrderError> {
            self.0.clone()
        }
    }

    fn jane() -> ParsedRecipient {
        ParsedRecipient {
            first_name: "Jane".into(),
            last_name: "Roe".into(),
            address_line1: "9 Elm St".into(),
            address_line2: None,
            city: "Boston".into(),
            region: "MA".into(),
            postal_code: "02108".into(),
            country_code: "US".into(),
        }
    }

    #[tokio::test]
    async fn subject_address_with_plain_body() {
        let parser = ContentParser::new("US");
        let msg = message(
            "Send to: John Doe, 123 Main St, New York, NY 10001, US",
            Some("Happy Birthday!"),
            None,
        );
        let parsed = parser.parse(&msg).await.unwrap();
        assert!(parsed.is_valid);
        let r = parsed.recipient.unwrap();
        assert_eq!(r.first_name, "John");
        assert_eq!(r.postal_code, "10001");
        assert_eq!(parsed.message, "Happy Birthday!");
        assert_eq!(parsed.source, Some(RecipientSource::Pattern("subject-line")));
    }

    #[tokio::test]
    async fn body_block_removed_from_message() {
        let parser = ContentParser::new("US");
        let msg = message(
            "Fammail Postcard",
            Some("To:\nJohn Doe\n123 Main St\nNew York, NY 10001\n\nHappy Birthday!\nLove, Gran"),
            None,
        );
        let parsed = parser.parse(&msg).await.unwrap();
        assert!(parsed.is_valid);
        assert_eq!(parsed.message, "Happy Birthday!\nLove, Gran");
        assert_eq!(parsed.source, Some(RecipientSource::Pattern("body-block")));
    }

    #[tokio::test]
    async fn html_only_body_is_flattened() {
        let parser = ContentParser::new("US");
        let msg = message(
            "Fammail Postcard: John Doe, 123 Main St, New York, NY 10001",
            None,
            Some("<div>Wish  you were <b>here</b></div><div>xo</div>"),
        );
        let parsed = parser.parse(&msg).await.unwrap();
        assert!(parsed.is_valid);
        assert_eq!(parsed.message, "Wish you were here\nxo");
    }

    #[tokio::test]
    async fn no_address_without_extractor_is_invalid() {
        let parser = ContentParser::new("US");
        let msg = message("Fammail Postcard", Some("Hello!"), None);
        let parsed = parser.parse(&msg).await.unwrap();
        assert!(!parsed.is_valid);
        assert!(parsed.recipient.is_none());
        assert_eq!(parsed.errors, vec!["No recipient address found".to_string()]);
    }

    #[tokio::test]
    async fn empty_message_is_invalid() {
        let parser = ContentParser::new("US");
        let msg = message(
            "Send to: John Doe, 123 Main St, New York, NY 10001",
            Some("   "),
            None,
        );
        let parsed = parser.parse(&msg).await.unwrap();
        assert!(!parsed.is_valid);
        assert!(parsed.recipient.is_some());
        assert_eq!(parsed.error_summary(), "Message text is empty");
    }

    #[tokio::test]
    async fn extractor_used_only_when_patterns_fail() {
        let parser = ContentParser::new("US").with_extractor(Arc::new(FixedExtractor(Ok(
            Extraction {
                recipient: jane(),
                message: Some("Thinking of you".into()),
                image_reference: None,
            },
        ))));

        let parsed = parser
            .parse(&message("Fammail Postcard", Some("send this to Jane at 9 Elm"), None))
            .await
            .unwrap();
        assert!(parsed.is_valid);
        assert_eq!(parsed.recipient, Some(jane()));
        assert_eq!(parsed.message, "Thinking of you");
        assert_eq!(parsed.source, Some(RecipientSource::Generative));

        let parsed = parser
            .parse(&message(
                "Send to: John Doe, 123 Main St, New York, NY 10001",
                Some("Hi"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(parsed.recipient.unwrap().first_name, "John");
    }

    #[tokio::test]
    async fn extractor_error_propagates() {
        let parser = ContentParser::new("US").with_extractor(Arc::new(FixedExtractor(Err(
            OrderError::Validation("Missing required field: recipient.city".into()),
        ))));
        let err = parser
            .parse(&message("Fammail Postcard", Some("somewhere"), None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("recipient.city"));
    }

    #[tokio::test]
    async fn only_image_attachments_are_encoded() {
        let parser = ContentParser::new("US");
        let mut msg = message(
            "Send to: John Doe, 123 Main St, New York, NY 10001",
            Some("Hi"),
            None,
        );
        msg.attachments = vec![
            Attachment {
                filename: "a.png".into(),
                mime_type: "image/png".into(),
                content: vec![1, 2, 3],
            },
            Attachment {
                filename: "b.pdf".into(),
                mime_type: "application/pdf".into(),
                content: vec![4],
            },
        ];
        let parsed = parser.parse(&msg).await.unwrap();
        assert_eq!(parsed.images.len(), 1);
        assert_eq!(parsed.images[0].base64, "AQID");
    }

    #[tokio::test]
    async fn referenced_image_becomes_front() {
        let parser = ContentParser::new("US").with_extractor(Arc::new(FixedExtractor(Ok(
            Extraction {
                recipient: jane(),
                message: Some("Look at the beach".into()),
                image_reference: Some("Beach.JPG".into()),
            },
        ))));
        let mut msg = message("Fammail Postcard", Some("use the beach photo"), None);
        msg.attachments = vec![
            Attachment {
                filename: "dog.png".into(),
                mime_type: "image/png".into(),
                content: vec![1],
            },
            Attachment {
                filename: "beach.jpg".into(),
                mime_type: "image/jpeg".into(),
                content: vec![2],
            },
        ];

        let parsed = parser.parse(&msg).await.unwrap();
        let names: Vec<_> = parsed.images.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, vec!["beach.jpg", "dog.png"]);
    }

    #[test]
    fn unknown_image_reference_keeps_order() {
        let image = |name: &str| EncodedImage {
            filename: name.into(),
            mime_type: "image/png".into(),
            base64: String::new(),
        };
        let mut images = vec![image("a.png"), image("b.png")];
        promote_referenced(&mut images, "c.png");
        assert_eq!(images[0].filename, "a.png");
        promote_referenced(&mut images, "  ");
        assert_eq!(images[0].filename, "a.png");
    }

    #[test]
    fn leading_headers_stripped() {
        assert_eq!(
            extract_message("\nRecipient: someone\nHello\nTo: keep me", None),
            "Hello\nTo: keep me"
        );
    }
}
