//! Shared types for the postcard pipeline.

use serde::{Deserialize, Serialize};

use crate::error::OrderError;
use crate::pipeline::patterns::is_valid_region;

// ── Recipient ───────────────────────────────────────────────────────

/// A structurally complete postal address pulled out of an email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRecipient {
    pub first_name: String,
    pub last_name: String,
    pub address_line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_line2: Option<String>,
    pub city: String,
    /// Two-letter US state or Canadian province code.
    pub region: String,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2.
    pub country_code: String,
}

impl ParsedRecipient {
    /// Check every required field and the region allow-list.
    ///
    /// Errors name the first offending field, e.g.
    /// `Missing required field: recipient.city`.
    pub fn validate(&self) -> Result<(), OrderError> {
        let required = [
            ("recipient.firstName", &self.first_name),
            ("recipient.lastName", &self.last_name),
            ("recipient.addressLine1", &self.address_line1),
            ("recipient.city", &self.city),
            ("recipient.region", &self.region),
            ("recipient.postalCode", &self.postal_code),
            ("recipient.countryCode", &self.country_code),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(OrderError::Validation(format!(
                    "Missing required field: {name}"
                )));
            }
        }
        if !is_valid_region(&self.region) {
            return Err(OrderError::Validation(format!(
                "Invalid state/province code: {}",
                self.region
            )));
        }
        Ok(())
    }

    /// Full display name.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Split a display name into (first, last). The last name is everything
/// after the first whitespace-separated token.
pub fn split_name(name: &str) -> (String, String) {
    let name = name.trim();
    match name.split_once(char::is_whitespace) {
        Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
        None => (name.to_string(), String::new()),
    }
}

// ── Parse result ────────────────────────────────────────────────────

/// An image attachment ready for templating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub filename: String,
    pub mime_type: String,
    /// Standard base64 of the raw bytes.
    pub base64: String,
}

impl EncodedImage {
    /// `data:` URI for inline embedding.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// Where the accepted recipient came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientSource {
    /// A deterministic strategy, by name.
    Pattern(&'static str),
    /// The generative extractor.
    Generative,
}

/// Output of `ContentParser::parse`.
#[derive(Debug, Clone)]
pub struct ParsedContent {
    pub recipient: Option<ParsedRecipient>,
    pub source: Option<RecipientSource>,
    pub message: String,
    pub images: Vec<EncodedImage>,
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ParsedContent {
    /// All accumulated errors as one line, for persistence.
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            "Unable to parse postcard request".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn john() -> ParsedRecipient {
        ParsedRecipient {
            first_name: "John".into(),
            last_name: "Doe".into(),
            address_line1: "123 Main St".into(),
            address_line2: None,
            city: "New York".into(),
            region: "NY".into(),
            postal_code: "10001".into(),
            country_code: "US".into(),
        }
    }

    #[test]
    fn complete_recipient_validates() {
        assert!(john().validate().is_ok());
    }

    #[test]
    fn each_missing_field_is_named() {
        let cases: [(&str, fn(&mut ParsedRecipient)); 7] = [
            ("recipient.firstName", |r| r.first_name.clear()),
            ("recipient.lastName", |r| r.last_name.clear()),
            ("recipient.addressLine1", |r| r.address_line1.clear()),
            ("recipient.city", |r| r.city = "  ".into()),
            ("recipient.region", |r| r.region.clear()),
            ("recipient.postalCode", |r| r.postal_code.clear()),
            ("recipient.countryCode", |r| r.country_code.clear()),
        ];
        for (field, blank) in cases {
            let mut r = john();
            blank(&mut r);
            let err = r.validate().unwrap_err();
            assert_eq!(
                err,
                OrderError::Validation(format!("Missing required field: {field}"))
            );
        }
    }

    #[test]
    fn unknown_region_rejected() {
        let mut r = john();
        r.region = "ZZ".into();
        assert!(matches!(r.validate(), Err(OrderError::Validation(m)) if m.contains("ZZ")));
    }

    #[test]
    fn snapshot_uses_camel_case() {
        let json = serde_json::to_value(john()).unwrap();
        assert_eq!(json["firstName"], "John");
        assert_eq!(json["postalCode"], "10001");
        assert!(json.get("addressLine2").is_none());
    }

    #[test]
    fn split_name_variants() {
        assert_eq!(split_name("John Doe"), ("John".into(), "Doe".into()));
        assert_eq!(
            split_name("  Mary Ann Smith "),
            ("Mary".into(), "Ann Smith".into())
        );
        assert_eq!(split_name("Cher"), ("Cher".into(), String::new()));
    }

    #[test]
    fn data_uri_format() {
        let img = EncodedImage {
            filename: "a.png".into(),
            mime_type: "image/png".into(),
            base64: "AAAA".into(),
        };
        assert_eq!(img.data_uri(), "data:image/png;base64,AAAA");
    }
}
