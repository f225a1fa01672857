//! Email message types and RFC 822 decoding.

use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

/// Image MIME types accepted for postcard fronts.
pub const IMAGE_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
];

/// A file attached to an inbound email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    /// Lowercased `type/subtype`.
    pub mime_type: String,
    #[serde(skip)]
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        is_image_mime(&self.mime_type)
    }
}

/// A message fetched from the mailbox. Read-only to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// `Message-ID` header, or a UID-derived fallback.
    pub message_id: String,
    pub uid: u32,
    pub from: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Whether a MIME type is on the image allow-list.
pub fn is_image_mime(mime_type: &str) -> bool {
    let lower = mime_type.trim().to_ascii_lowercase();
    let base = lower.split(';').next().unwrap_or_default().trim();
    IMAGE_MIME_TYPES.contains(&base)
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    let decoded = result
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decode a raw RFC 822 message fetched under `uid`.
///
/// Returns `None` if the bytes don't parse as a message at all.
pub fn parse_rfc822(uid: u32, raw: &[u8]) -> Option<InboundMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());

    let message_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("uid-{uid}"));

    // mail-parser synthesizes text from HTML when no text/plain part exists;
    // only keep a text body the sender actually wrote.
    let has_plain = parsed.text_body.iter().any(|&idx| {
        parsed
            .part(idx)
            .and_then(|p| MimeHeaders::content_type(p))
            .is_none_or(|ct| ct.ctype() == "text" && ct.subtype() == Some("plain"))
    });
    let text = has_plain
        .then(|| parsed.body_text(0).map(|t| t.into_owned()))
        .flatten();
    let html = parsed.body_html(0).map(|h| h.into_owned());

    let mut attachments = Vec::new();
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        let mime_type = MimeHeaders::content_type(part)
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".into())
            .to_ascii_lowercase();
        let filename = MimeHeaders::attachment_name(part)
            .unwrap_or("attachment")
            .to_string();
        attachments.push(Attachment {
            filename,
            mime_type,
            content: part.contents().to_vec(),
        });
    }

    Some(InboundMessage {
        message_id,
        uid,
        from,
        subject: parsed.subject().unwrap_or_default().to_string(),
        text,
        html,
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_mime_allow_list() {
        assert!(is_image_mime("image/jpeg"));
        assert!(is_image_mime("IMAGE/PNG"));
        assert!(is_image_mime("image/webp; name=x.webp"));
        assert!(!is_image_mime("image/tiff"));
        assert!(!is_image_mime("application/pdf"));
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
    }

    #[test]
    fn strip_html_block_boundaries_become_spaces() {
        assert_eq!(
            strip_html("<div>Happy</div><div>Birthday!</div>"),
            "Happy Birthday!"
        );
    }

    #[test]
    fn strip_html_entities() {
        assert_eq!(strip_html("Tom &amp; Jerry&nbsp;&lt;3"), "Tom & Jerry <3");
    }

    #[test]
    fn strip_html_whitespace_normalized() {
        assert_eq!(strip_html("<p>  Hello \n\n  World  </p>"), "Hello World");
    }

    #[test]
    fn parse_plain_message() {
        let raw = b"From: Grandma <grandma@example.com>\r\n\
To: postcards@example.com\r\n\
Subject: Fammail Postcard: Hi\r\n\
Message-ID: <abc@example.com>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Happy Birthday!\r\n";
        let msg = parse_rfc822(7, raw).unwrap();
        assert_eq!(msg.uid, 7);
        assert_eq!(msg.message_id, "abc@example.com");
        assert_eq!(msg.from, "grandma@example.com");
        assert_eq!(msg.subject, "Fammail Postcard: Hi");
        assert!(msg.text.unwrap().contains("Happy Birthday!"));
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn parse_message_with_image_attachment() {
        let raw = b"From: mom@example.com\r\n\
Subject: Fammail Postcard\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
See you soon\r\n\
--XYZ\r\n\
Content-Type: image/png; name=\"beach.png\"\r\n\
Content-Disposition: attachment; filename=\"beach.png\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--XYZ--\r\n";
        let msg = parse_rfc822(3, raw).unwrap();
        assert_eq!(msg.message_id, "uid-3");
        assert_eq!(msg.attachments.len(), 1);
        let att = &msg.attachments[0];
        assert_eq!(att.filename, "beach.png");
        assert_eq!(att.mime_type, "image/png");
        assert!(att.is_image());
        assert_eq!(att.content, b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn parse_html_only_message_has_no_text() {
        let raw = b"From: dad@example.com\r\n\
Subject: Fammail Postcard\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>Wish you were here</p>\r\n";
        let msg = parse_rfc822(1, raw).unwrap();
        assert!(msg.text.is_none());
        assert!(msg.html.unwrap().contains("Wish you were here"));
    }
}
