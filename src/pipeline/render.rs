//! Postcard HTML rendering.

use minijinja::{Environment, context};

use crate::error::OrderError;
use crate::pipeline::types::EncodedImage;

const FRONT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
  html, body { margin: 0; padding: 0; width: 100%; height: 100%; }
  img { width: 100%; height: 100%; object-fit: cover; }
</style>
</head>
<body><img src="{{ image_src|safe }}" alt="{{ alt }}"></body>
</html>
"#;

const BACK_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
  body { margin: 0.4in; font-family: Georgia, serif; font-size: 14pt; }
  .message { width: 50%; }
</style>
</head>
<body><div class="message">{% for line in lines %}{{ line }}{% if not loop.last %}<br>{% endif %}{% endfor %}</div></body>
</html>
"#;

/// Rendered sides of a postcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPostcard {
    /// Absent when the email carried no image.
    pub front_html: Option<String>,
    pub back_html: String,
}

/// Renders postcard sides with HTML auto-escaping.
pub struct PostcardRenderer {
    env: Environment<'static>,
}

impl Default for PostcardRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PostcardRenderer {
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
        }
    }

    /// Back carries the message; front is the first image, if any.
    pub fn render(
        &self,
        message: &str,
        images: &[EncodedImage],
    ) -> Result<RenderedPostcard, OrderError> {
        let lines: Vec<&str> = message.lines().collect();
        let back_html = self
            .env
            .render_named_str("back.html", BACK_TEMPLATE, context! { lines })
            .map_err(render_error)?;

        let front_html = match images.first() {
            Some(image) => Some(
                self.env
                    .render_named_str(
                        "front.html",
                        FRONT_TEMPLATE,
                        context! { image_src => image.data_uri(), alt => image.filename.as_str() },
                    )
                    .map_err(render_error)?,
            ),
            None => None,
        };

        Ok(RenderedPostcard {
            front_html,
            back_html,
        })
    }
}

fn render_error(e: minijinja::Error) -> OrderError {
    OrderError::Validation(format!("Failed to render postcard: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_contains_message_with_line_breaks() {
        let out = PostcardRenderer::new()
            .render("Happy Birthday!\nLove, Gran", &[])
            .unwrap();
        assert!(out.back_html.contains("Happy Birthday!<br>Love, Gran"));
        assert!(out.front_html.is_none());
    }

    #[test]
    fn message_is_escaped() {
        let out = PostcardRenderer::new()
            .render("<script>alert(1)</script> & more", &[])
            .unwrap();
        assert!(!out.back_html.contains("<script>"));
        assert!(out.back_html.contains("&lt;script&gt;"));
        assert!(out.back_html.contains("&amp; more"));
    }

    #[test]
    fn front_uses_first_image() {
        let images = vec![
            EncodedImage {
                filename: "beach.png".into(),
                mime_type: "image/png".into(),
                base64: "iVBORw0KGgo=".into(),
            },
            EncodedImage {
                filename: "second.jpg".into(),
                mime_type: "image/jpeg".into(),
                base64: "AAAA".into(),
            },
        ];
        let out = PostcardRenderer::new().render("Hi", &images).unwrap();
        let front = out.front_html.unwrap();
        assert!(front.contains(r#"src="data:image/png;base64,iVBORw0KGgo=""#));
        assert!(!front.contains("second.jpg"));
    }
}
