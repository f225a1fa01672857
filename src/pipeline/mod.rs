//! Postcard pipeline.
//!
//! Every fetched message flows through:
//! 1. `Orchestrator` gating: already processed, subject, sender, image
//! 2. `ContentParser`: deterministic address strategies, then the
//!    generative extractor as a fallback
//! 3. `PostcardRenderer`: front and back HTML
//! 4. `PostcardSubmitter`: one order per message, recorded in the store

pub mod extractor;
pub mod orchestrator;
pub mod parser;
pub mod patterns;
pub mod render;
pub mod types;

pub use orchestrator::{MessageOutcome, Orchestrator, ProcessMode};
pub use parser::ContentParser;
pub use render::{PostcardRenderer, RenderedPostcard};
pub use types::{EncodedImage, ParsedContent, ParsedRecipient, RecipientSource};
