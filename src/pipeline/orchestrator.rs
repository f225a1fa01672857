//! Per-message orchestration: gating, parsing, ordering, persistence.
//!
//! Flow for each fetched message:
//! 1. Idempotency check against the store
//! 2. Subject, sender and image gating (pure, no I/O)
//! 3. Insert a `processing` record as the atomic guard
//! 4. Parse (patterns, then generative fallback)
//! 5. Render and submit, then `sent` or `failed`
//!
//! Message-level errors never escape `handle_message`; they become a
//! `failed` record. Only store failures are returned.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::channels::email_types::{Attachment, InboundMessage};
use crate::config::PipelineSettings;
use crate::error::{DatabaseError, OrderError};
use crate::orders::client::PostcardSubmitter;
use crate::pipeline::parser::ContentParser;
use crate::pipeline::render::PostcardRenderer;
use crate::pipeline::types::ParsedRecipient;
use crate::store::model::{NewOrderRecord, OrderRecord, OrderStatus};
use crate::store::traits::OrderStore;

/// Whether side effects are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Live,
    /// Gating only: no records, no external calls.
    DryRun,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    AlreadyProcessed,
    SubjectMismatch,
    SenderBlocked,
    MissingImage,
    /// Passed gating in dry-run mode.
    WouldProcess,
    Failed { record_id: String, error: String },
    Sent { record_id: String, provider_order_id: String },
}

impl MessageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadyProcessed => "already_processed",
            Self::SubjectMismatch => "subject_mismatch",
            Self::SenderBlocked => "sender_blocked",
            Self::MissingImage => "missing_image",
            Self::WouldProcess => "would_process",
            Self::Failed { .. } => "failed",
            Self::Sent { .. } => "sent",
        }
    }
}

// ── Gating predicates ───────────────────────────────────────────────

/// Case-insensitive substring match. An empty filter matches everything.
pub fn matches_subject(subject: &str, filter: &str) -> bool {
    let filter = filter.trim();
    filter.is_empty() || subject.to_lowercase().contains(&filter.to_lowercase())
}

/// True if any attachment is on the image MIME allow-list.
pub fn has_image_attachment(attachments: &[Attachment]) -> bool {
    attachments.iter().any(Attachment::is_image)
}

/// Check a sender against the allowlist.
///
/// `*` allows everyone, `@domain` and bare `domain` match the domain,
/// anything with an `@` matches the full address. An empty list denies all.
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    let email = email.trim().to_lowercase();
    allowed.iter().any(|entry| {
        let entry = entry.trim().to_lowercase();
        if entry == "*" {
            true
        } else if let Some(domain) = entry.strip_prefix('@') {
            email.ends_with(&format!("@{domain}"))
        } else if entry.contains('@') {
            entry == email
        } else {
            email.ends_with(&format!("@{entry}"))
        }
    })
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct Orchestrator {
    store: Arc<dyn OrderStore>,
    parser: ContentParser,
    renderer: PostcardRenderer,
    submitter: Arc<dyn PostcardSubmitter>,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        parser: ContentParser,
        renderer: PostcardRenderer,
        submitter: Arc<dyn PostcardSubmitter>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            parser,
            renderer,
            submitter,
            settings,
        }
    }

    /// Run one message through the pipeline.
    pub async fn handle_message(
        &self,
        message: &InboundMessage,
        mode: ProcessMode,
    ) -> Result<MessageOutcome, DatabaseError> {
        let outcome = self.run(message, mode).await?;
        match &outcome {
            MessageOutcome::Sent { provider_order_id, .. } => info!(
                message_id = %message.message_id,
                order_id = %provider_order_id,
                "Postcard sent"
            ),
            MessageOutcome::Failed { error, .. } => error!(
                message_id = %message.message_id,
                error = %error,
                "Postcard request failed"
            ),
            MessageOutcome::WouldProcess => info!(
                message_id = %message.message_id,
                subject = %message.subject,
                "Dry run: message would be processed"
            ),
            other => debug!(
                message_id = %message.message_id,
                outcome = other.label(),
                "Message skipped"
            ),
        }
        Ok(outcome)
    }

    async fn run(
        &self,
        message: &InboundMessage,
        mode: ProcessMode,
    ) -> Result<MessageOutcome, DatabaseError> {
        if self.store.is_processed(&message.message_id).await? {
            return Ok(MessageOutcome::AlreadyProcessed);
        }
        if !matches_subject(&message.subject, &self.settings.subject_filter) {
            return Ok(MessageOutcome::SubjectMismatch);
        }
        if !is_sender_allowed(&self.settings.allowed_senders, &message.from) {
            return Ok(MessageOutcome::SenderBlocked);
        }
        if self.settings.require_image && !has_image_attachment(&message.attachments) {
            return Ok(MessageOutcome::MissingImage);
        }
        if mode == ProcessMode::DryRun {
            return Ok(MessageOutcome::WouldProcess);
        }

        info!(
            message_id = %message.message_id,
            uid = message.uid,
            sender = %message.from,
            "Processing postcard request"
        );

        // Claimed before any external call, the generative extractor included.
        let Some(record) = self.insert(message).await? else {
            return Ok(MessageOutcome::AlreadyProcessed);
        };

        let parsed = match self.parser.parse(message).await {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(record, &e).await,
        };
        if let Some(recipient) = &parsed.recipient {
            self.store.set_recipient(&record.id, recipient).await?;
        }

        let recipient = match (&parsed.recipient, parsed.is_valid) {
            (Some(recipient), true) => recipient,
            _ => {
                let e = OrderError::Validation(parsed.error_summary());
                return self.fail(record, &e).await;
            }
        };

        let submitted = match self.renderer.render(&parsed.message, &parsed.images) {
            Ok(postcard) => self.submitter.submit(recipient, &postcard).await,
            Err(e) => Err(e),
        };

        match submitted {
            Ok(order) => {
                self.store.mark_sent(&record.id, &order.order_id).await?;
                Ok(MessageOutcome::Sent {
                    record_id: record.id,
                    provider_order_id: order.order_id,
                })
            }
            Err(e) => self.fail(record, &e).await,
        }
    }

    /// Insert the `processing` guard record. `None` if another writer won.
    async fn insert(&self, message: &InboundMessage) -> Result<Option<OrderRecord>, DatabaseError> {
        let effective = self.submitter.effective_mode();
        let new = NewOrderRecord {
            message_id: message.message_id.clone(),
            sender_email: message.from.clone(),
            recipient: None,
            mode: effective.mode,
            forced_test_mode: effective.forced_test_mode,
        };
        match self.store.insert(&new).await {
            Ok(record) => Ok(Some(record)),
            Err(DatabaseError::DuplicateKey { message_id }) => {
                warn!(%message_id, "Message claimed by another writer");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(
        &self,
        record: OrderRecord,
        e: &OrderError,
    ) -> Result<MessageOutcome, DatabaseError> {
        let error = e.to_string();
        warn!(record_id = %record.id, kind = e.kind(), "Order attempt failed");
        self.store
            .update_status(&record.id, OrderStatus::Failed, Some(&error))
            .await?;
        Ok(MessageOutcome::Failed {
            record_id: record.id,
            error,
        })
    }
}
