//! Inbound mail: message types, the IMAP source and the poll loop.

pub mod email_types;
pub mod mailbox;
pub mod watcher;

pub use email_types::{Attachment, InboundMessage};
pub use mailbox::{ImapMailbox, MailQuery, MailSource};
pub use watcher::MailboxWatcher;
