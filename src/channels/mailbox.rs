//! Mailbox access: the `MailSource` trait and a raw IMAP implementation.
//!
//! The IMAP client speaks just enough of RFC 3501 for polling: LOGIN,
//! SELECT, UID SEARCH, UID FETCH BODY.PEEK[] and LOGOUT. Socket I/O is
//! blocking and runs inside `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use secrecy::ExposeSecret;

use crate::channels::email_types::{InboundMessage, parse_rfc822};
use crate::config::MailboxConfig;
use crate::error::ChannelError;

/// Which messages a search should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailQuery {
    /// Internal date on or after this day.
    Since(NaiveDate),
    /// UID strictly greater than this one.
    AfterUid(u32),
}

/// A mailbox the watcher can poll.
#[async_trait]
pub trait MailSource: Send {
    async fn connect(&mut self) -> Result<(), ChannelError>;

    fn is_connected(&self) -> bool;

    /// Matching UIDs in ascending order.
    async fn search(&mut self, query: MailQuery) -> Result<Vec<u32>, ChannelError>;

    /// Fetch and decode one message without marking it seen.
    async fn fetch(&mut self, uid: u32) -> Result<Option<InboundMessage>, ChannelError>;

    async fn disconnect(&mut self) -> Result<(), ChannelError>;
}

// ── IMAP session (blocking) ─────────────────────────────────────────

trait Stream: Read + Write + Send {}
impl<T: Read + Write + Send> Stream for T {}

/// A completed tagged command.
#[derive(Debug, Default)]
struct Response {
    /// Untagged lines, CRLF stripped.
    lines: Vec<String>,
    /// Literal payloads in the order received.
    literals: Vec<Vec<u8>>,
}

struct Session {
    stream: BufReader<Box<dyn Stream>>,
    next_tag: u32,
}

impl Session {
    fn new(stream: Box<dyn Stream>) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        }
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(ChannelError::Disconnected("server closed the connection".into()));
        }
        Ok(String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read the server greeting.
    fn greeting(&mut self) -> Result<(), ChannelError> {
        let line = self.read_line()?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(ChannelError::Protocol(format!("unexpected greeting: {line}")))
        }
    }

    /// Send a command and collect everything up to its tagged completion.
    fn command(&mut self, cmd: &str) -> Result<Response, ChannelError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let inner = self.stream.get_mut();
        inner.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        inner.flush()?;

        let mut response = Response::default();
        let tagged = format!("{tag} ");
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&tagged) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                return Err(ChannelError::Protocol(format!(
                    "{} failed: {status}",
                    cmd.split_whitespace().next().unwrap_or("command")
                )));
            }
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            response.lines.push(line);
        }
    }
}

/// Length of a `{N}` literal announced at the end of a line.
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `dd-Mon-yyyy` as IMAP's SEARCH SINCE expects.
fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

fn search_command(query: MailQuery) -> String {
    match query {
        MailQuery::Since(date) => format!("UID SEARCH SINCE {}", imap_date(date)),
        MailQuery::AfterUid(uid) => format!("UID SEARCH UID {}:*", uid.saturating_add(1)),
    }
}

/// UIDs from `* SEARCH` lines, sorted. `n:*` always matches the newest
/// message, so results at or below an `AfterUid` bound are dropped.
fn parse_search(lines: &[String], query: MailQuery) -> Vec<u32> {
    let mut uids: Vec<u32> = lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|t| t.parse().ok()))
        .collect();
    if let MailQuery::AfterUid(after) = query {
        uids.retain(|uid| *uid > after);
    }
    uids.sort_unstable();
    uids.dedup();
    uids
}

fn open_session(config: &MailboxConfig) -> Result<Session, ChannelError> {
    let connect_failed = |reason: String| ChannelError::ConnectFailed {
        host: config.host.clone(),
        reason,
    };

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| connect_failed(e.to_string()))?
        .next()
        .ok_or_else(|| connect_failed("no address resolved".into()))?;
    let tcp = TcpStream::connect_timeout(&addr, config.timeout)
        .map_err(|e| connect_failed(e.to_string()))?;
    tcp.set_read_timeout(Some(config.timeout))?;
    tcp.set_write_timeout(Some(config.timeout))?;

    let stream: Box<dyn Stream> = if config.tls {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| connect_failed(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_failed(e.to_string()))?;
        Box::new(rustls::StreamOwned::new(conn, tcp))
    } else {
        Box::new(tcp)
    };

    let mut session = Session::new(stream);
    session.greeting()?;
    login_and_select(&mut session, config)?;
    Ok(session)
}

fn login_and_select(session: &mut Session, config: &MailboxConfig) -> Result<(), ChannelError> {
    session
        .command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))
        .map_err(|e| match e {
            ChannelError::Protocol(_) => ChannelError::AuthFailed {
                user: config.username.clone(),
            },
            other => other,
        })?;
    session.command(&format!("SELECT {}", quote(&config.mailbox)))?;
    Ok(())
}

// ── Async wrapper ───────────────────────────────────────────────────

/// `MailSource` over a blocking IMAP session.
pub struct ImapMailbox {
    config: MailboxConfig,
    session: Option<Session>,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Run `op` against the session on the blocking pool. A session error
    /// drops the session so the next call starts from a fresh connection.
    async fn with_session<T, F>(&mut self, op: F) -> Result<T, ChannelError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T, ChannelError> + Send + 'static,
    {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| ChannelError::Disconnected("not connected".into()))?;
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await
        .map_err(|e| ChannelError::Disconnected(format!("mailbox task failed: {e}")))?;
        if !matches!(&result, Err(e) if e.is_session_error()) {
            self.session = Some(session);
        }
        result
    }
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn connect(&mut self) -> Result<(), ChannelError> {
        let config = self.config.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&config))
            .await
            .map_err(|e| ChannelError::Disconnected(format!("mailbox task failed: {e}")))??;
        tracing::info!(
            host = %self.config.host,
            mailbox = %self.config.mailbox,
            "Mailbox connected"
        );
        self.session = Some(session);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn search(&mut self, query: MailQuery) -> Result<Vec<u32>, ChannelError> {
        self.with_session(move |s| {
            let response = s.command(&search_command(query))?;
            Ok(parse_search(&response.lines, query))
        })
        .await
    }

    async fn fetch(&mut self, uid: u32) -> Result<Option<InboundMessage>, ChannelError> {
        self.with_session(move |s| {
            let response = s.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
            Ok(response
                .literals
                .first()
                .and_then(|raw| parse_rfc822(uid, raw)))
        })
        .await
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        if self.session.is_none() {
            return Ok(());
        }
        let result = self.with_session(|s| s.command("LOGOUT").map(|_| ())).await;
        self.session = None;
        tracing::info!(host = %self.config.host, "Mailbox disconnected");
        result
    }
}
