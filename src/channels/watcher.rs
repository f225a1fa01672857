//! MailboxWatcher: backlog scan on start, then a cancellable poll loop.
//!
//! One task owns the mailbox. Scans run inside that task, one message at a
//! time, so ticks never overlap. `stop()` cancels, lets the in-flight
//! message finish, and logs out.

use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::mailbox::{MailQuery, MailSource};
use crate::config::{CatchUpMode, WatchConfig};
use crate::error::{ChannelError, Error};
use crate::pipeline::orchestrator::{MessageOutcome, Orchestrator, ProcessMode};

pub struct MailboxWatcher {
    source: Option<Box<dyn MailSource>>,
    orchestrator: Arc<Orchestrator>,
    config: WatchConfig,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MailboxWatcher {
    pub fn new(
        source: Box<dyn MailSource>,
        orchestrator: Arc<Orchestrator>,
        config: WatchConfig,
    ) -> Self {
        Self {
            source: Some(source),
            orchestrator,
            config,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Connect, scan the backlog, then start polling.
    ///
    /// Only the initial connection is fatal. A failed backlog scan stays
    /// pending and is retried on each tick before any new mail is handled.
    pub async fn start(&mut self) -> Result<(), ChannelError> {
        let Some(mut source) = self.source.take() else {
            warn!("Mailbox watcher already started");
            return Ok(());
        };

        if let Err(e) = source.connect().await {
            self.source = Some(source);
            return Err(e);
        }

        let mut poller = Poller {
            source,
            orchestrator: Arc::clone(&self.orchestrator),
            cancel: self.cancel.clone(),
            initial_sync_days: self.config.initial_sync_days,
            high_water: None,
            pending_catch_up: Some(self.config.catch_up),
        };

        if let Err(e) = poller.catch_up().await {
            error!(error = %e, "Backlog scan failed; retrying next tick");
            poller.drop_connection().await;
        }

        let period = self.config.poll_interval;
        info!(
            interval_secs = period.as_secs(),
            catch_up = ?self.config.catch_up,
            "Mailbox watcher started"
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = poller.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = poller.poll().await {
                            warn!(error = %e, "Mailbox poll failed; reconnecting next tick");
                            poller.drop_connection().await;
                        }
                    }
                }
            }

            if let Err(e) = poller.source.disconnect().await {
                debug!(error = %e, "Mailbox logout failed");
            }
            info!("Mailbox watcher stopped");
        }));
        Ok(())
    }

    /// Stop polling. Waits for the message in flight, then logs out.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!(error = %e, "Mailbox watcher task ended abnormally");
        }
    }
}

/// State owned by the poll task.
struct Poller {
    source: Box<dyn MailSource>,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
    initial_sync_days: u32,
    /// Highest UID already handed to the orchestrator.
    high_water: Option<u32>,
    /// Backlog scan still owed. New mail is not polled until it completes.
    pending_catch_up: Option<CatchUpMode>,
}

impl Poller {
    fn since(&self) -> NaiveDate {
        let today = Utc::now().date_naive();
        today
            .checked_sub_days(Days::new(u64::from(self.initial_sync_days)))
            .unwrap_or(today)
    }

    /// Run the owed backlog scan, if any. On error it stays owed, so the
    /// window is never handed to the live path in its place.
    async fn catch_up(&mut self) -> Result<(), Error> {
        let Some(mode) = self.pending_catch_up else {
            return Ok(());
        };
        let uids = self.source.search(MailQuery::Since(self.since())).await?;
        info!(count = uids.len(), mode = ?mode, "Backlog scan");
        match mode {
            CatchUpMode::None => {
                self.high_water = uids.iter().max().copied().or(self.high_water);
            }
            CatchUpMode::Process => self.scan(&uids, ProcessMode::Live).await?,
            CatchUpMode::DryRun => self.scan(&uids, ProcessMode::DryRun).await?,
        }
        self.pending_catch_up = None;
        Ok(())
    }

    async fn poll(&mut self) -> Result<(), Error> {
        if !self.source.is_connected() {
            self.source.connect().await?;
        }
        if self.pending_catch_up.is_some() {
            return self.catch_up().await;
        }
        // No mark after a completed backlog scan means the window was empty
        // then, so anything it holds now is new.
        let query = match self.high_water {
            Some(uid) => MailQuery::AfterUid(uid),
            None => MailQuery::Since(self.since()),
        };
        let uids = self.source.search(query).await?;
        if !uids.is_empty() {
            debug!(count = uids.len(), "New messages");
        }
        self.scan(&uids, ProcessMode::Live).await
    }

    /// Hand each message to the orchestrator in UID order. Cancellation is
    /// checked between messages.
    async fn scan(&mut self, uids: &[u32], mode: ProcessMode) -> Result<(), Error> {
        for &uid in uids {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.source.fetch(uid).await {
                Ok(Some(message)) => {
                    let outcome = self.orchestrator.handle_message(&message, mode).await?;
                    if matches!(outcome, MessageOutcome::Sent { .. } | MessageOutcome::Failed { .. }) {
                        debug!(uid, outcome = outcome.label(), "Message handled");
                    }
                }
                Ok(None) => warn!(uid, "Message could not be decoded; skipping"),
                Err(e) if !e.is_session_error() => {
                    warn!(uid, error = %e, "Message could not be fetched; skipping");
                }
                Err(e) => return Err(e.into()),
            }
            self.high_water = Some(self.high_water.map_or(uid, |hw| hw.max(uid)));
        }
        Ok(())
    }

    async fn drop_connection(&mut self) {
        if let Err(e) = self.source.disconnect().await {
            debug!(error = %e, "Mailbox disconnect after error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::channels::email_types::InboundMessage;
    use crate::config::PipelineSettings;
    use crate::error::OrderError;
    use crate::orders::client::PostcardSubmitter;
    use crate::orders::types::{EffectiveMode, OrderResponse, OrderResult};
    use crate::pipeline::parser::ContentParser;
    use crate::pipeline::render::{PostcardRenderer, RenderedPostcard};
    use crate::pipeline::types::ParsedRecipient;
    use crate::store::model::OrderMode;
    use crate::store::{LibSqlBackend, OrderStore};

    #[derive(Default)]
    struct MailboxState {
        messages: BTreeMap<u32, InboundMessage>,
        connected: bool,
        connects: usize,
        disconnects: usize,
        fail_connect: bool,
        fail_next_search: bool,
        refuse_fetch: Option<u32>,
    }

    #[derive(Clone, Default)]
    struct MockMailbox(Arc<Mutex<MailboxState>>);

    impl MockMailbox {
        fn add(&self, uid: u32) {
            self.0.lock().unwrap().messages.insert(uid, postcard_message(uid));
        }

        fn state(&self) -> std::sync::MutexGuard<'_, MailboxState> {
            self.0.lock().unwrap()
        }
    }

    #[async_trait]
    impl MailSource for MockMailbox {
        async fn connect(&mut self) -> Result<(), ChannelError> {
            let mut s = self.state();
            if s.fail_connect {
                return Err(ChannelError::ConnectFailed {
                    host: "mock".into(),
                    reason: "refused".into(),
                });
            }
            s.connected = true;
            s.connects += 1;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.state().connected
        }

        async fn search(&mut self, query: MailQuery) -> Result<Vec<u32>, ChannelError> {
            let mut s = self.state();
            if !s.connected {
                return Err(ChannelError::Disconnected("not connected".into()));
            }
            if s.fail_next_search {
                s.fail_next_search = false;
                return Err(ChannelError::Protocol("search failed".into()));
            }
            Ok(match query {
                MailQuery::Since(_) => s.messages.keys().copied().collect(),
                MailQuery::AfterUid(after) => {
                    s.messages.keys().copied().filter(|u| *u > after).collect()
                }
            })
        }

        async fn fetch(&mut self, uid: u32) -> Result<Option<InboundMessage>, ChannelError> {
            let s = self.state();
            if s.refuse_fetch == Some(uid) {
                return Err(ChannelError::Protocol(
                    "UID failed: NO [UNAVAILABLE] message unavailable".into(),
                ));
            }
            Ok(s.messages.get(&uid).cloned())
        }

        async fn disconnect(&mut self) -> Result<(), ChannelError> {
            let mut s = self.state();
            if s.connected {
                s.connected = false;
                s.disconnects += 1;
            }
            Ok(())
        }
    }

    struct CountingSubmitter(AtomicUsize);

    #[async_trait]
    impl PostcardSubmitter for CountingSubmitter {
        fn effective_mode(&self) -> EffectiveMode {
            EffectiveMode::resolve(OrderMode::Test, false)
        }

        async fn submit(
            &self,
            _recipient: &ParsedRecipient,
            _postcard: &RenderedPostcard,
        ) -> Result<OrderResult, OrderError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            let id = format!("postcard_{n}");
            Ok(OrderResult {
                order_id: id.clone(),
                status: Some("ready".into()),
                effective: self.effective_mode(),
                response: serde_json::from_value::<OrderResponse>(serde_json::json!({ "id": id }))
                    .unwrap(),
            })
        }
    }

    fn postcard_message(uid: u32) -> InboundMessage {
        InboundMessage {
            message_id: format!("<msg-{uid}@example.com>"),
            uid,
            from: "gran@example.com".into(),
            subject: "Fammail Postcard: John Doe, 123 Main St, New York, NY 10001".into(),
            text: Some(format!("Hello #{uid}")),
            html: None,
            attachments: vec![],
        }
    }

    struct Harness {
        mailbox: MockMailbox,
        store: Arc<LibSqlBackend>,
        submitter: Arc<CountingSubmitter>,
        watcher: MailboxWatcher,
    }

    async fn harness(catch_up: CatchUpMode, backlog: &[u32]) -> Harness {
        let mailbox = MockMailbox::default();
        for &uid in backlog {
            mailbox.add(uid);
        }
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let submitter = Arc::new(CountingSubmitter(AtomicUsize::new(0)));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            ContentParser::new("US"),
            PostcardRenderer::new(),
            submitter.clone(),
            PipelineSettings::default(),
        ));
        let watcher = MailboxWatcher::new(
            Box::new(mailbox.clone()),
            orchestrator,
            WatchConfig {
                poll_interval: Duration::from_millis(20),
                initial_sync_days: 7,
                catch_up,
            },
        );
        Harness {
            mailbox,
            store,
            submitter,
            watcher,
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn catch_up_none_skips_backlog_and_processes_new_mail() {
        let mut h = harness(CatchUpMode::None, &[1, 2]).await;
        h.watcher.start().await.unwrap();
        assert!(h.watcher.is_running());

        h.mailbox.add(3);
        let submitter = h.submitter.clone();
        eventually(|| submitter.0.load(Ordering::SeqCst) == 1).await;

        h.watcher.stop().await;
        assert!(!h.store.is_processed("<msg-1@example.com>").await.unwrap());
        assert!(h.store.is_processed("<msg-3@example.com>").await.unwrap());
    }

    #[tokio::test]
    async fn catch_up_process_handles_backlog_once() {
        let mut h = harness(CatchUpMode::Process, &[1, 2]).await;
        h.watcher.start().await.unwrap();
        assert_eq!(h.submitter.0.load(Ordering::SeqCst), 2);

        // Several ticks pass; nothing is submitted twice.
        tokio::time::sleep(Duration::from_millis(80)).await;
        h.watcher.stop().await;
        assert_eq!(h.submitter.0.load(Ordering::SeqCst), 2);
        assert_eq!(h.store.list_recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn catch_up_dry_run_creates_nothing() {
        let mut h = harness(CatchUpMode::DryRun, &[1, 2]).await;
        h.watcher.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.watcher.stop().await;
        assert_eq!(h.submitter.0.load(Ordering::SeqCst), 0);
        assert!(h.store.list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_failure_is_fatal() {
        let mut h = harness(CatchUpMode::None, &[]).await;
        h.mailbox.state().fail_connect = true;
        assert!(h.watcher.start().await.is_err());
        assert!(!h.watcher.is_running());
    }

    #[tokio::test]
    async fn poll_error_reconnects_on_next_tick() {
        let mut h = harness(CatchUpMode::None, &[]).await;
        h.watcher.start().await.unwrap();
        h.mailbox.state().fail_next_search = true;
        h.mailbox.add(5);

        let submitter = h.submitter.clone();
        eventually(|| submitter.0.load(Ordering::SeqCst) == 1).await;
        h.watcher.stop().await;
        assert!(h.mailbox.state().connects >= 2);
    }

    #[tokio::test]
    async fn failed_backlog_search_never_orders_backlog() {
        for mode in [CatchUpMode::None, CatchUpMode::DryRun] {
            let mut h = harness(mode, &[1, 2]).await;
            h.mailbox.state().fail_next_search = true;
            h.watcher.start().await.unwrap();

            // The retried backlog scan runs on the first ticks.
            tokio::time::sleep(Duration::from_millis(120)).await;
            assert_eq!(h.submitter.0.load(Ordering::SeqCst), 0, "{mode:?}");
            assert!(h.store.list_recent(10).await.unwrap().is_empty(), "{mode:?}");

            h.mailbox.add(3);
            let submitter = h.submitter.clone();
            eventually(|| submitter.0.load(Ordering::SeqCst) == 1).await;
            h.watcher.stop().await;

            assert!(!h.store.is_processed("<msg-1@example.com>").await.unwrap());
            assert!(!h.store.is_processed("<msg-2@example.com>").await.unwrap());
            assert!(h.store.is_processed("<msg-3@example.com>").await.unwrap());
        }
    }

    #[tokio::test]
    async fn failed_backlog_search_is_retried_in_process_mode() {
        let mut h = harness(CatchUpMode::Process, &[1, 2]).await;
        h.mailbox.state().fail_next_search = true;
        h.watcher.start().await.unwrap();
        assert_eq!(h.submitter.0.load(Ordering::SeqCst), 0);

        let submitter = h.submitter.clone();
        eventually(|| submitter.0.load(Ordering::SeqCst) == 2).await;
        h.watcher.stop().await;
        assert_eq!(h.store.list_recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn refused_fetch_skips_only_that_message() {
        let mut h = harness(CatchUpMode::None, &[]).await;
        h.watcher.start().await.unwrap();
        h.mailbox.state().refuse_fetch = Some(3);
        h.mailbox.add(3);
        h.mailbox.add(4);

        let submitter = h.submitter.clone();
        eventually(|| submitter.0.load(Ordering::SeqCst) == 1).await;

        // Later ticks don't keep hitting the refused UID.
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.watcher.stop().await;

        assert!(!h.store.is_processed("<msg-3@example.com>").await.unwrap());
        assert!(h.store.is_processed("<msg-4@example.com>").await.unwrap());
        assert_eq!(h.submitter.0.load(Ordering::SeqCst), 1);
        assert_eq!(h.mailbox.state().connects, 1);
    }

    #[tokio::test]
    async fn stop_logs_out_and_is_idempotent() {
        let mut h = harness(CatchUpMode::None, &[]).await;
        h.watcher.start().await.unwrap();
        h.watcher.stop().await;
        h.watcher.stop().await;
        let state = h.mailbox.state();
        assert!(!state.connected);
        assert_eq!(state.disconnects, 1);
        drop(state);
        assert!(!h.watcher.is_running());
    }
}
