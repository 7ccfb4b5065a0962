//! Timers that drive fetching and delivery for every subscriber.
//!
//! Each subscriber gets two background tasks:
//!
//! - **ASAP**: starts after a random phase in `[0, asap_interval)` so chats
//!   don't all poll at once, then fires every `asap_interval`
//! - **Digest**: fires once a day at the subscriber's `digest_time` (UTC)
//!
//! A run loads the subscriber from the database, fetches one collection,
//! delivers the formatted messages, reports failures to operators and saves
//! the new feed state. Runs for the same chat are serialized.

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::feed::Transport;
use crate::notify::{
    asap_messages, digest_messages, format_feeds, Messenger, OperatorReport,
};
use crate::storage::{Database, DatabaseError};
use crate::subscriber::{ChatId, Mode};

/// How often the running scheduler looks for started or deleted chats.
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Longest a digest task sleeps before re-reading the subscriber's time.
const DIGEST_RECHECK: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// Dispatcher
// ============================================================================

/// Performs single update runs. Shared by all timer tasks and by the CLI's
/// one-shot `poll` command.
pub struct Dispatcher {
    db: Database,
    transport: Arc<dyn Transport>,
    messenger: Arc<dyn Messenger>,
    config: Arc<Config>,
    locks: Mutex<HashMap<ChatId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        transport: Arc<dyn Transport>,
        messenger: Arc<dyn Messenger>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            transport,
            messenger,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock_for(&self, chat_id: ChatId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(chat_id).or_default().clone()
    }

    /// Fetches one of a chat's collections and delivers what is new.
    ///
    /// # Arguments
    ///
    /// * `chat_id` - The chat to update
    /// * `mode` - Which of its two feed lists to fetch
    ///
    /// # Returns
    ///
    /// The number of messages sent to the chat, or `None` if the chat does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the subscriber cannot be loaded or its new
    /// fetch state cannot be saved.
    ///
    /// # Behavior
    ///
    /// - Runs for the same chat are serialized
    /// - Messages are sent before the new state is saved, so a crash can
    ///   repeat a delivery but never lose one
    /// - Fetch failures are reported to every operator chat
    /// - Delivery failures are logged and do not fail the run
    /// - Only fetch state is written back; membership, template and digest
    ///   time edits saved during the run are kept
    pub async fn run_update(&self, chat_id: ChatId, mode: Mode) -> Result<Option<usize>, DatabaseError> {
        let lock = self.lock_for(chat_id);
        let _guard = lock.lock().await;

        let Some(mut subscriber) = self.db.load_subscriber(chat_id).await? else {
            tracing::debug!(chat_id = chat_id, "Subscriber no longer exists, skipping run");
            return Ok(None);
        };
        subscriber.set_workers(self.config.max_workers);

        let backoff = self.config.backoff();
        let results = subscriber
            .collection_mut(mode)
            .fetch_all(self.transport.as_ref(), &backoff)
            .await;

        let collection = subscriber.collection(mode);
        let formatted = format_feeds(
            results,
            collection,
            subscriber.templates(),
            self.config.templates.entry_template(mode),
        );
        let messages = match mode {
            Mode::Asap => asap_messages(&formatted),
            Mode::Digest => digest_messages(&formatted, collection, &self.config.templates.digest_header),
        };

        for text in &messages {
            if let Err(e) = self.messenger.send(chat_id, text).await {
                tracing::warn!(chat_id = chat_id, error = %e, "Message delivery failed");
            }
        }
        self.report(&formatted.reports).await;

        // A command may have edited the chat while we were fetching
        let saved = self
            .db
            .update_subscriber(chat_id, |current| {
                current.merge_fetch_state(mode, &subscriber);
                Ok::<_, DatabaseError>(())
            })
            .await?;
        if saved.is_none() {
            tracing::debug!(chat_id = chat_id, "Subscriber deleted during run, state discarded");
        }

        tracing::info!(
            chat_id = chat_id,
            mode = %mode,
            feeds = collection.len(),
            messages = messages.len(),
            failures = formatted.reports.len(),
            "Update run complete"
        );
        Ok(Some(messages.len()))
    }

    /// Send fetch failures to every operator chat.
    async fn report(&self, reports: &[OperatorReport]) {
        for report in reports {
            if self.config.operators.is_empty() {
                tracing::error!(
                    feed = %report.source_url,
                    kind = %report.error_kind,
                    trace = %report.trace_text,
                    "Feed fetch failed and no operator is configured"
                );
                continue;
            }
            for &operator in &self.config.operators {
                if let Err(e) = self.messenger.send(operator, &report.to_string()).await {
                    tracing::warn!(operator = operator, error = %e, "Operator report delivery failed");
                }
            }
        }
    }

    async fn digest_time(&self, chat_id: ChatId) -> Result<Option<NaiveTime>, DatabaseError> {
        Ok(self
            .db
            .load_subscriber(chat_id)
            .await?
            .map(|subscriber| subscriber.digest_time()))
    }
}

// ============================================================================
// Timing
// ============================================================================

/// Next UTC instant at `time`: today if still ahead of `now`, else tomorrow.
pub fn next_occurrence(now: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// Uniformly random offset in `[0, period)`.
pub fn random_phase(period: Duration) -> Duration {
    let millis = period.as_millis().min(u64::MAX as u128) as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..millis))
}

async fn asap_loop(dispatcher: Arc<Dispatcher>, chat_id: ChatId) {
    let period = dispatcher.config().asap_interval();
    let phase = random_phase(period);
    tracing::debug!(chat_id = chat_id, phase_ms = phase.as_millis() as u64, "ASAP timer armed");
    tokio::time::sleep(phase).await;

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match dispatcher.run_update(chat_id, Mode::Asap).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => tracing::warn!(chat_id = chat_id, error = %e, "ASAP run failed"),
        }
    }
}

async fn digest_loop(dispatcher: Arc<Dispatcher>, chat_id: ChatId) {
    loop {
        let time = match dispatcher.digest_time(chat_id).await {
            Ok(Some(time)) => time,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(chat_id = chat_id, error = %e, "Could not read digest time");
                tokio::time::sleep(DIGEST_RECHECK).await;
                continue;
            }
        };

        let now = Utc::now();
        let target = next_occurrence(now, time);
        let wait = (target - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait.min(DIGEST_RECHECK)).await;
        if Utc::now() < target {
            continue;
        }

        match dispatcher.run_update(chat_id, Mode::Digest).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => tracing::warn!(chat_id = chat_id, error = %e, "Digest run failed"),
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Owns the timer tasks of every known chat.
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    jobs: Mutex<HashMap<ChatId, Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start both timers for `chat_id`, replacing any it already has.
    pub fn arm(&self, chat_id: ChatId) {
        let handles = vec![
            tokio::spawn(asap_loop(self.dispatcher.clone(), chat_id)),
            tokio::spawn(digest_loop(self.dispatcher.clone(), chat_id)),
        ];
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = jobs.insert(chat_id, handles) {
            old.iter().for_each(JoinHandle::abort);
        }
    }

    /// Stop the timers of `chat_id`. Returns whether it had any.
    pub fn disarm(&self, chat_id: ChatId) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.remove(&chat_id) {
            Some(handles) => {
                handles.iter().for_each(JoinHandle::abort);
                true
            }
            None => false,
        }
    }

    /// Chats with live timers, ascending.
    pub fn armed(&self) -> Vec<ChatId> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<ChatId> = jobs
            .iter()
            .filter(|(_, handles)| handles.iter().any(|h| !h.is_finished()))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Arm stored chats without live timers and disarm chats that were
    /// deleted. Returns how many chats were newly armed.
    pub async fn sync(&self) -> Result<usize, DatabaseError> {
        let stored: HashSet<ChatId> = self
            .dispatcher
            .db
            .list_subscribers()
            .await?
            .iter()
            .map(|subscriber| subscriber.chat_id())
            .collect();
        let armed: HashSet<ChatId> = self.armed().into_iter().collect();

        for &chat_id in armed.difference(&stored) {
            self.disarm(chat_id);
            tracing::info!(chat_id = chat_id, "Timers stopped");
        }

        let mut started = 0;
        for &chat_id in stored.difference(&armed) {
            self.arm(chat_id);
            started += 1;
            tracing::info!(chat_id = chat_id, "Timers started");
        }
        Ok(started)
    }

    /// Runs every stored chat's timers until Ctrl-C.
    ///
    /// # Returns
    ///
    /// `Ok(())` after a shutdown request, once every timer task is aborted.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` only if the initial subscriber listing fails.
    ///
    /// # Behavior
    ///
    /// - Arms all stored chats on start
    /// - Every 60 seconds, arms chats started since and disarms deleted ones
    /// - Resync failures are logged and retried on the next tick
    pub async fn run(&self) -> Result<(), DatabaseError> {
        let started = self.sync().await?;
        tracing::info!(subscribers = started, "Scheduler running");

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        let mut resync = tokio::time::interval(RESYNC_INTERVAL);
        resync.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                _ = resync.tick() => {
                    if let Err(e) = self.sync().await {
                        tracing::warn!(error = %e, "Subscriber resync failed");
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Abort every timer task.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handles) in jobs.drain() {
            handles.iter().for_each(JoinHandle::abort);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
