//! Periodic republishing of local values and expiration of cached ones.
//!
//! One cycle walks a snapshot of the database, one value at a time, with at
//! most one store operation in flight.

mod storer;

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use crate::common::{SharedRouteTable, MAX_BUCKET_SIZE_K};
use crate::db::{self, expiration, DatabaseSettings, DhtValueEntity, SharedDatabase};
use crate::rpc::DispatchError;

pub use storer::{KClosestStorer, StoreCallback, Storer};

/// Default interval after which a value stored at all `k` closest nodes is published again.
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(30 * 60); // 30 minutes
/// Local values are never published more often than this.
pub const DEFAULT_MIN_REPUBLISH_INTERVAL: Duration = Duration::from_secs(5 * 60); // 5 minutes
/// Default period between republish cycles.
pub const DEFAULT_REPUBLISH_PERIOD: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
/// Failure of one store operation.
pub enum StoreError {
    #[error("No contacts to store the value at")]
    NoContacts,

    #[error("Store request timed out")]
    Timeout,

    /// The dispatcher closed before the operation completed.
    #[error("Store operation was cancelled")]
    Cancelled,

    #[error("Every contacted node refused the value")]
    Rejected,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone)]
pub struct RepublishSettings {
    /// Defaults to [DEFAULT_REPUBLISH_INTERVAL]
    pub republish_interval: Duration,
    /// Defaults to [DEFAULT_MIN_REPUBLISH_INTERVAL]
    pub min_republish_interval: Duration,
    /// Time between republish cycles.
    ///
    /// Defaults to [DEFAULT_REPUBLISH_PERIOD]
    pub period: Duration,
    /// Number of nodes a value is stored at, `k`.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub replication_parameter: usize,
}

impl Default for RepublishSettings {
    fn default() -> Self {
        Self {
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            min_republish_interval: DEFAULT_MIN_REPUBLISH_INTERVAL,
            period: DEFAULT_REPUBLISH_PERIOD,
            replication_parameter: MAX_BUCKET_SIZE_K,
        }
    }
}

/// The source of values the [RepublishManager] walks.
pub trait ValuePublisher: Send {
    /// A snapshot of every value, unaffected by later changes.
    fn values(&self) -> Vec<DhtValueEntity>;

    /// The value is still stored, it may have been removed since the snapshot.
    fn contains(&self, entity: &DhtValueEntity) -> bool;

    fn is_expired(&self, entity: &DhtValueEntity, now: Instant) -> bool;

    /// Local values due for republishing, and cached values never forwarded.
    fn is_publishable(&self, entity: &DhtValueEntity, now: Instant) -> bool;

    /// Removes an expired value.
    fn expire(&mut self, entity: &DhtValueEntity) -> bool;

    /// Records a successful store at `locations` nodes.
    fn published(&mut self, entity: &DhtValueEntity, locations: usize, now: Instant);
}

#[derive(Debug, Clone)]
/// [ValuePublisher] over the shared [db::Database].
pub struct DatabasePublisher {
    database: SharedDatabase,
    route_table: SharedRouteTable,
    value_expiration: Duration,
    settings: RepublishSettings,
}

impl DatabasePublisher {
    pub fn new(
        database: SharedDatabase,
        route_table: SharedRouteTable,
        database_settings: &DatabaseSettings,
        settings: RepublishSettings,
    ) -> Self {
        DatabasePublisher {
            database,
            route_table,
            value_expiration: database_settings.value_expiration,
            settings,
        }
    }
}

impl ValuePublisher for DatabasePublisher {
    fn values(&self) -> Vec<DhtValueEntity> {
        db::lock(&self.database).values()
    }

    fn contains(&self, entity: &DhtValueEntity) -> bool {
        db::lock(&self.database).contains(entity.primary_key(), entity.secondary_key())
    }

    fn is_expired(&self, entity: &DhtValueEntity, now: Instant) -> bool {
        let table = self.route_table.read().unwrap_or_else(|e| e.into_inner());

        expiration::is_expired(
            &*table,
            entity,
            self.value_expiration,
            self.settings.replication_parameter,
            now,
        )
    }

    fn is_publishable(&self, entity: &DhtValueEntity, now: Instant) -> bool {
        if entity.is_local() {
            expiration::is_republishing_required(
                entity,
                self.settings.republish_interval,
                self.settings.min_republish_interval,
                self.settings.replication_parameter,
                now,
            )
        } else {
            !entity.has_been_published()
        }
    }

    fn expire(&mut self, entity: &DhtValueEntity) -> bool {
        db::lock(&self.database)
            .remove(entity.primary_key(), entity.secondary_key())
            .is_some()
    }

    fn published(&mut self, entity: &DhtValueEntity, locations: usize, now: Instant) {
        db::lock(&self.database).update_published(
            entity.primary_key(),
            entity.secondary_key(),
            locations,
            now,
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepublishState {
    Idle,
    Iterating,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Counters of the current or last cycle.
pub struct CycleReport {
    pub published: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Receives the completion of a store operation, possibly on another thread,
/// tagged with the operation's number.
pub type CompletionSink = Arc<dyn Fn(u64, Result<usize, StoreError>) + Send + Sync>;

/// Walks the publisher's values and republishes or expires them, one at a time.
///
/// Completions of store operations are delivered to the sink passed to
/// [Self::new], and must be fed back through [Self::store_completed].
pub struct RepublishManager<P, S> {
    publisher: P,
    storer: S,
    completions: CompletionSink,

    state: RepublishState,
    pending: VecDeque<DhtValueEntity>,
    in_flight: Option<(u64, DhtValueEntity)>,
    next_operation: u64,
    report: CycleReport,
}

impl<P: ValuePublisher, S: Storer> RepublishManager<P, S> {
    pub fn new(publisher: P, storer: S, completions: CompletionSink) -> Self {
        RepublishManager {
            publisher,
            storer,
            completions,

            state: RepublishState::Idle,
            pending: VecDeque::new(),
            in_flight: None,
            next_operation: 0,
            report: CycleReport::default(),
        }
    }

    // === Getters ===

    pub fn state(&self) -> RepublishState {
        self.state
    }

    pub fn report(&self) -> CycleReport {
        self.report
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// The value whose store operation is awaited.
    pub fn in_flight(&self) -> Option<&DhtValueEntity> {
        self.in_flight.as_ref().map(|(_, entity)| entity)
    }

    /// Number of the store operation in flight.
    pub fn operation(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|(operation, _)| *operation)
    }

    // === Public Methods ===

    /// Starts a new cycle, unless the previous one is still iterating.
    ///
    /// Returns `true` if a cycle was started.
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.state == RepublishState::Iterating {
            debug!(
                remaining = self.pending.len(),
                "Previous republish cycle still running, skipping"
            );
            return false;
        }

        self.pending = self.publisher.values().into();
        self.report = CycleReport::default();
        self.state = RepublishState::Iterating;

        trace!(values = self.pending.len(), "Starting republish cycle");

        self.advance(now);
        true
    }

    /// Handles the completion of the store operation in flight, then moves on.
    ///
    /// Completions of any other operation are ignored.
    pub fn store_completed(
        &mut self,
        operation: u64,
        result: Result<usize, StoreError>,
        now: Instant,
    ) {
        let entity = match self.in_flight.take() {
            Some((current, entity)) if current == operation => entity,
            other => {
                trace!(operation, "Ignoring completion of an abandoned store");
                self.in_flight = other;
                return;
            }
        };

        match result {
            Ok(locations) => {
                self.report.published += 1;
                self.publisher.published(&entity, locations, now);
            }
            Err(StoreError::Cancelled) => {
                debug!(primary_key = ?entity.primary_key(), "Store cancelled, ending cycle");
                self.finish();
                return;
            }
            Err(error) => {
                self.report.failed += 1;
                warn!(
                    primary_key = ?entity.primary_key(),
                    secondary_key = ?entity.secondary_key(),
                    ?error,
                    "Failed to publish value"
                );
            }
        }

        self.advance(now);
    }

    /// Stops the current cycle. A store already in flight is not undone,
    /// but its completion is ignored.
    pub fn cancel(&mut self) {
        if self.state == RepublishState::Iterating {
            debug!(remaining = self.pending.len(), "Republish cycle cancelled");
        }

        self.pending.clear();
        self.in_flight = None;
        self.state = RepublishState::Idle;
    }

    // === Private Methods ===

    fn advance(&mut self, now: Instant) {
        while let Some(entity) = self.pending.pop_front() {
            if !self.publisher.contains(&entity) {
                continue;
            }

            if self.publisher.is_expired(&entity, now) {
                if self.publisher.expire(&entity) {
                    self.report.expired += 1;
                }
                continue;
            }

            if !self.publisher.is_publishable(&entity, now) {
                continue;
            }

            let operation = self.next_operation;
            self.next_operation = self.next_operation.wrapping_add(1);

            let completions = self.completions.clone();
            self.in_flight = Some((operation, entity.clone()));
            self.storer.store(
                entity,
                Box::new(move |result| completions(operation, result)),
            );

            return;
        }

        self.finish();
    }

    fn finish(&mut self) {
        self.pending.clear();
        self.state = RepublishState::Idle;

        info!(
            published = self.report.published,
            expired = self.report.expired,
            failed = self.report.failed,
            "Republish cycle done"
        );
    }
}

enum Signal {
    Completed(u64, Result<usize, StoreError>),
    Trigger,
    Stop,
}

/// Runs a [RepublishManager] on its own thread, starting a cycle every period.
pub struct RepublishTask {
    signals: Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl RepublishTask {
    pub fn spawn<P, S>(publisher: P, storer: S, period: Duration) -> std::io::Result<Self>
    where
        P: ValuePublisher + 'static,
        S: Storer + 'static,
    {
        let (signals, receiver) = flume::unbounded();

        let sender = signals.clone();
        let manager = RepublishManager::new(
            publisher,
            storer,
            Arc::new(move |operation: u64, result: Result<usize, StoreError>| {
                let _ = sender.send(Signal::Completed(operation, result));
            }),
        );

        let handle = thread::Builder::new()
            .name("kadmos-republish".to_string())
            .spawn(move || run(manager, receiver, period))?;

        Ok(RepublishTask {
            signals,
            handle: Some(handle),
        })
    }

    /// Starts a cycle now, instead of waiting for the next period.
    pub fn trigger(&self) {
        let _ = self.signals.send(Signal::Trigger);
    }

    /// Stops iterating and waits for the task's thread.
    ///
    /// A store already in flight is not undone.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.signals.send(Signal::Stop);
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for RepublishTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepublishTask")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Drop for RepublishTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run<P: ValuePublisher, S: Storer>(
    mut manager: RepublishManager<P, S>,
    signals: Receiver<Signal>,
    period: Duration,
) {
    let mut next_cycle = Instant::now() + period;

    loop {
        let timeout = next_cycle.saturating_duration_since(Instant::now());

        match signals.recv_timeout(timeout) {
            Ok(Signal::Completed(operation, result)) => {
                manager.store_completed(operation, result, Instant::now())
            }
            Ok(Signal::Trigger) | Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                next_cycle = now + period;
                manager.tick(now);
            }
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    manager.cancel();
    debug!("Republish task stopped");
}
