//! The connection pool.
//!
//! `Pool<R>` owns a collection of [`Slot`]s and the counters that describe
//! them. Acquisition never takes a pool-wide lock across a slow call: status
//! changes are compare-and-set on the slot, and the counter lock is held only
//! for the few instructions that move a slot between states.
//!
//! Lock order is always `books` before `slots`.

mod housekeeper;
mod prototyper;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, PoolEvent, RemovalReason};
use crate::guard::PooledConnection;
use crate::listener::{ConnectionListener, Listeners, StateListener};
use crate::registry::{PoolMonitor, Registry};
use crate::resource::Resource;
use crate::slot::{ConnectionInfo, Slot};
use crate::stats::{self, Period, Statistics, StatsRoller};
use crate::status::{HealthInputs, Status, UpState};

/// Requester label used by [`Pool::acquire`].
pub const ANONYMOUS: &str = "anonymous";

// ---------------------------------------------------------------------------
// PoolStats
// ---------------------------------------------------------------------------

/// Counter snapshot.
///
/// Displays in the compact form `served (active/available+active) -refused
/// [offline]`, e.g. `1204 (03/08) -7 [1]`. The refused and offline parts are
/// only shown when non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoolStats {
    /// Connections that exist or are being created.
    pub connection_count: usize,
    /// Connections that finished connecting.
    pub connected_count: usize,
    /// Idle connections.
    pub available: usize,
    /// Checked-out connections.
    pub active: usize,
    /// Connections held by housekeeping.
    pub offline: usize,
    /// Total connections served.
    pub served: u64,
    /// Total acquire attempts refused.
    pub refused: u64,
    /// Current health.
    pub up_state: UpState,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:02}/{:02})",
            self.served,
            self.active,
            self.available + self.active
        )?;
        if self.refused > 0 {
            write!(f, " -{}", self.refused)?;
        }
        if self.offline > 0 {
            write!(f, " [{}]", self.offline)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Books
// ---------------------------------------------------------------------------

/// Counters guarded by the pool's counter lock.
#[derive(Debug, Default)]
struct Books {
    connection_count: usize,
    connected_count: usize,
    by_state: [usize; 4],
    served: u64,
    refused: u64,
    last_refusal: Option<Instant>,
    recently_started: usize,
    up_state: UpState,
}

impl Books {
    fn count(&self, status: Status) -> usize {
        self.by_state[status.index()]
    }

    fn shift(&mut self, from: Status, to: Status) {
        self.by_state[from.index()] -= 1;
        self.by_state[to.index()] += 1;
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connection_count: self.connection_count,
            connected_count: self.connected_count,
            available: self.count(Status::Available),
            active: self.count(Status::Active),
            offline: self.count(Status::Offline),
            served: self.served,
            refused: self.refused,
            up_state: self.up_state,
        }
    }

    fn health_inputs(&self) -> HealthInputs {
        HealthInputs {
            available: self.count(Status::Available),
            active: self.count(Status::Active),
            // Only active connections can be recently started; housekeeping
            // recounts, but a pool that was never started must still go DOWN.
            recently_started: self.recently_started.min(self.count(Status::Active)),
            since_last_refusal: self.last_refusal.map(|at| at.elapsed()),
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub(crate) struct PoolInner<R: Resource> {
    resource: R,
    config: PoolConfig,
    books: Mutex<Books>,
    slots: RwLock<Vec<Arc<Slot<R::Instance>>>>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    running: AtomicBool,
    cancel: CancellationToken,
    wake_prototyper: Arc<Notify>,
    settled: Notify,
    events: EventBus,
    connection_listeners: Listeners<dyn ConnectionListener>,
    state_listeners: Listeners<dyn StateListener>,
    rollers: Vec<StatsRoller>,
    registry: Option<Arc<Registry>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: Resource> Drop for PoolInner<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<R: Resource> PoolMonitor for PoolInner<R> {
    fn alias(&self) -> &str {
        &self.config.alias
    }

    fn stats(&self) -> PoolStats {
        self.books.lock().snapshot()
    }

    fn up_state(&self) -> UpState {
        self.books.lock().up_state
    }
}

/// A pool of connections produced by a [`Resource`].
///
/// Cloning is cheap and every clone refers to the same pool. Background
/// housekeeping and prototyping only run after [`start`](Self::start); use
/// [`shutdown`](Self::shutdown) to close every connection gracefully.
pub struct Pool<R: Resource> {
    pub(crate) inner: Arc<PoolInner<R>>,
}

impl<R: Resource> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource> fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("alias", &self.alias())
            .field("resource_id", &self.inner.resource.id())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Releases a reserved connection count if creation does not complete.
struct CreationTicket<'a, R: Resource> {
    pool: &'a Pool<R>,
    armed: bool,
}

impl<R: Resource> Drop for CreationTicket<'_, R> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.inner.books.lock().connection_count -= 1;
            self.pool.recompute_health();
        }
    }
}

impl<R: Resource> Pool<R> {
    /// Create a pool for the given resource.
    ///
    /// No connection is opened until the first acquire or until
    /// [`start`](Self::start) lets the prototyper fill the minimum.
    pub fn new(resource: R, config: PoolConfig) -> Result<Self> {
        Self::build(resource, config, None)
    }

    /// Create a pool and register it under its alias.
    ///
    /// Fails with [`Error::Configuration`] if a live pool already holds the
    /// alias. The entry is removed again on shutdown.
    pub fn registered(resource: R, config: PoolConfig, registry: &Arc<Registry>) -> Result<Self> {
        let pool = Self::build(resource, config, Some(Arc::clone(registry)))?;
        let monitor: Arc<dyn PoolMonitor> = pool.inner.clone();
        registry.register(pool.alias(), Arc::downgrade(&monitor))?;
        Ok(pool)
    }

    fn build(resource: R, config: PoolConfig, registry: Option<Arc<Registry>>) -> Result<Self> {
        config.validate()?;
        let rollers = config
            .statistics_periods()?
            .into_iter()
            .map(|period| StatsRoller::new(config.alias.clone(), period))
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                resource,
                books: Mutex::new(Books::default()),
                slots: RwLock::new(Vec::with_capacity(config.maximum_connection_count)),
                cursor: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(true),
                cancel: CancellationToken::new(),
                wake_prototyper: Arc::new(Notify::new()),
                settled: Notify::new(),
                events: EventBus::default(),
                connection_listeners: Listeners::new(),
                state_listeners: Listeners::new(),
                rollers,
                registry,
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    /// Spawn the housekeeper, the prototyper and, when statistics are
    /// configured, the statistics timer.
    ///
    /// Must be called from within a tokio runtime. Calling it again, or after
    /// shutdown, does nothing.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() || !self.is_running() {
            return;
        }
        tasks.push(housekeeper::spawn(self));
        tasks.push(prototyper::spawn(self));
        if !self.inner.rollers.is_empty() {
            tasks.push(spawn_statistics_timer(self));
        }
        tracing::info!(
            alias = %self.alias(),
            resource = self.inner.resource.id(),
            minimum = self.inner.config.minimum_connection_count,
            maximum = self.inner.config.maximum_connection_count,
            "pool started"
        );
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The pool alias.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.inner.config.alias
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The creation collaborator.
    #[must_use]
    pub fn resource(&self) -> &R {
        &self.inner.resource
    }

    /// `false` once shutdown has begun.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Counter snapshot taken under the counter lock.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.books.lock().snapshot()
    }

    /// Connections that exist or are being created.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.books.lock().connection_count
    }

    /// Connections that finished connecting.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.inner.books.lock().connected_count
    }

    #[must_use]
    pub fn available_count(&self) -> usize {
        self.inner.books.lock().count(Status::Available)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.books.lock().count(Status::Active)
    }

    #[must_use]
    pub fn offline_count(&self) -> usize {
        self.inner.books.lock().count(Status::Offline)
    }

    #[must_use]
    pub fn served_count(&self) -> u64 {
        self.inner.books.lock().served
    }

    #[must_use]
    pub fn refused_count(&self) -> u64 {
        self.inner.books.lock().refused
    }

    /// Current derived health.
    #[must_use]
    pub fn up_state(&self) -> UpState {
        self.inner.books.lock().up_state
    }

    /// Diagnostic snapshot of every connection in the collection.
    #[must_use]
    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.inner.slots.read().iter().map(|slot| slot.info()).collect()
    }

    /// The last completed statistics window for a configured period token.
    #[must_use]
    pub fn statistics(&self, period: &str) -> Option<Statistics> {
        let period: Period = period.parse().ok()?;
        self.inner
            .rollers
            .iter()
            .find(|roller| roller.period() == period)
            .and_then(StatsRoller::complete_statistics)
    }

    /// Check the counter invariant against the collection.
    ///
    /// Both locks are held, so the answer is exact at that instant.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let books = self.inner.books.lock();
        let slots = self.inner.slots.read();
        books.by_state.iter().sum::<usize>() == slots.len()
            && books.connection_count >= books.connected_count
            && books.connected_count == slots.len()
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Subscribe to pool events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// The pool's event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register a birth/death listener.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.connection_listeners.add(listener);
    }

    /// Register an up-state listener.
    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.inner.state_listeners.add(listener);
    }

    // -----------------------------------------------------------------------
    // Acquire
    // -----------------------------------------------------------------------

    /// Acquire a connection on behalf of an anonymous caller.
    pub async fn acquire(&self) -> Result<PooledConnection<R>> {
        self.acquire_for(ANONYMOUS).await
    }

    /// Acquire a connection, tagging it with a requester label.
    ///
    /// Never waits for a connection to come back: when the pool is full and
    /// nothing is idle the call fails immediately with
    /// [`Error::Exhausted`].
    pub async fn acquire_for(&self, requester: &str) -> Result<PooledConnection<R>> {
        if !self.is_running() {
            return Err(Error::ShutDown {
                alias: self.alias().to_string(),
            });
        }
        let config = &self.inner.config;

        let full = {
            let books = self.inner.books.lock();
            books.connection_count >= config.maximum_connection_count
                && books.count(Status::Available) == 0
        };
        if full {
            return Err(self.refuse(self.exhausted()));
        }

        self.inner.wake_prototyper.notify_one();

        let in_flight = {
            let books = self.inner.books.lock();
            books.connection_count - books.connected_count
        };
        if in_flight > config.maximum_new_connections {
            return Err(self.refuse(Error::Overloaded {
                alias: self.alias().to_string(),
                in_flight,
                ceiling: config.maximum_new_connections,
            }));
        }

        let claimed = match self.claim_available() {
            Some(claimed) => Ok(claimed),
            None => match self.create_connection(Status::Active).await {
                Ok(slot) => self.check_out(slot),
                Err(error) => Err(error),
            },
        };

        match claimed {
            Ok((slot, instance)) => Ok(self.serve(slot, instance, requester)),
            Err(error) => Err(self.refuse(error)),
        }
    }

    /// Scan for an idle connection starting at the round-robin cursor.
    ///
    /// The scan is bounded by the collection size when it starts.
    fn claim_available(&self) -> Option<(Arc<Slot<R::Instance>>, R::Instance)> {
        let scan = self.inner.slots.read().len();
        for _ in 0..scan {
            let Some(slot) = self.next_round_robin() else {
                break;
            };
            if !self.transition(&slot, Status::Available, Status::Active) {
                continue;
            }
            if let Some(instance) = slot.take_instance() {
                return Some((slot, instance));
            }
            tracing::warn!(alias = %self.alias(), id = slot.id(), "claimed connection had no instance");
            self.detach(&slot, RemovalReason::Discarded, true);
        }
        None
    }

    /// Next slot under the round-robin cursor.
    ///
    /// The cursor is read and written with relaxed ordering and no lock, so
    /// concurrent scans may start on the same slot or skip one. An index past
    /// the end wraps to zero.
    fn next_round_robin(&self) -> Option<Arc<Slot<R::Instance>>> {
        let slots = self.inner.slots.read();
        let mut index = self.inner.cursor.load(Ordering::Relaxed);
        if index >= slots.len() {
            index = 0;
        }
        self.inner.cursor.store(index + 1, Ordering::Relaxed);
        slots.get(index).cloned()
    }

    fn check_out(
        &self,
        slot: Arc<Slot<R::Instance>>,
    ) -> Result<(Arc<Slot<R::Instance>>, R::Instance)> {
        match slot.take_instance() {
            Some(instance) => Ok((slot, instance)),
            None => Err(Error::creation(
                self.alias(),
                format!("connection #{} was removed before it could be served", slot.id()),
            )),
        }
    }

    fn serve(
        &self,
        slot: Arc<Slot<R::Instance>>,
        instance: R::Instance,
        requester: &str,
    ) -> PooledConnection<R> {
        slot.set_requester(requester);
        {
            let mut books = self.inner.books.lock();
            books.served += 1;
            books.recently_started += 1;
        }
        for roller in &self.inner.rollers {
            roller.record_served();
        }
        self.inner.events.emit(PoolEvent::Served {
            alias: self.alias().to_string(),
            id: slot.id(),
            requester: requester.to_string(),
        });
        self.recompute_health();
        PooledConnection::new(self.clone(), slot, instance)
    }

    fn exhausted(&self) -> Error {
        let stats = self.stats();
        Error::Exhausted {
            alias: self.alias().to_string(),
            connection_count: stats.connection_count,
            maximum: self.inner.config.maximum_connection_count,
            stats: stats.to_string(),
        }
    }

    fn refuse(&self, error: Error) -> Error {
        {
            let mut books = self.inner.books.lock();
            books.refused += 1;
            books.last_refusal = Some(Instant::now());
        }
        for roller in &self.inner.rollers {
            roller.record_refused();
        }
        tracing::warn!(alias = %self.alias(), error = %error, "refused connection");
        self.inner.events.emit(PoolEvent::Refused {
            alias: self.alias().to_string(),
            reason: error.to_string(),
        });
        self.recompute_health();
        error
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Open one connection and admit it in `initial` state.
    ///
    /// The connection count is reserved under the counter lock before the
    /// resource is asked to connect and released again if anything fails,
    /// including the caller dropping this future.
    pub(crate) async fn create_connection(&self, initial: Status) -> Result<Arc<Slot<R::Instance>>> {
        let inner = &self.inner;
        let mut ticket = {
            let mut books = inner.books.lock();
            if books.connection_count >= inner.config.maximum_connection_count {
                None
            } else {
                books.connection_count += 1;
                Some(CreationTicket {
                    pool: self,
                    armed: true,
                })
            }
        }
        .ok_or_else(|| self.exhausted())?;

        let instance = inner.resource.create().await.map_err(|error| match error {
            Error::Creation { .. } => error,
            other => Error::creation(self.alias(), other),
        })?;

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(id, instance));

        let info = slot.info();
        for listener in inner.connection_listeners.snapshot() {
            if let Err(error) = listener.on_birth(&info) {
                if let Some(instance) = slot.take_instance() {
                    self.close_instance(id, instance).await;
                }
                return Err(Error::Creation {
                    alias: self.alias().to_string(),
                    reason: format!("birth listener rejected connection #{id}: {error}"),
                    source: Some(Box::new(error)),
                });
            }
        }

        {
            let mut books = inner.books.lock();
            if inner.running.load(Ordering::Acquire) {
                inner.slots.write().push(Arc::clone(&slot));
                books.connected_count += 1;
                books.by_state[Status::Offline.index()] += 1;
                slot.force(initial);
                books.shift(Status::Offline, initial);
                ticket.armed = false;
            }
        }
        if ticket.armed {
            if let Some(instance) = slot.take_instance() {
                self.close_instance(id, instance).await;
            }
            return Err(Error::ShutDown {
                alias: self.alias().to_string(),
            });
        }
        drop(ticket);

        let origin = if initial == Status::Active {
            "on demand"
        } else {
            "as prototype"
        };
        tracing::debug!(alias = %self.alias(), id, origin, stats = %self.stats(), "connection created");
        inner.events.emit(PoolEvent::Born {
            alias: self.alias().to_string(),
            id,
            status: initial,
        });
        Ok(slot)
    }

    // -----------------------------------------------------------------------
    // Transitions and removal
    // -----------------------------------------------------------------------

    /// Compare-and-set a slot's status, moving the counters with it.
    pub(crate) fn transition(&self, slot: &Slot<R::Instance>, from: Status, to: Status) -> bool {
        let mut books = self.inner.books.lock();
        if !slot.compare_and_set(from, to) {
            return false;
        }
        books.shift(from, to);
        true
    }

    /// Take back a connection from its handle.
    ///
    /// Returns the instance when it must be physically closed by the caller.
    pub(crate) fn settle(
        &self,
        slot: &Arc<Slot<R::Instance>>,
        instance: R::Instance,
        discard: bool,
    ) -> Option<R::Instance> {
        let active_time = slot.active_time().unwrap_or_default();
        let to_close = if discard || slot.is_marked_for_expiry() {
            if self.transition(slot, Status::Active, Status::Null) {
                self.record_return(slot, active_time);
                let reason = if discard {
                    RemovalReason::Discarded
                } else {
                    RemovalReason::ExpiryRequested
                };
                self.detach(slot, reason, false);
            } else {
                self.stray_return(slot);
            }
            Some(instance)
        } else {
            slot.park(instance);
            if self.transition(slot, Status::Active, Status::Available) {
                self.record_return(slot, active_time);
                None
            } else {
                self.stray_return(slot);
                slot.take_instance()
            }
        };
        self.inner.settled.notify_waiters();
        self.recompute_health();
        to_close
    }

    fn record_return(&self, slot: &Slot<R::Instance>, active_time: Duration) {
        for roller in &self.inner.rollers {
            roller.record_returned(active_time);
        }
        self.inner.events.emit(PoolEvent::Returned {
            alias: self.alias().to_string(),
            id: slot.id(),
            active_time,
        });
    }

    fn stray_return(&self, slot: &Slot<R::Instance>) {
        let status = slot.status();
        if status == Status::Null {
            tracing::debug!(alias = %self.alias(), id = slot.id(), "connection was removed while in use");
        } else {
            tracing::warn!(alias = %self.alias(), id = slot.id(), %status, "returned connection was not active");
        }
    }

    /// Remove a slot from the collection and settle the counters.
    ///
    /// Proceeds only if the slot is NULL, unless `force` is set. Does not close
    /// the instance; whoever holds it does.
    pub(crate) fn detach(
        &self,
        slot: &Arc<Slot<R::Instance>>,
        reason: RemovalReason,
        force: bool,
    ) -> bool {
        {
            let mut books = self.inner.books.lock();
            if !force && slot.status() != Status::Null {
                return false;
            }
            let mut slots = self.inner.slots.write();
            let Some(position) = slots.iter().position(|s| Arc::ptr_eq(s, slot)) else {
                return false;
            };
            slots.remove(position);
            let previous = slot.force(Status::Null);
            books.by_state[previous.index()] -= 1;
            books.connection_count -= 1;
            books.connected_count -= 1;
        }

        let id = slot.id();
        let info = slot.info();
        for listener in self.inner.connection_listeners.snapshot() {
            if let Err(error) = listener.on_death(&info) {
                tracing::error!(alias = %self.alias(), id, error = %error, "death listener failed");
            }
        }
        tracing::debug!(alias = %self.alias(), id, reason = %reason, stats = %self.stats(), "connection removed");
        self.inner.events.emit(PoolEvent::Removed {
            alias: self.alias().to_string(),
            id,
            reason,
        });
        self.inner.wake_prototyper.notify_one();
        self.inner.settled.notify_waiters();
        self.recompute_health();
        true
    }

    /// Detach a slot and close its parked instance, if any.
    pub(crate) async fn remove(
        &self,
        slot: &Arc<Slot<R::Instance>>,
        reason: RemovalReason,
        force: bool,
    ) -> bool {
        if !self.detach(slot, reason, force) {
            return false;
        }
        if let Some(instance) = slot.take_instance() {
            self.close_instance(slot.id(), instance).await;
        }
        true
    }

    /// Physically close an instance. Failures are logged and swallowed.
    pub(crate) async fn close_instance(&self, id: u64, instance: R::Instance) {
        if let Err(error) = self.inner.resource.cleanup(instance).await {
            let error = Error::close(self.alias(), id, error.to_string());
            tracing::error!(alias = %self.alias(), id, error = %error, "failed to close connection");
        }
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Return a connection to the pool.
    pub async fn release(&self, connection: PooledConnection<R>) {
        connection.release().await;
    }

    /// Report a connection as broken; it is removed and closed.
    pub async fn discard(&self, connection: PooledConnection<R>) {
        connection.discard().await;
    }

    /// Expire one connection by id.
    ///
    /// An idle connection is removed now. A busy one is removed now when
    /// `force` is set (its handle closes it on return), otherwise it is
    /// marked and removed at its next release. Returns `true` if the
    /// connection was removed.
    pub async fn expire_by_id(&self, id: u64, force: bool) -> bool {
        let slot = self
            .inner
            .slots
            .read()
            .iter()
            .find(|slot| slot.id() == id)
            .cloned();
        match slot {
            Some(slot) => self.expire(&slot, force, RemovalReason::ManuallyKilled).await,
            None => false,
        }
    }

    /// Expire every connection.
    ///
    /// A merciful expiry only marks busy connections; otherwise they are
    /// removed immediately. Returns the number removed now.
    pub async fn expire_all(&self, merciful: bool) -> usize {
        let slots = self.inner.slots.read().clone();
        let mut removed = 0;
        for slot in slots.iter().rev() {
            if self.expire(slot, !merciful, RemovalReason::ManuallyKilled).await {
                removed += 1;
            }
        }
        tracing::info!(alias = %self.alias(), removed, merciful, "expired all connections");
        removed
    }

    pub(crate) async fn expire(
        &self,
        slot: &Arc<Slot<R::Instance>>,
        force: bool,
        reason: RemovalReason,
    ) -> bool {
        if self.transition(slot, Status::Available, Status::Offline) {
            return self.transition(slot, Status::Offline, Status::Null)
                && self.remove(slot, reason, false).await;
        }
        if force {
            return self.remove(slot, reason, true).await;
        }
        if slot.mark_for_expiry() {
            tracing::debug!(alias = %self.alias(), id = slot.id(), "connection marked for expiry");
            self.inner.events.emit(PoolEvent::MarkedForExpiry {
                alias: self.alias().to_string(),
                id: slot.id(),
            });
        }
        false
    }

    /// Shut down using the configured `shutdown_delay`.
    pub async fn close(&self) {
        self.shutdown(self.inner.config.shutdown_delay).await;
    }

    /// Shut the pool down.
    ///
    /// Stops the background tasks, waits up to `delay` for busy connections
    /// to come back, then removes and closes every remaining connection
    /// regardless of state. A second call is a no-op.
    pub async fn shutdown(&self, delay: Duration) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            tracing::debug!(alias = %self.alias(), "ignoring duplicate shutdown");
            return;
        }
        tracing::info!(alias = %self.alias(), delay_ms = delay.as_millis() as u64, stats = %self.stats(), "shutting down");
        self.inner.cancel.cancel();
        self.inner.wake_prototyper.notify_one();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await
                && error.is_panic()
            {
                tracing::error!(alias = %self.alias(), "background task panicked");
            }
        }

        if !delay.is_zero()
            && tokio::time::timeout(delay, self.settled()).await.is_err()
        {
            tracing::warn!(
                alias = %self.alias(),
                active = self.active_count(),
                "connections still active after shutdown delay"
            );
        }

        let slots = self.inner.slots.read().clone();
        for slot in slots.iter().rev() {
            self.remove(slot, RemovalReason::Shutdown, true).await;
        }

        if let Some(registry) = &self.inner.registry {
            registry.deregister(self.alias());
        }
        tracing::info!(alias = %self.alias(), "pool shut down");
    }

    /// Resolves once no connection is active.
    async fn settled(&self) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Recompute the up-state and notify listeners on a change.
    pub(crate) fn recompute_health(&self) {
        let change = {
            let mut books = self.inner.books.lock();
            let next = UpState::derive(
                books.health_inputs(),
                self.inner.config.overload_without_refusal_lifetime,
            );
            if next == books.up_state {
                None
            } else {
                Some((std::mem::replace(&mut books.up_state, next), next))
            }
        };
        let Some((from, to)) = change else {
            return;
        };

        tracing::info!(alias = %self.alias(), %from, %to, "up-state changed");
        for listener in self.inner.state_listeners.snapshot() {
            listener.up_state_changed(from, to);
        }
        self.inner.events.emit(PoolEvent::UpStateChanged {
            alias: self.alias().to_string(),
            from,
            to,
        });
    }

    pub(crate) fn set_recently_started(&self, count: usize) {
        self.inner.books.lock().recently_started = count;
    }

    pub(crate) fn wake_prototyper(&self) {
        self.inner.wake_prototyper.notify_one();
    }

    pub(crate) fn slots_snapshot(&self) -> Vec<Arc<Slot<R::Instance>>> {
        self.inner.slots.read().clone()
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!("pool", alias = %self.alias())
    }
}

/// Roll idle statistics windows that no record has rolled.
fn spawn_statistics_timer<R: Resource>(pool: &Pool<R>) -> JoinHandle<()> {
    let weak = Arc::downgrade(&pool.inner);
    let cancel = pool.inner.cancel.clone();

    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(stats::ROLL_CHECK_INTERVAL) => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                for roller in &inner.rollers {
                    roller.roll();
                }
            }
        }
        .instrument(pool.span()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockResource;

    fn config(max: usize) -> PoolConfig {
        PoolConfig {
            alias: "unit".into(),
            maximum_connection_count: max,
            minimum_connection_count: 0,
            ..Default::default()
        }
    }

    #[test]
    fn stats_display_is_compact() {
        let stats = PoolStats {
            served: 1204,
            active: 3,
            available: 5,
            ..Default::default()
        };
        assert_eq!(stats.to_string(), "1204 (03/08)");

        let stats = PoolStats {
            refused: 7,
            offline: 1,
            ..stats
        };
        assert_eq!(stats.to_string(), "1204 (03/08) -7 [1]");
    }

    #[tokio::test]
    async fn round_robin_spreads_claims_across_idle_connections() {
        let pool = Pool::new(MockResource::new("rr"), config(3)).unwrap();
        for _ in 0..3 {
            pool.create_connection(Status::Available).await.unwrap();
        }
        assert_eq!(pool.available_count(), 3);

        let mut served = Vec::new();
        for _ in 0..6 {
            let conn = pool.acquire().await.unwrap();
            served.push(conn.id());
            conn.release().await;
        }
        assert_eq!(served, vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn cursor_past_the_end_wraps_to_start() {
        let pool = Pool::new(MockResource::new("rr"), config(2)).unwrap();
        pool.create_connection(Status::Available).await.unwrap();
        pool.inner.cursor.store(17, Ordering::Relaxed);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), 1);
        assert_eq!(pool.inner.cursor.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn creation_failure_releases_reserved_count() {
        let pool = Pool::new(MockResource::new("fail"), config(2)).unwrap();
        pool.resource().set_fail_create(true);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Creation { .. }));
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.refused_count(), 1);
        assert!(pool.is_consistent());
    }

    #[tokio::test]
    async fn dropped_creation_releases_reserved_count() {
        let resource = MockResource::new("slow").with_create_delay(Duration::from_secs(60));
        let pool = Pool::new(resource, config(2)).unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn detach_requires_null_unless_forced() {
        let pool = Pool::new(MockResource::new("detach"), config(2)).unwrap();
        let slot = pool.create_connection(Status::Available).await.unwrap();

        assert!(!pool.detach(&slot, RemovalReason::ManuallyKilled, false));
        assert_eq!(pool.connection_count(), 1);

        assert!(pool.remove(&slot, RemovalReason::ManuallyKilled, true).await);
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.resource().cleanup_count(), 1);
        assert!(!pool.remove(&slot, RemovalReason::ManuallyKilled, true).await);
        assert!(pool.is_consistent());
    }

    #[tokio::test]
    async fn up_state_listener_sees_only_transitions() {
        use std::sync::atomic::AtomicUsize;

        struct Counting(AtomicUsize);
        impl StateListener for Counting {
            fn up_state_changed(&self, from: UpState, to: UpState) {
                assert_ne!(from, to);
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pool = Pool::new(MockResource::new("health"), config(2)).unwrap();
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        pool.add_state_listener(listener.clone());

        pool.recompute_health();
        pool.recompute_health();
        // Quiet -> Down: nothing available, nothing recently started.
        assert_eq!(pool.up_state(), UpState::Down);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_hung_creation() {
        let resource = MockResource::new("hung").with_create_delay(Duration::from_secs(3600));
        let pool = Pool::new(
            resource,
            PoolConfig {
                minimum_connection_count: 1,
                ..config(2)
            },
        )
        .unwrap();
        pool.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.resource().create_attempts(), 1);
        assert_eq!(pool.connection_count(), 1, "creation holds a reservation");

        tokio::time::timeout(Duration::from_secs(2), pool.shutdown(Duration::ZERO))
            .await
            .expect("shutdown must not wait for a hung creation");
        assert_eq!(pool.connection_count(), 0);
        assert!(pool.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_hung_validation() {
        let resource = MockResource::new("hung").with_validate_delay(Duration::from_secs(3600));
        let pool = Pool::new(
            resource,
            PoolConfig {
                house_keeping_test_query: Some("SELECT 1".into()),
                house_keeping_sleep_time: Duration::from_secs(5),
                ..config(2)
            },
        )
        .unwrap();
        pool.create_connection(Status::Available).await.unwrap();
        pool.start();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(pool.resource().validation_count(), 1);
        assert_eq!(pool.offline_count(), 1);

        tokio::time::timeout(Duration::from_secs(2), pool.shutdown(Duration::ZERO))
            .await
            .expect("shutdown must not wait for a hung validation");
        assert_eq!(pool.connection_count(), 0);
        assert!(pool.is_consistent());
    }

    #[tokio::test]
    async fn shutdown_removes_everything_even_when_close_fails() {
        let pool = Pool::new(MockResource::new("close"), config(2)).unwrap();
        pool.create_connection(Status::Available).await.unwrap();
        pool.create_connection(Status::Available).await.unwrap();
        pool.resource().set_fail_cleanup(true);

        pool.shutdown(Duration::ZERO).await;
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.resource().cleanup_count(), 2);
        assert!(pool.is_consistent());
    }

    #[tokio::test]
    async fn pool_without_housekeeping_still_goes_down() {
        let pool = Pool::new(MockResource::new("health"), config(2)).unwrap();
        for _ in 0..3 {
            let conn = pool.acquire().await.unwrap();
            assert_eq!(pool.up_state(), UpState::Busy);
            conn.discard().await;
        }

        // Nothing available and nothing active: earlier serves are no evidence.
        assert_eq!(pool.up_state(), UpState::Down);
    }
}
