use super::config::PoolConfig;
use super::key::BucketKey;
use super::lease::Lease;
use super::request::Request;
use super::stats::{BucketStats, PoolCounters, PoolStats};
use super::transport::{Connection, DialOptions, Transport};
use crate::utils::error::{PoolError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::{self, Future};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type Reply<T> = oneshot::Sender<Result<Lease<T>>>;

/// Connection assigned to an in-flight request.
struct ActiveEntry<C> {
    id: u64,
    generation: u64,
    conn: Arc<C>,
    deadline: Option<CancellationToken>,
}

/// Connection parked for reuse.
struct IdleEntry<C> {
    id: u64,
    generation: u64,
    conn: Arc<C>,
    parked_at: Instant,
    ttl: Option<Duration>,
    watch: CancellationToken,
}

impl<C> IdleEntry<C> {
    fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.parked_at.elapsed() >= ttl)
    }
}

/// Request waiting for capacity in its bucket.
struct Waiter<T: Transport> {
    id: u64,
    options: DialOptions,
    keep_alive: bool,
    reply: Reply<T>,
}

/// Who receives the outcome of a dial.
enum DialTarget<T: Transport> {
    /// Admission dial owned by one request.
    Requester { keep_alive: bool, reply: Reply<T> },
    /// Replacement dial for a queue. The connection goes to whoever heads the
    /// queue when it lands.
    Queue,
}

/// Why a connection leaves the pool's bookkeeping.
#[derive(Debug)]
pub(crate) enum Eviction {
    Closed,
    Detached,
    ActiveTimeout,
    IdleTimeout,
    IdleFault(io::Error),
}

enum Admission<T: Transport> {
    Ready(Lease<T>),
    Dialing(oneshot::Receiver<Result<Lease<T>>>),
    Queued {
        waiter: u64,
        rx: oneshot::Receiver<Result<Lease<T>>>,
    },
}

/// Bucket maps. No map ever holds an empty entry.
struct PoolState<T: Transport> {
    active: HashMap<BucketKey, Vec<ActiveEntry<T::Connection>>>,
    idle: HashMap<BucketKey, VecDeque<IdleEntry<T::Connection>>>,
    pending: HashMap<BucketKey, VecDeque<Waiter<T>>>,
    connecting: HashMap<BucketKey, usize>,
    /// Replacement dials in flight, a subset of `connecting`.
    queue_dials: HashMap<BucketKey, usize>,
    idle_total: usize,
    counters: PoolCounters,
    destroyed: bool,
}

impl<T: Transport> PoolState<T> {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            idle: HashMap::new(),
            pending: HashMap::new(),
            connecting: HashMap::new(),
            queue_dials: HashMap::new(),
            idle_total: 0,
            counters: PoolCounters::default(),
            destroyed: false,
        }
    }

    /// Active, idle and dialing connections of one bucket.
    fn occupancy(&self, key: &BucketKey) -> usize {
        self.active.get(key).map_or(0, Vec::len)
            + self.idle.get(key).map_or(0, VecDeque::len)
            + self.connecting.get(key).copied().unwrap_or(0)
    }

    fn take_active(
        &mut self,
        key: &BucketKey,
        generation: u64,
    ) -> Option<ActiveEntry<T::Connection>> {
        let entries = self.active.get_mut(key)?;
        let index = entries
            .iter()
            .position(|entry| entry.generation == generation)?;
        let entry = entries.remove(index);
        if entries.is_empty() {
            self.active.remove(key);
        }

        if let Some(deadline) = &entry.deadline {
            deadline.cancel();
        }
        Some(entry)
    }

    fn take_idle(&mut self, key: &BucketKey, generation: u64) -> Option<IdleEntry<T::Connection>> {
        let entries = self.idle.get_mut(key)?;
        let index = entries
            .iter()
            .position(|entry| entry.generation == generation)?;
        let entry = entries.remove(index)?;
        if entries.is_empty() {
            self.idle.remove(key);
        }

        self.idle_total -= 1;
        entry.watch.cancel();
        Some(entry)
    }

    /// Oldest idle connection first.
    fn pop_idle(&mut self, key: &BucketKey) -> Option<IdleEntry<T::Connection>> {
        let entries = self.idle.get_mut(key)?;
        let entry = entries.pop_front();
        if entries.is_empty() {
            self.idle.remove(key);
        }

        let entry = entry?;
        self.idle_total -= 1;
        entry.watch.cancel();
        Some(entry)
    }

    /// Next waiter whose caller is still listening.
    fn pop_pending(&mut self, key: &BucketKey) -> Option<Waiter<T>> {
        let queue = self.pending.get_mut(key)?;
        let mut next = None;
        while let Some(waiter) = queue.pop_front() {
            if !waiter.reply.is_closed() {
                next = Some(waiter);
                break;
            }
        }
        if queue.is_empty() {
            self.pending.remove(key);
        }
        next
    }

    fn withdraw(&mut self, key: &BucketKey, waiter: u64) -> bool {
        let Some(queue) = self.pending.get_mut(key) else {
            return false;
        };
        let removed = match queue.iter().position(|entry| entry.id == waiter) {
            Some(index) => queue.remove(index).is_some(),
            None => false,
        };
        if queue.is_empty() {
            self.pending.remove(key);
        }
        removed
    }

    /// Dial options of the first live waiter not yet covered by a
    /// replacement dial. Abandoned waiters are pruned on the way.
    fn uncovered_waiter(&mut self, key: &BucketKey) -> Option<DialOptions> {
        let queue = self.pending.get_mut(key)?;
        queue.retain(|waiter| !waiter.reply.is_closed());
        if queue.is_empty() {
            self.pending.remove(key);
            return None;
        }

        let covered = self.queue_dials.get(key).copied().unwrap_or(0);
        queue.get(covered).map(|waiter| waiter.options.clone())
    }

    fn reserve(&mut self, key: &BucketKey) {
        *self.connecting.entry(key.clone()).or_insert(0) += 1;
    }

    fn unreserve(&mut self, key: &BucketKey) {
        decrement(&mut self.connecting, key);
    }

    fn begin_queue_dial(&mut self, key: &BucketKey) {
        self.reserve(key);
        *self.queue_dials.entry(key.clone()).or_insert(0) += 1;
    }

    fn end_queue_dial(&mut self, key: &BucketKey) {
        self.unreserve(key);
        decrement(&mut self.queue_dials, key);
    }
}

fn decrement(counts: &mut HashMap<BucketKey, usize>, key: &BucketKey) {
    if let Some(count) = counts.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(key);
        }
    }
}

/// State shared between the pool handle, its leases and its timer tasks.
pub(crate) struct Shared<T: Transport> {
    config: PoolConfig,
    transport: T,
    state: Mutex<PoolState<T>>,
    next_id: AtomicU64,
}

impl<T: Transport> Shared<T> {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn admit(self: &Arc<Self>, key: BucketKey, request: &Request) -> Result<Admission<T>> {
        let mut doomed = Vec::new();
        let admission = self.admit_locked(key, request, &mut doomed);
        for (key, id, conn) in doomed {
            close_quietly(&key, id, conn.as_ref());
        }
        admission
    }

    fn admit_locked(
        self: &Arc<Self>,
        key: BucketKey,
        request: &Request,
        doomed: &mut Vec<(BucketKey, u64, Arc<T::Connection>)>,
    ) -> Result<Admission<T>> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(PoolError::Destroyed);
        }

        while let Some(entry) = state.pop_idle(&key) {
            if entry.is_expired() || !entry.conn.is_open() {
                trace!(
                    "Discarding stale idle connection #{} to {} (idle: {:?})",
                    entry.id,
                    key,
                    entry.parked_at.elapsed()
                );
                state.counters.closed += 1;
                if entry.is_expired() {
                    state.counters.timeouts += 1;
                }
                doomed.push((key.clone(), entry.id, entry.conn));
                continue;
            }

            trace!("Reusing idle connection #{} for {}", entry.id, key);
            state.counters.reuses += 1;
            let lease = self.activate(&mut state, &key, entry.id, entry.conn, request.keep_alive());
            return Ok(Admission::Ready(lease));
        }

        let options = DialOptions::new(request, &key, &self.config);
        let (reply, rx) = oneshot::channel();

        if state.occupancy(&key) < self.config.capacity_for(&key) {
            debug!("Pool miss for {}, dialing new connection", key);
            state.reserve(&key);
            state.counters.dials += 1;
            drop(state);
            let target = DialTarget::Requester {
                keep_alive: request.keep_alive(),
                reply,
            };
            self.spawn_dial(key, options, target);
            return Ok(Admission::Dialing(rx));
        }

        let waiter = self.next_id();
        debug!(
            "Bucket {} at capacity, queueing request #{} (occupancy: {})",
            key,
            waiter,
            state.occupancy(&key)
        );
        state.pending.entry(key).or_default().push_back(Waiter {
            id: waiter,
            options,
            keep_alive: request.keep_alive(),
            reply,
        });
        Ok(Admission::Queued { waiter, rx })
    }

    /// Move `conn` into `active[key]` and wrap it in a lease.
    fn activate(
        self: &Arc<Self>,
        state: &mut PoolState<T>,
        key: &BucketKey,
        id: u64,
        conn: Arc<T::Connection>,
        keep_alive: bool,
    ) -> Lease<T> {
        let generation = self.next_id();
        conn.set_timeout(self.config.active_timeout);

        let deadline = conn.timeout().and_then(|limit| {
            let token = CancellationToken::new();
            let task = watch_deadline(
                Arc::downgrade(self),
                key.clone(),
                generation,
                token.clone(),
                limit,
            );
            spawn_detached(task).then_some(token)
        });

        state
            .active
            .entry(key.clone())
            .or_default()
            .push(ActiveEntry {
                id,
                generation,
                conn: Arc::clone(&conn),
                deadline,
            });

        Lease::new(Arc::clone(self), key.clone(), id, generation, conn, keep_alive)
    }

    /// Room for one more idle connection, globally and within the bucket.
    fn may_park(&self, state: &PoolState<T>, key: &BucketKey) -> bool {
        if state.idle_total >= self.config.max_idle_total {
            trace!(
                "Idle pool is full ({} connections), not parking for {}",
                state.idle_total,
                key
            );
            return false;
        }
        state.occupancy(key) < self.config.capacity_for(key)
    }

    fn park(
        self: &Arc<Self>,
        state: &mut PoolState<T>,
        key: &BucketKey,
        id: u64,
        conn: Arc<T::Connection>,
    ) {
        if let Err(err) = conn.set_keep_alive(true, self.config.keep_alive_interval) {
            debug!("Failed to enable keep-alive on connection #{} to {}: {}", id, key, err);
        }
        conn.set_timeout(self.config.idle_timeout);

        let generation = self.next_id();
        let ttl = conn.timeout();
        let watch = CancellationToken::new();
        spawn_detached(watch_idle(
            Arc::downgrade(self),
            key.clone(),
            generation,
            Arc::clone(&conn),
            watch.clone(),
            ttl,
        ));

        let entries = state.idle.entry(key.clone()).or_default();
        entries.push_back(IdleEntry {
            id,
            generation,
            conn,
            parked_at: Instant::now(),
            ttl,
            watch,
        });
        trace!(
            "Parked connection #{} for {} (bucket idle: {})",
            id,
            key,
            entries.len()
        );
        state.idle_total += 1;
        state.counters.idle_parked += 1;
    }

    /// Hand `conn` to the head of the queue, or park it. Gives the connection
    /// back when neither is possible.
    fn place(
        self: &Arc<Self>,
        state: &mut PoolState<T>,
        key: &BucketKey,
        id: u64,
        conn: Arc<T::Connection>,
    ) -> Option<Arc<T::Connection>> {
        while let Some(waiter) = state.pop_pending(key) {
            let lease = self.activate(state, key, id, Arc::clone(&conn), waiter.keep_alive);
            let handed = lease.generation();
            match waiter.reply.send(Ok(lease)) {
                Ok(()) => {
                    state.counters.handoffs += 1;
                    trace!(
                        "Handed connection #{} to queued request #{} on {}",
                        id,
                        waiter.id,
                        key
                    );
                    return None;
                }
                Err(returned) => {
                    // Requester left between the liveness check and the send.
                    if let Ok(lease) = returned {
                        lease.disarm();
                    }
                    state.take_active(key, handed);
                }
            }
        }

        if self.config.keep_alive && self.may_park(state, key) {
            self.park(state, key, id, conn);
            return None;
        }
        Some(conn)
    }

    /// Reserve a replacement dial if the bucket has room and a queued request
    /// is not already covered by one. Waiters stay queued until served.
    fn schedule_pending(&self, state: &mut PoolState<T>, key: &BucketKey) -> Option<DialOptions> {
        if state.destroyed || state.occupancy(key) >= self.config.capacity_for(key) {
            return None;
        }

        let options = state.uncovered_waiter(key)?;
        state.begin_queue_dial(key);
        state.counters.dials += 1;
        debug!("Dialing replacement connection for queue on {}", key);
        Some(options)
    }

    fn spawn_dial(self: &Arc<Self>, key: BucketKey, options: DialOptions, target: DialTarget<T>) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                let mut state = self.state.lock();
                match target {
                    DialTarget::Requester { reply, .. } => {
                        state.unreserve(&key);
                        drop(state);
                        let _ = reply.send(Err(PoolError::Runtime(err.to_string())));
                    }
                    DialTarget::Queue => {
                        state.end_queue_dial(&key);
                        warn!("Cannot dial replacement for {}: {}", key, err);
                    }
                }
                return;
            }
        };

        let shared = Arc::clone(self);
        handle.spawn(async move {
            let result = shared.connect(&key, options).await;
            match target {
                DialTarget::Requester { keep_alive, reply } => {
                    let outcome = shared.finish_dial(&key, keep_alive, result);
                    // If the requester is gone the lease comes back and is released on drop.
                    let _ = reply.send(outcome);
                }
                DialTarget::Queue => shared.finish_queue_dial(&key, result),
            }
        });
    }

    async fn connect(&self, key: &BucketKey, options: DialOptions) -> io::Result<T::Connection> {
        match self.config.connect_timeout {
            Some(limit) => match timeout(limit, self.transport.dial(options)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("Connection to {} timed out after {:?}", key, limit),
                )),
            },
            None => self.transport.dial(options).await,
        }
    }

    fn finish_dial(
        self: &Arc<Self>,
        key: &BucketKey,
        keep_alive: bool,
        result: io::Result<T::Connection>,
    ) -> Result<Lease<T>> {
        let mut state = self.state.lock();
        state.unreserve(key);

        match result {
            Ok(conn) => {
                let conn = Arc::new(conn);
                let id = self.next_id();
                if state.destroyed {
                    state.counters.closed += 1;
                    drop(state);
                    debug!("Pool destroyed while dialing {}, closing new connection", key);
                    close_quietly(key, id, conn.as_ref());
                    return Err(PoolError::Destroyed);
                }

                debug!("Connection #{} established for {}", id, key);
                Ok(self.activate(&mut state, key, id, conn, keep_alive))
            }
            Err(source) => {
                state.counters.dial_failures += 1;
                let redial = self.schedule_pending(&mut state, key);
                drop(state);

                debug!("Dial for {} failed: {}", key, source);
                if let Some(options) = redial {
                    self.spawn_dial(key.clone(), options, DialTarget::Queue);
                }
                Err(PoolError::Dial {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    /// A replacement dial landed. Success serves the current queue head; a
    /// failure is reported to it.
    fn finish_queue_dial(self: &Arc<Self>, key: &BucketKey, result: io::Result<T::Connection>) {
        let mut state = self.state.lock();
        state.end_queue_dial(key);

        match result {
            Ok(conn) => {
                let conn = Arc::new(conn);
                let id = self.next_id();
                if state.destroyed {
                    state.counters.closed += 1;
                    drop(state);
                    debug!("Pool destroyed while dialing {}, closing new connection", key);
                    close_quietly(key, id, conn.as_ref());
                    return;
                }

                debug!("Connection #{} established for queue on {}", id, key);
                if let Some(conn) = self.place(&mut state, key, id, conn) {
                    state.counters.closed += 1;
                    drop(state);
                    trace!("Nobody left waiting on {}, closing connection #{}", key, id);
                    close_quietly(key, id, conn.as_ref());
                }
            }
            Err(source) => {
                state.counters.dial_failures += 1;
                let head = state.pop_pending(key);
                let redial = self.schedule_pending(&mut state, key);
                drop(state);

                debug!("Replacement dial for {} failed: {}", key, source);
                if let Some(waiter) = head {
                    let _ = waiter.reply.send(Err(PoolError::Dial {
                        key: key.to_string(),
                        source,
                    }));
                }
                if let Some(options) = redial {
                    self.spawn_dial(key.clone(), options, DialTarget::Queue);
                }
            }
        }
    }

    /// A request finished with its connection.
    pub(crate) fn release(self: &Arc<Self>, key: &BucketKey, generation: u64, reusable: bool) {
        let mut state = self.state.lock();
        let Some(ActiveEntry { id, conn, .. }) = state.take_active(key, generation) else {
            trace!("Ignoring release of untracked connection on {}", key);
            return;
        };

        let conn = if reusable && conn.is_open() {
            match self.place(&mut state, key, id, conn) {
                Some(conn) => conn,
                None => return,
            }
        } else {
            conn
        };

        state.counters.closed += 1;
        let redial = self.schedule_pending(&mut state, key);
        drop(state);

        trace!("Closing released connection #{} to {}", id, key);
        close_quietly(key, id, conn.as_ref());
        if let Some(options) = redial {
            self.spawn_dial(key.clone(), options, DialTarget::Queue);
        }
    }

    /// Single removal point for connections leaving the pool.
    pub(crate) fn evict(self: &Arc<Self>, key: &BucketKey, generation: u64, eviction: Eviction) {
        let mut state = self.state.lock();
        let removed = match eviction {
            Eviction::IdleTimeout | Eviction::IdleFault(_) => state
                .take_idle(key, generation)
                .map(|entry| (entry.id, entry.conn)),
            Eviction::ActiveTimeout => state
                .take_active(key, generation)
                .map(|entry| (entry.id, entry.conn)),
            Eviction::Closed | Eviction::Detached => state
                .take_active(key, generation)
                .map(|entry| (entry.id, entry.conn))
                .or_else(|| {
                    state
                        .take_idle(key, generation)
                        .map(|entry| (entry.id, entry.conn))
                }),
        };

        let Some((id, conn)) = removed else {
            trace!("Ignoring {:?} for untracked connection on {}", eviction, key);
            return;
        };

        match &eviction {
            Eviction::Detached => state.counters.detached += 1,
            Eviction::Closed => state.counters.closed += 1,
            Eviction::ActiveTimeout | Eviction::IdleTimeout => {
                state.counters.timeouts += 1;
                state.counters.closed += 1;
            }
            Eviction::IdleFault(_) => {
                state.counters.idle_faults += 1;
                state.counters.closed += 1;
            }
        }
        let redial = self.schedule_pending(&mut state, key);
        drop(state);

        match eviction {
            Eviction::Detached => {
                trace!("Detached connection #{} from {}", id, key);
            }
            Eviction::IdleFault(source) => {
                let fault = PoolError::IdleConnectionFault {
                    key: key.to_string(),
                    source,
                };
                warn!("Closing idle connection #{}: {}", id, fault);
                close_quietly(key, id, conn.as_ref());
            }
            Eviction::IdleTimeout | Eviction::ActiveTimeout => {
                debug!("Connection #{} to {} timed out", id, key);
                close_quietly(key, id, conn.as_ref());
            }
            Eviction::Closed => {
                trace!("Connection #{} to {} closed", id, key);
                close_quietly(key, id, conn.as_ref());
            }
        }

        if let Some(options) = redial {
            self.spawn_dial(key.clone(), options, DialTarget::Queue);
        }
    }

    fn withdraw(&self, key: &BucketKey, waiter: u64) {
        if self.state.lock().withdraw(key, waiter) {
            trace!("Withdrew queued request #{} from {}", waiter, key);
        }
    }
}

impl<T: Transport> Drop for Shared<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for entry in state.idle.values().flatten() {
            entry.watch.cancel();
        }
        for entry in state.active.values().flatten() {
            if let Some(deadline) = &entry.deadline {
                deadline.cancel();
            }
        }
    }
}

fn bucket_slot<'a>(
    buckets: &'a mut BTreeMap<String, BucketStats>,
    key: &BucketKey,
) -> &'a mut BucketStats {
    let name = key.to_string();
    buckets.entry(name.clone()).or_insert_with(|| BucketStats {
        key: name,
        active: 0,
        idle: 0,
        pending: 0,
        connecting: 0,
    })
}

fn close_quietly<C: Connection>(key: &BucketKey, id: u64, conn: &C) {
    if let Err(err) = conn.close() {
        warn!("Failed to close connection #{} to {}: {}", id, key, err);
    }
}

fn spawn_detached<F>(task: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
            true
        }
        Err(_) => {
            warn!("No tokio runtime available, connection timers are disabled");
            false
        }
    }
}

async fn watch_deadline<T: Transport>(
    shared: Weak<Shared<T>>,
    key: BucketKey,
    generation: u64,
    token: CancellationToken,
    limit: Duration,
) {
    tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(limit) => {
            if let Some(shared) = shared.upgrade() {
                shared.evict(&key, generation, Eviction::ActiveTimeout);
            }
        }
    }
}

async fn watch_idle<T: Transport>(
    shared: Weak<Shared<T>>,
    key: BucketKey,
    generation: u64,
    conn: Arc<T::Connection>,
    token: CancellationToken,
    ttl: Option<Duration>,
) {
    let expiry = async move {
        match ttl {
            Some(ttl) => tokio::time::sleep(ttl).await,
            None => future::pending::<()>().await,
        }
    };
    let fault = future::poll_fn(|cx| conn.poll_idle_fault(cx));

    let eviction = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        _ = expiry => Eviction::IdleTimeout,
        err = fault => Eviction::IdleFault(err),
    };

    if let Some(shared) = shared.upgrade() {
        shared.evict(&key, generation, eviction);
    }
}

/// Removes a queued request from its bucket if the caller stops waiting.
struct PendingGuard<'a, T: Transport> {
    shared: &'a Arc<Shared<T>>,
    key: BucketKey,
    waiter: u64,
    served: bool,
}

impl<T: Transport> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        if !self.served {
            self.shared.withdraw(&self.key, self.waiter);
        }
    }
}

/// Keyed pool of outbound connections.
///
/// Connections are grouped into buckets by [`BucketKey`]. A request first
/// reuses the oldest idle connection of its bucket, then dials a new one if
/// the bucket is under capacity, and otherwise waits in FIFO order until a
/// connection of its bucket is released or closed.
///
/// When `session_token_field` is configured, requests carrying that cookie
/// get their own bucket per token value, limited to a single connection.
pub struct ConnectionPool<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> ConnectionPool<T> {
    pub fn new(config: PoolConfig, transport: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                state: Mutex::new(PoolState::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// Bucket a request would be served from.
    pub fn bucket_key(&self, request: &Request) -> BucketKey {
        BucketKey::for_request(request, self.shared.config.session_field())
    }

    /// Check out a connection for `request`.
    ///
    /// Resolves immediately when an idle connection is available, after the
    /// dial when the bucket has room, and otherwise once a connection of the
    /// bucket frees up. Dropping the future while queued withdraws the request.
    pub async fn acquire(&self, request: &Request) -> Result<Lease<T>> {
        Handle::try_current().map_err(|err| PoolError::Runtime(err.to_string()))?;

        let key = self.bucket_key(request);
        match self.shared.admit(key.clone(), request)? {
            Admission::Ready(lease) => Ok(lease),
            Admission::Dialing(rx) => rx.await.map_err(|_| PoolError::Cancelled)?,
            Admission::Queued { waiter, rx } => {
                let mut guard = PendingGuard {
                    shared: &self.shared,
                    key,
                    waiter,
                    served: false,
                };
                let outcome = rx.await;
                guard.served = true;
                outcome.map_err(|_| PoolError::Cancelled)?
            }
        }
    }

    /// Close every active and idle connection.
    ///
    /// Queued requests are left in place; their callers are expected to give
    /// up on their own. New acquires fail with [`PoolError::Destroyed`].
    pub fn destroy(&self) {
        let doomed: Vec<_> = {
            let mut state = self.shared.state.lock();
            state.destroyed = true;

            let mut doomed = Vec::new();
            for (key, entries) in state.active.drain() {
                for entry in entries {
                    if let Some(deadline) = &entry.deadline {
                        deadline.cancel();
                    }
                    doomed.push((key.clone(), entry.id, entry.conn));
                }
            }
            for (key, entries) in state.idle.drain() {
                for entry in entries {
                    entry.watch.cancel();
                    doomed.push((key.clone(), entry.id, entry.conn));
                }
            }
            state.idle_total = 0;
            state.counters.closed += doomed.len() as u64;
            doomed
        };

        debug!("Destroying pool, closing {} connections", doomed.len());
        for (key, id, conn) in doomed {
            close_quietly(&key, id, conn.as_ref());
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let mut buckets: BTreeMap<String, BucketStats> = BTreeMap::new();
        for (key, entries) in &state.active {
            bucket_slot(&mut buckets, key).active = entries.len();
        }
        for (key, entries) in &state.idle {
            bucket_slot(&mut buckets, key).idle = entries.len();
        }
        for (key, queue) in &state.pending {
            bucket_slot(&mut buckets, key).pending = queue.len();
        }
        for (key, count) in &state.connecting {
            bucket_slot(&mut buckets, key).connecting = *count;
        }

        let buckets: Vec<BucketStats> = buckets.into_values().collect();
        PoolStats {
            captured_at: Utc::now(),
            active: buckets.iter().map(|b| b.active).sum(),
            idle: state.idle_total,
            pending: buckets.iter().map(|b| b.pending).sum(),
            connecting: buckets.iter().map(|b| b.connecting).sum(),
            buckets,
            counters: state.counters,
        }
    }
}
