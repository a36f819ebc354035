//! Bounded pools of connected connector instances, one pool per connection.
//!
//! Bookkeeping (map lookups, bound checks) happens under short locks;
//! `connect`, `poll`, and `disconnect` always run with no pool lock held.
//! A connection whose connector or config changes is refused while any
//! instance of it is checked out.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use harvester_sdk::connector::Connector;
use harvester_state::{StateBackend, StateError};
use harvester_types::connection::{ConfigParams, Connection, ConnectionKind};
use harvester_types::error::ConnectorError;
use harvester_types::state::ConnectionName;

use crate::cancel::{CancellationToken, WAIT_SLICE};

/// Builds an unconnected connector instance.
pub type ConnectorFactory<C> = Arc<dyn Fn() -> Box<C> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connector kind '{kind}' is not installed")]
    ConnectorNotInstalled { kind: String },
    #[error("connection '{0}' does not exist")]
    ConnectionNotValid(ConnectionName),
    #[error("duplicate ordering key '{0}' in multi-grab")]
    DuplicateOrderingKey(String),
    #[error("connection '{connection}' failed to connect: {source}")]
    Connect {
        connection: ConnectionName,
        source: ConnectorError,
    },
    #[error("connection '{connection}' has {in_use} instance(s) checked out")]
    ConnectionInUse {
        connection: ConnectionName,
        in_use: usize,
    },
    #[error("grab cancelled")]
    Cancelled,
    #[error("pool closed")]
    PoolClosed,
    #[error("pool lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    State(#[from] StateError),
}

// ---------------------------------------------------------------------------
// Per-connection pool
// ---------------------------------------------------------------------------

struct Slot<C: ?Sized> {
    connector: Box<C>,
    idle_since: Instant,
}

struct PoolState<C: ?Sized> {
    idle: Vec<Slot<C>>,
    outstanding: usize,
    /// Grabs that resolved this pool and have not yet checked out.
    waiting: usize,
    max: usize,
    closed: bool,
}

struct Pool<C: ?Sized> {
    name: ConnectionName,
    connector_kind: String,
    config: ConfigParams,
    state: Mutex<PoolState<C>>,
    available: Condvar,
}

fn disconnect_quietly<C: ?Sized + Connector>(name: &ConnectionName, connector: &mut C) {
    if let Err(e) = connector.disconnect() {
        tracing::warn!(connection = %name, error = %e, "Disconnect failed");
    }
}

impl<C: ?Sized + Connector> Pool<C> {
    fn new(connection: &Connection) -> Self {
        Self {
            name: connection.name.clone(),
            connector_kind: connection.connector.clone(),
            config: connection.config.clone(),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                outstanding: 0,
                waiting: 0,
                max: connection.max_pool_size.max(1),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState<C>>, PoolError> {
        self.state.lock().map_err(|_| PoolError::LockPoisoned)
    }

    fn matches(&self, connection: &Connection) -> bool {
        self.connector_kind == connection.connector && self.config == connection.config
    }

    fn checkout(
        self: &Arc<Self>,
        factory: &ConnectorFactory<C>,
        cancel: &CancellationToken,
    ) -> Result<PooledConnector<C>, PoolError> {
        let mut state = self.lock()?;
        state.waiting = state.waiting.saturating_sub(1);
        loop {
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            if let Some(slot) = state.idle.pop() {
                state.outstanding += 1;
                return Ok(self.lease(slot.connector));
            }
            if state.outstanding < state.max {
                state.outstanding += 1;
                break;
            }
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            state = self
                .available
                .wait_timeout(state, WAIT_SLICE)
                .map_err(|_| PoolError::LockPoisoned)?
                .0;
        }
        drop(state);

        let mut connector = factory();
        if let Err(source) = connector.connect(&self.config) {
            self.forfeit();
            return Err(PoolError::Connect {
                connection: self.name.clone(),
                source,
            });
        }
        tracing::debug!(connection = %self.name, "Connected new pooled instance");
        Ok(self.lease(connector))
    }

    fn lease(self: &Arc<Self>, connector: Box<C>) -> PooledConnector<C> {
        PooledConnector {
            connector: Some(connector),
            pool: Arc::clone(self),
        }
    }

    /// Give back a reservation that never produced an instance.
    fn forfeit(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        self.available.notify_one();
    }

    fn release(&self, connector: Box<C>) {
        let discard = match self.state.lock() {
            Ok(mut state) => {
                state.outstanding = state.outstanding.saturating_sub(1);
                let keep = !state.closed
                    && connector.is_connected()
                    && state.idle.len() + state.outstanding < state.max;
                let discard = if keep {
                    state.idle.push(Slot {
                        connector,
                        idle_since: Instant::now(),
                    });
                    None
                } else {
                    Some(connector)
                };
                self.available.notify_one();
                discard
            }
            Err(_) => Some(connector),
        };
        if let Some(mut connector) = discard {
            disconnect_quietly(&self.name, &mut *connector);
        }
    }

    /// Mark closed and hand back the idle instances for disconnecting.
    fn close(&self) -> Vec<Box<C>> {
        let idle = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                std::mem::take(&mut state.idle)
            }
            Err(_) => Vec::new(),
        };
        self.available.notify_all();
        idle.into_iter().map(|slot| slot.connector).collect()
    }

    fn take_idle(&self) -> Result<Vec<Slot<C>>, PoolError> {
        Ok(std::mem::take(&mut self.lock()?.idle))
    }

    /// Return polled instances; whatever no longer fits is handed back.
    fn restore_idle(&self, slots: Vec<Slot<C>>) -> Vec<Box<C>> {
        let mut rejected = Vec::new();
        match self.state.lock() {
            Ok(mut state) => {
                for slot in slots {
                    if !state.closed && state.idle.len() + state.outstanding < state.max {
                        state.idle.push(slot);
                    } else {
                        rejected.push(slot.connector);
                    }
                }
            }
            Err(_) => rejected.extend(slots.into_iter().map(|s| s.connector)),
        }
        self.available.notify_all();
        rejected
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A checked-out connector, returned to its pool on drop.
pub struct PooledConnector<C: ?Sized + Connector> {
    connector: Option<Box<C>>,
    pool: Arc<Pool<C>>,
}

impl<C: ?Sized + Connector> PooledConnector<C> {
    #[must_use]
    pub fn connection(&self) -> &ConnectionName {
        &self.pool.name
    }
}

impl<C: ?Sized + Connector> Deref for PooledConnector<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.connector {
            Some(connector) => connector.as_ref(),
            None => unreachable!("connector lease used after release"),
        }
    }
}

impl<C: ?Sized + Connector> DerefMut for PooledConnector<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.connector {
            Some(connector) => connector.as_mut(),
            None => unreachable!("connector lease used after release"),
        }
    }
}

impl<C: ?Sized + Connector> Drop for PooledConnector<C> {
    fn drop(&mut self) {
        if let Some(connector) = self.connector.take() {
            self.pool.release(connector);
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectorPool
// ---------------------------------------------------------------------------

/// Every pool of one connection kind.
pub struct ConnectorPool<C: ?Sized + Connector> {
    kind: ConnectionKind,
    store: Arc<dyn StateBackend>,
    factories: HashMap<String, ConnectorFactory<C>>,
    pools: Mutex<HashMap<ConnectionName, Arc<Pool<C>>>>,
    idle_timeout: Duration,
    closed: AtomicBool,
}

impl<C: ?Sized + Connector> ConnectorPool<C> {
    #[must_use]
    pub fn new(
        kind: ConnectionKind,
        store: Arc<dyn StateBackend>,
        factories: HashMap<String, ConnectorFactory<C>>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            store,
            factories,
            pools: Mutex::new(HashMap::new()),
            idle_timeout,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    #[must_use]
    pub fn is_installed(&self, connector_kind: &str) -> bool {
        self.factories.contains_key(connector_kind)
    }

    fn pools(&self) -> Result<MutexGuard<'_, HashMap<ConnectionName, Arc<Pool<C>>>>, PoolError> {
        self.pools.lock().map_err(|_| PoolError::LockPoisoned)
    }

    /// The pool for `connection` in `pools`, replacing one built for a
    /// configuration changed behind the engine's back. Idle instances of
    /// the replaced pool are returned for disconnecting.
    fn pool_in(
        pools: &mut HashMap<ConnectionName, Arc<Pool<C>>>,
        connection: &Connection,
    ) -> Result<(Arc<Pool<C>>, Vec<Box<C>>), PoolError> {
        match pools.get(&connection.name) {
            Some(existing) if existing.matches(connection) => {
                existing.lock()?.max = connection.max_pool_size.max(1);
                Ok((Arc::clone(existing), Vec::new()))
            }
            existing => {
                let stale = existing.map(|old| old.close()).unwrap_or_default();
                let pool = Arc::new(Pool::new(connection));
                pools.insert(connection.name.clone(), Arc::clone(&pool));
                Ok((pool, stale))
            }
        }
    }

    /// Run `save` for a new version of `connection` while no grab of this
    /// kind can resolve a pool. A changed connector or config is refused
    /// with `ConnectionInUse` while instances are checked out; once `save`
    /// succeeds the old pool is closed.
    ///
    /// # Errors
    ///
    /// `ConnectionInUse`, poisoned locks, or whatever `save` returns.
    pub fn reconfigure<T>(
        &self,
        connection: &Connection,
        save: impl FnOnce() -> Result<T, PoolError>,
    ) -> Result<T, PoolError> {
        let (result, retired) = {
            let mut pools = self.pools()?;
            let changed = match pools.get(&connection.name) {
                Some(pool) if connection.kind != self.kind || !pool.matches(connection) => {
                    let state = pool.lock()?;
                    let in_use = state.outstanding + state.waiting;
                    if in_use > 0 {
                        return Err(PoolError::ConnectionInUse {
                            connection: connection.name.clone(),
                            in_use,
                        });
                    }
                    true
                }
                _ => false,
            };
            let result = save()?;
            let retired = if changed {
                pools
                    .remove(&connection.name)
                    .map(|pool| pool.close())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            (result, retired)
        };
        for mut connector in retired {
            disconnect_quietly(&connection.name, &mut *connector);
        }
        Ok(result)
    }

    /// Check out a connector for `name`, blocking while the pool is at its
    /// bound.
    ///
    /// # Errors
    ///
    /// `ConnectionNotValid`, `ConnectorNotInstalled`, `Connect`,
    /// `Cancelled`, or `PoolClosed`.
    pub fn grab(
        &self,
        name: &ConnectionName,
        cancel: &CancellationToken,
    ) -> Result<PooledConnector<C>, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::PoolClosed);
        }
        let (pool, factory, stale) = {
            let mut pools = self.pools()?;
            // Read under the map lock so `reconfigure` cannot land between
            // the read and the `waiting` reservation.
            let connection = self
                .store
                .load_connection(name)?
                .filter(|c| c.kind == self.kind)
                .ok_or_else(|| PoolError::ConnectionNotValid(name.clone()))?;
            let factory = self.factories.get(&connection.connector).ok_or_else(|| {
                PoolError::ConnectorNotInstalled {
                    kind: connection.connector.clone(),
                }
            })?;
            let (pool, stale) = Self::pool_in(&mut pools, &connection)?;
            pool.lock()?.waiting += 1;
            (pool, Arc::clone(factory), stale)
        };
        for mut connector in stale {
            disconnect_quietly(name, &mut *connector);
        }
        pool.checkout(&factory, cancel)
    }

    /// Check out several connectors in ascending `ordering_key` order.
    /// Results come back in request order.
    ///
    /// # Errors
    ///
    /// `DuplicateOrderingKey`, or any [`grab`](Self::grab) error; leases
    /// already taken are released first.
    pub fn grab_multiple(
        &self,
        requests: &[(String, ConnectionName)],
        cancel: &CancellationToken,
    ) -> Result<Vec<PooledConnector<C>>, PoolError> {
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by(|&a, &b| requests[a].0.cmp(&requests[b].0));
        for pair in order.windows(2) {
            if requests[pair[0]].0 == requests[pair[1]].0 {
                return Err(PoolError::DuplicateOrderingKey(requests[pair[0]].0.clone()));
            }
        }

        let mut taken: Vec<(usize, PooledConnector<C>)> = Vec::with_capacity(requests.len());
        for index in order {
            // On error `taken` drops here, releasing earlier leases.
            let lease = self.grab(&requests[index].1, cancel)?;
            taken.push((index, lease));
        }
        taken.sort_by_key(|(index, _)| *index);
        Ok(taken.into_iter().map(|(_, lease)| lease).collect())
    }

    /// Instances currently checked out for `name`.
    #[must_use]
    pub fn outstanding(&self, name: &ConnectionName) -> usize {
        let Ok(pools) = self.pools.lock() else {
            return 0;
        };
        pools
            .get(name)
            .and_then(|pool| pool.state.lock().ok().map(|s| s.outstanding))
            .unwrap_or(0)
    }

    /// Poll every idle instance, disconnect those idle past the timeout,
    /// and close pools whose connection is gone or reconfigured.
    ///
    /// # Errors
    ///
    /// Store failures and poisoned locks.
    pub fn poll_idle(&self) -> Result<(), PoolError> {
        let snapshot: Vec<Arc<Pool<C>>> = self.pools()?.values().cloned().collect();
        for pool in snapshot {
            let current = self
                .store
                .load_connection(&pool.name)?
                .filter(|c| c.kind == self.kind && pool.matches(c));
            if current.is_none() {
                self.retire(&pool)?;
                continue;
            }

            let mut kept = Vec::new();
            for mut slot in pool.take_idle()? {
                if slot.idle_since.elapsed() >= self.idle_timeout {
                    tracing::debug!(connection = %pool.name, "Disconnecting idle instance");
                    disconnect_quietly(&pool.name, &mut *slot.connector);
                    continue;
                }
                match slot.connector.poll() {
                    Ok(()) if slot.connector.is_connected() => kept.push(slot),
                    Ok(()) => disconnect_quietly(&pool.name, &mut *slot.connector),
                    Err(e) => {
                        tracing::warn!(connection = %pool.name, error = %e, "Idle poll failed, discarding instance");
                        disconnect_quietly(&pool.name, &mut *slot.connector);
                    }
                }
            }
            for mut connector in pool.restore_idle(kept) {
                disconnect_quietly(&pool.name, &mut *connector);
            }
        }
        Ok(())
    }

    fn retire(&self, pool: &Arc<Pool<C>>) -> Result<(), PoolError> {
        {
            let mut pools = self.pools()?;
            if pools.get(&pool.name).is_some_and(|p| Arc::ptr_eq(p, pool)) {
                pools.remove(&pool.name);
            }
        }
        tracing::info!(connection = %pool.name, "Closing pool for removed or changed connection");
        for mut connector in pool.close() {
            disconnect_quietly(&pool.name, &mut *connector);
        }
        Ok(())
    }

    /// Disconnect every idle instance; pools stay open.
    ///
    /// # Errors
    ///
    /// Poisoned locks.
    pub fn flush_unused(&self) -> Result<(), PoolError> {
        let snapshot: Vec<Arc<Pool<C>>> = self.pools()?.values().cloned().collect();
        for pool in snapshot {
            for mut slot in pool.take_idle()? {
                disconnect_quietly(&pool.name, &mut *slot.connector);
            }
        }
        Ok(())
    }

    /// Close every pool. Blocked grabbers wake with `PoolClosed`; leases
    /// still out are disconnected when they come back.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<Pool<C>>> = match self.pools.lock() {
            Ok(mut pools) => pools.drain().map(|(_, pool)| pool).collect(),
            Err(_) => Vec::new(),
        };
        for pool in drained {
            for mut connector in pool.close() {
                disconnect_quietly(&pool.name, &mut *connector);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_state::SqliteStateBackend;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        polls: AtomicUsize,
    }

    struct Probe {
        counters: Arc<Counters>,
        fail_connect: bool,
    }

    impl Connector for Probe {
        fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
            if self.fail_connect {
                return Err(ConnectorError::transient_network("DOWN", "unreachable"));
            }
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), ConnectorError> {
            self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn poll(&mut self) -> Result<(), ConnectorError> {
            self.counters.polls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<SqliteStateBackend>,
        pool: ConnectorPool<dyn Connector>,
        counters: Arc<Counters>,
    }

    fn fixture(idle_timeout: Duration) -> Fixture {
        let store = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let counters = Arc::new(Counters::default());
        let mut factories: HashMap<String, ConnectorFactory<dyn Connector>> = HashMap::new();
        let c = Arc::clone(&counters);
        factories.insert(
            "probe".into(),
            Arc::new(move || {
                Box::new(Probe {
                    counters: Arc::clone(&c),
                    fail_connect: false,
                }) as Box<dyn Connector>
            }),
        );
        factories.insert(
            "broken".into(),
            Arc::new(|| {
                Box::new(Probe {
                    counters: Arc::default(),
                    fail_connect: true,
                }) as Box<dyn Connector>
            }),
        );
        let pool = ConnectorPool::new(
            ConnectionKind::Repository,
            store.clone(),
            factories,
            idle_timeout,
        );
        Fixture {
            store,
            pool,
            counters,
        }
    }

    fn save(store: &SqliteStateBackend, name: &str, connector: &str, max: usize) {
        store
            .save_connection(
                &Connection::new(name, ConnectionKind::Repository, connector)
                    .with_max_pool_size(max),
            )
            .unwrap();
    }

    #[test]
    fn released_instance_is_reused() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "a", "probe", 2);
        let cancel = CancellationToken::new();
        drop(f.pool.grab(&"a".into(), &cancel).unwrap());
        let lease = f.pool.grab(&"a".into(), &cancel).unwrap();
        assert_eq!(lease.connection().as_str(), "a");
        assert_eq!(f.counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(f.pool.outstanding(&"a".into()), 1);
    }

    #[test]
    fn unknown_connection_and_kind() {
        let f = fixture(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        assert!(matches!(
            f.pool.grab(&"missing".into(), &cancel),
            Err(PoolError::ConnectionNotValid(_))
        ));
        save(&f.store, "ftp", "ftp", 1);
        assert!(matches!(
            f.pool.grab(&"ftp".into(), &cancel),
            Err(PoolError::ConnectorNotInstalled { kind }) if kind == "ftp"
        ));
    }

    #[test]
    fn failed_connect_frees_the_reservation() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "b", "broken", 1);
        let cancel = CancellationToken::new();
        assert!(matches!(
            f.pool.grab(&"b".into(), &cancel),
            Err(PoolError::Connect { .. })
        ));
        assert_eq!(f.pool.outstanding(&"b".into()), 0);
    }

    #[test]
    fn grab_at_bound_blocks_until_release() {
        let f = Arc::new(fixture(Duration::from_secs(60)));
        save(&f.store, "a", "probe", 1);
        let cancel = CancellationToken::new();
        let first = f.pool.grab(&"a".into(), &cancel).unwrap();

        let waiter = {
            let f = Arc::clone(&f);
            let cancel = cancel.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let lease = f.pool.grab(&"a".into(), &cancel).map(|_| ());
                (lease.is_ok(), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(100));
        drop(first);
        let (ok, waited) = waiter.join().unwrap();
        assert!(ok);
        assert!(waited >= Duration::from_millis(90));
    }

    #[test]
    fn cancelled_grab_at_bound() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "a", "probe", 1);
        let cancel = CancellationToken::new();
        let _held = f.pool.grab(&"a".into(), &cancel).unwrap();
        cancel.cancel();
        assert!(matches!(
            f.pool.grab(&"a".into(), &cancel),
            Err(PoolError::Cancelled)
        ));
    }

    #[test]
    fn grab_multiple_returns_request_order_and_rejects_duplicates() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "a", "probe", 1);
        save(&f.store, "b", "probe", 1);
        let cancel = CancellationToken::new();
        let leases = f
            .pool
            .grab_multiple(
                &[("2".into(), "b".into()), ("1".into(), "a".into())],
                &cancel,
            )
            .unwrap();
        assert_eq!(leases[0].connection().as_str(), "b");
        assert_eq!(leases[1].connection().as_str(), "a");
        drop(leases);

        assert!(matches!(
            f.pool.grab_multiple(
                &[("k".into(), "a".into()), ("k".into(), "b".into())],
                &cancel
            ),
            Err(PoolError::DuplicateOrderingKey(k)) if k == "k"
        ));
    }

    #[test]
    fn grab_multiple_failure_releases_earlier_leases() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "a", "probe", 1);
        let cancel = CancellationToken::new();
        let result = f.pool.grab_multiple(
            &[("1".into(), "a".into()), ("2".into(), "gone".into())],
            &cancel,
        );
        assert!(matches!(result, Err(PoolError::ConnectionNotValid(_))));
        assert_eq!(f.pool.outstanding(&"a".into()), 0);
    }

    #[test]
    fn close_all_wakes_blocked_grabber() {
        let f = Arc::new(fixture(Duration::from_secs(60)));
        save(&f.store, "a", "probe", 1);
        let cancel = CancellationToken::new();
        let held = f.pool.grab(&"a".into(), &cancel).unwrap();
        let waiter = {
            let f = Arc::clone(&f);
            thread::spawn(move || f.pool.grab(&"a".into(), &CancellationToken::new()).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        f.pool.close_all();
        assert!(matches!(waiter.join().unwrap(), Err(PoolError::PoolClosed)));
        drop(held);
        // Returned after close: disconnected rather than pooled.
        assert_eq!(f.counters.disconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(
            f.pool.grab(&"a".into(), &cancel),
            Err(PoolError::PoolClosed)
        ));
    }

    #[test]
    fn poll_idle_polls_and_expires() {
        let f = fixture(Duration::from_millis(30));
        save(&f.store, "a", "probe", 2);
        let cancel = CancellationToken::new();
        drop(f.pool.grab(&"a".into(), &cancel).unwrap());
        f.pool.poll_idle().unwrap();
        assert_eq!(f.counters.polls.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.disconnects.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(40));
        f.pool.poll_idle().unwrap();
        assert_eq!(f.counters.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn poll_idle_closes_pool_of_deleted_connection() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "a", "probe", 2);
        let cancel = CancellationToken::new();
        drop(f.pool.grab(&"a".into(), &cancel).unwrap());
        assert!(f.store.delete_connection(&"a".into()).unwrap());
        f.pool.poll_idle().unwrap();
        assert_eq!(f.counters.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn changed_config_gets_a_fresh_pool() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "a", "probe", 2);
        let cancel = CancellationToken::new();
        drop(f.pool.grab(&"a".into(), &cancel).unwrap());
        f.store
            .save_connection(
                &Connection::new("a", ConnectionKind::Repository, "probe")
                    .with_config(ConfigParams::new().with("root", "/other")),
            )
            .unwrap();
        drop(f.pool.grab(&"a".into(), &cancel).unwrap());
        assert_eq!(f.counters.connects.load(Ordering::SeqCst), 2);
        assert_eq!(f.counters.disconnects.load(Ordering::SeqCst), 1);
    }

    fn edited(max: usize) -> Connection {
        Connection::new("a", ConnectionKind::Repository, "probe")
            .with_config(ConfigParams::new().with("root", "/other"))
            .with_max_pool_size(max)
    }

    fn save_through(f: &Fixture, connection: &Connection) -> Result<(), PoolError> {
        f.pool
            .reconfigure(connection, || Ok(f.store.save_connection(connection)?))
    }

    #[test]
    fn config_edit_refused_while_checked_out() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "a", "probe", 1);
        let cancel = CancellationToken::new();
        let held = f.pool.grab(&"a".into(), &cancel).unwrap();

        assert!(matches!(
            save_through(&f, &edited(1)),
            Err(PoolError::ConnectionInUse { in_use: 1, .. })
        ));
        // The stored config is untouched, so the bound still holds.
        let stored = f.store.load_connection(&"a".into()).unwrap().unwrap();
        assert!(stored.config.is_empty());
        let blocked = CancellationToken::new();
        blocked.cancel();
        assert!(matches!(
            f.pool.grab(&"a".into(), &blocked),
            Err(PoolError::Cancelled)
        ));

        drop(held);
        save_through(&f, &edited(1)).unwrap();
        // The old pool's idle instance went with it.
        assert_eq!(f.counters.disconnects.load(Ordering::SeqCst), 1);
        drop(f.pool.grab(&"a".into(), &cancel).unwrap());
        assert_eq!(f.counters.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unchanged_config_saves_while_checked_out() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "a", "probe", 1);
        let cancel = CancellationToken::new();
        let held = f.pool.grab(&"a".into(), &cancel).unwrap();
        let resized = Connection::new("a", ConnectionKind::Repository, "probe").with_max_pool_size(2);
        save_through(&f, &resized).unwrap();

        let second = f.pool.grab(&"a".into(), &cancel).unwrap();
        assert_eq!(f.pool.outstanding(&"a".into()), 2);
        drop((held, second));
        assert_eq!(f.counters.disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn flush_unused_disconnects_idle() {
        let f = fixture(Duration::from_secs(60));
        save(&f.store, "a", "probe", 2);
        let cancel = CancellationToken::new();
        drop(f.pool.grab(&"a".into(), &cancel).unwrap());
        f.pool.flush_unused().unwrap();
        assert_eq!(f.counters.disconnects.load(Ordering::SeqCst), 1);
        drop(f.pool.grab(&"a".into(), &cancel).unwrap());
        assert_eq!(f.counters.connects.load(Ordering::SeqCst), 2);
    }
}
