/// Connection Pool Module
///
/// A [`ConnectionPool`] keeps a set of backend sessions to one database URL
/// and hands them out as [`Connection`]s. All pool bookkeeping sits behind a
/// single mutex; callers waiting for a free connection block on a condition
/// variable until one is returned or their checkout timeout expires.
///
/// ## Sizing
///
/// - `start()` opens `initial_connections` sessions
/// - checkout grows the pool on demand up to `max_connections`
/// - the optional reaper closes idle sessions that outlived
///   `connection_timeout`, never shrinking below the initial size
///
/// ## Lock order
///
/// Pool state is always locked before a session handle. A [`Connection`]
/// releases its handle before it touches the pool.
use crate::core::backend::{default_registry, BackendConnection, BackendError, Driver, DriverRegistry};
use crate::core::db::connection::{close_handle, BackendHandle, Connection, ConnectionSettings};
use crate::core::db::reaper::Reaper;
use crate::core::url::Url;
use crate::core::{DbError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Called with the error message when a backend fails fatally.
pub type AbortHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub const DEFAULT_INITIAL_CONNECTIONS: usize = 5;
pub const DEFAULT_MAX_CONNECTIONS: usize = 20;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool sizing and timing.
///
/// Changes made through the pool's setters apply from the next `start()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub initial_connections: usize,
    pub max_connections: usize,
    /// Idle time after which the reaper may close a connection
    pub connection_timeout: Duration,
    /// How long `get_connection` waits for a free connection
    pub checkout_timeout: Duration,
    /// Reaper sweep interval, `None` to disable the reaper
    pub reaper_interval: Option<Duration>,
    pub connection: ConnectionSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_connections: DEFAULT_INITIAL_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
            reaper_interval: None,
            connection: ConnectionSettings::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(initial_connections: usize, max_connections: usize) -> Self {
        PoolConfig {
            initial_connections,
            max_connections,
            ..Default::default()
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn with_reaper(mut self, interval: Duration) -> Self {
        self.reaper_interval = Some(interval);
        self
    }

    pub fn with_connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection = settings;
        self
    }

    /// Checks the sizing constraints `start()` relies on.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(DbError::Config("max connections must be at least 1".to_string()));
        }
        if self.initial_connections > self.max_connections {
            return Err(DbError::Config(format!(
                "initial connections ({}) exceeds max connections ({})",
                self.initial_connections, self.max_connections
            )));
        }
        if self.reaper_interval == Some(Duration::ZERO) {
            return Err(DbError::Config("reaper interval must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Active,
}

struct ConnectionSlot {
    id: u64,
    handle: BackendHandle,
    state: SlotState,
    last_returned_at: Instant,
}

struct PoolState {
    /// Configuration for the next start
    pending: PoolConfig,
    /// Configuration of the running pool
    active: PoolConfig,
    slots: Vec<ConnectionSlot>,
    started: bool,
    next_id: u64,
    abort_handler: Option<AbortHandler>,
}

impl PoolState {
    fn add_slot(&mut self, backend: Box<dyn BackendConnection>, state: SlotState) -> (u64, BackendHandle) {
        self.next_id += 1;
        let handle: BackendHandle = Arc::new(Mutex::new(Some(backend)));
        self.slots.push(ConnectionSlot {
            id: self.next_id,
            handle: Arc::clone(&handle),
            state,
            last_returned_at: Instant::now(),
        });
        (self.next_id, handle)
    }

    /// Claims the most recently returned idle slot whose session still
    /// answers a ping. Dead idle sessions are closed and dropped.
    fn checkout_idle(&mut self) -> Option<(u64, BackendHandle)> {
        loop {
            let pos = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state == SlotState::Idle)
                .max_by_key(|(_, s)| s.last_returned_at)
                .map(|(pos, _)| pos)?;
            let alive = self.slots[pos]
                .handle
                .lock()
                .as_mut()
                .map_or(false, |backend| backend.ping());
            if alive {
                let slot = &mut self.slots[pos];
                slot.state = SlotState::Active;
                return Some((slot.id, Arc::clone(&slot.handle)));
            }
            let slot = self.slots.remove(pos);
            warn!(connection = slot.id, "discarding dead idle connection");
            close_handle(&slot.handle);
        }
    }

    fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state == SlotState::Active).count()
    }
}

/// State shared by the pool, its connections and the reaper thread.
pub(crate) struct PoolShared {
    url: Url,
    driver: Arc<dyn Driver>,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl PoolShared {
    /// Marks a slot idle again, or closes the session if the slot is gone.
    pub(crate) fn return_connection(&self, slot_id: u64, handle: &BackendHandle) {
        let found = {
            let mut state = self.state.lock();
            match state.slots.iter_mut().find(|s| s.id == slot_id) {
                Some(slot) => {
                    slot.state = SlotState::Idle;
                    slot.last_returned_at = Instant::now();
                    true
                }
                None => false,
            }
        };
        if found {
            debug!(connection = slot_id, "connection returned");
            self.returned.notify_one();
        } else {
            close_handle(handle);
        }
    }

    /// Hands a fatal backend error to the abort handler.
    pub(crate) fn report_fatal(&self, message: &str) {
        let handler = self.state.lock().abort_handler.clone();
        match handler {
            Some(handler) => handler(message),
            None => error!("fatal database error: {}", message),
        }
    }

    fn connect_failed(&self, err: BackendError) -> DbError {
        let message = format!("failed to open {} connection: {}", self.url.scheme(), err);
        self.report_fatal(&message);
        DbError::Connection(message)
    }

    /// One reaper sweep. Returns the number of sessions closed.
    pub(crate) fn reap(&self) -> usize {
        let victims = {
            let mut state = self.state.lock();
            if !state.started {
                return 0;
            }
            let active = state.active_count();
            let mut reapable = state
                .slots
                .len()
                .saturating_sub(active + state.active.initial_connections);
            if reapable == 0 {
                return 0;
            }
            let timeout = state.active.connection_timeout;
            let now = Instant::now();
            let mut idle: Vec<(Instant, u64)> = state
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Idle)
                .map(|s| (s.last_returned_at, s.id))
                .collect();
            idle.sort();

            let mut victims = Vec::new();
            for (returned_at, id) in idle {
                if reapable == 0 {
                    break;
                }
                let Some(pos) = state.slots.iter().position(|s| s.id == id) else {
                    continue;
                };
                let expired = now.duration_since(returned_at) > timeout;
                let dead = !expired
                    && !state.slots[pos]
                        .handle
                        .lock()
                        .as_mut()
                        .map_or(false, |backend| backend.ping());
                if expired || dead {
                    victims.push(state.slots.remove(pos));
                    reapable -= 1;
                }
            }
            victims
        };
        for slot in &victims {
            close_handle(&slot.handle);
        }
        victims.len()
    }
}

/// A thread-safe pool of database connections.
///
/// # Example
///
/// ```no_run
/// use dbkit::{ConnectionPool, Url};
///
/// let url = Url::parse("sqlite:///tmp/app.db")?;
/// let pool = ConnectionPool::new(url)?;
/// pool.start()?;
/// let con = pool.get_connection()?;
/// con.execute("create table if not exists t (id integer)", &[])?;
/// # Ok::<(), dbkit::DbError>(())
/// ```
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<Reaper>>,
}

impl ConnectionPool {
    /// Creates a stopped pool using the driver registered for the URL's scheme.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if no driver is available for the scheme.
    pub fn new(url: Url) -> Result<Self> {
        Self::with_registry(url, default_registry())
    }

    /// Creates a stopped pool with settings taken from `config`.
    pub fn with_config(url: Url, config: PoolConfig) -> Result<Self> {
        let pool = Self::new(url)?;
        pool.configure(config);
        Ok(pool)
    }

    pub fn with_registry(url: Url, registry: &DriverRegistry) -> Result<Self> {
        let driver = registry.get(url.scheme()).ok_or_else(|| {
            DbError::Connection(format!("no driver available for '{}' URLs", url.scheme()))
        })?;
        Self::with_driver(url, driver)
    }

    pub fn with_driver(url: Url, driver: Arc<dyn Driver>) -> Result<Self> {
        if driver.scheme() != url.scheme() {
            return Err(DbError::Connection(format!(
                "driver for '{}' cannot open '{}' URLs",
                driver.scheme(),
                url.scheme()
            )));
        }
        let config = PoolConfig::default();
        Ok(ConnectionPool {
            shared: Arc::new(PoolShared {
                url,
                driver,
                state: Mutex::new(PoolState {
                    pending: config.clone(),
                    active: config,
                    slots: Vec::new(),
                    started: false,
                    next_id: 0,
                    abort_handler: None,
                }),
                returned: Condvar::new(),
            }),
            reaper: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Replaces the configuration used by the next `start()`.
    pub fn configure(&self, config: PoolConfig) {
        self.shared.state.lock().pending = config;
    }

    /// Configuration for the next `start()`.
    pub fn config(&self) -> PoolConfig {
        self.shared.state.lock().pending.clone()
    }

    pub fn set_initial_connections(&self, n: usize) {
        self.shared.state.lock().pending.initial_connections = n;
    }

    pub fn initial_connections(&self) -> usize {
        self.shared.state.lock().pending.initial_connections
    }

    pub fn set_max_connections(&self, n: usize) {
        self.shared.state.lock().pending.max_connections = n;
    }

    pub fn max_connections(&self) -> usize {
        self.shared.state.lock().pending.max_connections
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.shared.state.lock().pending.connection_timeout = timeout;
    }

    pub fn connection_timeout(&self) -> Duration {
        self.shared.state.lock().pending.connection_timeout
    }

    pub fn set_checkout_timeout(&self, timeout: Duration) {
        self.shared.state.lock().pending.checkout_timeout = timeout;
    }

    pub fn checkout_timeout(&self) -> Duration {
        self.shared.state.lock().pending.checkout_timeout
    }

    pub fn set_connection_settings(&self, settings: ConnectionSettings) {
        self.shared.state.lock().pending.connection = settings;
    }

    /// Installs the callback for fatal backend errors. Takes effect immediately.
    pub fn set_abort_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.shared.state.lock().abort_handler = Some(Arc::new(handler));
    }

    /// Enables the reaper. On a running pool the reaper is (re)started now.
    pub fn set_reaper(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(DbError::Config("reaper interval must be greater than zero".to_string()));
        }
        let started = {
            let mut state = self.shared.state.lock();
            state.pending.reaper_interval = Some(interval);
            if state.started {
                state.active.reaper_interval = Some(interval);
            }
            state.started
        };
        if started {
            self.start_reaper(interval)?;
        }
        Ok(())
    }

    pub fn reaper_interval(&self) -> Option<Duration> {
        self.shared.state.lock().pending.reaper_interval
    }

    /// Opens the initial connections and starts the reaper if configured.
    ///
    /// Either every initial connection opens or none stays open. Starting a
    /// running pool does nothing.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Config` for an invalid configuration and
    /// `DbError::Connection` if a session cannot be opened.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let (size, reaper_interval) = {
            let mut state = shared.state.lock();
            if state.started {
                return Ok(());
            }
            let config = state.pending.clone();
            config.validate()?;

            let mut opened = Vec::with_capacity(config.initial_connections);
            for _ in 0..config.initial_connections {
                match shared.driver.connect(&shared.url) {
                    Ok(backend) => opened.push(backend),
                    Err(e) => {
                        for mut backend in opened {
                            backend.close();
                        }
                        drop(state);
                        return Err(shared.connect_failed(e));
                    }
                }
            }
            for backend in opened {
                state.add_slot(backend, SlotState::Idle);
            }
            let reaper_interval = config.reaper_interval;
            state.active = config;
            state.started = true;
            (state.slots.len(), reaper_interval)
        };

        if let Some(interval) = reaper_interval {
            if let Err(e) = self.start_reaper(interval) {
                self.stop();
                return Err(e);
            }
        }
        info!(url = %shared.url.scheme(), size, "connection pool started");
        Ok(())
    }

    fn start_reaper(&self, interval: Duration) -> Result<()> {
        let mut reaper = self.reaper.lock();
        if let Some(old) = reaper.take() {
            old.stop();
        }
        *reaper = Some(Reaper::spawn(Arc::downgrade(&self.shared), interval)?);
        debug!(?interval, "reaper scheduled");
        Ok(())
    }

    /// Stops the reaper and closes every session, including those still
    /// checked out. Outstanding connections fail on their next operation.
    pub fn stop(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.stop();
        }
        let slots = {
            let mut state = self.shared.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            std::mem::take(&mut state.slots)
        };
        self.shared.returned.notify_all();

        let active = slots.iter().filter(|s| s.state == SlotState::Active).count();
        if active > 0 {
            warn!(active, "stopping pool with connections still checked out");
        }
        for slot in &slots {
            close_handle(&slot.handle);
        }
        info!(closed = slots.len(), "connection pool stopped");
    }

    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Checks out a connection, waiting up to the configured checkout timeout.
    pub fn get_connection(&self) -> Result<Connection> {
        let timeout = self.shared.state.lock().active.checkout_timeout;
        self.get_connection_timeout(timeout)
    }

    /// Checks out a connection, waiting up to `timeout` for one to free up.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the pool is not started, a new
    /// session cannot be opened, or no connection frees up in time.
    pub fn get_connection_timeout(&self, timeout: Duration) -> Result<Connection> {
        let shared = &self.shared;
        let deadline = Instant::now().checked_add(timeout);
        let mut state = shared.state.lock();
        let mut expired = false;
        loop {
            if !state.started {
                return Err(DbError::Connection("connection pool is not started".to_string()));
            }
            let idle = state.checkout_idle();
            if let Some((id, handle)) = idle {
                let settings = state.active.connection.clone();
                drop(state);
                return Ok(Connection::new(Arc::clone(shared), id, handle, &settings));
            }
            if state.slots.len() < state.active.max_connections {
                match shared.driver.connect(&shared.url) {
                    Ok(backend) => {
                        let (id, handle) = state.add_slot(backend, SlotState::Active);
                        let settings = state.active.connection.clone();
                        let size = state.slots.len();
                        drop(state);
                        debug!(connection = id, size, "pool grew");
                        return Ok(Connection::new(Arc::clone(shared), id, handle, &settings));
                    }
                    Err(e) => {
                        drop(state);
                        return Err(shared.connect_failed(e));
                    }
                }
            }
            if expired {
                warn!(?timeout, size = state.slots.len(), "checkout timed out");
                return Err(DbError::Connection(format!(
                    "no connection available within {:?}, all {} connections are in use",
                    timeout,
                    state.slots.len()
                )));
            }
            expired = match deadline {
                Some(deadline) => shared.returned.wait_until(&mut state, deadline).timed_out(),
                None => {
                    shared.returned.wait(&mut state);
                    false
                }
            };
        }
    }

    /// Number of sessions held by the pool.
    pub fn size(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// Number of sessions currently checked out.
    pub fn active(&self) -> usize {
        self.shared.state.lock().active_count()
    }

    /// Runs one reaper sweep now. Returns the number of sessions closed.
    pub fn reap(&self) -> usize {
        self.shared.reap()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ConnectionPool")
            .field("scheme", &self.shared.url.scheme())
            .field("started", &state.started)
            .field("size", &state.slots.len())
            .field("active", &state.active_count())
            .finish()
    }
}
