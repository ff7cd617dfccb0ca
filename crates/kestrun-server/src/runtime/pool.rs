//! Runspace pool
//!
//! A bounded set of reusable [`Runspace`](crate::runtime::Runspace)s handed
//! out one caller at a time.
//!
//! # Sizing
//!
//! The pool pre-warms `min_runspaces` at creation, grows lazily up to
//! `max_runspaces` on demand and never shrinks. A runspace that breaks is
//! discarded and replaced lazily by a later acquire.
//!
//! # Concurrency
//!
//! Capacity is a fair (FIFO) tokio semaphore with `max_runspaces` permits,
//! so waiters are served in arrival order and never spin. The idle queue and
//! in-use set sit behind one `std::sync::Mutex` that is never held across an
//! `.await`. A [`RunspaceLease`] owns both its runspace and its permit:
//! dropping it on any path (success, error, cancellation) returns the
//! runspace before the permit is released.
//!
//! A lease dropped mid-script cannot stop the script, so its permit is
//! parked on the runspace thread instead and comes back only when that
//! thread exits. Live runspace threads therefore never outnumber
//! `max_runspaces`, even while discarded scripts are still winding down.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use kestrun_common::{KestrunError, Result};

use crate::resource_limits::ResourceLimits;
use crate::runtime::runspace::{Runspace, RunspaceHandle};
use crate::shared_state::SharedStateStore;

/// Configuration for the runspace pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Runspaces created up front
    pub min_runspaces: usize,
    /// Upper bound on runspaces alive at once
    pub max_runspaces: usize,
    /// How long `acquire` may wait, `None` to wait indefinitely
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            min_runspaces: 1,
            max_runspaces: cores * 2,
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn new(min_runspaces: usize, max_runspaces: usize) -> Self {
        Self {
            min_runspaces,
            max_runspaces,
            acquire_timeout: None,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Validates the pool bounds.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `max_runspaces` is zero, `min_runspaces` exceeds
    /// it, or the acquire timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_runspaces == 0 {
            return Err(KestrunError::Config("max_runspaces must be at least 1".into()));
        }
        if self.min_runspaces > self.max_runspaces {
            return Err(KestrunError::Config(format!(
                "min_runspaces ({}) must not exceed max_runspaces ({})",
                self.min_runspaces, self.max_runspaces
            )));
        }
        if self.acquire_timeout.is_some_and(|t| t.is_zero()) {
            return Err(KestrunError::Config("acquire_timeout must be greater than zero".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<RunspaceHandle>,
    in_use: HashSet<u64>,
    disposed: bool,
}

struct PoolInner {
    config: PoolConfig,
    limits: ResourceLimits,
    shared: Arc<SharedStateStore>,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a runspace from a finished lease. Runs before the lease's
    /// permit is released.
    fn give_back(&self, handle: RunspaceHandle, broken: bool) {
        let id = handle.id();
        let mut state = self.lock();

        if !state.in_use.remove(&id) {
            tracing::error!(runspace = id, "Released runspace was not in use, discarding it");
            return;
        }

        if state.disposed {
            tracing::debug!(runspace = id, "Pool disposed, closing released runspace");
        } else if broken || handle.is_poisoned() {
            tracing::warn!(runspace = id, "Discarding broken runspace");
        } else {
            state.idle.push_back(handle);
        }
    }
}

enum Slot {
    Idle(RunspaceHandle),
    Reserved(u64),
}

/// Undoes an id reservation if runspace creation fails or is cancelled.
struct Reservation<'a> {
    pool: &'a PoolInner,
    id: u64,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.lock().in_use.remove(&self.id);
        }
    }
}

/// Bounded pool of runspaces.
///
/// Cloning is cheap and every clone refers to the same pool.
///
/// # Example
///
/// ```no_run
/// use kestrun_server::{PoolConfig, ResourceLimits, RunspacePool, SharedStateStore};
/// use std::sync::Arc;
///
/// # async fn demo() -> kestrun_common::Result<()> {
/// let pool = RunspacePool::new(
///     PoolConfig::new(1, 4),
///     ResourceLimits::default(),
///     Arc::new(SharedStateStore::new()),
/// )
/// .await?;
///
/// let mut lease = pool.acquire().await?;
/// let answer = lease.run(|runspace| runspace.eval("6 * 7")).await?;
/// assert_eq!(answer, 42);
/// pool.release(lease)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RunspacePool {
    inner: Arc<PoolInner>,
}

impl RunspacePool {
    /// Creates the pool and pre-warms `min_runspaces`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid bounds and `RunspaceCreation` if a
    /// pre-warmed runspace fails to start.
    pub async fn new(
        config: PoolConfig,
        limits: ResourceLimits,
        shared: Arc<SharedStateStore>,
    ) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_runspaces)),
            config,
            limits,
            shared,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            live: Arc::new(AtomicUsize::new(0)),
        });

        let mut warm = Vec::with_capacity(inner.config.min_runspaces);
        for _ in 0..inner.config.min_runspaces {
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            warm.push(
                RunspaceHandle::spawn(
                    id,
                    Arc::clone(&inner.shared),
                    inner.limits.clone(),
                    Arc::clone(&inner.live),
                )
                .await?,
            );
        }
        inner.lock().idle.extend(warm);

        tracing::info!(
            "Runspace pool ready (min: {}, max: {})",
            inner.config.min_runspaces,
            inner.config.max_runspaces
        );

        Ok(Self { inner })
    }

    /// Acquires exclusive use of a runspace, waiting while the pool is
    /// exhausted.
    ///
    /// # Errors
    ///
    /// - `PoolDisposed` if the pool is or becomes disposed while waiting
    /// - `PoolExhaustedTimeout` if `acquire_timeout` elapses first
    /// - `RunspaceCreation` if a new runspace fails to start
    pub async fn acquire(&self) -> Result<RunspaceLease> {
        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = match self.inner.config.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, semaphore.acquire_owned())
                .await
                .map_err(|_| {
                    KestrunError::PoolExhaustedTimeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
                })?,
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| KestrunError::PoolDisposed)?;

        let slot = {
            let mut state = self.inner.lock();
            if state.disposed {
                return Err(KestrunError::PoolDisposed);
            }
            match state.idle.pop_front() {
                Some(handle) => {
                    state.in_use.insert(handle.id());
                    Slot::Idle(handle)
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    state.in_use.insert(id);
                    Slot::Reserved(id)
                }
            }
        };

        let handle = match slot {
            Slot::Idle(handle) => handle,
            Slot::Reserved(id) => {
                let mut reservation = Reservation {
                    pool: &self.inner,
                    id,
                    armed: true,
                };
                let handle = RunspaceHandle::spawn(
                    id,
                    Arc::clone(&self.inner.shared),
                    self.inner.limits.clone(),
                    Arc::clone(&self.inner.live),
                )
                .await?;
                reservation.armed = false;
                tracing::debug!(runspace = id, "Created runspace on demand");
                handle
            }
        };

        tracing::trace!(runspace = handle.id(), "Runspace acquired");
        Ok(RunspaceLease {
            handle: Some(handle),
            pool: Arc::clone(&self.inner),
            permit: Some(permit),
            in_flight: false,
            broken: false,
        })
    }

    /// Returns a lease to the pool.
    ///
    /// Dropping a lease does the same; this form makes the hand-back explicit
    /// and detects leases from another pool.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the lease belongs to a different pool. The
    /// lease is then returned to its own pool and this pool is untouched.
    pub fn release(&self, lease: RunspaceLease) -> Result<()> {
        if !Arc::ptr_eq(&lease.pool, &self.inner) {
            tracing::error!(runspace = lease.id(), "Attempted to release a runspace from another pool");
            return Err(KestrunError::Validation(
                "runspace lease belongs to a different pool".into(),
            ));
        }
        drop(lease);
        Ok(())
    }

    /// Closes the pool.
    ///
    /// Idle runspaces are torn down now, in-use runspaces when their lease
    /// ends, and every waiting or future `acquire` fails with `PoolDisposed`.
    pub fn dispose(&self) {
        let idle = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.idle)
        };
        self.inner.semaphore.close();
        tracing::info!("Runspace pool disposed ({} idle runspaces closed)", idle.len());
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.lock().in_use.len()
    }

    /// Idle plus in-use runspaces. Never exceeds `max_runspaces`.
    pub fn total_count(&self) -> usize {
        let state = self.inner.lock();
        state.idle.len() + state.in_use.len()
    }

    /// Runspace threads still running, including discarded ones that are
    /// finishing an abandoned script. Never exceeds `max_runspaces`.
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn min_runspaces(&self) -> usize {
        self.inner.config.min_runspaces
    }

    pub fn max_runspaces(&self) -> usize {
        self.inner.config.max_runspaces
    }
}

/// Exclusive use of one runspace for the duration of a request.
///
/// Dropping the lease returns the runspace to its pool. A lease dropped
/// while a [`run`](Self::run) is still in flight (the future was cancelled
/// or timed out) discards the runspace instead, since the script may still
/// be executing on it, and keeps the permit held until that thread exits.
pub struct RunspaceLease {
    handle: Option<RunspaceHandle>,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
    in_flight: bool,
    broken: bool,
}

impl RunspaceLease {
    /// Identity of the leased runspace.
    pub fn id(&self) -> u64 {
        self.handle.as_ref().map_or(0, RunspaceHandle::id)
    }

    /// Runs `f` on the leased runspace.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or `ScriptRuntime` if the runspace
    /// died; a dead runspace is marked broken.
    pub async fn run<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Runspace) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| KestrunError::ScriptRuntime("Runspace lease is empty".into()))?;

        self.in_flight = true;
        let result = handle.run(f).await;
        self.in_flight = false;

        if handle.is_poisoned() {
            self.broken = true;
        }
        result
    }

    /// Prevents the runspace from being reused after this lease.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for RunspaceLease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let broken = self.broken || self.in_flight;
            if self.in_flight {
                tracing::warn!(runspace = handle.id(), "Runspace lease dropped mid-execution");
                if let Some(permit) = self.permit.take() {
                    handle.retire(permit);
                }
            }
            self.pool.give_back(handle, broken);
        }
        drop(self.permit.take());
    }
}

impl std::fmt::Debug for RunspaceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunspaceLease")
            .field("runspace", &self.id())
            .field("in_flight", &self.in_flight)
            .field("broken", &self.broken)
            .finish()
    }
}
