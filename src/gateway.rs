use log::{debug, info};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{GridTxError, Result};
use crate::preload::PreloadSignal;
use crate::util::log_throttle::LogThrottle;
use crate::CacheKey;

/// Lifecycle of the node hosting the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Notified around node shutdown.
///
/// Errors returned by an observer are logged and never abort the shutdown.
pub trait LifecycleObserver: Send + Sync {
    fn name(&self) -> &str;

    fn before_stop(&self) -> Result<()> {
        Ok(())
    }

    fn after_stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Receives eviction notifications once the evicting operation leaves the gateway.
pub trait EvictionListener: Send + Sync {
    fn on_evicted(&self, key: &CacheKey);
}

/// Eviction notifications collected inside guarded sections.
#[derive(Default)]
pub struct DeferredEvictions {
    pending: Mutex<Vec<CacheKey>>,
    listener: RwLock<Option<Arc<dyn EvictionListener>>>,
}

impl DeferredEvictions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listener(&self, listener: Arc<dyn EvictionListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn defer(&self, key: CacheKey) {
        self.pending.lock().push(key);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Hands every deferred notification to the listener. Returns how many
    /// were flushed.
    pub fn unwind(&self) -> usize {
        let keys = std::mem::take(&mut *self.pending.lock());
        if keys.is_empty() {
            return 0;
        }
        if let Some(listener) = self.listener.read().as_ref() {
            for key in &keys {
                listener.on_evicted(key);
            }
        }
        debug!("Unwound {} deferred eviction notifications", keys.len());
        keys.len()
    }
}

/// A projection of the cache that an operation runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    name: String,
}

impl Projection {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Execution context carried explicitly by the caller of an operation.
#[derive(Debug, Default)]
pub struct OperationContext {
    projection: Option<Projection>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    fn swap(&mut self, projection: Option<Projection>) -> Option<Projection> {
        std::mem::replace(&mut self.projection, projection)
    }
}

/// Admission control in front of every cache operation.
///
/// Operations hold the node state lock in shared mode for their whole
/// duration; shutdown takes it exclusively. Reads are recursive so that an
/// operation issued from inside a guarded section cannot deadlock behind a
/// queued shutdown. Shutdown closes the gateway before it queues for the
/// exclusive lock, so new operations fail instead of overlapping forever.
pub struct CacheGateway {
    state: RwLock<NodeState>,
    // Set as soon as shutdown begins, before the state lock is taken.
    closed: AtomicBool,
    preload: Arc<PreloadSignal>,
    preload_timeout: Option<Duration>,
    evictions: Arc<DeferredEvictions>,
    observers: Mutex<Vec<Arc<dyn LifecycleObserver>>>,
    log_throttle: Arc<LogThrottle>,
}

impl CacheGateway {
    pub fn new(
        preload: Arc<PreloadSignal>,
        preload_timeout: Option<Duration>,
        evictions: Arc<DeferredEvictions>,
        log_throttle: Arc<LogThrottle>,
    ) -> Self {
        Self {
            state: RwLock::new(NodeState::Starting),
            closed: AtomicBool::new(false),
            preload,
            preload_timeout,
            evictions,
            observers: Mutex::new(Vec::new()),
            log_throttle,
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.read_recursive()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn preload(&self) -> &Arc<PreloadSignal> {
        &self.preload
    }

    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.lock().push(observer);
    }

    /// Moves a starting node to `Started`.
    pub fn start(&self) {
        let mut state = self.state.write();
        if *state == NodeState::Starting {
            *state = NodeState::Started;
            info!("Cache gateway started");
        }
    }

    /// Admits an operation, blocking until the preloader started and the
    /// shared admission lock is available.
    ///
    /// # Errors
    ///
    /// `GridTxError::GatewayClosed` if the node is stopping or stopped,
    /// `GridTxError::PreloadFailed` if the preloader failed or did not start
    /// in time.
    pub fn enter(&self) -> Result<GatewayGuard<'_>> {
        if self.is_closed() {
            return Err(GridTxError::GatewayClosed);
        }
        self.preload.wait(self.preload_timeout)?;
        self.admit(self.state.read_recursive())
    }

    /// Like [`CacheGateway::enter`], but gives up on the admission lock after
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// `GridTxError::GatewayBusy` if the lock was not acquired in time, in
    /// addition to the errors of `enter`.
    pub fn try_enter(&self, timeout: Duration) -> Result<GatewayGuard<'_>> {
        if self.is_closed() {
            return Err(GridTxError::GatewayClosed);
        }
        self.preload.wait(self.preload_timeout)?;
        match self.state.try_read_recursive_for(timeout) {
            Some(read) => self.admit(read),
            None => Err(GridTxError::GatewayBusy),
        }
    }

    /// Enters the gateway and installs `projection` into `ctx` for the
    /// duration of the guarded section. The previous projection is restored
    /// on leave.
    pub fn enter_scoped<'a>(
        &'a self,
        ctx: &'a mut OperationContext,
        projection: Option<Projection>,
    ) -> Result<GatewayGuard<'a>> {
        // Any failure past this point drops the guard, which releases the
        // admission lock.
        let mut guard = self.enter()?;
        let prev = ctx.swap(projection);
        guard.restore = Some((ctx, prev));
        Ok(guard)
    }

    fn admit<'a>(&'a self, read: RwLockReadGuard<'a, NodeState>) -> Result<GatewayGuard<'a>> {
        if self.is_closed() {
            return Err(GridTxError::GatewayClosed);
        }
        match *read {
            NodeState::Stopping | NodeState::Stopped => Err(GridTxError::GatewayClosed),
            NodeState::Starting | NodeState::Started => Ok(GatewayGuard {
                gateway: self,
                _read: read,
                restore: None,
            }),
        }
    }

    /// Starts shutting down: closes the gateway to new operations, waits for
    /// every admitted one to leave and notifies observers.
    ///
    /// Returns `false` if the node is already stopping or stopped.
    pub fn begin_stop(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.write() = NodeState::Stopping;
        info!("Cache gateway stopping");
        self.notify_observers(|o| o.before_stop(), "before stop");
        true
    }

    /// Completes a shutdown started with [`CacheGateway::begin_stop`].
    pub fn finish_stop(&self) {
        {
            let mut state = self.state.write();
            if *state != NodeState::Stopping {
                return;
            }
            *state = NodeState::Stopped;
        }
        info!("Cache gateway stopped");
        self.notify_observers(|o| o.after_stop(), "after stop");
    }

    fn notify_observers(&self, f: impl Fn(&dyn LifecycleObserver) -> Result<()>, phase: &str) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            if let Err(e) = f(observer.as_ref()) {
                self.log_throttle.error(&format!(
                    "Lifecycle observer '{}' failed {}: {}",
                    observer.name(),
                    phase,
                    e
                ));
            }
        }
    }
}

/// Proof of admission through the [`CacheGateway`].
///
/// ```
/// use gridtx::prelude::*;
/// use std::sync::Arc;
///
/// let grid = GridTx::new(GridTxConfig::default(), Arc::new(NoopStorage)).unwrap();
/// let guard = grid.gateway().enter().unwrap();
/// guard.leave();
/// grid.stop();
/// assert_eq!(grid.gateway().state(), NodeState::Stopped);
/// ```
///
/// Leaving consumes the guard, so a section cannot be left twice:
///
/// ```compile_fail
/// use gridtx::prelude::*;
/// use std::sync::Arc;
///
/// let grid = GridTx::new(GridTxConfig::default(), Arc::new(NoopStorage)).unwrap();
/// let guard = grid.gateway().enter().unwrap();
/// guard.leave();
/// guard.leave();
/// ```
#[must_use = "the operation leaves the gateway as soon as the guard is dropped"]
pub struct GatewayGuard<'a> {
    gateway: &'a CacheGateway,
    _read: RwLockReadGuard<'a, NodeState>,
    restore: Option<(&'a mut OperationContext, Option<Projection>)>,
}

impl GatewayGuard<'_> {
    /// The projection installed by [`CacheGateway::enter_scoped`], if any.
    pub fn projection(&self) -> Option<&Projection> {
        self.restore.as_ref().and_then(|(ctx, _)| ctx.projection())
    }

    /// Leaves the gateway: flushes deferred eviction notifications, restores
    /// the previous projection and releases the admission lock.
    pub fn leave(self) {}
}

impl Drop for GatewayGuard<'_> {
    fn drop(&mut self) {
        self.gateway.evictions.unwind();
        if let Some((ctx, prev)) = self.restore.take() {
            ctx.swap(prev);
        }
        // The admission lock is released after this, when `_read` drops.
    }
}
