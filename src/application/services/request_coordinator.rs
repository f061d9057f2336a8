//! Single-flight execution per cache key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, CancelOnDrop, Liveness};
use crate::domain::errors::ImageResult;

type FlightFuture<T> = BoxFuture<'static, ImageResult<T>>;
type FlightMap<T> = Arc<Mutex<HashMap<CacheKey, Flight<T>>>>;

struct Flight<T> {
    id: u64,
    future: WeakShared<FlightFuture<T>>,
}

/// Collapses concurrent executions for the same key into one.
///
/// The first caller for a key starts the producer; callers arriving while it
/// runs attach to it and receive a clone of its result. The map only holds
/// weak handles, so when every attached caller has gone away the execution is
/// dropped and its [`Liveness`] is cancelled. Once an execution finishes the
/// next call for the key starts a new one.
pub struct RequestCoordinator<T> {
    flights: FlightMap<T>,
    next_id: AtomicU64,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<T> Default for RequestCoordinator<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }
}

impl<T> RequestCoordinator<T> {
    /// Returns true while an execution for `key` is running.
    #[must_use]
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.flights.lock().contains_key(key)
    }

    /// Returns the number of running executions.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.flights.lock().len()
    }

    /// Returns how many executions were started and how many calls joined one.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (
            self.started.load(Ordering::Relaxed),
            self.joined.load(Ordering::Relaxed),
        )
    }
}

impl<T> std::fmt::Debug for RequestCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("in_flight", &self.in_flight_count())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("joined", &self.joined.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `producer` for `key`, or joins the execution already running.
    ///
    /// `producer` is only called when a new execution starts; it must build
    /// its future without blocking. The future receives the execution's
    /// [`Liveness`], which is cancelled once no caller awaits the result.
    ///
    /// # Errors
    /// Returns whatever error the shared execution produced.
    pub async fn execute<F, Fut>(&self, key: &CacheKey, producer: F) -> ImageResult<T>
    where
        F: FnOnce(Liveness) -> Fut,
        Fut: Future<Output = ImageResult<T>> + Send + 'static,
    {
        let flight = self.join_or_start(key, producer);
        flight.await
    }

    fn join_or_start<F, Fut>(&self, key: &CacheKey, producer: F) -> Shared<FlightFuture<T>>
    where
        F: FnOnce(Liveness) -> Fut,
        Fut: Future<Output = ImageResult<T>> + Send + 'static,
    {
        let mut flights = self.flights.lock();

        if let Some(existing) = flights.get(key).and_then(|flight| flight.future.upgrade()) {
            self.joined.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Joining in-flight execution");
            return existing;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let liveness = Liveness::new();
        let guard = FlightGuard {
            flights: Arc::clone(&self.flights),
            key: key.clone(),
            id,
            cancel: CancelOnDrop::new(liveness.clone()),
        };
        let work = producer(liveness);

        let future: FlightFuture<T> = async move {
            let mut guard = guard;
            let result = work.await;
            guard.cancel.disarm();
            result
        }
        .boxed();
        let shared = future.shared();

        if let Some(weak) = shared.downgrade() {
            flights.insert(key.clone(), Flight { id, future: weak });
        }
        self.started.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, id = id, "Started execution");

        shared
    }
}

/// Lives inside an execution's future.
///
/// Dropped either when the execution finishes or when its last awaiter goes
/// away; in both cases the map entry is released. Only the second case
/// cancels the liveness flag.
struct FlightGuard<T> {
    flights: FlightMap<T>,
    key: CacheKey,
    id: u64,
    cancel: CancelOnDrop,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();
        if flights.get(&self.key).is_some_and(|flight| flight.id == self.id) {
            flights.remove(&self.key);
            trace!(key = %self.key, id = self.id, "Released execution");
        }
    }
}
