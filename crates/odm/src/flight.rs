//! Single-flight lazy cell
//!
//! The first caller of [`SingleFlight::get_or_init`] starts the initializer on
//! its own task; every caller arriving while it runs awaits that same task.
//! Success is cached for good. Failure is handed to every waiter and then
//! cleared so a later call starts a fresh attempt.
//!
//! Because the initializer runs on a spawned task, callers that give up
//! waiting do not cancel it; it still completes and fills the cell. An
//! initializer that panics, or whose runtime shuts down first, counts as a
//! failed attempt and is cleared the same way.
//!
//! Starting an initializer requires a Tokio runtime; without one the call
//! fails with [`OdmError::Driver`] and the cell stays idle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::error::{OdmError, OdmResult};

type SharedInit<T> = Shared<BoxFuture<'static, OdmResult<T>>>;

enum FlightState<T> {
    Idle,
    Pending { attempt: u64, init: SharedInit<T> },
    Ready(T),
}

struct Inner<T> {
    state: FlightState<T>,
    attempts: u64,
}

/// Lazily initialized value with at most one initializer in flight
pub struct SingleFlight<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: FlightState::Idle,
                attempts: 0,
            })),
        }
    }

    /// Cached value, if initialization already succeeded
    pub fn get(&self) -> Option<T> {
        match &self.inner.lock().state {
            FlightState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// True while an initializer is running
    pub fn is_pending(&self) -> bool {
        matches!(self.inner.lock().state, FlightState::Pending { .. })
    }

    /// Number of initializers started so far
    pub fn attempts(&self) -> u64 {
        self.inner.lock().attempts
    }

    /// Return the cached value, join the in-flight initializer, or start one.
    ///
    /// `init` is only invoked when the cell is idle.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> OdmResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OdmResult<T>> + Send + 'static,
    {
        let shared = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match &inner.state {
                FlightState::Ready(value) => return Ok(value.clone()),
                FlightState::Pending { init, .. } => {
                    tracing::trace!("Joining in-flight initialization");
                    init.clone()
                }
                FlightState::Idle => {
                    let runtime = Handle::try_current().map_err(|e| {
                        OdmError::Driver(format!("a Tokio runtime is required: {}", e))
                    })?;
                    inner.attempts += 1;
                    let attempt = inner.attempts;
                    let shared = self.spawn(&runtime, attempt, init());
                    inner.state = FlightState::Pending {
                        attempt,
                        init: shared.clone(),
                    };
                    shared
                }
            }
        };

        shared.await
    }

    fn spawn<Fut>(&self, runtime: &Handle, attempt: u64, init: Fut) -> SharedInit<T>
    where
        Fut: Future<Output = OdmResult<T>> + Send + 'static,
    {
        let owner = Arc::clone(&self.inner);
        let task = runtime.spawn(async move {
            // Dropped unsettled if `init` panics or the task is cancelled
            let guard = AttemptGuard {
                inner: owner,
                attempt,
                armed: true,
            };
            let result = init.await;
            guard.settle(&result);
            result
        });

        let inner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    clear_attempt(&inner, attempt);
                    Err(OdmError::Driver(format!(
                        "initialization task failed: {}",
                        join_error
                    )))
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Return the cell to `Idle` if `attempt` is still the pending one
fn clear_attempt<T>(inner: &Mutex<Inner<T>>, attempt: u64) {
    let mut guard = inner.lock();
    if matches!(guard.state, FlightState::Pending { attempt: a, .. } if a == attempt) {
        guard.state = FlightState::Idle;
    }
}

/// Owned by the initializer task; clears its attempt unless settled
struct AttemptGuard<T> {
    inner: Arc<Mutex<Inner<T>>>,
    attempt: u64,
    armed: bool,
}

impl<T: Clone> AttemptGuard<T> {
    fn settle(mut self, result: &OdmResult<T>) {
        self.armed = false;
        // The spawning caller still holds the lock until Pending is stored,
        // so this always observes our own attempt.
        let mut guard = self.inner.lock();
        if matches!(guard.state, FlightState::Pending { attempt: a, .. } if a == self.attempt) {
            guard.state = match result {
                Ok(value) => FlightState::Ready(value.clone()),
                Err(_) => FlightState::Idle,
            };
        }
    }
}

impl<T> Drop for AttemptGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(attempt = self.attempt, "Initializer did not complete, clearing attempt");
            clear_attempt(&self.inner, self.attempt);
        }
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.lock().state {
            FlightState::Idle => "idle",
            FlightState::Pending { .. } => "pending",
            FlightState::Ready(_) => "ready",
        };
        f.debug_struct("SingleFlight").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_initializer() {
        let cell = Arc::new(SingleFlight::<Arc<String>>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..16).map(|_| {
            let cell = Arc::clone(&cell);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cell.get_or_init(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Arc::new("value".to_string()))
                })
                .await
            })
        });

        let results: Vec<_> = futures::future::join_all(waiters).await;
        let values: Vec<Arc<String>> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cell.attempts(), 1);
        assert!(cell.get().is_some());
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_cleared() {
        let cell = SingleFlight::<u32>::new();

        let (a, b) = tokio::join!(
            cell.get_or_init(|| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(OdmError::Connection("refused".to_string()))
            }),
            cell.get_or_init(|| async { Ok(7) }),
        );
        assert!(matches!(a, Err(OdmError::Connection(_))));
        assert!(matches!(b, Err(OdmError::Connection(_))));
        assert!(!cell.is_pending());
        assert_eq!(cell.attempts(), 1);

        let retried = cell.get_or_init(|| async { Ok(7) }).await.unwrap();
        assert_eq!(retried, 7);
        assert_eq!(cell.attempts(), 2);
    }

    async fn panicking_open() -> OdmResult<u32> {
        panic!("driver panicked while opening");
    }

    #[tokio::test]
    async fn test_panicking_initializer_is_cleared_for_retry() {
        let cell = SingleFlight::<u32>::new();

        let err = cell.get_or_init(panicking_open).await.unwrap_err();
        assert!(matches!(err, OdmError::Driver(_)));
        assert!(!cell.is_pending());

        let retried = cell.get_or_init(|| async { Ok(3) }).await.unwrap();
        assert_eq!(retried, 3);
        assert_eq!(cell.attempts(), 2);
    }

    #[test]
    fn test_runtime_shutdown_clears_pending_attempt() {
        let cell = SingleFlight::<u32>::new();

        let first = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let abandoned = first.block_on(async {
            tokio::time::timeout(
                Duration::from_millis(10),
                cell.get_or_init(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(1)
                }),
            )
            .await
        });
        assert!(abandoned.is_err());
        assert!(cell.is_pending());

        drop(first);
        assert!(!cell.is_pending());

        let second = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let value = second.block_on(cell.get_or_init(|| async { Ok(2) })).unwrap();
        assert_eq!(value, 2);
        assert_eq!(cell.attempts(), 2);
    }

    #[test]
    fn test_without_runtime_fails_and_stays_idle() {
        let cell = SingleFlight::<u32>::new();

        let err = futures::executor::block_on(cell.get_or_init(|| async { Ok(1) })).unwrap_err();
        assert!(matches!(err, OdmError::Driver(ref msg) if msg.contains("Tokio runtime")));
        assert_eq!(cell.attempts(), 0);
        assert!(!cell.is_pending());
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_initializer() {
        let cell = SingleFlight::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&calls);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            cell.get_or_init(|| async move {
                counted.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(42)
            }),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cell.get(), Some(42));

        let value = cell.get_or_init(|| async { Ok(0) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
