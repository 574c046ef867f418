//! Bounded connection pool shared by every engine operation.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type Factory<T> = Box<dyn Fn() -> Result<T, String> + Send + Sync>;

struct PoolState<T> {
    idle: Vec<T>,
}

/// A bounded pool for reusable connection-like objects.
pub struct Pool<T> {
    max: usize,
    factory: Factory<T>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    in_flight: AtomicUsize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcquireError {
    Timeout,
    Create(String),
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::Timeout => f.write_str("timed out waiting for a pooled connection"),
            AcquireError::Create(err) => write!(f, "failed to open connection: {err}"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// A pooled value that returns to the pool on drop.
pub struct Pooled<T> {
    pool: Arc<Pool<T>>,
    value: Option<T>,
}

impl<T> Pool<T> {
    pub fn new<F, E>(max: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Arc::new(Self {
            max: max.max(1),
            factory: Box::new(move || factory().map_err(|err| err.to_string())),
            state: Mutex::new(PoolState { idle: Vec::new() }),
            available: Condvar::new(),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Hands out an idle value, opens a new one while under `max`, or waits.
    ///
    /// `None` waits forever.
    pub fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Pooled<T>, AcquireError> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            let mut state = self.state.lock().unwrap();
            if let Some(item) = state.idle.pop() {
                return Ok(Pooled {
                    pool: Arc::clone(self),
                    value: Some(item),
                });
            }

            if self.in_flight.load(Ordering::SeqCst) < self.max {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                drop(state);
                return match (self.factory)() {
                    Ok(item) => Ok(Pooled {
                        pool: Arc::clone(self),
                        value: Some(item),
                    }),
                    Err(err) => {
                        tracing::warn!(error = %err, "pool factory failed");
                        self.discard();
                        Err(AcquireError::Create(err))
                    }
                };
            }

            match deadline {
                None => {
                    drop(self.available.wait(state).unwrap());
                }
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(AcquireError::Timeout);
                    }
                    let (guard, _) = self.available.wait_timeout(state, limit - now).unwrap();
                    drop(guard);
                    if Instant::now() >= limit {
                        return Err(AcquireError::Timeout);
                    }
                }
            }
        }
    }

    /// Number of values created and not yet discarded.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.idle.len()
    }

    fn release(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        state.idle.push(item);
        self.available.notify_one();
    }

    fn discard(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> Pooled<T> {
    /// Drops the value instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.discard();
        }
    }
}

impl<T> AsRef<T> for Pooled<T> {
    fn as_ref(&self) -> &T {
        self.value
            .as_ref()
            .expect("Pooled value missing (already released)")
    }
}

impl<T> AsMut<T> for Pooled<T> {
    fn as_mut(&mut self) -> &mut T {
        self.value
            .as_mut()
            .expect("Pooled value missing (already released)")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            self.pool.release(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_pool(max: usize) -> Arc<Pool<usize>> {
        let created = Arc::new(AtomicUsize::new(0));
        Pool::new(max, move || {
            Ok::<_, String>(created.fetch_add(1, Ordering::SeqCst))
        })
    }

    #[test]
    fn pool_reuses_connections() {
        let pool = counting_pool(2);
        let first = pool.acquire(None).expect("first");
        let second = pool.acquire(None).expect("second");
        assert_eq!(pool.in_flight(), 2);
        drop(first);
        assert_eq!(pool.idle_count(), 1);
        drop(second);
        assert_eq!(pool.idle_count(), 2);

        let again = pool.acquire(None).expect("reuse");
        assert!(*again.as_ref() < 2);
        assert_eq!(pool.in_flight(), 2);
    }

    #[test]
    fn pool_timeout() {
        let pool = counting_pool(1);
        let _guard = pool.acquire(None).expect("guard");
        let result = pool.acquire(Some(Duration::from_millis(10)));
        assert_eq!(result.err(), Some(AcquireError::Timeout));
    }

    #[test]
    fn pool_factory_error_frees_slot() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let pool = {
            let attempts = attempts.clone();
            Pool::new(1, move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("disk on fire".to_string())
                } else {
                    Ok(7usize)
                }
            })
        };
        let first = pool.acquire(Some(Duration::from_millis(10)));
        assert_eq!(
            first.err(),
            Some(AcquireError::Create("disk on fire".to_string()))
        );
        assert_eq!(pool.in_flight(), 0);
        let second = pool.acquire(Some(Duration::from_millis(10))).expect("second");
        assert_eq!(*second.as_ref(), 7);
    }

    #[test]
    fn pool_discard_allows_recreate() {
        let pool = counting_pool(1);
        let guard = pool.acquire(None).expect("guard");
        guard.discard();
        assert_eq!(pool.idle_count(), 0);
        let next = pool.acquire(Some(Duration::from_millis(10))).expect("next");
        assert_eq!(*next.as_ref(), 1);
    }
}
