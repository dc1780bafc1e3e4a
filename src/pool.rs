//!
//! src/pool.rs  Andrew Belles  Oct 6th, 2025
//!
//! Bounded fan-out for stage work plus an explicit checkout pool for
//! reusable scrape sessions. Each item yields its own result; one failure
//! never cancels the siblings, and output order matches input order
//!

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::FailureConfig;
use crate::errors::EtlError;

/// Per-stage success/failure tallies checked against the failure-rate rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub total: usize,
    pub failed: usize,
    pub quota: usize
}

impl FailureStats {
    pub fn record<T>(&mut self, result: &Result<T, EtlError>) {
        self.total += 1;
        if let Err(e) = result {
            self.failed += 1;
            if e.is_quota() {
                self.quota += 1;
            }
        }
    }

    pub fn record_failure(&mut self, quota: bool) {
        self.total += 1;
        self.failed += 1;
        if quota {
            self.quota += 1;
        }
    }

    pub fn record_success(&mut self) {
        self.total += 1;
    }

    pub fn merge(&mut self, other: FailureStats) {
        self.total  += other.total;
        self.failed += other.failed;
        self.quota  += other.quota;
    }

    pub fn rate(&self) -> f64 {
        if self.total == 0 { 0.0 } else { self.failed as f64 / self.total as f64 }
    }

    /// Fatal once the sample is large enough and the rate is over the limit,
    /// unless quota exhaustion accounts for most of the failures
    pub fn check(&self, stage: &str, cfg: &FailureConfig) -> Result<(), EtlError> {
        if self.total < cfg.min_sample || self.rate() <= cfg.max_failure_rate {
            return Ok(());
        }
        if self.quota * 2 > self.failed {
            warn!(
                stage, failed = self.failed, quota = self.quota, total = self.total,
                "stage.failure_rate.quota"
            );
            return Ok(());
        }
        Err(EtlError::FailureRate {
            stage: stage.to_string(),
            failed: self.failed,
            total: self.total
        })
    }
}

/// Runs `work` over `items` with at most `workers` in flight. Returns each
/// item beside its result, in input order. Cancellation aborts the batch
pub async fn run_bounded<I, T, F, Fut>(
    stage: &'static str,
    items: Vec<I>,
    workers: usize,
    cancel: &CancellationToken,
    work: F
) -> Result<Vec<(I, Result<T, EtlError>)>, EtlError>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, EtlError>> + Send + 'static
{
    let gate = Arc::new(Semaphore::new(workers.max(1)));
    let work = Arc::new(work);
    let mut set = JoinSet::new();

    for (idx, item) in items.iter().cloned().enumerate() {
        let gate = gate.clone();
        let work = work.clone();
        set.spawn(async move {
            let _permit = match gate.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return (idx, Err(EtlError::Cancelled))
            };
            (idx, work(item).await)
        });
    }

    let mut slots: Vec<Option<Result<T, EtlError>>> = (0..items.len()).map(|_| None).collect();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                set.abort_all();
                warn!(stage, "pool.cancelled");
                return Err(EtlError::Cancelled);
            }
            next = set.join_next() => match next {
                Some(Ok((idx, result))) => {
                    if let Some(slot) = slots.get_mut(idx) {
                        *slot = Some(result);
                    }
                }
                Some(Err(e)) => error!(stage, error = %e, "pool.task.join"),
                None => break
            }
        }
    }

    let done = slots.iter().filter(|s| s.is_some()).count();
    debug!(stage, done, total = items.len(), "pool.drained");

    Ok(items
        .into_iter()
        .zip(slots)
        .map(|(item, slot)| {
            let result = slot.unwrap_or_else(|| Err(EtlError::Join(format!("{stage} worker panicked or was aborted"))));
            (item, result)
        })
        .collect())
}

type Factory<R> = Box<dyn Fn() -> Result<R, EtlError> + Send + Sync>;

/// Fixed-size pool of reusable resources (scrape sessions). A checkout
/// returns its resource on drop unless it was discarded after an error
pub struct ResourcePool<R> {
    idle: Mutex<Vec<R>>,
    permits: Semaphore,
    factory: Factory<R>
}

impl<R: Send> ResourcePool<R> {
    pub fn new(size: usize, factory: impl Fn() -> Result<R, EtlError> + Send + Sync + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Semaphore::new(size.max(1)),
            factory: Box::new(factory)
        }
    }

    pub async fn checkout(&self) -> Result<Checkout<'_, R>, EtlError> {
        let permit = self.permits.acquire().await.map_err(|_| EtlError::Cancelled)?;
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let resource = match reused {
            Some(r) => r,
            None => (self.factory)()?
        };
        Ok(Checkout { pool: self, resource: Some(resource), _permit: permit })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|v| v.len()).unwrap_or(0)
    }
}

pub struct Checkout<'a, R> {
    pool: &'a ResourcePool<R>,
    resource: Option<R>,
    _permit: SemaphorePermit<'a>
}

impl<R> Checkout<'_, R> {
    /// Drops the resource instead of returning it to the pool
    pub fn discard(mut self) {
        self.resource = None;
    }
}

impl<R> Deref for Checkout<'_, R> {
    type Target = R;
    fn deref(&self) -> &R {
        // resource is only taken in discard/drop, both of which consume self
        match &self.resource {
            Some(r) => r,
            None => unreachable!("checkout used after discard")
        }
    }
}

impl<R> DerefMut for Checkout<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        match &mut self.resource {
            Some(r) => r,
            None => unreachable!("checkout used after discard")
        }
    }
}

impl<R> Drop for Checkout<'_, R> {
    fn drop(&mut self) {
        if let Some(r) = self.resource.take() {
            if let Ok(mut idle) = self.pool.idle.lock() {
                idle.push(r);
            }
        }
    }
}
