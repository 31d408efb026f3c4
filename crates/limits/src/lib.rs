use models::SourceKind;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    #[error("acquisition cancelled")]
    Cancelled,
}

/// Token rate and burst capacity of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateParams {
    /// Tokens replenished per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: f64,
}

impl RateParams {
    pub fn new(rate: f64, burst: f64) -> Self {
        RateParams {
            rate: rate.max(f64::MIN_POSITIVE),
            burst: burst.max(1.0),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    params: RateParams,
    tokens: f64,
    last_refill: tokio::time::Instant,
}

impl BucketState {
    fn refill(&mut self, now: tokio::time::Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.params.rate).min(self.params.burst);
        self.last_refill = now;
    }
}

/// A continuously-refilled token bucket governing request *initiation*
/// against one DICOM source. Callers must not hold a token across a
/// long-lived transfer; occupation is bounded separately by [`InFlight`].
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(params: RateParams) -> Self {
        TokenBucket {
            state: Mutex::new(BucketState {
                params,
                tokens: params.burst,
                last_refill: tokio::time::Instant::now(),
            }),
        }
    }

    /// Replace rate parameters without disturbing queued waiters. Banked
    /// tokens are clamped to the new burst size.
    pub async fn reload(&self, params: RateParams) {
        let mut state = self.state.lock().await;
        state.refill(tokio::time::Instant::now());
        state.params = params;
        state.tokens = state.tokens.min(params.burst);
    }

    /// Take one token, waiting for refill as needed. Returns `Cancelled` if
    /// `cancel` fires first. Waits are re-evaluated at least once a second
    /// so a `reload` reaches queued waiters promptly.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), LimitError> {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = tokio::time::Instant::now();
                state.refill(now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                let deficit = 1.0 - state.tokens;
                std::time::Duration::from_secs_f64((deficit / state.params.rate).min(1.0))
            };

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return Err(LimitError::Cancelled),
            }
        }
    }
}

/// A permit for one in-flight source operation: holds both the global
/// occupation slot and the per-source slot, released on drop.
pub struct SourcePermit {
    _global: OwnedSemaphorePermit,
    _source: OwnedSemaphorePermit,
}

/// Concurrency ceilings: a global in-flight cap plus a per-source cap.
/// The global cap bounds concurrently-processing messages end to end; the
/// per-source caps bound concurrent query/transfer operations.
pub struct InFlight {
    global: Arc<Semaphore>,
    global_limit: usize,
    per_source: HashMap<SourceKind, Arc<Semaphore>>,
}

impl InFlight {
    pub fn new(global_limit: usize, per_source_limit: usize) -> Self {
        let per_source = [SourceKind::Primary, SourceKind::Secondary]
            .into_iter()
            .map(|kind| (kind, Arc::new(Semaphore::new(per_source_limit))))
            .collect();
        InFlight {
            global: Arc::new(Semaphore::new(global_limit)),
            global_limit,
            per_source,
        }
    }

    pub fn global_limit(&self) -> usize {
        self.global_limit
    }

    /// Take one global message slot, for the lifetime of one delivery.
    pub async fn acquire_message(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, LimitError> {
        tokio::select! {
            permit = self.global.clone().acquire_owned() => {
                // The semaphore is never closed.
                Ok(permit.expect("in-flight semaphore closed"))
            }
            () = cancel.cancelled() => Err(LimitError::Cancelled),
        }
    }

    /// Take one per-source operation slot.
    pub async fn acquire_source(
        &self,
        kind: SourceKind,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, LimitError> {
        let semaphore = self.per_source[&kind].clone();
        tokio::select! {
            permit = semaphore.acquire_owned() => {
                Ok(permit.expect("per-source semaphore closed"))
            }
            () = cancel.cancelled() => Err(LimitError::Cancelled),
        }
    }

    /// Wait until every global slot is free again (all in-flight work done).
    pub async fn drained(&self) {
        let _ = self
            .global
            .acquire_many(self.global_limit as u32)
            .await
            .expect("in-flight semaphore closed");
    }
}

/// The rate limiters of both sources, reloadable at runtime.
pub struct Limits {
    pub in_flight: InFlight,
    buckets: HashMap<SourceKind, TokenBucket>,
}

impl Limits {
    pub fn new(global_limit: usize, per_source_limit: usize, params: RateParams) -> Self {
        let buckets = [SourceKind::Primary, SourceKind::Secondary]
            .into_iter()
            .map(|kind| (kind, TokenBucket::new(params)))
            .collect();
        Limits {
            in_flight: InFlight::new(global_limit, per_source_limit),
            buckets,
        }
    }

    pub async fn acquire_token(
        &self,
        kind: SourceKind,
        cancel: &CancellationToken,
    ) -> Result<(), LimitError> {
        self.buckets[&kind].acquire(cancel).await
    }

    pub async fn reload(&self, kind: SourceKind, params: RateParams) {
        tracing::info!(source = %kind, rate = params.rate, burst = params.burst, "reloading rate parameters");
        self.buckets[&kind].reload(params).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn tokens_are_spaced_by_rate() {
        let bucket = TokenBucket::new(RateParams::new(1.0, 1.0));
        let cancel = CancellationToken::new();

        // The bucket starts full: the first acquire is immediate.
        let start = tokio::time::Instant::now();
        bucket.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Each subsequent acquire waits out the refill interval.
        for _ in 0..3 {
            let before = tokio::time::Instant::now();
            bucket.acquire(&cancel).await.unwrap();
            assert!(before.elapsed() >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_allows_back_to_back_tokens() {
        let bucket = TokenBucket::new(RateParams::new(1.0, 3.0));
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            bucket.acquire(&cancel).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        let before = tokio::time::Instant::now();
        bucket.acquire(&cancel).await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_observes_cancellation() {
        let bucket = TokenBucket::new(RateParams::new(0.001, 1.0));
        let cancel = CancellationToken::new();
        bucket.acquire(&cancel).await.unwrap();

        let pending = bucket.acquire(&cancel);
        tokio::pin!(pending);

        tokio::select! {
            _ = &mut pending => panic!("acquire should still be waiting"),
            () = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        cancel.cancel();
        assert!(matches!(pending.await, Err(LimitError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_takes_effect_for_waiters() {
        let bucket = Arc::new(TokenBucket::new(RateParams::new(0.01, 1.0)));
        let cancel = CancellationToken::new();
        bucket.acquire(&cancel).await.unwrap();

        // At 0.01 tokens/sec the next token is 100s away; raising the rate
        // shortens the wait for the queued acquire.
        let waiter = {
            let bucket = bucket.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let start = tokio::time::Instant::now();
                bucket.acquire(&cancel).await.unwrap();
                start.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        bucket.reload(RateParams::new(1.0, 1.0)).await;

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(100), "waited {waited:?}");
    }

    #[tokio::test]
    async fn in_flight_respects_ceilings() {
        let in_flight = InFlight::new(2, 1);
        let cancel = CancellationToken::new();

        let m1 = in_flight.acquire_message(&cancel).await.unwrap();
        let _m2 = in_flight.acquire_message(&cancel).await.unwrap();

        // Global ceiling reached: a third acquisition must not complete.
        let blocked = in_flight.acquire_message(&cancel);
        tokio::pin!(blocked);
        tokio::select! {
            _ = &mut blocked => panic!("global ceiling exceeded"),
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        drop(m1);
        blocked.await.unwrap();

        // Per-source ceiling of one.
        let s1 = in_flight
            .acquire_source(SourceKind::Primary, &cancel)
            .await
            .unwrap();
        let second = in_flight.acquire_source(SourceKind::Primary, &cancel);
        tokio::pin!(second);
        tokio::select! {
            _ = &mut second => panic!("per-source ceiling exceeded"),
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        drop(s1);
        second.await.unwrap();
    }
}
