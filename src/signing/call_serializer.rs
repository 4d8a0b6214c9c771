//! Call Serializer
//!
//! One gate per exchange. Every authenticated call passes through
//! `with_lock`, and the nonce for that call is drawn inside the locked
//! section, so the exchange sees nonces in the order they were issued.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::trace;

/// Serializer statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializerStats {
    pub exchange: String,
    pub waiting: usize,
    pub completed: u64,
}

pub struct CallSerializer {
    exchange: String,
    // tokio's mutex is fair, so waiters are admitted in arrival order
    gate: Mutex<()>,
    waiting: AtomicUsize,
    completed: AtomicU64,
}

impl CallSerializer {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            gate: Mutex::new(()),
            waiting: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Run `f` while holding the exchange-wide gate.
    ///
    /// The future returned by `f` runs to completion (or its own timeout)
    /// before the next caller is admitted.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = self.gate.lock().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        trace!("{}: call admitted", self.exchange);
        let output = f().await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        output
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn stats(&self) -> SerializerStats {
        SerializerStats {
            exchange: self.exchange.clone(),
            waiting: self.waiting.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::nonce_authority::{NonceAuthority, NonceConfig, SystemClock};
    use crate::signing::nonce_store::MemoryNonceStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinSet;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn test_only_one_call_in_flight() {
        let serializer = Arc::new(CallSerializer::new("paper"));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let serializer = serializer.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            tasks.spawn(async move {
                serializer
                    .with_lock(|| async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(serializer.stats().completed, 8);
        assert_eq!(serializer.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_arrival_order_matches_nonce_order() {
        let serializer = Arc::new(CallSerializer::new("paper"));
        let authority = Arc::new(
            NonceAuthority::open(
                NonceConfig {
                    warmup_secs: 0,
                    ..Default::default()
                },
                Arc::new(MemoryNonceStore::new()),
                Arc::new(SystemClock),
            )
            .await
            .unwrap(),
        );
        // Stands in for the exchange: records nonces in arrival order
        let arrivals = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut tasks = JoinSet::new();
        for _ in 0..12 {
            let serializer = serializer.clone();
            let authority = authority.clone();
            let arrivals = arrivals.clone();
            tasks.spawn(async move {
                for _ in 0..10 {
                    serializer
                        .with_lock(|| async {
                            let nonce = authority.next().await.unwrap();
                            tokio::task::yield_now().await;
                            arrivals.lock().unwrap().push(nonce.value());
                        })
                        .await;
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        let arrivals = arrivals.lock().unwrap();
        assert_eq!(arrivals.len(), 120);
        assert!(
            arrivals.windows(2).all(|w| w[0] < w[1]),
            "exchange saw a nonce lower than its predecessor"
        );
    }

    #[test]
    fn test_second_caller_waits_for_the_first() {
        let serializer = CallSerializer::new("paper");
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let mut first = tokio_test::task::spawn(serializer.with_lock(|| async move {
            let _ = released.await;
        }));
        assert_pending!(first.poll());

        let mut second = tokio_test::task::spawn(serializer.with_lock(|| async { 7 }));
        assert_pending!(second.poll());
        assert_eq!(serializer.stats().waiting, 1);

        release.send(()).unwrap();
        assert_ready!(first.poll());
        assert!(second.is_woken());
        assert_eq!(assert_ready!(second.poll()), 7);
        assert_eq!(serializer.stats().completed, 2);
    }
}
