use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_std::sync::Mutex;
use async_std::sync::{Condvar, MutexGuard};

#[async_trait::async_trait]
pub trait CancellationToken: 'static + Send + Sync {
    async fn wait(&self);

    fn is_cancelled(&self) -> bool;
}

/// A cancellation token that is triggered exactly once, by a call to
/// `trigger()`. Cheap to check (`is_cancelled`) and cheap to clone (wrap in
/// an `Arc`).
#[derive(Default)]
pub struct TriggerableCancellationToken {
    triggered: AtomicBool,
    waiters: Mutex<()>,
    condvar: Condvar,
}

impl TriggerableCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _guard: MutexGuard<()> = self.waiters.lock().await;
        self.condvar.notify_all();
    }
}

#[async_trait::async_trait]
impl CancellationToken for TriggerableCancellationToken {
    async fn wait(&self) {
        loop {
            if self.triggered.load(Ordering::SeqCst) {
                return;
            }

            let guard = self.waiters.lock().await;
            if self.triggered.load(Ordering::SeqCst) {
                return;
            }
            let _ = self.condvar.wait(guard).await;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// Cancelled when either of the two wrapped tokens is cancelled.
pub struct EitherCancelledToken<A, B> {
    a: Arc<A>,
    b: Arc<B>,
}

impl<A, B> EitherCancelledToken<A, B> {
    pub fn new(a: Arc<A>, b: Arc<B>) -> Self {
        Self { a, b }
    }
}

#[async_trait::async_trait]
impl<A: CancellationToken, B: CancellationToken> CancellationToken for EitherCancelledToken<A, B> {
    async fn wait(&self) {
        futures::future::select(Box::pin(self.a.wait()), Box::pin(self.b.wait())).await;
    }

    fn is_cancelled(&self) -> bool {
        self.a.is_cancelled() || self.b.is_cancelled()
    }
}
