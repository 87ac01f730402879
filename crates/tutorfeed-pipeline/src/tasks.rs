use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Fire-and-forget side work (bumps, duplicate detection, notifications). A failing or
/// panicking task is logged with its name and counted; it never reaches the caller.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
    failures: Arc<AtomicU64>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let failures = self.failures.clone();
        let task = async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!(task = name, error = %format!("{err:#}"), "background task failed");
                }
                Err(_) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    error!(task = name, "background task panicked");
                }
            }
        };
        let mut set = self.lock();
        // Finished tasks are dropped here so a long-running worker does not accumulate them.
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Wait for every task submitted so far, including tasks they submit in turn.
    pub async fn drain(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.lock());
            if set.is_empty() {
                return;
            }
            while let Some(joined) = set.join_next().await {
                if let Err(err) = joined {
                    if !err.is_cancelled() {
                        error!(error = %err, "background task join failed");
                    }
                }
            }
        }
    }
}
