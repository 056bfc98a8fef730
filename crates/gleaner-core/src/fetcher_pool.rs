//! Pool of interchangeable [`PageFetcher`] instances.
//!
//! Workers borrow a fetcher for the duration of one attempt. The guard puts
//! it back on drop, so a fetcher is returned whether the attempt succeeded,
//! failed, timed out or was cancelled. Pool size is independent of the
//! number of workers.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::AppError;
use crate::traits::PageFetcher;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct FetcherPool<F> {
    idle: Arc<Mutex<Vec<F>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl<F> Clone for FetcherPool<F> {
    fn clone(&self) -> Self {
        Self {
            idle: self.idle.clone(),
            permits: self.permits.clone(),
            size: self.size,
        }
    }
}

impl<F: PageFetcher> FetcherPool<F> {
    /// Build a pool from distinct fetcher instances.
    pub fn new(fetchers: Vec<F>) -> Result<Self, AppError> {
        if fetchers.is_empty() {
            return Err(AppError::ConfigError(
                "fetcher pool needs at least one fetcher".into(),
            ));
        }
        let size = fetchers.len();
        Ok(Self {
            idle: Arc::new(Mutex::new(fetchers)),
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    /// Pool of `size` clones of one fetcher.
    pub fn replicate(fetcher: F, size: usize) -> Result<Self, AppError> {
        Self::new(vec![fetcher; size])
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free fetcher.
    pub async fn acquire(&self) -> Result<PooledFetcher<F>, AppError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Generic("fetcher pool closed".into()))?;

        let fetcher = lock(&self.idle)
            .pop()
            .ok_or_else(|| AppError::Generic("fetcher pool permit without an idle fetcher".into()))?;

        Ok(PooledFetcher {
            fetcher,
            idle: self.idle.clone(),
            _permit: permit,
        })
    }
}

/// A fetcher borrowed from a [`FetcherPool`]. Returned to the pool on drop.
pub struct PooledFetcher<F: Clone> {
    fetcher: F,
    idle: Arc<Mutex<Vec<F>>>,
    // Released after `Drop::drop` has put the fetcher back.
    _permit: OwnedSemaphorePermit,
}

impl<F: Clone> Deref for PooledFetcher<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.fetcher
    }
}

impl<F: Clone> Drop for PooledFetcher<F> {
    fn drop(&mut self) {
        lock(&self.idle).push(self.fetcher.clone());
    }
}
