//! bounded pool of request/response buffer pairs
//!
//! Every in-flight request holds one `TransitData` for its whole lifetime.
//! The pool never allocates more than its capacity; once all pairs are
//! rented, renting either fails right away or waits up to the configured
//! timeout.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::dns::context::TransportConfig;
use crate::dns::netutil::{Result, TransportError};

#[derive(Debug)]
pub struct TransitData {
    request: Box<[u8]>,
    response: Box<[u8]>,
}

impl TransitData {
    fn new(message_size: usize) -> TransitData {
        TransitData {
            request: vec![0; message_size].into_boxed_slice(),
            response: vec![0; message_size].into_boxed_slice(),
        }
    }

    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut [u8] {
        &mut self.request
    }

    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// Both buffers at once, for handing a request to a handler.
    pub fn split_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut self.request, &mut self.response)
    }
}

#[derive(Debug)]
struct PoolInner {
    message_size: usize,
    capacity: usize,
    rent_timeout: Option<Duration>,
    permits: Arc<Semaphore>,
    free: Mutex<Vec<TransitData>>,
}

#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(message_size: usize, capacity: usize, rent_timeout: Option<Duration>) -> BufferPool {
        BufferPool {
            inner: Arc::new(PoolInner {
                message_size,
                capacity,
                rent_timeout,
                permits: Arc::new(Semaphore::new(capacity)),
                free: Mutex::new(Vec::with_capacity(capacity)),
            }),
        }
    }

    pub fn from_config(config: &TransportConfig) -> BufferPool {
        BufferPool::new(
            config.message_size(),
            config.pool_capacity,
            config.rent_timeout(),
        )
    }

    pub fn message_size(&self) -> usize {
        self.inner.message_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of pairs that can be rented right now.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Rents a pair without waiting.
    pub fn try_rent(&self) -> Result<PooledTransit> {
        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| TransportError::PoolExhausted)?;

        Ok(self.checkout(permit))
    }

    /// Rents a pair, waiting up to the rent timeout if one is configured.
    pub async fn rent(&self) -> Result<PooledTransit> {
        let timeout = match self.inner.rent_timeout {
            Some(timeout) => timeout,
            None => return self.try_rent(),
        };

        let acquire = self.inner.permits.clone().acquire_owned();
        let permit = match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(TransportError::PoolExhausted),
        };

        Ok(self.checkout(permit))
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> PooledTransit {
        let reused = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let data = match reused {
            Some(data) => data,
            None => {
                trace!(size = self.inner.message_size, "allocating transit buffers");
                TransitData::new(self.inner.message_size)
            }
        };

        PooledTransit {
            data: Some(data),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }
}

/// A rented pair. Dropping it hands the buffers back to the pool.
#[derive(Debug)]
pub struct PooledTransit {
    data: Option<TransitData>,
    pool: Arc<PoolInner>,
    // released after the buffers are back on the free list
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledTransit {
    type Target = TransitData;

    fn deref(&self) -> &TransitData {
        match self.data {
            Some(ref data) => data,
            None => unreachable!("transit data is only taken on drop"),
        }
    }
}

impl DerefMut for PooledTransit {
    fn deref_mut(&mut self) -> &mut TransitData {
        match self.data {
            Some(ref mut data) => data,
            None => unreachable!("transit data is only taken on drop"),
        }
    }
}

impl Drop for PooledTransit {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            let mut free = self
                .pool
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if free.len() < self.pool.capacity {
                free.push(data);
            }
        }
    }
}
