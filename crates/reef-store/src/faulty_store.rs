//! A [`DurableStore`] wrapper that injects latency and failures.
//!
//! `FaultyStore` wraps any `Arc<dyn DurableStore>`. Latency ranges are drawn
//! from a seeded RNG for reproducible runs; failure switches can be flipped
//! at any time while the store is shared.
//!
//! # Example
//!
//! ```ignore
//! let store = FaultyStore::new(inner)
//!     .read_latency(5, 20)
//!     .write_latency(10, 30)
//!     .seed(42);
//! store.set_fail_writes(true);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use reef_types::{Cid, ShardId};

use crate::error::StoreError;
use crate::traits::{DurableStore, StorageCapacity};

/// Fault-injecting store wrapper for tests and chaos runs.
pub struct FaultyStore {
    inner: Arc<dyn DurableStore>,
    read_latency_ms: (u64, u64),
    write_latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    corrupt_reads: AtomicBool,
}

impl FaultyStore {
    /// Wrap an existing store as a pass-through.
    pub fn new(inner: Arc<dyn DurableStore>) -> Self {
        Self {
            inner,
            read_latency_ms: (0, 0),
            write_latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            corrupt_reads: AtomicBool::new(false),
        }
    }

    /// Set the read latency range in milliseconds (uniform random).
    pub fn read_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.read_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the write latency range in milliseconds (uniform random).
    pub fn write_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.write_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the RNG seed.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Make every `put` and `delete` fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every `get` fail with [`StoreError::Unavailable`].
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Flip a bit in every blob returned by `get`.
    pub fn set_corrupt_reads(&self, corrupt: bool) {
        self.corrupt_reads.store(corrupt, Ordering::SeqCst);
    }

    async fn delay(&self, range: (u64, u64)) {
        let (min, max) = range;

        if max == 0 {
            return;
        }

        let ms = if min == max {
            min
        } else {
            self.rng
                .lock()
                .expect("lock poisoned")
                .random_range(min..=max)
        };

        if ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
        }
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DurableStore for FaultyStore {
    async fn put(&self, shard_id: &ShardId, payload: Bytes) -> Result<Cid, StoreError> {
        self.delay(self.write_latency_ms).await;
        self.check_writes()?;
        self.inner.put(shard_id, payload).await
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, StoreError> {
        self.delay(self.read_latency_ms).await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        let data = self.inner.get(cid).await?;
        if self.corrupt_reads.load(Ordering::SeqCst) {
            return Ok(data.map(|bytes| {
                let mut flipped = bytes.to_vec();
                match flipped.last_mut() {
                    Some(last) => *last ^= 0x01,
                    None => flipped.push(0x01),
                }
                Bytes::from(flipped)
            }));
        }
        Ok(data)
    }

    async fn delete(&self, shard_id: &ShardId, cid: &Cid) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        self.check_writes()?;
        self.inner.delete(shard_id, cid).await
    }

    async fn contains(&self, cid: &Cid) -> Result<bool, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.contains(cid).await
    }

    async fn list(&self) -> Result<Vec<Cid>, StoreError> {
        self.inner.list().await
    }

    async fn capacity(&self) -> Result<StorageCapacity, StoreError> {
        self.inner.capacity().await
    }

    async fn verify(&self, cid: &Cid) -> Result<bool, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.verify(cid).await
    }
}
