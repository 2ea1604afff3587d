//! Fast memory region remapping.
//!
//! A pool hands out a bounded number of remap entries. Each entry is owned by exactly one
//! [`FmrHandle`], and the handle unmaps the region and returns the entry when it is released or
//! dropped, whichever comes first.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::iu::Segment;
use super::transport::{ChannelTransport, FmrRegion};
use crate::{Error, Result};

struct PoolInner {
    transport: Arc<dyn ChannelTransport>,
    capacity: usize,
    in_use: Mutex<usize>,
}

/// A bounded pool of remap entries for one channel.
#[derive(Clone)]
pub struct FmrPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for FmrPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FmrPool")
            .field("capacity", &self.inner.capacity)
            .field("in_use", &*self.inner.in_use.lock())
            .finish()
    }
}

impl FmrPool {
    /// A pool of `capacity` entries mapping through `transport`.
    pub fn new(transport: Arc<dyn ChannelTransport>, capacity: usize) -> FmrPool {
        FmrPool {
            inner: Arc::new(PoolInner {
                transport,
                capacity,
                in_use: Mutex::new(0),
            }),
        }
    }

    /// Remap `segments` into one region.
    ///
    /// # Errors
    ///
    ///  - `InsufficientResources`: every entry is in use.
    ///  - Whatever the transport refused the mapping with.
    pub fn map(&self, segments: &[Segment]) -> Result<FmrHandle> {
        {
            let mut in_use = self.inner.in_use.lock();
            if *in_use >= self.inner.capacity {
                return Err(Error::InsufficientResources);
            }
            *in_use += 1;
        }
        match self.inner.transport.map_fmr(segments) {
            Ok(region) => Ok(FmrHandle {
                region: Some(region),
                pool: self.inner.clone(),
            }),
            Err(e) => {
                *self.inner.in_use.lock() -= 1;
                Err(e)
            }
        }
    }

    /// Entries not currently in use.
    pub fn available(&self) -> usize {
        self.inner.capacity - *self.inner.in_use.lock()
    }
}

/// Ownership of one mapped region.
pub struct FmrHandle {
    region: Option<FmrRegion>,
    pool: Arc<PoolInner>,
}

impl fmt::Debug for FmrHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FmrHandle").field("region", &self.region).finish()
    }
}

impl FmrHandle {
    /// The remapped range.
    pub fn segment(&self) -> Segment {
        self.region.map(|r| r.segment).unwrap_or_default()
    }

    /// Unmap now.
    pub fn release(mut self) {
        self.unmap();
    }

    fn unmap(&mut self) {
        if let Some(region) = self.region.take() {
            self.pool.transport.unmap_fmr(region);
            *self.pool.in_use.lock() -= 1;
        }
    }
}

impl Drop for FmrHandle {
    fn drop(&mut self) {
        self.unmap();
    }
}
