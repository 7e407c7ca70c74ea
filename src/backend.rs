//! The seam between the index core and its external collaborators:
//! save brackets, cluster I/O, transaction hooks, accounting and the
//! per-value lock protocol. The core calls these, never defines them;
//! the transaction, accounting and value-lock hooks default to no-ops so
//! implementors only provide what their system has.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::trace;

use crate::error::Error;
use crate::tree::node::ValueRef;

pub trait Backend: Send + Sync {
    /// Brackets a full-image save.
    fn start_full_save(&self) -> Result<(), Error>;
    fn finish_full_save(&self) -> Result<(), Error>;

    /// All-or-nothing block write of one cluster at `dev_offset`.
    fn write_cluster(&self, dev_offset: u64, data: &[u8]) -> Result<(), Error>;

    /// All-or-nothing block read of one cluster; returns the bytes read.
    fn read_cluster(&self, dev_offset: u64, buf: &mut [u8]) -> Result<usize, Error>;

    fn start_transaction(&self) -> Result<(), Error> {
        Ok(())
    }

    fn finish_transaction(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Node-memory accounting: `delta` bytes were allocated, `total` is
    /// the index's pooled footprint afterwards.
    fn on_entry_alloc(&self, _delta: usize, _total: usize) {}

    fn on_entry_free(&self, _delta: usize, _total: usize) {}

    /// Per-value lock protocol. The core transports these calls without
    /// interpreting them.
    fn value_lock(&self, _value: ValueRef) -> Result<(), Error> {
        Ok(())
    }

    fn value_unlock(&self, _value: ValueRef) -> Result<(), Error> {
        Ok(())
    }

    fn value_test_and_lock(&self, _value: ValueRef) -> Result<bool, Error> {
        Ok(true)
    }
}

/// Backend that accepts everything and stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl Backend for NoopBackend {
    fn start_full_save(&self) -> Result<(), Error> {
        Ok(())
    }

    fn finish_full_save(&self) -> Result<(), Error> {
        Ok(())
    }

    fn write_cluster(&self, _dev_offset: u64, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn read_cluster(&self, _dev_offset: u64, _buf: &mut [u8]) -> Result<usize, Error> {
        Ok(0)
    }
}

/// In-memory cluster store: written clusters live in a map keyed by
/// device offset. Transfers are whole clusters only, mirroring the
/// all-or-nothing contract of a real block device.
#[derive(Debug)]
pub struct MemBackend {
    cluster_size: usize,
    clusters: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemBackend {
    pub fn new(cluster_size: usize) -> Self {
        MemBackend {
            cluster_size,
            clusters: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Vec<u8>>> {
        self.clusters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn cluster_count(&self) -> usize {
        self.map().len()
    }

    pub fn cluster(&self, dev_offset: u64) -> Option<Vec<u8>> {
        self.map().get(&dev_offset).cloned()
    }
}

impl Backend for MemBackend {
    fn start_full_save(&self) -> Result<(), Error> {
        Ok(())
    }

    fn finish_full_save(&self) -> Result<(), Error> {
        Ok(())
    }

    fn write_cluster(&self, dev_offset: u64, data: &[u8]) -> Result<(), Error> {
        if data.len() != self.cluster_size {
            return Err(Error::IoFailure);
        }
        trace!("writing cluster at device offset {dev_offset:#x}");
        self.map().insert(dev_offset, data.to_vec());
        Ok(())
    }

    fn read_cluster(&self, dev_offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.len() != self.cluster_size {
            return Err(Error::IoFailure);
        }
        let map = self.map();
        let data = map.get(&dev_offset).ok_or(Error::Absent)?;
        buf.copy_from_slice(data);
        Ok(data.len())
    }
}
