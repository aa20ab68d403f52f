//! Device-side buffer abstraction: allocation, host<->device copy, and a
//! process-wide byte-transfer counter used by tests and diagnostics.

pub mod ring;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HarmonicsError, HarmonicsResult};
use crate::tensor::Tensor;

static BYTES_UPLOADED: AtomicU64 = AtomicU64::new(0);
static BYTES_DOWNLOADED: AtomicU64 = AtomicU64::new(0);

/// Cumulative bytes moved host->device / device->host since process start.
pub fn transfer_stats() -> (u64, u64) {
    (BYTES_UPLOADED.load(Ordering::Relaxed), BYTES_DOWNLOADED.load(Ordering::Relaxed))
}

#[cfg(test)]
pub(crate) fn reset_transfer_stats() {
    BYTES_UPLOADED.store(0, Ordering::Relaxed);
    BYTES_DOWNLOADED.store(0, Ordering::Relaxed);
}

/// An opaque, fixed-capacity region of device memory.
pub trait DeviceBuffer: Send + Sync {
    fn capacity(&self) -> usize;
    fn upload(&mut self, tensor: &Tensor) -> HarmonicsResult<()>;
    fn download(&self) -> HarmonicsResult<Tensor>;
}

/// A plain host-memory buffer used by the CPU backend and by tests; other
/// backends (CUDA, FPGA, Wasm) provide their own `DeviceBuffer` impls.
pub struct HostBuffer {
    capacity: usize,
    tensor: Tensor,
}

impl HostBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, tensor: Tensor::empty() }
    }
}

impl DeviceBuffer for HostBuffer {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn upload(&mut self, tensor: &Tensor) -> HarmonicsResult<()> {
        if tensor.bytes().len() > self.capacity {
            return Err(HarmonicsError::AllocationFailed(format!(
                "tensor of {} bytes exceeds buffer capacity {}",
                tensor.bytes().len(),
                self.capacity
            )));
        }
        BYTES_UPLOADED.fetch_add(tensor.bytes().len() as u64, Ordering::Relaxed);
        self.tensor = tensor.clone();
        Ok(())
    }

    fn download(&self) -> HarmonicsResult<Tensor> {
        BYTES_DOWNLOADED.fetch_add(self.tensor.bytes().len() as u64, Ordering::Relaxed);
        Ok(self.tensor.clone())
    }
}
