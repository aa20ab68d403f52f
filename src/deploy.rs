//! The deployment descriptor a cycle runtime (and, per-partition, the
//! distributed scheduler) is constructed from: which backend to prefer and
//! whether secure-mode proof chaining is on.

use crate::backend::RequestedBackend;

/// Relative weight used by [`crate::graph::partition::auto_partition`]-style
/// layer distribution: a GPU partition is assumed to carry four times the
/// throughput of a CPU one.
pub fn backend_weight(backend: RequestedBackend) -> u32 {
    match backend {
        RequestedBackend::Gpu => 4,
        RequestedBackend::Fpga => 2,
        RequestedBackend::Cpu | RequestedBackend::Auto => 1,
        RequestedBackend::Wasm => 1,
    }
}

/// Describes how a single runtime (or a single partition's runtime, inside
/// a distributed deployment) should be constructed.
#[derive(Clone, Copy, Debug)]
pub struct Deployment {
    pub backend: RequestedBackend,
    /// When set, the runtime recomputes a proof after every forward pass
    /// and the distributed scheduler exchanges proofs across boundaries.
    pub secure: bool,
    /// Enables the multi-threaded CPU forward path (arrows within one flow
    /// line scheduled on a pool, joined before the next line).
    pub multithreaded: bool,
}

impl Deployment {
    pub fn new(backend: RequestedBackend) -> Self {
        Self { backend, secure: false, multithreaded: false }
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn multithreaded(mut self, multithreaded: bool) -> Self {
        self.multithreaded = multithreaded;
        self
    }
}

impl Default for Deployment {
    fn default() -> Self {
        Self::new(RequestedBackend::Auto)
    }
}
