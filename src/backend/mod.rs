//! Execution backends: CPU (always available), GPU (behind the `cuda`
//! feature), FPGA and Wasm (probe-gated, mostly stubs until real hardware is
//! wired in). Every backend runs the same vocabulary of named shaders
//! (`relu_f32`, `sigmoid_f32`, `copy_buf`, ...) so the runtime can dispatch
//! without knowing which backend is underneath.

pub mod cpu;
pub mod fpga;
#[cfg(feature = "cuda")]
pub mod gpu;
pub mod wasm;

use std::fmt::Debug;

use crate::error::{HarmonicsError, HarmonicsResult};
use crate::tensor::Tensor;

/// A named, stateless compute kernel dispatched by id. Backends register the
/// shader names they support and reject anything else with
/// `HarmonicsError::CompileFailed`/`UnsupportedDType`.
pub trait Backend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Runs `shader` against `inputs`, returning a freshly allocated result
    /// tensor. Every backend must at least implement `relu_f32`,
    /// `sigmoid_f32`, `identity_f32` and `copy_buf`.
    fn dispatch(&self, shader: &str, inputs: &[&Tensor]) -> HarmonicsResult<Tensor>;

    /// Whether this backend is usable in the current process (drivers
    /// present, feature compiled in, etc).
    fn is_available(&self) -> bool {
        true
    }
}

/// Resolves the backend to use, honouring `HARMONICS_BACKEND`
/// (`cpu`/`gpu`/`fpga`/`wasm`) when set, and otherwise preferring the most
/// capable backend available: GPU, then FPGA, then CPU. Wasm is only ever
/// chosen explicitly or when compiled for a `wasm32` target.
pub fn resolve_backend() -> Box<dyn Backend> {
    if let Ok(requested) = std::env::var("HARMONICS_BACKEND") {
        if let Some(backend) = backend_by_name(&requested) {
            if backend.is_available() {
                return backend;
            }
        }
    }

    #[cfg(target_arch = "wasm32")]
    {
        return Box::new(wasm::WasmBackend::default());
    }

    #[cfg(feature = "cuda")]
    {
        let gpu = gpu::GpuBackend::new();
        if gpu.is_available() {
            return Box::new(gpu);
        }
    }

    let fpga_backend = fpga::FpgaBackend::default();
    if fpga_backend.is_available() {
        return Box::new(fpga_backend);
    }

    Box::new(cpu::CpuBackend::default())
}

fn backend_by_name(name: &str) -> Option<Box<dyn Backend>> {
    match name {
        "cpu" => Some(Box::new(cpu::CpuBackend::default())),
        "fpga" => Some(Box::new(fpga::FpgaBackend::default())),
        "wasm" => Some(Box::new(wasm::WasmBackend::default())),
        #[cfg(feature = "cuda")]
        "gpu" => Some(Box::new(gpu::GpuBackend::new())),
        #[cfg(not(feature = "cuda"))]
        "gpu" => None,
        _ => None,
    }
}

fn make_gpu() -> Box<dyn Backend> {
    #[cfg(feature = "cuda")]
    {
        Box::new(gpu::GpuBackend::new())
    }
    #[cfg(not(feature = "cuda"))]
    {
        Box::new(UnavailableBackend("gpu"))
    }
}

/// A stand-in for a backend whose platform support was not compiled in;
/// always reports unavailable so the resolver's fallback path takes over.
#[derive(Debug)]
struct UnavailableBackend(&'static str);

impl Backend for UnavailableBackend {
    fn name(&self) -> &'static str {
        self.0
    }

    fn is_available(&self) -> bool {
        false
    }

    fn dispatch(&self, _shader: &str, _inputs: &[&Tensor]) -> HarmonicsResult<Tensor> {
        Err(HarmonicsError::DeviceUnavailable(self.0.to_string()))
    }
}

/// The backend a deployment descriptor asked for, before precedence-driven
/// fallback is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestedBackend {
    Cpu,
    Gpu,
    Fpga,
    Wasm,
    Auto,
}

/// Resolves a requested backend following the precedence in the runtime
/// design: `gpu` tries GPU then FPGA; `fpga` tries FPGA then GPU; `wasm`
/// tries Wasm only (falling back silently to CPU if unavailable); `cpu`/
/// `auto` defer to [`select_accelerator_backend`]. A "try" means the
/// backend's `is_available()` probe must succeed; any failure falls through
/// to CPU.
pub fn resolve_for_request(requested: RequestedBackend) -> Box<dyn Backend> {
    match requested {
        RequestedBackend::Gpu => try_in_order(&[make_gpu, || Box::new(fpga::FpgaBackend::default())]),
        RequestedBackend::Fpga => try_in_order(&[|| Box::new(fpga::FpgaBackend::default()), make_gpu]),
        RequestedBackend::Wasm => {
            let wasm = wasm::WasmBackend::default();
            if wasm.is_available() {
                Box::new(wasm)
            } else {
                Box::new(cpu::CpuBackend::default())
            }
        }
        RequestedBackend::Cpu | RequestedBackend::Auto => select_accelerator_backend(),
    }
}

fn try_in_order(factories: &[fn() -> Box<dyn Backend>]) -> Box<dyn Backend> {
    for make in factories {
        let backend = make();
        if backend.is_available() {
            return backend;
        }
    }
    Box::new(cpu::CpuBackend::default())
}

/// Picks the most capable backend present on this platform: Wasm (only on a
/// `wasm32` target or with the Wasm probe enabled), else GPU, else FPGA,
/// else CPU.
pub fn select_accelerator_backend() -> Box<dyn Backend> {
    let wasm = wasm::WasmBackend::default();
    if wasm.is_available() {
        return Box::new(wasm);
    }
    let gpu = make_gpu();
    if gpu.is_available() {
        return gpu;
    }
    let fpga_backend = fpga::FpgaBackend::default();
    if fpga_backend.is_available() {
        return Box::new(fpga_backend);
    }
    Box::new(cpu::CpuBackend::default())
}
