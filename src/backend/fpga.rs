//! FPGA backend stub. Real hardware dispatch is gated behind the
//! `HARMONICS_ENABLE_QUANTUM_HW`-style runtime probe described in the
//! device interconnect notes; until a bitstream loader is wired in this
//! backend degrades to the CPU reference kernels whenever its probe
//! succeeds, so callers can exercise the FPGA code path in CI without
//! real silicon.

use std::env;

use super::{cpu::CpuBackend, Backend};
use crate::error::HarmonicsResult;
use crate::tensor::Tensor;

#[derive(Debug, Default)]
pub struct FpgaBackend {
    reference: CpuBackend,
}

impl FpgaBackend {
    /// The hardware-backend shared-library name configured via
    /// `HARMONICS_QUANTUM_HW_LIB`, if any. Recorded for diagnostics; no
    /// bitstream loader exists yet so it does not change dispatch.
    pub fn configured_lib(&self) -> Option<String> {
        env::var("HARMONICS_QUANTUM_HW_LIB").ok()
    }
}

impl Backend for FpgaBackend {
    fn name(&self) -> &'static str {
        "fpga"
    }

    fn is_available(&self) -> bool {
        env::var("HARMONICS_ENABLE_QUANTUM_HW").as_deref() == Ok("1")
    }

    fn dispatch(&self, shader: &str, inputs: &[&Tensor]) -> HarmonicsResult<Tensor> {
        self.reference.dispatch(shader, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_without_env_flag() {
        std::env::remove_var("HARMONICS_ENABLE_QUANTUM_HW");
        assert!(!FpgaBackend::default().is_available());
    }

    #[test]
    fn dispatches_through_reference_kernels_when_probed() {
        let backend = FpgaBackend::default();
        let x = Tensor::from_f32(vec![2], &[-1.0, 2.0]);
        let out = backend.dispatch("relu_f32", &[&x]).unwrap();
        assert_eq!(out.as_f32(), vec![0.0, 2.0]);
    }
}
