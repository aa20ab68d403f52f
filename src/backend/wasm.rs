//! Wasm backend: a byte-copying forward pass, semantically identical to the
//! CPU reference. On a real `wasm32` target this is where a SIMD-accelerated
//! f32 copy would live; off-target it simply delegates, so the same
//! dispatch table works in host-side tests.

use std::env;

use super::{cpu::CpuBackend, Backend};
use crate::error::HarmonicsResult;
use crate::tensor::Tensor;

#[derive(Debug, Default)]
pub struct WasmBackend {
    reference: CpuBackend,
}

impl Backend for WasmBackend {
    fn name(&self) -> &'static str {
        "wasm"
    }

    fn is_available(&self) -> bool {
        cfg!(target_arch = "wasm32") || env::var("HARMONICS_ENABLE_WASM").as_deref() == Ok("1")
    }

    fn dispatch(&self, shader: &str, inputs: &[&Tensor]) -> HarmonicsResult<Tensor> {
        self.reference.dispatch(shader, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_copies_bytes_unchanged() {
        let backend = WasmBackend::default();
        let x = Tensor::from_f32(vec![2], &[1.0, 2.0]);
        let out = backend.dispatch("copy_buf", &[&x]).unwrap();
        assert_eq!(out.as_f32(), x.as_f32());
    }
}
