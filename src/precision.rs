//! Per-layer bit-width selection. A `PrecisionPolicy` answers, for a given
//! layer index, how many bits its activations should carry during a cycle;
//! the kernel cache folds this answer into its compile key so a precision
//! change invalidates exactly the shaders that depend on it.

/// Selects the bit width to use for a layer's activations during a cycle.
pub trait PrecisionPolicy: Send + Sync {
    fn select_bits(&self, layer_index: usize) -> u32;
}

/// Every layer uses the same fixed width.
#[derive(Clone, Copy, Debug)]
pub struct FixedWidth(pub u32);

impl PrecisionPolicy for FixedWidth {
    fn select_bits(&self, _layer_index: usize) -> u32 {
        self.0
    }
}

/// Every layer uses the widest supported width (32 bits).
#[derive(Clone, Copy, Debug, Default)]
pub struct MaxBits;

impl PrecisionPolicy for MaxBits {
    fn select_bits(&self, _layer_index: usize) -> u32 {
        32
    }
}

/// Derives a uniform bit width from an entropy (error-probability) bound:
/// `bits = ceil(-log2(limit))`, clamped to `2..=32`. The same width is used
/// for every layer; a non-positive limit is treated as "no bound" (32 bits).
#[derive(Clone, Copy, Debug)]
pub struct EntropyLimited {
    pub limit: f32,
}

impl EntropyLimited {
    pub fn new(limit: f32) -> Self {
        Self { limit }
    }
}

impl PrecisionPolicy for EntropyLimited {
    fn select_bits(&self, _layer_index: usize) -> u32 {
        if self.limit <= 0.0 {
            return 32;
        }
        let bits = (-self.limit.log2()).ceil() as i64;
        bits.clamp(2, 32) as u32
    }
}

/// Explicit bits per layer index, with a fallback for indices not listed.
#[derive(Clone, Debug)]
pub struct PerLayerLookup {
    pub bits: Vec<u32>,
    pub fallback_bits: u32,
}

impl PrecisionPolicy for PerLayerLookup {
    fn select_bits(&self, layer_index: usize) -> u32 {
        self.bits.get(layer_index).copied().unwrap_or(self.fallback_bits)
    }
}

/// Delegates to whatever width the active backend reports as native for the
/// given layer, falling back to a default when the backend has no opinion.
pub struct HardwareGuided {
    pub native_bits: Box<dyn Fn(usize) -> Option<u32> + Send + Sync>,
    pub default_bits: u32,
}

impl PrecisionPolicy for HardwareGuided {
    fn select_bits(&self, layer_index: usize) -> u32 {
        (self.native_bits)(layer_index).unwrap_or(self.default_bits)
    }
}

impl HardwareGuided {
    /// Returns 16 bits for every layer when `backend_name` is `"gpu"`, else
    /// 32 — the resolved backend's name is known once, at runtime
    /// construction, so no per-layer probe is needed.
    pub fn for_backend(backend_name: &str) -> Self {
        let is_gpu = backend_name == "gpu";
        Self { native_bits: Box::new(move |_layer| is_gpu.then_some(16)), default_bits: 32 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_limited_derives_bits_from_log2_of_limit() {
        // -log2(0.25) = 2, already an integer, so ceil is a no-op.
        let p = EntropyLimited::new(0.25);
        assert_eq!(p.select_bits(0), 2);
        assert_eq!(p.select_bits(7), 2);

        // -log2(0.01) ~= 6.64 -> ceil to 7.
        let p = EntropyLimited::new(0.01);
        assert_eq!(p.select_bits(0), 7);
    }

    #[test]
    fn entropy_limited_clamps_to_2_and_32() {
        // A limit near 1.0 drives bits toward 0, clamped up to the floor of 2.
        let p = EntropyLimited::new(0.999);
        assert_eq!(p.select_bits(0), 2);

        // A vanishingly small limit drives bits far past 32, clamped down.
        let p = EntropyLimited::new(1e-20);
        assert_eq!(p.select_bits(0), 32);

        // Non-positive limit means "unbounded": full precision.
        let p = EntropyLimited::new(0.0);
        assert_eq!(p.select_bits(0), 32);
    }

    #[test]
    fn per_layer_lookup_falls_back() {
        let p = PerLayerLookup { bits: vec![16, 8], fallback_bits: 32 };
        assert_eq!(p.select_bits(0), 16);
        assert_eq!(p.select_bits(5), 32);
    }

    #[test]
    fn hardware_guided_prefers_16_bits_on_gpu() {
        let gpu = HardwareGuided::for_backend("gpu");
        assert_eq!(gpu.select_bits(0), 16);
        let cpu = HardwareGuided::for_backend("cpu");
        assert_eq!(cpu.select_bits(0), 32);
    }
}
