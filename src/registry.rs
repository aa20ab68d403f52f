//! Process-wide registry mapping a string id to a named pure function:
//! an activation (`tensor -> tensor`), a loss (`pred, target -> tensor`), or
//! a layer transform (`tensor -> tensor`). Mirrors the mutex-guarded
//! singleton shape of the original function registry, but as three
//! separate maps rather than one keyed by a type tag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{HarmonicsError, HarmonicsResult};
use crate::tensor::Tensor;

pub type ActivationFn = Arc<dyn Fn(&Tensor) -> Tensor + Send + Sync>;
pub type LossFn = Arc<dyn Fn(&Tensor, &Tensor) -> Tensor + Send + Sync>;
pub type LayerFn = Arc<dyn Fn(&Tensor) -> Tensor + Send + Sync>;

#[derive(Default)]
struct Maps {
    activations: HashMap<String, ActivationFn>,
    losses: HashMap<String, LossFn>,
    layers: HashMap<String, LayerFn>,
}

/// A registry of named activation/loss/layer functions. Cheap to clone
/// (shares the underlying maps via `Arc`); `Clone` is provided so a runtime
/// can carry its own registry alongside a graph without a global.
#[derive(Clone)]
pub struct FunctionRegistry {
    inner: Arc<Mutex<Maps>>,
}

impl FunctionRegistry {
    /// An empty registry with no functions bound.
    pub fn empty() -> Self {
        Self { inner: Arc::new(Mutex::new(Maps::default())) }
    }

    /// A registry pre-populated with the engine's built-in functions:
    /// activations `relu`, `identity`, `sigmoid`; loss `mse` (elementwise
    /// squared error).
    pub fn with_builtins() -> Self {
        let reg = Self::empty();
        reg.register_activation("relu", Arc::new(builtin_relu), true).expect("builtins never collide");
        reg.register_activation("identity", Arc::new(builtin_identity), true).expect("builtins never collide");
        reg.register_activation("sigmoid", Arc::new(builtin_sigmoid), true).expect("builtins never collide");
        reg.register_loss("mse", Arc::new(builtin_mse), true).expect("builtins never collide");
        reg
    }

    pub fn register_activation(&self, id: &str, f: ActivationFn, allow_override: bool) -> HarmonicsResult<()> {
        let mut maps = self.inner.lock().expect("registry mutex poisoned");
        if !allow_override && maps.activations.contains_key(id) {
            return Err(HarmonicsError::DuplicateFunction(id.to_string()));
        }
        maps.activations.insert(id.to_string(), f);
        Ok(())
    }

    pub fn register_loss(&self, id: &str, f: LossFn, allow_override: bool) -> HarmonicsResult<()> {
        let mut maps = self.inner.lock().expect("registry mutex poisoned");
        if !allow_override && maps.losses.contains_key(id) {
            return Err(HarmonicsError::DuplicateFunction(id.to_string()));
        }
        maps.losses.insert(id.to_string(), f);
        Ok(())
    }

    pub fn register_layer(&self, id: &str, f: LayerFn, allow_override: bool) -> HarmonicsResult<()> {
        let mut maps = self.inner.lock().expect("registry mutex poisoned");
        if !allow_override && maps.layers.contains_key(id) {
            return Err(HarmonicsError::DuplicateFunction(id.to_string()));
        }
        maps.layers.insert(id.to_string(), f);
        Ok(())
    }

    pub fn activation(&self, id: &str) -> HarmonicsResult<ActivationFn> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .activations
            .get(id)
            .cloned()
            .ok_or_else(|| HarmonicsError::UnknownActivation(id.to_string()))
    }

    pub fn loss(&self, id: &str) -> HarmonicsResult<LossFn> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .losses
            .get(id)
            .cloned()
            .ok_or_else(|| HarmonicsError::UnknownLoss(id.to_string()))
    }

    pub fn layer(&self, id: &str) -> HarmonicsResult<LayerFn> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .layers
            .get(id)
            .cloned()
            .ok_or_else(|| HarmonicsError::UnknownActivation(id.to_string()))
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn elementwise_f32(t: &Tensor, f: impl Fn(f32) -> f32) -> Tensor {
    let data: Vec<f32> = t.as_f32().into_iter().map(f).collect();
    Tensor::from_f32(t.shape().to_vec(), &data)
}

fn builtin_relu(t: &Tensor) -> Tensor {
    elementwise_f32(t, |x| x.max(0.0))
}

fn builtin_identity(t: &Tensor) -> Tensor {
    t.clone()
}

fn builtin_sigmoid(t: &Tensor) -> Tensor {
    elementwise_f32(t, |x| 1.0 / (1.0 + (-x).exp()))
}

/// Elementwise squared error `(pred - target)^2`. Not a gradient: the
/// registry holds pure forward functions, and training consumes this value
/// directly as the per-element loss contribution.
fn builtin_mse(pred: &Tensor, target: &Tensor) -> Tensor {
    let p = pred.as_f32();
    let t = target.as_f32();
    let data: Vec<f32> = p.iter().zip(t.iter()).map(|(a, b)| (a - b) * (a - b)).collect();
    Tensor::from_f32(pred.shape().to_vec(), &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_clamps_negatives() {
        let reg = FunctionRegistry::with_builtins();
        let f = reg.activation("relu").unwrap();
        let out = f(&Tensor::from_f32(vec![3], &[-1.0, 0.0, 2.0]));
        assert_eq!(out.as_f32(), vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn mse_matches_elementwise_squared_error() {
        let reg = FunctionRegistry::with_builtins();
        let f = reg.loss("mse").unwrap();
        let pred = Tensor::from_f32(vec![2], &[0.5, 0.5]);
        let target = Tensor::from_f32(vec![2], &[1.0, 0.0]);
        let out = f(&pred, &target);
        assert_eq!(out.as_f32(), vec![0.25, 0.25]);
    }

    #[test]
    fn unknown_activation_errors() {
        let reg = FunctionRegistry::empty();
        assert!(reg.activation("nope").is_err());
    }

    #[test]
    fn duplicate_registration_rejected_without_override() {
        let reg = FunctionRegistry::empty();
        reg.register_activation("x", Arc::new(builtin_identity), true).unwrap();
        let err = reg.register_activation("x", Arc::new(builtin_identity), false);
        assert!(err.is_err());
    }
}
