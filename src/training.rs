//! The training loop: drives a [`CycleRuntime`] through repeated forward
//! passes, accumulates gradients, and applies an optimiser step once every
//! `accumulate_steps` cycles, honouring gradient clipping and early
//! stopping. Matches the runtime's convention of representing everything —
//! parameters, gradients, moments — as plain [`Tensor`]s indexed by layer.

use std::time::{Duration, Instant};

use crate::error::HarmonicsResult;
use crate::runtime::CycleRuntime;
use crate::tensor::{DType, Tensor};

/// Which update rule [`fit`] applies once accumulated gradients are ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Optimizer {
    Sgd,
    Adam,
    AdamW,
    Lamb,
    RmsProp,
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer::Sgd
    }
}

/// Per-step progress snapshot handed to the caller's progress callback.
pub struct ProgressEvent {
    pub step: usize,
    pub grad_norm: f64,
    pub loss: f64,
    pub learning_rate_used: f64,
}

pub type ProgressCallback = Box<dyn FnMut(&ProgressEvent) + Send>;
/// `step -> right-shift exponent`, used by the integer SGD path.
pub type IntLrSchedule = Box<dyn Fn(usize) -> u32 + Send>;
/// `step -> learning rate`, used by every floating-point optimiser.
pub type FpLrSchedule = Box<dyn Fn(usize) -> f64 + Send>;

pub struct TrainingOptions {
    pub learning_rate: f64,
    pub optimizer: Optimizer,
    pub grad_clip: f64,
    pub early_stop_patience: usize,
    pub early_stop_delta: f64,
    pub weight_decay: f64,
    pub accumulate_steps: usize,
    pub progress: Option<ProgressCallback>,
    pub lr_schedule_int: Option<IntLrSchedule>,
    pub lr_schedule_fp: Option<FpLrSchedule>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            optimizer: Optimizer::Sgd,
            grad_clip: 0.0,
            early_stop_patience: 0,
            early_stop_delta: 0.0,
            weight_decay: 0.0,
            accumulate_steps: 1,
            progress: None,
            lr_schedule_int: None,
            lr_schedule_fp: None,
        }
    }
}

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// Moments and accumulators carried across the whole training run, parallel
/// to the runtime's per-layer `weights` vector.
struct TrainState {
    params: Vec<Tensor>,
    opt1: Vec<Tensor>,
    opt2: Vec<Tensor>,
    accum: Vec<Tensor>,
    accum_count: usize,
    step: usize,
    stall: usize,
    last_grad_norm: f64,
    updated_once: bool,
}

impl TrainState {
    fn for_layers(n: usize) -> Self {
        Self {
            params: vec![Tensor::empty(); n],
            opt1: vec![Tensor::empty(); n],
            opt2: vec![Tensor::empty(); n],
            accum: vec![Tensor::empty(); n],
            accum_count: 0,
            step: 0,
            stall: 0,
            last_grad_norm: f64::INFINITY,
            updated_once: false,
        }
    }
}

/// Trains `runtime` for `epochs` forward/backward cycles (or fewer, if
/// early stopping fires first), returning the number of optimiser steps
/// actually applied.
pub fn fit(runtime: &mut CycleRuntime, epochs: usize, options: &mut TrainingOptions) -> HarmonicsResult<usize> {
    fit_until(runtime, options, |_state| false, Some(epochs))
}

/// Trains until `deadline` elapses, checked at the top of each iteration.
pub fn fit_for_duration(runtime: &mut CycleRuntime, duration: Duration, options: &mut TrainingOptions) -> HarmonicsResult<usize> {
    let start = Instant::now();
    fit_until(runtime, options, move |_state| start.elapsed() >= duration, None)
}

/// Trains until `predicate` returns true after a forward pass, or `max_epochs`
/// forward passes have run (whichever comes first). The predicate receives
/// the number of forward passes completed so far.
pub fn fit_until(
    runtime: &mut CycleRuntime,
    options: &mut TrainingOptions,
    mut predicate: impl FnMut(usize) -> bool,
    max_epochs: Option<usize>,
) -> HarmonicsResult<usize> {
    let n_layers = runtime.graph().layers.len();
    let has_backward = runtime.graph().has_backward_arrow();
    let mut train = TrainState::for_layers(n_layers);

    let mut epoch = 0;
    loop {
        if predicate(epoch) {
            break;
        }
        if let Some(max) = max_epochs {
            if epoch >= max {
                break;
            }
        }

        runtime.forward()?;
        epoch += 1;

        if has_backward {
            for i in 0..n_layers {
                let grad = &runtime.state().weights[i];
                if grad.is_empty() {
                    continue;
                }
                train.accum[i].ensure_allocated_like(grad);
                add_into(&mut train.accum[i], grad);
            }
            train.accum_count += 1;

            if train.accum_count == options.accumulate_steps {
                apply_accumulated_step(runtime, &mut train, options)?;
            }
        }

        if options.early_stop_patience > 0 && train.stall >= options.early_stop_patience {
            break;
        }
    }

    if train.updated_once {
        std::mem::swap(&mut runtime.state_mut().weights, &mut train.params);
    }
    Ok(train.step)
}

#[tracing::instrument(skip(runtime, train, options), fields(optimizer = ?options.optimizer))]
fn apply_accumulated_step(runtime: &mut CycleRuntime, train: &mut TrainState, options: &mut TrainingOptions) -> HarmonicsResult<()> {
    let norm = l2_norm(&train.accum);
    let improvement = train.last_grad_norm - norm;
    if improvement < options.early_stop_delta {
        train.stall += 1;
    } else {
        train.stall = 0;
    }
    train.last_grad_norm = norm;
    train.step += 1;
    let t = train.step;

    let count = train.accum_count as f64;
    for g in &mut train.accum {
        if !g.is_empty() {
            scale_in_place(g, 1.0 / count);
        }
    }

    if options.grad_clip > 0.0 {
        for g in &mut train.accum {
            clip_in_place(g, options.grad_clip);
        }
    }

    let lr_shift = options.lr_schedule_int.as_ref().map(|f| f(t));
    let lr = options.lr_schedule_fp.as_ref().map(|f| f(t)).unwrap_or(options.learning_rate);

    let mut lr_used = lr;
    for i in 0..train.params.len() {
        let grad = &train.accum[i];
        if grad.is_empty() {
            continue;
        }
        let is_integer_grad = grad.dtype() == DType::I32;
        if train.params[i].is_empty() {
            train.params[i] = if is_integer_grad {
                Tensor::zeros(DType::U8, grad.shape().to_vec())
            } else {
                Tensor::zeros(grad.dtype(), grad.shape().to_vec())
            };
        }

        if let Some(shift) = lr_shift {
            if train.params[i].dtype() == DType::U8 && grad.dtype() == DType::I32 {
                apply_integer_sgd(&mut train.params[i], grad, shift);
                lr_used = 1.0 / (1u64 << shift) as f64;
                continue;
            }
        }

        train.opt1[i].ensure_allocated_like(grad);
        train.opt2[i].ensure_allocated_like(grad);
        apply_float_optimizer(options.optimizer, &mut train.params[i], grad, &mut train.opt1[i], &mut train.opt2[i], lr, options.weight_decay, t);
    }
    train.updated_once = true;

    for g in &mut train.accum {
        g.zero();
    }
    train.accum_count = 0;

    if let Some(cb) = options.progress.as_mut() {
        cb(&ProgressEvent { step: train.step, grad_norm: norm, loss: norm, learning_rate_used: lr_used });
    }
    Ok(())
}

fn add_into(dst: &mut Tensor, src: &Tensor) {
    match dst.dtype() {
        DType::F32 => {
            let mut d = dst.as_f32();
            let s = src.as_f32();
            for (a, b) in d.iter_mut().zip(s.iter()) {
                *a += b;
            }
            *dst = Tensor::from_f32(dst.shape().to_vec(), &d);
        }
        _ => {
            // Non-float accumulation (e.g. integer gradients) is summed as
            // i32 and re-encoded, matching the integer SGD gradient source.
            let mut d = dst.as_i32();
            let s = src.as_i32();
            for (a, b) in d.iter_mut().zip(s.iter()) {
                *a = a.saturating_add(*b);
            }
            *dst = Tensor::from_i32(dst.shape().to_vec(), &d);
        }
    }
}

fn scale_in_place(t: &mut Tensor, factor: f64) {
    if t.dtype() != DType::F32 {
        return;
    }
    let data: Vec<f32> = t.as_f32().iter().map(|v| (*v as f64 * factor) as f32).collect();
    *t = Tensor::from_f32(t.shape().to_vec(), &data);
}

/// Clamps into `[-limit, limit]`, floating dtypes only. Idempotent:
/// clipping an already-clipped tensor is a no-op.
pub fn clip_in_place(t: &mut Tensor, limit: f64) {
    if t.dtype() != DType::F32 {
        return;
    }
    let data: Vec<f32> = t.as_f32().iter().map(|v| v.clamp(-limit as f32, limit as f32)).collect();
    *t = Tensor::from_f32(t.shape().to_vec(), &data);
}

fn l2_norm(tensors: &[Tensor]) -> f64 {
    let mut sum_sq = 0.0f64;
    for t in tensors {
        if t.dtype() == DType::F32 {
            for v in t.as_f32() {
                sum_sq += (v as f64) * (v as f64);
            }
        }
    }
    sum_sq.sqrt()
}

fn apply_integer_sgd(params: &mut Tensor, grad: &Tensor, shift: u32) {
    let p = params.as_u8();
    let g = grad.as_i32();
    let updated: Vec<u8> = p
        .iter()
        .zip(g.iter())
        .map(|(&pi, &gi)| {
            let new_val = pi as i32 - (gi >> shift);
            new_val.clamp(-128, 127) as u8
        })
        .collect();
    *params = Tensor::new(DType::U8, params.shape().to_vec(), updated);
}

#[allow(clippy::too_many_arguments)]
fn apply_float_optimizer(
    optimizer: Optimizer,
    params: &mut Tensor,
    grad: &Tensor,
    opt1: &mut Tensor,
    opt2: &mut Tensor,
    lr: f64,
    weight_decay: f64,
    step: usize,
) {
    if params.dtype() != DType::F32 || grad.dtype() != DType::F32 {
        return;
    }
    let mut p = params.as_f32();
    let g = grad.as_f32();

    match optimizer {
        Optimizer::Sgd => {
            for (pi, gi) in p.iter_mut().zip(g.iter()) {
                *pi -= (lr as f32) * gi;
            }
        }
        Optimizer::RmsProp => {
            let mut s = opt1.as_f32();
            if s.len() != p.len() {
                s = vec![0.0; p.len()];
            }
            for ((pi, gi), si) in p.iter_mut().zip(g.iter()).zip(s.iter_mut()) {
                *si = 0.9 * *si + 0.1 * gi * gi;
                *pi -= (lr as f32) * gi / (si.sqrt() + ADAM_EPS as f32);
            }
            *opt1 = Tensor::from_f32(params.shape().to_vec(), &s);
        }
        Optimizer::Adam | Optimizer::AdamW => {
            let decay = if optimizer == Optimizer::AdamW { weight_decay } else { 0.0 };
            let mut m = opt1.as_f32();
            let mut v = opt2.as_f32();
            if m.len() != p.len() {
                m = vec![0.0; p.len()];
            }
            if v.len() != p.len() {
                v = vec![0.0; p.len()];
            }
            let b1t = (ADAM_BETA1.powi(step as i32)) as f32;
            let b2t = (ADAM_BETA2.powi(step as i32)) as f32;
            for (((pi, gi), mi), vi) in p.iter_mut().zip(g.iter()).zip(m.iter_mut()).zip(v.iter_mut()) {
                let gi_decayed = gi + (decay as f32) * *pi;
                *mi = (ADAM_BETA1 as f32) * *mi + (1.0 - ADAM_BETA1 as f32) * gi_decayed;
                *vi = (ADAM_BETA2 as f32) * *vi + (1.0 - ADAM_BETA2 as f32) * gi_decayed * gi_decayed;
                let m_hat = *mi / (1.0 - b1t);
                let v_hat = *vi / (1.0 - b2t);
                *pi -= (lr as f32) * m_hat / (v_hat.sqrt() + ADAM_EPS as f32);
            }
            *opt1 = Tensor::from_f32(params.shape().to_vec(), &m);
            *opt2 = Tensor::from_f32(params.shape().to_vec(), &v);
        }
        Optimizer::Lamb => {
            let mut m = opt1.as_f32();
            let mut v = opt2.as_f32();
            if m.len() != p.len() {
                m = vec![0.0; p.len()];
            }
            if v.len() != p.len() {
                v = vec![0.0; p.len()];
            }
            let b1t = (ADAM_BETA1.powi(step as i32)) as f32;
            let b2t = (ADAM_BETA2.powi(step as i32)) as f32;
            let mut update = vec![0.0f32; p.len()];
            for (((ui, gi), mi), vi) in update.iter_mut().zip(g.iter()).zip(m.iter_mut()).zip(v.iter_mut()) {
                *mi = (ADAM_BETA1 as f32) * *mi + (1.0 - ADAM_BETA1 as f32) * gi;
                *vi = (ADAM_BETA2 as f32) * *vi + (1.0 - ADAM_BETA2 as f32) * gi * gi;
                let m_hat = *mi / (1.0 - b1t);
                let v_hat = *vi / (1.0 - b2t);
                *ui = m_hat / (v_hat.sqrt() + ADAM_EPS as f32);
            }
            for (ui, pi) in update.iter_mut().zip(p.iter()) {
                *ui += (weight_decay as f32) * pi;
            }
            let p_norm: f64 = p.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
            let u_norm: f64 = update.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
            let trust = if p_norm == 0.0 || u_norm == 0.0 { 1.0 } else { p_norm / u_norm };
            for (pi, ui) in p.iter_mut().zip(update.iter()) {
                *pi -= (lr * trust) as f32 * ui;
            }
            *opt1 = Tensor::from_f32(params.shape().to_vec(), &m);
            *opt2 = Tensor::from_f32(params.shape().to_vec(), &v);
        }
    }
    *params = Tensor::from_f32(params.shape().to_vec(), &p);
}

/// Row-major, saturating-i32-accumulation matrix multiply used to derive
/// gradients for the integer SGD path. `a` is `m*k`, `b` is `k*n`, output is
/// `m*n`.
pub fn matmul_i32_saturating(a: &[i32], b: &[i32], m: usize, k: usize, n: usize) -> Vec<i32> {
    let mut out = vec![0i32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc: i32 = 0;
            for p in 0..k {
                acc = acc.saturating_add(a[i * k + p].saturating_mul(b[p * n + j]));
            }
            out[i * n + j] = acc;
        }
    }
    out
}

/// BLAKE3 digest of an i32 output buffer's little-endian byte
/// representation, used to make [`matmul_i32_saturating`] a testable
/// property rather than only an equality check.
pub fn digest_i32(out: &[i32]) -> String {
    let mut hasher = blake3::Hasher::new();
    for v in out {
        hasher.update(&v.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ast::{arrow, build_graph, GraphAst};
    use crate::precision::FixedWidth;
    use crate::registry::FunctionRegistry;
    use crate::runtime::{CycleRuntime, FixedProducer};
    use crate::deploy::Deployment;
    use std::sync::Arc;

    fn backward_tap_runtime() -> CycleRuntime {
        let ast = GraphAst::new()
            .producer("p", Some(2))
            .producer("t", Some(2))
            .layer("l")
            .flow("p", vec![arrow("l", false, None)])
            .flow("l", vec![arrow("t", true, Some("mse"))]);
        let graph = Arc::new(build_graph(&ast).unwrap());
        let mut rt = CycleRuntime::new(graph, Box::new(FixedWidth(32)), FunctionRegistry::with_builtins(), Deployment::default());
        rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[0.5, 0.5])])));
        rt.bind_producer(1, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[1.0, 0.0])])));
        rt
    }

    #[test]
    fn sgd_with_zero_lr_leaves_params_unchanged() {
        let mut rt = backward_tap_runtime();
        let mut options = TrainingOptions { learning_rate: 0.0, accumulate_steps: 1, ..TrainingOptions::default() };
        fit(&mut rt, 1, &mut options).unwrap();
        // starting params were zero-initialised; zero lr keeps them at zero.
        assert_eq!(rt.state().weights[0].as_f32(), vec![0.0, 0.0]);
    }

    #[test]
    fn sgd_decreases_param_by_lr_times_gradient() {
        let mut rt = backward_tap_runtime();
        let mut options = TrainingOptions { learning_rate: 0.1, accumulate_steps: 1, ..TrainingOptions::default() };
        let steps = fit(&mut rt, 1, &mut options).unwrap();
        assert_eq!(steps, 1);
        // grad = mse(0.5,1.0)=0.25 for both elements, single accumulate step.
        let expected = -0.1 * 0.25;
        for v in rt.state().weights[0].as_f32() {
            assert!((v - expected).abs() < 1e-6, "{v} vs {expected}");
        }
    }

    #[test]
    fn gradient_clipping_is_idempotent() {
        let mut t = Tensor::from_f32(vec![3], &[-5.0, 0.5, 5.0]);
        clip_in_place(&mut t, 1.0);
        let once = t.as_f32();
        clip_in_place(&mut t, 1.0);
        assert_eq!(once, t.as_f32());
        assert_eq!(once, vec![-1.0, 0.5, 1.0]);
    }

    #[test]
    fn integer_sgd_with_zero_shift_equals_subtract_clamped() {
        let mut params = Tensor::new(DType::U8, vec![3], vec![10, 0, 250]);
        let grad = Tensor::from_i32(vec![3], &[5, -5, 100]);
        apply_integer_sgd(&mut params, &grad, 0);
        let p = params.as_u8();
        assert_eq!(p[0], 5u8.wrapping_sub(0)); // 10-5=5, within range
        assert_eq!(p[0] as i32, 5);
        assert_eq!(p[1] as i32 as u8 as i8 as i32, 5); // 0-(-5)=5
        assert_eq!(p[2], 127); // 250-100 clamped at 127 as i8 bit pattern
    }

    #[test]
    fn matmul_i32_digest_is_deterministic() {
        let a = vec![1, 2, 3, 4];
        let b = vec![5, 6, 7, 8];
        let out1 = matmul_i32_saturating(&a, &b, 2, 2, 2);
        let out2 = matmul_i32_saturating(&a, &b, 2, 2, 2);
        assert_eq!(digest_i32(&out1), digest_i32(&out2));
        assert_eq!(out1, vec![1 * 5 + 2 * 7, 1 * 6 + 2 * 8, 3 * 5 + 4 * 7, 3 * 6 + 4 * 8]);
    }
}
