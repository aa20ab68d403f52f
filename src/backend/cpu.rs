use ndarray::Zip;

use super::Backend;
use crate::error::{HarmonicsError, HarmonicsResult};
use crate::tensor::Tensor;

#[derive(Debug, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn dispatch(&self, shader: &str, inputs: &[&Tensor]) -> HarmonicsResult<Tensor> {
        match shader {
            "relu_f32" => kernel_relu(inputs),
            "sigmoid_f32" => kernel_sigmoid(inputs),
            "identity_f32" | "copy_buf" => kernel_copy(inputs),
            "add_f32" => kernel_add(inputs),
            "add_relu_f32" => kernel_add_relu_fused(inputs),
            other => Err(HarmonicsError::CompileFailed {
                shader_key: other.to_string(),
                reason: "cpu backend has no such shader".to_string(),
            }),
        }
    }
}

fn kernel_relu(inputs: &[&Tensor]) -> HarmonicsResult<Tensor> {
    let x = &inputs[0];
    let mut data = x.as_f32();
    let mut view = ndarray::ArrayViewMut1::from(data.as_mut_slice());
    Zip::from(&mut view).par_for_each(|v| {
        if *v < 0.0 {
            *v = 0.0;
        }
    });
    Ok(Tensor::from_f32(x.shape().to_vec(), &data))
}

fn kernel_sigmoid(inputs: &[&Tensor]) -> HarmonicsResult<Tensor> {
    let x = &inputs[0];
    let mut data = x.as_f32();
    let mut view = ndarray::ArrayViewMut1::from(data.as_mut_slice());
    Zip::from(&mut view).par_for_each(|v| {
        *v = 1.0 / (1.0 + (-*v).exp());
    });
    Ok(Tensor::from_f32(x.shape().to_vec(), &data))
}

fn kernel_copy(inputs: &[&Tensor]) -> HarmonicsResult<Tensor> {
    Ok((*inputs[0]).clone())
}

fn kernel_add(inputs: &[&Tensor]) -> HarmonicsResult<Tensor> {
    let a = inputs[0].as_f32();
    let b = inputs[1].as_f32();
    let data: Vec<f32> = a.iter().zip(b.iter()).map(|(x, y)| x + y).collect();
    Ok(Tensor::from_f32(inputs[0].shape().to_vec(), &data))
}

/// Fused add-then-relu in one pass, avoiding a round trip to memory for the
/// intermediate sum.
#[tracing::instrument(skip(inputs), name = "kernel_add_relu_fused")]
fn kernel_add_relu_fused(inputs: &[&Tensor]) -> HarmonicsResult<Tensor> {
    let a = inputs[0].as_f32();
    let b = inputs[1].as_f32();
    let mut out = a;
    let shape = inputs[0].shape().to_vec();
    Zip::from(ndarray::ArrayViewMut1::from(out.as_mut_slice()))
        .and(ndarray::ArrayView1::from(b.as_slice()))
        .par_for_each(|r, &bi| {
            let sum = *r + bi;
            *r = if sum < 0.0 { 0.0 } else { sum };
        });
    Ok(Tensor::from_f32(shape, &out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_clamps_negatives() {
        let backend = CpuBackend::default();
        let x = Tensor::from_f32(vec![3], &[-2.0, 0.0, 3.0]);
        let out = backend.dispatch("relu_f32", &[&x]).unwrap();
        assert_eq!(out.as_f32(), vec![0.0, 0.0, 3.0]);
    }

    #[test]
    fn add_relu_fuses_both_steps() {
        let backend = CpuBackend::default();
        let a = Tensor::from_f32(vec![2], &[-3.0, 2.0]);
        let b = Tensor::from_f32(vec![2], &[1.0, 1.0]);
        let out = backend.dispatch("add_relu_f32", &[&a, &b]).unwrap();
        assert_eq!(out.as_f32(), vec![0.0, 3.0]);
    }

    #[test]
    fn unknown_shader_errors() {
        let backend = CpuBackend::default();
        let x = Tensor::from_f32(vec![1], &[1.0]);
        assert!(backend.dispatch("nonexistent", &[&x]).is_err());
    }
}
