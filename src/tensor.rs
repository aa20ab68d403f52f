use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{HarmonicsError, HarmonicsResult};

/// Element type carried by a [`Tensor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DType {
    /// Byte width of a single element of this type.
    pub fn size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            DType::U8 => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::F64),
            2 => Some(DType::I32),
            3 => Some(DType::I64),
            4 => Some(DType::U8),
            _ => None,
        }
    }
}

/// A typed, shape-carrying byte buffer. The value type that flows through
/// every producer/layer/consumer slot in the runtime.
///
/// Invariant: for a populated tensor, `bytes.len() == shape.iter().product() * dtype.size()`.
/// An uninitialised tensor has an empty shape and an empty byte buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl Tensor {
    pub fn empty() -> Self {
        Self { dtype: DType::F32, shape: Vec::new(), bytes: Vec::new() }
    }

    pub fn new(dtype: DType, shape: Vec<usize>, bytes: Vec<u8>) -> Self {
        Self { dtype, shape, bytes }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.shape.is_empty() && self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn zero(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }

    pub fn from_f32(shape: Vec<usize>, data: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self { dtype: DType::F32, shape, bytes }
    }

    pub fn from_i32(shape: Vec<usize>, data: &[i32]) -> Self {
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self { dtype: DType::I32, shape, bytes }
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let n: usize = shape.iter().product();
        Self { dtype, shape, bytes: vec![0u8; n * dtype.size()] }
    }

    pub fn as_f32(&self) -> Vec<f32> {
        self.bytes.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    pub fn as_f64(&self) -> Vec<f64> {
        self.bytes.chunks_exact(8).map(|c| f64::from_le_bytes(c.try_into().unwrap())).collect()
    }

    pub fn as_i32(&self) -> Vec<i32> {
        self.bytes.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    pub fn as_i64(&self) -> Vec<i64> {
        self.bytes.chunks_exact(8).map(|c| i64::from_le_bytes(c.try_into().unwrap())).collect()
    }

    pub fn as_u8(&self) -> &[u8] {
        &self.bytes
    }

    /// Ensure the byte buffer is populated (zeroed) to match `shape`/`dtype`
    /// if it was previously empty. Mirrors the original runtime's
    /// copy-on-first-write convention for accumulator/parameter slots.
    pub fn ensure_allocated_like(&mut self, other: &Tensor) {
        if self.bytes.is_empty() {
            self.dtype = other.dtype;
            self.shape = other.shape.clone();
            self.bytes = vec![0u8; other.bytes.len()];
        }
    }
}

impl Default for Tensor {
    fn default() -> Self {
        Self::empty()
    }
}

/// Shared tensor wire format used by the weights files, the runtime
/// checkpoint, and the distributed scheduler's boundary bus: `(dtype byte,
/// u32 dim count, u32 dims[], u32 byte-size, bytes)`.
pub fn write_tensor<W: Write>(mut w: W, t: &Tensor) -> HarmonicsResult<()> {
    w.write_all(&[t.dtype.tag()])?;
    w.write_all(&(t.shape.len() as u32).to_le_bytes())?;
    for d in &t.shape {
        w.write_all(&(*d as u32).to_le_bytes())?;
    }
    w.write_all(&(t.bytes.len() as u32).to_le_bytes())?;
    w.write_all(&t.bytes)?;
    Ok(())
}

pub fn read_tensor<R: Read>(mut r: R) -> HarmonicsResult<Tensor> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag).map_err(|_| HarmonicsError::TruncatedStream("dtype tag"))?;
    let dtype = DType::from_tag(tag[0]).ok_or_else(|| HarmonicsError::MalformedAst(format!("bad dtype tag {}", tag[0])))?;

    let mut dim_count_buf = [0u8; 4];
    r.read_exact(&mut dim_count_buf).map_err(|_| HarmonicsError::TruncatedStream("dim count"))?;
    let dim_count = u32::from_le_bytes(dim_count_buf) as usize;

    let mut shape = Vec::with_capacity(dim_count);
    for _ in 0..dim_count {
        let mut d = [0u8; 4];
        r.read_exact(&mut d).map_err(|_| HarmonicsError::TruncatedStream("dim"))?;
        shape.push(u32::from_le_bytes(d) as usize);
    }

    let mut size_buf = [0u8; 4];
    r.read_exact(&mut size_buf).map_err(|_| HarmonicsError::TruncatedStream("byte size"))?;
    let byte_size = u32::from_le_bytes(size_buf) as usize;

    let expected = shape.iter().product::<usize>() * dtype.size();
    if byte_size != expected && !(shape.is_empty() && byte_size == 0) {
        return Err(HarmonicsError::TensorSizeInconsistency { declared: expected, found: byte_size });
    }

    let mut bytes = vec![0u8; byte_size];
    r.read_exact(&mut bytes).map_err(|_| HarmonicsError::TruncatedStream("tensor bytes"))?;
    Ok(Tensor { dtype, shape, bytes })
}

#[cfg(test)]
mod tensor_io_tests {
    use super::*;

    #[test]
    fn tensor_round_trips_byte_for_byte() {
        let t = Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let mut buf = Vec::new();
        write_tensor(&mut buf, &t).unwrap();
        let back = read_tensor(&buf[..]).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn empty_tensor_round_trips() {
        let t = Tensor::empty();
        let mut buf = Vec::new();
        write_tensor(&mut buf, &t).unwrap();
        let back = read_tensor(&buf[..]).unwrap();
        assert_eq!(t, back);
    }
}
