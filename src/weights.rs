//! `HWTS` (positional) and `HNWT` (named) weights files: flat lists of
//! tensors serialised with the shared tensor wire format from
//! [`crate::tensor`].

use std::io::{Read, Write};

use crate::error::{HarmonicsError, HarmonicsResult};
use crate::tensor::{read_tensor, write_tensor, Tensor};

const WTS_MAGIC: &[u8; 4] = b"HWTS";
const NWT_MAGIC: &[u8; 4] = b"HNWT";
const VERSION: u32 = 1;

pub fn save_weights<W: Write>(mut w: W, tensors: &[Tensor]) -> HarmonicsResult<()> {
    w.write_all(WTS_MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(tensors.len() as u32).to_le_bytes())?;
    for t in tensors {
        write_tensor(&mut w, t)?;
    }
    Ok(())
}

pub fn load_weights<R: Read>(mut r: R) -> HarmonicsResult<Vec<Tensor>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(|_| HarmonicsError::TruncatedStream("magic"))?;
    if &magic != WTS_MAGIC {
        return Err(HarmonicsError::BadMagic { expected: "HWTS", found: magic });
    }
    let version = read_version(&mut r)?;
    if version != VERSION {
        return Err(HarmonicsError::UnsupportedVersion(version));
    }
    let count = read_u32(&mut r, "tensor count")? as usize;
    (0..count).map(|_| read_tensor(&mut r)).collect()
}

pub fn save_named_weights<W: Write>(mut w: W, tensors: &[(String, Tensor)]) -> HarmonicsResult<()> {
    w.write_all(NWT_MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(tensors.len() as u32).to_le_bytes())?;
    for (name, t) in tensors {
        let name_bytes = name.as_bytes();
        w.write_all(&(name_bytes.len() as u32).to_le_bytes())?;
        w.write_all(name_bytes)?;
        write_tensor(&mut w, t)?;
    }
    Ok(())
}

pub fn load_named_weights<R: Read>(mut r: R) -> HarmonicsResult<Vec<(String, Tensor)>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(|_| HarmonicsError::TruncatedStream("magic"))?;
    if &magic != NWT_MAGIC {
        return Err(HarmonicsError::BadMagic { expected: "HNWT", found: magic });
    }
    let version = read_version(&mut r)?;
    if version != VERSION {
        return Err(HarmonicsError::UnsupportedVersion(version));
    }
    let count = read_u32(&mut r, "pair count")? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = read_u32(&mut r, "name length")? as usize;
        let mut name_bytes = vec![0u8; name_len];
        r.read_exact(&mut name_bytes).map_err(|_| HarmonicsError::TruncatedStream("name"))?;
        let name = String::from_utf8(name_bytes)
            .map_err(|e| HarmonicsError::MalformedAst(format!("non-utf8 weight name: {e}")))?;
        let tensor = read_tensor(&mut r)?;
        out.push((name, tensor));
    }
    Ok(out)
}

fn read_version<R: Read>(mut r: R) -> HarmonicsResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|_| HarmonicsError::TruncatedStream("version"))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u32<R: Read>(mut r: R, what: &'static str) -> HarmonicsResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|_| HarmonicsError::TruncatedStream(what))?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_weights_round_trip() {
        let tensors = vec![Tensor::from_f32(vec![2], &[1.0, 2.0]), Tensor::from_i32(vec![1], &[7])];
        let mut buf = Vec::new();
        save_weights(&mut buf, &tensors).unwrap();
        let back = load_weights(&buf[..]).unwrap();
        assert_eq!(tensors, back);
    }

    #[test]
    fn named_weights_round_trip() {
        let tensors = vec![
            ("w1".to_string(), Tensor::from_f32(vec![2], &[1.0, 2.0])),
            ("w2".to_string(), Tensor::from_f32(vec![1], &[3.0])),
        ];
        let mut buf = Vec::new();
        save_named_weights(&mut buf, &tensors).unwrap();
        let back = load_named_weights(&buf[..]).unwrap();
        assert_eq!(tensors, back);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = b"XXXX\x01\x00\x00\x00".to_vec();
        assert!(load_weights(&buf[..]).is_err());
    }
}
