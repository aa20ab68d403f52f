//! HGRF graph file format: a magic tag, a version, and a length-prefixed
//! JSON payload carrying the resolved graph (node tables + cycle).

use std::io::{Read, Write};

use super::Graph;
use crate::error::{HarmonicsError, HarmonicsResult};

const MAGIC: &[u8; 4] = b"HGRF";
const VERSION: u32 = 1;

pub fn save_graph<W: Write>(mut w: W, graph: &Graph) -> HarmonicsResult<()> {
    let payload = serde_json::to_vec(graph).map_err(|e| HarmonicsError::MalformedAst(e.to_string()))?;
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(payload.len() as u64).to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

pub fn load_graph<R: Read>(mut r: R) -> HarmonicsResult<Graph> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(|_| HarmonicsError::TruncatedStream("magic"))?;
    if &magic != MAGIC {
        return Err(HarmonicsError::BadMagic { expected: "HGRF", found: magic });
    }
    let mut version_buf = [0u8; 4];
    r.read_exact(&mut version_buf).map_err(|_| HarmonicsError::TruncatedStream("version"))?;
    let version = u32::from_le_bytes(version_buf);
    if version != VERSION {
        return Err(HarmonicsError::UnsupportedVersion(version));
    }
    let mut len_buf = [0u8; 8];
    r.read_exact(&mut len_buf).map_err(|_| HarmonicsError::TruncatedStream("payload length"))?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).map_err(|_| HarmonicsError::TruncatedStream("payload"))?;
    serde_json::from_slice(&payload).map_err(|e| HarmonicsError::MalformedAst(e.to_string()))
}
