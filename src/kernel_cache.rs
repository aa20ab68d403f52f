//! Two-level kernel-compile cache: a per-cycle compiled op list, keyed by
//! the graph digest folded with the per-layer bit widths in effect, and a
//! per-shader bytecode cache shared across cycles, backed by memory and
//! optionally by disk.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::HarmonicsResult;
use crate::graph::{Graph, NodeId, NodeKind};
use crate::precision::PrecisionPolicy;

static COMPILE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of times `ShaderCache::compile_or_fetch` actually ran the compile
/// closure (as opposed to returning a cached hit). Exposed for tests that
/// assert the cache is doing its job.
pub fn compile_count() -> u64 {
    COMPILE_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn reset_compile_count() {
    COMPILE_COUNT.store(0, Ordering::Relaxed);
}

fn cycle_key(graph_digest: &str, per_layer_bits: &[u32]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(graph_digest.as_bytes());
    for b in per_layer_bits {
        hasher.update(&b.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Caches the compiled op list for a whole cycle under a key folding the
/// graph digest with the active per-layer bit widths.
#[derive(Default)]
pub struct CycleCache<Op> {
    entries: Mutex<HashMap<String, Op>>,
}

impl<Op: Clone> CycleCache<Op> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_compile(
        &self,
        graph_digest: &str,
        per_layer_bits: &[u32],
        compile: impl FnOnce() -> Op,
    ) -> Op {
        let key = cycle_key(graph_digest, per_layer_bits);
        let mut entries = self.entries.lock().expect("cycle cache mutex poisoned");
        if let Some(op) = entries.get(&key) {
            return op.clone();
        }
        COMPILE_COUNT.fetch_add(1, Ordering::Relaxed);
        let op = compile();
        entries.insert(key, op.clone());
        op
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cycle cache mutex poisoned").len()
    }
}

/// Bounded in-memory + optional-disk cache of compiled shader bytecode,
/// keyed by a BLAKE3 digest of the shader's source/name and its bit width.
/// The disk tier lives under `HARMONICS_SHADER_DIR` (falling back to
/// `HARMONICS_SHADER_CACHE`, then to no disk tier at all) so repeated
/// process runs can skip recompilation entirely.
pub struct ShaderCache {
    capacity: usize,
    entries: Mutex<HashMap<String, Vec<u8>>>,
    order: Mutex<Vec<String>>,
    disk_dir: Option<PathBuf>,
}

const DEFAULT_SHADER_CACHE_CAPACITY: usize = 64;

impl ShaderCache {
    pub fn new(capacity: usize, disk_dir: Option<PathBuf>) -> Self {
        Self { capacity, entries: Mutex::new(HashMap::new()), order: Mutex::new(Vec::new()), disk_dir }
    }

    /// Builds a cache sized by `HARMONICS_SHADER_CACHE_LIMIT` (default 64),
    /// with its disk tier taken from `HARMONICS_SHADER_DIR` then
    /// `HARMONICS_SHADER_CACHE`.
    pub fn from_env() -> Self {
        let capacity = std::env::var("HARMONICS_SHADER_CACHE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(DEFAULT_SHADER_CACHE_CAPACITY);
        let disk_dir = std::env::var("HARMONICS_SHADER_DIR")
            .or_else(|_| std::env::var("HARMONICS_SHADER_CACHE"))
            .ok()
            .map(PathBuf::from);
        Self::new(capacity, disk_dir)
    }

    /// BLAKE3-hex digest of `name ∥ bits`, used both as the in-memory cache
    /// key and as the on-disk filename stem (`<digest>.spv`).
    pub fn shader_key(name: &str, bits: u32) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        hasher.update(&bits.to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }

    pub fn compile_or_fetch(&self, key: &str, compile: impl FnOnce() -> HarmonicsResult<Vec<u8>>) -> HarmonicsResult<Vec<u8>> {
        if let Some(bytes) = self.entries.lock().expect("shader cache mutex poisoned").get(key).cloned() {
            return Ok(bytes);
        }
        if let Some(bytes) = self.read_disk(key)? {
            self.insert_memory(key, bytes.clone());
            return Ok(bytes);
        }
        COMPILE_COUNT.fetch_add(1, Ordering::Relaxed);
        let bytes = compile()?;
        self.write_disk(key, &bytes)?;
        self.insert_memory(key, bytes.clone());
        Ok(bytes)
    }

    fn insert_memory(&self, key: &str, bytes: Vec<u8>) {
        let mut entries = self.entries.lock().expect("shader cache mutex poisoned");
        let mut order = self.order.lock().expect("shader cache mutex poisoned");
        if !entries.contains_key(key) {
            order.push(key.to_string());
            if order.len() > self.capacity {
                let evict = order.remove(0);
                entries.remove(&evict);
            }
        }
        entries.insert(key.to_string(), bytes);
    }

    fn disk_path(&self, key: &str) -> Option<PathBuf> {
        self.disk_dir.as_ref().map(|dir| dir.join(format!("{key}.spv")))
    }

    fn read_disk(&self, key: &str) -> HarmonicsResult<Option<Vec<u8>>> {
        match self.disk_path(key) {
            Some(path) if path.exists() => Ok(Some(fs::read(path)?)),
            _ => Ok(None),
        }
    }

    fn write_disk(&self, key: &str, bytes: &[u8]) -> HarmonicsResult<()> {
        if let Some(path) = self.disk_path(key) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, bytes)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("shader cache mutex poisoned").len()
    }
}

/// One compiled operation per arrow in the cycle, in flow-line/arrow
/// declaration order. This is what an accelerator forward pass iterates
/// over instead of re-deriving shader keys from the graph every time.
#[derive(Clone, Debug)]
pub struct Op {
    pub source: NodeId,
    pub target: NodeId,
    pub backward: bool,
    pub func: Option<String>,
    /// `func ∨ "identity"` joined with the bits in effect for the target.
    pub shader_key: String,
    pub bytecode: Vec<u8>,
    pub bits: u32,
}

const DEFAULT_NON_LAYER_BITS: u32 = 32;

/// Placeholder for the external shader compiler: in the absence of a real
/// platform toolchain this just encodes the key deterministically, which is
/// enough to exercise the cache's hit/miss and eviction behaviour.
fn compile_shader_stub(key: &str) -> HarmonicsResult<Vec<u8>> {
    Ok(key.as_bytes().to_vec())
}

/// Produces the ordered op list for `graph` under `policy`, consulting
/// `cycle_cache` for a whole-list hit and `shader_cache` for per-shader
/// bytecode on a miss. Returns the same list (same shader keys, same order)
/// for two calls as long as neither the graph nor the policy's per-layer
/// bits have changed.
#[tracing::instrument(skip(graph, policy, cycle_cache, shader_cache))]
pub fn compile_cycle_kernels(
    graph: &Graph,
    policy: &dyn PrecisionPolicy,
    cycle_cache: &CycleCache<Vec<Op>>,
    shader_cache: &ShaderCache,
) -> HarmonicsResult<Vec<Op>> {
    let per_layer_bits: Vec<u32> = (0..graph.layers.len()).map(|i| policy.select_bits(i)).collect();
    let digest = graph.digest();

    // `get_or_compile` only reports compile-count for whole-list misses; the
    // per-shader compiles below report their own misses via `shader_cache`.
    let mut compile_err = None;
    let ops = cycle_cache.get_or_compile(&digest, &per_layer_bits, || {
        let mut ops = Vec::new();
        for line in &graph.cycle {
            for arrow in &line.arrows {
                let bits = if arrow.target.kind == NodeKind::Layer {
                    per_layer_bits[arrow.target.index]
                } else {
                    DEFAULT_NON_LAYER_BITS
                };
                let func_name = arrow.func.as_deref().unwrap_or("identity");
                let shader_key = format!("{func_name}_{bits}");
                // The in-memory/disk cache is keyed by the BLAKE3 hash of the
                // shader key, per the documented `<hex-blake3(shader_key)>.spv`
                // disk layout; `Op::shader_key` keeps the human-readable form.
                let cache_key = ShaderCache::shader_key(func_name, bits);
                let bytecode = match shader_cache.compile_or_fetch(&cache_key, || compile_shader_stub(&shader_key)) {
                    Ok(b) => b,
                    Err(e) => {
                        compile_err.get_or_insert(e);
                        Vec::new()
                    }
                };
                ops.push(Op {
                    source: line.source,
                    target: arrow.target,
                    backward: arrow.backward,
                    func: arrow.func.clone(),
                    shader_key,
                    bytecode,
                    bits,
                });
            }
        }
        ops
    });
    if let Some(e) = compile_err {
        return Err(e);
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_cache_from_env_honours_limit_override() {
        std::env::set_var("HARMONICS_SHADER_CACHE_LIMIT", "2");
        std::env::remove_var("HARMONICS_SHADER_DIR");
        std::env::remove_var("HARMONICS_SHADER_CACHE");
        let cache = ShaderCache::from_env();
        cache.compile_or_fetch("a", || Ok(vec![1])).unwrap();
        cache.compile_or_fetch("b", || Ok(vec![2])).unwrap();
        cache.compile_or_fetch("c", || Ok(vec![3])).unwrap();
        assert_eq!(cache.len(), 2);
        std::env::remove_var("HARMONICS_SHADER_CACHE_LIMIT");
    }

    #[test]
    fn cycle_cache_hits_on_same_key() {
        let cache: CycleCache<u32> = CycleCache::new();
        let mut calls = 0;
        let a = cache.get_or_compile("digest", &[8, 8], || {
            calls += 1;
            1
        });
        let b = cache.get_or_compile("digest", &[8, 8], || {
            calls += 1;
            2
        });
        assert_eq!(a, b);
        assert_eq!(calls, 1);
    }

    #[test]
    fn shader_cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(4, Some(dir.path().to_path_buf()));
        let key = ShaderCache::shader_key("relu_f32", 32);
        let bytes = cache.compile_or_fetch(&key, || Ok(vec![1, 2, 3])).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        let cache2 = ShaderCache::new(4, Some(dir.path().to_path_buf()));
        let mut compiled_again = false;
        let bytes2 = cache2
            .compile_or_fetch(&key, || {
                compiled_again = true;
                Ok(vec![9])
            })
            .unwrap();
        assert_eq!(bytes2, vec![1, 2, 3]);
        assert!(!compiled_again);
    }

    #[test]
    fn shader_cache_evicts_oldest_past_capacity() {
        let cache = ShaderCache::new(2, None);
        cache.compile_or_fetch("a", || Ok(vec![1])).unwrap();
        cache.compile_or_fetch("b", || Ok(vec![2])).unwrap();
        cache.compile_or_fetch("c", || Ok(vec![3])).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn compile_cycle_kernels_writes_blake3_named_spv_files() {
        use crate::graph::ast::{arrow, build_graph, GraphAst};
        use crate::precision::FixedWidth;

        let dir = tempfile::tempdir().unwrap();
        let ast = GraphAst::new()
            .producer("p", Some(2))
            .layer("l")
            .consumer("c", None)
            .flow("p", vec![arrow("l", false, Some("relu"))])
            .flow("l", vec![arrow("c", false, None)]);
        let graph = build_graph(&ast).unwrap();
        let policy = FixedWidth(32);
        let cycle_cache: CycleCache<Vec<Op>> = CycleCache::new();
        let shader_cache = ShaderCache::new(8, Some(dir.path().to_path_buf()));

        let ops = compile_cycle_kernels(&graph, &policy, &cycle_cache, &shader_cache).unwrap();
        let relu_op = ops.iter().find(|op| op.shader_key == "relu_32").unwrap();
        assert_eq!(relu_op.bytecode, b"relu_32".to_vec());

        let expected_name = format!("{}.spv", ShaderCache::shader_key("relu", 32));
        let path = dir.path().join(&expected_name);
        assert!(path.exists(), "expected {expected_name} under {:?}, found {:?}", dir.path(), dir.path().read_dir().unwrap().collect::<Vec<_>>());
        assert_eq!(fs::read(path).unwrap(), b"relu_32".to_vec());
    }

    #[test]
    fn compile_cycle_kernels_is_stable_and_compiles_once() {
        use crate::graph::ast::{arrow, build_graph, GraphAst};
        use crate::precision::FixedWidth;

        let ast = GraphAst::new()
            .producer("p", Some(2))
            .layer("l")
            .consumer("c", None)
            .flow("p", vec![arrow("l", false, Some("relu"))])
            .flow("l", vec![arrow("c", false, None)]);
        let graph = build_graph(&ast).unwrap();
        let policy = FixedWidth(16);
        let cycle_cache: CycleCache<Vec<Op>> = CycleCache::new();
        let shader_cache = ShaderCache::new(8, None);

        reset_compile_count();
        let first = compile_cycle_kernels(&graph, &policy, &cycle_cache, &shader_cache).unwrap();
        let after_first = compile_count();
        assert!(after_first >= 1);

        let second = compile_cycle_kernels(&graph, &policy, &cycle_cache, &shader_cache).unwrap();
        assert_eq!(compile_count(), after_first);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.shader_key, b.shader_key);
        }
    }
}
