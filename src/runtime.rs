//! The cycle runtime: owns one graph's per-cycle state, resolves a backend
//! from a deployment descriptor, and executes the forward pass once per
//! call to [`CycleRuntime::forward`]. Training (`fit`) and the distributed
//! scheduler both drive a runtime through repeated `forward()` calls rather
//! than duplicating this logic.

use std::sync::Arc;

use crate::backend::{resolve_for_request, Backend};
use crate::deploy::Deployment;
use crate::error::{HarmonicsError, HarmonicsResult};
use crate::graph::{Arrow, FlowLine, Graph, NodeId, NodeKind};
use crate::precision::PrecisionPolicy;
use crate::proof::ProofChain;
use crate::registry::FunctionRegistry;
use crate::slab::ConstantSlab;
use crate::tensor::Tensor;

/// External data source a producer name is bound to.
pub trait ProducerSource: Send {
    fn next(&mut self) -> HarmonicsResult<Tensor>;
    /// Declared sample count, 0 for unbounded.
    fn size(&self) -> usize {
        0
    }
}

/// External sink a consumer name is bound to, in addition to the tensor
/// always being written into `state.consumer_tensors`.
pub trait ConsumerSink: Send {
    fn push(&mut self, tensor: Tensor) -> HarmonicsResult<()>;
}

/// A `ProducerSource` that replays a fixed list of tensors, then repeats the
/// last one forever. Useful for tests and for feeding a fixed batch.
pub struct FixedProducer {
    samples: Vec<Tensor>,
    cursor: usize,
}

impl FixedProducer {
    pub fn new(samples: Vec<Tensor>) -> Self {
        assert!(!samples.is_empty(), "FixedProducer needs at least one sample");
        Self { samples, cursor: 0 }
    }
}

impl ProducerSource for FixedProducer {
    fn next(&mut self) -> HarmonicsResult<Tensor> {
        let t = self.samples[self.cursor.min(self.samples.len() - 1)].clone();
        if self.cursor + 1 < self.samples.len() {
            self.cursor += 1;
        }
        Ok(t)
    }

    fn size(&self) -> usize {
        self.samples.len()
    }
}

/// A `ConsumerSink` that just records every tensor pushed to it, in order.
#[derive(Default)]
pub struct RecordingConsumer {
    pub received: Vec<Tensor>,
}

impl ConsumerSink for RecordingConsumer {
    fn push(&mut self, tensor: Tensor) -> HarmonicsResult<()> {
        self.received.push(tensor);
        Ok(())
    }
}

/// Per-cycle runtime state: the four parallel node-indexed tensor vectors
/// plus the precision-bits vector and the constant slab.
#[derive(Clone)]
pub struct CycleState {
    pub producer_tensors: Vec<Tensor>,
    pub layer_tensors: Vec<Tensor>,
    pub consumer_tensors: Vec<Tensor>,
    pub weights: Vec<Tensor>,
    pub precision_bits: Vec<u32>,
    pub variables: ConstantSlab,
}

impl CycleState {
    pub fn for_graph(graph: &Graph) -> Self {
        Self {
            producer_tensors: vec![Tensor::empty(); graph.producers.len()],
            layer_tensors: vec![Tensor::empty(); graph.layers.len()],
            consumer_tensors: vec![Tensor::empty(); graph.consumers.len()],
            weights: vec![Tensor::empty(); graph.layers.len()],
            precision_bits: vec![0; graph.layers.len()],
            variables: ConstantSlab::new(),
        }
    }
}

/// Fired once per arrow, after the state slot it writes (or, for a
/// degenerate backward arrow, would have written) has been updated.
pub struct DebugEvent<'a> {
    pub source: NodeId,
    pub target: NodeId,
    pub value: &'a Tensor,
    pub backward: bool,
    pub func: Option<&'a str>,
}

pub type DebugCallback = Arc<dyn Fn(&DebugEvent) + Send + Sync>;

/// Owns a graph's per-cycle state and executes the forward pass.
pub struct CycleRuntime {
    graph: Arc<Graph>,
    registry: FunctionRegistry,
    policy: Box<dyn PrecisionPolicy>,
    backend: Box<dyn Backend>,
    deployment: Deployment,
    state: CycleState,
    producers: Vec<Option<Box<dyn ProducerSource>>>,
    consumer_sinks: Vec<Option<Box<dyn ConsumerSink>>>,
    debug_callback: Option<DebugCallback>,
    proof_chain: ProofChain,
}

impl CycleRuntime {
    pub fn new(graph: Arc<Graph>, policy: Box<dyn PrecisionPolicy>, registry: FunctionRegistry, deployment: Deployment) -> Self {
        let state = CycleState::for_graph(&graph);
        let backend = resolve_for_request(deployment.backend);
        let producer_count = graph.producers.len();
        let consumer_count = graph.consumers.len();
        Self {
            graph,
            registry,
            policy,
            backend,
            deployment,
            state,
            producers: (0..producer_count).map(|_| None).collect(),
            consumer_sinks: (0..consumer_count).map(|_| None).collect(),
            debug_callback: None,
            proof_chain: ProofChain::new(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_arc(&self) -> Arc<Graph> {
        Arc::clone(&self.graph)
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CycleState {
        &mut self.state
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn proof(&self) -> &str {
        &self.proof_chain.proof
    }

    pub fn chain(&self) -> &str {
        &self.proof_chain.chain
    }

    pub fn set_chain(&mut self, chain: impl Into<String>) {
        self.proof_chain.set_chain(chain);
    }

    pub fn verify_chain(&self, previous: &str) -> bool {
        self.proof_chain.verify(previous, &self.state.layer_tensors)
    }

    pub fn bind_producer(&mut self, index: usize, source: Box<dyn ProducerSource>) {
        self.producers[index] = Some(source);
    }

    pub fn bind_producer_by_name(&mut self, name: &str, source: Box<dyn ProducerSource>) -> HarmonicsResult<()> {
        let id = self.resolve_producer(name)?;
        self.bind_producer(id, source);
        Ok(())
    }

    pub fn bind_consumer(&mut self, index: usize, sink: Box<dyn ConsumerSink>) {
        self.consumer_sinks[index] = Some(sink);
    }

    pub fn set_debug_callback(&mut self, cb: DebugCallback) {
        self.debug_callback = Some(cb);
    }

    fn resolve_producer(&self, name: &str) -> HarmonicsResult<usize> {
        self.graph
            .producers
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| HarmonicsError::UnknownNode(name.to_string()))
    }

    /// Runs one forward pass, dispatching to the CPU, multi-threaded CPU, or
    /// accelerator path depending on the resolved backend and deployment
    /// flags. Updates the proof chain afterwards when secure mode is on.
    #[tracing::instrument(skip(self), fields(backend = self.backend.name()))]
    pub fn forward(&mut self) -> HarmonicsResult<()> {
        let graph = Arc::clone(&self.graph);
        let mut fetched = vec![false; graph.producers.len()];

        if self.backend.name() == "cpu" && self.deployment.multithreaded {
            self.forward_threaded(&graph, &mut fetched)?;
        } else if self.backend.name() == "cpu" {
            self.forward_cpu(&graph, &mut fetched)?;
        } else {
            self.forward_device(&graph, &mut fetched)?;
        }

        if self.deployment.secure {
            self.proof_chain.advance(&self.state.layer_tensors);
        }
        Ok(())
    }

    /// Reads the tensor a source or target `NodeId` currently holds,
    /// fetching from the bound producer and caching the result the first
    /// time a producer is touched this cycle.
    fn fetch(&mut self, id: NodeId, fetched: &mut [bool]) -> HarmonicsResult<Tensor> {
        match id.kind {
            NodeKind::Producer => {
                if !fetched[id.index] {
                    let source = self.producers[id.index]
                        .as_mut()
                        .ok_or(HarmonicsError::ProducerNotBound(id.index))?;
                    let tensor = source.next()?;
                    if let Some(declared) = self.graph.producers[id.index].width.or(self.graph.producers[id.index].fixed_width) {
                        if !tensor.is_empty() && tensor.len() != declared {
                            return Err(HarmonicsError::ProducerShapeMismatch {
                                name: self.graph.producers[id.index].name.clone(),
                                declared,
                                actual: tensor.len(),
                            });
                        }
                    }
                    self.state.producer_tensors[id.index] = tensor;
                    fetched[id.index] = true;
                }
                Ok(self.state.producer_tensors[id.index].clone())
            }
            NodeKind::Layer => Ok(self.state.layer_tensors[id.index].clone()),
            NodeKind::Consumer => Ok(self.state.consumer_tensors[id.index].clone()),
        }
    }

    fn write_target(&mut self, target: NodeId, value: Tensor) -> HarmonicsResult<()> {
        match target.kind {
            NodeKind::Layer => {
                self.state.layer_tensors[target.index] = value;
                if self.state.precision_bits[target.index] == 0 {
                    self.state.precision_bits[target.index] = self.policy.select_bits(target.index);
                }
            }
            NodeKind::Consumer => {
                self.state.consumer_tensors[target.index] = value.clone();
                if let Some(sink) = self.consumer_sinks[target.index].as_mut() {
                    sink.push(value)?;
                }
            }
            NodeKind::Producer => {
                return Err(HarmonicsError::MalformedAst("arrow cannot target a producer".to_string()));
            }
        }
        Ok(())
    }

    fn apply_backward(&mut self, source: NodeId, arrow: &Arrow, fetched: &mut [bool]) -> HarmonicsResult<Tensor> {
        let target_val = self.fetch(arrow.target, fetched)?;
        if let (Some(func), NodeKind::Layer) = (&arrow.func, source.kind) {
            let source_val = self.fetch(source, fetched)?;
            let loss = self.registry.loss(func)?;
            let result = loss(&source_val, &target_val);
            self.state.weights[source.index] = result.clone();
            Ok(result)
        } else {
            // Degenerate arrow: no loss named, or source isn't a layer. No
            // weight update happens.
            Ok(Tensor::empty())
        }
    }

    fn apply_forward(&mut self, source_val: Tensor, arrow: &Arrow) -> HarmonicsResult<Tensor> {
        let value = match &arrow.func {
            Some(f) => {
                let activation = self.registry.activation(f)?;
                activation(&source_val)
            }
            None => source_val,
        };
        self.write_target(arrow.target, value.clone())?;
        Ok(value)
    }

    fn fire_debug(&self, source: NodeId, arrow: &Arrow, value: &Tensor) {
        if let Some(cb) = &self.debug_callback {
            cb(&DebugEvent {
                source,
                target: arrow.target,
                value,
                backward: arrow.backward,
                func: arrow.func.as_deref(),
            });
        }
    }

    fn forward_cpu(&mut self, graph: &Graph, fetched: &mut [bool]) -> HarmonicsResult<()> {
        for line in &graph.cycle {
            let source_val = self.fetch(line.source, fetched)?;
            for arrow in &line.arrows {
                if arrow.backward {
                    let value = self.apply_backward(line.source, arrow, fetched)?;
                    self.fire_debug(line.source, arrow, &value);
                } else {
                    let value = self.apply_forward(source_val.clone(), arrow)?;
                    self.fire_debug(line.source, arrow, &value);
                }
            }
        }
        Ok(())
    }

    /// Each arrow within one flow line is computed independently (pure
    /// function of the cloned source/target values) and the pool is joined
    /// before the results are applied in arrow order and before advancing
    /// to the next flow line. Two arrows in the same line that would write
    /// the same slot are rejected rather than raced.
    fn forward_threaded(&mut self, graph: &Graph, fetched: &mut [bool]) -> HarmonicsResult<()> {
        for line in &graph.cycle {
            let source_val = self.fetch(line.source, fetched)?;
            reject_aliasing_writes(line)?;

            // Pre-fetch every backward target synchronously (producer
            // caching must stay on the single runtime thread), then
            // parallelise the pure loss/activation computation.
            let mut target_vals = Vec::with_capacity(line.arrows.len());
            for arrow in &line.arrows {
                target_vals.push(if arrow.backward { Some(self.fetch(arrow.target, fetched)?) } else { None });
            }

            let registry = self.registry.clone();
            let results: Vec<HarmonicsResult<Tensor>> = {
                #[cfg(feature = "rayon")]
                {
                    use rayon::prelude::*;
                    line.arrows
                        .par_iter()
                        .zip(target_vals.par_iter())
                        .map(|(arrow, target_val)| compute_arrow(&registry, &source_val, arrow, target_val.as_ref()))
                        .collect()
                }
                #[cfg(not(feature = "rayon"))]
                {
                    line.arrows
                        .iter()
                        .zip(target_vals.iter())
                        .map(|(arrow, target_val)| compute_arrow(&registry, &source_val, arrow, target_val.as_ref()))
                        .collect()
                }
            };

            for (arrow, result) in line.arrows.iter().zip(results.into_iter()) {
                let value = result?;
                if arrow.backward {
                    if let (Some(_func), NodeKind::Layer) = (&arrow.func, line.source.kind) {
                        self.state.weights[line.source.index] = value.clone();
                    }
                } else {
                    self.write_target(arrow.target, value.clone())?;
                }
                self.fire_debug(line.source, arrow, &value);
            }
        }
        Ok(())
    }

    /// Same ordering as the CPU path, but forward arrows prefer a device
    /// kernel (falling back to the host registry function when the backend
    /// has no such shader) while backward arrows always run host-side.
    fn forward_device(&mut self, graph: &Graph, fetched: &mut [bool]) -> HarmonicsResult<()> {
        for line in &graph.cycle {
            let source_val = self.fetch(line.source, fetched)?;
            for arrow in &line.arrows {
                if arrow.backward {
                    let value = self.apply_backward(line.source, arrow, fetched)?;
                    self.fire_debug(line.source, arrow, &value);
                    continue;
                }

                let dispatch_name = device_shader_name(arrow.func.as_deref());
                let value = match self.backend.dispatch(&dispatch_name, &[&source_val]) {
                    Ok(v) => v,
                    Err(_) => match &arrow.func {
                        Some(f) => (self.registry.activation(f)?)(&source_val),
                        None => source_val.clone(),
                    },
                };
                self.write_target(arrow.target, value.clone())?;
                self.fire_debug(line.source, arrow, &value);
            }
        }
        Ok(())
    }

    /// Binary checkpoint: magic `"HRTC"`, version, the four tensor vectors
    /// and the precision-bits vector (each length-prefixed), then the
    /// chain string.
    pub fn save_checkpoint<W: std::io::Write>(&self, mut w: W) -> HarmonicsResult<()> {
        w.write_all(b"HRTC")?;
        w.write_all(&1u32.to_le_bytes())?;

        write_tensor_vec(&mut w, &self.state.producer_tensors)?;
        write_tensor_vec(&mut w, &self.state.layer_tensors)?;
        write_tensor_vec(&mut w, &self.state.consumer_tensors)?;
        write_tensor_vec(&mut w, &self.state.weights)?;

        w.write_all(&(self.state.precision_bits.len() as u32).to_le_bytes())?;
        for b in &self.state.precision_bits {
            w.write_all(&b.to_le_bytes())?;
        }

        let chain_bytes = self.proof_chain.chain.as_bytes();
        w.write_all(&(chain_bytes.len() as u32).to_le_bytes())?;
        w.write_all(chain_bytes)?;
        Ok(())
    }

    /// Loads a checkpoint written by [`Self::save_checkpoint`]. Resets
    /// `proof` to empty (no forward pass has run against the restored state
    /// yet) but keeps the chain so the next secure forward pass continues
    /// the hash chain correctly.
    pub fn load_checkpoint<R: std::io::Read>(&mut self, mut r: R) -> HarmonicsResult<()> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(|_| HarmonicsError::TruncatedStream("magic"))?;
        if &magic != b"HRTC" {
            return Err(HarmonicsError::BadMagic { expected: "HRTC", found: magic });
        }
        let mut version_buf = [0u8; 4];
        r.read_exact(&mut version_buf).map_err(|_| HarmonicsError::TruncatedStream("version"))?;
        let version = u32::from_le_bytes(version_buf);
        if version != 1 {
            return Err(HarmonicsError::UnsupportedVersion(version));
        }

        self.state.producer_tensors = read_tensor_vec(&mut r)?;
        self.state.layer_tensors = read_tensor_vec(&mut r)?;
        self.state.consumer_tensors = read_tensor_vec(&mut r)?;
        self.state.weights = read_tensor_vec(&mut r)?;

        let mut count_buf = [0u8; 4];
        r.read_exact(&mut count_buf).map_err(|_| HarmonicsError::TruncatedStream("precision bits count"))?;
        let count = u32::from_le_bytes(count_buf) as usize;
        let mut precision_bits = Vec::with_capacity(count);
        for _ in 0..count {
            let mut b = [0u8; 4];
            r.read_exact(&mut b).map_err(|_| HarmonicsError::TruncatedStream("precision bits"))?;
            precision_bits.push(u32::from_le_bytes(b));
        }
        self.state.precision_bits = precision_bits;

        let mut chain_len_buf = [0u8; 4];
        r.read_exact(&mut chain_len_buf).map_err(|_| HarmonicsError::TruncatedStream("chain length"))?;
        let chain_len = u32::from_le_bytes(chain_len_buf) as usize;
        let mut chain_bytes = vec![0u8; chain_len];
        r.read_exact(&mut chain_bytes).map_err(|_| HarmonicsError::TruncatedStream("chain"))?;
        let chain = String::from_utf8(chain_bytes).map_err(|e| HarmonicsError::MalformedAst(e.to_string()))?;

        self.proof_chain.proof.clear();
        self.proof_chain.chain = chain;
        Ok(())
    }
}

fn device_shader_name(func: Option<&str>) -> String {
    match func {
        Some(f) => format!("{f}_f32"),
        None => "identity_f32".to_string(),
    }
}

fn compute_arrow(
    registry: &FunctionRegistry,
    source_val: &Tensor,
    arrow: &Arrow,
    target_val: Option<&Tensor>,
) -> HarmonicsResult<Tensor> {
    if arrow.backward {
        match &arrow.func {
            Some(f) => {
                let target_val = target_val.expect("backward target pre-fetched");
                let loss = registry.loss(f)?;
                Ok(loss(source_val, target_val))
            }
            None => Ok(Tensor::empty()),
        }
    } else {
        match &arrow.func {
            Some(f) => {
                let activation = registry.activation(f)?;
                Ok(activation(source_val))
            }
            None => Ok(source_val.clone()),
        }
    }
}

/// Two arrows in one flow line that would write the same slot (two forward
/// arrows with the same target, or two backward arrows with the same
/// layer-valued source) cannot be safely scheduled on the multi-threaded
/// path.
fn reject_aliasing_writes(line: &FlowLine) -> HarmonicsResult<()> {
    let mut forward_targets = std::collections::HashSet::new();
    let mut backward_source_seen = false;
    for arrow in &line.arrows {
        if arrow.backward {
            if arrow.func.is_some() && line.source.kind == NodeKind::Layer {
                if backward_source_seen {
                    return Err(HarmonicsError::AliasingWrite(line.source));
                }
                backward_source_seen = true;
            }
        } else if !forward_targets.insert((arrow.target.kind, arrow.target.index)) {
            return Err(HarmonicsError::AliasingWrite(arrow.target));
        }
    }
    Ok(())
}

fn write_tensor_vec<W: std::io::Write>(mut w: W, tensors: &[Tensor]) -> HarmonicsResult<()> {
    use crate::tensor::write_tensor;
    w.write_all(&(tensors.len() as u32).to_le_bytes())?;
    for t in tensors {
        write_tensor(&mut w, t)?;
    }
    Ok(())
}

fn read_tensor_vec<R: std::io::Read>(mut r: R) -> HarmonicsResult<Vec<Tensor>> {
    use crate::tensor::read_tensor;
    let mut count_buf = [0u8; 4];
    r.read_exact(&mut count_buf).map_err(|_| HarmonicsError::TruncatedStream("tensor vec count"))?;
    let count = u32::from_le_bytes(count_buf) as usize;
    (0..count).map(|_| read_tensor(&mut r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ast::{arrow, build_graph, GraphAst};
    use crate::precision::FixedWidth;

    fn runtime_for(ast: &GraphAst) -> CycleRuntime {
        let graph = Arc::new(build_graph(ast).unwrap());
        CycleRuntime::new(graph, Box::new(FixedWidth(32)), FunctionRegistry::with_builtins(), Deployment::default())
    }

    #[test]
    fn identity_cycle_copies_producer_to_consumer() {
        let ast = GraphAst::new().producer("p", Some(2)).consumer("c", None).flow("p", vec![arrow("c", false, None)]);
        let mut rt = runtime_for(&ast);
        rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[1.0, 2.0])])));
        rt.forward().unwrap();
        assert_eq!(rt.state().consumer_tensors[0].as_f32(), vec![1.0, 2.0]);
    }

    #[test]
    fn activation_applies_relu_before_consumer() {
        let ast = GraphAst::new()
            .producer("p", Some(3))
            .layer("l")
            .consumer("c", None)
            .flow("p", vec![arrow("l", false, Some("relu"))])
            .flow("l", vec![arrow("c", false, None)]);
        let mut rt = runtime_for(&ast);
        rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![3], &[-1.0, 0.0, 2.5])])));
        rt.forward().unwrap();
        assert_eq!(rt.state().layer_tensors[0].as_f32(), vec![0.0, 0.0, 2.5]);
        assert_eq!(rt.state().consumer_tensors[0].as_f32(), vec![0.0, 0.0, 2.5]);
    }

    #[test]
    fn backward_tap_computes_mse_without_touching_forward_state() {
        let ast = GraphAst::new()
            .producer("p", Some(2))
            .producer("t", Some(2))
            .layer("l")
            .flow("p", vec![arrow("l", false, None)])
            .flow("l", vec![arrow("t", true, Some("mse"))]);
        let mut rt = runtime_for(&ast);
        rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[0.5, 0.5])])));
        rt.bind_producer(1, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[1.0, 0.0])])));
        rt.forward().unwrap();
        assert_eq!(rt.state().weights[0].as_f32(), vec![0.25, 0.25]);
        assert_eq!(rt.state().layer_tensors[0].as_f32(), vec![0.5, 0.5]);
    }

    #[test]
    fn unbound_producer_errors() {
        let ast = GraphAst::new().producer("p", Some(1)).consumer("c", None).flow("p", vec![arrow("c", false, None)]);
        let mut rt = runtime_for(&ast);
        assert!(matches!(rt.forward(), Err(HarmonicsError::ProducerNotBound(0))));
    }

    #[test]
    fn secure_mode_produces_nonempty_proof_with_no_layers() {
        let ast = GraphAst::new().producer("p", Some(1)).consumer("c", None).flow("p", vec![arrow("c", false, None)]);
        let graph = Arc::new(build_graph(&ast).unwrap());
        let mut rt = CycleRuntime::new(
            graph,
            Box::new(FixedWidth(32)),
            FunctionRegistry::with_builtins(),
            Deployment::default().secure(true),
        );
        rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![1], &[1.0])])));
        rt.forward().unwrap();
        assert!(!rt.proof().is_empty());
        assert_eq!(rt.proof(), blake3::hash(b"").to_hex().to_string());
    }

    #[test]
    fn checkpoint_round_trips_state_and_resets_proof() {
        let ast = GraphAst::new()
            .producer("p", Some(2))
            .layer("l")
            .flow("p", vec![arrow("l", false, Some("relu"))]);
        let graph = Arc::new(build_graph(&ast).unwrap());
        let mut rt =
            CycleRuntime::new(graph, Box::new(FixedWidth(32)), FunctionRegistry::with_builtins(), Deployment::default().secure(true));
        rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[-1.0, 3.0])])));
        rt.forward().unwrap();
        assert!(!rt.proof().is_empty());

        let mut buf = Vec::new();
        rt.save_checkpoint(&mut buf).unwrap();

        let graph2 = rt.graph_arc();
        let mut rt2 = CycleRuntime::new(graph2, Box::new(FixedWidth(32)), FunctionRegistry::with_builtins(), Deployment::default());
        rt2.load_checkpoint(&buf[..]).unwrap();
        assert_eq!(rt2.state().layer_tensors[0].as_f32(), vec![0.0, 3.0]);
        assert!(rt2.proof().is_empty());
        assert_eq!(rt2.chain(), rt.proof());
    }

    #[test]
    fn debug_callback_fires_per_arrow() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let ast = GraphAst::new().producer("p", Some(1)).consumer("c", None).flow("p", vec![arrow("c", false, None)]);
        let mut rt = runtime_for(&ast);
        rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![1], &[1.0])])));
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        rt.set_debug_callback(Arc::new(move |_ev| {
            count2.fetch_add(1, Ordering::Relaxed);
        }));
        rt.forward().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
