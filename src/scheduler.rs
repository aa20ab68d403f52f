//! Distributed scheduler: owns one runtime per partition and shuttles
//! boundary tensors (and, in secure mode, proofs) between them every
//! `step()`. Partitions run sequentially within a step; a boundary tensor
//! produced by partition *i* is visible to every partition *j > i* in the
//! same step, and to earlier partitions only on the following step.

use std::sync::{Arc, Mutex};

use crate::deploy::Deployment;
use crate::error::HarmonicsResult;
use crate::graph::partition::Partition;
use crate::precision::PrecisionPolicy;
use crate::registry::FunctionRegistry;
use crate::runtime::{ConsumerSink, CycleRuntime, ProducerSource};
use crate::tensor::Tensor;

type BusCell = Arc<Mutex<Option<(Tensor, Option<String>)>>>;
type Staged = Arc<Mutex<Option<Tensor>>>;

/// Links a synthetic consumer in one partition to the synthetic producer of
/// the same name in another, per [`crate::graph::partition::partition_by_layer`].
struct Boundary {
    consumer_part: usize,
    consumer_index: usize,
    producer_part: usize,
    #[allow(dead_code)]
    producer_index: usize,
    cell: BusCell,
    staged: Staged,
}

/// A `ProducerSource` that returns whatever value the scheduler staged for
/// it this step, or an empty tensor if nothing has arrived yet (the first
/// step of a boundary that flows against partition order).
struct BusProducer {
    staged: Staged,
}

impl ProducerSource for BusProducer {
    fn next(&mut self) -> HarmonicsResult<Tensor> {
        Ok(self.staged.lock().expect("bus mutex poisoned").take().unwrap_or_else(Tensor::empty))
    }
}

/// Runs a sequence of partitioned graphs as one distributed system, wiring
/// each cross-partition boundary through a shared cell that plays the role
/// of the plain or proof-carrying message bus.
pub struct DistributedScheduler {
    runtimes: Vec<CycleRuntime>,
    boundaries: Vec<Boundary>,
    secure: bool,
}

impl DistributedScheduler {
    /// Builds one runtime per partition (with `deployment`'s backend and
    /// secure flag applied to each), then wires every consumer in a
    /// partition to the producer of the same name in another partition.
    pub fn new(
        partitions: Vec<Partition>,
        policy_factory: impl Fn() -> Box<dyn PrecisionPolicy>,
        registry: FunctionRegistry,
        deployment: Deployment,
    ) -> HarmonicsResult<Self> {
        let graphs: Vec<_> = partitions.iter().map(|p| Arc::new(p.graph.clone())).collect();

        // name -> (partition, index) for every producer across all partitions.
        let mut producer_index: std::collections::HashMap<String, (usize, usize)> = std::collections::HashMap::new();
        for (part_idx, graph) in graphs.iter().enumerate() {
            for (i, p) in graph.producers.iter().enumerate() {
                producer_index.insert(p.name.clone(), (part_idx, i));
            }
        }

        let mut runtimes: Vec<CycleRuntime> = graphs
            .iter()
            .map(|g| CycleRuntime::new(Arc::clone(g), policy_factory(), registry.clone(), deployment))
            .collect();

        let mut boundaries = Vec::new();
        for (part_idx, graph) in graphs.iter().enumerate() {
            for (c_idx, c) in graph.consumers.iter().enumerate() {
                if let Some(&(producer_part, producer_index_in_part)) = producer_index.get(&c.name) {
                    if producer_part == part_idx {
                        continue;
                    }
                    let cell: BusCell = Arc::new(Mutex::new(None));
                    let staged: Staged = Arc::new(Mutex::new(None));
                    runtimes[producer_part]
                        .bind_producer(producer_index_in_part, Box::new(BusProducer { staged: Arc::clone(&staged) }));
                    boundaries.push(Boundary {
                        consumer_part: part_idx,
                        consumer_index: c_idx,
                        producer_part,
                        producer_index: producer_index_in_part,
                        cell,
                        staged,
                    });
                }
            }
        }

        Ok(Self { runtimes, boundaries, secure: deployment.secure })
    }

    pub fn runtime(&self, partition: usize) -> &CycleRuntime {
        &self.runtimes[partition]
    }

    pub fn runtime_mut(&mut self, partition: usize) -> &mut CycleRuntime {
        &mut self.runtimes[partition]
    }

    pub fn bind_producer(&mut self, partition: usize, index: usize, source: Box<dyn ProducerSource>) {
        self.runtimes[partition].bind_producer(index, source);
    }

    pub fn bind_consumer(&mut self, partition: usize, index: usize, sink: Box<dyn ConsumerSink>) {
        self.runtimes[partition].bind_consumer(index, sink);
    }

    /// Runs every partition once, in declaration order: pre-fetch any
    /// pending boundary message into this partition's staged producers
    /// (and, in secure mode, adopt its proof as this runtime's chain),
    /// forward, then publish this partition's consumer-side boundary
    /// tensors for downstream partitions to pick up.
    #[tracing::instrument(skip(self), fields(partitions = self.runtimes.len(), secure = self.secure))]
    pub fn step(&mut self) -> HarmonicsResult<()> {
        let n = self.runtimes.len();
        for i in 0..n {
            for boundary in &self.boundaries {
                if boundary.producer_part != i {
                    continue;
                }
                let message = boundary.cell.lock().expect("bus mutex poisoned").take();
                if let Some((tensor, proof)) = message {
                    if self.secure {
                        if let Some(p) = proof {
                            self.runtimes[i].set_chain(p);
                        }
                    }
                    *boundary.staged.lock().expect("bus mutex poisoned") = Some(tensor);
                }
            }

            self.runtimes[i].forward()?;

            for boundary in &self.boundaries {
                if boundary.consumer_part != i {
                    continue;
                }
                let tensor = self.runtimes[i].state().consumer_tensors[boundary.consumer_index].clone();
                let proof = if self.secure { Some(self.runtimes[i].proof().to_string()) } else { None };
                *boundary.cell.lock().expect("bus mutex poisoned") = Some((tensor, proof));
            }
        }
        Ok(())
    }

    /// `step()` repeated `epochs` times.
    pub fn fit(&mut self, epochs: usize) -> HarmonicsResult<()> {
        for _ in 0..epochs {
            self.step()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RequestedBackend;
    use crate::graph::ast::{arrow, build_graph, GraphAst};
    use crate::graph::partition::partition_by_layer;
    use crate::precision::FixedWidth;
    use crate::runtime::FixedProducer;

    fn chain_graph() -> GraphAst {
        GraphAst::new()
            .producer("p", Some(2))
            .layer("l1")
            .layer("l2")
            .layer("l3")
            .consumer("c", None)
            .flow("p", vec![arrow("l1", false, Some("relu"))])
            .flow("l1", vec![arrow("l2", false, Some("relu"))])
            .flow("l2", vec![arrow("l3", false, Some("relu"))])
            .flow("l3", vec![arrow("c", false, None)])
    }

    #[test]
    fn partitioned_scheduler_matches_single_partition_cpu_run() {
        let ast = chain_graph();
        let graph = build_graph(&ast).unwrap();

        let input = Tensor::from_f32(vec![2], &[-1.0, 3.0]);

        let graph_arc = Arc::new(graph.clone());
        let mut single =
            CycleRuntime::new(graph_arc, Box::new(FixedWidth(32)), FunctionRegistry::with_builtins(), Deployment::new(RequestedBackend::Cpu));
        single.bind_producer(0, Box::new(FixedProducer::new(vec![input.clone()])));
        single.forward().unwrap();
        let expected = single.state().consumer_tensors[0].clone();

        let partitions = partition_by_layer(&graph, 2).unwrap();
        let mut scheduler = DistributedScheduler::new(
            partitions,
            || Box::new(FixedWidth(32)),
            FunctionRegistry::with_builtins(),
            Deployment::new(RequestedBackend::Cpu),
        )
        .unwrap();
        scheduler.bind_producer(0, 0, Box::new(FixedProducer::new(vec![input])));
        scheduler.step().unwrap();

        let consumer_idx = scheduler.runtime(1).graph().consumers.iter().position(|c| c.name == "c").unwrap();
        let got = &scheduler.runtime(1).state().consumer_tensors[consumer_idx];
        assert_eq!(got.as_f32(), expected.as_f32());
    }
}
