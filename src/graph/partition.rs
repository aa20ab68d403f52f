//! Splits a graph into sequential partitions by layer index, inserting
//! synthetic boundary producer/consumer pairs wherever a flow line crosses
//! the split so each partition remains a self-contained, runnable graph.

use super::{Arrow, Consumer, FlowLine, Graph, NodeId, NodeKind, Producer};
use crate::backend::RequestedBackend;
use crate::deploy::backend_weight;
use crate::error::{HarmonicsError, HarmonicsResult};

/// One partition plus the boundary names it exposes, in crossing order, so a
/// distributed scheduler can wire partitions together.
#[derive(Clone, Debug)]
pub struct Partition {
    pub graph: Graph,
    /// Names of synthetic consumers fed by the previous partition.
    pub inbound_boundaries: Vec<String>,
    /// Names of synthetic producers read by the next partition.
    pub outbound_boundaries: Vec<String>,
}

/// Splits `graph` at layer index `split` (layers `0..split` go to the first
/// partition, `split..` to the second). Any flow line whose source is a
/// layer below the split and whose arrow targets a layer at or above it (or
/// vice versa) is cut at the boundary: a synthetic consumer absorbs the
/// value in the source partition, a synthetic producer re-emits it in the
/// destination partition.
pub fn partition_by_layer(graph: &Graph, split: usize) -> HarmonicsResult<Vec<Partition>> {
    if split > graph.layers.len() {
        return Err(HarmonicsError::SplitOutOfRange { split, len: graph.layers.len() });
    }

    let side_of = |id: NodeId| -> usize {
        match id.kind {
            NodeKind::Layer => {
                if id.index < split {
                    0
                } else {
                    1
                }
            }
            // producers/consumers belong to the partition touching them;
            // resolved below per flow line since a producer/consumer can
            // only appear as a source or a terminal target, never split.
            _ => usize::MAX,
        }
    };

    let mut left = Graph { producers: Vec::new(), consumers: Vec::new(), layers: Vec::new(), cycle: Vec::new() };
    let mut right = Graph { producers: Vec::new(), consumers: Vec::new(), layers: Vec::new(), cycle: Vec::new() };

    for (i, l) in graph.layers.iter().enumerate() {
        let mut l = l.clone();
        l.ratio = None; // cross-partition ratio refs cannot be resolved locally
        if i < split {
            left.layers.push(l);
        } else {
            right.layers.push(l);
        }
    }

    let mut inbound_boundaries = Vec::new();
    let mut outbound_boundaries = Vec::new();
    let mut boundary_seq = 0usize;

    let remap_layer = |id: NodeId, owner_split_offset: usize| NodeId::new(NodeKind::Layer, id.index - owner_split_offset);

    // Bulk-copy flow lines whose source and every arrow target share one
    // side; cut the rest at the boundary.
    for line in &graph.cycle {
        let line_side = |id: NodeId| -> Option<usize> {
            match id.kind {
                NodeKind::Layer => Some(side_of(id)),
                _ => None,
            }
        };

        let source_side = line_side(line.source);
        let mut local_arrows_left = Vec::new();
        let mut local_arrows_right = Vec::new();

        for arrow in &line.arrows {
            let target_side = line_side(arrow.target);
            match (source_side, target_side) {
                (Some(s), Some(t)) if s == t => {
                    let remapped = Arrow {
                        target: remap_layer(arrow.target, if t == 0 { 0 } else { split }),
                        backward: arrow.backward,
                        func: arrow.func.clone(),
                    };
                    if s == 0 {
                        local_arrows_left.push(remapped);
                    } else {
                        local_arrows_right.push(remapped);
                    }
                }
                (Some(s), Some(t)) if s != t => {
                    let boundary_name = format!("__boundary_{boundary_seq}");
                    boundary_seq += 1;
                    if s == 0 {
                        left.consumers.push(Consumer { name: boundary_name.clone(), fixed_width: None });
                        inbound_boundaries.push(boundary_name.clone());
                        let consumer_id = NodeId::new(NodeKind::Consumer, left.consumers.len() - 1);
                        local_arrows_left.push(Arrow { target: consumer_id, backward: arrow.backward, func: arrow.func.clone() });

                        right.producers.push(Producer { name: boundary_name.clone(), fixed_width: None, ratio: None, width: None });
                        outbound_boundaries.push(boundary_name);
                        let producer_id = NodeId::new(NodeKind::Producer, right.producers.len() - 1);
                        right.cycle.push(FlowLine {
                            source: producer_id,
                            arrows: vec![Arrow {
                                target: remap_layer(arrow.target, split),
                                backward: arrow.backward,
                                func: arrow.func.clone(),
                            }],
                        });
                    } else {
                        right.consumers.push(Consumer { name: boundary_name.clone(), fixed_width: None });
                        inbound_boundaries.push(boundary_name.clone());
                        let consumer_id = NodeId::new(NodeKind::Consumer, right.consumers.len() - 1);
                        local_arrows_right.push(Arrow { target: consumer_id, backward: arrow.backward, func: arrow.func.clone() });

                        left.producers.push(Producer { name: boundary_name.clone(), fixed_width: None, ratio: None, width: None });
                        outbound_boundaries.push(boundary_name);
                        let producer_id = NodeId::new(NodeKind::Producer, left.producers.len() - 1);
                        left.cycle.push(FlowLine {
                            source: producer_id,
                            arrows: vec![Arrow { target: remap_layer(arrow.target, 0), backward: arrow.backward, func: arrow.func.clone() }],
                        });
                    }
                }
                _ => {
                    // Producer/consumer source with a local layer target: keep on the target's side.
                    if let Some(t) = target_side {
                        let remapped = Arrow {
                            target: remap_layer(arrow.target, if t == 0 { 0 } else { split }),
                            backward: arrow.backward,
                            func: arrow.func.clone(),
                        };
                        if t == 0 {
                            local_arrows_left.push(remapped);
                        } else {
                            local_arrows_right.push(remapped);
                        }
                    }
                }
            }
        }

        match line.source.kind {
            NodeKind::Producer => {
                let p = &graph.producers[line.source.index];
                if !local_arrows_left.is_empty() {
                    left.producers.push(p.clone());
                    let id = NodeId::new(NodeKind::Producer, left.producers.len() - 1);
                    left.cycle.push(FlowLine { source: id, arrows: local_arrows_left });
                }
                if !local_arrows_right.is_empty() {
                    right.producers.push(p.clone());
                    let id = NodeId::new(NodeKind::Producer, right.producers.len() - 1);
                    right.cycle.push(FlowLine { source: id, arrows: local_arrows_right });
                }
            }
            NodeKind::Layer => {
                let side = side_of(line.source);
                if side == 0 && !local_arrows_left.is_empty() {
                    left.cycle.push(FlowLine { source: remap_layer(line.source, 0), arrows: local_arrows_left });
                } else if side == 1 && !local_arrows_right.is_empty() {
                    right.cycle.push(FlowLine { source: remap_layer(line.source, split), arrows: local_arrows_right });
                }
            }
            NodeKind::Consumer => {}
        }
    }

    // Every producer/consumer in the source graph is present in both
    // partitions (shape info duplicated), even when a side never drives it
    // through a local flow line.
    for p in &graph.producers {
        if !left.producers.iter().any(|lp| lp.name == p.name) {
            left.producers.push(Producer { name: p.name.clone(), fixed_width: p.fixed_width, ratio: None, width: None });
        }
        if !right.producers.iter().any(|rp| rp.name == p.name) {
            right.producers.push(Producer { name: p.name.clone(), fixed_width: p.fixed_width, ratio: None, width: None });
        }
    }
    for c in &graph.consumers {
        if !left.consumers.iter().any(|lc| lc.name == c.name) {
            left.consumers.push(Consumer { name: c.name.clone(), fixed_width: c.fixed_width });
        }
        if !right.consumers.iter().any(|rc| rc.name == c.name) {
            right.consumers.push(Consumer { name: c.name.clone(), fixed_width: c.fixed_width });
        }
    }

    left.propagate_ratios();
    right.propagate_ratios();

    Ok(vec![
        Partition { graph: left, inbound_boundaries: Vec::new(), outbound_boundaries: outbound_boundaries.clone() },
        Partition { graph: right, inbound_boundaries, outbound_boundaries: Vec::new() },
    ])
}

/// Distributes layers across `backends.len()` sequential partitions,
/// weighted by each target backend's relative throughput
/// ([`backend_weight`]: GPU=4, FPGA=2, CPU=1, Wasm=1). Split points are
/// `round(cumulative_weight_ratio * |layers|)`, so a GPU partition followed
/// by three CPU partitions gets roughly half the layers rather than a
/// quarter each.
pub fn auto_partition(graph: &Graph, backends: &[RequestedBackend]) -> HarmonicsResult<Vec<Partition>> {
    if backends.is_empty() {
        return Err(HarmonicsError::SplitOutOfRange { split: 0, len: graph.layers.len() });
    }
    if backends.len() == 1 {
        return Ok(vec![Partition { graph: graph.clone(), inbound_boundaries: Vec::new(), outbound_boundaries: Vec::new() }]);
    }

    let weights: Vec<u64> = backends.iter().map(|b| backend_weight(*b) as u64).collect();
    let total_weight: u64 = weights.iter().sum();
    let total_layers = graph.layers.len();

    let mut cumulative = 0u64;
    let mut abs_splits = Vec::with_capacity(weights.len() - 1);
    for w in &weights[..weights.len() - 1] {
        cumulative += w;
        let split = ((cumulative as f64 / total_weight as f64) * total_layers as f64).round() as usize;
        abs_splits.push(split);
    }

    let mut pieces = Vec::with_capacity(backends.len());
    let mut remainder = graph.clone();
    let mut consumed = 0usize;
    for abs_split in abs_splits {
        let remaining_len = remainder.layers.len();
        if remaining_len <= 1 {
            // Out of layers to hand to the remaining partitions; they
            // collapse into the tail piece pushed after this loop.
            break;
        }
        let local_split = abs_split.saturating_sub(consumed).clamp(1, remaining_len - 1);
        let mut halves = partition_by_layer(&remainder, local_split)?;
        let right = halves.pop().expect("two pieces always produced");
        let left = halves.pop().expect("two pieces always produced");
        consumed += local_split;
        pieces.push(left);
        remainder = right.graph;
    }
    pieces.push(Partition { graph: remainder, inbound_boundaries: Vec::new(), outbound_boundaries: Vec::new() });
    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ast::{arrow, build_graph, GraphAst};

    fn chain_graph() -> Graph {
        let ast = GraphAst::new()
            .producer("p", Some(2))
            .layer("l1")
            .layer("l2")
            .layer("l3")
            .consumer("c", None)
            .flow("p", vec![arrow("l1", false, Some("relu"))])
            .flow("l1", vec![arrow("l2", false, Some("relu"))])
            .flow("l2", vec![arrow("l3", false, Some("relu"))])
            .flow("l3", vec![arrow("c", false, None)]);
        build_graph(&ast).unwrap()
    }

    #[test]
    fn split_past_layer_count_is_out_of_range() {
        let g = chain_graph();
        let err = partition_by_layer(&g, g.layers.len() + 1).unwrap_err();
        assert!(matches!(err, HarmonicsError::SplitOutOfRange { .. }));
    }

    #[test]
    fn split_at_zero_or_len_is_allowed() {
        let g = chain_graph();
        assert!(partition_by_layer(&g, 0).is_ok());
        assert!(partition_by_layer(&g, g.layers.len()).is_ok());
    }

    #[test]
    fn split_inserts_one_matching_boundary_pair() {
        let g = chain_graph();
        let halves = partition_by_layer(&g, 2).unwrap();
        assert_eq!(halves.len(), 2);
        assert_eq!(halves[0].graph.layers.len(), 2);
        assert_eq!(halves[1].graph.layers.len(), 1);
        assert_eq!(halves[0].outbound_boundaries.len(), 1);
        assert_eq!(halves[1].inbound_boundaries.len(), 1);
        assert_eq!(halves[0].outbound_boundaries[0], halves[1].inbound_boundaries[0]);
        // producer/consumer present in both halves (duplicated per-side),
        // even on the side that never drives/reads them directly.
        assert!(halves[0].graph.producers.iter().any(|p| p.name == "p"));
        assert!(halves[1].graph.producers.iter().any(|p| p.name == "p"));
        assert!(halves[0].graph.consumers.iter().any(|c| c.name == "c"));
        assert!(halves[1].graph.consumers.iter().any(|c| c.name == "c"));
    }

    #[test]
    fn auto_partition_weights_gpu_partitions_more_heavily() {
        let g = chain_graph();
        let pieces = auto_partition(&g, &[RequestedBackend::Gpu, RequestedBackend::Cpu]).unwrap();
        assert_eq!(pieces.len(), 2);
        let total: usize = pieces.iter().map(|p| p.graph.layers.len()).sum();
        assert_eq!(total, g.layers.len());
        assert!(pieces[0].graph.layers.len() >= pieces[1].graph.layers.len());
    }
}
