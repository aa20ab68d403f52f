//! Graph model: producers, consumers, layers, the cyclic flow-line schedule,
//! ratio-driven width propagation and the graph digest.

pub mod ast;
pub mod io;
pub mod partition;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{HarmonicsError, HarmonicsResult};

/// Which of the three node vectors a [`NodeId`] indexes into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Producer,
    Consumer,
    Layer,
}

/// Reference to a node by kind and index within that kind's vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub kind: NodeKind,
    pub index: usize,
}

impl NodeId {
    pub fn new(kind: NodeKind, index: usize) -> Self {
        Self { kind, index }
    }
}

/// `this node's width = width(reference) * lhs / rhs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RatioRef {
    pub lhs: i64,
    pub rhs: i64,
    pub reference: NodeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Producer {
    pub name: String,
    pub fixed_width: Option<usize>,
    pub ratio: Option<RatioRef>,
    pub width: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Consumer {
    pub name: String,
    pub fixed_width: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub ratio: Option<RatioRef>,
    pub width: Option<usize>,
}

/// A directed edge inside a flow line. Forward arrows (`backward == false`)
/// apply an activation; backward arrows apply a loss against the target
/// when their source is a layer and `func` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Arrow {
    pub target: NodeId,
    pub backward: bool,
    pub func: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowLine {
    pub source: NodeId,
    pub arrows: Vec<Arrow>,
}

/// An immutable, built graph: three ordered node vectors plus the cyclic
/// schedule over them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    pub producers: Vec<Producer>,
    pub consumers: Vec<Consumer>,
    pub layers: Vec<Layer>,
    pub cycle: Vec<FlowLine>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps every node name to its `NodeId`. Names are unique across all
    /// three kinds by construction (`build_graph` enforces this).
    pub fn name_index(&self) -> HashMap<String, NodeId> {
        let mut map = HashMap::new();
        for (i, p) in self.producers.iter().enumerate() {
            map.insert(p.name.clone(), NodeId::new(NodeKind::Producer, i));
        }
        for (i, c) in self.consumers.iter().enumerate() {
            map.insert(c.name.clone(), NodeId::new(NodeKind::Consumer, i));
        }
        for (i, l) in self.layers.iter().enumerate() {
            map.insert(l.name.clone(), NodeId::new(NodeKind::Layer, i));
        }
        map
    }

    pub fn node_name(&self, id: NodeId) -> &str {
        match id.kind {
            NodeKind::Producer => &self.producers[id.index].name,
            NodeKind::Consumer => &self.consumers[id.index].name,
            NodeKind::Layer => &self.layers[id.index].name,
        }
    }

    fn width_of(&self, id: NodeId) -> Option<usize> {
        match id.kind {
            NodeKind::Producer => self.producers[id.index].width.or(self.producers[id.index].fixed_width),
            NodeKind::Consumer => self.consumers[id.index].fixed_width,
            NodeKind::Layer => self.layers[id.index].width,
        }
    }

    /// Fixed-point ratio resolution: repeatedly compute
    /// `width(n) = width(ratio.ref) * lhs / rhs` for every unresolved node
    /// whose reference is resolved, until no change occurs in a full pass.
    pub fn propagate_ratios(&mut self) {
        // seed producer/layer widths from their fixed width where no ratio applies
        for p in &mut self.producers {
            if p.ratio.is_none() && p.width.is_none() {
                p.width = p.fixed_width;
            }
        }
        loop {
            let mut changed = false;
            for i in 0..self.producers.len() {
                if self.producers[i].width.is_some() {
                    continue;
                }
                if let Some(r) = self.producers[i].ratio.clone() {
                    if let Some(base) = self.width_of(r.reference) {
                        self.producers[i].width =
                            Some(((base as i64) * r.lhs / r.rhs).max(0) as usize);
                        changed = true;
                    }
                }
            }
            for i in 0..self.layers.len() {
                if self.layers[i].width.is_some() {
                    continue;
                }
                if let Some(r) = self.layers[i].ratio.clone() {
                    if let Some(base) = self.width_of(r.reference) {
                        self.layers[i].width = Some(((base as i64) * r.lhs / r.rhs).max(0) as usize);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Deterministic BLAKE3-hex digest over every node definition and every
    /// arrow, in declaration order. Equal graphs produce equal digests.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for p in &self.producers {
            hasher.update(b"P:");
            hasher.update(p.name.as_bytes());
            hasher.update(&encode_opt_usize(p.fixed_width));
            hasher.update(&encode_opt_ratio(&p.ratio));
        }
        for c in &self.consumers {
            hasher.update(b"C:");
            hasher.update(c.name.as_bytes());
            hasher.update(&encode_opt_usize(c.fixed_width));
        }
        for l in &self.layers {
            hasher.update(b"L:");
            hasher.update(l.name.as_bytes());
            hasher.update(&encode_opt_ratio(&l.ratio));
        }
        for line in &self.cycle {
            hasher.update(b"F:");
            hasher.update(&encode_node_id(line.source));
            for a in &line.arrows {
                hasher.update(&encode_node_id(a.target));
                hasher.update(&[a.backward as u8]);
                match &a.func {
                    Some(f) => {
                        hasher.update(&[1]);
                        hasher.update(f.as_bytes());
                    }
                    None => hasher.update(&[0]),
                };
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Removes layer `index`, along with every flow line sourced from it,
    /// every arrow targeting it, and decrements `NodeId`s of the surviving
    /// layers above it. Re-runs ratio propagation.
    pub fn remove_layer(&mut self, index: usize) -> HarmonicsResult<()> {
        if index >= self.layers.len() {
            return Err(HarmonicsError::UnknownNode(format!("layer index {index}")));
        }
        let removed = NodeId::new(NodeKind::Layer, index);
        let shift = |id: NodeId| -> Option<NodeId> {
            if id.kind != NodeKind::Layer {
                return Some(id);
            }
            if id.index == index {
                None
            } else if id.index > index {
                Some(NodeId::new(NodeKind::Layer, id.index - 1))
            } else {
                Some(id)
            }
        };

        let mut new_cycle = Vec::new();
        for mut line in self.cycle.drain(..) {
            if line.source == removed {
                continue;
            }
            line.arrows.retain(|a| a.target != removed);
            if let Some(s) = shift(line.source) {
                line.source = s;
                for a in &mut line.arrows {
                    a.target = shift(a.target).expect("non-layer or surviving layer");
                }
                new_cycle.push(line);
            }
        }
        self.cycle = new_cycle;
        self.layers.remove(index);
        for l in &mut self.layers {
            if let Some(r) = &mut l.ratio {
                if r.reference.kind == NodeKind::Layer && r.reference.index > index {
                    r.reference.index -= 1;
                }
            }
        }
        for p in &mut self.producers {
            if let Some(r) = &mut p.ratio {
                if r.reference.kind == NodeKind::Layer && r.reference.index > index {
                    r.reference.index -= 1;
                }
            }
        }
        for l in &mut self.layers {
            l.width = None;
        }
        for p in &mut self.producers {
            if p.ratio.is_some() {
                p.width = None;
            }
        }
        self.propagate_ratios();
        Ok(())
    }

    pub fn has_backward_arrow(&self) -> bool {
        self.cycle.iter().any(|l| l.arrows.iter().any(|a| a.backward))
    }
}

fn encode_opt_usize(v: Option<usize>) -> [u8; 9] {
    let mut out = [0u8; 9];
    match v {
        Some(n) => {
            out[0] = 1;
            out[1..9].copy_from_slice(&(n as u64).to_le_bytes());
        }
        None => out[0] = 0,
    }
    out
}

fn encode_opt_ratio(r: &Option<RatioRef>) -> Vec<u8> {
    match r {
        None => vec![0],
        Some(r) => {
            let mut out = vec![1];
            out.extend_from_slice(&r.lhs.to_le_bytes());
            out.extend_from_slice(&r.rhs.to_le_bytes());
            out.extend_from_slice(&encode_node_id(r.reference));
            out
        }
    }
}

fn encode_node_id(id: NodeId) -> [u8; 9] {
    let mut out = [0u8; 9];
    out[0] = match id.kind {
        NodeKind::Producer => 0,
        NodeKind::Consumer => 1,
        NodeKind::Layer => 2,
    };
    out[1..9].copy_from_slice(&(id.index as u64).to_le_bytes());
    out
}
