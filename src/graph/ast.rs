//! Declaration AST for a graph and the builder that resolves names to
//! `NodeId`s, checks for duplicates/unknown references, and runs the first
//! ratio-propagation pass.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Arrow, Consumer, FlowLine, Graph, Layer, NodeId, NodeKind, Producer, RatioRef};
use crate::error::{HarmonicsError, HarmonicsResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RatioDecl {
    pub lhs: i64,
    pub rhs: i64,
    pub reference: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProducerDecl {
    pub name: String,
    pub fixed_width: Option<usize>,
    pub ratio: Option<RatioDecl>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerDecl {
    pub name: String,
    pub fixed_width: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerDecl {
    pub name: String,
    pub ratio: Option<RatioDecl>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArrowDecl {
    pub target: String,
    pub backward: bool,
    pub func: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowLineDecl {
    pub source: String,
    pub arrows: Vec<ArrowDecl>,
}

/// The full textual/programmatic description of a graph, before name
/// resolution. Construct with the fluent `producer`/`consumer`/`layer`/`flow`
/// methods, then pass to [`build_graph`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphAst {
    pub producers: Vec<ProducerDecl>,
    pub consumers: Vec<ConsumerDecl>,
    pub layers: Vec<LayerDecl>,
    pub cycle: Vec<FlowLineDecl>,
}

impl GraphAst {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(mut self, name: impl Into<String>, fixed_width: Option<usize>) -> Self {
        self.producers.push(ProducerDecl { name: name.into(), fixed_width, ratio: None });
        self
    }

    pub fn producer_with_ratio(
        mut self,
        name: impl Into<String>,
        lhs: i64,
        rhs: i64,
        reference: impl Into<String>,
    ) -> Self {
        self.producers.push(ProducerDecl {
            name: name.into(),
            fixed_width: None,
            ratio: Some(RatioDecl { lhs, rhs, reference: reference.into() }),
        });
        self
    }

    pub fn consumer(mut self, name: impl Into<String>, fixed_width: Option<usize>) -> Self {
        self.consumers.push(ConsumerDecl { name: name.into(), fixed_width });
        self
    }

    pub fn layer(mut self, name: impl Into<String>) -> Self {
        self.layers.push(LayerDecl { name: name.into(), ratio: None });
        self
    }

    pub fn layer_with_ratio(
        mut self,
        name: impl Into<String>,
        lhs: i64,
        rhs: i64,
        reference: impl Into<String>,
    ) -> Self {
        self.layers.push(LayerDecl {
            name: name.into(),
            ratio: Some(RatioDecl { lhs, rhs, reference: reference.into() }),
        });
        self
    }

    pub fn flow(mut self, source: impl Into<String>, arrows: Vec<ArrowDecl>) -> Self {
        self.cycle.push(FlowLineDecl { source: source.into(), arrows });
        self
    }
}

pub fn arrow(target: impl Into<String>, backward: bool, func: Option<&str>) -> ArrowDecl {
    ArrowDecl { target: target.into(), backward, func: func.map(str::to_string) }
}

/// Resolves a [`GraphAst`] into a [`Graph`]: checks duplicate names, resolves
/// every name reference to a `NodeId`, and runs the first ratio-propagation
/// pass.
pub fn build_graph(ast: &GraphAst) -> HarmonicsResult<Graph> {
    let mut names: HashMap<String, NodeId> = HashMap::new();
    let mut insert = |names: &mut HashMap<String, NodeId>, name: &str, id: NodeId| -> HarmonicsResult<()> {
        if names.insert(name.to_string(), id).is_some() {
            return Err(HarmonicsError::DuplicateName(name.to_string()));
        }
        Ok(())
    };

    for (i, p) in ast.producers.iter().enumerate() {
        insert(&mut names, &p.name, NodeId::new(NodeKind::Producer, i))?;
    }
    for (i, c) in ast.consumers.iter().enumerate() {
        insert(&mut names, &c.name, NodeId::new(NodeKind::Consumer, i))?;
    }
    for (i, l) in ast.layers.iter().enumerate() {
        insert(&mut names, &l.name, NodeId::new(NodeKind::Layer, i))?;
    }

    let resolve = |name: &str| -> HarmonicsResult<NodeId> {
        names.get(name).copied().ok_or_else(|| HarmonicsError::UnknownNode(name.to_string()))
    };
    let resolve_ratio = |r: &Option<RatioDecl>| -> HarmonicsResult<Option<RatioRef>> {
        match r {
            None => Ok(None),
            Some(r) => {
                if r.rhs == 0 {
                    return Err(HarmonicsError::MalformedAst(format!(
                        "ratio denominator is zero for reference {}",
                        r.reference
                    )));
                }
                Ok(Some(RatioRef { lhs: r.lhs, rhs: r.rhs, reference: resolve(&r.reference)? }))
            }
        }
    };

    let mut producers = Vec::with_capacity(ast.producers.len());
    for p in &ast.producers {
        producers.push(Producer {
            name: p.name.clone(),
            fixed_width: p.fixed_width,
            ratio: resolve_ratio(&p.ratio)?,
            width: None,
        });
    }

    let consumers = ast
        .consumers
        .iter()
        .map(|c| Consumer { name: c.name.clone(), fixed_width: c.fixed_width })
        .collect();

    let mut layers = Vec::with_capacity(ast.layers.len());
    for l in &ast.layers {
        layers.push(Layer { name: l.name.clone(), ratio: resolve_ratio(&l.ratio)?, width: None });
    }

    let mut cycle = Vec::with_capacity(ast.cycle.len());
    for line in &ast.cycle {
        let source = resolve(&line.source)?;
        let mut arrows = Vec::with_capacity(line.arrows.len());
        for a in &line.arrows {
            arrows.push(Arrow { target: resolve(&a.target)?, backward: a.backward, func: a.func.clone() });
        }
        cycle.push(FlowLine { source, arrows });
    }

    let mut graph = Graph { producers, consumers, layers, cycle };
    graph.propagate_ratios();
    Ok(graph)
}
