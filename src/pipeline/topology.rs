//! Static stage graph
//!
//! Stages are nodes of a DAG. Each edge names the destination node of the
//! upstream stage whose buffer is handed to a source node of the downstream
//! stage, and the client output that makes the edge live for a frame.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::frame::{FrameType, OutputSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Processed by a hardware pipe thread
    Hardware,
    /// Hardware stage fusing two camera streams
    Merge,
    /// Software join point where paired camera frames meet
    Sync,
    /// Handed to an external consumer
    Sink,
}

impl StageKind {
    pub fn runs_on_pipe(&self) -> bool {
        matches!(self, Self::Hardware | Self::Merge)
    }
}

/// Which client output keeps an edge live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Always,
    Preview,
    Capture,
    Recording,
    Callback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub to: StageId,
    #[serde(default = "default_route")]
    pub route: Route,
    /// Destination node of the upstream stage
    #[serde(default)]
    pub from_node: usize,
    /// Source node of the downstream stage
    #[serde(default)]
    pub to_node: usize,
}

fn default_route() -> Route {
    Route::Always
}

impl Edge {
    pub fn new(to: StageId, route: Route, from_node: usize, to_node: usize) -> Self {
        Self {
            to,
            route,
            from_node,
            to_node,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub id: StageId,
    pub name: String,
    pub kind: StageKind,
    /// Output nodes the stage writes
    #[serde(default = "default_dst_nodes")]
    pub dst_nodes: usize,
    /// Frames reaching this stage move to the post-process registry
    #[serde(default)]
    pub post_process: bool,
    #[serde(default)]
    pub downstream: Vec<Edge>,
}

fn default_dst_nodes() -> usize {
    1
}

impl StageDescriptor {
    pub fn new(id: u32, name: &str, kind: StageKind) -> Self {
        Self {
            id: StageId(id),
            name: name.to_string(),
            kind,
            dst_nodes: if kind == StageKind::Sink { 0 } else { 1 },
            post_process: false,
            downstream: Vec::new(),
        }
    }

    pub fn with_dst_nodes(mut self, count: usize) -> Self {
        self.dst_nodes = count;
        self
    }

    pub fn with_post_process(mut self) -> Self {
        self.post_process = true;
        self
    }

    pub fn edge(mut self, to: u32, route: Route, from_node: usize, to_node: usize) -> Self {
        self.downstream.push(Edge::new(StageId(to), route, from_node, to_node));
        self
    }
}

/// Serialized form of a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub entry: StageId,
    #[serde(default)]
    pub reprocess_entry: Option<StageId>,
    pub stages: Vec<StageDescriptor>,
}

impl Default for TopologyConfig {
    /// A single-camera graph: sensor, ISP and scaler feeding preview,
    /// recording, and a JPEG encoder for captures
    fn default() -> Self {
        Self {
            entry: StageId(0),
            reprocess_entry: Some(StageId(4)),
            stages: vec![
                StageDescriptor::new(0, "sensor", StageKind::Hardware).edge(1, Route::Always, 0, 0),
                StageDescriptor::new(1, "isp", StageKind::Hardware).edge(2, Route::Always, 0, 0),
                StageDescriptor::new(2, "mcsc", StageKind::Hardware)
                    .with_dst_nodes(3)
                    .edge(10, Route::Preview, 0, 0)
                    .edge(3, Route::Capture, 1, 0)
                    .edge(11, Route::Recording, 2, 0),
                StageDescriptor::new(3, "jpeg", StageKind::Hardware)
                    .with_post_process()
                    .edge(12, Route::Capture, 0, 0),
                StageDescriptor::new(4, "reprocess", StageKind::Hardware).edge(3, Route::Capture, 0, 0),
                StageDescriptor::new(10, "preview", StageKind::Sink),
                StageDescriptor::new(11, "recording", StageKind::Sink),
                StageDescriptor::new(12, "capture", StageKind::Sink),
            ],
        }
    }
}

/// A validated, acyclic stage graph
#[derive(Debug, Clone)]
pub struct Topology {
    stages: BTreeMap<StageId, StageDescriptor>,
    entry: StageId,
    reprocess_entry: Option<StageId>,
}

impl Topology {
    pub fn new(
        stages: Vec<StageDescriptor>,
        entry: StageId,
        reprocess_entry: Option<StageId>,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for stage in stages {
            let id = stage.id;
            if map.insert(id, stage).is_some() {
                return Err(PipelineError::invalid_config(format!("duplicate stage {}", id)));
            }
        }
        let topology = Self {
            stages: map,
            entry,
            reprocess_entry,
        };
        topology.validate()?;
        debug!(
            stages = topology.stages.len(),
            entry = %entry,
            "topology built"
        );
        Ok(topology)
    }

    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        Self::new(config.stages.clone(), config.entry, config.reprocess_entry)
    }

    fn validate(&self) -> Result<()> {
        for entry in std::iter::once(self.entry).chain(self.reprocess_entry) {
            if !self.stages.contains_key(&entry) {
                return Err(PipelineError::invalid_config(format!("entry stage {} missing", entry)));
            }
        }

        for stage in self.stages.values() {
            if stage.kind == StageKind::Sink && !stage.downstream.is_empty() {
                return Err(PipelineError::invalid_config(format!(
                    "sink {} has downstream edges",
                    stage.name
                )));
            }
            let mut used_nodes = BTreeSet::new();
            for edge in &stage.downstream {
                if edge.to == stage.id || !self.stages.contains_key(&edge.to) {
                    return Err(PipelineError::invalid_config(format!(
                        "stage {} has a bad edge to {}",
                        stage.name, edge.to
                    )));
                }
                if edge.from_node >= stage.dst_nodes {
                    return Err(PipelineError::invalid_config(format!(
                        "stage {} edge uses dst node {} of {}",
                        stage.name, edge.from_node, stage.dst_nodes
                    )));
                }
                // A buffer can only be handed to one consumer
                if !used_nodes.insert(edge.from_node) {
                    return Err(PipelineError::invalid_config(format!(
                        "stage {} hands dst node {} to two stages",
                        stage.name, edge.from_node
                    )));
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Stages in dependency order; fails on a cycle
    pub fn topological_order(&self) -> Result<Vec<StageId>> {
        let mut indegree: BTreeMap<StageId, usize> = self.stages.keys().map(|id| (*id, 0)).collect();
        for stage in self.stages.values() {
            for edge in &stage.downstream {
                *indegree.entry(edge.to).or_default() += 1;
            }
        }

        let mut ready: VecDeque<StageId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for edge in &self.stages[&id].downstream {
                let d = indegree.entry(edge.to).or_default();
                *d -= 1;
                if *d == 0 {
                    ready.push_back(edge.to);
                }
            }
        }

        if order.len() != self.stages.len() {
            return Err(PipelineError::invalid_config("stage graph has a cycle"));
        }
        Ok(order)
    }

    pub fn stage(&self, id: StageId) -> Result<&StageDescriptor> {
        self.stages.get(&id).ok_or(PipelineError::StageNotFound(id))
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.values()
    }

    /// Stages a hardware pipe must serve
    pub fn pipe_stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.stages
            .values()
            .filter(|s| s.kind.runs_on_pipe())
            .map(|s| s.id)
    }

    pub fn sinks(&self) -> impl Iterator<Item = StageId> + '_ {
        self.stages
            .values()
            .filter(|s| s.kind == StageKind::Sink)
            .map(|s| s.id)
    }

    pub fn entry(&self) -> StageId {
        self.entry
    }

    pub fn entry_for(&self, frame_type: FrameType) -> Result<StageId> {
        match frame_type {
            FrameType::Reprocessing => self
                .reprocess_entry
                .ok_or_else(|| PipelineError::invalid_config("no reprocessing entry stage")),
            FrameType::Normal | FrameType::Internal => Ok(self.entry),
        }
    }

    /// Edges of `stage` a frame with `outputs` travels along
    pub fn routed_edges(&self, stage: StageId, outputs: &OutputSet) -> Result<Vec<&Edge>> {
        Ok(self
            .stage(stage)?
            .downstream
            .iter()
            .filter(|e| outputs.wants(e.route))
            .collect())
    }

    /// Stages a frame will visit, in dependency order
    pub fn path_for(&self, frame_type: FrameType, outputs: &OutputSet) -> Result<Vec<StageId>> {
        let entry = self.entry_for(frame_type)?;
        let mut reached = BTreeSet::from([entry]);
        let mut queue = VecDeque::from([entry]);
        while let Some(id) = queue.pop_front() {
            for edge in self.routed_edges(id, outputs)? {
                if reached.insert(edge.to) {
                    queue.push_back(edge.to);
                }
            }
        }
        Ok(self
            .topological_order()?
            .into_iter()
            .filter(|id| reached.contains(id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topology_is_valid() {
        let topology = Topology::from_config(&TopologyConfig::default()).unwrap();
        assert_eq!(topology.pipe_stages().count(), 5);
        assert_eq!(topology.sinks().count(), 3);
    }

    #[test]
    fn test_path_follows_requested_outputs() {
        let topology = Topology::from_config(&TopologyConfig::default()).unwrap();

        let preview = topology.path_for(FrameType::Normal, &OutputSet::preview()).unwrap();
        assert_eq!(preview, vec![StageId(0), StageId(1), StageId(2), StageId(10)]);

        let both = topology
            .path_for(FrameType::Normal, &OutputSet::preview_and_capture())
            .unwrap();
        assert!(both.contains(&StageId(3)));
        assert!(both.contains(&StageId(12)));
        assert!(!both.contains(&StageId(11)));

        let reprocess = topology
            .path_for(FrameType::Reprocessing, &OutputSet::preview_and_capture())
            .unwrap();
        assert_eq!(reprocess, vec![StageId(4), StageId(3), StageId(12)]);
    }

    #[test]
    fn test_rejects_cycle() {
        let stages = vec![
            StageDescriptor::new(0, "a", StageKind::Hardware).edge(1, Route::Always, 0, 0),
            StageDescriptor::new(1, "b", StageKind::Hardware).edge(0, Route::Always, 0, 0),
        ];
        let err = Topology::new(stages, StageId(0), None).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_shared_dst_node() {
        let stages = vec![
            StageDescriptor::new(0, "a", StageKind::Hardware)
                .edge(1, Route::Preview, 0, 0)
                .edge(2, Route::Capture, 0, 0),
            StageDescriptor::new(1, "b", StageKind::Sink),
            StageDescriptor::new(2, "c", StageKind::Sink),
        ];
        assert!(Topology::new(stages, StageId(0), None).is_err());
    }

    #[test]
    fn test_rejects_dangling_edge() {
        let stages = vec![StageDescriptor::new(0, "a", StageKind::Hardware).edge(9, Route::Always, 0, 0)];
        assert!(Topology::new(stages, StageId(0), None).is_err());
    }
}
