//! Per-session task graphs.
//!
//! A [`Pipeline`] is built from an [`AcquisitionDescription`] by
//! [`make_pipeline`]. Each acquired modality contributes a fixed set of
//! [`TaskNode`]s, and the dependency edges between them are wired by hand per
//! modality. The graph only declares the work; executing it is up to a
//! [`TaskExecutor`].
//!
//! ## Sync
//!
//! Almost every step that touches timestamps depends on the session's sync
//! task. When the description names a sync source for which no sync task
//! exists (`bpod`, or anything unrecognized) the steps that need it cannot be
//! wired and assembly fails with [`PipelineError::MissingParent`].

mod description;
mod runner;
mod task;

use std::collections::HashMap;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::error::PipelineError;

pub use crate::pipeline::description::{AcquisitionDescription, Stream, Streams};
pub use crate::pipeline::runner::{RunReport, TaskExecutor, TaskStatus};
pub use crate::pipeline::task::{Resources, TaskKind, TaskNode};

/// An ordered collection of named tasks with explicit dependency edges.
///
/// Tasks are kept in insertion order, which is a valid execution order for any
/// pipeline assembled by [`make_pipeline`]. Edges run from parent to child.
#[derive(Debug, Clone)]
pub struct Pipeline {
    session_path: Utf8PathBuf,
    graph: Graph<TaskNode, ()>,
    names: HashMap<String, NodeIndex>,
}

impl Pipeline {
    pub fn new(session_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            session_path: session_path.into(),
            graph: Graph::new(),
            names: HashMap::new(),
        }
    }

    /// Rebuild a pipeline from a flat task list.
    ///
    /// Parents may appear after their children in the list; all nodes are
    /// inserted before any edge is resolved.
    pub fn from_nodes(
        session_path: impl Into<Utf8PathBuf>,
        nodes: impl IntoIterator<Item = TaskNode>,
    ) -> Result<Self, PipelineError> {
        let mut pipeline = Self::new(session_path);

        for node in nodes {
            if pipeline.names.contains_key(&node.name) {
                return Err(PipelineError::DuplicateTask(node.name));
            }
            let name = node.name.clone();
            let index = pipeline.graph.add_node(node);
            pipeline.names.insert(name, index);
        }

        let mut edges = Vec::new();
        for index in pipeline.graph.node_indices() {
            let node = &pipeline.graph[index];
            for parent in &node.parents {
                let &source = pipeline.names.get(parent).ok_or_else(|| {
                    PipelineError::MissingParent {
                        task: node.name.clone(),
                        parent: parent.clone(),
                    }
                })?;
                edges.push((source, index));
            }
        }

        for (source, target) in edges {
            pipeline.graph.add_edge(source, target, ());
        }

        Ok(pipeline)
    }

    pub fn from_json(
        session_path: impl Into<Utf8PathBuf>,
        text: &str,
    ) -> Result<Self, PipelineError> {
        let nodes: Vec<TaskNode> = serde_json::from_str(text)?;
        Self::from_nodes(session_path, nodes)
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        let nodes: Vec<&TaskNode> = self.iter().collect();
        Ok(serde_json::to_string_pretty(&nodes)?)
    }

    /// Insert a task after resolving its parents by name.
    ///
    /// Fails if a parent is unknown or the name is already taken. On failure
    /// the pipeline is left unchanged.
    pub fn add(
        &mut self,
        mut node: TaskNode,
        parents: &[&str],
    ) -> Result<NodeIndex, PipelineError> {
        if self.names.contains_key(&node.name) {
            return Err(PipelineError::DuplicateTask(node.name));
        }

        let sources = parents
            .iter()
            .map(|&parent| {
                self.names
                    .get(parent)
                    .copied()
                    .ok_or_else(|| PipelineError::MissingParent {
                        task: node.name.clone(),
                        parent: parent.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        node.parents = parents.iter().map(|p| p.to_string()).collect();
        let name = node.name.clone();
        let index = self.graph.add_node(node);
        self.names.insert(name, index);

        for source in sources {
            self.graph.add_edge(source, index, ());
        }

        Ok(index)
    }

    pub fn session_path(&self) -> &Utf8Path {
        &self.session_path
    }

    pub fn get(&self, name: &str) -> Option<&TaskNode> {
        self.names.get(name).map(|&index| &self.graph[index])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Tasks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_indices().map(|index| &self.graph[index])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.iter().map(|node| node.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn parents(&self, name: &str) -> Option<&[String]> {
        self.get(name).map(|node| node.parents.as_slice())
    }

    pub fn children(&self, name: &str) -> Vec<&TaskNode> {
        let Some(&index) = self.names.get(name) else {
            return Vec::new();
        };

        let mut children: Vec<_> = self
            .graph
            .neighbors_directed(index, petgraph::Direction::Outgoing)
            .collect();
        children.sort();
        children.into_iter().map(|i| &self.graph[i]).collect()
    }

    /// Tasks sorted so that every parent precedes its children.
    pub fn execution_order(&self) -> Result<Vec<&TaskNode>, PipelineError> {
        let order = petgraph::algo::toposort(&self.graph, None)
            .map_err(|cycle| PipelineError::Cycle(self.graph[cycle.node_id()].name.clone()))?;

        Ok(order.into_iter().map(|index| &self.graph[index]).collect())
    }

    /// Depth of every task: 0 for roots, otherwise one more than the deepest parent.
    pub fn levels(&self) -> Result<HashMap<&str, usize>, PipelineError> {
        let mut levels: HashMap<&str, usize> = HashMap::new();

        for node in self.execution_order()? {
            let level = node
                .parents
                .iter()
                .filter_map(|parent| levels.get(parent.as_str()))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0);
            levels.insert(node.name.as_str(), level);
        }

        Ok(levels)
    }
}

impl fmt::Display for Pipeline {
    /// Renders the graph as a Mermaid flowchart.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{} ({})\"]", index.index(), name, task.kind)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Build the task graph for one session.
pub fn make_pipeline(
    description: &AcquisitionDescription,
    session_path: impl AsRef<Utf8Path>,
) -> Result<Pipeline, PipelineError> {
    let session_path = session_path.as_ref();
    if session_path.as_str().is_empty() {
        return Err(PipelineError::InvalidDescription(
            "a session path is required".into(),
        ));
    }

    let mut pipeline = Pipeline::new(session_path);
    let node = |name: &str, kind: TaskKind| TaskNode::new(name, kind, session_path);

    // Syncing tasks
    let (sync, sync_stream) = single_stream(description.sync.as_ref(), "sync")?;
    let sync_task = format!("SyncPulses_{sync}");
    let sync_collection = sync_stream.collection.as_str();

    match sync {
        "nidq" if sync_collection == "raw_ephys_data" => {
            pipeline.add(
                node(&sync_task, TaskKind::EphysPulses).arg("sync_collection", sync_collection),
                &[],
            )?;
        }
        "nidq" => {
            // renames the raw files, so it has to run first
            let compress = format!("SyncCompress_{sync}");
            pipeline.add(
                node(&compress, TaskKind::SyncCompress).arg("sync_collection", sync_collection),
                &[],
            )?;
            pipeline.add(
                node(&sync_task, TaskKind::SyncPulses).arg("sync_collection", sync_collection),
                &[compress.as_str()],
            )?;
        }
        "bpod" => {}
        other => {
            tracing::warn!("no sync task for sync source '{}'", other);
        }
    }

    // Behaviour tasks
    for (protocol, stream) in description.tasks.iter().flat_map(Streams::iter) {
        let register = format!("RegisterRaw_{protocol}");
        let trials = format!("Trials_{protocol}");
        let with_args = |task: TaskNode| {
            task.arg("protocol", protocol)
                .arg("protocol_collection", stream.collection.as_str())
        };

        if protocol.contains("passive") {
            pipeline.add(with_args(node(&register, TaskKind::PassiveRegisterRaw)), &[])?;
            pipeline.add(
                with_args(node(&trials, TaskKind::PassiveTrials)),
                &[sync_task.as_str()],
            )?;
        } else {
            pipeline.add(with_args(node(&register, TaskKind::TrialRegisterRaw)), &[])?;
            match sync {
                "bpod" => {
                    pipeline.add(with_args(node(&trials, TaskKind::TrainingTrialsBpod)), &[])?;
                }
                "nidq" => {
                    pipeline.add(
                        with_args(node(&trials, TaskKind::TrainingTrialsFpga)),
                        &[sync_task.as_str()],
                    )?;
                }
                _ => {}
            }

            let status = format!("TrainingStatus_{protocol}");
            pipeline.add(node(&status, TaskKind::TrainingStatus), &[trials.as_str()])?;
        }
    }

    // Ephys tasks
    for (pname, _) in description.neuropixel.iter().flat_map(Streams::iter) {
        let compression = format!("Compression_{pname}");
        let sorting = format!("SpikeSorting_{pname}");
        let qc = format!("CellsQC_{pname}");

        pipeline.add(node(&compression, TaskKind::EphysCompress).arg("pname", pname), &[])?;
        pipeline.add(
            node(&sorting, TaskKind::SpikeSorting).arg("pname", pname),
            &[compression.as_str(), sync_task.as_str()],
        )?;
        pipeline.add(node(&qc, TaskKind::EphysCellsQc).arg("pname", pname), &[sorting.as_str()])?;
    }

    // Video tasks
    if description.cameras.is_some() {
        pipeline.add(node("VideoCompress", TaskKind::VideoCompress), &[])?;
        pipeline.add(
            node("VideoSync", TaskKind::VideoSyncQc),
            &["VideoCompress", sync_task.as_str()],
        )?;
        pipeline.add(node("DLC", TaskKind::Dlc), &["VideoCompress"])?;
        pipeline.add(node("PostDLC", TaskKind::PostDlc), &["DLC", "VideoSync"])?;
    }

    // Audio tasks
    if description.microphone.is_some() {
        let (microphone, _) = single_stream(description.microphone.as_ref(), "microphone")?;
        let kind = match microphone {
            "xonar" => TaskKind::TrainingAudio,
            _ => TaskKind::EphysAudio,
        };
        pipeline.add(node("Audio", kind), &[])?;
    }

    // Widefield tasks
    // TODO: wire register/compress/preprocess/FOV once the widefield task order is settled upstream
    if description.widefield.is_some() {
        pipeline.add(node("WidefieldRegisterRaw", TaskKind::WidefieldRegisterRaw), &[])?;
        pipeline.add(node("WidefieldCompress", TaskKind::WidefieldCompress), &[])?;
        pipeline.add(node("WidefieldPreprocess", TaskKind::WidefieldPreprocess), &[])?;
        pipeline.add(node("WidefieldSync", TaskKind::WidefieldSync), &[sync_task.as_str()])?;
        pipeline.add(node("WidefieldFOV", TaskKind::WidefieldFov), &[])?;
    }

    tracing::debug!(
        "assembled {} tasks for {}",
        pipeline.len(),
        pipeline.session_path()
    );

    Ok(pipeline)
}

fn single_stream<'a>(
    streams: Option<&'a Streams>,
    modality: &str,
) -> Result<(&'a str, &'a Stream), PipelineError> {
    let streams = streams.ok_or_else(|| {
        PipelineError::InvalidDescription(format!("the '{modality}' modality is required"))
    })?;

    let mut iter = streams.iter();
    match (iter.next(), iter.next()) {
        (Some(single), None) => Ok(single),
        _ => Err(PipelineError::InvalidDescription(format!(
            "the '{modality}' modality must declare exactly one stream, found {}",
            streams.len()
        ))),
    }
}
