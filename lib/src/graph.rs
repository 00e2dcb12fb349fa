use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;

use crate::error::{ErrorDetail, Result};
use crate::pipeline::{Pipeline, PipelineResult};
use crate::transform::TransformError;
use crate::util::overlaps;

/// How a node runs its own pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Parallel,
    /// In declared order, stopping at the first failure.
    Sequential,
}

/// What happens to the rest of a task once one node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// Keep running everything that does not depend on the failure.
    #[default]
    Continue,
    /// Skip every node not yet started.
    FailFast,
}

/// A named task: pipelines to run and the tasks that must finish first.
#[derive(Debug, Clone)]
pub struct Node {
    name: Arc<str>,
    pipelines: Vec<Arc<str>>,
    mode: Mode,
    depends_on: Vec<Arc<str>>,
}

impl Node {
    pub fn new<N: Into<Arc<str>>>(name: N) -> Self {
        Node { name: name.into(), pipelines: vec![], mode: Mode::default(), depends_on: vec![] }
    }

    pub fn pipelines<I, S>(mut self, names: I) -> Self
        where I: IntoIterator<Item = S>, S: Into<Arc<str>>
    {
        self.pipelines.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
        where I: IntoIterator<Item = S>, S: Into<Arc<str>>
    {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline_names(&self) -> &[Arc<str>] {
        &self.pipelines
    }

    pub fn dependencies(&self) -> &[Arc<str>] {
        &self.depends_on
    }

    pub fn run_mode(&self) -> Mode {
        self.mode
    }
}

/// The dependency relation between nodes is not acyclic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphCycleError {
    /// The nodes on the cycle, first node repeated at the end.
    pub cycle: Vec<Arc<str>>,
}

impl fmt::Display for GraphCycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task dependency cycle: {}", self.cycle.join(" -> "))
    }
}

impl std::error::Error for GraphCycleError {}

impl ErrorDetail for GraphCycleError { }

/// A validated, acyclic set of tasks over a set of pipelines.
#[derive(Debug)]
pub struct TaskGraph {
    pipelines: FxHashMap<Arc<str>, Arc<Pipeline>>,
    nodes: FxHashMap<Arc<str>, Node>,
    order: Vec<Arc<str>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Active,
    Done,
}

impl TaskGraph {
    /// Validates and builds the graph. Fails on duplicate or unknown names,
    /// on a dependency cycle, and when a pipeline's output directory
    /// overlaps any pipeline's source directory.
    pub fn new<P, N>(pipelines: P, nodes: N) -> Result<Self>
        where P: IntoIterator<Item = Arc<Pipeline>>, N: IntoIterator<Item = Node>
    {
        let mut pipeline_map = FxHashMap::default();
        for pipeline in pipelines {
            let name: Arc<str> = pipeline.name().into();
            if pipeline_map.insert(name.clone(), pipeline).is_some() {
                return err!("duplicate pipeline name", "pipeline" => name);
            }
        }

        let mut node_map = FxHashMap::default();
        let mut order = vec![];
        for node in nodes {
            if let Some(unknown) = node.pipelines.iter().find(|p| !pipeline_map.contains_key(*p)) {
                return err!("task names an unknown pipeline",
                    "task" => node.name,
                    "pipeline" => unknown);
            }

            let name = node.name.clone();
            if node_map.insert(name.clone(), node).is_some() {
                return err!("duplicate task name", "task" => name);
            }

            order.push(name);
        }

        for name in &order {
            let node = &node_map[name];
            if let Some(unknown) = node.depends_on.iter().find(|d| !node_map.contains_key(*d)) {
                return err!("task depends on an unknown task",
                    "task" => name,
                    "dependency" => unknown);
            }
        }

        let graph = TaskGraph { pipelines: pipeline_map, nodes: node_map, order };
        graph.check_acyclic()?;
        graph.check_disjoint()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        fn visit<'a>(
            graph: &'a TaskGraph,
            name: &'a Arc<str>,
            state: &mut FxHashMap<&'a str, Visit>,
            stack: &mut Vec<&'a Arc<str>>,
        ) -> std::result::Result<(), GraphCycleError> {
            match state.get(&**name) {
                Some(Visit::Done) => return Ok(()),
                Some(Visit::Active) => {
                    let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                    let cycle = stack[start..].iter().chain(Some(&name)).map(|n| (*n).clone()).collect();
                    return Err(GraphCycleError { cycle });
                }
                None => {}
            }

            state.insert(&**name, Visit::Active);
            stack.push(name);
            for dep in &graph.nodes[name].depends_on {
                visit(graph, dep, state, stack)?;
            }

            stack.pop();
            state.insert(&**name, Visit::Done);
            Ok(())
        }

        let mut state = FxHashMap::default();
        for name in &self.order {
            visit(self, name, &mut state, &mut vec![])?;
        }

        Ok(())
    }

    fn check_disjoint(&self) -> Result<()> {
        for writer in self.pipelines.values() {
            for reader in self.pipelines.values() {
                for base in [reader.source().base(), reader.watch_pattern().base()] {
                    if overlaps(writer.output(), base) {
                        return err!("output directory overlaps a source directory",
                            "pipeline" => writer.name(),
                            "output" => writer.output().display(),
                            "read by" => reader.name(),
                            "source" => base.display());
                    }
                }
            }
        }

        Ok(())
    }

    pub fn pipeline(&self, name: &str) -> Option<&Arc<Pipeline>> {
        self.pipelines.get(name)
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Arc<Pipeline>> {
        self.pipelines.values()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().map(|name| &self.nodes[name])
    }

    /// The node `name` and everything it transitively depends on, grouped
    /// into levels: every node's dependencies are in earlier levels.
    fn levels(&self, name: &str) -> Vec<Vec<&Node>> {
        fn depth<'a>(graph: &'a TaskGraph, name: &str, memo: &mut FxHashMap<&'a str, usize>) -> usize {
            let node = &graph.nodes[name];
            if let Some(depth) = memo.get(&*node.name) {
                return *depth;
            }

            let depth = node.depends_on.iter()
                .map(|dep| depth(graph, dep, &mut *memo) + 1)
                .max()
                .unwrap_or(0);

            memo.insert(&*node.name, depth);
            depth
        }

        let mut memo = FxHashMap::default();
        depth(self, name, &mut memo);

        let max = memo.values().copied().max().unwrap_or(0);
        let mut levels = vec![vec![]; max + 1];
        for node in self.nodes().filter(|n| memo.contains_key(&*n.name)) {
            levels[memo[&*node.name]].push(node);
        }

        levels
    }

    /// Runs task `name` and everything it depends on. Fails only when no
    /// such task exists: pipeline failures are in the report.
    pub fn run(&self, name: &str, policy: Policy) -> Result<GraphReport> {
        if !self.nodes.contains_key(name) {
            let known = self.order.join(", ");
            return err!("unknown task", "task" => name, "known tasks" => known);
        }

        let start = Instant::now();
        let span = tracing::info_span!("task", task = name);
        let _span = span.enter();

        let mut reports: Vec<NodeReport> = vec![];
        for level in self.levels(name) {
            let halted = policy == Policy::FailFast && reports.iter().any(|r| !r.status.succeeded());
            let finished: FxHashSet<&str> = reports.iter()
                .filter(|r| r.status.succeeded())
                .map(|r| &*r.node)
                .collect();

            let level_reports: Vec<NodeReport> = level.par_iter()
                .map(|node| {
                    if halted {
                        return NodeReport::skipped(node, "an earlier task failed".into());
                    }

                    match node.depends_on.iter().find(|d| !finished.contains(&***d)) {
                        Some(dep) => NodeReport::skipped(node, format!("dependency `{dep}` failed")),
                        None => self.run_node(node),
                    }
                })
                .collect();

            reports.extend(level_reports);
        }

        let report = GraphReport { task: name.into(), nodes: reports, elapsed: start.elapsed() };
        match report.success() {
            true => tracing::info!(elapsed_ms = report.elapsed.as_millis() as u64, "task finished"),
            false => tracing::error!(elapsed_ms = report.elapsed.as_millis() as u64, "task failed"),
        }

        Ok(report)
    }

    fn run_node(&self, node: &Node) -> NodeReport {
        tracing::debug!(node = %node.name, mode = ?node.mode, "running task node");
        let pipelines = node.pipelines.iter().map(|name| &self.pipelines[name]);
        let results: Vec<PipelineResult> = match node.mode {
            Mode::Parallel => pipelines.collect::<Vec<_>>()
                .par_iter()
                .map(|pipeline| pipeline.run())
                .collect(),
            Mode::Sequential => {
                let mut results = vec![];
                for pipeline in pipelines {
                    let result = pipeline.run();
                    let failed = !result.success();
                    results.push(result);
                    if failed {
                        break;
                    }
                }

                results
            }
        };

        let status = match results.iter().all(|r| r.success()) {
            true => Status::Succeeded,
            false => Status::Failed,
        };

        NodeReport { node: node.name.clone(), status, results }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Succeeded,
    Failed,
    Skipped(String),
}

impl Status {
    pub fn succeeded(&self) -> bool {
        matches!(self, Status::Succeeded)
    }
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node: Arc<str>,
    pub status: Status,
    pub results: Vec<PipelineResult>,
}

impl NodeReport {
    fn skipped(node: &Node, reason: String) -> Self {
        NodeReport { node: node.name.clone(), status: Status::Skipped(reason), results: vec![] }
    }
}

/// Everything that happened during one [`TaskGraph::run()`].
#[derive(Debug, Clone)]
pub struct GraphReport {
    pub task: Arc<str>,
    /// In execution order, level by level.
    pub nodes: Vec<NodeReport>,
    pub elapsed: Duration,
}

impl GraphReport {
    pub fn success(&self) -> bool {
        self.nodes.iter().all(|n| n.status.succeeded())
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &*n.node == name)
    }

    pub fn errors(&self) -> impl Iterator<Item = &TransformError> {
        self.nodes.iter()
            .flat_map(|n| &n.results)
            .flat_map(|r| &r.errors)
    }
}

impl fmt::Display for GraphReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            match &node.status {
                Status::Succeeded => writeln!(f, "[ok] {}", node.node)?,
                Status::Failed => writeln!(f, "[failed] {}", node.node)?,
                Status::Skipped(reason) => writeln!(f, "[skipped] {}: {reason}", node.node)?,
            }

            for result in &node.results {
                write!(f, "    {}: {} written, {} changed", result.pipeline, result.written, result.changed.len())?;
                match (result.errors.len(), result.recovered) {
                    (0, _) => writeln!(f)?,
                    (n, true) => writeln!(f, ", {n} skipped")?,
                    (n, false) => writeln!(f, ", {n} failed")?,
                }

                for error in &result.errors {
                    writeln!(f, "        {error}")?;
                }
            }
        }

        let failed = self.nodes.iter().filter(|n| !n.status.succeeded()).count();
        let secs = self.elapsed.as_secs_f64();
        match failed {
            0 => write!(f, "task `{}` finished in {secs:.2}s", self.task),
            n => write!(f, "task `{}` failed: {n} of {} nodes did not succeed", self.task, self.nodes.len()),
        }
    }
}
