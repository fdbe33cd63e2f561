//! The hierarchical action space.
//!
//! Arms are candidate filter patterns arranged in a DAG: a root sentinel for
//! the page, eSLD arms underneath it, and progressively finer arms
//! (FQDN, FQDN+path) hanging off the pattern they refine. Initiator edges
//! record "this pattern's traffic caused that one"; finer-grain edges record
//! refinement. Each arm carries its own learning state.
//!
//! The build order is load-bearing: eSLD views of every trace go in first,
//! orphans are re-attached to the root, then FQDN views are bucketed per
//! containing eSLD and inserted, then FQDN+path views bucketed per FQDN.
//! Once built, the graph is only ever mutated by the agent (Q values and
//! sleep flags) and a pristine copy is kept for `reset`.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ActionSpaceError, PersistError, SynthError};
use crate::grain::{Granularity, UrlVariants, is_real_fqdn};
use crate::graphml::{self, GraphmlDocument, GraphmlEdge, GraphmlNode};
use crate::trace::{ChainGraph, read_trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmEdge {
    Initiator,
    FinerGrain,
}

impl ArmEdge {
    fn as_str(self) -> &'static str {
        match self {
            ArmEdge::Initiator => "initiator",
            ArmEdge::FinerGrain => "finer_grain",
        }
    }
}

/// Learning state of one candidate pattern.
#[derive(Debug, Clone)]
pub struct ArmState {
    pub pattern: String,
    pub granularity: Granularity,
    pub is_root: bool,
    pub q: f64,
    pub attempts: u64,
    pub last_ucb: f64,
    pub sleeping: bool,
    pub unknown: bool,
    pub explored: bool,
    pub q_from_prior: bool,
    pub created: u64,
}

impl ArmState {
    fn new(pattern: &str, granularity: Granularity, created: u64, q0: f64) -> Self {
        Self {
            pattern: pattern.to_owned(),
            granularity,
            is_root: false,
            q: q0,
            attempts: 0,
            last_ucb: 0.0,
            sleeping: false,
            unknown: false,
            explored: false,
            q_from_prior: false,
            created,
        }
    }
}

#[derive(Debug, Serialize)]
struct ArmRecord<'a> {
    name: &'a str,
    granularity: &'a str,
    q_value: f64,
    attempts: u64,
    ucb: f64,
    sleeping: bool,
    unknown: bool,
    explored: bool,
    created: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ActionSpace {
    graph: DiGraph<ArmState, ArmEdge>,
    index: HashMap<String, NodeIndex>,
    root: Option<NodeIndex>,
    pristine: Option<Box<ActionSpaceCore>>,
    q0: f64,
}

/// The rebuildable part captured for `reset`.
#[derive(Debug, Clone, Default)]
struct ActionSpaceCore {
    graph: DiGraph<ArmState, ArmEdge>,
    index: HashMap<String, NodeIndex>,
    root: Option<NodeIndex>,
}

impl ActionSpace {
    pub fn new(q0: f64) -> Self {
        Self { q0, ..Self::default() }
    }

    /// Adds the root sentinel for the page. The root is never an arm: it
    /// does not sleep, is never unknown, and is never chosen.
    pub fn add_root(&mut self, url: &str) {
        let mut state = ArmState::new(url, Granularity::Esld, 0, self.q0);
        state.is_root = true;
        self.root = Some(self.graph.add_node(state));
    }

    pub fn root_index(&self) -> Result<NodeIndex, SynthError> {
        self.root.ok_or(SynthError::MissingActionSpace)
    }

    pub fn root_pattern(&self) -> Option<&str> {
        self.root.map(|r| self.graph[r].pattern.as_str())
    }

    fn root_esld(&self) -> Result<String, SynthError> {
        let url = self.root_pattern().ok_or(SynthError::MissingActionSpace)?;
        UrlVariants::of(url)
            .and_then(|v| v.esld)
            .ok_or_else(|| SynthError::RootMissing(url.to_owned()))
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.index.contains_key(pattern)
    }

    pub fn arm(&self, pattern: &str) -> Option<&ArmState> {
        self.index.get(pattern).map(|i| &self.graph[*i])
    }

    pub fn arm_mut(&mut self, pattern: &str) -> Option<&mut ArmState> {
        let index = *self.index.get(pattern)?;
        Some(&mut self.graph[index])
    }

    pub fn graph(&self) -> &DiGraph<ArmState, ArmEdge> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn explored_count(&self) -> usize {
        self.arms().filter(|a| a.explored).count()
    }

    /// All non-root arm states.
    pub fn arms(&self) -> impl Iterator<Item = &ArmState> {
        self.graph.node_weights().filter(|a| !a.is_root)
    }

    /// Patterns of every awake arm, optionally restricted to one
    /// granularity, in sorted order.
    pub fn awake_arms(&self, granularity: Option<Granularity>) -> Vec<String> {
        let mut awake: Vec<String> = self
            .arms()
            .filter(|a| !a.sleeping)
            .filter(|a| granularity.is_none_or(|g| a.granularity == g))
            .map(|a| a.pattern.clone())
            .collect();
        awake.sort();
        awake
    }

    pub fn awake_count(&self, granularity: Option<Granularity>) -> usize {
        self.awake_arms(granularity).len()
    }

    pub fn set_explored<S: AsRef<str>>(&mut self, patterns: &[S]) {
        for pattern in patterns {
            if let Some(arm) = self.arm_mut(pattern.as_ref()) {
                arm.explored = true;
            }
        }
    }

    /// Direct successors of `pattern`, optionally filtered by granularity.
    pub fn successors(&self, pattern: &str, granularity: Option<Granularity>) -> Vec<String> {
        let Some(&index) = self.index.get(pattern) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .filter(|&s| granularity.is_none_or(|g| self.graph[s].granularity == g))
            .map(|s| self.graph[s].pattern.clone())
            .collect()
    }

    /// Awake, non-unknown children of the root: the arms every run starts
    /// from.
    pub fn arms_to_initialize(&self) -> Result<Vec<String>, SynthError> {
        let root = self.root_index()?;
        let mut arms: Vec<String> = self
            .graph
            .neighbors_directed(root, Direction::Outgoing)
            .map(|s| &self.graph[s])
            .filter(|a| !a.sleeping && !a.unknown)
            .map(|a| a.pattern.clone())
            .collect();
        arms.sort();
        info!("found {} arms to initialize", arms.len());
        Ok(arms)
    }

    fn add_arm(&mut self, pattern: &str, granularity: Granularity, created: u64) -> NodeIndex {
        if let Some(&index) = self.index.get(pattern) {
            return index;
        }
        let index = self
            .graph
            .add_node(ArmState::new(pattern, granularity, created, self.q0));
        self.index.insert(pattern.to_owned(), index);
        index
    }

    fn add_edge_once(&mut self, a: NodeIndex, b: NodeIndex, kind: ArmEdge) {
        if a != b && self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, kind);
        }
    }

    /// Inserts the eSLD of `domain` directly under the root.
    fn add_child_to_root(&mut self, domain: &str, created: u64) {
        let Some(esld) = UrlVariants::of(domain).and_then(|v| v.esld) else {
            return;
        };
        if !self.contains(&esld) {
            let root = self.root.expect("root exists before building");
            let index = self.add_arm(&esld, Granularity::Esld, created);
            self.add_edge_once(root, index, ArmEdge::Initiator);
        }
    }

    fn should_consider(&self, level: Granularity, label: &str) -> bool {
        match level {
            Granularity::Esld => true,
            Granularity::Fqdn => {
                !self.contains(label)
                    && UrlVariants::of(label)
                        .and_then(|v| v.esld)
                        .is_some_and(|esld| is_real_fqdn(label, &esld))
            }
            Granularity::FqdnPath => {
                !self.contains(label)
                    && UrlVariants::of(label).is_some_and(|v| v.path.is_some())
            }
            Granularity::Path => true,
        }
    }

    /// Transfers a projected initiator graph into the action space at one
    /// granularity. Edges that would close a cycle are rejected silently:
    /// the reverse path already represents the relationship. Returns the
    /// labels that should attach directly under the root.
    fn transfer_chain(
        &mut self,
        level: Granularity,
        chain: &ChainGraph,
        created: u64,
    ) -> Vec<String> {
        let root_label = chain.root_label().to_owned();
        let mut root_children = Vec::new();

        for n in chain.graph.node_indices() {
            let label = chain.label(n).to_owned();
            if label == root_label {
                for p in chain.graph.neighbors_directed(n, Direction::Incoming) {
                    root_children.push(chain.label(p).to_owned());
                }
                continue;
            }
            if !self.should_consider(level, &label) {
                continue;
            }
            if !self.contains(&label) {
                self.add_arm(&label, level, created);
            }

            for p in chain.graph.neighbors_directed(n, Direction::Incoming) {
                let parent_label = chain.label(p).to_owned();
                if parent_label == root_label {
                    root_children.push(label.clone());
                    continue;
                }
                if !self.should_consider(level, &parent_label) {
                    continue;
                }
                if !self.contains(&parent_label) {
                    self.add_arm(&parent_label, level, created);
                }

                let parent = self.index[&parent_label];
                let child = self.index[&label];
                if self.graph.find_edge(parent, child).is_none() {
                    if has_path_connecting(&self.graph, child, parent, None) {
                        debug!("skipping edge {parent_label} -> {label}: reverse path exists");
                    } else {
                        self.graph.add_edge(parent, child, ArmEdge::Initiator);
                    }
                }
            }
        }

        root_children
    }

    fn add_esld_view(&mut self, chain: &ChainGraph, created: u64) -> Result<(), SynthError> {
        let root_esld = self.root_esld()?;
        let root = self.root_index()?;

        let mut children = self.transfer_chain(Granularity::Esld, chain, created);
        children.sort();
        children.dedup();
        for child in children {
            match self.index.get(&child).copied() {
                None => self.add_child_to_root(&child, created),
                Some(index) => self.add_edge_once(root, index, ArmEdge::Initiator),
            }
        }

        // the first party itself is always an arm under the root
        match self.index.get(&root_esld).copied() {
            None => self.add_child_to_root(&root_esld, created),
            Some(index) => self.add_edge_once(root, index, ArmEdge::Initiator),
        }
        Ok(())
    }

    /// Any eSLD arm left without a predecessor hangs off the root.
    fn attach_orphan_eslds(&mut self) -> Result<(), SynthError> {
        let root = self.root_index()?;
        let orphans: Vec<_> = self
            .graph
            .node_indices()
            .filter(|&n| {
                let arm = &self.graph[n];
                !arm.is_root
                    && arm.granularity == Granularity::Esld
                    && self.graph.neighbors_directed(n, Direction::Incoming).next().is_none()
            })
            .collect();
        for n in orphans {
            self.add_edge_once(root, n, ArmEdge::Initiator);
        }
        Ok(())
    }

    fn add_fqdn_view(&mut self, chain: &ChainGraph, created: u64) -> Result<(), SynthError> {
        self.transfer_chain(Granularity::Fqdn, chain, created);

        let orphans: Vec<_> = self
            .graph
            .node_indices()
            .filter(|&n| {
                let arm = &self.graph[n];
                arm.granularity == Granularity::Fqdn
                    && !arm.is_root
                    && self.graph.neighbors_directed(n, Direction::Incoming).next().is_none()
            })
            .collect();
        for n in orphans {
            let esld = UrlVariants::of(&self.graph[n].pattern).and_then(|v| v.esld);
            let parent = esld.as_deref().and_then(|e| self.index.get(e).copied());
            match parent {
                Some(parent) => self.add_edge_once(parent, n, ArmEdge::FinerGrain),
                None => {
                    return Err(ActionSpaceError::MissingEsld(
                        esld.unwrap_or_else(|| self.graph[n].pattern.clone()),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    fn add_fqdn_path_view(&mut self, chain: &ChainGraph, created: u64) -> Result<(), SynthError> {
        self.transfer_chain(Granularity::FqdnPath, chain, created);

        let orphans: Vec<_> = self
            .graph
            .node_indices()
            .filter(|&n| {
                let arm = &self.graph[n];
                arm.granularity == Granularity::FqdnPath
                    && !arm.is_root
                    && self.graph.neighbors_directed(n, Direction::Incoming).next().is_none()
            })
            .collect();
        for n in orphans {
            let variants = UrlVariants::of(&self.graph[n].pattern);
            let fqdn = variants.as_ref().and_then(|v| v.fqdn.clone());
            let esld = variants.as_ref().and_then(|v| v.esld.clone());
            let parent = fqdn
                .and_then(|f| self.index.get(&f).copied())
                .or_else(|| esld.and_then(|e| self.index.get(&e).copied()));
            if let Some(parent) = parent {
                self.add_edge_once(parent, n, ArmEdge::FinerGrain);
            }
        }
        Ok(())
    }

    /// Builds the action space from raw per-iteration initiator graphs.
    pub fn build_from_chains(
        &mut self,
        site_url: &str,
        raw_chains: &[ChainGraph],
        base_time: u64,
    ) -> Result<(), SynthError> {
        self.graph = DiGraph::new();
        self.index = HashMap::new();
        self.add_root(site_url);
        self.root_esld()?;

        let mut time = base_time;

        // layer 1: eSLD views carry the initiator structure
        let esld_views: Vec<_> = raw_chains.iter().map(|g| g.project(Granularity::Esld)).collect();
        for (offset, view) in esld_views.iter().enumerate() {
            self.add_esld_view(view, time + offset as u64 + 1)?;
        }
        self.attach_orphan_eslds()?;
        time += esld_views.len() as u64;

        // layer 2: FQDN views, bucketed per containing eSLD arm
        let fqdn_views: Vec<_> = raw_chains.iter().map(|g| g.project(Granularity::Fqdn)).collect();
        let esld_buckets: Vec<String> = self
            .arms()
            .filter(|a| a.granularity == Granularity::Esld)
            .map(|a| a.pattern.clone())
            .collect();
        for bucket in bucket_views(&fqdn_views, Granularity::Esld, &esld_buckets) {
            self.add_fqdn_view(&bucket, time + 1)?;
        }
        time += fqdn_views.len() as u64;

        // layer 3: FQDN+path views, bucketed per FQDN arm; childless eSLD
        // arms can adopt paths directly
        let path_views: Vec<_> =
            raw_chains.iter().map(|g| g.project(Granularity::FqdnPath)).collect();
        let fqdn_buckets: Vec<String> = self
            .graph
            .node_indices()
            .filter(|&n| {
                let arm = &self.graph[n];
                !arm.is_root
                    && (arm.granularity == Granularity::Fqdn
                        || (arm.granularity == Granularity::Esld
                            && self
                                .graph
                                .neighbors_directed(n, Direction::Outgoing)
                                .next()
                                .is_none()))
            })
            .map(|n| self.graph[n].pattern.clone())
            .collect();
        for bucket in bucket_views(&path_views, Granularity::Fqdn, &fqdn_buckets) {
            self.add_fqdn_path_view(&bucket, time + 1)?;
        }

        self.pristine = Some(Box::new(ActionSpaceCore {
            graph: self.graph.clone(),
            index: self.index.clone(),
            root: self.root,
        }));

        info!(
            "action space built: {} arms, {} edges",
            self.node_count().saturating_sub(1),
            self.edge_count()
        );
        Ok(())
    }

    /// Builds the action space from the per-iteration trace files.
    pub fn build(
        &mut self,
        site_url: &str,
        trace_files: &[Utf8PathBuf],
        base_time: u64,
    ) -> Result<(), SynthError> {
        let root_esld = UrlVariants::of(site_url)
            .and_then(|v| v.esld)
            .ok_or_else(|| SynthError::RootMissing(site_url.to_owned()))?;

        let mut files = trace_files.to_vec();
        files.sort();

        let mut chains = Vec::with_capacity(files.len());
        for file in &files {
            let events = read_trace(file)?;
            chains.push(ChainGraph::from_events(&events, &root_esld));
        }
        self.build_from_chains(site_url, &chains, base_time)
    }

    /// Restores the pristine post-build state and clears per-run learning.
    pub fn reset(&mut self) -> Result<(), SynthError> {
        let pristine = self.pristine.as_deref().ok_or(SynthError::MissingActionSpace)?;
        self.graph = pristine.graph.clone();
        self.index = pristine.index.clone();
        self.root = pristine.root;
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.pristine.is_some()
    }

    pub fn to_graphml(&self) -> GraphmlDocument {
        let mut doc = GraphmlDocument::default();
        for arm in self.graph.node_weights() {
            let mut node = GraphmlNode { id: arm.pattern.clone(), ..Default::default() };
            node.attrs.insert("name".into(), arm.pattern.clone());
            if arm.is_root {
                node.attrs.insert("root".into(), "true".into());
            } else {
                node.attrs.insert("granularity".into(), arm.granularity.as_str().into());
                node.attrs.insert("q_value".into(), format!("{}", arm.q));
                node.attrs.insert("attempts".into(), arm.attempts.to_string());
                node.attrs.insert("ucb".into(), format!("{}", arm.last_ucb));
                node.attrs.insert("sleeping".into(), arm.sleeping.to_string());
                node.attrs.insert("unknown".into(), arm.unknown.to_string());
                node.attrs.insert("explored".into(), arm.explored.to_string());
                node.attrs.insert("created".into(), arm.created.to_string());
            }
            doc.nodes.push(node);
        }
        for edge in self.graph.edge_references() {
            let mut record = GraphmlEdge {
                source: self.graph[edge.source()].pattern.clone(),
                target: self.graph[edge.target()].pattern.clone(),
                ..Default::default()
            };
            record.attrs.insert("edge_type".into(), edge.weight().as_str().into());
            doc.edges.push(record);
        }
        doc
    }

    /// Rebuilds an action space from its persisted GraphML form.
    pub fn from_graphml(doc: &GraphmlDocument, q0: f64) -> Result<ActionSpace, String> {
        let mut space = ActionSpace::new(q0);
        for node in &doc.nodes {
            if node.attrs.get("root").map(String::as_str) == Some("true") {
                space.add_root(&node.id);
                continue;
            }
            let granularity = node
                .attrs
                .get("granularity")
                .and_then(|g| Granularity::parse(g))
                .ok_or_else(|| format!("node `{}` has no granularity", node.id))?;
            let created = node
                .attrs
                .get("created")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let index = space.add_arm(&node.id, granularity, created);
            let arm = &mut space.graph[index];
            let flag = |key: &str| node.attrs.get(key).map(String::as_str) == Some("true");
            arm.q = node.attrs.get("q_value").and_then(|v| v.parse().ok()).unwrap_or(q0);
            arm.attempts = node.attrs.get("attempts").and_then(|v| v.parse().ok()).unwrap_or(0);
            arm.last_ucb = node.attrs.get("ucb").and_then(|v| v.parse().ok()).unwrap_or(0.0);
            arm.sleeping = flag("sleeping");
            arm.unknown = flag("unknown");
            arm.explored = flag("explored");
        }

        let root_pattern = space.root_pattern().map(str::to_owned);
        for edge in &doc.edges {
            let kind = match edge.attrs.get("edge_type").map(String::as_str) {
                Some("finer_grain") => ArmEdge::FinerGrain,
                _ => ArmEdge::Initiator,
            };
            let resolve = |label: &str| {
                if root_pattern.as_deref() == Some(label) {
                    space.root
                } else {
                    space.index.get(label).copied()
                }
            };
            let (Some(a), Some(b)) = (resolve(&edge.source), resolve(&edge.target)) else {
                return Err(format!("edge {} -> {} names unknown nodes", edge.source, edge.target));
            };
            space.graph.add_edge(a, b, kind);
        }

        space.pristine = Some(Box::new(ActionSpaceCore {
            graph: space.graph.clone(),
            index: space.index.clone(),
            root: space.root,
        }));
        Ok(space)
    }

    /// Writes `action_space.graphml` and `action_values.csv` to `dir`.
    pub fn save(&self, dir: &Utf8Path) -> Result<(), PersistError> {
        let graphml_path = dir.join("action_space.graphml");
        let content = graphml::write(&self.to_graphml())
            .map_err(|e| PersistError::Encode(graphml_path.clone(), e))?;
        std::fs::write(&graphml_path, content)
            .map_err(|e| PersistError::FileWrite(graphml_path.clone(), e))?;

        let csv_path = dir.join("action_values.csv");
        let mut writer = csv::Writer::from_path(&csv_path)
            .map_err(|e| PersistError::Encode(csv_path.clone(), e.to_string()))?;
        let mut arms: Vec<&ArmState> = self.arms().collect();
        arms.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        for arm in arms {
            writer
                .serialize(ArmRecord {
                    name: &arm.pattern,
                    granularity: arm.granularity.as_str(),
                    q_value: arm.q,
                    attempts: arm.attempts,
                    ucb: arm.last_ucb,
                    sleeping: arm.sleeping,
                    unknown: arm.unknown,
                    explored: arm.explored,
                    created: arm.created,
                })
                .map_err(|e| PersistError::Encode(csv_path.clone(), e.to_string()))?;
        }
        writer
            .flush()
            .map_err(|e| PersistError::FileWrite(csv_path.clone(), e))?;
        Ok(())
    }
}

/// Restricts each view to the nodes falling under each bucket label and
/// merges the per-iteration restrictions into one graph per bucket.
fn bucket_views(
    views: &[ChainGraph],
    bucket_level: Granularity,
    buckets: &[String],
) -> Vec<ChainGraph> {
    let mut merged: HashMap<&str, ChainGraph> = HashMap::new();
    for view in views {
        for bucket in buckets {
            let restricted = view.restrict_to_bucket(bucket_level, bucket);
            match merged.get_mut(bucket.as_str()) {
                None => {
                    merged.insert(bucket.as_str(), restricted);
                }
                Some(existing) => existing.merge_from(&restricted),
            }
        }
    }
    let mut out: Vec<_> = merged.into_iter().collect();
    out.sort_by(|a, b| a.0.cmp(b.0));
    out.into_iter().map(|(_, g)| g).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CallFrame, CallStack, ChainEdge, Initiator, InitiatorKind, RequestEvent, RequestInfo};

    fn event(url: &str, parent_frame: Option<&str>) -> RequestEvent {
        RequestEvent {
            request_id: None,
            timestamp: 0.0,
            document_url: Some("https://www.site.com/".to_owned()),
            request: RequestInfo { url: url.to_owned() },
            initiator: parent_frame.map(|frame| Initiator {
                kind: InitiatorKind::Script,
                url: None,
                stack: Some(CallStack {
                    call_frames: vec![CallFrame { url: frame.to_owned() }],
                    parent: None,
                }),
                request_id: None,
            }),
        }
    }

    fn sample_space() -> ActionSpace {
        let events = vec![
            event("https://a.adnet.com/serve.js", None),
            event("https://a.adnet.com/pixel.js", Some("https://a.adnet.com/serve.js")),
            event("https://cdn.widgets.com/w.js", Some("https://a.adnet.com/serve.js")),
            event("https://tracker.com/t.js", None),
        ];
        let chain = ChainGraph::from_events(&events, "site.com");
        let mut space = ActionSpace::new(0.2);
        space
            .build_from_chains("https://www.site.com", &[chain], 0)
            .unwrap();
        space
    }

    #[test]
    fn build_produces_reachable_acyclic_hierarchy() {
        let space = sample_space();
        let root = space.root_index().unwrap();

        assert!(!petgraph::algo::is_cyclic_directed(&space.graph));
        for n in space.graph.node_indices() {
            if n != root {
                assert!(
                    has_path_connecting(&space.graph, root, n, None),
                    "{} unreachable from root",
                    space.graph[n].pattern
                );
            }
        }

        // eSLD arms present, including the first party
        for esld in ["adnet.com", "widgets.com", "tracker.com", "site.com"] {
            assert!(space.contains(esld), "missing {esld}");
        }

        // FQDN arms hang under their containing eSLD
        let a = space.index["a.adnet.com"];
        let adnet = space.index["adnet.com"];
        assert!(has_path_connecting(&space.graph, adnet, a, None));

        // FQDN+path arms hang under their FQDN
        let serve = space.index["a.adnet.com/serve.js"];
        assert!(has_path_connecting(&space.graph, a, serve, None));
    }

    #[test]
    fn arms_to_initialize_are_root_children() {
        let space = sample_space();
        let arms = space.arms_to_initialize().unwrap();
        assert!(arms.contains(&"adnet.com".to_owned()));
        assert!(arms.contains(&"tracker.com".to_owned()));
        // finer arms are not part of the initial set
        assert!(!arms.iter().any(|a| a.contains('/')));
        // deterministic ordering
        let mut sorted = arms.clone();
        sorted.sort();
        assert_eq!(arms, sorted);
    }

    #[test]
    fn transfer_rejects_cycle_closing_edges() {
        let mut space = ActionSpace::new(0.2);
        space.add_root("https://site.com");

        let mut chain = ChainGraph::new("site.com");
        let a = chain.ensure("a.com", UrlVariants::of("a.com").unwrap());
        let b = chain.ensure("b.com", UrlVariants::of("b.com").unwrap());
        chain.add_edge_once(a, b, ChainEdge::Initiator);
        chain.add_edge_once(b, a, ChainEdge::Initiator);

        space.transfer_chain(Granularity::Esld, &chain, 1);

        let ai = space.index["a.com"];
        let bi = space.index["b.com"];
        let forward = space.graph.find_edge(ai, bi).is_some();
        let backward = space.graph.find_edge(bi, ai).is_some();
        assert!(forward ^ backward, "exactly one of the two edges survives");
    }

    #[test]
    fn reset_restores_pristine_state() {
        let mut space = sample_space();
        space.arm_mut("adnet.com").unwrap().q = -0.7;
        space.arm_mut("adnet.com").unwrap().sleeping = true;
        space.set_explored(&["adnet.com"]);

        space.reset().unwrap();

        let arm = space.arm("adnet.com").unwrap();
        assert_eq!(arm.q, 0.2);
        assert!(!arm.sleeping);
        assert!(!arm.explored);
    }

    #[test]
    fn graphml_round_trip_is_isomorphic() {
        let mut space = sample_space();
        space.arm_mut("adnet.com").unwrap().q = 0.85;
        space.arm_mut("adnet.com").unwrap().attempts = 7;
        space.arm_mut("tracker.com").unwrap().sleeping = true;
        space.set_explored(&["adnet.com", "tracker.com"]);

        let doc = space.to_graphml();
        let text = graphml::write(&doc).unwrap();
        let reparsed = graphml::parse(&text).unwrap();
        let reloaded = ActionSpace::from_graphml(&reparsed, 0.2).unwrap();

        assert_eq!(space.node_count(), reloaded.node_count());
        assert_eq!(space.edge_count(), reloaded.edge_count());
        for arm in space.arms() {
            let other = reloaded.arm(&arm.pattern).expect("arm survives round trip");
            assert_eq!(arm.granularity, other.granularity);
            assert_eq!(arm.q, other.q);
            assert_eq!(arm.attempts, other.attempts);
            assert_eq!(arm.sleeping, other.sleeping);
            assert_eq!(arm.unknown, other.unknown);
            assert_eq!(arm.explored, other.explored);
            assert_eq!(arm.created, other.created);
        }
        for edge in space.graph.edge_references() {
            let source = &space.graph[edge.source()].pattern;
            let target = &space.graph[edge.target()].pattern;
            let si = if reloaded.root_pattern() == Some(source.as_str()) {
                reloaded.root.unwrap()
            } else {
                reloaded.index[source.as_str()]
            };
            let ti = reloaded.index[target.as_str()];
            let found = reloaded.graph.find_edge(si, ti).expect("edge survives round trip");
            assert_eq!(*edge.weight(), reloaded.graph[found]);
        }
    }

    #[test]
    fn successors_filter_by_granularity() {
        let space = sample_space();
        let all = space.successors("adnet.com", None);
        assert!(all.contains(&"a.adnet.com".to_owned()));
        let paths = space.successors("a.adnet.com", Some(Granularity::FqdnPath));
        assert!(paths.iter().all(|p| p.contains('/')));
    }
}
