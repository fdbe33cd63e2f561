//! Request traces and initiator-chain graphs.
//!
//! A trace is the time-ordered sequence of network request events recorded
//! during one page load. Each event names its URL and an initiator record
//! explaining *why* the request happened (parser, script stack, or another
//! request). From a trace we build a directed graph of request → initiator
//! relations, then project it to a single URL granularity so the action
//! space can be assembled level by level.
//!
//! Projection is lossy on purpose: nodes matching the page's own domain are
//! cut out (re-wiring their neighbors), repeated domains along a path are
//! coarsened to their topmost occurrence, and ambiguous provenance collapses
//! to the root.

use std::collections::{HashMap, HashSet};

use camino::Utf8Path;
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{Dfs, EdgeRef, Reversed};
use serde::Deserialize;
use tracing::warn;

use crate::error::TraceError;
use crate::grain::{Granularity, UrlVariants, is_filtered_url, js_extension, strip_www};

/// One `Network.requestWillBeSent`-shaped event.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEvent {
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(rename = "documentURL", default)]
    pub document_url: Option<String>,
    pub request: RequestInfo,
    #[serde(default)]
    pub initiator: Option<Initiator>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestInfo {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Initiator {
    #[serde(rename = "type")]
    pub kind: InitiatorKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub stack: Option<CallStack>,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitiatorKind {
    Parser,
    Script,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallStack {
    #[serde(rename = "callFrames", default)]
    pub call_frames: Vec<CallFrame>,
    #[serde(default)]
    pub parent: Option<Box<CallStack>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallFrame {
    #[serde(default)]
    pub url: String,
}

/// Reads a trace file holding either a JSON array of events or one event per
/// line. Unparsable lines are skipped with a warning.
pub fn read_trace(path: &Utf8Path) -> Result<Vec<RequestEvent>, TraceError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| TraceError::FileRead(path.to_owned(), e))?;
    let trimmed = content.trim_start();

    let mut events: Vec<RequestEvent> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|_| TraceError::Shape(path.to_owned()))?
    } else {
        let mut acc = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => acc.push(event),
                Err(e) => warn!("skipping malformed trace line in {path}: {e}"),
            }
        }
        acc
    };

    events.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    Ok(events)
}

/// Kind of a relation between two chain nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEdge {
    /// The parent's execution context caused the child's request.
    Initiator,
    /// Synthetic edge introduced when an intermediate node was cut out.
    Virtual,
}

#[derive(Debug, Clone)]
pub struct ChainNode {
    pub label: String,
    pub variants: UrlVariants,
    pub is_root: bool,
}

/// Directed graph of request → initiator relations, rooted at a sentinel
/// representing the page itself. Also used for the per-granularity
/// projections, where node labels are variant strings rather than full URLs.
#[derive(Debug, Clone)]
pub struct ChainGraph {
    pub graph: StableDiGraph<ChainNode, ChainEdge>,
    pub root: NodeIndex,
    // kept separately: bucket restriction may cut the root node away
    root_label: String,
    index: HashMap<String, NodeIndex>,
}

impl ChainGraph {
    pub fn new(root_label: &str) -> Self {
        let mut graph = StableDiGraph::new();
        let root = graph.add_node(ChainNode {
            label: root_label.to_owned(),
            variants: UrlVariants::of(root_label).unwrap_or_default(),
            is_root: true,
        });
        let index = HashMap::from([(root_label.to_owned(), root)]);
        Self {
            graph,
            root,
            root_label: root_label.to_owned(),
            index,
        }
    }

    pub fn root_label(&self) -> &str {
        &self.root_label
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    pub fn node(&self, label: &str) -> Option<NodeIndex> {
        self.index.get(label).copied()
    }

    pub fn label(&self, index: NodeIndex) -> &str {
        &self.graph[index].label
    }

    /// Inserts a node for `label` unless it already exists.
    pub fn ensure(&mut self, label: &str, variants: UrlVariants) -> NodeIndex {
        if let Some(index) = self.index.get(label) {
            return *index;
        }
        let index = self.graph.add_node(ChainNode {
            label: label.to_owned(),
            variants,
            is_root: false,
        });
        self.index.insert(label.to_owned(), index);
        index
    }

    /// Adds an edge unless an equivalent one is already present.
    pub fn add_edge_once(&mut self, a: NodeIndex, b: NodeIndex, kind: ChainEdge) {
        if a != b && self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, kind);
        }
    }

    /// Builds the raw initiator-chain graph for one trace. `root_esld` is
    /// the page's registrable domain and becomes the root sentinel.
    pub fn from_events(events: &[RequestEvent], root_esld: &str) -> Self {
        let mut chain = ChainGraph::new(root_esld);

        let id_to_url: HashMap<&str, &str> = events
            .iter()
            .filter_map(|e| Some((e.request_id.as_deref()?, e.request.url.as_str())))
            .collect();

        for event in events {
            let url = event.request.url.as_str();
            if is_filtered_url(url) {
                continue;
            }
            let (is_js, has_ext) = js_extension(url);
            if has_ext && !is_js {
                continue;
            }
            let Some(variants) = UrlVariants::of(url) else {
                continue;
            };
            if variants.esld.is_none() {
                continue;
            }

            let child = chain.ensure(url, variants);

            match resolve_parent(event, &id_to_url) {
                Some(parent_url) => {
                    // A parent without a registrable domain contributes no
                    // edge; the orphan pass below re-attaches the child.
                    let parent_variants = UrlVariants::of(&parent_url);
                    if let Some(pv) = parent_variants.filter(|v| v.esld.is_some()) {
                        let parent = chain.ensure(&parent_url, pv);
                        chain.add_edge_once(parent, child, ChainEdge::Initiator);
                    }
                }
                None => {
                    let root = chain.root;
                    chain.add_edge_once(root, child, ChainEdge::Initiator);
                }
            }
        }

        chain.attach_orphans_to_root();
        chain
    }

    /// Every node without a predecessor receives a root edge.
    pub fn attach_orphans_to_root(&mut self) {
        let root = self.root;
        let orphans: Vec<_> = self
            .graph
            .node_indices()
            .filter(|&n| {
                n != root
                    && self
                        .graph
                        .neighbors_directed(n, Direction::Incoming)
                        .next()
                        .is_none()
            })
            .collect();
        for n in orphans {
            self.add_edge_once(root, n, ChainEdge::Initiator);
        }
    }

    /// Removes `v` while preserving every path that ran through it: each
    /// predecessor gains a virtual edge to each successor.
    pub fn remove_node_and_connect(&mut self, v: NodeIndex) {
        let sources: Vec<_> = self.graph.neighbors_directed(v, Direction::Incoming).collect();
        let targets: Vec<_> = self.graph.neighbors_directed(v, Direction::Outgoing).collect();

        for &s in &sources {
            for &t in &targets {
                if s != t {
                    self.add_edge_once(s, t, ChainEdge::Virtual);
                }
            }
        }

        let node = self.graph.remove_node(v);
        if let Some(node) = node {
            self.index.remove(&node.label);
        }
    }

    fn remove_node_plain(&mut self, v: NodeIndex) {
        if let Some(node) = self.graph.remove_node(v) {
            self.index.remove(&node.label);
        }
    }

    /// Projects the chain graph to one granularity:
    ///
    /// 1. cut out nodes matching the page root at that level,
    /// 2. iteratively drop leaves whose variant already occurs on an
    ///    ancestor (duplicates along a path coarsen upwards),
    /// 3. rebuild the graph with one node per variant string,
    /// 4. where a node has a root edge among several incoming edges, keep
    ///    only the root edge.
    pub fn project(&self, level: Granularity) -> ChainGraph {
        let root_label = self.root_label().to_owned();

        // (1) remove first-party nodes, preserving paths
        let mut simple = self.clone();
        let first_party: Vec<_> = simple
            .graph
            .node_indices()
            .filter(|&n| {
                let node = &simple.graph[n];
                !node.is_root && node.variants.at(level) == Some(root_label.as_str())
            })
            .collect();
        for n in first_party {
            simple.remove_node_and_connect(n);
        }

        // (2) peel duplicated leaves; `work` drives the iteration while
        // `dedup` accumulates the cleaned graph. Indices stay aligned
        // because both start as the same clone and StableGraph removals
        // never renumber.
        let mut work = simple.clone();
        let mut dedup = simple;
        loop {
            let leaves: Vec<_> = work
                .graph
                .node_indices()
                .filter(|&n| {
                    work.graph.neighbors_directed(n, Direction::Outgoing).next().is_none()
                        && work.graph.neighbors_directed(n, Direction::Incoming).next().is_some()
                })
                .collect();

            let mut duplicated = Vec::new();
            for &leaf in &leaves {
                let Some(value) = work.graph[leaf].variants.at(level) else {
                    continue;
                };
                let value = value.to_owned();
                let dup = ancestors(&work.graph, leaf).into_iter().any(|a| {
                    a != work.root
                        && a != leaf
                        && work.graph[a].variants.at(level) == Some(value.as_str())
                });
                if dup {
                    duplicated.push(leaf);
                }
            }

            if duplicated.is_empty() {
                break;
            }
            for leaf in duplicated {
                if dedup.graph.contains_node(leaf) {
                    dedup.remove_node_and_connect(leaf);
                }
            }
            for leaf in leaves {
                work.remove_node_plain(leaf);
            }
        }

        // (3) one node per variant string
        let mut projected = ChainGraph::new(&root_label);
        for n in dedup.graph.node_indices() {
            let node = &dedup.graph[n];
            if node.is_root {
                continue;
            }
            let Some(value) = node.variants.at(level) else {
                continue;
            };
            let value = value.to_owned();
            let value_variants = UrlVariants::of(&value).unwrap_or_default();
            let child = projected.ensure(&value, value_variants);

            for parent in dedup.graph.neighbors_directed(n, Direction::Incoming) {
                let parent_node = &dedup.graph[parent];
                // Parents without the projected variant collapse to root.
                let parent_value = if parent_node.is_root {
                    None
                } else {
                    parent_node.variants.at(level).map(str::to_owned)
                };
                let parent_index = match parent_value {
                    Some(pv) if pv != root_label => {
                        let pv_variants = UrlVariants::of(&pv).unwrap_or_default();
                        projected.ensure(&pv, pv_variants)
                    }
                    _ => projected.root,
                };
                projected.add_edge_once(parent_index, child, ChainEdge::Initiator);
            }
        }

        // (4) root dominates ambiguous provenance
        projected.prefer_root_provenance();
        projected
    }

    /// Where a node carries a root edge among several incoming edges, the
    /// non-root edges are dropped.
    fn prefer_root_provenance(&mut self) {
        let root = self.root;
        let mut drop = Vec::new();
        for n in self.graph.node_indices() {
            let incoming: Vec<_> = self
                .graph
                .edges_directed(n, Direction::Incoming)
                .map(|e| (e.id(), e.source()))
                .collect();
            if incoming.len() > 1 && incoming.iter().any(|(_, s)| *s == root) {
                drop.extend(incoming.into_iter().filter(|(_, s)| *s != root).map(|(e, _)| e));
            }
        }
        for e in drop {
            self.graph.remove_edge(e);
        }
    }

    /// Copy of this projection restricted to nodes whose variant at
    /// `bucket_level` matches `bucket_label` (compared with `www.`
    /// stripped); everything else is cut out with paths preserved.
    pub fn restrict_to_bucket(&self, bucket_level: Granularity, bucket_label: &str) -> ChainGraph {
        let wanted = strip_www(bucket_label);
        let mut restricted = self.clone();
        let outside: Vec<_> = restricted
            .graph
            .node_indices()
            .filter(|&n| {
                restricted.graph[n]
                    .variants
                    .at(bucket_level)
                    .map(strip_www)
                    != Some(wanted)
            })
            .collect();
        for n in outside {
            restricted.remove_node_and_connect(n);
        }
        restricted
    }

    /// Union of `other` into `self`, skipping edges that would introduce a
    /// cycle (an existing reverse path already represents the relation).
    pub fn merge_from(&mut self, other: &ChainGraph) {
        let root_label = self.root_label().to_owned();
        for n in other.graph.node_indices() {
            let node = &other.graph[n];
            if node.label == root_label {
                continue;
            }
            let child = self.ensure(&node.label, node.variants.clone());

            for parent in other.graph.neighbors_directed(n, Direction::Incoming) {
                let parent_node = &other.graph[parent];
                if parent_node.label == root_label {
                    continue;
                }
                let parent_index = self.ensure(&parent_node.label, parent_node.variants.clone());
                if self.graph.find_edge(parent_index, child).is_none()
                    && !has_path_connecting(&self.graph, child, parent_index, None)
                {
                    self.graph.add_edge(parent_index, child, ChainEdge::Initiator);
                }
            }
        }
    }
}

/// All nodes that can reach `node`, excluding `node` itself.
pub(crate) fn ancestors<N, E>(
    graph: &StableDiGraph<N, E>,
    node: NodeIndex,
) -> HashSet<NodeIndex> {
    let mut seen = HashSet::new();
    let mut dfs = Dfs::new(Reversed(graph), node);
    while let Some(n) = dfs.next(Reversed(graph)) {
        if n != node {
            seen.insert(n);
        }
    }
    seen
}

/// Walks an event's initiator record to the URL of whatever caused it.
fn resolve_parent(event: &RequestEvent, id_to_url: &HashMap<&str, &str>) -> Option<String> {
    let initiator = event.initiator.as_ref()?;

    let mut parent = match initiator.kind {
        InitiatorKind::Parser => initiator.url.clone(),
        InitiatorKind::Script => initiator.stack.as_ref().and_then(first_frame_url),
        InitiatorKind::Other => None,
    };

    if parent.is_none()
        && let Some(request_id) = initiator.request_id.as_deref()
    {
        parent = id_to_url.get(request_id).map(|u| (*u).to_owned());
    }

    if parent.is_none() {
        parent = event.document_url.clone();
    }

    match parent {
        Some(p) if !p.is_empty() && !is_filtered_url(&p) && p != event.request.url => Some(p),
        _ => None,
    }
}

/// First non-empty frame URL, walking call frames before parent stacks.
fn first_frame_url(stack: &CallStack) -> Option<String> {
    for frame in &stack.call_frames {
        if !frame.url.is_empty() {
            return Some(frame.url.clone());
        }
    }
    stack.parent.as_deref().and_then(first_frame_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(url: &str, initiator: Option<Initiator>) -> RequestEvent {
        RequestEvent {
            request_id: None,
            timestamp: 0.0,
            document_url: Some("https://www.site.com/".to_owned()),
            request: RequestInfo { url: url.to_owned() },
            initiator,
        }
    }

    fn parser_from(url: &str) -> Option<Initiator> {
        Some(Initiator {
            kind: InitiatorKind::Parser,
            url: Some(url.to_owned()),
            stack: None,
            request_id: None,
        })
    }

    fn script_from(frame_url: &str) -> Option<Initiator> {
        Some(Initiator {
            kind: InitiatorKind::Script,
            url: None,
            stack: Some(CallStack {
                call_frames: vec![CallFrame { url: frame_url.to_owned() }],
                parent: None,
            }),
            request_id: None,
        })
    }

    #[test]
    fn parses_json_array_and_lines() {
        let dir = std::env::temp_dir().join("rulewright-trace-test");
        std::fs::create_dir_all(&dir).unwrap();

        let array = dir.join("a.json");
        std::fs::write(
            &array,
            r#"[{"requestId":"1","timestamp":2.0,"documentURL":"https://s.com/",
                "request":{"url":"https://a.com/x.js"},
                "initiator":{"type":"parser","url":"https://s.com/"}},
               {"requestId":"0","timestamp":1.0,"documentURL":"https://s.com/",
                "request":{"url":"https://b.com/y.js"},"initiator":{"type":"other"}}]"#,
        )
        .unwrap();
        let events = read_trace(Utf8Path::from_path(&array).unwrap()).unwrap();
        assert_eq!(events.len(), 2);
        // sorted by timestamp
        assert_eq!(events[0].request.url, "https://b.com/y.js");

        let lines = dir.join("b.jsonl");
        std::fs::write(
            &lines,
            "{\"request\":{\"url\":\"https://a.com/x.js\"}}\nnot json\n",
        )
        .unwrap();
        let events = read_trace(Utf8Path::from_path(&lines).unwrap()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn builds_chain_with_parent_resolution() {
        let events = vec![
            event("https://a.example.com/x.js", parser_from("https://www.site.com/")),
            event("https://a.example.com/y.js", script_from("https://a.example.com/x.js")),
            event("https://d.example.com/x.js", script_from("https://a.example.com/x.js")),
            // non-js extension is skipped entirely
            event("https://img.example.com/banner.png", None),
        ];
        let chain = ChainGraph::from_events(&events, "site.com");

        assert!(chain.contains("https://a.example.com/x.js"));
        assert!(chain.contains("https://a.example.com/y.js"));
        assert!(!chain.contains("https://img.example.com/banner.png"));

        let x = chain.node("https://a.example.com/x.js").unwrap();
        let y = chain.node("https://a.example.com/y.js").unwrap();
        assert!(chain.graph.find_edge(x, y).is_some());

        // the parser parent was materialized and re-attached to root
        let parent = chain.node("https://www.site.com/").unwrap();
        assert!(chain.graph.find_edge(chain.root, parent).is_some());
    }

    #[test]
    fn request_id_and_document_url_fallbacks() {
        let mut first = event("https://cdn.example.com/loader.js", None);
        first.request_id = Some("42".to_owned());
        let chained = event(
            "https://ads.example.com/payload.js",
            Some(Initiator {
                kind: InitiatorKind::Other,
                url: None,
                stack: None,
                request_id: Some("42".to_owned()),
            }),
        );
        let fallback = event("https://t.example.com/t.js", Some(Initiator {
            kind: InitiatorKind::Other,
            url: None,
            stack: None,
            request_id: None,
        }));

        let chain = ChainGraph::from_events(&[first, chained, fallback], "site.com");
        let loader = chain.node("https://cdn.example.com/loader.js").unwrap();
        let payload = chain.node("https://ads.example.com/payload.js").unwrap();
        assert!(chain.graph.find_edge(loader, payload).is_some());

        // documentURL fallback hangs the node under the page document
        let doc = chain.node("https://www.site.com/").unwrap();
        let t = chain.node("https://t.example.com/t.js").unwrap();
        assert!(chain.graph.find_edge(doc, t).is_some());
    }

    #[test]
    fn remove_node_and_connect_preserves_reachability() {
        let mut chain = ChainGraph::new("site.com");
        let a = chain.ensure("a", UrlVariants::default());
        let b = chain.ensure("b", UrlVariants::default());
        let c = chain.ensure("c", UrlVariants::default());
        chain.add_edge_once(chain.root, a, ChainEdge::Initiator);
        chain.add_edge_once(a, b, ChainEdge::Initiator);
        chain.add_edge_once(b, c, ChainEdge::Initiator);

        chain.remove_node_and_connect(b);

        assert!(!chain.contains("b"));
        assert!(chain.graph.find_edge(a, c).is_some());
        assert_eq!(chain.graph[chain.graph.find_edge(a, c).unwrap()], ChainEdge::Virtual);
    }

    #[test]
    fn esld_projection_merges_subdomains() {
        let events = vec![
            event("https://a.example.com/x.js", parser_from("https://www.site.com/")),
            event("https://a.example.com/y.js", script_from("https://a.example.com/x.js")),
            event("https://d.example.com/x.js", script_from("https://a.example.com/x.js")),
        ];
        let chain = ChainGraph::from_events(&events, "site.com");
        let esld = chain.project(Granularity::Esld);

        // all three URLs collapse into one example.com node under root
        assert!(esld.contains("example.com"));
        let n = esld.node("example.com").unwrap();
        assert!(esld.graph.find_edge(esld.root, n).is_some());
        assert_eq!(esld.graph.node_count(), 2);
    }

    #[test]
    fn fqdn_projection_keeps_siblings() {
        let events = vec![
            event("https://a.example.com/x.js", parser_from("https://www.site.com/")),
            event("https://a.example.com/y.js", script_from("https://a.example.com/x.js")),
            event("https://d.example.com/x.js", script_from("https://a.example.com/x.js")),
        ];
        let chain = ChainGraph::from_events(&events, "site.com");
        let fqdn = chain.project(Granularity::Fqdn);

        let a = fqdn.node("a.example.com").unwrap();
        let d = fqdn.node("d.example.com").unwrap();
        assert!(fqdn.graph.find_edge(a, d).is_some());

        let paths = chain.project(Granularity::FqdnPath);
        assert!(paths.contains("a.example.com/x.js"));
        assert!(paths.contains("a.example.com/y.js"));
        assert!(paths.contains("d.example.com/x.js"));
    }

    #[test]
    fn projection_coarsens_duplicate_domains_on_a_path() {
        // a.com -> b.com -> a.com again: the deeper occurrence folds away
        let events = vec![
            event("https://a.com/1.js", parser_from("https://www.site.com/")),
            event("https://b.com/1.js", script_from("https://a.com/1.js")),
            event("https://a.com/2.js", script_from("https://b.com/1.js")),
        ];
        let chain = ChainGraph::from_events(&events, "site.com");
        let esld = chain.project(Granularity::Esld);

        let a = esld.node("a.com").unwrap();
        let b = esld.node("b.com").unwrap();
        assert!(esld.graph.find_edge(a, b).is_some());
        assert!(esld.graph.find_edge(b, a).is_none());
    }

    #[test]
    fn root_edge_dominates_ambiguous_provenance() {
        let mut projected = ChainGraph::new("site.com");
        let a = projected.ensure("a.com", UrlVariants::of("a.com").unwrap());
        let b = projected.ensure("b.com", UrlVariants::of("b.com").unwrap());
        projected.add_edge_once(projected.root, a, ChainEdge::Initiator);
        projected.add_edge_once(projected.root, b, ChainEdge::Initiator);
        projected.add_edge_once(a, b, ChainEdge::Initiator);

        projected.prefer_root_provenance();

        let root = projected.root;
        assert!(projected.graph.find_edge(a, b).is_none());
        assert!(projected.graph.find_edge(root, b).is_some());
    }

    #[test]
    fn merge_from_avoids_cycles() {
        let mut base = ChainGraph::new("site.com");
        let a = base.ensure("a.com", UrlVariants::of("a.com").unwrap());
        let b = base.ensure("b.com", UrlVariants::of("b.com").unwrap());
        base.add_edge_once(a, b, ChainEdge::Initiator);

        let mut other = ChainGraph::new("site.com");
        let ob = other.ensure("b.com", UrlVariants::of("b.com").unwrap());
        let oa = other.ensure("a.com", UrlVariants::of("a.com").unwrap());
        other.add_edge_once(ob, oa, ChainEdge::Initiator);

        base.merge_from(&other);
        // the reverse edge would close a cycle and is rejected
        assert!(base.graph.find_edge(b, a).is_none());
        assert!(base.graph.find_edge(a, b).is_some());
    }
}
