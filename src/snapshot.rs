//! Recorded site snapshots.
//!
//! A snapshot is the dependency graph of one page load: DOM nodes, URLs and
//! scripts, connected by typed edges, with ads, images and text nodes
//! annotated by the recording pipeline. Snapshots are immutable after
//! loading; the controlled bandit walks them to simulate what a rule set
//! would have blocked.

use std::collections::BTreeSet;

use camino::Utf8Path;
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{Dfs, EdgeRef};

use crate::error::SnapshotError;
use crate::grain::{Granularity, UrlVariants};
use crate::graphml::{self, GraphmlDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotNodeKind {
    Node,
    Url,
    Script,
}

impl SnapshotNodeKind {
    fn parse(value: &str) -> Self {
        match value {
            "URL" => SnapshotNodeKind::Url,
            "SCRIPT" => SnapshotNodeKind::Script,
            _ => SnapshotNodeKind::Node,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotEdge {
    Dom,
    Actor,
    Requestor,
    AttachedLater,
    NodeToScript,
    ScriptUsedBy,
    Virtual,
}

impl SnapshotEdge {
    fn parse(value: &str) -> Self {
        match value {
            "actor" => SnapshotEdge::Actor,
            "requestor" => SnapshotEdge::Requestor,
            "attached_later" => SnapshotEdge::AttachedLater,
            "node_to_script" => SnapshotEdge::NodeToScript,
            "script_used_by" => SnapshotEdge::ScriptUsedBy,
            "virtual" => SnapshotEdge::Virtual,
            _ => SnapshotEdge::Dom,
        }
    }

    /// Dom and virtual edges carry structure; everything else carries
    /// causality and dominates traversal.
    pub fn is_non_dom(self) -> bool {
        !matches!(self, SnapshotEdge::Dom | SnapshotEdge::Virtual)
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotNode {
    pub id: String,
    pub kind: SnapshotNodeKind,
    pub info: String,
    pub requested_url: Option<String>,
    pub flg_ad: bool,
    pub flg_image: bool,
    pub flg_textnode: bool,
    pub is_root: bool,
}

impl SnapshotNode {
    /// The URL this node stands for, if any. URL-kind nodes carry it in
    /// `info`; others may carry a `requested_url`.
    pub fn url(&self) -> Option<&str> {
        match self.kind {
            SnapshotNodeKind::Url if !self.info.is_empty() => Some(&self.info),
            _ => self.requested_url.as_deref(),
        }
    }

    pub fn is_iframe(&self) -> bool {
        self.info.eq_ignore_ascii_case("iframe")
    }
}

#[derive(Debug, Clone)]
pub struct SiteSnapshot {
    name: String,
    graph: StableDiGraph<SnapshotNode, SnapshotEdge>,
    root: NodeIndex,
}

/// Assembles a snapshot node by node; `finish` adds the root sentinel and
/// wires orphans to it with virtual edges.
pub struct SnapshotBuilder {
    name: String,
    graph: StableDiGraph<SnapshotNode, SnapshotEdge>,
    index: std::collections::HashMap<String, NodeIndex>,
}

impl SnapshotBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            graph: StableDiGraph::new(),
            index: std::collections::HashMap::new(),
        }
    }

    pub fn node(&mut self, node: SnapshotNode) -> &mut Self {
        let id = node.id.clone();
        let index = self.graph.add_node(node);
        self.index.insert(id, index);
        self
    }

    pub fn edge(&mut self, source: &str, target: &str, kind: SnapshotEdge) -> &mut Self {
        if let (Some(&a), Some(&b)) = (self.index.get(source), self.index.get(target)) {
            self.graph.add_edge(a, b, kind);
        }
        self
    }

    pub fn finish(self) -> SiteSnapshot {
        let mut graph = self.graph;
        let root = graph.add_node(SnapshotNode {
            id: "__page__".to_owned(),
            kind: SnapshotNodeKind::Node,
            info: String::new(),
            requested_url: None,
            flg_ad: false,
            flg_image: false,
            flg_textnode: false,
            is_root: true,
        });

        let orphans: Vec<_> = graph
            .node_indices()
            .filter(|&n| {
                n != root
                    && graph
                        .neighbors_directed(n, Direction::Incoming)
                        .next()
                        .is_none()
            })
            .collect();
        for n in orphans {
            graph.add_edge(root, n, SnapshotEdge::Virtual);
        }

        SiteSnapshot { name: self.name, graph, root }
    }
}

impl SiteSnapshot {
    /// Loads a snapshot from a GraphML file; the file stem becomes its
    /// name. Returns an error for unreadable or malformed files, never for
    /// invalid content: validity is a separate check so the caller can skip
    /// and keep going.
    pub fn load(path: &Utf8Path) -> Result<SiteSnapshot, SnapshotError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SnapshotError::FileRead(path.to_owned(), e))?;
        let doc = graphml::parse(&content)
            .map_err(|e| SnapshotError::Graphml(path.to_owned(), e))?;
        let name = path.file_stem().unwrap_or("snapshot").to_owned();
        Ok(Self::from_graphml(&name, &doc))
    }

    pub fn from_graphml(name: &str, doc: &GraphmlDocument) -> SiteSnapshot {
        let mut builder = SnapshotBuilder::new(name);
        let truthy = |value: Option<&String>| value.map(String::as_str) == Some("true");
        for node in &doc.nodes {
            builder.node(SnapshotNode {
                id: node.id.clone(),
                kind: node
                    .attrs
                    .get("node_type")
                    .map(|v| SnapshotNodeKind::parse(v))
                    .unwrap_or(SnapshotNodeKind::Node),
                info: node.attrs.get("info").cloned().unwrap_or_default(),
                requested_url: node.attrs.get("requested_url").cloned(),
                flg_ad: truthy(node.attrs.get("flg-ad")),
                flg_image: truthy(node.attrs.get("flg-image")),
                flg_textnode: truthy(node.attrs.get("flg-textnode")),
                is_root: false,
            });
        }
        for edge in &doc.edges {
            let kind = edge
                .attrs
                .get("edge_type")
                .map(|v| SnapshotEdge::parse(v))
                .unwrap_or(SnapshotEdge::Dom);
            builder.edge(&edge.source, &edge.target, kind);
        }
        builder.finish()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &StableDiGraph<SnapshotNode, SnapshotEdge> {
        &self.graph
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn ad_count(&self) -> u64 {
        self.graph.node_weights().filter(|n| n.flg_ad).count() as u64
    }

    pub fn image_count(&self) -> u64 {
        self.graph.node_weights().filter(|n| n.flg_image).count() as u64
    }

    pub fn textnode_count(&self) -> u64 {
        self.graph.node_weights().filter(|n| n.flg_textnode).count() as u64
    }

    /// A usable snapshot shows at least one ad and some page content.
    pub fn is_valid(&self) -> bool {
        self.ad_count() > 0 && (self.image_count() > 0 || self.textnode_count() > 0)
    }

    /// Whether any URL in the snapshot matches `pattern` at `level`. The
    /// variant comparison is exact so that sibling labels do not
    /// over-match (`ads-example.com` must not satisfy `example.com`).
    pub fn has_url_variant(&self, pattern: &str, level: Option<Granularity>) -> bool {
        for node in self.graph.node_weights() {
            let Some(url) = node.url() else { continue };
            if !url.contains(pattern) {
                continue;
            }
            let Some(variants) = UrlVariants::of(url) else {
                continue;
            };
            let matched = match level {
                None => Granularity::SEQUENCE
                    .iter()
                    .any(|&g| variants.at(g) == Some(pattern)),
                Some(level) => variants.at(level) == Some(pattern),
            };
            if matched {
                return true;
            }
        }
        false
    }

    /// Whether `node` has a predecessor connected through a non-dom,
    /// non-virtual edge. Cyclic back-edges are not provenance and are
    /// ignored.
    pub fn has_non_dom_predecessor(&self, node: NodeIndex) -> bool {
        for edge in self.graph.edges_directed(node, Direction::Incoming) {
            if edge.weight().is_non_dom() {
                if has_path_connecting(&self.graph, node, edge.source(), None) {
                    continue;
                }
                return true;
            }
        }
        false
    }

    /// Script URLs reachable inside ad-flagged subtrees. These feed the
    /// iframe-scoped (`$subdocument`) rule lists.
    pub fn ad_subtree_script_urls(&self) -> BTreeSet<String> {
        let mut urls = BTreeSet::new();
        let ad_nodes: Vec<_> = self
            .graph
            .node_indices()
            .filter(|&n| self.graph[n].flg_ad)
            .collect();
        for start in ad_nodes {
            let mut dfs = Dfs::new(&self.graph, start);
            while let Some(n) = dfs.next(&self.graph) {
                let node = &self.graph[n];
                if node.kind != SnapshotNodeKind::Script {
                    continue;
                }
                // script nodes carry their URL in either attribute
                let url = node
                    .requested_url
                    .as_deref()
                    .or((!node.info.is_empty()).then_some(node.info.as_str()));
                if let Some(url) = url {
                    urls.insert(url.to_owned());
                }
            }
        }
        urls
    }
}

/// Convenience constructor used across the crate's tests.
#[cfg(test)]
pub(crate) fn url_node(id: &str, url: &str) -> SnapshotNode {
    SnapshotNode {
        id: id.to_owned(),
        kind: SnapshotNodeKind::Url,
        info: url.to_owned(),
        requested_url: None,
        flg_ad: false,
        flg_image: false,
        flg_textnode: false,
        is_root: false,
    }
}

#[cfg(test)]
pub(crate) fn plain_node(id: &str, info: &str) -> SnapshotNode {
    SnapshotNode {
        id: id.to_owned(),
        kind: SnapshotNodeKind::Node,
        info: info.to_owned(),
        requested_url: None,
        flg_ad: false,
        flg_image: false,
        flg_textnode: false,
        is_root: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SiteSnapshot {
        let mut b = SnapshotBuilder::new("s1");
        let mut ad = url_node("n1", "https://ads-example.com/serve.js");
        ad.flg_ad = true;
        let mut img = plain_node("n2", "img");
        img.flg_image = true;
        img.requested_url = Some("https://example.com/cat.png".to_owned());
        let mut text = plain_node("n3", "#text");
        text.flg_textnode = true;
        b.node(ad).node(img).node(text);
        b.edge("n1", "n2", SnapshotEdge::Dom);
        b.finish()
    }

    #[test]
    fn counts_and_validity() {
        let snapshot = sample();
        assert_eq!(snapshot.ad_count(), 1);
        assert_eq!(snapshot.image_count(), 1);
        assert_eq!(snapshot.textnode_count(), 1);
        assert!(snapshot.is_valid());

        let empty = SnapshotBuilder::new("empty").finish();
        assert!(!empty.is_valid());
    }

    #[test]
    fn root_adopts_orphans_with_virtual_edges() {
        let snapshot = sample();
        let root = snapshot.root();
        // n1 and n3 are orphans; n2 hangs under n1
        let adopted: Vec<_> = snapshot
            .graph()
            .edges_directed(root, Direction::Outgoing)
            .map(|e| e.weight())
            .collect();
        assert_eq!(adopted.len(), 2);
        assert!(adopted.iter().all(|w| **w == SnapshotEdge::Virtual));
    }

    #[test]
    fn url_variant_matching_is_exact_per_level() {
        let snapshot = sample();
        assert!(snapshot.has_url_variant("ads-example.com", Some(Granularity::Esld)));
        // sibling labels must not over-match
        assert!(!snapshot.has_url_variant("example.com", Some(Granularity::Fqdn)));
        // but the image's requested_url genuinely carries example.com
        assert!(snapshot.has_url_variant("example.com", Some(Granularity::Esld)));
        assert!(snapshot.has_url_variant("ads-example.com/serve.js", Some(Granularity::FqdnPath)));
        assert!(!snapshot.has_url_variant("other.com", None));
    }

    #[test]
    fn non_dom_predecessors_ignore_cycles() {
        let mut b = SnapshotBuilder::new("s2");
        b.node(plain_node("a", ""))
            .node(plain_node("b", ""))
            .node(plain_node("c", ""));
        b.edge("a", "b", SnapshotEdge::Actor);
        b.edge("b", "c", SnapshotEdge::Dom);
        // back edge closing a cycle: ignored as provenance
        b.edge("b", "a", SnapshotEdge::Requestor);
        let snapshot = b.finish();

        let find = |id: &str| {
            snapshot
                .graph()
                .node_indices()
                .find(|&n| snapshot.graph()[n].id == id)
                .unwrap()
        };
        assert!(snapshot.has_non_dom_predecessor(find("b")));
        assert!(!snapshot.has_non_dom_predecessor(find("a")));
        assert!(!snapshot.has_non_dom_predecessor(find("c")));
    }

    #[test]
    fn loads_from_graphml() {
        let text = r#"<?xml version="1.0" encoding="UTF-8"?>
          <graphml>
            <key id="d0" for="node" attr.name="node_type" attr.type="string"/>
            <key id="d1" for="node" attr.name="info" attr.type="string"/>
            <key id="d2" for="node" attr.name="flg-ad" attr.type="string"/>
            <key id="d3" for="edge" attr.name="edge_type" attr.type="string"/>
            <graph edgedefault="directed">
              <node id="1"><data key="d0">URL</data><data key="d1">https://t.com/x.js</data><data key="d2">true</data></node>
              <node id="2"><data key="d1">iframe</data></node>
              <edge source="1" target="2"><data key="d3">actor</data></edge>
            </graph>
          </graphml>"#;
        let doc = graphml::parse(text).unwrap();
        let snapshot = SiteSnapshot::from_graphml("s3", &doc);
        assert_eq!(snapshot.ad_count(), 1);
        assert!(snapshot.has_url_variant("t.com", Some(Granularity::Esld)));
        let iframe = snapshot
            .graph()
            .node_indices()
            .find(|&n| snapshot.graph()[n].is_iframe())
            .unwrap();
        assert_eq!(snapshot.graph()[iframe].id, "2");
    }

    #[test]
    fn ad_subtree_scripts_collected() {
        let mut b = SnapshotBuilder::new("s4");
        let mut frame = plain_node("f", "iframe");
        frame.flg_ad = true;
        let mut script = plain_node("s", "https://ads.net/payload.js");
        script.kind = SnapshotNodeKind::Script;
        b.node(frame).node(script).node(plain_node("other", ""));
        b.edge("f", "s", SnapshotEdge::NodeToScript);
        let snapshot = b.finish();

        let urls = snapshot.ad_subtree_script_urls();
        assert!(urls.contains("https://ads.net/payload.js"));
        assert_eq!(urls.len(), 1);
    }
}
