//! Minimal GraphML codec.
//!
//! Snapshots arrive as node-attributed, edge-typed GraphML files, and the
//! action space is persisted in the same format, so reading and writing
//! share one attribute-map representation. Only the subset of GraphML
//! actually present in those files is supported: `<key>` declarations,
//! `<node>`/`<edge>` elements, and string-valued `<data>` children.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

#[derive(Debug, Clone, Default)]
pub struct GraphmlNode {
    pub id: String,
    pub attrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GraphmlEdge {
    pub source: String,
    pub target: String,
    pub attrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GraphmlDocument {
    pub nodes: Vec<GraphmlNode>,
    pub edges: Vec<GraphmlEdge>,
}

enum Scope {
    Node(GraphmlNode),
    Edge(GraphmlEdge),
}

/// Parses a GraphML document into flat node and edge lists. `<key>`
/// declarations are honored, so `<data key="d3">` resolves to the declared
/// `attr.name` (the networkx writer emits synthetic `d<N>` ids).
pub fn parse(content: &str) -> Result<GraphmlDocument, String> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut doc = GraphmlDocument::default();
    let mut key_names: BTreeMap<String, String> = BTreeMap::new();
    let mut scope: Option<Scope> = None;
    let mut data_key: Option<String> = None;

    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| format!("xml error at {}: {e}", reader.buffer_position()))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                let mut attrs = BTreeMap::new();
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| e.to_string())?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
                    attrs.insert(key, value);
                }

                match e.name().as_ref() {
                    b"key" => {
                        if let (Some(id), Some(name)) = (attrs.get("id"), attrs.get("attr.name")) {
                            key_names.insert(id.clone(), name.clone());
                        }
                    }
                    b"node" => {
                        let node = GraphmlNode {
                            id: attrs.remove("id").ok_or("node without id")?,
                            attrs: BTreeMap::new(),
                        };
                        if empty {
                            doc.nodes.push(node);
                        } else {
                            scope = Some(Scope::Node(node));
                        }
                    }
                    b"edge" => {
                        let edge = GraphmlEdge {
                            source: attrs.remove("source").ok_or("edge without source")?,
                            target: attrs.remove("target").ok_or("edge without target")?,
                            attrs: BTreeMap::new(),
                        };
                        if empty {
                            doc.edges.push(edge);
                        } else {
                            scope = Some(Scope::Edge(edge));
                        }
                    }
                    b"data" if !empty => {
                        data_key = attrs.remove("key");
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if let Some(key) = data_key.as_ref() {
                    let value = t.unescape().map_err(|e| e.to_string())?.into_owned();
                    let name = key_names.get(key).cloned().unwrap_or_else(|| key.clone());
                    match scope.as_mut() {
                        Some(Scope::Node(node)) => {
                            node.attrs.insert(name, value);
                        }
                        Some(Scope::Edge(edge)) => {
                            edge.attrs.insert(name, value);
                        }
                        None => {}
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"data" => data_key = None,
                b"node" => {
                    if let Some(Scope::Node(node)) = scope.take() {
                        doc.nodes.push(node);
                    }
                }
                b"edge" => {
                    if let Some(Scope::Edge(edge)) = scope.take() {
                        doc.edges.push(edge);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(doc)
}

/// Serializes nodes and edges back into GraphML, declaring one string key
/// per distinct attribute name.
pub fn write(doc: &GraphmlDocument) -> Result<String, String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| e.to_string())?;

    let mut graphml = BytesStart::new("graphml");
    graphml.push_attribute(("xmlns", "http://graphml.graphdrawing.org/xmlns"));
    writer.write_event(Event::Start(graphml)).map_err(|e| e.to_string())?;

    let node_keys: BTreeMap<&str, ()> = doc
        .nodes
        .iter()
        .flat_map(|n| n.attrs.keys().map(|k| (k.as_str(), ())))
        .collect();
    let edge_keys: BTreeMap<&str, ()> = doc
        .edges
        .iter()
        .flat_map(|e| e.attrs.keys().map(|k| (k.as_str(), ())))
        .collect();

    for (name, target) in node_keys
        .keys()
        .map(|k| (*k, "node"))
        .chain(edge_keys.keys().map(|k| (*k, "edge")))
    {
        let mut key = BytesStart::new("key");
        key.push_attribute(("id", name));
        key.push_attribute(("for", target));
        key.push_attribute(("attr.name", name));
        key.push_attribute(("attr.type", "string"));
        writer.write_event(Event::Empty(key)).map_err(|e| e.to_string())?;
    }

    let mut graph = BytesStart::new("graph");
    graph.push_attribute(("edgedefault", "directed"));
    writer.write_event(Event::Start(graph)).map_err(|e| e.to_string())?;

    for node in &doc.nodes {
        let mut start = BytesStart::new("node");
        start.push_attribute(("id", node.id.as_str()));
        writer.write_event(Event::Start(start)).map_err(|e| e.to_string())?;
        write_data(&mut writer, &node.attrs)?;
        writer.write_event(Event::End(BytesEnd::new("node"))).map_err(|e| e.to_string())?;
    }

    for edge in &doc.edges {
        let mut start = BytesStart::new("edge");
        start.push_attribute(("source", edge.source.as_str()));
        start.push_attribute(("target", edge.target.as_str()));
        writer.write_event(Event::Start(start)).map_err(|e| e.to_string())?;
        write_data(&mut writer, &edge.attrs)?;
        writer.write_event(Event::End(BytesEnd::new("edge"))).map_err(|e| e.to_string())?;
    }

    writer.write_event(Event::End(BytesEnd::new("graph"))).map_err(|e| e.to_string())?;
    writer.write_event(Event::End(BytesEnd::new("graphml"))).map_err(|e| e.to_string())?;

    String::from_utf8(writer.into_inner()).map_err(|e| e.to_string())
}

fn write_data(
    writer: &mut Writer<Vec<u8>>,
    attrs: &BTreeMap<String, String>,
) -> Result<(), String> {
    for (key, value) in attrs {
        let mut data = BytesStart::new("data");
        data.push_attribute(("key", key.as_str()));
        writer.write_event(Event::Start(data)).map_err(|e| e.to_string())?;
        writer
            .write_event(Event::Text(BytesText::new(value)))
            .map_err(|e| e.to_string())?;
        writer.write_event(Event::End(BytesEnd::new("data"))).map_err(|e| e.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_nodes_edges_and_attributes() {
        let mut node = GraphmlNode { id: "n0".into(), attrs: BTreeMap::new() };
        node.attrs.insert("name".into(), "tracker.com".into());
        node.attrs.insert("q_value".into(), "0.2".into());
        let plain = GraphmlNode { id: "n1".into(), attrs: BTreeMap::new() };
        let mut edge = GraphmlEdge {
            source: "n0".into(),
            target: "n1".into(),
            attrs: BTreeMap::new(),
        };
        edge.attrs.insert("edge_type".into(), "initiator".into());

        let doc = GraphmlDocument { nodes: vec![node, plain], edges: vec![edge] };
        let text = write(&doc).unwrap();
        let parsed = parse(&text).unwrap();

        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.edges.len(), 1);
        assert_eq!(parsed.nodes[0].attrs["name"], "tracker.com");
        assert_eq!(parsed.edges[0].attrs["edge_type"], "initiator");
    }

    #[test]
    fn resolves_declared_key_names() {
        let text = r#"<?xml version="1.0" encoding="UTF-8"?>
            <graphml>
              <key id="d0" for="node" attr.name="flg-ad" attr.type="string"/>
              <graph edgedefault="directed">
                <node id="a"><data key="d0">true</data></node>
                <node id="b"/>
                <edge source="a" target="b"/>
              </graph>
            </graphml>"#;
        let parsed = parse(text).unwrap();
        assert_eq!(parsed.nodes[0].attrs["flg-ad"], "true");
        assert!(parsed.nodes[1].attrs.is_empty());
    }
}
