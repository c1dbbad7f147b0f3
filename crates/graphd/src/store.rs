//! In-memory directed weighted graph kept in lockstep with its secondary index.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GraphError, Result};
use crate::index::{Document, FieldQuery, SecondaryIndex};
use crate::properties::{format_number, AttributeStore, Value};

pub use crate::index::KEY_FIELD;
pub const TYPE_FIELD: &str = "_type";
pub const SOURCE_FIELD: &str = "_source";
pub const TARGET_FIELD: &str = "_target";
pub const REL_FIELD: &str = "_rel";
pub const WEIGHT_FIELD: &str = "_weight";

/// The one attribute name that may be written without the reserved prefix
/// to change an edge's graph weight.
pub const WEIGHT_ALIAS: &str = "weight";
pub const RESERVED_PREFIX: char = '_';
pub const DEFAULT_WEIGHT: f64 = 1.0;

pub const VERTEX_TYPE: &str = "v";
pub const EDGE_TYPE: &str = "e";
pub const GRAPH_TYPE: &str = "g";
pub const PROCESS_TYPE: &str = "p";
pub const CHANNEL_TYPE: &str = "c";
pub const UDF_TYPE: &str = "udf";

pub const RESERVED_FIELDS: [&str; 6] = [
    KEY_FIELD,
    TYPE_FIELD,
    SOURCE_FIELD,
    TARGET_FIELD,
    REL_FIELD,
    WEIGHT_FIELD,
];

#[derive(Debug, Clone)]
pub struct VertexData {
    pub key: String,
    pub attrs: AttributeStore,
}

#[derive(Debug, Clone)]
pub struct EdgeData {
    pub key: String,
    pub rel: String,
    pub weight: f64,
    pub attrs: AttributeStore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub key: String,
    pub attrs: AttributeStore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub key: String,
    pub source: String,
    pub target: String,
    pub rel: String,
    pub weight: f64,
    pub attrs: AttributeStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Vertex,
    Edge,
}

/// A snapshot of one stored object.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphObject {
    Vertex(Vertex),
    Edge(Edge),
}

impl GraphObject {
    pub fn key(&self) -> &str {
        match self {
            GraphObject::Vertex(v) => &v.key,
            GraphObject::Edge(e) => &e.key,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            GraphObject::Vertex(_) => ObjectKind::Vertex,
            GraphObject::Edge(_) => ObjectKind::Edge,
        }
    }

    /// Client-facing record: reserved fields followed by the attributes.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            GraphObject::Vertex(v) => {
                let mut map = v.attrs.to_json();
                map.insert(KEY_FIELD.into(), json!(v.key));
                map.insert(TYPE_FIELD.into(), json!(VERTEX_TYPE));
                serde_json::Value::Object(map)
            }
            GraphObject::Edge(e) => {
                let mut map = e.attrs.to_json();
                map.insert(KEY_FIELD.into(), json!(e.key));
                map.insert(TYPE_FIELD.into(), json!(EDGE_TYPE));
                map.insert(SOURCE_FIELD.into(), json!(e.source));
                map.insert(TARGET_FIELD.into(), json!(e.target));
                map.insert(REL_FIELD.into(), json!(e.rel));
                map.insert(WEIGHT_FIELD.into(), Value::Number(e.weight).to_json());
                serde_json::Value::Object(map)
            }
        }
    }
}

/// Removal notifications, in the order the objects went away.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    EdgeRemoved(Edge),
    VertexRemoved(Vertex),
}

/// What a removal would take down, computed before anything is mutated so
/// bound actors can be told first.
#[derive(Debug, Clone, Default)]
pub struct RemovalPlan {
    pub vertex: Option<Vertex>,
    pub edges: Vec<Edge>,
}

struct EngineState {
    graph: StableDiGraph<VertexData, EdgeData>,
    vertices: HashMap<String, NodeIndex>,
    edges: HashMap<String, EdgeIndex>,
    index: SecondaryIndex,
}

/// Read access to the graph structure for algorithms.
pub struct GraphView<'a> {
    pub graph: &'a StableDiGraph<VertexData, EdgeData>,
    vertices: &'a HashMap<String, NodeIndex>,
}

impl<'a> GraphView<'a> {
    pub fn node(&self, key: &str) -> Result<NodeIndex> {
        self.vertices
            .get(key)
            .copied()
            .ok_or_else(|| GraphError::NotFound(key.to_string()))
    }

    pub fn key(&self, node: NodeIndex) -> &'a str {
        &self.graph[node].key
    }
}

pub struct GraphEngine {
    name: String,
    state: RwLock<EngineState>,
}

impl GraphEngine {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(EngineState {
                graph: StableDiGraph::new(),
                vertices: HashMap::new(),
                edges: HashMap::new(),
                index: SecondaryIndex::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a vertex. `None` generates a key.
    pub fn add_vertex(&self, key: Option<&str>, attrs: AttributeStore) -> Result<String> {
        check_attrs(&attrs)?;
        let key = resolve_key(key)?;
        let mut state = self.write();
        state.ensure_free(&key)?;

        let node = state.graph.add_node(VertexData {
            key: key.clone(),
            attrs,
        });
        state.vertices.insert(key.clone(), node);
        state.reindex_vertex(node);
        debug!(graph = %self.name, key = %key, "vertex added");
        Ok(key)
    }

    pub fn add_edge(
        &self,
        key: Option<&str>,
        source: &str,
        target: &str,
        rel: &str,
        weight: f64,
        attrs: AttributeStore,
    ) -> Result<String> {
        check_attrs(&attrs)?;
        check_weight(weight)?;
        let key = resolve_key(key)?;
        let mut state = self.write();
        state.ensure_free(&key)?;
        let from = state.vertex_index(source)?;
        let to = state.vertex_index(target)?;

        let edge = state.graph.add_edge(
            from,
            to,
            EdgeData {
                key: key.clone(),
                rel: rel.to_string(),
                weight,
                attrs,
            },
        );
        state.edges.insert(key.clone(), edge);
        state.reindex_edge(edge);
        debug!(graph = %self.name, key = %key, source, target, rel, "edge added");
        Ok(key)
    }

    /// Everything removing `key` would delete: incident edges first, then the vertex.
    pub fn plan_removal(&self, key: &str) -> Result<RemovalPlan> {
        let state = self.read();
        if let Some(&edge) = state.edges.get(key) {
            return Ok(RemovalPlan {
                vertex: None,
                edges: vec![state.edge_snapshot(edge)],
            });
        }
        let node = state.vertex_index(key)?;
        let edges = state
            .incident_edges(node)
            .into_iter()
            .map(|e| state.edge_snapshot(e))
            .collect();
        Ok(RemovalPlan {
            vertex: Some(state.vertex_snapshot(node)),
            edges,
        })
    }

    /// Removes a vertex or an edge. A vertex takes its incident edges with it.
    pub fn remove(&self, key: &str) -> Result<Vec<GraphEvent>> {
        let mut state = self.write();
        let events = if state.edges.contains_key(key) {
            vec![GraphEvent::EdgeRemoved(state.remove_edge(key)?)]
        } else {
            let node = state.vertex_index(key)?;
            let mut events: Vec<GraphEvent> = state
                .incident_edges(node)
                .into_iter()
                .map(|e| {
                    let edge_key = state.graph[e].key.clone();
                    state.remove_edge(&edge_key).map(GraphEvent::EdgeRemoved)
                })
                .collect::<Result<_>>()?;

            let data = state
                .graph
                .remove_node(node)
                .ok_or_else(|| GraphError::NotFound(key.to_string()))?;
            state.vertices.remove(key);
            state.index.remove(key);
            events.push(GraphEvent::VertexRemoved(Vertex {
                key: data.key,
                attrs: data.attrs,
            }));
            events
        };
        debug!(graph = %self.name, key, removed = events.len(), "objects removed");
        Ok(events)
    }

    /// Sets or clears (`None`) one attribute. On edges, `weight` and
    /// `_weight` write the graph weight; any other `_` name is rejected.
    pub fn set_attribute(&self, key: &str, name: &str, value: Option<Value>) -> Result<()> {
        let mut state = self.write();
        if let Some(&edge) = state.edges.get(key) {
            if name == WEIGHT_FIELD || name == WEIGHT_ALIAS {
                let weight = match value {
                    Some(v) => v.as_f64().ok_or_else(|| {
                        GraphError::BadArgument(format!("weight must be numeric: {}", v.index_string()))
                    })?,
                    None => DEFAULT_WEIGHT,
                };
                state.graph[edge].weight = check_weight(weight)?;
            } else {
                check_name(name)?;
                let attrs = &mut state.graph[edge].attrs;
                match value {
                    Some(v) => attrs.insert(name, v),
                    None => attrs.remove(name),
                };
            }
            state.reindex_edge(edge);
        } else {
            check_name(name)?;
            let node = state.vertex_index(key)?;
            let attrs = &mut state.graph[node].attrs;
            match value {
                Some(v) => attrs.insert(name, v),
                None => attrs.remove(name),
            };
            state.reindex_vertex(node);
        }
        Ok(())
    }

    /// Adds `amount` to an edge's weight and returns the new weight.
    pub fn increment_weight(&self, key: &str, amount: f64) -> Result<f64> {
        let mut state = self.write();
        let edge = state
            .edges
            .get(key)
            .copied()
            .ok_or_else(|| GraphError::NotFound(key.to_string()))?;
        let weight = check_weight(state.graph[edge].weight + amount)?;
        state.graph[edge].weight = weight;
        state.reindex_edge(edge);
        Ok(weight)
    }

    pub fn get(&self, key: &str) -> Result<GraphObject> {
        let state = self.read();
        state
            .object(key)
            .ok_or_else(|| GraphError::NotFound(key.to_string()))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.read().index.contains(key)
    }

    pub fn kind_of(&self, key: &str) -> Option<ObjectKind> {
        let state = self.read();
        if state.vertices.contains_key(key) {
            Some(ObjectKind::Vertex)
        } else if state.edges.contains_key(key) {
            Some(ObjectKind::Edge)
        } else {
            None
        }
    }

    /// Keys of objects matching a field query, in key order.
    pub fn query_keys(&self, query: &str) -> Result<Vec<String>> {
        let query = FieldQuery::parse(query)?;
        Ok(self.read().index.search(&query))
    }

    pub fn query(&self, query: &str) -> Result<Vec<GraphObject>> {
        let query = FieldQuery::parse(query)?;
        let state = self.read();
        Ok(state
            .index
            .search(&query)
            .iter()
            .filter_map(|key| state.object(key))
            .collect())
    }

    /// Targets of `key`'s outgoing edges, optionally restricted to one relation.
    pub fn outgoing_neighbors(&self, key: &str, rel: Option<&str>) -> Result<Vec<String>> {
        let state = self.read();
        let node = state.vertex_index(key)?;
        let targets: BTreeSet<String> = state
            .graph
            .edges_directed(node, Direction::Outgoing)
            .filter(|e| rel.map_or(true, |r| e.weight().rel == r))
            .map(|e| state.graph[e.target()].key.clone())
            .collect();
        Ok(targets.into_iter().collect())
    }

    /// Internal representation: adjacency for a vertex, endpoints for an edge.
    pub fn spy(&self, key: &str) -> Result<serde_json::Value> {
        let state = self.read();
        if let Some(&edge) = state.edges.get(key) {
            let (from, to) = state
                .graph
                .edge_endpoints(edge)
                .ok_or_else(|| GraphError::NotFound(key.to_string()))?;
            let data = &state.graph[edge];
            return Ok(json!({
                "key": data.key,
                "edge_index": edge.index(),
                "source": {"key": state.graph[from].key, "node_index": from.index()},
                "target": {"key": state.graph[to].key, "node_index": to.index()},
                "rel": data.rel,
                "weight": data.weight,
                "data": data.attrs.to_json(),
            }));
        }
        let node = state.vertex_index(key)?;
        let adjacency = |dir: Direction| -> Vec<serde_json::Value> {
            state
                .graph
                .edges_directed(node, dir)
                .map(|e| {
                    let other = if dir == Direction::Outgoing { e.target() } else { e.source() };
                    json!({"edge": e.weight().key, "vertex": state.graph[other].key, "rel": e.weight().rel})
                })
                .collect()
        };
        Ok(json!({
            "key": key,
            "node_index": node.index(),
            "data": state.graph[node].attrs.to_json(),
            "outgoing": adjacency(Direction::Outgoing),
            "incoming": adjacency(Direction::Incoming),
        }))
    }

    pub fn vertex_count(&self) -> usize {
        self.read().vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.read().edges.len()
    }

    /// Runs `f` against a consistent read snapshot of the structure.
    pub fn view<R>(&self, f: impl FnOnce(&GraphView<'_>) -> R) -> R {
        let state = self.read();
        let view = GraphView {
            graph: &state.graph,
            vertices: &state.vertices,
        };
        f(&view)
    }
}

impl EngineState {
    fn ensure_free(&self, key: &str) -> Result<()> {
        if self.index.contains(key) {
            return Err(GraphError::AlreadyExists(key.to_string()));
        }
        Ok(())
    }

    fn vertex_index(&self, key: &str) -> Result<NodeIndex> {
        self.vertices
            .get(key)
            .copied()
            .ok_or_else(|| GraphError::NotFound(key.to_string()))
    }

    fn incident_edges(&self, node: NodeIndex) -> Vec<EdgeIndex> {
        let mut seen = BTreeSet::new();
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .chain(self.graph.edges_directed(node, Direction::Incoming))
            .map(|e| e.id())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    fn remove_edge(&mut self, key: &str) -> Result<Edge> {
        let edge = self
            .edges
            .remove(key)
            .ok_or_else(|| GraphError::NotFound(key.to_string()))?;
        let snapshot = self.edge_snapshot(edge);
        self.graph.remove_edge(edge);
        self.index.remove(key);
        Ok(snapshot)
    }

    fn vertex_snapshot(&self, node: NodeIndex) -> Vertex {
        let data = &self.graph[node];
        Vertex {
            key: data.key.clone(),
            attrs: data.attrs.clone(),
        }
    }

    fn edge_snapshot(&self, edge: EdgeIndex) -> Edge {
        let data = &self.graph[edge];
        let (source, target) = self
            .graph
            .edge_endpoints(edge)
            .map(|(s, t)| (self.graph[s].key.clone(), self.graph[t].key.clone()))
            .unwrap_or_default();
        Edge {
            key: data.key.clone(),
            source,
            target,
            rel: data.rel.clone(),
            weight: data.weight,
            attrs: data.attrs.clone(),
        }
    }

    fn object(&self, key: &str) -> Option<GraphObject> {
        if let Some(&node) = self.vertices.get(key) {
            return Some(GraphObject::Vertex(self.vertex_snapshot(node)));
        }
        self.edges
            .get(key)
            .map(|&edge| GraphObject::Edge(self.edge_snapshot(edge)))
    }

    fn reindex_vertex(&mut self, node: NodeIndex) {
        let data = &self.graph[node];
        let mut doc = attribute_document(&data.attrs);
        doc.insert(TYPE_FIELD.into(), VERTEX_TYPE.into());
        let key = data.key.clone();
        self.index.upsert(&key, doc);
    }

    fn reindex_edge(&mut self, edge: EdgeIndex) {
        let snapshot = self.edge_snapshot(edge);
        let mut doc = attribute_document(&snapshot.attrs);
        doc.insert(TYPE_FIELD.into(), EDGE_TYPE.into());
        doc.insert(SOURCE_FIELD.into(), snapshot.source);
        doc.insert(TARGET_FIELD.into(), snapshot.target);
        doc.insert(REL_FIELD.into(), snapshot.rel);
        doc.insert(WEIGHT_FIELD.into(), format_number(snapshot.weight));
        self.index.upsert(&snapshot.key, doc);
    }
}

fn check_weight(weight: f64) -> Result<f64> {
    if weight.is_finite() {
        Ok(weight)
    } else {
        Err(GraphError::BadArgument(format!("weight must be finite: {}", weight)))
    }
}

fn attribute_document(attrs: &AttributeStore) -> Document {
    attrs
        .iter()
        .map(|(k, v)| (k.clone(), v.index_string()))
        .collect()
}

fn check_name(name: &str) -> Result<()> {
    if name.starts_with(RESERVED_PREFIX) {
        return Err(GraphError::ReservedProperty(name.to_string()));
    }
    Ok(())
}

fn check_attrs(attrs: &AttributeStore) -> Result<()> {
    attrs.keys().try_for_each(|k| check_name(k))
}

fn resolve_key(key: Option<&str>) -> Result<String> {
    match key {
        None => Ok(Uuid::new_v4().to_string()),
        Some(k) if k.is_empty() || k.chars().any(char::is_whitespace) => {
            Err(GraphError::BadArgument(format!("invalid key: {:?}", k)))
        }
        Some(k) => Ok(k.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(json: &str) -> AttributeStore {
        AttributeStore::parse(json).unwrap()
    }

    fn triangle() -> GraphEngine {
        let engine = GraphEngine::new("test");
        for k in ["a", "b", "c"] {
            engine.add_vertex(Some(k), attrs("{}")).unwrap();
        }
        engine.add_edge(Some("ab"), "a", "b", "road", 1.0, attrs("{}")).unwrap();
        engine.add_edge(Some("bc"), "b", "c", "road", 2.0, attrs("{}")).unwrap();
        engine.add_edge(Some("ca"), "c", "a", "rail", 3.0, attrs("{}")).unwrap();
        engine
    }

    #[test]
    fn test_read_after_write() -> Result<()> {
        let engine = GraphEngine::new("g");
        engine.add_vertex(Some("a"), attrs(r#"{"city":"mpls"}"#))?;
        assert_eq!(engine.query_keys("_key:a")?, vec!["a"]);
        assert_eq!(engine.query_keys("city:mpls")?, vec!["a"]);

        engine.set_attribute("a", "city", Some(Value::String("duluth".into())))?;
        assert!(engine.query_keys("city:mpls")?.is_empty());
        assert_eq!(engine.query_keys("city:duluth")?, vec!["a"]);

        engine.set_attribute("a", "city", None)?;
        assert!(engine.query_keys("city:*")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_keys_are_unique_across_kinds() -> Result<()> {
        let engine = triangle();
        assert!(matches!(
            engine.add_vertex(Some("ab"), attrs("{}")),
            Err(GraphError::AlreadyExists(_))
        ));
        assert!(matches!(
            engine.add_edge(Some("a"), "a", "b", "x", 1.0, attrs("{}")),
            Err(GraphError::AlreadyExists(_))
        ));
        assert!(matches!(
            engine.add_edge(Some("ax"), "a", "zz", "x", 1.0, attrs("{}")),
            Err(GraphError::NotFound(k)) if k == "zz"
        ));
        let generated = engine.add_vertex(None, attrs("{}"))?;
        assert!(engine.exists(&generated));
        Ok(())
    }

    #[test]
    fn test_vertex_removal_cascades() -> Result<()> {
        let engine = triangle();
        let plan = engine.plan_removal("a")?;
        assert_eq!(plan.vertex.as_ref().map(|v| v.key.as_str()), Some("a"));
        let mut planned: Vec<_> = plan.edges.iter().map(|e| e.key.clone()).collect();
        planned.sort();
        assert_eq!(planned, vec!["ab", "ca"]);

        let events = engine.remove("a")?;
        assert_eq!(events.len(), 3);
        assert!(matches!(events.last(), Some(GraphEvent::VertexRemoved(v)) if v.key == "a"));
        assert!(matches!(engine.get("ab"), Err(GraphError::NotFound(_))));
        assert!(!engine.exists("ca"));
        assert!(engine.query_keys("_type:e")?.iter().all(|k| k == "bc"));
        assert_eq!(engine.vertex_count(), 2);
        assert_eq!(engine.edge_count(), 1);
        Ok(())
    }

    #[test]
    fn test_reserved_names() -> Result<()> {
        let engine = triangle();
        assert!(matches!(
            engine.set_attribute("a", "_type", Some(Value::String("e".into()))),
            Err(GraphError::ReservedProperty(_))
        ));
        assert!(matches!(
            engine.set_attribute("a", "_weight", Some(Value::Number(2.0))),
            Err(GraphError::ReservedProperty(_))
        ));
        assert!(matches!(
            engine.add_vertex(Some("d"), attrs(r#"{"_key":"x"}"#)),
            Err(GraphError::ReservedProperty(_))
        ));

        engine.set_attribute("ab", "weight", Some(Value::Number(3.5)))?;
        match engine.get("ab")? {
            GraphObject::Edge(e) => {
                assert_eq!(e.weight, 3.5);
                assert!(!e.attrs.contains("weight"));
            }
            other => panic!("expected edge, got {:?}", other),
        }
        assert_eq!(engine.query_keys("_weight:3.5")?, vec!["ab"]);
        assert!(matches!(
            engine.set_attribute("ab", "weight", Some(Value::String("heavy".into()))),
            Err(GraphError::BadArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_weights_stay_finite() -> Result<()> {
        let engine = triangle();
        for bad in ["NaN", "inf", "-infinity"] {
            assert!(matches!(
                engine.set_attribute("ab", "weight", Some(Value::String(bad.into()))),
                Err(GraphError::BadArgument(_))
            ));
        }
        assert!(matches!(
            engine.increment_weight("ab", f64::INFINITY),
            Err(GraphError::BadArgument(_))
        ));
        assert!(matches!(
            engine.increment_weight("ab", f64::MAX).and_then(|_| engine.increment_weight("ab", f64::MAX)),
            Err(GraphError::BadArgument(_))
        ));
        assert!(engine.get("ab")?.to_json()["_weight"].as_f64().is_some_and(f64::is_finite));
        Ok(())
    }

    #[test]
    fn test_increment_weight_and_record() -> Result<()> {
        let engine = triangle();
        assert_eq!(engine.increment_weight("bc", 0.5)?, 2.5);
        let record = engine.get("bc")?.to_json();
        assert_eq!(record["_weight"], json!(2.5));
        assert_eq!(record["_source"], json!("b"));
        assert_eq!(record["_rel"], json!("road"));
        assert!(matches!(engine.increment_weight("a", 1.0), Err(GraphError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_outgoing_neighbors_filter() -> Result<()> {
        let engine = triangle();
        engine.add_edge(Some("ac"), "a", "c", "rail", 1.0, attrs("{}"))?;
        assert_eq!(engine.outgoing_neighbors("a", None)?, vec!["b", "c"]);
        assert_eq!(engine.outgoing_neighbors("a", Some("rail"))?, vec!["c"]);
        Ok(())
    }

    #[test]
    fn test_spy_shows_adjacency() -> Result<()> {
        let engine = triangle();
        let spy = engine.spy("b")?;
        assert_eq!(spy["outgoing"][0]["edge"], json!("bc"));
        assert_eq!(spy["incoming"][0]["vertex"], json!("a"));
        assert_eq!(engine.spy("ca")?["target"]["key"], json!("a"));
        Ok(())
    }
}
