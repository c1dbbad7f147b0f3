//! One named graph: the store, its process registry, its actor groups and
//! channels, plus the closed flag its executor checks before every command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{GraphError, ProcessError, Result};
use crate::process::channel::{EndpointChannel, Subscribers};
use crate::process::flood::FLOOD_FN;
use crate::process::{
    ChannelProcess, FloodProcess, Process, ProcessContext, ProcessEntry, ProcessGroup, ProcessRegistry,
    ProcessTarget, ScriptProcess, UdfDef, UdfRuntime,
};
use crate::store::{
    GraphEngine, GraphEvent, ObjectKind, CHANNEL_TYPE, EDGE_TYPE, GRAPH_TYPE, PROCESS_TYPE, VERTEX_TYPE,
};

pub const BUILTIN_UDF: &str = "builtin";
pub const SCRIPT_UDF_TYPES: [&str; 2] = ["js", "javascript"];

pub struct Graph {
    engine: GraphEngine,
    registry: Arc<ProcessRegistry>,
    graph_processes: Arc<ProcessGroup>,
    vertex_processes: Arc<ProcessGroup>,
    edge_processes: Arc<ProcessGroup>,
    channel_processes: Arc<ProcessGroup>,
    channels: DashMap<String, Subscribers>,
    udf_runtime: Option<Arc<dyn UdfRuntime>>,
    closed: AtomicBool,
    me: Weak<Graph>,
}

impl Graph {
    pub fn new(
        name: &str,
        runtime: Handle,
        config: &Config,
        udf_runtime: Option<Arc<dyn UdfRuntime>>,
    ) -> Arc<Self> {
        let registry = Arc::new(ProcessRegistry::new());
        let group = |label| {
            ProcessGroup::new(
                label,
                name,
                runtime.clone(),
                config.mailbox_capacity,
                Arc::clone(&registry),
            )
        };
        let graph_processes = group("graph_processes");
        let vertex_processes = group("vertex_processes");
        let edge_processes = group("edge_processes");
        let channel_processes = group("channel_processes");

        Arc::new_cyclic(|me| Graph {
            engine: GraphEngine::new(name),
            registry,
            graph_processes,
            vertex_processes,
            edge_processes,
            channel_processes,
            channels: DashMap::new(),
            udf_runtime,
            closed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn engine(&self) -> &GraphEngine {
        &self.engine
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the graph dropped and tears down every actor and channel.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let killed: usize = self.groups().iter().map(|g| g.kill_all()).sum();
        self.channels.clear();
        info!(graph = %self.name(), killed, "graph closed");
    }

    fn groups(&self) -> [&Arc<ProcessGroup>; 4] {
        [
            &self.graph_processes,
            &self.vertex_processes,
            &self.edge_processes,
            &self.channel_processes,
        ]
    }

    fn group_for_type(&self, obj_type: &str) -> Option<&Arc<ProcessGroup>> {
        match obj_type {
            GRAPH_TYPE => Some(&self.graph_processes),
            VERTEX_TYPE => Some(&self.vertex_processes),
            EDGE_TYPE => Some(&self.edge_processes),
            CHANNEL_TYPE => Some(&self.channel_processes),
            _ => None,
        }
    }

    /// Deletes a vertex (with its incident edges) or an edge, running the
    /// removal hooks of bound actors and killing them afterwards.
    pub fn remove_object(&self, key: &str) -> Result<()> {
        let plan = self.engine.plan_removal(key)?;
        for edge in &plan.edges {
            for name in self.edge_processes.names_bound_to(&edge.key) {
                self.edge_processes
                    .notify(&name, |p, ctx| p.before_remove_edge(ctx, edge));
            }
        }
        if let Some(vertex) = &plan.vertex {
            for name in self.vertex_processes.names_bound_to(&vertex.key) {
                self.vertex_processes
                    .notify(&name, |p, ctx| p.before_remove_vertex(ctx, vertex));
            }
        }

        let events = self.engine.remove(key)?;

        for event in &events {
            if let GraphEvent::EdgeRemoved(edge) = event {
                for name in self.edge_processes.names_bound_to(&edge.key) {
                    self.edge_processes
                        .notify(&name, |p, ctx| p.after_remove_edge(ctx, edge));
                }
            }
        }
        for event in &events {
            let (group, key) = match event {
                GraphEvent::EdgeRemoved(edge) => (&self.edge_processes, &edge.key),
                GraphEvent::VertexRemoved(vertex) => (&self.vertex_processes, &vertex.key),
            };
            for name in group.names_bound_to(key) {
                if group.kill(&name).is_ok() {
                    debug!(graph = %self.name(), process = %name, "killed with its object");
                }
            }
        }
        Ok(())
    }

    pub fn define_udf(&self, key: &str, udf_type: &str, source: &str) -> Result<()> {
        let known = udf_type == BUILTIN_UDF || SCRIPT_UDF_TYPES.contains(&udf_type);
        if !known {
            return Err(GraphError::BadArgument(format!("unknown udf type: {}", udf_type)));
        }
        self.registry.define_udf(key, udf_type, source);
        info!(graph = %self.name(), udf = %key, udf_type, "udf defined");
        Ok(())
    }

    /// Starts the UDF `udf_key` as `<obj_key>-<process_name>` on a vertex,
    /// an edge or the graph itself. Returns the new pid.
    pub fn start_process(&self, obj_key: &str, udf_key: &str, process_name: Option<&str>) -> Result<String> {
        let process_name = process_name.unwrap_or(udf_key);
        let target = match self.engine.kind_of(obj_key) {
            Some(ObjectKind::Vertex) => ProcessTarget::Vertex(obj_key.to_string()),
            Some(ObjectKind::Edge) => ProcessTarget::Edge(obj_key.to_string()),
            None if obj_key == self.name() => ProcessTarget::Graph(obj_key.to_string()),
            None => return Err(GraphError::NotFound(obj_key.to_string())),
        };
        let udf = self
            .registry
            .udf(udf_key)
            .ok_or_else(|| GraphError::NotFound(udf_key.to_string()))?;

        let group = self
            .group_for_type(target.object_type())
            .ok_or_else(|| GraphError::Internal(format!("no group for {}", target.object_type())))?;
        let name = format!("{}-{}", obj_key, process_name);
        if group.contains(&name) {
            return Err(ProcessError::AlreadyRunning(name).into());
        }

        let pid = Uuid::new_v4().to_string();
        let ctx = ProcessContext::new(&pid, name, process_name, target, self.me.clone());
        let handler = self.instantiate(&udf, &ctx)?;
        self.registry.register_process(&ctx, udf_key);
        if let Err(e) = group.start(ctx, handler) {
            self.registry.deregister(&pid);
            return Err(e.into());
        }
        Ok(pid)
    }

    fn instantiate(&self, udf: &UdfDef, ctx: &ProcessContext) -> Result<Box<dyn Process>> {
        match udf.udf_type.as_str() {
            BUILTIN_UDF => match udf.source.as_str() {
                FLOOD_FN => Ok(Box::new(FloodProcess::new())),
                other => Err(GraphError::BadArgument(format!("unknown builtin: {}", other))),
            },
            t if SCRIPT_UDF_TYPES.contains(&t) => {
                let runtime = self
                    .udf_runtime
                    .clone()
                    .ok_or_else(|| ProcessError::Udf("no udf runtime configured".to_string()))?;
                Ok(Box::new(ScriptProcess::start(runtime, udf, ctx)?))
            }
            other => Err(GraphError::BadArgument(format!("unknown udf type: {}", other))),
        }
    }

    /// Kills the process registered as `instance_name`.
    pub fn kill_process(&self, instance_name: &str) -> Result<()> {
        let entry = self
            .registry
            .lookup(instance_name)
            .ok_or_else(|| ProcessError::NotRunning(instance_name.to_string()))?;
        self.entry_group(&entry)?.kill(&entry.instance_name)?;
        Ok(())
    }

    fn entry_group(&self, entry: &ProcessEntry) -> Result<&Arc<ProcessGroup>> {
        self.group_for_type(&entry.obj_type)
            .ok_or_else(|| GraphError::Internal(format!("unknown object type {}", entry.obj_type)))
    }

    /// Sends `msg` to the process `<key>-<process_name>`.
    pub fn emit(&self, key: &str, process_name: &str, msg: Value) -> Result<()> {
        let name = format!("{}-{}", key, process_name);
        let entry = self
            .registry
            .lookup(&name)
            .ok_or(ProcessError::NotRunning(name))?;
        self.entry_group(&entry)?.publish(&entry.instance_name, msg)?;
        Ok(())
    }

    /// Sends `msg` to every registered process or channel matching `query`.
    /// Returns how many accepted it.
    pub fn emit_by_query(&self, query: &str, msg: Value) -> Result<usize> {
        let mut delivered = 0;
        for entry in self.registry.entries(query)? {
            let result = self
                .entry_group(&entry)
                .and_then(|group| Ok(group.publish(&entry.instance_name, msg.clone())?));
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(graph = %self.name(), process = %entry.instance_name, error = %e, "emit failed"),
            }
        }
        Ok(delivered)
    }

    pub fn create_channel(&self, name: &str) -> Result<String> {
        if self.channels.contains_key(name) {
            return Err(GraphError::AlreadyExists(name.to_string()));
        }
        let pid = Uuid::new_v4().to_string();
        let (process, subscribers) = ChannelProcess::new(name);
        let ctx = ProcessContext::new(
            &pid,
            name,
            name,
            ProcessTarget::Channel(name.to_string()),
            self.me.clone(),
        );
        self.channel_processes
            .start(ctx, Box::new(process))
            .map_err(|e| match e {
                ProcessError::AlreadyRunning(n) => GraphError::AlreadyExists(n),
                other => other.into(),
            })?;
        self.registry.register_channel(&pid, name);
        self.channels.insert(name.to_string(), subscribers);
        info!(graph = %self.name(), channel = %name, pid = %pid, "channel created");
        Ok(pid)
    }

    pub fn destroy_channel(&self, name: &str) -> Result<()> {
        if self.channels.remove(name).is_none() {
            return Err(GraphError::NotFound(name.to_string()));
        }
        if let Err(e) = self.channel_processes.kill(name) {
            debug!(graph = %self.name(), channel = %name, error = %e, "channel actor already gone");
        }
        Ok(())
    }

    /// Queues `msg` for fan-out on `channel`.
    pub fn publish(&self, channel: &str, msg: Value) -> Result<()> {
        if !self.channels.contains_key(channel) {
            return Err(GraphError::NotFound(channel.to_string()));
        }
        self.channel_processes.publish(channel, msg)?;
        Ok(())
    }

    pub fn subscribe(&self, channel: &str, endpoint: Arc<dyn EndpointChannel>) -> Result<()> {
        let subscribers = self
            .channels
            .get(channel)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| GraphError::NotFound(channel.to_string()))?;
        subscribers.insert(endpoint.id().to_string(), endpoint);
        Ok(())
    }

    pub fn unsubscribe(&self, channel: &str, endpoint_id: &str) -> Result<()> {
        let subscribers = self
            .channels
            .get(channel)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| GraphError::NotFound(channel.to_string()))?;
        subscribers.remove(endpoint_id);
        Ok(())
    }

    /// Removes `endpoint_id` from every channel of this graph.
    pub fn unsubscribe_all(&self, endpoint_id: &str) {
        for entry in self.channels.iter() {
            entry.value().remove(endpoint_id);
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> Option<usize> {
        self.channels.get(channel).map(|s| s.len())
    }

    pub fn stats(&self) -> Value {
        json!({
            "vertex_count": self.engine.vertex_count(),
            "edge_count": self.engine.edge_count(),
            "process_count": self.registry.count(PROCESS_TYPE),
            "channel_count": self.channels.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::AttributeStore;
    use crate::store::Vertex;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn graph() -> Arc<Graph> {
        Graph::new("g", Handle::current(), &Config::default(), None)
    }

    fn vertex(g: &Graph, key: &str) {
        g.engine().add_vertex(Some(key), AttributeStore::new()).unwrap();
    }

    struct Watcher {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Process for Watcher {
        fn message(&mut self, _ctx: &ProcessContext, _msg: Value) -> Result<(), ProcessError> {
            Ok(())
        }

        fn before_kill(&mut self, ctx: &ProcessContext) -> Result<(), ProcessError> {
            self.log.lock().unwrap().push(format!("kill {}", ctx.name));
            Ok(())
        }

        fn before_remove_vertex(&mut self, _ctx: &ProcessContext, vertex: &Vertex) -> Result<(), ProcessError> {
            self.log.lock().unwrap().push(format!("vertex {}", vertex.key));
            Ok(())
        }

        fn before_remove_edge(&mut self, _ctx: &ProcessContext, edge: &crate::store::Edge) -> Result<(), ProcessError> {
            self.log.lock().unwrap().push(format!("before edge {}", edge.key));
            Ok(())
        }

        fn after_remove_edge(&mut self, _ctx: &ProcessContext, edge: &crate::store::Edge) -> Result<(), ProcessError> {
            self.log.lock().unwrap().push(format!("after edge {}", edge.key));
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cascade_runs_hooks_then_kills() {
        let g = graph();
        vertex(&g, "a");
        vertex(&g, "b");
        g.engine()
            .add_edge(Some("e1"), "a", "b", "r", 1.0, AttributeStore::new())
            .unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let start = |group: &Arc<ProcessGroup>, target: ProcessTarget| {
            let name = format!("{}-watch", target.key());
            group
                .start(
                    ProcessContext::new(Uuid::new_v4().to_string(), name, "watch", target, Weak::new()),
                    Box::new(Watcher { log: Arc::clone(&log) }),
                )
                .unwrap();
        };
        start(&g.vertex_processes, ProcessTarget::Vertex("a".into()));
        start(&g.edge_processes, ProcessTarget::Edge("e1".into()));

        g.remove_object("a").unwrap();

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "before edge e1",
                "vertex a",
                "after edge e1",
                "kill e1-watch",
                "kill a-watch",
            ]
        );
        assert!(g.vertex_processes.is_empty());
        assert!(g.edge_processes.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_process_validation() {
        let g = graph();
        vertex(&g, "a");
        assert!(matches!(
            g.start_process("a", "nope", None),
            Err(GraphError::NotFound(_))
        ));
        g.define_udf("flood", BUILTIN_UDF, FLOOD_FN).unwrap();
        assert!(matches!(
            g.start_process("zz", "flood", None),
            Err(GraphError::NotFound(_))
        ));
        let pid = g.start_process("a", "flood", None).unwrap();
        assert_eq!(g.registry().lookup("a-flood").unwrap().pid, pid);
        assert!(matches!(
            g.start_process("a", "flood", None),
            Err(GraphError::Process(ProcessError::AlreadyRunning(_)))
        ));

        g.define_udf("script", "js", "function f() {}").unwrap();
        assert!(matches!(
            g.start_process("a", "script", None),
            Err(GraphError::Process(ProcessError::Udf(_)))
        ));
        assert!(g.define_udf("x", "lua", "").is_err());

        g.kill_process("a-flood").unwrap();
        assert!(g.registry().lookup("a-flood").is_none());
        assert!(g.kill_process("a-flood").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_flood_reaches_reply_channel() {
        let g = graph();
        for key in ["a", "b", "c"] {
            vertex(&g, key);
        }
        g.engine().add_edge(Some("ab"), "a", "b", "r", 1.0, AttributeStore::new()).unwrap();
        g.engine().add_edge(Some("bc"), "b", "c", "r", 1.0, AttributeStore::new()).unwrap();
        g.define_udf("flood", BUILTIN_UDF, FLOOD_FN).unwrap();
        for key in ["a", "b", "c"] {
            g.start_process(key, "flood", None).unwrap();
        }

        g.create_channel("done").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        g.subscribe("done", Arc::new(Sink { tx })).unwrap();

        g.emit("a", "flood", json!({"reply_to": "done"})).unwrap();
        let envelope = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(envelope, json!({"from": "done", "msg": {"path": ["a", "b", "c"]}}));
    }

    struct Sink {
        tx: mpsc::UnboundedSender<Value>,
    }

    impl EndpointChannel for Sink {
        fn id(&self) -> &str {
            "sink"
        }

        fn deliver(&self, envelope: &Value) -> Result<(), ProcessError> {
            self.tx
                .send(envelope.clone())
                .map_err(|_| ProcessError::NotRunning("sink".into()))
        }
    }

    struct Recorder {
        seen: mpsc::UnboundedSender<(String, Value)>,
    }

    impl Process for Recorder {
        fn message(&mut self, ctx: &ProcessContext, msg: Value) -> Result<(), ProcessError> {
            let _ = self.seen.send((ctx.name.clone(), msg));
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_emit_by_query_routes_by_object_type() {
        let g = graph();
        vertex(&g, "a");
        vertex(&g, "b");
        g.engine()
            .add_edge(Some("ab"), "a", "b", "r", 1.0, AttributeStore::new())
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let targets = [
            (&g.graph_processes, ProcessTarget::Graph("g".into())),
            (&g.vertex_processes, ProcessTarget::Vertex("a".into())),
            (&g.edge_processes, ProcessTarget::Edge("ab".into())),
        ];
        for (group, target) in targets {
            let name = format!("{}-rec", target.key());
            let ctx = ProcessContext::new(Uuid::new_v4().to_string(), name, "rec", target, g.me.clone());
            g.registry.register_process(&ctx, "rec");
            group.start(ctx, Box::new(Recorder { seen: tx.clone() })).unwrap();
        }
        g.create_channel("news").unwrap();
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        g.subscribe("news", Arc::new(Sink { tx: sink_tx })).unwrap();

        assert_eq!(g.emit_by_query("_type:p process_name:rec", json!(1)).unwrap(), 3);
        let mut names = Vec::new();
        for _ in 0..3 {
            let (name, msg) = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            assert_eq!(msg, json!(1));
            names.push(name);
        }
        names.sort();
        assert_eq!(names, vec!["a-rec", "ab-rec", "g-rec"]);

        assert_eq!(g.emit_by_query("obj_type:e", json!(2)).unwrap(), 1);
        let (name, _) = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(name, "ab-rec");

        assert_eq!(g.emit_by_query("_type:c name:news", json!({"x": 3})).unwrap(), 1);
        let envelope = timeout(Duration::from_secs(5), sink_rx.recv()).await.unwrap().unwrap();
        assert_eq!(envelope, json!({"from": "news", "msg": {"x": 3}}));

        assert_eq!(g.emit_by_query("_type:p process_name:nobody", json!(4)).unwrap(), 0);
        assert!(g.emit_by_query("OR", json!(5)).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_channel_lifecycle() {
        let g = graph();
        g.create_channel("c1").unwrap();
        assert!(matches!(g.create_channel("c1"), Err(GraphError::AlreadyExists(_))));
        assert_eq!(g.registry().entries("_type:c").unwrap().len(), 1);
        assert!(matches!(g.publish("nope", json!({})), Err(GraphError::NotFound(_))));

        let (tx, _rx) = mpsc::unbounded_channel();
        g.subscribe("c1", Arc::new(Sink { tx })).unwrap();
        assert_eq!(g.subscriber_count("c1"), Some(1));
        g.unsubscribe_all("sink");
        assert_eq!(g.subscriber_count("c1"), Some(0));

        g.destroy_channel("c1").unwrap();
        assert!(g.registry().entries("_type:c").unwrap().is_empty());
        assert!(matches!(g.destroy_channel("c1"), Err(GraphError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_kills_everything() {
        let g = graph();
        vertex(&g, "a");
        g.define_udf("flood", BUILTIN_UDF, FLOOD_FN).unwrap();
        g.start_process("a", "flood", None).unwrap();
        g.create_channel("c1").unwrap();
        g.close();
        assert!(g.is_closed());
        assert_eq!(g.stats()["process_count"], 0);
        assert_eq!(g.stats()["channel_count"], 0);
    }
}
