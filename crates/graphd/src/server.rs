//! Process-wide server state and per-connection sessions.
//!
//! [`ServerState`] owns the graph namespace, one executor per graph and the
//! client registry. A [`Session`] is one connection: it answers the verbs that
//! need no graph itself and forwards everything else to the executor of the
//! client's selected graph, waiting until the reply has been written.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{GraphError, Result};
use crate::executor::{CommandExecutor, ExecutorHandle, GraphCommand};
use crate::graph::Graph;
use crate::process::{
    EndpointChannel, InboundChannel, InboundEndpoint, ProcessContext, ProcessGroup, ProcessRegistry,
    ProcessTarget, UdfRuntime,
};
use crate::protocol::{Reply, Request, SharedSink, R_OK};
use crate::store::{
    EDGE_TYPE, KEY_FIELD, REL_FIELD, SOURCE_FIELD, TARGET_FIELD, TYPE_FIELD, VERTEX_TYPE, WEIGHT_FIELD,
};

/// Client-state key holding the selected graph.
pub const ST_DB: &str = "cur_db";
/// Client-state key holding the connection name.
pub const ST_NAMECON: &str = "name_con";
pub const DEFAULT_CONNECTION_NAME: &str = "client";

/// Per-connection state shared with the executors.
pub struct ClientState {
    id: String,
    values: DashMap<String, String>,
    endpoint: Arc<dyn EndpointChannel>,
}

impl ClientState {
    pub fn new(id: &str, endpoint: Arc<dyn EndpointChannel>) -> Self {
        let values = DashMap::new();
        values.insert(ST_NAMECON.to_string(), format!("{}-{}", DEFAULT_CONNECTION_NAME, id));
        Self {
            id: id.to_string(),
            values,
            endpoint,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn selected_graph(&self) -> Option<String> {
        self.get(ST_DB)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Where channels deliver this client's events.
    pub fn endpoint(&self) -> Arc<dyn EndpointChannel> {
        Arc::clone(&self.endpoint)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), json!(e.value())))
            .collect();
        serde_json::Value::Object(map)
    }
}

struct GraphSlot {
    graph: Arc<Graph>,
    executor: ExecutorHandle,
}

pub struct ServerState {
    config: Config,
    runtime: Handle,
    udf_runtime: Option<Arc<dyn UdfRuntime>>,
    graphs: RwLock<HashMap<String, GraphSlot>>,
    clients: DashMap<String, Arc<ClientState>>,
    inbound: Arc<ProcessGroup>,
    next_client_id: AtomicU64,
}

impl ServerState {
    pub fn new(config: Config, runtime: Handle) -> Arc<Self> {
        Self::with_udf_runtime(config, runtime, None)
    }

    pub fn with_udf_runtime(
        config: Config,
        runtime: Handle,
        udf_runtime: Option<Arc<dyn UdfRuntime>>,
    ) -> Arc<Self> {
        let inbound = ProcessGroup::new(
            "inbound",
            "",
            runtime.clone(),
            config.inbound_capacity,
            Arc::new(ProcessRegistry::new()),
        );
        Arc::new(Self {
            config,
            runtime,
            udf_runtime,
            graphs: RwLock::new(HashMap::new()),
            clients: DashMap::new(),
            inbound,
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, GraphSlot>> {
        self.graphs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, GraphSlot>> {
        self.graphs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a graph and starts its executor.
    pub fn create_graph(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(GraphError::MissingArgument("create".to_string()));
        }
        let mut graphs = self.write();
        if graphs.contains_key(name) {
            return Err(GraphError::DbAlreadyExists(name.to_string()));
        }
        let graph = Graph::new(name, self.runtime.clone(), &self.config, self.udf_runtime.clone());
        let executor = CommandExecutor::new(Arc::clone(&graph), &self.config)
            .spawn(&self.runtime, self.config.command_queue_capacity);
        graphs.insert(name.to_string(), GraphSlot { graph, executor });
        info!(graph = %name, "graph created");
        Ok(())
    }

    /// Removes a graph. Its actors die immediately; its executor rejects
    /// whatever is still queued and stops.
    pub fn drop_graph(&self, name: &str) -> Result<()> {
        let slot = self
            .write()
            .remove(name)
            .ok_or_else(|| GraphError::DbNotExist(name.to_string()))?;
        slot.graph.close();
        slot.executor.shutdown();
        info!(graph = %name, "graph dropped");
        Ok(())
    }

    pub fn graph(&self, name: &str) -> Option<Arc<Graph>> {
        self.read().get(name).map(|slot| Arc::clone(&slot.graph))
    }

    fn executor(&self, name: &str) -> Option<ExecutorHandle> {
        self.read().get(name).map(|slot| slot.executor.clone())
    }

    pub fn graph_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn graphs_snapshot(&self) -> Vec<Arc<Graph>> {
        self.read().values().map(|slot| Arc::clone(&slot.graph)).collect()
    }
}

/// What the connection should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    state: Arc<ServerState>,
    client: Arc<ClientState>,
    sink: SharedSink,
    inbound_name: String,
    closed: bool,
}

impl Session {
    /// Registers a client, starts its inbound channel actor and writes the
    /// greeting line.
    pub fn open(state: &Arc<ServerState>, sink: SharedSink) -> Result<Session> {
        let id = state.next_client_id.fetch_add(1, Ordering::Relaxed).to_string();
        let inbound_name = format!("inbound-{}", id);
        let ctx = ProcessContext::new(
            uuid::Uuid::new_v4().to_string(),
            &inbound_name,
            "inbound",
            ProcessTarget::Channel(inbound_name.clone()),
            std::sync::Weak::new(),
        );
        state
            .inbound
            .start(ctx, Box::new(InboundChannel::new(Arc::clone(&sink))))?;

        let endpoint = Arc::new(InboundEndpoint::new(&inbound_name, &state.inbound));
        let client = Arc::new(ClientState::new(&id, endpoint));
        state.clients.insert(id.clone(), Arc::clone(&client));

        if sink
            .send_line(format!("{} {}", state.config.server_name, id))
            .is_err()
        {
            debug!(client = %id, "client gone before greeting");
        }
        info!(client = %id, "client connected");
        Ok(Session {
            state: Arc::clone(state),
            client,
            sink,
            inbound_name,
            closed: false,
        })
    }

    pub fn client_id(&self) -> &str {
        self.client.id()
    }

    pub fn client(&self) -> &Arc<ClientState> {
        &self.client
    }

    /// Handles one request line. Returns after its reply has been written.
    pub async fn handle_line(&mut self, line: &str) -> Flow {
        let request = Request::parse(line);
        let local = match request.verb() {
            "" => Some(Ok(Reply::ok())),
            "bye" => {
                self.send(&Reply::ok());
                return Flow::Close;
            }
            "namecon" => Some(self.name_connection(&request)),
            "clstate" => Some(Ok(Reply::json(&self.client.to_json()))),
            "sstat" => Some(Ok(Reply::json(&server_names()))),
            "listg" => Some(Ok(Reply {
                lines: self.state.graph_names(),
                status: R_OK.to_string(),
            })),
            "gstat" => Some(self.graph_stats(&request)),
            "create" => Some(
                request
                    .require(0)
                    .and_then(|name| self.state.create_graph(name))
                    .map(|()| Reply::ok()),
            ),
            "drop" => Some(
                request
                    .require(0)
                    .and_then(|name| self.state.drop_graph(name))
                    .map(|()| Reply::ok()),
            ),
            "use" => Some(self.use_graph(&request)),
            _ => None,
        };

        match local {
            Some(result) => {
                let reply = result.unwrap_or_else(|e| Reply::error(&e));
                self.send(&reply);
            }
            None => self.forward(line).await,
        }
        Flow::Continue
    }

    fn send(&self, reply: &Reply) {
        if reply.write_to(self.sink.as_ref()).is_err() {
            debug!(client = %self.client.id(), "client sink closed");
        }
    }

    fn name_connection(&self, request: &Request) -> Result<Reply> {
        let name = format!("{}-{}", request.require(0)?, self.client.id());
        self.client.set(ST_NAMECON, name.clone());
        Ok(Reply::line(name))
    }

    fn graph_stats(&self, request: &Request) -> Result<Reply> {
        let graph = self
            .state
            .graph(request.require(0)?)
            .ok_or(GraphError::NotExist)?;
        Ok(Reply::json(&graph.stats()))
    }

    fn use_graph(&self, request: &Request) -> Result<Reply> {
        let name = request.require(0)?;
        if self.state.graph(name).is_none() {
            return Err(GraphError::DbNotExist(name.to_string()));
        }
        self.client.set(ST_DB, name);
        Ok(Reply::ok())
    }

    async fn forward(&self, line: &str) {
        let Some(graph_name) = self.client.selected_graph() else {
            self.send(&Reply::error(&GraphError::RequireUseDb));
            return;
        };
        let Some(executor) = self.state.executor(&graph_name) else {
            self.send(&Reply::error(&GraphError::GraphNoLongerExists));
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        let command = GraphCommand {
            client: Arc::clone(&self.client),
            sink: Arc::clone(&self.sink),
            line: line.to_string(),
            done: Some(done_tx),
        };
        if let Err(e) = executor.submit(command).await {
            self.send(&Reply::error(&e));
            return;
        }
        if done_rx.await.is_err() {
            warn!(client = %self.client.id(), graph = %graph_name, "executor dropped a command without replying");
        }
    }

    /// Kills the client's inbound actor and removes every subscription and
    /// the client state. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let endpoint_id = self.client.endpoint().id().to_string();
        for graph in self.state.graphs_snapshot() {
            graph.unsubscribe_all(&endpoint_id);
        }
        if let Err(e) = self.state.inbound.kill(&self.inbound_name) {
            debug!(client = %self.client.id(), error = %e, "inbound channel already stopped");
        }
        self.state.clients.remove(self.client.id());
        info!(client = %self.client.id(), "client disconnected");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn server_names() -> serde_json::Value {
    json!({
        "names": {
            "TYPE_FIELD": TYPE_FIELD,
            "KEY_FIELD": KEY_FIELD,
            "WEIGHT_FIELD": WEIGHT_FIELD,
            "EDGE_SOURCE_FIELD": SOURCE_FIELD,
            "EDGE_TARGET_FIELD": TARGET_FIELD,
            "RELATION_FIELD": REL_FIELD,
            "VERTEX_TYPE": VERTEX_TYPE,
            "EDGE_TYPE": EDGE_TYPE,
        }
    })
}
