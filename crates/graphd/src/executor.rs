//! Per-graph command executor.
//!
//! Every graph-scoped request for one graph goes through a single bounded
//! queue drained by one blocking consumer, which totally orders mutations
//! and queries against that graph. Actor tasks touch the same graph
//! concurrently through its internal locks.
//!
//! A request containing `<<query>>` is expanded against the graph index into
//! one sub-command per matching key, executed inline on this thread. Only
//! non-status lines of the sub-replies reach the client, followed by a single
//! `-batch-ok`. A large batch holds the queue for its whole duration, so other
//! clients of the same graph wait behind it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::algo;
use crate::config::Config;
use crate::error::{GraphError, Result};
use crate::graph::Graph;
use crate::properties::{AttributeStore, Value};
use crate::protocol::{Reply, Request, ResponseSink, Selector, SharedSink, R_BATCH_OK, R_ERR, STATUS_MARKER};
use crate::server::ClientState;
use crate::store::DEFAULT_WEIGHT;

/// One client request bound for a graph executor.
pub struct GraphCommand {
    pub client: Arc<ClientState>,
    pub sink: SharedSink,
    pub line: String,
    /// Fired once the reply has been written.
    pub done: Option<oneshot::Sender<()>>,
}

impl GraphCommand {
    fn finish(mut self, reply: &Reply) {
        if reply.write_to(self.sink.as_ref()).is_err() {
            debug!(client = %self.client.id(), "client went away before its reply");
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

pub enum ExecutorMessage {
    Command(GraphCommand),
    /// Stops the loop. Commands queued before it are handled, commands
    /// queued after it are rejected.
    Shutdown,
}

/// Sending side of a graph's queue.
#[derive(Clone)]
pub struct ExecutorHandle {
    graph_name: String,
    tx: mpsc::Sender<ExecutorMessage>,
}

impl ExecutorHandle {
    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    /// Waits for queue capacity. Fails once the executor has stopped.
    pub async fn submit(&self, command: GraphCommand) -> Result<()> {
        self.tx
            .send(ExecutorMessage::Command(command))
            .await
            .map_err(|_| GraphError::GraphNoLongerExists)
    }

    pub fn shutdown(&self) {
        if self.tx.try_send(ExecutorMessage::Shutdown).is_err() {
            debug!(graph = %self.graph_name, "executor queue full or closed, relying on sender drop");
        }
    }
}

pub struct CommandExecutor {
    graph: Arc<Graph>,
    slow_command: Duration,
}

impl CommandExecutor {
    pub fn new(graph: Arc<Graph>, config: &Config) -> Self {
        Self {
            graph,
            slow_command: Duration::from_millis(config.slow_command_ms),
        }
    }

    /// Starts the consumer on the blocking pool of `runtime`.
    pub fn spawn(self, runtime: &Handle, queue_capacity: usize) -> ExecutorHandle {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let graph_name = self.graph.name().to_string();
        runtime.spawn_blocking(move || self.run(rx));
        ExecutorHandle { graph_name, tx }
    }

    fn run(self, mut rx: mpsc::Receiver<ExecutorMessage>) {
        info!(graph = %self.graph.name(), "executor started");
        while let Some(message) = rx.blocking_recv() {
            let command = match message {
                ExecutorMessage::Command(command) => command,
                ExecutorMessage::Shutdown => {
                    self.reject_remaining(&mut rx, None);
                    break;
                }
            };
            if self.graph.is_closed() {
                self.reject_remaining(&mut rx, Some(command));
                break;
            }
            self.handle(command);
        }
        info!(graph = %self.graph.name(), "executor stopped");
    }

    /// Closes the queue and answers `in_flight` plus everything still queued
    /// with `GRAPH_NO_LONGER_EXISTS`.
    fn reject_remaining(&self, rx: &mut mpsc::Receiver<ExecutorMessage>, in_flight: Option<GraphCommand>) {
        let reply = Reply::error(&GraphError::GraphNoLongerExists);
        rx.close();
        let mut drained = 0;
        if let Some(command) = in_flight {
            command.finish(&reply);
            drained += 1;
        }
        while let Some(message) = rx.blocking_recv() {
            if let ExecutorMessage::Command(command) = message {
                command.finish(&reply);
                drained += 1;
            }
        }
        if drained > 0 {
            warn!(graph = %self.graph.name(), drained, "graph no longer exists, queue drained");
        }
    }

    fn handle(&self, command: GraphCommand) {
        let started = Instant::now();
        let reply = self.execute(&command.line, command.sink.as_ref(), &command.client);
        let elapsed = started.elapsed();
        if elapsed > self.slow_command {
            warn!(
                graph = %self.graph.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                request = %command.line,
                "slow command"
            );
        }
        command.finish(&reply);
    }

    /// Runs one line to completion. Panics become `-err` replies.
    pub fn execute(&self, line: &str, sink: &dyn ResponseSink, client: &ClientState) -> Reply {
        match catch_unwind(AssertUnwindSafe(|| self.run_line(line, sink, client))) {
            Ok(reply) => reply,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "internal error".to_string());
                warn!(graph = %self.graph.name(), request = %line, panic = %message, "command panicked");
                Reply::status(format!("{} {}", R_ERR, message))
            }
        }
    }

    fn run_line(&self, line: &str, sink: &dyn ResponseSink, client: &ClientState) -> Reply {
        if client.selected_graph().as_deref() != Some(self.graph.name()) {
            return Reply::error(&GraphError::RequireUseDb);
        }
        match Selector::find(line) {
            Some(selector) => self.run_batch(&selector, sink, client),
            None => self.run_single(line, client),
        }
    }

    /// Runs one already-expanded line. Selector markers in it are plain text.
    fn run_single(&self, line: &str, client: &ClientState) -> Reply {
        let request = Request::parse(line);
        match self.dispatch(&request, client) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(graph = %self.graph.name(), verb = %request.verb(), error = %e, "command failed");
                Reply::error(&e)
            }
        }
    }

    fn run_batch(&self, selector: &Selector<'_>, sink: &dyn ResponseSink, client: &ClientState) -> Reply {
        let keys = match self.graph.engine().query_keys(selector.query) {
            Ok(keys) => keys,
            Err(e) => return Reply::error(&e),
        };
        debug!(graph = %self.graph.name(), query = %selector.query, matches = keys.len(), "selector batch");
        for key in keys {
            let reply = self.run_single(&selector.expand(&key), client);
            for line in reply.lines.into_iter().filter(|l| !l.starts_with(STATUS_MARKER)) {
                if sink.send_line(line).is_err() {
                    return Reply::status(R_BATCH_OK);
                }
            }
        }
        Reply::status(R_BATCH_OK)
    }

    fn dispatch(&self, req: &Request, client: &ClientState) -> Result<Reply> {
        let graph = &self.graph;
        let engine = graph.engine();
        let reply = match req.verb() {
            "cvert" => {
                let (key, payload) = match req.arg(0) {
                    Some(first) if first.starts_with('{') => (None, req.rest_from(0)),
                    Some(first) => (Some(first), req.rest_from(1)),
                    None => return Err(GraphError::MissingArgument(req.verb().to_string())),
                };
                let attrs = parse_attrs(payload)?;
                let created = engine.add_vertex(key, attrs)?;
                if key.is_none() {
                    Reply::line(created)
                } else {
                    Reply::ok()
                }
            }
            "cedge" => {
                let key = req.require(0)?;
                let (from, to, rel) = (req.require(1)?, req.require(2)?, req.require(3)?);
                let (weight, payload) = match req.arg(4) {
                    None => (DEFAULT_WEIGHT, None),
                    Some(a) if a.starts_with('{') => (DEFAULT_WEIGHT, req.rest_from(4)),
                    Some(_) => (req.parse_f64(4)?, req.rest_from(5)),
                };
                let attrs = parse_attrs(payload)?;
                let key = (key != "-").then_some(key);
                let created = engine.add_edge(key, from, to, rel, weight, attrs)?;
                if key.is_none() {
                    Reply::line(created)
                } else {
                    Reply::ok()
                }
            }
            "set" => {
                let key = req.require(0)?;
                let attr = req.require(1)?;
                let value = req.rest_from(2).map(Value::parse_loose);
                engine.set_attribute(key, attr, value)?;
                Reply::ok()
            }
            "incw" => {
                let key = req.require(0)?;
                let amount = req.parse_f64(1)?;
                engine.increment_weight(key, amount)?;
                Reply::ok()
            }
            "del" => {
                graph.remove_object(req.require(0)?)?;
                Reply::ok()
            }
            "get" => Reply::json(&engine.get(req.require(0)?)?.to_json()),
            "exists" => {
                let key = req.require(0)?;
                Reply::line(format!("{} {}", engine.exists(key), key))
            }
            "spy" => Reply::json(&engine.spy(req.require(0)?)?),
            "q" => {
                let results: Vec<_> = engine
                    .query(req.require_rest(0)?)?
                    .iter()
                    .map(|o| o.to_json())
                    .collect();
                Reply::json(&json!({ "results": results }))
            }
            "qp" | "qsim" => {
                let results = graph.registry().query(req.require_rest(0)?)?;
                Reply::json(&json!({ "results": results }))
            }

            "spath" => {
                let (from, to) = (req.require(0)?, req.require(1)?);
                let radius = req.arg(2).map(|_| req.parse_f64(2)).transpose()?;
                Reply::json(&engine.view(|v| algo::shortest_path(v, from, to, radius))?)
            }
            "kspath" => {
                let (from, to) = (req.require(0)?, req.require(1)?);
                let k = req.parse_usize(2)?;
                let max_hops = req
                    .arg(3)
                    .map(|_| req.parse_usize(3))
                    .transpose()?
                    .filter(|h| *h > 0);
                Reply::json(&engine.view(|v| algo::k_shortest_paths(v, from, to, k, max_hops))?)
            }
            "hc" => Reply::json(&engine.view(algo::hamiltonian_cycle)?),
            "ec" => Reply::json(&engine.view(algo::eulerian_circuit)?),
            "ekmf" => {
                let (source, sink) = (req.require(0)?, req.require(1)?);
                Reply::json(&engine.view(|v| algo::max_flow(v, source, sink))?)
            }
            "cn" => Reply::json(&engine.view(algo::chromatic_number)),
            "kmst" => Reply::json(&engine.view(algo::minimum_spanning_tree)),
            "vcg" => Reply::json(&engine.view(algo::greedy_vertex_cover)),
            "vc2a" => Reply::json(&engine.view(algo::approx_vertex_cover)),
            "csetv" => {
                let key = req.require(0)?;
                Reply::json(&engine.view(|v| algo::connected_set(v, key))?)
            }
            "csets" => Reply::json(&engine.view(algo::connected_sets)),
            "iscon" => Reply::line(engine.view(algo::is_connected).to_string()),
            "upathex" => {
                let (from, to) = (req.require(0)?, req.require(1)?);
                Reply::line(engine.view(|v| algo::path_exists(v, from, to))?.to_string())
            }
            "famc" => Reply::json(&engine.view(|v| algo::maximal_cliques(v, false))),
            "fbmc" => Reply::json(&engine.view(|v| algo::maximal_cliques(v, true))),
            "aspv" => {
                let source = req.arg(0);
                Reply::json(&engine.view(|v| algo::all_pairs_shortest_paths(v, source))?)
            }
            "gcyc" => Reply::json(&engine.view(algo::cycles)),
            "vcyc" => {
                let key = req.require(0)?;
                Reply::json(&engine.view(|v| algo::cycles_through(v, key))?)
            }

            "defudf" => {
                graph.define_udf(req.require(0)?, req.require(1)?, req.require_rest(2)?)?;
                Reply::ok()
            }
            "sproc" => {
                let pid = graph.start_process(req.require(0)?, req.require(1)?, req.arg(2))?;
                Reply::line(pid)
            }
            "kproc" => {
                graph.kill_process(req.require(0)?)?;
                Reply::ok()
            }
            "emit" => {
                let (key, process) = (req.require(0)?, req.require(1)?);
                let msg = serde_json::from_str(req.require_rest(2)?)?;
                graph.emit(key, process, msg)?;
                Reply::ok()
            }

            "cchan" => Reply::line(graph.create_channel(req.require(0)?)?),
            "dchan" => {
                graph.destroy_channel(req.require(0)?)?;
                Reply::ok()
            }
            "publish" => {
                let channel = req.require(0)?;
                let msg = serde_json::from_str(req.require_rest(1)?)?;
                graph.publish(channel, msg)?;
                Reply::ok()
            }
            "subscribe" => {
                graph.subscribe(req.require(0)?, client.endpoint())?;
                Reply::ok()
            }
            "unsubscribe" => {
                graph.unsubscribe(req.require(0)?, client.endpoint().id())?;
                Reply::ok()
            }

            other => return Err(GraphError::UnknownVerb(other.to_string())),
        };
        Ok(reply)
    }
}

fn parse_attrs(payload: Option<&str>) -> Result<AttributeStore> {
    match payload {
        Some(raw) => AttributeStore::parse(raw),
        None => Ok(AttributeStore::new()),
    }
}
