//! Actor runtime: named processes with private FIFO mailboxes.
//!
//! A [`ProcessGroup`] owns the actors bound to one kind of context (the graph
//! itself, vertices, edges, channels). Each actor is a tokio task draining a
//! bounded mailbox into its [`Process`] handler, one message at a time.
//!
//! ```text
//! publish ──try_send──▶ mailbox (bounded) ──▶ actor task ──▶ Process::message
//!                                                │ Err / panic
//!                                                ▼
//!                                   log + kill itself (group entry, registry doc)
//! ```
//!
//! Handlers are synchronous and guarded by a mutex so lifecycle hooks can be
//! run from the caller's thread (`kill`, cascade removal) while the task is
//! idle. There is no ordering between different actors.

pub mod channel;
pub mod flood;
pub mod registry;
pub mod script;

use std::any::Any;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ProcessError;
use crate::graph::Graph;
use crate::store::{Edge, Vertex, CHANNEL_TYPE, EDGE_TYPE, GRAPH_TYPE, VERTEX_TYPE};

pub use channel::{ChannelProcess, EndpointChannel, InboundChannel, InboundEndpoint, Subscribers};
pub use flood::FloodProcess;
pub use registry::{ProcessEntry, ProcessRegistry, UdfDef};
pub use script::{ScriptProcess, UdfRuntime};

/// Behaviour of one actor. Only `message` is required; hooks default to no-ops.
pub trait Process: Send + 'static {
    fn message(&mut self, ctx: &ProcessContext, msg: Value) -> Result<(), ProcessError>;

    fn before_kill(&mut self, _ctx: &ProcessContext) -> Result<(), ProcessError> {
        Ok(())
    }

    fn before_remove_vertex(&mut self, _ctx: &ProcessContext, _vertex: &Vertex) -> Result<(), ProcessError> {
        Ok(())
    }

    fn before_remove_edge(&mut self, _ctx: &ProcessContext, _edge: &Edge) -> Result<(), ProcessError> {
        Ok(())
    }

    fn after_remove_edge(&mut self, _ctx: &ProcessContext, _edge: &Edge) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// The object an actor is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessTarget {
    Graph(String),
    Vertex(String),
    Edge(String),
    Channel(String),
}

impl ProcessTarget {
    pub fn key(&self) -> &str {
        match self {
            ProcessTarget::Graph(k)
            | ProcessTarget::Vertex(k)
            | ProcessTarget::Edge(k)
            | ProcessTarget::Channel(k) => k,
        }
    }

    pub fn object_type(&self) -> &'static str {
        match self {
            ProcessTarget::Graph(_) => GRAPH_TYPE,
            ProcessTarget::Vertex(_) => VERTEX_TYPE,
            ProcessTarget::Edge(_) => EDGE_TYPE,
            ProcessTarget::Channel(_) => CHANNEL_TYPE,
        }
    }
}

/// Identity of a running actor plus a handle back to its graph.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub pid: String,
    /// Unique within the group, conventionally `<key>-<process_name>`.
    pub name: String,
    pub process_name: String,
    pub target: ProcessTarget,
    graph: Weak<Graph>,
}

impl ProcessContext {
    pub fn new(
        pid: impl Into<String>,
        name: impl Into<String>,
        process_name: impl Into<String>,
        target: ProcessTarget,
        graph: Weak<Graph>,
    ) -> Self {
        Self {
            pid: pid.into(),
            name: name.into(),
            process_name: process_name.into(),
            target,
            graph,
        }
    }

    pub fn graph(&self) -> Result<Arc<Graph>, ProcessError> {
        self.graph
            .upgrade()
            .ok_or_else(|| ProcessError::Handler(format!("graph of {} is gone", self.name)))
    }

    /// Sends to the actor `<key>-<process_name>` in the same graph.
    pub fn emit(&self, key: &str, process_name: &str, msg: Value) -> Result<(), ProcessError> {
        Ok(self.graph()?.emit(key, process_name, msg)?)
    }

    pub fn emit_by_query(&self, query: &str, msg: Value) -> Result<usize, ProcessError> {
        Ok(self.graph()?.emit_by_query(query, msg)?)
    }

    pub fn publish(&self, channel: &str, msg: Value) -> Result<(), ProcessError> {
        Ok(self.graph()?.publish(channel, msg)?)
    }
}

type SharedHandler = Arc<Mutex<Box<dyn Process>>>;

#[derive(Clone)]
struct ActorHandle {
    pid: String,
    tx: mpsc::Sender<Value>,
    handler: SharedHandler,
    ctx: Arc<ProcessContext>,
    cancel: CancellationToken,
}

thread_local! {
    static RUNNING: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Marks a pid as executing on this thread for the guard's lifetime.
struct RunningGuard;

impl RunningGuard {
    fn enter(pid: &str) -> Self {
        RUNNING.with(|r| r.borrow_mut().push(pid.to_string()));
        RunningGuard
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        RUNNING.with(|r| {
            r.borrow_mut().pop();
        });
    }
}

fn running_here(pid: &str) -> bool {
    RUNNING.with(|r| r.borrow().iter().any(|p| p == pid))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs one handler call under its lock, turning a panic into an error.
fn invoke(
    pid: &str,
    handler: &Mutex<Box<dyn Process>>,
    call: impl FnOnce(&mut dyn Process) -> Result<(), ProcessError>,
) -> Result<(), ProcessError> {
    let mut guard = handler.lock().unwrap_or_else(PoisonError::into_inner);
    let _running = RunningGuard::enter(pid);
    match catch_unwind(AssertUnwindSafe(|| call(&mut **guard))) {
        Ok(result) => result,
        Err(panic) => Err(ProcessError::Handler(format!(
            "panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

/// Actors of one context kind within one graph.
pub struct ProcessGroup {
    label: &'static str,
    graph_name: String,
    runtime: Handle,
    mailbox_capacity: usize,
    registry: Arc<ProcessRegistry>,
    actors: DashMap<String, ActorHandle>,
    me: Weak<ProcessGroup>,
}

impl ProcessGroup {
    pub fn new(
        label: &'static str,
        graph_name: &str,
        runtime: Handle,
        mailbox_capacity: usize,
        registry: Arc<ProcessRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| ProcessGroup {
            label,
            graph_name: graph_name.to_string(),
            runtime,
            mailbox_capacity: mailbox_capacity.max(1),
            registry,
            actors: DashMap::new(),
            me: me.clone(),
        })
    }

    /// Starts `handler` as the sole consumer of a new mailbox registered under `ctx.name`.
    pub fn start(&self, ctx: ProcessContext, handler: Box<dyn Process>) -> Result<String, ProcessError> {
        use dashmap::mapref::entry::Entry;

        let name = ctx.name.clone();
        let pid = ctx.pid.clone();
        match self.actors.entry(name.clone()) {
            Entry::Occupied(_) => Err(ProcessError::AlreadyRunning(name)),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.mailbox_capacity);
                let handle = ActorHandle {
                    pid: pid.clone(),
                    tx,
                    handler: Arc::new(Mutex::new(handler)),
                    ctx: Arc::new(ctx),
                    cancel: CancellationToken::new(),
                };
                self.runtime.spawn(run_actor(
                    Arc::clone(&handle.ctx),
                    Arc::clone(&handle.handler),
                    rx,
                    handle.cancel.clone(),
                    self.me.clone(),
                ));
                slot.insert(handle);
                info!(graph = %self.graph_name, group = self.label, pid = %pid, process = %name, "process started");
                Ok(pid)
            }
        }
    }

    /// Enqueues `msg` without waiting. A full mailbox rejects the message.
    pub fn publish(&self, name: &str, msg: Value) -> Result<(), ProcessError> {
        let tx = self
            .actors
            .get(name)
            .map(|h| h.tx.clone())
            .ok_or_else(|| ProcessError::NotRunning(name.to_string()))?;
        tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(graph = %self.graph_name, process = %name, "mailbox full, message rejected");
                ProcessError::MailboxFull(name.to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ProcessError::NotRunning(name.to_string()),
        })
    }

    /// Runs `before_kill`, stops the task and forgets the actor. Queued
    /// messages are discarded.
    pub fn kill(&self, name: &str) -> Result<(), ProcessError> {
        let (_, handle) = self
            .actors
            .remove(name)
            .ok_or_else(|| ProcessError::NotRunning(name.to_string()))?;
        self.teardown(handle);
        Ok(())
    }

    /// Kills `name` only if it is still the incarnation with `pid`.
    fn kill_incarnation(&self, name: &str, pid: &str) {
        if let Some((_, handle)) = self.actors.remove_if(name, |_, h| h.pid == pid) {
            self.teardown(handle);
        }
    }

    fn teardown(&self, handle: ActorHandle) {
        if running_here(&handle.pid) {
            debug!(pid = %handle.pid, "process killed from its own handler, skipping before_kill");
        } else if let Err(e) = invoke(&handle.pid, &handle.handler, |p| p.before_kill(&handle.ctx)) {
            warn!(graph = %self.graph_name, pid = %handle.pid, error = %e, "before_kill failed");
        }
        handle.cancel.cancel();
        self.registry.deregister(&handle.pid);
        info!(graph = %self.graph_name, group = self.label, pid = %handle.pid, process = %handle.ctx.name, "process killed");
    }

    pub fn kill_all(&self) -> usize {
        let names = self.names();
        names.iter().filter(|n| self.kill(n).is_ok()).count()
    }

    /// Calls a lifecycle hook on `name` from the current thread. Hook
    /// failures are logged, never propagated.
    pub fn notify(
        &self,
        name: &str,
        hook: impl FnOnce(&mut dyn Process, &ProcessContext) -> Result<(), ProcessError>,
    ) {
        let Some(handle) = self.actors.get(name).map(|h| h.clone()) else {
            return;
        };
        if running_here(&handle.pid) {
            return;
        }
        if let Err(e) = invoke(&handle.pid, &handle.handler, |p| hook(p, &handle.ctx)) {
            warn!(graph = %self.graph_name, pid = %handle.pid, error = %e, "lifecycle hook failed");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actors.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Names of actors whose context is the object `key`.
    pub fn names_bound_to(&self, key: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .actors
            .iter()
            .filter(|e| e.value().ctx.target.key() == key)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }
}

async fn run_actor(
    ctx: Arc<ProcessContext>,
    handler: SharedHandler,
    mut rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
    group: Weak<ProcessGroup>,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = invoke(&ctx.pid, &handler, |p| p.message(&ctx, msg)) {
                    error!(pid = %ctx.pid, process = %ctx.name, error = %e, "process failed, terminating");
                    if let Some(group) = group.upgrade() {
                        group.kill_incarnation(&ctx.name, &ctx.pid);
                    }
                    break;
                }
            }
        }
    }
    debug!(pid = %ctx.pid, process = %ctx.name, "process loop exited");
}
