//! Publish/subscribe channels on top of the actor runtime.
//!
//! A [`ChannelProcess`] is the actor behind one named channel. Publishing
//! wraps the payload as `{"from": <channel>, "msg": <payload>}` and hands it
//! to every subscribed [`EndpointChannel`]. Clients subscribe through an
//! [`InboundEndpoint`], which forwards into the client's own
//! [`InboundChannel`] actor; that actor writes `! <channel> <payload>` lines
//! to the connection.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::protocol::{SharedSink, EVENT_MARKER};

use super::{Process, ProcessContext, ProcessGroup};

/// Something a channel can deliver envelopes to.
pub trait EndpointChannel: Send + Sync {
    /// Stable identity used for unsubscribe.
    fn id(&self) -> &str;

    fn deliver(&self, envelope: &Value) -> Result<(), ProcessError>;
}

pub type Subscribers = Arc<DashMap<String, Arc<dyn EndpointChannel>>>;

pub fn envelope(channel: &str, msg: Value) -> Value {
    json!({"from": channel, "msg": msg})
}

/// Actor that fans published messages out to the subscriber set.
pub struct ChannelProcess {
    name: String,
    subscribers: Subscribers,
}

impl ChannelProcess {
    /// Returns the actor plus a handle on its subscriber set, which callers
    /// mutate directly so a subscribe is visible to the next publish.
    pub fn new(name: &str) -> (Self, Subscribers) {
        let subscribers: Subscribers = Arc::new(DashMap::new());
        let process = ChannelProcess {
            name: name.to_string(),
            subscribers: Arc::clone(&subscribers),
        };
        (process, subscribers)
    }
}

impl Process for ChannelProcess {
    fn message(&mut self, _ctx: &ProcessContext, msg: Value) -> Result<(), ProcessError> {
        let envelope = envelope(&self.name, msg);
        let targets: Vec<Arc<dyn EndpointChannel>> =
            self.subscribers.iter().map(|e| Arc::clone(e.value())).collect();

        let mut gone = Vec::new();
        for target in targets {
            match target.deliver(&envelope) {
                Ok(()) => {}
                Err(ProcessError::NotRunning(_)) => gone.push(target.id().to_string()),
                Err(e) => {
                    warn!(channel = %self.name, subscriber = %target.id(), error = %e, "delivery failed");
                }
            }
        }
        for id in gone {
            debug!(channel = %self.name, subscriber = %id, "dropping dead subscriber");
            self.subscribers.remove(&id);
        }
        Ok(())
    }

    fn before_kill(&mut self, _ctx: &ProcessContext) -> Result<(), ProcessError> {
        self.subscribers.clear();
        Ok(())
    }
}

/// Per-client actor turning envelopes into event lines on the connection.
pub struct InboundChannel {
    sink: SharedSink,
}

impl InboundChannel {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }

    pub fn event_line(envelope: &Value) -> String {
        let from = envelope["from"].as_str().unwrap_or_default();
        format!("{} {} {}", EVENT_MARKER, from, envelope["msg"])
    }
}

impl Process for InboundChannel {
    fn message(&mut self, ctx: &ProcessContext, envelope: Value) -> Result<(), ProcessError> {
        self.sink
            .send_line(Self::event_line(&envelope))
            .map_err(|_| ProcessError::Handler(format!("connection of {} closed", ctx.name)))
    }
}

/// Subscription handle forwarding to a client's [`InboundChannel`] actor.
pub struct InboundEndpoint {
    name: String,
    group: Weak<ProcessGroup>,
}

impl InboundEndpoint {
    pub fn new(name: impl Into<String>, group: &Arc<ProcessGroup>) -> Self {
        Self {
            name: name.into(),
            group: Arc::downgrade(group),
        }
    }
}

impl EndpointChannel for InboundEndpoint {
    fn id(&self) -> &str {
        &self.name
    }

    fn deliver(&self, envelope: &Value) -> Result<(), ProcessError> {
        let group = self
            .group
            .upgrade()
            .ok_or_else(|| ProcessError::NotRunning(self.name.clone()))?;
        group.publish(&self.name, envelope.clone())
    }
}
