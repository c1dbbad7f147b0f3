//! Built-in simulation actor: floods a message along outgoing edges.
//!
//! Message shape: `{"path": [...], "via": "<rel>", "maxlen": n, "reply_to": "<channel>"}`,
//! every field optional. Each hop appends its vertex to `path` and forwards to
//! the same-named process on every neighbour not already on the path. A hop
//! that forwards nothing reports the finished path, to `reply_to` if given.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::ProcessError;

use super::{Process, ProcessContext, ProcessTarget};

pub const FLOOD_FN: &str = "flood";

#[derive(Debug, Default)]
pub struct FloodProcess {
    visits: u64,
}

impl FloodProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visits(&self) -> u64 {
        self.visits
    }
}

impl Process for FloodProcess {
    fn message(&mut self, ctx: &ProcessContext, msg: Value) -> Result<(), ProcessError> {
        let ProcessTarget::Vertex(key) = &ctx.target else {
            return Err(ProcessError::Handler(format!(
                "{} must be bound to a vertex",
                ctx.name
            )));
        };
        self.visits += 1;

        let mut path: Vec<String> = msg["path"]
            .as_array()
            .map(|p| p.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        path.push(key.clone());

        let via = msg["via"].as_str();
        let exhausted = msg["maxlen"]
            .as_u64()
            .is_some_and(|max| path.len() as u64 >= max);

        let mut forwarded = 0;
        if !exhausted {
            let graph = ctx.graph()?;
            for next in graph.engine().outgoing_neighbors(key, via)? {
                if path.contains(&next) {
                    continue;
                }
                let mut onward = msg.clone();
                onward["path"] = json!(path);
                match ctx.emit(&next, &ctx.process_name, onward) {
                    Ok(()) => forwarded += 1,
                    Err(ProcessError::NotRunning(name)) => {
                        debug!(process = %ctx.name, next = %name, "no process on neighbour");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if forwarded == 0 {
            info!(process = %ctx.name, path = ?path, "flood path complete");
            if let Some(channel) = msg["reply_to"].as_str() {
                ctx.publish(channel, json!({"path": path}))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    #[test]
    fn test_rejects_non_vertex_target() {
        let ctx = ProcessContext::new("p", "g-flood", "flood", ProcessTarget::Graph("g".into()), Weak::new());
        let mut flood = FloodProcess::new();
        assert!(flood.message(&ctx, json!({})).is_err());
        assert_eq!(flood.visits(), 0);
    }

    #[test]
    fn test_needs_live_graph_to_forward() {
        let ctx = ProcessContext::new("p", "a-flood", "flood", ProcessTarget::Vertex("a".into()), Weak::new());
        let mut flood = FloodProcess::new();
        assert!(flood.message(&ctx, json!({"path": []})).is_err());
        // a hop that is already at its length bound never touches the graph
        assert!(flood.message(&ctx, json!({"maxlen": 1})).is_ok());
        assert_eq!(flood.visits(), 2);
    }
}
