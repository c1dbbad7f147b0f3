#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use graphd::protocol::{SharedSink, EVENT_MARKER, STATUS_MARKER};
use graphd::{Config, ServerState, Session};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub fn server() -> Arc<ServerState> {
    ServerState::new(Config::default(), Handle::current())
}

/// A session plus the receiving end of its connection.
pub struct TestClient {
    pub session: Session,
    pub greeting: String,
    rx: mpsc::UnboundedReceiver<String>,
    events: VecDeque<String>,
}

impl TestClient {
    pub async fn connect(state: &Arc<ServerState>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let sink: SharedSink = Arc::new(tx);
        let session = Session::open(state, sink).expect("open session");
        let greeting = rx.recv().await.expect("greeting");
        Self {
            session,
            greeting,
            rx,
            events: VecDeque::new(),
        }
    }

    /// Runs one line and returns its reply lines, status last. Channel
    /// events seen meanwhile are kept for [`TestClient::next_event`].
    pub async fn cmd(&mut self, line: &str) -> Vec<String> {
        self.session.handle_line(line).await;
        let mut reply = Vec::new();
        loop {
            let line = timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("reply timed out")
                .expect("connection closed");
            if line.starts_with(EVENT_MARKER) {
                self.events.push_back(line);
                continue;
            }
            let done = line.starts_with(STATUS_MARKER);
            reply.push(line);
            if done {
                return reply;
            }
        }
    }

    /// Runs a line expected to answer with a status only.
    pub async fn status(&mut self, line: &str) -> String {
        let mut reply = self.cmd(line).await;
        assert_eq!(reply.len(), 1, "unexpected body for {}: {:?}", line, reply);
        reply.remove(0)
    }

    /// Runs a line expected to answer with one JSON body line and `-ok`.
    pub async fn json(&mut self, line: &str) -> serde_json::Value {
        let reply = self.cmd(line).await;
        assert_eq!(reply.len(), 2, "unexpected reply for {}: {:?}", line, reply);
        assert_eq!(reply[1], "-ok");
        serde_json::from_str(&reply[0]).expect("json body")
    }

    pub async fn next_event(&mut self) -> String {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        loop {
            let line = timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("event timed out")
                .expect("connection closed");
            if line.starts_with(EVENT_MARKER) {
                return line;
            }
        }
    }

    /// Drops the receiving end, so every later write to this client fails.
    pub fn break_connection(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

/// `create` + `use` on a fresh graph.
pub async fn client_on_graph(state: &Arc<ServerState>, graph: &str) -> TestClient {
    let mut client = TestClient::connect(state).await;
    let created = client.status(&format!("create {}", graph)).await;
    assert!(created == "-ok" || created == "-err DB_ALREADY_EXISTS");
    assert_eq!(client.status(&format!("use {}", graph)).await, "-ok");
    client
}
