//! Line protocol grammar: status sigils, request tokenizing, replies and sinks.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{GraphError, Result};

pub const R_OK: &str = "-ok";
pub const R_ERR: &str = "-err";
pub const R_UNK: &str = "-unk";
pub const R_NOT_FOUND: &str = "-not_found";
pub const R_NOT_EXIST: &str = "-not_exist";
pub const R_ALREADY_EXIST: &str = "-already_exist";
pub const R_BATCH_OK: &str = "-batch-ok";

/// Every status line starts with this marker; body lines never should.
pub const STATUS_MARKER: char = '-';

/// Channel event lines start with this marker.
pub const EVENT_MARKER: char = '!';

pub const SELECTOR_OPEN: &str = "<<";
pub const SELECTOR_CLOSE: &str = ">>";

/// A tokenized request line. Arguments keep their byte offsets so a trailing
/// payload (JSON, script source) can be taken verbatim from the raw line.
#[derive(Debug, Clone)]
pub struct Request {
    raw: String,
    verb: String,
    args: Vec<(usize, usize)>,
}

impl Request {
    pub fn parse(line: &str) -> Request {
        let raw = line.trim().to_string();
        let mut spans = Vec::new();
        let mut start = None;
        for (i, c) in raw.char_indices() {
            match (c.is_whitespace(), start) {
                (true, Some(s)) => {
                    spans.push((s, i));
                    start = None;
                }
                (false, None) => start = Some(i),
                _ => {}
            }
        }
        if let Some(s) = start {
            spans.push((s, raw.len()));
        }

        let verb = spans
            .first()
            .map(|&(s, e)| raw[s..e].to_lowercase())
            .unwrap_or_default();
        let args = spans.into_iter().skip(1).collect();
        Request { raw, verb, args }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn is_empty(&self) -> bool {
        self.verb.is_empty()
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, i: usize) -> Option<&str> {
        self.args.get(i).map(|&(s, e)| &self.raw[s..e])
    }

    /// Like [`Request::arg`] but a missing argument is an error naming the verb.
    pub fn require(&self, i: usize) -> Result<&str> {
        self.arg(i)
            .ok_or_else(|| GraphError::MissingArgument(self.verb.clone()))
    }

    /// Everything from argument `i` to the end of the line, verbatim.
    pub fn rest_from(&self, i: usize) -> Option<&str> {
        self.args.get(i).map(|&(s, _)| self.raw[s..].trim_end())
    }

    pub fn require_rest(&self, i: usize) -> Result<&str> {
        self.rest_from(i)
            .ok_or_else(|| GraphError::MissingArgument(self.verb.clone()))
    }

    pub fn parse_f64(&self, i: usize) -> Result<f64> {
        let raw = self.require(i)?;
        raw.parse()
            .map_err(|_| GraphError::BadArgument(format!("not a number: {}", raw)))
    }

    pub fn parse_usize(&self, i: usize) -> Result<usize> {
        let raw = self.require(i)?;
        raw.parse()
            .map_err(|_| GraphError::BadArgument(format!("not a count: {}", raw)))
    }
}

/// A `<<query>>` span split out of a request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector<'a> {
    pub prefix: &'a str,
    pub query: &'a str,
    pub suffix: &'a str,
}

impl<'a> Selector<'a> {
    /// Finds the first `<<` and the first `>>` after it. Nested spans are not
    /// recognised; whatever lies between those two markers is the query.
    pub fn find(line: &'a str) -> Option<Selector<'a>> {
        let open = line.find(SELECTOR_OPEN)?;
        let body_start = open + SELECTOR_OPEN.len();
        let close = line[body_start..].find(SELECTOR_CLOSE)? + body_start;
        Some(Selector {
            prefix: line[..open].trim(),
            query: line[body_start..close].trim(),
            suffix: line[close + SELECTOR_CLOSE.len()..].trim(),
        })
    }

    pub fn expand(&self, key: &str) -> String {
        let mut line = String::with_capacity(self.prefix.len() + key.len() + self.suffix.len() + 2);
        line.push_str(self.prefix);
        line.push(' ');
        line.push_str(key);
        if !self.suffix.is_empty() {
            line.push(' ');
            line.push_str(self.suffix);
        }
        line
    }
}

/// Body lines followed by exactly one status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub status: String,
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::status(R_OK)
    }

    pub fn status(status: impl Into<String>) -> Reply {
        Reply {
            lines: Vec::new(),
            status: status.into(),
        }
    }

    pub fn line(line: impl Into<String>) -> Reply {
        Reply {
            lines: vec![line.into()],
            status: R_OK.to_string(),
        }
    }

    pub fn json(value: &serde_json::Value) -> Reply {
        Reply::line(value.to_string())
    }

    pub fn error(err: &GraphError) -> Reply {
        Reply::status(err.status_line())
    }

    pub fn is_ok(&self) -> bool {
        self.status == R_OK
    }

    pub fn write_to(&self, sink: &dyn ResponseSink) -> std::result::Result<(), SinkClosed> {
        for line in &self.lines {
            sink.send_line(line.clone())?;
        }
        sink.send_line(self.status.clone())
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("response sink closed")]
pub struct SinkClosed;

/// Where response and event lines for one client go. The network layer owns
/// the other end.
pub trait ResponseSink: Send + Sync {
    fn send_line(&self, line: String) -> std::result::Result<(), SinkClosed>;
}

pub type SharedSink = Arc<dyn ResponseSink>;

impl ResponseSink for mpsc::UnboundedSender<String> {
    fn send_line(&self, line: String) -> std::result::Result<(), SinkClosed> {
        self.send(line).map_err(|_| SinkClosed)
    }
}

impl ResponseSink for mpsc::Sender<String> {
    fn send_line(&self, line: String) -> std::result::Result<(), SinkClosed> {
        self.try_send(line).map_err(|_| SinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_payload_verbatim() {
        let req = Request::parse("CVERT a  {\"city\": \"st paul\"}  ");
        assert_eq!(req.verb(), "cvert");
        assert_eq!(req.arg(0), Some("a"));
        assert_eq!(req.rest_from(1), Some("{\"city\": \"st paul\"}"));
        assert_eq!(req.arg_count(), 3);
        assert!(req.arg(5).is_none());
        assert!(matches!(req.require(9), Err(GraphError::MissingArgument(v)) if v == "cvert"));
    }

    #[test]
    fn test_empty_line() {
        let req = Request::parse("   ");
        assert!(req.is_empty());
        assert_eq!(req.arg_count(), 0);
    }

    #[test]
    fn test_selector_split_and_expand() {
        let sel = Selector::find("set <<_type:v city:mpls>> flag true").unwrap();
        assert_eq!(sel.prefix, "set");
        assert_eq!(sel.query, "_type:v city:mpls");
        assert_eq!(sel.suffix, "flag true");
        assert_eq!(sel.expand("a"), "set a flag true");

        let trailing = Selector::find("del <<_type:e>>").unwrap();
        assert_eq!(trailing.expand("e1"), "del e1");
        assert!(Selector::find("get a").is_none());
        assert!(Selector::find("get <<open").is_none());
    }

    #[test]
    fn test_reply_write_to_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        Reply::line("{}").write_to(&tx).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "{}");
        assert_eq!(rx.try_recv().unwrap(), R_OK);
        drop(rx);
        assert!(Reply::ok().write_to(&tx).is_err());
    }
}
