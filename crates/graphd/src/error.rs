use crate::protocol::{R_ALREADY_EXIST, R_ERR, R_NOT_EXIST, R_NOT_FOUND, R_UNK};

/// Failures raised by graph commands, rendered as protocol status lines.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// The algorithm has no answer for the given input (no path, disconnected graph, ...).
    #[error("no result exists")]
    NotExist,

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("cannot set reserved property: {0}")]
    ReservedProperty(String),

    #[error("bad json: {0}")]
    BadJson(#[from] serde_json::Error),

    #[error("bad query: {0}")]
    BadQuery(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("missing argument for {0}")]
    MissingArgument(String),

    #[error("no graph selected")]
    RequireUseDb,

    #[error("graph no longer exists")]
    GraphNoLongerExists,

    #[error("graph does not exist: {0}")]
    DbNotExist(String),

    #[error("graph already exists: {0}")]
    DbAlreadyExists(String),

    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{0}")]
    Internal(String),
}

impl GraphError {
    /// The single status line a client receives for this error.
    pub fn status_line(&self) -> String {
        match self {
            GraphError::NotFound(_) => R_NOT_FOUND.to_string(),
            GraphError::NotExist => R_NOT_EXIST.to_string(),
            GraphError::AlreadyExists(_) => R_ALREADY_EXIST.to_string(),
            GraphError::UnknownVerb(verb) => format!("{} {}", R_UNK, verb),
            GraphError::ReservedProperty(_) => format!("{} CANNOT_SET_RESERVED_PROPERTY", R_ERR),
            GraphError::BadJson(e) => format!("{} BAD_JSON {}", R_ERR, e),
            GraphError::RequireUseDb => format!("{} REQUIRE_USE_DB", R_ERR),
            GraphError::GraphNoLongerExists => format!("{} GRAPH_NO_LONGER_EXISTS", R_ERR),
            GraphError::DbNotExist(_) => format!("{} DB_NOT_EXIST", R_ERR),
            GraphError::DbAlreadyExists(_) => format!("{} DB_ALREADY_EXISTS", R_ERR),
            GraphError::Process(ProcessError::NotRunning(_)) => R_NOT_FOUND.to_string(),
            GraphError::Process(ProcessError::AlreadyRunning(_)) => R_ALREADY_EXIST.to_string(),
            other => format!("{} {}", R_ERR, other),
        }
    }
}

/// Failures raised by the actor runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("process not running: {0}")]
    NotRunning(String),

    #[error("process already running: {0}")]
    AlreadyRunning(String),

    #[error("mailbox full: {0}")]
    MailboxFull(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("udf runtime: {0}")]
    Udf(String),
}

impl From<GraphError> for ProcessError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Process(inner) => inner,
            other => ProcessError::Handler(other.to_string()),
        }
    }
}

pub type Result<T, E = GraphError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lines() {
        assert_eq!(GraphError::NotFound("a".into()).status_line(), "-not_found");
        assert_eq!(GraphError::NotExist.status_line(), "-not_exist");
        assert_eq!(GraphError::UnknownVerb("zap".into()).status_line(), "-unk zap");
        assert_eq!(
            GraphError::ReservedProperty("_type".into()).status_line(),
            "-err CANNOT_SET_RESERVED_PROPERTY"
        );
        assert_eq!(GraphError::RequireUseDb.status_line(), "-err REQUIRE_USE_DB");
        assert_eq!(
            GraphError::Process(ProcessError::MailboxFull("a-p".into())).status_line(),
            "-err mailbox full: a-p"
        );
    }

    #[test]
    fn test_bad_json_is_prefixed() {
        let err: GraphError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(err.status_line().starts_with("-err BAD_JSON "));
    }
}
