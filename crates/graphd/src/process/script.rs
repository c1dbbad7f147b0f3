//! Actors whose behaviour lives in an external script runtime.
//!
//! The interpreter itself is not part of this crate. It is reached through
//! [`UdfRuntime`], a narrow eval/invoke/bind interface. Every hook becomes
//! `invoke("_udf_call", [pid, hook, ...args])`. A result may carry
//! `{"emit": [{"key", "process", "msg"}, ...]}` for direct sends and
//! `{"emit_query": [{"query", "msg"}, ...]}` for sends to every registered
//! process or channel matching a registry query. Both are performed on the
//! actor's behalf.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::ProcessError;
use crate::store::{Edge, Vertex};

use super::registry::UdfDef;
use super::{Process, ProcessContext};

pub const UDF_EXISTS_FN: &str = "_udf_exists";
pub const UDF_INSTANCE_FN: &str = "_udf_instance";
pub const UDF_CALL_FN: &str = "_udf_call";

/// Script interpreter seam.
pub trait UdfRuntime: Send + Sync {
    /// Loads source text into the interpreter.
    fn eval(&self, source: &str) -> Result<(), ProcessError>;

    fn invoke(&self, function: &str, args: &[Value]) -> Result<Value, ProcessError>;

    fn bind(&self, name: &str, value: Value) -> Result<(), ProcessError>;
}

pub struct ScriptProcess {
    runtime: Arc<dyn UdfRuntime>,
}

impl ScriptProcess {
    /// Loads the UDF if the runtime has not seen it yet and creates the
    /// per-actor instance.
    pub fn start(
        runtime: Arc<dyn UdfRuntime>,
        udf: &UdfDef,
        ctx: &ProcessContext,
    ) -> Result<Self, ProcessError> {
        let loaded = runtime.invoke(UDF_EXISTS_FN, &[json!(udf.key)])?;
        if loaded != Value::Bool(true) {
            debug!(udf = %udf.key, "loading udf source");
            runtime.bind("udf_key", json!(udf.key))?;
            runtime.eval(&udf.source)?;
        }
        runtime.invoke(
            UDF_INSTANCE_FN,
            &[
                json!(ctx.pid),
                json!(udf.key),
                json!(ctx.target.key()),
                json!(ctx.target.object_type()),
            ],
        )?;
        Ok(Self { runtime })
    }

    fn call(&self, ctx: &ProcessContext, hook: &str, args: Vec<Value>) -> Result<(), ProcessError> {
        let mut call_args = vec![json!(ctx.pid), json!(hook)];
        call_args.extend(args);
        let result = self.runtime.invoke(UDF_CALL_FN, &call_args)?;
        apply_emits(ctx, &result)
    }
}

fn apply_emits(ctx: &ProcessContext, result: &Value) -> Result<(), ProcessError> {
    for emit in result.get("emit").and_then(Value::as_array).into_iter().flatten() {
        let (Some(key), Some(process)) = (emit["key"].as_str(), emit["process"].as_str()) else {
            return Err(ProcessError::Udf(format!("malformed emit: {}", emit)));
        };
        ctx.emit(key, process, emit["msg"].clone())?;
    }
    for emit in result.get("emit_query").and_then(Value::as_array).into_iter().flatten() {
        let Some(query) = emit["query"].as_str() else {
            return Err(ProcessError::Udf(format!("malformed emit_query: {}", emit)));
        };
        let delivered = ctx.emit_by_query(query, emit["msg"].clone())?;
        debug!(process = %ctx.name, query, delivered, "emitted by query");
    }
    Ok(())
}

fn edge_json(edge: &Edge) -> Value {
    json!({
        "key": edge.key,
        "source": edge.source,
        "target": edge.target,
        "rel": edge.rel,
        "weight": edge.weight,
    })
}

impl Process for ScriptProcess {
    fn message(&mut self, ctx: &ProcessContext, msg: Value) -> Result<(), ProcessError> {
        self.call(ctx, "message", vec![msg])
    }

    fn before_kill(&mut self, ctx: &ProcessContext) -> Result<(), ProcessError> {
        self.call(ctx, "beforeKill", Vec::new())
    }

    fn before_remove_vertex(&mut self, ctx: &ProcessContext, vertex: &Vertex) -> Result<(), ProcessError> {
        self.call(ctx, "beforeRemoveVertex", vec![json!(vertex.key)])
    }

    fn before_remove_edge(&mut self, ctx: &ProcessContext, edge: &Edge) -> Result<(), ProcessError> {
        self.call(ctx, "beforeRemoveEdge", vec![edge_json(edge)])
    }

    fn after_remove_edge(&mut self, ctx: &ProcessContext, edge: &Edge) -> Result<(), ProcessError> {
        self.call(ctx, "afterRemoveEdge", vec![edge_json(edge)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessTarget;
    use std::sync::{Mutex, Weak};

    #[derive(Default)]
    struct FakeRuntime {
        calls: Mutex<Vec<String>>,
        loaded: Mutex<bool>,
    }

    impl UdfRuntime for FakeRuntime {
        fn eval(&self, source: &str) -> Result<(), ProcessError> {
            self.calls.lock().unwrap().push(format!("eval {}", source));
            *self.loaded.lock().unwrap() = true;
            Ok(())
        }

        fn invoke(&self, function: &str, args: &[Value]) -> Result<Value, ProcessError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", function, Value::Array(args.to_vec())));
            match function {
                UDF_EXISTS_FN => Ok(json!(*self.loaded.lock().unwrap())),
                _ => Ok(Value::Null),
            }
        }

        fn bind(&self, name: &str, _value: Value) -> Result<(), ProcessError> {
            self.calls.lock().unwrap().push(format!("bind {}", name));
            Ok(())
        }
    }

    fn ctx() -> ProcessContext {
        ProcessContext::new("p1", "a-walk", "walk", ProcessTarget::Vertex("a".into()), Weak::new())
    }

    fn udf() -> UdfDef {
        UdfDef {
            key: "walk".into(),
            udf_type: "js".into(),
            source: "function walk() {}".into(),
        }
    }

    #[test]
    fn test_source_loaded_once() {
        let runtime = Arc::new(FakeRuntime::default());
        ScriptProcess::start(runtime.clone(), &udf(), &ctx()).unwrap();
        ScriptProcess::start(runtime.clone(), &udf(), &ctx()).unwrap();
        let calls = runtime.calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| c.starts_with("eval")).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.starts_with(UDF_INSTANCE_FN)).count(), 2);
    }

    #[test]
    fn test_hooks_forward_to_udf_call() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut process = ScriptProcess::start(runtime.clone(), &udf(), &ctx()).unwrap();
        process.message(&ctx(), json!({"n": 1})).unwrap();
        process.before_kill(&ctx()).unwrap();
        let calls = runtime.calls.lock().unwrap();
        assert!(calls.contains(&r#"_udf_call ["p1","message",{"n":1}]"#.to_string()));
        assert!(calls.contains(&r#"_udf_call ["p1","beforeKill"]"#.to_string()));
    }

    #[test]
    fn test_malformed_emit_is_an_error() {
        let result = json!({"emit": [{"msg": 1}]});
        assert!(matches!(apply_emits(&ctx(), &result), Err(ProcessError::Udf(_))));
        assert!(apply_emits(&ctx(), &json!({"emit": []})).is_ok());
        let result = json!({"emit_query": [{"msg": 1}]});
        assert!(matches!(apply_emits(&ctx(), &result), Err(ProcessError::Udf(_))));
        assert!(apply_emits(&ctx(), &Value::Null).is_ok());
    }
}
