//! Per-graph catalogue of UDF definitions, running processes and channels.
//!
//! Entries are plain index documents so clients can inspect them with the same
//! field queries used for graph objects (`qp _type:p obj_type:v`).

use std::sync::{PoisonError, RwLock};

use chrono::Utc;

use crate::error::{GraphError, Result};
use crate::index::{Document, FieldQuery, SecondaryIndex};
use crate::store::{CHANNEL_TYPE, PROCESS_TYPE, TYPE_FIELD, UDF_TYPE};

use super::ProcessContext;

pub const INSTANCE_NAME_FIELD: &str = "instance_name";
pub const OBJ_KEY_FIELD: &str = "obj_key";
pub const OBJ_TYPE_FIELD: &str = "obj_type";

/// A user-defined function registered with `defudf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdfDef {
    pub key: String,
    pub udf_type: String,
    pub source: String,
}

/// Routing facts about a registered process or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: String,
    pub instance_name: String,
    pub obj_type: String,
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    index: RwLock<SecondaryIndex>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SecondaryIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SecondaryIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores or replaces a UDF definition.
    pub fn define_udf(&self, key: &str, udf_type: &str, source: &str) {
        let mut doc = Document::new();
        doc.insert(TYPE_FIELD.to_string(), UDF_TYPE.to_string());
        doc.insert("udf_type".to_string(), udf_type.to_string());
        doc.insert("udf_fn".to_string(), source.to_string());
        self.write().upsert(key, doc);
    }

    pub fn udf(&self, key: &str) -> Option<UdfDef> {
        let index = self.read();
        let doc = index.get(key)?;
        if doc.get(TYPE_FIELD).map(String::as_str) != Some(UDF_TYPE) {
            return None;
        }
        Some(UdfDef {
            key: key.to_string(),
            udf_type: doc.get("udf_type").cloned().unwrap_or_default(),
            source: doc.get("udf_fn").cloned().unwrap_or_default(),
        })
    }

    pub fn register_process(&self, ctx: &ProcessContext, udf_key: &str) {
        let mut doc = Document::new();
        doc.insert(TYPE_FIELD.to_string(), PROCESS_TYPE.to_string());
        doc.insert(INSTANCE_NAME_FIELD.to_string(), ctx.name.clone());
        doc.insert("process_name".to_string(), ctx.process_name.clone());
        doc.insert("udf_key".to_string(), udf_key.to_string());
        doc.insert(OBJ_KEY_FIELD.to_string(), ctx.target.key().to_string());
        doc.insert(OBJ_TYPE_FIELD.to_string(), ctx.target.object_type().to_string());
        doc.insert("start_time".to_string(), Utc::now().to_rfc3339());
        self.write().upsert(&ctx.pid, doc);
    }

    pub fn register_channel(&self, pid: &str, name: &str) {
        let mut doc = Document::new();
        doc.insert(TYPE_FIELD.to_string(), CHANNEL_TYPE.to_string());
        doc.insert("name".to_string(), name.to_string());
        doc.insert(INSTANCE_NAME_FIELD.to_string(), name.to_string());
        doc.insert(OBJ_KEY_FIELD.to_string(), name.to_string());
        doc.insert(OBJ_TYPE_FIELD.to_string(), CHANNEL_TYPE.to_string());
        doc.insert("start_time".to_string(), Utc::now().to_rfc3339());
        self.write().upsert(pid, doc);
    }

    /// Drops the entry of a process or channel. UDF definitions are kept.
    pub fn deregister(&self, pid: &str) {
        let mut index = self.write();
        let is_runtime_entry = index
            .get(pid)
            .and_then(|d| d.get(TYPE_FIELD))
            .map(|t| t == PROCESS_TYPE || t == CHANNEL_TYPE)
            .unwrap_or(false);
        if is_runtime_entry {
            index.remove(pid);
        }
    }

    /// Runtime entries (processes and channels) matching `query`.
    pub fn entries(&self, query: &str) -> Result<Vec<ProcessEntry>> {
        Ok(self.entries_matching(&FieldQuery::parse(query)?))
    }

    fn entries_matching(&self, query: &FieldQuery) -> Vec<ProcessEntry> {
        let index = self.read();
        index
            .search(query)
            .into_iter()
            .filter_map(|pid| {
                let doc = index.get(&pid)?;
                let obj_type = doc.get(OBJ_TYPE_FIELD)?.clone();
                let instance_name = doc.get(INSTANCE_NAME_FIELD)?.clone();
                Some(ProcessEntry {
                    pid,
                    instance_name,
                    obj_type,
                })
            })
            .collect()
    }

    /// The process registered under `instance_name`.
    pub fn lookup(&self, instance_name: &str) -> Option<ProcessEntry> {
        let query = FieldQuery::exact(&[
            (TYPE_FIELD, PROCESS_TYPE),
            (INSTANCE_NAME_FIELD, instance_name),
        ]);
        self.entries_matching(&query).into_iter().next()
    }

    /// Full documents matching `query`, for client inspection.
    pub fn query(&self, query: &str) -> Result<Vec<serde_json::Value>> {
        let index = self.read();
        let docs = index.query_documents(query)?;
        docs.into_iter()
            .map(|doc| serde_json::to_value(doc).map_err(GraphError::from))
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.read().count(TYPE_FIELD, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessTarget;
    use std::sync::Weak;

    fn ctx(pid: &str, key: &str, process: &str) -> ProcessContext {
        ProcessContext::new(
            pid,
            format!("{}-{}", key, process),
            process,
            ProcessTarget::Vertex(key.to_string()),
            Weak::new(),
        )
    }

    #[test]
    fn test_udf_roundtrip() {
        let registry = ProcessRegistry::new();
        assert!(registry.udf("flood").is_none());
        registry.define_udf("flood", "builtin", "flood");
        let udf = registry.udf("flood").unwrap();
        assert_eq!(udf.udf_type, "builtin");
        assert_eq!(udf.source, "flood");
        assert_eq!(registry.count(UDF_TYPE), 1);
    }

    #[test]
    fn test_process_lookup_and_deregister() {
        let registry = ProcessRegistry::new();
        registry.register_process(&ctx("p1", "a", "walk"), "walk");
        registry.register_channel("c1", "news");

        assert_eq!(registry.lookup("a-walk").unwrap().pid, "p1");
        let entries = registry.entries("obj_type:v").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].instance_name, "a-walk");
        assert_eq!(registry.entries("_type:c").unwrap()[0].obj_type, "c");

        registry.deregister("p1");
        assert!(registry.lookup("a-walk").is_none());
        assert_eq!(registry.count(PROCESS_TYPE), 0);
        assert_eq!(registry.count(CHANNEL_TYPE), 1);
    }

    #[test]
    fn test_deregister_keeps_udfs() {
        let registry = ProcessRegistry::new();
        registry.define_udf("u", "builtin", "flood");
        registry.deregister("u");
        assert!(registry.udf("u").is_some());
    }

    #[test]
    fn test_query_returns_documents() {
        let registry = ProcessRegistry::new();
        registry.register_process(&ctx("p1", "a", "walk"), "walker");
        let docs = registry.query("_type:p udf_key:walker").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["obj_key"], "a");
        assert_eq!(docs[0]["_key"], "p1");
    }
}
