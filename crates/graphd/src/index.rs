//! Keyword document index with field-equality and wildcard queries.
//!
//! Each document is a flat map of field name to string value, keyed by the
//! `_key` of the object it mirrors. Writes update the postings in place, so a
//! query issued right after a write observes it.
//!
//! Query grammar (all clauses must match):
//!
//! ```text
//! query   := clause (WS clause)*
//! clause  := ["-" | "+"] (field ":" value | field ":" WS value | value | "*" | "*:*")
//! value   := word | '"' text '"'
//! ```
//!
//! A bare value, or a `key:` clause, is matched against `_key`. Unquoted values may use `*` and
//! `?` wildcards. Matching is case-sensitive.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use regex::Regex;

use crate::error::{GraphError, Result};

pub const KEY_FIELD: &str = "_key";
/// Query-side spelling of [`KEY_FIELD`].
pub const KEY_ALIAS: &str = "key";

pub type Document = BTreeMap<String, String>;

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    fn is_match(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(v) => v == value,
            Matcher::Pattern(re) => re.is_match(value),
        }
    }
}

#[derive(Debug, Clone)]
struct Clause {
    field: String,
    matcher: Matcher,
    negated: bool,
}

/// A parsed field query.
#[derive(Debug, Clone)]
pub struct FieldQuery {
    clauses: Vec<Clause>,
}

impl FieldQuery {
    pub fn parse(input: &str) -> Result<FieldQuery> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(GraphError::BadQuery("empty query".to_string()));
        }

        let mut clauses = Vec::new();
        let mut iter = tokens.into_iter();
        while let Some(token) = iter.next() {
            if token == "AND" || token == "&&" {
                continue;
            }
            if token == "OR" || token == "||" || token == "NOT" {
                return Err(GraphError::BadQuery(format!(
                    "unsupported operator: {}",
                    token
                )));
            }

            let (negated, body) = match token.strip_prefix('-') {
                Some(rest) => (true, rest.to_string()),
                None => (false, token.trim_start_matches('+').to_string()),
            };
            if body == "*" || body == "*:*" {
                if negated {
                    return Err(GraphError::BadQuery("cannot negate match-all".to_string()));
                }
                continue;
            }

            let (field, raw_value) = match split_field(&body) {
                Some((field, value)) if value.is_empty() => {
                    let next = iter.next().ok_or_else(|| {
                        GraphError::BadQuery(format!("missing value for field {}", field))
                    })?;
                    (field.to_string(), next)
                }
                Some((field, value)) => (field.to_string(), value.to_string()),
                None => (KEY_FIELD.to_string(), body.clone()),
            };

            if field.is_empty() {
                return Err(GraphError::BadQuery(format!("missing field name in {}", body)));
            }
            let field = if field == KEY_ALIAS { KEY_FIELD.to_string() } else { field };
            clauses.push(Clause {
                field,
                matcher: build_matcher(&raw_value)?,
                negated,
            });
        }

        Ok(FieldQuery { clauses })
    }

    /// Exact equality on every pair, whatever characters the values contain.
    pub fn exact(pairs: &[(&str, &str)]) -> FieldQuery {
        FieldQuery {
            clauses: pairs
                .iter()
                .map(|(field, value)| Clause {
                    field: field.to_string(),
                    matcher: Matcher::Exact(value.to_string()),
                    negated: false,
                })
                .collect(),
        }
    }

    pub fn key(key: &str) -> FieldQuery {
        FieldQuery::exact(&[(KEY_FIELD, key)])
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|clause| {
            let hit = doc
                .get(&clause.field)
                .map(|v| clause.matcher.is_match(v))
                .unwrap_or(false);
            hit != clause.negated
        })
    }
}

fn split_field(token: &str) -> Option<(&str, &str)> {
    if token.starts_with('"') {
        return None;
    }
    token.split_once(':')
}

fn build_matcher(raw: &str) -> Result<Matcher> {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Ok(Matcher::Exact(raw[1..raw.len() - 1].to_string()));
    }
    if !raw.contains('*') && !raw.contains('?') {
        return Ok(Matcher::Exact(raw.to_string()));
    }
    let mut pattern = String::with_capacity(raw.len() + 8);
    pattern.push('^');
    let mut literal = String::new();
    for c in raw.chars() {
        match c {
            '*' | '?' => {
                pattern.push_str(&regex::escape(&literal));
                literal.clear();
                pattern.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    pattern.push_str(&regex::escape(&literal));
    pattern.push('$');
    Regex::new(&pattern)
        .map(Matcher::Pattern)
        .map_err(|e| GraphError::BadQuery(e.to_string()))
}

/// Splits on whitespace, keeping double-quoted runs (quotes included) intact.
fn tokenize(input: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if quoted {
        return Err(GraphError::BadQuery(format!("unterminated quote in {}", input)));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

#[derive(Debug, Default)]
pub struct SecondaryIndex {
    docs: BTreeMap<String, Document>,
    postings: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl SecondaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the document stored under `key`. The `_key` field is always set.
    pub fn upsert(&mut self, key: &str, mut doc: Document) {
        self.remove(key);
        doc.insert(KEY_FIELD.to_string(), key.to_string());
        for (field, value) in &doc {
            self.postings
                .entry(field.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.docs.insert(key.to_string(), doc);
    }

    pub fn remove(&mut self, key: &str) -> Option<Document> {
        let doc = self.docs.remove(key)?;
        for (field, value) in &doc {
            if let Some(values) = self.postings.get_mut(field) {
                if let Some(keys) = values.get_mut(value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        values.remove(value);
                    }
                }
                if values.is_empty() {
                    self.postings.remove(field);
                }
            }
        }
        Some(doc)
    }

    pub fn get(&self, key: &str) -> Option<&Document> {
        self.docs.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.docs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Keys of matching documents, in key order.
    pub fn search(&self, query: &FieldQuery) -> Vec<String> {
        let mut candidates: Option<BTreeSet<&String>> = None;
        for clause in query.clauses.iter().filter(|c| !c.negated) {
            let hits = self.clause_hits(clause);
            candidates = Some(match candidates {
                None => hits,
                Some(prev) => prev.intersection(&hits).copied().collect(),
            });
        }

        let base: Box<dyn Iterator<Item = &String>> = match candidates {
            Some(set) => Box::new(set.into_iter()),
            None => Box::new(self.docs.keys()),
        };
        base.filter(|key| {
            query
                .clauses
                .iter()
                .filter(|c| c.negated)
                .all(|c| match self.docs.get(*key).and_then(|d| d.get(&c.field)) {
                    Some(value) => !c.matcher.is_match(value),
                    None => true,
                })
        })
        .cloned()
        .collect()
    }

    pub fn query(&self, input: &str) -> Result<Vec<String>> {
        Ok(self.search(&FieldQuery::parse(input)?))
    }

    pub fn query_documents(&self, input: &str) -> Result<Vec<&Document>> {
        let keys = self.query(input)?;
        Ok(keys.iter().filter_map(|k| self.docs.get(k)).collect())
    }

    /// Number of documents whose `field` equals `value`.
    pub fn count(&self, field: &str, value: &str) -> usize {
        self.postings
            .get(field)
            .and_then(|values| values.get(value))
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    fn clause_hits(&self, clause: &Clause) -> BTreeSet<&String> {
        let Some(values) = self.postings.get(&clause.field) else {
            return BTreeSet::new();
        };
        match &clause.matcher {
            Matcher::Exact(v) => values.get(v).map(|keys| keys.iter().collect()).unwrap_or_default(),
            Matcher::Pattern(re) => values
                .iter()
                .filter(|(value, _)| re.is_match(value))
                .flat_map(|(_, keys)| keys.iter())
                .collect(),
        }
    }
}
