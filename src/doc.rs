use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

static DOC_TABLE: OnceLock<HashMap<String, DocRecord>> = OnceLock::new();

/// One entry of the static documentation table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocRecord {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn table() -> &'static HashMap<String, DocRecord> {
    DOC_TABLE.get_or_init(|| {
        serde_json::from_str(include_str!("docs.json")).expect("embedded doc table is valid JSON")
    })
}

/// Looks up documentation for a qualified name.
///
/// Probes, in order: the exact name; the name with a leading `*Error.`
/// segment rewritten to `Error.`; the same with `*Array.` rewritten to
/// `TypedArray.`. The glob prefix must be non-empty, so `Error.x` and
/// `Array.x` themselves are not rewritten.
pub fn lookup(name: &str) -> Option<&'static DocRecord> {
    let table = table();
    if let Some(record) = table.get(name) {
        return Some(record);
    }
    if let Some(rewritten) = rewrite(name, "Error", "Error") {
        if let Some(record) = table.get(&rewritten) {
            return Some(record);
        }
    }
    if let Some(rewritten) = rewrite(name, "Array", "TypedArray") {
        if let Some(record) = table.get(&rewritten) {
            return Some(record);
        }
    }
    None
}

fn rewrite(name: &str, suffix: &str, replacement: &str) -> Option<String> {
    let (head, rest) = name.split_once('.')?;
    (head.len() > suffix.len() && head.ends_with(suffix))
        .then(|| format!("{replacement}.{rest}"))
}
