//! JSONL dataset loading.
//!
//! Each non-empty line is one JSON object. Field names are configurable so
//! the same loader reads most question/answer dumps without conversion.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::StorageError;
use crate::trajectory::Item;

/// Which JSON fields hold the id, the question and the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetFields {
    pub id_field: String,
    pub prompt_field: String,
    pub answer_field: String,
}

impl Default for DatasetFields {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            prompt_field: "question".to_string(),
            answer_field: "answer".to_string(),
        }
    }
}

/// Parses dataset lines into items.
///
/// Item indices are line positions among non-empty lines, counted over the
/// whole file, so they stay stable when the caller later takes a shard.
/// A row without an id becomes `<dataset>_<index>`.
pub fn parse_items(
    contents: &str,
    dataset: &str,
    fields: &DatasetFields,
    max_examples: Option<usize>,
) -> Result<Vec<Item>, StorageError> {
    let mut items = Vec::new();
    let mut ids = HashSet::new();

    let rows = contents.lines().filter(|line| !line.trim().is_empty());
    for (index, line) in rows.take(max_examples.unwrap_or(usize::MAX)).enumerate() {
        let row: Value = serde_json::from_str(line)
            .map_err(|e| StorageError::InvalidData(format!("row {}: {}", index, e)))?;

        let question = row
            .get(&fields.prompt_field)
            .and_then(scalar_to_string)
            .ok_or_else(|| {
                StorageError::InvalidData(format!(
                    "row {}: missing prompt field '{}'",
                    index, fields.prompt_field
                ))
            })?;
        let id = row
            .get(&fields.id_field)
            .and_then(scalar_to_string)
            .unwrap_or_else(|| format!("{}_{}", dataset, index));
        let ground_truth = row.get(&fields.answer_field).and_then(scalar_to_string);

        if !ids.insert(id.clone()) {
            return Err(StorageError::InvalidData(format!(
                "row {}: duplicate item id '{}'",
                index, id
            )));
        }
        items.push(Item::new(id, index, question, ground_truth));
    }

    Ok(items)
}

/// Reads a JSONL file. See [`parse_items`].
pub async fn load_jsonl(
    path: impl AsRef<Path>,
    dataset: &str,
    fields: &DatasetFields,
    max_examples: Option<usize>,
) -> Result<Vec<Item>, StorageError> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path).await?;
    let items = parse_items(&contents, dataset, fields, max_examples)?;
    info!(path = ?path, dataset, items = items.len(), "Loaded dataset");
    Ok(items)
}

/// Strings pass through; numbers and booleans are stringified. Answers
/// given as a list use their first element.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(values) => values.first().and_then(scalar_to_string),
        Value::Null | Value::Object(_) => None,
    }
}
