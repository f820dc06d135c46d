use serde_json::{Map, Value};

use crate::tasks::AnalysisTask;

/// Normalized structured output of one successful pipeline run.
///
/// Exactly one record per analysis, even when the remote reply was
/// syntactically a collection. Fields are optional by design: the model is
/// instructed to emit a fixed key set, but a record missing a key is still
/// valid and reads back as the caller-supplied default.
#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    task: AnalysisTask,
    fields: Map<String, Value>,
}

impl AnalysisRecord {
    pub fn new(task: AnalysisTask, fields: Map<String, Value>) -> Self {
        Self { task, fields }
    }

    pub fn task(&self) -> AnalysisTask {
        self.task
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// String field with a display default. Bare numbers coerce to their
    /// decimal text rather than falling back.
    pub fn text(&self, name: &str, default: &str) -> String {
        match self.fields.get(name) {
            Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Some(Value::Number(number)) => number.to_string(),
            _ => default.to_string(),
        }
    }

    /// Integer field with a display default. Numeric strings (a shape some
    /// models produce for scores) parse rather than falling back.
    pub fn int(&self, name: &str, default: i64) -> i64 {
        match self.fields.get(name) {
            Some(Value::Number(number)) => number.as_i64().unwrap_or(default),
            Some(Value::String(text)) => text.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// String-list field. A scalar string coerces to a one-element list;
    /// absent or null reads as empty.
    pub fn list(&self, name: &str) -> Vec<String> {
        match self.fields.get(name) {
            Some(Value::Array(rows)) => rows
                .iter()
                .filter_map(|row| match row {
                    Value::String(text) if !text.trim().is_empty() => {
                        Some(text.trim().to_string())
                    }
                    Value::Number(number) => Some(number.to_string()),
                    _ => None,
                })
                .collect(),
            Some(Value::String(text)) if !text.trim().is_empty() => {
                vec![text.trim().to_string()]
            }
            _ => Vec::new(),
        }
    }
}
