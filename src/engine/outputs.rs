//! Stack outputs

use serde_json::{Map, Value};

const MASK: &str = "[secret]";

/// One exported value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputValue {
    pub key: String,
    pub value: String,
    pub secret: bool,
}

impl OutputValue {
    fn shown(&self, show_secrets: bool) -> &str {
        if self.secret && !show_secrets {
            MASK
        } else {
            &self.value
        }
    }
}

/// Outputs of a successful run, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutputs {
    pub entries: Vec<OutputValue>,
}

impl RunOutputs {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// JSON object keyed by output name
    pub fn to_json(&self, show_secrets: bool) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|e| (e.key.clone(), Value::String(e.shown(show_secrets).to_string())))
            .collect();
        Value::Object(map)
    }

    /// Human readable listing; multi-line values are indented under their key
    pub fn render_table(&self, show_secrets: bool) -> String {
        let width = self.entries.iter().map(|e| e.key.len()).max().unwrap_or(0);
        let mut out = String::new();
        for entry in &self.entries {
            let value = entry.shown(show_secrets).trim_end();
            let mut lines = value.lines();
            let first = lines.next().unwrap_or_default();
            out.push_str(&format!("{:<width$}  {}\n", entry.key, first));
            for line in lines {
                out.push_str(&format!("{:<width$}  {}\n", "", line));
            }
        }
        out
    }
}
