use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::normalize::ScalingInfo;
use crate::table::{Table, Value};

/// How categorical feature columns are turned into numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingMethod {
    Label,
    Ordinal,
    OneHot,
}

/// Columns with an inherent order get rank codes instead of alphabetical
/// ones. Anything not listed here falls back to label encoding.
static ORDINAL_ORDERS: Lazy<BTreeMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut m = BTreeMap::new();
    m.insert("age_band", vec!["0-35", "35-55", "55+"]);
    m.insert(
        "highest_education",
        vec![
            "No Formal quals",
            "Lower Than A Level",
            "A Level or Equivalent",
            "HE Qualification",
            "Post Graduate Qualification",
        ],
    );
    m.insert(
        "imd_band",
        vec![
            "0-10%", "10-20%", "20-30%", "30-40%", "40-50%", "50-60%", "60-70%", "70-80%",
            "80-90%", "90-100%",
        ],
    );
    m
});

/// Fitted categorical mappings, replayable against fresh data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingInfo {
    pub method: EncodingMethod,
    pub columns_encoded: Vec<String>,
    pub mappings: BTreeMap<String, BTreeMap<String, i64>>,
}

/// Everything fitted during a training run: the label scheme for the
/// outcome, the categorical mappings, and the scaling statistics. Persisted
/// as JSON so later runs transform identically instead of refitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedParams {
    pub target_mapping: BTreeMap<String, i64>,
    pub categorical: EncodingInfo,
    pub scaling: Option<ScalingInfo>,
    pub fitted_at: DateTime<Utc>,
}

impl FittedParams {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<FittedParams> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn cell_text(v: &Value) -> Option<String> {
    match v {
        Value::Text(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Null => None,
    }
}

/// Map the outcome column through a fixed label scheme into a new
/// `{column}_encoded` column. Null and unmapped values become -1; a table
/// without the column passes through with a warning.
pub fn encode_target(table: &mut Table, column: &str, mapping: &BTreeMap<String, i64>) {
    if !table.has_column(column) {
        warn!("Target column '{}' not present; nothing to encode", column);
        return;
    }
    let Some(values) = table.column(column) else {
        return;
    };
    let encoded: Vec<Value> = values
        .iter()
        .map(|v| {
            cell_text(v)
                .and_then(|s| mapping.get(&s).copied())
                .map(Value::Int)
                .unwrap_or(Value::Int(-1))
        })
        .collect();
    table.set_column(&format!("{column}_encoded"), encoded);
    info!("Encoded target column '{}'", column);
}

fn distinct_sorted(table: &Table, column: &str) -> Vec<String> {
    let mut values: Vec<String> = match table.column(column) {
        Some(col) => col.iter().filter_map(|v| cell_text(v)).collect(),
        None => Vec::new(),
    };
    values.sort();
    values.dedup();
    values
}

fn label_mapping(table: &Table, column: &str) -> BTreeMap<String, i64> {
    // Nulls are treated as the literal category "Unknown" so they land on a
    // stable code instead of -1.
    let mut values = distinct_sorted(table, column);
    if table
        .column(column)
        .map(|col| col.iter().any(|v| v.is_null()))
        .unwrap_or(false)
        && !values.contains(&"Unknown".to_string())
    {
        values.push("Unknown".to_string());
        values.sort();
    }
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| (v, i as i64))
        .collect()
}

fn ordinal_mapping(order: &[&str]) -> BTreeMap<String, i64> {
    order
        .iter()
        .enumerate()
        .map(|(i, v)| (v.to_string(), i as i64))
        .collect()
}

/// Fit mappings for the requested categorical columns. Ordinal encoding
/// uses the known category orders and falls back to label codes for columns
/// without one; one-hot records the category set per column.
pub fn fit_categorical(table: &Table, columns: &[String], method: EncodingMethod) -> EncodingInfo {
    let mut mappings = BTreeMap::new();
    let mut encoded = Vec::new();
    for column in columns {
        if !table.has_column(column) {
            warn!("Categorical column '{}' not present; skipping", column);
            continue;
        }
        let mapping = match method {
            EncodingMethod::Label | EncodingMethod::OneHot => label_mapping(table, column),
            EncodingMethod::Ordinal => match ORDINAL_ORDERS.get(column.as_str()) {
                Some(order) => ordinal_mapping(order),
                None => label_mapping(table, column),
            },
        };
        mappings.insert(column.clone(), mapping);
        encoded.push(column.clone());
    }
    info!("Fitted {:?} encoding on {} columns", method, encoded.len());
    EncodingInfo {
        method,
        columns_encoded: encoded,
        mappings,
    }
}

fn ordinal_null_code(column: &str, mapping: &BTreeMap<String, i64>) -> i64 {
    // Nulls take the middle category of an ordered scale.
    match ORDINAL_ORDERS.get(column) {
        Some(order) if !order.is_empty() => mapping
            .get(order[order.len() / 2])
            .copied()
            .unwrap_or(-1),
        _ => -1,
    }
}

/// Replay fitted mappings onto a table. Label and ordinal codes replace the
/// source column in place; one-hot expands into `{column}_{value}` indicator
/// columns and drops the source. Unseen categories become -1.
pub fn apply_categorical(table: &mut Table, info: &EncodingInfo) {
    for column in &info.columns_encoded {
        let Some(mapping) = info.mappings.get(column) else {
            continue;
        };
        if !table.has_column(column) {
            warn!("Categorical column '{}' missing at apply time; skipping", column);
            continue;
        }
        match info.method {
            EncodingMethod::Label | EncodingMethod::Ordinal => {
                let null_code = match info.method {
                    EncodingMethod::Ordinal if ORDINAL_ORDERS.contains_key(column.as_str()) => {
                        ordinal_null_code(column, mapping)
                    }
                    _ => mapping.get("Unknown").copied().unwrap_or(-1),
                };
                table.map_column(column, |v| match cell_text(v) {
                    Some(s) => Value::Int(mapping.get(&s).copied().unwrap_or(-1)),
                    None => Value::Int(null_code),
                });
            }
            EncodingMethod::OneHot => {
                let source: Vec<Option<String>> = table
                    .column(column)
                    .map(|col| col.iter().map(|v| cell_text(v)).collect())
                    .unwrap_or_default();
                for category in mapping.keys() {
                    let indicator: Vec<Value> = source
                        .iter()
                        .map(|s| Value::Int((s.as_deref() == Some(category)) as i64))
                        .collect();
                    table.set_column(&format!("{column}_{category}"), indicator);
                }
                table.remove_column(column);
            }
        }
    }
}
