use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::{EtlError, Result};
use crate::table::{Table, Value};

const ENROLLMENT_KEYS: &[&str] = &["student_id", "course_module", "course_presentation"];

fn cell_key(v: &Value) -> String {
    match v {
        Value::Null => "\u{0}".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => s.clone(),
    }
}

fn row_key(table: &Table, row: usize, keys: &[String]) -> Option<String> {
    let mut out = String::new();
    for key in keys {
        let v = table.value(row, key)?;
        if v.is_null() {
            return None;
        }
        out.push_str(&cell_key(v));
        out.push('\u{1}');
    }
    Some(out)
}

/// Inner-join encoded demographics with derived features into the serving
/// table. Joins on the enrollment triple when both sides carry it, otherwise
/// degrades to every column name the two sides share.
pub fn merge_for_analytics(demographics: &Table, features: &Table) -> Result<Table> {
    if demographics.is_empty() {
        return Err(EtlError::EmptyInput("encoded demographics".to_string()));
    }
    if features.is_empty() {
        return Err(EtlError::EmptyInput("derived features".to_string()));
    }

    let join_keys: Vec<String> = if demographics.has_columns(ENROLLMENT_KEYS)
        && features.has_columns(ENROLLMENT_KEYS)
    {
        ENROLLMENT_KEYS.iter().map(|k| k.to_string()).collect()
    } else {
        let shared: Vec<String> = demographics
            .columns()
            .iter()
            .filter(|c| features.has_column(c))
            .cloned()
            .collect();
        if shared.is_empty() {
            return Err(EtlError::ShapeMismatch {
                table: "analytics.student_features".to_string(),
                detail: "no shared columns between demographics and features".to_string(),
            });
        }
        warn!("Full enrollment key unavailable; joining on {:?}", shared);
        shared
    };

    let mut feature_rows: HashMap<String, usize> = HashMap::new();
    for i in 0..features.row_count() {
        if let Some(key) = row_key(features, i, &join_keys) {
            feature_rows.entry(key).or_insert(i);
        }
    }

    let feature_columns: Vec<String> = features
        .columns()
        .iter()
        .filter(|c| !join_keys.contains(c))
        .cloned()
        .collect();
    let mut columns: Vec<String> = demographics.columns().to_vec();
    for c in &feature_columns {
        // Column collisions keep both sides apart.
        if columns.contains(c) {
            columns.push(format!("{c}_features"));
        } else {
            columns.push(c.clone());
        }
    }

    let mut merged = Table::new(columns);
    let mut matched = 0usize;
    for i in 0..demographics.row_count() {
        let Some(key) = row_key(demographics, i, &join_keys) else {
            continue;
        };
        let Some(&feature_row) = feature_rows.get(&key) else {
            continue;
        };
        matched += 1;
        let mut row: Vec<Value> = demographics.rows()[i].clone();
        for c in &feature_columns {
            row.push(
                features
                    .value(feature_row, c)
                    .cloned()
                    .unwrap_or(Value::Null),
            );
        }
        merged.push_row(row);
    }

    info!(
        "Merged analytics table: {} of {} demographic rows matched features",
        matched,
        demographics.row_count()
    );
    Ok(merged)
}
