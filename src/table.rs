use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single cell in a table. Parsing at the read boundary picks the
/// narrowest variant that fits; everything downstream matches on this
/// instead of re-parsing strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Parse a raw text field into the narrowest matching variant.
    pub fn parse(field: &str) -> Value {
        let trimmed = field.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Value::Float(f);
        }
        Value::Text(trimmed.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce to a numeric variant; unparsable values become Null.
    pub fn coerce_numeric(&self) -> Value {
        match self {
            Value::Int(_) | Value::Float(_) | Value::Null => self.clone(),
            Value::Text(s) => match Value::parse(s) {
                v @ (Value::Int(_) | Value::Float(_)) => v,
                _ => Value::Null,
            },
        }
    }

    /// Canonical string form used for duplicate detection.
    fn canonical(&self) -> String {
        match self {
            Value::Null => "\u{0}".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
        }
    }
}

/// Which duplicate to retain when deduplicating on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    First,
    Last,
}

/// Ordered named columns over rows of `Value`. The medium passed between
/// every pipeline stage; no row order is guaranteed or required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: Vec<S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn has_columns(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.has_column(n))
    }

    /// Append a row, padding short rows with Null and dropping extras so the
    /// table stays rectangular.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Trim and case-fold every column name. Applied once at the boundary
    /// between reading and every downstream consumer.
    pub fn normalize_column_names(&mut self) {
        for c in &mut self.columns {
            *c = c.trim().to_lowercase();
        }
    }

    /// Add (or overwrite) a column; the value vector is padded with Null to
    /// the current row count.
    pub fn set_column(&mut self, name: &str, mut values: Vec<Value>) {
        values.resize(self.rows.len(), Value::Null);
        match self.column_index(name) {
            Some(idx) => {
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row.push(v);
                }
            }
        }
    }

    /// Rename a column in place. A no-op when the source column is absent
    /// or the target name is already taken.
    pub fn rename_column(&mut self, from: &str, to: &str) {
        if self.has_column(to) {
            return;
        }
        if let Some(idx) = self.column_index(from) {
            self.columns[idx] = to.to_string();
        }
    }

    /// Remove a column entirely; a no-op when it does not exist.
    pub fn remove_column(&mut self, name: &str) {
        if let Some(idx) = self.column_index(name) {
            self.columns.remove(idx);
            for row in &mut self.rows {
                row.remove(idx);
            }
        }
    }

    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Non-null values of a column interpreted as f64.
    pub fn numeric_values(&self, name: &str) -> Vec<f64> {
        match self.column_index(name) {
            Some(idx) => self.rows.iter().filter_map(|r| r[idx].as_f64()).collect(),
            None => Vec::new(),
        }
    }

    /// A column is numeric when it has at least one non-null value and every
    /// non-null value is Int or Float.
    pub fn is_numeric_column(&self, name: &str) -> bool {
        let idx = match self.column_index(name) {
            Some(i) => i,
            None => return false,
        };
        let mut seen = false;
        for row in &self.rows {
            match &row[idx] {
                Value::Null => {}
                Value::Int(_) | Value::Float(_) => seen = true,
                Value::Text(_) => return false,
            }
        }
        seen
    }

    /// Replace a column's values through a cell-wise mapping.
    pub fn map_column<F: FnMut(&Value) -> Value>(&mut self, name: &str, mut f: F) {
        if let Some(idx) = self.column_index(name) {
            for row in &mut self.rows {
                row[idx] = f(&row[idx]);
            }
        }
    }

    /// Keep only rows matching the predicate; returns how many were removed.
    pub fn retain_rows<F: FnMut(&[Value]) -> bool>(&mut self, mut keep: F) -> usize {
        let before = self.rows.len();
        self.rows.retain(|r| keep(r));
        before - self.rows.len()
    }

    /// Drop exact full-row duplicates, keeping the first occurrence.
    pub fn dedup_full_rows(&mut self) -> usize {
        let mut seen = HashMap::new();
        let mut keep = vec![false; self.rows.len()];
        for (i, row) in self.rows.iter().enumerate() {
            let key = row_key(row, &(0..row.len()).collect::<Vec<_>>());
            if seen.insert(key, i).is_none() {
                keep[i] = true;
            }
        }
        self.apply_keep_mask(&keep)
    }

    /// Drop duplicates on a key-column subset. When any key column is absent
    /// the table is left untouched (callers validate shape separately).
    pub fn dedup_by_keys(&mut self, keys: &[&str], keep_policy: Keep) -> usize {
        let idxs: Vec<usize> = match keys.iter().map(|k| self.column_index(k)).collect() {
            Some(idxs) => idxs,
            None => return 0,
        };
        let mut winner: HashMap<String, usize> = HashMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            let key = row_key(row, &idxs);
            match keep_policy {
                Keep::First => {
                    winner.entry(key).or_insert(i);
                }
                Keep::Last => {
                    winner.insert(key, i);
                }
            }
        }
        let mut keep = vec![false; self.rows.len()];
        for &i in winner.values() {
            keep[i] = true;
        }
        self.apply_keep_mask(&keep)
    }

    fn apply_keep_mask(&mut self, keep: &[bool]) -> usize {
        let before = self.rows.len();
        let mut i = 0;
        self.rows.retain(|_| {
            let k = keep[i];
            i += 1;
            k
        });
        before - self.rows.len()
    }
}

fn row_key(row: &[Value], idxs: &[usize]) -> String {
    let mut key = String::new();
    for &i in idxs {
        key.push_str(&row[i].canonical());
        key.push('\u{1}');
    }
    key
}

/// Arithmetic mean; None on an empty slice.
pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

/// Sample standard deviation (n-1 denominator); 0.0 when fewer than two
/// values, matching the downstream zero-fill policy.
pub fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs).unwrap();
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

/// Linearly interpolated quantile (q in [0,1]); None on an empty slice.
pub fn quantile(xs: &[f64], q: f64) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut t = Table::new(vec!["id", "score"]);
        t.push_row(vec![Value::Int(1), Value::Int(80)]);
        t.push_row(vec![Value::Int(1), Value::Int(95)]);
        t.push_row(vec![Value::Int(2), Value::Int(70)]);
        t
    }

    #[test]
    fn parse_picks_narrowest_variant() {
        assert_eq!(Value::parse("42"), Value::Int(42));
        assert_eq!(Value::parse("4.5"), Value::Float(4.5));
        assert_eq!(Value::parse("  "), Value::Null);
        assert_eq!(Value::parse("AAA"), Value::Text("AAA".to_string()));
    }

    #[test]
    fn dedup_by_keys_keep_last_prefers_later_row() {
        let mut t = sample();
        let removed = t.dedup_by_keys(&["id"], Keep::Last);
        assert_eq!(removed, 1);
        assert_eq!(t.row_count(), 2);
        assert_eq!(t.value(0, "score"), Some(&Value::Int(95)));
    }

    #[test]
    fn dedup_by_keys_keep_first_prefers_earlier_row() {
        let mut t = sample();
        t.dedup_by_keys(&["id"], Keep::First);
        assert_eq!(t.value(0, "score"), Some(&Value::Int(80)));
    }

    #[test]
    fn dedup_missing_key_column_is_a_noop() {
        let mut t = sample();
        assert_eq!(t.dedup_by_keys(&["absent"], Keep::First), 0);
        assert_eq!(t.row_count(), 3);
    }

    #[test]
    fn full_row_dedup_drops_exact_copies_only() {
        let mut t = sample();
        t.push_row(vec![Value::Int(2), Value::Int(70)]);
        assert_eq!(t.dedup_full_rows(), 1);
        assert_eq!(t.row_count(), 3);
    }

    #[test]
    fn normalize_column_names_trims_and_folds() {
        let mut t = Table::new(vec![" Id_Student ", "SCORE"]);
        t.normalize_column_names();
        assert_eq!(t.columns(), &["id_student".to_string(), "score".to_string()]);
    }

    #[test]
    fn rename_column_never_clobbers_an_existing_name() {
        let mut t = Table::new(vec!["id_student", "student_id"]);
        t.rename_column("id_student", "student_id");
        assert_eq!(t.columns(), &["id_student".to_string(), "student_id".to_string()]);
        t.rename_column("missing", "anything");
        assert_eq!(t.column_count(), 2);
    }

    #[test]
    fn quantile_interpolates() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&xs, 0.5), Some(2.5));
        assert_eq!(quantile(&xs, 1.0), Some(4.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn sample_std_is_zero_for_singletons() {
        assert_eq!(sample_std(&[5.0]), 0.0);
        assert!((sample_std(&[2.0, 4.0]) - std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn numeric_column_detection_rejects_text() {
        let mut t = Table::new(vec!["a"]);
        t.push_row(vec![Value::Int(1)]);
        assert!(t.is_numeric_column("a"));
        t.push_row(vec![Value::Text("x".into())]);
        assert!(!t.is_numeric_column("a"));
    }
}
