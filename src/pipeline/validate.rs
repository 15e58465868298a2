use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::ExpectedType;
use crate::error::Result;
use crate::table::{quantile, Table, Value};

/// Overall verdict for one table's quality report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pass,
    Warning,
    Fail,
    Empty,
}

/// Read-only quality report for one table. Issues are check failures and
/// drive the status; warnings are informational and never fail a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub table: String,
    pub status: ValidationStatus,
    pub row_count: usize,
    pub checks_total: usize,
    pub checks_passed: usize,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn empty(table: &str) -> Self {
        Self {
            table: table.to_string(),
            status: ValidationStatus::Empty,
            row_count: 0,
            checks_total: 0,
            checks_passed: 0,
            issues: vec!["Dataset is empty".to_string()],
            warnings: Vec::new(),
        }
    }
}

/// Validates raw tables without mutating them. Declared column types come
/// from the run config; tables the config does not mention simply skip the
/// conformance check.
pub struct Validator {
    data_types: BTreeMap<String, BTreeMap<String, ExpectedType>>,
}

impl Validator {
    pub fn new(data_types: BTreeMap<String, BTreeMap<String, ExpectedType>>) -> Self {
        Self { data_types }
    }

    /// Run every check against one table. `key_columns` names the logical
    /// key for the duplicate check; an empty slice means full-row identity.
    pub fn validate(&self, name: &str, table: &Table, key_columns: &[&str]) -> ValidationReport {
        if table.is_empty() {
            warn!("Table '{}' is empty; skipping checks", name);
            return ValidationReport::empty(name);
        }

        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let mut checks_total = 0;
        let mut checks_passed = 0;
        let mut run_check = |failed: Vec<String>, sink: &mut Vec<String>| {
            checks_total += 1;
            if failed.is_empty() {
                checks_passed += 1;
            }
            sink.extend(failed);
        };

        run_check(check_duplicates(table, key_columns), &mut issues);
        run_check(check_missing(table), &mut warnings);
        run_check(
            check_types(table, &self.data_types.get(name).cloned().unwrap_or_default()),
            &mut issues,
        );
        run_check(check_ranges(table), &mut issues);
        run_check(check_referential(table), &mut issues);
        run_check(check_outliers(table), &mut warnings);

        let status = match issues.len() {
            0 => ValidationStatus::Pass,
            1 | 2 => ValidationStatus::Warning,
            _ => ValidationStatus::Fail,
        };
        info!(
            "Validated '{}': {:?} ({}/{} checks passed, {} issues, {} warnings)",
            name,
            status,
            checks_passed,
            checks_total,
            issues.len(),
            warnings.len()
        );
        ValidationReport {
            table: name.to_string(),
            status,
            row_count: table.row_count(),
            checks_total,
            checks_passed,
            issues,
            warnings,
        }
    }

    /// Write one JSON report per table into `dir`.
    pub fn save_reports(&self, dir: &Path, reports: &[ValidationReport]) -> Result<()> {
        fs::create_dir_all(dir)?;
        for report in reports {
            let path = dir.join(format!("validation_{}.json", report.table));
            fs::write(&path, serde_json::to_string_pretty(report)?)?;
        }
        info!("Wrote {} validation reports to {}", reports.len(), dir.display());
        Ok(())
    }
}

/// Counts every row participating in a duplicated key, not just the extras.
fn check_duplicates(table: &Table, key_columns: &[&str]) -> Vec<String> {
    let idxs: Vec<usize> = if key_columns.is_empty() {
        (0..table.column_count()).collect()
    } else {
        match key_columns.iter().map(|k| table.column_index(k)).collect() {
            Some(idxs) => idxs,
            // Shape problems surface through the type/range checks instead.
            None => return Vec::new(),
        }
    };

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for row in table.rows() {
        let mut key = String::new();
        for &i in &idxs {
            key.push_str(&format!("{:?}\u{1}", row[i]));
        }
        *counts.entry(key).or_insert(0) += 1;
    }
    let duplicated: usize = counts.values().filter(|&&c| c > 1).sum();
    if duplicated > 0 {
        vec![format!("{duplicated} rows share a duplicated key")]
    } else {
        Vec::new()
    }
}

fn check_missing(table: &Table) -> Vec<String> {
    let mut warnings = Vec::new();
    for column in table.columns() {
        let idx = table.column_index(column).unwrap_or(0);
        let missing = table.rows().iter().filter(|r| r[idx].is_null()).count();
        if missing > 0 {
            let pct = 100.0 * missing as f64 / table.row_count() as f64;
            warnings.push(format!("Column '{column}' has {missing} missing values ({pct:.1}%)"));
        }
    }
    warnings
}

fn check_types(table: &Table, expected: &BTreeMap<String, ExpectedType>) -> Vec<String> {
    let mut issues = Vec::new();
    for (column, want) in expected {
        let Some(values) = table.column(column) else {
            issues.push(format!("Declared column '{column}' is missing"));
            continue;
        };
        let mut ints = 0usize;
        let mut floats = 0usize;
        let mut texts = 0usize;
        for v in values {
            match v {
                Value::Null => {}
                Value::Int(_) => ints += 1,
                Value::Float(_) => floats += 1,
                Value::Text(_) => texts += 1,
            }
        }
        let total = ints + floats + texts;
        if total == 0 {
            continue;
        }
        let conforms = match want {
            ExpectedType::Int => ints >= floats.max(texts),
            // Int cells satisfy a float declaration.
            ExpectedType::Float => ints + floats >= texts,
            ExpectedType::Text => texts >= ints.max(floats),
        };
        if !conforms {
            issues.push(format!("Column '{column}' does not conform to declared type {want:?}"));
        }
    }
    issues
}

fn check_ranges(table: &Table) -> Vec<String> {
    let mut issues = Vec::new();
    if table.has_column("score") {
        let out = table
            .numeric_values("score")
            .iter()
            .filter(|&&s| !(0.0..=100.0).contains(&s))
            .count();
        if out > 0 {
            issues.push(format!("{out} score values outside [0, 100]"));
        }
    }
    if table.has_column("click_count") {
        let out = table
            .numeric_values("click_count")
            .iter()
            .filter(|&&c| c < 0.0)
            .count();
        if out > 0 {
            issues.push(format!("{out} negative click_count values"));
        }
    }
    issues
}

// Cross-table reference checking needs the full entity set in scope; until
// that lands this check always passes.
fn check_referential(_table: &Table) -> Vec<String> {
    Vec::new()
}

/// IQR fences on numeric measure columns. Identifier columns and columns
/// with fewer than 10 values are skipped; results are advisory only.
fn check_outliers(table: &Table) -> Vec<String> {
    let mut warnings = Vec::new();
    for column in table.columns() {
        if column.ends_with("_id") || column == "date" {
            continue;
        }
        if !table.is_numeric_column(column) {
            continue;
        }
        let values = table.numeric_values(column);
        if values.len() < 10 {
            continue;
        }
        let (Some(q1), Some(q3)) = (quantile(&values, 0.25), quantile(&values, 0.75)) else {
            continue;
        };
        let iqr = q3 - q1;
        let lo = q1 - 1.5 * iqr;
        let hi = q3 + 1.5 * iqr;
        let outliers = values.iter().filter(|&&v| v < lo || v > hi).count();
        if outliers > 0 {
            warnings.push(format!("Column '{column}' has {outliers} IQR outliers"));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submissions() -> Table {
        let mut t = Table::new(vec!["assessment_id", "student_id", "score"]);
        t.push_row(vec![Value::Int(100), Value::Int(1), Value::Float(85.0)]);
        t.push_row(vec![Value::Int(100), Value::Int(1), Value::Float(90.0)]);
        t.push_row(vec![Value::Int(101), Value::Int(2), Value::Float(150.0)]);
        t
    }

    #[test]
    fn empty_table_reports_empty_status() {
        let v = Validator::new(BTreeMap::new());
        let report = v.validate("student_info", &Table::default(), &[]);
        assert_eq!(report.status, ValidationStatus::Empty);
        assert_eq!(report.checks_total, 0);
        assert_eq!(report.issues, vec!["Dataset is empty".to_string()]);
    }

    #[test]
    fn duplicates_count_all_participating_rows() {
        let v = Validator::new(BTreeMap::new());
        let report = v.validate(
            "assessment_submissions",
            &submissions(),
            &["assessment_id", "student_id"],
        );
        assert!(report
            .issues
            .iter()
            .any(|i| i == "2 rows share a duplicated key"));
    }

    #[test]
    fn out_of_range_scores_are_issues() {
        let v = Validator::new(BTreeMap::new());
        let report = v.validate("assessment_submissions", &submissions(), &[]);
        assert!(report.issues.iter().any(|i| i.contains("score values outside")));
    }

    #[test]
    fn two_issues_is_warning_status() {
        let v = Validator::new(BTreeMap::new());
        // Duplicate key + out-of-range score = 2 issues.
        let report = v.validate(
            "assessment_submissions",
            &submissions(),
            &["assessment_id", "student_id"],
        );
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.status, ValidationStatus::Warning);
    }

    #[test]
    fn missing_values_warn_but_pass() {
        let mut t = Table::new(vec!["student_id", "gender"]);
        t.push_row(vec![Value::Int(1), Value::Text("M".into())]);
        t.push_row(vec![Value::Int(2), Value::Null]);
        let v = Validator::new(BTreeMap::new());
        let report = v.validate("student_info", &t, &["student_id"]);
        assert_eq!(report.status, ValidationStatus::Pass);
        assert!(report.warnings.iter().any(|w| w.contains("gender")));
    }

    #[test]
    fn declared_type_mismatch_is_an_issue() {
        let mut types = BTreeMap::new();
        let mut cols = BTreeMap::new();
        cols.insert("score".to_string(), ExpectedType::Float);
        cols.insert("student_id".to_string(), ExpectedType::Int);
        types.insert("assessment_submissions".to_string(), cols);

        let mut t = Table::new(vec!["student_id", "score"]);
        t.push_row(vec![Value::Int(1), Value::Text("eighty".into())]);
        t.push_row(vec![Value::Int(2), Value::Text("ninety".into())]);
        let v = Validator::new(types);
        let report = v.validate("assessment_submissions", &t, &[]);
        assert!(report.issues.iter().any(|i| i.contains("does not conform")));
    }

    #[test]
    fn outliers_need_ten_values_and_only_warn() {
        let mut t = Table::new(vec!["click_count"]);
        for _ in 0..11 {
            t.push_row(vec![Value::Int(2)]);
        }
        t.push_row(vec![Value::Int(500)]);
        let v = Validator::new(BTreeMap::new());
        let report = v.validate("activity_log", &t, &[]);
        assert!(report.warnings.iter().any(|w| w.contains("IQR outliers")));
        assert_eq!(report.status, ValidationStatus::Pass);
    }

    #[test]
    fn reports_serialize_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let v = Validator::new(BTreeMap::new());
        let report = v.validate("assessment_submissions", &submissions(), &[]);
        v.save_reports(dir.path(), &[report]).unwrap();
        let content =
            std::fs::read_to_string(dir.path().join("validation_assessment_submissions.json"))
                .unwrap();
        assert!(content.contains("\"WARNING\"") || content.contains("\"PASS\""));
    }
}
