use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::table::{quantile, Keep, Table, Value};

const STUDENT_KEYS: &[&str] = &["student_id", "course_module", "course_presentation"];
const ACTIVITY_KEYS: &[&str] = &["student_id", "site_id", "date"];
const SUBMISSION_KEYS: &[&str] = &["assessment_id", "student_id"];

/// Categorical demographics that get an explicit "Unknown" instead of null.
const CATEGORICAL_FILLS: &[&str] = &[
    "gender",
    "region",
    "highest_education",
    "imd_band",
    "age_band",
    "disability",
    "final_result",
];

/// What one table's cleaning pass did, broken down by removal reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanReport {
    pub table: String,
    pub original_rows: usize,
    pub final_rows: usize,
    pub removed: BTreeMap<String, usize>,
    pub outlier_threshold: Option<f64>,
}

impl CleanReport {
    fn new(table: &str, original_rows: usize) -> Self {
        Self {
            table: table.to_string(),
            original_rows,
            final_rows: original_rows,
            removed: BTreeMap::new(),
            outlier_threshold: None,
        }
    }

    fn record(&mut self, reason: &str, count: usize) {
        if count > 0 {
            *self.removed.entry(reason.to_string()).or_insert(0) += count;
        }
        self.final_rows = self.final_rows.saturating_sub(count);
    }

    pub fn removal_rate(&self) -> f64 {
        if self.original_rows == 0 {
            return 0.0;
        }
        (self.original_rows - self.final_rows) as f64 / self.original_rows as f64
    }
}

/// Totals across one cleaning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningSummary {
    pub total_original: usize,
    pub total_final: usize,
    pub total_removed: usize,
    pub removal_rate: f64,
    pub tables_cleaned: usize,
}

fn fill_null(table: &mut Table, column: &str, fill: Value) {
    table.map_column(column, |v| {
        if v.is_null() {
            fill.clone()
        } else {
            v.clone()
        }
    });
}

fn coerce_columns(table: &mut Table, columns: &[&str]) {
    for column in columns {
        table.map_column(column, Value::coerce_numeric);
    }
}

/// Drop rows with a null in any key column. A key column that is absent
/// altogether makes every row unidentifiable, so everything goes.
fn drop_null_keys(table: &mut Table, keys: &[&str], report: &mut CleanReport) {
    if !table.has_columns(keys) {
        warn!(
            "Table '{}' is missing key columns {:?}; dropping all rows",
            report.table, keys
        );
        let removed = table.retain_rows(|_| false);
        report.record("missing_key_columns", removed);
        return;
    }
    let idxs: Vec<usize> = keys.iter().filter_map(|k| table.column_index(k)).collect();
    let removed = table.retain_rows(|row| idxs.iter().all(|&i| !row[i].is_null()));
    report.record("null_keys", removed);
}

pub fn clean_student_info(mut table: Table) -> (Table, CleanReport) {
    let mut report = CleanReport::new("student_info", table.row_count());
    table.normalize_column_names();

    report.record("full_duplicates", table.dedup_full_rows());
    report.record(
        "key_duplicates",
        table.dedup_by_keys(STUDENT_KEYS, Keep::First),
    );

    coerce_columns(
        &mut table,
        &["student_id", "previous_attempts", "studied_credits"],
    );
    fill_null(&mut table, "previous_attempts", Value::Int(0));
    fill_null(&mut table, "studied_credits", Value::Int(0));
    for column in CATEGORICAL_FILLS {
        if table.has_column(column) {
            fill_null(&mut table, column, Value::Text("Unknown".to_string()));
        }
    }
    table.map_column("disability", |v| match v.as_str() {
        Some("Y") => Value::Text("Yes".to_string()),
        Some("N") => Value::Text("No".to_string()),
        _ => v.clone(),
    });

    drop_null_keys(&mut table, STUDENT_KEYS, &mut report);
    (table, report)
}

pub fn clean_activity_log(mut table: Table) -> (Table, CleanReport) {
    let mut report = CleanReport::new("activity_log", table.row_count());
    table.normalize_column_names();

    report.record("full_duplicates", table.dedup_full_rows());
    report.record(
        "key_duplicates",
        table.dedup_by_keys(ACTIVITY_KEYS, Keep::First),
    );

    coerce_columns(&mut table, &["student_id", "site_id", "date", "click_count"]);
    fill_null(&mut table, "click_count", Value::Int(0));
    drop_null_keys(&mut table, ACTIVITY_KEYS, &mut report);

    if let Some(idx) = table.column_index("click_count") {
        let removed = table.retain_rows(|row| row[idx].as_f64().map(|c| c >= 0.0).unwrap_or(false));
        report.record("negative_clicks", removed);

        // Extreme click bursts are dropped above the per-run 99th
        // percentile; the threshold lands in the report for audit.
        let clicks = table.numeric_values("click_count");
        if let Some(threshold) = quantile(&clicks, 0.99) {
            report.outlier_threshold = Some(threshold);
            let removed =
                table.retain_rows(|row| row[idx].as_f64().map(|c| c <= threshold).unwrap_or(false));
            report.record("click_outliers", removed);
        }
    }
    (table, report)
}

pub fn clean_assessment_submissions(mut table: Table) -> (Table, CleanReport) {
    let mut report = CleanReport::new("assessment_submissions", table.row_count());
    table.normalize_column_names();

    report.record("full_duplicates", table.dedup_full_rows());
    // Resubmissions keep the most recent attempt.
    report.record(
        "key_duplicates",
        table.dedup_by_keys(SUBMISSION_KEYS, Keep::Last),
    );

    coerce_columns(
        &mut table,
        &["assessment_id", "student_id", "score", "submission_date", "banked_flag"],
    );
    fill_null(&mut table, "banked_flag", Value::Int(0));
    drop_null_keys(&mut table, SUBMISSION_KEYS, &mut report);

    if let Some(idx) = table.column_index("score") {
        let removed = table.retain_rows(|row| {
            row[idx]
                .as_f64()
                .map(|s| (0.0..=100.0).contains(&s))
                .unwrap_or(false)
        });
        report.record("invalid_scores", removed);
    }
    (table, report)
}

pub fn clean_assessments(mut table: Table) -> (Table, CleanReport) {
    let mut report = CleanReport::new("assessments", table.row_count());
    table.normalize_column_names();

    report.record("full_duplicates", table.dedup_full_rows());
    report.record(
        "key_duplicates",
        table.dedup_by_keys(&["assessment_id"], Keep::First),
    );
    coerce_columns(&mut table, &["assessment_id", "weight", "due_date"]);
    fill_null(&mut table, "weight", Value::Float(0.0));
    drop_null_keys(&mut table, &["assessment_id"], &mut report);
    (table, report)
}

/// Registrations and courses carry no measures to repair; they only get
/// canonical column names.
pub fn clean_passthrough(name: &str, mut table: Table) -> (Table, CleanReport) {
    let report = CleanReport::new(name, table.row_count());
    table.normalize_column_names();
    (table, report)
}

/// Clean every non-empty entity table. Empty inputs are skipped entirely so
/// a partial extract never produces empty-but-present staging tables.
pub fn clean_all(
    tables: BTreeMap<String, Table>,
) -> (BTreeMap<String, Table>, Vec<CleanReport>, CleaningSummary) {
    let mut cleaned = BTreeMap::new();
    let mut reports = Vec::new();
    for (name, table) in tables {
        if table.is_empty() {
            warn!("Skipping empty table '{}'", name);
            continue;
        }
        let (table, report) = match name.as_str() {
            "student_info" => clean_student_info(table),
            "activity_log" => clean_activity_log(table),
            "assessment_submissions" => clean_assessment_submissions(table),
            "assessments" => clean_assessments(table),
            other => clean_passthrough(other, table),
        };
        info!(
            "Cleaned '{}': {} -> {} rows ({:.1}% removed)",
            name,
            report.original_rows,
            report.final_rows,
            100.0 * report.removal_rate()
        );
        cleaned.insert(name, table);
        reports.push(report);
    }

    let total_original: usize = reports.iter().map(|r| r.original_rows).sum();
    let total_final: usize = reports.iter().map(|r| r.final_rows).sum();
    let summary = CleaningSummary {
        total_original,
        total_final,
        total_removed: total_original - total_final,
        removal_rate: if total_original == 0 {
            0.0
        } else {
            (total_original - total_final) as f64 / total_original as f64
        },
        tables_cleaned: reports.len(),
    };
    (cleaned, reports, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student_info() -> Table {
        let mut t = Table::new(vec![
            "student_id",
            "course_module",
            "course_presentation",
            "gender",
            "disability",
            "previous_attempts",
        ]);
        t.push_row(vec![
            Value::Int(1),
            Value::Text("AAA".into()),
            Value::Text("2024B".into()),
            Value::Text("M".into()),
            Value::Text("Y".into()),
            Value::Null,
        ]);
        t.push_row(vec![
            Value::Int(1),
            Value::Text("AAA".into()),
            Value::Text("2024B".into()),
            Value::Text("F".into()),
            Value::Text("N".into()),
            Value::Int(2),
        ]);
        t.push_row(vec![
            Value::Null,
            Value::Text("AAA".into()),
            Value::Text("2024B".into()),
            Value::Null,
            Value::Text("N".into()),
            Value::Int(0),
        ]);
        t
    }

    #[test]
    fn student_info_keeps_first_duplicate_and_drops_null_keys() {
        let (t, report) = clean_student_info(student_info());
        assert_eq!(t.row_count(), 1);
        // First occurrence wins.
        assert_eq!(t.value(0, "gender"), Some(&Value::Text("M".into())));
        assert_eq!(t.value(0, "disability"), Some(&Value::Text("Yes".into())));
        assert_eq!(t.value(0, "previous_attempts"), Some(&Value::Int(0)));
        assert_eq!(report.removed.get("key_duplicates"), Some(&1));
        assert_eq!(report.removed.get("null_keys"), Some(&1));
    }

    #[test]
    fn missing_key_column_drops_every_row() {
        let mut t = Table::new(vec!["student_id", "gender"]);
        t.push_row(vec![Value::Int(1), Value::Text("M".into())]);
        let (t, report) = clean_student_info(t);
        assert!(t.is_empty());
        assert_eq!(report.removed.get("missing_key_columns"), Some(&1));
    }

    #[test]
    fn activity_log_removes_negative_then_extreme_clicks() {
        let mut t = Table::new(vec![
            "student_id",
            "course_module",
            "course_presentation",
            "site_id",
            "date",
            "click_count",
        ]);
        let mut push = |site: i64, clicks: i64| {
            t.push_row(vec![
                Value::Int(1),
                Value::Text("AAA".into()),
                Value::Text("2024B".into()),
                Value::Int(site),
                Value::Int(site),
                Value::Int(clicks),
            ]);
        };
        push(1, -5);
        for site in 2..=12 {
            push(site, 3);
        }
        push(13, 10_000);

        let (t, report) = clean_activity_log(t);
        assert_eq!(report.removed.get("negative_clicks"), Some(&1));
        assert_eq!(report.removed.get("click_outliers"), Some(&1));
        assert_eq!(t.row_count(), 11);
        assert!(report.outlier_threshold.is_some());
    }

    #[test]
    fn activity_cleaning_is_idempotent_on_tied_maxima() {
        let mut t = Table::new(vec![
            "student_id",
            "course_module",
            "course_presentation",
            "site_id",
            "date",
            "click_count",
        ]);
        for (site, clicks) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 3)] {
            t.push_row(vec![
                Value::Int(1),
                Value::Text("AAA".into()),
                Value::Text("2024B".into()),
                Value::Int(site),
                Value::Int(site),
                Value::Int(clicks),
            ]);
        }
        let (once, _) = clean_activity_log(t);
        let (twice, report) = clean_activity_log(once.clone());
        assert_eq!(once, twice);
        assert_eq!(report.final_rows, report.original_rows);
    }

    #[test]
    fn submissions_keep_latest_attempt_and_valid_scores() {
        let mut t = Table::new(vec!["assessment_id", "student_id", "score", "banked_flag"]);
        t.push_row(vec![Value::Int(100), Value::Int(1), Value::Float(60.0), Value::Null]);
        t.push_row(vec![Value::Int(100), Value::Int(1), Value::Float(75.0), Value::Int(1)]);
        t.push_row(vec![Value::Int(101), Value::Int(1), Value::Float(130.0), Value::Int(0)]);
        t.push_row(vec![Value::Int(102), Value::Int(1), Value::Null, Value::Int(0)]);

        let (t, report) = clean_assessment_submissions(t);
        assert_eq!(t.row_count(), 1);
        // Resubmission keeps the later row.
        assert_eq!(t.value(0, "score"), Some(&Value::Float(75.0)));
        assert_eq!(t.value(0, "banked_flag"), Some(&Value::Int(1)));
        assert_eq!(report.removed.get("invalid_scores"), Some(&2));
    }

    #[test]
    fn clean_all_skips_empty_tables() {
        let mut tables = BTreeMap::new();
        tables.insert("student_info".to_string(), Table::default());
        let mut courses = Table::new(vec!["course_module", "course_presentation", "length_in_days"]);
        courses.push_row(vec![
            Value::Text("AAA".into()),
            Value::Text("2024B".into()),
            Value::Int(268),
        ]);
        tables.insert("courses".to_string(), courses);

        let (cleaned, reports, summary) = clean_all(tables);
        assert!(!cleaned.contains_key("student_info"));
        assert!(cleaned.contains_key("courses"));
        assert_eq!(reports.len(), 1);
        assert_eq!(summary.tables_cleaned, 1);
        assert_eq!(summary.total_removed, 0);
    }
}
