use serde::{Deserialize, Serialize};

use crate::table::{Table, Value};

/// The (student, course-module, course-presentation) triple identifying one
/// student's participation in one course offering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnrollmentKey {
    pub student_id: i64,
    pub course_module: String,
    pub course_presentation: String,
}

/// One raw learning-activity row: clicks on one site on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub key: EnrollmentKey,
    pub site_id: i64,
    pub day: i64,
    pub clicks: i64,
}

/// One assessment submission. Module/presentation may be absent and is then
/// recovered from the assessment definition during aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    pub assessment_id: i64,
    pub student_id: i64,
    pub course_module: Option<String>,
    pub course_presentation: Option<String>,
    pub score: f64,
    pub submitted_day: Option<i64>,
    pub banked: bool,
}

/// Reference row describing one assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentDefinition {
    pub assessment_id: i64,
    pub course_module: String,
    pub course_presentation: String,
    pub weight: f64,
    pub due_day: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRecord {
    pub key: EnrollmentKey,
    pub registration_day: Option<i64>,
    pub unregistration_day: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseOffering {
    pub course_module: String,
    pub course_presentation: String,
    pub length_in_days: i64,
}

/// Final derived behavioral features, one row per enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentFeatures {
    pub key: EnrollmentKey,
    pub total_clicks: i64,
    pub avg_clicks_per_activity: f64,
    pub activity_count: i64,
    pub click_std: f64,
    pub first_activity_day: Option<i64>,
    pub last_activity_day: Option<i64>,
    pub active_days: i64,
    pub engagement_intensity: f64,
    pub days_without_activity: i64,
    pub late_start_days: i64,
    pub length_in_days: Option<i64>,
    pub mean_score: f64,
    pub score_std: f64,
    pub submission_count: i64,
    pub latest_score: f64,
    pub registration_day: Option<i64>,
    pub unregistration_day: Option<i64>,
    pub study_duration: Option<i64>,
    pub unregistered: bool,
    /// None when the offering's length is unknown; the ratio is otherwise
    /// guarded against zero but deliberately not capped at 1.
    pub progress_rate: Option<f64>,
    pub dropout_risk_signal: bool,
}

fn key_from_row(table: &Table, row: usize) -> Option<EnrollmentKey> {
    let student_id = table.value(row, "student_id")?.as_i64()?;
    let course_module = text_of(table.value(row, "course_module")?)?;
    let course_presentation = text_of(table.value(row, "course_presentation")?)?;
    Some(EnrollmentKey {
        student_id,
        course_module,
        course_presentation,
    })
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::Text(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Null => None,
    }
}

fn opt_i64(table: &Table, row: usize, column: &str) -> Option<i64> {
    table.value(row, column).and_then(|v| v.as_i64())
}

impl ActivityRecord {
    /// Parse a cleaned activity table. Rows whose key or measure fields do
    /// not parse are skipped; the cleaner has already dropped them, this is
    /// the boundary check that keeps later stages free of cell matching.
    pub fn from_table(table: &Table) -> Vec<ActivityRecord> {
        (0..table.row_count())
            .filter_map(|i| {
                Some(ActivityRecord {
                    key: key_from_row(table, i)?,
                    site_id: opt_i64(table, i, "site_id")?,
                    day: opt_i64(table, i, "date")?,
                    clicks: opt_i64(table, i, "click_count")?,
                })
            })
            .collect()
    }
}

impl SubmissionRecord {
    pub fn from_table(table: &Table) -> Vec<SubmissionRecord> {
        (0..table.row_count())
            .filter_map(|i| {
                Some(SubmissionRecord {
                    assessment_id: opt_i64(table, i, "assessment_id")?,
                    student_id: opt_i64(table, i, "student_id")?,
                    course_module: table.value(i, "course_module").and_then(text_of),
                    course_presentation: table.value(i, "course_presentation").and_then(text_of),
                    score: table.value(i, "score")?.as_f64()?,
                    submitted_day: opt_i64(table, i, "submission_date"),
                    banked: opt_i64(table, i, "banked_flag").unwrap_or(0) != 0,
                })
            })
            .collect()
    }
}

impl AssessmentDefinition {
    pub fn from_table(table: &Table) -> Vec<AssessmentDefinition> {
        (0..table.row_count())
            .filter_map(|i| {
                Some(AssessmentDefinition {
                    assessment_id: opt_i64(table, i, "assessment_id")?,
                    course_module: table.value(i, "course_module").and_then(text_of)?,
                    course_presentation: table.value(i, "course_presentation").and_then(text_of)?,
                    weight: table
                        .value(i, "weight")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0),
                    due_day: opt_i64(table, i, "due_date"),
                })
            })
            .collect()
    }
}

impl RegistrationRecord {
    pub fn from_table(table: &Table) -> Vec<RegistrationRecord> {
        (0..table.row_count())
            .filter_map(|i| {
                Some(RegistrationRecord {
                    key: key_from_row(table, i)?,
                    registration_day: opt_i64(table, i, "registration_date"),
                    unregistration_day: opt_i64(table, i, "unregistration_date"),
                })
            })
            .collect()
    }
}

impl CourseOffering {
    pub fn from_table(table: &Table) -> Vec<CourseOffering> {
        (0..table.row_count())
            .filter_map(|i| {
                Some(CourseOffering {
                    course_module: table.value(i, "course_module").and_then(text_of)?,
                    course_presentation: table.value(i, "course_presentation").and_then(text_of)?,
                    length_in_days: opt_i64(table, i, "length_in_days")?,
                })
            })
            .collect()
    }
}

impl StudentFeatures {
    pub const COLUMNS: &'static [&'static str] = &[
        "student_id",
        "course_module",
        "course_presentation",
        "total_clicks",
        "avg_clicks_per_activity",
        "activity_count",
        "click_std",
        "first_activity_day",
        "last_activity_day",
        "active_days",
        "engagement_intensity",
        "days_without_activity",
        "late_start_days",
        "length_in_days",
        "mean_score",
        "score_std",
        "submission_count",
        "latest_score",
        "registration_date",
        "unregistration_date",
        "study_duration",
        "unregistered",
        "progress_rate",
        "dropout_risk_signal",
    ];

    /// Render feature rows as the staging table consumed by normalization.
    /// Column names and order are the stable contract toward consumers.
    pub fn to_table(features: &[StudentFeatures]) -> Table {
        let mut table = Table::new(Self::COLUMNS.to_vec());
        for f in features {
            table.push_row(vec![
                Value::Int(f.key.student_id),
                Value::Text(f.key.course_module.clone()),
                Value::Text(f.key.course_presentation.clone()),
                Value::Int(f.total_clicks),
                Value::Float(f.avg_clicks_per_activity),
                Value::Int(f.activity_count),
                Value::Float(f.click_std),
                opt_int(f.first_activity_day),
                opt_int(f.last_activity_day),
                Value::Int(f.active_days),
                Value::Float(f.engagement_intensity),
                Value::Int(f.days_without_activity),
                Value::Int(f.late_start_days),
                opt_int(f.length_in_days),
                Value::Float(f.mean_score),
                Value::Float(f.score_std),
                Value::Int(f.submission_count),
                Value::Float(f.latest_score),
                opt_int(f.registration_day),
                opt_int(f.unregistration_day),
                opt_int(f.study_duration),
                Value::Int(f.unregistered as i64),
                f.progress_rate.map(Value::Float).unwrap_or(Value::Null),
                Value::Int(f.dropout_risk_signal as i64),
            ]);
        }
        table
    }
}

fn opt_int(v: Option<i64>) -> Value {
    match v {
        Some(i) => Value::Int(i),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_rows_with_missing_keys_are_skipped() {
        let mut t = Table::new(vec![
            "student_id",
            "course_module",
            "course_presentation",
            "site_id",
            "date",
            "click_count",
        ]);
        t.push_row(vec![
            Value::Int(1),
            Value::Text("AAA".into()),
            Value::Text("2024B".into()),
            Value::Int(10),
            Value::Int(3),
            Value::Int(7),
        ]);
        t.push_row(vec![
            Value::Null,
            Value::Text("AAA".into()),
            Value::Text("2024B".into()),
            Value::Int(11),
            Value::Int(4),
            Value::Int(2),
        ]);
        let records = ActivityRecord::from_table(&t);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].clicks, 7);
    }

    #[test]
    fn feature_table_has_stable_columns() {
        let table = StudentFeatures::to_table(&[]);
        assert_eq!(table.columns().len(), StudentFeatures::COLUMNS.len());
        assert!(table.has_columns(&["student_id", "course_module", "course_presentation"]));
    }
}
