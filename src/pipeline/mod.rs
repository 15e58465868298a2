pub mod aggregate;
pub mod clean;
pub mod encode;
pub mod extract;
pub mod load;
pub mod normalize;
pub mod schema;
pub mod validate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::domain::{
    ActivityRecord, AssessmentDefinition, CourseOffering, RegistrationRecord, StudentFeatures,
    SubmissionRecord,
};
use crate::error::{EtlError, Result};
use crate::pipeline::encode::{EncodingInfo, EncodingMethod, FittedParams};
use crate::table::{Table, Value};
use crate::warehouse::{Warehouse, ANALYTICS, RAW, STAGING};

const ENROLLMENT_KEYS: &[&str] = &["student_id", "course_module", "course_presentation"];

/// Raw tables that get a quality report, with their logical key columns.
const VALIDATED_TABLES: &[(&str, &[&str])] = &[
    ("student_info", ENROLLMENT_KEYS),
    ("activity_log", &["student_id", "site_id", "date"]),
    ("assessment_submissions", &["assessment_id", "student_id"]),
];

/// The ordered stages of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Schema,
    Extract,
    Validate,
    Clean,
    Encode,
    Aggregate,
    Normalize,
    Load,
}

impl Stage {
    pub const ALL: &'static [Stage] = &[
        Stage::Schema,
        Stage::Extract,
        Stage::Validate,
        Stage::Clean,
        Stage::Encode,
        Stage::Aggregate,
        Stage::Normalize,
        Stage::Load,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Schema => "schema",
            Stage::Extract => "extract",
            Stage::Validate => "validate",
            Stage::Clean => "clean",
            Stage::Encode => "encode",
            Stage::Aggregate => "aggregate",
            Stage::Normalize => "normalize",
            Stage::Load => "load",
        }
    }
}

impl FromStr for Stage {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Stage> {
        Stage::ALL
            .iter()
            .find(|stage| stage.as_str() == s.to_lowercase())
            .copied()
            .ok_or_else(|| EtlError::Config(format!("unknown stage '{s}'")))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSummary {
    pub rows_in: usize,
    pub rows_out: usize,
    pub notes: Vec<String>,
}

/// What happened to one stage. A skip is an expected empty-input condition;
/// a failure is an error that was logged and did not stop the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum StageOutcome {
    Completed(StageSummary),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<(Stage, StageOutcome)>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.stages
            .iter()
            .filter(|(_, o)| matches!(o, StageOutcome::Completed(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.stages
            .iter()
            .filter(|(_, o)| matches!(o, StageOutcome::Failed(_)))
            .count()
    }
}

/// Where raw entity data comes from.
#[derive(Debug, Clone)]
pub enum DataSource {
    FlatFiles(PathBuf),
    EventStore { source_tag: String },
}

/// One configured pipeline run over a warehouse. Stages communicate only
/// through warehouse tables, so any prefix of the stage list can run on its
/// own against whatever state earlier runs left behind.
pub struct PipelineRun {
    warehouse: Arc<dyn Warehouse>,
    config: PipelineConfig,
    source: DataSource,
    params_path: PathBuf,
    refit: bool,
}

impl PipelineRun {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        config: PipelineConfig,
        source: DataSource,
        params_path: PathBuf,
        refit: bool,
    ) -> Self {
        Self {
            warehouse,
            config,
            source,
            params_path,
            refit,
        }
    }

    /// Run every stage in order. A failed stage is recorded and the run
    /// moves on; downstream stages then skip on their own empty inputs.
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Starting pipeline run {}", run_id);

        let mut stages = Vec::with_capacity(Stage::ALL.len());
        for &stage in Stage::ALL {
            stages.push((stage, self.run_stage(stage).await));
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stages,
        };
        info!(
            "Pipeline run {} finished: {} completed, {} failed",
            run_id,
            report.completed(),
            report.failed()
        );
        report
    }

    /// Run one stage, folding any error into a `Failed` outcome.
    pub async fn run_stage(&self, stage: Stage) -> StageOutcome {
        info!("Running stage '{}'", stage.as_str());
        match self.dispatch(stage).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Stage '{}' failed: {e}", stage.as_str());
                StageOutcome::Failed(e.to_string())
            }
        }
    }

    async fn dispatch(&self, stage: Stage) -> Result<StageOutcome> {
        match stage {
            Stage::Schema => self.stage_schema().await,
            Stage::Extract => self.stage_extract().await,
            Stage::Validate => self.stage_validate().await,
            Stage::Clean => self.stage_clean().await,
            Stage::Encode => self.stage_encode().await,
            Stage::Aggregate => self.stage_aggregate().await,
            Stage::Normalize => self.stage_normalize().await,
            Stage::Load => self.stage_load().await,
        }
    }

    async fn read_or_empty(&self, namespace: &str, name: &str) -> Result<Table> {
        Ok(self
            .warehouse
            .read_table(namespace, name)
            .await?
            .unwrap_or_default())
    }

    async fn stage_schema(&self) -> Result<StageOutcome> {
        let ensured =
            schema::ensure_namespaces(self.warehouse.as_ref(), &[RAW, STAGING, ANALYTICS]).await?;
        Ok(StageOutcome::Completed(StageSummary {
            rows_in: 0,
            rows_out: 0,
            notes: vec![format!("{ensured} namespaces ensured")],
        }))
    }

    async fn stage_extract(&self) -> Result<StageOutcome> {
        let tables = match &self.source {
            DataSource::FlatFiles(dir) => extract::read_flat_files(dir)?,
            DataSource::EventStore { source_tag } => {
                extract::read_event_store(self.warehouse.as_ref(), source_tag).await?
            }
        };

        let total: usize = tables.values().map(Table::row_count).sum();
        if total == 0 {
            return Ok(StageOutcome::Skipped(
                "no rows in any source entity".to_string(),
            ));
        }

        let mut notes = Vec::new();
        let mut rows_out = 0usize;
        for (entity, table) in &tables {
            if table.is_empty() {
                continue;
            }
            rows_out += self.warehouse.append_table(RAW, entity, table).await?;
            notes.push(format!("{entity}: {} rows", table.row_count()));
        }
        Ok(StageOutcome::Completed(StageSummary {
            rows_in: total,
            rows_out,
            notes,
        }))
    }

    async fn stage_validate(&self) -> Result<StageOutcome> {
        let manifest = self.warehouse.manifest().await?;
        let validator = validate::Validator::new(self.config.data_types.clone());

        let mut reports = Vec::new();
        let mut rows_in = 0usize;
        for (name, keys) in VALIDATED_TABLES {
            if !manifest.exists(RAW, name) {
                continue;
            }
            let table = self.read_or_empty(RAW, name).await?;
            rows_in += table.row_count();
            reports.push(validator.validate(name, &table, keys));
        }
        if reports.is_empty() {
            return Ok(StageOutcome::Skipped("no raw tables to validate".to_string()));
        }

        if let Some(dir) = &self.config.reports_dir {
            // Reports are advisory; a write failure never fails the stage.
            if let Err(e) = validator.save_reports(std::path::Path::new(dir), &reports) {
                warn!("Could not write validation reports: {e}");
            }
        }
        let notes = reports
            .iter()
            .map(|r| format!("{}: {:?}", r.table, r.status))
            .collect();
        Ok(StageOutcome::Completed(StageSummary {
            rows_in,
            rows_out: 0,
            notes,
        }))
    }

    async fn stage_clean(&self) -> Result<StageOutcome> {
        let mut tables = BTreeMap::new();
        for (entity, _) in extract::ENTITY_FILES {
            tables.insert(
                entity.to_string(),
                self.read_or_empty(RAW, entity).await?,
            );
        }
        let total: usize = tables.values().map(Table::row_count).sum();
        if total == 0 {
            return Ok(StageOutcome::Skipped("no raw rows to clean".to_string()));
        }

        let (cleaned, reports, summary) = clean::clean_all(tables);
        for (name, table) in &cleaned {
            self.warehouse
                .replace_table(STAGING, &format!("{name}_clean"), table)
                .await?;
        }
        let notes = reports
            .iter()
            .map(|r| {
                format!(
                    "{}: {} -> {} rows",
                    r.table, r.original_rows, r.final_rows
                )
            })
            .collect();
        Ok(StageOutcome::Completed(StageSummary {
            rows_in: summary.total_original,
            rows_out: summary.total_final,
            notes,
        }))
    }

    async fn stage_encode(&self) -> Result<StageOutcome> {
        let mut table = self.read_or_empty(STAGING, "student_info_clean").await?;
        if table.is_empty() {
            // A run invoked from the encode stage onward works off raw data.
            table = self.read_or_empty(RAW, "student_info").await?;
        }
        if table.is_empty() {
            return Ok(StageOutcome::Skipped("no demographics to encode".to_string()));
        }
        if !table.has_columns(ENROLLMENT_KEYS) {
            return Ok(StageOutcome::Skipped(
                "demographics lack enrollment key columns".to_string(),
            ));
        }
        let rows_in = table.row_count();

        let target = self.config.encoding.target_column.clone();
        if !table.has_column(&target) {
            warn!("Column '{}' absent; filling with Unknown", target);
            table.set_column(&target, vec![Value::Text("Unknown".to_string()); rows_in]);
        }

        let params = if self.refit || !self.params_path.exists() {
            let categorical = encode::fit_categorical(
                &table,
                &self.config.encoding.categorical_features,
                EncodingMethod::Ordinal,
            );
            let params = FittedParams {
                target_mapping: self.config.encoding.target_mapping.clone(),
                categorical,
                scaling: None,
                fitted_at: Utc::now(),
            };
            params.save(&self.params_path)?;
            params
        } else {
            FittedParams::load(&self.params_path)?
        };

        encode::encode_target(&mut table, &target, &params.target_mapping);
        encode::apply_categorical(&mut table, &params.categorical);

        let rows_out = self
            .warehouse
            .replace_table(STAGING, "student_info_encoded", &table)
            .await?;
        Ok(StageOutcome::Completed(StageSummary {
            rows_in,
            rows_out,
            notes: vec![format!(
                "{} categorical columns encoded",
                params.categorical.columns_encoded.len()
            )],
        }))
    }

    async fn stage_aggregate(&self) -> Result<StageOutcome> {
        let activity_table = self.read_or_empty(STAGING, "activity_log_clean").await?;
        let submissions_table = self
            .read_or_empty(STAGING, "assessment_submissions_clean")
            .await?;
        if activity_table.is_empty() && submissions_table.is_empty() {
            return Ok(StageOutcome::Skipped(
                "no behavioral data to aggregate".to_string(),
            ));
        }
        let rows_in = activity_table.row_count() + submissions_table.row_count();

        let definitions =
            AssessmentDefinition::from_table(&self.read_or_empty(STAGING, "assessments_clean").await?);
        let registrations =
            RegistrationRecord::from_table(&self.read_or_empty(STAGING, "registrations_clean").await?);
        let offerings =
            CourseOffering::from_table(&self.read_or_empty(STAGING, "courses_clean").await?);
        let lengths = aggregate::offering_lengths(&offerings);

        let activity = aggregate::aggregate_activity(
            &ActivityRecord::from_table(&activity_table),
            &lengths,
        );
        let assessments = aggregate::aggregate_assessments(
            &SubmissionRecord::from_table(&submissions_table),
            &definitions,
        );
        let features = aggregate::build_profile(&activity, &assessments, &registrations, &lengths);

        let table = StudentFeatures::to_table(&features);
        let rows_out = self
            .warehouse
            .replace_table(STAGING, "features_aggregated", &table)
            .await?;
        Ok(StageOutcome::Completed(StageSummary {
            rows_in,
            rows_out,
            notes: vec![format!("{} enrollments profiled", features.len())],
        }))
    }

    async fn stage_normalize(&self) -> Result<StageOutcome> {
        let mut table = self.read_or_empty(STAGING, "features_aggregated").await?;
        if table.is_empty() {
            return Ok(StageOutcome::Skipped("no features to normalize".to_string()));
        }
        let rows_in = table.row_count();

        let stored = if !self.refit && self.params_path.exists() {
            FittedParams::load(&self.params_path).ok().and_then(|p| p.scaling)
        } else {
            None
        };
        let info = match stored {
            Some(info) => {
                normalize::apply(&mut table, &info);
                info
            }
            None => {
                let info = normalize::fit(
                    &table,
                    self.config.normalization.method,
                    &self.config.normalization.numeric_features,
                );
                normalize::apply(&mut table, &info);
                self.persist_scaling(info.clone())?;
                info
            }
        };

        let rows_out = self
            .warehouse
            .replace_table(STAGING, "features_normalized", &table)
            .await?;
        Ok(StageOutcome::Completed(StageSummary {
            rows_in,
            rows_out,
            notes: vec![format!(
                "{} columns scaled with {:?}",
                info.columns_normalized.len(),
                info.method
            )],
        }))
    }

    fn persist_scaling(&self, info: normalize::ScalingInfo) -> Result<()> {
        let mut params = FittedParams::load(&self.params_path).unwrap_or_else(|_| FittedParams {
            target_mapping: self.config.encoding.target_mapping.clone(),
            categorical: EncodingInfo {
                method: EncodingMethod::Ordinal,
                columns_encoded: Vec::new(),
                mappings: BTreeMap::new(),
            },
            scaling: None,
            fitted_at: Utc::now(),
        });
        params.scaling = Some(info);
        params.fitted_at = Utc::now();
        params.save(&self.params_path)
    }

    async fn stage_load(&self) -> Result<StageOutcome> {
        let demographics = self.read_or_empty(STAGING, "student_info_encoded").await?;
        let features = self.read_or_empty(STAGING, "features_normalized").await?;
        let rows_in = demographics.row_count() + features.row_count();

        let merged = load::merge_for_analytics(&demographics, &features)?;
        let rows_out = self
            .warehouse
            .replace_table(ANALYTICS, "student_features", &merged)
            .await?;
        Ok(StageOutcome::Completed(StageSummary {
            rows_in,
            rows_out,
            notes: vec![format!("{rows_out} rows serving in analytics")],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_roundtrip() {
        for &stage in Stage::ALL {
            assert_eq!(Stage::from_str(stage.as_str()).unwrap(), stage);
        }
        assert!(Stage::from_str("reticulate").is_err());
    }

    #[test]
    fn stage_parse_is_case_insensitive() {
        assert_eq!(Stage::from_str("Clean").unwrap(), Stage::Clean);
    }
}
