use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::Result;
use crate::pipeline::normalize::ScalingMethod;

/// Declared column type used by the validator's conformance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedType {
    Int,
    Float,
    Text,
}

/// Categorical-encoding section of the config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    pub target_column: String,
    pub target_mapping: BTreeMap<String, i64>,
    pub categorical_features: Vec<String>,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        let mut target_mapping = BTreeMap::new();
        target_mapping.insert("Pass".to_string(), 0);
        target_mapping.insert("Fail".to_string(), 1);
        target_mapping.insert("Withdrawn".to_string(), 2);
        target_mapping.insert("Distinction".to_string(), 3);
        Self {
            target_column: "final_result".to_string(),
            target_mapping,
            categorical_features: [
                "gender",
                "region",
                "highest_education",
                "imd_band",
                "age_band",
                "disability",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Numeric-normalization section of the config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub method: ScalingMethod,
    pub numeric_features: Vec<String>,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            method: ScalingMethod::MinMax,
            numeric_features: [
                "total_clicks",
                "avg_clicks_per_activity",
                "activity_count",
                "engagement_intensity",
                "mean_score",
                "score_std",
                "submission_count",
                "study_duration",
                "progress_rate",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// External configuration surface for a pipeline run. Every section has a
/// usable default so an absent or unreadable document degrades instead of
/// crashing: the validator skips type checks, encoder and normalizer fall
/// back to their built-in feature lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// table name -> column name -> declared type
    pub data_types: BTreeMap<String, BTreeMap<String, ExpectedType>>,
    pub encoding: EncodingConfig,
    pub normalization: NormalizationConfig,
    /// Where validation reports are written; no reports when unset.
    pub reports_dir: Option<String>,
}

impl PipelineConfig {
    /// Load from a JSON document, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Could not parse config '{}': {e}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Could not read config '{}': {e}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Declared types for one table; empty when the config omits it.
    pub fn expected_types(&self, table: &str) -> BTreeMap<String, ExpectedType> {
        self.data_types.get(table).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = PipelineConfig::load("/nonexistent/config.json");
        assert_eq!(config.encoding.target_mapping.get("Pass"), Some(&0));
        assert_eq!(config.encoding.target_mapping.get("Distinction"), Some(&3));
        assert!(config.data_types.is_empty());
    }

    #[test]
    fn partial_document_keeps_section_defaults() {
        let doc = r#"{
            "data_types": {
                "assessment_submissions": { "score": "float", "student_id": "int" }
            }
        }"#;
        let config: PipelineConfig = serde_json::from_str(doc).unwrap();
        let types = config.expected_types("assessment_submissions");
        assert_eq!(types.get("score"), Some(&ExpectedType::Float));
        // Untouched sections fall back to their defaults.
        assert_eq!(config.encoding.target_column, "final_result");
        assert!(!config.normalization.numeric_features.is_empty());
    }
}
