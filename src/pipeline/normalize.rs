use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::table::{mean, quantile, sample_std, Table, Value};

/// Scaling family applied to numeric features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMethod {
    MinMax,
    ZScore,
    Robust,
}

impl ScalingMethod {
    /// Suffix appended to the source column for the scaled output column.
    pub fn suffix(&self) -> &'static str {
        match self {
            ScalingMethod::MinMax => "_normalized",
            ScalingMethod::ZScore => "_standardized",
            ScalingMethod::Robust => "_robust",
        }
    }
}

/// Per-column statistics captured at fit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScalingParams {
    MinMax { min: f64, max: f64 },
    ZScore { mean: f64, std: f64 },
    Robust { median: f64, iqr: f64 },
}

/// Everything needed to re-apply a fitted scaling to fresh data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingInfo {
    pub method: ScalingMethod,
    pub parameters: BTreeMap<String, ScalingParams>,
    pub columns_normalized: Vec<String>,
}

/// Fit scaling statistics on the requested columns. Columns absent from the
/// table or without any numeric value are left out of the result.
pub fn fit(table: &Table, method: ScalingMethod, columns: &[String]) -> ScalingInfo {
    let mut parameters = BTreeMap::new();
    let mut fitted = Vec::new();
    for column in columns {
        if !table.has_column(column) {
            warn!("Column '{}' not present; skipping scaling fit", column);
            continue;
        }
        let values = table.numeric_values(column);
        if values.is_empty() {
            warn!("Column '{}' has no numeric values; skipping scaling fit", column);
            continue;
        }
        let params = match method {
            ScalingMethod::MinMax => ScalingParams::MinMax {
                min: values.iter().cloned().fold(f64::INFINITY, f64::min),
                max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            },
            ScalingMethod::ZScore => ScalingParams::ZScore {
                mean: mean(&values).unwrap_or(0.0),
                std: sample_std(&values),
            },
            ScalingMethod::Robust => {
                let median = quantile(&values, 0.5).unwrap_or(0.0);
                let q1 = quantile(&values, 0.25).unwrap_or(0.0);
                let q3 = quantile(&values, 0.75).unwrap_or(0.0);
                ScalingParams::Robust { median, iqr: q3 - q1 }
            }
        };
        parameters.insert(column.clone(), params);
        fitted.push(column.clone());
    }
    info!("Fitted {:?} scaling on {} columns", method, fitted.len());
    ScalingInfo {
        method,
        parameters,
        columns_normalized: fitted,
    }
}

fn scale(params: &ScalingParams, x: f64) -> f64 {
    match params {
        // Degenerate spreads scale to 0.0 rather than dividing by zero.
        ScalingParams::MinMax { min, max } => {
            let range = max - min;
            if range == 0.0 {
                0.0
            } else {
                (x - min) / range
            }
        }
        ScalingParams::ZScore { mean, std } => {
            if *std == 0.0 {
                0.0
            } else {
                (x - mean) / std
            }
        }
        ScalingParams::Robust { median, iqr } => {
            if *iqr == 0.0 {
                0.0
            } else {
                (x - median) / iqr
            }
        }
    }
}

/// Apply fitted scalings, adding one suffixed output column per fitted
/// source column. Source columns are kept; nulls stay null.
pub fn apply(table: &mut Table, info: &ScalingInfo) {
    for column in &info.columns_normalized {
        let Some(params) = info.parameters.get(column) else {
            continue;
        };
        let Some(values) = table.column(column) else {
            warn!("Column '{}' missing at apply time; skipping", column);
            continue;
        };
        let scaled: Vec<Value> = values
            .iter()
            .map(|v| match v.as_f64() {
                Some(x) => Value::Float(scale(params, x)),
                None => Value::Null,
            })
            .collect();
        table.set_column(&format!("{column}{}", info.method.suffix()), scaled);
    }
}

/// Fit-then-apply convenience for a single table.
pub fn normalize(table: &mut Table, method: ScalingMethod, columns: &[String]) -> ScalingInfo {
    let info = fit(table, method, columns);
    apply(table, &info);
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> Table {
        let mut t = Table::new(vec!["student_id", "total_clicks"]);
        t.push_row(vec![Value::Int(1), Value::Int(0)]);
        t.push_row(vec![Value::Int(2), Value::Int(50)]);
        t.push_row(vec![Value::Int(3), Value::Int(100)]);
        t.push_row(vec![Value::Int(4), Value::Null]);
        t
    }

    #[test]
    fn min_max_scales_into_unit_interval() {
        let mut t = features();
        let info = normalize(&mut t, ScalingMethod::MinMax, &["total_clicks".to_string()]);
        assert_eq!(info.columns_normalized, vec!["total_clicks".to_string()]);
        assert!(t.has_column("total_clicks_normalized"));
        assert_eq!(t.value(0, "total_clicks_normalized"), Some(&Value::Float(0.0)));
        assert_eq!(t.value(1, "total_clicks_normalized"), Some(&Value::Float(0.5)));
        assert_eq!(t.value(2, "total_clicks_normalized"), Some(&Value::Float(1.0)));
        assert_eq!(t.value(3, "total_clicks_normalized"), Some(&Value::Null));
        // Source column survives.
        assert_eq!(t.value(2, "total_clicks"), Some(&Value::Int(100)));
    }

    #[test]
    fn constant_column_scales_to_zero() {
        let mut t = Table::new(vec!["x"]);
        t.push_row(vec![Value::Int(7)]);
        t.push_row(vec![Value::Int(7)]);
        normalize(&mut t, ScalingMethod::MinMax, &["x".to_string()]);
        assert_eq!(t.value(0, "x_normalized"), Some(&Value::Float(0.0)));
        let mut t2 = Table::new(vec!["x"]);
        t2.push_row(vec![Value::Int(7)]);
        t2.push_row(vec![Value::Int(7)]);
        normalize(&mut t2, ScalingMethod::ZScore, &["x".to_string()]);
        assert_eq!(t2.value(0, "x_standardized"), Some(&Value::Float(0.0)));
    }

    #[test]
    fn missing_columns_are_skipped_not_fatal() {
        let mut t = features();
        let info = normalize(
            &mut t,
            ScalingMethod::MinMax,
            &["total_clicks".to_string(), "mean_score".to_string()],
        );
        assert_eq!(info.columns_normalized, vec!["total_clicks".to_string()]);
        assert!(!t.has_column("mean_score_normalized"));
    }

    #[test]
    fn fitted_params_transfer_to_fresh_data() {
        let mut train = features();
        let info = normalize(&mut train, ScalingMethod::MinMax, &["total_clicks".to_string()]);

        let mut fresh = Table::new(vec!["student_id", "total_clicks"]);
        fresh.push_row(vec![Value::Int(9), Value::Int(200)]);
        apply(&mut fresh, &info);
        // Out-of-range inputs scale past 1.0 under the training min/max.
        assert_eq!(fresh.value(0, "total_clicks_normalized"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn zscore_uses_sample_std() {
        let mut t = Table::new(vec!["x"]);
        t.push_row(vec![Value::Float(2.0)]);
        t.push_row(vec![Value::Float(4.0)]);
        let info = fit(&t, ScalingMethod::ZScore, &["x".to_string()]);
        match info.parameters.get("x") {
            Some(ScalingParams::ZScore { mean, std }) => {
                assert_eq!(*mean, 3.0);
                assert!((std - std::f64::consts::SQRT_2).abs() < 1e-12);
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn robust_centers_on_median() {
        let mut t = Table::new(vec!["x"]);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            t.push_row(vec![Value::Float(v)]);
        }
        normalize(&mut t, ScalingMethod::Robust, &["x".to_string()]);
        assert_eq!(t.value(2, "x_robust"), Some(&Value::Float(0.0)));
    }
}
