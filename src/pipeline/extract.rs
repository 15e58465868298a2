use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::table::{Table, Value};
use crate::warehouse::{Warehouse, RAW};

/// Source-specific column names mapped onto the unified schema, applied
/// after trim/case-fold. Covers the upstream VLE export vocabulary.
static COLUMN_ALIASES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("id_student", "student_id"),
        ("code_module", "course_module"),
        ("code_presentation", "course_presentation"),
        ("id_site", "site_id"),
        ("sum_click", "click_count"),
        ("id_assessment", "assessment_id"),
        ("date_submitted", "submission_date"),
        ("is_banked", "banked_flag"),
        ("date_registration", "registration_date"),
        ("date_unregistration", "unregistration_date"),
        ("module_presentation_length", "length_in_days"),
        ("num_of_prev_attempts", "previous_attempts"),
    ])
});

/// Canonicalize a freshly read table's header: trim/case-fold, then map
/// known source-specific names onto the unified schema.
fn canonicalize_columns(table: &mut Table) {
    table.normalize_column_names();
    for (from, to) in COLUMN_ALIASES.iter() {
        table.rename_column(from, to);
    }
}

/// Fixed filename mapping for the flat-file source: one file per entity.
pub const ENTITY_FILES: &[(&str, &str)] = &[
    ("student_info", "student_info.csv"),
    ("activity_log", "activity_log.csv"),
    ("assessment_submissions", "assessment_submissions.csv"),
    ("assessments", "assessments.csv"),
    ("registrations", "registrations.csv"),
    ("courses", "courses.csv"),
];

/// Upstream event-store table holding tagged rows with embedded payloads.
pub const EVENT_TABLE: &str = "raw_events";

/// Read one CSV file into a table. A missing file yields an empty table,
/// never an error; callers check emptiness before proceeding.
pub fn read_csv_table(path: &Path) -> Result<Table> {
    if !path.exists() {
        warn!("File not found: {}; returning empty table", path.display());
        return Ok(Table::default());
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let mut table = Table::new(headers);
    for record in reader.records() {
        let record = record?;
        table.push_row(record.iter().map(Value::parse).collect());
    }
    canonicalize_columns(&mut table);
    debug!("Read {}: {} rows", path.display(), table.row_count());
    Ok(table)
}

/// Read every entity from a flat-file directory using the fixed filename
/// mapping. Entities whose file is absent come back as empty tables.
pub fn read_flat_files(dir: &Path) -> Result<BTreeMap<String, Table>> {
    info!("Reading flat-file source from {}", dir.display());
    let mut data = BTreeMap::new();
    for (entity, filename) in ENTITY_FILES {
        let table = read_csv_table(&dir.join(filename))?;
        if table.is_empty() {
            warn!("No data loaded for {} from {}", entity, filename);
        } else {
            info!("Loaded {}: {} rows from {}", entity, table.row_count(), filename);
        }
        data.insert(entity.to_string(), table);
    }
    Ok(data)
}

/// Read every entity from the upstream event store: rows of `raw_events`
/// tagged with a source and an entity tag, each carrying an embedded JSON
/// payload that is expanded into columns.
pub async fn read_event_store(
    warehouse: &dyn Warehouse,
    source_tag: &str,
) -> Result<BTreeMap<String, Table>> {
    info!("Reading event-store source, source={}", source_tag);
    let events = warehouse
        .read_table(RAW, EVENT_TABLE)
        .await?
        .unwrap_or_default();

    let mut data = BTreeMap::new();
    for (entity, _) in ENTITY_FILES {
        let payloads = select_payloads(&events, source_tag, entity);
        let mut table = flatten_payloads(&payloads);
        canonicalize_columns(&mut table);
        if table.is_empty() {
            warn!("No unprocessed {} rows for source {}", entity, source_tag);
        } else {
            info!("Loaded {} from event store: {} rows", entity, table.row_count());
        }
        data.insert(entity.to_string(), table);
    }
    Ok(data)
}

fn select_payloads(events: &Table, source_tag: &str, entity: &str) -> Vec<serde_json::Value> {
    let mut payloads = Vec::new();
    for i in 0..events.row_count() {
        let source_matches = events
            .value(i, "source")
            .and_then(|v| v.as_str())
            .map(|s| s.eq_ignore_ascii_case(source_tag))
            .unwrap_or(false);
        let entity_matches = events
            .value(i, "data_type")
            .and_then(|v| v.as_str())
            .map(|s| s == entity)
            .unwrap_or(false);
        let unprocessed = events
            .value(i, "processed")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            == 0;
        if !(source_matches && entity_matches && unprocessed) {
            continue;
        }
        let Some(raw) = events.value(i, "payload").and_then(|v| v.as_str()) else {
            continue;
        };
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(v) if v.is_object() => payloads.push(v),
            Ok(_) => warn!("Skipping non-object payload for {}", entity),
            Err(e) => warn!("Skipping unparsable payload for {}: {e}", entity),
        }
    }
    payloads
}

/// Expand embedded JSON documents into a rectangular table. Columns are the
/// union of keys across all payloads, sorted for a deterministic order.
pub fn flatten_payloads(payloads: &[serde_json::Value]) -> Table {
    let mut keys: Vec<String> = Vec::new();
    for payload in payloads {
        if let Some(obj) = payload.as_object() {
            for k in obj.keys() {
                let k = k.trim().to_lowercase();
                if !keys.contains(&k) {
                    keys.push(k);
                }
            }
        }
    }
    keys.sort();

    let mut table = Table::new(keys.clone());
    for payload in payloads {
        let obj = match payload.as_object() {
            Some(o) => o,
            None => continue,
        };
        let row = keys
            .iter()
            .map(|k| {
                obj.iter()
                    .find(|(name, _)| name.trim().to_lowercase() == *k)
                    .map(|(_, v)| json_to_value(v))
                    .unwrap_or(Value::Null)
            })
            .collect();
        table.push_row(row);
    }
    table
}

fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Int(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::parse(s),
        // Nested documents are carried opaquely; nothing downstream keys
        // off them.
        other => Value::Text(other.to_string()),
    }
}
