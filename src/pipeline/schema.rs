use tracing::{info, warn};

use crate::error::Result;
use crate::warehouse::Warehouse;

/// Ensure every warehouse namespace exists before any stage writes. A
/// single failed namespace is logged and skipped; the count of namespaces
/// actually ensured comes back to the caller.
pub async fn ensure_namespaces(warehouse: &dyn Warehouse, namespaces: &[&str]) -> Result<usize> {
    let mut ensured = 0usize;
    for namespace in namespaces {
        match warehouse.ensure_namespace(namespace).await {
            Ok(()) => ensured += 1,
            Err(e) => warn!("Could not ensure namespace '{}': {e}", namespace),
        }
    }
    info!("Ensured {}/{} namespaces", ensured, namespaces.len());
    Ok(ensured)
}
