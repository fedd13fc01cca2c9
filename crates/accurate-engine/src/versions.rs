//! Stored data layout versions, checked once at startup

use accurate_core::models::{MigrationInfo, StructVersion};
use accurate_core::{AppError, AppResult};
use tracing::{error, info};

use crate::Engine;

impl Engine {
    /// Compares the stored version document with this build's
    ///
    /// An empty store gets the current document written; a store holding
    /// data but no document, or an outdated one, refuses to start.
    pub async fn check_versions(&self) -> AppResult<()> {
        let current = StructVersion::current();
        let stored = match self.accounting.versions().await? {
            Some(v) => v,
            None if self.accounting.is_empty().await? => {
                info!("writing data versions to an empty store");
                return self.accounting.set_versions(&current).await;
            }
            None => {
                return Err(AppError::ServerError(
                    "no data versions stored, migrate the data first".into(),
                ))
            }
        };
        let outdated = current.compare(&stored);
        if outdated.is_empty() {
            return Ok(());
        }
        for m in &outdated {
            error!(family = %m.family, stored = m.db_version, current = m.current_version, "data needs migration");
        }
        Err(AppError::ServerError(migration_message(&outdated)))
    }
}

fn migration_message(outdated: &[MigrationInfo]) -> String {
    let families: Vec<String> = outdated
        .iter()
        .map(|m| format!("{} {}->{}", m.family, m.db_version, m.current_version))
        .collect();
    format!("data migration required: {}", families.join(", "))
}
