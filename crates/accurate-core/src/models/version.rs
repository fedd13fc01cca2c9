//! Stored data structure versions and load history

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::time::zero_time;

/// Version per entity family
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructVersion(pub BTreeMap<String, u32>);

impl StructVersion {
    /// Versions this build reads and writes
    pub fn current() -> Self {
        Self(
            [
                ("Accounts", 2),
                ("Actions", 2),
                ("ActionTriggers", 2),
                ("ActionPlans", 2),
                ("SharedGroups", 2),
                ("Destinations", 1),
                ("RatingPlans", 1),
                ("RatingProfiles", 1),
                ("Lcrs", 1),
                ("DerivedChargers", 1),
                ("Aliases", 1),
                ("Users", 1),
                ("CdrStats", 1),
                ("Cdrs", 2),
                ("SmCosts", 2),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        )
    }

    /// Families whose stored version differs from ours
    pub fn compare(&self, stored: &StructVersion) -> Vec<MigrationInfo> {
        self.0
            .iter()
            .filter_map(|(family, current)| {
                let db = stored.0.get(family).copied().unwrap_or(0);
                (db != *current).then(|| MigrationInfo {
                    family: family.clone(),
                    db_version: db,
                    current_version: *current,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MigrationInfo {
    pub family: String,
    pub db_version: u32,
    pub current_version: u32,
}

/// One tariff plan load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LoadInstance {
    #[serde(rename = "LoadID")]
    pub load_id: String,
    #[serde(rename = "RatingLoadID")]
    pub rating_load_id: String,
    #[serde(rename = "AccountingLoadID")]
    pub accounting_load_id: String,
    #[serde(rename = "TariffPlanID")]
    pub tariff_plan_id: String,
    pub load_time: DateTime<Utc>,
}

impl Default for LoadInstance {
    fn default() -> Self {
        Self {
            load_id: String::new(),
            rating_load_id: String::new(),
            accounting_load_id: String::new(),
            tariff_plan_id: String::new(),
            load_time: zero_time(),
        }
    }
}
