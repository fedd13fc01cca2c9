//! Derived chargers fork one event into several rating runs

use serde::{Deserialize, Serialize};

use super::callcost::{CallCost, CallDescriptor};
use crate::error::AppError;
use crate::query::Query;
use crate::utils::consts::{ANY, DEFAULT};
use crate::utils::{concatenated_key, StringMap};
use crate::AppResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DerivedCharger {
    /// Unique within the group
    #[serde(rename = "RunID")]
    pub run_id: String,
    /// Query the event must match for the run to happen
    pub run_filter: String,
    /// Query applied to the forked event
    pub fields: String,
}

impl DerivedCharger {
    pub fn new(run_id: impl Into<String>, run_filter: &str, fields: &str) -> AppResult<Self> {
        let run_id = run_id.into();
        if run_id.is_empty() {
            return Err(AppError::missing(["RunID"]));
        }
        Query::parse(run_filter)?;
        Query::parse(fields)?;
        Ok(Self {
            run_id,
            run_filter: run_filter.to_string(),
            fields: fields.to_string(),
        })
    }

    pub fn default_run() -> Self {
        Self {
            run_id: DEFAULT.to_string(),
            ..Default::default()
        }
    }

    pub fn run_filter(&self) -> AppResult<Query> {
        Query::parse(&self.run_filter)
    }

    pub fn field_changes(&self) -> AppResult<Query> {
        Query::parse(&self.fields)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DerivedChargerGroup {
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub account: String,
    pub subject: String,
    #[serde(rename = "DestinationIDs")]
    pub destination_ids: StringMap,
    pub chargers: Vec<DerivedCharger>,
}

impl DerivedChargerGroup {
    /// Key inside the tenant namespace
    pub fn full_id(&self) -> String {
        derived_chargers_key(&self.direction, &self.category, &self.account, &self.subject)
    }

    /// Appends a charger, refusing the reserved and duplicated run ids
    pub fn append(&mut self, dc: DerivedCharger) -> AppResult<()> {
        if dc.run_id == DEFAULT {
            return Err(AppError::InvalidArgument("reserved run id".into()));
        }
        if self.chargers.iter().any(|c| c.run_id == dc.run_id) {
            return Err(AppError::InvalidArgument("duplicated run id".into()));
        }
        self.chargers.push(dc);
        Ok(())
    }

    /// Chargers with the `*default` run in front
    pub fn with_default_run(&self) -> Vec<DerivedCharger> {
        let mut runs = Vec::with_capacity(self.chargers.len() + 1);
        runs.push(DerivedCharger::default_run());
        runs.extend(
            self.chargers
                .iter()
                .filter(|c| c.run_id != DEFAULT)
                .cloned(),
        );
        runs
    }

    /// Count of key fields that are not `*any`
    pub fn precision(&self) -> usize {
        [&self.direction, &self.category, &self.account, &self.subject]
            .iter()
            .filter(|f| f.as_str() != ANY)
            .count()
    }

    /// Whether the group applies to a destination resolved to `dest_names`
    ///
    /// The first configured name present decides, included or excluded.
    pub fn matches_destination(&self, dest_names: &[String]) -> bool {
        if self.destination_ids.len() == 0 || self.destination_ids.has(ANY) {
            return true;
        }
        dest_names
            .iter()
            .find_map(|name| self.destination_ids.get(name))
            .unwrap_or(false)
    }
}

pub fn derived_chargers_key(direction: &str, category: &str, account: &str, subject: &str) -> String {
    concatenated_key(&[direction, category, account, subject])
}

/// Lookup attributes for derived chargers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrDerivedChargers {
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub account: String,
    pub subject: String,
    pub destination: String,
}

/// One derived run of a session, with the descriptor prepared for it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionRun {
    pub derived_charger: DerivedCharger,
    pub call_descriptor: CallDescriptor,
    pub call_costs: Vec<CallCost>,
}
