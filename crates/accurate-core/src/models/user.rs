//! User profiles fill `*users` markers in requests

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::Query;
use crate::utils::concatenated_key;
use crate::utils::consts::USERS;
use crate::AppResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserProfile {
    pub tenant: String,
    pub name: String,
    /// Hidden from lookups unless masked profiles are requested
    pub masked: bool,
    /// Field values the profile is indexed under
    pub index: BTreeMap<String, String>,
    pub query: String,
    pub weight: f64,
}

impl UserProfile {
    pub fn full_id(&self) -> String {
        concatenated_key(&[&self.tenant, &self.name])
    }

    /// Accepts single quoted JSON, as typed on consoles
    pub fn normalize_query(&mut self) {
        self.query = self.query.replace('\'', "\"");
    }

    pub fn compiled(&self) -> AppResult<Query> {
        Query::parse(&self.query)
    }

    /// Index keys (`Field:value`) of this profile for the configured index fields
    pub fn index_keys<'a>(&'a self, fields: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut keys = Vec::new();
        for field in fields {
            let value = match field.as_str() {
                "Tenant" => Some(&self.tenant),
                "Name" => Some(&self.name),
                other => self.index.get(other),
            };
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                keys.push(concatenated_key(&[field.as_str(), v.as_str()]));
            }
        }
        keys
    }
}

/// Heavier first, then the more specific query
pub fn sort_profiles(profiles: &mut [(UserProfile, usize)]) {
    profiles.sort_by(|(a, ca), (b, cb)| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| cb.cmp(ca))
    });
}

/// Some top level field, or extra field, holds the `*users` marker
pub fn needs_users(doc: &Value) -> bool {
    let Value::Object(map) = doc else {
        return false;
    };
    map.iter().any(|(k, v)| match v {
        Value::String(s) => s == USERS,
        Value::Object(_) if k == "ExtraFields" => needs_users(v),
        _ => false,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrGetUsers {
    /// Request the profiles are matched against
    pub object: Value,
    pub masked: bool,
}
