//! Destinations map dialled number prefixes to named sets

use serde::{Deserialize, Serialize};

/// One prefix of a named destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Destination {
    pub tenant: String,
    /// Numeric prefix
    pub code: String,
    /// Destination name, shared by many codes
    pub name: String,
}

impl Destination {
    pub fn new(tenant: impl Into<String>, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            code: code.into(),
            name: name.into(),
        }
    }

    /// Matched prefix length when `number` starts with the code
    pub fn precision_for(&self, number: &str) -> Option<usize> {
        number.starts_with(&self.code).then_some(self.code.len())
    }
}

/// Longest codes first; the stable sort keeps insertion order on ties
pub fn sort_by_precision(dests: &mut [Destination]) {
    dests.sort_by(|a, b| b.code.len().cmp(&a.code.len()));
}
