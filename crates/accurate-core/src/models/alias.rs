//! Aliases rewrite request fields before rating

use serde::{Deserialize, Serialize};

use crate::query::Query;
use crate::utils::consts::ANY;
use crate::utils::concatenated_key;
use crate::AppResult;

/// `{"target": "alias"}` pair indexed for reverse lookups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AliasIndex {
    pub target: String,
    pub alias: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AliasValue {
    /// Destination the value applies to, `*any` for all
    #[serde(rename = "DestinationID")]
    pub destination_id: String,
    /// Structured query applied to the request
    pub fields: String,
    pub weight: f64,
}

impl AliasValue {
    pub fn query(&self) -> AppResult<Query> {
        Query::parse(&self.fields)
    }
}

/// Higher weights first
pub fn sort_alias_values(values: &mut [AliasValue]) {
    values.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Alias {
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub account: String,
    pub subject: String,
    pub context: String,
    pub index: Vec<AliasIndex>,
    pub values: Vec<AliasValue>,
}

impl Alias {
    /// Key inside the tenant namespace
    pub fn full_id(&self) -> String {
        alias_key(&self.direction, &self.category, &self.account, &self.subject, &self.context)
    }

    /// Count of fields that are not `*any`
    pub fn precision(&self) -> usize {
        [
            &self.direction,
            &self.category,
            &self.account,
            &self.subject,
            &self.context,
        ]
        .iter()
        .filter(|f| f.as_str() != ANY)
        .count()
    }

    pub fn value_by_destination(&self, destination_id: &str) -> Option<&AliasValue> {
        self.values.iter().find(|v| v.destination_id == destination_id)
    }

    /// Merges `values` in: same destination replaces fields and weight, new ones are appended
    pub fn merge_values(&mut self, values: Vec<AliasValue>) {
        for mut value in values {
            if value.destination_id.is_empty() {
                value.destination_id = ANY.to_string();
            }
            match self
                .values
                .iter_mut()
                .find(|v| v.destination_id == value.destination_id)
            {
                Some(old) => {
                    old.fields = value.fields;
                    old.weight = value.weight;
                }
                None => self.values.push(value),
            }
        }
    }

    /// Value to apply given the names of the destinations matched by the dialled number
    ///
    /// With no destination (or `*any`) the heaviest value wins.
    pub fn select_value<'a>(&'a self, destination: &str, dest_names: &[String]) -> Option<&'a AliasValue> {
        let mut values: Vec<&AliasValue> = self.values.iter().collect();
        values.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if destination.is_empty() || destination == ANY {
            return values.first().copied();
        }
        values
            .into_iter()
            .find(|v| v.destination_id == ANY || dest_names.iter().any(|n| *n == v.destination_id))
    }

    /// Keys of the reverse index entries this alias feeds
    pub fn reverse_keys(&self) -> Vec<String> {
        self.index
            .iter()
            .map(|i| reverse_alias_key(&self.context, &i.target, &i.alias))
            .collect()
    }

    /// Some value rewrites `target` to `alias`
    pub fn has_reverse(&self, target: &str, alias: &str) -> Option<&AliasValue> {
        let needle = format!(r#""{}":"{}""#, target, alias);
        self.values
            .iter()
            .find(|v| v.fields.replace(' ', "").contains(&needle))
    }
}

pub fn alias_key(direction: &str, category: &str, account: &str, subject: &str, context: &str) -> String {
    concatenated_key(&[direction, category, account, subject, context])
}

pub fn reverse_alias_key(context: &str, target: &str, alias: &str) -> String {
    concatenated_key(&[context, target, alias])
}

/// Request attributes an alias is looked up by
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrAlias {
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub account: String,
    pub subject: String,
    pub context: String,
    pub destination: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrReverseAlias {
    pub tenant: String,
    pub context: String,
    pub target: String,
    pub alias: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrAddAlias {
    pub alias: Alias,
    pub overwrite: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias() -> Alias {
        Alias {
            direction: "*out".into(),
            tenant: "test".into(),
            category: "call".into(),
            account: "dan".into(),
            subject: "dan".into(),
            context: "*rating".into(),
            index: vec![AliasIndex { target: "Subject".into(), alias: "rif1".into() }],
            values: vec![
                AliasValue {
                    destination_id: "EU_LANDLINE".into(),
                    fields: r#"{"Subject":{"$rpl":["dan","dan1"]}}"#.into(),
                    weight: 10.0,
                },
                AliasValue {
                    destination_id: ANY.into(),
                    fields: r#"{"Subject":{"$rpl":["dan","rif1"]}}"#.into(),
                    weight: 20.0,
                },
            ],
        }
    }

    #[test]
    fn test_precision() {
        let mut al = alias();
        assert_eq!(al.precision(), 5);
        al.account = ANY.into();
        assert_eq!(al.precision(), 4);
    }

    #[test]
    fn test_select_value() {
        let al = alias();
        assert_eq!(al.select_value("", &[]).unwrap().destination_id, ANY);
        let names = vec!["EU_LANDLINE".to_string()];
        assert_eq!(al.select_value("4986", &names).unwrap().destination_id, ANY);
        let mut only_dest = al.clone();
        only_dest.values.remove(1);
        assert_eq!(
            only_dest.select_value("4986", &names).unwrap().destination_id,
            "EU_LANDLINE"
        );
        assert!(only_dest.select_value("4986", &[]).is_none());
    }

    #[test]
    fn test_merge_values() {
        let mut al = alias();
        al.merge_values(vec![
            AliasValue { destination_id: "".into(), fields: "{}".into(), weight: 5.0 },
            AliasValue { destination_id: "NAT".into(), fields: "{}".into(), weight: 1.0 },
        ]);
        assert_eq!(al.values.len(), 3);
        assert_eq!(al.value_by_destination(ANY).unwrap().weight, 5.0);
    }

    #[test]
    fn test_reverse() {
        let al = alias();
        assert_eq!(al.reverse_keys(), vec!["*rating:Subject:rif1".to_string()]);
        assert!(al.has_reverse("Subject", "rif1").is_none());
        let mut al2 = al.clone();
        al2.values[1].fields = r#"{"Subject":{"$set":"rif1"}}"#.into();
        assert!(al2.has_reverse("Subject", "rif1").is_none());
        al2.values[1].fields = r#"{"Subject":"rif1"}"#.into();
        assert!(al2.has_reverse("Subject", "rif1").is_some());
    }
}
