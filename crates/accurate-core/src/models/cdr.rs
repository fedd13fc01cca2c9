//! Call detail records and the session manager cost log

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::account::AccountSummary;
use super::callcost::{CallCost, CallDescriptor};
use crate::utils::consts::*;
use crate::utils::time::{duration_nanos, is_zero_time, parse_duration, parse_time, secs_f64, zero_time};
use crate::utils::sha_id;
use crate::AppResult;

/// Cost marker of a record that was not rated (yet)
pub fn unrated_cost() -> Decimal {
    Decimal::NEGATIVE_ONE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Cdr {
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
    /// Store assigned, monotonic
    #[serde(rename = "OrderID")]
    pub order_id: i64,
    #[serde(rename = "ToR")]
    pub tor: String,
    #[serde(rename = "OriginID")]
    pub origin_id: String,
    pub origin_host: String,
    pub source: String,
    pub request_type: String,
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub account: String,
    pub subject: String,
    pub destination: String,
    pub setup_time: DateTime<Utc>,
    #[serde(rename = "PDD", with = "duration_nanos")]
    pub pdd: Duration,
    pub answer_time: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub usage: Duration,
    pub supplier: String,
    pub disconnect_cause: String,
    pub extra_fields: BTreeMap<String, String>,
    #[serde(rename = "RunID")]
    pub run_id: String,
    pub cost_source: String,
    pub cost: Decimal,
    pub cost_details: Option<CallCost>,
    /// Rating errors end up here
    pub extra_info: String,
    pub account_summary: Option<AccountSummary>,
    /// Cost was computed upstream, the record skips rating
    pub rated: bool,
}

impl Default for Cdr {
    fn default() -> Self {
        Self {
            unique_id: String::new(),
            order_id: 0,
            tor: VOICE.to_string(),
            origin_id: String::new(),
            origin_host: String::new(),
            source: String::new(),
            request_type: String::new(),
            direction: String::new(),
            tenant: String::new(),
            category: String::new(),
            account: String::new(),
            subject: String::new(),
            destination: String::new(),
            setup_time: zero_time(),
            pdd: Duration::zero(),
            answer_time: zero_time(),
            usage: Duration::zero(),
            supplier: String::new(),
            disconnect_cause: String::new(),
            extra_fields: BTreeMap::new(),
            run_id: String::new(),
            cost_source: String::new(),
            cost: unrated_cost(),
            cost_details: None,
            extra_info: String::new(),
            account_summary: None,
            rated: false,
        }
    }
}

impl Cdr {
    /// Builds a record out of `name=value` pairs as posted to the generic HTTP intake
    ///
    /// Names outside the primary set become extra fields.
    pub fn from_fields(fields: &BTreeMap<String, String>, source: &str) -> AppResult<Self> {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let mut cdr = Cdr {
            tor: fields.get(TOR).cloned().unwrap_or_else(|| VOICE.to_string()),
            origin_id: get(ACCID),
            origin_host: get(CDRHOST),
            source: fields.get(CDRSOURCE).cloned().unwrap_or_else(|| source.to_string()),
            request_type: get(REQTYPE),
            direction: fields.get(DIRECTION).cloned().unwrap_or_else(|| OUT.to_string()),
            tenant: get(TENANT),
            category: get(CATEGORY),
            account: get(ACCOUNT),
            subject: get(SUBJECT),
            destination: get(DESTINATION),
            setup_time: parse_time(&get(SETUP_TIME))?,
            pdd: parse_duration(&get(PDD))?,
            answer_time: parse_time(&get(ANSWER_TIME))?,
            usage: parse_duration(&get(USAGE))?,
            supplier: get(SUPPLIER),
            disconnect_cause: get(DISCONNECT_CAUSE),
            run_id: get(MEDI_RUNID),
            ..Default::default()
        };
        cdr.extra_fields = fields
            .iter()
            .filter(|(k, _)| !PRIMARY_CDR_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(cost) = fields.get(COST) {
            cdr.cost = cost
                .parse()
                .map_err(|e: rust_decimal::Error| crate::error::AppError::ParserError(e.to_string()))?;
        }
        if let Some(rated) = fields.get(RATED) {
            cdr.rated = matches!(rated.as_str(), "true" | "1" | "TRUE" | "True");
        }
        match fields.get(UNIQUE_ID) {
            Some(id) if !id.is_empty() => cdr.unique_id = id.clone(),
            _ => cdr.compute_unique_id(),
        }
        Ok(cdr)
    }

    /// Derives the unique id from origin id and setup time
    pub fn compute_unique_id(&mut self) {
        self.unique_id = sha_id([self.origin_id.as_str(), &self.setup_time.to_rfc3339()]);
    }

    pub fn is_raw(&self) -> bool {
        self.run_id == RAW
    }

    /// Answer time, or setup time for unanswered calls
    pub fn start_time(&self) -> DateTime<Utc> {
        if is_zero_time(&self.answer_time) {
            self.setup_time
        } else {
            self.answer_time
        }
    }

    /// Descriptor rating this record's usage
    pub fn call_descriptor(&self) -> CallDescriptor {
        let start = self.start_time();
        CallDescriptor {
            direction: self.direction.clone(),
            category: self.category.clone(),
            tenant: self.tenant.clone(),
            subject: self.subject.clone(),
            account: self.account.clone(),
            destination: self.destination.clone(),
            tor: self.tor.clone(),
            time_start: start,
            time_end: start + self.usage,
            duration_index: self.usage,
            unique_id: self.unique_id.clone(),
            run_id: self.run_id.clone(),
            extra_fields: self.extra_fields.clone(),
            perform_rounding: true,
            ..Default::default()
        }
    }

    /// String form of a primary or extra field, empty when unknown
    pub fn field_as_string(&self, name: &str) -> String {
        match name {
            CGRID | UNIQUE_ID => self.unique_id.clone(),
            ORDERID => self.order_id.to_string(),
            TOR => self.tor.clone(),
            ACCID => self.origin_id.clone(),
            CDRHOST => self.origin_host.clone(),
            CDRSOURCE => self.source.clone(),
            REQTYPE => self.request_type.clone(),
            DIRECTION => self.direction.clone(),
            TENANT => self.tenant.clone(),
            CATEGORY => self.category.clone(),
            ACCOUNT => self.account.clone(),
            SUBJECT => self.subject.clone(),
            DESTINATION => self.destination.clone(),
            SETUP_TIME => self.setup_time.to_rfc3339(),
            PDD => secs_f64(self.pdd).to_string(),
            ANSWER_TIME => self.answer_time.to_rfc3339(),
            USAGE => secs_f64(self.usage).to_string(),
            SUPPLIER => self.supplier.clone(),
            DISCONNECT_CAUSE => self.disconnect_cause.clone(),
            MEDI_RUNID => self.run_id.clone(),
            COST => self.cost.to_string(),
            RATED => self.rated.to_string(),
            COST_DETAILS => self
                .cost_details
                .as_ref()
                .and_then(|cc| serde_json::to_string(cc).ok())
                .unwrap_or_default(),
            other => self.extra_fields.get(other).cloned().unwrap_or_default(),
        }
    }

    /// Flat field map for replication; all primary and extra fields when `fields` is empty
    pub fn as_export_map(&self, fields: &[String]) -> BTreeMap<String, String> {
        if fields.is_empty() {
            let mut out: BTreeMap<String, String> = PRIMARY_CDR_FIELDS
                .iter()
                .map(|f| (f.to_string(), self.field_as_string(f)))
                .collect();
            out.extend(self.extra_fields.clone());
            return out;
        }
        fields
            .iter()
            .map(|f| (f.clone(), self.field_as_string(f)))
            .collect()
    }
}

/// Cost computed by a session manager, joined to CDRs at rating time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SmCost {
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
    #[serde(rename = "RunID")]
    pub run_id: String,
    pub origin_host: String,
    #[serde(rename = "OriginID")]
    pub origin_id: String,
    pub cost_source: String,
    /// Seconds
    pub usage: f64,
    pub cost_details: Option<CallCost>,
}

/// Selection over stored CDRs; empty lists do not filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CdrsFilter {
    #[serde(rename = "UniqueIDs")]
    pub unique_ids: Vec<String>,
    #[serde(rename = "NotUniqueIDs")]
    pub not_unique_ids: Vec<String>,
    #[serde(rename = "RunIDs")]
    pub run_ids: Vec<String>,
    #[serde(rename = "NotRunIDs")]
    pub not_run_ids: Vec<String>,
    pub origin_hosts: Vec<String>,
    pub sources: Vec<String>,
    #[serde(rename = "ToRs")]
    pub tors: Vec<String>,
    pub request_types: Vec<String>,
    pub directions: Vec<String>,
    pub tenants: Vec<String>,
    pub categories: Vec<String>,
    pub accounts: Vec<String>,
    pub subjects: Vec<String>,
    pub destination_prefixes: Vec<String>,
    pub not_destination_prefixes: Vec<String>,
    pub suppliers: Vec<String>,
    pub disconnect_causes: Vec<String>,
    pub setup_time_start: Option<DateTime<Utc>>,
    pub setup_time_end: Option<DateTime<Utc>>,
    pub answer_time_start: Option<DateTime<Utc>>,
    pub answer_time_end: Option<DateTime<Utc>>,
    pub min_usage: Option<String>,
    pub max_usage: Option<String>,
    pub min_cost: Option<Decimal>,
    pub max_cost: Option<Decimal>,
    pub rated: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn in_list(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == value)
}

impl CdrsFilter {
    /// Evaluates the filter in memory
    pub fn matches(&self, cdr: &Cdr) -> AppResult<bool> {
        let usage_ok = {
            let min = self.min_usage.as_deref().map(parse_duration).transpose()?;
            let max = self.max_usage.as_deref().map(parse_duration).transpose()?;
            min.map_or(true, |m| cdr.usage >= m) && max.map_or(true, |m| cdr.usage < m)
        };
        Ok(usage_ok
            && in_list(&self.unique_ids, &cdr.unique_id)
            && !self.not_unique_ids.contains(&cdr.unique_id)
            && in_list(&self.run_ids, &cdr.run_id)
            && !self.not_run_ids.contains(&cdr.run_id)
            && in_list(&self.origin_hosts, &cdr.origin_host)
            && in_list(&self.sources, &cdr.source)
            && in_list(&self.tors, &cdr.tor)
            && in_list(&self.request_types, &cdr.request_type)
            && in_list(&self.directions, &cdr.direction)
            && in_list(&self.tenants, &cdr.tenant)
            && in_list(&self.categories, &cdr.category)
            && in_list(&self.accounts, &cdr.account)
            && in_list(&self.subjects, &cdr.subject)
            && in_list(&self.suppliers, &cdr.supplier)
            && in_list(&self.disconnect_causes, &cdr.disconnect_cause)
            && (self.destination_prefixes.is_empty()
                || self
                    .destination_prefixes
                    .iter()
                    .any(|p| cdr.destination.starts_with(p.as_str())))
            && !self
                .not_destination_prefixes
                .iter()
                .any(|p| cdr.destination.starts_with(p.as_str()))
            && self.setup_time_start.map_or(true, |t| cdr.setup_time >= t)
            && self.setup_time_end.map_or(true, |t| cdr.setup_time < t)
            && self.answer_time_start.map_or(true, |t| cdr.answer_time >= t)
            && self.answer_time_end.map_or(true, |t| cdr.answer_time < t)
            && self.min_cost.map_or(true, |c| cdr.cost >= c)
            && self.max_cost.map_or(true, |c| cdr.cost < c)
            && self.rated.map_or(true, |r| cdr.rated == r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn form() -> BTreeMap<String, String> {
        [
            (ACCID, "dsafdsaf"),
            (CDRHOST, "192.168.1.1"),
            (REQTYPE, META_RATED),
            (TENANT, "cgrates.org"),
            (CATEGORY, "call"),
            (ACCOUNT, "1001"),
            (SUBJECT, "1001"),
            (DESTINATION, "1002"),
            (SETUP_TIME, "2013-11-07T08:42:20Z"),
            (ANSWER_TIME, "2013-11-07T08:42:26Z"),
            (USAGE, "10"),
            ("field_extr1", "val_extr1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_from_fields() {
        let cdr = Cdr::from_fields(&form(), "10.0.0.1:5060").unwrap();
        assert_eq!(cdr.account, "1001");
        assert_eq!(cdr.direction, OUT);
        assert_eq!(cdr.source, "10.0.0.1:5060");
        assert_eq!(cdr.usage, Duration::seconds(10));
        assert_eq!(cdr.cost, dec!(-1));
        assert_eq!(cdr.extra_fields.get("field_extr1").map(String::as_str), Some("val_extr1"));
        assert!(!cdr.unique_id.is_empty());

        let again = Cdr::from_fields(&form(), "other").unwrap();
        assert_eq!(cdr.unique_id, again.unique_id);
    }

    #[test]
    fn test_call_descriptor_uses_setup_when_unanswered() {
        let mut cdr = Cdr::from_fields(&form(), "").unwrap();
        cdr.answer_time = zero_time();
        let cd = cdr.call_descriptor();
        assert_eq!(cd.time_start, cdr.setup_time);
        assert_eq!(cd.duration(), Duration::seconds(10));
        assert!(cd.perform_rounding);
    }

    #[test]
    fn test_filter() {
        let cdr = Cdr::from_fields(&form(), "").unwrap();
        let mut f = CdrsFilter {
            tenants: vec!["cgrates.org".into()],
            destination_prefixes: vec!["10".into()],
            ..Default::default()
        };
        assert!(f.matches(&cdr).unwrap());
        f.min_usage = Some("20s".into());
        assert!(!f.matches(&cdr).unwrap());
        f.min_usage = None;
        f.not_destination_prefixes = vec!["100".into()];
        assert!(!f.matches(&cdr).unwrap());
    }

    #[test]
    fn test_export_map() {
        let cdr = Cdr::from_fields(&form(), "").unwrap();
        let all = cdr.as_export_map(&[]);
        assert_eq!(all.get(ACCOUNT).map(String::as_str), Some("1001"));
        assert_eq!(all.get("field_extr1").map(String::as_str), Some("val_extr1"));
        let some = cdr.as_export_map(&[DESTINATION.to_string()]);
        assert_eq!(some.len(), 1);
    }
}
