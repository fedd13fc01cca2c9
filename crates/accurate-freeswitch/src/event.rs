//! FreeSWITCH `json_cdr` record parsing
//!
//! The `mod_json_cdr` module posts one JSON document per leg: a
//! `variables` object holding the channel variables (URL encoded unless
//! `encode-values` is off) and a `callflow` list whose entries carry the
//! caller profile. Variables prefixed with `cgr_` override what the switch
//! reports.

use std::collections::HashMap;

use accurate_core::config::GeneralConfig;
use accurate_core::models::Cdr;
use accurate_core::utils::consts::{OUT, VOICE};
use accurate_core::utils::time::{parse_duration, parse_time};
use accurate_core::{AppError, AppResult};
use chrono::Duration;
use serde_json::Value;
use tracing::warn;

/// Source stamped on records received through this intake
pub const FS_CDR_SOURCE: &str = "freeswitch_json";

const UUID: &str = "uuid";
const USERNAME: &str = "user_name";
const DIALED_EXTENSION: &str = "dialed_extension";
const SIP_REQ_USER: &str = "sip_req_user";
const LOCAL_ADDR: &str = "sip_local_network_addr";
const SETUP_EPOCH: &str = "start_epoch";
const ANSWER_EPOCH: &str = "answer_epoch";
const BILLSEC: &str = "billsec";
const BILLUSEC: &str = "billusec";
const PROGRESS_MSEC: &str = "progressmsec";
const HANGUP_CAUSE: &str = "hangup_cause";

const CGR_TOR: &str = "cgr_tor";
const CGR_REQTYPE: &str = "cgr_reqtype";
const CGR_TENANT: &str = "cgr_tenant";
const CGR_CATEGORY: &str = "cgr_category";
const CGR_ACCOUNT: &str = "cgr_account";
const CGR_SUBJECT: &str = "cgr_subject";
const CGR_DESTINATION: &str = "cgr_destination";
const CGR_SUPPLIER: &str = "cgr_supplier";

/// One parsed `json_cdr` document
#[derive(Debug, Clone, Default)]
pub struct FsCdr {
    vars: HashMap<String, String>,
    caller_profile: HashMap<String, String>,
}

fn first_non_empty<'a>(values: &[&'a str]) -> &'a str {
    values.iter().copied().find(|v| !v.is_empty()).unwrap_or_default()
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(
            urlencoding::decode(s)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| s.clone()),
        ),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text_map(v: Option<&Value>) -> HashMap<String, String> {
    v.and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| as_text(v).map(|t| (k.clone(), t)))
                .collect()
        })
        .unwrap_or_default()
}

impl FsCdr {
    /// Parses the request body
    pub fn parse(body: &[u8]) -> AppResult<Self> {
        let doc: Value = serde_json::from_slice(body)?;
        if !doc.is_object() {
            return Err(AppError::ParserError("FreeSWITCH CDR is not a JSON object".into()));
        }
        let vars = text_map(doc.get("variables"));
        if vars.is_empty() {
            return Err(AppError::MandatoryIeMissing(vec!["variables".into()]));
        }
        // a single leg posts callflow as an object, a transferred one as a list
        let flow = match doc.get("callflow") {
            Some(Value::Array(items)) => items.first(),
            other => other,
        };
        let caller_profile = text_map(flow.and_then(|f| f.get("caller_profile")));
        Ok(Self { vars, caller_profile })
    }

    /// A channel variable, empty when not set
    pub fn var(&self, name: &str) -> &str {
        self.vars.get(name).map(String::as_str).unwrap_or_default()
    }

    fn profile(&self, name: &str) -> &str {
        self.caller_profile.get(name).map(String::as_str).unwrap_or_default()
    }

    pub fn origin_id(&self) -> &str {
        self.var(UUID)
    }

    pub fn account(&self) -> &str {
        first_non_empty(&[self.var(CGR_ACCOUNT), self.var(USERNAME), self.profile("username")])
    }

    pub fn subject(&self) -> &str {
        first_non_empty(&[self.var(CGR_SUBJECT), self.account()])
    }

    pub fn destination(&self) -> &str {
        first_non_empty(&[
            self.var(CGR_DESTINATION),
            self.var(DIALED_EXTENSION),
            self.profile("destination_number"),
            self.var(SIP_REQ_USER),
        ])
    }

    fn usage(&self) -> AppResult<Duration> {
        match self.var(BILLUSEC).parse::<i64>() {
            Ok(us) => Ok(Duration::microseconds(us)),
            Err(_) => parse_duration(self.var(BILLSEC)),
        }
    }

    fn pdd(&self) -> Duration {
        self.var(PROGRESS_MSEC)
            .parse::<i64>()
            .map(Duration::milliseconds)
            .unwrap_or_else(|_| Duration::zero())
    }

    /// Converts into a raw record, defaults coming from `general`
    ///
    /// `extra_fields` names channel variables copied into the record's extra
    /// fields; a leading `~` marks a variable that may be missing.
    pub fn as_cdr(&self, general: &GeneralConfig, extra_fields: &[String]) -> AppResult<Cdr> {
        if self.origin_id().is_empty() {
            return Err(AppError::MandatoryIeMissing(vec![UUID.into()]));
        }
        let mut cdr = Cdr {
            tor: first_non_empty(&[self.var(CGR_TOR), VOICE]).to_string(),
            origin_id: self.origin_id().to_string(),
            origin_host: first_non_empty(&[self.var(LOCAL_ADDR), self.profile("network_addr")]).to_string(),
            source: FS_CDR_SOURCE.to_string(),
            request_type: first_non_empty(&[self.var(CGR_REQTYPE), &general.default_request_type]).to_string(),
            direction: OUT.to_string(),
            tenant: first_non_empty(&[self.var(CGR_TENANT), &general.default_tenant]).to_string(),
            category: first_non_empty(&[self.var(CGR_CATEGORY), &general.default_category]).to_string(),
            account: self.account().to_string(),
            subject: self.subject().to_string(),
            destination: self.destination().to_string(),
            setup_time: parse_time(self.var(SETUP_EPOCH))?,
            answer_time: parse_time(self.var(ANSWER_EPOCH))?,
            usage: self.usage()?,
            pdd: self.pdd(),
            supplier: self.var(CGR_SUPPLIER).to_string(),
            disconnect_cause: self.var(HANGUP_CAUSE).to_string(),
            ..Default::default()
        };
        for field in extra_fields {
            let (name, optional) = match field.strip_prefix('~') {
                Some(name) => (name, true),
                None => (field.as_str(), false),
            };
            match self.vars.get(name) {
                Some(v) => {
                    cdr.extra_fields.insert(name.to_string(), v.clone());
                }
                None if !optional => {
                    warn!(origin_id = %cdr.origin_id, field = name, "extra field missing from FreeSWITCH CDR");
                }
                None => {}
            }
        }
        cdr.compute_unique_id();
        Ok(cdr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const BODY: &str = r#"{
        "core-uuid": "651a8db2-4f67-4cf8-b622-169e8a482e50",
        "switchname": "sw1",
        "channel_data": {"state": "CS_REPORTING", "direction": "outbound"},
        "variables": {
            "uuid": "e3133bf7-dcde-4daf-9663-9a79ffcef5ad",
            "sip_local_network_addr": "127.0.0.1",
            "user_name": "1001",
            "dialed_extension": "1002",
            "sip_req_user": "1002",
            "start_epoch": "1436280728",
            "answer_epoch": "1436280728",
            "billsec": "66",
            "progressmsec": "250",
            "hangup_cause": "NORMAL_CLEARING",
            "cgr_reqtype": "*prepaid",
            "cgr_supplier": "supplier1",
            "sip_user_agent": "PJSUA%20v2.3.0%20Linux",
            "read_codec": "SPEEX"
        },
        "callflow": [{
            "caller_profile": {"username": "1001", "destination_number": "1002", "network_addr": "10.0.0.7"}
        }]
    }"#;

    fn parsed() -> FsCdr {
        FsCdr::parse(BODY.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_decodes_variables() {
        let fs = parsed();
        assert_eq!(fs.origin_id(), "e3133bf7-dcde-4daf-9663-9a79ffcef5ad");
        assert_eq!(fs.var("sip_user_agent"), "PJSUA v2.3.0 Linux");
        assert_eq!(fs.var("absent"), "");
    }

    #[test]
    fn test_as_cdr_uses_defaults_and_overrides() {
        let general = GeneralConfig::default();
        let cdr = parsed().as_cdr(&general, &[]).unwrap();
        assert_eq!(cdr.request_type, "*prepaid");
        assert_eq!(cdr.tenant, general.default_tenant);
        assert_eq!(cdr.category, general.default_category);
        assert_eq!(cdr.account, "1001");
        assert_eq!(cdr.subject, "1001");
        assert_eq!(cdr.destination, "1002");
        assert_eq!(cdr.origin_host, "127.0.0.1");
        assert_eq!(cdr.source, FS_CDR_SOURCE);
        assert_eq!(cdr.setup_time, Utc.timestamp_opt(1436280728, 0).unwrap());
        assert_eq!(cdr.usage, Duration::seconds(66));
        assert_eq!(cdr.pdd, Duration::milliseconds(250));
        assert_eq!(cdr.supplier, "supplier1");
        assert_eq!(cdr.disconnect_cause, "NORMAL_CLEARING");
        assert!(!cdr.unique_id.is_empty());
        assert!(cdr.extra_fields.is_empty());
    }

    #[test]
    fn test_extra_fields_copied() {
        let fields = vec!["read_codec".to_string(), "~write_codec".to_string(), "sip_user_agent".to_string()];
        let cdr = parsed().as_cdr(&GeneralConfig::default(), &fields).unwrap();
        assert_eq!(cdr.extra_fields.len(), 2);
        assert_eq!(cdr.extra_fields["read_codec"], "SPEEX");
        assert_eq!(cdr.extra_fields["sip_user_agent"], "PJSUA v2.3.0 Linux");
    }

    #[test]
    fn test_cgr_account_wins() {
        let body = r#"{"variables":{"uuid":"abc","user_name":"1001","cgr_account":"dan","cgr_subject":"rif","billusec":"1500000"},
                       "callflow":{"caller_profile":{"destination_number":"+4986517174963"}}}"#;
        let cdr = FsCdr::parse(body.as_bytes())
            .unwrap()
            .as_cdr(&GeneralConfig::default(), &[])
            .unwrap();
        assert_eq!(cdr.account, "dan");
        assert_eq!(cdr.subject, "rif");
        assert_eq!(cdr.destination, "+4986517174963");
        assert_eq!(cdr.usage, Duration::milliseconds(1500));
    }

    #[test]
    fn test_rejects_incomplete_documents() {
        assert!(matches!(FsCdr::parse(b"[1,2]"), Err(AppError::ParserError(_))));
        assert!(matches!(
            FsCdr::parse(br#"{"callflow":[]}"#),
            Err(AppError::MandatoryIeMissing(_))
        ));
        let fs = FsCdr::parse(br#"{"variables":{"billsec":"10"}}"#).unwrap();
        assert!(matches!(
            fs.as_cdr(&GeneralConfig::default(), &[]),
            Err(AppError::MandatoryIeMissing(_))
        ));
    }
}
