//! Outbound HTTP posts: CDR replication and action callbacks
//!
//! A post failing all its attempts is appended as one JSON line to a file
//! named after the address under the fallback directory, for a later replay.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use accurate_core::config::ReplicationTarget;
use accurate_core::models::Cdr;
use accurate_core::query::Query;
use accurate_core::{AppError, AppResult};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::Engine;

pub const TRANSPORT_JSON_CDR: &str = "*http_json_cdr";
pub const TRANSPORT_JSON_MAP: &str = "*http_json_map";
pub const TRANSPORT_POST: &str = "*http_post";

/// Body of an outbound post
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Json(Value),
    Form(BTreeMap<String, String>),
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FailedPost<'a> {
    address: &'a str,
    content_type: &'static str,
    time: String,
    payload: &'a Payload,
}

/// Fibonacci back-off: `unit`, `unit`, 2×`unit`, 3×`unit`, 5×`unit` …
pub fn fib_delays(unit: Duration) -> impl Iterator<Item = Duration> {
    let mut pair = (1u32, 1u32);
    std::iter::from_fn(move || {
        let current = pair.0;
        pair = (pair.1, pair.0.saturating_add(pair.1));
        Some(unit * current)
    })
}

fn fallback_file(dir: &str, address: &str) -> PathBuf {
    let name: String = address
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    PathBuf::from(dir).join(format!("{}.jsonl", name))
}

async fn spool(dir: &str, address: &str, payload: &Payload) -> AppResult<PathBuf> {
    let path = fallback_file(dir, address);
    tokio::fs::create_dir_all(dir).await.map_err(AppError::server)?;
    let line = serde_json::to_string(&FailedPost {
        address,
        content_type: match payload {
            Payload::Json(_) => "application/json",
            Payload::Form(_) => "application/x-www-form-urlencoded",
        },
        time: Utc::now().to_rfc3339(),
        payload,
    })?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(AppError::server)?;
    file.write_all(line.as_bytes()).await.map_err(AppError::server)?;
    file.write_all(b"\n").await.map_err(AppError::server)?;
    Ok(path)
}

/// Posts `payload` to `address`, retrying with back-off, spooling it on failure
pub async fn post(
    client: &reqwest::Client,
    address: &str,
    payload: &Payload,
    attempts: u32,
    fallback_dir: &str,
) -> AppResult<String> {
    let mut delays = fib_delays(Duration::from_millis(500));
    let mut last_error = String::new();
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            if let Some(d) = delays.next() {
                tokio::time::sleep(d).await;
            }
        }
        let request = match payload {
            Payload::Json(v) => client.post(address).json(v),
            Payload::Form(m) => client.post(address).form(m),
        };
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                return resp.text().await.map_err(AppError::server);
            }
            Ok(resp) => {
                last_error = format!("unexpected status {}", resp.status());
                warn!(address, status = %resp.status(), attempt, "post refused");
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(address, error = %e, attempt, "post failed");
            }
        }
    }
    let path = spool(fallback_dir, address, payload).await?;
    Err(AppError::ServerError(format!(
        "post to {} failed ({}), payload kept in {}",
        address,
        last_error,
        path.display()
    )))
}

/// Body a replication transport sends for `cdr`
pub fn replication_payload(transport: &str, cdr: &Cdr) -> AppResult<Payload> {
    match transport {
        TRANSPORT_JSON_CDR => Ok(Payload::Json(serde_json::to_value(cdr)?)),
        TRANSPORT_JSON_MAP => Ok(Payload::Json(serde_json::to_value(cdr.as_export_map(&[]))?)),
        TRANSPORT_POST => Ok(Payload::Form(cdr.as_export_map(&[]))),
        other => Err(AppError::InvalidArgument(format!("unsupported replication transport {}", other))),
    }
}

impl Engine {
    /// Sends `cdr` to every replication target whose filter it passes
    ///
    /// Synchronous targets are awaited, the rest are posted in the background.
    pub(crate) async fn replicate_cdr(&self, cdr: &Cdr) {
        for target in &self.cfg.cdrs.replication {
            if let Err(e) = self.replicate_to(target, cdr).await {
                warn!(address = %target.address, unique_id = %cdr.unique_id, error = %e, "CDR replication failed");
            }
        }
    }

    async fn replicate_to(&self, target: &ReplicationTarget, cdr: &Cdr) -> AppResult<()> {
        if !Query::parse(&target.filter)?.matches(cdr)? {
            debug!(address = %target.address, unique_id = %cdr.unique_id, "CDR filtered out of replication");
            return Ok(());
        }
        let payload = replication_payload(&target.transport, cdr)?;
        if target.synchronous {
            post(&self.http, &target.address, &payload, target.attempts, &target.fallback_path).await?;
            return Ok(());
        }
        let client = self.http.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = post(&client, &target.address, &payload, target.attempts, &target.fallback_path).await {
                warn!(address = %target.address, error = %e, "asynchronous CDR replication failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fib_delays() {
        let d: Vec<u64> = fib_delays(Duration::from_secs(1)).take(6).map(|d| d.as_secs()).collect();
        assert_eq!(d, vec![1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn test_fallback_file_name() {
        let p = fallback_file("/tmp/failed", "http://127.0.0.1:8080/cdrs?x=1");
        assert_eq!(p, PathBuf::from("/tmp/failed/http___127.0.0.1_8080_cdrs_x_1.jsonl"));
    }

    #[test]
    fn test_replication_payloads() {
        let cdr = Cdr {
            unique_id: "abc".into(),
            account: "1001".into(),
            ..Default::default()
        };
        match replication_payload(TRANSPORT_POST, &cdr).unwrap() {
            Payload::Form(m) => assert_eq!(m.get("Account").map(String::as_str), Some("1001")),
            other => panic!("unexpected payload {:?}", other),
        }
        match replication_payload(TRANSPORT_JSON_CDR, &cdr).unwrap() {
            Payload::Json(v) => assert_eq!(v["UniqueID"], "abc"),
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(replication_payload("*amqp", &cdr).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_post_is_spooled() {
        let dir = std::env::temp_dir().join(format!("accurate_spool_{}", accurate_core::utils::gen_uuid()));
        let dir = dir.to_string_lossy().to_string();
        let client = reqwest::Client::new();
        let payload = Payload::Json(serde_json::json!({"Account": "1001"}));
        let out = post(&client, "http://127.0.0.1:9/cdrs", &payload, 1, &dir).await;
        assert!(matches!(out, Err(AppError::ServerError(_))));
        let written = tokio::fs::read_to_string(fallback_file(&dir, "http://127.0.0.1:9/cdrs"))
            .await
            .unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("\"Account\":\"1001\""));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
