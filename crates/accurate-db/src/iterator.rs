//! Forward-only cursor over one key family
//!
//! Keys are snapshotted when the cursor is opened and values are loaded one
//! by one, so writes made meanwhile may or may not be observed. Callers that
//! need a consistent view drain the cursor with [`StoreIter::all`] first.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use accurate_core::query::Query;
use accurate_core::traits::KvBackend;
use accurate_core::{AppError, AppResult};
use serde::de::DeserializeOwned;
use serde_json::Value;

enum Source {
    Keys(VecDeque<String>),
    Loaded(VecDeque<Value>),
}

pub struct StoreIter<T> {
    backend: Arc<dyn KvBackend>,
    source: Source,
    filter: Option<Query>,
    err: Option<AppError>,
    closed: bool,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> StoreIter<T> {
    pub async fn open(backend: Arc<dyn KvBackend>, prefix: &str) -> AppResult<Self> {
        let keys = backend.keys(prefix).await?;
        Ok(Self {
            backend,
            source: Source::Keys(keys.into()),
            filter: None,
            err: None,
            closed: false,
            _marker: PhantomData,
        })
    }

    /// Only yields documents matching `query`
    pub fn with_filter(mut self, query: Query) -> Self {
        self.filter = Some(query);
        self
    }

    /// Loads the remaining documents and orders them by a top level field
    pub async fn sorted_by(mut self, field: &str, descending: bool) -> AppResult<Self> {
        let mut docs = Vec::new();
        while let Some(doc) = self.next_doc().await? {
            docs.push(doc);
        }
        docs.sort_by(|a, b| {
            let ord = compare_json(a.get(field), b.get(field));
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        self.source = Source::Loaded(docs.into());
        Ok(self)
    }

    async fn next_doc(&mut self) -> AppResult<Option<Value>> {
        loop {
            let doc = match &mut self.source {
                Source::Loaded(docs) => match docs.pop_front() {
                    Some(d) => d,
                    None => return Ok(None),
                },
                Source::Keys(keys) => {
                    let Some(key) = keys.pop_front() else {
                        return Ok(None);
                    };
                    // removed after the snapshot
                    let Some(raw) = self.backend.get(&key).await? else {
                        continue;
                    };
                    serde_json::from_str(&raw)?
                }
            };
            if let Some(q) = &self.filter {
                if !q.matches_value(&doc)? {
                    continue;
                }
            }
            return Ok(Some(doc));
        }
    }

    /// Next item, `None` at the end or after an error, see [`StoreIter::err`]
    pub async fn next(&mut self) -> Option<T> {
        if self.closed || self.err.is_some() {
            return None;
        }
        let outcome = match self.next_doc().await {
            Ok(Some(doc)) => serde_json::from_value(doc).map(Some).map_err(AppError::from),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(item) => item,
            Err(e) => {
                self.err = Some(e);
                None
            }
        }
    }

    /// Drains the cursor
    pub async fn all(mut self) -> AppResult<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item);
        }
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Error that ended the iteration, if any
    pub fn err(&self) -> Option<&AppError> {
        self.err.as_ref()
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.source = Source::Loaded(VecDeque::new());
    }
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            // decimals travel as strings
            match (x.parse::<f64>(), y.parse::<f64>()) {
                (Ok(fx), Ok(fy)) => fx.partial_cmp(&fy).unwrap_or(Ordering::Equal),
                _ => x.cmp(y),
            }
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_backend::MapBackend;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    struct Doc {
        name: String,
        weight: f64,
    }

    async fn backend() -> Arc<dyn KvBackend> {
        let b = MapBackend::new();
        for (name, weight) in [("a", 10.0), ("b", 30.0), ("c", 20.0)] {
            let doc = serde_json::to_string(&Doc { name: name.into(), weight }).unwrap();
            b.set(&format!("usr_t:{}", name), doc).await.unwrap();
        }
        b.set("usr_u:z", "not json".into()).await.unwrap();
        Arc::new(b)
    }

    #[tokio::test]
    async fn test_sorted_and_filtered() {
        let b = backend().await;
        let it = StoreIter::<Doc>::open(b.clone(), "usr_t:")
            .await
            .unwrap()
            .sorted_by("Weight", true)
            .await
            .unwrap();
        let names: Vec<String> = it.all().await.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["b", "c", "a"]);

        let filtered = StoreIter::<Doc>::open(b, "usr_t:")
            .await
            .unwrap()
            .with_filter(Query::parse(r#"{"Weight":{"$gte":20}}"#).unwrap())
            .all()
            .await
            .unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[tokio::test]
    async fn test_error_stops_iteration() {
        let b = backend().await;
        let mut it = StoreIter::<Doc>::open(b, "usr_").await.unwrap();
        let mut seen = 0;
        while it.next().await.is_some() {
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert!(it.err().is_some());
    }

    #[tokio::test]
    async fn test_close() {
        let b = backend().await;
        let mut it = StoreIter::<Doc>::open(b, "usr_t:").await.unwrap();
        assert!(it.next().await.is_some());
        it.close();
        assert!(it.next().await.is_none());
        assert!(it.err().is_none());
    }
}
