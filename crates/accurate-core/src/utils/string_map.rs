//! Set of strings with polarity
//!
//! Balance destinations, directions, categories and shared groups are kept
//! as `StringMap`s. An entry mapped to `false` is an exclusion (`!NAT`).

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use super::consts::{ANY, ZERO};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringMap(BTreeMap<String, bool>);

impl StringMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds from items; a leading `!` marks the entry as excluded
    pub fn from_items<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = BTreeMap::new();
        for item in items {
            let v = item.as_ref().trim();
            if v.is_empty() {
                continue;
            }
            match v.strip_prefix('!') {
                Some(excluded) => map.insert(excluded.to_string(), false),
                None => map.insert(v.to_string(), true),
            };
        }
        Self(map)
    }

    /// Parses a separated list, `*zero` and empty yield an empty map
    pub fn parse(s: &str, sep: &str) -> Self {
        if s.is_empty() || s == ZERO {
            return Self::default();
        }
        Self::from_items(s.split(sep))
    }

    pub fn add(&mut self, val: impl Into<String>) {
        self.0.insert(val.into(), true);
    }

    pub fn remove(&mut self, val: &str) {
        self.0.remove(val);
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.0.get(key).copied()
    }

    /// True when the key is present and included
    pub fn has(&self, key: &str) -> bool {
        self.0.get(key).copied().unwrap_or(false)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Empty or containing `*any`
    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.has(ANY)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Every included key of `other` is included here
    pub fn includes(&self, other: &StringMap) -> bool {
        if self.0.len() < other.0.len() {
            return false;
        }
        other.0.keys().all(|k| self.has(k))
    }

    pub fn join(&mut self, other: &StringMap) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), *v);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, bool)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    pub fn slice(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn get_one(&self) -> Option<&str> {
        self.0.keys().next().map(|s| s.as_str())
    }
}

impl fmt::Display for StringMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| if *v { k.clone() } else { format!("!{}", k) })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl<S: AsRef<str>> FromIterator<S> for StringMap {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::from_items(iter)
    }
}

impl Serialize for StringMap {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StringMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StringMapVisitor;

        impl<'de> Visitor<'de> for StringMapVisitor {
            type Value = StringMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a list, a map of booleans or a comma separated string")
            }

            fn visit_unit<E: de::Error>(self) -> Result<StringMap, E> {
                Ok(StringMap::default())
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<StringMap, E> {
                Ok(StringMap::parse(v, ","))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<StringMap, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<String>()? {
                    items.push(item);
                }
                Ok(StringMap::from_items(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StringMap, A::Error> {
                let mut map = BTreeMap::new();
                while let Some((k, v)) = access.next_entry::<String, bool>()? {
                    map.insert(k, v);
                }
                Ok(StringMap(map))
            }
        }

        deserializer.deserialize_any(StringMapVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polarity() {
        let sm = StringMap::from_items(["NAT", "!RET", " "]);
        assert_eq!(sm.len(), 2);
        assert!(sm.has("NAT"));
        assert_eq!(sm.get("RET"), Some(false));
        assert!(!sm.has("RET"));
    }

    #[test]
    fn test_deserialize_variants() {
        let a: StringMap = serde_json::from_str(r#"["*out"]"#).unwrap();
        let b: StringMap = serde_json::from_str(r#"{"*out":true}"#).unwrap();
        let c: StringMap = serde_json::from_str(r#""*out""#).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        let empty: StringMap = serde_json::from_str("null").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_any_counts_as_empty() {
        assert!(StringMap::from_items([ANY]).is_empty());
        assert!(!StringMap::from_items(["NAT"]).is_empty());
    }

    #[test]
    fn test_includes() {
        let big = StringMap::from_items(["a", "b", "c"]);
        let small = StringMap::from_items(["a", "c"]);
        assert!(big.includes(&small));
        assert!(!small.includes(&big));
    }
}
