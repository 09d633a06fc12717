//! Path-addressed configuration trees.
//!
//! A [`TomlConfig`] is what users put into `spec.config` of every set and what
//! the controllers hand to the database binary as `config.toml`. On the wire
//! (JSON/YAML of a custom resource) it travels as a string holding the TOML
//! document; decoding also accepts a plain nested object.

use std::fmt;

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::errors::*;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TomlConfig {
    data: Table,
}

impl TomlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(data: Table) -> Self {
        Self { data }
    }

    /// Parse a TOML document.
    pub fn parse(s: &str) -> Result<Self> {
        let data: Table = toml::from_str(s)?;
        Ok(Self { data })
    }

    /// Render as a TOML document.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(&self.data)?)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn table(&self) -> &Table {
        &self.data
    }

    /// Returns a deep copy of the value at `path`.
    pub fn get(&self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let mut cur = &self.data;
        for key in parents {
            cur = cur.get(*key)?.as_table()?;
        }
        cur.get(*last).cloned()
    }

    /// Sets `value` at `path`, creating intermediate tables and replacing
    /// intermediate values that are not tables.
    pub fn set(&mut self, path: &[&str], value: impl Into<Value>) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut cur = &mut self.data;
        for key in parents {
            if !matches!(cur.get(*key), Some(Value::Table(_))) {
                cur.insert(key.to_string(), Value::Table(Table::new()));
            }
            cur = match cur.get_mut(*key) {
                Some(Value::Table(t)) => t,
                _ => return,
            };
        }
        cur.insert(last.to_string(), value.into());
    }

    /// Removes the value at `path`. Absent paths are ignored.
    pub fn del(&mut self, path: &[&str]) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut cur = &mut self.data;
        for key in parents {
            match cur.get_mut(*key) {
                Some(Value::Table(t)) => cur = t,
                _ => return,
            }
        }
        cur.remove(*last);
    }

    /// Deep union of `other` into `self`; `other` wins on leaf collisions.
    pub fn merge(&mut self, other: &TomlConfig) {
        merge_tables(&mut self.data, &other.data);
    }

    /// Returns `base` with `self` merged on top.
    pub fn merged_onto(&self, base: &TomlConfig) -> TomlConfig {
        let mut out = base.clone();
        out.merge(self);
        out
    }
}

fn merge_tables(dst: &mut Table, src: &Table) {
    for (k, v) in src {
        match (dst.get_mut(k), v) {
            (Some(Value::Table(d)), Value::Table(s)) => merge_tables(d, s),
            _ => {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
}

impl fmt::Display for TomlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_toml() {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl Serialize for TomlConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let s = self.to_toml().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&s)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Repr {
    Text(String),
    Tree(Table),
}

impl<'de> Deserialize<'de> for TomlConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => TomlConfig::parse(&s).map_err(serde::de::Error::custom),
            Repr::Tree(data) => Ok(TomlConfig { data }),
        }
    }
}

impl JsonSchema for TomlConfig {
    fn schema_name() -> String {
        "TomlConfig".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        Schema::Object(SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TomlConfig {
        TomlConfig::parse(
            r#"
service-type = "CN"
data-dir = "/var/lib/matrixone/data"

[log]
level = "info"
format = "json"

[cn.frontend]
port = 6001
unix-socket = "/tmp/mysql.sock"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_get_nested() {
        let c = sample();
        assert_eq!(c.get(&["log", "level"]), Some(Value::from("info")));
        assert_eq!(c.get(&["cn", "frontend", "port"]), Some(Value::from(6001)));
        assert_eq!(c.get(&["cn", "missing"]), None);
        assert_eq!(c.get(&["service-type", "nested"]), None);
        assert_eq!(c.get(&[]), None);
    }

    #[test]
    fn test_set_creates_intermediate_tables() {
        let mut c = TomlConfig::new();
        c.set(&["fileservice", "s3", "bucket"], "test-bucket");
        assert_eq!(
            c.get(&["fileservice", "s3", "bucket"]),
            Some(Value::from("test-bucket"))
        );
    }

    #[test]
    fn test_set_overwrites_scalar_intermediate() {
        let mut c = sample();
        c.set(&["service-type", "inner"], 1);
        assert_eq!(c.get(&["service-type", "inner"]), Some(Value::from(1)));
    }

    #[test]
    fn test_set_get_is_identity() {
        let original = sample();
        let mut c = original.clone();
        let v = c.get(&["cn", "frontend"]).unwrap();
        c.set(&["cn", "frontend"], v);
        assert_eq!(c, original);
    }

    #[test]
    fn test_del_is_idempotent() {
        let mut c = sample();
        c.del(&["log", "format"]);
        let once = c.clone();
        c.del(&["log", "format"]);
        c.del(&["no", "such", "path"]);
        assert_eq!(c, once);
        assert_eq!(c.get(&["log", "format"]), None);
        assert_eq!(c.get(&["log", "level"]), Some(Value::from("info")));
    }

    #[test]
    fn test_merge_other_wins_on_leaves() {
        let mut base = sample();
        let overlay = TomlConfig::parse(
            r#"
[log]
level = "debug"

[cn.frontend]
lower-case-table-names = 1
"#,
        )
        .unwrap();
        base.merge(&overlay);
        assert_eq!(base.get(&["log", "level"]), Some(Value::from("debug")));
        assert_eq!(base.get(&["log", "format"]), Some(Value::from("json")));
        assert_eq!(base.get(&["cn", "frontend", "port"]), Some(Value::from(6001)));
        assert_eq!(
            base.get(&["cn", "frontend", "lower-case-table-names"]),
            Some(Value::from(1))
        );
    }

    #[test]
    fn test_get_returns_independent_copy() {
        let mut c = sample();
        let snapshot = c.get(&["log"]).unwrap();
        c.set(&["log", "level"], "error");
        assert_eq!(
            snapshot.as_table().unwrap().get("level"),
            Some(&Value::from("info"))
        );
    }

    #[test]
    fn test_parse_serialise_roundtrip() {
        let c = sample();
        let text = c.to_toml().unwrap();
        assert_eq!(TomlConfig::parse(&text).unwrap(), c);
    }

    #[test]
    fn test_json_encodes_as_string() {
        let c = sample();
        let v = serde_json::to_value(&c).unwrap();
        let s = v.as_str().expect("config encodes as a JSON string");
        assert_eq!(TomlConfig::parse(s).unwrap(), c);
    }

    #[test]
    fn test_json_decodes_string_or_object() {
        let from_str: TomlConfig =
            serde_json::from_value(serde_json::json!("[log]\nlevel = \"warn\"\n")).unwrap();
        let from_obj: TomlConfig =
            serde_json::from_value(serde_json::json!({"log": {"level": "warn"}})).unwrap();
        assert_eq!(from_str, from_obj);
    }
}
