//! Server instances and the configuration schema builder.
//!
//! A "server instance" (§3) is a named, running configuration of a server
//! *type*: the `detect_proto`/`connect_socket`/`reset`/`notify` function
//! set an application registers, keyed by name so the binding manager and
//! protocol detector can look it up. `ConfigSchema`/`ConfigField` replace
//! the original's byte-offset prototype walk (`boot.c`) with a
//! schema-driven builder over a `serde_json::Value` tree, per the ambient
//! configuration concern.

use std::collections::HashMap;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::portcfg::PortConfig;
use crate::socket::Socket;

pub type DetectFn = fn(&PortConfig, &mut Socket) -> bool;
pub type ConnectFn = fn(&PortConfig, &mut Socket) -> Result<()>;
pub type ResetFn = fn();
pub type NotifyFn = fn();

/// One named server type's callback set, installed into the registry at
/// startup (the dynamic-loader equivalent of the original's static
/// `server_definition` table, see `src/loader.rs`).
pub struct ServerType {
    pub name: String,
    pub detect_proto: Option<DetectFn>,
    pub connect_socket: ConnectFn,
    pub reset: Option<ResetFn>,
    pub notify: Option<NotifyFn>,
}

/// Name → server type lookup table.
#[derive(Default)]
pub struct ServerRegistry {
    types: HashMap<String, ServerType>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        ServerRegistry::default()
    }

    pub fn register(&mut self, ty: ServerType) {
        self.types.insert(ty.name.clone(), ty);
    }

    pub fn get(&self, name: &str) -> Option<&ServerType> {
        self.types.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerType> {
        self.types.values()
    }

    /// SIGHUP handling: runs every registered type's optional `reset`.
    /// Never fatal; a type without a `reset` is simply skipped.
    pub fn reset_all(&self) {
        for ty in self.types.values() {
            if let Some(reset) = ty.reset {
                debug!("server: running reset for {}", ty.name);
                reset();
            }
        }
    }

    /// Periodic-tick hook: runs every registered type's optional `notify`.
    pub fn notify_all(&self) {
        for ty in self.types.values() {
            if let Some(notify) = ty.notify {
                notify();
            }
        }
    }
}

/// The concrete type of one configuration field's value once resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Str(String),
    Bool(bool),
    IntList(Vec<i64>),
    StrList(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Str,
    Bool,
    IntList,
    StrList,
}

/// One named, typed, optionally defaulted field in a schema.
#[derive(Debug, Clone)]
pub struct ConfigField {
    pub name: &'static str,
    pub ty: FieldType,
    pub default: Option<ConfigValue>,
}

impl ConfigField {
    pub fn required(name: &'static str, ty: FieldType) -> Self {
        ConfigField { name, ty, default: None }
    }

    pub fn with_default(name: &'static str, ty: FieldType, default: ConfigValue) -> Self {
        ConfigField { name, ty, default: Some(default) }
    }
}

/// A declared set of fields an application's server type expects in its
/// instance configuration, resolved from a `serde_json::Value` object.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    pub fields: Vec<ConfigField>,
}

impl ConfigSchema {
    pub fn new(fields: Vec<ConfigField>) -> Self {
        ConfigSchema { fields }
    }

    /// Resolves `value` (must be a JSON object) into a field-name → typed
    /// value map, applying defaults for absent optional fields and failing
    /// with `Error::Configuration` (field path included) on a missing
    /// required field or a type mismatch.
    pub fn instantiate(&self, value: &serde_json::Value) -> Result<HashMap<String, ConfigValue>> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::configuration("<root>", "expected a JSON object"))?;

        let mut out = HashMap::with_capacity(self.fields.len());
        for field in &self.fields {
            let resolved = match obj.get(field.name) {
                Some(raw) => parse_field(field, raw)?,
                None => field
                    .default
                    .clone()
                    .ok_or_else(|| Error::configuration(field.name, "missing required field"))?,
            };
            out.insert(field.name.to_owned(), resolved);
        }

        for key in obj.keys() {
            if !self.fields.iter().any(|f| f.name == key) {
                warn!("config: ignoring unknown field {}", key);
            }
        }

        Ok(out)
    }
}

fn parse_field(field: &ConfigField, raw: &serde_json::Value) -> Result<ConfigValue> {
    match field.ty {
        FieldType::Int => raw
            .as_i64()
            .map(ConfigValue::Int)
            .ok_or_else(|| Error::configuration(field.name, "expected an integer")),
        FieldType::Str => raw
            .as_str()
            .map(|s| ConfigValue::Str(s.to_owned()))
            .ok_or_else(|| Error::configuration(field.name, "expected a string")),
        FieldType::Bool => raw
            .as_bool()
            .map(ConfigValue::Bool)
            .ok_or_else(|| Error::configuration(field.name, "expected a boolean")),
        FieldType::IntList => raw
            .as_array()
            .ok_or_else(|| Error::configuration(field.name, "expected a list"))?
            .iter()
            .map(|v| v.as_i64().ok_or_else(|| Error::configuration(field.name, "expected a list of integers")))
            .collect::<Result<Vec<_>>>()
            .map(ConfigValue::IntList),
        FieldType::StrList => raw
            .as_array()
            .ok_or_else(|| Error::configuration(field.name, "expected a list"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| Error::configuration(field.name, "expected a list of strings"))
            })
            .collect::<Result<Vec<_>>>()
            .map(ConfigValue::StrList),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ConfigSchema {
        ConfigSchema::new(vec![
            ConfigField::required("name", FieldType::Str),
            ConfigField::with_default("max-clients", FieldType::Int, ConfigValue::Int(100)),
            ConfigField::with_default("verbose", FieldType::Bool, ConfigValue::Bool(false)),
        ])
    }

    #[test]
    fn instantiate_applies_defaults_for_absent_fields() {
        let resolved = schema().instantiate(&json!({"name": "chat"})).unwrap();
        assert_eq!(resolved["name"], ConfigValue::Str("chat".into()));
        assert_eq!(resolved["max-clients"], ConfigValue::Int(100));
        assert_eq!(resolved["verbose"], ConfigValue::Bool(false));
    }

    #[test]
    fn instantiate_overrides_defaults_when_present() {
        let resolved = schema().instantiate(&json!({"name": "chat", "max-clients": 5})).unwrap();
        assert_eq!(resolved["max-clients"], ConfigValue::Int(5));
    }

    #[test]
    fn instantiate_fails_on_missing_required_field() {
        assert!(schema().instantiate(&json!({"max-clients": 5})).is_err());
    }

    #[test]
    fn instantiate_fails_on_type_mismatch() {
        assert!(schema().instantiate(&json!({"name": "chat", "max-clients": "lots"})).is_err());
    }

    #[test]
    fn registry_looks_up_by_name() {
        fn connect(_cfg: &PortConfig, _sock: &mut Socket) -> Result<()> {
            Ok(())
        }
        let mut reg = ServerRegistry::new();
        reg.register(ServerType {
            name: "http".into(),
            detect_proto: None,
            connect_socket: connect,
            reset: None,
            notify: None,
        });
        assert!(reg.get("http").is_some());
        assert!(reg.get("missing").is_none());
    }
}
