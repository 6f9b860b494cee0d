//! Environment edits applied to image configs.

use indexmap::IndexMap;

/// A single edit of the config environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvModifier {
    /// Overwrite (or introduce) a variable.
    Set { name: String, value: String },
    /// Concatenate after the existing value.
    Append { name: String, value: String },
    /// Concatenate before the existing value.
    Prepend { name: String, value: String },
}

impl EnvModifier {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn append(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Append {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn prepend(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Prepend {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Image env as an insertion-ordered map. Keys keep the position they were
/// first seen at, so serializing back is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEnvs(IndexMap<String, String>);

impl ParsedEnvs {
    /// Parses `KEY=value` entries. An entry without `=` is a key with an
    /// empty value; a repeated key keeps its first position and last value.
    pub fn parse(env: &[String]) -> Self {
        let mut map = IndexMap::with_capacity(env.len());
        for entry in env {
            let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            map.insert(key.to_string(), value.to_string());
        }
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn apply(&mut self, modifier: &EnvModifier) {
        match modifier {
            EnvModifier::Set { name, value } => {
                self.0.insert(name.clone(), value.clone());
            }
            EnvModifier::Append { name, value } => {
                self.0
                    .entry(name.clone())
                    .and_modify(|v| v.push_str(value))
                    .or_insert_with(|| value.clone());
            }
            EnvModifier::Prepend { name, value } => {
                self.0
                    .entry(name.clone())
                    .and_modify(|v| v.insert_str(0, value))
                    .or_insert_with(|| value.clone());
            }
        }
    }

    pub fn to_env(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}
