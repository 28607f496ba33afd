//! Environment prepared for the serving process.
//!
//! Purpose
//! - Hold the small, ordered set of variables the server expects (model cache,
//!   download mirror, NCCL flags) and put them on the child `Command`.
//! - The parent process environment is never touched; only the spawned child
//!   sees these values.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::process::Command;

/// Model and tokenizer cache root.
pub const HF_HOME: &str = "HF_HOME";
/// Base URL of the alternate model download source.
pub const HF_ENDPOINT: &str = "HF_ENDPOINT";
/// NCCL log verbosity.
pub const NCCL_DEBUG: &str = "NCCL_DEBUG";
/// NCCL host-pinned memory pooling toggle (0/1).
pub const NCCL_CUMEM_HOST_ENABLE: &str = "NCCL_CUMEM_HOST_ENABLE";

pub const DEFAULT_HF_HOME: &str = "/root/.cache/huggingface";
pub const DEFAULT_HF_ENDPOINT: &str = "https://hf-mirror.com";
pub const DEFAULT_NCCL_DEBUG: &str = "INFO";
pub const DEFAULT_NCCL_CUMEM_HOST_ENABLE: &str = "0";

/// Ordered name → value mapping applied to the child process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvSet {
    vars: Vec<(String, String)>,
}

impl Default for EnvSet {
    fn default() -> Self {
        Self::empty()
            .with(HF_HOME, DEFAULT_HF_HOME)
            .with(HF_ENDPOINT, DEFAULT_HF_ENDPOINT)
            .with(NCCL_DEBUG, DEFAULT_NCCL_DEBUG)
            .with(NCCL_CUMEM_HOST_ENABLE, DEFAULT_NCCL_CUMEM_HOST_ENABLE)
    }
}

impl EnvSet {
    pub fn empty() -> Self {
        Self { vars: Vec::new() }
    }

    /// Builder form of [`EnvSet::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Override `name` in place, or append it when absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.vars.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Put every pair on `cmd`; the rest of the child environment is inherited.
    pub fn apply(&self, cmd: &mut Command) {
        for (name, value) in self.iter() {
            cmd.env(name, value);
        }
    }
}

// Serialized as a JSON object in insertion order.
impl Serialize for EnvSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.vars.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_hold_the_four_literals_in_order() {
        let env = EnvSet::default();
        let pairs: Vec<_> = env.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("HF_HOME", "/root/.cache/huggingface"),
                ("HF_ENDPOINT", "https://hf-mirror.com"),
                ("NCCL_DEBUG", "INFO"),
                ("NCCL_CUMEM_HOST_ENABLE", "0"),
            ]
        );
    }

    #[test]
    fn set_replaces_in_place_and_appends_new_names() {
        let mut env = EnvSet::default();
        env.set(NCCL_DEBUG, "WARN");
        env.set("CUDA_VISIBLE_DEVICES", "0,1");
        assert_eq!(env.len(), 5);
        assert_eq!(env.get(NCCL_DEBUG), Some("WARN"));
        let names: Vec<_> = env.iter().map(|(n, _)| n).collect();
        assert_eq!(names[2], NCCL_DEBUG);
        assert_eq!(names[4], "CUDA_VISIBLE_DEVICES");
    }

    #[test]
    fn apply_targets_the_child_only() {
        let env = EnvSet::empty().with("SERVEKIT_ENV_APPLY_PROBE", "1");
        let mut cmd = Command::new("true");
        env.apply(&mut cmd);
        let on_child: Vec<_> = cmd.get_envs().collect();
        assert_eq!(on_child.len(), 1);
        assert_eq!(on_child[0].0, "SERVEKIT_ENV_APPLY_PROBE");
        assert!(std::env::var_os("SERVEKIT_ENV_APPLY_PROBE").is_none());
    }

    #[test]
    fn serializes_as_object() {
        let env = EnvSet::empty().with("A", "1").with("B", "2");
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, r#"{"A":"1","B":"2"}"#);
    }

    #[test]
    fn repeated_preparation_is_identical() {
        assert_eq!(EnvSet::default(), EnvSet::default());
    }
}
