//! `serve` invocation: typed configuration and the argument vector.
//!
//! Model
//! - `<binary> serve <model> --dtype .. --max-model-len .. --host ..
//!   --enable-auto-tool-choice --tool-call-parser .. --gpu-memory-utilization ..
//!   --data-parallel-size ..` in exactly that order.
//! - `--enable-auto-tool-choice` is a bare switch; `--port` is appended last and
//!   only when configured.
//!
//! Code cross-refs: `EnvSet`, `LaunchPlan`

use crate::env::EnvSet;
use crate::launch::LaunchPlan;
use serde::Serialize;
use std::fmt;

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Flags passed to the serving binary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServeConfig {
    pub binary: String,
    pub model: String,
    pub dtype: String,
    pub max_model_len: u32,
    pub host: String,
    pub port: Option<u16>,
    pub enable_auto_tool_choice: bool,
    pub tool_call_parser: String,
    /// Fraction of device memory the server may claim, in (0, 1].
    pub gpu_memory_utilization: f64,
    pub data_parallel_size: u32,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            binary: "vllm".to_string(),
            model: "Qwen/Qwen3-8B".to_string(),
            dtype: "auto".to_string(),
            max_model_len: 32768,
            host: "0.0.0.0".to_string(),
            port: None,
            enable_auto_tool_choice: true,
            tool_call_parser: "hermes".to_string(),
            gpu_memory_utilization: 0.9,
            data_parallel_size: 8,
        }
    }
}

impl ServeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binary.trim().is_empty() {
            return Err(ConfigError::invalid("binary", "must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::invalid("model", "must not be empty"));
        }
        if self.max_model_len == 0 {
            return Err(ConfigError::invalid("max_model_len", "must be >= 1"));
        }
        let g = self.gpu_memory_utilization;
        if !(g.is_finite() && g > 0.0 && g <= 1.0) {
            return Err(ConfigError::invalid(
                "gpu_memory_utilization",
                format!("{g} is outside (0, 1]"),
            ));
        }
        if self.data_parallel_size == 0 {
            return Err(ConfigError::invalid("data_parallel_size", "must be >= 1"));
        }
        Ok(())
    }

    /// Argument vector after the binary name, starting with the `serve` subcommand.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "serve".to_string(),
            self.model.clone(),
            "--dtype".to_string(),
            self.dtype.clone(),
            "--max-model-len".to_string(),
            self.max_model_len.to_string(),
            "--host".to_string(),
            self.host.clone(),
        ];
        if self.enable_auto_tool_choice {
            args.push("--enable-auto-tool-choice".to_string());
        }
        args.extend([
            "--tool-call-parser".to_string(),
            self.tool_call_parser.clone(),
            "--gpu-memory-utilization".to_string(),
            self.gpu_memory_utilization.to_string(),
            "--data-parallel-size".to_string(),
            self.data_parallel_size.to_string(),
        ]);
        if let Some(port) = self.port {
            args.push("--port".to_string());
            args.push(port.to_string());
        }
        args
    }

    /// Validate, then pair the argument vector with `env`.
    pub fn plan(&self, env: EnvSet) -> Result<LaunchPlan, ConfigError> {
        self.validate()?;
        Ok(LaunchPlan::new(self.binary.clone(), self.args(), env))
    }
}
