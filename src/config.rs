use serde::Deserialize;
use std::path::Path;

use crate::sandbox::{CallerContext, SandboxState};

/// Environment variable the C exports read the policy path from.
pub const CONFIG_ENV_VAR: &str = "STDLIB_SANDBOX_CONFIG";

/// Policy file used by the CLI when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/sandbox.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub guest: GuestConfig,
    #[serde(default)]
    pub sandbox: SandboxState,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuestConfig {
    /// Label of the interpreter instance, e.g. "lua-5.4.6"
    #[serde(default = "default_guest_name")]
    pub name: String,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            name: default_guest_name(),
        }
    }
}

fn default_guest_name() -> String {
    "guest".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${SANDBOX_OUT_DIR}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    pub fn caller_context(&self) -> CallerContext {
        CallerContext::new(self.guest.name.clone())
    }

    /// Human-readable one-line summary of the policy
    pub fn policy_description(&self) -> String {
        let writes = match self.sandbox.max_write_bytes {
            Some(limit) => format!("writes ≤ {limit} bytes"),
            None => "writes unlimited".to_string(),
        };
        let targets = match &self.sandbox.allowed_write_targets {
            Some(rules) if rules.is_empty() => "no targets".to_string(),
            Some(rules) => rules
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            None => "any target".to_string(),
        };
        let commands = if self.sandbox.allowed_command_patterns.is_empty() {
            "no commands".to_string()
        } else {
            self.sandbox
                .allowed_command_patterns
                .iter()
                .map(|p| format!("{:?}", p.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!("{writes} to {targets}; commands: {commands}")
    }
}
