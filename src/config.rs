//! Access configuration and environment overrides

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Permissions used when a config does not name any
pub const DEFAULT_CHMOD: &str = "rw";

/// Options of one access. Unset options inherit from the parent access
/// (for composite children) or fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Diagnostic label
    pub name: Option<String>,
    /// Contains `r` to read and `w` to write
    pub chmod: Option<String>,
    pub disable_async: Option<bool>,
    pub disable_write_locks: Option<bool>,
    pub verbose: Option<bool>,
    /// Per-child overrides, keyed by child name
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, AccessConfig>,
}

impl AccessConfig {
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn read_only() -> Self {
        Self {
            chmod: Some("r".to_string()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_disable_async(mut self, value: bool) -> Self {
        self.disable_async = Some(value);
        self
    }

    pub fn with_disable_write_locks(mut self, value: bool) -> Self {
        self.disable_write_locks = Some(value);
        self
    }

    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = Some(value);
        self
    }

    pub fn with_child(mut self, name: impl Into<String>, config: AccessConfig) -> Self {
        self.children.insert(name.into(), config);
        self
    }

    pub fn name_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(default)
    }

    pub fn chmod(&self) -> &str {
        self.chmod.as_deref().unwrap_or(DEFAULT_CHMOD)
    }

    pub fn can_read(&self) -> bool {
        self.chmod().contains('r')
    }

    pub fn can_write(&self) -> bool {
        self.chmod().contains('w')
    }

    pub fn is_async_disabled(&self) -> bool {
        self.disable_async.unwrap_or(false)
    }

    pub fn are_write_locks_disabled(&self) -> bool {
        self.disable_write_locks.unwrap_or(false)
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.unwrap_or(false)
    }

    /// Config of a child: its own overrides on top of this config
    pub fn child(&self, name: &str) -> AccessConfig {
        let own = self.children.get(name).cloned().unwrap_or_default();
        AccessConfig {
            name: own.name.or_else(|| Some(name.to_string())),
            chmod: own.chmod.or_else(|| self.chmod.clone()),
            disable_async: own.disable_async.or(self.disable_async),
            disable_write_locks: own.disable_write_locks.or(self.disable_write_locks),
            verbose: own.verbose.or(self.verbose),
            children: own.children,
        }
    }
}

/// Accepts `1/0`, `true/false`, `yes/no`, `on/off`
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Operational escape hatches read from the environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub verbose: Option<bool>,
    pub disable_async: Option<bool>,
    pub disable_write_locks: Option<bool>,
    pub skip_reading: Option<bool>,
    pub skip_writing: Option<bool>,
}

impl EnvOverrides {
    pub const VERBOSE: &'static str = "IDX_VERBOSE_DISKACCESS";
    pub const DISABLE_ASYNC: &'static str = "IDX_DISABLE_ASYNC";
    pub const DISABLE_WRITE_LOCK: &'static str = "IDX_DISABLE_WRITE_LOCK";
    pub const SKIP_READING: &'static str = "IDX_SKIP_READING";
    pub const SKIP_WRITING: &'static str = "IDX_SKIP_WRITING";

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| -> Option<bool> {
            let value = lookup(key)?;
            let parsed = parse_bool(&value);
            if parsed.is_none() {
                tracing::warn!(key, value = %value, "ignoring non-boolean environment override");
            }
            parsed
        };
        Self {
            verbose: read(Self::VERBOSE),
            disable_async: read(Self::DISABLE_ASYNC),
            disable_write_locks: read(Self::DISABLE_WRITE_LOCK),
            skip_reading: read(Self::SKIP_READING),
            skip_writing: read(Self::SKIP_WRITING),
        }
    }
}

/// Effective disk access options after layering env over config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAccessSettings {
    pub name: String,
    pub can_read: bool,
    pub can_write: bool,
    pub verbose: bool,
    pub disable_async: bool,
    pub disable_write_locks: bool,
    pub skip_reading: bool,
    pub skip_writing: bool,
}

impl DiskAccessSettings {
    pub fn resolve(config: &AccessConfig, env: &EnvOverrides) -> Self {
        Self {
            name: config.name_or("DiskAccess").to_string(),
            can_read: config.can_read(),
            can_write: config.can_write(),
            verbose: config.is_verbose() || env.verbose.unwrap_or(false),
            disable_async: env.disable_async.unwrap_or(config.is_async_disabled()),
            disable_write_locks: env
                .disable_write_locks
                .unwrap_or(config.are_write_locks_disabled()),
            skip_reading: env.skip_reading.unwrap_or(false),
            skip_writing: env.skip_writing.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_config_json_and_children() {
        let config = AccessConfig::from_json(
            r#"{"name":"root","chmod":"r","disable_async":true,
                "children":{"b":{"chmod":"rw","verbose":true}}}"#,
        )
        .unwrap();
        assert!(config.can_read());
        assert!(!config.can_write());

        let a = config.child("a");
        assert_eq!(a.name.as_deref(), Some("a"));
        assert_eq!(a.chmod(), "r");
        assert!(a.is_async_disabled());

        let b = config.child("b");
        assert!(b.can_write());
        assert!(b.is_verbose());
        assert!(b.is_async_disabled());

        assert_eq!(AccessConfig::default().chmod(), DEFAULT_CHMOD);
    }

    #[test]
    fn test_env_layering() {
        let vars: HashMap<&str, &str> = [
            (EnvOverrides::DISABLE_ASYNC, "0"),
            (EnvOverrides::SKIP_WRITING, "true"),
            (EnvOverrides::VERBOSE, "garbage"),
        ]
        .into_iter()
        .collect();
        let env = EnvOverrides::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(env.verbose, None);

        let config = AccessConfig::default()
            .with_disable_async(true)
            .with_disable_write_locks(true);
        let settings = DiskAccessSettings::resolve(&config, &env);
        assert!(!settings.disable_async);
        assert!(settings.disable_write_locks);
        assert!(settings.skip_writing);
        assert!(!settings.skip_reading);
        assert_eq!(settings.name, "DiskAccess");
    }
}
