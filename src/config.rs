//! Monitor configuration.

use std::{
    collections::HashMap,
    fmt::Display,
    str::FromStr,
};

use thiserror::Error;

/// Raw key/value configuration, as handed over by the host application.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl RawConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner.insert(key.into(), value.into())
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, falling back to `default`
    /// when the field is missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Return a comma separed list of values. Return empty vector if field is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(','))
            .filter(|item| !item.is_empty())
            .map(|item| parse(item.trim(), config_name))
            .collect()
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

/// Typed configuration of the file-integrity monitor.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    /// Roots of the monitored subtrees, as absolute paths.
    pub monitored_paths: Vec<String>,
    /// Whether events below the immediate children of a root are
    /// processed.
    pub recursive: bool,
}

impl TryFrom<&RawConfig> for MonitorConfig {
    type Error = ConfigError;

    fn try_from(config: &RawConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            monitored_paths: config.get_list("monitored_paths")?,
            recursive: config.with_default("recursive", false)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let raw = RawConfig::default();
        let config = MonitorConfig::try_from(&raw).unwrap();
        assert!(config.monitored_paths.is_empty());
        assert!(!config.recursive);
    }

    #[test]
    fn parses_paths_and_recursion() {
        let mut raw = RawConfig::default();
        raw.insert("monitored_paths", "/etc, /usr/bin");
        raw.insert("recursive", "true");
        let config = MonitorConfig::try_from(&raw).unwrap();
        assert_eq!(config.monitored_paths, vec!["/etc", "/usr/bin"]);
        assert!(config.recursive);
    }

    #[test]
    fn rejects_bad_recursive_flag() {
        let mut raw = RawConfig::default();
        raw.insert("recursive", "maybe");
        let err = MonitorConfig::try_from(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "recursive"));
    }

    #[test]
    fn required_field_missing() {
        let raw = RawConfig::default();
        let err = raw.required::<String>("monitored_paths").unwrap_err();
        assert!(matches!(err, ConfigError::RequiredValue { field } if field == "monitored_paths"));
    }
}
