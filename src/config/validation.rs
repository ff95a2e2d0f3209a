use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use crate::{
    config::models::{GatewayConfig, StoreConfig},
    core::{
        condition::{parse_range, path_pattern_to_regex},
        model::{AppAuth, Condition, ConfigDump, Operator, PluginData, Rule, Selector},
    },
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid reference: {message}")]
    DanglingReference { message: String },

    #[error("Duplicate id: {message}")]
    Duplicate { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Format multiple validation errors into a single message
fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
    if errors.len() == 1 {
        return errors[0].to_string();
    }

    let mut message = format!("Found {} validation errors:\n", errors.len());
    for (i, error) in errors.iter().enumerate() {
        message.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    message
}

fn collect(errors: Vec<ValidationError>) -> ValidationResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::ValidationFailed {
            message: format_multiple_errors(errors),
        })
    }
}

/// Gateway (process) configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        match &config.store {
            StoreConfig::File { path } if path.trim().is_empty() => {
                errors.push(ValidationError::MissingField {
                    field: "store.path".to_string(),
                });
            }
            StoreConfig::Http { url, poll_interval } => {
                if let Err(e) = url::Url::parse(url) {
                    errors.push(ValidationError::InvalidField {
                        field: "store.url".to_string(),
                        message: e.to_string(),
                    });
                }
                if let Err(e) = Self::validate_duration("store.poll_interval", poll_interval) {
                    errors.push(e);
                }
            }
            _ => {}
        }

        if config.sync.workers == 0 {
            errors.push(ValidationError::InvalidField {
                field: "sync.workers".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.sync.queue_capacity == 0 {
            errors.push(ValidationError::InvalidField {
                field: "sync.queue_capacity".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if let Err(e) =
            Self::validate_duration("upstream.default_timeout", &config.upstream.default_timeout)
        {
            errors.push(e);
        }
        if let Err(e) = Self::validate_duration("plugins.sign.max_skew", &config.plugins.sign.max_skew)
        {
            errors.push(e);
        }

        collect(errors)
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_duration(field: &str, value: &str) -> ValidationResult<()> {
        match humantime::parse_duration(value) {
            Ok(d) if d.is_zero() => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "Must be greater than zero".to_string(),
            }),
            Ok(_) => Ok(()),
            Err(e) => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("Invalid duration '{value}': {e}"),
            }),
        }
    }
}

/// Routing data validator. Single-entity checks are used by the synchronizer
/// before an upsert reaches the cache; `validate` also checks references
/// across a whole dump.
pub struct ConfigDumpValidator;

impl ConfigDumpValidator {
    pub fn validate(dump: &ConfigDump) -> ValidationResult<()> {
        let mut errors = Vec::new();

        let mut plugin_names = HashSet::new();
        for plugin in &dump.plugins {
            errors.extend(Self::validate_plugin(plugin).err());
            if !plugin_names.insert(plugin.name.as_str()) {
                errors.push(ValidationError::Duplicate {
                    message: format!("plugin '{}'", plugin.name),
                });
            }
        }

        let mut selector_plugins: HashMap<&str, &str> = HashMap::new();
        for selector in &dump.selectors {
            errors.extend(Self::validate_selector(selector).err());
            if selector_plugins
                .insert(selector.id.as_str(), selector.plugin_name.as_str())
                .is_some()
            {
                errors.push(ValidationError::Duplicate {
                    message: format!("selector '{}'", selector.id),
                });
            }
            if !plugin_names.contains(selector.plugin_name.as_str()) {
                errors.push(ValidationError::DanglingReference {
                    message: format!(
                        "selector '{}' references unknown plugin '{}'",
                        selector.id, selector.plugin_name
                    ),
                });
            }
        }

        let mut rule_ids = HashSet::new();
        for rule in &dump.rules {
            errors.extend(Self::validate_rule(rule).err());
            if !rule_ids.insert(rule.id.as_str()) {
                errors.push(ValidationError::Duplicate {
                    message: format!("rule '{}'", rule.id),
                });
            }
            if !selector_plugins.contains_key(rule.selector_id.as_str()) {
                errors.push(ValidationError::DanglingReference {
                    message: format!(
                        "rule '{}' references unknown selector '{}'",
                        rule.id, rule.selector_id
                    ),
                });
            }
        }

        let mut app_keys = HashSet::new();
        for auth in &dump.app_auths {
            errors.extend(Self::validate_app_auth(auth).err());
            if !app_keys.insert(auth.app_key.as_str()) {
                errors.push(ValidationError::Duplicate {
                    message: format!("app key '{}'", auth.app_key),
                });
            }
        }

        collect(errors)
    }

    pub fn validate_plugin(plugin: &PluginData) -> ValidationResult<()> {
        require("plugin.name", &plugin.name)
    }

    pub fn validate_selector(selector: &Selector) -> ValidationResult<()> {
        require("selector.id", &selector.id)?;
        require("selector.pluginName", &selector.plugin_name)?;
        let mut errors = Vec::new();
        for (i, condition) in selector.conditions.iter().enumerate() {
            if let Err(e) =
                Self::validate_condition(&format!("selector '{}' condition {}", selector.id, i + 1), condition)
            {
                errors.push(e);
            }
        }
        collect(errors)
    }

    pub fn validate_rule(rule: &Rule) -> ValidationResult<()> {
        require("rule.id", &rule.id)?;
        require("rule.selectorId", &rule.selector_id)?;
        let mut errors = Vec::new();
        for (i, condition) in rule.conditions.iter().enumerate() {
            if let Err(e) =
                Self::validate_condition(&format!("rule '{}' condition {}", rule.id, i + 1), condition)
            {
                errors.push(e);
            }
        }
        collect(errors)
    }

    pub fn validate_app_auth(auth: &AppAuth) -> ValidationResult<()> {
        require("auth.appKey", &auth.app_key)?;
        require("auth.appSecret", &auth.app_secret)
    }

    fn validate_condition(field: &str, condition: &Condition) -> ValidationResult<()> {
        match condition.operator {
            Operator::Regex => regex::Regex::new(&condition.param_value)
                .map(|_| ())
                .map_err(|e| ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("Invalid regex '{}': {e}", condition.param_value),
                }),
            Operator::PathPattern => {
                regex::Regex::new(&path_pattern_to_regex(&condition.param_value))
                    .map(|_| ())
                    .map_err(|e| ValidationError::InvalidField {
                        field: field.to_string(),
                        message: format!("Invalid path pattern '{}': {e}", condition.param_value),
                    })
            }
            Operator::Range if parse_range(&condition.param_value).is_none() => {
                Err(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!(
                        "Range must be 'lo,hi' with lo <= hi, got '{}'",
                        condition.param_value
                    ),
                })
            }
            _ => Ok(()),
        }
    }
}

fn require(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField {
            field: field.to_string(),
        })
    } else {
        Ok(())
    }
}
