//! Routing configuration records.
//!
//! These types map one-to-one onto the payloads pushed by the configuration store
//! (JSON, camelCase field names). Enum fields accept either their symbolic name
//! (any case) or the numeric code used by older store writers, so that
//! `"matchMode": 0`, `"matchMode": "and"` and `"matchMode": "AND"` all decode to
//! [`MatchMode::And`].
//!
//! Records are owned by a cache snapshot and never mutated once published.
use std::fmt;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

fn default_true() -> bool {
    true
}

/// Wire representation shared by the enums below.
#[derive(Deserialize)]
#[serde(untagged)]
enum CodeOrName {
    Code(i64),
    Name(String),
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

/// Coarse execution tier of a plugin. Tiers run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "CodeOrName", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginRole {
    Before,
    Function,
    Last,
}

impl TryFrom<CodeOrName> for PluginRole {
    type Error = String;

    fn try_from(value: CodeOrName) -> Result<Self, Self::Error> {
        match value {
            CodeOrName::Code(0) => Ok(Self::Before),
            CodeOrName::Code(1) => Ok(Self::Function),
            CodeOrName::Code(2) => Ok(Self::Last),
            CodeOrName::Name(name) => match normalize(&name).as_str() {
                "before" => Ok(Self::Before),
                "function" => Ok(Self::Function),
                "last" => Ok(Self::Last),
                other => Err(format!("unknown plugin role '{other}'")),
            },
            CodeOrName::Code(code) => Err(format!("unknown plugin role code {code}")),
        }
    }
}

impl fmt::Display for PluginRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Before => "BEFORE",
            Self::Function => "FUNCTION",
            Self::Last => "LAST",
        };
        f.write_str(name)
    }
}

/// How a condition list is aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "CodeOrName", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchMode {
    /// Every condition must hold. An empty list holds vacuously.
    #[default]
    And,
    /// At least one condition must hold. An empty list never holds.
    Or,
}

impl TryFrom<CodeOrName> for MatchMode {
    type Error = String;

    fn try_from(value: CodeOrName) -> Result<Self, Self::Error> {
        match value {
            CodeOrName::Code(0) => Ok(Self::And),
            CodeOrName::Code(1) => Ok(Self::Or),
            CodeOrName::Name(name) => match normalize(&name).as_str() {
                "and" => Ok(Self::And),
                "or" => Ok(Self::Or),
                other => Err(format!("unknown match mode '{other}'")),
            },
            CodeOrName::Code(code) => Err(format!("unknown match mode code {code}")),
        }
    }
}

/// Whether a selector evaluates its conditions or matches all traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "CodeOrName", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectorType {
    FullFlow,
    #[default]
    Condition,
}

impl TryFrom<CodeOrName> for SelectorType {
    type Error = String;

    fn try_from(value: CodeOrName) -> Result<Self, Self::Error> {
        match value {
            CodeOrName::Code(0) => Ok(Self::FullFlow),
            CodeOrName::Code(1) => Ok(Self::Condition),
            CodeOrName::Name(name) => match normalize(&name).as_str() {
                "full_flow" | "fullflow" => Ok(Self::FullFlow),
                "condition" | "custom" | "custom_flow" => Ok(Self::Condition),
                other => Err(format!("unknown selector type '{other}'")),
            },
            CodeOrName::Code(code) => Err(format!("unknown selector type code {code}")),
        }
    }
}

/// Comparison applied between a request attribute and `param_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Operator {
    Eq,
    Ne,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    /// Path pattern: `*` matches inside one segment, `**` across segments.
    PathPattern,
    /// Inclusive numeric range written as `"lo,hi"`.
    Range,
    Gt,
    Lt,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Contains => "like",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Regex => "regex",
            Self::PathPattern => "match",
            Self::Range => "range",
            Self::Gt => ">",
            Self::Lt => "<",
        }
    }

    /// Operators whose `param_value` is compiled into a [`Regex`].
    pub fn uses_pattern(&self) -> bool {
        matches!(self, Self::Regex | Self::PathPattern)
    }
}

impl TryFrom<String> for Operator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match normalize(&value).as_str() {
            "=" | "==" | "eq" | "equals" => Ok(Self::Eq),
            "!=" | "<>" | "ne" | "not_equals" => Ok(Self::Ne),
            "like" | "contains" => Ok(Self::Contains),
            "starts_with" | "startswith" | "prefix" => Ok(Self::StartsWith),
            "ends_with" | "endswith" | "suffix" => Ok(Self::EndsWith),
            "regex" | "regexp" => Ok(Self::Regex),
            "match" => Ok(Self::PathPattern),
            "range" | "between" => Ok(Self::Range),
            ">" | "gt" => Ok(Self::Gt),
            "<" | "lt" => Ok(Self::Lt),
            other => Err(format!("unknown operator '{other}'")),
        }
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Which part of the request a condition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum ParamType {
    /// Form field or top-level field of a flat JSON body.
    Post,
    Query,
    Header,
    Cookie,
    Host,
    Ip,
    /// Path plus query string.
    Uri,
    Path,
    Method,
}

impl TryFrom<String> for ParamType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match normalize(&value).as_str() {
            "post" | "body" | "form" => Ok(Self::Post),
            "query" => Ok(Self::Query),
            "header" => Ok(Self::Header),
            "cookie" => Ok(Self::Cookie),
            "host" | "domain" => Ok(Self::Host),
            "ip" => Ok(Self::Ip),
            "uri" => Ok(Self::Uri),
            "path" => Ok(Self::Path),
            "method" => Ok(Self::Method),
            other => Err(format!("unknown param type '{other}'")),
        }
    }
}

/// A single predicate over one request attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub operator: Operator,
    pub param_type: ParamType,
    #[serde(default)]
    pub param_name: String,
    #[serde(default)]
    pub param_value: String,
    /// Compiled form of `param_value` for pattern operators, built on first use.
    #[serde(skip)]
    pub(crate) compiled: OnceCell<Option<Regex>>,
}

impl Condition {
    pub fn new(
        param_type: ParamType,
        param_name: impl Into<String>,
        operator: Operator,
        param_value: impl Into<String>,
    ) -> Self {
        Self {
            operator,
            param_type,
            param_name: param_name.into(),
            param_value: param_value.into(),
            compiled: OnceCell::new(),
        }
    }
}

/// Plugin record as stored in the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub enabled: bool,
    /// Informational; the registered implementation declares the tier it runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<PluginRole>,
}

impl PluginData {
    pub fn new(id: impl Into<String>, name: impl Into<String>, enabled: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled,
            role: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub plugin_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default, alias = "type")]
    pub selector_type: SelectorType,
    #[serde(default)]
    pub sort: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, alias = "loged")]
    pub logged: bool,
    /// When false, a match on this selector ends selector evaluation for the plugin.
    #[serde(default = "default_true")]
    pub continued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Value>,
    #[serde(default, alias = "conditionList")]
    pub conditions: Vec<Condition>,
}

impl Selector {
    /// An enabled, condition-typed AND selector with no conditions.
    pub fn new(id: impl Into<String>, plugin_name: impl Into<String>, sort: i32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            plugin_name: plugin_name.into(),
            match_mode: MatchMode::And,
            selector_type: SelectorType::Condition,
            sort,
            enabled: true,
            logged: false,
            continued: true,
            handle: None,
            conditions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub selector_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub sort: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, alias = "loged")]
    pub logged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Value>,
    #[serde(default, alias = "conditionList")]
    pub conditions: Vec<Condition>,
}

impl Rule {
    /// An enabled AND rule with no conditions and no handle.
    pub fn new(id: impl Into<String>, selector_id: impl Into<String>, sort: i32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            selector_id: selector_id.into(),
            match_mode: MatchMode::And,
            sort,
            enabled: true,
            logged: false,
            handle: None,
            conditions: Vec::new(),
        }
    }
}

/// Credentials of an application allowed to call signed routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAuth {
    #[serde(default)]
    pub app_key: String,
    pub app_secret: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A complete routing configuration, as produced by a full store load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDump {
    #[serde(default)]
    pub plugins: Vec<PluginData>,
    #[serde(default)]
    pub selectors: Vec<Selector>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub app_auths: Vec<AppAuth>,
}
