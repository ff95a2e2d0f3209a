//! Evaluation of a single [`Condition`] against a [`RequestView`].
//!
//! Matching is total: an unknown attribute, a missing value, an unparsable
//! number or an invalid pattern all evaluate to `false` rather than erroring.
use std::borrow::Cow;

use regex::Regex;

use crate::core::{
    model::{Condition, Operator, ParamType},
    request::RequestView,
};

/// Stateless condition evaluator.
pub struct ConditionMatcher;

impl ConditionMatcher {
    /// Returns true when the request attribute selected by the condition
    /// satisfies its operator.
    pub fn matches(condition: &Condition, request: &dyn RequestView) -> bool {
        match Self::extract(condition, request) {
            Some(actual) => Self::compare(condition, &actual),
            None => false,
        }
    }

    fn extract<'a>(condition: &Condition, request: &'a dyn RequestView) -> Option<Cow<'a, str>> {
        let name = condition.param_name.as_str();
        match condition.param_type {
            ParamType::Post => request.post_param(name).map(Cow::Borrowed),
            ParamType::Query => request.query_param(name).map(Cow::Borrowed),
            ParamType::Header => request.header(name).map(Cow::Borrowed),
            ParamType::Cookie => request.cookie(name).map(Cow::Borrowed),
            ParamType::Host => request.host().map(Cow::Borrowed),
            ParamType::Ip => request.client_ip().map(|ip| Cow::Owned(ip.to_string())),
            ParamType::Uri => Some(Cow::Borrowed(request.uri())),
            ParamType::Path => Some(Cow::Borrowed(request.path())),
            ParamType::Method => Some(Cow::Borrowed(request.method().as_str())),
        }
    }

    fn compare(condition: &Condition, actual: &str) -> bool {
        let expected = condition.param_value.as_str();
        match condition.operator {
            Operator::Eq => actual == expected,
            Operator::Ne => actual != expected,
            Operator::Contains => actual.contains(expected),
            Operator::StartsWith => actual.starts_with(expected),
            Operator::EndsWith => actual.ends_with(expected),
            Operator::Regex | Operator::PathPattern => compiled_pattern(condition)
                .map(|re| re.is_match(actual))
                .unwrap_or(false),
            Operator::Range => match (parse_range(expected), actual.trim().parse::<f64>()) {
                (Some((lo, hi)), Ok(value)) => value >= lo && value <= hi,
                _ => false,
            },
            Operator::Gt => numeric(actual, expected).is_some_and(|(a, e)| a > e),
            Operator::Lt => numeric(actual, expected).is_some_and(|(a, e)| a < e),
        }
    }
}

/// The regex for a pattern operator, compiled once per condition instance.
pub(crate) fn compiled_pattern(condition: &Condition) -> Option<&Regex> {
    condition
        .compiled
        .get_or_init(|| {
            let source = match condition.operator {
                Operator::PathPattern => path_pattern_to_regex(&condition.param_value),
                _ => condition.param_value.clone(),
            };
            match Regex::new(&source) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(
                        pattern = %condition.param_value,
                        error = %e,
                        "Invalid condition pattern; condition will never match"
                    );
                    None
                }
            }
        })
        .as_ref()
}

/// Translate a path pattern (`/api/*/users/**`) into an anchored regex.
pub fn path_pattern_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// Parse `"lo,hi"` into an inclusive numeric range.
pub fn parse_range(value: &str) -> Option<(f64, f64)> {
    let (lo, hi) = value.split_once(',')?;
    let lo = lo.trim().parse::<f64>().ok()?;
    let hi = hi.trim().parse::<f64>().ok()?;
    (lo <= hi).then_some((lo, hi))
}

fn numeric(actual: &str, expected: &str) -> Option<(f64, f64)> {
    Some((
        actual.trim().parse::<f64>().ok()?,
        expected.trim().parse::<f64>().ok()?,
    ))
}
