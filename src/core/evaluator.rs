//! Selector and rule evaluation.
//!
//! Items are evaluated in ascending `sort` order with ties broken by id; the
//! first enabled item whose conditions hold wins and evaluation stops there.
//! Cache snapshots keep selector and rule lists in that order already, so the
//! hot path walks the slice without allocating.
use std::cmp::Ordering;

use crate::core::{
    cache::CacheSnapshot,
    condition::ConditionMatcher,
    model::{Condition, MatchMode, Rule, Selector, SelectorType},
    request::RequestView,
};

/// Common shape of selectors and rules as far as matching is concerned.
pub trait Evaluable {
    fn id(&self) -> &str;
    fn sort(&self) -> i32;
    fn enabled(&self) -> bool;
    fn match_mode(&self) -> MatchMode;
    fn conditions(&self) -> &[Condition];
    /// Full-flow items match without looking at their conditions.
    fn is_full_flow(&self) -> bool {
        false
    }
}

impl Evaluable for Selector {
    fn id(&self) -> &str {
        &self.id
    }
    fn sort(&self) -> i32 {
        self.sort
    }
    fn enabled(&self) -> bool {
        self.enabled
    }
    fn match_mode(&self) -> MatchMode {
        self.match_mode
    }
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
    fn is_full_flow(&self) -> bool {
        self.selector_type == SelectorType::FullFlow
    }
}

impl Evaluable for Rule {
    fn id(&self) -> &str {
        &self.id
    }
    fn sort(&self) -> i32 {
        self.sort
    }
    fn enabled(&self) -> bool {
        self.enabled
    }
    fn match_mode(&self) -> MatchMode {
        self.match_mode
    }
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

/// Deterministic evaluation order: `sort` ascending, then id.
pub fn evaluation_order<T: Evaluable>(a: &T, b: &T) -> Ordering {
    a.sort().cmp(&b.sort()).then_with(|| a.id().cmp(b.id()))
}

/// Aggregate a condition list under a match mode.
pub fn conditions_match(
    mode: MatchMode,
    conditions: &[Condition],
    request: &dyn RequestView,
) -> bool {
    match mode {
        MatchMode::And => conditions
            .iter()
            .all(|c| ConditionMatcher::matches(c, request)),
        MatchMode::Or => conditions
            .iter()
            .any(|c| ConditionMatcher::matches(c, request)),
    }
}

/// Whether a single item matches, ignoring its position.
pub fn item_matches<T: Evaluable>(item: &T, request: &dyn RequestView) -> bool {
    item.enabled()
        && (item.is_full_flow() || conditions_match(item.match_mode(), item.conditions(), request))
}

fn is_ordered<T: Evaluable>(items: &[T]) -> bool {
    items
        .windows(2)
        .all(|pair| evaluation_order(&pair[0], &pair[1]) != Ordering::Greater)
}

/// References to `items` in evaluation order.
pub fn in_evaluation_order<T: Evaluable>(items: &[T]) -> Vec<&T> {
    let mut ordered: Vec<&T> = items.iter().collect();
    if !is_ordered(items) {
        ordered.sort_by(|a, b| evaluation_order(*a, *b));
    }
    ordered
}

/// First item in evaluation order that matches the request.
pub fn first_match<'a, T: Evaluable>(items: &'a [T], request: &dyn RequestView) -> Option<&'a T> {
    if is_ordered(items) {
        items.iter().find(|item| item_matches(*item, request))
    } else {
        in_evaluation_order(items)
            .into_iter()
            .find(|item| item_matches(*item, request))
    }
}

pub struct SelectorEvaluator;

impl SelectorEvaluator {
    pub fn evaluate<'a>(selectors: &'a [Selector], request: &dyn RequestView) -> Option<&'a Selector> {
        first_match(selectors, request)
    }
}

pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn evaluate<'a>(rules: &'a [Rule], request: &dyn RequestView) -> Option<&'a Rule> {
        first_match(rules, request)
    }
}

/// A matched selector together with the rule chosen inside it.
#[derive(Debug, Clone, Copy)]
pub struct RouteMatch<'a> {
    pub selector: &'a Selector,
    pub rule: &'a Rule,
}

/// Resolves `(selector, rule)` pairs for a plugin from a cache snapshot.
pub struct RouteMatcher;

impl RouteMatcher {
    /// First-match-wins resolution: the first matching selector is taken and
    /// its first matching rule returned. A selector without a matching rule
    /// yields `None`; later selectors are not consulted.
    pub fn first<'a>(
        snapshot: &'a CacheSnapshot,
        plugin: &str,
        request: &dyn RequestView,
    ) -> Option<RouteMatch<'a>> {
        let selector = SelectorEvaluator::evaluate(snapshot.selectors(plugin), request)?;
        Self::within(snapshot, plugin, selector, request)
    }

    /// The first matching rule of an already matched selector.
    pub fn within<'a>(
        snapshot: &'a CacheSnapshot,
        plugin: &str,
        selector: &'a Selector,
        request: &dyn RequestView,
    ) -> Option<RouteMatch<'a>> {
        trace_selector(plugin, selector, request);
        let rule = RuleEvaluator::evaluate(snapshot.rules(&selector.id), request)?;
        trace_rule(plugin, selector, rule, request);
        Some(RouteMatch { selector, rule })
    }

    /// Every selector match in order, continuing past a matched selector only
    /// while it is flagged `continued`.
    pub fn all<'a>(
        snapshot: &'a CacheSnapshot,
        plugin: &str,
        request: &dyn RequestView,
    ) -> Vec<RouteMatch<'a>> {
        let mut matches = Vec::new();
        for selector in in_evaluation_order(snapshot.selectors(plugin)) {
            if !item_matches(selector, request) {
                continue;
            }
            trace_selector(plugin, selector, request);
            if let Some(rule) = RuleEvaluator::evaluate(snapshot.rules(&selector.id), request) {
                trace_rule(plugin, selector, rule, request);
                matches.push(RouteMatch { selector, rule });
            }
            if !selector.continued {
                break;
            }
        }
        matches
    }
}

fn trace_selector(plugin: &str, selector: &Selector, request: &dyn RequestView) {
    if selector.logged {
        tracing::info!(
            plugin,
            selector.id = %selector.id,
            selector.name = %selector.name,
            http.path = request.path(),
            "Selector matched"
        );
    }
}

fn trace_rule(plugin: &str, selector: &Selector, rule: &Rule, request: &dyn RequestView) {
    if rule.logged {
        tracing::info!(
            plugin,
            selector.id = %selector.id,
            rule.id = %rule.id,
            rule.name = %rule.name,
            http.path = request.path(),
            "Rule matched"
        );
    } else {
        tracing::trace!(plugin, rule.id = %rule.id, "Rule matched");
    }
}
