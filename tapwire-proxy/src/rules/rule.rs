use std::sync::Arc;

use super::action::Action;
use super::filter::Filter;
use super::scope::FilterScope;
use crate::breakpoint::BreakPointManager;
use crate::context::ExchangeContext;
use crate::error::ActionError;
use crate::exchange::{Connection, Exchange};

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub filter: Filter,
    pub action: Action,
    pub order: i32,
}

impl Rule {
    pub fn new(name: impl Into<String>, filter: Filter, action: Action) -> Self {
        Self {
            name: name.into(),
            filter,
            action,
            order: 0,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// A rule can only fire when its filter is evaluable by the time its
    /// action runs.
    pub fn in_scope(&self) -> bool {
        self.filter.scope() <= self.action.scope()
    }

    /// Returns whether the action ran.
    pub fn enforce(
        &self,
        context: &mut ExchangeContext,
        mut exchange: Option<&mut Exchange>,
        connection: Option<&Connection>,
        scope: FilterScope,
        breakpoints: &BreakPointManager,
    ) -> Result<bool, ActionError> {
        if !self.action.runs_at(scope) || self.filter.scope() > scope {
            return Ok(false);
        }
        let authority = context.authority.clone();
        if !self
            .filter
            .apply(&authority, exchange.as_deref(), connection)
        {
            return Ok(false);
        }
        tracing::debug!(
            rule = %self.name,
            action = self.action.name(),
            %scope,
            "rule matched"
        );
        self.action
            .alter(context, exchange.as_deref_mut(), connection, scope, breakpoints)?;
        Ok(true)
    }
}

/// Rules kept in evaluation order: `order` first, then insertion.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut set = Self { rules };
        set.rules.sort_by_key(|rule| rule.order);
        set
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|rule| rule.order);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

/// Runs a rule set against an exchange at the scopes the orchestrator
/// reaches.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Arc<RuleSet>,
    breakpoints: Arc<BreakPointManager>,
}

impl RuleEngine {
    pub fn new(rules: RuleSet, breakpoints: Arc<BreakPointManager>) -> Self {
        Self {
            rules: Arc::new(rules),
            breakpoints,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn breakpoints(&self) -> &Arc<BreakPointManager> {
        &self.breakpoints
    }

    /// Returns how many actions ran. Stops at the first failing action.
    pub fn enforce(
        &self,
        context: &mut ExchangeContext,
        mut exchange: Option<&mut Exchange>,
        connection: Option<&Connection>,
        scope: FilterScope,
    ) -> Result<usize, ActionError> {
        let mut fired = 0;
        for rule in self.rules.iter() {
            if rule.enforce(
                context,
                exchange.as_deref_mut(),
                connection,
                scope,
                &self.breakpoints,
            )? {
                fired += 1;
            }
        }
        Ok(fired)
    }
}
