mod action;
mod file;
mod filter;
mod rule;
mod scope;

pub use action::{Action, ResponseBody};
pub use file::{RuleFileError, load_rules, parse_rules};
pub use filter::{Filter, StringOperation, StringSelector};
pub use rule::{Rule, RuleEngine, RuleSet};
pub use scope::{FilterScope, ScopeTracker};
