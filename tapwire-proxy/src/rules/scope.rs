use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Points of an exchange's life where rules are evaluated, in the order the
/// orchestrator reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterScope {
    OnAuthorityReceived,
    RequestHeaderReceivedFromClient,
    RequestBodyReceivedFromClient,
    ResponseHeaderReceivedFromRemote,
    ResponseBodyReceivedFromRemote,
    /// Never reached by live traffic.
    OutOfScope,
}

impl FilterScope {
    pub const LIVE: [FilterScope; 5] = [
        FilterScope::OnAuthorityReceived,
        FilterScope::RequestHeaderReceivedFromClient,
        FilterScope::RequestBodyReceivedFromClient,
        FilterScope::ResponseHeaderReceivedFromRemote,
        FilterScope::ResponseBodyReceivedFromRemote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterScope::OnAuthorityReceived => "on-authority-received",
            FilterScope::RequestHeaderReceivedFromClient => "request-header-received-from-client",
            FilterScope::RequestBodyReceivedFromClient => "request-body-received-from-client",
            FilterScope::ResponseHeaderReceivedFromRemote => "response-header-received-from-remote",
            FilterScope::ResponseBodyReceivedFromRemote => "response-body-received-from-remote",
            FilterScope::OutOfScope => "out-of-scope",
        }
    }

    pub fn is_live(self) -> bool {
        self != FilterScope::OutOfScope
    }
}

impl fmt::Display for FilterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enforces that each scope is passed at most once, in increasing order.
#[derive(Debug, Clone, Default)]
pub struct ScopeTracker {
    last: Option<FilterScope>,
}

impl ScopeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker for exchanges whose authority pass already ran at tunnel level.
    pub fn after(scope: FilterScope) -> Self {
        Self { last: Some(scope) }
    }

    pub fn last(&self) -> Option<FilterScope> {
        self.last
    }

    pub fn advance(&mut self, scope: FilterScope) -> Result<(), ProxyError> {
        if !scope.is_live() {
            return Err(ProxyError::Runtime(format!("{scope} is not a live scope")));
        }
        if let Some(last) = self.last {
            if scope <= last {
                return Err(ProxyError::Runtime(format!(
                    "scope {scope} reached after {last}"
                )));
            }
        }
        self.last = Some(scope);
        Ok(())
    }
}
