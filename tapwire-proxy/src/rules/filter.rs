use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tapwire_net::HeaderList;

use super::scope::FilterScope;
use crate::exchange::{Authority, Connection, Exchange};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StringOperation {
    #[default]
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    Wildcard,
    Regex,
}

/// Text predicate shared by the string-valued filters.
#[derive(Debug, Clone)]
pub struct StringSelector {
    pattern: String,
    operation: StringOperation,
    case_sensitive: bool,
    regex: Option<Regex>,
}

impl StringSelector {
    pub fn new(
        pattern: impl Into<String>,
        operation: StringOperation,
        case_sensitive: bool,
    ) -> Result<Self, regex::Error> {
        let pattern = pattern.into();
        let regex = match operation {
            StringOperation::Regex => Some(
                RegexBuilder::new(&pattern)
                    .case_insensitive(!case_sensitive)
                    .build()?,
            ),
            _ => None,
        };
        Ok(Self {
            pattern,
            operation,
            case_sensitive,
            regex,
        })
    }

    pub fn exact(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            operation: StringOperation::Exact,
            case_sensitive: false,
            regex: None,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, value: &str) -> bool {
        if let Some(regex) = &self.regex {
            return regex.is_match(value);
        }
        let (pattern, value) = if self.case_sensitive {
            (self.pattern.clone(), value.to_string())
        } else {
            (self.pattern.to_lowercase(), value.to_lowercase())
        };
        match self.operation {
            StringOperation::Exact => value == pattern,
            StringOperation::Contains => value.contains(&pattern),
            StringOperation::StartsWith => value.starts_with(&pattern),
            StringOperation::EndsWith => value.ends_with(&pattern),
            StringOperation::Wildcard => wildcard_match(&pattern, &value),
            StringOperation::Regex => false,
        }
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    let mut parts = pattern.split('*');
    let prefix = parts.next().unwrap_or("");
    if !value.starts_with(prefix) {
        return false;
    }
    let mut pos = prefix.len();

    let rest: Vec<&str> = parts.collect();
    let Some((last, middle)) = rest.split_last() else {
        return value.len() == pos;
    };
    for part in middle {
        if part.is_empty() {
            continue;
        }
        match value[pos..].find(part) {
            Some(index) => pos += index + part.len(),
            None => return false,
        }
    }
    value.len() >= pos + last.len() && value.ends_with(last)
}

/// Predicate over an exchange and the state known so far.
#[derive(Debug, Clone)]
pub enum Filter {
    Any,
    Host(StringSelector),
    Path(StringSelector),
    Method(String),
    RequestHeader {
        name: String,
        value: Option<StringSelector>,
    },
    ResponseHeader {
        name: String,
        value: Option<StringSelector>,
    },
    StatusCode {
        min: u16,
        max: u16,
    },
    IsSecure,
    Port(u16),
    IsWebSocket,
    HasTag(String),
    AllOf(Vec<Filter>),
    AnyOf(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Earliest scope at which the filter has everything it reads.
    pub fn scope(&self) -> FilterScope {
        match self {
            Filter::Any | Filter::Host(_) | Filter::IsSecure | Filter::Port(_) => {
                FilterScope::OnAuthorityReceived
            }
            Filter::Path(_)
            | Filter::Method(_)
            | Filter::RequestHeader { .. }
            | Filter::IsWebSocket
            | Filter::HasTag(_) => FilterScope::RequestHeaderReceivedFromClient,
            Filter::ResponseHeader { .. } | Filter::StatusCode { .. } => {
                FilterScope::ResponseHeaderReceivedFromRemote
            }
            Filter::AllOf(children) | Filter::AnyOf(children) => children
                .iter()
                .map(Filter::scope)
                .max()
                .unwrap_or(FilterScope::OnAuthorityReceived),
            Filter::Not(child) => child.scope(),
        }
    }

    pub fn apply(
        &self,
        authority: &Authority,
        exchange: Option<&Exchange>,
        connection: Option<&Connection>,
    ) -> bool {
        match self {
            Filter::Any => true,
            Filter::Host(selector) => selector.is_match(&authority.host),
            Filter::IsSecure => authority.secure,
            Filter::Port(port) => authority.port == *port,
            Filter::Path(selector) => {
                exchange.is_some_and(|exchange| selector.is_match(&exchange.request.head.line.target))
            }
            Filter::Method(method) => exchange
                .is_some_and(|exchange| exchange.request.head.method().eq_ignore_ascii_case(method)),
            Filter::RequestHeader { name, value } => exchange.is_some_and(|exchange| {
                header_matches(exchange.request.head.headers_named(name), value.as_ref())
            }),
            Filter::ResponseHeader { name, value } => exchange
                .and_then(|exchange| exchange.response.head.as_ref())
                .is_some_and(|head| header_matches(head.headers_named(name), value.as_ref())),
            Filter::StatusCode { min, max } => exchange
                .and_then(|exchange| exchange.response.head.as_ref())
                .is_some_and(|head| (*min..=*max).contains(&head.status_code())),
            Filter::IsWebSocket => exchange.is_some_and(Exchange::is_websocket),
            Filter::HasTag(tag) => {
                exchange.is_some_and(|exchange| exchange.tags.iter().any(|item| item == tag))
            }
            Filter::AllOf(children) => children
                .iter()
                .all(|child| child.apply(authority, exchange, connection)),
            Filter::AnyOf(children) => children
                .iter()
                .any(|child| child.apply(authority, exchange, connection)),
            Filter::Not(child) => !child.apply(authority, exchange, connection),
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            Filter::Any => "any",
            Filter::Host(_) => "host",
            Filter::Path(_) => "path",
            Filter::Method(_) => "method",
            Filter::RequestHeader { .. } => "req-header",
            Filter::ResponseHeader { .. } => "res-header",
            Filter::StatusCode { .. } => "status",
            Filter::IsSecure => "secure",
            Filter::Port(_) => "port",
            Filter::IsWebSocket => "websocket",
            Filter::HasTag(_) => "tag",
            Filter::AllOf(_) => "all",
            Filter::AnyOf(_) => "any-of",
            Filter::Not(_) => "not",
        }
    }

    pub fn friendly_name(&self) -> String {
        match self {
            Filter::Any => "all exchanges".to_string(),
            Filter::Host(selector) => format!("host {}", selector.pattern()),
            Filter::Path(selector) => format!("path {}", selector.pattern()),
            Filter::Method(method) => format!("method {method}"),
            Filter::RequestHeader { name, value } => match value {
                Some(value) => format!("request header {name}: {}", value.pattern()),
                None => format!("request header {name} present"),
            },
            Filter::ResponseHeader { name, value } => match value {
                Some(value) => format!("response header {name}: {}", value.pattern()),
                None => format!("response header {name} present"),
            },
            Filter::StatusCode { min, max } if min == max => format!("status {min}"),
            Filter::StatusCode { min, max } => format!("status {min}-{max}"),
            Filter::IsSecure => "secure exchanges".to_string(),
            Filter::Port(port) => format!("port {port}"),
            Filter::IsWebSocket => "websocket exchanges".to_string(),
            Filter::HasTag(tag) => format!("tagged {tag}"),
            Filter::AllOf(children) => join_names(children, " and "),
            Filter::AnyOf(children) => join_names(children, " or "),
            Filter::Not(child) => format!("not ({})", child.friendly_name()),
        }
    }
}

fn header_matches<'a>(
    mut headers: impl Iterator<Item = &'a tapwire_net::Header>,
    value: Option<&StringSelector>,
) -> bool {
    match value {
        None => headers.next().is_some(),
        Some(selector) => headers.any(|header| selector.is_match(&header.value)),
    }
}

fn join_names(children: &[Filter], separator: &str) -> String {
    let names: Vec<String> = children.iter().map(Filter::friendly_name).collect();
    format!("({})", names.join(separator))
}
