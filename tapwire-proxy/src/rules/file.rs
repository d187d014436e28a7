use std::path::{Path, PathBuf};

use serde::Deserialize;
use tapwire_net::TlsVersion;
use thiserror::Error;

use super::action::{Action, ResponseBody};
use super::filter::{Filter, StringOperation, StringSelector};
use super::rule::{Rule, RuleSet};
use super::scope::FilterScope;
use crate::breakpoint::BreakPointLocation;

/// Every problem found in a rule document. A document with any error
/// yields no rules at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid rule file: {}", errors.join("; "))]
pub struct RuleFileError {
    pub errors: Vec<String>,
}

impl RuleFileError {
    fn single(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDocument {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
    name: Option<String>,
    #[serde(default)]
    order: i32,
    filter: Option<FilterSpec>,
    action: Option<ActionSpec>,
    #[serde(default)]
    actions: Vec<ActionSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum FilterSpec {
    Any,
    Host(SelectorSpec),
    Path(SelectorSpec),
    Method {
        method: String,
    },
    RequestHeader(HeaderFilterSpec),
    ResponseHeader(HeaderFilterSpec),
    StatusCode {
        min: u16,
        max: Option<u16>,
    },
    IsSecure,
    Port {
        port: u16,
    },
    IsWebSocket,
    HasTag {
        tag: String,
    },
    AllOf {
        filters: Vec<FilterSpec>,
    },
    AnyOf {
        filters: Vec<FilterSpec>,
    },
    Not {
        filter: Box<FilterSpec>,
    },
}

#[derive(Debug, Deserialize)]
struct SelectorSpec {
    pattern: String,
    #[serde(default)]
    operation: StringOperation,
    #[serde(default)]
    case_sensitive: bool,
}

#[derive(Debug, Deserialize)]
struct HeaderFilterSpec {
    name: String,
    value: Option<String>,
    #[serde(default)]
    operation: StringOperation,
    #[serde(default)]
    case_sensitive: bool,
}

#[derive(Debug, Deserialize)]
struct HeaderSpec {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ActionSpec {
    AddRequestHeader {
        name: String,
        value: String,
    },
    UpdateRequestHeader {
        name: String,
        value: String,
        #[serde(default)]
        add_if_missing: bool,
    },
    DeleteRequestHeader {
        name: String,
    },
    AddResponseHeader {
        name: String,
        value: String,
    },
    UpdateResponseHeader {
        name: String,
        value: String,
        #[serde(default)]
        add_if_missing: bool,
    },
    DeleteResponseHeader {
        name: String,
    },
    ChangeRequestMethod {
        method: String,
    },
    ChangeRequestPath {
        path: String,
    },
    #[serde(rename = "force-http11")]
    ForceHttp11,
    ForceTlsVersion {
        version: String,
    },
    ForceProxyTlsVersion {
        version: String,
    },
    SpoofDns {
        host: Option<String>,
        port: Option<u16>,
    },
    SkipRemoteCertificateValidation,
    BlindMode,
    ForceNewConnection,
    FullResponse {
        status: u16,
        #[serde(default)]
        headers: Vec<HeaderSpec>,
        body: Option<String>,
        body_file: Option<PathBuf>,
    },
    SetClientCertificate {
        cert_file: PathBuf,
        key_file: PathBuf,
    },
    #[serde(rename = "breakpoint")]
    BreakPoint {
        #[serde(default)]
        skip: Vec<BreakPointLocation>,
    },
    Abort,
    ApplyTag {
        tag: String,
        run_scope: Option<FilterScope>,
    },
    ApplyComment {
        comment: String,
        run_scope: Option<FilterScope>,
    },
}

pub fn load_rules(path: impl AsRef<Path>) -> Result<RuleSet, RuleFileError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|err| RuleFileError::single(format!("{}: {err}", path.display())))?;
    parse_rules(&content)
}

pub fn parse_rules(content: &str) -> Result<RuleSet, RuleFileError> {
    let document: RuleDocument =
        toml::from_str(content).map_err(|err| RuleFileError::single(err.to_string()))?;

    let mut errors = Vec::new();
    let mut rules = Vec::new();
    for (index, spec) in document.rules.into_iter().enumerate() {
        let label = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("rule #{}", index + 1));
        let mut report = |message: String| errors.push(format!("{label}: {message}"));

        let filter = match spec.filter {
            Some(filter) => match build_filter(filter) {
                Ok(filter) => Some(filter),
                Err(message) => {
                    report(message);
                    None
                }
            },
            None => Some(Filter::Any),
        };

        let specs: Vec<ActionSpec> = spec.action.into_iter().chain(spec.actions).collect();
        if specs.is_empty() {
            report("no action given".to_string());
        }
        let mut actions = Vec::new();
        for action in specs {
            match build_action(action) {
                Ok(action) => actions.push(action),
                Err(message) => report(message),
            }
        }

        let Some(filter) = filter else {
            continue;
        };
        for action in actions {
            let rule = Rule::new(label.clone(), filter.clone(), action).with_order(spec.order);
            if !rule.in_scope() {
                report(format!(
                    "filter \"{}\" is only known at {} but action {} runs at {}",
                    rule.filter.friendly_name(),
                    rule.filter.scope(),
                    rule.action.name(),
                    rule.action.scope()
                ));
                continue;
            }
            rules.push(rule);
        }
    }

    if errors.is_empty() {
        Ok(RuleSet::new(rules))
    } else {
        Err(RuleFileError { errors })
    }
}

fn build_filter(spec: FilterSpec) -> Result<Filter, String> {
    Ok(match spec {
        FilterSpec::Any => Filter::Any,
        FilterSpec::Host(selector) => Filter::Host(build_selector(selector)?),
        FilterSpec::Path(selector) => Filter::Path(build_selector(selector)?),
        FilterSpec::Method { method } => Filter::Method(method),
        FilterSpec::RequestHeader(header) => {
            let (name, value) = build_header_filter(header)?;
            Filter::RequestHeader { name, value }
        }
        FilterSpec::ResponseHeader(header) => {
            let (name, value) = build_header_filter(header)?;
            Filter::ResponseHeader { name, value }
        }
        FilterSpec::StatusCode { min, max } => {
            let max = max.unwrap_or(min);
            if min > max {
                return Err(format!("status range {min}-{max} is empty"));
            }
            Filter::StatusCode { min, max }
        }
        FilterSpec::IsSecure => Filter::IsSecure,
        FilterSpec::Port { port } => Filter::Port(port),
        FilterSpec::IsWebSocket => Filter::IsWebSocket,
        FilterSpec::HasTag { tag } => Filter::HasTag(tag),
        FilterSpec::AllOf { filters } => Filter::AllOf(build_filters(filters)?),
        FilterSpec::AnyOf { filters } => Filter::AnyOf(build_filters(filters)?),
        FilterSpec::Not { filter } => Filter::Not(Box::new(build_filter(*filter)?)),
    })
}

fn build_filters(specs: Vec<FilterSpec>) -> Result<Vec<Filter>, String> {
    specs.into_iter().map(build_filter).collect()
}

fn build_selector(spec: SelectorSpec) -> Result<StringSelector, String> {
    StringSelector::new(spec.pattern, spec.operation, spec.case_sensitive)
        .map_err(|err| format!("invalid pattern: {err}"))
}

fn build_header_filter(spec: HeaderFilterSpec) -> Result<(String, Option<StringSelector>), String> {
    let value = match spec.value {
        Some(pattern) => Some(build_selector(SelectorSpec {
            pattern,
            operation: spec.operation,
            case_sensitive: spec.case_sensitive,
        })?),
        None => None,
    };
    Ok((spec.name, value))
}

fn build_action(spec: ActionSpec) -> Result<Action, String> {
    Ok(match spec {
        ActionSpec::AddRequestHeader { name, value } => Action::AddRequestHeader { name, value },
        ActionSpec::UpdateRequestHeader {
            name,
            value,
            add_if_missing,
        } => Action::UpdateRequestHeader {
            name,
            value,
            add_if_missing,
        },
        ActionSpec::DeleteRequestHeader { name } => Action::DeleteRequestHeader { name },
        ActionSpec::AddResponseHeader { name, value } => Action::AddResponseHeader { name, value },
        ActionSpec::UpdateResponseHeader {
            name,
            value,
            add_if_missing,
        } => Action::UpdateResponseHeader {
            name,
            value,
            add_if_missing,
        },
        ActionSpec::DeleteResponseHeader { name } => Action::DeleteResponseHeader { name },
        ActionSpec::ChangeRequestMethod { method } => Action::ChangeRequestMethod(method),
        ActionSpec::ChangeRequestPath { path } => {
            if !path.starts_with('/') {
                return Err(format!("path {path:?} must start with '/'"));
            }
            Action::ChangeRequestPath(path)
        }
        ActionSpec::ForceHttp11 => Action::ForceHttp11,
        ActionSpec::ForceTlsVersion { version } => Action::ForceTlsVersion(tls_version(&version)?),
        ActionSpec::ForceProxyTlsVersion { version } => {
            Action::ForceProxyTlsVersion(tls_version(&version)?)
        }
        ActionSpec::SpoofDns { host, port } => {
            if host.is_none() && port.is_none() {
                return Err("spoof-dns needs a host or a port".to_string());
            }
            Action::SpoofDns { host, port }
        }
        ActionSpec::SkipRemoteCertificateValidation => Action::SkipRemoteCertificateValidation,
        ActionSpec::BlindMode => Action::BlindMode,
        ActionSpec::ForceNewConnection => Action::ForceNewConnection,
        ActionSpec::FullResponse {
            status,
            headers,
            body,
            body_file,
        } => {
            if !(100..=999).contains(&status) {
                return Err(format!("status {status} is out of range"));
            }
            let body = match (body, body_file) {
                (Some(_), Some(_)) => {
                    return Err("full-response takes body or body_file, not both".to_string());
                }
                (Some(text), None) => ResponseBody::Text(text),
                (None, Some(path)) => ResponseBody::File(path),
                (None, None) => ResponseBody::Empty,
            };
            Action::FullResponse {
                status,
                headers: headers
                    .into_iter()
                    .map(|header| (header.name, header.value))
                    .collect(),
                body,
            }
        }
        ActionSpec::SetClientCertificate {
            cert_file,
            key_file,
        } => Action::SetClientCertificate {
            cert_file,
            key_file,
        },
        ActionSpec::BreakPoint { skip } => Action::BreakPoint { skip },
        ActionSpec::Abort => Action::Abort,
        ActionSpec::ApplyTag { tag, run_scope } => {
            check_run_scope(run_scope)?;
            Action::ApplyTag { tag, run_scope }
        }
        ActionSpec::ApplyComment { comment, run_scope } => {
            check_run_scope(run_scope)?;
            Action::ApplyComment { comment, run_scope }
        }
    })
}

fn tls_version(value: &str) -> Result<TlsVersion, String> {
    value
        .parse::<TlsVersion>()
        .map_err(|err| format!("invalid tls version {value:?}: {err}"))
}

fn check_run_scope(scope: Option<FilterScope>) -> Result<(), String> {
    match scope {
        Some(scope) if !scope.is_live() => Err(format!("run_scope {scope} is never reached")),
        _ => Ok(()),
    }
}
