use std::path::PathBuf;

use bytes::Bytes;
use tapwire_net::{HeaderList, LeafCertificate, ResponseHead, TlsVersion, TlsVersionRange};

use super::scope::FilterScope;
use crate::breakpoint::{BreakPointLocation, BreakPointManager};
use crate::context::{ExchangeContext, HeaderAlteration, PreMadeResponse};
use crate::error::ActionError;
use crate::exchange::{Connection, Exchange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Empty,
    Text(String),
    File(PathBuf),
}

/// Mutation applied when a rule's filter matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    AddRequestHeader {
        name: String,
        value: String,
    },
    UpdateRequestHeader {
        name: String,
        value: String,
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
        add_if_missing: bool,
    },
    DeleteResponseHeader {
        name: String,
    },
    ChangeRequestMethod(String),
    ChangeRequestPath(String),
    ForceHttp11,
    ForceTlsVersion(TlsVersion),
    ForceProxyTlsVersion(TlsVersion),
    SpoofDns {
        host: Option<String>,
        port: Option<u16>,
    },
    SkipRemoteCertificateValidation,
    BlindMode,
    ForceNewConnection,
    FullResponse {
        status: u16,
        headers: Vec<(String, String)>,
        body: ResponseBody,
    },
    SetClientCertificate {
        cert_file: PathBuf,
        key_file: PathBuf,
    },
    BreakPoint {
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

impl Action {
    pub fn scope(&self) -> FilterScope {
        match self {
            Action::BlindMode | Action::ForceProxyTlsVersion(_) => FilterScope::OnAuthorityReceived,
            Action::AddRequestHeader { .. }
            | Action::UpdateRequestHeader { .. }
            | Action::DeleteRequestHeader { .. }
            | Action::ChangeRequestMethod(_)
            | Action::ChangeRequestPath(_)
            | Action::ForceHttp11
            | Action::ForceTlsVersion(_)
            | Action::SpoofDns { .. }
            | Action::SkipRemoteCertificateValidation
            | Action::ForceNewConnection
            | Action::FullResponse { .. }
            | Action::SetClientCertificate { .. }
            | Action::BreakPoint { .. }
            | Action::Abort => FilterScope::RequestHeaderReceivedFromClient,
            Action::AddResponseHeader { .. }
            | Action::UpdateResponseHeader { .. }
            | Action::DeleteResponseHeader { .. } => FilterScope::ResponseHeaderReceivedFromRemote,
            Action::ApplyTag { run_scope, .. } | Action::ApplyComment { run_scope, .. } => {
                run_scope.unwrap_or(FilterScope::ResponseBodyReceivedFromRemote)
            }
        }
    }

    /// Whether the action runs when the orchestrator reaches `scope`. Tags
    /// and comments run at every live scope unless pinned to one.
    pub fn runs_at(&self, scope: FilterScope) -> bool {
        match self {
            Action::ApplyTag { run_scope, .. } | Action::ApplyComment { run_scope, .. } => {
                match run_scope {
                    Some(run_scope) => *run_scope == scope,
                    None => scope.is_live(),
                }
            }
            _ => self.scope() == scope,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::AddRequestHeader { .. } => "add-request-header",
            Action::UpdateRequestHeader { .. } => "update-request-header",
            Action::DeleteRequestHeader { .. } => "delete-request-header",
            Action::AddResponseHeader { .. } => "add-response-header",
            Action::UpdateResponseHeader { .. } => "update-response-header",
            Action::DeleteResponseHeader { .. } => "delete-response-header",
            Action::ChangeRequestMethod(_) => "change-request-method",
            Action::ChangeRequestPath(_) => "change-request-path",
            Action::ForceHttp11 => "force-http11",
            Action::ForceTlsVersion(_) => "force-tls-version",
            Action::ForceProxyTlsVersion(_) => "force-proxy-tls-version",
            Action::SpoofDns { .. } => "spoof-dns",
            Action::SkipRemoteCertificateValidation => "skip-remote-certificate-validation",
            Action::BlindMode => "blind-mode",
            Action::ForceNewConnection => "force-new-connection",
            Action::FullResponse { .. } => "full-response",
            Action::SetClientCertificate { .. } => "set-client-certificate",
            Action::BreakPoint { .. } => "breakpoint",
            Action::Abort => "abort",
            Action::ApplyTag { .. } => "apply-tag",
            Action::ApplyComment { .. } => "apply-comment",
        }
    }

    pub fn alter(
        &self,
        context: &mut ExchangeContext,
        exchange: Option<&mut Exchange>,
        _connection: Option<&Connection>,
        scope: FilterScope,
        breakpoints: &BreakPointManager,
    ) -> Result<(), ActionError> {
        match self {
            Action::AddRequestHeader { name, value } => {
                context.request_header_alterations.push(HeaderAlteration::Add {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
            Action::UpdateRequestHeader {
                name,
                value,
                add_if_missing,
            } => {
                context.request_header_alterations.push(HeaderAlteration::Replace {
                    name: name.clone(),
                    value: value.clone(),
                    add_if_missing: *add_if_missing,
                });
            }
            Action::DeleteRequestHeader { name } => {
                context
                    .request_header_alterations
                    .push(HeaderAlteration::Delete { name: name.clone() });
            }
            Action::AddResponseHeader { name, value } => {
                context.response_header_alterations.push(HeaderAlteration::Add {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
            Action::UpdateResponseHeader {
                name,
                value,
                add_if_missing,
            } => {
                context.response_header_alterations.push(HeaderAlteration::Replace {
                    name: name.clone(),
                    value: value.clone(),
                    add_if_missing: *add_if_missing,
                });
            }
            Action::DeleteResponseHeader { name } => {
                context
                    .response_header_alterations
                    .push(HeaderAlteration::Delete { name: name.clone() });
            }
            Action::ChangeRequestMethod(method) => {
                let exchange = require(exchange, self)?;
                exchange.request.head.line.method = method.to_ascii_uppercase();
            }
            Action::ChangeRequestPath(path) => {
                let exchange = require(exchange, self)?;
                if !path.starts_with('/') {
                    return Err(ActionError::Invalid(format!("path {path:?} must start with '/'")));
                }
                exchange.request.head.line.target = path.clone();
            }
            Action::ForceHttp11 => context.alpn = Some(vec!["http/1.1".to_string()]),
            Action::ForceTlsVersion(version) => {
                context.ssl_protocols = TlsVersionRange::exactly(*version);
            }
            Action::ForceProxyTlsVersion(version) => {
                context.proxy_tls_protocols = TlsVersionRange::exactly(*version);
            }
            Action::SpoofDns { host, port } => {
                if host.is_some() {
                    context.remote_host_override = host.clone();
                }
                if port.is_some() {
                    context.remote_port_override = *port;
                }
            }
            Action::SkipRemoteCertificateValidation => {
                context.skip_remote_certificate_validation = true;
            }
            Action::BlindMode => context.blind_mode = true,
            Action::ForceNewConnection => context.force_new_connection = true,
            Action::FullResponse {
                status,
                headers,
                body,
            } => {
                context.pre_made_response = Some(build_response(*status, headers, body)?);
            }
            Action::SetClientCertificate {
                cert_file,
                key_file,
            } => {
                let cert_pem = read_file(cert_file)?;
                let key_pem = read_file(key_file)?;
                context
                    .client_certificates
                    .push(LeafCertificate { cert_pem, key_pem });
            }
            Action::BreakPoint { skip } => {
                let exchange = require(exchange, self)?;
                context.breakpoint = Some(breakpoints.get_or_create(exchange.id, scope, skip));
            }
            Action::Abort => context.abort = true,
            Action::ApplyTag { tag, .. } => {
                if let Some(exchange) = exchange {
                    exchange.add_tag(tag);
                }
            }
            Action::ApplyComment { comment, .. } => {
                if let Some(exchange) = exchange {
                    exchange.comment = Some(comment.clone());
                }
            }
        }
        Ok(())
    }
}

fn require<'a>(exchange: Option<&'a mut Exchange>, action: &Action) -> Result<&'a mut Exchange, ActionError> {
    exchange.ok_or(ActionError::MissingExchange {
        action: action.name(),
    })
}

fn read_file(path: &PathBuf) -> Result<Vec<u8>, ActionError> {
    std::fs::read(path).map_err(|source| ActionError::File {
        path: path.display().to_string(),
        source,
    })
}

fn build_response(
    status: u16,
    headers: &[(String, String)],
    body: &ResponseBody,
) -> Result<PreMadeResponse, ActionError> {
    let body = match body {
        ResponseBody::Empty => Bytes::new(),
        ResponseBody::Text(text) => Bytes::from(text.clone()),
        ResponseBody::File(path) => Bytes::from(read_file(path)?),
    };
    let mut head = ResponseHead::new(status, "");
    for (name, value) in headers {
        head.append_header(name, value);
    }
    head.remove_header("transfer-encoding");
    head.set_header("Content-Length", &body.len().to_string());
    Ok(PreMadeResponse { head, body })
}
