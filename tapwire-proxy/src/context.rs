use std::sync::Arc;

use bytes::Bytes;
use tapwire_net::{HeaderList, LeafCertificate, ResponseHead, TlsVersionRange};

use crate::breakpoint::BreakPointContext;
use crate::exchange::Authority;

const PREVIOUS_PLACEHOLDER: &str = "{{previous}}";

/// Header edit queued by an action and applied by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAlteration {
    Add {
        name: String,
        value: String,
    },
    /// `{{previous}}` in `value` expands to the current value.
    Replace {
        name: String,
        value: String,
        add_if_missing: bool,
    },
    Delete {
        name: String,
    },
}

impl HeaderAlteration {
    pub fn apply<H: HeaderList>(&self, head: &mut H) {
        match self {
            HeaderAlteration::Add { name, value } => head.append_header(name, value),
            HeaderAlteration::Replace {
                name,
                value,
                add_if_missing,
            } => {
                let previous: Vec<String> = head
                    .headers_named(name)
                    .map(|header| header.value.clone())
                    .collect();
                if previous.is_empty() {
                    if *add_if_missing {
                        head.append_header(name, &value.replace(PREVIOUS_PLACEHOLDER, ""));
                    }
                    return;
                }
                let expanded = value.replace(PREVIOUS_PLACEHOLDER, &previous.join(", "));
                head.set_header(name, &expanded);
            }
            HeaderAlteration::Delete { name } => {
                head.remove_header(name);
            }
        }
    }
}

/// Response served without going upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreMadeResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

/// Mutable per-exchange state written by actions and read by the pipeline.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    pub authority: Authority,
    /// Upstream handshake bounds.
    pub ssl_protocols: TlsVersionRange,
    /// Downstream handshake bounds.
    pub proxy_tls_protocols: TlsVersionRange,
    pub alpn: Option<Vec<String>>,
    pub remote_host_override: Option<String>,
    pub remote_port_override: Option<u16>,
    pub client_certificates: Vec<LeafCertificate>,
    pub blind_mode: bool,
    pub skip_remote_certificate_validation: bool,
    pub force_new_connection: bool,
    pub abort: bool,
    pub request_header_alterations: Vec<HeaderAlteration>,
    pub response_header_alterations: Vec<HeaderAlteration>,
    pub request_body_override: Option<Bytes>,
    pub breakpoint: Option<Arc<BreakPointContext>>,
    pub pre_made_response: Option<PreMadeResponse>,
}

impl ExchangeContext {
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            ssl_protocols: TlsVersionRange::default(),
            proxy_tls_protocols: TlsVersionRange::default(),
            alpn: None,
            remote_host_override: None,
            remote_port_override: None,
            client_certificates: Vec::new(),
            blind_mode: false,
            skip_remote_certificate_validation: false,
            force_new_connection: false,
            abort: false,
            request_header_alterations: Vec::new(),
            response_header_alterations: Vec::new(),
            request_body_override: None,
            breakpoint: None,
            pre_made_response: None,
        }
    }

    /// Copy of a tunnel-level context for one exchange inside the tunnel.
    /// Queued per-exchange state does not carry over.
    pub fn for_exchange(&self, authority: Authority) -> Self {
        Self {
            authority,
            request_header_alterations: Vec::new(),
            response_header_alterations: Vec::new(),
            request_body_override: None,
            breakpoint: None,
            pre_made_response: None,
            abort: false,
            ..self.clone()
        }
    }

    pub fn remote_host(&self) -> &str {
        self.remote_host_override
            .as_deref()
            .unwrap_or(&self.authority.host)
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port_override.unwrap_or(self.authority.port)
    }

    /// Applies and clears the queued request alterations, in enqueue order.
    pub fn apply_request_alterations<H: HeaderList>(&mut self, head: &mut H) -> usize {
        apply_all(std::mem::take(&mut self.request_header_alterations), head)
    }

    pub fn apply_response_alterations<H: HeaderList>(&mut self, head: &mut H) -> usize {
        apply_all(std::mem::take(&mut self.response_header_alterations), head)
    }
}

fn apply_all<H: HeaderList>(alterations: Vec<HeaderAlteration>, head: &mut H) -> usize {
    for alteration in &alterations {
        alteration.apply(head);
    }
    alterations.len()
}

#[cfg(test)]
mod tests {
    use tapwire_net::{HeaderList, parse_request_head};

    use super::{ExchangeContext, HeaderAlteration};
    use crate::exchange::Authority;

    fn context() -> ExchangeContext {
        ExchangeContext::new(Authority::new("example.com", 443, true))
    }

    #[test]
    fn replace_expands_previous_value() {
        let mut head = parse_request_head(b"GET / HTTP/1.1\r\nX-Trace: A\r\n").unwrap();
        let mut context = context();
        context.request_header_alterations.push(HeaderAlteration::Replace {
            name: "x-trace".to_string(),
            value: "{{previous}} suffix".to_string(),
            add_if_missing: false,
        });
        assert_eq!(context.apply_request_alterations(&mut head), 1);
        assert_eq!(head.header("X-Trace"), Some("A suffix"));
    }

    #[test]
    fn replace_skips_missing_unless_asked() {
        let mut head = parse_request_head(b"GET / HTTP/1.1\r\n").unwrap();
        HeaderAlteration::Replace {
            name: "X-Missing".to_string(),
            value: "v".to_string(),
            add_if_missing: false,
        }
        .apply(&mut head);
        assert_eq!(head.header("X-Missing"), None);

        HeaderAlteration::Replace {
            name: "X-Missing".to_string(),
            value: "{{previous}}v".to_string(),
            add_if_missing: true,
        }
        .apply(&mut head);
        assert_eq!(head.header("X-Missing"), Some("v"));
    }

    #[test]
    fn alterations_apply_once_in_order() {
        let mut head = parse_request_head(b"GET / HTTP/1.1\r\nCookie: a\r\n").unwrap();
        let mut context = context();
        context.request_header_alterations.extend([
            HeaderAlteration::Delete {
                name: "cookie".to_string(),
            },
            HeaderAlteration::Add {
                name: "Cookie".to_string(),
                value: "b".to_string(),
            },
        ]);
        context.apply_request_alterations(&mut head);
        assert_eq!(context.apply_request_alterations(&mut head), 0);
        let cookies: Vec<&str> = head
            .headers_named("cookie")
            .map(|header| header.value.as_str())
            .collect();
        assert_eq!(cookies, vec!["b"]);
    }

    #[test]
    fn exchange_copy_keeps_connection_flags_only() {
        let mut tunnel = context();
        tunnel.skip_remote_certificate_validation = true;
        tunnel.abort = true;
        tunnel.request_header_alterations.push(HeaderAlteration::Delete {
            name: "a".to_string(),
        });
        let derived = tunnel.for_exchange(Authority::new("example.com", 443, true));
        assert!(derived.skip_remote_certificate_validation);
        assert!(!derived.abort);
        assert!(derived.request_header_alterations.is_empty());
        assert_eq!(derived.remote_host(), "example.com");
        assert_eq!(derived.remote_port(), 443);
    }
}
