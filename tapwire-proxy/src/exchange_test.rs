use tapwire_archive::ExchangeState;
use tapwire_net::{HeaderList, HttpVersion, RequestHead, parse_request_head};

use crate::exchange::{Authority, Exchange, resolve_agent};

#[test]
fn exchange_ids_increase() {
    let first = Exchange::new(
        Authority::new("a", 80, false),
        RequestHead::new("GET", "/", HttpVersion::Http11),
    );
    let second = Exchange::new(
        Authority::new("a", 80, false),
        RequestHead::new("GET", "/", HttpVersion::Http11),
    );
    assert!(second.id > first.id);
}

#[test]
fn parses_authority_forms() {
    assert_eq!(
        Authority::parse("example.com", true),
        Some(Authority::new("example.com", 443, true))
    );
    assert_eq!(
        Authority::parse("example.com:8443", true),
        Some(Authority::new("example.com", 8443, true))
    );
    assert_eq!(
        Authority::parse("[::1]:8080", false),
        Some(Authority::new("::1", 8080, false))
    );
    assert_eq!(Authority::parse("example.com:http", false), None);
    assert_eq!(Authority::new("::1", 443, true).to_string(), "[::1]:443");
}

#[test]
fn absolute_form_is_rewritten_to_origin_form() {
    let mut head =
        parse_request_head(b"GET http://example.com:8080/search?q=1 HTTP/1.1\r\n").unwrap();
    let authority = Authority::from_request(&mut head, None).unwrap();
    assert_eq!(authority, Authority::new("example.com", 8080, false));
    assert_eq!(head.line.target, "/search?q=1");
    assert_eq!(head.header("host"), Some("example.com:8080"));
}

#[test]
fn tunnel_authority_wins_for_origin_form() {
    let mut head = parse_request_head(b"GET / HTTP/1.1\r\nHost: other\r\n").unwrap();
    let tunnel = Authority::new("secure.example.com", 443, true);
    assert_eq!(Authority::from_request(&mut head, Some(&tunnel)), Some(tunnel));
}

#[test]
fn host_header_resolves_plain_requests() {
    let mut head = parse_request_head(b"GET / HTTP/1.1\r\nHost: example.com\r\n").unwrap();
    assert_eq!(
        Authority::from_request(&mut head, None),
        Some(Authority::new("example.com", 80, false))
    );
    let mut missing = parse_request_head(b"GET / HTTP/1.1\r\n").unwrap();
    assert_eq!(Authority::from_request(&mut missing, None), None);
}

#[test]
fn tags_are_deduplicated_in_info() {
    let head = parse_request_head(b"GET /x HTTP/1.1\r\nHost: example.com\r\n").unwrap();
    let mut exchange = Exchange::new(Authority::new("example.com", 80, false), head);
    exchange.add_tag("api");
    exchange.add_tag("api");
    let info = exchange.to_info(ExchangeState::Pending);
    assert_eq!(info.tags, vec!["api"]);
    assert_eq!(info.path, "/x");
    assert_eq!(info.scheme, "http");
    assert!(info.metrics.received_from_client.is_some());
    assert_eq!(info.status_code, None);
}

#[test]
fn agent_is_first_product_token() {
    assert_eq!(
        resolve_agent("Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0").as_deref(),
        Some("Mozilla/5.0")
    );
    assert_eq!(resolve_agent("curl/8.4.0").as_deref(), Some("curl/8.4.0"));
    assert_eq!(resolve_agent("  "), None);
}
