mod http1;
mod socks;
mod tls;

pub use http1::{
    BodyDecoder, BodyFraming, HEAD_TERMINATOR, Header, HeaderList, HttpVersion, LAST_CHUNK,
    Limits, ParseError, ParseErrorKind, RequestHead, RequestLine, ResponseHead, StatusLine,
    default_reason, encode_chunk, find_head_end, parse_request_head, parse_response_head,
};

pub use tls::{
    CaCertificate, CaMaterial, CaMaterialPaths, CertCache, ClientTlsConfig, LeafCertificate,
    TlsConfig, TlsError, TlsErrorKind, TlsVersion, TlsVersionRange, build_acceptor,
    build_connector, ca_from_pem, encode_alpn, generate_ca, generate_leaf_cert,
    load_or_generate_ca, wildcard_domain, write_ca_to_dir,
};

pub use socks::{
    METHOD_NO_AUTH, METHOD_NONE_ACCEPTABLE, SOCKS5_VERSION, SocksAddress, SocksCommand,
    SocksError, SocksErrorKind, SocksGreeting, SocksParseStatus, SocksReply, SocksRequest,
    build_method_selection, build_reply, parse_greeting, parse_request,
};
