use openssl::pkey::PKey;
use openssl::ssl::{
    AlpnError, SslAcceptor, SslAcceptorBuilder, SslConnector, SslContextBuilder, SslMethod,
    SslOptions, SslVerifyMode, SslVersion,
};
use openssl::x509::X509;

use super::types::{LeafCertificate, TlsError, TlsErrorKind, TlsVersion, TlsVersionRange};

/// ALPN wire form of the only protocol spoken on the downstream leg.
const HTTP11_ALPN: &[u8] = b"\x08http/1.1";

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub allow_legacy: bool,
    pub versions: TlsVersionRange,
}

/// Upstream handshake settings assembled per exchange.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    pub versions: TlsVersionRange,
    pub skip_verify: bool,
    pub alpn: Vec<String>,
    pub client_certificate: Option<LeafCertificate>,
}

pub fn build_acceptor(config: &TlsConfig, leaf: &LeafCertificate) -> Result<SslAcceptor, TlsError> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls()).map_err(openssl_error)?;

    apply_legacy(&mut builder, config.allow_legacy)?;
    apply_versions(&mut builder, &config.versions)?;

    let cert = X509::from_pem(&leaf.cert_pem).map_err(openssl_error)?;
    let key = PKey::private_key_from_pem(&leaf.key_pem).map_err(openssl_error)?;
    builder.set_certificate(&cert).map_err(openssl_error)?;
    builder.set_private_key(&key).map_err(openssl_error)?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_alpn_select_callback(|_, client| {
        openssl::ssl::select_next_proto(HTTP11_ALPN, client).ok_or(AlpnError::NOACK)
    });

    Ok(builder.build())
}

pub fn build_connector(config: &ClientTlsConfig) -> Result<SslConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(openssl_error)?;

    apply_versions(&mut builder, &config.versions)?;
    if config.skip_verify {
        builder.set_verify(SslVerifyMode::NONE);
    }
    if !config.alpn.is_empty() {
        builder
            .set_alpn_protos(&encode_alpn(&config.alpn))
            .map_err(openssl_error)?;
    }
    if let Some(client) = &config.client_certificate {
        let cert = X509::from_pem(&client.cert_pem).map_err(openssl_error)?;
        let key = PKey::private_key_from_pem(&client.key_pem).map_err(openssl_error)?;
        builder.set_certificate(&cert).map_err(openssl_error)?;
        builder.set_private_key(&key).map_err(openssl_error)?;
    }

    Ok(builder.build())
}

pub fn encode_alpn(protocols: &[String]) -> Vec<u8> {
    let mut wire = Vec::new();
    for protocol in protocols {
        let bytes = protocol.as_bytes();
        if bytes.is_empty() || bytes.len() > u8::MAX as usize {
            continue;
        }
        wire.push(bytes.len() as u8);
        wire.extend_from_slice(bytes);
    }
    wire
}

fn apply_legacy(builder: &mut SslAcceptorBuilder, allow_legacy: bool) -> Result<(), TlsError> {
    if allow_legacy {
        builder.set_options(SslOptions::NO_TICKET);
        builder.clear_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
        builder
            .set_cipher_list("ALL:@SECLEVEL=0")
            .map_err(openssl_error)?;
        builder
            .set_min_proto_version(None)
            .map_err(openssl_error)?;
    } else {
        builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
    }
    Ok(())
}

fn apply_versions(builder: &mut SslContextBuilder, versions: &TlsVersionRange) -> Result<(), TlsError> {
    if let Some(min) = versions.min {
        builder
            .set_min_proto_version(Some(ssl_version(min)))
            .map_err(openssl_error)?;
    }
    if let Some(max) = versions.max {
        builder
            .set_max_proto_version(Some(ssl_version(max)))
            .map_err(openssl_error)?;
    }
    Ok(())
}

fn ssl_version(version: TlsVersion) -> SslVersion {
    match version {
        TlsVersion::Ssl3 => SslVersion::SSL3,
        TlsVersion::Tls10 => SslVersion::TLS1,
        TlsVersion::Tls11 => SslVersion::TLS1_1,
        TlsVersion::Tls12 => SslVersion::TLS1_2,
        TlsVersion::Tls13 => SslVersion::TLS1_3,
    }
}

fn openssl_error(err: impl std::fmt::Display) -> TlsError {
    TlsError::new(TlsErrorKind::OpenSsl, err.to_string())
}
