use std::net::IpAddr;

use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    SanType,
};

use super::ca::{apply_validity, rcgen_error};
use super::types::{CaCertificate, LeafCertificate, TlsError};

const LEAF_VALIDITY_DAYS: i64 = 365;

/// Key under which a host's certificate is cached: `*.parent` for names with
/// at least three labels, the host itself otherwise (IPs, `localhost`,
/// registrable domains).
pub fn wildcard_domain(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 3 {
        return host;
    }
    format!("*.{}", labels[1..].join("."))
}

pub fn generate_leaf_cert(host: &str, ca: &CaCertificate) -> Result<LeafCertificate, TlsError> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::NoCa;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    apply_validity(&mut params, LEAF_VALIDITY_DAYS);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.to_string()));
        let wildcard = wildcard_domain(host);
        if wildcard != host {
            params.subject_alt_names.push(SanType::DnsName(wildcard));
        }
    }

    let cert = Certificate::from_params(params).map_err(rcgen_error)?;
    let cert_pem = cert
        .serialize_pem_with_signer(&ca.cert)
        .map_err(rcgen_error)?
        .into_bytes();
    let key_pem = cert.serialize_private_key_pem().into_bytes();

    Ok(LeafCertificate { cert_pem, key_pem })
}
