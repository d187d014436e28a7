use std::fs;
use std::path::Path;

use chrono::{Datelike, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};

use super::types::{CaCertificate, CaMaterial, CaMaterialPaths, TlsError, TlsErrorKind};

const DEFAULT_CA_VALIDITY_DAYS: i64 = 365;
const CA_CERT_FILE: &str = "tapwire-ca.pem";
const CA_KEY_FILE: &str = "tapwire-ca-key.pem";

pub fn generate_ca(common_name: &str) -> Result<CaCertificate, TlsError> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Tapwire");
    params.distinguished_name = dn;
    apply_validity(&mut params, DEFAULT_CA_VALIDITY_DAYS);

    let cert = Certificate::from_params(params).map_err(rcgen_error)?;
    let cert_pem = cert.serialize_pem().map_err(rcgen_error)?.into_bytes();
    let key_pem = cert.serialize_private_key_pem().into_bytes();

    Ok(CaCertificate {
        material: CaMaterial { cert_pem, key_pem },
        cert,
    })
}

/// Loads the root authority from `dir`, generating and persisting a fresh one
/// when either file is missing.
pub fn load_or_generate_ca(
    dir: impl AsRef<Path>,
    common_name: &str,
) -> Result<(CaCertificate, CaMaterialPaths), TlsError> {
    let dir = dir.as_ref();
    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        let cert_pem = fs::read_to_string(&cert_path).map_err(io_error)?;
        let key_pem = fs::read_to_string(&key_path).map_err(io_error)?;
        let ca = ca_from_pem(&cert_pem, &key_pem)?;
        return Ok((ca, CaMaterialPaths { cert_path, key_path }));
    }

    let ca = generate_ca(common_name)?;
    let paths = write_ca_to_dir(dir, &ca.material)?;
    Ok((ca, paths))
}

pub fn ca_from_pem(cert_pem: &str, key_pem: &str) -> Result<CaCertificate, TlsError> {
    let key_pair = KeyPair::from_pem(key_pem).map_err(rcgen_error)?;
    let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair).map_err(rcgen_error)?;
    let cert = Certificate::from_params(params).map_err(rcgen_error)?;
    Ok(CaCertificate {
        material: CaMaterial {
            cert_pem: cert_pem.as_bytes().to_vec(),
            key_pem: key_pem.as_bytes().to_vec(),
        },
        cert,
    })
}

pub fn write_ca_to_dir(
    dir: impl AsRef<Path>,
    material: &CaMaterial,
) -> Result<CaMaterialPaths, TlsError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(io_error)?;

    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);
    fs::write(&cert_path, &material.cert_pem).map_err(io_error)?;
    fs::write(&key_path, &material.key_pem).map_err(io_error)?;

    Ok(CaMaterialPaths { cert_path, key_path })
}

/// Backdates by a day to tolerate clock skew between proxy and client.
pub(crate) fn apply_validity(params: &mut CertificateParams, days: i64) {
    let not_before = Utc::now() - Duration::days(1);
    let not_after = Utc::now() + Duration::days(days);
    params.not_before = rcgen::date_time_ymd(
        not_before.year(),
        not_before.month() as u8,
        not_before.day() as u8,
    );
    params.not_after = rcgen::date_time_ymd(
        not_after.year(),
        not_after.month() as u8,
        not_after.day() as u8,
    );
}

pub(crate) fn rcgen_error(err: rcgen::Error) -> TlsError {
    TlsError::new(TlsErrorKind::Rcgen, err.to_string())
}

pub(crate) fn io_error(err: std::io::Error) -> TlsError {
    TlsError::new(TlsErrorKind::Io, err.to_string())
}
