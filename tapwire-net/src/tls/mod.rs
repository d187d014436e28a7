mod ca;
mod cache;
mod cert;
mod ssl;
mod types;

pub use ca::{ca_from_pem, generate_ca, load_or_generate_ca, write_ca_to_dir};
pub use cache::CertCache;
pub use cert::{generate_leaf_cert, wildcard_domain};
pub use ssl::{ClientTlsConfig, TlsConfig, build_acceptor, build_connector, encode_alpn};
pub use types::{
    CaCertificate, CaMaterial, CaMaterialPaths, LeafCertificate, TlsError, TlsErrorKind,
    TlsVersion, TlsVersionRange,
};
