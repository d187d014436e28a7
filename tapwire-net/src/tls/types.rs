use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct CaMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CaMaterialPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Root authority used to sign impersonated leaf certificates.
pub struct CaCertificate {
    pub material: CaMaterial,
    pub cert: rcgen::Certificate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    Ssl3,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            TlsVersion::Ssl3 => "ssl3",
            TlsVersion::Tls10 => "tls1.0",
            TlsVersion::Tls11 => "tls1.1",
            TlsVersion::Tls12 => "tls1.2",
            TlsVersion::Tls13 => "tls1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(['_', ' ', 'v'], "");
        match normalized.as_str() {
            "ssl3" | "ssl3.0" => Ok(TlsVersion::Ssl3),
            "tls1" | "tls1.0" | "tls10" => Ok(TlsVersion::Tls10),
            "tls1.1" | "tls11" => Ok(TlsVersion::Tls11),
            "tls1.2" | "tls12" => Ok(TlsVersion::Tls12),
            "tls1.3" | "tls13" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::new(
                TlsErrorKind::InvalidVersion,
                format!("unknown tls version {value:?}"),
            )),
        }
    }
}

/// Inclusive protocol bounds. `None` leaves the library default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsVersionRange {
    pub min: Option<TlsVersion>,
    pub max: Option<TlsVersion>,
}

impl TlsVersionRange {
    pub fn exactly(version: TlsVersion) -> Self {
        Self {
            min: Some(version),
            max: Some(version),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

#[derive(Debug)]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    Rcgen,
    Io,
    OpenSsl,
    InvalidVersion,
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tls {:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TlsError {}
