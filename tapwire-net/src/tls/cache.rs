use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use super::ca::io_error;
use super::types::{LeafCertificate, TlsError};

/// LRU of leaf certificates keyed by cache domain, optionally backed by a
/// directory so restarts reuse certificates clients already accepted.
#[derive(Debug)]
pub struct CertCache {
    max_entries: usize,
    order: VecDeque<String>,
    entries: HashMap<String, LeafCertificate>,
    disk_path: Option<PathBuf>,
}

impl CertCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
            disk_path: None,
        }
    }

    pub fn with_disk_path(max_entries: usize, path: impl AsRef<Path>) -> Self {
        Self {
            disk_path: Some(path.as_ref().to_path_buf()),
            ..Self::new(max_entries)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, domain: &str) -> Option<LeafCertificate> {
        if let Some(cert) = self.entries.get(domain).cloned() {
            self.touch(domain);
            return Some(cert);
        }
        let path = self.disk_path.clone()?;
        let cert = load_from_disk(&path, domain).ok()?;
        self.insert(domain.to_string(), cert.clone());
        Some(cert)
    }

    pub fn insert(&mut self, domain: String, cert: LeafCertificate) {
        if !self.entries.contains_key(&domain) {
            self.order.push_back(domain.clone());
        }
        self.entries.insert(domain.clone(), cert);
        self.touch(&domain);
        self.evict_if_needed();
    }

    pub fn persist(&self, domain: &str, cert: &LeafCertificate) -> Result<(), TlsError> {
        let Some(path) = &self.disk_path else {
            return Ok(());
        };
        fs::create_dir_all(path).map_err(io_error)?;
        let stem = file_stem(domain);
        fs::write(path.join(format!("{stem}.pem")), &cert.cert_pem).map_err(io_error)?;
        fs::write(path.join(format!("{stem}.key")), &cert.key_pem).map_err(io_error)?;
        Ok(())
    }

    fn touch(&mut self, domain: &str) {
        if let Some(pos) = self.order.iter().position(|item| item == domain) {
            self.order.remove(pos);
            self.order.push_back(domain.to_string());
        }
    }

    fn evict_if_needed(&mut self) {
        while self.order.len() > self.max_entries {
            if let Some(domain) = self.order.pop_front() {
                self.entries.remove(&domain);
            }
        }
    }
}

fn load_from_disk(path: &Path, domain: &str) -> Result<LeafCertificate, TlsError> {
    let stem = file_stem(domain);
    let cert_pem = fs::read(path.join(format!("{stem}.pem"))).map_err(io_error)?;
    let key_pem = fs::read(path.join(format!("{stem}.key"))).map_err(io_error)?;
    Ok(LeafCertificate { cert_pem, key_pem })
}

fn file_stem(domain: &str) -> String {
    domain
        .replace('*', "_wildcard")
        .replace(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' || ch == '_'), "_")
}
