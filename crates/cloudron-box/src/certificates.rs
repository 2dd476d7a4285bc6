// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TLS certificates for app vhosts.
//!
//! An app either has a custom certificate uploaded through configure (stored under
//! `certs/apps/<fqdn>.cert|key`) or gets one from the [`CertificateProvider`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};

/// A certificate/key pair in PEM format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePem {
    /// Certificate chain
    pub cert: String,
    /// Private key
    pub key: String,
}

impl CertificatePem {
    /// Validate that both parts are present and look like PEM.
    pub fn validate(cert: Option<&str>, key: Option<&str>) -> Result<Option<Self>> {
        match (cert, key) {
            (None, None) => Ok(None),
            (Some(_), None) | (None, Some(_)) => Err(Error::InvalidRequest(
                "cert and key must be provided together".to_string(),
            )),
            (Some(cert), Some(key)) => {
                if !cert.contains("-----BEGIN CERTIFICATE-----") {
                    return Err(Error::InvalidRequest(
                        "cert is not a PEM certificate".to_string(),
                    ));
                }
                if !(key.contains("-----BEGIN") && key.contains("PRIVATE KEY-----")) {
                    return Err(Error::InvalidRequest("key is not a PEM private key".to_string()));
                }
                Ok(Some(Self {
                    cert: cert.to_string(),
                    key: key.to_string(),
                }))
            }
        }
    }
}

/// Paths of a certificate/key pair on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    /// Certificate file
    pub cert_path: PathBuf,
    /// Key file
    pub key_path: PathBuf,
}

/// Result of asking a provider for a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// Where the pair is stored
    pub paths: CertificatePaths,
    /// Whether the files changed since the last call
    pub renewed: bool,
}

/// Trait for certificate providers (ACME, wildcard, ...).
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Provider type identifier
    fn provider_type(&self) -> &'static str;

    /// Certificate for `fqdn`, renewing it if it is close to expiry.
    async fn ensure_certificate(&self, fqdn: &str) -> Result<IssuedCertificate>;
}

/// Serves the box wildcard certificate for every domain.
pub struct FallbackCertificateProvider {
    paths: CertificatePaths,
}

impl FallbackCertificateProvider {
    /// Use the given wildcard pair.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            paths: CertificatePaths {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            },
        }
    }
}

#[async_trait]
impl CertificateProvider for FallbackCertificateProvider {
    fn provider_type(&self) -> &'static str {
        "fallback"
    }

    async fn ensure_certificate(&self, _fqdn: &str) -> Result<IssuedCertificate> {
        Ok(IssuedCertificate {
            paths: self.paths.clone(),
            renewed: false,
        })
    }
}

/// Custom certificates uploaded for apps.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    /// Store certificates in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn paths(&self, fqdn: &str) -> CertificatePaths {
        CertificatePaths {
            cert_path: self.dir.join(format!("{}.cert", fqdn)),
            key_path: self.dir.join(format!("{}.key", fqdn)),
        }
    }

    /// Store a custom certificate for `fqdn`.
    pub async fn install(&self, fqdn: &str, pem: &CertificatePem) -> Result<CertificatePaths> {
        fs::create_dir_all(&self.dir).await?;
        let paths = self.paths(fqdn);
        fs::write(&paths.cert_path, &pem.cert).await?;
        fs::write(&paths.key_path, &pem.key).await?;
        info!(fqdn = %fqdn, "Installed custom certificate");
        Ok(paths)
    }

    /// Custom certificate of `fqdn`, if one was uploaded.
    pub async fn get(&self, fqdn: &str) -> Result<Option<CertificatePaths>> {
        let paths = self.paths(fqdn);
        if fs::try_exists(&paths.cert_path).await? && fs::try_exists(&paths.key_path).await? {
            Ok(Some(paths))
        } else {
            Ok(None)
        }
    }

    /// Remove the custom certificate of `fqdn`.
    pub async fn remove(&self, fqdn: &str) -> Result<()> {
        let paths = self.paths(fqdn);
        remove_if_exists(&paths.cert_path).await?;
        remove_if_exists(&paths.key_path).await?;
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
