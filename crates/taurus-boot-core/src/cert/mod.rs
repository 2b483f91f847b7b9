//! TLS certificate provisioning for the public-facing proxy.
//!
//! The bootstrap owns a single self-signed key/certificate pair at a fixed
//! location. An existing bundle is reused byte-for-byte across restarts; it
//! is only regenerated when the configured subject fields change, which is
//! tracked through a small JSON sidecar written next to the bundle.
//!
//! The certificate is a long-lived internal/dev credential, not a publicly
//! trusted one; rotation happens by redeploying with changed subject fields
//! or by deleting the bundle from the volume.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use time::{Duration as ValidityDuration, OffsetDateTime};
use tracing::{info, warn};

use crate::config::CertSubject;

/// File name of the PEM private key inside the certificate directory.
pub const KEY_FILE: &str = "taurus.key";

/// File name of the PEM certificate inside the certificate directory.
pub const CERT_FILE: &str = "taurus.crt";

/// Sidecar recording the subject the bundle was generated from.
const SUBJECT_FILE: &str = "subject.json";

/// Validity period of a freshly generated certificate.
///
/// Ten years: the bundle backs an internal deployment and is expected to
/// outlive any individual container.
const VALIDITY_DAYS: i64 = 3650;

/// A provisioned key/certificate pair on disk.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    /// Path to the PEM private key (mode 0600).
    pub key_path: PathBuf,
    /// Path to the PEM certificate.
    pub cert_path: PathBuf,
    /// Whether an existing bundle was reused rather than generated.
    pub reused: bool,
}

/// Certificate provisioning error.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Key or certificate generation failed.
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    /// Reading or writing the bundle failed.
    #[error("certificate storage failed: {0}")]
    Io(#[from] std::io::Error),

    /// The subject sidecar exists but cannot be parsed. Regenerating over
    /// an unreadable record could silently swap the serving certificate, so
    /// this is surfaced to the operator instead.
    #[error("certificate subject record {path} is corrupt: {source}")]
    Sidecar {
        /// Sidecar path.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Ensure a key/certificate bundle for `subject` exists under `dir`.
///
/// Reuses an existing bundle untouched when its recorded subject matches;
/// otherwise generates a new key pair and self-signed certificate.
///
/// # Errors
///
/// Returns [`ProvisionError`] on generation failure, filesystem failure, or
/// a corrupt subject sidecar.
pub fn ensure_certificate(
    subject: &CertSubject,
    dir: &Path,
) -> Result<CertificateBundle, ProvisionError> {
    fs::create_dir_all(dir)?;

    let key_path = dir.join(KEY_FILE);
    let cert_path = dir.join(CERT_FILE);
    let subject_path = dir.join(SUBJECT_FILE);

    if key_path.exists() && cert_path.exists() && subject_path.exists() {
        let recorded: CertSubject = serde_json::from_slice(&fs::read(&subject_path)?)
            .map_err(|source| ProvisionError::Sidecar {
                path: subject_path.clone(),
                source,
            })?;
        if recorded == *subject {
            info!(cert = %cert_path.display(), "Reusing existing certificate bundle");
            return Ok(CertificateBundle {
                key_path,
                cert_path,
                reused: true,
            });
        }
        warn!(
            cert = %cert_path.display(),
            "Certificate subject changed; regenerating bundle"
        );
    }

    let (key_pem, cert_pem) = generate(subject)?;
    let sidecar = serde_json::to_vec_pretty(subject).map_err(|source| ProvisionError::Sidecar {
        path: subject_path.clone(),
        source,
    })?;

    fs::write(&key_path, key_pem)?;
    restrict_key_permissions(&key_path)?;
    fs::write(&cert_path, cert_pem)?;
    // Written last: an interrupted provisioning run regenerates rather than
    // reusing a half-written bundle.
    fs::write(&subject_path, sidecar)?;

    info!(cert = %cert_path.display(), "Generated new certificate bundle");
    Ok(CertificateBundle {
        key_path,
        cert_path,
        reused: false,
    })
}

/// Generate a fresh key pair and self-signed certificate.
fn generate(subject: &CertSubject) -> Result<(String, String), ProvisionError> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::OrganizationName, subject.organization.clone());
    params
        .distinguished_name
        .push(DnType::LocalityName, subject.locality.clone());
    params.distinguished_name.push(
        DnType::OrganizationalUnitName,
        subject.organizational_unit.clone(),
    );
    params
        .distinguished_name
        .push(DnType::CommonName, subject.domain.clone());
    params.subject_alt_names = vec![
        SanType::DnsName(subject.domain.as_str().try_into()?),
        SanType::Rfc822Name(subject.email.as_str().try_into()?),
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ValidityDuration::days(VALIDITY_DAYS);

    let cert = params.self_signed(&key_pair)?;
    Ok((key_pair.serialize_pem(), cert.pem()))
}

/// Restrict the private key to owner read/write.
#[cfg(unix)]
fn restrict_key_permissions(path: &Path) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_key_permissions(_path: &Path) -> Result<(), ProvisionError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> CertSubject {
        CertSubject {
            organization: "Numenta".to_string(),
            locality: "Redwood City".to_string(),
            domain: "taurus.example.com".to_string(),
            organizational_unit: "Taurus".to_string(),
            email: "support@example.com".to_string(),
        }
    }

    #[test]
    fn generates_a_bundle_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = ensure_certificate(&subject(), dir.path()).unwrap();

        assert!(!bundle.reused);
        let key = fs::read_to_string(&bundle.key_path).unwrap();
        let cert = fs::read_to_string(&bundle.cert_path).unwrap();
        assert!(key.contains("PRIVATE KEY"));
        assert!(cert.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn reuse_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let first = ensure_certificate(&subject(), dir.path()).unwrap();
        let key_before = fs::read(&first.key_path).unwrap();
        let cert_before = fs::read(&first.cert_path).unwrap();

        let second = ensure_certificate(&subject(), dir.path()).unwrap();
        assert!(second.reused);
        assert_eq!(fs::read(&second.key_path).unwrap(), key_before);
        assert_eq!(fs::read(&second.cert_path).unwrap(), cert_before);
    }

    #[test]
    fn subject_change_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let first = ensure_certificate(&subject(), dir.path()).unwrap();
        let key_before = fs::read(&first.key_path).unwrap();

        let mut changed = subject();
        changed.domain = "other.example.com".to_string();
        let second = ensure_certificate(&changed, dir.path()).unwrap();

        assert!(!second.reused);
        assert_ne!(fs::read(&second.key_path).unwrap(), key_before);
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bundle = ensure_certificate(&subject(), dir.path()).unwrap();
        let mode = fs::metadata(&bundle.key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_sidecar_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        ensure_certificate(&subject(), dir.path()).unwrap();
        fs::write(dir.path().join("subject.json"), b"{not json").unwrap();

        let err = ensure_certificate(&subject(), dir.path()).unwrap_err();
        assert!(matches!(err, ProvisionError::Sidecar { .. }));
    }

    #[test]
    fn missing_sidecar_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let first = ensure_certificate(&subject(), dir.path()).unwrap();
        let key_before = fs::read(&first.key_path).unwrap();
        fs::remove_file(dir.path().join("subject.json")).unwrap();

        let second = ensure_certificate(&subject(), dir.path()).unwrap();
        assert!(!second.reused);
        assert_ne!(fs::read(&second.key_path).unwrap(), key_before);
    }
}
