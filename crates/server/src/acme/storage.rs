//! On-disk certificate store
//!
//! Holds the ACME account and one directory per issued hostname. Everything
//! in memory can be rebuilt from here after a restart.
//!
//! ```text
//! <storage_path>/
//! ├── credentials.json      # account credentials, opaque to keygate
//! ├── last_clean.json       # time of the last expired-certificate sweep
//! └── domains/
//!     └── login.example.net/
//!         ├── cert.pem      # chain, leaf first
//!         ├── key.pem       # private key (0600)
//!         └── meta.json     # validity and issuing directory
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::error::StorageError;

const CREDENTIALS_FILE: &str = "credentials.json";
const LAST_CLEAN_FILE: &str = "last_clean.json";
const DOMAINS_DIR: &str = "domains";

/// Longest hostname accepted as a storage key
const MAX_HOSTNAME_LEN: usize = 253;

/// Metadata written next to each certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub expires: DateTime<Utc>,
    pub issued: DateTime<Utc>,
    /// Hostnames covered by the certificate
    pub domains: Vec<String>,
    /// CA directory that issued it; absent in files written before it was recorded
    #[serde(default)]
    pub directory: Option<String>,
}

impl CertificateMeta {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }
}

/// Certificate, key and metadata read back from disk
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub meta: CertificateMeta,
}

#[derive(Debug, Serialize, Deserialize)]
struct CleanRecord {
    cleaned: DateTime<Utc>,
}

/// Paths of the three files kept for one hostname
struct DomainFiles {
    dir: PathBuf,
    cert: PathBuf,
    key: PathBuf,
    meta: PathBuf,
}

impl DomainFiles {
    fn new(dir: PathBuf) -> Self {
        Self {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
            meta: dir.join("meta.json"),
            dir,
        }
    }
}

/// Filesystem store for account credentials and certificates
///
/// Directories are created 0700 and private material is written 0600.
#[derive(Debug)]
pub struct CertificateStorage {
    base_path: PathBuf,
}

impl CertificateStorage {
    /// Open the store at `base_path`, creating it if needed
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        let domains_path = base_path.join(DOMAINS_DIR);
        fs::create_dir_all(&domains_path)?;
        restrict_dir(base_path)?;
        restrict_dir(&domains_path)?;

        info!(storage_path = %base_path.display(), "Opened certificate storage");

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // =========================================================================
    // Account
    // =========================================================================

    /// Serialized account credentials, if an account was created before
    pub fn load_credentials_json(&self) -> Result<Option<String>, StorageError> {
        let path = self.base_path.join(CREDENTIALS_FILE);
        match read_optional(&path)? {
            Some(json) => {
                debug!("Loaded stored ACME account credentials");
                Ok(Some(json))
            }
            None => {
                trace!("No stored ACME account credentials");
                Ok(None)
            }
        }
    }

    pub fn save_credentials_json(&self, json: &str) -> Result<(), StorageError> {
        write_private(&self.base_path.join(CREDENTIALS_FILE), json)?;
        info!("Saved ACME account credentials");
        Ok(())
    }

    // =========================================================================
    // Certificates
    // =========================================================================

    /// Files for `domain`
    ///
    /// Hostnames arrive here straight from a ClientHello, so anything that
    /// could name a path outside the domains directory is refused.
    fn files_for(&self, domain: &str) -> Result<DomainFiles, StorageError> {
        if !is_storable_hostname(domain) {
            return Err(StorageError::InvalidDomain(domain.to_string()));
        }
        Ok(DomainFiles::new(self.base_path.join(DOMAINS_DIR).join(domain)))
    }

    /// Certificate stored for `domain`, or `None` if there is none
    pub fn load_certificate(
        &self,
        domain: &str,
    ) -> Result<Option<StoredCertificate>, StorageError> {
        let files = self.files_for(domain)?;

        let Some(cert_pem) = read_optional(&files.cert)? else {
            trace!(domain = %domain, "No stored certificate");
            return Ok(None);
        };
        let key_pem = fs::read_to_string(&files.key)?;
        let meta: CertificateMeta = serde_json::from_str(&fs::read_to_string(&files.meta)?)?;

        debug!(domain = %domain, expires = %meta.expires, "Loaded stored certificate");
        Ok(Some(StoredCertificate {
            cert_pem,
            key_pem,
            meta,
        }))
    }

    /// Store a certificate, replacing any previous one for `domain`
    pub fn save_certificate(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
        meta: &CertificateMeta,
    ) -> Result<(), StorageError> {
        let files = self.files_for(domain)?;
        fs::create_dir_all(&files.dir)?;

        // Each file is swapped in whole. A crash between swaps can still pair
        // a new key with the old certificate; loading rejects that pair.
        replace_file(&files.key, key_pem, true)?;
        replace_file(&files.meta, &serde_json::to_string_pretty(meta)?, false)?;
        replace_file(&files.cert, cert_pem, false)?;

        info!(domain = %domain, expires = %meta.expires, "Stored certificate");
        Ok(())
    }

    /// Hostnames with a directory in the store
    pub fn list_domains(&self) -> Result<Vec<String>, StorageError> {
        let mut domains = Vec::new();
        for entry in fs::read_dir(self.base_path.join(DOMAINS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => domains.push(name),
                Err(name) => warn!(name = ?name, "Ignoring non-UTF-8 entry in certificate storage"),
            }
        }
        domains.sort();
        Ok(domains)
    }

    pub fn delete_certificate(&self, domain: &str) -> Result<(), StorageError> {
        let files = self.files_for(domain)?;
        match fs::remove_dir_all(&files.dir) {
            Ok(()) => {
                info!(domain = %domain, "Deleted stored certificate");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(domain = %domain, "No stored certificate to delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Cleaning
    // =========================================================================

    /// When [`remove_expired`](Self::remove_expired) last ran
    pub fn last_cleaned(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        match read_optional(&self.base_path.join(LAST_CLEAN_FILE))? {
            Some(json) => {
                let record: CleanRecord = serde_json::from_str(&json)?;
                Ok(Some(record.cleaned))
            }
            None => Ok(None),
        }
    }

    /// Delete every certificate expired at `now` and record the sweep
    ///
    /// Unreadable entries are skipped, not deleted. Returns the removed
    /// hostnames.
    pub fn remove_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        let mut removed = Vec::new();

        for domain in self.list_domains()? {
            match self.load_certificate(&domain) {
                Ok(Some(stored)) if stored.meta.is_expired_at(now) => {
                    self.delete_certificate(&domain)?;
                    removed.push(domain);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Skipping unreadable stored certificate");
                }
            }
        }

        let record = serde_json::to_string(&CleanRecord { cleaned: now })?;
        fs::write(self.base_path.join(LAST_CLEAN_FILE), record)?;

        debug!(removed = removed.len(), "Swept expired certificates");
        Ok(removed)
    }
}

/// Whether `domain` is safe to use as a directory name
fn is_storable_hostname(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= MAX_HOSTNAME_LEN
        && !domain.starts_with('.')
        && !domain.contains("..")
        && domain
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
}

/// File contents, or `None` if it does not exist
fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn restrict_dir(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Write a file readable only by its owner
fn write_private(path: &Path, content: &str) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        // open() leaves the mode of an existing file alone
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        file.write_all(content.as_bytes())?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, content)?;
    }

    Ok(())
}

/// Write `content` beside `path`, then rename it over `path`
fn replace_file(path: &Path, content: &str, private: bool) -> Result<(), StorageError> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    if private {
        write_private(&staging, content)?;
    } else {
        fs::write(&staging, content)?;
    }
    fs::rename(&staging, path)?;
    Ok(())
}
