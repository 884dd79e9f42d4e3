//! Self-signed bootstrap certificate
//!
//! Guarantees the admin interface can serve TLS before any ACME issuance has
//! succeeded. The certificate is created once and only ever replaced whole.

use std::fs;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::acme::GenerationError;

/// RSA modulus size of bootstrap keys
pub const KEY_BITS: usize = 2048;

/// Validity of a bootstrap certificate, in calendar years
pub const VALIDITY_YEARS: i32 = 10;

/// Serial number length in bytes
const SERIAL_BYTES: usize = 16;

const LOCALHOST: &str = "localhost";

/// Subject fields for a bootstrap certificate
#[derive(Debug, Clone, Default)]
pub struct Subject {
    pub common_name: String,
}

impl Subject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
        }
    }
}

/// A generated certificate, as written to disk
#[derive(Debug, Clone)]
pub struct BootstrapCertificate {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub serial: Vec<u8>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub cert_pem: String,
}

/// Produces self-signed certificate and key pairs
#[derive(Debug, Clone)]
pub struct BootstrapCertificateGenerator {
    include_loopback: bool,
}

impl Default for BootstrapCertificateGenerator {
    fn default() -> Self {
        Self {
            include_loopback: !cfg!(feature = "production"),
        }
    }
}

impl BootstrapCertificateGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override whether `127.0.0.1`, `::1` and `localhost` are always added
    pub fn with_loopback(mut self, include_loopback: bool) -> Self {
        self.include_loopback = include_loopback;
        self
    }

    /// Generate a certificate for `hostnames` and write it to disk
    ///
    /// The certificate goes to `public_path` as PEM; the PKCS#1 private key
    /// goes to `private_path` with mode 0600. Parent directories are created.
    pub fn generate(
        &self,
        subject: &Subject,
        hostnames: &[String],
        public_path: &Path,
        private_path: &Path,
    ) -> Result<BootstrapCertificate, GenerationError> {
        let serial = random_serial()?;

        let rsa_key = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
            .map_err(|e| GenerationError::KeyGeneration(e.to_string()))?;
        let pkcs1_pem = rsa_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| GenerationError::KeyGeneration(e.to_string()))?;
        let pkcs8_pem = rsa_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| GenerationError::KeyGeneration(e.to_string()))?;

        let (dns_names, ip_addresses) = self.split_hostnames(hostnames);
        let common_name = common_name(subject, hostnames);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name.as_str());
        params.distinguished_name = dn;

        for ip in &ip_addresses {
            params.subject_alt_names.push(SanType::IpAddress(*ip));
        }
        for name in &dns_names {
            params.subject_alt_names.push(SanType::DnsName(
                name.clone().try_into().map_err(|e| {
                    GenerationError::Certificate(format!("invalid DNS name {}: {}", name, e))
                })?,
            ));
        }

        let not_before = OffsetDateTime::now_utc()
            .replace_nanosecond(0)
            .map_err(|e| GenerationError::Certificate(e.to_string()))?;
        let not_after = years_after(not_before, VALIDITY_YEARS)?;
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let key_pair = KeyPair::from_pem_and_sign_algo(&pkcs8_pem, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| GenerationError::Certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| GenerationError::Certificate(e.to_string()))?;
        let cert_pem = cert.pem();

        create_parent(public_path)?;
        create_parent(private_path)?;
        fs::write(public_path, &cert_pem).map_err(|source| GenerationError::WriteFile {
            path: public_path.to_path_buf(),
            source,
        })?;
        write_private_key(private_path, pkcs1_pem.as_bytes())?;

        info!(
            common_name = %common_name,
            dns_names = ?dns_names,
            ip_addresses = ?ip_addresses,
            cert = %public_path.display(),
            "Generated self-signed bootstrap certificate"
        );

        Ok(BootstrapCertificate {
            common_name,
            dns_names,
            ip_addresses,
            serial: serial.to_vec(),
            not_before,
            not_after,
            cert_pem,
        })
    }

    /// Split hostnames into DNS names and IP addresses, adding loopback extras
    fn split_hostnames(&self, hostnames: &[String]) -> (Vec<String>, Vec<IpAddr>) {
        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();

        for host in hostnames {
            match host.parse::<IpAddr>() {
                Ok(ip) => push_unique(&mut ip_addresses, ip),
                Err(_) => push_unique(&mut dns_names, host.clone()),
            }
        }

        if self.include_loopback {
            push_unique(&mut ip_addresses, IpAddr::V4(Ipv4Addr::LOCALHOST));
            push_unique(&mut ip_addresses, IpAddr::V6(Ipv6Addr::LOCALHOST));
            push_unique(&mut dns_names, LOCALHOST.to_string());
        }

        debug!(
            dns = dns_names.len(),
            ip = ip_addresses.len(),
            "Resolved bootstrap certificate SANs"
        );
        (dns_names, ip_addresses)
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

/// Subject CN unless empty or the IPv4 loopback, then the first hostname,
/// then `localhost`
fn common_name(subject: &Subject, hostnames: &[String]) -> String {
    if !subject.common_name.is_empty() && subject.common_name != "127.0.0.1" {
        return subject.common_name.clone();
    }
    hostnames
        .first()
        .cloned()
        .unwrap_or_else(|| LOCALHOST.to_string())
}

/// Positive serial of up to 128 bits from the OS random source
fn random_serial() -> Result<[u8; SERIAL_BYTES], GenerationError> {
    let mut serial = [0u8; SERIAL_BYTES];
    OsRng
        .try_fill_bytes(&mut serial)
        .map_err(|e| GenerationError::Serial(e.to_string()))?;
    // DER integers are signed
    serial[0] &= 0x7f;
    Ok(serial)
}

fn create_parent(path: &Path) -> Result<(), GenerationError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|source| GenerationError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

fn write_private_key(path: &Path, pem: &[u8]) -> Result<(), GenerationError> {
    let write_error = |source| GenerationError::WriteFile {
        path: path.to_path_buf(),
        source,
    };

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(write_error)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(write_error)?;
    }
    file.write_all(pem).map_err(write_error)?;
    Ok(())
}

/// Same instant `years` calendar years later; 29 February lands on 28 February
fn years_after(start: OffsetDateTime, years: i32) -> Result<OffsetDateTime, GenerationError> {
    let year = start.year() + years;
    start
        .replace_year(year)
        .or_else(|_| start.replace_day(28).and_then(|t| t.replace_year(year)))
        .map_err(|e| GenerationError::Certificate(e.to_string()))
}
