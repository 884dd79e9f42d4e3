//! Certificate validation
//!
//! Checks the operator-supplied admin certificate, if one is present on disk.
//! A missing certificate is not an error: startup generates a self-signed one.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use x509_parser::extensions::GeneralName;
use x509_parser::prelude::X509Certificate;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

const SECS_PER_DAY: i64 = 86_400;

/// Validate the admin certificate
pub fn validate_certificates(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let admin = &config.admin;

    let missing = match (admin.cert_path.exists(), admin.key_path.exists()) {
        (true, true) => None,
        (false, false) => {
            result.add_warning(ValidationWarning::new(format!(
                "No admin certificate at {}; a self-signed certificate will be generated",
                admin.cert_path.display()
            )));
            return result;
        }
        (true, false) => Some(("private key", &admin.key_path)),
        (false, true) => Some(("certificate", &admin.cert_path)),
    };
    if let Some((what, path)) = missing {
        result.add_error(cert_error(format!(
            "Admin {what} missing at {}; supply both files or neither",
            path.display()
        )));
        return result;
    }

    let der = match read_der(&admin.cert_path) {
        Ok(der) => der,
        Err(e) => {
            result.add_error(e);
            return result;
        }
    };
    let cert = match x509_parser::parse_x509_certificate(&der) {
        Ok((_, cert)) => cert,
        Err(e) => {
            result.add_error(cert_error(format!(
                "{} is not a valid X.509 certificate: {e}",
                admin.cert_path.display()
            )));
            return result;
        }
    };

    check_expiry(&cert, config.acme.renew_before_days, &mut result);

    if !covers_hostname(&cert, &admin.hostname) {
        result.add_warning(ValidationWarning::new(format!(
            "Admin certificate {} does not name {}; clients will reject it",
            admin.cert_path.display(),
            admin.hostname
        )));
    }

    result
}

fn cert_error(message: String) -> ValidationError {
    ValidationError::new(ErrorCategory::Certificate, message)
}

/// First PEM block of the file, as DER
fn read_der(path: &Path) -> Result<Vec<u8>, ValidationError> {
    let contents = std::fs::read(path)
        .map_err(|e| cert_error(format!("Cannot read {}: {e}", path.display())))?;
    let block = pem::parse(&contents)
        .map_err(|e| cert_error(format!("{} is not PEM: {e}", path.display())))?;
    Ok(block.into_contents())
}

fn check_expiry(
    cert: &X509Certificate<'_>,
    renew_before_days: u32,
    result: &mut ValidationResult,
) {
    let not_after = cert.validity().not_after;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let remaining = not_after.timestamp() - now;

    if remaining <= 0 {
        result.add_error(cert_error(format!("Admin certificate expired at {not_after}")));
    } else if remaining < i64::from(renew_before_days) * SECS_PER_DAY {
        result.add_warning(ValidationWarning::new(format!(
            "Admin certificate expires at {not_after}, {} day(s) from now",
            remaining / SECS_PER_DAY
        )));
    }
}

/// Whether a DNS SAN (or a single-label wildcard) matches `hostname`
fn covers_hostname(cert: &X509Certificate<'_>, hostname: &str) -> bool {
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return false;
    };
    san.value.general_names.iter().any(|name| match name {
        GeneralName::DNSName(dns) => dns_matches(dns, hostname),
        _ => false,
    })
}

fn dns_matches(pattern: &str, hostname: &str) -> bool {
    if pattern.eq_ignore_ascii_case(hostname) {
        return true;
    }
    match (pattern.strip_prefix("*."), hostname.split_once('.')) {
        (Some(suffix), Some((label, rest))) => {
            !label.is_empty() && suffix.eq_ignore_ascii_case(rest)
        }
        _ => false,
    }
}
