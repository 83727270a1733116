//! Client certificate identity.
//!
//! [`ClientCert`] holds the fields of a verified peer certificate that the
//! guard cares about; [`IdentityDirectory`] maps those fields to usernames.
//!
//! # Lookup order
//!
//! 1. Subject Common Name
//! 2. each DNS Subject Alternative Name, in certificate order
//! 3. each email (RFC 822) Subject Alternative Name, in certificate order
//!
//! The first identifier present in the directory wins.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Client certificate
// ─────────────────────────────────────────────────────────────────────────────

/// Identity fields extracted from a client certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCert {
    /// Subject Common Name (empty when absent).
    pub common_name: String,

    /// Serial number in decimal notation.
    pub serial_number: String,

    /// Subject Organization values.
    pub organization: Vec<String>,

    /// Subject Organizational Unit values.
    pub organizational_unit: Vec<String>,

    /// Issuer Common Name (empty when absent).
    pub issuer_common_name: String,

    /// DNS subject alternative names.
    pub dns_names: Vec<String>,

    /// Email subject alternative names.
    pub email_addresses: Vec<String>,

    /// Start of the validity window.
    pub not_before: Option<DateTime<Utc>>,

    /// End of the validity window.
    pub not_after: Option<DateTime<Utc>>,
}

impl ClientCert {
    /// Parse a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the bytes are not a valid X.509 certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Config(format!("Failed to parse client certificate: {e}")))?;

        let (dns_names, email_addresses) = extract_sans(&cert);

        Ok(Self {
            common_name: first_cn(cert.subject()).unwrap_or_default(),
            serial_number: cert.tbs_certificate.serial.to_string(),
            organization: cert
                .subject()
                .iter_organization()
                .filter_map(|a| a.as_str().ok())
                .map(str::to_owned)
                .collect(),
            organizational_unit: cert
                .subject()
                .iter_organizational_unit()
                .filter_map(|a| a.as_str().ok())
                .map(str::to_owned)
                .collect(),
            issuer_common_name: first_cn(cert.issuer()).unwrap_or_default(),
            dns_names,
            email_addresses,
            not_before: DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0),
            not_after: DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0),
        })
    }

    /// All identifiers in lookup order: CN, DNS SANs, email SANs.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.common_name.as_str())
            .chain(self.dns_names.iter().map(String::as_str))
            .chain(self.email_addresses.iter().map(String::as_str))
    }

    /// The `Cert` object exposed to request-header templates.
    #[must_use]
    pub fn template_view(&self) -> Value {
        json!({
            "Subject": {
                "CommonName": self.common_name,
                "Organization": self.organization,
                "OrganizationalUnit": self.organizational_unit,
            },
            "Issuer": {
                "CommonName": self.issuer_common_name,
            },
            "SerialNumber": self.serial_number,
            "DNSNames": self.dns_names,
            "EmailAddresses": self.email_addresses,
            "NotBefore": self.not_before.map(|t| t.to_rfc3339()),
            "NotAfter": self.not_after.map(|t| t.to_rfc3339()),
        })
    }
}

fn first_cn(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// Extract SAN DNS and SAN email entries from the certificate extensions.
fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<String>) {
    let mut dns_names = Vec::new();
    let mut emails = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                GeneralName::RFC822Name(email) => emails.push((*email).to_owned()),
                _ => {}
            }
        }
    }

    (dns_names, emails)
}


// ─────────────────────────────────────────────────────────────────────────────
// Identity directory
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only mapping from certificate identifier to username.
#[derive(Debug, Clone, Default)]
pub struct IdentityDirectory {
    users: HashMap<String, String>,
}

impl IdentityDirectory {
    /// Build the directory from the configured `users` mapping.
    #[must_use]
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Number of configured identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Returns `true` when no identities are configured (no bypass possible).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Resolve a certificate to a username. First hit in lookup order wins.
    #[must_use]
    pub fn resolve(&self, cert: &ClientCert) -> Option<String> {
        if self.users.is_empty() {
            return None;
        }
        cert.identifiers().find_map(|id| self.lookup(id))
    }

    fn lookup(&self, id: &str) -> Option<String> {
        if id.is_empty() {
            return None;
        }
        let username = self.users.get(id)?;
        if username.is_empty() {
            Some(id.to_owned())
        } else {
            Some(username.clone())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
