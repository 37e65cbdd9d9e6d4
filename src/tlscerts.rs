//! Self-signed TLS certificate generation for the rendezvous QUIC endpoint.
//!
//! Mirrors the teacher's `configure_server` cert generation, generalized from
//! a fixed "localhost" SAN to whatever public address/name the rendezvous is
//! actually reachable at, with an explicit validity window and serial number
//! instead of rcgen's defaults.

use rand::RngCore;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType,
    PKCS_ECDSA_P256_SHA256,
};
use std::error::Error;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;

const VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);

/// A freshly minted self-signed certificate plus its rustls-ready DER forms.
pub struct SelfSignedCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Subjects a certificate should be valid for: a public IP, a DNS name, or
/// both (the rendezvous is addressed either way depending on deployment).
pub struct Subjects {
    pub ip: Option<IpAddr>,
    pub dns: Option<String>,
}

impl Subjects {
    pub fn san_types(&self) -> Vec<SanType> {
        let mut out = Vec::new();
        if let Some(ip) = self.ip {
            out.push(SanType::IpAddress(ip));
        }
        if let Some(dns) = &self.dns {
            out.push(SanType::DnsName(dns.clone()));
        }
        if out.is_empty() {
            out.push(SanType::DnsName("localhost".into()));
        }
        out
    }
}

/// Generates an ECDSA P-256 self-signed certificate valid for 365 days with a
/// random 128-bit serial number, matching `pkg/tlscerts/tlscerts.go`.
pub fn generate(subjects: &Subjects) -> Result<SelfSignedCert, Box<dyn Error>> {
    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.key_pair = Some(key_pair);
    params.subject_alt_names = subjects.san_types();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "breakpoint");
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;

    let not_before = OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + VALIDITY;

    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    // Top bit clear keeps the serial a positive DER INTEGER.
    serial[0] &= 0x7f;
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial));

    let cert = Certificate::from_params(params)?;
    let cert_der = cert.serialize_der()?;
    let key_der = cert.serialize_private_key_der();

    Ok(SelfSignedCert { cert_der, key_der })
}
