//! Certificate verification policy for the peer overlay.
//!
//! Chain validation is delegated to the webpki verifiers; this module
//! layers the deployment policy on top: reject expired certificates, and
//! for issuing-tier certificates reject serials the node-connection
//! manager has revoked. Chain depth is capped at 3 (end entity plus two
//! intermediates).

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, Error as TlsError, SignatureScheme};
use x509_parser::prelude::{FromDer, X509Certificate};

use mesh_core::interfaces::NodeConnManager;
use mesh_core::NetError;

/// End entity plus at most two intermediates.
pub const MAX_CHAIN_DEPTH: usize = 3;

/// The issuing tier: certificates allowed to sign other certificates.
pub const TIER_ISSUING: u32 = 1;

// ── Parsed facts ──────────────────────────────────────────────────────────────

/// The fields the policy reads out of a peer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertFacts {
    pub subject: String,
    /// 1 for issuing-tier (CA) certificates, 0 for leaf certificates.
    pub tier: u32,
    /// Serial number as lowercase hex.
    pub serial: String,
    pub expired: bool,
}

/// Extract subject, tier, serial, and expiry from a DER certificate.
pub fn parse_cert(der: &[u8]) -> Result<CertFacts, NetError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| NetError::Protocol(format!("certificate parse failed: {e}")))?;

    let tier = match cert.basic_constraints() {
        Ok(Some(bc)) if bc.value.ca => TIER_ISSUING,
        _ => 0,
    };

    Ok(CertFacts {
        subject: cert.subject().to_string(),
        tier,
        serial: cert.raw_serial_as_string().replace(':', ""),
        expired: !cert.validity().is_valid(),
    })
}

// ── Policy ────────────────────────────────────────────────────────────────────

/// The per-handshake verification policy of the overlay.
pub struct CertPolicy {
    conn_manager: Arc<dyn NodeConnManager>,
}

impl std::fmt::Debug for CertPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertPolicy").finish_non_exhaustive()
    }
}

impl CertPolicy {
    pub fn new(conn_manager: Arc<dyn NodeConnManager>) -> Self {
        Self { conn_manager }
    }

    /// Check one certificate of the presented chain. Returns the parsed
    /// facts so callers can log the subject.
    pub fn check(&self, der: &[u8]) -> Result<CertFacts, NetError> {
        let facts = parse_cert(der)?;

        tracing::debug!(
            subject = %facts.subject,
            serial = %facts.serial,
            tier = facts.tier,
            "verifying peer certificate"
        );

        if facts.expired {
            tracing::warn!(subject = %facts.subject, "peer certificate expired");
            return Err(NetError::CertExpired);
        }

        if facts.tier == TIER_ISSUING && self.conn_manager.check_cert_out(&facts.serial) {
            tracing::warn!(
                subject = %facts.subject,
                serial = %facts.serial,
                "peer certificate revoked"
            );
            return Err(NetError::CertRevoked(facts.serial));
        }

        Ok(facts)
    }

    /// Apply the policy to a whole presented chain, end entity first.
    fn check_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), TlsError> {
        if 1 + intermediates.len() > MAX_CHAIN_DEPTH {
            return Err(TlsError::General(format!(
                "certificate chain deeper than {MAX_CHAIN_DEPTH}"
            )));
        }
        self.check(end_entity.as_ref()).map_err(to_tls_error)?;
        for inter in intermediates {
            self.check(inter.as_ref()).map_err(to_tls_error)?;
        }
        Ok(())
    }
}

fn to_tls_error(e: NetError) -> TlsError {
    match e {
        NetError::CertExpired => TlsError::InvalidCertificate(CertificateError::Expired),
        NetError::CertRevoked(_) => TlsError::InvalidCertificate(CertificateError::Revoked),
        other => TlsError::General(other.to_string()),
    }
}

// ── rustls wrappers ───────────────────────────────────────────────────────────

/// Verifies certificates presented by dialing peers: webpki chain
/// validation first, then the overlay policy.
#[derive(Debug)]
pub struct PeerClientCertVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    policy: Arc<CertPolicy>,
}

impl PeerClientCertVerifier {
    pub fn new(inner: Arc<dyn ClientCertVerifier>, policy: Arc<CertPolicy>) -> Self {
        Self { inner, policy }
    }
}

impl ClientCertVerifier for PeerClientCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;
        self.policy.check_chain(end_entity, intermediates)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Verifies certificates presented by accepting peers when this node
/// dials out. Node certificates name nodes by CN, not SAN, so a
/// name-mismatch from webpki is tolerated; every other failure is not.
#[derive(Debug)]
pub struct PeerServerCertVerifier {
    inner: Arc<dyn ServerCertVerifier>,
    policy: Arc<CertPolicy>,
}

impl PeerServerCertVerifier {
    pub fn new(inner: Arc<dyn ServerCertVerifier>, policy: Arc<CertPolicy>) -> Self {
        Self { inner, policy }
    }
}

impl ServerCertVerifier for PeerServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_) => {}
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForName)) => {
                tracing::trace!("peer certificate has no matching name; identity is the CN");
            }
            Err(e) => return Err(e),
        }
        self.policy.check_chain(end_entity, intermediates)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::Endpoint;
    use std::collections::BTreeMap;

    struct FakeManager {
        revoked: Vec<String>,
    }

    impl NodeConnManager for FakeManager {
        fn get_all_connect(&self) -> BTreeMap<String, Endpoint> {
            BTreeMap::new()
        }

        fn update_all_connect(&self, _merged: BTreeMap<String, Endpoint>) {}

        fn check_cert_out(&self, serial: &str) -> bool {
            self.revoked.iter().any(|s| s == serial)
        }
    }

    fn policy(revoked: Vec<String>) -> CertPolicy {
        CertPolicy::new(Arc::new(FakeManager { revoked }))
    }

    // rcgen-backed fixtures. The serial is chosen by the test so the
    // revocation set can name it.
    fn cert_der(ca: bool, serial: &[u8], expired: bool) -> Vec<u8> {
        use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, SerialNumber};

        let mut params = CertificateParams::new(vec!["node0".to_string()]).unwrap();
        if ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        }
        params.serial_number = Some(SerialNumber::from_slice(serial));
        if expired {
            params.not_before = rcgen::date_time_ymd(2020, 1, 1);
            params.not_after = rcgen::date_time_ymd(2021, 1, 1);
        } else {
            params.not_before = rcgen::date_time_ymd(2020, 1, 1);
            params.not_after = rcgen::date_time_ymd(2096, 1, 1);
        }

        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn parses_tier_and_serial() {
        let der = cert_der(true, &[0x2b, 0xcd], false);
        let facts = parse_cert(&der).unwrap();
        assert_eq!(facts.tier, TIER_ISSUING);
        assert_eq!(facts.serial, "2bcd");
        assert!(!facts.expired);

        let leaf = cert_der(false, &[0x01], false);
        assert_eq!(parse_cert(&leaf).unwrap().tier, 0);
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let der = cert_der(false, &[0x02], true);
        let p = policy(vec![]);
        assert!(matches!(p.check(&der), Err(NetError::CertExpired)));
    }

    #[test]
    fn revoked_issuing_tier_serial_is_rejected() {
        let der = cert_der(true, &[0x2b, 0xcd], false);
        let p = policy(vec!["2bcd".into()]);
        assert!(matches!(p.check(&der), Err(NetError::CertRevoked(s)) if s == "2bcd"));
    }

    #[test]
    fn revocation_only_applies_to_issuing_tier() {
        // Same serial, but a leaf certificate: the revocation set is not
        // consulted.
        let der = cert_der(false, &[0x2b, 0xcd], false);
        let p = policy(vec!["2bcd".into()]);
        assert!(p.check(&der).is_ok());
    }

    #[test]
    fn valid_unrevoked_certificate_passes() {
        let der = cert_der(true, &[0x10], false);
        let p = policy(vec!["ffff".into()]);
        let facts = p.check(&der).unwrap();
        assert_eq!(facts.tier, TIER_ISSUING);
        assert_eq!(facts.serial, "10");
    }
}
