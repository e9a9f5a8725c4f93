//! Certificate fixtures for unit tests.

use overnet_core::certificate::{new_self_signed, sign_certificate_request, DEFAULT_CERT_TTL};
use overnet_core::{Certificate, CertificateRequest, KeyUsage, Keypair, Network};

pub fn root(name: &str) -> (Keypair, Certificate) {
    let kp = Keypair::generate();
    let cert = new_self_signed(&kp, KeyUsage::PEER | KeyUsage::SIGN, DEFAULT_CERT_TTL, name);
    (kp, cert)
}

fn network(id: u64, certificate: Certificate) -> Network {
    Network {
        id,
        name: format!("net-{id}"),
        certificate,
        alt_profile_name: String::new(),
        root_key: None,
    }
}

/// First-level member certificate for `profile_key`.
pub fn member_network(id: u64, root_kp: &Keypair, root_cert: &Certificate, profile_key: &Keypair) -> Network {
    let csr = CertificateRequest::new(profile_key, KeyUsage::PEER | KeyUsage::SIGN, "member");
    let cert = sign_certificate_request(&csr, DEFAULT_CERT_TTL, root_kp).with_parent(root_cert.clone());
    network(id, cert)
}

/// Invitation certificate for `profile_key`, one hop below a member.
pub fn provisional_network(
    id: u64,
    root_kp: &Keypair,
    root_cert: &Certificate,
    profile_key: &Keypair,
) -> Network {
    let inviter = Keypair::generate();
    let inviter_cert = member_network(0, root_kp, root_cert, &inviter).certificate;
    let csr = CertificateRequest::new(profile_key, KeyUsage::PEER, "invitee");
    let cert = sign_certificate_request(&csr, DEFAULT_CERT_TTL, &inviter).with_parent(inviter_cert);
    network(id, cert)
}
