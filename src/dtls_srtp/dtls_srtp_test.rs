use super::*;

#[test]
fn test_role_from_remote_setup() -> Result<()> {
    assert_eq!(DtlsRole::from_remote_setup("active")?, DtlsRole::Server);
    assert_eq!(DtlsRole::from_remote_setup("passive")?, DtlsRole::Client);
    assert_eq!(DtlsRole::from_remote_setup("actpass")?, DtlsRole::Client);
    assert!(DtlsRole::from_remote_setup("holdconn").is_err());
    Ok(())
}

#[test]
fn test_setup_attribute() {
    assert_eq!(DtlsRole::ActPass.setup_attribute(), "actpass");
    assert_eq!(DtlsRole::Client.setup_attribute(), "active");
    assert_eq!(DtlsRole::Server.setup_attribute(), "passive");
}

#[test]
fn test_certificate_fingerprint_shape() -> Result<()> {
    let cert = generate_certificate(vec!["rtc-gateway".to_owned()])?;
    let fingerprint = certificate_fingerprint(&cert);

    // 32 hash bytes, colon separated: 64 hex chars + 31 colons.
    assert_eq!(fingerprint.len(), 95);
    assert!(fingerprint
        .split(':')
        .all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit())));
    assert_eq!(fingerprint, fingerprint.to_ascii_lowercase());

    // Stable for the same certificate.
    assert_eq!(fingerprint, certificate_fingerprint(&cert));

    Ok(())
}

#[test]
fn test_unknown_digest_refused() {
    assert!(digest_fingerprint("md5", &[1, 2, 3]).is_none());
    assert!(digest_fingerprint("sha-256", &[1, 2, 3]).is_some());
}
