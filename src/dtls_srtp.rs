#[cfg(test)]
mod dtls_srtp_test;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dtls::config::ClientAuthType;
use dtls::conn::DTLSConn;
use dtls::crypto::Certificate;
use dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use log::{debug, warn};
use sha2::{Digest, Sha256, Sha384, Sha512};
use srtp::context::Context;
use srtp::protection_profile::ProtectionProfile;
use tokio::sync::Mutex;
use util::Conn;

use crate::error::{Error, Result};

/// Consecutive SRTP auth failures tolerated before the handle is hung up.
const SRTP_ERROR_BURST: u32 = 10;

/// DTLS role of the gateway for a stream, derived from the SDP `setup`
/// attribute of the peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    /// Offerer side before the answer arrives.
    #[default]
    ActPass,
    Client,
    Server,
}

impl DtlsRole {
    /// The role complementary to the remote `a=setup:` value:
    /// remote active -> local server, remote passive -> local client,
    /// remote actpass -> local client.
    pub fn from_remote_setup(setup: &str) -> Result<Self> {
        match setup {
            "active" => Ok(DtlsRole::Server),
            "passive" => Ok(DtlsRole::Client),
            "actpass" => Ok(DtlsRole::Client),
            _ => Err(Error::ErrSdpParse(format!("a=setup:{setup}"))),
        }
    }

    /// What we put in our own SDP.
    pub fn setup_attribute(&self) -> &'static str {
        match self {
            DtlsRole::ActPass => "actpass",
            DtlsRole::Client => "active",
            DtlsRole::Server => "passive",
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self, DtlsRole::Client | DtlsRole::ActPass)
    }
}

/// Generates the self-signed certificate a gateway instance presents.
pub fn generate_certificate(subject_names: Vec<String>) -> Result<Certificate> {
    Ok(Certificate::generate_self_signed(subject_names)?)
}

/// sha-256 fingerprint of a certificate, colon-separated lowercase hex,
/// the way it is written into `a=fingerprint:`.
pub fn certificate_fingerprint(cert: &Certificate) -> String {
    let der = cert.certificate[0].as_ref();
    digest_fingerprint("sha-256", der).unwrap_or_default()
}

fn digest_fingerprint(algorithm: &str, der: &[u8]) -> Option<String> {
    let hashed: Vec<u8> = match algorithm {
        "sha-256" => Sha256::digest(der).to_vec(),
        "sha-384" => Sha384::digest(der).to_vec(),
        "sha-512" => Sha512::digest(der).to_vec(),
        _ => return None,
    };
    let values: Vec<String> = hashed.iter().map(|x| format!("{x:02x}")).collect();
    Some(values.join(":"))
}

/// The DTLS-SRTP transport of a component: handshake driver, fingerprint
/// validation and the inbound/outbound SRTP contexts keyed per RFC 5764.
///
/// Handshake retransmissions on loss are driven by the dtls crate's own
/// timer; the gateway only decides the role and validates the result.
pub struct DtlsSrtp {
    conn: Arc<DTLSConn>,
    role: DtlsRole,
    profile: ProtectionProfile,
    srtp_in: Mutex<Context>,
    srtp_out: Mutex<Context>,
    auth_failures: AtomicU32,
}

impl DtlsSrtp {
    /// Runs the handshake over the DTLS endpoint of the mux and installs
    /// the SRTP contexts. `remote_hashing`/`remote_fingerprint` come from
    /// the SDP; a mismatch with the certificate exposed in the handshake
    /// tears the connection down.
    pub async fn handshake(
        endpoint: Arc<dyn Conn + Send + Sync>,
        certificate: Certificate,
        role: DtlsRole,
        remote_hashing: &str,
        remote_fingerprint: &str,
    ) -> Result<Self> {
        let dtls_config = dtls::config::Config {
            certificates: vec![certificate],
            srtp_protection_profiles: vec![
                SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm,
                SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80,
            ],
            client_auth: ClientAuthType::RequireAnyClientCert,
            insecure_skip_verify: true,
            ..Default::default()
        };

        let is_client = role.is_client();
        let conn = DTLSConn::new(endpoint, dtls_config, is_client, None).await?;

        let profile = match conn.selected_srtpprotection_profile() {
            SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm => ProtectionProfile::AeadAes128Gcm,
            SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80 => {
                ProtectionProfile::Aes128CmHmacSha1_80
            }
            _ => {
                let _ = conn.close().await;
                return Err(Error::ErrDtlsNotReady);
            }
        };

        let state = conn.connection_state().await;
        let remote_certs = &state.peer_certificates;
        if remote_certs.is_empty() {
            let _ = conn.close().await;
            return Err(Error::ErrDtlsNoCertificate);
        }
        let computed = digest_fingerprint(&remote_hashing.to_ascii_lowercase(), &remote_certs[0])
            .ok_or_else(|| {
                Error::ErrSdpParse(format!("unsupported fingerprint hash {remote_hashing}"))
            })?;
        if !computed.eq_ignore_ascii_case(remote_fingerprint) {
            warn!(
                "fingerprint mismatch: got {computed}, expected {}",
                remote_fingerprint.to_ascii_lowercase()
            );
            let _ = conn.close().await;
            return Err(Error::ErrDtlsFingerprint);
        }
        debug!("fingerprint verified ({remote_hashing})");

        // RFC 5764 keying material, split by handshake role.
        let mut srtp_config = srtp::config::Config {
            profile,
            ..Default::default()
        };
        srtp_config
            .extract_session_keys_from_dtls(state, is_client)
            .await?;

        let srtp_out = Context::new(
            &srtp_config.keys.local_master_key,
            &srtp_config.keys.local_master_salt,
            profile,
            None,
            None,
        )?;
        let srtp_in = Context::new(
            &srtp_config.keys.remote_master_key,
            &srtp_config.keys.remote_master_salt,
            profile,
            Some(srtp::option::srtp_replay_protection(64)),
            Some(srtp::option::srtcp_replay_protection(64)),
        )?;

        Ok(DtlsSrtp {
            conn: Arc::new(conn),
            role,
            profile,
            srtp_in: Mutex::new(srtp_in),
            srtp_out: Mutex::new(srtp_out),
            auth_failures: AtomicU32::new(0),
        })
    }

    pub fn role(&self) -> DtlsRole {
        self.role
    }

    pub fn profile(&self) -> ProtectionProfile {
        self.profile
    }

    pub fn conn(&self) -> Arc<DTLSConn> {
        Arc::clone(&self.conn)
    }

    pub async fn protect_rtp(&self, plaintext: &[u8]) -> Result<Bytes> {
        let mut ctx = self.srtp_out.lock().await;
        Ok(ctx.encrypt_rtp(plaintext)?)
    }

    pub async fn protect_rtcp(&self, plaintext: &[u8]) -> Result<Bytes> {
        let mut ctx = self.srtp_out.lock().await;
        Ok(ctx.encrypt_rtcp(plaintext)?)
    }

    /// Unprotects an inbound SRTP packet; a burst of consecutive
    /// authentication failures is reported so the caller can hang up.
    pub async fn unprotect_rtp(&self, encrypted: &[u8]) -> Result<Bytes> {
        let mut ctx = self.srtp_in.lock().await;
        match ctx.decrypt_rtp(encrypted) {
            Ok(buf) => {
                self.auth_failures.store(0, Ordering::Relaxed);
                Ok(buf)
            }
            Err(err) => {
                let failures = self.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= SRTP_ERROR_BURST {
                    Err(Error::Srtp(err))
                } else {
                    debug!("SRTP unprotect error ({failures} recent): {err}");
                    Err(Error::ErrSrtpUnprotect)
                }
            }
        }
    }

    pub async fn unprotect_rtcp(&self, encrypted: &[u8]) -> Result<Bytes> {
        let mut ctx = self.srtp_in.lock().await;
        match ctx.decrypt_rtcp(encrypted) {
            Ok(buf) => {
                self.auth_failures.store(0, Ordering::Relaxed);
                Ok(buf)
            }
            Err(err) => {
                let failures = self.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= SRTP_ERROR_BURST {
                    Err(Error::Srtp(err))
                } else {
                    debug!("SRTCP unprotect error ({failures} recent): {err}");
                    Err(Error::ErrSrtpUnprotect)
                }
            }
        }
    }

    /// Raw DTLS application data write; used by the data-channel stack.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.conn.write(buf, None).await?)
    }

    pub async fn close(&self) -> Result<()> {
        Ok(self.conn.close().await?)
    }
}
