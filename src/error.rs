use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// ErrConfigInvalid indicates a malformed option value; fatal at startup.
    #[error("invalid configuration: {0}")]
    ErrConfigInvalid(String),

    /// ErrConfigParse indicates an unreadable configuration file.
    #[error("cannot parse configuration at line {0}")]
    ErrConfigParse(usize),

    /// ErrSdpParse indicates an SDP blob the gateway could not consume.
    #[error("malformed SDP: {0}")]
    ErrSdpParse(String),

    /// ErrJsepInvalid indicates a JSEP object without the mandatory fields.
    #[error("invalid JSEP: {0}")]
    ErrJsepInvalid(String),

    /// ErrTrickleInvalid indicates a trickle candidate that is neither a
    /// candidate object nor a completion marker.
    #[error("invalid trickle candidate")]
    ErrTrickleInvalid,

    /// ErrHandleNotFound indicates an operation on an unknown handle id.
    #[error("no such handle")]
    ErrHandleNotFound,

    /// ErrSessionNotFound indicates an operation on an unknown session id.
    #[error("no such session")]
    ErrSessionNotFound,

    /// ErrPluginNotFound indicates an attach to an unregistered plugin.
    #[error("no such plugin")]
    ErrPluginNotFound,

    /// ErrPluginAttached indicates a second attach on the same handle.
    #[error("plugin already attached")]
    ErrPluginAttached,

    /// ErrPluginDetached indicates a plugin operation before attach.
    #[error("no plugin attached")]
    ErrPluginDetached,

    /// ErrPluginVersion indicates an API compatibility mismatch at
    /// registration; the plugin is refused.
    #[error("plugin API version mismatch")]
    ErrPluginVersion,

    /// ErrWebrtcStopped indicates an operation on a handle past hangup;
    /// callers on the media path treat this as a silent drop.
    #[error("handle stopped")]
    ErrWebrtcStopped,

    /// ErrNoAgent indicates a WebRTC operation before setup_local.
    #[error("ICE agent not initialized")]
    ErrNoAgent,

    /// ErrIceFailed indicates connectivity checks failed past the grace
    /// period.
    #[error("ICE failed")]
    ErrIceFailed,

    /// ErrDtlsFingerprint indicates the certificate exposed during the
    /// handshake does not match the one signalled in the SDP.
    #[error("DTLS fingerprint mismatch")]
    ErrDtlsFingerprint,

    /// ErrDtlsNoCertificate indicates the peer completed the handshake
    /// without exposing a certificate.
    #[error("no remote DTLS certificate")]
    ErrDtlsNoCertificate,

    /// ErrDtlsNotReady indicates SRTP traffic before key export.
    #[error("DTLS-SRTP not established")]
    ErrDtlsNotReady,

    /// ErrSrtpUnprotect indicates a single failed SRTP authentication;
    /// the packet is dropped and counted, the session stays up.
    #[error("SRTP unprotect failed")]
    ErrSrtpUnprotect,

    /// ErrAuthInvalidToken indicates the auth collaborator rejected a token.
    #[error("unauthorized request (wrong or missing secret/token)")]
    ErrAuthInvalidToken,

    /// ErrQueueFull indicates the outbound queue evicted its oldest entry;
    /// non-fatal, surfaced for accounting only.
    #[error("outbound queue full")]
    ErrQueueFull,

    #[error("{0}")]
    ErrOther(String),

    #[error("parse int: {0}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("util error: {0}")]
    Util(#[from] util::Error),

    #[error("ice error: {0}")]
    Ice(#[from] ice::Error),

    #[error("dtls error: {0}")]
    Dtls(#[from] dtls::Error),

    #[error("srtp error: {0}")]
    Srtp(#[from] srtp::Error),

    #[error("rtp error: {0}")]
    Rtp(#[from] rtp::Error),

    #[error("rtcp error: {0}")]
    Rtcp(#[from] rtcp::Error),

    #[error("sdp error: {0}")]
    Sdp(#[from] sdp::Error),

    #[error("sctp error: {0}")]
    Sctp(#[from] sctp::Error),

    #[error("data channel error: {0}")]
    Data(#[from] data::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn new(msg: String) -> Self {
        Error::ErrOther(msg)
    }
}
