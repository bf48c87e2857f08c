/// MatchFunc decides whether an inbound packet belongs to an endpoint,
/// looking only at its leading bytes.
pub type MatchFunc = Box<dyn (Fn(&[u8]) -> bool) + Send + Sync>;

/// Matches when the first byte falls in [lower..upper], per RFC 7983.
pub fn match_range(lower: u8, upper: u8) -> impl Fn(&[u8]) -> bool {
    move |buf: &[u8]| -> bool {
        if buf.is_empty() {
            return false;
        }
        buf[0] >= lower && buf[0] <= upper
    }
}

/// STUN methods are multiplexed by the ICE agent itself; the range is
/// kept for completeness and tests.
pub fn match_stun(b: &[u8]) -> bool {
    match_range(0, 3)(b)
}

/// DTLS records: first byte in [20..63].
pub fn match_dtls(b: &[u8]) -> bool {
    match_range(20, 63)(b)
}

/// SRTP and SRTCP both start in [128..191].
pub fn match_srtp_or_srtcp(b: &[u8]) -> bool {
    match_range(128, 191)(b)
}

/// RTCP compound packets carry payload types 192..=223 (RFC 5761).
pub fn is_rtcp(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[1] >= 192 && buf[1] <= 223
}

/// SRTP, i.e. the media share of the [128..191] range.
pub fn match_srtp(buf: &[u8]) -> bool {
    match_srtp_or_srtcp(buf) && !is_rtcp(buf)
}

/// SRTCP only.
pub fn match_srtcp(buf: &[u8]) -> bool {
    match_srtp_or_srtcp(buf) && is_rtcp(buf)
}
