#[cfg(test)]
mod sdp_utils_test;

use std::io::Cursor;

use sdp::description::media::MediaDescription;
use sdp::description::session::SessionDescription;
use serde::{Deserialize, Serialize};

use crate::dtls_srtp::DtlsRole;
use crate::error::{Error, Result};
use crate::rtp_engine::{
    self, EXTMAP_RTP_STREAM_ID, EXTMAP_TRANSPORT_WIDE_CC,
};
use crate::stream::Stream;

/// JSEP wrapper around an SDP blob, as exchanged with peers and plugins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub jsep_type: JsepType,
    pub sdp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trickle: Option<bool>,
    /// Set by the core on renegotiations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<bool>,
    /// Set by plugins to force an ICE restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepType {
    Offer,
    Answer,
}

impl Jsep {
    pub fn offer(sdp: String) -> Self {
        Jsep {
            jsep_type: JsepType::Offer,
            sdp,
            trickle: None,
            update: None,
            restart: None,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Jsep {
            jsep_type: JsepType::Answer,
            sdp,
            trickle: None,
            update: None,
            restart: None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::ErrJsepInvalid(e.to_string()))
    }

    pub fn is_offer(&self) -> bool {
        self.jsep_type == JsepType::Offer
    }
}

/// What the remote description declared, beyond the fields written
/// straight into the stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub audio: bool,
    pub video: bool,
    pub data: bool,
    pub trickle: bool,
}

fn is_audio_codec(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "opus" | "pcmu" | "pcma" | "g722" | "isac"
    )
}

fn is_video_codec(name: &str) -> bool {
    matches!(name.to_ascii_lowercase().as_str(), "vp8" | "vp9" | "h264" | "av1")
}

/// Extracts from a remote description everything the session engine
/// consumes: ICE credentials, DTLS fingerprint and role, codecs and
/// payload types, SSRC layout (including FID/SIM groups and RIDs), the
/// extension ids the gateway tracks, and media directions.
pub fn apply_remote_sdp(stream: &mut Stream, sdp_str: &str) -> Result<RemoteMedia> {
    let mut cursor = Cursor::new(sdp_str.as_bytes());
    let parsed = SessionDescription::unmarshal(&mut cursor)
        .map_err(|e| Error::ErrSdpParse(e.to_string()))?;

    let mut remote = RemoteMedia::default();

    if let Some(ufrag) = parsed.attribute("ice-ufrag") {
        stream.ruser = Some(ufrag.clone());
    }
    if let Some(pwd) = parsed.attribute("ice-pwd") {
        stream.rpass = Some(pwd.clone());
    }
    if let Some(options) = parsed.attribute("ice-options") {
        remote.trickle |= options.split(' ').any(|o| o == "trickle");
    }
    if let Some(fingerprint) = parsed.attribute("fingerprint") {
        apply_fingerprint(stream, fingerprint)?;
    }

    for media in &parsed.media_descriptions {
        let kind = media.media_name.media.as_str();
        match kind {
            "audio" => remote.audio = true,
            "video" => remote.video = true,
            "application" => {
                remote.data = true;
                if let Some(Some(mid)) = media.attribute("mid") {
                    stream.data_mid = mid.to_owned();
                }
                continue;
            }
            _ => continue,
        }
        let video = kind == "video";

        if let Some(Some(mid)) = media.attribute("mid") {
            if video {
                stream.video_mid = mid.to_owned();
            } else {
                stream.audio_mid = mid.to_owned();
            }
        }
        if let Some(Some(ufrag)) = media.attribute("ice-ufrag") {
            stream.ruser = Some(ufrag.to_owned());
        }
        if let Some(Some(pwd)) = media.attribute("ice-pwd") {
            stream.rpass = Some(pwd.to_owned());
        }
        if let Some(Some(options)) = media.attribute("ice-options") {
            remote.trickle |= options.split(' ').any(|o| o == "trickle");
        }
        if let Some(Some(fingerprint)) = media.attribute("fingerprint") {
            apply_fingerprint(stream, fingerprint)?;
        }
        if let Some(Some(setup)) = media.attribute("setup") {
            stream.dtls_role = DtlsRole::from_remote_setup(setup)?;
        }

        // Directions are the peer's: their sendonly is our recv-only leg.
        let (send, recv) = if media.attribute("sendrecv").is_some() {
            (true, true)
        } else if media.attribute("sendonly").is_some() {
            (false, true)
        } else if media.attribute("recvonly").is_some() {
            (true, false)
        } else if media.attribute("inactive").is_some() {
            (false, false)
        } else {
            (true, true)
        };
        if video {
            stream.video_send = send;
            stream.video_recv = recv;
        } else {
            stream.audio_send = send;
            stream.audio_recv = recv;
        }

        apply_codecs(stream, media, video)?;
        apply_extmaps(stream, media, video);
        apply_ssrcs(stream, media, video)?;
    }

    if stream.ruser.is_none() || stream.rpass.is_none() {
        return Err(Error::ErrSdpParse("missing ice-ufrag/ice-pwd".to_owned()));
    }

    // Bind the keyframe classifier to whatever video codec came out of
    // the negotiation.
    stream.video_is_keyframe = stream
        .video_codec
        .as_deref()
        .and_then(rtp_engine::keyframe_classifier);

    Ok(remote)
}

fn apply_fingerprint(stream: &mut Stream, fingerprint: &str) -> Result<()> {
    let (hashing, digest) = fingerprint
        .split_once(' ')
        .ok_or_else(|| Error::ErrSdpParse(format!("a=fingerprint:{fingerprint}")))?;
    stream.remote_hashing = Some(hashing.to_owned());
    stream.remote_fingerprint = Some(digest.to_owned());
    Ok(())
}

fn apply_codecs(stream: &mut Stream, media: &MediaDescription, video: bool) -> Result<()> {
    // rtpmap scan: first recognized codec wins, rtx payload types are
    // remembered so their fmtp apt= lines can be tied back.
    let mut rtx_pts = vec![];
    for attr in &media.attributes {
        if attr.key != "rtpmap" {
            continue;
        }
        let value = attr.value.as_deref().unwrap_or_default();
        let (pt, codec) = match value.split_once(' ') {
            Some((pt, rest)) => (pt.parse::<u8>()?, rest),
            None => continue,
        };
        let name = codec.split('/').next().unwrap_or_default();

        if name.eq_ignore_ascii_case("rtx") {
            rtx_pts.push(pt);
        } else if video && stream.video_payload_type.is_none() && is_video_codec(name) {
            stream.video_payload_type = Some(pt);
            stream.video_codec = Some(name.to_ascii_lowercase());
        } else if !video && stream.audio_payload_type.is_none() && is_audio_codec(name) {
            stream.audio_payload_type = Some(pt);
            stream.audio_codec = Some(name.to_ascii_lowercase());
        }
    }

    for attr in &media.attributes {
        match attr.key.as_str() {
            "fmtp" => {
                let value = attr.value.as_deref().unwrap_or_default();
                if let Some((pt, params)) = value.split_once(' ') {
                    let pt = pt.parse::<u8>().unwrap_or(0);
                    if rtx_pts.contains(&pt) {
                        if let Some(apt) = params
                            .split(';')
                            .find_map(|p| p.trim().strip_prefix("apt="))
                        {
                            let apt = apt.trim().parse::<u8>()?;
                            stream.rtx_payload_types.insert(pt, apt);
                            if video && stream.video_payload_type == Some(apt) {
                                stream.video_rtx_payload_type = Some(pt);
                            }
                        }
                    }
                }
            }
            "rtcp-fb" => {
                let value = attr.value.as_deref().unwrap_or_default();
                if let Some((_pt, fb)) = value.split_once(' ') {
                    if fb == "nack" {
                        if video {
                            stream.component.do_video_nacks = true;
                        } else {
                            stream.component.do_audio_nacks = true;
                        }
                    } else if fb == "transport-cc" && video {
                        stream.twcc.enabled = true;
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn apply_extmaps(stream: &mut Stream, media: &MediaDescription, video: bool) {
    for attr in &media.attributes {
        if attr.key != "extmap" {
            continue;
        }
        let value = attr.value.as_deref().unwrap_or_default();
        let (id_part, uri) = match value.split_once(' ') {
            Some(parts) => parts,
            None => continue,
        };
        // "3/sendonly" style direction suffixes are ignored.
        let id = id_part
            .split('/')
            .next()
            .and_then(|i| i.parse::<u8>().ok());
        let id = match id {
            Some(id) => id,
            None => continue,
        };
        if video && uri == EXTMAP_TRANSPORT_WIDE_CC {
            stream.twcc.ext_id = id;
        } else if video && uri == EXTMAP_RTP_STREAM_ID {
            stream.rid_ext_id = Some(id);
        }
    }
}

fn apply_ssrcs(stream: &mut Stream, media: &MediaDescription, video: bool) -> Result<()> {
    // ssrc-group FID pairs media SSRCs with their RTX companions;
    // ssrc-group SIM enumerates the simulcast layers low-to-high.
    let mut sim: Vec<u32> = vec![];
    let mut fid: Vec<(u32, u32)> = vec![];
    for attr in &media.attributes {
        if attr.key != "ssrc-group" {
            continue;
        }
        let value = attr.value.as_deref().unwrap_or_default();
        let mut parts = value.split_whitespace();
        match parts.next() {
            Some("FID") => {
                let a = parts.next().map(str::parse).transpose()?;
                let b = parts.next().map(str::parse).transpose()?;
                if let (Some(a), Some(b)) = (a, b) {
                    fid.push((a, b));
                }
            }
            Some("SIM") => {
                for p in parts {
                    sim.push(p.parse()?);
                }
            }
            _ => {}
        }
    }

    let mut rid_index = 0usize;
    for attr in &media.attributes {
        match attr.key.as_str() {
            "ssrc" => {
                let value = attr.value.as_deref().unwrap_or_default();
                let ssrc: u32 = match value.split_whitespace().next().map(str::parse) {
                    Some(Ok(ssrc)) => ssrc,
                    _ => continue,
                };
                if !video {
                    if stream.audio_ssrc_peer == 0 {
                        stream.audio_ssrc_peer = ssrc;
                    }
                } else if !sim.is_empty() {
                    // SIM group is authoritative for layer order.
                } else if fid.iter().any(|&(_, rtx)| rtx == ssrc) {
                    // placed below via the FID pairs
                } else if !stream.video_ssrc_peer.contains(&ssrc) {
                    if let Some(slot) = stream.video_ssrc_peer.iter_mut().find(|s| **s == 0) {
                        *slot = ssrc;
                    }
                }
            }
            "rid" => {
                // `a=rid:<id> recv ...`
                let value = attr.value.as_deref().unwrap_or_default();
                if let Some(rid) = value.split_whitespace().next() {
                    if rid_index < 3 {
                        stream.rid[rid_index] = Some(rid.to_owned());
                        rid_index += 1;
                    }
                }
            }
            _ => {}
        }
    }

    if video {
        for (layer, &ssrc) in sim.iter().take(3).enumerate() {
            stream.video_ssrc_peer[layer] = ssrc;
        }
        for &(media_ssrc, rtx_ssrc) in &fid {
            if let Some(layer) = stream
                .video_ssrc_peer
                .iter()
                .position(|&s| s == media_ssrc)
            {
                stream.video_ssrc_peer_rtx[layer] = rtx_ssrc;
            } else if let Some(slot) = stream.video_ssrc_peer.iter_mut().find(|s| **s == 0) {
                *slot = media_ssrc;
                let layer = stream
                    .video_ssrc_peer
                    .iter()
                    .position(|&s| s == media_ssrc)
                    .unwrap_or(0);
                stream.video_ssrc_peer_rtx[layer] = rtx_ssrc;
            }
        }
    }

    Ok(())
}

/// Everything needed to compile a local description.
pub struct LocalSdpOptions {
    pub is_offer: bool,
    pub audio: bool,
    pub video: bool,
    pub data: bool,
    pub ufrag: String,
    pub pwd: String,
    pub fingerprint: String,
    pub setup: &'static str,
    /// Marshalled candidate lines (no `a=candidate:` prefix); empty when
    /// trickling.
    pub candidates: Vec<String>,
    pub trickle: bool,
    pub rfc4588: bool,
}

/// Compiles the gateway's local description: one bundled set of m-lines
/// sharing a single ufrag/pwd and fingerprint.
pub fn generate_local_sdp(stream: &Stream, opts: &LocalSdpOptions) -> String {
    let mut bundle = "BUNDLE".to_owned();
    if opts.audio {
        bundle.push(' ');
        bundle.push_str(&stream.audio_mid);
    }
    if opts.video {
        bundle.push(' ');
        bundle.push_str(&stream.video_mid);
    }
    if opts.data {
        bundle.push(' ');
        bundle.push_str(&stream.data_mid);
    }

    let mut session = SessionDescription::new_jsep_session_description(false)
        .with_value_attribute("group".to_owned(), bundle)
        .with_value_attribute("msid-semantic".to_owned(), " WMS rtcgateway".to_owned());

    if opts.audio {
        let pt = stream.audio_payload_type.unwrap_or(111);
        let codec = stream.audio_codec.clone().unwrap_or_else(|| "opus".to_owned());
        let (clock, channels) = if codec == "opus" { (48_000, 2) } else { (8_000, 1) };
        let mut media =
            MediaDescription::new_jsep_media_description("audio".to_owned(), vec![])
                .with_value_attribute("mid".to_owned(), stream.audio_mid.clone())
                .with_codec(pt, codec, clock, channels, String::new())
                .with_property_attribute(direction(stream.audio_send, stream.audio_recv))
                .with_property_attribute("rtcp-mux".to_owned());
        media = common_transport(media, stream, opts);
        media = media.with_value_attribute(
            "ssrc".to_owned(),
            format!("{} cname:rtcgateway", stream.audio_ssrc),
        );
        session = session.with_media(media);
    }

    if opts.video {
        let pt = stream.video_payload_type.unwrap_or(96);
        let codec = stream.video_codec.clone().unwrap_or_else(|| "vp8".to_owned());
        let mut media =
            MediaDescription::new_jsep_media_description("video".to_owned(), vec![])
                .with_value_attribute("mid".to_owned(), stream.video_mid.clone())
                .with_codec(pt, codec.clone(), 90_000, 0, String::new())
                .with_property_attribute(direction(stream.video_send, stream.video_recv))
                .with_property_attribute("rtcp-mux".to_owned())
                .with_value_attribute("rtcp-fb".to_owned(), format!("{pt} nack"))
                .with_value_attribute("rtcp-fb".to_owned(), format!("{pt} nack pli"))
                .with_value_attribute("rtcp-fb".to_owned(), format!("{pt} ccm fir"))
                .with_value_attribute("rtcp-fb".to_owned(), format!("{pt} goog-remb"));
        if stream.twcc.enabled && stream.twcc.ext_id != 0 {
            media = media
                .with_value_attribute("rtcp-fb".to_owned(), format!("{pt} transport-cc"))
                .with_value_attribute(
                    "extmap".to_owned(),
                    format!("{} {}", stream.twcc.ext_id, EXTMAP_TRANSPORT_WIDE_CC),
                );
        }
        media = common_transport(media, stream, opts);
        if opts.rfc4588 {
            if let Some(rtx_pt) = stream.video_rtx_payload_type {
                media = media
                    .with_codec(rtx_pt, "rtx".to_owned(), 90_000, 0, format!("apt={pt}"))
                    .with_value_attribute(
                        "ssrc-group".to_owned(),
                        format!("FID {} {}", stream.video_ssrc, stream.video_ssrc_rtx),
                    )
                    .with_value_attribute(
                        "ssrc".to_owned(),
                        format!("{} cname:rtcgateway", stream.video_ssrc_rtx),
                    );
            }
        }
        media = media.with_value_attribute(
            "ssrc".to_owned(),
            format!("{} cname:rtcgateway", stream.video_ssrc),
        );
        session = session.with_media(media);
    }

    if opts.data {
        let mut media = MediaDescription {
            media_name: sdp::description::media::MediaName {
                media: "application".to_owned(),
                port: sdp::description::media::RangedPort {
                    value: 9,
                    range: None,
                },
                protos: vec!["UDP".to_owned(), "DTLS".to_owned(), "SCTP".to_owned()],
                formats: vec!["webrtc-datachannel".to_owned()],
            },
            ..MediaDescription::new_jsep_media_description("application".to_owned(), vec![])
        };
        media = media
            .with_value_attribute("mid".to_owned(), stream.data_mid.clone())
            .with_value_attribute("sctp-port".to_owned(), "5000".to_owned());
        media = common_transport(media, stream, opts);
        session = session.with_media(media);
    }

    session.marshal()
}

fn direction(send: bool, recv: bool) -> String {
    match (send, recv) {
        (true, true) => "sendrecv",
        (true, false) => "sendonly",
        (false, true) => "recvonly",
        (false, false) => "inactive",
    }
    .to_owned()
}

fn common_transport(
    mut media: MediaDescription,
    _stream: &Stream,
    opts: &LocalSdpOptions,
) -> MediaDescription {
    media = media
        .with_ice_credentials(opts.ufrag.clone(), opts.pwd.clone())
        .with_fingerprint("sha-256".to_owned(), opts.fingerprint.clone())
        .with_value_attribute("setup".to_owned(), opts.setup.to_owned());
    if opts.trickle {
        media = media.with_value_attribute("ice-options".to_owned(), "trickle".to_owned());
    } else {
        for candidate in &opts.candidates {
            media = media.with_candidate(candidate.clone());
        }
        media = media.with_property_attribute("end-of-candidates".to_owned());
    }
    media
}
