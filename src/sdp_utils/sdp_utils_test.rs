use serde_json::json;

use super::*;
use crate::stream::SsrcClass;

const REMOTE_OFFER: &str = "v=0\r\n\
o=- 621762929297409 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1 2\r\n\
a=msid-semantic: WMS rtcgateway\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtcp-mux\r\n\
a=ice-ufrag:abcd\r\n\
a=ice-pwd:efghijklmnopqrstuvwx\r\n\
a=ice-options:trickle\r\n\
a=fingerprint:sha-256 d2:b9:31:8f:df:24:d8:0e:ed:d2:ef:25:9e:af:6d:ec:b1:31:d3:8a:b6:2f:45:5f:7a:8f:6b:0a:81:27:82:7b\r\n\
a=setup:actpass\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=ssrc:11111 cname:user\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtcp-fb:96 nack pli\r\n\
a=rtcp-fb:96 ccm fir\r\n\
a=rtcp-fb:96 transport-cc\r\n\
a=extmap:3 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=ssrc-group:FID 22222 33333\r\n\
a=ssrc:22222 cname:user\r\n\
a=ssrc:33333 cname:user\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:2\r\n\
a=sctp-port:5000\r\n";

#[test]
fn test_apply_remote_offer() -> Result<()> {
    let mut stream = Stream::new(512);
    let remote = apply_remote_sdp(&mut stream, REMOTE_OFFER)?;

    assert!(remote.audio && remote.video && remote.data);
    assert!(remote.trickle);

    assert_eq!(stream.ruser.as_deref(), Some("abcd"));
    assert_eq!(stream.rpass.as_deref(), Some("efghijklmnopqrstuvwx"));
    assert_eq!(stream.remote_hashing.as_deref(), Some("sha-256"));
    assert!(stream
        .remote_fingerprint
        .as_deref()
        .unwrap()
        .starts_with("d2:b9:31"));
    assert_eq!(stream.dtls_role, DtlsRole::Client);

    assert_eq!(stream.audio_codec.as_deref(), Some("opus"));
    assert_eq!(stream.audio_payload_type, Some(111));
    assert_eq!(stream.video_codec.as_deref(), Some("vp8"));
    assert_eq!(stream.video_payload_type, Some(96));
    assert_eq!(stream.video_rtx_payload_type, Some(97));
    assert_eq!(stream.media_payload_type(97), Some(96));
    assert!(stream.video_is_keyframe.is_some());

    assert_eq!(stream.audio_mid, "0");
    assert_eq!(stream.video_mid, "1");
    assert_eq!(stream.data_mid, "2");

    // The peer only sends video, so our video leg is receive-only.
    assert!(stream.audio_send && stream.audio_recv);
    assert!(!stream.video_send && stream.video_recv);

    assert!(stream.component.do_video_nacks);
    assert!(!stream.component.do_audio_nacks);
    assert!(stream.twcc.enabled);
    assert_eq!(stream.twcc.ext_id, 3);

    assert_eq!(stream.audio_ssrc_peer, 11111);
    assert_eq!(stream.video_ssrc_peer[0], 22222);
    assert_eq!(stream.video_ssrc_peer_rtx[0], 33333);
    assert_eq!(stream.classify_ssrc(11111), SsrcClass::Audio);
    assert_eq!(stream.classify_ssrc(22222), SsrcClass::Video(0));
    assert_eq!(stream.classify_ssrc(33333), SsrcClass::VideoRtx(0));
    assert_eq!(stream.classify_ssrc(44444), SsrcClass::Unknown);

    Ok(())
}

#[test]
fn test_apply_simulcast_sim_group() -> Result<()> {
    let sdp = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:u\r\n\
a=ice-pwd:pppppppppppppppppppppp\r\n\
a=fingerprint:sha-256 aa:bb\r\n\
a=setup:active\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=ssrc-group:SIM 100 200 300\r\n\
a=ssrc:100 cname:u\r\n\
a=ssrc:200 cname:u\r\n\
a=ssrc:300 cname:u\r\n";

    let mut stream = Stream::new(512);
    apply_remote_sdp(&mut stream, sdp)?;

    assert_eq!(stream.video_ssrc_peer, [100, 200, 300]);
    assert_eq!(stream.classify_ssrc(200), SsrcClass::Video(1));
    assert_eq!(stream.dtls_role, DtlsRole::Server);
    Ok(())
}

#[test]
fn test_apply_rid_simulcast() -> Result<()> {
    let sdp = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:u\r\n\
a=ice-pwd:pppppppppppppppppppppp\r\n\
a=fingerprint:sha-256 aa:bb\r\n\
a=setup:passive\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=extmap:4 urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id\r\n\
a=rid:h recv\r\n\
a=rid:m recv\r\n\
a=rid:l recv\r\n\
a=simulcast:recv h;m;l\r\n";

    let mut stream = Stream::new(512);
    apply_remote_sdp(&mut stream, sdp)?;

    assert_eq!(stream.rid_ext_id, Some(4));
    assert_eq!(stream.rid[0].as_deref(), Some("h"));
    assert_eq!(stream.rid[2].as_deref(), Some("l"));

    // SSRCs are learned on the fly from the rid header extension.
    assert_eq!(stream.learn_ssrc_from_rid(5555, "m"), Some(1));
    assert_eq!(stream.video_ssrc_peer[1], 5555);
    assert_eq!(stream.classify_ssrc(5555), SsrcClass::Video(1));
    assert_eq!(stream.learn_ssrc_from_rid(6666, "x"), None);
    Ok(())
}

#[test]
fn test_missing_credentials_rejected() {
    let sdp = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n";
    let mut stream = Stream::new(512);
    assert!(apply_remote_sdp(&mut stream, sdp).is_err());
}

#[test]
fn test_generate_local_sdp() -> Result<()> {
    let mut stream = Stream::new(512);
    stream.audio_payload_type = Some(111);
    stream.audio_codec = Some("opus".to_owned());
    stream.video_payload_type = Some(96);
    stream.video_codec = Some("vp8".to_owned());
    stream.video_rtx_payload_type = Some(97);
    stream.audio_send = true;
    stream.audio_recv = true;
    stream.video_send = true;
    stream.video_recv = true;
    stream.twcc.enabled = true;
    stream.twcc.ext_id = 3;

    let opts = LocalSdpOptions {
        is_offer: true,
        audio: true,
        video: true,
        data: true,
        ufrag: "localufrag".to_owned(),
        pwd: "localpwdlocalpwdlocalpwd".to_owned(),
        fingerprint: "aa:bb:cc".to_owned(),
        setup: "actpass",
        candidates: vec!["1 1 udp 2013266431 192.168.1.1 20000 typ host".to_owned()],
        trickle: false,
        rfc4588: true,
    };
    let sdp_str = generate_local_sdp(&stream, &opts);

    // It must parse back with the sdp crate.
    let mut cursor = std::io::Cursor::new(sdp_str.as_bytes());
    let parsed = SessionDescription::unmarshal(&mut cursor).expect("generated SDP must parse");

    assert_eq!(parsed.media_descriptions.len(), 3);
    assert_eq!(
        parsed.attribute("group").map(String::as_str),
        Some("BUNDLE audio video data")
    );

    let audio = &parsed.media_descriptions[0];
    assert_eq!(audio.media_name.media, "audio");
    assert_eq!(audio.attribute("setup"), Some(Some("actpass")));
    assert!(audio.attribute("sendrecv").is_some());
    assert_eq!(audio.attribute("ice-ufrag"), Some(Some("localufrag")));
    assert!(audio.attribute("end-of-candidates").is_some());
    assert!(audio.attribute("candidate").is_some());

    let video = &parsed.media_descriptions[1];
    let fbs: Vec<&str> = video
        .attributes
        .iter()
        .filter(|a| a.key == "rtcp-fb")
        .filter_map(|a| a.value.as_deref())
        .collect();
    assert!(fbs.contains(&"96 nack"));
    assert!(fbs.contains(&"96 nack pli"));
    assert!(fbs.contains(&"96 transport-cc"));
    // RFC 4588: the rtx companion is announced with an FID group.
    assert!(video
        .attributes
        .iter()
        .any(|a| a.key == "ssrc-group"
            && a.value.as_deref()
                == Some(format!("FID {} {}", stream.video_ssrc, stream.video_ssrc_rtx).as_str())));
    assert!(video
        .attributes
        .iter()
        .any(|a| a.key == "fmtp" && a.value.as_deref() == Some("97 apt=96")));

    let data = &parsed.media_descriptions[2];
    assert_eq!(data.media_name.media, "application");
    assert_eq!(data.attribute("sctp-port"), Some(Some("5000")));

    Ok(())
}

#[test]
fn test_generate_trickle_sdp_has_no_candidates() -> Result<()> {
    let stream = Stream::new(512);
    let opts = LocalSdpOptions {
        is_offer: false,
        audio: true,
        video: false,
        data: false,
        ufrag: "u".to_owned(),
        pwd: "p".to_owned(),
        fingerprint: "aa".to_owned(),
        setup: "active",
        candidates: vec![],
        trickle: true,
        rfc4588: false,
    };
    let sdp_str = generate_local_sdp(&stream, &opts);
    let mut cursor = std::io::Cursor::new(sdp_str.as_bytes());
    let parsed = SessionDescription::unmarshal(&mut cursor).expect("generated SDP must parse");

    let audio = &parsed.media_descriptions[0];
    assert!(audio.attribute("candidate").is_none());
    assert!(audio.attribute("end-of-candidates").is_none());
    assert_eq!(audio.attribute("ice-options"), Some(Some("trickle")));
    Ok(())
}

#[test]
fn test_jsep_json() -> Result<()> {
    let jsep = Jsep::from_json(&json!({
        "type": "offer",
        "sdp": "v=0...",
        "trickle": true
    }))?;
    assert!(jsep.is_offer());
    assert_eq!(jsep.trickle, Some(true));

    let mut answer = Jsep::answer("v=0...".to_owned());
    answer.update = Some(true);
    let value = serde_json::to_value(&answer)?;
    assert_eq!(value["type"], "answer");
    assert_eq!(value["update"], true);
    assert!(value.get("restart").is_none());

    assert!(Jsep::from_json(&json!({ "type": "rollback", "sdp": "" })).is_err());
    Ok(())
}
