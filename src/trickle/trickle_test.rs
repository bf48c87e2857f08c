use serde_json::json;

use super::*;

#[test]
fn test_parse_candidate() -> Result<()> {
    let value = json!({
        "candidate": "candidate:1 1 udp 2013266431 192.168.1.10 45736 typ host",
        "sdpMid": "0",
        "sdpMLineIndex": 0
    });
    let parsed = TrickleCandidate::from_json(&value)?;
    assert!(!parsed.is_completed());
    assert_eq!(
        parsed.candidate_line(),
        Some("1 1 udp 2013266431 192.168.1.10 45736 typ host")
    );
    Ok(())
}

#[test]
fn test_parse_candidate_without_prefix() -> Result<()> {
    let value = json!({ "candidate": "1 1 udp 1 10.0.0.1 9 typ host" });
    let parsed = TrickleCandidate::from_json(&value)?;
    assert_eq!(parsed.candidate_line(), Some("1 1 udp 1 10.0.0.1 9 typ host"));
    Ok(())
}

#[test]
fn test_parse_completed() -> Result<()> {
    let parsed = TrickleCandidate::from_json(&json!({ "completed": true }))?;
    assert!(parsed.is_completed());
    assert!(parsed.candidate_line().is_none());
    Ok(())
}

#[test]
fn test_rejects_garbage() {
    assert!(TrickleCandidate::from_json(&json!({ "completed": false })).is_err());
    assert!(TrickleCandidate::from_json(&json!({ "foo": "bar" })).is_err());
    assert!(TrickleCandidate::from_json(&json!(42)).is_err());
}

#[test]
fn test_round_trip() -> Result<()> {
    let candidate = TrickleCandidate::Candidate {
        candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_owned(),
        sdp_mid: Some("0".to_owned()),
        sdp_mline_index: Some(0),
    };
    let json = serde_json::to_value(&candidate)?;
    assert_eq!(json["sdpMid"], "0");
    assert_eq!(TrickleCandidate::from_json(&json)?, candidate);
    Ok(())
}
