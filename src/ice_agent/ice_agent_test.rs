use super::*;
use crate::config::StunServer;

#[test]
fn test_interface_policies() {
    let enforce = vec!["eth0".to_owned()];
    let ignore = vec!["docker".to_owned()];

    // Enforce list set: only matching interfaces gather.
    assert!(interface_allowed(&enforce, &ignore, "eth0"));
    assert!(!interface_allowed(&enforce, &ignore, "wlan0"));
    // Enforce wins even when the ignore list also matches.
    assert!(interface_allowed(&["docker0".to_owned()], &ignore, "docker0"));

    // Ignore list alone suppresses its matches.
    assert!(!interface_allowed(&[], &ignore, "docker0"));
    assert!(interface_allowed(&[], &ignore, "eth1"));

    // No policy at all.
    assert!(interface_allowed(&[], &[], "anything"));
}

#[test]
fn test_build_agent_config() -> Result<()> {
    let mut config = GatewayConfig::default();
    config.stun_server = Some(StunServer {
        host: "stun.example.org".to_owned(),
        port: 3478,
    });
    config.turn_server = Some(TurnServer {
        host: "turn.example.org".to_owned(),
        port: 5349,
        transport: TurnTransport::Tls,
        user: "alice".to_owned(),
        pwd: "secret".to_owned(),
    });
    config.rtp_port_range = Some((20000, 40000));
    config.ipv6 = true;

    let agent_config = build_agent_config(&config, true)?;
    assert_eq!(agent_config.urls.len(), 2);
    assert_eq!(agent_config.urls[0].host, "stun.example.org");
    assert_eq!(agent_config.urls[1].username, "alice");
    assert!(agent_config.is_controlling);
    assert_eq!(
        agent_config.network_types,
        vec![NetworkType::Udp4, NetworkType::Udp6]
    );
    match agent_config.udp_network {
        UDPNetwork::Ephemeral(e) => {
            assert_eq!(e.port_min(), 20000);
            assert_eq!(e.port_max(), 40000);
        }
        _ => panic!("expected an ephemeral UDP network"),
    }
    Ok(())
}

#[test]
fn test_ice_lite_gathers_host_only() -> Result<()> {
    let config = GatewayConfig {
        ice_lite: true,
        ..Default::default()
    };
    let agent_config = build_agent_config(&config, false)?;
    assert!(agent_config.lite);
    assert_eq!(agent_config.candidate_types, vec![CandidateType::Host]);
    Ok(())
}

#[tokio::test]
async fn test_turn_rest_default_refuses() {
    let api = TurnRestApi {
        url: "https://turnrest.example.org".to_owned(),
        key: "key".to_owned(),
        method: "POST".to_owned(),
    };
    assert!(NoTurnRest.resolve(&api).await.is_err());
}
