#[cfg(test)]
mod ice_agent_test;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ice::agent::agent_config::AgentConfig;
use ice::agent::Agent;
use ice::candidate::CandidateType;
use ice::network_type::NetworkType;
use ice::udp_network::{EphemeralUDP, UDPNetwork};
use ice::url::Url;
use log::debug;

use crate::config::{GatewayConfig, TurnRestApi, TurnServer, TurnTransport};
use crate::error::{Error, Result};

/// Grace period between ICE reporting failure and the handle being hung
/// up; checks may still recover in between.
pub const ICE_FAILED_GRACE: Duration = Duration::from_secs(3);

/// Resolves short-lived TURN credentials from a TURN REST API backend
/// (draft-uberti-behave-turn-rest). The HTTP client itself is an
/// external collaborator; the core only carries the configuration.
#[async_trait]
pub trait TurnRestResolver: Send + Sync {
    async fn resolve(&self, api: &TurnRestApi) -> Result<TurnServer>;
}

/// Default resolver for deployments without a TURN REST backend.
pub struct NoTurnRest;

#[async_trait]
impl TurnRestResolver for NoTurnRest {
    async fn resolve(&self, api: &TurnRestApi) -> Result<TurnServer> {
        Err(Error::ErrConfigInvalid(format!(
            "no TURN REST resolver for {}",
            api.url
        )))
    }
}

fn stun_url(host: &str, port: u16) -> Result<Url> {
    Ok(Url::parse_url(&format!("stun:{host}:{port}"))?)
}

fn turn_url(turn: &TurnServer) -> Result<Url> {
    let raw = match turn.transport {
        TurnTransport::Udp => format!("turn:{}:{}?transport=udp", turn.host, turn.port),
        TurnTransport::Tcp => format!("turn:{}:{}?transport=tcp", turn.host, turn.port),
        TurnTransport::Tls => format!("turns:{}:{}?transport=tcp", turn.host, turn.port),
    };
    let mut url = Url::parse_url(&raw)?;
    url.username = turn.user.clone();
    url.password = turn.pwd.clone();
    Ok(url)
}

/// Compiles the per-handle agent configuration from the gateway options:
/// STUN/TURN servers, the RTP port range, lite/tcp/ipv6 switches and the
/// interface enforce/ignore policies.
pub fn build_agent_config(config: &GatewayConfig, controlling: bool) -> Result<AgentConfig> {
    let mut urls = vec![];
    if let Some(stun) = &config.stun_server {
        urls.push(stun_url(&stun.host, stun.port)?);
    }
    if let Some(turn) = &config.turn_server {
        urls.push(turn_url(turn)?);
    }

    let udp_network = match config.rtp_port_range {
        Some((min, max)) => UDPNetwork::Ephemeral(
            EphemeralUDP::new(min, max)
                .map_err(|e| Error::ErrConfigInvalid(format!("rtp_port_range: {e}")))?,
        ),
        None => UDPNetwork::default(),
    };

    let mut network_types = vec![NetworkType::Udp4];
    if config.ipv6 {
        network_types.push(NetworkType::Udp6);
    }
    if config.ice_tcp {
        network_types.push(NetworkType::Tcp4);
        if config.ipv6 {
            network_types.push(NetworkType::Tcp6);
        }
    }

    let candidate_types = if config.ice_lite {
        vec![CandidateType::Host]
    } else {
        vec![]
    };

    let enforce = config.interfaces_enforce.clone();
    let ignore = config.interfaces_ignore.clone();
    let interface_filter: Option<ice::agent::agent_config::InterfaceFilterFn> =
        if enforce.is_empty() && ignore.is_empty() {
            None
        } else {
            Some(Box::new(move |interface: &str| {
                interface_allowed(&enforce, &ignore, interface)
            }))
        };

    Ok(AgentConfig {
        urls,
        udp_network,
        network_types,
        candidate_types,
        lite: config.ice_lite,
        is_controlling: controlling,
        interface_filter: Arc::new(interface_filter),
        ..Default::default()
    })
}

/// Enforce and ignore are mutually exclusive per interface; when an
/// interface matches both policies, enforce wins.
pub fn interface_allowed(enforce: &[String], ignore: &[String], interface: &str) -> bool {
    if enforce.iter().any(|e| interface.starts_with(e.as_str())) {
        return true;
    }
    if !enforce.is_empty() {
        return false;
    }
    !ignore.iter().any(|i| interface.starts_with(i.as_str()))
}

/// Creates the per-handle ICE agent; the caller wires the callbacks and
/// starts gathering.
pub async fn create_agent(config: &GatewayConfig, controlling: bool) -> Result<Arc<Agent>> {
    let agent_config = build_agent_config(config, controlling)?;
    let agent = Agent::new(agent_config).await?;
    debug!(
        "created ICE agent (controlling={controlling}, lite={})",
        config.ice_lite
    );
    Ok(Arc::new(agent))
}
