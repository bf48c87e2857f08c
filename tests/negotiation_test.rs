//! End-to-end negotiation checks that run without a peer: a module
//! drives the gateway through JSEP and the emitted SDP is inspected.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sdp::description::session::SessionDescription;
use serde_json::{json, Value};

use rtc_gateway::config::{ConfigFile, GatewayConfig};
use rtc_gateway::error::Result;
use rtc_gateway::plugin::{GatewayCallbacks, Plugin, PluginResult, PluginSession};
use rtc_gateway::sdp_utils::Jsep;
use rtc_gateway::session::{Gateway, SessionEvent};
use rtc_gateway::PLUGIN_API_VERSION;

/// A module that answers every message with an offer, like the echo
/// test plugin starting a call.
struct OfferingPlugin {
    callbacks: Mutex<Option<Arc<GatewayCallbacks>>>,
    sessions: AtomicUsize,
}

impl OfferingPlugin {
    fn new() -> Arc<Self> {
        Arc::new(OfferingPlugin {
            callbacks: Mutex::new(None),
            sessions: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Plugin for OfferingPlugin {
    fn api_compatibility(&self) -> u32 {
        PLUGIN_API_VERSION
    }
    fn version(&self) -> u32 {
        1
    }
    fn version_string(&self) -> &str {
        "0.0.1"
    }
    fn description(&self) -> &str {
        "starts a sendrecv call on request"
    }
    fn name(&self) -> &str {
        "Offering"
    }
    fn author(&self) -> &str {
        "tests"
    }
    fn package(&self) -> &str {
        "gateway.plugin.offering"
    }

    async fn init(&self, callbacks: Arc<GatewayCallbacks>, _config_path: &str) -> Result<()> {
        *self.callbacks.lock().unwrap() = Some(callbacks);
        Ok(())
    }

    async fn create_session(&self, _session: &Arc<PluginSession>) -> Result<()> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_message(
        &self,
        session: &Arc<PluginSession>,
        transaction: &str,
        _message: Value,
        _jsep: Option<Jsep>,
    ) -> PluginResult {
        let callbacks = self.callbacks.lock().unwrap().clone().expect("initialized");
        let offer = Jsep {
            jsep_type: rtc_gateway::sdp_utils::JsepType::Offer,
            sdp: "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n"
                .to_owned(),
            trickle: Some(true),
            update: None,
            restart: None,
        };
        match callbacks
            .push_event(
                session,
                Some(transaction.to_owned()),
                json!({ "result": "calling" }),
                Some(offer),
            )
            .await
        {
            Ok(()) => PluginResult::OkWait(Some("calling".to_owned())),
            Err(err) => PluginResult::Error(err.to_string()),
        }
    }

    async fn setup_media(&self, _session: &Arc<PluginSession>) {}
    async fn incoming_rtp(&self, _session: &Arc<PluginSession>, _video: bool, _buf: &[u8]) {}
    async fn incoming_rtcp(&self, _session: &Arc<PluginSession>, _video: bool, _buf: &[u8]) {}
    async fn hangup_media(&self, _session: &Arc<PluginSession>) {}
    async fn destroy_session(&self, _session: &Arc<PluginSession>) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_module_initiated_offer() {
    let gateway = Gateway::new(GatewayConfig::default()).expect("gateway");
    gateway
        .register_plugin(OfferingPlugin::new(), "/tmp")
        .await
        .expect("register");

    let session = gateway.create_session(None, None).expect("session");
    let handle = gateway
        .attach_handle(session.session_id, "gateway.plugin.offering", None)
        .await
        .expect("attach");

    let result = gateway
        .handle_message(
            session.session_id,
            handle.handle_id,
            "tx-call",
            json!({ "request": "call" }),
            None,
        )
        .await
        .expect("message");
    assert!(matches!(result, PluginResult::OkWait(_)));

    // The plugin's event must arrive with the gateway-compiled offer.
    let jsep = loop {
        match session.next_event().await.expect("event stream open") {
            SessionEvent::Event { jsep: Some(jsep), transaction, .. } => {
                assert_eq!(transaction.as_deref(), Some("tx-call"));
                break jsep;
            }
            SessionEvent::Event { jsep: None, .. } => panic!("event without jsep"),
            _ => continue,
        }
    };

    assert!(jsep.is_offer());
    assert_eq!(jsep.trickle, Some(true));
    assert!(jsep.update.is_none(), "first offer is not an update");

    // One bundled audio+video section, both sendrecv, actpass setup,
    // a single ufrag/pwd pair and a fingerprint everywhere.
    let mut cursor = Cursor::new(jsep.sdp.as_bytes());
    let parsed = SessionDescription::unmarshal(&mut cursor).expect("offer must parse");
    assert_eq!(parsed.media_descriptions.len(), 2);
    assert!(parsed
        .attribute("group")
        .map(|g| g.starts_with("BUNDLE"))
        .unwrap_or(false));

    let mut ufrags = std::collections::HashSet::new();
    for media in &parsed.media_descriptions {
        assert!(media.attribute("sendrecv").is_some());
        assert_eq!(media.attribute("setup"), Some(Some("actpass")));
        assert!(media.attribute("fingerprint").is_some());
        if let Some(Some(ufrag)) = media.attribute("ice-ufrag") {
            ufrags.insert(ufrag.to_owned());
        }
    }
    assert_eq!(ufrags.len(), 1, "bundle shares one ufrag");
}

#[tokio::test]
async fn test_ini_round_trip_through_gateway_config() {
    let mut cfg = ConfigFile::default();
    cfg.set_item("general", "session_timeout", "45");
    cfg.set_item("nat", "full_trickle", "true");
    cfg.set_item("media", "max_nack_queue", "600");

    let serialized = cfg.serialize();
    let parsed = ConfigFile::parse(&serialized).expect("round trip");
    assert_eq!(parsed, cfg);

    let gc = GatewayConfig::from_config(&parsed).expect("typed view");
    assert_eq!(gc.session_timeout.as_secs(), 45);
    assert!(gc.full_trickle);
    assert_eq!(gc.max_nack_queue, 600);

    let gateway = Gateway::new(gc).expect("gateway boots from parsed config");
    assert_eq!(gateway.session_count(), 0);
}
