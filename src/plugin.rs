use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::sdp_utils::Jsep;
use crate::session::{Gateway, SessionEvent};

/// Outcome of `Plugin::handle_message`: an immediate response, an ack
/// for asynchronously handled requests, or a core-surfaced error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginResult {
    /// Synchronous success carrying the response payload.
    Ok(Value),
    /// The request was queued; events will follow. The text is a
    /// human-readable hint ("processing").
    OkWait(Option<String>),
    /// A severe, non-application-level failure.
    Error(String),
}

/// The typed capability a plugin holds for one gateway handle; replaces
/// the opaque pointer pair crossing the module ABI.
pub struct PluginSession {
    pub handle_id: u64,
    handle: Weak<Handle>,
    stopped: AtomicBool,
    state: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl PluginSession {
    pub(crate) fn new(handle_id: u64, handle: Weak<Handle>) -> Arc<Self> {
        Arc::new(PluginSession {
            handle_id,
            handle,
            stopped: AtomicBool::new(false),
            state: OnceLock::new(),
        })
    }

    /// The owning handle, while it is alive.
    pub fn handle(&self) -> Option<Arc<Handle>> {
        self.handle.upgrade()
    }

    /// Installs the plugin's opaque per-session state; set exactly once.
    pub fn set_state<T: Any + Send + Sync>(&self, state: T) -> Result<()> {
        self.state
            .set(Box::new(state))
            .map_err(|_| Error::ErrPluginAttached)
    }

    pub fn state<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.state.get()?.downcast_ref::<T>()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// The contract application modules implement. Optional hooks carry
/// default no-op bodies, mirroring nullable slots in a function table.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Must equal [`crate::PLUGIN_API_VERSION`] or registration is
    /// refused.
    fn api_compatibility(&self) -> u32;
    fn version(&self) -> u32;
    fn version_string(&self) -> &str;
    fn description(&self) -> &str;
    fn name(&self) -> &str;
    fn author(&self) -> &str;
    /// Unique package name, e.g. `gateway.plugin.echotest`; used as the
    /// auth realm and registry key.
    fn package(&self) -> &str;

    async fn init(&self, callbacks: Arc<GatewayCallbacks>, config_path: &str) -> Result<()>;
    async fn destroy(&self) {}

    async fn create_session(&self, session: &Arc<PluginSession>) -> Result<()>;
    async fn handle_message(
        &self,
        session: &Arc<PluginSession>,
        transaction: &str,
        message: Value,
        jsep: Option<Jsep>,
    ) -> PluginResult;
    /// Fired exactly once per handle, after the PeerConnection is up.
    async fn setup_media(&self, session: &Arc<PluginSession>);
    async fn incoming_rtp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]);
    async fn incoming_rtcp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]);
    async fn incoming_data(&self, _session: &Arc<PluginSession>, _buf: &[u8]) {}
    /// Fired when NACK traffic suggests a lossy link; `uplink` is the
    /// gateway-to-peer direction.
    async fn slow_link(&self, _session: &Arc<PluginSession>, _uplink: bool, _video: bool) {}
    /// Fired exactly once when the PeerConnection goes away.
    async fn hangup_media(&self, session: &Arc<PluginSession>);
    async fn destroy_session(&self, session: &Arc<PluginSession>) -> Result<()>;
    async fn query_session(&self, _session: &Arc<PluginSession>) -> Value {
        Value::Null
    }
}

/// The callback surface the gateway exposes to plugins.
pub struct GatewayCallbacks {
    pub(crate) gateway: Weak<Gateway>,
}

impl GatewayCallbacks {
    /// Delivers an event (optionally with a JSEP) to the peer attached
    /// to this plugin session. A JSEP is first run through the handle so
    /// the gateway's transport parameters land in the SDP.
    pub async fn push_event(
        &self,
        session: &Arc<PluginSession>,
        transaction: Option<String>,
        message: Value,
        jsep: Option<Jsep>,
    ) -> Result<()> {
        let handle = session.handle().ok_or(Error::ErrHandleNotFound)?;
        let jsep = match jsep {
            Some(jsep) => Some(handle.process_plugin_jsep(jsep).await?),
            None => None,
        };
        let plugin = handle.plugin_package().unwrap_or_default();
        handle.queue_event(SessionEvent::Event {
            handle_id: handle.handle_id,
            plugin,
            transaction,
            data: message,
            jsep,
        });
        Ok(())
    }

    /// Sends an RTP packet to the peer. Drops silently on a handle past
    /// hangup, like every media-path call.
    pub fn relay_rtp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]) {
        if let Some(handle) = session.handle() {
            handle.relay_rtp(video, buf);
        }
    }

    /// Sends an RTCP packet to the peer.
    pub fn relay_rtcp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]) {
        if let Some(handle) = session.handle() {
            handle.relay_rtcp(video, buf);
        }
    }

    /// Sends a datachannel message to the peer.
    pub fn relay_data(&self, session: &Arc<PluginSession>, buf: &[u8]) {
        if let Some(handle) = session.handle() {
            handle.relay_data(buf);
        }
    }

    /// Asks the core to tear down the PeerConnection; `hangup_media`
    /// will be invoked on the plugin when done.
    pub fn close_pc(&self, session: &Arc<PluginSession>) {
        if let Some(handle) = session.handle() {
            tokio::spawn(async move {
                handle.hangup("Close PC").await;
            });
        }
    }

    /// Asks the core to get rid of the whole plugin/gateway session;
    /// `destroy_session` will be invoked on the plugin when done.
    pub fn end_session(&self, session: &Arc<PluginSession>) {
        let (Some(gateway), Some(handle)) = (self.gateway.upgrade(), session.handle()) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = gateway.detach_handle(handle.session_id, handle.handle_id).await {
                warn!("end_session failed: {err}");
            }
        });
    }

    /// Whether event handlers are configured; when false, `notify_event`
    /// should not be called.
    pub fn events_is_enabled(&self) -> bool {
        self.gateway
            .upgrade()
            .map(|g| g.events_enabled())
            .unwrap_or(false)
    }

    /// Notifies the registered event handlers.
    pub fn notify_event(&self, plugin: &str, session: Option<&Arc<PluginSession>>, event: Value) {
        if let Some(gateway) = self.gateway.upgrade() {
            let handle_id = session.map(|s| s.handle_id);
            gateway.notify_event(plugin, handle_id, event);
        } else {
            debug!("notify_event on a gone gateway");
        }
    }

    /// Checks a signed token against the plugin's realm.
    pub fn auth_is_signature_valid(&self, plugin: &str, token: &str) -> bool {
        self.gateway
            .upgrade()
            .map(|g| g.auth().is_signature_valid(plugin, token))
            .unwrap_or(false)
    }

    /// Checks a signed token grants access to a descriptor.
    pub fn auth_signature_contains(&self, plugin: &str, token: &str, descriptor: &str) -> bool {
        self.gateway
            .upgrade()
            .map(|g| g.auth().signature_contains(plugin, token, descriptor))
            .unwrap_or(false)
    }
}
