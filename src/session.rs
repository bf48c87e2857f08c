
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock};
use std::time::{Duration, Instant, SystemTime};

use dtls::crypto::Certificate;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::auth::TokenAuth;
use crate::config::GatewayConfig;
use crate::dtls_srtp::generate_certificate;
use crate::error::{Error, Result};
use crate::events::{EventHandler, EventSinks};
use crate::handle::Handle;
use crate::plugin::{GatewayCallbacks, Plugin, PluginResult};
use crate::sdp_utils::Jsep;
use crate::trickle::TrickleCandidate;
use crate::PLUGIN_API_VERSION;

/// Events a signaling session queues for its transport: everything the
/// core needs to tell the peer asynchronously.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A local trickled candidate (or the completed marker).
    Trickle {
        handle_id: u64,
        candidate: Value,
    },
    /// A plugin event, optionally carrying a JSEP.
    Event {
        handle_id: u64,
        plugin: String,
        transaction: Option<String>,
        data: Value,
        jsep: Option<Jsep>,
    },
    /// The PeerConnection is up.
    WebrtcUp { handle_id: u64 },
    /// Media started/stopped flowing in one direction.
    Media {
        handle_id: u64,
        video: bool,
        receiving: bool,
    },
    SlowLink {
        handle_id: u64,
        uplink: bool,
        video: bool,
    },
    Hangup {
        handle_id: u64,
        reason: String,
    },
    /// The session was reaped by the timeout sweeper.
    Timeout { session_id: u64 },
}

/// A signaling session: owns its handles and the event queue a
/// transport drains.
pub struct Session {
    pub session_id: u64,
    pub created: Instant,
    last_activity: StdMutex<Instant>,
    handles: StdMutex<HashMap<u64, Arc<Handle>>>,
    event_tx: UnboundedSender<SessionEvent>,
    event_rx: Mutex<UnboundedReceiver<SessionEvent>>,
    /// Transport instance currently serving this session; `claim` moves
    /// it, e.g. after a websocket reconnect.
    claimed_by: StdMutex<Option<u64>>,
    destroyed: AtomicBool,
}

impl Session {
    fn new(session_id: u64) -> Arc<Self> {
        let (event_tx, event_rx) = unbounded_channel();
        Arc::new(Session {
            session_id,
            created: Instant::now(),
            last_activity: StdMutex::new(Instant::now()),
            handles: StdMutex::new(HashMap::new()),
            event_tx,
            event_rx: Mutex::new(event_rx),
            claimed_by: StdMutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn keepalive(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn handle(&self, handle_id: u64) -> Option<Arc<Handle>> {
        self.handles.lock().unwrap().get(&handle_id).cloned()
    }

    pub fn handles(&self) -> Vec<Arc<Handle>> {
        self.handles.lock().unwrap().values().cloned().collect()
    }

    pub fn claimed_by(&self) -> Option<u64> {
        *self.claimed_by.lock().unwrap()
    }

    /// Awaits the next queued event; transports drive this.
    pub async fn next_event(&self) -> Option<SessionEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    fn insert_handle(&self, handle: Arc<Handle>) {
        self.handles
            .lock()
            .unwrap()
            .insert(handle.handle_id, handle);
    }

    fn remove_handle(&self, handle_id: u64) -> Option<Arc<Handle>> {
        self.handles.lock().unwrap().remove(&handle_id)
    }
}

/// The gateway runtime context: sessions, plugins, auth and tunables.
/// Everything the original kept in process-wide globals lives here.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    certificate: Certificate,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    auth: TokenAuth,
    events: RwLock<EventSinks>,
    callbacks: OnceLock<Arc<GatewayCallbacks>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>> {
        let certificate = generate_certificate(config.dtls_cert_names.clone())?;
        let auth = match &config.token_auth_secret {
            Some(secret) => TokenAuth::signed_tokens(secret),
            None => TokenAuth::disabled(),
        };
        let gateway = Arc::new(Gateway {
            config: Arc::new(config),
            certificate,
            sessions: RwLock::new(HashMap::new()),
            plugins: RwLock::new(HashMap::new()),
            auth,
            events: RwLock::new(EventSinks::new()),
            callbacks: OnceLock::new(),
        });
        let callbacks = Arc::new(GatewayCallbacks {
            gateway: Arc::downgrade(&gateway),
        });
        let _ = gateway.callbacks.set(callbacks);
        Ok(gateway)
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn auth(&self) -> &TokenAuth {
        &self.auth
    }

    pub fn callbacks(&self) -> Arc<GatewayCallbacks> {
        Arc::clone(self.callbacks.get().expect("set in new"))
    }

    pub fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.events.write().unwrap().register(handler);
    }

    pub fn events_enabled(&self) -> bool {
        self.events.read().unwrap().is_enabled()
    }

    pub fn notify_event(&self, plugin: &str, handle_id: Option<u64>, event: Value) {
        self.events
            .read()
            .unwrap()
            .notify(Some(plugin.to_owned()), handle_id, event);
    }

    /// Registers an application module; refused when its API revision
    /// does not match the core's.
    pub async fn register_plugin(
        self: &Arc<Self>,
        plugin: Arc<dyn Plugin>,
        config_path: &str,
    ) -> Result<()> {
        if plugin.api_compatibility() != PLUGIN_API_VERSION {
            warn!(
                "refusing plugin {}: API {} != {}",
                plugin.package(),
                plugin.api_compatibility(),
                PLUGIN_API_VERSION
            );
            return Err(Error::ErrPluginVersion);
        }
        plugin.init(self.callbacks(), config_path).await?;
        info!(
            "registered plugin {} {} ({})",
            plugin.package(),
            plugin.version_string(),
            plugin.description()
        );
        self.plugins
            .write()
            .unwrap()
            .insert(plugin.package().to_owned(), plugin);
        Ok(())
    }

    pub fn plugin(&self, package: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().unwrap().get(package).cloned()
    }

    fn check_token(&self, token: Option<&str>) -> Result<()> {
        if !self.auth.is_enabled() {
            return Ok(());
        }
        match token {
            Some(token) if self.auth.check_token(token) => Ok(()),
            _ => Err(Error::ErrAuthInvalidToken),
        }
    }

    // ---- transport-facing operations ------------------------------

    /// Creates a signaling session with a fresh (or requested) 64-bit id.
    pub fn create_session(&self, requested_id: Option<u64>, token: Option<&str>) -> Result<Arc<Session>> {
        self.check_token(token)?;
        let mut sessions = self.sessions.write().unwrap();
        let session_id = match requested_id {
            Some(id) if id != 0 => {
                if sessions.contains_key(&id) {
                    return Err(Error::new(format!("session {id} already exists")));
                }
                id
            }
            _ => loop {
                let id = rand::random::<u64>() & 0x7fff_ffff_ffff_ffff;
                if id != 0 && !sessions.contains_key(&id) {
                    break id;
                }
            },
        };
        let session = Session::new(session_id);
        sessions.insert(session_id, Arc::clone(&session));
        info!("created session {session_id}");
        Ok(session)
    }

    pub fn session(&self, session_id: u64) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .get(&session_id)
            .cloned()
            .ok_or(Error::ErrSessionNotFound)
    }

    /// Creates a handle bound to this session and attaches the plugin.
    pub async fn attach_handle(
        self: &Arc<Self>,
        session_id: u64,
        plugin_package: &str,
        opaque_id: Option<String>,
    ) -> Result<Arc<Handle>> {
        let session = self.session(session_id)?;
        session.keepalive();
        let plugin = self
            .plugin(plugin_package)
            .ok_or(Error::ErrPluginNotFound)?;

        let handle_id = loop {
            let id = rand::random::<u64>() & 0x7fff_ffff_ffff_ffff;
            if id != 0 && session.handle(id).is_none() {
                break id;
            }
        };
        let handle = Handle::new(
            handle_id,
            session_id,
            opaque_id,
            Arc::clone(&self.config),
            self.certificate.clone(),
            session.event_tx.clone(),
        );
        handle.attach(plugin).await?;
        session.insert_handle(Arc::clone(&handle));
        Ok(handle)
    }

    pub fn find_handle(&self, session_id: u64, handle_id: u64) -> Result<Arc<Handle>> {
        self.session(session_id)?
            .handle(handle_id)
            .ok_or(Error::ErrHandleNotFound)
    }

    /// Routes a signaling message (and its JSEP, if any) to the plugin
    /// attached to the handle. A peer-originated JSEP is applied to the
    /// WebRTC state first.
    pub async fn handle_message(
        &self,
        session_id: u64,
        handle_id: u64,
        transaction: &str,
        message: Value,
        jsep: Option<Value>,
    ) -> Result<PluginResult> {
        let session = self.session(session_id)?;
        session.keepalive();
        let handle = session.handle(handle_id).ok_or(Error::ErrHandleNotFound)?;
        let plugin = handle.plugin().ok_or(Error::ErrPluginDetached)?;
        let plugin_session = handle
            .plugin_session()
            .ok_or(Error::ErrPluginDetached)?;

        let jsep = match jsep {
            Some(value) => {
                let jsep = Jsep::from_json(&value)?;
                handle.apply_remote_jsep(&jsep).await?;
                Some(jsep)
            }
            None => None,
        };

        Ok(plugin
            .handle_message(&plugin_session, transaction, message, jsep)
            .await)
    }

    /// Feeds a trickled candidate to a handle.
    pub async fn trickle(
        &self,
        session_id: u64,
        handle_id: u64,
        transaction: Option<String>,
        candidate: Value,
    ) -> Result<()> {
        let session = self.session(session_id)?;
        session.keepalive();
        let handle = session.handle(handle_id).ok_or(Error::ErrHandleNotFound)?;
        let candidate = TrickleCandidate::from_json(&candidate)?;
        handle.add_trickle(transaction, candidate).await
    }

    /// Hangs up a handle's PeerConnection but keeps the handle alive so
    /// a new negotiation can follow.
    pub async fn hangup_handle(&self, session_id: u64, handle_id: u64, reason: &str) -> Result<()> {
        let handle = self.find_handle(session_id, handle_id)?;
        handle.hangup(reason).await;
        Ok(())
    }

    /// Detaches and frees a handle.
    pub async fn detach_handle(&self, session_id: u64, handle_id: u64) -> Result<()> {
        let session = self.session(session_id)?;
        session.keepalive();
        let handle = session
            .remove_handle(handle_id)
            .ok_or(Error::ErrHandleNotFound)?;
        handle.destroy().await;
        Ok(())
    }

    /// Re-binds a session to another transport instance (e.g. after a
    /// reconnect); pending events stay queued.
    pub fn claim_session(&self, session_id: u64, transport_id: u64) -> Result<()> {
        let session = self.session(session_id)?;
        session.keepalive();
        *session.claimed_by.lock().unwrap() = Some(transport_id);
        debug!("session {session_id} claimed by transport {transport_id}");
        Ok(())
    }

    /// Destroys a session and everything it owns.
    pub async fn destroy_session(&self, session_id: u64) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.remove(&session_id).ok_or(Error::ErrSessionNotFound)?
        };
        session.destroyed.store(true, Ordering::SeqCst);
        for handle in session.handles() {
            session.remove_handle(handle.handle_id);
            handle.destroy().await;
        }
        info!("destroyed session {session_id}");
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Spawns the watchdog that reaps idle sessions past the configured
    /// timeout (and sweeps expired stored tokens with it). Reaped
    /// sessions get a final Timeout event so the transport learns why.
    pub fn start_watchdog(self: &Arc<Self>) {
        let gateway = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            loop {
                ticker.tick().await;
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                gateway.auth.sweep(SystemTime::now());

                let timeout = gateway.config.session_timeout;
                if timeout.is_zero() {
                    continue;
                }
                let expired: Vec<Arc<Session>> = {
                    let sessions = gateway.sessions.read().unwrap();
                    sessions
                        .values()
                        .filter(|s| s.idle_for() > timeout)
                        .cloned()
                        .collect()
                };
                for session in expired {
                    info!("session {} timed out", session.session_id);
                    let _ = session.event_tx.send(SessionEvent::Timeout {
                        session_id: session.session_id,
                    });
                    if let Err(err) = gateway.destroy_session(session.session_id).await {
                        warn!("timeout reap failed: {err}");
                    }
                }
            }
        });
    }
}
