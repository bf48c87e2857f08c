
pub mod endpoint;
pub mod mux_func;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::sync::{mpsc, Mutex};
use util::{Buffer, Conn};

use crate::error::Result;
use crate::mux::endpoint::Endpoint;
use crate::mux::mux_func::MatchFunc;
use crate::RECEIVE_MTU;

/// The amount of data buffered per endpoint before the oldest packets
/// are dropped.
const MAX_BUFFER_SIZE: usize = 1000 * 1024;

/// Mux multiplexes the selected-pair connection: every inbound datagram
/// is handed to the first endpoint whose match function accepts its
/// leading bytes (STUN, DTLS and RTP/RTCP live on one socket after
/// bundling).
pub struct Mux {
    id: Arc<AtomicUsize>,
    next_conn: Arc<dyn Conn + Send + Sync>,
    endpoints: Arc<Mutex<HashMap<usize, Arc<Endpoint>>>>,
    closed_ch_tx: Option<mpsc::Sender<()>>,
}

impl Mux {
    pub fn new(next_conn: Arc<dyn Conn + Send + Sync>) -> Self {
        Mux {
            id: Arc::new(AtomicUsize::new(0)),
            next_conn,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
            closed_ch_tx: None,
        }
    }

    /// Starts the read loop; separate from `new` so endpoints can be
    /// registered before the first packet is dispatched.
    pub fn start(&mut self) {
        let (closed_ch_tx, closed_ch_rx) = mpsc::channel(1);
        self.closed_ch_tx = Some(closed_ch_tx);

        let next_conn = Arc::clone(&self.next_conn);
        let endpoints = Arc::clone(&self.endpoints);
        tokio::spawn(async move {
            Mux::read_loop(next_conn, endpoints, closed_ch_rx).await;
        });
    }

    /// Creates a new endpoint reading all packets the match function
    /// accepts.
    pub async fn new_endpoint(&self, match_fn: MatchFunc) -> Arc<Endpoint> {
        let id = self.id.fetch_add(1, Ordering::SeqCst);
        let endpoint = Arc::new(Endpoint {
            id,
            buffer: Buffer::new(0, MAX_BUFFER_SIZE),
            match_fn,
            next_conn: Arc::clone(&self.next_conn),
            endpoints: Arc::clone(&self.endpoints),
        });

        let mut endpoints = self.endpoints.lock().await;
        endpoints.insert(id, Arc::clone(&endpoint));

        endpoint
    }

    pub async fn remove_endpoint(&self, e: &Endpoint) {
        let mut endpoints = self.endpoints.lock().await;
        endpoints.remove(&e.id);
    }

    /// Closes the mux and all endpoints.
    pub async fn close(&mut self) {
        self.closed_ch_tx.take();

        let mut endpoints = self.endpoints.lock().await;
        for endpoint in endpoints.values() {
            endpoint.buffer.close().await;
        }
        endpoints.clear();
    }

    async fn read_loop(
        next_conn: Arc<dyn Conn + Send + Sync>,
        endpoints: Arc<Mutex<HashMap<usize, Arc<Endpoint>>>>,
        mut closed_ch_rx: mpsc::Receiver<()>,
    ) {
        let mut buf = vec![0u8; RECEIVE_MTU];
        loop {
            let n = tokio::select! {
                _ = closed_ch_rx.recv() => break,
                result = next_conn.recv(&mut buf) => match result {
                    Ok(n) => n,
                    Err(err) => {
                        debug!("mux: closing read loop: {err}");
                        break;
                    }
                }
            };

            if let Err(err) = Mux::dispatch(&buf[..n], &endpoints).await {
                warn!("mux: dispatch failed: {err}");
            }
        }
    }

    async fn dispatch(
        buf: &[u8],
        endpoints: &Arc<Mutex<HashMap<usize, Arc<Endpoint>>>>,
    ) -> Result<()> {
        let endpoint = {
            let eps = endpoints.lock().await;
            eps.values()
                .find(|ep| (ep.match_fn)(buf))
                .map(Arc::clone)
        };

        if let Some(endpoint) = endpoint {
            endpoint.buffer.write(buf).await?;
        } else if !buf.is_empty() {
            trace!("mux: no endpoint for packet starting with {}", buf[0]);
        } else {
            trace!("mux: dropping empty packet");
        }

        Ok(())
    }
}
