//! Tunnel lifecycle manager.
//!
//! The manager owns reconnection; clients are strictly single-use. Enable
//! replaces the current client under the manager lock, and a `GOAWAY` from
//! the relay tears the client down and reattaches with exponential backoff.
//! Status callbacks always run with the lock released.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mockd_wire::{ProtocolPort, TunnelAuthConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientConfig, TunnelClient};
use crate::handler::HttpHandler;
use crate::stats::{TunnelStats, TunnelStatsSnapshot};

/// Relay dialled when the config does not name one.
pub const DEFAULT_RELAY_ADDR: &str = "relay.mockd.io:443";

/// Transport label reported through the status surface.
pub const TRANSPORT: &str = "quic";

const GOAWAY_BASE_DELAY: Duration = Duration::from_millis(500);
const GOAWAY_MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_GOAWAY_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// `(status, public_url, session_id, transport)`.
pub type StatusCallback =
    Box<dyn Fn(TunnelStatus, Option<&str>, Option<&str>, &str) + Send + Sync>;

pub struct ManagerOptions {
    pub relay_addr: String,
    /// Skip relay certificate verification; development only.
    pub insecure: bool,
    pub on_status_change: Option<StatusCallback>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            relay_addr: DEFAULT_RELAY_ADDR.to_string(),
            insecure: false,
            on_status_change: None,
        }
    }
}

/// Per-enable tunnel configuration.
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub enabled: bool,
    pub token: String,
    pub local_port: u16,
    pub protocols: Vec<ProtocolPort>,
    pub tunnel_auth: Option<TunnelAuthConfig>,
}

pub struct TunnelManager {
    inner: Arc<Inner>,
}

struct Inner {
    handler: Arc<dyn HttpHandler>,
    relay_addr: String,
    insecure: bool,
    stats: Arc<TunnelStats>,
    on_status: Option<StatusCallback>,
    state: Mutex<State>,
}

struct State {
    client: Option<Arc<TunnelClient>>,
    cancel: Option<CancellationToken>,
    config: Option<TunnelConfig>,
    status: TunnelStatus,
    enabled: bool,
}

impl TunnelManager {
    pub fn new(handler: Arc<dyn HttpHandler>, options: ManagerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                relay_addr: options.relay_addr,
                insecure: options.insecure,
                stats: Arc::new(TunnelStats::new()),
                on_status: options.on_status_change,
                state: Mutex::new(State {
                    client: None,
                    cancel: None,
                    config: None,
                    status: TunnelStatus::Disconnected,
                    enabled: false,
                }),
            }),
        }
    }

    /// Start (or restart) the tunnel. A `None` or disabled config tears the
    /// tunnel down instead.
    pub fn enable(&self, config: Option<TunnelConfig>) {
        Inner::enable(&self.inner, config);
    }

    pub fn disable(&self) {
        Inner::enable(&self.inner, None);
    }

    pub fn close(&self) {
        self.disable();
    }

    pub fn is_running(&self) -> bool {
        let st = self.inner.state.lock().unwrap();
        st.enabled && st.client.is_some()
    }

    pub fn status(&self) -> (TunnelStatus, Option<String>, Option<String>, &'static str) {
        let (status, client) = {
            let st = self.inner.state.lock().unwrap();
            (st.status, st.client.clone())
        };
        let (public_url, session_id) = match client {
            Some(client) => (client.public_url(), client.session_id()),
            None => (None, None),
        };
        (status, public_url, session_id, TRANSPORT)
    }

    pub fn stats(&self) -> TunnelStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Inner {
    fn enable(this: &Arc<Self>, config: Option<TunnelConfig>) {
        let (old_client, old_cancel, started) = {
            let mut st = this.state.lock().unwrap();
            let old_cancel = st.cancel.take();
            let old_client = st.client.take();

            match config.filter(|c| c.enabled) {
                None => {
                    st.enabled = false;
                    st.config = None;
                    st.status = TunnelStatus::Disconnected;
                    (old_client, old_cancel, None)
                }
                Some(cfg) => {
                    st.enabled = true;
                    st.config = Some(cfg.clone());
                    let client = Self::build_client(this, &cfg);
                    let cancel = CancellationToken::new();
                    st.client = Some(Arc::clone(&client));
                    st.cancel = Some(cancel.clone());
                    st.status = TunnelStatus::Connecting;
                    (old_client, old_cancel, Some((client, cancel)))
                }
            }
        };

        if let Some(cancel) = old_cancel {
            cancel.cancel();
        }
        if let Some(client) = old_client {
            client.close();
        }

        match started {
            None => this.emit(TunnelStatus::Disconnected, None, None),
            Some((client, cancel)) => {
                this.emit(TunnelStatus::Connecting, None, None);
                let inner = Arc::clone(this);
                tokio::spawn(async move {
                    match Arc::clone(&client).connect(&cancel).await {
                        Ok(()) => {
                            if let Err(e) = client.run(&cancel).await {
                                debug!(error = %e, "tunnel run ended");
                            }
                        }
                        Err(crate::client::TunnelError::Cancelled) => {}
                        Err(e) => {
                            warn!(error = %e, "tunnel connect failed");
                            inner.set_error_status();
                        }
                    }
                });
            }
        }
    }

    /// Build a fresh single-use client wired back into the manager.
    ///
    /// Callbacks hold a weak reference so a dropped manager cannot be kept
    /// alive by its own clients.
    fn build_client(this: &Arc<Self>, cfg: &TunnelConfig) -> Arc<TunnelClient> {
        let mut client = TunnelClient::new(
            ClientConfig {
                relay_addr: this.relay_addr.clone(),
                token: cfg.token.clone(),
                local_port: cfg.local_port,
                protocols: cfg.protocols.clone(),
                tunnel_auth: cfg.tunnel_auth.clone(),
                insecure: this.insecure,
            },
            Arc::clone(&this.handler),
            Arc::clone(&this.stats),
        );

        let weak: Weak<Inner> = Arc::downgrade(this);
        client.set_on_connect(move |public_url| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_connected(public_url);
            }
        });

        let weak = Arc::downgrade(this);
        client.set_on_disconnect(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_disconnected();
            }
        });

        let weak = Arc::downgrade(this);
        client.set_on_goaway(move |goaway| {
            if let Some(inner) = weak.upgrade() {
                info!(reason = %goaway.reason, "scheduling reconnect after goaway");
                tokio::spawn(async move {
                    inner.goaway_reconnect().await;
                });
            }
        });

        Arc::new(client)
    }

    fn handle_connected(&self, public_url: &str) {
        let session_id = {
            let mut st = self.state.lock().unwrap();
            st.status = TunnelStatus::Connected;
            st.client.as_ref().and_then(|c| c.session_id())
        };
        self.emit(TunnelStatus::Connected, Some(public_url), session_id.as_deref());
    }

    fn handle_disconnected(&self) {
        let emit = {
            let mut st = self.state.lock().unwrap();
            if st.enabled && st.status == TunnelStatus::Connected {
                st.status = TunnelStatus::Disconnected;
                true
            } else {
                false
            }
        };
        if emit {
            self.emit(TunnelStatus::Disconnected, None, None);
        }
    }

    /// Reconnect loop started by a relay `GOAWAY`: sleep, rebuild the
    /// client under the lock, reattach; double the delay while attempts
    /// keep failing, give up after [`MAX_GOAWAY_ATTEMPTS`].
    async fn goaway_reconnect(self: Arc<Self>) {
        let mut delay = GOAWAY_BASE_DELAY;

        for attempt in 1..=MAX_GOAWAY_ATTEMPTS {
            tokio::time::sleep(delay).await;

            let (old_client, old_cancel, client, cancel) = {
                let mut st = self.state.lock().unwrap();
                if !st.enabled {
                    return;
                }
                let Some(cfg) = st.config.clone() else {
                    return;
                };
                let old_cancel = st.cancel.take();
                let old_client = st.client.take();
                let client = Self::build_client(&self, &cfg);
                let cancel = CancellationToken::new();
                st.client = Some(Arc::clone(&client));
                st.cancel = Some(cancel.clone());
                st.status = TunnelStatus::Connecting;
                (old_client, old_cancel, client, cancel)
            };

            if let Some(cancel) = old_cancel {
                cancel.cancel();
            }
            if let Some(client) = old_client {
                client.close();
            }
            self.emit(TunnelStatus::Connecting, None, None);

            debug!(attempt, delay_ms = delay.as_millis() as u64, "goaway reconnect attempt");
            match Arc::clone(&client).connect(&cancel).await {
                Ok(()) => {
                    self.stats.note_reconnect();
                    if let Err(e) = Arc::clone(&client).run(&cancel).await {
                        debug!(error = %e, "reconnected tunnel ended");
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "goaway reconnect attempt failed");
                }
            }

            let keep_going = {
                let st = self.state.lock().unwrap();
                // Stop when disabled, or when another path (a newer goaway,
                // a re-enable) owns the current client.
                st.enabled
                    && st
                        .client
                        .as_ref()
                        .is_none_or(|current| Arc::ptr_eq(current, &client))
            };
            if !keep_going {
                return;
            }
            delay = (delay * 2).min(GOAWAY_MAX_DELAY);
        }

        warn!(attempts = MAX_GOAWAY_ATTEMPTS, "giving up reconnecting after goaway");
        self.set_error_status();
    }

    fn set_error_status(&self) {
        let emit = {
            let mut st = self.state.lock().unwrap();
            if st.enabled {
                st.status = TunnelStatus::Error;
                true
            } else {
                false
            }
        };
        if emit {
            self.emit(TunnelStatus::Error, None, None);
        }
    }

    fn emit(&self, status: TunnelStatus, public_url: Option<&str>, session_id: Option<&str>) {
        if let Some(cb) = &self.on_status {
            cb(status, public_url, session_id, TRANSPORT);
        }
    }
}
