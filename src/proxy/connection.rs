//! Per-session state for one intercepted chat connection.
//!
//! A `ProxiedConnection` owns the write halves of both sockets (the
//! TLS-terminated client side and the upstream chat server side) plus the
//! small amount of state the rewriter needs across chunks. The read loops
//! live in the proxy module and feed chunks into `handle_incoming` /
//! `handle_outgoing`; everything here may also be called from the supervisor
//! when a status change is broadcast, so writers and state sit behind
//! mutexes. Writes to each socket are serialized by its writer lock.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::rewriter::{
    self, extract_message_body, fake_message_stanza, fake_presence_stanza, inject_roster_item,
    PresenceMode, FAKE_JID,
};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Outcome of dispatching a client chunk, for the caller to act on.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    /// Chunk was forwarded (possibly rewritten); nothing further to do.
    Forwarded,
    /// Chunk was a chat message to the fake contact and was swallowed;
    /// the body text should be interpreted as a command.
    Command(String),
}

struct ConnectionState {
    /// Most recent outbound client presence, kept verbatim so a later mode
    /// change can be replayed upstream as if the client re-sent it.
    last_presence: Option<String>,
    /// The roster query has passed through and carries the fake contact.
    roster_patched: bool,
    /// The fake contact's initial presence has been pushed to the client.
    fake_announced: bool,
    /// Valorant client version captured from the first observed game block.
    valorant_version: Option<String>,
    alive: bool,
}

pub struct ProxiedConnection {
    id: u64,
    client: Mutex<BoxedWriter>,
    upstream: Mutex<BoxedWriter>,
    state: Mutex<ConnectionState>,
}

impl ProxiedConnection {
    pub fn new(id: u64, client: BoxedWriter, upstream: BoxedWriter) -> Self {
        Self {
            id,
            client: Mutex::new(client),
            upstream: Mutex::new(upstream),
            state: Mutex::new(ConnectionState {
                last_presence: None,
                roster_patched: false,
                fake_announced: false,
                valorant_version: None,
                alive: true,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Dispatch one client chunk toward the upstream chat server.
    pub async fn handle_incoming(
        &self,
        mode: PresenceMode,
        enabled: bool,
        connect_to_muc: bool,
        chunk: &[u8],
    ) -> Result<Incoming, String> {
        // Non-UTF-8 chunks cannot match any fragment; forward untouched.
        let Ok(text) = std::str::from_utf8(chunk) else {
            self.write_upstream(chunk).await?;
            return Ok(Incoming::Forwarded);
        };

        let mut outcome = Incoming::Forwarded;
        if text.contains("<presence") && enabled {
            let rewritten = {
                let mut state = self.state.lock().await;
                state.last_presence = Some(text.to_string());
                rewriter::rewrite_presence(text, mode, connect_to_muc, &mut state.valorant_version)
                    .into_owned()
            };
            debug!(conn_id = self.id, mode = %mode, "rewrote outbound presence");
            self.write_upstream(rewritten.as_bytes()).await?;
        } else if text.contains(FAKE_JID) {
            // A chat message to the fake contact is a command for us,
            // never something the real server should see.
            let body = extract_message_body(text).unwrap_or_default().to_string();
            debug!(conn_id = self.id, body = %body, "intercepted message to fake contact");
            outcome = Incoming::Command(body);
        } else {
            self.write_upstream(chunk).await?;
        }

        self.announce_fake_contact_if_ready().await?;
        Ok(outcome)
    }

    /// Dispatch one upstream chunk toward the client, splicing the fake
    /// contact into the first roster query seen on this connection.
    pub async fn handle_outgoing(&self, chunk: &[u8]) -> Result<(), String> {
        let roster_patched = self.state.lock().await.roster_patched;
        if !roster_patched {
            if let Ok(text) = std::str::from_utf8(chunk) {
                if let Some(patched) = inject_roster_item(text) {
                    info!(conn_id = self.id, "injected fake contact into roster");
                    self.write_client(patched.as_bytes()).await?;
                    // Set only after the roster bytes are on the wire so the
                    // synthetic presence can never overtake its roster entry.
                    self.state.lock().await.roster_patched = true;
                    return Ok(());
                }
            }
        }
        self.write_client(chunk).await
    }

    /// Replay the retained client presence upstream under a new mode.
    /// Connections that have not yet seen a presence stanza are a no-op.
    pub async fn update_status(
        &self,
        mode: PresenceMode,
        connect_to_muc: bool,
    ) -> Result<(), String> {
        let rewritten = {
            let mut state = self.state.lock().await;
            let Some(last) = state.last_presence.clone() else {
                return Ok(());
            };
            rewriter::rewrite_presence(&last, mode, connect_to_muc, &mut state.valorant_version)
                .into_owned()
        };
        debug!(conn_id = self.id, mode = %mode, "replaying presence with new status");
        self.write_upstream(rewritten.as_bytes()).await
    }

    /// Deliver a chat message from the fake contact to the client. Dropped
    /// silently until the contact exists in the client's roster.
    pub async fn send_fake_message(&self, text: &str) -> Result<(), String> {
        {
            let state = self.state.lock().await;
            if !state.roster_patched || !state.alive {
                return Ok(());
            }
        }
        let stanza = fake_message_stanza(text);
        self.write_client(stanza.as_bytes()).await
    }

    async fn announce_fake_contact_if_ready(&self) -> Result<(), String> {
        let stanza = {
            let mut state = self.state.lock().await;
            if !state.roster_patched || state.fake_announced {
                return Ok(());
            }
            state.fake_announced = true;
            fake_presence_stanza(state.valorant_version.as_deref())
        };
        info!(conn_id = self.id, "announcing fake contact presence");
        self.write_client(stanza.as_bytes()).await
    }

    async fn write_client(&self, data: &[u8]) -> Result<(), String> {
        let mut client = self.client.lock().await;
        client
            .write_all(data)
            .await
            .map_err(|e| format!("client write failed: {e}"))
    }

    async fn write_upstream(&self, data: &[u8]) -> Result<(), String> {
        let mut upstream = self.upstream.lock().await;
        upstream
            .write_all(data)
            .await
            .map_err(|e| format!("upstream write failed: {e}"))
    }

    /// Close both endpoints. Safe to call more than once; only the first
    /// call does anything.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if !state.alive {
                return;
            }
            state.alive = false;
        }
        if let Err(e) = self.client.lock().await.shutdown().await {
            debug!(conn_id = self.id, error = %e, "client shutdown");
        }
        if let Err(e) = self.upstream.lock().await.shutdown().await {
            debug!(conn_id = self.id, error = %e, "upstream shutdown");
        }
        warn!(conn_id = self.id, "connection closed");
    }
}
