//! The interception pipeline: session supervisor and chat interceptor.
//!
//! The supervisor owns all cross-connection state (presence mode, the
//! enabled flag, the connection set, the one-shot chat target) and fans
//! status changes out to every live connection. The chat interceptor is a
//! loopback TLS listener the reconfigured game client connects to; each
//! accepted connection is spliced to the real chat server and pumped through
//! the presence rewriter in both directions.

pub mod config_http;
mod connection;
pub mod rewriter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

use connection::{Incoming, ProxiedConnection};
use rewriter::{parse_chat_command, ChatCommand, PresenceMode};

pub use config_http::start_config_listener;

/// Upstream chat connect timeout. Riot's chat shards answer quickly; waiting
/// longer only delays the client's own retry.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the process lingers after the last client disconnects. The
/// client reconnects within seconds on a normal restart, so a minute of
/// quiet means the user is done playing.
const IDLE_SHUTDOWN_DELAY: Duration = Duration::from_secs(60);

/// Delay before the welcome messages, giving the client time to finish
/// login and render the chat list.
const INTRO_DELAY: Duration = Duration::from_secs(10);

/// Gap between consecutive welcome messages so the client displays them in
/// order.
const INTRO_MESSAGE_GAP: Duration = Duration::from_millis(250);

const READ_BUFFER_SIZE: usize = 8192;

/// The real chat endpoint recovered from the first intercepted bootstrap
/// config. Written once, read by every subsequent chat connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTarget {
    pub host: String,
    pub port: u16,
}

/// Initialize rustls crypto provider (must be called once before TLS use).
pub(crate) fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts every upstream certificate.
///
/// The chat shards present certificates for their public hostnames while the
/// client has been told to talk to us; we in turn skip verification when
/// dialing out, mirroring the `chat.allow_bad_cert.enabled` switch we set in
/// the client's config.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Connector for the upstream chat dial, with verification disabled.
fn upstream_tls_connector() -> TlsConnector {
    init_crypto_provider();
    let provider = rustls::crypto::ring::default_provider();
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(Arc::new(provider))))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

struct SupervisorState {
    mode: PresenceMode,
    enabled: bool,
    connect_to_muc: bool,
    connections: Vec<Arc<ProxiedConnection>>,
    idle_timer: Option<JoinHandle<()>>,
    intro_sent: bool,
}

/// Owner of all global proxy state. One per process; handles to it are
/// passed into both interceptors and every connection pump.
pub struct Supervisor {
    state: Mutex<SupervisorState>,
    target_tx: watch::Sender<Option<ChatTarget>>,
    shutdown_tx: broadcast::Sender<()>,
    next_conn_id: AtomicU64,
}

impl Supervisor {
    pub fn new(mode: PresenceMode, connect_to_muc: bool) -> Self {
        let (target_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            state: Mutex::new(SupervisorState {
                mode,
                enabled: true,
                connect_to_muc,
                connections: Vec::new(),
                idle_timer: None,
                intro_sent: false,
            }),
            target_tx,
            shutdown_tx,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    fn target_receiver(&self) -> watch::Receiver<Option<ChatTarget>> {
        self.target_tx.subscribe()
    }

    /// The recorded real chat endpoint, if the config fetch has happened.
    pub fn chat_target(&self) -> Option<ChatTarget> {
        self.target_tx.borrow().clone()
    }

    /// Record the real chat endpoint. Only the first call per process takes
    /// effect; the endpoint is immutable for the process lifetime.
    pub fn set_chat_target(&self, target: ChatTarget) {
        let recorded = self.target_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(target.clone());
            true
        });
        if recorded {
            info!(host = %target.host, port = target.port, "real chat endpoint recorded");
        } else {
            debug!(host = %target.host, "chat endpoint already recorded, ignoring");
        }
    }

    pub async fn current_mode(&self) -> PresenceMode {
        self.state.lock().await.mode
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Snapshot of the state the rewriter needs for one chunk.
    async fn rewrite_params(&self) -> (PresenceMode, bool, bool) {
        let st = self.state.lock().await;
        (st.mode, st.enabled, st.connect_to_muc)
    }

    /// The mode visible on the wire: disabling overrides the chosen mode
    /// with `Online` while remembering the choice.
    async fn effective_mode(&self) -> PresenceMode {
        let st = self.state.lock().await;
        if st.enabled {
            st.mode
        } else {
            PresenceMode::Online
        }
    }

    /// Switch the presence mode, re-enabling if currently disabled, and
    /// replay the new status on every live connection.
    pub async fn set_mode(&self, mode: PresenceMode) {
        let (connections, connect_to_muc) = {
            let mut st = self.state.lock().await;
            st.mode = mode;
            st.enabled = true;
            (st.connections.clone(), st.connect_to_muc)
        };
        info!(mode = %mode, "presence mode changed");
        for conn in connections {
            if let Err(e) = conn.update_status(mode, connect_to_muc).await {
                warn!(conn_id = conn.id(), error = %e, "failed to replay status");
            }
        }
        self.send_from_fake(&format!("You are now appearing {}.", mode.label()))
            .await;
    }

    /// Flip the enabled flag, broadcasting the resulting wire mode.
    pub async fn toggle_enabled(&self) {
        let (connections, wire_mode, connect_to_muc, enabled) = {
            let mut st = self.state.lock().await;
            st.enabled = !st.enabled;
            let wire_mode = if st.enabled {
                st.mode
            } else {
                PresenceMode::Online
            };
            (st.connections.clone(), wire_mode, st.connect_to_muc, st.enabled)
        };
        info!(enabled, "deceive toggled");
        for conn in connections {
            if let Err(e) = conn.update_status(wire_mode, connect_to_muc).await {
                warn!(conn_id = conn.id(), error = %e, "failed to replay status");
            }
        }
        self.send_from_fake(if enabled {
            "Deceive is now enabled."
        } else {
            "Deceive is now disabled."
        })
        .await;
    }

    /// Act on a chat message the user sent to the fake contact.
    pub async fn handle_chat_command(&self, body: &str) {
        match parse_chat_command(body) {
            Some(ChatCommand::Offline) => self.set_mode(PresenceMode::Offline).await,
            Some(ChatCommand::Mobile) => self.set_mode(PresenceMode::Mobile).await,
            Some(ChatCommand::Online) => self.set_mode(PresenceMode::Online).await,
            Some(ChatCommand::Enable) => {
                if self.is_enabled().await {
                    self.send_from_fake("Deceive is already enabled.").await;
                } else {
                    self.toggle_enabled().await;
                }
            }
            Some(ChatCommand::Disable) => {
                if self.is_enabled().await {
                    self.toggle_enabled().await;
                } else {
                    self.send_from_fake("Deceive is already disabled.").await;
                }
            }
            Some(ChatCommand::Status) => {
                let label = self.effective_mode().await.label();
                self.send_from_fake(&format!("You are appearing {label}."))
                    .await;
            }
            Some(ChatCommand::Help) => {
                self.send_from_fake(
                    "Commands: online, offline, mobile, enable, disable, status, help",
                )
                .await;
            }
            None => debug!(body = %body, "chat message matched no command"),
        }
    }

    /// Deliver a chat message from the fake contact on every live
    /// connection.
    async fn send_from_fake(&self, text: &str) {
        let connections = self.state.lock().await.connections.clone();
        for conn in connections {
            if let Err(e) = conn.send_fake_message(text).await {
                warn!(conn_id = conn.id(), error = %e, "failed to deliver fake message");
            }
        }
    }

    fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register_connection(self: &Arc<Self>, conn: Arc<ProxiedConnection>) {
        let mut st = self.state.lock().await;
        if let Some(timer) = st.idle_timer.take() {
            timer.abort();
            debug!("idle shutdown cancelled by new connection");
        }
        st.connections.push(conn);
        info!(active = st.connections.len(), "connection registered");
        if !st.intro_sent {
            st.intro_sent = true;
            let sup = Arc::clone(self);
            tokio::spawn(async move { sup.run_intro_sequence().await });
        }
    }

    async fn remove_connection(self: &Arc<Self>, id: u64) {
        let mut st = self.state.lock().await;
        let before = st.connections.len();
        st.connections.retain(|c| c.id() != id);
        if st.connections.len() < before && st.connections.is_empty() {
            info!("last client disconnected, arming idle shutdown");
            let sup = Arc::clone(self);
            st.idle_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(IDLE_SHUTDOWN_DELAY).await;
                info!(
                    idle_secs = IDLE_SHUTDOWN_DELAY.as_secs(),
                    "no clients reconnected, shutting down"
                );
                sup.stop().await;
            }));
        }
    }

    /// Welcome messages, sent once per process shortly after the first
    /// connection is up.
    async fn run_intro_sequence(self: Arc<Self>) {
        tokio::time::sleep(INTRO_DELAY).await;
        let label = self.effective_mode().await.label();
        let welcome = format!(
            "Welcome! Deceive is running and you are currently appearing {label}. \
             Despite what the game client may indicate, you are appearing offline \
             to your friends unless you manually disable Deceive."
        );
        let messages = [
            welcome.as_str(),
            "If you want to invite others while being offline, you may need to disable \
             Deceive for them to accept. You can enable Deceive again as soon as they \
             are in your lobby.",
            "To enable or disable Deceive, or to configure other settings, find Deceive \
             in your tray icons.",
            "Have fun!",
        ];
        for message in messages {
            self.send_from_fake(message).await;
            tokio::time::sleep(INTRO_MESSAGE_GAP).await;
        }
    }

    /// Tear everything down: connections first, then both listeners via the
    /// shutdown broadcast.
    pub async fn stop(&self) {
        info!("stopping interceptors");
        let connections = {
            let mut st = self.state.lock().await;
            if let Some(timer) = st.idle_timer.take() {
                timer.abort();
            }
            std::mem::take(&mut st.connections)
        };
        for conn in connections {
            conn.close().await;
        }
        let _ = self.shutdown_tx.send(());
    }
}

/// Bind the loopback TLS chat listener and serve until shutdown. Returns the
/// bound port, which the config interceptor writes into `chat.port`.
pub async fn start_chat_listener(
    supervisor: Arc<Supervisor>,
    acceptor: TlsAcceptor,
) -> Result<u16, String> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| format!("failed to bind chat listener: {e}"))?;
    let port = listener
        .local_addr()
        .map_err(|e| format!("failed to read chat listener address: {e}"))?
        .port();
    info!(port, "chat interceptor listening");

    let mut shutdown = supervisor.subscribe_shutdown();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(addr = %addr, "game client connecting");
                            let sup = supervisor.clone();
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_chat_client(sup, acceptor, stream).await {
                                    error!(error = %e, "chat connection failed");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "chat accept failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("chat interceptor stopped");
                    break;
                }
            }
        }
    });

    Ok(port)
}

/// Serve one accepted client connection for its whole lifetime.
async fn handle_chat_client(
    supervisor: Arc<Supervisor>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
) -> Result<(), String> {
    let conn_id = supervisor.next_connection_id();
    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| format!("client TLS handshake failed: {e}"))?;
    let (mut client_read, client_write) = tokio::io::split(tls);

    // The client has been observed to write its first bytes before the
    // config fetch reveals the real endpoint. Hold the connection and buffer
    // client bytes in order until the target is known.
    let mut shutdown = supervisor.subscribe_shutdown();
    let mut target_rx = supervisor.target_receiver();
    let mut pending: Vec<Vec<u8>> = Vec::new();
    let target = loop {
        if let Some(target) = supervisor.chat_target() {
            break target;
        }
        let mut buf = [0u8; READ_BUFFER_SIZE];
        tokio::select! {
            changed = target_rx.changed() => {
                if changed.is_err() {
                    return Err("supervisor dropped before chat target was known".to_string());
                }
            }
            read = client_read.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        info!(conn_id, "client closed before chat target was known");
                        return Ok(());
                    }
                    Ok(n) => {
                        debug!(conn_id, bytes = n, "buffering client bytes until chat target is known");
                        pending.push(buf[..n].to_vec());
                    }
                    Err(e) => return Err(format!("client read failed: {e}")),
                }
            }
            _ = shutdown.recv() => return Ok(()),
        }
    };

    let tcp = tokio::time::timeout(
        UPSTREAM_CONNECT_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| {
        format!(
            "timed out after {}s connecting to {}:{}",
            UPSTREAM_CONNECT_TIMEOUT.as_secs(),
            target.host,
            target.port
        )
    })?
    .map_err(|e| format!("failed to connect to {}:{}: {e}", target.host, target.port))?;

    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|e| format!("invalid chat host {}: {e}", target.host))?;
    let upstream = upstream_tls_connector()
        .connect(server_name, tcp)
        .await
        .map_err(|e| format!("upstream TLS handshake with {} failed: {e}", target.host))?;
    info!(conn_id, host = %target.host, port = target.port, "spliced to real chat server");
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let conn = Arc::new(ProxiedConnection::new(
        conn_id,
        Box::new(client_write),
        Box::new(upstream_write),
    ));
    supervisor.register_connection(conn.clone()).await;

    let result = pump_connection(&supervisor, &conn, client_read, upstream_read, pending).await;
    conn.close().await;
    supervisor.remove_connection(conn_id).await;
    result
}

/// Replay held client bytes, then pump both directions until either side
/// closes or shutdown is requested.
async fn pump_connection<C, U>(
    supervisor: &Arc<Supervisor>,
    conn: &Arc<ProxiedConnection>,
    mut client_read: C,
    mut upstream_read: U,
    pending: Vec<Vec<u8>>,
) -> Result<(), String>
where
    C: AsyncReadExt + Unpin + Send + 'static,
    U: AsyncReadExt + Unpin + Send + 'static,
{
    for chunk in pending {
        dispatch_incoming(supervisor, conn, &chunk).await?;
    }

    let mut shutdown = supervisor.subscribe_shutdown();

    let sup_in = supervisor.clone();
    let conn_in = conn.clone();
    let mut client_to_upstream = tokio::spawn(async move {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => {
                    info!(conn_id = conn_in.id(), "client closed connection");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = dispatch_incoming(&sup_in, &conn_in, &buf[..n]).await {
                        debug!(conn_id = conn_in.id(), error = %e, "incoming dispatch ended");
                        break;
                    }
                }
                Err(e) => {
                    debug!(conn_id = conn_in.id(), error = %e, "client read ended");
                    break;
                }
            }
        }
    });

    let conn_out = conn.clone();
    let mut upstream_to_client = tokio::spawn(async move {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match upstream_read.read(&mut buf).await {
                Ok(0) => {
                    info!(conn_id = conn_out.id(), "chat server closed connection");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = conn_out.handle_outgoing(&buf[..n]).await {
                        debug!(conn_id = conn_out.id(), error = %e, "outgoing dispatch ended");
                        break;
                    }
                }
                Err(e) => {
                    debug!(conn_id = conn_out.id(), error = %e, "upstream read ended");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut client_to_upstream => {}
        _ = &mut upstream_to_client => {}
        _ = shutdown.recv() => {}
    }
    client_to_upstream.abort();
    upstream_to_client.abort();
    Ok(())
}

/// Route one client chunk through the connection, then through the
/// supervisor when it turns out to be a command to the fake contact.
async fn dispatch_incoming(
    supervisor: &Arc<Supervisor>,
    conn: &Arc<ProxiedConnection>,
    chunk: &[u8],
) -> Result<(), String> {
    let (mode, enabled, connect_to_muc) = supervisor.rewrite_params().await;
    match conn.handle_incoming(mode, enabled, connect_to_muc, chunk).await? {
        Incoming::Forwarded => Ok(()),
        Incoming::Command(body) => {
            supervisor.handle_chat_command(&body).await;
            Ok(())
        }
    }
}
