//! Bootstrap configuration interceptor.
//!
//! A loopback HTTP reverse proxy the game client is pointed at via
//! `--client-config-url`. Every request is forwarded to Riot's real
//! clientconfig service; 2xx JSON responses come back with the chat endpoint
//! rewritten to our TLS listener (and bad-cert acceptance switched on) so the
//! client connects to us instead. The real chat endpoint seen in the first
//! successful rewrite is handed to the supervisor exactly once.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine as _;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::{ChatTarget, Supervisor};

/// Riot's client bootstrap configuration service.
const CLIENT_CONFIG_URL: &str = "https://clientconfig.rpg.riotgames.com";

/// Player Affinity Service: resolves the player's geographic chat shard.
const PAS_URL: &str = "https://riot-geo.pas.si.riotgames.com/pas/v1/service/chat";

/// The affinity lookup must never stall the config response the client is
/// blocked on; on timeout the pre-affinity chat host is used.
const PAS_TIMEOUT: Duration = Duration::from_secs(5);

/// Request headers forwarded to the upstream config service. Everything else
/// the client sends stays local.
const FORWARDED_HEADERS: [&str; 3] = ["user-agent", "authorization", "x-riot-entitlements-jwt"];

struct InterceptorCtx {
    supervisor: Arc<Supervisor>,
    chat_port: u16,
    http: reqwest::Client,
    config_url: String,
    pas_url: String,
}

/// Bind the config interceptor on `127.0.0.1:0` and serve until the
/// supervisor shuts down. Returns the bound port for the launch flags.
pub async fn start_config_listener(
    supervisor: Arc<Supervisor>,
    chat_port: u16,
) -> Result<u16, String> {
    start_with_upstream(
        supervisor,
        chat_port,
        CLIENT_CONFIG_URL.to_string(),
        PAS_URL.to_string(),
    )
    .await
}

pub(crate) async fn start_with_upstream(
    supervisor: Arc<Supervisor>,
    chat_port: u16,
    config_url: String,
    pas_url: String,
) -> Result<u16, String> {
    super::init_crypto_provider();
    let http = reqwest::Client::builder()
        .build()
        .map_err(|e| format!("failed to build HTTP client: {e}"))?;

    let mut shutdown = supervisor.subscribe_shutdown();
    let ctx = Arc::new(InterceptorCtx {
        supervisor,
        chat_port,
        http,
        config_url,
        pas_url,
    });

    let app = Router::new().fallback(intercept).with_state(ctx);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| format!("failed to bind config listener: {e}"))?;
    let port = listener
        .local_addr()
        .map_err(|e| format!("failed to read config listener address: {e}"))?
        .port();
    info!(port, "config interceptor listening");

    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "config interceptor stopped unexpectedly");
        }
        info!("config interceptor stopped");
    });

    Ok(port)
}

/// Forward any request to the real config service and rewrite the answer.
async fn intercept(State(ctx): State<Arc<InterceptorCtx>>, req: Request) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", ctx.config_url, path_and_query);
    debug!(url = %url, method = %req.method(), "forwarding config request");

    let mut upstream_req = ctx.http.request(req.method().clone(), &url);
    for name in FORWARDED_HEADERS {
        if let Some(value) = req.headers().get(name) {
            upstream_req = upstream_req.header(name, value.clone());
        }
    }

    let upstream_resp = match upstream_req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!(url = %url, error = %e, "config upstream request failed");
            return (StatusCode::BAD_GATEWAY, "config upstream unreachable").into_response();
        }
    };

    let status = upstream_resp.status();
    let body = match upstream_resp.bytes().await {
        Ok(body) => body,
        Err(e) => {
            error!(url = %url, error = %e, "failed to read config upstream body");
            return (StatusCode::BAD_GATEWAY, "config upstream unreachable").into_response();
        }
    };

    if !status.is_success() {
        debug!(status = %status, "relaying non-2xx config response");
        return json_response(status, body.to_vec());
    }

    let mut config: Value = match serde_json::from_slice(&body) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) | Err(_) => {
            // The client may still work with the raw body; chat just will
            // not be intercepted for this response.
            warn!(url = %url, "config response is not a JSON object, passing through");
            return json_response(StatusCode::OK, body.to_vec());
        }
    };

    let affinity = if affinity_lookup_wanted(&config, req.headers()) {
        resolve_affinity(&ctx, req.headers().get(header::AUTHORIZATION)).await
    } else {
        None
    };

    if let Some(target) = apply_rewrite(&mut config, ctx.chat_port, affinity.as_deref()) {
        ctx.supervisor.set_chat_target(target);
    }

    json_response(StatusCode::OK, config.to_string().into_bytes())
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// The PAS lookup only makes sense when the config carries an affinity map,
/// affinity routing is switched on, and we hold the player's bearer token.
fn affinity_lookup_wanted(config: &Value, headers: &HeaderMap) -> bool {
    config.get("chat.affinities").is_some_and(Value::is_object)
        && config.get("chat.affinity.enabled").and_then(Value::as_bool) == Some(true)
        && headers.contains_key(header::AUTHORIZATION)
}

/// Ask PAS which chat shard this player maps to. Every failure is swallowed;
/// the caller then keeps the host already present in the config.
async fn resolve_affinity(ctx: &InterceptorCtx, auth: Option<&HeaderValue>) -> Option<String> {
    let auth = auth?;
    let response = ctx
        .http
        .get(&ctx.pas_url)
        .header(header::AUTHORIZATION, auth.clone())
        .timeout(PAS_TIMEOUT)
        .send()
        .await
        .map_err(|e| debug!(error = %e, "PAS affinity request failed"))
        .ok()?;
    let token = response
        .text()
        .await
        .map_err(|e| debug!(error = %e, "PAS affinity body read failed"))
        .ok()?;

    let affinity = decode_affinity_token(&token);
    match &affinity {
        Some(aff) => debug!(affinity = %aff, "resolved player affinity"),
        None => debug!("PAS response was not a decodable JWT"),
    }
    affinity
}

/// Pull the `affinity` claim out of a PAS JWT (`header.payload.signature`).
fn decode_affinity_token(token: &str) -> Option<String> {
    let payload = token.trim().split('.').nth(1)?;
    let decoded = BASE64_URL.decode(payload).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("affinity")?.as_str().map(|s| s.to_string())
}

/// Rewrite the chat endpoint fields of a bootstrap config in place.
///
/// Returns the real chat endpoint when both host and port were present, for
/// one-shot emission to the supervisor. `affinity` is the already-resolved
/// shard name; when it names an entry in `chat.affinities` that entry
/// supersedes `chat.host` as the real endpoint.
fn apply_rewrite(config: &mut Value, chat_port: u16, affinity: Option<&str>) -> Option<ChatTarget> {
    let mut chat_host = None;
    let mut real_port = 0u16;

    if let Some(host) = config.get("chat.host").and_then(Value::as_str) {
        chat_host = Some(host.to_string());
        config["chat.host"] = Value::from("127.0.0.1");
    }

    if let Some(port) = config.get("chat.port").and_then(Value::as_u64) {
        real_port = port as u16;
        config["chat.port"] = Value::from(chat_port);
    }

    if config.get("chat.allow_bad_cert.enabled").is_some() {
        config["chat.allow_bad_cert.enabled"] = Value::from(true);
    }

    if let Some(affinities) = config
        .get_mut("chat.affinities")
        .and_then(Value::as_object_mut)
    {
        if let Some(host) = affinity
            .and_then(|aff| affinities.get(aff))
            .and_then(Value::as_str)
        {
            chat_host = Some(host.to_string());
        }
        for value in affinities.values_mut() {
            *value = Value::from("127.0.0.1");
        }
    }

    match (chat_host, real_port) {
        (Some(host), port) if !host.is_empty() && port != 0 => Some(ChatTarget { host, port }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rewriter::PresenceMode;
    use serde_json::json;

    fn fixture() -> Value {
        json!({
            "chat.host": "chat.na.lol.riotgames.com",
            "chat.port": 5223,
            "chat.affinities": {"na1": "a", "eu1": "b"},
            "chat.allow_bad_cert.enabled": false,
        })
    }

    // --- apply_rewrite ---

    #[test]
    fn test_rewrite_points_chat_at_loopback() {
        let mut config = fixture();
        let target = apply_rewrite(&mut config, 54321, None).unwrap();

        assert_eq!(target.host, "chat.na.lol.riotgames.com");
        assert_eq!(target.port, 5223);
        assert_eq!(
            config,
            json!({
                "chat.host": "127.0.0.1",
                "chat.port": 54321,
                "chat.affinities": {"na1": "127.0.0.1", "eu1": "127.0.0.1"},
                "chat.allow_bad_cert.enabled": true,
            })
        );
    }

    #[test]
    fn test_rewrite_affinity_overrides_host() {
        let mut config = fixture();
        config["chat.affinities"]["eu1"] = Value::from("chat.eu1.lol.riotgames.com");
        let target = apply_rewrite(&mut config, 54321, Some("eu1")).unwrap();
        assert_eq!(target.host, "chat.eu1.lol.riotgames.com");
        assert_eq!(config["chat.affinities"]["eu1"], "127.0.0.1");
    }

    #[test]
    fn test_rewrite_unknown_affinity_keeps_host() {
        let mut config = fixture();
        let target = apply_rewrite(&mut config, 54321, Some("kr1")).unwrap();
        assert_eq!(target.host, "chat.na.lol.riotgames.com");
    }

    #[test]
    fn test_rewrite_without_chat_fields_yields_no_target() {
        let mut config = json!({"other.key": 1});
        assert!(apply_rewrite(&mut config, 54321, None).is_none());
        assert_eq!(config, json!({"other.key": 1}));
    }

    #[test]
    fn test_rewrite_host_only_yields_no_target() {
        let mut config = json!({"chat.host": "chat.example.com"});
        assert!(apply_rewrite(&mut config, 54321, None).is_none());
        assert_eq!(config["chat.host"], "127.0.0.1");
    }

    #[test]
    fn test_rewrite_leaves_absent_bad_cert_flag_absent() {
        let mut config = json!({"chat.host": "h", "chat.port": 5223});
        apply_rewrite(&mut config, 54321, None);
        assert!(config.get("chat.allow_bad_cert.enabled").is_none());
    }

    #[test]
    fn test_rewrite_ignores_non_string_host() {
        let mut config = json!({"chat.host": 42, "chat.port": 5223});
        assert!(apply_rewrite(&mut config, 54321, None).is_none());
        assert_eq!(config["chat.host"], 42);
    }

    // --- affinity token decoding ---

    #[test]
    fn test_decode_affinity_token() {
        let payload = BASE64_URL.encode(r#"{"affinity":"eu1","sub":"player"}"#);
        let token = format!("eyJhbGciOiJIUzI1NiJ9.{payload}.c2ln");
        assert_eq!(decode_affinity_token(&token), Some("eu1".to_string()));
    }

    #[test]
    fn test_decode_affinity_token_garbage() {
        assert_eq!(decode_affinity_token("not a jwt"), None);
        assert_eq!(decode_affinity_token("a.!!!.c"), None);
        let payload = BASE64_URL.encode(r#"{"no_affinity":true}"#);
        assert_eq!(decode_affinity_token(&format!("a.{payload}.c")), None);
    }

    #[test]
    fn test_affinity_lookup_wanted_requires_all_three() {
        let mut headers = HeaderMap::new();
        let mut config = fixture();

        assert!(!affinity_lookup_wanted(&config, &headers), "no auth header");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        assert!(!affinity_lookup_wanted(&config, &headers), "flag missing");

        config["chat.affinity.enabled"] = Value::from(true);
        assert!(affinity_lookup_wanted(&config, &headers));

        config["chat.affinities"] = Value::from("not an object");
        assert!(!affinity_lookup_wanted(&config, &headers));
    }

    // --- end-to-end against a mock upstream ---

    async fn spawn_mock_upstream(status: StatusCode, body: String) -> u16 {
        let app = Router::new().fallback(move || {
            let body = body.clone();
            async move { (status, body) }
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_intercept_rewrites_and_emits_target_once() {
        let upstream_port = spawn_mock_upstream(StatusCode::OK, fixture().to_string()).await;
        let supervisor = Arc::new(Supervisor::new(PresenceMode::Offline, true));
        let port = start_with_upstream(
            supervisor.clone(),
            54321,
            format!("http://127.0.0.1:{upstream_port}"),
            "http://127.0.0.1:1/unused".to_string(),
        )
        .await
        .unwrap();

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/v1/config/player"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(
            body,
            json!({
                "chat.host": "127.0.0.1",
                "chat.port": 54321,
                "chat.affinities": {"na1": "127.0.0.1", "eu1": "127.0.0.1"},
                "chat.allow_bad_cert.enabled": true,
            })
        );

        let target = supervisor.chat_target().expect("target must be recorded");
        assert_eq!(target.host, "chat.na.lol.riotgames.com");
        assert_eq!(target.port, 5223);

        // A second fetch does not move the recorded target.
        let _ = reqwest::get(format!("http://127.0.0.1:{port}/api/v1/config/player"))
            .await
            .unwrap();
        assert_eq!(supervisor.chat_target().unwrap().port, 5223);
    }

    #[tokio::test]
    async fn test_intercept_relays_upstream_errors() {
        let upstream_port =
            spawn_mock_upstream(StatusCode::FORBIDDEN, r#"{"error":"no"}"#.to_string()).await;
        let supervisor = Arc::new(Supervisor::new(PresenceMode::Offline, true));
        let port = start_with_upstream(
            supervisor.clone(),
            54321,
            format!("http://127.0.0.1:{upstream_port}"),
            "http://127.0.0.1:1/unused".to_string(),
        )
        .await
        .unwrap();

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/anything"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
        assert_eq!(resp.text().await.unwrap(), r#"{"error":"no"}"#);
        assert!(supervisor.chat_target().is_none());
    }

    #[tokio::test]
    async fn test_intercept_passes_through_unparseable_body() {
        let upstream_port =
            spawn_mock_upstream(StatusCode::OK, "definitely not json".to_string()).await;
        let supervisor = Arc::new(Supervisor::new(PresenceMode::Offline, true));
        let port = start_with_upstream(
            supervisor.clone(),
            54321,
            format!("http://127.0.0.1:{upstream_port}"),
            "http://127.0.0.1:1/unused".to_string(),
        )
        .await
        .unwrap();

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "definitely not json");
        assert!(supervisor.chat_target().is_none());
    }

    #[tokio::test]
    async fn test_intercept_unreachable_upstream_is_bad_gateway() {
        let supervisor = Arc::new(Supervisor::new(PresenceMode::Offline, true));
        // Port 9 (discard) is almost certainly closed for TCP on loopback.
        let port = start_with_upstream(
            supervisor,
            54321,
            "http://127.0.0.1:9".to_string(),
            "http://127.0.0.1:1/unused".to_string(),
        )
        .await
        .unwrap();

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_intercept_resolves_affinity_via_pas() {
        let mut config = fixture();
        config["chat.affinity.enabled"] = Value::from(true);
        config["chat.affinities"]["eu1"] = Value::from("chat.eu1.lol.riotgames.com");
        let upstream_port = spawn_mock_upstream(StatusCode::OK, config.to_string()).await;

        let payload = BASE64_URL.encode(r#"{"affinity":"eu1"}"#);
        let pas_port =
            spawn_mock_upstream(StatusCode::OK, format!("eyJhbGciOiJub25lIn0.{payload}.c2ln"))
                .await;

        let supervisor = Arc::new(Supervisor::new(PresenceMode::Offline, true));
        let port = start_with_upstream(
            supervisor.clone(),
            54321,
            format!("http://127.0.0.1:{upstream_port}"),
            format!("http://127.0.0.1:{pas_port}/pas/v1/service/chat"),
        )
        .await
        .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://127.0.0.1:{port}/api/v1/config/player"))
            .header("Authorization", "Bearer token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let target = supervisor.chat_target().unwrap();
        assert_eq!(target.host, "chat.eu1.lol.riotgames.com");
        assert_eq!(target.port, 5223);
    }
}
