//! WebSocket listener and per-session wiring.
//!
//! Each upgraded connection checks a provider set out of the pool, spawns
//! the five session tasks (orchestrator, audio consumer, TTS worker, egress
//! worker, and the read loop living in this module), and tears everything
//! down exactly once when the socket goes away.

use anyhow::{Context, Result};
use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::asr::AsrAdapter;
use crate::audio::egress::{run_egress_worker, EGRESS_QUEUE_SIZE};
use crate::audio::ingress::{run_audio_ingress, AudioIngress, INGRESS_QUEUE_SIZE};
use crate::config::{AuthConfig, Config};
use crate::connection::{Connection, Frame};
use crate::dialogue::DialogueHistory;
use crate::pool::{ProviderSet, ResourcePool};
use crate::protocol::AudioParams;
use crate::queue::BoundedQueue;
use crate::session::handlers::run_orchestrator;
use crate::session::turn::SessionAsrBridge;
use crate::session::{SessionCtx, SessionEvent, SessionState, Shutdown};
use crate::tools::local::register_local_tools;
use crate::tools::ToolRegistry;
use crate::tts::cache::QuickReplyCache;
use crate::tts::run_tts_worker;

/// Orchestrator event queue capacity.
const EVENT_QUEUE_SIZE: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<ResourcePool>,
}

/// Bind the listener and serve until the process is stopped.
pub async fn start(config: Config) -> Result<()> {
    let pool = Arc::new(ResourcePool::init(&config).await?);
    let config = Arc::new(config);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route(&config.server.ws_path, get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            config: config.clone(),
            pool,
        });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;
    tracing::info!(%addr, path = %config.server.ws_path, "voicehub listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app).await.context("server error")
}

fn header_snapshot(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

/// Token/allow-list gate applied before the upgrade completes.
fn authorize(auth: &AuthConfig, headers: &HashMap<String, String>, device_id: &str) -> bool {
    if !auth.enabled {
        return true;
    }
    if !device_id.is_empty() && auth.allowed_devices.iter().any(|d| d == device_id) {
        return true;
    }
    headers
        .get("authorization")
        .map(|v| v.trim_start_matches("Bearer ").trim())
        .map(|token| auth.tokens.iter().any(|t| t == token))
        .unwrap_or(false)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let snapshot = header_snapshot(&headers);
    let device_id = snapshot
        .get("device-id")
        .or_else(|| query.get("device-id"))
        .cloned()
        .unwrap_or_default();
    let client_id = snapshot
        .get("client-id")
        .or_else(|| query.get("client-id"))
        .cloned()
        .unwrap_or_default();

    let verified = authorize(&state.config.server.auth, &snapshot, &device_id);
    if state.config.server.auth.enabled && !verified {
        tracing::warn!(device_id, "unauthorized connection rejected");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    ws.on_upgrade(move |socket| {
        handle_session(socket, state, device_id, client_id, snapshot, verified)
    })
}

async fn handle_session(
    socket: WebSocket,
    app: AppState,
    device_id: String,
    client_id: String,
    headers: HashMap<String, String>,
    device_verified: bool,
) {
    let conn = Arc::new(Connection::from_socket(socket));

    let set = match app.pool.checkout() {
        Ok(set) => set,
        Err(e) => {
            tracing::error!(device_id, error = %e, "closing connection, no providers available");
            conn.close().await;
            return;
        }
    };

    let session_id = if device_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        format!("{}-{}", device_id, uuid::Uuid::new_v4().simple())
    };
    tracing::info!(session_id, device_id, client_id, "session opened");

    run_session(
        app.config.clone(),
        conn.clone(),
        &set,
        session_id,
        device_id,
        client_id,
        headers,
        device_verified,
    )
    .await;

    conn.close().await;
    app.pool.give_back(set).await;
}

/// Build the session context, spawn the pipeline tasks, and run the read
/// loop until the connection dies. Teardown happens exactly once. The
/// upgrade handler calls this with a socket-backed connection; the test
/// suites drive it over in-memory transports.
#[allow(clippy::too_many_arguments)]
pub async fn run_session(
    config: Arc<Config>,
    conn: Arc<Connection>,
    set: &ProviderSet,
    session_id: String,
    device_id: String,
    client_id: String,
    headers: HashMap<String, String>,
    device_verified: bool,
) {
    let server_audio = AudioParams {
        format: config.audio.format.clone(),
        sample_rate: config.audio.sample_rate,
        channels: config.audio.channels,
        frame_duration: config.audio.frame_duration_ms,
    };
    let state = Arc::new(SessionState::new(
        session_id.clone(),
        device_id.clone(),
        client_id,
        headers,
        server_audio,
        device_verified,
    ));

    let tts_queue = Arc::new(BoundedQueue::new(crate::tts::TTS_QUEUE_SIZE));
    let egress_queue = Arc::new(BoundedQueue::new(EGRESS_QUEUE_SIZE));
    let audio_queue = Arc::new(BoundedQueue::new(INGRESS_QUEUE_SIZE));
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(EVENT_QUEUE_SIZE);
    let shutdown = Arc::new(Shutdown::new());
    let ingress = Arc::new(AudioIngress::new());

    let bridge = Arc::new(SessionAsrBridge::new(
        state.clone(),
        tts_queue.clone(),
        egress_queue.clone(),
        event_tx.clone(),
        config.audio.delete_audio,
        config.listen.realtime_continue_recognition,
    ));
    let asr = AsrAdapter::attach(set.asr.clone(), bridge);

    let registry = Arc::new(ToolRegistry::new());
    register_local_tools(&registry);
    if let Err(e) = set.mcp.bind(&conn, &session_id, &registry).await {
        tracing::warn!(session_id, error = %e, "mcp bind failed");
    }

    let mut history = DialogueHistory::new();
    history.set_system(config.rendered_system_prompt());
    let history = Arc::new(Mutex::new(history));

    let quick_cache = if config.chat.quick_reply.enabled {
        let info = set.tts.voice_info();
        match QuickReplyCache::new(&config.chat.quick_reply.cache_dir, &info.provider, &info.voice) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "quick-reply cache unavailable");
                None
            }
        }
    } else {
        None
    };

    let ctx = Arc::new(SessionCtx {
        config: config.clone(),
        state: state.clone(),
        conn: conn.clone(),
        history,
        asr: asr.clone(),
        llm: set.llm.clone(),
        tts: set.tts.clone(),
        vllm: set.vllm.clone(),
        registry: registry.clone(),
        mcp: set.mcp.clone(),
        ingress: ingress.clone(),
        tts_queue: tts_queue.clone(),
        egress_queue: egress_queue.clone(),
        quick_cache: quick_cache.clone(),
        events: event_tx.clone(),
        shutdown: shutdown.clone(),
    });

    let orchestrator = tokio::spawn(run_orchestrator(ctx.clone(), event_rx));
    let audio_task = tokio::spawn(run_audio_ingress(
        state.clone(),
        ingress,
        audio_queue.clone(),
        asr.clone(),
    ));
    let tts_task = tokio::spawn(run_tts_worker(
        state.clone(),
        set.tts.clone(),
        tts_queue.clone(),
        egress_queue.clone(),
        quick_cache,
        config.chat.quick_reply.words.clone(),
    ));
    let egress_task = tokio::spawn(run_egress_worker(
        state.clone(),
        conn.clone(),
        asr.clone(),
        egress_queue.clone(),
        config.audio.clone(),
        shutdown.clone(),
    ));
    let watchdog = asr.spawn_watchdog(shutdown.subscribe());

    // The read loop: classify frames onto the event and audio queues
    let mut stop_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            frame = conn.read_frame() => match frame {
                Ok(Some(Frame::Text(text))) => {
                    if event_tx.send(SessionEvent::InboundText(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Frame::Binary(data))) => {
                    if audio_queue.push(data).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::info!(session_id, device_id, error = %e, "read loop ended");
                    break;
                }
            },
            _ = stop_rx.changed() => break,
        }
    }

    // Teardown, guarded by the once-only shutdown
    shutdown.trigger();
    tts_queue.close();
    egress_queue.close();
    audio_queue.close();
    watchdog.abort();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = orchestrator.await;
        let _ = audio_task.await;
        let _ = tts_task.await;
        let _ = egress_task.await;
    })
    .await;

    tracing::info!(session_id, device_id, "session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(enabled: bool, tokens: Vec<&str>, devices: Vec<&str>) -> AuthConfig {
        AuthConfig {
            enabled,
            tokens: tokens.into_iter().map(String::from).collect(),
            allowed_devices: devices.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn test_auth_disabled_allows_all() {
        assert!(authorize(&auth(false, vec![], vec![]), &HashMap::new(), ""));
    }

    #[test]
    fn test_auth_token_match() {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), "Bearer secret-1".to_string());
        assert!(authorize(&auth(true, vec!["secret-1"], vec![]), &headers, "d1"));
        headers.insert("authorization".to_string(), "Bearer wrong".to_string());
        assert!(!authorize(&auth(true, vec!["secret-1"], vec![]), &headers, "d1"));
    }

    #[test]
    fn test_auth_device_allow_list() {
        assert!(authorize(
            &auth(true, vec![], vec!["aa:bb:cc"]),
            &HashMap::new(),
            "aa:bb:cc"
        ));
        assert!(!authorize(
            &auth(true, vec![], vec!["aa:bb:cc"]),
            &HashMap::new(),
            "dd:ee:ff"
        ));
    }
}
