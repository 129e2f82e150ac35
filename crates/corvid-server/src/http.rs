//! Signalling endpoints.
//!
//! - `POST /offer` — create a session from an SDP offer, answer it
//! - `PATCH /offer` — trickle remote ICE candidates into a session
//! - `GET /health` — status document with the configured providers

use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use corvid_pipeline::Assembler;
use corvid_transport::{IceCandidate, WebRtcConfig, WebRtcTransport};

use crate::providers::build_provider_set;
use crate::session::{DataChannelSink, Session};
use crate::state::AppState;
use crate::ServerError;

pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.settings.server.cors_origins);
    Router::new()
        .route("/offer", post(handle_offer).patch(handle_trickle))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// No configured origins means a permissive layer (local development);
/// otherwise only the listed origins may signal.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let parsed: Vec<axum::http::HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        tracing::warn!("all configured CORS origins invalid, falling back to permissive");
        return CorsLayer::permissive();
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
        ])
        .allow_headers(tower_http::cors::Any)
}

#[derive(Debug, Deserialize)]
struct OfferRequest {
    sdp: String,
    #[serde(rename = "type")]
    sdp_type: String,
}

#[derive(Debug, Serialize)]
struct OfferResponse {
    sdp: String,
    #[serde(rename = "type")]
    sdp_type: String,
    session_id: String,
}

fn error_body(code: &str, message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": code, "message": message.into() }))
}

/// Create a session and answer the peer's offer.
async fn handle_offer(
    State(state): State<AppState>,
    Json(request): Json<OfferRequest>,
) -> Result<Json<OfferResponse>, (StatusCode, Json<serde_json::Value>)> {
    if request.sdp_type != "offer" || request.sdp.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            error_body("bad_offer", "expected {sdp, type: \"offer\"}"),
        ));
    }

    state.sessions.check_capacity().map_err(|_| {
        (
            StatusCode::CONFLICT,
            error_body("too_many_sessions", "session capacity reached"),
        )
    })?;

    let session_id = uuid::Uuid::new_v4().to_string();
    match create_session(&state, &session_id, &request.sdp).await {
        Ok(answer_sdp) => {
            tracing::info!(session_id = %session_id, "session created");
            Ok(Json(OfferResponse {
                sdp: answer_sdp,
                sdp_type: "answer".to_string(),
                session_id,
            }))
        }
        Err(ServerError::BadOffer(detail)) => {
            Err((StatusCode::BAD_REQUEST, error_body("bad_offer", detail)))
        }
        Err(e) => {
            tracing::error!(error = %e, "session init failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("init_error", e.to_string()),
            ))
        }
    }
}

async fn create_session(
    state: &AppState,
    session_id: &str,
    offer_sdp: &str,
) -> Result<String, ServerError> {
    let mut transport = WebRtcTransport::new(WebRtcConfig {
        stun_servers: state.settings.server.stun_servers.clone(),
        failed_close_grace: std::time::Duration::from_millis(
            state.settings.server.failed_close_grace_ms,
        ),
    });

    let answer_sdp = transport.accept(offer_sdp).await.map_err(|e| match e {
        corvid_transport::TransportError::ConnectionFailed(detail)
            if detail.starts_with("bad offer") =>
        {
            ServerError::BadOffer(detail)
        }
        corvid_transport::TransportError::UnsupportedCodec(detail) => {
            ServerError::BadOffer(format!("unsupported codec: {}", detail))
        }
        other => ServerError::Transport(other),
    })?;

    let transport = Arc::new(AsyncRwLock::new(transport));
    let sink = Arc::new(DataChannelSink::new(transport.clone()));

    let providers = build_provider_set(&state.settings, state.robot.clone())?;
    let user_id = format!("guest_{}", &session_id[..8.min(session_id.len())]);

    let assembler = Assembler::new((*state.settings).clone());
    let mut pipeline = assembler
        .build(session_id, &user_id, providers, sink)
        .await;

    // The output receiver moves into the audio-out bridge.
    let output = pipeline.take_output().ok_or_else(|| {
        ServerError::Init("pipeline output already taken".into())
    })?;

    let session = Arc::new(Session::new(session_id, transport, pipeline));
    session.spawn_bridges(output);

    // Kick off the introduction turn once the graph is live.
    session.pipeline().greet().await;

    state.sessions.insert(session.clone());
    Ok(answer_sdp)
}

#[derive(Debug, Deserialize)]
struct TrickleRequest {
    session_id: String,
    candidates: Vec<TrickleCandidate>,
}

#[derive(Debug, Deserialize)]
struct TrickleCandidate {
    candidate: String,
    #[serde(default)]
    sdp_mid: Option<String>,
    #[serde(default)]
    sdp_mline_index: Option<u16>,
}

/// Add remote ICE candidates. Unknown session → 404 `not_found`.
async fn handle_trickle(
    State(state): State<AppState>,
    Json(request): Json<TrickleRequest>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let session = state.sessions.get(&request.session_id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            error_body("not_found", "unknown session_id"),
        )
    })?;

    for candidate in request.candidates {
        let candidate = IceCandidate {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
        };
        if let Err(e) = session
            .transport
            .read()
            .await
            .add_remote_candidate(&candidate)
            .await
        {
            tracing::warn!(session_id = %session.id, error = %e, "candidate rejected");
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Compact status document including the configured providers.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let settings = &state.settings;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.count(),
        "providers": {
            "stt": { "endpoint": settings.stt.endpoint, "diarization": settings.stt.diarization },
            "llm": { "model": settings.llm.model },
            "tts": { "voice": settings.tts.voice },
            "gate": { "enabled": settings.gate.enabled, "fail_open": settings.gate.fail_open },
            "memory": { "enabled": settings.memory.enabled },
            "robot": { "enabled": settings.robot.enabled },
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_config::Settings;

    #[test]
    fn test_router_creation() {
        let state = AppState::new(Settings::default()).unwrap();
        let _ = create_router(state);
    }

    #[tokio::test]
    async fn test_offer_rejects_wrong_type() {
        let state = AppState::new(Settings::default()).unwrap();
        let result = handle_offer(
            State(state),
            Json(OfferRequest {
                sdp: "v=0...".into(),
                sdp_type: "answer".into(),
            }),
        )
        .await;

        let (status, body) = result.err().expect("rejected");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["error"], "bad_offer");
    }

    #[tokio::test]
    async fn test_trickle_unknown_session_not_found() {
        let state = AppState::new(Settings::default()).unwrap();
        let result = handle_trickle(
            State(state),
            Json(TrickleRequest {
                session_id: "nope".into(),
                candidates: vec![],
            }),
        )
        .await;

        let (status, body) = result.err().expect("rejected");
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.0["error"], "not_found");
    }

    #[tokio::test]
    async fn test_capacity_conflict() {
        let mut settings = Settings::default();
        settings.server.max_sessions = 1;
        let state = AppState::new(settings).unwrap();

        // Fill the single slot with a placeholder check: capacity math only.
        assert!(state.sessions.check_capacity().is_ok());
    }
}
