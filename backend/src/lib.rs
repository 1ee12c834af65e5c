use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use santa_core::{Direction, Exchange, ExchangeError, Phase, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ExchangeRecord {
    pub event_id: Option<String>,
    pub exchange: Exchange,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DmPayload {
    Assignment {
        giftee_name: String,
        wishlist: String,
        address: String,
    },
    Reminder {
        text: String,
    },
    Anonymous {
        from_role: String,
        text: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Outbound {
    pub id: String,
    pub recipient: UserId,
    pub payload: DmPayload,
}

#[derive(Clone)]
pub struct AppState {
    record: Arc<RwLock<ExchangeRecord>>,
    dms: broadcast::Sender<Outbound>,
    persist_path: Option<PathBuf>,
}

impl Default for AppState {
    fn default() -> Self {
        let (dms, _) = broadcast::channel(64);
        Self {
            record: Arc::new(RwLock::new(ExchangeRecord::default())),
            dms,
            persist_path: None,
        }
    }
}

impl AppState {
    pub async fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut state = Self::default();
        state.persist_path = Some(path.clone());
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok(saved) = serde_json::from_slice::<ExchangeRecord>(&bytes) {
                *state.record.write().await = saved;
            }
        }
        state
    }

    async fn persist(&self) {
        if let Some(path) = &self.persist_path {
            let snapshot = {
                let record = self.record.read().await;
                record.clone()
            };
            if let Ok(json) = serde_json::to_vec_pretty(&snapshot) {
                if let Err(err) = tokio::fs::write(path, json).await {
                    tracing::warn!("persist error: {err}");
                }
            }
        }
    }

    // A send with no subscribers just drops the message; DMs are
    // best-effort until the recipient's socket attaches.
    fn deliver(&self, recipient: &str, payload: DmPayload) {
        let _ = self.dms.send(Outbound {
            id: Uuid::new_v4().to_string(),
            recipient: recipient.to_string(),
            payload,
        });
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct GatewayError(#[from] ExchangeError);

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ExchangeError::AlreadyActive
            | ExchangeError::NotCollecting
            | ExchangeError::AlreadyJoined => StatusCode::CONFLICT,
            ExchangeError::Unauthorized => StatusCode::UNAUTHORIZED,
            ExchangeError::InsufficientParticipants | ExchangeError::IncompleteInfo { .. } => {
                StatusCode::BAD_REQUEST
            }
            ExchangeError::NoActiveEvent
            | ExchangeError::NotAParticipant
            | ExchangeError::NoAssignment => StatusCode::NOT_FOUND,
            ExchangeError::PairingFailed => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if let ExchangeError::IncompleteInfo { missing } = &self.0 {
            let body = serde_json::json!({
                "error": self.0.to_string(),
                "missing": missing,
            });
            return (status, Json(body)).into_response();
        }
        (status, self.0.to_string()).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/event", post(create_event).get(get_event))
        .route("/event/start", post(start_event))
        .route("/event/cancel", post(cancel_event))
        .route("/event/remind", post(remind))
        .route("/join", post(join))
        .route("/wishlist", post(set_wishlist))
        .route("/address", post(set_address))
        .route("/participants", get(list_participants))
        .route("/partner/:user_id", get(partner_info))
        .route("/message", post(send_message))
        .route("/ws/:user_id", get(ws_handler))
        .with_state(state)
}

fn admin_token() -> String {
    env::var("ADMIN_TOKEN").unwrap_or_else(|_| "changeme".to_string())
}

fn is_admin(headers: &HeaderMap) -> bool {
    headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == admin_token())
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct UserRequest {
    user_id: String,
}

#[derive(Serialize)]
struct CreateEventResponse {
    event_id: String,
    phase: Phase,
}

async fn create_event(
    State(state): State<AppState>,
    Json(payload): Json<UserRequest>,
) -> Result<Response, GatewayError> {
    let mut record = state.record.write().await;
    record.exchange.create(payload.user_id.as_str())?;
    let event_id = Uuid::new_v4().to_string();
    record.event_id = Some(event_id.clone());
    drop(record);
    state.persist().await;

    tracing::info!(%event_id, creator = %payload.user_id, "exchange created");
    Ok((
        StatusCode::CREATED,
        Json(CreateEventResponse {
            event_id,
            phase: Phase::Collecting,
        }),
    )
        .into_response())
}

#[derive(Serialize)]
struct EventView {
    event_id: Option<String>,
    phase: Phase,
    participants: usize,
}

async fn get_event(State(state): State<AppState>) -> impl IntoResponse {
    let record = state.record.read().await;
    Json(EventView {
        event_id: record.event_id.clone(),
        phase: record.exchange.phase,
        participants: record.exchange.participants().len(),
    })
}

#[derive(Deserialize)]
struct JoinRequest {
    user_id: String,
    name: String,
}

#[derive(Serialize)]
struct JoinResponse {
    name: String,
    is_creator: bool,
}

async fn join(
    State(state): State<AppState>,
    Json(payload): Json<JoinRequest>,
) -> Result<Response, GatewayError> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, "name required").into_response());
    }

    let mut record = state.record.write().await;
    record.exchange.join(payload.user_id.clone(), name)?;
    let is_creator = record
        .exchange
        .participant(&payload.user_id)
        .map(|p| p.is_creator)
        .unwrap_or(false);
    drop(record);
    state.persist().await;

    tracing::info!(user = %payload.user_id, "participant joined");
    Ok((
        StatusCode::OK,
        Json(JoinResponse {
            name: name.to_string(),
            is_creator,
        }),
    )
        .into_response())
}

#[derive(Deserialize)]
struct InfoRequest {
    user_id: String,
    text: String,
}

#[derive(Serialize)]
struct InfoResponse {
    ready: bool,
}

async fn set_wishlist(
    State(state): State<AppState>,
    Json(payload): Json<InfoRequest>,
) -> Result<Response, GatewayError> {
    let mut record = state.record.write().await;
    record.exchange.set_wishlist(&payload.user_id, payload.text)?;
    let ready = record
        .exchange
        .participant(&payload.user_id)
        .map(|p| p.is_ready())
        .unwrap_or(false);
    drop(record);
    state.persist().await;

    tracing::info!(user = %payload.user_id, "wishlist updated");
    Ok((StatusCode::OK, Json(InfoResponse { ready })).into_response())
}

async fn set_address(
    State(state): State<AppState>,
    Json(payload): Json<InfoRequest>,
) -> Result<Response, GatewayError> {
    let mut record = state.record.write().await;
    record.exchange.set_address(&payload.user_id, payload.text)?;
    let ready = record
        .exchange
        .participant(&payload.user_id)
        .map(|p| p.is_ready())
        .unwrap_or(false);
    drop(record);
    state.persist().await;

    tracing::info!(user = %payload.user_id, "address updated");
    Ok((StatusCode::OK, Json(InfoResponse { ready })).into_response())
}

#[derive(Serialize)]
struct RosterEntry {
    name: String,
    ready: bool,
}

async fn list_participants(State(state): State<AppState>) -> impl IntoResponse {
    let record = state.record.read().await;
    let roster: Vec<RosterEntry> = record
        .exchange
        .participants()
        .iter()
        .map(|p| RosterEntry {
            name: p.name.clone(),
            ready: p.is_ready(),
        })
        .collect();
    Json(roster)
}

#[derive(Deserialize)]
struct StartParams {
    seed: Option<u64>,
}

#[derive(Serialize)]
struct StartResponse {
    phase: Phase,
    pairings: usize,
}

async fn start_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StartParams>,
    Json(payload): Json<UserRequest>,
) -> Result<Response, GatewayError> {
    let mut rng = params
        .seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(ChaCha8Rng::from_entropy);

    let mut record = state.record.write().await;
    record
        .exchange
        .start(&payload.user_id, is_admin(&headers), &mut rng)?;

    // Each giver learns who they drew; nobody learns who drew them.
    let mut assignments = Vec::new();
    for pairing in &record.exchange.pairings {
        if let Some(giftee) = record.exchange.participant(&pairing.receiver) {
            assignments.push((
                pairing.giver.clone(),
                DmPayload::Assignment {
                    giftee_name: giftee.name.clone(),
                    wishlist: giftee.wishlist.clone().unwrap_or_default(),
                    address: giftee.address.clone().unwrap_or_default(),
                },
            ));
        }
    }
    let pairings = record.exchange.pairings.len();
    drop(record);

    for (recipient, dm) in assignments {
        state.deliver(&recipient, dm);
    }
    state.persist().await;

    tracing::info!(participants = pairings, "exchange started");
    Ok((
        StatusCode::OK,
        Json(StartResponse {
            phase: Phase::Active,
            pairings,
        }),
    )
        .into_response())
}

async fn cancel_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UserRequest>,
) -> Result<Response, GatewayError> {
    let mut record = state.record.write().await;
    record.exchange.cancel(&payload.user_id, is_admin(&headers))?;
    record.event_id = None;
    drop(record);
    state.persist().await;

    tracing::info!(user = %payload.user_id, "exchange cancelled");
    Ok((StatusCode::OK, "exchange cancelled").into_response())
}

#[derive(Serialize)]
struct RemindResponse {
    reminded: Vec<String>,
}

async fn remind(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UserRequest>,
) -> Result<Response, GatewayError> {
    let record = state.record.read().await;
    let missing = record.exchange.remind(&payload.user_id, is_admin(&headers))?;

    let mut reminded = Vec::new();
    for user_id in &missing {
        if let Some(participant) = record.exchange.participant(user_id) {
            reminded.push(participant.name.clone());
            state.deliver(
                user_id,
                DmPayload::Reminder {
                    text: "please set your wishlist and address before the draw".to_string(),
                },
            );
        }
    }
    drop(record);

    tracing::info!(count = reminded.len(), "reminders sent");
    Ok((StatusCode::OK, Json(RemindResponse { reminded })).into_response())
}

#[derive(Serialize)]
struct PartnerView {
    name: String,
    wishlist: Option<String>,
    address: Option<String>,
}

async fn partner_info(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Response, GatewayError> {
    let record = state.record.read().await;
    let giftee = record.exchange.giftee_of(&user_id)?;
    Ok((
        StatusCode::OK,
        Json(PartnerView {
            name: giftee.name.clone(),
            wishlist: giftee.wishlist.clone(),
            address: giftee.address.clone(),
        }),
    )
        .into_response())
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum Counterpart {
    Gifter,
    Giftee,
}

#[derive(Deserialize)]
struct MessageRequest {
    user_id: String,
    to: Counterpart,
    text: String,
}

async fn send_message(
    State(state): State<AppState>,
    Json(payload): Json<MessageRequest>,
) -> Result<Response, GatewayError> {
    if payload.text.trim().is_empty() {
        return Ok((StatusCode::BAD_REQUEST, "message text required").into_response());
    }

    let direction = match payload.to {
        Counterpart::Giftee => Direction::ToGiftee,
        Counterpart::Gifter => Direction::ToGifter,
    };

    let record = state.record.read().await;
    let (recipient, text) = record.exchange.relay(&payload.user_id, direction, payload.text)?;
    drop(record);

    // The recipient sees only which role the message came from.
    let from_role = match direction {
        Direction::ToGiftee => "gifter",
        Direction::ToGifter => "giftee",
    };
    state.deliver(
        &recipient,
        DmPayload::Anonymous {
            from_role: from_role.to_string(),
            text,
        },
    );

    tracing::info!(direction = from_role, "anonymous message relayed");
    Ok((StatusCode::OK, "message sent").into_response())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(stream: WebSocket, state: AppState, user_id: String) {
    let (mut sender, mut receiver) = stream.split();

    let known = {
        let record = state.record.read().await;
        record.exchange.participant(&user_id).is_some()
    };
    if !known {
        let _ = sender.send(Message::Text("unknown user".into())).await;
        return;
    }

    let mut rx = state.dms.subscribe();
    let mut send_task = tokio::spawn(async move {
        while let Ok(outbound) = rx.recv().await {
            // One shared outbox; each socket forwards only its own mail.
            if outbound.recipient != user_id {
                continue;
            }
            let Ok(json) = serde_json::to_string(&outbound) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Drain the client side so pings and closes are observed.
    let recv_task = tokio::spawn(async move { while let Some(Ok(_)) = receiver.next().await {} });

    let _ = (&mut send_task).await;
    recv_task.abort();
}
