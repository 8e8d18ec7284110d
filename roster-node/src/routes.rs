use crate::AppState;
use crate::error::{AppError, NodeError};
use crate::node::LoginDecision;
use crate::validation;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_macros::debug_handler;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Deserialize)]
pub(crate) struct LoginRequest {
    player: String,
    address: IpAddr,
}

#[derive(Deserialize)]
pub(crate) struct DisconnectRequest {
    player: String,
}

#[derive(Deserialize)]
pub(crate) struct SwitchRequest {
    player: String,
    server: String,
}

#[derive(Deserialize)]
pub(crate) struct CommandRequest {
    command: String,
}

#[derive(Serialize)]
pub(crate) struct LoginResponse {
    allowed: bool,
}

#[derive(Serialize)]
pub(crate) struct PlayersResponse {
    players: Vec<String>,
}

#[derive(Serialize)]
pub(crate) struct CountResponse {
    count: usize,
}

#[derive(Serialize)]
pub(crate) struct PlayerResponse {
    player: String,
    server: Option<String>,
    proxy: Option<String>,
    ip: Option<IpAddr>,
    last_online: i64,
}

#[derive(Serialize)]
pub(crate) struct ProxiesResponse {
    node_id: String,
    proxies: Vec<String>,
}

fn sorted(players: HashSet<String>) -> Vec<String> {
    let mut players: Vec<String> = players.into_iter().collect();
    players.sort();
    players
}

/// Wait for a dispatched lifecycle task.
async fn finished(task: JoinHandle<Result<(), NodeError>>) -> Result<(), AppError> {
    task.await
        .map_err(|err| AppError::Internal(err.to_string()))?
        .map_err(AppError::from)
}

#[debug_handler]
pub(crate) async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_player_name(&payload.player)?;

    match state.node.on_login(&payload.player, payload.address).await? {
        LoginDecision::Allowed => Ok((StatusCode::OK, Json(LoginResponse { allowed: true }))),
        LoginDecision::Denied => Err(AppError::AlreadyOnline(payload.player)),
    }
}

#[debug_handler]
pub(crate) async fn post_login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_player_name(&payload.player)?;

    state.sessions.connect(&payload.player, payload.address).await;
    finished(state.node.on_post_login(&payload.player, payload.address)).await?;

    Ok(StatusCode::OK)
}

#[debug_handler]
pub(crate) async fn switch(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SwitchRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_player_name(&payload.player)?;
    validation::validate_server_name(&payload.server)?;
    let server = payload.server.trim();

    if !state.sessions.switch_server(&payload.player, server).await {
        return Err(AppError::NoSession(payload.player));
    }
    finished(state.node.on_server_switch(&payload.player, server)).await?;

    Ok(StatusCode::OK)
}

#[debug_handler]
pub(crate) async fn disconnect(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DisconnectRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_player_name(&payload.player)?;

    // A player admitted by /login whose /postlogin never came has no
    // session but is already in this node's set.
    let had_session = state.sessions.disconnect(&payload.player).await.is_some();
    if !had_session && !state.node.holds_player(&payload.player).await? {
        return Err(AppError::NoSession(payload.player));
    }
    finished(state.node.on_disconnect(&payload.player)).await?;

    Ok(StatusCode::OK)
}

pub(crate) async fn players(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PlayersResponse {
        players: sorted(state.node.players().await),
    })
}

pub(crate) async fn player_count(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(CountResponse {
        count: state.node.player_count(),
    })
}

#[debug_handler]
pub(crate) async fn player(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_player_name(&name)?;

    let node = &state.node;
    let server = node.server_of(&name).await?;
    let proxy = node.proxy_of(&name).await?;
    let ip = node.ip_of(&name).await?;
    let last_online = node.last_online(&name).await?;

    Ok(Json(PlayerResponse {
        player: name,
        server,
        proxy,
        ip,
        last_online,
    }))
}

#[debug_handler]
pub(crate) async fn server_players(
    State(state): State<Arc<AppState>>,
    Path(server): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_server_name(&server)?;

    let players = state.node.players_on_server(&server).await?;
    Ok(Json(PlayersResponse {
        players: sorted(players),
    }))
}

pub(crate) async fn proxies(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ProxiesResponse {
        node_id: state.node.node_id().to_string(),
        proxies: state.node.active_node_ids(),
    })
}

#[debug_handler]
pub(crate) async fn proxy_players(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_node_id(&id)?;

    let players = state.node.players_on_proxy(&id).await?;
    Ok(Json(PlayersResponse {
        players: sorted(players),
    }))
}

#[debug_handler]
pub(crate) async fn proxy_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<CommandRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_node_id(&id)?;
    validation::validate_command(&payload.command)?;

    state.node.send_proxy_command(&id, &payload.command).await?;

    Ok(StatusCode::ACCEPTED)
}
