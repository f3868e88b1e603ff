//! `/ws` upgrade and the broadcast/presence HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    extract::{
        ConnectInfo, Query, State, WebSocketUpgrade,
        rejection::{JsonRejection, QueryRejection},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trenova_api::{ApiError, InvalidParam};
use trenova_auth::RequestContext;
use trenova_core::Pulid;

use super::client::{self, Client};
use super::hub::Hub;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub room: Option<String>,
}

/// Upgrades an authenticated request. Identity comes from the session
/// only; the optional `room` query joins a room.
pub async fn upgrade(
    State(hub): State<Arc<Hub>>,
    ctx: RequestContext,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    query: Result<Query<ConnectQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if ctx.fallback {
        return Err(ApiError::service_unavailable(
            "Realtime connections are unavailable while sessions cannot be verified",
        ));
    }
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let (client, rx) = Client::new(
        ctx.user_id,
        ctx.organization_id,
        query.room,
        peer.to_string(),
        hub.config().send_buffer,
    );
    Ok(ws
        .on_upgrade(move |socket| client::serve(hub, socket, client, rx))
        .into_response())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastKind {
    UserBroadcast,
    OrgBroadcast,
    RoomBroadcast,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: BroadcastKind,
    #[serde(rename = "targetID")]
    pub target_id: String,
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub dispatched: bool,
}

fn invalid_target(reason: impl Into<String>) -> ApiError {
    ApiError::validation(
        "Invalid broadcast target",
        vec![InvalidParam::new("targetID", reason)],
    )
}

fn parse_id(raw: &str, field: &str) -> Result<Pulid, ApiError> {
    Pulid::parse(raw).map_err(|e| {
        ApiError::validation(
            format!("Invalid {field}"),
            vec![InvalidParam::new(field, e.to_string())],
        )
    })
}

/// Fire-and-forget fan-out. 200 means dispatched, not delivered.
pub async fn broadcast(
    State(hub): State<Arc<Hub>>,
    payload: Result<Json<BroadcastRequest>, JsonRejection>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;

    match req.kind {
        BroadcastKind::UserBroadcast => {
            let user_id = parse_id(&req.target_id, "targetID")?;
            hub.broadcast_to_user(&user_id, req.message).await;
        }
        BroadcastKind::OrgBroadcast => {
            let org_id = parse_id(&req.target_id, "targetID")?;
            hub.broadcast_to_org(&org_id, req.message).await;
        }
        BroadcastKind::RoomBroadcast => {
            if req.target_id.is_empty() {
                return Err(invalid_target("room id must not be empty"));
            }
            hub.broadcast_to_room(&req.target_id, req.message).await;
        }
    }
    Ok(Json(BroadcastResponse { dispatched: true }))
}

#[derive(Debug, Deserialize)]
pub struct OrgMembersQuery {
    pub org_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RoomMembersQuery {
    pub room_id: String,
}

fn members_error(e: trenova_cache::CacheError) -> ApiError {
    if e.is_transient() {
        ApiError::service_unavailable("Presence is temporarily unavailable")
    } else {
        tracing::error!(error = %e, "presence lookup failed");
        ApiError::internal("Presence lookup failed")
    }
}

pub async fn org_members(
    State(hub): State<Arc<Hub>>,
    query: Result<Query<OrgMembersQuery>, QueryRejection>,
) -> Result<Json<Vec<String>>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let org_id = parse_id(&query.org_id, "org_id")?;
    hub.org_members(&org_id).await.map(Json).map_err(members_error)
}

pub async fn room_members(
    State(hub): State<Arc<Hub>>,
    query: Result<Query<RoomMembersQuery>, QueryRejection>,
) -> Result<Json<Vec<String>>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if query.room_id.is_empty() {
        return Err(ApiError::validation(
            "Invalid room_id",
            vec![InvalidParam::new("room_id", "must not be empty")],
        ));
    }
    hub.room_members(&query.room_id)
        .await
        .map(Json)
        .map_err(members_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn broadcast_request_wire_shape() {
        let req: BroadcastRequest = serde_json::from_value(json!({
            "type": "room_broadcast",
            "targetID": "dock-4",
            "message": { "eta": 15 }
        }))
        .unwrap();
        assert_eq!(req.kind, BroadcastKind::RoomBroadcast);
        assert_eq!(req.target_id, "dock-4");
        assert_eq!(req.message["eta"], 15);

        let unknown = serde_json::from_value::<BroadcastRequest>(json!({
            "type": "everyone",
            "targetID": "x"
        }));
        assert!(unknown.is_err());
    }

    #[test]
    fn malformed_ids_are_validation_errors() {
        let err = parse_id("not-an-id", "targetID").unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        let problem = err.to_problem();
        assert_eq!(problem.invalid_params[0].name, "targetID");
    }
}
