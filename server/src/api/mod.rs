//! C6 — control-plane HTTP + WebSocket API. Routes match spec §6 exactly
//! under `/v1`; every handler funnels errors through
//! `GoConnectError::IntoResponse` (§4.1) so no handler hand-rolls a status.

pub mod audit;
pub mod auth;
pub mod devices;
pub mod networks;
pub mod tenants;
pub mod ws;

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/tenants", post(tenants::create_tenant))
        .route("/v1/tenants/public", get(tenants::list_public))
        .route("/v1/tenants/search", get(tenants::search))
        .route("/v1/tenants/join-by-code", post(tenants::join_by_code))
        .route(
            "/v1/tenants/:id",
            get(tenants::get_tenant)
                .patch(tenants::update_tenant)
                .delete(tenants::delete_tenant),
        )
        .route("/v1/tenants/:id/join", post(tenants::join))
        .route("/v1/networks", post(networks::create).get(networks::list))
        .route(
            "/v1/networks/:id",
            get(networks::get)
                .patch(networks::update)
                .delete(networks::delete),
        )
        .route("/v1/networks/:id/join", post(networks::join))
        .route("/v1/networks/:id/leave", post(networks::leave))
        .route(
            "/v1/networks/:id/members/:uid",
            patch(networks::update_member).delete(networks::kick_member),
        )
        .route("/v1/networks/:id/members/:uid/ban", post(networks::ban_member))
        .route("/v1/networks/:id/members/:uid/unban", post(networks::unban_member))
        .route(
            "/v1/networks/:id/invites",
            post(networks::create_invite).get(networks::list_invites),
        )
        .route("/v1/networks/:id/invites/:invite_id", axum::routing::delete(networks::revoke_invite))
        .route(
            "/v1/networks/:id/ip-allocations",
            post(networks::allocate_ip),
        )
        .route(
            "/v1/networks/:id/ip-allocations/:uid",
            axum::routing::delete(networks::release_ip),
        )
        .route("/v1/networks/:id/wg/profile", get(networks::wg_profile))
        .route(
            "/v1/devices",
            post(devices::create).get(devices::list),
        )
        .route(
            "/v1/devices/:id",
            get(devices::get).patch(devices::update).delete(devices::delete),
        )
        .route("/v1/devices/:id/heartbeat", post(devices::heartbeat))
        .route("/v1/devices/:id/config", get(devices::config))
        .route("/v1/audit", get(audit::list))
        .route("/v1/audit/integrity", get(audit::integrity))
        .route("/v1/ws", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    axum::extract::State(state): axum::extract::State<AppState>,
    auth: auth::AuthContext,
    axum::extract::Query(q): axum::extract::Query<WsQuery>,
    ws: axum::extract::WebSocketUpgrade,
) -> axum::response::Response {
    use axum::response::IntoResponse;
    let network = match state
        .repo
        .get_network(tokio_util::sync::CancellationToken::new(), &q.network_id)
        .await
    {
        Ok(n) => n,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| {
        ws::run_connection(
            socket,
            state.signaling,
            q.network_id,
            q.device_id,
            auth.tenant_id,
            network.tenant_id,
        )
    })
}

#[derive(serde::Deserialize)]
struct WsQuery {
    network_id: goconnect_shared::domain::NetworkId,
    device_id: goconnect_shared::domain::DeviceId,
}
