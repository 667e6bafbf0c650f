//! `/v1/networks/...` handlers (spec §6): network CRUD, membership
//! management, invites, IP allocations, and the WireGuard profile text
//! endpoint.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use goconnect_shared::{
    domain::{InviteId, InviteToken, JoinPolicy, Membership, Network, NetworkId, Role, UserId, Visibility},
    error::{GoConnectError, Result},
    wg_profile,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::api::auth::{require_idempotency_key, require_json_accept, AuthContext};
use crate::repo::idempotency;
use crate::AppState;

#[derive(Deserialize)]
pub struct CreateNetworkReq {
    pub name: String,
    pub cidr: ipnet::Ipv4Net,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub join_policy: Option<JoinPolicy>,
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(req): Json<CreateNetworkReq>,
) -> Result<Json<Network>> {
    require_json_accept(&headers)?;
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let visibility = req.visibility.unwrap_or(Visibility::Public);
    let join_policy = req.join_policy.unwrap_or(JoinPolicy::Open);
    let fingerprint = format!(
        "{}:{}:{}:{visibility:?}:{join_policy:?}",
        auth.tenant_id, req.name, req.cidr
    );
    let network = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        state
            .service
            .create_network(
                ct.clone(),
                auth.tenant_id.clone(),
                auth.user_id.clone(),
                req.name.clone(),
                req.cidr,
                visibility,
                join_policy,
            )
            .await
    })
    .await?;
    Ok(Json(network))
}

pub async fn list(State(state): State<AppState>, auth: AuthContext) -> Result<Json<Vec<Network>>> {
    let ct = CancellationToken::new();
    Ok(Json(
        state.repo.list_networks_for_tenant(ct, &auth.tenant_id).await?,
    ))
}

pub async fn get(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Network>> {
    let ct = CancellationToken::new();
    let network = state
        .service
        .get_network_for_caller(ct, &NetworkId(id), &auth.tenant_id, &auth.user_id, auth.is_admin)
        .await?;
    Ok(Json(network))
}

#[derive(Deserialize)]
pub struct UpdateNetworkReq {
    pub name: Option<String>,
    pub visibility: Option<Visibility>,
    pub join_policy: Option<JoinPolicy>,
}

pub async fn update(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateNetworkReq>,
) -> Result<Json<Network>> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let fingerprint = format!(
        "{id}:{:?}:{:?}:{:?}",
        req.name, req.visibility, req.join_policy
    );
    let network = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let mut network = state.repo.get_network(ct.clone(), &NetworkId(id.clone())).await?;
        if network.tenant_id != auth.tenant_id {
            return Err(GoConnectError::not_found("network"));
        }
        if let Some(name) = req.name.clone() {
            network.name = name;
        }
        if let Some(visibility) = req.visibility {
            network.visibility = visibility;
        }
        if let Some(join_policy) = req.join_policy {
            network.join_policy = join_policy;
        }
        network.updated_at = chrono::Utc::now();
        state.repo.update_network(ct.clone(), network).await
    })
    .await?;
    Ok(Json(network))
}

pub async fn delete(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<()> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let fingerprint = id.clone();
    idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let network = state.repo.get_network(ct.clone(), &NetworkId(id.clone())).await?;
        if network.tenant_id != auth.tenant_id {
            return Err(GoConnectError::not_found("network"));
        }
        state.repo.delete_network(ct.clone(), &NetworkId(id.clone())).await
    })
    .await
}

#[derive(Deserialize)]
pub struct JoinNetworkReq {
    #[serde(default)]
    pub invite_code: Option<String>,
}

pub async fn join(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<JoinNetworkReq>,
) -> Result<Json<Membership>> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let fingerprint = format!("{id}:{}:{:?}", auth.user_id, req.invite_code);
    let membership = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        state
            .service
            .join_network(
                ct.clone(),
                &NetworkId(id.clone()),
                &auth.tenant_id,
                auth.user_id.clone(),
                req.invite_code.as_deref(),
            )
            .await
    })
    .await?;
    Ok(Json(membership))
}

pub async fn leave(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<()> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let network_id = NetworkId(id);
    let fingerprint = format!("{network_id}:{}", auth.user_id);
    idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        state
            .repo
            .delete_membership(ct.clone(), &network_id, &auth.user_id)
            .await
    })
    .await
}

#[derive(Deserialize)]
pub struct UpdateMemberReq {
    pub status: Option<String>,
}

pub async fn update_member(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((network_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<UpdateMemberReq>,
) -> Result<Json<Membership>> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let network_id = NetworkId(network_id);
    let target = UserId(user_id);
    let fingerprint = format!("{network_id}:{target}:{:?}", req.status);
    let membership = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        match req.status.as_deref() {
            Some("approved") => {
                state
                    .service
                    .approve_member(ct.clone(), &network_id, &target, auth.user_id.clone())
                    .await?;
            },
            Some("rejected") => {
                state
                    .service
                    .reject_member(ct.clone(), &network_id, &target, auth.user_id.clone())
                    .await?;
            },
            _ => return Err(GoConnectError::validation("unsupported membership status transition")),
        }
        state
            .repo
            .get_membership(ct.clone(), &network_id, &target)
            .await?
            .ok_or_else(|| GoConnectError::not_found("membership"))
    })
    .await?;
    Ok(Json(membership))
}

async fn actor_role(
    state: &AppState,
    network_id: &NetworkId,
    actor: &UserId,
) -> Result<Role> {
    let ct = CancellationToken::new();
    state
        .repo
        .get_membership(ct, network_id, actor)
        .await?
        .map(|m| m.role)
        .ok_or_else(|| GoConnectError::Forbidden)
}

pub async fn kick_member(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((network_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<()> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let network_id = NetworkId(network_id);
    let target = UserId(user_id);
    let fingerprint = format!("kick:{network_id}:{target}");
    idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let role = actor_role(&state, &network_id, &auth.user_id).await?;
        state
            .service
            .kick_member(ct.clone(), &network_id, &target, auth.user_id.clone(), role)
            .await
    })
    .await
}

pub async fn ban_member(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((network_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<()> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let network_id = NetworkId(network_id);
    let target = UserId(user_id);
    let fingerprint = format!("ban:{network_id}:{target}");
    idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let role = actor_role(&state, &network_id, &auth.user_id).await?;
        state
            .service
            .ban_member(ct.clone(), &network_id, &target, auth.user_id.clone(), role)
            .await
    })
    .await
}

pub async fn unban_member(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((network_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<()> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let network_id = NetworkId(network_id);
    let target = UserId(user_id);
    let fingerprint = format!("unban:{network_id}:{target}");
    idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let role = actor_role(&state, &network_id, &auth.user_id).await?;
        state
            .service
            .unban_member(ct.clone(), &network_id, &target, auth.user_id.clone(), role)
            .await
    })
    .await
}

#[derive(Deserialize)]
pub struct CreateInviteReq {
    #[serde(default = "default_max_uses")]
    pub max_uses: u32,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_max_uses() -> u32 {
    1
}

pub async fn create_invite(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(network_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateInviteReq>,
) -> Result<Json<InviteToken>> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let network_id = NetworkId(network_id);
    let fingerprint = format!("{network_id}:{}:{}:{:?}", auth.user_id, req.max_uses, req.expires_at);
    let invite = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        state
            .service
            .create_invite(
                ct.clone(),
                network_id.clone(),
                auth.user_id.clone(),
                req.max_uses,
                req.expires_at,
            )
            .await
    })
    .await?;
    Ok(Json(invite))
}

pub async fn list_invites(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
) -> Result<Json<Vec<InviteToken>>> {
    let ct = CancellationToken::new();
    Ok(Json(
        state
            .repo
            .list_invites_for_network(ct, &NetworkId(network_id))
            .await?,
    ))
}

pub async fn revoke_invite(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((_network_id, invite_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<InviteToken>> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let invite_id = InviteId(invite_id);
    let fingerprint = format!("revoke:{invite_id}:{}", auth.user_id);
    let invite = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        state
            .service
            .revoke_invite(ct.clone(), &invite_id, auth.user_id.clone())
            .await
    })
    .await?;
    Ok(Json(invite))
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct IpAllocationResp {
    pub ip: std::net::Ipv4Addr,
}

pub async fn allocate_ip(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(network_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<IpAllocationResp>> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let network_id = NetworkId(network_id);
    let fingerprint = format!("{network_id}:{}", auth.user_id);
    let resp = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let ip = state
            .service
            .allocate_ip(ct.clone(), &network_id, auth.user_id.clone())
            .await?;
        Ok(IpAllocationResp { ip })
    })
    .await?;
    Ok(Json(resp))
}

pub async fn release_ip(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((network_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<()> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let network_id = NetworkId(network_id);
    let target = UserId(user_id);
    let fingerprint = format!("release:{network_id}:{target}");
    idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let role = actor_role(&state, &network_id, &auth.user_id).await.ok();
        state
            .service
            .release_ip(
                ct.clone(),
                &network_id,
                &target,
                auth.user_id.clone(),
                role,
                true,
            )
            .await
    })
    .await
}

#[derive(Deserialize)]
pub struct WgProfileQuery {
    device_id: String,
}

/// `GET /v1/networks/{id}/wg/profile?device_id=...`: renders the
/// `.conf`-format text body (spec §6). A network in a different tenant than
/// the caller never reveals its existence — §8 property / S2.
pub async fn wg_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(network_id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<WgProfileQuery>,
) -> Result<String> {
    let ct = CancellationToken::new();
    let network_id = NetworkId(network_id);
    let network = state
        .service
        .get_network_for_caller(ct.clone(), &network_id, &auth.tenant_id, &auth.user_id, auth.is_admin)
        .await?;

    let device = state.repo.get_device(ct.clone(), &query.device_id.clone().into()).await?;
    let devices = state.repo.list_devices_for_tenant(ct.clone(), &auth.tenant_id).await?;
    let mut by_user: HashMap<UserId, Vec<goconnect_shared::domain::Device>> = HashMap::new();
    for d in devices {
        by_user.entry(d.user_id.clone()).or_default().push(d);
    }

    let snapshot = state
        .service
        .build_peer_config_snapshot(ct, &network_id, &device.user_id, &by_user)
        .await?;

    let user = state.repo.get_user(CancellationToken::new(), &device.user_id).await?;
    let body = wg_profile::render(
        snapshot.interface_address,
        &snapshot.dns,
        snapshot.mtu,
        &snapshot.peers,
        &wg_profile::ProfileMetadata {
            user_email: user.email,
            network_name: network.name,
            device_name: device.name,
        },
    );
    Ok(body)
}
