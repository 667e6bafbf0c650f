//! `/v1/devices/...` handlers (spec §6, §4.6): device registration, listing,
//! heartbeat, and the peer-config snapshot a daemon polls for.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use goconnect_shared::{
    domain::{Device, DeviceId, Platform},
    error::{GoConnectError, Result},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    api::auth::{require_idempotency_key, AuthContext},
    repo::idempotency,
    service::new_id,
    AppState,
};

#[derive(Deserialize)]
pub struct CreateDeviceReq {
    pub name: String,
    pub platform: Platform,
    pub public_key: String,
    pub hostname: String,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub daemon_version: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(req): Json<CreateDeviceReq>,
) -> Result<Json<Device>> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let fingerprint = format!(
        "{}:{}:{:?}:{}:{}",
        auth.user_id, req.name, req.platform, req.public_key, req.hostname
    );
    let device = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let device = Device {
            id: DeviceId(new_id()),
            user_id: auth.user_id.clone(),
            tenant_id: auth.tenant_id.clone(),
            name: req.name.clone(),
            platform: req.platform,
            public_key: req.public_key.clone(),
            hostname: req.hostname.clone(),
            os_version: req.os_version.clone(),
            daemon_version: req.daemon_version.clone(),
            last_seen: None,
            disabled_at: None,
        };
        state.repo.create_device(ct.clone(), device).await
    })
    .await?;
    Ok(Json(device))
}

pub async fn list(State(state): State<AppState>, auth: AuthContext) -> Result<Json<Vec<Device>>> {
    let ct = CancellationToken::new();
    Ok(Json(state.repo.list_devices_for_user(ct, &auth.user_id).await?))
}

pub async fn get(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Device>> {
    let ct = CancellationToken::new();
    let device = state.repo.get_device(ct, &DeviceId(id)).await?;
    if device.tenant_id != auth.tenant_id {
        return Err(GoConnectError::not_found("device"));
    }
    Ok(Json(device))
}

#[derive(Deserialize)]
pub struct UpdateDeviceReq {
    pub name: Option<String>,
    pub disabled: Option<bool>,
}

pub async fn update(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateDeviceReq>,
) -> Result<Json<Device>> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let fingerprint = format!("{id}:{:?}:{:?}", req.name, req.disabled);
    let device = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let mut device = state.repo.get_device(ct.clone(), &DeviceId(id.clone())).await?;
        if device.user_id != auth.user_id && !auth.is_admin {
            return Err(GoConnectError::Forbidden);
        }
        if let Some(name) = req.name.clone() {
            device.name = name;
        }
        if let Some(disabled) = req.disabled {
            device.disabled_at = if disabled { Some(Utc::now()) } else { None };
        }
        state.repo.update_device(ct.clone(), device).await
    })
    .await?;
    Ok(Json(device))
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
        let device = state.repo.get_device(ct.clone(), &DeviceId(id.clone())).await?;
        if device.user_id != auth.user_id && !auth.is_admin {
            return Err(GoConnectError::Forbidden);
        }
        state.repo.delete_device(ct.clone(), &DeviceId(id.clone())).await
    })
    .await
}

pub async fn heartbeat(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Device>> {
    let ct = CancellationToken::new();
    let mut device = state.repo.get_device(ct.clone(), &DeviceId(id)).await?;
    if device.user_id != auth.user_id {
        return Err(GoConnectError::Forbidden);
    }
    device.last_seen = Some(Utc::now());
    let device = state.repo.update_device(ct, device).await?;
    Ok(Json(device))
}

#[derive(Deserialize)]
pub struct ConfigQuery {
    network_id: String,
}

/// `GET /v1/devices/{id}/config?network_id=...`: the JSON twin of
/// `networks::wg_profile` — same `PeerConfigSnapshot`, consumed by the
/// daemon's reconciliation loop (C8) instead of a human importing a file.
pub async fn config(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<ConfigQuery>,
) -> Result<Json<goconnect_shared::domain::PeerConfigSnapshot>> {
    let ct = CancellationToken::new();
    let device = state.repo.get_device(ct.clone(), &DeviceId(id)).await?;
    if device.user_id != auth.user_id {
        return Err(GoConnectError::Forbidden);
    }
    let network_id = goconnect_shared::domain::NetworkId(query.network_id);
    let devices = state.repo.list_devices_for_tenant(ct.clone(), &auth.tenant_id).await?;
    let mut by_user: HashMap<_, Vec<Device>> = HashMap::new();
    for d in devices {
        by_user.entry(d.user_id.clone()).or_default().push(d);
    }
    let snapshot = state
        .service
        .build_peer_config_snapshot(ct, &network_id, &device.user_id, &by_user)
        .await?;
    Ok(Json(snapshot))
}
