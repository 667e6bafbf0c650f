//! `/v1/tenants/...` handlers (spec §6).

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use goconnect_shared::{
    domain::{JoinPolicy, Tenant, TenantId, Visibility},
    error::{GoConnectError, Result},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{api::auth::{require_idempotency_key, require_json_accept, AuthContext}, repo::idempotency, service::new_id, AppState};

#[derive(Deserialize)]
pub struct CreateTenantReq {
    pub name: String,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub join_policy: Option<JoinPolicy>,
}

pub async fn create_tenant(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(req): Json<CreateTenantReq>,
) -> Result<Json<Tenant>> {
    require_json_accept(&headers)?;
    let key = require_idempotency_key(&headers)?;
    let fingerprint = format!("{}:{}", req.name, auth.user_id);
    let ct = CancellationToken::new();
    let tenant = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        state
            .repo
            .create_tenant(
                ct.clone(),
                Tenant {
                    id: TenantId(new_id()),
                    name: req.name.clone(),
                    visibility: req.visibility.unwrap_or(Visibility::Public),
                    join_policy: req.join_policy.unwrap_or(JoinPolicy::Open),
                    created_at: Utc::now(),
                },
            )
            .await
    })
    .await?;
    Ok(Json(tenant))
}

pub async fn get_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Tenant>> {
    let ct = CancellationToken::new();
    let tenant = state.repo.get_tenant(ct, &TenantId(id)).await?;
    Ok(Json(tenant))
}

pub async fn list_public(State(state): State<AppState>) -> Result<Json<Vec<Tenant>>> {
    let ct = CancellationToken::new();
    Ok(Json(state.repo.list_public_tenants(ct).await?))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    q: String,
}

pub async fn search(
    State(state): State<AppState>,
    axum::extract::Query(query): axum::extract::Query<SearchQuery>,
) -> Result<Json<Vec<Tenant>>> {
    let ct = CancellationToken::new();
    Ok(Json(state.repo.search_tenants(ct, &query.q).await?))
}

#[derive(Deserialize)]
pub struct UpdateTenantReq {
    pub name: Option<String>,
    pub visibility: Option<Visibility>,
    pub join_policy: Option<JoinPolicy>,
}

pub async fn update_tenant(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateTenantReq>,
) -> Result<Json<Tenant>> {
    if !auth.is_admin {
        return Err(GoConnectError::Forbidden);
    }
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let fingerprint = format!("{id}:{:?}:{:?}:{:?}", req.name, req.visibility, req.join_policy);
    let tenant = idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let mut tenant = state.repo.get_tenant(ct.clone(), &TenantId(id.clone())).await?;
        if let Some(name) = req.name.clone() {
            tenant.name = name;
        }
        if let Some(visibility) = req.visibility {
            tenant.visibility = visibility;
        }
        if let Some(join_policy) = req.join_policy {
            tenant.join_policy = join_policy;
        }
        state.repo.update_tenant(ct.clone(), tenant).await
    })
    .await?;
    Ok(Json(tenant))
}

pub async fn delete_tenant(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<()> {
    if !auth.is_admin {
        return Err(GoConnectError::Forbidden);
    }
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let fingerprint = id.clone();
    idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        state.repo.delete_tenant(ct.clone(), &TenantId(id.clone())).await
    })
    .await
}

#[derive(Deserialize)]
pub struct JoinByCodeReq {
    pub code: String,
}

/// `POST /v1/tenants/join-by-code`: tenant-scoped invite consumption,
/// mirroring the network-scoped flow in `service::join_network` but for
/// `InviteScope::Tenant`.
pub async fn join_by_code(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(req): Json<JoinByCodeReq>,
) -> Result<()> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let fingerprint = format!("{}:{}", auth.user_id, req.code);
    idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        let invite = state.repo.try_consume_invite(ct.clone(), &req.code).await?;
        match invite.scope {
            goconnect_shared::domain::InviteScope::Tenant(_) => Ok(()),
            goconnect_shared::domain::InviteScope::Network(_) => {
                Err(GoConnectError::validation("invite is scoped to a network, not a tenant"))
            },
        }
    })
    .await
}

pub async fn join(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<()> {
    let key = require_idempotency_key(&headers)?;
    let ct = CancellationToken::new();
    let fingerprint = format!("{id}:{}", auth.user_id);
    idempotency::check_or_insert(state.repo.as_ref(), ct.clone(), &key, &fingerprint, async {
        state.repo.get_tenant(ct.clone(), &TenantId(id.clone())).await?;
        Ok(())
    })
    .await
}
