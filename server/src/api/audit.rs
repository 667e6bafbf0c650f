//! `/v1/audit/...` handlers (spec §6, §8 S4): paginated event listing and
//! chain-integrity verification.

use axum::extract::{Query, State};
use goconnect_shared::{domain::AuditEvent, error::Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    from_seq: u64,
    #[serde(default = "default_limit")]
    limit: u64,
}

fn default_limit() -> u64 {
    100
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<axum::Json<Vec<AuditEvent>>> {
    let ct = CancellationToken::new();
    let events = state
        .repo
        .list_events_from(ct, query.from_seq, query.limit)
        .await?;
    Ok(axum::Json(events))
}

#[derive(Deserialize)]
pub struct IntegrityQuery {
    from_anchor: Option<u64>,
}

#[derive(Serialize)]
pub struct IntegrityResp {
    head_seq: u64,
    anchors: Vec<u64>,
    ok: bool,
    mismatch_seq: Option<u64>,
}

pub async fn integrity(
    State(state): State<AppState>,
    Query(query): Query<IntegrityQuery>,
) -> Result<axum::Json<IntegrityResp>> {
    let ct = CancellationToken::new();
    let verification = state.audit.verify(ct, query.from_anchor).await?;
    Ok(axum::Json(IntegrityResp {
        head_seq: verification.head_seq,
        anchors: verification.anchors,
        ok: verification.mismatch.is_none(),
        mismatch_seq: verification.mismatch.map(|m| m.seq),
    }))
}
