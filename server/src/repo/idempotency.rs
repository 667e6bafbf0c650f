//! Client-supplied `Idempotency-Key` handling (spec §4.2). A mutating
//! service operation calls [`IdempotencyStore::check_or_insert`] with the
//! key, a fingerprint of the request body, and a closure that performs the
//! actual mutation. Replays with a matching fingerprint get the cached
//! response back; replays with a different fingerprint fail with
//! `IdempotencyConflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use goconnect_shared::error::{ConflictKind, GoConnectError, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: String,
    pub response_json: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get_idempotency_record(
        &self,
        ct: CancellationToken,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>>;

    async fn put_idempotency_record(
        &self,
        ct: CancellationToken,
        record: IdempotencyRecord,
    ) -> Result<()>;

    async fn sweep_idempotency_records(
        &self,
        ct: CancellationToken,
        older_than: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Runs `make_response` under idempotency-key protection. `fingerprint`
/// should be a stable hash of the request body (callers typically use
/// `sha2::Sha256` over the canonical JSON, mirroring `audit::canonical_json`).
pub async fn check_or_insert<T, S, F>(
    store: &S,
    ct: CancellationToken,
    key: &str,
    fingerprint: &str,
    make_response: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    S: IdempotencyStore + ?Sized,
    F: std::future::Future<Output = Result<T>>,
{
    if let Some(existing) = store.get_idempotency_record(ct.clone(), key).await? {
        if existing.fingerprint != fingerprint {
            return Err(GoConnectError::conflict(
                ConflictKind::IdempotencyConflict,
                "Idempotency-Key reused with a different request body",
            ));
        }
        let value: T = serde_json::from_str(&existing.response_json)
            .map_err(|e| GoConnectError::Internal(e.into()))?;
        return Ok(value);
    }

    let response = make_response.await?;
    let response_json =
        serde_json::to_string(&response).map_err(|e| GoConnectError::Internal(e.into()))?;
    store
        .put_idempotency_record(
            ct,
            IdempotencyRecord {
                key: key.to_string(),
                fingerprint: fingerprint.to_string(),
                response_json,
                created_at: Utc::now(),
            },
        )
        .await?;
    Ok(response)
}
