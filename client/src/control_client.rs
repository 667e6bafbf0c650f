//! REST client for the control-plane HTTP API (spec §4.6), grounded on the
//! teacher's `client-core/src/rest_client.rs` `ureq`-based `RestClient`: one
//! small wrapper around an `ureq::Agent`, a bearer header instead of the
//! teacher's innernet-pubkey header, generic `http`/`http_form` helpers.

use std::time::Duration;

use goconnect_shared::domain::{Device, NetworkId, PeerConfigSnapshot};
use serde::{de::DeserializeOwned, Serialize};
use ureq::{Agent, AgentBuilder};
use uuid::Uuid;

pub struct ControlClient {
    agent: Agent,
    base_url: String,
    bearer_token: String,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        let agent = AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .redirects(0)
            .build();
        Self {
            agent,
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
        }
    }

    fn idempotency_key() -> String {
        Uuid::new_v4().to_string()
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ureq::Error> {
        let response = self
            .agent
            .get(&format!("{}{}", self.base_url, path))
            .set("authorization", &format!("Bearer {}", self.bearer_token))
            .call()?;
        Ok(response.into_json()?)
    }

    fn mutate<S: Serialize, T: DeserializeOwned>(
        &self,
        verb: &str,
        path: &str,
        body: &S,
    ) -> Result<T, ureq::Error> {
        let response = self
            .agent
            .request(verb, &format!("{}{}", self.base_url, path))
            .set("authorization", &format!("Bearer {}", self.bearer_token))
            .set("content-type", "application/json")
            .set("idempotency-key", &Self::idempotency_key())
            .send_json(serde_json::to_value(body)?)?;
        Ok(response.into_json()?)
    }

    /// `POST /v1/devices`: registers this device's WireGuard public key with
    /// the control plane on first run.
    pub fn register_device(&self, req: &RegisterDeviceReq) -> Result<Device, ureq::Error> {
        self.mutate("POST", "/v1/devices", req)
    }

    /// `POST /v1/devices/{id}/heartbeat`.
    pub fn heartbeat(&self, device_id: &str) -> Result<Device, ureq::Error> {
        self.mutate(
            "POST",
            &format!("/v1/devices/{device_id}/heartbeat"),
            &(),
        )
    }

    /// `GET /v1/devices/{id}/config?network_id=...`: the peer config
    /// snapshot the reconciliation engine (C8) diffs against.
    pub fn device_config(
        &self,
        device_id: &str,
        network_id: &NetworkId,
    ) -> Result<PeerConfigSnapshot, ureq::Error> {
        self.get(&format!(
            "/v1/devices/{device_id}/config?network_id={}",
            network_id.0
        ))
    }

    /// Backs the daemon's local `PeerService` RPCs (kick/ban/unban), which
    /// are just thin passthroughs to the control plane's membership
    /// endpoints.
    pub fn mutate_peer(
        &self,
        action: &str,
        network_id: &str,
        user_id: &str,
    ) -> Result<(), ureq::Error> {
        let (verb, path) = match action {
            "kick" => ("DELETE", format!("/v1/networks/{network_id}/members/{user_id}")),
            "ban" => ("POST", format!("/v1/networks/{network_id}/members/{user_id}/ban")),
            "unban" => ("POST", format!("/v1/networks/{network_id}/members/{user_id}/unban")),
            other => panic!("unknown peer action: {other}"),
        };
        self.agent
            .request(verb, &format!("{}{}", self.base_url, path))
            .set("authorization", &format!("Bearer {}", self.bearer_token))
            .set("idempotency-key", &Self::idempotency_key())
            .call()?;
        Ok(())
    }

    /// `POST /v1/networks`.
    pub fn create_network(&self, req: &CreateNetworkReq) -> Result<NetworkView, ureq::Error> {
        self.mutate("POST", "/v1/networks", req)
    }

    /// `POST /v1/networks/{id}/join`.
    pub fn join_network(
        &self,
        network_id: &str,
        invite_code: Option<&str>,
    ) -> Result<(), ureq::Error> {
        #[derive(Serialize)]
        struct Body<'a> {
            invite_code: Option<&'a str>,
        }
        let _: serde_json::Value = self.mutate(
            "POST",
            &format!("/v1/networks/{network_id}/join"),
            &Body { invite_code },
        )?;
        Ok(())
    }

    /// `POST /v1/networks/{id}/leave`.
    pub fn leave_network(&self, network_id: &str) -> Result<(), ureq::Error> {
        let _: serde_json::Value =
            self.mutate("POST", &format!("/v1/networks/{network_id}/leave"), &())?;
        Ok(())
    }

    /// `GET /v1/networks`.
    pub fn list_networks(&self) -> Result<Vec<NetworkView>, ureq::Error> {
        self.get("/v1/networks")
    }

    /// `GET /v1/networks/{id}`.
    pub fn get_network(&self, network_id: &str) -> Result<NetworkView, ureq::Error> {
        self.get(&format!("/v1/networks/{network_id}"))
    }

    /// `DELETE /v1/networks/{id}`.
    pub fn delete_network(&self, network_id: &str) -> Result<(), ureq::Error> {
        self.agent
            .delete(&format!("{}/v1/networks/{network_id}", self.base_url))
            .set("authorization", &format!("Bearer {}", self.bearer_token))
            .set("idempotency-key", &Self::idempotency_key())
            .call()?;
        Ok(())
    }

    /// `POST /v1/networks/{id}/invites`.
    pub fn create_invite(
        &self,
        network_id: &str,
        max_uses: u32,
    ) -> Result<InviteView, ureq::Error> {
        #[derive(Serialize)]
        struct Body {
            max_uses: u32,
        }
        self.mutate(
            "POST",
            &format!("/v1/networks/{network_id}/invites"),
            &Body { max_uses },
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateNetworkReq {
    pub name: String,
    pub cidr: String,
    pub visibility: String,
    pub join_policy: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NetworkView {
    pub id: goconnect_shared::domain::NetworkId,
    pub name: String,
    pub cidr: String,
    pub visibility: goconnect_shared::domain::Visibility,
    pub join_policy: goconnect_shared::domain::JoinPolicy,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct InviteView {
    pub id: goconnect_shared::domain::InviteId,
    pub code: String,
    pub max_uses: u32,
    pub use_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterDeviceReq {
    pub name: String,
    pub platform: goconnect_shared::domain::Platform,
    pub public_key: String,
    pub hostname: String,
    pub os_version: Option<String>,
    pub daemon_version: Option<String>,
}
