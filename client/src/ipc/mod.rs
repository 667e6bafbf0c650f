//! Local IPC server (spec §4.10): a `tonic` gRPC server over a Unix domain
//! socket (mode 0600), with an optional loopback TCP listener for desktop
//! UIs, grounded on `defguard_core::grpc::mod`'s
//! `Server::builder()...add_service(...)` composition pattern. Windows
//! named-pipe transport is a `cfg(windows)` extension point, not wired here.

pub mod auth;

use std::{path::PathBuf, sync::Arc};

use dashmap::DashMap;
use goconnect_proto::goconnect::{
    chat_service_server::ChatServiceServer,
    daemon_service_server::{DaemonService, DaemonServiceServer},
    network_service_server::{NetworkService, NetworkServiceServer},
    peer_service_server::{PeerService, PeerServiceServer},
    settings_service_server::{SettingsService, SettingsServiceServer},
    transfer_service_server::TransferServiceServer,
    voice_service_server::{VoiceService, VoiceServiceServer},
    CreateInviteRequest, CreateNetworkRequest, DaemonStatus, Empty, Event, InviteInfo,
    JoinNetworkRequest, NetworkInfo, NetworkList, NetworkRef, PeerInfo, PeerList,
    PeerListRequest, PeerRef, Settings, SubscribeRequest, SubscribeVoiceRequest,
    UpdateSettingsRequest, VersionInfo, VoiceSignal,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::{transport::Server, Request, Response, Status};
use uuid::Uuid;

use crate::{
    control_client::ControlClient,
    engine::Engine,
    overlay::{ChatServiceImpl, Overlay, TransferServiceImpl},
    p2p::{IceState, P2pManager},
};

pub type SubscriberId = Uuid;

/// Fans out daemon events (status changes, chat, transfer progress) to
/// local subscribers (spec §4.10): best-effort delivery, a full
/// subscriber's channel just drops the event rather than blocking the
/// publisher.
#[derive(Default)]
pub struct IpcEventBus {
    subscribers: DashMap<SubscriberId, mpsc::Sender<Event>>,
}

impl IpcEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Event>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(100);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &SubscriberId) {
        self.subscribers.remove(id);
    }

    pub fn publish(&self, event: Event) {
        for entry in self.subscribers.iter() {
            let _ = entry.value().try_send(event.clone());
        }
    }
}

pub struct DaemonState {
    pub device_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub control: Arc<ControlClient>,
    pub engine: Arc<Engine>,
    pub p2p: Arc<P2pManager>,
    pub events: Arc<IpcEventBus>,
    pub active_interfaces: Vec<String>,
    pub overlay: Arc<Overlay>,
}

pub struct DaemonServiceImpl {
    state: Arc<DaemonState>,
    shutdown: tokio_util::sync::CancellationToken,
}

#[tonic::async_trait]
impl DaemonService for DaemonServiceImpl {
    type EventsStream = ReceiverStream<Result<Event, Status>>;

    async fn status(&self, _req: Request<Empty>) -> Result<Response<DaemonStatus>, Status> {
        Ok(Response::new(DaemonStatus {
            running: true,
            device_id: self.state.device_id.clone(),
            active_interfaces: self.state.active_interfaces.clone(),
            started_at: Some(goconnect_proto::goconnect::Timestamp {
                unix_seconds: self.state.started_at.timestamp(),
            }),
        }))
    }

    async fn version(&self, _req: Request<Empty>) -> Result<Response<VersionInfo>, Status> {
        Ok(Response::new(VersionInfo {
            daemon_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: "1".to_string(),
        }))
    }

    async fn shutdown(&self, _req: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.shutdown.cancel();
        Ok(Response::new(Empty {}))
    }

    async fn disconnect(&self, _req: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.state
            .engine
            .pause()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    async fn connect(&self, _req: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.state
            .engine
            .resume()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    async fn events(
        &self,
        _req: Request<SubscribeRequest>,
    ) -> Result<Response<Self::EventsStream>, Status> {
        let (id, mut rx) = self.state.events.subscribe();
        let (tx, out_rx) = mpsc::channel(100);
        let events = self.state.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
            events.unsubscribe(&id);
        });
        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

pub struct PeerServiceImpl {
    state: Arc<DaemonState>,
}

#[tonic::async_trait]
impl PeerService for PeerServiceImpl {
    async fn list(&self, _req: Request<PeerListRequest>) -> Result<Response<PeerList>, Status> {
        let Some(snapshot) = self.state.engine.last_snapshot() else {
            return Ok(Response::new(PeerList { peers: Vec::new() }));
        };
        let mut peers = Vec::with_capacity(snapshot.peers.len());
        for peer in &snapshot.peers {
            let ice_state = self.state.p2p.state_of(&peer.peer_id).await;
            peers.push(PeerInfo {
                user_id: String::new(),
                device_id: peer.peer_id.0.clone(),
                device_name: peer.name.clone(),
                hostname: peer.hostname.clone(),
                allowed_ip: peer
                    .allowed_ips
                    .first()
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                endpoint: peer.endpoint.clone().unwrap_or_default(),
                ice_state: ice_state_name(ice_state),
                last_handshake: None,
            });
        }
        Ok(Response::new(PeerList { peers }))
    }

    async fn kick(&self, req: Request<PeerRef>) -> Result<Response<Empty>, Status> {
        let peer_ref = req.into_inner();
        self.state
            .control
            .mutate_peer("kick", &peer_ref.network_id, &peer_ref.user_id)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    async fn ban(&self, req: Request<PeerRef>) -> Result<Response<Empty>, Status> {
        let peer_ref = req.into_inner();
        self.state
            .control
            .mutate_peer("ban", &peer_ref.network_id, &peer_ref.user_id)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    async fn unban(&self, req: Request<PeerRef>) -> Result<Response<Empty>, Status> {
        let peer_ref = req.into_inner();
        self.state
            .control
            .mutate_peer("unban", &peer_ref.network_id, &peer_ref.user_id)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }
}

fn ice_state_name(state: Option<IceState>) -> String {
    match state {
        Some(IceState::New) => "new",
        Some(IceState::Checking) => "checking",
        Some(IceState::Connected) => "connected",
        Some(IceState::Failed) => "failed",
        Some(IceState::Closed) => "closed",
        None => "unknown",
    }
    .to_string()
}

pub struct NetworkServiceImpl {
    state: Arc<DaemonState>,
}

#[tonic::async_trait]
impl NetworkService for NetworkServiceImpl {
    async fn create(
        &self,
        req: Request<CreateNetworkRequest>,
    ) -> Result<Response<NetworkInfo>, Status> {
        let body = req.into_inner();
        let network = self
            .state
            .control
            .create_network(&crate::control_client::CreateNetworkReq {
                name: body.name,
                cidr: body.cidr,
                visibility: body.visibility,
                join_policy: body.join_policy,
            })
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(to_network_info(network)))
    }

    async fn join(
        &self,
        req: Request<JoinNetworkRequest>,
    ) -> Result<Response<NetworkInfo>, Status> {
        let body = req.into_inner();
        let invite_code = (!body.invite_code.is_empty()).then_some(body.invite_code.as_str());
        self.state
            .control
            .join_network(&body.network_id, invite_code)
            .map_err(|e| Status::internal(e.to_string()))?;
        let network = self
            .state
            .control
            .get_network(&body.network_id)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(to_network_info(network)))
    }

    async fn leave(&self, req: Request<NetworkRef>) -> Result<Response<Empty>, Status> {
        self.state
            .control
            .leave_network(&req.into_inner().network_id)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    async fn list(&self, _req: Request<Empty>) -> Result<Response<NetworkList>, Status> {
        let networks = self
            .state
            .control
            .list_networks()
            .map_err(|e| Status::internal(e.to_string()))?
            .into_iter()
            .map(to_network_info)
            .collect();
        Ok(Response::new(NetworkList { networks }))
    }

    async fn get(&self, req: Request<NetworkRef>) -> Result<Response<NetworkInfo>, Status> {
        let network = self
            .state
            .control
            .get_network(&req.into_inner().network_id)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(to_network_info(network)))
    }

    async fn delete(&self, req: Request<NetworkRef>) -> Result<Response<Empty>, Status> {
        self.state
            .control
            .delete_network(&req.into_inner().network_id)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    async fn create_invite(
        &self,
        req: Request<CreateInviteRequest>,
    ) -> Result<Response<InviteInfo>, Status> {
        let body = req.into_inner();
        let invite = self
            .state
            .control
            .create_invite(&body.network_id, body.max_uses)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(InviteInfo {
            invite_id: invite.id.0,
            code: invite.code,
            max_uses: invite.max_uses,
            use_count: invite.use_count,
        }))
    }
}

fn to_network_info(network: crate::control_client::NetworkView) -> NetworkInfo {
    NetworkInfo {
        network_id: network.id.0,
        name: network.name,
        cidr: network.cidr,
        visibility: format!("{:?}", network.visibility).to_lowercase(),
        join_policy: format!("{:?}", network.join_policy).to_lowercase(),
        my_role: String::new(),
        my_status: String::new(),
    }
}

pub struct SettingsServiceImpl {
    settings: Arc<parking_lot::RwLock<Settings>>,
}

#[tonic::async_trait]
impl SettingsService for SettingsServiceImpl {
    async fn get(&self, _req: Request<Empty>) -> Result<Response<Settings>, Status> {
        Ok(Response::new(self.settings.read().clone()))
    }

    async fn update(
        &self,
        req: Request<UpdateSettingsRequest>,
    ) -> Result<Response<Settings>, Status> {
        let patch = req.into_inner();
        let mut settings = self.settings.write();
        if let Some(v) = patch.health_check_interval_secs {
            settings.health_check_interval_secs = v;
        }
        if let Some(v) = patch.tcp_ipc_enabled {
            settings.tcp_ipc_enabled = v;
        }
        if let Some(v) = patch.log_level {
            settings.log_level = v;
        }
        Ok(Response::new(settings.clone()))
    }

    async fn reset(&self, _req: Request<Empty>) -> Result<Response<Settings>, Status> {
        let mut settings = self.settings.write();
        *settings = default_settings();
        Ok(Response::new(settings.clone()))
    }
}

fn default_settings() -> Settings {
    Settings {
        health_check_interval_secs: 30,
        tcp_ipc_enabled: false,
        log_level: 1,
    }
}

pub struct VoiceServiceImpl {
    state: Arc<DaemonState>,
}

#[tonic::async_trait]
impl VoiceService for VoiceServiceImpl {
    type SubscribeStream = ReceiverStream<Result<VoiceSignal, Status>>;

    async fn signal(&self, req: Request<VoiceSignal>) -> Result<Response<Empty>, Status> {
        let signal = req.into_inner();
        self.state.events.publish(Event {
            kind: "voice_signal".to_string(),
            at: Some(goconnect_proto::goconnect::Timestamp {
                unix_seconds: chrono::Utc::now().timestamp(),
            }),
            payload_json: serde_json::to_string(&serde_json::json!({
                "network_id": signal.network_id,
                "peer_device_id": signal.peer_device_id,
                "payload": signal.payload_json,
            }))
            .unwrap_or_default(),
        });
        Ok(Response::new(Empty {}))
    }

    async fn subscribe(
        &self,
        _req: Request<SubscribeVoiceRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let (_tx, rx) = mpsc::channel(16);
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

pub struct IpcServerHandles {
    pub settings: Arc<parking_lot::RwLock<Settings>>,
}

/// Binds the Unix domain socket (mode 0600) and serves every C10 service
/// behind the C11 token interceptor until `ct` is cancelled.
pub async fn serve_unix(
    socket_path: PathBuf,
    state: Arc<DaemonState>,
    token: auth::IpcToken,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(&socket_path);
    let listener = tokio::net::UnixListener::bind(&socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
    }
    let incoming = UnixListenerStream::new(listener);

    let interceptor = auth::TokenInterceptor::new(token);
    let settings = Arc::new(parking_lot::RwLock::new(default_settings()));

    let daemon_svc = DaemonServiceServer::with_interceptor(
        DaemonServiceImpl { state: state.clone(), shutdown: shutdown.clone() },
        interceptor.clone(),
    );
    let peer_svc = PeerServiceServer::with_interceptor(
        PeerServiceImpl { state: state.clone() },
        interceptor.clone(),
    );
    let settings_svc = SettingsServiceServer::with_interceptor(
        SettingsServiceImpl { settings: settings.clone() },
        interceptor.clone(),
    );
    let voice_svc = VoiceServiceServer::with_interceptor(
        VoiceServiceImpl { state: state.clone() },
        interceptor.clone(),
    );
    let network_svc = NetworkServiceServer::with_interceptor(
        NetworkServiceImpl { state: state.clone() },
        interceptor.clone(),
    );
    let chat_svc = ChatServiceServer::with_interceptor(
        ChatServiceImpl { overlay: state.overlay.clone() },
        interceptor.clone(),
    );
    let transfer_svc = TransferServiceServer::with_interceptor(
        TransferServiceImpl { overlay: state.overlay.clone() },
        interceptor,
    );

    log::info!("local IPC server listening on {}", socket_path.display());
    Server::builder()
        .add_service(daemon_svc)
        .add_service(peer_svc)
        .add_service(settings_svc)
        .add_service(voice_svc)
        .add_service(network_svc)
        .add_service(chat_svc)
        .add_service(transfer_svc)
        .serve_with_incoming_shutdown(incoming, shutdown.cancelled())
        .await?;
    Ok(())
}
