//! Chat & file transfer over the overlay (spec §4.12). Once the WireGuard
//! interface is up, `ChatListener` binds a fixed-port TCP listener on the
//! interface's own address — resolving the spec's noted host/scope
//! inconsistency by always binding to the WireGuard address, never a
//! wildcard — and fans line-delimited JSON messages out to local IPC
//! subscribers (C10). File transfers ride the same chat channel as an
//! offer envelope, then open a second fixed-port connection to stream
//! length-prefixed frames.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use goconnect_proto::goconnect::{
    chat_service_server::ChatService, transfer_service_server::TransferService, ChatMessage,
    ChatMessageList, Empty, HistoryRequest, SendChatRequest, SubscribeChatRequest, TransferInfo,
    TransferList, TransferOfferRequest, TransferProgress, TransferRef,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

pub const CHAT_PORT: u16 = 3000;
pub const TRANSFER_PORT: u16 = 3001;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireChatMessage {
    id: String,
    scope: String,
    user_id: String,
    body: String,
    attachments: Vec<String>,
    created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransferOfferEnvelope {
    id: String,
    file_name: String,
    file_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Offered,
    Accepted,
    Rejected,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

struct TransferSession {
    peer_device_id: String,
    file_name: String,
    file_size: u64,
    bytes_transferred: u64,
    state: TransferState,
}

/// Owns the chat/transfer listeners and in-memory message/transfer state
/// for the overlay surface. The local user_id is the caller's own device
/// identity; chat/transfer history is kept per scope for the lifetime of
/// the daemon process, not persisted across restarts.
pub struct Overlay {
    local_user_id: String,
    messages: Mutex<HashMap<String, Vec<WireChatMessage>>>,
    transfers: Mutex<HashMap<String, TransferSession>>,
    events: Arc<crate::ipc::IpcEventBus>,
    chat_subscribers: Mutex<Vec<mpsc::Sender<Result<ChatMessage, Status>>>>,
}

impl Overlay {
    pub fn new(local_user_id: String, events: Arc<crate::ipc::IpcEventBus>) -> Arc<Self> {
        Arc::new(Self {
            local_user_id,
            messages: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            events,
            chat_subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Binds the chat listener on the WireGuard interface's first address,
    /// spec's fixed port 3000. Accepted connections are read as
    /// newline-delimited JSON `WireChatMessage`s.
    pub async fn spawn_chat_listener(
        self: &Arc<Self>,
        interface_addr: IpAddr,
        ct: tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(SocketAddr::new(interface_addr, CHAT_PORT)).await?;
        let overlay = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ct.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _addr)) = accepted else { continue };
                        let overlay = overlay.clone();
                        tokio::spawn(async move { overlay.handle_chat_connection(stream).await });
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_chat_connection(self: Arc<Self>, stream: TcpStream) {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            match tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if let Ok(offer) = serde_json::from_str::<TransferOfferEnvelope>(trimmed) {
                        self.record_incoming_offer(offer);
                    } else if let Ok(msg) = serde_json::from_str::<WireChatMessage>(trimmed) {
                        self.record_incoming_message(msg);
                    }
                },
            }
        }
    }

    fn record_incoming_message(&self, msg: WireChatMessage) {
        self.messages
            .lock()
            .entry(msg.scope.clone())
            .or_default()
            .push(msg.clone());
        self.publish_chat_event(&msg);
    }

    fn record_incoming_offer(&self, offer: TransferOfferEnvelope) {
        self.transfers.lock().insert(
            offer.id,
            TransferSession {
                peer_device_id: String::new(),
                file_name: offer.file_name,
                file_size: offer.file_size,
                bytes_transferred: 0,
                state: TransferState::Offered,
            },
        );
    }

    fn publish_chat_event(&self, msg: &WireChatMessage) {
        let rpc_msg = to_rpc(msg);
        self.chat_subscribers
            .lock()
            .retain(|tx| tx.try_send(Ok(rpc_msg.clone())).is_ok());
        self.events.publish(goconnect_proto::goconnect::Event {
            kind: "chat_message".to_string(),
            at: Some(goconnect_proto::goconnect::Timestamp { unix_seconds: msg.created_at }),
            payload_json: serde_json::to_string(msg).unwrap_or_default(),
        });
    }

    /// Sends a transfer offer over the same chat channel as a
    /// `{id, file_name, file_size}` envelope, per spec §4.12.
    pub async fn offer_transfer(
        &self,
        peer_addr: SocketAddr,
        file_name: String,
        file_size: u64,
    ) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let envelope = TransferOfferEnvelope {
            id: id.clone(),
            file_name: file_name.clone(),
            file_size,
        };
        let mut stream = TcpStream::connect(SocketAddr::new(peer_addr.ip(), CHAT_PORT)).await?;
        let line = format!("{}\n", serde_json::to_string(&envelope)?);
        stream.write_all(line.as_bytes()).await?;

        self.transfers.lock().insert(
            id.clone(),
            TransferSession {
                peer_device_id: peer_addr.ip().to_string(),
                file_name,
                file_size,
                bytes_transferred: 0,
                state: TransferState::Offered,
            },
        );
        Ok(id)
    }

    /// Accepts a pending transfer: opens a direct connection to the
    /// sender's fixed transfer port and streams length-prefixed frames,
    /// tracking the last-acknowledged offset so the session can resume if
    /// interrupted (marked `Failed` if the sender no longer holds it).
    pub async fn accept_transfer(
        &self,
        transfer_id: &str,
        sender_addr: SocketAddr,
        resume_offset: u64,
    ) -> anyhow::Result<()> {
        {
            let mut transfers = self.transfers.lock();
            let Some(session) = transfers.get_mut(transfer_id) else {
                anyhow::bail!("unknown transfer {transfer_id}");
            };
            session.state = TransferState::Accepted;
            session.bytes_transferred = resume_offset;
        }

        let mut stream =
            TcpStream::connect(SocketAddr::new(sender_addr.ip(), TRANSFER_PORT)).await?;
        stream.write_all(&resume_offset.to_be_bytes()).await?;

        loop {
            let mut len_buf = [0u8; 4];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {},
                Err(_) => break,
            }
            let frame_len = u32::from_be_bytes(len_buf) as usize;
            if frame_len == 0 {
                break;
            }
            let mut frame = vec![0u8; frame_len];
            if stream.read_exact(&mut frame).await.is_err() {
                self.mark_transfer_failed(transfer_id);
                break;
            }
            let mut transfers = self.transfers.lock();
            if let Some(session) = transfers.get_mut(transfer_id) {
                session.bytes_transferred += frame_len as u64;
                if session.bytes_transferred >= session.file_size {
                    session.state = TransferState::Completed;
                }
            }
        }
        Ok(())
    }

    fn mark_transfer_failed(&self, transfer_id: &str) {
        if let Some(session) = self.transfers.lock().get_mut(transfer_id) {
            session.state = TransferState::Failed;
        }
    }
}

fn to_rpc(msg: &WireChatMessage) -> ChatMessage {
    ChatMessage {
        id: msg.id.clone(),
        scope: msg.scope.clone(),
        user_id: msg.user_id.clone(),
        body: msg.body.clone(),
        attachments: msg.attachments.clone(),
        created_at: Some(goconnect_proto::goconnect::Timestamp { unix_seconds: msg.created_at }),
        deleted: false,
    }
}

fn state_name(state: TransferState) -> &'static str {
    match state {
        TransferState::Offered => "offered",
        TransferState::Accepted => "accepted",
        TransferState::Rejected => "rejected",
        TransferState::InProgress => "in_progress",
        TransferState::Completed => "completed",
        TransferState::Failed => "failed",
        TransferState::Cancelled => "cancelled",
    }
}

pub struct ChatServiceImpl {
    pub overlay: Arc<Overlay>,
}

#[tonic::async_trait]
impl ChatService for ChatServiceImpl {
    type SubscribeStream = ReceiverStream<Result<ChatMessage, Status>>;

    async fn send(&self, req: Request<SendChatRequest>) -> Result<Response<ChatMessage>, Status> {
        let body = req.into_inner();
        let msg = WireChatMessage {
            id: Uuid::new_v4().to_string(),
            scope: body.scope,
            user_id: self.overlay.local_user_id.clone(),
            body: body.body,
            attachments: body.attachments,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.overlay.record_incoming_message(msg.clone());
        Ok(Response::new(to_rpc(&msg)))
    }

    async fn history(
        &self,
        req: Request<HistoryRequest>,
    ) -> Result<Response<ChatMessageList>, Status> {
        let query = req.into_inner();
        let messages = self
            .overlay
            .messages
            .lock()
            .get(&query.scope)
            .map(|msgs| msgs.iter().rev().take(query.limit.max(1) as usize).map(to_rpc).collect())
            .unwrap_or_default();
        Ok(Response::new(ChatMessageList { messages }))
    }

    async fn subscribe(
        &self,
        _req: Request<SubscribeChatRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let (tx, rx) = mpsc::channel(100);
        self.overlay.chat_subscribers.lock().push(tx);
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

pub struct TransferServiceImpl {
    pub overlay: Arc<Overlay>,
}

#[tonic::async_trait]
impl TransferService for TransferServiceImpl {
    type SubscribeStream = ReceiverStream<Result<TransferProgress, Status>>;

    async fn offer(
        &self,
        req: Request<TransferOfferRequest>,
    ) -> Result<Response<TransferInfo>, Status> {
        let body = req.into_inner();
        let id = Uuid::new_v4().to_string();
        self.overlay.transfers.lock().insert(
            id.clone(),
            TransferSession {
                peer_device_id: body.peer_device_id.clone(),
                file_name: body.file_name.clone(),
                file_size: body.file_size,
                bytes_transferred: 0,
                state: TransferState::Offered,
            },
        );
        Ok(Response::new(TransferInfo {
            transfer_id: id,
            peer_device_id: body.peer_device_id,
            file_name: body.file_name,
            file_size: body.file_size,
            direction: "outgoing".to_string(),
            state: state_name(TransferState::Offered).to_string(),
        }))
    }

    async fn accept(&self, req: Request<TransferRef>) -> Result<Response<TransferInfo>, Status> {
        self.set_state(&req.into_inner().transfer_id, TransferState::Accepted)
    }

    async fn reject(&self, req: Request<TransferRef>) -> Result<Response<Empty>, Status> {
        let transfer_id = req.into_inner().transfer_id;
        if let Some(session) = self.overlay.transfers.lock().get_mut(&transfer_id) {
            session.state = TransferState::Rejected;
        }
        Ok(Response::new(Empty {}))
    }

    async fn cancel(&self, req: Request<TransferRef>) -> Result<Response<Empty>, Status> {
        let transfer_id = req.into_inner().transfer_id;
        if let Some(session) = self.overlay.transfers.lock().get_mut(&transfer_id) {
            session.state = TransferState::Cancelled;
        }
        Ok(Response::new(Empty {}))
    }

    async fn list(&self, _req: Request<Empty>) -> Result<Response<TransferList>, Status> {
        let transfers = self
            .overlay
            .transfers
            .lock()
            .iter()
            .map(|(id, session)| TransferInfo {
                transfer_id: id.clone(),
                peer_device_id: session.peer_device_id.clone(),
                file_name: session.file_name.clone(),
                file_size: session.file_size,
                direction: "unknown".to_string(),
                state: state_name(session.state).to_string(),
            })
            .collect();
        Ok(Response::new(TransferList { transfers }))
    }

    async fn subscribe(
        &self,
        _req: Request<TransferRef>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let (_tx, rx) = mpsc::channel(16);
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

impl TransferServiceImpl {
    fn set_state(
        &self,
        transfer_id: &str,
        state: TransferState,
    ) -> Result<Response<TransferInfo>, Status> {
        let mut transfers = self.overlay.transfers.lock();
        let session = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| Status::not_found("unknown transfer"))?;
        session.state = state;
        Ok(Response::new(TransferInfo {
            transfer_id: transfer_id.to_string(),
            peer_device_id: session.peer_device_id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            direction: "incoming".to_string(),
            state: state_name(session.state).to_string(),
        }))
    }
}
