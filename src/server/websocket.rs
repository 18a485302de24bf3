use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use serde::{Serialize, Deserialize};
use uuid::Uuid;
use crate::server::database::Database;
use crate::server::changes::ChangeFeed;
use crate::server::{auth, connections, conversations, groups, notifications};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMessage {
    pub message_type: String, // "auth"
    pub session_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub message_type: String, // "auth_response"
    pub success: bool,
    pub user_id: Option<String>,
    pub error: Option<String>,
}

/// Full per-user state pushed on every change. Clients replace their local
/// copy wholesale instead of patching, so a dropped event costs nothing
/// once the next one arrives.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub message_type: String, // "snapshot"
    pub connections: connections::ConnectionBuckets,
    pub conversations: Vec<conversations::ConversationSummary>,
    pub groups: Vec<groups::GroupSummary>,
    pub invitations: Vec<groups::InvitationSummary>,
    pub notifications: notifications::NotificationCounters,
}

pub type ClientId = String;
pub type UserId = String;

struct ClientHandle {
    client_id: ClientId,
    sender: tokio::sync::mpsc::UnboundedSender<Message>,
}

/// Tracks one live sync connection per user. A newer connection for the same
/// user replaces the older one, which gets a Close frame.
pub struct SyncServer {
    clients: Arc<Mutex<HashMap<UserId, ClientHandle>>>,
    db: Arc<Database>,
    feed: ChangeFeed,
}

pub async fn build_snapshot(db: &Database, user_id: &str) -> Result<Snapshot, sqlx::Error> {
    let records = connections::list_for_user(db, user_id).await?;
    Ok(Snapshot {
        message_type: "snapshot".to_string(),
        connections: connections::partition(records, user_id),
        conversations: conversations::list_for_user(db, user_id).await?,
        groups: groups::list_for_user(db, user_id).await?,
        invitations: groups::pending_invitations(db, user_id).await?,
        notifications: notifications::counters(db, user_id).await?,
    })
}

impl SyncServer {
    pub fn new(db: Arc<Database>, feed: ChangeFeed) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            db,
            feed,
        }
    }

    pub async fn run(self: Arc<Self>, host: &str, port: u16) -> anyhow::Result<()> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr).await?;
        println!("[WS] Sync server listening on {}", addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws_stream) => {
                        if let Err(e) = server.handle_connection(ws_stream).await {
                            println!("[WS] Connection from {} ended: {}", peer, e);
                        }
                    }
                    Err(e) => println!("[WS] Handshake failed for {}: {}", peer, e),
                }
            });
        }
    }

    /// First frame must be an auth message carrying a valid session token.
    /// The client gets 30 seconds before the server hangs up.
    async fn handle_connection(&self, ws_stream: WebSocketStream<TcpStream>) -> anyhow::Result<()> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let auth_timeout = tokio::time::timeout(
            tokio::time::Duration::from_secs(30),
            ws_receiver.next()
        ).await;

        let auth_message = match auth_timeout {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<AuthMessage>(&text) {
                    Ok(auth) if auth.message_type == "auth" => auth,
                    Ok(_) => {
                        let response = auth_failure("Invalid message type, expected 'auth'");
                        let _ = ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await;
                        return Err(anyhow::anyhow!("Invalid auth message type"));
                    }
                    Err(e) => {
                        let response = auth_failure(&format!("Invalid JSON: {}", e));
                        let _ = ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await;
                        return Err(anyhow::anyhow!("Invalid JSON in auth message"));
                    }
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                println!("[WS:AUTH] Client closed connection during auth");
                return Ok(());
            }
            Ok(Some(Ok(_))) => {
                let response = auth_failure("Expected text message for authentication");
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await;
                return Err(anyhow::anyhow!("Unexpected message type during auth"));
            }
            Ok(Some(Err(e))) => {
                return Err(anyhow::anyhow!("WebSocket error during auth: {}", e));
            }
            Err(_) => {
                let response = auth_failure("Authentication timeout");
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await;
                return Err(anyhow::anyhow!("Authentication timeout"));
            }
        };

        let user_id = match auth::validate_session(self.db.clone(), &auth_message.session_token).await {
            Some(user_id) => user_id,
            None => {
                let response = auth_failure("Invalid or expired session token");
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await;
                return Err(anyhow::anyhow!("Authentication failed"));
            }
        };

        let response = AuthResponse {
            message_type: "auth_response".to_string(),
            success: true,
            user_id: Some(user_id.clone()),
            error: None,
        };
        ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await?;
        println!("[WS:AUTH] Authentication successful for user: {}", user_id);

        let client_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        {
            let mut clients = self.clients.lock().await;
            if let Some(old) = clients.insert(user_id.clone(), ClientHandle {
                client_id: client_id.clone(),
                sender: tx.clone(),
            }) {
                let _ = old.sender.send(Message::Close(None));
                println!("[WS] Replaced older connection for user {}", user_id);
            }
        }

        // Initial snapshot right after auth, then one per change event
        match build_snapshot(&self.db, &user_id).await {
            Ok(snapshot) => {
                let _ = tx.send(Message::Text(serde_json::to_string(&snapshot)?));
            }
            Err(e) => println!("[WS] Error building initial snapshot for {}: {}", user_id, e),
        }

        let send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_sender.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let db = self.db.clone();
        let feed_tx = tx.clone();
        let feed_user = user_id.clone();
        let mut feed_rx = self.feed.subscribe();
        let feed_task = tokio::spawn(async move {
            loop {
                match feed_rx.recv().await {
                    Ok(_event) => {
                        match build_snapshot(&db, &feed_user).await {
                            Ok(snapshot) => {
                                let json = match serde_json::to_string(&snapshot) {
                                    Ok(json) => json,
                                    Err(_) => continue,
                                };
                                if feed_tx.send(Message::Text(json)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => println!("[WS] Error building snapshot for {}: {}", feed_user, e),
                        }
                    }
                    // Lagged subscribers resync on the next event anyway
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        println!("[WS] Subscriber for {} lagged, skipped {} events", feed_user, skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let db = self.db.clone();
        let recv_tx = tx.clone();
        let recv_user = user_id.clone();
        let receive_task = tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if text.trim() == "refresh" {
                            match build_snapshot(&db, &recv_user).await {
                                Ok(snapshot) => {
                                    if let Ok(json) = serde_json::to_string(&snapshot) {
                                        let _ = recv_tx.send(Message::Text(json));
                                    }
                                }
                                Err(e) => println!("[WS] Error building snapshot for {}: {}", recv_user, e),
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = recv_tx.send(Message::Pong(payload));
                    }
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
        });

        tokio::select! {
            _ = send_task => {},
            _ = receive_task => {},
        }
        feed_task.abort();

        // Only deregister if a newer connection has not already taken the slot
        {
            let mut clients = self.clients.lock().await;
            if clients.get(&user_id).map(|c| c.client_id == client_id).unwrap_or(false) {
                clients.remove(&user_id);
            }
        }
        println!("[WS] Connection closed for user {}", user_id);

        Ok(())
    }

    pub async fn connected_users(&self) -> usize {
        self.clients.lock().await.len()
    }
}

fn auth_failure(error: &str) -> AuthResponse {
    AuthResponse {
        message_type: "auth_response".to_string(),
        success: false,
        user_id: None,
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::changes::ChangeFeed;
    use crate::server::config::ServerConfig;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_db() -> Arc<Database> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Arc::new(Database { pool });
        db.migrate().await.unwrap();
        db
    }

    async fn seed_user(db: &Database, id: &str, name: &str) {
        sqlx::query("INSERT INTO users (id, name, email, created_at, last_active) VALUES (?, ?, ?, 0, 0)")
            .bind(id)
            .bind(name)
            .bind(format!("{}@uni.rw", id))
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_carries_all_sections() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        let config = ServerConfig::from_env();
        seed_user(&db, "u1", "Ana").await;
        seed_user(&db, "u2", "Ben").await;
        seed_user(&db, "u3", "Cleo").await;

        connections::send_connection_request(db.clone(), &feed, "u2", "u1").await;
        conversations::start_chat(db.clone(), &feed, "u3", "u1").await;
        conversations::send_message(db.clone(), &feed, "u3", "u1_u3", "hello", &config).await;
        groups::create_group(db.clone(), &feed, "u2", "Chem", "lab prep", Some("u1")).await;

        let snapshot = build_snapshot(&db, "u1").await.unwrap();
        assert_eq!(snapshot.message_type, "snapshot");
        assert_eq!(snapshot.connections.incoming.len(), 1);
        assert_eq!(snapshot.conversations.len(), 1);
        assert!(snapshot.groups.is_empty());
        assert_eq!(snapshot.invitations.len(), 1);
        assert_eq!(snapshot.notifications.pending_requests, 1);
        assert_eq!(snapshot.notifications.pending_invites, 1);
        assert_eq!(snapshot.notifications.unread_conversations, 1);
    }

    #[tokio::test]
    async fn snapshot_for_fresh_user_is_empty() {
        let db = test_db().await;
        seed_user(&db, "u1", "Ana").await;

        let snapshot = build_snapshot(&db, "u1").await.unwrap();
        assert!(snapshot.connections.accepted.is_empty());
        assert!(snapshot.connections.incoming.is_empty());
        assert!(snapshot.connections.outgoing.is_empty());
        assert!(snapshot.conversations.is_empty());
        assert!(snapshot.groups.is_empty());
        assert!(snapshot.invitations.is_empty());
        assert_eq!(snapshot.notifications, notifications::NotificationCounters::default());
    }
}
