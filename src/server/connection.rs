use crate::server::{auth, users, connections, conversations, groups, notifications, admin, content};
use crate::server::database::Database;
use crate::server::config::ServerConfig;
use crate::server::changes::ChangeFeed;
use sqlx::Row;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

pub struct Server {
    pub db: Arc<Database>,
    pub config: ServerConfig,
    pub feed: ChangeFeed,
}

impl Server {
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        println!("[SERVER] Listening on {}", addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            println!("[SERVER] New connection from {}", peer);
            let db = self.db.clone();
            let config = self.config.clone();
            let feed = self.feed.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(db, config, feed, stream, peer).await {
                    println!("[SERVER] Client error ({}): {}", peer, e);
                }
            });
        }
    }

    pub async fn handle_command(&self, cmd: &str, args: &[&str]) -> String {
        println!("[SERVER] Received command: {} {:?}", cmd, args);
        match cmd {
            // ACCOUNTS
            "/register" if args.len() >= 3 => {
                let email = args[0];
                let password = args[1];
                let name = args[2..].join(" ");
                auth::register(self.db.clone(), email, password, &name, &self.config).await
            }
            "/login" if args.len() == 2 => {
                auth::login(self.db.clone(), args[0], args[1], &self.config).await
            }
            "/logout" if args.len() == 1 => {
                auth::logout(self.db.clone(), args[0]).await
            }
            "/validate_session" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    let row = sqlx::query("SELECT name FROM users WHERE id = ?")
                        .bind(&uid)
                        .fetch_optional(&self.db.pool)
                        .await;
                    if let Ok(Some(r)) = row {
                        let name: String = r.get("name");
                        format!("OK: {}", name)
                    } else {
                        "ERR: User not found".to_string()
                    }
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            // PROFILES AND SEARCH
            "/profile" if args.len() == 1 || args.len() == 2 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    // Second argument views someone else's profile
                    let target = if args.len() == 2 { args[1].to_string() } else { uid };
                    users::profile(self.db.clone(), &target).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/update_profile" if args.len() >= 2 => {
                let session_token = args[0];
                let payload = args[1..].join(" ");
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    users::update_profile(self.db.clone(), &self.feed, &uid, &payload).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/search_partners" if !args.is_empty() => {
                let session_token = args[0];
                let filters = if args.len() > 1 { Some(args[1..].join(" ")) } else { None };
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    users::search_partners(self.db.clone(), &uid, filters.as_deref()).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            // CONNECTIONS
            "/send_connection_request" if args.len() == 2 => {
                let session_token = args[0];
                let target_id = args[1];
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    connections::send_connection_request(self.db.clone(), &self.feed, &uid, target_id).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/respond_connection" if args.len() == 3 => {
                let session_token = args[0];
                let connection_id = args[1];
                let action = args[2];
                if auth::validate_session(self.db.clone(), session_token).await.is_some() {
                    connections::respond_to_request(self.db.clone(), &self.feed, connection_id, action).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/my_connections" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    connections::my_connections(self.db.clone(), &uid).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            // CONVERSATIONS
            "/start_chat" if args.len() == 2 => {
                let session_token = args[0];
                let partner_id = args[1];
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    conversations::start_chat(self.db.clone(), &self.feed, &uid, partner_id).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/send_message" if args.len() >= 3 => {
                let session_token = args[0];
                let conversation_id = args[1];
                let text = args[2..].join(" ");
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    conversations::send_message(self.db.clone(), &self.feed, &uid, conversation_id, &text, &self.config).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/get_messages" if args.len() == 2 => {
                let session_token = args[0];
                let conversation_id = args[1];
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    conversations::get_messages(self.db.clone(), &uid, conversation_id).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/my_conversations" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    conversations::my_conversations(self.db.clone(), &uid).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            // GROUPS
            "/create_group" if args.len() >= 3 => {
                let session_token = args[0];
                let name = args[1];
                let purpose = args[2];
                let invitees = if args.len() > 3 { Some(args[3]) } else { None };
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    groups::create_group(self.db.clone(), &self.feed, &uid, name, purpose, invitees).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/my_groups" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    groups::my_groups(self.db.clone(), &uid).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/invite" if args.len() == 3 => {
                let session_token = args[0];
                let group_id = args[1];
                let invitee_id = args[2];
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    groups::invite_user_to_group(self.db.clone(), &self.feed, &uid, group_id, invitee_id).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/accept_group_invite" if args.len() == 2 => {
                let session_token = args[0];
                let invite_id = args[1];
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    groups::accept_invite(self.db.clone(), &self.feed, &uid, invite_id).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/decline_group_invite" if args.len() == 2 => {
                let session_token = args[0];
                let invite_id = args[1];
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    groups::decline_invite(self.db.clone(), &self.feed, &uid, invite_id).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/my_group_invites" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    groups::my_invites(self.db.clone(), &uid).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/group_members" if args.len() == 2 => {
                let session_token = args[0];
                let group_id = args[1];
                if auth::validate_session(self.db.clone(), session_token).await.is_some() {
                    groups::group_members(self.db.clone(), group_id).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/leave_group" if args.len() == 2 => {
                let session_token = args[0];
                let group_id = args[1];
                if let Some(uid) = auth::validate_session(self.db.clone(), session_token).await {
                    groups::leave_group(self.db.clone(), &self.feed, &uid, group_id).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            // NOTIFICATIONS
            "/notifications" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    notifications::my_notifications(self.db.clone(), &uid).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            // ADMIN
            "/admin_stats" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    admin::stats(self.db.clone(), &uid).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/admin_list_users" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    admin::list_users(self.db.clone(), &uid).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/admin_suspend" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    admin::suspend_user(self.db.clone(), &self.feed, &uid, args[1]).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/admin_restore" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    admin::restore_user(self.db.clone(), &self.feed, &uid, args[1]).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/admin_delete" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    admin::delete_user(self.db.clone(), &self.feed, &uid, args[1]).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            "/admin_purge" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(self.db.clone(), args[0]).await {
                    admin::purge_user(self.db.clone(), &self.feed, &uid, args[1]).await
                } else {
                    "ERR: Invalid or expired session".to_string()
                }
            }
            // CONTENT
            "/universities" if args.len() == 1 => {
                content::universities_command(&self.config, args[0]).await
            }
            "/countries" => {
                content::countries_command(&self.config).await
            }
            "/quote" => {
                content::quote_command(&self.config).await
            }
            "/weather" if args.len() == 2 => {
                match (args[0].parse::<f64>(), args[1].parse::<f64>()) {
                    (Ok(latitude), Ok(longitude)) => {
                        content::weather_command(&self.config, latitude, longitude).await
                    }
                    _ => "ERR: Invalid coordinates".to_string(),
                }
            }
            "/timezone" => {
                content::timezone_command(&self.config).await
            }
            // SYSTEM
            "/help" => help(),
            "/quit" => "OK: Disconnected".to_string(),
            _ => "ERR: Unknown or invalid command".to_string(),
        }
    }
}

fn help() -> String {
    "OK: Commands: /register <email> <password> <name> | /login <email> <password> | /logout <token> | \
     /validate_session <token> | /profile <token> | /update_profile <token> <json> | \
     /search_partners <token> [json] | /send_connection_request <token> <user_id> | \
     /respond_connection <token> <connection_id> <accept|decline> | /my_connections <token> | \
     /start_chat <token> <user_id> | /send_message <token> <conversation_id> <text> | \
     /get_messages <token> <conversation_id> | /my_conversations <token> | \
     /create_group <token> <name> <purpose> [invitee_ids] | /my_groups <token> | \
     /invite <token> <group_id> <user_id> | /accept_group_invite <token> <invite_id> | \
     /decline_group_invite <token> <invite_id> | /my_group_invites <token> | \
     /group_members <token> <group_id> | /leave_group <token> <group_id> | \
     /notifications <token> | /admin_stats <token> | /admin_list_users <token> | \
     /admin_suspend <token> <user_id> | /admin_restore <token> <user_id> | \
     /admin_delete <token> <user_id> | /admin_purge <token> <user_id> | \
     /universities <country_code> | /countries | /quote | /weather <lat> <lon> | /timezone | \
     /help | /quit".to_string()
}

async fn handle_client(db: Arc<Database>, config: ServerConfig, feed: ChangeFeed, stream: TcpStream, peer: std::net::SocketAddr) -> anyhow::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            println!("[SERVER] Client disconnected: {}", peer);
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let cmd = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();
        println!("[CONN] [{}] Cmd='{}' Args={:?}", peer, cmd, args);
        let server = Server { db: db.clone(), config: config.clone(), feed: feed.clone() };
        let response = server.handle_command(cmd, &args).await;
        println!("[CONN] [{}] Response: {}", peer, response);
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        if cmd == "/quit" {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_server() -> Server {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Arc::new(Database { pool });
        db.migrate().await.unwrap();
        Server {
            db,
            config: ServerConfig::from_env(),
            feed: ChangeFeed::new(),
        }
    }

    fn session_token(response: &str) -> String {
        response.split("SESSION:").nth(1).unwrap().trim().to_string()
    }

    #[tokio::test]
    async fn register_then_authenticated_commands_work_end_to_end() {
        let server = test_server().await;

        let res = server.handle_command("/register", &["ana@uni.rw", "secret123", "Ana"]).await;
        assert!(res.starts_with("OK: Registered as Ana"), "{}", res);
        let token = session_token(&res);

        let res = server.handle_command("/validate_session", &[token.as_str()]).await;
        assert_eq!(res, "OK: Ana");

        let res = server.handle_command("/update_profile", &[token.as_str(), r#"{"course":"CS"}"#]).await;
        assert_eq!(res, "OK: Profile updated");

        let res = server.handle_command("/profile", &[token.as_str()]).await;
        assert!(res.contains(r#""course":"CS""#), "{}", res);
    }

    #[tokio::test]
    async fn commands_without_valid_session_are_rejected() {
        let server = test_server().await;
        let res = server.handle_command("/my_connections", &["bogus-token"]).await;
        assert_eq!(res, "ERR: Invalid or expired session");
        let res = server.handle_command("/send_message", &["bogus-token", "c1", "hi"]).await;
        assert_eq!(res, "ERR: Invalid or expired session");
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let server = test_server().await;
        assert_eq!(
            server.handle_command("/frobnicate", &[]).await,
            "ERR: Unknown or invalid command"
        );
    }

    #[tokio::test]
    async fn multiword_message_text_is_rejoined() {
        let server = test_server().await;
        let ana = session_token(&server.handle_command("/register", &["ana@uni.rw", "secret123", "Ana"]).await);
        let ben = session_token(&server.handle_command("/register", &["ben@uni.rw", "secret123", "Ben"]).await);

        let ana_id = auth::validate_session(server.db.clone(), &ana).await.unwrap();
        let ben_id = auth::validate_session(server.db.clone(), &ben).await.unwrap();
        let chat_id = crate::server::connections::pair_id(&ana_id, &ben_id);

        server.handle_command("/start_chat", &[ana.as_str(), ben_id.as_str()]).await;
        let res = server.handle_command("/send_message", &[ana.as_str(), chat_id.as_str(), "see", "you", "at", "noon"]).await;
        assert_eq!(res, "OK: Message sent");

        let res = server.handle_command("/get_messages", &[ben.as_str(), chat_id.as_str()]).await;
        assert!(res.contains("see you at noon"), "{}", res);
    }
}
