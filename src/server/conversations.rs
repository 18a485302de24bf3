use crate::server::database::Database;
use crate::server::changes::{ChangeFeed, Collection};
use crate::server::connections::pair_id;
use crate::server::config::ServerConfig;
use std::sync::Arc;
use sqlx::Row;
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDetail {
    pub user_id: String,
    pub name: String,
    pub university: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub is_group: bool,
    pub last_message: String,
    pub last_sender_id: String,
    pub message_count: i64,
    pub updated_at: i64,
    pub participants: Vec<ParticipantDetail>,
}

/// Adds a user to a conversation with their denormalized profile snapshot.
/// Idempotent; used for pairwise threads and for group-chat membership sync.
pub async fn add_participant(db: &Database, conversation_id: &str, user_id: &str) -> Result<(), sqlx::Error> {
    let row = sqlx::query("SELECT name, university FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    let (name, university) = match row {
        Some(r) => (r.get::<String, _>("name"), r.get::<String, _>("university")),
        None => return Err(sqlx::Error::RowNotFound),
    };
    sqlx::query("INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, user_name, user_university) VALUES (?, ?, ?, ?)")
        .bind(conversation_id)
        .bind(user_id)
        .bind(&name)
        .bind(&university)
        .execute(&db.pool)
        .await?;
    Ok(())
}

/// Pairwise thread: deterministic id, created only if absent.
/// Check-then-create, same as the original.
pub async fn start_chat(db: Arc<Database>, feed: &ChangeFeed, user_id: &str, partner_id: &str) -> String {
    println!("[CHAT] Start chat between {} and {}", user_id, partner_id);
    if user_id == partner_id {
        return "ERR: Cannot start a chat with yourself".to_string();
    }
    let partner = sqlx::query("SELECT id FROM users WHERE id = ? AND is_deleted = 0")
        .bind(partner_id)
        .fetch_optional(&db.pool)
        .await;
    match partner {
        Ok(Some(_)) => {}
        Ok(None) => return "ERR: User not found".to_string(),
        Err(e) => return format!("ERR: DB error: {}", e),
    }

    let conversation_id = pair_id(user_id, partner_id);
    let now = chrono::Utc::now().timestamp();
    let res = sqlx::query("INSERT OR IGNORE INTO conversations (id, is_group, created_at, updated_at) VALUES (?, 0, ?, ?)")
        .bind(&conversation_id)
        .bind(now)
        .bind(now)
        .execute(&db.pool)
        .await;
    if let Err(e) = res {
        println!("[CHAT] Error creating conversation: {}", e);
        return format!("ERR: DB error: {}", e);
    }
    for participant in [user_id, partner_id] {
        if let Err(e) = add_participant(&db, &conversation_id, participant).await {
            println!("[CHAT] Error adding participant {}: {}", participant, e);
            return format!("ERR: DB error: {}", e);
        }
    }
    feed.publish(Collection::Conversations, &conversation_id);
    format!("OK: Conversation {} ready", conversation_id)
}

/// Appends a message, then merges the denormalized thread counters in a
/// second write (kept as two writes, matching the original's behavior).
pub async fn send_message(db: Arc<Database>, feed: &ChangeFeed, user_id: &str, conversation_id: &str, text: &str, config: &ServerConfig) -> String {
    if text.is_empty() {
        return "ERR: Message text is required".to_string();
    }
    if text.len() > config.max_message_length {
        return format!("ERR: Message too long (max {} chars)", config.max_message_length);
    }
    let participant = sqlx::query("SELECT user_name FROM conversation_participants WHERE conversation_id = ? AND user_id = ?")
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await;
    let sender_name = match participant {
        Ok(Some(row)) => row.get::<String, _>("user_name"),
        Ok(None) => return "ERR: Not a participant of this conversation".to_string(),
        Err(e) => return format!("ERR: DB error: {}", e),
    };

    let now = chrono::Utc::now().timestamp();
    let res = sqlx::query("INSERT INTO messages (conversation_id, sender_id, sender_name, text, created_at) VALUES (?, ?, ?, ?, ?)")
        .bind(conversation_id)
        .bind(user_id)
        .bind(&sender_name)
        .bind(text)
        .bind(now)
        .execute(&db.pool)
        .await;
    if let Err(e) = res {
        println!("[CHAT] Error inserting message: {}", e);
        return format!("ERR: DB error: {}", e);
    }

    let res = sqlx::query("UPDATE conversations SET last_message = ?, last_sender_id = ?, message_count = message_count + 1, updated_at = ? WHERE id = ?")
        .bind(text)
        .bind(user_id)
        .bind(now)
        .bind(conversation_id)
        .execute(&db.pool)
        .await;
    if let Err(e) = res {
        println!("[CHAT] Error updating thread counters: {}", e);
        return format!("ERR: DB error: {}", e);
    }

    feed.publish(Collection::Messages, conversation_id);
    feed.publish(Collection::Conversations, conversation_id);
    "OK: Message sent".to_string()
}

pub async fn transcript(db: &Database, conversation_id: &str) -> Result<Vec<MessageRecord>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, sender_id, sender_name, text, created_at FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC")
        .bind(conversation_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows.iter().map(|r| MessageRecord {
        id: r.get("id"),
        sender_id: r.get("sender_id"),
        sender_name: r.get("sender_name"),
        text: r.get("text"),
        created_at: r.get("created_at"),
    }).collect())
}

/// Returns the entire transcript, oldest first. Callers replace their view
/// with it wholesale.
pub async fn get_messages(db: Arc<Database>, user_id: &str, conversation_id: &str) -> String {
    let is_participant = sqlx::query("SELECT 1 FROM conversation_participants WHERE conversation_id = ? AND user_id = ?")
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .is_some();
    if !is_participant {
        return "ERR: Not a participant of this conversation".to_string();
    }
    match transcript(&db, conversation_id).await {
        Ok(messages) => match serde_json::to_string(&messages) {
            Ok(json) => format!("OK: {}", json),
            Err(e) => format!("ERR: {}", e),
        },
        Err(e) => {
            println!("[CHAT] Error reading transcript: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

pub async fn list_for_user(db: &Database, user_id: &str) -> Result<Vec<ConversationSummary>, sqlx::Error> {
    let rows = sqlx::query(r#"
        SELECT c.id, c.is_group, c.last_message, c.last_sender_id, c.message_count, c.updated_at
        FROM conversations c
        JOIN conversation_participants p ON c.id = p.conversation_id
        WHERE p.user_id = ?
        ORDER BY c.updated_at DESC
    "#)
        .bind(user_id)
        .fetch_all(&db.pool)
        .await?;
    let mut summaries = Vec::with_capacity(rows.len());
    for r in rows.iter() {
        let id: String = r.get("id");
        let participant_rows = sqlx::query("SELECT user_id, user_name, user_university FROM conversation_participants WHERE conversation_id = ?")
            .bind(&id)
            .fetch_all(&db.pool)
            .await?;
        let participants = participant_rows.iter().map(|p| ParticipantDetail {
            user_id: p.get("user_id"),
            name: p.get("user_name"),
            university: p.get("user_university"),
        }).collect();
        summaries.push(ConversationSummary {
            id,
            is_group: r.get::<i64, _>("is_group") != 0,
            last_message: r.get("last_message"),
            last_sender_id: r.get("last_sender_id"),
            message_count: r.get("message_count"),
            updated_at: r.get("updated_at"),
            participants,
        });
    }
    Ok(summaries)
}

pub async fn my_conversations(db: Arc<Database>, user_id: &str) -> String {
    match list_for_user(&db, user_id).await {
        Ok(summaries) => match serde_json::to_string(&summaries) {
            Ok(json) => format!("OK: {}", json),
            Err(e) => format!("ERR: {}", e),
        },
        Err(e) => {
            println!("[CHAT] Error listing conversations: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn test_config() -> ServerConfig {
        ServerConfig::from_env()
    }

    async fn seed_user(db: &Database, id: &str, name: &str, university: &str) {
        sqlx::query("INSERT INTO users (id, name, email, university, created_at, last_active) VALUES (?, ?, ?, ?, 0, 0)")
            .bind(id)
            .bind(name)
            .bind(format!("{}@uni.rw", id))
            .bind(university)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn chat_id_matches_connection_pair_id() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        seed_user(&db, "u1", "Ana", "UR").await;
        seed_user(&db, "u2", "Ben", "ALU").await;

        let res = start_chat(db.clone(), &feed, "u1", "u2").await;
        assert_eq!(res, "OK: Conversation u1_u2 ready");
        // Argument order does not matter and the create is idempotent
        let res = start_chat(db.clone(), &feed, "u2", "u1").await;
        assert_eq!(res, "OK: Conversation u1_u2 ready");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(pair_id("u1", "u2"), "u1_u2");
    }

    #[tokio::test]
    async fn first_message_updates_thread_counters() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        let config = test_config();
        seed_user(&db, "u1", "Ana", "UR").await;
        seed_user(&db, "u2", "Ben", "ALU").await;
        start_chat(db.clone(), &feed, "u1", "u2").await;

        let res = send_message(db.clone(), &feed, "u1", "u1_u2", "hello", &config).await;
        assert_eq!(res, "OK: Message sent");

        let summaries = list_for_user(&db, "u2").await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].message_count, 1);
        assert_eq!(summaries[0].last_message, "hello");
        assert_eq!(summaries[0].last_sender_id, "u1");
        assert_eq!(summaries[0].participants.len(), 2);
    }

    #[tokio::test]
    async fn empty_or_oversized_messages_are_rejected() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        let mut config = test_config();
        config.max_message_length = 10;
        seed_user(&db, "u1", "Ana", "UR").await;
        seed_user(&db, "u2", "Ben", "ALU").await;
        start_chat(db.clone(), &feed, "u1", "u2").await;

        let res = send_message(db.clone(), &feed, "u1", "u1_u2", "", &config).await;
        assert_eq!(res, "ERR: Message text is required");
        let res = send_message(db.clone(), &feed, "u1", "u1_u2", "far too long a text", &config).await;
        assert_eq!(res, "ERR: Message too long (max 10 chars)");

        // Neither rejection wrote anything
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        let summaries = list_for_user(&db, "u1").await.unwrap();
        assert_eq!(summaries[0].message_count, 0);
    }

    #[tokio::test]
    async fn transcript_is_ordered_and_complete() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        let config = test_config();
        seed_user(&db, "u1", "Ana", "UR").await;
        seed_user(&db, "u2", "Ben", "ALU").await;
        start_chat(db.clone(), &feed, "u1", "u2").await;
        for text in ["one", "two", "three"] {
            send_message(db.clone(), &feed, "u1", "u1_u2", text, &config).await;
        }
        send_message(db.clone(), &feed, "u2", "u1_u2", "four", &config).await;

        let messages = transcript(&db, "u1_u2").await.unwrap();
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three", "four"]);
        assert_eq!(messages[3].sender_name, "Ben");
    }

    #[tokio::test]
    async fn outsiders_cannot_read_or_write() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        let config = test_config();
        seed_user(&db, "u1", "Ana", "UR").await;
        seed_user(&db, "u2", "Ben", "ALU").await;
        seed_user(&db, "u3", "Cleo", "UR").await;
        start_chat(db.clone(), &feed, "u1", "u2").await;

        let res = send_message(db.clone(), &feed, "u3", "u1_u2", "hi", &config).await;
        assert_eq!(res, "ERR: Not a participant of this conversation");
        let res = get_messages(db.clone(), "u3", "u1_u2").await;
        assert_eq!(res, "ERR: Not a participant of this conversation");
    }
}
