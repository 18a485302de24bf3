use crate::server::database::Database;
use std::sync::Arc;
use serde::Serialize;

/// Derived, recomputed-from-scratch counters. Nothing is stored; every call
/// (and every snapshot push) runs the three counts again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationCounters {
    pub pending_requests: i64,
    pub unread_conversations: i64,
    pub pending_invites: i64,
}

pub async fn counters(db: &Database, user_id: &str) -> Result<NotificationCounters, sqlx::Error> {
    let pending_requests: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM connections WHERE receiver_id = ? AND status = 'pending'")
        .bind(user_id)
        .fetch_one(&db.pool)
        .await?;
    // A thread counts as unread when somebody else wrote last
    let unread_conversations: i64 = sqlx::query_scalar(r#"
        SELECT COUNT(*)
        FROM conversations c
        JOIN conversation_participants p ON c.id = p.conversation_id
        WHERE p.user_id = ? AND c.message_count > 0 AND c.last_sender_id != ?
    "#)
        .bind(user_id)
        .bind(user_id)
        .fetch_one(&db.pool)
        .await?;
    let pending_invites: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_invitations WHERE invitee_id = ? AND status = 'pending'")
        .bind(user_id)
        .fetch_one(&db.pool)
        .await?;
    Ok(NotificationCounters { pending_requests, unread_conversations, pending_invites })
}

pub async fn my_notifications(db: Arc<Database>, user_id: &str) -> String {
    match counters(&db, user_id).await {
        Ok(counters) => match serde_json::to_string(&counters) {
            Ok(json) => format!("OK: {}", json),
            Err(e) => format!("ERR: {}", e),
        },
        Err(e) => {
            println!("[NOTIFY] Error computing counters: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::changes::ChangeFeed;
    use crate::server::config::ServerConfig;
    use crate::server::{connections, conversations, groups};
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
    async fn counters_track_every_source_and_recompute_on_change() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        let config = ServerConfig::from_env();
        for (id, name) in [("u1", "Ana"), ("u2", "Ben"), ("u3", "Cleo")] {
            seed_user(&db, id, name).await;
        }

        assert_eq!(counters(&db, "u1").await.unwrap(), NotificationCounters::default());

        // Incoming pending request
        connections::send_connection_request(db.clone(), &feed, "u2", "u1").await;
        // Conversation last written by someone else
        conversations::start_chat(db.clone(), &feed, "u3", "u1").await;
        conversations::send_message(db.clone(), &feed, "u3", "u1_u3", "hey", &config).await;
        // Pending group invite
        groups::create_group(db.clone(), &feed, "u2", "Chem", "", Some("u1")).await;

        let counts = counters(&db, "u1").await.unwrap();
        assert_eq!(counts.pending_requests, 1);
        assert_eq!(counts.unread_conversations, 1);
        assert_eq!(counts.pending_invites, 1);

        // Replying makes the thread "read"; accepting clears the request
        conversations::send_message(db.clone(), &feed, "u1", "u1_u3", "hi back", &config).await;
        connections::respond_to_request(db.clone(), &feed, "u1_u2", "accept").await;

        let counts = counters(&db, "u1").await.unwrap();
        assert_eq!(counts.pending_requests, 0);
        assert_eq!(counts.unread_conversations, 0);
        assert_eq!(counts.pending_invites, 1);

        // Outgoing requests never count for the sender
        connections::send_connection_request(db.clone(), &feed, "u1", "u3").await;
        assert_eq!(counters(&db, "u1").await.unwrap().pending_requests, 0);
        assert_eq!(counters(&db, "u3").await.unwrap().pending_requests, 1);
    }
}
