use crate::server::database::Database;
use crate::server::changes::{ChangeFeed, Collection};
use std::sync::Arc;
use sqlx::Row;
use serde::{Serialize, Deserialize};

/// Deterministic, order-independent id for an unordered pair of users.
/// The same join is used for pairwise conversation ids, so a connection and
/// its chat always share an id.
pub fn pair_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}_{}", a, b)
    } else {
        format!("{}_{}", b, a)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub requester_id: String,
    pub receiver_id: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionBuckets {
    pub accepted: Vec<ConnectionRecord>,
    pub incoming: Vec<ConnectionRecord>,
    pub outgoing: Vec<ConnectionRecord>,
}

/// Buckets a full snapshot of connection rows by comparing against the
/// current user. Recomputed wholesale on every call, never incrementally.
pub fn partition(records: Vec<ConnectionRecord>, user_id: &str) -> ConnectionBuckets {
    let mut buckets = ConnectionBuckets::default();
    for record in records {
        match record.status.as_str() {
            "accepted" => buckets.accepted.push(record),
            "pending" if record.receiver_id == user_id => buckets.incoming.push(record),
            "pending" if record.requester_id == user_id => buckets.outgoing.push(record),
            _ => {}
        }
    }
    buckets
}

pub async fn list_for_user(db: &Database, user_id: &str) -> Result<Vec<ConnectionRecord>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, requester_id, receiver_id, status, created_at, updated_at FROM connections WHERE requester_id = ? OR receiver_id = ?")
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows.iter().map(|r| ConnectionRecord {
        id: r.get("id"),
        requester_id: r.get("requester_id"),
        receiver_id: r.get("receiver_id"),
        status: r.get("status"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }).collect())
}

pub async fn send_connection_request(db: Arc<Database>, feed: &ChangeFeed, user_id: &str, target_id: &str) -> String {
    println!("[CONNECTIONS] Request from {} to {}", user_id, target_id);
    if user_id == target_id {
        return "ERR: Cannot send a connection request to yourself".to_string();
    }

    // Target must be a live account
    let target = sqlx::query("SELECT id FROM users WHERE id = ? AND is_deleted = 0")
        .bind(target_id)
        .fetch_optional(&db.pool)
        .await;
    match target {
        Ok(Some(_)) => {}
        Ok(None) => return "ERR: User not found".to_string(),
        Err(e) => return format!("ERR: DB error: {}", e),
    }

    let connection_id = pair_id(user_id, target_id);
    let existing = sqlx::query("SELECT requester_id, status FROM connections WHERE id = ?")
        .bind(&connection_id)
        .fetch_optional(&db.pool)
        .await;
    match existing {
        Ok(Some(row)) => {
            let status: String = row.get("status");
            let requester_id: String = row.get("requester_id");
            match status.as_str() {
                "accepted" => return "ERR: You are already connected with this user".to_string(),
                "pending" if requester_id == user_id => return "ERR: Connection request already sent".to_string(),
                "pending" => return "ERR: This user has already sent you a request".to_string(),
                // A declined pair can try again; the fresh request replaces the row
                _ => {}
            }
        }
        Ok(None) => {}
        Err(e) => return format!("ERR: DB error: {}", e),
    }

    let now = chrono::Utc::now().timestamp();
    let res = sqlx::query("INSERT OR REPLACE INTO connections (id, requester_id, receiver_id, status, created_at, updated_at) VALUES (?, ?, ?, 'pending', ?, ?)")
        .bind(&connection_id)
        .bind(user_id)
        .bind(target_id)
        .bind(now)
        .bind(now)
        .execute(&db.pool)
        .await;
    match res {
        Ok(_) => {
            feed.publish(Collection::Connections, &connection_id);
            println!("[CONNECTIONS] Created pending connection {}", connection_id);
            "OK: Connection request sent".to_string()
        }
        Err(e) => {
            println!("[CONNECTIONS] Error creating connection: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

/// Merges the new status onto an existing pending record. Receiver identity
/// is not checked here; the caller owns that trust boundary.
pub async fn respond_to_request(db: Arc<Database>, feed: &ChangeFeed, connection_id: &str, action: &str) -> String {
    println!("[CONNECTIONS] Respond '{}' on {}", action, connection_id);
    let status = match action {
        "accept" => "accepted",
        "decline" => "declined",
        _ => return "ERR: Action must be accept or decline".to_string(),
    };
    let now = chrono::Utc::now().timestamp();
    let res = sqlx::query("UPDATE connections SET status = ?, updated_at = ? WHERE id = ? AND status = 'pending'")
        .bind(status)
        .bind(now)
        .bind(connection_id)
        .execute(&db.pool)
        .await;
    match res {
        Ok(r) if r.rows_affected() > 0 => {
            feed.publish(Collection::Connections, connection_id);
            println!("[CONNECTIONS] Connection {} is now {}", connection_id, status);
            format!("OK: Connection {}", status)
        }
        Ok(_) => "ERR: Connection request not found or already handled".to_string(),
        Err(e) => {
            println!("[CONNECTIONS] Error responding to request: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

pub async fn my_connections(db: Arc<Database>, user_id: &str) -> String {
    match list_for_user(&db, user_id).await {
        Ok(records) => {
            let buckets = partition(records, user_id);
            match serde_json::to_string(&buckets) {
                Ok(json) => format!("OK: {}", json),
                Err(e) => format!("ERR: {}", e),
            }
        }
        Err(e) => {
            println!("[CONNECTIONS] Error listing connections: {}", e);
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

    async fn seed_user(db: &Database, id: &str, name: &str) {
        sqlx::query("INSERT INTO users (id, name, email, created_at, last_active) VALUES (?, ?, ?, 0, 0)")
            .bind(id)
            .bind(name)
            .bind(format!("{}@uni.rw", id))
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[test]
    fn pair_id_is_commutative() {
        assert_eq!(pair_id("u1", "u2"), "u1_u2");
        assert_eq!(pair_id("u2", "u1"), "u1_u2");
        assert_eq!(pair_id("abc", "abd"), pair_id("abd", "abc"));
    }

    #[tokio::test]
    async fn request_then_accept_flow() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        seed_user(&db, "u1", "Ana").await;
        seed_user(&db, "u2", "Ben").await;

        let res = send_connection_request(db.clone(), &feed, "u1", "u2").await;
        assert_eq!(res, "OK: Connection request sent");

        let records = list_for_user(&db, "u2").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "u1_u2");
        assert_eq!(records[0].status, "pending");

        let res = respond_to_request(db.clone(), &feed, "u1_u2", "accept").await;
        assert_eq!(res, "OK: Connection accepted");
        let records = list_for_user(&db, "u1").await.unwrap();
        assert_eq!(records[0].status, "accepted");
    }

    #[tokio::test]
    async fn self_request_is_rejected() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        seed_user(&db, "u1", "Ana").await;
        let res = send_connection_request(db.clone(), &feed, "u1", "u1").await;
        assert_eq!(res, "ERR: Cannot send a connection request to yourself");
    }

    #[tokio::test]
    async fn duplicate_requests_fail_with_direction_aware_messages() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        seed_user(&db, "u1", "Ana").await;
        seed_user(&db, "u2", "Ben").await;
        send_connection_request(db.clone(), &feed, "u1", "u2").await;

        // Same direction
        let res = send_connection_request(db.clone(), &feed, "u1", "u2").await;
        assert_eq!(res, "ERR: Connection request already sent");
        // Opposite direction
        let res = send_connection_request(db.clone(), &feed, "u2", "u1").await;
        assert_eq!(res, "ERR: This user has already sent you a request");
        // Still exactly one row
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM connections")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        respond_to_request(db.clone(), &feed, "u1_u2", "accept").await;
        let res = send_connection_request(db.clone(), &feed, "u2", "u1").await;
        assert_eq!(res, "ERR: You are already connected with this user");
    }

    #[tokio::test]
    async fn declined_pair_can_try_again() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        seed_user(&db, "u1", "Ana").await;
        seed_user(&db, "u2", "Ben").await;
        send_connection_request(db.clone(), &feed, "u1", "u2").await;
        respond_to_request(db.clone(), &feed, "u1_u2", "decline").await;

        let res = send_connection_request(db.clone(), &feed, "u2", "u1").await;
        assert_eq!(res, "OK: Connection request sent");
        let records = list_for_user(&db, "u1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "pending");
        assert_eq!(records[0].requester_id, "u2");
    }

    #[tokio::test]
    async fn partition_buckets_by_direction() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        for (id, name) in [("u1", "Ana"), ("u2", "Ben"), ("u3", "Cleo"), ("u4", "Dan")] {
            seed_user(&db, id, name).await;
        }
        send_connection_request(db.clone(), &feed, "u1", "u2").await;
        respond_to_request(db.clone(), &feed, "u1_u2", "accept").await;
        send_connection_request(db.clone(), &feed, "u3", "u1").await;
        send_connection_request(db.clone(), &feed, "u1", "u4").await;

        let buckets = partition(list_for_user(&db, "u1").await.unwrap(), "u1");
        assert_eq!(buckets.accepted.len(), 1);
        assert_eq!(buckets.incoming.len(), 1);
        assert_eq!(buckets.incoming[0].requester_id, "u3");
        assert_eq!(buckets.outgoing.len(), 1);
        assert_eq!(buckets.outgoing[0].receiver_id, "u4");
    }
}
