use crate::server::database::Database;
use crate::server::config::ServerConfig;
use crate::server::changes::{ChangeFeed, Collection};
use crate::server::auth;
use std::collections::HashSet;
use std::sync::Arc;
use sqlx::Row;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_users: i64,
    pub active_users: i64,
    pub suspended_users: i64,
    pub new_today: i64,
    pub new_last7_days: i64,
    pub distinct_courses: i64,
    pub total_connections: i64,
    pub pending_connections: i64,
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_groups: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub university: String,
    pub course: String,
    pub is_suspended: bool,
    pub is_deleted: bool,
    pub created_at: i64,
    pub last_active: i64,
}

/// Seeds the configured admin account if it is missing. Runs at startup.
pub async fn ensure_admin_account(db: Arc<Database>, config: &ServerConfig) -> Result<(), sqlx::Error> {
    let existing = sqlx::query("SELECT id FROM users WHERE email = ?")
        .bind(&config.admin_email)
        .fetch_optional(&db.pool)
        .await?;
    if existing.is_some() {
        return Ok(());
    }
    let user_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    let password_hash = auth::hash_password(&config.admin_password, config.argon2_salt_length);
    let mut tx = db.pool.begin().await?;
    sqlx::query("INSERT INTO users (id, name, email, is_admin, created_at, last_active) VALUES (?, ?, ?, 1, ?, ?)")
        .bind(&user_id)
        .bind(&config.admin_name)
        .bind(&config.admin_email)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO auth (user_id, password_hash) VALUES (?, ?)")
        .bind(&user_id)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    println!("[ADMIN] Seeded admin account {} (id={})", config.admin_email, user_id);
    Ok(())
}

pub async fn is_admin(db: &Database, user_id: &str) -> bool {
    sqlx::query("SELECT 1 FROM users WHERE id = ? AND is_admin = 1")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .is_some()
}

fn local_midnight_timestamp() -> i64 {
    let today = chrono::Local::now().date_naive();
    match today.and_hms_opt(0, 0, 0).map(|t| t.and_local_timezone(chrono::Local)) {
        Some(chrono::LocalResult::Single(dt)) => dt.timestamp(),
        Some(chrono::LocalResult::Ambiguous(dt, _)) => dt.timestamp(),
        _ => chrono::Utc::now().timestamp() - 86_400,
    }
}

/// Full-collection linear scans, like the original dashboard: no pagination
/// on the aggregation path.
pub async fn compute_stats(db: &Database) -> Result<DashboardStats, sqlx::Error> {
    let mut stats = DashboardStats::default();
    let today_cutoff = local_midnight_timestamp();
    let week_cutoff = chrono::Utc::now().timestamp() - 7 * 86_400;

    let user_rows = sqlx::query("SELECT course, is_admin, is_suspended, is_deleted, created_at FROM users")
        .fetch_all(&db.pool)
        .await?;
    let mut courses: HashSet<String> = HashSet::new();
    for row in &user_rows {
        let is_admin: i64 = row.get("is_admin");
        if is_admin != 0 {
            continue;
        }
        stats.total_users += 1;
        let is_deleted: i64 = row.get("is_deleted");
        let is_suspended: i64 = row.get("is_suspended");
        if is_deleted == 0 {
            stats.active_users += 1;
        }
        if is_suspended != 0 {
            stats.suspended_users += 1;
        }
        let created_at: i64 = row.get("created_at");
        if created_at >= today_cutoff {
            stats.new_today += 1;
        }
        if created_at >= week_cutoff {
            stats.new_last7_days += 1;
        }
        let course: String = row.get("course");
        if !course.is_empty() {
            courses.insert(course);
        }
    }
    stats.distinct_courses = courses.len() as i64;

    let connection_rows = sqlx::query("SELECT status FROM connections")
        .fetch_all(&db.pool)
        .await?;
    for row in &connection_rows {
        let status: String = row.get("status");
        match status.as_str() {
            "accepted" => stats.total_connections += 1,
            "pending" => stats.pending_connections += 1,
            _ => {}
        }
    }

    stats.total_conversations = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
        .fetch_one(&db.pool)
        .await?;
    stats.total_messages = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&db.pool)
        .await?;
    stats.total_groups = sqlx::query_scalar("SELECT COUNT(*) FROM study_groups")
        .fetch_one(&db.pool)
        .await?;
    Ok(stats)
}

pub async fn stats(db: Arc<Database>, user_id: &str) -> String {
    if !is_admin(&db, user_id).await {
        return "ERR: Admin access required".to_string();
    }
    match compute_stats(&db).await {
        Ok(stats) => match serde_json::to_string(&stats) {
            Ok(json) => format!("OK: {}", json),
            Err(e) => format!("ERR: {}", e),
        },
        Err(e) => {
            println!("[ADMIN] Error computing stats: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

pub async fn list_users(db: Arc<Database>, user_id: &str) -> String {
    if !is_admin(&db, user_id).await {
        return "ERR: Admin access required".to_string();
    }
    let rows = sqlx::query("SELECT id, name, email, university, course, is_suspended, is_deleted, created_at, last_active FROM users WHERE is_admin = 0 ORDER BY created_at DESC")
        .fetch_all(&db.pool)
        .await;
    match rows {
        Ok(rows) => {
            let users: Vec<AdminUserRow> = rows.iter().map(|r| AdminUserRow {
                id: r.get("id"),
                name: r.get("name"),
                email: r.get("email"),
                university: r.get("university"),
                course: r.get("course"),
                is_suspended: r.get::<i64, _>("is_suspended") != 0,
                is_deleted: r.get::<i64, _>("is_deleted") != 0,
                created_at: r.get("created_at"),
                last_active: r.get("last_active"),
            }).collect();
            match serde_json::to_string(&users) {
                Ok(json) => format!("OK: {}", json),
                Err(e) => format!("ERR: {}", e),
            }
        }
        Err(e) => {
            println!("[ADMIN] Error listing users: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

async fn set_user_flags(db: &Database, feed: &ChangeFeed, target_id: &str, suspended: i64, deleted: i64, verb: &str) -> String {
    let res = sqlx::query("UPDATE users SET is_suspended = ?, is_deleted = ? WHERE id = ? AND is_admin = 0")
        .bind(suspended)
        .bind(deleted)
        .bind(target_id)
        .execute(&db.pool)
        .await;
    match res {
        Ok(r) if r.rows_affected() > 0 => {
            feed.publish(Collection::Users, target_id);
            println!("[ADMIN] User {} {}", target_id, verb);
            format!("OK: User {}", verb)
        }
        Ok(_) => "ERR: User not found".to_string(),
        Err(e) => {
            println!("[ADMIN] Error updating user {}: {}", target_id, e);
            format!("ERR: DB error: {}", e)
        }
    }
}

pub async fn suspend_user(db: Arc<Database>, feed: &ChangeFeed, admin_id: &str, target_id: &str) -> String {
    if !is_admin(&db, admin_id).await {
        return "ERR: Admin access required".to_string();
    }
    set_user_flags(&db, feed, target_id, 1, 0, "suspended").await
}

pub async fn delete_user(db: Arc<Database>, feed: &ChangeFeed, admin_id: &str, target_id: &str) -> String {
    if !is_admin(&db, admin_id).await {
        return "ERR: Admin access required".to_string();
    }
    set_user_flags(&db, feed, target_id, 0, 1, "deleted").await
}

/// Restore clears both moderation flags.
pub async fn restore_user(db: Arc<Database>, feed: &ChangeFeed, admin_id: &str, target_id: &str) -> String {
    if !is_admin(&db, admin_id).await {
        return "ERR: Admin access required".to_string();
    }
    set_user_flags(&db, feed, target_id, 0, 0, "restored").await
}

/// Permanent removal: user row, credentials and sessions. Connection and
/// message history stays behind, as with the original "permanent delete".
pub async fn purge_user(db: Arc<Database>, feed: &ChangeFeed, admin_id: &str, target_id: &str) -> String {
    if !is_admin(&db, admin_id).await {
        return "ERR: Admin access required".to_string();
    }
    let res = sqlx::query("DELETE FROM users WHERE id = ? AND is_admin = 0")
        .bind(target_id)
        .execute(&db.pool)
        .await;
    match res {
        Ok(r) if r.rows_affected() > 0 => {
            let _ = sqlx::query("DELETE FROM auth WHERE user_id = ?")
                .bind(target_id)
                .execute(&db.pool)
                .await;
            let _ = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
                .bind(target_id)
                .execute(&db.pool)
                .await;
            feed.publish(Collection::Users, target_id);
            println!("[ADMIN] User {} permanently deleted", target_id);
            "OK: User permanently deleted".to_string()
        }
        Ok(_) => "ERR: User not found".to_string(),
        Err(e) => {
            println!("[ADMIN] Error purging user {}: {}", target_id, e);
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

    async fn seed_user(db: &Database, id: &str, course: &str, deleted: i64, created_at: i64) {
        sqlx::query("INSERT INTO users (id, name, email, course, is_deleted, created_at, last_active) VALUES (?, ?, ?, ?, ?, ?, ?)")
            .bind(id)
            .bind(format!("User {}", id))
            .bind(format!("{}@uni.rw", id))
            .bind(course)
            .bind(deleted)
            .bind(created_at)
            .bind(created_at)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    async fn seed_connection(db: &Database, a: &str, b: &str, status: &str) {
        sqlx::query("INSERT INTO connections (id, requester_id, receiver_id, status, created_at, updated_at) VALUES (?, ?, ?, ?, 0, 0)")
            .bind(crate::server::connections::pair_id(a, b))
            .bind(a)
            .bind(b)
            .bind(status)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn aggregation_over_seeded_collections() {
        let db = test_db().await;
        let now = chrono::Utc::now().timestamp();
        // 10 users, 2 flagged deleted, 3 distinct courses
        for i in 1..=10 {
            let id = format!("u{}", i);
            let course = match i % 3 {
                0 => "CS",
                1 => "Law",
                _ => "Math",
            };
            let deleted = if i <= 2 { 1 } else { 0 };
            seed_user(&db, &id, course, deleted, now).await;
        }
        // 5 accepted connections plus one pending that must not count
        for i in 1..=5 {
            seed_connection(&db, &format!("u{}", i), &format!("u{}", i + 5), "accepted").await;
        }
        seed_connection(&db, "u1", "u3", "pending").await;

        let stats = compute_stats(&db).await.unwrap();
        assert_eq!(stats.total_users, 10);
        assert_eq!(stats.active_users, 8);
        assert_eq!(stats.total_connections, 5);
        assert_eq!(stats.pending_connections, 1);
        assert_eq!(stats.distinct_courses, 3);
        assert_eq!(stats.new_today, 10);
        assert_eq!(stats.new_last7_days, 10);
    }

    #[tokio::test]
    async fn admin_seeding_is_idempotent_and_excluded_from_stats() {
        let db = test_db().await;
        let mut config = ServerConfig::from_env();
        config.argon2_salt_length = 16;
        ensure_admin_account(db.clone(), &config).await.unwrap();
        ensure_admin_account(db.clone(), &config).await.unwrap();
        let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE is_admin = 1")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(admins, 1);
        let stats = compute_stats(&db).await.unwrap();
        assert_eq!(stats.total_users, 0);
    }

    #[tokio::test]
    async fn moderation_requires_admin_flag() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        seed_user(&db, "u1", "CS", 0, 0).await;
        seed_user(&db, "u2", "CS", 0, 0).await;

        let res = suspend_user(db.clone(), &feed, "u1", "u2").await;
        assert_eq!(res, "ERR: Admin access required");
        let res = stats(db.clone(), "u1").await;
        assert_eq!(res, "ERR: Admin access required");
    }

    #[tokio::test]
    async fn suspend_delete_restore_purge_cycle() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        sqlx::query("INSERT INTO users (id, name, email, is_admin, created_at, last_active) VALUES ('a1', 'Admin', 'admin@x', 1, 0, 0)")
            .execute(&db.pool)
            .await
            .unwrap();
        seed_user(&db, "u1", "CS", 0, 0).await;

        assert_eq!(suspend_user(db.clone(), &feed, "a1", "u1").await, "OK: User suspended");
        assert_eq!(delete_user(db.clone(), &feed, "a1", "u1").await, "OK: User deleted");
        assert_eq!(compute_stats(&db).await.unwrap().active_users, 0);
        assert_eq!(restore_user(db.clone(), &feed, "a1", "u1").await, "OK: User restored");
        assert_eq!(compute_stats(&db).await.unwrap().active_users, 1);
        assert_eq!(purge_user(db.clone(), &feed, "a1", "u1").await, "OK: User permanently deleted");
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = 'u1'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        // Admins cannot be purged
        assert_eq!(purge_user(db.clone(), &feed, "a1", "a1").await, "ERR: User not found");
    }
}
