use crate::server::database::Database;
use crate::server::config::ServerConfig;
use std::sync::Arc;
use sqlx::Row;
use argon2::{Argon2, password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString}};
use rand::RngCore;

pub fn hash_password(password: &str, salt_length: u32) -> String {
    let mut salt_bytes = vec![0u8; salt_length as usize];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes).unwrap();
    let argon2 = Argon2::default();
    argon2.hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

fn verify_password(hash: &str, password: &str) -> bool {
    // The salt is embedded in the hash string
    match PasswordHash::new(hash) {
        Ok(parsed_hash) => Argon2::default().verify_password(password.as_bytes(), &parsed_hash).is_ok(),
        Err(_) => false,
    }
}

fn generate_session_token() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    format!("{}-{:x}", uuid, md5::compute(random))
}

pub async fn register(db: Arc<Database>, email: &str, password: &str, name: &str, config: &ServerConfig) -> String {
    println!("[AUTH] Register attempt: {}", email);
    if email.is_empty() || password.is_empty() || name.is_empty() {
        return "ERR: Name, email and password are required".to_string();
    }
    let user_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    let password_hash = hash_password(password, config.argon2_salt_length);
    let tx = db.pool.begin().await;
    match tx {
        Ok(mut tx) => {
            let res = sqlx::query("INSERT INTO users (id, name, email, created_at, last_active) VALUES (?, ?, ?, ?, ?)")
                .bind(&user_id)
                .bind(name)
                .bind(email)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await;
            if let Err(e) = res {
                let err_str = e.to_string();
                println!("[AUTH] Registration failed for {}: {}", email, err_str);
                if err_str.to_uppercase().contains("UNIQUE") || err_str.to_lowercase().contains("constraint failed") {
                    return "ERR: Email already registered".to_string();
                }
                return "ERR: Registration failed".to_string();
            }
            if let Err(e) = sqlx::query("INSERT INTO auth (user_id, password_hash) VALUES (?, ?)")
                .bind(&user_id)
                .bind(&password_hash)
                .execute(&mut *tx)
                .await
            {
                println!("[AUTH] Failed storing credentials for {}: {}", email, e);
                return format!("ERR: Registration failed: {}", e);
            }
            // Open a session right away so registration doubles as login
            let session_token = generate_session_token();
            let expires = now + 60*60*24*config.session_expiry_days as i64;
            if let Err(e) = sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
                .bind(&user_id)
                .bind(&session_token)
                .bind(now)
                .bind(expires)
                .execute(&mut *tx)
                .await
            {
                println!("[AUTH] Failed inserting session for {}: {}", user_id, e);
                return format!("ERR: Registration failed: {}", e);
            }
            if let Err(e) = tx.commit().await {
                println!("[AUTH] Failed to commit registration for {}: {}", email, e);
                return format!("ERR: Registration failed: {}", e);
            }
            println!("[AUTH] Registered user {} (id={})", email, user_id);
            format!("OK: Registered as {} SESSION: {}", name, session_token)
        }
        Err(e) => {
            println!("[AUTH] Registration failed for {}: {}", email, e);
            format!("ERR: Registration failed: {}", e)
        }
    }
}

pub async fn login(db: Arc<Database>, email: &str, password: &str, config: &ServerConfig) -> String {
    println!("[AUTH] Login attempt: {}", email);
    let row = sqlx::query("SELECT users.id, users.name, users.is_suspended, users.is_deleted, password_hash FROM users JOIN auth ON users.id = auth.user_id WHERE email = ?")
        .bind(email)
        .fetch_optional(&db.pool)
        .await;
    match row {
        Ok(Some(row)) => {
            let user_id: String = row.get("id");
            let name: String = row.get("name");
            let is_suspended: i64 = row.get("is_suspended");
            let is_deleted: i64 = row.get("is_deleted");
            let password_hash: String = row.get("password_hash");
            if !verify_password(&password_hash, password) {
                println!("[AUTH] Login failed for {}: wrong password", email);
                return "ERR: Wrong password".to_string();
            }
            if is_deleted != 0 {
                println!("[AUTH] Login refused for {}: account deleted", email);
                return "ERR: Account deleted".to_string();
            }
            if is_suspended != 0 {
                println!("[AUTH] Login refused for {}: account suspended", email);
                return "ERR: Account suspended".to_string();
            }
            match db.pool.begin().await {
                Ok(mut tx) => {
                    let now = chrono::Utc::now().timestamp();
                    let session_token = generate_session_token();
                    let expires = now + 60*60*24*config.session_expiry_days as i64;
                    if let Err(e) = sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
                        .bind(&user_id)
                        .bind(&session_token)
                        .bind(now)
                        .bind(expires)
                        .execute(&mut *tx)
                        .await
                    {
                        println!("[AUTH] Failed inserting session for {}: {}", user_id, e);
                        return format!("ERR: Login failed: {}", e);
                    }
                    let _ = sqlx::query("UPDATE users SET last_active = ? WHERE id = ?")
                        .bind(now)
                        .bind(&user_id)
                        .execute(&mut *tx)
                        .await;
                    let _ = sqlx::query("INSERT INTO session_events (user_id, event_type, created_at) VALUES (?, ?, ?)")
                        .bind(&user_id)
                        .bind("login_success")
                        .bind(now)
                        .execute(&mut *tx)
                        .await;
                    if let Err(e) = tx.commit().await {
                        println!("[AUTH] Failed to commit login transaction for {}: {}", user_id, e);
                        return format!("ERR: Login failed: {}", e);
                    }
                    println!("[AUTH] Login success for {} (id={})", email, user_id);
                    format!("OK: Logged in as {} SESSION: {}", name, session_token)
                }
                Err(e) => {
                    println!("[AUTH] Failed to start transaction for login {}: {}", email, e);
                    format!("ERR: Login failed: {}", e)
                }
            }
        }
        Ok(None) => {
            println!("[AUTH] Login failed for {}: user not found", email);
            "ERR: User not found".to_string()
        }
        Err(e) => {
            println!("[AUTH] Login failed for {}: {}", email, e);
            format!("ERR: Login failed: {}", e)
        }
    }
}

/// Logout: drop every session for the user behind the token
pub async fn logout(db: Arc<Database>, session_token: &str) -> String {
    println!("[AUTH] logout called (token masked)");
    let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ?")
        .bind(session_token)
        .fetch_optional(&db.pool)
        .await;
    match row {
        Ok(Some(row)) => {
            let user_id: String = row.get("user_id");
            match sqlx::query("DELETE FROM sessions WHERE user_id = ?")
                .bind(&user_id)
                .execute(&db.pool)
                .await
            {
                Ok(r) => println!("[AUTH] Deleted {} session rows for user {}", r.rows_affected(), user_id),
                Err(e) => println!("[AUTH] Failed deleting sessions for {}: {}", user_id, e),
            }
            let now = chrono::Utc::now().timestamp();
            let _ = sqlx::query("INSERT INTO session_events (user_id, event_type, created_at) VALUES (?, ?, ?)")
                .bind(&user_id)
                .bind("logout")
                .bind(now)
                .execute(&db.pool)
                .await;
            println!("[AUTH] Logout success for user_id={}", user_id);
            "OK: Logged out".to_string()
        }
        Ok(None) => {
            println!("[AUTH] Logout failed: session not found");
            "ERR: Session not found".to_string()
        }
        Err(e) => {
            println!("[AUTH] Logout failed: {}", e);
            format!("ERR: Logout failed: {}", e)
        }
    }
}

pub async fn validate_session(db: Arc<Database>, session_token: &str) -> Option<String> {
    let now = chrono::Utc::now().timestamp();
    let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
        .bind(session_token)
        .bind(now)
        .fetch_optional(&db.pool)
        .await
        .ok()?;

    if let Some(row) = row {
        let user_id: String = row.get("user_id");
        // Refresh last_active on every validated call
        let _ = sqlx::query("UPDATE users SET last_active = ? WHERE id = ?")
            .bind(now)
            .bind(&user_id)
            .execute(&db.pool)
            .await;
        Some(user_id)
    } else {
        None
    }
}

/// Removes expired sessions. Idempotent and safe to run periodically.
pub async fn cleanup_expired_sessions(db: Arc<Database>) {
    let now = chrono::Utc::now().timestamp();
    match sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(&db.pool)
        .await
    {
        Ok(res) => println!("[AUTH] Cleaned up {} expired sessions", res.rows_affected()),
        Err(e) => println!("[AUTH] Failed to cleanup sessions: {}", e),
    }
}
