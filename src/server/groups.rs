use crate::server::database::Database;
use crate::server::changes::{ChangeFeed, Collection};
use crate::server::conversations;
use std::sync::Arc;
use sqlx::Row;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: String,
    pub name: String,
    pub purpose: String,
    pub created_by: String,
    pub member_count: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationSummary {
    pub id: i64,
    pub group_id: String,
    pub group_name: String,
    pub inviter_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDetail {
    pub user_id: String,
    pub name: String,
    pub university: String,
    pub joined_at: i64,
}

/// Creates the group with the creator pre-seeded as sole member, plus the
/// group conversation, in one transaction. Invitations are fired afterwards,
/// one per invitee, each independent: a failed invite never rolls back the
/// group or the other invites.
pub async fn create_group(db: Arc<Database>, feed: &ChangeFeed, user_id: &str, name: &str, purpose: &str, invitees: Option<&str>) -> String {
    println!("[GROUPS] Create group '{}' by user {} with invitees: {:?}", name, user_id, invitees);
    if name.is_empty() {
        return "ERR: Group name is required".to_string();
    }
    let group_id = uuid::Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().timestamp();

    let creator = sqlx::query("SELECT name, university FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await;
    let (creator_name, creator_university) = match creator {
        Ok(Some(row)) => (row.get::<String, _>("name"), row.get::<String, _>("university")),
        Ok(None) => return "ERR: User not found".to_string(),
        Err(e) => return format!("ERR: DB error: {}", e),
    };

    let tx = db.pool.begin().await;
    match tx {
        Ok(mut tx) => {
            let res = sqlx::query("INSERT INTO study_groups (id, name, purpose, created_by, created_at) VALUES (?, ?, ?, ?, ?)")
                .bind(&group_id)
                .bind(name)
                .bind(purpose)
                .bind(user_id)
                .bind(created_at)
                .execute(&mut *tx)
                .await;
            if let Err(e) = res {
                println!("[GROUPS] Error creating group: {}", e);
                return format!("ERR: Could not create group: {}", e);
            }
            let res = sqlx::query("INSERT INTO group_members (group_id, user_id, user_name, user_university, joined_at) VALUES (?, ?, ?, ?, ?)")
                .bind(&group_id)
                .bind(user_id)
                .bind(&creator_name)
                .bind(&creator_university)
                .bind(created_at)
                .execute(&mut *tx)
                .await;
            if let Err(e) = res {
                println!("[GROUPS] Error adding creator as member: {}", e);
                return format!("ERR: Could not add creator as member: {}", e);
            }
            // Group chat thread shares the group id
            let res = sqlx::query("INSERT INTO conversations (id, is_group, created_at, updated_at) VALUES (?, 1, ?, ?)")
                .bind(&group_id)
                .bind(created_at)
                .bind(created_at)
                .execute(&mut *tx)
                .await;
            if let Err(e) = res {
                println!("[GROUPS] Error creating group conversation: {}", e);
                return format!("ERR: Could not create group: {}", e);
            }
            let res = sqlx::query("INSERT INTO conversation_participants (conversation_id, user_id, user_name, user_university) VALUES (?, ?, ?, ?)")
                .bind(&group_id)
                .bind(user_id)
                .bind(&creator_name)
                .bind(&creator_university)
                .execute(&mut *tx)
                .await;
            if let Err(e) = res {
                println!("[GROUPS] Error adding creator to group conversation: {}", e);
                return format!("ERR: Could not create group: {}", e);
            }
            if let Err(e) = tx.commit().await {
                println!("[GROUPS] Error committing group creation: {}", e);
                return format!("ERR: Could not create group: {}", e);
            }
        }
        Err(e) => {
            println!("[GROUPS] Error starting transaction: {}", e);
            return format!("ERR: Could not create group: {}", e);
        }
    }

    if let Some(invitee_list) = invitees {
        for invitee_id in invitee_list.split(',') {
            let invitee_id = invitee_id.trim();
            if invitee_id.is_empty() || invitee_id == user_id {
                continue;
            }
            let res = invite_user_to_group(db.clone(), feed, user_id, &group_id, invitee_id).await;
            if res.starts_with("ERR:") {
                println!("[GROUPS] Invite to {} for group {} failed: {}", invitee_id, group_id, res);
            }
        }
    }

    feed.publish(Collection::Groups, &group_id);
    println!("[GROUPS] Group '{}' created with id {}", name, group_id);
    format!("OK: Group '{}' created with ID: {}", name, group_id)
}

pub async fn invite_user_to_group(db: Arc<Database>, feed: &ChangeFeed, inviter_id: &str, group_id: &str, invitee_id: &str) -> String {
    println!("[GROUPS] Invite {} to group {} by {}", invitee_id, group_id, inviter_id);

    let group_exists = sqlx::query("SELECT 1 FROM study_groups WHERE id = ?")
        .bind(group_id)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .is_some();
    if !group_exists {
        return "ERR: Group not found".to_string();
    }

    let invitee_exists = sqlx::query("SELECT 1 FROM users WHERE id = ? AND is_deleted = 0")
        .bind(invitee_id)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .is_some();
    if !invitee_exists {
        return "ERR: User not found".to_string();
    }

    let inviter_is_member = sqlx::query("SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(inviter_id)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .is_some();
    if !inviter_is_member {
        return "ERR: Only group members can invite".to_string();
    }

    let already_member = sqlx::query("SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(invitee_id)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .is_some();
    if already_member {
        return "ERR: User is already a member of this group".to_string();
    }

    // Pending uniqueness is this pre-check, not a constraint
    let pending_exists = sqlx::query("SELECT 1 FROM group_invitations WHERE group_id = ? AND invitee_id = ? AND status = 'pending'")
        .bind(group_id)
        .bind(invitee_id)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .is_some();
    if pending_exists {
        return "ERR: User already has a pending invite to this group".to_string();
    }

    let created_at = chrono::Utc::now().timestamp();
    let res = sqlx::query("INSERT INTO group_invitations (group_id, inviter_id, invitee_id, status, created_at) VALUES (?, ?, ?, 'pending', ?)")
        .bind(group_id)
        .bind(inviter_id)
        .bind(invitee_id)
        .bind(created_at)
        .execute(&db.pool)
        .await;
    match res {
        Ok(_) => {
            feed.publish(Collection::Invitations, group_id);
            println!("[GROUPS] Invite sent to {} for group {}", invitee_id, group_id);
            "OK: Invite sent".to_string()
        }
        Err(e) => {
            println!("[GROUPS] Error sending invite: {}", e);
            format!("ERR: Could not send invite: {}", e)
        }
    }
}

pub async fn pending_invitations(db: &Database, user_id: &str) -> Result<Vec<InvitationSummary>, sqlx::Error> {
    let rows = sqlx::query(r#"
        SELECT gi.id, gi.group_id, g.name AS group_name, u.name AS inviter_name, gi.created_at
        FROM group_invitations gi
        JOIN study_groups g ON gi.group_id = g.id
        JOIN users u ON gi.inviter_id = u.id
        WHERE gi.invitee_id = ? AND gi.status = 'pending'
        ORDER BY gi.created_at DESC
    "#)
        .bind(user_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows.iter().map(|r| InvitationSummary {
        id: r.get("id"),
        group_id: r.get("group_id"),
        group_name: r.get("group_name"),
        inviter_name: r.get("inviter_name"),
        created_at: r.get("created_at"),
    }).collect())
}

pub async fn my_invites(db: Arc<Database>, user_id: &str) -> String {
    match pending_invitations(&db, user_id).await {
        Ok(invites) => match serde_json::to_string(&invites) {
            Ok(json) => format!("OK: {}", json),
            Err(e) => format!("ERR: {}", e),
        },
        Err(e) => {
            println!("[GROUPS] Error listing invites: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

/// Read invite, mark it accepted, then append membership. The membership
/// insert is idempotent: accepting while already a member still flips the
/// invitation without duplicating the member row.
pub async fn accept_invite(db: Arc<Database>, feed: &ChangeFeed, user_id: &str, invite_id: &str) -> String {
    println!("[GROUPS] Accept invite {} by user {}", invite_id, user_id);
    let row = sqlx::query("SELECT group_id FROM group_invitations WHERE id = ? AND invitee_id = ? AND status = 'pending'")
        .bind(invite_id)
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await;
    let group_id = match row {
        Ok(Some(row)) => row.get::<String, _>("group_id"),
        _ => return "ERR: Invite not found or already handled".to_string(),
    };

    let res = sqlx::query("UPDATE group_invitations SET status = 'accepted' WHERE id = ?")
        .bind(invite_id)
        .execute(&db.pool)
        .await;
    if res.is_err() {
        return "ERR: Could not update invite".to_string();
    }

    let member = sqlx::query("SELECT name, university FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await;
    let (member_name, member_university) = match member {
        Ok(Some(row)) => (row.get::<String, _>("name"), row.get::<String, _>("university")),
        _ => return "ERR: User not found".to_string(),
    };
    let joined_at = chrono::Utc::now().timestamp();
    let res = sqlx::query("INSERT OR IGNORE INTO group_members (group_id, user_id, user_name, user_university, joined_at) VALUES (?, ?, ?, ?, ?)")
        .bind(&group_id)
        .bind(user_id)
        .bind(&member_name)
        .bind(&member_university)
        .bind(joined_at)
        .execute(&db.pool)
        .await;
    match res {
        Ok(_) => {
            if let Err(e) = conversations::add_participant(&db, &group_id, user_id).await {
                println!("[GROUPS] Error joining group conversation: {}", e);
            }
            feed.publish(Collection::Groups, &group_id);
            feed.publish(Collection::Invitations, &group_id);
            println!("[GROUPS] User {} joined group {} via invite", user_id, group_id);
            "OK: Invite accepted".to_string()
        }
        Err(e) => {
            println!("[GROUPS] Error adding member: {}", e);
            format!("ERR: Could not join group: {}", e)
        }
    }
}

pub async fn decline_invite(db: Arc<Database>, feed: &ChangeFeed, user_id: &str, invite_id: &str) -> String {
    println!("[GROUPS] Decline invite {} by user {}", invite_id, user_id);
    let res = sqlx::query("UPDATE group_invitations SET status = 'declined' WHERE id = ? AND invitee_id = ? AND status = 'pending'")
        .bind(invite_id)
        .bind(user_id)
        .execute(&db.pool)
        .await;
    match res {
        Ok(r) if r.rows_affected() > 0 => {
            feed.publish(Collection::Invitations, invite_id);
            "OK: Invite declined".to_string()
        }
        _ => "ERR: Could not decline invite".to_string(),
    }
}

pub async fn list_for_user(db: &Database, user_id: &str) -> Result<Vec<GroupSummary>, sqlx::Error> {
    let rows = sqlx::query(r#"
        SELECT g.id, g.name, g.purpose, g.created_by, g.created_at,
               (SELECT COUNT(*) FROM group_members gm2 WHERE gm2.group_id = g.id) AS member_count
        FROM study_groups g
        JOIN group_members m ON g.id = m.group_id
        WHERE m.user_id = ?
        ORDER BY g.created_at DESC
    "#)
        .bind(user_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows.iter().map(|r| GroupSummary {
        id: r.get("id"),
        name: r.get("name"),
        purpose: r.get("purpose"),
        created_by: r.get("created_by"),
        member_count: r.get("member_count"),
        created_at: r.get("created_at"),
    }).collect())
}

pub async fn my_groups(db: Arc<Database>, user_id: &str) -> String {
    match list_for_user(&db, user_id).await {
        Ok(groups) => match serde_json::to_string(&groups) {
            Ok(json) => format!("OK: {}", json),
            Err(e) => format!("ERR: {}", e),
        },
        Err(e) => {
            println!("[GROUPS] Error listing groups: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

pub async fn group_members(db: Arc<Database>, group_id: &str) -> String {
    let rows = sqlx::query("SELECT user_id, user_name, user_university, joined_at FROM group_members WHERE group_id = ? ORDER BY joined_at ASC")
        .bind(group_id)
        .fetch_all(&db.pool)
        .await;
    match rows {
        Ok(rows) => {
            let members: Vec<MemberDetail> = rows.iter().map(|r| MemberDetail {
                user_id: r.get("user_id"),
                name: r.get("user_name"),
                university: r.get("user_university"),
                joined_at: r.get("joined_at"),
            }).collect();
            match serde_json::to_string(&members) {
                Ok(json) => format!("OK: {}", json),
                Err(e) => format!("ERR: {}", e),
            }
        }
        Err(e) => {
            println!("[GROUPS] Error getting group members: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

pub async fn leave_group(db: Arc<Database>, feed: &ChangeFeed, user_id: &str, group_id: &str) -> String {
    println!("[GROUPS] User {} leaves group {}", user_id, group_id);
    let creator = sqlx::query("SELECT created_by FROM study_groups WHERE id = ?")
        .bind(group_id)
        .fetch_optional(&db.pool)
        .await;
    match creator {
        Ok(Some(row)) => {
            let created_by: String = row.get("created_by");
            if created_by == user_id {
                return "ERR: The creator cannot leave the group".to_string();
            }
        }
        Ok(None) => return "ERR: Group not found".to_string(),
        Err(e) => return format!("ERR: DB error: {}", e),
    }
    let res = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .execute(&db.pool)
        .await;
    match res {
        Ok(r) if r.rows_affected() > 0 => {
            if let Err(e) = sqlx::query("DELETE FROM conversation_participants WHERE conversation_id = ? AND user_id = ?")
                .bind(group_id)
                .bind(user_id)
                .execute(&db.pool)
                .await
            {
                println!("[GROUPS] Error leaving group conversation: {}", e);
            }
            feed.publish(Collection::Groups, group_id);
            "OK: Left group".to_string()
        }
        Ok(_) => "ERR: Not a member of this group".to_string(),
        Err(e) => {
            println!("[GROUPS] Error leaving group: {}", e);
            format!("ERR: Could not leave group: {}", e)
        }
    }
}
