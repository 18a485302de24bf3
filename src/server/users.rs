use crate::server::database::Database;
use crate::server::changes::{ChangeFeed, Collection};
use std::sync::Arc;
use sqlx::Row;
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub country: String,
    pub university: String,
    pub course: String,
    pub availability: String,
    pub study_type: String,
    pub created_at: i64,
    pub last_active: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileUpdate {
    pub country: Option<String>,
    pub university: Option<String>,
    pub course: Option<String>,
    pub availability: Option<String>,
    pub study_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFilters {
    pub country: Option<String>,
    pub university: Option<String>,
    pub course: Option<String>,
    pub availability: Option<String>,
    pub study_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub score: i32,
}

fn profile_from_row(row: &sqlx::sqlite::SqliteRow) -> UserProfile {
    UserProfile {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        country: row.get("country"),
        university: row.get("university"),
        course: row.get("course"),
        availability: row.get("availability"),
        study_type: row.get("study_type"),
        created_at: row.get("created_at"),
        last_active: row.get("last_active"),
    }
}

pub async fn fetch_profile(db: &Database, user_id: &str) -> Result<Option<UserProfile>, sqlx::Error> {
    let row = sqlx::query("SELECT id, name, email, country, university, course, availability, study_type, created_at, last_active FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.as_ref().map(profile_from_row))
}

pub async fn profile(db: Arc<Database>, user_id: &str) -> String {
    match fetch_profile(&db, user_id).await {
        Ok(Some(profile)) => match serde_json::to_string(&profile) {
            Ok(json) => format!("OK: {}", json),
            Err(e) => format!("ERR: {}", e),
        },
        Ok(None) => "ERR: User not found".to_string(),
        Err(e) => {
            println!("[USERS] Error reading profile: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

/// Merges the provided profile fields onto the user row. Denormalized
/// snapshots already copied into conversations/groups are left as they were,
/// same as the original.
pub async fn update_profile(db: Arc<Database>, feed: &ChangeFeed, user_id: &str, payload: &str) -> String {
    let update: ProfileUpdate = match serde_json::from_str(payload) {
        Ok(update) => update,
        Err(e) => return format!("ERR: Invalid profile payload: {}", e),
    };
    let current = match fetch_profile(&db, user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => return "ERR: User not found".to_string(),
        Err(e) => return format!("ERR: DB error: {}", e),
    };
    let res = sqlx::query("UPDATE users SET country = ?, university = ?, course = ?, availability = ?, study_type = ? WHERE id = ?")
        .bind(update.country.unwrap_or(current.country))
        .bind(update.university.unwrap_or(current.university))
        .bind(update.course.unwrap_or(current.course))
        .bind(update.availability.unwrap_or(current.availability))
        .bind(update.study_type.unwrap_or(current.study_type))
        .bind(user_id)
        .execute(&db.pool)
        .await;
    match res {
        Ok(_) => {
            feed.publish(Collection::Users, user_id);
            println!("[USERS] Profile updated for {}", user_id);
            "OK: Profile updated".to_string()
        }
        Err(e) => {
            println!("[USERS] Error updating profile: {}", e);
            format!("ERR: DB error: {}", e)
        }
    }
}

/// Weighted similarity between the searcher and a candidate. Course matches
/// weigh most, then shared university/availability, then study type and
/// country. Empty fields never match.
pub fn match_score(me: &UserProfile, other: &UserProfile) -> i32 {
    let mut score = 0;
    if !me.course.is_empty() && me.course == other.course {
        score += 3;
    }
    if !me.university.is_empty() && me.university == other.university {
        score += 2;
    }
    if !me.availability.is_empty() && me.availability == other.availability {
        score += 2;
    }
    if !me.study_type.is_empty() && me.study_type == other.study_type {
        score += 1;
    }
    if !me.country.is_empty() && me.country == other.country {
        score += 1;
    }
    score
}

fn filter_matches(filters: &SearchFilters, candidate: &UserProfile) -> bool {
    if let Some(country) = &filters.country {
        if !country.is_empty() && candidate.country != *country {
            return false;
        }
    }
    if let Some(university) = &filters.university {
        if !university.is_empty() && candidate.university != *university {
            return false;
        }
    }
    if let Some(course) = &filters.course {
        if !course.is_empty() && candidate.course != *course {
            return false;
        }
    }
    if let Some(availability) = &filters.availability {
        if !availability.is_empty() && candidate.availability != *availability {
            return false;
        }
    }
    if let Some(study_type) = &filters.study_type {
        if !study_type.is_empty() && candidate.study_type != *study_type {
            return false;
        }
    }
    true
}

/// Directory search: fetch the candidate set, apply the optional equality
/// filters, rank by weighted score. Linear scan over the full user set,
/// no pagination.
pub async fn search_partners(db: Arc<Database>, user_id: &str, filters_payload: Option<&str>) -> String {
    let filters: SearchFilters = match filters_payload {
        Some(payload) => match serde_json::from_str(payload) {
            Ok(filters) => filters,
            Err(e) => return format!("ERR: Invalid search filters: {}", e),
        },
        None => SearchFilters::default(),
    };
    let me = match fetch_profile(&db, user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => return "ERR: User not found".to_string(),
        Err(e) => return format!("ERR: DB error: {}", e),
    };

    let rows = sqlx::query("SELECT id, name, email, country, university, course, availability, study_type, created_at, last_active FROM users WHERE id != ? AND is_deleted = 0 AND is_suspended = 0 AND is_admin = 0")
        .bind(user_id)
        .fetch_all(&db.pool)
        .await;
    match rows {
        Ok(rows) => {
            let mut results: Vec<SearchResult> = rows.iter()
                .map(profile_from_row)
                .filter(|candidate| filter_matches(&filters, candidate))
                .map(|candidate| {
                    let score = match_score(&me, &candidate);
                    SearchResult { profile: candidate, score }
                })
                .collect();
            results.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.profile.name.cmp(&b.profile.name)));
            match serde_json::to_string(&results) {
                Ok(json) => format!("OK: {}", json),
                Err(e) => format!("ERR: {}", e),
            }
        }
        Err(e) => {
            println!("[USERS] Error searching partners: {}", e);
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

    async fn seed_user(db: &Database, id: &str, name: &str, course: &str, university: &str) {
        sqlx::query("INSERT INTO users (id, name, email, country, university, course, availability, study_type, created_at, last_active) VALUES (?, ?, ?, 'RW', ?, ?, 'evenings', 'group', 0, 0)")
            .bind(id)
            .bind(name)
            .bind(format!("{}@uni.rw", id))
            .bind(university)
            .bind(course)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    fn profile_with(course: &str, university: &str, availability: &str) -> UserProfile {
        UserProfile {
            course: course.to_string(),
            university: university.to_string(),
            availability: availability.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn course_outweighs_university_and_availability_alone() {
        let me = profile_with("CS", "UR", "evenings");
        let same_course = profile_with("CS", "", "");
        let same_university = profile_with("", "UR", "");
        let same_availability = profile_with("", "", "evenings");
        assert_eq!(match_score(&me, &same_course), 3);
        assert_eq!(match_score(&me, &same_university), 2);
        assert_eq!(match_score(&me, &same_availability), 2);
        assert!(match_score(&me, &same_course) > match_score(&me, &same_university));
    }

    #[test]
    fn empty_fields_never_match() {
        let me = UserProfile::default();
        let other = UserProfile::default();
        assert_eq!(match_score(&me, &other), 0);
    }

    #[tokio::test]
    async fn search_ranks_by_score_and_excludes_self() {
        let db = test_db().await;
        seed_user(&db, "u1", "Ana", "CS", "UR").await;
        seed_user(&db, "u2", "Ben", "CS", "UR").await;
        seed_user(&db, "u3", "Cleo", "Law", "ALU").await;

        let res = search_partners(db.clone(), "u1", None).await;
        assert!(res.starts_with("OK:"), "{}", res);
        let results: Vec<serde_json::Value> = serde_json::from_str(res.trim_start_matches("OK: ")).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["id"], "u2");
        assert!(results[0]["score"].as_i64().unwrap() > results[1]["score"].as_i64().unwrap());
    }

    #[tokio::test]
    async fn search_excludes_deleted_and_suspended() {
        let db = test_db().await;
        seed_user(&db, "u1", "Ana", "CS", "UR").await;
        seed_user(&db, "u2", "Ben", "CS", "UR").await;
        seed_user(&db, "u3", "Cleo", "CS", "UR").await;
        sqlx::query("UPDATE users SET is_deleted = 1 WHERE id = 'u2'").execute(&db.pool).await.unwrap();
        sqlx::query("UPDATE users SET is_suspended = 1 WHERE id = 'u3'").execute(&db.pool).await.unwrap();

        let res = search_partners(db.clone(), "u1", None).await;
        let results: Vec<serde_json::Value> = serde_json::from_str(res.trim_start_matches("OK: ")).unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn filters_narrow_the_candidate_set() {
        let db = test_db().await;
        seed_user(&db, "u1", "Ana", "CS", "UR").await;
        seed_user(&db, "u2", "Ben", "CS", "UR").await;
        seed_user(&db, "u3", "Cleo", "Law", "ALU").await;

        let res = search_partners(db.clone(), "u1", Some(r#"{"course":"Law"}"#)).await;
        let results: Vec<serde_json::Value> = serde_json::from_str(res.trim_start_matches("OK: ")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], "u3");
    }

    #[tokio::test]
    async fn update_profile_merges_fields() {
        let db = test_db().await;
        let feed = ChangeFeed::new();
        seed_user(&db, "u1", "Ana", "CS", "UR").await;

        let res = update_profile(db.clone(), &feed, "u1", r#"{"course":"Math"}"#).await;
        assert_eq!(res, "OK: Profile updated");
        let profile = fetch_profile(&db, "u1").await.unwrap().unwrap();
        assert_eq!(profile.course, "Math");
        // Untouched fields survive the merge
        assert_eq!(profile.university, "UR");
        assert_eq!(profile.availability, "evenings");
    }
}
