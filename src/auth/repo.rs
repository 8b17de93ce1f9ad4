use sqlx::{PgPool, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{Role, User};

const USER_COLUMNS: &str = "id, name, email, password_hash, role, email_verified, \
     verification_token_hash, reset_token_hash, reset_token_expires, created_at, updated_at";

/// Search criteria for the admin user listing. All filters combine with AND.
#[derive(Debug, Default, Clone)]
pub struct UserFilter {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub created_from: Option<OffsetDateTime>,
    pub created_until: Option<OffsetDateTime>,
}

/// Whitelisted sort columns; anything else falls back to creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSortKey {
    CreatedAt,
    Name,
    Email,
}

impl UserSortKey {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("name") => UserSortKey::Name,
            Some("email") => UserSortKey::Email,
            _ => UserSortKey::CreatedAt,
        }
    }

    fn as_column(self) -> &'static str {
        match self {
            UserSortKey::CreatedAt => "created_at",
            UserSortKey::Name => "name",
            UserSortKey::Email => "email",
        }
    }
}

impl User {
    /// Find a user by email. Emails are stored lowercased; callers lowercase
    /// the input before lookup.
    pub async fn find_by_email(db: &PgPool, email: &str) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(db)
            .await?;
        Ok(user)
    }

    pub async fn find_by_id(db: &PgPool, id: Uuid) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(user)
    }

    /// Create a new standard-role user with a hashed password.
    pub async fn create(
        db: &PgPool,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> anyhow::Result<User> {
        let sql = format!(
            "INSERT INTO users (name, email, password_hash) VALUES ($1, $2, $3) \
             RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(name)
            .bind(email)
            .bind(password_hash)
            .fetch_one(db)
            .await?;
        Ok(user)
    }

    /// Partial profile update: absent fields keep their previous value.
    pub async fn update_profile(
        db: &PgPool,
        id: Uuid,
        name: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let sql = format!(
            "UPDATE users SET name = COALESCE($2, name), updated_at = now() \
             WHERE id = $1 RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(name)
            .fetch_optional(db)
            .await?;
        Ok(user)
    }

    pub async fn set_password(db: &PgPool, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Returns false when no such user existed.
    pub async fn delete_by_id(db: &PgPool, id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_verification_token(
        db: &PgPool,
        id: Uuid,
        token_hash: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users SET verification_token_hash = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(token_hash)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Marks the matching user verified and clears the token in one
    /// statement, so a token verifies at most once.
    pub async fn consume_verification_token(
        db: &PgPool,
        token_hash: &str,
    ) -> anyhow::Result<Option<User>> {
        let sql = format!(
            "UPDATE users SET email_verified = TRUE, verification_token_hash = NULL, \
             updated_at = now() \
             WHERE verification_token_hash = $1 RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(token_hash)
            .fetch_optional(db)
            .await?;
        Ok(user)
    }

    pub async fn set_reset_token(
        db: &PgPool,
        id: Uuid,
        token_hash: &str,
        expires: OffsetDateTime,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users SET reset_token_hash = $2, reset_token_expires = $3, \
             updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(token_hash)
        .bind(expires)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Single-use reset: setting the new password hash and clearing the
    /// token + expiry happen in the same statement, and the WHERE clause
    /// rejects expired tokens. A second call with the same token matches
    /// nothing.
    pub async fn consume_reset_token(
        db: &PgPool,
        token_hash: &str,
        new_password_hash: &str,
    ) -> anyhow::Result<Option<User>> {
        let sql = format!(
            "UPDATE users SET password_hash = $2, reset_token_hash = NULL, \
             reset_token_expires = NULL, updated_at = now() \
             WHERE reset_token_hash = $1 AND reset_token_expires > now() \
             RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(token_hash)
            .bind(new_password_hash)
            .fetch_optional(db)
            .await?;
        Ok(user)
    }

    pub async fn search(
        db: &PgPool,
        filter: &UserFilter,
        sort: UserSortKey,
        descending: bool,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<User>> {
        let mut qb = QueryBuilder::new(format!("SELECT {USER_COLUMNS} FROM users WHERE 1=1"));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY ")
            .push(sort.as_column())
            .push(if descending { " DESC" } else { " ASC" });
        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);
        let users = qb.build_query_as::<User>().fetch_all(db).await?;
        Ok(users)
    }

    pub async fn count(db: &PgPool, filter: &UserFilter) -> anyhow::Result<i64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM users WHERE 1=1");
        push_filter(&mut qb, filter);
        let total = qb.build_query_scalar::<i64>().fetch_one(db).await?;
        Ok(total)
    }
}

fn push_filter<'a>(qb: &mut QueryBuilder<'a, sqlx::Postgres>, filter: &'a UserFilter) {
    if let Some(name) = &filter.name {
        qb.push(" AND name ILIKE ")
            .push_bind(contains_pattern(name));
    }
    if let Some(email) = &filter.email {
        qb.push(" AND email ILIKE ")
            .push_bind(contains_pattern(email));
    }
    if let Some(role) = filter.role {
        qb.push(" AND role = ").push_bind(role);
    }
    if let Some(from) = filter.created_from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(until) = filter.created_until {
        qb.push(" AND created_at <= ").push_bind(until);
    }
}

/// Substring match pattern for ILIKE. `%`, `_` and `\` in the fragment are
/// literals, not wildcards, so they get escaped.
fn contains_pattern(fragment: &str) -> String {
    let escaped = fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_pattern_escapes_like_wildcards() {
        assert_eq!(contains_pattern("ada"), "%ada%");
        assert_eq!(contains_pattern("100%"), "%100\\%%");
        assert_eq!(contains_pattern("a_b"), "%a\\_b%");
        assert_eq!(contains_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn sort_key_whitelist_rejects_unknown_columns() {
        assert_eq!(UserSortKey::parse(Some("name")), UserSortKey::Name);
        assert_eq!(UserSortKey::parse(Some("email")), UserSortKey::Email);
        assert_eq!(
            UserSortKey::parse(Some("password_hash; DROP TABLE users")),
            UserSortKey::CreatedAt
        );
        assert_eq!(UserSortKey::parse(None), UserSortKey::CreatedAt);
    }

    #[sqlx::test]
    async fn reset_token_is_single_use(pool: PgPool) {
        let user = User::create(&pool, "Ada", "ada@example.com", "old-hash")
            .await
            .unwrap();
        let expires = OffsetDateTime::now_utc() + time::Duration::minutes(30);
        User::set_reset_token(&pool, user.id, "token-digest", expires)
            .await
            .unwrap();

        let first = User::consume_reset_token(&pool, "token-digest", "new-hash")
            .await
            .unwrap();
        assert_eq!(first.map(|u| u.id), Some(user.id));

        // Replaying the same token must not change the password again.
        let second = User::consume_reset_token(&pool, "token-digest", "attacker-hash")
            .await
            .unwrap();
        assert!(second.is_none());

        let stored = User::find_by_id(&pool, user.id).await.unwrap().unwrap();
        assert_eq!(stored.password_hash, "new-hash");
        assert!(stored.reset_token_hash.is_none());
    }

    #[sqlx::test]
    async fn expired_reset_token_matches_nothing(pool: PgPool) {
        let user = User::create(&pool, "Ada", "ada@example.com", "old-hash")
            .await
            .unwrap();
        let expires = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        User::set_reset_token(&pool, user.id, "stale-digest", expires)
            .await
            .unwrap();

        let consumed = User::consume_reset_token(&pool, "stale-digest", "new-hash")
            .await
            .unwrap();
        assert!(consumed.is_none());

        let stored = User::find_by_id(&pool, user.id).await.unwrap().unwrap();
        assert_eq!(stored.password_hash, "old-hash");
    }

    #[sqlx::test]
    async fn name_filter_treats_wildcards_as_literals(pool: PgPool) {
        User::create(&pool, "percent free", "a@example.com", "h")
            .await
            .unwrap();
        User::create(&pool, "100% done", "b@example.com", "h")
            .await
            .unwrap();

        let filter = UserFilter {
            name: Some("%".into()),
            ..UserFilter::default()
        };
        let hits = User::search(&pool, &filter, UserSortKey::CreatedAt, true, 10, 0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].email, "b@example.com");
        assert_eq!(User::count(&pool, &filter).await.unwrap(), 1);
    }
}
