//! User accounts
//!
//! Credentials are argon2-hashed. Repeated failed logins increment a lockout
//! counter; past the limit the account locks for a cooldown window.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Failed logins before the account locks
const LOCKOUT_LIMIT: i64 = 5;

/// Lockout cooldown, minutes
const LOCKOUT_MINUTES: i64 = 15;

/// One user row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    /// User id
    pub id: String,
    /// Login email
    pub email: String,
    /// argon2 hash
    pub password_hash: String,
    /// Role: `user` or `admin`
    pub role: String,
    /// Linked upstream member id
    pub member_id: Option<String>,
    /// Consecutive failed logins
    pub failed_logins: i64,
    /// Locked until this instant, when set
    pub locked_until: Option<DateTime<Utc>>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Row update time
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    /// Whether the account is currently locked out
    pub fn is_locked(&self) -> bool {
        self.locked_until.is_some_and(|until| until > Utc::now())
    }
}

/// Users repository
pub struct UserRepo {
    pool: SqlitePool,
}

impl UserRepo {
    /// Wrap a pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a user with a hashed password
    pub async fn create(
        &self,
        email: &str,
        password: &str,
        role: &str,
        member_id: Option<&str>,
    ) -> AppResult<UserRow> {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))?
            .to_string();

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, role, member_id, failed_logins, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(email)
        .bind(&password_hash)
        .bind(role)
        .bind(member_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| AppError::Internal("user vanished after insert".to_string()))
    }

    /// Look a user up by id
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<UserRow>> {
        Ok(sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Look a user up by email
    pub async fn find_by_email(&self, email: &str) -> AppResult<Option<UserRow>> {
        Ok(
            sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE email = ?")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Verify credentials, maintaining the lockout counters
    ///
    /// Returns the user on success. Wrong passwords increment the failure
    /// counter; the account locks after the limit.
    pub async fn authenticate(&self, email: &str, password: &str) -> AppResult<UserRow> {
        let user = self
            .find_by_email(email)
            .await?
            .ok_or_else(|| AppError::Unauthorized("invalid credentials".to_string()))?;

        if user.is_locked() {
            return Err(AppError::Forbidden(
                "account temporarily locked".to_string(),
            ));
        }

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| AppError::Internal(format!("stored hash unreadable: {}", e)))?;
        let valid = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();

        if !valid {
            self.record_failure(&user).await?;
            return Err(AppError::Unauthorized("invalid credentials".to_string()));
        }

        sqlx::query(
            "UPDATE users SET failed_logins = 0, locked_until = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(&user.id)
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    async fn record_failure(&self, user: &UserRow) -> AppResult<()> {
        let failed = user.failed_logins + 1;
        let locked_until = if failed >= LOCKOUT_LIMIT {
            Some(Utc::now() + Duration::minutes(LOCKOUT_MINUTES))
        } else {
            None
        };
        sqlx::query(
            "UPDATE users SET failed_logins = ?, locked_until = ?, updated_at = ? WHERE id = ?",
        )
        .bind(failed)
        .bind(locked_until)
        .bind(Utc::now())
        .bind(&user.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_create_and_authenticate() {
        let repo = UserRepo::new(test_pool().await);
        let user = repo
            .create("ops@example.com", "hunter2hunter2", "admin", Some("m1"))
            .await
            .unwrap();
        assert_eq!(user.role, "admin");
        assert_ne!(user.password_hash, "hunter2hunter2");

        let authed = repo
            .authenticate("ops@example.com", "hunter2hunter2")
            .await
            .unwrap();
        assert_eq!(authed.id, user.id);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected_and_counted() {
        let repo = UserRepo::new(test_pool().await);
        repo.create("a@example.com", "correct-password", "user", None)
            .await
            .unwrap();

        let err = repo.authenticate("a@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let user = repo.find_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(user.failed_logins, 1);
    }

    #[tokio::test]
    async fn test_lockout_after_repeated_failures() {
        let repo = UserRepo::new(test_pool().await);
        repo.create("b@example.com", "correct-password", "user", None)
            .await
            .unwrap();

        for _ in 0..5 {
            let _ = repo.authenticate("b@example.com", "wrong").await;
        }
        let err = repo
            .authenticate("b@example.com", "correct-password")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let repo = UserRepo::new(test_pool().await);
        repo.create("c@example.com", "correct-password", "user", None)
            .await
            .unwrap();

        let _ = repo.authenticate("c@example.com", "wrong").await;
        repo.authenticate("c@example.com", "correct-password")
            .await
            .unwrap();
        let user = repo.find_by_email("c@example.com").await.unwrap().unwrap();
        assert_eq!(user.failed_logins, 0);
    }
}
