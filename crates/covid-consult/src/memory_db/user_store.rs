//! User nodes: registration, credential checks and lookups.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::memory_db::schema::UserRecord;
use crate::memory_db::{write_tx, DbPool};

const USER_COLUMNS: &str = "id, username, password_hash, name, age, created_at";

pub struct UserStore {
    pool: Arc<DbPool>,
}

impl UserStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Register `username`. The UNIQUE constraint on `users.username` closes
    /// the race between two concurrent registrations of the same name.
    pub fn create_user(&self, username: &str, password: &str) -> Result<String, StoreError> {
        let password_hash = hash_password(password)?;
        let user_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        write_tx(&self.pool, |tx| {
            let taken = tx
                .query_row("SELECT 1 FROM users WHERE username = ?1", [username], |_| Ok(()))
                .optional()?
                .is_some();
            if taken {
                return Err(StoreError::DuplicateUsername(username.to_string()));
            }
            tx.execute(
                "INSERT INTO users (id, username, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user_id, username, password_hash, now],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _)
                    if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    StoreError::DuplicateUsername(username.to_string())
                }
                other => StoreError::Database(other),
            })?;
            Ok(())
        })?;

        info!("User {} created successfully with ID {}", username, user_id);
        Ok(user_id)
    }

    /// Resolve credentials to a user id.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<String, StoreError> {
        let user = self
            .get_user_by_username(username)?
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
        if !verify_password(password, &user.password_hash)? {
            debug!("Rejected credentials for {}", username);
            return Err(StoreError::BadCredential);
        }
        Ok(user.id)
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS);
        let row = conn.query_row(&sql, [username], row_to_user).optional()?;
        Ok(row)
    }

    pub fn get_user(&self, user_id: &str) -> Result<UserRecord, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        conn.query_row(&sql, [user_id], row_to_user)
            .optional()?
            .ok_or_else(|| StoreError::UnknownUser(user_id.to_string()))
    }

    pub fn exists(&self, user_id: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", [user_id], |_| Ok(()))
            .optional()?
            .is_some())
    }
}

fn row_to_user(row: &Row) -> rusqlite::Result<UserRecord> {
    let created_at: String = row.get(5)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?
        .with_timezone(&Utc);
    let age: Option<i64> = row.get(4)?;
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        name: row.get(3)?,
        age: age.and_then(|a| u32::try_from(a).ok()),
        created_at,
    })
}

fn hash_password(password: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| StoreError::Credential(e.to_string()))
}

fn verify_password(password: &str, stored_hash: &str) -> Result<bool, StoreError> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|e| StoreError::Malformed(format!("stored password hash: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
