//! Email connection CRUD operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{EmailConnection, ProviderKind, UserId};
use crate::storage::database::{Database, Result};

use super::{parse_enum, parse_opt_ts, parse_ts};

const SELECT_COLUMNS: &str = r#"
    SELECT
        user_id, provider, account_email, access_token_enc, refresh_token_enc,
        expires_at, created_at, updated_at
    FROM email_connections
"#;

/// Inserts or replaces the connection for `(user_id, provider)`.
///
/// `created_at` of an existing row is preserved.
pub async fn upsert(db: &Database, conn_row: &EmailConnection) -> Result<()> {
    let c = conn_row.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO email_connections (
                user_id, provider, account_email, access_token_enc, refresh_token_enc,
                expires_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                account_email = excluded.account_email,
                access_token_enc = excluded.access_token_enc,
                refresh_token_enc = COALESCE(
                    excluded.refresh_token_enc,
                    email_connections.refresh_token_enc
                ),
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                c.user_id.as_str(),
                c.provider.as_str(),
                c.account_email,
                c.access_token_enc,
                c.refresh_token_enc,
                c.expires_at.map(|t| t.to_rfc3339()),
                c.created_at.to_rfc3339(),
                c.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves the connection for one provider.
pub async fn get(
    db: &Database,
    user_id: &UserId,
    provider: ProviderKind,
) -> Result<Option<EmailConnection>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{SELECT_COLUMNS} WHERE user_id = ?1 AND provider = ?2");
        let mut stmt = conn.prepare(&sql)?;
        let result = stmt
            .query_row(params![user_id.as_str(), provider.as_str()], row_to_connection)
            .optional()?;
        Ok(result)
    })
    .await
}

/// Retrieves every connection a user holds.
pub async fn list_for_user(db: &Database, user_id: &UserId) -> Result<Vec<EmailConnection>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{SELECT_COLUMNS} WHERE user_id = ?1 ORDER BY provider");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([user_id.as_str()], row_to_connection)?;
        let connections: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(connections?)
    })
    .await
}

/// Replaces the encrypted token pair after a refresh.
///
/// A `None` refresh token keeps the stored one. Returns the number of rows
/// updated.
pub async fn update_tokens(
    db: &Database,
    user_id: &UserId,
    provider: ProviderKind,
    access_token_enc: &str,
    refresh_token_enc: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<usize> {
    let user_id = user_id.clone();
    let access = access_token_enc.to_string();
    let refresh = refresh_token_enc.map(str::to_string);

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            r#"
            UPDATE email_connections
            SET access_token_enc = ?1,
                refresh_token_enc = COALESCE(?2, refresh_token_enc),
                expires_at = ?3,
                updated_at = ?4
            WHERE user_id = ?5 AND provider = ?6
            "#,
            params![
                access,
                refresh,
                expires_at.map(|t| t.to_rfc3339()),
                now,
                user_id.as_str(),
                provider.as_str(),
            ],
        )?;
        Ok(updated)
    })
    .await
}

/// Deletes a connection. Returns whether a row was removed.
pub async fn delete(db: &Database, user_id: &UserId, provider: ProviderKind) -> Result<bool> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let deleted = conn.execute(
            "DELETE FROM email_connections WHERE user_id = ?1 AND provider = ?2",
            params![user_id.as_str(), provider.as_str()],
        )?;
        Ok(deleted > 0)
    })
    .await
}

fn row_to_connection(row: &Row<'_>) -> std::result::Result<EmailConnection, rusqlite::Error> {
    Ok(EmailConnection {
        user_id: UserId(row.get(0)?),
        provider: parse_enum(row, 1)?,
        account_email: row.get(2)?,
        access_token_enc: row.get(3)?,
        refresh_token_enc: row.get(4)?,
        expires_at: parse_opt_ts(row, 5)?,
        created_at: parse_ts(row, 6)?,
        updated_at: parse_ts(row, 7)?,
    })
}
