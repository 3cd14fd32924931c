//! Scheduled email operations.
//!
//! Every status transition is a conditional update on the current status,
//! so a row can only move forward through its lifecycle.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{Address, ScheduledEmail, ScheduledEmailId, ScheduledStatus, ThreadId, UserId};
use crate::storage::database::{Database, Result};

use super::{parse_enum, parse_opt_ts, parse_ts};

const SELECT_COLUMNS: &str = r#"
    SELECT
        id, user_id, recipients, subject, body, thread_id, scheduled_at, status,
        error, provider_message_id, sent_at, created_at, updated_at
    FROM scheduled_emails
"#;

/// Inserts a new scheduled email.
pub async fn insert(db: &Database, email: &ScheduledEmail) -> Result<()> {
    let email = email.clone();
    let recipients = serde_json::to_string(&email.to)?;

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO scheduled_emails (
                id, user_id, recipients, subject, body, thread_id, scheduled_at, status,
                error, provider_message_id, sent_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                email.id.as_str(),
                email.user_id.as_str(),
                recipients,
                email.subject,
                email.body,
                email.thread_id.as_ref().map(|t| t.as_str()),
                email.scheduled_at.to_rfc3339(),
                email.status.as_str(),
                email.error,
                email.provider_message_id,
                email.sent_at.map(|t| t.to_rfc3339()),
                email.created_at.to_rfc3339(),
                email.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a scheduled email by its ID.
pub async fn get(db: &Database, id: &ScheduledEmailId) -> Result<Option<ScheduledEmail>> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let result = stmt.query_row([id.as_str()], row_to_scheduled).optional()?;
        Ok(result)
    })
    .await
}

/// Retrieves a user's scheduled emails ordered by send time.
pub async fn list_for_user(db: &Database, user_id: &UserId) -> Result<Vec<ScheduledEmail>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{SELECT_COLUMNS} WHERE user_id = ?1 ORDER BY scheduled_at");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([user_id.as_str()], row_to_scheduled)?;
        let emails: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(emails?)
    })
    .await
}

/// Retrieves `scheduled` emails whose send time has passed.
pub async fn due(db: &Database, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledEmail>> {
    db.with_conn(move |conn| {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = 'scheduled' \
             AND julianday(scheduled_at) <= julianday(?1) LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now.to_rfc3339(), limit as i64], row_to_scheduled)?;
        let emails: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(emails?)
    })
    .await
}

fn transition(
    conn: &rusqlite::Connection,
    id: &ScheduledEmailId,
    from: ScheduledStatus,
    to: ScheduledStatus,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE scheduled_emails SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![to.as_str(), Utc::now().to_rfc3339(), id.as_str(), from.as_str()],
    )?;
    Ok(updated > 0)
}

/// Claims a due email: `scheduled → sending`.
///
/// Returns `false` if the row was no longer `scheduled`.
pub async fn claim(db: &Database, id: &ScheduledEmailId) -> Result<bool> {
    let id = id.clone();
    db.with_conn(move |conn| {
        Ok(transition(
            conn,
            &id,
            ScheduledStatus::Scheduled,
            ScheduledStatus::Sending,
        )?)
    })
    .await
}

/// Cancels a user's email: `scheduled → canceled`.
pub async fn cancel(db: &Database, id: &ScheduledEmailId, user_id: &UserId) -> Result<bool> {
    let id = id.clone();
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let updated = conn.execute(
            r#"
            UPDATE scheduled_emails SET status = 'canceled', updated_at = ?1
            WHERE id = ?2 AND user_id = ?3 AND status = 'scheduled'
            "#,
            params![Utc::now().to_rfc3339(), id.as_str(), user_id.as_str()],
        )?;
        Ok(updated > 0)
    })
    .await
}

/// Marks a claimed email as sent: `sending → sent`.
pub async fn mark_sent(
    db: &Database,
    id: &ScheduledEmailId,
    provider_message_id: &str,
    sent_at: DateTime<Utc>,
) -> Result<bool> {
    let id = id.clone();
    let provider_message_id = provider_message_id.to_string();

    db.with_conn(move |conn| {
        let updated = conn.execute(
            r#"
            UPDATE scheduled_emails
            SET status = 'sent', provider_message_id = ?1, sent_at = ?2,
                error = NULL, updated_at = ?3
            WHERE id = ?4 AND status = 'sending'
            "#,
            params![
                provider_message_id,
                sent_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
                id.as_str(),
            ],
        )?;
        Ok(updated > 0)
    })
    .await
}

/// Marks a claimed email as failed: `sending → failed`.
pub async fn mark_failed(db: &Database, id: &ScheduledEmailId, error: &str) -> Result<bool> {
    let id = id.clone();
    let error = error.to_string();

    db.with_conn(move |conn| {
        let updated = conn.execute(
            r#"
            UPDATE scheduled_emails SET status = 'failed', error = ?1, updated_at = ?2
            WHERE id = ?3 AND status = 'sending'
            "#,
            params![error, Utc::now().to_rfc3339(), id.as_str()],
        )?;
        Ok(updated > 0)
    })
    .await
}

fn row_to_scheduled(row: &Row<'_>) -> std::result::Result<ScheduledEmail, rusqlite::Error> {
    let recipients_json: String = row.get(2)?;
    let to: Vec<Address> = serde_json::from_str(&recipients_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let thread_id: Option<String> = row.get(5)?;
    let status: ScheduledStatus = parse_enum(row, 7)?;

    Ok(ScheduledEmail {
        id: ScheduledEmailId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        to,
        subject: row.get(3)?,
        body: row.get(4)?,
        thread_id: thread_id.map(ThreadId),
        scheduled_at: parse_ts(row, 6)?,
        status,
        error: row.get(8)?,
        provider_message_id: row.get(9)?,
        sent_at: parse_opt_ts(row, 10)?,
        created_at: parse_ts(row, 11)?,
        updated_at: parse_ts(row, 12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_email(id: &str, scheduled_at: DateTime<Utc>) -> ScheduledEmail {
        let now = Utc::now();
        ScheduledEmail {
            id: ScheduledEmailId::from(id),
            user_id: UserId::from("user-1"),
            to: vec![Address::with_name("friend@example.com", "Friend")],
            subject: "Reminder".to_string(),
            body: "Don't forget".to_string(),
            thread_id: None,
            scheduled_at,
            status: ScheduledStatus::Scheduled,
            error: None,
            provider_message_id: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let db = Database::open_in_memory().await.unwrap();
        let email = make_email("sched-1", Utc::now());
        insert(&db, &email).await.unwrap();

        let loaded = get(&db, &email.id).await.unwrap().unwrap();
        assert_eq!(loaded.to, email.to);
        assert_eq!(loaded.status, ScheduledStatus::Scheduled);
    }

    #[tokio::test]
    async fn recipients_are_stored_as_json_array() {
        let db = Database::open_in_memory().await.unwrap();
        insert(&db, &make_email("sched-json", Utc::now())).await.unwrap();

        let raw: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT recipients FROM scheduled_emails WHERE id = 'sched-json'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        let stored: Vec<Address> = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, vec![Address::with_name("friend@example.com", "Friend")]);
    }

    #[test]
    fn encode_failures_are_database_errors() {
        let err = serde_json::from_str::<Vec<Address>>("not json").unwrap_err();
        let err = crate::storage::StoreError::from(crate::storage::DatabaseError::from(err));
        assert!(err.to_string().contains("could not encode column"));
    }

    #[tokio::test]
    async fn due_only_returns_scheduled_past_rows() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        insert(&db, &make_email("past", now - Duration::minutes(1))).await.unwrap();
        insert(&db, &make_email("future", now + Duration::hours(1))).await.unwrap();
        let mut sent = make_email("sent", now - Duration::hours(1));
        sent.status = ScheduledStatus::Sent;
        insert(&db, &sent).await.unwrap();

        let due_rows = due(&db, now, 10).await.unwrap();
        assert_eq!(due_rows.len(), 1);
        assert_eq!(due_rows[0].id, ScheduledEmailId::from("past"));
    }

    #[tokio::test]
    async fn claim_has_single_winner() {
        let db = Database::open_in_memory().await.unwrap();
        let email = make_email("sched-1", Utc::now());
        insert(&db, &email).await.unwrap();

        assert!(claim(&db, &email.id).await.unwrap());
        assert!(!claim(&db, &email.id).await.unwrap());
        assert!(due(&db, Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sent_and_failed_require_sending() {
        let db = Database::open_in_memory().await.unwrap();
        let email = make_email("sched-1", Utc::now());
        insert(&db, &email).await.unwrap();

        // Not claimed yet.
        assert!(!mark_sent(&db, &email.id, "msg-1", Utc::now()).await.unwrap());

        assert!(claim(&db, &email.id).await.unwrap());
        assert!(mark_failed(&db, &email.id, "quota exceeded").await.unwrap());
        assert!(!mark_sent(&db, &email.id, "msg-1", Utc::now()).await.unwrap());

        let loaded = get(&db, &email.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ScheduledStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn cancel_only_while_scheduled_and_owned() {
        let db = Database::open_in_memory().await.unwrap();
        let email = make_email("sched-1", Utc::now() + Duration::hours(1));
        insert(&db, &email).await.unwrap();

        assert!(!cancel(&db, &email.id, &UserId::from("someone-else")).await.unwrap());
        assert!(cancel(&db, &email.id, &email.user_id).await.unwrap());
        assert!(!cancel(&db, &email.id, &email.user_id).await.unwrap());
        assert!(!claim(&db, &email.id).await.unwrap());

        let loaded = get(&db, &email.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ScheduledStatus::Canceled);
    }

    #[tokio::test]
    async fn list_for_user_orders_by_send_time() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        insert(&db, &make_email("later", now + Duration::hours(2))).await.unwrap();
        insert(&db, &make_email("sooner", now + Duration::hours(1))).await.unwrap();

        let emails = list_for_user(&db, &UserId::from("user-1")).await.unwrap();
        let ids: Vec<&str> = emails.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["sooner", "later"]);
    }
}
