//! SQL schema definitions as const strings.
//!
//! Contains the complete SQLite schema for mailsweep. Timestamps are stored
//! as RFC 3339 text.

/// SQL to create the connections table.
///
/// One row per (user, provider).
pub const CREATE_CONNECTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS email_connections (
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    account_email TEXT NOT NULL,
    access_token_enc TEXT NOT NULL,
    refresh_token_enc TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, provider)
)
"#;

/// SQL to create the recurring tasks table.
pub const CREATE_RECURRING_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS recurring_tasks (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    task_type TEXT NOT NULL,
    task_config TEXT NOT NULL,
    frequency TEXT NOT NULL,
    time_of_day TEXT NOT NULL,
    day_of_week INTEGER,
    day_of_month INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_executed TEXT,
    next_run TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create recurring task indexes.
pub const CREATE_RECURRING_TASK_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_recurring_tasks_user ON recurring_tasks(user_id);
CREATE INDEX IF NOT EXISTS idx_recurring_tasks_due ON recurring_tasks(enabled, next_run)
"#;

/// SQL to create the execution log table.
pub const CREATE_TASK_EXECUTION_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS task_execution_logs (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES recurring_tasks(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed')),
    result TEXT,
    error TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
)
"#;

/// SQL to create execution log indexes.
pub const CREATE_TASK_EXECUTION_LOG_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_execution_logs(task_id, started_at DESC)
"#;

/// SQL to create the scheduled emails table.
pub const CREATE_SCHEDULED_EMAILS: &str = r#"
CREATE TABLE IF NOT EXISTS scheduled_emails (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    recipients TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    thread_id TEXT,
    scheduled_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'scheduled',
    error TEXT,
    provider_message_id TEXT,
    sent_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create scheduled email indexes.
pub const CREATE_SCHEDULED_EMAIL_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_scheduled_emails_user ON scheduled_emails(user_id);
CREATE INDEX IF NOT EXISTS idx_scheduled_emails_due ON scheduled_emails(status, scheduled_at)
"#;

/// Returns all migration statements in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_CONNECTIONS,
        CREATE_RECURRING_TASKS,
        CREATE_RECURRING_TASK_INDEXES,
        CREATE_TASK_EXECUTION_LOGS,
        CREATE_TASK_EXECUTION_LOG_INDEXES,
        CREATE_SCHEDULED_EMAILS,
        CREATE_SCHEDULED_EMAIL_INDEXES,
    ]
}
