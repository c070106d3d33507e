//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- One row per execution attempt (filled, partial, resting, failed, dry-run)
CREATE TABLE IF NOT EXISTS dca_purchases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    purchase_date TEXT NOT NULL,
    executed_at INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    price TEXT NOT NULL DEFAULT '0',
    cost TEXT NOT NULL DEFAULT '0',
    quantity TEXT NOT NULL DEFAULT '0',
    multiplier TEXT NOT NULL DEFAULT '1',
    tier TEXT NOT NULL DEFAULT 'Base',
    drop_percentage TEXT NOT NULL DEFAULT '0',
    high_30_day TEXT NOT NULL DEFAULT '0',
    ma_200_day TEXT NOT NULL DEFAULT '0',
    is_bear_market INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    is_dry_run INTEGER NOT NULL DEFAULT 0,
    order_id TEXT,
    failure_reason TEXT,
    raw_response TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Domain events waiting for dispatch (transactional outbox)
CREATE TABLE IF NOT EXISTS dca_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    dispatched_at INTEGER
);

-- Durable execution facts (e.g. last_successful_execution_date)
CREATE TABLE IF NOT EXISTS dca_execution_state (
    state_key TEXT PRIMARY KEY,
    state_value TEXT NOT NULL,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Expiring mutual-exclusion leases shared by every process using this database
CREATE TABLE IF NOT EXISTS dca_locks (
    lock_key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_purchases_date ON dca_purchases(purchase_date);
CREATE INDEX IF NOT EXISTS idx_purchases_status ON dca_purchases(status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_purchases_one_fill_per_day
    ON dca_purchases(purchase_date)
    WHERE status IN ('filled', 'partially_filled') AND is_dry_run = 0;
CREATE INDEX IF NOT EXISTS idx_outbox_pending ON dca_outbox(dispatched_at)
"#;
