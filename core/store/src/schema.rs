//! Versioned schema migrations, tracked through `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::{debug, info};

/// Ordered migrations. Index `i` upgrades the schema to version `i + 1`.
const MIGRATIONS: &[&str] = &[
    // 1: credential, reference tables, pending operations
    r#"
    CREATE TABLE credentials (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        access_token TEXT NOT NULL,
        refresh_token TEXT,
        updated_at_ms INTEGER NOT NULL
    );

    CREATE TABLE categories (
        tenant_id TEXT NOT NULL,
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (tenant_id, id)
    );

    CREATE TABLE products (
        tenant_id TEXT NOT NULL,
        id TEXT NOT NULL,
        category_id TEXT,
        name TEXT NOT NULL,
        base_price INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (tenant_id, id)
    );

    CREATE TABLE sizes (
        tenant_id TEXT NOT NULL,
        id TEXT NOT NULL,
        product_id TEXT NOT NULL,
        name TEXT NOT NULL,
        price_delta INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (tenant_id, id)
    );

    CREATE TABLE price_tiers (
        tenant_id TEXT NOT NULL,
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        product_id TEXT NOT NULL,
        size_id TEXT,
        price INTEGER NOT NULL,
        PRIMARY KEY (tenant_id, id)
    );

    CREATE TABLE pending_operations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        local_id TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        sync_state TEXT NOT NULL CHECK (sync_state IN ('PENDING', 'SYNCED')),
        server_id TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        synced_at_ms INTEGER
    );

    CREATE INDEX idx_products_category ON products(tenant_id, category_id);
    CREATE INDEX idx_pending_state_seq ON pending_operations(sync_state, seq);
    "#,
    // 2: incremental sync cursors, identity cache
    r#"
    CREATE TABLE sync_cursors (
        tenant_id TEXT NOT NULL,
        target TEXT NOT NULL,
        cursor TEXT NOT NULL,
        synced_at_ms INTEGER NOT NULL,
        PRIMARY KEY (tenant_id, target)
    );

    CREATE TABLE identity_cache (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
];

/// Latest schema version this build knows about.
pub(crate) const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

/// Bring the database up to `SCHEMA_VERSION`.
///
/// Each migration runs in its own transaction together with the
/// `user_version` bump, so a crash leaves the schema at a known version.
pub(crate) fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current >= SCHEMA_VERSION {
        debug!("Schema up to date at version {}", current);
        return Ok(());
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as i64 + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!("Applied schema migration {}", version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_version(conn: &Connection) -> i64 {
        conn.query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_migrate_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(user_version(&conn), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('credentials', 'categories', 'products', 'sizes', 'price_tiers', \
                  'pending_operations', 'sync_cursors', 'identity_cache')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 8);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(user_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_from_version_one() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0]).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        migrate(&mut conn).unwrap();
        assert_eq!(user_version(&conn), SCHEMA_VERSION);

        let cursors: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_cursors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(cursors, 0);
    }
}
