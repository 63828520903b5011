//! Cached reference data: categories, products, sizes and price tiers.
//!
//! Reference rows are owned by the remote and only written here through
//! [`LocalStore::replace_reference`] and [`LocalStore::upsert_reference`],
//! each of which runs as a single transaction.

use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use tillsync_common::{Result, TenantId};

use crate::db::{to_millis, LocalStore};

/// A menu category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// A sellable product. Prices are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    #[serde(default)]
    pub category_id: Option<String>,
    pub name: String,
    pub base_price: i64,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// A size variant of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Size {
    pub id: String,
    pub product_id: String,
    pub name: String,
    #[serde(default)]
    pub price_delta: i64,
}

/// A named price for a product, optionally for one size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTier {
    pub id: String,
    pub name: String,
    pub product_id: String,
    #[serde(default)]
    pub size_id: Option<String>,
    pub price: i64,
}

fn default_active() -> bool {
    true
}

/// One reference table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceTable {
    Categories,
    Products,
    Sizes,
    PriceTiers,
}

impl ReferenceTable {
    /// SQLite table name.
    pub fn table_name(&self) -> &'static str {
        match self {
            ReferenceTable::Categories => "categories",
            ReferenceTable::Products => "products",
            ReferenceTable::Sizes => "sizes",
            ReferenceTable::PriceTiers => "price_tiers",
        }
    }
}

impl fmt::Display for ReferenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Which group of reference tables a sync covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTarget {
    /// Categories, products and sizes.
    Catalog,
    /// Price tiers.
    Pricing,
    /// Every reference table.
    All,
}

impl SyncTarget {
    /// Tables affected by a sync of this target.
    pub fn tables(&self) -> &'static [ReferenceTable] {
        match self {
            SyncTarget::Catalog => &[
                ReferenceTable::Categories,
                ReferenceTable::Products,
                ReferenceTable::Sizes,
            ],
            SyncTarget::Pricing => &[ReferenceTable::PriceTiers],
            SyncTarget::All => &[
                ReferenceTable::Categories,
                ReferenceTable::Products,
                ReferenceTable::Sizes,
                ReferenceTable::PriceTiers,
            ],
        }
    }

    /// Wire and cursor-key name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTarget::Catalog => "catalog",
            SyncTarget::Pricing => "pricing",
            SyncTarget::All => "all",
        }
    }

    /// Parse a wire name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "catalog" => Some(SyncTarget::Catalog),
            "pricing" => Some(SyncTarget::Pricing),
            "all" => Some(SyncTarget::All),
            _ => None,
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference data as returned by the remote sync endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSnapshot {
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub sizes: Vec<Size>,
    #[serde(default)]
    pub price_tiers: Vec<PriceTier>,
    /// Opaque server position to resume incremental sync from.
    #[serde(default, alias = "serverTime")]
    pub cursor: Option<String>,
}

impl ReferenceSnapshot {
    /// Number of rows the snapshot carries for `table`.
    pub fn len_of(&self, table: ReferenceTable) -> usize {
        match table {
            ReferenceTable::Categories => self.categories.len(),
            ReferenceTable::Products => self.products.len(),
            ReferenceTable::Sizes => self.sizes.len(),
            ReferenceTable::PriceTiers => self.price_tiers.len(),
        }
    }

    /// Whether the snapshot carries no rows for any table of `target`.
    pub fn is_empty_for(&self, target: SyncTarget) -> bool {
        target.tables().iter().all(|t| self.len_of(*t) == 0)
    }
}

/// Row counts per reference table for one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCounts {
    pub categories: u64,
    pub products: u64,
    pub sizes: u64,
    pub price_tiers: u64,
}

impl ReferenceCounts {
    /// Total rows across all tables.
    pub fn total(&self) -> u64 {
        self.categories + self.products + self.sizes + self.price_tiers
    }
}

/// Outcome of applying a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Rows written per table.
    pub written: Vec<(ReferenceTable, usize)>,
    /// Tables left untouched: every table for an empty snapshot, or tables
    /// without rows in an upsert.
    pub skipped: Vec<ReferenceTable>,
}

impl ApplyStats {
    /// Total rows written.
    pub fn rows_written(&self) -> usize {
        self.written.iter().map(|(_, n)| n).sum()
    }
}

#[derive(Clone, Copy)]
enum WriteMode {
    Replace,
    Upsert,
}

impl LocalStore {
    /// Replace the tenant's rows of every table in `target` with the
    /// snapshot, in one transaction.
    ///
    /// Every table of the target is cleared and refilled, including tables
    /// the snapshot has no rows for. A snapshot with no rows at all is not
    /// applied, so a transiently empty payload can never wipe the cache.
    pub async fn replace_reference(
        &self,
        tenant: &TenantId,
        target: SyncTarget,
        snapshot: ReferenceSnapshot,
    ) -> Result<ApplyStats> {
        self.apply_reference(tenant, target, snapshot, WriteMode::Replace)
            .await
    }

    /// Insert or update the snapshot's rows by primary key. Never deletes.
    pub async fn upsert_reference(
        &self,
        tenant: &TenantId,
        target: SyncTarget,
        snapshot: ReferenceSnapshot,
    ) -> Result<ApplyStats> {
        self.apply_reference(tenant, target, snapshot, WriteMode::Upsert)
            .await
    }

    async fn apply_reference(
        &self,
        tenant: &TenantId,
        target: SyncTarget,
        snapshot: ReferenceSnapshot,
        mode: WriteMode,
    ) -> Result<ApplyStats> {
        let tenant = tenant.as_str().to_string();

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut stats = ApplyStats::default();

            if snapshot.is_empty_for(target) {
                debug!("Snapshot for {} has no rows; leaving tables untouched", target);
                stats.skipped = target.tables().to_vec();
                return Ok(stats);
            }

            for table in target.tables() {
                let rows = snapshot.len_of(*table);
                match mode {
                    WriteMode::Replace => {
                        tx.execute(
                            &format!("DELETE FROM {} WHERE tenant_id = ?1", table.table_name()),
                            params![tenant],
                        )?;
                    }
                    WriteMode::Upsert if rows == 0 => {
                        stats.skipped.push(*table);
                        continue;
                    }
                    WriteMode::Upsert => {}
                }

                write_rows(&tx, &tenant, *table, &snapshot)?;
                stats.written.push((*table, rows));
            }

            if let Some(cursor) = &snapshot.cursor {
                tx.execute(
                    r#"
                    INSERT OR REPLACE INTO sync_cursors (tenant_id, target, cursor, synced_at_ms)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    params![tenant, target.as_str(), cursor, to_millis(chrono::Utc::now())],
                )?;
            }

            tx.commit()?;
            Ok(stats)
        })
        .await
    }

    /// Cursor stored by the last successful sync of `target`.
    pub async fn sync_cursor(&self, tenant: &TenantId, target: SyncTarget) -> Result<Option<String>> {
        let tenant = tenant.as_str().to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT cursor FROM sync_cursors WHERE tenant_id = ?1 AND target = ?2",
                params![tenant, target.as_str()],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    /// Row counts of every reference table for `tenant`.
    pub async fn reference_counts(&self, tenant: &TenantId) -> Result<ReferenceCounts> {
        let tenant = tenant.as_str().to_string();
        self.call(move |conn| {
            let count = |table: ReferenceTable| -> rusqlite::Result<u64> {
                let n: i64 = conn.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {} WHERE tenant_id = ?1",
                        table.table_name()
                    ),
                    params![tenant],
                    |row| row.get(0),
                )?;
                Ok(n as u64)
            };

            Ok(ReferenceCounts {
                categories: count(ReferenceTable::Categories)?,
                products: count(ReferenceTable::Products)?,
                sizes: count(ReferenceTable::Sizes)?,
                price_tiers: count(ReferenceTable::PriceTiers)?,
            })
        })
        .await
    }

    /// Categories of `tenant` in display order.
    pub async fn categories(&self, tenant: &TenantId) -> Result<Vec<Category>> {
        let tenant = tenant.as_str().to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, name, position, active FROM categories
                WHERE tenant_id = ?1 ORDER BY position, name
                "#,
            )?;
            let rows = stmt.query_map(params![tenant], |row| {
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    position: row.get(2)?,
                    active: row.get(3)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// Products of `tenant`, optionally restricted to one category.
    pub async fn products(
        &self,
        tenant: &TenantId,
        category_id: Option<&str>,
    ) -> Result<Vec<Product>> {
        let tenant = tenant.as_str().to_string();
        let category_id = category_id.map(String::from);
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, category_id, name, base_price, active FROM products
                WHERE tenant_id = ?1 AND (?2 IS NULL OR category_id = ?2)
                ORDER BY name
                "#,
            )?;
            let rows = stmt.query_map(params![tenant, category_id], |row| {
                Ok(Product {
                    id: row.get(0)?,
                    category_id: row.get(1)?,
                    name: row.get(2)?,
                    base_price: row.get(3)?,
                    active: row.get(4)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// Sizes of one product.
    pub async fn sizes(&self, tenant: &TenantId, product_id: &str) -> Result<Vec<Size>> {
        let tenant = tenant.as_str().to_string();
        let product_id = product_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, product_id, name, price_delta FROM sizes
                WHERE tenant_id = ?1 AND product_id = ?2 ORDER BY price_delta, name
                "#,
            )?;
            let rows = stmt.query_map(params![tenant, product_id], |row| {
                Ok(Size {
                    id: row.get(0)?,
                    product_id: row.get(1)?,
                    name: row.get(2)?,
                    price_delta: row.get(3)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// Price tiers of one product.
    pub async fn price_tiers(&self, tenant: &TenantId, product_id: &str) -> Result<Vec<PriceTier>> {
        let tenant = tenant.as_str().to_string();
        let product_id = product_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, name, product_id, size_id, price FROM price_tiers
                WHERE tenant_id = ?1 AND product_id = ?2 ORDER BY name
                "#,
            )?;
            let rows = stmt.query_map(params![tenant, product_id], |row| {
                Ok(PriceTier {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    product_id: row.get(2)?,
                    size_id: row.get(3)?,
                    price: row.get(4)?,
                })
            })?;
            rows.collect()
        })
        .await
    }
}

fn write_rows(
    tx: &Transaction<'_>,
    tenant: &str,
    table: ReferenceTable,
    snapshot: &ReferenceSnapshot,
) -> rusqlite::Result<()> {
    match table {
        ReferenceTable::Categories => {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO categories (tenant_id, id, name, position, active)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (tenant_id, id) DO UPDATE SET
                    name = excluded.name,
                    position = excluded.position,
                    active = excluded.active
                "#,
            )?;
            for c in &snapshot.categories {
                stmt.execute(params![tenant, c.id, c.name, c.position, c.active])?;
            }
        }
        ReferenceTable::Products => {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO products (tenant_id, id, category_id, name, base_price, active)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (tenant_id, id) DO UPDATE SET
                    category_id = excluded.category_id,
                    name = excluded.name,
                    base_price = excluded.base_price,
                    active = excluded.active
                "#,
            )?;
            for p in &snapshot.products {
                stmt.execute(params![tenant, p.id, p.category_id, p.name, p.base_price, p.active])?;
            }
        }
        ReferenceTable::Sizes => {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO sizes (tenant_id, id, product_id, name, price_delta)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (tenant_id, id) DO UPDATE SET
                    product_id = excluded.product_id,
                    name = excluded.name,
                    price_delta = excluded.price_delta
                "#,
            )?;
            for s in &snapshot.sizes {
                stmt.execute(params![tenant, s.id, s.product_id, s.name, s.price_delta])?;
            }
        }
        ReferenceTable::PriceTiers => {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO price_tiers (tenant_id, id, name, product_id, size_id, price)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (tenant_id, id) DO UPDATE SET
                    name = excluded.name,
                    product_id = excluded.product_id,
                    size_id = excluded.size_id,
                    price = excluded.price
                "#,
            )?;
            for t in &snapshot.price_tiers {
                stmt.execute(params![tenant, t.id, t.name, t.product_id, t.size_id, t.price])?;
            }
        }
    }

    Ok(())
}
