//! Product persistence: upsert with lifecycle timestamps plus full replacement
//! of the ingredient child rows, one transaction per item.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use mfds_core::{normalize_ingredients, DrugDetail, ReconcileOutcome, StoredProduct};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Durable home for reconciled products. `reconcile` is the only writer.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Upsert `detail` observed at `observed_at` and replace its ingredient set.
    ///
    /// `first_seen_at` is written only on insert. `last_seen_at` always moves
    /// to `observed_at`. `last_updated_at` moves only when the content hash
    /// differs from the stored one.
    async fn reconcile(
        &self,
        detail: &DrugDetail,
        observed_at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError>;

    async fn get_product(&self, item_seq: &str) -> Result<Option<StoredProduct>, StoreError>;

    /// Stored ingredient names for `item_seq`, sorted.
    async fn ingredients_for(&self, item_seq: &str) -> Result<Vec<String>, StoreError>;
}

const UPSERT_PRODUCT_SQL: &str = r#"
INSERT INTO products (
    item_seq, product_name, company_name, cmo_names, rx_otc, review_type,
    approval_date, efficacy_text, source_url, content_hash,
    first_seen_at, last_seen_at, last_updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11, $11)
ON CONFLICT (item_seq) DO UPDATE SET
    product_name = EXCLUDED.product_name,
    company_name = EXCLUDED.company_name,
    cmo_names = EXCLUDED.cmo_names,
    rx_otc = EXCLUDED.rx_otc,
    review_type = EXCLUDED.review_type,
    approval_date = EXCLUDED.approval_date,
    efficacy_text = EXCLUDED.efficacy_text,
    source_url = EXCLUDED.source_url,
    content_hash = EXCLUDED.content_hash,
    last_seen_at = EXCLUDED.last_seen_at,
    last_updated_at = CASE
        WHEN products.content_hash IS DISTINCT FROM EXCLUDED.content_hash
            THEN GREATEST(EXCLUDED.last_updated_at, products.first_seen_at)
        ELSE products.last_updated_at
    END
"#;

#[derive(Debug, Clone)]
pub struct PgProductStore {
    pool: PgPool,
}

impl PgProductStore {
    /// Opens a single-connection pool; the run reuses it for every item.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn reconcile(
        &self,
        detail: &DrugDetail,
        observed_at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        // TIMESTAMPTZ keeps microseconds.
        let observed_at = observed_at.trunc_subsecs(6);
        let content_hash = detail.content_hash();
        let ingredients = normalize_ingredients(detail.ingredients.iter().cloned());

        let mut tx = self.pool.begin().await?;

        // Row lock holds until commit, so the outcome matches what the upsert saw.
        let prior_hash: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM products WHERE item_seq = $1 FOR UPDATE")
                .bind(&detail.item_seq)
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query(UPSERT_PRODUCT_SQL)
            .bind(&detail.item_seq)
            .bind(&detail.product_name)
            .bind(&detail.company_name)
            .bind(&detail.cmo_names)
            .bind(&detail.rx_otc)
            .bind(&detail.review_type)
            .bind(detail.approval_date_parsed())
            .bind(&detail.efficacy_text)
            .bind(&detail.source_url)
            .bind(&content_hash)
            .bind(observed_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM ingredients WHERE item_seq = $1")
            .bind(&detail.item_seq)
            .execute(&mut *tx)
            .await?;
        if !ingredients.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO ingredients (item_seq, ingredient_name)
                SELECT $1, name FROM UNNEST($2::text[]) AS name
                "#,
            )
            .bind(&detail.item_seq)
            .bind(&ingredients[..])
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let outcome = outcome_for(prior_hash.as_deref(), &content_hash);
        debug!(item_seq = %detail.item_seq, ?outcome, ingredients = ingredients.len(), "reconciled");
        Ok(outcome)
    }

    async fn get_product(&self, item_seq: &str) -> Result<Option<StoredProduct>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT item_seq, product_name, company_name, cmo_names, rx_otc, review_type,
                   approval_date, efficacy_text, source_url, content_hash,
                   first_seen_at, last_seen_at, last_updated_at
              FROM products
             WHERE item_seq = $1
            "#,
        )
        .bind(item_seq)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(product_from_row).transpose()?)
    }

    async fn ingredients_for(&self, item_seq: &str) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT ingredient_name
              FROM ingredients
             WHERE item_seq = $1
             ORDER BY ingredient_name
            "#,
        )
        .bind(item_seq)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

fn product_from_row(row: &PgRow) -> Result<StoredProduct, sqlx::Error> {
    Ok(StoredProduct {
        item_seq: row.try_get("item_seq")?,
        product_name: row.try_get("product_name")?,
        company_name: row.try_get("company_name")?,
        cmo_names: row.try_get("cmo_names")?,
        rx_otc: row.try_get("rx_otc")?,
        review_type: row.try_get("review_type")?,
        approval_date: row.try_get("approval_date")?,
        efficacy_text: row.try_get("efficacy_text")?,
        source_url: row.try_get("source_url")?,
        content_hash: row.try_get("content_hash")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        last_updated_at: row.try_get("last_updated_at")?,
    })
}

fn outcome_for(prior_hash: Option<&str>, new_hash: &str) -> ReconcileOutcome {
    match prior_hash {
        None => ReconcileOutcome::Inserted,
        Some(prior) if prior != new_hash => ReconcileOutcome::Updated,
        Some(_) => ReconcileOutcome::Unchanged,
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    product: StoredProduct,
    ingredients: Vec<String>,
}

/// Process-local store with the same lifecycle rules as [`PgProductStore`].
#[derive(Debug, Default)]
pub struct MemoryProductStore {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl MemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl ProductStore for MemoryProductStore {
    async fn reconcile(
        &self,
        detail: &DrugDetail,
        observed_at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        let content_hash = detail.content_hash();
        let ingredients = normalize_ingredients(detail.ingredients.iter().cloned());
        let mut entries = self.entries.lock().await;

        let prior = entries.get(&detail.item_seq).map(|e| e.product.clone());
        let outcome = outcome_for(prior.as_ref().map(|p| p.content_hash.as_str()), &content_hash);

        let first_seen_at = prior.as_ref().map_or(observed_at, |p| p.first_seen_at);
        let last_updated_at = match (&prior, outcome) {
            (Some(p), ReconcileOutcome::Unchanged) => p.last_updated_at,
            _ => observed_at.max(first_seen_at),
        };

        let product = StoredProduct {
            item_seq: detail.item_seq.clone(),
            product_name: detail.product_name.clone(),
            company_name: detail.company_name.clone(),
            cmo_names: detail.cmo_names.clone(),
            rx_otc: detail.rx_otc.clone(),
            review_type: detail.review_type.clone(),
            approval_date: detail.approval_date_parsed(),
            efficacy_text: detail.efficacy_text.clone(),
            source_url: detail.source_url.clone(),
            content_hash,
            first_seen_at,
            last_seen_at: observed_at,
            last_updated_at,
        };
        entries.insert(
            detail.item_seq.clone(),
            MemoryEntry {
                product,
                ingredients,
            },
        );
        Ok(outcome)
    }

    async fn get_product(&self, item_seq: &str) -> Result<Option<StoredProduct>, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(item_seq)
            .map(|e| e.product.clone()))
    }

    async fn ingredients_for(&self, item_seq: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(item_seq)
            .map(|e| e.ingredients.clone())
            .unwrap_or_default())
    }
}
