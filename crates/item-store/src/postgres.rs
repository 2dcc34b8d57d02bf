use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, HolderId, ItemId, Money, OrderId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CheckoutSessionRecord, Disposition, InsertOutcome, ItemQuery, ItemRecord, NewItem, OrderLine,
    OrderRecord, Result, StoreError,
    store::{CheckoutSessionStore, ItemStore, OrderStore, guard_missed},
};

const ITEM_COLUMNS: &str = "id, title, price_cents, disposition, holder, reserved_at, reserved_until, sold_at, sold_to, sold_session_id, created_at";

const ORDER_COLUMNS: &str = "order_id, checkout_session_id, user_id, buyer, customer_email, lines, subtotal_cents, amount_paid_cents, payment_reference, fulfilled_item_ids, unfulfilled_item_ids, needs_reconciliation, created_at";

/// PostgreSQL-backed store implementation.
///
/// Every transition is one `UPDATE … WHERE <guard>` statement. Under READ
/// COMMITTED a concurrent writer blocks on the row lock and re-evaluates the
/// guard against the committed row, so two racing reservations cannot both
/// match.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_item(row: PgRow) -> Result<ItemRecord> {
        let label: String = row.try_get("disposition")?;
        let disposition = Disposition::parse(&label).ok_or_else(|| StoreError::CorruptRecord {
            table: "items",
            reason: format!("unknown disposition '{label}'"),
        })?;

        Ok(ItemRecord {
            id: ItemId::new(row.try_get::<String, _>("id")?),
            title: row.try_get("title")?,
            price: Money::from_cents(row.try_get("price_cents")?),
            disposition,
            holder: row.try_get::<Option<String>, _>("holder")?.map(HolderId::new),
            reserved_at: row.try_get("reserved_at")?,
            reserved_until: row.try_get("reserved_until")?,
            sold_at: row.try_get("sold_at")?,
            sold_to: row.try_get("sold_to")?,
            sold_session_id: row
                .try_get::<Option<String>, _>("sold_session_id")?
                .map(CheckoutSessionId::new),
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_order(row: PgRow) -> Result<OrderRecord> {
        let lines_json: serde_json::Value = row.try_get("lines")?;
        let lines: Vec<OrderLine> = serde_json::from_value(lines_json)?;
        let to_ids = |ids: Vec<String>| ids.into_iter().map(ItemId::new).collect::<Vec<_>>();

        Ok(OrderRecord {
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            checkout_session_id: CheckoutSessionId::new(
                row.try_get::<String, _>("checkout_session_id")?,
            ),
            user_id: HolderId::new(row.try_get::<String, _>("user_id")?),
            buyer: row.try_get("buyer")?,
            customer_email: row.try_get("customer_email")?,
            lines,
            subtotal: Money::from_cents(row.try_get("subtotal_cents")?),
            amount_paid: row
                .try_get::<Option<i64>, _>("amount_paid_cents")?
                .map(Money::from_cents),
            payment_reference: row.try_get("payment_reference")?,
            fulfilled_item_ids: to_ids(row.try_get("fulfilled_item_ids")?),
            unfulfilled_item_ids: to_ids(row.try_get("unfulfilled_item_ids")?),
            needs_reconciliation: row.try_get("needs_reconciliation")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn id_strings(ids: &[ItemId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

#[async_trait]
impl ItemStore for PostgresStore {
    async fn upsert_item(&self, item: NewItem, now: DateTime<Utc>) -> Result<ItemRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO items (id, title, price_cents, disposition, created_at)
            VALUES ($1, $2, $3, 'available', $4)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                price_cents = EXCLUDED.price_cents
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(item.id.as_str())
        .bind(&item.title)
        .bind(item.price.cents())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_item(row)
    }

    async fn get_item(&self, id: &ItemId) -> Result<Option<ItemRecord>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_item).transpose()
    }

    async fn query_items(&self, query: ItemQuery) -> Result<Vec<ItemRecord>> {
        let mut sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.ids.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND id = ANY(${param_count})"));
        }
        if query.dispositions.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND disposition = ANY(${param_count})"));
        }
        if query.holder.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND holder = ${param_count}"));
        }
        if query.free_at.is_some() {
            param_count += 1;
            sql.push_str(&format!(
                " AND (disposition = 'available' OR (disposition = 'reserved' AND reserved_until < ${param_count}))"
            ));
        }

        sql.push_str(" ORDER BY created_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(ref ids) = query.ids {
            sqlx_query = sqlx_query.bind(id_strings(ids));
        }
        if let Some(ref dispositions) = query.dispositions {
            let labels: Vec<String> = dispositions.iter().map(|d| d.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(labels);
        }
        if let Some(ref holder) = query.holder {
            sqlx_query = sqlx_query.bind(holder.as_str().to_string());
        }
        if let Some(now) = query.free_at {
            sqlx_query = sqlx_query.bind(now);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_item).collect()
    }

    async fn reserve_item(
        &self,
        id: &ItemId,
        holder: &HolderId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<ItemRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE items SET
                disposition = 'reserved',
                holder = $2,
                reserved_at = $3,
                reserved_until = $4
            WHERE id = $1
              AND (
                    disposition = 'available'
                 OR (disposition = 'reserved' AND (holder = $2 OR reserved_until < $3))
              )
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(holder.as_str())
        .bind(now)
        .bind(until)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            guard_missed("reserve", id);
        }
        row.map(Self::row_to_item).transpose()
    }

    async fn release_item(&self, id: &ItemId, holder: &HolderId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE items SET
                disposition = 'available',
                holder = NULL,
                reserved_at = NULL,
                reserved_until = NULL
            WHERE id = $1 AND disposition = 'reserved' AND holder = $2
            "#,
        )
        .bind(id.as_str())
        .bind(holder.as_str())
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected() == 1;
        if !released {
            guard_missed("release", id);
        }
        Ok(released)
    }

    async fn release_item_if_until(
        &self,
        id: &ItemId,
        holder: &HolderId,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE items SET
                disposition = 'available',
                holder = NULL,
                reserved_at = NULL,
                reserved_until = NULL
            WHERE id = $1
              AND disposition = 'reserved'
              AND holder = $2
              AND reserved_until <= $3
            "#,
        )
        .bind(id.as_str())
        .bind(holder.as_str())
        .bind(until)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected() == 1;
        if !released {
            guard_missed("release_until", id);
        }
        Ok(released)
    }

    async fn commit_item(
        &self,
        id: &ItemId,
        holder: &HolderId,
        buyer: &str,
        session_id: Option<&CheckoutSessionId>,
        now: DateTime<Utc>,
    ) -> Result<Option<ItemRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE items SET
                disposition = 'sold',
                holder = NULL,
                reserved_at = NULL,
                reserved_until = NULL,
                sold_at = $4,
                sold_to = $3,
                sold_session_id = $5
            WHERE id = $1 AND disposition = 'reserved' AND holder = $2
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(holder.as_str())
        .bind(buyer)
        .bind(now)
        .bind(session_id.map(CheckoutSessionId::as_str))
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            guard_missed("commit", id);
        }
        row.map(Self::row_to_item).transpose()
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE items SET
                disposition = 'available',
                holder = NULL,
                reserved_at = NULL,
                reserved_until = NULL
            WHERE disposition = 'reserved' AND reserved_until < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        tracing::debug!(released, "released lapsed holds");
        Ok(released)
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn insert_order_if_absent(&self, order: OrderRecord) -> Result<InsertOutcome> {
        let lines_json = serde_json::to_value(&order.lines)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, checkout_session_id, user_id, buyer, customer_email, lines,
                subtotal_cents, amount_paid_cents, payment_reference,
                fulfilled_item_ids, unfulfilled_item_ids, needs_reconciliation, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (checkout_session_id) DO NOTHING
            "#,
        )
        .bind(order.order_id.as_uuid())
        .bind(order.checkout_session_id.as_str())
        .bind(order.user_id.as_str())
        .bind(&order.buyer)
        .bind(&order.customer_email)
        .bind(lines_json)
        .bind(order.subtotal.cents())
        .bind(order.amount_paid.map(|m| m.cents()))
        .bind(&order.payment_reference)
        .bind(id_strings(&order.fulfilled_item_ids))
        .bind(id_strings(&order.unfulfilled_item_ids))
        .bind(order.needs_reconciliation)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(InsertOutcome::Inserted(order));
        }

        let existing = self
            .get_order_by_session(&order.checkout_session_id)
            .await?
            .ok_or_else(|| StoreError::CorruptRecord {
                table: "orders",
                reason: format!(
                    "insert for session {} conflicted but no row was found",
                    order.checkout_session_id
                ),
            })?;
        Ok(InsertOutcome::AlreadyExists(existing))
    }

    async fn get_order_by_session(
        &self,
        session_id: &CheckoutSessionId,
    ) -> Result<Option<OrderRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE checkout_session_id = $1"
        ))
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn list_orders_for_user(&self, user_id: &HolderId) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order).collect()
    }
}

#[async_trait]
impl CheckoutSessionStore for PostgresStore {
    async fn save_session(&self, session: CheckoutSessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkout_sessions (session_id, holder, item_ids, amount_cents, reserved_until, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (session_id) DO UPDATE SET
                holder = EXCLUDED.holder,
                item_ids = EXCLUDED.item_ids,
                amount_cents = EXCLUDED.amount_cents,
                reserved_until = EXCLUDED.reserved_until
            "#,
        )
        .bind(session.session_id.as_str())
        .bind(session.holder.as_str())
        .bind(id_strings(&session.item_ids))
        .bind(session.amount.cents())
        .bind(session.reserved_until)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &CheckoutSessionId,
    ) -> Result<Option<CheckoutSessionRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT session_id, holder, item_ids, amount_cents, reserved_until, created_at
            FROM checkout_sessions
            WHERE session_id = $1
            "#,
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(CheckoutSessionRecord {
                session_id: CheckoutSessionId::new(row.try_get::<String, _>("session_id")?),
                holder: HolderId::new(row.try_get::<String, _>("holder")?),
                item_ids: row
                    .try_get::<Vec<String>, _>("item_ids")?
                    .into_iter()
                    .map(ItemId::new)
                    .collect(),
                amount: Money::from_cents(row.try_get("amount_cents")?),
                reserved_until: row.try_get("reserved_until")?,
                created_at: row.try_get("created_at")?,
            })),
            None => Ok(None),
        }
    }
}
