//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p item-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use item_store::{
    CheckoutSessionId, CheckoutSessionRecord, CheckoutSessionStore, Disposition, HolderId,
    ItemId, ItemQuery, ItemStore, ItemStoreExt, Money, NewItem, OrderId, OrderLine, OrderRecord,
    OrderStore, PostgresStore,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!("../../../migrations/001_create_items_table.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_orders_and_sessions.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(16)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE items, orders, checkout_sessions")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::new(pool)
}

async fn seed(store: &PostgresStore, id: &str) {
    store
        .upsert_item(
            NewItem::new(id, format!("Item {id}"), Money::from_cents(2500)),
            Utc::now(),
        )
        .await
        .unwrap();
}

fn order_for(session: &str, user: &str) -> OrderRecord {
    OrderRecord {
        order_id: OrderId::new(),
        checkout_session_id: CheckoutSessionId::new(session),
        user_id: HolderId::new(user),
        buyer: format!("{user}@example.com"),
        customer_email: Some(format!("{user}@example.com")),
        lines: vec![OrderLine {
            item_id: ItemId::new("I1"),
            title: "Item I1".to_string(),
            price: Money::from_cents(2500),
        }],
        subtotal: Money::from_cents(2500),
        amount_paid: Some(Money::from_cents(3500)),
        payment_reference: Some("pi_123".to_string()),
        fulfilled_item_ids: vec![ItemId::new("I1")],
        unfulfilled_item_ids: vec![],
        needs_reconciliation: false,
        created_at: Utc::now(),
    }
}

#[tokio::test]
#[serial]
async fn reserve_and_read_back() {
    let store = get_test_store().await;
    seed(&store, "I1").await;
    let holder = HolderId::new("x");
    let now = Utc::now();

    let reserved = store
        .reserve_item(&ItemId::new("I1"), &holder, now, now + Duration::hours(1))
        .await
        .unwrap()
        .expect("item should be reserved");

    assert_eq!(reserved.disposition, Disposition::Reserved);
    assert_eq!(reserved.holder, Some(holder.clone()));

    let fetched = store.get_item(&ItemId::new("I1")).await.unwrap().unwrap();
    assert_eq!(fetched.disposition, Disposition::Reserved);
    assert_eq!(fetched.price, Money::from_cents(2500));
}

#[tokio::test]
#[serial]
async fn reserve_unknown_item_matches_nothing() {
    let store = get_test_store().await;
    let now = Utc::now();

    let result = store
        .reserve_item(&ItemId::new("missing"), &HolderId::new("x"), now, now)
        .await
        .unwrap();

    assert!(result.is_none());
}

#[tokio::test]
#[serial]
async fn live_hold_blocks_other_holder_until_it_lapses() {
    let store = get_test_store().await;
    seed(&store, "I1").await;
    let id = ItemId::new("I1");
    let t0 = Utc::now();

    store
        .reserve_item(&id, &HolderId::new("x"), t0, t0 + Duration::hours(1))
        .await
        .unwrap()
        .unwrap();

    let blocked = store
        .reserve_item(
            &id,
            &HolderId::new("y"),
            t0 + Duration::minutes(30),
            t0 + Duration::minutes(90),
        )
        .await
        .unwrap();
    assert!(blocked.is_none());

    let taken = store
        .reserve_item(
            &id,
            &HolderId::new("y"),
            t0 + Duration::minutes(61),
            t0 + Duration::minutes(121),
        )
        .await
        .unwrap()
        .expect("lapsed hold should be taken over");
    assert_eq!(taken.holder, Some(HolderId::new("y")));
}

#[tokio::test]
#[serial]
async fn release_only_by_holder() {
    let store = get_test_store().await;
    seed(&store, "I1").await;
    let id = ItemId::new("I1");
    let x = HolderId::new("x");
    let now = Utc::now();

    store
        .reserve_item(&id, &x, now, now + Duration::hours(1))
        .await
        .unwrap();

    assert!(!store.release_item(&id, &HolderId::new("y")).await.unwrap());
    assert!(store.release_item(&id, &x).await.unwrap());
    assert!(!store.release_item(&id, &x).await.unwrap());

    let item = store.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.disposition, Disposition::Available);
    assert!(item.holder.is_none());
}

#[tokio::test]
#[serial]
async fn release_until_keeps_refreshed_hold() {
    let store = get_test_store().await;
    seed(&store, "I1").await;
    let id = ItemId::new("I1");
    let x = HolderId::new("x");
    let now = Utc::now();
    let first_deadline = now + Duration::hours(1);

    store.reserve_item(&id, &x, now, first_deadline).await.unwrap();
    let later = now + Duration::minutes(5);
    store
        .reserve_item(&id, &x, later, later + Duration::hours(1))
        .await
        .unwrap();

    assert!(!store.release_item_if_until(&id, &x, first_deadline).await.unwrap());
    assert!(store.get_item(&id).await.unwrap().unwrap().is_held_by(&x));

    assert!(
        store
            .release_item_if_until(&id, &x, later + Duration::hours(1))
            .await
            .unwrap()
    );
    let item = store.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.disposition, Disposition::Available);
}

#[tokio::test]
#[serial]
async fn commit_is_terminal() {
    let store = get_test_store().await;
    seed(&store, "I1").await;
    let id = ItemId::new("I1");
    let x = HolderId::new("x");
    let now = Utc::now();

    store
        .reserve_item(&id, &x, now, now + Duration::hours(1))
        .await
        .unwrap();

    let session = CheckoutSessionId::new("cs_1");
    let sold = store
        .commit_item(&id, &x, "x@example.com", Some(&session), now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sold.disposition, Disposition::Sold);
    assert_eq!(sold.sold_to.as_deref(), Some("x@example.com"));
    assert_eq!(sold.sold_session_id, Some(session));

    // Sold items cannot be committed again, released or reserved.
    assert!(store.commit_item(&id, &x, "x", None, now).await.unwrap().is_none());
    assert!(!store.release_item(&id, &x).await.unwrap());
    let later = now + Duration::days(2);
    assert!(
        store
            .reserve_item(&id, &x, later, later + Duration::hours(1))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(store.release_expired(later).await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn upsert_keeps_disposition() {
    let store = get_test_store().await;
    seed(&store, "I1").await;
    let id = ItemId::new("I1");
    let now = Utc::now();

    store
        .reserve_item(&id, &HolderId::new("x"), now, now + Duration::hours(1))
        .await
        .unwrap();

    let refreshed = store
        .upsert_item(NewItem::new("I1", "Renamed", Money::from_cents(999)), now)
        .await
        .unwrap();

    assert_eq!(refreshed.title, "Renamed");
    assert_eq!(refreshed.price, Money::from_cents(999));
    assert_eq!(refreshed.disposition, Disposition::Reserved);
}

#[tokio::test]
#[serial]
async fn release_expired_sweeps_only_lapsed_holds() {
    let store = get_test_store().await;
    for id in ["A", "B", "C"] {
        seed(&store, id).await;
    }
    let t0 = Utc::now();

    store
        .reserve_item(&ItemId::new("A"), &HolderId::new("x"), t0, t0 + Duration::minutes(5))
        .await
        .unwrap();
    store
        .reserve_item(&ItemId::new("B"), &HolderId::new("y"), t0, t0 + Duration::hours(2))
        .await
        .unwrap();

    let released = store
        .release_expired(t0 + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(released, 1);

    let a = store.get_item(&ItemId::new("A")).await.unwrap().unwrap();
    let b = store.get_item(&ItemId::new("B")).await.unwrap().unwrap();
    assert_eq!(a.disposition, Disposition::Available);
    assert_eq!(b.disposition, Disposition::Reserved);
}

#[tokio::test]
#[serial]
async fn query_items_filters() {
    let store = get_test_store().await;
    for id in ["A", "B", "C", "D"] {
        seed(&store, id).await;
    }
    let x = HolderId::new("x");
    let t0 = Utc::now();

    store
        .reserve_item(&ItemId::new("A"), &x, t0, t0 + Duration::hours(1))
        .await
        .unwrap();
    store
        .reserve_item(&ItemId::new("B"), &x, t0, t0 + Duration::minutes(1))
        .await
        .unwrap();

    let held = store.items_held_by(&x).await.unwrap();
    assert_eq!(held.len(), 2);

    let free = store
        .query_items(ItemQuery::free_at(t0 + Duration::minutes(5)))
        .await
        .unwrap();
    let ids: Vec<_> = free.iter().map(|i| i.id.as_str().to_string()).collect();
    assert_eq!(ids.len(), 3);
    assert!(!ids.contains(&"A".to_string()));

    let page = store
        .query_items(ItemQuery::new().limit(2).offset(1))
        .await
        .unwrap();
    assert_eq!(page.len(), 2);

    let some = store
        .get_items(&[ItemId::new("C"), ItemId::new("missing")])
        .await
        .unwrap();
    assert_eq!(some.len(), 1);

    let reserved = store
        .query_items(ItemQuery::new().disposition(Disposition::Reserved))
        .await
        .unwrap();
    assert_eq!(reserved.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[serial]
async fn concurrent_reservations_have_one_winner() {
    let store = Arc::new(get_test_store().await);
    seed(&store, "I1").await;
    let now = Utc::now();

    let attempts = (0..24).map(|n| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .reserve_item(
                    &ItemId::new("I1"),
                    &HolderId::new(format!("holder-{n}")),
                    now,
                    now + Duration::hours(1),
                )
                .await
                .unwrap()
                .is_some()
        })
    });

    let results = futures_util::future::join_all(attempts).await;
    let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

    assert_eq!(winners, 1);
}

#[tokio::test]
#[serial]
async fn order_insert_is_idempotent_per_session() {
    let store = get_test_store().await;

    let first = store
        .insert_order_if_absent(order_for("cs_1", "x"))
        .await
        .unwrap();
    assert!(first.was_inserted());

    let second = store
        .insert_order_if_absent(order_for("cs_1", "x"))
        .await
        .unwrap();
    assert!(!second.was_inserted());
    assert_eq!(second.order().order_id, first.order().order_id);

    let stored = store
        .get_order_by_session(&CheckoutSessionId::new("cs_1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.lines.len(), 1);
    assert_eq!(stored.amount_paid, Some(Money::from_cents(3500)));
    assert_eq!(stored.fulfilled_item_ids, vec![ItemId::new("I1")]);
}

#[tokio::test]
#[serial]
async fn orders_listed_newest_first() {
    let store = get_test_store().await;
    let mut older = order_for("cs_old", "x");
    older.created_at = Utc::now() - Duration::days(1);
    let newer = order_for("cs_new", "x");

    store.insert_order_if_absent(older).await.unwrap();
    store.insert_order_if_absent(newer).await.unwrap();
    store
        .insert_order_if_absent(order_for("cs_other", "y"))
        .await
        .unwrap();

    let orders = store
        .list_orders_for_user(&HolderId::new("x"))
        .await
        .unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].checkout_session_id.as_str(), "cs_new");
}

#[tokio::test]
#[serial]
async fn checkout_session_round_trip() {
    let store = get_test_store().await;
    let now = Utc::now();
    let session = CheckoutSessionRecord {
        session_id: CheckoutSessionId::new("cs_1"),
        holder: HolderId::new("x"),
        item_ids: vec![ItemId::new("A"), ItemId::new("B")],
        amount: Money::from_cents(6500),
        reserved_until: now + Duration::hours(1),
        created_at: now,
    };

    store.save_session(session.clone()).await.unwrap();

    let loaded = store
        .get_session(&CheckoutSessionId::new("cs_1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.item_ids, session.item_ids);
    assert_eq!(loaded.amount, session.amount);
    assert!(
        store
            .get_session(&CheckoutSessionId::new("cs_2"))
            .await
            .unwrap()
            .is_none()
    );
}
