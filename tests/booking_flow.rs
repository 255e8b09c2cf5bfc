use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotd::tenant::TenantManager;
use slotd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, 900_000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_db(addr: SocketAddr, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("slotd")
        .password("slotd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    connect_db(addr, "test").await
}

fn tomorrow() -> NaiveDate {
    Utc::now().date_naive() + Days::new(1)
}

/// A schedule open every day, 09:00-12:00 with a 10:00-10:15 break and
/// 30-minute slots. Windows: 09:00 09:30 10:15 10:45 11:15.
fn schedule_sql(salon_id: Ulid, capacity: u32) -> String {
    format!(
        "INSERT INTO schedules (salon_id, working_days, start_time, end_time, \
         break_start_time, break_end_time, slot_duration, max_bookings_per_slot) \
         VALUES ('{salon_id}', 'mon,tue,wed,thu,fri,sat,sun', '09:00', '12:00', \
         '10:00', '10:15', 30, {capacity})"
    )
}

fn booking_sql(id: Ulid, salon_id: Ulid, customer_id: Ulid, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO bookings (id, salon_id, date, start_time, end_time, customer_id) \
         VALUES ('{id}', '{salon_id}', '{date}', '{start}', '{end}', '{customer_id}')",
        date = tomorrow()
    )
}

/// Server-sent error text. `Display` on the driver error is just
/// "db error"; the message lives on the inner `DbError`.
fn db_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    }
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn schedule_upsert_and_availability() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let salon_id = Ulid::new();
    client.batch_execute(&schedule_sql(salon_id, 2)).await.unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE salon_id = '{salon_id}' AND date = '{}'",
                tomorrow()
            ))
            .await
            .unwrap(),
    );

    assert_eq!(rows.len(), 5);
    let starts: Vec<&str> = rows.iter().map(|r| r.get("start_time").unwrap()).collect();
    assert_eq!(starts, vec!["09:00", "09:30", "10:15", "10:45", "11:15"]);
    assert_eq!(rows[0].get("end_time"), Some("09:30"));
    assert!(rows.iter().all(|r| r.get("remaining") == Some("2")));
}

#[tokio::test]
async fn schedule_readback() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let salon_id = Ulid::new();
    client.batch_execute(&schedule_sql(salon_id, 3)).await.unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM schedules WHERE salon_id = '{salon_id}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("start_time"), Some("09:00"));
    assert_eq!(rows[0].get("break_end_time"), Some("10:15"));
    assert_eq!(rows[0].get("max_bookings_per_slot"), Some("3"));
    assert_eq!(rows[0].get("version"), Some("1"));
}

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let salon_id = Ulid::new();
    let booking_id = Ulid::new();
    let customer_id = Ulid::new();

    client.batch_execute(&schedule_sql(salon_id, 2)).await.unwrap();
    client
        .batch_execute(&booking_sql(booking_id, salon_id, customer_id, "10:15", "10:45"))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM bookings WHERE customer_id = '{customer_id}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("requested"));
    assert_eq!(rows[0].get("start_time"), Some("10:15"));

    // The hold decrements availability.
    let avail = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE salon_id = '{salon_id}' AND date = '{}'",
                tomorrow()
            ))
            .await
            .unwrap(),
    );
    let slot = avail
        .iter()
        .find(|r| r.get("start_time") == Some("10:15"))
        .unwrap();
    assert_eq!(slot.get("remaining"), Some("1"));

    // Confirm, then cancel.
    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'confirmed' \
             WHERE id = '{booking_id}' AND customer_id = '{customer_id}'"
        ))
        .await
        .unwrap();
    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM bookings WHERE customer_id = '{customer_id}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("confirmed"));

    client
        .batch_execute(&format!(
            "DELETE FROM bookings WHERE id = '{booking_id}' AND customer_id = '{customer_id}'"
        ))
        .await
        .unwrap();
    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM bookings WHERE customer_id = '{customer_id}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("cancelled"));

    // Capacity is back.
    let avail = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE salon_id = '{salon_id}' AND date = '{}'",
                tomorrow()
            ))
            .await
            .unwrap(),
    );
    let slot = avail
        .iter()
        .find(|r| r.get("start_time") == Some("10:15"))
        .unwrap();
    assert_eq!(slot.get("remaining"), Some("2"));
}

#[tokio::test]
async fn overbooking_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let salon_id = Ulid::new();
    client.batch_execute(&schedule_sql(salon_id, 1)).await.unwrap();

    client
        .batch_execute(&booking_sql(Ulid::new(), salon_id, Ulid::new(), "09:00", "09:30"))
        .await
        .unwrap();

    let err = client
        .batch_execute(&booking_sql(Ulid::new(), salon_id, Ulid::new(), "09:00", "09:30"))
        .await
        .unwrap_err();
    assert!(db_message(&err).contains("slot full"), "got: {err}");

    // A different window still books fine.
    client
        .batch_execute(&booking_sql(Ulid::new(), salon_id, Ulid::new(), "09:30", "10:00"))
        .await
        .unwrap();
}

#[tokio::test]
async fn off_grid_window_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let salon_id = Ulid::new();
    client.batch_execute(&schedule_sql(salon_id, 1)).await.unwrap();

    let err = client
        .batch_execute(&booking_sql(Ulid::new(), salon_id, Ulid::new(), "09:10", "09:40"))
        .await
        .unwrap_err();
    assert!(db_message(&err).contains("slot closed"), "got: {err}");

    // The break window is never bookable.
    let err = client
        .batch_execute(&booking_sql(Ulid::new(), salon_id, Ulid::new(), "10:00", "10:30"))
        .await
        .unwrap_err();
    assert!(db_message(&err).contains("slot closed"), "got: {err}");
}

#[tokio::test]
async fn invalid_schedule_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let salon_id = Ulid::new();
    // Break ends at closing time.
    let err = client
        .batch_execute(&format!(
            "INSERT INTO schedules (salon_id, working_days, start_time, end_time, \
             break_start_time, break_end_time, slot_duration, max_bookings_per_slot) \
             VALUES ('{salon_id}', 'mon', '09:00', '12:00', '11:00', '12:00', 30, 1)"
        ))
        .await
        .unwrap_err();
    assert!(db_message(&err).contains("invalid schedule"), "got: {err}");
}

#[tokio::test]
async fn listen_acknowledged_and_validated() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let salon_id = Ulid::new();
    client
        .batch_execute(&format!("LISTEN salon_{salon_id}"))
        .await
        .unwrap();

    let err = client.batch_execute("LISTEN bogus_channel").await.unwrap_err();
    assert!(db_message(&err).contains("invalid channel"), "got: {err}");
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, _tm) = start_test_server().await;
    let client_a = connect_db(addr, "tenant_a").await;
    let client_b = connect_db(addr, "tenant_b").await;

    let salon_id = Ulid::new();
    client_a.batch_execute(&schedule_sql(salon_id, 1)).await.unwrap();

    // Tenant B never saw that salon.
    let err = client_b
        .simple_query(&format!(
            "SELECT * FROM availability WHERE salon_id = '{salon_id}' AND date = '{}'",
            tomorrow()
        ))
        .await
        .unwrap_err();
    assert!(db_message(&err).contains("not found"), "got: {err}");
}
