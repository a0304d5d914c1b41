use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotkeeper::config::Configuration;
use slotkeeper::engine::Engine;
use slotkeeper::notify::NotifyHub;
use slotkeeper::wire;

// ── Test infrastructure ──────────────────────────────────────

fn open_day() -> NaiveDate {
    Utc::now().date_naive() + Days::new(2)
}

fn holiday() -> NaiveDate {
    Utc::now().date_naive() + Days::new(3)
}

fn config() -> Configuration {
    let day = r#"[{ start = "09:00", end = "17:00" }]"#;
    let toml = format!(
        r#"
version = 1
timezone = "UTC"
slot_step_minutes = 15
booking_horizon_days = 30

[schedule]
mon = {day}
tue = {day}
wed = {day}
thu = {day}
fri = {day}
sat = {day}
sun = {day}

[[holidays]]
name = "closed for stocktake"
start = "{holiday}"
end = "{holiday}"

[[services]]
id = 1
duration_minutes = 30
buffer_after_minutes = 10

[[services]]
id = 2
duration_minutes = 60
capacity = 2

[[agents]]
id = 7
name = "Ada"
services = [1]
"#,
        holiday = holiday()
    );
    Configuration::from_toml_str(&toml).unwrap()
}

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotkeeper_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("bookings.wal"), config(), Arc::new(NotifyHub::new())).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "slotkeeper".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotkeeper")
        .user("frontdesk")
        .password("slotkeeper");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

/// (SQLSTATE, message) of a failed statement.
async fn query_err(client: &tokio_postgres::Client, sql: &str) -> (String, String) {
    let err = client.simple_query(sql).await.unwrap_err();
    let db = err.as_db_error().expect("database error");
    (db.code().code().to_string(), db.message().to_string())
}

fn slots_sql(service_id: u32, date: NaiveDate) -> String {
    format!("SELECT * FROM slots WHERE service_id = {service_id} AND date = '{date}'")
}

fn insert_sql(service_id: u32, start: &str) -> String {
    format!("INSERT INTO bookings (service_id, start, customer_id) VALUES ({service_id}, '{start}', 'cust-1')")
}

fn col<'a>(row: &'a SimpleQueryRow, name: &str) -> &'a str {
    row.get(name).unwrap_or_else(|| panic!("{name} is NULL"))
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_listed_with_local_times() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let slots = query(&client, &slots_sql(1, open_day())).await;
    // 09:00 .. 16:15, every 15 minutes.
    assert_eq!(slots.len(), 30);
    assert_eq!(col(&slots[0], "start_time"), "09:00");
    assert_eq!(col(&slots[0], "end_time"), "09:30");
    assert_eq!(col(&slots[0], "date"), open_day().to_string());
    assert!(slots[0].get("agent_id").is_none());

    // Closed and unknown both answer with zero rows.
    assert!(query(&client, &slots_sql(1, holiday())).await.is_empty());
    assert!(query(&client, &slots_sql(99, open_day())).await.is_empty());
}

#[tokio::test]
async fn booking_flow_rotates_tokens() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let day = open_day();

    let created = query(&client, &insert_sql(1, &format!("{day} 10:00"))).await;
    assert_eq!(created.len(), 1);
    let id = col(&created[0], "id").to_string();
    let first_token = col(&created[0], "manage_token").to_string();
    assert_eq!(first_token.len(), 64);
    assert_eq!(col(&created[0], "status"), "confirmed");

    // The booking took its slot and its buffer.
    let starts: Vec<String> = query(&client, &slots_sql(1, day))
        .await
        .iter()
        .map(|r| col(r, "start_time").to_string())
        .collect();
    assert!(!starts.contains(&"10:00".to_string()));
    assert!(!starts.contains(&"10:30".to_string()));
    assert!(starts.contains(&"10:45".to_string()));

    // Lookups never echo a token.
    let by_token = query(
        &client,
        &format!("SELECT * FROM bookings WHERE manage_token = '{first_token}'"),
    )
    .await;
    assert_eq!(col(&by_token[0], "id"), id);
    assert!(by_token[0].get("manage_token").is_none());

    let moved = query(
        &client,
        &format!("UPDATE bookings SET start = '{day} 14:00' WHERE manage_token = '{first_token}'"),
    )
    .await;
    assert_eq!(col(&moved[0], "id"), id);
    let second_token = col(&moved[0], "manage_token").to_string();
    assert_ne!(second_token, first_token);

    let cancelled = query(
        &client,
        &format!("UPDATE bookings SET status = 'cancelled' WHERE manage_token = '{second_token}'"),
    )
    .await;
    assert_eq!(col(&cancelled[0], "status"), "cancelled");

    // Scenario D: the pre-cancel token is dead.
    let (state, message) = query_err(
        &client,
        &format!("UPDATE bookings SET start = '{day} 15:00' WHERE manage_token = '{second_token}'"),
    )
    .await;
    assert_eq!(state, "28000");
    assert!(message.starts_with("token_invalid: "), "{message}");

    let by_id = query(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(col(&by_id[0], "status"), "cancelled");
}

#[tokio::test]
async fn double_booking_is_slot_unavailable() {
    let addr = start_test_server().await;
    let a = connect(addr).await;
    let b = connect(addr).await;
    let start = format!("{} 09:00", open_day());

    let sql_a = insert_sql(1, &start);
    let sql_b = insert_sql(1, &start);
    let (first, second) = tokio::join!(a.simple_query(&sql_a), b.simple_query(&sql_b),);
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let err = outcomes.into_iter().find_map(|r| r.err()).unwrap();
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "40001");
    assert!(db.message().starts_with("slot_unavailable: "));
}

#[tokio::test]
async fn capacity_two_admits_two() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let start = format!("{} 11:00", open_day());

    query(&client, &insert_sql(2, &start)).await;
    query(&client, &insert_sql(2, &start)).await;
    let (state, _) = query_err(&client, &insert_sql(2, &start)).await;
    assert_eq!(state, "40001");
}

#[tokio::test]
async fn payment_confirms_by_id() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let day = open_day();

    let created = query(
        &client,
        &format!(
            "INSERT INTO bookings (service_id, agent_id, start, customer_id, status) VALUES (1, 7, '{day} 12:00', 'c', 'pending_payment')"
        ),
    )
    .await;
    let id = col(&created[0], "id").to_string();
    assert_eq!(col(&created[0], "agent_id"), "7");

    // A customer cannot confirm; payment can.
    let token = col(&created[0], "manage_token").to_string();
    let (state, _) = query_err(
        &client,
        &format!("UPDATE bookings SET status = 'confirmed' WHERE manage_token = '{token}'"),
    )
    .await;
    assert_eq!(state, "55000");

    let confirmed = query(
        &client,
        &format!("UPDATE bookings SET status = 'confirmed', actor = 'payment' WHERE id = '{id}'"),
    )
    .await;
    assert_eq!(col(&confirmed[0], "status"), "confirmed");
    assert!(confirmed[0].get("manage_token").is_none());

    // Nothing has ended yet.
    let done = client
        .simple_query("UPDATE bookings SET status = 'completed' WHERE \"end\" <= 4102444799000")
        .await
        .unwrap();
    assert!(done.iter().any(|m| matches!(m, SimpleQueryMessage::CommandComplete(0))));
}

#[tokio::test]
async fn request_errors_map_to_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let day = open_day();

    let (state, message) = query_err(&client, &insert_sql(1, &format!("{day} 09:05"))).await;
    assert_eq!(state, "22023");
    assert!(message.starts_with("validation_error: "), "{message}");

    let (state, _) = query_err(&client, &insert_sql(1, &format!("{} 09:00", holiday()))).await;
    assert_eq!(state, "P0001");

    let (state, _) = query_err(&client, &insert_sql(42, &format!("{day} 09:00"))).await;
    assert_eq!(state, "P0002");

    let (state, _) = query_err(&client, "DROP TABLE bookings").await;
    assert_eq!(state, "42601");
}
