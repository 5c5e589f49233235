use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Local};
use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use parkease::model::FloorLayout;
use parkease::site::SiteManager;
use parkease::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("parkease_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let sites = Arc::new(SiteManager::new(
        dir,
        1000,
        Duration::from_secs(3),
        FloorLayout::default(),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let sites = sites.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, sites, "parkease".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(
    addr: SocketAddr,
    user: &str,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user(user)
        .password("parkease");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// A date far enough ahead that nothing expires during the test.
fn future_date() -> String {
    (Local::now().date_naive() + Days::new(30))
        .format("%Y-%m-%d")
        .to_string()
}

fn reserve_sql(slot: &str, date: &str) -> String {
    format!(
        "INSERT INTO reservations VALUES ('floor1', '{slot}', '{date}', '09:00', '10:00', 'ABC123')"
    )
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<tokio_postgres::SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn slot_status(slots: &[tokio_postgres::SimpleQueryRow], slot: &str) -> String {
    slots
        .iter()
        .find(|r| r.get("slot_id") == Some(slot))
        .and_then(|r| r.get("status"))
        .unwrap()
        .to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_and_cancel_roundtrip() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "u1").await;
    let date = future_date();

    client.simple_query(&reserve_sql("slot3", &date)).await.unwrap();

    let mine = rows(&client, "SELECT * FROM reservations").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("floor"), Some("floor1"));
    assert_eq!(mine[0].get("slot_id"), Some("slot3"));
    assert_eq!(mine[0].get("date"), Some(date.as_str()));
    assert_eq!(mine[0].get("start_time"), Some("09:00"));

    let slots = rows(
        &client,
        &format!("SELECT * FROM slots WHERE floor = 'floor1' AND date = '{date}'"),
    )
    .await;
    assert_eq!(slots.len(), 10);
    assert_eq!(slot_status(&slots, "slot3"), "reserved");

    let counts = rows(&client, &format!("SELECT * FROM floor_counts WHERE date = '{date}'")).await;
    let floor1 = counts.iter().find(|r| r.get("floor") == Some("floor1")).unwrap();
    assert_eq!(floor1.get("available"), Some("9"));

    client
        .simple_query(&format!("DELETE FROM reservations WHERE date = '{date}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM reservations").await.is_empty());

    let slots = rows(
        &client,
        &format!("SELECT * FROM slots WHERE floor = 'floor1' AND date = '{date}'"),
    )
    .await;
    assert_eq!(slot_status(&slots, "slot3"), "available");
}

#[tokio::test]
async fn taken_slot_is_a_unique_violation() {
    let addr = start_test_server().await;
    let (alice, _rx1) = connect(addr, "alice").await;
    let (bob, _rx2) = connect(addr, "bob").await;
    let date = future_date();

    alice.simple_query(&reserve_sql("slot3", &date)).await.unwrap();
    let err = bob.simple_query(&reserve_sql("slot3", &date)).await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));

    // bob gets nothing, alice keeps hers
    assert!(rows(&bob, "SELECT * FROM reservations").await.is_empty());
    assert_eq!(rows(&alice, "SELECT * FROM reservations").await.len(), 1);
}

#[tokio::test]
async fn concurrent_double_booking_has_one_winner() {
    let addr = start_test_server().await;
    let date = future_date();

    let mut handles = Vec::new();
    for i in 0..8 {
        let date = date.clone();
        handles.push(tokio::spawn(async move {
            let (client, _rx) = connect(addr, &format!("driver{i}")).await;
            client.simple_query(&reserve_sql("slot5", &date)).await.is_ok()
        }));
    }

    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let (observer, _rx) = connect(addr, "observer").await;
    let counts = rows(&observer, &format!("SELECT * FROM floor_counts WHERE date = '{date}'")).await;
    let floor1 = counts.iter().find(|r| r.get("floor") == Some("floor1")).unwrap();
    assert_eq!(floor1.get("available"), Some("9"));
}

#[tokio::test]
async fn malformed_reservation_is_rejected() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "u1").await;
    let date = future_date();

    let err = client
        .simple_query(&format!(
            "INSERT INTO reservations VALUES ('floor9', 'slot1', '{date}', '09:00', '10:00', 'ABC123')"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let err = client.simple_query("SELECT * FROM parking_lots").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn listen_delivers_slot_then_reservation_change() {
    let addr = start_test_server().await;
    let (listener, mut rx) = connect(addr, "u1").await;
    let (writer, _rx2) = connect(addr, "u1").await;
    let date = future_date();

    listener.batch_execute("LISTEN slots_floor1").await.unwrap();
    listener.batch_execute("LISTEN user_u1").await.unwrap();

    writer.simple_query(&reserve_sql("slot3", &date)).await.unwrap();
    // pending notifications ride along with the next statement
    listener.simple_query("SELECT * FROM upcoming").await.unwrap();

    let first = recv_notification(&mut rx, Duration::from_secs(2))
        .await
        .expect("expected slot notification");
    assert_eq!(first.channel(), "slots_floor1");
    let payload: serde_json::Value = serde_json::from_str(first.payload()).unwrap();
    assert_eq!(payload["path"], format!("slots/floor1/slot3/{date}/status"));
    assert_eq!(payload["value"], "reserved");

    let second = recv_notification(&mut rx, Duration::from_secs(2))
        .await
        .expect("expected reservation notification");
    assert_eq!(second.channel(), "user_u1");
    let payload: serde_json::Value = serde_json::from_str(second.payload()).unwrap();
    assert_eq!(payload["path"], format!("reservations/u1/{date}"));
    assert_eq!(payload["value"]["slotId"], "slot3");
    assert_eq!(payload["value"]["plate"], "ABC123");
}

#[tokio::test]
async fn listen_on_other_users_channel_is_refused() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "u1").await;

    let err = client.batch_execute("LISTEN user_u2").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INSUFFICIENT_PRIVILEGE));

    let err = client.batch_execute("LISTEN slots_basement").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let err = client.batch_execute("LISTEN anything").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION));
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let addr = start_test_server().await;
    let (listener, mut rx) = connect(addr, "u1").await;
    let (writer, _rx2) = connect(addr, "u2").await;
    let date = future_date();

    listener.batch_execute("LISTEN slots_floor1").await.unwrap();
    listener.batch_execute("UNLISTEN slots_floor1").await.unwrap();

    writer.simple_query(&reserve_sql("slot4", &date)).await.unwrap();
    listener.simple_query("SELECT * FROM upcoming").await.unwrap();

    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn other_floors_are_not_delivered() {
    let addr = start_test_server().await;
    let (listener, mut rx) = connect(addr, "u1").await;
    let (writer, _rx2) = connect(addr, "u2").await;
    let date = future_date();

    listener.batch_execute("LISTEN slots_floor2").await.unwrap();
    writer.simple_query(&reserve_sql("slot1", &date)).await.unwrap();
    listener.simple_query("SELECT * FROM upcoming").await.unwrap();

    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn profile_and_vehicles() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "u1").await;

    client
        .simple_query("INSERT INTO users VALUES ('ana', 'ana@example.com', '09171234567')")
        .await
        .unwrap();
    client
        .simple_query("INSERT INTO users (notifications) VALUES (false)")
        .await
        .unwrap();

    let profile = rows(&client, "SELECT * FROM users").await;
    assert_eq!(profile.len(), 1);
    assert_eq!(profile[0].get("username"), Some("ana"));
    assert_eq!(profile[0].get("phone"), Some("09171234567"));
    assert!(matches!(profile[0].get("notifications"), Some("f" | "false")));

    client
        .simple_query("INSERT INTO vehicles VALUES ('Toyota', 'Vios', 'ABC123')")
        .await
        .unwrap();
    let vehicles = rows(&client, "SELECT * FROM vehicles").await;
    assert_eq!(vehicles.len(), 1);
    assert_eq!(vehicles[0].get("brand"), Some("Toyota"));

    let id = vehicles[0].get("id").unwrap().to_string();
    client
        .simple_query(&format!("DELETE FROM vehicles WHERE id = '{id}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM vehicles").await.is_empty());

    let docs = rows(&client, "SELECT * FROM documents").await;
    assert!(docs.iter().any(|r| r.get("path") == Some("users/u1/username")));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "u1").await;
    let date = future_date();

    client.simple_query(&reserve_sql("slot2", &date)).await.unwrap();

    let slots = client
        .query(
            "SELECT * FROM slots WHERE floor = $1 AND date = $2",
            &[&"floor1", &date.as_str()],
        )
        .await
        .unwrap();
    assert_eq!(slots.len(), 10);
    let reserved: Vec<String> = slots
        .iter()
        .filter(|r| r.get::<_, String>("status") == "reserved")
        .map(|r| r.get::<_, String>("slot_id"))
        .collect();
    assert_eq!(reserved, vec!["slot2".to_string()]);
}
