use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use slotbook::auth::{Account, StaticIdentity};
use slotbook::engine::EngineConfig;
use slotbook::model::Role;
use slotbook::tenant::TenantManager;
use slotbook::wire;

// ── Test infrastructure ──────────────────────────────────────

const PROVIDER: &str = "dr_lee";
const SAM: &str = "sam";
const ALEX: &str = "alex";

fn account(username: &str, role: Role) -> Account {
    Account {
        username: username.into(),
        password: "pw".into(),
        actor_id: Ulid::new(),
        role,
        contact: Some(format!("{username}@example.com")),
    }
}

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let identity = StaticIdentity::new(vec![
        account(PROVIDER, Role::Provider),
        account(SAM, Role::Requester),
        account(ALEX, Role::Requester),
    ]);
    let tm = Arc::new(TenantManager::new(dir, 1000, EngineConfig::default(), Arc::new(identity)));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, None).await;
            });
        }
    });

    (addr, tm)
}

async fn try_connect(addr: SocketAddr, user: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("clinic")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    try_connect(addr, user, "pw").await.unwrap()
}

/// Values of the first column of every data row.
async fn first_column(client: &Client, sql: &str) -> Vec<String> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_default()
}

async fn create_slot(provider: &Client) -> String {
    let ids = first_column(
        provider,
        r#"INSERT INTO slots (date, start, "end", hourly_rate) VALUES ('2030-01-07', '09:00', '12:00', 60)"#,
    )
    .await;
    assert_eq!(ids.len(), 1);
    ids[0].clone()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_list_round_trip() {
    let (addr, _tm) = start_test_server().await;
    let provider = connect(addr, PROVIDER).await;
    let sam = connect(addr, SAM).await;

    let slot_id = create_slot(&provider).await;

    // Extended protocol with bound parameters
    let rows = sam
        .query(
            r#"INSERT INTO bookings (slot_id, start, "end") VALUES ($1, $2, $3)"#,
            &[&slot_id, &"09:00", &"10:00"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let booking_id: String = rows[0].get("id");
    assert!(Ulid::from_string(&booking_id).is_ok());

    let free = sam
        .query("SELECT * FROM free_ranges WHERE slot_id = $1", &[&slot_id])
        .await
        .unwrap();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].get::<_, String>("start"), "10:00:00");
    assert_eq!(free[0].get::<_, String>("end"), "12:00:00");

    let mine = first_column(&sam, "SELECT * FROM bookings").await;
    assert_eq!(mine, vec![booking_id.clone()]);

    let on_slot = first_column(&provider, &format!("SELECT * FROM bookings WHERE slot_id = '{slot_id}'")).await;
    assert_eq!(on_slot, vec![booking_id]);
}

#[tokio::test]
async fn overlapping_booking_is_a_conflict() {
    let (addr, _tm) = start_test_server().await;
    let provider = connect(addr, PROVIDER).await;
    let sam = connect(addr, SAM).await;
    let alex = connect(addr, ALEX).await;

    let slot_id = create_slot(&provider).await;
    sam.simple_query(&format!(
        r#"INSERT INTO bookings (slot_id, start, "end") VALUES ('{slot_id}', '09:00', '10:30')"#
    ))
    .await
    .unwrap();

    let err = alex
        .simple_query(&format!(
            r#"INSERT INTO bookings (slot_id, start, "end") VALUES ('{slot_id}', '10:00', '11:00')"#
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    // Alex only sees their own bookings on the provider's slot
    let visible = first_column(&alex, &format!("SELECT * FROM bookings WHERE slot_id = '{slot_id}'")).await;
    assert!(visible.is_empty());
}

#[tokio::test]
async fn cancel_and_reschedule() {
    let (addr, _tm) = start_test_server().await;
    let provider = connect(addr, PROVIDER).await;
    let sam = connect(addr, SAM).await;

    let slot_id = create_slot(&provider).await;
    let ids = first_column(
        &sam,
        &format!(r#"INSERT INTO bookings (slot_id, start, duration) VALUES ('{slot_id}', '09:00', 30)"#),
    )
    .await;
    let booking_id = &ids[0];

    let moved = first_column(
        &sam,
        &format!(
            r#"INSERT INTO reschedules (booking_id, slot_id, start, "end") VALUES ('{booking_id}', '{slot_id}', '11:00', '11:30')"#
        ),
    )
    .await;
    assert_eq!(moved.len(), 1);
    let new_id = &moved[0];

    // The old booking is gone from the free-range computation
    let free = first_column(&sam, &format!("SELECT * FROM free_ranges WHERE slot_id = '{slot_id}'")).await;
    assert_eq!(free.len(), 2);

    sam.simple_query(&format!("DELETE FROM bookings WHERE id = '{new_id}'"))
        .await
        .unwrap();
    let err = sam
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{new_id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");
}

#[tokio::test]
async fn roles_are_enforced() {
    let (addr, _tm) = start_test_server().await;
    let provider = connect(addr, PROVIDER).await;
    let sam = connect(addr, SAM).await;

    let err = sam
        .simple_query(r#"INSERT INTO slots (date, start, "end") VALUES ('2030-01-07', '09:00', '10:00')"#)
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let slot_id = create_slot(&provider).await;
    let err = provider
        .simple_query(&format!("INSERT INTO bookings (slot_id) VALUES ('{slot_id}')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");
}

#[tokio::test]
async fn listings_and_schedule() {
    let (addr, _tm) = start_test_server().await;
    let provider = connect(addr, PROVIDER).await;
    let sam = connect(addr, SAM).await;

    let slot_id = create_slot(&provider).await;
    let listed = first_column(
        &provider,
        "SELECT * FROM slots WHERE date >= '2030-01-01' AND date < '2030-02-01'",
    )
    .await;
    assert_eq!(listed, vec![slot_id.clone()]);

    let bookable = first_column(&sam, "SELECT * FROM bookable_slots WHERE date = '2030-01-07'").await;
    assert_eq!(bookable, vec![slot_id]);

    let providers = first_column(&sam, "SELECT * FROM providers").await;
    assert_eq!(providers.len(), 1);

    provider
        .simple_query(
            r#"INSERT INTO schedules (day_of_week, enabled, start, "end", hourly_rate) VALUES (1, true, '13:00', '17:00', 60), (3, false, '09:00', '12:00', 60)"#,
        )
        .await
        .unwrap();
    let schedule = first_column(&sam, &format!("SELECT * FROM schedules WHERE provider_id = '{}'", providers[0])).await;
    assert_eq!(schedule.len(), 2);

    // Requesters must name a provider
    let err = sam.simple_query("SELECT * FROM slots").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn bad_credentials_are_refused() {
    let (addr, _tm) = start_test_server().await;
    assert!(try_connect(addr, SAM, "wrong").await.is_err());
    assert!(try_connect(addr, "nobody", "pw").await.is_err());
}
