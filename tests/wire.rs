use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Duration;
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use headroom::engine::today;
use headroom::tenant::TenantManager;
use headroom::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("headroom_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "headroom".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("headroom")
        .password("headroom");
    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
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

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn insert_engineer(client: &Client, name: &str, max_capacity: u32) -> String {
    let quoted = name.replace('\'', "''");
    let sql = format!(
        "INSERT INTO engineers (name, email, max_capacity, skills) \
         VALUES ('{quoted}', '{}@example.com', {max_capacity}, 'Rust,SQL')",
        quoted.to_lowercase()
    );
    let row = &rows(client, &sql).await[0];
    row.get("id").unwrap().to_string()
}

async fn insert_project(client: &Client, name: &str) -> String {
    let sql = format!(
        "INSERT INTO projects (name, description, start_date, end_date, manager_id, status) \
         VALUES ('{name}', 'Work on {name}', '2024-01-01', '2024-12-31', '{}', 'active')",
        Ulid::new()
    );
    let row = &rows(client, &sql).await[0];
    row.get("id").unwrap().to_string()
}

fn assign_sql(engineer: &str, project: &str, allocation: u32, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO assignments (engineer_id, project_id, allocation, start_date, end_date, role) \
         VALUES ('{engineer}', '{project}', {allocation}, '{start}', '{end}', 'Developer')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn engineer_crud_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "crud").await;

    let id = insert_engineer(&client, "Jane", 100).await;
    let fetched = rows(&client, &format!("SELECT * FROM engineers WHERE id = '{id}'")).await;
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].get("name"), Some("Jane"));
    assert_eq!(fetched[0].get("max_capacity"), Some("100"));
    assert_eq!(fetched[0].get("skills"), Some("Rust,SQL"));
    assert_eq!(fetched[0].get("seniority"), None);

    let updated = rows(
        &client,
        &format!("UPDATE engineers SET max_capacity = 50, seniority = 'senior' WHERE id = '{id}'"),
    )
    .await;
    assert_eq!(updated[0].get("max_capacity"), Some("50"));
    assert_eq!(updated[0].get("seniority"), Some("senior"));

    let cleared = rows(
        &client,
        &format!("UPDATE engineers SET seniority = NULL WHERE id = '{id}'"),
    )
    .await;
    assert_eq!(cleared[0].get("seniority"), None);
    assert_eq!(cleared[0].get("max_capacity"), Some("50"));
    assert_eq!(
        sqlstate(&client, &format!("UPDATE engineers SET name = NULL WHERE id = '{id}'")).await,
        "22023"
    );

    client
        .simple_query(&format!("DELETE FROM engineers WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM engineers WHERE id = '{id}'")).await,
        "P0002"
    );
}

#[tokio::test]
async fn capacity_scenario_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "scenario").await;
    let engineer = insert_engineer(&client, "John", 100).await;
    let project = insert_project(&client, "Platform").await;

    let a = rows(&client, &assign_sql(&engineer, &project, 60, "2024-01-15", "2024-06-15")).await;
    assert_eq!(a[0].get("engineer_name"), Some("John"));
    assert_eq!(a[0].get("engineer_skills"), Some("Rust,SQL"));
    assert_eq!(a[0].get("project_name"), Some("Platform"));

    let code = sqlstate(&client, &assign_sql(&engineer, &project, 50, "2024-03-01", "2024-07-01")).await;
    assert_eq!(code, "23514");

    rows(&client, &assign_sql(&engineer, &project, 40, "2024-03-01", "2024-07-01")).await;

    let report = rows(
        &client,
        &format!("SELECT * FROM capacity WHERE engineer_id = '{engineer}' AND as_of = '2024-04-01'"),
    )
    .await;
    assert_eq!(report[0].get("total_allocated"), Some("100"));
    assert_eq!(report[0].get("available_capacity"), Some("0"));
    let active: serde_json::Value =
        serde_json::from_str(report[0].get("active_assignments").unwrap()).unwrap();
    assert_eq!(active.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn headroom_query_does_not_write() {
    let addr = start_test_server().await;
    let client = connect(addr, "dry_run").await;
    let engineer = insert_engineer(&client, "Mike", 50).await;
    let project = insert_project(&client, "Mobile").await;
    rows(&client, &assign_sql(&engineer, &project, 30, "2024-02-01", "2024-08-01")).await;

    let ask = |allocation: u32| {
        format!(
            "SELECT * FROM headroom WHERE engineer_id = '{engineer}' AND start_date = '2024-03-01' \
             AND end_date = '2024-03-31' AND allocation = {allocation}"
        )
    };
    let fits = rows(&client, &ask(20)).await;
    assert_eq!(fits[0].get("admitted"), Some("t"));
    assert_eq!(fits[0].get("available"), Some("20"));
    let over = rows(&client, &ask(21)).await;
    assert_eq!(over[0].get("admitted"), Some("f"));

    let listed = rows(
        &client,
        &format!("SELECT * FROM assignments WHERE engineer_id = '{engineer}'"),
    )
    .await;
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn update_and_delete_assignment_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "assign_update").await;
    let engineer = insert_engineer(&client, "Ana", 100).await;
    let project = insert_project(&client, "Portal").await;
    let created = rows(&client, &assign_sql(&engineer, &project, 60, "2024-01-01", "2024-03-31")).await;
    let id = created[0].get("id").unwrap().to_string();

    let grown = rows(
        &client,
        &format!("UPDATE assignments SET allocation = 100, role = 'Lead' WHERE id = '{id}'"),
    )
    .await;
    assert_eq!(grown[0].get("allocation"), Some("100"));
    assert_eq!(grown[0].get("role"), Some("Lead"));

    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM engineers WHERE id = '{engineer}'")).await,
        "23503"
    );
    client
        .simple_query(&format!("DELETE FROM assignments WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM assignments WHERE id = '{id}'")).await,
        "P0002"
    );
}

#[tokio::test]
async fn bad_input_maps_to_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr, "errors").await;
    assert_eq!(sqlstate(&client, "SELECT * FROM payroll").await, "42P01");
    assert_eq!(sqlstate(&client, "SELECT * FROM engineers WHERE salary = 1").await, "42703");
    assert_eq!(sqlstate(&client, "SELEKT 1").await, "42601");

    let engineer = insert_engineer(&client, "Ana", 100).await;
    let project = insert_project(&client, "P").await;
    assert_eq!(
        sqlstate(&client, &assign_sql(&engineer, &project, 10, "2024-06-01", "2024-01-01")).await,
        "22023"
    );
    assert_eq!(
        sqlstate(&client, &assign_sql(&engineer, &project, 150, "2024-01-01", "2024-02-01")).await,
        "22023"
    );
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr, "extended").await;
    let engineer = insert_engineer(&client, "O'Brien", 100).await;

    let rows = client
        .query("SELECT * FROM engineers WHERE id = $1", &[&engineer])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let name: &str = rows[0].get("name");
    assert_eq!(name, "O'Brien");
}

#[tokio::test]
async fn bound_parameters_stay_data() {
    let addr = start_test_server().await;
    let client = connect(addr, "bound").await;
    let engineer = insert_engineer(&client, "Ana", 100).await;
    let project = insert_project(&client, "Budget").await;
    let created = rows(&client, &assign_sql(&engineer, &project, 50, "2024-01-01", "2024-03-31")).await;
    let id = created[0].get("id").unwrap().to_string();

    let role = "Owner of $1 budget";
    let updated = client
        .query("UPDATE assignments SET role = $2 WHERE id = $1", &[&id, &role])
        .await
        .unwrap();
    let returned: &str = updated[0].get("role");
    assert_eq!(returned, role);

    let stored = rows(&client, &format!("SELECT * FROM assignments WHERE id = '{id}'")).await;
    assert_eq!(stored[0].get("role"), Some(role));
}

#[tokio::test]
async fn capacity_defaults_to_today() {
    let addr = start_test_server().await;
    let client = connect(addr, "today").await;
    let engineer = insert_engineer(&client, "Ana", 100).await;
    let project = insert_project(&client, "Now").await;

    let now = today();
    let (start, end) = (now - Duration::days(7), now + Duration::days(7));
    rows(&client, &assign_sql(&engineer, &project, 60, &start.to_string(), &end.to_string())).await;
    rows(&client, &assign_sql(&engineer, &project, 30, "2001-01-01", "2001-12-31")).await;

    let report = rows(&client, &format!("SELECT * FROM capacity WHERE engineer_id = '{engineer}'")).await;
    let as_of: chrono::NaiveDate = report[0].get("as_of").unwrap().parse().unwrap();
    assert!((as_of - now).num_days().abs() <= 1);
    assert_eq!(report[0].get("total_allocated"), Some("60"));
    assert_eq!(report[0].get("available_capacity"), Some("40"));
    let active: serde_json::Value =
        serde_json::from_str(report[0].get("active_assignments").unwrap()).unwrap();
    assert_eq!(active.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn tenants_isolated_by_database() {
    let addr = start_test_server().await;
    let acme = connect(addr, "acme").await;
    let globex = connect(addr, "globex").await;

    insert_engineer(&acme, "Ana", 100).await;
    assert_eq!(rows(&acme, "SELECT * FROM engineers").await.len(), 1);
    assert!(rows(&globex, "SELECT * FROM engineers").await.is_empty());
}
