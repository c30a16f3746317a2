use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "headroom_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "headroom_query_duration_seconds";

/// Counter: capacity admission decisions on assignment writes. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "headroom_admissions_total";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "headroom_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "headroom_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "headroom_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "headroom_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "headroom_wal_flush_duration_seconds";

/// Histogram: events per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "headroom_wal_flush_batch_size";

/// Counter: WAL compactions run. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "headroom_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Short label for a command in query metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEngineer(_) => "insert_engineer",
        Command::UpdateEngineer { .. } => "update_engineer",
        Command::DeleteEngineer { .. } => "delete_engineer",
        Command::InsertProject(_) => "insert_project",
        Command::UpdateProject { .. } => "update_project",
        Command::DeleteProject { .. } => "delete_project",
        Command::InsertAssignment(_) => "insert_assignment",
        Command::UpdateAssignment { .. } => "update_assignment",
        Command::DeleteAssignment { .. } => "delete_assignment",
        Command::SelectEngineers { .. } => "select_engineers",
        Command::SelectProjects { .. } => "select_projects",
        Command::SelectAssignment { .. } | Command::SelectAssignments { .. } => "select_assignments",
        Command::SelectCapacity { .. } => "select_capacity",
        Command::SelectHeadroom { .. } => "select_headroom",
    }
}
