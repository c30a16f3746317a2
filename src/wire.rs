use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{Engine, EngineError, today};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError, Table};
use crate::tenant::TenantManager;

pub struct HeadroomHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<HeadroomQueryParser>,
}

impl HeadroomHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(HeadroomQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Run one command and record its latency and outcome.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertEngineer(engineer) => {
                let created = engine.create_engineer(engineer).await.map_err(engine_err)?;
                Ok(rows(Table::Engineers, vec![created], encode_engineer))
            }
            Command::UpdateEngineer { id, patch } => {
                let updated = engine.update_engineer(id, patch).await.map_err(engine_err)?;
                Ok(rows(Table::Engineers, vec![updated], encode_engineer))
            }
            Command::DeleteEngineer { id } => {
                engine.delete_engineer(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertProject(project) => {
                let created = engine.create_project(project).await.map_err(engine_err)?;
                Ok(rows(Table::Projects, vec![created], encode_project))
            }
            Command::UpdateProject { id, patch } => {
                let updated = engine.update_project(id, patch).await.map_err(engine_err)?;
                Ok(rows(Table::Projects, vec![updated], encode_project))
            }
            Command::DeleteProject { id } => {
                engine.delete_project(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAssignment(new) => {
                let view = engine.create_assignment(new).await.map_err(engine_err)?;
                Ok(rows(Table::Assignments, vec![view], encode_assignment))
            }
            Command::UpdateAssignment { id, patch } => {
                let view = engine.update_assignment(id, patch).await.map_err(engine_err)?;
                Ok(rows(Table::Assignments, vec![view], encode_assignment))
            }
            Command::DeleteAssignment { id } => {
                engine.delete_assignment(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectEngineers { id } => {
                let engineers = match id {
                    Some(id) => vec![engine.get_engineer(&id).await.map_err(engine_err)?],
                    None => engine.list_engineers().await,
                };
                Ok(rows(Table::Engineers, engineers, encode_engineer))
            }
            Command::SelectProjects { id } => {
                let projects = match id {
                    Some(id) => vec![engine.get_project(&id).map_err(engine_err)?],
                    None => engine.list_projects(),
                };
                Ok(rows(Table::Projects, projects, encode_project))
            }
            Command::SelectAssignment { id } => {
                let view = engine.get_assignment(&id).await.map_err(engine_err)?;
                Ok(rows(Table::Assignments, vec![view], encode_assignment))
            }
            Command::SelectAssignments { filter } => {
                let views = engine.list_assignments(filter).await.map_err(engine_err)?;
                Ok(rows(Table::Assignments, views, encode_assignment))
            }
            Command::SelectCapacity { engineer_id, as_of } => {
                let report = engine
                    .capacity_report(&engineer_id, as_of.unwrap_or_else(today))
                    .await
                    .map_err(engine_err)?;
                Ok(rows(Table::Capacity, vec![report], encode_capacity))
            }
            Command::SelectHeadroom {
                engineer_id,
                span,
                allocation,
                exclude,
            } => {
                let admission = engine
                    .check_allocation(&engineer_id, allocation, &span, exclude)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(
                    Table::Headroom,
                    vec![(engineer_id, span, admission)],
                    encode_headroom,
                ))
            }
        }
    }
}

// ── Row schemas and encoding ─────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

pub fn schema(table: Table) -> Vec<FieldInfo> {
    match table {
        Table::Engineers => vec![
            text("id"),
            text("name"),
            text("email"),
            int("max_capacity"),
            text("skills"),
            text("seniority"),
            text("department"),
            int("created_at"),
            int("updated_at"),
        ],
        Table::Projects => vec![
            text("id"),
            text("name"),
            text("description"),
            text("start_date"),
            text("end_date"),
            text("required_skills"),
            int("team_size"),
            text("status"),
            text("manager_id"),
            int("created_at"),
            int("updated_at"),
        ],
        Table::Assignments => vec![
            text("id"),
            text("engineer_id"),
            text("project_id"),
            int("allocation"),
            text("start_date"),
            text("end_date"),
            text("role"),
            text("engineer_name"),
            text("engineer_email"),
            text("engineer_skills"),
            text("project_name"),
            text("project_description"),
            int("created_at"),
            int("updated_at"),
        ],
        Table::Capacity => vec![
            text("engineer_id"),
            text("name"),
            int("max_capacity"),
            int("total_allocated"),
            int("available_capacity"),
            text("as_of"),
            text("active_assignments"),
        ],
        Table::Headroom => vec![
            text("engineer_id"),
            text("start_date"),
            text("end_date"),
            int("requested"),
            int("total_allocated"),
            int("available"),
            boolean("admitted"),
        ],
    }
}

type Encode<T> = fn(&mut DataRowEncoder, &T) -> PgWireResult<()>;

fn rows<T>(table: Table, items: Vec<T>, encode: Encode<T>) -> Response {
    let schema = Arc::new(schema(table));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn join_skills(skills: &std::collections::BTreeSet<String>) -> String {
    skills.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

fn encode_engineer(encoder: &mut DataRowEncoder, e: &Engineer) -> PgWireResult<()> {
    encoder.encode_field(&e.id.to_string())?;
    encoder.encode_field(&e.name)?;
    encoder.encode_field(&e.email)?;
    encoder.encode_field(&i64::from(e.max_capacity))?;
    encoder.encode_field(&join_skills(&e.skills))?;
    encoder.encode_field(&e.seniority.map(|s| s.as_str().to_string()))?;
    encoder.encode_field(&e.department)?;
    encoder.encode_field(&e.created_at)?;
    encoder.encode_field(&e.updated_at)
}

fn encode_project(encoder: &mut DataRowEncoder, p: &Project) -> PgWireResult<()> {
    encoder.encode_field(&p.id.to_string())?;
    encoder.encode_field(&p.name)?;
    encoder.encode_field(&p.description)?;
    encoder.encode_field(&p.span.start.to_string())?;
    encoder.encode_field(&p.span.end.to_string())?;
    encoder.encode_field(&join_skills(&p.required_skills))?;
    encoder.encode_field(&i64::from(p.team_size))?;
    encoder.encode_field(&p.status.as_str().to_string())?;
    encoder.encode_field(&p.manager_id.to_string())?;
    encoder.encode_field(&p.created_at)?;
    encoder.encode_field(&p.updated_at)
}

fn encode_assignment(encoder: &mut DataRowEncoder, v: &AssignmentView) -> PgWireResult<()> {
    let a = &v.assignment;
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.engineer_id.to_string())?;
    encoder.encode_field(&a.project_id.to_string())?;
    encoder.encode_field(&i64::from(a.allocation))?;
    encoder.encode_field(&a.span.start.to_string())?;
    encoder.encode_field(&a.span.end.to_string())?;
    encoder.encode_field(&a.role)?;
    encoder.encode_field(&v.engineer_name)?;
    encoder.encode_field(&v.engineer_email)?;
    encoder.encode_field(&join_skills(&v.engineer_skills))?;
    encoder.encode_field(&v.project_name)?;
    encoder.encode_field(&v.project_description)?;
    encoder.encode_field(&a.created_at)?;
    encoder.encode_field(&a.updated_at)
}

fn encode_capacity(encoder: &mut DataRowEncoder, r: &CapacityReport) -> PgWireResult<()> {
    let active = serde_json::to_string(&r.active_assignments)
        .map_err(|e| user_error("XX000", format!("encoding active assignments: {e}")))?;
    encoder.encode_field(&r.engineer_id.to_string())?;
    encoder.encode_field(&r.name)?;
    encoder.encode_field(&i64::from(r.max_capacity))?;
    encoder.encode_field(&i64::from(r.total_allocated))?;
    encoder.encode_field(&r.available_capacity)?;
    encoder.encode_field(&r.as_of.to_string())?;
    encoder.encode_field(&active)
}

fn encode_headroom(
    encoder: &mut DataRowEncoder,
    (engineer_id, span, admission): &(ulid::Ulid, DateSpan, Admission),
) -> PgWireResult<()> {
    encoder.encode_field(&engineer_id.to_string())?;
    encoder.encode_field(&span.start.to_string())?;
    encoder.encode_field(&span.end.to_string())?;
    encoder.encode_field(&i64::from(admission.requested))?;
    encoder.encode_field(&i64::from(admission.total_allocated))?;
    encoder.encode_field(&admission.available)?;
    encoder.encode_field(&admission.admitted)
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for HeadroomHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct HeadroomQueryParser;

#[async_trait]
impl QueryParser for HeadroomQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; sql::param_count(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    sql::result_table(sql).map(schema).unwrap_or_default()
}

#[async_trait]
impl ExtendedQueryHandler for HeadroomHandler {
    type Statement = String;
    type QueryParser = HeadroomQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let params = bound_text(portal);
        debug!("extended query: {} with {} params", portal.statement.statement, params.len());
        let cmd = sql::parse_bound(&portal.statement.statement, &params).map_err(sql_err)?;
        self.run(&engine, cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; sql::param_count(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Bound parameters as text. The extended protocol here only speaks the
/// text format.
fn bound_text(portal: &Portal<String>) -> Vec<Option<String>> {
    portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect()
}

// ── Startup and factory ──────────────────────────────────────────

/// Every user authenticates with the server's one shared password.
#[derive(Debug)]
pub struct SharedPassword {
    password: String,
}

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct HeadroomFactory {
    handler: Arc<HeadroomHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl HeadroomFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(HeadroomHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for HeadroomFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(HeadroomFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure.
pub fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists { .. } => "23505",
        EngineError::CapacityExceeded { .. } => "23514",
        EngineError::Validation(_) => "22023",
        EngineError::HasAssignments { .. } => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

pub fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn { .. } => "42703",
        SqlError::InvalidValue { .. } => "22023",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::Unsupported(_)
        | SqlError::WrongArity { .. }
        | SqlError::MissingColumn(_)
        | SqlError::MissingFilter(_) => "42601",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
