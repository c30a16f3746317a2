use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan, visit_expressions, visit_expressions_mut,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEngineer(Engineer),
    UpdateEngineer { id: Ulid, patch: EngineerPatch },
    DeleteEngineer { id: Ulid },
    InsertProject(Project),
    UpdateProject { id: Ulid, patch: ProjectPatch },
    DeleteProject { id: Ulid },
    InsertAssignment(NewAssignment),
    UpdateAssignment { id: Ulid, patch: AssignmentPatch },
    DeleteAssignment { id: Ulid },
    SelectEngineers { id: Option<Ulid> },
    SelectProjects { id: Option<Ulid> },
    SelectAssignment { id: Ulid },
    SelectAssignments { filter: AssignmentFilter },
    SelectCapacity { engineer_id: Ulid, as_of: Option<Day> },
    SelectHeadroom {
        engineer_id: Ulid,
        span: DateSpan,
        allocation: Percent,
        exclude: Option<Ulid>,
    },
}

/// Every table name the dialect knows. Also decides the row shape a
/// statement returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Engineers,
    Projects,
    Assignments,
    Capacity,
    Headroom,
}

impl Table {
    fn from_name(name: &str) -> Result<Self, SqlError> {
        match name {
            "engineers" => Ok(Table::Engineers),
            "projects" => Ok(Table::Projects),
            "assignments" => Ok(Table::Assignments),
            "capacity" => Ok(Table::Capacity),
            "headroom" => Ok(Table::Headroom),
            other => Err(SqlError::UnknownTable(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Table::Engineers => "engineers",
            Table::Projects => "projects",
            Table::Assignments => "assignments",
            Table::Capacity => "capacity",
            Table::Headroom => "headroom",
        }
    }

    /// Writable columns, in positional `VALUES` order.
    fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Engineers => &[
                "id",
                "name",
                "email",
                "max_capacity",
                "skills",
                "seniority",
                "department",
            ],
            Table::Projects => &[
                "id",
                "name",
                "description",
                "start_date",
                "end_date",
                "required_skills",
                "team_size",
                "status",
                "manager_id",
            ],
            Table::Assignments => &[
                "engineer_id",
                "project_id",
                "allocation",
                "start_date",
                "end_date",
                "role",
            ],
            Table::Capacity | Table::Headroom => &[],
        }
    }

    fn writable(self) -> Result<Self, SqlError> {
        match self {
            Table::Capacity | Table::Headroom => Err(SqlError::Unsupported(format!(
                "{} is read-only",
                self.name()
            ))),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {column} for {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{table}: {columns} columns but {values} values")]
    WrongArity {
        table: &'static str,
        columns: usize,
        values: usize,
    },
    #[error("missing value for {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value for {column}: {reason}")]
    InvalidValue { column: String, reason: String },
}

fn invalid(column: &str, reason: impl Into<String>) -> SqlError {
    SqlError::InvalidValue {
        column: column.to_string(),
        reason: reason.into(),
    }
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts)
}

/// Parse exactly one statement.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = parse_statements(sql)?;
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }
    parse_statement(&stmts[0])
}

/// Parse one statement with `$n` placeholders bound to `params[n - 1]`.
/// Bound values replace placeholder nodes in the parsed tree, so their text
/// is never read as SQL. `None` binds NULL.
pub fn parse_bound(sql: &str, params: &[Option<String>]) -> Result<Command, SqlError> {
    let mut stmts = parse_statements(sql)?;
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }
    let bound = visit_expressions_mut(&mut stmts, |expr| {
        let Some(n) = placeholder_index(expr) else {
            return ControlFlow::Continue(());
        };
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            return ControlFlow::Break(SqlError::Parse(format!("no value bound for ${n}")));
        };
        if let Expr::Value(ValueWithSpan { value, .. }) = expr {
            *value = match param {
                Some(text) => Value::SingleQuotedString(text.clone()),
                None => Value::Null,
            };
        }
        ControlFlow::Continue(())
    });
    if let ControlFlow::Break(e) = bound {
        return Err(e);
    }
    parse_statement(&stmts[0])
}

/// Number of parameters a statement takes: the highest `$n` it uses.
/// Text inside string literals is not a placeholder.
pub fn param_count(sql: &str) -> usize {
    let Ok(stmts) = parse_statements(sql) else {
        return 0;
    };
    let mut max = 0;
    let _ = visit_expressions(&stmts, |expr| {
        if let Some(n) = placeholder_index(expr) {
            max = max.max(n);
        }
        ControlFlow::<()>::Continue(())
    });
    max
}

fn placeholder_index(expr: &Expr) -> Option<usize> {
    match extract_value(expr) {
        Some(Value::Placeholder(p)) => p.strip_prefix('$')?.parse().ok(),
        _ => None,
    }
}

/// Parse a `;`-separated batch, as sent by the simple query protocol.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    parse_statements(sql)?.iter().map(parse_statement).collect()
}

/// The table whose rows a statement returns, if it returns any. Works on
/// statements with unbound `$n` placeholders.
pub fn result_table(sql: &str) -> Option<Table> {
    let stmts = parse_statements(sql).ok()?;
    let name = match stmts.first()? {
        Statement::Insert(insert) => insert_table_name(insert).ok()?,
        Statement::Update { table, .. } => table_factor_name(&table.relation).ok()?,
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        _ => return None,
    };
    Table::from_name(&name).ok()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column → value pairs of one row, checked against the table's columns.
struct Row<'a> {
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(table: Table, pairs: impl IntoIterator<Item = (String, &'a Expr)>) -> Result<Self, SqlError> {
        let mut cells = Vec::new();
        for (column, expr) in pairs {
            let known = table
                .columns()
                .iter()
                .find(|c| **c == column)
                .ok_or_else(|| SqlError::UnknownColumn {
                    table: table.name(),
                    column: column.clone(),
                })?;
            if cells.iter().any(|(c, _)| c == known) {
                return Err(invalid(known, "given twice"));
            }
            cells.push((*known, expr));
        }
        Ok(Self { cells })
    }

    /// Value for `column`, with SQL NULL read as absent.
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cell(column).filter(|e| !is_null(e))
    }

    /// Value for `column` as written, NULL included.
    fn cell(&self, column: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| *c == column).map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = Table::from_name(&insert_table_name(insert)?)?.writable()?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        table
            .columns()
            .iter()
            .take(values.len())
            .map(|c| c.to_string())
            .collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity {
            table: table.name(),
            columns: columns.len(),
            values: values.len(),
        });
    }
    let row = Row::new(table, columns.into_iter().zip(values.iter()))?;

    match table {
        Table::Engineers => {
            let id = row.get("id").map(|e| parse_ulid("id", e)).transpose()?;
            let mut engineer = Engineer::new(
                id.unwrap_or_else(Ulid::new),
                parse_text("name", row.require("name")?)?,
                parse_text("email", row.require("email")?)?,
            );
            if let Some(e) = row.get("max_capacity") {
                engineer.max_capacity = parse_percent("max_capacity", e)?;
            }
            if let Some(e) = row.get("skills") {
                engineer.skills = parse_skills("skills", e)?;
            }
            if let Some(e) = row.get("seniority") {
                engineer.seniority = Some(parse_enum("seniority", e)?);
            }
            if let Some(e) = row.get("department") {
                engineer.department = Some(parse_text("department", e)?);
            }
            Ok(Command::InsertEngineer(engineer))
        }
        Table::Projects => {
            let id = row.get("id").map(|e| parse_ulid("id", e)).transpose()?;
            let span = DateSpan::new(
                parse_day("start_date", row.require("start_date")?)?,
                parse_day("end_date", row.require("end_date")?)?,
            );
            let mut project = Project::new(
                id.unwrap_or_else(Ulid::new),
                parse_text("name", row.require("name")?)?,
                parse_text("description", row.require("description")?)?,
                span,
                parse_ulid("manager_id", row.require("manager_id")?)?,
            );
            if let Some(e) = row.get("required_skills") {
                project.required_skills = parse_skills("required_skills", e)?;
            }
            if let Some(e) = row.get("team_size") {
                project.team_size = parse_u32("team_size", e)?;
            }
            if let Some(e) = row.get("status") {
                project.status = parse_enum("status", e)?;
            }
            Ok(Command::InsertProject(project))
        }
        Table::Assignments => Ok(Command::InsertAssignment(NewAssignment {
            engineer_id: parse_ulid("engineer_id", row.require("engineer_id")?)?,
            project_id: parse_ulid("project_id", row.require("project_id")?)?,
            allocation: parse_percent("allocation", row.require("allocation")?)?,
            span: DateSpan::new(
                parse_day("start_date", row.require("start_date")?)?,
                parse_day("end_date", row.require("end_date")?)?,
            ),
            role: row
                .get("role")
                .map(|e| parse_text("role", e))
                .transpose()?
                .unwrap_or_default(),
        })),
        Table::Capacity | Table::Headroom => unreachable!("rejected by writable()"),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = Table::from_name(&table_factor_name(relation)?)?.writable()?;
    let id = extract_where_id(selection)?;

    let mut pairs = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment in SET".into()))?;
        if column == "id" {
            return Err(SqlError::Unsupported("id cannot be changed".into()));
        }
        pairs.push((column, &assignment.value));
    }
    let row = Row::new(table, pairs)?;

    match table {
        Table::Engineers => Ok(Command::UpdateEngineer {
            id,
            patch: EngineerPatch {
                name: opt(&row, "name", parse_text)?,
                email: opt(&row, "email", parse_text)?,
                max_capacity: opt(&row, "max_capacity", parse_percent)?,
                skills: opt(&row, "skills", parse_skills)?,
                seniority: nullable(&row, "seniority", parse_enum)?,
                department: nullable(&row, "department", parse_text)?,
            },
        }),
        Table::Projects => Ok(Command::UpdateProject {
            id,
            patch: ProjectPatch {
                name: opt(&row, "name", parse_text)?,
                description: opt(&row, "description", parse_text)?,
                start: opt(&row, "start_date", parse_day)?,
                end: opt(&row, "end_date", parse_day)?,
                required_skills: opt(&row, "required_skills", parse_skills)?,
                team_size: opt(&row, "team_size", parse_u32)?,
                status: opt(&row, "status", parse_enum)?,
                manager_id: opt(&row, "manager_id", parse_ulid)?,
            },
        }),
        Table::Assignments => Ok(Command::UpdateAssignment {
            id,
            patch: AssignmentPatch {
                engineer_id: opt(&row, "engineer_id", parse_ulid)?,
                project_id: opt(&row, "project_id", parse_ulid)?,
                allocation: opt(&row, "allocation", parse_percent)?,
                start: opt(&row, "start_date", parse_day)?,
                end: opt(&row, "end_date", parse_day)?,
                role: opt(&row, "role", parse_text)?,
            },
        }),
        Table::Capacity | Table::Headroom => unreachable!("rejected by writable()"),
    }
}

/// A SET value for a required column. NULL is refused.
fn opt<T>(
    row: &Row<'_>,
    column: &str,
    parse: fn(&str, &Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match row.cell(column) {
        None => Ok(None),
        Some(e) if is_null(e) => Err(invalid(column, "cannot be NULL")),
        Some(e) => parse(column, e).map(Some),
    }
}

/// A SET value for an optional column. NULL clears it.
fn nullable<T>(
    row: &Row<'_>,
    column: &str,
    parse: fn(&str, &Expr) -> Result<T, SqlError>,
) -> Result<Option<Option<T>>, SqlError> {
    match row.cell(column) {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(Some(None)),
        Some(e) => parse(column, e).map(|v| Some(Some(v))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = Table::from_name(&delete_table_name(delete)?)?.writable()?;
    let id = extract_where_id(&delete.selection)?;

    match table {
        Table::Engineers => Ok(Command::DeleteEngineer { id }),
        Table::Projects => Ok(Command::DeleteProject { id }),
        Table::Assignments => Ok(Command::DeleteAssignment { id }),
        Table::Capacity | Table::Headroom => unreachable!("rejected by writable()"),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = Table::from_name(&table_factor_name(&from.relation)?)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |column: &str| filters.iter().find(|(c, _)| c == column).map(|(_, e)| *e);
    let allow = |allowed: &[&str]| -> Result<(), SqlError> {
        match filters.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((column, _)) => Err(SqlError::UnknownColumn {
                table: table.name(),
                column: column.clone(),
            }),
            None => Ok(()),
        }
    };
    let require = |column: &'static str| filter(column).ok_or(SqlError::MissingFilter(column));

    match table {
        Table::Engineers => {
            allow(&["id"])?;
            Ok(Command::SelectEngineers {
                id: filter("id").map(|e| parse_ulid("id", e)).transpose()?,
            })
        }
        Table::Projects => {
            allow(&["id"])?;
            Ok(Command::SelectProjects {
                id: filter("id").map(|e| parse_ulid("id", e)).transpose()?,
            })
        }
        Table::Assignments => {
            allow(&["id", "engineer_id", "project_id"])?;
            if filters.len() > 1 {
                return Err(SqlError::Unsupported(
                    "assignments take at most one of id, engineer_id, project_id".into(),
                ));
            }
            match filters.first() {
                None => Ok(Command::SelectAssignments {
                    filter: AssignmentFilter::All,
                }),
                Some((column, expr)) => {
                    let id = parse_ulid(column, expr)?;
                    Ok(match column.as_str() {
                        "id" => Command::SelectAssignment { id },
                        "engineer_id" => Command::SelectAssignments {
                            filter: AssignmentFilter::Engineer(id),
                        },
                        _ => Command::SelectAssignments {
                            filter: AssignmentFilter::Project(id),
                        },
                    })
                }
            }
        }
        Table::Capacity => {
            allow(&["engineer_id", "as_of"])?;
            Ok(Command::SelectCapacity {
                engineer_id: parse_ulid("engineer_id", require("engineer_id")?)?,
                as_of: filter("as_of").map(|e| parse_day("as_of", e)).transpose()?,
            })
        }
        Table::Headroom => {
            allow(&["engineer_id", "start_date", "end_date", "allocation", "exclude_id"])?;
            Ok(Command::SelectHeadroom {
                engineer_id: parse_ulid("engineer_id", require("engineer_id")?)?,
                span: DateSpan::new(
                    parse_day("start_date", require("start_date")?)?,
                    parse_day("end_date", require("end_date")?)?,
                ),
                allocation: parse_percent("allocation", require("allocation")?)?,
                exclude: filter("exclude_id")
                    .map(|e| parse_ulid("exclude_id", e))
                    .transpose()?,
            })
        }
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            if out.iter().any(|(c, _)| *c == column) {
                return Err(invalid(&column, "filtered twice"));
            }
            out.push((column, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!(
            "WHERE supports only column = value joined by AND, got {other}"
        ))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid("id", right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Single-quoted string literal.
fn parse_text(column: &str, expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(invalid(column, format!("expected a quoted string, got {expr}"))),
    }
}

fn parse_ulid(column: &str, expr: &Expr) -> Result<Ulid, SqlError> {
    let text = parse_text(column, expr)?;
    Ulid::from_string(&text).map_err(|e| invalid(column, format!("bad ULID {text:?}: {e}")))
}

/// Non-negative integer, bare or quoted.
fn parse_u32(column: &str, expr: &Expr) -> Result<u32, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|_| invalid(column, format!("expected a non-negative integer, got {s}"))),
        _ => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                ..
            } => Err(invalid(column, "must not be negative")),
            _ => Err(invalid(column, format!("expected a number, got {expr}"))),
        },
    }
}

/// Upper bound is left to the engine so the error names the domain rule.
fn parse_percent(column: &str, expr: &Expr) -> Result<Percent, SqlError> {
    parse_u32(column, expr)
}

/// `'YYYY-MM-DD'`.
fn parse_day(column: &str, expr: &Expr) -> Result<Day, SqlError> {
    let text = parse_text(column, expr)?;
    Day::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|e| invalid(column, format!("bad date {text:?}: {e}")))
}

/// `'a, b, c'` or `ARRAY['a', 'b', 'c']`. Blank entries are dropped.
fn parse_skills(column: &str, expr: &Expr) -> Result<BTreeSet<String>, SqlError> {
    let raw: Vec<String> = match expr {
        Expr::Array(array) => array
            .elem
            .iter()
            .map(|e| parse_text(column, e))
            .collect::<Result<_, _>>()?,
        _ => parse_text(column, expr)?
            .split(',')
            .map(str::to_string)
            .collect(),
    };
    Ok(raw
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn parse_enum<T>(column: &str, expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = String>,
{
    parse_text(column, expr)?
        .parse()
        .map_err(|e: String| invalid(column, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn d(s: &str) -> Day {
        s.parse().unwrap()
    }

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    fn other() -> Ulid {
        Ulid::from_string(OTHER).unwrap()
    }

    #[test]
    fn insert_engineer_named_columns() {
        let sql = format!(
            "INSERT INTO engineers (id, name, email, max_capacity, skills, seniority, department) \
             VALUES ('{ID}', 'Mike Wilson', 'mike@company.com', 50, 'React, Vue.js,CSS', 'junior', 'Frontend')"
        );
        let Command::InsertEngineer(e) = parse_sql(&sql).unwrap() else {
            panic!("expected InsertEngineer");
        };
        assert_eq!(e.id, id());
        assert_eq!(e.name, "Mike Wilson");
        assert_eq!(e.max_capacity, 50);
        assert_eq!(
            e.skills.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["CSS", "React", "Vue.js"]
        );
        assert_eq!(e.seniority, Some(Seniority::Junior));
        assert_eq!(e.department.as_deref(), Some("Frontend"));
    }

    #[test]
    fn insert_engineer_defaults_and_minted_id() {
        let sql = "INSERT INTO engineers (name, email) VALUES ('Jane', 'jane@company.com')";
        let Command::InsertEngineer(e) = parse_sql(sql).unwrap() else {
            panic!("expected InsertEngineer");
        };
        assert_eq!(e.max_capacity, DEFAULT_MAX_CAPACITY);
        assert!(e.skills.is_empty());
        assert_eq!(e.seniority, None);
        assert_ne!(e.id, Ulid::nil());
    }

    #[test]
    fn insert_engineer_positional() {
        let sql = format!("INSERT INTO engineers VALUES ('{ID}', 'Ada', 'ada@x.io', 80)");
        let Command::InsertEngineer(e) = parse_sql(&sql).unwrap() else {
            panic!("expected InsertEngineer");
        };
        assert_eq!(e.id, id());
        assert_eq!(e.max_capacity, 80);
    }

    #[test]
    fn insert_engineer_array_skills() {
        let sql = "INSERT INTO engineers (name, email, skills) VALUES ('A', 'a@x', ARRAY['Go', 'Rust'])";
        let Command::InsertEngineer(e) = parse_sql(sql).unwrap() else {
            panic!("expected InsertEngineer");
        };
        assert!(e.skills.contains("Rust"));
        assert_eq!(e.skills.len(), 2);
    }

    #[test]
    fn insert_engineer_missing_email() {
        let sql = "INSERT INTO engineers (name) VALUES ('Ada')";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("email"))));
    }

    #[test]
    fn insert_unknown_column() {
        let sql = "INSERT INTO engineers (name, email, salary) VALUES ('A', 'a@x', 1)";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::UnknownColumn { table: "engineers", .. })
        ));
    }

    #[test]
    fn insert_arity_mismatch() {
        let sql = "INSERT INTO engineers (name, email) VALUES ('A')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity { .. })));
    }

    #[test]
    fn insert_bad_seniority() {
        let sql = "INSERT INTO engineers (name, email, seniority) VALUES ('A', 'a@x', 'principal')";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue { .. })));
    }

    #[test]
    fn insert_project() {
        let sql = format!(
            "INSERT INTO projects (name, description, start_date, end_date, required_skills, team_size, status, manager_id) \
             VALUES ('Mobile App', 'Cross-platform app', '2024-02-01', '2024-08-01', 'React Native,TypeScript', 2, 'planning', '{OTHER}')"
        );
        let Command::InsertProject(p) = parse_sql(&sql).unwrap() else {
            panic!("expected InsertProject");
        };
        assert_eq!(p.span, DateSpan::new(d("2024-02-01"), d("2024-08-01")));
        assert_eq!(p.team_size, 2);
        assert_eq!(p.status, ProjectStatus::Planning);
        assert_eq!(p.manager_id, other());
    }

    #[test]
    fn insert_project_requires_manager() {
        let sql = "INSERT INTO projects (name, description, start_date, end_date) VALUES ('P', 'd', '2024-01-01', '2024-02-01')";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("manager_id"))));
    }

    #[test]
    fn insert_assignment() {
        let sql = format!(
            "INSERT INTO assignments (engineer_id, project_id, allocation, start_date, end_date, role) \
             VALUES ('{ID}', '{OTHER}', 60, '2024-01-15', '2024-06-15', 'Tech Lead')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertAssignment(NewAssignment {
                engineer_id: id(),
                project_id: other(),
                allocation: 60,
                span: DateSpan::new(d("2024-01-15"), d("2024-06-15")),
                role: "Tech Lead".into(),
            })
        );
    }

    #[test]
    fn insert_assignment_without_role() {
        let sql = format!(
            "INSERT INTO assignments VALUES ('{ID}', '{OTHER}', 0, '2024-01-01', '2024-01-01')"
        );
        let Command::InsertAssignment(a) = parse_sql(&sql).unwrap() else {
            panic!("expected InsertAssignment");
        };
        assert_eq!(a.role, "");
        assert_eq!(a.allocation, 0);
    }

    #[test]
    fn insert_assignment_negative_allocation() {
        let sql = format!(
            "INSERT INTO assignments VALUES ('{ID}', '{OTHER}', -10, '2024-01-01', '2024-01-31')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue { .. })));
    }

    #[test]
    fn insert_assignment_bad_date() {
        let sql = format!(
            "INSERT INTO assignments VALUES ('{ID}', '{OTHER}', 10, '2024-13-01', '2024-01-31')"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.to_string().contains("start_date"), "{err}");
    }

    #[test]
    fn insert_assignment_rejects_id_column() {
        let sql = format!(
            "INSERT INTO assignments (id, engineer_id) VALUES ('{ID}', '{ID}')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn { .. })));
    }

    #[test]
    fn insert_into_read_only_table() {
        let sql = format!("INSERT INTO capacity VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_assignment_patch() {
        let sql = format!(
            "UPDATE assignments SET allocation = 40, end_date = '2024-12-31' WHERE id = '{ID}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateAssignment {
                id: id(),
                patch: AssignmentPatch {
                    allocation: Some(40),
                    end: Some(d("2024-12-31")),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn update_engineer_capacity() {
        let sql = format!("UPDATE engineers SET max_capacity = 50, seniority = 'senior' WHERE id = '{ID}'");
        let Command::UpdateEngineer { id: target, patch } = parse_sql(&sql).unwrap() else {
            panic!("expected UpdateEngineer");
        };
        assert_eq!(target, id());
        assert_eq!(patch.max_capacity, Some(50));
        assert_eq!(patch.seniority, Some(Some(Seniority::Senior)));
        assert_eq!(patch.name, None);
    }

    #[test]
    fn update_null_clears_optional_columns() {
        let sql = format!("UPDATE engineers SET department = NULL, seniority = NULL WHERE id = '{ID}'");
        let Command::UpdateEngineer { patch, .. } = parse_sql(&sql).unwrap() else {
            panic!("expected UpdateEngineer");
        };
        assert_eq!(patch.department, Some(None));
        assert_eq!(patch.seniority, Some(None));
    }

    #[test]
    fn update_null_rejected_for_required_columns() {
        for sql in [
            format!("UPDATE engineers SET email = NULL WHERE id = '{ID}'"),
            format!("UPDATE projects SET status = NULL WHERE id = '{ID}'"),
            format!("UPDATE assignments SET allocation = NULL WHERE id = '{ID}'"),
        ] {
            assert!(
                matches!(parse_sql(&sql), Err(SqlError::InvalidValue { .. })),
                "{sql}"
            );
        }
    }

    #[test]
    fn bound_text_is_never_read_as_sql() {
        let params = [Some(ID.to_string()), Some("Owner of $1 budget, it's 'quoted'".to_string())];
        let cmd = parse_bound("UPDATE assignments SET role = $2 WHERE id = $1", &params).unwrap();
        let Command::UpdateAssignment { id: target, patch } = cmd else {
            panic!("expected UpdateAssignment");
        };
        assert_eq!(target, id());
        assert_eq!(patch.role.as_deref(), Some("Owner of $1 budget, it's 'quoted'"));
    }

    #[test]
    fn placeholder_text_in_literals_is_left_alone() {
        let sql = "UPDATE assignments SET role = 'costs $1' WHERE id = $1";
        assert_eq!(param_count(sql), 1);
        let Command::UpdateAssignment { patch, .. } = parse_bound(sql, &[Some(ID.to_string())]).unwrap() else {
            panic!("expected UpdateAssignment");
        };
        assert_eq!(patch.role.as_deref(), Some("costs $1"));
    }

    #[test]
    fn bound_numbers_and_nulls() {
        let params = [
            Some(ID.to_string()),
            Some(OTHER.to_string()),
            Some("60".to_string()),
            Some("2024-01-15".to_string()),
            Some("2024-06-15".to_string()),
            None,
        ];
        let sql = "INSERT INTO assignments (engineer_id, project_id, allocation, start_date, end_date, role) \
                   VALUES ($1, $2, $3, $4, $5, $6)";
        let Command::InsertAssignment(a) = parse_bound(sql, &params).unwrap() else {
            panic!("expected InsertAssignment");
        };
        assert_eq!(a.engineer_id, id());
        assert_eq!(a.project_id, other());
        assert_eq!(a.allocation, 60);
        assert_eq!(a.span, DateSpan::new(d("2024-01-15"), d("2024-06-15")));
        assert_eq!(a.role, "");
    }

    #[test]
    fn unbound_placeholder_is_an_error() {
        let sql = "SELECT * FROM engineers WHERE id = $2";
        assert!(matches!(parse_bound(sql, &[Some(ID.to_string())]), Err(SqlError::Parse(_))));
    }

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(param_count("SELECT * FROM engineers"), 0);
        assert_eq!(param_count("UPDATE engineers SET name = $2 WHERE id = $1"), 2);
        assert_eq!(param_count("INSERT INTO assignments VALUES ($1, $2, $3, $4, $5, $10)"), 10);
        assert_eq!(param_count("SELECT * FROM engineers WHERE id = '$7'"), 0);
        assert_eq!(param_count("not sql at all"), 0);
    }

    #[test]
    fn update_project_status() {
        let sql = format!("UPDATE projects SET status = 'completed' WHERE id = '{ID}'");
        let Command::UpdateProject { patch, .. } = parse_sql(&sql).unwrap() else {
            panic!("expected UpdateProject");
        };
        assert_eq!(patch.status, Some(ProjectStatus::Completed));
    }

    #[test]
    fn update_requires_where_id() {
        let sql = "UPDATE assignments SET allocation = 40";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn update_id_rejected() {
        let sql = format!("UPDATE engineers SET id = '{OTHER}' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn delete_each_table() {
        for (table, expected) in [
            ("engineers", Command::DeleteEngineer { id: id() }),
            ("projects", Command::DeleteProject { id: id() }),
            ("assignments", Command::DeleteAssignment { id: id() }),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id = '{ID}'");
            assert_eq!(parse_sql(&sql).unwrap(), expected);
        }
    }

    #[test]
    fn select_catalogs() {
        assert_eq!(
            parse_sql("SELECT * FROM engineers").unwrap(),
            Command::SelectEngineers { id: None }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM projects WHERE id = '{ID}'")).unwrap(),
            Command::SelectProjects { id: Some(id()) }
        );
    }

    #[test]
    fn select_assignments_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM assignments").unwrap(),
            Command::SelectAssignments {
                filter: AssignmentFilter::All
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM assignments WHERE engineer_id = '{ID}'")).unwrap(),
            Command::SelectAssignments {
                filter: AssignmentFilter::Engineer(id())
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM assignments WHERE project_id = '{ID}'")).unwrap(),
            Command::SelectAssignments {
                filter: AssignmentFilter::Project(id())
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM assignments WHERE id = '{ID}'")).unwrap(),
            Command::SelectAssignment { id: id() }
        );
    }

    #[test]
    fn select_assignments_single_filter_only() {
        let sql = format!("SELECT * FROM assignments WHERE engineer_id = '{ID}' AND project_id = '{OTHER}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn select_capacity() {
        let sql = format!("SELECT * FROM capacity WHERE engineer_id = '{ID}' AND as_of = '2024-03-15'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectCapacity {
                engineer_id: id(),
                as_of: Some(d("2024-03-15")),
            }
        );
        let sql = format!("SELECT * FROM capacity WHERE engineer_id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectCapacity {
                engineer_id: id(),
                as_of: None,
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM capacity"),
            Err(SqlError::MissingFilter("engineer_id"))
        ));
    }

    #[test]
    fn select_headroom() {
        let sql = format!(
            "SELECT * FROM headroom WHERE engineer_id = '{ID}' AND start_date = '2024-01-01' \
             AND end_date = '2024-06-30' AND allocation = 41 AND exclude_id = '{OTHER}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectHeadroom {
                engineer_id: id(),
                span: DateSpan::new(d("2024-01-01"), d("2024-06-30")),
                allocation: 41,
                exclude: Some(other()),
            }
        );
    }

    #[test]
    fn select_headroom_missing_window() {
        let sql = format!("SELECT * FROM headroom WHERE engineer_id = '{ID}' AND allocation = 10");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("start_date"))));
    }

    #[test]
    fn select_unsupported_operator() {
        let sql = format!("SELECT * FROM capacity WHERE engineer_id = '{ID}' OR as_of = '2024-01-01'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn select_unknown_filter_column() {
        let sql = "SELECT * FROM engineers WHERE name = 'Ada'";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn { .. })));
    }

    #[test]
    fn unknown_table() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::UnknownTable(t)) if t == "bookings"
        ));
    }

    #[test]
    fn batch_and_single() {
        let sql = format!("DELETE FROM engineers WHERE id = '{ID}'; SELECT * FROM projects");
        assert_eq!(parse_batch(&sql).unwrap().len(), 2);
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn empty_and_garbage() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEKT nonsense"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn result_table_with_placeholders() {
        assert_eq!(
            result_table("SELECT * FROM capacity WHERE engineer_id = $1"),
            Some(Table::Capacity)
        );
        assert_eq!(
            result_table("INSERT INTO assignments VALUES ($1, $2, $3, $4, $5)"),
            Some(Table::Assignments)
        );
        assert_eq!(
            result_table("UPDATE engineers SET name = $1 WHERE id = $2"),
            Some(Table::Engineers)
        );
        assert_eq!(result_table("DELETE FROM projects WHERE id = $1"), None);
        assert_eq!(result_table("SELECT * FROM nowhere"), None);
    }
}
