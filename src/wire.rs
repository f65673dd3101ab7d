use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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

use crate::auth::ReservdAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct ReservdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ReservdQueryParser>,
}

impl ReservdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ReservdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let owner = session_owner(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, &owner, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        owner: &str,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let now = now_ms();
        match cmd {
            Command::InsertReservation {
                id,
                resource_id,
                start,
                end,
                ttl_ms,
                metadata,
                returning,
            } => {
                let req = ReserveRequest {
                    id,
                    resource_id,
                    owner_id: owner.to_string(),
                    start,
                    end,
                    ttl_ms,
                    metadata,
                };
                let r = engine.reserve(req, now).await.map_err(engine_err)?;
                if returning {
                    reservation_rows(vec![r], format)
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::Confirm {
                id,
                appointment_id,
                returning,
            } => {
                let r = engine
                    .confirm(id, owner, &appointment_id, now)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    reservation_rows(vec![r], format)
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::Cancel { id, returning } => {
                let r = engine.cancel(id, owner, now).await.map_err(engine_err)?;
                if returning {
                    reservation_rows(vec![r], format)
                } else {
                    Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
                }
            }
            Command::Cleanup { older_than_ms } => {
                let deleted = engine
                    .cleanup_expired(older_than_ms, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(deleted)))
            }
            Command::SelectReservations { mut filter } => {
                filter.owner_id = Some(owner.to_string());
                let rows = engine.list_reservations(&filter, now).await;
                reservation_rows(rows, format)
            }
            Command::SelectConflicts {
                resource_id,
                start,
                end,
                exclude,
            } => {
                let rows = engine
                    .find_conflicts(&resource_id, start, end, exclude, now)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(rows, format)
            }
            Command::SelectSlots {
                resource_id,
                start,
                end,
                duration,
                step,
            } => {
                let slots = engine
                    .enumerate_slots(&resource_id, start, end, duration, step, now)
                    .await
                    .map_err(engine_err)?;
                slot_rows(&resource_id, slots, format)
            }
        }
    }
}

/// The login user owns every reservation made on the session.
fn session_owner<C: ClientInfo>(client: &C) -> PgWireResult<String> {
    client
        .metadata()
        .get("user")
        .filter(|u| !u.trim().is_empty())
        .cloned()
        .ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "28000".into(),
                "session has no user".into(),
            )))
        })
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type, idx: usize, format: Option<&Format>) -> FieldInfo {
    let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(idx));
    FieldInfo::new(name.into(), None, None, ty, field_format)
}

const RESERVATION_COLUMNS: [(&str, Type); 12] = [
    ("id", Type::VARCHAR),
    ("resource_id", Type::VARCHAR),
    ("owner_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("status", Type::VARCHAR),
    ("appointment_id", Type::VARCHAR),
    ("ttl", Type::INT8),
    ("expires_at", Type::INT8),
    ("metadata", Type::VARCHAR),
    ("created_at", Type::INT8),
    ("updated_at", Type::INT8),
];

const SLOT_COLUMNS: [(&str, Type); 4] = [
    ("resource_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("duration", Type::INT8),
];

fn schema(columns: &[(&str, Type)], format: Option<&Format>) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| field(name, ty.clone(), i, format))
        .collect()
}

fn reservation_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    schema(&RESERVATION_COLUMNS, format)
}

fn slot_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    schema(&SLOT_COLUMNS, format)
}

/// Row shape a statement produces, judged from its text alone (parameters
/// may still be unbound).
fn describe(sql: &str) -> Vec<FieldInfo> {
    describe_with_format(sql, None)
}

fn describe_with_format(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    let upper = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if upper.starts_with("SELECT") && upper.contains("FROM SLOTS") {
        slot_schema(format)
    } else if upper.starts_with("SELECT") || upper.contains("RETURNING") {
        reservation_schema(format)
    } else {
        vec![]
    }
}

fn reservation_rows(rows: Vec<Reservation>, format: Option<&Format>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema(format));
    let encoded: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|r| {
            let metadata = serde_json::to_string(&r.metadata)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_id)?;
            encoder.encode_field(&r.owner_id)?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.appointment_id)?;
            encoder.encode_field(&r.ttl_ms)?;
            encoder.encode_field(&r.expires_at())?;
            encoder.encode_field(&metadata)?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(encoded))))
}

fn slot_rows(resource_id: &str, slots: Vec<Slot>, format: Option<&Format>) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema(format));
    let encoded: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&resource_id)?;
            encoder.encode_field(&slot.start)?;
            encoder.encode_field(&slot.end)?;
            encoder.encode_field(&slot.duration_ms())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(encoded))))
}

#[async_trait]
impl SimpleQueryHandler for ReservdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReservdQueryParser;

#[async_trait]
impl QueryParser for ReservdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_with_format(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservdHandler {
    type Statement = String;
    type QueryParser = ReservdQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql, Some(&portal.result_column_format)).await
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
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, describe(&target.statement)))
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
        Ok(DescribePortalResponse::new(describe_with_format(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// `$N` placeholders outside single-quoted literals, as
/// `(byte start, byte end, N)` in statement order.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // '' inside a literal toggles twice and stays inside
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start
                    && let Ok(n) = sql[start..end].parse::<usize>()
                {
                    found.push((i, end, n));
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &values)
}

/// One pass over the statement; bound values are emitted as literals and never
/// rescanned. Placeholders with no bound value are left as written.
fn substitute(sql: &str, values: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut last = 0;
    for (start, end, n) in placeholders(sql) {
        result.push_str(&sql[last..start]);
        match n.checked_sub(1).and_then(|i| values.get(i)) {
            Some(Some(text)) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&sql[start..end]),
        }
        last = end;
    }
    result.push_str(&sql[last..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservdFactory {
    handler: Arc<ReservdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ReservdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ReservdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ReservdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservdFactory {
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
) -> std::io::Result<()> {
    let factory = Arc::new(ReservdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::NotFound(_) => "P0002",
        EngineError::Expired(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::Unsupported(_) => "0A000",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::MissingColumn(_)
        | SqlError::WrongArity(..)
        | SqlError::MissingFilter(_) => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sql_sqlstate(&e).into(),
        e.to_string(),
    )))
}
