use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use tracing::error;

use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError, ErrorClass};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, ResultShape, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(tenants));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct SlotbookHandler {
    tenants: Arc<TenantManager>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(tenants: Arc<TenantManager>) -> Self {
        Self {
            tenants,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Tenant engine and acting identity for this session.
    fn resolve_session<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, Actor)> {
        let metadata = client.metadata();
        let user = metadata.get("user").map(String::as_str).unwrap_or_default();
        let account = self.tenants.identity().lookup(user).ok_or_else(|| {
            user_error("28000", format!("no account for user \"{user}\""))
        })?;
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let engine = self
            .tenants
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))?;
        Ok((engine, account.actor()))
    }

    async fn run(&self, engine: &Arc<Engine>, actor: Actor, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

async fn execute_command(engine: &Arc<Engine>, actor: Actor, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::PublishSchedule { rules } => {
            let rules = rules.into_iter().map(|r| r.into_rule(actor.id)).collect();
            let created = engine
                .publish_weekly_schedule(actor, rules)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(created)))
        }
        Command::InsertSlot {
            date,
            start,
            end,
            hourly_rate,
        } => {
            let range = TimeRange::new(date, start, end).map_err(|e| engine_err(e.into()))?;
            let id = engine
                .create_slot(actor, range, hourly_rate)
                .await
                .map_err(engine_err)?;
            id_response(id)
        }
        Command::DeleteSlot { id } => {
            engine.remove_slot(actor, id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertBooking {
            slot_id,
            start,
            end,
            duration_minutes,
        } => {
            let id = engine
                .book_times(actor, slot_id, start, end, duration_minutes)
                .await
                .map_err(engine_err)?;
            id_response(id)
        }
        Command::DeleteBooking { id } => {
            engine.cancel(actor, id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertReschedule {
            booking_id,
            slot_id,
            start,
            end,
        } => {
            let slot = engine.get_slot(&slot_id).map_err(engine_err)?;
            let range = TimeRange::new(slot.range.date(), start, end).map_err(|e| engine_err(e.into()))?;
            let id = engine
                .reschedule(actor, booking_id, slot_id, range)
                .await
                .map_err(engine_err)?;
            id_response(id)
        }
        Command::SelectSlots { filter } => {
            let provider_id = match (filter.provider_id, actor.role) {
                (Some(p), _) => p,
                (None, Role::Provider) => actor.id,
                (None, Role::Requester) => return Err(sql_err(SqlError::MissingFilter("provider_id"))),
            };
            let slots = engine
                .list_by_provider(&provider_id, filter.window().as_ref())
                .map_err(engine_err)?;
            slot_rows(&slots)
        }
        Command::SelectBookableSlots { filter } => {
            let slots = engine
                .list_bookable(filter.provider_id.as_ref(), filter.window().as_ref())
                .await
                .map_err(engine_err)?;
            slot_rows(&slots)
        }
        Command::SelectBookings { slot_id: None } => booking_rows(&engine.bookings_for(&actor).await),
        Command::SelectBookings {
            slot_id: Some(slot_id),
        } => {
            let slot = engine.get_slot(&slot_id).map_err(engine_err)?;
            let mut bookings = engine.list_by_slot(&slot_id).await.map_err(engine_err)?;
            // Requesters see only their own bookings on someone else's slot.
            if actor.id != slot.provider_id {
                bookings.retain(|b| b.requester_id == actor.id);
            }
            booking_rows(&bookings)
        }
        Command::SelectFreeRanges { slot_id } => {
            let ranges = engine.free_ranges(&slot_id).await.map_err(engine_err)?;
            free_range_rows(slot_id, &ranges)
        }
        Command::SelectSchedule { provider_id } => {
            let provider_id = match (provider_id, actor.role) {
                (Some(p), _) => p,
                (None, Role::Provider) => actor.id,
                (None, Role::Requester) => return Err(sql_err(SqlError::MissingFilter("provider_id"))),
            };
            schedule_rows(&engine.schedule(&provider_id))
        }
        Command::SelectProviders => provider_rows(&engine.providers_with_availability().await),
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn result_schema(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Slots => ["id", "provider_id", "date", "start", "end", "hourly_rate"]
            .into_iter()
            .map(text_field)
            .collect(),
        ResultShape::Bookings => {
            let mut fields: Vec<FieldInfo> = ["id", "slot_id", "requester_id", "date", "start", "end", "status"]
                .into_iter()
                .map(text_field)
                .collect();
            fields.push(FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text));
            fields
        }
        ResultShape::FreeRanges => ["slot_id", "date", "start", "end"].into_iter().map(text_field).collect(),
        ResultShape::Schedule => vec![
            text_field("provider_id"),
            FieldInfo::new("day_of_week".into(), None, None, Type::INT4, FieldFormat::Text),
            FieldInfo::new("enabled".into(), None, None, Type::BOOL, FieldFormat::Text),
            text_field("start"),
            text_field("end"),
            text_field("hourly_rate"),
        ],
        ResultShape::Providers | ResultShape::Id => vec![text_field("id")],
        ResultShape::None => vec![],
    }
}

fn fmt_time(t: chrono::NaiveTime) -> String {
    t.format("%H:%M:%S").to_string()
}

fn rows_response<T>(
    shape: ResultShape,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(result_schema(shape));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn id_response(id: ulid::Ulid) -> PgWireResult<Response> {
    rows_response(ResultShape::Id, &[id], |e, id| e.encode_field(&id.to_string()))
}

fn slot_rows(slots: &[AvailabilitySlot]) -> PgWireResult<Response> {
    rows_response(ResultShape::Slots, slots, |e, s| {
        e.encode_field(&s.id.to_string())?;
        e.encode_field(&s.provider_id.to_string())?;
        e.encode_field(&s.range.date().to_string())?;
        e.encode_field(&fmt_time(s.range.start()))?;
        e.encode_field(&fmt_time(s.range.end()))?;
        e.encode_field(&s.hourly_rate.to_string())
    })
}

fn booking_rows(bookings: &[Booking]) -> PgWireResult<Response> {
    rows_response(ResultShape::Bookings, bookings, |e, b| {
        e.encode_field(&b.id.to_string())?;
        e.encode_field(&b.slot_id.to_string())?;
        e.encode_field(&b.requester_id.to_string())?;
        e.encode_field(&b.range.date().to_string())?;
        e.encode_field(&fmt_time(b.range.start()))?;
        e.encode_field(&fmt_time(b.range.end()))?;
        e.encode_field(&b.status.as_str())?;
        e.encode_field(&b.created_at)
    })
}

fn free_range_rows(slot_id: SlotId, ranges: &[TimeRange]) -> PgWireResult<Response> {
    let slot_id = slot_id.to_string();
    rows_response(ResultShape::FreeRanges, ranges, |e, r| {
        e.encode_field(&slot_id)?;
        e.encode_field(&r.date().to_string())?;
        e.encode_field(&fmt_time(r.start()))?;
        e.encode_field(&fmt_time(r.end()))
    })
}

fn schedule_rows(rules: &[WeeklyScheduleRule]) -> PgWireResult<Response> {
    rows_response(ResultShape::Schedule, rules, |e, r| {
        e.encode_field(&r.provider_id.to_string())?;
        e.encode_field(&(r.day_of_week as i32))?;
        e.encode_field(&r.enabled)?;
        e.encode_field(&fmt_time(r.start))?;
        e.encode_field(&fmt_time(r.end))?;
        e.encode_field(&r.hourly_rate.to_string())
    })
}

fn provider_rows(providers: &[ActorId]) -> PgWireResult<Response> {
    rows_response(ResultShape::Providers, providers, |e, p| e.encode_field(&p.to_string()))
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, actor) = self.resolve_session(client)?;
        Ok(vec![self.run(&engine, actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(sql::describe(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let (engine, actor) = self.resolve_session(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, actor, &sql).await
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
        let fields = result_schema(sql::describe(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let fields = result_schema(sql::describe(&target.statement.statement));
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format). Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(tenants: Arc<TenantManager>) -> Self {
        let auth_source = SlotbookAuthSource::new(tenants.identity().clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(tenants)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match (e.class(), e) {
        (ErrorClass::Validation, EngineError::LimitExceeded(_)) => "54000",
        (ErrorClass::Validation, _) => "22023",
        (ErrorClass::Contention, EngineError::Timeout(_)) => "55P03",
        (ErrorClass::Contention, _) => "23P01",
        (ErrorClass::NotFound, _) => "P0002",
        (ErrorClass::Refused, EngineError::Unauthorized(_)) => "42501",
        (ErrorClass::Refused, _) => "55000",
        (ErrorClass::Internal, _) => "XX000",
    }
}

/// Code and client-facing message. Internal failures are logged here and
/// reach the client without detail.
fn error_parts(e: &EngineError) -> (&'static str, String) {
    if e.class() == ErrorClass::Internal {
        error!("internal error: {e}");
        return (sqlstate(e), "internal error".into());
    }
    (sqlstate(e), e.to_string())
}

fn engine_err(e: EngineError) -> PgWireError {
    let (code, message) = error_parts(&e);
    user_error(code, message)
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
