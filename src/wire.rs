use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
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

use crate::auth::FieldbookAuthSource;
use crate::clock;
use crate::engine::{Decision, Engine, EngineError, RejectReason};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command};

pub struct FieldbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<FieldbookQueryParser>,
}

impl FieldbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(FieldbookQueryParser),
        }
    }

    async fn run(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, clock::now_utc()).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, now: DateTime<Utc>) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertField {
                id,
                name,
                price_per_hour,
                working_hours,
            } => {
                engine
                    .create_field(id, name, price_per_hour, working_hours)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteField { id } => {
                engine.delete_field(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                id,
                field_id,
                user_id,
                date,
                start,
                end,
            } => {
                let span = Span::try_new(start, end)
                    .ok_or(EngineError::InvalidTimeRange)
                    .map_err(engine_err)?;
                engine
                    .book(id, user_id, Candidate::new(field_id, date, span), now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id, now).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectFields => {
                let fields = engine.list_fields().await;
                let schema = Arc::new(fields_schema());
                let rows: Vec<PgWireResult<_>> = fields
                    .into_iter()
                    .map(|f| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&f.id.to_string())?;
                        encoder.encode_field(&f.name)?;
                        encoder.encode_field(&f.price_per_hour.to_string())?;
                        encoder.encode_field(&f.working_hours)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectFieldBookings { field_id, date } => {
                let bookings = engine
                    .confirmed_bookings(field_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(bookings_response(bookings))
            }
            Command::SelectUserBookings { user_id } => {
                Ok(bookings_response(engine.bookings_for_user(&user_id).await))
            }
            Command::SelectAvailability { field_id, date } => {
                let spans = engine
                    .compute_availability(field_id, date, now)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let fid_str = field_id.to_string();
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = spans
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&fid_str)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&span.start.to_string())?;
                        encoder.encode_field(&span.end.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAdmissibility {
                field_id,
                date,
                start,
                end,
            } => {
                let span = Span::try_new(start, end)
                    .ok_or(EngineError::InvalidTimeRange)
                    .map_err(engine_err)?;
                let decision = engine
                    .evaluate(&Candidate::new(field_id, date, span), now)
                    .await;

                let schema = Arc::new(admissibility_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                match decision {
                    Decision::Admit { price } => {
                        encoder.encode_field(&true)?;
                        encoder.encode_field(&None::<String>)?;
                        encoder.encode_field(&None::<String>)?;
                        encoder.encode_field(&Some(price.to_string()))?;
                    }
                    Decision::Reject(reason) => {
                        encoder.encode_field(&false)?;
                        encoder.encode_field(&Some(reason.code()))?;
                        encoder.encode_field(&Some(reason.to_string()))?;
                        encoder.encode_field(&None::<String>)?;
                    }
                }
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn fields_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("name"),
        varchar("price_per_hour"),
        varchar("working_hours"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("field_id"),
        varchar("user_id"),
        varchar("date"),
        varchar("start_time"),
        varchar("end_time"),
        varchar("status"),
        varchar("total_price"),
        varchar("created_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        varchar("field_id"),
        varchar("date"),
        varchar("start_time"),
        varchar("end_time"),
    ]
}

fn admissibility_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("admissible".into(), None, None, Type::BOOL, FieldFormat::Text),
        varchar("reason"),
        varchar("message"),
        varchar("price"),
    ]
}

/// Result columns for a SELECT on `table`; empty for anything else.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("fields") => fields_schema(),
        Some("bookings") => bookings_schema(),
        Some("availability") => availability_schema(),
        Some("admissibility") => admissibility_schema(),
        _ => vec![],
    }
}

fn bookings_response(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.field_id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.date.to_string())?;
            encoder.encode_field(&b.span.start.to_string())?;
            encoder.encode_field(&b.span.end.to_string())?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.total_price.to_string())?;
            encoder.encode_field(&b.created_at.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for FieldbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FieldbookQueryParser;

#[async_trait]
impl QueryParser for FieldbookQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FieldbookHandler {
    type Statement = String;
    type QueryParser = FieldbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(cmd).await
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

/// Highest `$N` placeholder in the SQL string.
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(&portal.statement.statement, &portal.parameters)
}

fn bind_text_params(sql: &str, params: &[Option<impl AsRef<[u8]>>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    // One left-to-right pass: bound values are never rescanned for placeholders.
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        let param = sql[i + 1..j]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            out.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            }
            copied = j;
        }
        i = j;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FieldbookFactory {
    handler: Arc<FieldbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<FieldbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl FieldbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = FieldbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FieldbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FieldbookFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = FieldbookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) | EngineError::Rejected(RejectReason::FieldNotFound) => "P0002",
        EngineError::Rejected(_)
        | EngineError::NotCancellable(_)
        | EngineError::AlreadyCancelled(_)
        | EngineError::HasBookings(_) => "P0001",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTimeRange
        | EngineError::InvalidSchedule(_)
        | EngineError::InvalidPrice(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
