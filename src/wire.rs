use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Weekday;
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
use ulid::Ulid;

use crate::auth::SlotdAuthSource;
use crate::engine::Engine;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
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

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        metrics::counter!(observability::QUERIES_TOTAL, "command" => observability::command_label(&cmd))
            .increment(1);

        match cmd {
            Command::UpsertSchedule { salon_id, schedule } => {
                engine
                    .set_schedule(salon_id, schedule)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectSchedule { salon_id } => {
                let (schedule, version) =
                    engine.get_schedule(salon_id).await.map_err(engine_err)?;

                let schema = Arc::new(schedule_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&salon_id.to_string())?;
                encoder.encode_field(&fmt_weekdays(&schedule.working_days))?;
                encoder.encode_field(&fmt_minutes(schedule.start_time))?;
                encoder.encode_field(&fmt_minutes(schedule.end_time))?;
                encoder.encode_field(&fmt_minutes(schedule.break_start_time))?;
                encoder.encode_field(&fmt_minutes(schedule.break_end_time))?;
                encoder.encode_field(&i32::from(schedule.slot_duration))?;
                encoder.encode_field(&(schedule.max_bookings_per_slot as i64))?;
                encoder.encode_field(&(version as i64))?;
                let rows = vec![Ok(encoder.take_row())];

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability { salon_id, date } => {
                let slots = engine
                    .availability(salon_id, date)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let sid_str = salon_id.to_string();
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&sid_str)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&fmt_minutes(slot.window.start))?;
                        encoder.encode_field(&fmt_minutes(slot.window.end))?;
                        encoder.encode_field(&(slot.remaining as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertBooking {
                id,
                salon_id,
                date,
                start,
                end,
                customer_id,
            } => {
                engine
                    .reserve(salon_id, id, customer_id, SlotWindow::new(date, start, end))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ConfirmBooking { id, customer_id } => {
                engine.confirm(id, customer_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CancelBooking { id, customer_id } => {
                engine.cancel(id, customer_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectBookings {
                salon_id,
                customer_id,
            } => {
                let mut bookings = match (salon_id, customer_id) {
                    (Some(sid), _) => engine.list_bookings(sid).await.map_err(engine_err)?,
                    (None, Some(cid)) => engine.list_customer_bookings(cid).await,
                    (None, None) => Vec::new(),
                };
                if let Some(cid) = customer_id {
                    bookings.retain(|b| b.customer_id == cid);
                }

                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.salon_id.to_string())?;
                        encoder.encode_field(&b.window.date.to_string())?;
                        encoder.encode_field(&fmt_minutes(b.window.start))?;
                        encoder.encode_field(&fmt_minutes(b.window.end))?;
                        encoder.encode_field(&b.customer_id.to_string())?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&b.held_until)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let salon_id_str = channel.strip_prefix("salon_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected salon_{{id}})"),
                    )))
                })?;
                let _salon_id = Ulid::from_string(salon_id_str).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("bad ULID in channel: {e}"),
                    )))
                })?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            // Unsubscription is per-connection bookkeeping; there is nothing
            // to tear down server-side, so just acknowledge.
            Command::Unlisten { .. } => Ok(vec![Response::Execution(Tag::new("UNLISTEN"))]),
        }
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("salon_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        FieldInfo::new("remaining".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("salon_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("customer_id"),
        text_field("status"),
        FieldInfo::new(
            "held_until".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("salon_id"),
        text_field("working_days"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("break_start_time"),
        text_field("break_end_time"),
        FieldInfo::new(
            "slot_duration".into(),
            None,
            None,
            Type::INT4,
            FieldFormat::Text,
        ),
        FieldInfo::new(
            "max_bookings_per_slot".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
        FieldInfo::new("version".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn fmt_minutes(m: Minutes) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

fn fmt_weekdays(set: &WeekdaySet) -> String {
    set.days()
        .into_iter()
        .map(|d| match d {
            Weekday::Mon => "mon",
            Weekday::Tue => "tue",
            Weekday::Wed => "wed",
            Weekday::Thu => "thu",
            Weekday::Fri => "fri",
            Weekday::Sat => "sat",
            Weekday::Sun => "sun",
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

/// Statically derived result schema for Describe, before execution.
fn result_schema_for(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("SCHEDULES") {
        schedule_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
        Ok(responses.remove(0))
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
        )))
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
                && n > max
            {
                max = n;
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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

/// Drive one client connection through the pgwire protocol machinery.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = Arc::new(SlotdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
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
