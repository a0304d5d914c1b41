use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{now_ms, Engine, EngineError, NewBooking};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, StartAt};

pub struct SlotkeeperHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotkeeperQueryParser>,
}

impl SlotkeeperHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotkeeperQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        let now = now_ms();
        match cmd {
            Command::SelectSlots {
                service_id,
                agent_id,
                date,
            } => {
                let slots = engine.list_slots(service_id, agent_id, date, now).await;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(service_id as i64))?;
                        encoder.encode_field(&slot.scope.agent_id().map(i64::from))?;
                        encoder.encode_field(&slot.date.format("%Y-%m-%d").to_string())?;
                        encoder.encode_field(&slot.start_time.format("%H:%M").to_string())?;
                        encoder.encode_field(&slot.end_time.format("%H:%M").to_string())?;
                        encoder.encode_field(&slot.span.start)?;
                        encoder.encode_field(&slot.span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookingById { id } => {
                let booking = engine.get_booking(&id)?;
                Ok(booking_response(&booking, None))
            }
            Command::SelectBookingByToken { token } => {
                let booking = engine.get_booking_by_token(&token)?;
                Ok(booking_response(&booking, None))
            }
            Command::InsertBooking {
                service_id,
                agent_id,
                start,
                customer_id,
                status,
            } => {
                let start = resolve_start(engine, start)?;
                let issued = engine
                    .create_booking(
                        NewBooking {
                            service_id,
                            agent_id,
                            start,
                            customer_id,
                            status,
                        },
                        now,
                    )
                    .await?;
                Ok(booking_response(&issued.booking, Some(&issued.manage_token)))
            }
            Command::CancelByToken { token } => {
                let issued = engine.cancel(&token, now).await?;
                Ok(booking_response(&issued.booking, Some(&issued.manage_token)))
            }
            Command::SetStatusByToken { token, status } => {
                let issued = engine.set_status_with_token(&token, status, now).await?;
                Ok(booking_response(&issued.booking, Some(&issued.manage_token)))
            }
            Command::RescheduleByToken { token, start } => {
                let start = resolve_start(engine, start)?;
                let issued = engine.reschedule(&token, start, now).await?;
                Ok(booking_response(&issued.booking, Some(&issued.manage_token)))
            }
            Command::TransitionById { id, status, actor } => {
                let booking = engine.transition(id, status, actor, now).await?;
                Ok(booking_response(&booking, None))
            }
            Command::CompleteElapsed { before } => {
                // Nothing that has not ended yet, whatever the client asks for.
                let completed = engine.complete_elapsed(before.min(now)).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(completed.len())))
            }
        }
    }
}

fn resolve_start(engine: &Engine, start: StartAt) -> Result<Ms, EngineError> {
    let cfg = engine.config();
    start
        .resolve(&cfg.timezone)
        .ok_or_else(|| EngineError::Validation("start does not exist in the business time zone".into()))
}

fn booking_response(booking: &BookingInfo, manage_token: Option<&str>) -> Response {
    let schema = Arc::new(booking_schema());
    let row = encode_booking(&schema, booking, manage_token);
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn encode_booking(
    schema: &Arc<Vec<FieldInfo>>,
    b: &BookingInfo,
    manage_token: Option<&str>,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&(b.service_id as i64))?;
    encoder.encode_field(&b.agent_id.map(i64::from))?;
    encoder.encode_field(&b.customer_id)?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.start)?;
    encoder.encode_field(&b.end)?;
    encoder.encode_field(&manage_token)?;
    encoder.encode_field(&b.created_at)?;
    encoder.encode_field(&b.updated_at)?;
    encoder.encode_field(&b.manage_token_last_used_at)?;
    Ok(encoder.take_row())
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("service_id", Type::INT8),
        field("agent_id", Type::INT8),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("service_id", Type::INT8),
        field("agent_id", Type::INT8),
        field("customer_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("manage_token", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
        field("manage_token_last_used_at", Type::INT8),
    ]
}

/// Row shape for a statement, judged from its text so it also works
/// before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("BOOKINGS") && !upper.contains("\"END\"") {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
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
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
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
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

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
        self.run(&sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 never eats the front of $10.
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

// ── Auth & factory ───────────────────────────────────────────────

/// One shared password for every user name.
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

pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotkeeperHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotkeeperFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// `"<code>: <message>"` under the error's own SQLSTATE.
fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        format!("{}: {e}", e.code()),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Rejection;

    #[test]
    fn count_params_takes_highest_index() {
        assert_eq!(count_params("SELECT * FROM slots WHERE service_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("UPDATE bookings SET start = $10 WHERE manage_token = $3"), 10);
        assert_eq!(count_params("SELECT '$' FROM slots"), 0);
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(result_schema("select * from slots where service_id = $1").len(), 7);
        assert_eq!(result_schema("INSERT INTO bookings VALUES ($1, $2, $3, $4)").len(), 11);
        assert!(result_schema("UPDATE bookings SET status = 'completed' WHERE \"end\" <= $1").is_empty());
    }

    #[test]
    fn engine_errors_carry_code_and_sqlstate() {
        let err = engine_err(EngineError::SlotUnavailable(Rejection::LockTimeout));
        let shown = format!("{err:?}");
        assert!(shown.contains("40001"), "{shown}");
        assert!(shown.contains("slot_unavailable: slot unavailable"), "{shown}");
    }
}
