use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::{IdentityProvider, RoomdStartupHandler};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct RoomdHandler {
    engine: Arc<Engine>,
    identities: Arc<dyn IdentityProvider>,
    query_parser: Arc<RoomdQueryParser>,
}

impl RoomdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            identities: engine.clone(),
            engine,
            query_parser: Arc::new(RoomdQueryParser),
        }
    }

    /// Identity is re-read on every query so deactivation and role changes
    /// apply to open connections.
    async fn resolve_identity<C: ClientInfo>(&self, client: &C) -> PgWireResult<Identity> {
        let login = client.metadata().get("user").cloned();
        self.identities
            .current_identity(login.as_deref())
            .await
            .map_err(engine_err)
    }

    async fn run(&self, identity: &Identity, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(identity, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => {
                debug!("{label} by user {} failed: {e}", identity.id);
                e.kind()
            }
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, identity: &Identity, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom { name, description } => {
                let room = engine.create_room(identity, name, description).await?;
                Ok(room_rows(vec![room]))
            }
            Command::SelectRooms { id: None } => Ok(room_rows(engine.list_rooms(identity).await?)),
            Command::SelectRooms { id: Some(id) } => Ok(room_rows(vec![engine.get_room(identity, id).await?])),
            Command::UpdateRoom { id, patch } => {
                let room = engine.update_room(identity, id, patch).await?;
                Ok(room_rows(vec![room]))
            }
            Command::DeleteRoom { id } => {
                let room = engine.delete_room(identity, id).await?;
                Ok(room_rows(vec![room]))
            }
            Command::InsertReservation {
                room_id,
                from_reserve,
                to_reserve,
            } => {
                let r = engine
                    .create_reservation(identity, room_id, from_reserve, to_reserve)
                    .await?;
                Ok(reservation_rows(vec![r], OwnerColumn::Shown))
            }
            Command::SelectReservations { room_id: Some(room_id) } => {
                let found = engine.list_future_reservations_for_room(identity, room_id).await?;
                Ok(reservation_rows(found, OwnerColumn::Hidden))
            }
            Command::SelectReservations { room_id: None } => {
                let found = engine.list_all_reservations(identity).await?;
                Ok(reservation_rows(found, OwnerColumn::Shown))
            }
            Command::SelectMyReservations => {
                let found = engine.list_my_reservations(identity).await?;
                Ok(reservation_rows(found, OwnerColumn::Shown))
            }
            Command::UpdateReservation { id, patch } => {
                let r = engine.update_reservation(identity, id, patch).await?;
                Ok(reservation_rows(vec![r], OwnerColumn::Shown))
            }
            Command::DeleteReservation { id } => {
                let r = engine.delete_reservation(identity, id).await?;
                Ok(reservation_rows(vec![r], OwnerColumn::Shown))
            }
            Command::InsertUser {
                email,
                password,
                is_superuser,
            } => {
                let user = engine.register_user(identity, email, password, is_superuser).await?;
                Ok(user_rows(vec![user]))
            }
            Command::SelectUsers { id: None } => Ok(user_rows(engine.list_users(identity)?)),
            Command::SelectUsers { id: Some(id) } => Ok(user_rows(vec![engine.get_user(identity, id)?])),
            Command::UpdateUser { id, patch } => {
                let user = engine.update_user(identity, id, patch).await?;
                Ok(user_rows(vec![user]))
            }
        }
    }
}

// ── Row shapes ───────────────────────────────────────────────────

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn room_schema() -> Vec<FieldInfo> {
    vec![int8("id"), varchar("name"), varchar("description")]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        int8("id"),
        int8("from_reserve"),
        int8("to_reserve"),
        int8("meetingroom_id"),
        int8("user_id"),
    ]
}

/// Passwords never leave the server.
fn user_schema() -> Vec<FieldInfo> {
    vec![int8("id"), varchar("email"), boolean("is_active"), boolean("is_superuser")]
}

/// Row schema for whatever table `sql` targets.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::statement_table(sql).as_deref() {
        Some(sql::ROOMS) => room_schema(),
        Some(sql::RESERVATIONS) | Some(sql::MY_RESERVATIONS) => reservation_schema(),
        Some(sql::USERS) => user_schema(),
        _ => vec![],
    }
}

fn encode_rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
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

fn room_rows(rooms: Vec<Room>) -> Response {
    encode_rows(room_schema(), rooms, |enc, room| {
        enc.encode_field(&room.id)?;
        enc.encode_field(&room.name)?;
        enc.encode_field(&room.description)
    })
}

#[derive(Clone, Copy)]
enum OwnerColumn {
    Shown,
    /// The per-room schedule is public within the service; owners are not.
    Hidden,
}

fn reservation_rows(reservations: Vec<Reservation>, owner: OwnerColumn) -> Response {
    encode_rows(reservation_schema(), reservations, move |enc, r| {
        enc.encode_field(&r.id)?;
        enc.encode_field(&r.from_reserve())?;
        enc.encode_field(&r.to_reserve())?;
        enc.encode_field(&r.room_id)?;
        let user_id = match owner {
            OwnerColumn::Shown => Some(r.owner_id),
            OwnerColumn::Hidden => None,
        };
        enc.encode_field(&user_id)
    })
}

fn user_rows(users: Vec<User>) -> Response {
    encode_rows(user_schema(), users, |enc, user| {
        enc.encode_field(&user.id)?;
        enc.encode_field(&user.email)?;
        enc.encode_field(&user.is_active)?;
        enc.encode_field(&user.is_superuser)
    })
}

#[async_trait]
impl SimpleQueryHandler for RoomdHandler {
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
        let identity = self.resolve_identity(client).await?;
        Ok(vec![self.run(&identity, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomdQueryParser;

#[async_trait]
impl QueryParser for RoomdQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomdHandler {
    type Statement = String;
    type QueryParser = RoomdQueryParser;

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
        let identity = self.resolve_identity(client).await?;
        let sql = substitute_params(portal);
        self.run(&identity, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// `$N` placeholders in statement order as (byte range, N). Text inside
/// single-quoted literals is skipped.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

fn substitute_params(portal: &Portal<String>) -> String {
    substitute_text_params(&portal.statement.statement, &portal.parameters)
}

/// Replace each placeholder with its bound value (text format) in one pass
/// over the statement. Bound values are never rescanned. Indices with no
/// bound value stay as written and fail to parse later.
fn substitute_text_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomdFactory {
    handler: Arc<RoomdHandler>,
    auth_handler: Arc<RoomdStartupHandler<DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomdFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            auth_handler: Arc::new(RoomdStartupHandler::new(engine.clone(), param_provider)),
            handler: Arc::new(RoomdHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomdFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, RoomdFactory::new(engine)).await
}

// ── Errors ───────────────────────────────────────────────────────

pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound { .. } => "P0002",
        EngineError::DuplicateName(_) | EngineError::DuplicateEmail(_) => "23505",
        EngineError::IntervalConflict { .. } => "23P01",
        EngineError::IntervalInvalid(_) => "23514",
        EngineError::Forbidden(_) => "42501",
        EngineError::Unauthenticated => "28000",
        EngineError::Invalid(_) => "22023",
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

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::ReadOnlyColumn(_) => "428C9",
        SqlError::Unsupported(_) => "0A000",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::WrongArity(..)
        | SqlError::MissingColumn(_)
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
