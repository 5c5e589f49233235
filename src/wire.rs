use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

use crate::auth::ParkAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::paths::{floor_channel, user_channel, Change};
use crate::reaper::local_now;
use crate::site::SiteManager;
use crate::sql::{self, Command, SqlError};

/// Query handler for one client connection. Holds that connection's
/// LISTEN subscriptions; site and user come from the startup parameters.
pub struct ParkHandler {
    sites: Arc<SiteManager>,
    listens: Mutex<HashMap<String, broadcast::Receiver<Change>>>,
    query_parser: Arc<ParkQueryParser>,
}

impl ParkHandler {
    pub fn new(sites: Arc<SiteManager>) -> Self {
        Self {
            sites,
            listens: Mutex::new(HashMap::new()),
            query_parser: Arc::new(ParkQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.sites
            .get_or_create(&db)
            .map_err(|e| user_error("3D000", format!("site error: {e}")))
    }

    fn session_user<C: ClientInfo>(&self, client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("28000", "no user in startup parameters".into()))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(SqlError::Empty) => return Ok(Response::EmptyQuery),
            Err(e) => return Err(sql_err(e)),
        };
        let engine = self.resolve_engine(client)?;
        let user_id = self.session_user(client)?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, &user_id, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        user_id: &str,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertReservation(req) => {
                engine
                    .reserve_slot(user_id, req, local_now())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteReservation { date } => {
                engine
                    .cancel_reservation(user_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { date } => {
                // Readers never see a reservation whose window has passed
                engine
                    .sweep_user(user_id, local_now())
                    .await
                    .map_err(engine_err)?;
                let reservations = match date {
                    Some(date) => engine.reservation(user_id, date).await.into_iter().collect(),
                    None => engine.reservations_for(user_id).await,
                };
                reservation_rows(reservations)
            }
            Command::SelectUpcoming => {
                let today = local_now().date();
                reservation_rows(engine.upcoming(user_id, today).await)
            }
            Command::SelectSlots { floor, date } => {
                let slots = engine.slot_statuses(&floor, date).await.map_err(engine_err)?;
                let schema = Arc::new(slot_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.floor)?;
                        encoder.encode_field(&s.slot.to_string())?;
                        encoder.encode_field(&format_date(s.date))?;
                        encoder.encode_field(&s.status.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectFloorCounts { date } => {
                let counts = engine.floor_counts(date).await;
                let schema = Arc::new(floor_count_schema());
                let rows: Vec<PgWireResult<_>> = counts
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.floor)?;
                        encoder.encode_field(&(c.available as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertSlotStatus {
                floor,
                slot,
                date,
                expected,
                new,
            } => {
                engine
                    .compare_and_set_slot(&floor, slot, date, expected, new)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertUser(fields) => {
                engine.put_profile(user_id, fields).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectUser => {
                let schema = Arc::new(user_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .profile(user_id)
                    .await
                    .into_iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.username)?;
                        encoder.encode_field(&p.email)?;
                        encoder.encode_field(&p.phone)?;
                        encoder.encode_field(&p.notifications)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertVehicle { brand, model, plate } => {
                engine
                    .add_vehicle(user_id, &brand, &model, &plate)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteVehicle { id } => {
                engine.remove_vehicle(user_id, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectVehicles => {
                let schema = Arc::new(vehicle_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .vehicles(user_id)
                    .await
                    .into_iter()
                    .map(|v| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&v.id.to_string())?;
                        encoder.encode_field(&v.brand)?;
                        encoder.encode_field(&v.model)?;
                        encoder.encode_field(&v.plate)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectDocuments => {
                let schema = Arc::new(document_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .documents(user_id)
                    .await
                    .into_iter()
                    .map(|(path, value)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&path)?;
                        encoder.encode_field(&value.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::Listen { channel } => {
                authorize_channel(engine, user_id, &channel)?;
                let mut listens = self.listens.lock().unwrap_or_else(PoisonError::into_inner);
                listens
                    .entry(channel)
                    .or_insert_with_key(|channel| engine.notify.subscribe(channel));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.listens
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listens
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Drain every subscribed channel, oldest change first.
    fn pending_notifications(&self) -> Vec<NotificationResponse> {
        let mut pending: Vec<(u64, String, Change)> = Vec::new();
        let mut listens = self.listens.lock().unwrap_or_else(PoisonError::into_inner);
        for (channel, rx) in listens.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(change) => pending.push((change.seq, channel.clone(), change)),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, "listener lagged, dropped {skipped} notifications");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        drop(listens);

        pending.sort_by_key(|(seq, _, _)| *seq);
        let pid = std::process::id() as i32;
        pending
            .into_iter()
            .map(|(_, channel, change)| NotificationResponse::new(pid, channel, change.to_payload()))
            .collect()
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin,
        PgWireError: From<C::Error>,
    {
        for notification in self.pending_notifications() {
            client
                .send(PgWireBackendMessage::NotificationResponse(notification))
                .await?;
        }
        Ok(())
    }
}

/// A session may follow any floor of its site, but only its own user channel.
fn authorize_channel(engine: &Engine, user_id: &str, channel: &str) -> PgWireResult<()> {
    if let Some(floor) = channel.strip_prefix("slots_") {
        return if engine.layout.has_floor(floor) {
            Ok(())
        } else {
            Err(user_error("22023", format!("unknown floor in channel: {channel}")))
        };
    }
    if channel.starts_with("user_") {
        return if channel == user_channel(user_id) {
            Ok(())
        } else {
            Err(user_error(
                "42501",
                format!("cannot listen on another user's channel: {channel}"),
            ))
        };
    }
    Err(user_error(
        "42000",
        format!(
            "invalid channel: {channel} (expected {} or {})",
            floor_channel("{floor}"),
            user_channel("{uid}")
        ),
    ))
}

fn reservation_rows(reservations: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.floor)?;
            encoder.encode_field(&r.slot.to_string())?;
            encoder.encode_field(&format_date(r.date))?;
            encoder.encode_field(&format_time(r.window.start))?;
            encoder.encode_field(&format_time(r.window.end))?;
            encoder.encode_field(&r.plate)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    ["floor", "slot_id", "date", "start_time", "end_time", "plate"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn slot_schema() -> Vec<FieldInfo> {
    ["floor", "slot_id", "date", "status"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn floor_count_schema() -> Vec<FieldInfo> {
    vec![
        text_field("floor"),
        FieldInfo::new("available".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        text_field("username"),
        text_field("email"),
        text_field("phone"),
        FieldInfo::new("notifications".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn vehicle_schema() -> Vec<FieldInfo> {
    ["id", "brand", "model", "plate"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn document_schema() -> Vec<FieldInfo> {
    vec![text_field("path"), text_field("value")]
}

/// The table a `SELECT ... FROM t` reads, lowercased.
fn select_target(sql: &str) -> Option<String> {
    let mut words = sql.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("select") {
        return None;
    }
    words
        .skip_while(|w| !w.eq_ignore_ascii_case("from"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').trim_matches('"').to_ascii_lowercase())
}

/// Row description for a statement, without executing it.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_target(sql).as_deref() {
        Some("reservations" | "upcoming") => reservation_schema(),
        Some("slots") => slot_schema(),
        Some("floor_counts") => floor_count_schema(),
        Some("users") => user_schema(),
        Some("vehicles") => vehicle_schema(),
        Some("documents") => document_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ParkHandler {
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
        let result = self.run(client, query).await;
        self.flush_notifications(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkQueryParser;

#[async_trait]
impl QueryParser for ParkQueryParser {
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
impl ExtendedQueryHandler for ParkHandler {
    type Statement = String;
    type QueryParser = ParkQueryParser;

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
        let result = self.run(client, &sql).await;
        self.flush_notifications(client).await?;
        result
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
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

/// Inline bound parameters as quoted text literals. Higher numbers go first
/// so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

fn inline_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = sql.to_string();
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

pub struct ParkFactory {
    handler: Arc<ParkHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ParkAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkFactory {
    pub fn new(sites: Arc<SiteManager>, password: String) -> Self {
        let auth_source = ParkAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParkHandler::new(sites)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkFactory {
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

/// Serve one client. Each connection gets its own handler, so LISTEN
/// subscriptions end with the socket.
pub async fn process_connection(
    socket: TcpStream,
    sites: Arc<SiteManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ParkFactory::new(sites, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
