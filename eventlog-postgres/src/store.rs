use crate::schema::{
    APPEND_LOCK, ENVELOPE_COLUMNS, ID_CONSTRAINT, SCHEMA, SUBSCRIPTION_COLUMNS, VERSION_CONSTRAINT,
};
use crate::{PostgresConfig, PostgresError};
use chrono::{DateTime, Utc};
use eventlog::clock::{Clock, SystemClock};
use eventlog::config::StreamConfig;
use eventlog::converter::Converter;
use eventlog::envelope::{Attributes, Envelope, EnvelopeParts};
use eventlog::errors::{EventStoreError, EventStoreResult};
use eventlog::store::{EventStore, NameFilter, Order, StreamQuery, Transactional};
use eventlog::subscription::{ListenerState, SubscriptionDao, SubscriptionRecord, SubscriptionStatus};
use eventlog::types::{EventId, EventName, Id, ProducerType, ProducerVersion, Sequence, Timestamp};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{query, Connection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

type OpenTransaction = Transaction<'static, Postgres>;

/// Event store backed by PostgreSQL.
///
/// Clones share the pool, the runtime and the open transaction. While a
/// transaction is open every operation, including subscription record
/// writes, runs on its connection.
#[derive(Clone)]
pub struct PostgresEventStore {
    runtime: Arc<Runtime>,
    pool: PgPool,
    converter: Arc<dyn Converter>,
    clock: Arc<dyn Clock>,
    stream: StreamConfig,
    transaction: Arc<Mutex<Option<OpenTransaction>>>,
}

impl std::fmt::Debug for PostgresEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEventStore")
            .field("pool", &self.pool)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

/// The connection an operation runs on.
enum Conn<'a> {
    Transaction(MappedMutexGuard<'a, OpenTransaction>),
    Pooled(PoolConnection<Postgres>),
}

impl Conn<'_> {
    fn get(&mut self) -> &mut PgConnection {
        match self {
            Self::Transaction(transaction) => transaction,
            Self::Pooled(connection) => connection,
        }
    }
}

impl PostgresEventStore {
    /// Connects a pool described by `config`.
    pub fn connect(
        config: &PostgresConfig,
        converter: Arc<dyn Converter>,
    ) -> Result<Self, PostgresError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("eventlog-postgres")
            .enable_all()
            .build()
            .map_err(PostgresError::Runtime)?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(config.max_connections.into_inner())
                    .acquire_timeout(config.acquire_timeout)
                    .idle_timeout(config.idle_timeout)
                    .connect(&config.database_url),
            )
            .map_err(PostgresError::ConnectionFailed)?;

        info!(
            max_connections = %config.max_connections,
            "[postgres.connect] connection pool ready"
        );
        Ok(Self {
            runtime: Arc::new(runtime),
            pool,
            converter,
            clock: Arc::new(SystemClock),
            stream: config.stream,
            transaction: Arc::new(Mutex::new(None)),
        })
    }

    /// Uses `clock` to stamp appended envelopes.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Creates the tables and indexes if they do not exist.
    #[instrument(name = "postgres.migrate", skip_all)]
    pub fn migrate(&self) -> Result<(), PostgresError> {
        self.runtime
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(PostgresError::MigrationFailed)?;
        info!("[postgres.migrate] schema ready");
        Ok(())
    }

    async fn conn(&self) -> EventStoreResult<Conn<'_>> {
        let guard = self.transaction.lock().await;
        match MutexGuard::try_map(guard, |open| open.as_mut()) {
            Ok(transaction) => Ok(Conn::Transaction(transaction)),
            Err(guard) => {
                drop(guard);
                let connection = self
                    .pool
                    .acquire()
                    .await
                    .map_err(|error| map_sqlx_error(error, "acquire"))?;
                Ok(Conn::Pooled(connection))
            }
        }
    }

    async fn append(
        &self,
        connection: &mut PgConnection,
        envelopes: Vec<Envelope>,
        bodies: Vec<Value>,
    ) -> EventStoreResult<Vec<Envelope>> {
        // A savepoint when a transaction is already open, so a rejected
        // batch leaves the outer transaction usable.
        let mut tx = connection
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, "begin"))?;

        query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, "lock"))?;

        reject_stored_ids(&mut tx, &envelopes).await?;
        reject_stored_versions(&mut tx, &envelopes).await?;

        let appended_at = self.clock.now();
        let mut committed = Vec::with_capacity(envelopes.len());
        for (envelope, body) in envelopes.into_iter().zip(bodies) {
            let version = envelope
                .version()
                .map(|version| to_i64(version.into_inner(), "version"))
                .transpose()?;
            let row = query(
                "INSERT INTO eventlog_events
                     (id, name, body, attributes, producer_type, producer_id, version, appended_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 RETURNING sequence",
            )
            .bind(*envelope.id())
            .bind(envelope.name().as_str())
            .bind(Json(body))
            .bind(Json(envelope.attributes()))
            .bind(envelope.producer_type().as_str())
            .bind(envelope.producer_id().as_str())
            .bind(version)
            .bind(appended_at.into_datetime())
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| map_insert_error(error, &envelope))?;

            let sequence: i64 = row
                .try_get("sequence")
                .map_err(|error| map_sqlx_error(error, "decode"))?;
            committed.push(
                envelope
                    .with_sequence(to_sequence(sequence)?)
                    .with_appended_at(appended_at),
            );
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, "commit"))?;
        Ok(committed)
    }

    fn decode_envelope(&self, row: &PgRow) -> EventStoreResult<Envelope> {
        let get = |error| map_sqlx_error(error, "decode");

        let sequence: i64 = row.try_get("sequence").map_err(get)?;
        let id: Uuid = row.try_get("id").map_err(get)?;
        let name: String = row.try_get("name").map_err(get)?;
        let body: Json<Value> = row.try_get("body").map_err(get)?;
        let attributes: Json<Attributes> = row.try_get("attributes").map_err(get)?;
        let producer_type: String = row.try_get("producer_type").map_err(get)?;
        let producer_id: String = row.try_get("producer_id").map_err(get)?;
        let version: Option<i64> = row.try_get("version").map_err(get)?;
        let appended_at: DateTime<Utc> = row.try_get("appended_at").map_err(get)?;

        let name = EventName::from(name);
        let payload = self.converter.from_portable(&name, body.0)?;
        let version = version
            .map(|version| {
                u64::try_from(version)
                    .ok()
                    .and_then(|version| ProducerVersion::try_new(version).ok())
                    .ok_or_else(|| invalid("version", version))
            })
            .transpose()?;

        Ok(Envelope::from_parts(EnvelopeParts {
            id: to_event_id(id, "id")?,
            name,
            producer_type: ProducerType::try_new(producer_type)
                .map_err(|e| invalid("producer_type", e))?,
            producer_id: Id::try_new(producer_id).map_err(|e| invalid("producer_id", e))?,
            version,
            sequence: Some(to_sequence(sequence)?),
            appended_at: Some(Timestamp::new(appended_at)),
            attributes: attributes.0,
            payload,
        }))
    }
}

impl EventStore for PostgresEventStore {
    #[instrument(name = "postgres.add", skip_all, fields(count = envelopes.len()))]
    fn add(&self, envelopes: Vec<Envelope>) -> EventStoreResult<Vec<Envelope>> {
        if envelopes.is_empty() {
            return Err(EventStoreError::EmptyBatch);
        }
        reject_batch_duplicates(&envelopes)?;

        let bodies = envelopes
            .iter()
            .map(|envelope| self.converter.to_portable(envelope.event()))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.runtime.block_on(async {
            let mut conn = self.conn().await?;
            let committed = self.append(conn.get(), envelopes, bodies).await?;
            Ok::<_, EventStoreError>(committed)
        })?;

        debug!(
            last_sequence = ?committed.last().and_then(Envelope::sequence),
            "[postgres.add] appended envelopes"
        );
        Ok(committed)
    }

    #[instrument(name = "postgres.event", skip(self))]
    fn event(&self, id: EventId) -> EventStoreResult<Option<Envelope>> {
        let row = self.runtime.block_on(async {
            let mut conn = self.conn().await?;
            let row = query(&format!(
                "SELECT {ENVELOPE_COLUMNS} FROM eventlog_events WHERE id = $1"
            ))
            .bind(*id)
            .fetch_optional(conn.get())
            .await
            .map_err(|error| map_sqlx_error(error, "event"))?;
            Ok::<_, EventStoreError>(row)
        })?;
        row.map(|row| self.decode_envelope(&row)).transpose()
    }

    #[instrument(name = "postgres.read", skip_all, fields(limit = query.limit))]
    fn read(&self, query: &StreamQuery) -> EventStoreResult<Vec<Envelope>> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ENVELOPE_COLUMNS} FROM eventlog_events WHERE TRUE"
        ));

        if let Some(after) = query.after {
            builder
                .push(" AND sequence > ")
                .push_bind(to_i64(after.into_inner(), "after")?);
        }
        if let Some(until) = query.until {
            builder
                .push(" AND sequence <= ")
                .push_bind(to_i64(until.into_inner(), "until")?);
        }

        if !query.filter.is_all() {
            builder.push(" AND (FALSE");
            let ids = query.filter.producer_ids();
            if !ids.is_empty() {
                builder.push(" OR producer_id = ANY(").push_bind(
                    ids.iter().map(|id| id.as_str().to_owned()).collect::<Vec<_>>(),
                );
                builder.push(")");
            }
            for prefix in query.filter.type_prefixes() {
                builder
                    .push(" OR producer_type LIKE ")
                    .push_bind(format!("{}%", escape_like(prefix)))
                    .push(" ESCAPE '\\'");
            }
            builder.push(")");
        }

        match &query.names {
            NameFilter::All => {}
            NameFilter::Only(names) => {
                builder
                    .push(" AND name = ANY(")
                    .push_bind(names.iter().map(|name| name.as_str().to_owned()).collect::<Vec<_>>())
                    .push(")");
            }
            NameFilter::Without(names) => {
                builder
                    .push(" AND NOT (name = ANY(")
                    .push_bind(names.iter().map(|name| name.as_str().to_owned()).collect::<Vec<_>>())
                    .push("))");
            }
        }

        builder.push(match query.order {
            Order::Ascending => " ORDER BY sequence ASC",
            Order::Descending => " ORDER BY sequence DESC",
        });
        builder.push(" LIMIT ").push_bind(limit);

        let rows = self.runtime.block_on(async {
            let mut conn = self.conn().await?;
            let rows = builder
                .build()
                .fetch_all(conn.get())
                .await
                .map_err(|error| map_sqlx_error(error, "read"))?;
            Ok::<_, EventStoreError>(rows)
        })?;

        rows.iter().map(|row| self.decode_envelope(row)).collect()
    }

    fn stream_config(&self) -> StreamConfig {
        self.stream
    }
}

impl Transactional for PostgresEventStore {
    #[instrument(name = "postgres.begin", skip_all)]
    fn begin(&self) -> EventStoreResult<()> {
        self.runtime.block_on(async {
            let mut open = self.transaction.lock().await;
            if open.is_some() {
                return Err(EventStoreError::TransactionAlreadyStarted);
            }
            let transaction = self
                .pool
                .begin()
                .await
                .map_err(|error| map_sqlx_error(error, "begin"))?;
            *open = Some(transaction);
            debug!("[postgres.begin] transaction started");
            Ok(())
        })
    }

    #[instrument(name = "postgres.commit", skip_all)]
    fn commit(&self) -> EventStoreResult<()> {
        self.runtime.block_on(async {
            let transaction = self
                .transaction
                .lock()
                .await
                .take()
                .ok_or(EventStoreError::NoActiveTransaction)?;
            transaction
                .commit()
                .await
                .map_err(|error| map_sqlx_error(error, "commit"))?;
            debug!("[postgres.commit] transaction committed");
            Ok(())
        })
    }

    #[instrument(name = "postgres.rollback", skip_all)]
    fn rollback(&self) -> EventStoreResult<()> {
        self.runtime.block_on(async {
            let transaction = self
                .transaction
                .lock()
                .await
                .take()
                .ok_or(EventStoreError::NoActiveTransaction)?;
            transaction
                .rollback()
                .await
                .map_err(|error| map_sqlx_error(error, "rollback"))?;
            debug!("[postgres.rollback] transaction rolled back");
            Ok(())
        })
    }

    fn in_transaction(&self) -> bool {
        self.transaction.blocking_lock().is_some()
    }
}

impl SubscriptionDao for PostgresEventStore {
    #[instrument(name = "postgres.save_subscription", skip_all, fields(id = %record.id, version = record.version))]
    fn save(&self, record: &SubscriptionRecord, expected_version: u64) -> EventStoreResult<()> {
        let version = to_i64(record.version, "version")?;
        let expected = to_i64(expected_version, "expected_version")?;
        let state = record.state.as_ref().map(|state| Json(state.as_value().clone()));

        // A missing record counts as version 0, as does a stored one that never
        // got past it.
        let sql = if expected_version == 0 {
            "INSERT INTO eventlog_subscriptions
                 (id, version, status, paused, started_by, started_at, last_processed, last_processed_at, state)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE
             SET version = EXCLUDED.version, status = EXCLUDED.status, paused = EXCLUDED.paused,
                 started_by = EXCLUDED.started_by, started_at = EXCLUDED.started_at,
                 last_processed = EXCLUDED.last_processed,
                 last_processed_at = EXCLUDED.last_processed_at, state = EXCLUDED.state
             WHERE eventlog_subscriptions.version = 0"
        } else {
            "UPDATE eventlog_subscriptions
             SET version = $2, status = $3, paused = $4, started_by = $5, started_at = $6,
                 last_processed = $7, last_processed_at = $8, state = $9
             WHERE id = $1 AND version = $10"
        };

        let result = self.runtime.block_on(async {
            let mut conn = self.conn().await?;
            let mut statement = query(sql)
                .bind(record.id.as_str())
                .bind(version)
                .bind(record.status.as_str())
                .bind(record.paused)
                .bind(record.started_by.map(|id| *id))
                .bind(record.started_at.map(Timestamp::into_datetime))
                .bind(record.last_processed.map(|id| *id))
                .bind(record.last_processed_at.map(Timestamp::into_datetime))
                .bind(state);
            if expected_version != 0 {
                statement = statement.bind(expected);
            }
            let result = statement
                .execute(conn.get())
                .await
                .map_err(|error| map_sqlx_error(error, "save_subscription"))?;
            Ok::<_, EventStoreError>(result)
        })?;

        if result.rows_affected() == 0 {
            warn!(
                expected = expected_version,
                "[postgres.save_subscription] stored version moved"
            );
            return Err(EventStoreError::ConcurrentWriteDetected(record.id.clone()));
        }
        Ok(())
    }

    fn one(&self, id: &Id) -> EventStoreResult<Option<SubscriptionRecord>> {
        let row = self.runtime.block_on(async {
            let mut conn = self.conn().await?;
            let row = query(&format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM eventlog_subscriptions WHERE id = $1"
            ))
            .bind(id.as_str())
            .fetch_optional(conn.get())
            .await
            .map_err(|error| map_sqlx_error(error, "one_subscription"))?;
            Ok::<_, EventStoreError>(row)
        })?;
        row.as_ref().map(decode_record).transpose()
    }

    fn all(&self) -> EventStoreResult<Vec<SubscriptionRecord>> {
        let rows = self.runtime.block_on(async {
            let mut conn = self.conn().await?;
            let rows = query(&format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM eventlog_subscriptions ORDER BY id"
            ))
            .fetch_all(conn.get())
            .await
            .map_err(|error| map_sqlx_error(error, "all_subscriptions"))?;
            Ok::<_, EventStoreError>(rows)
        })?;
        rows.iter().map(decode_record).collect()
    }

    fn delete(&self, id: &Id) -> EventStoreResult<bool> {
        let result = self.runtime.block_on(async {
            let mut conn = self.conn().await?;
            let result = query("DELETE FROM eventlog_subscriptions WHERE id = $1")
                .bind(id.as_str())
                .execute(conn.get())
                .await
                .map_err(|error| map_sqlx_error(error, "delete_subscription"))?;
            Ok::<_, EventStoreError>(result)
        })?;
        Ok(result.rows_affected() > 0)
    }
}

fn reject_batch_duplicates(envelopes: &[Envelope]) -> EventStoreResult<()> {
    let mut ids = HashSet::new();
    let mut versions = HashSet::new();
    for envelope in envelopes {
        if !ids.insert(envelope.id()) {
            return Err(EventStoreError::EventAlreadyInStore(envelope.id()));
        }
        if let Some(version) = envelope.version() {
            if !versions.insert((envelope.producer_type(), envelope.producer_id(), version)) {
                return Err(EventStoreError::ConcurrentWriteDetected(
                    envelope.producer_id().clone(),
                ));
            }
        }
    }
    Ok(())
}

async fn reject_stored_ids(
    connection: &mut PgConnection,
    envelopes: &[Envelope],
) -> EventStoreResult<()> {
    let ids: Vec<Uuid> = envelopes.iter().map(|envelope| *envelope.id()).collect();
    let row = query("SELECT id FROM eventlog_events WHERE id = ANY($1) LIMIT 1")
        .bind(ids)
        .fetch_optional(&mut *connection)
        .await
        .map_err(|error| map_sqlx_error(error, "check_ids"))?;

    let Some(row) = row else {
        return Ok(());
    };
    let stored: Uuid = row
        .try_get("id")
        .map_err(|error| map_sqlx_error(error, "decode"))?;
    warn!(event = %stored, "[postgres.add] event already in store");
    Err(EventStoreError::EventAlreadyInStore(to_event_id(stored, "id")?))
}

async fn reject_stored_versions(
    connection: &mut PgConnection,
    envelopes: &[Envelope],
) -> EventStoreResult<()> {
    let mut by_producer: BTreeMap<(&ProducerType, &Id), Vec<i64>> = BTreeMap::new();
    for envelope in envelopes {
        if let Some(version) = envelope.version() {
            by_producer
                .entry((envelope.producer_type(), envelope.producer_id()))
                .or_default()
                .push(to_i64(version.into_inner(), "version")?);
        }
    }

    for ((producer_type, producer_id), versions) in by_producer {
        let taken = query(
            "SELECT 1 FROM eventlog_events
             WHERE producer_type = $1 AND producer_id = $2 AND version = ANY($3)
             LIMIT 1",
        )
        .bind(producer_type.as_str())
        .bind(producer_id.as_str())
        .bind(versions)
        .fetch_optional(&mut *connection)
        .await
        .map_err(|error| map_sqlx_error(error, "check_versions"))?;

        if taken.is_some() {
            warn!(producer = %producer_id, "[postgres.add] concurrent write detected");
            return Err(EventStoreError::ConcurrentWriteDetected(producer_id.clone()));
        }
    }
    Ok(())
}

fn decode_record(row: &PgRow) -> EventStoreResult<SubscriptionRecord> {
    let get = |error| map_sqlx_error(error, "decode");

    let id: String = row.try_get("id").map_err(get)?;
    let version: i64 = row.try_get("version").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let paused: bool = row.try_get("paused").map_err(get)?;
    let started_by: Option<Uuid> = row.try_get("started_by").map_err(get)?;
    let started_at: Option<DateTime<Utc>> = row.try_get("started_at").map_err(get)?;
    let last_processed: Option<Uuid> = row.try_get("last_processed").map_err(get)?;
    let last_processed_at: Option<DateTime<Utc>> = row.try_get("last_processed_at").map_err(get)?;
    let state: Option<Json<Value>> = row.try_get("state").map_err(get)?;

    Ok(SubscriptionRecord {
        id: Id::try_new(id).map_err(|e| invalid("id", e))?,
        version: u64::try_from(version).map_err(|e| invalid("version", e))?,
        status: SubscriptionStatus::parse(&status).ok_or_else(|| invalid("status", &status))?,
        paused,
        started_by: started_by.map(|id| to_event_id(id, "started_by")).transpose()?,
        started_at: started_at.map(Timestamp::new),
        last_processed: last_processed
            .map(|id| to_event_id(id, "last_processed"))
            .transpose()?,
        last_processed_at: last_processed_at.map(Timestamp::new),
        state: state.map(|state| ListenerState::new(state.0)),
    })
}

fn map_insert_error(error: sqlx::Error, envelope: &Envelope) -> EventStoreError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.is_unique_violation() {
            match db_error.constraint() {
                Some(ID_CONSTRAINT) => {
                    warn!(event = %envelope.id(), "[postgres.add] id constraint violated");
                    return EventStoreError::EventAlreadyInStore(envelope.id());
                }
                Some(VERSION_CONSTRAINT) => {
                    warn!(
                        producer = %envelope.producer_id(),
                        "[postgres.add] version constraint violated"
                    );
                    return EventStoreError::ConcurrentWriteDetected(envelope.producer_id().clone());
                }
                _ => {}
            }
        }
    }
    map_sqlx_error(error, "insert")
}

fn map_sqlx_error(error: sqlx::Error, operation: &'static str) -> EventStoreError {
    error!(
        error = %error,
        operation,
        "[postgres.database_error] database operation failed"
    );
    EventStoreError::backend(error)
}

fn invalid(column: &'static str, detail: impl std::fmt::Display) -> EventStoreError {
    EventStoreError::backend(PostgresError::InvalidRow {
        column,
        detail: detail.to_string(),
    })
}

fn to_i64(value: u64, column: &'static str) -> EventStoreResult<i64> {
    i64::try_from(value).map_err(|e| invalid(column, e))
}

fn to_sequence(value: i64) -> EventStoreResult<Sequence> {
    u64::try_from(value)
        .ok()
        .and_then(|value| Sequence::try_new(value).ok())
        .ok_or_else(|| invalid("sequence", value))
}

fn to_event_id(value: Uuid, column: &'static str) -> EventStoreResult<EventId> {
    EventId::try_new(value).map_err(|e| invalid(column, e))
}

/// Escapes `LIKE` wildcards so a prefix matches literally.
fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
