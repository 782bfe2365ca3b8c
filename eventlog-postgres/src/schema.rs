//! Table layout.

/// Unique constraint on envelope ids.
pub const ID_CONSTRAINT: &str = "eventlog_events_id_key";

/// Unique constraint on `(producer_type, producer_id, version)`.
pub const VERSION_CONSTRAINT: &str = "eventlog_events_producer_version_key";

/// Advisory lock key serializing appends. Holding it until commit also keeps
/// sequences visible in commit order.
pub const APPEND_LOCK: i64 = 0x6576_656e_746c_6f67;

/// Idempotent DDL for the event log and the subscription records.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS eventlog_events (
    sequence      BIGSERIAL PRIMARY KEY,
    id            UUID NOT NULL,
    name          TEXT NOT NULL,
    body          JSONB NOT NULL,
    attributes    JSONB NOT NULL DEFAULT '{}'::jsonb,
    producer_type TEXT NOT NULL,
    producer_id   TEXT NOT NULL,
    version       BIGINT,
    appended_at   TIMESTAMPTZ NOT NULL,
    CONSTRAINT eventlog_events_id_key UNIQUE (id),
    CONSTRAINT eventlog_events_producer_version_key UNIQUE (producer_type, producer_id, version)
);

CREATE INDEX IF NOT EXISTS eventlog_events_producer_idx
    ON eventlog_events (producer_id, sequence);

CREATE INDEX IF NOT EXISTS eventlog_events_type_idx
    ON eventlog_events (producer_type text_pattern_ops, sequence);

CREATE TABLE IF NOT EXISTS eventlog_subscriptions (
    id                TEXT PRIMARY KEY,
    version           BIGINT NOT NULL,
    status            TEXT NOT NULL,
    paused            BOOLEAN NOT NULL,
    started_by        UUID,
    started_at        TIMESTAMPTZ,
    last_processed    UUID,
    last_processed_at TIMESTAMPTZ,
    state             JSONB
);
";

/// Columns selected when reading envelopes, in `decode_envelope` order.
pub const ENVELOPE_COLUMNS: &str =
    "sequence, id, name, body, attributes, producer_type, producer_id, version, appended_at";

/// Columns of a subscription record.
pub const SUBSCRIPTION_COLUMNS: &str =
    "id, version, status, paused, started_by, started_at, last_processed, last_processed_at, state";
