//! Postgres-backed log store for the migration engine.

use async_stream::try_stream;
use async_trait::async_trait;
use evolve_core::error::CodecError;
use evolve_core::event::Event;
use evolve_core::log_store::{LogStoreBackend, PositionStream, StagingPhase};
use evolve_core::model::DerivedTables;
use evolve_core::position::{Position, Timestamp};
use futures_util::StreamExt;
use sqlx::pool::PoolConnection;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::schema::{SchemaMigrationError, SchemaMigrator};

/// Default name hashed into the advisory lock key.
pub const DEFAULT_LOCK_KEY: &str = "evolve_migration";

/// A postgres based position log.
///
/// The migration lock is a session-level advisory lock held on a dedicated pooled connection
/// between [`acquire_lock`](LogStoreBackend::acquire_lock) and
/// [`release_lock`](LogStoreBackend::release_lock).
#[derive(Clone, Debug)]
pub struct PgLogStore {
    postgres: PgPool,
    lock_key: String,
    lock_conn: Arc<Mutex<Option<PoolConnection<Postgres>>>>,
}

impl PgLogStore {
    /// Creates a new `PgLogStore`.
    pub fn new(postgres: PgPool) -> Self {
        log::debug!("Creating a new PgLogStore");
        Self {
            postgres,
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lock_conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Uses another advisory lock key, e.g. to run independent logs in one database.
    pub fn with_lock_key(mut self, lock_key: impl Into<String>) -> Self {
        self.lock_key = lock_key.into();
        self
    }

    /// The connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.postgres
    }

    /// Creates or upgrades the tables this store needs.
    pub async fn initialize(&self) -> Result<usize, PgLogStoreError> {
        Ok(SchemaMigrator::new(self.postgres.clone()).run().await?)
    }

    /// Appends positions to the live log.
    pub async fn append_positions(&self, positions: &[Position]) -> Result<(), PgLogStoreError> {
        let mut tx = self.postgres.begin().await?;
        insert_positions(&mut tx, LIVE, positions).await?;
        tx.commit().await?;
        log::debug!("Appended {} positions", positions.len());
        Ok(())
    }

    /// Reads the staging area.
    pub async fn staged_positions(&self) -> Result<Vec<Position>, PgLogStoreError> {
        read_all(&self.postgres, STAGED).await
    }

    /// Reads the materialized model of `fqid` from the derived tables, meta fields included.
    pub async fn derived_model(
        &self,
        fqid: &str,
    ) -> Result<Option<serde_json::Value>, PgLogStoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT data FROM evolve_models WHERE fqid = $1")
                .bind(fqid)
                .fetch_optional(&self.postgres)
                .await?;
        Ok(row.map(|(data,)| data))
    }

    /// Reads the last position recorded for `collection/field`.
    pub async fn collection_field_position(
        &self,
        collectionfield: &str,
    ) -> Result<Option<u64>, PgLogStoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT position FROM evolve_collection_fields WHERE collectionfield = $1",
        )
        .bind(collectionfield)
        .fetch_optional(&self.postgres)
        .await?;
        row.map(|(position,)| from_db(position)).transpose()
    }

    async fn set_phase(
        tx: &mut Transaction<'_, Postgres>,
        phase: StagingPhase,
    ) -> Result<(), PgLogStoreError> {
        let (name, target_mi) = match phase {
            StagingPhase::Idle => ("idle", None),
            StagingPhase::Staged { target_mi } => ("staged", Some(target_mi)),
            StagingPhase::Swapped { target_mi } => ("swapped", Some(target_mi)),
        };
        sqlx::query(
            r#"
            UPDATE evolve_migration_state
            SET phase = $1, target_mi = $2, updated_at = NOW()
            WHERE id = 1
            "#,
        )
        .bind(name)
        .bind(target_mi)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn clear_staged(tx: &mut Transaction<'_, Postgres>) -> Result<(), PgLogStoreError> {
        sqlx::query("DELETE FROM evolve_staged_events")
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM evolve_staged_positions")
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

/// Errors returned by the PgLogStore
#[derive(Debug, thiserror::Error)]
pub enum PgLogStoreError {
    /// A database error
    #[error("Database error: {0}")]
    DBError(#[from] sqlx::Error),
    /// Creating or upgrading the schema failed
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaMigrationError),
    /// A stored event does not decode
    #[error("Decode event error: {0}")]
    Codec(#[from] CodecError),
    /// A position number does not fit the column
    #[error("position {0} is out of range")]
    PositionOutOfRange(i128),
    /// The state row holds an unknown phase
    #[error("unknown staging phase {0:?}")]
    UnknownPhase(String),
    /// Another session holds the migration lock
    #[error("the migration lock is held by another session")]
    LockHeld,
    /// Release without a prior acquire
    #[error("the migration lock is not held")]
    LockNotHeld,
    /// Swap without staged positions
    #[error("nothing is staged")]
    NoStaging,
}

const LIVE: Tables = Tables {
    positions: "evolve_positions",
    events: "evolve_events",
};

const STAGED: Tables = Tables {
    positions: "evolve_staged_positions",
    events: "evolve_staged_events",
};

#[derive(Clone, Copy)]
struct Tables {
    positions: &'static str,
    events: &'static str,
}

/// One row of the position/event join. Positions without events yield a single row with no
/// event data.
#[derive(Debug, FromRow)]
struct PgDBPositionEvent {
    position: i64,
    migration_index: i32,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
    timestamp_text: Option<String>,
    information: Option<serde_json::Value>,
    data: Option<serde_json::Value>,
}

/// The stored text when it still parses, else the normalized column.
fn row_timestamp(
    at: Option<chrono::DateTime<chrono::Utc>>,
    text: Option<&str>,
) -> Option<Timestamp> {
    text.and_then(|text| Timestamp::parse(text).ok())
        .or_else(|| at.map(Timestamp::from))
}

fn to_db(position: u64) -> Result<i64, PgLogStoreError> {
    i64::try_from(position).map_err(|_| PgLogStoreError::PositionOutOfRange(position.into()))
}

fn from_db(position: i64) -> Result<u64, PgLogStoreError> {
    u64::try_from(position).map_err(|_| PgLogStoreError::PositionOutOfRange(position.into()))
}

fn select_sql(tables: Tables) -> String {
    format!(
        r#"
        SELECT p.position, p.migration_index, p.timestamp, p.timestamp_text, p.information, e.data
        FROM {positions} p
        LEFT JOIN {events} e ON e.position = p.position
        ORDER BY p.position ASC, e.weight ASC
        "#,
        positions = tables.positions,
        events = tables.events,
    )
}

/// Folds joined rows into positions, emitting a position once its last row was seen.
fn fold_row(
    current: &mut Option<Position>,
    row: PgDBPositionEvent,
) -> Result<Option<Position>, PgLogStoreError> {
    let number = from_db(row.position)?;
    let mut finished = None;
    if current.as_ref().is_some_and(|p| p.position != number) {
        finished = current.take();
    }
    let position = current.get_or_insert_with(|| Position {
        position: number,
        migration_index: row.migration_index,
        timestamp: row_timestamp(row.timestamp, row.timestamp_text.as_deref()),
        information: row.information,
        events: Vec::new(),
    });
    if let Some(data) = row.data {
        position.events.push(Event::from_value(data)?);
    }
    Ok(finished)
}

async fn read_all(pool: &PgPool, tables: Tables) -> Result<Vec<Position>, PgLogStoreError> {
    let rows = sqlx::query_as::<_, PgDBPositionEvent>(&select_sql(tables))
        .fetch_all(pool)
        .await?;
    let mut positions = Vec::new();
    let mut current = None;
    for row in rows {
        if let Some(done) = fold_row(&mut current, row)? {
            positions.push(done);
        }
    }
    positions.extend(current);
    Ok(positions)
}

async fn insert_positions(
    tx: &mut Transaction<'_, Postgres>,
    tables: Tables,
    positions: &[Position],
) -> Result<(), PgLogStoreError> {
    let insert_position = format!(
        "INSERT INTO {} (position, migration_index, timestamp, timestamp_text, information) VALUES ($1, $2, $3, $4, $5)",
        tables.positions
    );
    let insert_event = format!(
        "INSERT INTO {} (position, weight, data) VALUES ($1, $2, $3)",
        tables.events
    );
    for position in positions {
        let number = to_db(position.position)?;
        sqlx::query(&insert_position)
            .bind(number)
            .bind(position.migration_index)
            .bind(position.timestamp.as_ref().map(Timestamp::at))
            .bind(position.timestamp.as_ref().map(Timestamp::as_str))
            .bind(position.information.clone())
            .execute(&mut **tx)
            .await?;
        for (weight, event) in position.events.iter().enumerate() {
            let weight = i32::try_from(weight)
                .map_err(|_| PgLogStoreError::PositionOutOfRange(position.position.into()))?;
            sqlx::query(&insert_event)
                .bind(number)
                .bind(weight)
                .bind(event.to_value())
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl LogStoreBackend for PgLogStore {
    type Error = PgLogStoreError;

    async fn acquire_lock(&self) -> Result<(), Self::Error> {
        let mut slot = self.lock_conn.lock().await;
        if slot.is_some() {
            return Err(PgLogStoreError::LockHeld);
        }
        let mut conn = self.postgres.acquire().await?;
        let (acquired,): (bool,) = sqlx::query_as(
            r#"
            SELECT pg_try_advisory_lock(
                ('x' || substr(md5($1), 1, 8))::bit(32)::int,
                ('x' || substr(md5($1), 9, 8))::bit(32)::int
            )
            "#,
        )
        .bind(&self.lock_key)
        .fetch_one(&mut *conn)
        .await?;
        if !acquired {
            log::debug!("Advisory lock '{}' is held elsewhere", self.lock_key);
            return Err(PgLogStoreError::LockHeld);
        }
        *slot = Some(conn);
        log::debug!("Acquired advisory lock '{}'", self.lock_key);
        Ok(())
    }

    async fn release_lock(&self) -> Result<(), Self::Error> {
        let mut conn = self
            .lock_conn
            .lock()
            .await
            .take()
            .ok_or(PgLogStoreError::LockNotHeld)?;
        let (released,): (bool,) = sqlx::query_as(
            r#"
            SELECT pg_advisory_unlock(
                ('x' || substr(md5($1), 1, 8))::bit(32)::int,
                ('x' || substr(md5($1), 9, 8))::bit(32)::int
            )
            "#,
        )
        .bind(&self.lock_key)
        .fetch_one(&mut *conn)
        .await?;
        if !released {
            log::warn!("Advisory lock '{}' was not held on release", self.lock_key);
        }
        log::debug!("Released advisory lock '{}'", self.lock_key);
        Ok(())
    }

    async fn read_positions(
        &self,
    ) -> Result<Pin<Box<dyn PositionStream + Send + 'life0>>, Self::Error> {
        let sql = select_sql(LIVE);
        let stream = try_stream! {
            let mut rows = sqlx::query_as::<_, PgDBPositionEvent>(&sql).fetch(&self.postgres);
            let mut current = None;
            while let Some(row) = rows.next().await {
                let row = row.map_err(PgLogStoreError::DBError)?;
                if let Some(done) = fold_row(&mut current, row)? {
                    yield done;
                }
            }
            if let Some(last) = current {
                yield last;
            }
        };
        let stream = stream.map(|item: Result<Position, PgLogStoreError>| {
            item.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        });
        let position_stream: Pin<Box<dyn PositionStream + Send + 'life0>> = Box::pin(stream);
        Ok(position_stream)
    }

    async fn staging_phase(&self) -> Result<StagingPhase, Self::Error> {
        let (phase, target_mi): (String, Option<i32>) =
            sqlx::query_as("SELECT phase, target_mi FROM evolve_migration_state WHERE id = 1")
                .fetch_one(&self.postgres)
                .await?;
        match (phase.as_str(), target_mi) {
            ("idle", _) => Ok(StagingPhase::Idle),
            ("staged", Some(target_mi)) => Ok(StagingPhase::Staged { target_mi }),
            ("swapped", Some(target_mi)) => Ok(StagingPhase::Swapped { target_mi }),
            _ => Err(PgLogStoreError::UnknownPhase(phase)),
        }
    }

    async fn write_staging(
        &self,
        positions: &[Position],
        target_mi: i32,
    ) -> Result<(), Self::Error> {
        let mut tx = self.postgres.begin().await?;
        Self::clear_staged(&mut tx).await?;
        insert_positions(&mut tx, STAGED, positions).await?;
        Self::set_phase(&mut tx, StagingPhase::Staged { target_mi }).await?;
        tx.commit().await?;
        log::debug!(
            "Staged {} positions at migration index {target_mi}",
            positions.len()
        );
        Ok(())
    }

    async fn discard_staging(&self) -> Result<(), Self::Error> {
        let mut tx = self.postgres.begin().await?;
        Self::clear_staged(&mut tx).await?;
        sqlx::query(
            r#"
            UPDATE evolve_migration_state
            SET phase = 'idle', target_mi = NULL, updated_at = NOW()
            WHERE id = 1 AND phase = 'staged'
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        log::debug!("Staging discarded");
        Ok(())
    }

    async fn swap_in_staging(&self) -> Result<(), Self::Error> {
        let mut tx = self.postgres.begin().await?;
        let (phase, target_mi): (String, Option<i32>) = sqlx::query_as(
            "SELECT phase, target_mi FROM evolve_migration_state WHERE id = 1 FOR UPDATE",
        )
        .fetch_one(&mut *tx)
        .await?;
        let target_mi = match (phase.as_str(), target_mi) {
            ("staged", Some(target_mi)) => target_mi,
            _ => return Err(PgLogStoreError::NoStaging),
        };

        for statement in [
            "DELETE FROM evolve_events",
            "DELETE FROM evolve_positions",
            r#"
            INSERT INTO evolve_positions (position, migration_index, timestamp, timestamp_text, information)
            SELECT position, migration_index, timestamp, timestamp_text, information
            FROM evolve_staged_positions
            "#,
            r#"
            INSERT INTO evolve_events (position, weight, data)
            SELECT position, weight, data FROM evolve_staged_events
            "#,
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        Self::clear_staged(&mut tx).await?;
        Self::set_phase(&mut tx, StagingPhase::Swapped { target_mi }).await?;
        tx.commit().await?;
        log::info!("Swapped staging into the live log at migration index {target_mi}");
        Ok(())
    }

    async fn rebuild_derived(&self, derived: &DerivedTables) -> Result<(), Self::Error> {
        let mut tx = self.postgres.begin().await?;
        sqlx::query("DELETE FROM evolve_models")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM evolve_collection_fields")
            .execute(&mut *tx)
            .await?;
        for (fqid, model) in derived.models.iter() {
            sqlx::query(
                r#"
                INSERT INTO evolve_models (fqid, collection, id, data, deleted, position)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(fqid.to_string())
            .bind(fqid.collection())
            .bind(to_db(fqid.id())?)
            .bind(model.to_value())
            .bind(model.meta_deleted)
            .bind(to_db(model.meta_position)?)
            .execute(&mut *tx)
            .await?;
        }
        for (collectionfield, position) in &derived.collection_fields {
            sqlx::query(
                "INSERT INTO evolve_collection_fields (collectionfield, position) VALUES ($1, $2)",
            )
            .bind(collectionfield)
            .bind(to_db(*position)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        log::debug!(
            "Rebuilt {} models and {} collection fields",
            derived.models.len(),
            derived.collection_fields.len()
        );
        Ok(())
    }

    async fn clear_staging(&self) -> Result<(), Self::Error> {
        let mut tx = self.postgres.begin().await?;
        Self::clear_staged(&mut tx).await?;
        Self::set_phase(&mut tx, StagingPhase::Idle).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolve_core::fields;
    use evolve_core::fqid::Fqid;
    use serde_json::json;

    fn row(position: i64, data: Option<serde_json::Value>) -> PgDBPositionEvent {
        PgDBPositionEvent {
            position,
            migration_index: 1,
            timestamp: None,
            timestamp_text: None,
            information: None,
            data,
        }
    }

    #[test]
    fn joined_rows_fold_into_positions() {
        let create = Event::create(Fqid::new("a", 1).unwrap(), fields! {"x" => 1});
        let rows = vec![
            row(1, Some(create.to_value())),
            row(1, Some(json!({"type": "delete", "fqid": "a/1"}))),
            row(2, None),
            row(3, Some(json!({"type": "restore", "fqid": "a/1"}))),
        ];
        let mut current = None;
        let mut positions = Vec::new();
        for r in rows {
            positions.extend(fold_row(&mut current, r).unwrap());
        }
        positions.extend(current);
        assert_eq!(positions.len(), 3);
        assert_eq!(positions[0].events.len(), 2);
        assert_eq!(positions[0].events[0], create);
        assert!(positions[1].events.is_empty());
        assert_eq!(positions[2].position, 3);
    }

    #[test]
    fn negative_positions_are_rejected() {
        let mut current = None;
        assert!(matches!(
            fold_row(&mut current, row(-1, None)),
            Err(PgLogStoreError::PositionOutOfRange(-1))
        ));
    }

    #[test]
    fn stored_timestamp_text_wins_over_the_column() {
        let at = "2024-03-01T10:00:00Z".parse().unwrap();
        let read = row_timestamp(Some(at), Some("2024-03-01T11:00:00.000+01:00")).unwrap();
        assert_eq!(read.as_str(), "2024-03-01T11:00:00.000+01:00");
        assert_eq!(read.at(), at);

        assert_eq!(
            row_timestamp(Some(at), None).unwrap().as_str(),
            "2024-03-01T10:00:00Z"
        );
        assert_eq!(row_timestamp(Some(at), Some("garbage")).unwrap().at(), at);
        assert_eq!(row_timestamp(None, None), None);
    }
}
