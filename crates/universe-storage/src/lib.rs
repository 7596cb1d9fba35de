//! DuckDB-backed particle store, trait history, event log and snapshot archive.

use chrono::{DateTime, Utc};
use duckdb::{Connection, Row, Transaction, params};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;
use universe_core::{
    BroadcastHook, EventSink, Particle, ParticleId, ParticleState, ParticleStore, Position,
    SinkError, StoreError, Tick, TraitRecord, TraitStore, TraitVector, UserId, Velocity,
    WorldSnapshot,
};
use uuid::Uuid;

const DEFAULT_EVENT_BUFFER: usize = 256;

const PARTICLE_COLUMNS: &str = "id, owner, position_x, position_y, velocity_x, velocity_y, \
     mass, energy, state, decay_level, last_input_at, created_at, updated_at";

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("storage lock poisoned")]
    Poisoned,
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            // DuckDB failures are usually lock contention or I/O hiccups.
            StorageError::DuckDb(err) => StoreError::Transient(err.to_string()),
            other => StoreError::Permanent(other.to_string()),
        }
    }
}

/// Buffered event-log row.
#[derive(Debug, Clone)]
struct EventRow {
    recorded_at: i64,
    event_type: String,
    payload: String,
}

/// Number of logged events per type, for analytics displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCount {
    pub event_type: String,
    pub count: i64,
}

/// DuckDB-backed persistence with a buffered event log.
pub struct Storage {
    conn: Connection,
    events: Vec<EventRow>,
    event_flush_threshold: usize,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("buffered_events", &self.events.len())
            .field("event_flush_threshold", &self.event_flush_threshold)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Open or create a DuckDB database at the provided path.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::with_event_threshold(path, DEFAULT_EVENT_BUFFER)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_EVENT_BUFFER)
    }

    /// Open with an explicit event buffer size; 1 writes every event immediately.
    pub fn with_event_threshold(path: &str, events: usize) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, events)
    }

    fn from_connection(conn: Connection, events: usize) -> Result<Self, StorageError> {
        let mut storage = Self {
            conn,
            events: Vec::new(),
            event_flush_threshold: events.max(1),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute(
            "create table if not exists particles (
                id text primary key,
                owner text,
                position_x double,
                position_y double,
                velocity_x double,
                velocity_y double,
                mass double,
                energy double,
                state text,
                decay_level integer,
                last_input_at bigint,
                created_at bigint,
                updated_at bigint
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists trait_vectors (
                particle_id text,
                version bigint,
                curiosity double,
                social_affinity double,
                aggression double,
                stability double,
                growth_potential double,
                recorded_at bigint,
                primary key (particle_id, version)
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists events (
                recorded_at bigint,
                event_type text,
                payload text
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists world_snapshots (
                tick bigint primary key,
                recorded_at bigint,
                active_count bigint,
                mean_energy double,
                interaction_count bigint,
                merges bigint,
                fissions bigint,
                expirations bigint,
                faults bigint
            )",
            [],
        )?;
        Ok(())
    }

    /// Insert or replace one particle row.
    pub fn upsert_particle(&mut self, particle: &Particle) -> Result<(), StorageError> {
        let sql = format!(
            "insert or replace into particles ({PARTICLE_COLUMNS}) \
             values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        self.conn.execute(
            &sql,
            params![
                particle.id.0.to_string(),
                particle.owner.0.to_string(),
                particle.position.x,
                particle.position.y,
                particle.velocity.vx,
                particle.velocity.vy,
                particle.mass,
                particle.energy,
                particle.state.as_str(),
                i64::from(particle.decay_level),
                particle.last_input_at.map(|at| at.timestamp_millis()),
                particle.created_at.timestamp_millis(),
                particle.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Load particles in creation order, optionally only the live ones.
    /// Rows that fail to decode are logged and skipped so one bad record cannot stall the world.
    pub fn load_particles(&mut self, live_only: bool) -> Result<Vec<Particle>, StorageError> {
        let filter = if live_only {
            "where state in ('active', 'decaying')"
        } else {
            ""
        };
        let sql = format!("select {PARTICLE_COLUMNS} from particles {filter} order by created_at, id");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut particles = Vec::new();
        let mut skipped = 0usize;
        while let Some(row) = rows.next()? {
            match particle_from_row(row) {
                Ok(particle) => particles.push(particle),
                Err(err) => {
                    let id = row.get::<_, String>(0).unwrap_or_default();
                    warn!(row = %id, error = %err, "skipping corrupt particle row");
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, loaded = particles.len(), "particle load skipped corrupt rows");
        }
        Ok(particles)
    }

    /// Fetch one particle by id.
    pub fn particle(&mut self, id: ParticleId) -> Result<Option<Particle>, StorageError> {
        let sql = format!("select {PARTICLE_COLUMNS} from particles where id = ?");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id.0.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(particle_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Append a new trait version for `id`, clamping every scalar.
    pub fn append_traits(
        &mut self,
        id: ParticleId,
        traits: &TraitVector,
        recorded_at: DateTime<Utc>,
    ) -> Result<TraitRecord, StorageError> {
        let traits = traits.clamped();
        let key = id.0.to_string();
        let tx = self.conn.transaction()?;
        let version: i64 = tx.query_row(
            "select coalesce(max(version), 0) + 1 from trait_vectors where particle_id = ?",
            params![key],
            |row| row.get(0),
        )?;
        tx.execute(
            "insert into trait_vectors (
                particle_id, version, curiosity, social_affinity, aggression,
                stability, growth_potential, recorded_at
            ) values (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                key,
                version,
                traits.curiosity,
                traits.social_affinity,
                traits.aggression,
                traits.stability,
                traits.growth_potential,
                recorded_at.timestamp_millis(),
            ],
        )?;
        tx.commit()?;
        Ok(TraitRecord {
            particle_id: id,
            version: version as u64,
            traits,
            recorded_at,
        })
    }

    /// Most recent trait vector for `id`.
    pub fn latest_traits(&mut self, id: ParticleId) -> Result<Option<TraitVector>, StorageError> {
        Ok(self.trait_records(id, true)?.pop().map(|record| record.traits))
    }

    /// Every trait version for `id`, oldest first.
    pub fn trait_history(&mut self, id: ParticleId) -> Result<Vec<TraitRecord>, StorageError> {
        self.trait_records(id, false)
    }

    fn trait_records(&mut self, id: ParticleId, latest_only: bool) -> Result<Vec<TraitRecord>, StorageError> {
        let sql = if latest_only {
            "select version, curiosity, social_affinity, aggression, stability, growth_potential, recorded_at
             from trait_vectors where particle_id = ? order by version desc limit 1"
        } else {
            "select version, curiosity, social_affinity, aggression, stability, growth_potential, recorded_at
             from trait_vectors where particle_id = ? order by version asc"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params![id.0.to_string()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(TraitRecord {
                particle_id: id,
                version: row.get::<_, i64>(0)? as u64,
                traits: TraitVector {
                    curiosity: row.get(1)?,
                    social_affinity: row.get(2)?,
                    aggression: row.get(3)?,
                    stability: row.get(4)?,
                    growth_potential: row.get(5)?,
                },
                recorded_at: timestamp(row.get(6)?)?,
            });
        }
        Ok(records)
    }

    /// Queue an event for the log, flushing once the buffer is full.
    pub fn record_event(
        &mut self,
        event_type: &str,
        payload: &Value,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.events.push(EventRow {
            recorded_at: recorded_at.timestamp_millis(),
            event_type: event_type.to_string(),
            payload: payload.to_string(),
        });
        if self.events.len() >= self.event_flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn insert_events(tx: &Transaction<'_>, rows: &[EventRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt =
            tx.prepare("insert into events (recorded_at, event_type, payload) values (?, ?, ?)")?;
        for row in rows {
            stmt.execute(params![row.recorded_at, row.event_type, row.payload])?;
        }
        Ok(())
    }

    /// Force flush buffered events.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.events.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        Self::insert_events(&tx, &self.events)?;
        tx.commit()?;
        self.events.clear();
        Ok(())
    }

    /// Archive one world snapshot.
    pub fn record_snapshot(&mut self, snapshot: &WorldSnapshot) -> Result<(), StorageError> {
        self.conn.execute(
            "insert or replace into world_snapshots (
                tick, recorded_at, active_count, mean_energy, interaction_count,
                merges, fissions, expirations, faults
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                snapshot.tick.0 as i64,
                snapshot.recorded_at.timestamp_millis(),
                snapshot.active_count as i64,
                snapshot.mean_energy,
                snapshot.interaction_count as i64,
                snapshot.merges as i64,
                snapshot.fissions as i64,
                snapshot.expirations as i64,
                snapshot.faults as i64,
            ],
        )?;
        Ok(())
    }

    /// Highest archived tick, used to resume numbering after a restart.
    pub fn latest_tick(&mut self) -> Result<Option<Tick>, StorageError> {
        let latest: Option<i64> =
            self.conn
                .query_row("select max(tick) from world_snapshots", [], |row| row.get(0))?;
        Ok(latest.map(|tick| Tick(tick as u64)))
    }

    /// The newest `limit` snapshots, newest first.
    pub fn recent_snapshots(&mut self, limit: usize) -> Result<Vec<WorldSnapshot>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "select tick, recorded_at, active_count, mean_energy, interaction_count,
                    merges, fissions, expirations, faults
             from world_snapshots
             order by tick desc
             limit ?",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut snapshots = Vec::with_capacity(limit.min(64));
        while let Some(row) = rows.next()? {
            snapshots.push(WorldSnapshot {
                tick: Tick(row.get::<_, i64>(0)? as u64),
                recorded_at: timestamp(row.get(1)?)?,
                active_count: row.get::<_, i64>(2)? as usize,
                mean_energy: row.get(3)?,
                interaction_count: row.get::<_, i64>(4)? as usize,
                merges: row.get::<_, i64>(5)? as usize,
                fissions: row.get::<_, i64>(6)? as usize,
                expirations: row.get::<_, i64>(7)? as usize,
                faults: row.get::<_, i64>(8)? as usize,
            });
        }
        Ok(snapshots)
    }

    /// Logged events grouped by type, most frequent first.
    pub fn event_counts(&mut self) -> Result<Vec<EventCount>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select event_type, count(*) as n
             from events
             group by event_type
             order by n desc, event_type asc",
        )?;
        let mut rows = stmt.query([])?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next()? {
            counts.push(EventCount {
                event_type: row.get(0)?,
                count: row.get(1)?,
            });
        }
        Ok(counts)
    }

    /// Run database maintenance to optimize and compact storage.
    pub fn optimize(&mut self) -> Result<(), StorageError> {
        self.flush()?;
        self.conn.execute("PRAGMA optimize;", [])?;
        self.conn.execute("VACUUM;", [])?;
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "failed to flush event buffer on drop");
        }
    }
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp {millis} out of range")))
}

fn uuid(text: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(text).map_err(|err| StorageError::Corrupt(format!("bad uuid `{text}`: {err}")))
}

fn particle_from_row(row: &Row<'_>) -> Result<Particle, StorageError> {
    let id: String = row.get(0)?;
    let owner: String = row.get(1)?;
    let state: String = row.get(8)?;
    let last_input_at: Option<i64> = row.get(10)?;
    Ok(Particle {
        id: ParticleId(uuid(&id)?),
        owner: UserId(uuid(&owner)?),
        position: Position::new(row.get(2)?, row.get(3)?),
        velocity: Velocity::new(row.get(4)?, row.get(5)?),
        mass: row.get(6)?,
        energy: row.get(7)?,
        state: state
            .parse::<ParticleState>()
            .map_err(|err| StorageError::Corrupt(err.to_string()))?,
        decay_level: row.get::<_, i64>(9)?.clamp(0, i64::from(u32::MAX)) as u32,
        last_input_at: last_input_at.map(timestamp).transpose()?,
        created_at: timestamp(row.get(11)?)?,
        updated_at: timestamp(row.get(12)?)?,
    })
}

/// Cloneable handle implementing every storage-backed collaborator.
#[derive(Debug, Clone)]
pub struct SharedStorage(Arc<Mutex<Storage>>);

impl SharedStorage {
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        Self(Arc::new(Mutex::new(storage)))
    }

    /// Lock the underlying storage for analytics queries.
    pub fn lock(&self) -> Result<MutexGuard<'_, Storage>, StorageError> {
        self.0.lock().map_err(|_| StorageError::Poisoned)
    }

    fn store(&self) -> Result<MutexGuard<'_, Storage>, StoreError> {
        self.lock().map_err(StoreError::from)
    }

    fn sink(&self) -> Result<MutexGuard<'_, Storage>, SinkError> {
        self.lock().map_err(|err| SinkError(err.to_string()))
    }
}

impl ParticleStore for SharedStorage {
    fn load_active(&mut self) -> Result<Vec<Particle>, StoreError> {
        Ok(self.store()?.load_particles(true)?)
    }

    fn load_all(&mut self) -> Result<Vec<Particle>, StoreError> {
        Ok(self.store()?.load_particles(false)?)
    }

    fn save(&mut self, particle: &Particle) -> Result<(), StoreError> {
        Ok(self.store()?.upsert_particle(particle)?)
    }

    fn create(&mut self, particle: Particle) -> Result<ParticleId, StoreError> {
        self.store()?.upsert_particle(&particle)?;
        Ok(particle.id)
    }
}

impl TraitStore for SharedStorage {
    fn latest_for(&mut self, id: ParticleId) -> Result<Option<TraitVector>, StoreError> {
        Ok(self.store()?.latest_traits(id)?)
    }

    fn save_traits(
        &mut self,
        id: ParticleId,
        traits: &TraitVector,
        recorded_at: DateTime<Utc>,
    ) -> Result<TraitRecord, StoreError> {
        Ok(self.store()?.append_traits(id, traits, recorded_at)?)
    }
}

impl EventSink for SharedStorage {
    fn publish(&mut self, event_type: &str, payload: &Value) -> Result<(), SinkError> {
        self.sink()?
            .record_event(event_type, payload, Utc::now())
            .map_err(|err| SinkError(err.to_string()))
    }
}

impl BroadcastHook for SharedStorage {
    fn push_snapshot(&mut self, snapshot: &WorldSnapshot) -> Result<(), SinkError> {
        self.sink()?
            .record_snapshot(snapshot)
            .map_err(|err| SinkError(err.to_string()))
    }
}
