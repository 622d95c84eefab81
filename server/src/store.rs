use chrono::{DateTime, Utc};
use postgres::{GenericClient, NoTls};
use rusqlite::{params, OptionalExtension};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use wagerboard_types::{Race, RaceDraft, RaceParticipant, RaceSnapshot, RaceStatus, RaceType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("invalid postgres url: {0}")]
    InvalidUrl(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store worker failed: {0}")]
    Worker(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Where races are persisted.
#[derive(Clone, Debug)]
pub enum StoreLocation {
    Memory,
    Sqlite(PathBuf),
    Postgres(String),
}

enum PersistenceBackend {
    Sqlite(rusqlite::Connection),
    Postgres(postgres::Client),
}

/// Outcome of writing a race snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredSnapshot {
    pub snapshot: RaceSnapshot,
    /// False when a race already existed for the period and was returned as is.
    pub created: bool,
}

/// Relational store for races and their participants.
///
/// The drivers are synchronous; every call runs on the blocking pool and is
/// bounded by the configured timeout. A timed out write may still commit, but
/// it is never partially visible.
#[derive(Clone)]
pub struct RaceStore {
    backend: Arc<Mutex<PersistenceBackend>>,
    timeout: Duration,
}

impl RaceStore {
    pub async fn open(location: StoreLocation, timeout: Duration) -> Result<Self, StoreError> {
        let backend = tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
            match location {
                StoreLocation::Memory => {
                    let conn = rusqlite::Connection::open_in_memory()?;
                    init_schema_sqlite(&conn)?;
                    Ok(PersistenceBackend::Sqlite(conn))
                }
                StoreLocation::Sqlite(path) => open_sqlite(&path),
                StoreLocation::Postgres(url) => {
                    validate_postgres_url(&url, allow_public_postgres(), allow_postgres_hostname())?;
                    let mut client = postgres::Client::connect(&url, NoTls)?;
                    init_schema_postgres(&mut client)?;
                    Ok(PersistenceBackend::Postgres(client))
                }
            }
        })
        .await
        .map_err(|err| StoreError::Worker(err.to_string()))??;
        Ok(Self {
            backend: Arc::new(Mutex::new(backend)),
            timeout,
        })
    }

    /// Persists a race with its participants in one transaction.
    ///
    /// When a race already exists for `(race_type, start_date)` nothing is
    /// written and the existing snapshot is returned.
    pub async fn insert_snapshot(
        &self,
        draft: RaceDraft,
        created_at: DateTime<Utc>,
    ) -> Result<StoredSnapshot, StoreError> {
        self.run(move |backend| match backend {
            PersistenceBackend::Sqlite(conn) => insert_snapshot_sqlite(conn, &draft, created_at),
            PersistenceBackend::Postgres(client) => {
                insert_snapshot_postgres(client, &draft, created_at)
            }
        })
        .await
    }

    pub async fn race_for_period(
        &self,
        race_type: RaceType,
        start_date: DateTime<Utc>,
    ) -> Result<Option<RaceSnapshot>, StoreError> {
        self.run(move |backend| match backend {
            PersistenceBackend::Sqlite(conn) => {
                let id = conn
                    .query_row(
                        "SELECT id FROM races WHERE race_type = ?1 AND start_date = ?2",
                        params![race_type.as_str(), start_date.timestamp_millis()],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()?;
                id.map(|id| load_snapshot_sqlite(conn, id)).transpose()
            }
            PersistenceBackend::Postgres(client) => {
                let row = client.query_opt(
                    "SELECT id FROM races WHERE race_type = $1 AND start_date = $2",
                    &[&race_type.as_str(), &start_date.timestamp_millis()],
                )?;
                match row {
                    Some(row) => Ok(Some(load_snapshot_postgres(client, row.try_get(0)?)?)),
                    None => Ok(None),
                }
            }
        })
        .await
    }

    /// Most recently started race of `race_type` that is currently live.
    pub async fn current_race(&self, race_type: RaceType) -> Result<Option<RaceSnapshot>, StoreError> {
        self.latest_with_status(race_type, RaceStatus::Live, "start_date")
            .await
    }

    /// Most recently ended race of `race_type` that has completed.
    pub async fn previous_race(
        &self,
        race_type: RaceType,
    ) -> Result<Option<RaceSnapshot>, StoreError> {
        self.latest_with_status(race_type, RaceStatus::Completed, "end_date")
            .await
    }

    /// Moves races along `upcoming -> live -> completed` according to `now`.
    /// Returns the number of races whose status changed.
    pub async fn advance_statuses(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let now_ms = now.timestamp_millis();
        self.run(move |backend| match backend {
            PersistenceBackend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                let completed = tx.execute(
                    "UPDATE races SET status = 'completed' WHERE status <> 'completed' AND end_date <= ?1",
                    params![now_ms],
                )?;
                let started = tx.execute(
                    "UPDATE races SET status = 'live' WHERE status = 'upcoming' AND start_date <= ?1 AND end_date > ?1",
                    params![now_ms],
                )?;
                tx.commit()?;
                Ok((completed + started) as u64)
            }
            PersistenceBackend::Postgres(client) => {
                let mut tx = client.transaction()?;
                let completed = tx.execute(
                    "UPDATE races SET status = 'completed' WHERE status <> 'completed' AND end_date <= $1",
                    &[&now_ms],
                )?;
                let started = tx.execute(
                    "UPDATE races SET status = 'live' WHERE status = 'upcoming' AND start_date <= $1 AND end_date > $1",
                    &[&now_ms],
                )?;
                tx.commit()?;
                Ok(completed + started)
            }
        })
        .await
    }

    async fn latest_with_status(
        &self,
        race_type: RaceType,
        status: RaceStatus,
        order_column: &'static str,
    ) -> Result<Option<RaceSnapshot>, StoreError> {
        self.run(move |backend| match backend {
            PersistenceBackend::Sqlite(conn) => {
                let id = conn
                    .query_row(
                        &format!(
                            "SELECT id FROM races WHERE race_type = ?1 AND status = ?2 ORDER BY {order_column} DESC, id DESC LIMIT 1"
                        ),
                        params![race_type.as_str(), status.as_str()],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()?;
                id.map(|id| load_snapshot_sqlite(conn, id)).transpose()
            }
            PersistenceBackend::Postgres(client) => {
                let row = client.query_opt(
                    &format!(
                        "SELECT id FROM races WHERE race_type = $1 AND status = $2 ORDER BY {order_column} DESC, id DESC LIMIT 1"
                    ),
                    &[&race_type.as_str(), &status.as_str()],
                )?;
                match row {
                    Some(row) => Ok(Some(load_snapshot_postgres(client, row.try_get(0)?)?)),
                    None => Ok(None),
                }
            }
        })
        .await
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PersistenceBackend) -> Result<T, StoreError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = match backend.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    tracing::warn!("race store lock poisoned; recovering");
                    poisoned.into_inner()
                }
            };
            op(&mut guard)
        });
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(StoreError::Worker(err.to_string())),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

fn open_sqlite(path: &Path) -> Result<PersistenceBackend, StoreError> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    init_schema_sqlite(&conn)?;
    Ok(PersistenceBackend::Sqlite(conn))
}

fn init_schema_sqlite(conn: &rusqlite::Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA foreign_keys=ON;
         CREATE TABLE IF NOT EXISTS races (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             title TEXT NOT NULL,
             race_type TEXT NOT NULL,
             status TEXT NOT NULL,
             prize_pool REAL NOT NULL,
             start_date INTEGER NOT NULL,
             end_date INTEGER NOT NULL,
             created_at INTEGER NOT NULL,
             UNIQUE (race_type, start_date)
         );
         CREATE TABLE IF NOT EXISTS race_participants (
             race_id INTEGER NOT NULL REFERENCES races(id),
             uid TEXT NOT NULL,
             name TEXT NOT NULL,
             wagered REAL NOT NULL,
             position INTEGER NOT NULL,
             PRIMARY KEY (race_id, position)
         );
         CREATE INDEX IF NOT EXISTS races_status ON races(race_type, status);",
    )?;
    Ok(())
}

fn insert_snapshot_sqlite(
    conn: &mut rusqlite::Connection,
    draft: &RaceDraft,
    created_at: DateTime<Utc>,
) -> Result<StoredSnapshot, StoreError> {
    let tx = conn.transaction()?;
    let inserted = tx
        .query_row(
            "INSERT INTO races (title, race_type, status, prize_pool, start_date, end_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (race_type, start_date) DO NOTHING
             RETURNING id",
            params![
                draft.title,
                draft.race_type.as_str(),
                draft.status.as_str(),
                draft.prize_pool,
                draft.start_date.timestamp_millis(),
                draft.end_date.timestamp_millis(),
                created_at.timestamp_millis(),
            ],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    let (race_id, created) = match inserted {
        Some(race_id) => {
            for participant in &draft.participants {
                tx.execute(
                    "INSERT INTO race_participants (race_id, uid, name, wagered, position)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        race_id,
                        participant.uid,
                        participant.name,
                        participant.wagered,
                        i64::from(participant.position),
                    ],
                )?;
            }
            (race_id, true)
        }
        None => {
            let race_id = tx.query_row(
                "SELECT id FROM races WHERE race_type = ?1 AND start_date = ?2",
                params![draft.race_type.as_str(), draft.start_date.timestamp_millis()],
                |row| row.get::<_, i64>(0),
            )?;
            (race_id, false)
        }
    };
    let snapshot = load_snapshot_sqlite(&tx, race_id)?;
    tx.commit()?;
    Ok(StoredSnapshot { snapshot, created })
}

fn load_snapshot_sqlite(
    conn: &rusqlite::Connection,
    race_id: i64,
) -> Result<RaceSnapshot, StoreError> {
    let row = conn.query_row(
        "SELECT id, title, race_type, status, prize_pool, start_date, end_date, created_at
         FROM races WHERE id = ?1",
        params![race_id],
        |row| {
            Ok(RaceRow {
                id: row.get(0)?,
                title: row.get(1)?,
                race_type: row.get(2)?,
                status: row.get(3)?,
                prize_pool: row.get(4)?,
                start_date: row.get(5)?,
                end_date: row.get(6)?,
                created_at: row.get(7)?,
            })
        },
    )?;
    let race = row.into_race()?;

    let mut stmt = conn.prepare(
        "SELECT uid, name, wagered, position FROM race_participants
         WHERE race_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![race_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;
    let mut participants = Vec::new();
    for row in rows {
        let (uid, name, wagered, position) = row?;
        participants.push(participant(race_id, uid, name, wagered, position)?);
    }
    Ok(RaceSnapshot { race, participants })
}

fn init_schema_postgres(client: &mut postgres::Client) -> Result<(), StoreError> {
    client.batch_execute(
        "CREATE TABLE IF NOT EXISTS races (
             id BIGSERIAL PRIMARY KEY,
             title TEXT NOT NULL,
             race_type TEXT NOT NULL,
             status TEXT NOT NULL,
             prize_pool DOUBLE PRECISION NOT NULL,
             start_date BIGINT NOT NULL,
             end_date BIGINT NOT NULL,
             created_at BIGINT NOT NULL,
             UNIQUE (race_type, start_date)
         );
         CREATE TABLE IF NOT EXISTS race_participants (
             race_id BIGINT NOT NULL REFERENCES races(id),
             uid TEXT NOT NULL,
             name TEXT NOT NULL,
             wagered DOUBLE PRECISION NOT NULL,
             position BIGINT NOT NULL,
             PRIMARY KEY (race_id, position)
         );
         CREATE INDEX IF NOT EXISTS races_status ON races(race_type, status);",
    )?;
    Ok(())
}

fn insert_snapshot_postgres(
    client: &mut postgres::Client,
    draft: &RaceDraft,
    created_at: DateTime<Utc>,
) -> Result<StoredSnapshot, StoreError> {
    let mut tx = client.transaction()?;
    let start_ms = draft.start_date.timestamp_millis();
    let inserted = tx.query_opt(
        "INSERT INTO races (title, race_type, status, prize_pool, start_date, end_date, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (race_type, start_date) DO NOTHING
         RETURNING id",
        &[
            &draft.title,
            &draft.race_type.as_str(),
            &draft.status.as_str(),
            &draft.prize_pool,
            &start_ms,
            &draft.end_date.timestamp_millis(),
            &created_at.timestamp_millis(),
        ],
    )?;
    let (race_id, created) = match inserted {
        Some(row) => {
            let race_id: i64 = row.try_get(0)?;
            for participant in &draft.participants {
                tx.execute(
                    "INSERT INTO race_participants (race_id, uid, name, wagered, position)
                     VALUES ($1, $2, $3, $4, $5)",
                    &[
                        &race_id,
                        &participant.uid,
                        &participant.name,
                        &participant.wagered,
                        &i64::from(participant.position),
                    ],
                )?;
            }
            (race_id, true)
        }
        None => {
            let row = tx.query_one(
                "SELECT id FROM races WHERE race_type = $1 AND start_date = $2",
                &[&draft.race_type.as_str(), &start_ms],
            )?;
            (row.try_get(0)?, false)
        }
    };
    let snapshot = load_snapshot_postgres(&mut tx, race_id)?;
    tx.commit()?;
    Ok(StoredSnapshot { snapshot, created })
}

fn load_snapshot_postgres(
    client: &mut impl GenericClient,
    race_id: i64,
) -> Result<RaceSnapshot, StoreError> {
    let row = client.query_one(
        "SELECT id, title, race_type, status, prize_pool, start_date, end_date, created_at
         FROM races WHERE id = $1",
        &[&race_id],
    )?;
    let race = RaceRow {
        id: row.try_get(0)?,
        title: row.try_get(1)?,
        race_type: row.try_get(2)?,
        status: row.try_get(3)?,
        prize_pool: row.try_get(4)?,
        start_date: row.try_get(5)?,
        end_date: row.try_get(6)?,
        created_at: row.try_get(7)?,
    }
    .into_race()?;

    let rows = client.query(
        "SELECT uid, name, wagered, position FROM race_participants
         WHERE race_id = $1 ORDER BY position ASC",
        &[&race_id],
    )?;
    let participants = rows
        .iter()
        .map(|row| {
            participant(
                race_id,
                row.try_get(0)?,
                row.try_get(1)?,
                row.try_get(2)?,
                row.try_get(3)?,
            )
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    Ok(RaceSnapshot { race, participants })
}

struct RaceRow {
    id: i64,
    title: String,
    race_type: String,
    status: String,
    prize_pool: f64,
    start_date: i64,
    end_date: i64,
    created_at: i64,
}

impl RaceRow {
    fn into_race(self) -> Result<Race, StoreError> {
        Ok(Race {
            id: self.id,
            title: self.title,
            race_type: self
                .race_type
                .parse()
                .map_err(|err| StoreError::Corrupt(format!("race {}: {err}", self.id)))?,
            status: self
                .status
                .parse()
                .map_err(|err| StoreError::Corrupt(format!("race {}: {err}", self.id)))?,
            prize_pool: self.prize_pool,
            start_date: from_millis(self.start_date)?,
            end_date: from_millis(self.end_date)?,
            created_at: from_millis(self.created_at)?,
        })
    }
}

fn participant(
    race_id: i64,
    uid: String,
    name: String,
    wagered: f64,
    position: i64,
) -> Result<RaceParticipant, StoreError> {
    let position = u32::try_from(position)
        .map_err(|_| StoreError::Corrupt(format!("race {race_id}: position {position}")))?;
    Ok(RaceParticipant {
        race_id,
        uid,
        name,
        wagered,
        position,
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn validate_postgres_url(
    url: &str,
    allow_public: bool,
    allow_hostname: bool,
) -> Result<(), StoreError> {
    let parsed = Url::parse(url).map_err(|err| StoreError::InvalidUrl(err.to_string()))?;
    let scheme = parsed.scheme();
    if scheme != "postgres" && scheme != "postgresql" {
        return Err(StoreError::InvalidUrl(
            "must start with postgres:// or postgresql://".to_string(),
        ));
    }
    if allow_public {
        return Ok(());
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| StoreError::InvalidUrl("missing host".to_string()))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }

    let ip = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = ip.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Ok(());
        }
        return Err(StoreError::InvalidUrl(
            "host is public; set STORE_ALLOW_PUBLIC_POSTGRES=1 to override".to_string(),
        ));
    }

    if allow_hostname {
        return Ok(());
    }

    Err(StoreError::InvalidUrl(
        "host must be a private IP; set STORE_ALLOW_POSTGRES_HOSTNAME=1 to allow hostnames"
            .to_string(),
    ))
}

fn allow_public_postgres() -> bool {
    env_flag("STORE_ALLOW_PUBLIC_POSTGRES")
}

fn allow_postgres_hostname() -> bool {
    env_flag("STORE_ALLOW_POSTGRES_HOSTNAME")
}

fn env_flag(var: &str) -> bool {
    matches!(
        std::env::var(var).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}
