//! `SQLite`-backed entity store implementation.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use minder_core::entities::{Entity, EntityType, Property, PropertyError};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the entity store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The underlying database failed.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("store connection mutex poisoned")]
    Poisoned,

    /// A stored row could not be decoded back into domain types.
    #[error("stored row is corrupt: {reason}")]
    Corrupt {
        /// What failed to decode.
        reason: String,
    },

    /// A stored property value failed wire decoding.
    #[error(transparent)]
    Property(#[from] PropertyError),
}

/// Optional scoping for cross-project entity lookups.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityFilter {
    /// Restrict to one project.
    pub project_id: Option<Uuid>,
    /// Restrict to one provider.
    pub provider_id: Option<Uuid>,
}

/// A cached property row with its freshness stamp.
#[derive(Debug, Clone)]
pub struct PropertyRow {
    /// Owning entity.
    pub entity_id: Uuid,
    /// Property key.
    pub key: String,
    /// Decoded property value.
    pub value: Property,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

/// Project collaborator flags consulted by forwarding checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectFlags {
    /// Whether private repositories may be evaluated in this project.
    pub allow_private_repositories: bool,
}

/// A configured provider row, used by the registry and hint filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    /// Provider id.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Display name.
    pub name: String,
    /// Provider class, e.g. `github-app`.
    pub class: String,
    /// Interfaces the provider implements.
    pub implements: Vec<String>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id                          TEXT PRIMARY KEY,
    name                        TEXT NOT NULL,
    allow_private_repositories  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS providers (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL,
    name        TEXT NOT NULL,
    class       TEXT NOT NULL,
    implements  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
    id               TEXT PRIMARY KEY,
    entity_type      TEXT NOT NULL,
    name             TEXT NOT NULL,
    project_id       TEXT NOT NULL,
    provider_id      TEXT NOT NULL,
    originated_from  TEXT,
    created_at       INTEGER NOT NULL,
    UNIQUE (project_id, provider_id, entity_type, name)
);

CREATE TABLE IF NOT EXISTS properties (
    entity_id   TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (entity_id, key)
);

CREATE INDEX IF NOT EXISTS idx_properties_key_value ON properties(key, value);

CREATE TABLE IF NOT EXISTS entity_legacy_ids (
    entity_type  TEXT NOT NULL,
    upstream_id  TEXT NOT NULL,
    entity_id    TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    PRIMARY KEY (entity_type, upstream_id)
);
";

/// Handle to the entity database.
///
/// Cheap to clone; all clones share one connection.
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an ephemeral in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` inside a transaction; commits on `Ok`, rolls back on `Err`.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&StoreTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = guard.transaction()?;
        let store_tx = StoreTx { tx };
        match f(&store_tx) {
            Ok(value) => {
                store_tx.tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls it back.
                Err(err)
            }
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    /// Fetches an entity by internal id.
    pub fn get_entity_by_id(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, entity_type, name, project_id, provider_id, originated_from
                 FROM entities WHERE id = ?1",
                params![id.to_string()],
                entity_from_row,
            )
            .optional()?
            .transpose()
        })
    }

    /// Fetches an entity by its unique `(project, provider, type, name)`.
    pub fn get_entity_by_name(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<Entity>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, entity_type, name, project_id, provider_id, originated_from
                 FROM entities
                 WHERE project_id = ?1 AND provider_id = ?2 AND entity_type = ?3 AND name = ?4",
                params![
                    project_id.to_string(),
                    provider_id.to_string(),
                    entity_type.as_str(),
                    name
                ],
                entity_from_row,
            )
            .optional()?
            .transpose()
        })
    }

    /// Fetches entities of one type carrying a property with the given
    /// value, optionally scoped to a project and/or provider.
    pub fn get_typed_entities_by_property(
        &self,
        entity_type: EntityType,
        key: &str,
        value: &Property,
        filter: EntityFilter,
    ) -> Result<Vec<Entity>, StoreError> {
        let wire = value.to_wire().to_string();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.entity_type, e.name, e.project_id, e.provider_id,
                        e.originated_from
                 FROM entities e
                 JOIN properties p ON p.entity_id = e.id
                 WHERE e.entity_type = ?1 AND p.key = ?2 AND p.value = ?3
                   AND (?4 IS NULL OR e.project_id = ?4)
                   AND (?5 IS NULL OR e.provider_id = ?5)
                 ORDER BY e.id",
            )?;
            let rows = stmt.query_map(
                params![
                    entity_type.as_str(),
                    key,
                    wire,
                    filter.project_id.map(|id| id.to_string()),
                    filter.provider_id.map(|id| id.to_string()),
                ],
                entity_from_row,
            )?;
            let mut entities = Vec::new();
            for row in rows {
                entities.push(row??);
            }
            Ok(entities)
        })
    }

    /// Loads every cached property row for an entity.
    pub fn get_all_properties_for_entity(
        &self,
        entity_id: Uuid,
    ) -> Result<Vec<PropertyRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_id, key, value, updated_at
                 FROM properties WHERE entity_id = ?1",
            )?;
            let rows = stmt.query_map(params![entity_id.to_string()], property_row_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    /// Loads a single cached property row.
    pub fn get_property(
        &self,
        entity_id: Uuid,
        key: &str,
    ) -> Result<Option<PropertyRow>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT entity_id, key, value, updated_at
                 FROM properties WHERE entity_id = ?1 AND key = ?2",
                params![entity_id.to_string(), key],
                property_row_from_row,
            )
            .optional()?
            .transpose()
        })
    }

    /// Loads the collaborator flags for a project.
    pub fn get_project_flags(&self, project_id: Uuid) -> Result<Option<ProjectFlags>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT allow_private_repositories FROM projects WHERE id = ?1",
                    params![project_id.to_string()],
                    |row| {
                        Ok(ProjectFlags {
                            allow_private_repositories: row.get::<_, i64>(0)? != 0,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Loads a configured provider row.
    pub fn get_provider_record(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<ProviderRecord>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, project_id, name, class, implements FROM providers WHERE id = ?1",
                params![provider_id.to_string()],
                provider_record_from_row,
            )
            .optional()?
            .transpose()
        })
    }

    /// Loads every configured provider row.
    pub fn list_provider_records(&self) -> Result<Vec<ProviderRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, project_id, name, class, implements FROM providers")?;
            let rows = stmt.query_map([], provider_record_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }
}

/// A store transaction; mutations commit together or not at all.
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl StoreTx<'_> {
    /// Creates the entity if its `(project, provider, type, name)` slot is
    /// free, otherwise returns the existing row.
    pub fn create_or_ensure_entity_by_id(
        &self,
        id: Uuid,
        entity_type: EntityType,
        name: &str,
        project_id: Uuid,
        provider_id: Uuid,
        originated_from: Option<Uuid>,
    ) -> Result<Entity, StoreError> {
        if let Some(existing) = self
            .tx
            .query_row(
                "SELECT id, entity_type, name, project_id, provider_id, originated_from
                 FROM entities
                 WHERE project_id = ?1 AND provider_id = ?2 AND entity_type = ?3 AND name = ?4",
                params![
                    project_id.to_string(),
                    provider_id.to_string(),
                    entity_type.as_str(),
                    name
                ],
                entity_from_row,
            )
            .optional()?
            .transpose()?
        {
            return Ok(existing);
        }

        self.tx.execute(
            "INSERT INTO entities
             (id, entity_type, name, project_id, provider_id, originated_from, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                entity_type.as_str(),
                name,
                project_id.to_string(),
                provider_id.to_string(),
                originated_from.map(|id| id.to_string()),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(Entity {
            id,
            entity_type,
            name: name.to_owned(),
            project_id,
            provider_id,
            originated_from,
        })
    }

    /// Deletes an entity by its unique name; absent targets are not an
    /// error.
    pub fn delete_entity_by_name(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        name: &str,
    ) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM entities
             WHERE project_id = ?1 AND provider_id = ?2 AND entity_type = ?3 AND name = ?4",
            params![
                project_id.to_string(),
                provider_id.to_string(),
                entity_type.as_str(),
                name
            ],
        )?;
        Ok(())
    }

    /// Writes a property row, bumping `updated_at` on every call.
    pub fn upsert_property(
        &self,
        entity_id: Uuid,
        key: &str,
        value: &Property,
    ) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO properties (entity_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_id, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                entity_id.to_string(),
                key,
                value.to_wire().to_string(),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Deletes a single property row.
    pub fn delete_property(&self, entity_id: Uuid, key: &str) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM properties WHERE entity_id = ?1 AND key = ?2",
            params![entity_id.to_string(), key],
        )?;
        Ok(())
    }

    /// Deletes every property row for an entity.
    pub fn delete_all_properties(&self, entity_id: Uuid) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM properties WHERE entity_id = ?1",
            params![entity_id.to_string()],
        )?;
        Ok(())
    }

    /// Writes the legacy per-type compatibility row older consumers read.
    pub fn upsert_legacy_id(
        &self,
        entity_type: EntityType,
        upstream_id: &str,
        entity_id: Uuid,
    ) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO entity_legacy_ids (entity_type, upstream_id, entity_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (entity_type, upstream_id)
             DO UPDATE SET entity_id = excluded.entity_id",
            params![entity_type.as_str(), upstream_id, entity_id.to_string()],
        )?;
        Ok(())
    }

    /// Creates or updates a project row.
    pub fn upsert_project(
        &self,
        project_id: Uuid,
        name: &str,
        flags: ProjectFlags,
    ) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO projects (id, name, allow_private_repositories)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (id)
             DO UPDATE SET name = excluded.name,
                           allow_private_repositories = excluded.allow_private_repositories",
            params![
                project_id.to_string(),
                name,
                i64::from(flags.allow_private_repositories)
            ],
        )?;
        Ok(())
    }

    /// Creates or updates a provider row.
    pub fn upsert_provider(&self, record: &ProviderRecord) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO providers (id, project_id, name, class, implements)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (id)
             DO UPDATE SET project_id = excluded.project_id, name = excluded.name,
                           class = excluded.class, implements = excluded.implements",
            params![
                record.id.to_string(),
                record.project_id.to_string(),
                record.name,
                record.class,
                record.implements.join(","),
            ],
        )?;
        Ok(())
    }
}

type RowResult<T> = rusqlite::Result<Result<T, StoreError>>;

fn entity_from_row(row: &rusqlite::Row<'_>) -> RowResult<Entity> {
    let id: String = row.get(0)?;
    let entity_type: String = row.get(1)?;
    let name: String = row.get(2)?;
    let project_id: String = row.get(3)?;
    let provider_id: String = row.get(4)?;
    let originated_from: Option<String> = row.get(5)?;
    Ok(decode_entity(
        &id,
        &entity_type,
        name,
        &project_id,
        &provider_id,
        originated_from,
    ))
}

fn decode_entity(
    id: &str,
    entity_type: &str,
    name: String,
    project_id: &str,
    provider_id: &str,
    originated_from: Option<String>,
) -> Result<Entity, StoreError> {
    Ok(Entity {
        id: parse_uuid(id)?,
        entity_type: EntityType::from_str(entity_type).map_err(|e| StoreError::Corrupt {
            reason: e.to_string(),
        })?,
        name,
        project_id: parse_uuid(project_id)?,
        provider_id: parse_uuid(provider_id)?,
        originated_from: originated_from.as_deref().map(parse_uuid).transpose()?,
    })
}

fn property_row_from_row(row: &rusqlite::Row<'_>) -> RowResult<PropertyRow> {
    let entity_id: String = row.get(0)?;
    let key: String = row.get(1)?;
    let value: String = row.get(2)?;
    let updated_at: i64 = row.get(3)?;
    Ok(decode_property_row(&entity_id, key, &value, updated_at))
}

fn decode_property_row(
    entity_id: &str,
    key: String,
    value: &str,
    updated_at: i64,
) -> Result<PropertyRow, StoreError> {
    let wire: serde_json::Value =
        serde_json::from_str(value).map_err(|e| StoreError::Corrupt {
            reason: format!("property value is not JSON: {e}"),
        })?;
    Ok(PropertyRow {
        entity_id: parse_uuid(entity_id)?,
        key,
        value: Property::from_wire(&wire)?,
        updated_at: DateTime::from_timestamp(updated_at, 0).ok_or(StoreError::Corrupt {
            reason: format!("timestamp {updated_at} out of range"),
        })?,
    })
}

fn provider_record_from_row(row: &rusqlite::Row<'_>) -> RowResult<ProviderRecord> {
    let id: String = row.get(0)?;
    let project_id: String = row.get(1)?;
    let name: String = row.get(2)?;
    let class: String = row.get(3)?;
    let implements: String = row.get(4)?;
    let decoded: Result<ProviderRecord, StoreError> = (|| {
        Ok(ProviderRecord {
            id: parse_uuid(&id)?,
            project_id: parse_uuid(&project_id)?,
            name,
            class,
            implements: implements
                .split(',')
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        })
    })();
    Ok(decoded)
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    raw.parse().map_err(|e| StoreError::Corrupt {
        reason: format!("malformed UUID {raw:?}: {e}"),
    })
}
