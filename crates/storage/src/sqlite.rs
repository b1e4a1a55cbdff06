use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use bibedit_core::{RecId, Record, UserId, request::ChangesetSummary};

use crate::error::StorageError;
use crate::traits::{CacheEntry, CacheMeta, CacheStore, HpChangeset};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

// Named encoding: the cached structures contain tagged enums, which need
// field names to decode.
fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec_named(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub struct SqliteCache {
    conn: Connection,
}

impl SqliteCache {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn read_meta(
    uid: i64,
    mtime_ms: i64,
    dirty: bool,
    fingerprint: Vec<u8>,
) -> Result<CacheMeta, StorageError> {
    Ok(CacheMeta {
        uid: UserId(uid as u64),
        mtime_ms: mtime_ms as u64,
        dirty,
        fingerprint: to_array::<32>(fingerprint, "fingerprint")?,
    })
}

impl CacheStore for SqliteCache {
    fn write_cache(
        &mut self,
        rec_id: RecId,
        uid: UserId,
        entry: &CacheEntry,
        now_ms: u64,
    ) -> Result<u64, StorageError> {
        let fingerprint = entry.record.fingerprint()?;
        let blob = encode(entry)?;
        self.conn.execute(
            "INSERT INTO editor_cache (rec_id, uid, mtime_ms, dirty, fingerprint, entry)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (rec_id, uid) DO UPDATE SET
                mtime_ms = excluded.mtime_ms,
                dirty = excluded.dirty,
                fingerprint = excluded.fingerprint,
                entry = excluded.entry",
            rusqlite::params![
                rec_id.0 as i64,
                uid.0 as i64,
                now_ms as i64,
                entry.dirty,
                &fingerprint[..],
                blob,
            ],
        )?;
        debug!(%rec_id, %uid, mtime_ms = now_ms, dirty = entry.dirty, "cache written");
        Ok(now_ms)
    }

    fn read_cache(&self, rec_id: RecId, uid: UserId) -> Result<Option<CacheEntry>, StorageError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT entry FROM editor_cache WHERE rec_id = ?1 AND uid = ?2",
                rusqlite::params![rec_id.0 as i64, uid.0 as i64],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|bytes| decode(&bytes)).transpose()
    }

    fn cache_exists(&self, rec_id: RecId, uid: UserId) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM editor_cache WHERE rec_id = ?1 AND uid = ?2",
            rusqlite::params![rec_id.0 as i64, uid.0 as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn cache_meta(&self, rec_id: RecId, uid: UserId) -> Result<Option<CacheMeta>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, mtime_ms, dirty, fingerprint FROM editor_cache WHERE rec_id = ?1 AND uid = ?2",
        )?;
        let mut rows = stmt.query_map(
            rusqlite::params![rec_id.0 as i64, uid.0 as i64],
            |row| {
                let uid: i64 = row.get(0)?;
                let mtime_ms: i64 = row.get(1)?;
                let dirty: bool = row.get(2)?;
                let fingerprint: Vec<u8> = row.get(3)?;
                Ok((uid, mtime_ms, dirty, fingerprint))
            },
        )?;

        match rows.next() {
            Some(Ok((uid, mtime_ms, dirty, fingerprint))) => {
                Ok(Some(read_meta(uid, mtime_ms, dirty, fingerprint)?))
            }
            Some(Err(e)) => Err(StorageError::Sqlite(e)),
            None => Ok(None),
        }
    }

    fn cache_holders(&self, rec_id: RecId) -> Result<Vec<CacheMeta>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, mtime_ms, dirty, fingerprint FROM editor_cache WHERE rec_id = ?1 ORDER BY mtime_ms, uid",
        )?;
        let rows = stmt.query_map(rusqlite::params![rec_id.0 as i64], |row| {
            let uid: i64 = row.get(0)?;
            let mtime_ms: i64 = row.get(1)?;
            let dirty: bool = row.get(2)?;
            let fingerprint: Vec<u8> = row.get(3)?;
            Ok((uid, mtime_ms, dirty, fingerprint))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (uid, mtime_ms, dirty, fingerprint) = row?;
            result.push(read_meta(uid, mtime_ms, dirty, fingerprint)?);
        }
        Ok(result)
    }

    fn delete_cache(&mut self, rec_id: RecId, uid: UserId) -> Result<bool, StorageError> {
        let n = self.conn.execute(
            "DELETE FROM editor_cache WHERE rec_id = ?1 AND uid = ?2",
            rusqlite::params![rec_id.0 as i64, uid.0 as i64],
        )?;
        if n > 0 {
            debug!(%rec_id, %uid, "cache deleted");
        }
        Ok(n > 0)
    }

    fn touch_cache(
        &mut self,
        rec_id: RecId,
        uid: UserId,
        now_ms: u64,
    ) -> Result<(), StorageError> {
        let n = self.conn.execute(
            "UPDATE editor_cache SET mtime_ms = ?3 WHERE rec_id = ?1 AND uid = ?2",
            rusqlite::params![rec_id.0 as i64, uid.0 as i64, now_ms as i64],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound(format!("cache for record {rec_id}")));
        }
        Ok(())
    }

    fn insert_hp_changeset(
        &mut self,
        rec_id: RecId,
        record: &Record,
        now_ms: u64,
    ) -> Result<u64, StorageError> {
        let blob = encode(record)?;
        self.conn.execute(
            "INSERT INTO hp_changesets (rec_id, record, created_ms) VALUES (?1, ?2, ?3)",
            rusqlite::params![rec_id.0 as i64, blob, now_ms as i64],
        )?;
        let number = self.conn.last_insert_rowid() as u64;
        debug!(%rec_id, changeset_number = number, "holding pen changeset stored");
        Ok(number)
    }

    fn get_hp_changeset(&self, changeset_number: u64) -> Result<Option<HpChangeset>, StorageError> {
        let row: Option<(i64, Vec<u8>, i64)> = self
            .conn
            .query_row(
                "SELECT rec_id, record, created_ms FROM hp_changesets WHERE changeset_number = ?1",
                rusqlite::params![changeset_number as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((rec_id, blob, created_ms)) => Ok(Some(HpChangeset {
                changeset_number,
                rec_id: RecId(rec_id as u64),
                record: decode(&blob)?,
                created_ms: created_ms as u64,
            })),
            None => Ok(None),
        }
    }

    fn list_hp_changesets(&self, rec_id: RecId) -> Result<Vec<ChangesetSummary>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT changeset_number, created_ms FROM hp_changesets WHERE rec_id = ?1 ORDER BY changeset_number",
        )?;
        let rows = stmt.query_map(rusqlite::params![rec_id.0 as i64], |row| {
            let number: i64 = row.get(0)?;
            let created_ms: i64 = row.get(1)?;
            Ok(ChangesetSummary {
                changeset_number: number as u64,
                changeset_date: created_ms.to_string(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete_hp_changeset(&mut self, changeset_number: u64) -> Result<bool, StorageError> {
        let n = self.conn.execute(
            "DELETE FROM hp_changesets WHERE changeset_number = ?1",
            rusqlite::params![changeset_number as i64],
        )?;
        Ok(n > 0)
    }
}
