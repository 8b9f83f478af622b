//! SQLite-backed Store implementation

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};
use tracing::{debug, info};

use crate::{Filter, IndexValue, Record};

/// Database file name inside the store directory
pub const DB_FILE: &str = "relay.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS record_indexes (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    field TEXT NOT NULL,
    value_text TEXT,
    value_int INTEGER,
    PRIMARY KEY (collection, id, field)
);
CREATE INDEX IF NOT EXISTS idx_record_indexes_lookup
    ON record_indexes (collection, field, value_text, value_int);
CREATE INDEX IF NOT EXISTS idx_records_updated
    ON records (collection, updated_at);
"#;

/// Persistent record store
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the store inside `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(dir = %dir.display(), "Store::open: called");
        fs::create_dir_all(dir).context("Failed to create store directory")?;

        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path).context(format!("Failed to open database {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA).context("Failed to apply store schema")?;

        info!(path = %db_path.display(), "Store opened");
        Ok(Self {
            conn,
            path: Some(db_path),
        })
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA).context("Failed to apply store schema")?;
        Ok(Self { conn, path: None })
    }

    /// Path of the database file (None for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert a new record; fails if the id already exists
    pub fn create<T: Record>(&mut self, record: T) -> Result<String> {
        let collection = T::collection_name();
        let id = record.id().to_string();
        debug!(collection, %id, "Store::create: called");

        let tx = self.conn.transaction()?;
        if exists(&tx, collection, &id)? {
            return Err(eyre::eyre!("Record already exists: {}/{}", collection, id));
        }
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(id)
    }

    /// Replace an existing record; fails if it does not exist
    pub fn update<T: Record>(&mut self, record: T) -> Result<()> {
        let collection = T::collection_name();
        debug!(collection, id = record.id(), "Store::update: called");

        let tx = self.conn.transaction()?;
        if !exists(&tx, collection, record.id())? {
            return Err(eyre::eyre!("Record not found: {}/{}", collection, record.id()));
        }
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(())
    }

    /// Replace two existing records in one transaction; neither is written unless both exist
    pub fn update_pair<A: Record, B: Record>(&mut self, first: A, second: B) -> Result<()> {
        debug!(first = first.id(), second = second.id(), "Store::update_pair: called");

        let tx = self.conn.transaction()?;
        if !exists(&tx, A::collection_name(), first.id())? {
            return Err(eyre::eyre!("Record not found: {}/{}", A::collection_name(), first.id()));
        }
        if !exists(&tx, B::collection_name(), second.id())? {
            return Err(eyre::eyre!("Record not found: {}/{}", B::collection_name(), second.id()));
        }
        write_record(&tx, &first)?;
        write_record(&tx, &second)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert or replace a record
    pub fn upsert<T: Record>(&mut self, record: T) -> Result<()> {
        debug!(collection = T::collection_name(), id = record.id(), "Store::upsert: called");
        let tx = self.conn.transaction()?;
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let collection = T::collection_name();
        debug!(collection, %id, "Store::get: called");

        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => {
                let record = serde_json::from_str(&json).context(format!("Corrupt record {}/{}", collection, id))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List records matching every filter, most recently updated first
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        self.query(filters, None)
    }

    /// Like [`Store::list`] but returns at most `limit` records
    pub fn list_recent<T: Record>(&self, filters: &[Filter], limit: usize) -> Result<Vec<T>> {
        self.query(filters, Some(limit))
    }

    /// Delete a record by id, returning whether it existed
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<bool> {
        let collection = T::collection_name();
        debug!(collection, %id, "Store::delete: called");

        let tx = self.conn.transaction()?;
        let removed = delete_row(&tx, collection, id)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Delete every record matching all filters, returning how many were removed
    pub fn delete_where<T: Record>(&mut self, filters: &[Filter]) -> Result<usize> {
        let collection = T::collection_name();
        debug!(collection, filter_count = filters.len(), "Store::delete_where: called");

        let ids = self.matching_ids(collection, filters)?;
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        for id in &ids {
            if delete_row(&tx, collection, id)? {
                removed += 1;
            }
        }
        tx.commit()?;
        debug!(collection, removed, "Store::delete_where: done");
        Ok(removed)
    }

    /// Recompute the field index for every record in a collection
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        let collection = T::collection_name();
        debug!(collection, "Store::rebuild_indexes: called");

        let records: Vec<T> = self.list(&[])?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM record_indexes WHERE collection = ?1", params![collection])?;
        for record in &records {
            write_indexes(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn query<T: Record>(&self, filters: &[Filter], limit: Option<usize>) -> Result<Vec<T>> {
        let collection = T::collection_name();
        debug!(collection, filter_count = filters.len(), ?limit, "Store::query: called");

        let mut values = vec![Value::Text(collection.to_string())];
        let mut sql = format!(
            "SELECT r.data FROM records r WHERE r.collection = ?{}",
            filter_clause(filters, &mut values)
        );
        sql.push_str(" ORDER BY r.updated_at DESC, r.id ASC");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| serde_json::from_str(json).context(format!("Corrupt record in {}", collection)))
            .collect()
    }

    fn matching_ids(&self, collection: &str, filters: &[Filter]) -> Result<Vec<String>> {
        let mut values = vec![Value::Text(collection.to_string())];
        let sql = format!(
            "SELECT r.id FROM records r WHERE r.collection = ?{}",
            filter_clause(filters, &mut values)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn filter_clause(filters: &[Filter], values: &mut Vec<Value>) -> String {
    let mut clause = String::new();
    for filter in filters {
        let column = match filter.value {
            IndexValue::String(_) => "value_text",
            IndexValue::Int(_) | IndexValue::Bool(_) => "value_int",
        };
        clause.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM record_indexes i WHERE i.collection = r.collection \
             AND i.id = r.id AND i.field = ? AND i.{} {} ?)",
            column,
            filter.op.as_sql()
        ));
        values.push(Value::Text(filter.field.clone()));
        values.push(index_to_sql(&filter.value));
    }
    clause
}

fn index_to_sql(value: &IndexValue) -> Value {
    match value {
        IndexValue::String(s) => Value::Text(s.clone()),
        IndexValue::Int(i) => Value::Integer(*i),
        IndexValue::Bool(b) => Value::Integer(i64::from(*b)),
    }
}

fn exists(tx: &Transaction<'_>, collection: &str, id: &str) -> Result<bool> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn write_record<T: Record>(tx: &Transaction<'_>, record: &T) -> Result<()> {
    let data = serde_json::to_string(record).context("Failed to serialize record")?;
    tx.execute(
        "INSERT OR REPLACE INTO records (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![T::collection_name(), record.id(), data, record.updated_at()],
    )?;
    tx.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
        params![T::collection_name(), record.id()],
    )?;
    write_indexes(tx, record)
}

fn write_indexes<T: Record>(tx: &Transaction<'_>, record: &T) -> Result<()> {
    for (field, value) in record.indexed_fields() {
        let (text, int) = match value {
            IndexValue::String(s) => (Some(s), None),
            IndexValue::Int(i) => (None, Some(i)),
            IndexValue::Bool(b) => (None, Some(i64::from(b))),
        };
        tx.execute(
            "INSERT OR REPLACE INTO record_indexes (collection, id, field, value_text, value_int) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![T::collection_name(), record.id(), field, text, int],
        )?;
    }
    Ok(())
}

fn delete_row(tx: &Transaction<'_>, collection: &str, id: &str) -> Result<bool> {
    tx.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
        params![collection, id],
    )?;
    let removed = tx.execute(
        "DELETE FROM records WHERE collection = ?1 AND id = ?2",
        params![collection, id],
    )?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FilterOp;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ticket {
        id: String,
        status: String,
        priority: i64,
        closed: bool,
        owner: Option<String>,
        updated_at: i64,
    }

    impl Ticket {
        fn new(id: &str, status: &str, priority: i64, updated_at: i64) -> Self {
            Self {
                id: id.to_string(),
                status: status.to_string(),
                priority,
                closed: false,
                owner: None,
                updated_at,
            }
        }
    }

    impl Record for Ticket {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "tickets"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), IndexValue::String(self.status.clone()));
            fields.insert("priority".to_string(), IndexValue::Int(self.priority));
            fields.insert("closed".to_string(), IndexValue::Bool(self.closed));
            if let Some(ref owner) = self.owner {
                fields.insert("owner".to_string(), IndexValue::String(owner.clone()));
            }
            fields
        }
    }

    #[test]
    fn test_create_and_get() {
        let mut store = Store::open_in_memory().unwrap();
        let ticket = Ticket::new("t-1", "open", 2, 100);

        let id = store.create(ticket.clone()).unwrap();
        assert_eq!(id, "t-1");

        let loaded: Option<Ticket> = store.get("t-1").unwrap();
        assert_eq!(loaded, Some(ticket));
    }

    #[test]
    fn test_create_duplicate_fails() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Ticket::new("t-1", "open", 1, 1)).unwrap();
        assert!(store.create(Ticket::new("t-1", "open", 1, 2)).is_err());
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let loaded: Option<Ticket> = store.get("nope").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_update_requires_existing() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(store.update(Ticket::new("t-1", "open", 1, 1)).is_err());

        store.create(Ticket::new("t-1", "open", 1, 1)).unwrap();
        let mut ticket: Ticket = store.get("t-1").unwrap().unwrap();
        ticket.status = "closed".to_string();
        ticket.updated_at = 2;
        store.update(ticket).unwrap();

        let closed: Vec<Ticket> = store.list(&[Filter::eq("status", "closed")]).unwrap();
        assert_eq!(closed.len(), 1);
        let open: Vec<Ticket> = store.list(&[Filter::eq("status", "open")]).unwrap();
        assert!(open.is_empty(), "stale index entry must be replaced");
    }

    #[test]
    fn test_update_pair_is_all_or_nothing() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Ticket::new("t-1", "open", 1, 1)).unwrap();
        store.create(Ticket::new("t-2", "open", 1, 1)).unwrap();

        let err = store
            .update_pair(Ticket::new("t-1", "closed", 1, 2), Ticket::new("t-9", "closed", 1, 2))
            .unwrap_err();
        assert!(err.to_string().contains("t-9"));
        let first: Ticket = store.get("t-1").unwrap().unwrap();
        assert_eq!(first.status, "open");

        store
            .update_pair(Ticket::new("t-1", "closed", 1, 3), Ticket::new("t-2", "closed", 1, 3))
            .unwrap();
        let closed: Vec<Ticket> = store.list(&[Filter::eq("status", "closed")]).unwrap();
        assert_eq!(closed.len(), 2);
    }

    #[test]
    fn test_list_orders_by_updated_desc() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Ticket::new("a", "open", 1, 10)).unwrap();
        store.create(Ticket::new("b", "open", 1, 30)).unwrap();
        store.create(Ticket::new("c", "open", 1, 20)).unwrap();

        let all: Vec<Ticket> = store.list(&[]).unwrap();
        let ids: Vec<&str> = all.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let recent: Vec<Ticket> = store.list_recent(&[], 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "b");
    }

    #[test]
    fn test_list_with_int_and_bool_filters() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Ticket::new("low", "open", 1, 1)).unwrap();
        store.create(Ticket::new("mid", "open", 5, 2)).unwrap();
        let mut high = Ticket::new("high", "open", 9, 3);
        high.closed = true;
        store.create(high).unwrap();

        let urgent: Vec<Ticket> = store
            .list(&[Filter {
                field: "priority".to_string(),
                op: FilterOp::Gte,
                value: IndexValue::Int(5),
            }])
            .unwrap();
        assert_eq!(urgent.len(), 2);

        let closed: Vec<Ticket> = store.list(&[Filter::eq("closed", true)]).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, "high");

        let both: Vec<Ticket> = store
            .list(&[
                Filter::eq("closed", false),
                Filter {
                    field: "priority".to_string(),
                    op: FilterOp::Gt,
                    value: IndexValue::Int(2),
                },
            ])
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].id, "mid");
    }

    #[test]
    fn test_missing_optional_field_never_matches() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Ticket::new("a", "open", 1, 1)).unwrap();
        let mut owned = Ticket::new("b", "open", 1, 2);
        owned.owner = Some("alice".to_string());
        store.create(owned).unwrap();

        let found: Vec<Ticket> = store.list(&[Filter::eq("owner", "alice")]).unwrap();
        assert_eq!(found.len(), 1);
        let others: Vec<Ticket> = store
            .list(&[Filter {
                field: "owner".to_string(),
                op: FilterOp::Ne,
                value: IndexValue::String("alice".to_string()),
            }])
            .unwrap();
        assert!(others.is_empty());
    }

    #[test]
    fn test_delete_and_delete_where() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Ticket::new("a", "open", 1, 1)).unwrap();
        store.create(Ticket::new("b", "stale", 1, 2)).unwrap();
        store.create(Ticket::new("c", "stale", 1, 3)).unwrap();

        assert!(store.delete::<Ticket>("a").unwrap());
        assert!(!store.delete::<Ticket>("a").unwrap());

        let removed = store.delete_where::<Ticket>(&[Filter::eq("status", "stale")]).unwrap();
        assert_eq!(removed, 2);
        let left: Vec<Ticket> = store.list(&[]).unwrap();
        assert!(left.is_empty());
    }

    #[test]
    fn test_reopen_persists_records() {
        let temp = TempDir::new().unwrap();
        {
            let mut store = Store::open(temp.path()).unwrap();
            store.create(Ticket::new("t-1", "open", 3, 1)).unwrap();
            assert!(store.path().unwrap().ends_with(DB_FILE));
        }

        let mut store = Store::open(temp.path()).unwrap();
        assert_eq!(store.rebuild_indexes::<Ticket>().unwrap(), 1);
        let found: Vec<Ticket> = store.list(&[Filter::eq("status", "open")]).unwrap();
        assert_eq!(found.len(), 1);
    }
}
