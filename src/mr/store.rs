//! Intermediate relations: single-table SQLite files of (key, value) rows.
//!
//! Every artifact that crosses a stage boundary is one of these files. They
//! are opened with durability relaxed because intermediates are ephemeral and
//! recomputable; a safe-write configuration costs 10-100x on the bulk insert
//! paths.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tracing::debug;

use crate::mr::error::{MrError, Result};

/// Commit grain for bulk loads such as the splitter.
const BATCH_ROWS: usize = 4096;

/// Row visit order for [`PairStore::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// Rows as inserted. Map input is read this way.
    Insertion,
    /// Rows ordered by (key, value). Reduce grouping depends on this.
    SortedKeyValue,
}

/// Handle to one `pairs(key text, value text)` relation.
pub struct PairStore {
    conn: Connection,
    path: PathBuf,
}

impl PairStore {
    /// Create an empty relation at `path`, replacing any existing file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // A leftover file from an earlier run would be appended to.
        let _ = fs::remove_file(path);
        let store = Self::open_relaxed(path)?;
        store
            .conn
            .execute("create table pairs (key text, value text)", [])
            .map_err(|e| store.unavailable(e))?;
        Ok(store)
    }

    /// Open an existing relation with the same relaxed settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_relaxed(path.as_ref())
    }

    fn open_relaxed(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|source| MrError::StoreUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self {
            conn,
            path: path.to_path_buf(),
        };
        // No rollback journal, no fsync per commit.
        store
            .conn
            .pragma_update(None, "journal_mode", "OFF")
            .map_err(|e| store.unavailable(e))?;
        store
            .conn
            .pragma_update(None, "synchronous", "OFF")
            .map_err(|e| store.unavailable(e))?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row.
    pub fn insert(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "insert into pairs(key, value) values(?1, ?2)",
                params![key, value],
            )
            .map_err(|e| self.corrupt(e))?;
        Ok(())
    }

    /// Open an explicit transaction. Pair with [`commit_batch`]; writes in
    /// between become one commit.
    ///
    /// [`commit_batch`]: PairStore::commit_batch
    pub fn begin_batch(&self) -> Result<()> {
        self.conn
            .execute_batch("begin")
            .map_err(|e| self.corrupt(e))
    }

    pub fn commit_batch(&self) -> Result<()> {
        self.conn
            .execute_batch("commit")
            .map_err(|e| self.corrupt(e))
    }

    pub fn count(&self) -> Result<u64> {
        self.conn
            .query_row("select count(1) from pairs", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| self.corrupt(e))
    }

    /// Visit every row lazily in the given order.
    pub fn scan<F>(&self, order: ScanOrder, mut visit: F) -> Result<()>
    where
        F: FnMut(String, String) -> Result<()>,
    {
        let sql = match order {
            ScanOrder::Insertion => "select key, value from pairs",
            ScanOrder::SortedKeyValue => "select key, value from pairs order by key, value",
        };
        let mut stmt = self.conn.prepare(sql).map_err(|e| self.corrupt(e))?;
        let mut rows = stmt.query([]).map_err(|e| self.corrupt(e))?;
        while let Some(row) = rows.next().map_err(|e| self.corrupt(e))? {
            let key: String = row.get(0).map_err(|e| self.corrupt(e))?;
            let value: String = row.get(1).map_err(|e| self.corrupt(e))?;
            visit(key, value)?;
        }
        Ok(())
    }

    /// Append every row of the relation at `src` into this one. Duplicate
    /// rows are preserved.
    pub fn merge_from(&self, src: impl AsRef<Path>) -> Result<()> {
        let src = src.as_ref();
        debug!("merging {} into {}", src.display(), self.path.display());
        self.conn
            .execute(
                "attach database ?1 as src",
                params![src.to_string_lossy().as_ref()],
            )
            .map_err(|source| MrError::Corrupt {
                path: src.to_path_buf(),
                source,
            })?;
        let copied = self
            .conn
            .execute("insert into pairs select key, value from src.pairs", []);
        let detached = self.conn.execute("detach database src", []);
        copied.map_err(|source| MrError::Corrupt {
            path: src.to_path_buf(),
            source,
        })?;
        detached.map_err(|e| self.corrupt(e))?;
        Ok(())
    }

    fn unavailable(&self, source: rusqlite::Error) -> MrError {
        MrError::StoreUnavailable {
            path: self.path.clone(),
            source,
        }
    }

    fn corrupt(&self, source: rusqlite::Error) -> MrError {
        MrError::Corrupt {
            path: self.path.clone(),
            source,
        }
    }
}

/// Partition the relation at `source` into `m` shards named by `pattern`
/// (which must contain one `{}` placeholder for the shard ordinal).
///
/// Rows are dealt round-robin, row `i` to shard `i % m`, so adversarial input
/// orderings cannot produce unbalanced shards; the map phase assumes shards
/// are roughly equal. Fails before creating anything if the source holds
/// fewer than `m` rows.
pub fn split_store(source: impl AsRef<Path>, pattern: &str, m: usize) -> Result<Vec<PathBuf>> {
    if m == 0 {
        return Err(MrError::Config("cannot split into zero shards".into()));
    }
    if !pattern.contains("{}") {
        return Err(MrError::Config(format!(
            "split pattern {pattern:?} has no {{}} placeholder"
        )));
    }

    let source = PairStore::open(source)?;
    let rows = source.count()?;
    if (rows as usize) < m {
        return Err(MrError::Config(format!(
            "cannot split {rows} rows into {m} shards"
        )));
    }

    let mut paths = Vec::with_capacity(m);
    let mut shards = Vec::with_capacity(m);
    for i in 0..m {
        let path = PathBuf::from(pattern.replacen("{}", &i.to_string(), 1));
        let shard = PairStore::create(&path)?;
        shard.begin_batch()?;
        paths.push(path);
        shards.push(shard);
    }

    let mut i = 0usize;
    source.scan(ScanOrder::Insertion, |key, value| {
        shards[i % m].insert(&key, &value)?;
        i += 1;
        if i % BATCH_ROWS == 0 {
            for shard in &shards {
                shard.commit_batch()?;
                shard.begin_batch()?;
            }
        }
        Ok(())
    })?;
    for shard in &shards {
        shard.commit_batch()?;
    }

    debug!("split {rows} rows into {m} shards");
    Ok(paths)
}
