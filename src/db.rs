use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Named tables of string rows, each with a fixed header.
pub trait TabularStore {
    /// Create the table with `header` if it does not exist yet.
    fn ensure_table(&self, name: &str, header: &[&str]) -> Result<()>;
    fn header(&self, name: &str) -> Result<Option<Vec<String>>>;
    /// All data rows in insertion order (header excluded).
    fn read_all(&self, name: &str) -> Result<Vec<Vec<String>>>;
    /// Append rows in one batch. Every row must match the header width.
    fn append_rows(&self, name: &str, rows: &[Vec<String>]) -> Result<usize>;
}

pub struct SqliteStore {
    conn: Connection,
}

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sheets (
            name       TEXT PRIMARY KEY,
            header     TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sheet_rows (
            id          INTEGER PRIMARY KEY,
            sheet       TEXT NOT NULL REFERENCES sheets(name),
            cells       TEXT NOT NULL,
            appended_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sheet_rows_sheet ON sheet_rows(sheet);
        ",
    )?;
    Ok(())
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = connect(path)?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Row counts for every known table, by name.
    pub fn stats(&self) -> Result<Vec<SheetStats>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.name, COUNT(r.id), MAX(r.appended_at)
             FROM sheets s
             LEFT JOIN sheet_rows r ON r.sheet = s.name
             GROUP BY s.name
             ORDER BY s.name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SheetStats {
                    name: row.get(0)?,
                    rows: row.get::<_, i64>(1)? as usize,
                    last_append: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub struct SheetStats {
    pub name: String,
    pub rows: usize,
    pub last_append: Option<String>,
}

impl TabularStore for SqliteStore {
    fn ensure_table(&self, name: &str, header: &[&str]) -> Result<()> {
        let json = serde_json::to_string(header)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO sheets (name, header) VALUES (?1, ?2)",
            params![name, json],
        )?;
        Ok(())
    }

    fn header(&self, name: &str) -> Result<Option<Vec<String>>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT header FROM sheets WHERE name = ?1", params![name], |r| r.get(0))
            .optional()?;
        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).with_context(|| format!("Corrupt header for {}", name))?,
            )),
            None => Ok(None),
        }
    }

    fn read_all(&self, name: &str) -> Result<Vec<Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT cells FROM sheet_rows WHERE sheet = ?1 ORDER BY id")?;
        let raw = stmt
            .query_map(params![name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.iter()
            .map(|json| {
                serde_json::from_str(json).with_context(|| format!("Corrupt row in {}", name))
            })
            .collect()
    }

    fn append_rows(&self, name: &str, rows: &[Vec<String>]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let width = match self.header(name)? {
            Some(h) => h.len(),
            None => bail!("Table '{}' does not exist", name),
        };
        if let Some(bad) = rows.iter().find(|r| r.len() != width) {
            bail!(
                "Row for '{}' has {} cells, header has {}: {:?}",
                name,
                bad.len(),
                width,
                bad
            );
        }

        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sheet_rows (sheet, cells, appended_at) VALUES (?1, ?2, ?3)",
            )?;
            for row in rows {
                count += stmt.execute(params![name, serde_json::to_string(row)?, now])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn create_append_read() {
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_table("P1 - HOT Leads", &["Entity Name", "Type"]).unwrap();
        let n = store
            .append_rows("P1 - HOT Leads", &[row(&["Gir Lions", "Team"]), row(&["Delhi FC", "Team"])])
            .unwrap();
        assert_eq!(n, 2);

        let rows = store.read_all("P1 - HOT Leads").unwrap();
        assert_eq!(rows, vec![row(&["Gir Lions", "Team"]), row(&["Delhi FC", "Team"])]);
        assert_eq!(
            store.header("P1 - HOT Leads").unwrap(),
            Some(row(&["Entity Name", "Type"]))
        );
    }

    #[test]
    fn ensure_table_keeps_existing_header() {
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_table("raw", &["A", "B"]).unwrap();
        store.ensure_table("raw", &["X"]).unwrap();
        assert_eq!(store.header("raw").unwrap(), Some(row(&["A", "B"])));
    }

    #[test]
    fn width_mismatch_rejected_without_partial_write() {
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_table("raw", &["A", "B"]).unwrap();
        let err = store.append_rows("raw", &[row(&["1", "2"]), row(&["only one"])]);
        assert!(err.is_err());
        assert!(store.read_all("raw").unwrap().is_empty());
    }

    #[test]
    fn missing_table_is_error() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.append_rows("nope", &[row(&["x"])]).is_err());
        assert!(store.read_all("nope").unwrap().is_empty());
        assert!(store.header("nope").unwrap().is_none());
    }

    #[test]
    fn stats_count_per_table() {
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_table("a", &["X"]).unwrap();
        store.ensure_table("b", &["X"]).unwrap();
        store.append_rows("a", &[row(&["1"]), row(&["2"])]).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "a");
        assert_eq!(stats[0].rows, 2);
        assert_eq!(stats[1].rows, 0);
        assert!(stats[1].last_append.is_none());
    }

    #[test]
    fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/scout.sqlite");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.ensure_table("raw", &["A"]).unwrap();
            store.append_rows("raw", &[row(&["kept"])]).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.read_all("raw").unwrap(), vec![row(&["kept"])]);
    }
}
