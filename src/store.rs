//! # Trajectory Store
//!
//! Read-only access to a JuPedSim-style SQLite trajectory file.
//!
//! ## Expected layout
//!
//! - `trajectory_data(id, frame, pos_x | x, pos_y | y)`: one row per agent per frame
//! - `geometry(wkt)` or `geometry(hash, wkt)`: walkable area polygons (optional)
//! - `metadata(key, value)`: must carry `fps` when present (optional)
//! - `frame_data(frame, ...)`: one row per frame (optional)
//!
//! The schema is not validated when the file is opened. Column names are
//! resolved on the first query, so a broken schema surfaces as
//! [`PlaybackError::SchemaInvalid`] from whichever query touches it first.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use once_cell::unsync::OnceCell;
use rusqlite::{params, Connection, OpenFlags};

use crate::error::{OptionExt, PlaybackError, Result};
use crate::{AgentId, AgentPosition, Frame, FrameRange, TrajectoryRow};

const TRAJECTORY_TABLE: &str = "trajectory_data";

/// Resolved position column names.
///
/// Older files use `x`/`y`, newer ones `pos_x`/`pos_y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrajectoryColumns {
    pub x: &'static str,
    pub y: &'static str,
}

/// Optional simulation metadata stored next to the trajectories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreMetadata {
    /// Schema version from the `metadata` table
    pub version: Option<i64>,
    /// Recorded frames per second
    pub fps: Option<f64>,
    /// Row count of the `frame_data` table
    pub frame_data_rows: Option<u64>,
}

/// Read-only handle on a trajectory store.
pub struct TrajectoryStore {
    conn: Connection,
    path: Option<PathBuf>,
    columns: OnceCell<TrajectoryColumns>,
}

impl TrajectoryStore {
    /// Open a trajectory file read-only.
    ///
    /// Fails with [`PlaybackError::NotFound`] if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PlaybackError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        debug!("[Store] Opened {}", path.display());

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            columns: OnceCell::new(),
        })
    }

    /// Wrap an existing connection (for in-memory stores in tests).
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            path: None,
            columns: OnceCell::new(),
        }
    }

    /// Path of the underlying file, if opened from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Position column names, resolved on first use.
    pub fn columns(&self) -> Result<TrajectoryColumns> {
        self.columns
            .get_or_try_init(|| self.resolve_columns())
            .copied()
    }

    fn resolve_columns(&self) -> Result<TrajectoryColumns> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1)")?;
        let names: Vec<String> = stmt
            .query_map(params![TRAJECTORY_TABLE], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        if names.is_empty() {
            return Err(PlaybackError::SchemaInvalid {
                identifier: format!("table {TRAJECTORY_TABLE}"),
            });
        }

        let has = |name: &str| names.iter().any(|n| n.eq_ignore_ascii_case(name));
        for required in ["id", "frame"] {
            if !has(required) {
                return Err(PlaybackError::SchemaInvalid {
                    identifier: format!("column {TRAJECTORY_TABLE}.{required}"),
                });
            }
        }

        let x = ["pos_x", "x"]
            .into_iter()
            .find(|&c| has(c))
            .ok_or_schema("column trajectory_data.pos_x (or x)")?;
        let y = ["pos_y", "y"]
            .into_iter()
            .find(|&c| has(c))
            .ok_or_schema("column trajectory_data.pos_y (or y)")?;

        debug!("[Store] Position columns resolved to ({x}, {y})");
        Ok(TrajectoryColumns { x, y })
    }

    /// Inclusive frame bounds. An empty store yields `{0, 0}`.
    pub fn frame_range(&self) -> Result<FrameRange> {
        self.columns()?;
        let (min, max): (Option<Frame>, Option<Frame>) = self
            .conn
            .query_row(
                "SELECT MIN(frame), MAX(frame) FROM trajectory_data",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(PlaybackError::from_query)?;

        Ok(match (min, max) {
            (Some(min), Some(max)) => FrameRange::new(min, max),
            _ => FrameRange::empty(),
        })
    }

    /// All agent ids in ascending order.
    pub fn distinct_agent_ids(&self) -> Result<Vec<AgentId>> {
        self.columns()?;
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT id FROM trajectory_data ORDER BY id")
            .map_err(PlaybackError::from_query)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<AgentId>, _>>()?;
        Ok(ids)
    }

    /// Total number of trajectory rows.
    pub fn row_count(&self) -> Result<u64> {
        self.columns()?;
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM trajectory_data", [], |row| row.get(0))
            .map_err(PlaybackError::from_query)?;
        Ok(count.max(0) as u64)
    }

    /// Positions of every agent present in `frame`.
    ///
    /// Served from the store's frame index; see [`Self::has_frame_index`].
    pub fn positions_at_frame(&self, frame: Frame) -> Result<Vec<AgentPosition>> {
        let columns = self.columns()?;
        let sql = format!(
            "SELECT id, {}, {} FROM trajectory_data WHERE frame = ?1",
            columns.x, columns.y
        );
        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .map_err(PlaybackError::from_query)?;
        let positions = stmt
            .query_map(params![frame], |row| {
                Ok(AgentPosition {
                    agent_id: row.get(0)?,
                    x: row.get(1)?,
                    y: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    /// Stream every row ordered by agent id, then frame.
    ///
    /// The visitor may stop the scan early by returning `ControlFlow::Break`.
    /// Returns the number of rows handed to the visitor.
    pub fn visit_full_history<F>(&self, mut visit: F) -> Result<u64>
    where
        F: FnMut(TrajectoryRow) -> ControlFlow<()>,
    {
        let columns = self.columns()?;
        let sql = format!(
            "SELECT id, frame, {}, {} FROM trajectory_data ORDER BY id, frame",
            columns.x, columns.y
        );
        let mut stmt = self.conn.prepare(&sql).map_err(PlaybackError::from_query)?;
        let mut rows = stmt.query([])?;

        let mut visited = 0u64;
        while let Some(row) = rows.next()? {
            let record = TrajectoryRow {
                agent_id: row.get(0)?,
                frame: row.get(1)?,
                x: row.get(2)?,
                y: row.get(3)?,
            };
            visited += 1;
            if visit(record).is_break() {
                break;
            }
        }
        Ok(visited)
    }

    /// Collect the full ordered history in memory.
    pub fn full_history_ordered(&self) -> Result<Vec<TrajectoryRow>> {
        let mut rows = Vec::new();
        self.visit_full_history(|row| {
            rows.push(row);
            ControlFlow::Continue(())
        })?;
        Ok(rows)
    }

    /// Whether an index on `trajectory_data` leads with the `frame` column.
    pub fn has_frame_index(&self) -> Result<bool> {
        let mut list = self
            .conn
            .prepare("SELECT name FROM pragma_index_list(?1)")?;
        let indexes: Vec<String> = list
            .query_map(params![TRAJECTORY_TABLE], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut info = self
            .conn
            .prepare("SELECT name FROM pragma_index_info(?1) WHERE seqno = 0")?;
        for index in &indexes {
            let leading: Option<String> = info
                .query_map(params![index], |row| row.get(0))?
                .next()
                .transpose()?;
            if leading.is_some_and(|column| column.eq_ignore_ascii_case("frame")) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Read the optional `metadata` and `frame_data` tables.
    pub fn metadata(&self) -> Result<StoreMetadata> {
        let mut metadata = StoreMetadata::default();

        if self.table_exists("metadata")? {
            let mut stmt = self
                .conn
                .prepare("SELECT key, CAST(value AS TEXT) FROM metadata")
                .map_err(PlaybackError::from_query)?;
            let entries: Vec<(String, Option<String>)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?;

            for (key, value) in entries {
                let Some(value) = value else { continue };
                match key.as_str() {
                    "fps" => metadata.fps = value.trim().parse().ok(),
                    "version" => metadata.version = value.trim().parse().ok(),
                    _ => {}
                }
            }

            if metadata.fps.is_none() {
                return Err(PlaybackError::SchemaInvalid {
                    identifier: "metadata.fps".to_string(),
                });
            }
        }

        if self.table_exists("frame_data")? {
            let rows: i64 = self
                .conn
                .query_row("SELECT COUNT(*) FROM frame_data", [], |row| row.get(0))?;
            metadata.frame_data_rows = Some(rows.max(0) as u64);
        }

        info!(
            "[Store] Metadata: version={:?}, fps={:?}, frame_data_rows={:?}",
            metadata.version, metadata.fps, metadata.frame_data_rows
        );
        Ok(metadata)
    }

    /// WKT strings of all walkable-area polygons, or `None` without a
    /// `geometry` table.
    pub fn geometry_wkts(&self) -> Result<Option<Vec<String>>> {
        if !self.table_exists("geometry")? {
            warn!("[Store] No geometry table found");
            return Ok(None);
        }
        let mut stmt = self
            .conn
            .prepare("SELECT wkt FROM geometry")
            .map_err(PlaybackError::from_query)?;
        let wkts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(Some(wkts))
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Session-owned store connection for streaming queries.
///
/// Opened on first use and reopened after [`LazyStore::close`].
pub struct LazyStore {
    path: Option<PathBuf>,
    store: Option<TrajectoryStore>,
}

impl LazyStore {
    /// A closed store that opens `path` on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            store: None,
        }
    }

    /// A store with nothing to open.
    pub fn detached() -> Self {
        Self {
            path: None,
            store: None,
        }
    }

    /// Wrap an already-open store. It cannot be reopened after closing
    /// unless it was opened from a path.
    pub fn with_store(store: TrajectoryStore) -> Self {
        Self {
            path: store.path().map(Path::to_path_buf),
            store: Some(store),
        }
    }

    /// The open store, opening it first if needed.
    pub fn get(&mut self) -> Result<&TrajectoryStore> {
        if self.store.is_none() {
            let path = self
                .path
                .as_ref()
                .ok_or_internal("store has no path to reopen")?;
            info!("[Store] Opening {} for streaming queries", path.display());
            self.store = Some(TrajectoryStore::open(path)?);
        }
        self.store.as_ref().ok_or_internal("store failed to open")
    }

    /// Drop the connection. Returns whether one was open.
    pub fn close(&mut self) -> bool {
        let was_open = self.store.take().is_some();
        if was_open {
            debug!("[Store] Connection closed");
        }
        was_open
    }

    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store(x_col: &str, y_col: &str) -> TrajectoryStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE trajectory_data (id INTEGER, frame INTEGER, {x_col} REAL, {y_col} REAL);
             CREATE INDEX frame_id_idx ON trajectory_data(frame, id);"
        ))
        .unwrap();
        for frame in (0..50).step_by(10) {
            for id in [3i64, 1, 2] {
                conn.execute(
                    &format!(
                        "INSERT INTO trajectory_data (id, frame, {x_col}, {y_col}) VALUES (?1, ?2, ?3, ?4)"
                    ),
                    params![
                        id,
                        frame,
                        id as f64 * 2.0 + frame as f64 * 0.1,
                        id as f64 * 1.5 + frame as f64 * 0.05
                    ],
                )
                .unwrap();
            }
        }
        TrajectoryStore::from_connection(conn)
    }

    #[test]
    fn test_open_missing_file() {
        let result = TrajectoryStore::open("/definitely/not/here.sqlite");
        assert!(matches!(result, Err(PlaybackError::NotFound { .. })));
    }

    #[test]
    fn test_frame_range_and_ids() {
        let store = sample_store("pos_x", "pos_y");
        assert_eq!(store.frame_range().unwrap(), FrameRange::new(0, 40));
        assert_eq!(store.distinct_agent_ids().unwrap(), vec![1, 2, 3]);
        assert_eq!(store.row_count().unwrap(), 15);
    }

    #[test]
    fn test_empty_store_range() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE trajectory_data (id INTEGER, frame INTEGER, pos_x REAL, pos_y REAL)",
        )
        .unwrap();
        let store = TrajectoryStore::from_connection(conn);
        assert_eq!(store.frame_range().unwrap(), FrameRange::new(0, 0));
        assert!(store.distinct_agent_ids().unwrap().is_empty());
    }

    #[test]
    fn test_column_variants() {
        let store = sample_store("x", "y");
        assert_eq!(
            store.columns().unwrap(),
            TrajectoryColumns { x: "x", y: "y" }
        );
        let positions = store.positions_at_frame(10).unwrap();
        assert_eq!(positions.len(), 3);
    }

    #[test]
    fn test_missing_table_is_lazy_schema_error() {
        let store = TrajectoryStore::from_connection(Connection::open_in_memory().unwrap());
        match store.frame_range() {
            Err(PlaybackError::SchemaInvalid { identifier }) => {
                assert!(identifier.contains("trajectory_data"))
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_position_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE trajectory_data (id INTEGER, frame INTEGER, pos_x REAL)")
            .unwrap();
        let store = TrajectoryStore::from_connection(conn);
        match store.distinct_agent_ids() {
            Err(PlaybackError::SchemaInvalid { identifier }) => assert!(identifier.contains("pos_y")),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_positions_at_frame() {
        let store = sample_store("pos_x", "pos_y");
        let mut positions = store.positions_at_frame(10).unwrap();
        positions.sort_by_key(|p| p.agent_id);
        assert_eq!(positions[0].agent_id, 1);
        assert!((positions[0].x - 3.0).abs() < 1e-9);
        assert!((positions[0].y - 2.0).abs() < 1e-9);
        assert!(store.positions_at_frame(11).unwrap().is_empty());
    }

    #[test]
    fn test_full_history_ordering() {
        let store = sample_store("pos_x", "pos_y");
        let rows = store.full_history_ordered().unwrap();
        assert_eq!(rows.len(), 15);
        for pair in rows.windows(2) {
            let a = (pair[0].agent_id, pair[0].frame);
            let b = (pair[1].agent_id, pair[1].frame);
            assert!(a < b, "rows out of order: {a:?} then {b:?}");
        }
    }

    #[test]
    fn test_visit_stops_on_break() {
        let store = sample_store("pos_x", "pos_y");
        let mut seen = 0;
        let visited = store
            .visit_full_history(|_| {
                seen += 1;
                if seen == 4 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(visited, 4);
    }

    #[test]
    fn test_frame_index_detection() {
        let store = sample_store("pos_x", "pos_y");
        assert!(store.has_frame_index().unwrap());

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE trajectory_data (id INTEGER, frame INTEGER, pos_x REAL, pos_y REAL);
             CREATE INDEX id_idx ON trajectory_data(id);",
        )
        .unwrap();
        let store = TrajectoryStore::from_connection(conn);
        assert!(!store.has_frame_index().unwrap());
    }

    #[test]
    fn test_metadata_tables() {
        let store = sample_store("pos_x", "pos_y");
        assert_eq!(store.metadata().unwrap(), StoreMetadata::default());

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE metadata (key TEXT, value TEXT);
             INSERT INTO metadata VALUES ('version', '2'), ('fps', '8.0');
             CREATE TABLE frame_data (frame INTEGER, geometry_hash INTEGER);
             INSERT INTO frame_data VALUES (0, 1), (1, 1);",
        )
        .unwrap();
        let metadata = TrajectoryStore::from_connection(conn).metadata().unwrap();
        assert_eq!(metadata.version, Some(2));
        assert_eq!(metadata.fps, Some(8.0));
        assert_eq!(metadata.frame_data_rows, Some(2));
    }

    #[test]
    fn test_metadata_requires_fps() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE metadata (key TEXT, value TEXT);
             INSERT INTO metadata VALUES ('version', '2');",
        )
        .unwrap();
        let result = TrajectoryStore::from_connection(conn).metadata();
        assert!(matches!(result, Err(PlaybackError::SchemaInvalid { .. })));
    }

    #[test]
    fn test_geometry_optional() {
        let store = sample_store("pos_x", "pos_y");
        assert_eq!(store.geometry_wkts().unwrap(), None);
    }

    #[test]
    fn test_lazy_store_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("traj.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE trajectory_data (id INTEGER, frame INTEGER, pos_x REAL, pos_y REAL);
                 INSERT INTO trajectory_data VALUES (1, 0, 1.0, 2.0);",
            )
            .unwrap();
        }

        let mut lazy = LazyStore::new(&path);
        assert!(!lazy.is_open());
        assert_eq!(lazy.get().unwrap().positions_at_frame(0).unwrap().len(), 1);
        assert!(lazy.is_open());
        assert!(lazy.close());
        assert!(!lazy.is_open());
        assert_eq!(lazy.get().unwrap().row_count().unwrap(), 1);
    }

    #[test]
    fn test_detached_store_cannot_open() {
        let mut lazy = LazyStore::detached();
        assert!(matches!(lazy.get(), Err(PlaybackError::Internal { .. })));
    }
}
