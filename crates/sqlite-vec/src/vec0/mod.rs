//! The `vec0` virtual table
//!
//! ```sql
//! CREATE VIRTUAL TABLE items USING vec0(embedding float[4]);
//! INSERT INTO items(rowid, embedding) VALUES (1, '[0.1, 0.1, 0.1, 0.1]');
//! SELECT rowid, distance FROM items WHERE embedding MATCH ?1 ORDER BY distance LIMIT 3;
//! ```
//!
//! Rows live in shadow tables (see [`shadow`]). A query runs one of three
//! plans chosen in `best_index`:
//! - KNN: `col MATCH ?` with `k = ?` or `LIMIT ?`
//! - point lookup: `rowid = ?`
//! - full scan in rowid order

pub mod config;
pub mod knn;
pub mod shadow;

use std::os::raw::c_int;

use rusqlite::types::ValueRef;
use rusqlite::vtab::{
    update_module, Context, CreateVTab, IndexConstraintOp, IndexInfo, UpdateVTab, VTab,
    VTabConnection, VTabCursor, VTabKind, Values,
};
use rusqlite::{ffi, Connection};
use tracing::debug;

pub use config::{Vec0Config, VectorColumn};
pub use knn::Neighbor;
pub use shadow::{RowLocation, ShadowTables};

use crate::vector::Vector;

/// Name the module is registered under
pub const MODULE_NAME: &str = "vec0";

const PLAN_FULL_SCAN: c_int = 1;
const PLAN_POINT: c_int = 2;
const PLAN_KNN: c_int = 3;

/// Register the `vec0` module on `conn`
pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_module(MODULE_NAME, update_module::<Vec0Tab>(), None)
}

fn module_error(msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::ModuleError(msg.into())
}

/// Query plan, packed into `idxNum` as `kind | column << 8`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    FullScan,
    Point,
    Knn { column: usize },
}

impl Plan {
    fn idx_num(self) -> c_int {
        match self {
            Plan::FullScan => PLAN_FULL_SCAN,
            Plan::Point => PLAN_POINT,
            Plan::Knn { column } => PLAN_KNN | ((column as c_int) << 8),
        }
    }

    fn from_idx_num(idx_num: c_int) -> rusqlite::Result<Self> {
        match idx_num & 0xff {
            PLAN_FULL_SCAN => Ok(Plan::FullScan),
            PLAN_POINT => Ok(Plan::Point),
            PLAN_KNN => Ok(Plan::Knn {
                column: (idx_num >> 8) as usize,
            }),
            other => Err(module_error(format!("vec0: unknown query plan {other}"))),
        }
    }
}

/// A connected `vec0` table
#[repr(C)]
pub struct Vec0Tab {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab,
    conn: Connection,
    shadow: ShadowTables,
}

impl Vec0Tab {
    fn from_args(db: &mut VTabConnection, args: &[&[u8]]) -> rusqlite::Result<Self> {
        if args.len() < 3 {
            return Err(module_error("vec0: missing module arguments"));
        }
        let text = |arg: &[u8]| {
            std::str::from_utf8(arg)
                .map(str::to_string)
                .map_err(|e| module_error(format!("vec0: arguments must be UTF-8: {e}")))
        };
        let schema = text(args[1])?;
        let table = text(args[2])?;
        let module_args = args[3..]
            .iter()
            .map(|arg| text(arg))
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let config = Vec0Config::parse(&module_args)
            .map_err(|e| module_error(e.context(MODULE_NAME).to_string()))?;

        // The handle belongs to SQLite, the wrapper never closes it
        let conn = unsafe { Connection::from_handle(db.handle())? };

        Ok(Self {
            base: ffi::sqlite3_vtab::default(),
            conn,
            shadow: ShadowTables::new(&schema, &table, config),
        })
    }

    fn config(&self) -> &Vec0Config {
        self.shadow.config()
    }

    /// Decode the vector columns of an INSERT/UPDATE argument list
    fn vectors(&self, args: &Values<'_>) -> rusqlite::Result<Vec<Vector>> {
        self.config()
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let value = args.iter().nth(i + 2).unwrap_or(ValueRef::Null);
                Vector::from_value(value, column.element_type).map_err(|e| {
                    rusqlite::Error::from(e.context(&format!("vec0 column '{}'", column.name)))
                })
            })
            .collect()
    }
}

unsafe impl<'vtab> VTab<'vtab> for Vec0Tab {
    type Aux = ();
    type Cursor = Vec0Cursor<'vtab>;

    fn connect(
        db: &mut VTabConnection,
        _aux: Option<&()>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let tab = Self::from_args(db, args)?;
        Ok((tab.config().schema(), tab))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let config = self.config();
        let vector_columns = config.columns.len() as c_int;
        let k_column = config.k_column() as c_int;
        let distance_column = config.distance_column() as c_int;

        let mut matched: Option<(usize, usize)> = None;
        let mut k_eq = None;
        let mut limit = None;
        let mut offset = None;
        let mut rowid_eq = None;

        for (i, constraint) in info.constraints().enumerate() {
            if !constraint.is_usable() {
                continue;
            }
            let column = constraint.column();
            match constraint.operator() {
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_MATCH
                    if (0..vector_columns).contains(&column) =>
                {
                    if matched.is_some() {
                        return Err(module_error(
                            "vec0: only one MATCH constraint is allowed per query",
                        ));
                    }
                    matched = Some((column as usize, i));
                }
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ if column == k_column => {
                    k_eq = Some(i)
                }
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ if column == -1 => {
                    rowid_eq = Some(i)
                }
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LIMIT => limit = Some(i),
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_OFFSET => offset = Some(i),
                _ => {}
            }
        }

        // (constraint, argv index, omit)
        let mut arguments: Vec<(usize, c_int, bool)> = Vec::new();
        let plan = if let Some((column, query)) = matched {
            let k = k_eq.map(|i| (i, true)).or(limit.map(|i| (i, false))).ok_or_else(|| {
                module_error(
                    "vec0: a LIMIT or 'k = ?' constraint is required on vec0 knn queries",
                )
            })?;
            arguments.push((query, 1, true));
            arguments.push((k.0, 2, k.1));
            // SQLite skips OFFSET rows of what the cursor yields
            if let (None, Some(offset)) = (k_eq, offset) {
                arguments.push((offset, 3, false));
            }
            Plan::Knn { column }
        } else if let Some(rowid) = rowid_eq {
            arguments.push((rowid, 1, true));
            Plan::Point
        } else {
            Plan::FullScan
        };

        for (i, (_, mut usage)) in info.constraints_and_usages().enumerate() {
            if let Some(&(_, argv_index, omit)) = arguments.iter().find(|(c, _, _)| *c == i) {
                usage.set_argv_index(argv_index);
                usage.set_omit(omit);
            }
        }

        let ordered_by_distance = {
            let mut order_bys = info.order_bys();
            match (order_bys.next(), order_bys.next()) {
                (Some(order_by), None) => {
                    order_by.column() == distance_column && !order_by.is_order_by_desc()
                }
                _ => false,
            }
        };

        let cost = match plan {
            Plan::Knn { .. } => {
                if ordered_by_distance {
                    info.set_order_by_consumed(true);
                }
                10.0
            }
            Plan::Point => 1.0,
            Plan::FullScan => 10_000_000.0,
        };
        info.set_idx_num(plan.idx_num());
        info.set_estimated_cost(cost);

        debug!(table = self.shadow.table_name(), ?plan, "vec0 best_index");
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<Vec0Cursor<'vtab>> {
        Ok(Vec0Cursor::new(self))
    }
}

impl<'vtab> CreateVTab<'vtab> for Vec0Tab {
    const KIND: VTabKind = VTabKind::Default;

    fn create(
        db: &mut VTabConnection,
        _aux: Option<&()>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let tab = Self::from_args(db, args)?;
        tab.shadow.create(&tab.conn)?;
        debug!(
            table = tab.shadow.table_name(),
            columns = tab.config().columns.len(),
            chunk_size = tab.config().chunk_size,
            "created vec0 table"
        );
        Ok((tab.config().schema(), tab))
    }

    fn destroy(&self) -> rusqlite::Result<()> {
        self.conn.flush_prepared_statement_cache();
        self.shadow.drop_all(&self.conn)?;
        Ok(())
    }
}

impl<'vtab> UpdateVTab<'vtab> for Vec0Tab {
    fn delete(&mut self, arg: ValueRef<'_>) -> rusqlite::Result<()> {
        match arg {
            ValueRef::Integer(rowid) => {
                self.shadow.delete(&self.conn, rowid)?;
                Ok(())
            }
            _ => Err(module_error("vec0: rowid must be an integer")),
        }
    }

    fn insert(&mut self, args: &Values<'_>) -> rusqlite::Result<i64> {
        let rowid = match args.iter().nth(1) {
            Some(ValueRef::Integer(rowid)) => Some(rowid),
            Some(ValueRef::Null) | None => None,
            Some(_) => return Err(module_error("vec0: rowid must be an integer")),
        };
        let vectors = self.vectors(args)?;
        let rowid = self.shadow.insert(&self.conn, rowid, &vectors)?;
        Ok(rowid)
    }

    fn update(&mut self, args: &Values<'_>) -> rusqlite::Result<()> {
        let old: i64 = args.get(0)?;
        let new: i64 = args.get(1)?;
        if old != new {
            return Err(module_error(
                "vec0: updating the rowid of a vec0 row is not supported",
            ));
        }
        let vectors = self.vectors(args)?.into_iter().map(Some).collect::<Vec<_>>();
        self.shadow.update(&self.conn, old, &vectors)?;
        Ok(())
    }
}

/// A row produced by a cursor
#[derive(Debug, Clone, Copy)]
struct CursorRow {
    location: RowLocation,
    distance: Option<f32>,
}

/// Cursor over the rows selected by one plan
#[repr(C)]
pub struct Vec0Cursor<'vtab> {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab_cursor,
    table: &'vtab Vec0Tab,
    rows: Vec<CursorRow>,
    position: usize,
    k: Option<i64>,
}

impl<'vtab> Vec0Cursor<'vtab> {
    fn new(table: &'vtab Vec0Tab) -> Self {
        Self {
            base: ffi::sqlite3_vtab_cursor::default(),
            table,
            rows: Vec::new(),
            position: 0,
            k: None,
        }
    }

    fn current(&self) -> rusqlite::Result<&CursorRow> {
        self.rows
            .get(self.position)
            .ok_or_else(|| module_error("vec0: cursor is past the last row"))
    }

    fn knn(&mut self, column: usize, args: &Values<'_>) -> rusqlite::Result<()> {
        let table = self.table;
        let def = &table.config().columns[column];

        let query = args.iter().next().unwrap_or(ValueRef::Null);
        let query = Vector::from_value(query, def.element_type)
            .map_err(|e| e.context("vec0 knn query"))?;

        let k = match (args.iter().nth(1), args.iter().nth(2)) {
            (Some(ValueRef::Integer(limit)), Some(ValueRef::Integer(offset))) => {
                limit.saturating_add(offset.max(0))
            }
            (Some(ValueRef::Integer(k)), _) => k,
            _ => return Err(module_error("vec0: k value in knn query must be an integer")),
        };
        if !(0..=config::MAX_K).contains(&k) {
            return Err(module_error(format!(
                "vec0: k value in knn query must be between 0 and {}, got {k}",
                config::MAX_K
            )));
        }

        let neighbors = knn::search(&table.conn, &table.shadow, column, &query, k as usize)
            .map_err(|e| e.context("vec0 knn query"))?;
        self.rows = neighbors
            .into_iter()
            .map(|n| CursorRow {
                location: n.location,
                distance: Some(n.distance),
            })
            .collect();
        self.k = Some(k);
        Ok(())
    }
}

unsafe impl VTabCursor for Vec0Cursor<'_> {
    fn filter(
        &mut self,
        idx_num: c_int,
        _idx_str: Option<&str>,
        args: &Values<'_>,
    ) -> rusqlite::Result<()> {
        self.position = 0;
        self.k = None;
        self.rows.clear();

        let table = self.table;
        match Plan::from_idx_num(idx_num)? {
            Plan::Knn { column } => self.knn(column, args)?,
            Plan::Point => {
                if let Some(ValueRef::Integer(rowid)) = args.iter().next() {
                    if let Some(location) = table.shadow.lookup(&table.conn, rowid)? {
                        self.rows.push(CursorRow {
                            location,
                            distance: None,
                        });
                    }
                }
            }
            Plan::FullScan => {
                self.rows = table
                    .shadow
                    .rows(&table.conn)?
                    .into_iter()
                    .map(|location| CursorRow {
                        location,
                        distance: None,
                    })
                    .collect();
            }
        }
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.position += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.position >= self.rows.len()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let row = self.current()?;
        let config = self.table.config();
        let i = i as usize;

        if i < config.columns.len() {
            let vector = self
                .table
                .shadow
                .read_vector(&self.table.conn, i, &row.location)?;
            ctx.set_result(&vector.to_blob())
        } else if i == config.distance_column() {
            ctx.set_result(&row.distance.map(f64::from))
        } else if i == config.k_column() {
            ctx.set_result(&self.k)
        } else {
            Err(module_error(format!("vec0: no column at index {i}")))
        }
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.current()?.location.rowid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();
        conn
    }

    #[test]
    fn test_plan_round_trip() {
        for plan in [Plan::FullScan, Plan::Point, Plan::Knn { column: 5 }] {
            assert_eq!(Plan::from_idx_num(plan.idx_num()).unwrap(), plan);
        }
        assert!(Plan::from_idx_num(0).is_err());
    }

    #[test]
    fn test_create_insert_scan() {
        let conn = db();
        conn.execute_batch(
            "CREATE VIRTUAL TABLE items USING vec0(embedding float[2], chunk_size=8);
             INSERT INTO items(rowid, embedding) VALUES (10, '[1, 2]'), (20, '[3, 4]');",
        )
        .unwrap();

        let mut stmt = conn.prepare("SELECT rowid, embedding FROM items").unwrap();
        let rows: Vec<(i64, Vec<u8>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, 10);
        assert_eq!(rows[1].1, Vector::Float32(vec![3.0, 4.0]).to_blob());
    }

    #[test]
    fn test_point_lookup() {
        let conn = db();
        conn.execute_batch(
            "CREATE VIRTUAL TABLE items USING vec0(embedding int8[2]);
             INSERT INTO items(rowid, embedding) VALUES (1, '[1, 2]'), (2, '[3, 4]');",
        )
        .unwrap();

        let blob: Vec<u8> = conn
            .query_row("SELECT embedding FROM items WHERE rowid = 2", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(blob, vec![3, 4]);

        let missing: i64 = conn
            .query_row("SELECT count(*) FROM items WHERE rowid = 3", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(missing, 0);
    }

    #[test]
    fn test_knn_exposes_distance_and_k() {
        let conn = db();
        conn.execute_batch(
            "CREATE VIRTUAL TABLE items USING vec0(embedding float[1]);
             INSERT INTO items(rowid, embedding) VALUES (1, '[1]'), (2, '[5]'), (3, '[2]');",
        )
        .unwrap();

        let mut stmt = conn
            .prepare("SELECT rowid, distance, k FROM items WHERE embedding MATCH '[0]' AND k = 2")
            .unwrap();
        let rows: Vec<(i64, f64, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(rows, vec![(1, 1.0, 2), (3, 2.0, 2)]);
    }

    #[test]
    fn test_update_in_place() {
        let conn = db();
        conn.execute_batch(
            "CREATE VIRTUAL TABLE items USING vec0(embedding float[2]);
             INSERT INTO items(rowid, embedding) VALUES (1, '[1, 1]');
             UPDATE items SET embedding = '[7, 8]' WHERE rowid = 1;",
        )
        .unwrap();

        let blob: Vec<u8> = conn
            .query_row("SELECT embedding FROM items WHERE rowid = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(blob, Vector::Float32(vec![7.0, 8.0]).to_blob());

        assert!(conn
            .execute("UPDATE items SET rowid = 5 WHERE rowid = 1", [])
            .is_err());
    }

    #[test]
    fn test_reject_bad_table_definition() {
        let conn = db();
        let err = conn
            .execute_batch("CREATE VIRTUAL TABLE items USING vec0(embedding float[0])")
            .unwrap_err();
        assert!(err.to_string().contains("dimensions"));
    }
}
