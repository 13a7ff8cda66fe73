//! `vec_each(vector)`: one row per element of a float32 vector
//!
//! ```sql
//! SELECT rowid, value FROM vec_each('[1, 2, 3]');
//! ```

use std::os::raw::c_int;

use rusqlite::types::ValueRef;
use rusqlite::vtab::{
    eponymous_only_module, Context, IndexConstraintOp, IndexInfo, VTab, VTabConnection,
    VTabCursor, Values,
};
use rusqlite::{ffi, Connection};

use crate::vector::{ElementType, Vector};

/// Name the table function is registered under
pub const MODULE_NAME: &str = "vec_each";

const COLUMN_VALUE: c_int = 0;
const COLUMN_VECTOR: c_int = 1;

/// Register `vec_each` on `conn`
pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_module(MODULE_NAME, eponymous_only_module::<EachTab>(), None)
}

#[repr(C)]
pub struct EachTab {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab,
}

unsafe impl<'vtab> VTab<'vtab> for EachTab {
    type Aux = ();
    type Cursor = EachCursor;

    fn connect(
        _db: &mut VTabConnection,
        _aux: Option<&()>,
        _args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let tab = EachTab {
            base: ffi::sqlite3_vtab::default(),
        };
        Ok(("CREATE TABLE x(value, vector hidden)".to_string(), tab))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let mut found = false;
        for (constraint, mut usage) in info.constraints_and_usages() {
            if found || !constraint.is_usable() || constraint.column() != COLUMN_VECTOR {
                continue;
            }
            if matches!(
                constraint.operator(),
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ
            ) {
                usage.set_argv_index(1);
                usage.set_omit(true);
                found = true;
            }
        }
        if !found {
            return Err(rusqlite::Error::ModuleError(
                "vec_each: a vector argument is required".to_string(),
            ));
        }
        info.set_idx_num(1);
        info.set_estimated_cost(100.0);
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<EachCursor> {
        Ok(EachCursor::default())
    }
}

#[derive(Default)]
#[repr(C)]
pub struct EachCursor {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab_cursor,
    values: Vec<f32>,
    position: usize,
}

unsafe impl VTabCursor for EachCursor {
    fn filter(
        &mut self,
        _idx_num: c_int,
        _idx_str: Option<&str>,
        args: &Values<'_>,
    ) -> rusqlite::Result<()> {
        let value = args.iter().next().unwrap_or(ValueRef::Null);
        let vector = Vector::from_value(value, ElementType::Float32)
            .map_err(|e| e.context(MODULE_NAME))?;
        let Vector::Float32(values) = vector else {
            return Err(rusqlite::Error::ModuleError(
                "vec_each: expected a float32 vector".to_string(),
            ));
        };

        self.values = values;
        self.position = 0;
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.position += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.position >= self.values.len()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        match i {
            COLUMN_VALUE => ctx.set_result(&self.values.get(self.position).map(|&v| f64::from(v))),
            COLUMN_VECTOR => ctx.set_result(&Vector::Float32(self.values.clone()).to_blob()),
            _ => Ok(()),
        }
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.position as i64)
    }
}
