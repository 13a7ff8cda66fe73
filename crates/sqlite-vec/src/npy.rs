//! NumPy `.npy` support
//!
//! Only what is needed to stream embeddings into SQLite: a 1-D or 2-D array
//! of 32-bit floats in C order. Exposed to SQL as the `vec_npy_each` table
//! function and, for connections that allow filesystem access, the
//! `vec_npy_file(path)` loader.
//!
//! ```sql
//! INSERT INTO items(embedding)
//!   SELECT vector FROM vec_npy_each(vec_npy_file('embeddings.npy'));
//! ```

use std::os::raw::c_int;
use std::path::Path;

use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::vtab::{
    eponymous_only_module, Context, IndexConstraintOp, IndexInfo, VTab, VTabConnection,
    VTabCursor, Values,
};
use rusqlite::{ffi, Connection};
use tracing::debug;

use crate::vector::Vector;
use crate::{Error, Result};

/// Name of the table function
pub const EACH_MODULE_NAME: &str = "vec_npy_each";
/// Name of the filesystem loader
pub const FILE_FUNCTION_NAME: &str = "vec_npy_file";

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// A decoded float32 array of `rows` vectors with `dimensions` elements each
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub rows: usize,
    pub dimensions: usize,
    data: Vec<f32>,
}

impl NpyArray {
    /// Decode a complete `.npy` file
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 10 || &bytes[..6] != MAGIC {
            return Err(Error::Npy("missing \\x93NUMPY magic".to_string()));
        }

        let major = bytes[6];
        let (header_len, header_start) = match major {
            1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
            2 | 3 => {
                let len = bytes
                    .get(8..12)
                    .ok_or_else(|| Error::Npy("truncated header length".to_string()))?;
                (
                    u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize,
                    12,
                )
            }
            other => return Err(Error::Npy(format!("unsupported format version {other}"))),
        };

        let header = bytes
            .get(header_start..header_start + header_len)
            .ok_or_else(|| Error::Npy("header extends past end of data".to_string()))?;
        let header = std::str::from_utf8(header)
            .map_err(|e| Error::Npy(format!("header is not valid text: {e}")))?;
        let header = NpyHeader::parse(header)?;

        let (rows, dimensions) = match header.shape.as_slice() {
            [d] => (1, *d),
            [n, d] => (*n, *d),
            other => {
                return Err(Error::Npy(format!(
                    "unsupported shape with {} dimensions, expected (N, D) or (D,)",
                    other.len()
                )))
            }
        };
        if dimensions == 0 {
            return Err(Error::Npy("vectors must have at least one element".to_string()));
        }

        let body = &bytes[header_start + header_len..];
        let expected = rows
            .checked_mul(dimensions)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| {
                Error::Npy(format!("shape ({rows}, {dimensions}) is too large"))
            })?;
        if body.len() != expected {
            return Err(Error::Npy(format!(
                "expected {expected} bytes of data for shape ({rows}, {dimensions}), got {}",
                body.len()
            )));
        }

        let data = body
            .chunks_exact(4)
            .map(|c| {
                let b = [c[0], c[1], c[2], c[3]];
                if header.big_endian {
                    f32::from_be_bytes(b)
                } else {
                    f32::from_le_bytes(b)
                }
            })
            .collect();

        Ok(Self {
            rows,
            dimensions,
            data,
        })
    }

    /// Vector at row `index`
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    /// Iterate over every row
    pub fn vectors(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions)
    }
}

/// The fields of the Python-dict header that matter here
#[derive(Debug, PartialEq)]
struct NpyHeader {
    big_endian: bool,
    shape: Vec<usize>,
}

impl NpyHeader {
    /// Parse `{'descr': '<f4', 'fortran_order': False, 'shape': (N, D), }`
    fn parse(header: &str) -> Result<Self> {
        let descr = dict_value(header, "descr")?;
        let descr = descr.trim_matches(|c| c == '\'' || c == '"');
        let big_endian = match descr {
            "<f4" | "|f4" | "=f4" => false,
            ">f4" => true,
            other => {
                return Err(Error::Npy(format!(
                    "unsupported dtype '{other}', only float32 ('<f4') arrays are supported"
                )))
            }
        };

        match dict_value(header, "fortran_order")? {
            "False" => {}
            "True" => {
                return Err(Error::Npy(
                    "fortran_order arrays are not supported".to_string(),
                ))
            }
            other => return Err(Error::Npy(format!("invalid fortran_order '{other}'"))),
        }

        let shape = dict_value(header, "shape")?;
        let inner = shape
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| Error::Npy(format!("invalid shape '{shape}'")))?;
        let shape = inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|_| Error::Npy(format!("invalid shape dimension '{s}'")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { big_endian, shape })
    }
}

/// Raw text of the value stored under `key` in a header dict
fn dict_value<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    let missing = || Error::Npy(format!("header has no '{key}' entry"));

    let start = header
        .find(&format!("'{key}'"))
        .or_else(|| header.find(&format!("\"{key}\"")))
        .ok_or_else(missing)?;
    let rest = &header[start + key.len() + 2..];
    let rest = rest.trim_start().strip_prefix(':').ok_or_else(missing)?.trim_start();

    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else if let Some(quote) = rest.chars().next().filter(|c| *c == '\'' || *c == '"') {
        rest[1..].find(quote).map(|i| i + 2)
    } else {
        rest.find([',', '}'])
    }
    .ok_or_else(|| Error::Npy(format!("unterminated '{key}' entry")))?;

    Ok(rest[..end].trim())
}

/// Register `vec_npy_each` on `conn`
pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_module(EACH_MODULE_NAME, eponymous_only_module::<NpyEachTab>(), None)
}

/// Register `vec_npy_file` on `conn`. It reads arbitrary files, so it is
/// only available from top-level SQL.
pub fn register_fs_read(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        FILE_FUNCTION_NAME,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DIRECTONLY,
        |ctx| {
            let path: String = ctx
                .get(0)
                .map_err(|e| Error::from(e).context(FILE_FUNCTION_NAME))?;
            let bytes = read_file(Path::new(&path)).map_err(|e| e.context(FILE_FUNCTION_NAME))?;
            Ok(bytes)
        },
    )
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), len = bytes.len(), "read npy file");
    Ok(bytes)
}

#[repr(C)]
pub struct NpyEachTab {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab,
}

unsafe impl<'vtab> VTab<'vtab> for NpyEachTab {
    type Aux = ();
    type Cursor = NpyEachCursor;

    fn connect(
        _db: &mut VTabConnection,
        _aux: Option<&()>,
        _args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let tab = NpyEachTab {
            base: ffi::sqlite3_vtab::default(),
        };
        Ok(("CREATE TABLE x(vector, input hidden)".to_string(), tab))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let mut found = false;
        for (constraint, mut usage) in info.constraints_and_usages() {
            if !found
                && constraint.is_usable()
                && constraint.column() == 1
                && matches!(
                    constraint.operator(),
                    IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ
                )
            {
                usage.set_argv_index(1);
                usage.set_omit(true);
                found = true;
            }
        }
        if !found {
            return Err(rusqlite::Error::ModuleError(
                "vec_npy_each: an input BLOB is required".to_string(),
            ));
        }
        info.set_idx_num(1);
        info.set_estimated_cost(1000.0);
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<NpyEachCursor> {
        Ok(NpyEachCursor::default())
    }
}

#[derive(Default)]
#[repr(C)]
pub struct NpyEachCursor {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab_cursor,
    array: Option<NpyArray>,
    input: Vec<u8>,
    position: usize,
}

unsafe impl VTabCursor for NpyEachCursor {
    fn filter(
        &mut self,
        _idx_num: c_int,
        _idx_str: Option<&str>,
        args: &Values<'_>,
    ) -> rusqlite::Result<()> {
        let array = match args.iter().next() {
            Some(ValueRef::Blob(bytes)) => {
                NpyArray::parse(bytes).map_err(|e| e.context(EACH_MODULE_NAME))?
            }
            _ => {
                return Err(rusqlite::Error::ModuleError(
                    "vec_npy_each: input must be a BLOB".to_string(),
                ))
            }
        };
        self.array = Some(array);
        self.input = match args.iter().next() {
            Some(ValueRef::Blob(bytes)) => bytes.to_vec(),
            _ => Vec::new(),
        };
        self.position = 0;
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.position += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.array
            .as_ref()
            .map_or(true, |array| self.position >= array.rows)
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        if i == 1 {
            return ctx.set_result(&self.input);
        }
        let row = self.array.as_ref().and_then(|array| array.row(self.position));
        ctx.set_result(&row.map(|v| Vector::Float32(v.to_vec()).to_blob()))
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.position as i64)
    }
}
