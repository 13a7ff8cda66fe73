//! Shadow-table storage for `vec0`
//!
//! A `vec0` table `t` keeps its rows in ordinary tables next to it:
//! - `t_chunks`: one row per chunk, with a validity bitmap and the rowid
//!   stored in each slot
//! - `t_rowids`: maps each rowid to its chunk and slot
//! - `t_vector_chunksNN`: one BLOB of `chunk_size` vectors per chunk, for
//!   vector column `NN`
//!
//! Slots are written in place with incremental BLOB I/O, so an insert never
//! rewrites a whole chunk.

use rusqlite::{ffi, params, Connection, DatabaseName, OptionalExtension};
use tracing::debug;

use super::config::Vec0Config;
use crate::vector::Vector;
use crate::{Error, Result};

/// Where a row's vectors live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLocation {
    pub rowid: i64,
    pub chunk_id: i64,
    pub offset: usize,
}

/// Bookkeeping of one chunk
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: i64,
    pub validity: Vec<u8>,
    pub rowids: Vec<u8>,
}

impl Chunk {
    /// Whether `slot` currently holds a row
    pub fn is_valid(&self, slot: usize) -> bool {
        self.validity
            .get(slot / 8)
            .is_some_and(|&byte| byte & (1 << (slot % 8)) != 0)
    }

    /// Rowid stored in `slot`
    pub fn rowid(&self, slot: usize) -> Option<i64> {
        let bytes = self.rowids.get(slot * 8..slot * 8 + 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(i64::from_le_bytes(buf))
    }
}

/// Names and statements for the shadow tables of one `vec0` table
#[derive(Debug, Clone)]
pub struct ShadowTables {
    schema: String,
    table: String,
    config: Vec0Config,
}

impl ShadowTables {
    pub fn new(schema: &str, table: &str, config: Vec0Config) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            config,
        }
    }

    pub fn config(&self) -> &Vec0Config {
        &self.config
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn chunks_table(&self) -> String {
        format!("{}_chunks", self.table)
    }

    fn rowids_table(&self) -> String {
        format!("{}_rowids", self.table)
    }

    fn vector_chunks_table(&self, column: usize) -> String {
        format!("{}_vector_chunks{:02}", self.table, column)
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}.{}", quote_identifier(&self.schema), quote_identifier(name))
    }

    fn database(&self) -> DatabaseName<'_> {
        match self.schema.as_str() {
            "main" => DatabaseName::Main,
            "temp" => DatabaseName::Temp,
            other => DatabaseName::Attached(other),
        }
    }

    /// Create every shadow table
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let mut sql = format!(
            "CREATE TABLE {}(chunk_id INTEGER PRIMARY KEY AUTOINCREMENT, size INTEGER NOT NULL, validity BLOB NOT NULL, rowids BLOB NOT NULL);\n\
             CREATE TABLE {}(rowid INTEGER PRIMARY KEY AUTOINCREMENT, chunk_id INTEGER, chunk_offset INTEGER);\n",
            self.qualified(&self.chunks_table()),
            self.qualified(&self.rowids_table()),
        );
        for column in 0..self.config.columns.len() {
            sql.push_str(&format!(
                "CREATE TABLE {}(rowid INTEGER PRIMARY KEY, vectors BLOB NOT NULL);\n",
                self.qualified(&self.vector_chunks_table(column))
            ));
        }

        conn.execute_batch(&sql)?;
        debug!(table = %self.table, columns = self.config.columns.len(), "created vec0 shadow tables");
        Ok(())
    }

    /// Drop every shadow table
    pub fn drop_all(&self, conn: &Connection) -> Result<()> {
        let mut sql = format!(
            "DROP TABLE IF EXISTS {};\nDROP TABLE IF EXISTS {};\n",
            self.qualified(&self.chunks_table()),
            self.qualified(&self.rowids_table()),
        );
        for column in 0..self.config.columns.len() {
            sql.push_str(&format!(
                "DROP TABLE IF EXISTS {};\n",
                self.qualified(&self.vector_chunks_table(column))
            ));
        }

        conn.execute_batch(&sql)?;
        debug!(table = %self.table, "dropped vec0 shadow tables");
        Ok(())
    }

    /// Check that `vectors` match the declared columns, one per column
    pub fn check_vectors(&self, vectors: &[Vector]) -> Result<()> {
        if vectors.len() != self.config.columns.len() {
            return Err(Error::InvalidArgument(format!(
                "expected {} vectors, got {}",
                self.config.columns.len(),
                vectors.len()
            )));
        }
        for (column, vector) in self.config.columns.iter().zip(vectors) {
            self.check_vector(column.name.as_str(), vector)?;
        }
        Ok(())
    }

    fn check_vector(&self, name: &str, vector: &Vector) -> Result<()> {
        let index = self
            .config
            .column_index(name)
            .ok_or_else(|| Error::InvalidArgument(format!("no vector column '{name}'")))?;
        let column = &self.config.columns[index];
        if vector.element_type() != column.element_type {
            return Err(Error::ElementTypeMismatch {
                expected: column.element_type,
                actual: vector.element_type(),
            });
        }
        vector.check_dimensions(column.dimensions)
    }

    /// Store a new row and return its rowid
    pub fn insert(
        &self,
        conn: &Connection,
        rowid: Option<i64>,
        vectors: &[Vector],
    ) -> Result<i64> {
        self.check_vectors(vectors)?;

        let rowid = match rowid {
            Some(rowid) => {
                if self.lookup(conn, rowid)?.is_some() {
                    return Err(Error::Sqlite(rusqlite::Error::SqliteFailure(
                        ffi::Error::new(ffi::SQLITE_CONSTRAINT),
                        Some(format!(
                            "UNIQUE constraint failed on {} primary key",
                            self.table
                        )),
                    )));
                }
                conn.execute(
                    &format!(
                        "INSERT INTO {}(rowid) VALUES (?1)",
                        self.qualified(&self.rowids_table())
                    ),
                    params![rowid],
                )?;
                rowid
            }
            None => {
                conn.execute(
                    &format!(
                        "INSERT INTO {}(rowid) VALUES (NULL)",
                        self.qualified(&self.rowids_table())
                    ),
                    [],
                )?;
                conn.last_insert_rowid()
            }
        };

        let (chunk_id, offset) = self.allocate_slot(conn)?;
        conn.execute(
            &format!(
                "UPDATE {} SET chunk_id = ?1, chunk_offset = ?2 WHERE rowid = ?3",
                self.qualified(&self.rowids_table())
            ),
            params![chunk_id, offset as i64, rowid],
        )?;

        self.write_slot(conn, chunk_id, offset, Some(rowid))?;
        for (column, vector) in vectors.iter().enumerate() {
            self.write_vector(conn, column, chunk_id, offset, &vector.to_blob())?;
        }

        Ok(rowid)
    }

    /// Overwrite the vectors of an existing row. `None` leaves a column as is.
    pub fn update(
        &self,
        conn: &Connection,
        rowid: i64,
        vectors: &[Option<Vector>],
    ) -> Result<()> {
        let location = self.lookup(conn, rowid)?.ok_or_else(|| {
            Error::InvalidArgument(format!("rowid {rowid} does not exist in {}", self.table))
        })?;

        for (column, vector) in vectors.iter().enumerate() {
            if let Some(vector) = vector {
                let name = &self.config.columns[column].name;
                self.check_vector(name, vector)?;
                self.write_vector(
                    conn,
                    column,
                    location.chunk_id,
                    location.offset,
                    &vector.to_blob(),
                )?;
            }
        }
        Ok(())
    }

    /// Remove a row. Unknown rowids are ignored.
    pub fn delete(&self, conn: &Connection, rowid: i64) -> Result<()> {
        let Some(location) = self.lookup(conn, rowid)? else {
            return Ok(());
        };

        self.write_slot(conn, location.chunk_id, location.offset, None)?;
        for (column, def) in self.config.columns.iter().enumerate() {
            let zeroes = vec![0u8; def.vector_size()];
            self.write_vector(conn, column, location.chunk_id, location.offset, &zeroes)?;
        }
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE rowid = ?1",
                self.qualified(&self.rowids_table())
            ),
            params![rowid],
        )?;
        Ok(())
    }

    /// Find where `rowid` is stored
    pub fn lookup(&self, conn: &Connection, rowid: i64) -> Result<Option<RowLocation>> {
        let row: Option<(Option<i64>, Option<i64>)> = conn
            .prepare_cached(&format!(
                "SELECT chunk_id, chunk_offset FROM {} WHERE rowid = ?1",
                self.qualified(&self.rowids_table())
            ))?
            .query_row(params![rowid], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        Ok(match row {
            Some((Some(chunk_id), Some(offset))) => Some(RowLocation {
                rowid,
                chunk_id,
                offset: offset as usize,
            }),
            _ => None,
        })
    }

    /// Every stored row, in rowid order
    pub fn rows(&self, conn: &Connection) -> Result<Vec<RowLocation>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT rowid, chunk_id, chunk_offset FROM {} WHERE chunk_id IS NOT NULL ORDER BY rowid",
            self.qualified(&self.rowids_table())
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RowLocation {
                    rowid: row.get(0)?,
                    chunk_id: row.get(1)?,
                    offset: row.get::<_, i64>(2)? as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Bookkeeping for every chunk, oldest first
    pub fn chunks(&self, conn: &Connection) -> Result<Vec<Chunk>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT chunk_id, validity, rowids FROM {} ORDER BY chunk_id",
            self.qualified(&self.chunks_table())
        ))?;
        let chunks = stmt
            .query_map([], |row| {
                Ok(Chunk {
                    id: row.get(0)?,
                    validity: row.get(1)?,
                    rowids: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// All vector bytes of `column` in one chunk
    pub fn chunk_vectors(
        &self,
        conn: &Connection,
        column: usize,
        chunk_id: i64,
    ) -> Result<Vec<u8>> {
        let bytes = conn
            .prepare_cached(&format!(
                "SELECT vectors FROM {} WHERE rowid = ?1",
                self.qualified(&self.vector_chunks_table(column))
            ))?
            .query_row(params![chunk_id], |row| row.get(0))?;
        Ok(bytes)
    }

    /// Read the vector of `column` stored at `location`
    pub fn read_vector(
        &self,
        conn: &Connection,
        column: usize,
        location: &RowLocation,
    ) -> Result<Vector> {
        let def = &self.config.columns[column];
        let size = def.vector_size();
        let mut buf = vec![0u8; size];

        let table = self.vector_chunks_table(column);
        let mut blob = conn.blob_open(self.database(), &table, "vectors", location.chunk_id, true)?;
        blob.read_at_exact(&mut buf, location.offset * size)?;

        Vector::from_blob(&buf, def.element_type)
    }

    /// Latest chunk's first free slot, or slot 0 of a fresh chunk
    fn allocate_slot(&self, conn: &Connection) -> Result<(i64, usize)> {
        let latest: Option<(i64, Vec<u8>)> = conn
            .prepare_cached(&format!(
                "SELECT chunk_id, validity FROM {} ORDER BY chunk_id DESC LIMIT 1",
                self.qualified(&self.chunks_table())
            ))?
            .query_row([], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        if let Some((chunk_id, validity)) = latest {
            if let Some(slot) = first_free_slot(&validity, self.config.chunk_size) {
                return Ok((chunk_id, slot));
            }
        }

        Ok((self.new_chunk(conn)?, 0))
    }

    fn new_chunk(&self, conn: &Connection) -> Result<i64> {
        let chunk_size = self.config.chunk_size;
        conn.execute(
            &format!(
                "INSERT INTO {}(size, validity, rowids) VALUES (?1, zeroblob(?2), zeroblob(?3))",
                self.qualified(&self.chunks_table())
            ),
            params![chunk_size as i64, (chunk_size / 8) as i64, (chunk_size * 8) as i64],
        )?;
        let chunk_id = conn.last_insert_rowid();

        for (column, def) in self.config.columns.iter().enumerate() {
            conn.execute(
                &format!(
                    "INSERT INTO {}(rowid, vectors) VALUES (?1, zeroblob(?2))",
                    self.qualified(&self.vector_chunks_table(column))
                ),
                params![chunk_id, (chunk_size * def.vector_size()) as i64],
            )?;
        }

        debug!(table = %self.table, chunk_id, chunk_size, "allocated vec0 chunk");
        Ok(chunk_id)
    }

    /// Mark `offset` occupied by `rowid`, or free it when `rowid` is `None`
    fn write_slot(
        &self,
        conn: &Connection,
        chunk_id: i64,
        offset: usize,
        rowid: Option<i64>,
    ) -> Result<()> {
        let table = self.chunks_table();

        let mut validity = conn.blob_open(self.database(), &table, "validity", chunk_id, false)?;
        let mut byte = [0u8; 1];
        validity.read_at_exact(&mut byte, offset / 8)?;
        match rowid {
            Some(_) => byte[0] |= 1 << (offset % 8),
            None => byte[0] &= !(1 << (offset % 8)),
        }
        validity.write_at(&byte, offset / 8)?;
        drop(validity);

        let mut rowids = conn.blob_open(self.database(), &table, "rowids", chunk_id, false)?;
        rowids.write_at(&rowid.unwrap_or(0).to_le_bytes(), offset * 8)?;
        Ok(())
    }

    fn write_vector(
        &self,
        conn: &Connection,
        column: usize,
        chunk_id: i64,
        offset: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let size = self.config.columns[column].vector_size();
        let table = self.vector_chunks_table(column);
        let mut blob = conn.blob_open(self.database(), &table, "vectors", chunk_id, false)?;
        blob.write_at(bytes, offset * size)?;
        Ok(())
    }
}

/// First unset bit below `capacity`
fn first_free_slot(validity: &[u8], capacity: usize) -> Option<usize> {
    (0..capacity.min(validity.len() * 8))
        .find(|&slot| validity[slot / 8] & (1 << (slot % 8)) == 0)
}

/// Quote an SQL identifier with double quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
