//! sqlite-vec - vector search as a SQLite extension
//!
//! This crate provides:
//! - Vector scalar functions (`vec_f32`, `vec_distance_l2`, `vec_quantize_binary`, ...)
//! - Table functions `vec_each` and `vec_npy_each`
//! - The `vec0` virtual table: vectors stored in chunked shadow tables with
//!   brute-force KNN queries
//! - SIMD-accelerated distance computation
//! - C entry points `sqlite3_vec_init` / `sqlite3_vec_fs_read_init`
//!
//! # Usage
//!
//! ```no_run
//! use rusqlite::Connection;
//!
//! let conn = Connection::open_in_memory()?;
//! sqlite_vec::register(&conn)?;
//! let version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod distance;
pub mod each;
pub mod error;
pub mod ffi;
pub mod functions;
pub mod npy;
pub mod vec0;
pub mod vector;

use rusqlite::Connection;
use tracing::debug;

pub use distance::DistanceMetric;
pub use error::{Error, Result};
pub use ffi::{register_auto_extension, sqlite3_vec_fs_read_init, sqlite3_vec_init};
pub use vec0::Vec0Config;
pub use vector::{ElementType, Vector};

/// Extension version, as returned by `vec_version()`
pub const SQLITE_VEC_VERSION: &str = "v0.8c418f934908b41ed840386fbf0412e076dc0664";
/// Release date of [`SQLITE_VEC_VERSION`]
pub const SQLITE_VEC_DATE: &str = "28-05-2024";
/// Upstream source of the extension
pub const SQLITE_VEC_SOURCE: &str = "github.com/asg017/sqlite-vec";

/// Register the scalar functions, `vec_each`, `vec_npy_each` and `vec0`
pub fn register(conn: &Connection) -> Result<()> {
    functions::register(conn)?;
    each::register(conn)?;
    npy::register(conn)?;
    vec0::register(conn)?;
    debug!(version = SQLITE_VEC_VERSION, "registered sqlite-vec");
    Ok(())
}

/// Register `vec_npy_file`, which reads arbitrary files
pub fn register_fs_read(conn: &Connection) -> Result<()> {
    npy::register_fs_read(conn)?;
    debug!("registered sqlite-vec filesystem functions");
    Ok(())
}
