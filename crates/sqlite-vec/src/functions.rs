//! Scalar SQL functions
//!
//! All functions are deterministic and take vectors as BLOBs or JSON text.
//! The element type of an input comes from the function itself: `vec_int8`
//! reads int8, `vec_bit` and `vec_distance_hamming` read bits, everything
//! else reads float32.

use std::panic::UnwindSafe;

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ToSql;
use rusqlite::Connection;

use crate::distance::DistanceMetric;
use crate::vector::{ElementType, Vector};
use crate::{Error, Result, SQLITE_VEC_DATE, SQLITE_VEC_SOURCE, SQLITE_VEC_VERSION};

/// Register every scalar function on `conn`
pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    define(conn, "vec_version", 0, |_| Ok(SQLITE_VEC_VERSION))?;
    define(conn, "vec_debug", 0, |_| Ok(debug_info()))?;

    define(conn, "vec_f32", 1, |ctx| {
        Ok(vector_arg(ctx, 0, ElementType::Float32)?.to_blob())
    })?;
    define(conn, "vec_int8", 1, |ctx| {
        Ok(vector_arg(ctx, 0, ElementType::Int8)?.to_blob())
    })?;
    define(conn, "vec_bit", 1, |ctx| {
        Ok(vector_arg(ctx, 0, ElementType::Bit)?.to_blob())
    })?;

    define(conn, "vec_length", 1, |ctx| {
        Ok(vector_arg(ctx, 0, ElementType::Float32)?.dimensions() as i64)
    })?;
    define(conn, "vec_to_json", 1, |ctx| {
        vector_arg(ctx, 0, ElementType::Float32)?.to_json()
    })?;

    define(conn, "vec_add", 2, |ctx| {
        let (a, b) = vector_pair(ctx, ElementType::Float32)?;
        Ok(a.add(&b)?.to_blob())
    })?;
    define(conn, "vec_sub", 2, |ctx| {
        let (a, b) = vector_pair(ctx, ElementType::Float32)?;
        Ok(a.sub(&b)?.to_blob())
    })?;
    define(conn, "vec_normalize", 1, |ctx| {
        Ok(vector_arg(ctx, 0, ElementType::Float32)?.normalize()?.to_blob())
    })?;
    define(conn, "vec_slice", 3, |ctx| {
        let v = vector_arg(ctx, 0, ElementType::Float32)?;
        let start = index_arg(ctx, 1, "start")?;
        let end = index_arg(ctx, 2, "end")?;
        Ok(v.slice(start, end)?.to_blob())
    })?;

    define(conn, "vec_distance_l2", 2, |ctx| {
        distance(ctx, DistanceMetric::L2, ElementType::Float32)
    })?;
    define(conn, "vec_distance_cosine", 2, |ctx| {
        distance(ctx, DistanceMetric::Cosine, ElementType::Float32)
    })?;
    define(conn, "vec_distance_hamming", 2, |ctx| {
        distance(ctx, DistanceMetric::Hamming, ElementType::Bit)
    })?;

    define(conn, "vec_quantize_i8", 2, |ctx| {
        let v = vector_arg(ctx, 0, ElementType::Float32)?;
        let range: String = ctx.get(1)?;
        if range != "unit" {
            return Err(Error::InvalidArgument(format!(
                "unsupported quantization range '{range}', only 'unit' is supported"
            )));
        }
        Ok(v.quantize_i8_unit()?.to_blob())
    })?;
    define(conn, "vec_quantize_binary", 1, |ctx| {
        Ok(vector_arg(ctx, 0, ElementType::Float32)?
            .quantize_binary()?
            .to_blob())
    })?;

    Ok(())
}

/// Register one deterministic function whose errors carry its name
fn define<T, F>(conn: &Connection, name: &'static str, n_arg: i32, f: F) -> rusqlite::Result<()>
where
    T: ToSql,
    F: Fn(&Context<'_>) -> Result<T> + Send + UnwindSafe + 'static,
{
    conn.create_scalar_function(
        name,
        n_arg,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| f(ctx).map_err(|e| rusqlite::Error::from(e.context(name))),
    )
}

fn vector_arg(ctx: &Context<'_>, idx: usize, element_type: ElementType) -> Result<Vector> {
    Vector::from_value(ctx.get_raw(idx), element_type)
}

fn vector_pair(ctx: &Context<'_>, element_type: ElementType) -> Result<(Vector, Vector)> {
    Ok((
        vector_arg(ctx, 0, element_type)?,
        vector_arg(ctx, 1, element_type)?,
    ))
}

fn index_arg(ctx: &Context<'_>, idx: usize, name: &str) -> Result<usize> {
    let value: i64 = ctx.get(idx)?;
    usize::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("{name} must be non-negative, got {value}")))
}

fn distance(ctx: &Context<'_>, metric: DistanceMetric, element_type: ElementType) -> Result<f64> {
    let (a, b) = vector_pair(ctx, element_type)?;
    Ok(f64::from(metric.distance(&a, &b)?))
}

fn debug_info() -> String {
    format!(
        "Version: {SQLITE_VEC_VERSION}\nDate: {SQLITE_VEC_DATE}\nSource: {SQLITE_VEC_SOURCE}\nBuild flags: {}",
        build_flags().join(" ")
    )
}

fn build_flags() -> Vec<&'static str> {
    let mut flags = vec!["simsimd"];
    if cfg!(target_feature = "avx2") {
        flags.push("avx2");
    }
    if cfg!(target_feature = "neon") {
        flags.push("neon");
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::types::Value;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();
        conn
    }

    fn query<T: rusqlite::types::FromSql>(conn: &Connection, sql: &str) -> rusqlite::Result<T> {
        conn.query_row(sql, [], |row| row.get(0))
    }

    fn f32_blob(values: &[f32]) -> Vec<u8> {
        Vector::Float32(values.to_vec()).to_blob()
    }

    #[test]
    fn test_version_and_debug() {
        let conn = db();
        let version: String = query(&conn, "SELECT vec_version()").unwrap();
        assert_eq!(version, SQLITE_VEC_VERSION);

        let debug: String = query(&conn, "SELECT vec_debug()").unwrap();
        assert!(debug.starts_with(&format!("Version: {SQLITE_VEC_VERSION}\n")));
        assert!(debug.contains("Build flags: simsimd"));
    }

    #[test]
    fn test_constructors() {
        let conn = db();
        let blob: Vec<u8> = query(&conn, "SELECT vec_f32('[1, 2]')").unwrap();
        assert_eq!(blob, f32_blob(&[1.0, 2.0]));

        let blob: Vec<u8> = query(&conn, "SELECT vec_int8('[-1, 2]')").unwrap();
        assert_eq!(blob, vec![0xff, 2]);

        let blob: Vec<u8> = query(&conn, "SELECT vec_bit(X'F0')").unwrap();
        assert_eq!(blob, vec![0xf0]);

        assert!(query::<Vec<u8>>(&conn, "SELECT vec_bit('[1]')").is_err());
        assert!(query::<Vec<u8>>(&conn, "SELECT vec_int8('[300]')").is_err());
    }

    #[test]
    fn test_length_and_json() {
        let conn = db();
        let len: i64 = query(&conn, "SELECT vec_length('[1, 2, 3]')").unwrap();
        assert_eq!(len, 3);

        let json: String = query(&conn, "SELECT vec_to_json(vec_f32('[0.5, -1]'))").unwrap();
        assert_eq!(json, "[0.5,-1.0]");
    }

    #[test]
    fn test_arithmetic() {
        let conn = db();
        let json: String =
            query(&conn, "SELECT vec_to_json(vec_add('[1, 2]', '[3, 4]'))").unwrap();
        assert_eq!(json, "[4.0,6.0]");

        let json: String =
            query(&conn, "SELECT vec_to_json(vec_sub('[1, 2]', '[3, 4]'))").unwrap();
        assert_eq!(json, "[-2.0,-2.0]");

        let json: String = query(&conn, "SELECT vec_to_json(vec_normalize('[3, 4]'))").unwrap();
        assert_eq!(json, "[0.6,0.8]");

        let json: String =
            query(&conn, "SELECT vec_to_json(vec_slice('[1, 2, 3, 4]', 1, 3))").unwrap();
        assert_eq!(json, "[2.0,3.0]");

        assert!(query::<Vec<u8>>(&conn, "SELECT vec_add('[1]', '[1, 2]')").is_err());
        assert!(query::<Vec<u8>>(&conn, "SELECT vec_slice('[1, 2]', -1, 1)").is_err());
        assert!(query::<Vec<u8>>(&conn, "SELECT vec_slice('[1, 2]', 1, 1)").is_err());
    }

    #[test]
    fn test_distances() {
        let conn = db();
        let d: f64 = query(&conn, "SELECT vec_distance_l2('[0, 0]', '[3, 4]')").unwrap();
        assert!((d - 5.0).abs() < 1e-6);

        let d: f64 = query(&conn, "SELECT vec_distance_cosine('[1, 0]', '[0, 1]')").unwrap();
        assert!((d - 1.0).abs() < 1e-6);

        let d: f64 = query(&conn, "SELECT vec_distance_hamming(X'FF', X'0F')").unwrap();
        assert_eq!(d, 4.0);
    }

    #[test]
    fn test_quantize() {
        let conn = db();
        let blob: Vec<u8> = query(&conn, "SELECT vec_quantize_i8('[-1, 0, 1]', 'unit')").unwrap();
        assert_eq!(blob, vec![0x80, 0x00, 0x7f]);

        let blob: Vec<u8> =
            query(&conn, "SELECT vec_quantize_binary('[1, -1, 1, -1, 0, 0, 0, 2]')").unwrap();
        assert_eq!(blob, vec![0b1000_0101]);

        assert!(query::<Vec<u8>>(&conn, "SELECT vec_quantize_i8('[1]', 'int4')").is_err());
    }

    #[test]
    fn test_error_names_function() {
        let conn = db();
        let err = query::<Value>(&conn, "SELECT vec_distance_l2('[1]', '[1, 2]')").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("vec_distance_l2"), "{msg}");
        assert!(msg.contains("Dimension mismatch"), "{msg}");

        let err = query::<Value>(&conn, "SELECT vec_f32(NULL)").unwrap_err();
        assert!(err.to_string().contains("vec_f32"));

        let err = query::<Value>(&conn, "SELECT vec_quantize_i8('[1]', NULL)").unwrap_err();
        assert!(err.to_string().contains("vec_quantize_i8"), "{err}");
    }
}
