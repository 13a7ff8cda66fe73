//! sqlite-vec benchmark tool
//!
//! Fills a `vec0` table with random vectors and times KNN queries against it.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use rusqlite::{params, Connection};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sqlite-vec-bench", about = "Benchmark vec0 inserts and KNN queries")]
struct Args {
    /// Number of vectors to insert
    #[arg(short = 'n', long, default_value_t = 10_000)]
    rows: usize,

    /// Vector dimensions
    #[arg(short, long, default_value_t = 128)]
    dimensions: usize,

    /// Neighbours returned per query
    #[arg(short, long, default_value_t = 10)]
    k: usize,

    /// Number of KNN queries to time
    #[arg(short, long, default_value_t = 100)]
    queries: usize,

    /// Slots per vec0 chunk
    #[arg(long, default_value_t = 1024)]
    chunk_size: usize,

    /// Distance metric of the vector column (l2 or cosine)
    #[arg(long, default_value = "l2")]
    metric: String,

    /// Database file. An in-memory database is used when omitted
    #[arg(long)]
    database: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let conn = match &args.database {
        Some(path) => Connection::open(path).with_context(|| format!("opening {path}"))?,
        None => Connection::open_in_memory()?,
    };
    sqlite_vec::register(&conn)?;

    let version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
    info!(%version, rows = args.rows, dimensions = args.dimensions, "starting benchmark");

    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS bench_items;
         CREATE VIRTUAL TABLE bench_items USING vec0(embedding float[{}] distance_metric={}, chunk_size={});",
        args.dimensions, args.metric, args.chunk_size
    ))
    .context("creating vec0 table")?;

    bench_insert(&conn, &args)?;
    bench_knn(&conn, &args)?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn random_blob(rng: &mut impl Rng, dimensions: usize) -> Vec<u8> {
    (0..dimensions)
        .flat_map(|_| rng.gen_range(-1.0f32..1.0).to_le_bytes())
        .collect()
}

fn bench_insert(conn: &Connection, args: &Args) -> Result<()> {
    let mut rng = rand::thread_rng();
    let start = Instant::now();

    let tx = conn.unchecked_transaction()?;
    {
        let mut insert = tx.prepare("INSERT INTO bench_items(embedding) VALUES (?1)")?;
        for _ in 0..args.rows {
            insert.execute([random_blob(&mut rng, args.dimensions)])?;
        }
    }
    tx.commit()?;

    let elapsed = start.elapsed();
    info!(
        rows = args.rows,
        elapsed = ?elapsed,
        rows_per_sec = (args.rows as f64 / elapsed.as_secs_f64()).round(),
        "insert finished"
    );
    Ok(())
}

fn bench_knn(conn: &Connection, args: &Args) -> Result<()> {
    let mut rng = rand::thread_rng();
    let mut stmt = conn.prepare(
        "SELECT rowid, distance FROM bench_items WHERE embedding MATCH ?1 AND k = ?2",
    )?;

    let mut returned = 0usize;
    let start = Instant::now();
    for _ in 0..args.queries {
        let query = random_blob(&mut rng, args.dimensions);
        let mut rows = stmt.query(params![query, args.k as i64])?;
        while rows.next()?.is_some() {
            returned += 1;
        }
    }

    let elapsed = start.elapsed();
    let queries = args.queries.max(1) as u32;
    info!(
        queries = args.queries,
        k = args.k,
        returned,
        avg_latency = ?(elapsed / queries),
        "knn finished"
    );
    Ok(())
}
