//! Brute-force K-nearest-neighbour search over `vec0` chunks
//!
//! Chunks are loaded one at a time. Within a chunk the occupied slots are
//! scored in parallel on the rayon pool, then folded into a bounded max-heap
//! holding the best `k` rows seen so far.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rayon::prelude::*;
use rusqlite::Connection;
use tracing::debug;

use super::config::VectorColumn;
use super::shadow::{RowLocation, ShadowTables};
use crate::distance::{
    cosine_distance, cosine_distance_i8, hamming_distance, l2_distance, l2_distance_i8,
    DistanceMetric,
};
use crate::vector::{ElementType, Vector};
use crate::{Error, Result};

/// A KNN result row
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub location: RowLocation,
    pub distance: f32,
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        // Closer first, ties broken by rowid
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.location.rowid.cmp(&other.location.rowid))
    }
}

/// Vectors of one chunk, decoded once
enum ChunkVectors {
    Float32(Vec<f32>),
    Int8(Vec<i8>),
    Bit(Vec<u8>),
}

impl ChunkVectors {
    fn decode(bytes: Vec<u8>, element_type: ElementType) -> Self {
        match element_type {
            ElementType::Float32 => ChunkVectors::Float32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            ElementType::Int8 => ChunkVectors::Int8(bytes.into_iter().map(|b| b as i8).collect()),
            ElementType::Bit => ChunkVectors::Bit(bytes),
        }
    }

    fn distance(
        &self,
        column: &VectorColumn,
        query: &Vector,
        slot: usize,
    ) -> Result<f32> {
        let dims = column.dimensions;
        let distance = match (column.distance_metric, query, self) {
            (DistanceMetric::L2, Vector::Float32(q), ChunkVectors::Float32(c)) => {
                l2_distance(q, &c[slot * dims..(slot + 1) * dims])
            }
            (DistanceMetric::Cosine, Vector::Float32(q), ChunkVectors::Float32(c)) => {
                cosine_distance(q, &c[slot * dims..(slot + 1) * dims])
            }
            (DistanceMetric::L2, Vector::Int8(q), ChunkVectors::Int8(c)) => {
                l2_distance_i8(q, &c[slot * dims..(slot + 1) * dims])
            }
            (DistanceMetric::Cosine, Vector::Int8(q), ChunkVectors::Int8(c)) => {
                cosine_distance_i8(q, &c[slot * dims..(slot + 1) * dims])
            }
            (DistanceMetric::Hamming, Vector::Bit(q), ChunkVectors::Bit(c)) => {
                let size = column.vector_size();
                hamming_distance(q, &c[slot * size..(slot + 1) * size])
            }
            (metric, query, _) => {
                return Err(Error::InvalidArgument(format!(
                    "{metric} distance is not defined between a {} query and {} column '{}'",
                    query.element_type(),
                    column.element_type,
                    column.name
                )))
            }
        };
        Ok(distance)
    }
}

/// The `k` rows of `column` closest to `query`, closest first
pub fn search(
    conn: &Connection,
    shadow: &ShadowTables,
    column: usize,
    query: &Vector,
    k: usize,
) -> Result<Vec<Neighbor>> {
    let def = &shadow.config().columns[column];
    if query.element_type() != def.element_type {
        return Err(Error::ElementTypeMismatch {
            expected: def.element_type,
            actual: query.element_type(),
        });
    }
    query.check_dimensions(def.dimensions)?;

    if k == 0 {
        return Ok(Vec::new());
    }

    let mut heap: BinaryHeap<Neighbor> = BinaryHeap::with_capacity(k + 1);
    let mut scanned = 0usize;

    for chunk in shadow.chunks(conn)? {
        let slots: Vec<RowLocation> = (0..chunk.validity.len() * 8)
            .filter(|&slot| chunk.is_valid(slot))
            .filter_map(|slot| {
                chunk.rowid(slot).map(|rowid| RowLocation {
                    rowid,
                    chunk_id: chunk.id,
                    offset: slot,
                })
            })
            .collect();
        if slots.is_empty() {
            continue;
        }

        let vectors = ChunkVectors::decode(
            shadow.chunk_vectors(conn, column, chunk.id)?,
            def.element_type,
        );
        let scored = slots
            .par_iter()
            .map(|location| {
                Ok(Neighbor {
                    location: *location,
                    distance: vectors.distance(def, query, location.offset)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        scanned += scored.len();
        for neighbor in scored {
            push_bounded(&mut heap, neighbor, k);
        }
    }

    debug!(
        table = shadow.table_name(),
        column = %def.name,
        k,
        scanned,
        "vec0 knn scan"
    );
    Ok(heap.into_sorted_vec())
}

/// Keep only the `k` smallest neighbors in a max-heap
fn push_bounded(heap: &mut BinaryHeap<Neighbor>, neighbor: Neighbor, k: usize) {
    if heap.len() < k {
        heap.push(neighbor);
    } else if heap.peek().is_some_and(|worst| neighbor < *worst) {
        heap.pop();
        heap.push(neighbor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec0::config::Vec0Config;

    fn table(args: &[&str], rows: &[Vector]) -> (Connection, ShadowTables) {
        let conn = Connection::open_in_memory().unwrap();
        let config = Vec0Config::parse(args).unwrap();
        let shadow = ShadowTables::new("main", "items", config);
        shadow.create(&conn).unwrap();
        for row in rows {
            shadow.insert(&conn, None, &[row.clone()]).unwrap();
        }
        (conn, shadow)
    }

    fn rowids(neighbors: &[Neighbor]) -> Vec<i64> {
        neighbors.iter().map(|n| n.location.rowid).collect()
    }

    #[test]
    fn test_knn_l2() {
        let rows: Vec<Vector> = (0..5)
            .map(|i| Vector::Float32(vec![i as f32, 0.0]))
            .collect();
        let (conn, shadow) = table(&["embedding float[2]", "chunk_size=8"], &rows);

        let query = Vector::Float32(vec![2.9, 0.0]);
        let result = search(&conn, &shadow, 0, &query, 3).unwrap();
        assert_eq!(rowids(&result), vec![4, 3, 5]);
        assert!((result[0].distance - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_knn_spans_chunks() {
        let rows: Vec<Vector> = (0..30)
            .map(|i| Vector::Float32(vec![i as f32]))
            .collect();
        let (conn, shadow) = table(&["embedding float[1]", "chunk_size=8"], &rows);

        let result = search(&conn, &shadow, 0, &Vector::Float32(vec![100.0]), 2).unwrap();
        assert_eq!(rowids(&result), vec![30, 29]);
    }

    #[test]
    fn test_knn_skips_deleted() {
        let rows: Vec<Vector> = (0..4)
            .map(|i| Vector::Float32(vec![i as f32]))
            .collect();
        let (conn, shadow) = table(&["embedding float[1]"], &rows);
        shadow.delete(&conn, 1).unwrap();

        let result = search(&conn, &shadow, 0, &Vector::Float32(vec![0.0]), 10).unwrap();
        assert_eq!(rowids(&result), vec![2, 3, 4]);
    }

    #[test]
    fn test_knn_ties_by_rowid() {
        let rows = vec![
            Vector::Float32(vec![1.0]),
            Vector::Float32(vec![-1.0]),
            Vector::Float32(vec![1.0]),
        ];
        let (conn, shadow) = table(&["embedding float[1]"], &rows);

        let result = search(&conn, &shadow, 0, &Vector::Float32(vec![0.0]), 3).unwrap();
        assert_eq!(rowids(&result), vec![1, 2, 3]);
    }

    #[test]
    fn test_knn_cosine() {
        let rows = vec![
            Vector::Float32(vec![10.0, 0.0]),
            Vector::Float32(vec![1.0, 1.0]),
            Vector::Float32(vec![0.0, 5.0]),
        ];
        let (conn, shadow) = table(&["embedding float[2] distance_metric=cosine"], &rows);

        let result = search(&conn, &shadow, 0, &Vector::Float32(vec![0.0, 1.0]), 3).unwrap();
        assert_eq!(rowids(&result), vec![3, 2, 1]);
    }

    #[test]
    fn test_knn_hamming() {
        let rows = vec![
            Vector::Bit(vec![0b1111_1111]),
            Vector::Bit(vec![0b0000_0001]),
            Vector::Bit(vec![0b0000_1111]),
        ];
        let (conn, shadow) = table(&["embedding bit[8]"], &rows);

        let result = search(&conn, &shadow, 0, &Vector::Bit(vec![0]), 2).unwrap();
        assert_eq!(rowids(&result), vec![2, 3]);
        assert_eq!(result[0].distance, 1.0);
    }

    #[test]
    fn test_knn_int8() {
        let rows = vec![Vector::Int8(vec![100, 100]), Vector::Int8(vec![1, 2])];
        let (conn, shadow) = table(&["embedding int8[2]"], &rows);

        let result = search(&conn, &shadow, 0, &Vector::Int8(vec![0, 0]), 1).unwrap();
        assert_eq!(rowids(&result), vec![2]);
    }

    #[test]
    fn test_knn_zero_k_and_mismatch() {
        let rows = vec![Vector::Float32(vec![1.0, 2.0])];
        let (conn, shadow) = table(&["embedding float[2]"], &rows);

        let query = Vector::Float32(vec![1.0, 2.0]);
        assert!(search(&conn, &shadow, 0, &query, 0).unwrap().is_empty());

        let short = Vector::Float32(vec![1.0]);
        assert!(search(&conn, &shadow, 0, &short, 1).is_err());
        let wrong_type = Vector::Int8(vec![1, 2]);
        assert!(search(&conn, &shadow, 0, &wrong_type, 1).is_err());
    }

    #[test]
    fn test_push_bounded() {
        let mut heap = BinaryHeap::new();
        for (rowid, distance) in [(1, 5.0), (2, 1.0), (3, 3.0), (4, 0.5)] {
            let neighbor = Neighbor {
                location: RowLocation {
                    rowid,
                    chunk_id: 1,
                    offset: 0,
                },
                distance,
            };
            push_bounded(&mut heap, neighbor, 2);
        }
        assert_eq!(rowids(&heap.into_sorted_vec()), vec![4, 2]);
    }
}
