use std::path::{Path, PathBuf};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    error::{Error, Result},
    index::{
        Neighbor, NeighborSearch, TopK, check_dimension, squared_l2,
    },
};

const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const KEY_BUILD_ID: &str = "build_id";

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

/// Stores one embedding vector per catalog row, keyed by row id.
///
/// Binary format per entry:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
///
/// Searching scans the table from disk, so resident memory stays flat no
/// matter how large the catalog is.
pub struct EmbeddingDb {
    path: PathBuf,
    db: Database,
    dimension: usize,
    len: u64,
    build_id: Option<u64>,
}

impl EmbeddingDb {
    /// Open or create an embeddings database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use booksearch::EmbeddingDb;
    /// use booksearch::index::NeighborSearch;
    ///
    /// let path = tmp.path().join("embeddings.redb");
    /// let db = EmbeddingDb::create(&path).unwrap();
    /// assert!(db.is_empty());
    /// ```
    pub fn create(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(VECTORS)?;
        txn.commit()?;

        Self::from_database(path, db)
    }

    /// Open an existing database without creating anything.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::MissingArtifact(path.to_path_buf()));
        }
        let db = Database::open(path)?;
        Self::from_database(path, db)
    }

    /// Scan the table once to learn its dimension and verify that every
    /// entry agrees with it and that row ids run `0..N` without gaps.
    fn from_database(path: &Path, db: Database) -> Result<Self> {
        let mut dimension = 0usize;
        let mut len = 0u64;
        let build_id;
        {
            let txn = db.begin_read()?;
            let table = match txn.open_table(VECTORS) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => {
                    return Err(Error::CorruptArtifact {
                        path: path.to_path_buf(),
                        reason: "no vectors table".into(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            for entry in table.iter()? {
                let (k, v) = entry?;
                if k.value() != len {
                    return Err(Error::CorruptArtifact {
                        path: path.to_path_buf(),
                        reason: format!(
                            "row ids are not contiguous: expected {len}, \
                             found {}",
                            k.value()
                        ),
                    });
                }
                let dim = decode_dimension(v.value()).ok_or_else(|| {
                    Error::CorruptArtifact {
                        path: path.to_path_buf(),
                        reason: format!(
                            "malformed vector for row {}",
                            k.value()
                        ),
                    }
                })?;
                if dimension == 0 {
                    dimension = dim;
                } else if dim != dimension {
                    return Err(Error::DimensionMismatch {
                        expected: dimension,
                        actual: dim,
                    });
                }
                len += 1;
            }
            build_id = match txn.open_table(META) {
                Ok(meta) => meta.get(KEY_BUILD_ID)?.map(|v| v.value()),
                Err(redb::TableError::TableDoesNotExist(_)) => None,
                Err(e) => return Err(e.into()),
            };
        }
        Ok(Self {
            path: path.to_path_buf(),
            db,
            dimension,
            len,
            build_id,
        })
    }

    /// Build this database belongs to, if it was stamped.
    pub fn build_id(&self) -> Option<u64> {
        self.build_id
    }

    /// Stamp the database with the id of the build writing it.
    pub fn set_build_id(&mut self, build_id: u64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            meta.insert(KEY_BUILD_ID, build_id)?;
        }
        txn.commit()?;
        self.build_id = Some(build_id);
        Ok(())
    }

    /// Store vectors for rows `first_row..first_row + vectors.len()` in a
    /// single transaction.
    ///
    /// Uses `insert_reserve` for zero-copy writes.
    pub fn batch_store(
        &mut self,
        first_row: u64,
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        if vectors.is_empty() {
            return Ok(());
        }
        let dimension = if self.dimension == 0 {
            vectors[0].len()
        } else {
            self.dimension
        };
        for v in vectors {
            check_dimension(dimension, v)?;
        }
        let dim_header = u32::try_from(dimension).map_err(|_| {
            Error::Config(format!(
                "dimension {dimension} does not fit the entry header"
            ))
        })?;

        let txn = self.db.begin_write()?;
        let mut inserted = 0u64;
        {
            let mut table = txn.open_table(VECTORS)?;
            for (offset, data) in vectors.iter().enumerate() {
                let byte_len =
                    HEADER_SIZE + std::mem::size_of_val(data.as_slice());
                let previous = table.get(first_row + offset as u64)?.is_some();
                let mut guard =
                    table.insert_reserve(first_row + offset as u64, byte_len)?;
                let dest = guard.as_mut();
                dest[0..4].copy_from_slice(&dim_header.to_le_bytes());
                dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(data));
                if !previous {
                    inserted += 1;
                }
            }
        }
        txn.commit()?;

        self.dimension = dimension;
        self.len += inserted;
        Ok(())
    }

    /// Remove every row at or after `row`. Used when resuming a build from
    /// a checkpoint.
    pub fn truncate_from(&mut self, row: u64) -> Result<()> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(VECTORS)?;
            let stale: Vec<u64> = table
                .range(row..)?
                .map(|entry| entry.map(|(k, _)| k.value()))
                .collect::<std::result::Result<_, _>>()?;
            for id in &stale {
                table.remove(*id)?;
            }
            stale.len() as u64
        };
        txn.commit()?;
        self.len -= removed;
        Ok(())
    }
}

impl NeighborSearch for EmbeddingDb {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        check_dimension(self.dimension, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;

        let mut top = TopK::new(k);
        // Entry bytes carry no alignment guarantee, so each row is copied
        // into an aligned scratch buffer before the distance computation.
        let mut scratch = vec![0.0f32; self.dimension];
        for entry in table.iter()? {
            let (key, value) = entry?;
            let bytes = value.value();
            if bytes.len() != HEADER_SIZE + self.dimension * 4 {
                return Err(Error::CorruptArtifact {
                    path: self.path.clone(),
                    reason: format!("malformed vector for row {}", key.value()),
                });
            }
            bytemuck::cast_slice_mut::<f32, u8>(&mut scratch)
                .copy_from_slice(&bytes[HEADER_SIZE..]);
            top.push(Neighbor {
                row_id: key.value(),
                distance: squared_l2(query, &scratch),
            });
        }
        Ok(top.into_sorted())
    }
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb")
            .field("path", &self.path)
            .field("dimension", &self.dimension)
            .field("len", &self.len)
            .field("build_id", &self.build_id)
            .finish_non_exhaustive()
    }
}

fn decode_dimension(bytes: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_SIZE] = bytes.get(0..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    (dimension > 0 && bytes.len() == HEADER_SIZE + dimension * 4)
        .then_some(dimension)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, EmbeddingDb) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");
        let db = EmbeddingDb::create(&path).unwrap();
        (tmp, db)
    }

    fn ids(db: &EmbeddingDb) -> Vec<u64> {
        let txn = db.db.begin_read().unwrap();
        let table = txn.open_table(VECTORS).unwrap();
        table.iter().unwrap().map(|e| e.unwrap().0.value()).collect()
    }

    #[test]
    fn store_and_search() {
        let (_tmp, mut db) = test_db();

        db.batch_store(0, &[vec![0.6, 0.8, 0.0], vec![0.0, 0.0, 1.0]])
            .unwrap();

        assert_eq!(db.dimension(), 3);
        assert_eq!(db.len(), 2);
        let hit = db.search(&[0.0, 0.0, 1.0], 1).unwrap()[0];
        assert_eq!(hit.row_id, 1);
        assert!(hit.distance < 1e-6);
    }

    #[test]
    fn batches_append_by_row_id() {
        let (_tmp, mut db) = test_db();
        db.batch_store(0, &[vec![1.0, 0.0]]).unwrap();
        db.batch_store(1, &[vec![0.0, 1.0], vec![0.5, 0.5]]).unwrap();
        assert_eq!(ids(&db), vec![0, 1, 2]);
    }

    #[test]
    fn rejects_mixed_dimensions() {
        let (_tmp, mut db) = test_db();
        db.batch_store(0, &[vec![1.0, 0.0]]).unwrap();
        let err = db.batch_store(1, &[vec![1.0, 0.0, 0.0]]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn truncate_from_drops_tail() {
        let (_tmp, mut db) = test_db();
        db.batch_store(0, &[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        db.truncate_from(1).unwrap();
        assert_eq!(ids(&db), vec![0]);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn overwrite_keeps_len() {
        let (_tmp, mut db) = test_db();
        db.batch_store(0, &[vec![1.0, 0.0]]).unwrap();
        db.batch_store(0, &[vec![0.0, 1.0]]).unwrap();
        assert_eq!(db.len(), 1);
        assert!(db.search(&[0.0, 1.0], 1).unwrap()[0].distance < 1e-6);
    }

    #[test]
    fn search_orders_by_distance_then_row() {
        let (_tmp, mut db) = test_db();
        db.batch_store(
            0,
            &[vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 0.0], vec![0.6, 0.8]],
        )
        .unwrap();

        let hits = db.search(&[1.0, 0.0], 3).unwrap();
        let ids: Vec<u64> = hits.iter().map(|n| n.row_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn search_checks_query_dimension() {
        let (_tmp, mut db) = test_db();
        db.batch_store(0, &[vec![1.0, 0.0]]).unwrap();
        assert!(matches!(
            db.search(&[1.0], 1).unwrap_err(),
            Error::DimensionMismatch { .. }
        ));
    }

    #[test]
    fn reopen_preserves_data_and_build_id() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");

        {
            let mut db = EmbeddingDb::create(&path).unwrap();
            assert_eq!(db.build_id(), None);
            db.batch_store(0, &[vec![1.0, 0.0]]).unwrap();
            db.set_build_id(17).unwrap();
        }

        let db = EmbeddingDb::open(&path).unwrap();
        assert_eq!(db.dimension(), 2);
        assert_eq!(db.len(), 1);
        assert_eq!(db.build_id(), Some(17));
    }

    #[test]
    fn gap_in_row_ids_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");
        {
            let mut db = EmbeddingDb::create(&path).unwrap();
            db.batch_store(0, &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
            db.batch_store(7, &[vec![0.6, 0.8]]).unwrap();
        }

        assert!(matches!(
            EmbeddingDb::open(&path).unwrap_err(),
            Error::CorruptArtifact { .. }
        ));
    }

    #[test]
    fn open_missing_file_is_missing_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let err = EmbeddingDb::open(&tmp.path().join("nope.redb")).unwrap_err();
        assert!(matches!(err, Error::MissingArtifact(_)));
    }
}
