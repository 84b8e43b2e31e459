//! Loading a built index store: vectors plus row-aligned metadata.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::{
    config::StoreLayout,
    dataset::CatalogRecord,
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    index::{Neighbor, NeighborSearch},
    metadata_db::{MetadataDb, StoreInfo},
    vector_file,
};

pub const VECTOR_FILE_NAME: &str = "vectors.bin";
pub const VECTOR_DB_NAME: &str = "embeddings.redb";
pub const METADATA_DB_NAME: &str = "meta.redb";

/// File names of the two artifacts that make up a store.
pub fn artifact_paths(dir: &Path, layout: StoreLayout) -> (PathBuf, PathBuf) {
    let vectors = match layout {
        StoreLayout::Flat => dir.join(VECTOR_FILE_NAME),
        StoreLayout::Redb => dir.join(VECTOR_DB_NAME),
    };
    (vectors, dir.join(METADATA_DB_NAME))
}

/// Detect which layout a store directory holds, preferring `preferred`
/// when both vector artifacts are present.
pub fn detect_layout(
    dir: &Path,
    preferred: StoreLayout,
) -> Option<StoreLayout> {
    let has = |layout| artifact_paths(dir, layout).0.is_file();
    if has(preferred) {
        return Some(preferred);
    }
    [StoreLayout::Flat, StoreLayout::Redb]
        .into_iter()
        .find(|&layout| has(layout))
}

/// A loaded, read-only index store.
///
/// Shared freely between threads; every query only reads.
pub struct IndexStore {
    dir: PathBuf,
    layout: StoreLayout,
    vectors: Box<dyn NeighborSearch>,
    records: Vec<CatalogRecord>,
    info: Option<StoreInfo>,
}

impl IndexStore {
    /// Open the store in `dir`.
    ///
    /// Refuses to load when either artifact is missing, when the metadata
    /// has no row-id keyed table, when the two artifacts carry different
    /// build ids, or when the vector count differs from the number of
    /// metadata rows.
    pub fn open(dir: &Path, layout: StoreLayout) -> Result<Self> {
        let (vector_path, meta_path) = artifact_paths(dir, layout);
        for path in [&vector_path, &meta_path] {
            if !path.is_file() {
                return Err(Error::MissingArtifact(path.clone()));
            }
        }

        let meta = MetadataDb::open(&meta_path)?;
        let records = meta.load_records()?;
        let info = meta.read_store_info()?;

        let (vectors, vector_build) = match layout {
            StoreLayout::Flat => {
                let (header, index) = vector_file::read_index(&vector_path)?;
                (Box::new(index) as Box<dyn NeighborSearch>, header.build())
            }
            StoreLayout::Redb => {
                let db = EmbeddingDb::open(&vector_path)?;
                let build = db.build_id();
                (Box::new(db) as Box<dyn NeighborSearch>, build)
            }
        };

        check_same_build(vector_build, info.as_ref())?;

        if vectors.len() != records.len() as u64 {
            return Err(Error::CountMismatch {
                vectors: vectors.len(),
                rows: records.len() as u64,
            });
        }

        info!(
            dir = %dir.display(),
            layout = %layout,
            rows = records.len(),
            dimension = vectors.dimension(),
            "loaded index store"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            layout,
            vectors,
            records,
            info,
        })
    }

    /// Open whichever layout `dir` holds, trying `preferred` first.
    pub fn open_detected(dir: &Path, preferred: StoreLayout) -> Result<Self> {
        match detect_layout(dir, preferred) {
            Some(layout) => Self::open(dir, layout),
            None => {
                Err(Error::MissingArtifact(artifact_paths(dir, preferred).0))
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> StoreLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    /// Build facts recorded in the metadata, if the store has them.
    pub fn info(&self) -> Option<&StoreInfo> {
        self.info.as_ref()
    }

    pub fn record(&self, row_id: u64) -> Option<&CatalogRecord> {
        self.records.get(usize::try_from(row_id).ok()?)
    }

    /// Exact nearest neighbours of `query`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if self.records.is_empty() {
            return Ok(Vec::new());
        }
        self.vectors.search(query, k)
    }
}

/// Both artifacts of a published store carry the id of the build that
/// wrote them; a pair from two different builds must not be joined.
pub fn check_same_build(
    vector_build: Option<u64>,
    info: Option<&StoreInfo>,
) -> Result<()> {
    let metadata_build = info.and_then(|i| i.build_id);
    if vector_build != metadata_build {
        return Err(Error::BuildMismatch {
            vectors: vector_build,
            metadata: metadata_build,
        });
    }
    Ok(())
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("dir", &self.dir)
            .field("layout", &self.layout)
            .field("rows", &self.records.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_file::VectorFileWriter;

    fn record(row_id: u64) -> CatalogRecord {
        CatalogRecord {
            row_id,
            title: format!("book {row_id}"),
            author: None,
            description: None,
            isbn: None,
            publisher: None,
        }
    }

    fn write_flat(dir: &Path, vectors: &[Vec<f32>], rows: u64) {
        let (vpath, mpath) = artifact_paths(dir, StoreLayout::Flat);
        let mut w = VectorFileWriter::create(&vpath, 2, 0).unwrap();
        w.append(vectors).unwrap();
        w.finish().unwrap();
        let meta = MetadataDb::create(&mpath).unwrap();
        let records: Vec<_> = (0..rows).map(record).collect();
        meta.batch_put_records(&records).unwrap();
    }

    #[test]
    fn opens_consistent_flat_store() {
        let tmp = tempfile::tempdir().unwrap();
        write_flat(tmp.path(), &[vec![1.0, 0.0], vec![0.0, 1.0]], 2);

        let store = IndexStore::open(tmp.path(), StoreLayout::Flat).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.dimension(), 2);
        assert_eq!(store.record(1).unwrap().title, "book 1");
        assert!(store.record(2).is_none());

        let hits = store.search(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].row_id, 1);
    }

    #[test]
    fn count_mismatch_refuses_to_load() {
        let tmp = tempfile::tempdir().unwrap();
        write_flat(tmp.path(), &[vec![1.0, 0.0], vec![0.0, 1.0]], 3);

        let err = IndexStore::open(tmp.path(), StoreLayout::Flat).unwrap_err();
        assert!(matches!(err, Error::CountMismatch { vectors: 2, rows: 3 }));
    }

    #[test]
    fn missing_metadata_refuses_to_load() {
        let tmp = tempfile::tempdir().unwrap();
        write_flat(tmp.path(), &[vec![1.0, 0.0]], 1);
        std::fs::remove_file(tmp.path().join(METADATA_DB_NAME)).unwrap();

        let err = IndexStore::open(tmp.path(), StoreLayout::Flat).unwrap_err();
        assert!(matches!(err, Error::MissingArtifact(_)));
    }

    #[test]
    fn missing_vectors_refuses_to_load() {
        let tmp = tempfile::tempdir().unwrap();
        let err = IndexStore::open(tmp.path(), StoreLayout::Redb).unwrap_err();
        assert!(matches!(err, Error::MissingArtifact(_)));
    }

    #[test]
    fn opens_redb_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let (vpath, mpath) = artifact_paths(tmp.path(), StoreLayout::Redb);
        {
            let mut db = EmbeddingDb::create(&vpath).unwrap();
            db.batch_store(0, &[vec![1.0, 0.0]]).unwrap();
            let meta = MetadataDb::create(&mpath).unwrap();
            meta.batch_put_records(&[record(0)]).unwrap();
        }

        let store = IndexStore::open(tmp.path(), StoreLayout::Redb).unwrap();
        assert_eq!(store.layout(), StoreLayout::Redb);
        assert_eq!(store.search(&[1.0, 0.0], 5).unwrap().len(), 1);
    }

    #[test]
    fn redb_row_ids_must_match_positions() {
        let tmp = tempfile::tempdir().unwrap();
        let (vpath, mpath) = artifact_paths(tmp.path(), StoreLayout::Redb);
        {
            let mut db = EmbeddingDb::create(&vpath).unwrap();
            db.batch_store(0, &[vec![0.0, 1.0], vec![0.6, 0.8]]).unwrap();
            db.batch_store(7, &[vec![1.0, 0.0]]).unwrap();
            let meta = MetadataDb::create(&mpath).unwrap();
            meta.batch_put_records(&[record(0), record(1), record(2)])
                .unwrap();
        }

        let err = IndexStore::open(tmp.path(), StoreLayout::Redb).unwrap_err();
        assert!(matches!(err, Error::CorruptArtifact { .. }));
    }

    #[test]
    fn artifacts_from_different_builds_refuse_to_load() {
        let tmp = tempfile::tempdir().unwrap();
        let (vpath, mpath) = artifact_paths(tmp.path(), StoreLayout::Flat);
        let mut w = VectorFileWriter::create(&vpath, 2, 11).unwrap();
        w.append(&[vec![1.0, 0.0]]).unwrap();
        w.finish().unwrap();
        let meta = MetadataDb::create(&mpath).unwrap();
        meta.batch_put_records(&[record(0)]).unwrap();
        meta.write_store_info(&StoreInfo {
            model_id: "hashing".into(),
            dimension: 2,
            layout: StoreLayout::Flat,
            max_chars: 100,
            count: 1,
            source: "books.csv".into(),
            build_id: Some(12),
        })
        .unwrap();
        drop(meta);

        let err = IndexStore::open(tmp.path(), StoreLayout::Flat).unwrap_err();
        assert!(matches!(
            err,
            Error::BuildMismatch {
                vectors: Some(11),
                metadata: Some(12)
            }
        ));
    }

    #[test]
    fn detect_falls_back_to_other_layout() {
        let tmp = tempfile::tempdir().unwrap();
        write_flat(tmp.path(), &[vec![1.0, 0.0]], 1);
        assert_eq!(
            detect_layout(tmp.path(), StoreLayout::Redb),
            Some(StoreLayout::Flat)
        );
        let store =
            IndexStore::open_detected(tmp.path(), StoreLayout::Redb).unwrap();
        assert_eq!(store.layout(), StoreLayout::Flat);
    }
}
