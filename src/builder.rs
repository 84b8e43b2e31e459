//! Streaming index construction.
//!
//! Rows are embedded in fixed-size batches and each batch is appended to
//! the vector artifact before the next one is computed, so peak memory is
//! bounded by one batch of vectors regardless of catalog size. Everything
//! is written into a staging directory first and only moved into place
//! once every batch has succeeded.

use std::{
    fs,
    hash::{DefaultHasher, Hash, Hasher},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant, SystemTime},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::{BuildOptions, StoreLayout},
    dataset::{CatalogRecord, Dataset},
    embedding::Embedder,
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    index::NeighborSearch,
    metadata_db::{MetadataDb, StoreInfo},
    normalizer::{Normalizer, Passage},
    store::{artifact_paths, check_same_build},
    vector_file::{self, VectorFileWriter},
};

pub const STAGING_DIR_NAME: &str = ".staging";
const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";
/// Records written per metadata transaction.
const METADATA_CHUNK: usize = 10_000;

/// Progress after one batch has been persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildProgress {
    pub rows_done: u64,
    pub total_rows: u64,
    /// 1-based index of the batch just written.
    pub batch: usize,
    pub batches: usize,
}

/// Outcome of reopening the published store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Passed,
    Failed(String),
}

impl Verification {
    pub fn passed(&self) -> bool {
        matches!(self, Verification::Passed)
    }
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub out_dir: PathBuf,
    pub layout: StoreLayout,
    pub vector_path: PathBuf,
    pub metadata_path: PathBuf,
    pub vector_bytes: u64,
    pub metadata_bytes: u64,
    pub rows: u64,
    pub dimension: usize,
    pub model_id: String,
    /// Rows carried over from an interrupted run.
    pub resumed_from: u64,
    pub elapsed: Duration,
    pub verification: Verification,
}

/// Persisted after every batch so an interrupted build can continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Checkpoint {
    fingerprint: String,
    build_id: u64,
    dimension: usize,
    rows_done: u64,
}

/// Where the vectors of the store being built go.
enum VectorSink {
    Flat(VectorFileWriter),
    Redb(EmbeddingDb),
}

impl VectorSink {
    fn create(
        layout: StoreLayout,
        path: &Path,
        dimension: usize,
        build_id: u64,
    ) -> Result<Self> {
        match layout {
            StoreLayout::Flat => Ok(VectorSink::Flat(VectorFileWriter::create(
                path, dimension, build_id,
            )?)),
            StoreLayout::Redb => {
                if path.exists() {
                    fs::remove_file(path)?;
                }
                let mut db = EmbeddingDb::create(path)?;
                db.set_build_id(build_id)?;
                Ok(VectorSink::Redb(db))
            }
        }
    }

    fn resume(
        layout: StoreLayout,
        path: &Path,
        checkpoint: &Checkpoint,
    ) -> Result<Self> {
        let Checkpoint {
            build_id,
            dimension,
            rows_done,
            ..
        } = *checkpoint;
        match layout {
            StoreLayout::Flat => Ok(VectorSink::Flat(VectorFileWriter::resume(
                path, dimension, build_id, rows_done,
            )?)),
            StoreLayout::Redb => {
                let mut db = EmbeddingDb::open(path)?;
                if db.build_id() != Some(build_id) {
                    return Err(Error::BuildMismatch {
                        vectors: db.build_id(),
                        metadata: Some(build_id),
                    });
                }
                db.truncate_from(rows_done)?;
                Ok(VectorSink::Redb(db))
            }
        }
    }

    fn append(&mut self, first_row: u64, vectors: &[Vec<f32>]) -> Result<()> {
        match self {
            VectorSink::Flat(writer) => {
                writer.append(vectors)?;
                writer.flush()
            }
            VectorSink::Redb(db) => db.batch_store(first_row, vectors),
        }
    }

    fn finish(self) -> Result<()> {
        match self {
            VectorSink::Flat(writer) => writer.finish().map(|_| ()),
            VectorSink::Redb(_) => Ok(()),
        }
    }
}

/// Builds an index store from a dataset with a given embedder.
pub struct IndexBuilder<'a> {
    embedder: &'a dyn Embedder,
    options: BuildOptions,
    progress: Option<Box<dyn FnMut(&BuildProgress) + 'a>>,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(embedder: &'a dyn Embedder, options: BuildOptions) -> Self {
        Self {
            embedder,
            options,
            progress: None,
        }
    }

    /// Called after every persisted batch.
    pub fn on_progress(mut self, f: impl FnMut(&BuildProgress) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Build a store for `dataset` and publish it into `out_dir`.
    ///
    /// Nothing is published unless every batch embeds successfully. A failed
    /// build leaves its staging directory behind; rerunning with
    /// [`BuildOptions::resume`] continues from the last finished batch.
    pub fn build(
        mut self,
        dataset: &Dataset,
        out_dir: &Path,
    ) -> Result<BuildReport> {
        self.options.validate()?;
        if dataset.is_empty() {
            return Err(Error::EmptyDataset(dataset.source().to_path_buf()));
        }
        if !dataset.has_description() {
            warn!(
                source = %dataset.source().display(),
                "no description column found; passages hold titles and authors"
            );
        }

        let started = Instant::now();
        let layout = self.options.layout;
        let records = dataset.records();
        let total_rows = records.len() as u64;
        let batch_size = self.options.batch_size;
        let batches = records.len().div_ceil(batch_size);
        let normalizer = Normalizer::new(self.options.max_chars);
        let fingerprint = fingerprint(
            dataset,
            self.embedder.model_id(),
            layout,
            self.options.max_chars,
        );

        fs::create_dir_all(out_dir)?;
        let staging = out_dir.join(STAGING_DIR_NAME);
        let checkpoint_path = staging.join(CHECKPOINT_FILE_NAME);
        let (staged_vectors, staged_meta) = artifact_paths(&staging, layout);

        let checkpoint = if self.options.resume {
            read_checkpoint(&checkpoint_path, &fingerprint)
        } else {
            None
        };

        let (mut sink, mut dimension, resumed_from, build_id) = match checkpoint
        {
            Some(cp) => {
                info!(
                    rows_done = cp.rows_done,
                    "resuming build from checkpoint"
                );
                let sink = VectorSink::resume(layout, &staged_vectors, &cp)?;
                (Some(sink), Some(cp.dimension), cp.rows_done, cp.build_id)
            }
            None => {
                if staging.exists() {
                    fs::remove_dir_all(&staging)?;
                }
                fs::create_dir_all(&staging)?;
                (None, None, 0, new_build_id(&fingerprint))
            }
        };

        info!(
            rows = total_rows,
            batch_size,
            layout = %layout,
            model = self.embedder.model_id(),
            build_id = %format!("{build_id:016x}"),
            "building index"
        );

        // Batch size may differ from the interrupted run, so batches are
        // counted from the first missing row.
        let start = resumed_from as usize;
        let pending = records.get(start..).unwrap_or_default();
        for (i, chunk) in pending.chunks(batch_size).enumerate() {
            let first_row = (start + i * batch_size) as u64;
            let batch = start / batch_size + i + 1;
            let passages: Vec<Passage> =
                chunk.iter().map(|r| normalizer.passage(r)).collect();

            let vectors = self.embed_with_retry(&passages, batch)?;
            if vectors.len() != chunk.len() {
                return Err(Error::Embedding(format!(
                    "embedder returned {} vectors for {} passages",
                    vectors.len(),
                    chunk.len()
                )));
            }

            let dim = match dimension {
                Some(dim) => dim,
                None => {
                    let dim = vectors[0].len();
                    if dim == 0 {
                        return Err(Error::Embedding(
                            "embedder returned empty vectors".into(),
                        ));
                    }
                    debug!(dimension = dim, "dimension fixed by first batch");
                    dimension = Some(dim);
                    dim
                }
            };
            if sink.is_none() {
                sink = Some(VectorSink::create(
                    layout,
                    &staged_vectors,
                    dim,
                    build_id,
                )?);
            }
            if let Some(sink) = sink.as_mut() {
                sink.append(first_row, &vectors)?;
            }
            drop(vectors);

            let rows_done = first_row + chunk.len() as u64;
            write_checkpoint(
                &checkpoint_path,
                &Checkpoint {
                    fingerprint: fingerprint.clone(),
                    build_id,
                    dimension: dim,
                    rows_done,
                },
            )?;

            let progress = BuildProgress {
                rows_done,
                total_rows,
                batch,
                batches,
            };
            debug!(rows_done, total_rows, batch, "batch written");
            if let Some(f) = self.progress.as_mut() {
                f(&progress);
            }
        }

        let dimension = dimension.ok_or_else(|| {
            Error::Embedding("no batch produced vectors".into())
        })?;
        if let Some(sink) = sink {
            sink.finish()?;
        }

        write_metadata(
            &staged_meta,
            records,
            &StoreInfo {
                model_id: self.embedder.model_id().to_string(),
                dimension,
                layout,
                max_chars: self.options.max_chars,
                count: total_rows,
                source: dataset.source().display().to_string(),
                build_id: Some(build_id),
            },
        )?;

        let (vector_path, metadata_path) = publish(&staging, out_dir, layout)?;
        let verification = verify(out_dir, layout, total_rows, build_id);

        let report = BuildReport {
            out_dir: out_dir.to_path_buf(),
            layout,
            vector_bytes: fs::metadata(&vector_path)?.len(),
            metadata_bytes: fs::metadata(&metadata_path)?.len(),
            vector_path,
            metadata_path,
            rows: total_rows,
            dimension,
            model_id: self.embedder.model_id().to_string(),
            resumed_from,
            elapsed: started.elapsed(),
            verification,
        };
        info!(
            rows = report.rows,
            dimension = report.dimension,
            elapsed_ms = report.elapsed.as_millis() as u64,
            verified = report.verification.passed(),
            "index build complete"
        );
        Ok(report)
    }

    fn embed_with_retry(
        &self,
        passages: &[Passage],
        batch: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0usize;
        loop {
            match self.embedder.embed_passages(passages) {
                Ok(vectors) => return Ok(vectors),
                Err(err) if attempt < self.options.max_retries => {
                    attempt += 1;
                    warn!(
                        batch,
                        attempt,
                        error = %err,
                        "embedding batch failed, retrying"
                    );
                    thread::sleep(self.options.retry_backoff);
                }
                Err(err) => {
                    warn!(
                        batch,
                        error = %err,
                        "embedding batch failed, giving up"
                    );
                    return Err(err);
                }
            }
        }
    }
}

/// Identity of a build's inputs; a checkpoint is only reused when it
/// matches.
fn fingerprint(
    dataset: &Dataset,
    model_id: &str,
    layout: StoreLayout,
    max_chars: usize,
) -> String {
    let mut hasher = DefaultHasher::new();
    dataset.records().hash(&mut hasher);
    format!(
        "{model_id}|{layout}|{max_chars}|{}|{:016x}",
        dataset.len(),
        hasher.finish()
    )
}

/// A fresh id for one build. Distinct across builds of the same inputs,
/// so artifacts of two runs never pass for a pair.
fn new_build_id(fingerprint: &str) -> u64 {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let mut hasher = DefaultHasher::new();
    fingerprint.hash(&mut hasher);
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    SEQUENCE.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    hasher.finish().max(1)
}

fn read_checkpoint(path: &Path, fingerprint: &str) -> Option<Checkpoint> {
    let raw = fs::read(path).ok()?;
    match serde_json::from_slice::<Checkpoint>(&raw) {
        Ok(cp) if cp.fingerprint == fingerprint => Some(cp),
        Ok(_) => {
            warn!("checkpoint belongs to a different build; starting over");
            None
        }
        Err(err) => {
            warn!(error = %err, "unreadable checkpoint; starting over");
            None
        }
    }
}

fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(checkpoint)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_metadata(
    path: &Path,
    records: &[CatalogRecord],
    info: &StoreInfo,
) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    let meta = MetadataDb::create(path)?;
    for chunk in records.chunks(METADATA_CHUNK) {
        meta.batch_put_records(chunk)?;
    }
    meta.write_store_info(info)?;
    Ok(())
}

/// Move the staged artifacts into `out_dir`, replacing any previous store.
///
/// The two renames are not atomic together. Both artifacts carry the same
/// build id, so a store left half-replaced by a crash between them is
/// refused at load instead of pairing new vectors with old rows.
fn publish(
    staging: &Path,
    out_dir: &Path,
    layout: StoreLayout,
) -> Result<(PathBuf, PathBuf)> {
    let (staged_vectors, staged_meta) = artifact_paths(staging, layout);
    let (vector_path, metadata_path) = artifact_paths(out_dir, layout);

    // A store of the other layout would otherwise pair with the new metadata.
    let other = match layout {
        StoreLayout::Flat => StoreLayout::Redb,
        StoreLayout::Redb => StoreLayout::Flat,
    };
    let (stale_vectors, _) = artifact_paths(out_dir, other);
    if stale_vectors.exists() {
        fs::remove_file(&stale_vectors)?;
    }

    fs::rename(&staged_vectors, &vector_path)?;
    fs::rename(&staged_meta, &metadata_path)?;
    fs::remove_dir_all(staging)?;

    info!(
        vectors = %vector_path.display(),
        metadata = %metadata_path.display(),
        "published index store"
    );
    Ok((vector_path, metadata_path))
}

/// Check the published artifacts without loading the vectors: header or
/// table scan for the vectors, record count and build id for the metadata.
fn verify(
    out_dir: &Path,
    layout: StoreLayout,
    expected_rows: u64,
    build_id: u64,
) -> Verification {
    let outcome = inspect(out_dir, layout).and_then(|(vectors, rows, info)| {
        check_same_build(Some(build_id), info.as_ref())?;
        Ok((vectors, rows))
    });
    match outcome {
        Ok((vectors, rows))
            if vectors == expected_rows && rows == expected_rows =>
        {
            Verification::Passed
        }
        Ok((vectors, rows)) => {
            let msg = format!(
                "expected {expected_rows} rows, store holds {vectors} vectors \
                 and {rows} records"
            );
            warn!(%msg, "post-build verification failed");
            Verification::Failed(msg)
        }
        Err(err) => {
            warn!(error = %err, "post-build verification failed");
            Verification::Failed(err.to_string())
        }
    }
}

/// Vector count, metadata record count and store info of a published
/// store, after checking that both artifacts come from one build.
fn inspect(
    out_dir: &Path,
    layout: StoreLayout,
) -> Result<(u64, u64, Option<StoreInfo>)> {
    let (vector_path, metadata_path) = artifact_paths(out_dir, layout);
    let (vectors, vector_build) = match layout {
        StoreLayout::Flat => {
            let header = vector_file::check_file(&vector_path)?;
            (header.count, header.build())
        }
        StoreLayout::Redb => {
            let db = EmbeddingDb::open(&vector_path)?;
            (db.len(), db.build_id())
        }
    };
    let meta = MetadataDb::open(&metadata_path)?;
    let info = meta.read_store_info()?;
    check_same_build(vector_build, info.as_ref())?;
    Ok((vectors, meta.record_count()?, info))
}
