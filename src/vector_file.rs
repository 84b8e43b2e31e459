//! Flat vector file: a fixed header followed by row-major f32 rows.
//!
//! Layout (all little-endian):
//! - 4 bytes: magic `BKVF`
//! - 4 bytes: dimension D (u32)
//! - 8 bytes: row count N (u64)
//! - 8 bytes: build id (u64), shared with the metadata of the same build
//! - N * D * 4 bytes: f32 values, row `i` at offset `24 + i * D * 4`

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    index::FlatIndex,
};

const MAGIC: &[u8; 4] = b"BKVF";
pub const HEADER_SIZE: u64 = 24;

/// Decoded fixed header of a vector file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorFileHeader {
    pub dimension: usize,
    pub count: u64,
    pub build_id: u64,
}

impl VectorFileHeader {
    /// Exact file size implied by the header, or `None` when it overflows.
    pub fn file_len(&self) -> Option<u64> {
        row_bytes(self.dimension)
            .checked_mul(self.count)?
            .checked_add(HEADER_SIZE)
    }

    /// The stamped build id; zero marks an unstamped file.
    pub fn build(&self) -> Option<u64> {
        (self.build_id != 0).then_some(self.build_id)
    }
}

/// Appends vectors to a flat file, keeping the header count current at
/// every [`flush`](Self::flush).
pub struct VectorFileWriter {
    path: PathBuf,
    file: BufWriter<File>,
    header: VectorFileHeader,
}

impl VectorFileWriter {
    /// Create (or overwrite) a vector file for `dimension`-wide rows,
    /// stamped with `build_id`.
    pub fn create(
        path: &Path,
        dimension: usize,
        build_id: u64,
    ) -> Result<Self> {
        let header = VectorFileHeader {
            dimension,
            count: 0,
            build_id,
        };
        let mut file = File::create(path)?;
        write_header(&mut file, &header)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            header,
        })
    }

    /// Reopen a partially written file of build `build_id`, discarding
    /// everything after the first `rows` rows.
    pub fn resume(
        path: &Path,
        dimension: usize,
        build_id: u64,
        rows: u64,
    ) -> Result<Self> {
        let stored = read_header(path)?;
        if stored.dimension != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                actual: stored.dimension,
            });
        }
        if stored.build_id != build_id {
            return Err(Error::BuildMismatch {
                vectors: Some(stored.build_id),
                metadata: Some(build_id),
            });
        }

        let header = VectorFileHeader {
            count: rows,
            ..stored
        };
        let keep = header
            .file_len()
            .ok_or_else(|| corrupt(path, format!("{rows} rows overflow")))?;
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < keep {
            return Err(corrupt(
                path,
                format!("file is shorter than the {rows} checkpointed rows"),
            ));
        }
        file.set_len(keep)?;
        write_header(&mut file, &header)?;
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            header,
        })
    }

    /// Append rows. Every vector must have the file's dimension.
    pub fn append(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        for v in vectors {
            if v.len() != self.header.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.header.dimension,
                    actual: v.len(),
                });
            }
        }
        for v in vectors {
            self.file.write_all(bytemuck::cast_slice(v))?;
        }
        self.header.count += vectors.len() as u64;
        Ok(())
    }

    /// Push buffered rows to disk and record the current count.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(8))?;
        file.write_all(&self.header.count.to_le_bytes())?;
        file.seek(SeekFrom::End(0))?;
        file.sync_data()?;
        Ok(())
    }

    /// Flush and close, returning the final row count.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.header.count)
    }
}

impl std::fmt::Debug for VectorFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorFileWriter")
            .field("path", &self.path)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Read the fixed header of a vector file.
pub fn read_header(path: &Path) -> Result<VectorFileHeader> {
    let mut file = File::open(path)?;
    read_header_from(path, &mut file)
}

/// Read the header and check that the file holds exactly the rows it
/// declares, without loading them.
pub fn check_file(path: &Path) -> Result<VectorFileHeader> {
    let mut file = File::open(path)?;
    let header = read_header_from(path, &mut file)?;
    check_len(path, &header, file.metadata()?.len())?;
    Ok(header)
}

/// Load the whole file into a [`FlatIndex`].
pub fn read_index(path: &Path) -> Result<(VectorFileHeader, FlatIndex)> {
    let mut file = File::open(path)?;
    let header = read_header_from(path, &mut file)?;
    check_len(path, &header, file.metadata()?.len())?;

    let values = usize::try_from(header.count)
        .ok()
        .and_then(|rows| rows.checked_mul(header.dimension))
        .ok_or_else(|| {
            corrupt(path, "row count does not fit in memory".into())
        })?;
    let mut data = vec![0.0f32; values];
    file.read_exact(bytemuck::cast_slice_mut(&mut data))?;
    Ok((header, FlatIndex::new(header.dimension, data)?))
}

fn check_len(
    path: &Path,
    header: &VectorFileHeader,
    actual: u64,
) -> Result<()> {
    let count = header.count;
    match header.file_len() {
        Some(expected) if expected == actual => Ok(()),
        Some(expected) => Err(corrupt(
            path,
            format!(
                "expected {expected} bytes for {count} rows, found {actual}"
            ),
        )),
        None => {
            Err(corrupt(path, format!("{count} rows overflow the file size")))
        }
    }
}

fn read_header_from(path: &Path, file: &mut File) -> Result<VectorFileHeader> {
    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)
        .map_err(|_| corrupt(path, "truncated header".into()))?;
    if &header[0..4] != MAGIC {
        return Err(corrupt(path, "bad magic".into()));
    }
    let mut dim = [0u8; 4];
    dim.copy_from_slice(&header[4..8]);
    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let mut build_id = [0u8; 8];
    build_id.copy_from_slice(&header[16..24]);

    let dimension = u32::from_le_bytes(dim) as usize;
    if dimension == 0 {
        return Err(corrupt(path, "zero dimension".into()));
    }
    Ok(VectorFileHeader {
        dimension,
        count: u64::from_le_bytes(count),
        build_id: u64::from_le_bytes(build_id),
    })
}

fn write_header(file: &mut File, header: &VectorFileHeader) -> Result<()> {
    let dimension = header.dimension;
    let dim = u32::try_from(dimension).map_err(|_| {
        Error::Config(format!(
            "dimension {dimension} does not fit the file header"
        ))
    })?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(MAGIC)?;
    file.write_all(&dim.to_le_bytes())?;
    file.write_all(&header.count.to_le_bytes())?;
    file.write_all(&header.build_id.to_le_bytes())?;
    Ok(())
}

fn row_bytes(dimension: usize) -> u64 {
    dimension as u64 * std::mem::size_of::<f32>() as u64
}

fn corrupt(path: &Path, reason: String) -> Error {
    Error::CorruptArtifact {
        path: path.to_path_buf(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::NeighborSearch;

    #[test]
    fn write_and_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");

        let mut w = VectorFileWriter::create(&path, 2, 42).unwrap();
        w.append(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        w.append(&[vec![0.6, 0.8]]).unwrap();
        assert_eq!(w.finish().unwrap(), 3);

        let header = read_header(&path).unwrap();
        assert_eq!(
            header,
            VectorFileHeader {
                dimension: 2,
                count: 3,
                build_id: 42
            }
        );
        assert_eq!(check_file(&path).unwrap(), header);
        let (_, idx) = read_index(&path).unwrap();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.vector(2), Some(&[0.6, 0.8][..]));
    }

    #[test]
    fn append_rejects_wrong_dimension() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = VectorFileWriter::create(&tmp.path().join("v.bin"), 3, 1)
            .unwrap();
        let err = w.append(&[vec![1.0, 2.0]]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert_eq!(w.finish().unwrap(), 0);
    }

    #[test]
    fn resume_truncates_to_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("v.bin");

        let mut w = VectorFileWriter::create(&path, 2, 7).unwrap();
        w.append(&[vec![1.0, 1.0], vec![2.0, 2.0]]).unwrap();
        w.flush().unwrap();
        // Rows past the checkpoint, as left by an interrupted run.
        w.append(&[vec![9.0, 9.0]]).unwrap();
        w.finish().unwrap();

        let mut w = VectorFileWriter::resume(&path, 2, 7, 2).unwrap();
        w.append(&[vec![3.0, 3.0]]).unwrap();
        assert_eq!(w.finish().unwrap(), 3);

        let (header, idx) = read_index(&path).unwrap();
        assert_eq!(header.build_id, 7);
        assert_eq!(idx.vector(2), Some(&[3.0, 3.0][..]));
    }

    #[test]
    fn resume_with_other_dimension_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("v.bin");
        VectorFileWriter::create(&path, 2, 1).unwrap().finish().unwrap();
        assert!(VectorFileWriter::resume(&path, 4, 1, 0).is_err());
    }

    #[test]
    fn resume_of_another_build_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("v.bin");
        VectorFileWriter::create(&path, 2, 1).unwrap().finish().unwrap();
        assert!(matches!(
            VectorFileWriter::resume(&path, 2, 9, 0).unwrap_err(),
            Error::BuildMismatch { .. }
        ));
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("v.bin");
        let mut w = VectorFileWriter::create(&path, 2, 1).unwrap();
        w.append(&[vec![1.0, 1.0], vec![2.0, 2.0]]).unwrap();
        w.finish().unwrap();

        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(HEADER_SIZE + 8).unwrap();

        assert!(matches!(
            read_index(&path).unwrap_err(),
            Error::CorruptArtifact { .. }
        ));
        assert!(matches!(
            check_file(&path).unwrap_err(),
            Error::CorruptArtifact { .. }
        ));
    }

    #[test]
    fn oversized_row_count_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("v.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_index(&path).unwrap_err(),
            Error::CorruptArtifact { .. }
        ));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("v.bin");
        std::fs::write(&path, [0u8; 32]).unwrap();
        assert!(matches!(
            read_header(&path).unwrap_err(),
            Error::CorruptArtifact { .. }
        ));
    }
}
