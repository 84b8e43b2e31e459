use std::path::{Path, PathBuf};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    config::StoreLayout,
    dataset::CatalogRecord,
    error::{Error, Result},
};

/// Catalog records as JSON, keyed by row id.
const RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("records");
const INFO: TableDefinition<&str, &str> = TableDefinition::new("info");

const KEY_MODEL_ID: &str = "model_id";
const KEY_DIMENSION: &str = "dimension";
const KEY_LAYOUT: &str = "layout";
const KEY_MAX_CHARS: &str = "max_chars";
const KEY_COUNT: &str = "count";
const KEY_SOURCE: &str = "source";
const KEY_BUILD_ID: &str = "build_id";

/// Descriptive facts about a built store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub model_id: String,
    pub dimension: usize,
    pub layout: StoreLayout,
    pub max_chars: usize,
    pub count: u64,
    pub source: String,
    /// Shared with the vector artifact written by the same build.
    pub build_id: Option<u64>,
}

/// Row metadata half of an index store.
pub struct MetadataDb {
    path: PathBuf,
    db: Database,
}

impl MetadataDb {
    /// Create (or open) a metadata database, making sure both tables exist.
    pub fn create(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(RECORDS)?;
        txn.open_table(INFO)?;
        txn.commit()?;

        Ok(Self {
            path: path.to_path_buf(),
            db,
        })
    }

    /// Open an existing database without creating tables.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::MissingArtifact(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            db: Database::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert records in a single transaction.
    pub fn batch_put_records(&self, records: &[CatalogRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            for record in records {
                let bytes = serde_json::to_vec(record)?;
                table.insert(record.row_id, bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Read every record, verifying that row ids run `0..N` without gaps
    /// and that each entry's embedded id matches its key.
    pub fn load_records(&self) -> Result<Vec<CatalogRecord>> {
        let txn = self.db.begin_read()?;
        let table = self.open_records(&txn)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let key = k.value();
            if key != records.len() as u64 {
                return Err(self.corrupt(format!(
                    "row ids are not contiguous: expected {}, found {key}",
                    records.len()
                )));
            }
            let record: CatalogRecord = serde_json::from_slice(v.value())?;
            if record.row_id != key {
                return Err(self.corrupt(format!(
                    "record under key {key} claims row id {}",
                    record.row_id
                )));
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Number of stored records.
    pub fn record_count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = self.open_records(&txn)?;
        let mut count = 0u64;
        for entry in table.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    // -- Info --

    pub fn get_info(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(INFO) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn write_store_info(&self, info: &StoreInfo) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(INFO)?;
            table.insert(KEY_MODEL_ID, info.model_id.as_str())?;
            table.insert(KEY_DIMENSION, info.dimension.to_string().as_str())?;
            table.insert(KEY_LAYOUT, info.layout.as_str())?;
            table.insert(KEY_MAX_CHARS, info.max_chars.to_string().as_str())?;
            table.insert(KEY_COUNT, info.count.to_string().as_str())?;
            table.insert(KEY_SOURCE, info.source.as_str())?;
            if let Some(build_id) = info.build_id {
                table.insert(KEY_BUILD_ID, build_id.to_string().as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Store facts written by the builder, or `None` for a store that
    /// predates them.
    pub fn read_store_info(&self) -> Result<Option<StoreInfo>> {
        let Some(model_id) = self.get_info(KEY_MODEL_ID)? else {
            return Ok(None);
        };
        let parse = |key: &str, raw: String| -> Result<u64> {
            raw.parse().map_err(|_| {
                self.corrupt(format!("info '{key}' is not a number: '{raw}'"))
            })
        };
        let number = |key: &str| -> Result<u64> {
            parse(key, self.get_info(key)?.unwrap_or_default())
        };
        let layout = match self.get_info(KEY_LAYOUT)? {
            Some(raw) => raw.parse()?,
            None => StoreLayout::default(),
        };
        Ok(Some(StoreInfo {
            model_id,
            dimension: number(KEY_DIMENSION)? as usize,
            layout,
            max_chars: number(KEY_MAX_CHARS)? as usize,
            count: number(KEY_COUNT)?,
            source: self.get_info(KEY_SOURCE)?.unwrap_or_default(),
            build_id: self
                .get_info(KEY_BUILD_ID)?
                .map(|raw| parse(KEY_BUILD_ID, raw))
                .transpose()?,
        }))
    }

    fn open_records(
        &self,
        txn: &redb::ReadTransaction,
    ) -> Result<redb::ReadOnlyTable<u64, &'static [u8]>> {
        match txn.open_table(RECORDS) {
            Ok(table) => Ok(table),
            Err(redb::TableError::TableDoesNotExist(_)) => {
                Err(Error::MissingRowIdKey(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn corrupt(&self, reason: String) -> Error {
        Error::CorruptArtifact {
            path: self.path.clone(),
            reason,
        }
    }
}

impl std::fmt::Debug for MetadataDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
