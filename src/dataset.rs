//! Tabular catalog input: path resolution, column alias resolution and
//! conversion of raw rows into [`CatalogRecord`]s.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const TITLE_ALIASES: &[&str] = &["title", "도서명"];
pub const AUTHOR_ALIASES: &[&str] = &["author", "저자"];
pub const DESCRIPTION_ALIASES: &[&str] =
    &["description", "desc", "summary", "summery", "설명", "요약"];
pub const ISBN_ALIASES: &[&str] =
    &["isbn", "ISBN", "국제표준도서번호(ISBN)"];
pub const PUBLISHER_ALIASES: &[&str] = &["publisher", "출판사"];

/// Extensions tried, in order, when the input path has none or is a directory.
const INPUT_EXTENSIONS: &[&str] = &["csv", "tsv", "jsonl"];

/// One catalog entry as stored in the metadata table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Dense zero-based position, assigned at build time.
    pub row_id: u64,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub isbn: Option<String>,
    pub publisher: Option<String>,
}

/// Column positions for each logical field, resolved once per dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub title: usize,
    pub author: Option<usize>,
    pub description: Option<usize>,
    pub isbn: Option<usize>,
    pub publisher: Option<usize>,
}

impl ColumnMap {
    /// Resolve logical fields against a header row. The first alias present
    /// wins; only the title is mandatory.
    ///
    /// # Examples
    ///
    /// ```
    /// use booksearch::dataset::ColumnMap;
    ///
    /// let headers = ["도서명", "저자", "summary"].map(String::from);
    /// let map = ColumnMap::resolve(&headers).unwrap();
    /// assert_eq!(map.title, 0);
    /// assert_eq!(map.description, Some(2));
    /// assert_eq!(map.isbn, None);
    /// ```
    pub fn resolve(headers: &[String]) -> Result<Self> {
        let pick = |aliases: &[&str]| {
            aliases
                .iter()
                .find_map(|alias| headers.iter().position(|h| h == alias))
        };

        let title = pick(TITLE_ALIASES).ok_or_else(|| Error::MissingColumn {
            field: "title",
            columns: headers.to_vec(),
        })?;

        Ok(Self {
            title,
            author: pick(AUTHOR_ALIASES),
            description: pick(DESCRIPTION_ALIASES),
            isbn: pick(ISBN_ALIASES),
            publisher: pick(PUBLISHER_ALIASES),
        })
    }

    /// Build a record from one row of cell values. Returns `None` when the
    /// row has no usable title.
    pub fn record<'a>(
        &self,
        row_id: u64,
        cell: impl Fn(usize) -> Option<&'a str>,
    ) -> Option<CatalogRecord> {
        let text = |idx: Option<usize>| {
            idx.and_then(&cell)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let title = text(Some(self.title))?;
        Some(CatalogRecord {
            row_id,
            title,
            author: text(self.author),
            description: text(self.description),
            isbn: text(self.isbn),
            publisher: text(self.publisher),
        })
    }
}

/// A fully loaded catalog with dense row ids.
#[derive(Debug, Clone)]
pub struct Dataset {
    source: PathBuf,
    has_description: bool,
    records: Vec<CatalogRecord>,
}

impl Dataset {
    /// Load a catalog from a CSV, TSV or JSON Lines file.
    ///
    /// `path` may omit its extension or point at a directory, in which case
    /// the first matching file is used. Rows without a title are skipped so
    /// that row ids stay contiguous. `max_rows` caps the number of records
    /// kept, for sample builds.
    pub fn load(path: &Path, max_rows: Option<usize>) -> Result<Self> {
        let source = resolve_input_path(path)?;
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let (columns, rows) = match ext.as_str() {
            "jsonl" | "ndjson" => read_json_lines(&source)?,
            "tsv" => read_delimited(&source, b'\t')?,
            _ => read_delimited(&source, b',')?,
        };

        let limit = max_rows.unwrap_or(usize::MAX);
        let mut records = Vec::with_capacity(rows.len().min(limit));
        let mut skipped = 0usize;
        for row in &rows {
            if records.len() >= limit {
                break;
            }
            let row_id = records.len() as u64;
            match columns.record(row_id, |i| row.get(i).map(String::as_str)) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(skipped, "skipped rows without a title");
        }
        info!(
            source = %source.display(),
            rows = records.len(),
            "loaded catalog"
        );

        Ok(Self {
            source,
            has_description: columns.description.is_some(),
            records,
        })
    }

    /// Wrap already-built records, renumbering row ids densely.
    pub fn from_records(
        source: impl Into<PathBuf>,
        records: Vec<CatalogRecord>,
    ) -> Self {
        let has_description = records.iter().any(|r| r.description.is_some());
        let records = records
            .into_iter()
            .enumerate()
            .map(|(i, mut r)| {
                r.row_id = i as u64;
                r
            })
            .collect();
        Self {
            source: source.into(),
            has_description,
            records,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Whether any description column could be resolved.
    pub fn has_description(&self) -> bool {
        self.has_description
    }

    pub fn records(&self) -> &[CatalogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Find the actual input file for `path`.
pub fn resolve_input_path(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    for ext in INPUT_EXTENSIONS {
        let candidate = path.with_extension(ext);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    if path.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        entries.sort();
        for ext in INPUT_EXTENSIONS {
            if let Some(found) = entries
                .iter()
                .find(|p| p.extension().and_then(|e| e.to_str()) == Some(ext))
            {
                return Ok(found.clone());
            }
        }
    }

    Err(Error::Config(format!(
        "no catalog file found at {} (tried .csv, .tsv, .jsonl)",
        path.display()
    )))
}

type Rows = Vec<Vec<String>>;

fn read_delimited(path: &Path, delimiter: u8) -> Result<(ColumnMap, Rows)> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    let columns = ColumnMap::resolve(&headers)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok((columns, rows))
}

fn read_json_lines(path: &Path) -> Result<(ColumnMap, Rows)> {
    let reader = BufReader::new(File::open(path)?);
    let mut objects = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&line)?;
        objects.push(value);
    }

    if objects.is_empty() {
        let columns = ColumnMap {
            title: 0,
            author: None,
            description: None,
            isbn: None,
            publisher: None,
        };
        return Ok((columns, Vec::new()));
    }

    // Header is the union of keys across all objects, in first-seen order,
    // so a sparse leading row does not hide columns present later.
    let mut headers: Vec<String> = Vec::new();
    for obj in &objects {
        for key in obj.keys() {
            if !headers.contains(key) {
                headers.push(key.clone());
            }
        }
    }
    let columns = ColumnMap::resolve(&headers)?;

    let rows = objects
        .iter()
        .map(|obj| {
            headers
                .iter()
                .map(|h| match obj.get(h) {
                    None | Some(serde_json::Value::Null) => String::new(),
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                })
                .collect()
        })
        .collect();
    Ok((columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolve_prefers_first_alias() {
        let map =
            ColumnMap::resolve(&headers(&["summary", "title", "description"]))
                .unwrap();
        assert_eq!(map.title, 1);
        // "description" precedes "summary" in the alias list.
        assert_eq!(map.description, Some(2));
        assert_eq!(map.author, None);
    }

    #[test]
    fn resolve_without_title_fails() {
        let err = ColumnMap::resolve(&headers(&["author", "description"]))
            .unwrap_err();
        assert!(matches!(err, Error::MissingColumn { field: "title", .. }));
    }

    #[test]
    fn record_trims_and_drops_empty_fields() {
        let map =
            ColumnMap::resolve(&headers(&["title", "author", "isbn"])).unwrap();
        let row = ["  Dune ", "", " 9780441013593"];
        let record = map.record(3, |i| row.get(i).copied()).unwrap();
        assert_eq!(record.row_id, 3);
        assert_eq!(record.title, "Dune");
        assert_eq!(record.author, None);
        assert_eq!(record.isbn.as_deref(), Some("9780441013593"));
    }

    #[test]
    fn record_without_title_is_none() {
        let map = ColumnMap::resolve(&headers(&["title"])).unwrap();
        let row = ["   "];
        assert!(map.record(0, |i| row.get(i).copied()).is_none());
    }

    #[test]
    fn load_csv_assigns_dense_row_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("books.csv");
        std::fs::write(
            &path,
            "도서명,저자,설명,extra\n\
             A,Kim,\"first, with comma\",x\n\
             ,Nobody,skipped,x\n\
             C,,third,x\n",
        )
        .unwrap();

        let ds = Dataset::load(&path, None).unwrap();
        assert_eq!(ds.len(), 2);
        assert!(ds.has_description());
        let ids: Vec<u64> = ds.records().iter().map(|r| r.row_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(
            ds.records()[0].description.as_deref(),
            Some("first, with comma")
        );
        assert_eq!(ds.records()[1].title, "C");
    }

    #[test]
    fn load_respects_max_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("books.csv");
        std::fs::write(&path, "title\nA\nB\nC\n").unwrap();

        let ds = Dataset::load(&path, Some(2)).unwrap();
        assert_eq!(ds.len(), 2);
        assert!(!ds.has_description());
    }

    #[test]
    fn load_jsonl_converts_non_string_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("books.jsonl");
        std::fs::write(
            &path,
            "{\"title\":\"A\",\"isbn\":9781234567890,\"author\":null}\n\n\
             {\"title\":\"B\",\"isbn\":\"x\"}\n",
        )
        .unwrap();

        let ds = Dataset::load(&path, None).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.records()[0].isbn.as_deref(), Some("9781234567890"));
        assert_eq!(ds.records()[0].author, None);
    }

    #[test]
    fn load_jsonl_takes_union_of_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("books.jsonl");
        std::fs::write(
            &path,
            "{\"title\":\"A\"}\n\
             {\"title\":\"B\",\"description\":\"dogs\",\"author\":\"Kim\"}\n",
        )
        .unwrap();

        let ds = Dataset::load(&path, None).unwrap();
        assert!(ds.has_description());
        assert_eq!(ds.records()[0].description, None);
        assert_eq!(ds.records()[1].description.as_deref(), Some("dogs"));
        assert_eq!(ds.records()[1].author.as_deref(), Some("Kim"));
    }

    #[test]
    fn load_jsonl_title_may_be_absent_from_first_row() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("books.jsonl");
        std::fs::write(
            &path,
            "{\"author\":\"Nobody\"}\n{\"title\":\"B\"}\n",
        )
        .unwrap();

        let ds = Dataset::load(&path, None).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.records()[0].title, "B");
        assert_eq!(ds.records()[0].row_id, 0);
    }

    #[test]
    fn resolve_input_path_tries_extensions_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("books.tsv"), "title\tauthor\nA\tB\n")
            .unwrap();

        let by_stem = resolve_input_path(&tmp.path().join("books")).unwrap();
        assert_eq!(by_stem, tmp.path().join("books.tsv"));

        let by_dir = resolve_input_path(tmp.path()).unwrap();
        assert_eq!(by_dir, tmp.path().join("books.tsv"));

        let ds = Dataset::load(&by_dir, None).unwrap();
        assert_eq!(ds.records()[0].author.as_deref(), Some("B"));
    }

    #[test]
    fn resolve_input_path_missing_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(resolve_input_path(&tmp.path().join("nothing")).is_err());
    }

    #[test]
    fn from_records_renumbers() {
        let rec = |title: &str| CatalogRecord {
            row_id: 99,
            title: title.into(),
            author: None,
            description: None,
            isbn: None,
            publisher: None,
        };
        let ds = Dataset::from_records("mem", vec![rec("a"), rec("b")]);
        assert_eq!(ds.records()[1].row_id, 1);
        assert!(!ds.has_description());
    }
}
