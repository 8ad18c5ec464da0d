use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use fnv::FnvHashMap;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use polars::prelude::{CsvReader, DataFrame, PolarsError, SerReader};
use tracing::{debug, info};

use crate::error::RecError;
use crate::Flt;

const NUM_COLUMNS: usize = 4;

/// One row of the interaction log.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub user: String,
    pub item: String,
    pub rating: Flt,
    pub timestamp: i64,
}

/// Dense zero-based indices for external identifiers, assigned in order of
/// first appearance.
#[derive(Debug, Clone, Default)]
pub struct IndexMapping {
    index: FnvHashMap<String, usize>,
    ids: Vec<String>,
}

impl IndexMapping {
    pub fn new() -> IndexMapping {
        IndexMapping::default()
    }

    /// Returns the index of `id`, assigning the next free one if unseen.
    pub fn index_or_insert(&mut self, id: &str) -> usize {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        let idx = self.ids.len();
        self.index.insert(id.to_string(), idx);
        self.ids.push(id.to_string());
        idx
    }

    pub fn index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn id(&self, index: usize) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// External identifiers ordered by index.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncodingOptions {
    /// Store 1.0 for every observed pair instead of the rating.
    pub binarize: bool,
    /// Drop rows rated below this before any index is assigned.
    pub min_rating: Option<Flt>,
}

#[derive(Debug)]
pub struct EncodedDataset {
    pub users: IndexMapping,
    pub items: IndexMapping,
    pub interactions: CsrMatrix<Flt>,
}

impl EncodedDataset {
    pub fn shape(&self) -> (usize, usize) {
        (self.interactions.nrows(), self.interactions.ncols())
    }

    pub fn ensure_not_degenerate(&self) -> Result<(), RecError> {
        let (users, items) = self.shape();
        if users == 0 || items == 0 {
            return Err(RecError::Shape { users, items });
        }
        Ok(())
    }
}

/// Expands a leading `~` the way a shell would.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Reads a headerless `user, item, rating, timestamp` file.
pub fn load_interactions(path: &Path, separator: u8) -> Result<Vec<Interaction>, RecError> {
    if !path.is_file() {
        return Err(RecError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("dataset not found: {}", path.display()),
        )));
    }
    let df = match read_frame(path, separator) {
        Ok(df) => df,
        Err(PolarsError::NoData(_)) => {
            info!(path = %path.display(), "dataset is empty");
            return Ok(Vec::new());
        }
        Err(PolarsError::Io(e)) => return Err(RecError::Io(e)),
        Err(e) => {
            return Err(match ragged_line(path, separator)? {
                Some(err) => err,
                None => RecError::MalformedFile(first_line(&e.to_string())),
            })
        }
    };
    let records = parse_frame(&df)?;
    info!(path = %path.display(), rows = records.len(), "loaded interactions");
    Ok(records)
}

// Every column is read as a string so that each row can be validated with
// its own line number.
fn read_frame(path: &Path, separator: u8) -> Result<DataFrame, PolarsError> {
    CsvReader::from_path(path)?
        .with_separator(separator)
        .has_header(false)
        .infer_schema(Some(0))
        .finish()
}

/// Polars rejects a file with an over-long row as a whole; this finds the
/// first line whose field count is off.
fn ragged_line(path: &Path, separator: u8) -> Result<Option<RecError>, RecError> {
    let reader = BufReader::new(File::open(path)?);
    for (idx, line) in reader.split(b'\n').enumerate() {
        let line = line?;
        let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);
        if line.is_empty() {
            continue;
        }
        let found = line.split(|&b| b == separator).count();
        if found != NUM_COLUMNS {
            return Ok(Some(RecError::DataFormat {
                line: idx + 1,
                reason: format!("expected {} columns, found {}", NUM_COLUMNS, found),
            }));
        }
    }
    Ok(None)
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().trim().to_string()
}

fn parse_frame(df: &DataFrame) -> Result<Vec<Interaction>, RecError> {
    if df.width() != NUM_COLUMNS {
        return Err(RecError::DataFormat {
            line: 1,
            reason: format!("expected {} columns, found {}", NUM_COLUMNS, df.width()),
        });
    }
    let malformed = |e: PolarsError| RecError::MalformedFile(first_line(&e.to_string()));
    let columns = df.get_columns();
    let users = columns[0].str().map_err(malformed)?;
    let items = columns[1].str().map_err(malformed)?;
    let ratings = columns[2].str().map_err(malformed)?;
    let timestamps = columns[3].str().map_err(malformed)?;

    users
        .into_iter()
        .zip(items)
        .zip(ratings)
        .zip(timestamps)
        .enumerate()
        .map(|(row, (((user, item), rating), timestamp))| (row + 1, [user, item, rating, timestamp]))
        .filter(|(_, fields)| !is_blank(fields))
        .map(|(line, fields)| parse_row(line, fields))
        .collect()
}

// Blank lines come through as rows of empty fields.
fn is_blank(fields: &[Option<&str>; NUM_COLUMNS]) -> bool {
    fields.iter().all(|f| f.map_or(true, |v| v.trim().is_empty()))
}

fn parse_row(line: usize, fields: [Option<&str>; NUM_COLUMNS]) -> Result<Interaction, RecError> {
    let present = fields.iter().filter(|f| f.is_some()).count();
    let [Some(user), Some(item), Some(rating), Some(timestamp)] = fields else {
        return Err(RecError::DataFormat {
            line,
            reason: format!("expected {} columns, found {}", NUM_COLUMNS, present),
        });
    };
    let rating: Flt = rating.trim().parse().map_err(|_| RecError::DataFormat {
        line,
        reason: format!("rating {:?} is not a number", rating),
    })?;
    if !rating.is_finite() || rating < 0.0 {
        return Err(RecError::DataFormat {
            line,
            reason: format!("rating {} must be a non-negative number", rating),
        });
    }
    let timestamp: i64 = timestamp.trim().parse().map_err(|_| RecError::DataFormat {
        line,
        reason: format!("timestamp {:?} is not an integer", timestamp),
    })?;
    Ok(Interaction {
        user: user.trim().to_string(),
        item: item.trim().to_string(),
        rating,
        timestamp,
    })
}

/// Assigns user and item indices and assembles the user-by-item matrix.
///
/// Duplicate pairs are summed on assembly; with `binarize` they collapse
/// back to 1.0.
pub fn build_interactions(records: &[Interaction], options: &EncodingOptions) -> EncodedDataset {
    let mut users = IndexMapping::new();
    let mut items = IndexMapping::new();
    let mut triplets = Vec::with_capacity(records.len());
    let mut dropped = 0usize;

    for record in records {
        if options.min_rating.map_or(false, |min| record.rating < min) {
            dropped += 1;
            continue;
        }
        let u = users.index_or_insert(&record.user);
        let i = items.index_or_insert(&record.item);
        triplets.push((u, i, record.rating));
    }

    let mut coo = CooMatrix::new(users.len(), items.len());
    triplets.into_iter().for_each(|(u, i, r)| coo.push(u, i, r));
    let mut interactions = CsrMatrix::from(&coo);
    if options.binarize {
        interactions.values_mut().iter_mut().for_each(|v| *v = 1.0);
    }

    debug!(dropped, "rows below minimum rating");
    info!(
        users = users.len(),
        items = items.len(),
        nnz = interactions.nnz(),
        "built interaction matrix"
    );
    EncodedDataset { users, items, interactions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn record(user: &str, item: &str, rating: Flt) -> Interaction {
        Interaction { user: user.into(), item: item.into(), rating, timestamp: 0 }
    }

    #[test]
    fn test_load_tab_separated() {
        let file = write_file("196\t242\t3\t881250949\n186\t302\t3.5\t891717742\n");
        let records = load_interactions(file.path(), b'\t').unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], Interaction { user: "196".into(), item: "242".into(), rating: 3.0, timestamp: 881250949 });
        assert_eq!(records[1].rating, 3.5);
    }

    #[test]
    fn test_load_rejects_non_numeric_rating_with_line() {
        let file = write_file("1\t2\t4\t100\n1\t3\tgood\t101\n");
        match load_interactions(file.path(), b'\t') {
            Err(RecError::DataFormat { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_load_reports_extra_column_with_line() {
        let file = write_file("1\t2\t3\t4\n1\t3\t4\t5\t99\n");
        match load_interactions(file.path(), b'\t') {
            Err(err @ RecError::DataFormat { line: 2, .. }) => assert!(!err.to_string().contains('\n')),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_load_skips_blank_lines() {
        let file = write_file("1\t2\t3\t4\n\n1\t3\t4\t5\n\n");
        let records = load_interactions(file.path(), b'\t').unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].item, "3");
    }

    #[test]
    fn test_line_numbers_count_blank_lines() {
        let file = write_file("1\t2\t3\t4\n\n1\t3\tbad\t5\n");
        assert!(matches!(
            load_interactions(file.path(), b'\t'),
            Err(RecError::DataFormat { line: 3, .. })
        ));
    }

    #[test]
    fn test_load_rejects_wrong_column_count() {
        let file = write_file("1\t2\t4\n1\t3\t5\n");
        assert!(matches!(
            load_interactions(file.path(), b'\t'),
            Err(RecError::DataFormat { line: 1, .. })
        ));
    }

    #[test]
    fn test_load_rejects_negative_rating() {
        let file = write_file("1\t2\t-1\t100\n");
        assert!(matches!(load_interactions(file.path(), b'\t'), Err(RecError::DataFormat { .. })));
    }

    #[test]
    fn test_load_missing_file() {
        let path = Path::new("/definitely/not/here/u.data");
        assert!(matches!(load_interactions(path, b'\t'), Err(RecError::Io(_))));
    }

    #[test]
    fn test_index_order_of_first_appearance() {
        let records = vec![
            record("u9", "i5", 1.0),
            record("u3", "i5", 2.0),
            record("u9", "i1", 3.0),
            record("u7", "i2", 4.0),
        ];
        let data = build_interactions(&records, &EncodingOptions::default());
        assert_eq!(data.users.ids(), &["u9", "u3", "u7"]);
        assert_eq!(data.items.ids(), &["i5", "i1", "i2"]);
        assert_eq!(data.users.index("u7"), Some(2));
        assert_eq!(data.items.id(1), Some("i1"));
        assert_eq!(data.shape(), (3, 3));
        assert_eq!(data.interactions.nnz(), 4);

        let row = data.interactions.row(0);
        assert_eq!(row.col_indices(), &[0, 1]);
        assert_eq!(row.values(), &[1.0, 3.0]);
    }

    #[test]
    fn test_indices_contiguous() {
        let records: Vec<_> = (0..50)
            .map(|i| record(&format!("u{}", i % 7), &format!("i{}", (i * 3) % 11), 1.0))
            .collect();
        let data = build_interactions(&records, &EncodingOptions::default());
        assert_eq!(data.users.len(), 7);
        assert_eq!(data.items.len(), 11);
        for (idx, id) in data.users.ids().iter().enumerate() {
            assert_eq!(data.users.index(id), Some(idx));
        }
    }

    #[test]
    fn test_binarize_and_min_rating() {
        let records = vec![
            record("a", "x", 5.0),
            record("a", "x", 4.0),
            record("b", "y", 1.0),
            record("c", "z", 4.5),
        ];
        let options = EncodingOptions { binarize: true, min_rating: Some(4.0) };
        let data = build_interactions(&records, &options);
        assert_eq!(data.users.ids(), &["a", "c"]);
        assert_eq!(data.items.ids(), &["x", "z"]);
        assert!(data.interactions.values().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_empty_dataset_is_degenerate() {
        let data = build_interactions(&[], &EncodingOptions::default());
        assert!(matches!(data.ensure_not_degenerate(), Err(RecError::Shape { users: 0, items: 0 })));
    }
}
