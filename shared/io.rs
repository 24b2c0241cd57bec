//! Labeled matrices as tab-separated text.
//!
//! The first line holds a corner cell followed by the column ids. Every other
//! line holds a row id followed by one numeric value per column.

use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

use crate::types::{LabeledMatrix, MatrixError};

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Malformed TSV input: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The input has no header line.")]
    MissingHeader,
    #[error("Line {line} has {found} fields, but the header has {expected}.")]
    RaggedRow {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("Line {line}, column '{column}': '{value}' is not a number.")]
    InvalidNumber {
        line: usize,
        column: String,
        value: String,
    },
    #[error(
        "Line {line}, column '{column}': non-finite values (NaN or Infinity) are not allowed."
    )]
    NonFiniteValue { line: usize, column: String },
    #[error("Parsed values do not form a matrix: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error(transparent)]
    MatrixError(#[from] MatrixError),
}

pub fn read_labeled_tsv(path: &Path) -> Result<LabeledMatrix, DataError> {
    let matrix = read_labeled_tsv_from(BufReader::new(File::open(path)?))?;
    log::debug!(
        "Read {}x{} matrix from {}",
        matrix.nrows(),
        matrix.ncols(),
        path.display()
    );
    Ok(matrix)
}

pub fn read_labeled_tsv_from<R: Read>(reader: R) -> Result<LabeledMatrix, DataError> {
    let mut records = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader)
        .into_records();

    let header = records.next().ok_or(DataError::MissingHeader)??;
    let col_names: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
    let expected = header.len();

    let mut row_names = Vec::new();
    let mut values = Vec::new();
    for (offset, record) in records.enumerate() {
        let record = record?;
        // Line 1 is the header.
        let line = offset + 2;
        if record.len() != expected {
            return Err(DataError::RaggedRow {
                line,
                expected,
                found: record.len(),
            });
        }
        row_names.push(record.get(0).unwrap_or_default().to_string());
        parse_values(&record, line, &col_names, &mut values)?;
    }

    let data = Array2::from_shape_vec((row_names.len(), col_names.len()), values)?;
    Ok(LabeledMatrix::new(data, row_names, col_names)?)
}

fn parse_values(
    record: &StringRecord,
    line: usize,
    col_names: &[String],
    values: &mut Vec<f64>,
) -> Result<(), DataError> {
    for (field, column) in record.iter().skip(1).zip(col_names) {
        let value: f64 = field.parse().map_err(|_| DataError::InvalidNumber {
            line,
            column: column.clone(),
            value: field.to_string(),
        })?;
        if !value.is_finite() {
            return Err(DataError::NonFiniteValue {
                line,
                column: column.clone(),
            });
        }
        values.push(value);
    }
    Ok(())
}

pub fn write_labeled_tsv(matrix: &LabeledMatrix, path: &Path) -> Result<(), DataError> {
    let mut file = BufWriter::new(File::create(path)?);
    write_labeled_tsv_to(matrix, &mut file)?;
    file.flush()?;
    Ok(())
}

pub fn write_labeled_tsv_to<W: Write>(
    matrix: &LabeledMatrix,
    writer: W,
) -> Result<(), DataError> {
    let mut tsv = WriterBuilder::new()
        .delimiter(b'\t')
        .flexible(false)
        .from_writer(writer);

    tsv.write_record(std::iter::once("").chain(matrix.col_names().iter().map(String::as_str)))?;

    let mut fields = Vec::with_capacity(matrix.ncols() + 1);
    for (name, row) in matrix.row_names().iter().zip(matrix.data().rows()) {
        fields.clear();
        fields.push(name.clone());
        fields.extend(row.iter().map(|v| v.to_string()));
        tsv.write_record(&fields)?;
    }
    tsv.flush()?;
    Ok(())
}
