//! Labeled dense matrices shared by every stage of the engine.
//!
//! Orientation conventions used throughout the crate:
//!
//! - predictor activity `X` is `[K predictors x N samples]`
//! - response expression `Y` is `[G genes x N samples]`
//! - the prior network and both output networks are `[G genes x K predictors]`

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error(
        "Matrix has shape {rows}x{cols}, but {row_labels} row labels and {col_labels} column labels were supplied."
    )]
    LabelMismatch {
        rows: usize,
        cols: usize,
        row_labels: usize,
        col_labels: usize,
    },
    #[error("Column index {index} is out of bounds for a matrix with {ncols} columns.")]
    ColumnOutOfBounds { index: usize, ncols: usize },
}

/// A dense `f64` matrix whose rows and columns carry stable string identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledMatrix {
    data: Array2<f64>,
    row_names: Vec<String>,
    col_names: Vec<String>,
}

impl LabeledMatrix {
    pub fn new(
        data: Array2<f64>,
        row_names: Vec<String>,
        col_names: Vec<String>,
    ) -> Result<Self, MatrixError> {
        if data.nrows() != row_names.len() || data.ncols() != col_names.len() {
            return Err(MatrixError::LabelMismatch {
                rows: data.nrows(),
                cols: data.ncols(),
                row_labels: row_names.len(),
                col_labels: col_names.len(),
            });
        }
        Ok(Self {
            data,
            row_names,
            col_names,
        })
    }

    /// A zero-filled matrix with the given labels.
    pub fn zeros(row_names: Vec<String>, col_names: Vec<String>) -> Self {
        Self {
            data: Array2::zeros((row_names.len(), col_names.len())),
            row_names,
            col_names,
        }
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn row_names(&self) -> &[String] {
        &self.row_names
    }

    pub fn col_names(&self) -> &[String] {
        &self.col_names
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn into_parts(self) -> (Array2<f64>, Vec<String>, Vec<String>) {
        (self.data, self.row_names, self.col_names)
    }

    pub fn row_position(&self, name: &str) -> Option<usize> {
        self.row_names.iter().position(|r| r == name)
    }

    pub fn col_position(&self, name: &str) -> Option<usize> {
        self.col_names.iter().position(|c| c == name)
    }

    /// Reorders rows and columns to exactly `rows` x `cols`.
    ///
    /// Labels absent from `self` are filled with zero; labels of `self` absent
    /// from the requested sets are dropped. When a label occurs more than once
    /// the first occurrence wins.
    pub fn reindex(&self, rows: &[String], cols: &[String]) -> LabeledMatrix {
        let row_lookup = first_positions(&self.row_names);
        let col_lookup = first_positions(&self.col_names);

        let row_map: Vec<Option<usize>> = rows
            .iter()
            .map(|r| row_lookup.get(r.as_str()).copied())
            .collect();
        let col_map: Vec<Option<usize>> = cols
            .iter()
            .map(|c| col_lookup.get(c.as_str()).copied())
            .collect();

        let data = Array2::from_shape_fn((rows.len(), cols.len()), |(i, j)| {
            match (row_map[i], col_map[j]) {
                (Some(src_i), Some(src_j)) => self.data[(src_i, src_j)],
                _ => 0.0,
            }
        });

        LabeledMatrix {
            data,
            row_names: rows.to_vec(),
            col_names: cols.to_vec(),
        }
    }

    /// Builds a copy holding the given columns, in order, repeats allowed.
    ///
    /// Used to draw a bootstrap replicate along the sample axis.
    pub fn select_columns(&self, indices: &[usize]) -> Result<LabeledMatrix, MatrixError> {
        let ncols = self.ncols();
        if let Some(&index) = indices.iter().find(|&&i| i >= ncols) {
            return Err(MatrixError::ColumnOutOfBounds { index, ncols });
        }
        Ok(LabeledMatrix {
            data: self.data.select(Axis(1), indices),
            row_names: self.row_names.clone(),
            col_names: indices.iter().map(|&i| self.col_names[i].clone()).collect(),
        })
    }

    /// Number of non-zero entries in each row.
    pub fn nonzero_per_row(&self) -> Vec<usize> {
        self.data
            .axis_iter(Axis(0))
            .map(|row| row.iter().filter(|&&v| v != 0.0).count())
            .collect()
    }
}

fn first_positions(names: &[String]) -> HashMap<&str, usize> {
    let mut lookup = HashMap::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        lookup.entry(name.as_str()).or_insert(i);
    }
    lookup
}

/// The pair of networks produced by one regression run.
///
/// Both matrices are `[G x K]`, rows labeled by response ids and columns by
/// predictor ids. An exact zero means no edge was selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEstimate {
    pub betas: LabeledMatrix,
    pub rescaled_betas: LabeledMatrix,
}

/// Sequential labels `{prefix}0 .. {prefix}{n-1}` for unlabeled data.
pub fn numbered_labels(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}{i}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn new_rejects_mismatched_labels() {
        let err = LabeledMatrix::new(Array2::zeros((2, 3)), names(&["a", "b"]), names(&["x"]))
            .unwrap_err();
        assert!(matches!(err, MatrixError::LabelMismatch { rows: 2, cols: 3, .. }));
    }

    #[test]
    fn reindex_fills_missing_with_zero_and_drops_extras() {
        let prior = LabeledMatrix::new(
            array![[1.0, 2.0], [3.0, 4.0]],
            names(&["g1", "g2"]),
            names(&["tf1", "tf2"]),
        )
        .unwrap();

        let aligned = prior.reindex(&names(&["g2", "g3"]), &names(&["tf2", "tf9", "tf1"]));
        assert_eq!(aligned.shape(), (2, 3));
        assert_eq!(aligned.data(), &array![[4.0, 0.0, 3.0], [0.0, 0.0, 0.0]]);
        assert_eq!(aligned.row_names(), &names(&["g2", "g3"])[..]);
        assert_eq!(aligned.col_names(), &names(&["tf2", "tf9", "tf1"])[..]);
    }

    #[test]
    fn select_columns_repeats_and_validates() {
        let m = LabeledMatrix::new(
            array![[1.0, 2.0, 3.0]],
            names(&["r"]),
            names(&["s0", "s1", "s2"]),
        )
        .unwrap();
        let picked = m.select_columns(&[2, 2, 0]).unwrap();
        assert_eq!(picked.data(), &array![[3.0, 3.0, 1.0]]);
        assert_eq!(picked.col_names(), &names(&["s2", "s2", "s0"])[..]);

        let err = m.select_columns(&[3]).unwrap_err();
        assert!(matches!(err, MatrixError::ColumnOutOfBounds { index: 3, ncols: 3 }));
    }

    #[test]
    fn nonzero_counts_per_row() {
        let m = LabeledMatrix::new(
            array![[0.0, 1.0, 2.0], [0.0, 0.0, 0.0]],
            numbered_labels("g", 2),
            numbered_labels("tf", 3),
        )
        .unwrap();
        assert_eq!(m.nonzero_per_row(), vec![2, 0]);
    }
}
