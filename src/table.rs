//! Parsing of whitespace-separated numeric tables,
//! the plain-text format used for point clouds, snapshots and coefficients.

/// Error in parsing a numeric table.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TableError {
    /// A token could not be parsed as a number.
    #[error("line {line}: could not parse {token:?} as a number")]
    BadNumber {
        /// 1-based line number.
        line: usize,
        /// The offending token.
        token: String,
    },
    /// A row had a different number of columns than the first one.
    #[error("line {line}: expected {expected} columns, found {found}")]
    RaggedRow {
        /// 1-based line number.
        line: usize,
        /// Column count of the first row.
        expected: usize,
        /// Column count of this row.
        found: usize,
    },
}

/// A dense table of numbers stored row by row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub values: Vec<f64>,
    pub columns: usize,
}

impl Table {
    #[inline]
    pub fn rows(&self) -> usize {
        if self.columns == 0 {
            0
        } else {
            self.values.len() / self.columns
        }
    }

    #[inline]
    pub fn row(&self, idx: usize) -> &[f64] {
        &self.values[idx * self.columns..(idx + 1) * self.columns]
    }
}

/// Parse a table, skipping blank lines and `#` comments.
pub fn parse(text: &str) -> Result<Table, TableError> {
    let mut table = Table::default();
    for (line_idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let row_start = table.values.len();
        for token in line.split_whitespace() {
            let value = token.parse::<f64>().map_err(|_| TableError::BadNumber {
                line: line_idx + 1,
                token: token.to_string(),
            })?;
            table.values.push(value);
        }

        let found = table.values.len() - row_start;
        if table.columns == 0 {
            table.columns = found;
        } else if found != table.columns {
            return Err(TableError::RaggedRow {
                line: line_idx + 1,
                expected: table.columns,
                found,
            });
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines() {
        let table = parse("# x y\n\n1 2\n 3\t4 \n").expect("valid table");
        assert_eq!(table.columns, 2);
        assert_eq!(table.rows(), 2);
        assert_eq!(table.row(1), &[3., 4.]);
    }

    #[test]
    fn malformed_rows() {
        assert_eq!(
            parse("1 2\n3\n"),
            Err(TableError::RaggedRow {
                line: 2,
                expected: 2,
                found: 1
            })
        );
        assert!(matches!(
            parse("1 nope\n"),
            Err(TableError::BadNumber { line: 1, .. })
        ));
    }
}
