/// Sparse boolean incidence matrix, segments as rows, properties as
/// columns. Columns are grown on demand and may lag behind the logical row
/// count; readers treat missing cells as false.
#[derive(Debug, Clone, Default)]
pub struct BooleanIncidenceMatrix {
    cols: Vec<Vec<bool>>,
    rows: usize,
}

/// Result of folding identical row patterns: the unique patterns (merged
/// groups), which merged group each original row landed in, and, per
/// original column, the merged groups it spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub merged: Vec<Vec<bool>>,
    pub row_of: Vec<usize>,
    pub membership: Vec<Vec<usize>>,
}

impl BooleanIncidenceMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        BooleanIncidenceMatrix {
            cols: vec![Vec::new(); cols],
            rows,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.cols.len()
    }

    pub fn set(&mut self, row: usize, col: usize) {
        self.put(row, col, true)
    }

    pub fn clear(&mut self, row: usize, col: usize) {
        self.put(row, col, false)
    }

    fn put(&mut self, row: usize, col: usize, value: bool) {
        if col >= self.cols.len() {
            self.cols.resize(col + 1, Vec::new());
        }
        let c = &mut self.cols[col];
        if row >= c.len() {
            c.resize(row + 1, false);
        }
        c[row] = value;
        if row >= self.rows {
            self.rows = row + 1;
        }
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        self.cols
            .get(col)
            .and_then(|c| c.get(row))
            .copied()
            .unwrap_or(false)
    }

    /// Population count of a column.
    pub fn column_norm0(&self, col: usize) -> usize {
        self.cols
            .get(col)
            .map(|c| c.iter().filter(|&&b| b).count())
            .unwrap_or(0)
    }

    /// Shallow view of a column; may be shorter than the row count.
    pub fn column(&self, col: usize) -> &[bool] {
        self.cols.get(col).map(|c| &c[..]).unwrap_or(&[])
    }

    /// Deep copy of a row, padded out to the full column count.
    pub fn row(&self, row: usize) -> Vec<bool> {
        (0..self.cols.len()).map(|c| self.get(row, c)).collect()
    }

    fn masked_row(&self, row: usize, mask: Option<&[usize]>) -> Vec<bool> {
        match mask {
            Some(m) => m.iter().map(|&c| self.get(row, c)).collect(),
            None => self.row(row),
        }
    }

    /// Fold identical row patterns into the minimal partition. An optional
    /// column mask restricts which properties distinguish rows; membership
    /// is still reported for every column.
    pub fn fold_rows(&self, mask: Option<&[usize]>) -> Fold {
        let mut merged: Vec<Vec<bool>> = Vec::new();
        let mut row_of = Vec::with_capacity(self.rows);
        for r in 0..self.rows {
            let pat = self.masked_row(r, mask);
            let ix = match merged.iter().position(|m| *m == pat) {
                Some(ix) => ix,
                None => {
                    merged.push(pat);
                    merged.len() - 1
                }
            };
            row_of.push(ix);
        }
        let mut membership = vec![Vec::new(); self.cols.len()];
        for (c, member) in membership.iter_mut().enumerate() {
            for r in 0..self.rows {
                if self.get(r, c) && !member.contains(&row_of[r]) {
                    member.push(row_of[r]);
                }
            }
            member.sort_unstable();
        }
        Fold {
            merged,
            row_of,
            membership,
        }
    }
}

impl PartialEq for BooleanIncidenceMatrix {
    /// Structural equality on logical cell values; jagged storage does not
    /// matter.
    fn eq(&self, other: &Self) -> bool {
        if self.rows != other.rows || self.cols.len() != other.cols.len() {
            return false;
        }
        for c in 0..self.cols.len() {
            for r in 0..self.rows {
                if self.get(r, c) != other.get(r, c) {
                    return false;
                }
            }
        }
        true
    }
}

impl Eq for BooleanIncidenceMatrix {}

#[cfg(test)]
mod test {
    use super::*;

    fn from_rows(rows: &[&str]) -> BooleanIncidenceMatrix {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut m = BooleanIncidenceMatrix::new(rows.len(), width);
        for (r, row) in rows.iter().enumerate() {
            for (c, ch) in row.chars().enumerate() {
                if ch == '1' {
                    m.set(r, c);
                }
            }
        }
        m
    }

    #[test]
    fn fold_unique_rows() {
        let m = from_rows(&["100", "110", "100", "010"]);
        let f = m.fold_rows(None);
        assert_eq!(f.merged.len(), 3);
        assert_eq!(f.row_of, vec![0, 1, 0, 2]);
        // column 0 spans merged rows {0, 1}, column 1 {1, 2}, column 2 none
        assert_eq!(f.membership, vec![vec![0, 1], vec![1, 2], vec![]]);
    }

    #[test]
    fn fold_masked() {
        let m = from_rows(&["10", "11", "01"]);
        // With only column 0 relevant, rows 0 and 1 coincide.
        let f = m.fold_rows(Some(&[0]));
        assert_eq!(f.merged.len(), 2);
        assert_eq!(f.row_of, vec![0, 0, 1]);
    }

    #[test]
    fn jagged_columns() {
        let mut m = BooleanIncidenceMatrix::new(4, 2);
        m.set(0, 0);
        // column 1 never grows past row 0; reads must not panic
        assert!(!m.get(3, 1));
        assert_eq!(m.column_norm0(1), 0);
        assert_eq!(m.row(3), vec![false, false]);
    }

    #[test]
    fn structural_equality() {
        let mut a = BooleanIncidenceMatrix::new(2, 2);
        a.set(0, 0);
        let mut b = BooleanIncidenceMatrix::new(2, 2);
        b.set(0, 0);
        b.set(1, 1);
        b.clear(1, 1);
        // b's column 1 is longer in storage but logically equal
        assert_eq!(a, b);
    }

    #[test]
    fn norms_and_extraction() {
        let m = from_rows(&["110", "010"]);
        assert_eq!(m.column_norm0(0), 1);
        assert_eq!(m.column_norm0(1), 2);
        assert_eq!(m.row(0), vec![true, true, false]);
        assert_eq!(m.column(2), &[] as &[bool]);
    }
}
