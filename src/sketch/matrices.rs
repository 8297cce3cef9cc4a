//! Sufficient-statistics matrices.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

/// The matrices that make up a sketch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MatrixKind {
    /// Group counts, `sum(1)`.
    Ones = 0,
    /// Group sums, `sum(X)`.
    SumX = 1,
    /// Group sums of squares, `sum(X²)`.
    SumXX = 2,
    /// Pairwise cross-product sums, `sum(X_i·X_j)`.
    SumXY = 3,
}

impl MatrixKind {
    /// The three matrices every batch carries.
    pub const CORE: [MatrixKind; 3] = [MatrixKind::Ones, MatrixKind::SumX, MatrixKind::SumXX];

    /// Convert from u8, returning None for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ones),
            1 => Some(Self::SumX),
            2 => Some(Self::SumXX),
            3 => Some(Self::SumXY),
            _ => None,
        }
    }

    /// Short stable name used in file names.
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Ones => "ones",
            Self::SumX => "sum_x",
            Self::SumXX => "sum_xx",
            Self::SumXY => "sum_xy",
        }
    }
}

/// Column of the pair `(i, j)`, `i < j`, among `d` columns in the flattened
/// cross-term layout (pairs enumerated lexicographically).
#[inline]
pub fn pair_index(i: usize, j: usize, d: usize) -> usize {
    debug_assert!(i < j && j < d, "invalid pair ({i}, {j}) for {d} columns");
    i * (2 * d - i - 1) / 2 + (j - i - 1)
}

/// Number of unordered pairs among `d` columns.
#[inline]
pub fn n_pairs(d: usize) -> usize {
    d * d.saturating_sub(1) / 2
}

/// Column-aligned sufficient statistics for a set of features.
///
/// Every matrix has one row per join-key domain row. `ones`, `sum_x` and
/// `sum_xx` have one column per feature; the optional `sum_xy` has one column
/// per unordered feature pair (see [`pair_index`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Sketch {
    ones: Array2<f64>,
    sum_x: Array2<f64>,
    sum_xx: Array2<f64>,
    sum_xy: Option<Array2<f64>>,
}

impl Sketch {
    /// Assemble a sketch from its matrices.
    ///
    /// # Panics
    ///
    /// Debug-asserts that all matrices share the domain axis and that the
    /// feature matrices share their width.
    pub fn new(
        ones: Array2<f64>,
        sum_x: Array2<f64>,
        sum_xx: Array2<f64>,
        sum_xy: Option<Array2<f64>>,
    ) -> Self {
        debug_assert_eq!(ones.dim(), sum_x.dim(), "ones/sum_x shape mismatch");
        debug_assert_eq!(ones.dim(), sum_xx.dim(), "ones/sum_xx shape mismatch");
        if let Some(xy) = &sum_xy {
            debug_assert_eq!(xy.nrows(), ones.nrows(), "sum_xy domain mismatch");
        }
        Self {
            ones,
            sum_x,
            sum_xx,
            sum_xy,
        }
    }

    /// An empty sketch over `domain_size` rows.
    pub fn empty(domain_size: usize) -> Self {
        Self::new(
            Array2::zeros((domain_size, 0)),
            Array2::zeros((domain_size, 0)),
            Array2::zeros((domain_size, 0)),
            None,
        )
    }

    /// Number of domain rows.
    #[inline]
    pub fn domain_size(&self) -> usize {
        self.ones.nrows()
    }

    /// Number of feature columns.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.ones.ncols()
    }

    #[inline]
    pub fn ones(&self) -> ArrayView2<'_, f64> {
        self.ones.view()
    }

    #[inline]
    pub fn sum_x(&self) -> ArrayView2<'_, f64> {
        self.sum_x.view()
    }

    #[inline]
    pub fn sum_xx(&self) -> ArrayView2<'_, f64> {
        self.sum_xx.view()
    }

    #[inline]
    pub fn sum_xy(&self) -> Option<ArrayView2<'_, f64>> {
        self.sum_xy.as_ref().map(|m| m.view())
    }

    /// Matrix by kind. `SumXY` is `None` when cross terms were not computed.
    pub fn matrix(&self, kind: MatrixKind) -> Option<ArrayView2<'_, f64>> {
        match kind {
            MatrixKind::Ones => Some(self.ones()),
            MatrixKind::SumX => Some(self.sum_x()),
            MatrixKind::SumXX => Some(self.sum_xx()),
            MatrixKind::SumXY => self.sum_xy(),
        }
    }

    /// Copy of the feature columns in `start..end`. Cross terms are dropped,
    /// since pairs do not survive a column split.
    pub fn columns(&self, start: usize, end: usize) -> Sketch {
        Sketch::new(
            self.ones.slice(s![.., start..end]).to_owned(),
            self.sum_x.slice(s![.., start..end]).to_owned(),
            self.sum_xx.slice(s![.., start..end]).to_owned(),
            None,
        )
    }

    /// Append the feature columns of `other` on the right.
    pub fn append_columns(&mut self, other: &Sketch) {
        debug_assert_eq!(self.domain_size(), other.domain_size());
        let join = |a: &Array2<f64>, b: &Array2<f64>| {
            concatenate(Axis(1), &[a.view(), b.view()]).expect("domain axes match")
        };
        self.ones = join(&self.ones, &other.ones);
        self.sum_x = join(&self.sum_x, &other.sum_x);
        self.sum_xx = join(&self.sum_xx, &other.sum_xx);
    }

    /// Bytes held by the matrices.
    pub fn nbytes(&self) -> usize {
        let xy = self.sum_xy.as_ref().map_or(0, |m| m.len());
        (self.ones.len() + self.sum_x.len() + self.sum_xx.len() + xy) * std::mem::size_of::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn pair_index_is_lexicographic() {
        let d = 4;
        let mut expected = 0;
        for i in 0..d {
            for j in (i + 1)..d {
                assert_eq!(pair_index(i, j, d), expected);
                expected += 1;
            }
        }
        assert_eq!(expected, n_pairs(d));
        assert_eq!(n_pairs(0), 0);
        assert_eq!(n_pairs(1), 0);
    }

    #[test]
    fn matrix_kind_roundtrip() {
        for kind in [
            MatrixKind::Ones,
            MatrixKind::SumX,
            MatrixKind::SumXX,
            MatrixKind::SumXY,
        ] {
            assert_eq!(MatrixKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(MatrixKind::from_u8(9), None);
    }

    #[test]
    fn columns_and_append() {
        let sketch = Sketch::new(
            array![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]],
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            array![[1.0, 4.0, 9.0], [16.0, 25.0, 36.0]],
            None,
        );
        let mut left = sketch.columns(0, 1);
        let right = sketch.columns(1, 3);
        assert_eq!(left.n_features(), 1);
        assert_eq!(right.n_features(), 2);

        left.append_columns(&right);
        assert_eq!(left, sketch);
    }

    #[test]
    fn empty_sketch_has_domain() {
        let sketch = Sketch::empty(5);
        assert_eq!(sketch.domain_size(), 5);
        assert_eq!(sketch.n_features(), 0);
        assert_eq!(sketch.nbytes(), 0);
    }
}
