use std::collections::BTreeMap;

use ndarray::{linalg::Dot, Array1, Array2};
use num_complex::Complex;
use rand_distr::num_traits;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Represents an array in compressed sparse row format.
///
/// Row `i` owns the entries `data[indptr[i]..indptr[i + 1]]`, whose column
/// indices are stored in the same range of `indices`, sorted ascending.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CsrArray<T> {
    data: Vec<T>,
    indices: Vec<usize>,
    indptr: Vec<usize>,
    shape: [usize; 2],
}

impl<T: Copy + num_traits::Zero> CsrArray<T> {
    #[must_use]
    pub fn zeros(shape: [usize; 2]) -> Self {
        CsrArray {
            data: Vec::new(),
            indices: Vec::new(),
            indptr: vec![0; shape[0] + 1],
            shape,
        }
    }

    /// Build an array from (row, column, value) entries. Duplicate entries are summed.
    ///
    /// # Panics
    ///
    /// Will panic if any entry lies outside of `shape`
    #[must_use]
    pub fn from_triplets(shape: [usize; 2], triplets: &[(usize, usize, T)]) -> Self {
        let mut entries = BTreeMap::<(usize, usize), T>::new();
        for &(row, col, value) in triplets {
            assert!(row < shape[0] && col < shape[1], "entry out of bounds");
            let entry = entries.entry((row, col)).or_insert_with(T::zero);
            *entry = *entry + value;
        }
        Self::from_sorted_entries(shape, entries)
    }

    fn from_sorted_entries(shape: [usize; 2], entries: BTreeMap<(usize, usize), T>) -> Self {
        let mut data = Vec::with_capacity(entries.len());
        let mut indices = Vec::with_capacity(entries.len());
        let mut indptr = vec![0; shape[0] + 1];
        for ((row, col), value) in entries {
            data.push(value);
            indices.push(col);
            indptr[row + 1] += 1;
        }
        for i in 0..shape[0] {
            indptr[i + 1] += indptr[i];
        }
        CsrArray {
            data,
            indices,
            indptr,
            shape,
        }
    }

    /// Iterate over the stored (row, column, value) entries in row order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.shape[0]).flat_map(move |row| {
            (self.indptr[row]..self.indptr[row + 1])
                .map(move |k| (row, self.indices[k], self.data[k]))
        })
    }

    #[must_use]
    pub fn to_dense(&self) -> Array2<T> {
        let mut out = Array2::zeros(self.shape);
        for (row, col, value) in self.iter() {
            out[[row, col]] = value;
        }
        out
    }

    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    /// Number of stored entries
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_square(&self) -> bool {
        self.shape[0] == self.shape[1]
    }
}

impl<
        T: num_traits::Zero
            + Clone
            + Copy
            + std::ops::AddAssign<<T as std::ops::Mul>::Output>
            + std::ops::Mul,
    > Dot<Array1<T>> for CsrArray<T>
{
    type Output = Array1<T>;

    #[inline]
    fn dot(&self, rhs: &Array1<T>) -> Self::Output {
        assert!(self.shape[1] == rhs.len());

        let mut out = Array1::zeros(self.shape[0]);
        for (row, o) in out.iter_mut().enumerate() {
            let range = self.indptr[row]..self.indptr[row + 1];
            self.data[range.clone()]
                .iter()
                .zip(&self.indices[range])
                .for_each(|(d, &col)| *o += *d * rhs[col]);
        }
        out
    }
}

impl CsrArray<Complex<f64>> {
    /// Convert a dense array, dropping every entry with magnitude not above `tol`.
    #[must_use]
    pub fn from_dense(dense: &Array2<Complex<f64>>, tol: f64) -> Self {
        let shape = [dense.nrows(), dense.ncols()];
        let entries = dense
            .indexed_iter()
            .filter(|(_, v)| v.norm() > tol)
            .map(|((row, col), v)| ((row, col), *v))
            .collect();
        Self::from_sorted_entries(shape, entries)
    }

    #[must_use]
    pub fn identity(n: usize) -> Self {
        Self::from_triplets(
            [n, n],
            &(0..n)
                .map(|i| (i, i, Complex { re: 1f64, im: 0f64 }))
                .collect::<Vec<_>>(),
        )
    }

    /// The conjugate transpose.
    #[must_use]
    pub fn adjoint(&self) -> Self {
        let entries = self
            .iter()
            .map(|(row, col, value)| ((col, row), value.conj()))
            .collect();
        Self::from_sorted_entries([self.shape[1], self.shape[0]], entries)
    }

    /// The matrix product `self * rhs`.
    ///
    /// # Panics
    ///
    /// Will panic if the inner dimensions do not agree
    #[must_use]
    pub fn matmul(&self, rhs: &Self) -> Self {
        assert_eq!(self.shape[1], rhs.shape[0]);
        let mut entries = BTreeMap::<(usize, usize), Complex<f64>>::new();
        for (row, inner, left) in self.iter() {
            for k in rhs.indptr[inner]..rhs.indptr[inner + 1] {
                *entries.entry((row, rhs.indices[k])).or_default() += left * rhs.data[k];
            }
        }
        Self::from_sorted_entries([self.shape[0], rhs.shape[1]], entries)
    }

    #[must_use]
    pub fn scaled(&self, factor: Complex<f64>) -> Self {
        CsrArray {
            data: self.data.iter().map(|d| d * factor).collect(),
            indices: self.indices.clone(),
            indptr: self.indptr.clone(),
            shape: self.shape,
        }
    }

    /// `self + factor * other`
    ///
    /// # Panics
    ///
    /// Will panic if the shapes differ
    #[must_use]
    pub fn add_scaled(&self, other: &Self, factor: Complex<f64>) -> Self {
        assert_eq!(self.shape, other.shape);
        let mut entries = self
            .iter()
            .map(|(row, col, value)| ((row, col), value))
            .collect::<BTreeMap<_, _>>();
        for (row, col, value) in other.iter() {
            *entries.entry((row, col)).or_default() += factor * value;
        }
        Self::from_sorted_entries(self.shape, entries)
    }

    /// Remove all entries with magnitude not above `tol`.
    #[must_use]
    pub fn tidyup(&self, tol: f64) -> Self {
        let entries = self
            .iter()
            .filter(|(_, _, value)| value.norm() > tol)
            .map(|(row, col, value)| ((row, col), value))
            .collect();
        Self::from_sorted_entries(self.shape, entries)
    }

    #[must_use]
    pub fn is_hermitian(&self, tol: f64) -> bool {
        if !self.is_square() {
            return false;
        }
        let difference = self.add_scaled(&self.adjoint(), Complex { re: -1f64, im: 0f64 });
        difference.data.iter().all(|d| d.norm() <= tol)
    }

    /// `<state| self |state>`, without normalizing the state.
    #[must_use]
    pub fn expectation(&self, state: &Array1<Complex<f64>>) -> Complex<f64> {
        let applied = self.dot(state);
        state
            .iter()
            .zip(applied.iter())
            .fold(Complex::default(), |acc, (s, a)| acc + s.conj() * a)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{linalg::Dot, Array1, Array2};
    use num_complex::Complex;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::distribution::StandardComplexNormal;

    use super::CsrArray;

    fn random_dense(rng: &mut StdRng, shape: [usize; 2]) -> Array2<Complex<f64>> {
        Array2::from_shape_vec(
            shape,
            rng.sample_iter(StandardComplexNormal)
                .take(shape[0] * shape[1])
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_csr_dot_product() {
        let mut rng = StdRng::seed_from_u64(1);
        let full = random_dense(&mut rng, [10, 12]);
        let sparse = CsrArray::from_dense(&full, 0.0);
        let state = Array1::from_iter((&mut rng).sample_iter(StandardComplexNormal).take(12));

        let expected = full.dot(&state);
        let actual = sparse.dot(&state);
        assert_eq!(expected.len(), actual.len());
        for i in 0..expected.len() {
            assert!((expected[i] - actual[i]).norm() < 1e-10);
        }
    }

    #[test]
    fn test_from_dense_drops_small_entries() {
        let mut dense = Array2::zeros([3, 3]);
        dense[[0, 1]] = Complex { re: 1e-12, im: 0.0 };
        dense[[2, 0]] = Complex { re: 0.5, im: 0.5 };
        let sparse = CsrArray::from_dense(&dense, 1e-8);
        assert_eq!(sparse.nnz(), 1);
        assert_eq!(sparse.to_dense()[[2, 0]], Complex { re: 0.5, im: 0.5 });
    }

    #[test]
    fn test_triplets_sum_duplicates() {
        let one = Complex { re: 1.0, im: 0.0 };
        let sparse = CsrArray::from_triplets([2, 2], &[(0, 1, one), (0, 1, one), (1, 0, one)]);
        assert_eq!(sparse.nnz(), 2);
        assert_eq!(sparse.to_dense()[[0, 1]], 2.0 * one);
    }

    #[test]
    fn test_adjoint_and_matmul_match_dense() {
        let mut rng = StdRng::seed_from_u64(2);
        let a = random_dense(&mut rng, [4, 5]);
        let b = random_dense(&mut rng, [5, 3]);
        let a_sparse = CsrArray::from_dense(&a, 0.0);
        let b_sparse = CsrArray::from_dense(&b, 0.0);

        let product = a_sparse.matmul(&b_sparse).to_dense();
        let expected = a.dot(&b);
        for (x, y) in product.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(x.re, y.re, epsilon = 1e-10);
            assert_abs_diff_eq!(x.im, y.im, epsilon = 1e-10);
        }

        let adjoint = a_sparse.adjoint().to_dense();
        assert_eq!(adjoint.shape(), &[5, 4]);
        for i in 0..4 {
            for j in 0..5 {
                assert_eq!(adjoint[[j, i]], a[[i, j]].conj());
            }
        }
    }

    #[test]
    fn test_hermitian_check() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = CsrArray::from_dense(&random_dense(&mut rng, [4, 4]), 0.0);
        let hermitian = a.add_scaled(&a.adjoint(), Complex { re: 1.0, im: 0.0 });
        assert!(hermitian.is_hermitian(1e-12));
        assert!(!a.is_hermitian(1e-12));
        assert!(!CsrArray::<Complex<f64>>::zeros([2, 3]).is_hermitian(1e-12));
    }

    #[test]
    fn test_expectation_of_identity_is_norm() {
        let state = Array1::from(vec![Complex { re: 0.6, im: 0.0 }, Complex { re: 0.0, im: 0.8 }]);
        let value = CsrArray::identity(2).expectation(&state);
        assert_abs_diff_eq!(value.re, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(value.im, 0.0, epsilon = 1e-12);
    }
}
