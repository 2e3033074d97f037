// spectrum.rs — folded half-spectrum layout.
//
// A real-valued spatial field of extents `dims` transforms to a complex
// spectrum whose LAST axis is folded to `dims[last]/2 + 1` bins (the
// standard real-to-complex convention — the other half is redundant by
// Hermitian symmetry). Everything downstream — buffer sizes, row-major
// strides, workgroup counts — derives from this folded layout, so it lives
// in one place and is validated once.
//
// Axes beyond `ndim` are padded so shaders can index all three components
// unconditionally: extents and logical dims pad to 1 (never a divisor of
// zero), strides pad to 0 (inert in the flat-index sum).

use crate::error::AnnealError;

/// Maximum supported dimensionality.
pub const MAX_DIMENSIONS: usize = 3;

/// Per-`ndim` update-kernel workgroup sizes, baked into the update pipeline
/// at context creation. Row `ndim - 1` holds (x, y, z).
///
/// 64 invocations per group throughout: one full wavefront on AMD, two
/// warps on NVIDIA.
const UPDATE_GROUP_SIZES: [[u32; MAX_DIMENSIONS]; MAX_DIMENSIONS] = [
    [64, 1, 1], // 1D
    [16, 16, 1], // 2D
    [8, 8, 8], // 3D
];

/// Workgroup width of the metric and reduce kernels (1D dispatches).
pub const METRIC_GROUP_SIZE: u32 = 64;

/// Workgroup sizes of the update kernel for the given dimensionality.
///
/// # Panics
/// Debug-asserts `1 <= ndim <= 3`; callers validate dimensionality before
/// reaching this table.
pub(crate) fn update_group_sizes(ndim: u32) -> [u32; MAX_DIMENSIONS] {
    debug_assert!((1..=MAX_DIMENSIONS as u32).contains(&ndim));
    UPDATE_GROUP_SIZES[ndim as usize - 1]
}

/// The folded layout of a half-spectrum: logical (real-space) extents,
/// folded (actual) extents, row-major strides over the folded extents, and
/// the total folded element count.
///
/// Shared by [`crate::image::SpectrumImage`] (complex pairs) and
/// [`crate::corrfn::CorrelationFunction`] (scalar floats) — the folding
/// rule is identical, only the element type differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectrumLayout {
    logical_dims: [u32; MAX_DIMENSIONS],
    actual_dims: [u32; MAX_DIMENSIONS],
    stride: [u32; MAX_DIMENSIONS],
    ndim: u32,
    actual_size: usize,
}

impl SpectrumLayout {
    /// Build the folded layout for real-space extents `dims`.
    ///
    /// Fails with [`AnnealError::BadDimensions`] when `dims` is empty,
    /// longer than [`MAX_DIMENSIONS`], or contains a zero extent.
    pub fn new(dims: &[u32]) -> Result<Self, AnnealError> {
        if dims.is_empty() || dims.len() > MAX_DIMENSIONS || dims.contains(&0) {
            return Err(AnnealError::BadDimensions);
        }
        let ndim = dims.len();

        let mut logical_dims = [1u32; MAX_DIMENSIONS];
        logical_dims[..ndim].copy_from_slice(dims);

        // Fold the last axis only.
        let mut actual_dims = logical_dims;
        actual_dims[ndim - 1] = actual_dims[ndim - 1] / 2 + 1;

        // Row-major strides over the folded extents: the last axis is
        // contiguous, earlier axes step over everything after them.
        let mut stride = [0u32; MAX_DIMENSIONS];
        for i in 0..ndim {
            stride[i] = actual_dims[i + 1..ndim].iter().product();
        }

        let actual_size = actual_dims[..ndim].iter().map(|&d| d as usize).product();

        Ok(SpectrumLayout {
            logical_dims,
            actual_dims,
            stride,
            ndim: ndim as u32,
            actual_size,
        })
    }

    /// Number of axes (1–3).
    pub fn ndim(&self) -> u32 {
        self.ndim
    }

    /// Total element count of the folded spectrum.
    pub fn actual_size(&self) -> usize {
        self.actual_size
    }

    /// Folded extents, padded with 1 beyond `ndim`.
    pub fn actual_dims(&self) -> [u32; MAX_DIMENSIONS] {
        self.actual_dims
    }

    /// Original real-space extents, padded with 1 beyond `ndim`.
    pub fn logical_dims(&self) -> [u32; MAX_DIMENSIONS] {
        self.logical_dims
    }

    /// Row-major strides over the folded extents, padded with 0.
    pub fn stride(&self) -> [u32; MAX_DIMENSIONS] {
        self.stride
    }

    /// Workgroup counts for the update dispatch: ceiling division of each
    /// folded extent by the `ndim`-specific group size, trailing axes 1.
    pub fn workgroup_counts(&self) -> [u32; MAX_DIMENSIONS] {
        let group = update_group_sizes(self.ndim);
        let mut counts = [1u32; MAX_DIMENSIONS];
        for i in 0..self.ndim as usize {
            counts[i] = self.actual_dims[i].div_ceil(group[i]);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_last_axis_only() {
        let l = SpectrumLayout::new(&[4, 4]).unwrap();
        assert_eq!(l.actual_dims(), [4, 3, 1]);
        assert_eq!(l.logical_dims(), [4, 4, 1]);
        assert_eq!(l.actual_size(), 12);
    }

    #[test]
    fn folding_invariant_matches_formula() {
        // actual_size == product(dims[..last]) * (dims[last]/2 + 1)
        for dims in [
            vec![1u32],
            vec![7],
            vec![8],
            vec![3, 5],
            vec![4, 4],
            vec![16, 1],
            vec![2, 3, 4],
            vec![5, 5, 5],
            vec![64, 64, 64],
        ] {
            let l = SpectrumLayout::new(&dims).unwrap();
            let last = *dims.last().unwrap() as usize;
            let lead: usize = dims[..dims.len() - 1].iter().map(|&d| d as usize).product();
            assert_eq!(l.actual_size(), lead * (last / 2 + 1), "dims {dims:?}");
        }
    }

    #[test]
    fn strides_are_row_major_over_folded_extents() {
        let l = SpectrumLayout::new(&[4, 4]).unwrap();
        assert_eq!(l.stride(), [3, 1, 0]);

        let l = SpectrumLayout::new(&[2, 3, 8]).unwrap();
        // actual = [2, 3, 5]; stride = [15, 5, 1]
        assert_eq!(l.actual_dims(), [2, 3, 5]);
        assert_eq!(l.stride(), [15, 5, 1]);
    }

    #[test]
    fn one_dimensional_layout() {
        let l = SpectrumLayout::new(&[16]).unwrap();
        assert_eq!(l.ndim(), 1);
        assert_eq!(l.actual_dims(), [9, 1, 1]);
        assert_eq!(l.stride(), [1, 0, 0]);
        assert_eq!(l.actual_size(), 9);
    }

    #[test]
    fn rejects_bad_dimensions() {
        assert!(matches!(SpectrumLayout::new(&[]), Err(AnnealError::BadDimensions)));
        assert!(matches!(
            SpectrumLayout::new(&[4, 4, 4, 4]),
            Err(AnnealError::BadDimensions)
        ));
        assert!(matches!(SpectrumLayout::new(&[4, 0]), Err(AnnealError::BadDimensions)));
    }

    #[test]
    fn group_size_table() {
        assert_eq!(update_group_sizes(1), [64, 1, 1]);
        assert_eq!(update_group_sizes(2), [16, 16, 1]);
        assert_eq!(update_group_sizes(3), [8, 8, 8]);
    }

    #[test]
    fn workgroup_counts_use_ceiling_division() {
        // 2D, group (16, 16): 100x100 real -> actual [100, 51].
        let l = SpectrumLayout::new(&[100, 100]).unwrap();
        assert_eq!(l.workgroup_counts(), [7, 4, 1]);

        // Exact multiples.
        let l = SpectrumLayout::new(&[64, 126]).unwrap();
        // actual = [64, 64] -> (4, 4, 1)
        assert_eq!(l.workgroup_counts(), [4, 4, 1]);

        // 1D, group 64: actual = 9 -> 1 group.
        let l = SpectrumLayout::new(&[16]).unwrap();
        assert_eq!(l.workgroup_counts(), [1, 1, 1]);

        // 3D, group (8, 8, 8).
        let l = SpectrumLayout::new(&[17, 8, 30]).unwrap();
        // actual = [17, 8, 16] -> (3, 1, 2)
        assert_eq!(l.workgroup_counts(), [3, 1, 2]);
    }
}
