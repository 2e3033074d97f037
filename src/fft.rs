// fft.rs — host-side real-to-complex transform pair.
//
// The GPU core consumes and produces folded half-spectra; this module is
// the boundary that turns a real spatial field into that representation
// and back. N-dimensional transforms are built from rustfft 1D plans:
// forward runs the last (folded) axis first and the remaining axes over
// the folded array; inverse mirrors it, expanding the last axis by
// Hermitian symmetry before the final complex-to-real pass.
//
// Conventions: forward is unnormalized; inverse divides by the logical
// element count, so `inverse_real(forward_real(x)) == x` within
// floating-point tolerance. Both are deterministic and side-effect-free.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::AnnealError;
use crate::spectrum::SpectrumLayout;

/// Transform a real field of extents `dims` into its folded half-spectrum,
/// returned as separate real/imaginary arrays of `actual_size` values.
///
/// `data` is row-major with `product(dims)` elements.
pub fn forward_real(data: &[f32], dims: &[u32]) -> Result<(Vec<f32>, Vec<f32>), AnnealError> {
    let layout = SpectrumLayout::new(dims)?;
    let ndim = dims.len();
    let logical_size: usize = dims.iter().map(|&d| d as usize).product();
    if data.len() != logical_size {
        return Err(AnnealError::BadDimensions);
    }

    let n_last = dims[ndim - 1] as usize;
    let folded_last = n_last / 2 + 1;
    let rows = logical_size / n_last;

    let mut planner = FftPlanner::<f32>::new();

    // Last axis: real lines in, half-spectra out.
    let fft_last = planner.plan_fft_forward(n_last);
    let mut folded = vec![Complex::new(0.0f32, 0.0); rows * folded_last];
    let mut line = vec![Complex::new(0.0f32, 0.0); n_last];
    for r in 0..rows {
        for (k, v) in line.iter_mut().enumerate() {
            *v = Complex::new(data[r * n_last + k], 0.0);
        }
        fft_last.process(&mut line);
        folded[r * folded_last..(r + 1) * folded_last].copy_from_slice(&line[..folded_last]);
    }

    // Remaining axes: full complex transforms over the folded array.
    for axis in 0..ndim - 1 {
        transform_axis(&mut planner, &mut folded, &layout, axis, true);
    }

    let real = folded.iter().map(|c| c.re).collect();
    let imag = folded.iter().map(|c| c.im).collect();
    Ok((real, imag))
}

/// Transform a folded half-spectrum back into a real field of extents
/// `dims`. Output is normalized by `product(dims)`.
pub fn inverse_real(
    real: &[f32],
    imag: &[f32],
    dims: &[u32],
) -> Result<Vec<f32>, AnnealError> {
    let layout = SpectrumLayout::new(dims)?;
    let ndim = dims.len();
    let n = layout.actual_size();
    if real.len() != n || imag.len() != n {
        return Err(AnnealError::BadDimensions);
    }

    let logical_size: usize = dims.iter().map(|&d| d as usize).product();
    let n_last = dims[ndim - 1] as usize;
    let folded_last = n_last / 2 + 1;
    let rows = logical_size / n_last;

    let mut folded: Vec<Complex<f32>> = real
        .iter()
        .zip(imag)
        .map(|(&re, &im)| Complex::new(re, im))
        .collect();

    let mut planner = FftPlanner::<f32>::new();

    // Undo the leading-axis transforms first.
    for axis in 0..ndim - 1 {
        transform_axis(&mut planner, &mut folded, &layout, axis, false);
    }

    // Last axis: expand each half-spectrum line by Hermitian symmetry and
    // run a full inverse transform; the imaginary parts cancel.
    let fft_last = planner.plan_fft_inverse(n_last);
    let scale = 1.0 / logical_size as f32;
    let mut out = vec![0.0f32; logical_size];
    let mut line = vec![Complex::new(0.0f32, 0.0); n_last];
    for r in 0..rows {
        line[..folded_last].copy_from_slice(&folded[r * folded_last..(r + 1) * folded_last]);
        for k in folded_last..n_last {
            line[k] = line[n_last - k].conj();
        }
        fft_last.process(&mut line);
        for k in 0..n_last {
            out[r * n_last + k] = line[k].re * scale;
        }
    }
    Ok(out)
}

/// In-place complex FFT along one leading axis of the folded array.
///
/// Lines along `axis` are strided in the row-major folded layout; each is
/// gathered into a contiguous scratch, transformed, and scattered back.
fn transform_axis(
    planner: &mut FftPlanner<f32>,
    folded: &mut [Complex<f32>],
    layout: &SpectrumLayout,
    axis: usize,
    forward: bool,
) {
    let len = layout.actual_dims()[axis] as usize;
    let stride = layout.stride()[axis] as usize;
    let fft = if forward {
        planner.plan_fft_forward(len)
    } else {
        planner.plan_fft_inverse(len)
    };

    let mut line = vec![Complex::new(0.0f32, 0.0); len];
    let block = stride * len;
    let num_blocks = folded.len() / block;
    for b in 0..num_blocks {
        for off in 0..stride {
            let base = b * block + off;
            for (k, v) in line.iter_mut().enumerate() {
                *v = folded[base + k * stride];
            }
            fft.process(&mut line);
            for (k, v) in line.iter().enumerate() {
                folded[base + k * stride] = *v;
            }
        }
    }
}
