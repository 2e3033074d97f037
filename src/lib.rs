// anneal-gpu: GPU kernel for simulated-annealing reconstruction of material
// microstructures from two-point correlation functions.
//
// The annealing loop keeps the candidate image in Fourier space on the GPU
// and perturbs it one voxel at a time with a closed-form incremental DFT
// update — no full transform per move. A metric pipeline measures the
// distance to a target correlation spectrum through a squared-difference
// kernel and a multi-pass tree reduction.

//! GPU-accelerated annealing kernel for microstructure reconstruction.
//!
//! The building blocks, in dependency order:
//!
//! - [`GpuContext`] — device, queue, and the three compiled compute
//!   pipelines (update, metric, reduce). One per process.
//! - [`SpectrumImage`] — the mutable candidate, stored as a folded
//!   half-spectrum; perturbed in place via [`SpectrumImage::update_fft`],
//!   with [`SpectrumImage::store_state`] / [`SpectrumImage::rollback`]
//!   implementing Monte-Carlo accept/reject.
//! - [`CorrelationFunction`] — the immutable target spectrum.
//! - [`Metric`] — a durable pairing of target and candidate that yields a
//!   scalar distance per evaluation.
//! - [`fft`] — the host-side real-to-complex boundary used to produce
//!   spectra from real fields and back.
//!
//! ```no_run
//! use anneal_gpu::{fft, CorrelationFunction, GpuContext, Metric, SpectrumImage};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dims = [64u32, 64];
//!     let field = vec![0.0f32; 64 * 64]; // initial candidate microstructure
//!     let target = vec![0.0f32; 64 * 33]; // precomputed target spectrum
//!
//!     let ctx = GpuContext::new(2, false)?;
//!     let (re, im) = fft::forward_real(&field, &dims)?;
//!     let mut image = SpectrumImage::new(&ctx, &re, &im, &dims)?;
//!     let corrfn = CorrelationFunction::new(&ctx, &target, &dims)?;
//!     let metric = Metric::new(&ctx, &corrfn, &image)?;
//!
//!     let mut best = metric.distance(&mut image)?;
//!     for step in 0..10_000u32 {
//!         let coord = [step % 64, (step / 64) % 64];
//!         image.update_fft(&coord, 1.0)?;
//!         let d = metric.distance(&mut image)?;
//!         if d < best {
//!             best = d;
//!             image.store_state(); // accept
//!         } else {
//!             image.rollback(); // reject
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod context;
pub mod corrfn;
pub mod error;
pub mod fft;
pub mod image;
pub mod metric;
pub mod spectrum;

pub use buffer::DeviceBuffer;
pub use context::GpuContext;
pub use corrfn::CorrelationFunction;
pub use error::AnnealError;
pub use image::SpectrumImage;
pub use metric::Metric;
pub use spectrum::SpectrumLayout;
