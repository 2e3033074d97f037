// image.rs — the mutable reconstruction image in Fourier space.
//
// A `SpectrumImage` holds the candidate microstructure as a folded
// half-spectrum of interleaved (re, im) float pairs, resident on the GPU.
// The annealing loop perturbs it one voxel at a time through
// `update_fft`, which dispatches the incremental-update kernel instead of
// recomputing a full transform.
//
// THE BUFFER-ROLE PROBLEM
// ────────────────────────
// Accept/reject semantics need a snapshot to fall back to. The image owns
// exactly TWO device buffers and a role map {input, output, saved} of
// indices into them:
//
//   input  — what the next update reads; always the latest readable state
//   output — what the next update writes
//   saved  — the committed baseline for rollback
//
// `store_state` and `rollback` are pure index permutations (see
// `BufferRoles`); the invariant `saved != output` holds at every call
// boundary by construction, so no aliasing check can fire at runtime.
// After an update, `input` is re-pointed at `output`: further updates are
// in-place until the caller commits or rolls back.
//
// The update kernel itself is in-place over a single storage buffer. When
// a dispatch must read a buffer other than the one it writes (first update
// after `new` or after `store_state`), the encoder prepends a GPU-side
// buffer copy input→output — same element count, trivial bandwidth next to
// the dispatch itself.
//
// SYNCHRONIZATION DISCIPLINE (fenced)
// ────────────────────────────────────
// `update_fft` submits and returns immediately, holding the submission
// index as a fence. Every entry point that observes image memory — another
// update, `get`, `store_state`, `rollback`, `Metric::distance` — waits on
// and clears that fence first. The guarantee: no two dispatches are ever
// in flight against the same buffer without an intervening wait. The host
// can therefore prepare the next perturbation while the GPU finishes the
// current one.

use crate::buffer::DeviceBuffer;
use crate::context::GpuContext;
use crate::error::AnnealError;
use crate::spectrum::SpectrumLayout;

// ---------------------------------------------------------------------------
// Kernel parameter block (must match UpdateParams in update.wgsl)
// ---------------------------------------------------------------------------

/// Uniform parameters of the update kernel. Extents and strides are fixed
/// at image creation; `point` and `c` are rewritten per update call.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct UpdateParams {
    actual_dims: [u32; 4],
    logical_dims: [u32; 4],
    stride: [u32; 4],
    point: [u32; 4],
    c: f32,
    ndim: u32,
    _pad: [u32; 2],
}

impl UpdateParams {
    fn new(layout: &SpectrumLayout) -> Self {
        let pad4 = |a: [u32; 3]| [a[0], a[1], a[2], 0];
        UpdateParams {
            actual_dims: pad4(layout.actual_dims()),
            logical_dims: pad4(layout.logical_dims()),
            stride: pad4(layout.stride()),
            point: [0; 4],
            c: 0.0,
            ndim: layout.ndim(),
            _pad: [0; 2],
        }
    }
}

// ---------------------------------------------------------------------------
// Buffer roles
// ---------------------------------------------------------------------------

/// Which of the two physical buffers plays which role. All transitions are
/// index permutations that preserve `saved != output`.
///
/// `input` always points at the buffer holding the latest readable state:
/// the upload after creation, the written buffer after an update, the
/// committed baseline after `store`, the restored baseline after
/// `rollback`. Reads (`get`, the metric) therefore go through `input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferRoles {
    input: usize,
    output: usize,
    saved: usize,
}

impl BufferRoles {
    /// Fresh image: buffer 0 is both input and baseline, buffer 1 receives
    /// the first update.
    fn new() -> Self {
        BufferRoles { input: 0, output: 1, saved: 0 }
    }

    /// After a dispatch the written buffer becomes the next read source.
    fn commit_update(&mut self) {
        self.input = self.output;
        debug_assert_ne!(self.saved, self.output);
    }

    /// Accept: the current output becomes the new baseline; the old
    /// baseline buffer is recycled as the next output.
    fn store(&mut self) {
        std::mem::swap(&mut self.saved, &mut self.output);
        self.input = self.saved;
        debug_assert_ne!(self.saved, self.output);
    }

    /// Reject: discard the current output and restore the baseline as both
    /// input and output for the next attempt.
    fn rollback(&mut self) {
        std::mem::swap(&mut self.saved, &mut self.output);
        self.input = self.output;
        debug_assert_ne!(self.saved, self.output);
    }
}

// ---------------------------------------------------------------------------
// SpectrumImage
// ---------------------------------------------------------------------------

/// The mutable candidate microstructure in folded Fourier representation.
///
/// Created from host real/imaginary half-spectrum arrays (typically the
/// output of [`crate::fft::forward_real`]); perturbed with
/// [`SpectrumImage::update_fft`]; committed or reverted with
/// [`SpectrumImage::store_state`] / [`SpectrumImage::rollback`]; read back
/// with [`SpectrumImage::get`].
///
/// Takes one slot of the context's descriptor budget for its lifetime.
pub struct SpectrumImage<'ctx> {
    ctx: &'ctx GpuContext,
    id: u64,
    layout: SpectrumLayout,
    params: UpdateParams,
    buffers: [DeviceBuffer; 2],
    roles: BufferRoles,
    params_buf: wgpu::Buffer,
    /// One update bind group per physical buffer (the kernel is in-place,
    /// so the binding is just "which buffer", chosen by the output role).
    bind_groups: [wgpu::BindGroup; 2],
    ngroups: [u32; 3],
    /// Fence: the submission index of an in-flight update, if any.
    pending: Option<wgpu::SubmissionIndex>,
}

impl<'ctx> SpectrumImage<'ctx> {
    /// Upload a host half-spectrum and allocate the image's GPU resources.
    ///
    /// `real` and `imag` must each hold `actual_size` values for the folded
    /// layout of `dims` (see [`SpectrumLayout`]); `dims.len()` must equal
    /// the context's dimensionality.
    pub fn new(
        ctx: &'ctx GpuContext,
        real: &[f32],
        imag: &[f32],
        dims: &[u32],
    ) -> Result<Self, AnnealError> {
        if dims.len() as u32 != ctx.ndim() {
            return Err(AnnealError::DimensionMismatch {
                expected: ctx.ndim(),
                got: dims.len() as u32,
            });
        }
        let layout = SpectrumLayout::new(dims)?;
        let n = layout.actual_size();
        if real.len() != n || imag.len() != n {
            return Err(AnnealError::BadDimensions);
        }

        // Interleave (re, im) pairs for the array<vec2<f32>> storage view.
        let mut data = Vec::with_capacity(2 * n);
        for i in 0..n {
            data.push(real[i]);
            data.push(imag[i]);
        }
        let bytes: &[u8] = bytemuck::cast_slice(&data);

        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let size = (n * 2 * std::mem::size_of::<f32>()) as u64;
        let buffers = [
            DeviceBuffer::new(ctx, usage, size, "spectrum A")?,
            DeviceBuffer::new(ctx, usage, size, "spectrum B")?,
        ];
        // Both buffers start from the same state so the first update may
        // read either.
        buffers[0].write(ctx, bytes)?;
        buffers[1].write(ctx, bytes)?;

        let params = UpdateParams::new(&layout);
        let params_buf = {
            use wgpu::util::DeviceExt;
            ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("update params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
        };

        let bind_groups = [0, 1].map(|i| {
            ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("update bind group"),
                layout: &ctx.update.bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: buffers[i].raw().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: params_buf.as_entire_binding(),
                    },
                ],
            })
        });

        // Reserve the descriptor slot last: everything fallible is done, so
        // a failure here leaks nothing and a success is final.
        ctx.desc_budget.acquire(1)?;

        Ok(SpectrumImage {
            ctx,
            id: ctx.next_resource_id(),
            ngroups: layout.workgroup_counts(),
            layout,
            params,
            buffers,
            roles: BufferRoles::new(),
            params_buf,
            bind_groups,
            pending: None,
        })
    }

    /// Folded layout of this image.
    pub fn layout(&self) -> &SpectrumLayout {
        &self.layout
    }

    /// Element count of the folded spectrum.
    pub fn actual_size(&self) -> usize {
        self.layout.actual_size()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn ctx_id(&self) -> u64 {
        self.ctx.id()
    }

    pub(crate) fn buffers(&self) -> &[DeviceBuffer; 2] {
        &self.buffers
    }

    /// Index of the buffer currently holding the readable state.
    pub(crate) fn current_index(&self) -> usize {
        self.roles.input
    }

    /// Wait for an in-flight update to finish and clear the fence. Called
    /// from every entry point that touches image memory; also available to
    /// callers that want an explicit barrier.
    pub fn synchronize(&mut self) {
        if let Some(index) = self.pending.take() {
            self.ctx.wait_for(index);
        }
    }

    /// Apply a single-voxel perturbation of magnitude `delta` at real-space
    /// coordinate `coord`, directly in Fourier space.
    ///
    /// Submits one dispatch and returns without waiting; the image's fence
    /// tracks completion. Rejected before any GPU work when `coord` has the
    /// wrong dimensionality.
    pub fn update_fft(&mut self, coord: &[u32], delta: f32) -> Result<(), AnnealError> {
        let ndim = self.layout.ndim();
        if coord.len() as u32 != ndim {
            return Err(AnnealError::DimensionMismatch {
                expected: ndim,
                got: coord.len() as u32,
            });
        }

        // Synchronize-before-reuse: the previous dispatch may still be
        // writing the buffer this one reads.
        self.synchronize();

        self.params.point = [0; 4];
        self.params.point[..coord.len()].copy_from_slice(coord);
        self.params.c = delta;
        self.ctx
            .queue
            .write_buffer(&self.params_buf, 0, bytemuck::bytes_of(&self.params));

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("SpectrumImage::update_fft"),
            });

        // First update after new/store_state reads a different buffer than
        // it writes; seed the output with a GPU-side copy, then run the
        // in-place kernel on it.
        if self.roles.input != self.roles.output {
            encoder.copy_buffer_to_buffer(
                self.buffers[self.roles.input].raw(),
                0,
                self.buffers[self.roles.output].raw(),
                0,
                self.buffers[self.roles.output].size(),
            );
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("cf update"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.ctx.update.pipeline);
            pass.set_bind_group(0, &self.bind_groups[self.roles.output], &[]);
            pass.dispatch_workgroups(self.ngroups[0], self.ngroups[1], self.ngroups[2]);
        }

        let index = self.ctx.queue.submit(std::iter::once(encoder.finish()));
        self.pending = Some(index);
        self.roles.commit_update();
        Ok(())
    }

    /// Commit the current state as the new rollback baseline (accept a
    /// Monte-Carlo move).
    pub fn store_state(&mut self) {
        self.synchronize();
        self.roles.store();
    }

    /// Discard updates since the last [`SpectrumImage::store_state`] (or
    /// creation) and restore that baseline (reject a Monte-Carlo move).
    pub fn rollback(&mut self) {
        self.synchronize();
        self.roles.rollback();
    }

    /// Download the current spectrum as separate real/imaginary arrays.
    pub fn get(&mut self) -> Result<(Vec<f32>, Vec<f32>), AnnealError> {
        self.synchronize();
        let bytes = self.buffers[self.roles.input].read(self.ctx)?;
        let pairs: &[f32] = bytemuck::cast_slice(&bytes);

        let n = self.layout.actual_size();
        let mut real = Vec::with_capacity(n);
        let mut imag = Vec::with_capacity(n);
        for pair in pairs.chunks_exact(2) {
            real.push(pair[0]);
            imag.push(pair[1]);
        }
        Ok((real, imag))
    }
}

impl Drop for SpectrumImage<'_> {
    fn drop(&mut self) {
        // Never free buffers out from under an in-flight dispatch.
        if let Some(index) = self.pending.take() {
            self.ctx.wait_for(index);
        }
        self.ctx.desc_budget.release(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_params_matches_wgsl_layout() {
        // Four vec4<u32> + f32 + u32 + 2 pad words = 80 bytes.
        assert_eq!(std::mem::size_of::<UpdateParams>(), 80);
    }

    #[test]
    fn update_params_pads_unused_axes() {
        let layout = SpectrumLayout::new(&[4, 4]).unwrap();
        let p = UpdateParams::new(&layout);
        assert_eq!(p.actual_dims, [4, 3, 1, 0]);
        assert_eq!(p.logical_dims, [4, 4, 1, 0]);
        assert_eq!(p.stride, [3, 1, 0, 0]);
        assert_eq!(p.ndim, 2);
    }

    // ---- Role permutations -------------------------------------------------
    //
    // These mirror the annealing loop's accept/reject traffic. The
    // `saved != output` invariant must hold after every transition.

    #[test]
    fn fresh_roles_satisfy_invariant() {
        let r = BufferRoles::new();
        assert_eq!(r.input, r.saved);
        assert_ne!(r.saved, r.output);
    }

    #[test]
    fn update_pins_input_to_output() {
        let mut r = BufferRoles::new();
        r.commit_update();
        assert_eq!(r.input, r.output);
        assert_ne!(r.saved, r.output);
        // Further updates stay in place.
        r.commit_update();
        assert_eq!(r.input, r.output);
    }

    #[test]
    fn store_promotes_output_to_baseline() {
        let mut r = BufferRoles::new();
        r.commit_update(); // input=1, output=1, saved=0
        r.store(); // accept
        assert_eq!(r.saved, 1);
        assert_eq!(r.output, 0);
        assert_eq!(r.input, 1);
        assert_ne!(r.saved, r.output);
    }

    #[test]
    fn rollback_restores_baseline() {
        let mut r = BufferRoles::new();
        r.commit_update();
        r.store(); // baseline = buffer 1
        r.commit_update(); // speculative update into buffer 0
        r.rollback(); // reject it
        // Readable state is the baseline again.
        assert_eq!(r.output, 1);
        assert_eq!(r.input, 1);
        assert_eq!(r.saved, 0);
    }

    #[test]
    fn repeated_store_rollback_never_alias() {
        let mut r = BufferRoles::new();
        for i in 0..32 {
            if i % 3 == 0 {
                r.commit_update();
            } else if i % 3 == 1 {
                r.store();
            } else {
                r.rollback();
            }
            assert_ne!(r.saved, r.output, "aliased after step {i}");
            assert!(r.input == r.saved || r.input == r.output);
        }
    }
}
