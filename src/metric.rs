// metric.rs — scalar distance between a target correlation function and a
// reconstruction, via a two-stage kernel pipeline.
//
// Stage 1 (metric kernel): one squared difference per folded spectral
// element, written into a scratch buffer of `actual_size` floats.
//
// Stage 2 (reduce kernel): a tree reduction executed as a LOOP of
// dispatches, not a single one — workgroup-local reduction only collapses
// within a group, so each pass shrinks the active length from L to
// ceil(L / 64) until one group remains and the scalar sits at offset 0.
// Each pass reads what the previous pass wrote in the same buffer; wgpu
// inserts the write→read barrier between dispatches automatically (the
// explicit pipeline barrier of a raw Vulkan implementation).
//
// DURABLE METRIC
// ───────────────
// Everything that does not change between evaluations is built once at
// creation: the scratch buffer, the difference-stage bind groups (one per
// physical recon buffer, selected by whichever holds the readable state), and
// the complete reduction pass plan — per-pass length uniforms, bind
// groups, and group counts are all fixed once `actual_size` is known. A
// `distance` call encodes the pre-planned sequence into one command
// encoder, submits once, waits once, and reads back 4 bytes.

use wgpu::util::DeviceExt;

use crate::buffer::DeviceBuffer;
use crate::context::GpuContext;
use crate::corrfn::CorrelationFunction;
use crate::error::AnnealError;
use crate::image::SpectrumImage;
use crate::spectrum::METRIC_GROUP_SIZE;

/// Per-axis workgroup-count limit of a dispatch.
const MAX_GROUPS_PER_AXIS: u32 = 65_535;

// ---------------------------------------------------------------------------
// Kernel parameter block (must match MetricParams/ReduceParams in WGSL)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct MetricParams {
    length: u32,
    _pad: [u32; 3],
}

// ---------------------------------------------------------------------------
// Dispatch shaping
// ---------------------------------------------------------------------------

/// Split a linear workgroup count into (x, y, 1) when it exceeds the
/// per-axis limit. Shaders linearize via `wid.x + wid.y * nwg.x`.
fn split_workgroups(total: u32) -> (u32, u32, u32) {
    if total <= MAX_GROUPS_PER_AXIS {
        (total, 1, 1)
    } else {
        let y = total.div_ceil(MAX_GROUPS_PER_AXIS);
        let x = total.div_ceil(y);
        (x, y, 1)
    }
}

/// The (length, groups) sequence of reduction passes for an initial length.
/// Terminates exactly when a pass runs a single group.
fn reduction_pass_plan(initial: u32) -> Vec<(u32, u32)> {
    let mut plan = Vec::new();
    let mut length = initial;
    while length > 0 {
        let groups = length.div_ceil(METRIC_GROUP_SIZE);
        plan.push((length, groups));
        length = if groups == 1 { 0 } else { groups };
    }
    plan
}

// ---------------------------------------------------------------------------
// Metric
// ---------------------------------------------------------------------------

/// One pre-planned reduction pass: its dispatch shape and the bind group
/// carrying the scratch buffer plus this pass's length uniform.
struct ReducePass {
    dispatch: (u32, u32, u32),
    // The bind group keeps the pass's length uniform alive.
    bind_group: wgpu::BindGroup,
}

/// A bound distance computation between one target and one reconstruction.
///
/// Create once per (target, reconstruction) pairing and reuse across
/// evaluations. Takes two slots of the context's descriptor budget.
pub struct Metric<'ctx> {
    ctx: &'ctx GpuContext,
    recon_id: u64,
    scratch: DeviceBuffer,
    diff_dispatch: (u32, u32, u32),
    /// Difference-stage bind group per physical recon buffer, selected at
    /// `distance` time by whichever buffer holds the image's readable
    /// state.
    diff_bind_groups: [wgpu::BindGroup; 2],
    passes: Vec<ReducePass>,
}

impl<'ctx> Metric<'ctx> {
    /// Bind a target and a reconstruction for repeated distance evaluation.
    ///
    /// Both must come from `ctx` and agree on `actual_size`; anything else
    /// is [`AnnealError::IncompatibleImages`], rejected before any GPU
    /// allocation.
    pub fn new(
        ctx: &'ctx GpuContext,
        target: &CorrelationFunction<'ctx>,
        recon: &SpectrumImage<'ctx>,
    ) -> Result<Self, AnnealError> {
        if target.ctx_id() != ctx.id()
            || recon.ctx_id() != ctx.id()
            || target.actual_size() != recon.actual_size()
        {
            return Err(AnnealError::IncompatibleImages);
        }
        let n = recon.actual_size();

        let scratch = DeviceBuffer::new(
            ctx,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            (n * std::mem::size_of::<f32>()) as u64,
            "metric scratch",
        )?;

        let stage_params = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("metric params"),
            contents: bytemuck::bytes_of(&MetricParams { length: n as u32, _pad: [0; 3] }),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let diff_bind_groups = [0, 1].map(|i| {
            ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("metric bind group"),
                layout: &ctx.metric.bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: target.buffer().raw().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: recon.buffers()[i].raw().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: scratch.raw().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: stage_params.as_entire_binding(),
                    },
                ],
            })
        });

        let plan = reduction_pass_plan(n as u32);
        log::debug!("metric over {n} elements: {} reduction passes", plan.len());
        let passes = plan
            .iter()
            .map(|&(length, groups)| {
                let params = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("reduce params"),
                    contents: bytemuck::bytes_of(&MetricParams { length, _pad: [0; 3] }),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
                let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("reduce bind group"),
                    layout: &ctx.reduce.bgl,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: scratch.raw().as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: params.as_entire_binding(),
                        },
                    ],
                });
                ReducePass { dispatch: split_workgroups(groups), bind_group }
            })
            .collect();

        // Two logical descriptor sets (difference + reduction), reserved
        // after all fallible allocation so failure leaks nothing.
        ctx.desc_budget.acquire(2)?;

        Ok(Metric {
            ctx,
            recon_id: recon.id(),
            scratch,
            diff_dispatch: split_workgroups(plan[0].1),
            diff_bind_groups,
            passes,
        })
    }

    /// Evaluate the distance for the reconstruction's current state.
    ///
    /// `recon` must be the image bound at creation; it is synchronized
    /// first if it has an update in flight. The whole two-stage sequence
    /// is submitted as one command buffer, waited on once, and the scalar
    /// read back from scratch offset 0.
    pub fn distance(&self, recon: &mut SpectrumImage<'ctx>) -> Result<f32, AnnealError> {
        if recon.id() != self.recon_id {
            return Err(AnnealError::IncompatibleImages);
        }
        recon.synchronize();

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Metric::distance"),
            });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("squared difference"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.ctx.metric.pipeline);
            pass.set_bind_group(0, &self.diff_bind_groups[recon.current_index()], &[]);
            let (x, y, z) = self.diff_dispatch;
            pass.dispatch_workgroups(x, y, z);
        }

        for reduce in &self.passes {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("reduce"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.ctx.reduce.pipeline);
            pass.set_bind_group(0, &reduce.bind_group, &[]);
            let (x, y, z) = reduce.dispatch;
            pass.dispatch_workgroups(x, y, z);
        }

        let index = self.ctx.queue.submit(std::iter::once(encoder.finish()));
        self.ctx.wait_for(index);

        let bytes = self.scratch.read_at(self.ctx, 0, 4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Drop for Metric<'_> {
    fn drop(&mut self) {
        self.ctx.desc_budget.release(2);
    }
}
