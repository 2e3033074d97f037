// corrfn.rs — the immutable target correlation function.
//
// One device-local buffer of scalar floats: the known two-point correlation
// spectrum the reconstruction is annealed towards. Uploaded once at
// creation, then only ever read by the metric kernel. Uses the same
// last-axis folding rule as the reconstruction image, so a matching pair
// always agrees on `actual_size`.

use crate::buffer::DeviceBuffer;
use crate::context::GpuContext;
use crate::error::AnnealError;
use crate::spectrum::SpectrumLayout;

/// An immutable device-resident target spectrum.
pub struct CorrelationFunction<'ctx> {
    ctx: &'ctx GpuContext,
    layout: SpectrumLayout,
    buffer: DeviceBuffer,
}

impl<'ctx> CorrelationFunction<'ctx> {
    /// Upload a host-computed target correlation spectrum.
    ///
    /// `data` must hold `actual_size` floats for the folded layout of
    /// `dims`; `dims.len()` must equal the context's dimensionality.
    pub fn new(
        ctx: &'ctx GpuContext,
        data: &[f32],
        dims: &[u32],
    ) -> Result<Self, AnnealError> {
        if dims.len() as u32 != ctx.ndim() {
            return Err(AnnealError::DimensionMismatch {
                expected: ctx.ndim(),
                got: dims.len() as u32,
            });
        }
        let layout = SpectrumLayout::new(dims)?;
        if data.len() != layout.actual_size() {
            return Err(AnnealError::BadDimensions);
        }

        let buffer = DeviceBuffer::new(
            ctx,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            (data.len() * std::mem::size_of::<f32>()) as u64,
            "correlation target",
        )?;
        buffer.write(ctx, bytemuck::cast_slice(data))?;

        Ok(CorrelationFunction { ctx, layout, buffer })
    }

    /// Folded layout of the target.
    pub fn layout(&self) -> &SpectrumLayout {
        &self.layout
    }

    /// Element count of the folded spectrum.
    pub fn actual_size(&self) -> usize {
        self.layout.actual_size()
    }

    pub(crate) fn ctx_id(&self) -> u64 {
        self.ctx.id()
    }

    pub(crate) fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }
}
