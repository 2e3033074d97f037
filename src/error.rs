// error.rs — crate-wide error type.
//
// One enum for every failure mode a caller can hit, implementing Display
// and std::error::Error by hand. Construction failures (adapter, device,
// pipeline, buffer) are all-or-nothing: partially acquired GPU objects are
// released by Drop on the early-return path, so a failed `new` never leaks.
// Precondition violations (wrong dimensionality, mismatched objects) are
// rejected before any GPU work is issued.

use std::fmt;

/// Errors from context creation, resource allocation, host transfer, and
/// metric evaluation.
#[derive(Debug)]
pub enum AnnealError {
    /// Dimensions are empty, longer than 3 axes, contain a zero extent, or
    /// a host array's length does not match the layout they imply.
    BadDimensions,
    /// Object dimensionality does not match its context (or an update's
    /// coordinate does not match its image).
    DimensionMismatch { expected: u32, got: u32 },
    /// No GPU adapter was found, or none supports compute shaders.
    NoSuitableAdapter,
    /// wgpu device request failed (driver issue, unsupported limits).
    DeviceRequest(wgpu::RequestDeviceError),
    /// Compute pipeline compilation failed (named pipeline, driver message).
    PipelineCreation { pipeline: &'static str, message: String },
    /// Device buffer allocation failed. Hard failure — no fallback to a
    /// looser memory class is attempted.
    BufferAllocation { label: &'static str, message: String },
    /// A host<->device transfer failed. Buffer contents are unspecified
    /// after this error.
    Transfer(String),
    /// The context's fixed descriptor budget is exhausted. The pool never
    /// grows; destroy an image or metric first.
    DescriptorPoolExhausted { capacity: u32 },
    /// Metric preconditions violated: target and reconstruction come from
    /// different contexts, have different sizes, or `distance` was handed
    /// an image other than the one bound at creation.
    IncompatibleImages,
    /// A wait on submitted GPU work did not complete cleanly.
    DeviceLost,
}

impl fmt::Display for AnnealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnealError::BadDimensions => {
                write!(f, "dimensions must have 1..=3 nonzero extents")
            }
            AnnealError::DimensionMismatch { expected, got } => {
                write!(f, "dimension mismatch: expected {expected}, got {got}")
            }
            AnnealError::NoSuitableAdapter => {
                write!(f, "no compute-capable GPU adapter found")
            }
            AnnealError::DeviceRequest(e) => write!(f, "device request failed: {e}"),
            AnnealError::PipelineCreation { pipeline, message } => {
                write!(f, "cannot create {pipeline} pipeline: {message}")
            }
            AnnealError::BufferAllocation { label, message } => {
                write!(f, "cannot allocate buffer '{label}': {message}")
            }
            AnnealError::Transfer(msg) => write!(f, "host transfer failed: {msg}"),
            AnnealError::DescriptorPoolExhausted { capacity } => {
                write!(f, "descriptor pool exhausted (capacity {capacity} sets)")
            }
            AnnealError::IncompatibleImages => write!(f, "incompatible images"),
            AnnealError::DeviceLost => write!(f, "GPU wait failed; device lost"),
        }
    }
}

impl std::error::Error for AnnealError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AnnealError::DeviceRequest(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_dimension_mismatch() {
        let e = AnnealError::DimensionMismatch { expected: 2, got: 3 };
        assert_eq!(e.to_string(), "dimension mismatch: expected 2, got 3");
    }

    #[test]
    fn display_pool_exhausted_names_capacity() {
        let e = AnnealError::DescriptorPoolExhausted { capacity: 10 };
        assert!(e.to_string().contains("10"));
    }
}
