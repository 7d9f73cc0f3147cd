//! Dynamic input/output shape support (`SPEC_FULL.md` §4.7).
//!
//! Input dims are written into the model-global-param buffer before
//! scheduling; output dims are read back from the same buffer once the job
//! completes, and each tensor's byte size is recomputed from its declared
//! element type.

use std::collections::HashMap;

use thiserror::Error;

use crate::graph::types::IoTensorDescriptor;
use crate::graph::Graph;
use crate::job::JobConfig;
use crate::mem::MemError;

/// Dims reserved per tensor's shape record in the global-param buffer: four
/// `u32` slots, unused trailing slots padded with `1` so a product over all
/// four is safe (this driver's own layout choice; see `DESIGN.md`).
pub const DIMS_PER_TENSOR: usize = 4;
const SHAPE_RECORD_LEN: usize = DIMS_PER_TENSOR * 4;

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error(transparent)]
    Mem(#[from] MemError),
    #[error("tensor {0} has a zero-sized dimension")]
    ZeroTensorSize(u32),
    #[error("tensor {tensor_id} declares {got} dims, more than the {max} supported")]
    TooManyDims { tensor_id: u32, got: usize, max: usize },
}

fn shape_offset(tensor_id: u32) -> usize {
    tensor_id as usize * SHAPE_RECORD_LEN
}

/// Writes every configured input shape into the global-param buffer bytes
/// before the job is scheduled (`SPEC_FULL.md` §4.7).
pub(crate) fn patch_input_shapes(
    _graph: &Graph,
    globalparam: &mut [u8],
    config: &JobConfig,
) -> Result<(), ShapeError> {
    for (&tensor_id, dims) in &config.input_shapes {
        if dims.len() > DIMS_PER_TENSOR {
            return Err(ShapeError::TooManyDims { tensor_id, got: dims.len(), max: DIMS_PER_TENSOR });
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(ShapeError::ZeroTensorSize(tensor_id));
        }
        let offset = shape_offset(tensor_id);
        if offset + SHAPE_RECORD_LEN > globalparam.len() {
            continue;
        }
        for k in 0..DIMS_PER_TENSOR {
            let dim = dims.get(k).copied().unwrap_or(1);
            let at = offset + k * 4;
            globalparam[at..at + 4].copy_from_slice(&dim.to_le_bytes());
        }
    }
    Ok(())
}

/// Reads back every `outputs_shape`-listed tensor's dims from the
/// global-param buffer and computes its resolved byte size. Safe to call
/// more than once per job: the result only depends on device-written bytes,
/// never on prior calls (`SPEC_FULL.md` §4.7 "idempotent per job").
pub fn resolve_output_sizes(
    globalparam: &[u8],
    outputs_shape: &[IoTensorDescriptor],
) -> Result<HashMap<u32, u32>, ShapeError> {
    let mut sizes = HashMap::new();
    for tensor in outputs_shape {
        let offset = shape_offset(tensor.id);
        if offset + SHAPE_RECORD_LEN > globalparam.len() {
            continue;
        }
        let mut total: u64 = 1;
        for k in 0..DIMS_PER_TENSOR {
            let at = offset + k * 4;
            let dim = u32::from_le_bytes(globalparam[at..at + 4].try_into().unwrap());
            if dim == 0 {
                return Err(ShapeError::ZeroTensorSize(tensor.id));
            }
            total *= dim as u64;
        }
        sizes.insert(tensor.id, (total * tensor.data_type.bytes_per_element() as u64) as u32);
    }
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::DataType;

    fn tensor(id: u32, data_type: DataType) -> IoTensorDescriptor {
        IoTensorDescriptor {
            id,
            size: 0,
            ref_section_iter: 0,
            offset_in_section: 0,
            scale: 1.0,
            zero_point: 0,
            data_type,
        }
    }

    #[test]
    fn patch_input_shapes_pads_unused_dims_with_one() {
        let mut config = JobConfig::new();
        config = config.input_shape(0, vec![2, 3]);
        let graph_stub_globalparam_len = DIMS_PER_TENSOR * 4;
        let mut globalparam = vec![0u8; graph_stub_globalparam_len];
        patch_input_shapes(&dummy_graph(), &mut globalparam, &config).unwrap();
        let dims: Vec<u32> = (0..DIMS_PER_TENSOR)
            .map(|k| u32::from_le_bytes(globalparam[k * 4..k * 4 + 4].try_into().unwrap()))
            .collect();
        assert_eq!(dims, vec![2, 3, 1, 1]);
    }

    #[test]
    fn patch_input_shapes_rejects_zero_dim() {
        let mut config = JobConfig::new();
        config = config.input_shape(0, vec![2, 0]);
        let mut globalparam = vec![0u8; DIMS_PER_TENSOR * 4];
        let err = patch_input_shapes(&dummy_graph(), &mut globalparam, &config).unwrap_err();
        assert!(matches!(err, ShapeError::ZeroTensorSize(0)));
    }

    #[test]
    fn resolve_output_sizes_computes_byte_size_from_dims() {
        let mut globalparam = vec![0u8; DIMS_PER_TENSOR * 4];
        for (k, dim) in [4u32, 5, 1, 1].iter().enumerate() {
            globalparam[k * 4..k * 4 + 4].copy_from_slice(&dim.to_le_bytes());
        }
        let outputs_shape = vec![tensor(0, DataType::F32)];
        let sizes = resolve_output_sizes(&globalparam, &outputs_shape).unwrap();
        assert_eq!(sizes[&0], 4 * 5 * 4);
    }

    #[test]
    fn resolve_output_sizes_rejects_zero_dim() {
        let globalparam = vec![0u8; DIMS_PER_TENSOR * 4];
        let outputs_shape = vec![tensor(0, DataType::F32)];
        let err = resolve_output_sizes(&globalparam, &outputs_shape).unwrap_err();
        assert!(matches!(err, ShapeError::ZeroTensorSize(0)));
    }

    fn dummy_graph() -> Graph {
        Graph {
            hw: Default::default(),
            text: Vec::new(),
            rodata: Vec::new(),
            descriptor: Vec::new(),
            globalparam: Vec::new(),
            weights: Vec::new(),
            bss_buckets: Vec::new(),
            subgraphs: Vec::new(),
            gm_config: None,
            segmmu_configs: Vec::new(),
            remap_entries: Vec::new(),
            next_job_id: std::sync::atomic::AtomicU64::new(0),
            jobs: std::sync::Mutex::new(Vec::new()),
        }
    }
}
