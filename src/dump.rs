//! Debug-dump artifact emission (`SPEC_FULL.md` §4.8).
//!
//! Produces an INI-like `runtime.cfg` describing one job plus a flat
//! `metadata.txt`. A combined, multi-job dump walks every live job token a
//! [`crate::graph::Graph`] still holds via `Graph::live_jobs`, gated by a
//! once-flag so a process only ever emits the combined artifact once.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::graph::Graph;
use crate::job::Job;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("failed to write dump file: {0}")]
    Io(String),
}

static COMBINED_DUMP_EMITTED: AtomicBool = AtomicBool::new(false);

/// One job's `runtime.cfg`, in the section layout `SPEC_FULL.md` §4.8 names:
/// `COMMON`, `INPUT`, `HOST`, `ALLOCATE_PARTITION`, `OUTPUT`, and (when
/// profiling is on) `PROFILE`.
pub fn render_runtime_cfg(job: &Job<'_>) -> String {
    let mut out = String::new();

    writeln!(out, "[COMMON]").unwrap();
    writeln!(out, "job_id={}", job.id()).unwrap();
    writeln!(out, "grid_id={}", job.grid_id).unwrap();
    writeln!(out, "subgraph_count={}", job.graph.subgraph_count()).unwrap();

    writeln!(out, "\n[INPUT]").unwrap();
    for (id, dims) in &job.config.input_shapes {
        let dims_str = dims.iter().map(u32::to_string).collect::<Vec<_>>().join("x");
        writeln!(out, "tensor_{id}={dims_str}").unwrap();
    }

    writeln!(out, "\n[HOST]").unwrap();
    writeln!(out, "rodata_pa={:#x}", job.rodata_buf.base).unwrap();
    writeln!(out, "tcb_pa={:#x}", job.tcb_buf.base).unwrap();
    writeln!(out, "tcb_count={}", job.total_tcb_count()).unwrap();

    writeln!(out, "\n[ALLOCATE_PARTITION]").unwrap();
    writeln!(out, "partition={}", job.config.partition).unwrap();
    writeln!(out, "qos={}", job.config.qos).unwrap();

    writeln!(out, "\n[OUTPUT]").unwrap();
    for (id, size) in &job.resolved_output_sizes {
        writeln!(out, "tensor_{id}_size={size}").unwrap();
    }

    if job.config.enable_profiler {
        writeln!(out, "\n[PROFILE]").unwrap();
        writeln!(out, "enabled=1").unwrap();
    }

    out
}

/// A short, flat key=value companion file (`SPEC_FULL.md` §4.8 `metadata.txt`).
pub fn render_metadata(job: &Job<'_>) -> String {
    format!("job_id={}\nstate={:?}\nalloc_plan={:?}\n", job.id(), job.state(), job.alloc_plan)
}

/// Writes `runtime.cfg` and `metadata.txt` for a single job under `dir`.
pub fn dump_job(job: &Job<'_>, dir: &Path) -> Result<(), DumpError> {
    fs::create_dir_all(dir).map_err(|e| DumpError::Io(e.to_string()))?;
    fs::write(dir.join("runtime.cfg"), render_runtime_cfg(job)).map_err(|e| DumpError::Io(e.to_string()))?;
    fs::write(dir.join("metadata.txt"), render_metadata(job)).map_err(|e| DumpError::Io(e.to_string()))?;
    Ok(())
}

/// Emits one combined dump across every job still live on `graph`, but only
/// the first time it's called for the life of the process (`SPEC_FULL.md`
/// §4.8: "a combined dump happens at most once"). Returns whether this call
/// actually wrote anything.
pub fn dump_combined(graph: &Graph, dir: &Path) -> Result<bool, DumpError> {
    if COMBINED_DUMP_EMITTED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }
    fs::create_dir_all(dir).map_err(|e| DumpError::Io(e.to_string()))?;
    let tokens = graph.live_jobs();
    let mut combined = String::new();
    for token in &tokens {
        writeln!(combined, "job_id={} state={:?}", token.id, *token.state.lock().unwrap()).unwrap();
    }
    fs::write(dir.join("metadata.txt"), combined).map_err(|e| DumpError::Io(e.to_string()))?;
    Ok(true)
}
