//! Crate-wide error type.
//!
//! Each component owns a narrow error enum (mirroring the error-kind table in
//! `SPEC_FULL.md` §7); this module unifies them the way the teacher crate's
//! `error::Error` unifies `DeviceError`/`KernelError`/`PlatformError`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Binary(#[from] crate::binary::BinError),
    #[error(transparent)]
    Mem(#[from] crate::mem::MemError),
    #[error(transparent)]
    Job(#[from] crate::job::JobError),
    #[error(transparent)]
    Device(#[from] crate::device::DeviceError),
    #[error(transparent)]
    Shape(#[from] crate::dynshape::ShapeError),
    #[error(transparent)]
    Dump(#[from] crate::dump::DumpError),
}
