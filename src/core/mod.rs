pub mod error;
pub mod gpu;
pub mod job;
pub mod launcher;
pub mod ledger;
pub mod scheduler;
pub mod source;
pub mod status;

pub type GpuId = u32;
pub type JobId = u32;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
