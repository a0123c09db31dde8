use super::error::{DispatchError, DispatchResult};
use super::GpuId;
use anyhow::{anyhow, Context};
use nvml_wrapper::Nvml;
use std::collections::BTreeMap;

/// Free memory per GPU, in MB
pub type FreeMemory = BTreeMap<GpuId, u64>;

/// Source of live per-device free-memory telemetry
pub trait GpuProber {
    /// All device indices visible on this host
    fn discover(&self) -> anyhow::Result<Vec<GpuId>>;

    /// Free memory of one device in MB
    fn free_memory_mb(&self, gpu: GpuId) -> anyhow::Result<u64>;

    /// Query every device in `gpu_ids`.
    ///
    /// Devices that fail are left out of the result with a warning. Only when
    /// no device answers does the whole call fail with
    /// [`DispatchError::ProbeUnavailable`].
    fn query(&self, gpu_ids: &[GpuId]) -> DispatchResult<FreeMemory> {
        let mut free = FreeMemory::new();
        let mut last_error = None;

        for &gpu in gpu_ids {
            match self.free_memory_mb(gpu) {
                Ok(mb) => {
                    free.insert(gpu, mb);
                }
                Err(e) => {
                    tracing::warn!("Failed to query GPU {}: {:#}", gpu, e);
                    last_error = Some(e);
                }
            }
        }

        if free.is_empty() {
            let reason = match last_error {
                Some(e) => format!("{e:#}"),
                None => "no GPUs configured".to_string(),
            };
            return Err(DispatchError::ProbeUnavailable(reason));
        }
        Ok(free)
    }
}

/// NVML-backed prober.
///
/// When NVML cannot be initialised the prober still exists but every query
/// fails, so the dispatcher keeps running without placing jobs.
pub struct NvmlProber {
    nvml: Option<Nvml>,
}

impl NvmlProber {
    pub fn init() -> Self {
        match Nvml::init() {
            Ok(nvml) => Self { nvml: Some(nvml) },
            Err(e) => {
                tracing::warn!(
                    "Failed to initialize NVML: {}. Running without GPU telemetry.",
                    e
                );
                Self { nvml: None }
            }
        }
    }

    fn nvml(&self) -> anyhow::Result<&Nvml> {
        self.nvml
            .as_ref()
            .ok_or_else(|| anyhow!("NVML is not initialized"))
    }
}

impl GpuProber for NvmlProber {
    fn discover(&self) -> anyhow::Result<Vec<GpuId>> {
        let count = self
            .nvml()?
            .device_count()
            .context("NVML device_count failed")?;
        Ok((0..count).collect())
    }

    fn free_memory_mb(&self, gpu: GpuId) -> anyhow::Result<u64> {
        let device = self
            .nvml()?
            .device_by_index(gpu)
            .with_context(|| format!("GPU {gpu} not found"))?;
        let memory = device
            .memory_info()
            .with_context(|| format!("Failed to read memory info for GPU {gpu}"))?;
        Ok(memory.free / 1024 / 1024)
    }
}

/// Restrict `requested` to devices that exist, or use every detected device when
/// nothing was requested.
pub fn resolve_gpu_ids(requested: Option<&[GpuId]>, detected: &[GpuId]) -> Vec<GpuId> {
    match requested {
        None => detected.to_vec(),
        Some(allowed) if detected.is_empty() => {
            // Nothing to validate against; keep the request and let probing report failures
            let mut ids = allowed.to_vec();
            ids.sort_unstable();
            ids.dedup();
            ids
        }
        Some(allowed) => {
            let (mut valid, invalid): (Vec<_>, Vec<_>) =
                allowed.iter().copied().partition(|idx| detected.contains(idx));
            if !invalid.is_empty() {
                tracing::warn!(
                    "Invalid GPU indices {:?} specified (only {} GPUs detected). These will be filtered out.",
                    invalid,
                    detected.len()
                );
            }
            valid.sort_unstable();
            valid.dedup();
            valid
        }
    }
}
