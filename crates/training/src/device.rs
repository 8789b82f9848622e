use std::{env, thread};

use candle_core::{utils::cuda_is_available, Device};

/// Picks CUDA device 0 when requested and usable, otherwise the CPU.
pub fn setup_device(use_cuda: bool, seed: u64) -> Device {
    let device = if use_cuda {
        if cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(device) => {
                    log::info!("device: using CUDA GPU #0");
                    device
                }
                Err(err) => {
                    log::warn!("cuda reported available but initialization failed: {err}");
                    Device::Cpu
                }
            }
        } else {
            log::warn!("--use_cuda=1 but this build has no usable CUDA backend; using CPU");
            Device::Cpu
        }
    } else {
        log::info!("device: using CPU");
        Device::Cpu
    };

    if let Err(err) = device.set_seed(seed) {
        log::debug!("device RNG not seeded: {err}");
    }
    device
}

/// Number of shards a parallel step splits a batch into.
///
/// `CUDA_VISIBLE_DEVICES` on accelerators, `CPU_NUM` (falling back to the
/// available parallelism) on the CPU.
pub fn num_devices(device: &Device) -> usize {
    if device.is_cuda() {
        let visible = env::var("CUDA_VISIBLE_DEVICES")
            .map(|value| value.split(',').filter(|id| !id.trim().is_empty()).count())
            .unwrap_or(0);
        return visible.max(1);
    }
    env::var("CPU_NUM")
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|count| *count > 0)
        .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
}

/// Worker threads used by the parallel executor; one on accelerators.
pub fn num_threads(device: &Device, requested: usize) -> usize {
    if device.is_cpu() {
        requested.max(1)
    } else {
        1
    }
}
