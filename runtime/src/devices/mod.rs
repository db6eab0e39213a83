//! Built-in device families.
//!
//! - `CPU` - interpreter without workgroups, one instance
//! - `EMU` - interpreter emulating a GPU (locals, shared memory, tensor cores);
//!   any index, and one compiled kernel serves the whole family
//! - `DISK` - host memory only, usable from any thread, not counted in memory use

pub mod interpreter;

use std::sync::Arc;

use kiln_device::{Backend, Device, DeviceId, DeviceRegistry, FamilyCaps, HostAllocator, Result};
use kiln_schedule::KernelCaps;

use crate::config::RuntimeConfig;
use interpreter::{InterpreterCompiler, InterpreterProgram, InterpreterRenderer};

pub const CPU_CAPS: FamilyCaps = FamilyCaps { shares_binaries: false, pass_through: false, multi_instance: false };
pub const EMU_CAPS: FamilyCaps = FamilyCaps { shares_binaries: true, pass_through: false, multi_instance: true };
pub const DISK_CAPS: FamilyCaps = FamilyCaps { shares_binaries: false, pass_through: true, multi_instance: true };

/// Renderer, compiler and loader of the reference interpreter for `caps`.
pub fn interpreter_backend(caps: KernelCaps) -> Backend {
    let local_max = caps.local_max;
    Backend::new(
        Arc::new(InterpreterRenderer::new(caps)),
        Arc::new(InterpreterCompiler),
        Arc::new(move |entry: &str, lib: &[u8]| {
            Ok(Box::new(InterpreterProgram::load(entry, lib, local_max)?) as Box<dyn kiln_device::Program>)
        }),
    )
}

pub fn cpu_device(id: &DeviceId) -> Result<Device> {
    let name = id.to_string();
    let allocator = Box::new(HostAllocator::new(name.clone()));
    Ok(Device::new(name, "CPU", allocator, CPU_CAPS, Some(interpreter_backend(KernelCaps::cpu()))))
}

pub fn emu_device(id: &DeviceId) -> Result<Device> {
    let name = id.to_string();
    let allocator = Box::new(HostAllocator::new(name.clone()));
    Ok(Device::new(name, "EMU", allocator, EMU_CAPS, Some(interpreter_backend(KernelCaps::gpu("EMU")))))
}

pub fn disk_device(id: &DeviceId) -> Result<Device> {
    let name = id.to_string();
    let allocator = Box::new(HostAllocator::new(name.clone()));
    Ok(Device::new(name, "DISK", allocator, DISK_CAPS, None))
}

fn with_lru(open: fn(&DeviceId) -> Result<Device>, lru: bool) -> impl Fn(&DeviceId) -> Result<Device> + Send + Sync {
    move |id| {
        let device = open(id)?;
        device.allocator().set_enabled(lru);
        Ok(device)
    }
}

/// Registry with the built-in families. Opened devices follow `config.lru`.
pub fn builtin_registry(config: &RuntimeConfig) -> DeviceRegistry {
    DeviceRegistry::builder()
        .family("CPU", CPU_CAPS, with_lru(cpu_device, config.lru))
        .family("EMU", EMU_CAPS, with_lru(emu_device, config.lru))
        .family("DISK", DISK_CAPS, with_lru(disk_device, config.lru))
        .preferred(config.preferred_device.clone())
        .build()
}
