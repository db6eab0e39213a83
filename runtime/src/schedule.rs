//! Lowering and running scheduled work items.

use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_device::Buffer;
use kiln_ir::{KernelAst, VarVals};
use snafu::{ResultExt, ensure};
use tracing::trace;

use crate::error::{ArgumentCountSnafu, DeviceSnafu, LoweringSnafu, MixedDevicesSnafu, Result};
use crate::jit::Launcher;
use crate::runner::{BufferCopy, Runner};
use crate::runtime::Runtime;

#[derive(Debug, Clone)]
pub enum ScheduleOp {
    Kernel(Arc<KernelAst>),
    /// `outputs[0] <- inputs[0]`, possibly across devices.
    Copy,
}

#[derive(Clone)]
pub struct ScheduleItem {
    pub op: ScheduleOp,
    pub outputs: Vec<Buffer>,
    pub inputs: Vec<Buffer>,
}

impl ScheduleItem {
    pub fn kernel(ast: Arc<KernelAst>, outputs: Vec<Buffer>, inputs: Vec<Buffer>) -> Self {
        Self { op: ScheduleOp::Kernel(ast), outputs, inputs }
    }

    pub fn copy(dst: Buffer, src: Buffer) -> Self {
        Self { op: ScheduleOp::Copy, outputs: vec![dst], inputs: vec![src] }
    }

    /// Launch arguments: outputs first.
    pub fn buffers(&self) -> Vec<Buffer> {
        self.outputs.iter().chain(&self.inputs).cloned().collect()
    }
}

/// The runner that executes `item`. Kernels compile through the runtime's cache
/// on the device of their first output; every buffer must live on that device.
pub fn lower_schedule_item(rt: &Runtime, item: &ScheduleItem) -> Result<Arc<dyn Runner>> {
    match &item.op {
        ScheduleOp::Kernel(ast) => {
            let Some(out) = item.outputs.first() else {
                return LoweringSnafu { reason: "kernel without outputs" }.fail();
            };
            let devices: BTreeSet<&str> =
                item.outputs.iter().chain(&item.inputs).map(|b| b.device().name()).collect();
            ensure!(
                devices.len() == 1,
                MixedDevicesSnafu { devices: devices.iter().map(|d| d.to_string()).collect::<Vec<_>>() }
            );
            let runner: Arc<dyn Runner> = rt.get_runner(out.device(), ast)?;
            Ok(runner)
        }
        ScheduleOp::Copy => {
            ensure!(
                item.outputs.len() == 1 && item.inputs.len() == 1,
                ArgumentCountSnafu { name: "copy", expected: 2usize, actual: item.outputs.len() + item.inputs.len() }
            );
            Ok(Arc::new(BufferCopy))
        }
    }
}

/// Lower and launch each item in order, allocating outputs first.
pub fn run_schedule(
    rt: &Runtime,
    launcher: &mut Launcher,
    schedule: impl IntoIterator<Item = ScheduleItem>,
    var_vals: &VarVals,
) -> Result<()> {
    for item in schedule {
        for out in &item.outputs {
            out.ensure_allocated().context(DeviceSnafu)?;
        }
        let runner = lower_schedule_item(rt, &item)?;
        trace!(runner = %runner.name(), outputs = item.outputs.len(), inputs = item.inputs.len(), "running item");
        launcher.launch(&runner, &item.buffers(), var_vals)?;
    }
    Ok(())
}
