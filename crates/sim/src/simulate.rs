//! SPMD simulation: one thread per device, synthetic batches, one report.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use candle_core::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use embdist_core::config::PlacementConfig;
use embdist_core::data_distributor::{
    DataDistributor, DeviceContext, DeviceDistributor, DistributorError, MetricsSnapshot, Sharding,
};
use embdist_core::distributed::LocalCommunicator;

use crate::synthetic::{full_batch_tensors, SyntheticBatch};

/// Everything a run needs, with defaults already resolved.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub placement: PlacementConfig,
    pub batch_sizes: Vec<usize>,
    pub steps: usize,
    pub key_space: i64,
    pub seed: u64,
    pub full_batch: bool,
    pub recv_timeout: Duration,
}

impl SimulationPlan {
    /// Reject batch sizes the placement cannot serve before any thread starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_sizes.is_empty() {
            bail!("at least one batch size is required");
        }
        if self.key_space <= 0 {
            bail!("key space must be positive, got {}", self.key_space);
        }
        let num_devices = self.placement.num_devices;
        for &batch_size in &self.batch_sizes {
            if batch_size == 0 || batch_size % num_devices != 0 {
                bail!("batch size {batch_size} is not a positive multiple of {num_devices} devices");
            }
            if batch_size > self.placement.max_batch_size {
                bail!(
                    "batch size {batch_size} exceeds the placement maximum {}",
                    self.placement.max_batch_size
                );
            }
        }
        Ok(())
    }

    fn batch_size_at(&self, step: usize) -> usize {
        self.batch_sizes[step % self.batch_sizes.len()]
    }

    /// Samples of every device for `step`. Each device thread derives the
    /// same batches from the seed, so full-batch runs agree without sharing.
    fn batches_at(&self, step: usize) -> Vec<SyntheticBatch> {
        let b = self.placement.batch_size_per_device(self.batch_size_at(step));
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(step as u64));
        (0..self.placement.num_devices)
            .map(|_| SyntheticBatch::generate(&self.placement, b, self.key_space, &mut rng))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device_id: usize,
    pub committed_steps: usize,
    pub failed_steps: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub num_devices: usize,
    pub steps: usize,
    pub full_batch: bool,
    pub elapsed_secs: f64,
    /// Keys sent equal keys received, summed over the group.
    pub conserved: bool,
    pub devices: Vec<DeviceReport>,
}

/// Run `plan` on CPU devices connected by an in-process communicator.
pub fn run(plan: &SimulationPlan) -> anyhow::Result<SimReport> {
    plan.validate()?;
    let num_devices = plan.placement.num_devices;

    let contexts = LocalCommunicator::group(num_devices, plan.recv_timeout)
        .into_iter()
        .enumerate()
        .map(|(device_id, comm)| DeviceContext::new(device_id, Device::Cpu, Arc::new(comm)))
        .collect();
    let distributor = DataDistributor::new(contexts, plan.placement.clone(), Sharding::default())
        .context("failed to build distributor")?;
    let mut workers = distributor.into_workers();

    info!(
        num_devices,
        steps = plan.steps,
        batch_sizes = ?plan.batch_sizes,
        full_batch = plan.full_batch,
        "Starting simulation"
    );
    let start = Instant::now();

    let results: Vec<anyhow::Result<DeviceReport>> = thread::scope(|s| {
        let handles: Vec<_> = workers
            .iter_mut()
            .map(|worker| {
                thread::Builder::new()
                    .name(format!("device-{}", worker.device_id()))
                    .spawn_scoped(s, move || run_device(worker, plan))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .context("failed to spawn device thread")?
                    .join()
                    .map_err(|_| anyhow!("device thread panicked"))?
            })
            .collect()
    });
    let devices = results.into_iter().collect::<anyhow::Result<Vec<_>>>()?;

    let elapsed_secs = start.elapsed().as_secs_f64();
    let sent: u64 = devices.iter().map(|d| d.metrics.keys_sent).sum();
    let received: u64 = devices.iter().map(|d| d.metrics.keys_received).sum();
    let conserved = sent == received;
    if !conserved {
        warn!(sent, received, "key totals differ across the group");
    }
    info!(elapsed_secs, sent, received, "Simulation finished");

    Ok(SimReport {
        num_devices,
        steps: plan.steps,
        full_batch: plan.full_batch,
        elapsed_secs,
        conserved,
        devices,
    })
}

fn run_device(worker: &mut DeviceDistributor, plan: &SimulationPlan) -> anyhow::Result<DeviceReport> {
    let device_id = worker.device_id();
    let mut output = worker.allocate_output()?;
    let mut committed_steps = 0;
    let mut failed_steps = 0;

    for step in 0..plan.steps {
        let batch_size = plan.batch_size_at(step);
        let batches = plan.batches_at(step);
        let result = if plan.full_batch {
            let (keys, range) = full_batch_tensors(&batches, worker.device())?;
            worker.distribute_fullbatch(&keys, &range, &mut output, batch_size)
        } else {
            let (keys, ranges) = batches[device_id].to_tensors(worker.device())?;
            worker.distribute(&keys, &ranges, &mut output, batch_size)
        };
        match result {
            Ok(()) => {
                committed_steps += 1;
                debug!(
                    device = device_id,
                    step,
                    keys = ?output.iter().map(|o| o.num_keys()).collect::<Vec<_>>(),
                    "step done"
                );
            }
            // the group is out of sync; later collectives would only time out
            Err(DistributorError::Distributed(e)) => {
                return Err(e).with_context(|| format!("device {device_id} lost the group at step {step}"));
            }
            Err(e) => {
                failed_steps += 1;
                warn!(device = device_id, step, error = %e, "step skipped");
            }
        }
    }

    Ok(DeviceReport {
        device_id,
        committed_steps,
        failed_steps,
        metrics: worker.metrics().snapshot(),
    })
}
