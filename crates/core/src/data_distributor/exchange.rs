//! Two-phase key exchange of a model-parallel group.
//!
//! Phase A sends every destination the number of keys it will get, plus the
//! per-bucket counts it needs to rebuild sample boundaries. Phase B sends the
//! keys themselves, sized by what phase A announced. Receive sizes are not
//! known before phase A completes, so the two phases cannot be merged.
//!
//! Every device runs both collectives even after a local fault, so peers are
//! never left waiting; the fault is returned once phase B is done. Only
//! communicator failures return early.

use candle_core::{Device, Tensor};
use tracing::debug;

use super::error::{DistributorError, ExchangePhase, Result};
use super::mp_filter::FilterTempStorage;
use super::output::EmbeddingInput;
use crate::distributed::{DeviceCommunicator, DistributedError};

/// Keys moved by one group exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub sent: usize,
    pub received: usize,
}

/// Whether an exchange error still leaves the group able to continue with the
/// next collective.
pub(crate) fn is_local_fault(err: &DistributorError) -> bool {
    !matches!(err, DistributorError::Distributed(_))
}

/// Phase A: exchange per-destination totals and bucket counts.
pub fn exchange_counts(
    comm: &dyn DeviceCommunicator,
    storage: &mut FilterTempStorage,
    device: &Device,
) -> Result<()> {
    let world_size = comm.process_group().world_size();
    let send = Tensor::new(storage.send_counts(), device)?;
    let recv_splits = vec![storage.recv_count_split(); world_size];
    let received = comm.all_to_all_v(&send, storage.send_count_splits(), &recv_splits)?;
    let received = received.to_vec1::<u32>()?;
    storage.transpose_buckets(&received)?;
    debug!(
        rank = comm.process_group().rank(),
        send = ?storage.send_k_per_g(),
        recv = ?storage.recv_k_per_g(),
        "count exchange done"
    );
    Ok(())
}

/// Phase B: exchange the sorted keys and rebuild them feature-major into
/// `output`.
pub fn exchange_keys(
    comm: &dyn DeviceCommunicator,
    storage: &FilterTempStorage,
    output: &mut EmbeddingInput,
    device: &Device,
    skip_reconstruct: bool,
) -> Result<ExchangeStats> {
    let send_splits: Vec<usize> = storage
        .send_k_per_g()
        .iter()
        .map(|&n| n as usize)
        .collect();
    let recv_splits: Vec<usize> = storage
        .recv_k_per_g()
        .iter()
        .map(|&n| n as usize)
        .collect();
    let send = Tensor::new(storage.sorted_keys(), device)?;
    let received = match comm.all_to_all_v(&send, &send_splits, &recv_splits) {
        Ok(received) => received,
        Err(DistributedError::ChunkSizeMismatch {
            src,
            expected,
            actual,
        }) => {
            return Err(DistributorError::protocol(
                ExchangePhase::Payload,
                format!("device {src} sent {actual} keys after announcing {expected}"),
            ))
        }
        Err(err) => return Err(err.into()),
    };

    let stats = ExchangeStats {
        sent: storage.total_sent(),
        received: storage.total_received(),
    };
    if skip_reconstruct {
        return Ok(stats);
    }

    let received = received.to_vec1::<i64>()?;
    if received.len() != stats.received {
        return Err(DistributorError::protocol(
            ExchangePhase::Payload,
            format!(
                "received {} keys, counts announced {}",
                received.len(),
                stats.received
            ),
        ));
    }
    reconstruct(storage, &received, output)?;
    Ok(stats)
}

/// Reorder keys received as `[src][lookup][sample]` into the output's
/// `[lookup][src][sample]` layout and build its bucket range.
pub fn reconstruct(
    storage: &FilterTempStorage,
    received: &[i64],
    output: &mut EmbeddingInput,
) -> Result<()> {
    output.reserve_keys(received.len())?;
    let counts = storage.k_per_b_feat_major();
    let recv_k_per_g = storage.recv_k_per_g();
    let num_devices = recv_k_per_g.len();
    let num_lookups = storage.num_local_lookups();
    let b = storage.batch_size_per_device();

    let (keys, bucket_range) = output.buffers_mut();
    if bucket_range.len() != counts.len() + 1 {
        return Err(DistributorError::ShapeMismatch(format!(
            "output expects {} buckets, counts describe {}",
            bucket_range.len() - 1,
            counts.len()
        )));
    }
    bucket_range[0] = 0;
    for (i, &count) in counts.iter().enumerate() {
        bucket_range[i + 1] = bucket_range[i] + count;
    }

    let mut src_pos = 0usize;
    for src in 0..num_devices {
        for j in 0..num_lookups {
            for s in 0..b {
                let bucket = (j * num_devices + src) * b + s;
                let count = counts[bucket] as usize;
                let dst = bucket_range[bucket] as usize;
                keys[dst..dst + count].copy_from_slice(&received[src_pos..src_pos + count]);
                src_pos += count;
            }
        }
    }
    output.finish();
    Ok(())
}
