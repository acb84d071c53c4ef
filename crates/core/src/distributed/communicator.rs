//! Device communicator for collective operations.
//!
//! Provides the collective primitives the key distributor is built on
//! (all_gather, all_to_all, all_to_all_v, barrier) and an in-process
//! implementation where every device is driven by its own thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::error::{DistributedError, Result};
use super::process_group::{GroupMember, ProcessGroup};

/// Trait for device-to-device communication.
///
/// Every call is a group-wide synchronization point: all ranks must enter the
/// same sequence of collectives, in the same order.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-gather: gather tensors from all ranks along dimension.
    ///
    /// Input shape: [dim0, dim1, ...]
    /// Output shape: [dim0 * world_size, dim1, ...] (if gather_dim=0)
    ///
    /// For single device, this is identity.
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// All-to-all: each rank sends distinct data to each other rank.
    ///
    /// Input tensor is split into `world_size` equal chunks along dimension 0.
    /// Chunk i is sent to rank i, and this rank receives chunk j from rank j.
    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor> {
        let world_size = self.process_group().world_size();
        let rows = tensor.dim(0)?;
        if rows % world_size != 0 {
            return Err(DistributedError::ShapeMismatch {
                expected: vec![rows.div_ceil(world_size) * world_size],
                actual: tensor.dims().to_vec(),
            });
        }
        let splits = vec![rows / world_size; world_size];
        self.all_to_all_v(tensor, &splits, &splits)
    }

    /// Variable-size all-to-all: each rank sends/receives different amounts to/from each rank.
    ///
    /// # Arguments
    /// * `tensor` - Input tensor, total size along dim 0 equals sum of send_splits
    /// * `send_splits` - Number of rows to send to each rank (length = world_size)
    /// * `recv_splits` - Number of rows to receive from each rank (length = world_size)
    ///
    /// Output tensor has size sum(recv_splits) along dimension 0, chunks concatenated
    /// in source rank order. A peer chunk whose length differs from its recv split
    /// is an error, never a short read.
    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;
}

/// Default receive timeout for [`LocalCommunicator`].
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);

struct Envelope {
    seq: u64,
    payload: Tensor,
}

/// Collective communicator for ranks that run as threads of one process.
///
/// Each ordered rank pair owns a dedicated channel, so messages between two
/// ranks stay FIFO. Every collective call carries a sequence number; a peer
/// that entered a different collective is reported instead of silently
/// consuming its data.
pub struct LocalCommunicator {
    process_group: GroupMember,
    /// `senders[dst]`: channel from this rank to `dst`.
    senders: Vec<Sender<Envelope>>,
    /// `receivers[src]`: channel from `src` to this rank.
    receivers: Vec<Receiver<Envelope>>,
    seq: AtomicU64,
    timeout: Duration,
}

impl LocalCommunicator {
    /// Create connected communicators for `world_size` ranks, indexed by rank.
    ///
    /// # Panics
    /// Panics if `world_size == 0`.
    pub fn group(world_size: usize, timeout: Duration) -> Vec<LocalCommunicator> {
        assert!(world_size > 0, "world_size must be > 0");

        // channels[src][dst]
        let mut senders: Vec<Vec<Sender<Envelope>>> = Vec::with_capacity(world_size);
        let mut receivers: Vec<Vec<Receiver<Envelope>>> =
            (0..world_size).map(|_| Vec::with_capacity(world_size)).collect();
        for _src in 0..world_size {
            let mut row = Vec::with_capacity(world_size);
            for dst_row in receivers.iter_mut() {
                let (tx, rx) = unbounded();
                row.push(tx);
                dst_row.push(rx);
            }
            senders.push(row);
        }

        GroupMember::all(world_size)
            .into_iter()
            .zip(senders.into_iter().zip(receivers))
            .map(|(process_group, (senders, receivers))| LocalCommunicator {
                process_group,
                senders,
                receivers,
                seq: AtomicU64::new(0),
                timeout,
            })
            .collect()
    }

    /// Single-rank communicator; every collective is identity.
    pub fn single() -> Self {
        let mut group = Self::group(1, DEFAULT_RECV_TIMEOUT);
        group.remove(0)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send_to(&self, dst: usize, seq: u64, payload: Tensor) -> Result<()> {
        self.senders[dst]
            .send(Envelope { seq, payload })
            .map_err(|_| DistributedError::PeerDisconnected { rank: dst })
    }

    fn recv_from(&self, src: usize, seq: u64) -> Result<Tensor> {
        let envelope = self.receivers[src]
            .recv_timeout(self.timeout)
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => DistributedError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                },
                RecvTimeoutError::Disconnected => DistributedError::PeerDisconnected { rank: src },
            })?;
        if envelope.seq != seq {
            return Err(DistributedError::SequenceMismatch {
                src,
                expected: seq,
                actual: envelope.seq,
            });
        }
        Ok(envelope.payload)
    }

    fn check_splits(&self, splits: &[usize]) -> Result<()> {
        let world_size = self.process_group.world_size();
        if splits.len() != world_size {
            return Err(DistributedError::SplitCount {
                expected: world_size,
                actual: splits.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("rank", &self.process_group.rank())
            .field("world_size", &self.process_group.world_size())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Concatenate received chunks along dim 0, skipping empty ones.
fn concat_rows(chunks: Vec<Tensor>, template: &Tensor) -> Result<Tensor> {
    let mut non_empty: Vec<Tensor> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.dim(0)? > 0 {
            non_empty.push(chunk);
        }
    }
    match non_empty.len() {
        0 => {
            let mut dims = template.dims().to_vec();
            dims[0] = 0;
            Ok(Tensor::zeros(
                dims.as_slice(),
                template.dtype(),
                template.device(),
            )?)
        }
        1 => Ok(non_empty.remove(0)),
        _ => Ok(Tensor::cat(&non_empty, 0)?),
    }
}

impl DeviceCommunicator for LocalCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        let seq = self.next_seq();
        for dst in 0..self.process_group.world_size() {
            self.send_to(dst, seq, tensor.clone())?;
        }
        let mut gathered = Vec::with_capacity(self.process_group.world_size());
        for src in 0..self.process_group.world_size() {
            let chunk = self.recv_from(src, seq)?;
            if chunk.dims() != tensor.dims() {
                return Err(DistributedError::ShapeMismatch {
                    expected: tensor.dims().to_vec(),
                    actual: chunk.dims().to_vec(),
                });
            }
            gathered.push(chunk);
        }
        Ok(Tensor::cat(&gathered, gather_dim)?)
    }

    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor> {
        self.check_splits(send_splits)?;
        self.check_splits(recv_splits)?;

        let dims = tensor.dims();
        if dims.is_empty() {
            return Err(DistributedError::ShapeMismatch {
                expected: vec![send_splits.iter().sum()],
                actual: dims.to_vec(),
            });
        }
        let total_send: usize = send_splits.iter().sum();
        if dims[0] != total_send {
            let mut expected = dims.to_vec();
            expected[0] = total_send;
            return Err(DistributedError::ShapeMismatch {
                expected,
                actual: dims.to_vec(),
            });
        }

        if self.process_group.is_single() {
            if send_splits[0] != recv_splits[0] {
                return Err(DistributedError::ChunkSizeMismatch {
                    src: 0,
                    expected: recv_splits[0],
                    actual: send_splits[0],
                });
            }
            return Ok(tensor.clone());
        }

        let seq = self.next_seq();
        let mut offset = 0;
        for (dst, &rows) in send_splits.iter().enumerate() {
            self.send_to(dst, seq, tensor.narrow(0, offset, rows)?)?;
            offset += rows;
        }

        // Drain every peer before reporting a bad chunk so the channels stay
        // aligned for the next collective.
        let mut chunks = Vec::with_capacity(recv_splits.len());
        for src in 0..recv_splits.len() {
            chunks.push(self.recv_from(src, seq)?);
        }
        for (src, (chunk, &expected)) in chunks.iter().zip(recv_splits).enumerate() {
            let actual = chunk.dim(0)?;
            if actual != expected {
                return Err(DistributedError::ChunkSizeMismatch {
                    src,
                    expected,
                    actual,
                });
            }
        }
        concat_rows(chunks, tensor)
    }

    fn barrier(&self) -> Result<()> {
        if self.process_group.is_single() {
            return Ok(());
        }
        let token = Tensor::zeros(1, DType::U8, &Device::Cpu)?;
        self.all_gather(&token, 0)?;
        Ok(())
    }
}
