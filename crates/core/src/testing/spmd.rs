use std::sync::Arc;
use std::thread;
use std::time::Duration;

use candle_core::Device;

use crate::config::PlacementConfig;
use crate::data_distributor::{DataDistributor, DeviceContext, DeviceDistributor, Sharding};
use crate::distributed::LocalCommunicator;

/// Receive timeout of test groups. Short enough that a deadlocked test fails
/// instead of hanging.
pub const TEST_RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// CPU contexts connected by an in-process communicator.
pub fn local_contexts(num_devices: usize) -> Vec<DeviceContext> {
    LocalCommunicator::group(num_devices, TEST_RECV_TIMEOUT)
        .into_iter()
        .enumerate()
        .map(|(device_id, comm)| DeviceContext::new(device_id, Device::Cpu, Arc::new(comm)))
        .collect()
}

/// Distributor over [`local_contexts`].
///
/// # Panics
/// Panics if the placement is invalid.
pub fn local_distributor(config: PlacementConfig, sharding: Sharding) -> DataDistributor {
    let contexts = local_contexts(config.num_devices);
    DataDistributor::new(contexts, config, sharding).expect("valid test placement")
}

/// Run `f` on every device concurrently, one thread each; results are in
/// device order.
pub fn run_spmd<F, T>(workers: &mut [DeviceDistributor], f: F) -> Vec<T>
where
    F: Fn(&mut DeviceDistributor) -> T + Sync,
    T: Send,
{
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = workers
            .iter_mut()
            .map(|worker| s.spawn(move || f(worker)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("device thread panicked"))
            .collect()
    })
}
