//! Integration tests for the per-step key distribution.
//!
//! Every test drives a group of CPU devices, one thread each, connected by
//! the in-process communicator.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use embdist_core::config::{PlacementConfig, PlacementMode};
use embdist_core::data_distributor::{
    DataDistributor, DeviceContext, DeviceDistributor, DistributorError, EmbeddingInput,
    ExchangePhase, ExplicitPlacement, IdentityIndex, ModuloPlacement, ShardPlacement, Sharding,
};
use embdist_core::distributed::{self, DeviceCommunicator, LocalCommunicator, ProcessGroup};
use embdist_core::testing::{
    full_batch_tensors, local_distributor, run_spmd, tiny_dp_config, tiny_mixed_config,
    tiny_mp_config, DeviceBatch, TEST_RECV_TIMEOUT,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

type StepResult = Result<Vec<EmbeddingInput>, DistributorError>;

/// Run one data-parallel input step on every device.
fn step(
    workers: &mut [DeviceDistributor],
    batches: &[DeviceBatch],
    batch_size: usize,
) -> Vec<StepResult> {
    run_spmd(workers, |worker| {
        let (keys, ranges) = batches[worker.device_id()]
            .to_tensors(&Device::Cpu)
            .unwrap();
        let mut output = worker.allocate_output().unwrap();
        worker
            .distribute(&keys, &ranges, &mut output, batch_size)
            .map(|()| output)
    })
}

/// Raw keys out of the model-parallel path, so routing can be checked.
fn raw_key_sharding() -> Sharding {
    Sharding::new(
        Arc::new(ModuloPlacement),
        Arc::new(IdentityIndex),
        Arc::new(IdentityIndex),
    )
}

fn random_batches(config: &PlacementConfig, batch_size: usize, seed: u64) -> Vec<DeviceBatch> {
    let mut rng = StdRng::seed_from_u64(seed);
    let b = config.batch_size_per_device(batch_size);
    (0..config.num_devices)
        .map(|_| DeviceBatch::random(config, b, 1000, &mut rng))
        .collect()
}

/// Brute-force model-parallel output of `device` for `group_id`, using the
/// modulo shard rule: lookup-major, then source device, then sample.
fn expected_mp_output(
    config: &PlacementConfig,
    batches: &[DeviceBatch],
    group_id: usize,
    device: usize,
) -> (Vec<i64>, Vec<u32>) {
    let mut keys = Vec::new();
    let mut range = vec![0u32];
    for lookup_id in config.local_lookups(group_id, device) {
        let shards = &config.tables[config.lookups[lookup_id].table_id].shards;
        for batch in batches {
            for s in 0..batch.num_samples() {
                for &key in batch.sample_keys(lookup_id, s) {
                    if shards[key.rem_euclid(shards.len() as i64) as usize] == device {
                        keys.push(key);
                    }
                }
                range.push(keys.len() as u32);
            }
        }
    }
    (keys, range)
}

fn assert_monotonic(range: &[u32], num_keys: usize) {
    assert_eq!(range[0], 0);
    assert!(range.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(*range.last().unwrap() as usize, num_keys);
}

// ─── Two-device routing scenario ─────────────────────────────────────────────

fn scenario_sharding(index: bool) -> Sharding {
    // 5 and 9 live on device 1; 2 and 7 on device 0
    let placement = ExplicitPlacement::new()
        .assign(0, 5, 1)
        .assign(0, 9, 1)
        .assign(0, 2, 0)
        .assign(0, 7, 0);
    if index {
        Sharding::explicit(placement)
    } else {
        Sharding::new(
            Arc::new(placement),
            Arc::new(IdentityIndex),
            Arc::new(IdentityIndex),
        )
    }
}

fn scenario_batches() -> Vec<DeviceBatch> {
    vec![
        // device 0: sample 0 = [5, 9], sample 1 = [2]
        DeviceBatch::from_samples(&[vec![vec![5, 9], vec![2]]]),
        // device 1: sample 0 = [7], sample 1 = []
        DeviceBatch::from_samples(&[vec![vec![7], vec![]]]),
    ]
}

#[test]
fn test_two_device_scenario_routes_to_owners() {
    let mut distributor = local_distributor(tiny_mp_config(2), scenario_sharding(false));
    let batches = scenario_batches();
    let results = step(distributor.workers_mut(), &batches, 4);

    let out0 = &results[0].as_ref().unwrap()[0];
    let out1 = &results[1].as_ref().unwrap()[0];
    assert_eq!(out0.keys(), &[2, 7]);
    assert_eq!(out1.keys(), &[5, 9]);
    // buckets: [src0 s0, src0 s1, src1 s0, src1 s1]
    assert_eq!(out0.bucket_range(), &[0, 0, 1, 2, 2]);
    assert_eq!(out1.bucket_range(), &[0, 2, 2, 2, 2]);

    // phase A announced exactly what phase B delivered
    let workers = distributor.workers_mut();
    let s0 = workers[0].filter_storage(0).unwrap();
    let s1 = workers[1].filter_storage(0).unwrap();
    assert_eq!(s0.send_k_per_g(), &[1, 2]);
    assert_eq!(s1.send_k_per_g(), &[1, 0]);
    assert_eq!(s0.recv_k_per_g(), &[1, 1]);
    assert_eq!(s1.recv_k_per_g(), &[2, 0]);
}

#[test]
fn test_two_device_scenario_converts_to_shard_rows() {
    let mut distributor = local_distributor(tiny_mp_config(2), scenario_sharding(true));
    let results = step(distributor.workers_mut(), &scenario_batches(), 4);
    // rows are handed out per shard in assignment order
    assert_eq!(results[0].as_ref().unwrap()[0].keys(), &[0, 1]);
    assert_eq!(results[1].as_ref().unwrap()[0].keys(), &[0, 1]);
}

// ─── Invariants over random batches ──────────────────────────────────────────

#[test]
fn test_conservation_across_group() {
    let config = tiny_mixed_config(3);
    let mut distributor = local_distributor(config.clone(), Sharding::default());
    for seed in 0..5 {
        let batches = random_batches(&config, 18, seed);
        let results = step(distributor.workers_mut(), &batches, 18);
        assert!(results.iter().all(Result::is_ok));

        let workers = distributor.workers_mut();
        let sent: usize = workers
            .iter()
            .map(|w| w.filter_storage(0).unwrap().total_sent())
            .sum();
        let received: usize = workers
            .iter()
            .map(|w| w.filter_storage(0).unwrap().total_received())
            .sum();
        let input: usize = batches
            .iter()
            .map(|batch| (0..3).map(|l| batch.keys[l].len()).sum::<usize>())
            .sum();
        assert_eq!(sent, received);
        assert_eq!(sent, input);

        let output: usize = results
            .iter()
            .map(|r| r.as_ref().unwrap()[0].num_keys())
            .sum();
        assert_eq!(output, input);
    }
}

#[test]
fn test_routing_exclusivity_matches_brute_force() {
    let config = tiny_mixed_config(3);
    let mut distributor = local_distributor(config.clone(), raw_key_sharding());
    for seed in 10..15 {
        let batches = random_batches(&config, 24, seed);
        let results = step(distributor.workers_mut(), &batches, 24);
        for (device, result) in results.iter().enumerate() {
            let mp = &result.as_ref().unwrap()[0];
            let (keys, range) = expected_mp_output(&config, &batches, 0, device);
            assert_eq!(mp.keys(), keys.as_slice(), "device {device} seed {seed}");
            assert_eq!(mp.bucket_range(), range.as_slice());
            assert_eq!(mp.buckets_per_lookup(), 24);
        }
    }
}

#[test]
fn test_bucket_ranges_are_monotonic() {
    let config = tiny_mixed_config(2);
    let mut distributor = local_distributor(config.clone(), Sharding::default());
    let batches = random_batches(&config, 16, 99);
    let results = step(distributor.workers_mut(), &batches, 16);
    for result in &results {
        for out in result.as_ref().unwrap() {
            assert_monotonic(out.bucket_range(), out.num_keys());
            for j in 0..out.num_lookups() {
                let lookup_range = out.lookup_bucket_range(j);
                let start = out.lookup_offsets()[j];
                let end = out.lookup_offsets()[j + 1];
                assert_eq!(lookup_range[0], start);
                assert_eq!(*lookup_range.last().unwrap(), end);
            }
        }
    }
}

#[test]
fn test_dp_keys_stay_on_device() {
    let config = tiny_mixed_config(2);
    let mut distributor = local_distributor(config.clone(), Sharding::default());
    let batches = random_batches(&config, 10, 3);
    let results = step(distributor.workers_mut(), &batches, 10);
    for (device, result) in results.iter().enumerate() {
        let dp = &result.as_ref().unwrap()[1];
        assert_eq!(dp.mode(), PlacementMode::DataParallel);
        assert_eq!(dp.keys(), batches[device].keys[3].as_slice());
        assert_eq!(dp.bucket_range(), batches[device].bucket_ranges[3].as_slice());
        assert_eq!(dp.global_bucket_offsets(), &[(device * 5) as u32]);
    }
    let metrics = distributor.worker(0).unwrap().metrics().snapshot();
    assert_eq!(metrics.dp_keys, batches[0].keys[3].len() as u64);
}

// ─── Shape cache ─────────────────────────────────────────────────────────────

#[test]
fn test_shape_cache_hits_on_repeat_and_misses_on_change() {
    // 1024 samples per device, then 1024 again, then 512
    let config = tiny_dp_config(3, 3072);
    let mut distributor = local_distributor(config.clone(), Sharding::default());

    let batches = random_batches(&config, 3072, 1);
    let first = step(distributor.workers_mut(), &batches, 3072);
    for worker in distributor.workers_mut().iter() {
        assert_eq!(worker.shape_cache().misses(), 1);
        assert_eq!(worker.shape_cache().hits(), 0);
    }

    let second = step(distributor.workers_mut(), &batches, 3072);
    for (device, worker) in distributor.workers_mut().iter().enumerate() {
        let cache = worker.shape_cache();
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        let cached = cache.entry().unwrap();
        assert_eq!(*cached, cache.compute_uncached(worker.config(), 3072));

        let a = &first[device].as_ref().unwrap()[0];
        let b = &second[device].as_ref().unwrap()[0];
        assert_eq!(a.bucket_range(), b.bucket_range());
        assert_eq!(a.global_bucket_offsets(), b.global_bucket_offsets());
    }

    let smaller = random_batches(&config, 1536, 2);
    let results = step(distributor.workers_mut(), &smaller, 1536);
    assert!(results.iter().all(Result::is_ok));
    for worker in distributor.workers_mut().iter() {
        let cache = worker.shape_cache();
        assert_eq!((cache.hits(), cache.misses()), (1, 2));
        assert_eq!(cache.last_batch_size(), Some(1536));
        assert_eq!(worker.metrics().cache_misses(), 2);
    }
}

#[test]
fn test_fixed_bucket_ranges_per_group() {
    let config = tiny_mixed_config(2);
    let mut distributor = local_distributor(config, Sharding::default());
    let worker = distributor.worker_mut(1).unwrap();
    let ranges = worker.init_fixed_bucket_ranges(8).unwrap();
    // mp: lookups 0, 1, 2 at j * B; dp: lookup 3 at d * b
    assert_eq!(ranges, vec![vec![0, 8, 16], vec![4]]);
    assert_eq!(worker.shape_cache().misses(), 1);
}

// ─── Full-batch input ────────────────────────────────────────────────────────

#[test]
fn test_fullbatch_matches_dp_input() {
    let config = tiny_mixed_config(3);
    let batches = random_batches(&config, 12, 21);
    let (keys, range) = full_batch_tensors(&batches, &Device::Cpu).unwrap();

    let mut split = local_distributor(config.clone(), Sharding::default());
    let expected = step(split.workers_mut(), &batches, 12);

    let mut full = local_distributor(config, Sharding::default());
    let actual = run_spmd(full.workers_mut(), |worker| {
        let mut output = worker.allocate_output().unwrap();
        worker
            .distribute_fullbatch(&keys, &range, &mut output, 12)
            .map(|()| output)
    });

    for (want, got) in expected.iter().zip(&actual) {
        let (want, got) = (want.as_ref().unwrap(), got.as_ref().unwrap());
        for (w, g) in want.iter().zip(got) {
            assert_eq!(w.keys(), g.keys());
            assert_eq!(w.bucket_range(), g.bucket_range());
            assert_eq!(w.global_bucket_offsets(), g.global_bucket_offsets());
        }
    }
}

// ─── Failure semantics ───────────────────────────────────────────────────────

#[test]
fn test_batch_size_disagreement_fails_everywhere() {
    let config = tiny_mp_config(2);
    let mut distributor = local_distributor(config.clone(), Sharding::default());
    let big = random_batches(&config, 8, 5);
    let small = random_batches(&config, 4, 6);
    let results = run_spmd(distributor.workers_mut(), |worker| {
        let (batch, batch_size) = if worker.device_id() == 0 {
            (&big[0], 8)
        } else {
            (&small[1], 4)
        };
        let (keys, ranges) = batch.to_tensors(&Device::Cpu).unwrap();
        let mut output = worker.allocate_output().unwrap();
        worker.distribute(&keys, &ranges, &mut output, batch_size)
    });
    for result in results {
        assert!(matches!(result, Err(DistributorError::ShapeMismatch(_))));
    }
    for worker in distributor.workers_mut().iter() {
        assert_eq!(worker.metrics().aborted_steps(), 1);
        assert_eq!(worker.metrics().keys_sent(), 0);
    }
}

#[test]
fn test_capacity_violation_aborts_all_devices() {
    let config = tiny_mp_config(2);
    let mut distributor = local_distributor(config.clone(), Sharding::default());
    // hotness is 2; device 0 sends three keys in one sample
    let batches = vec![
        DeviceBatch::from_samples(&[vec![vec![1, 2, 3], vec![]]]),
        DeviceBatch::from_samples(&[vec![vec![4], vec![5]]]),
    ];
    let results = step(distributor.workers_mut(), &batches, 4);
    assert!(matches!(
        results[0],
        Err(DistributorError::CapacityExceeded { required: 3, .. })
    ));
    match &results[1] {
        Err(DistributorError::StepAborted { failed }) => assert_eq!(failed, &vec![0]),
        other => panic!("expected StepAborted, got {other:?}"),
    }

    // the group stays usable for the next step
    let batches = random_batches(&config, 4, 8);
    let results = step(distributor.workers_mut(), &batches, 4);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(distributor.worker(1).unwrap().metrics().steps(), 1);
}

#[test]
fn test_invalid_shard_fails_at_step_time() {
    struct OutOfRange;
    impl ShardPlacement for OutOfRange {
        fn shard_of(&self, _: usize, _: i64, num_shards: usize) -> usize {
            num_shards + 1
        }
    }
    let config = tiny_mp_config(2);
    let sharding = Sharding::new(
        Arc::new(OutOfRange),
        Arc::new(ModuloPlacement),
        Arc::new(IdentityIndex),
    );
    let mut distributor = local_distributor(config, sharding);
    let batches = vec![
        DeviceBatch::from_samples(&[vec![vec![1], vec![]]]),
        DeviceBatch::from_samples(&[vec![vec![], vec![]]]),
    ];
    let results = step(distributor.workers_mut(), &batches, 4);
    assert!(matches!(
        results[0],
        Err(DistributorError::InvalidShard { shard: 3, .. })
    ));
    assert!(matches!(
        results[1],
        Err(DistributorError::StepAborted { .. })
    ));
}

#[test]
fn test_batch_over_configured_maximum() {
    let config = tiny_mp_config(1);
    let mut distributor = local_distributor(config.clone(), Sharding::default());
    let batches = random_batches(&config, 8, 1);
    let results = step(distributor.workers_mut(), &batches, 8);
    assert!(matches!(
        results[0],
        Err(DistributorError::CapacityExceeded {
            what: "batch size",
            ..
        })
    ));
}

#[test]
fn test_output_from_other_device_is_rejected() {
    let config = tiny_mixed_config(2);
    let mut distributor = local_distributor(config.clone(), Sharding::default());
    let batches = random_batches(&config, 4, 4);
    let results = run_spmd(distributor.workers_mut(), |worker| {
        let (keys, ranges) = batches[worker.device_id()]
            .to_tensors(&Device::Cpu)
            .unwrap();
        // device 1 holds table 1, device 0 does not
        let mut output =
            embdist_core::data_distributor::allocate_output(worker.config(), 1).unwrap();
        worker.distribute(&keys, &ranges, &mut output, 4)
    });
    assert!(matches!(results[0], Err(DistributorError::ShapeMismatch(_))));
    assert!(matches!(
        results[1],
        Err(DistributorError::StepAborted { .. })
    ));
}

// ─── Corrupted exchange messages ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Tamper {
    /// Raise the key total announced to the target in the count exchange.
    CountTotal,
    /// Drop the last key of the payload segment sent to the target.
    ShortPayload,
}

/// Local communicator that corrupts what this rank sends to `target`.
struct TamperingComm {
    inner: LocalCommunicator,
    tamper: Tamper,
    target: usize,
}

impl DeviceCommunicator for TamperingComm {
    fn process_group(&self) -> &dyn ProcessGroup {
        self.inner.process_group()
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> distributed::Result<Tensor> {
        self.inner.all_gather(tensor, gather_dim)
    }

    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> distributed::Result<Tensor> {
        let start: usize = send_splits[..self.target].iter().sum();
        match (self.tamper, tensor.dtype()) {
            (Tamper::CountTotal, DType::U32) => {
                let mut words = tensor.to_vec1::<u32>()?;
                words[start] += 1;
                let words = Tensor::new(words.as_slice(), tensor.device())?;
                self.inner.all_to_all_v(&words, send_splits, recv_splits)
            }
            (Tamper::ShortPayload, DType::I64) if send_splits[self.target] > 0 => {
                let mut keys = tensor.to_vec1::<i64>()?;
                keys.remove(start + send_splits[self.target] - 1);
                let mut splits = send_splits.to_vec();
                splits[self.target] -= 1;
                let keys = Tensor::new(keys.as_slice(), tensor.device())?;
                self.inner.all_to_all_v(&keys, &splits, recv_splits)
            }
            _ => self.inner.all_to_all_v(tensor, send_splits, recv_splits),
        }
    }

    fn barrier(&self) -> distributed::Result<()> {
        self.inner.barrier()
    }
}

/// Two-device model-parallel distributor whose device 0 corrupts what it
/// sends to device 1.
fn tampered_distributor(tamper: Tamper) -> DataDistributor {
    let contexts = LocalCommunicator::group(2, TEST_RECV_TIMEOUT)
        .into_iter()
        .enumerate()
        .map(|(device_id, inner)| {
            let comm: Arc<dyn DeviceCommunicator> = if device_id == 0 {
                Arc::new(TamperingComm {
                    inner,
                    tamper,
                    target: 1,
                })
            } else {
                Arc::new(inner)
            };
            DeviceContext::new(device_id, Device::Cpu, comm)
        })
        .collect();
    DataDistributor::new(contexts, tiny_mp_config(2), Sharding::default()).unwrap()
}

/// One step where device 0 routes three odd keys to device 1. Returns each
/// device's result with the output it was given.
fn tampered_step(
    distributor: &mut DataDistributor,
) -> Vec<(Result<(), DistributorError>, Vec<EmbeddingInput>)> {
    let batches = vec![
        DeviceBatch::from_samples(&[vec![vec![1, 3], vec![5, 4]]]),
        DeviceBatch::from_samples(&[vec![vec![0], vec![7]]]),
    ];
    run_spmd(distributor.workers_mut(), |worker| {
        let (keys, ranges) = batches[worker.device_id()]
            .to_tensors(&Device::Cpu)
            .unwrap();
        let mut output = worker.allocate_output().unwrap();
        let result = worker.distribute(&keys, &ranges, &mut output, 4);
        (result, output)
    })
}

fn assert_receiver_faulted(
    results: &[(Result<(), DistributorError>, Vec<EmbeddingInput>)],
    phase: ExchangePhase,
) {
    match &results[1].0 {
        Err(DistributorError::ProtocolViolation { phase: got, .. }) => assert_eq!(*got, phase),
        other => panic!("expected {phase:?} violation on device 1, got {other:?}"),
    }
    match &results[0].0 {
        Err(DistributorError::StepAborted { failed }) => assert_eq!(failed, &vec![1]),
        other => panic!("expected StepAborted on device 0, got {other:?}"),
    }
    for (_, output) in results {
        assert!(output.iter().all(|out| out.num_keys() == 0));
    }
}

#[test]
fn test_inconsistent_count_total_aborts_step() {
    let mut distributor = tampered_distributor(Tamper::CountTotal);
    let results = tampered_step(&mut distributor);
    assert_receiver_faulted(&results, ExchangePhase::Counts);
    for worker in distributor.workers_mut().iter() {
        assert_eq!(worker.metrics().aborted_steps(), 1);
        assert_eq!(worker.metrics().steps(), 0);
    }
}

#[test]
fn test_short_payload_segment_aborts_step() {
    let mut distributor = tampered_distributor(Tamper::ShortPayload);
    let results = tampered_step(&mut distributor);
    assert_receiver_faulted(&results, ExchangePhase::Payload);
    for worker in distributor.workers_mut().iter() {
        assert_eq!(worker.metrics().aborted_steps(), 1);
    }
}

// ─── Single device ───────────────────────────────────────────────────────────

#[test]
fn test_single_device_keeps_every_key() {
    let config = tiny_mixed_config(1);
    let mut distributor = local_distributor(config.clone(), raw_key_sharding());
    let batches = random_batches(&config, 8, 42);
    let (keys, ranges) = batches[0].to_tensors(&Device::Cpu).unwrap();
    let mut output = distributor.allocate_output(0).unwrap();
    distributor
        .distribute(0, &keys, &ranges, &mut output, 8)
        .unwrap();

    let (want, range) = expected_mp_output(&config, &batches, 0, 0);
    assert_eq!(output[0].keys(), want.as_slice());
    assert_eq!(output[0].bucket_range(), range.as_slice());
    assert!(matches!(
        distributor.distribute(1, &keys, &ranges, &mut output, 8),
        Err(DistributorError::UnknownDevice { gpu_id: 1, .. })
    ));
}
