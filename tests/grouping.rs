//! Grouping-engine scenarios, plus an end-to-end shuffle-then-group run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kvshuffle::{
    BlockStore, Collectives, Exchanger, GroupEngine, GroupedReader, LocalCluster, ShuffleConfig,
    ShuffleError, hash_key, record::grouped_size, write_record,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine_config() -> ShuffleConfig {
    init_logging();
    ShuffleConfig {
        buckets: 64,
        page_size: 4096,
        block_size: 1 << 16,
        max_blocks: 64,
        ..Default::default()
    }
}

/// Pack records into an input store, one block per outer slice.
fn input_store(cfg: &ShuffleConfig, blocks: &[&[(&[u8], &[u8])]]) -> BlockStore {
    let mut store = BlockStore::new(cfg.block_size, cfg.max_blocks);
    for recs in blocks {
        let mut bytes = Vec::new();
        for (k, v) in *recs {
            write_record(&mut bytes, k, v);
        }
        let id = store.add_block().unwrap();
        store.acquire(id).unwrap();
        store.buffer_mut(id).unwrap()[..bytes.len()].copy_from_slice(&bytes);
        store.set_data_size(id, bytes.len()).unwrap();
        store.release(id).unwrap();
    }
    store
}

fn as_refs(recs: &[(Vec<u8>, Vec<u8>)]) -> Vec<(&[u8], &[u8])> {
    recs.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect()
}

fn decode_groups(store: &BlockStore) -> Vec<(Vec<u8>, Vec<Vec<u8>>)> {
    let mut out = Vec::new();
    for b in 0..store.nblocks() {
        for rec in GroupedReader::new(store.data(b).unwrap()) {
            out.push((
                rec.key.to_vec(),
                rec.values().map(|v| v.to_vec()).collect(),
            ));
        }
    }
    out
}

#[test]
fn test_groups_interleaved_keys() {
    let cfg = engine_config();
    let input = input_store(
        &cfg,
        &[&[(b"a".as_slice(), b"1".as_slice()), (b"b", b"2"), (b"a", b"3")]],
    );
    let mut output = BlockStore::new(cfg.block_size, cfg.max_blocks);
    let stats = GroupEngine::new(&cfg, 1)
        .unwrap()
        .group(&input, &mut output)
        .unwrap();

    let groups = decode_groups(&output);
    assert_eq!(
        groups,
        vec![
            (b"a".to_vec(), vec![b"1".to_vec(), b"3".to_vec()]),
            (b"b".to_vec(), vec![b"2".to_vec()]),
        ]
    );
    assert_eq!(stats.records, 3);
    assert_eq!(stats.unique_keys, 2);
    assert_eq!(
        stats.grouped_bytes,
        (grouped_size(1, 2, 2) + grouped_size(1, 1, 1)) as u64
    );
}

#[test]
fn test_group_counts_and_bytes_exact() {
    let cfg = engine_config();
    // 40 records over 10 keys, spread across two input blocks.
    let make = |lo: u32, hi: u32| -> Vec<(Vec<u8>, Vec<u8>)> {
        (lo..hi)
            .map(|i| {
                (
                    format!("key{}", i % 10).into_bytes(),
                    format!("value-{i}").into_bytes(),
                )
            })
            .collect()
    };
    let block_a = make(0, 20);
    let block_b = make(20, 40);
    let (ra, rb) = (as_refs(&block_a), as_refs(&block_b));
    let input = input_store(&cfg, &[&ra, &rb]);

    let mut output = BlockStore::new(cfg.block_size, cfg.max_blocks);
    let stats = GroupEngine::new(&cfg, 1)
        .unwrap()
        .group(&input, &mut output)
        .unwrap();
    assert_eq!(stats.records, 40);
    assert_eq!(stats.unique_keys, 10);

    let groups = decode_groups(&output);
    assert_eq!(groups.len(), 10);
    let total: u64 = groups
        .iter()
        .map(|(k, vs)| {
            grouped_size(k.len(), vs.len(), vs.iter().map(|v| v.len()).sum()) as u64
        })
        .sum();
    assert_eq!(stats.grouped_bytes, total);
    for (key, values) in &groups {
        assert_eq!(values.len(), 4, "key {:?}", key);
        // Arrival order: block A's two values, then block B's two.
        let expect: Vec<Vec<u8>> = (0..40u32)
            .filter(|i| format!("key{}", i % 10).as_bytes() == key.as_slice())
            .map(|i| format!("value-{i}").into_bytes())
            .collect();
        assert_eq!(values, &expect);
    }
}

#[test]
fn test_group_sharded_across_threads() {
    let cfg = engine_config();
    let nthreads = 4;
    let recs: Vec<(Vec<u8>, Vec<u8>)> = (0..200u32)
        .map(|i| {
            (
                format!("word{}", i % 23).into_bytes(),
                i.to_le_bytes().to_vec(),
            )
        })
        .collect();
    let refs = as_refs(&recs);
    let input = input_store(&cfg, &[&refs]);

    let mut output = BlockStore::new(cfg.block_size, cfg.max_blocks);
    let stats = GroupEngine::new(&cfg, nthreads)
        .unwrap()
        .group(&input, &mut output)
        .unwrap();
    assert_eq!(stats.records, 200);
    assert_eq!(stats.unique_keys, 23);

    // Every key lands in exactly one shard with all its values in scan
    // order.
    let groups = decode_groups(&output);
    assert_eq!(groups.len(), 23);
    for (key, values) in &groups {
        let shard = (hash_key(key) % nthreads as u64) as usize;
        assert!(shard < nthreads);
        let expect: Vec<Vec<u8>> = (0..200u32)
            .filter(|i| format!("word{}", i % 23).as_bytes() == key.as_slice())
            .map(|i| i.to_le_bytes().to_vec())
            .collect();
        assert_eq!(values, &expect, "key {:?}", key);
    }
}

#[test]
fn test_group_of_grouped_singletons_is_identity() {
    let cfg = engine_config();
    let input = input_store(
        &cfg,
        &[&[
            (b"alpha".as_slice(), b"1".as_slice()),
            (b"beta", b"2"),
            (b"gamma", b"3"),
        ]],
    );
    let mut first = BlockStore::new(cfg.block_size, cfg.max_blocks);
    let engine = GroupEngine::new(&cfg, 1).unwrap();
    engine.group(&input, &mut first).unwrap();
    let groups = decode_groups(&first);

    // Re-encode the grouped singletons as plain records and group again.
    let reencoded: Vec<(Vec<u8>, Vec<u8>)> = groups
        .iter()
        .map(|(k, vs)| {
            assert_eq!(vs.len(), 1);
            (k.clone(), vs[0].clone())
        })
        .collect();
    let refs = as_refs(&reencoded);
    let again = input_store(&cfg, &[&refs]);
    let mut second = BlockStore::new(cfg.block_size, cfg.max_blocks);
    engine.group(&again, &mut second).unwrap();
    assert_eq!(decode_groups(&second), groups);
}

#[test]
fn test_group_output_overflow_is_unsupported() {
    let cfg = engine_config();
    let recs: Vec<(Vec<u8>, Vec<u8>)> = (0..50u32)
        .map(|i| (format!("key{i}").into_bytes(), vec![b'x'; 20]))
        .collect();
    let refs = as_refs(&recs);
    let input = input_store(&cfg, &[&refs]);

    // Output blocks far too small for the grouped payload.
    let mut output = BlockStore::new(256, 4);
    let err = GroupEngine::new(&cfg, 1)
        .unwrap()
        .group(&input, &mut output)
        .unwrap_err();
    match err {
        ShuffleError::Unsupported { needed, capacity, .. } => {
            assert!(needed > capacity);
            assert_eq!(capacity, 256);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_group_empty_input() {
    let cfg = engine_config();
    let input = BlockStore::new(cfg.block_size, cfg.max_blocks);
    let mut output = BlockStore::new(cfg.block_size, cfg.max_blocks);
    let stats = GroupEngine::new(&cfg, 2)
        .unwrap()
        .group(&input, &mut output)
        .unwrap();
    assert_eq!(stats.records, 0);
    assert_eq!(stats.unique_keys, 0);
    assert_eq!(output.nblocks(), 0);
}

#[test]
fn test_end_to_end_wordcount() {
    // Shuffle words to their home ranks, group, and check global counts.
    let world = 2u32;
    let cfg = ShuffleConfig {
        send_buf_size: 256,
        thread_buf_size: 64,
        block_size: 1 << 16,
        max_blocks: 64,
        buckets: 64,
        page_size: 4096,
        ..Default::default()
    };
    let corpus = ["apple", "banana", "apple", "cherry", "banana", "apple"];

    let comms = LocalCluster::new(world);
    let per_rank: Vec<HashMap<Vec<u8>, usize>> = std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let cfg = &cfg;
                s.spawn(move || {
                    let rank = comm.rank();
                    let store =
                        Arc::new(Mutex::new(BlockStore::new(cfg.block_size, cfg.max_blocks)));
                    let exchanger = Exchanger::new(comm, cfg, 1, Arc::clone(&store)).unwrap();
                    let mut worker = exchanger.workers().pop().unwrap();
                    // Every rank maps the same corpus.
                    for word in corpus {
                        let dest = (hash_key(word.as_bytes()) % world as u64) as u32;
                        worker.emit(dest, word.as_bytes(), &1u32.to_le_bytes()).unwrap();
                    }
                    worker.finish().unwrap();
                    exchanger.finalize().unwrap();

                    let mut grouped = BlockStore::new(cfg.block_size, cfg.max_blocks);
                    let received = store.lock().unwrap();
                    GroupEngine::new(cfg, 1)
                        .unwrap()
                        .group(&received, &mut grouped)
                        .unwrap();
                    decode_groups(&grouped)
                        .into_iter()
                        .map(|(k, vs)| {
                            assert_eq!((hash_key(&k) % world as u64) as u32, rank);
                            (k, vs.len())
                        })
                        .collect::<HashMap<_, _>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut counts: HashMap<Vec<u8>, usize> = HashMap::new();
    for rank_counts in per_rank {
        for (word, n) in rank_counts {
            *counts.entry(word).or_default() += n;
        }
    }
    // Each word appears `world` times its corpus count.
    assert_eq!(counts[b"apple".as_slice()], 3 * world as usize);
    assert_eq!(counts[b"banana".as_slice()], 2 * world as usize);
    assert_eq!(counts[b"cherry".as_slice()], world as usize);
    assert_eq!(counts.len(), 3);
}
