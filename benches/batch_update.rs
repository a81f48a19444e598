use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use state_tree::{Hash, MemoryStore, SkipMerkleTree, SparseMerkleTree};

const KEY_LENGTH: usize = 32;

fn pairs(n: u32) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let keys = (0..n)
        .map(|i| Hash::digest(&i.to_be_bytes()).as_bytes().to_vec())
        .collect();
    let values = (0..n).map(|i| i.to_le_bytes().repeat(4)).collect();
    (keys, values)
}

fn bench_updates(c: &mut Criterion) {
    for n in [256u32, 4096] {
        let (keys, values) = pairs(n);
        let mut group = c.benchmark_group(format!("update_{}", n));
        group.sample_size(20);

        group.bench_function("sequential", |b| {
            b.iter(|| {
                let store = MemoryStore::new();
                let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);
                for (k, v) in keys.iter().zip(&values) {
                    tree.update(k, v).unwrap();
                }
                std::hint::black_box(tree.root_hash())
            });
        });

        group.bench_function("batch", |b| {
            b.iter_batched(
                || (keys.clone(), values.clone()),
                |(keys, values)| {
                    let store = MemoryStore::new();
                    let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);
                    tree.update_batch(keys, values).unwrap();
                    std::hint::black_box(tree.root_hash())
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_function("batch_parallel", |b| {
            b.iter_batched(
                || (keys.clone(), values.clone()),
                |(keys, values)| {
                    let store = MemoryStore::new();
                    let mut tree =
                        SparseMerkleTree::new(&store, KEY_LENGTH).with_parallelism(Some(64));
                    tree.update_batch(keys, values).unwrap();
                    std::hint::black_box(tree.root_hash())
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_function("skip_batch", |b| {
            b.iter_batched(
                || (keys.clone(), values.clone()),
                |(keys, values)| {
                    let store = MemoryStore::new();
                    let mut tree = SkipMerkleTree::new(&store, KEY_LENGTH, 4).unwrap();
                    tree.update_batch(keys, values).unwrap();
                    std::hint::black_box(tree.root_hash())
                },
                BatchSize::LargeInput,
            );
        });

        group.finish();
    }
}

fn bench_proofs(c: &mut Criterion) {
    let (keys, values) = pairs(4096);
    let store = MemoryStore::new();
    let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);
    tree.update_batch(keys.clone(), values).unwrap();

    let mut group = c.benchmark_group("multi_proof");
    for count in [1usize, 16, 256] {
        let queries: Vec<_> = keys.iter().step_by(4096 / count).cloned().collect();
        group.bench_function(format!("generate_{}", count), |b| {
            b.iter(|| std::hint::black_box(tree.generate_multi_proof(&queries).unwrap()));
        });

        let proof = tree.generate_multi_proof(&queries).unwrap();
        let root = tree.root_hash();
        group.bench_function(format!("verify_{}", count), |b| {
            b.iter(|| state_tree::verify(&queries, &proof, &root, KEY_LENGTH));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_updates, bench_proofs);
criterion_main!(benches);
