#![allow(missing_docs)]
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use security_engine::{
    config::KeyConfig, crypto::MasterKey, keys::MemoryKeyStore, KeyAlgorithm, KeyManager, MemoryCache,
    SecretCipher, SecretStore, SystemClock,
};
use std::sync::Arc;

fn store() -> SecretStore {
    let clock = Arc::new(SystemClock);
    let master = MasterKey::from_secret("bench-master-secret-0123456789abcdefghij").unwrap();
    let config = KeyConfig {
        rsa_bits: 2048,
        ..KeyConfig::default()
    };
    let keys = Arc::new(KeyManager::new(
        Arc::new(MemoryKeyStore::new()),
        master,
        config,
        clock.clone(),
    ));
    keys.generate_key("documents", KeyAlgorithm::RsaHybrid).unwrap();
    SecretStore::new(keys, Arc::new(MemoryCache::with_clock(clock)))
}

fn bench_symmetric(c: &mut Criterion) {
    let store = store();
    let mut group = c.benchmark_group("aes256gcm");

    for size in [64usize, 1024, 64 * 1024] {
        let data = vec![0x5au8; size];
        let record = store.encrypt(&data, "pii").unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", size), &data, |b, data| {
            b.iter(|| store.encrypt(black_box(data), "pii").unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decrypt", size), &record, |b, record| {
            b.iter(|| store.decrypt(black_box(record)).unwrap())
        });
    }
    group.finish();
}

fn bench_hybrid(c: &mut Criterion) {
    let store = store();
    let data = vec![0x5au8; 16 * 1024];
    let record = store.encrypt(&data, "documents").unwrap();

    c.bench_function("rsa_hybrid_encrypt_16kb", |b| {
        b.iter(|| store.encrypt(black_box(&data), "documents").unwrap())
    });
    c.bench_function("rsa_hybrid_decrypt_16kb", |b| {
        b.iter(|| store.decrypt(black_box(&record)).unwrap())
    });
}

fn bench_envelope(c: &mut Criterion) {
    let store = store();
    let envelope = store.encrypt_string("4111 1111 1111 1111", "payment").unwrap();

    c.bench_function("envelope_decrypt_string", |b| {
        b.iter(|| store.decrypt_string(black_box(&envelope)).unwrap())
    });
}

criterion_group!(benches, bench_symmetric, bench_hybrid, bench_envelope);
criterion_main!(benches);
