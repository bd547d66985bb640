extern crate stash_lib as stash;
use criterion::{criterion_group, criterion_main, Criterion};
use stash::crypto::{decrypt_copy, encrypt_copy};
use stash::SecretKey;
use std::io::Write;

// Empty writer since we don't actually need the ciphertext anywhere
#[derive(Clone, Debug)]
pub struct NullSink;
impl Write for NullSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        Ok(())
    }
}

/// Create a payload of the given size
fn create_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn bench_encrypt_copy(c: &mut Criterion) {
    let key = SecretKey::generate();

    let payload = create_payload(100_000);
    c.bench_function("encrypt copy 100k", |b| {
        b.iter(|| {
            let total = encrypt_copy(&key, &mut &payload[..], &mut NullSink {}).unwrap();
            assert!(total >= 100_000);
        })
    });

    let payload = create_payload(1_000_000);
    c.bench_function("encrypt copy 1M", |b| {
        b.iter(|| {
            let total = encrypt_copy(&key, &mut &payload[..], &mut NullSink {}).unwrap();
            assert!(total >= 1_000_000);
        })
    });

    // Configure Criterion.rs with larger measurement times
    // for larger payloads.
    let mut group = c.benchmark_group("larger-payloads");
    group.measurement_time(core::time::Duration::new(60, 0));
    group.sample_size(10);

    let payload = create_payload(100_000_000);
    group.bench_function("encrypt copy 100M", |b| {
        b.iter(|| {
            let total = encrypt_copy(&key, &mut &payload[..], &mut NullSink {}).unwrap();
            assert!(total >= 100_000_000);
        })
    });

    group.finish();
}

fn bench_decrypt_copy(c: &mut Criterion) {
    let key = SecretKey::generate();

    let payload = create_payload(1_000_000);
    let mut wire = Vec::new();
    encrypt_copy(&key, &mut &payload[..], &mut wire).unwrap();

    c.bench_function("decrypt copy 1M", |b| {
        b.iter(|| {
            let total = decrypt_copy(&key, &mut &wire[..], &mut NullSink {}).unwrap();
            assert!(total >= 1_000_000);
        })
    });
}

criterion_group!(benches, bench_encrypt_copy, bench_decrypt_copy);
criterion_main!(benches);
