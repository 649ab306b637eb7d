//! Packet codec benchmarks
//!
//! Encode and decode throughput for each cipher suite at typical channel
//! data sizes.
//!
//! Run with: `cargo bench --bench codec_bench`

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::SeedableRng;
use strand_proto::ssh::codec::{OpeningSuite, PacketDecoder, PacketEncoder, SealingSuite};
use strand_proto::ssh::compression::CompressionAlgorithm;
use strand_proto::ssh::crypto::{CipherAlgorithm, MacAlgorithm, MacKey};

const MAX_PACKET: usize = 35000;

fn suites(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>, compression: CompressionAlgorithm) -> (SealingSuite, OpeningSuite) {
    let key = [0x5au8; 64];
    let iv = [0xa5u8; 16];
    let mac_key = [0x3cu8; 64];
    let seal = SealingSuite {
        cipher: cipher.sealing(&key, &iv).unwrap(),
        mac: mac.map(|m| MacKey::new(m, &mac_key).unwrap()),
        compressor: compression.compressor(true),
    };
    let open = OpeningSuite {
        cipher: cipher.opening(&key, &iv).unwrap(),
        mac: mac.map(|m| MacKey::new(m, &mac_key).unwrap()),
        decompressor: compression.decompressor(true),
    };
    (seal, open)
}

fn cases() -> Vec<(&'static str, CipherAlgorithm, Option<MacAlgorithm>, CompressionAlgorithm)> {
    vec![
        ("chacha20-poly1305", CipherAlgorithm::ChaCha20Poly1305, None, CompressionAlgorithm::None),
        ("aes256-gcm", CipherAlgorithm::Aes256Gcm, None, CompressionAlgorithm::None),
        ("aes128-ctr+hmac-sha2-256", CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256), CompressionAlgorithm::None),
        ("aes256-gcm+zlib", CipherAlgorithm::Aes256Gcm, None, CompressionAlgorithm::Zlib),
    ]
}

fn payload(len: usize) -> Vec<u8> {
    let mut data = vec![94u8];
    data.extend((0..len).map(|i| (i % 61) as u8));
    data
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [256usize, 4096, 32768] {
        group.throughput(Throughput::Bytes(size as u64));
        for (name, cipher, mac, compression) in cases() {
            let (seal, _) = suites(cipher, mac, compression);
            let mut encoder = PacketEncoder::new(MAX_PACKET);
            encoder.install(seal);
            let mut rng = StdRng::seed_from_u64(1);
            let data = payload(size);
            let mut out = BytesMut::with_capacity(size + 128);
            group.bench_with_input(BenchmarkId::new(name, size), &data, |b, data| {
                b.iter(|| {
                    out.clear();
                    encoder.encode(black_box(data), &mut rng, &mut out).unwrap();
                })
            });
        }
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");
    let size = 32768;
    group.throughput(Throughput::Bytes(size as u64));
    for (name, cipher, mac, compression) in cases() {
        let (seal, open) = suites(cipher, mac, compression);
        let mut encoder = PacketEncoder::new(MAX_PACKET);
        let mut decoder = PacketDecoder::new(MAX_PACKET);
        encoder.install(seal);
        decoder.install(open).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let data = payload(size);
        let mut wire = BytesMut::with_capacity(size + 128);
        group.bench_function(name, |b| {
            b.iter(|| {
                wire.clear();
                encoder.encode(&data, &mut rng, &mut wire).unwrap();
                decoder.feed(&wire);
                let packet = decoder.decode().unwrap().unwrap();
                black_box(packet.payload().len());
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_round_trip);
criterion_main!(benches);
