use dynamite_slurper::{
    codec::{Codec, HEADER_SIZE, LEGACY_RECORD_SIZE, SAMPLE_SIZE},
    config::Config,
    filter::{FilterKernel, IncrementalConvolution},
    pipeline::Processor,
    FeedSample, CHANNELS,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;

/// Samples in one full size notification
const PACKET_SAMPLES: usize = 20;

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    let mut dummy_payload = [0u8; HEADER_SIZE + PACKET_SAMPLES * SAMPLE_SIZE];
    rng.fill(&mut dummy_payload[..]);
    let mut dummy_legacy = [0u8; 10 * LEGACY_RECORD_SIZE];
    rng.fill(&mut dummy_legacy[..]);

    let header = Codec::header();
    let legacy = Codec::legacy();

    c.bench_function("header decode", |b| {
        b.iter(|| header.decode(black_box(&dummy_payload)))
    });

    c.bench_function("legacy decode", |b| {
        b.iter(|| legacy.decode(black_box(&dummy_legacy)))
    });

    let kernel = FilterKernel::low_pass(5.0, 1000.0, 101).unwrap();
    let chunk: Vec<f64> = (0..PACKET_SAMPLES).map(|_| rng.gen_range(-1e6..1e6)).collect();
    c.bench_function("incremental convolution", |b| {
        let mut conv = IncrementalConvolution::new(kernel.clone());
        b.iter(|| {
            conv.process(black_box(&chunk));
        })
    });

    let stream = Config::default().resolve(None).unwrap();
    let samples: Vec<FeedSample> = (0..PACKET_SAMPLES)
        .map(|_| FeedSample::new([(); CHANNELS].map(|_| rng.gen_range(-8_388_608..8_388_608))))
        .collect();
    c.bench_function("process packet", |b| {
        let mut processor = Processor::new(&stream);
        b.iter(|| processor.process(black_box(&samples)))
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
