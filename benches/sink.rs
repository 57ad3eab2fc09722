use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use watermark_link::audio::SampleRing;
use watermark_link::stream::window::WindowConfig;
use watermark_link::stream::{Consumer, FormatConverter, OverflowPolicy, Producer, StreamFormat, Windower};

/// Counts samples and discards them
#[derive(Default)]
struct Sink(AtomicUsize);

impl<T> Consumer<T> for Sink {
    fn consume(&self, samples: &[T]) {
        self.0.fetch_add(samples.len(), Ordering::Relaxed);
    }
}

/// Producer-side write followed by a callback-sized pull
fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    for block in [160usize, 512, 960] {
        let input: Vec<i16> = (0..block as i16).collect();
        let mut out = vec![0i16; block];
        let mut ring = SampleRing::new(512 * 64, OverflowPolicy::DropOldest);
        group.bench_with_input(BenchmarkId::new("write_read", block), &block, |b, _| {
            b.iter(|| {
                ring.write(black_box(&input));
                ring.read_into(black_box(&mut out));
            })
        });
    }
    group.finish();
}

fn bench_windower(c: &mut Criterion) {
    let windower = Windower::<i16>::new(
        StreamFormat::mono(16000),
        WindowConfig::contiguous(1600, 16),
    )
    .expect("valid window");
    let sink = Arc::new(Sink::default());
    windower.attach(&sink);
    // Network-sized irregular blocks
    let block: Vec<i16> = vec![1; 700];

    c.bench_function("windower_700", |b| b.iter(|| windower.consume(black_box(&block))));
}

fn bench_resample(c: &mut Criterion) {
    let converter = FormatConverter::<i16, f32>::new(StreamFormat::mono(48000), StreamFormat::mono(16000))
        .expect("valid conversion");
    let sink = Arc::new(Sink::default());
    converter.attach(&sink);
    let block: Vec<i16> = (0..960).map(|i| ((i * 37) % 2000) as i16).collect();

    c.bench_function("resample_48k_16k_960", |b| {
        b.iter(|| converter.consume(black_box(&block)))
    });
}

criterion_group!(benches, bench_ring, bench_windower, bench_resample);
criterion_main!(benches);
