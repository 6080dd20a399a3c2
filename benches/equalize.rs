//! Criterion benchmarks comparing GPU and CPU histogram equalization.
//!
//! To run the benchmarks use `cargo bench`.  Criterion will execute
//! each function multiple times and report statistics such as the
//! median and standard deviation of the run times.  The GPU bench
//! includes the cost of uploading the image, dispatching the four
//! passes and reading back the result, which makes it representative
//! of real-world latency when equalizing one image at a time.

use criterion::{criterion_group, criterion_main, Criterion};
use rand::Rng;

use histeq::{cpu, GpuContext, GpuEqualizer};

fn equalize_benchmark(c: &mut Criterion) {
    // Establish a single GPU context and pipeline up front so that the
    // device and pipeline creation overhead is not included in the
    // benchmark.  In a real application both would be reused across
    // many images.
    let context = GpuContext::new_blocking().expect("failed to initialise GPU context");
    let equalizer = GpuEqualizer::new(&context);

    let mut rng = rand::thread_rng();
    for (width, height) in [(256usize, 256usize), (1024, 1024), (4096, 4096)] {
        let pixels: Vec<u8> = (0..width * height).map(|_| rng.gen()).collect();

        c.bench_function(&format!("gpu equalize {width}x{height}"), |bencher| {
            bencher.iter(|| {
                let mut data = pixels.clone();
                equalizer
                    .equalize(&context, &mut data)
                    .expect("GPU equalization failed");
                data
            });
        });
        c.bench_function(&format!("cpu equalize {width}x{height}"), |bencher| {
            bencher.iter(|| {
                let mut data = pixels.clone();
                cpu::equalize(&mut data);
                data
            });
        });
    }
}

criterion_group!(benches, equalize_benchmark);
criterion_main!(benches);
