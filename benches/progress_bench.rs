use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use videoforge::ffmpeg::progress::{parse_time_token, read_progress};
use videoforge::ffmpeg::ProgressCallback;

/// A `-progress pipe:2` style stream covering `seconds` of media
fn create_progress_stream(seconds: usize) -> String {
    let mut stream = String::new();
    for s in 0..seconds {
        stream.push_str(&format!(
            "frame={}\nfps=30.0\nbitrate=1024.0kbits/s\nout_time=00:{:02}:{:02}.00\nprogress=continue\n",
            s * 30,
            s / 60,
            s % 60
        ));
    }
    stream.push_str("progress=end\n");
    stream
}

fn bench_parse_time_token(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_time_token");

    group.bench_function("match", |b| {
        b.iter(|| parse_time_token(black_box("frame=120 fps=30 time=00:12:34.56 bitrate=1024k")))
    });
    group.bench_function("no_match", |b| {
        b.iter(|| parse_time_token(black_box("progress=continue")))
    });

    group.finish();
}

fn bench_read_progress(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("read_progress");

    for seconds in [60, 600, 3600] {
        let stream = create_progress_stream(seconds);
        group.bench_function(format!("stream_{seconds}s"), |b| {
            b.to_async(&rt).iter(|| async {
                let callback: ProgressCallback = Arc::new(|progress: f64, _: &str| {
                    black_box(progress);
                });
                read_progress(black_box(stream.as_bytes()), seconds as f64, callback).await
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse_time_token, bench_read_progress);
criterion_main!(benches);
