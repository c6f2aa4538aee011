//! Throughput of the stream adapter over a pipe and the cost of a full launch

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use procpipe::subprocess::pipe::Pipe;
use procpipe::subprocess::{Process, ProcessCommandBuilder, ReadStream, WriteStream};
use std::hint::black_box;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

const PAYLOAD_SIZE: usize = 1 << 20;

fn pump(capacity: usize, chunk: usize) -> usize {
    let (read, write) = Pipe::new("bench").unwrap().into_ends();
    let writer = thread::spawn(move || {
        let mut stream = WriteStream::with_capacity(write, capacity);
        let data = vec![b'x'; chunk];
        let mut sent = 0;
        while sent < PAYLOAD_SIZE {
            stream.write_all(&data).unwrap();
            sent += chunk;
        }
        stream.flush().unwrap();
    });

    let mut stream = ReadStream::with_capacity(read, capacity);
    let mut sink = Vec::with_capacity(PAYLOAD_SIZE);
    stream.read_to_end(&mut sink).unwrap();
    writer.join().unwrap();
    sink.len()
}

fn bench_stream_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_throughput");
    group
        .warm_up_time(Duration::from_secs(1))
        .measurement_time(Duration::from_secs(5))
        .throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));

    for capacity in [512, 4096, 65536] {
        for chunk in [16, 1024] {
            group.bench_with_input(
                BenchmarkId::new(format!("capacity_{}", capacity), chunk),
                &(capacity, chunk),
                |b, &(capacity, chunk)| b.iter(|| black_box(pump(capacity, chunk))),
            );
        }
    }
    group.finish();
}

fn bench_line_reading(c: &mut Criterion) {
    let text: String = (0..10_000).map(|i| format!("line number {}\n", i)).collect();

    c.bench_function("next_line_10k", |b| {
        b.iter(|| {
            let (read, write) = Pipe::new("bench").unwrap().into_ends();
            let payload = text.clone();
            let writer = thread::spawn(move || {
                let mut stream = WriteStream::new(write);
                stream.write_all(payload.as_bytes()).unwrap();
            });

            let mut stream = ReadStream::new(read);
            let mut count = 0;
            while let Some(line) = stream.next_line() {
                count += black_box(line).len();
            }
            writer.join().unwrap();
            count
        })
    });
}

fn bench_process_launch(c: &mut Criterion) {
    c.benchmark_group("process_launch")
        .sample_size(20)
        .bench_function("run_true", |b| {
            b.iter(|| {
                let mut process = Process::new(ProcessCommandBuilder::new("true").build_config());
                black_box(process.run().unwrap())
            })
        });
}

criterion_group!(
    benches,
    bench_stream_throughput,
    bench_line_reading,
    bench_process_launch
);
criterion_main!(benches);
