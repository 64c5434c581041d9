//! Throughput benchmarks: messages per second over inproc pipes
//!
//! Measures:
//! - one producer thread streaming into one consumer through a socket pair
//!   (flow control and wake-ups across threads)
//! - raw pipe pair on a single thread (queue + watermark accounting only)

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use tether::prelude::*;
use tether::tether_core::prelude::{
    pipe_pair, CommandBus, Granularity, ObjectNode, Pipe, PipeEvents, PipeId,
};

const MESSAGE_SIZES: &[usize] = &[64, 1024, 16384];
const MESSAGE_COUNT: usize = 10_000;

fn socket_pair_throughput(c: &mut Criterion) {
    tether::dev_tracing::init_tracing();
    let mut group = c.benchmark_group("throughput/socket_pair");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    let ctx = Context::new(ContextConfig::default().with_io_threads(1)).unwrap();

    for &size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes((size * MESSAGE_COUNT) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let payload = Bytes::from(vec![0u8; size]);
            let endpoint = format!("inproc://bench-{size}");

            b.iter(|| {
                let mut server = ctx.socket(Options::default()).unwrap();
                server.bind(&endpoint).unwrap();
                let mut client = ctx.socket(Options::default()).unwrap();
                client.connect(&endpoint).unwrap();

                let payload = payload.clone();
                let producer = std::thread::spawn(move || {
                    for _ in 0..MESSAGE_COUNT {
                        client.send(Msg::from_data(black_box(payload.clone()))).unwrap();
                    }
                    client
                });
                for _ in 0..MESSAGE_COUNT {
                    black_box(server.recv().unwrap());
                }
                let client = producer.join().unwrap();
                // Release the endpoint before the next iteration binds it.
                server.unbind(&endpoint).unwrap();
                client.close();
                server.close();
            });
        });
    }

    group.finish();
    ctx.terminate().unwrap();
}

struct Quiet;

impl PipeEvents for Quiet {
    fn read_activated(&mut self, _: PipeId) {}
    fn write_activated(&mut self, _: PipeId) {}
    fn hiccuped(&mut self, _: PipeId) {}
    fn pipe_terminated(&mut self, _: PipeId) {}
}

/// Deliver pending pipe commands of slot `tid` to `pipe`.
fn deliver(bus: &CommandBus, tid: u32, pipe: &mut Pipe) {
    while let Ok(Some(command)) = bus.mailbox(tid).recv(Some(Duration::ZERO)) {
        let _ = pipe.process(command.kind, &mut Quiet);
    }
}

fn raw_pipe_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("throughput/raw_pipe");
    group.throughput(Throughput::Elements(MESSAGE_COUNT as u64));

    for hwm in [0u32, 16, 1000] {
        group.bench_with_input(BenchmarkId::new("hwm", hwm), &hwm, |b, &hwm| {
            let bus = Arc::new(CommandBus::new(2, 0..0, Granularity::default()));
            let a = ObjectNode::new(Arc::clone(&bus), 0).object_ref();
            let z = ObjectNode::new(Arc::clone(&bus), 1).object_ref();
            let [mut writer, mut reader] = pipe_pair(&bus, [a, z], [hwm, hwm], [false, false]);
            let payload = Bytes::from_static(&[0u8; 64]);

            b.iter(|| {
                for _ in 0..MESSAGE_COUNT {
                    if writer.write(Msg::from_data(payload.clone())).is_err() {
                        deliver(&bus, 0, &mut writer);
                        continue;
                    }
                    writer.flush();
                    deliver(&bus, 1, &mut reader);
                    black_box(reader.read());
                }
                deliver(&bus, 0, &mut writer);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, socket_pair_throughput, raw_pipe_throughput);
criterion_main!(benches);
