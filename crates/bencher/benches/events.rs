use std::hint::black_box;

use bencher::QUOTES;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use micro_fabric::flags;
use micro_sse_gateway::codec::{encode_event, EventFields, SseDecoder, SseEvent, SseSink};
use micro_sse_gateway::SseError;

#[derive(Default)]
struct Collector {
    events: Vec<SseEvent>,
}

impl SseSink for Collector {
    fn on_event(&mut self, event: SseEvent) -> bool {
        self.events.push(event);
        true
    }

    fn on_error(&mut self, error: SseError) {
        panic!("fixture should decode: {error}");
    }
}

fn benchmark_event_decoder(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("event_decoder");
    group.throughput(Throughput::Bytes(QUOTES.len()));

    for chunk in [64, QUOTES.content().len()] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = SseDecoder::new(4096);
                let mut collector = Collector::default();
                let mut pending = Vec::with_capacity(4096);
                for bytes in QUOTES.content().chunks(chunk) {
                    pending.extend_from_slice(bytes);
                    let consumed = decoder.decode(&mut collector, &pending);
                    pending.drain(..consumed);
                }
                black_box(collector.events.len());
            });
        });
    }

    group.finish();
}

fn benchmark_event_encoder(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("event_encoder");
    let payload = br#"{"symbol":"AAPL","price":180.25,"volume":1000}"#;
    let fields = EventFields { id: Some("1024"), event_type: Some("quote"), timestamp: 0x18c_5f3a_2b00, ..EventFields::default() };

    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("complete", |b| {
        let mut dst = Vec::with_capacity(512);
        b.iter(|| {
            dst.clear();
            encode_event(&mut dst, flags::COMPLETE, black_box(&fields), Some(black_box(payload)));
            black_box(dst.len());
        });
    });

    group.finish();
}

criterion_group!(events, benchmark_event_decoder, benchmark_event_encoder);
criterion_main!(events);
