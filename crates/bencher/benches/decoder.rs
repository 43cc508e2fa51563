use std::hint::black_box;

use bencher::{Fixture, LARGE_REQUEST, SMALL_REQUEST};
use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use micro_http_gateway::codec::h1::{BodyMode, HeadOutcome, Http1Decoder, Http1Sink};
use micro_http_gateway::codec::h2::{write, FrameHeader, Http2Decoder, Http2Sink, DEFAULT_MAX_FRAME_SIZE, PREFACE};
use micro_http_gateway::codec::hpack::HpackEncoder;
use micro_http_gateway::protocol::{HeaderList, Http1Error, Http2Error, Http2ErrorCode};

/// Counts what the decoders report without acting on it.
#[derive(Default)]
struct Counter {
    units: usize,
}

impl Http1Sink for Counter {
    fn on_partial_head(&mut self, _head: &[u8]) -> Result<(), Http1Error> {
        Ok(())
    }

    fn on_head(&mut self, head: &[u8]) -> Result<HeadOutcome, Http1Error> {
        self.units += head.len();
        Ok(HeadOutcome::Message(BodyMode::Empty))
    }

    fn on_body(&mut self, body: &[u8]) -> usize {
        body.len()
    }

    fn on_end(&mut self, _trailers: HeaderList) {
        self.units += 1;
    }

    fn on_error(&mut self, error: Http1Error) {
        panic!("fixture should decode: {error}");
    }
}

impl Http2Sink for Counter {
    fn on_frame(&mut self, _header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        self.units += payload.len();
        Ok(())
    }

    fn on_data_begin(&mut self, _header: &FrameHeader) -> Result<bool, Http2Error> {
        Ok(true)
    }

    fn on_data(&mut self, _stream_id: u32, payload: &[u8]) -> usize {
        self.units += payload.len();
        payload.len()
    }

    fn on_data_end(&mut self, _header: &FrameHeader) -> Result<(), Http2Error> {
        Ok(())
    }

    fn on_stream_error(&mut self, stream_id: u32, code: Http2ErrorCode) {
        panic!("fixture should decode, stream {stream_id} failed with {code:?}");
    }

    fn on_connection_error(&mut self, code: Http2ErrorCode) {
        panic!("fixture should decode, connection failed with {code:?}");
    }
}

fn benchmark_http1_decoder(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("http1_decoder");

    for fixture in [SMALL_REQUEST, LARGE_REQUEST] {
        group.throughput(Throughput::Bytes(fixture.len()));
        group.bench_with_input(BenchmarkId::from_parameter(fixture.name()), &fixture, |b, fixture: &Fixture| {
            b.iter(|| {
                let mut decoder = Http1Decoder::new(8192);
                let mut counter = Counter::default();
                let consumed = decoder.decode(&mut counter, fixture.content());
                black_box((consumed, counter.units));
            });
        });
    }

    group.finish();
}

/// A client preface followed by `streams` requests, each a HEADERS and a DATA frame.
fn http2_connection(streams: u32) -> BytesMut {
    let mut encoder = HpackEncoder::new();
    let headers: HeaderList =
        [(":method", "POST"), (":scheme", "https"), (":authority", "example.com"), (":path", "/prices")]
            .into_iter()
            .collect();

    let mut bytes = BytesMut::from(PREFACE);
    write::settings(&mut bytes, &[]);
    for stream in 0..streams {
        let stream_id = stream * 2 + 1;
        write::headers(&mut bytes, stream_id, &encoder.encode(&headers), false, DEFAULT_MAX_FRAME_SIZE);
        write::data(&mut bytes, stream_id, &[b'x'; 512], true, DEFAULT_MAX_FRAME_SIZE);
    }
    bytes
}

fn benchmark_http2_decoder(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("http2_decoder");

    for streams in [1, 64] {
        let input = http2_connection(streams);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(streams), &input, |b, input| {
            b.iter(|| {
                let mut decoder = Http2Decoder::server(DEFAULT_MAX_FRAME_SIZE);
                let mut counter = Counter::default();
                let consumed = decoder.decode(&mut counter, input);
                black_box((consumed, counter.units));
            });
        });
    }

    group.finish();
}

criterion_group!(decoder, benchmark_http1_decoder, benchmark_http2_decoder);
criterion_main!(decoder);
