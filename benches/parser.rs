use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use http::{HeaderMap, HeaderValue, Method};
use url::Url;
use wirenet::http::chunked::{encode_chunk, ChunkedDecoder};
use wirenet::http::framer::HttpBehaviour;
use wirenet::http::headerparser::HeaderBlockParser;
use wirenet::http::requestbody::WriteMode;
use wirenet::http::requesthead::RequestHead;
use wirenet::http::statusline::{HeaderBudget, ParseStatus, StatusLineParser};

const RESPONSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
Date: Mon, 02 Oct 2023 10:00:00 GMT\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Content-Length: 12345\r\n\
Cache-Control: private, max-age=0\r\n\
Server: nginx\r\n\
Vary: Accept-Encoding\r\n\
X-Request-Id: 0f8e2a4c-5b1d-4e3f-9a7b-6c2d1e0f9a8b\r\n\
Set-Cookie: session=abcdef0123456789; Path=/; HttpOnly\r\n\
Set-Cookie: theme=dark; Path=/\r\n\
\r\n";

fn benchmark_response_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_head");
    group.throughput(Throughput::Bytes(RESPONSE_HEAD.len() as u64));

    group.bench_function("whole_buffer", |b| {
        b.iter(|| {
            let mut budget = HeaderBudget::new(64 * 1024);
            let mut line = StatusLineParser::new();
            let (_, used) = line.parse(black_box(RESPONSE_HEAD), &mut budget);
            let mut headers = HeaderBlockParser::new();
            let _ = headers.parse(&RESPONSE_HEAD[used..], &mut budget);
            black_box((line.status_line(), headers.take_headers()))
        })
    });

    // Worst case for the incremental parsers: 16-byte reads.
    group.bench_function("small_reads", |b| {
        b.iter(|| {
            let mut budget = HeaderBudget::new(64 * 1024);
            let mut line = StatusLineParser::new();
            let mut headers = HeaderBlockParser::new();
            let mut in_line = true;
            for piece in RESPONSE_HEAD.chunks(16) {
                let mut rest = piece;
                if in_line {
                    let (status, used) = line.parse(rest, &mut budget);
                    rest = &rest[used..];
                    if status != ParseStatus::Done {
                        continue;
                    }
                    in_line = false;
                }
                let _ = headers.parse(rest, &mut budget);
            }
            black_box(headers.take_headers())
        })
    });
    group.finish();
}

fn benchmark_chunked(c: &mut Criterion) {
    let mut wire = BytesMut::new();
    for _ in 0..64 {
        wire.extend_from_slice(&encode_chunk(&[b'a'; 1024]));
    }
    wire.extend_from_slice(b"0\r\n\r\n");
    let wire = wire.freeze();

    let mut group = c.benchmark_group("chunked");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("decode_64k", |b| {
        b.iter(|| {
            let mut decoder = ChunkedDecoder::new();
            let mut out = BytesMut::with_capacity(64 * 1024);
            let _ = decoder.decode(black_box(&wire), &mut out);
            black_box(out)
        })
    });
    group.bench_function("encode_1k", |b| b.iter(|| black_box(encode_chunk(black_box(&[b'a'; 1024])))));
    group.finish();
}

fn benchmark_request_head(c: &mut Criterion) {
    let url = Url::parse("http://example.com/api/items?page=2").unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static("application/json"));
    headers.insert("accept-language", HeaderValue::from_static("en-GB,en;q=0.9"));
    headers.insert("authorization", HeaderValue::from_static("Bearer 0123456789abcdef"));
    let method = Method::POST;

    c.bench_function("request_head_encode", |b| {
        b.iter(|| {
            let head = RequestHead {
                method: &method,
                url: &url,
                headers: &headers,
                write_mode: WriteMode::ContentLength,
                content_length: Some(512),
                expect_continue: true,
                keep_alive: true,
                behaviour: HttpBehaviour::Http11,
                proxy: None,
                user_agent: Some("wirenet-bench"),
            };
            black_box(head.encode())
        })
    });
}

criterion_group!(benches, benchmark_response_head, benchmark_chunked, benchmark_request_head);
criterion_main!(benches);
