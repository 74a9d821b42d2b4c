use criterion::{criterion_group, criterion_main, Criterion};

use zt_transport::codec::{decode, encode, encode_bounded, Frame, ETHERTYPE};

fn data_frame(len: usize) -> Frame {
    Frame::Data {
        dest_port: 7000,
        src_port: 8000,
        more: false,
        msg_id: 1,
        frag_size: len as u16,
        frag_no: 0,
        n_frags: 1,
        payload: vec![0xAB; len],
    }
}

fn encode_small(c: &mut Criterion) {
    let frame = data_frame(64);
    c.bench_function("encode data frame (64B payload)", |b| {
        b.iter(|| encode(&frame))
    });
}

fn encode_large(c: &mut Criterion) {
    let frame = data_frame(1400);
    c.bench_function("encode data frame (1400B payload)", |b| {
        b.iter(|| encode(&frame))
    });
}

fn encode_bounded_fits(c: &mut Criterion) {
    let frame = data_frame(1400);
    c.bench_function("encode_bounded data frame (fits mtu)", |b| {
        b.iter(|| encode_bounded(&frame, 1500))
    });
}

fn decode_small(c: &mut Criterion) {
    let bytes = encode(&data_frame(64));
    c.bench_function("decode data frame (64B payload)", |b| {
        b.iter(|| decode(ETHERTYPE, &bytes))
    });
}

fn decode_large(c: &mut Criterion) {
    let bytes = encode(&data_frame(1400));
    c.bench_function("decode data frame (1400B payload)", |b| {
        b.iter(|| decode(ETHERTYPE, &bytes))
    });
}

criterion_group!(
    benches,
    encode_small,
    encode_large,
    encode_bounded_fits,
    decode_small,
    decode_large
);
criterion_main!(benches);
