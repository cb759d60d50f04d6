use criterion::{black_box, criterion_group, criterion_main, Criterion};
use zdbg_core::gdb::packet::calculate_checksum;
use zdbg_core::gdb::{parse_stop_reply, RegisterLayout};
use zdbg_core::{MemoryModel, RegisterLineDecoder};

const STATUS_LINE: &str = "PC=c000 SP=ff00 AF=0000 BC=0000 HL=0000 DE=0000 IX=0000 IY=0000 \
    AF'=0000 BC'=0000 HL'=0000 DE'=0000 I=00 R=00  F=-------- F'=-------- MEMPTR=0000 IM2 IFF12 VPS: 0 MMU=8001000500020007";

fn bench_register_line_decode(c: &mut Criterion) {
    let mut decoder = RegisterLineDecoder::new(MemoryModel::Zx128k);
    c.bench_function("register_line_decode", |b| {
        b.iter(|| {
            let _ = black_box(decoder.decode(black_box(STATUS_LINE)));
        })
    });
}

fn bench_checksum(c: &mut Criterion) {
    let payload = "0".repeat(512);
    c.bench_function("rsp_checksum_512", |b| {
        b.iter(|| black_box(calculate_checksum(black_box(payload.as_bytes()))))
    });
}

fn bench_stop_reply(c: &mut Criterion) {
    let layout = RegisterLayout::mame_default();
    c.bench_function("stop_reply_parse", |b| {
        b.iter(|| {
            let _ = black_box(parse_stop_reply(black_box("T05thread:01;0a:00ff;0b:0080;"), &layout));
        })
    });
}

criterion_group!(benches, bench_register_line_decode, bench_checksum, bench_stop_reply);
criterion_main!(benches);
