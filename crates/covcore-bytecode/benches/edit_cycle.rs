use covcore_bytecode::{verify_code_unit, BytecodeWriter, CodeUnit, Constant, LineTableEntry, Opcode};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn build_unit(line_count: usize) -> CodeUnit {
    let mut unit = CodeUnit::new("bench_fn", "bench.src");
    let mut w = BytecodeWriter::new();
    let mut line_table = Vec::with_capacity(line_count);
    for i in 0..line_count {
        line_table.push(LineTableEntry { start_offset: w.offset(), line: i as u32 + 1 });
        let idx = unit.constants.push(Constant::Int(i as i64));
        w.emit_instruction(Opcode::LoadConst, idx);
        w.emit_raw(Opcode::PopTop, 0);
    }
    w.emit_raw(Opcode::ReturnValue, 0);
    unit.code = w.into_bytes();
    unit.line_table = line_table;
    unit
}

fn bench_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify_code_unit");
    for &lines in &[16usize, 256, 4096] {
        let unit = build_unit(lines);
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::new("lines", lines), &unit, |b, unit| {
            b.iter(|| verify_code_unit(black_box(unit)).unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let unit = build_unit(1024);
    c.bench_function("decode_instructions_1024_lines", |b| {
        b.iter(|| covcore_bytecode::decode_instructions(black_box(&unit.code)).unwrap());
    });
}

criterion_group!(benches, bench_verify, bench_decode);
criterion_main!(benches);
