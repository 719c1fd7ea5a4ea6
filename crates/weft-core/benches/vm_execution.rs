use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft_bytecode::Opcode;
use weft_core::{Value, Vm, VmConfig};

fn assemble_arithmetic_loop(vm: &Vm, iterations: u32) {
    let a = vm.add_constant(1.0).unwrap();
    let b = vm.add_constant(2.0).unwrap();
    for _ in 0..iterations {
        vm.write_chunk(Opcode::Constant as u8, 0);
        vm.write_chunk(a, 0);
        vm.write_chunk(Opcode::Constant as u8, 0);
        vm.write_chunk(b, 0);
        vm.write_chunk(Opcode::Add as u8, 0);
        vm.write_chunk(Opcode::Zap as u8, 0);
    }
    vm.write_chunk(Opcode::Abort as u8, 0);
    vm.write_chunk(0, 0);
}

fn bench_interpret_arithmetic_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpret_arithmetic_loop");
    for iterations in [64u32, 512, 4096] {
        group.throughput(Throughput::Elements(iterations as u64));
        group.bench_with_input(BenchmarkId::new("iterations", iterations), &iterations, |b, &iterations| {
            b.iter(|| {
                let mut vm = Vm::new(VmConfig::default());
                assemble_arithmetic_loop(&vm, iterations);
                let fiber = vm.new_fiber(0, &[], true).unwrap();
                black_box(vm.interpret(fiber))
            });
        });
    }
    group.finish();
}

fn bench_new_fiber_with_seeded_stack(c: &mut Criterion) {
    c.bench_function("new_fiber_seeded_stack_32", |b| {
        let vm = Vm::new(VmConfig::default());
        let values: Vec<Value> = (0..32).map(|i| Value::number(i as f64)).collect();
        b.iter(|| black_box(vm.new_fiber(0, &values, false).unwrap()));
    });
}

fn bench_collect_garbage_after_allocation_churn(c: &mut Criterion) {
    c.bench_function("collect_garbage_after_1000_strings", |b| {
        b.iter(|| {
            let mut vm = Vm::new(VmConfig::default());
            vm.write_chunk(Opcode::Abort as u8, 0);
            vm.write_chunk(0, 0);
            let fiber = vm.new_fiber(0, &[], true).unwrap();
            vm.interpret(fiber);
            for i in 0..1000 {
                vm.heap().alloc(weft_core::Object::String(weft_core::WeftString::new(format!("s{i}"))));
            }
            black_box(vm.collect_garbage())
        });
    });
}

criterion_group!(
    benches,
    bench_interpret_arithmetic_loop,
    bench_new_fiber_with_seeded_stack,
    bench_collect_garbage_after_allocation_churn
);
criterion_main!(benches);
