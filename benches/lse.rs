//! Benchmarks for load-store elimination.
//!
//! Measures the pass on generated methods of growing size:
//! - Straight-line field traffic on a removable allocation
//! - A loop nest carrying field values across back edges
//! - Heap location collection alone

extern crate heapscope;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use heapscope::{
    analysis::{CollectorOptions, HeapLocationCollector},
    compiler::{CompilerConfig, CompilerContext, LoadStoreEliminationPass, SsaPass},
    ir::{Condition, ControlFlowInfo, DataType, Graph, GraphBuilder},
};
use std::hint::black_box;

/// `obj = new C; obj.f{k % fields} = obj.f{(k + 1) % fields} + k` repeated `count` times.
fn straight_line(count: usize, fields: usize) -> Graph {
    GraphBuilder::new("int Main.straightLine()")
        .build(|f| {
            let class = f.class("C", None);
            let ids: Vec<_> = (0..fields)
                .map(|k| f.field(class, &format!("f{k}"), DataType::Int32))
                .collect();
            f.block(0, |b| {
                let obj = b.new_instance(class);
                for k in 0..count {
                    let v = b.get_field(obj, ids[(k + 1) % fields]);
                    let c = b.int(k as i32);
                    let sum = b.add(v, c);
                    b.set_field(obj, ids[k % fields], sum);
                }
                let r = b.get_field(obj, ids[0]);
                b.ret(r);
            });
        })
        .unwrap()
}

/// `depth` nested counted loops, each rotating the values of three fields.
fn loop_nest(depth: usize) -> Graph {
    GraphBuilder::new("int Main.loopNest(int)")
        .build(|f| {
            let class = f.class("C", None);
            let a = f.field(class, "a", DataType::Int32);
            let b_field = f.field(class, "b", DataType::Int32);
            let c_field = f.field(class, "c", DataType::Int32);
            let m = f.param(DataType::Int32);

            // Level l uses preheader 3l+1, header 3l+2 and latch 3l+3. The
            // innermost header enters the body, the outermost exits.
            let (obj, zero, one) = f.block(0, |b| {
                let obj = b.new_instance(class);
                let one = b.int(1);
                let zero = b.int(0);
                b.set_field(obj, a, one);
                b.goto(1);
                (obj, zero, one)
            });

            let body = 3 * depth + 1;
            let exit = body + 1;
            let mut counters = Vec::new();
            for level in 0..depth {
                let preheader = 3 * level + 1;
                let header = preheader + 1;
                let inner = if level + 1 == depth { body } else { header + 2 };
                f.block(preheader, |b| b.goto(header));
                let k = f.block(header, |b| {
                    let k = b.phi(DataType::Int32);
                    let c = b.compare(Condition::LessThan, k, m);
                    let out = if level == 0 { exit } else { 3 * level };
                    b.branch(c, inner, out);
                    k
                });
                counters.push((preheader, header, k));
            }
            f.block(body, |b| {
                let va = b.get_field(obj, a);
                let vb = b.get_field(obj, b_field);
                let vc = b.get_field(obj, c_field);
                b.set_field(obj, a, vb);
                b.set_field(obj, b_field, vc);
                b.set_field(obj, c_field, va);
                b.goto(3 * depth);
            });
            for &(preheader, header, k) in &counters {
                let latch = header + 1;
                let next = f.block(latch, |b| {
                    let next = b.add(k, one);
                    b.goto(header);
                    next
                });
                f.set_phi_inputs(k, &[(preheader, zero), (latch, next)]);
            }
            f.block(exit, |b| {
                let r = b.get_field(obj, a);
                b.ret(r);
            });
        })
        .unwrap()
}

fn bench_straight_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("lse_straight_line");
    for count in [16, 128, 1024] {
        let graph = straight_line(count, 8);
        group.bench_with_input(BenchmarkId::from_parameter(count), &graph, |b, graph| {
            let pass = LoadStoreEliminationPass::new();
            let ctx = CompilerContext::new(CompilerConfig::default());
            b.iter(|| {
                let mut graph = graph.clone();
                let changed = pass.run_on_method(black_box(&mut graph), &ctx).unwrap();
                black_box(changed)
            });
        });
    }
    group.finish();
}

fn bench_loop_nest(c: &mut Criterion) {
    let mut group = c.benchmark_group("lse_loop_nest");
    for depth in [1, 3, 6] {
        let graph = loop_nest(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &graph, |b, graph| {
            let pass = LoadStoreEliminationPass::new();
            let ctx = CompilerContext::new(CompilerConfig::default());
            b.iter(|| {
                let mut graph = graph.clone();
                let changed = pass.run_on_method(black_box(&mut graph), &ctx).unwrap();
                black_box(changed)
            });
        });
    }
    group.finish();
}

fn bench_collector(c: &mut Criterion) {
    let graph = straight_line(1024, 8);
    let cfg = ControlFlowInfo::compute(&graph);
    c.bench_function("heap_location_collection", |b| {
        b.iter(|| {
            let collector =
                HeapLocationCollector::collect(black_box(&graph), &cfg, CollectorOptions::default());
            black_box(collector.is_ok())
        });
    });
}

criterion_group!(benches, bench_straight_line, bench_loop_nest, bench_collector);
criterion_main!(benches);
