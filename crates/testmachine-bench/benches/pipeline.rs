use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;
use std::fs;
use testmachine_core::{Collection, Compiler, DefineCompiler, TemplateRouter, TestExtractor};
use testmachine_util::hash::blake3_str;

fn source_of(size: usize) -> String {
    let line = "const value = process.env.NODE_ENV === 'production' ? 1 : 2;\n";
    line.repeat(size / line.len() + 1)
}

fn bench_blake3_source(c: &mut Criterion) {
    let mut group = c.benchmark_group("blake3_source");

    for size in [1024, 16 * 1024, 256 * 1024] {
        let source = source_of(size);
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &source, |b, source| {
            b.iter(|| blake3_str(black_box(source)));
        });
    }

    group.finish();
}

fn bench_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection_get");
    let source = source_of(16 * 1024);

    let mut plain = Collection::new();
    plain.set(&source, 1u32);
    group.bench_function("plain", |b| b.iter(|| plain.get(black_box(&source))));

    let mut hashed = Collection::hashed();
    hashed.set(&source, 1u32);
    group.bench_function("hashed", |b| b.iter(|| hashed.get(black_box(&source))));

    group.finish();
}

fn bench_compiler(c: &mut Criterion) {
    let mut group = c.benchmark_group("compiler");
    let mut definitions = BTreeMap::new();
    definitions.insert("process.env.NODE_ENV".to_string(), "test".into());

    for size in [1024, 64 * 1024] {
        let source = source_of(size);
        group.throughput(Throughput::Bytes(source.len() as u64));

        group.bench_with_input(BenchmarkId::new("define_cold", size), &source, |b, source| {
            let compiler = Compiler::new();
            compiler.push(DefineCompiler::new(&definitions));
            b.iter(|| {
                compiler.clear_cache();
                compiler.compile(black_box(source), "bench.js")
            });
        });

        group.bench_with_input(BenchmarkId::new("define_cached", size), &source, |b, source| {
            let compiler = Compiler::new();
            compiler.push(DefineCompiler::new(&definitions));
            let _ = compiler.compile(source, "bench.js");
            b.iter(|| compiler.compile(black_box(source), "bench.js"));
        });
    }

    group.finish();
}

fn bench_extract_tests(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..200 {
        let sub = dir.path().join(format!("suite{}", i % 10));
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join(format!("module{i}.spec.js")), "").unwrap();
    }
    let changed: Vec<String> = (0..50).map(|i| format!("/proj/src/module{i}.js")).collect();
    let router = || TemplateRouter::new(["**/{name}.spec.js"]).unwrap();

    let mut group = c.benchmark_group("extract_tests");
    group.bench_function("cold", |b| {
        let mut extractor = TestExtractor::new(vec![dir.path().to_path_buf()], router());
        b.iter(|| {
            extractor.clear_cache();
            extractor.extract_tests(black_box(&changed))
        });
    });
    group.bench_function("cached", |b| {
        let mut extractor = TestExtractor::new(vec![dir.path().to_path_buf()], router());
        extractor.extract_tests(&changed);
        b.iter(|| extractor.extract_tests(black_box(&changed)));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_blake3_source,
    bench_collection,
    bench_compiler,
    bench_extract_tests
);
criterion_main!(benches);
