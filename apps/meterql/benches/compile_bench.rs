use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meterql_engine::{Level, MeterCompiler, MeterOptions, MeterWindow, NamespaceScoper, PrometheusNamespaceScoper, QueryOptions};
use std::time::Duration;

fn bench_compile(c: &mut Criterion) {
    let compiler = MeterCompiler::builtin();

    let cluster = QueryOptions::for_level(Level::Cluster).with_meter_options(MeterOptions::hourly());
    c.bench_function("compile_cluster_cpu", |b| {
        b.iter(|| compiler.compile(black_box("meter_cluster_cpu_usage"), &cluster))
    });

    let pod = QueryOptions::for_level(Level::Pod)
        .with_namespace_name("demo")
        .with_workload("deployment", "web")
        .with_resource_filter("web-.*")
        .with_meter_options(MeterOptions::with_step(Duration::from_secs(3 * 3600)));
    c.bench_function("compile_pod_level_batch", |b| {
        b.iter(|| {
            for metric in compiler.registry().names_for(Level::Pod) {
                black_box(compiler.compile(metric, &pod).ok());
            }
        })
    });
}

fn bench_scope(c: &mut Criterion) {
    let compiler = MeterCompiler::builtin();
    let options = QueryOptions::for_level(Level::Namespace)
        .with_namespace_name("demo")
        .with_meter_options(MeterOptions::hourly());
    let expr = compiler.compile("meter_namespace_net_bytes_received", &options).unwrap_or_default();

    c.bench_function("scope_namespace_expression", |b| {
        b.iter(|| PrometheusNamespaceScoper.scope(black_box(&expr), "demo").ok())
    });
}

fn bench_window(c: &mut Criterion) {
    let end = chrono::Utc::now();
    let start = end - chrono::Duration::days(7);

    c.bench_function("normalize_week_window", |b| {
        b.iter(|| MeterWindow::normalize(black_box(start), black_box(end), Duration::from_secs(3600)).ok())
    });
}

criterion_group!(benches, bench_compile, bench_scope, bench_window);
criterion_main!(benches);
