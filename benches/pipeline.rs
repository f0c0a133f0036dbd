//! Performance benchmarks for a3s-guard
//!
//! Run with: cargo bench

use a3s_guard::{
    integrity_token, summarize, ExecutionContext, MemoryRepository, MetricsRecorder, Operation,
    OperationHandler, OperationResult, PipelineConfig, Repository, SecureOperationPipeline,
    SecurityContext,
};
use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

struct CreateArticle(MemoryRepository);

#[async_trait]
impl OperationHandler for CreateArticle {
    async fn execute(&self, ctx: ExecutionContext<'_>) -> a3s_guard::Result<OperationResult> {
        let entity = self
            .0
            .create(ctx.transaction, "article", ctx.validated.clone())
            .await?;
        Ok(OperationResult::valid(serde_json::to_value(entity)?))
    }
}

fn operation(repo: &MemoryRepository, i: usize) -> Operation {
    Operation::new(
        "article.create",
        serde_json::json!({"title": format!("Article {}", i)}),
        Arc::new(CreateArticle(repo.clone())),
    )
    .require("article.create")
}

fn bench_integrity_token(c: &mut Criterion) {
    let data = serde_json::json!({
        "id": "ent-1",
        "kind": "article",
        "data": {"title": "Hello", "body": "Lorem ipsum dolor sit amet"},
        "version": 3,
    });

    c.bench_function("integrity_token", |b| {
        b.iter(|| integrity_token(&data).unwrap());
    });
}

fn bench_summarize(c: &mut Criterion) {
    let mut group = c.benchmark_group("summarize");
    for count in [100, 1000, 10_000] {
        let values: Vec<f64> = (0..count).map(|i| ((i * 7919) % 1000) as f64).collect();
        group.bench_function(format!("{} samples", count), |b| {
            b.iter(|| summarize(&values));
        });
    }
    group.finish();
}

fn bench_pipeline_execute(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let repo = MemoryRepository::new();
    let pipeline =
        SecureOperationPipeline::builder(PipelineConfig::default(), Arc::new(repo.clone()))
            .build()
            .unwrap();
    let context = SecurityContext::for_user("editor").with_permission("article.create");

    c.bench_function("pipeline execute (success)", |b| {
        b.to_async(&rt).iter(|| async {
            pipeline
                .execute(operation(&repo, 0), &context)
                .await
                .unwrap()
        });
    });

    let viewer = SecurityContext::for_user("viewer");
    c.bench_function("pipeline execute (access denied)", |b| {
        b.to_async(&rt).iter(|| async {
            pipeline
                .execute(operation(&repo, 0), &viewer)
                .await
                .unwrap_err()
        });
    });
}

fn bench_analyze_performance(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // Pre-populate
    let metrics = rt.block_on(async {
        let metrics = MetricsRecorder::in_memory();
        for i in 0..1000 {
            metrics
                .record_metric("operation.article.create.duration_ms", i as f64, Default::default())
                .await
                .unwrap();
        }
        metrics
    });

    c.bench_function("analyze_performance (1000 samples)", |b| {
        b.to_async(&rt).iter(|| async {
            metrics
                .analyze_performance("operation.article.create.duration_ms", 3600)
                .await
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_integrity_token,
    bench_summarize,
    bench_pipeline_execute,
    bench_analyze_performance,
);
criterion_main!(benches);
