use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use codeflow_core::{ArtifactKey, JobId, JobState, Transition};
use codeflow_infra::artifacts::{ArtifactStore, InMemoryArtifactStore};
use codeflow_infra::jobs::{DispatcherConfig, InMemoryJobRegistry, JobRegistry};
use codeflow_infra::pipeline::{FnStage, PipelineRunner, Stage};
use codeflow_infra::Orchestrator;

fn stages(count: usize) -> Vec<Arc<dyn Stage>> {
    (0..count)
        .map(|i| FnStage::shared(format!("stage-{i}"), |s: &str| Ok(format!("{s}."))))
        .collect()
}

fn bench_registry_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_lifecycle");
    group.sample_size(1000);

    group.bench_function("create_start_succeed", |b| {
        let registry = InMemoryJobRegistry::new();
        b.iter(|| {
            let id = registry.create().unwrap();
            registry.transition(id, Transition::Start).unwrap();
            let job = registry
                .transition(
                    id,
                    Transition::Succeed {
                        result_key: ArtifactKey::stage_output(id, 1, "out"),
                    },
                )
                .unwrap();
            black_box(job)
        });
    });

    group.bench_function("get_existing", |b| {
        let registry = InMemoryJobRegistry::new();
        let ids: Vec<JobId> = (0..10_000).map(|_| registry.create().unwrap()).collect();
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % ids.len();
            black_box(registry.get(ids[i]).unwrap())
        });
    });

    group.finish();
}

fn bench_pipeline_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_depth");

    for depth in [1, 3, 10].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            let store = InMemoryArtifactStore::arc();
            let runner = PipelineRunner::new(stages(depth), store.clone());
            b.iter(|| {
                let job_id = JobId::new();
                let submission = ArtifactKey::submission(job_id);
                store.put(&submission, "contract C {}").unwrap();
                black_box(runner.run(job_id, &submission).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_end_to_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("end_to_end");
    group.measurement_time(Duration::from_secs(10));

    for workers in [1, 4].iter() {
        group.throughput(Throughput::Elements(100));
        group.bench_with_input(BenchmarkId::new("submit_100", workers), workers, |b, &workers| {
            b.iter(|| {
                let orchestrator = Orchestrator::with_components(
                    DispatcherConfig::default()
                        .with_workers(workers)
                        .with_queue_capacity(128),
                    InMemoryJobRegistry::arc(),
                    InMemoryArtifactStore::arc(),
                    stages(3),
                );
                orchestrator.start().unwrap();
                let ids: Vec<_> = (0..100)
                    .map(|i| orchestrator.submit(&format!("contract C{i} {{}}")).unwrap())
                    .collect();
                orchestrator.shutdown();
                for id in ids {
                    assert_eq!(orchestrator.status(id).unwrap().state, JobState::Succeeded);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_registry_lifecycle,
    bench_pipeline_depth,
    bench_end_to_end
);
criterion_main!(benches);
