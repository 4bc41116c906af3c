use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use hashbrown::HashMap;

use reporting_graph::code::{Block, CodeBundle};
use reporting_graph::priority::{add_edge, prioritize, Edges};
use reporting_graph::runtime::{FuncRuntime, QueryRuntime, RunRequest, RuntimeFuture};
use reporting_graph::{GraphBuilder, NodeId, ResultSink, Schema};

const LAYERS: usize = 6;
const QUERIES_PER_LAYER: usize = 400;

fn bundle(id: &str, checksums: &[String]) -> Arc<CodeBundle> {
    Arc::new(CodeBundle {
        id: id.to_string(),
        checksums: checksums
            .iter()
            .enumerate()
            .map(|(code_ref, checksum)| (code_ref as u64 + 1, checksum.clone()))
            .collect(),
        blocks: vec![Block {
            entrypoints: vec![1],
            datapoints: (2..=checksums.len() as u64).collect(),
        }],
        ..Default::default()
    })
}

/// Every query of a layer requires a property produced by the previous one.
fn layered_builder() -> GraphBuilder {
    let mut builder = GraphBuilder::new();
    for layer in 0..LAYERS {
        for index in 0..QUERIES_PER_LAYER {
            let id = format!("q-{layer}-{index}");
            let checksums = vec![format!("chk-{layer}-{index}"), format!("prop-{layer}-{index}")];

            let mut required = HashMap::new();
            if layer > 0 {
                required.insert("input".to_string(), format!("prop-{}-{index}", layer - 1));
            }
            builder.add_query(bundle(&id, &checksums), required, HashMap::new());
            builder.collect_datapoint(format!("chk-{layer}-{index}"));
        }
    }
    builder
}

fn runtime() -> Arc<dyn QueryRuntime> {
    Arc::new(FuncRuntime::new(
        |_request: RunRequest, _sink: ResultSink| -> RuntimeFuture<'static> {
            Box::pin(async move { Ok(()) })
        },
    ))
}

fn bench_build(c: &mut Criterion) {
    c.bench_function("build_layered_graph", |b| {
        b.iter(|| {
            let executor = layered_builder()
                .build(Schema::empty(), runtime(), "bench")
                .expect("layered graph builds");
            black_box(executor);
        })
    });
}

fn bench_prioritize(c: &mut Criterion) {
    let nodes: Vec<NodeId> = (0..20_000).map(|i| NodeId::new(format!("n{i:05}"))).collect();
    let mut edges = Edges::new();
    for (i, node) in nodes.iter().enumerate() {
        for step in [1, 7, 31] {
            if let Some(child) = nodes.get(i + step) {
                add_edge(&mut edges, node.clone(), child.clone());
            }
        }
    }

    c.bench_function("prioritize_dense_dag", |b| {
        b.iter(|| {
            let priorities = prioritize(&nodes, &edges, None).expect("graph is acyclic");
            black_box(priorities);
        })
    });
}

criterion_group!(benches, bench_build, bench_prioritize);
criterion_main!(benches);
