//! Performance benchmarks for expression minification and correlation
//!
//! Measures:
//! - Minifier latency for growing variable counts
//! - Expression evaluation throughput
//! - Correlation throughput with and without a persisted store
//!
//! Run with:
//! ```bash
//! cargo bench --bench correlation_benchmark
//! ```

use chrono::{Duration, Utc};
use sensor_engine::correlation::MessageMeta;
use sensor_engine::{minify, CorrelationConfig, Correlator, DependencyExpression, MemoryStore};
use shared::{Dependency, Event};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

fn dependencies(count: usize) -> Vec<Dependency> {
    (0..count)
        .map(|i| Dependency::new(format!("dep{}", i), "bench", format!("event{}", i)))
        .collect()
}

fn meta(sequence: u64) -> MessageMeta {
    MessageMeta {
        stream_sequence: sequence,
        consumer_sequence: sequence,
        partition: None,
        timestamp: Utc::now(),
    }
}

// Benchmark: Minifier latency
fn bench_minifier() {
    println!("\n=== Benchmark: Minifier Latency ===");

    let expressions = [
        "dep0 || dep1",
        "(dep0 || dep1) && dep2",
        "((dep0 && dep1) || (dep2 && dep3)) && dep2",
        "(dep0 || dep1) && (dep2 || dep3) && (dep4 || !dep0)",
        "(dep0 && dep1) || (dep2 && dep3) || (dep4 && dep5) || (dep6 && !dep7)",
    ];

    for expression in expressions {
        let start = Instant::now();
        let mut minified = String::new();
        for _ in 0..100 {
            minified = minify(expression).unwrap();
        }
        let avg = start.elapsed().as_micros() / 100;
        println!("{:>8}μs  {}  =>  {}", avg, expression, minified);
    }
}

// Benchmark: Evaluation throughput
fn bench_evaluation() {
    println!("\n=== Benchmark: Expression Evaluation ===");

    let expression =
        DependencyExpression::parse("(dep0 && dep1) || (dep2 && dep3) || (dep4 && dep5)").unwrap();
    let mut parameters: HashMap<String, bool> = HashMap::new();

    let iterations = 100_000;
    let start = Instant::now();
    let mut fired = 0;
    for i in 0..iterations {
        for bit in 0..6 {
            parameters.insert(format!("dep{}", bit), (i >> bit) & 1 == 1);
        }
        if expression.evaluate(&parameters).unwrap() {
            fired += 1;
        }
    }
    let duration = start.elapsed();

    println!("Evaluations:  {}", iterations);
    println!("Satisfied:    {}", fired);
    println!("Throughput:   {:.0} evals/sec", iterations as f64 / duration.as_secs_f64());
}

// Benchmark: Correlation throughput (in-memory vs persisted state)
async fn bench_correlation() {
    println!("\n=== Benchmark: Correlation Throughput ===");

    let deps = dependencies(3);
    let config = CorrelationConfig {
        failsafe_timeout: Duration::hours(1),
        dedup_window: Duration::minutes(5),
    };

    for persisted in [false, true] {
        let mut correlator = Correlator::new("bench", "dep0 && dep1 && dep2", &deps, config).unwrap();
        let store = Arc::new(MemoryStore::new());
        if persisted {
            correlator = correlator.with_store(store.clone());
        }

        let rounds = 10_000u64;
        let start = Instant::now();
        let mut fired = 0;
        for round in 0..rounds {
            for (i, dep) in deps.iter().enumerate() {
                let sequence = round * 3 + i as u64;
                let event = Event::new(sequence.to_string(), "bench", dep.event_name.clone());
                let outcome = correlator
                    .correlate(&dep.name, event, meta(sequence), Utc::now())
                    .await;
                if matches!(outcome, sensor_engine::Outcome::Fired { .. }) {
                    fired += 1;
                }
            }
        }
        let duration = start.elapsed();

        println!(
            "{:<10} fired {} of {} rounds, {:.0} events/sec",
            if persisted { "persisted" } else { "in-memory" },
            fired,
            rounds,
            (rounds * 3) as f64 / duration.as_secs_f64()
        );
    }
}

#[tokio::main]
async fn main() {
    println!("====================================");
    println!("Correlation Benchmark Suite");
    println!("====================================");

    bench_minifier();
    bench_evaluation();
    bench_correlation().await;

    println!("\n====================================");
    println!("Benchmark suite completed!");
    println!("====================================");
}
