//! Word frequency counter pipeline
//!
//! Reads lines from stdin, splits them into words in a multi-worker
//! tokenizer stage and counts frequencies in a counter stage. The counter
//! prints the top words from a maintenance function, while every counter
//! worker is parked.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use parking_lot::Mutex;
use pipeline_stage::{
    registry, OverflowPolicy, Pipeline, PipelineError, PipelineStage, QueueSet,
    Result as PipelineResult, SchedulePolicy, ShutdownGrace, Stage, StageBuilder,
};
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Splits lines into cleaned, lowercase words and throws them to the counter
struct Tokenizer {
    lines: QueueSet<String>,
    counter: OnceLock<Arc<PipelineStage<Counter>>>,
}

impl Stage for Tokenizer {
    type Event = String;
    const HAS_FETCH: bool = true;
    const HAS_THROW: bool = true;

    fn schedule(&self, events: &mut Vec<String>, hint: usize) -> PipelineResult<usize> {
        self.lines.schedule(SchedulePolicy::RoundRobin, events, hint)
    }

    fn setup(&self) -> PipelineResult<()> {
        let counter = registry::find::<Counter>("counter")?;
        self.counter
            .set(counter)
            .map_err(|_| PipelineError::Other("tokenizer set up twice".into()))
    }

    fn fetch(&self, _worker: usize, buf: &mut Vec<String>, max: usize) -> PipelineResult<usize> {
        self.lines.fetch_round_robin(buf, max)
    }

    fn process(&self, _worker: usize, events: &mut Vec<String>) -> PipelineResult<usize> {
        let words: Vec<String> = events
            .iter()
            .flat_map(|line| line.split_whitespace())
            .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>().to_lowercase())
            .filter(|w| w.len() > 2)
            .collect();
        *events = words;
        Ok(events.len())
    }

    fn throw(&self, worker: usize, events: &mut Vec<String>) -> PipelineResult<usize> {
        let counter = self
            .counter
            .get()
            .ok_or_else(|| PipelineError::Other("counter not resolved".into()))?;
        let mut thrown = 0;
        while !events.is_empty() {
            thrown += counter.submit(events, worker)?;
        }
        Ok(thrown)
    }

    fn pre_pause(&self) {
        self.lines.wakeup_all();
    }
}

/// Counts words per worker; totals are merged on demand
struct Counter {
    words: QueueSet<String>,
    counts: Vec<Mutex<HashMap<String, usize>>>,
    total: AtomicU64,
}

impl Counter {
    fn top_n(&self, n: usize) -> Vec<(String, usize)> {
        let mut merged: HashMap<String, usize> = HashMap::new();
        for counts in &self.counts {
            for (word, count) in counts.lock().iter() {
                *merged.entry(word.clone()).or_insert(0) += count;
            }
        }
        let mut items: Vec<_> = merged.into_iter().collect();
        items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        items.truncate(n);
        items
    }
}

impl Stage for Counter {
    type Event = String;
    const HAS_FETCH: bool = true;

    fn schedule(&self, events: &mut Vec<String>, hint: usize) -> PipelineResult<usize> {
        self.words.schedule(SchedulePolicy::Hinted, events, hint)
    }

    fn fetch(&self, worker: usize, buf: &mut Vec<String>, max: usize) -> PipelineResult<usize> {
        self.words.fetch_hinted(worker, buf, max)
    }

    fn process(&self, worker: usize, events: &mut Vec<String>) -> PipelineResult<usize> {
        let mut counts = self.counts[worker].lock();
        for word in events.iter() {
            *counts.entry(word.clone()).or_insert(0) += 1;
        }
        self.total.fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(events.len())
    }

    fn pre_pause(&self) {
        self.words.wakeup_all();
    }
}

fn print_top(counter: &Counter) {
    println!(
        "\n=== Top 10 Words (after {} words) ===",
        counter.total.load(Ordering::Relaxed)
    );
    for (i, (word, count)) in counter.top_n(10).iter().enumerate() {
        println!("{:2}. {} ({})", i + 1, word, count);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let counter_config = StageBuilder::new("counter")
        .workers(2)
        .queue_capacity(4096)
        .build()?;
    let counter = PipelineStage::create(
        counter_config.clone(),
        Counter {
            words: QueueSet::from_config(&counter_config, 2)?
                .with_put_timeout(Some(Duration::from_millis(50))),
            counts: (0..2).map(|_| Mutex::new(HashMap::new())).collect(),
            total: AtomicU64::new(0),
        },
    )?;

    let tokenizer_config = StageBuilder::new("tokenizer").workers(3).build()?;
    let tokenizer = PipelineStage::create(
        tokenizer_config.clone(),
        Tokenizer {
            lines: QueueSet::new(
                3,
                tokenizer_config.queue_capacity,
                OverflowPolicy::Block,
                Some(tokenizer_config.fetch_timeout()),
            )?
            .with_put_timeout(None),
            counter: OnceLock::new(),
        },
    )?;

    let pipeline = Pipeline::from_names(["tokenizer", "counter"])?;
    pipeline.setup_all()?;
    pipeline.start_all()?;

    let stdin = io::stdin();
    for (n, line) in stdin.lock().lines().enumerate() {
        let mut batch = vec![line?];
        tokenizer.submit(&mut batch, n)?;
        if (n + 1) % 100 == 0 {
            counter.schedule_maintenance(|c: &Counter| {
                print_top(c);
                Ok(())
            })?;
        }
    }

    // Drain upstream first so every word reaches the counter.
    while tokenizer.hooks().lines.total_len() > 0 {
        std::thread::sleep(Duration::from_millis(10));
    }
    tokenizer.shutdown(ShutdownGrace::Gracefully)?;
    tokenizer.wait(None)?;
    while counter.hooks().words.total_len() > 0 {
        std::thread::sleep(Duration::from_millis(10));
    }

    pipeline.shutdown_all(ShutdownGrace::Gracefully)?;
    pipeline.wait_all(None)?;
    print_top(counter.hooks());
    println!("\n{}", pipeline.metrics_summary());
    pipeline.destroy_all()?;

    println!("\nProcessing complete!");

    Ok(())
}
