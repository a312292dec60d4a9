//! End-to-end scheduler, storage and merge behavior with scripted episodes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::tempdir;

use traceforge::episode::EpisodeRunner;
use traceforge::merge::merge;
use traceforge::pipeline::select_shard;
use traceforge::sampler::SamplingPolicy;
use traceforge::scheduler::{BatchScheduler, SchedulerConfig, StopSignal};
use traceforge::shard::ShardKey;
use traceforge::trajectory::{
    Attempt, AttemptOutcome, Item, ItemStatus, IterationRecord, RunStore, StorageKey,
};

/// Replays per-item score scripts. `None` in a script is an error outcome;
/// items without a script always score `default`.
struct ScriptedRunner {
    scripts: HashMap<String, Vec<Option<f64>>>,
    default: Option<f64>,
    threshold: f64,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    executed: Mutex<Vec<(String, u32)>>,
    stop_after: Option<(usize, StopSignal)>,
}

impl ScriptedRunner {
    fn new(default: Option<f64>) -> Self {
        Self {
            scripts: HashMap::new(),
            default,
            threshold: 1.0,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            stop_after: None,
        }
    }

    fn script(mut self, item_id: &str, scores: &[Option<f64>]) -> Self {
        self.scripts.insert(item_id.to_string(), scores.to_vec());
        self
    }

    fn stop_after(mut self, calls: usize, stop: StopSignal) -> Self {
        self.stop_after = Some((calls, stop));
        self
    }

    fn executed_ids(&self) -> HashSet<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn score_for(&self, item_id: &str, attempt_number: u32) -> Option<f64> {
        match self.scripts.get(item_id) {
            Some(script) => {
                let i = (attempt_number as usize - 1).min(script.len() - 1);
                script[i]
            }
            None => self.default,
        }
    }
}

#[async_trait]
impl EpisodeRunner for ScriptedRunner {
    async fn execute(&self, item: &Item, attempt_number: u32) -> Attempt {
        let started_at = Utc::now();
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.executed
            .lock()
            .unwrap()
            .push((item.id.clone(), attempt_number));
        if let Some((limit, stop)) = &self.stop_after {
            if call == *limit {
                stop.trip();
            }
        }

        tokio::time::sleep(Duration::from_millis(3)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let mut attempt = Attempt::error(&item.id, attempt_number, "scripted failure");
        if let Some(score) = self.score_for(&item.id, attempt_number) {
            attempt.error = None;
            attempt.answer = Some(format!("answer-{}", attempt_number));
            attempt.score = Some(score);
            attempt.outcome = if score >= self.threshold {
                AttemptOutcome::Success
            } else {
                AttemptOutcome::Failure
            };
        }
        attempt.started_at = started_at;
        attempt.finished_at = Utc::now();
        attempt
    }
}

fn items(n: usize) -> Vec<Item> {
    (0..n)
        .map(|i| {
            Item::new(
                format!("trivia_{}", i),
                i,
                format!("question {}", i),
                Some(format!("answer {}", i)),
            )
        })
        .collect()
}

fn scheduler(
    runner: Arc<ScriptedRunner>,
    root: &Path,
    key: StorageKey,
    policy: SamplingPolicy,
    config: SchedulerConfig,
) -> BatchScheduler {
    BatchScheduler::new(runner, Arc::new(RunStore::new(root)), key, policy, config).unwrap()
}

fn key(iteration: u32) -> StorageKey {
    StorageKey::new("trivia", iteration, ShardKey::single())
}

#[tokio::test]
async fn test_accepts_on_first_passing_attempt() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(
        ScriptedRunner::new(Some(1.0)).script("trivia_0", &[Some(0.5), Some(0.5), Some(1.0)]),
    );
    let record = scheduler(
        runner.clone(),
        dir.path(),
        key(1),
        SamplingPolicy::new(3, 1.0),
        SchedulerConfig::new(2, 4),
    )
    .run_to_record(items(1))
    .await
    .unwrap();

    let entry = &record.entries[0];
    assert_eq!(entry.status, ItemStatus::Accepted);
    assert_eq!(entry.attempts, 3);
    assert_eq!(entry.attempt.as_ref().unwrap().attempt_number, 3);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rejects_when_budget_runs_out() {
    let dir = tempdir().unwrap();
    let runner =
        Arc::new(ScriptedRunner::new(Some(1.0)).script("trivia_0", &[Some(0.5), Some(0.7)]));
    let record = scheduler(
        runner,
        dir.path(),
        key(1),
        SamplingPolicy::new(2, 1.0),
        SchedulerConfig::new(2, 4),
    )
    .run_to_record(items(1))
    .await
    .unwrap();

    let entry = &record.entries[0];
    assert_eq!(entry.status, ItemStatus::Rejected);
    assert_eq!(entry.attempts, 2);
    assert_eq!(entry.attempt.as_ref().unwrap().score, Some(0.7));
}

#[tokio::test]
async fn test_errors_to_the_end_exhaust_the_item() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(None));
    let record = scheduler(
        runner,
        dir.path(),
        key(1),
        SamplingPolicy::new(3, 1.0),
        SchedulerConfig::new(1, 1),
    )
    .run_to_record(items(1))
    .await
    .unwrap();

    assert_eq!(record.entries[0].status, ItemStatus::Exhausted);
    assert_eq!(record.entries[0].attempts, 3);
}

#[tokio::test]
async fn test_attempt_log_is_contiguous_and_sequential() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(
        ScriptedRunner::new(Some(0.0))
            .script("trivia_1", &[Some(0.2), Some(1.0)])
            .script("trivia_4", &[None, Some(0.5), Some(1.0)]),
    );
    let scheduler = scheduler(
        runner,
        dir.path(),
        key(1),
        SamplingPolicy::new(4, 1.0),
        SchedulerConfig::new(3, 3),
    );
    scheduler.run_to_record(items(6)).await.unwrap();

    let log = RunStore::new(dir.path())
        .load_attempts(scheduler.key())
        .await
        .unwrap();
    assert_eq!(log.len(), 6);
    for (item_id, attempts) in &log {
        let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
        let expected: Vec<u32> = (1..=attempts.len() as u32).collect();
        assert_eq!(numbers, expected, "non-contiguous attempts for {}", item_id);

        for pair in attempts.windows(2) {
            assert!(
                pair[0].finished_at <= pair[1].started_at,
                "overlapping attempts for {}",
                item_id
            );
        }
    }
    assert_eq!(log["trivia_1"].len(), 2);
    assert_eq!(log["trivia_4"].len(), 3);
    assert_eq!(log["trivia_0"].len(), 4);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(Some(1.0)));
    let record = scheduler(
        runner.clone(),
        dir.path(),
        key(1),
        SamplingPolicy::default(),
        SchedulerConfig::new(3, 10),
    )
    .run_to_record(items(10))
    .await
    .unwrap();

    assert_eq!(record.count(ItemStatus::Accepted), 10);
    let peak = runner.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {} exceeded 3", peak);
    assert!(peak >= 1);
}

#[tokio::test]
async fn test_resume_after_stop_reprocesses_no_settled_item() {
    let dir = tempdir().unwrap();
    let policy = SamplingPolicy::new(3, 1.0);
    let config = SchedulerConfig::new(2, 4);
    let all = items(12);

    // Every item fails once, then passes.
    let scripted = |runner: ScriptedRunner| {
        all.iter().fold(runner, |runner, item| {
            runner.script(&item.id, &[Some(0.0), Some(1.0)])
        })
    };

    let stop = StopSignal::new();
    let first = Arc::new(scripted(ScriptedRunner::new(None)).stop_after(4, stop.clone()));
    let partial = scheduler(first.clone(), dir.path(), key(1), policy, config.clone())
        .with_stop_signal(stop)
        .run_to_record(all.clone())
        .await
        .unwrap();
    assert!(partial.entries.len() < all.len());
    let settled_first: HashSet<String> =
        partial.entries.iter().map(|e| e.item_id.clone()).collect();

    let second = Arc::new(scripted(ScriptedRunner::new(None)));
    let complete = scheduler(second.clone(), dir.path(), key(1), policy, config)
        .run_to_record(all.clone())
        .await
        .unwrap();

    assert_eq!(complete.entries.len(), all.len());
    assert_eq!(complete.count(ItemStatus::Accepted), all.len());
    assert!(second.executed_ids().is_disjoint(&settled_first));

    // Interrupted items continued their numbering instead of starting over
    let store = RunStore::new(dir.path());
    let log = store.load_attempts(&key(1)).await.unwrap();
    for attempts in log.values() {
        let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }
    let progress = store.progress(&key(1)).await.unwrap();
    assert_eq!(progress.attempts_logged, 24);
    assert_eq!(progress.accepted, 12);
    assert_eq!(progress.open, 0);
}

fn persisted_ids(record: &IterationRecord) -> Vec<String> {
    record.entries.iter().map(|e| e.item_id.clone()).collect()
}

#[tokio::test]
async fn test_resume_with_new_batch_size_keeps_persisted_items() {
    let dir = tempdir().unwrap();
    let policy = SamplingPolicy::new(1, 1.0);
    let store = RunStore::new(dir.path());

    // Stop fires during the fourth episode; the first two batches of two land on disk.
    let stop = StopSignal::new();
    let first = Arc::new(ScriptedRunner::new(Some(1.0)).stop_after(4, stop.clone()));
    scheduler(first, dir.path(), key(1), policy, SchedulerConfig::new(1, 2))
        .with_stop_signal(stop)
        .run_to_record(items(8))
        .await
        .unwrap();
    let after_first = store.load_iteration("trivia", 1).await.unwrap();
    assert_eq!(
        persisted_ids(&after_first),
        vec!["trivia_0", "trivia_1", "trivia_2", "trivia_3"]
    );

    // Batch 1 now covers items 4..8 and reuses the file that held items 2 and 3.
    let second = Arc::new(ScriptedRunner::new(Some(1.0)));
    let record = scheduler(
        second.clone(),
        dir.path(),
        key(1),
        policy,
        SchedulerConfig::new(1, 4),
    )
    .run_to_record(items(8))
    .await
    .unwrap();
    assert_eq!(record.entries.len(), 8);
    assert_eq!(second.calls.load(Ordering::SeqCst), 4);

    let after_second = store.load_iteration("trivia", 1).await.unwrap();
    let expected: Vec<String> = items(8).into_iter().map(|i| i.id).collect();
    assert_eq!(persisted_ids(&after_second), expected);
    assert_eq!(after_second.count(ItemStatus::Accepted), 8);
    assert_eq!(store.progress(&key(1)).await.unwrap().accepted, 8);
}

#[tokio::test]
async fn test_stop_mid_batch_still_checkpoints_settled_items() {
    let dir = tempdir().unwrap();
    let policy = SamplingPolicy::new(2, 1.0);
    let store = RunStore::new(dir.path());
    let all = items(4);

    // Settle items 2 and 3 on their own first.
    scheduler(
        Arc::new(ScriptedRunner::new(Some(1.0))),
        dir.path(),
        key(1),
        policy,
        SchedulerConfig::new(1, 4),
    )
    .run_to_record(all[2..].to_vec())
    .await
    .unwrap();

    // Full batch: item 0 trips the stop, item 1 is never dispatched.
    let stop = StopSignal::new();
    let interrupted = Arc::new(
        ScriptedRunner::new(Some(1.0))
            .script("trivia_0", &[Some(0.0), Some(1.0)])
            .stop_after(1, stop.clone()),
    );
    let partial = scheduler(
        interrupted.clone(),
        dir.path(),
        key(1),
        policy,
        SchedulerConfig::new(1, 4),
    )
    .with_stop_signal(stop)
    .run_to_record(all.clone())
    .await
    .unwrap();
    assert_eq!(persisted_ids(&partial), vec!["trivia_2", "trivia_3"]);
    assert_eq!(interrupted.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        persisted_ids(&store.load_iteration("trivia", 1).await.unwrap()),
        vec!["trivia_2", "trivia_3"]
    );

    let resumed = Arc::new(
        ScriptedRunner::new(Some(1.0)).script("trivia_0", &[Some(0.0), Some(1.0)]),
    );
    let complete = scheduler(
        resumed.clone(),
        dir.path(),
        key(1),
        policy,
        SchedulerConfig::new(1, 4),
    )
    .run_to_record(all.clone())
    .await
    .unwrap();
    assert_eq!(complete.count(ItemStatus::Accepted), 4);

    let mut executed = resumed.executed.lock().unwrap().clone();
    executed.sort();
    assert_eq!(
        executed,
        vec![("trivia_0".to_string(), 2), ("trivia_1".to_string(), 1)]
    );
    let persisted = store.load_iteration("trivia", 1).await.unwrap();
    assert_eq!(persisted.entries.len(), 4);
    assert_eq!(persisted.count(ItemStatus::Accepted), 4);
}

#[tokio::test]
async fn test_shards_partition_the_dataset() {
    let dir = tempdir().unwrap();
    let dataset = items(10);
    let store = Arc::new(RunStore::new(dir.path()));

    for worker in 0..3 {
        let shard = ShardKey::new(worker, 3);
        let owned = select_shard(dataset.clone(), &shard).unwrap();
        let scheduler = BatchScheduler::new(
            Arc::new(ScriptedRunner::new(Some(1.0))),
            store.clone(),
            StorageKey::new("trivia", 1, shard),
            SamplingPolicy::default(),
            SchedulerConfig::new(2, 3),
        )
        .unwrap();
        scheduler.run_to_record(owned).await.unwrap();
    }

    let record = store.load_iteration("trivia", 1).await.unwrap();
    let ids: Vec<&str> = record.entries.iter().map(|e| e.item_id.as_str()).collect();
    let expected: Vec<String> = dataset.iter().map(|i| i.id.clone()).collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_merge_across_iterations() {
    let dir = tempdir().unwrap();
    let policy = SamplingPolicy::new(1, 1.0);
    let config = SchedulerConfig::new(2, 4);

    // Iteration 1 gets only the even items right.
    let mut first = ScriptedRunner::new(Some(1.0));
    for item in items(4).iter().filter(|i| i.index % 2 == 1) {
        first = first.script(&item.id, &[Some(0.3)]);
    }
    scheduler(Arc::new(first), dir.path(), key(1), policy, config.clone())
        .run_to_record(items(4))
        .await
        .unwrap();
    // Iteration 2 gets everything right.
    scheduler(
        Arc::new(ScriptedRunner::new(Some(1.0))),
        dir.path(),
        key(2),
        policy,
        config,
    )
    .run_to_record(items(4))
    .await
    .unwrap();

    let store = RunStore::new(dir.path());
    assert_eq!(store.list_iterations("trivia").await.unwrap(), vec![1, 2]);
    let records: Vec<IterationRecord> = vec![
        store.load_iteration("trivia", 1).await.unwrap(),
        store.load_iteration("trivia", 2).await.unwrap(),
    ];

    let merged = merge(&records);
    assert_eq!(merged.items.len(), 4);
    for item in &merged.items {
        assert!(item.is_accepted());
        assert_eq!(item.iterations_seen, 2);
        let expected = if item.index % 2 == 0 { 1 } else { 2 };
        assert_eq!(item.accepted_in, Some(expected), "item {}", item.item_id);
    }
    assert_eq!(merged.summary().acceptance_rate, 1.0);

    // Merging the same iterations again changes nothing
    let doubled: Vec<IterationRecord> = records.iter().chain(records.iter()).cloned().collect();
    assert_eq!(merge(&doubled), merged);
}

#[tokio::test]
async fn test_no_resume_discards_previous_progress() {
    let dir = tempdir().unwrap();
    let policy = SamplingPolicy::default();
    let config = SchedulerConfig::new(2, 4);

    scheduler(
        Arc::new(ScriptedRunner::new(Some(1.0))),
        dir.path(),
        key(1),
        policy,
        config.clone(),
    )
    .run_to_record(items(3))
    .await
    .unwrap();

    let rerun = Arc::new(ScriptedRunner::new(Some(1.0)));
    scheduler(rerun.clone(), dir.path(), key(1), policy, config.with_resume(false))
        .run_to_record(items(3))
        .await
        .unwrap();

    assert_eq!(rerun.calls.load(Ordering::SeqCst), 3);
    let progress = RunStore::new(dir.path()).progress(&key(1)).await.unwrap();
    assert_eq!(progress.attempts_logged, 3);
}
