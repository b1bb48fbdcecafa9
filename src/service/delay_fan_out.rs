//! Bulk processing: every named row gets a random delay, all delays are
//! waited out concurrently, and each fired delay is written back to its row
//! through a single writer.

use crate::models::config::Config;
use crate::models::delay_assignment::{DelayAssignment, FanOutReport};
use crate::models::file_row::FileRow;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Receives delay values as their timers fire. Writes arrive one at a time
/// from the batch's writer task.
pub trait DelaySink: Send + Sync {
    fn apply(&self, row_id: usize, delay: u64);
}

type RowObserver = Box<dyn Fn(usize, &FileRow) + Send + Sync>;

/// Mutex-guarded table of file rows, addressed by index.
pub struct RowTable {
    rows: Mutex<Vec<FileRow>>,
    observer: Option<RowObserver>,
}

impl RowTable {
    pub fn new(rows: Vec<FileRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            observer: None,
        }
    }

    /// Calls `observer` after every applied write, while the table is locked.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(usize, &FileRow) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Row names as handed to a batch. Blank names become `None`.
    pub fn names(&self) -> Vec<Option<String>> {
        self.lock()
            .iter()
            .map(|row| {
                if row.name.trim().is_empty() {
                    None
                } else {
                    Some(row.name.clone())
                }
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<FileRow> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FileRow>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DelaySink for RowTable {
    fn apply(&self, row_id: usize, delay: u64) {
        let mut rows = self.lock();
        match rows.get_mut(row_id) {
            Some(row) => {
                row.delay = Some(delay);
                if let Some(observer) = &self.observer {
                    observer(row_id, row);
                }
            }
            None => warn!("Dropping delay {} for unknown row {}", delay, row_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanOutOptions {
    /// Wall time of one delay unit.
    pub delay_unit: Duration,
    /// Seed for the batch's random source. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for FanOutOptions {
    fn default() -> Self {
        Self {
            delay_unit: Duration::from_secs(1),
            seed: None,
        }
    }
}

impl From<&Config> for FanOutOptions {
    fn from(config: &Config) -> Self {
        Self {
            delay_unit: config.delay_unit(),
            seed: config.delay_seed,
        }
    }
}

/// Stops the timers of the batch it is passed to. Timers that already fired
/// are still written; the rest end up in [`FanOutReport::pending`].
///
/// One handle belongs to one batch: a cancelled handle cancels every batch
/// run with it, so create a new one per batch.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DelayFanOut {
    options: FanOutOptions,
}

impl DelayFanOut {
    pub fn new(options: FanOutOptions) -> Self {
        Self { options }
    }

    /// Draws a delay in `[1, rows.len()]` for every named row from one random
    /// source. Unnamed rows get no assignment.
    pub fn draw_delays(&self, rows: &[Option<String>]) -> Vec<DelayAssignment> {
        let mut rng = match self.options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let upper = rows.len() as u64;

        rows.iter()
            .enumerate()
            .filter(|(_, name)| name.as_deref().is_some_and(|n| !n.trim().is_empty()))
            .map(|(row_id, _)| DelayAssignment {
                row_id,
                delay: rng.random_range(1..=upper),
                completed: false,
            })
            .collect()
    }

    /// Runs one batch over `rows` that cannot be cancelled.
    pub async fn run(&self, rows: &[Option<String>], sink: Arc<dyn DelaySink>) -> FanOutReport {
        self.run_with_cancel(rows, sink, &CancelHandle::new()).await
    }

    /// Runs one batch over `rows` and returns once every timer has fired (or
    /// was cancelled through `cancel`) and every fired delay has been applied
    /// to `sink`.
    pub async fn run_with_cancel(
        &self,
        rows: &[Option<String>],
        sink: Arc<dyn DelaySink>,
        cancel: &CancelHandle,
    ) -> FanOutReport {
        let batch_id = Uuid::new_v4();
        let assignments = self.draw_delays(rows);
        info!(
            "Batch {}: scheduling {} timers over {} rows",
            batch_id,
            assignments.len(),
            rows.len()
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<DelayAssignment>();

        let writer = tokio::spawn(async move {
            let mut applied = Vec::new();
            while let Some(assignment) = rx.recv().await {
                sink.apply(assignment.row_id, assignment.delay);
                applied.push(assignment);
            }
            applied
        });

        let mut timers = JoinSet::new();
        for assignment in assignments {
            timers.spawn(wait_out(
                assignment,
                self.options.delay_unit,
                cancel.subscribe(),
                tx.clone(),
            ));
        }
        // The writer stops once the last timer drops its sender.
        drop(tx);

        let mut fired = Vec::new();
        let mut pending = Vec::new();
        while let Some(joined) = timers.join_next().await {
            match joined {
                Ok(assignment) if assignment.completed => fired.push(assignment),
                Ok(assignment) => pending.push(assignment),
                Err(e) => error!("Batch {}: timer task failed: {}", batch_id, e),
            }
        }

        let completed = match writer.await {
            Ok(applied) => applied,
            Err(e) => {
                error!("Batch {}: writer task failed: {}", batch_id, e);
                Vec::new()
            }
        };

        // Fired but never confirmed as written, e.g. when the writer died.
        let mut unapplied: Vec<DelayAssignment> = fired
            .into_iter()
            .filter(|f| !completed.iter().any(|c| c.row_id == f.row_id))
            .collect();

        pending.sort_by_key(|a| a.row_id);
        unapplied.sort_by_key(|a| a.row_id);
        if !unapplied.is_empty() {
            error!(
                "Batch {}: {} fired delays were never applied",
                batch_id,
                unapplied.len()
            );
        }
        if pending.is_empty() {
            info!("Batch {}: {} delays applied", batch_id, completed.len());
        } else {
            warn!(
                "Batch {}: cancelled with {} of {} delays still pending",
                batch_id,
                pending.len(),
                pending.len() + completed.len() + unapplied.len()
            );
        }

        FanOutReport {
            batch_id,
            row_count: rows.len(),
            completed,
            pending,
            unapplied,
        }
    }
}

async fn wait_out(
    mut assignment: DelayAssignment,
    unit: Duration,
    mut cancel: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<DelayAssignment>,
) -> DelayAssignment {
    if *cancel.borrow_and_update() {
        return assignment;
    }

    let wait = unit.saturating_mul(u32::try_from(assignment.delay).unwrap_or(u32::MAX));

    tokio::select! {
        biased;
        _ = tokio::time::sleep(wait) => {
            assignment.completed = true;
            debug!("Row {} fired after {:?}", assignment.row_id, wait);
            if tx.send(assignment).is_err() {
                error!("Writer gone, delay for row {} was not applied", assignment.row_id);
            }
        }
        _ = cancelled(&mut cancel) => {
            debug!("Row {} cancelled", assignment.row_id);
        }
    }

    assignment
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        // Sender dropped without cancelling: nothing can cancel any more.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use std::collections::HashSet;
    use tokio::time::Instant;

    fn rows(names: &[&str]) -> Vec<FileRow> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                FileRow::new(
                    name.to_string(),
                    Local.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
                    (i as u64 + 1) * 100,
                )
            })
            .collect()
    }

    fn fan_out(seed: u64) -> DelayFanOut {
        DelayFanOut::new(FanOutOptions {
            delay_unit: Duration::from_secs(1),
            seed: Some(seed),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_rows_join_after_slowest_timer() {
        let table = Arc::new(RowTable::new(rows(&["a.txt", "b.txt", "c.txt"])));
        let names = table.names();
        let fan_out = fan_out(7);
        let expected = fan_out.draw_delays(&names);
        let slowest = expected.iter().map(|a| a.delay).max().unwrap();

        let started = Instant::now();
        let report = fan_out.run(&names, table.clone()).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(slowest));
        assert!(elapsed < Duration::from_secs(slowest + 1));
        assert!(report.is_complete());
        assert_eq!(report.row_count, 3);
        assert_eq!(report.completed.len(), 3);
        for row in table.snapshot() {
            let delay = row.delay.unwrap();
            assert!((1..=3).contains(&delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_row_gets_its_own_draw_exactly_once() {
        let table = Arc::new(RowTable::new(rows(&["1", "2", "3", "4", "5", "6", "7", "8"])));
        let names = table.names();
        let fan_out = fan_out(99);
        let expected = fan_out.draw_delays(&names);

        let report = fan_out.run(&names, table.clone()).await;

        let ids: HashSet<usize> = report.completed.iter().map(|a| a.row_id).collect();
        assert_eq!(ids.len(), 8);
        assert_eq!(report.completed.len(), 8);
        let snapshot = table.snapshot();
        for assignment in expected {
            assert_eq!(snapshot[assignment.row_id].delay, Some(assignment.delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_arrive_in_delay_order() {
        let table = Arc::new(RowTable::new(rows(&["a", "b", "c", "d", "e", "f"])));
        let names = table.names();

        let report = fan_out(3).run(&names, table).await;

        let delays: Vec<u64> = report.completed.iter().map(|a| a.delay).collect();
        let mut sorted = delays.clone();
        sorted.sort();
        assert_eq!(delays, sorted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unnamed_rows_are_skipped_but_count_toward_range() {
        let table = Arc::new(RowTable::new(rows(&["a.txt", "", "c.txt", "   "])));
        let names = table.names();
        assert_eq!(names[1], None);
        assert_eq!(names[3], None);

        let report = fan_out(11).run(&names, table.clone()).await;

        assert_eq!(report.row_count, 4);
        assert_eq!(report.completed.len(), 2);
        let snapshot = table.snapshot();
        assert!(snapshot[0].delay.is_some_and(|d| (1..=4).contains(&d)));
        assert_eq!(snapshot[1].delay, None);
        assert!(snapshot[2].delay.is_some_and(|d| (1..=4).contains(&d)));
        assert_eq!(snapshot[3].delay, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_leave_other_fields_untouched() {
        let original = rows(&["x", "y", "z", "w"]);
        let table = Arc::new(RowTable::new(original.clone()));
        let names = table.names();

        fan_out(5).run(&names, table.clone()).await;

        for (before, after) in original.iter().zip(table.snapshot()) {
            assert_eq!(before.name, after.name);
            assert_eq!(before.last_modified, after.last_modified);
            assert_eq!(before.size, after.size);
            assert!(after.delay.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_completes_immediately() {
        let table = Arc::new(RowTable::new(Vec::new()));

        let report = fan_out(1).run(&[], table).await;

        assert_eq!(report.row_count, 0);
        assert!(report.completed.is_empty());
        assert!(report.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_fired_rows_and_reports_the_rest() {
        let names: Vec<&str> = (0..10).map(|_| "file").collect();
        let table = Arc::new(RowTable::new(rows(&names)));
        let row_names = table.names();
        let fan_out = fan_out(2024);
        let handle = CancelHandle::new();

        let (report, _) = tokio::join!(fan_out.run_with_cancel(&row_names, table.clone(), &handle), async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            handle.cancel();
        });

        assert!(handle.is_cancelled());
        assert_eq!(report.completed.len() + report.pending.len(), 10);
        assert!(report.completed.iter().all(|a| a.completed && a.delay <= 2));
        assert!(report.pending.iter().all(|a| !a.completed && a.delay >= 3));
        let snapshot = table.snapshot();
        for a in &report.completed {
            assert_eq!(snapshot[a.row_id].delay, Some(a.delay));
        }
        for a in &report.pending {
            assert_eq!(snapshot[a.row_id].delay, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_run_writes_nothing() {
        let table = Arc::new(RowTable::new(rows(&["a", "b", "c"])));
        let names = table.names();
        let fan_out = fan_out(8);
        let handle = CancelHandle::new();
        handle.cancel();

        let report = fan_out.run_with_cancel(&names, table.clone(), &handle).await;

        assert!(report.completed.is_empty());
        assert_eq!(report.pending.len(), 3);
        assert!(table.snapshot().iter().all(|row| row.delay.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batch_does_not_affect_the_next_one() {
        let fan_out = fan_out(13);
        let handle = CancelHandle::new();
        handle.cancel();
        let first_table = Arc::new(RowTable::new(rows(&["a"])));
        let first = fan_out
            .run_with_cancel(&first_table.names(), first_table.clone(), &handle)
            .await;
        assert_eq!(first.pending.len(), 1);

        let second_table = Arc::new(RowTable::new(rows(&["a"])));
        let second = fan_out.run(&second_table.names(), second_table.clone()).await;

        assert!(second.is_complete());
        assert_eq!(second.completed.len(), 1);
        assert_eq!(second_table.snapshot()[0].delay, Some(1));
        assert_ne!(first.batch_id, second.batch_id);
    }

    struct FailingSink;

    impl DelaySink for FailingSink {
        fn apply(&self, row_id: usize, _delay: u64) {
            panic!("display rejected row {}", row_id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_writer_leaves_report_incomplete() {
        let names: Vec<Option<String>> = vec![Some("a".into()), Some("b".into())];

        let report = fan_out(21).run(&names, Arc::new(FailingSink)).await;

        assert!(!report.is_complete());
        assert!(report.completed.is_empty());
        assert!(report.pending.is_empty());
        let ids: HashSet<usize> = report.unapplied.iter().map(|a| a.row_id).collect();
        assert!(!ids.is_empty());
        assert!(ids.is_subset(&HashSet::from([0, 1])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_writers() {
        let names: Vec<String> = (0..64).map(|i| format!("file_{i}.dat")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_observer = seen.clone();
        let table = Arc::new(RowTable::new(rows(&name_refs)).with_observer(move |row_id, _| {
            seen_by_observer.lock().unwrap().push(row_id);
        }));
        let row_names = table.names();
        let fan_out = DelayFanOut::new(FanOutOptions {
            delay_unit: Duration::from_millis(1),
            seed: None,
        });

        let report = fan_out.run(&row_names, table.clone()).await;

        assert_eq!(report.completed.len(), 64);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
        for (i, row) in table.snapshot().iter().enumerate() {
            assert_eq!(row.name, format!("file_{i}.dat"));
            assert!(row.delay.is_some_and(|d| (1..=64).contains(&d)));
        }
    }

    #[test]
    fn test_seeded_draws_repeat() {
        let names: Vec<Option<String>> = (0..20).map(|i| Some(format!("{i}"))).collect();

        let first = fan_out(42).draw_delays(&names);
        let second = fan_out(42).draw_delays(&names);

        assert_eq!(first, second);
        assert!(first.iter().all(|a| (1..=20).contains(&a.delay) && !a.completed));
    }

    #[test]
    fn test_single_row_always_draws_one() {
        let draws = fan_out(0).draw_delays(&[Some("only".to_string())]);

        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].delay, 1);
    }

    #[test]
    fn test_apply_to_unknown_row_is_ignored() {
        let table = RowTable::new(rows(&["a"]));

        table.apply(5, 1);

        assert_eq!(table.snapshot()[0].delay, None);
    }
}
