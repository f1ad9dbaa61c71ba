//! Bounded-parallel batch execution with per-item failure isolation.
//!
//! Every identifier is handed to the task on a fixed-size worker pool. A task
//! that returns `Err` or panics only fails its own item. Results are delivered
//! to a [`BatchObserver`] twice: once as each item completes, and once in
//! report order (manifest order or completion order, see [`ReportOrder`]).

use anyhow::{anyhow, Result};
use rayon::ThreadPoolBuilder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOrder {
    /// Items are reported in manifest order; early finishers are buffered
    /// until every item before them has completed.
    #[default]
    Manifest,
    /// Items are reported as they complete.
    Completion,
}

impl ReportOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportOrder::Manifest => "manifest",
            ReportOrder::Completion => "completion",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatchOptions {
    pub workers: usize,
    pub order: ReportOrder,
    /// Extra attempts after a failed one. Zero means no retry.
    pub retries: u32,
    /// Wall-clock limit for each external process an item launches.
    pub timeout: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            order: ReportOrder::Manifest,
            retries: 0,
            timeout: None,
        }
    }
}

/// Per-attempt information handed to the task.
#[derive(Clone, Copy, Debug)]
pub struct ItemContext {
    pub index: usize,
    pub attempt: u32,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<T> {
    Success(T),
    Failure(String),
}

#[derive(Debug, Clone)]
pub struct ItemResult<T> {
    pub index: usize,
    pub id: String,
    pub attempts: u32,
    pub outcome: ItemOutcome<T>,
}

impl<T> ItemResult<T> {
    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            ItemOutcome::Success(v) => Some(v),
            ItemOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ItemOutcome::Success(_) => None,
            ItemOutcome::Failure(msg) => Some(msg),
        }
    }
}

#[derive(Debug)]
pub struct BatchReport<T> {
    /// Results in report order.
    pub items: Vec<ItemResult<T>>,
}

impl<T> BatchReport<T> {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.value().is_some()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items
            .iter()
            .filter_map(|i| i.error().map(|e| (i.id.as_str(), e)))
    }
}

pub trait BatchObserver<T> {
    /// Called on the coordinating thread as soon as an item finishes.
    fn completed(&mut self, _item: &ItemResult<T>) {}

    /// Called in report order.
    fn report(&mut self, _item: &ItemResult<T>) -> Result<()> {
        Ok(())
    }
}

pub struct NoopObserver;

impl<T> BatchObserver<T> for NoopObserver {}

pub fn run_batch<T, F, O>(
    ids: &[String],
    options: &BatchOptions,
    task: F,
    observer: &mut O,
) -> Result<BatchReport<T>>
where
    T: Send,
    F: Fn(&str, &ItemContext) -> Result<T> + Sync,
    O: BatchObserver<T> + ?Sized,
{
    if ids.is_empty() {
        return Ok(BatchReport { items: Vec::new() });
    }

    let worker_count = options.workers.max(1).min(ids.len());
    info!(
        items = ids.len(),
        workers = worker_count,
        order = options.order.as_str(),
        retries = options.retries,
        "batch started"
    );
    let pool = ThreadPoolBuilder::new()
        .num_threads(worker_count)
        .thread_name(|i| format!("stresslab-worker-{}", i))
        .build()
        .map_err(|e| anyhow!("failed to build worker pool: {}", e))?;

    let (tx, rx) = mpsc::channel::<ItemResult<T>>();
    let task = &task;
    let mut items = Vec::with_capacity(ids.len());
    let mut report_err = None;

    pool.in_place_scope(|scope| {
        for (index, id) in ids.iter().enumerate() {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let result = run_item(index, id, options, task);
                let _ = tx.send(result);
            });
        }
        drop(tx);

        let mut pending = BTreeMap::new();
        let mut next = 0usize;
        for item in rx.iter() {
            observer.completed(&item);
            match options.order {
                ReportOrder::Completion => {
                    deliver(observer, &mut report_err, &item);
                    items.push(item);
                }
                ReportOrder::Manifest => {
                    pending.insert(item.index, item);
                    while let Some(ready) = pending.remove(&next) {
                        deliver(observer, &mut report_err, &ready);
                        items.push(ready);
                        next += 1;
                    }
                }
            }
        }
    });

    let report = BatchReport { items };
    info!(
        items = report.items.len(),
        succeeded = report.succeeded(),
        failed = report.items.len() - report.succeeded(),
        "batch finished"
    );
    match report_err {
        Some(err) => Err(err),
        None => Ok(report),
    }
}

fn deliver<T, O>(observer: &mut O, first_err: &mut Option<anyhow::Error>, item: &ItemResult<T>)
where
    O: BatchObserver<T> + ?Sized,
{
    if let Err(err) = observer.report(item) {
        warn!(id = %item.id, "report failed: {:#}", err);
        if first_err.is_none() {
            *first_err = Some(err);
        }
    }
}

fn run_item<T, F>(index: usize, id: &str, options: &BatchOptions, task: &F) -> ItemResult<T>
where
    F: Fn(&str, &ItemContext) -> Result<T>,
{
    let max_attempts = options.retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        let ctx = ItemContext {
            index,
            attempt,
            timeout: options.timeout,
        };
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task(id, &ctx))) {
            Ok(Ok(value)) => ItemOutcome::Success(value),
            Ok(Err(err)) => ItemOutcome::Failure(format!("{:#}", err)),
            Err(payload) => ItemOutcome::Failure(panic_message(payload.as_ref())),
        };
        if let ItemOutcome::Failure(msg) = &outcome {
            if attempt < max_attempts {
                warn!(id, attempt, "retrying after failure: {}", msg);
                attempt += 1;
                continue;
            }
        }
        return ItemResult {
            index,
            id: id.to_string(),
            attempts: attempt,
            outcome,
        };
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
