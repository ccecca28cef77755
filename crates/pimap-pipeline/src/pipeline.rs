//! PIMAP Pipeline
//!
//! Orchestrates one Store + Analyze node. A submitted sample is stored,
//! advances its stream's watermark, is assigned to its windows, and closes
//! every window the new watermark has passed. Closed windows are queued for
//! a pool of evaluation workers that run the metric engine and retire or
//! requeue each window when its evaluation completes.
//!
//! Key Features:
//! - `submit_sample` for concurrent producers; identical resubmission is a no-op
//! - Ingest serialized per stream so closure never overtakes a stored sample
//! - Late-data events counted and routed to the side-output channel
//! - At most one evaluation per window in flight
//! - Graceful shutdown that releases in-flight windows and checkpoints state
//! - Window index rebuilt from the sample log when no checkpoint exists
//! - Samples written after the last checkpoint replayed on open
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::checkpoint::Checkpoint;
use crate::stats::{Counters, PipelineStats};
use parking_lot::{Mutex, RwLock};
use pimap_analyze::{register_from_config, MetricEngine, MetricOutcome, MetricRegistry, WindowReport};
use pimap_common::{
    Lsn, MetricId, MetricRecord, PimapError, PipelineConfig, Result, Sample, ScopeId, StreamId,
    Timestamp,
};
use pimap_storage::{MetricStore, SampleSource, SampleStore, UpsertOutcome, WriteOutcome};
use pimap_streaming::{
    ClosedWindow, Completion, LateDataEvent, LateDisposition, SideOutput, SideOutputReceiver,
    WatermarkTracker, WindowManager,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type TaskReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ClosedWindow>>>;

// =============================================================================
// Shared State
// =============================================================================

struct Inner {
    config: PipelineConfig,
    samples: Arc<SampleStore>,
    metrics: Arc<MetricStore>,
    tracker: WatermarkTracker,
    windows: WindowManager,
    engine: MetricEngine,
    side_output: SideOutput,
    queue: mpsc::UnboundedSender<ClosedWindow>,
    /// Evaluations queued or running.
    pending: watch::Sender<usize>,
    cancel: CancellationToken,
    counters: Counters,
    /// Shared by every ingest, exclusive while a checkpoint is captured.
    ingest_gate: RwLock<()>,
    /// One ingest at a time per stream, from store write to dispatch.
    stream_locks: Mutex<HashMap<StreamId, Arc<Mutex<()>>>>,
}

impl Inner {
    // -------------------------------------------------------------------------
    // Ingest Path
    // -------------------------------------------------------------------------

    fn stream_lock(&self, stream: &StreamId) -> Arc<Mutex<()>> {
        self.stream_locks
            .lock()
            .entry(stream.clone())
            .or_default()
            .clone()
    }

    fn ingest(&self, sample: Sample) -> Result<()> {
        let _gate = self.ingest_gate.read();
        let stream_lock = self.stream_lock(&sample.stream_id);
        let _stream = stream_lock.lock();

        let key = sample.key();
        let observed_max = match self.samples.write(sample) {
            Ok(WriteOutcome::Stored { observed_max }) => observed_max,
            Ok(WriteOutcome::Unchanged) => {
                Counters::incr(&self.counters.samples_unchanged);
                return Ok(());
            }
            Err(err) => {
                Counters::incr(&self.counters.samples_rejected);
                return Err(err);
            }
        };
        Counters::incr(&self.counters.samples_stored);
        tracing::debug!(sample = %key, "sample stored");

        self.tracker.advance(&key.stream_id, observed_max);

        let assignment = self.windows.assign(&key, &self.tracker);
        for event in assignment.late {
            self.on_late(event);
        }
        for task in assignment.tasks {
            Counters::incr(&self.counters.recomputations);
            self.enqueue(task);
        }

        let closed = self.windows.on_watermark(&key.stream_id, &self.tracker);
        self.dispatch_closed(closed)
    }

    fn on_late(&self, event: LateDataEvent) {
        Counters::incr(&self.counters.late_events);
        if event.disposition == LateDisposition::SideOutput {
            Counters::incr(&self.counters.side_output_events);
            self.side_output.publish(event);
        }
    }

    /// CLOSING -> CLOSED, then queue. A worker must never see a CLOSING window.
    fn dispatch_closed(&self, closed: Vec<ClosedWindow>) -> Result<()> {
        for task in closed {
            Counters::incr(&self.counters.windows_closed);
            self.windows.mark_closed(&task.key)?;
            self.enqueue(task);
        }
        Ok(())
    }

    /// Hand a claimed window to the workers. On failure the window is
    /// released and stays pending.
    fn enqueue(&self, task: ClosedWindow) {
        self.pending.send_modify(|n| *n += 1);
        if let Err(mpsc::error::SendError(task)) = self.queue.send(task) {
            self.finish_task();
            if let Err(err) = self.windows.release(&task.key) {
                tracing::warn!(window = %task.key, error = %err, "failed to release window");
            }
        }
    }

    fn finish_task(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    // -------------------------------------------------------------------------
    // Evaluation Path
    // -------------------------------------------------------------------------

    async fn run(&self, task: ClosedWindow) {
        let report = self.engine.evaluate(&task, &self.cancel).await;
        self.count_report(&report);

        if report.cancelled {
            Counters::incr(&self.counters.evaluations_cancelled);
            if let Err(err) = self.windows.release(&task.key) {
                tracing::warn!(window = %task.key, error = %err, "failed to release window");
            }
        } else {
            Counters::incr(&self.counters.evaluations);
            match self.windows.complete(&task.key) {
                Ok(Completion::Requeue(window)) => {
                    tracing::debug!(window = %window.key, "window requeued for recompute");
                    self.enqueue(window);
                }
                Ok(Completion::Retired(bounds)) => {
                    tracing::debug!(window = %task.key, bounds = %bounds, "window retired");
                }
                Err(err) => {
                    tracing::warn!(window = %task.key, error = %err, "failed to complete window");
                }
            }
        }

        self.finish_task();
    }

    fn count_report(&self, report: &WindowReport) {
        for metric in &report.metrics {
            match &metric.outcome {
                MetricOutcome::Written(UpsertOutcome::Unchanged) | MetricOutcome::Unchanged => {
                    Counters::incr(&self.counters.metrics_unchanged)
                }
                MetricOutcome::Written(_) => Counters::incr(&self.counters.metrics_written),
                MetricOutcome::Failed(_) => Counters::incr(&self.counters.metrics_failed),
                MetricOutcome::NoValue | MetricOutcome::Cancelled => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Re-derive watermarks and windows from the sample log, stream by
    /// stream in event-time order.
    fn rebuild_from_samples(&self) -> Result<usize> {
        let mut replayed = 0;
        for stream in self.samples.streams() {
            for sample in self.samples.read_range(&stream, Timestamp::MIN, Timestamp::MAX) {
                let key = sample.key();
                self.tracker.advance(&stream, key.timestamp);
                for event in self.windows.assign(&key, &self.tracker).late {
                    self.on_late(event);
                }
                replayed += 1;
            }
            let closed = self.windows.on_watermark(&stream, &self.tracker);
            self.dispatch_closed(closed)?;
        }
        Ok(replayed)
    }

    /// Drive samples written after a checkpoint through windowing, in the
    /// order they were originally written.
    fn replay_after(&self, after: Lsn) -> Result<usize> {
        let samples = self.samples.samples_after(after);
        for sample in &samples {
            let key = sample.key();
            self.tracker.advance(&key.stream_id, key.timestamp);

            let assignment = self.windows.assign(&key, &self.tracker);
            for event in assignment.late {
                self.on_late(event);
            }
            for task in assignment.tasks {
                Counters::incr(&self.counters.recomputations);
                self.enqueue(task);
            }

            let closed = self.windows.on_watermark(&key.stream_id, &self.tracker);
            self.dispatch_closed(closed)?;
        }
        Ok(samples.len())
    }

    fn capture_checkpoint(&self) -> Checkpoint {
        let _gate = self.ingest_gate.write();
        Checkpoint::capture(&self.samples, &self.tracker, &self.windows)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// A running Store + Analyze pipeline.
pub struct Pipeline {
    inner: Arc<Inner>,
    receiver: TaskReceiver,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Open the stores, register configured metrics into `registry`, restore
    /// the last checkpoint and start the workers.
    pub async fn open(config: PipelineConfig, registry: Arc<MetricRegistry>) -> Result<Self> {
        Self::open_with(config, registry, |store| store as Arc<dyn SampleSource>).await
    }

    /// Like `open`, with the engine reading samples through `source`
    /// (for instance a remote replica or an instrumented wrapper).
    pub async fn open_with<F>(
        config: PipelineConfig,
        registry: Arc<MetricRegistry>,
        source: F,
    ) -> Result<Self>
    where
        F: FnOnce(Arc<SampleStore>) -> Arc<dyn SampleSource>,
    {
        config.validate()?;

        let samples = Arc::new(SampleStore::open(&config.storage)?);
        let metrics = Arc::new(MetricStore::open(&config.storage)?);
        register_from_config(&registry, &config.metrics)?;

        let engine = MetricEngine::with_config(
            registry,
            source(samples.clone()),
            metrics.clone(),
            &config.engine,
        );

        let (queue, receiver) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);

        let inner = Arc::new(Inner {
            tracker: WatermarkTracker::from_config(&config),
            windows: WindowManager::new(&config),
            side_output: SideOutput::with_config(&config.side_output),
            samples,
            metrics,
            engine,
            queue,
            pending,
            cancel: CancellationToken::new(),
            counters: Counters::new(),
            ingest_gate: RwLock::new(()),
            stream_locks: Mutex::new(HashMap::new()),
            config,
        });

        let pipeline = Self {
            inner,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
        };
        pipeline.recover().await?;
        pipeline.start_workers();

        for task in pipeline.inner.windows.pending() {
            pipeline.inner.enqueue(task);
        }

        tracing::info!(
            workers = pipeline.inner.config.engine.workers,
            metrics = pipeline.inner.engine.registry().len(),
            persistent = pipeline.inner.config.storage.data_directory.is_some(),
            "pipeline started"
        );
        Ok(pipeline)
    }

    async fn recover(&self) -> Result<()> {
        let Some(path) = self.inner.config.storage.checkpoint_path() else {
            return Ok(());
        };

        match Checkpoint::load(&path).await? {
            Some(checkpoint) => {
                let sample_lsn = checkpoint.sample_lsn;
                let restored = checkpoint.apply(&self.inner.tracker, &self.inner.windows);
                let replayed = self.inner.replay_after(sample_lsn)?;
                Checkpoint::remove(&path).await?;
                tracing::info!(
                    windows = restored,
                    samples = replayed,
                    "checkpoint restored"
                );
            }
            None if !self.inner.samples.is_empty() => {
                let replayed = self.inner.rebuild_from_samples()?;
                tracing::info!(samples = replayed, "window index rebuilt from sample log");
            }
            None => {}
        }
        Ok(())
    }

    fn start_workers(&self) {
        let count = self.inner.config.engine.workers.max(1);
        let mut workers = self.workers.lock();
        for id in 0..count {
            let inner = self.inner.clone();
            let receiver = self.receiver.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(id, inner, receiver).await;
            }));
        }
    }

    // -------------------------------------------------------------------------
    // Sense Boundary
    // -------------------------------------------------------------------------

    /// Store a sample and drive windowing. Identical resubmission succeeds
    /// without side effects.
    pub fn submit_sample(&self, sample: Sample) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(PimapError::ShuttingDown);
        }
        self.inner.ingest(sample)
    }

    // -------------------------------------------------------------------------
    // Visualize Boundary
    // -------------------------------------------------------------------------

    pub fn get_samples(&self, stream: &StreamId, start: Timestamp, end: Timestamp) -> Vec<Sample> {
        self.inner.samples.read_range(stream, start, end)
    }

    /// Metric records, failure markers included, by window start.
    pub fn get_metrics(
        &self,
        metric_id: &MetricId,
        scope: &ScopeId,
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<MetricRecord> {
        self.inner.metrics.read_range(metric_id, scope, start, end)
    }

    pub fn latest_sample(&self, stream: &StreamId) -> Option<Sample> {
        self.inner.samples.latest(stream)
    }

    pub fn watermark(&self, stream: &StreamId) -> Timestamp {
        self.inner.tracker.watermark(stream)
    }

    // -------------------------------------------------------------------------
    // Administration
    // -------------------------------------------------------------------------

    /// Close one window regardless of the watermark. Returns false if it
    /// was already closed.
    pub fn force_close(&self, scope: &ScopeId, window_start: Timestamp) -> Result<bool> {
        match self.inner.windows.force_close(scope, window_start)? {
            Some(task) => {
                tracing::info!(window = %task.key, "window force-closed");
                self.inner.dispatch_closed(vec![task])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// End of a stream: close all of its windows and retire its watermark
    /// so it no longer holds back its groups. Returns the windows closed.
    pub fn finish_stream(&self, stream: &StreamId) -> Result<usize> {
        self.inner.tracker.retire_stream(stream);

        let mut closed = Vec::new();
        for scope in self.inner.windows.scopes_for(stream) {
            if self.inner.windows.is_group(&scope) {
                closed.extend(self.inner.windows.close_expired(&scope, &self.inner.tracker));
                continue;
            }
            match self.inner.windows.force_close_scope(&scope) {
                Ok(tasks) => closed.extend(tasks),
                Err(PimapError::WindowNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let count = closed.len();
        self.inner.dispatch_closed(closed)?;
        tracing::info!(stream = %stream, windows = count, "stream finished");
        Ok(count)
    }

    /// Subscribe to late samples routed by the `side-output` policy.
    pub fn late_data(&self) -> SideOutputReceiver {
        self.inner.side_output.subscribe()
    }

    /// Most recent side-output events, newest first.
    pub fn late_history(&self, count: usize) -> Vec<LateDataEvent> {
        self.inner.side_output.history(count)
    }

    /// Wait until no evaluation is queued or running.
    pub async fn wait_idle(&self) {
        let mut pending = self.inner.pending.subscribe();
        tokio::select! {
            _ = pending.wait_for(|n| *n == 0) => {}
            _ = self.inner.cancel.cancelled() => {}
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.counters.snapshot(
            self.inner.windows.counts(),
            *self.inner.pending.borrow(),
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Write a checkpoint now. No-op for in-memory pipelines.
    pub async fn checkpoint(&self) -> Result<()> {
        let Some(path) = self.inner.config.storage.checkpoint_path() else {
            return Ok(());
        };
        self.inner
            .capture_checkpoint()
            .write(&path, self.inner.config.storage.sync_writes)
            .await
    }

    /// Stop the workers at their next cancellation point, release queued
    /// windows, flush the stores and checkpoint.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }
        tracing::info!("pipeline shutting down");
        self.inner.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "evaluation worker panicked");
            }
        }

        let mut released = 0;
        {
            let mut receiver = self.receiver.lock().await;
            while let Ok(task) = receiver.try_recv() {
                if self.inner.windows.release(&task.key).is_ok() {
                    released += 1;
                }
                self.inner.finish_task();
            }
        }

        self.inner.samples.flush()?;
        self.inner.metrics.flush()?;
        self.checkpoint().await?;

        let stats = self.stats();
        tracing::info!(
            released,
            samples = stats.samples_stored,
            metrics = stats.metrics_written,
            failures = stats.metrics_failed,
            "pipeline stopped"
        );
        Ok(())
    }
}

async fn worker_loop(id: usize, inner: Arc<Inner>, receiver: TaskReceiver) {
    tracing::debug!(worker = id, "evaluation worker started");
    loop {
        let next = tokio::select! {
            _ = inner.cancel.cancelled() => None,
            task = async { receiver.lock().await.recv().await } => task,
        };
        let Some(task) = next else {
            break;
        };
        inner.run(task).await;
    }
    tracing::debug!(worker = id, "evaluation worker stopped");
}

// =============================================================================
// Tests
// =============================================================================
