//! PIMAP Window Manager
//!
//! Groups stored samples into event-time windows per scope (a stream or a
//! configured stream group) and drives each window through its lifecycle:
//!
//! OPEN -> CLOSING -> CLOSED -> RETIRED
//!
//! A window closes when the watermark of its scope reaches its end. Closing
//! hands out exactly one evaluation task; while that task is queued or
//! running, further late samples only set a recompute flag, so a window
//! never has two evaluations in flight. Windows hold sample references, not
//! payloads; the sample store owns the data.
//!
//! Key Features:
//! - Fixed and sliding windows aligned to the epoch
//! - Session windows with gap-based merging
//! - Late-data handling per scope policy
//! - Sharded by scope, no global lock
//! - Serializable index for checkpoints
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::event::{LateDataEvent, LateDisposition};
use crate::watermark::WatermarkTracker;
use parking_lot::Mutex;
use pimap_common::config::WindowConfig;
use pimap_common::utils::shard_for;
use pimap_common::{
    LateDataPolicy, PimapError, PipelineConfig, Result, SampleKey, ScopeId, StreamId, Timestamp,
    WindowBounds, WindowKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

const SHARD_COUNT: usize = 16;

// =============================================================================
// Window Assignment
// =============================================================================

/// All windows `[k*stride, k*stride + size)` that contain `timestamp`,
/// ordered by start. Fixed windows are the case `stride == size`.
pub fn window_bounds(timestamp: Timestamp, size: i64, stride: i64) -> Vec<WindowBounds> {
    if size <= 0 || stride <= 0 {
        return Vec::new();
    }

    let t = timestamp.0 as i128;
    let (size, stride) = (size as i128, stride as i128);
    let first = (t - size).div_euclid(stride) + 1;
    let last = t.div_euclid(stride);

    (first..=last)
        .filter_map(|k| {
            let start = k * stride;
            let end = start + size;
            let start = i64::try_from(start).ok()?;
            let end = i64::try_from(end).ok()?;
            Some(WindowBounds::new(Timestamp(start), Timestamp(end)))
        })
        .collect()
}

// =============================================================================
// Window Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPhase {
    Open,
    Closing,
    Closed,
    Retired,
}

/// Identity of a live window within the index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub scope: ScopeId,
    pub start: Timestamp,
}

impl WindowKey {
    pub fn new(scope: impl Into<ScopeId>, start: Timestamp) -> Self {
        Self {
            scope: scope.into(),
            start,
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.scope, self.start.0)
    }
}

/// Evaluation task for a window whose samples are final (or reopened).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedWindow {
    pub key: WindowKey,
    pub bounds: WindowBounds,
    pub kind: WindowKind,
    /// Streams whose samples make up the window.
    pub sources: Vec<StreamId>,
}

/// Result of assigning one sample to its windows.
#[derive(Debug, Default)]
pub struct Assignment {
    pub late: Vec<LateDataEvent>,
    /// Re-evaluations scheduled by the recompute policy.
    pub tasks: Vec<ClosedWindow>,
}

/// What happens to a window after an evaluation finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Retired(WindowBounds),
    /// A late sample arrived during evaluation; evaluate again.
    Requeue(ClosedWindow),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounts {
    pub scopes: usize,
    pub open: usize,
    pub closing: usize,
    pub closed: usize,
    pub in_flight: usize,
}

// =============================================================================
// Snapshot Types
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowIndexSnapshot {
    pub scopes: Vec<ScopeSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub scope: ScopeId,
    pub windows: Vec<WindowSnapshot>,
    #[serde(default)]
    pub session_history: Vec<WindowBounds>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub bounds: WindowBounds,
    pub kind: WindowKind,
    pub phase: WindowPhase,
    pub samples: Vec<SampleKey>,
}

// =============================================================================
// Internal State
// =============================================================================

struct WindowState {
    bounds: WindowBounds,
    kind: WindowKind,
    phase: WindowPhase,
    samples: BTreeSet<SampleKey>,
    /// An evaluation task exists (queued or running).
    in_flight: bool,
    /// A late sample arrived while in flight.
    recompute: bool,
}

impl WindowState {
    fn new(bounds: WindowBounds, kind: WindowKind, phase: WindowPhase) -> Self {
        Self {
            bounds,
            kind,
            phase,
            samples: BTreeSet::new(),
            in_flight: false,
            recompute: false,
        }
    }
}

#[derive(Default)]
struct ScopeWindows {
    windows: BTreeMap<Timestamp, WindowState>,
    /// Bounds of retired sessions, oldest first.
    history: VecDeque<WindowBounds>,
}

#[derive(Default)]
struct Shard {
    scopes: HashMap<ScopeId, ScopeWindows>,
}

// =============================================================================
// Window Manager
// =============================================================================

/// Sharded index of live windows.
pub struct WindowManager {
    shards: Vec<Mutex<Shard>>,
    config: PipelineConfig,
    groups_by_stream: HashMap<StreamId, Vec<ScopeId>>,
    group_members: HashMap<ScopeId, Vec<StreamId>>,
}

impl WindowManager {
    pub fn new(config: &PipelineConfig) -> Self {
        let mut groups_by_stream: HashMap<StreamId, Vec<ScopeId>> = HashMap::new();
        let mut group_members = HashMap::new();
        for group in &config.groups {
            let scope = ScopeId::new(group.id.as_str());
            let members: Vec<StreamId> = group
                .members
                .iter()
                .map(|m| StreamId::new(m.as_str()))
                .collect();
            for member in &members {
                groups_by_stream
                    .entry(member.clone())
                    .or_default()
                    .push(scope.clone());
            }
            group_members.insert(scope, members);
        }

        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect(),
            config: config.clone(),
            groups_by_stream,
            group_members,
        }
    }

    // -------------------------------------------------------------------------
    // Scope Resolution
    // -------------------------------------------------------------------------

    /// The stream's own scope followed by every group containing it.
    pub fn scopes_for(&self, stream: &StreamId) -> Vec<ScopeId> {
        let mut scopes = vec![ScopeId::from(stream)];
        if let Some(groups) = self.groups_by_stream.get(stream) {
            scopes.extend(groups.iter().cloned());
        }
        scopes
    }

    /// Streams that feed a scope.
    pub fn sources(&self, scope: &ScopeId) -> Vec<StreamId> {
        self.group_members
            .get(scope)
            .cloned()
            .unwrap_or_else(|| vec![StreamId::new(scope.as_str())])
    }

    pub fn is_group(&self, scope: &ScopeId) -> bool {
        self.group_members.contains_key(scope)
    }

    pub fn scope_watermark(&self, scope: &ScopeId, tracker: &WatermarkTracker) -> Timestamp {
        match self.group_members.get(scope) {
            Some(members) => tracker.min_watermark(members),
            None => tracker.watermark(&StreamId::new(scope.as_str())),
        }
    }

    fn window_config(&self, scope: &ScopeId) -> &WindowConfig {
        self.config.window_for(scope.as_str())
    }

    fn policy(&self, scope: &ScopeId) -> LateDataPolicy {
        self.config.policy_for(scope.as_str())
    }

    fn shard(&self, scope: &ScopeId) -> &Mutex<Shard> {
        &self.shards[shard_for(scope.as_str(), self.shards.len())]
    }

    fn task(&self, scope: &ScopeId, state: &WindowState) -> ClosedWindow {
        ClosedWindow {
            key: WindowKey::new(scope.clone(), state.bounds.start),
            bounds: state.bounds,
            kind: state.kind,
            sources: self.sources(scope),
        }
    }

    // -------------------------------------------------------------------------
    // Assignment
    // -------------------------------------------------------------------------

    /// Add a stored sample to every window of every scope it belongs to.
    pub fn assign(&self, sample: &SampleKey, tracker: &WatermarkTracker) -> Assignment {
        let mut out = Assignment::default();

        for scope in self.scopes_for(&sample.stream_id) {
            let config = self.window_config(&scope);
            let policy = self.policy(&scope);

            let mut shard = self.shard(&scope).lock();
            // Read under the shard lock so closure decisions are serialized
            // with on_watermark for this scope.
            let watermark = self.scope_watermark(&scope, tracker);
            let windows = shard.scopes.entry(scope.clone()).or_default();

            match config.kind {
                WindowKind::Session => self.assign_session(
                    &scope, windows, sample, watermark, config, policy, &mut out,
                ),
                WindowKind::Fixed | WindowKind::Sliding => self.assign_tiled(
                    &scope, windows, sample, watermark, config, policy, &mut out,
                ),
            }
        }

        for event in &out.late {
            tracing::warn!(
                sample = %event.sample,
                scope = %event.scope,
                window = %event.window,
                disposition = ?event.disposition,
                "late sample"
            );
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn assign_tiled(
        &self,
        scope: &ScopeId,
        windows: &mut ScopeWindows,
        sample: &SampleKey,
        watermark: Timestamp,
        config: &WindowConfig,
        policy: LateDataPolicy,
        out: &mut Assignment,
    ) {
        for bounds in window_bounds(sample.timestamp, config.size_micros(), config.stride_micros()) {
            let late = match windows.windows.get_mut(&bounds.start) {
                Some(state) if state.phase == WindowPhase::Open => {
                    state.samples.insert(sample.clone());
                    false
                }
                // Closed by the watermark or administratively.
                Some(_) => true,
                None if bounds.end <= watermark => true,
                None => {
                    let mut state = WindowState::new(bounds, config.kind, WindowPhase::Open);
                    state.samples.insert(sample.clone());
                    windows.windows.insert(bounds.start, state);
                    false
                }
            };

            if late {
                self.handle_late(scope, windows, bounds, config.kind, true, sample, watermark, policy, out);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assign_session(
        &self,
        scope: &ScopeId,
        windows: &mut ScopeWindows,
        sample: &SampleKey,
        watermark: Timestamp,
        config: &WindowConfig,
        policy: LateDataPolicy,
        out: &mut Assignment,
    ) {
        let ts = sample.timestamp;
        let gap = config.gap_micros();

        let joining: Vec<Timestamp> = windows
            .windows
            .iter()
            .filter(|(_, s)| {
                s.phase == WindowPhase::Open
                    && s.bounds.start.saturating_sub_micros(gap) <= ts
                    && ts < s.bounds.end
            })
            .map(|(start, _)| *start)
            .collect();

        if !joining.is_empty() {
            // Join, merging every session the sample bridges.
            let mut bounds = WindowBounds::new(ts, ts.saturating_add_micros(gap));
            let mut samples = BTreeSet::new();
            for start in joining {
                if let Some(state) = windows.windows.remove(&start) {
                    bounds.start = bounds.start.min(state.bounds.start);
                    bounds.end = bounds.end.max(state.bounds.end);
                    samples.extend(state.samples);
                }
            }
            samples.insert(sample.clone());
            let mut state = WindowState::new(bounds, WindowKind::Session, WindowPhase::Open);
            state.samples = samples;
            windows.windows.insert(bounds.start, state);
            return;
        }

        let known = windows
            .windows
            .values()
            .find(|s| s.phase != WindowPhase::Open && s.bounds.contains(ts))
            .map(|s| s.bounds)
            .or_else(|| windows.history.iter().find(|b| b.contains(ts)).copied());

        let fresh = WindowBounds::new(ts, ts.saturating_add_micros(gap));
        match known {
            Some(bounds) => self.handle_late(
                scope, windows, bounds, WindowKind::Session, true, sample, watermark, policy, out,
            ),
            None if fresh.end <= watermark => self.handle_late(
                scope, windows, fresh, WindowKind::Session, false, sample, watermark, policy, out,
            ),
            None => {
                let mut state = WindowState::new(fresh, WindowKind::Session, WindowPhase::Open);
                state.samples.insert(sample.clone());
                windows.windows.insert(fresh.start, state);
            }
        }
    }

    /// Apply the late-data policy. `recomputable` is false for late session
    /// samples outside every known session.
    #[allow(clippy::too_many_arguments)]
    fn handle_late(
        &self,
        scope: &ScopeId,
        windows: &mut ScopeWindows,
        bounds: WindowBounds,
        kind: WindowKind,
        recomputable: bool,
        sample: &SampleKey,
        watermark: Timestamp,
        policy: LateDataPolicy,
        out: &mut Assignment,
    ) {
        let disposition = match policy {
            LateDataPolicy::Drop => LateDisposition::Dropped,
            LateDataPolicy::SideOutput => LateDisposition::SideOutput,
            LateDataPolicy::Recompute if !recomputable => LateDisposition::Dropped,
            LateDataPolicy::Recompute => {
                let state = windows
                    .windows
                    .entry(bounds.start)
                    .or_insert_with(|| WindowState::new(bounds, kind, WindowPhase::Closed));
                state.samples.insert(sample.clone());
                if state.in_flight {
                    state.recompute = true;
                } else {
                    state.in_flight = true;
                    state.phase = WindowPhase::Closed;
                    out.tasks.push(self.task(scope, state));
                }
                LateDisposition::Recomputing
            }
        };

        out.late.push(LateDataEvent {
            sample: sample.clone(),
            scope: scope.clone(),
            window: bounds,
            watermark,
            policy,
            disposition,
        });
    }

    // -------------------------------------------------------------------------
    // Closure
    // -------------------------------------------------------------------------

    /// Close every open window of the stream's scopes that the current
    /// watermark has passed. Each window is handed out exactly once.
    pub fn on_watermark(&self, stream: &StreamId, tracker: &WatermarkTracker) -> Vec<ClosedWindow> {
        let mut closed = Vec::new();
        for scope in self.scopes_for(stream) {
            closed.extend(self.close_expired(&scope, tracker));
        }
        if !closed.is_empty() {
            tracing::debug!(stream = %stream, windows = closed.len(), "windows closed by watermark");
        }
        closed
    }

    /// Close expired windows of a single scope.
    pub fn close_expired(&self, scope: &ScopeId, tracker: &WatermarkTracker) -> Vec<ClosedWindow> {
        let mut shard = self.shard(scope).lock();
        let watermark = self.scope_watermark(scope, tracker);
        let Some(windows) = shard.scopes.get_mut(scope) else {
            return Vec::new();
        };

        let mut closed = Vec::new();
        for state in windows.windows.values_mut() {
            if state.phase == WindowPhase::Open && state.bounds.end <= watermark {
                state.phase = WindowPhase::Closing;
                state.in_flight = true;
                closed.push(self.task(scope, state));
            }
        }
        closed
    }

    /// CLOSING -> CLOSED once the evaluation task is enqueued.
    pub fn mark_closed(&self, key: &WindowKey) -> Result<()> {
        self.with_window(key, |state| {
            if state.phase == WindowPhase::Closing {
                state.phase = WindowPhase::Closed;
            }
        })
    }

    /// Finish an evaluation. Retires the window unless a recompute was
    /// requested while it ran.
    pub fn complete(&self, key: &WindowKey) -> Result<Completion> {
        let history_limit = self.window_config(&key.scope).session_history;
        let mut shard = self.shard(&key.scope).lock();
        let windows = shard
            .scopes
            .get_mut(&key.scope)
            .ok_or_else(|| PimapError::WindowNotFound(key.to_string()))?;
        let state = windows
            .windows
            .get_mut(&key.start)
            .ok_or_else(|| PimapError::WindowNotFound(key.to_string()))?;

        if state.recompute {
            state.recompute = false;
            state.phase = WindowPhase::Closed;
            return Ok(Completion::Requeue(self.task(&key.scope, state)));
        }

        let bounds = state.bounds;
        let kind = state.kind;
        windows.windows.remove(&key.start);

        if kind == WindowKind::Session && history_limit > 0 && !windows.history.contains(&bounds) {
            windows.history.push_back(bounds);
            while windows.history.len() > history_limit {
                windows.history.pop_front();
            }
        }
        if windows.windows.is_empty() && windows.history.is_empty() {
            shard.scopes.remove(&key.scope);
        }

        Ok(Completion::Retired(bounds))
    }

    /// Evaluation abandoned (cancelled or not enqueued). The window stays
    /// CLOSED and is returned by `pending`.
    pub fn release(&self, key: &WindowKey) -> Result<()> {
        self.with_window(key, |state| {
            state.in_flight = false;
            state.recompute = false;
            if state.phase == WindowPhase::Closing {
                state.phase = WindowPhase::Closed;
            }
        })
    }

    /// Close a window regardless of the watermark. Returns the evaluation
    /// task if the window was still open.
    pub fn force_close(&self, scope: &ScopeId, start: Timestamp) -> Result<Option<ClosedWindow>> {
        let key = WindowKey::new(scope.clone(), start);
        let mut shard = self.shard(scope).lock();
        let state = shard
            .scopes
            .get_mut(scope)
            .and_then(|w| w.windows.get_mut(&start))
            .ok_or_else(|| PimapError::WindowNotFound(key.to_string()))?;

        if state.phase != WindowPhase::Open {
            return Ok(None);
        }
        state.phase = WindowPhase::Closing;
        state.in_flight = true;
        Ok(Some(self.task(scope, state)))
    }

    /// Close every open window of a scope.
    pub fn force_close_scope(&self, scope: &ScopeId) -> Result<Vec<ClosedWindow>> {
        let mut shard = self.shard(scope).lock();
        let windows = shard
            .scopes
            .get_mut(scope)
            .filter(|w| !w.windows.is_empty())
            .ok_or_else(|| PimapError::WindowNotFound(scope.to_string()))?;

        let mut closed = Vec::new();
        for state in windows.windows.values_mut() {
            if state.phase == WindowPhase::Open {
                state.phase = WindowPhase::Closing;
                state.in_flight = true;
                closed.push(self.task(scope, state));
            }
        }
        Ok(closed)
    }

    /// Claim every CLOSED window without an evaluation in flight.
    pub fn pending(&self) -> Vec<ClosedWindow> {
        let mut tasks = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            for (scope, windows) in shard.scopes.iter_mut() {
                for state in windows.windows.values_mut() {
                    if state.phase == WindowPhase::Closed && !state.in_flight {
                        state.in_flight = true;
                        tasks.push(self.task(scope, state));
                    }
                }
            }
        }
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        tasks
    }

    fn with_window<T>(&self, key: &WindowKey, f: impl FnOnce(&mut WindowState) -> T) -> Result<T> {
        let mut shard = self.shard(&key.scope).lock();
        shard
            .scopes
            .get_mut(&key.scope)
            .and_then(|w| w.windows.get_mut(&key.start))
            .map(f)
            .ok_or_else(|| PimapError::WindowNotFound(key.to_string()))
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Lifecycle phase of a window; `Retired` once evicted from a known scope.
    pub fn phase(&self, key: &WindowKey) -> Option<WindowPhase> {
        let shard = self.shard(&key.scope).lock();
        shard.scopes.get(&key.scope).map(|w| {
            w.windows
                .get(&key.start)
                .map_or(WindowPhase::Retired, |s| s.phase)
        })
    }

    /// Sample references held by a window.
    pub fn samples(&self, key: &WindowKey) -> Vec<SampleKey> {
        let shard = self.shard(&key.scope).lock();
        shard
            .scopes
            .get(&key.scope)
            .and_then(|w| w.windows.get(&key.start))
            .map(|s| s.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Live windows of a scope, ordered by start.
    pub fn windows(&self, scope: &ScopeId) -> Vec<(WindowBounds, WindowPhase)> {
        let shard = self.shard(scope).lock();
        shard
            .scopes
            .get(scope)
            .map(|w| w.windows.values().map(|s| (s.bounds, s.phase)).collect())
            .unwrap_or_default()
    }

    pub fn counts(&self) -> WindowCounts {
        let mut counts = WindowCounts::default();
        for shard in &self.shards {
            let shard = shard.lock();
            counts.scopes += shard.scopes.len();
            for state in shard.scopes.values().flat_map(|w| w.windows.values()) {
                match state.phase {
                    WindowPhase::Open => counts.open += 1,
                    WindowPhase::Closing => counts.closing += 1,
                    WindowPhase::Closed => counts.closed += 1,
                    WindowPhase::Retired => {}
                }
                if state.in_flight {
                    counts.in_flight += 1;
                }
            }
        }
        counts
    }

    // -------------------------------------------------------------------------
    // Checkpointing
    // -------------------------------------------------------------------------

    /// Capture every live window. In-flight windows are recorded as CLOSED
    /// so they are evaluated again after a restore.
    pub fn snapshot(&self) -> WindowIndexSnapshot {
        let mut scopes = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for (scope, windows) in &shard.scopes {
                scopes.push(ScopeSnapshot {
                    scope: scope.clone(),
                    windows: windows
                        .windows
                        .values()
                        .map(|s| WindowSnapshot {
                            bounds: s.bounds,
                            kind: s.kind,
                            phase: match s.phase {
                                WindowPhase::Open => WindowPhase::Open,
                                _ => WindowPhase::Closed,
                            },
                            samples: s.samples.iter().cloned().collect(),
                        })
                        .collect(),
                    session_history: windows.history.iter().copied().collect(),
                });
            }
        }
        scopes.sort_by(|a, b| a.scope.cmp(&b.scope));
        WindowIndexSnapshot { scopes }
    }

    /// Load a snapshot into the index. Returns the number of windows restored.
    pub fn restore(&self, snapshot: WindowIndexSnapshot) -> usize {
        let mut restored = 0;
        for scope_snapshot in snapshot.scopes {
            let mut shard = self.shard(&scope_snapshot.scope).lock();
            let windows = shard.scopes.entry(scope_snapshot.scope).or_default();
            for window in scope_snapshot.windows {
                if window.phase == WindowPhase::Retired {
                    continue;
                }
                let phase = match window.phase {
                    WindowPhase::Open => WindowPhase::Open,
                    _ => WindowPhase::Closed,
                };
                let mut state = WindowState::new(window.bounds, window.kind, phase);
                state.samples = window.samples.into_iter().collect();
                windows.windows.insert(window.bounds.start, state);
                restored += 1;
            }
            for bounds in scope_snapshot.session_history {
                if !windows.history.contains(&bounds) {
                    windows.history.push_back(bounds);
                }
            }
        }
        restored
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pimap_common::config::{GroupConfig, StreamOverride};

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn key(stream: &str, ms: i64) -> SampleKey {
        SampleKey::new(stream, ts(ms), 0)
    }

    /// Store-free ingest step: advance, assign, close.
    fn ingest(
        manager: &WindowManager,
        tracker: &WatermarkTracker,
        stream: &str,
        ms: i64,
    ) -> (Assignment, Vec<ClosedWindow>) {
        let sample = key(stream, ms);
        tracker.advance(&sample.stream_id, sample.timestamp);
        let assignment = manager.assign(&sample, tracker);
        let closed = manager.on_watermark(&sample.stream_id, tracker);
        for task in &closed {
            manager.mark_closed(&task.key).unwrap();
        }
        (assignment, closed)
    }

    #[test]
    fn test_window_bounds_fixed() {
        let size = 1_000_000;
        assert_eq!(
            window_bounds(ts(999), size, size),
            vec![WindowBounds::new(ts(0), ts(1_000))]
        );
        assert_eq!(
            window_bounds(ts(1_000), size, size),
            vec![WindowBounds::new(ts(1_000), ts(2_000))]
        );
        assert_eq!(
            window_bounds(ts(-1), size, size),
            vec![WindowBounds::new(ts(-1_000), ts(0))]
        );
    }

    #[test]
    fn test_window_bounds_sliding() {
        let bounds = window_bounds(ts(7), 10_000, 5_000);
        assert_eq!(
            bounds,
            vec![
                WindowBounds::new(ts(0), ts(10)),
                WindowBounds::new(ts(5), ts(15)),
            ]
        );
        // Stride larger than size leaves gaps.
        assert!(window_bounds(ts(7), 5_000, 10_000).is_empty());
        assert!(window_bounds(ts(7), 0, 10_000).is_empty());
    }

    #[test]
    fn test_fixed_window_closes_at_watermark() {
        let config = PipelineConfig::default();
        let manager = WindowManager::new(&config);
        let tracker = WatermarkTracker::new(0);

        for ms in [0, 200, 400, 600, 800, 999] {
            let (_, closed) = ingest(&manager, &tracker, "wrist_accel", ms);
            assert!(closed.is_empty());
        }
        let window = WindowKey::new("wrist_accel", ts(0));
        assert_eq!(manager.phase(&window), Some(WindowPhase::Open));
        assert_eq!(manager.samples(&window).len(), 6);

        let (_, closed) = ingest(&manager, &tracker, "wrist_accel", 1_000);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].bounds, WindowBounds::new(ts(0), ts(1_000)));
        assert_eq!(closed[0].sources, vec![StreamId::new("wrist_accel")]);
        assert_eq!(manager.phase(&window), Some(WindowPhase::Closed));

        // Closing happens exactly once.
        assert!(manager.on_watermark(&StreamId::new("wrist_accel"), &tracker).is_empty());

        assert_eq!(
            manager.complete(&window).unwrap(),
            Completion::Retired(WindowBounds::new(ts(0), ts(1_000)))
        );
        assert_eq!(manager.phase(&window), Some(WindowPhase::Retired));
    }

    #[test]
    fn test_late_sample_recompute_after_retire() {
        let manager = WindowManager::new(&PipelineConfig::default());
        let tracker = WatermarkTracker::new(0);
        ingest(&manager, &tracker, "s1", 100);
        let (_, closed) = ingest(&manager, &tracker, "s1", 1_200);
        manager.complete(&closed[0].key).unwrap();

        let (assignment, _) = ingest(&manager, &tracker, "s1", 500);
        assert_eq!(assignment.late.len(), 1);
        assert_eq!(assignment.late[0].disposition, LateDisposition::Recomputing);
        assert_eq!(assignment.tasks.len(), 1);
        assert_eq!(assignment.tasks[0].bounds, WindowBounds::new(ts(0), ts(1_000)));
        assert_eq!(manager.phase(&closed[0].key), Some(WindowPhase::Closed));
    }

    #[test]
    fn test_late_sample_while_in_flight_requeues_once() {
        let manager = WindowManager::new(&PipelineConfig::default());
        let tracker = WatermarkTracker::new(0);
        ingest(&manager, &tracker, "s1", 100);
        let (_, closed) = ingest(&manager, &tracker, "s1", 1_200);
        let window = closed[0].key.clone();

        // Two late samples during the evaluation: no extra tasks.
        let (first, _) = ingest(&manager, &tracker, "s1", 500);
        let (second, _) = ingest(&manager, &tracker, "s1", 600);
        assert!(first.tasks.is_empty() && second.tasks.is_empty());
        assert_eq!(first.late[0].disposition, LateDisposition::Recomputing);

        match manager.complete(&window).unwrap() {
            Completion::Requeue(task) => assert_eq!(task.key, window),
            other => panic!("expected requeue, got {:?}", other),
        }
        assert!(matches!(manager.complete(&window).unwrap(), Completion::Retired(_)));
    }

    #[test]
    fn test_late_policies_drop_and_side_output() {
        let mut config = PipelineConfig::default();
        config.streams.insert(
            "dropped".into(),
            StreamOverride {
                late_data_policy: Some(LateDataPolicy::Drop),
                ..Default::default()
            },
        );
        config.streams.insert(
            "routed".into(),
            StreamOverride {
                late_data_policy: Some(LateDataPolicy::SideOutput),
                ..Default::default()
            },
        );
        let manager = WindowManager::new(&config);
        let tracker = WatermarkTracker::new(0);

        for stream in ["dropped", "routed"] {
            ingest(&manager, &tracker, stream, 100);
            let (_, closed) = ingest(&manager, &tracker, stream, 1_500);
            manager.complete(&closed[0].key).unwrap();
        }

        let (dropped, _) = ingest(&manager, &tracker, "dropped", 10);
        assert_eq!(dropped.late[0].disposition, LateDisposition::Dropped);
        assert!(dropped.tasks.is_empty());

        let (routed, _) = ingest(&manager, &tracker, "routed", 10);
        assert_eq!(routed.late[0].disposition, LateDisposition::SideOutput);
        assert_eq!(routed.late[0].watermark, ts(1_500));
        assert!(routed.tasks.is_empty());
        assert_eq!(
            manager.phase(&WindowKey::new("routed", ts(0))),
            Some(WindowPhase::Retired)
        );
    }

    #[test]
    fn test_sliding_windows() {
        let mut config = PipelineConfig::default();
        config.window = WindowConfig::sliding(1_000, 500);
        let manager = WindowManager::new(&config);
        let tracker = WatermarkTracker::new(0);

        ingest(&manager, &tracker, "s", 700);
        let windows = manager.windows(&ScopeId::new("s"));
        assert_eq!(
            windows.iter().map(|(b, _)| *b).collect::<Vec<_>>(),
            vec![
                WindowBounds::new(ts(0), ts(1_000)),
                WindowBounds::new(ts(500), ts(1_500)),
            ]
        );

        let (_, closed) = ingest(&manager, &tracker, "s", 1_000);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].kind, WindowKind::Sliding);
        assert_eq!(closed[0].bounds.start, ts(0));
    }

    #[test]
    fn test_session_windows_merge() {
        let mut config = PipelineConfig::default();
        config.window = WindowConfig::session(100);
        config.watermark.allowed_lateness_ms = 1_000;
        let manager = WindowManager::new(&config);
        let tracker = WatermarkTracker::from_config(&config);

        ingest(&manager, &tracker, "s", 0);
        ingest(&manager, &tracker, "s", 150);
        assert_eq!(manager.windows(&ScopeId::new("s")).len(), 2);

        // 90 is within [0,100) and within 150 - gap: bridges both sessions.
        ingest(&manager, &tracker, "s", 90);
        let windows = manager.windows(&ScopeId::new("s"));
        assert_eq!(windows, vec![(WindowBounds::new(ts(0), ts(250)), WindowPhase::Open)]);
        assert_eq!(manager.samples(&WindowKey::new("s", ts(0))).len(), 3);

        let (_, closed) = ingest(&manager, &tracker, "s", 1_250);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].bounds, WindowBounds::new(ts(0), ts(250)));
    }

    #[test]
    fn test_session_late_samples() {
        let mut config = PipelineConfig::default();
        config.window = WindowConfig::session(100);
        let manager = WindowManager::new(&config);
        let tracker = WatermarkTracker::new(0);

        ingest(&manager, &tracker, "s", 0);
        ingest(&manager, &tracker, "s", 50);
        let (_, closed) = ingest(&manager, &tracker, "s", 1_000);
        assert_eq!(closed[0].bounds, WindowBounds::new(ts(0), ts(150)));
        manager.complete(&closed[0].key).unwrap();

        // Inside a retired session: recomputed with the known bounds.
        let (inside, _) = ingest(&manager, &tracker, "s", 120);
        assert_eq!(inside.late[0].disposition, LateDisposition::Recomputing);
        assert_eq!(inside.tasks[0].bounds, WindowBounds::new(ts(0), ts(150)));

        // Outside every known session: reported as dropped.
        let (outside, _) = ingest(&manager, &tracker, "s", 500);
        assert_eq!(outside.late[0].disposition, LateDisposition::Dropped);
        assert!(outside.tasks.is_empty());
    }

    #[test]
    fn test_group_scope_uses_min_watermark() {
        let mut config = PipelineConfig::default();
        config.groups.push(GroupConfig {
            id: "ward".into(),
            members: vec!["a".into(), "b".into()],
            window: None,
            late_data_policy: None,
        });
        let manager = WindowManager::new(&config);
        let tracker = WatermarkTracker::new(0);

        ingest(&manager, &tracker, "a", 100);
        ingest(&manager, &tracker, "b", 200);
        let (_, closed) = ingest(&manager, &tracker, "a", 1_100);
        // Stream "a" closes; the group waits for "b".
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].key.scope, ScopeId::new("a"));

        let (_, closed) = ingest(&manager, &tracker, "b", 1_050);
        let scopes: Vec<&str> = closed.iter().map(|t| t.key.scope.as_str()).collect();
        assert_eq!(scopes, vec!["b", "ward"]);
        let group_task = &closed[1];
        assert_eq!(group_task.sources, vec![StreamId::new("a"), StreamId::new("b")]);
        assert_eq!(manager.samples(&group_task.key).len(), 2);
    }

    #[test]
    fn test_force_close() {
        let manager = WindowManager::new(&PipelineConfig::default());
        let tracker = WatermarkTracker::new(0);
        ingest(&manager, &tracker, "s", 100);
        ingest(&manager, &tracker, "s", 1_100);

        let scope = ScopeId::new("s");
        assert!(matches!(
            manager.force_close(&scope, ts(5_000)),
            Err(PimapError::WindowNotFound(_))
        ));

        let task = manager.force_close(&scope, ts(1_000)).unwrap().unwrap();
        assert_eq!(task.bounds, WindowBounds::new(ts(1_000), ts(2_000)));
        assert_eq!(manager.force_close(&scope, ts(1_000)).unwrap(), None);
        assert!(manager.force_close_scope(&ScopeId::new("unknown")).is_err());
    }

    #[test]
    fn test_release_and_pending() {
        let manager = WindowManager::new(&PipelineConfig::default());
        let tracker = WatermarkTracker::new(0);
        ingest(&manager, &tracker, "s", 100);
        let (_, closed) = ingest(&manager, &tracker, "s", 1_100);

        assert!(manager.pending().is_empty());
        manager.release(&closed[0].key).unwrap();
        let pending = manager.pending();
        assert_eq!(pending, closed);
        assert!(manager.pending().is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let config = PipelineConfig::default();
        let manager = WindowManager::new(&config);
        let tracker = WatermarkTracker::new(0);
        ingest(&manager, &tracker, "s", 100);
        ingest(&manager, &tracker, "s", 1_100);

        let json = serde_json::to_string(&manager.snapshot()).unwrap();
        let snapshot: WindowIndexSnapshot = serde_json::from_str(&json).unwrap();

        let restored = WindowManager::new(&config);
        assert_eq!(restored.restore(snapshot), 2);
        assert_eq!(
            restored.phase(&WindowKey::new("s", ts(0))),
            Some(WindowPhase::Closed)
        );
        assert_eq!(
            restored.phase(&WindowKey::new("s", ts(1_000))),
            Some(WindowPhase::Open)
        );
        let pending = restored.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].bounds.start, ts(0));
        assert_eq!(restored.samples(&pending[0].key), vec![key("s", 100)]);
    }

    #[test]
    fn test_concurrent_close_hands_out_once() {
        let manager = std::sync::Arc::new(WindowManager::new(&PipelineConfig::default()));
        let tracker = std::sync::Arc::new(WatermarkTracker::new(0));
        ingest(&manager, &tracker, "s", 100);
        tracker.advance(&StreamId::new("s"), ts(5_000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = std::sync::Arc::clone(&manager);
                let tracker = std::sync::Arc::clone(&tracker);
                std::thread::spawn(move || manager.on_watermark(&StreamId::new("s"), &tracker).len())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }
}
