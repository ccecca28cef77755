//! PIMAP Side Output Channel
//!
//! Broadcast channel carrying late-data events routed by the `side-output`
//! policy, with a bounded replay history for subscribers that attach late.
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::event::LateDataEvent;
use parking_lot::RwLock;
use pimap_common::config::SideOutputConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;

// =============================================================================
// Side Output
// =============================================================================

/// Pub/sub channel for late samples.
pub struct SideOutput {
    sender: broadcast::Sender<LateDataEvent>,
    history: RwLock<VecDeque<LateDataEvent>>,
    retention: usize,
    stats: RwLock<SideOutputStats>,
}

impl SideOutput {
    pub fn new() -> Self {
        Self::with_config(&SideOutputConfig::default())
    }

    pub fn with_config(config: &SideOutputConfig) -> Self {
        let (sender, _) = broadcast::channel(config.buffer_size.max(1));
        Self {
            sender,
            history: RwLock::new(VecDeque::new()),
            retention: config.retention,
            stats: RwLock::new(SideOutputStats::default()),
        }
    }

    /// Publish an event; returns the number of live receivers.
    pub fn publish(&self, event: LateDataEvent) -> usize {
        if self.retention > 0 {
            let mut history = self.history.write();
            history.push_back(event.clone());
            while history.len() > self.retention {
                history.pop_front();
            }
        }

        // No receivers is not an error: history still holds the event.
        let receivers = self.sender.send(event).unwrap_or(0);

        let mut stats = self.stats.write();
        stats.events_published += 1;
        stats.subscriber_count = self.sender.receiver_count();

        receivers
    }

    pub fn subscribe(&self) -> SideOutputReceiver {
        let receiver = self.sender.subscribe();
        self.stats.write().subscriber_count = self.sender.receiver_count();
        SideOutputReceiver { receiver }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Most recent events, newest first.
    pub fn history(&self, count: usize) -> Vec<LateDataEvent> {
        self.history.read().iter().rev().take(count).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.write().clear();
    }

    pub fn stats(&self) -> SideOutputStats {
        self.stats.read().clone()
    }
}

impl Default for SideOutput {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Side Output Receiver
// =============================================================================

/// Receiver for late-data events.
pub struct SideOutputReceiver {
    receiver: broadcast::Receiver<LateDataEvent>,
}

impl SideOutputReceiver {
    /// Receive the next event.
    pub async fn recv(&mut self) -> Result<LateDataEvent, ChannelError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Closed) => Err(ChannelError::Closed),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(ChannelError::Lagged(n)),
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Result<Option<LateDataEvent>, ChannelError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(ChannelError::Closed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(ChannelError::Lagged(n)),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideOutputStats {
    pub events_published: u64,
    pub subscriber_count: usize,
}

// =============================================================================
// Channel Error
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    Closed,
    Lagged(u64),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Side output is closed"),
            Self::Lagged(n) => write!(f, "Receiver lagged by {} events", n),
        }
    }
}

impl std::error::Error for ChannelError {}

// =============================================================================
// Tests
// =============================================================================
