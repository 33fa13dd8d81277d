//! Full index of the mixer tree: enumerate, fetch parameters, swap the
//! mirror, resubscribe the observer.
//!
//! Enumeration reports progress 0→50, the parameter/subscription phase
//! 50→100. The mirror is only replaced after the whole tree has been
//! fetched, so a failure anywhere leaves the previous snapshot (and its
//! subscriptions) untouched. Enumeration is retried once; nothing else is.

use std::sync::{Arc, Mutex};

use tracing::{info, instrument, warn};

use crate::bridge::{BridgeError, LiveBridge};
use crate::mirror::MixerMirror;
use crate::observer::ParameterObserver;
use crate::types::MixerSnapshot;

/// Progress frame for the client's `indexing_status` events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexingProgress {
    pub is_indexing: bool,
    pub progress: Option<u8>,
}

pub struct Indexer {
    bridge: Arc<LiveBridge>,
    mirror: Arc<MixerMirror>,
    observer: Arc<ParameterObserver>,
}

impl Indexer {
    pub fn new(
        bridge: Arc<LiveBridge>,
        mirror: Arc<MixerMirror>,
        observer: Arc<ParameterObserver>,
    ) -> Self {
        Self {
            bridge,
            mirror,
            observer,
        }
    }

    /// Run a full index. `status` receives monotonic progress frames with
    /// consecutive duplicates suppressed.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        status: &(dyn Fn(IndexingProgress) + Send + Sync),
    ) -> Result<Arc<MixerSnapshot>, BridgeError> {
        let last = Mutex::new(None::<u8>);
        let report = |progress: u8| {
            let mut last = last.lock().unwrap();
            if *last == Some(progress) {
                return;
            }
            *last = Some(progress);
            status(IndexingProgress {
                is_indexing: true,
                progress: Some(progress),
            });
        };

        let mut tracks = match self.bridge.enumerate_tracks(&report).await {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(error = %e, "enumerate failed, retrying once");
                self.bridge.enumerate_tracks(&report).await?
            }
        };

        let total = tracks.len().max(1) as u32;
        for (index, track) in tracks.iter_mut().enumerate() {
            for device in &mut track.devices {
                device.parameters = self.bridge.get_parameters(track.id, device.id).await?;
            }
            report(50 + (50 * (index as u32 + 1) / total) as u8);
        }

        let snapshot = Arc::new(MixerSnapshot { tracks });
        self.observer.resubscribe(&snapshot).await?;
        self.mirror.replace(snapshot.clone());

        status(IndexingProgress {
            is_indexing: false,
            progress: Some(100),
        });
        info!(
            tracks = snapshot.tracks.len(),
            parameters = snapshot.parameter_count(),
            "index complete"
        );
        Ok(snapshot)
    }
}
