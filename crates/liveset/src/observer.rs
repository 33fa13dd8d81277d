//! Parameter change observation: subscription, debounce, windowed history.
//!
//! The DAW streams values at high rate while a knob is in motion. Each
//! notification (re)schedules a deferred commit; only after a quiet period
//! of one debounce interval does the observer write a single
//! [`ParameterChange`] carrying the last committed value as `old` and the
//! latest notified value as `new`. Coalescing always keeps the latest
//! value, never an average.
//!
//! Subscribing a parameter makes the DAW emit one synthetic notification
//! with the current value; the observation's `initial` flag absorbs it.
//!
//! The history window is a read-time filter: `recent_changes` evicts
//! entries older than the window and returns what remains, so a read at
//! time T sees exactly the commits in `(T - W, T]`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use oscwire::{OscMessage, OscValue};

use crate::bridge::{addresses, BridgeError, LiveBridge};
use crate::types::{MixerSnapshot, ParamKey, ParameterChange};

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Quiet period before a burst of notifications commits as one change.
    pub debounce: Duration,
    /// Retention window for the change history.
    pub history_window: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            history_window: Duration::from_secs(30 * 60),
        }
    }
}

/// Denormalized naming captured at subscribe time so commits never need the
/// snapshot.
struct ObservationMeta {
    track_name: String,
    device_name: String,
    param_name: String,
    min: f32,
    max: f32,
}

/// Per-parameter observation state.
struct Observation {
    meta: ObservationMeta,
    /// Last committed value (snapshot-initial until the first commit).
    value: f32,
    /// True until the synthetic post-subscribe notification is absorbed.
    initial: bool,
    /// Generation of the pending deferred commit; a commit whose
    /// generation no longer matches was superseded and must not fire.
    pending_gen: u64,
    pending: Option<JoinHandle<()>>,
}

struct Inner {
    bridge: Arc<LiveBridge>,
    config: ObserverConfig,
    observations: Mutex<HashMap<ParamKey, Observation>>,
    history: Mutex<VecDeque<ParameterChange>>,
    changes_tx: mpsc::UnboundedSender<ParameterChange>,
}

/// One observer per session. Holds the observation set for the current
/// snapshot and the session's change history.
pub struct ParameterObserver {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl ParameterObserver {
    /// Create the observer and start consuming push notifications from the
    /// transport. Committed changes are sent on `changes_tx`.
    pub fn new(
        bridge: Arc<LiveBridge>,
        config: ObserverConfig,
        changes_tx: mpsc::UnboundedSender<ParameterChange>,
    ) -> Self {
        let rx = bridge
            .query()
            .transport()
            .subscribe(addresses::PARAM_VALUE_PUSH);
        let inner = Arc::new(Inner {
            bridge,
            config,
            observations: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            changes_tx,
        });
        let pump = tokio::spawn(pump(inner.clone(), rx));
        Self { inner, pump }
    }

    /// Replace the observation set with one covering `snapshot`.
    ///
    /// Runs on attach and on every reindex: the outgoing set is
    /// unsubscribed (best-effort), fresh observations are installed with
    /// their `initial` flags armed, and `start_listen` is sent for every
    /// parameter. History is retained across the swap.
    pub async fn resubscribe(&self, snapshot: &MixerSnapshot) -> Result<(), BridgeError> {
        let old_keys: Vec<ParamKey> = {
            let map = self.inner.observations.lock().unwrap();
            map.keys().copied().collect()
        };
        for key in &old_keys {
            if let Err(e) = self
                .inner
                .bridge
                .stop_listen(key.track, key.device, key.param)
                .await
            {
                warn!(%key, error = %e, "stop_listen failed during resubscribe");
            }
        }

        let mut fresh = HashMap::with_capacity(snapshot.parameter_count());
        for track in &snapshot.tracks {
            for device in &track.devices {
                for param in &device.parameters {
                    let key = ParamKey {
                        track: track.id,
                        device: device.id,
                        param: param.id,
                    };
                    fresh.insert(
                        key,
                        Observation {
                            meta: ObservationMeta {
                                track_name: track.name.clone(),
                                device_name: device.name.clone(),
                                param_name: param.name.clone(),
                                min: param.min,
                                max: param.max,
                            },
                            value: param.value,
                            initial: true,
                            pending_gen: 0,
                            pending: None,
                        },
                    );
                }
            }
        }

        let keys: Vec<ParamKey> = fresh.keys().copied().collect();
        {
            let mut map = self.inner.observations.lock().unwrap();
            for (_, obs) in map.drain() {
                if let Some(handle) = obs.pending {
                    handle.abort();
                }
            }
            *map = fresh;
        }

        for key in &keys {
            self.inner
                .bridge
                .start_listen(key.track, key.device, key.param)
                .await?;
        }

        debug!(parameters = keys.len(), "observer resubscribed");
        Ok(())
    }

    /// Tear down the observation set (detach or shutdown). `stop_listen`
    /// failures are logged, not surfaced. History is retained.
    pub async fn unsubscribe_all(&self) {
        let drained: Vec<(ParamKey, Observation)> = {
            let mut map = self.inner.observations.lock().unwrap();
            map.drain().collect()
        };
        for (key, obs) in drained {
            if let Some(handle) = obs.pending {
                handle.abort();
            }
            if let Err(e) = self
                .inner
                .bridge
                .stop_listen(key.track, key.device, key.param)
                .await
            {
                warn!(%key, error = %e, "stop_listen failed during unsubscribe");
            }
        }
    }

    /// Changes committed within the trailing window, oldest first. Evicts
    /// aged-out entries as a side effect.
    pub fn recent_changes(&self) -> Vec<ParameterChange> {
        let window = self.inner.config.history_window;
        let mut history = self.inner.history.lock().unwrap();
        while history
            .front()
            .is_some_and(|change| change.at.elapsed() >= window)
        {
            history.pop_front();
        }
        history.iter().cloned().collect()
    }

    pub fn observed_count(&self) -> usize {
        self.inner.observations.lock().unwrap().len()
    }

    /// Feed one notification through the debounce machinery. The pump task
    /// calls this for every inbound push message.
    fn ingest(&self, key: ParamKey, value: f32) {
        ingest(&self.inner, key, value);
    }

    pub fn shutdown(&self) {
        self.pump.abort();
    }
}

impl Drop for ParameterObserver {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<OscMessage>) {
    while let Some(msg) = rx.recv().await {
        match parse_push(&msg) {
            Some((key, value)) => ingest(&inner, key, value),
            None => warn!(args = ?msg.args, "malformed parameter notification"),
        }
    }
}

fn parse_push(msg: &OscMessage) -> Option<(ParamKey, f32)> {
    let track = msg.args.first()?.as_i32()?;
    let device = msg.args.get(1)?.as_i32()?;
    let param = msg.args.get(2)?.as_i32()?;
    let value = msg.args.get(3)?.as_f32()?;
    if track < 0 || device < 0 || param < 0 {
        return None;
    }
    Some((
        ParamKey {
            track: track as u32,
            device: device as u32,
            param: param as u32,
        },
        value,
    ))
}

fn ingest(inner: &Arc<Inner>, key: ParamKey, value: f32) {
    let mut map = inner.observations.lock().unwrap();
    let Some(obs) = map.get_mut(&key) else {
        // Notification for a retired snapshot; nothing to do.
        trace!(%key, "notification for unobserved parameter");
        return;
    };

    if obs.initial {
        obs.initial = false;
        return;
    }
    if obs.value == value {
        return;
    }

    obs.pending_gen += 1;
    let gen = obs.pending_gen;
    if let Some(handle) = obs.pending.take() {
        handle.abort();
    }

    let inner = inner.clone();
    let debounce = inner.config.debounce;
    obs.pending = Some(tokio::spawn(async move {
        tokio::time::sleep(debounce).await;
        commit(&inner, key, gen, value);
    }));
}

fn commit(inner: &Arc<Inner>, key: ParamKey, gen: u64, new_value: f32) {
    let change = {
        let mut map = inner.observations.lock().unwrap();
        let Some(obs) = map.get_mut(&key) else {
            return;
        };
        if obs.pending_gen != gen {
            // Superseded by a newer notification.
            return;
        }
        let change = ParameterChange {
            track_id: key.track,
            track_name: obs.meta.track_name.clone(),
            device_id: key.device,
            device_name: obs.meta.device_name.clone(),
            param_id: key.param,
            param_name: obs.meta.param_name.clone(),
            old_value: obs.value,
            new_value,
            min: obs.meta.min,
            max: obs.meta.max,
            timestamp: chrono::Utc::now().timestamp_millis(),
            at: tokio::time::Instant::now(),
        };
        obs.value = new_value;
        obs.pending = None;
        change
    };

    debug!(
        key = %key,
        old = change.old_value,
        new = change.new_value,
        "parameter change committed"
    );
    inner.history.lock().unwrap().push_back(change.clone());
    let _ = inner.changes_tx.send(change);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Device, Parameter, Track};
    use oscwire::{OscConfig, OscQuery, OscTransport};
    use tokio::net::UdpSocket;

    fn snapshot_with_param(value: f32) -> MixerSnapshot {
        MixerSnapshot {
            tracks: vec![Track {
                id: 0,
                name: "Drums".into(),
                devices: vec![Device {
                    id: 0,
                    name: "Kit".into(),
                    class_name: "DrumGroupDevice".into(),
                    parameters: vec![Parameter {
                        id: 3,
                        name: "Decay".into(),
                        value,
                        min: 0.0,
                        max: 1.0,
                        value_string: None,
                    }],
                }],
            }],
        }
    }

    const KEY: ParamKey = ParamKey {
        track: 0,
        device: 0,
        param: 3,
    };

    async fn observer_fixture(
        config: ObserverConfig,
    ) -> (
        ParameterObserver,
        mpsc::UnboundedReceiver<ParameterChange>,
        UdpSocket,
    ) {
        // The peer stands in for the DAW; listen messages land there.
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let osc = OscConfig {
            local_port: 0,
            remote_host: "127.0.0.1".into(),
            remote_port: peer.local_addr().unwrap().port(),
        };
        let transport = Arc::new(OscTransport::bind(&osc).await.unwrap());
        let query = Arc::new(OscQuery::new(transport, Duration::from_secs(2)));
        let bridge = Arc::new(LiveBridge::new(query, Duration::from_secs(5)));
        let (tx, rx) = mpsc::unbounded_channel();
        (ParameterObserver::new(bridge, config, tx), rx, peer)
    }

    fn test_config() -> ObserverConfig {
        ObserverConfig {
            debounce: Duration::from_millis(500),
            history_window: Duration::from_secs(60),
        }
    }

    /// Let spawned debounce tasks observe aborts and fired timers.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_initial_notification_is_dropped() {
        let (observer, mut rx, _peer) = observer_fixture(test_config()).await;
        observer.resubscribe(&snapshot_with_param(0.40)).await.unwrap();

        observer.ingest(KEY, 0.40);
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert!(rx.try_recv().is_err());
        assert!(observer.recent_changes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn knob_sweep_coalesces_to_one_change() {
        let (observer, mut rx, _peer) = observer_fixture(test_config()).await;
        observer.resubscribe(&snapshot_with_param(0.40)).await.unwrap();

        observer.ingest(KEY, 0.40); // synthetic
        for value in [0.50, 0.55, 0.60, 0.70] {
            observer.ingest(KEY, value);
            // Let the rescheduled debounce task register its timer before
            // the clock moves.
            settle().await;
            tokio::time::advance(Duration::from_millis(50)).await;
        }

        // 499 ms after the last notification: still quiet.
        tokio::time::advance(Duration::from_millis(449)).await;
        settle().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(2)).await;
        settle().await;

        let change = rx.try_recv().unwrap();
        assert_eq!(change.old_value, 0.40);
        assert_eq!(change.new_value, 0.70);
        assert_eq!(change.track_name, "Drums");
        assert_eq!(change.device_name, "Kit");
        assert_eq!(change.param_name, "Decay");
        assert!(rx.try_recv().is_err());
        assert_eq!(observer.recent_changes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_equal_to_committed_value_never_commit() {
        let (observer, mut rx, _peer) = observer_fixture(test_config()).await;
        observer.resubscribe(&snapshot_with_param(0.40)).await.unwrap();

        observer.ingest(KEY, 0.40); // synthetic
        observer.ingest(KEY, 0.40);
        observer.ingest(KEY, 0.40);
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        assert!(rx.try_recv().is_err());
        assert!(observer.recent_changes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn observation_tracks_last_committed_value() {
        let (observer, mut rx, _peer) = observer_fixture(test_config()).await;
        observer.resubscribe(&snapshot_with_param(0.40)).await.unwrap();
        observer.ingest(KEY, 0.40); // synthetic

        observer.ingest(KEY, 0.70);
        settle().await;
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        assert_eq!(rx.try_recv().unwrap().new_value, 0.70);

        // Equal to the committed value: dropped.
        observer.ingest(KEY, 0.70);
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(rx.try_recv().is_err());

        observer.ingest(KEY, 0.90);
        settle().await;
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        let change = rx.try_recv().unwrap();
        assert_eq!(change.old_value, 0.70);
        assert_eq!(change.new_value, 0.90);
    }

    #[tokio::test(start_paused = true)]
    async fn history_window_evicts_on_read() {
        let (observer, mut rx, _peer) = observer_fixture(test_config()).await;
        observer.resubscribe(&snapshot_with_param(0.0)).await.unwrap();
        observer.ingest(KEY, 0.0); // synthetic

        let drive_commit = |value: f32| {
            observer.ingest(KEY, value);
        };

        // Commits land at roughly t=0.5s, t=21s, t=71.5s.
        drive_commit(0.1);
        settle().await;
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(20)).await;
        drive_commit(0.2);
        settle().await;
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(50)).await;
        drive_commit(0.3);
        settle().await;
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;

        for _ in 0..3 {
            rx.try_recv().unwrap();
        }

        // At t=71.5s the first commit (t=0.5s) has aged out of the 60 s
        // window.
        let changes = observer.recent_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].new_value, 0.2);

        // 60 s later everything has aged out.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(observer.recent_changes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_then_unsubscribe_restores_empty_state() {
        let (observer, mut rx, _peer) = observer_fixture(test_config()).await;
        observer.resubscribe(&snapshot_with_param(0.40)).await.unwrap();
        assert_eq!(observer.observed_count(), 1);

        observer.unsubscribe_all().await;
        assert_eq!(observer.observed_count(), 0);

        // Late notifications for the retired set are dropped.
        observer.ingest(KEY, 0.99);
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(rx.try_recv().is_err());
        assert!(observer.recent_changes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_rearms_initial_and_keeps_history() {
        let (observer, mut rx, _peer) = observer_fixture(test_config()).await;
        observer.resubscribe(&snapshot_with_param(0.40)).await.unwrap();
        observer.ingest(KEY, 0.40); // synthetic

        observer.ingest(KEY, 0.60);
        settle().await;
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        rx.try_recv().unwrap();
        assert_eq!(observer.recent_changes().len(), 1);

        observer.resubscribe(&snapshot_with_param(0.60)).await.unwrap();

        // History survives the reindex; the synthetic notification of the
        // fresh subscription is absorbed again.
        assert_eq!(observer.recent_changes().len(), 1);
        observer.ingest(KEY, 0.60);
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn push_datagrams_flow_through_the_pump() {
        let (observer, mut rx, peer) = observer_fixture(ObserverConfig {
            debounce: Duration::from_millis(50),
            history_window: Duration::from_secs(60),
        })
        .await;
        observer.resubscribe(&snapshot_with_param(0.40)).await.unwrap();

        // The DAW side saw a start_listen for the parameter.
        let mut buf = vec![0u8; 65_536];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let listen = OscMessage::decode(&buf[..len]).unwrap();
        assert_eq!(listen.address, addresses::START_LISTEN);

        let local = observer
            .inner
            .bridge
            .query()
            .transport()
            .local_addr()
            .unwrap();
        let push = |value: f32| {
            OscMessage::new(
                addresses::PARAM_VALUE_PUSH,
                vec![
                    OscValue::Int(0),
                    OscValue::Int(0),
                    OscValue::Int(3),
                    OscValue::Float(value),
                ],
            )
        };
        peer.send_to(&push(0.40).encode(), local).await.unwrap(); // synthetic
        peer.send_to(&push(0.55).encode(), local).await.unwrap();

        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.old_value, 0.40);
        assert_eq!(change.new_value, 0.55);
    }
}
