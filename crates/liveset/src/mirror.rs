//! Atomically replaceable snapshot of the mixer tree.
//!
//! Readers clone the current `Arc` and keep a consistent view for as long
//! as they hold it; writers swap the whole snapshot. A failed reindex never
//! touches the previous snapshot.

use std::sync::{Arc, RwLock};

use crate::types::{MixerSnapshot, ParamKey, Parameter, Track};

#[derive(Default)]
pub struct MixerMirror {
    current: RwLock<Option<Arc<MixerSnapshot>>>,
}

impl MixerMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot, if an attach has completed.
    pub fn load(&self) -> Option<Arc<MixerSnapshot>> {
        self.current.read().unwrap().clone()
    }

    /// Install a freshly built snapshot. Readers holding the old `Arc`
    /// continue to see it; new reads see the replacement.
    pub fn replace(&self, snapshot: Arc<MixerSnapshot>) {
        *self.current.write().unwrap() = Some(snapshot);
    }

    /// Drop the snapshot (detach).
    pub fn clear(&self) {
        *self.current.write().unwrap() = None;
    }

    pub fn is_indexed(&self) -> bool {
        self.current.read().unwrap().is_some()
    }

    pub fn track(&self, track: u32) -> Option<Track> {
        self.load()?.track(track).cloned()
    }

    pub fn parameter(&self, key: ParamKey) -> Option<Parameter> {
        self.load()?.parameter(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Device;

    fn snapshot(name: &str) -> Arc<MixerSnapshot> {
        Arc::new(MixerSnapshot {
            tracks: vec![Track {
                id: 0,
                name: name.into(),
                devices: vec![Device {
                    id: 0,
                    name: "Op".into(),
                    class_name: "Operator".into(),
                    parameters: vec![],
                }],
            }],
        })
    }

    #[test]
    fn replace_is_atomic_for_held_readers() {
        let mirror = MixerMirror::new();
        assert!(!mirror.is_indexed());

        mirror.replace(snapshot("before"));
        let held = mirror.load().unwrap();

        mirror.replace(snapshot("after"));

        // The held view is unchanged; a fresh read sees the replacement.
        assert_eq!(held.tracks[0].name, "before");
        assert_eq!(mirror.load().unwrap().tracks[0].name, "after");
    }

    #[test]
    fn clear_detaches() {
        let mirror = MixerMirror::new();
        mirror.replace(snapshot("x"));
        mirror.clear();
        assert!(mirror.load().is_none());
        assert!(mirror.track(0).is_none());
    }
}
