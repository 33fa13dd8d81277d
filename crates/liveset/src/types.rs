//! Mixer tree data model.
//!
//! Structure (names, ranges, ordering) is immutable for the life of an
//! attach; only parameter values move. A whole [`MixerSnapshot`] is replaced
//! on reindex, never patched.

use serde::Serialize;

/// (track, device, parameter) indices, the DAW's native addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamKey {
    pub track: u32,
    pub device: u32,
    pub param: u32,
}

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.track, self.device, self.param)
    }
}

/// A single knob on a device. Values are in the DAW's native units, bounded
/// by `min..=max`; no normalization happens anywhere in the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub id: u32,
    pub name: String,
    pub value: f32,
    pub min: f32,
    pub max: f32,
    /// Textual rendering ("-12.0 dB"); only populated on paths that query
    /// it, the bulk enumeration does not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: u32,
    pub name: String,
    pub class_name: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub id: u32,
    #[serde(rename = "track_name")]
    pub name: String,
    pub devices: Vec<Device>,
}

/// The whole mixer tree as reported by the DAW at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MixerSnapshot {
    pub tracks: Vec<Track>,
}

impl MixerSnapshot {
    pub fn track(&self, track: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == track)
    }

    pub fn device(&self, track: u32, device: u32) -> Option<&Device> {
        self.track(track)?.devices.iter().find(|d| d.id == device)
    }

    pub fn parameter(&self, key: ParamKey) -> Option<&Parameter> {
        self.device(key.track, key.device)?
            .parameters
            .iter()
            .find(|p| p.id == key.param)
    }

    /// Every parameter in the tree with its key, in track/device/param
    /// order.
    pub fn parameters(&self) -> impl Iterator<Item = (ParamKey, &Parameter)> {
        self.tracks.iter().flat_map(|t| {
            t.devices.iter().flat_map(move |d| {
                d.parameters.iter().map(move |p| {
                    (
                        ParamKey {
                            track: t.id,
                            device: d.id,
                            param: p.id,
                        },
                        p,
                    )
                })
            })
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.tracks
            .iter()
            .flat_map(|t| &t.devices)
            .map(|d| d.parameters.len())
            .sum()
    }
}

/// One committed, debounced parameter mutation. Immutable once emitted.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterChange {
    pub track_id: u32,
    pub track_name: String,
    pub device_id: u32,
    pub device_name: String,
    pub param_id: u32,
    pub param_name: String,
    pub old_value: f32,
    pub new_value: f32,
    pub min: f32,
    pub max: f32,
    /// Wall-clock commit time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Monotonic commit time, used for history-window eviction.
    #[serde(skip)]
    pub at: tokio::time::Instant,
}

/// What a parameter set returned: the human-readable before/after strings.
#[derive(Debug, Clone, Serialize)]
pub struct SetParameterOutcome {
    pub device: String,
    pub param: String,
    pub from: String,
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MixerSnapshot {
        MixerSnapshot {
            tracks: vec![
                Track {
                    id: 0,
                    name: "Drums".into(),
                    devices: vec![Device {
                        id: 0,
                        name: "Kit".into(),
                        class_name: "DrumGroupDevice".into(),
                        parameters: vec![Parameter {
                            id: 0,
                            name: "Volume".into(),
                            value: 0.5,
                            min: 0.0,
                            max: 1.0,
                            value_string: None,
                        }],
                    }],
                },
                Track {
                    id: 1,
                    name: "Bass".into(),
                    devices: vec![],
                },
            ],
        }
    }

    #[test]
    fn lookup_by_indices() {
        let snap = snapshot();
        assert_eq!(snap.track(1).unwrap().name, "Bass");
        assert_eq!(snap.device(0, 0).unwrap().class_name, "DrumGroupDevice");
        let key = ParamKey {
            track: 0,
            device: 0,
            param: 0,
        };
        assert_eq!(snap.parameter(key).unwrap().name, "Volume");
        assert!(snap.device(1, 0).is_none());
    }

    #[test]
    fn parameter_iteration_covers_tree() {
        let snap = snapshot();
        let keys: Vec<ParamKey> = snap.parameters().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![ParamKey {
                track: 0,
                device: 0,
                param: 0
            }]
        );
        assert_eq!(snap.parameter_count(), 1);
    }
}
