//! The tool catalog the agent exposes to the model, and its execution
//! against the live session.
//!
//! Three tools, fixed schemas. `enumerate_mixer` reads the mirror and never
//! touches the DAW; the other two go through the bridge. Only
//! `set_device_parameter` mutates and therefore needs approval.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use liveset::{LiveBridge, MixerMirror, MixerSnapshot};

pub const ENUMERATE_MIXER: &str = "enumerate_mixer";
pub const GET_DEVICE_PARAMETERS: &str = "get_device_parameters";
pub const SET_DEVICE_PARAMETER: &str = "set_device_parameter";

/// True for tools that change DAW state and require client approval.
pub fn is_mutating(name: &str) -> bool {
    name == SET_DEVICE_PARAMETER
}

/// Tool declarations in the shape the messages endpoint expects.
pub fn definitions() -> Value {
    json!([
        {
            "name": ENUMERATE_MIXER,
            "description": "List every track with its devices (names and device classes).",
            "input_schema": { "type": "object", "properties": {} }
        },
        {
            "name": GET_DEVICE_PARAMETERS,
            "description": "List one device's parameters with current value, min, and max, in the DAW's native units.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "track_id": { "type": "number" },
                    "device_id": { "type": "number" }
                },
                "required": ["track_id", "device_id"]
            }
        },
        {
            "name": SET_DEVICE_PARAMETER,
            "description": "Set one device parameter to a value within its min/max range. Returns the human-readable value before and after.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "track_id": { "type": "number" },
                    "device_id": { "type": "number" },
                    "param_id": { "type": "number" },
                    "value": { "type": "number" }
                },
                "required": ["track_id", "device_id", "param_id", "value"]
            }
        }
    ])
}

/// Execution seam; the agent loop only sees this trait.
#[async_trait]
pub trait Toolbox: Send + Sync {
    async fn execute(&self, name: &str, input: &Value) -> Result<Value>;
}

/// Tool execution against one session's mirror and the shared bridge.
pub struct MixerToolbox {
    bridge: Arc<LiveBridge>,
    mirror: Arc<MixerMirror>,
}

impl MixerToolbox {
    pub fn new(bridge: Arc<LiveBridge>, mirror: Arc<MixerMirror>) -> Self {
        Self { bridge, mirror }
    }

    fn enumerate(&self) -> Result<Value> {
        let snapshot = self
            .mirror
            .load()
            .context("the mixer has not been indexed yet")?;
        Ok(mixer_summary(&snapshot))
    }
}

/// Track/device summary without the parameter lists; what
/// `enumerate_mixer` returns and what the `tracks` event carries.
pub fn mixer_summary(snapshot: &MixerSnapshot) -> Value {
    let tracks: Vec<Value> = snapshot
        .tracks
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "track_name": t.name,
                "devices": t.devices.iter().map(|d| json!({
                    "id": d.id,
                    "name": d.name,
                    "class_name": d.class_name,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    Value::Array(tracks)
}

#[async_trait]
impl Toolbox for MixerToolbox {
    async fn execute(&self, name: &str, input: &Value) -> Result<Value> {
        match name {
            ENUMERATE_MIXER => self.enumerate(),
            GET_DEVICE_PARAMETERS => {
                let track = index_arg(input, "track_id")?;
                let device = index_arg(input, "device_id")?;
                let params = self.bridge.get_parameters(track, device).await?;
                Ok(serde_json::to_value(params)?)
            }
            SET_DEVICE_PARAMETER => {
                let track = index_arg(input, "track_id")?;
                let device = index_arg(input, "device_id")?;
                let param = index_arg(input, "param_id")?;
                let value = input
                    .get("value")
                    .and_then(Value::as_f64)
                    .context("missing or non-numeric value")? as f32;
                let outcome = self.bridge.set_parameter(track, device, param, value).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            other => bail!("unknown tool: {other}"),
        }
    }
}

/// The model sends ids as JSON numbers, sometimes with a fractional part.
fn index_arg(input: &Value, field: &str) -> Result<u32> {
    let raw = input
        .get(field)
        .and_then(Value::as_f64)
        .with_context(|| format!("missing or non-numeric {field}"))?;
    if raw < 0.0 || raw.fract() != 0.0 {
        bail!("{field} must be a non-negative integer, got {raw}");
    }
    Ok(raw as u32)
}
