//! Domain API over the OSC query layer.
//!
//! Thin calls mapping one operation to one or a few queries, with the reply
//! shapes the remote script actually produces:
//!
//! - bulk device replies (`/live/track/get/devices/*`) prepend the track
//!   index, so payload entries start at offset 1;
//! - bulk parameter replies (`/live/device/get/parameters/*`) prepend the
//!   track and device indices, so payload entries start at offset 2.
//!
//! After those echo entries are skipped, parameter index `k` is the DAW's
//! native index and is used unchanged for set, listen, and value_string
//! calls. The bridge never retries (callers own retry policy) except for a
//! single retry inside the liveness probe.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use oscwire::{OscQuery, OscValue, QueryError};

use crate::types::{Device, Parameter, SetParameterOutcome, Track};

pub mod addresses {
    //! OSC addresses consumed, verbatim from the DAW remote script.
    pub const TEST: &str = "/live/test";
    pub const NUM_TRACKS: &str = "/live/song/get/num_tracks";
    pub const TRACK_DATA: &str = "/live/song/get/track_data";
    pub const NUM_DEVICES: &str = "/live/track/get/num_devices";
    pub const DEVICE_NAMES: &str = "/live/track/get/devices/name";
    pub const DEVICE_CLASSES: &str = "/live/track/get/devices/class_name";
    pub const DEVICE_NAME: &str = "/live/device/get/name";
    pub const PARAM_NAMES: &str = "/live/device/get/parameters/name";
    pub const PARAM_VALUES: &str = "/live/device/get/parameters/value";
    pub const PARAM_MINS: &str = "/live/device/get/parameters/min";
    pub const PARAM_MAXES: &str = "/live/device/get/parameters/max";
    pub const PARAM_VALUE_STRING: &str = "/live/device/get/parameter/value_string";
    pub const SET_PARAM_VALUE: &str = "/live/device/set/parameter/value";
    pub const START_LISTEN: &str = "/live/device/start_listen/parameter/value";
    pub const STOP_LISTEN: &str = "/live/device/stop_listen/parameter/value";
    /// Push notifications arrive on the mirrored get address.
    pub const PARAM_VALUE_PUSH: &str = "/live/device/get/parameter/value";
}

use addresses as addr;

/// Default liveness-probe timeout.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),
    #[error("malformed reply on {address}: {detail}")]
    Malformed {
        address: &'static str,
        detail: String,
    },
}

fn malformed(address: &'static str, detail: impl Into<String>) -> BridgeError {
    BridgeError::Malformed {
        address,
        detail: detail.into(),
    }
}

/// The request side of the DAW conversation. Stateless; shared by every
/// session.
pub struct LiveBridge {
    query: Arc<OscQuery>,
    liveness_timeout: Duration,
}

impl LiveBridge {
    pub fn new(query: Arc<OscQuery>, liveness_timeout: Duration) -> Self {
        Self {
            query,
            liveness_timeout,
        }
    }

    /// True iff the DAW answers the probe. One silent retry; anything
    /// beyond that is the caller's decision.
    pub async fn is_live(&self) -> bool {
        for attempt in 0..2 {
            match self
                .query
                .call_with_timeout(addr::TEST, vec![], self.liveness_timeout)
                .await
            {
                Ok(_) => {
                    info!("DAW liveness probe answered");
                    return true;
                }
                Err(e) => debug!(attempt, error = %e, "liveness probe failed"),
            }
        }
        false
    }

    /// Enumerate tracks and their device lists (no parameters yet).
    ///
    /// Progress milestones: 0 before the track count, 10 after it, 20 after
    /// the bulk name query, a per-track ramp toward 50, and 50 when done.
    #[instrument(skip_all)]
    pub async fn enumerate_tracks(
        &self,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<Vec<Track>, BridgeError> {
        progress(0);

        let reply = self.query.call(addr::NUM_TRACKS, vec![]).await?;
        let num_tracks = reply
            .first()
            .and_then(OscValue::as_i32)
            .ok_or_else(|| malformed(addr::NUM_TRACKS, "expected an integer track count"))?
            .max(0) as u32;
        progress(10);

        let names = self
            .query
            .call(
                addr::TRACK_DATA,
                vec![
                    OscValue::Int(0),
                    OscValue::Int(num_tracks as i32),
                    OscValue::from("track.name"),
                ],
            )
            .await?;
        progress(20);

        let mut tracks = Vec::with_capacity(names.len());
        let total = names.len().max(1) as u32;
        for (index, name) in names.iter().enumerate() {
            progress(20 + (30 * index as u32 / total) as u8);

            let name = name
                .as_str()
                .ok_or_else(|| malformed(addr::TRACK_DATA, "track name is not a string"))?
                .to_string();
            let index = index as u32;

            let devices = self.enumerate_devices(index).await?;
            tracks.push(Track {
                id: index,
                name,
                devices,
            });
        }

        progress(50);
        Ok(tracks)
    }

    async fn enumerate_devices(&self, track: u32) -> Result<Vec<Device>, BridgeError> {
        let reply = self
            .query
            .call(addr::NUM_DEVICES, vec![OscValue::Int(track as i32)])
            .await?;
        // Reply shape: [track_index, device_count].
        let count = reply
            .get(1)
            .and_then(OscValue::as_i32)
            .ok_or_else(|| malformed(addr::NUM_DEVICES, "expected [track, count]"))?;
        if count <= 0 {
            return Ok(vec![]);
        }

        let names = self
            .query
            .call(addr::DEVICE_NAMES, vec![OscValue::Int(track as i32)])
            .await?;
        let classes = self
            .query
            .call(addr::DEVICE_CLASSES, vec![OscValue::Int(track as i32)])
            .await?;

        // Both replies prepend the track index.
        let mut devices = Vec::with_capacity(names.len().saturating_sub(1));
        for (device_index, name) in names.iter().skip(1).enumerate() {
            let name = name
                .as_str()
                .ok_or_else(|| malformed(addr::DEVICE_NAMES, "device name is not a string"))?;
            let class_name = classes
                .get(device_index + 1)
                .and_then(OscValue::as_str)
                .ok_or_else(|| {
                    malformed(addr::DEVICE_CLASSES, "missing class name for device")
                })?;
            devices.push(Device {
                id: device_index as u32,
                name: name.to_string(),
                class_name: class_name.to_string(),
                parameters: vec![],
            });
        }
        Ok(devices)
    }

    /// Live parameter list for one device: names, values, mins, and maxes
    /// queried concurrently and aligned by index, with the two leading echo
    /// entries dropped from each reply.
    #[instrument(skip(self))]
    pub async fn get_parameters(
        &self,
        track: u32,
        device: u32,
    ) -> Result<Vec<Parameter>, BridgeError> {
        let args = || vec![OscValue::Int(track as i32), OscValue::Int(device as i32)];
        let (names, values, mins, maxes) = tokio::try_join!(
            self.query.call(addr::PARAM_NAMES, args()),
            self.query.call(addr::PARAM_VALUES, args()),
            self.query.call(addr::PARAM_MINS, args()),
            self.query.call(addr::PARAM_MAXES, args()),
        )?;

        let count = names.len().saturating_sub(2);
        if values.len() < count + 2 || mins.len() < count + 2 || maxes.len() < count + 2 {
            return Err(malformed(
                addr::PARAM_VALUES,
                format!(
                    "parameter arity mismatch: names={} values={} mins={} maxes={}",
                    names.len(),
                    values.len(),
                    mins.len(),
                    maxes.len()
                ),
            ));
        }

        let mut parameters = Vec::with_capacity(count);
        for k in 0..count {
            let name = names[k + 2]
                .as_str()
                .ok_or_else(|| malformed(addr::PARAM_NAMES, "parameter name is not a string"))?;
            let value = values[k + 2]
                .as_f32()
                .ok_or_else(|| malformed(addr::PARAM_VALUES, "parameter value is not numeric"))?;
            let min = mins[k + 2]
                .as_f32()
                .ok_or_else(|| malformed(addr::PARAM_MINS, "parameter min is not numeric"))?;
            let max = maxes[k + 2]
                .as_f32()
                .ok_or_else(|| malformed(addr::PARAM_MAXES, "parameter max is not numeric"))?;
            parameters.push(Parameter {
                id: k as u32,
                name: name.to_string(),
                value,
                min,
                max,
                value_string: None,
            });
        }
        Ok(parameters)
    }

    /// Set one parameter, returning the human-readable before/after
    /// rendering.
    #[instrument(skip(self))]
    pub async fn set_parameter(
        &self,
        track: u32,
        device: u32,
        param: u32,
        value: f32,
    ) -> Result<SetParameterOutcome, BridgeError> {
        let device_name = self.device_name(track, device).await?;
        let param_name = self.parameter_name(track, device, param).await?;

        let from = self.value_string(track, device, param).await?;
        self.query
            .transport()
            .send(&oscwire::OscMessage::new(
                addr::SET_PARAM_VALUE,
                vec![
                    OscValue::Int(track as i32),
                    OscValue::Int(device as i32),
                    OscValue::Int(param as i32),
                    OscValue::Float(value),
                ],
            ))
            .await?;
        let to = self.value_string(track, device, param).await?;

        info!(track, device, param, value, %from, %to, "parameter set");
        Ok(SetParameterOutcome {
            device: device_name,
            param: param_name,
            from,
            to,
        })
    }

    /// Enable push notifications for one parameter. Fire-and-forget.
    pub async fn start_listen(
        &self,
        track: u32,
        device: u32,
        param: u32,
    ) -> Result<(), BridgeError> {
        self.listen_message(addr::START_LISTEN, track, device, param)
            .await
    }

    /// Disable push notifications for one parameter. Fire-and-forget.
    pub async fn stop_listen(
        &self,
        track: u32,
        device: u32,
        param: u32,
    ) -> Result<(), BridgeError> {
        self.listen_message(addr::STOP_LISTEN, track, device, param)
            .await
    }

    async fn listen_message(
        &self,
        address: &'static str,
        track: u32,
        device: u32,
        param: u32,
    ) -> Result<(), BridgeError> {
        self.query
            .transport()
            .send(&oscwire::OscMessage::new(
                address,
                vec![
                    OscValue::Int(track as i32),
                    OscValue::Int(device as i32),
                    OscValue::Int(param as i32),
                ],
            ))
            .await?;
        Ok(())
    }

    pub fn query(&self) -> &Arc<OscQuery> {
        &self.query
    }

    async fn device_name(&self, track: u32, device: u32) -> Result<String, BridgeError> {
        let reply = self
            .query
            .call(
                addr::DEVICE_NAME,
                vec![OscValue::Int(track as i32), OscValue::Int(device as i32)],
            )
            .await?;
        // Reply shape: [track, device, name].
        reply
            .get(2)
            .and_then(OscValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| malformed(addr::DEVICE_NAME, "expected [track, device, name]"))
    }

    async fn parameter_name(
        &self,
        track: u32,
        device: u32,
        param: u32,
    ) -> Result<String, BridgeError> {
        let names = self
            .query
            .call(
                addr::PARAM_NAMES,
                vec![OscValue::Int(track as i32), OscValue::Int(device as i32)],
            )
            .await?;
        names
            .get(param as usize + 2)
            .and_then(OscValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                malformed(
                    addr::PARAM_NAMES,
                    format!("no parameter at index {param}"),
                )
            })
    }

    async fn value_string(
        &self,
        track: u32,
        device: u32,
        param: u32,
    ) -> Result<String, BridgeError> {
        let reply = self
            .query
            .call(
                addr::PARAM_VALUE_STRING,
                vec![
                    OscValue::Int(track as i32),
                    OscValue::Int(device as i32),
                    OscValue::Int(param as i32),
                ],
            )
            .await?;
        // Reply shape: [track, device, param, value_string].
        reply
            .get(3)
            .and_then(OscValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                malformed(
                    addr::PARAM_VALUE_STRING,
                    "expected [track, device, param, string]",
                )
            })
    }
}
