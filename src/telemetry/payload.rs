//! Report payloads and their JSON bodies

use rustfft::num_complex::Complex32;
use serde::ser::{SerializeSeq, Serializer};
use serde::Serialize;

use crate::spectrum::ChannelPowerProfile;

/// Sensor identity, loaded once at startup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorIdentity {
    pub sensor_id: String,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
}

/// Collector resource a payload is posted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Measurements,
    Samples,
}

impl Resource {
    pub fn path_segment(self) -> &'static str {
        match self {
            Resource::Measurements => "measurements",
            Resource::Samples => "samples",
        }
    }
}

/// One report handed to the telemetry worker
///
/// Owned outright so nothing can change it after handoff.
#[derive(Debug, Clone)]
pub enum TelemetryPayload {
    PowerReport {
        identity: SensorIdentity,
        profile: ChannelPowerProfile,
    },
    IqReport {
        identity: SensorIdentity,
        channel: u8,
        samples: Vec<Complex32>,
    },
}

#[derive(Serialize)]
struct PowerReportBody<'a> {
    #[serde(flatten)]
    sensor: &'a SensorIdentity,
    channels: Vec<ChannelBody>,
}

#[derive(Serialize)]
struct ChannelBody {
    name: String,
    power: Option<f32>,
}

#[derive(Serialize)]
struct IqReportBody<'a> {
    sensor: &'a SensorIdentity,
    channel: u8,
    iq_samples: IqPairs<'a>,
}

/// Serializes samples as `[[I, Q], ...]` without an intermediate Vec
struct IqPairs<'a>(&'a [Complex32]);

impl Serialize for IqPairs<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for s in self.0 {
            seq.serialize_element(&[s.re, s.im])?;
        }
        seq.end()
    }
}

impl TelemetryPayload {
    pub fn resource(&self) -> Resource {
        match self {
            TelemetryPayload::PowerReport { .. } => Resource::Measurements,
            TelemetryPayload::IqReport { .. } => Resource::Samples,
        }
    }

    /// Compact JSON body
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            TelemetryPayload::PowerReport { identity, profile } => {
                let channels = profile
                    .entries()
                    .iter()
                    .map(|e| ChannelBody {
                        name: format!("channel{}", e.channel_index),
                        power: e.average_power_db,
                    })
                    .collect();
                serde_json::to_vec(&PowerReportBody {
                    sensor: identity,
                    channels,
                })
            }
            TelemetryPayload::IqReport {
                identity,
                channel,
                samples,
            } => serde_json::to_vec(&IqReportBody {
                sensor: identity,
                channel: *channel,
                iq_samples: IqPairs(samples),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::{ChannelLayout, PowerSpectrum, SpectrumAggregator, NUM_CHANNELS};
    use serde_json::Value;

    fn identity() -> SensorIdentity {
        SensorIdentity {
            sensor_id: "CCI-xG-Sensor-01".to_string(),
            latitude: 38.88095833926984,
            longitude: -77.11573962785668,
        }
    }

    #[test]
    fn test_power_report_round_trip() {
        let layout = ChannelLayout {
            step: 41,
            channel_offset: 5,
            start_trim: 0,
            end_trim: 0,
        };
        let bins: Vec<f32> = (0..615).map(|i| -100.0 + (i / 41) as f32).collect();
        let mut profile = ChannelPowerProfile::new();
        SpectrumAggregator::new(layout)
            .aggregate(&PowerSpectrum::new(bins), &mut profile)
            .unwrap();

        let payload = TelemetryPayload::PowerReport {
            identity: identity(),
            profile: profile.clone(),
        };
        assert_eq!(payload.resource(), Resource::Measurements);

        let body: Value = serde_json::from_slice(&payload.to_json().unwrap()).unwrap();
        assert_eq!(body["sensor_id"], "CCI-xG-Sensor-01");
        assert!((body["lat"].as_f64().unwrap() - 38.88095833926984).abs() < 1e-12);
        assert!((body["lon"].as_f64().unwrap() + 77.11573962785668).abs() < 1e-12);

        let channels = body["channels"].as_array().unwrap();
        assert_eq!(channels.len(), NUM_CHANNELS);
        for (i, ch) in channels.iter().enumerate() {
            assert_eq!(ch["name"], format!("channel{}", i));
            let parsed = ch["power"].as_f64().map(|p| p as f32);
            assert_eq!(parsed, profile.power(i));
        }
    }

    #[test]
    fn test_iq_report_carries_every_sample() {
        let samples: Vec<Complex32> = (0..1000)
            .map(|k| Complex32::new(k as f32 * 0.5, -(k as f32) - 1.0))
            .collect();
        let payload = TelemetryPayload::IqReport {
            identity: identity(),
            channel: 9,
            samples,
        };
        assert_eq!(payload.resource(), Resource::Samples);

        let body: Value = serde_json::from_slice(&payload.to_json().unwrap()).unwrap();
        assert_eq!(body["sensor"]["sensor_id"], "CCI-xG-Sensor-01");
        assert_eq!(body["channel"], 9);

        let pairs = body["iq_samples"].as_array().unwrap();
        assert_eq!(pairs.len(), 1000);
        assert_eq!(pairs[0], serde_json::json!([0.0, -1.0]));
        assert_eq!(pairs[999], serde_json::json!([499.5, -1000.0]));
    }
}
