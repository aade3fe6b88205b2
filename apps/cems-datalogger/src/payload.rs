use crate::aggregator::AveragedReadings;
use crate::config::Config;
use crate::time::align_down_ms;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::value::RawValue;

const FLAG_UNCALIBRATED: &str = "U";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlignedPayload {
    pub json: String,
    pub aligned_ts_ms: i64,
}

/// Identity and formatting applied to every outgoing payload.
#[derive(Clone, Debug)]
pub struct PayloadFormat {
    pub device_id: String,
    pub station_id: String,
    pub grid_interval_secs: i64,
    pub value_decimals: usize,
}

impl PayloadFormat {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_id: config.device_id.clone(),
            station_id: config.station_id.clone(),
            grid_interval_secs: config.grid_interval_secs(),
            value_decimals: config.value_decimals,
        }
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    data: Vec<StationData<'a>>,
}

#[derive(Serialize)]
struct StationData<'a> {
    #[serde(rename = "stationId")]
    station_id: &'a str,
    device_data: Vec<DeviceData<'a>>,
}

#[derive(Serialize)]
struct DeviceData<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    params: Vec<Param<'a>>,
}

#[derive(Serialize)]
struct Param<'a> {
    parameter: &'a str,
    value: Box<RawValue>,
    unit: &'a str,
    timestamp: i64,
    flag: &'static str,
}

/// Compact JSON with one grid-aligned timestamp shared by every parameter.
/// Non-finite averages are left out.
pub fn build_plain_payload(
    readings: &AveragedReadings,
    format: &PayloadFormat,
    now: DateTime<Utc>,
) -> Result<AlignedPayload, serde_json::Error> {
    let aligned_ts_ms = align_down_ms(now.timestamp_millis(), format.grid_interval_secs);
    let mut params = Vec::with_capacity(readings.len());
    for (parameter, reading) in readings {
        if !reading.value.is_finite() {
            tracing::warn!(param = %parameter, "non-finite average left out of payload");
            continue;
        }
        let value = RawValue::from_string(format!("{:.*}", format.value_decimals, reading.value))?;
        params.push(Param {
            parameter,
            value,
            unit: &reading.unit,
            timestamp: aligned_ts_ms,
            flag: FLAG_UNCALIBRATED,
        });
    }

    let payload = Payload {
        data: vec![StationData {
            station_id: &format.station_id,
            device_data: vec![DeviceData {
                device_id: &format.device_id,
                params,
            }],
        }],
    };
    Ok(AlignedPayload {
        json: serde_json::to_string(&payload)?,
        aligned_ts_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AveragedReading;

    fn format() -> PayloadFormat {
        PayloadFormat {
            device_id: "device_7025".to_string(),
            station_id: "station_8203".to_string(),
            grid_interval_secs: 900,
            value_decimals: 2,
        }
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn ph(value: f64) -> AveragedReadings {
        AveragedReadings::from([(
            "pH".to_string(),
            AveragedReading {
                value,
                unit: "pH".to_string(),
                samples: 1,
            },
        )])
    }

    #[test]
    fn ph_scenario_produces_exact_compact_json() {
        let now = at("2025-03-10T06:37:13Z");
        let bucket = at("2025-03-10T06:30:00Z").timestamp_millis();
        let payload = build_plain_payload(&ph(8.2), &format(), now).unwrap();

        assert_eq!(payload.aligned_ts_ms, bucket);
        assert_eq!(
            payload.json,
            format!(
                r#"{{"data":[{{"stationId":"station_8203","device_data":[{{"deviceId":"device_7025","params":[{{"parameter":"pH","value":8.20,"unit":"pH","timestamp":{bucket},"flag":"U"}}]}}]}}]}}"#
            )
        );
    }

    #[test]
    fn builds_in_one_bucket_share_timestamp() {
        let first = build_plain_payload(&ph(7.0), &format(), at("2025-03-10T06:30:01Z")).unwrap();
        let second = build_plain_payload(&ph(7.0), &format(), at("2025-03-10T06:44:59Z")).unwrap();
        assert_eq!(first, second);

        let next = build_plain_payload(&ph(7.0), &format(), at("2025-03-10T06:45:00Z")).unwrap();
        assert_eq!(next.aligned_ts_ms - first.aligned_ts_ms, 900_000);
    }

    #[test]
    fn params_are_ordered_by_name_and_non_finite_dropped() {
        let mut readings = ph(6.5);
        readings.insert(
            "CO".to_string(),
            AveragedReading {
                value: 1.0 / 3.0,
                unit: "ppm".to_string(),
                samples: 1,
            },
        );
        readings.insert(
            "NOx".to_string(),
            AveragedReading {
                value: f64::NAN,
                unit: "ppm".to_string(),
                samples: 1,
            },
        );
        let payload = build_plain_payload(&readings, &format(), at("2025-03-10T06:30:00Z")).unwrap();
        let co = payload.json.find(r#""parameter":"CO","value":0.33"#).unwrap();
        let ph = payload.json.find(r#""parameter":"pH","value":6.50"#).unwrap();
        assert!(co < ph);
        assert!(!payload.json.contains("NOx"));
    }
}
