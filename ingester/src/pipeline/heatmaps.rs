use std::collections::HashMap;

use common_types::format::format_ch_datetime;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    metric_consts::HEATMAPS_EXTRACTED,
    pipeline::{PreparedEvent, SideEffects, StageResult},
};

// Heatmap coordinates are quantized into buckets of this many pixels
const SCALE_FACTOR: i64 = 16;

// One quantized coordinate sample, as written to the heatmaps topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub x: i64,
    pub y: i64,
    pub pointer_target_fixed: bool,
    pub viewport_height: i64,
    pub viewport_width: i64,
    pub current_url: String,
    pub session_id: String,
    pub scale_factor: i64,
    pub timestamp: String,
    pub team_id: i32,
    pub distinct_id: String,
}

// Keyed by the source event's uuid so replays preserve per-event ordering
#[derive(Debug)]
pub struct KeyedHeatmapEvent {
    pub key: String,
    pub event: HeatmapEvent,
}

#[derive(Deserialize)]
struct HeatmapPoint {
    x: f64,
    y: f64,
    #[serde(default)]
    target_fixed: bool,
    #[serde(rename = "type")]
    kind: String,
}

/// Splits `$heatmap_data` into per-coordinate records for the heatmaps
/// topic. The raw blob is always removed from the outgoing event;
/// malformed blobs warn and leave the event otherwise untouched.
pub fn extract_heatmaps(
    mut events: Vec<StageResult>,
    effects: &mut SideEffects,
) -> Vec<StageResult> {
    for slot in events.iter_mut() {
        let Ok(prepared) = slot else {
            continue;
        };

        let Some(data) = prepared.event.properties.remove("$heatmap_data") else {
            continue;
        };

        if prepared.team.heatmaps_opt_in == Some(false) {
            continue;
        }

        match build_heatmap_events(prepared, data) {
            Ok(extracted) => {
                counter!(HEATMAPS_EXTRACTED).increment(extracted.len() as u64);
                let key = prepared.uuid.to_string();
                effects.heatmaps.extend(
                    extracted
                        .into_iter()
                        .map(|event| KeyedHeatmapEvent { key: key.clone(), event }),
                );
            }
            Err(reason) => {
                effects.warn(
                    prepared.team.id,
                    "invalid_heatmap_data",
                    HashMap::from([
                        ("eventUuid".to_string(), json!(prepared.uuid.to_string())),
                        ("reason".to_string(), json!(reason)),
                    ]),
                    None,
                );
            }
        }
    }

    events
}

fn build_heatmap_events(
    prepared: &PreparedEvent,
    data: Value,
) -> Result<Vec<HeatmapEvent>, String> {
    let props = &prepared.event.properties;

    let session_id = props
        .get("$session_id")
        .and_then(Value::as_str)
        .ok_or("missing $session_id")?;
    let viewport_width = props
        .get("$viewport_width")
        .and_then(Value::as_f64)
        .ok_or("missing $viewport_width")?;
    let viewport_height = props
        .get("$viewport_height")
        .and_then(Value::as_f64)
        .ok_or("missing $viewport_height")?;

    let Value::Object(by_url) = data else {
        return Err("$heatmap_data is not an object".to_string());
    };

    let mut extracted = Vec::new();
    for (url, points) in by_url {
        if url.is_empty() {
            continue;
        }
        let points: Vec<HeatmapPoint> =
            serde_json::from_value(points).map_err(|e| e.to_string())?;

        for point in points {
            extracted.push(HeatmapEvent {
                kind: point.kind,
                x: quantize(point.x),
                y: quantize(point.y),
                pointer_target_fixed: point.target_fixed,
                viewport_height: quantize(viewport_height),
                viewport_width: quantize(viewport_width),
                current_url: url.clone(),
                session_id: session_id.to_string(),
                scale_factor: SCALE_FACTOR,
                timestamp: format_ch_datetime(prepared.timestamp),
                team_id: prepared.team.id,
                distinct_id: prepared.distinct_id.clone(),
            });
        }
    }

    Ok(extracted)
}

fn quantize(value: f64) -> i64 {
    (value / SCALE_FACTOR as f64).ceil() as i64
}
