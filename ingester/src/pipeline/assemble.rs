use chrono::Utc;
use common_types::{format::format_ch_datetime, ClickHouseEvent, PersonMode};
use metrics::counter;
use serde_json::Value;
use tracing::warn;

use crate::{
    metric_consts::HEATMAP_FAST_PATH,
    pipeline::{elements::elements_to_chain, PipelineOutput, StageResult},
};

/// Builds the enriched record for each surviving event. `$$heatmap`
/// events were fully consumed by extraction and produce no record.
pub fn assemble_events(events: Vec<StageResult>) -> Vec<PipelineOutput> {
    let mut outputs = Vec::with_capacity(events.len());

    for event in events {
        let mut prepared = match event {
            Ok(prepared) => prepared,
            Err(e) => {
                outputs.push(Err(e));
                continue;
            }
        };

        if prepared.is_heatmap_fast_path() {
            counter!(HEATMAP_FAST_PATH).increment(1);
            outputs.push(Ok(None));
            continue;
        }

        if prepared.team.anonymize_ips {
            prepared.event.properties.remove("$ip");
        }

        let elements_chain = match prepared.event.properties.remove("$elements") {
            Some(Value::Array(elements)) => match elements_to_chain(&elements) {
                Ok(chain) => Some(chain),
                Err(reason) => {
                    warn!(
                        event = prepared.uuid.to_string(),
                        team = prepared.team.id,
                        "failed to serialize elements chain: {}",
                        reason
                    );
                    None
                }
            },
            Some(_) | None => None,
        };

        let (person_id, person_properties, person_created_at) = match prepared.person_mode {
            PersonMode::Propertyless => (None, Some("{}".to_string()), None),
            PersonMode::Full | PersonMode::ForceUpgrade => match &prepared.person {
                Some(person) => (
                    Some(person.uuid.to_string()),
                    Some(
                        serde_json::to_string(&person.properties)
                            .expect("person properties round-trip through serde"),
                    ),
                    Some(format_ch_datetime(person.created_at)),
                ),
                None => (None, None, None),
            },
        };

        let properties = serde_json::to_string(&prepared.event.properties)
            .expect("event properties round-trip through serde");

        outputs.push(Ok(Some(ClickHouseEvent {
            uuid: prepared.uuid,
            team_id: prepared.team.id,
            project_id: prepared.team.project_id(),
            event: prepared.event.event,
            distinct_id: prepared.distinct_id,
            properties: Some(properties),
            person_id,
            timestamp: format_ch_datetime(prepared.timestamp),
            created_at: format_ch_datetime(Utc::now()),
            elements_chain,
            person_created_at,
            person_properties,
            person_mode: prepared.person_mode,
        })));
    }

    outputs
}
