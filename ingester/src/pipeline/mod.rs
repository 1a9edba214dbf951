use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_kafka::kafka_messages::ingest_warning::IngestionWarning;
use common_types::{ClickHouseEvent, PersonMode, PipelineEvent, Team};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{EventError, PipelineFailure},
    hub::Hub,
    teams::do_team_lookups,
};

pub mod ai;
pub mod assemble;
pub mod elements;
pub mod groups;
pub mod heatmaps;
pub mod person_store;
pub mod persons;
pub mod prep;
pub mod transform;

pub const HEATMAP_EVENT: &str = "$$heatmap";
pub const WARNING_SOURCE: &str = "ingester";

// An input message after JSON decode. Malformed payloads stay in the
// batch so accounting and offsets line up with the raw messages.
pub enum DecodedEvent {
    Parsed(Box<PipelineEvent>),
    Malformed(String),
}

// An event mid-pipeline: normalized, stamped with its team and resolved
// timestamp, accumulating person state as the stages run.
pub struct PreparedEvent {
    pub event: PipelineEvent,
    pub uuid: Uuid,
    pub distinct_id: String,
    pub team: Team,
    pub timestamp: DateTime<Utc>,
    pub person_mode: PersonMode,
    pub person: Option<PersonSnapshot>,
}

impl PreparedEvent {
    pub fn is_heatmap_fast_path(&self) -> bool {
        self.event.event == HEATMAP_EVENT
    }

    pub fn person_processing_enabled(&self) -> bool {
        matches!(self.person_mode, PersonMode::Full)
    }
}

// The resolved person identity after the current event's writes, merged
// into the enriched output.
#[derive(Debug, Clone)]
pub struct PersonSnapshot {
    pub uuid: Uuid,
    pub created_at: DateTime<Utc>,
    pub properties: serde_json::Map<String, Value>,
    pub mode: PersonMode,
}

pub type StageResult = Result<PreparedEvent, EventError>;

// The pipeline's verdict for one input message: an enriched event to
// emit, nothing (consumed by a fast path), or a classified drop.
pub type PipelineOutput = Result<Option<ClickHouseEvent>, EventError>;

// Messages for the ancillary topics, accumulated while the batch runs
// and emitted together by the consumer, which awaits every
// acknowledgement before storing offsets.
#[derive(Default, Debug)]
pub struct SideEffects {
    pub warnings: Vec<IngestionWarning>,
    pub heatmaps: Vec<heatmaps::KeyedHeatmapEvent>,
    pub person_updates: Vec<persons::PersonUpdate>,
    pub group_updates: Vec<groups::GroupUpdate>,
}

impl SideEffects {
    pub fn warn(
        &mut self,
        team_id: i32,
        warning_type: &str,
        details: HashMap<String, Value>,
        timestamp: Option<DateTime<Utc>>,
    ) {
        self.warnings.push(IngestionWarning::new(
            team_id,
            WARNING_SOURCE.to_string(),
            warning_type.to_string(),
            details,
            timestamp,
        ));
    }
}

/// Run a batch of raw payloads through the whole per-event state
/// machine. Returns one output per input, in order, plus the side-effect
/// messages the consumer still has to emit. A `PipelineFailure` means a
/// retryable fault (store conflict, transient infra); the consumer
/// re-runs the batch, which is safe because every mutation is
/// version-guarded and idempotent.
pub async fn handle_batch(
    payloads: Vec<Vec<u8>>,
    hub: Arc<Hub>,
) -> Result<(Vec<PipelineOutput>, SideEffects), PipelineFailure> {
    let start_count = payloads.len();
    let mut effects = SideEffects::default();

    let decoded = prep::decode_events(payloads);
    assert_eq!(start_count, decoded.len());

    let teams_lut = do_team_lookups(hub.clone(), &decoded).await?;

    let buffer = prep::prepare_events(decoded, teams_lut, &hub, &mut effects);
    assert_eq!(start_count, buffer.len());

    let buffer = transform::apply_transformations(buffer, &hub).await;
    assert_eq!(start_count, buffer.len());

    let buffer = ai::process_ai_events(buffer);
    assert_eq!(start_count, buffer.len());

    let buffer = persons::resolve_persons(buffer, hub.clone(), &mut effects).await?;
    assert_eq!(start_count, buffer.len());

    let buffer = groups::resolve_groups(buffer, hub.clone(), &mut effects).await?;
    assert_eq!(start_count, buffer.len());

    let buffer = heatmaps::extract_heatmaps(buffer, &mut effects);
    assert_eq!(start_count, buffer.len());

    let outputs = assemble::assemble_events(buffer);
    assert_eq!(start_count, outputs.len());

    Ok((outputs, effects))
}
