pub const EVENTS_RECEIVED: &str = "ingester_events_received";
pub const EVENTS_EMITTED: &str = "ingester_events_emitted";
pub const EVENTS_DROPPED: &str = "ingester_events_dropped";
pub const EVENT_BATCH_SIZE: &str = "ingester_event_batch_size";
pub const BATCH_RETRIES: &str = "ingester_batch_retries";
pub const DLQ_ROUTED: &str = "ingester_dlq_routed";
pub const WARNINGS_EMITTED: &str = "ingester_warnings_emitted";
pub const HEATMAPS_EXTRACTED: &str = "ingester_heatmap_events_extracted";
pub const HEATMAP_FAST_PATH: &str = "ingester_heatmap_fast_path";
pub const TRANSFORMATION_FAILED: &str = "ingester_transformation_failed";
pub const AI_EVENTS_PROCESSED: &str = "ingester_ai_events_processed";
pub const PERSONS_CREATED: &str = "ingester_persons_created";
pub const PERSONS_MERGED: &str = "ingester_persons_merged";
pub const PERSON_UPDATE_CONFLICTS: &str = "ingester_person_update_conflicts";
pub const GROUP_TYPES_CAPPED: &str = "ingester_group_types_capped";
pub const GROUPS_UPSERTED: &str = "ingester_groups_upserted";
pub const TEAM_CACHE_HITS: &str = "ingester_team_cache_hits";
pub const TEAM_CACHE_MISSES: &str = "ingester_team_cache_misses";
pub const MAIN_LOOP_TIME: &str = "ingester_main_loop_ms";
pub const HANDLE_BATCH_TIME: &str = "ingester_handle_batch_ms";
pub const EMIT_TIME: &str = "ingester_emit_ms";
pub const ERRORS: &str = "ingester_errors";
