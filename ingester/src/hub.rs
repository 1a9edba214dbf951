use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    config::Config,
    personless::PersonlessTokens,
    pipeline::{
        groups::{GroupStore, PostgresGroupStore},
        person_store::{PersonStore, PostgresPersonStore},
        transform::{PropertyFilter, Transformation},
    },
    teams::{PostgresTeamResolver, TeamResolver},
};

/// Everything the per-event pipeline needs that would otherwise be
/// process-global: stores, caches, the transformation chain, tuning
/// knobs. Passed explicitly to every stage; tests build one over the
/// in-memory stores.
pub struct Hub {
    pub teams: Arc<dyn TeamResolver>,
    pub persons: Arc<dyn PersonStore>,
    pub groups: Arc<dyn GroupStore>,
    pub personless_tokens: PersonlessTokens,
    pub transformations: Vec<Arc<dyn Transformation>>,
    pub settings: PipelineSettings,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub person_resolution_retry_max: u64,
    pub max_group_types_per_team: i32,
    pub timestamp_future_tolerance_ms: i64,
}

impl Hub {
    pub fn new(config: &Config, pool: PgPool) -> Self {
        let mut transformations: Vec<Arc<dyn Transformation>> = Vec::new();
        if !config.filtered_properties.trim().is_empty() {
            transformations.push(Arc::new(PropertyFilter::from_config(
                &config.filtered_properties,
            )));
        }

        Self {
            teams: Arc::new(PostgresTeamResolver::new(config, pool.clone())),
            persons: Arc::new(PostgresPersonStore::new(pool.clone())),
            groups: Arc::new(PostgresGroupStore::new(config, pool)),
            personless_tokens: PersonlessTokens::parse(&config.persons_processing_skip_tokens),
            transformations,
            settings: PipelineSettings {
                person_resolution_retry_max: config.person_resolution_retry_max,
                max_group_types_per_team: config.max_group_types_per_team,
                timestamp_future_tolerance_ms: config.timestamp_future_tolerance_ms,
            },
        }
    }
}
