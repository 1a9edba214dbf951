use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_types::{format::format_ch_datetime, Group, TeamId};
use metrics::counter;
use moka::sync::{Cache, CacheBuilder};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;

use crate::{
    config::Config,
    error::{PipelineFailure, UnhandledError},
    hub::Hub,
    metric_consts::{GROUPS_UPSERTED, GROUP_TYPES_CAPPED},
    pipeline::{SideEffects, StageResult},
};

// A group row change bound for the groups topic.
#[derive(Debug, Clone, Serialize)]
pub struct GroupUpdate {
    pub team_id: TeamId,
    pub group_type_index: i32,
    pub group_key: String,
    pub group_properties: String,
    pub created_at: String,
    pub version: i64,
}

impl From<&Group> for GroupUpdate {
    fn from(group: &Group) -> Self {
        Self {
            team_id: group.team_id,
            group_type_index: group.group_type_index,
            group_key: group.group_key.clone(),
            group_properties: group.group_properties.to_string(),
            created_at: format_ch_datetime(group.created_at),
            version: group.version,
        }
    }
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Resolve a group type name to its index, registering it if the
    /// team still has capacity. `None` means the cap is reached and the
    /// name gets no index.
    async fn resolve_group_type_index(
        &self,
        team_id: TeamId,
        project_id: i64,
        group_type: &str,
        cap: i32,
    ) -> Result<Option<i32>, UnhandledError>;

    /// Insert or update a group row, applying `$group_set` (overwrite)
    /// and `$group_set_once` (fill) and bumping the version.
    async fn upsert_group(
        &self,
        team_id: TeamId,
        group_type_index: i32,
        group_key: &str,
        set: serde_json::Map<String, Value>,
        set_once: serde_json::Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Result<Group, UnhandledError>;
}

pub struct PostgresGroupStore {
    pool: PgPool,
    // Resolved (team, name) -> index pairs are immutable once assigned,
    // so a plain TTL cache is enough; "no index" results are not cached
    // because capacity can be freed by support tooling
    index_cache: Cache<(TeamId, String), i32>,
}

impl PostgresGroupStore {
    pub fn new(config: &Config, pool: PgPool) -> Self {
        let index_cache = CacheBuilder::new(config.team_cache_max_size)
            .time_to_live(Duration::from_secs(config.group_type_cache_ttl_secs))
            .build();
        Self { pool, index_cache }
    }
}

#[async_trait]
impl GroupStore for PostgresGroupStore {
    async fn resolve_group_type_index(
        &self,
        team_id: TeamId,
        project_id: i64,
        group_type: &str,
        cap: i32,
    ) -> Result<Option<i32>, UnhandledError> {
        let cache_key = (team_id, group_type.to_string());
        if let Some(index) = self.index_cache.get(&cache_key) {
            return Ok(Some(index));
        }

        let existing: Option<(i32,)> = sqlx::query_as(
            "SELECT group_type_index FROM posthog_grouptypemapping WHERE team_id = $1 AND group_type = $2",
        )
        .bind(team_id)
        .bind(group_type)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((index,)) = existing {
            self.index_cache.insert(cache_key, index);
            return Ok(Some(index));
        }

        // Claim the lowest free index under the cap. A concurrent claim
        // of the same name loses the unique constraint race and falls
        // back to the re-read below.
        let claimed: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO posthog_grouptypemapping (team_id, project_id, group_type, group_type_index)
            SELECT $1, $2, $3, candidate
            FROM generate_series(0, $4 - 1) AS candidate
            WHERE candidate NOT IN (
                SELECT group_type_index FROM posthog_grouptypemapping WHERE team_id = $1
            )
            ORDER BY candidate
            LIMIT 1
            ON CONFLICT DO NOTHING
            RETURNING group_type_index
            "#,
        )
        .bind(team_id)
        .bind(project_id)
        .bind(group_type)
        .bind(cap)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((index,)) = claimed {
            self.index_cache.insert(cache_key, index);
            return Ok(Some(index));
        }

        let reread: Option<(i32,)> = sqlx::query_as(
            "SELECT group_type_index FROM posthog_grouptypemapping WHERE team_id = $1 AND group_type = $2",
        )
        .bind(team_id)
        .bind(group_type)
        .fetch_optional(&self.pool)
        .await?;

        match reread {
            Some((index,)) => {
                self.index_cache.insert(cache_key, index);
                Ok(Some(index))
            }
            None => Ok(None), // cap reached
        }
    }

    async fn upsert_group(
        &self,
        team_id: TeamId,
        group_type_index: i32,
        group_key: &str,
        set: serde_json::Map<String, Value>,
        set_once: serde_json::Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Result<Group, UnhandledError> {
        // Two attempts: a concurrent first-insert of the same group makes
        // our insert a no-op, and the second pass takes the update path
        // under the row lock.
        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, Group>(
                r#"
                SELECT team_id, group_type_index, group_key, group_properties, created_at, version
                FROM posthog_group
                WHERE team_id = $1 AND group_type_index = $2 AND group_key = $3
                FOR UPDATE
                "#,
            )
            .bind(team_id)
            .bind(group_type_index)
            .bind(group_key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(group) = existing {
                let mut props = match &group.group_properties {
                    Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                for (key, value) in &set_once {
                    props.entry(key.clone()).or_insert(value.clone());
                }
                for (key, value) in &set {
                    props.insert(key.clone(), value.clone());
                }

                let updated = sqlx::query_as::<_, Group>(
                    r#"
                    UPDATE posthog_group
                    SET group_properties = $1, version = version + 1
                    WHERE team_id = $2 AND group_type_index = $3 AND group_key = $4
                    RETURNING team_id, group_type_index, group_key, group_properties, created_at, version
                    "#,
                )
                .bind(Value::Object(props))
                .bind(team_id)
                .bind(group_type_index)
                .bind(group_key)
                .fetch_one(&mut *tx)
                .await?;

                tx.commit().await?;
                return Ok(updated);
            }

            let mut props = set_once.clone();
            props.extend(set.clone());
            let inserted = sqlx::query_as::<_, Group>(
                r#"
                INSERT INTO posthog_group
                    (team_id, group_type_index, group_key, group_properties, created_at, version)
                VALUES ($1, $2, $3, $4, $5, 0)
                ON CONFLICT (team_id, group_type_index, group_key) DO NOTHING
                RETURNING team_id, group_type_index, group_key, group_properties, created_at, version
                "#,
            )
            .bind(team_id)
            .bind(group_type_index)
            .bind(group_key)
            .bind(Value::Object(props))
            .bind(timestamp)
            .fetch_optional(&mut *tx)
            .await?;

            tx.commit().await?;
            if let Some(group) = inserted {
                return Ok(group);
            }
        }

        Err(UnhandledError::Other(format!(
            "group upsert did not converge for team {team_id}, type {group_type_index}, key {group_key}"
        )))
    }
}

/// Attribute events to groups: resolve `$groups` names to `$group_<i>`
/// keys, and apply `$groupidentify` upserts. Skipped entirely for
/// personless events.
pub async fn resolve_groups(
    mut events: Vec<StageResult>,
    hub: Arc<Hub>,
    effects: &mut SideEffects,
) -> Result<Vec<StageResult>, PipelineFailure> {
    let cap = hub.settings.max_group_types_per_team;

    for (index, slot) in events.iter_mut().enumerate() {
        let Ok(prepared) = slot else {
            continue;
        };
        if prepared.is_heatmap_fast_path() || !prepared.person_processing_enabled() {
            continue;
        }

        let team_id = prepared.team.id;
        let project_id = prepared.team.project_id();

        if prepared.event.event == "$groupidentify" {
            let group_type = prepared
                .event
                .properties
                .get("$group_type")
                .and_then(Value::as_str)
                .map(String::from);
            let group_key = prepared
                .event
                .properties
                .get("$group_key")
                .and_then(value_as_key);

            match (group_type, group_key) {
                (Some(group_type), Some(group_key)) => {
                    let resolved = hub
                        .groups
                        .resolve_group_type_index(team_id, project_id, &group_type, cap)
                        .await
                        .map_err(|e| (index, e))?;

                    match resolved {
                        Some(type_index) => {
                            let set = props_object(&prepared.event.properties, "$group_set");
                            let set_once =
                                props_object(&prepared.event.properties, "$group_set_once");
                            let group = hub
                                .groups
                                .upsert_group(
                                    team_id,
                                    type_index,
                                    &group_key,
                                    set,
                                    set_once,
                                    prepared.timestamp,
                                )
                                .await
                                .map_err(|e| (index, e))?;
                            counter!(GROUPS_UPSERTED).increment(1);
                            effects.group_updates.push(GroupUpdate::from(&group));
                        }
                        None => {
                            counter!(GROUP_TYPES_CAPPED).increment(1);
                            debug!(
                                team = team_id,
                                group_type, "group type cap reached, ignoring $groupidentify"
                            );
                        }
                    }
                }
                _ => {
                    debug!(
                        event = prepared.uuid.to_string(),
                        "$groupidentify without $group_type/$group_key, ignoring"
                    );
                }
            }
        }

        // $groups attribution applies to every event, including
        // $groupidentify itself
        let groups = match prepared.event.properties.get("$groups") {
            Some(Value::Object(map)) => map.clone(),
            _ => continue,
        };

        for (group_type, value) in groups {
            let Some(group_key) = value_as_key(&value) else {
                continue;
            };
            let resolved = hub
                .groups
                .resolve_group_type_index(team_id, project_id, &group_type, cap)
                .await
                .map_err(|e| (index, e))?;

            match resolved {
                Some(type_index) => {
                    prepared.event.properties.insert(
                        format!("$group_{type_index}"),
                        Value::String(group_key),
                    );
                }
                None => {
                    counter!(GROUP_TYPES_CAPPED).increment(1);
                }
            }
        }
    }

    Ok(events)
}

fn props_object(
    properties: &std::collections::HashMap<String, Value>,
    key: &str,
) -> serde_json::Map<String, Value> {
    match properties.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    }
}

// Group keys are strings on the wire, but SDKs send numbers too
fn value_as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn group_keys_coerce_like_distinct_ids() {
        assert_eq!(value_as_key(&json!("acme")), Some("acme".to_string()));
        assert_eq!(value_as_key(&json!(7)), Some("7".to_string()));
        assert_eq!(value_as_key(&json!("")), None);
        assert_eq!(value_as_key(&json!({"no": "objects"})), None);
    }
}
