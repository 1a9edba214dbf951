use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Postgres;

use crate::TeamId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct GroupType {
    pub group_type: String,
    pub group_type_index: i32,
    pub team_id: TeamId,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Group {
    pub team_id: TeamId,
    pub group_type_index: i32,
    pub group_key: String,
    pub group_properties: Value,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl GroupType {
    pub async fn for_team<'c, E>(e: E, team_id: TeamId) -> Result<Vec<Self>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        sqlx::query_as::<_, Self>(
            "SELECT group_type, group_type_index, team_id FROM posthog_grouptypemapping WHERE team_id = $1",
        )
        .bind(team_id)
        .fetch_all(e)
        .await
    }
}
