use serde::{Deserialize, Serialize};
use sqlx::Postgres;

pub type TeamId = i32;
pub type ProjectId = i64;

// The slice of the team row the pipeline cares about. Read-only from our
// side, cached with a short TTL under both the id and the token.
#[derive(Debug, Clone, Default, Deserialize, Serialize, sqlx::FromRow)]
pub struct Team {
    pub id: TeamId,
    pub project_id: Option<ProjectId>,
    pub api_token: String,
    pub anonymize_ips: bool,
    pub person_processing_opt_out: Option<bool>,
    pub heatmaps_opt_in: Option<bool>,
    pub cookieless_server_hash_mode: Option<i16>,
    pub ingested_event: bool,
}

const TEAM_COLUMNS: &str = r#"
    id,
    project_id,
    api_token,
    anonymize_ips,
    person_processing_opt_out,
    heatmaps_opt_in,
    cookieless_server_hash_mode,
    ingested_event
"#;

impl Team {
    pub fn project_id(&self) -> ProjectId {
        // Rows from before the environments migration have no project_id
        self.project_id.unwrap_or(self.id as ProjectId)
    }

    pub async fn load<'c, E>(e: E, id: TeamId) -> Result<Option<Team>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let query = format!("SELECT {TEAM_COLUMNS} FROM posthog_team WHERE id = $1 LIMIT 1");
        sqlx::query_as::<_, Team>(&query)
            .bind(id)
            .fetch_optional(e)
            .await
    }

    pub async fn load_by_token<'c, E>(e: E, token: &str) -> Result<Option<Team>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let query = format!("SELECT {TEAM_COLUMNS} FROM posthog_team WHERE api_token = $1 LIMIT 1");
        sqlx::query_as::<_, Team>(&query)
            .bind(token)
            .fetch_optional(e)
            .await
    }
}
