use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Postgres;
use uuid::Uuid;

use crate::TeamId;

pub type PersonId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Person {
    pub id: PersonId,
    pub created_at: DateTime<Utc>,
    pub team_id: TeamId,
    pub uuid: Uuid,
    pub properties: Value,
    pub is_identified: bool,
    pub is_user_id: Option<i32>,
    pub version: Option<i64>,
    pub force_upgrade: bool,
}

const PERSON_COLUMNS: &str = r#"
    pp.id,
    pp.created_at,
    pp.team_id,
    pp.uuid,
    pp.properties,
    pp.is_identified,
    pp.is_user_id,
    pp.version,
    pp.force_upgrade
"#;

impl Person {
    pub async fn from_distinct_id<'c, E>(
        e: E,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let query = format!(
            r#"
            SELECT {PERSON_COLUMNS}
            FROM posthog_person pp
            INNER JOIN posthog_persondistinctid pdi
                ON pp.id = pdi.person_id
            WHERE pdi.distinct_id = $1
                AND pdi.team_id = $2
                AND pp.team_id = $2
            LIMIT 1
            "#
        );
        sqlx::query_as::<_, Person>(&query)
            .bind(distinct_id)
            .bind(team_id)
            .fetch_optional(e)
            .await
    }

    /// The person snapshot we merge the current event's `$set` into when
    /// building the enriched record.
    pub fn properties_object(&self) -> serde_json::Map<String, Value> {
        match &self.properties {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}
