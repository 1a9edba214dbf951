use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_types::{Person, PersonId, TeamId};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::UnhandledError;

pub enum CreateOutcome {
    Created(Person),
    /// Another writer inserted a mapping for this distinct id first; the
    /// caller re-reads and converges on that person.
    AlreadyExists,
}

pub enum UpdateOutcome {
    Updated { version: i64 },
    /// The row's version moved under us; re-read and retry.
    VersionMismatch,
}

pub enum MergeOutcome {
    Merged(Person),
    VersionMismatch,
}

/// The relational operations the identity engine needs. The postgres
/// implementation is the production one; tests run the same logic over
/// an in-memory store.
///
/// Every mutation is version-guarded: concurrent writers are detected as
/// `VersionMismatch`/`AlreadyExists` outcomes rather than lost updates,
/// and the engine retries with fresh reads.
#[async_trait]
pub trait PersonStore: Send + Sync {
    async fn person_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, UnhandledError>;

    /// Insert a person plus its first distinct-id mapping, atomically.
    /// Loses gracefully if the mapping already exists.
    async fn create_person(
        &self,
        team_id: TeamId,
        distinct_id: &str,
        uuid: Uuid,
        created_at: DateTime<Utc>,
        properties: Value,
        is_identified: bool,
    ) -> Result<CreateOutcome, UnhandledError>;

    /// Returns false if the mapping already existed.
    async fn add_distinct_id(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        distinct_id: &str,
    ) -> Result<bool, UnhandledError>;

    async fn update_person(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        properties: Value,
        is_identified: bool,
        expected_version: i64,
    ) -> Result<UpdateOutcome, UnhandledError>;

    /// Reassign every one of the loser's distinct ids to the survivor,
    /// apply the merged property map, delete the loser. One transaction;
    /// `lock_order` fixes the row locking sequence (person ids sorted by
    /// their distinct-id strings) so concurrent merges can't deadlock.
    #[allow(clippy::too_many_arguments)]
    async fn merge_persons(
        &self,
        team_id: TeamId,
        survivor: &Person,
        loser: &Person,
        properties: Value,
        created_at: DateTime<Utc>,
        lock_order: &[PersonId],
    ) -> Result<MergeOutcome, UnhandledError>;
}

pub struct PostgresPersonStore {
    pool: PgPool,
}

impl PostgresPersonStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_person_version(
        tx: &mut Transaction<'_, Postgres>,
        team_id: TeamId,
        person_id: PersonId,
    ) -> Result<Option<i64>, UnhandledError> {
        let row = sqlx::query(
            "SELECT COALESCE(version, 0) AS version FROM posthog_person WHERE id = $1 AND team_id = $2 FOR UPDATE",
        )
        .bind(person_id)
        .bind(team_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("version")))
    }
}

const PERSON_RETURNING: &str = r#"
    RETURNING id, created_at, team_id, uuid, properties, is_identified, is_user_id, version, force_upgrade
"#;

#[async_trait]
impl PersonStore for PostgresPersonStore {
    async fn person_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, UnhandledError> {
        Ok(Person::from_distinct_id(&self.pool, team_id, distinct_id).await?)
    }

    async fn create_person(
        &self,
        team_id: TeamId,
        distinct_id: &str,
        uuid: Uuid,
        created_at: DateTime<Utc>,
        properties: Value,
        is_identified: bool,
    ) -> Result<CreateOutcome, UnhandledError> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            r#"
            INSERT INTO posthog_person
                (created_at, properties, is_identified, team_id, uuid, version, force_upgrade)
            VALUES ($1, $2, $3, $4, $5, 0, false)
            {PERSON_RETURNING}
            "#
        );
        let person = sqlx::query_as::<_, Person>(&query)
            .bind(created_at)
            .bind(&properties)
            .bind(is_identified)
            .bind(team_id)
            .bind(uuid)
            .fetch_one(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO posthog_persondistinctid (distinct_id, person_id, team_id, version)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (team_id, distinct_id) DO NOTHING
            "#,
        )
        .bind(distinct_id)
        .bind(person.id)
        .bind(team_id)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Lost the race for this distinct id; drop our person row and
            // let the caller converge on the winner's
            tx.rollback().await?;
            return Ok(CreateOutcome::AlreadyExists);
        }

        tx.commit().await?;
        Ok(CreateOutcome::Created(person))
    }

    async fn add_distinct_id(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        distinct_id: &str,
    ) -> Result<bool, UnhandledError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO posthog_persondistinctid (distinct_id, person_id, team_id, version)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (team_id, distinct_id) DO NOTHING
            "#,
        )
        .bind(distinct_id)
        .bind(person_id)
        .bind(team_id)
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() > 0)
    }

    async fn update_person(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        properties: Value,
        is_identified: bool,
        expected_version: i64,
    ) -> Result<UpdateOutcome, UnhandledError> {
        let row = sqlx::query(
            r#"
            UPDATE posthog_person
            SET properties = $1, is_identified = $2, version = COALESCE(version, 0) + 1
            WHERE id = $3 AND team_id = $4 AND COALESCE(version, 0) = $5
            RETURNING version
            "#,
        )
        .bind(&properties)
        .bind(is_identified)
        .bind(person_id)
        .bind(team_id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => UpdateOutcome::Updated {
                version: row.get::<i64, _>("version"),
            },
            None => UpdateOutcome::VersionMismatch,
        })
    }

    async fn merge_persons(
        &self,
        team_id: TeamId,
        survivor: &Person,
        loser: &Person,
        properties: Value,
        created_at: DateTime<Utc>,
        lock_order: &[PersonId],
    ) -> Result<MergeOutcome, UnhandledError> {
        let mut tx = self.pool.begin().await?;

        let mut locked = std::collections::HashMap::new();
        for person_id in lock_order {
            if let Some(version) = Self::lock_person_version(&mut tx, team_id, *person_id).await? {
                locked.insert(*person_id, version);
            }
        }

        let versions_match = locked.get(&survivor.id).copied()
            == Some(survivor.version.unwrap_or(0))
            && locked.get(&loser.id).copied() == Some(loser.version.unwrap_or(0));
        if !versions_match {
            tx.rollback().await?;
            return Ok(MergeOutcome::VersionMismatch);
        }

        let new_version = survivor.version.unwrap_or(0) + 1;
        let query = format!(
            r#"
            UPDATE posthog_person
            SET properties = $1, is_identified = true, created_at = $2, version = $3
            WHERE id = $4 AND team_id = $5
            {PERSON_RETURNING}
            "#
        );
        let merged = sqlx::query_as::<_, Person>(&query)
            .bind(&properties)
            .bind(created_at)
            .bind(new_version)
            .bind(survivor.id)
            .bind(team_id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE posthog_persondistinctid
            SET person_id = $1, version = COALESCE(version, 0) + 1
            WHERE person_id = $2 AND team_id = $3
            "#,
        )
        .bind(survivor.id)
        .bind(loser.id)
        .bind(team_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM posthog_person WHERE id = $1 AND team_id = $2")
            .bind(loser.id)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(MergeOutcome::Merged(merged))
    }
}
