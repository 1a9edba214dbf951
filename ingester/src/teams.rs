use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_types::{Team, TeamId};
use moka::future::{Cache, CacheBuilder};
use sqlx::PgPool;

use crate::{
    config::Config, error::UnhandledError, hub::Hub, needs_sanitization, pipeline::DecodedEvent,
    WithIndices,
};

/// How an event names its team: capture stamps a token, internal
/// producers stamp the numeric id directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TeamKey {
    Token(String),
    Id(TeamId),
}

#[async_trait]
pub trait TeamResolver: Send + Sync {
    async fn by_token(&self, token: &str) -> Result<Option<Team>, UnhandledError>;
    async fn by_id(&self, id: TeamId) -> Result<Option<Team>, UnhandledError>;
}

pub struct PostgresTeamResolver {
    pool: PgPool,
    by_token: Cache<String, Option<Team>>,
    by_id: Cache<TeamId, Option<Team>>,
}

impl PostgresTeamResolver {
    pub fn new(config: &Config, pool: PgPool) -> Self {
        // We cache "no team" results too, so unknown tokens don't hammer
        // the database. try_get_with gives single-flight refresh per key.
        let by_token = CacheBuilder::new(config.team_cache_max_size)
            .time_to_live(Duration::from_secs(config.team_cache_ttl_secs))
            .build();
        let by_id = CacheBuilder::new(config.team_cache_max_size)
            .time_to_live(Duration::from_secs(config.team_cache_ttl_secs))
            .build();

        Self {
            pool,
            by_token,
            by_id,
        }
    }
}

#[async_trait]
impl TeamResolver for PostgresTeamResolver {
    async fn by_token(&self, token: &str) -> Result<Option<Team>, UnhandledError> {
        // A token with embedded null bytes can never match a team, and
        // postgres would reject the string outright - fail the lookup,
        // not the process.
        if token.is_empty() || needs_sanitization(token) {
            return Ok(None);
        }

        let m_pool = self.pool.clone();
        let m_token = token.to_string();
        self.by_token
            .try_get_with(token.to_string(), async move {
                Team::load_by_token(&m_pool, &m_token).await
            })
            .await
            .map_err(|e: Arc<sqlx::Error>| UnhandledError::Other(e.to_string()))
    }

    async fn by_id(&self, id: TeamId) -> Result<Option<Team>, UnhandledError> {
        let m_pool = self.pool.clone();
        self.by_id
            .try_get_with(id, async move { Team::load(&m_pool, id).await })
            .await
            .map_err(|e: Arc<sqlx::Error>| UnhandledError::Other(e.to_string()))
    }
}

/// Resolve every team referenced by the batch, deduplicating lookups and
/// running them concurrently. Events that name neither a token nor a
/// team id simply get no entry; prep drops them as `invalid_token`.
pub async fn do_team_lookups(
    hub: Arc<Hub>,
    events: &[DecodedEvent],
) -> Result<HashMap<TeamKey, Option<Team>>, (usize, UnhandledError)> {
    let mut lookups: HashMap<TeamKey, WithIndices<Result<Option<Team>, UnhandledError>>> =
        HashMap::new();

    for (index, event) in events.iter().enumerate() {
        let DecodedEvent::Parsed(event) = event else {
            continue;
        };

        let key = match (event.extract_token(), event.team_id) {
            (Some(token), _) => TeamKey::Token(token),
            (None, Some(id)) => TeamKey::Id(id),
            (None, None) => continue,
        };

        if let Some(lookup) = lookups.get_mut(&key) {
            lookup.indices.push(index);
            continue;
        }

        let m_teams = hub.teams.clone();
        let m_key = key.clone();
        let fut = async move {
            match &m_key {
                TeamKey::Token(token) => m_teams.by_token(token).await,
                TeamKey::Id(id) => m_teams.by_id(*id).await,
            }
        };
        let lookup = WithIndices {
            indices: vec![index],
            inner: tokio::spawn(fut),
        };
        lookups.insert(key, lookup);
    }

    let mut results = HashMap::new();
    for (key, lookup) in lookups {
        let (indices, task) = (lookup.indices, lookup.inner);
        match task.await.expect("Task was not cancelled") {
            Ok(maybe_team) => results.insert(key, maybe_team),
            Err(err) => return Err((indices[0], err)),
        };
    }

    Ok(results)
}
