//! In-memory store implementations mirroring the postgres semantics,
//! so identity and group logic can be exercised without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_types::{Group, Person, PersonId, PipelineEvent, PersonMode, Team, TeamId};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::UnhandledError,
    hub::{Hub, PipelineSettings},
    personless::PersonlessTokens,
    pipeline::{
        groups::GroupStore,
        person_store::{CreateOutcome, MergeOutcome, PersonStore, UpdateOutcome},
        PreparedEvent,
    },
    teams::TeamResolver,
};

pub const TEST_TOKEN: &str = "phc_test";

#[derive(Default)]
pub struct MemoryTeamResolver {
    teams: Mutex<Vec<Team>>,
}

impl MemoryTeamResolver {
    pub fn with_team(team: Team) -> Self {
        Self {
            teams: Mutex::new(vec![team]),
        }
    }

    pub fn add_team(&self, team: Team) {
        self.teams.lock().unwrap().push(team);
    }
}

#[async_trait]
impl TeamResolver for MemoryTeamResolver {
    async fn by_token(&self, token: &str) -> Result<Option<Team>, UnhandledError> {
        if token.is_empty() || crate::needs_sanitization(token) {
            return Ok(None);
        }
        Ok(self
            .teams
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.api_token == token)
            .cloned())
    }

    async fn by_id(&self, id: TeamId) -> Result<Option<Team>, UnhandledError> {
        Ok(self
            .teams
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }
}

#[derive(Default)]
struct PersonsInner {
    next_id: PersonId,
    persons: HashMap<(TeamId, PersonId), Person>,
    mappings: HashMap<(TeamId, String), PersonId>,
}

#[derive(Default)]
pub struct MemoryPersonStore {
    inner: Mutex<PersonsInner>,
    // When non-zero, the next N version-guarded writes report a
    // mismatch, for exercising the bounded retry paths
    forced_conflicts: AtomicU64,
}

impl MemoryPersonStore {
    pub fn force_conflicts(&self, count: u64) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn person_count(&self, team_id: TeamId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .persons
            .keys()
            .filter(|(t, _)| *t == team_id)
            .count()
    }

    pub fn mapping_count(&self, team_id: TeamId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .mappings
            .keys()
            .filter(|(t, _)| *t == team_id)
            .count()
    }

    pub fn distinct_ids_of(&self, team_id: TeamId, person_uuid: Uuid) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let Some(person_id) = inner
            .persons
            .iter()
            .find(|((t, _), p)| *t == team_id && p.uuid == person_uuid)
            .map(|((_, id), _)| *id)
        else {
            return Vec::new();
        };
        let mut ids: Vec<String> = inner
            .mappings
            .iter()
            .filter(|((t, _), pid)| *t == team_id && **pid == person_id)
            .map(|((_, d), _)| d.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn set_force_upgrade(&self, team_id: TeamId, distinct_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(person_id) = inner.mappings.get(&(team_id, distinct_id.to_string())).copied()
        else {
            return;
        };
        if let Some(person) = inner.persons.get_mut(&(team_id, person_id)) {
            person.force_upgrade = true;
        }
    }
}

#[async_trait]
impl PersonStore for MemoryPersonStore {
    async fn person_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, UnhandledError> {
        let inner = self.inner.lock().unwrap();
        let Some(person_id) = inner.mappings.get(&(team_id, distinct_id.to_string())) else {
            return Ok(None);
        };
        Ok(inner.persons.get(&(team_id, *person_id)).cloned())
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
        let mut inner = self.inner.lock().unwrap();
        let mapping_key = (team_id, distinct_id.to_string());
        if inner.mappings.contains_key(&mapping_key) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        inner.next_id += 1;
        let person = Person {
            id: inner.next_id,
            created_at,
            team_id,
            uuid,
            properties,
            is_identified,
            is_user_id: None,
            version: Some(0),
            force_upgrade: false,
        };
        inner.persons.insert((team_id, person.id), person.clone());
        inner.mappings.insert(mapping_key, person.id);
        Ok(CreateOutcome::Created(person))
    }

    async fn add_distinct_id(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        distinct_id: &str,
    ) -> Result<bool, UnhandledError> {
        let mut inner = self.inner.lock().unwrap();
        let mapping_key = (team_id, distinct_id.to_string());
        if inner.mappings.contains_key(&mapping_key) {
            return Ok(false);
        }
        inner.mappings.insert(mapping_key, person_id);
        Ok(true)
    }

    async fn update_person(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        properties: Value,
        is_identified: bool,
        expected_version: i64,
    ) -> Result<UpdateOutcome, UnhandledError> {
        if self.take_forced_conflict() {
            return Ok(UpdateOutcome::VersionMismatch);
        }

        let mut inner = self.inner.lock().unwrap();
        let Some(person) = inner.persons.get_mut(&(team_id, person_id)) else {
            return Ok(UpdateOutcome::VersionMismatch);
        };
        if person.version.unwrap_or(0) != expected_version {
            return Ok(UpdateOutcome::VersionMismatch);
        }

        person.properties = properties;
        person.is_identified = is_identified;
        let version = expected_version + 1;
        person.version = Some(version);
        Ok(UpdateOutcome::Updated { version })
    }

    async fn merge_persons(
        &self,
        team_id: TeamId,
        survivor: &Person,
        loser: &Person,
        properties: Value,
        created_at: DateTime<Utc>,
        _lock_order: &[PersonId],
    ) -> Result<MergeOutcome, UnhandledError> {
        if self.take_forced_conflict() {
            return Ok(MergeOutcome::VersionMismatch);
        }

        let mut inner = self.inner.lock().unwrap();

        let versions_match = inner
            .persons
            .get(&(team_id, survivor.id))
            .is_some_and(|p| p.version.unwrap_or(0) == survivor.version.unwrap_or(0))
            && inner
                .persons
                .get(&(team_id, loser.id))
                .is_some_and(|p| p.version.unwrap_or(0) == loser.version.unwrap_or(0));
        if !versions_match {
            return Ok(MergeOutcome::VersionMismatch);
        }

        for person_id in inner.mappings.values_mut() {
            if *person_id == loser.id {
                *person_id = survivor.id;
            }
        }
        inner.persons.remove(&(team_id, loser.id));

        let merged = inner
            .persons
            .get_mut(&(team_id, survivor.id))
            .expect("survivor row is present");
        merged.properties = properties;
        merged.is_identified = true;
        merged.created_at = created_at;
        merged.version = Some(survivor.version.unwrap_or(0) + 1);

        Ok(MergeOutcome::Merged(merged.clone()))
    }
}

#[derive(Default)]
struct GroupsInner {
    type_indexes: HashMap<(TeamId, String), i32>,
    groups: HashMap<(TeamId, i32, String), Group>,
}

#[derive(Default)]
pub struct MemoryGroupStore {
    inner: Mutex<GroupsInner>,
}

impl MemoryGroupStore {
    pub fn group(&self, team_id: TeamId, type_index: i32, key: &str) -> Option<Group> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .get(&(team_id, type_index, key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn resolve_group_type_index(
        &self,
        team_id: TeamId,
        _project_id: i64,
        group_type: &str,
        cap: i32,
    ) -> Result<Option<i32>, UnhandledError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.type_indexes.get(&(team_id, group_type.to_string())) {
            return Ok(Some(*index));
        }

        let used: Vec<i32> = inner
            .type_indexes
            .iter()
            .filter(|((t, _), _)| *t == team_id)
            .map(|(_, index)| *index)
            .collect();
        let free = (0..cap).find(|candidate| !used.contains(candidate));

        if let Some(index) = free {
            inner
                .type_indexes
                .insert((team_id, group_type.to_string()), index);
            return Ok(Some(index));
        }
        Ok(None)
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
        let mut inner = self.inner.lock().unwrap();
        let key = (team_id, group_type_index, group_key.to_string());

        if let Some(group) = inner.groups.get_mut(&key) {
            let mut props = match &group.group_properties {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            for (k, v) in &set_once {
                props.entry(k.clone()).or_insert(v.clone());
            }
            for (k, v) in &set {
                props.insert(k.clone(), v.clone());
            }
            group.group_properties = Value::Object(props);
            group.version += 1;
            return Ok(group.clone());
        }

        let mut props = set_once;
        props.extend(set);
        let group = Group {
            team_id,
            group_type_index,
            group_key: group_key.to_string(),
            group_properties: Value::Object(props),
            created_at: timestamp,
            version: 0,
        };
        inner.groups.insert(key, group.clone());
        Ok(group)
    }
}

pub fn test_team() -> Team {
    Team {
        id: 1,
        api_token: TEST_TOKEN.to_string(),
        ingested_event: true,
        ..Default::default()
    }
}

/// A hub wired to in-memory stores and default settings, with a single
/// team registered under [`TEST_TOKEN`].
pub fn test_hub() -> Hub {
    Hub {
        teams: Arc::new(MemoryTeamResolver::with_team(test_team())),
        persons: Arc::new(MemoryPersonStore::default()),
        groups: Arc::new(MemoryGroupStore::default()),
        personless_tokens: PersonlessTokens::default(),
        transformations: Vec::new(),
        settings: PipelineSettings {
            person_resolution_retry_max: 5,
            max_group_types_per_team: 5,
            timestamp_future_tolerance_ms: 82_800_000,
        },
    }
}

pub fn test_event(name: &str, distinct_id: &str) -> PipelineEvent {
    PipelineEvent {
        token: Some(TEST_TOKEN.to_string()),
        uuid: Some(Uuid::now_v7().to_string()),
        event: name.to_string(),
        distinct_id: Some(json!(distinct_id)),
        ..Default::default()
    }
}

/// Skips prep for unit tests that start mid-pipeline.
pub fn to_prepared(event: PipelineEvent) -> PreparedEvent {
    let uuid = event
        .uuid
        .as_deref()
        .and_then(|u| Uuid::parse_str(u).ok())
        .unwrap_or_else(Uuid::now_v7);
    let distinct_id = event
        .extract_distinct_id()
        .expect("test events carry a distinct id");

    PreparedEvent {
        event,
        uuid,
        distinct_id,
        team: test_team(),
        timestamp: Utc::now(),
        person_mode: PersonMode::Full,
        person: None,
    }
}
