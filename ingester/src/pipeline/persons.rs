use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_types::{format::format_ch_datetime, Person, PersonId, PersonMode, TeamId};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{PipelineFailure, UnhandledError},
    hub::Hub,
    metric_consts::{PERSONS_CREATED, PERSONS_MERGED, PERSON_UPDATE_CONFLICTS},
    pipeline::{
        person_store::{CreateOutcome, MergeOutcome, PersonStore, UpdateOutcome},
        PersonSnapshot, SideEffects, StageResult,
    },
};

// A person row change bound for the persons topic, mirroring the
// analytical store's person table schema.
#[derive(Debug, Clone, Serialize)]
pub struct PersonUpdate {
    pub id: String,
    pub team_id: TeamId,
    pub properties: String,
    pub is_identified: bool,
    pub created_at: String,
    pub version: i64,
    pub is_deleted: u8,
}

impl PersonUpdate {
    fn update_of(person: &Person) -> Self {
        Self {
            id: person.uuid.to_string(),
            team_id: person.team_id,
            properties: person.properties.to_string(),
            is_identified: person.is_identified,
            created_at: format_ch_datetime(person.created_at),
            version: person.version.unwrap_or(0),
            is_deleted: 0,
        }
    }

    fn delete_of(person: &Person) -> Self {
        Self {
            id: person.uuid.to_string(),
            team_id: person.team_id,
            properties: person.properties.to_string(),
            is_identified: person.is_identified,
            created_at: format_ch_datetime(person.created_at),
            // The delete must win over any in-flight update of the losing
            // row when the analytical store collapses by version
            version: person.version.unwrap_or(0) + 100,
            is_deleted: 1,
        }
    }
}

// $set overwrites, $set_once only fills absent keys, $unset removes.
#[derive(Debug, Clone, Default)]
pub struct PropertyOps {
    set: serde_json::Map<String, Value>,
    set_once: serde_json::Map<String, Value>,
    unset: Vec<String>,
}

impl PropertyOps {
    pub fn from_properties(properties: &std::collections::HashMap<String, Value>) -> Self {
        let as_map = |key: &str| match properties.get(key) {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        let unset = match properties.get("$unset") {
            Some(Value::Array(keys)) => keys
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        };

        Self {
            set: as_map("$set"),
            set_once: as_map("$set_once"),
            unset,
        }
    }

    /// Apply to an existing property map, reporting whether anything
    /// actually changed (no change means no version bump).
    pub fn apply(&self, props: &mut serde_json::Map<String, Value>) -> bool {
        let mut changed = false;

        for (key, value) in &self.set_once {
            if !props.contains_key(key) {
                props.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        for (key, value) in &self.set {
            if props.get(key) != Some(value) {
                props.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        for key in &self.unset {
            changed |= props.remove(key).is_some();
        }

        changed
    }

    /// The property map for a brand-new person.
    pub fn initial_properties(&self) -> serde_json::Map<String, Value> {
        let mut props = self.set_once.clone();
        props.extend(self.set.clone());
        for key in &self.unset {
            props.remove(key);
        }
        props
    }
}

/// Runs identity resolution for each event in the batch, in order.
/// Events sharing a distinct id within a batch observe each other's
/// writes because processing is sequential per batch, and the bus is
/// partitioned by distinct id across batches.
pub async fn resolve_persons(
    mut events: Vec<StageResult>,
    hub: Arc<Hub>,
    effects: &mut SideEffects,
) -> Result<Vec<StageResult>, PipelineFailure> {
    for (index, slot) in events.iter_mut().enumerate() {
        let Ok(prepared) = slot else {
            continue;
        };
        if prepared.is_heatmap_fast_path() || !prepared.person_processing_enabled() {
            continue;
        }

        let state = PersonState {
            store: hub.persons.as_ref(),
            team_id: prepared.team.id,
            distinct_id: prepared.distinct_id.clone(),
            timestamp: prepared.timestamp,
            ops: PropertyOps::from_properties(&prepared.event.properties),
            max_attempts: hub.settings.person_resolution_retry_max,
        };

        match state
            .process(&prepared.event.event, &prepared.event.properties, effects)
            .await
        {
            Ok(snapshot) => {
                prepared.person_mode = snapshot.mode;
                prepared.person = Some(snapshot);
            }
            Err(error) => return Err((index, error).into()),
        }
    }

    Ok(events)
}

struct PersonState<'a> {
    store: &'a dyn PersonStore,
    team_id: TeamId,
    distinct_id: String,
    timestamp: DateTime<Utc>,
    ops: PropertyOps,
    max_attempts: u64,
}

impl PersonState<'_> {
    async fn process(
        &self,
        event_name: &str,
        properties: &std::collections::HashMap<String, Value>,
        effects: &mut SideEffects,
    ) -> Result<PersonSnapshot, UnhandledError> {
        let other = match event_name {
            "$identify" => properties.get("$anon_distinct_id").and_then(Value::as_str),
            "$create_alias" | "$merge_dangerously" => {
                properties.get("alias").and_then(Value::as_str)
            }
            _ => None,
        };
        let identifies = matches!(
            event_name,
            "$identify" | "$create_alias" | "$merge_dangerously"
        );

        match other {
            // Equal endpoints are a no-op merge; fall through to a plain
            // identified update
            Some(other) if other != self.distinct_id => {
                self.merge(other.to_string(), effects).await
            }
            _ => self.update(identifies, effects).await,
        }
    }

    /// Ensure a person exists for the event's distinct id and apply the
    /// event's property operations, converging with concurrent writers
    /// through bounded re-read-and-retry.
    async fn update(
        &self,
        identify: bool,
        effects: &mut SideEffects,
    ) -> Result<PersonSnapshot, UnhandledError> {
        for _ in 0..=self.max_attempts {
            match self
                .store
                .person_by_distinct_id(self.team_id, &self.distinct_id)
                .await?
            {
                None => {
                    match self
                        .store
                        .create_person(
                            self.team_id,
                            &self.distinct_id,
                            Uuid::new_v4(),
                            self.timestamp,
                            Value::Object(self.ops.initial_properties()),
                            identify,
                        )
                        .await?
                    {
                        CreateOutcome::Created(person) => {
                            counter!(PERSONS_CREATED).increment(1);
                            effects.person_updates.push(PersonUpdate::update_of(&person));
                            return Ok(snapshot(&person, PersonMode::Full));
                        }
                        // Someone else created the mapping first
                        CreateOutcome::AlreadyExists => continue,
                    }
                }
                Some(person) if person.force_upgrade => {
                    return Ok(snapshot(&person, PersonMode::ForceUpgrade));
                }
                Some(person) => match self.apply_ops(&person, identify, effects).await? {
                    Some(snapshot) => return Ok(snapshot),
                    None => continue,
                },
            }
        }

        counter!(PERSON_UPDATE_CONFLICTS).increment(1);
        Err(UnhandledError::PersonUpdateConflict {
            team_id: self.team_id,
            distinct_id: self.distinct_id.clone(),
        })
    }

    /// Link the event's distinct id and `other` to a single person,
    /// merging their persons if they currently differ.
    async fn merge(
        &self,
        other: String,
        effects: &mut SideEffects,
    ) -> Result<PersonSnapshot, UnhandledError> {
        for _ in 0..=self.max_attempts {
            let primary = self
                .store
                .person_by_distinct_id(self.team_id, &self.distinct_id)
                .await?;
            let secondary = self.store.person_by_distinct_id(self.team_id, &other).await?;

            match (primary, secondary) {
                (None, None) => {
                    match self
                        .store
                        .create_person(
                            self.team_id,
                            &self.distinct_id,
                            Uuid::new_v4(),
                            self.timestamp,
                            Value::Object(self.ops.initial_properties()),
                            true,
                        )
                        .await?
                    {
                        CreateOutcome::Created(person) => {
                            counter!(PERSONS_CREATED).increment(1);
                            if !self
                                .store
                                .add_distinct_id(self.team_id, person.id, &other)
                                .await?
                            {
                                // The other id got mapped concurrently;
                                // re-read and merge properly
                                continue;
                            }
                            effects.person_updates.push(PersonUpdate::update_of(&person));
                            return Ok(snapshot(&person, PersonMode::Full));
                        }
                        CreateOutcome::AlreadyExists => continue,
                    }
                }
                (Some(person), None) => {
                    if person.force_upgrade {
                        return Ok(snapshot(&person, PersonMode::ForceUpgrade));
                    }
                    if !self
                        .store
                        .add_distinct_id(self.team_id, person.id, &other)
                        .await?
                    {
                        continue;
                    }
                    match self.apply_ops(&person, true, effects).await? {
                        Some(snapshot) => return Ok(snapshot),
                        None => continue,
                    }
                }
                (None, Some(person)) => {
                    if person.force_upgrade {
                        return Ok(snapshot(&person, PersonMode::ForceUpgrade));
                    }
                    if !self
                        .store
                        .add_distinct_id(self.team_id, person.id, &self.distinct_id)
                        .await?
                    {
                        continue;
                    }
                    match self.apply_ops(&person, true, effects).await? {
                        Some(snapshot) => return Ok(snapshot),
                        None => continue,
                    }
                }
                (Some(a), Some(b)) if a.id == b.id => {
                    // Already merged (or a repeat of a completed merge)
                    if a.force_upgrade {
                        return Ok(snapshot(&a, PersonMode::ForceUpgrade));
                    }
                    match self.apply_ops(&a, true, effects).await? {
                        Some(snapshot) => return Ok(snapshot),
                        None => continue,
                    }
                }
                (Some(a), Some(b)) => {
                    if a.force_upgrade || b.force_upgrade {
                        return Ok(snapshot(&a, PersonMode::ForceUpgrade));
                    }

                    // Lock rows in distinct-id order so two merges
                    // touching the same persons can't deadlock
                    let mut pairs = [
                        (self.distinct_id.as_str(), a.id),
                        (other.as_str(), b.id),
                    ];
                    pairs.sort_by(|x, y| x.0.cmp(y.0));
                    let lock_order: Vec<PersonId> = pairs.iter().map(|p| p.1).collect();

                    let (survivor, loser) = choose_survivor(a, b);

                    let mut merged_props = loser.properties_object();
                    merged_props.extend(survivor.properties_object());
                    let created_at = survivor.created_at.min(loser.created_at);

                    match self
                        .store
                        .merge_persons(
                            self.team_id,
                            &survivor,
                            &loser,
                            Value::Object(merged_props),
                            created_at,
                            &lock_order,
                        )
                        .await?
                    {
                        MergeOutcome::Merged(person) => {
                            counter!(PERSONS_MERGED).increment(1);
                            effects.person_updates.push(PersonUpdate::update_of(&person));
                            effects.person_updates.push(PersonUpdate::delete_of(&loser));

                            match self.apply_ops(&person, true, effects).await? {
                                Some(snapshot) => return Ok(snapshot),
                                // The merge landed; the retry re-reads
                                // and hits the already-merged path
                                None => continue,
                            }
                        }
                        MergeOutcome::VersionMismatch => continue,
                    }
                }
            }
        }

        counter!(PERSON_UPDATE_CONFLICTS).increment(1);
        Err(UnhandledError::PersonUpdateConflict {
            team_id: self.team_id,
            distinct_id: self.distinct_id.clone(),
        })
    }

    /// One optimistic write attempt. `None` means the version moved and
    /// the caller should re-read and retry.
    async fn apply_ops(
        &self,
        person: &Person,
        identify: bool,
        effects: &mut SideEffects,
    ) -> Result<Option<PersonSnapshot>, UnhandledError> {
        let mut props = person.properties_object();
        let changed = self.ops.apply(&mut props);
        let is_identified = person.is_identified || identify;

        if !changed && is_identified == person.is_identified {
            return Ok(Some(PersonSnapshot {
                uuid: person.uuid,
                created_at: person.created_at,
                properties: props,
                mode: PersonMode::Full,
            }));
        }

        match self
            .store
            .update_person(
                self.team_id,
                person.id,
                Value::Object(props.clone()),
                is_identified,
                person.version.unwrap_or(0),
            )
            .await?
        {
            UpdateOutcome::Updated { version } => {
                let updated = Person {
                    properties: Value::Object(props.clone()),
                    is_identified,
                    version: Some(version),
                    ..person.clone()
                };
                effects.person_updates.push(PersonUpdate::update_of(&updated));
                Ok(Some(PersonSnapshot {
                    uuid: person.uuid,
                    created_at: person.created_at,
                    properties: props,
                    mode: PersonMode::Full,
                }))
            }
            UpdateOutcome::VersionMismatch => Ok(None),
        }
    }
}

// Survivor selection: most identified, then oldest, then smallest uuid.
fn choose_survivor(a: Person, b: Person) -> (Person, Person) {
    let a_wins = match (a.is_identified, b.is_identified) {
        (true, false) => true,
        (false, true) => false,
        _ => match a.created_at.cmp(&b.created_at) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a.uuid <= b.uuid,
        },
    };

    if a_wins {
        (a, b)
    } else {
        (b, a)
    }
}

fn snapshot(person: &Person, mode: PersonMode) -> PersonSnapshot {
    PersonSnapshot {
        uuid: person.uuid,
        created_at: person.created_at,
        properties: person.properties_object(),
        mode,
    }
}
