use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, Utc};
use common_types::{format::parse_datetime_assuming_utc, PersonMode, PipelineEvent, Team};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::EventError,
    hub::Hub,
    pipeline::{DecodedEvent, PreparedEvent, SideEffects, StageResult},
    recursively_sanitize_properties, sanitize_string,
    teams::TeamKey,
};

const MAX_EVENT_NAME_LENGTH: usize = 200;
const MAX_DISTINCT_ID_LENGTH: usize = 200;
const COOKIELESS_SENTINEL: &str = "$posthog_cookieless";

// Events that only make sense when a person profile is being maintained
const PERSON_EVENTS: &[&str] = &[
    "$identify",
    "$create_alias",
    "$merge_dangerously",
    "$groupidentify",
];

pub fn decode_events(payloads: Vec<Vec<u8>>) -> Vec<DecodedEvent> {
    payloads
        .into_iter()
        .map(|payload| match serde_json::from_slice(&payload) {
            Ok(event) => DecodedEvent::Parsed(Box::new(event)),
            Err(e) => DecodedEvent::Malformed(e.to_string()),
        })
        .collect()
}

// Stamps team info onto each event and normalizes it: uuid and distinct
// id validation, event name cleanup, timestamp resolution, person
// processing determination. Anything invalid becomes a classified drop;
// recoverable oddities emit warnings and continue.
pub fn prepare_events(
    events: Vec<DecodedEvent>,
    teams_lut: HashMap<TeamKey, Option<Team>>,
    hub: &Hub,
    effects: &mut SideEffects,
) -> Vec<StageResult> {
    let now = Utc::now();
    let mut buffer = Vec::with_capacity(events.len());

    for event in events {
        let event = match event {
            DecodedEvent::Parsed(event) => *event,
            DecodedEvent::Malformed(reason) => {
                buffer.push(Err(EventError::Malformed(reason)));
                continue;
            }
        };

        let key = match (event.extract_token(), event.team_id) {
            (Some(token), _) => TeamKey::Token(token),
            (None, Some(id)) => TeamKey::Id(id),
            (None, None) => {
                buffer.push(Err(EventError::InvalidToken));
                continue;
            }
        };

        let Some(Some(team)) = teams_lut.get(&key) else {
            buffer.push(Err(EventError::InvalidToken));
            continue;
        };

        buffer.push(prepare_one(event, team.clone(), hub, now, effects));
    }

    buffer
}

fn prepare_one(
    mut event: PipelineEvent,
    team: Team,
    hub: &Hub,
    now: DateTime<Utc>,
    effects: &mut SideEffects,
) -> StageResult {
    let uuid = match &event.uuid {
        Some(raw) => match Uuid::parse_str(raw.trim()) {
            Ok(uuid) => uuid,
            Err(_) => {
                effects.warn(
                    team.id,
                    "invalid_event_uuid",
                    HashMap::from([("eventUuid".to_string(), json!(raw))]),
                    Some(now),
                );
                return Err(EventError::InvalidEventUuid(raw.clone()));
            }
        },
        // Capture stamps a uuid on every event, but internal producers
        // are allowed to omit it
        None => Uuid::now_v7(),
    };

    let Some(distinct_id) = event.extract_distinct_id() else {
        return Err(EventError::Malformed(
            "missing or invalid distinct_id".to_string(),
        ));
    };
    let distinct_id: String = sanitize_string(distinct_id)
        .chars()
        .take(MAX_DISTINCT_ID_LENGTH)
        .collect();

    if distinct_id == COOKIELESS_SENTINEL {
        // Cookieless hashing happens upstream; a sentinel reaching us
        // means the mode isn't active for this team
        return Err(EventError::CookielessFiltered);
    }

    event.event = clean_event_name(&event.event);
    if event.event.is_empty() {
        return Err(EventError::Malformed("empty event name".to_string()));
    }

    for value in event.properties.values_mut() {
        recursively_sanitize_properties(uuid, value, 0)?;
    }

    fold_set_properties(&mut event);

    let timestamp = resolve_timestamp(&event, uuid, team.id, now, hub, effects);

    let person_mode = resolve_person_mode(&event, &team, &distinct_id, uuid, hub, effects)?;
    if matches!(person_mode, PersonMode::Propertyless) {
        strip_person_properties(&mut event);
    }

    Ok(PreparedEvent {
        event,
        uuid,
        distinct_id,
        team,
        timestamp,
        person_mode,
        person: None,
    })
}

fn clean_event_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_EVENT_NAME_LENGTH)
        .collect()
}

// SDKs send $set/$set_once both at the top level and in properties; fold
// the top-level ones in, with the properties versions winning.
fn fold_set_properties(event: &mut PipelineEvent) {
    if let Some(set) = event.set.take() {
        let folded = match event.properties.remove("$set") {
            Some(Value::Object(existing)) => {
                let mut merged: serde_json::Map<String, Value> =
                    set.into_iter().collect();
                merged.extend(existing);
                Value::Object(merged)
            }
            Some(other) => other,
            None => Value::Object(set.into_iter().collect()),
        };
        event.properties.insert("$set".to_string(), folded);
    }

    if let Some(set_once) = event.set_once.take() {
        let folded = match event.properties.remove("$set_once") {
            Some(Value::Object(existing)) => {
                let mut merged: serde_json::Map<String, Value> =
                    set_once.into_iter().collect();
                merged.extend(existing);
                Value::Object(merged)
            }
            Some(other) => other,
            None => Value::Object(set_once.into_iter().collect()),
        };
        event.properties.insert("$set_once".to_string(), folded);
    }
}

// Timestamp precedence: the explicit timestamp field (skew-adjusted
// against sent_at when we have it), else now minus the client offset,
// else now. Unparseable inputs warn and fall through; future-dated
// results past the tolerance are clamped to now with a warning.
fn resolve_timestamp(
    event: &PipelineEvent,
    uuid: Uuid,
    team_id: i32,
    now: DateTime<Utc>,
    hub: &Hub,
    effects: &mut SideEffects,
) -> DateTime<Utc> {
    let ignore_sent_at = event
        .properties
        .get("$ignore_sent_at")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let sent_at = match (&event.sent_at, ignore_sent_at) {
        (Some(raw), false) => match parse_datetime_assuming_utc(raw) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                effects.warn(
                    team_id,
                    "ignored_invalid_timestamp",
                    HashMap::from([
                        ("eventUuid".to_string(), json!(uuid.to_string())),
                        ("field".to_string(), json!("sent_at")),
                        ("value".to_string(), json!(raw)),
                        ("reason".to_string(), json!(e.to_string())),
                    ]),
                    Some(now),
                );
                None
            }
        },
        _ => None,
    };

    let mut resolved = None;
    if let Some(raw) = &event.timestamp {
        match parse_datetime_assuming_utc(raw) {
            Ok(parsed) => {
                // With sent_at we can correct for client clock skew:
                // skew = sent_at - now, so the real instant is
                // now + (timestamp - sent_at)
                resolved = Some(match sent_at {
                    Some(sent_at) => now + parsed.signed_duration_since(sent_at),
                    None => parsed,
                });
            }
            Err(e) => {
                effects.warn(
                    team_id,
                    "ignored_invalid_timestamp",
                    HashMap::from([
                        ("eventUuid".to_string(), json!(uuid.to_string())),
                        ("field".to_string(), json!("timestamp")),
                        ("value".to_string(), json!(raw)),
                        ("reason".to_string(), json!(e.to_string())),
                    ]),
                    Some(now),
                );
            }
        }
    }

    let mut timestamp = match (resolved, event.offset) {
        (Some(ts), _) => ts,
        (None, Some(offset)) => now - Duration::milliseconds(offset),
        (None, None) => now,
    };

    let tolerance = Duration::milliseconds(hub.settings.timestamp_future_tolerance_ms);
    if timestamp > now + tolerance {
        effects.warn(
            team_id,
            "event_timestamp_in_future",
            HashMap::from([
                ("eventUuid".to_string(), json!(uuid.to_string())),
                ("timestamp".to_string(), json!(event.timestamp)),
                ("sentAt".to_string(), json!(event.sent_at)),
                ("offset".to_string(), json!(event.offset)),
                ("now".to_string(), json!(now.to_rfc3339())),
            ]),
            Some(now),
        );
        timestamp = now;
    }

    // Out-of-range years can't be represented in the analytical store
    if timestamp.year() < 0 || timestamp.year() > 9999 {
        timestamp = DateTime::UNIX_EPOCH;
    }

    timestamp
}

fn resolve_person_mode(
    event: &PipelineEvent,
    team: &Team,
    distinct_id: &str,
    uuid: Uuid,
    hub: &Hub,
    effects: &mut SideEffects,
) -> Result<PersonMode, EventError> {
    let event_opts_out = match event.properties.get("$process_person_profile") {
        Some(Value::Bool(process)) => !process,
        Some(other) => {
            effects.warn(
                team.id,
                "invalid_process_person_profile",
                HashMap::from([
                    ("eventUuid".to_string(), json!(uuid.to_string())),
                    ("processPersonProfile".to_string(), other.clone()),
                ]),
                None,
            );
            false
        }
        None => false,
    };

    let token = event.extract_token().unwrap_or_default();
    let disabled = team.person_processing_opt_out.unwrap_or(false)
        || event_opts_out
        || hub.personless_tokens.forces_personless(&token, distinct_id);

    if !disabled {
        return Ok(PersonMode::Full);
    }

    if PERSON_EVENTS.contains(&event.event.as_str()) {
        warn!(
            event = uuid.to_string(),
            team = team.id,
            "dropping {} event with person processing disabled",
            event.event
        );
        return Err(EventError::InvalidEventWhenProcessPersonProfileIsFalse(
            event.event.clone(),
        ));
    }

    Ok(PersonMode::Propertyless)
}

// Person property writes and group attribution make no sense on a
// propertyless event; remove them before any downstream step observes
// them.
fn strip_person_properties(event: &mut PipelineEvent) {
    event.properties.remove("$set");
    event.properties.remove("$set_once");
    event.properties.remove("$unset");
    event.properties.remove("$groups");
    event.properties.remove("$anon_distinct_id");
    event
        .properties
        .retain(|key, _| !is_group_index_key(key));
    event.set = None;
    event.set_once = None;
}

pub fn is_group_index_key(key: &str) -> bool {
    key.strip_prefix("$group_")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::personless::PersonlessTokens;
    use crate::testing::test_hub;

    fn base_team() -> Team {
        Team {
            id: 1,
            api_token: "phc_test".to_string(),
            ingested_event: true,
            ..Default::default()
        }
    }

    fn base_event() -> PipelineEvent {
        PipelineEvent {
            token: Some("phc_test".to_string()),
            uuid: Some(Uuid::now_v7().to_string()),
            event: "$pageview".to_string(),
            distinct_id: Some(json!("d1")),
            ..Default::default()
        }
    }

    #[test]
    fn event_name_is_cleaned() {
        assert_eq!(clean_event_name("  my event\u{0007}  "), "my event");
        let long = "x".repeat(500);
        assert_eq!(clean_event_name(&long).len(), MAX_EVENT_NAME_LENGTH);
    }

    #[test]
    fn group_index_keys_are_recognised() {
        assert!(is_group_index_key("$group_0"));
        assert!(is_group_index_key("$group_12"));
        assert!(!is_group_index_key("$group_"));
        assert!(!is_group_index_key("$groups"));
        assert!(!is_group_index_key("$group_abc"));
    }

    #[test]
    fn invalid_uuid_is_a_warned_drop() {
        let hub = test_hub();
        let mut effects = SideEffects::default();
        let mut event = base_event();
        event.uuid = Some("not-a-uuid".to_string());

        let result = prepare_one(event, base_team(), &hub, Utc::now(), &mut effects);
        assert!(matches!(result, Err(EventError::InvalidEventUuid(_))));
        assert_eq!(effects.warnings.len(), 1);
        assert_eq!(effects.warnings[0].warning_type, "invalid_event_uuid");
    }

    #[test]
    fn explicit_timestamp_wins_over_offset() {
        let hub = test_hub();
        let mut effects = SideEffects::default();
        let now = Utc::now();

        let mut event = base_event();
        event.timestamp = Some("2024-03-01T10:00:00Z".to_string());
        event.offset = Some(60_000);

        let ts = resolve_timestamp(&event, Uuid::now_v7(), 1, now, &hub, &mut effects);
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(effects.warnings.is_empty());
    }

    #[test]
    fn offset_is_subtracted_from_now() {
        let hub = test_hub();
        let mut effects = SideEffects::default();
        let now = Utc::now();

        let mut event = base_event();
        event.offset = Some(60_000);

        let ts = resolve_timestamp(&event, Uuid::now_v7(), 1, now, &hub, &mut effects);
        assert_eq!(ts, now - Duration::milliseconds(60_000));
    }

    #[test]
    fn invalid_timestamp_warns_and_falls_back_to_now() {
        let hub = test_hub();
        let mut effects = SideEffects::default();
        let now = Utc::now();

        let mut event = base_event();
        event.timestamp = Some("the day before yesterday".to_string());

        let ts = resolve_timestamp(&event, Uuid::now_v7(), 1, now, &hub, &mut effects);
        assert_eq!(ts, now);
        assert_eq!(effects.warnings.len(), 1);
        assert_eq!(
            effects.warnings[0].warning_type,
            "ignored_invalid_timestamp"
        );
    }

    #[test]
    fn far_future_timestamp_is_clamped_with_warning() {
        let hub = test_hub();
        let mut effects = SideEffects::default();
        let now = Utc::now();

        let mut event = base_event();
        event.timestamp = Some((now + Duration::days(30)).to_rfc3339());

        let ts = resolve_timestamp(&event, Uuid::now_v7(), 1, now, &hub, &mut effects);
        assert_eq!(ts, now);
        assert_eq!(effects.warnings.len(), 1);
        assert_eq!(
            effects.warnings[0].warning_type,
            "event_timestamp_in_future"
        );
    }

    #[test]
    fn sent_at_adjusts_for_clock_skew() {
        let hub = test_hub();
        let mut effects = SideEffects::default();
        let now = Utc::now();

        // Client clock runs 1h ahead: timestamp and sent_at are both
        // skewed, their difference is what matters
        let mut event = base_event();
        event.timestamp = Some((now + Duration::hours(1)).to_rfc3339());
        event.sent_at = Some((now + Duration::hours(1)).to_rfc3339());

        let ts = resolve_timestamp(&event, Uuid::now_v7(), 1, now, &hub, &mut effects);
        assert!((ts - now).num_milliseconds().abs() < 10);
        assert!(effects.warnings.is_empty());
    }

    #[test]
    fn team_opt_out_beats_event_opt_in() {
        let hub = test_hub();
        let mut effects = SideEffects::default();

        let mut team = base_team();
        team.person_processing_opt_out = Some(true);

        let mut event = base_event();
        event
            .properties
            .insert("$process_person_profile".to_string(), json!(true));

        let mode =
            resolve_person_mode(&event, &team, "d1", Uuid::now_v7(), &hub, &mut effects).unwrap();
        assert_eq!(mode, PersonMode::Propertyless);
    }

    #[test]
    fn identify_dropped_when_person_processing_disabled() {
        let hub = test_hub();
        let mut effects = SideEffects::default();

        let mut team = base_team();
        team.person_processing_opt_out = Some(true);

        let mut event = base_event();
        event.event = "$identify".to_string();

        let err =
            resolve_person_mode(&event, &team, "d1", Uuid::now_v7(), &hub, &mut effects)
                .unwrap_err();
        assert!(matches!(
            err,
            EventError::InvalidEventWhenProcessPersonProfileIsFalse(_)
        ));
        assert!(err.do_not_send_to_dlq());
    }

    #[test]
    fn non_bool_process_person_profile_warns_and_processes() {
        let hub = test_hub();
        let mut effects = SideEffects::default();

        let mut event = base_event();
        event
            .properties
            .insert("$process_person_profile".to_string(), json!("nope"));

        let mode = resolve_person_mode(
            &event,
            &base_team(),
            "d1",
            Uuid::now_v7(),
            &hub,
            &mut effects,
        )
        .unwrap();
        assert_eq!(mode, PersonMode::Full);
        assert_eq!(effects.warnings.len(), 1);
        assert_eq!(
            effects.warnings[0].warning_type,
            "invalid_process_person_profile"
        );
    }

    #[test]
    fn personless_tokens_force_propertyless() {
        let mut hub = test_hub();
        hub.personless_tokens = PersonlessTokens::parse("phc_test:d1");
        let mut effects = SideEffects::default();

        let mode = resolve_person_mode(
            &base_event(),
            &base_team(),
            "d1",
            Uuid::now_v7(),
            &hub,
            &mut effects,
        )
        .unwrap();
        assert_eq!(mode, PersonMode::Propertyless);
    }

    #[test]
    fn personless_events_are_stripped() {
        let mut event = base_event();
        event
            .properties
            .insert("$set".to_string(), json!({"a": 1}));
        event
            .properties
            .insert("$groups".to_string(), json!({"org": "o1"}));
        event.properties.insert("$group_0".to_string(), json!("o1"));
        event
            .properties
            .insert("plain".to_string(), json!("stays"));

        strip_person_properties(&mut event);
        assert!(!event.properties.contains_key("$set"));
        assert!(!event.properties.contains_key("$groups"));
        assert!(!event.properties.contains_key("$group_0"));
        assert_eq!(event.properties["plain"], json!("stays"));
    }
}
