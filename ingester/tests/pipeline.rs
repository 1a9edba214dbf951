use std::sync::Arc;

use common_types::{PersonMode, PipelineEvent, Team};
use ingester::{
    error::{EventError, UnhandledError},
    hub::Hub,
    pipeline::{handle_batch, person_store::PersonStore, PipelineOutput, SideEffects},
    testing::{test_event, test_hub, MemoryGroupStore, MemoryPersonStore, MemoryTeamResolver},
};
use serde_json::{json, Value};

const OPTED_OUT_TOKEN: &str = "phc_optout";

struct Fixture {
    hub: Arc<Hub>,
    persons: Arc<MemoryPersonStore>,
    groups: Arc<MemoryGroupStore>,
}

fn fixture() -> Fixture {
    let mut hub = test_hub();

    let persons = Arc::new(MemoryPersonStore::default());
    let groups = Arc::new(MemoryGroupStore::default());
    hub.persons = persons.clone();
    hub.groups = groups.clone();

    let teams = MemoryTeamResolver::with_team(ingester::testing::test_team());
    teams.add_team(Team {
        id: 2,
        api_token: OPTED_OUT_TOKEN.to_string(),
        person_processing_opt_out: Some(true),
        ingested_event: true,
        ..Default::default()
    });
    hub.teams = Arc::new(teams);

    Fixture {
        hub: Arc::new(hub),
        persons,
        groups,
    }
}

async fn run(hub: &Arc<Hub>, events: Vec<PipelineEvent>) -> (Vec<PipelineOutput>, SideEffects) {
    let payloads = events
        .iter()
        .map(|e| serde_json::to_vec(e).unwrap())
        .collect();
    handle_batch(payloads, hub.clone())
        .await
        .expect("batch should not fail")
}

fn enriched(output: &PipelineOutput) -> &common_types::ClickHouseEvent {
    output
        .as_ref()
        .expect("expected a produced event")
        .as_ref()
        .expect("expected an enriched record")
}

fn person_props(output: &PipelineOutput) -> Value {
    serde_json::from_str(enriched(output).person_properties.as_ref().unwrap()).unwrap()
}

fn event_props(output: &PipelineOutput) -> Value {
    serde_json::from_str(enriched(output).properties.as_ref().unwrap()).unwrap()
}

#[tokio::test]
async fn anonymous_pageview_creates_a_person() {
    let f = fixture();
    let event = test_event("$pageview", "d1");
    let input_uuid = event.uuid.clone().unwrap();

    let (outputs, _) = run(&f.hub, vec![event]).await;

    let record = enriched(&outputs[0]);
    assert_eq!(record.uuid.to_string(), input_uuid);
    assert_eq!(record.distinct_id, "d1");
    assert_eq!(record.person_mode, PersonMode::Full);
    assert!(record.person_id.is_some());
    assert!(record.person_created_at.is_some());

    let person = f.persons.person_by_distinct_id(1, "d1").await.unwrap().unwrap();
    assert!(!person.is_identified);
    assert_eq!(person.uuid.to_string(), record.person_id.clone().unwrap());
}

#[tokio::test]
async fn identify_links_anon_and_user_ids() {
    let f = fixture();

    let (outputs, _) = run(&f.hub, vec![test_event("$pageview", "d1")]).await;
    let anon_person_id = enriched(&outputs[0]).person_id.clone().unwrap();

    let mut identify = test_event("$identify", "user@x");
    identify
        .properties
        .insert("$anon_distinct_id".to_string(), json!("d1"));
    identify
        .properties
        .insert("$set".to_string(), json!({"plan": "pro"}));

    let (outputs, _) = run(&f.hub, vec![identify]).await;

    // Both ids now resolve to the same person
    let by_anon = f.persons.person_by_distinct_id(1, "d1").await.unwrap().unwrap();
    let by_user = f
        .persons
        .person_by_distinct_id(1, "user@x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_anon.id, by_user.id);
    assert!(by_user.is_identified);
    assert_eq!(by_user.uuid.to_string(), anon_person_id);

    // The enriched output reflects the post-$set person state
    assert_eq!(person_props(&outputs[0])["plan"], json!("pro"));
    assert_eq!(f.persons.person_count(1), 1);
    assert_eq!(f.persons.mapping_count(1), 2);
}

#[tokio::test]
async fn cross_person_merge_keeps_one_survivor() {
    let f = fixture();

    run(
        &f.hub,
        vec![test_event("$pageview", "d1"), test_event("$pageview", "d2")],
    )
    .await;
    assert_eq!(f.persons.person_count(1), 2);

    let mut identify = test_event("$identify", "d2");
    identify
        .properties
        .insert("$anon_distinct_id".to_string(), json!("d1"));

    let (_, effects) = run(&f.hub, vec![identify]).await;

    // The loser is deleted and every distinct id points at the survivor
    assert_eq!(f.persons.person_count(1), 1);
    let survivor = f.persons.person_by_distinct_id(1, "d1").await.unwrap().unwrap();
    let ids = f.persons.distinct_ids_of(1, survivor.uuid);
    assert_eq!(ids, vec!["d1".to_string(), "d2".to_string()]);
    assert!(survivor.is_identified);

    // A delete record went downstream for the losing person
    assert!(effects.person_updates.iter().any(|u| u.is_deleted == 1));
}

#[tokio::test]
async fn replaying_an_event_converges_to_the_same_state() {
    let f = fixture();

    let mut identify = test_event("$identify", "user@x");
    identify
        .properties
        .insert("$anon_distinct_id".to_string(), json!("d1"));
    identify
        .properties
        .insert("$set".to_string(), json!({"plan": "pro"}));

    for _ in 0..3 {
        run(&f.hub, vec![identify.clone()]).await;
    }

    let person = f
        .persons
        .person_by_distinct_id(1, "user@x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(f.persons.person_count(1), 1);
    assert_eq!(f.persons.mapping_count(1), 2);
    assert_eq!(person.properties["plan"], json!("pro"));
    assert!(person.is_identified);
}

#[tokio::test]
async fn identify_chains_converge_regardless_of_order() {
    async fn run_chain(first: (&str, &str), second: (&str, &str)) -> Vec<String> {
        let f = fixture();
        for (user, anon) in [first, second] {
            let mut identify = test_event("$identify", user);
            identify
                .properties
                .insert("$anon_distinct_id".to_string(), json!(anon));
            run(&f.hub, vec![identify]).await;
        }
        assert_eq!(f.persons.person_count(1), 1);
        let person = f
            .persons
            .person_by_distinct_id(1, first.0)
            .await
            .unwrap()
            .unwrap();
        f.persons.distinct_ids_of(1, person.uuid)
    }

    // A<-B then B<-C, and the reverse legal ordering, end with the same
    // distinct id set on a single person
    let forward = run_chain(("b", "a"), ("c", "b")).await;
    let reverse = run_chain(("c", "b"), ("b", "a")).await;
    assert_eq!(forward, vec!["a", "b", "c"]);
    assert_eq!(forward, reverse);
}

#[tokio::test]
async fn merge_cycles_are_noops() {
    let f = fixture();

    let mut forward = test_event("$identify", "b");
    forward
        .properties
        .insert("$anon_distinct_id".to_string(), json!("a"));
    let mut backward = test_event("$identify", "a");
    backward
        .properties
        .insert("$anon_distinct_id".to_string(), json!("b"));

    run(&f.hub, vec![forward, backward]).await;

    assert_eq!(f.persons.person_count(1), 1);
    assert_eq!(f.persons.mapping_count(1), 2);
}

#[tokio::test]
async fn property_precedence_holds_across_events() {
    let f = fixture();

    let mut first = test_event("$pageview", "d1");
    first.properties.insert(
        "$set".to_string(),
        json!({"plan": "free", "doomed": "yes"}),
    );
    first
        .properties
        .insert("$set_once".to_string(), json!({"first_seen": "monday"}));

    let mut second = test_event("$pageview", "d1");
    second
        .properties
        .insert("$set".to_string(), json!({"plan": "pro"}));
    second.properties.insert(
        "$set_once".to_string(),
        json!({"first_seen": "tuesday", "origin": "ad"}),
    );
    second
        .properties
        .insert("$unset".to_string(), json!(["doomed"]));

    let (outputs, _) = run(&f.hub, vec![first, second]).await;

    let props = person_props(&outputs[1]);
    assert_eq!(props["plan"], json!("pro")); // $set overwrites
    assert_eq!(props["first_seen"], json!("monday")); // $set_once never does
    assert_eq!(props["origin"], json!("ad")); // $set_once fills holes
    assert!(props.get("doomed").is_none()); // $unset removes
}

#[tokio::test]
async fn group_type_cap_leaves_excess_types_unindexed() {
    let f = fixture();

    let mut event = test_event("$pageview", "d1");
    let groups: serde_json::Map<String, Value> = (0..6)
        .map(|i| (format!("type_{i}"), json!(format!("key_{i}"))))
        .collect();
    event
        .properties
        .insert("$groups".to_string(), Value::Object(groups));

    let (outputs, _) = run(&f.hub, vec![event]).await;
    let props = event_props(&outputs[0]);

    let indexed: Vec<&String> = props
        .as_object()
        .unwrap()
        .keys()
        .filter(|k| k.starts_with("$group_") && !k.starts_with("$groups"))
        .collect();
    // Five types got indexes, the sixth resolved to "no index"
    assert_eq!(indexed.len(), 5);
}

#[tokio::test]
async fn groupidentify_upserts_and_bumps_versions() {
    let f = fixture();

    let mut first = test_event("$groupidentify", "d1");
    first
        .properties
        .insert("$group_type".to_string(), json!("organization"));
    first
        .properties
        .insert("$group_key".to_string(), json!("acme"));
    first
        .properties
        .insert("$group_set".to_string(), json!({"plan": "free"}));
    first.properties.insert(
        "$group_set_once".to_string(),
        json!({"founded": "2020"}),
    );

    let mut second = first.clone();
    second
        .properties
        .insert("$group_set".to_string(), json!({"plan": "pro"}));
    second.properties.insert(
        "$group_set_once".to_string(),
        json!({"founded": "1999"}),
    );

    let (_, effects) = run(&f.hub, vec![first, second]).await;

    let group = f.groups.group(1, 0, "acme").unwrap();
    assert_eq!(group.version, 1);
    assert_eq!(group.group_properties["plan"], json!("pro"));
    assert_eq!(group.group_properties["founded"], json!("2020"));
    assert_eq!(effects.group_updates.len(), 2);
}

#[tokio::test]
async fn personless_events_are_propertyless_with_no_group_keys() {
    let f = fixture();

    let mut event = test_event("$pageview", "d1");
    event.token = Some(OPTED_OUT_TOKEN.to_string());
    event
        .properties
        .insert("$set".to_string(), json!({"plan": "pro"}));
    event
        .properties
        .insert("$groups".to_string(), json!({"organization": "acme"}));

    let (outputs, _) = run(&f.hub, vec![event]).await;

    let record = enriched(&outputs[0]);
    assert_eq!(record.person_mode, PersonMode::Propertyless);
    assert_eq!(record.person_properties.as_deref(), Some("{}"));
    assert!(record.person_id.is_none());

    let props = event_props(&outputs[0]);
    let obj = props.as_object().unwrap();
    assert!(!obj.contains_key("$set"));
    assert!(!obj.keys().any(|k| k.starts_with("$group_")));

    // And no person was created
    assert_eq!(f.persons.person_count(2), 0);
}

#[tokio::test]
async fn identify_dropped_for_opted_out_team() {
    let f = fixture();

    let mut identify = test_event("$identify", "user@x");
    identify.token = Some(OPTED_OUT_TOKEN.to_string());
    identify
        .properties
        .insert("$anon_distinct_id".to_string(), json!("d1"));

    let (outputs, _) = run(&f.hub, vec![identify]).await;

    match &outputs[0] {
        Err(e @ EventError::InvalidEventWhenProcessPersonProfileIsFalse(_)) => {
            assert!(e.do_not_send_to_dlq());
        }
        other => panic!("expected person-profile drop, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_token_and_team_id_is_invalid_token() {
    let f = fixture();

    let mut event = test_event("$pageview", "d1");
    event.token = None;

    let (outputs, _) = run(&f.hub, vec![event]).await;
    assert!(matches!(outputs[0], Err(EventError::InvalidToken)));
}

#[tokio::test]
async fn null_byte_token_drops_without_crashing() {
    let f = fixture();

    let mut event = test_event("$pageview", "d1");
    event.token = Some("phc_\u{0000}evil".to_string());

    let (outputs, _) = run(&f.hub, vec![event]).await;
    assert!(matches!(outputs[0], Err(EventError::InvalidToken)));
}

#[tokio::test]
async fn invalid_uuid_is_dropped_with_warning() {
    let f = fixture();

    let mut event = test_event("$pageview", "d1");
    event.uuid = Some("not-a-uuid".to_string());

    let (outputs, effects) = run(&f.hub, vec![event]).await;
    assert!(matches!(outputs[0], Err(EventError::InvalidEventUuid(_))));
    assert!(effects
        .warnings
        .iter()
        .any(|w| w.warning_type == "invalid_event_uuid"));
}

#[tokio::test]
async fn malformed_payloads_are_classified_not_fatal() {
    let f = fixture();

    let payloads = vec![b"{not json".to_vec()];
    let (outputs, _) = handle_batch(payloads, f.hub.clone()).await.unwrap();
    assert!(matches!(outputs[0], Err(EventError::Malformed(_))));
}

#[tokio::test]
async fn heatmap_fast_path_emits_records_but_no_event() {
    let f = fixture();

    let mut event = test_event("$$heatmap", "d1");
    event
        .properties
        .insert("$session_id".to_string(), json!("s1"));
    event
        .properties
        .insert("$viewport_width".to_string(), json!(1024));
    event
        .properties
        .insert("$viewport_height".to_string(), json!(768));
    event.properties.insert(
        "$heatmap_data".to_string(),
        json!({
            "http://example.com/": [
                { "x": 10, "y": 20, "type": "click" },
                { "x": 30, "y": 40, "type": "click" },
                { "x": 50, "y": 60, "type": "rageclick" },
            ],
        }),
    );
    let uuid = event.uuid.clone().unwrap();

    let (outputs, effects) = run(&f.hub, vec![event]).await;

    assert!(matches!(outputs[0], Ok(None)));
    assert_eq!(effects.heatmaps.len(), 3);
    assert!(effects.heatmaps.iter().all(|h| h.key == uuid));

    // No identity work happened for the fast path
    assert_eq!(f.persons.person_count(1), 0);
}

#[tokio::test]
async fn round_trip_preserves_uuid_and_distinct_id() {
    let f = fixture();

    let event = test_event("custom event", "some-user");
    let input_uuid = event.uuid.clone().unwrap();

    let (outputs, _) = run(&f.hub, vec![event]).await;

    let raw = serde_json::to_string(enriched(&outputs[0])).unwrap();
    let parsed: common_types::ClickHouseEvent = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.uuid.to_string(), input_uuid);
    assert_eq!(parsed.distinct_id, "some-user");
}

#[tokio::test]
async fn person_conflict_exhaustion_fails_the_batch_retryably() {
    let f = fixture();

    // Seed the person so the update path (not create) is exercised
    run(&f.hub, vec![test_event("$pageview", "d1")]).await;

    // More conflicts than the retry bound
    f.persons.force_conflicts(10);

    let mut event = test_event("$pageview", "d1");
    event
        .properties
        .insert("$set".to_string(), json!({"plan": "pro"}));
    let payloads = vec![serde_json::to_vec(&event).unwrap()];

    let failure = handle_batch(payloads, f.hub.clone())
        .await
        .expect_err("conflict exhaustion should fail the batch");
    assert_eq!(failure.index, 0);
    assert!(matches!(
        failure.error,
        UnhandledError::PersonUpdateConflict { .. }
    ));
}

#[tokio::test]
async fn force_upgraded_persons_suppress_writes() {
    let f = fixture();

    run(&f.hub, vec![test_event("$pageview", "d1")]).await;
    f.persons.set_force_upgrade(1, "d1");

    let mut event = test_event("$pageview", "d1");
    event
        .properties
        .insert("$set".to_string(), json!({"plan": "pro"}));

    let (outputs, _) = run(&f.hub, vec![event]).await;

    let record = enriched(&outputs[0]);
    assert_eq!(record.person_mode, PersonMode::ForceUpgrade);

    // The write was suppressed
    let person = f.persons.person_by_distinct_id(1, "d1").await.unwrap().unwrap();
    assert!(person.properties.get("plan").is_none());
}

#[test]
fn oversize_produce_errors_classify_as_drops() {
    use common_kafka::kafka_producer::ProduceError;
    use rdkafka::{error::KafkaError, types::RDKafkaErrorCode};

    let oversize = ProduceError::Kafka(KafkaError::MessageProduction(
        RDKafkaErrorCode::MessageSizeTooLarge,
    ));
    assert!(oversize.is_message_too_large());
    assert_eq!(
        EventError::MessageSizeTooLarge.cause(),
        "message_size_too_large"
    );

    let transient = ProduceError::AckTimedOut;
    assert!(!transient.is_message_too_large());
}

#[tokio::test]
async fn merge_dangerously_merges_unconditionally() {
    let f = fixture();

    // Two identified persons; $identify would normally be the only path
    // that merges, $merge_dangerously forces it
    let mut first = test_event("$identify", "a");
    first
        .properties
        .insert("$set".to_string(), json!({"from": "a"}));
    let mut second = test_event("$identify", "b");
    second
        .properties
        .insert("$set".to_string(), json!({"from": "b"}));
    run(&f.hub, vec![first, second]).await;
    assert_eq!(f.persons.person_count(1), 2);

    let mut merge = test_event("$merge_dangerously", "a");
    merge.properties.insert("alias".to_string(), json!("b"));
    run(&f.hub, vec![merge]).await;

    assert_eq!(f.persons.person_count(1), 1);
    let person = f.persons.person_by_distinct_id(1, "b").await.unwrap().unwrap();
    let ids = f.persons.distinct_ids_of(1, person.uuid);
    assert_eq!(ids, vec!["a", "b"]);
}
