use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common_kafka::{
    kafka_consumer::ConsumerError, kafka_messages::ingest_warning::IngestionWarning,
    kafka_producer::DeliveryHandle,
};
use common_types::ClickHouseEvent;
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    app_context::AppContext,
    error::{EventError, PipelineFailure, UnhandledError},
    metric_consts::{
        BATCH_RETRIES, DLQ_ROUTED, EMIT_TIME, ERRORS, EVENTS_DROPPED, EVENTS_EMITTED,
        EVENTS_RECEIVED, EVENT_BATCH_SIZE, HANDLE_BATCH_TIME, MAIN_LOOP_TIME, WARNINGS_EMITTED,
    },
    pipeline::{handle_batch, PipelineOutput, SideEffects, WARNING_SOURCE},
};

/// The main pull loop: receive a batch, run it through the pipeline,
/// emit everything, await every broker acknowledgement, and only then
/// store the batch's offset bookmark. Returning an error means an
/// unrecoverable fault; main shuts the process down through the drain
/// path.
pub async fn start_consumer(
    context: Arc<AppContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), UnhandledError> {
    let batch_wait = Duration::from_secs(context.config.max_event_batch_wait_seconds);
    let batch_size = context.config.max_events_per_batch;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let whole_loop = common_metrics::timing_guard(MAIN_LOOP_TIME, &[]);
        context.worker_liveness.report_healthy().await;

        let received = tokio::select! {
            batch = context.kafka_consumer.recv_batch(batch_size, batch_wait) => batch,
            // An unacknowledged in-flight batch is simply replayed later
            _ = shutdown.changed() => break,
        };

        let (messages, bookmark) = match received {
            Ok(batch) => batch,
            Err(ConsumerError::Kafka(e)) => return Err(e.into()),
            Err(e) => return Err(UnhandledError::Other(e.to_string())),
        };

        let payloads: Vec<Vec<u8>> = messages.into_iter().map(|m| m.payload).collect();
        counter!(EVENTS_RECEIVED).increment(payloads.len() as u64);

        if payloads.is_empty() {
            // Tombstone-only batches still advance the bookmark
            bookmark
                .store()
                .map_err(|e| UnhandledError::Other(e.to_string()))?;
            whole_loop.label("outcome", "empty").fin();
            continue;
        }

        histogram!(EVENT_BATCH_SIZE).record(payloads.len() as f64);

        process_batch(&context, payloads).await?;

        // Every emission for the batch has been acknowledged; the
        // bookmark is safe to store
        bookmark
            .store()
            .map_err(|e| UnhandledError::Other(e.to_string()))?;

        whole_loop.label("outcome", "completed").fin();
    }

    info!(
        "Draining producer, waiting up to {}ms",
        context.config.drain_timeout_ms
    );
    if let Err(e) = context
        .kafka_producer
        .flush(Duration::from_millis(context.config.drain_timeout_ms))
    {
        warn!("Producer flush on shutdown failed: {:?}", e);
    }

    Ok(())
}

/// Run a batch to completion. Retryable failures re-run the whole batch;
/// since every store mutation is version-guarded and idempotent, re-runs
/// are safe. After `batch_retry_max` attempts the offending message is
/// routed to the DLQ and the rest of the batch continues without it.
async fn process_batch(
    context: &Arc<AppContext>,
    mut payloads: Vec<Vec<u8>>,
) -> Result<(), UnhandledError> {
    let mut attempts = 0;

    loop {
        if payloads.is_empty() {
            return Ok(());
        }

        let guard = common_metrics::timing_guard(HANDLE_BATCH_TIME, &[]);
        let failure = match run_batch_once(context, payloads.clone()).await {
            Ok(dropped) => {
                guard.label("outcome", "completed").fin();
                for cause in dropped {
                    report_dropped(&cause);
                }
                return Ok(());
            }
            Err(failure) => failure,
        };
        guard.label("outcome", "retry").fin();

        if matches!(failure.error, UnhandledError::KafkaError(_)) {
            return Err(failure.error);
        }

        counter!(BATCH_RETRIES).increment(1);
        warn!(
            "Batch attempt {} failed at index {}: {:?}",
            attempts, failure.index, failure.error
        );

        attempts += 1;
        if attempts > context.config.batch_retry_max {
            route_to_dlq(context, &payloads[failure.index], &failure.error).await;
            payloads.remove(failure.index);
            attempts = 0;
            continue;
        }

        tokio::time::sleep(Duration::from_millis(100 * attempts)).await;
    }
}

// One full pipeline-and-emit pass. Returns the drop causes observed, so
// the caller only counts them once the batch has actually settled.
async fn run_batch_once(
    context: &Arc<AppContext>,
    payloads: Vec<Vec<u8>>,
) -> Result<Vec<EventError>, PipelineFailure> {
    let (outputs, effects) = handle_batch(payloads, context.hub.clone()).await?;
    emit_batch(context, outputs, effects).await
}

// What a pending acknowledgement is for, so awaited failures can be
// classified per event or attributed to the batch.
struct PendingAck {
    index: usize,
    event_meta: Option<(i32, uuid::Uuid)>, // (team_id, uuid) for enriched events
    handle: DeliveryHandle,
}

async fn emit_batch(
    context: &Arc<AppContext>,
    outputs: Vec<PipelineOutput>,
    effects: SideEffects,
) -> Result<Vec<EventError>, PipelineFailure> {
    let emit_guard = common_metrics::timing_guard(EMIT_TIME, &[]);
    let producer = &context.kafka_producer;
    let config = &context.config;

    let mut dropped = Vec::new();
    let mut pending = Vec::new();

    for (index, output) in outputs.into_iter().enumerate() {
        let event = match output {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(cause) => {
                dropped.push(cause);
                continue;
            }
        };

        let topic = destination_topic(config, &event);
        let key = event.uuid.to_string();
        let meta = (event.team_id, event.uuid);

        match producer.enqueue(topic, Some(&key), &event) {
            Ok(handle) => pending.push(PendingAck {
                index,
                event_meta: Some(meta),
                handle,
            }),
            Err(e) if e.is_message_too_large() => {
                oversize_drop(context, meta.0, meta.1, &mut dropped);
            }
            Err(e) => return Err((index, e.into()).into()),
        }
    }

    for update in &effects.person_updates {
        match producer.enqueue(&config.persons_topic, Some(&update.id), update) {
            Ok(handle) => pending.push(PendingAck {
                index: 0,
                event_meta: None,
                handle,
            }),
            Err(e) => return Err((0, e.into()).into()),
        }
    }

    for update in &effects.group_updates {
        let key = format!(
            "{}:{}:{}",
            update.team_id, update.group_type_index, update.group_key
        );
        match producer.enqueue(&config.groups_topic, Some(&key), update) {
            Ok(handle) => pending.push(PendingAck {
                index: 0,
                event_meta: None,
                handle,
            }),
            Err(e) => return Err((0, e.into()).into()),
        }
    }

    for heatmap in &effects.heatmaps {
        match producer.enqueue(&config.heatmaps_topic, Some(&heatmap.key), &heatmap.event) {
            Ok(handle) => pending.push(PendingAck {
                index: 0,
                event_meta: None,
                handle,
            }),
            Err(e) => return Err((0, e.into()).into()),
        }
    }

    // Warnings are fire-and-forget: enqueue failures are logged, and
    // delivery is not awaited before the bookmark is stored
    for warning in &effects.warnings {
        emit_warning(context, warning);
    }

    for ack in pending {
        match ack.handle.wait().await {
            Ok(()) => {
                if ack.event_meta.is_some() {
                    counter!(EVENTS_EMITTED).increment(1);
                }
            }
            Err(e) if e.is_message_too_large() => match ack.event_meta {
                Some((team_id, uuid)) => oversize_drop(context, team_id, uuid, &mut dropped),
                None => {
                    error!("Oversize side-effect message dropped: {:?}", e);
                    counter!(ERRORS, "cause" => "side_effect_too_large").increment(1);
                }
            },
            Err(e) => return Err((ack.index, e.into()).into()),
        }
    }

    emit_guard.label("outcome", "completed").fin();
    Ok(dropped)
}

fn destination_topic<'a>(config: &'a crate::config::Config, event: &ClickHouseEvent) -> &'a str {
    if event.event == "$exception" && !has_sentry_event_id(event) {
        return &config.exceptions_topic;
    }
    &config.enriched_events_topic
}

fn has_sentry_event_id(event: &ClickHouseEvent) -> bool {
    let Some(raw) = &event.properties else {
        return false;
    };
    match serde_json::from_str::<HashMap<String, Value>>(raw) {
        Ok(props) => props.contains_key("$sentry_event_id"),
        Err(_) => false,
    }
}

// Oversize payloads are dropped, warned about, and never retried - the
// message would be just as oversized the second time around.
fn oversize_drop(
    context: &Arc<AppContext>,
    team_id: i32,
    uuid: uuid::Uuid,
    dropped: &mut Vec<EventError>,
) {
    let warning = IngestionWarning::new(
        team_id,
        WARNING_SOURCE.to_string(),
        EventError::MessageSizeTooLarge.cause().to_string(),
        HashMap::from([("eventUuid".to_string(), json!(uuid.to_string()))]),
        None,
    );
    emit_warning(context, &warning);
    dropped.push(EventError::MessageSizeTooLarge);
}

fn emit_warning(context: &Arc<AppContext>, warning: &IngestionWarning) {
    match context
        .kafka_producer
        .enqueue(&context.config.ingestion_warnings_topic, None, warning)
    {
        Ok(_handle) => {
            counter!(WARNINGS_EMITTED, "type" => warning.warning_type.clone()).increment(1);
        }
        Err(e) => {
            error!("Failed to enqueue ingestion warning: {:?}", e);
            counter!(ERRORS, "cause" => "warning_enqueue_failed").increment(1);
        }
    }
}

async fn route_to_dlq(context: &Arc<AppContext>, payload: &[u8], error: &UnhandledError) {
    error!("Routing message to DLQ after repeated failures: {:?}", error);
    counter!(DLQ_ROUTED).increment(1);

    // The raw payload goes to the DLQ verbatim for offline analysis
    let raw = String::from_utf8_lossy(payload);
    match context.kafka_producer.enqueue(
        &context.config.dlq_topic,
        None,
        &json!({
            "payload": raw,
            "error": error.to_string(),
        }),
    ) {
        Ok(handle) => {
            if let Err(e) = handle.wait().await {
                error!("Failed to deliver message to DLQ: {:?}", e);
            }
        }
        Err(e) => error!("Failed to enqueue message to DLQ: {:?}", e),
    }
}

fn report_dropped(cause: &EventError) {
    warn!("Dropping event: {}", cause);
    counter!(EVENTS_DROPPED, "drop_cause" => cause.cause()).increment(1);
}
