use common_kafka::kafka_producer::ProduceError;
use rdkafka::error::KafkaError;
use thiserror::Error;

// An unhandled failure at some stage of the pipeline, along with the
// index of the batch item that caused it, so the consumer can retry the
// batch and eventually route the offending message to the DLQ.
#[derive(Debug)]
pub struct PipelineFailure {
    pub index: usize,
    pub error: UnhandledError,
}

impl From<(usize, UnhandledError)> for PipelineFailure {
    fn from((index, error): (usize, UnhandledError)) -> Self {
        PipelineFailure { index, error }
    }
}

#[derive(Debug, Error)]
pub enum UnhandledError {
    #[error("Config error: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("Kafka error: {0}")]
    KafkaError(#[from] KafkaError),
    #[error("Produce error: {0}")]
    KafkaProduceError(#[from] ProduceError),
    #[error("Sqlx error: {0}")]
    SqlxError(#[from] sqlx::Error),
    #[error("Unhandled serde error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Person update conflict for team {team_id}, distinct id {distinct_id}")]
    PersonUpdateConflict { team_id: i32, distinct_id: String },
    #[error("Unhandled error: {0}")]
    Other(String),
}

// Expected invalidity of a single input event. Every variant maps to a
// drop cause label; some also put an ingestion warning on the warnings
// topic. These never abort the batch.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    #[error("no token or team id resolved to a team")]
    InvalidToken,
    #[error("malformed event payload: {0}")]
    Malformed(String),
    #[error("invalid event uuid: {0}")]
    InvalidEventUuid(String),
    #[error("event dropped by transformation: {0}")]
    TransformationDropped(String),
    #[error("cookieless event filtered")]
    CookielessFiltered,
    #[error("event {0} not allowed when person processing is disabled")]
    InvalidEventWhenProcessPersonProfileIsFalse(String),
    #[error("payload exceeded the broker message size limit")]
    MessageSizeTooLarge,
}

impl EventError {
    /// The `drop_cause` label on the dropped-events counter.
    pub fn cause(&self) -> &'static str {
        match self {
            EventError::InvalidToken => "invalid_token",
            EventError::Malformed(_) => "malformed",
            EventError::InvalidEventUuid(_) => "invalid_event_uuid",
            EventError::TransformationDropped(_) => "transformation_dropped",
            EventError::CookielessFiltered => "cookieless_filtered",
            EventError::InvalidEventWhenProcessPersonProfileIsFalse(_) => {
                "invalid_event_when_process_person_profile_is_false"
            }
            EventError::MessageSizeTooLarge => "message_size_too_large",
        }
    }

    /// Drops flagged here must never land on the DLQ, even if the
    /// consumer is mid-retry when the drop is classified.
    pub fn do_not_send_to_dlq(&self) -> bool {
        matches!(
            self,
            EventError::InvalidEventWhenProcessPersonProfileIsFalse(_)
        )
    }
}
