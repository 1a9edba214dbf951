use std::collections::HashSet;

use async_trait::async_trait;
use common_types::PipelineEvent;
use metrics::counter;
use tracing::error;

use crate::{
    error::EventError,
    hub::Hub,
    metric_consts::TRANSFORMATION_FAILED,
    pipeline::StageResult,
};

pub enum Transformed {
    /// The (possibly mutated) event continues down the pipeline.
    Continue(PipelineEvent),
    /// The transformation consumed the event; it's counted as dropped.
    Drop,
}

/// A user-defined step in the transformation chain. Implementations may
/// suspend (they historically call out to external services), mutate the
/// event, or drop it. A failing transformation never takes the event
/// down with it: the pre-transformation event continues.
#[async_trait]
pub trait Transformation: Send + Sync {
    fn name(&self) -> &str;
    async fn transform(&self, event: PipelineEvent) -> Result<Transformed, String>;
}

pub async fn apply_transformations(events: Vec<StageResult>, hub: &Hub) -> Vec<StageResult> {
    if hub.transformations.is_empty() {
        return events;
    }

    let mut buffer = Vec::with_capacity(events.len());

    'events: for event in events {
        let mut prepared = match event {
            Ok(prepared) => prepared,
            Err(e) => {
                buffer.push(Err(e));
                continue;
            }
        };

        if prepared.is_heatmap_fast_path() {
            buffer.push(Ok(prepared));
            continue;
        }

        for transformation in &hub.transformations {
            let before = prepared.event.clone();
            match transformation.transform(prepared.event).await {
                Ok(Transformed::Continue(event)) => prepared.event = event,
                Ok(Transformed::Drop) => {
                    buffer.push(Err(EventError::TransformationDropped(
                        transformation.name().to_string(),
                    )));
                    continue 'events;
                }
                Err(e) => {
                    error!(
                        event = prepared.uuid.to_string(),
                        team = prepared.team.id,
                        "transformation {} failed: {}",
                        transformation.name(),
                        e
                    );
                    counter!(TRANSFORMATION_FAILED, "transformation" => transformation.name().to_string())
                        .increment(1);
                    prepared.event = before;
                }
            }
        }

        buffer.push(Ok(prepared));
    }

    buffer
}

/// Removes a configured set of property keys from every event before any
/// downstream step sees them.
pub struct PropertyFilter {
    filtered: HashSet<String>,
}

impl PropertyFilter {
    pub fn from_config(config: &str) -> Self {
        let filtered = config
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Self { filtered }
    }
}

#[async_trait]
impl Transformation for PropertyFilter {
    fn name(&self) -> &str {
        "property-filter"
    }

    async fn transform(&self, mut event: PipelineEvent) -> Result<Transformed, String> {
        event
            .properties
            .retain(|key, _| !self.filtered.contains(key));
        Ok(Transformed::Continue(event))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{test_event, test_hub, to_prepared};
    use serde_json::json;

    struct DropAll;

    #[async_trait]
    impl Transformation for DropAll {
        fn name(&self) -> &str {
            "drop-all"
        }

        async fn transform(&self, _event: PipelineEvent) -> Result<Transformed, String> {
            Ok(Transformed::Drop)
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Transformation for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        async fn transform(&self, mut event: PipelineEvent) -> Result<Transformed, String> {
            event.properties.insert("mangled".to_string(), json!(true));
            Err("upstream timed out".to_string())
        }
    }

    #[tokio::test]
    async fn null_result_drops_the_event() {
        let mut hub = test_hub();
        hub.transformations = vec![Arc::new(DropAll)];

        let events = vec![Ok(to_prepared(test_event("$pageview", "d1")))];
        let result = apply_transformations(events, &hub).await;

        assert_eq!(result.len(), 1);
        assert!(matches!(
            result[0],
            Err(EventError::TransformationDropped(ref name)) if name == "drop-all"
        ));
    }

    #[tokio::test]
    async fn failures_keep_the_pre_transform_event() {
        let mut hub = test_hub();
        hub.transformations = vec![Arc::new(AlwaysFails)];

        let mut event = test_event("$pageview", "d1");
        event.properties.insert("original".to_string(), json!(1));
        let events = vec![Ok(to_prepared(event))];

        let result = apply_transformations(events, &hub).await;
        let prepared = result[0].as_ref().unwrap();
        assert_eq!(prepared.event.properties["original"], json!(1));
        assert!(!prepared.event.properties.contains_key("mangled"));
    }

    #[tokio::test]
    async fn property_filter_strips_keys() {
        let filter = PropertyFilter::from_config("$ip, secret");
        let mut event = test_event("$pageview", "d1");
        event.properties.insert("$ip".to_string(), json!("1.2.3.4"));
        event.properties.insert("secret".to_string(), json!("x"));
        event.properties.insert("keep".to_string(), json!("y"));

        let Ok(Transformed::Continue(event)) = filter.transform(event).await else {
            panic!("expected continue");
        };
        assert!(!event.properties.contains_key("$ip"));
        assert!(!event.properties.contains_key("secret"));
        assert!(event.properties.contains_key("keep"));
    }
}
