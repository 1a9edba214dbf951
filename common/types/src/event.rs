use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::TeamId;

// A raw analytics event, as pulled off the ingestion topic. Everything
// here is as the SDK sent it: the uuid is kept as a string so that an
// invalid one is a handled drop downstream rather than a decode failure,
// and the distinct id is a Value because SDKs send numbers and bools too.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineEvent {
    #[serde(
        alias = "$token",
        alias = "api_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    #[serde(rename = "$set", skip_serializing_if = "Option::is_none")]
    pub set: Option<HashMap<String, Value>>,
    #[serde(rename = "$set_once", skip_serializing_if = "Option::is_none")]
    pub set_once: Option<HashMap<String, Value>>,
}

impl PipelineEvent {
    pub fn extract_token(&self) -> Option<String> {
        match &self.token {
            Some(value) => Some(value.clone()),
            None => self
                .properties
                .get("token")
                .and_then(Value::as_str)
                .map(String::from),
        }
    }

    /// Distinct ids are opaque strings to us, but SDKs send all kinds of
    /// scalars. Coerce them the way capture does: strings pass through,
    /// other scalars are stringified, null and composites are rejected.
    pub fn extract_distinct_id(&self) -> Option<String> {
        let value = self.distinct_id.as_ref()?;
        match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::String(_) => None,
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonMode {
    Full,
    Propertyless,
    ForceUpgrade,
}

// The event type we produce to the events topic, one row per event in
// the analytical store. Timestamps are CH-format strings, properties are
// pre-serialised JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseEvent {
    pub uuid: Uuid,
    pub team_id: TeamId,
    pub project_id: i64,
    pub event: String,
    pub distinct_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    pub timestamp: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_properties: Option<String>,
    pub person_mode: PersonMode,
}

impl ClickHouseEvent {
    pub fn take_raw_properties(&mut self) -> Result<HashMap<String, Value>, serde_json::Error> {
        match self.properties.take() {
            Some(properties) => serde_json::from_str(&properties),
            None => Ok(HashMap::new()),
        }
    }

    pub fn set_raw_properties(
        &mut self,
        properties: HashMap<String, Value>,
    ) -> Result<(), serde_json::Error> {
        self.properties = Some(serde_json::to_string(&properties)?);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_from_field_or_properties() {
        let event: PipelineEvent = serde_json::from_value(json!({
            "event": "$pageview",
            "api_key": "phc_abc",
        }))
        .unwrap();
        assert_eq!(event.extract_token().as_deref(), Some("phc_abc"));

        let event: PipelineEvent = serde_json::from_value(json!({
            "event": "$pageview",
            "properties": { "token": "phc_props" },
        }))
        .unwrap();
        assert_eq!(event.extract_token().as_deref(), Some("phc_props"));
    }

    #[test]
    fn distinct_id_coercion() {
        let cases = [
            (json!("user-1"), Some("user-1".to_string())),
            (json!(42), Some("42".to_string())),
            (json!(true), Some("true".to_string())),
            (json!(""), None),
            (json!(null), None),
            (json!(["no", "arrays"]), None),
        ];
        for (input, expected) in cases {
            let event = PipelineEvent {
                distinct_id: Some(input),
                ..Default::default()
            };
            assert_eq!(event.extract_distinct_id(), expected);
        }
    }

    #[test]
    fn person_mode_wire_format() {
        assert_eq!(
            serde_json::to_string(&PersonMode::ForceUpgrade).unwrap(),
            "\"force_upgrade\""
        );
        assert_eq!(
            serde_json::to_string(&PersonMode::Propertyless).unwrap(),
            "\"propertyless\""
        );
    }
}
