use metrics::counter;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    metric_consts::AI_EVENTS_PROCESSED,
    pipeline::{PreparedEvent, StageResult},
};

const AI_EVENTS: &[&str] = &["$ai_generation", "$ai_embedding"];

// USD per single token. The upstream cost catalogues are per-million;
// keeping the per-token figure here avoids a divide on every event.
struct ModelCost {
    prefix: &'static str,
    prompt: f64,
    completion: f64,
}

// Matched by exact model name first, then by longest prefix, so
// "gpt-4o-2024-08-06" picks up the "gpt-4o" row.
const MODEL_COSTS: &[ModelCost] = &[
    ModelCost { prefix: "gpt-5", prompt: 1.25e-6, completion: 10e-6 },
    ModelCost { prefix: "gpt-5-mini", prompt: 0.25e-6, completion: 2e-6 },
    ModelCost { prefix: "gpt-5-nano", prompt: 0.05e-6, completion: 0.4e-6 },
    ModelCost { prefix: "gpt-4.1", prompt: 2e-6, completion: 8e-6 },
    ModelCost { prefix: "gpt-4.1-mini", prompt: 0.4e-6, completion: 1.6e-6 },
    ModelCost { prefix: "gpt-4o", prompt: 2.5e-6, completion: 10e-6 },
    ModelCost { prefix: "gpt-4o-mini", prompt: 0.15e-6, completion: 0.6e-6 },
    ModelCost { prefix: "o3", prompt: 2e-6, completion: 8e-6 },
    ModelCost { prefix: "o4-mini", prompt: 1.1e-6, completion: 4.4e-6 },
    ModelCost { prefix: "claude-opus-4", prompt: 15e-6, completion: 75e-6 },
    ModelCost { prefix: "claude-sonnet-4", prompt: 3e-6, completion: 15e-6 },
    ModelCost { prefix: "claude-3-7-sonnet", prompt: 3e-6, completion: 15e-6 },
    ModelCost { prefix: "claude-3-5-sonnet", prompt: 3e-6, completion: 15e-6 },
    ModelCost { prefix: "claude-3-5-haiku", prompt: 0.8e-6, completion: 4e-6 },
    ModelCost { prefix: "gemini-2.5-pro", prompt: 1.25e-6, completion: 10e-6 },
    ModelCost { prefix: "gemini-2.5-flash", prompt: 0.3e-6, completion: 2.5e-6 },
    ModelCost { prefix: "gemini-2.0-flash", prompt: 0.1e-6, completion: 0.4e-6 },
    ModelCost { prefix: "mistral-large", prompt: 2e-6, completion: 6e-6 },
    ModelCost { prefix: "text-embedding-3-small", prompt: 0.02e-6, completion: 0.0 },
    ModelCost { prefix: "text-embedding-3-large", prompt: 0.13e-6, completion: 0.0 },
];

fn find_cost(model: &str) -> Option<&'static ModelCost> {
    let model = model.to_lowercase();
    if let Some(exact) = MODEL_COSTS.iter().find(|c| c.prefix == model) {
        return Some(exact);
    }
    MODEL_COSTS
        .iter()
        .filter(|c| model.starts_with(c.prefix))
        .max_by_key(|c| c.prefix.len())
}

/// Derives token counts and USD cost fields for LLM observability
/// events. Unknown models and malformed inputs are logged and left
/// alone; nothing here ever drops an event.
pub fn process_ai_events(mut events: Vec<StageResult>) -> Vec<StageResult> {
    for event in events.iter_mut() {
        let Ok(prepared) = event else {
            continue;
        };

        if !AI_EVENTS.contains(&prepared.event.event.as_str()) {
            continue;
        }

        enrich_ai_event(prepared);
        counter!(AI_EVENTS_PROCESSED).increment(1);
    }

    events
}

fn enrich_ai_event(prepared: &mut PreparedEvent) {
    let props = &mut prepared.event.properties;

    let input_tokens = props
        .get("$ai_input_tokens")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let output_tokens = props
        .get("$ai_output_tokens")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    props
        .entry("$ai_input_tokens".to_string())
        .or_insert(json!(input_tokens));
    props
        .entry("$ai_output_tokens".to_string())
        .or_insert(json!(output_tokens));

    // Provided costs win over the catalogue
    let provided_input = props.get("$ai_input_cost_usd").and_then(Value::as_f64);
    let provided_output = props.get("$ai_output_cost_usd").and_then(Value::as_f64);

    let (input_cost, output_cost) = match (provided_input, provided_output) {
        (Some(input), Some(output)) => (input, output),
        _ => {
            let Some(model) = props.get("$ai_model").and_then(Value::as_str) else {
                debug!(
                    event = prepared.uuid.to_string(),
                    "AI event without $ai_model, skipping cost calculation"
                );
                return;
            };
            let Some(cost) = find_cost(model) else {
                debug!(
                    event = prepared.uuid.to_string(),
                    model, "unknown AI model, skipping cost calculation"
                );
                return;
            };
            (
                provided_input.unwrap_or(input_tokens * cost.prompt),
                provided_output.unwrap_or(output_tokens * cost.completion),
            )
        }
    };

    props.insert("$ai_input_cost_usd".to_string(), json!(input_cost));
    props.insert("$ai_output_cost_usd".to_string(), json!(output_cost));
    props.insert(
        "$ai_total_cost_usd".to_string(),
        json!(input_cost + output_cost),
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{test_event, to_prepared};
    use serde_json::json;

    #[test]
    fn derives_costs_from_the_model_table() {
        let mut event = test_event("$ai_generation", "d1");
        event
            .properties
            .insert("$ai_model".to_string(), json!("gpt-4o"));
        event
            .properties
            .insert("$ai_input_tokens".to_string(), json!(1000));
        event
            .properties
            .insert("$ai_output_tokens".to_string(), json!(500));

        let result = process_ai_events(vec![Ok(to_prepared(event))]);
        let props = &result[0].as_ref().unwrap().event.properties;

        let input_cost = props["$ai_input_cost_usd"].as_f64().unwrap();
        let output_cost = props["$ai_output_cost_usd"].as_f64().unwrap();
        let total = props["$ai_total_cost_usd"].as_f64().unwrap();
        assert!((input_cost - 0.0025).abs() < 1e-9);
        assert!((output_cost - 0.005).abs() < 1e-9);
        assert!((total - 0.0075).abs() < 1e-9);
    }

    #[test]
    fn prefix_matching_picks_the_longest_prefix() {
        let cost = find_cost("gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(cost.prefix, "gpt-4o-mini");

        let cost = find_cost("claude-3-5-sonnet-20241022").unwrap();
        assert_eq!(cost.prefix, "claude-3-5-sonnet");

        assert!(find_cost("homegrown-llm").is_none());
    }

    #[test]
    fn provided_costs_win_over_the_table() {
        let mut event = test_event("$ai_generation", "d1");
        event
            .properties
            .insert("$ai_model".to_string(), json!("gpt-4o"));
        event
            .properties
            .insert("$ai_input_cost_usd".to_string(), json!(0.5));
        event
            .properties
            .insert("$ai_output_cost_usd".to_string(), json!(0.25));

        let result = process_ai_events(vec![Ok(to_prepared(event))]);
        let props = &result[0].as_ref().unwrap().event.properties;
        assert_eq!(props["$ai_total_cost_usd"], json!(0.75));
    }

    #[test]
    fn unknown_model_leaves_event_untouched() {
        let mut event = test_event("$ai_embedding", "d1");
        event
            .properties
            .insert("$ai_model".to_string(), json!("homegrown-llm"));

        let result = process_ai_events(vec![Ok(to_prepared(event))]);
        let props = &result[0].as_ref().unwrap().event.properties;
        assert!(!props.contains_key("$ai_total_cost_usd"));
        // Token counts are still defaulted
        assert_eq!(props["$ai_input_tokens"], json!(0.0));
    }

    #[test]
    fn non_ai_events_are_ignored() {
        let mut event = test_event("$pageview", "d1");
        event
            .properties
            .insert("$ai_model".to_string(), json!("gpt-4o"));

        let result = process_ai_events(vec![Ok(to_prepared(event))]);
        let props = &result[0].as_ref().unwrap().event.properties;
        assert!(!props.contains_key("$ai_total_cost_usd"));
    }
}
