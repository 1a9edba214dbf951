use serde_json::Value;

// Serialization of autocapture `$elements` into the `elements_chain`
// column format: one entry per element, outermost last,
// `tag.class1.class2:key="value"...` joined with `;`.

const MAX_TEXT_LENGTH: usize = 400;
const MAX_HREF_LENGTH: usize = 2048;

pub fn elements_to_chain(elements: &[Value]) -> Result<String, String> {
    let serialized: Result<Vec<String>, String> =
        elements.iter().map(element_to_string).collect();
    Ok(serialized?.join(";"))
}

fn element_to_string(element: &Value) -> Result<String, String> {
    let Value::Object(element) = element else {
        return Err("element is not an object".to_string());
    };

    let mut out = String::new();

    if let Some(tag_name) = element.get("tag_name").and_then(Value::as_str) {
        out.push_str(tag_name);
    }

    let mut classes = extract_classes(element.get("attr__class"));
    classes.sort();
    for class in classes {
        out.push('.');
        out.push_str(&class.replace('"', ""));
    }

    let mut attributes: Vec<(String, String)> = Vec::new();
    if let Some(text) = element
        .get("$el_text")
        .or_else(|| element.get("text"))
        .and_then(Value::as_str)
    {
        attributes.push(("text".to_string(), truncate(text, MAX_TEXT_LENGTH)));
    }
    attributes.push((
        "nth-child".to_string(),
        scalar_to_string(element.get("nth_child")).unwrap_or_else(|| "0".to_string()),
    ));
    attributes.push((
        "nth-of-type".to_string(),
        scalar_to_string(element.get("nth_of_type")).unwrap_or_else(|| "0".to_string()),
    ));
    if let Some(href) = element.get("attr__href").and_then(Value::as_str) {
        attributes.push(("href".to_string(), truncate(href, MAX_HREF_LENGTH)));
    }
    if let Some(attr_id) = element.get("attr__id").and_then(Value::as_str) {
        attributes.push(("attr_id".to_string(), attr_id.to_string()));
    }

    let mut attr_keys: Vec<&String> = element
        .keys()
        .filter(|key| key.starts_with("attr__"))
        .collect();
    attr_keys.sort();
    for key in attr_keys {
        if let Some(value) = scalar_to_string(element.get(key.as_str())) {
            attributes.push((key.clone(), value));
        }
    }

    out.push(':');
    for (key, value) in attributes {
        out.push_str(&escape_quotes(&key));
        out.push_str("=\"");
        out.push_str(&escape_quotes(&value));
        out.push('"');
    }

    Ok(out)
}

fn extract_classes(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s.split_whitespace().map(String::from).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn scalar_to_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn escape_quotes(s: &str) -> String {
    s.replace('"', "\\\"")
}
