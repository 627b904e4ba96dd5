use serde_json::Value;

/// Query parameters in insertion order.
pub type Params = serde_json::Map<String, Value>;

/// Default query serializer.
///
/// `null` values are skipped, strings are used as-is and every other value
/// is written as JSON. Output is form-urlencoded without a leading `?`.
pub fn serialize_params_default(params: &Params) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        match value {
            Value::Null => continue,
            Value::String(text) => serializer.append_pair(key, text),
            other => serializer.append_pair(key, &other.to_string()),
        };
    }
    serializer.finish()
}
