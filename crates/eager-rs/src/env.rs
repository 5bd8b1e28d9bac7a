use std::env;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub(crate) fn bool_var(name: &str) -> Option<bool> {
    non_empty(name).map(|value| parse_bool(&value))
}

pub(crate) fn usize_var(name: &str) -> Option<usize> {
    let value = non_empty(name)?;
    match value.trim().parse::<usize>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(var = name, value = %value, "ignoring non-numeric environment override");
            None
        }
    }
}
