use std::env;

use super::types::{AiBackend, ConfigError, Environment};

pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

pub(super) fn parse_u16(field: &'static str, value: String) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u32(field: &'static str, value: String) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|val| val.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

pub(super) fn parse_backend(value: String) -> Result<AiBackend, ConfigError> {
    match value.to_lowercase().as_str() {
        "stub" => Ok(AiBackend::Stub),
        "local" => Ok(AiBackend::Local),
        _ => Err(ConfigError::InvalidValue { field: "AI_BACKEND", value }),
    }
}

pub(super) fn parse_timeout_seconds(
    field: &'static str,
    value: String,
) -> Result<u64, ConfigError> {
    let parsed = parse_u64(field, value.clone())?;
    if !(1..=300).contains(&parsed) {
        return Err(ConfigError::InvalidValue { field, value });
    }
    Ok(parsed)
}

pub(super) fn parse_base_url(field: &'static str, value: String) -> Result<String, ConfigError> {
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(ConfigError::InvalidValue { field, value });
    }
    Ok(value.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }

    #[test]
    fn parse_environment_variants() {
        assert_eq!(parse_environment(Some("prod".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("production".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("staging".to_string())), Environment::Staging);
        assert_eq!(parse_environment(Some("testing".to_string())), Environment::Test);
        assert_eq!(parse_environment(None), Environment::Development);
    }

    #[test]
    fn parse_backend_variants() {
        assert_eq!(parse_backend("stub".to_string()).unwrap(), AiBackend::Stub);
        assert_eq!(parse_backend("local".to_string()).unwrap(), AiBackend::Local);
        assert_eq!(parse_backend("LOCAL".to_string()).unwrap(), AiBackend::Local);
        assert!(parse_backend("openai".to_string()).is_err());
    }

    #[test]
    fn parse_timeout_rejects_out_of_range() {
        assert_eq!(parse_timeout_seconds("AI_TIMEOUT_VISION", "30".to_string()).unwrap(), 30);
        assert!(parse_timeout_seconds("AI_TIMEOUT_VISION", "0".to_string()).is_err());
        assert!(parse_timeout_seconds("AI_TIMEOUT_VISION", "301".to_string()).is_err());
    }

    #[test]
    fn parse_base_url_requires_scheme_and_trims_slash() {
        let url = parse_base_url("OLLAMA_BASE_URL", "http://ollama:11434/".to_string()).unwrap();
        assert_eq!(url, "http://ollama:11434");
        assert!(parse_base_url("OLLAMA_BASE_URL", "ollama:11434".to_string()).is_err());
    }
}
