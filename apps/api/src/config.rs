use anyhow::{bail, Context, Result};

use crate::screening::service::DEFAULT_MAX_CONCURRENCY;

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Only needed when the llm scorer backend is selected.
    pub anthropic_api_key: Option<String>,
    pub port: u16,
    pub rust_log: String,
    pub max_concurrency: usize,
    /// "keyword" or "llm".
    pub scorer_backend: String,
    pub scorer_model: Option<String>,
    pub scorer_version: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_concurrency = match optional("SCREENING_MAX_CONCURRENCY") {
            Some(v) => v
                .parse::<usize>()
                .context("SCREENING_MAX_CONCURRENCY must be a positive integer")?,
            None => DEFAULT_MAX_CONCURRENCY,
        };
        if max_concurrency == 0 {
            bail!("SCREENING_MAX_CONCURRENCY must be at least 1");
        }

        let scorer_backend = optional("SCORER_BACKEND").unwrap_or_else(|| "keyword".to_string());
        let anthropic_api_key = optional("ANTHROPIC_API_KEY");
        match scorer_backend.as_str() {
            "keyword" => {}
            "llm" if anthropic_api_key.is_none() => {
                bail!("ANTHROPIC_API_KEY is required when SCORER_BACKEND=llm")
            }
            "llm" => {}
            other => bail!("SCORER_BACKEND must be 'keyword' or 'llm', got '{other}'"),
        }

        Ok(Config {
            database_url: optional("DATABASE_URL")
                .with_context(|| "Required environment variable 'DATABASE_URL' is not set")?,
            anthropic_api_key,
            port: optional("PORT")
                .unwrap_or_else(|| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: optional("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            max_concurrency,
            scorer_backend,
            scorer_model: optional("SCORER_MODEL"),
            scorer_version: optional("SCORER_VERSION")
                .unwrap_or_else(|| format!("screener-{}", env!("CARGO_PKG_VERSION"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.rust_log, "info");
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.scorer_backend, "keyword");
        assert!(config.anthropic_api_key.is_none());
        assert!(config.scorer_version.starts_with("screener-"));
    }

    #[test]
    fn test_database_url_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_llm_backend_needs_key() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("SCORER_BACKEND", "llm"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));

        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("SCORER_BACKEND", "llm"),
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("SCORER_MODEL", "claude-haiku-4-5"),
        ]))
        .unwrap();
        assert_eq!(config.scorer_model.as_deref(), Some("claude-haiku-4-5"));
    }

    #[test]
    fn test_rejects_bad_numbers() {
        for (key, value) in [
            ("PORT", "eighty"),
            ("SCREENING_MAX_CONCURRENCY", "0"),
            ("SCREENING_MAX_CONCURRENCY", "-3"),
            ("SCORER_BACKEND", "gpt"),
        ] {
            let result = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x"), (key, value)]));
            assert!(result.is_err(), "{key}={value} should be rejected");
        }
    }
}
