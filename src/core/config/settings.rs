use super::parsing::{
    env_optional, env_or_default, parse_backend, parse_base_url, parse_bool, parse_environment,
    parse_timeout_seconds, parse_u16, parse_u32, parse_u64,
};
use super::types::{
    AiBackend, AiSettings, ConfigError, DatabaseSettings, RuntimeSettings, S3Settings, Settings,
    StorageSettings, TelemetrySettings, WorkerSettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let environment =
            parse_environment(env_optional("LERNWERK_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("LERNWERK_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "lernwerk");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "lernwerk_db");
        let database_url = env_optional("DATABASE_URL");

        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "10"))?;

        let s3_endpoint = env_or_default("S3_ENDPOINT", "");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "lernwerk-data");
        let s3_region = env_or_default("S3_REGION", "eu-central-1");

        let backend = parse_backend(env_or_default("AI_BACKEND", "stub"))?;
        let vision_model = env_or_default("AI_VISION_MODEL", "qwen2.5-vl:7b");
        let feedback_model = env_or_default("AI_FEEDBACK_MODEL", "qwen2.5:7b-instruct");
        let timeout_vision_seconds =
            parse_timeout_seconds("AI_TIMEOUT_VISION", env_or_default("AI_TIMEOUT_VISION", "30"))?;
        let timeout_feedback_seconds = parse_timeout_seconds(
            "AI_TIMEOUT_FEEDBACK",
            env_or_default("AI_TIMEOUT_FEEDBACK", "15"),
        )?;
        let ollama_base_url = parse_base_url(
            "OLLAMA_BASE_URL",
            env_or_default("OLLAMA_BASE_URL", "http://ollama:11434"),
        )?;

        let lease_seconds =
            parse_u64("WORKER_LEASE_SECONDS", env_or_default("WORKER_LEASE_SECONDS", "45"))?;
        let max_retries =
            parse_u32("WORKER_MAX_RETRIES", env_or_default("WORKER_MAX_RETRIES", "3"))?;
        let backoff_seconds =
            parse_u64("WORKER_BACKOFF_SECONDS", env_or_default("WORKER_BACKOFF_SECONDS", "10"))?
                .max(1);

        let log_level = env_or_default("LERNWERK_LOG_LEVEL", "info");
        let json =
            env_optional("LERNWERK_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            runtime: RuntimeSettings { environment, strict_config },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            storage: StorageSettings { max_upload_size_mb },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
            },
            ai: AiSettings {
                backend,
                vision_model,
                feedback_model,
                timeout_vision_seconds,
                timeout_feedback_seconds,
                ollama_base_url,
            },
            worker: WorkerSettings { lease_seconds, max_retries, backoff_seconds },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn worker(&self) -> &WorkerSettings {
        &self.worker
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.environment.is_production_like() && self.ai.backend == AiBackend::Stub {
            return Err(ConfigError::InvalidValue {
                field: "AI_BACKEND",
                value: self.ai.backend.as_str().to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }

        Ok(())
    }
}
