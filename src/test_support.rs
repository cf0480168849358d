use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes tests that mutate process environment variables.
pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    dotenvy::dotenv().ok();

    std::env::set_var("LERNWERK_ENV", "test");
    std::env::set_var("LERNWERK_STRICT_CONFIG", "0");
    std::env::remove_var("DATABASE_URL");
    std::env::remove_var("AI_BACKEND");
    std::env::remove_var("AI_VISION_MODEL");
    std::env::remove_var("AI_FEEDBACK_MODEL");
    std::env::remove_var("AI_TIMEOUT_VISION");
    std::env::remove_var("AI_TIMEOUT_FEEDBACK");
    std::env::remove_var("OLLAMA_BASE_URL");
    std::env::remove_var("MAX_UPLOAD_SIZE_MB");
    std::env::remove_var("WORKER_LEASE_SECONDS");
    std::env::remove_var("WORKER_MAX_RETRIES");
    std::env::remove_var("WORKER_BACKOFF_SECONDS");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::remove_var("S3_ENDPOINT");
    std::env::remove_var("S3_ACCESS_KEY");
    std::env::remove_var("S3_SECRET_KEY");
    std::env::remove_var("S3_BUCKET");
    std::env::remove_var("S3_REGION");
    std::env::set_var("AWS_EC2_METADATA_DISABLED", "true");
}

pub(crate) fn set_test_storage_env() {
    std::env::set_var("S3_ENDPOINT", "http://localhost:9000");
    std::env::set_var("S3_ACCESS_KEY", "test-access-key");
    std::env::set_var("S3_SECRET_KEY", "test-secret-key");
    std::env::set_var("S3_BUCKET", "lernwerk-test-bucket");
    std::env::set_var("S3_REGION", "eu-central-1");
}
