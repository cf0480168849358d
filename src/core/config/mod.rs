mod parsing;
mod settings;
mod types;

pub(crate) use types::{
    AiBackend, AiSettings, ConfigError, Environment, Settings, StorageSettings, WorkerSettings,
};
