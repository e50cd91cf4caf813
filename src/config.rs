use std::{env, fmt::Display, fs::read_to_string, str::FromStr};

use tracing::{info, warn};

pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub admin_token: String,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("APP_PORT", "1111"),
            redis_url: try_load("REDIS_URL", "redis://127.0.0.1:6379"),
            admin_token: load_secret("ADMIN_API_TOKEN"),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}

/// Reads a secret from the environment, falling back to the Docker secrets
/// mount when the variable is absent.
fn load_secret(secret_name: &str) -> String {
    if let Ok(value) = env::var(secret_name) {
        return value.trim().to_string();
    }

    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            warn!("Failed to read {secret_name} from file: {e}");
        })
        .expect("Secrets misconfigured!")
}
