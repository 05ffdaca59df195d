//! Runtime configuration and credential loading.

use std::{fs, io};

use serde::Deserialize;
use url::Url;
use uuid::Uuid;
use veil::Redact;

/// Configuration assembled from the command line and the secrets file.
#[derive(Clone, Debug)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    /// Websocket endpoint of the orchestration server.
    pub server_url: Url,

    /// Inbound topic subscribed immediately after connect.
    pub topic: String,

    pub device_name: String,
    pub device_id: Uuid,

    pub user_agent: String,

    pub credentials: Credentials,
}

/// OAuth client credentials, loaded from the secrets file.
#[derive(Clone, Deserialize, Redact)]
pub struct Credentials {
    pub client_id: String,
    #[redact]
    pub client_secret: String,
    pub token_endpoint: Url,
}

impl Credentials {
    /// Loads the credentials from a TOML file.
    pub fn from_file(secrets_file: &str) -> io::Result<Self> {
        // Prevent out-of-memory condition: the secrets file should be small.
        let attributes = fs::metadata(secrets_file)?;
        if attributes.len() > 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{secrets_file} is too large"),
            ));
        }

        let contents = fs::read_to_string(secrets_file)?;
        let credentials = toml::from_str::<Self>(&contents).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{secrets_file} format is invalid: {e}"),
            )
        })?;

        if credentials.client_id.is_empty() || credentials.client_secret.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{secrets_file} does not contain client credentials"),
            ));
        }

        Ok(credentials)
    }
}

impl Config {
    /// Default inbound topic.
    const TOPIC: &'static str = "/topic/client";

    #[must_use]
    pub fn new(server_url: Url, credentials: Credentials) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let device_id = match machine_uid::get() {
            Ok(machine_id) => {
                let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, app_name.as_bytes());
                Uuid::new_v5(&namespace, machine_id.as_bytes())
            }
            Err(e) => {
                warn!("could not get machine id, using random device id: {e}");
                Uuid::new_v4()
            }
        };
        trace!("device uuid: {device_id}");

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        Self {
            app_name: app_name.clone(),
            app_version,

            server_url,
            topic: Self::TOPIC.to_owned(),

            device_name: app_name,
            device_id,

            user_agent,

            credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_output_redacts_the_secret() {
        let credentials = Credentials {
            client_id: "playbot".to_string(),
            client_secret: "hunter2".to_string(),
            token_endpoint: "https://auth.example.org/token".parse().unwrap(),
        };

        let debug = format!("{credentials:?}");
        assert!(debug.contains("playbot"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn config_defaults() {
        let credentials = Credentials {
            client_id: "playbot".to_string(),
            client_secret: "secret".to_string(),
            token_endpoint: "https://auth.example.org/token".parse().unwrap(),
        };
        let config = Config::new("wss://example.org/client".parse().unwrap(), credentials);

        assert_eq!(config.topic, "/topic/client");
        assert_eq!(config.app_name, env!("CARGO_PKG_NAME"));
    }
}
