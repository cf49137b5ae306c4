use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::Config;

const ANALYTICS_ENDPOINT: &str = "https://api.bemidb.com/api/analytics";
const BEACON_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryData {
    db_host: String,
    os_name: String,
    db_conn_hash: String,
}

/// Fire the opt-out usage beacon. Never fails, never blocks longer than the
/// timeout, and stays silent for local source hosts.
pub async fn send_beacon(config: &Config, database_url: &str) {
    if config.disable_analytics {
        tracing::debug!("telemetry disabled");
        return;
    }

    let Ok(parsed) = url::Url::parse(database_url) else {
        return;
    };
    let Some(host) = parsed.host_str() else {
        return;
    };
    if is_local_host(host) {
        return;
    }

    let data = TelemetryData {
        db_host: host.to_string(),
        os_name: std::env::consts::OS.to_string(),
        db_conn_hash: sha256_hex(database_url),
    };

    let client = match reqwest::Client::builder().timeout(BEACON_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return,
    };
    let _ = client.post(ANALYTICS_ENDPOINT).json(&data).send().await;
}

fn is_local_host(hostname: &str) -> bool {
    matches!(hostname, "localhost" | "127.0.0.1" | "::1" | "[::1]" | "0.0.0.0")
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_hosts_are_recognized() {
        for host in ["localhost", "127.0.0.1", "::1", "0.0.0.0"] {
            assert!(is_local_host(host), "for {host}");
        }
        assert!(!is_local_host("db.example.com"));
    }

    #[test]
    fn conn_hash_is_stable_and_hex() {
        let a = sha256_hex("postgres://u:p@host/db");
        let b = sha256_hex("postgres://u:p@host/db");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn beacon_is_silent_for_local_sources() {
        // Returns without any network activity; completing at all is the test.
        let config = Config::default();
        send_beacon(&config, "postgres://u:p@localhost:5432/db").await;

        let disabled = Config {
            disable_analytics: true,
            ..Default::default()
        };
        send_beacon(&disabled, "postgres://u:p@db.example.com:5432/db").await;
    }
}
