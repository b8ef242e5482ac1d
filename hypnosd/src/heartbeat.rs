//! Sleeper-side heartbeat loop.
//!
//! Keeps the waker's liveness record fresh by POSTing the config checksum
//! on a fixed period. The loop is fire-and-forget: it starts before the
//! HTTP server and runs until the process dies. Nothing that happens in a
//! cycle can stop it; an unreachable waker is the normal case whenever
//! that machine is asleep, so it only rates a debug line.

use std::sync::Arc;

use reqwest::Client;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::http::API_KEY_HEADER;
use crate::models::{HeartbeatAck, HeartbeatIn};

pub fn spawn_heartbeat_sender(cfg: Arc<AppConfig>, checksum: Arc<String>) {
    tokio::spawn(async move {
        let client = match Client::builder().timeout(cfg.common.request_timeout()).build() {
            Ok(client) => client,
            Err(e) => {
                error!("failed to build heartbeat HTTP client: {e}");
                return;
            }
        };
        let url = format!("{}/heartbeat", cfg.waker_url());
        let period = cfg.common.heartbeat_period();
        info!(
            "heartbeat sender started, {}s period, target {url}",
            period.as_secs()
        );

        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            send_heartbeat(&client, &url, &cfg.common.api_key, &checksum).await;
        }
    });
}

async fn send_heartbeat(client: &Client, url: &str, api_key: &str, checksum: &str) {
    let body = HeartbeatIn {
        checksum: checksum.to_string(),
    };
    let result = client
        .post(url)
        .header(API_KEY_HEADER, api_key)
        .json(&body)
        .send()
        .await;

    match result {
        Ok(res) if res.status().is_success() => match res.json::<HeartbeatAck>().await {
            Ok(ack) => handle_ack(&ack, checksum),
            Err(e) => warn!("unparsable heartbeat acknowledgment: {e}"),
        },
        Ok(res) => warn!("heartbeat rejected by waker: HTTP {}", res.status()),
        // Connection refused, timeout, resolution failure: the waker is
        // asleep or we are not network-ready yet. Expected, retried.
        Err(e) if e.is_connect() || e.is_timeout() => {
            debug!("waker unreachable, retrying next cycle: {e}");
        }
        Err(e) => warn!("heartbeat delivery failed: {e}"),
    }
}

fn handle_ack(ack: &HeartbeatAck, checksum: &str) {
    if ack.config_compatible {
        debug!("heartbeat acknowledged, waker tracks state {}", ack.state);
    } else {
        error!(
            "config checksum mismatch: ours is {checksum}, waker reports {}",
            ack.waker_checksum.as_deref().unwrap_or("<unknown>")
        );
    }
}
