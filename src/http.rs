use std::time::Duration;

use log::warn;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;

use crate::error::{CollectorError, CollectorResult};

/// Fixed pause after an explicit throttling response.
pub const RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

/// Attempts per request when the upstream keeps throttling.
const RATE_LIMIT_ATTEMPTS: u32 = 3;

/// Builds the shared REST client used by polling and backfill strategies.
pub fn build_client(user_agent: &str) -> CollectorResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(30)
        .user_agent(user_agent)
        .build()
        .map_err(|e| CollectorError::Configuration(format!("http client: {e}")))
}

/// GET returning JSON.
///
/// ERROR MAPPING:
/// - 429            -> sleep RATE_LIMIT_DELAY, retry the same request;
///                     RateLimit once the attempts are used up
/// - other non-2xx  -> TransientNetwork
/// - transport      -> TransientNetwork
/// - bad JSON body  -> Protocol
pub async fn get_json(client: &Client, base: &str, params: &[(&str, String)]) -> CollectorResult<Value> {
    let url = Url::parse_with_params(base, params)
        .map_err(|e| CollectorError::Configuration(format!("bad url {base}: {e}")))?;

    for attempt in 1..=RATE_LIMIT_ATTEMPTS {
        let response = client.get(url.clone()).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Rate limit hit on {} (attempt {attempt}), waiting", url.path());
            tokio::time::sleep(RATE_LIMIT_DELAY).await;
            continue;
        }

        if !status.is_success() {
            return Err(CollectorError::TransientNetwork(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url.path()
            )));
        }

        let body = response.text().await?;
        return Ok(serde_json::from_str(&body)?);
    }

    Err(CollectorError::RateLimit(format!(
        "{} still throttled after {RATE_LIMIT_ATTEMPTS} attempts",
        url.path()
    )))
}
