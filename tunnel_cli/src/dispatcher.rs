//! Local HTTP dispatcher.
//!
//! Applies an inbound `RequestPayload` to the configured local app.

use std::collections::HashMap;

use tunnel_common::{constants, RequestPayload, ResponsePayload};

/// Issues an HTTP request against `local_url` for a non-upgrade
/// `RequestPayload`. Transport failures are mapped to a `502` response
/// rather than an `ERROR` envelope.
pub async fn dispatch(client: &reqwest::Client, local_url: &str, request: &RequestPayload) -> ResponsePayload {
    let url = build_url(local_url, &request.path, &request.query);

    let method = reqwest::Method::from_bytes(request.method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(method, &url);

    for (key, value) in &request.headers {
        if constants::is_hop_by_hop(key) {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_str());
    }

    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    match builder.send().await {
        Ok(response) => {
            let status_code = response.status().as_u16();
            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    let name = name.as_str();
                    if constants::is_hop_by_hop(name) {
                        return None;
                    }
                    value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
                })
                .collect();
            let body = response.bytes().await.unwrap_or_default();

            ResponsePayload {
                status_code,
                headers,
                body: if body.is_empty() { None } else { Some(body.to_vec()) },
            }
        }
        Err(error) => {
            tracing::warn!(error = %error, method = %request.method, path = %request.path, "local request failed");
            ResponsePayload {
                status_code: 502,
                headers: HashMap::new(),
                body: Some(format!("Bad Gateway: {error}").into_bytes()),
            }
        }
    }
}

fn build_url(local_url: &str, path: &str, query: &HashMap<String, String>) -> String {
    let mut url = format!("{}{}", local_url.trim_end_matches('/'), path);
    if !query.is_empty() {
        url.push('?');
        let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        url.push_str(&pairs.join("&"));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_appends_path_and_query() {
        let mut query = HashMap::new();
        query.insert("a".to_string(), "1".to_string());
        assert_eq!(build_url("http://127.0.0.1:8080", "/api", &query), "http://127.0.0.1:8080/api?a=1");
    }

    #[test]
    fn build_url_without_query() {
        let query = HashMap::new();
        assert_eq!(build_url("http://127.0.0.1:8080/", "/health", &query), "http://127.0.0.1:8080/health");
    }

    #[tokio::test]
    async fn dispatch_maps_unreachable_local_app_to_bad_gateway() {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        let request = RequestPayload {
            method: "GET".to_string(),
            path: "/".to_string(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: None,
            websocket_upgrade: false,
        };
        // Port 1 is reserved and nothing should be listening on it locally.
        let response = dispatch(&client, "http://127.0.0.1:1", &request).await;
        assert_eq!(response.status_code, 502);
    }
}
