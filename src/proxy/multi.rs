//! Fan-out dispatch of one inbound request to several clusters in parallel,
//! merged into one client-visible response by a configurable policy.

use crate::proxy::context::{full_body, BoxBody};
use crate::proxy::handler::select_healthy_node;
use crate::proxy::header_rewrite::{self, ForwardedProto};
use crate::proxy::path_rewrite::rewrite_path;
use crate::server::GatewayState;
use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// How to collapse N per-leg responses into one client response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// First successful response wins.
    First,
    /// First failed response wins; falls back to first success if none failed.
    FirstError,
    /// Headers accumulated from all legs, bodies concatenated in submission order.
    All,
}

impl MergePolicy {
    pub fn parse(s: &str) -> Self {
        match s {
            "first_error" => MergePolicy::FirstError,
            "all" => MergePolicy::All,
            _ => MergePolicy::First,
        }
    }
}

/// Result of one fan-out leg.
pub struct ServiceResponse {
    pub service_id: String,
    pub node_id: String,
    pub url: String,
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub error: Option<String>,
    pub duration: Duration,
    pub start_time: Instant,
    pub success: bool,
}

/// Run one request against `service_ids` in parallel, bounded by
/// `max_concurrent` (0 = unlimited), sharing one pre-read copy of the body.
pub async fn fan_out(
    state: &GatewayState,
    service_ids: &[String],
    method: http::Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
    client_ip: IpAddr,
    host: &str,
    max_concurrent: usize,
) -> Vec<ServiceResponse> {
    use futures_util::stream::{self, StreamExt};

    let concurrency = if max_concurrent == 0 {
        service_ids.len().max(1)
    } else {
        max_concurrent
    };

    stream::iter(service_ids.iter().cloned())
        .map(|service_id| {
            let state = state.clone();
            let method = method.clone();
            let path_and_query = path_and_query.to_string();
            let mut headers = headers.clone();
            let body = body.clone();
            let host = host.to_string();
            async move {
                header_rewrite::rewrite_headers(
                    &mut headers,
                    client_ip,
                    ForwardedProto::Http,
                    &host,
                );
                run_leg(&state, service_id, method, path_and_query, headers, body).await
            }
        })
        .buffered(concurrency)
        .collect()
        .await
}

async fn run_leg(
    state: &GatewayState,
    service_id: String,
    method: http::Method,
    path_and_query: String,
    headers: HeaderMap,
    body: Bytes,
) -> ServiceResponse {
    let start = Instant::now();

    let Some(cluster) = state.upstream.get(&service_id) else {
        return ServiceResponse {
            service_id,
            node_id: String::new(),
            url: String::new(),
            status_code: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            error: Some("no eligible node: unknown service".to_string()),
            duration: start.elapsed(),
            start_time: start,
            success: false,
        };
    };

    let cfg = cluster.config();
    let cb_cfg = cfg.circuit_breaker.as_ref();
    let node_count = cluster.node_count();
    let Some((target, mut guard, addr)) =
        select_healthy_node(&cluster, &service_id, &[], cb_cfg, node_count)
    else {
        return ServiceResponse {
            service_id,
            node_id: String::new(),
            url: String::new(),
            status_code: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            error: Some("no eligible node".to_string()),
            duration: start.elapsed(),
            start_time: start,
            success: false,
        };
    };

    let (req_path, req_query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query.as_str(), None),
    };
    let effective_path = rewrite_path(&target.instance.target_path, req_path);
    let url = match req_query {
        Some(q) => format!("{}://{}{}?{}", target.scheme, addr, effective_path, q),
        None => format!("{}://{}{}", target.scheme, addr, effective_path),
    };

    let mut builder = Request::builder().method(method).uri(&url);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    let req = match builder.body(full_body(body)) {
        Ok(r) => r,
        Err(e) => {
            guard.mark_failed();
            return ServiceResponse {
                service_id,
                node_id: addr,
                url,
                status_code: 0,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                error: Some(format!("bad request: {}", e)),
                duration: start.elapsed(),
                start_time: start,
                success: false,
            };
        }
    };

    let client = cluster.http_client();
    let result = tokio::time::timeout(Duration::from_secs(10), client.request(req)).await;

    match result {
        Ok(Ok(resp)) => {
            let status = resp.status();
            let resp_headers = resp.headers().clone();
            let collected = match http_body_util::BodyExt::collect(resp.into_body()).await {
                Ok(c) => c.to_bytes(),
                Err(e) => {
                    return ServiceResponse {
                        service_id,
                        node_id: addr,
                        url,
                        status_code: status.as_u16(),
                        headers: resp_headers,
                        body: Bytes::new(),
                        error: Some(format!("upstream response error: {}", e)),
                        duration: start.elapsed(),
                        start_time: start,
                        success: false,
                    };
                }
            };
            let success = status.is_success();
            if !success {
                guard.mark_failed();
            }
            ServiceResponse {
                service_id,
                node_id: addr,
                url,
                status_code: status.as_u16(),
                headers: resp_headers,
                body: collected,
                error: None,
                duration: start.elapsed(),
                start_time: start,
                success,
            }
        }
        Ok(Err(e)) => {
            guard.mark_failed();
            ServiceResponse {
                service_id,
                node_id: addr,
                url,
                status_code: 0,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                error: Some(format!("upstream dial failed: {}", e)),
                duration: start.elapsed(),
                start_time: start,
                success: false,
            }
        }
        Err(_) => {
            guard.mark_failed();
            ServiceResponse {
                service_id,
                node_id: addr,
                url,
                status_code: 0,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                error: Some("timeout".to_string()),
                duration: start.elapsed(),
                start_time: start,
                success: false,
            }
        }
    }
}

/// Merge a completed set of leg results into a final client response per policy.
/// `require_all_success`, if set, short-circuits: the first failed leg (in
/// submission order) is written unmodified and the policy below is skipped.
pub fn merge_responses(
    legs: &[ServiceResponse],
    policy: MergePolicy,
    require_all_success: bool,
) -> http::Response<BoxBody> {
    if require_all_success {
        if let Some(failed) = legs.iter().find(|l| !l.success) {
            return build_response(failed.status_code, &failed.headers, failed.body.clone());
        }
    }

    match policy {
        MergePolicy::First => {
            if let Some(ok) = legs.iter().find(|l| l.success) {
                return build_response(ok.status_code, &ok.headers, ok.body.clone());
            }
            let msg = legs
                .first()
                .and_then(|l| l.error.clone())
                .unwrap_or_else(|| "all legs failed".to_string());
            gateway_error(&msg)
        }
        MergePolicy::FirstError => {
            if let Some(failed) = legs.iter().find(|l| !l.success) {
                return build_response(failed.status_code, &failed.headers, failed.body.clone());
            }
            if let Some(ok) = legs.iter().find(|l| l.success) {
                return build_response(ok.status_code, &ok.headers, ok.body.clone());
            }
            gateway_error("all legs failed")
        }
        MergePolicy::All => {
            let mut merged_headers = HeaderMap::new();
            let mut merged_body = Vec::new();
            let mut status = 0u16;
            for leg in legs {
                for (name, value) in &leg.headers {
                    merged_headers.append(name.clone(), value.clone());
                }
                merged_body.extend_from_slice(&leg.body);
                if status == 0 && leg.status_code != 0 {
                    status = leg.status_code;
                }
            }
            if status == 0 {
                status = 200;
            }
            build_response(status, &merged_headers, Bytes::from(merged_body))
        }
    }
}

fn build_response(status: u16, headers: &HeaderMap, body: Bytes) -> http::Response<BoxBody> {
    let mut builder = http::Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(full_body(body)).unwrap()
}

fn gateway_error(msg: &str) -> http::Response<BoxBody> {
    http::Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("content-type", "application/json")
        .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg(success: bool, status: u16, body: &str) -> ServiceResponse {
        ServiceResponse {
            service_id: "svc".into(),
            node_id: "node".into(),
            url: String::new(),
            status_code: status,
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
            error: if success { None } else { Some("err".into()) },
            duration: Duration::from_millis(1),
            start_time: Instant::now(),
            success,
        }
    }

    #[test]
    fn first_picks_first_success() {
        let legs = vec![leg(false, 0, ""), leg(true, 200, "b"), leg(true, 200, "c")];
        let resp = merge_responses(&legs, MergePolicy::First, false);
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn all_concatenates_in_order() {
        let legs = vec![leg(true, 200, "x"), leg(true, 201, "y")];
        let resp = merge_responses(&legs, MergePolicy::All, false);
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
