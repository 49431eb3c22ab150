use anyhow::{Result, Context};
use reqwest::{redirect, Client, Response};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info};
use url::Url;

use crate::domain::{Task, TaskType};
use super::response::{ResponseType, RetrievalResponse, RetrievalState};

/// Loopback placeholder recorded when the host cannot be resolved
pub const UNRESOLVED_IP: &str = "127.0.0.1";

/// Headers compared by conditional downloads
const CONDITIONAL_HEADERS: [&str; 3] = ["etag", "last-modified", "content-length"];

/// Bounded HTTP download state machine
#[derive(Debug, Clone)]
pub struct RetrievalEngine {
    response_type: ResponseType,

    path_to_save: PathBuf,

    user_agent: String,
}

impl RetrievalEngine {
    pub fn new(response_type: ResponseType, path_to_save: PathBuf) -> Self {
        Self {
            response_type,
            path_to_save,
            user_agent: format!("harvester/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Run one attempt. Never fails: faults end up in the response state.
    /// The response is closed exactly once before it is returned.
    pub async fn retrieve(&self, task: &Task) -> RetrievalResponse {
        let mut response = RetrievalResponse::new(task, self.response_type, &self.path_to_save);
        let started = Instant::now();

        if let Err(e) = self.run(task, &mut response, started).await {
            debug!("Retrieval of {} failed: {:#}", task.url, e);
            response.fail(format!("{:#}", e));
        }

        if let Err(e) = response.close().await {
            response.fail(format!("{:#}", e));
        }
        response.duration = started.elapsed();

        debug!(
            "Retrieved {} -> {:?} ({} bytes in {:?})",
            task.url,
            response.state(),
            response.bytes_read,
            response.duration
        );

        response
    }

    async fn run(&self, task: &Task, response: &mut RetrievalResponse, started: Instant) -> Result<()> {
        let limits = &task.limits;
        let url = Url::parse(&task.url).context(format!("Invalid URL: {}", task.url))?;

        response.advance(RetrievalState::Connecting);
        response.source_ip = resolve_ip(&url, limits.connection_timeout()).await;

        let client = Client::builder()
            .redirect(redirect::Policy::limited(limits.max_redirects))
            .connect_timeout(limits.connection_timeout())
            .danger_accept_invalid_certs(true)
            .user_agent(self.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;

        let http_response = match timeout(limits.connection_timeout(), client.get(url).send()).await {
            Err(_) => {
                response.connection_setup = started.elapsed();
                response.finish(
                    RetrievalState::FinishedTimeLimit,
                    format!("connection setup exceeded {} ms", limits.connection_timeout_ms),
                );
                return Ok(());
            }
            Ok(Err(e)) if e.is_redirect() => {
                response.fail(format!("redirect limit of {} exceeded", limits.max_redirects));
                return Ok(());
            }
            Ok(Err(e)) if e.is_timeout() => {
                response.connection_setup = started.elapsed();
                response.finish(
                    RetrievalState::FinishedTimeLimit,
                    format!("connection setup exceeded {} ms", limits.connection_timeout_ms),
                );
                return Ok(());
            }
            Ok(Err(e)) => return Err(e).context(format!("Request to {} failed", task.url)),
            Ok(Ok(http_response)) => http_response,
        };

        // Status received
        response.connection_setup = started.elapsed();
        response.http_status = Some(http_response.status().as_u16());
        response.advance(RetrievalState::StatusReceived);

        if response.connection_setup > limits.connection_timeout() {
            response.finish(
                RetrievalState::FinishedTimeLimit,
                format!("connection setup took {} ms", response.connection_setup.as_millis()),
            );
            return Ok(());
        }

        // Headers received
        response.record_headers(http_response.headers());
        response.advance(RetrievalState::HeadersReceived);

        if started.elapsed() > limits.time_limit() {
            response.finish(
                RetrievalState::FinishedTimeLimit,
                format!("time limit of {} ms reached before the body", limits.termination_time_limit_ms),
            );
            return Ok(());
        }

        let status = http_response.status().as_u16();
        if status >= 400 {
            response.finish(RetrievalState::Error, format!("HTTP status {}", status));
            return Ok(());
        }

        if task.task_type == TaskType::CheckLink {
            response.finish(RetrievalState::Completed, "");
            return Ok(());
        }

        if task.task_type == TaskType::ConditionalDownload
            && headers_unchanged(&task.previous_headers, &response.headers)
        {
            response.finish(RetrievalState::Completed, "unchanged since previous retrieval");
            return Ok(());
        }

        self.read_body(task, http_response, response, started).await
    }

    async fn read_body(
        &self,
        task: &Task,
        mut http_response: Response,
        response: &mut RetrievalResponse,
        started: Instant,
    ) -> Result<()> {
        let limits = &task.limits;
        let body_started = Instant::now();

        loop {
            let remaining = limits.time_limit().saturating_sub(started.elapsed());
            if remaining.is_zero() {
                response.finish(
                    RetrievalState::FinishedTimeLimit,
                    format!("time limit of {} ms reached", limits.termination_time_limit_ms),
                );
                return Ok(());
            }

            let chunk = match timeout(remaining, http_response.chunk()).await {
                Err(_) => {
                    response.finish(
                        RetrievalState::FinishedTimeLimit,
                        format!("time limit of {} ms reached", limits.termination_time_limit_ms),
                    );
                    return Ok(());
                }
                Ok(chunk) => chunk.context(format!("Failed reading body of {}", task.url))?,
            };

            let Some(chunk) = chunk else {
                response.finish(RetrievalState::Completed, "");
                return Ok(());
            };

            response.write(&chunk).await?;

            if limits.termination_size_limit_bytes > 0
                && response.bytes_read > limits.termination_size_limit_bytes
            {
                info!("Size limit reached for {} after {} bytes", task.url, response.bytes_read);
                response.finish(
                    RetrievalState::FinishedSizeLimit,
                    format!("size limit of {} bytes exceeded", limits.termination_size_limit_bytes),
                );
                return Ok(());
            }

            let body_elapsed = body_started.elapsed();

            if limits.termination_min_bytes_per_sec > 0 && body_elapsed >= limits.limits_check_interval() {
                let rate = response.bytes_read as f64 / body_elapsed.as_secs_f64();
                if rate < limits.termination_min_bytes_per_sec as f64 {
                    info!("Rate limit reached for {}: {:.0} B/s", task.url, rate);
                    response.finish(
                        RetrievalState::FinishedRateLimit,
                        format!(
                            "average rate {:.0} B/s below {} B/s",
                            rate, limits.termination_min_bytes_per_sec
                        ),
                    );
                    return Ok(());
                }
            }

            if limits.bandwidth_limit_read_bytes_per_sec > 0 {
                let expected = Duration::from_secs_f64(
                    response.bytes_read as f64 / limits.bandwidth_limit_read_bytes_per_sec as f64,
                );
                if expected > body_elapsed {
                    sleep(expected - body_elapsed).await;
                }
            }
        }
    }
}

/// Resolve the address of the URL's host, falling back to a loopback placeholder
async fn resolve_ip(url: &Url, wait: Duration) -> String {
    let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
        return UNRESOLVED_IP.to_string();
    };

    let lookup = tokio::net::lookup_host((host.to_string(), port));
    match timeout(wait, lookup).await {
        Ok(Ok(mut addrs)) => addrs
            .next()
            .map(|addr: SocketAddr| addr.ip().to_string())
            .unwrap_or_else(|| UNRESOLVED_IP.to_string()),
        _ => {
            debug!("Could not resolve {}", host);
            UNRESOLVED_IP.to_string()
        }
    }
}

/// Every conditional header recorded previously must be present and equal,
/// and at least one must have been recorded.
pub fn headers_unchanged(previous: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> bool {
    let mut compared = 0;

    for name in CONDITIONAL_HEADERS {
        let recorded = previous
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value);

        if let Some(recorded) = recorded {
            compared += 1;
            if current.get(name) != Some(recorded) {
                return false;
            }
        }
    }

    compared > 0
}
