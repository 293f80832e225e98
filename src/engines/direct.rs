//! Plain HTTP engine: pooled keep-alive connections, HTTP/2 when the server
//! offers it, and a rotating desktop user agent.

use std::time::Duration;

use async_trait::async_trait;

use super::headers::{DEFAULT_USER_AGENTS, browser_headers, merge, random_user_agent};
use super::{ClientPool, EngineError, EngineTier, FetchEngine, FetchRequest, read_body};

const MAX_IDLE_PER_HOST: usize = 50;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_REDIRECTS: usize = 10;

#[derive(Debug)]
pub struct DirectEngine {
    pool: ClientPool,
    user_agents: Vec<String>,
}

impl DirectEngine {
    pub fn new() -> Self {
        Self {
            pool: ClientPool::new(),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
        }
    }

    pub fn with_user_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agents: Vec<String> = agents.into_iter().map(Into::into).collect();
        if !agents.is_empty() {
            self.user_agents = agents;
        }
        self
    }
}

impl Default for DirectEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FetchEngine for DirectEngine {
    fn tier(&self) -> EngineTier {
        EngineTier::Direct
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<String, EngineError> {
        let client = self
            .pool
            .client("direct", request.proxy.as_deref(), |builder| {
                builder
                    .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
                    .pool_idle_timeout(IDLE_TIMEOUT)
                    .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            })
            .await?;

        let headers = merge(
            browser_headers(random_user_agent(&self.user_agents)),
            &request.headers,
        );
        log::debug!("direct GET {}", request.url);
        read_body(client.get(request.url.clone()).headers(headers), request.timeout).await
    }
}
