use crate::aggregator::Aggregator;
use crate::context::UserEnv;
use crate::transport::{ConnectionPool, Request, Response, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use trapeze_core::PoolConfig;

/// User environment over a mock transport, with a live aggregator behind it.
pub(crate) fn harness(transport: MockTransport) -> (UserEnv, Aggregator, Arc<MockTransport>) {
    let transport = Arc::new(transport);
    let aggregator = Aggregator::spawn(Duration::from_secs(1), None);
    let env = UserEnv {
        transport: transport.clone(),
        pool: ConnectionPool::new(&PoolConfig::default()),
        recorder: aggregator.recorder(),
        limiter: None,
        clock: Instant::now(),
        seed: Some(7),
        think_time: None,
    };
    (env, aggregator, transport)
}

#[derive(Clone, Debug, Default)]
struct Route {
    status: Option<u16>,
    delay: Option<Duration>,
    refuse: bool,
}

/// In-memory transport. Unknown URLs answer `200 {}` immediately.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    routes: HashMap<String, Route>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, url: &str, status: u16) -> Self {
        self.routes.entry(url.to_string()).or_default().status = Some(status);
        self
    }

    pub fn delay(mut self, url: &str, delay: Duration) -> Self {
        self.routes.entry(url.to_string()).or_default().delay = Some(delay);
        self
    }

    pub fn refuse(mut self, url: &str) -> Self {
        self.routes.entry(url.to_string()).or_default().refuse = true;
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.url.clone())
            .or_default() += 1;

        let route = self.routes.get(&request.url).cloned().unwrap_or_default();

        if let Some(delay) = route.delay {
            tokio::time::sleep(delay).await;
        }

        if route.refuse {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        Ok(Response {
            status: route.status.unwrap_or(200),
            headers: vec![],
            body: "{}".to_string(),
        })
    }
}
