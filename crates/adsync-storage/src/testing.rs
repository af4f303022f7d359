//! Fake HTTP transport for exercising CRM flows without a network.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::{ApiRequest, ApiResponse, BackoffPolicy, FetchError, HttpFetcher, HttpTransport};

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, FetchError> + Send + Sync;

/// Answers every request through a closure and records what was sent.
pub struct ScriptedTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new(
        handler: impl Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::fallible(move |request| Ok(handler(request)))
    }

    pub fn fallible(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, FetchError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn fetcher(self: &Arc<Self>) -> HttpFetcher {
        let transport: Arc<dyn HttpTransport> = self.clone();
        HttpFetcher::with_transport(transport, BackoffPolicy::default())
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Requests whose URL ends with `suffix`, in send order.
    pub fn requests_to(&self, suffix: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.ends_with(suffix))
            .collect()
    }
}

impl fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("requests", &self.request_count())
            .finish()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        (self.handler)(request)
    }
}
