//! Resilient client facade.
//!
//! Ties size estimation, the circuit breaker and the degradation controller
//! together behind one entry point per job.

use forkwatch_core::BreakerProfile;
use std::sync::Arc;

use crate::config::ResilienceConfig;
use crate::controller::{CancellationSignal, GracefulDegradationController, ItemReport, WorkItem};
use crate::estimator::{RepositorySizeEstimator, SizeEstimate};
use crate::observer::{JobObserver, TracingObserver};
use crate::resilience::{
    Admission, CircuitBreaker, EndpointGroup, RateLimitHandler, Transition, TransitionListener,
};
use crate::transport::{send_checked, ApiRequest, ApiResponse, Transport};
use crate::RuntimeError;

/// Everything a finished job produced.
#[derive(Debug, Clone)]
pub struct JobReport<T> {
    /// Size estimate the breaker profile came from
    pub estimate: SizeEstimate,

    /// One report per submitted item, in submission order
    pub reports: Vec<ItemReport<T>>,
}

impl<T> JobReport<T> {
    pub fn successes(&self) -> usize {
        self.reports.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn failures(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.failure_kind().is_some())
            .count()
    }
}

/// Endpoint group for a request path.
///
/// `/repos/{owner}/{name}/{resource}/...` maps to `resource`; anything else
/// (including the repository itself) maps to `repos`.
pub fn endpoint_group_for(path: &str) -> EndpointGroup {
    let mut segments = path.trim_matches('/').split('/');
    match (segments.next(), segments.nth(2)) {
        (Some("repos"), Some(resource)) if !resource.is_empty() => EndpointGroup::from(resource),
        _ => EndpointGroup::from("repos"),
    }
}

/// Public entry point for resilient GitHub traversals.
pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    config: ResilienceConfig,
    observer: Arc<dyn JobObserver>,
    estimator: RepositorySizeEstimator,
    handler: RateLimitHandler,

    /// Breaker shared by single calls for the client's lifetime
    breaker: Arc<CircuitBreaker>,
}

impl ResilientClient {
    pub fn builder() -> ResilientClientBuilder {
        ResilientClientBuilder::new()
    }

    fn new(
        transport: Arc<dyn Transport>,
        config: ResilienceConfig,
        observer: Arc<dyn JobObserver>,
    ) -> Self {
        let estimator = RepositorySizeEstimator::new(transport.clone())
            .with_count_field(config.count_field.clone());
        let profile = config
            .profile_override
            .unwrap_or_else(BreakerProfile::smallest);
        let breaker = Arc::new(Self::breaker_for(profile, &config, &observer));

        tracing::debug!(
            transport = transport.name(),
            concurrency = config.concurrency,
            "Created resilient client"
        );

        Self {
            handler: RateLimitHandler::from_config(&config),
            transport,
            config,
            observer,
            estimator,
            breaker,
        }
    }

    fn breaker_for(
        profile: BreakerProfile,
        config: &ResilienceConfig,
        observer: &Arc<dyn JobObserver>,
    ) -> CircuitBreaker {
        let observer = observer.clone();
        let listener: TransitionListener =
            Arc::new(move |t: &Transition| observer.on_breaker_transition(t));
        CircuitBreaker::new(profile, config.weights).with_listener(listener)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Breaker used by [`fetch`](Self::fetch).
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Size the job for `target`, or use the configured override.
    pub async fn estimate(&self, target: &str) -> SizeEstimate {
        let estimate = match &self.config.profile_override {
            Some(profile) => SizeEstimate {
                target: target.to_string(),
                item_count: None,
                profile: *profile,
                degraded: false,
            },
            None => self.estimator.estimate(target).await,
        };
        self.observer.on_estimate(&estimate);
        estimate
    }

    /// Fetch every request for `target` as one job.
    ///
    /// Requests are keyed by caller-chosen ids and grouped by endpoint.
    pub async fn fetch_all(
        &self,
        target: &str,
        requests: Vec<(String, ApiRequest)>,
        cancel: CancellationSignal,
    ) -> JobReport<ApiResponse> {
        let items: Vec<WorkItem<ApiResponse>> = requests
            .into_iter()
            .map(|(id, request)| {
                let group = endpoint_group_for(&request.path);
                let transport = self.transport.clone();
                WorkItem::new(id, move || {
                    let transport = transport.clone();
                    let request = request.clone();
                    async move { send_checked(transport.as_ref(), request).await }
                })
                .in_group(group)
            })
            .collect();

        self.run_job(target, items, cancel).await
    }

    /// Run arbitrary work items for `target` with a breaker sized to it.
    ///
    /// Each job gets a fresh breaker built from its estimate.
    pub async fn run_job<T>(
        &self,
        target: &str,
        items: Vec<WorkItem<T>>,
        cancel: CancellationSignal,
    ) -> JobReport<T>
    where
        T: Send + 'static,
    {
        let estimate = self.estimate(target).await;
        let breaker = Arc::new(Self::breaker_for(
            estimate.profile,
            &self.config,
            &self.observer,
        ));
        let controller = GracefulDegradationController::new(breaker, &self.config)
            .with_observer(self.observer.clone());

        tracing::info!(repo = target, items = items.len(), "Running job");
        let reports = controller.run_all(items, cancel).await;

        JobReport { estimate, reports }
    }

    /// One call outside any job, through the client-lifetime breaker.
    pub async fn fetch(&self, request: ApiRequest) -> Result<ApiResponse, RuntimeError> {
        let group = endpoint_group_for(&request.path);
        let permit = match self.breaker.admit(&group) {
            Admission::Admitted(permit) => permit,
            Admission::Denied { retry_in } => {
                return Err(RuntimeError::CircuitOpen { group, retry_in });
            }
        };

        let transport = self.transport.as_ref();
        let result = self
            .handler
            .execute(|| {
                let request = request.clone();
                async move { send_checked(transport, request).await }
            })
            .await;

        match result {
            Ok(response) => {
                self.breaker.record_success(&permit);
                Ok(response)
            }
            Err(failure) => {
                self.breaker.record_failure(&permit, failure.kind);
                Err(failure.into())
            }
        }
    }

    /// Like [`fetch`](Self::fetch), then parse the body as JSON.
    pub async fn fetch_json<T>(&self, request: ApiRequest) -> Result<T, RuntimeError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self.fetch(request).await?;
        Ok(response.json()?)
    }
}

/// Builder for [`ResilientClient`].
pub struct ResilientClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    config: ResilienceConfig,
    observer: Arc<dyn JobObserver>,
}

impl ResilientClientBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            config: ResilienceConfig::default(),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Set the transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default [`TracingObserver`].
    pub fn observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate the configuration and build the client.
    pub fn build(self) -> Result<ResilientClient, RuntimeError> {
        let transport = self.transport.ok_or(RuntimeError::NotConfigured)?;
        self.config.validate()?;
        Ok(ResilientClient::new(transport, self.config, self.observer))
    }
}

impl Default for ResilientClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
