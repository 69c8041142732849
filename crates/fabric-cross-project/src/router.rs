//! # Cross-Project Router
//!
//! The authorization, quota, and signing pipeline in front of the broker.
//! `send_message` rejects synchronously, in order: registration, target
//! policy, event-type policy, contract coverage, rate limit - and only
//! then builds, signs, and publishes the envelope on the
//! target-namespaced channel. A rejected send has no side effects.

use crate::error::CrossProjectError;
use crate::registry::{ContractRegistry, ProjectRegistry};
use crate::security::{current_timestamp, sign_envelope, verify_envelope, NonceCache};
use crate::PROJECT_GROUP_PREFIX;
use dashmap::DashMap;
use fabric_bus::{
    handler_fn, Broker, HandlerError, MessageHandler, SubscriptionHandle, SubscriptionSpec,
};
use fabric_telemetry::metrics as tm;
use fabric_types::{
    Channel, ChannelType, CrossProjectEventContract, CrossProjectMessage, EnvelopePayload,
    EnvelopeSecurity, EnvelopeSource, EnvelopeTarget, Message, MessageMetadata, ProjectConfig,
    RateLimiter,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-send metadata overrides.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Correlates request/reply pairs end-to-end.
    pub correlation_id: Option<Uuid>,
    /// Distributed trace id.
    pub trace_id: Option<String>,
    /// Scheduling hint carried opaquely.
    pub priority: Option<String>,
}

/// Handler wiring options.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Reject envelopes whose signature does not verify, without invoking
    /// the handler.
    pub require_signature_validation: bool,
    /// Concurrent handler invocations.
    pub max_concurrency: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            require_signature_validation: true,
            max_concurrency: 1,
        }
    }
}

/// Diagnostic read over a project's setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Aggregate cross-project counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrossProjectStats {
    pub projects: usize,
    pub contracts: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_failed: u64,
    pub rate_limit_hits: u64,
    /// Mean send-pipeline latency in milliseconds.
    pub avg_latency_ms: f64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
}

struct RouterInner {
    broker: Arc<dyn Broker>,
    projects: ProjectRegistry,
    contracts: ContractRegistry,
    limiters: DashMap<String, Arc<RateLimiter>>,
    nonces: NonceCache,
    counters: Counters,
}

/// Routes signed envelopes between registered projects over a broker.
#[derive(Clone)]
pub struct CrossProjectRouter {
    inner: Arc<RouterInner>,
}

impl CrossProjectRouter {
    /// Create a router over the given broker.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                broker,
                projects: ProjectRegistry::new(),
                contracts: ContractRegistry::new(),
                limiters: DashMap::new(),
                nonces: NonceCache::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Register a project (tenant).
    ///
    /// # Errors
    ///
    /// `CrossProjectError::InvalidProjectConfig` for missing identity
    /// fields.
    pub fn register_project(&self, config: ProjectConfig) -> Result<(), CrossProjectError> {
        // Policy replacement resets the project's token bucket too.
        self.inner.limiters.remove(&config.project_id);
        self.inner.projects.register(config)
    }

    /// Register an event contract.
    ///
    /// # Errors
    ///
    /// `CrossProjectError::InvalidContract` for missing fields.
    pub fn register_contract(
        &self,
        contract: CrossProjectEventContract,
    ) -> Result<(), CrossProjectError> {
        self.inner.contracts.register(contract)
    }

    /// Send `payload` as `event_type` from one project to another.
    ///
    /// Returns the published message id.
    ///
    /// # Errors
    ///
    /// The pipeline rejects, in order: `ProjectNotRegistered`,
    /// `CommunicationNotAllowed`, `EventTypeNotAuthorized`,
    /// `ContractNotCovered`, `RateLimitExceeded`, then broker publish
    /// failures.
    pub async fn send_message(
        &self,
        source_project_id: &str,
        target_project_id: &str,
        event_type: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<Uuid, CrossProjectError> {
        let started = Instant::now();
        let result = self
            .inner
            .send_pipeline(
                source_project_id,
                target_project_id,
                event_type,
                payload,
                options,
            )
            .await;

        let counters = &self.inner.counters;
        match &result {
            Ok(_) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                tm::CROSS_PROJECT_MESSAGES_SENT.inc();
                let micros = started.elapsed().as_micros() as u64;
                counters.latency_micros.fetch_add(micros, Ordering::Relaxed);
                counters.latency_samples.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tm::CROSS_PROJECT_MESSAGES_FAILED
                    .with_label_values(&[failure_label(error)])
                    .inc();
                if matches!(error, CrossProjectError::RateLimitExceeded { .. }) {
                    counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    tm::CROSS_PROJECT_RATE_LIMITED.inc();
                }
            }
        }
        result
    }

    /// Subscribe `handler` to an event type addressed to a project.
    ///
    /// Delivery uses the per-project consumer group
    /// (`project-<target_project_id>`), so multiple handler instances for
    /// one project compete rather than duplicate. The handler receives
    /// the de-enveloped business message; when signature validation is
    /// required, envelopes that fail verification are nacked without
    /// invoking it.
    ///
    /// # Errors
    ///
    /// `ProjectNotRegistered` for an unknown target, plus broker
    /// subscribe failures.
    pub async fn setup_message_handler(
        &self,
        target_project_id: &str,
        event_type: &str,
        handler: Arc<dyn MessageHandler>,
        options: HandlerOptions,
    ) -> Result<SubscriptionHandle, CrossProjectError> {
        let target = self.inner.registered(target_project_id)?;
        let channel_name = format!("{}.{}", target.namespace, event_type);
        self.inner
            .broker
            .channels()
            .ensure(Channel::new(channel_name.clone(), ChannelType::Topic))
            .map_err(fabric_bus::PublishError::from)?;

        let spec = SubscriptionSpec::new(&channel_name)
            .map_err(|e| fabric_bus::PublishError::from(fabric_types::ChannelError::InvalidName {
                name: channel_name.clone(),
                reason: e.to_string(),
            }))?
            .with_group(format!("{PROJECT_GROUP_PREFIX}{target_project_id}"))
            .with_max_concurrency(options.max_concurrency.max(1));

        let wrapped = RouterInner::wrap_handler(
            Arc::clone(&self.inner),
            handler,
            options.require_signature_validation,
        );
        let handle = self
            .inner
            .broker
            .subscribe(spec, wrapped)
            .await
            .map_err(|e| {
                fabric_bus::PublishError::from(fabric_types::ChannelError::InvalidName {
                    name: channel_name,
                    reason: e.to_string(),
                })
            })?;
        Ok(handle)
    }

    /// Diagnostic read: configuration problems that will not block
    /// registration but will bite at send/receive time.
    #[must_use]
    pub fn validate_project_setup(&self, project_id: &str) -> ValidationReport {
        let mut report = ValidationReport::default();

        let Some(project) = self.inner.projects.get(project_id) else {
            report
                .errors
                .push(format!("project '{project_id}' is not registered"));
            return report;
        };

        if project.allowed_event_types.is_empty() {
            report
                .warnings
                .push("allowed_event_types is empty; this project can never send".to_string());
        }
        if project.allowed_targets.is_empty() {
            report
                .warnings
                .push("allowed_targets is empty; this project can never send".to_string());
        }
        if self.inner.contracts.for_source(project_id).is_empty() {
            report
                .warnings
                .push("no contracts registered with this project as source".to_string());
        }
        if project.credentials.is_none() {
            report
                .recommendations
                .push("configure signing credentials so envelopes can be verified".to_string());
        }
        if project.rate_limiting.is_none() {
            report
                .recommendations
                .push("configure rate limiting to bound outbound volume".to_string());
        }

        report.is_valid = report.errors.is_empty();
        report
    }

    /// Aggregate counters.
    #[must_use]
    pub fn get_stats(&self) -> CrossProjectStats {
        let counters = &self.inner.counters;
        let samples = counters.latency_samples.load(Ordering::Relaxed);
        let micros = counters.latency_micros.load(Ordering::Relaxed);
        CrossProjectStats {
            projects: self.inner.projects.len(),
            contracts: self.inner.contracts.len(),
            messages_sent: counters.sent.load(Ordering::Relaxed),
            messages_received: counters.received.load(Ordering::Relaxed),
            messages_failed: counters.failed.load(Ordering::Relaxed),
            rate_limit_hits: counters.rate_limited.load(Ordering::Relaxed),
            avg_latency_ms: if samples == 0 {
                0.0
            } else {
                (micros as f64 / samples as f64) / 1000.0
            },
        }
    }
}

impl RouterInner {
    fn registered(&self, project_id: &str) -> Result<ProjectConfig, CrossProjectError> {
        self.projects
            .get(project_id)
            .ok_or_else(|| CrossProjectError::ProjectNotRegistered {
                project_id: project_id.to_string(),
            })
    }

    async fn send_pipeline(
        &self,
        source_project_id: &str,
        target_project_id: &str,
        event_type: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<Uuid, CrossProjectError> {
        let source = self.registered(source_project_id)?;
        let target = self.registered(target_project_id)?;

        if !source.allowed_targets.contains(target_project_id) {
            return Err(CrossProjectError::CommunicationNotAllowed {
                source: source_project_id.to_string(),
                target: target_project_id.to_string(),
            });
        }
        if !source.allowed_event_types.contains(event_type) {
            return Err(CrossProjectError::EventTypeNotAuthorized {
                source: source_project_id.to_string(),
                event_type: event_type.to_string(),
            });
        }
        // Project policy and contract coverage must BOTH pass.
        if !self
            .contracts
            .covers(source_project_id, target_project_id, event_type)
        {
            return Err(CrossProjectError::ContractNotCovered {
                source: source_project_id.to_string(),
                target: target_project_id.to_string(),
                event_type: event_type.to_string(),
            });
        }

        if let Some(policy) = &source.rate_limiting {
            let limiter = self
                .limiters
                .entry(source.project_id.clone())
                .or_insert_with(|| Arc::new(RateLimiter::from_policy(policy)))
                .clone();
            if !limiter.try_acquire() {
                return Err(CrossProjectError::RateLimitExceeded {
                    project_id: source_project_id.to_string(),
                });
            }
        }

        let envelope_payload = EnvelopePayload {
            metadata: MessageMetadata {
                correlation_id: options.correlation_id,
                trace_id: options.trace_id,
                priority: options.priority,
                retry_count: 0,
            },
            data: payload,
        };
        let security = match &source.credentials {
            Some(credentials) => sign_envelope(&envelope_payload, credentials.secret.as_bytes()),
            // Unsigned envelopes are deliverable only to handlers that opt
            // out of signature validation.
            None => EnvelopeSecurity {
                signature: String::new(),
                timestamp: current_timestamp(),
                nonce: Uuid::new_v4(),
            },
        };

        let envelope = CrossProjectMessage {
            source: EnvelopeSource {
                project_id: source.project_id.clone(),
                namespace: source.namespace.clone(),
                version: CrossProjectMessage::CURRENT_VERSION.to_string(),
            },
            target: EnvelopeTarget {
                project_id: target.project_id.clone(),
                namespace: target.namespace.clone(),
            },
            event_type: event_type.to_string(),
            payload: envelope_payload,
            security,
        };

        let channel_name = format!("{}.{}", target.namespace, event_type);
        self.broker
            .channels()
            .ensure(Channel::new(channel_name.clone(), ChannelType::Topic))
            .map_err(fabric_bus::PublishError::from)?;

        let envelope_json = serde_json::to_value(&envelope).map_err(|e| {
            CrossProjectError::Publish(fabric_bus::PublishError::Store {
                reason: format!("envelope encoding failed: {e}"),
            })
        })?;
        let message = Message::new(
            channel_name.clone(),
            format!("ossa://agents/{}", source.project_id),
            event_type,
            envelope_json,
        );

        let message_id = self.broker.publish(&channel_name, message).await?;
        debug!(
            source = %source.project_id,
            target = %target.project_id,
            event_type,
            message_id = %message_id,
            "Cross-project message sent"
        );
        Ok(message_id)
    }

    fn wrap_handler(
        inner: Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        require_signature: bool,
    ) -> Arc<dyn MessageHandler> {
        handler_fn(move |message: Message| {
            let inner = Arc::clone(&inner);
            let handler = Arc::clone(&handler);
            async move {
                let envelope: CrossProjectMessage =
                    serde_json::from_value(message.payload.clone())
                        .map_err(|e| HandlerError::new(format!("malformed envelope: {e}")))?;

                if require_signature {
                    let secret = inner
                        .projects
                        .get(&envelope.source.project_id)
                        .and_then(|p| p.credentials)
                        .map(|c| c.secret);
                    let Some(secret) = secret else {
                        warn!(
                            source = %envelope.source.project_id,
                            "Envelope from project with no signing secret; rejecting"
                        );
                        return Err(HandlerError::new("unknown signing key"));
                    };
                    if let Err(failure) =
                        verify_envelope(&envelope, secret.as_bytes(), &inner.nonces)
                    {
                        warn!(
                            source = %envelope.source.project_id,
                            failure = ?failure,
                            "Envelope failed verification; rejected without invoking handler"
                        );
                        return Err(HandlerError::new(format!(
                            "verification failed: {failure:?}"
                        )));
                    }
                }

                inner.counters.received.fetch_add(1, Ordering::Relaxed);
                tm::CROSS_PROJECT_MESSAGES_RECEIVED.inc();

                // Hand the consumer the de-enveloped business message.
                let business = Message {
                    id: message.id,
                    channel: message.channel.clone(),
                    sender: message.sender.clone(),
                    timestamp: message.timestamp,
                    message_type: envelope.event_type.clone(),
                    payload: envelope.payload.data.clone(),
                    metadata: envelope.payload.metadata.clone(),
                };
                handler.handle(business).await
            }
        })
    }
}

fn failure_label(error: &CrossProjectError) -> &'static str {
    match error {
        CrossProjectError::InvalidProjectConfig { .. }
        | CrossProjectError::InvalidContract { .. } => "validation",
        CrossProjectError::ProjectNotRegistered { .. }
        | CrossProjectError::CommunicationNotAllowed { .. }
        | CrossProjectError::EventTypeNotAuthorized { .. } => "authorization",
        CrossProjectError::ContractNotCovered { .. } => "contract",
        CrossProjectError::RateLimitExceeded { .. } => "rate_limit",
        CrossProjectError::InvalidSignature { .. } => "signature",
        CrossProjectError::Publish(_) => "publish",
    }
}
