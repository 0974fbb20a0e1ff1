//! Consumer construction.

use std::sync::Arc;

use crate::{config::Config, consumer::Consumer, service::QueueService, Result};

#[cfg(not(feature = "sqs"))]
use crate::QueueError;

/// Builds a [`Consumer`].
///
/// Created with [`Consumer::builder`]. Without an explicit
/// [`service`][Self::service], `build` constructs the default SQS transport
/// from the ambient AWS environment:
///
/// ```no_run
/// # use queuepump::{Config, Consumer};
/// # async {
/// let consumer = Consumer::builder(Config {
///     queue_name: Some("jobs".to_owned()),
///     ..Config::default()
/// })
/// .build()
/// .await?;
/// # anyhow::Ok(())
/// # };
/// ```
///
/// Tests and local development can swap the transport:
///
/// ```
/// # use queuepump::{Config, Consumer};
/// # use queuepump::service::InMemoryService;
/// # async {
/// let (service, queue_url) = InMemoryService::with_queue("jobs");
/// let consumer = Consumer::builder(Config {
///     queue_url: Some(queue_url),
///     ..Config::default()
/// })
/// .service(service)
/// .build()
/// .await?;
/// # anyhow::Ok(())
/// # };
/// ```
pub struct ConsumerBuilder {
    config: Config,
    service: Option<Arc<dyn QueueService>>,
}

impl ConsumerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            service: None,
        }
    }

    /// Uses the given transport instead of the default SQS client.
    pub fn service(mut self, service: impl QueueService) -> Self {
        self.service = Some(Arc::new(service));
        self
    }

    /// Same as [`service`][Self::service] for an already-shared client.
    pub fn shared_service(mut self, service: Arc<dyn QueueService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Validates the configuration and assembles the consumer. No service
    /// call is made until [`Consumer::start`] or the first operation.
    pub async fn build(self) -> Result<Consumer> {
        let config = self.config.validate()?;
        let service = match self.service {
            Some(service) => service,
            None => Self::default_service().await?,
        };
        Ok(Consumer::new(config, service))
    }

    #[cfg(feature = "sqs")]
    async fn default_service() -> Result<Arc<dyn QueueService>> {
        Ok(Arc::new(crate::service::SqsService::from_env().await))
    }

    #[cfg(not(feature = "sqs"))]
    async fn default_service() -> Result<Arc<dyn QueueService>> {
        Err(QueueError::Generic(
            "no transport configured: enable the `sqs` feature or supply one with `service(...)`"
                .into(),
        ))
    }
}
