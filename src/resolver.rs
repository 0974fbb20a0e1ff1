//! Queue-URL resolution with a one-shot cache.

use tokio::sync::OnceCell;
use url::Url;

use crate::{service::QueueService, QueueError, Result};

/// Resolves the consumer's queue URL.
///
/// An explicitly configured URL is returned as-is without a service call.
/// Otherwise the queue name is looked up once through `GetQueueUrl` and the
/// answer cached for the consumer's lifetime. With `correct_queue_url` set,
/// the resolved URL's scheme, host and port are rewritten to those of the
/// service endpoint while the path is preserved.
pub(crate) struct QueueResolver {
    queue_url: Option<String>,
    queue_name: Option<String>,
    account_number: Option<String>,
    correct_queue_url: bool,
    cached: OnceCell<String>,
}

impl QueueResolver {
    pub(crate) fn new(
        queue_url: Option<String>,
        queue_name: Option<String>,
        account_number: Option<String>,
        correct_queue_url: bool,
    ) -> Self {
        Self {
            queue_url,
            queue_name,
            account_number,
            correct_queue_url,
            cached: OnceCell::new(),
        }
    }

    pub(crate) async fn resolve(&self, service: &dyn QueueService) -> Result<String> {
        self.cached
            .get_or_try_init(|| self.lookup(service))
            .await
            .cloned()
    }

    async fn lookup(&self, service: &dyn QueueService) -> Result<String> {
        if let Some(url) = &self.queue_url {
            return Ok(url.clone());
        }
        let name = self
            .queue_name
            .as_deref()
            .ok_or(QueueError::MissingQueueIdentity)?;
        let resolved = service
            .get_queue_url(name, self.account_number.as_deref())
            .await?;
        tracing::debug!(queue_name = name, queue_url = %resolved, "resolved queue URL");

        if self.correct_queue_url {
            if let Some(endpoint) = service.endpoint() {
                return rewrite_origin(&resolved, &endpoint);
            }
        }
        Ok(resolved)
    }
}

/// Replaces `resolved`'s scheme/host/port with the endpoint's.
fn rewrite_origin(resolved: &str, endpoint: &Url) -> Result<String> {
    let mut url = Url::parse(resolved).map_err(QueueError::generic)?;
    url.set_scheme(endpoint.scheme())
        .map_err(|_| QueueError::Generic("endpoint scheme not applicable".into()))?;
    url.set_host(endpoint.host_str())
        .map_err(QueueError::generic)?;
    url.set_port(endpoint.port())
        .map_err(|_| QueueError::Generic("endpoint port not applicable".into()))?;
    Ok(url.into())
}
