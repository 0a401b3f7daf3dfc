//! Idempotent lookup-or-create for category labels.
//!
//! Resolutions are serialized through one async mutex, so concurrent first
//! uses of a name inside this process issue a single create. Across processes
//! two creates can still race; the loser sees `LabelExists` and falls back to
//! a fresh lookup.
//!
//! Cached ids can go stale when a label is deleted in the mailbox. A rejected
//! `modify` evicts the entry and the label is resolved again once.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Label, MailboxGateway, MessageRef};
use crate::error::ProviderError;

/// Resolves label names to provider label ids, caching the result.
pub struct LabelResolver {
    gateway: Arc<dyn MailboxGateway>,
    cache: Mutex<HashMap<String, String>>,
}

impl LabelResolver {
    pub fn new(gateway: Arc<dyn MailboxGateway>) -> Self {
        Self {
            gateway,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Return the id of the label called `name`, creating it if needed.
    pub async fn resolve(&self, name: &str) -> Result<String, ProviderError> {
        let mut cache = self.cache.lock().await;
        if let Some(id) = cache.get(name) {
            return Ok(id.clone());
        }

        let id = match self.lookup(name).await? {
            Some(label) => label.id,
            None => match self.gateway.create_label(name).await {
                Ok(label) => {
                    info!(label = name, label_id = %label.id, "label_created");
                    label.id
                }
                Err(ProviderError::LabelExists(_)) => {
                    warn!(label = name, "label_create_conflict");
                    self.lookup(name)
                        .await?
                        .map(|label| label.id)
                        .ok_or_else(|| {
                            ProviderError::Decode(format!(
                                "label {name} reported as existing but not listed"
                            ))
                        })?
                }
                Err(e) => return Err(e),
            },
        };

        cache.insert(name.to_string(), id.clone());
        Ok(id)
    }

    /// Drop the cached id for `name`, if any.
    pub async fn forget(&self, name: &str) {
        if self.cache.lock().await.remove(name).is_some() {
            debug!(label = name, "label_cache_evicted");
        }
    }

    /// Add the label called `name` to `message` and remove `remove`.
    ///
    /// If the provider rejects the cached id, the id is resolved again and
    /// the modification retried once. Returns the label id that was applied.
    pub async fn apply(
        &self,
        message: &MessageRef,
        name: &str,
        remove: &[String],
    ) -> Result<String, ProviderError> {
        let id = self.resolve(name).await?;
        match self.gateway.modify(message, &[id.clone()], remove).await {
            Ok(()) => Ok(id),
            Err(e) if e.is_rejected_request() => {
                warn!(label = name, label_id = %id, error = %e, "label_id_rejected");
                self.forget(name).await;
                let id = self.resolve(name).await?;
                self.gateway
                    .modify(message, &[id.clone()], remove)
                    .await?;
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    async fn lookup(&self, name: &str) -> Result<Option<Label>, ProviderError> {
        let labels = self.gateway.list_labels().await?;
        let found = labels.into_iter().find(|label| label.name == name);
        debug!(label = name, found = found.is_some(), "label_lookup");
        Ok(found)
    }
}
