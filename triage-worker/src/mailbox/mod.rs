//! Mailbox gateway: the pipeline's view of the mail provider.
//!
//! The [`MailboxGateway`] trait covers everything the producer and worker need
//! from the provider. [`GmailGateway`] implements it over the Gmail REST API;
//! [`LabelResolver`] layers an idempotent lookup-or-create on top.

pub mod gmail;
pub mod labels;

use std::fmt;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ProviderError;

pub use gmail::GmailGateway;
pub use labels::LabelResolver;

/// System label marking a message as unread.
pub const UNREAD_LABEL: &str = "UNREAD";

/// Mailbox identity and credentials, passed to a gateway at construction.
#[derive(Clone)]
pub struct MailboxSession {
    /// Provider user id ("me" for the authenticated user)
    pub user_id: String,
    /// Address replies are sent from
    pub from_address: String,
    access_token: SecretString,
}

impl MailboxSession {
    pub fn new(user_id: String, from_address: String, access_token: SecretString) -> Self {
        Self {
            user_id,
            from_address,
            access_token,
        }
    }

    pub(crate) fn bearer(&self) -> &str {
        self.access_token.expose_secret()
    }
}

impl fmt::Debug for MailboxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxSession")
            .field("user_id", &self.user_id)
            .field("from_address", &self.from_address)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Provider message identifier.
pub type MessageRef = String;

/// The parts of a message the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Body snippet
    pub content: String,
    /// Sender address, used as the reply recipient
    pub sender: String,
}

/// A label in the provider's label space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub id: String,
    pub name: String,
}

/// Capability interface over the mail provider.
///
/// Every call may fail with a provider error; the pipeline turns that into a
/// failure of whichever step made the call.
#[async_trait]
pub trait MailboxGateway: Send + Sync {
    /// Ids of messages unread at the time of the call.
    async fn list_unread(&self) -> Result<Vec<MessageRef>, ProviderError>;

    async fn get(&self, message: &MessageRef) -> Result<MailMessage, ProviderError>;

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ProviderError>;

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError>;

    /// Create a label. Fails with [`ProviderError::LabelExists`] when the
    /// provider already has one with this name.
    async fn create_label(&self, name: &str) -> Result<Label, ProviderError>;

    async fn modify(
        &self,
        message: &MessageRef,
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<(), ProviderError>;
}

/// Extract the bare address from a `From` header value.
///
/// `"Jane <jane@x.com>"` becomes `"jane@x.com"`. Unparseable headers are
/// returned trimmed but otherwise unchanged.
pub fn sender_address(from_header: &str) -> String {
    let trimmed = from_header.trim();
    let parsed = match mailparse::addrparse(trimmed) {
        Ok(list) => list,
        Err(_) => return trimmed.to_string(),
    };

    let first = parsed.iter().find_map(|addr| match addr {
        mailparse::MailAddr::Single(info) => Some(info.addr.clone()),
        mailparse::MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
    });

    first.unwrap_or_else(|| trimmed.to_string())
}
