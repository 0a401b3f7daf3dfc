//! Gmail REST implementation of the mailbox gateway.
//!
//! Token acquisition and refresh happen elsewhere; the gateway just sends the
//! session's bearer token with every request.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::{sender_address, Label, MailMessage, MailboxGateway, MailboxSession, MessageRef};
use crate::error::ProviderError;

/// Gmail API client bound to one mailbox session.
pub struct GmailGateway {
    client: Client,
    base: Url,
    session: MailboxSession,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageId>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    #[serde(default)]
    snippet: String,
    payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct MessagePart {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabel {
    #[serde(default, skip_serializing)]
    id: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label_list_visibility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_list_visibility: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest<'a> {
    add_label_ids: &'a [String],
    remove_label_ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct SendRequest {
    raw: String,
}

impl GmailGateway {
    pub fn new(client: Client, base: Url, session: MailboxSession) -> Self {
        Self {
            client,
            base,
            session,
        }
    }

    fn url(&self, path: &str) -> Result<Url, ProviderError> {
        self.base
            .join(&format!("users/{}/{}", self.session.user_id, path))
            .map_err(|e| ProviderError::Decode(format!("invalid Gmail URL: {e}")))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.session.bearer())
    }

    /// Send a request and fail on any non-success status.
    async fn execute(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Build a base64url-encoded RFC 5322 message for `messages.send`.
fn encode_raw_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    let raw = format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{}",
        strip_newlines(from),
        strip_newlines(to),
        strip_newlines(subject),
        body
    );
    URL_SAFE.encode(raw.as_bytes())
}

/// Header values must stay on one line.
fn strip_newlines(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[async_trait]
impl MailboxGateway for GmailGateway {
    async fn list_unread(&self) -> Result<Vec<MessageRef>, ProviderError> {
        let url = self.url("messages")?;
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(url.clone()).query(&[("q", "is:unread")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: MessageList = self.execute(request).await?.json().await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(count = ids.len(), "gmail_unread_listed");
        Ok(ids)
    }

    async fn get(&self, message: &MessageRef) -> Result<MailMessage, ProviderError> {
        let url = self.url(&format!("messages/{message}"))?;
        let request = self
            .client
            .get(url)
            .query(&[("format", "metadata"), ("metadataHeaders", "From")]);

        let msg: GmailMessage = self.execute(request).await?.json().await?;

        let from = msg
            .payload
            .as_ref()
            .and_then(|p| p.headers.iter().find(|h| h.name.eq_ignore_ascii_case("From")))
            .map(|h| h.value.as_str())
            .ok_or_else(|| {
                ProviderError::Decode(format!("message {message} has no From header"))
            })?;

        Ok(MailMessage {
            content: msg.snippet,
            sender: sender_address(from),
        })
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ProviderError> {
        let url = self.url("messages/send")?;
        let raw = encode_raw_message(&self.session.from_address, to, subject, body);

        self.execute(self.client.post(url).json(&SendRequest { raw }))
            .await?;

        info!(to = %to, body_length = body.len(), "gmail_reply_sent");
        Ok(())
    }

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError> {
        let url = self.url("labels")?;
        let list: LabelList = self.execute(self.client.get(url)).await?.json().await?;

        Ok(list
            .labels
            .into_iter()
            .map(|l| Label {
                id: l.id,
                name: l.name,
            })
            .collect())
    }

    async fn create_label(&self, name: &str) -> Result<Label, ProviderError> {
        let url = self.url("labels")?;
        let request = self.client.post(url).json(&GmailLabel {
            id: String::new(),
            name: name.to_string(),
            label_list_visibility: Some("labelShow".to_string()),
            message_list_visibility: Some("show".to_string()),
        });

        let created: GmailLabel = match self.execute(request).await {
            Ok(response) => response.json().await?,
            Err(ProviderError::Status { status, .. })
                if status == StatusCode::CONFLICT.as_u16() =>
            {
                return Err(ProviderError::LabelExists(name.to_string()));
            }
            Err(e) => return Err(e),
        };

        Ok(Label {
            id: created.id,
            name: created.name,
        })
    }

    async fn modify(
        &self,
        message: &MessageRef,
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<(), ProviderError> {
        let url = self.url(&format!("messages/{message}/modify"))?;
        let request = self.client.post(url).json(&ModifyRequest {
            add_label_ids: add_labels,
            remove_label_ids: remove_labels,
        });

        self.execute(request).await?;

        debug!(
            message_id = %message,
            added = ?add_labels,
            removed = ?remove_labels,
            "gmail_message_modified"
        );
        Ok(())
    }
}
