//! Recording fakes for the pipeline's capabilities.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use triage::inference::{Classification, TextClassifier, TextGenerator};
use triage::mailbox::{Label, MailMessage, MessageRef, UNREAD_LABEL};
use triage::queue::{RedeliveryPolicy, Subscription};
use triage::{
    Classifier, EmailProcessor, JobEvent, MailboxGateway, MemoryQueue, ProviderError, Responder,
};

pub const SUBJECT: &str = "Thank you for connecting with us";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub message: String,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

#[derive(Default)]
pub struct MailboxState {
    pub messages: HashMap<String, MailMessage>,
    pub unread: Vec<String>,
    pub labels: Vec<Label>,
    pub sent: Vec<SentMail>,
    pub modified: Vec<Modification>,
    pub send_attempts: usize,
    pub list_labels_calls: usize,
    pub create_label_calls: usize,
    /// Number of upcoming sends that fail
    pub failing_sends: usize,
    pub failing_gets: HashSet<String>,
    /// Simulate another process creating the label first
    pub create_conflicts: bool,
    pub create_delay: Option<Duration>,
    /// Number of upcoming modifications that fail
    pub failing_modifies: usize,
    /// Reject modifications naming a label id that does not exist
    pub reject_unknown_labels: bool,
}

/// In-memory mail provider that records every call.
#[derive(Default)]
pub struct FakeMailbox {
    pub state: Mutex<MailboxState>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unread(self, id: &str, content: &str, sender: &str) -> Self {
        self.add_unread(id, content, sender);
        self
    }

    pub fn add_unread(&self, id: &str, content: &str, sender: &str) {
        let mut state = self.state.lock().unwrap();
        state.messages.insert(
            id.to_string(),
            MailMessage {
                content: content.to_string(),
                sender: sender.to_string(),
            },
        );
        state.unread.push(id.to_string());
    }

    /// Calls belonging to the labeling step.
    pub fn label_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.list_labels_calls + state.create_label_calls + state.modified.len()
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn modified(&self) -> Vec<Modification> {
        self.state.lock().unwrap().modified.clone()
    }

    pub fn unread(&self) -> Vec<String> {
        self.state.lock().unwrap().unread.clone()
    }

    /// Delete every label, as a user would in the mail client.
    pub fn clear_labels(&self) {
        self.state.lock().unwrap().labels.clear();
    }

    pub fn label_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.labels.iter().map(|l| l.name.clone()).collect()
    }
}

fn provider_failure(body: &str) -> ProviderError {
    ProviderError::Status {
        status: 500,
        body: body.to_string(),
    }
}

#[async_trait]
impl MailboxGateway for FakeMailbox {
    async fn list_unread(&self) -> Result<Vec<MessageRef>, ProviderError> {
        Ok(self.state.lock().unwrap().unread.clone())
    }

    async fn get(&self, message: &MessageRef) -> Result<MailMessage, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.failing_gets.contains(message) {
            return Err(provider_failure("get failed"));
        }
        state
            .messages
            .get(message)
            .cloned()
            .ok_or_else(|| ProviderError::Decode(format!("no message {message}")))
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.send_attempts += 1;
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(provider_failure("send failed"));
        }
        state.sent.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.list_labels_calls += 1;
        Ok(state.labels.clone())
    }

    async fn create_label(&self, name: &str) -> Result<Label, ProviderError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.create_label_calls += 1;
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let label = Label {
            id: format!("Label_{}", state.create_label_calls),
            name: name.to_string(),
        };
        state.labels.push(label.clone());

        if state.create_conflicts {
            return Err(ProviderError::LabelExists(name.to_string()));
        }
        Ok(label)
    }

    async fn modify(
        &self,
        message: &MessageRef,
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_modifies > 0 {
            state.failing_modifies -= 1;
            return Err(provider_failure("modify failed"));
        }
        if state.reject_unknown_labels
            && add_labels
                .iter()
                .any(|id| !state.labels.iter().any(|label| &label.id == id))
        {
            return Err(ProviderError::Status {
                status: 400,
                body: "Invalid label".to_string(),
            });
        }
        if remove_labels.iter().any(|l| l == UNREAD_LABEL) {
            state.unread.retain(|id| id != message);
        }
        state.modified.push(Modification {
            message: message.clone(),
            add: add_labels.to_vec(),
            remove: remove_labels.to_vec(),
        });
        Ok(())
    }
}

/// Classifier returning a fixed label, or failing.
pub struct FakeClassifier {
    label: Option<String>,
    pub calls: AtomicUsize,
}

impl FakeClassifier {
    pub fn labeled(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            label: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TextClassifier for FakeClassifier {
    async fn classify(&self, _text: &str) -> Result<Classification, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.label {
            Some(label) => Ok(Classification {
                label: label.clone(),
                confidence: 0.97,
            }),
            None => Err(provider_failure("model unavailable")),
        }
    }
}

/// Generator that records prompts and echoes a fixed reply, or fails.
#[derive(Default)]
pub struct FakeGenerator {
    pub prompts: Mutex<Vec<String>>,
    failing: bool,
}

impl FakeGenerator {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.failing {
            return Err(provider_failure("generation timed out"));
        }
        Ok("Thanks for your note!\n".to_string())
    }
}

pub fn memory_queue(max_attempts: u32) -> MemoryQueue {
    MemoryQueue::new(RedeliveryPolicy {
        max_attempts,
        backoff: Duration::ZERO,
    })
}

pub fn processor(
    mailbox: &Arc<FakeMailbox>,
    classifier: &Arc<FakeClassifier>,
    generator: &Arc<FakeGenerator>,
) -> Arc<EmailProcessor> {
    Arc::new(EmailProcessor::new(
        Classifier::new(classifier.clone()),
        Responder::new(generator.clone()),
        mailbox.clone(),
        SUBJECT.to_string(),
    ))
}

pub async fn next_event(subscription: &mut Subscription) -> JobEvent {
    timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("timed out waiting for job event")
        .expect("event stream ended")
}
