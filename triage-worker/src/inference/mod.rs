//! Classification and reply drafting.
//!
//! The inference capabilities ([`TextClassifier`], [`TextGenerator`]) are raw
//! model calls. [`Classifier`] and [`Responder`] wrap them with the fixed
//! category table and prompt templates, which are part of the pipeline's
//! observable behavior.

pub mod huggingface;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;

pub use huggingface::{HuggingFaceClassifier, HuggingFaceGenerator};

/// Raw output of a text classification model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Classification {
    pub label: String,
    #[serde(rename = "score")]
    pub confidence: f64,
}

/// Text classification capability.
#[async_trait]
pub trait TextClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ProviderError>;
}

/// Text generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Intent of an incoming email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Interested,
    NotInterested,
    MoreInformation,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::Interested,
        Category::NotInterested,
        Category::MoreInformation,
    ];

    /// Map a sentiment label to a category.
    ///
    /// Anything other than a positive or negative label, including neutral
    /// and unknown labels, means the sender wants more information.
    pub fn from_classifier_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Category::Interested,
            "NEGATIVE" => Category::NotInterested,
            _ => Category::MoreInformation,
        }
    }

    /// Category name, also used as the mailbox label name.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Interested => "Interested",
            Category::NotInterested => "NotInterested",
            Category::MoreInformation => "MoreInformation",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Category::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt template selected by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    Interested,
    NotInterested,
    MoreInformation,
    Generic,
}

impl PromptTemplate {
    pub fn for_category(category: Category) -> Self {
        match category {
            Category::Interested => PromptTemplate::Interested,
            Category::NotInterested => PromptTemplate::NotInterested,
            Category::MoreInformation => PromptTemplate::MoreInformation,
        }
    }

    /// Template for a category name; names outside the known set get the
    /// generic template.
    pub fn for_category_name(name: &str) -> Self {
        Category::from_name(name)
            .map(Self::for_category)
            .unwrap_or(PromptTemplate::Generic)
    }

    pub fn instruction(self) -> &'static str {
        match self {
            PromptTemplate::Interested => {
                "Generate a professional email response suggesting a demo call for the following email content:"
            }
            PromptTemplate::NotInterested => {
                "Generate a professional email response acknowledging the disinterest for the following email content:"
            }
            PromptTemplate::MoreInformation => {
                "Generate a professional email response providing more information for the following email content:"
            }
            PromptTemplate::Generic => {
                "Generate a professional email response for the following email content:"
            }
        }
    }

    pub fn render(self, content: &str) -> String {
        format!("{}\n\n{}", self.instruction(), content)
    }
}

/// Maps message text to a [`Category`].
#[derive(Clone)]
pub struct Classifier {
    model: Arc<dyn TextClassifier>,
}

impl Classifier {
    pub fn new(model: Arc<dyn TextClassifier>) -> Self {
        Self { model }
    }

    pub async fn categorize(&self, content: &str) -> Result<Category, ProviderError> {
        let result = self.model.classify(content).await?;
        let category = Category::from_classifier_label(&result.label);
        debug!(
            label = %result.label,
            confidence = result.confidence,
            category = %category,
            "classifier_label_mapped"
        );
        Ok(category)
    }
}

/// Drafts reply text for a categorized message.
#[derive(Clone)]
pub struct Responder {
    model: Arc<dyn TextGenerator>,
}

impl Responder {
    pub fn new(model: Arc<dyn TextGenerator>) -> Self {
        Self { model }
    }

    pub async fn draft(&self, content: &str, category: Category) -> Result<String, ProviderError> {
        self.draft_with(PromptTemplate::for_category(category), content)
            .await
    }

    pub async fn draft_with(
        &self,
        template: PromptTemplate,
        content: &str,
    ) -> Result<String, ProviderError> {
        let prompt = template.render(content);
        let reply = self.model.generate(&prompt).await?;
        Ok(reply.trim().to_string())
    }
}
