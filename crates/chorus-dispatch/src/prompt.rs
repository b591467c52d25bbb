//! Prompt generation: one prompt per batch, drawn from a category catalog.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Mutex;

use chorus_types::{ChorusError, Prompt, PromptMetadata, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

const SENTIMENTS: [&str; 2] = ["positive", "negative"];
const CATEGORIES_PER_PROMPT: usize = 3;

/// Produces the prompt for a batch. Called once, before dispatch.
pub trait PromptSource: Send + Sync {
    fn generate(&self) -> Result<Prompt>;
}

/// A fixed prompt, reused for every batch.
impl PromptSource for Prompt {
    fn generate(&self) -> Result<Prompt> {
        Ok(self.clone())
    }
}

// ---------------------------------------------------------------------------
// CategoryCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub category: String,
    pub topics: Vec<String>,
}

/// `{"data": [{"category": "...", "topics": ["..."]}]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryCatalog {
    pub data: Vec<Category>,
}

impl CategoryCatalog {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&text)
    }

    /// Categories that have at least one topic to draw from.
    fn usable(&self) -> Vec<&Category> {
        self.data.iter().filter(|c| !c.topics.is_empty()).collect()
    }
}

// ---------------------------------------------------------------------------
// TopicPromptSource
// ---------------------------------------------------------------------------

/// Picks a sentiment and up to three categories (one topic each) and renders
/// the sentence-generation template.
pub struct TopicPromptSource {
    catalog: CategoryCatalog,
    rng: Mutex<StdRng>,
}

impl TopicPromptSource {
    pub fn new(catalog: CategoryCatalog) -> Self {
        Self {
            catalog,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic generation, for tests and reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn catalog(&self) -> &CategoryCatalog {
        &self.catalog
    }
}

impl PromptSource for TopicPromptSource {
    fn generate(&self) -> Result<Prompt> {
        let usable = self.catalog.usable();
        if usable.is_empty() {
            return Err(ChorusError::Config(
                "category catalog has no categories with topics".into(),
            ));
        }

        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ChorusError::Other("prompt rng lock poisoned".into()))?;

        let sentiment = SENTIMENTS
            .choose(&mut *rng)
            .copied()
            .unwrap_or(SENTIMENTS[0]);

        let mut metadata = PromptMetadata {
            sentiment: Some(sentiment.to_string()),
            ..Default::default()
        };
        let mut topics = String::new();
        for category in usable.choose_multiple(&mut *rng, CATEGORIES_PER_PROMPT) {
            let Some(topic) = category.topics.choose(&mut *rng) else {
                continue;
            };
            let _ = writeln!(topics, "- {}: {}", category.category, topic);
            metadata
                .categories
                .insert(category.category.clone(), topic.clone().into());
        }

        Ok(Prompt::with_metadata(render(sentiment, &topics), metadata))
    }
}

fn render(sentiment: &str, topics: &str) -> String {
    format!(
        "Human:\n\
         You are tasked with creating a single sentence that encapsulates a specific sentiment, given topics from specified categories. \n\
         The sentiment is {sentiment}, with the topics:\n\
         {topics}\
         The output should be concise and limited to this sentence alone, with no additional explanations, comments, or queries following it. \n\
         \n\
         Here's a sentence that fits the criteria you've described:\n\
         Assistant:\n"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> CategoryCatalog {
        CategoryCatalog::from_json(
            r#"{"data": [
                {"category": "Food", "topics": ["Pizza", "Ramen"]},
                {"category": "Weather", "topics": ["Rain"]},
                {"category": "Sport", "topics": ["Tennis", "Chess"]},
                {"category": "Travel", "topics": ["Trains"]},
                {"category": "Empty", "topics": []}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn generates_three_categories_and_matching_text() {
        let source = TopicPromptSource::new(catalog()).with_seed(7);
        let prompt = source.generate().unwrap();
        let meta = prompt.metadata();

        assert!(matches!(meta.sentiment.as_deref(), Some("positive" | "negative")));
        assert_eq!(meta.categories.len(), 3);
        assert!(!meta.categories.contains_key("Empty"));
        for (category, topic) in &meta.categories {
            let topic = topic.as_str().unwrap();
            assert!(prompt.text().contains(&format!("- {category}: {topic}\n")));
        }
        assert!(prompt.text().starts_with("Human:\n"));
        assert!(prompt.text().ends_with("Assistant:\n"));
        assert!(prompt
            .text()
            .contains(&format!("The sentiment is {},", meta.sentiment.as_deref().unwrap())));
    }

    #[test]
    fn categories_follow_the_order_of_the_prompt_lines() {
        for seed in 0..8 {
            let prompt = TopicPromptSource::new(catalog()).with_seed(seed).generate().unwrap();
            let listed: Vec<&str> = prompt
                .text()
                .lines()
                .filter_map(|line| line.strip_prefix("- "))
                .filter_map(|line| line.split_once(':').map(|(category, _)| category))
                .collect();
            let stored: Vec<&str> = prompt.metadata().categories.keys().map(String::as_str).collect();
            assert_eq!(listed, stored, "seed {seed}");
        }
    }

    #[test]
    fn same_seed_same_prompt() {
        let a = TopicPromptSource::new(catalog()).with_seed(42).generate().unwrap();
        let b = TopicPromptSource::new(catalog()).with_seed(42).generate().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn small_catalog_uses_what_it_has() {
        let catalog = CategoryCatalog::from_json(
            r#"{"data": [{"category": "Food", "topics": ["Pizza"]}]}"#,
        )
        .unwrap();
        let prompt = TopicPromptSource::new(catalog).generate().unwrap();
        assert_eq!(prompt.categories_json(), r#"{"Food":"Pizza"}"#);
    }

    #[test]
    fn empty_catalog_is_config_error() {
        let source = TopicPromptSource::new(CategoryCatalog::default());
        assert!(matches!(source.generate(), Err(ChorusError::Config(_))));
    }

    #[test]
    fn fixed_prompt_is_a_source() {
        let prompt = Prompt::new("hello");
        assert_eq!(prompt.generate().unwrap().text(), "hello");
    }

    #[tokio::test]
    async fn load_reads_catalog_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("categories.json");
        tokio::fs::write(&path, r#"{"data":[{"category":"A","topics":["x"]}]}"#)
            .await
            .unwrap();
        let catalog = CategoryCatalog::load(&path).await.unwrap();
        assert_eq!(catalog.data[0].topics, vec!["x".to_string()]);
    }
}
