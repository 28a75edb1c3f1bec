//! Skill routing — selecting behavioral guidance for a user message.
//!
//! A skill is an opaque prompt fragment that shapes how the model tackles
//! a class of tasks. The router picks which skills apply to the incoming
//! message; the assembler places their text in the Skill zone under its
//! budget. Skill authoring and storage are out of scope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A routed skill, ready for context injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillPrompt {
    /// Skill name (for logs and zone reports)
    pub name: String,

    /// The guidance text injected into the Skill zone
    pub prompt_text: String,

    /// Tools this skill expects the model to lean on. Feeds the drift
    /// detector's expected-tool set.
    #[serde(default)]
    pub required_tools: Vec<String>,
}

/// Selects applicable skills for a user message, best match first.
#[async_trait]
pub trait SkillRouter: Send + Sync {
    async fn select(&self, user_message: &str) -> Vec<SkillPrompt>;
}

/// A keyword-overlap router: each registered skill carries trigger
/// patterns; the score is the fraction of patterns found in the message.
/// Results are filtered by a minimum score, ordered by score then
/// priority, and capped at `max_selected`.
pub struct KeywordSkillRouter {
    skills: Vec<RoutedSkill>,
    min_score: f32,
    max_selected: usize,
}

struct RoutedSkill {
    prompt: SkillPrompt,
    patterns: Vec<String>,
    priority: i32,
}

impl KeywordSkillRouter {
    pub fn new() -> Self {
        Self {
            skills: Vec::new(),
            min_score: 0.2,
            max_selected: 2,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_max_selected(mut self, max_selected: usize) -> Self {
        self.max_selected = max_selected;
        self
    }

    /// Register a skill with its trigger patterns. Lower `priority` wins
    /// ties.
    pub fn register(
        &mut self,
        prompt: SkillPrompt,
        patterns: Vec<String>,
        priority: i32,
    ) {
        self.skills.push(RoutedSkill {
            prompt,
            patterns,
            priority,
        });
    }

    fn score(patterns: &[String], message: &str) -> f32 {
        if patterns.is_empty() {
            return 0.0;
        }
        let hits = patterns
            .iter()
            .filter(|p| message.contains(p.to_lowercase().as_str()))
            .count();
        hits as f32 / patterns.len() as f32
    }
}

impl Default for KeywordSkillRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SkillRouter for KeywordSkillRouter {
    async fn select(&self, user_message: &str) -> Vec<SkillPrompt> {
        let message = user_message.to_lowercase();
        let mut scored: Vec<(f32, i32, &SkillPrompt)> = self
            .skills
            .iter()
            .filter_map(|s| {
                let score = Self::score(&s.patterns, &message);
                (score >= self.min_score).then_some((score, s.priority, &s.prompt))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored
            .into_iter()
            .take(self.max_selected)
            .map(|(_, _, p)| p.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(name: &str) -> SkillPrompt {
        SkillPrompt {
            name: name.into(),
            prompt_text: format!("guidance for {name}"),
            required_tools: vec![],
        }
    }

    fn router() -> KeywordSkillRouter {
        let mut r = KeywordSkillRouter::new();
        r.register(
            skill("code-review"),
            vec!["review".into(), "diff".into(), "pull request".into()],
            1,
        );
        r.register(
            skill("research"),
            vec!["research".into(), "find".into(), "search".into()],
            2,
        );
        r.register(skill("writing"), vec!["write".into(), "draft".into()], 3);
        r
    }

    #[tokio::test]
    async fn selects_best_match_first() {
        let r = router();
        let picks = r.select("please review this diff and the pull request").await;
        assert_eq!(picks[0].name, "code-review");
    }

    #[tokio::test]
    async fn filters_below_min_score() {
        let r = router();
        let picks = r.select("completely unrelated message").await;
        assert!(picks.is_empty());
    }

    #[tokio::test]
    async fn caps_at_max_selected() {
        let r = router();
        let picks = r
            .select("review the diff, research and find sources, write a draft")
            .await;
        assert!(picks.len() <= 2);
    }
}
