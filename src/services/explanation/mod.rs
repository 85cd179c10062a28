//! Explanation generator: turns fusion provenance into a short
//! human-readable justification per selected item.
//!
//! The dominant contributing strategy decides the template; taxonomy tags
//! shared with the user's recent history make the wording concrete where
//! they exist.

use crate::graph::InteractionGraph;
use crate::services::trust::TrustedCandidate;
use crate::models::StrategyKind;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub struct ExplanationGenerator {
    graph: Arc<InteractionGraph>,
}

impl ExplanationGenerator {
    pub fn new(graph: Arc<InteractionGraph>) -> Self {
        Self { graph }
    }

    /// Dominant-strategy justification for one selected candidate.
    pub fn explain(&self, user_id: Uuid, selected: &TrustedCandidate) -> String {
        let dominant = selected
            .candidate
            .contributions
            .iter()
            .max_by(|a, b| {
                a.1.partial_cmp(b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.as_str().cmp(b.0.as_str()))
            })
            .map(|(kind, _)| *kind)
            .unwrap_or(selected.candidate.best_rank_source);

        let base = match dominant {
            StrategyKind::Collaborative => {
                "Users with listening habits like yours rated this highly".to_string()
            }
            StrategyKind::ContentBased => match self.shared_tags(user_id, selected.candidate.item_id)
            {
                Some(tags) => format!("Similar to your recent {} picks", tags),
                None => "Closely matches the content you have been enjoying".to_string(),
            },
            StrategyKind::GraphNeural => {
                "Frequently enjoyed alongside items in your recent history".to_string()
            }
        };

        if selected.low_confidence {
            format!("{} (limited trust data; shown as best available match)", base)
        } else {
            base
        }
    }

    /// Tags the item shares with the user's recent window, joined for
    /// display, or `None` when there is no overlap.
    fn shared_tags(&self, user_id: Uuid, item_id: Uuid) -> Option<String> {
        let user_idx = self.graph.user_idx(user_id)?;
        let item_idx = self.graph.item_idx(item_id)?;
        let item_tags: HashSet<&str> = self
            .graph
            .item(item_idx)
            .tags
            .iter()
            .map(|t| t.as_str())
            .collect();
        if item_tags.is_empty() {
            return None;
        }

        let mut shared: Vec<&str> = Vec::new();
        for entry in &self.graph.user(user_idx).window {
            for tag in &self.graph.item(entry.item).tags {
                if item_tags.contains(tag.as_str()) && !shared.contains(&tag.as_str()) {
                    shared.push(tag.as_str());
                }
            }
        }
        if shared.is_empty() {
            return None;
        }
        shared.sort_unstable();
        shared.truncate(3);
        Some(shared.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrustComponents;
    use crate::services::fusion::FusedCandidate;
    use chrono::Utc;
    use std::collections::HashMap;

    fn trust() -> TrustComponents {
        TrustComponents {
            source_reliability: 0.9,
            metadata_accuracy: 0.9,
            availability_confidence: 0.9,
            feedback_quality: 0.9,
            preference_confidence: 0.9,
            last_verified: Utc::now(),
        }
    }

    fn selected(item_id: Uuid, dominant: StrategyKind, low_confidence: bool) -> TrustedCandidate {
        let mut contributions = HashMap::new();
        contributions.insert(dominant, 0.02);
        TrustedCandidate {
            candidate: FusedCandidate {
                item_id,
                fused_score: 0.02,
                contributions,
                best_rank: 1,
                best_rank_source: dominant,
            },
            trust_score: 0.8,
            low_confidence,
        }
    }

    #[test]
    fn content_explanation_names_shared_tags() {
        let mut graph = InteractionGraph::new();
        let listened = Uuid::new_v4();
        let recommended = Uuid::new_v4();
        graph.upsert_item(listened, vec!["jazz".to_string()], trust(), 0.5);
        graph.upsert_item(recommended, vec!["jazz".to_string()], trust(), 0.5);
        let user = Uuid::new_v4();
        graph.record_interaction(user, listened, 5.0, Utc::now());

        let generator = ExplanationGenerator::new(Arc::new(graph));
        let text = generator.explain(user, &selected(recommended, StrategyKind::ContentBased, false));
        assert!(text.contains("jazz"), "got: {text}");
    }

    #[test]
    fn low_confidence_is_called_out() {
        let generator = ExplanationGenerator::new(Arc::new(InteractionGraph::new()));
        let text = generator.explain(
            Uuid::new_v4(),
            &selected(Uuid::new_v4(), StrategyKind::Collaborative, true),
        );
        assert!(text.contains("limited trust data"));
    }

    #[test]
    fn dominant_strategy_drives_template() {
        let generator = ExplanationGenerator::new(Arc::new(InteractionGraph::new()));
        let graph_text = generator.explain(
            Uuid::new_v4(),
            &selected(Uuid::new_v4(), StrategyKind::GraphNeural, false),
        );
        let collab_text = generator.explain(
            Uuid::new_v4(),
            &selected(Uuid::new_v4(), StrategyKind::Collaborative, false),
        );
        assert_ne!(graph_text, collab_text);
    }
}
