//! Block scoring as a weighted sum over explicit numeric features.

use serde::{Deserialize, Serialize};

use crate::parser::blocks::{BlockKind, CandidateBlock, StructuralFeatures};

/// Tunable weights. Every term of the score is multiplied by exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub length: f64,
    pub tag: f64,
    pub position: f64,
    pub paragraphs: f64,
    pub link_density: f64,
    pub boilerplate: f64,
    pub article: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            length: 1.0,
            tag: 1.0,
            position: 0.5,
            paragraphs: 0.75,
            link_density: 4.0,
            boilerplate: 3.0,
            article: 1.5,
        }
    }
}

const KIND_WEIGHTS: &[(BlockKind, f64)] = &[
    (BlockKind::Paragraph, 0.5),
    (BlockKind::Quote, 0.2),
    (BlockKind::Preformatted, 0.0),
    (BlockKind::List, -0.5),
    (BlockKind::Heading, -1.0),
];

const DOMINANT_TAG_WEIGHTS: &[(&str, f64)] = &[
    ("p", 1.0),
    ("text", 0.6),
    ("blockquote", 0.5),
    ("div", 0.4),
    ("section", 0.4),
    ("pre", 0.3),
    ("td", 0.2),
    ("th", 0.0),
    ("figcaption", -0.2),
    ("dd", -0.3),
    ("dt", -0.3),
    ("li", -0.5),
    ("h1", -0.5),
    ("h2", -0.5),
    ("h3", -0.5),
    ("h4", -0.5),
    ("h5", -0.5),
    ("h6", -0.5),
];

/// Table lookup keyed by block kind and dominant tag; unknown tags weigh 0.
pub fn tag_weight(kind: BlockKind, dominant_tag: &str) -> f64 {
    let kind_weight = KIND_WEIGHTS
        .iter()
        .find(|(k, _)| *k == kind)
        .map_or(0.0, |(_, w)| *w);
    let tag = DOMINANT_TAG_WEIGHTS
        .iter()
        .find(|(t, _)| *t == dominant_tag)
        .map_or(0.0, |(_, w)| *w);
    kind_weight + tag
}

/// Score of one block at `index` among `total` blocks on its page.
pub fn score_block(features: &StructuralFeatures, index: usize, total: usize, weights: &ScoreWeights) -> f64 {
    let position = if total == 0 {
        0.0
    } else {
        1.0 - index as f64 / total as f64
    };
    weights.length * (1.0 + features.word_count as f64).ln()
        + weights.tag * tag_weight(features.kind, &features.dominant_tag)
        + weights.position * position
        + weights.paragraphs * (1.0 + features.paragraph_count as f64).ln()
        - weights.link_density * features.link_density
        - weights.boilerplate * flag(features.in_boilerplate)
        + weights.article * flag(features.in_article)
}

pub fn score_candidates(candidates: &[CandidateBlock], weights: &ScoreWeights) -> Vec<f64> {
    let total = candidates.len();
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| score_block(&c.features, i, total, weights))
        .collect()
}

/// Index of the highest score; the earliest block wins ties.
pub fn select_best(scores: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &score) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if score > top => best = Some((i, score)),
            None => best = Some((i, score)),
            _ => {}
        }
    }
    best.map(|(i, _)| i)
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(words: usize, kind: BlockKind, dominant: &str) -> StructuralFeatures {
        StructuralFeatures {
            tag_name: "div".into(),
            dominant_tag: dominant.into(),
            kind,
            depth: 4,
            sibling_count: 2,
            word_count: words,
            link_word_count: 0,
            link_density: 0.0,
            paragraph_count: if dominant == "p" { 3 } else { 0 },
            in_boilerplate: false,
            in_article: false,
        }
    }

    #[test]
    fn long_paragraphs_beat_link_lists() {
        let w = ScoreWeights::default();
        let mut nav = features(10, BlockKind::List, "li");
        nav.link_word_count = 10;
        nav.link_density = 1.0;
        nav.in_boilerplate = true;
        let body = features(400, BlockKind::Paragraph, "p");
        // nav comes first and still loses
        assert!(score_block(&body, 1, 2, &w) > score_block(&nav, 0, 2, &w));
    }

    #[test]
    fn each_weight_moves_the_score() {
        let f = features(50, BlockKind::Paragraph, "p");
        let base = score_block(&f, 0, 1, &ScoreWeights::default());

        let mut linked = f.clone();
        linked.link_density = 0.5;
        assert!(score_block(&linked, 0, 1, &ScoreWeights::default()) < base);

        let mut inside = f.clone();
        inside.in_article = true;
        assert!(score_block(&inside, 0, 1, &ScoreWeights::default()) > base);

        let zero = ScoreWeights {
            length: 0.0,
            tag: 0.0,
            position: 0.0,
            paragraphs: 0.0,
            link_density: 0.0,
            boilerplate: 0.0,
            article: 0.0,
        };
        assert_eq!(score_block(&f, 0, 1, &zero), 0.0);
    }

    #[test]
    fn earlier_position_scores_higher() {
        let w = ScoreWeights::default();
        let f = features(80, BlockKind::Paragraph, "p");
        assert!(score_block(&f, 0, 10, &w) > score_block(&f, 9, 10, &w));
    }

    #[test]
    fn tag_table() {
        assert!(tag_weight(BlockKind::Paragraph, "p") > tag_weight(BlockKind::List, "li"));
        assert!(tag_weight(BlockKind::Heading, "h2") < 0.0);
        assert_eq!(tag_weight(BlockKind::Preformatted, "marquee"), 0.0);
    }

    #[test]
    fn ties_go_to_earliest() {
        assert_eq!(select_best(&[1.0, 3.0, 3.0, 2.0]), Some(1));
        assert_eq!(select_best(&[]), None);
        assert_eq!(select_best(&[-2.0]), Some(0));
    }
}
