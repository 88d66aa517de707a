//! Utility-aware reranking with runtime learning.
//!
//! Phase A of retrieval (vector + lexical + graph, RRF-fused) optimises
//! semantic recall; this module is phase B, value selection. Each chunk
//! carries a per-category utility score in [0,1] that rises when the chunk
//! is cited in confident answers and falls when it is retrieved but unused.
//! Scores move only through an exponential moving average and are the sole
//! ranking state mutated at serving time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio_postgres::Client;
use tracing::{debug, warn};

use crate::error::{RagError, RagResult};
use crate::records::{Candidate, Confidence};

/// EMA learning rate.
const LEARNING_RATE: f64 = 0.1;

/// Utility of a chunk never observed in any request.
const DEFAULT_UTILITY: f64 = 0.5;

/// Fixed query-category set keyed into the utility table.
pub const CATEGORIES: &[&str] = &[
    "fire_safety",
    "lifesaving",
    "pollution",
    "stability",
    "structure",
    "machinery",
    "navigation",
    "survey",
    "general",
];

const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "fire_safety",
        &["消防", "防火", "灭火", "探火", "惰气", "fire", "extinguish", "smoke", "sprinkler", "inert gas"],
    ),
    (
        "lifesaving",
        &["救生", "救助艇", "登乘", "liferaft", "lifeboat", "lifebuoy", "lifejacket", "davit", "launching", "rescue boat", "survival craft"],
    ),
    (
        "pollution",
        &["排油", "污染", "压载水", "垃圾", "污水", "油水分离", "marpol", "oil discharge", "odme", "ballast", "garbage", "sewage"],
    ),
    (
        "stability",
        &["稳性", "分舱", "stability", "subdivision", "damage stability"],
    ),
    (
        "structure",
        &["舱壁", "开口", "双壳", "干舷", "载重线", "水密", "透气管", "bulkhead", "freeboard", "load line", "hatch", "opening", "watertight", "air pipe", "double hull"],
    ),
    (
        "machinery",
        &["主机", "舵机", "锅炉", "机舱", "engine", "machinery", "boiler", "steering gear"],
    ),
    (
        "navigation",
        &["导航", "雷达", "无线电", "号灯", "罗经", "navigation", "radar", "radio", "colreg", "gmdss", "compass"],
    ),
    (
        "survey",
        &["检验", "审核", "证书", "survey", "audit", "certificate", "inspection", "port state"],
    ),
];

/// Routes a query onto its utility category. First keyword hit wins;
/// anything unmatched is `general`.
pub fn categorize(query: &str) -> &'static str {
    let query_lower = query.to_lowercase();
    for (category, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|kw| query_lower.contains(kw)) {
            return category;
        }
    }
    "general"
}

/// One EMA step, clamped into [0,1].
pub fn ema(old: f64, reward: f64) -> f64 {
    ((1.0 - LEARNING_RATE) * old + LEARNING_RATE * reward).clamp(0.0, 1.0)
}

/// Combined score: `(1 − α)·normalised_fusion + α·utility`, where the raw
/// fused score is normalised by clipping at `norm_ceiling`.
pub fn blend_scores(alpha: f64, norm_ceiling: f64, fused_score: f64, utility: f64) -> f64 {
    let norm = (fused_score / norm_ceiling).clamp(0.0, 1.0);
    (1.0 - alpha) * norm + alpha * utility
}

/// Reward drawn from the `(was_cited, confidence)` table. A low-confidence
/// refusal penalises every retrieved chunk.
pub fn reward(was_cited: bool, confidence: Confidence, is_refusal: bool) -> f64 {
    if is_refusal && confidence == Confidence::Low {
        return -0.5;
    }
    match (was_cited, confidence) {
        (true, Confidence::High) => 1.0,
        (true, Confidence::Medium) => 0.5,
        (true, Confidence::Low) => 0.0,
        (false, Confidence::High) => -0.1,
        (false, Confidence::Medium) => 0.0,
        (false, Confidence::Low) => -0.3,
    }
}

/// Per-category aggregate for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryStats {
    /// Category name.
    pub category: String,
    /// Distinct chunks observed.
    pub total_chunks: i64,
    /// Mean utility.
    pub avg_utility: f64,
    /// Mean use count.
    pub avg_uses: f64,
    /// Chunks above 0.7.
    pub high_utility: i64,
    /// Chunks below 0.3.
    pub low_utility: i64,
}

/// Store and reranker over the `chunk_utilities` table.
#[derive(Clone)]
pub struct UtilityStore {
    db: Arc<Client>,
    alpha: f64,
    norm_ceiling: f64,
}

const FETCH_SQL: &str = "SELECT chunk_id, utility_score \
    FROM chunk_utilities \
    WHERE chunk_id = ANY($1) AND query_category = $2";

const UPSERT_SQL: &str = "INSERT INTO chunk_utilities \
        (chunk_id, query_category, utility_score, use_count, success_count, last_used) \
    VALUES ($1, $2, $3, 1, $4, NOW()) \
    ON CONFLICT (chunk_id, query_category) DO UPDATE SET \
        utility_score = GREATEST(0.0, LEAST(1.0, \
            0.9 * chunk_utilities.utility_score + 0.1 * $5)), \
        use_count = chunk_utilities.use_count + 1, \
        success_count = chunk_utilities.success_count + $4, \
        last_used = NOW()";

const STATS_SQL: &str = "SELECT query_category, \
        COUNT(*) AS total_chunks, \
        AVG(utility_score) AS avg_utility, \
        AVG(use_count::float8) AS avg_uses, \
        COUNT(*) FILTER (WHERE utility_score > 0.7) AS high_utility, \
        COUNT(*) FILTER (WHERE utility_score < 0.3) AS low_utility \
    FROM chunk_utilities \
    GROUP BY query_category \
    ORDER BY total_chunks DESC";

impl UtilityStore {
    /// Builds a new store. `alpha` is the utility blend weight in [0, 0.5];
    /// `norm_ceiling` maps raw fused scores onto [0,1] by clipping.
    pub fn new(db: Arc<Client>, alpha: f64, norm_ceiling: f64) -> Self {
        Self {
            db,
            alpha: alpha.clamp(0.0, 0.5),
            norm_ceiling: norm_ceiling.max(f64::EPSILON),
        }
    }

    /// Reorders fused candidates by the combined score
    /// `(1 − α)·normalised_fusion + α·utility`, ties broken by the original
    /// fusion rank. A store failure leaves the fusion order untouched.
    pub async fn rerank(&self, candidates: Vec<Candidate>, category: &str) -> Vec<Candidate> {
        if candidates.is_empty() {
            return candidates;
        }
        let chunk_ids: Vec<String> = candidates.iter().map(|c| c.chunk_id.clone()).collect();
        let utilities = match self.fetch(&chunk_ids, category).await {
            Ok(map) => map,
            Err(err) => {
                // Store outage degrades to the neutral default for every
                // chunk; fusion order is preserved through the tiebreak.
                warn!(%err, "utility fetch failed, blending with defaults");
                HashMap::new()
            }
        };

        let mut scored: Vec<(usize, Candidate)> = candidates
            .into_iter()
            .enumerate()
            .map(|(fusion_rank, mut candidate)| {
                let utility = utilities
                    .get(&candidate.chunk_id)
                    .copied()
                    .unwrap_or(DEFAULT_UTILITY);
                candidate.utility_score = utility;
                candidate.final_score = self.blend(candidate.fused_score, utility);
                (fusion_rank, candidate)
            })
            .collect();
        scored.sort_by(|(rank_a, a), (rank_b, b)| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| rank_a.cmp(rank_b))
        });
        debug!(category, candidates = scored.len(), "utility rerank complete");
        scored.into_iter().map(|(_, candidate)| candidate).collect()
    }

    /// Combined score for a fused score and a utility.
    pub fn blend(&self, fused_score: f64, utility: f64) -> f64 {
        blend_scores(self.alpha, self.norm_ceiling, fused_score, utility)
    }

    /// Applies the post-answer reward to every retrieved chunk, at most once
    /// per chunk per turn.
    pub async fn update(
        &self,
        retrieved_chunk_ids: &[String],
        cited_chunk_ids: &HashSet<String>,
        confidence: Confidence,
        is_refusal: bool,
        category: &str,
    ) -> RagResult<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for chunk_id in retrieved_chunk_ids {
            if chunk_id.is_empty() || !seen.insert(chunk_id.as_str()) {
                continue;
            }
            let was_cited = cited_chunk_ids.contains(chunk_id);
            let reward_value = reward(was_cited, confidence, is_refusal);
            let fresh_utility = ema(DEFAULT_UTILITY, reward_value);
            let success: i64 = i64::from(reward_value > 0.0);
            self.db
                .execute(
                    UPSERT_SQL,
                    &[chunk_id, &category, &fresh_utility, &success, &reward_value],
                )
                .await
                .map_err(|err| RagError::UtilityStoreUnavailable(err.to_string()))?;
        }
        Ok(())
    }

    /// Fetches utilities for the given chunks; absent rows are simply missing
    /// from the map (callers treat them as 0.5).
    pub async fn fetch(
        &self,
        chunk_ids: &[String],
        category: &str,
    ) -> RagResult<HashMap<String, f64>> {
        if chunk_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .db
            .query(FETCH_SQL, &[&chunk_ids, &category])
            .await
            .map_err(|err| RagError::UtilityStoreUnavailable(err.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<_, String>("chunk_id"), row.get::<_, f64>("utility_score")))
            .collect())
    }

    /// Learning statistics grouped by category.
    pub async fn stats(&self) -> RagResult<Vec<CategoryStats>> {
        let rows = self
            .db
            .query(STATS_SQL, &[])
            .await
            .map_err(|err| RagError::UtilityStoreUnavailable(err.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| CategoryStats {
                category: row.get("query_category"),
                total_chunks: row.get("total_chunks"),
                avg_utility: row.get::<_, Option<f64>>("avg_utility").unwrap_or(0.0),
                avg_uses: row.get::<_, Option<f64>>("avg_uses").unwrap_or(0.0),
                high_utility: row.get("high_utility"),
                low_utility: row.get("low_utility"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_table_matches_the_contract() {
        assert_eq!(reward(true, Confidence::High, false), 1.0);
        assert_eq!(reward(true, Confidence::Medium, false), 0.5);
        assert_eq!(reward(true, Confidence::Low, false), 0.0);
        assert_eq!(reward(false, Confidence::High, false), -0.1);
        assert_eq!(reward(false, Confidence::Medium, false), 0.0);
        assert_eq!(reward(false, Confidence::Low, false), -0.3);
        // A refused answer penalises cited and uncited chunks alike.
        assert_eq!(reward(true, Confidence::Low, true), -0.5);
        assert_eq!(reward(false, Confidence::Low, true), -0.5);
    }

    #[test]
    fn ema_stays_in_unit_interval() {
        let mut utility = DEFAULT_UTILITY;
        for _ in 0..200 {
            utility = ema(utility, 1.0);
            assert!((0.0..=1.0).contains(&utility));
        }
        assert!(utility > 0.95);
        for _ in 0..200 {
            utility = ema(utility, -0.5);
            assert!((0.0..=1.0).contains(&utility));
        }
        assert!(utility < 0.05);
    }

    #[test]
    fn fresh_row_moves_from_the_default() {
        assert!((ema(DEFAULT_UTILITY, 1.0) - 0.55).abs() < 1e-9);
        assert!((ema(DEFAULT_UTILITY, -0.5) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn blend_clips_fusion_at_the_ceiling() {
        // Raw RRF scores above the ceiling all normalise to 1.0.
        assert_eq!(blend_scores(0.3, 0.1, 0.5, 0.5), 0.7 + 0.3 * 0.5);
        // At α = 0 the combined score is pure normalised fusion.
        assert_eq!(blend_scores(0.0, 0.1, 0.05, 0.9), 0.5);
        // An unseen chunk blends with the 0.5 default.
        let combined = blend_scores(0.3, 0.1, 0.02, 0.5);
        assert!((combined - (0.7 * 0.2 + 0.15)).abs() < 1e-9);
    }

    #[test]
    fn categorizer_routes_bilingual_queries() {
        assert_eq!(categorize("走廊和控制站之间的舱壁防火等级"), "fire_safety");
        assert_eq!(categorize("100米货船救生筏配置"), "lifesaving");
        assert_eq!(categorize("oil discharge limits for tankers"), "pollution");
        assert_eq!(categorize("damage stability criteria"), "stability");
        assert_eq!(categorize("透气管高度要求"), "structure");
        assert_eq!(categorize("steering gear tests"), "machinery");
        assert_eq!(categorize("radar installation"), "navigation");
        assert_eq!(categorize("annual survey scope"), "survey");
        assert_eq!(categorize("general question"), "general");
    }

    #[test]
    fn categorizer_output_is_a_known_category() {
        for query in ["消防泵", "liferaft", "anything else"] {
            assert!(CATEGORIES.contains(&categorize(query)));
        }
    }
}
