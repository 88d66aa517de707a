//! Practical-knowledge index: surveyor-curated commentary keyed to
//! regulations, loaded once at boot from YAML files.
//!
//! Entries are authoritative narrative, not a regulatory source; they are
//! injected into the LLM context next to retrieved regulation chunks.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Entries below this relevance are never injected; a ship-type match alone
/// does not qualify.
const MIN_SCORE: i32 = 2;

/// Maximum entries injected per query.
const MAX_ENTRIES: usize = 3;

/// One surveyor-curated knowledge entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PracticalEntry {
    /// Stable identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Bilingual trigger keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// English regulatory terms the enhancer may have injected.
    #[serde(default)]
    pub terms: Vec<String>,
    /// Regulation identifiers this entry speaks to.
    #[serde(default)]
    pub regulations: Vec<String>,
    /// Ship types the entry applies to.
    #[serde(default)]
    pub ship_types: Vec<String>,
    /// The misreading surveyors commonly make.
    #[serde(default)]
    pub common_mistake: Option<String>,
    /// The correct reading.
    #[serde(default)]
    pub correct_interpretation: Option<String>,
    /// Configurations seen in practice.
    #[serde(default)]
    pub typical_configurations: Vec<String>,
    /// If/then decision steps.
    #[serde(default)]
    pub decision_tree: Vec<String>,
}

/// In-memory index over all loaded entries. Read-only at request time.
#[derive(Debug, Default)]
pub struct KnowledgeBase {
    by_id: HashMap<String, PracticalEntry>,
    keyword_index: HashMap<String, Vec<String>>,
    reg_index: HashMap<String, Vec<String>>,
    ordered_ids: Vec<String>,
}

impl KnowledgeBase {
    /// Loads every `*.yaml` file under `dir`. A missing directory yields an
    /// empty base; a malformed file is skipped with a warning.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        if !dir.exists() {
            warn!(dir = %dir.display(), "practical-knowledge directory not found");
            return Ok(Self::from_entries(entries));
        }
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
            .collect();
        paths.sort();
        for path in paths {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to read knowledge file");
                    continue;
                }
            };
            match serde_yaml::from_str::<Vec<PracticalEntry>>(&raw) {
                Ok(parsed) => entries.extend(parsed),
                Err(err) => warn!(path = %path.display(), %err, "failed to parse knowledge file"),
            }
        }
        let base = Self::from_entries(entries);
        info!(entries = base.by_id.len(), "practical knowledge loaded");
        Ok(base)
    }

    /// Builds the index from already-parsed entries.
    pub fn from_entries(entries: Vec<PracticalEntry>) -> Self {
        let mut base = Self::default();
        for entry in entries {
            for keyword in &entry.keywords {
                base.keyword_index
                    .entry(keyword.to_lowercase())
                    .or_default()
                    .push(entry.id.clone());
            }
            for regulation in &entry.regulations {
                base.reg_index
                    .entry(regulation.to_lowercase())
                    .or_default()
                    .push(entry.id.clone());
            }
            base.ordered_ids.push(entry.id.clone());
            base.by_id.insert(entry.id.clone(), entry);
        }
        base
    }

    /// Number of loaded entries.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True when no entries are loaded.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Returns up to three entries ranked by additive relevance score.
    ///
    /// Scoring: keyword in query +2; enhancer hint matching an entry
    /// regulation +3; regulation named in the query +2; enhancer term in the
    /// entry's term set +1; ship type in query +2.
    pub fn query(
        &self,
        user_query: &str,
        matched_terms: &[String],
        regulation_hints: &[String],
    ) -> Vec<&PracticalEntry> {
        let query_lower = user_query.to_lowercase();
        let mut scores: HashMap<&str, i32> = HashMap::new();

        for (keyword, ids) in &self.keyword_index {
            if query_lower.contains(keyword) {
                for id in ids {
                    *scores.entry(id).or_default() += 2;
                }
            }
        }

        for hint in regulation_hints {
            if let Some(ids) = self.reg_index.get(&hint.to_lowercase()) {
                for id in ids {
                    *scores.entry(id).or_default() += 3;
                }
            }
        }
        for (regulation, ids) in &self.reg_index {
            if query_lower.contains(regulation) {
                for id in ids {
                    *scores.entry(id).or_default() += 2;
                }
            }
        }

        if !matched_terms.is_empty() {
            for (id, entry) in &self.by_id {
                let hit = entry.terms.iter().any(|term| {
                    matched_terms
                        .iter()
                        .any(|m| m.eq_ignore_ascii_case(term))
                });
                if hit {
                    *scores.entry(id).or_default() += 1;
                }
            }
        }

        for (id, entry) in &self.by_id {
            if entry
                .ship_types
                .iter()
                .any(|st| query_lower.contains(&st.to_lowercase()))
            {
                *scores.entry(id).or_default() += 2;
            }
        }

        let mut ranked: Vec<(&str, i32)> = scores
            .into_iter()
            .filter(|(_, score)| *score >= MIN_SCORE)
            .collect();
        // Deterministic order: score, then load order.
        ranked.sort_by(|(id_a, score_a), (id_b, score_b)| {
            score_b.cmp(score_a).then_with(|| {
                let pos = |id: &str| self.ordered_ids.iter().position(|x| x == id);
                pos(id_a).cmp(&pos(id_b))
            })
        });
        ranked
            .into_iter()
            .take(MAX_ENTRIES)
            .filter_map(|(id, _)| self.by_id.get(id))
            .collect()
    }

    /// Renders matched entries as the markdown block injected into the LLM
    /// context. Empty input renders to an empty string.
    pub fn render_markdown(entries: &[&PracticalEntry]) -> String {
        if entries.is_empty() {
            return String::new();
        }
        let mut parts = vec!["## 验船实务参考（来自资深验船师经验）\n".to_string()];
        for entry in entries {
            parts.push(format!("### {}", entry.title));
            parts.push(format!("**适用法规**: {}", entry.regulations.join(", ")));
            if let Some(correct) = &entry.correct_interpretation {
                parts.push(format!("**正确理解**: {correct}"));
            }
            if let Some(mistake) = &entry.common_mistake {
                parts.push(format!("**常见误解**: {mistake}"));
            }
            if !entry.typical_configurations.is_empty() {
                parts.push("**典型配置**:".to_string());
                for config in &entry.typical_configurations {
                    parts.push(format!("- {config}"));
                }
            }
            if !entry.decision_tree.is_empty() {
                parts.push("**判断逻辑**:".to_string());
                for step in &entry.decision_tree {
                    parts.push(format!("- {step}"));
                }
            }
            parts.push(String::new());
        }
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn liferaft_entry() -> PracticalEntry {
        serde_yaml::from_str(
            r#"
            id: davit_liferaft_85m
            title: 85m以上货船救生筏降落设备
            keywords: ["救生筏", "davit", "起降落"]
            terms: ["davit-launched liferaft", "free-fall lifeboat"]
            regulations: ["SOLAS III/31.1.4", "SOLAS III/31"]
            ship_types: ["货船", "cargo ship"]
            common_mistake: 认为配了free-fall lifeboat就两舷都不需要davit
            correct_interpretation: 至少一舷的救生筏须由降落设备服务，另一舷可为抛投式
            typical_configurations:
              - 尾部free-fall lifeboat + 一舷davit-launched液筏 + 另一舷throw-overboard液筏
            decision_tree:
              - 如果船长 >= 85m 且为货船，则至少一舷须配davit-launched救生筏
            "#,
        )
        .unwrap()
    }

    fn fire_entry() -> PracticalEntry {
        serde_yaml::from_str(
            r#"
            id: fire_table_routing
            title: 防火分隔查表纪律
            keywords: ["防火等级", "防火分隔", "fire integrity"]
            terms: ["fire division"]
            regulations: ["SOLAS II-2/9"]
            ship_types: ["油轮", "货船"]
            common_mistake: 控制站对走廊误判为A-60
            correct_interpretation: 先定船型分支再查表；货船用Table 9.5，油轮用Table 9.7
            "#,
        )
        .unwrap()
    }

    #[test]
    fn keyword_and_regulation_hits_rank_the_right_entry_first() {
        let base = KnowledgeBase::from_entries(vec![fire_entry(), liferaft_entry()]);
        let hints = vec!["SOLAS III/31.1.4".to_string()];
        let terms = vec!["davit-launched liferaft".to_string()];
        let results = base.query("100 米货船两边救生筏都需要起降落设备吗", &terms, &hints);
        assert!(!results.is_empty());
        assert_eq!(results[0].id, "davit_liferaft_85m");
    }

    #[test]
    fn ship_type_alone_does_not_qualify() {
        let base = KnowledgeBase::from_entries(vec![liferaft_entry()]);
        // "货船" matches the ship type (+2) but nothing else; the minimum
        // score keeps broad matches out only when below it.
        let results = base.query("货船的通风要求", &[], &[]);
        assert_eq!(results.len(), 1);
        // A query with no overlap at all returns nothing.
        let none = base.query("压载水处理", &[], &[]);
        assert!(none.is_empty());
    }

    #[test]
    fn at_most_three_entries_are_returned() {
        let mut entries = Vec::new();
        for i in 0..5 {
            let mut entry = fire_entry();
            entry.id = format!("entry_{i}");
            entries.push(entry);
        }
        let base = KnowledgeBase::from_entries(entries);
        let results = base.query("防火等级查询", &[], &[]);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn markdown_rendering_includes_the_commentary_fields() {
        let entry = liferaft_entry();
        let rendered = KnowledgeBase::render_markdown(&[&entry]);
        assert!(rendered.contains("验船实务参考"));
        assert!(rendered.contains("**适用法规**: SOLAS III/31.1.4, SOLAS III/31"));
        assert!(rendered.contains("**正确理解**"));
        assert!(rendered.contains("**常见误解**"));
        assert!(rendered.contains("- 尾部free-fall lifeboat"));
        assert_eq!(KnowledgeBase::render_markdown(&[]), "");
    }

    #[test]
    fn missing_directory_loads_empty() {
        let base = KnowledgeBase::load(Path::new("/nonexistent/knowledge")).unwrap();
        assert!(base.is_empty());
    }
}
