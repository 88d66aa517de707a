//! Scenario-level checks over the pure stages of the pipeline: the
//! classifier, enhancer, router and knowledge base working together on
//! realistic surveyor questions.

use bvrag::classifier::{classify, Intent, ModelHint};
use bvrag::enhancer::enhance;
use bvrag::generator::{assess_confidence, extract_citations, route_model, ModelChoice};
use bvrag::knowledge::KnowledgeBase;
use bvrag::memory::{context_prefix, detect_anaphor};
use bvrag::records::{Candidate, ChunkMetadata};
use bvrag::retriever::{effective_top_k, route, Strategy};
use pretty_assertions::assert_eq;

fn scored_candidate(chunk_id: &str, final_score: f64) -> Candidate {
    let mut candidate = Candidate::new(
        chunk_id.to_string(),
        "text".to_string(),
        ChunkMetadata::default(),
    );
    candidate.final_score = final_score;
    candidate
}

#[test]
fn tanker_bulkhead_question_targets_the_tanker_branch() {
    let query = "根据SOLAS，对于运输可燃液体货物的轮船,走廊和消防控制站之间的舱壁应该是什么防火等级？";
    let classification = classify(query);
    assert_eq!(classification.ship_info.ship_type.as_deref(), Some("tanker"));

    // A flammable-liquid cargo question is complex enough for the primary
    // model regardless of the intent hint.
    let choice = route_model(classification.model_hint, query, query, &[]);
    assert_eq!(choice, ModelChoice::Primary);

    // The document filter narrows retrieval to SOLAS.
    let routed = route(query);
    assert_eq!(routed.document_filter.as_deref(), Some("SOLAS"));
}

#[test]
fn bulk_carrier_question_is_not_a_tanker_question() {
    let classification = classify("散货船走廊和控制站之间的舱壁防火等级是什么");
    assert_eq!(
        classification.ship_info.ship_type.as_deref(),
        Some("bulk carrier")
    );
    assert!(!bvrag::classifier::is_tanker("bulk carrier"));
}

#[test]
fn follow_up_pronoun_gets_the_context_prefix() {
    // Turn 1 retrieved SOLAS II-1/3-6; turn 2 asks "does this apply".
    let query = "Does this apply to FPSO?";
    assert!(detect_anaphor(query));
    let prefixed = context_prefix(&["SOLAS Regulation II-1/3-6".to_string()], query);
    assert!(prefixed.starts_with("[Context: the previous question was about SOLAS Regulation II-1/3-6]"));
    assert!(prefixed.ends_with(query));
}

#[test]
fn davit_question_enhances_and_matches_practical_knowledge() {
    let query = "100 米货船两边救生筏都需要起降落设备吗";
    let classification = classify(query);
    assert_eq!(classification.intent, Intent::Applicability);
    assert_eq!(classification.model_hint, Some(ModelHint::Primary));

    let enhancement = enhance(query);
    for expected in ["85 metres", "davit-launched", "each side"] {
        assert!(
            enhancement.matched_terms.iter().any(|t| t == expected),
            "missing term {expected}"
        );
    }
    assert!(enhancement
        .regulation_hints
        .iter()
        .any(|r| r == "SOLAS III/31.1.4"));

    // Applicability wording doubles the retrieval width up to the ceiling.
    assert_eq!(
        effective_top_k(classification.top_k, query, &enhancement.enhanced_query),
        15
    );

    let base = KnowledgeBase::load(std::path::Path::new("knowledge/practical")).unwrap();
    let entries = base.query(
        query,
        &enhancement.matched_terms,
        &enhancement.regulation_hints,
    );
    assert!(!entries.is_empty());
    assert_eq!(entries[0].id, "davit_liferaft_85m_cargo");
    let rendered = KnowledgeBase::render_markdown(&entries);
    assert!(rendered.contains("free-fall lifeboat 不免除该要求") || rendered.contains("III/31.1.2.2"));
}

#[test]
fn exact_reference_lookup_routes_keyword_and_fast() {
    let query = "SOLAS II-1/3-6 的开口最小尺寸是多少";
    let classification = classify(query);
    assert_eq!(classification.intent, Intent::Specification);

    let routed = route(query);
    assert_eq!(routed.strategy, Strategy::Keyword);
    assert!(routed
        .regulation_ref
        .as_deref()
        .is_some_and(|r| r.contains("II-1/3-6")));

    let choice = route_model(classification.model_hint, query, query, &[]);
    assert_eq!(choice, ModelChoice::Fast);
}

#[test]
fn confident_answer_extracts_verified_citations() {
    let answer = "**直接答案：600 mm × 600 mm** [SOLAS II-1/3-6]\n\n\
                  通道开口的最小净尺寸为 600 mm × 600 mm [SOLAS II-1/3-6]。";
    let citations = extract_citations(answer);
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].citation, "[SOLAS II-1/3-6]");

    let confidence = assess_confidence(&[scored_candidate("a", 0.9)], answer);
    assert_eq!(confidence.as_str(), "high");
}
