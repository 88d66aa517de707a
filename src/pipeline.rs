//! End-to-end request lifecycle: memory, classification, enhancement,
//! retrieval, knowledge injection, generation, persistence and the
//! fire-and-forget utility feedback.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::classifier;
use crate::enhancer;
use crate::error::{RagError, RagResult};
use crate::generator::{self, AnswerGenerator, Citation, SourceRef};
use crate::knowledge::KnowledgeBase;
use crate::memory::{ConversationMemory, InputMode, TurnMetadata};
use crate::records::{Candidate, Confidence};
use crate::retriever::{HybridRetriever, Strategy};
use crate::utility::{self, UtilityStore};
use crate::vector::SearchFilters;
use crate::voice::{self, SttClient, TtsClient};

/// Response envelope returned by the query endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    /// Session the turn was recorded into.
    pub session_id: String,
    /// Query after coreference resolution and enhancement.
    pub enhanced_query: String,
    /// Answer text.
    pub answer_text: String,
    /// Base64 mp3 when audio was requested, `null` otherwise.
    pub answer_audio_base64: Option<String>,
    /// Extracted citations.
    pub citations: Vec<Citation>,
    /// Confidence label.
    pub confidence: Confidence,
    /// Model that answered.
    pub model_used: String,
    /// Evidence sources.
    pub sources: Vec<SourceRef>,
    /// Stage timings in milliseconds.
    pub timing: BTreeMap<String, u64>,
    /// Input channel of the query.
    pub input_mode: InputMode,
    /// Transcribed (voice) or original (text) query.
    pub transcription: String,
    /// True when a retrieval leg failed and results are partial.
    pub partial_retrieval: bool,
}

/// The assembled question-answering pipeline.
pub struct QaPipeline {
    memory: ConversationMemory,
    retriever: HybridRetriever,
    knowledge: Arc<KnowledgeBase>,
    generator: AnswerGenerator,
    utility: UtilityStore,
    stt: SttClient,
    tts: TtsClient,
    utility_timeout: Duration,
}

impl QaPipeline {
    /// Wires the pipeline from its components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory: ConversationMemory,
        retriever: HybridRetriever,
        knowledge: Arc<KnowledgeBase>,
        generator: AnswerGenerator,
        utility: UtilityStore,
        stt: SttClient,
        tts: TtsClient,
        utility_timeout: Duration,
    ) -> Self {
        Self {
            memory,
            retriever,
            knowledge,
            generator,
            utility,
            stt,
            tts,
            utility_timeout,
        }
    }

    /// Conversation memory accessor for the admin endpoints.
    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// TTS adapter accessor for the standalone synthesis endpoint.
    pub fn tts(&self) -> &TtsClient {
        &self.tts
    }

    /// Runs the text path end to end.
    pub async fn process_text_query(
        &self,
        text: &str,
        session_id: Option<&str>,
        user_id: &str,
        generate_audio: bool,
        input_mode: InputMode,
    ) -> RagResult<QueryOutcome> {
        if text.trim().is_empty() {
            return Err(RagError::InvalidInput("query text must not be empty".into()));
        }
        let total_start = Instant::now();
        let mut timing: BTreeMap<String, u64> = BTreeMap::new();

        // Session load + coreference-resolved query.
        let stage = Instant::now();
        let mut session = self.memory.load_or_create(session_id, user_id).await;
        let (messages, resolved_query) = self.memory.build_llm_context(&session, text).await;
        timing.insert("memory_ms".into(), stage.elapsed().as_millis() as u64);
        info!(
            session_id = %session.session_id,
            turns = session.turns.len(),
            "pipeline request started"
        );

        let classification = classifier::classify(text);
        let enhancement = enhancer::enhance(&resolved_query);

        // Hybrid retrieval.
        let stage = Instant::now();
        let batch = self
            .retriever
            .retrieve(
                &resolved_query,
                &enhancement.enhanced_query,
                classification.top_k,
                Strategy::Auto,
                &SearchFilters::default(),
            )
            .await?;
        timing.insert("retrieval_ms".into(), stage.elapsed().as_millis() as u64);
        if let Some(ms) = batch.latencies.vector_ms {
            timing.insert("vector_ms".into(), ms);
        }
        if let Some(ms) = batch.latencies.lexical_ms {
            timing.insert("lexical_ms".into(), ms);
        }
        if let Some(ms) = batch.latencies.graph_ms {
            timing.insert("graph_ms".into(), ms);
        }

        // Practical-knowledge injection.
        let stage = Instant::now();
        let entries = self.knowledge.query(
            text,
            &enhancement.matched_terms,
            &enhancement.regulation_hints,
        );
        let practical = KnowledgeBase::render_markdown(&entries);
        let user_context = self.memory.user_context(&session.user_id).await;
        timing.insert("knowledge_ms".into(), stage.elapsed().as_millis() as u64);

        // Generation with one cross-model retry.
        let stage = Instant::now();
        let first = self
            .generator
            .generate(
                &resolved_query,
                &enhancement.enhanced_query,
                &batch.candidates,
                &messages,
                Some(user_context.as_str()),
                Some(practical.as_str()),
                &classification,
                None,
            )
            .await;
        let generated = match first {
            Ok(generated) => generated,
            Err(RagError::GenerationUnavailable(reason)) => {
                warn!(%reason, "generation failed, retrying with the alternate model");
                let routed = generator::route_model(
                    classification.model_hint,
                    &resolved_query,
                    &enhancement.enhanced_query,
                    &batch.candidates,
                );
                self.generator
                    .generate(
                        &resolved_query,
                        &enhancement.enhanced_query,
                        &batch.candidates,
                        &messages,
                        Some(user_context.as_str()),
                        Some(practical.as_str()),
                        &classification,
                        Some(routed.alternate()),
                    )
                    .await?
            }
            Err(err) => return Err(err),
        };
        timing.insert("generation_ms".into(), stage.elapsed().as_millis() as u64);

        // Optional speech synthesis.
        let stage = Instant::now();
        let answer_audio_base64 = if generate_audio {
            let tts_text = voice::prepare_tts_text(&generated.answer, 1500);
            if tts_text.is_empty() {
                None
            } else {
                match self.tts.synthesize(&tts_text).await {
                    Ok(audio) => Some(base64::engine::general_purpose::STANDARD.encode(audio)),
                    Err(err) => {
                        error!(%err, "speech synthesis failed");
                        None
                    }
                }
            }
        } else {
            None
        };
        timing.insert("tts_ms".into(), stage.elapsed().as_millis() as u64);

        // Persist the paired turns, user first.
        let retrieved_regulations = retrieved_regulation_refs(&batch.candidates);
        self.memory
            .add_user_turn(
                &mut session,
                text,
                input_mode,
                TurnMetadata {
                    enhanced_query: Some(enhancement.enhanced_query.clone()),
                    ..TurnMetadata::default()
                },
            )
            .await;
        self.memory
            .add_assistant_turn(
                &mut session,
                &generated.answer,
                TurnMetadata {
                    enhanced_query: Some(enhancement.enhanced_query.clone()),
                    retrieved_regulations: retrieved_regulations.clone(),
                    citations: generated.citations.iter().map(|c| c.citation.clone()).collect(),
                    confidence: Some(generated.confidence),
                    ..TurnMetadata::default()
                },
            )
            .await;
        self.memory.update_user_profile(&session).await;

        // Best-effort utility feedback on its own task; never blocks the
        // response.
        self.spawn_utility_update(&enhancement.enhanced_query, &batch.candidates, &generated);

        timing.insert("total_ms".into(), total_start.elapsed().as_millis() as u64);
        Ok(QueryOutcome {
            session_id: session.session_id.clone(),
            enhanced_query: enhancement.enhanced_query,
            answer_text: generated.answer,
            answer_audio_base64,
            citations: generated.citations,
            confidence: generated.confidence,
            model_used: generated.model_used,
            sources: generated.sources,
            timing,
            input_mode,
            transcription: text.to_string(),
            partial_retrieval: batch.partial_retrieval,
        })
    }

    /// Runs the voice path: transcription first, then the text path.
    pub async fn process_voice_query(
        &self,
        audio: Vec<u8>,
        audio_format: &str,
        session_id: Option<&str>,
        language: Option<&str>,
        user_id: &str,
    ) -> RagResult<QueryOutcome> {
        if audio.is_empty() {
            return Err(RagError::InvalidInput("audio payload must not be empty".into()));
        }
        let stage = Instant::now();
        let transcription = self
            .stt
            .transcribe(audio, audio_format, language)
            .await
            .map_err(|err| RagError::GenerationUnavailable(format!("transcription: {err}")))?;
        let stt_ms = stage.elapsed().as_millis() as u64;

        let mut outcome = self
            .process_text_query(
                &transcription.text,
                session_id,
                user_id,
                true,
                InputMode::Voice,
            )
            .await?;
        outcome.timing.insert("stt_ms".into(), stt_ms);
        outcome.transcription = transcription.text;
        Ok(outcome)
    }

    fn spawn_utility_update(
        &self,
        enhanced_query: &str,
        candidates: &[Candidate],
        generated: &generator::GeneratedAnswer,
    ) {
        let store = self.utility.clone();
        let category = utility::categorize(enhanced_query).to_string();
        let retrieved: Vec<String> = candidates.iter().map(|c| c.chunk_id.clone()).collect();
        let cited = cited_chunk_ids(&generated.citations, candidates);
        let confidence = generated.confidence;
        let refusal = generator::is_refusal(&generated.answer);
        let budget = self.utility_timeout;
        tokio::spawn(async move {
            let update = store.update(&retrieved, &cited, confidence, refusal, &category);
            match tokio::time::timeout(budget, update).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "utility update failed"),
                Err(_) => warn!("utility update timed out"),
            }
        });
    }
}

/// Regulation references behind the top candidates, used for coreference
/// resolution in later turns.
pub fn retrieved_regulation_refs(candidates: &[Candidate]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    for candidate in candidates.iter().take(5) {
        let reference = generator::extract_regulation_ref(
            &candidate.metadata.title,
            &candidate.metadata.document,
            &candidate.metadata.regulation_number,
        );
        if !reference.is_empty() && seen.insert(reference.clone()) {
            refs.push(reference);
        }
    }
    refs
}

/// Chunk ids whose breadcrumb/title/regulation fields match an extracted
/// citation: the cited document must appear, and at least two reference
/// fragments (or all of them, when fewer) must appear too.
pub fn cited_chunk_ids(citations: &[Citation], candidates: &[Candidate]) -> HashSet<String> {
    let mut cited = HashSet::new();
    for citation in citations {
        let inner = citation.citation.trim_matches(|c| c == '[' || c == ']');
        let mut words = inner.split_whitespace();
        let Some(document) = words.next() else { continue };
        let document_lower = document.to_lowercase();
        let fragment = words.collect::<Vec<_>>().join(" ");
        let tokens: Vec<String> = fragment
            .split(|c: char| "/.,-− ".contains(c))
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("regulation") && !t.eq_ignore_ascii_case("reg"))
            .map(|t| t.to_lowercase())
            .collect();
        let required = tokens.len().min(2);

        for candidate in candidates {
            let haystack = format!(
                "{} {} {}",
                candidate.metadata.breadcrumb,
                candidate.metadata.title,
                candidate.metadata.regulation_number
            )
            .to_lowercase();
            if !haystack.contains(&document_lower) {
                continue;
            }
            let matched = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
            if matched >= required {
                cited.insert(candidate.chunk_id.clone());
            }
        }
    }
    cited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ChunkMetadata;
    use pretty_assertions::assert_eq;

    fn candidate(chunk_id: &str, breadcrumb: &str, title: &str) -> Candidate {
        Candidate::new(
            chunk_id.to_string(),
            "text".to_string(),
            ChunkMetadata {
                breadcrumb: breadcrumb.to_string(),
                title: title.to_string(),
                document: "SOLAS".to_string(),
                ..ChunkMetadata::default()
            },
        )
    }

    fn citation(text: &str) -> Citation {
        Citation {
            citation: text.to_string(),
            verified: true,
        }
    }

    #[test]
    fn cited_ids_match_on_document_and_fragments() {
        let candidates = vec![
            candidate(
                "a",
                "SOLAS > Chapter III > Regulation 31",
                "Survival craft and rescue boats",
            ),
            candidate(
                "b",
                "SOLAS > Chapter II-2 > Regulation 9",
                "Containment of fire",
            ),
            candidate("c", "MARPOL > Annex I > Regulation 34", "Control of discharge"),
        ];
        let cited = cited_chunk_ids(&[citation("[SOLAS III/31.1.4]")], &candidates);
        assert!(cited.contains("a"));
        assert!(!cited.contains("b"));
        assert!(!cited.contains("c"));
    }

    #[test]
    fn document_only_citations_match_document_chunks() {
        let candidates = vec![candidate("a", "SOLAS > Chapter III", "General")];
        let cited = cited_chunk_ids(&[citation("[SOLAS]")], &candidates);
        assert!(cited.contains("a"));
    }

    #[test]
    fn uncited_documents_do_not_match() {
        let candidates = vec![candidate("c", "MARPOL > Annex I > Regulation 34", "Discharge")];
        let cited = cited_chunk_ids(&[citation("[SOLAS III/31]")], &candidates);
        assert!(cited.is_empty());
    }

    #[test]
    fn retrieved_refs_come_from_the_top_five_only() {
        let mut candidates: Vec<Candidate> = (0..8)
            .map(|i| {
                candidate(
                    &format!("chunk{i}"),
                    "SOLAS > Chapter III",
                    &format!("SOLAS Regulation III/{i} – Requirements"),
                )
            })
            .collect();
        candidates[7].metadata.title = "SOLAS Regulation III/99 – Out of range".to_string();
        let refs = retrieved_regulation_refs(&candidates);
        assert_eq!(refs.len(), 5);
        assert!(refs.iter().all(|r| !r.contains("III/99")));
        assert_eq!(refs[0], "SOLAS Regulation III/0");
    }
}
