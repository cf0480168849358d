//! Criteria-based feedback generation with a tiered fallback chain.
//!
//! Tier 1 runs a structured analysis call plus a prose synthesis call.
//! Tier 2 is the legacy single-step path. Tier 3 produces a deterministic
//! minimal result without any model call. The chain guarantees that a
//! successful return is always well-formed prose plus a schema-valid
//! analysis; the only errors surfaced upward are timeout (transient) and
//! exhausted/terminal failures (permanent).

pub(crate) mod normalize;
pub(crate) mod prompts;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::AiSettings;
use crate::services::ollama::{GenerateRequest, ModelError, OllamaClient};

use normalize::{default_analysis, parse_to_v2};

pub(crate) const STUB_FEEDBACK: &str =
    "**Rückmeldung**\n\n- Stärken: klar erkennbar.\n- Hinweise: gezielt ausbauen.";
pub(crate) const EMPTY_CRITERIA_FEEDBACK: &str =
    "**Rückmeldung**\n\n- Bitte Kriterien definieren, um eine Bewertung zu erhalten.";

/// parse_status values that mark a degraded result. Paired with a stub or
/// blank feedback text they trigger the caller-side direct fallback.
const DEGRADED_STATUSES: &[&str] =
    &["analysis_fallback", "analysis_error", "analysis_feedback_fallback"];

#[derive(Debug, Clone)]
pub(crate) struct FeedbackRequest<'a> {
    pub(crate) text: &'a str,
    pub(crate) criteria: &'a [String],
    pub(crate) teacher_instructions: Option<&'a str>,
    pub(crate) hints: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub(crate) struct FeedbackResult {
    pub(crate) feedback_md: String,
    pub(crate) analysis_json: Value,
    /// Diagnostic tag naming the branch that produced the result. Logged
    /// and inspected by the degrade policy; never shown to students.
    pub(crate) parse_status: &'static str,
}

#[derive(Debug, Error)]
pub(crate) enum FeedbackError {
    #[error("transient feedback failure: {0}")]
    Transient(String),
    #[error("permanent feedback failure: {0}")]
    Permanent(String),
}

enum TierOutcome {
    Success(FeedbackResult),
    Degraded { reason: &'static str },
    Fatal { kind: FeedbackError },
}

#[async_trait]
pub(crate) trait FeedbackModel: Send + Sync {
    async fn analysis_call(&self, prompt: &str) -> Result<String, ModelError>;
    async fn synthesis_call(&self, prompt: &str) -> Result<String, ModelError>;
    async fn completion_call(&self, prompt: &str) -> Result<String, ModelError>;
}

pub(crate) struct OllamaFeedback {
    client: OllamaClient,
    model: String,
    timeout: Duration,
}

impl OllamaFeedback {
    pub(crate) fn new(client: OllamaClient, model: &str, timeout: Duration) -> Self {
        Self { client, model: model.to_string(), timeout }
    }

    async fn call(&self, prompt: &str, raw: bool) -> Result<String, ModelError> {
        self.client
            .generate(GenerateRequest {
                model: &self.model,
                prompt,
                images: &[],
                timeout: self.timeout,
                raw,
            })
            .await
    }
}

#[async_trait]
impl FeedbackModel for OllamaFeedback {
    async fn analysis_call(&self, prompt: &str) -> Result<String, ModelError> {
        self.call(prompt, false).await
    }

    async fn synthesis_call(&self, prompt: &str) -> Result<String, ModelError> {
        self.call(prompt, false).await
    }

    async fn completion_call(&self, prompt: &str) -> Result<String, ModelError> {
        self.call(prompt, true).await
    }
}

pub(crate) struct FeedbackOrchestrator {
    model: Box<dyn FeedbackModel>,
    model_id: String,
    base_url: String,
}

impl FeedbackOrchestrator {
    pub(crate) fn new(model: Box<dyn FeedbackModel>, model_id: &str, base_url: &str) -> Self {
        Self { model, model_id: model_id.to_string(), base_url: base_url.to_string() }
    }

    pub(crate) fn from_settings(settings: &AiSettings) -> anyhow::Result<Self> {
        let client = OllamaClient::new(&settings.ollama_base_url)?;
        let timeout = Duration::from_secs(settings.timeout_feedback_seconds);
        let model = OllamaFeedback::new(client, &settings.feedback_model, timeout);
        Ok(Self::new(Box::new(model), &settings.feedback_model, &settings.ollama_base_url))
    }

    pub(crate) async fn analyze(
        &self,
        request: FeedbackRequest<'_>,
    ) -> Result<FeedbackResult, FeedbackError> {
        if request.criteria.is_empty() {
            return Ok(direct_feedback(request.criteria));
        }

        if let Some(reason) = self.gate_reason() {
            tracing::info!(reason, "Structured feedback unavailable; using direct fallback");
            return Ok(direct_feedback(request.criteria));
        }

        let reason = match self.structured_tier(&request).await {
            TierOutcome::Success(result) => return Ok(result),
            TierOutcome::Fatal { kind } => return Err(kind),
            TierOutcome::Degraded { reason } => reason,
        };

        tracing::warn!(error_class = reason, "Structured feedback failed; trying legacy path");

        match self.legacy_tier(&request).await {
            TierOutcome::Success(result) => Ok(result),
            TierOutcome::Fatal { kind } => Err(kind),
            TierOutcome::Degraded { reason } => {
                Err(FeedbackError::Permanent(format!("legacy tier degraded: {reason}")))
            }
        }
    }

    fn gate_reason(&self) -> Option<&'static str> {
        if self.model_id.trim().is_empty() {
            return Some("missing_model");
        }
        if self.base_url.trim().is_empty() {
            return Some("missing_base_url");
        }
        None
    }

    /// Tier 1: structured analysis plus prose synthesis. Content problems
    /// degrade within the tier; only transport errors escalate, and a
    /// timeout anywhere aborts the whole attempt.
    async fn structured_tier(&self, request: &FeedbackRequest<'_>) -> TierOutcome {
        let analysis_prompt = prompts::build_analysis_prompt(
            request.criteria,
            request.teacher_instructions,
            request.hints,
            request.text,
        );
        let raw = match self.model.analysis_call(&analysis_prompt).await {
            Ok(raw) => raw,
            Err(ModelError::Timeout) => {
                return TierOutcome::Fatal {
                    kind: FeedbackError::Transient("structured analysis call timed out".to_string()),
                };
            }
            Err(err) => return TierOutcome::Degraded { reason: err.class() },
        };

        let (parsed, embedded) = parse_to_v2(&raw, request.criteria);
        let (analysis, parse_status) = match parsed {
            Some(analysis) => (analysis, "parsed_structured"),
            None => (default_analysis(request.criteria), "analysis_fallback"),
        };
        let analysis_json = serde_json::to_value(&analysis).unwrap_or_default();

        let synthesis_prompt = prompts::build_synthesis_prompt(&analysis_json);
        let prose = match self.model.synthesis_call(&synthesis_prompt).await {
            Ok(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Err(ModelError::Timeout) => {
                return TierOutcome::Fatal {
                    kind: FeedbackError::Transient("synthesis call timed out".to_string()),
                };
            }
            Err(err) => {
                tracing::warn!(
                    error_class = err.class(),
                    "Synthesis call failed; continuing without prose"
                );
                None
            }
        };

        let (feedback_md, feedback_source, parse_status) = match prose {
            Some(text) => (text, "synthesis", parse_status),
            None => match embedded {
                Some(text) => (text, "analysis_embed", parse_status),
                None => {
                    let status = if parse_status == "parsed_structured" {
                        "feedback_fallback"
                    } else {
                        "analysis_feedback_fallback"
                    };
                    (STUB_FEEDBACK.to_string(), "template", status)
                }
            },
        };

        tracing::info!(
            feedback_source,
            parse_status,
            criteria_count = request.criteria.len(),
            "Feedback generated"
        );

        TierOutcome::Success(FeedbackResult { feedback_md, analysis_json, parse_status })
    }

    /// Tier 2: one analysis call plus one raw completion call. There is no
    /// tier below this one, so a non-timeout feedback failure is terminal.
    async fn legacy_tier(&self, request: &FeedbackRequest<'_>) -> TierOutcome {
        let analysis_prompt = prompts::build_analysis_prompt(
            request.criteria,
            request.teacher_instructions,
            request.hints,
            request.text,
        );

        let mut analysis_ok = true;
        let analysis = match self.model.analysis_call(&analysis_prompt).await {
            Ok(raw) => match parse_to_v2(&raw, request.criteria).0 {
                Some(analysis) => analysis,
                None => {
                    analysis_ok = false;
                    default_analysis(request.criteria)
                }
            },
            Err(ModelError::Timeout) => {
                return TierOutcome::Fatal {
                    kind: FeedbackError::Transient("legacy analysis call timed out".to_string()),
                };
            }
            Err(err) => {
                tracing::warn!(
                    error_class = err.class(),
                    "Legacy analysis call failed; using zero default"
                );
                analysis_ok = false;
                default_analysis(request.criteria)
            }
        };

        let completion_prompt =
            prompts::build_completion_prompt(request.criteria.len(), request.text);
        let text = match self.model.completion_call(&completion_prompt).await {
            Ok(text) => text,
            Err(ModelError::Timeout) => {
                return TierOutcome::Fatal {
                    kind: FeedbackError::Transient("legacy feedback call timed out".to_string()),
                };
            }
            Err(err) => {
                return TierOutcome::Fatal {
                    kind: FeedbackError::Permanent(format!(
                        "legacy feedback call failed: {}",
                        err.class()
                    )),
                };
            }
        };

        let trimmed = text.trim();
        let (feedback_md, parse_status) = if trimmed.is_empty() {
            (STUB_FEEDBACK.to_string(), "stub")
        } else if analysis_ok {
            (trimmed.to_string(), "model")
        } else {
            (trimmed.to_string(), "analysis_error")
        };

        tracing::info!(
            feedback_source = "legacy",
            parse_status,
            criteria_count = request.criteria.len(),
            "Feedback generated"
        );

        TierOutcome::Success(FeedbackResult {
            feedback_md,
            analysis_json: serde_json::to_value(&analysis).unwrap_or_default(),
            parse_status,
        })
    }
}

/// Tier 3: deterministic minimal result without any model call. With zero
/// criteria there is nothing to assess and the result is marked skipped.
pub(crate) fn direct_feedback(criteria: &[String]) -> FeedbackResult {
    if criteria.is_empty() {
        tracing::info!(
            feedback_source = "skipped",
            parse_status = "skipped",
            criteria_count = 0usize,
            "Feedback generated"
        );
        return FeedbackResult {
            feedback_md: EMPTY_CRITERIA_FEEDBACK.to_string(),
            analysis_json: json!({}),
            parse_status: "skipped",
        };
    }

    let analysis = default_analysis(criteria);
    tracing::info!(
        feedback_source = "direct",
        parse_status = "direct",
        criteria_count = criteria.len(),
        "Feedback generated"
    );
    FeedbackResult {
        feedback_md: STUB_FEEDBACK.to_string(),
        analysis_json: serde_json::to_value(&analysis).unwrap_or_default(),
        parse_status: "direct",
    }
}

/// Canned result for the stub backend.
pub(crate) fn stub_feedback(criteria: &[String]) -> FeedbackResult {
    if criteria.is_empty() {
        return direct_feedback(criteria);
    }

    let analysis = default_analysis(criteria);
    tracing::info!(
        feedback_source = "stub",
        parse_status = "stub",
        criteria_count = criteria.len(),
        "Feedback generated"
    );
    FeedbackResult {
        feedback_md: STUB_FEEDBACK.to_string(),
        analysis_json: serde_json::to_value(&analysis).unwrap_or_default(),
        parse_status: "stub",
    }
}

pub(crate) fn is_stub_feedback(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || (trimmed.starts_with("**Rückmeldung**") && trimmed.contains("Stärken:"))
}

/// Caller-side degrade policy: a degraded parse_status whose feedback text
/// is blank or a recognized stub should be replaced by a direct result.
pub(crate) fn should_degrade(parse_status: &str, feedback_md: &str) -> bool {
    DEGRADED_STATUSES.contains(&parse_status) && is_stub_feedback(feedback_md)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    enum Reply {
        Text(&'static str),
        Timeout,
        Unavailable,
        Failed,
    }

    impl Reply {
        fn to_result(&self) -> Result<String, ModelError> {
            match self {
                Reply::Text(text) => Ok((*text).to_string()),
                Reply::Timeout => Err(ModelError::Timeout),
                Reply::Unavailable => Err(ModelError::Unavailable("connection refused".into())),
                Reply::Failed => Err(ModelError::Failed("boom".into())),
            }
        }
    }

    struct ScriptedModel {
        analysis: Reply,
        synthesis: Reply,
        completion: Reply,
        analysis_calls: AtomicUsize,
        synthesis_calls: AtomicUsize,
        completion_calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(analysis: Reply, synthesis: Reply, completion: Reply) -> Arc<Self> {
            Arc::new(Self {
                analysis,
                synthesis,
                completion,
                analysis_calls: AtomicUsize::new(0),
                synthesis_calls: AtomicUsize::new(0),
                completion_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FeedbackModel for Arc<ScriptedModel> {
        async fn analysis_call(&self, _prompt: &str) -> Result<String, ModelError> {
            self.analysis_calls.fetch_add(1, Ordering::SeqCst);
            self.analysis.to_result()
        }

        async fn synthesis_call(&self, _prompt: &str) -> Result<String, ModelError> {
            self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
            self.synthesis.to_result()
        }

        async fn completion_call(&self, _prompt: &str) -> Result<String, ModelError> {
            self.completion_calls.fetch_add(1, Ordering::SeqCst);
            self.completion.to_result()
        }
    }

    fn orchestrator(model: Arc<ScriptedModel>) -> FeedbackOrchestrator {
        FeedbackOrchestrator::new(Box::new(model), "test-model", "http://localhost:11434")
    }

    fn request<'a>(criteria: &'a [String]) -> FeedbackRequest<'a> {
        FeedbackRequest {
            text: "Die Abgabe.",
            criteria,
            teacher_instructions: None,
            hints: None,
        }
    }

    fn criteria(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    const GOOD_ANALYSIS: &str = r#"{"score": 4, "criteria_results": [
        {"criterion": "Inhalt", "max_score": 10, "score": 8, "explanation_md": "stark"}
    ], "feedback_md": "Eingebettetes Feedback."}"#;

    const ANALYSIS_WITHOUT_FEEDBACK: &str = r#"{"score": 2, "criteria_results": [
        {"criterion": "Inhalt", "max_score": 10, "score": 4, "explanation_md": "okay"}
    ]}"#;

    #[tokio::test]
    async fn structured_success_uses_synthesis_prose() {
        let model = ScriptedModel::new(
            Reply::Text(GOOD_ANALYSIS),
            Reply::Text("Was war gut? Vieles. Was kann verbessert werden? Einiges."),
            Reply::Failed,
        );
        let subject = orchestrator(model.clone());
        let criteria = criteria(&["Inhalt"]);

        let result = subject.analyze(request(&criteria)).await.unwrap();

        assert_eq!(result.parse_status, "parsed_structured");
        assert!(result.feedback_md.starts_with("Was war gut?"));
        assert_eq!(result.analysis_json["schema"], "criteria.v2");
        assert_eq!(result.analysis_json["criteria_results"][0]["score"], 8);
        assert_eq!(model.completion_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn analysis_timeout_re_raises_without_lower_tiers() {
        let model = ScriptedModel::new(Reply::Timeout, Reply::Text("x"), Reply::Text("y"));
        let subject = orchestrator(model.clone());
        let criteria = criteria(&["Inhalt"]);

        let err = subject.analyze(request(&criteria)).await.unwrap_err();

        assert!(matches!(err, FeedbackError::Transient(_)));
        assert_eq!(model.synthesis_calls.load(Ordering::SeqCst), 0);
        assert_eq!(model.completion_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn synthesis_timeout_re_raises() {
        let model = ScriptedModel::new(Reply::Text(GOOD_ANALYSIS), Reply::Timeout, Reply::Text("y"));
        let subject = orchestrator(model.clone());
        let criteria = criteria(&["Inhalt"]);

        let err = subject.analyze(request(&criteria)).await.unwrap_err();

        assert!(matches!(err, FeedbackError::Transient(_)));
        assert_eq!(model.completion_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unparsable_analysis_degrades_to_zero_default() {
        let model = ScriptedModel::new(
            Reply::Text("keine strukturierten Daten"),
            Reply::Text("Trotzdem eine Rückmeldung."),
            Reply::Failed,
        );
        let subject = orchestrator(model);
        let criteria = criteria(&["Inhalt", "Struktur"]);

        let result = subject.analyze(request(&criteria)).await.unwrap();

        assert_eq!(result.parse_status, "analysis_fallback");
        assert_eq!(result.feedback_md, "Trotzdem eine Rückmeldung.");
        let results = result.analysis_json["criteria_results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|item| item["score"] == 0));
    }

    #[tokio::test]
    async fn missing_prose_falls_back_to_embedded_feedback() {
        let model =
            ScriptedModel::new(Reply::Text(GOOD_ANALYSIS), Reply::Text("   "), Reply::Failed);
        let subject = orchestrator(model);
        let criteria = criteria(&["Inhalt"]);

        let result = subject.analyze(request(&criteria)).await.unwrap();

        assert_eq!(result.parse_status, "parsed_structured");
        assert_eq!(result.feedback_md, "Eingebettetes Feedback.");
    }

    #[tokio::test]
    async fn missing_prose_and_embedded_use_template() {
        let model = ScriptedModel::new(
            Reply::Text(ANALYSIS_WITHOUT_FEEDBACK),
            Reply::Failed,
            Reply::Failed,
        );
        let subject = orchestrator(model);
        let criteria = criteria(&["Inhalt"]);

        let result = subject.analyze(request(&criteria)).await.unwrap();

        assert_eq!(result.parse_status, "feedback_fallback");
        assert_eq!(result.feedback_md, STUB_FEEDBACK);
    }

    #[tokio::test]
    async fn parse_and_prose_failure_combine_statuses() {
        let model = ScriptedModel::new(Reply::Text("???"), Reply::Failed, Reply::Failed);
        let subject = orchestrator(model);
        let criteria = criteria(&["Inhalt"]);

        let result = subject.analyze(request(&criteria)).await.unwrap();

        assert_eq!(result.parse_status, "analysis_feedback_fallback");
        assert_eq!(result.feedback_md, STUB_FEEDBACK);
    }

    #[tokio::test]
    async fn transport_failure_escalates_to_legacy_tier() {
        let model = ScriptedModel::new(
            Reply::Unavailable,
            Reply::Text("unused"),
            Reply::Text("Legacy Rückmeldung."),
        );
        let subject = orchestrator(model.clone());
        let criteria = criteria(&["Inhalt"]);

        let result = subject.analyze(request(&criteria)).await.unwrap();

        assert_eq!(result.parse_status, "analysis_error");
        assert_eq!(result.feedback_md, "Legacy Rückmeldung.");
        assert_eq!(model.analysis_calls.load(Ordering::SeqCst), 2);
        assert_eq!(model.completion_calls.load(Ordering::SeqCst), 1);
        assert_eq!(model.synthesis_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn legacy_empty_completion_yields_stub_status() {
        let model = ScriptedModel::new(Reply::Unavailable, Reply::Failed, Reply::Text("   "));
        let subject = orchestrator(model);
        let criteria = criteria(&["Inhalt"]);

        let result = subject.analyze(request(&criteria)).await.unwrap();

        assert_eq!(result.parse_status, "stub");
        assert_eq!(result.feedback_md, STUB_FEEDBACK);
    }

    #[tokio::test]
    async fn legacy_feedback_failure_is_permanent() {
        let model = ScriptedModel::new(Reply::Unavailable, Reply::Failed, Reply::Failed);
        let subject = orchestrator(model);
        let criteria = criteria(&["Inhalt"]);

        let err = subject.analyze(request(&criteria)).await.unwrap_err();
        assert!(matches!(err, FeedbackError::Permanent(_)));
    }

    #[tokio::test]
    async fn legacy_feedback_timeout_is_transient() {
        let model = ScriptedModel::new(Reply::Unavailable, Reply::Failed, Reply::Timeout);
        let subject = orchestrator(model);
        let criteria = criteria(&["Inhalt"]);

        let err = subject.analyze(request(&criteria)).await.unwrap_err();
        assert!(matches!(err, FeedbackError::Transient(_)));
    }

    #[tokio::test]
    async fn empty_criteria_skip_all_model_calls() {
        let model = ScriptedModel::new(Reply::Text("x"), Reply::Text("y"), Reply::Text("z"));
        let subject = orchestrator(model.clone());
        let criteria: Vec<String> = Vec::new();

        let result = subject.analyze(request(&criteria)).await.unwrap();

        assert_eq!(result.parse_status, "skipped");
        assert_eq!(result.analysis_json, json!({}));
        assert!(!result.feedback_md.is_empty());
        assert_eq!(model.analysis_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unconfigured_model_gates_to_direct() {
        let model = ScriptedModel::new(Reply::Text("x"), Reply::Text("y"), Reply::Text("z"));
        let subject = FeedbackOrchestrator::new(Box::new(model.clone()), "", "http://x");
        let criteria = criteria(&["Inhalt"]);

        let result = subject.analyze(request(&criteria)).await.unwrap();

        assert_eq!(result.parse_status, "direct");
        assert_eq!(result.feedback_md, STUB_FEEDBACK);
        assert_eq!(result.analysis_json["score"], 0);
        assert_eq!(model.analysis_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stub_result_is_schema_valid() {
        let result = stub_feedback(&criteria(&["Inhalt"]));
        assert_eq!(result.parse_status, "stub");
        assert_eq!(result.analysis_json["schema"], "criteria.v2");
        assert_eq!(result.feedback_md, STUB_FEEDBACK);
    }

    #[test]
    fn degrade_policy_requires_both_status_and_stub_text() {
        assert!(should_degrade("analysis_fallback", STUB_FEEDBACK));
        assert!(should_degrade("analysis_error", "   "));
        assert!(should_degrade("analysis_feedback_fallback", ""));
        assert!(!should_degrade("analysis_fallback", "Echte Rückmeldung mit Substanz."));
        assert!(!should_degrade("parsed_structured", STUB_FEEDBACK));
        assert!(!should_degrade("model", ""));
    }
}
