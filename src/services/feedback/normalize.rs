//! Normalizes free-form model JSON into the `criteria.v2` analysis shape.
//!
//! Local models drift: they rename fields, invent criterion labels, return
//! stringified numbers, or wrap everything in a code fence. This module is
//! a pure total function over that mess: whatever comes in, the output
//! analysis always has exactly the caller's criteria, in the caller's
//! order, with every score clamped into range.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub(crate) const SCHEMA_V2: &str = "criteria.v2";
pub(crate) const NEUTRAL_EXPLANATION: &str = "Kurzbegründung auf Basis des Kriteriums.";

const DEFAULT_MAX_SCORE: i64 = 10;
const PARSE_SAMPLE_MAX_CHARS: usize = 160;

const FEEDBACK_KEYS: &[&str] = &["feedback_md", "feedback", "feedback_markdown"];
const ITEM_KEYS: &[&str] = &["criteria_results", "criteria"];
const LABEL_KEYS: &[&str] = &["criterion", "name"];
const MAX_KEYS: &[&str] = &["max_score", "max"];
const EXPLANATION_KEYS: &[&str] = &["explanation_md", "explanation"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CriterionResult {
    pub(crate) criterion: String,
    pub(crate) max_score: i64,
    pub(crate) score: i64,
    pub(crate) explanation_md: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CriteriaAnalysis {
    pub(crate) schema: String,
    pub(crate) score: i64,
    pub(crate) criteria_results: Vec<CriterionResult>,
}

/// Parses raw model output against the expected criteria labels.
///
/// Returns `(analysis, embedded_feedback)`. Both are `None` when the
/// payload is not a JSON object; otherwise the analysis is always present
/// and schema-valid, synthesizing zero-score defaults where the model
/// under-delivered.
pub(crate) fn parse_to_v2(
    raw: &str,
    expected: &[String],
) -> (Option<CriteriaAnalysis>, Option<String>) {
    let stripped = strip_code_fences(raw);
    let value: Value = match serde_json::from_str(stripped) {
        Ok(value) => value,
        Err(_) => {
            log_unparsed_sample(raw);
            return (None, None);
        }
    };
    let object = match value.as_object() {
        Some(object) => object,
        None => {
            log_unparsed_sample(raw);
            return (None, None);
        }
    };

    let feedback = string_field(object, FEEDBACK_KEYS).map(ToString::to_string);

    let mut candidates = collect_candidates(object);
    let criteria_results = align_to_expected(&mut candidates, expected);
    let score = overall_score(object, &criteria_results);

    let analysis = CriteriaAnalysis {
        schema: SCHEMA_V2.to_string(),
        score,
        criteria_results,
    };
    (Some(analysis), feedback)
}

/// All-zero analysis used when the model payload was unusable.
pub(crate) fn default_analysis(expected: &[String]) -> CriteriaAnalysis {
    CriteriaAnalysis {
        schema: SCHEMA_V2.to_string(),
        score: 0,
        criteria_results: expected.iter().map(|label| default_result(label)).collect(),
    }
}

fn default_result(label: &str) -> CriterionResult {
    CriterionResult {
        criterion: label.to_string(),
        max_score: DEFAULT_MAX_SCORE,
        score: 0,
        explanation_md: NEUTRAL_EXPLANATION.to_string(),
    }
}

struct Candidate {
    label: String,
    max_score: i64,
    score: i64,
    explanation: String,
    used: bool,
}

impl Candidate {
    fn into_result_as(&self, label: &str) -> CriterionResult {
        CriterionResult {
            criterion: label.to_string(),
            max_score: self.max_score,
            score: self.score,
            explanation_md: self.explanation.clone(),
        }
    }
}

fn collect_candidates(object: &Map<String, Value>) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let items = match ITEM_KEYS.iter().find_map(|key| {
        object.get(*key).and_then(Value::as_array).filter(|items| !items.is_empty())
    }) {
        Some(items) => items,
        None => return candidates,
    };

    for item in items {
        let item = match item.as_object() {
            Some(item) => item,
            None => continue,
        };
        // Items the model forgot to label cannot be aligned; drop them.
        let label = match string_field(item, LABEL_KEYS) {
            Some(label) => label.to_string(),
            None => continue,
        };
        let max_score = int_field(item, MAX_KEYS).unwrap_or(DEFAULT_MAX_SCORE).max(0);
        let score = int_field(item, &["score"]).unwrap_or(0).clamp(0, max_score);
        let explanation =
            string_field(item, EXPLANATION_KEYS).unwrap_or(NEUTRAL_EXPLANATION).to_string();

        candidates.push(Candidate { label, max_score, score, explanation, used: false });
    }

    candidates
}

/// Single-pass alignment: exact label match first; when the model returned
/// at least as many usable items as expected, unmatched labels consume the
/// next unused item positionally (relabeling it); otherwise they get a
/// zero-score default. Output cardinality and order always equal the
/// expected list.
fn align_to_expected(candidates: &mut [Candidate], expected: &[String]) -> Vec<CriterionResult> {
    let positional_allowed = candidates.len() >= expected.len();
    let mut results = Vec::with_capacity(expected.len());

    for label in expected {
        if let Some(candidate) =
            candidates.iter_mut().find(|candidate| !candidate.used && candidate.label == *label)
        {
            candidate.used = true;
            results.push(candidate.into_result_as(label));
            continue;
        }

        if positional_allowed {
            if let Some(candidate) = candidates.iter_mut().find(|candidate| !candidate.used) {
                candidate.used = true;
                results.push(candidate.into_result_as(label));
                continue;
            }
        }

        results.push(default_result(label));
    }

    results
}

fn overall_score(object: &Map<String, Value>, results: &[CriterionResult]) -> i64 {
    if let Some(score) = object.get("score").and_then(coerce_int) {
        return score.clamp(0, 5);
    }
    if results.is_empty() {
        return 0;
    }

    let sum: f64 = results
        .iter()
        .map(|result| result.score as f64 / result.max_score.max(1) as f64)
        .sum();
    let scaled = sum / results.len() as f64 * 5.0;
    (scaled.round() as i64).clamp(0, 5)
}

/// Accepts integers, floats (truncated toward zero), and stringified
/// numbers. Anything else is unusable.
fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Some(int)
            } else {
                number.as_f64().filter(|float| float.is_finite()).map(|float| float as i64)
            }
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                Some(int)
            } else {
                trimmed.parse::<f64>().ok().filter(|float| float.is_finite()).map(|float| float as i64)
            }
        }
        _ => None,
    }
}

fn string_field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| {
        object
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
    })
}

fn int_field(object: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| object.get(*key)).and_then(coerce_int)
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.starts_with("```") && trimmed.ends_with("```") && trimmed.lines().count() >= 3 {
        if let (Some(start), Some(end)) = (trimmed.find('\n'), trimmed.rfind('\n')) {
            if start < end {
                return trimmed[start + 1..end].trim();
            }
        }
    }
    trimmed
}

fn log_unparsed_sample(raw: &str) {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let sample: String = collapsed.chars().take(PARSE_SAMPLE_MAX_CHARS).collect();
    tracing::warn!(sample = %sample, "Analysis JSON did not parse");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn relabels_mismatched_names_when_count_matches() {
        let raw = json!({
            "score": 4,
            "criteria_results": [
                {"criterion": "Content", "max_score": 10, "score": 8, "explanation_md": "gut"},
                {"criterion": "Structure", "max_score": 10, "score": 6, "explanation_md": "okay"}
            ]
        })
        .to_string();

        let (analysis, _) = parse_to_v2(&raw, &labels(&["Inhalt", "Struktur"]));
        let analysis = analysis.unwrap();

        assert_eq!(analysis.schema, "criteria.v2");
        assert_eq!(analysis.score, 4);
        assert_eq!(analysis.criteria_results.len(), 2);
        assert_eq!(analysis.criteria_results[0].criterion, "Inhalt");
        assert_eq!(analysis.criteria_results[0].score, 8);
        assert_eq!(analysis.criteria_results[0].explanation_md, "gut");
        assert_eq!(analysis.criteria_results[1].criterion, "Struktur");
        assert_eq!(analysis.criteria_results[1].score, 6);
    }

    #[test]
    fn zero_usable_items_produce_zero_defaults() {
        let raw = json!({"criteria_results": []}).to_string();

        let (analysis, _) = parse_to_v2(&raw, &labels(&["Inhalt"]));
        let analysis = analysis.unwrap();

        assert_eq!(analysis.score, 0);
        assert_eq!(analysis.criteria_results.len(), 1);
        assert_eq!(analysis.criteria_results[0].criterion, "Inhalt");
        assert_eq!(analysis.criteria_results[0].max_score, 10);
        assert_eq!(analysis.criteria_results[0].score, 0);
        assert_eq!(analysis.criteria_results[0].explanation_md, NEUTRAL_EXPLANATION);
    }

    #[test]
    fn output_cardinality_always_matches_expected() {
        let too_many = json!({
            "criteria_results": [
                {"criterion": "A", "score": 1},
                {"criterion": "B", "score": 2},
                {"criterion": "C", "score": 3},
                {"criterion": "D", "score": 4},
                {"criterion": "E", "score": 5}
            ]
        })
        .to_string();
        let (analysis, _) = parse_to_v2(&too_many, &labels(&["A", "B"]));
        assert_eq!(analysis.unwrap().criteria_results.len(), 2);

        let too_few = json!({
            "criteria_results": [{"criterion": "A", "score": 1}]
        })
        .to_string();
        let (analysis, _) = parse_to_v2(&too_few, &labels(&["A", "B", "C"]));
        let analysis = analysis.unwrap();
        assert_eq!(analysis.criteria_results.len(), 3);
        assert_eq!(analysis.criteria_results[0].score, 1);
        assert_eq!(analysis.criteria_results[1].score, 0);
        assert_eq!(analysis.criteria_results[2].score, 0);
    }

    #[test]
    fn exact_label_matches_win_over_position() {
        let raw = json!({
            "criteria_results": [
                {"criterion": "Sprache", "score": 3},
                {"criterion": "Inhalt", "score": 7}
            ]
        })
        .to_string();

        let (analysis, _) = parse_to_v2(&raw, &labels(&["Inhalt"]));
        let analysis = analysis.unwrap();
        assert_eq!(analysis.criteria_results[0].criterion, "Inhalt");
        assert_eq!(analysis.criteria_results[0].score, 7);
    }

    #[test]
    fn unmatched_labels_consume_items_positionally() {
        let raw = json!({
            "criteria_results": [
                {"criterion": "Sprache", "score": 3},
                {"criterion": "Inhalt", "score": 7}
            ]
        })
        .to_string();

        let (analysis, _) = parse_to_v2(&raw, &labels(&["Aufbau", "Inhalt"]));
        let analysis = analysis.unwrap();
        assert_eq!(analysis.criteria_results[0].criterion, "Aufbau");
        assert_eq!(analysis.criteria_results[0].score, 3);
        assert_eq!(analysis.criteria_results[1].criterion, "Inhalt");
        assert_eq!(analysis.criteria_results[1].score, 7);
    }

    #[test]
    fn fewer_items_than_expected_never_relabel() {
        let raw = json!({
            "criteria_results": [{"criterion": "Etwas", "score": 5}]
        })
        .to_string();

        let (analysis, _) = parse_to_v2(&raw, &labels(&["Inhalt", "Aufbau"]));
        let analysis = analysis.unwrap();
        assert_eq!(analysis.criteria_results[0].score, 0);
        assert_eq!(analysis.criteria_results[1].score, 0);
    }

    #[test]
    fn scores_clamp_into_range_and_max_floors_at_zero() {
        let raw = json!({
            "criteria_results": [
                {"criterion": "A", "max_score": 10, "score": 25},
                {"criterion": "B", "max_score": 10, "score": -3},
                {"criterion": "C", "max_score": -5, "score": 4},
                {"name": "D", "max": 6, "score": "4"}
            ]
        })
        .to_string();

        let (analysis, _) = parse_to_v2(&raw, &labels(&["A", "B", "C", "D"]));
        let analysis = analysis.unwrap();
        assert_eq!(analysis.criteria_results[0].score, 10);
        assert_eq!(analysis.criteria_results[1].score, 0);
        assert_eq!(analysis.criteria_results[2].max_score, 0);
        assert_eq!(analysis.criteria_results[2].score, 0);
        assert_eq!(analysis.criteria_results[3].max_score, 6);
        assert_eq!(analysis.criteria_results[3].score, 4);
    }

    #[test]
    fn numeric_coercion_truncates_floats_and_strings() {
        let raw = json!({
            "criteria_results": [
                {"criterion": "A", "score": 7.9},
                {"criterion": "B", "score": "8.5"},
                {"criterion": "C", "score": " 6 "},
                {"criterion": "D", "score": {"nested": true}}
            ]
        })
        .to_string();

        let (analysis, _) = parse_to_v2(&raw, &labels(&["A", "B", "C", "D"]));
        let analysis = analysis.unwrap();
        assert_eq!(analysis.criteria_results[0].score, 7);
        assert_eq!(analysis.criteria_results[1].score, 8);
        assert_eq!(analysis.criteria_results[2].score, 6);
        assert_eq!(analysis.criteria_results[3].score, 0);
    }

    #[test]
    fn overall_score_prefers_model_value_clamped() {
        let raw = json!({
            "score": 9,
            "criteria_results": [{"criterion": "A", "max_score": 10, "score": 2}]
        })
        .to_string();
        let (analysis, _) = parse_to_v2(&raw, &labels(&["A"]));
        assert_eq!(analysis.unwrap().score, 5);
    }

    #[test]
    fn overall_score_falls_back_to_scaled_ratio() {
        let raw = json!({
            "criteria_results": [
                {"criterion": "A", "max_score": 10, "score": 8},
                {"criterion": "B", "max_score": 10, "score": 6}
            ]
        })
        .to_string();
        let (analysis, _) = parse_to_v2(&raw, &labels(&["A", "B"]));
        // (0.8 + 0.6) / 2 * 5 = 3.5, rounded half away from zero.
        assert_eq!(analysis.unwrap().score, 4);
    }

    #[test]
    fn feedback_aliases_skip_blank_values() {
        let raw = json!({
            "feedback_md": "   ",
            "feedback": "Gut gemacht!",
            "criteria_results": []
        })
        .to_string();
        let (_, feedback) = parse_to_v2(&raw, &labels(&["A"]));
        assert_eq!(feedback.as_deref(), Some("Gut gemacht!"));

        let raw = json!({"criteria_results": []}).to_string();
        let (_, feedback) = parse_to_v2(&raw, &labels(&["A"]));
        assert!(feedback.is_none());
    }

    #[test]
    fn criteria_alias_and_explanation_alias_are_accepted() {
        let raw = json!({
            "criteria": [
                {"name": "A", "max": 4, "score": 3, "explanation": "knapp"}
            ]
        })
        .to_string();

        let (analysis, _) = parse_to_v2(&raw, &labels(&["A"]));
        let analysis = analysis.unwrap();
        assert_eq!(analysis.criteria_results[0].max_score, 4);
        assert_eq!(analysis.criteria_results[0].score, 3);
        assert_eq!(analysis.criteria_results[0].explanation_md, "knapp");
    }

    #[test]
    fn blank_explanations_get_the_neutral_placeholder() {
        let raw = json!({
            "criteria_results": [{"criterion": "A", "score": 2, "explanation_md": "  "}]
        })
        .to_string();
        let (analysis, _) = parse_to_v2(&raw, &labels(&["A"]));
        assert_eq!(analysis.unwrap().criteria_results[0].explanation_md, NEUTRAL_EXPLANATION);
    }

    #[test]
    fn nameless_items_are_skipped() {
        let raw = json!({
            "criteria_results": [
                {"score": 9},
                {"criterion": "A", "score": 2}
            ]
        })
        .to_string();
        let (analysis, _) = parse_to_v2(&raw, &labels(&["A"]));
        let analysis = analysis.unwrap();
        assert_eq!(analysis.criteria_results[0].criterion, "A");
        assert_eq!(analysis.criteria_results[0].score, 2);
    }

    #[test]
    fn fenced_json_is_unwrapped_before_parsing() {
        let raw = "```json\n{\"score\": 3, \"criteria_results\": []}\n```";
        let (analysis, _) = parse_to_v2(raw, &labels(&["A"]));
        assert_eq!(analysis.unwrap().score, 3);
    }

    #[test]
    fn unparsable_payloads_return_neither_analysis_nor_feedback() {
        assert_eq!(parse_to_v2("definitely not json", &labels(&["A"])), (None, None));
        assert_eq!(parse_to_v2("[1, 2, 3]", &labels(&["A"])), (None, None));
        assert_eq!(parse_to_v2("\"just a string\"", &labels(&["A"])), (None, None));
    }

    #[test]
    fn default_analysis_is_schema_valid_and_all_zero() {
        let analysis = default_analysis(&labels(&["Inhalt", "Struktur"]));
        assert_eq!(analysis.schema, "criteria.v2");
        assert_eq!(analysis.score, 0);
        assert_eq!(analysis.criteria_results.len(), 2);
        assert!(analysis.criteria_results.iter().all(|result| result.score == 0));

        let value = serde_json::to_value(&analysis).unwrap();
        assert_eq!(value["schema"], "criteria.v2");
        assert!(value["criteria_results"].is_array());
    }
}
