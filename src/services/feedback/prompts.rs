//! Prompt assembly for the feedback model calls.
//!
//! Every free-text section is truncated to a fixed character budget before
//! embedding. Local inference backends reject oversized requests outright,
//! so losing tail content beats losing the whole call.

use serde_json::Value;

pub(crate) const TEACHER_INSTRUCTIONS_BUDGET: usize = 6000;
pub(crate) const HINTS_BUDGET: usize = 4000;
pub(crate) const STUDENT_TEXT_BUDGET: usize = 2000;

pub(crate) fn build_analysis_prompt(
    criteria: &[String],
    teacher_instructions: Option<&str>,
    hints: Option<&str>,
    text: &str,
) -> String {
    let mut prompt = String::from(
        "Du bist eine strenge, faire Lehrkraft. Bewerte die Abgabe ausschließlich \
         anhand der sichtbaren Belege im Text. Erfinde keine Inhalte hinzu, die \
         nicht in der Abgabe stehen.\n\n\
         Bewerte jedes Kriterium einzeln mit einer ganzen Punktzahl von 0 bis \
         max_score und begründe jede Bewertung kurz mit Belegen aus der Abgabe.\n\n\
         Antworte NUR mit JSON in genau diesem Format:\n\
         {\"score\": 0-5, \"criteria_results\": [{\"criterion\": \"...\", \
         \"max_score\": 10, \"score\": 0, \"explanation_md\": \"...\"}], \
         \"feedback_md\": \"...\"}\n\nKriterien:\n",
    );
    for criterion in criteria {
        prompt.push_str("- ");
        prompt.push_str(criterion);
        prompt.push('\n');
    }

    if let Some(instructions) = teacher_instructions.filter(|text| !text.trim().is_empty()) {
        prompt.push_str("\nAufgabenstellung:\n");
        prompt.push_str(&truncate_chars(instructions, TEACHER_INSTRUCTIONS_BUDGET));
        prompt.push('\n');
    }
    if let Some(hints) = hints.filter(|text| !text.trim().is_empty()) {
        prompt.push_str("\nLösungshinweise:\n");
        prompt.push_str(&truncate_chars(hints, HINTS_BUDGET));
        prompt.push('\n');
    }

    prompt.push_str("\nAbgabe:\n");
    prompt.push_str(&truncate_chars(text, STUDENT_TEXT_BUDGET));
    prompt
}

pub(crate) fn build_synthesis_prompt(analysis_json: &Value) -> String {
    format!(
        "Formuliere aus der folgenden Bewertung eine kurze persönliche Rückmeldung \
         an die Schülerin oder den Schüler.\n\n\
         Schreibe Fließtext in genau zwei Abschnitten mit den Überschriften \
         \"Was war gut?\" und \"Was kann verbessert werden?\". Keine Aufzählungen \
         und keine Listen. Zitiere keine Lösungshinweise wörtlich.\n\n\
         Bewertung:\n{analysis_json}"
    )
}

pub(crate) fn build_completion_prompt(criteria_count: usize, text: &str) -> String {
    format!(
        "Provide short formative feedback in Markdown and consider given criteria.\n\
         Criteria count: {criteria_count}.\n\n\
         Submission:\n{}",
        truncate_chars(text, STUDENT_TEXT_BUDGET)
    )
}

pub(crate) fn truncate_chars(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        text.to_string()
    } else {
        text.chars().take(budget).collect()
    }
}
