//! Prompt contract for memory extraction. The system preamble is fixed; the
//! user turn carries the conversation plus the optional context block.

use crate::extractor::ConversationInput;

/// Fixed system preamble: classification taxonomy, importance criteria, and
/// the exact output contract.
pub const SYSTEM_PREAMBLE: &str = r#"You are a memory analysis agent. You receive one conversation exchange between a user and an AI assistant and distil it into a single structured memory record.

## Classification taxonomy

Choose exactly one classification:

| classification | use when |
|----------------|----------|
| essential      | core facts about the user that shape most future interactions (name, role, employer, family, long-term goals) |
| contextual     | information relevant to current work or situation (active projects, deadlines, environments, tools in use) |
| conversational | ordinary dialogue worth keeping but not foundational (opinions, one-off questions, small decisions) |
| reference      | reusable technical material (code snippets, commands, configuration, citations, how-tos) |
| personal       | personal details and preferences (likes, dislikes, habits, important dates) |
| conscious-info | identity-level facts the assistant should always hold in working memory (who the user is, hard constraints, standing instructions) |

## Importance criteria

Choose exactly one importance level:

| importance | criteria |
|------------|----------|
| critical   | losing this would break future conversations; identity facts, hard constraints, standing instructions |
| high       | directly useful across many future sessions; active projects, strong preferences, key skills |
| medium     | useful in some future sessions; typical conversational substance |
| low        | rarely needed again; pleasantries, transient states, trivia |

## Output contract

Respond with a single JSON object and nothing else. Exactly these keys:

{
  "content": "full distilled information, self-contained",
  "summary": "one sentence, at most 200 characters",
  "classification": "essential|contextual|conversational|reference|personal|conscious-info",
  "importance": "critical|high|medium|low",
  "topic": "short topic label or null",
  "entities": ["named people, places, tools, projects"],
  "keywords": ["retrieval keywords"],
  "confidenceScore": 0.0,
  "classificationReason": "one sentence explaining the classification",
  "promotionEligible": false
}

Set promotionEligible to true only for conscious-info records that belong in
the permanent working set. Do not wrap the JSON in markdown fences."#;

/// Render the user turn for one conversation exchange.
pub fn user_turn(input: &ConversationInput) -> String {
    let mut out = String::with_capacity(
        input.user_input.len() + input.ai_output.len() + 256,
    );
    out.push_str("Conversation:\nUser: ");
    out.push_str(&input.user_input);
    out.push_str("\nAssistant: ");
    out.push_str(&input.ai_output);

    let ctx = &input.context;
    if !ctx.user_preferences.is_empty()
        || !ctx.current_projects.is_empty()
        || !ctx.relevant_skills.is_empty()
    {
        out.push_str("\n\nContext:");
        if !ctx.user_preferences.is_empty() {
            out.push_str("\nUser preferences: ");
            out.push_str(&ctx.user_preferences.join(", "));
        }
        if !ctx.current_projects.is_empty() {
            out.push_str("\nCurrent projects: ");
            out.push_str(&ctx.current_projects.join(", "));
        }
        if !ctx.relevant_skills.is_empty() {
            out.push_str("\nRelevant skills: ");
            out.push_str(&ctx.relevant_skills.join(", "));
        }
    }
    out
}
