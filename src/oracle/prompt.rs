use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

use super::client::OracleError;
use super::dto::{ChatMessage, OracleReply, ReplyVerdict};
use super::{OracleRequest, OracleVerdict};

const SYSTEM_PROMPT: &str = r#"You audit nutrition facts in a food catalog.
You receive one catalog entry, the consistency checks it failed, and the plausible per-100 g ranges for its category.
Decide whether the stored values are accurate for the named food and serving, or propose corrected per-serving values.

Answer with exactly one JSON object and nothing else:
{
  "verdict": "confirmed" | "corrected",
  "confidence": <integer 0-100, how sure you are>,
  "reasoning": "<one or two sentences>",
  "corrections": { "<field>": <number>, ... }
}

Rules:
- "corrections" is required for "corrected" and lists only the fields you change.
- Allowed fields: calories, protein_g, carbs_g, fat_g, fiber_g, sugar_g, alcohol_g, serving_grams, and "secondary" (an object of other nutrient names to numbers).
- Values are per serving, non-negative, in kcal or grams.
- Energy should be close to 4 kcal/g protein + 4 kcal/g carbohydrate + 9 kcal/g fat + 7 kcal/g alcohol."#;

/// Builds the chat messages for one consultation.
pub fn build_messages(request: &OracleRequest<'_>) -> Vec<ChatMessage> {
    let r = request.record;
    let payload = json!({
        "record": {
            "food_name": r.food_name,
            "brand": r.brand,
            "category": r.category,
            "serving_description": r.serving_description,
            "serving_grams": r.serving_mass(),
            "calories": r.nutrients.calories,
            "protein_g": r.nutrients.protein_g,
            "carbs_g": r.nutrients.carbs_g,
            "fat_g": r.nutrients.fat_g,
            "fiber_g": r.nutrients.fiber_g,
            "sugar_g": r.nutrients.sugar_g,
            "alcohol_g": r.nutrients.alcohol_g,
            "secondary": r.nutrients.secondary,
        },
        "failed_checks": request.issues.iter().map(|i| json!({
            "flag": i.flag(),
            "description": i.describe(),
            "details": i,
        })).collect::<Vec<_>>(),
        "category_ranges_per_100g": request.category_bounds,
    });

    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(payload.to_string()),
    ]
}

/// Pulls the JSON object out of a completion that may be wrapped in prose or a
/// code fence.
fn extract_json(content: &str) -> Option<&str> {
    lazy_static! {
        static ref FENCED_JSON: Regex = Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").unwrap();
    }
    if let Some(m) = FENCED_JSON.captures(content).and_then(|c| c.get(1)) {
        return Some(m.as_str());
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (start < end).then(|| &content[start..=end])
}

/// Turns completion text into a verdict. Anything not matching the schema is
/// an error, which callers downgrade to `Unavailable`.
pub fn parse_reply(content: &str) -> Result<OracleVerdict, OracleError> {
    let raw = extract_json(content)
        .ok_or_else(|| OracleError::Malformed("no JSON object in completion".into()))?;
    let reply: OracleReply =
        serde_json::from_str(raw).map_err(|e| OracleError::Malformed(e.to_string()))?;

    if !reply.confidence.is_finite() || !(0.0..=100.0).contains(&reply.confidence) {
        return Err(OracleError::Malformed(format!(
            "confidence {} outside 0-100",
            reply.confidence
        )));
    }

    let reasoning = reply
        .reasoning
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    match reply.verdict {
        ReplyVerdict::Confirmed => Ok(OracleVerdict::Confirmed {
            confidence: reply.confidence,
            reasoning,
        }),
        ReplyVerdict::Corrected => {
            let fields = reply.corrections.unwrap_or_default();
            if fields.is_empty() {
                return Err(OracleError::Malformed("corrected verdict without corrections".into()));
            }
            if let Some((name, v)) = fields
                .entries()
                .into_iter()
                .find(|(_, v)| !v.is_finite() || *v < 0.0)
            {
                return Err(OracleError::Malformed(format!("invalid corrected value {name}={v}")));
            }
            Ok(OracleVerdict::Corrected {
                fields,
                reasoning: reasoning.unwrap_or_default(),
                confidence: reply.confidence,
            })
        }
    }
}
