// Payload validation, risk heuristics and the best-score decision.
// Everything here is pure: no table access, deterministic for a given input.

use chrono::DateTime;
use serde_json::Value;

// ==================== FIXED TABLES ====================

/// Category keys accepted for submissions
pub const ALLOWED_CATEGORIES: &[&str] = &["flag", "capital"];

/// Question count each difficulty tier must submit
pub fn expected_total_questions(difficulty: &str) -> Option<u32> {
    match difficulty {
        "easy" => Some(15),
        "intermediate" => Some(30),
        "expert" => Some(50),
        _ => None,
    }
}

pub const MAX_ATTEMPT_ID_CHARS: usize = 120;

pub const MIN_DURATION_MS: i64 = 5_000;
pub const MAX_DURATION_MS: i64 = 30 * 60_000;

pub const RATE_LIMIT_ATTEMPTS: usize = 20;
pub const RATE_LIMIT_WINDOW_MS: i64 = 10 * 60_000;

/// Perfect runs finished faster than this are flagged for review
pub const FAST_PERFECT_THRESHOLD_MS: i64 = 8_000;

pub const RISK_FAST_PERFECT: &str = "too_fast_perfect_score";

// Machine-readable rejection codes, one per validation check
pub const REJECT_INVALID_ATTEMPT_ID: &str = "invalid_attempt_id";
pub const REJECT_UNSUPPORTED_CATEGORY: &str = "unsupported_category";
pub const REJECT_UNSUPPORTED_DIFFICULTY: &str = "unsupported_difficulty";
pub const REJECT_INVALID_TOTAL_QUESTIONS: &str = "invalid_total_questions";
pub const REJECT_INVALID_SCORE_BOUNDS: &str = "invalid_score_bounds";
pub const REJECT_INVALID_TIMESTAMPS: &str = "invalid_timestamps";
pub const REJECT_INVALID_DURATION: &str = "invalid_duration";

pub const RATE_LIMITED_CODE: &str = "rate_limited";
pub const RATE_LIMITED_MESSAGE: &str = "Too many score submissions. Please wait and try again.";

// ==================== REQUEST TYPES ====================

/// A submission that passed every payload check
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRequest {
    pub attempt_id: String,
    pub category_key: String,
    pub difficulty: String,
    pub correct_count: u32,
    pub total_questions: u32,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub duration_ms: i64,
    pub client_version: Option<String>,
}

impl SubmissionRequest {
    /// Leaderboard/best-score bucket: "{categoryKey}_{difficulty}"
    pub fn scope(&self) -> String {
        format!("{}_{}", self.category_key, self.difficulty)
    }
}

/// A payload the validator refused, with the failing check's code
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub code: &'static str,
    pub message: String,
}

impl Rejection {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Rejection {
            code,
            message: message.into(),
        }
    }
}

// ==================== PAYLOAD PARSING ====================

fn field_str(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn field_int(payload: &Value, key: &str) -> Option<i64> {
    payload.get(key).and_then(|v| v.as_i64())
}

/// Client timestamps arrive as RFC 3339 strings or epoch milliseconds
fn parse_client_timestamp(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.timestamp_millis()),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        _ => None,
    }
}

/// Best-effort attemptId extraction for receipts on rejected payloads.
/// Trimmed and truncated so a hostile payload cannot bloat the receipt row.
pub fn attempt_id_hint(raw: &str) -> String {
    let payload: Value = serde_json::from_str(raw).unwrap_or(Value::Null);
    field_str(&payload, "attemptId")
        .chars()
        .take(MAX_ATTEMPT_ID_CHARS)
        .collect()
}

// ==================== VALIDATOR ====================

/// Normalize and validate a raw submission payload into a typed request.
///
/// Checks run in a fixed order and the first failure wins; an unparseable
/// payload is treated as an empty object, so it fails the first check.
pub fn validate_payload(raw: &str) -> Result<SubmissionRequest, Rejection> {
    let payload: Value = serde_json::from_str(raw).unwrap_or(Value::Null);

    let attempt_id = field_str(&payload, "attemptId");
    if attempt_id.is_empty() || attempt_id.chars().count() > MAX_ATTEMPT_ID_CHARS {
        return Err(Rejection::new(
            REJECT_INVALID_ATTEMPT_ID,
            "attemptId must be a non-empty string up to 120 chars.",
        ));
    }

    let category_key = field_str(&payload, "categoryKey");
    if !ALLOWED_CATEGORIES.contains(&category_key.as_str()) {
        return Err(Rejection::new(
            REJECT_UNSUPPORTED_CATEGORY,
            "Unsupported category key.",
        ));
    }

    let difficulty = field_str(&payload, "difficulty");
    let expected_total = match expected_total_questions(&difficulty) {
        Some(expected) => expected,
        None => {
            return Err(Rejection::new(
                REJECT_UNSUPPORTED_DIFFICULTY,
                "Unsupported difficulty.",
            ));
        }
    };

    if field_int(&payload, "totalQuestions") != Some(expected_total as i64) {
        return Err(Rejection::new(
            REJECT_INVALID_TOTAL_QUESTIONS,
            format!(
                "Expected totalQuestions={} for {}.",
                expected_total, difficulty
            ),
        ));
    }

    let correct_count = match field_int(&payload, "correctCount") {
        Some(count) if (0..=expected_total as i64).contains(&count) => count as u32,
        _ => {
            return Err(Rejection::new(
                REJECT_INVALID_SCORE_BOUNDS,
                "correctCount must be within 0..totalQuestions.",
            ));
        }
    };

    let started_at_ms = parse_client_timestamp(payload.get("startedAt"));
    let finished_at_ms = parse_client_timestamp(payload.get("finishedAt"));
    let (started_at_ms, finished_at_ms) = match (started_at_ms, finished_at_ms) {
        (Some(started), Some(finished)) => (started, finished),
        _ => {
            return Err(Rejection::new(
                REJECT_INVALID_TIMESTAMPS,
                "startedAt and finishedAt must be valid timestamps.",
            ));
        }
    };

    let duration_ms = finished_at_ms - started_at_ms;
    if duration_ms <= 0 {
        return Err(Rejection::new(
            REJECT_INVALID_TIMESTAMPS,
            "finishedAt must be greater than startedAt.",
        ));
    }

    if !(MIN_DURATION_MS..=MAX_DURATION_MS).contains(&duration_ms) {
        return Err(Rejection::new(
            REJECT_INVALID_DURATION,
            "Quiz duration is outside accepted bounds.",
        ));
    }

    let client_version = field_str(&payload, "clientVersion");
    let client_version = if client_version.is_empty() {
        None
    } else {
        Some(client_version)
    };

    Ok(SubmissionRequest {
        attempt_id,
        category_key,
        difficulty,
        correct_count,
        total_questions: expected_total,
        started_at_ms,
        finished_at_ms,
        duration_ms,
        client_version,
    })
}

// ==================== RISK HEURISTICS ====================

/// Non-blocking anti-abuse annotations for an attempt.
/// New heuristics append flags here without changing the accept/reject
/// contract; flags only downgrade the stored status to flagged.
pub fn risk_flags(correct_count: u32, total_questions: u32, duration_ms: i64) -> Vec<String> {
    let mut flags = Vec::new();

    if correct_count == total_questions && duration_ms < FAST_PERFECT_THRESHOLD_MS {
        flags.push(RISK_FAST_PERFECT.to_string());
    }

    flags
}

// ==================== BEST-SCORE DECISION ====================

/// Outcome of comparing an accepted attempt against the stored best
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestScoreDecision {
    pub updated: bool,
    pub new_best: u32,
}

/// Strict improvement only - a tie keeps the stored best untouched
pub fn decide_best_score(previous_best: Option<u32>, correct_count: u32) -> BestScoreDecision {
    let previous = previous_best.unwrap_or(0);
    if correct_count > previous {
        BestScoreDecision {
            updated: true,
            new_best: correct_count,
        }
    } else {
        BestScoreDecision {
            updated: false,
            new_best: previous,
        }
    }
}

// ==================== DISPLAY NAME ====================

/// Name shown on the leaderboard: profile name, then email local part,
/// then a guest tag, then a generic fallback
pub fn leaderboard_display_name(
    uid: &str,
    is_anonymous: bool,
    display_name: Option<&str>,
    email: Option<&str>,
) -> String {
    if let Some(name) = display_name.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    if let Some(local) = email
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .and_then(|e| e.split('@').next())
        .filter(|l| !l.is_empty())
    {
        return local.to_string();
    }

    if is_anonymous {
        return format!("Guest-{}", &uid[..6.min(uid.len())]);
    }

    "Player".to_string()
}
