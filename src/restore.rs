// Bulk restore reducers for disaster recovery
// Accept JSON arrays exported from admin tooling (TypeScript SDK format).
// Every row is written through the storage-boundary policy checks, so a
// backup cannot regress a live score or rewrite an existing attempt.

use spacetimedb::{log, reducer, ReducerContext, Table, Timestamp};

use crate::policy::{self, Writer};
use crate::submission;
use crate::{best_score, user_profile};
use crate::{
    require_worker, Attempt, AttemptStatus, BestScore, LeaderboardEntry, ScoreSource, UserProfile,
};

use serde_json::Value;

/// Parse Timestamp from SDK JSON format: {"__timestamp_micros_since_unix_epoch__": "123456"}
fn parse_timestamp_json(val: &Value) -> Result<Timestamp, String> {
    let micros_str = val
        .get("__timestamp_micros_since_unix_epoch__")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp field")?;

    let micros: i64 = micros_str
        .parse()
        .map_err(|e| format!("Invalid timestamp micros: {}", e))?;

    Ok(Timestamp::from_micros_since_unix_epoch(micros))
}

fn parse_source(val: Option<&Value>) -> Result<ScoreSource, String> {
    match val.and_then(|v| v.as_str()) {
        Some("guest") => Ok(ScoreSource::Guest),
        Some("account") => Ok(ScoreSource::Account),
        _ => Err("Missing or invalid source".to_string()),
    }
}

fn parse_status(val: Option<&Value>) -> Result<AttemptStatus, String> {
    match val.and_then(|v| v.as_str()) {
        Some("accepted") => Ok(AttemptStatus::Accepted),
        Some("flagged") => Ok(AttemptStatus::Flagged),
        _ => Err("Missing or invalid status".to_string()),
    }
}

fn parse_string_array(val: Option<&Value>) -> Vec<String> {
    val.and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Bulk restore user_profile rows from a JSON array
/// Protected by the worker check; rows a policy check refuses are skipped
#[reducer]
pub fn bulk_restore_profiles(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    require_worker(ctx)?;

    let data: Value =
        serde_json::from_str(&json_data).map_err(|e| format!("Invalid JSON: {}", e))?;
    let profiles = data.as_array().ok_or("Expected JSON array of profiles")?;

    let mut restored = 0;
    let mut skipped = 0;
    for (i, p) in profiles.iter().enumerate() {
        let profile = UserProfile {
            id: p
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or(format!("Profile {}: missing id", i))?
                .to_string(),
            is_anonymous: p
                .get("isAnonymous")
                .and_then(|v| v.as_bool())
                .ok_or(format!("Profile {}: missing isAnonymous", i))?,
            created_at: parse_timestamp_json(
                p.get("createdAt")
                    .ok_or(format!("Profile {}: missing createdAt", i))?,
            )?,
            last_seen: parse_timestamp_json(
                p.get("lastSeen")
                    .ok_or(format!("Profile {}: missing lastSeen", i))?,
            )?,
            display_name: p
                .get("displayName")
                .and_then(|v| v.as_str())
                .unwrap_or("Player")
                .to_string(),
        };

        match policy::put_user_profile(ctx, &Writer::Worker, profile) {
            Ok(()) => restored += 1,
            Err(reason) => {
                log::warn!("[RESTORE] profile {} skipped: {}", i, reason);
                skipped += 1;
            }
        }
    }

    log::info!("[RESTORE] profiles restored:{} skipped:{}", restored, skipped);
    Ok(())
}

/// Bulk restore best_score rows from a JSON array.
/// updated_at is re-stamped with the transaction time - the policy layer
/// rejects caller-supplied server-time fields here like everywhere else,
/// and only strictly-improving values land over existing rows.
#[reducer]
pub fn bulk_restore_best_scores(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    require_worker(ctx)?;

    let data: Value =
        serde_json::from_str(&json_data).map_err(|e| format!("Invalid JSON: {}", e))?;
    let scores = data.as_array().ok_or("Expected JSON array of best scores")?;

    let mut restored = 0;
    let mut skipped = 0;
    for (i, s) in scores.iter().enumerate() {
        let player_id = s
            .get("playerId")
            .and_then(|v| v.as_str())
            .ok_or(format!("Score {}: missing playerId", i))?
            .to_string();
        let category_key = s
            .get("categoryKey")
            .and_then(|v| v.as_str())
            .ok_or(format!("Score {}: missing categoryKey", i))?
            .to_string();
        let difficulty = s
            .get("difficulty")
            .and_then(|v| v.as_str())
            .ok_or(format!("Score {}: missing difficulty", i))?
            .to_string();
        let scope = format!("{}_{}", category_key, difficulty);

        let row = BestScore {
            key: format!("{}/{}", player_id, scope),
            player_id,
            scope,
            category_key,
            difficulty,
            best_score: s
                .get("bestScore")
                .and_then(|v| v.as_u64())
                .ok_or(format!("Score {}: missing bestScore", i))? as u32,
            source: parse_source(s.get("source"))?,
            updated_at: ctx.timestamp,
        };

        match policy::put_best_score(ctx, &Writer::Worker, row) {
            Ok(()) => restored += 1,
            Err(reason) => {
                log::warn!("[RESTORE] best_score {} skipped: {}", i, reason);
                skipped += 1;
            }
        }
    }

    log::info!("[RESTORE] best_scores restored:{} skipped:{}", restored, skipped);
    Ok(())
}

/// Bulk restore attempt rows from a JSON array.
/// Historical createdAt stamps are kept; immutability still holds, so a
/// backup row whose key already exists is skipped, never rewritten.
#[reducer]
pub fn bulk_restore_attempts(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    require_worker(ctx)?;

    let data: Value =
        serde_json::from_str(&json_data).map_err(|e| format!("Invalid JSON: {}", e))?;
    let attempts = data.as_array().ok_or("Expected JSON array of attempts")?;

    let mut restored = 0;
    let mut skipped = 0;
    for (i, a) in attempts.iter().enumerate() {
        let player_id = a
            .get("playerId")
            .and_then(|v| v.as_str())
            .ok_or(format!("Attempt {}: missing playerId", i))?
            .to_string();
        let attempt_id = a
            .get("attemptId")
            .and_then(|v| v.as_str())
            .ok_or(format!("Attempt {}: missing attemptId", i))?
            .to_string();

        let row = Attempt {
            key: format!("{}/{}", player_id, attempt_id),
            player_id,
            attempt_id,
            category_key: a
                .get("categoryKey")
                .and_then(|v| v.as_str())
                .ok_or(format!("Attempt {}: missing categoryKey", i))?
                .to_string(),
            difficulty: a
                .get("difficulty")
                .and_then(|v| v.as_str())
                .ok_or(format!("Attempt {}: missing difficulty", i))?
                .to_string(),
            correct_count: a
                .get("correctCount")
                .and_then(|v| v.as_u64())
                .ok_or(format!("Attempt {}: missing correctCount", i))? as u32,
            total_questions: a
                .get("totalQuestions")
                .and_then(|v| v.as_u64())
                .ok_or(format!("Attempt {}: missing totalQuestions", i))? as u32,
            started_at: parse_timestamp_json(
                a.get("startedAt")
                    .ok_or(format!("Attempt {}: missing startedAt", i))?,
            )?,
            finished_at: parse_timestamp_json(
                a.get("finishedAt")
                    .ok_or(format!("Attempt {}: missing finishedAt", i))?,
            )?,
            duration_ms: a
                .get("durationMs")
                .and_then(|v| v.as_u64())
                .ok_or(format!("Attempt {}: missing durationMs", i))? as u32,
            status: parse_status(a.get("status"))?,
            source: parse_source(a.get("source"))?,
            risk_flags: parse_string_array(a.get("riskFlags")),
            client_version: a
                .get("clientVersion")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            created_at: parse_timestamp_json(
                a.get("createdAt")
                    .ok_or(format!("Attempt {}: missing createdAt", i))?,
            )?,
        };

        match policy::put_attempt(ctx, &Writer::Worker, row) {
            Ok(()) => restored += 1,
            Err(reason) => {
                log::warn!("[RESTORE] attempt {} skipped: {}", i, reason);
                skipped += 1;
            }
        }
    }

    log::info!("[RESTORE] attempts restored:{} skipped:{}", restored, skipped);
    Ok(())
}

/// Re-derive leaderboard entries from the best_score table after a restore.
/// Insert-or-improve only: the policy layer refuses regressions, so entries
/// already ahead of the restored scores are left untouched (and counted).
#[reducer]
pub fn rebuild_leaderboard_from_scores(ctx: &ReducerContext) -> Result<(), String> {
    require_worker(ctx)?;

    let mut applied = 0;
    let mut unchanged = 0;
    for score in ctx.db.best_score().iter() {
        let profile = ctx.db.user_profile().id().find(&score.player_id);
        let is_anonymous = profile.as_ref().map(|p| p.is_anonymous).unwrap_or(true);
        let display_name = match profile {
            Some(p) => p.display_name,
            None => submission::leaderboard_display_name(&score.player_id, true, None, None),
        };

        let entry = LeaderboardEntry {
            key: format!("{}/{}", score.scope, score.player_id),
            scope: score.scope.clone(),
            player_id: score.player_id.clone(),
            category_key: score.category_key.clone(),
            difficulty: score.difficulty.clone(),
            score: score.best_score,
            is_anonymous,
            display_name,
            updated_at: ctx.timestamp,
        };

        match policy::put_leaderboard_entry(ctx, &Writer::Worker, entry) {
            Ok(()) => applied += 1,
            Err(_) => unchanged += 1,
        }
    }

    log::info!(
        "[RESTORE] leaderboard rebuilt applied:{} unchanged:{}",
        applied,
        unchanged
    );
    Ok(())
}
