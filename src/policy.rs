// Storage-boundary enforcement for score documents.
//
// Every write to user_profile / best_score / attempt / leaderboard_entry goes
// through the put_* helpers here, and the put_* helpers evaluate the check_*
// preconditions against the stored row before touching the table. The checks
// are pure and independent of the submission reducer: back-office reducers
// use the same helpers and get no shortcut, so a write the submission path
// would reject is rejected here too.

use spacetimedb::{ReducerContext, Table, Timestamp};

use crate::submission::expected_total_questions;
use crate::{attempt, best_score, leaderboard_entry, user_profile};
use crate::{Attempt, BestScore, LeaderboardEntry, UserProfile};

/// Who is performing a write at the storage boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Writer {
    /// A verified end-user session acting as this uid
    Owner(String),
    /// Back-office tooling authorized via the worker table
    Worker,
}

impl Writer {
    fn may_write_for(&self, uid: &str) -> bool {
        match self {
            Writer::Owner(own) => own == uid,
            Writer::Worker => true,
        }
    }
}

fn split_key(key: &str) -> Result<(&str, &str), String> {
    key.split_once('/').ok_or("document_key_malformed".to_string())
}

// ==================== PRECONDITIONS ====================

/// users/{uid}: owner-writable only, row id must equal the key
pub fn check_profile_write(
    writer: &Writer,
    key: &str,
    proposed: &UserProfile,
) -> Result<(), String> {
    if !writer.may_write_for(key) {
        return Err("profile_not_owner".to_string());
    }
    if proposed.id != key {
        return Err("profile_key_mismatch".to_string());
    }
    Ok(())
}

/// users/{uid}/scores/{scope}: owner-only, strictly improving, bounded by the
/// difficulty table, updatedAt stamped with the transaction time
pub fn check_best_score_write(
    writer: &Writer,
    key: &str,
    existing: Option<&BestScore>,
    proposed: &BestScore,
    now: Timestamp,
) -> Result<(), String> {
    let (uid, scope) = split_key(key)?;
    if !writer.may_write_for(uid) {
        return Err("best_score_not_owner".to_string());
    }
    if proposed.key != key || proposed.player_id != uid {
        return Err("best_score_key_mismatch".to_string());
    }
    if proposed.scope != scope
        || format!("{}_{}", proposed.category_key, proposed.difficulty) != scope
    {
        return Err("best_score_scope_mismatch".to_string());
    }
    let cap = expected_total_questions(&proposed.difficulty)
        .ok_or("best_score_unknown_difficulty".to_string())?;
    if proposed.best_score > cap {
        return Err("best_score_out_of_bounds".to_string());
    }
    if let Some(prev) = existing {
        if proposed.best_score <= prev.best_score {
            return Err("best_score_not_improved".to_string());
        }
    }
    if proposed.updated_at != now {
        return Err("best_score_client_timestamp".to_string());
    }
    Ok(())
}

/// leaderboard/{scope}/entries/{uid}: same shape as best_score writes,
/// keyed from the scope side
pub fn check_leaderboard_write(
    writer: &Writer,
    key: &str,
    existing: Option<&LeaderboardEntry>,
    proposed: &LeaderboardEntry,
    now: Timestamp,
) -> Result<(), String> {
    let (scope, uid) = split_key(key)?;
    if !writer.may_write_for(uid) {
        return Err("leaderboard_not_owner".to_string());
    }
    if proposed.key != key || proposed.player_id != uid {
        return Err("leaderboard_key_mismatch".to_string());
    }
    if proposed.scope != scope
        || format!("{}_{}", proposed.category_key, proposed.difficulty) != scope
    {
        return Err("leaderboard_scope_mismatch".to_string());
    }
    let cap = expected_total_questions(&proposed.difficulty)
        .ok_or("leaderboard_unknown_difficulty".to_string())?;
    if proposed.score > cap {
        return Err("leaderboard_score_out_of_bounds".to_string());
    }
    if let Some(prev) = existing {
        if proposed.score <= prev.score {
            return Err("leaderboard_score_not_improved".to_string());
        }
    }
    if proposed.updated_at != now {
        return Err("leaderboard_client_timestamp".to_string());
    }
    Ok(())
}

/// users/{uid}/attempts/{attemptId}: owner-only, immutable once created,
/// stored attemptId must equal the key, score bounded by the difficulty table
pub fn check_attempt_write(
    writer: &Writer,
    key: &str,
    existing: Option<&Attempt>,
    proposed: &Attempt,
) -> Result<(), String> {
    let (uid, attempt_id) = split_key(key)?;
    if !writer.may_write_for(uid) {
        return Err("attempt_not_owner".to_string());
    }
    if existing.is_some() {
        return Err("attempt_immutable".to_string());
    }
    if proposed.key != key || proposed.player_id != uid {
        return Err("attempt_key_mismatch".to_string());
    }
    if proposed.attempt_id != attempt_id {
        return Err("attempt_id_mismatch".to_string());
    }
    let expected = expected_total_questions(&proposed.difficulty)
        .ok_or("attempt_unknown_difficulty".to_string())?;
    if proposed.total_questions != expected {
        return Err("attempt_total_questions_mismatch".to_string());
    }
    if proposed.correct_count > proposed.total_questions {
        return Err("attempt_score_out_of_bounds".to_string());
    }
    if proposed.duration_ms == 0 {
        return Err("attempt_duration_not_positive".to_string());
    }
    Ok(())
}

// ==================== GUARDED WRITES ====================

pub fn put_user_profile(
    ctx: &ReducerContext,
    writer: &Writer,
    row: UserProfile,
) -> Result<(), String> {
    let key = row.id.clone();
    let existing = ctx.db.user_profile().id().find(&key);
    check_profile_write(writer, &key, &row)?;
    if existing.is_some() {
        ctx.db.user_profile().id().update(row);
    } else {
        ctx.db.user_profile().insert(row);
    }
    Ok(())
}

pub fn put_best_score(
    ctx: &ReducerContext,
    writer: &Writer,
    row: BestScore,
) -> Result<(), String> {
    let key = row.key.clone();
    let existing = ctx.db.best_score().key().find(&key);
    check_best_score_write(writer, &key, existing.as_ref(), &row, ctx.timestamp)?;
    if existing.is_some() {
        ctx.db.best_score().key().update(row);
    } else {
        ctx.db.best_score().insert(row);
    }
    Ok(())
}

pub fn put_leaderboard_entry(
    ctx: &ReducerContext,
    writer: &Writer,
    row: LeaderboardEntry,
) -> Result<(), String> {
    let key = row.key.clone();
    let existing = ctx.db.leaderboard_entry().key().find(&key);
    check_leaderboard_write(writer, &key, existing.as_ref(), &row, ctx.timestamp)?;
    if existing.is_some() {
        ctx.db.leaderboard_entry().key().update(row);
    } else {
        ctx.db.leaderboard_entry().insert(row);
    }
    Ok(())
}

/// Attempts only ever insert; an existing key fails the precondition
pub fn put_attempt(ctx: &ReducerContext, writer: &Writer, row: Attempt) -> Result<(), String> {
    let key = row.key.clone();
    let existing = ctx.db.attempt().key().find(&key);
    check_attempt_write(writer, &key, existing.as_ref(), &row)?;
    ctx.db.attempt().insert(row);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttemptStatus, ScoreSource};

    const NOW_MICROS: i64 = 1_700_000_000_000_000;

    fn now() -> Timestamp {
        Timestamp::from_micros_since_unix_epoch(NOW_MICROS)
    }

    fn owner(uid: &str) -> Writer {
        Writer::Owner(uid.to_string())
    }

    fn score_row(uid: &str, best: u32) -> BestScore {
        BestScore {
            key: format!("{}/flag_easy", uid),
            player_id: uid.to_string(),
            scope: "flag_easy".to_string(),
            category_key: "flag".to_string(),
            difficulty: "easy".to_string(),
            best_score: best,
            source: ScoreSource::Guest,
            updated_at: now(),
        }
    }

    fn entry_row(uid: &str, score: u32) -> LeaderboardEntry {
        LeaderboardEntry {
            key: format!("flag_easy/{}", uid),
            scope: "flag_easy".to_string(),
            player_id: uid.to_string(),
            category_key: "flag".to_string(),
            difficulty: "easy".to_string(),
            score,
            is_anonymous: true,
            display_name: format!("Guest-{}", &uid[..6.min(uid.len())]),
            updated_at: now(),
        }
    }

    fn attempt_row(uid: &str, attempt_id: &str, correct: u32) -> Attempt {
        Attempt {
            key: format!("{}/{}", uid, attempt_id),
            player_id: uid.to_string(),
            attempt_id: attempt_id.to_string(),
            category_key: "flag".to_string(),
            difficulty: "easy".to_string(),
            correct_count: correct,
            total_questions: 15,
            started_at: Timestamp::from_micros_since_unix_epoch(NOW_MICROS - 60_000_000),
            finished_at: now(),
            duration_ms: 60_000,
            status: AttemptStatus::Accepted,
            source: ScoreSource::Guest,
            risk_flags: vec![],
            client_version: None,
            created_at: now(),
        }
    }

    #[test]
    fn owner_can_write_own_profile_but_not_anothers() {
        let profile = UserProfile {
            id: "userA".to_string(),
            is_anonymous: true,
            created_at: now(),
            last_seen: now(),
            display_name: "Guest-userA".to_string(),
        };
        assert!(check_profile_write(&owner("userA"), "userA", &profile).is_ok());
        assert_eq!(
            check_profile_write(&owner("userB"), "userA", &profile),
            Err("profile_not_owner".to_string())
        );
    }

    #[test]
    fn score_writes_must_strictly_improve() {
        let prev = score_row("userA", 12);
        let key = "userA/flag_easy";

        assert_eq!(
            check_best_score_write(&owner("userA"), key, Some(&prev), &score_row("userA", 12), now()),
            Err("best_score_not_improved".to_string())
        );
        assert_eq!(
            check_best_score_write(&owner("userA"), key, Some(&prev), &score_row("userA", 11), now()),
            Err("best_score_not_improved".to_string())
        );
        assert!(
            check_best_score_write(&owner("userA"), key, Some(&prev), &score_row("userA", 13), now())
                .is_ok()
        );
        assert!(
            check_best_score_write(&owner("userA"), key, None, &score_row("userA", 1), now()).is_ok()
        );
    }

    #[test]
    fn score_writes_rejected_for_other_uid() {
        assert_eq!(
            check_best_score_write(
                &owner("userA"),
                "userB/flag_easy",
                None,
                &score_row("userB", 14),
                now()
            ),
            Err("best_score_not_owner".to_string())
        );
    }

    #[test]
    fn score_bounds_follow_difficulty_table() {
        assert_eq!(
            check_best_score_write(&owner("userA"), "userA/flag_easy", None, &score_row("userA", 99), now()),
            Err("best_score_out_of_bounds".to_string())
        );

        // 16 would overflow easy (15) but fits intermediate (30)
        let mut row = score_row("userA", 16);
        row.key = "userA/flag_intermediate".to_string();
        row.scope = "flag_intermediate".to_string();
        row.difficulty = "intermediate".to_string();
        assert!(check_best_score_write(
            &owner("userA"),
            "userA/flag_intermediate",
            None,
            &row,
            now()
        )
        .is_ok());
    }

    #[test]
    fn score_row_must_match_its_document_key() {
        // Row says flag_easy, key says capital_easy
        let row = score_row("userA", 10);
        assert_eq!(
            check_best_score_write(&owner("userA"), "userA/capital_easy", None, &row, now()),
            Err("best_score_key_mismatch".to_string())
        );

        let mut row = score_row("userA", 10);
        row.key = "userA/capital_easy".to_string();
        row.scope = "capital_easy".to_string();
        assert_eq!(
            check_best_score_write(&owner("userA"), "userA/capital_easy", None, &row, now()),
            Err("best_score_scope_mismatch".to_string())
        );
    }

    #[test]
    fn client_chosen_updated_at_is_rejected() {
        let mut row = score_row("userA", 14);
        row.updated_at = Timestamp::from_micros_since_unix_epoch(946_684_800_000_000);
        assert_eq!(
            check_best_score_write(&owner("userA"), "userA/flag_easy", None, &row, now()),
            Err("best_score_client_timestamp".to_string())
        );

        let mut entry = entry_row("userA", 14);
        entry.updated_at = Timestamp::from_micros_since_unix_epoch(946_684_800_000_000);
        assert_eq!(
            check_leaderboard_write(&owner("userA"), "flag_easy/userA", None, &entry, now()),
            Err("leaderboard_client_timestamp".to_string())
        );
    }

    #[test]
    fn leaderboard_writes_must_strictly_improve() {
        let prev = entry_row("userA", 12);
        let key = "flag_easy/userA";

        assert_eq!(
            check_leaderboard_write(&owner("userA"), key, Some(&prev), &entry_row("userA", 12), now()),
            Err("leaderboard_score_not_improved".to_string())
        );
        assert_eq!(
            check_leaderboard_write(&owner("userA"), key, Some(&prev), &entry_row("userA", 11), now()),
            Err("leaderboard_score_not_improved".to_string())
        );
        assert!(
            check_leaderboard_write(&owner("userA"), key, Some(&prev), &entry_row("userA", 13), now())
                .is_ok()
        );
    }

    #[test]
    fn leaderboard_writes_rejected_for_other_uid() {
        assert_eq!(
            check_leaderboard_write(
                &owner("userA"),
                "flag_easy/userB",
                None,
                &entry_row("userB", 14),
                now()
            ),
            Err("leaderboard_not_owner".to_string())
        );
    }

    #[test]
    fn attempts_are_immutable_once_created() {
        let first = attempt_row("userA", "attempt-1", 14);
        let key = "userA/attempt-1";
        assert!(check_attempt_write(&owner("userA"), key, None, &first).is_ok());

        let rewrite = attempt_row("userA", "attempt-1", 15);
        assert_eq!(
            check_attempt_write(&owner("userA"), key, Some(&first), &rewrite),
            Err("attempt_immutable".to_string())
        );
    }

    #[test]
    fn attempt_row_must_match_key_and_difficulty_table() {
        let mut row = attempt_row("userA", "attempt-1", 14);
        row.attempt_id = "different-id".to_string();
        assert_eq!(
            check_attempt_write(&owner("userA"), "userA/attempt-1", None, &row),
            Err("attempt_id_mismatch".to_string())
        );

        let mut row = attempt_row("userA", "attempt-1", 14);
        row.total_questions = 30;
        assert_eq!(
            check_attempt_write(&owner("userA"), "userA/attempt-1", None, &row),
            Err("attempt_total_questions_mismatch".to_string())
        );

        let mut row = attempt_row("userA", "attempt-1", 20);
        row.total_questions = 15;
        assert_eq!(
            check_attempt_write(&owner("userA"), "userA/attempt-1", None, &row),
            Err("attempt_score_out_of_bounds".to_string())
        );

        assert_eq!(
            check_attempt_write(
                &owner("userA"),
                "userB/attempt-1",
                None,
                &attempt_row("userB", "attempt-1", 14)
            ),
            Err("attempt_not_owner".to_string())
        );
    }

    #[test]
    fn worker_may_write_any_uid_but_invariants_still_hold() {
        let prev = score_row("userA", 12);
        assert!(check_best_score_write(
            &Writer::Worker,
            "userA/flag_easy",
            Some(&prev),
            &score_row("userA", 13),
            now()
        )
        .is_ok());

        // Even trusted tooling cannot regress a score or rewrite an attempt
        assert_eq!(
            check_best_score_write(
                &Writer::Worker,
                "userA/flag_easy",
                Some(&prev),
                &score_row("userA", 11),
                now()
            ),
            Err("best_score_not_improved".to_string())
        );
        let first = attempt_row("userA", "attempt-1", 14);
        assert_eq!(
            check_attempt_write(&Writer::Worker, "userA/attempt-1", Some(&first), &first),
            Err("attempt_immutable".to_string())
        );
    }
}
