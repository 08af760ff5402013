use spacetimedb::{
    client_visibility_filter, reducer, table, view, Filter, Identity, ReducerContext, ScheduleAt,
    SpacetimeType, Table, Timestamp,
};

// Storage-boundary policy checks shared by every write path
mod policy;

// Bulk restore reducers for disaster recovery
mod restore;

// Pure validation / heuristics / best-score core
mod submission;

use policy::Writer;
use submission::{SubmissionRequest, RATE_LIMITED_CODE, RATE_LIMITED_MESSAGE};

// ==================== CONSTANTS ====================

/// Receipts are a response channel, not a ledger; rows older than this
/// are pruned by the scheduled cleaner.
const RECEIPT_TTL_MICROS: i64 = 60 * 60 * 1_000_000;

/// How often the receipt pruner runs (seconds)
const RECEIPT_PRUNE_INTERVAL_SECS: u64 = 300;

// ==================== HELPER FUNCTIONS ====================

/// Truncate a uid for log lines
fn short_uid(uid: &str) -> &str {
    &uid[..8.min(uid.len())]
}

/// Resolve the caller's verified session. Submissions without one are
/// rejected before any processing.
fn get_session(ctx: &ReducerContext) -> Result<Session, String> {
    ctx.db
        .session()
        .connection_id()
        .find(&ctx.sender)
        .ok_or("No verified session for caller".to_string())
}

/// Gateway/back-office authorization check
pub(crate) fn require_worker(ctx: &ReducerContext) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized worker call by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }
    Ok(())
}

/// Stored best for one owner and scope, 0 when no score document exists yet
fn current_best(ctx: &ReducerContext, uid: &str, scope: &str) -> u32 {
    ctx.db
        .best_score()
        .key()
        .find(&format!("{}/{}", uid, scope))
        .map(|row| row.best_score)
        .unwrap_or(0)
}

/// Attempts recorded for this owner inside the trailing rate-limit window.
/// Scans via the (player_id, created_at) index and stops at the quota, so
/// the check stays bounded regardless of history size.
fn attempts_in_window(ctx: &ReducerContext, uid: &str, now: Timestamp) -> usize {
    let window_start =
        now.to_micros_since_unix_epoch() - submission::RATE_LIMIT_WINDOW_MS * 1_000;
    ctx.db
        .attempt()
        .player_id()
        .filter(&uid.to_string())
        .filter(|a| a.created_at.to_micros_since_unix_epoch() >= window_start)
        .take(submission::RATE_LIMIT_ATTEMPTS)
        .count()
}

// ==================== TABLES ====================

/// Session links an ephemeral connection to a verified user identity.
/// PRIVATE: created by the gateway after identity verification; reducers
/// trust only this mapping, never payload-supplied identity.
#[table(name = session)]
pub struct Session {
    #[primary_key]
    pub connection_id: Identity,

    /// Stable opaque user id, verified by the gateway
    pub player_id: String,

    /// Guest (anonymous provider) vs registered account
    pub is_anonymous: bool,

    /// Display name from the identity provider, if any
    pub display_name: Option<String>,

    /// Email from the identity provider, if any
    pub email: Option<String>,

    /// When this session was created
    pub connected_at: Timestamp,
}

/// Owner profile, one row per uid (users/{uid})
/// PRIVATE: clients read their own row through the my_profile view
#[table(name = user_profile)]
pub struct UserProfile {
    #[primary_key]
    pub id: String,

    pub is_anonymous: bool,

    pub created_at: Timestamp,

    pub last_seen: Timestamp,

    pub display_name: String,
}

/// Per-owner best score, one row per (uid, scope) (users/{uid}/scores/{scope}).
/// best_score only ever increases; the policy layer rejects anything else.
#[table(name = best_score, public)]
pub struct BestScore {
    /// "{uid}/{scope}"
    #[primary_key]
    pub key: String,

    #[index(btree)]
    pub player_id: String,

    /// "{categoryKey}_{difficulty}"
    pub scope: String,

    pub category_key: String,

    pub difficulty: String,

    pub best_score: u32,

    pub source: ScoreSource,

    /// Transaction timestamp of the last improvement, server-assigned
    pub updated_at: Timestamp,
}

/// Immutable attempt record (users/{uid}/attempts/{attemptId}).
/// attemptId is the caller-supplied idempotency key; the row is created
/// exactly once and never updated or deleted by normal flow.
#[table(
    name = attempt,
    public,
    index(name = idx_owner_created, btree(columns = [player_id, created_at]))
)]
pub struct Attempt {
    /// "{uid}/{attemptId}"
    #[primary_key]
    pub key: String,

    #[index(btree)]
    pub player_id: String,

    pub attempt_id: String,

    pub category_key: String,

    pub difficulty: String,

    pub correct_count: u32,

    pub total_questions: u32,

    /// Client-reported quiz window (validated, not trusted for acceptance time)
    pub started_at: Timestamp,

    pub finished_at: Timestamp,

    pub duration_ms: u32,

    pub status: AttemptStatus,

    pub source: ScoreSource,

    /// Non-blocking anti-abuse annotations, preserved for review
    pub risk_flags: Vec<String>,

    pub client_version: Option<String>,

    /// Server acceptance time, assigned from the transaction timestamp
    #[index(btree)]
    pub created_at: Timestamp,
}

/// Published best score per owner and scope (leaderboard/{scope}/entries/{uid}).
/// Mirrors the owner's BestScore whenever it improves; never decreases.
#[table(name = leaderboard_entry, public)]
pub struct LeaderboardEntry {
    /// "{scope}/{uid}"
    #[primary_key]
    pub key: String,

    #[index(btree)]
    pub scope: String,

    pub player_id: String,

    pub category_key: String,

    pub difficulty: String,

    pub score: u32,

    pub is_anonymous: bool,

    pub display_name: String,

    pub updated_at: Timestamp,
}

/// Per-call outcome of submit_score - the caller-visible response.
/// PUBLIC with owner-only visibility; pruned after RECEIPT_TTL_MICROS.
#[table(name = submission_receipt, public)]
pub struct SubmissionReceipt {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub player_id: String,

    /// Echo of the request's attemptId (best-effort for rejected payloads)
    pub attempt_id: String,

    pub status: SubmissionStatus,

    pub best_score_updated: bool,

    pub new_best_score: Option<u32>,

    pub leaderboard_scope: Option<String>,

    pub rejection_code: Option<String>,

    pub risk_flags: Vec<String>,

    pub message: Option<String>,

    #[index(btree)]
    pub created_at: Timestamp,
}

/// Identities allowed to call gateway/back-office reducers
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

/// Schedule table for receipt pruning
#[table(name = receipt_prune_schedule, scheduled(prune_receipts))]
pub struct ReceiptPruneSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub scheduled_at: ScheduleAt,
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum AttemptStatus {
    Accepted,
    Flagged,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Accepted => "accepted",
            AttemptStatus::Flagged => "flagged",
        }
    }
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum ScoreSource {
    Guest,
    Account,
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum SubmissionStatus {
    Accepted,
    Flagged,
    Duplicate,
    Rejected,
    RateLimited,
}

impl SubmissionStatus {
    fn from_attempt(status: &AttemptStatus) -> Self {
        match status {
            AttemptStatus::Accepted => SubmissionStatus::Accepted,
            AttemptStatus::Flagged => SubmissionStatus::Flagged,
        }
    }
}

impl SubmissionReceipt {
    fn rejected(uid: &str, attempt_id: &str, code: &str, message: &str, now: Timestamp) -> Self {
        SubmissionReceipt {
            id: 0,
            player_id: uid.to_string(),
            attempt_id: attempt_id.to_string(),
            status: SubmissionStatus::Rejected,
            best_score_updated: false,
            new_best_score: None,
            leaderboard_scope: None,
            rejection_code: Some(code.to_string()),
            risk_flags: vec![],
            message: Some(message.to_string()),
            created_at: now,
        }
    }

    fn rate_limited(uid: &str, attempt_id: &str, now: Timestamp) -> Self {
        SubmissionReceipt {
            id: 0,
            player_id: uid.to_string(),
            attempt_id: attempt_id.to_string(),
            status: SubmissionStatus::RateLimited,
            best_score_updated: false,
            new_best_score: None,
            leaderboard_scope: None,
            rejection_code: Some(RATE_LIMITED_CODE.to_string()),
            risk_flags: vec![],
            message: Some(RATE_LIMITED_MESSAGE.to_string()),
            created_at: now,
        }
    }

    fn duplicate(uid: &str, attempt_id: &str, scope: &str, best: u32, now: Timestamp) -> Self {
        SubmissionReceipt {
            id: 0,
            player_id: uid.to_string(),
            attempt_id: attempt_id.to_string(),
            status: SubmissionStatus::Duplicate,
            best_score_updated: false,
            new_best_score: Some(best),
            leaderboard_scope: Some(scope.to_string()),
            rejection_code: None,
            risk_flags: vec![],
            message: None,
            created_at: now,
        }
    }

    fn recorded(
        uid: &str,
        attempt_id: &str,
        status: &AttemptStatus,
        best_score_updated: bool,
        new_best_score: u32,
        scope: &str,
        risk_flags: Vec<String>,
        now: Timestamp,
    ) -> Self {
        SubmissionReceipt {
            id: 0,
            player_id: uid.to_string(),
            attempt_id: attempt_id.to_string(),
            status: SubmissionStatus::from_attempt(status),
            best_score_updated,
            new_best_score: Some(new_best_score),
            leaderboard_scope: Some(scope.to_string()),
            rejection_code: None,
            risk_flags,
            message: None,
            created_at: now,
        }
    }
}

// ==================== VIEWS ====================

/// View: the caller's own profile row
#[view(name = my_profile, public)]
fn my_profile(ctx: &spacetimedb::ViewContext) -> Option<UserProfile> {
    let session = ctx.db.session().connection_id().find(ctx.sender)?;
    ctx.db.user_profile().id().find(&session.player_id)
}

// ==================== ROW LEVEL SECURITY ====================

/// RLS: owners see only their own score documents
#[client_visibility_filter]
const BEST_SCORE_VISIBILITY: Filter = Filter::Sql(
    "SELECT b.* FROM best_score b JOIN session s
     WHERE b.player_id = s.player_id AND s.connection_id = :sender",
);

/// RLS: owners see only their own attempt records
#[client_visibility_filter]
const ATTEMPT_VISIBILITY: Filter = Filter::Sql(
    "SELECT a.* FROM attempt a JOIN session s
     WHERE a.player_id = s.player_id AND s.connection_id = :sender",
);

/// RLS: owners see only their own submission receipts
#[client_visibility_filter]
const RECEIPT_VISIBILITY: Filter = Filter::Sql(
    "SELECT r.* FROM submission_receipt r JOIN session s
     WHERE r.player_id = s.player_id AND s.connection_id = :sender",
);

/// RLS: the leaderboard is readable by any verified session, but only
/// verified sessions - an unauthenticated connection sees nothing
#[client_visibility_filter]
const LEADERBOARD_VISIBILITY: Filter = Filter::Sql(
    "SELECT e.* FROM leaderboard_entry e JOIN session s
     WHERE s.connection_id = :sender",
);

// ==================== REDUCERS ====================

/// Create a verified session for a client identity.
/// Called by the gateway AFTER verifying the caller against the identity
/// provider; only authorized workers can call this. The gateway passes the
/// verified uid plus the provider's anonymous flag and optional profile
/// fields - clients never supply their own identity.
#[reducer]
pub fn create_session(
    ctx: &ReducerContext,
    client_identity: String,
    player_id: String,
    is_anonymous: bool,
    display_name: Option<String>,
    email: Option<String>,
) -> Result<(), String> {
    require_worker(ctx)?;

    let identity = Identity::from_hex(&client_identity)
        .map_err(|_| "Invalid identity hex string".to_string())?;

    // Delete stale sessions: same player (unclean reconnect) OR same
    // connection_id (prevents PK conflict)
    let stale_sessions: Vec<_> = ctx
        .db
        .session()
        .iter()
        .filter(|s| s.player_id == player_id || s.connection_id == identity)
        .map(|s| s.connection_id)
        .collect();
    for conn_id in stale_sessions {
        ctx.db.session().connection_id().delete(&conn_id);
    }

    ctx.db.session().insert(Session {
        connection_id: identity,
        player_id: player_id.clone(),
        is_anonymous,
        display_name,
        email,
        connected_at: ctx.timestamp,
    });

    log::info!(
        "[SESSION] created player:{} anon:{}",
        short_uid(&player_id),
        is_anonymous
    );
    Ok(())
}

/// Caller announces itself on a verified session; creates or refreshes the
/// owner profile with server-assigned timestamps.
#[reducer]
pub fn connect(ctx: &ReducerContext) -> Result<(), String> {
    let session = get_session(ctx)?;
    let uid = session.player_id.clone();
    let display_name = submission::leaderboard_display_name(
        &uid,
        session.is_anonymous,
        session.display_name.as_deref(),
        session.email.as_deref(),
    );

    let row = match ctx.db.user_profile().id().find(&uid) {
        Some(existing) => UserProfile {
            is_anonymous: session.is_anonymous,
            last_seen: ctx.timestamp,
            display_name,
            ..existing
        },
        None => UserProfile {
            id: uid.clone(),
            is_anonymous: session.is_anonymous,
            created_at: ctx.timestamp,
            last_seen: ctx.timestamp,
            display_name,
        },
    };
    policy::put_user_profile(ctx, &Writer::Owner(uid.clone()), row)?;

    log::info!("[CONNECT] player:{}", short_uid(&uid));
    Ok(())
}

#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    if let Some(session) = ctx.db.session().connection_id().find(&ctx.sender) {
        let session_secs = ctx
            .timestamp
            .duration_since(session.connected_at)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        log::info!(
            "[DISCONNECT] player:{} session_min:{:.1}",
            short_uid(&session.player_id),
            session_secs as f32 / 60.0
        );
        // Delete session (ephemeral connection mapping)
        ctx.db.session().connection_id().delete(&ctx.sender);
    }
}

/// Record one quiz attempt and republish the owner's best score.
///
/// The reducer body is one serializable transaction: the attempt record,
/// the best-score document and the leaderboard entry commit together or
/// not at all, and concurrent submissions for the same owner serialize
/// through the store's conflict retry. The payload is the raw JSON
/// submission; identity comes from the caller's verified session only.
/// Every call leaves exactly one receipt row for the caller.
#[reducer]
pub fn submit_score(ctx: &ReducerContext, payload: String) -> Result<(), String> {
    let session = get_session(ctx)?;
    let uid = session.player_id.clone();

    let request = match submission::validate_payload(&payload) {
        Ok(request) => request,
        Err(rejection) => {
            log::warn!(
                "[SUBMIT] rejected player:{} code:{}",
                short_uid(&uid),
                rejection.code
            );
            ctx.db.submission_receipt().insert(SubmissionReceipt::rejected(
                &uid,
                &submission::attempt_id_hint(&payload),
                rejection.code,
                &rejection.message,
                ctx.timestamp,
            ));
            return Ok(());
        }
    };

    let scope = request.scope();
    let attempt_key = format!("{}/{}", uid, request.attempt_id);

    // Idempotency: a stored attempt key means this submission already
    // committed. Report the stored best, write nothing. The lookup and any
    // later writes share one transaction, so a concurrent retry of the
    // same attemptId serializes against the creating call.
    if ctx.db.attempt().key().find(&attempt_key).is_some() {
        let best = current_best(ctx, &uid, &scope);
        ctx.db.submission_receipt().insert(SubmissionReceipt::duplicate(
            &uid,
            &request.attempt_id,
            &scope,
            best,
            ctx.timestamp,
        ));
        log::info!(
            "[SUBMIT] duplicate player:{} attempt:{}",
            short_uid(&uid),
            request.attempt_id
        );
        return Ok(());
    }

    // Sliding-window quota, checked only after duplicate detection so
    // retries of an already-accepted attempt never count against it
    if attempts_in_window(ctx, &uid, ctx.timestamp) >= submission::RATE_LIMIT_ATTEMPTS {
        ctx.db.submission_receipt().insert(SubmissionReceipt::rate_limited(
            &uid,
            &request.attempt_id,
            ctx.timestamp,
        ));
        log::warn!("[SUBMIT] rate_limited player:{}", short_uid(&uid));
        return Ok(());
    }

    let risk_flags = submission::risk_flags(
        request.correct_count,
        request.total_questions,
        request.duration_ms,
    );
    let status = if risk_flags.is_empty() {
        AttemptStatus::Accepted
    } else {
        AttemptStatus::Flagged
    };
    let source = if session.is_anonymous {
        ScoreSource::Guest
    } else {
        ScoreSource::Account
    };
    let writer = Writer::Owner(uid.clone());

    record_attempt(ctx, &writer, &session, &request, &status, &source, &risk_flags)?;

    let previous_best = ctx
        .db
        .best_score()
        .key()
        .find(&format!("{}/{}", uid, scope))
        .map(|row| row.best_score);
    let decision = submission::decide_best_score(previous_best, request.correct_count);

    if decision.updated {
        policy::put_best_score(
            ctx,
            &writer,
            BestScore {
                key: format!("{}/{}", uid, scope),
                player_id: uid.clone(),
                scope: scope.clone(),
                category_key: request.category_key.clone(),
                difficulty: request.difficulty.clone(),
                best_score: request.correct_count,
                source: source.clone(),
                updated_at: ctx.timestamp,
            },
        )?;

        let display_name = submission::leaderboard_display_name(
            &uid,
            session.is_anonymous,
            session.display_name.as_deref(),
            session.email.as_deref(),
        );
        policy::put_leaderboard_entry(
            ctx,
            &writer,
            LeaderboardEntry {
                key: format!("{}/{}", scope, uid),
                scope: scope.clone(),
                player_id: uid.clone(),
                category_key: request.category_key.clone(),
                difficulty: request.difficulty.clone(),
                score: request.correct_count,
                is_anonymous: session.is_anonymous,
                display_name,
                updated_at: ctx.timestamp,
            },
        )?;
    }

    ctx.db.submission_receipt().insert(SubmissionReceipt::recorded(
        &uid,
        &request.attempt_id,
        &status,
        decision.updated,
        decision.new_best,
        &scope,
        risk_flags,
        ctx.timestamp,
    ));

    log::info!(
        "[SUBMIT] {} player:{} scope:{} score:{}/{} best_updated:{}",
        status.as_str(),
        short_uid(&uid),
        scope,
        request.correct_count,
        request.total_questions,
        decision.updated
    );
    Ok(())
}

/// Create the immutable attempt record with server-assigned acceptance time
fn record_attempt(
    ctx: &ReducerContext,
    writer: &Writer,
    session: &Session,
    request: &SubmissionRequest,
    status: &AttemptStatus,
    source: &ScoreSource,
    risk_flags: &[String],
) -> Result<(), String> {
    policy::put_attempt(
        ctx,
        writer,
        Attempt {
            key: format!("{}/{}", session.player_id, request.attempt_id),
            player_id: session.player_id.clone(),
            attempt_id: request.attempt_id.clone(),
            category_key: request.category_key.clone(),
            difficulty: request.difficulty.clone(),
            correct_count: request.correct_count,
            total_questions: request.total_questions,
            started_at: Timestamp::from_micros_since_unix_epoch(request.started_at_ms * 1_000),
            finished_at: Timestamp::from_micros_since_unix_epoch(request.finished_at_ms * 1_000),
            duration_ms: request.duration_ms as u32,
            status: status.clone(),
            source: source.clone(),
            risk_flags: risk_flags.to_vec(),
            client_version: request.client_version.clone(),
            created_at: ctx.timestamp,
        },
    )
}

/// Drop receipt rows past their retention window (scheduled)
#[reducer]
pub fn prune_receipts(ctx: &ReducerContext, _schedule: ReceiptPruneSchedule) {
    // Only allow scheduler to call this, not clients
    if ctx.sender != ctx.identity() {
        log::warn!("Client {} attempted to call prune_receipts", ctx.sender);
        return;
    }

    let cutoff = ctx.timestamp.to_micros_since_unix_epoch() - RECEIPT_TTL_MICROS;
    let stale: Vec<u64> = ctx
        .db
        .submission_receipt()
        .iter()
        .filter(|r| r.created_at.to_micros_since_unix_epoch() < cutoff)
        .map(|r| r.id)
        .collect();
    let count = stale.len();
    for id in stale {
        ctx.db.submission_receipt().id().delete(&id);
    }
    if count > 0 {
        log::info!("[PRUNE] receipts removed:{}", count);
    }
}

/// Initialize module - seed worker auth and start the receipt pruner
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner identity
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
        });
    }

    // Check if the scheduler already exists to avoid duplicates on hot-reload
    if ctx.db.receipt_prune_schedule().iter().count() == 0 {
        ctx.db.receipt_prune_schedule().insert(ReceiptPruneSchedule {
            id: 0, // auto_inc will handle this
            scheduled_at: ScheduleAt::Interval(
                std::time::Duration::from_secs(RECEIPT_PRUNE_INTERVAL_SECS).into(),
            ),
        });
    }

    log::info!("Quiznetic score module initialized");
}
