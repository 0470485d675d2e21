//! The SQLite state store.
//!
//! Owns all persisted entities: sessions, requests, reviews, and
//! attachments. Writes serialize through a single mutex-guarded connection,
//! and every status movement goes through [`Store::update_status`], which
//! applies the state machine inside the lock — observers can never see a
//! backward move or a half-applied transition.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use slb_core::statemachine::{self, TransitionError};
use slb_core::types::{
    Attachment, AttachmentType, CommandSpec, Decision, Justification, Request, RequestStatus,
    Review, RiskTier, Session,
};
use tracing::{debug, info};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No session with the given id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// No request with the given id.
    #[error("request not found: {0}")]
    RequestNotFound(String),

    /// The reviewer already has a review row for this request.
    #[error("session {session_id} has already reviewed request {request_id}")]
    AlreadyReviewed {
        /// The request in question.
        request_id: String,
        /// The offending reviewer session.
        session_id: String,
    },

    /// The requested status movement is not a legal lifecycle edge.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// A stored value did not parse back into its domain type.
    #[error("corrupt row: {context}")]
    Corrupt {
        /// What failed to parse.
        context: String,
    },

    /// The underlying database failed.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Handle to the state store. Cheap to clone; all clones share one
/// serialized connection.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        debug!(path = %path.display(), "opened state store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id            TEXT PRIMARY KEY,
                agent_name    TEXT NOT NULL,
                program       TEXT NOT NULL,
                model         TEXT NOT NULL,
                project_path  TEXT NOT NULL,
                active        INTEGER NOT NULL DEFAULT 1,
                session_key   TEXT NOT NULL,
                created_at    TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS requests (
                id                       TEXT PRIMARY KEY,
                requestor_session_id     TEXT NOT NULL,
                requestor_agent          TEXT NOT NULL,
                requestor_model          TEXT NOT NULL,
                command_json             TEXT NOT NULL,
                command_hash             TEXT NOT NULL,
                risk_tier                TEXT NOT NULL,
                status                   TEXT NOT NULL,
                min_approvals            INTEGER NOT NULL,
                require_different_model  INTEGER NOT NULL,
                project_path             TEXT NOT NULL,
                justification_json       TEXT NOT NULL,
                created_at               TEXT NOT NULL,
                approval_expires_at      TEXT,
                resolved_at              TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_requests_status
                ON requests(status);
            CREATE INDEX IF NOT EXISTS idx_requests_project
                ON requests(project_path);
            CREATE TABLE IF NOT EXISTS reviews (
                id                   TEXT PRIMARY KEY,
                request_id           TEXT NOT NULL,
                reviewer_session_id  TEXT NOT NULL,
                reviewer_agent       TEXT NOT NULL,
                reviewer_model       TEXT NOT NULL,
                decision             TEXT NOT NULL,
                signature            TEXT NOT NULL,
                signature_timestamp  TEXT NOT NULL,
                responses_json       TEXT NOT NULL,
                comments             TEXT NOT NULL,
                created_at           TEXT NOT NULL,
                UNIQUE(request_id, reviewer_session_id)
            );
            CREATE INDEX IF NOT EXISTS idx_reviews_request
                ON reviews(request_id);
            CREATE TABLE IF NOT EXISTS attachments (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id    TEXT NOT NULL,
                kind          TEXT NOT NULL,
                content       TEXT NOT NULL,
                metadata_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_request
                ON attachments(request_id);",
        )
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Persist a new session.
    pub fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions
                (id, agent_name, program, model, project_path, active, session_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.id,
                session.agent_name,
                session.program,
                session.model,
                session.project_path,
                i64::from(session.active),
                session.session_key,
                session.created_at.to_rfc3339(),
            ],
        )?;
        info!(session_id = %session.id, agent = %session.agent_name, "created session");
        Ok(())
    }

    /// Fetch a session by id.
    pub fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, agent_name, program, model, project_path, active, session_key, created_at
             FROM sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// Mark a session inactive. Inactive sessions can neither request nor
    /// review.
    pub fn deactivate_session(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute("UPDATE sessions SET active = 0 WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// All active sessions for a project.
    pub fn list_active_sessions(&self, project_path: &str) -> Result<Vec<Session>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_name, program, model, project_path, active, session_key, created_at
             FROM sessions WHERE project_path = ?1 AND active = 1 ORDER BY created_at",
        )?;
        let sessions = stmt
            .query_map(params![project_path], row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Deactivate sessions created more than `ttl` ago. Returns how many
    /// were deactivated. A non-positive TTL is a no-op.
    pub fn deactivate_stale_sessions(&self, ttl: Duration) -> Result<u32, StoreError> {
        if ttl <= Duration::zero() {
            return Ok(0);
        }
        let cutoff = Utc::now() - ttl;
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET active = 0 WHERE active = 1 AND created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(u32::try_from(changed).unwrap_or(u32::MAX))
    }

    /// Count of active sessions in a project, for dynamic quorum.
    pub fn count_active_sessions(&self, project_path: &str) -> Result<u32, StoreError> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE project_path = ?1 AND active = 1",
            params![project_path],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Persist a new request (already in `pending`).
    pub fn create_request(&self, request: &Request) -> Result<(), StoreError> {
        let command_json = serde_json::to_string(&request.command)
            .map_err(|e| corrupt(format!("serializing command spec: {e}")))?;
        let justification_json = serde_json::to_string(&request.justification)
            .map_err(|e| corrupt(format!("serializing justification: {e}")))?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO requests
                (id, requestor_session_id, requestor_agent, requestor_model, command_json,
                 command_hash, risk_tier, status, min_approvals, require_different_model,
                 project_path, justification_json, created_at, approval_expires_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                request.id,
                request.requestor_session_id,
                request.requestor_agent,
                request.requestor_model,
                command_json,
                request.command_hash,
                request.risk_tier.as_str(),
                request.status.as_str(),
                request.min_approvals,
                i64::from(request.require_different_model),
                request.project_path,
                justification_json,
                request.created_at.to_rfc3339(),
                request.approval_expires_at.map(|t| t.to_rfc3339()),
                request.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        info!(request_id = %request.id, tier = %request.risk_tier, "created request");
        Ok(())
    }

    /// Persist a request together with its attachments in one transaction,
    /// so a failed attachment insert leaves no request row behind.
    pub fn create_request_with_attachments(
        &self,
        request: &Request,
        attachments: &[Attachment],
    ) -> Result<(), StoreError> {
        let command_json = serde_json::to_string(&request.command)
            .map_err(|e| corrupt(format!("serializing command spec: {e}")))?;
        let justification_json = serde_json::to_string(&request.justification)
            .map_err(|e| corrupt(format!("serializing justification: {e}")))?;
        let attachment_rows = attachments
            .iter()
            .map(|a| {
                Ok((
                    a.kind.as_str(),
                    a.content.as_str(),
                    serde_json::to_string(&a.metadata)
                        .map_err(|e| corrupt(format!("serializing attachment metadata: {e}")))?,
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO requests
                (id, requestor_session_id, requestor_agent, requestor_model, command_json,
                 command_hash, risk_tier, status, min_approvals, require_different_model,
                 project_path, justification_json, created_at, approval_expires_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                request.id,
                request.requestor_session_id,
                request.requestor_agent,
                request.requestor_model,
                command_json,
                request.command_hash,
                request.risk_tier.as_str(),
                request.status.as_str(),
                request.min_approvals,
                i64::from(request.require_different_model),
                request.project_path,
                justification_json,
                request.created_at.to_rfc3339(),
                request.approval_expires_at.map(|t| t.to_rfc3339()),
                request.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        for (kind, content, metadata_json) in &attachment_rows {
            tx.execute(
                "INSERT INTO attachments (request_id, kind, content, metadata_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![request.id, kind, content, metadata_json],
            )?;
        }
        tx.commit()?;
        info!(
            request_id = %request.id,
            tier = %request.risk_tier,
            attachments = attachment_rows.len(),
            "created request"
        );
        Ok(())
    }

    /// Fetch a request by id.
    pub fn get_request(&self, id: &str) -> Result<Request, StoreError> {
        let conn = self.lock();
        Self::get_request_locked(&conn, id)
    }

    fn get_request_locked(conn: &Connection, id: &str) -> Result<Request, StoreError> {
        let row = conn
            .query_row(
                "SELECT id, requestor_session_id, requestor_agent, requestor_model, command_json,
                        command_hash, risk_tier, status, min_approvals, require_different_model,
                        project_path, justification_json, created_at, approval_expires_at,
                        resolved_at
                 FROM requests WHERE id = ?1",
                params![id],
                row_to_raw_request,
            )
            .optional()?
            .ok_or_else(|| StoreError::RequestNotFound(id.to_string()))?;
        raw_to_request(row)
    }

    /// Requests for a project (newest first). `None` lists every project.
    pub fn list_requests(
        &self,
        project_path: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Request>, StoreError> {
        let conn = self.lock();
        let (sql, filter) = match project_path {
            Some(p) => (
                "SELECT id, requestor_session_id, requestor_agent, requestor_model, command_json,
                        command_hash, risk_tier, status, min_approvals, require_different_model,
                        project_path, justification_json, created_at, approval_expires_at,
                        resolved_at
                 FROM requests WHERE project_path = ?1 ORDER BY created_at DESC LIMIT ?2",
                Some(p),
            ),
            None => (
                "SELECT id, requestor_session_id, requestor_agent, requestor_model, command_json,
                        command_hash, risk_tier, status, min_approvals, require_different_model,
                        project_path, justification_json, created_at, approval_expires_at,
                        resolved_at
                 FROM requests WHERE ?1 IS NULL ORDER BY created_at DESC LIMIT ?2",
                None,
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![filter, limit], row_to_raw_request)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(raw_to_request).collect()
    }

    /// All requests the watch poller should consider: pending requests plus
    /// anything that changed status recently enough to still matter.
    pub fn list_watchable_requests(
        &self,
        project_path: Option<&str>,
        newer_than: DateTime<Utc>,
    ) -> Result<Vec<Request>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, requestor_session_id, requestor_agent, requestor_model, command_json,
                    command_hash, risk_tier, status, min_approvals, require_different_model,
                    project_path, justification_json, created_at, approval_expires_at, resolved_at
             FROM requests
             WHERE (?1 IS NULL OR project_path = ?1) AND created_at >= ?2
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(
                params![project_path, newer_than.to_rfc3339()],
                row_to_raw_request,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(raw_to_request).collect()
    }

    /// Apply a status transition atomically and return the updated request.
    ///
    /// The state machine runs inside the connection lock, so concurrent
    /// writers serialize and an illegal edge leaves the row untouched.
    pub fn update_status(&self, id: &str, to: RequestStatus) -> Result<Request, StoreError> {
        let conn = self.lock();
        let mut request = Self::get_request_locked(&conn, id)?;
        statemachine::transition(&mut request, to)?;
        conn.execute(
            "UPDATE requests
             SET status = ?2, approval_expires_at = ?3, resolved_at = ?4
             WHERE id = ?1",
            params![
                request.id,
                request.status.as_str(),
                request.approval_expires_at.map(|t| t.to_rfc3339()),
                request.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        info!(request_id = %id, status = %to, "request status updated");
        Ok(request)
    }

    /// Move pending requests whose age exceeds `timeout` into `timeout`.
    /// Returns the ids that moved.
    pub fn expire_stale_requests(&self, timeout: Duration) -> Result<Vec<String>, StoreError> {
        let cutoff = Utc::now() - timeout;
        let stale: Vec<String> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT id FROM requests WHERE status = 'pending' AND created_at < ?1",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        for id in &stale {
            self.update_status(id, RequestStatus::Timeout)?;
        }
        Ok(stale)
    }

    // ------------------------------------------------------------------
    // Reviews
    // ------------------------------------------------------------------

    /// Persist a review. A second review from the same session for the
    /// same request maps the UNIQUE violation to
    /// [`StoreError::AlreadyReviewed`] and writes nothing.
    pub fn create_review(&self, review: &Review) -> Result<(), StoreError> {
        let responses_json = serde_json::to_string(&review.responses)
            .map_err(|e| corrupt(format!("serializing review responses: {e}")))?;
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO reviews
                (id, request_id, reviewer_session_id, reviewer_agent, reviewer_model, decision,
                 signature, signature_timestamp, responses_json, comments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                review.id,
                review.request_id,
                review.reviewer_session_id,
                review.reviewer_agent,
                review.reviewer_model,
                review.decision.as_str(),
                review.signature,
                review.signature_timestamp.to_rfc3339(),
                responses_json,
                review.comments,
                review.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyReviewed {
                    request_id: review.request_id.clone(),
                    session_id: review.reviewer_session_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether this session already reviewed this request.
    pub fn has_reviewed(&self, request_id: &str, session_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM reviews WHERE request_id = ?1 AND reviewer_session_id = ?2",
            params![request_id, session_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All reviews for a request, oldest first.
    pub fn list_reviews(&self, request_id: &str) -> Result<Vec<Review>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, request_id, reviewer_session_id, reviewer_agent, reviewer_model, decision,
                    signature, signature_timestamp, responses_json, comments, created_at
             FROM reviews WHERE request_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![request_id], row_to_raw_review)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(raw_to_review).collect()
    }

    /// `(approvals, rejections)` counts for a request.
    pub fn count_reviews_by_decision(&self, request_id: &str) -> Result<(u32, u32), StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT decision, COUNT(*) FROM reviews WHERE request_id = ?1 GROUP BY decision",
        )?;
        let mut approvals = 0;
        let mut rejections = 0;
        let rows = stmt.query_map(params![request_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        for row in rows {
            let (decision, count) = row?;
            match decision.as_str() {
                "approve" => approvals = count,
                "reject" => rejections = count,
                _ => return Err(corrupt(format!("unknown decision {decision:?}"))),
            }
        }
        Ok((approvals, rejections))
    }

    // ------------------------------------------------------------------
    // Rate-limit counters
    // ------------------------------------------------------------------

    /// How many requests this session currently has pending.
    pub fn count_pending_for_session(&self, session_id: &str) -> Result<u32, StoreError> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM requests
             WHERE requestor_session_id = ?1 AND status = 'pending'",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// How many requests this session created since `since`.
    pub fn count_recent_for_session(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM requests
             WHERE requestor_session_id = ?1 AND created_at >= ?2",
            params![session_id, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    /// Attach evidence to a request.
    pub fn add_attachment(
        &self,
        request_id: &str,
        attachment: &Attachment,
    ) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(&attachment.metadata)
            .map_err(|e| corrupt(format!("serializing attachment metadata: {e}")))?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO attachments (request_id, kind, content, metadata_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                request_id,
                attachment.kind.as_str(),
                attachment.content,
                metadata_json
            ],
        )?;
        Ok(())
    }

    /// All attachments for a request, in attach order.
    pub fn list_attachments(&self, request_id: &str) -> Result<Vec<Attachment>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, content, metadata_json FROM attachments
             WHERE request_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![request_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(kind, content, metadata_json)| {
                Ok(Attachment {
                    kind: AttachmentType::parse(&kind)
                        .ok_or_else(|| corrupt(format!("unknown attachment kind {kind:?}")))?,
                    content,
                    metadata: serde_json::from_str(&metadata_json)
                        .map_err(|e| corrupt(format!("attachment metadata: {e}")))?,
                })
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a writer panicked mid-operation; the
        // underlying SQLite transaction already rolled back, so continuing
        // with the connection is sound.
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn corrupt(context: String) -> StoreError {
    StoreError::Corrupt { context }
}

type RawRequest = (
    String,         // id
    String,         // requestor_session_id
    String,         // requestor_agent
    String,         // requestor_model
    String,         // command_json
    String,         // command_hash
    String,         // risk_tier
    String,         // status
    u32,            // min_approvals
    i64,            // require_different_model
    String,         // project_path
    String,         // justification_json
    String,         // created_at
    Option<String>, // approval_expires_at
    Option<String>, // resolved_at
);

fn row_to_raw_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRequest> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
    ))
}

fn raw_to_request(raw: RawRequest) -> Result<Request, StoreError> {
    let (
        id,
        requestor_session_id,
        requestor_agent,
        requestor_model,
        command_json,
        command_hash,
        risk_tier,
        status,
        min_approvals,
        require_different_model,
        project_path,
        justification_json,
        created_at,
        approval_expires_at,
        resolved_at,
    ) = raw;
    let command: CommandSpec = serde_json::from_str(&command_json)
        .map_err(|e| corrupt(format!("command spec for {id}: {e}")))?;
    let justification: Justification = serde_json::from_str(&justification_json)
        .map_err(|e| corrupt(format!("justification for {id}: {e}")))?;
    Ok(Request {
        requestor_session_id,
        requestor_agent,
        requestor_model,
        command,
        command_hash,
        risk_tier: RiskTier::parse(&risk_tier)
            .ok_or_else(|| corrupt(format!("risk tier {risk_tier:?} for {id}")))?,
        status: RequestStatus::parse(&status)
            .ok_or_else(|| corrupt(format!("status {status:?} for {id}")))?,
        min_approvals,
        require_different_model: require_different_model != 0,
        project_path,
        justification,
        created_at: parse_timestamp(&created_at, &id)?,
        approval_expires_at: approval_expires_at
            .map(|t| parse_timestamp(&t, &id))
            .transpose()?,
        resolved_at: resolved_at.map(|t| parse_timestamp(&t, &id)).transpose()?,
        id,
    })
}

type RawReview = (
    String, // id
    String, // request_id
    String, // reviewer_session_id
    String, // reviewer_agent
    String, // reviewer_model
    String, // decision
    String, // signature
    String, // signature_timestamp
    String, // responses_json
    String, // comments
    String, // created_at
);

fn row_to_raw_review(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawReview> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn raw_to_review(raw: RawReview) -> Result<Review, StoreError> {
    let (
        id,
        request_id,
        reviewer_session_id,
        reviewer_agent,
        reviewer_model,
        decision,
        signature,
        signature_timestamp,
        responses_json,
        comments,
        created_at,
    ) = raw;
    Ok(Review {
        request_id,
        reviewer_session_id,
        reviewer_agent,
        reviewer_model,
        decision: Decision::parse(&decision)
            .ok_or_else(|| corrupt(format!("decision {decision:?} for {id}")))?,
        signature,
        signature_timestamp: parse_timestamp(&signature_timestamp, &id)?,
        responses: serde_json::from_str(&responses_json)
            .map_err(|e| corrupt(format!("review responses for {id}: {e}")))?,
        comments,
        created_at: parse_timestamp(&created_at, &id)?,
        id,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let created_at: String = row.get(7)?;
    Ok(Session {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        program: row.get(2)?,
        model: row.get(3)?,
        project_path: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        session_key: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

fn parse_timestamp(value: &str, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("timestamp {value:?} for {id}: {e}")))
}
