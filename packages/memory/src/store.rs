// ABOUTME: SQLite-backed tool store recording execution outcomes by fingerprint
// ABOUTME: Counter updates are single upserts inside a write transaction; lookups re-rank similarity hits by success bias

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use neuroforge_config::constants::MEMORY_DB_PATH;
use neuroforge_config::{string, EnvSource, ProcessEnv};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::ranking::RankingPolicy;
use crate::similarity::SimilaritySearch;
use crate::types::{
    ErrorTraceRecord, KnownFix, Outcome, OutcomeStatus, RankedCandidate, ToolInvocation, ToolRecord,
};

/// Database file used when `MEMORY_DB_PATH` is unset
pub const DEFAULT_DB_PATH: &str = "neuroforge-memory.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECTIONS: u32 = 8;

const RECORD_COLUMNS: &str =
    "fingerprint, invocation, success_count, failure_count, last_used, created_at, last_success";

pub struct ToolStore {
    pool: SqlitePool,
    search: Arc<dyn SimilaritySearch>,
    policy: RankingPolicy,
}

impl ToolStore {
    /// Open (creating if needed) the database at `path` and apply migrations
    pub async fn open(path: impl AsRef<Path>, search: Arc<dyn SimilaritySearch>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(BUSY_TIMEOUT)
            .connect_with(options)
            .await?;

        info!("Opened tool store at {}", path.display());
        Self::with_pool(pool, search).await
    }

    /// Open the database named by `MEMORY_DB_PATH`, using the ranking policy from env
    pub async fn from_env(search: Arc<dyn SimilaritySearch>) -> Result<Self> {
        Self::from_source(&ProcessEnv, search).await
    }

    pub async fn from_source(env: &dyn EnvSource, search: Arc<dyn SimilaritySearch>) -> Result<Self> {
        let path = string(env, MEMORY_DB_PATH).unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let store = Self::open(path, search).await?;
        Ok(store.with_policy(RankingPolicy::from_source(env)))
    }

    /// Use an existing pool; migrations are applied and every stored tool is
    /// re-announced to the similarity engine
    pub async fn with_pool(pool: SqlitePool, search: Arc<dyn SimilaritySearch>) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        let store = Self {
            pool,
            search,
            policy: RankingPolicy::default(),
        };
        store.reindex().await?;
        Ok(store)
    }

    /// Index every stored tool under its query text, returning how many were indexed.
    ///
    /// Similarity engines may keep their index in memory only, so this runs
    /// whenever a store is opened.
    pub async fn reindex(&self) -> Result<usize> {
        let rows = sqlx::query("SELECT fingerprint, invocation FROM tool_records")
            .fetch_all(&self.pool)
            .await?;

        let mut indexed = 0;
        for row in &rows {
            let fingerprint = Fingerprint::parse(&row.try_get::<String, _>("fingerprint")?)?;
            let invocation: ToolInvocation =
                serde_json::from_str(&row.try_get::<String, _>("invocation")?)?;
            match self.search.index(&fingerprint, &invocation.query).await {
                Ok(()) => indexed += 1,
                Err(e) => warn!("Failed to index stored tool {}: {}", fingerprint, e),
            }
        }

        if indexed > 0 {
            info!("Indexed {} stored tool(s) for similarity search", indexed);
        }
        Ok(indexed)
    }

    pub fn with_policy(mut self, policy: RankingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RankingPolicy {
        &self.policy
    }

    /// Record one outcome for `fingerprint`.
    ///
    /// The record upsert comes first in its transaction so the write lock is
    /// taken up front; concurrent recorders serialize on SQLite's lock and
    /// every increment lands.
    pub async fn record(&self, fingerprint: &Fingerprint, outcome: &Outcome) -> Result<ToolRecord> {
        let now = Utc::now();
        let invocation = serde_json::to_string(&outcome.invocation)?;
        let (successes, failures): (i64, i64) = if outcome.is_success() { (1, 0) } else { (0, 1) };
        let last_success = outcome.is_success().then_some(now);

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO tool_records ({RECORD_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(fingerprint) DO UPDATE SET
                 success_count = success_count + excluded.success_count,
                 failure_count = failure_count + excluded.failure_count,
                 invocation = CASE WHEN excluded.success_count > 0
                                   THEN excluded.invocation ELSE invocation END,
                 last_success = COALESCE(excluded.last_success, last_success),
                 last_used = excluded.last_used
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(fingerprint.as_str())
        .bind(&invocation)
        .bind(successes)
        .bind(failures)
        .bind(now)
        .bind(now)
        .bind(last_success)
        .fetch_one(&mut *tx)
        .await?;

        let record = row_to_record(&row)?;

        if let OutcomeStatus::Failure { signature } = &outcome.status {
            sqlx::query(
                "INSERT INTO error_traces (fingerprint, signature, occurrence_count, first_seen, last_seen)
                 VALUES (?, ?, 1, ?, ?)
                 ON CONFLICT(fingerprint, signature) DO UPDATE SET
                     occurrence_count = occurrence_count + 1,
                     last_seen = excluded.last_seen",
            )
            .bind(fingerprint.as_str())
            .bind(signature)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            "Recorded {} for {} (success={}, failure={})",
            if outcome.is_success() { "success" } else { "failure" },
            fingerprint,
            record.success_count,
            record.failure_count
        );

        if let Err(e) = self
            .search
            .index(fingerprint, &outcome.invocation.query)
            .await
        {
            warn!("Failed to index tool {}: {}", fingerprint, e);
        }

        Ok(record)
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ToolRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM tool_records WHERE fingerprint = ?"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Failure signatures for a tool, most frequent first
    pub async fn error_traces(&self, fingerprint: &Fingerprint) -> Result<Vec<ErrorTraceRecord>> {
        let rows = sqlx::query(
            "SELECT fingerprint, signature, occurrence_count, first_seen, last_seen
             FROM error_traces WHERE fingerprint = ?
             ORDER BY occurrence_count DESC, last_seen DESC",
        )
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trace).collect()
    }

    /// Tools that failed with `signature` and succeeded at some point after
    /// first hitting it, most successful first.
    ///
    /// Each hit carries the tool's last successful invocation, which is what
    /// fixed the error.
    pub async fn lookup_by_signature(&self, signature: &str) -> Result<Vec<KnownFix>> {
        let rows = sqlx::query(
            "SELECT r.fingerprint, r.invocation, r.success_count, r.failure_count,
                    r.last_used, r.created_at, r.last_success,
                    t.signature, t.occurrence_count, t.first_seen, t.last_seen
             FROM error_traces t
             JOIN tool_records r ON r.fingerprint = t.fingerprint
             WHERE t.signature = ? AND r.last_success IS NOT NULL",
        )
        .bind(signature)
        .fetch_all(&self.pool)
        .await?;

        let mut fixes = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
            let trace = row_to_trace(row)?;
            if record.last_success.is_some_and(|at| at > trace.first_seen) {
                fixes.push(KnownFix { record, trace });
            }
        }

        fixes.sort_by(|a, b| {
            b.record
                .success_count
                .cmp(&a.record.success_count)
                .then_with(|| b.record.last_success.cmp(&a.record.last_success))
                .then_with(|| a.record.fingerprint.cmp(&b.record.fingerprint))
        });
        debug!("{} known fix(es) for {:?}", fixes.len(), signature);
        Ok(fixes)
    }

    /// Candidates for `query`, re-ranked by `similarity * bias`.
    ///
    /// Twice `limit` candidates are requested from the similarity engine so
    /// that demoted tools can be replaced by better ones.
    pub async fn lookup(&self, query: &str, limit: usize) -> Result<Vec<RankedCandidate>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let candidates = self
            .search
            .candidates(query, limit.saturating_mul(2))
            .await?;

        let mut best: HashMap<Fingerprint, f64> = HashMap::new();
        for candidate in candidates {
            if !candidate.similarity.is_finite() {
                continue;
            }
            let similarity = candidate.similarity.clamp(0.0, 1.0);
            let entry = best.entry(candidate.fingerprint).or_insert(similarity);
            if similarity > *entry {
                *entry = similarity;
            }
        }

        let mut ranked = Vec::with_capacity(best.len());
        for (fingerprint, similarity) in best {
            let Some((record, worst_trace_count)) = self.load_for_ranking(&fingerprint).await? else {
                debug!("Similarity candidate {} has no record, skipping", fingerprint);
                continue;
            };

            match self
                .policy
                .bias(record.success_count, record.failure_count, worst_trace_count)
            {
                Some(bias) => ranked.push(RankedCandidate {
                    record,
                    similarity,
                    bias,
                    score: similarity * bias,
                    worst_trace_count,
                }),
                None => debug!(
                    "Excluding {} from lookup: {} failures, worst trace seen {} times",
                    fingerprint, record.failure_count, worst_trace_count
                ),
            }
        }

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.record.success_ratio().total_cmp(&a.record.success_ratio()))
                .then_with(|| b.record.last_used.cmp(&a.record.last_used))
                .then_with(|| a.record.fingerprint.cmp(&b.record.fingerprint))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn load_for_ranking(&self, fingerprint: &Fingerprint) -> Result<Option<(ToolRecord, i64)>> {
        let row = sqlx::query(
            "SELECT r.fingerprint, r.invocation, r.success_count, r.failure_count,
                    r.last_used, r.created_at, r.last_success,
                    COALESCE((SELECT MAX(t.occurrence_count) FROM error_traces t
                              WHERE t.fingerprint = r.fingerprint), 0) AS worst_trace_count
             FROM tool_records r WHERE r.fingerprint = ?",
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let worst: i64 = row.try_get("worst_trace_count")?;
                Ok(Some((row_to_record(&row)?, worst)))
            }
            None => Ok(None),
        }
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ToolRecord> {
    let invocation: String = row.try_get("invocation")?;
    let last_used: DateTime<Utc> = row.try_get("last_used")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(ToolRecord {
        fingerprint: Fingerprint::parse(&row.try_get::<String, _>("fingerprint")?)?,
        invocation: serde_json::from_str(&invocation)?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        last_used,
        created_at,
        last_success: row.try_get("last_success")?,
    })
}

fn row_to_trace(row: &SqliteRow) -> Result<ErrorTraceRecord> {
    Ok(ErrorTraceRecord {
        fingerprint: Fingerprint::parse(&row.try_get::<String, _>("fingerprint")?)?,
        signature: row.try_get("signature")?,
        occurrence_count: row.try_get("occurrence_count")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}
