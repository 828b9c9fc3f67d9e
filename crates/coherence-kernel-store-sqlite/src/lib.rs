use std::path::Path;

use anyhow::{anyhow, Context, Result};
use coherence_kernel_core::{
    AffinityRecord, AttestationRecord, CoherenceRun, Diagnostics, RangeDef, Snapshot,
    StemmaEdgeRecord,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS snapshot_meta (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  manuscript_count INTEGER NOT NULL CHECK (manuscript_count >= 1),
  location_count INTEGER NOT NULL CHECK (location_count >= 1),
  base_manuscript INTEGER NOT NULL CHECK (base_manuscript >= 0),
  digest TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ranges (
  range_idx INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  start_loc INTEGER NOT NULL CHECK (start_loc >= 0),
  end_loc INTEGER NOT NULL CHECK (end_loc >= start_loc)
);

CREATE TABLE IF NOT EXISTS stemma_edges (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  location INTEGER NOT NULL,
  labez TEXT NOT NULL,
  clique TEXT NOT NULL,
  source_labez TEXT,
  source_clique TEXT,
  is_original INTEGER NOT NULL CHECK (is_original IN (0, 1))
);

CREATE TABLE IF NOT EXISTS attestations (
  manuscript INTEGER NOT NULL,
  location INTEGER NOT NULL,
  labez TEXT NOT NULL,
  clique TEXT NOT NULL,
  certainty REAL NOT NULL CHECK (certainty > 0.0 AND certainty <= 1.0),
  PRIMARY KEY (manuscript, location, labez, clique)
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  snapshot_digest TEXT NOT NULL,
  computed_at TEXT NOT NULL,
  diagnostics_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS manuscript_lengths (
  run_id TEXT NOT NULL,
  range_idx INTEGER NOT NULL,
  manuscript INTEGER NOT NULL,
  length INTEGER NOT NULL CHECK (length >= 0),
  PRIMARY KEY (run_id, range_idx, manuscript),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS affinity (
  run_id TEXT NOT NULL,
  range_idx INTEGER NOT NULL,
  ms1 INTEGER NOT NULL,
  ms2 INTEGER NOT NULL,
  common INTEGER NOT NULL CHECK (common > 0),
  equal INTEGER NOT NULL CHECK (equal >= 0),
  affinity REAL NOT NULL CHECK (affinity >= 0.0 AND affinity <= 1.0),
  older INTEGER NOT NULL,
  newer INTEGER NOT NULL,
  unclear INTEGER NOT NULL,
  p_older INTEGER NOT NULL,
  p_newer INTEGER NOT NULL,
  p_unclear INTEGER NOT NULL,
  PRIMARY KEY (run_id, range_idx, ms1, ms2),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_stemma_edges_location ON stemma_edges(location);
CREATE INDEX IF NOT EXISTS idx_attestations_location ON attestations(location);
CREATE INDEX IF NOT EXISTS idx_affinity_lookup ON affinity(run_id, range_idx, ms1);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub snapshot_digest: String,
    pub computed_at: String,
    pub diagnostics: Diagnostics,
}

impl SqliteStore {
    /// Open a SQLite-backed coherence store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Replace the stored snapshot with `snapshot` and return its digest.
    /// Existing run results are kept; they stay tagged with the digest of the
    /// snapshot they were computed from.
    ///
    /// # Errors
    /// Returns an error when the snapshot fails validation or any write in
    /// the transaction fails.
    pub fn import_snapshot(&mut self, snapshot: &Snapshot) -> Result<String> {
        snapshot.validate().map_err(|err| anyhow!("snapshot validation failed: {err}"))?;
        let digest = snapshot.digest();

        let tx = self.conn.transaction().context("failed to start snapshot transaction")?;

        tx.execute_batch(
            "DELETE FROM attestations;
             DELETE FROM stemma_edges;
             DELETE FROM ranges;
             DELETE FROM snapshot_meta;",
        )
        .context("failed to clear previous snapshot")?;

        tx.execute(
            "INSERT INTO snapshot_meta(id, manuscript_count, location_count, base_manuscript, digest)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                to_i64(snapshot.manuscript_count)?,
                to_i64(snapshot.location_count)?,
                to_i64(snapshot.base_manuscript)?,
                digest,
            ],
        )
        .context("failed to insert snapshot metadata")?;

        for (range_idx, range) in snapshot.ranges.iter().enumerate() {
            tx.execute(
                "INSERT INTO ranges(range_idx, name, start_loc, end_loc) VALUES (?1, ?2, ?3, ?4)",
                params![to_i64(range_idx)?, range.name, to_i64(range.start)?, to_i64(range.end)?],
            )
            .context("failed to insert range")?;
        }

        for edge in &snapshot.stemma_edges {
            tx.execute(
                "INSERT INTO stemma_edges(location, labez, clique, source_labez, source_clique, is_original)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    to_i64(edge.location)?,
                    edge.labez,
                    edge.clique,
                    edge.source_labez,
                    edge.source_clique,
                    i64::from(edge.is_original),
                ],
            )
            .context("failed to insert stemma edge")?;
        }

        for attestation in &snapshot.attestations {
            tx.execute(
                "INSERT INTO attestations(manuscript, location, labez, clique, certainty)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    to_i64(attestation.manuscript)?,
                    to_i64(attestation.location)?,
                    attestation.labez,
                    attestation.clique,
                    attestation.certainty,
                ],
            )
            .context("failed to insert attestation")?;
        }

        tx.commit().context("failed to commit snapshot transaction")?;
        Ok(digest)
    }

    /// Load the stored snapshot.
    ///
    /// # Errors
    /// Returns an error when no snapshot has been imported or rows cannot be
    /// decoded.
    pub fn load_snapshot(&self) -> Result<Snapshot> {
        let meta: Option<(i64, i64, i64)> = self
            .conn
            .query_row(
                "SELECT manuscript_count, location_count, base_manuscript FROM snapshot_meta WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("failed to read snapshot metadata")?;
        let Some((manuscript_count, location_count, base_manuscript)) = meta else {
            return Err(anyhow!("no snapshot has been imported"));
        };

        let mut ranges = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT name, start_loc, end_loc FROM ranges ORDER BY range_idx ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?;
            for row in rows {
                let (name, start, end) = row?;
                ranges.push(RangeDef { name, start: to_usize(start)?, end: to_usize(end)? });
            }
        }

        let mut stemma_edges = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT location, labez, clique, source_labez, source_clique, is_original
                 FROM stemma_edges ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;
            for row in rows {
                let (location, labez, clique, source_labez, source_clique, is_original) = row?;
                stemma_edges.push(StemmaEdgeRecord {
                    location: to_usize(location)?,
                    labez,
                    clique,
                    source_labez,
                    source_clique,
                    is_original: is_original != 0,
                });
            }
        }

        let mut attestations = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT manuscript, location, labez, clique, certainty
                 FROM attestations ORDER BY manuscript ASC, location ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            })?;
            for row in rows {
                let (manuscript, location, labez, clique, certainty) = row?;
                attestations.push(AttestationRecord {
                    manuscript: to_usize(manuscript)?,
                    location: to_usize(location)?,
                    labez,
                    clique,
                    certainty,
                });
            }
        }

        Ok(Snapshot {
            manuscript_count: to_usize(manuscript_count)?,
            location_count: to_usize(location_count)?,
            base_manuscript: to_usize(base_manuscript)?,
            ranges,
            stemma_edges,
            attestations,
        })
    }

    /// Persist a run's identity, diagnostics, per-range lengths, and affinity
    /// records in one transaction. Returns the number of affinity rows.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn save_run(&mut self, run: &CoherenceRun, records: &[AffinityRecord]) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start run transaction")?;

        tx.execute(
            "INSERT INTO runs(run_id, snapshot_digest, computed_at, diagnostics_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run.run_id.to_string(),
                run.snapshot_digest,
                rfc3339(run.computed_at)?,
                serde_json::to_string(&run.diagnostics)
                    .context("failed to serialize diagnostics")?,
            ],
        )
        .context("failed to insert run")?;

        for (range_idx, lengths) in transpose_lengths(&run.matrices.lengths).iter().enumerate() {
            for (manuscript, &length) in lengths.iter().enumerate() {
                tx.execute(
                    "INSERT INTO manuscript_lengths(run_id, range_idx, manuscript, length)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        run.run_id.to_string(),
                        to_i64(range_idx)?,
                        to_i64(manuscript)?,
                        i64::from(length),
                    ],
                )
                .context("failed to insert manuscript length")?;
            }
        }

        for record in records {
            tx.execute(
                "INSERT INTO affinity(
                    run_id, range_idx, ms1, ms2, common, equal, affinity,
                    older, newer, unclear, p_older, p_newer, p_unclear
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    run.run_id.to_string(),
                    to_i64(record.range)?,
                    to_i64(record.ms1)?,
                    to_i64(record.ms2)?,
                    i64::from(record.common),
                    i64::from(record.equal),
                    record.affinity,
                    i64::from(record.older),
                    i64::from(record.newer),
                    i64::from(record.unclear),
                    i64::from(record.p_older),
                    i64::from(record.p_newer),
                    i64::from(record.p_unclear),
                ],
            )
            .context("failed to insert affinity record")?;
        }

        tx.commit().context("failed to commit run transaction")?;
        Ok(records.len())
    }

    /// List all persisted runs, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or diagnostics decoded.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, snapshot_digest, computed_at, diagnostics_json
             FROM runs ORDER BY computed_at DESC, run_id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (run_id, snapshot_digest, computed_at, diagnostics_json) = row?;
            let diagnostics: Diagnostics = serde_json::from_str(&diagnostics_json)
                .with_context(|| format!("failed to decode diagnostics for run {run_id}"))?;
            summaries.push(RunSummary { run_id, snapshot_digest, computed_at, diagnostics });
        }
        Ok(summaries)
    }

    /// Load one run's affinity records for a range, ordered by descending
    /// affinity with a deterministic index tie-break.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn load_affinity(&self, run_id: &str, range: usize) -> Result<Vec<AffinityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT range_idx, ms1, ms2, common, equal, affinity,
                    older, newer, unclear, p_older, p_newer, p_unclear
             FROM affinity
             WHERE run_id = ?1 AND range_idx = ?2
             ORDER BY affinity DESC, ms1 ASC, ms2 ASC",
        )?;
        let rows = stmt.query_map(params![run_id, to_i64(range)?], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, i64>(10)?,
                row.get::<_, i64>(11)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (range_idx, ms1, ms2, common, equal, affinity, older, newer, unclear, p_older, p_newer, p_unclear) =
                row?;
            records.push(AffinityRecord {
                range: to_usize(range_idx)?,
                ms1: to_usize(ms1)?,
                ms2: to_usize(ms2)?,
                common: to_u32(common)?,
                equal: to_u32(equal)?,
                affinity,
                older: to_u32(older)?,
                newer: to_u32(newer)?,
                unclear: to_u32(unclear)?,
                p_older: to_u32(p_older)?,
                p_newer: to_u32(p_newer)?,
                p_unclear: to_u32(p_unclear)?,
            });
        }
        Ok(records)
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read schema version")?;
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(at: OffsetDateTime) -> Result<String> {
    at.format(&Rfc3339).context("failed to format timestamp")
}

/// Core lays lengths out per manuscript; rows here are keyed per range.
fn transpose_lengths(lengths: &[Vec<u32>]) -> Vec<Vec<u32>> {
    let range_count = lengths.first().map_or(0, Vec::len);
    let mut out = vec![vec![0; lengths.len()]; range_count];
    for (manuscript, per_range) in lengths.iter().enumerate() {
        for (range_idx, &length) in per_range.iter().enumerate() {
            out[range_idx][manuscript] = length;
        }
    }
    out
}

fn to_i64(value: usize) -> Result<i64> {
    i64::try_from(value).context("index does not fit in sqlite integer")
}

fn to_usize(value: i64) -> Result<usize> {
    usize::try_from(value).context("stored index is negative")
}

fn to_u32(value: i64) -> Result<u32> {
    u32::try_from(value).context("stored count is out of range")
}
