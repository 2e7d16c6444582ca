use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, params};
use serde::Serialize;
use tracing::info;

use super::item_packet::ItemPacket;
use super::source_packet::SourcePacket;
use crate::util::{ensure_directory, now_utc_string};

const DB_SCHEMA_VERSION: &str = "spec-harvest.indexing.v1";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MirrorStats {
    pub source_registry_rows: usize,
    pub artifact_rows: usize,
    pub assertion_rows: usize,
    pub evidence_rows: usize,
    pub item_field_state_rows: usize,
    pub item_candidate_rows: usize,
    pub review_queue_rows: usize,
}

pub fn open_mirror(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }

    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS source_registry (
          source_packet_id TEXT NOT NULL,
          source_version_id TEXT NOT NULL,
          run_id TEXT NOT NULL,
          category TEXT NOT NULL,
          product_id TEXT NOT NULL,
          canonical_url TEXT NOT NULL,
          host TEXT,
          tier INTEGER,
          http_status INTEGER,
          content_hash TEXT NOT NULL,
          fetched_at TEXT,
          target_match_passed INTEGER NOT NULL,
          target_match_score REAL NOT NULL,
          PRIMARY KEY (source_version_id, run_id)
        );

        CREATE TABLE IF NOT EXISTS source_artifacts (
          artifact_id TEXT PRIMARY KEY,
          source_packet_id TEXT NOT NULL,
          source_version_id TEXT NOT NULL,
          artifact_kind TEXT NOT NULL,
          uri TEXT NOT NULL,
          captured_at TEXT,
          content_type TEXT
        );

        CREATE TABLE IF NOT EXISTS source_assertions (
          assertion_id TEXT PRIMARY KEY,
          source_packet_id TEXT NOT NULL,
          source_version_id TEXT NOT NULL,
          field_key TEXT NOT NULL,
          context_key TEXT NOT NULL,
          value_raw TEXT NOT NULL,
          value_normalized TEXT NOT NULL,
          unit TEXT,
          confidence REAL NOT NULL,
          parser_score REAL NOT NULL,
          phase_id TEXT NOT NULL,
          source_surface TEXT NOT NULL,
          primary_evidence_id TEXT,
          target_match_passed INTEGER NOT NULL,
          ambiguity_score REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS source_evidence (
          evidence_id TEXT PRIMARY KEY,
          source_packet_id TEXT NOT NULL,
          source_version_id TEXT NOT NULL,
          artifact_id TEXT NOT NULL,
          field_key TEXT NOT NULL,
          quote TEXT NOT NULL,
          snippet_id TEXT,
          key_path TEXT,
          phase_id TEXT NOT NULL,
          source_surface TEXT NOT NULL,
          target_match_passed INTEGER NOT NULL,
          target_match_score REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS item_field_state (
          item_packet_id TEXT NOT NULL,
          field_key TEXT NOT NULL,
          value TEXT NOT NULL,
          confidence REAL NOT NULL,
          candidate_count INTEGER NOT NULL,
          ambiguity_level TEXT NOT NULL,
          has_conflict INTEGER NOT NULL,
          top_assertion_id TEXT,
          priority_rank INTEGER,
          PRIMARY KEY (item_packet_id, field_key)
        );

        CREATE TABLE IF NOT EXISTS item_candidates (
          item_packet_id TEXT NOT NULL,
          field_key TEXT NOT NULL,
          rank INTEGER NOT NULL,
          assertion_id TEXT NOT NULL,
          source_packet_id TEXT,
          value TEXT NOT NULL,
          confidence REAL NOT NULL,
          parser_score REAL NOT NULL,
          method TEXT NOT NULL,
          PRIMARY KEY (item_packet_id, field_key, rank)
        );

        CREATE TABLE IF NOT EXISTS item_review_queue (
          item_packet_id TEXT NOT NULL,
          field_key TEXT NOT NULL,
          reason TEXT NOT NULL,
          ambiguity_level TEXT NOT NULL,
          candidate_count INTEGER NOT NULL,
          priority_rank INTEGER,
          PRIMARY KEY (item_packet_id, field_key)
        );

        CREATE INDEX IF NOT EXISTS idx_source_assertions_field ON source_assertions(field_key);
        CREATE INDEX IF NOT EXISTS idx_source_evidence_version ON source_evidence(source_version_id);
        CREATE INDEX IF NOT EXISTS idx_item_candidates_assertion ON item_candidates(assertion_id);
        ",
        )
        .context("failed to initialize indexing mirror schema")?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now_utc_string()],
    )?;

    Ok(())
}

pub fn mirror_packets(
    connection: &mut Connection,
    source_packets: &[SourcePacket],
    item_packet: &ItemPacket,
) -> Result<MirrorStats> {
    let tx = connection.transaction()?;
    let mut stats = MirrorStats::default();

    for packet in source_packets {
        mirror_source_packet(&tx, packet, &mut stats)
            .with_context(|| format!("failed to mirror source packet {}", packet.source_packet_id))?;
    }
    mirror_item_packet(&tx, item_packet, &mut stats)
        .with_context(|| format!("failed to mirror item packet {}", item_packet.item_packet_id))?;

    tx.commit().context("failed to commit indexing mirror")?;

    info!(
        sources = stats.source_registry_rows,
        assertions = stats.assertion_rows,
        evidence = stats.evidence_rows,
        item_fields = stats.item_field_state_rows,
        "mirrored packet projections"
    );
    Ok(stats)
}

fn mirror_source_packet(
    tx: &Transaction<'_>,
    packet: &SourcePacket,
    stats: &mut MirrorStats,
) -> Result<()> {
    let projection = &packet.sql_projection;

    {
        let mut statement = tx.prepare(
            "
            INSERT OR REPLACE INTO source_registry(
              source_packet_id, source_version_id, run_id, category, product_id, canonical_url,
              host, tier, http_status, content_hash, fetched_at, target_match_passed,
              target_match_score
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
        )?;
        for row in &projection.source_registry {
            statement.execute(params![
                &row.source_packet_id,
                &row.source_version_id,
                &row.run_id,
                &row.category,
                &row.product_id,
                &row.canonical_url,
                &row.host,
                row.tier.map(|tier| tier as i64),
                row.http_status.map(|status| status as i64),
                &row.content_hash,
                &row.fetched_at,
                row.target_match_passed,
                row.target_match_score
            ])?;
            stats.source_registry_rows += 1;
        }
    }

    {
        let mut statement = tx.prepare(
            "
            INSERT OR REPLACE INTO source_artifacts(
              artifact_id, source_packet_id, source_version_id, artifact_kind, uri, captured_at,
              content_type
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )?;
        for row in &projection.artifacts {
            statement.execute(params![
                &row.artifact_id,
                &row.source_packet_id,
                &row.source_version_id,
                row.artifact_kind.as_str(),
                &row.uri,
                &row.captured_at,
                &row.content_type
            ])?;
            stats.artifact_rows += 1;
        }
    }

    {
        let mut statement = tx.prepare(
            "
            INSERT OR REPLACE INTO source_assertions(
              assertion_id, source_packet_id, source_version_id, field_key, context_key,
              value_raw, value_normalized, unit, confidence, parser_score, phase_id,
              source_surface, primary_evidence_id, target_match_passed, ambiguity_score
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ",
        )?;
        for row in &projection.assertions {
            statement.execute(params![
                &row.assertion_id,
                &row.source_packet_id,
                &row.source_version_id,
                &row.field_key,
                &row.context_key,
                &row.value_raw,
                &row.value_normalized,
                &row.unit,
                row.confidence,
                row.parser_score,
                row.phase_id.as_str(),
                row.source_surface.as_str(),
                &row.primary_evidence_id,
                row.target_match_passed,
                row.ambiguity_score
            ])?;
            stats.assertion_rows += 1;
        }
    }

    {
        let mut statement = tx.prepare(
            "
            INSERT OR REPLACE INTO source_evidence(
              evidence_id, source_packet_id, source_version_id, artifact_id, field_key, quote,
              snippet_id, key_path, phase_id, source_surface, target_match_passed,
              target_match_score
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
        )?;
        for row in &projection.evidence {
            statement.execute(params![
                &row.evidence_id,
                &row.source_packet_id,
                &row.source_version_id,
                &row.artifact_id,
                &row.field_key,
                &row.quote,
                &row.snippet_id,
                &row.key_path,
                row.phase_id.as_str(),
                row.source_surface.as_str(),
                row.target_match_passed,
                row.target_match_score
            ])?;
            stats.evidence_rows += 1;
        }
    }

    Ok(())
}

fn mirror_item_packet(
    tx: &Transaction<'_>,
    packet: &ItemPacket,
    stats: &mut MirrorStats,
) -> Result<()> {
    let projection = &packet.sql_projection;

    {
        let mut statement = tx.prepare(
            "
            INSERT OR REPLACE INTO item_field_state(
              item_packet_id, field_key, value, confidence, candidate_count, ambiguity_level,
              has_conflict, top_assertion_id, priority_rank
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )?;
        for row in &projection.item_field_state {
            statement.execute(params![
                &row.item_packet_id,
                &row.field_key,
                &row.value,
                row.confidence,
                row.candidate_count as i64,
                &row.ambiguity_level,
                row.has_conflict,
                &row.top_assertion_id,
                row.priority_rank.map(|rank| rank as i64)
            ])?;
            stats.item_field_state_rows += 1;
        }
    }

    tx.execute(
        "DELETE FROM item_candidates WHERE item_packet_id = ?1",
        [&packet.item_packet_id],
    )?;
    {
        let mut statement = tx.prepare(
            "
            INSERT OR REPLACE INTO item_candidates(
              item_packet_id, field_key, rank, assertion_id, source_packet_id, value,
              confidence, parser_score, method
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )?;
        for row in &projection.item_candidates {
            statement.execute(params![
                &row.item_packet_id,
                &row.field_key,
                row.rank as i64,
                &row.assertion_id,
                &row.source_packet_id,
                &row.value,
                row.confidence,
                row.parser_score,
                &row.method
            ])?;
            stats.item_candidate_rows += 1;
        }
    }

    tx.execute(
        "DELETE FROM item_review_queue WHERE item_packet_id = ?1",
        [&packet.item_packet_id],
    )?;
    {
        let mut statement = tx.prepare(
            "
            INSERT OR REPLACE INTO item_review_queue(
              item_packet_id, field_key, reason, ambiguity_level, candidate_count, priority_rank
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )?;
        for row in &projection.review_queue {
            statement.execute(params![
                &row.item_packet_id,
                &row.field_key,
                &row.reason,
                &row.ambiguity_level,
                row.candidate_count as i64,
                row.priority_rank.map(|rank| rank as i64)
            ])?;
            stats.review_queue_rows += 1;
        }
    }

    Ok(())
}
