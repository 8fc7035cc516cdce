#![allow(clippy::missing_errors_doc)]

use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use glyph_match_core::{
    format_rfc3339, now_utc, GlyphHashRow, GlyphHashes, GrayBackground, ImageHash, MatchMethod,
    MatchReport, ReferenceHashRow, RgbBackground, ShadeStat, TieBreakStage, GRAY_SHADES,
};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};

const GLYPH_MIGRATION_VERSION: i64 = 1;

const SCHEMA_GLYPH_V1: &str = r"
CREATE TABLE IF NOT EXISTS glyph_hashes (
  filename TEXT PRIMARY KEY,
  codepoint_part TEXT NOT NULL,
  a_hash TEXT NOT NULL,
  c_hash TEXT NOT NULL,
  d_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reference_hashes (
  filename TEXT PRIMARY KEY,
  descriptor TEXT NOT NULL,
  codepoint TEXT NOT NULL,
  a_hash TEXT NOT NULL,
  c_hash TEXT NOT NULL,
  d_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS top_hash_matches (
  glyph_filename TEXT NOT NULL,
  matched_filename TEXT NOT NULL,
  a_dist INTEGER CHECK (a_dist >= 0 OR a_dist IS NULL),
  c_dist INTEGER CHECK (c_dist >= 0 OR c_dist IS NULL),
  d_dist INTEGER CHECK (d_dist >= 0 OR d_dist IS NULL),
  multimatch INTEGER NOT NULL CHECK (multimatch IN (0, 1)),
  match_method TEXT NOT NULL,
  tie_break TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_top_hash_matches_glyph
  ON top_hash_matches(glyph_filename);

CREATE TABLE IF NOT EXISTS gray_backgrounds (
  filename TEXT PRIMARY KEY,
  has_b INTEGER NOT NULL CHECK (has_b IN (0, 1)),
  has_d1 INTEGER NOT NULL CHECK (has_d1 IN (0, 1)),
  has_d2 INTEGER NOT NULL CHECK (has_d2 IN (0, 1)),
  has_g1 INTEGER NOT NULL CHECK (has_g1 IN (0, 1)),
  has_g2 INTEGER NOT NULL CHECK (has_g2 IN (0, 1)),
  has_l1 INTEGER NOT NULL CHECK (has_l1 IN (0, 1)),
  has_l2 INTEGER NOT NULL CHECK (has_l2 IN (0, 1)),
  has_w INTEGER NOT NULL CHECK (has_w IN (0, 1)),
  dist_b INTEGER NOT NULL,
  dist_d1 INTEGER NOT NULL,
  dist_d2 INTEGER NOT NULL,
  dist_g1 INTEGER NOT NULL,
  dist_g2 INTEGER NOT NULL,
  dist_l1 INTEGER NOT NULL,
  dist_l2 INTEGER NOT NULL,
  dist_w INTEGER NOT NULL,
  furthest_shade INTEGER CHECK (furthest_shade BETWEEN 0 AND 255 OR furthest_shade IS NULL)
);

CREATE TABLE IF NOT EXISTS rgb_backgrounds (
  filename TEXT PRIMARY KEY,
  r INTEGER NOT NULL CHECK (r BETWEEN 0 AND 255),
  g INTEGER NOT NULL CHECK (g BETWEEN 0 AND 255),
  b INTEGER NOT NULL CHECK (b BETWEEN 0 AND 255),
  min_d INTEGER NOT NULL,
  max_d INTEGER NOT NULL,
  mean_d INTEGER NOT NULL
);
";

/// Tables (and the one filtered view) that can be written out as TSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportTable {
    Glyphs,
    References,
    Matches,
    Multimatches,
    GrayBackgrounds,
    RgbBackgrounds,
}

impl ExportTable {
    pub const ALL: [Self; 6] = [
        Self::Glyphs,
        Self::References,
        Self::Matches,
        Self::Multimatches,
        Self::GrayBackgrounds,
        Self::RgbBackgrounds,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Glyphs => "glyphs",
            Self::References => "references",
            Self::Matches => "matches",
            Self::Multimatches => "multimatches",
            Self::GrayBackgrounds => "gray_backgrounds",
            Self::RgbBackgrounds => "rgb_backgrounds",
        }
    }

    fn query(self) -> &'static str {
        match self {
            Self::Glyphs => "SELECT * FROM glyph_hashes ORDER BY rowid",
            Self::References => "SELECT * FROM reference_hashes ORDER BY rowid",
            Self::Matches => "SELECT * FROM top_hash_matches ORDER BY rowid",
            Self::Multimatches => {
                "SELECT * FROM top_hash_matches WHERE multimatch = 1 ORDER BY rowid"
            }
            Self::GrayBackgrounds => "SELECT * FROM gray_backgrounds ORDER BY rowid",
            Self::RgbBackgrounds => "SELECT * FROM rgb_backgrounds ORDER BY rowid",
        }
    }
}

/// A row of `top_hash_matches`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoredMatch {
    pub glyph_filename: String,
    pub matched_filename: String,
    pub average_distance: Option<u32>,
    pub color_distance: Option<u32>,
    pub difference_distance: Option<u32>,
    pub multimatch: bool,
    pub method: MatchMethod,
    pub tie_break: Vec<TieBreakStage>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoreSummary {
    pub generated_at: String,
    pub glyphs: usize,
    pub references: usize,
    pub match_rows: usize,
    pub matched_glyphs: usize,
    pub multimatch_glyphs: usize,
    pub unmatched_glyphs: usize,
    pub gray_backgrounds: usize,
    pub rgb_backgrounds: usize,
}

pub struct SqliteGlyphStore {
    conn: Connection,
}

impl SqliteGlyphStore {
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

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_GLYPH_V1)
            .context("failed to apply glyph schema")?;

        let now = format_rfc3339(now_utc())?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![GLYPH_MIGRATION_VERSION, now],
            )
            .context("failed to register glyph schema migration")?;
        if inserted > 0 {
            tracing::debug!(version = GLYPH_MIGRATION_VERSION, "applied glyph schema");
        }

        Ok(())
    }

    pub fn upsert_glyph_hashes(&mut self, rows: &[GlyphHashRow]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to begin glyph hash transaction")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO glyph_hashes(filename, codepoint_part, a_hash, c_hash, d_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(filename) DO UPDATE SET
                   codepoint_part = excluded.codepoint_part,
                   a_hash = excluded.a_hash,
                   c_hash = excluded.c_hash,
                   d_hash = excluded.d_hash",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.filename,
                    row.codepoint_part,
                    row.hashes.average.to_hex(),
                    row.hashes.color.to_hex(),
                    row.hashes.difference.to_hex(),
                ])
                .with_context(|| format!("failed to store hashes for {}", row.filename))?;
            }
        }
        tx.commit().context("failed to commit glyph hashes")?;
        Ok(rows.len())
    }

    pub fn upsert_reference_hashes(&mut self, rows: &[ReferenceHashRow]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to begin reference hash transaction")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO reference_hashes(filename, descriptor, codepoint, a_hash, c_hash, d_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(filename) DO UPDATE SET
                   descriptor = excluded.descriptor,
                   codepoint = excluded.codepoint,
                   a_hash = excluded.a_hash,
                   c_hash = excluded.c_hash,
                   d_hash = excluded.d_hash",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.filename,
                    row.descriptor,
                    row.codepoint,
                    row.hashes.average.to_hex(),
                    row.hashes.color.to_hex(),
                    row.hashes.difference.to_hex(),
                ])
                .with_context(|| format!("failed to store hashes for {}", row.filename))?;
            }
        }
        tx.commit().context("failed to commit reference hashes")?;
        Ok(rows.len())
    }

    /// Glyph rows in insertion order.
    pub fn list_glyph_hashes(&self) -> Result<Vec<GlyphHashRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT filename, codepoint_part, a_hash, c_hash, d_hash
             FROM glyph_hashes ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(GlyphHashRow {
                filename: row.get(0)?,
                codepoint_part: row.get(1)?,
                hashes: parse_hashes(row, 2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read glyph hashes")
    }

    /// Reference rows in insertion order; the codepoint pass takes the first
    /// reference that matches, so this order is significant.
    pub fn list_reference_hashes(&self) -> Result<Vec<ReferenceHashRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT filename, descriptor, codepoint, a_hash, c_hash, d_hash
             FROM reference_hashes ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ReferenceHashRow {
                filename: row.get(0)?,
                descriptor: row.get(1)?,
                codepoint: row.get(2)?,
                hashes: parse_hashes(row, 3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read reference hashes")
    }

    /// Replaces every stored match with the report's, one row per candidate.
    pub fn replace_matches(&mut self, report: &MatchReport) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to begin match transaction")?;
        tx.execute("DELETE FROM top_hash_matches", [])
            .context("failed to clear previous matches")?;

        let mut written = 0_usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO top_hash_matches(
                   glyph_filename, matched_filename, a_dist, c_dist, d_dist,
                   multimatch, match_method, tie_break
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for glyph_match in &report.matches {
                let tie_break = glyph_match
                    .tie_break
                    .iter()
                    .map(|stage| stage.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                for candidate in &glyph_match.candidates {
                    stmt.execute(params![
                        glyph_match.glyph_filename,
                        candidate.filename,
                        candidate.average_distance,
                        candidate.color_distance,
                        candidate.difference_distance,
                        glyph_match.is_multimatch(),
                        glyph_match.method.as_column(),
                        tie_break,
                    ])
                    .with_context(|| {
                        format!("failed to store match for {}", glyph_match.glyph_filename)
                    })?;
                    written += 1;
                }
            }
        }
        tx.commit().context("failed to commit matches")?;
        tracing::info!(rows = written, glyphs = report.matches.len(), "stored matches");
        Ok(written)
    }

    pub fn list_matches(&self, multimatch_only: bool) -> Result<Vec<StoredMatch>> {
        let mut stmt = self.conn.prepare(
            "SELECT glyph_filename, matched_filename, a_dist, c_dist, d_dist,
                    multimatch, match_method, tie_break
             FROM top_hash_matches
             WHERE (?1 = 0 OR multimatch = 1)
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![multimatch_only], parse_match_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read matches")
    }

    /// Glyphs without any match row, in insertion order.
    pub fn unmatched_glyphs(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT filename FROM glyph_hashes
             WHERE filename NOT IN (SELECT glyph_filename FROM top_hash_matches)
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read unmatched glyphs")
    }

    pub fn upsert_gray_background(&self, filename: &str, background: &GrayBackground) -> Result<()> {
        if background.shades.len() != GRAY_SHADES.len() {
            return Err(anyhow!(
                "expected {} shades for {filename}, got {}",
                GRAY_SHADES.len(),
                background.shades.len()
            ));
        }
        let has = background
            .shades
            .iter()
            .map(|stat| i64::from(stat.present))
            .collect::<Vec<_>>();
        let dist = background
            .shades
            .iter()
            .map(|stat| i64::from(stat.mean_distance))
            .collect::<Vec<_>>();

        self.conn
            .execute(
                "INSERT OR REPLACE INTO gray_backgrounds(
                   filename,
                   has_b, has_d1, has_d2, has_g1, has_g2, has_l1, has_l2, has_w,
                   dist_b, dist_d1, dist_d2, dist_g1, dist_g2, dist_l1, dist_l2, dist_w,
                   furthest_shade
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    filename,
                    has[0], has[1], has[2], has[3], has[4], has[5], has[6], has[7],
                    dist[0], dist[1], dist[2], dist[3], dist[4], dist[5], dist[6], dist[7],
                    background.furthest_shade,
                ],
            )
            .with_context(|| format!("failed to store gray background for {filename}"))?;
        Ok(())
    }

    pub fn gray_background(&self, filename: &str) -> Result<Option<GrayBackground>> {
        self.conn
            .query_row(
                "SELECT has_b, has_d1, has_d2, has_g1, has_g2, has_l1, has_l2, has_w,
                        dist_b, dist_d1, dist_d2, dist_g1, dist_g2, dist_l1, dist_l2, dist_w,
                        furthest_shade
                 FROM gray_backgrounds WHERE filename = ?1",
                params![filename],
                |row| {
                    let mut shades = Vec::with_capacity(GRAY_SHADES.len());
                    for (idx, shade) in GRAY_SHADES.iter().enumerate() {
                        shades.push(ShadeStat {
                            shade: *shade,
                            present: row.get(idx)?,
                            mean_distance: to_u32(idx + 8, row.get(idx + 8)?)?,
                        });
                    }
                    Ok(GrayBackground {
                        shades,
                        furthest_shade: row.get(16)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to read gray background for {filename}"))
    }

    pub fn upsert_rgb_background(&self, filename: &str, background: &RgbBackground) -> Result<()> {
        let [r, g, b] = background.rgb;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO rgb_backgrounds(filename, r, g, b, min_d, max_d, mean_d)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    filename,
                    r,
                    g,
                    b,
                    background.min_distance,
                    background.max_distance,
                    background.mean_distance,
                ],
            )
            .with_context(|| format!("failed to store rgb background for {filename}"))?;
        Ok(())
    }

    pub fn rgb_background(&self, filename: &str) -> Result<Option<RgbBackground>> {
        self.conn
            .query_row(
                "SELECT r, g, b, min_d, max_d, mean_d FROM rgb_backgrounds WHERE filename = ?1",
                params![filename],
                |row| {
                    Ok(RgbBackground {
                        rgb: [row.get(0)?, row.get(1)?, row.get(2)?],
                        min_distance: to_u32(3, row.get(3)?)?,
                        max_distance: to_u32(4, row.get(4)?)?,
                        mean_distance: to_u32(5, row.get(5)?)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to read rgb background for {filename}"))
    }

    /// Writes a table as headerless TSV; NULL becomes an empty field.
    pub fn export_tsv<W: Write>(&self, table: ExportTable, writer: W) -> Result<usize> {
        let mut tsv = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(writer);

        let mut stmt = self.conn.prepare(table.query())?;
        let columns = stmt.column_count();
        let mut rows = stmt.query([])?;
        let mut written = 0_usize;
        while let Some(row) = rows.next()? {
            let record = (0..columns)
                .map(|idx| row.get_ref(idx).map(field_text))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            tsv.write_record(&record)
                .with_context(|| format!("failed to write {} row", table.as_str()))?;
            written += 1;
        }
        tsv.flush().context("failed to flush tsv output")?;
        Ok(written)
    }

    pub fn summary(&self) -> Result<StoreSummary> {
        let count = |sql: &str| -> Result<usize> {
            let value: i64 = self
                .conn
                .query_row(sql, [], |row| row.get(0))
                .with_context(|| format!("failed to count: {sql}"))?;
            usize::try_from(value).map_err(|_| anyhow!("negative count from {sql}"))
        };

        Ok(StoreSummary {
            generated_at: format_rfc3339(now_utc())?,
            glyphs: count("SELECT COUNT(*) FROM glyph_hashes")?,
            references: count("SELECT COUNT(*) FROM reference_hashes")?,
            match_rows: count("SELECT COUNT(*) FROM top_hash_matches")?,
            matched_glyphs: count("SELECT COUNT(DISTINCT glyph_filename) FROM top_hash_matches")?,
            multimatch_glyphs: count(
                "SELECT COUNT(DISTINCT glyph_filename) FROM top_hash_matches WHERE multimatch = 1",
            )?,
            unmatched_glyphs: count(
                "SELECT COUNT(*) FROM glyph_hashes
                 WHERE filename NOT IN (SELECT glyph_filename FROM top_hash_matches)",
            )?,
            gray_backgrounds: count("SELECT COUNT(*) FROM gray_backgrounds")?,
            rgb_backgrounds: count("SELECT COUNT(*) FROM rgb_backgrounds")?,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn conversion_error(idx: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_u32(idx: usize, value: i64) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| {
        conversion_error(
            idx,
            rusqlite::types::Type::Integer,
            format!("invalid unsigned value: {value}"),
        )
    })
}

fn parse_hash(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<ImageHash> {
    let raw: String = row.get(idx)?;
    ImageHash::from_hex(&raw)
        .map_err(|err| conversion_error(idx, rusqlite::types::Type::Text, err.to_string()))
}

fn parse_hashes(row: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<GlyphHashes> {
    Ok(GlyphHashes {
        average: parse_hash(row, first)?,
        color: parse_hash(row, first + 1)?,
        difference: parse_hash(row, first + 2)?,
    })
}

fn parse_optional_distance(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<u32>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|value| to_u32(idx, value))
        .transpose()
}

fn parse_match_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMatch> {
    let method_raw: String = row.get(6)?;
    let method = MatchMethod::parse_column(&method_raw).ok_or_else(|| {
        conversion_error(
            6,
            rusqlite::types::Type::Text,
            format!("invalid match_method: {method_raw}"),
        )
    })?;

    let tie_break_raw: String = row.get(7)?;
    let tie_break = tie_break_raw
        .split(',')
        .filter(|stage| !stage.is_empty())
        .map(|stage| {
            TieBreakStage::parse(stage).ok_or_else(|| {
                conversion_error(
                    7,
                    rusqlite::types::Type::Text,
                    format!("invalid tie_break stage: {stage}"),
                )
            })
        })
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(StoredMatch {
        glyph_filename: row.get(0)?,
        matched_filename: row.get(1)?,
        average_distance: parse_optional_distance(row, 2)?,
        color_distance: parse_optional_distance(row, 3)?,
        difference_distance: parse_optional_distance(row, 4)?,
        multimatch: row.get(5)?,
        method,
        tie_break,
    })
}

fn field_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(int) => int.to_string(),
        ValueRef::Real(real) => real.to_string(),
        ValueRef::Text(text) | ValueRef::Blob(text) => String::from_utf8_lossy(text).into_owned(),
    }
}
