//! Work source: streams origin URLs out of the parquet archives with a
//! resumable cursor.
//!
//! The archives are columnar snapshots of origin URLs (and, for
//! `--min-date` runs, origin visit dates). DuckDB reads them in place and
//! doubles as the cursor store, so restarts are cheap: the work table is
//! row-numbered once, and a `cursors` row records the last row handed out
//! per slice.
//!
//! Two modes:
//! - **Primary** (`offset == 0`): materializes (or reuses) the full
//!   filtered work table inside `.fetch-cache.duckdb`; cursor key is the
//!   table name.
//! - **Parallel instance** (`offset > 0`): materializes only the slice
//!   `(offset, offset+limit]` in memory and keys its cursor as
//!   `<table>_<offset>`, so sibling instances never collide.
//!
//! URLs are emitted in fixed-size batches so the fetch scheduler can
//! bound live work; the caller commits the cursor after each completed
//! batch.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use duckdb::{params, Connection};
use std::path::Path;

use crate::config::Config;
use crate::models::Origin;

/// URLs per emitted batch.
pub const WORK_BATCH: usize = 50_000;

#[derive(Debug, Clone, Default)]
pub struct WorkParams {
    pub limit: Option<usize>,
    pub offset: usize,
    pub full: bool,
    pub min_date: Option<NaiveDate>,
}

pub struct WorkSource {
    conn: Connection,
    cursor_key: String,
    mode: Mode,
    /// URLs emitted so far, for `limit` accounting in primary mode.
    emitted: usize,
    limit: Option<usize>,
}

enum Mode {
    Primary { table: String, last_id: i64 },
    Slice { rows: Vec<Origin>, pos: usize },
}

impl WorkSource {
    pub fn open(config: &Config, params: &WorkParams) -> Result<Self> {
        let conn = Connection::open(config.fetch_cache_path()).with_context(|| {
            format!(
                "failed to open fetch cache: {}",
                config.fetch_cache_path().display()
            )
        })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cursors (name VARCHAR PRIMARY KEY, last_id BIGINT)",
        )?;

        let table = table_name(params);

        if params.offset == 0 {
            let select = archive_select(config, params)?;
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} AS SELECT row_number() OVER () AS id, url FROM ({})",
                table, select
            ))?;
            let cursor_key = table.clone();
            let last_id = load_cursor(&conn, &cursor_key)?;
            Ok(Self {
                conn,
                cursor_key,
                mode: Mode::Primary { table, last_id },
                emitted: 0,
                limit: params.limit,
            })
        } else {
            // Parallel instance: only the slice lives in memory; row IDs
            // stay dense and global so cursors mean the same thing in
            // both modes.
            let select = archive_select(config, params)?;
            let mut sql = format!("SELECT url FROM ({})", select);
            if let Some(limit) = params.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }
            sql.push_str(&format!(" OFFSET {}", params.offset));

            let mut stmt = conn.prepare(&sql)?;
            let urls: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            drop(stmt);

            let base = params.offset as i64;
            let rows: Vec<Origin> = urls
                .into_iter()
                .enumerate()
                .map(|(i, url)| Origin {
                    id: base + i as i64 + 1,
                    url,
                })
                .collect();

            let cursor_key = format!("{}_{}", table, params.offset);
            let last_id = load_cursor(&conn, &cursor_key)?;
            let pos = rows.iter().take_while(|o| o.id <= last_id).count();

            Ok(Self {
                conn,
                cursor_key,
                mode: Mode::Slice { rows, pos },
                emitted: 0,
                limit: None,
            })
        }
    }

    /// Total rows this source can still emit, for progress totals.
    pub fn remaining(&self) -> Result<usize> {
        match &self.mode {
            Mode::Primary { table, last_id } => {
                let count: i64 = self.conn.query_row(
                    &format!("SELECT count(*) FROM {} WHERE id > ?", table),
                    params![*last_id],
                    |row| row.get(0),
                )?;
                let count = count as usize;
                Ok(match self.limit {
                    Some(limit) => count.min(limit.saturating_sub(self.emitted)),
                    None => count,
                })
            }
            Mode::Slice { rows, pos } => Ok(rows.len() - pos),
        }
    }

    /// Next batch of up to [`WORK_BATCH`] origins, or `None` when the
    /// slice is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Vec<Origin>>> {
        let budget = match self.limit {
            Some(limit) => WORK_BATCH.min(limit.saturating_sub(self.emitted)),
            None => WORK_BATCH,
        };
        if budget == 0 {
            return Ok(None);
        }

        let batch = match &mut self.mode {
            Mode::Primary { table, last_id } => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT id, url FROM {} WHERE id > ? ORDER BY id LIMIT {}",
                    table, budget
                ))?;
                let rows: Vec<Origin> = stmt
                    .query_map(params![*last_id], |row| {
                        Ok(Origin {
                            id: row.get(0)?,
                            url: row.get(1)?,
                        })
                    })?
                    .collect::<std::result::Result<_, _>>()?;
                if let Some(last) = rows.last() {
                    *last_id = last.id;
                }
                rows
            }
            Mode::Slice { rows, pos } => {
                let end = (*pos + budget).min(rows.len());
                let batch = rows[*pos..end].to_vec();
                *pos = end;
                batch
            }
        };

        if batch.is_empty() {
            return Ok(None);
        }
        self.emitted += batch.len();
        Ok(Some(batch))
    }

    /// Persist the cursor after the batch ending at `last_id` has been
    /// fully processed.
    pub fn commit(&self, last_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cursors VALUES (?, ?)
             ON CONFLICT (name) DO UPDATE SET last_id = excluded.last_id",
            params![self.cursor_key, last_id],
        )?;
        Ok(())
    }
}

fn load_cursor(conn: &Connection, key: &str) -> Result<i64> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_id FROM cursors WHERE name = ?",
            params![key],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            duckdb::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(last.unwrap_or(0))
}

/// SELECT producing `url` rows from the right archive for these params.
fn archive_select(config: &Config, params: &WorkParams) -> Result<String> {
    Ok(match params.min_date {
        Some(date) => format!(
            "SELECT origin AS url FROM read_parquet('{}') WHERE date >= DATE '{}'",
            sql_path(&config.visits_parquet(params.full))?,
            date.format("%Y-%m-%d"),
        ),
        None => format!(
            "SELECT url FROM read_parquet('{}')",
            sql_path(&config.origins_parquet(params.full))?,
        ),
    })
}

/// Stable, SQL-identifier-safe work table name for these params.
fn table_name(params: &WorkParams) -> String {
    let archive = if params.full { "full" } else { "6k" };
    match params.min_date {
        Some(date) => format!("work_recent_{}_{}", date.format("%Y%m%d"), archive),
        None => format!("work_origins_{}", archive),
    }
}

fn sql_path(path: &Path) -> Result<String> {
    let s = path
        .to_str()
        .with_context(|| format!("non-UTF-8 archive path: {}", path.display()))?;
    Ok(s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    /// Write a tiny origins parquet with `n` synthetic GitHub URLs.
    fn seed_archives(config: &Config, n: usize) {
        std::fs::create_dir_all(&config.data_dir).unwrap();
        let conn = Connection::open_in_memory().unwrap();
        let values: Vec<String> = (0..n)
            .map(|i| format!("('https://github.com/owner{}/repo{}')", i, i))
            .collect();
        conn.execute_batch(&format!(
            "COPY (SELECT * FROM (VALUES {}) t(url)) TO '{}' (FORMAT PARQUET)",
            values.join(", "),
            config.origins_parquet(false).to_str().unwrap(),
        ))
        .unwrap();

        let visit_values: Vec<String> = (0..n)
            .map(|i| {
                let date = if i % 2 == 0 { "2024-06-01" } else { "2020-01-01" };
                format!(
                    "('https://github.com/owner{}/repo{}', DATE '{}')",
                    i, i, date
                )
            })
            .collect();
        conn.execute_batch(&format!(
            "COPY (SELECT * FROM (VALUES {}) t(origin, date)) TO '{}' (FORMAT PARQUET)",
            visit_values.join(", "),
            config.visits_parquet(false).to_str().unwrap(),
        ))
        .unwrap();
    }

    fn test_config(tmp: &TempDir) -> Config {
        let cfg = Config::for_dirs(tmp.path().to_path_buf(), tmp.path().join("readmes"));
        std::fs::create_dir_all(&cfg.readmes_dir).unwrap();
        cfg
    }

    #[test]
    fn primary_mode_streams_all_rows_in_order() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(&tmp);
        seed_archives(&cfg, 10);

        let mut source = WorkSource::open(&cfg, &WorkParams::default()).unwrap();
        assert_eq!(source.remaining().unwrap(), 10);

        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(batch[0].id, 1);
        assert_eq!(batch[0].url, "https://github.com/owner0/repo0");
        assert_eq!(batch[9].id, 10);
        assert!(source.next_batch().unwrap().is_none());
    }

    #[test]
    fn cursor_resumes_after_commit() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(&tmp);
        seed_archives(&cfg, 10);

        {
            let mut source = WorkSource::open(&cfg, &WorkParams::default()).unwrap();
            let batch = source.next_batch().unwrap().unwrap();
            source.commit(batch[4].id).unwrap();
        }

        // A fresh source picks up after row 5.
        let mut source = WorkSource::open(&cfg, &WorkParams::default()).unwrap();
        assert_eq!(source.remaining().unwrap(), 5);
        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch[0].id, 6);
        assert_eq!(batch.len(), 5);
    }

    #[test]
    fn limit_caps_emission() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(&tmp);
        seed_archives(&cfg, 10);

        let mut source = WorkSource::open(
            &cfg,
            &WorkParams {
                limit: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 3);
        assert!(source.next_batch().unwrap().is_none());
    }

    #[test]
    fn parallel_slice_uses_global_ids_and_private_cursor() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(&tmp);
        seed_archives(&cfg, 10);

        let params = WorkParams {
            limit: Some(4),
            offset: 5,
            ..Default::default()
        };
        {
            let mut source = WorkSource::open(&cfg, &params).unwrap();
            let batch = source.next_batch().unwrap().unwrap();
            assert_eq!(batch.len(), 4);
            assert_eq!(batch[0].id, 6);
            assert_eq!(batch[0].url, "https://github.com/owner5/repo5");
            source.commit(batch[1].id).unwrap();
        }

        // Resume within the slice; the primary cursor is untouched.
        let mut source = WorkSource::open(&cfg, &params).unwrap();
        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch[0].id, 8);
        assert_eq!(batch.len(), 2);

        let mut primary = WorkSource::open(&cfg, &WorkParams::default()).unwrap();
        assert_eq!(primary.next_batch().unwrap().unwrap()[0].id, 1);
    }

    #[test]
    fn min_date_filters_through_the_visits_archive() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(&tmp);
        seed_archives(&cfg, 10);

        let mut source = WorkSource::open(
            &cfg,
            &WorkParams {
                min_date: Some(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        let batch = source.next_batch().unwrap().unwrap();
        // Even-indexed origins were visited in 2024; odd in 2020.
        assert_eq!(batch.len(), 5);
        assert!(batch.iter().all(|o| o.url.contains("owner0")
            || o.url.contains("owner2")
            || o.url.contains("owner4")
            || o.url.contains("owner6")
            || o.url.contains("owner8")));
    }
}
