use super::{LedgerStats, SkipRecord, Timeframe, TrendPoint};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

const RECORD_COLUMNS: &str = "SongID, SongName, SkipCount, LastSkipped, ArtistName";

/// Durable skip statistics, one row per song. Shared between the monitor
/// (writer) and the HTTP handlers (readers plus the delete endpoint), so
/// the connection sits behind a mutex; every operation holds it for a
/// single short statement or transaction.
pub struct SkipLedger {
    conn: Mutex<Connection>,
}

impl SkipLedger {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize_tables()?;
        info!("skip ledger open at {}", db_path.as_ref().display());
        Ok(db)
    }

    fn initialize_tables(&self) -> Result<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS skips (
                SongID TEXT PRIMARY KEY,
                SongName TEXT NOT NULL,
                SkipCount INTEGER NOT NULL DEFAULT 1,
                LastSkipped TEXT,
                ArtistName TEXT
            )",
            [],
        )?;

        Self::migrate_columns(&conn)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_skips_last_skipped ON skips(LastSkipped)",
            [],
        )?;

        Ok(())
    }

    // Earlier installs only had SongID/SongName/SkipCount; grow the table
    // in place without touching their rows.
    fn migrate_columns(conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare("PRAGMA table_info(skips)")?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;

        if !columns.iter().any(|c| c == "LastSkipped") {
            conn.execute("ALTER TABLE skips ADD COLUMN LastSkipped TEXT", [])?;
            info!("migrated skips table: added LastSkipped");
        }
        if !columns.iter().any(|c| c == "ArtistName") {
            conn.execute("ALTER TABLE skips ADD COLUMN ArtistName TEXT", [])?;
            info!("migrated skips table: added ArtistName");
        }

        Ok(())
    }

    /// Record one detected skip. First sighting inserts with a count of 1;
    /// later sightings increment by exactly 1 and refresh the timestamp.
    /// Artist attribution is first-writer-wins: once set, never overwritten.
    pub async fn record_skip(
        &self,
        song_id: &str,
        song_name: &str,
        artist_name: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO skips (SongID, SongName, SkipCount, LastSkipped, ArtistName)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(SongID) DO UPDATE SET
                 SkipCount = SkipCount + 1,
                 LastSkipped = excluded.LastSkipped,
                 ArtistName = COALESCE(skips.ArtistName, excluded.ArtistName)",
            params![song_id, song_name, now, artist_name],
        )?;
        Ok(())
    }

    /// Sum of skip counts for records whose latest skip falls in the window.
    pub async fn total_skips(&self, timeframe: Timeframe) -> Result<i64> {
        let conn = self.conn();
        let total = match timeframe.cutoff(Utc::now()) {
            Some(cutoff) => conn.query_row(
                "SELECT COALESCE(SUM(SkipCount), 0) FROM skips
                 WHERE LastSkipped IS NOT NULL AND datetime(LastSkipped) >= datetime(?1)",
                params![cutoff.to_rfc3339()],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COALESCE(SUM(SkipCount), 0) FROM skips",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(total)
    }

    /// Records in the window, most-skipped first.
    pub async fn skipped_songs(&self, timeframe: Timeframe) -> Result<Vec<SkipRecord>> {
        let conn = self.conn();
        let records = match timeframe.cutoff(Utc::now()) {
            Some(cutoff) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM skips
                     WHERE LastSkipped IS NOT NULL AND datetime(LastSkipped) >= datetime(?1)
                     ORDER BY SkipCount DESC"
                ))?;
                let rows = stmt.query_map(params![cutoff.to_rfc3339()], Self::row_to_record)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM skips ORDER BY SkipCount DESC"
                ))?;
                let rows = stmt.query_map([], Self::row_to_record)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }

    /// Skips grouped by the calendar date of their latest occurrence, most
    /// recent date first, bounded to 30 distinct dates. The ledger only
    /// remembers each song's most recent skip, so a point counts the songs
    /// whose latest skip landed on that date.
    pub async fn skip_trends(&self, timeframe: Timeframe) -> Result<Vec<TrendPoint>> {
        let conn = self.conn();
        let map_row = |row: &Row| -> rusqlite::Result<TrendPoint> {
            Ok(TrendPoint {
                date: row.get(0)?,
                total_skips: row.get(1)?,
            })
        };

        let points = match timeframe.cutoff(Utc::now()) {
            Some(cutoff) => {
                let mut stmt = conn.prepare(
                    "SELECT date(LastSkipped) AS day, SUM(SkipCount) FROM skips
                     WHERE LastSkipped IS NOT NULL AND datetime(LastSkipped) >= datetime(?1)
                     GROUP BY day ORDER BY day DESC LIMIT 30",
                )?;
                let rows = stmt.query_map(params![cutoff.to_rfc3339()], map_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT date(LastSkipped) AS day, SUM(SkipCount) FROM skips
                     WHERE LastSkipped IS NOT NULL
                     GROUP BY day ORDER BY day DESC LIMIT 30",
                )?;
                let rows = stmt.query_map([], map_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(points)
    }

    /// Delete the given songs from the ledger. Unknown ids and an empty
    /// input are no-ops. Returns the number of rows removed.
    pub async fn remove_records(&self, song_ids: &[String]) -> Result<usize> {
        if song_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM skips WHERE SongID = ?1")?;
            for id in song_ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        let conn = self.conn();
        let (tracked_songs, total_skips) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(SkipCount), 0) FROM skips",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (first, last): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(LastSkipped), MAX(LastSkipped) FROM skips WHERE LastSkipped IS NOT NULL",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(LedgerStats {
            tracked_songs,
            total_skips,
            first_skip: first.as_deref().and_then(parse_timestamp),
            last_skip: last.as_deref().and_then(parse_timestamp),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex only means another thread panicked mid-statement;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<SkipRecord> {
        let last_skipped: Option<String> = row.get(3)?;
        Ok(SkipRecord {
            song_id: row.get(0)?,
            song_name: row.get(1)?,
            skip_count: row.get(2)?,
            last_skipped: last_skipped.as_deref().and_then(parse_timestamp),
            artist_name: row.get(4)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn open_ledger(dir: &TempDir) -> SkipLedger {
        SkipLedger::new(dir.path().join("skips.db")).unwrap()
    }

    fn backdate(ledger: &SkipLedger, song_id: &str, when: DateTime<Utc>) {
        ledger
            .conn()
            .execute(
                "UPDATE skips SET LastSkipped = ?1 WHERE SongID = ?2",
                params![when.to_rfc3339(), song_id],
            )
            .unwrap();
    }

    #[tokio::test]
    async fn record_skip_increments_a_single_row() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        ledger.record_skip("a", "Song A", None).await.unwrap();
        ledger.record_skip("a", "Song A", None).await.unwrap();

        let songs = ledger.skipped_songs(Timeframe::All).await.unwrap();
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].skip_count, 2);
        assert!(songs[0].last_skipped.is_some());
    }

    #[tokio::test]
    async fn artist_attribution_is_sticky() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        ledger
            .record_skip("a", "Song A", Some("First Artist"))
            .await
            .unwrap();
        ledger
            .record_skip("a", "Song A", Some("Impostor"))
            .await
            .unwrap();

        let songs = ledger.skipped_songs(Timeframe::All).await.unwrap();
        assert_eq!(songs[0].artist_name.as_deref(), Some("First Artist"));
    }

    #[tokio::test]
    async fn artist_backfilled_when_first_write_had_none() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        ledger.record_skip("a", "Song A", None).await.unwrap();
        ledger
            .record_skip("a", "Song A", Some("Late Credit"))
            .await
            .unwrap();

        let songs = ledger.skipped_songs(Timeframe::All).await.unwrap();
        assert_eq!(songs[0].artist_name.as_deref(), Some("Late Credit"));
        assert_eq!(songs[0].skip_count, 2);
    }

    #[tokio::test]
    async fn remove_records_empty_and_unknown_are_noops() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        ledger.record_skip("a", "Song A", None).await.unwrap();

        assert_eq!(ledger.remove_records(&[]).await.unwrap(), 0);
        assert_eq!(
            ledger
                .remove_records(&["nope".to_string()])
                .await
                .unwrap(),
            0
        );
        assert_eq!(ledger.skipped_songs(Timeframe::All).await.unwrap().len(), 1);

        assert_eq!(ledger.remove_records(&["a".to_string()]).await.unwrap(), 1);
        assert!(ledger.skipped_songs(Timeframe::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn week_window_excludes_stale_skips() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        ledger.record_skip("old", "Old Song", None).await.unwrap();
        ledger.record_skip("new", "New Song", None).await.unwrap();
        backdate(&ledger, "old", Utc::now() - Duration::days(10));

        let songs = ledger.skipped_songs(Timeframe::Week).await.unwrap();
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].song_id, "new");

        assert_eq!(ledger.total_skips(Timeframe::Week).await.unwrap(), 1);
        assert_eq!(ledger.total_skips(Timeframe::All).await.unwrap(), 2);
        // ten days back is still inside the month window
        assert_eq!(ledger.total_skips(Timeframe::Month).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn skipped_songs_ordered_by_count_descending() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        ledger.record_skip("once", "Once", None).await.unwrap();
        for _ in 0..3 {
            ledger.record_skip("thrice", "Thrice", None).await.unwrap();
        }

        let songs = ledger.skipped_songs(Timeframe::All).await.unwrap();
        assert_eq!(songs[0].song_id, "thrice");
        assert_eq!(songs[0].skip_count, 3);
        assert_eq!(songs[1].song_id, "once");
    }

    #[tokio::test]
    async fn trends_group_by_date_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        let now = Utc::now();
        ledger.record_skip("a", "A", None).await.unwrap();
        ledger.record_skip("a", "A", None).await.unwrap();
        ledger.record_skip("b", "B", None).await.unwrap();
        ledger.record_skip("c", "C", None).await.unwrap();
        backdate(&ledger, "c", now - Duration::days(2));

        let trends = ledger.skip_trends(Timeframe::All).await.unwrap();
        assert_eq!(trends.len(), 2);
        assert_eq!(trends[0].date, now.format("%Y-%m-%d").to_string());
        assert_eq!(trends[0].total_skips, 3); // a twice + b once
        assert_eq!(
            trends[1].date,
            (now - Duration::days(2)).format("%Y-%m-%d").to_string()
        );
        assert_eq!(trends[1].total_skips, 1);
    }

    #[tokio::test]
    async fn trends_bounded_to_thirty_dates() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        let now = Utc::now();
        for i in 0..35 {
            let id = format!("s{i}");
            ledger.record_skip(&id, "Song", None).await.unwrap();
            backdate(&ledger, &id, now - Duration::days(i));
        }

        let trends = ledger.skip_trends(Timeframe::All).await.unwrap();
        assert_eq!(trends.len(), 30);
        assert_eq!(trends[0].date, now.format("%Y-%m-%d").to_string());
    }

    #[tokio::test]
    async fn legacy_table_gains_new_columns_without_data_loss() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skips.db");

        // First-generation schema: no LastSkipped, no ArtistName, and a
        // PlaylistName column we never asked for.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "CREATE TABLE skips (
                    SongID TEXT PRIMARY KEY,
                    SongName TEXT NOT NULL,
                    SkipCount INTEGER DEFAULT 0,
                    PlaylistName TEXT
                )",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO skips (SongID, SongName, SkipCount) VALUES ('a', 'Song A', 3)",
                [],
            )
            .unwrap();
        }

        let ledger = SkipLedger::new(&path).unwrap();
        let songs = ledger.skipped_songs(Timeframe::All).await.unwrap();
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].skip_count, 3);
        assert!(songs[0].last_skipped.is_none());
        assert!(songs[0].artist_name.is_none());

        // And the upsert path works against the migrated table
        ledger
            .record_skip("a", "Song A", Some("The Artist"))
            .await
            .unwrap();
        let songs = ledger.skipped_songs(Timeframe::All).await.unwrap();
        assert_eq!(songs[0].skip_count, 4);
        assert_eq!(songs[0].artist_name.as_deref(), Some("The Artist"));
    }

    #[tokio::test]
    async fn stats_summarize_the_ledger() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        let empty = ledger.stats().await.unwrap();
        assert_eq!(empty.tracked_songs, 0);
        assert_eq!(empty.total_skips, 0);
        assert!(empty.first_skip.is_none());

        ledger.record_skip("a", "A", None).await.unwrap();
        ledger.record_skip("a", "A", None).await.unwrap();
        ledger.record_skip("b", "B", None).await.unwrap();

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.tracked_songs, 2);
        assert_eq!(stats.total_skips, 3);
        assert!(stats.first_skip.is_some());
        assert!(stats.last_skip >= stats.first_skip);
    }
}
