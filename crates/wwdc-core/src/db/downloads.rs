//! Downloads database operations

use crate::db::Database;
use crate::error::Result;
use crate::media::MediaVariant;
use crate::types::{Download, DownloadState};
use rusqlite::{params, OptionalExtension};

const SELECT_COLUMNS: &str = r#"
    SELECT id, title, remote_url, relative_path, variant, status, progress,
           error_message, created_at, updated_at
    FROM downloads
"#;

/// Downloads database operations
pub struct DownloadsDb;

impl DownloadsDb {
    /// Save a download to the database
    pub fn save(db: &Database, download: &Download) -> Result<()> {
        db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO downloads
                (id, title, remote_url, relative_path, variant, status, progress,
                 error_message, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    download.id,
                    download.title,
                    download.remote_url,
                    download.relative_path,
                    download.variant.to_string(),
                    download.state.status_str(),
                    download.state.progress(),
                    download.error_message,
                    download.created_at,
                    download.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Get a download by content identifier
    pub fn get(db: &Database, id: &str) -> Result<Option<Download>> {
        db.with_conn(|conn| {
            let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
            conn.query_row(&sql, params![id], row_to_download).optional()
        })
    }

    /// Get all downloads, oldest first
    pub fn get_all(db: &Database) -> Result<Vec<Download>> {
        db.with_conn(|conn| {
            let sql = format!("{} ORDER BY created_at ASC, id ASC", SELECT_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let downloads = stmt
                .query_map([], row_to_download)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(downloads)
        })
    }

    /// Get incomplete downloads (for restoration)
    pub fn get_incomplete(db: &Database) -> Result<Vec<Download>> {
        db.with_conn(|conn| {
            let sql = format!(
                "{} WHERE status IN ('waiting', 'downloading', 'paused') ORDER BY created_at ASC",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let downloads = stmt
                .query_map([], row_to_download)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(downloads)
        })
    }

    /// Delete a download record
    pub fn delete(db: &Database, id: &str) -> Result<bool> {
        db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM downloads WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
    }
}

fn row_to_download(row: &rusqlite::Row) -> rusqlite::Result<Download> {
    let variant_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let progress: f64 = row.get(6)?;

    let variant = variant_str.parse::<MediaVariant>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Download {
        id: row.get(0)?,
        title: row.get(1)?,
        remote_url: row.get(2)?,
        relative_path: row.get(3)?,
        variant,
        state: DownloadState::from_parts(&status_str, progress),
        error_message: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Download {
        Download::new(id, "Title", "https://x/a.mp4", "2023/a.mp4", MediaVariant::HdVideo)
    }

    #[test]
    fn test_save_and_get() {
        let db = Database::in_memory().unwrap();
        let mut d = sample("a");
        d.state = DownloadState::paused(0.4);
        DownloadsDb::save(&db, &d).unwrap();

        let loaded = DownloadsDb::get(&db, "a").unwrap().unwrap();
        assert_eq!(loaded, d);
        assert!(DownloadsDb::get(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn test_incomplete_filter() {
        let db = Database::in_memory().unwrap();
        let mut done = sample("done");
        done.state = DownloadState::Completed;
        let mut failed = sample("failed");
        failed.state = DownloadState::Failed;
        DownloadsDb::save(&db, &done).unwrap();
        DownloadsDb::save(&db, &failed).unwrap();
        DownloadsDb::save(&db, &sample("waiting")).unwrap();

        let ids: Vec<String> = DownloadsDb::get_incomplete(&db)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["waiting".to_string()]);
        assert_eq!(DownloadsDb::get_all(&db).unwrap().len(), 3);
    }

    #[test]
    fn test_replace_and_delete() {
        let db = Database::in_memory().unwrap();
        DownloadsDb::save(&db, &sample("a")).unwrap();
        let mut running = sample("a");
        running.state = DownloadState::downloading(0.75);
        DownloadsDb::save(&db, &running).unwrap();
        let loaded = DownloadsDb::get(&db, "a").unwrap().unwrap();
        assert_eq!(loaded.state, DownloadState::downloading(0.75));
        assert_eq!(DownloadsDb::get_all(&db).unwrap().len(), 1);

        assert!(DownloadsDb::delete(&db, "a").unwrap());
        assert!(!DownloadsDb::delete(&db, "a").unwrap());
    }
}
