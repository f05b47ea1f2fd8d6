//! Session catalogue database operations

use crate::db::Database;
use crate::error::Result;
use crate::media::{MediaAsset, MediaVariant, SessionMedia};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;

/// Session catalogue operations
pub struct SessionsDb;

impl SessionsDb {
    /// Insert or replace a session and all of its assets
    pub fn upsert(db: &Database, session: &SessionMedia) -> Result<()> {
        db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                r#"
                INSERT INTO sessions (id, title) VALUES (?1, ?2)
                ON CONFLICT(id) DO UPDATE SET title = excluded.title
                "#,
                params![session.id, session.title],
            )?;
            tx.execute(
                "DELETE FROM session_assets WHERE session_id = ?1",
                params![session.id],
            )?;
            for (variant, asset) in &session.assets {
                tx.execute(
                    r#"
                    INSERT INTO session_assets (session_id, variant, remote_url, relative_path)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    params![
                        session.id,
                        variant.to_string(),
                        asset.remote_url,
                        asset.relative_path
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// Get a session with its assets
    pub fn get(db: &Database, id: &str) -> Result<Option<SessionMedia>> {
        db.with_conn(|conn| {
            let title: Option<String> = conn
                .query_row(
                    "SELECT title FROM sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(title) = title else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT variant, remote_url, relative_path FROM session_assets WHERE session_id = ?1",
            )?;
            let mut assets = BTreeMap::new();
            let rows = stmt.query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (variant, remote_url, relative_path) = row?;
                match variant.parse::<MediaVariant>() {
                    Ok(variant) => {
                        assets.insert(
                            variant,
                            MediaAsset {
                                remote_url,
                                relative_path,
                            },
                        );
                    }
                    Err(e) => log::warn!("Skipping asset of {}: {}", id, e),
                }
            }

            Ok(Some(SessionMedia {
                id: id.to_string(),
                title,
                assets,
            }))
        })
    }

    /// List (id, title, downloaded) for every session
    pub fn list(db: &Database) -> Result<Vec<(String, String, bool)>> {
        db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, title, is_downloaded FROM sessions ORDER BY id")?;
            let sessions = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
    }

    /// All (session id, relative path) pairs
    pub fn asset_paths(db: &Database) -> Result<Vec<(String, String)>> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, relative_path FROM session_assets ORDER BY session_id",
            )?;
            let paths = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(paths)
        })
    }

    /// Batch update of the downloaded flag in one transaction
    pub fn set_downloaded(db: &Database, updates: &[(String, bool)]) -> Result<usize> {
        db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt =
                    tx.prepare("UPDATE sessions SET is_downloaded = ?1 WHERE id = ?2")?;
                for (id, downloaded) in updates {
                    changed += stmt.execute(params![downloaded, id])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    pub fn is_downloaded(db: &Database, id: &str) -> Result<Option<bool>> {
        db.with_conn(|conn| {
            conn.query_row(
                "SELECT is_downloaded FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keynote() -> SessionMedia {
        SessionMedia::new("wwdc2023-101", "Keynote")
            .with_asset(MediaVariant::HdVideo, "https://x/hd.mp4", "2023/101_hd.mp4")
            .with_asset(MediaVariant::SdVideo, "https://x/sd.mp4", "2023/101_sd.mp4")
    }

    #[test]
    fn test_upsert_replaces_assets() {
        let db = Database::in_memory().unwrap();
        SessionsDb::upsert(&db, &keynote()).unwrap();

        let trimmed = SessionMedia::new("wwdc2023-101", "Keynote (updated)")
            .with_asset(MediaVariant::SdVideo, "https://x/sd.mp4", "2023/101_sd.mp4");
        SessionsDb::upsert(&db, &trimmed).unwrap();

        assert_eq!(SessionsDb::get(&db, "wwdc2023-101").unwrap(), Some(trimmed));
        assert_eq!(SessionsDb::asset_paths(&db).unwrap().len(), 1);
    }

    #[test]
    fn test_downloaded_flag_survives_upsert() {
        let db = Database::in_memory().unwrap();
        SessionsDb::upsert(&db, &keynote()).unwrap();
        let changed = SessionsDb::set_downloaded(
            &db,
            &[("wwdc2023-101".to_string(), true), ("unknown".to_string(), true)],
        )
        .unwrap();
        assert_eq!(changed, 1);

        SessionsDb::upsert(&db, &keynote()).unwrap();
        assert_eq!(SessionsDb::is_downloaded(&db, "wwdc2023-101").unwrap(), Some(true));
        assert_eq!(SessionsDb::is_downloaded(&db, "unknown").unwrap(), None);
    }

    #[test]
    fn test_list() {
        let db = Database::in_memory().unwrap();
        SessionsDb::upsert(&db, &keynote()).unwrap();
        SessionsDb::upsert(&db, &SessionMedia::new("wwdc2023-102", "State of the Union")).unwrap();
        let listed = SessionsDb::list(&db).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], ("wwdc2023-101".to_string(), "Keynote".to_string(), false));
    }
}
