//! Durable container record store.
//!
//! One row per container, keyed by id. Updates are single-row and
//! therefore atomic; concurrent updates to different containers do not
//! interfere. Removal is idempotent. Not-found is a distinct,
//! non-fatal error so callers can branch on it.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use super::{Container, Status};
use crate::storage::lock;

/// Errors from container store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No record with the given container id.
    #[error("container not found: {0}")]
    NotFound(String),

    /// A stored row no longer decodes; operator attention required.
    #[error("corrupt container record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Repository over the `containers` table.
#[derive(Clone)]
pub struct ContainerStore {
    conn: Arc<Mutex<Connection>>,
}

impl ContainerStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert a new record. Fails if the id already exists.
    pub fn insert(&self, container: &Container) -> Result<(), StoreError> {
        lock(&self.conn).execute(
            r#"
            INSERT INTO containers
                (id, app_name, process_name, platform, image, build_image,
                 host_addr, host_port, ip, status, status_updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                container.id,
                container.app_name,
                container.process_name,
                container.platform,
                container.image,
                container.build_image,
                container.host_addr,
                container.host_port,
                container.ip,
                container.status.as_str(),
                container.status_updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Replace the full record for `container.id`.
    pub fn update(&self, container: &Container) -> Result<(), StoreError> {
        let affected = lock(&self.conn).execute(
            r#"
            UPDATE containers SET
                app_name = ?2, process_name = ?3, platform = ?4, image = ?5,
                build_image = ?6, host_addr = ?7, host_port = ?8, ip = ?9,
                status = ?10, status_updated_at = ?11
            WHERE id = ?1
            "#,
            params![
                container.id,
                container.app_name,
                container.process_name,
                container.platform,
                container.image,
                container.build_image,
                container.host_addr,
                container.host_port,
                container.ip,
                container.status.as_str(),
                container.status_updated_at.timestamp(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(container.id.clone()));
        }
        Ok(())
    }

    /// Update only the status, refreshing the status timestamp.
    pub fn set_status(&self, id: &str, status: Status) -> Result<(), StoreError> {
        let affected = lock(&self.conn).execute(
            "UPDATE containers SET status = ?2, status_updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Utc::now().timestamp()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Update the network identity learned from inspection.
    pub fn set_network(&self, id: &str, ip: &str, host_port: &str) -> Result<(), StoreError> {
        let affected = lock(&self.conn).execute(
            "UPDATE containers SET ip = ?2, host_port = ?3 WHERE id = ?1",
            params![id, ip, host_port],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Remove a record. Removing an absent id is not an error.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        lock(&self.conn).execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Container, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        let row = stmt
            .query_row(params![id], decode_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row
    }

    /// Containers of an application, optionally narrowed by process and
    /// by a status set. Rows come back in creation order.
    pub fn list_by_app(
        &self,
        app: &str,
        process: Option<&str>,
        statuses: Option<&[Status]>,
    ) -> Result<Vec<Container>, StoreError> {
        let conn = lock(&self.conn);
        let mut sql = format!("{SELECT_COLUMNS} WHERE app_name = ?1");
        let mut args: Vec<String> = vec![app.to_string()];
        if let Some(process) = process {
            sql.push_str(&format!(" AND process_name = ?{}", args.len() + 1));
            args.push(process.to_string());
        }
        if let Some(statuses) = statuses {
            let placeholders: Vec<String> = statuses
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", args.len() + i + 1))
                .collect();
            sql.push_str(&format!(" AND status IN ({})", placeholders.join(", ")));
            for status in statuses {
                args.push(status.as_str().to_string());
            }
        }
        sql.push_str(" ORDER BY rowid");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), decode_row)?;
        collect(rows)
    }

    /// All containers bound to a host address, in creation order.
    pub fn list_by_host(&self, host_addr: &str) -> Result<Vec<Container>, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt =
            conn.prepare(&format!("{SELECT_COLUMNS} WHERE host_addr = ?1 ORDER BY rowid"))?;
        let rows = stmt.query_map(params![host_addr], decode_row)?;
        collect(rows)
    }

    pub fn list_all(&self) -> Result<Vec<Container>, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY rowid"))?;
        let rows = stmt.query_map([], decode_row)?;
        collect(rows)
    }

}

const SELECT_COLUMNS: &str = r#"
    SELECT id, app_name, process_name, platform, image, build_image,
           host_addr, host_port, ip, status, status_updated_at
    FROM containers
"#;

fn decode_row(row: &Row<'_>) -> rusqlite::Result<Result<Container, StoreError>> {
    let id: String = row.get(0)?;
    let status_text: String = row.get(9)?;
    let ts: i64 = row.get(10)?;
    let status = Status::parse(&status_text);
    let decoded = match status {
        Some(status) => Ok(Container {
            id: id.clone(),
            app_name: row.get(1)?,
            process_name: row.get(2)?,
            platform: row.get(3)?,
            image: row.get(4)?,
            build_image: row.get(5)?,
            host_addr: row.get(6)?,
            host_port: row.get(7)?,
            ip: row.get(8)?,
            status,
            status_updated_at: decode_timestamp(ts),
        }),
        None => Err(StoreError::Corrupt {
            id,
            reason: format!("unknown status {status_text:?}"),
        }),
    };
    Ok(decoded)
}

fn decode_timestamp(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<Result<Container, StoreError>>>,
) -> Result<Vec<Container>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn record(id: &str, app: &str, process: &str, status: Status) -> Container {
        Container {
            id: id.to_string(),
            app_name: app.to_string(),
            process_name: process.to_string(),
            platform: "python".to_string(),
            image: format!("slipway/app-{app}:v1"),
            build_image: None,
            host_addr: "10.0.0.1".to_string(),
            host_port: String::new(),
            ip: String::new(),
            status,
            status_updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_get_update_remove() {
        let store = Storage::open_in_memory().unwrap().containers();
        let mut cont = record("c1", "myapp", "web", Status::Building);
        store.insert(&cont).unwrap();

        let fetched = store.get("c1").unwrap();
        assert_eq!(fetched.app_name, "myapp");
        assert_eq!(fetched.status, Status::Building);

        cont.status = Status::Started;
        cont.ip = "172.17.0.2".to_string();
        cont.host_port = "49153".to_string();
        store.update(&cont).unwrap();
        let fetched = store.get("c1").unwrap();
        assert_eq!(fetched.status, Status::Started);
        assert_eq!(fetched.host_port, "49153");

        store.remove("c1").unwrap();
        assert!(matches!(store.get("c1"), Err(StoreError::NotFound(_))));
        // Idempotent removal.
        store.remove("c1").unwrap();
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let store = Storage::open_in_memory().unwrap().containers();
        let cont = record("nope", "myapp", "web", Status::Building);
        assert!(matches!(store.update(&cont), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.set_status("nope", Status::Error),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_by_app_with_process_and_status_filters() {
        let store = Storage::open_in_memory().unwrap().containers();
        store.insert(&record("c1", "impius", "web", Status::Started)).unwrap();
        store.insert(&record("c2", "impius", "worker", Status::Started)).unwrap();
        store.insert(&record("c3", "impius", "web", Status::Stopped)).unwrap();
        store.insert(&record("c4", "other", "web", Status::Started)).unwrap();

        let all = store.list_by_app("impius", None, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "c1");

        let web = store.list_by_app("impius", Some("web"), None).unwrap();
        assert_eq!(web.len(), 2);

        let started_web = store
            .list_by_app("impius", Some("web"), Some(&[Status::Started]))
            .unwrap();
        assert_eq!(started_web.len(), 1);
        assert_eq!(started_web[0].id, "c1");
    }

    #[test]
    fn test_list_by_host() {
        let store = Storage::open_in_memory().unwrap().containers();
        let mut a = record("c1", "app1", "web", Status::Started);
        a.host_addr = "10.0.0.9".to_string();
        store.insert(&a).unwrap();
        store.insert(&record("c2", "app2", "web", Status::Started)).unwrap();

        let on_host = store.list_by_host("10.0.0.9").unwrap();
        assert_eq!(on_host.len(), 1);
        assert_eq!(on_host[0].id, "c1");
    }

    #[test]
    fn test_set_network() {
        let store = Storage::open_in_memory().unwrap().containers();
        store.insert(&record("c1", "makea", "web", Status::Started)).unwrap();
        store.set_network("c1", "127.0.0.9", "9999").unwrap();
        let fetched = store.get("c1").unwrap();
        assert_eq!(fetched.ip, "127.0.0.9");
        assert_eq!(fetched.host_port, "9999");
    }
}
