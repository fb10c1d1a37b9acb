use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use crate::error::{Error, Result};
use crate::queue::{BuildOutcome, BuildQueue, BuildRequest, BuildStatus, Project};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const REQUEST_COLUMNS: &str = "id, project_id, owner_id, requested_at, status, artifact_ref, \
     artifact_sha256, error, started_at, finished_at";

/// SQLite-backed queue. Each worker opens its own connection on the same
/// database file; claims serialize on the database write lock.
pub struct SqliteQueue {
    conn: Connection,
}

impl SqliteQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::msg(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            Error::msg(format!("failed to open queue at {}: {e}", path.display()))
        })?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                keystore_pass TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS build_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                requested_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                artifact_ref TEXT,
                artifact_sha256 TEXT,
                error TEXT,
                started_at INTEGER,
                finished_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS build_requests_status_order
                ON build_requests(status, requested_at, id);
            CREATE INDEX IF NOT EXISTS build_requests_owner_status
                ON build_requests(owner_id, status);
            CREATE INDEX IF NOT EXISTS build_requests_project
                ON build_requests(project_id, id);
            "#,
        )?;
        Ok(Self { conn })
    }

    fn write_tx(&mut self) -> Result<Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<BuildRequest> {
    let status: String = row.get(4)?;
    let status = status.parse::<BuildStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(e.to_string())),
        )
    })?;
    Ok(BuildRequest {
        id: row.get(0)?,
        project_id: row.get(1)?,
        owner_id: row.get(2)?,
        requested_at: row.get(3)?,
        status,
        artifact_ref: row.get(5)?,
        artifact_sha256: row.get(6)?,
        error: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        keystore_pass: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn load_request(conn: &Connection, id: i64) -> Result<Option<BuildRequest>> {
    let sql = format!("SELECT {REQUEST_COLUMNS} FROM build_requests WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id], request_from_row)
        .optional()?)
}

impl BuildQueue for SqliteQueue {
    fn register_project(&mut self, project: &Project) -> Result<()> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO projects (id, owner_id, name, keystore_pass, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project.id,
                project.owner_id,
                project.name,
                project.keystore_pass,
                project.created_at
            ],
        )?;
        if changed == 0 {
            return Err(Error::validation(format!(
                "project '{}' already exists",
                project.id
            )));
        }
        Ok(())
    }

    fn project(&self, project_id: &str) -> Result<Option<Project>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, owner_id, name, keystore_pass, created_at FROM projects WHERE id = ?1",
                params![project_id],
                project_from_row,
            )
            .optional()?)
    }

    fn remove_project(&mut self, project_id: &str) -> Result<bool> {
        let tx = self.write_tx()?;
        let building: i64 = tx.query_row(
            "SELECT COUNT(*) FROM build_requests WHERE project_id = ?1 AND status = 'building'",
            params![project_id],
            |row| row.get(0),
        )?;
        if building > 0 {
            return Err(Error::validation(format!(
                "project '{project_id}' has a build in progress"
            )));
        }
        tx.execute(
            "DELETE FROM build_requests WHERE project_id = ?1",
            params![project_id],
        )?;
        let removed = tx.execute("DELETE FROM projects WHERE id = ?1", params![project_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn submit(&mut self, project_id: &str, owner_id: &str) -> Result<BuildRequest> {
        let tx = self.write_tx()?;
        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM build_requests
             WHERE owner_id = ?1 AND status IN ('queued', 'building')",
            params![owner_id],
            |row| row.get(0),
        )?;
        if in_flight > 0 {
            return Err(Error::AdmissionDenied {
                owner_id: owner_id.to_string(),
            });
        }
        tx.execute(
            "INSERT INTO build_requests (project_id, owner_id, requested_at, status)
             VALUES (?1, ?2, ?3, 'queued')",
            params![project_id, owner_id, now_millis()],
        )?;
        let id = tx.last_insert_rowid();
        let req = load_request(&tx, id)?
            .ok_or_else(|| Error::msg(format!("build request {id} vanished after insert")))?;
        tx.commit()?;
        Ok(req)
    }

    fn claim_next(&mut self) -> Result<Option<BuildRequest>> {
        let tx = self.write_tx()?;
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM build_requests r
             WHERE r.status = 'queued'
               AND NOT EXISTS (
                   SELECT 1 FROM build_requests b
                   WHERE b.owner_id = r.owner_id AND b.status = 'building'
               )
             ORDER BY r.requested_at, r.id
             LIMIT 1"
        );
        let Some(mut req) = tx.query_row(&sql, [], request_from_row).optional()? else {
            return Ok(None);
        };
        let started = now_millis();
        tx.execute(
            "UPDATE build_requests SET status = 'building', started_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![req.id, started],
        )?;
        tx.commit()?;
        req.status = BuildStatus::Building;
        req.started_at = Some(started);
        Ok(Some(req))
    }

    fn complete(&mut self, id: i64, outcome: &BuildOutcome) -> Result<()> {
        let (artifact_ref, sha256, error) = match outcome {
            BuildOutcome::Succeeded {
                artifact_ref,
                artifact_sha256,
            } => (Some(artifact_ref.as_str()), Some(artifact_sha256.as_str()), None),
            BuildOutcome::Failed { reason } => (None, None, Some(reason.as_str())),
        };
        let tx = self.write_tx()?;
        let changed = tx.execute(
            "UPDATE build_requests
             SET status = ?2, artifact_ref = ?3, artifact_sha256 = ?4, error = ?5, finished_at = ?6
             WHERE id = ?1 AND status = 'building'",
            params![
                id,
                outcome.status().as_str(),
                artifact_ref,
                sha256,
                error,
                now_millis()
            ],
        )?;
        if changed == 0 {
            match load_request(&tx, id)? {
                None => return Err(Error::not_found(format!("build request {id}"))),
                Some(current) => tracing::warn!(
                    request_id = id,
                    status = %current.status,
                    "ignoring completion of a request that is not building"
                ),
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: i64) -> Result<Option<BuildRequest>> {
        load_request(&self.conn, id)
    }

    fn list_for_project(&self, project_id: &str) -> Result<Vec<BuildRequest>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM build_requests WHERE project_id = ?1 ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id], request_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Barrier};

    use rusqlite::params;

    use super::SqliteQueue;
    use crate::error::Error;
    use crate::queue::{BuildOutcome, BuildQueue, BuildStatus, Project};

    fn project(id: &str, owner: &str) -> Project {
        Project {
            id: id.into(),
            owner_id: owner.into(),
            name: format!("{id} app"),
            keystore_pass: "secret".into(),
            created_at: 0,
        }
    }

    // Bypasses admission so tests can stage several queued rows per owner.
    fn enqueue_raw(q: &SqliteQueue, project_id: &str, owner: &str, at: i64) -> i64 {
        q.conn
            .execute(
                "INSERT INTO build_requests (project_id, owner_id, requested_at, status)
                 VALUES (?1, ?2, ?3, 'queued')",
                params![project_id, owner, at],
            )
            .unwrap();
        q.conn.last_insert_rowid()
    }

    #[test]
    fn project_round_trip_and_duplicate_rejected() {
        let mut q = SqliteQueue::in_memory().unwrap();
        q.register_project(&project("P1", "u1")).unwrap();
        assert_eq!(q.project("P1").unwrap(), Some(project("P1", "u1")));
        assert_eq!(q.project("nope").unwrap(), None);
        assert!(matches!(
            q.register_project(&project("P1", "u2")),
            Err(Error::ValidationFailed(_))
        ));
    }

    #[test]
    fn remove_project_refuses_while_building() {
        let mut q = SqliteQueue::in_memory().unwrap();
        q.register_project(&project("P1", "u1")).unwrap();
        let req = q.submit("P1", "u1").unwrap();
        q.claim_next().unwrap();
        assert!(q.remove_project("P1").is_err());

        q.complete(req.id, &BuildOutcome::Failed { reason: "x".into() })
            .unwrap();
        assert!(q.remove_project("P1").unwrap());
        assert!(!q.remove_project("P1").unwrap());
        assert_eq!(q.project("P1").unwrap(), None);
        assert!(q.list_for_project("P1").unwrap().is_empty());
    }

    #[test]
    fn submit_denies_second_in_flight_request_per_owner() {
        let mut q = SqliteQueue::in_memory().unwrap();
        let first = q.submit("P1", "u1").unwrap();
        assert_eq!(first.status, BuildStatus::Queued);

        let err = q.submit("P2", "u1").unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { ref owner_id } if owner_id == "u1"));

        // Other owners are unaffected.
        q.submit("P3", "u2").unwrap();

        let claimed = q.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert!(q.submit("P1", "u1").is_err(), "building still counts as in flight");

        q.complete(
            first.id,
            &BuildOutcome::Failed {
                reason: "boom".into(),
            },
        )
        .unwrap();
        q.submit("P1", "u1").unwrap();
    }

    #[test]
    fn claims_follow_request_order() {
        let mut q = SqliteQueue::in_memory().unwrap();
        let b = enqueue_raw(&q, "P2", "u2", 20);
        let a = enqueue_raw(&q, "P1", "u1", 10);
        let c = enqueue_raw(&q, "P3", "u3", 20);

        let order: Vec<i64> = std::iter::from_fn(|| q.claim_next().unwrap().map(|r| r.id)).collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn owner_with_building_request_is_skipped() {
        let mut q = SqliteQueue::in_memory().unwrap();
        let first = enqueue_raw(&q, "P1", "u1", 1);
        let second = enqueue_raw(&q, "P2", "u1", 2);
        let other = enqueue_raw(&q, "P3", "u2", 3);

        assert_eq!(q.claim_next().unwrap().unwrap().id, first);
        assert_eq!(q.claim_next().unwrap().unwrap().id, other);
        assert!(q.claim_next().unwrap().is_none());

        q.complete(
            first,
            &BuildOutcome::Succeeded {
                artifact_ref: "projects/P1/app.apk".into(),
                artifact_sha256: "ab".into(),
            },
        )
        .unwrap();
        let next = q.claim_next().unwrap().unwrap();
        assert_eq!(next.id, second);
        assert_eq!(next.status, BuildStatus::Building);
        assert!(next.started_at.is_some());
    }

    #[test]
    fn complete_is_monotone() {
        let mut q = SqliteQueue::in_memory().unwrap();
        let req = q.submit("P1", "u1").unwrap();

        // Not yet claimed: completion is ignored.
        q.complete(
            req.id,
            &BuildOutcome::Failed {
                reason: "early".into(),
            },
        )
        .unwrap();
        assert_eq!(q.get(req.id).unwrap().unwrap().status, BuildStatus::Queued);

        q.claim_next().unwrap().unwrap();
        q.complete(
            req.id,
            &BuildOutcome::Succeeded {
                artifact_ref: "projects/P1/app.apk".into(),
                artifact_sha256: "ff".into(),
            },
        )
        .unwrap();
        q.complete(
            req.id,
            &BuildOutcome::Failed {
                reason: "late".into(),
            },
        )
        .unwrap();

        let done = q.get(req.id).unwrap().unwrap();
        assert_eq!(done.status, BuildStatus::Succeeded);
        assert_eq!(done.artifact_ref.as_deref(), Some("projects/P1/app.apk"));
        assert_eq!(done.error, None);
        assert!(done.finished_at.is_some());

        assert!(q.complete(9999, &BuildOutcome::Failed { reason: "x".into() }).unwrap_err().is_not_found());
    }

    #[test]
    fn list_for_project_returns_history_in_order() {
        let mut q = SqliteQueue::in_memory().unwrap();
        let a = q.submit("P1", "u1").unwrap();
        q.claim_next().unwrap();
        q.complete(a.id, &BuildOutcome::Failed { reason: "x".into() })
            .unwrap();
        let b = q.submit("P1", "u1").unwrap();
        q.submit("P2", "u2").unwrap();

        let ids: Vec<i64> = q.list_for_project("P1").unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn concurrent_workers_never_share_a_claim() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let db = tmp.path().join("queue.db");
        let seeded = {
            let q = SqliteQueue::open(&db).unwrap();
            let mut ids = BTreeSet::new();
            for n in 0..24 {
                // Three requests per owner, interleaved.
                ids.insert(enqueue_raw(&q, &format!("P{n}"), &format!("u{}", n % 8), n));
            }
            ids
        };

        let workers = 6;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let db = db.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut q = SqliteQueue::open(&db).unwrap();
                    barrier.wait();
                    let mut mine = Vec::new();
                    let mut idle_rounds = 0;
                    while idle_rounds < 50 {
                        match q.claim_next().unwrap() {
                            Some(req) => {
                                idle_rounds = 0;
                                let busy: i64 = q
                                    .conn
                                    .query_row(
                                        "SELECT COUNT(*) FROM build_requests
                                         WHERE owner_id = ?1 AND status = 'building'",
                                        params![req.owner_id],
                                        |row| row.get(0),
                                    )
                                    .unwrap();
                                assert_eq!(busy, 1, "owner {} building twice", req.owner_id);
                                q.complete(
                                    req.id,
                                    &BuildOutcome::Succeeded {
                                        artifact_ref: format!("projects/{}/app.apk", req.project_id),
                                        artifact_sha256: "00".into(),
                                    },
                                )
                                .unwrap();
                                mine.push(req.id);
                            }
                            None => {
                                idle_rounds += 1;
                                std::thread::sleep(std::time::Duration::from_millis(2));
                            }
                        }
                    }
                    mine
                })
            })
            .collect();

        let mut claimed = Vec::new();
        for h in handles {
            claimed.extend(h.join().expect("worker thread"));
        }
        let unique: BTreeSet<i64> = claimed.iter().copied().collect();
        assert_eq!(unique.len(), claimed.len(), "a request was claimed twice");
        assert_eq!(unique, seeded);
    }
}
