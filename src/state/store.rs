//! The embedded deployment history store
//!
//! A single-file SQLite database under `~/.sbkube/`. The orchestrator writes
//! through on every lifecycle transition so a crashed invocation still
//! leaves a readable record. History is append-only; nothing here deletes.

use crate::manifest;
use crate::state::models::*;
use crate::utils::errors::SbkubeError;
use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs::File;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deployments (
    id              TEXT PRIMARY KEY,
    cluster         TEXT NOT NULL,
    namespace       TEXT NOT NULL,
    status          TEXT NOT NULL,
    config_snapshot TEXT NOT NULL,
    rollback_of     TEXT,
    created_at      TEXT NOT NULL,
    completed_at    TEXT
);
CREATE INDEX IF NOT EXISTS idx_deployments_cluster_ns ON deployments(cluster, namespace);
CREATE INDEX IF NOT EXISTS idx_deployments_created ON deployments(created_at DESC);

CREATE TABLE IF NOT EXISTS app_deployments (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    deployment_id TEXT NOT NULL REFERENCES deployments(id),
    app_name      TEXT NOT NULL,
    app_type      TEXT NOT NULL,
    app_group     TEXT NOT NULL,
    status        TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,
    error         TEXT,
    UNIQUE(deployment_id, app_name)
);
CREATE INDEX IF NOT EXISTS idx_app_deployments_name ON app_deployments(app_name);
CREATE INDEX IF NOT EXISTS idx_app_deployments_group ON app_deployments(app_group);

CREATE TABLE IF NOT EXISTS deployed_resources (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    app_deployment_id INTEGER NOT NULL REFERENCES app_deployments(id),
    api_version       TEXT NOT NULL,
    kind              TEXT NOT NULL,
    name              TEXT NOT NULL,
    namespace         TEXT,
    action            TEXT NOT NULL,
    previous_state    TEXT,
    current_state     TEXT,
    checksum          TEXT
);
CREATE INDEX IF NOT EXISTS idx_deployed_resources_app ON deployed_resources(app_deployment_id);

CREATE TABLE IF NOT EXISTS helm_releases (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    app_deployment_id INTEGER NOT NULL REFERENCES app_deployments(id),
    release_name      TEXT NOT NULL,
    chart             TEXT NOT NULL,
    chart_version     TEXT,
    revision          INTEGER,
    values_json       TEXT NOT NULL,
    status            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_helm_releases_app ON helm_releases(app_deployment_id);
"#;

/// Store handle. Open is cheap; the writer lock is acquired separately and
/// held for the write scope (reads run lock-free).
pub struct StateStore {
    conn: Connection,
    lock_path: Option<PathBuf>,
}

/// Advisory writer lock; released on drop.
#[derive(Debug)]
pub struct WriterLock {
    _file: File,
}

impl StateStore {
    /// Open (creating if needed) the default store under `~/.sbkube/`.
    pub fn open_default() -> Result<Self> {
        Self::open(&crate::utils::paths::state_db_path()?)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open state store {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("failed to initialize state store schema")?;
        Ok(Self {
            conn,
            lock_path: Some(path.with_extension("db.lock")),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            lock_path: None,
        })
    }

    /// Take the writer lock. Errors (without blocking) when another process
    /// holds it.
    pub fn writer_lock(&self) -> Result<Option<WriterLock>> {
        let Some(lock_path) = &self.lock_path else {
            return Ok(None);
        };
        let file = File::create(lock_path)
            .with_context(|| format!("failed to create lock file {}", lock_path.display()))?;
        file.try_lock_exclusive()
            .map_err(|_| SbkubeError::state_locked(lock_path))?;
        Ok(Some(WriterLock { _file: file }))
    }

    // writes

    pub fn create_deployment(
        &self,
        cluster: &str,
        namespace: &str,
        config_snapshot: &str,
        rollback_of: Option<&str>,
    ) -> Result<DeploymentRecord> {
        let record = DeploymentRecord {
            id: Uuid::new_v4().to_string(),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            status: DeploymentStatus::Pending,
            config_snapshot: config_snapshot.to_string(),
            rollback_of: rollback_of.map(str::to_string),
            created_at: Utc::now().to_rfc3339(),
            completed_at: None,
        };
        self.conn.execute(
            "INSERT INTO deployments (id, cluster, namespace, status, config_snapshot, rollback_of, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.cluster,
                record.namespace,
                record.status.as_str(),
                record.config_snapshot,
                record.rollback_of,
                record.created_at,
            ],
        )?;
        Ok(record)
    }

    pub fn set_deployment_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        completed: bool,
    ) -> Result<()> {
        if completed {
            self.conn.execute(
                "UPDATE deployments SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), deployment_id],
            )?;
        } else {
            self.conn.execute(
                "UPDATE deployments SET status = ?1 WHERE id = ?2",
                params![status.as_str(), deployment_id],
            )?;
        }
        Ok(())
    }

    /// Begin an app record (status `in_progress`, started now).
    pub fn begin_app(
        &self,
        deployment_id: &str,
        app_name: &str,
        app_type: &str,
        app_group: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO app_deployments (deployment_id, app_name, app_type, app_group, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                deployment_id,
                app_name,
                app_type,
                app_group,
                DeploymentStatus::InProgress.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Record an app that never started (dependency failed).
    pub fn record_skipped_app(
        &self,
        deployment_id: &str,
        app_name: &str,
        app_type: &str,
        app_group: &str,
        reason: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO app_deployments (deployment_id, app_name, app_type, app_group, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                deployment_id,
                app_name,
                app_type,
                app_group,
                DeploymentStatus::Skipped.as_str(),
                reason,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_app(
        &self,
        app_deployment_id: i64,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE app_deployments SET status = ?1, completed_at = ?2, error = ?3 WHERE id = ?4",
            params![
                status.as_str(),
                Utc::now().to_rfc3339(),
                error,
                app_deployment_id
            ],
        )?;
        Ok(())
    }

    pub fn record_resource(
        &self,
        app_deployment_id: i64,
        resource: &crate::manifest::ResourceRef,
        action: ResourceAction,
        previous_state: Option<&str>,
        current_state: Option<&str>,
    ) -> Result<i64> {
        let checksum = current_state.map(manifest::checksum);
        self.conn.execute(
            "INSERT INTO deployed_resources
             (app_deployment_id, api_version, kind, name, namespace, action, previous_state, current_state, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                app_deployment_id,
                resource.api_version,
                resource.kind,
                resource.name,
                resource.namespace,
                action.as_str(),
                previous_state,
                current_state,
                checksum,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_helm_release(
        &self,
        app_deployment_id: i64,
        release_name: &str,
        chart: &str,
        chart_version: Option<&str>,
        revision: Option<u64>,
        values_json: &str,
        status: DeploymentStatus,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO helm_releases
             (app_deployment_id, release_name, chart, chart_version, revision, values_json, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                app_deployment_id,
                release_name,
                chart,
                chart_version,
                revision.map(|r| r as i64),
                values_json,
                status.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // queries

    pub fn deployment(&self, id: &str) -> Result<Option<DeploymentRecord>> {
        self.conn
            .query_row(
                "SELECT id, cluster, namespace, status, config_snapshot, rollback_of, created_at, completed_at
                 FROM deployments WHERE id = ?1",
                params![id],
                deployment_from_row,
            )
            .optional()
            .context("failed to query deployment")
    }

    /// Find a deployment by id prefix (the CLI accepts shortened UUIDs).
    pub fn deployment_by_prefix(&self, prefix: &str) -> Result<Option<DeploymentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, cluster, namespace, status, config_snapshot, rollback_of, created_at, completed_at
             FROM deployments WHERE id LIKE ?1 || '%' ORDER BY created_at DESC LIMIT 2",
        )?;
        let records: Vec<DeploymentRecord> = stmt
            .query_map(params![prefix], deployment_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        match records.len() {
            0 => Ok(None),
            1 => Ok(Some(records.into_iter().next().expect("len checked"))),
            _ => Err(SbkubeError::new(
                crate::utils::errors::ErrorKind::State,
                format!("deployment id prefix '{}' is ambiguous", prefix),
            )
            .with_hint("use more characters of the id from 'sbkube history'")
            .into()),
        }
    }

    /// History listing, newest first, with optional filters.
    pub fn list_deployments(
        &self,
        cluster: Option<&str>,
        namespace: Option<&str>,
        app: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>> {
        let mut sql = String::from(
            "SELECT DISTINCT d.id, d.cluster, d.namespace, d.status, d.config_snapshot, d.rollback_of, d.created_at, d.completed_at
             FROM deployments d",
        );
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if app.is_some() {
            sql.push_str(" JOIN app_deployments a ON a.deployment_id = d.id");
            clauses.push(format!("a.app_name = ?{}", args.len() + 1));
            args.push(app.unwrap().to_string());
        }
        if let Some(cluster) = cluster {
            clauses.push(format!("d.cluster = ?{}", args.len() + 1));
            args.push(cluster.to_string());
        }
        if let Some(namespace) = namespace {
            clauses.push(format!("d.namespace = ?{}", args.len() + 1));
            args.push(namespace.to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY d.created_at DESC LIMIT {}", limit));

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), deployment_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(records)
    }

    pub fn apps_of(&self, deployment_id: &str) -> Result<Vec<AppDeploymentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, deployment_id, app_name, app_type, app_group, status, started_at, completed_at, error
             FROM app_deployments WHERE deployment_id = ?1 ORDER BY id",
        )?;
        let records = stmt
            .query_map(params![deployment_id], app_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(records)
    }

    pub fn resources_of(&self, app_deployment_id: i64) -> Result<Vec<DeployedResourceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, app_deployment_id, api_version, kind, name, namespace, action, previous_state, current_state, checksum
             FROM deployed_resources WHERE app_deployment_id = ?1 ORDER BY id",
        )?;
        let records = stmt
            .query_map(params![app_deployment_id], resource_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(records)
    }

    pub fn helm_release_of(&self, app_deployment_id: i64) -> Result<Option<HelmReleaseRecord>> {
        self.conn
            .query_row(
                "SELECT id, app_deployment_id, release_name, chart, chart_version, revision, values_json, status
                 FROM helm_releases WHERE app_deployment_id = ?1 ORDER BY id DESC LIMIT 1",
                params![app_deployment_id],
                release_from_row,
            )
            .optional()
            .context("failed to query helm release")
    }

    /// Namespace of the most recent successful deployment containing the
    /// given app group, across all namespaces. This is the whole interface
    /// between documents at runtime.
    pub fn latest_success_namespace_for_group(&self, group: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT d.namespace FROM deployments d
                 JOIN app_deployments a ON a.deployment_id = d.id
                 WHERE a.app_group = ?1
                   AND a.status = 'success'
                   AND d.status IN ('success', 'partially_failed')
                 ORDER BY d.created_at DESC LIMIT 1",
                params![group],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to query group history")
    }

    /// Latest deployment that touched an app, newest first.
    pub fn latest_for_app(&self, app_name: &str) -> Result<Option<DeploymentRecord>> {
        self.conn
            .query_row(
                "SELECT d.id, d.cluster, d.namespace, d.status, d.config_snapshot, d.rollback_of, d.created_at, d.completed_at
                 FROM deployments d
                 JOIN app_deployments a ON a.deployment_id = d.id
                 WHERE a.app_name = ?1
                 ORDER BY d.created_at DESC LIMIT 1",
                params![app_name],
                deployment_from_row,
            )
            .optional()
            .context("failed to query app history")
    }

    /// Current status: the newest app record per (cluster, namespace, app).
    pub fn current_app_statuses(
        &self,
        cluster: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Vec<AppDeploymentRecord>> {
        let mut sql = String::from(
            "SELECT a.id, a.deployment_id, a.app_name, a.app_type, a.app_group, a.status, a.started_at, a.completed_at, a.error
             FROM app_deployments a
             JOIN deployments d ON d.id = a.deployment_id
             WHERE a.id IN (
                 SELECT MAX(a2.id) FROM app_deployments a2
                 JOIN deployments d2 ON d2.id = a2.deployment_id
                 GROUP BY d2.cluster, d2.namespace, a2.app_name
             )",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(cluster) = cluster {
            args.push(cluster.to_string());
            sql.push_str(&format!(" AND d.cluster = ?{}", args.len()));
        }
        if let Some(namespace) = namespace {
            args.push(namespace.to_string());
            sql.push_str(&format!(" AND d.namespace = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY a.app_group, a.app_name");
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), app_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(records)
    }
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<DeploymentRecord> {
    Ok(DeploymentRecord {
        id: row.get(0)?,
        cluster: row.get(1)?,
        namespace: row.get(2)?,
        status: parse_status(row.get::<_, String>(3)?),
        config_snapshot: row.get(4)?,
        rollback_of: row.get(5)?,
        created_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<AppDeploymentRecord> {
    Ok(AppDeploymentRecord {
        id: row.get(0)?,
        deployment_id: row.get(1)?,
        app_name: row.get(2)?,
        app_type: row.get(3)?,
        app_group: row.get(4)?,
        status: parse_status(row.get::<_, String>(5)?),
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        error: row.get(8)?,
    })
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<DeployedResourceRecord> {
    let action: String = row.get(6)?;
    Ok(DeployedResourceRecord {
        id: row.get(0)?,
        app_deployment_id: row.get(1)?,
        api_version: row.get(2)?,
        kind: row.get(3)?,
        name: row.get(4)?,
        namespace: row.get(5)?,
        action: action.parse().unwrap_or(ResourceAction::Apply),
        previous_state: row.get(7)?,
        current_state: row.get(8)?,
        checksum: row.get(9)?,
    })
}

fn release_from_row(row: &Row<'_>) -> rusqlite::Result<HelmReleaseRecord> {
    Ok(HelmReleaseRecord {
        id: row.get(0)?,
        app_deployment_id: row.get(1)?,
        release_name: row.get(2)?,
        chart: row.get(3)?,
        chart_version: row.get(4)?,
        revision: row.get::<_, Option<i64>>(5)?.map(|r| r as u64),
        values: row.get(6)?,
        status: parse_status(row.get::<_, String>(7)?),
    })
}

fn parse_status(raw: String) -> DeploymentStatus {
    raw.parse().unwrap_or(DeploymentStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ResourceRef;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn sample_resource() -> ResourceRef {
        ResourceRef {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            name: "web".into(),
            namespace: Some("demo".into()),
        }
    }

    #[test]
    fn test_deployment_lifecycle() {
        let store = store();
        let deployment = store
            .create_deployment("prod", "demo", "{}", None)
            .unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Pending);

        store
            .set_deployment_status(&deployment.id, DeploymentStatus::InProgress, false)
            .unwrap();
        store
            .set_deployment_status(&deployment.id, DeploymentStatus::Success, true)
            .unwrap();

        let loaded = store.deployment(&deployment.id).unwrap().unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Success);
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn test_app_and_release_records() {
        let store = store();
        let deployment = store.create_deployment("prod", "demo", "{}", None).unwrap();
        let app_id = store
            .begin_app(&deployment.id, "redis", "helm", "root")
            .unwrap();
        store
            .record_helm_release(
                app_id,
                "redis",
                "bitnami/redis",
                Some("17.13.2"),
                Some(1),
                "{\"replicas\":3}",
                DeploymentStatus::Success,
            )
            .unwrap();
        store
            .finish_app(app_id, DeploymentStatus::Success, None)
            .unwrap();

        let apps = store.apps_of(&deployment.id).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].status, DeploymentStatus::Success);

        let release = store.helm_release_of(app_id).unwrap().unwrap();
        assert_eq!(release.chart_version.as_deref(), Some("17.13.2"));
        assert_eq!(release.revision, Some(1));
    }

    #[test]
    fn test_resource_checksum_recorded() {
        let store = store();
        let deployment = store.create_deployment("prod", "demo", "{}", None).unwrap();
        let app_id = store.begin_app(&deployment.id, "web", "yaml", "root").unwrap();
        store
            .record_resource(
                app_id,
                &sample_resource(),
                ResourceAction::Update,
                Some("replicas: 3"),
                Some("replicas: 5"),
            )
            .unwrap();
        let resources = store.resources_of(app_id).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].action, ResourceAction::Update);
        assert_eq!(resources[0].previous_state.as_deref(), Some("replicas: 3"));
        assert_eq!(
            resources[0].checksum.as_deref(),
            Some(crate::manifest::checksum("replicas: 5").as_str())
        );
    }

    #[test]
    fn test_group_lookup_is_namespace_neutral() {
        let store = store();
        // infra group deployed to namespace "infra"
        let d1 = store.create_deployment("prod", "infra", "{}", None).unwrap();
        let app = store.begin_app(&d1.id, "traefik", "helm", "a000_infra").unwrap();
        store.finish_app(app, DeploymentStatus::Success, None).unwrap();
        store
            .set_deployment_status(&d1.id, DeploymentStatus::Success, true)
            .unwrap();

        // query while "working in" another namespace entirely
        let namespace = store
            .latest_success_namespace_for_group("a000_infra")
            .unwrap();
        assert_eq!(namespace.as_deref(), Some("infra"));
        assert_eq!(
            store.latest_success_namespace_for_group("a999_ghost").unwrap(),
            None
        );
    }

    #[test]
    fn test_failed_group_does_not_satisfy() {
        let store = store();
        let d1 = store.create_deployment("prod", "infra", "{}", None).unwrap();
        let app = store.begin_app(&d1.id, "traefik", "helm", "a000_infra").unwrap();
        store
            .finish_app(app, DeploymentStatus::Failed, Some("boom"))
            .unwrap();
        store
            .set_deployment_status(&d1.id, DeploymentStatus::Failed, true)
            .unwrap();
        assert_eq!(
            store.latest_success_namespace_for_group("a000_infra").unwrap(),
            None
        );
    }

    #[test]
    fn test_history_filters_and_limit() {
        let store = store();
        for i in 0..5 {
            let d = store
                .create_deployment("prod", if i % 2 == 0 { "a" } else { "b" }, "{}", None)
                .unwrap();
            let app = store.begin_app(&d.id, "web", "yaml", "root").unwrap();
            store.finish_app(app, DeploymentStatus::Success, None).unwrap();
            store
                .set_deployment_status(&d.id, DeploymentStatus::Success, true)
                .unwrap();
        }
        assert_eq!(store.list_deployments(None, None, None, 3).unwrap().len(), 3);
        assert_eq!(
            store
                .list_deployments(None, Some("a"), None, 10)
                .unwrap()
                .len(),
            3
        );
        assert_eq!(
            store
                .list_deployments(Some("prod"), None, Some("web"), 10)
                .unwrap()
                .len(),
            5
        );
        assert!(store
            .list_deployments(Some("other"), None, None, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_deployment_by_prefix() {
        let store = store();
        let d = store.create_deployment("prod", "demo", "{}", None).unwrap();
        let prefix = &d.id[..8];
        let found = store.deployment_by_prefix(prefix).unwrap().unwrap();
        assert_eq!(found.id, d.id);
        assert!(store.deployment_by_prefix("zzzzzzzz").unwrap().is_none());
    }

    #[test]
    fn test_rollback_reference() {
        let store = store();
        let original = store.create_deployment("prod", "demo", "{}", None).unwrap();
        let rollback = store
            .create_deployment("prod", "demo", "{}", Some(&original.id))
            .unwrap();
        let loaded = store.deployment(&rollback.id).unwrap().unwrap();
        assert_eq!(loaded.rollback_of.as_deref(), Some(original.id.as_str()));
    }

    #[test]
    fn test_current_app_statuses_latest_wins() {
        let store = store();
        for status in [DeploymentStatus::Success, DeploymentStatus::Failed] {
            let d = store.create_deployment("prod", "demo", "{}", None).unwrap();
            let app = store.begin_app(&d.id, "web", "yaml", "root").unwrap();
            store.finish_app(app, status, None).unwrap();
            store.set_deployment_status(&d.id, status, true).unwrap();
        }
        let current = store.current_app_statuses(Some("prod"), Some("demo")).unwrap();
        assert_eq!(current.len(), 1);
        // the second (failed) deployment is the current state
        assert_eq!(current[0].status, DeploymentStatus::Failed);
    }

    #[test]
    fn test_writer_lock_in_memory_is_noop() {
        let store = store();
        assert!(store.writer_lock().unwrap().is_none());
    }

    #[test]
    fn test_writer_lock_exclusive_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployments.db");
        let store1 = StateStore::open(&path).unwrap();
        let store2 = StateStore::open(&path).unwrap();
        let lock = store1.writer_lock().unwrap();
        assert!(lock.is_some());
        // second holder fails fast with the taxonomy error
        let err = store2.writer_lock().unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        assert_eq!(sb.kind, crate::utils::errors::ErrorKind::State);
        drop(lock);
        assert!(store2.writer_lock().unwrap().is_some());
    }
}
