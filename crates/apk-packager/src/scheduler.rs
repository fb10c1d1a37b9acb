//! Build scheduling.
//!
//! [`BuildService`] is the producer side: it registers projects and admits
//! build requests. [`Worker`] is the consumer side: it claims one request at a
//! time from the shared queue and drives it through compile, package, sign and
//! upload inside a fresh execution session.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::callback::Notifier;
use crate::compiler::{CommandCompiler, ProjectCompiler, render_html};
use crate::config::{BackendKind, BackendSettings, Settings};
use crate::error::{Error, Result};
use crate::executor::{BackendFactory, SessionFactory};
use crate::keystore::{P12Options, create_p12_keystore, generate_password};
use crate::packager::{AppIdentity, BuilderOptions, Packager};
use crate::queue::{BuildOutcome, BuildQueue, BuildRequest, BuildStatus, Project, SqliteQueue};
use crate::signer::{KEYSTORE_PATH, Signer};
use crate::store::{
    APK_FILE, AssetStore, ICON_FILE, KEYSTORE_FILE, SOURCE_FILE, open_store, project_key,
    project_prefix,
};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Assets and metadata for a project whose keystore already exists.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub source: Vec<u8>,
    pub icon: Option<Vec<u8>>,
    pub keystore: Vec<u8>,
    pub keystore_pass: String,
}

pub struct BuildService<Q> {
    queue: Q,
    store: Arc<dyn AssetStore>,
}

impl<Q: BuildQueue> BuildService<Q> {
    pub fn new(queue: Q, store: Arc<dyn AssetStore>) -> Self {
        Self { queue, store }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    /// Uploads the project's assets, then records it.
    pub fn register_project(&mut self, new: NewProject) -> Result<Project> {
        if new.id.trim().is_empty() || new.id.contains('/') {
            return Err(Error::validation(format!("invalid project id '{}'", new.id)));
        }
        if new.name.trim().is_empty() {
            return Err(Error::validation("project name must not be empty"));
        }
        if self.queue.project(&new.id)?.is_some() {
            return Err(Error::validation(format!("project '{}' already exists", new.id)));
        }

        let project = Project {
            id: new.id,
            owner_id: new.owner_id,
            name: new.name,
            keystore_pass: new.keystore_pass,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let uploaded = self.upload_assets(&project.id, &new.source, new.icon.as_deref(), &new.keystore);
        let registered = uploaded.and_then(|()| self.queue.register_project(&project));
        if let Err(e) = registered {
            if let Err(cleanup) = self.store.delete(&project_prefix(&project.id)) {
                tracing::warn!(project_id = %project.id, error = %cleanup, "failed to clean up project assets");
            }
            return Err(e);
        }
        tracing::info!(project_id = %project.id, owner_id = %project.owner_id, "registered project");
        Ok(project)
    }

    /// Registers a project with a freshly generated keystore and password.
    pub fn create_project(
        &mut self,
        owner_id: &str,
        name: &str,
        source: Vec<u8>,
        icon: Option<Vec<u8>>,
    ) -> Result<Project> {
        let keystore_pass = generate_password()?;
        let keystore = create_p12_keystore(&P12Options::new("key0", &keystore_pass))?;
        self.register_project(NewProject {
            id: new_project_id(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            source,
            icon,
            keystore,
            keystore_pass,
        })
    }

    fn upload_assets(
        &self,
        project_id: &str,
        source: &[u8],
        icon: Option<&[u8]>,
        keystore: &[u8],
    ) -> Result<()> {
        self.store.put(&project_key(project_id, SOURCE_FILE), source)?;
        if let Some(icon) = icon {
            self.store.put(&project_key(project_id, ICON_FILE), icon)?;
        }
        self.store.put(&project_key(project_id, KEYSTORE_FILE), keystore)?;
        Ok(())
    }

    /// Admits a build request for `project_id`.
    ///
    /// Fails with `ValidationFailed` when the project or its required assets
    /// are missing, and with `AdmissionDenied` when its owner already has a
    /// request queued or building. Nothing is enqueued on failure.
    pub fn submit(&mut self, project_id: &str) -> Result<BuildRequest> {
        let project = self
            .queue
            .project(project_id)?
            .ok_or_else(|| Error::validation(format!("unknown project '{project_id}'")))?;
        let has_source = self.store.exists(&project_key(project_id, SOURCE_FILE))?;
        let has_keystore = self.store.exists(&project_key(project_id, KEYSTORE_FILE))?;
        if !has_source || !has_keystore {
            return Err(Error::validation(format!(
                "project '{project_id}' is missing its source or keystore"
            )));
        }
        let req = self.queue.submit(project_id, &project.owner_id)?;
        tracing::info!(
            request_id = req.id,
            project_id,
            owner_id = %project.owner_id,
            "build request queued"
        );
        Ok(req)
    }

    pub fn builds(&self, project_id: &str) -> Result<Vec<BuildRequest>> {
        self.queue.list_for_project(project_id)
    }

    /// Removes the project record, its build history and every stored asset.
    pub fn delete_project(&mut self, project_id: &str) -> Result<()> {
        if !self.queue.remove_project(project_id)? {
            return Err(Error::not_found(format!("project '{project_id}'")));
        }
        self.store.delete(&project_prefix(project_id))?;
        tracing::info!(project_id, "deleted project");
        Ok(())
    }
}

fn new_project_id() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("p{:x}{:x}", nanos, std::process::id())
}

/// Reverse-domain identifier an owner's project is packaged under.
pub fn app_id_for(prefix: &str, owner_id: &str, project_id: &str) -> String {
    format!("{}.{owner_id}.{project_id}", prefix.trim_end_matches('.'))
}

/// Everything a worker needs besides its own queue connection.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn AssetStore>,
    pub compiler: Arc<dyn ProjectCompiler>,
    pub sessions: Arc<dyn SessionFactory>,
    pub builder: BuilderOptions,
    pub app_id_prefix: String,
    pub notifier: Option<Notifier>,
    pub poll_interval: Duration,
}

impl WorkerContext {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            store: Arc::from(open_store(&settings.store)?),
            compiler: Arc::new(CommandCompiler::from_settings(&settings.compiler)?),
            sessions: Arc::new(BackendFactory::new(settings.backend.clone())),
            builder: BuilderOptions::from(&settings.builder),
            app_id_prefix: settings.worker.app_id_prefix.clone(),
            notifier: Notifier::from_settings(&settings.callback)?,
            poll_interval: Duration::from_millis(settings.queue.poll_interval_ms.max(1)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Idle,
    Built { request_id: i64, status: BuildStatus },
}

pub struct Worker<Q> {
    queue: Q,
    ctx: WorkerContext,
}

impl<Q: BuildQueue> Worker<Q> {
    pub fn new(queue: Q, ctx: WorkerContext) -> Self {
        Self { queue, ctx }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Claims and builds at most one request.
    ///
    /// Pipeline failures are recorded on the request and do not surface here;
    /// only queue errors do.
    pub fn run_once(&mut self) -> Result<Poll> {
        let Some(req) = self.queue.claim_next()? else {
            return Ok(Poll::Idle);
        };
        let span = tracing::info_span!(
            "build",
            request_id = req.id,
            project_id = %req.project_id,
            owner_id = %req.owner_id
        );
        let _enter = span.enter();
        tracing::info!("claimed build request");

        let outcome = match self.build(&req) {
            Ok(outcome) => {
                tracing::info!("build succeeded");
                outcome
            }
            Err(e) => {
                tracing::error!(error = %e, "build failed");
                BuildOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        // If this fails the request stays in building until an operator finalizes it.
        self.queue.complete(req.id, &outcome)?;

        let status = outcome.status();
        if let Some(notifier) = &self.ctx.notifier {
            if let Err(e) = notifier.notify(&req.project_id, status == BuildStatus::Succeeded) {
                tracing::warn!(error = %e, "build callback failed");
            }
        }
        Ok(Poll::Built {
            request_id: req.id,
            status,
        })
    }

    fn fetch_required(&self, project_id: &str, file: &str) -> Result<Vec<u8>> {
        let key = project_key(project_id, file);
        self.ctx
            .store
            .get(&key)?
            .ok_or_else(|| Error::validation(format!("missing asset {key}")))
    }

    fn build(&self, req: &BuildRequest) -> Result<BuildOutcome> {
        let project = self
            .queue
            .project(&req.project_id)?
            .ok_or_else(|| Error::not_found(format!("project '{}'", req.project_id)))?;
        let source = self.fetch_required(&project.id, SOURCE_FILE)?;
        let keystore = self.fetch_required(&project.id, KEYSTORE_FILE)?;
        let icon = self.ctx.store.get(&project_key(&project.id, ICON_FILE))?;

        let app = AppIdentity {
            app_id: app_id_for(&self.ctx.app_id_prefix, &project.owner_id, &project.id),
            app_name: project.name.clone(),
            scratch_html: render_html(self.ctx.compiler.as_ref(), &source)?,
            icon,
        };

        let apk = {
            let mut session = self.ctx.sessions.open()?;
            let mut packager = Packager::new(self.ctx.builder.clone(), &mut *session);
            let signed = package_and_sign(&mut packager, &app, &keystore, &project.keystore_pass);
            reset_workspace(&mut packager);
            signed?
        };

        let sha256 = hex::encode(Sha256::digest(&apk));
        let artifact_ref = self
            .ctx
            .store
            .put(&project_key(&project.id, APK_FILE), &apk)?;
        tracing::info!(artifact = %artifact_ref, sha256 = %sha256, bytes = apk.len(), "stored apk");
        Ok(BuildOutcome::Succeeded {
            artifact_ref,
            artifact_sha256: sha256,
        })
    }

    /// Polls until `stop` is set. Idle polls sleep for the poll interval;
    /// queue errors back off exponentially.
    pub fn run_forever(&mut self, stop: &AtomicBool) {
        let mut backoff = self.ctx.poll_interval;
        while !stop.load(Ordering::Relaxed) {
            match self.run_once() {
                Ok(Poll::Built { .. }) => backoff = self.ctx.poll_interval,
                Ok(Poll::Idle) => {
                    backoff = self.ctx.poll_interval;
                    thread::sleep(self.ctx.poll_interval);
                }
                Err(e) => {
                    tracing::error!(error = %e, retry_in_ms = backoff.as_millis() as u64, "queue error");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

fn package_and_sign(
    packager: &mut Packager<'_>,
    app: &AppIdentity,
    keystore: &[u8],
    store_pass: &str,
) -> Result<Vec<u8>> {
    packager.init(app)?;
    packager.build()?;
    let signer = Signer::load(packager.executor(), keystore, store_pass)?;
    packager.sign(&signer)
}

/// Drops the native project and the keystore so the next build in the same
/// template starts from scratch. Failures are logged, never returned.
fn reset_workspace(packager: &mut Packager<'_>) {
    if let Err(e) = packager.clear() {
        tracing::warn!(error = %e, "failed to remove native project");
    }
    if let Err(e) = packager.executor().remove(KEYSTORE_PATH) {
        tracing::warn!(error = %e, "failed to remove keystore");
    }
}

/// Host sessions all work in the one template directory, so only a single
/// worker may use them.
pub fn check_worker_count(backend: &BackendSettings, count: usize) -> Result<()> {
    if backend.kind == BackendKind::Host && count > 1 {
        return Err(Error::validation(format!(
            "host backend supports one worker, {count} requested"
        )));
    }
    Ok(())
}

/// Runs `count` workers on their own threads, each with its own connection
/// to the queue at `database`. Returns once every worker has stopped.
pub fn run_workers(
    count: usize,
    database: PathBuf,
    ctx: WorkerContext,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let mut handles = Vec::with_capacity(count);
    for n in 0..count.max(1) {
        let database = database.clone();
        let ctx = ctx.clone();
        let stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("worker-{n}"))
            .spawn(move || -> Result<()> {
                let queue = match SqliteQueue::open(&database) {
                    Ok(q) => q,
                    Err(e) => {
                        // The others would keep polling a database this one cannot open.
                        stop.store(true, Ordering::Relaxed);
                        return Err(e);
                    }
                };
                tracing::info!(worker = n, "worker started");
                Worker::new(queue, ctx).run_forever(&stop);
                Ok(())
            })
            .map_err(|e| Error::msg(format!("failed to spawn worker {n}: {e}")))?;
        handles.push(handle);
    }

    let mut first_err = None;
    for (n, handle) in handles.into_iter().enumerate() {
        let res = handle
            .join()
            .unwrap_or_else(|_| Err(Error::msg(format!("worker {n} panicked"))));
        if let Err(e) = res {
            tracing::error!(worker = n, error = %e, "worker exited with error");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::{app_id_for, check_worker_count};
    use crate::config::{BackendKind, BackendSettings};

    #[test]
    fn app_id_joins_prefix_owner_and_project() {
        assert_eq!(app_id_for("com.bytic", "u1", "P1"), "com.bytic.u1.P1");
        assert_eq!(app_id_for("com.bytic.", "u1", "P1"), "com.bytic.u1.P1");
    }

    #[test]
    fn host_backend_is_limited_to_one_worker() {
        let host = BackendSettings {
            kind: BackendKind::Host,
            ..BackendSettings::default()
        };
        check_worker_count(&host, 1).expect("single host worker");
        let err = check_worker_count(&host, 2).unwrap_err();
        assert!(err.to_string().contains("one worker"), "unexpected err: {err}");
        check_worker_count(&BackendSettings::default(), 4).expect("container workers");
    }
}
