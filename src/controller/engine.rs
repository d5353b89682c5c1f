//! Staged reconciliation shared by every kind
//!
//! Each invocation:
//! 1. Loads the subject fresh from the store; a missing subject is done
//! 2. Skips paused or filtered subjects
//! 3. Resolves the owning cluster, failure domain and a cloud session
//! 4. Commits the finalizer before any cloud call, then runs the kind's
//!    create path, or the delete path followed by finalizer removal
//! 5. Flushes the writes the kind queued, only if it succeeded
//!
//! Writes carry the resourceVersion the object was read at, so a write
//! racing another writer fails with a conflict instead of clobbering it.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use super::Context;
use crate::cloud::{CloudCredentials, LifecycleManager};
use crate::config::ControllerConfig;
use crate::crd::capi::CapiCluster;
use crate::crd::{CloudStackCluster, CloudStackFailureDomain, ResourceKind};
use crate::propagator::{is_paused, matches_watch_filter, owning_cluster_name, ReconcileRequest};
use crate::store::{finalizers_patch, with_resource_version, ResourceStore};
use crate::{Error, Result};

/// Result of a kind's create or delete path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; wait for the next change
    Done,
    /// Not converged yet; check again shortly
    NotReady(String),
}

/// A kind the engine can reconcile
#[async_trait]
pub trait Reconcilable: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    /// Kind handled
    const KIND: ResourceKind;

    /// Finalizer guarding the kind's external resources
    const FINALIZER: &'static str;

    /// Read the subject from the store
    async fn load(store: &dyn ResourceStore, namespace: &str, name: &str)
        -> Result<Option<Self>>;

    /// The CloudStackCluster this subject belongs to, when it is one
    fn as_cluster(&self) -> Option<&CloudStackCluster> {
        None
    }

    /// Name of the failure domain the subject lives in
    ///
    /// `None` means the subject makes no cloud calls of its own.
    fn failure_domain_name(&self) -> Option<&str>;

    /// Create or update path
    async fn reconcile_normal(&self, scope: &Scope<'_>) -> Result<Outcome>;

    /// Delete path; `Done` releases the finalizer
    async fn reconcile_delete(&self, scope: &Scope<'_>) -> Result<Outcome>;
}

/// Write queued by kind logic
#[derive(Clone, Debug)]
struct PendingWrite {
    kind: ResourceKind,
    namespace: String,
    name: String,
    resource_version: Option<String>,
    status: bool,
    body: Value,
}

/// Everything the shared stages resolved for one invocation
pub struct Scope<'a> {
    /// Resource store
    pub store: &'a dyn ResourceStore,
    /// Controller tunables
    pub config: &'a ControllerConfig,
    /// Owning infrastructure cluster
    pub cluster: CloudStackCluster,
    /// Owning CAPI cluster, when it exists
    pub capi_cluster: Option<CapiCluster>,
    failure_domain: Option<CloudStackFailureDomain>,
    lifecycle: Option<LifecycleManager>,
    writes: Mutex<Vec<PendingWrite>>,
}

impl<'a> Scope<'a> {
    /// Failure domain of the subject
    pub fn failure_domain(&self) -> Result<&CloudStackFailureDomain> {
        self.failure_domain
            .as_ref()
            .ok_or_else(|| Error::invariant("failure domain not resolved"))
    }

    /// Lifecycle manager bound to the failure domain's credentials
    pub fn lifecycle(&self) -> Result<&LifecycleManager> {
        self.lifecycle
            .as_ref()
            .ok_or_else(|| Error::invariant("no CloudStack session for this object"))
    }

    /// True if a cloud session was established
    pub fn has_session(&self) -> bool {
        self.lifecycle.is_some()
    }

    /// Namespace of the owning cluster, shared by every object of the cluster
    pub fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_default()
    }

    /// Value of the cluster-name label carried by the cluster's objects
    pub fn cluster_name(&self) -> String {
        owning_cluster_name(&self.cluster.metadata).unwrap_or_else(|| self.cluster.name_any())
    }

    /// Queue a merge patch of metadata and spec
    pub fn patch(&self, kind: ResourceKind, meta: &ObjectMeta, body: Value) {
        self.queue(kind, meta, false, body);
    }

    /// Queue a merge patch of the status subresource
    pub fn patch_status(&self, kind: ResourceKind, meta: &ObjectMeta, body: Value) {
        self.queue(kind, meta, true, body);
    }

    fn queue(&self, kind: ResourceKind, meta: &ObjectMeta, status: bool, body: Value) {
        let write = PendingWrite {
            kind,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            resource_version: meta.resource_version.clone(),
            status,
            body,
        };
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(write);
    }

    /// Write every queued patch in order
    ///
    /// Only the first write to an object carries the version it was read
    /// at; later writes to the same object follow a write that succeeded.
    async fn flush(&self) -> Result<()> {
        let writes = std::mem::take(
            &mut *self.writes.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut guarded: Vec<(ResourceKind, String, String)> = Vec::new();
        for write in writes {
            let key = (write.kind, write.namespace.clone(), write.name.clone());
            let body = if guarded.contains(&key) {
                write.body
            } else {
                guarded.push(key);
                let meta = ObjectMeta {
                    resource_version: write.resource_version,
                    ..Default::default()
                };
                with_resource_version(write.body, &meta)
            };
            if write.status {
                self.store
                    .patch_status(write.kind, &write.namespace, &write.name, &body)
                    .await?;
            } else {
                self.store
                    .patch(write.kind, &write.namespace, &write.name, &body)
                    .await?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Shared stages
// =============================================================================

async fn resolve_capi_cluster(
    store: &dyn ResourceStore,
    namespace: &str,
    meta: &ObjectMeta,
) -> Result<Option<CapiCluster>> {
    match owning_cluster_name(meta) {
        Some(name) => store.get_capi_cluster(namespace, &name).await,
        None => Ok(None),
    }
}

/// Owning CloudStackCluster: owner reference first, then the CAPI cluster's
/// infrastructure reference
async fn resolve_cluster(
    store: &dyn ResourceStore,
    namespace: &str,
    meta: &ObjectMeta,
    capi_cluster: Option<&CapiCluster>,
) -> Result<CloudStackCluster> {
    let owner = meta.owner_references.as_ref().and_then(|refs| {
        refs.iter()
            .find(|r| r.kind == ResourceKind::Cluster.as_str())
            .map(|r| r.name.clone())
    });
    let infra = capi_cluster
        .and_then(|c| c.spec.infrastructure_ref.as_ref())
        .filter(|r| r.kind == ResourceKind::Cluster.as_str())
        .map(|r| r.name.clone());

    let name = owner.or(infra).ok_or_else(|| {
        Error::invariant(format!(
            "{} has no owning {}",
            meta.name.as_deref().unwrap_or_default(),
            ResourceKind::Cluster
        ))
    })?;
    store.get_cluster(namespace, &name).await?.ok_or_else(|| {
        Error::invariant(format!(
            "owning {} {namespace}/{name} does not exist",
            ResourceKind::Cluster
        ))
    })
}

async fn resolve_failure_domain(
    store: &dyn ResourceStore,
    cluster: &CloudStackCluster,
    fd_name: &str,
) -> Result<Option<CloudStackFailureDomain>> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name =
        owning_cluster_name(&cluster.metadata).unwrap_or_else(|| cluster.name_any());
    Ok(store
        .list_failure_domains(&namespace, &cluster_name)
        .await?
        .into_iter()
        .find(|fd| fd.spec.name == fd_name))
}

async fn open_session(
    ctx: &Context,
    fd: &CloudStackFailureDomain,
) -> Result<LifecycleManager> {
    let secret_ref = &fd.spec.acs_endpoint;
    let namespace = if secret_ref.namespace.is_empty() {
        fd.namespace().unwrap_or_default()
    } else {
        secret_ref.namespace.clone()
    };
    let secret = ctx
        .store
        .get_secret(&namespace, &secret_ref.name)
        .await?
        .ok_or_else(|| Error::not_found("Secret", &namespace, &secret_ref.name))?;
    let credentials = CloudCredentials::from_secret(&secret)?;
    let client = ctx.sessions.connect(&credentials).await?;
    Ok(LifecycleManager::new(client))
}

// =============================================================================
// Pipeline
// =============================================================================

async fn run_stages<K: Reconcilable>(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Outcome> {
    let store = ctx.store.as_ref();

    let Some(subject) = K::load(store, namespace, name).await? else {
        debug!("object no longer exists");
        return Ok(Outcome::Done);
    };

    let capi_cluster = resolve_capi_cluster(store, namespace, subject.meta()).await?;
    if is_paused(subject.meta(), capi_cluster.as_ref()) {
        info!("reconciliation is paused");
        return Ok(Outcome::Done);
    }
    if !matches_watch_filter(subject.meta(), ctx.config.watch_filter.as_deref()) {
        debug!("object does not match the watch filter");
        return Ok(Outcome::Done);
    }

    let deleting = subject.meta().deletion_timestamp.is_some();
    let has_finalizer = subject.finalizers().iter().any(|f| f == K::FINALIZER);
    if deleting && !has_finalizer {
        return Ok(Outcome::Done);
    }

    match run_resolved(ctx, subject, capi_cluster, namespace, name).await {
        Err(e) if e.is_invariant() => {
            warn!(error = %e, "recording failure on status");
            let body = json!({ "status": { "failureMessage": e.to_string() } });
            if let Err(patch_err) = store.patch_status(K::KIND, namespace, name, &body).await {
                warn!(error = %patch_err, "failed to record failure message");
            }
            Err(e)
        }
        other => other,
    }
}

/// Shared stages and kind logic for a loaded, unpaused subject
async fn run_resolved<K: Reconcilable>(
    ctx: &Context,
    mut subject: K,
    capi_cluster: Option<CapiCluster>,
    namespace: &str,
    name: &str,
) -> Result<Outcome> {
    let store = ctx.store.as_ref();
    let deleting = subject.meta().deletion_timestamp.is_some();
    let has_finalizer = subject.finalizers().iter().any(|f| f == K::FINALIZER);

    let cluster = match subject.as_cluster() {
        Some(cluster) => cluster.clone(),
        None => resolve_cluster(store, namespace, subject.meta(), capi_cluster.as_ref()).await?,
    };

    let failure_domain = match subject.failure_domain_name() {
        Some(fd_name) => {
            let fd = resolve_failure_domain(store, &cluster, fd_name).await?;
            if fd.is_none() && !deleting {
                return Err(Error::invariant(format!(
                    "{} {fd_name} of cluster {} does not exist",
                    ResourceKind::FailureDomain,
                    cluster.name_any()
                )));
            }
            fd
        }
        None => None,
    };
    let lifecycle = match &failure_domain {
        Some(fd) => Some(open_session(ctx, fd).await?),
        None => None,
    };

    if !deleting && !has_finalizer {
        let mut finalizers = subject.finalizers().to_vec();
        finalizers.push(K::FINALIZER.to_string());
        store
            .patch(
                K::KIND,
                namespace,
                name,
                &finalizers_patch(subject.meta(), &finalizers),
            )
            .await?;
        debug!(finalizer = K::FINALIZER, "added finalizer");
        subject = match K::load(store, namespace, name).await? {
            Some(fresh) => fresh,
            None => return Ok(Outcome::Done),
        };
    }

    let scope = Scope {
        store,
        config: &ctx.config,
        cluster,
        capi_cluster,
        failure_domain,
        lifecycle,
        writes: Mutex::new(Vec::new()),
    };

    let result = if deleting {
        subject.reconcile_delete(&scope).await
    } else {
        subject.reconcile_normal(&scope).await
    };

    let outcome = result?;
    scope.flush().await?;
    if deleting && outcome == Outcome::Done {
        let remaining: Vec<String> = subject
            .finalizers()
            .iter()
            .filter(|f| *f != K::FINALIZER)
            .cloned()
            .collect();
        store
            .patch(
                K::KIND,
                namespace,
                name,
                &finalizers_patch(subject.meta(), &remaining),
            )
            .await?;
        info!("released finalizer");
    }
    Ok(outcome)
}

/// Reconcile one object of kind `K`
///
/// Entry point handed to the kube-runtime controller.
#[instrument(skip(obj, ctx), fields(kind = %K::KIND, name = %obj.name_any()))]
pub async fn reconcile<K: Reconcilable>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let request = ReconcileRequest::new(K::KIND, &namespace, &name);

    let outcome = tokio::time::timeout(
        ctx.config.reconcile_timeout,
        run_stages::<K>(&ctx, &namespace, &name),
    )
    .await
    .map_err(|_| Error::Timeout(request.to_string()))??;

    ctx.reset_failures(&request);
    match outcome {
        Outcome::Done => Ok(Action::await_change()),
        Outcome::NotReady(reason) => {
            info!(%reason, "not ready, requeueing");
            Ok(Action::requeue(ctx.config.not_ready_requeue))
        }
    }
}

/// Error policy for every controller
///
/// Conflicts requeue immediately without counting as a failure. Anything
/// else backs off exponentially per identity.
pub fn error_policy<K: Reconcilable>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let request = ReconcileRequest::new(
        K::KIND,
        obj.namespace().unwrap_or_default(),
        obj.name_any(),
    );
    if error.is_conflict() {
        debug!(object = %request, "write conflict, requeueing");
        return Action::requeue(ctx.config.conflict_requeue);
    }

    let failures = ctx.record_failure(&request);
    let delay = ctx.config.backoff_delay(failures);
    if error.is_retryable() {
        warn!(
            error = %error,
            object = %request,
            failures,
            delay_secs = delay.as_secs(),
            "reconciliation failed, retrying"
        );
    } else {
        // needs user action; keep retrying at the backoff pace
        error!(
            error = %error,
            object = %request,
            failures,
            delay_secs = delay.as_secs(),
            "reconciliation failed"
        );
    }
    Action::requeue(delay)
}
