//! Orka kubehub: a `ListerWatcher` backed by the Kubernetes API via kube.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind, TypeMeta, WatchEvent as KubeEvent},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use orka_core::{
    ExpectedType, ListOptions, ListResult, ListWatchError, ListerWatcher, Object, Status, TypeTag, WatchEvent,
    WatchOptions, WatchSender, WatchStream, RESOURCE_VERSION_ANY,
};
use tracing::{debug, info, warn};

/// kube rejects watch timeouts of 295s and above.
const MAX_WATCH_TIMEOUT_SECS: u64 = 290;
const WATCH_BUFFER: usize = 256;

/// Lists and watches one resource type, cluster-wide or in a namespace.
#[derive(Clone)]
pub struct KubeListerWatcher {
    api: Api<DynamicObject>,
    ar: ApiResource,
}

impl KubeListerWatcher {
    pub fn new(api: Api<DynamicObject>, ar: ApiResource) -> Self { Self { api, ar } }

    /// Resolve `v1/Kind` or `group/v1/Kind` through discovery and build the client.
    pub async fn for_gvk(gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "lister/watcher ready");
        Ok(Self::new(api, ar))
    }

    pub fn api_resource(&self) -> &ApiResource { &self.ar }

    /// Type descriptor matching every object this source produces.
    pub fn expected_type(&self) -> ExpectedType {
        ExpectedType::Tag(TypeTag::new(self.ar.api_version.clone(), self.ar.kind.clone()))
    }
}

#[async_trait]
impl ListerWatcher for KubeListerWatcher {
    async fn list(&self, opts: ListOptions) -> Result<ListResult, ListWatchError> {
        let lp = if opts.resource_version == RESOURCE_VERSION_ANY {
            ListParams::default().match_any()
        } else {
            ListParams::default().at(&opts.resource_version)
        };
        let list = self.api.list(&lp).await.map_err(map_kube_err)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        let items = list
            .items
            .into_iter()
            .map(|o| to_object(o, &self.ar))
            .collect::<Result<Vec<_>>>()
            .map_err(ListWatchError::Other)?;
        debug!(kind = %self.ar.kind, items = items.len(), resource_version = %resource_version, "listed");
        Ok(ListResult { items, resource_version })
    }

    async fn watch(&self, opts: WatchOptions) -> Result<WatchStream, ListWatchError> {
        let mut wp = WatchParams::default();
        if let Some(t) = opts.timeout {
            wp = wp.timeout(t.as_secs().clamp(1, MAX_WATCH_TIMEOUT_SECS) as u32);
        }
        let stream = self.api.watch(&wp, &opts.resource_version).await.map_err(map_kube_err)?.boxed();
        let (tx, w) = WatchStream::channel(WATCH_BUFFER);
        tokio::spawn(forward(stream, tx, self.ar.clone()));
        Ok(w)
    }
}

/// Pump kube watch events into `tx` until either side is done.
async fn forward(mut stream: BoxStream<'static, kube::Result<KubeEvent<DynamicObject>>>, tx: WatchSender, ar: ApiResource) {
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.stopped() => break,
            n = stream.try_next() => n,
        };
        match next {
            Ok(Some(ev)) => {
                if !tx.send(convert(ev, &ar)).await {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                counter!("kubehub_watch_decode_errors_total", 1);
                warn!(kind = %ar.kind, error = %e, "watch stream error, closing");
                break;
            }
        }
    }
    debug!(kind = %ar.kind, "watch forwarder done");
}

fn convert(ev: KubeEvent<DynamicObject>, ar: &ApiResource) -> WatchEvent {
    let (kind, res) = match ev {
        KubeEvent::Added(o) => ("ADDED", to_object(o, ar).map(WatchEvent::Added)),
        KubeEvent::Modified(o) => ("MODIFIED", to_object(o, ar).map(WatchEvent::Modified)),
        KubeEvent::Deleted(o) => ("DELETED", to_object(o, ar).map(WatchEvent::Deleted)),
        KubeEvent::Bookmark(b) => return WatchEvent::Bookmark { resource_version: b.metadata.resource_version },
        KubeEvent::Error(e) => return WatchEvent::Error(status_from(&e)),
    };
    res.unwrap_or_else(|e| {
        warn!(kind = %ar.kind, error = %e, "unable to decode watch object");
        WatchEvent::Unrecognized { kind: kind.to_string() }
    })
}

fn status_from(e: &ErrorResponse) -> Status { Status::new(e.code, e.reason.clone(), e.message.clone()) }

fn map_kube_err(e: kube::Error) -> ListWatchError {
    if let kube::Error::Api(resp) = &e {
        if resp.code == 410 {
            return ListWatchError::Gone(resp.message.clone());
        }
    }
    if let Some(classified) = ListWatchError::classify(&e) {
        return classified;
    }
    ListWatchError::Other(anyhow::Error::new(e))
}

fn to_object(mut o: DynamicObject, ar: &ApiResource) -> Result<Object> {
    if o.types.is_none() {
        o.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    let mut raw = serde_json::to_value(&o).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(Object::new(raw))
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}
