use hyper::http;
use kube::{
    api::{GetParams, Patch, PatchParams},
    core::Request,
    Client,
};
use serde::de::DeserializeOwned;
use tokio::time;
use topology_labeler_core::{MergePatch, Object, ObjectKey, Store, StoreError};
use tracing::trace;

/// A [`Store`] backed by the Kubernetes API.
///
/// Every request is bounded by a timeout; a request that times out is
/// reported as a transport failure.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: time::Duration,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: Client, timeout: time::Duration) -> Self {
        Self { client, timeout }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        key: &ObjectKey,
        req: http::Request<Vec<u8>>,
    ) -> Result<T, StoreError> {
        trace!(method = %req.method(), uri = %req.uri(), "Sending request");
        match time::timeout(self.timeout, self.client.request::<T>(req)).await {
            Ok(Ok(obj)) => Ok(obj),
            Ok(Err(error)) => Err(store_error(kind, key, error)),
            Err(_) => Err(StoreError::Transport(
                format!("request timed out after {:?}", self.timeout).into(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn get<K: Object>(&self, key: &ObjectKey) -> Result<K, StoreError> {
        let url = <K as kube::Resource>::url_path(&(), key.namespace.as_deref());
        let req = Request::new(url)
            .get(&key.name, &GetParams::default())
            .map_err(|e| StoreError::Transport(e.into()))?;
        self.request(K::KIND, key, req).await
    }

    async fn patch<K: Object>(&self, object: &K, base: &K) -> Result<(), StoreError> {
        let key = ObjectKey::of(object);
        let patch = MergePatch::from_base(base, object)?;
        if patch.is_empty() {
            trace!(%key, "Skipping empty patch");
            return Ok(());
        }
        let url = <K as kube::Resource>::url_path(&(), key.namespace.as_deref());
        let req = Request::new(url)
            .patch(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(patch.into_value()),
            )
            .map_err(|e| StoreError::Transport(e.into()))?;
        self.request::<K>(K::KIND, &key, req).await?;
        Ok(())
    }
}

fn store_error(kind: &'static str, key: &ObjectKey, error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(status) if status.code == 404 => StoreError::NotFound {
            kind,
            key: key.clone(),
        },
        kube::Error::Api(status) if status.code == 409 => {
            StoreError::Conflict(status.message.clone())
        }
        error => StoreError::Transport(error.into()),
    }
}
