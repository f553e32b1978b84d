use crate::metrics::AdmissionMetrics;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission, DynamicObject};
use thiserror::Error;
use topology_labeler_core::{self as core, Decision, Operation, Store, TopologyLabeler};
use tracing::{debug, info, trace, warn};

/// Serves admission reviews for pod bindings.
#[derive(Clone)]
pub struct Admission<S> {
    labeler: TopologyLabeler<S>,
    metrics: AdmissionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

const MUTATE_PATH: &str = "/mutate";

type Review = admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = admission::AdmissionResponse;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl<S> tower::Service<Request<hyper::body::Incoming>> for Admission<S>
where
    S: Store + Clone + 'static,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != MUTATE_PATH {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            json_response(admission.review(review).await)
        })
    }
}

impl<S: Store> Admission<S> {
    pub fn new(labeler: TopologyLabeler<S>, metrics: AdmissionMetrics) -> Self {
        Self { labeler, metrics }
    }

    async fn review(&self, review: Review) -> Review {
        let rsp = match review.try_into() {
            Ok(req) => {
                debug!(?req);
                self.admit(req).await
            }
            Err(error) => {
                warn!(%error, "Invalid admission request");
                AdmissionResponse::invalid(error)
            }
        };
        debug!(?rsp);
        rsp.into_review()
    }

    async fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        let req = match to_request(req) {
            Ok(req) => req,
            Err(error) => {
                info!(%error, "Failed to encode admission object");
                let decision = Decision::Denied {
                    code: 400,
                    message: error.to_string(),
                };
                self.metrics.observe(&decision);
                return respond(rsp, decision);
            }
        };

        let decision = self.labeler.admit(&req).await;
        self.metrics.observe(&decision);
        respond(rsp, decision)
    }
}

/// The classified kind is the one the client requested, which differs from
/// `kind` when the request was converted between API versions.
fn to_request(req: AdmissionRequest) -> Result<core::AdmissionRequest, serde_json::Error> {
    let kind = req.request_kind.as_ref().unwrap_or(&req.kind).kind.clone();
    let operation = match req.operation {
        admission::Operation::Create => Operation::Create,
        admission::Operation::Update => Operation::Update,
        admission::Operation::Delete => Operation::Delete,
        admission::Operation::Connect => Operation::Connect,
    };
    let object = req.object.map(serde_json::to_value).transpose()?;
    Ok(core::AdmissionRequest {
        kind,
        operation,
        namespace: req.namespace,
        name: req.name,
        object,
    })
}

fn respond(mut rsp: AdmissionResponse, decision: Decision) -> AdmissionResponse {
    match decision {
        Decision::Allowed(reason) => {
            rsp.result.code = 200;
            rsp.result.reason = reason.to_string();
            rsp.result.message = reason.to_string();
            rsp
        }
        Decision::Denied { code, message } => {
            let mut rsp = rsp.deny(message);
            rsp.result.code = code;
            rsp
        }
    }
}

fn json_response(rsp: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::core::v1::{Node, Pod},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };
    use prometheus_client::registry::Registry;
    use serde_json::json;
    use topology_labeler_core::{Config, MemoryStore, ObjectKey};

    fn mk_admission(store: MemoryStore) -> Admission<MemoryStore> {
        let labeler = TopologyLabeler::new(store, Config::default());
        Admission::new(labeler, AdmissionMetrics::register(&mut Registry::default()))
    }

    fn mk_review(kind: &str, operation: &str, object: serde_json::Value) -> Review {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "0df28fbd-5f5f-4c7f-8e9e-5a6a3a9e2a11",
                "kind": { "group": "", "version": "v1", "kind": kind },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "subResource": "binding",
                "requestKind": { "group": "", "version": "v1", "kind": kind },
                "requestResource": { "group": "", "version": "v1", "resource": "pods" },
                "requestSubResource": "binding",
                "name": "p1",
                "namespace": "ns",
                "operation": operation,
                "userInfo": { "username": "system:kube-scheduler" },
                "object": object,
                "oldObject": null,
                "dryRun": false,
            },
        }))
        .expect("review must parse")
    }

    fn mk_binding(target_kind: &str, target_name: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Binding",
            "metadata": { "name": "p1", "namespace": "ns" },
            "target": { "apiVersion": "v1", "kind": target_kind, "name": target_name },
        })
    }

    fn mk_store() -> MemoryStore {
        let store = MemoryStore::default();
        store.insert(&Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                labels: Some(
                    [
                        ("topology.kubernetes.io/zone", "us-1a"),
                        ("topology.kubernetes.io/region", "us"),
                        ("app", "x"),
                    ]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        });
        store.insert(&Pod {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                name: Some("p1".to_string()),
                labels: Some(
                    [("app".to_string(), "y".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        });
        store
    }

    fn response(review: Review) -> AdmissionResponse {
        review.response.expect("review must have a response")
    }

    #[tokio::test]
    async fn labels_bound_pod() {
        let store = mk_store();
        let admission = mk_admission(store.clone());

        let rsp = response(
            admission
                .review(mk_review("Binding", "CREATE", mk_binding("Node", "n1")))
                .await,
        );
        assert!(rsp.allowed);
        assert_eq!(rsp.uid, "0df28fbd-5f5f-4c7f-8e9e-5a6a3a9e2a11");
        assert_eq!(rsp.result.code, 200);
        assert_eq!(rsp.result.message, "labeled");
        assert!(rsp.patch.is_none());
        assert_eq!(admission.metrics.count("true", "labeled"), 1);

        let pod = store
            .fetch::<Pod>(&ObjectKey::namespaced("ns", "p1"))
            .unwrap();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels["topology.kubernetes.io/zone"], "us-1a");
        assert_eq!(labels["topology.kubernetes.io/region"], "us");
        assert_eq!(labels["app"], "y");
        assert!(!labels.contains_key("topology.kubernetes.io/app"));
    }

    #[tokio::test]
    async fn skips_other_operations() {
        let store = mk_store();
        let admission = mk_admission(store.clone());

        let rsp = response(
            admission
                .review(mk_review("Binding", "UPDATE", mk_binding("Node", "n1")))
                .await,
        );
        assert!(rsp.allowed);
        assert_eq!(rsp.result.reason, "skipped");
        assert_eq!(store.gets(), 0);
    }

    #[tokio::test]
    async fn denies_unknown_node() {
        let store = mk_store();
        let admission = mk_admission(store.clone());

        let rsp = response(
            admission
                .review(mk_review("Binding", "CREATE", mk_binding("Node", "n2")))
                .await,
        );
        assert!(!rsp.allowed);
        assert_eq!(rsp.result.code, 400);
        assert!(rsp.result.message.contains("n2"), "{}", rsp.result.message);
        assert_eq!(store.patches(), 0);
        assert_eq!(admission.metrics.count("false", "client error"), 1);
    }

    #[tokio::test]
    async fn denies_malformed_binding() {
        let admission = mk_admission(mk_store());

        let rsp = response(
            admission
                .review(mk_review(
                    "Binding",
                    "CREATE",
                    json!({
                        "apiVersion": "v1",
                        "kind": "Binding",
                        "metadata": { "name": "p1", "namespace": "ns" },
                        "target": "n1",
                    }),
                ))
                .await,
        );
        assert!(!rsp.allowed);
        assert_eq!(rsp.result.code, 400);
    }
}
