use std::{sync::Arc, time::Duration};

use http::{Method, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    json_api::{JsonApiConfig, KubeJsonApi},
    kube_api::{builtin, ApiEndpoint, WatchError, WatchEvent, WatchHandle, WatchOptions},
    registry::ObjectStore,
    testing::{FakeTransport, Reply},
    ApiRegistry, KubeApi, KubeObject, ResourceDescriptor,
};

const PODS: &str = "/api/v1/namespaces/default/pods";

type Received = Result<WatchEvent<KubeObject>, WatchError>;

struct Store(Arc<ApiEndpoint>);

impl ObjectStore for Store {
    fn api(&self) -> Arc<ApiEndpoint> {
        Arc::clone(&self.0)
    }
}

fn pods(transport: &Arc<FakeTransport>) -> KubeApi {
    let json = Arc::new(KubeJsonApi::new(
        JsonApiConfig::new(""),
        Arc::clone(transport) as _,
    ));
    KubeApi::new(json, builtin("Pod").unwrap()).unwrap()
}

fn event(kind: &str, name: &str, resource_version: &str) -> Value {
    json!({
        "type": kind,
        "object": {
            "kind": "Pod",
            "metadata": {"name": name, "namespace": "default", "resourceVersion": resource_version},
        },
    })
}

fn watch(api: &KubeApi, options: WatchOptions) -> (WatchHandle, mpsc::UnboundedReceiver<Received>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = api.watch(options, move |received| {
        let _ = tx.send(received);
    });
    (handle, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Received>) -> Received {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a watch callback")
        .expect("watch callback dropped")
}

async fn finished(handle: &WatchHandle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("watch did not end");
}

#[tokio::test]
async fn watch_reconnects_from_last_resource_version() {
    let transport = FakeTransport::new();
    transport.route(Method::GET, PODS, Reply::lines([event("ADDED", "a", "5")]));
    transport.route(Method::GET, PODS, Reply::open([event("MODIFIED", "a", "6")]));
    let api = pods(&transport);

    let (handle, mut rx) = watch(&api, WatchOptions::new());
    assert!(matches!(next(&mut rx).await, Ok(WatchEvent::Added(pod)) if pod.name() == "a"));
    assert!(matches!(next(&mut rx).await, Ok(WatchEvent::Modified(_))));
    assert_eq!(handle.id(), "pod-1");

    handle.stop_and_wait().await;
    assert_eq!(
        transport.urls(),
        vec![
            format!("{PODS}?watch=1&resourceVersion="),
            format!("{PODS}?watch=1&resourceVersion=5"),
        ]
    );
}

#[tokio::test]
async fn malformed_lines_do_not_end_the_watch() {
    let transport = FakeTransport::new();
    transport.route(
        Method::GET,
        PODS,
        Reply::open([
            "{\"type\": ".to_owned(),
            event("ADDED", "b", "9").to_string(),
        ]),
    );
    let api = pods(&transport);

    let (handle, mut rx) = watch(&api, WatchOptions::new().namespace(""));
    assert!(matches!(next(&mut rx).await, Err(WatchError::Parse(_))));
    assert!(matches!(next(&mut rx).await, Ok(WatchEvent::Added(_))));
    assert!(!handle.is_finished());

    handle.stop();
    handle.stop();
    finished(&handle).await;
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn undecodable_line_is_reported_and_skipped() {
    let transport = FakeTransport::new();
    let added = format!("{}\n", event("ADDED", "c", "11"));
    transport.route(
        Method::GET,
        PODS,
        Reply::open_raw([b"\xff\xfe garbage\n".to_vec(), added.into_bytes()]),
    );
    let api = pods(&transport);

    let (handle, mut rx) = watch(&api, WatchOptions::new());
    assert!(matches!(next(&mut rx).await, Err(WatchError::Parse(_))));
    assert!(matches!(next(&mut rx).await, Ok(WatchEvent::Added(pod)) if pod.name() == "c"));
    assert!(!handle.is_finished());

    handle.stop_and_wait().await;
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn server_error_event_ends_the_watch() {
    let transport = FakeTransport::new();
    transport.route(
        Method::GET,
        "/api/v1/namespaces/web/pods",
        Reply::open([json!({
            "type": "ERROR",
            "object": {
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "too old resource version: 1 (40)",
                "reason": "Expired",
                "code": 410,
            },
        })]),
    );
    let api = pods(&transport);

    let (handle, mut rx) = watch(
        &api,
        WatchOptions::new().namespace("web").resource_version("1"),
    );
    let Err(WatchError::Status(status)) = next(&mut rx).await else {
        panic!("expected a status error");
    };
    assert_eq!(status.code, 410);

    finished(&handle).await;
    handle.stop();
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn rejected_watch_reports_and_ends() {
    let transport = FakeTransport::new();
    let api = pods(&transport);

    let (handle, mut rx) = watch(&api, WatchOptions::new().all_namespaces());
    let Err(WatchError::Request(err)) = next(&mut rx).await else {
        panic!("expected a request error");
    };
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    finished(&handle).await;
    assert_eq!(transport.urls(), vec!["/api/v1/pods?watch=1&resourceVersion="]);
}

#[tokio::test]
async fn connection_failure_ends_the_watch() {
    let transport = FakeTransport::new();
    transport.route(Method::GET, PODS, Reply::Fail);
    let api = pods(&transport);

    let (handle, mut rx) = watch(&api, WatchOptions::new());
    let Err(WatchError::Request(err)) = next(&mut rx).await else {
        panic!("expected a request error");
    };
    assert_eq!(err.status(), None);
    finished(&handle).await;
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn caller_token_stops_the_watch() {
    let transport = FakeTransport::new();
    transport.route(Method::GET, PODS, Reply::open(Vec::<String>::new()));
    let api = pods(&transport);
    let token = CancellationToken::new();

    let (handle, _rx) = watch(&api, WatchOptions::new().cancel(token.clone()));
    transport.wait_for_requests(1).await;
    token.cancel();
    finished(&handle).await;
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_stream_is_replaced_after_timeout() {
    let transport = FakeTransport::new();
    transport.route(Method::GET, PODS, Reply::open(Vec::<String>::new()));
    let api = pods(&transport);

    let (handle, _rx) = watch(&api, WatchOptions::new().timeout_seconds(1));
    transport.wait_for_requests(2).await;
    handle.stop_and_wait().await;

    let urls = transport.urls();
    assert_eq!(urls[0], format!("{PODS}?watch=1&resourceVersion=&timeoutSeconds=1"));
    assert_eq!(urls[0], urls[1]);
}

#[tokio::test]
async fn negotiated_api_takes_its_store_along() {
    let transport = FakeTransport::new();
    transport.route(
        Method::GET,
        "/apis/networking.k8s.io/v1",
        Reply::json(
            StatusCode::OK,
            json!({"kind": "APIResourceList", "apiVersion": "v1", "groupVersion": "networking.k8s.io/v1", "resources": []}),
        ),
    );
    transport.route(
        Method::GET,
        "/apis/extensions/v1beta1",
        Reply::json(
            StatusCode::OK,
            json!({
                "kind": "APIResourceList",
                "apiVersion": "v1",
                "groupVersion": "extensions/v1beta1",
                "resources": [{
                    "name": "ingresses",
                    "singularName": "ingress",
                    "namespaced": true,
                    "kind": "Ingress",
                    "verbs": ["get"],
                }],
            }),
        ),
    );

    let registry = ApiRegistry::new();
    let json = Arc::new(KubeJsonApi::new(
        JsonApiConfig::new(""),
        Arc::clone(&transport) as _,
    ));
    let ingresses: KubeApi = KubeApi::registered(
        json,
        ResourceDescriptor::new("Ingress", true, "/apis/networking.k8s.io/v1/ingresses")
            .with_fallback_api_bases(["/apis/extensions/v1beta1/ingresses"])
            .with_preferred_version_check(),
        &registry,
    )
    .unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(Store(Arc::clone(ingresses.endpoint())));
    registry.register_store(Arc::clone(&store));
    assert!(registry.get_api("/apis/networking.k8s.io/v1/ingresses").is_some());

    // No group metadata is served, so the candidate's own version is kept.
    let missing = ingresses.get("edge", Some("lb")).await.unwrap_err();
    assert!(missing.is_not_found());
    assert_eq!(
        transport.urls().last().unwrap(),
        "/apis/extensions/v1beta1/namespaces/lb/ingresses/edge"
    );

    let api = registry.get_api("/apis/extensions/v1beta1/ingresses").unwrap();
    assert!(Arc::ptr_eq(&api, ingresses.endpoint()));
    let moved = registry.get_store("/apis/extensions/v1beta1/ingresses").unwrap();
    assert!(Arc::ptr_eq(&moved, &store));
}
