//! REST calls on one node observed through another node's REST surface.

mod common;

use std::time::Duration;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use peer_ring_kv::http::router;
use tower::ServiceExt;

use common::{eventually, TestCluster};

#[tokio::test]
async fn put_on_alpha_is_readable_on_beta_and_gamma() -> Result<()> {
    let cluster = TestCluster::start(&[("alpha", 0), ("beta", 1), ("gamma", 2)], false).await?;

    let response = router(cluster.node("alpha").store())
        .oneshot(
            Request::post("/put")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"Key":"color","Value":"red"}"#))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    for id in ["beta", "gamma"] {
        let store = cluster.node(id).store();
        eventually(Duration::from_secs(5), || store.get("color").is_some()).await?;

        let response = router(store)
            .oneshot(Request::get("/get/color").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await?;
        assert_eq!(&body[..], b"red");
    }

    let response = router(cluster.node("beta").store())
        .oneshot(Request::delete("/delete/color").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let alpha = cluster.node("alpha").store();
    eventually(Duration::from_secs(5), || alpha.get("color").is_none()).await?;
    let response = router(alpha)
        .oneshot(Request::get("/get/color").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    cluster.shutdown().await;
    Ok(())
}
