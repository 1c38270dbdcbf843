use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use await_election::election::{ElectionState, ElectionStatus};
use await_election::health::HealthServer;

async fn fetch(url: &str) -> (u16, Value) {
    let resp = reqwest::get(url).await.expect("request");
    let code = resp.status().as_u16();
    (code, resp.json().await.expect("json body"))
}

fn leading_since(renewed: Instant) -> ElectionStatus {
    ElectionStatus {
        state: ElectionState::Leading,
        last_renewal: Some(renewed),
        observed_leader: Some("a".into()),
    }
}

#[tokio::test]
async fn leader_turns_unhealthy_when_renewals_stop() {
    let (tx, rx) = watch::channel(leading_since(Instant::now()));
    let server = HealthServer::new("127.0.0.1:0", rx, Duration::from_millis(300))
        .bind()
        .await
        .expect("bind");
    let url = format!("http://{}/", server.local_addr().expect("addr"));
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(shutdown.clone()));

    let (code, body) = fetch(&url).await;
    assert_eq!(code, 200);
    assert_eq!(body["status"], "ok");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (code, body) = fetch(&url).await;
    assert_eq!(code, 500);
    assert_eq!(body["status"], "expired");

    // any path answers the same
    let (code, _) = fetch(&format!("{url}healthz")).await;
    assert_eq!(code, 500);

    tx.send_replace(leading_since(Instant::now()));
    let (code, _) = fetch(&url).await;
    assert_eq!(code, 200);

    tx.send_replace(ElectionStatus::default());
    tokio::time::sleep(Duration::from_millis(500)).await;
    let (code, body) = fetch(&url).await;
    assert_eq!(code, 200);
    assert_eq!(body["status"], "ok");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("server did not stop")
        .expect("join")
        .expect("serve");
}
