//! End-to-end: queued work fetching through the rate-limited session

use claudectx_throttle::{RequestPriority, RequestQueueManager};
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_queued_fetches_share_limiter_and_caps() {
    let (server, session) = common::setup_session(3).await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/api/conversations/conv-\d+$"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "name": "chat" })),
        )
        .expect(6)
        .mount(&server)
        .await;
    common::mount_throttled_then_ok(&server, "/api/conversations/slow", 1, Some("0")).await;

    let manager = RequestQueueManager::new(3).unwrap();
    manager.configure_queue("export", 2).unwrap();
    manager.start().unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let session = session.clone();
        let url = format!("{}/api/conversations/conv-{i}", server.uri());
        let priority = if i % 2 == 0 {
            RequestPriority::Normal
        } else {
            RequestPriority::High
        };
        handles.push(
            manager
                .enqueue(
                    move || async move {
                        let body: serde_json::Value = session.get(&url).await?.json().await?;
                        Ok::<_, anyhow::Error>(body["name"].as_str().unwrap_or_default().to_string())
                    },
                    priority,
                    "export",
                )
                .unwrap(),
        );
    }

    let slow_session = session.clone();
    let slow_url = format!("{}/api/conversations/slow", server.uri());
    let slow = manager
        .enqueue(
            move || async move {
                Ok::<_, anyhow::Error>(slow_session.get(&slow_url).await?.status().as_u16())
            },
            RequestPriority::Critical,
            "interactive",
        )
        .unwrap();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), "chat");
    }
    assert_eq!(slow.await.unwrap(), 200);

    let export = manager.metrics("export");
    assert_eq!(export.completed, 6);
    assert_eq!(export.failed, 0);
    assert_eq!(export.max_concurrent, 2);
    assert_eq!(manager.metrics("interactive").max_concurrent, 3);

    // 6 exports, plus the slow fetch that was throttled once
    let limiter = session.limiter().get_metrics(Some("conversations"));
    assert_eq!(limiter.total_requests, 8);
    assert_eq!(limiter.throttled_responses, 1);

    manager.stop().await;
}
