mod common;

use std::time::Duration;

use common::{client_on_graph, server, TestClient};

#[tokio::test(flavor = "multi_thread")]
async fn test_fan_out_survives_broken_subscriber() {
    let state = server();
    let mut publisher = client_on_graph(&state, "news").await;
    let mut alice = client_on_graph(&state, "news").await;
    let mut bob = client_on_graph(&state, "news").await;

    assert_eq!(publisher.cmd("cchan wire").await.len(), 2);
    assert_eq!(publisher.status("cchan wire").await, "-already_exist");
    assert_eq!(alice.status("subscribe wire").await, "-ok");
    assert_eq!(bob.status("subscribe wire").await, "-ok");

    assert_eq!(publisher.status(r#"publish wire {"n":1}"#).await, "-ok");
    assert_eq!(alice.next_event().await, r#"! wire {"n":1}"#);
    assert_eq!(bob.next_event().await, r#"! wire {"n":1}"#);

    bob.break_connection();
    let graph = state.graph("news").unwrap();
    let mut n = 2;
    loop {
        assert_eq!(publisher.status(&format!(r#"publish wire {{"n":{}}}"#, n)).await, "-ok");
        assert_eq!(alice.next_event().await, format!(r#"! wire {{"n":{}}}"#, n));
        if graph.subscriber_count("wire") == Some(1) {
            break;
        }
        assert!(n < 100, "dead subscriber never dropped");
        n += 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscription_management() {
    let state = server();
    let mut c = client_on_graph(&state, "g").await;
    assert_eq!(c.status("subscribe nowhere").await, "-not_found");
    assert_eq!(c.status("publish nowhere {}").await, "-not_found");

    c.cmd("cchan alerts").await;
    c.status("subscribe alerts").await;
    let graph = state.graph("g").unwrap();
    assert_eq!(graph.subscriber_count("alerts"), Some(1));
    assert_eq!(c.status("unsubscribe alerts").await, "-ok");
    assert_eq!(graph.subscriber_count("alerts"), Some(0));

    assert!(c.status("publish alerts {oops").await.starts_with("-err BAD_JSON"));
    assert_eq!(c.json("qp _type:c").await["results"][0]["name"], "alerts");

    assert_eq!(c.status("dchan alerts").await, "-ok");
    assert_eq!(c.status("dchan alerts").await, "-not_found");
    assert_eq!(c.status("publish alerts {}").await, "-not_found");
    assert!(c.json("qp _type:c").await["results"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_removes_subscriptions() {
    let state = server();
    let mut owner = client_on_graph(&state, "g").await;
    owner.cmd("cchan feed").await;

    let mut guest = TestClient::connect(&state).await;
    guest.status("use g").await;
    guest.status("subscribe feed").await;
    let graph = state.graph("g").unwrap();
    assert_eq!(graph.subscriber_count("feed"), Some(1));
    assert_eq!(state.client_count(), 2);

    drop(guest);
    assert_eq!(graph.subscriber_count("feed"), Some(0));
    assert_eq!(state.client_count(), 1);
    assert_eq!(owner.status("publish feed {}").await, "-ok");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channels_are_per_graph() {
    let state = server();
    let mut left = client_on_graph(&state, "left").await;
    let mut right = client_on_graph(&state, "right").await;
    left.cmd("cchan shared").await;
    assert_eq!(right.status("subscribe shared").await, "-not_found");
    assert_eq!(right.cmd("cchan shared").await.len(), 2);
}
