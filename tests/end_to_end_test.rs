//! Full-stack scenarios: real relay on an ephemeral port, real WebSocket
//! clients, real SQLite on both ends.

use std::time::Duration;

use pinch::client::model::{AutonomyLevel, ConnectionState, MessageState};
use pinch::client::SendOptions;

mod common;
use common::{connect_agent, reconnect_agent, spawn_relay, wait_until, TestAgent};

/// Drive the consent handshake until both sides are `active`.
async fn establish_connection(alice: &TestAgent, bob: &TestAgent) {
    alice
        .client
        .request_connection(&bob.address(), "alice", "hello")
        .await
        .unwrap();

    let bob_client = bob.client.clone();
    let alice_addr = alice.address();
    wait_until("bob to see the request", move || {
        let bob = bob_client.clone();
        let alice_addr = alice_addr.clone();
        async move {
            matches!(
                bob.pipeline().store().get_connection(&alice_addr).await.unwrap(),
                Some(conn) if conn.state == ConnectionState::PendingInbound
            )
        }
    })
    .await;

    bob.client.respond_connection(&alice.address(), true).await.unwrap();

    let alice_client = alice.client.clone();
    let bob_addr = bob.address();
    wait_until("alice to activate", move || {
        let alice = alice_client.clone();
        let bob_addr = bob_addr.clone();
        async move {
            matches!(
                alice.pipeline().store().get_connection(&bob_addr).await.unwrap(),
                Some(conn) if conn.state == ConnectionState::Active
            )
        }
    })
    .await;
}

// ─── S1: online round trip ────────────────────────────────────────────────────

#[tokio::test]
async fn online_round_trip_reaches_read_by_agent() {
    let relay = spawn_relay(|_| {}).await;
    let alice = connect_agent(&relay.url).await;
    let bob = connect_agent(&relay.url).await;

    assert!(alice.address().starts_with("pinch:"));
    assert!(alice.address().ends_with("@127.0.0.1"));
    assert_ne!(alice.address(), bob.address());

    establish_connection(&alice, &bob).await;
    bob.client
        .pipeline()
        .store()
        .set_autonomy(&alice.address(), AutonomyLevel::FullAuto)
        .await
        .unwrap();

    let message_id = alice
        .client
        .send_message(&bob.address(), "hello", SendOptions::default())
        .await
        .unwrap();

    // Bob receives, reads (full_auto), confirms; Alice's record advances
    // on the verified confirmation.
    let alice_client = alice.client.clone();
    let id = message_id.clone();
    wait_until("confirmation to land", move || {
        let alice = alice_client.clone();
        let id = id.clone();
        async move {
            matches!(
                alice.pipeline().store().get_message(&id).await.unwrap(),
                Some(record) if record.state == MessageState::ReadByAgent
            )
        }
    })
    .await;

    let bob_record = bob
        .client
        .pipeline()
        .store()
        .messages_for(&alice.address())
        .await
        .unwrap();
    assert_eq!(bob_record.len(), 1);
    assert_eq!(bob_record[0].content, "hello");
    assert_eq!(bob_record[0].state, MessageState::ReadByAgent);

    alice.client.close();
    bob.client.close();
}

// ─── S2: offline store-and-forward ────────────────────────────────────────────

#[tokio::test]
async fn offline_messages_flush_in_order_with_was_stored() {
    let relay = spawn_relay(|_| {}).await;
    let alice = connect_agent(&relay.url).await;
    let bob = connect_agent(&relay.url).await;
    establish_connection(&alice, &bob).await;
    bob.client
        .pipeline()
        .store()
        .set_autonomy(&alice.address(), AutonomyLevel::FullAuto)
        .await
        .unwrap();

    // Bob drops off.
    bob.client.close();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut ids = Vec::new();
    for i in 1..=3 {
        ids.push(
            alice
                .client
                .send_message(&bob.address(), &format!("m{i}"), SendOptions::default())
                .await
                .unwrap(),
        );
    }

    // Bob returns with the same identity and database.
    let bob_revived = reconnect_agent(&relay.url, &bob).await;
    assert_eq!(bob_revived.address(), bob.address());

    let bob_client = bob_revived.clone();
    let alice_addr = alice.address();
    wait_until("backlog to drain", move || {
        let bob = bob_client.clone();
        let alice_addr = alice_addr.clone();
        async move {
            bob.pipeline()
                .store()
                .messages_for(&alice_addr)
                .await
                .unwrap()
                .len()
                == 3
        }
    })
    .await;

    // Exact order m1, m2, m3.
    let records = bob_revived
        .pipeline()
        .store()
        .messages_for(&alice.address())
        .await
        .unwrap();
    let contents: Vec<&str> = records.iter().map(|r| r.content.as_str()).collect();
    assert_eq!(contents, vec!["m1", "m2", "m3"]);

    // Alice's records settle via stored-delivery confirmations.
    for id in &ids {
        let alice_client = alice.client.clone();
        let id = id.clone();
        wait_until("stored confirm", move || {
            let alice = alice_client.clone();
            let id = id.clone();
            async move {
                matches!(
                    alice.pipeline().store().get_message(&id).await.unwrap(),
                    Some(record) if record.state == MessageState::ReadByAgent
                )
            }
        })
        .await;
    }
    let confirm_events = alice
        .client
        .pipeline()
        .activity()
        .get_events(pinch::activity::EventFilter {
            connection_address: Some(bob.address()),
            ..Default::default()
        })
        .await
        .unwrap();
    let stored_confirms = confirm_events
        .iter()
        .filter(|e| {
            e.action_type == "delivery_confirmed"
                && e.details.as_deref() == Some("was_stored=true")
        })
        .count();
    assert_eq!(stored_confirms, 3);

    alice.client.close();
    bob_revived.close();
}

// ─── S3: size limit ───────────────────────────────────────────────────────────

#[tokio::test]
async fn oversized_envelope_is_dropped_but_transport_survives() {
    let relay = spawn_relay(|_| {}).await;
    let alice = connect_agent(&relay.url).await;
    let bob = connect_agent(&relay.url).await;
    establish_connection(&alice, &bob).await;

    // ~70 KB body → envelope over the 64 KiB cap, under the 128 KiB
    // transport cap: relayed nowhere, silently.
    let oversized_id = alice
        .client
        .send_message(&bob.address(), &"x".repeat(70_000), SendOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(bob
        .client
        .pipeline()
        .store()
        .messages_for(&alice.address())
        .await
        .unwrap()
        .is_empty());
    let record = alice
        .client
        .pipeline()
        .store()
        .get_message(&oversized_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, MessageState::Sent, "no confirm ever arrives");

    // Same connection, small resend: goes through — the transport was
    // not torn down.
    let retry_id = alice
        .client
        .send_message(&bob.address(), "small again", SendOptions::default())
        .await
        .unwrap();
    let bob_client = bob.client.clone();
    let alice_addr = alice.address();
    wait_until("resend to arrive", move || {
        let bob = bob_client.clone();
        let alice_addr = alice_addr.clone();
        async move {
            bob.pipeline()
                .store()
                .messages_for(&alice_addr)
                .await
                .unwrap()
                .iter()
                .any(|r| r.content == "small again")
        }
    })
    .await;
    assert_ne!(oversized_id, retry_id);

    alice.client.close();
    bob.client.close();
}

// ─── S4: queue full ───────────────────────────────────────────────────────────

#[tokio::test]
async fn queue_full_fails_the_overflowing_send() {
    let relay = spawn_relay(|config| config.queue_max = 3).await;
    let alice = connect_agent(&relay.url).await;
    let bob = connect_agent(&relay.url).await;
    establish_connection(&alice, &bob).await;

    bob.client.close();
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 1..=3 {
        alice
            .client
            .send_message(&bob.address(), &format!("fits {i}"), SendOptions::default())
            .await
            .unwrap();
    }
    let overflow_id = alice
        .client
        .send_message(&bob.address(), "one too many", SendOptions::default())
        .await
        .unwrap();

    // The QueueFull envelope fails the overflowing record.
    let alice_client = alice.client.clone();
    let id = overflow_id.clone();
    wait_until("overflow send to fail", move || {
        let alice = alice_client.clone();
        let id = id.clone();
        async move {
            matches!(
                alice.pipeline().store().get_message(&id).await.unwrap(),
                Some(record) if record.state == MessageState::Failed
            )
        }
    })
    .await;

    alice.client.close();
}

// ─── S5: rate limiting ────────────────────────────────────────────────────────

#[tokio::test]
async fn burst_beyond_the_limit_is_rejected_and_never_delivered() {
    // Burst 6, effectively no refill. Bob initiates the connection so
    // Alice's only pre-burst spend is her single response frame.
    let relay = spawn_relay(|config| {
        config.rate_burst = 6;
        config.rate_limit = 0.0001;
    })
    .await;
    let alice = connect_agent(&relay.url).await;
    let bob = connect_agent(&relay.url).await;
    establish_connection(&bob, &alice).await;
    alice
        .client
        .pipeline()
        .store()
        .set_autonomy(&bob.address(), AutonomyLevel::FullAuto)
        .await
        .unwrap();
    bob.client
        .pipeline()
        .store()
        .set_autonomy(&alice.address(), AutonomyLevel::FullAuto)
        .await
        .unwrap();

    // Alice has 5 tokens left; the 6th message draws RateLimited.
    let mut ids = Vec::new();
    for i in 1..=6 {
        ids.push(
            alice
                .client
                .send_message(&bob.address(), &format!("burst {i}"), SendOptions::default())
                .await
                .unwrap(),
        );
    }

    let bob_client = bob.client.clone();
    let alice_addr = alice.address();
    wait_until("first five to arrive", move || {
        let bob = bob_client.clone();
        let alice_addr = alice_addr.clone();
        async move {
            bob.pipeline()
                .store()
                .messages_for(&alice_addr)
                .await
                .unwrap()
                .len()
                == 5
        }
    })
    .await;

    // The overflow message was failed by the RateLimited reply and never
    // reached Bob.
    let alice_client = alice.client.clone();
    let overflow = ids.last().unwrap().clone();
    wait_until("overflow to fail", move || {
        let alice = alice_client.clone();
        let overflow = overflow.clone();
        async move {
            matches!(
                alice.pipeline().store().get_message(&overflow).await.unwrap(),
                Some(record) if record.state == MessageState::Failed
            )
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        bob.client
            .pipeline()
            .store()
            .messages_for(&alice.address())
            .await
            .unwrap()
            .len(),
        5
    );

    alice.client.close();
    bob.client.close();
}

// ─── Health endpoint ──────────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint_reports_connections() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let relay = spawn_relay(|_| {}).await;
    let alice = connect_agent(&relay.url).await;

    let mut stream = tokio::net::TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["connections"], 1);
    assert!(json["tasks"].as_u64().unwrap() > 0);

    alice.client.close();
}
