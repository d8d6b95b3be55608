use std::time::Duration;

use qmp_session::error::ErrorKind;
use qmp_session::mock::{MockScript, MockServer};
use qmp_session::{CallOptions, CancelToken, Client, DisconnectReason, Error, Runstate};
use serde_json::{Value, json};

async fn wait_for_pending(client: &Client, n: usize) {
    while client.pending_requests() < n {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn out_of_order_replies_reach_their_callers() -> qmp_session::Result<()> {
    const N: usize = 8;

    let mut script = MockScript::new().reorder(N);
    for i in 0..N {
        script = script.reply_return(format!("cmd-{i}"), json!({ "n": i }));
    }
    let server = MockServer::start_tcp(script).await?;
    let client = Client::builder().connect(server.endpoint()).await?;

    let mut calls = Vec::new();
    for i in 0..N {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let v: Value = client
                .execute(&format!("cmd-{i}"), Option::<()>::None)
                .await?;
            Ok::<_, Error>((i, v))
        }));
    }

    for call in calls {
        let (i, v) = call.await.unwrap()?;
        assert_eq!(v["n"], i);
    }
    assert_eq!(client.pending_requests(), 0);

    client.disconnect().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_interrupts_every_outstanding_call() -> qmp_session::Result<()> {
    const K: usize = 5;

    let server = MockServer::start_tcp(MockScript::new().silent("query-status")).await?;
    let client = Client::builder().connect(server.endpoint()).await?;

    let calls: Vec<_> = (0..K)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .execute::<_, Value>("query-status", Option::<()>::None)
                    .await
            })
        })
        .collect();

    wait_for_pending(&client, K).await;
    client.disconnect().await;

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Interrupted), "{err:?}");
    }
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.runstate(), Runstate::Idle);
    assert!(matches!(
        client.disconnect_reason(),
        Some(DisconnectReason::Requested)
    ));

    // Disconnecting again is a no-op.
    client.disconnect().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn timed_out_call_leaves_the_session_running() -> qmp_session::Result<()> {
    let script = MockScript::new()
        .silent("query-status")
        .reply_return("query-name", json!({"name": "vm100"}));
    let server = MockServer::start_tcp(script).await?;
    let client = Client::builder().connect(server.endpoint()).await?;

    let options = CallOptions {
        timeout: Some(Duration::from_millis(50)),
        ..CallOptions::default()
    };
    let err = client
        .execute_with_options::<(), Value>("query-status", None, options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.runstate(), Runstate::Running);

    let v: Value = client.execute("query-name", Option::<()>::None).await?;
    assert_eq!(v["name"], "vm100");

    client.disconnect().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancelled_call_returns_promptly() -> qmp_session::Result<()> {
    let server = MockServer::start_tcp(MockScript::new().silent("query-status")).await?;
    let client = Client::builder()
        .default_timeout(None)
        .connect(server.endpoint())
        .await?;

    let cancel = CancelToken::new();
    let call = {
        let client = client.clone();
        let options = CallOptions {
            cancel: Some(cancel.clone()),
            ..CallOptions::default()
        };
        tokio::spawn(async move {
            client
                .execute_with_options::<(), Value>("query-status", None, options)
                .await
        })
    };

    wait_for_pending(&client, 1).await;
    cancel.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled), "{err:?}");
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.runstate(), Runstate::Running);

    client.disconnect().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn abandoned_calls_release_their_slots() -> qmp_session::Result<()> {
    let script = MockScript::new()
        .silent("query-status")
        .reply_return("query-name", json!({"name": "vm100"}));
    let server = MockServer::start_tcp(script).await?;
    let client = Client::builder()
        .default_timeout(None)
        .connect(server.endpoint())
        .await?;

    for _ in 0..3 {
        let outer = tokio::time::timeout(
            Duration::from_millis(30),
            client.execute::<_, Value>("query-status", Option::<()>::None),
        )
        .await;
        assert!(outer.is_err());
    }
    assert_eq!(client.pending_requests(), 0);

    // Same through `select!` losing the race to another branch.
    tokio::select! {
        _ = client.execute::<_, Value>("query-status", Option::<()>::None) => {
            panic!("silent command answered");
        }
        () = tokio::time::sleep(Duration::from_millis(30)) => {}
    }
    assert_eq!(client.pending_requests(), 0);

    // The session is unaffected.
    assert_eq!(client.runstate(), Runstate::Running);
    let v: Value = client.execute("query-name", Option::<()>::None).await?;
    assert_eq!(v["name"], "vm100");

    client.disconnect().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn slow_event_consumer_does_not_stall_replies() -> qmp_session::Result<()> {
    let mut script = MockScript::new().reply_return("query-status", json!({"status": "running"}));
    for i in 0..64 {
        script = script.post_event(json!({"event": "BLOCK_JOB_READY", "data": {"n": i}}));
    }
    let server = MockServer::start_tcp(script).await?;
    let client = Client::builder().connect(server.endpoint()).await?;

    // Subscribed but never polled until the reply is in.
    let mut events = client.events();
    let v: Value = client.execute("query-status", Option::<()>::None).await?;
    assert_eq!(v["status"], "running");

    for i in 0..64 {
        let ev = events.recv().await?;
        assert_eq!(ev.data["n"], i);
    }

    client.disconnect().await;
    server.shutdown().await;
    Ok(())
}
