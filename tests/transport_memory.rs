// tests/transport_memory.rs

use std::collections::{HashMap, HashSet};

use futures::{stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_stream::wrappers::ReceiverStream;

use hub_rpc::{
    // ---
    Completion,
    HubClient,
    HubClientBuilder,
    HubConfig,
    HubConnection,
    HubMessage,
    Invocation,
    InvocationId,
    MemoryConnection,
    RawPeer,
    RpcError,
    UploadStreams,
    WireValue,
    NO_RESULT_HANDLER,
};

const WAIT: Duration = Duration::from_secs(2);

async fn next_frame(peer: &mut RawPeer) -> HubMessage {
    timeout(WAIT, peer.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("connection writer closed unexpectedly")
}

async fn expect_quiet(peer: &mut RawPeer) {
    let quiet = timeout(Duration::from_millis(100), peer.recv()).await;
    assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
}

fn client_with_peer() -> (HubClient, RawPeer) {
    let (connection, peer) = MemoryConnection::with_peer(HubConfig::default());
    let client = HubClientBuilder::new(connection).build().unwrap();
    (client, peer)
}

#[tokio::test]
async fn memory_invoke_with_uploads_writes_invocation_first() {
    // ---
    // Arrange
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());

    let uploads = UploadStreams::new()
        .with(stream::iter(vec![1, 2]))
        .with(stream::iter(vec!["a"]));

    // ---
    // Act
    // ---
    let invoker = connection.clone();
    let call = tokio::spawn(async move {
        invoker
            .invoke("Upload", vec![json!("meta")], uploads)
            .await
    });

    // ---
    // Assert
    // ---
    let frame = next_frame(&mut peer).await;
    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({
            "type": "Invocation",
            "invocationId": "1",
            "target": "Upload",
            "arguments": ["meta"],
            "streamIds": ["2", "3"],
        })
    );

    // Group the upload frames per stream; order holds within a stream only.
    let mut per_stream: HashMap<String, Vec<HubMessage>> = HashMap::new();
    for _ in 0..5 {
        let frame = next_frame(&mut peer).await;
        let id = match &frame {
            HubMessage::StreamItem { invocation_id, .. } => invocation_id.to_string(),
            HubMessage::Completion(completion) => completion.invocation_id().to_string(),
            other => panic!("unexpected frame {other:?}"),
        };
        per_stream.entry(id).or_default().push(frame);
    }

    assert_eq!(
        per_stream["2"],
        vec![
            HubMessage::StreamItem {
                invocation_id: "2".into(),
                item: json!(1)
            },
            HubMessage::StreamItem {
                invocation_id: "2".into(),
                item: json!(2)
            },
            HubMessage::Completion(Completion::void("2".into())),
        ]
    );
    assert_eq!(
        per_stream["3"],
        vec![
            HubMessage::StreamItem {
                invocation_id: "3".into(),
                item: json!("a")
            },
            HubMessage::Completion(Completion::void("3".into())),
        ]
    );

    peer.send(Completion::void("1".into())).await.unwrap();
    let result = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
    assert_eq!(result, WireValue::Null);
}

#[tokio::test]
async fn memory_failed_upload_terminates_only_its_stream() {
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());

    let failing = stream::iter(vec![Ok(1), Err("disk gone")]);
    let uploads = UploadStreams::new().with_fallible(failing);

    connection
        .send("Ingest", vec![], uploads)
        .await
        .expect("send failed");

    let HubMessage::Invocation(invocation) = next_frame(&mut peer).await else {
        panic!("expected invocation");
    };
    assert!(invocation.invocation_id().is_none());
    assert_eq!(invocation.stream_ids(), &[InvocationId::from("1")]);

    assert_eq!(
        next_frame(&mut peer).await,
        HubMessage::StreamItem {
            invocation_id: "1".into(),
            item: json!(1)
        }
    );
    let HubMessage::Completion(completion) = next_frame(&mut peer).await else {
        panic!("expected completion");
    };
    assert_eq!(completion.invocation_id().as_str(), "1");
    assert!(completion.error_message().unwrap().contains("disk gone"));
}

#[tokio::test]
async fn memory_stream_yields_items_then_ends() {
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());

    let mut items = connection
        .stream("Counter", vec![json!(3)], UploadStreams::new())
        .await
        .expect("stream failed");

    let HubMessage::StreamInvocation(invocation) = next_frame(&mut peer).await else {
        panic!("expected stream invocation");
    };
    let id = invocation.invocation_id().unwrap().clone();

    for n in 0..3 {
        peer.send(HubMessage::StreamItem {
            invocation_id: id.clone(),
            item: json!(n),
        })
        .await
        .unwrap();
    }
    peer.send(Completion::void(id)).await.unwrap();

    let mut received = Vec::new();
    while let Some(item) = timeout(WAIT, items.next()).await.expect("stream stalled") {
        received.push(item.unwrap());
    }
    assert_eq!(received, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn memory_stream_error_is_last_item() {
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());

    let mut items = connection
        .stream("Counter", vec![], UploadStreams::new())
        .await
        .unwrap();
    let HubMessage::StreamInvocation(invocation) = next_frame(&mut peer).await else {
        panic!("expected stream invocation");
    };
    let id = invocation.invocation_id().unwrap().clone();

    peer.send(Completion::error(id, "counter broke")).await.unwrap();

    let item = timeout(WAIT, items.next()).await.unwrap();
    assert!(matches!(item, Some(Err(RpcError::Remote(ref msg))) if msg == "counter broke"));
    assert!(timeout(WAIT, items.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn memory_dropping_stream_cancels_call() {
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());

    let (upload_tx, upload_rx) = mpsc::channel::<i32>(4);
    let uploads = UploadStreams::new().with(ReceiverStream::new(upload_rx));

    let items = connection
        .stream("Counter", vec![], uploads)
        .await
        .unwrap();

    let HubMessage::StreamInvocation(invocation) = next_frame(&mut peer).await else {
        panic!("expected stream invocation");
    };
    let id = invocation.invocation_id().unwrap().clone();
    assert_eq!(connection.pending_calls(), 1);

    drop(items);

    assert_eq!(
        next_frame(&mut peer).await,
        HubMessage::CancelInvocation { invocation_id: id }
    );
    assert_eq!(connection.pending_calls(), 0);

    // The upload was cancelled with its parent: nothing more is written.
    let _ = upload_tx.send(7).await;
    let quiet = timeout(Duration::from_millis(50), peer.recv()).await;
    assert!(quiet.is_err(), "unexpected frame after cancel: {quiet:?}");
}

#[tokio::test]
async fn memory_peer_cancel_fails_pending_invoke() {
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());

    let (upload_tx, upload_rx) = mpsc::channel::<i32>(4);
    let uploads = UploadStreams::new().with(ReceiverStream::new(upload_rx));

    let invoker = connection.clone();
    let call = tokio::spawn(async move { invoker.invoke("Slow", vec![], uploads).await });

    let HubMessage::Invocation(invocation) = next_frame(&mut peer).await else {
        panic!("expected invocation");
    };
    let id = invocation.invocation_id().unwrap().clone();

    peer.send(HubMessage::CancelInvocation { invocation_id: id })
        .await
        .unwrap();

    let outcome = timeout(WAIT, call).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(RpcError::Cancelled)));

    // Its upload stream was cancelled too.
    let _ = upload_tx.send(1).await;
    let quiet = timeout(Duration::from_millis(50), peer.recv()).await;
    assert!(quiet.is_err(), "unexpected frame after cancel: {quiet:?}");
}

#[tokio::test]
async fn memory_peer_close_fails_pending_calls() {
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());

    let invoker = connection.clone();
    let call = tokio::spawn(async move { invoker.invoke("Echo", vec![json!("hi")], UploadStreams::new()).await });
    let _ = next_frame(&mut peer).await;

    peer.send(HubMessage::Close {
        error: Some("server shutting down".into()),
    })
    .await
    .unwrap();

    let outcome = timeout(WAIT, call).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));
    assert!(connection.is_closed());
}

#[tokio::test]
async fn memory_unanswered_invocation_gets_error_completion() {
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());
    let _client = HubClientBuilder::new(connection).build().unwrap();

    let invocation = Invocation::new("Missing", Some("42".into()), vec![], vec![]);
    peer.send(HubMessage::Invocation(invocation)).await.unwrap();

    assert_eq!(
        next_frame(&mut peer).await,
        HubMessage::Completion(Completion::error("42".into(), hub_rpc::NO_RESULT_HANDLER))
    );
}

#[tokio::test]
async fn memory_result_handler_completion_carries_value() {
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());
    let client = HubClientBuilder::new(connection).build().unwrap();

    let _add = client
        .on_with_result("Add", |(a, b): (i64, i64)| async move { Ok(a + b) })
        .unwrap();

    let invocation = Invocation::new("Add", Some("7".into()), vec![json!(2), json!(3)], vec![]);
    peer.send(HubMessage::Invocation(invocation)).await.unwrap();

    assert_eq!(
        next_frame(&mut peer).await,
        HubMessage::Completion(Completion::value("7".into(), json!(5)))
    );

    // Fire-and-forget invocations are never answered.
    let invocation = Invocation::new("Add", None, vec![json!(1), json!(1)], vec![]);
    peer.send(HubMessage::Invocation(invocation)).await.unwrap();
    let quiet = timeout(Duration::from_millis(50), peer.recv()).await;
    assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
}

#[tokio::test]
async fn memory_echo_invocation_completes_with_argument() {
    // ---
    let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());
    let client = HubClientBuilder::new(connection).build().unwrap();

    let _echo = client
        .on_with_result("Echo", |(text,): (String,)| async move { Ok(text) })
        .unwrap();

    let invocation = Invocation::new("Echo", Some("1".into()), vec![json!("hi")], vec![]);
    peer.send(HubMessage::Invocation(invocation)).await.unwrap();

    let frame = next_frame(&mut peer).await;
    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({ "type": "Completion", "invocationId": "1", "result": "hi" })
    );
}

#[tokio::test]
async fn memory_undrained_stream_does_not_stall_other_calls() {
    // ---
    // Arrange
    // ---
    let (client, mut peer) = client_with_peer();

    let mut feed = client.stream::<i64>("Feed", ()).await.unwrap();
    let HubMessage::StreamInvocation(invocation) = next_frame(&mut peer).await else {
        panic!("expected stream invocation");
    };
    let feed_id = invocation.invocation_id().unwrap().clone();

    // More items than any writer or inbound queue holds, none consumed yet.
    for n in 0..200 {
        peer.send(HubMessage::StreamItem {
            invocation_id: feed_id.clone(),
            item: json!(n),
        })
        .await
        .unwrap();
    }

    // ---
    // Act
    // ---
    let invoker = client.clone();
    let call = tokio::spawn(async move {
        invoker
            .invoke_with_timeout::<i64>("Other", (), Duration::from_millis(500))
            .await
    });

    let HubMessage::Invocation(other) = next_frame(&mut peer).await else {
        panic!("expected invocation");
    };
    peer.send(Completion::value(other.invocation_id().unwrap().clone(), json!(7)))
        .await
        .unwrap();

    // ---
    // Assert
    // ---
    let outcome = timeout(WAIT, call).await.unwrap().unwrap();
    assert_eq!(outcome.unwrap(), 7);

    peer.send(Completion::void(feed_id)).await.unwrap();
    let mut received = Vec::new();
    while let Some(item) = timeout(WAIT, feed.next()).await.expect("stream stalled") {
        received.push(item.unwrap());
    }
    assert_eq!(received, (0..200).collect::<Vec<i64>>());
}

#[tokio::test]
async fn memory_undrained_stream_does_not_stall_inbound_invocations() {
    // ---
    let (client, mut peer) = client_with_peer();
    let _echo = client
        .on_with_result("Echo", |(text,): (String,)| async move { Ok(text) })
        .unwrap();

    let _feed = client.stream::<i64>("Feed", ()).await.unwrap();
    let HubMessage::StreamInvocation(invocation) = next_frame(&mut peer).await else {
        panic!("expected stream invocation");
    };
    let feed_id = invocation.invocation_id().unwrap().clone();

    for n in 0..200 {
        peer.send(HubMessage::StreamItem {
            invocation_id: feed_id.clone(),
            item: json!(n),
        })
        .await
        .unwrap();
    }

    let echo = Invocation::new("Echo", Some("90".into()), vec![json!("still here")], vec![]);
    peer.send(HubMessage::Invocation(echo)).await.unwrap();

    assert_eq!(
        next_frame(&mut peer).await,
        HubMessage::Completion(Completion::value("90".into(), json!("still here")))
    );
}

#[tokio::test]
async fn memory_invoke_result_of_wrong_type_is_decode_error() {
    // ---
    let (client, mut peer) = client_with_peer();

    let invoker = client.clone();
    let call = tokio::spawn(async move { invoker.invoke::<i64>("Name", ()).await });

    let HubMessage::Invocation(invocation) = next_frame(&mut peer).await else {
        panic!("expected invocation");
    };
    peer.send(Completion::value(
        invocation.invocation_id().unwrap().clone(),
        json!("not a number"),
    ))
    .await
    .unwrap();

    let outcome = timeout(WAIT, call).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(RpcError::Decode { index: 0, .. })));
}

#[tokio::test]
async fn memory_dropped_result_handler_answers_each_invocation_once() {
    // ---
    // Arrange
    // ---
    let (client, mut peer) = client_with_peer();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
    let slow = client
        .on_with_result("Slow", move |_: ()| {
            let started = started_tx.clone();
            async move {
                let _ = started.send(());
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<i64, RpcError>(0)
            }
        })
        .unwrap();

    for id in ["1", "2", "3"] {
        let invocation = Invocation::new("Slow", Some(id.into()), vec![], vec![]);
        peer.send(HubMessage::Invocation(invocation)).await.unwrap();
    }

    // ---
    // Act
    // ---
    timeout(WAIT, started_rx.recv())
        .await
        .expect("handler never started")
        .unwrap();
    drop(slow);

    // ---
    // Assert
    // ---
    let mut answered = HashSet::new();
    for _ in 0..3 {
        let HubMessage::Completion(completion) = next_frame(&mut peer).await else {
            panic!("expected completion");
        };
        assert_eq!(completion.error_message(), Some(NO_RESULT_HANDLER));
        assert!(
            answered.insert(completion.invocation_id().to_string()),
            "invocation {} answered twice",
            completion.invocation_id()
        );
    }
    assert_eq!(
        answered,
        HashSet::from(["1".to_string(), "2".to_string(), "3".to_string()])
    );
    expect_quiet(&mut peer).await;
}

#[tokio::test]
async fn memory_panicked_handler_can_be_replaced_after_unsubscribe() {
    // ---
    let (client, mut peer) = client_with_peer();

    let brittle = client
        .on_with_result("Compute", |(explode,): (bool,)| async move {
            if explode {
                panic!("handler blew up");
            }
            Ok::<i64, RpcError>(1)
        })
        .unwrap();

    let invocation = Invocation::new("Compute", Some("10".into()), vec![json!(true)], vec![]);
    peer.send(HubMessage::Invocation(invocation)).await.unwrap();

    let HubMessage::Completion(completion) = next_frame(&mut peer).await else {
        panic!("expected completion");
    };
    assert_eq!(completion.invocation_id().as_str(), "10");
    assert!(completion.error_message().is_some());

    brittle.unsubscribe().await;
    assert!(!client.registry().is_registered("Compute"));

    let _steady = client
        .on_with_result("Compute", |(_,): (bool,)| async move { Ok::<i64, RpcError>(2) })
        .expect("slot should be free after unsubscribe");

    let invocation = Invocation::new("Compute", Some("11".into()), vec![json!(true)], vec![]);
    peer.send(HubMessage::Invocation(invocation)).await.unwrap();

    assert_eq!(
        next_frame(&mut peer).await,
        HubMessage::Completion(Completion::value("11".into(), json!(2)))
    );
}
