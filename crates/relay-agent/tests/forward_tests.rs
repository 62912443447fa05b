//! Forward-mode integration tests against a live agent server.

use std::time::Duration;

use relay_agent::{AgentConn, MainProcess};
use relay_protocol::{Message, MessageType, StdStream, StdioFrame, StdioFrameCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use futures::StreamExt;

mod common;
use common::{TestAgent, argv, output_of, recv, send, until_finished};

#[tokio::test]
async fn test_exec_echo() {
    let agent = TestAgent::start("").await;
    let mut ws = agent.connect("").await;

    send(&mut ws, &Message::exec("s1", argv(&["echo", "hello"]), vec![], None, false)).await;
    let messages = until_finished(&mut ws, "s1").await;

    assert_eq!(output_of(&messages, "s1", MessageType::Stdout), b"hello\n");
    assert_eq!(messages.last().unwrap(), &Message::exit("s1", 0));
    agent.shutdown().await;
}

#[tokio::test]
async fn test_exec_nonzero_exit() {
    let agent = TestAgent::start("").await;
    let mut ws = agent.connect("").await;

    send(&mut ws, &Message::exec("s2", argv(&["sh", "-c", "exit 7"]), vec![], None, false)).await;
    let messages = until_finished(&mut ws, "s2").await;

    assert!(output_of(&messages, "s2", MessageType::Stdout).is_empty());
    assert_eq!(messages.last().unwrap(), &Message::exit("s2", 7));
}

#[tokio::test]
async fn test_exec_env_and_stderr() {
    let agent = TestAgent::start("").await;
    let mut ws = agent.connect("").await;

    let exec = Message::exec(
        "e",
        argv(&["sh", "-c", "echo $GREETING >&2"]),
        vec!["GREETING=hi there".into()],
        None,
        false,
    );
    send(&mut ws, &exec).await;
    let messages = until_finished(&mut ws, "e").await;

    assert_eq!(output_of(&messages, "e", MessageType::Stderr), b"hi there\n");
}

#[tokio::test]
async fn test_signal_terminates_session() {
    let agent = TestAgent::start("").await;
    let mut ws = agent.connect("").await;

    send(&mut ws, &Message::exec("s3", argv(&["sleep", "30"]), vec![], None, false)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    send(&mut ws, &Message::signal("s3", "term")).await;

    let messages = until_finished(&mut ws, "s3").await;
    let exit = messages.last().unwrap();
    assert_eq!(exit.kind, MessageType::Exit);
    assert_eq!(exit.code, Some(128 + libc::SIGTERM));
}

#[tokio::test]
async fn test_validation_errors() {
    let agent = TestAgent::start("").await;
    let mut ws = agent.connect("").await;

    send(&mut ws, &Message::exec("", argv(&["true"]), vec![], None, false)).await;
    assert_eq!(recv(&mut ws).await, Message::error("", "exec requires id"));

    send(&mut ws, &Message::attach("a")).await;
    assert_eq!(
        recv(&mut ws).await,
        Message::error("a", "no main process to attach to")
    );

    // Malformed frames are skipped and the connection keeps working.
    {
        use futures::SinkExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;
        ws.send(WsMessage::Text("{not json".into())).await.unwrap();
    }
    send(&mut ws, &Message::exec("ok", argv(&["true"]), vec![], None, false)).await;
    let messages = until_finished(&mut ws, "ok").await;
    assert_eq!(messages.last().unwrap(), &Message::exit("ok", 0));
}

#[tokio::test]
async fn test_attach_replays_then_streams() {
    let main = MainProcess::spawn(&argv(&["sh", "-c", "echo pre; sleep 0.3; echo post"]), &[])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let agent = TestAgent::with_main("", Some(main)).await;
    let mut ws = agent.connect("").await;

    send(&mut ws, &Message::attach("att")).await;
    let first = recv(&mut ws).await;
    assert_eq!(first.kind, MessageType::Stdout);
    assert_eq!(first.payload().unwrap(), b"pre\n");

    let rest = until_finished(&mut ws, "att").await;
    assert_eq!(output_of(&rest, "att", MessageType::Stdout), b"post\n");
    assert_eq!(rest.last().unwrap(), &Message::exit("att", 0));
}

#[tokio::test]
async fn test_reattach_same_id_streams_live() {
    let main = MainProcess::spawn(&argv(&["sh", "-c", "echo pre; sleep 0.5; echo post"]), &[])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let agent = TestAgent::with_main("", Some(main.clone())).await;
    let mut ws = agent.connect("").await;

    send(&mut ws, &Message::attach("ctr")).await;
    assert_eq!(recv(&mut ws).await.payload().unwrap(), b"pre\n");
    send(&mut ws, &Message::attach("ctr")).await;
    assert_eq!(recv(&mut ws).await.payload().unwrap(), b"pre\n");

    let rest = until_finished(&mut ws, "ctr").await;
    assert_eq!(output_of(&rest, "ctr", MessageType::Stdout), b"post\n");
    assert_eq!(rest.last().unwrap(), &Message::exit("ctr", 0));
    assert_eq!(main.subscriber_count(), 0);
}

#[tokio::test]
async fn test_finished_execs_are_released() {
    let agent = TestAgent::start("").await;
    let mut ws = agent.connect("").await;

    for i in 0..10 {
        let id = format!("tty-{i}");
        send(&mut ws, &Message::exec(&id, argv(&["true"]), vec![], None, true)).await;
        let messages = until_finished(&mut ws, &id).await;
        assert_eq!(messages.last().unwrap(), &Message::exit(&id, 0));
    }
    send(&mut ws, &Message::exec("pipe", argv(&["true"]), vec![], None, false)).await;
    until_finished(&mut ws, "pipe").await;

    for _ in 0..50 {
        if agent.router.registry().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} finished session(s) still registered", agent.router.registry().len());
}

#[tokio::test]
async fn test_disconnect_kills_sessions() {
    let agent = TestAgent::start("").await;
    let mut ws = agent.connect("").await;

    send(&mut ws, &Message::exec("long", argv(&["sleep", "30"]), vec![], None, false)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.router.registry().len(), 1);

    drop(ws);
    for _ in 0..50 {
        if agent.router.registry().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("session survived its connection");
}

#[tokio::test]
async fn test_ws_rejects_bad_token() {
    let agent = TestAgent::start("secret").await;

    let err = tokio_tungstenite::connect_async(agent.ws_url())
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status(), 401);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Query parameter works when headers cannot be set.
    let url = format!("{}?token=secret", agent.ws_url());
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    send(&mut ws, &Message::exec("q", argv(&["true"]), vec![], None, false)).await;
    let messages = until_finished(&mut ws, "q").await;
    assert_eq!(messages.last().unwrap(), &Message::exit("q", 0));
}

#[tokio::test]
async fn test_health_endpoint_is_public() {
    let main = MainProcess::spawn(&argv(&["sleep", "30"]), &[]).unwrap();
    let pid = main.pid();
    let agent = TestAgent::with_main("secret", Some(main.clone())).await;

    let mut stream = TcpStream::connect(agent.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: agent\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    let body = raw.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["pid"], pid);
    assert_eq!(json["exited"], false);
    assert!(json.get("exitCode").is_none());

    main.signal(relay_agent::process::Signal::Kill).unwrap();
}

#[tokio::test]
async fn test_forward_client_bridges_frames() {
    let agent = TestAgent::start("tok").await;
    let conn = AgentConn::dial(&agent.addr.to_string(), "tok").await.unwrap();
    let (client, mut peer) = tokio::io::duplex(64 * 1024);

    let code = conn
        .bridge_exec(
            client,
            "fw",
            argv(&["sh", "-c", "printf out; sleep 0.1; printf err >&2; exit 3"]),
            vec![],
            None,
            false,
        )
        .await;
    assert_eq!(code, 3);

    peer.shutdown().await.unwrap();
    let mut raw = Vec::new();
    peer.read_to_end(&mut raw).await.unwrap();
    let frames: Vec<StdioFrame> = FramedRead::new(&raw[..], StdioFrameCodec)
        .map(|f| f.unwrap())
        .collect()
        .await;
    assert_eq!(
        frames,
        vec![
            StdioFrame::new(StdStream::Stdout, &b"out"[..]),
            StdioFrame::new(StdStream::Stderr, &b"err"[..]),
        ]
    );
    conn.close().await;
}
