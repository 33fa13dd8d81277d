//! Session-level end-to-end flow: attach, index against a mock DAW script,
//! run an agent turn with a scripted provider, approve the mutation, and
//! watch the event stream a client would see.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use liveset::{addresses as addr, LiveBridge, ObserverConfig};
use mixchat::{
    AssistantTurn, ChatContent, ChatProvider, ContentBlock, StopReason, StreamEvent,
    TurnRequest,
};
use oscwire::{OscConfig, OscMessage, OscQuery, OscTransport, OscValue};
use soundcheck::{ClientEvent, SessionManager};

/// Mock remote script: one track "Bass" with one device "Reverb" carrying
/// two parameters. Replies mirror the real script's shapes, echo entries
/// included.
async fn mock_script(socket: UdpSocket) {
    let mut value_strings: HashMap<(i32, i32, i32), String> = HashMap::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        let request = OscMessage::decode(&buf[..len]).unwrap();
        let args = &request.args;
        let arg = |i: usize| args.get(i).and_then(OscValue::as_i32).unwrap_or(-1);

        let reply_args: Option<Vec<OscValue>> = match request.address.as_str() {
            addr::TEST => Some(vec![OscValue::from("ok")]),
            addr::NUM_TRACKS => Some(vec![OscValue::Int(1)]),
            addr::TRACK_DATA => Some(vec![OscValue::from("Bass")]),
            addr::NUM_DEVICES => Some(vec![OscValue::Int(arg(0)), OscValue::Int(1)]),
            addr::DEVICE_NAMES => {
                Some(vec![OscValue::Int(arg(0)), OscValue::from("Reverb")])
            }
            addr::DEVICE_CLASSES => {
                Some(vec![OscValue::Int(arg(0)), OscValue::from("Reverb")])
            }
            addr::DEVICE_NAME => Some(vec![
                OscValue::Int(arg(0)),
                OscValue::Int(arg(1)),
                OscValue::from("Reverb"),
            ]),
            addr::PARAM_NAMES => Some(vec![
                OscValue::Int(arg(0)),
                OscValue::Int(arg(1)),
                OscValue::from("Dry/Wet"),
                OscValue::from("Size"),
            ]),
            addr::PARAM_VALUES => Some(vec![
                OscValue::Int(arg(0)),
                OscValue::Int(arg(1)),
                OscValue::Float(0.6),
                OscValue::Float(0.4),
            ]),
            addr::PARAM_MINS => Some(vec![
                OscValue::Int(arg(0)),
                OscValue::Int(arg(1)),
                OscValue::Float(0.0),
                OscValue::Float(0.0),
            ]),
            addr::PARAM_MAXES => Some(vec![
                OscValue::Int(arg(0)),
                OscValue::Int(arg(1)),
                OscValue::Float(1.0),
                OscValue::Float(1.0),
            ]),
            addr::PARAM_VALUE_STRING => {
                let key = (arg(0), arg(1), arg(2));
                let rendered = value_strings
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| "0.60".to_string());
                Some(vec![
                    OscValue::Int(key.0),
                    OscValue::Int(key.1),
                    OscValue::Int(key.2),
                    OscValue::Str(rendered),
                ])
            }
            addr::SET_PARAM_VALUE => {
                let key = (arg(0), arg(1), arg(2));
                let value = args.get(3).and_then(OscValue::as_f32).unwrap_or(0.0);
                value_strings.insert(key, format!("{value:.2}"));
                None
            }
            _ => None, // start/stop listen and anything else: no reply
        };

        if let Some(reply_args) = reply_args {
            let reply = OscMessage::new(request.address.clone(), reply_args);
            socket.send_to(&reply.encode(), from).await.unwrap();
        }
    }
}

struct ScriptedProvider {
    turns: Mutex<std::collections::VecDeque<Vec<StreamEvent>>>,
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn stream_turn(&self, _request: TurnRequest) -> Result<mpsc::Receiver<StreamEvent>> {
        let script = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .expect("provider called more times than scripted");
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in script {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

fn scripted_set_and_close() -> ScriptedProvider {
    let set_turn = vec![
        StreamEvent::TextDelta("Okay, reducing it now.".into()),
        StreamEvent::Completed(AssistantTurn {
            blocks: vec![
                ContentBlock::Text {
                    text: "Okay, reducing it now.".into(),
                },
                ContentBlock::ToolUse {
                    id: "tc_1".into(),
                    name: "set_device_parameter".into(),
                    input: serde_json::json!({
                        "track_id": 0, "device_id": 0, "param_id": 0, "value": 0.30
                    }),
                },
            ],
            stop_reason: StopReason::ToolUse,
        }),
    ];
    let closing = vec![
        StreamEvent::TextDelta("Done.".into()),
        StreamEvent::Completed(AssistantTurn {
            blocks: vec![ContentBlock::Text {
                text: "Done.".into(),
            }],
            stop_reason: StopReason::EndTurn,
        }),
    ];
    ScriptedProvider {
        turns: Mutex::new(vec![set_turn, closing].into()),
    }
}

async fn manager_against_mock(provider: ScriptedProvider) -> SessionManager {
    let script = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = OscConfig {
        local_port: 0,
        remote_host: "127.0.0.1".to_string(),
        remote_port: script.local_addr().unwrap().port(),
    };
    tokio::spawn(mock_script(script));

    let transport = Arc::new(OscTransport::bind(&config).await.unwrap());
    let query = Arc::new(OscQuery::new(transport, Duration::from_secs(2)));
    let bridge = Arc::new(LiveBridge::new(query, Duration::from_secs(5)));

    SessionManager::new(
        bridge,
        Arc::new(provider),
        ObserverConfig::default(),
        "test prompt".to_string(),
    )
}

fn kind(event: &ClientEvent) -> String {
    serde_json::to_value(event).unwrap()["type"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

#[tokio::test]
async fn attach_index_chat_approve_flow() {
    let manager = manager_against_mock(scripted_set_and_close()).await;
    let session = manager.get_or_create("s1", "my-project").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.attach(tx);
    session.run_indexing().await;

    // Indexing frames: starts at {true, 0}, ends {false, 100}, then the
    // track summary.
    let first = serde_json::to_value(next_event(&mut rx).await).unwrap();
    assert_eq!(first["type"], "indexing_status");
    assert_eq!(first["content"]["isIndexing"], true);
    assert_eq!(first["content"]["progress"], 0);

    let mut saw_done = false;
    loop {
        let event = serde_json::to_value(next_event(&mut rx).await).unwrap();
        match event["type"].as_str().unwrap() {
            "indexing_status" => {
                if event["content"]["isIndexing"] == false {
                    assert_eq!(event["content"]["progress"], 100);
                    saw_done = true;
                }
            }
            "tracks" => {
                assert!(saw_done);
                assert_eq!(event["content"][0]["track_name"], "Bass");
                assert_eq!(event["content"][0]["devices"][0]["name"], "Reverb");
                break;
            }
            other => panic!("unexpected event during indexing: {other}"),
        }
    }
    assert!(session.mirror.is_indexed());
    assert_eq!(session.observer.observed_count(), 2);

    // One chat turn with an approved mutation.
    session.spawn_turn(ChatContent::Text("turn down the reverb on Bass".into()));

    let mut kinds = Vec::new();
    let mut function_result = None;
    loop {
        let event = next_event(&mut rx).await;
        kinds.push(kind(&event));

        let value = serde_json::to_value(&event).unwrap();
        match value["type"].as_str().unwrap() {
            "approval_required" => {
                assert_eq!(value["content"][0]["tool_call_id"], "tc_1");
                assert!(session.resolve_approvals(HashMap::from([(
                    "tc_1".to_string(),
                    true
                )])));
            }
            "function_result" => {
                function_result = Some(value["content"].as_str().unwrap().to_string());
            }
            _ => {}
        }

        if kinds.iter().filter(|k| k.as_str() == "end_message").count() == 2 {
            break;
        }
    }

    assert_eq!(
        kinds,
        vec![
            "text",
            "end_message",
            "approval_required",
            "function_call",
            "function_result",
            "text",
            "end_message",
        ]
    );

    // The set really went through the bridge: before/after strings from
    // the mock script.
    let result = function_result.unwrap();
    assert!(result.contains("0.60"), "missing before string: {result}");
    assert!(result.contains("0.30"), "missing after string: {result}");
}

#[tokio::test]
async fn second_turn_while_busy_is_rejected() {
    // A provider that stalls long enough for the second send to collide.
    struct StallingProvider;

    #[async_trait]
    impl ChatProvider for StallingProvider {
        async fn stream_turn(
            &self,
            _request: TurnRequest,
        ) -> Result<mpsc::Receiver<StreamEvent>> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx
                    .send(StreamEvent::Completed(AssistantTurn {
                        blocks: vec![ContentBlock::Text { text: "hi".into() }],
                        stop_reason: StopReason::EndTurn,
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    let script = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = OscConfig {
        local_port: 0,
        remote_host: "127.0.0.1".to_string(),
        remote_port: script.local_addr().unwrap().port(),
    };
    tokio::spawn(mock_script(script));
    let transport = Arc::new(OscTransport::bind(&config).await.unwrap());
    let query = Arc::new(OscQuery::new(transport, Duration::from_secs(2)));
    let bridge = Arc::new(LiveBridge::new(query, Duration::from_secs(5)));
    let manager = SessionManager::new(
        bridge,
        Arc::new(StallingProvider),
        ObserverConfig::default(),
        "test prompt".to_string(),
    );

    let session = manager.get_or_create("s2", "my-project").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.attach(tx);

    session.spawn_turn(ChatContent::Text("first".into()));
    session.spawn_turn(ChatContent::Text("second".into()));

    // The collision surfaces as an error event before the first turn's
    // output.
    let event = serde_json::to_value(next_event(&mut rx).await).unwrap();
    assert_eq!(event["type"], "error");

    // The first turn still completes.
    let event = serde_json::to_value(next_event(&mut rx).await).unwrap();
    assert_eq!(event["type"], "end_message");
}

#[tokio::test]
async fn reconnect_swaps_the_sink() {
    let manager = manager_against_mock(scripted_set_and_close()).await;
    let session = manager.get_or_create("s3", "my-project").await;

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    session.attach(tx1);
    session.run_indexing().await;
    while rx1.try_recv().is_ok() {}

    // Detach, then attach a fresh channel; the session (and its index)
    // survive.
    session.detach();
    assert!(session.mirror.is_indexed());

    let (tx2, mut rx2) = mpsc::unbounded_channel();
    session.attach(tx2);
    session.send_event(ClientEvent::indexing_done());

    let event = serde_json::to_value(next_event(&mut rx2).await).unwrap();
    assert_eq!(event["type"], "indexing_status");
    assert_eq!(event["content"]["isIndexing"], false);
    assert!(rx1.try_recv().is_err());
}
