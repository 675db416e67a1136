//! End-to-end protocol scenarios driven over a real TCP listener and a real
//! WebSocket client, mirroring the teacher's `tests/receiver_resume.rs`
//! convention of exercising the server rather than a mock (spec §8).

use loquilex_envelope::{ClientAckData, Envelope, MsgType, ResumeRequestData, SCHEMA_VERSION};
use loquilex_gateway::{build_router, GatewayConfig, GatewayState};
use loquilex_session_core::{SessionManager, SessionManagerConfig, SystemClock};
use loquilex_test_utils::MockWsClient;
use std::sync::Arc;

fn test_manager_config() -> SessionManagerConfig {
    let mut cfg = GatewayConfig::from_env().manager;
    cfg.engine.hb_interval_ms = 60_000; // keep heartbeats out of the way of assertions
    cfg.engine.hb_timeout_ms = 300;
    cfg.engine.client_event_buffer = 3;
    cfg.engine.drain_deadline_ms = 200;
    cfg.stop_deadline_ms = 10;
    cfg.resume_max_events = 50;
    cfg.engine.resume_window_secs = 30;
    cfg
}

async fn spawn_gateway(manager_config: SessionManagerConfig) -> (String, Arc<SessionManager>) {
    let manager = Arc::new(SessionManager::new(manager_config.clone(), Arc::new(SystemClock::new())));
    let mut config = GatewayConfig::from_env();
    config.manager = manager_config;
    let state = GatewayState::new(manager.clone(), Arc::new(config));
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), manager)
}

async fn start_session(base: &str) -> String {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/sessions"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    body["session_id"].as_str().unwrap().to_owned()
}

fn ws_url(base: &str, sid: &str) -> String {
    format!("ws{}/ws/{sid}", base.trim_start_matches("http"))
}

fn client_envelope(t: MsgType, data: serde_json::Value) -> Envelope {
    Envelope {
        v: SCHEMA_VERSION,
        t,
        sid: None,
        id: uuid::Uuid::new_v4().to_string(),
        seq: 0,
        corr: None,
        t_wall: "2026-07-31T00:00:00.000Z".into(),
        t_mono_ns: 0,
        data,
    }
}

#[tokio::test]
async fn welcome_handshake_is_the_first_envelope() {
    let (base, _mgr) = spawn_gateway(test_manager_config()).await;
    let sid = start_session(&base).await;
    let mut client = MockWsClient::connect(&ws_url(&base, &sid)).await.unwrap();

    let welcome = client.recv_envelope().await.unwrap();
    assert_eq!(welcome.t, MsgType::ServerWelcome);
    assert_eq!(welcome.seq, 0);
    assert_eq!(welcome.sid.as_deref(), Some(sid.as_str()));
}

#[tokio::test]
async fn partial_then_final_drops_oldest_partial_under_queue_pressure() {
    let (base, mgr) = spawn_gateway(test_manager_config()).await;
    let sid = start_session(&base).await;
    let mut client = MockWsClient::connect(&ws_url(&base, &sid)).await.unwrap();
    client.recv_envelope().await.unwrap(); // welcome

    let session = mgr.get(&sid).await.unwrap();
    session
        .publish(MsgType::AsrPartial, serde_json::json!({"n": 1}))
        .await
        .unwrap();
    session
        .publish(MsgType::AsrPartial, serde_json::json!({"n": 2}))
        .await
        .unwrap();
    session
        .publish(MsgType::AsrPartial, serde_json::json!({"n": 3}))
        .await
        .unwrap();
    session
        .publish(MsgType::AsrFinal, serde_json::json!({"n": 4}))
        .await
        .unwrap();

    let mut seqs = Vec::new();
    for _ in 0..3 {
        seqs.push(client.recv_envelope().await.unwrap().seq);
    }
    assert_eq!(seqs, vec![2, 3, 4]);
}

#[tokio::test]
async fn ack_beyond_delivered_seq_closes_the_connection() {
    let (base, mgr) = spawn_gateway(test_manager_config()).await;
    let sid = start_session(&base).await;
    let mut client = MockWsClient::connect(&ws_url(&base, &sid)).await.unwrap();
    client.recv_envelope().await.unwrap(); // welcome

    let session = mgr.get(&sid).await.unwrap();
    session
        .publish(MsgType::Status, serde_json::json!({"state": "running"}))
        .await
        .unwrap();
    client.recv_envelope().await.unwrap(); // the status we just published

    client
        .send_envelope(&client_envelope(
            MsgType::ClientAck,
            serde_json::to_value(ClientAckData { ack_seq: 100 }).unwrap(),
        ))
        .await
        .unwrap();

    let err = client.recv_envelope().await.unwrap();
    assert_eq!(err.t, MsgType::ServerError);
    assert_eq!(err.data["code"], "invalid_ack");
    assert!(client.recv_envelope().await.is_err(), "connection should close after invalid_ack");
}

#[tokio::test]
async fn resume_within_replay_window_replays_missed_envelopes_then_new_ones() {
    let (base, mgr) = spawn_gateway(test_manager_config()).await;
    let sid = start_session(&base).await;
    let session = mgr.get(&sid).await.unwrap();

    {
        let mut client = MockWsClient::connect(&ws_url(&base, &sid)).await.unwrap();
        client.recv_envelope().await.unwrap(); // welcome
        session
            .publish(MsgType::AsrFinal, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(client.recv_envelope().await.unwrap().seq, 1);
        client.close().await.unwrap();
    }

    session
        .publish(MsgType::AsrFinal, serde_json::json!({"n": 2}))
        .await
        .unwrap();

    let mut resumed = MockWsClient::connect(&ws_url(&base, &sid)).await.unwrap();
    resumed.recv_envelope().await.unwrap(); // welcome on the new connection
    resumed
        .send_envelope(&client_envelope(
            MsgType::SessionResume,
            serde_json::to_value(ResumeRequestData {
                session_id: sid.clone(),
                last_seq: 1,
                epoch: 1,
            })
            .unwrap(),
        ))
        .await
        .unwrap();

    let snapshot = resumed.recv_envelope().await.unwrap();
    assert_eq!(snapshot.t, MsgType::SessionSnapshot);
    assert_eq!(snapshot.data["current_seq"], 2);

    let replayed = resumed.recv_envelope().await.unwrap();
    assert_eq!(replayed.seq, 2);

    session
        .publish(MsgType::AsrFinal, serde_json::json!({"n": 3}))
        .await
        .unwrap();
    assert_eq!(resumed.recv_envelope().await.unwrap().seq, 3);
}

#[tokio::test]
async fn resume_with_wrong_epoch_yields_session_new() {
    let (base, _mgr) = spawn_gateway(test_manager_config()).await;
    let sid = start_session(&base).await;
    let mut client = MockWsClient::connect(&ws_url(&base, &sid)).await.unwrap();
    client.recv_envelope().await.unwrap(); // welcome

    client
        .send_envelope(&client_envelope(
            MsgType::SessionResume,
            serde_json::to_value(ResumeRequestData {
                session_id: sid.clone(),
                last_seq: 0,
                epoch: 99,
            })
            .unwrap(),
        ))
        .await
        .unwrap();

    let env = client.recv_envelope().await.unwrap();
    assert_eq!(env.t, MsgType::SessionNew);
}
