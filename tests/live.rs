//! End-to-end connection tests against a fake backend: wiremock for
//! HTTP, an in-process WebSocket server for the socket path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use smartcielo::{
    CommandAction, CommandError, Config, Connection, ConnectionState, Event, Mode, Power,
};

struct FakeSocketServer {
    url: String,
    /// Origin header captured during the upgrade handshake
    origin: Arc<Mutex<Option<String>>>,
    /// Frames to push to the connected client
    push: mpsc::Sender<String>,
    /// Commands received from the client
    received: mpsc::Receiver<String>,
}

/// Single-connection WebSocket server: records the upgrade's Origin
/// header, forwards pushed frames to the client, and captures every
/// text frame the client sends.
async fn spawn_socket_server() -> FakeSocketServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let origin = Arc::new(Mutex::new(None));
    let (received_tx, received) = mpsc::channel::<String>(16);
    let (push, mut push_rx) = mpsc::channel::<String>(16);

    let captured = origin.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request, response: Response| {
            *captured.lock().unwrap() = request
                .headers()
                .get("Origin")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        let (mut sink, mut read) = ws.split();

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = received_tx.send(text.as_str().to_string()).await;
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
                frame = push_rx.recv() => match frame {
                    Some(text) => sink.send(Message::text(text)).await.unwrap(),
                    None => break,
                },
            }
        }
    });

    FakeSocketServer {
        url,
        origin,
        push,
        received,
    }
}

async fn mock_backend() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 200,
            "message": "",
            "data": {"user": {
                "sessionId": "sess-1",
                "userId": "user-1",
                "accessToken": "at-1",
                "refreshToken": "rt-1",
                "expiresIn": 3600
            }}
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/web/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"listDevices": [{
                "macAddress": "AA:BB:CC:DD:EE:FF",
                "deviceName": "Living Room",
                "applianceId": 9001,
                "fwVersion": "2.4.2",
                "deviceTypeVersion": "BI03",
                "latestAction": {"power": "off", "temp": "70", "mode": "auto", "fanspeed": "auto"},
                "latEnv": {"temp": 71.0}
            }]}
        })))
        .mount(&server)
        .await;

    server
}

fn test_config(api_base: &str, ws_base: &str) -> Config {
    let mut config = Config::new("user@example.com", "password", "203.0.113.7");
    config.api_base = api_base.to_string();
    config.ws_base = ws_base.to_string();
    config.connection.auto_reconnect = false;
    config.connection.disable_token_refresh = true;
    config
}

#[tokio::test]
async fn test_connect_seeds_devices_and_sends_command() {
    let http = mock_backend().await;
    let mut socket = spawn_socket_server().await;
    let conn = Connection::new(test_config(&http.uri(), &socket.url));

    conn.connect().await.unwrap();
    assert_eq!(conn.state().await, ConnectionState::Live);

    // The upgrade must carry the web client's Origin header.
    assert_eq!(
        socket.origin.lock().unwrap().as_deref(),
        Some("https://home.smartcielo.com")
    );

    // Directory snapshot seeded the state machine.
    let device = conn.device("aa:bb:cc:dd:ee:ff").await.unwrap();
    assert_eq!(device.state.power, Power::Off);
    assert_eq!(device.state.temperature, "70");
    assert_eq!(device.telemetry.room_temperature, Some(71.0));

    conn.send_command("AA:BB:CC:DD:EE:FF", CommandAction::Power(Power::On))
        .await
        .unwrap();

    let raw = timeout(Duration::from_secs(5), socket.received.recv())
        .await
        .unwrap()
        .unwrap();
    let payload: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(payload["macAddress"], "AABBCCDDEEFF");
    assert_eq!(payload["actionType"], "power");
    assert_eq!(payload["actionValue"], "on");
    assert_eq!(payload["actions"]["power"], "on");
    assert_eq!(payload["actions"]["temp"], "70");
    assert_eq!(payload["oldPower"], "off");
    assert_eq!(payload["user_id"], "user-1");

    conn.disconnect().await;
    assert_eq!(conn.state().await, ConnectionState::Idle);
}

#[tokio::test]
async fn test_inbound_updates_route_to_device_and_events() {
    let http = mock_backend().await;
    let socket = spawn_socket_server().await;
    let conn = Connection::new(test_config(&http.uri(), &socket.url));

    conn.connect().await.unwrap();
    let mut events = conn.subscribe();

    // Lowercase, colon-separated MAC must hit the same device.
    socket
        .push
        .send(
            json!({
                "message_type": "StateUpdate",
                "mac_address": "aa:bb:cc:dd:ee:ff",
                "action": {"power": "on", "mode": "cool"}
            })
            .to_string(),
        )
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        Event::StateChanged { mac_address, state } => {
            assert_eq!(mac_address, "AABBCCDDEEFF");
            assert_eq!(state.power, Power::On);
            assert_eq!(state.mode, Mode::Cool);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Partial update: power flips, mode must survive; telemetry rides
    // the same frame and raises its own event.
    socket
        .push
        .send(
            json!({
                "message_type": "StateUpdate",
                "mac_address": "AABBCCDDEEFF",
                "action": {"power": "off"},
                "lat_env_var": {"temperature": 73.5}
            })
            .to_string(),
        )
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        Event::StateChanged { state, .. } => {
            assert_eq!(state.power, Power::Off);
            assert_eq!(state.mode, Mode::Cool);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        Event::TemperatureChanged { telemetry, .. } => {
            assert_eq!(telemetry.room_temperature, Some(73.5));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let device = conn.device("AABBCCDDEEFF").await.unwrap();
    assert_eq!(device.state.mode, Mode::Cool);

    conn.disconnect().await;
}

#[tokio::test]
async fn test_unmatched_frames_are_ignored() {
    let http = mock_backend().await;
    let socket = spawn_socket_server().await;
    let conn = Connection::new(test_config(&http.uri(), &socket.url));

    conn.connect().await.unwrap();
    let mut events = conn.subscribe();

    for frame in [
        json!({"message_type": "Heartbeat"}).to_string(),
        json!({"mac_address": "AABBCCDDEEFF"}).to_string(),
        "not json at all".to_string(),
        json!({
            "message_type": "StateUpdate",
            "mac_address": "00:00:00:00:00:00",
            "action": {"power": "on"}
        })
        .to_string(),
    ] {
        socket.push.send(frame).await.unwrap();
    }

    // None of those frames may produce an event or disturb the device.
    assert!(timeout(Duration::from_millis(500), events.recv())
        .await
        .is_err());
    let device = conn.device("AABBCCDDEEFF").await.unwrap();
    assert_eq!(device.state.power, Power::Off);

    conn.disconnect().await;
}

#[tokio::test]
async fn test_send_command_requires_known_device_and_socket() {
    let http = mock_backend().await;
    let socket = spawn_socket_server().await;
    let conn = Connection::new(test_config(&http.uri(), &socket.url));

    // Before connecting nothing is known, so the device lookup fails.
    let err = conn
        .send_command("AA:BB:CC:DD:EE:FF", CommandAction::Power(Power::On))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::UnknownDevice(_)));

    // After a disconnect the device is still known but the socket is
    // gone; that is a distinct failure.
    conn.connect().await.unwrap();
    conn.disconnect().await;

    let err = conn
        .send_command("AA:BB:CC:DD:EE:FF", CommandAction::Power(Power::On))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::NotConnected));
}

#[tokio::test]
async fn test_reconnect_exhaustion_reports_error_and_goes_idle() {
    let http = mock_backend().await;
    let socket = spawn_socket_server().await;
    let mut config = test_config(&http.uri(), &socket.url);
    config.connection.auto_reconnect = true;
    config.connection.reconnect_base_ms = 20;
    config.connection.reconnect_max_ms = 50;
    config.connection.max_reconnect_attempts = 2;

    let conn = Connection::new(config);
    conn.connect().await.unwrap();
    let mut events = conn.subscribe();

    // Kill the server side; the listener is gone too, so every
    // reconnect attempt fails until the budget is exhausted.
    drop(socket.push);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = timeout(remaining, events.recv())
            .await
            .expect("no exhaustion event before deadline")
            .unwrap();
        if let Event::ConnectionError { message } = event {
            if message.contains("exhausted") {
                break;
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.state().await, ConnectionState::Idle);
}

#[tokio::test]
async fn test_exhaustion_reports_once_and_stays_idle() {
    let http = mock_backend().await;
    let socket = spawn_socket_server().await;
    let mut config = test_config(&http.uri(), &socket.url);
    config.connection.auto_reconnect = true;
    config.connection.reconnect_base_ms = 20;
    config.connection.reconnect_max_ms = 50;
    config.connection.max_reconnect_attempts = 1;
    config.connection.health_check_secs = 1;

    let conn = Connection::new(config);
    conn.connect().await.unwrap();
    let mut events = conn.subscribe();

    drop(socket.push);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = timeout(remaining, events.recv())
            .await
            .expect("no exhaustion event before deadline")
            .unwrap();
        if let Event::ConnectionError { message } = event {
            if message.contains("exhausted") {
                break;
            }
        }
    }

    // The health probe keeps ticking past the exhaustion, but an
    // exhausted manager must stay Idle and never re-report.
    let mut repeats = 0;
    let window = tokio::time::Instant::now() + Duration::from_millis(2_500);
    loop {
        let remaining = window.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, events.recv()).await {
            Ok(Ok(Event::ConnectionError { message })) if message.contains("exhausted") => {
                repeats += 1;
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
    assert_eq!(repeats, 0);
    assert_eq!(conn.state().await, ConnectionState::Idle);
}
