//! End to end tests against an in-process fake controller speaking the wire
//! protocol over loopback TCP and UDP.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use omnibot::{
    configuration::{RobotConfiguration, Timeouts},
    drive_controller::{DriveController, DriveState},
    error::Error,
    protocol::{ClientMessage, ControlReply, DiscoveryMessage},
    session::{ConnectionState, Session},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    sync::mpsc,
    time::sleep,
};

const AUTH_KEY: &str = "secret";

#[derive(Clone)]
struct FakeOptions {
    ack_delay: Duration,
    camera: bool,
    frame_width: u16,
    frame_height: u16,
    frame_interval: Duration,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            ack_delay: Duration::ZERO,
            camera: false,
            frame_width: 640,
            frame_height: 480,
            frame_interval: Duration::from_millis(40),
        }
    }
}

struct FakeController {
    port: u16,
    history: Arc<Mutex<Vec<Vec<f32>>>>,
    disconnects: Arc<AtomicUsize>,
}

impl FakeController {
    fn command_count(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

async fn start_fake_controller(options: FakeOptions) -> FakeController {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let udp = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
    let history = Arc::new(Mutex::new(Vec::new()));
    let disconnects = Arc::new(AtomicUsize::new(0));

    let has_camera = options.camera;
    tokio::spawn(async move {
        let mut buffer = [0u8; 512];
        while let Ok((len, peer)) = udp.recv_from(&mut buffer).await {
            if let Ok(DiscoveryMessage::Discover) = serde_json::from_slice(&buffer[..len]) {
                let announce = serde_json::to_vec(&DiscoveryMessage::Announce {
                    id: "fake-bot".to_owned(),
                    motor_count: 4,
                    has_camera,
                })
                .unwrap();
                let _ = udp.send_to(&announce, peer).await;
            }
        }
    });

    let connection_history = Arc::clone(&history);
    let connection_disconnects = Arc::clone(&disconnects);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let _ = stream.set_nodelay(true);
            handle_connection(stream, Arc::clone(&connection_history), options.clone()).await;
            connection_disconnects.fetch_add(1, Ordering::SeqCst);
        }
    });

    FakeController {
        port,
        history,
        disconnects,
    }
}

async fn handle_connection(
    stream: TcpStream,
    history: Arc<Mutex<Vec<Vec<f32>>>>,
    options: FakeOptions,
) {
    let (mut read, mut write) = stream.into_split();
    let (event_sender, mut events) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = read_client_message(&mut read).await {
            if event_sender.send(message).is_err() {
                break;
            }
        }
    });

    match events.recv().await {
        Some(ClientMessage::Auth { key }) if key == AUTH_KEY => {
            write_control(&mut write, &ControlReply::AuthOk).await;
        }
        Some(ClientMessage::Auth { .. }) => {
            write_control(
                &mut write,
                &ControlReply::AuthRejected {
                    reason: "bad key".to_owned(),
                },
            )
            .await;
            return;
        }
        _ => return,
    }

    let pixels = options
        .camera
        .then(|| build_frame_pixels(options.frame_width, options.frame_height));
    let mut ticker = tokio::time::interval(options.frame_interval);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                None => break,
                Some(ClientMessage::SetSpeeds { seq, targets }) => {
                    history.lock().unwrap().push(targets);
                    if !options.ack_delay.is_zero() {
                        sleep(options.ack_delay).await;
                    }
                    write_control(&mut write, &ControlReply::Ack { seq }).await;
                }
                Some(ClientMessage::Auth { .. }) => {}
            },
            _ = ticker.tick(), if pixels.is_some() => {
                write_frame(
                    &mut write,
                    options.frame_width,
                    options.frame_height,
                    pixels.as_ref().unwrap(),
                )
                .await;
            }
        }
    }
}

async fn read_client_message(read: &mut OwnedReadHalf) -> Option<ClientMessage> {
    let tag = read.read_u8().await.ok()?;
    if tag != 1 {
        return None;
    }
    let len = read.read_u32().await.ok()? as usize;
    let mut payload = vec![0u8; len];
    read.read_exact(&mut payload).await.ok()?;
    serde_json::from_slice(&payload).ok()
}

async fn write_control(write: &mut OwnedWriteHalf, reply: &ControlReply) {
    let payload = serde_json::to_vec(reply).unwrap();
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(1u8);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    let _ = write.write_all(&buf).await;
}

async fn write_frame(write: &mut OwnedWriteHalf, width: u16, height: u16, pixels: &[u8]) {
    let mut buf = Vec::with_capacity(9 + pixels.len());
    buf.push(2u8);
    buf.extend_from_slice(&((4 + pixels.len()) as u32).to_be_bytes());
    buf.extend_from_slice(&width.to_be_bytes());
    buf.extend_from_slice(&height.to_be_bytes());
    buf.extend_from_slice(pixels);
    let _ = write.write_all(&buf).await;
}

fn build_frame_pixels(width: u16, height: u16) -> Vec<u8> {
    (0..width as usize * height as usize * 3)
        .map(|index| (index % 256) as u8)
        .collect()
}

fn test_timeouts() -> Timeouts {
    Timeouts {
        discovery_ms: 300,
        initialize_ms: 2000,
        command_ms: 1000,
        camera_pull_ms: 2000,
        command_attempts: 3,
    }
}

fn session_for(port: u16) -> Arc<Session> {
    Arc::new(Session::new("127.0.0.1", port, AUTH_KEY, test_timeouts()).unwrap())
}

async fn connected_controller(fake: &FakeController) -> (Arc<Session>, DriveController) {
    let session = session_for(fake.port);
    session.initialize().await.unwrap();
    let controller =
        DriveController::new(Arc::clone(&session), RobotConfiguration::default_mecanum())
            .unwrap();
    (session, controller)
}

#[tokio::test]
async fn discovery_finds_running_controller() {
    let fake = start_fake_controller(FakeOptions {
        camera: true,
        ..FakeOptions::default()
    })
    .await;
    let session = session_for(fake.port);
    let devices = session
        .discover_devices(Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "fake-bot");
    assert_eq!(devices[0].motor_count, 4);
    assert!(devices[0].has_camera);
}

#[tokio::test]
async fn discovery_without_controller_returns_empty() {
    let session = session_for(59998);
    let devices = session
        .discover_devices(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(devices.is_empty());
}

#[tokio::test]
async fn initialize_connects_and_is_idempotent() {
    let fake = start_fake_controller(FakeOptions::default()).await;
    let session = session_for(fake.port);
    assert_eq!(session.state(), ConnectionState::Uninitialized);
    session.initialize().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    // second call is a no-op
    session.initialize().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn wrong_key_is_rejected_and_closes_the_session() {
    let fake = start_fake_controller(FakeOptions::default()).await;
    let session =
        Arc::new(Session::new("127.0.0.1", fake.port, "wrong", test_timeouts()).unwrap());
    let result = session.initialize().await;
    assert!(matches!(result, Err(Error::Auth(_))));
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn motion_before_initialize_produces_no_command() {
    let fake = start_fake_controller(FakeOptions::default()).await;
    let session = session_for(fake.port);
    let controller =
        DriveController::new(Arc::clone(&session), RobotConfiguration::default_mecanum())
            .unwrap();
    let result = controller.straight(10.0).await;
    assert!(matches!(result, Err(Error::Connection(_))));
    assert_eq!(fake.command_count(), 0);
}

#[tokio::test]
async fn straight_then_stop_ends_all_zero() {
    let fake = start_fake_controller(FakeOptions::default()).await;
    let (_session, controller) = connected_controller(&fake).await;

    controller.straight(50.0).await.unwrap();
    assert_eq!(controller.state(), DriveState::Moving);
    controller.stop().await.unwrap();
    assert_eq!(controller.state(), DriveState::Idle);

    let history = fake.history.lock().unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].iter().any(|target| *target != 0.0));
    assert!(history[1].iter().all(|target| *target == 0.0));
}

#[tokio::test]
async fn held_rotation_then_stop_ends_all_zero_last() {
    let fake = start_fake_controller(FakeOptions::default()).await;
    let (_session, controller) = connected_controller(&fake).await;

    controller.drive(0.0, 0.0, -100.0).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    controller.stop().await.unwrap();

    let history = fake.history.lock().unwrap();
    let last = history.last().unwrap();
    assert!(last.iter().all(|target| *target == 0.0));
    // every earlier entry stems from the rotation command
    for entry in &history[..history.len() - 1] {
        assert!(entry.iter().any(|target| *target != 0.0));
    }
}

#[tokio::test]
async fn stop_wins_against_in_flight_command() {
    let fake = start_fake_controller(FakeOptions {
        ack_delay: Duration::from_millis(200),
        ..FakeOptions::default()
    })
    .await;
    let (_session, controller) = connected_controller(&fake).await;
    let controller = Arc::new(controller);

    let mover = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.diagonal(30.0, 20.0).await })
    };
    // let the diagonal command reach the wire, then stop while its ack is
    // still outstanding
    sleep(Duration::from_millis(50)).await;
    controller.stop().await.unwrap();
    mover.await.unwrap().unwrap();

    let history = fake.history.lock().unwrap();
    assert!(history.len() >= 2);
    assert!(history[0].iter().any(|target| *target != 0.0));
    assert!(history.last().unwrap().iter().all(|target| *target == 0.0));
}

#[tokio::test]
async fn camera_yields_decoded_frames_within_timeout() {
    let fake = start_fake_controller(FakeOptions {
        camera: true,
        ..FakeOptions::default()
    })
    .await;
    let (_session, controller) = connected_controller(&fake).await;

    let mut camera = controller.camera().unwrap();
    let first = camera.next_frame().await.unwrap().unwrap();
    let second = camera.next_frame().await.unwrap().unwrap();
    for frame in [&first, &second] {
        assert_eq!(frame.shape(), (3, 480, 640));
        assert!(frame
            .as_slice()
            .iter()
            .all(|value| (0.0..=1.0).contains(value)));
    }
    assert!(second.timestamp() >= first.timestamp());
}

#[tokio::test]
async fn camera_can_only_be_taken_once() {
    let fake = start_fake_controller(FakeOptions {
        camera: true,
        ..FakeOptions::default()
    })
    .await;
    let (_session, controller) = connected_controller(&fake).await;

    let _camera = controller.camera().unwrap();
    assert!(controller.camera().is_err());
}

#[tokio::test]
async fn close_releases_the_transport() {
    let fake = start_fake_controller(FakeOptions::default()).await;
    let (session, controller) = connected_controller(&fake).await;

    session.close().await;
    drop(controller);
    drop(session);

    // the controller end must observe EOF without hanging up first
    for _ in 0..200 {
        if fake.disconnect_count() == 1 {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("controller never observed the link closing");
}

// the current-thread runtime's wakeup order can hide this race, so it runs
// on worker threads
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_racing_an_in_flight_command_leaves_idle() {
    let fake = start_fake_controller(FakeOptions {
        ack_delay: Duration::from_millis(200),
        ..FakeOptions::default()
    })
    .await;
    let (_session, controller) = connected_controller(&fake).await;
    let controller = Arc::new(controller);

    let mover = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.diagonal(30.0, 20.0).await })
    };
    sleep(Duration::from_millis(50)).await;
    controller.stop().await.unwrap();
    mover.await.unwrap().unwrap();

    // the stop was issued last, the superseded command must not win the
    // state back
    assert_eq!(controller.state(), DriveState::Idle);
    let history = fake.history.lock().unwrap();
    assert!(history.last().unwrap().iter().all(|target| *target == 0.0));
}

#[tokio::test]
async fn initialize_shares_one_deadline_across_connect_and_handshake() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // accept the connection but never answer the handshake
        let (stream, _) = listener.accept().await.unwrap();
        sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let timeouts = Timeouts {
        initialize_ms: 300,
        ..test_timeouts()
    };
    let session = Arc::new(Session::new("127.0.0.1", port, AUTH_KEY, timeouts).unwrap());
    let start = tokio::time::Instant::now();
    let result = session.initialize().await;
    assert!(matches!(result, Err(Error::Timeout { .. })));
    // a single budget for the whole initialize, not one per await
    assert!(start.elapsed() < Duration::from_millis(600));
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn commands_rejected_after_close() {
    let fake = start_fake_controller(FakeOptions::default()).await;
    let (session, controller) = connected_controller(&fake).await;

    session.close().await;
    assert_eq!(session.state(), ConnectionState::Closed);
    let result = controller.straight(10.0).await;
    assert!(matches!(result, Err(Error::Connection(_))));
    // stop still succeeds locally
    controller.stop().await.unwrap();
}
