use super::*;
use crate::data_link::NoTranslation;
use crate::physical::mock::{Inbound, MockBackend, MockBus, WriteBehavior};
use std::sync::Mutex;
use std::thread;

struct Harness {
    driver: Arc<SocketCanDriver<MockBackend>>,
    bus: Arc<MockBus>,
    frames: Arc<Mutex<Vec<Frame>>>,
    states: Arc<Mutex<Vec<State>>>,
}

impl Harness {
    fn new(backend: MockBackend, timeouts: Timeouts) -> Self {
        let bus = backend.bus();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let states = Arc::new(Mutex::new(Vec::new()));
        let base = {
            let frames = Arc::clone(&frames);
            let states = Arc::clone(&states);
            Arc::new(TransportBase::new(
                move |frame: &Frame| frames.lock().unwrap().push(*frame),
                move |state: &State| states.lock().unwrap().push(*state),
            ))
        };
        let driver = SocketCanDriver::new(backend, base).with_timeouts(timeouts);
        Self {
            driver: Arc::new(driver),
            bus,
            frames,
            states,
        }
    }

    fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    fn states(&self) -> Vec<State> {
        self.states.lock().unwrap().clone()
    }

    fn driver_states(&self) -> Vec<DriverState> {
        self.states().iter().map(|s| s.driver_state).collect()
    }

    fn clear_states(&self) {
        self.states.lock().unwrap().clear();
    }
}

fn harness() -> Harness {
    Harness::new(MockBackend::new(), Timeouts::default())
}

fn open_harness() -> Harness {
    let h = harness();
    h.driver.init("vcan0", 0).unwrap();
    h
}

fn slow_send_harness() -> Harness {
    let h = Harness::new(
        MockBackend::new(),
        Timeouts {
            send_lock_ms: 10,
            write_ms: 100,
        },
    );
    h.driver.init("vcan0", 0).unwrap();
    h.bus.set_write_delay(Duration::from_millis(300));
    h
}

const ALL_STEPS: [SetupStep; 5] = [
    SetupStep::CreateSocket,
    SetupStep::ResolveInterface,
    SetupStep::InstallErrorFilter,
    SetupStep::Bind,
    SetupStep::AssignIo,
];

#[test]
fn test_init_opens_socket() {
    let h = harness();
    h.driver.init("vcan0", 0).unwrap();

    let state = h.driver.state();
    assert!(state.is_open());
    assert_eq!(state.error_code, ErrorCode::NONE);
    assert_eq!(h.driver.device(), "vcan0");

    assert_eq!(h.bus.steps(), ALL_STEPS);
    assert_eq!(h.bus.error_filter(), Some(ErrorClass::FILTER));
    assert_eq!(h.bus.bound_index(), Some(3));
    assert_eq!(h.bus.live_sockets(), 1);
    assert_eq!(h.driver_states(), vec![DriverState::Open]);
}

#[test]
fn test_init_rejects_bitrate() {
    let h = harness();
    let result = h.driver.init("vcan0", 500_000);

    assert!(matches!(result, Err(DriverError::UnsupportedBitrate(500_000))));
    assert_eq!(h.driver.state(), State::default());
    assert!(h.bus.steps().is_empty());
    assert!(h.states().is_empty());
}

#[test]
fn test_init_rejects_invalid_device() {
    let h = harness();
    assert!(matches!(
        h.driver.init("", 0),
        Err(DriverError::InvalidDevice(_))
    ));
    assert!(matches!(
        h.driver.init("a_very_long_interface", 0),
        Err(DriverError::InvalidDevice(_))
    ));
    assert!(h.bus.steps().is_empty());
    assert!(!h.driver.state().is_open());
}

#[test]
fn test_init_when_open() {
    let h = open_harness();
    let result = h.driver.init("vcan0", 0);

    assert!(matches!(
        result,
        Err(DriverError::NotClosed(DriverState::Open))
    ));
    assert!(h.driver.state().is_open());
    assert_eq!(h.bus.steps().len(), ALL_STEPS.len());
    assert_eq!(h.bus.live_sockets(), 1);
}

#[test]
fn test_setup_step_failures_release_socket() {
    let cases = [
        (SetupStep::CreateSocket, libc::EAFNOSUPPORT),
        (SetupStep::ResolveInterface, libc::ENODEV),
        (SetupStep::InstallErrorFilter, libc::ENOPROTOOPT),
        (SetupStep::Bind, libc::EADDRNOTAVAIL),
        (SetupStep::AssignIo, libc::EBADF),
    ];

    for (failing, errno) in cases {
        let h = Harness::new(MockBackend::new_failing(failing, errno), Timeouts::default());
        let result = h.driver.init("vcan0", 0);

        match result {
            Err(DriverError::Setup { step, source }) => {
                assert_eq!(step, failing);
                assert_eq!(source.raw_os_error(), Some(errno));
            }
            other => panic!("{failing}: unexpected result {other:?}"),
        }

        let state = h.driver.state();
        assert_eq!(state.driver_state, DriverState::Closed, "{failing}");
        assert_eq!(state.error_code.value(), errno, "{failing}");
        assert_eq!(h.bus.live_sockets(), 0, "{failing}");
        assert_eq!(h.bus.steps().last(), Some(&failing));
        assert!(!h.driver_states().contains(&DriverState::Open));
    }
}

#[test]
fn test_init_unknown_interface() {
    let h = harness();
    let result = h.driver.init("can7", 0);

    assert!(matches!(
        result,
        Err(DriverError::Setup {
            step: SetupStep::ResolveInterface,
            ..
        })
    ));
    assert_eq!(h.driver.state().error_code.value(), libc::ENODEV);
    assert_eq!(h.bus.live_sockets(), 0);
}

#[test]
fn test_init_after_failure() {
    let h = Harness::new(
        MockBackend::new_failing(SetupStep::Bind, libc::EADDRNOTAVAIL),
        Timeouts::default(),
    );
    assert!(h.driver.init("vcan0", 0).is_err());

    h.bus.clear_failures();
    h.driver.init("vcan0", 0).unwrap();

    let state = h.driver.state();
    assert!(state.is_open());
    assert_eq!(state.error_code, ErrorCode::NONE);
    assert_eq!(h.bus.live_sockets(), 1);
}

#[test]
fn test_init_with_config() {
    let config = DriverConfig::from_toml_str(
        r#"
        device = "vcan0"

        [timeouts]
        send_lock_ms = 25
        write_ms = 40
        "#,
    )
    .unwrap();

    let backend = MockBackend::new();
    let bus = backend.bus();
    let base = Arc::new(TransportBase::new(|_: &Frame| {}, |_: &State| {}));
    let driver = SocketCanDriver::from_config(backend, base, &config);

    assert_eq!(driver.timeouts().send_lock(), Duration::from_millis(25));
    assert_eq!(driver.timeouts().write(), Duration::from_millis(40));

    driver.init_with(&config).unwrap();
    assert!(driver.state().is_open());
    assert_eq!(bus.bound_index(), Some(3));
}

#[test]
fn test_enqueue_when_closed() {
    let h = harness();
    let result = h.driver.enqueue(&Frame::new(0x123, &[1]));

    assert!(matches!(result, Err(DriverError::NotOpen)));
    assert_eq!(h.driver.state(), State::default());
    assert!(h.bus.written_bytes().is_empty());
    assert!(h.states().is_empty());
}

#[test]
fn test_enqueue_writes_wire_frame() {
    let h = open_harness();
    h.driver.enqueue(&Frame::new(0x123, &[0xAA, 0xBB])).unwrap();

    let bytes = h.bus.written_bytes();
    assert_eq!(bytes.len(), WIRE_FRAME_SIZE);
    assert_eq!(bytes[0..4], 0x123u32.to_ne_bytes());
    assert_eq!(bytes[4], 2);
    assert_eq!(bytes[8..10], [0xAA, 0xBB]);
    assert!(bytes[10..].iter().all(|b| *b == 0));
}

#[test]
fn test_enqueue_extended_and_remote() {
    let h = open_harness();
    h.driver.enqueue(&Frame::extended(0x123, &[1, 2, 3])).unwrap();
    h.driver.enqueue(&Frame::remote(0x7FF, 4, false)).unwrap();

    let frames = h.bus.written_frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].can_id, 0x8000_0123);
    assert_eq!(frames[0].can_dlc, 3);
    assert_eq!(frames[1].can_id, 0x4000_07FF);
    assert_eq!(frames[1].can_dlc, 4);
    assert_eq!(frames[1].data, [0; 8]);
}

#[test]
fn test_enqueue_write_failure_keeps_socket() {
    let h = open_harness();
    h.bus.set_write_behavior(WriteBehavior::Fail(libc::ENOBUFS));

    let result = h.driver.enqueue(&Frame::new(0x10, &[1]));
    match result {
        Err(DriverError::Write(e)) => assert_eq!(e.raw_os_error(), Some(libc::ENOBUFS)),
        other => panic!("unexpected result {other:?}"),
    }

    let state = h.driver.state();
    assert!(state.is_open());
    assert_eq!(state.error_code.value(), libc::ENOBUFS);
    assert_eq!(h.bus.live_sockets(), 1);

    h.bus.set_write_behavior(WriteBehavior::Complete);
    h.driver.enqueue(&Frame::new(0x10, &[1])).unwrap();
    assert_eq!(h.bus.written_frames().len(), 1);
}

#[test]
fn test_enqueue_short_write() {
    let h = open_harness();
    h.bus.set_write_behavior(WriteBehavior::Short(10));

    let result = h.driver.enqueue(&Frame::new(0x10, &[1, 2]));
    assert!(matches!(
        result,
        Err(DriverError::ShortWrite {
            written: 10,
            expected: WIRE_FRAME_SIZE
        })
    ));
    assert_eq!(h.driver.state().error_code.value(), libc::EIO);
    assert!(h.driver.state().is_open());
}

#[test]
fn test_enqueue_rejects_oversized_dlc() {
    let h = open_harness();
    let frame = Frame {
        id: 0x10,
        dlc: 9,
        ..Default::default()
    };

    let result = h.driver.enqueue(&frame);
    assert!(matches!(result, Err(DriverError::InvalidFrame { dlc: 9 })));
    assert_eq!(h.driver.state().error_code.value(), libc::EINVAL);
    assert!(h.bus.written_bytes().is_empty());
}

#[test]
fn test_enqueue_lock_timeout() {
    let h = slow_send_harness();

    let sender = {
        let driver = Arc::clone(&h.driver);
        thread::spawn(move || driver.enqueue(&Frame::new(0x1, &[1])))
    };
    thread::sleep(Duration::from_millis(50));

    let result = h.driver.enqueue(&Frame::new(0x2, &[2]));
    assert!(matches!(result, Err(DriverError::LockTimeout(_))));
    assert_eq!(h.driver.state().error_code.value(), libc::ETIMEDOUT);

    sender.join().unwrap().unwrap();
    assert_eq!(h.bus.written_frames().len(), 1);
}

#[test]
fn test_concurrent_enqueue_does_not_interleave() {
    let h = Harness::new(
        MockBackend::new(),
        Timeouts {
            send_lock_ms: 5_000,
            write_ms: 100,
        },
    );
    h.driver.init("vcan0", 0).unwrap();

    let senders: Vec<_> = (0u8..8)
        .map(|sender| {
            let driver = Arc::clone(&h.driver);
            thread::spawn(move || {
                for seq in 0u8..20 {
                    let frame = Frame::new(sender as u32, &[sender; 8]);
                    let frame = Frame {
                        data: [sender, seq, sender, seq, sender, seq, sender, seq],
                        ..frame
                    };
                    driver.enqueue(&frame).unwrap();
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    let frames = h.bus.written_frames();
    assert_eq!(frames.len(), 8 * 20);

    let mut next_seq = [0u8; 8];
    for wire in frames {
        let sender = wire.can_id as u8;
        assert!(sender < 8);
        assert_eq!(wire.can_dlc, 8);
        let seq = next_seq[sender as usize];
        assert_eq!(wire.data, [sender, seq, sender, seq, sender, seq, sender, seq]);
        next_seq[sender as usize] += 1;
    }
    assert_eq!(next_seq, [20; 8]);
}

#[tokio::test]
async fn test_receive_decodes_into_input() {
    let h = open_harness();
    h.bus.push_frame(&WireFrame {
        can_id: 0x8000_0123,
        can_dlc: 3,
        data: [1, 2, 3, 0, 0, 0, 0, 0],
        ..Default::default()
    });

    let mut buf = [0u8; WIRE_FRAME_SIZE];
    h.driver.receive(&mut buf).await.unwrap();

    let frames = h.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, 0x123);
    assert!(frames[0].is_extended);
    assert!(!frames[0].is_rtr);
    assert_eq!(frames[0].payload(), &[1, 2, 3]);
    assert_eq!(h.driver.base().input(), frames[0]);
}

#[tokio::test]
async fn test_receive_error_frame() {
    let h = open_harness();
    h.bus.push_frame(&WireFrame {
        can_id: 0x2000_0040,
        can_dlc: 8,
        ..Default::default()
    });

    let mut buf = [0u8; WIRE_FRAME_SIZE];
    h.driver.receive(&mut buf).await.unwrap();

    let frames = h.frames();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is_error);
    assert_eq!(frames[0].id, 0x040);

    let state = h.driver.state();
    assert_eq!(state.internal_error, 0x40);
    assert_eq!(
        h.driver.translate_error(state.internal_error).as_deref(),
        Some("bus off")
    );
}

#[tokio::test]
async fn test_receive_read_error() {
    let h = open_harness();
    h.bus.push(Inbound::Error(libc::ENETDOWN));

    let mut buf = [0u8; WIRE_FRAME_SIZE];
    let result = h.driver.receive(&mut buf).await;

    assert!(matches!(result, Err(DriverError::Read(_))));
    assert_eq!(h.driver.state().error_code.value(), libc::ENETDOWN);
    assert!(h.frames().is_empty());
}

#[tokio::test]
async fn test_receive_incomplete_frame() {
    let h = open_harness();
    h.bus.push(Inbound::Bytes(vec![0u8; 8]));

    let mut buf = [0u8; WIRE_FRAME_SIZE];
    let result = h.driver.receive(&mut buf).await;

    assert!(matches!(result, Err(DriverError::Read(_))));
    assert_eq!(h.driver.state().error_code.value(), libc::EIO);
    assert!(h.frames().is_empty());
}

#[tokio::test]
async fn test_receive_when_closed() {
    let h = harness();
    let mut buf = [0u8; WIRE_FRAME_SIZE];
    assert!(matches!(
        h.driver.receive(&mut buf).await,
        Err(DriverError::NotOpen)
    ));
}

#[tokio::test]
async fn test_shutdown_aborts_pending_read() {
    let h = open_harness();

    let reader = {
        let driver = Arc::clone(&h.driver);
        tokio::spawn(async move {
            let mut buf = [0u8; WIRE_FRAME_SIZE];
            driver.receive(&mut buf).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.driver.shutdown();
    let result = reader.await.unwrap();

    assert!(matches!(result, Err(DriverError::Aborted)));
    let state = h.driver.state();
    assert_eq!(state.driver_state, DriverState::Closed);
    assert_eq!(state.error_code, ErrorCode::NONE);
    assert_eq!(h.bus.live_sockets(), 0);
    assert!(h.frames().is_empty());
}

#[test]
fn test_shutdown_when_closed() {
    let h = harness();
    h.driver.shutdown();

    assert_eq!(h.driver.state(), State::default());
    assert!(h.states().is_empty());
}

#[test]
fn test_shutdown_then_init() {
    let h = open_harness();
    h.driver.shutdown();
    assert_eq!(h.bus.live_sockets(), 0);

    h.driver.init("vcan0", 0).unwrap();
    assert!(h.driver.state().is_open());
    assert_eq!(h.bus.live_sockets(), 1);
}

#[test]
fn test_recover_reopens_socket() {
    let h = open_harness();
    h.clear_states();

    h.driver.recover().unwrap();

    assert_eq!(
        h.driver_states(),
        vec![DriverState::Closed, DriverState::Open]
    );
    assert_eq!(h.bus.steps().len(), 2 * ALL_STEPS.len());
    assert_eq!(h.bus.live_sockets(), 1);
    assert_eq!(h.driver.device(), "vcan0");
    assert_eq!(h.driver.state().error_code, ErrorCode::NONE);
}

#[test]
fn test_recover_clears_send_error() {
    let h = open_harness();
    h.bus.set_write_behavior(WriteBehavior::Fail(libc::ENOBUFS));
    assert!(h.driver.enqueue(&Frame::new(0x1, &[])).is_err());
    h.bus.set_write_behavior(WriteBehavior::Complete);

    h.driver.recover().unwrap();
    assert_eq!(h.driver.state().error_code, ErrorCode::NONE);
    h.driver.enqueue(&Frame::new(0x1, &[])).unwrap();
}

#[test]
fn test_recover_when_closed() {
    let h = harness();
    assert!(matches!(h.driver.recover(), Err(DriverError::NotOpen)));
    assert!(h.bus.steps().is_empty());
    assert!(h.states().is_empty());
}

#[test]
fn test_recover_waits_for_send() {
    let h = slow_send_harness();

    let sender = {
        let driver = Arc::clone(&h.driver);
        thread::spawn(move || driver.enqueue(&Frame::new(0x1, &[1])))
    };
    thread::sleep(Duration::from_millis(50));

    assert!(matches!(
        h.driver.recover(),
        Err(DriverError::LockTimeout(_))
    ));
    assert!(h.driver.state().is_open());
    assert_eq!(h.bus.steps().len(), ALL_STEPS.len());

    sender.join().unwrap().unwrap();
    h.driver.recover().unwrap();
    assert_eq!(h.bus.steps().len(), 2 * ALL_STEPS.len());
    assert_eq!(h.bus.live_sockets(), 1);
}

fn spawn_send(h: &Harness) -> thread::JoinHandle<Result<()>> {
    let driver = Arc::clone(&h.driver);
    thread::spawn(move || driver.enqueue(&Frame::new(0x1, &[1])))
}

#[test]
fn test_shutdown_during_failing_send() {
    let h = slow_send_harness();
    h.bus.set_write_behavior(WriteBehavior::Fail(libc::ENETDOWN));

    let sender = spawn_send(&h);
    thread::sleep(Duration::from_millis(50));
    h.driver.shutdown();

    assert!(matches!(sender.join().unwrap(), Err(DriverError::NotOpen)));
    let state = h.driver.state();
    assert_eq!(state.driver_state, DriverState::Closed);
    assert_eq!(state.error_code, ErrorCode::NONE);
    assert_eq!(h.bus.live_sockets(), 0);

    h.driver.init("vcan0", 0).unwrap();
    assert!(h.driver.state().is_open());
}

#[test]
fn test_shutdown_aborts_pending_send() {
    let h = slow_send_harness();

    let sender = spawn_send(&h);
    thread::sleep(Duration::from_millis(50));
    h.driver.shutdown();

    assert!(matches!(sender.join().unwrap(), Err(DriverError::NotOpen)));
    let state = h.driver.state();
    assert_eq!(state.driver_state, DriverState::Closed);
    assert_eq!(state.error_code, ErrorCode::NONE);
    assert!(h.bus.written_bytes().is_empty());
    assert_eq!(h.bus.live_sockets(), 0);
}

#[test]
fn test_failed_send_on_replaced_socket() {
    let h = slow_send_harness();
    h.bus.set_write_behavior(WriteBehavior::Fail(libc::ENETDOWN));

    let sender = spawn_send(&h);
    thread::sleep(Duration::from_millis(50));
    h.driver.shutdown();
    h.driver.init("vcan0", 0).unwrap();

    assert!(matches!(sender.join().unwrap(), Err(DriverError::NotOpen)));
    let state = h.driver.state();
    assert!(state.is_open());
    assert_eq!(state.error_code, ErrorCode::NONE);
    assert_eq!(h.bus.live_sockets(), 1);
}

#[test]
fn test_recover_failure_leaves_driver_closed() {
    let h = open_harness();
    h.bus.fail_at(SetupStep::Bind, libc::EADDRNOTAVAIL);

    let result = h.driver.recover();
    assert!(matches!(
        result,
        Err(DriverError::Setup {
            step: SetupStep::Bind,
            ..
        })
    ));

    let state = h.driver.state();
    assert_eq!(state.driver_state, DriverState::Closed);
    assert_eq!(state.error_code.value(), libc::EADDRNOTAVAIL);
    assert_eq!(h.bus.live_sockets(), 0);
    assert!(matches!(h.driver.recover(), Err(DriverError::NotOpen)));
}

#[test]
fn test_translate_error() {
    let h = harness();
    assert_eq!(
        h.driver.translate_error(0x41).as_deref(),
        Some("tx timeout, bus off")
    );

    let base = Arc::new(TransportBase::new(|_: &Frame| {}, |_: &State| {}));
    let driver = SocketCanDriver::new(MockBackend::new(), Arc::clone(&base))
        .with_translator(NoTranslation);
    assert_eq!(driver.translate_error(0x40), None);

    let driver = SocketCanDriver::new(MockBackend::new(), base)
        .with_translator(|code: u32| Some(format!("fault {code:#x}")));
    assert_eq!(driver.translate_error(0x40).as_deref(), Some("fault 0x40"));
}

#[test]
fn test_drop_releases_socket() {
    let h = open_harness();
    let bus = Arc::clone(&h.bus);
    drop(h);
    assert_eq!(bus.live_sockets(), 0);
}
