//! Runs against a real virtual CAN interface:
//!
//! ```text
//! sudo modprobe vcan
//! sudo ip link add dev vcan0 type vcan
//! sudo ip link set up vcan0
//! cargo test --test vcan -- --ignored
//! ```
#![cfg(target_os = "linux")]

use socketcan_driver::{spawn_receiver, Frame, RawCanBackend, SocketCanDriver, State, TransportBase};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn driver(tx: mpsc::UnboundedSender<Frame>) -> Arc<SocketCanDriver<RawCanBackend>> {
    let base = Arc::new(TransportBase::new(
        move |frame: &Frame| {
            let _ = tx.send(*frame);
        },
        |_: &State| {},
    ));
    Arc::new(SocketCanDriver::new(RawCanBackend, base))
}

#[tokio::test]
#[ignore = "needs vcan0"]
async fn test_vcan_loopback() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = driver(tx);
    let (unused_tx, _) = mpsc::unbounded_channel();
    let sender = driver(unused_tx);

    listener.init("vcan0", 0).unwrap();
    sender.init("vcan0", 0).unwrap();
    let receiver = spawn_receiver(Arc::clone(&listener));

    sender.enqueue(&Frame::new(0x123, &[0xAA, 0xBB])).unwrap();
    sender.enqueue(&Frame::extended(0x123, &[1, 2, 3])).unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, 0x123);
    assert!(!first.is_extended);
    assert_eq!(first.payload(), &[0xAA, 0xBB]);

    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second.is_extended);
    assert_eq!(second.payload(), &[1, 2, 3]);

    listener.recover().unwrap();
    receiver.await.unwrap().unwrap();
    assert!(listener.state().is_open());

    listener.shutdown();
    sender.shutdown();
}

#[tokio::test]
#[ignore = "needs a CAN capable host"]
async fn test_unknown_interface() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let driver = driver(tx);
    assert!(driver.init("nosuchcan0", 0).is_err());
    assert!(!driver.state().is_open());
}
