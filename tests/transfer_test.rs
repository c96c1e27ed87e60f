//! Integration tests for the transfer pair over real loopback TCP.
//!
//! Each test gets its own tempdir sandbox on both sides and a receiver
//! bound to an ephemeral port; sender-side tests run the real control loop
//! with millisecond intervals.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use xfer::datafile::{pad10, unit_raw_dir};
use xfer::{Receiver, ReceiverConfig, Record, Sender, SenderConfig};

const SERIAL: &str = "17";

fn record_line(serial: &str, index: u64, dep: u64) -> String {
    if index == dep {
        format!(
            r#"{{"serialNumber":"{serial}","index":{index},"recordType":"deployment","site":"dock A"}}"#
        )
    } else {
        format!(
            r#"{{"serialNumber":"{serial}","index":{index},"recordType":"spectrum","deploymentIndex":{dep},"depth":{index}.5}}"#
        )
    }
}

async fn start_receiver(data_root: &Path) -> (SocketAddr, JoinHandle<()>) {
    let config = ReceiverConfig {
        listen_addr: "127.0.0.1".into(),
        listen_port: 0,
        data_root: data_root.to_path_buf(),
        max_connections: 16,
        idle_timeout_secs: 1,
    };
    let receiver = Receiver::new(config).unwrap();
    let listener = receiver.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = receiver.serve(listener).await;
    });
    (addr, handle)
}

fn sender_config(root: &Path, addr: SocketAddr) -> SenderConfig {
    SenderConfig {
        remote_host: addr.ip().to_string(),
        remote_port: addr.port(),
        data_root: root.join("unit-data"),
        xfer_root: root.join("unit-xfer"),
        serial_number: Some(SERIAL.into()),
        serial_file: None,
        batch_size: 20,
        poll_interval_ms: 10,
        pacing_secs: 0,
        reply_timeout_ms: 500,
    }
}

fn seed_unit_file(config: &SenderConfig, start: u64, lines: &[String]) -> PathBuf {
    let dir = unit_raw_dir(&config.data_root, SERIAL);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("new{}", pad10(start)));
    let mut body = String::new();
    for l in lines {
        body.push_str(l);
        body.push('\n');
    }
    fs::write(&path, body).unwrap();
    path
}

fn enable_transfer(config: &SenderConfig) {
    fs::create_dir_all(&config.xfer_root).unwrap();
    fs::write(config.xfer_root.join("ON"), "xfer control file\n").unwrap();
}

fn disable_transfer(config: &SenderConfig) {
    fs::rename(config.xfer_root.join("ON"), config.xfer_root.join("OFF")).unwrap();
}

fn dest_file(data_root: &Path, dep: u64) -> PathBuf {
    unit_raw_dir(data_root, SERIAL).join(format!("new{}", pad10(dep)))
}

fn stored_indices(path: &Path) -> Vec<u64> {
    match fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(|l| Record::parse(l).unwrap().index)
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Hand-rolled client: one batch, one connection, returns the raw reply.
async fn send_raw(addr: SocketAddr, payload: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    reply
}

fn batch_payload(first: u64, last: u64, lines: &[String]) -> String {
    let mut payload = format!("{first} {last} {}\n", lines.len());
    for l in lines {
        payload.push_str(l);
        payload.push('\n');
    }
    payload
}

// =============================================================================
// Full sender loop against a live receiver
// =============================================================================

#[tokio::test]
async fn test_end_to_end_delivery() {
    let unit = TempDir::new().unwrap();
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    let config = sender_config(unit.path(), addr);
    let mut lines = vec![record_line(SERIAL, 1, 1)];
    lines.extend((2..=10).map(|i| record_line(SERIAL, i, 1)));
    seed_unit_file(&config, 1, &lines);
    enable_transfer(&config);

    let mut sender = Sender::new(config.clone(), SERIAL.into()).unwrap();
    let sender_task = tokio::spawn(async move {
        let _ = sender.run().await;
    });

    let dest = dest_file(central.path(), 1);
    wait_until("all records delivered", || stored_indices(&dest).len() == 10).await;
    assert_eq!(stored_indices(&dest), (1..=10).collect::<Vec<u64>>());

    // both cursors converge on last+1
    let receiver_cursor = central.path().join(format!("sn{SERIAL}")).join("xfer.nextRecord");
    wait_until("sender cursor persisted", || {
        fs::read_to_string(config.xfer_root.join("nextRecord"))
            .map(|s| s.trim() == "11")
            .unwrap_or(false)
    })
    .await;
    assert_eq!(fs::read_to_string(receiver_cursor).unwrap().trim(), "11");

    sender_task.abort();
    receiver.abort();
}

#[tokio::test]
async fn test_tailing_picks_up_growth() {
    let unit = TempDir::new().unwrap();
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    let config = sender_config(unit.path(), addr);
    let mut lines = vec![record_line(SERIAL, 1, 1)];
    lines.extend((2..=5).map(|i| record_line(SERIAL, i, 1)));
    let source = seed_unit_file(&config, 1, &lines);
    enable_transfer(&config);

    let mut sender = Sender::new(config.clone(), SERIAL.into()).unwrap();
    let sender_task = tokio::spawn(async move {
        let _ = sender.run().await;
    });

    let dest = dest_file(central.path(), 1);
    wait_until("first wave delivered", || stored_indices(&dest).len() == 5).await;

    // the collector appends while transfer is running
    let mut appended = String::new();
    for i in 6..=9 {
        appended.push_str(&record_line(SERIAL, i, 1));
        appended.push('\n');
    }
    let mut body = fs::read_to_string(&source).unwrap();
    body.push_str(&appended);
    fs::write(&source, body).unwrap();

    wait_until("second wave delivered", || stored_indices(&dest).len() == 9).await;
    assert_eq!(stored_indices(&dest), (1..=9).collect::<Vec<u64>>());

    sender_task.abort();
    receiver.abort();
}

#[tokio::test]
async fn test_control_flag_gates_sender() {
    let unit = TempDir::new().unwrap();
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    let config = sender_config(unit.path(), addr);
    let lines = vec![record_line(SERIAL, 1, 1), record_line(SERIAL, 2, 1)];
    let source = seed_unit_file(&config, 1, &lines);

    let mut sender = Sender::new(config.clone(), SERIAL.into()).unwrap();
    let sender_task = tokio::spawn(async move {
        let _ = sender.run().await;
    });

    // disabled: nothing may arrive
    tokio::time::sleep(Duration::from_millis(200)).await;
    let dest = dest_file(central.path(), 1);
    assert!(stored_indices(&dest).is_empty());

    // enable: delivery starts within the polling latency, and the sender
    // mirrors the request into its ack pair
    enable_transfer(&config);
    wait_until("records delivered after enable", || {
        stored_indices(&dest).len() == 2
    })
    .await;
    wait_until("ack sentinel flipped on", || {
        config.xfer_root.join("on").is_file()
    })
    .await;

    // disable: new data stays put
    disable_transfer(&config);
    wait_until("ack sentinel flipped off", || {
        config.xfer_root.join("off").is_file()
    })
    .await;
    let mut body = fs::read_to_string(&source).unwrap();
    body.push_str(&record_line(SERIAL, 3, 1));
    body.push('\n');
    fs::write(&source, body).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stored_indices(&dest).len(), 2);

    sender_task.abort();
    receiver.abort();
}

#[tokio::test]
async fn test_sender_crosses_deployment_boundary() {
    let unit = TempDir::new().unwrap();
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    let config = sender_config(unit.path(), addr);
    let first = vec![
        record_line(SERIAL, 1, 1),
        record_line(SERIAL, 2, 1),
        record_line(SERIAL, 3, 1),
    ];
    let second = vec![record_line(SERIAL, 4, 4), record_line(SERIAL, 5, 4)];
    seed_unit_file(&config, 1, &first);
    seed_unit_file(&config, 4, &second);
    enable_transfer(&config);

    let mut sender = Sender::new(config.clone(), SERIAL.into()).unwrap();
    let sender_task = tokio::spawn(async move {
        let _ = sender.run().await;
    });

    let dest_a = dest_file(central.path(), 1);
    let dest_b = dest_file(central.path(), 4);
    wait_until("both deployments delivered", || {
        stored_indices(&dest_a).len() == 3 && stored_indices(&dest_b).len() == 2
    })
    .await;
    assert_eq!(stored_indices(&dest_a), vec![1, 2, 3]);
    assert_eq!(stored_indices(&dest_b), vec![4, 5]);

    sender_task.abort();
    receiver.abort();
}

// =============================================================================
// Wire-level receiver behavior
// =============================================================================

#[tokio::test]
async fn test_idempotent_resend_is_acked_and_unchanged() {
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    let lines = vec![
        record_line(SERIAL, 1, 1),
        record_line(SERIAL, 2, 1),
        record_line(SERIAL, 3, 1),
    ];
    let payload = batch_payload(1, 3, &lines);

    assert_eq!(send_raw(addr, &payload).await, "ACK\n");
    let dest = dest_file(central.path(), 1);
    let before = fs::read_to_string(&dest).unwrap();
    let cursor = central.path().join(format!("sn{SERIAL}")).join("xfer.nextRecord");
    assert_eq!(fs::read_to_string(&cursor).unwrap().trim(), "4");

    // full resend: success, no storage change, no cursor change
    assert_eq!(send_raw(addr, &payload).await, "ACK\n");
    assert_eq!(fs::read_to_string(&dest).unwrap(), before);
    assert_eq!(fs::read_to_string(&cursor).unwrap().trim(), "4");

    receiver.abort();
}

#[tokio::test]
async fn test_crash_replay_converges_without_duplicates() {
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    let first = vec![
        record_line(SERIAL, 1, 1),
        record_line(SERIAL, 2, 1),
        record_line(SERIAL, 3, 1),
    ];
    assert_eq!(send_raw(addr, &batch_payload(1, 3, &first)).await, "ACK\n");

    // the sender crashed before persisting its cursor: the same batch is
    // replayed, then transfer continues
    assert_eq!(send_raw(addr, &batch_payload(1, 3, &first)).await, "ACK\n");
    let second = vec![
        record_line(SERIAL, 4, 1),
        record_line(SERIAL, 5, 1),
        record_line(SERIAL, 6, 1),
    ];
    assert_eq!(send_raw(addr, &batch_payload(4, 6, &second)).await, "ACK\n");

    let dest = dest_file(central.path(), 1);
    assert_eq!(stored_indices(&dest), (1..=6).collect::<Vec<u64>>());

    receiver.abort();
}

#[tokio::test]
async fn test_header_rejection() {
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    assert_eq!(send_raw(addr, "5 4 1\n").await, "NACK\n");

    receiver.abort();
}

#[tokio::test]
async fn test_count_bound_rejection() {
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    assert_eq!(send_raw(addr, "1 150 150\n").await, "NACK\n");

    receiver.abort();
}

#[tokio::test]
async fn test_mixed_unit_batch_is_rejected_whole() {
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    let lines = vec![record_line(SERIAL, 1, 1), record_line("99", 2, 1)];
    assert_eq!(send_raw(addr, &batch_payload(1, 2, &lines)).await, "NACK\n");

    // the valid first record must not have been persisted
    assert!(!unit_raw_dir(central.path(), SERIAL).exists());
    assert!(!unit_raw_dir(central.path(), "99").exists());

    receiver.abort();
}

#[tokio::test]
async fn test_stalled_peer_is_nacked_after_idle_timeout() {
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    // valid header, then silence: the receiver gives up on its own
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"1 2 2\n").await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "NACK\n");

    receiver.abort();
}

#[tokio::test]
async fn test_oversized_line_is_rejected() {
    let central = TempDir::new().unwrap();
    let (addr, receiver) = start_receiver(central.path()).await;

    let mut payload = String::from("1 1 1\n");
    payload.push_str(&"x".repeat(40000));
    payload.push('\n');
    assert_eq!(send_raw(addr, &payload).await, "NACK\n");

    receiver.abort();
}
