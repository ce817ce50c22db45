//! S1 (§8): a leaf connects to a single supplier, requests its one
//! flow, and receives chunks end to end over real loopback sockets.

use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use meshcast::kernel::Kernel;
use meshcast::registry::ChunkSink;
use meshcast::NodeConfig;

fn write_mjpeg_fixture(path: &std::path::Path) {
    let mut f = File::create(path).unwrap();
    f.write_all(b"00005frame").unwrap();
}

fn config(control: &str, flow: &str) -> NodeConfig {
    NodeConfig::from_str(&format!(
        "controlAddr: {}\nflowAddr: {}\nqueueSize: 16\ndoctorPeriodSecs: 1\n",
        control, flow
    ))
    .unwrap()
}

#[derive(Default)]
struct Recorder {
    chunks: Mutex<Vec<Vec<u8>>>,
    condvar: Condvar,
}

impl ChunkSink for Recorder {
    fn accept(&self, _frame_number: u64, bytes: &[u8]) {
        let mut chunks = self.chunks.lock().unwrap();
        chunks.push(bytes.to_vec());
        self.condvar.notify_all();
    }
}

impl Recorder {
    fn wait_for_at_least(&self, n: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let mut chunks = self.chunks.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while chunks.len() < n {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, result) = self.condvar.wait_timeout(chunks, remaining).unwrap();
            chunks = guard;
            if result.timed_out() {
                break;
            }
        }
        chunks.clone()
    }
}

#[test]
fn leaf_receives_chunks_from_single_supplier() {
    let supplier = Kernel::bind(&config("127.0.0.1:0", "127.0.0.1:0")).unwrap();
    let supplier_control: SocketAddr = {
        supplier.start().unwrap()
    };

    let leaf = Kernel::bind(&config("127.0.0.1:0", "127.0.0.1:0")).unwrap();
    leaf.start().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("clip.Mjpeg");
    write_mjpeg_fixture(&source_path);

    let key = supplier.yield_flow(source_path.to_str().unwrap()).unwrap();

    leaf.connect(supplier_control).unwrap();
    // Give the handshake + welcome exchange a moment to settle.
    std::thread::sleep(Duration::from_millis(200));

    let recorder = Arc::new(Recorder::default());
    let sink: Box<dyn ChunkSink> = Box::new(recorder.clone());
    let player_id = leaf.new_player(&key.flow_id, sink);
    assert!(player_id.is_some(), "leaf should resolve the announced flow");

    let chunks = recorder.wait_for_at_least(2, Duration::from_secs(5));
    assert!(chunks.len() >= 2, "expected at least two delivered chunks, got {}", chunks.len());
    assert_eq!(chunks[0], b"frame");

    supplier.stop();
    leaf.stop();
}
