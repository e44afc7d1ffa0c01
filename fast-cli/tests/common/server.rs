// See mod.rs for why this is needed.
#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// A managed demo server instance.
///
/// Spawns `fast serve` on an ephemeral port. The server process is killed
/// when this struct is dropped.
pub struct TestServer {
    process: Child,
    pub port: u16,
    pub addr: String,
}

impl TestServer {
    /// Start a demo server on an ephemeral port.
    ///
    /// Panics if the server fails to start or the port is not ready
    /// within 10s.
    pub fn start() -> Self {
        let port = find_free_port();
        let addr = format!("127.0.0.1:{port}");

        let process = Command::new(super::fast_bin())
            .args(["serve", "-a", &addr])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to start demo server");

        wait_for_port(port, Duration::from_secs(10));

        TestServer {
            process,
            port,
            addr,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

/// Bind to port 0 to get an ephemeral port from the OS.
fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind ephemeral port");
    listener.local_addr().unwrap().port()
}

/// Wait for a TCP port to accept connections, or panic after timeout.
fn wait_for_port(port: u16, timeout: Duration) {
    let start = Instant::now();
    loop {
        if TcpStream::connect_timeout(
            &format!("127.0.0.1:{port}").parse().unwrap(),
            Duration::from_millis(100),
        )
        .is_ok()
        {
            return;
        }
        if start.elapsed() > timeout {
            panic!("Timed out waiting for demo server on port {port}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
