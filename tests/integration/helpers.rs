//! Shared fixtures for integration tests.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

use cascade::ports;

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

pub fn free_port() -> u16 {
    ports::find_free_port().expect("OS should hand out a free port")
}

/// Spawn a tiny HTTP endpoint that answers 200 to every request, after
/// first failing `fail_first` requests with 503. Returns the URL.
///
/// The accept loop runs until the test process exits.
pub fn spawn_health_endpoint(fail_first: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind health endpoint");
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let mut served = 0usize;
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let response = if served < fail_first {
                "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n"
            } else {
                "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"
            };
            served += 1;
            let _ = stream.write_all(response.as_bytes());
        }
    });

    format!("http://127.0.0.1:{port}/health")
}
