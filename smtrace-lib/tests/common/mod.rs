#![allow(dead_code)]

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use smtrace::config::MailConfig;
use smtrace::report::{MailMessage, Mailer, MailerFactory};

pub fn fixture_path(name: &str) -> PathBuf {
    let mut path =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    path.push("tests/fixtures");
    path.push(name);
    path
}

/// Bytes of a hex fixture, one chunk per line.
pub fn hex_fixture(name: &str) -> Vec<Vec<u8>> {
    std::fs::read_to_string(fixture_path(name))
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| hex::decode(l.trim()).unwrap())
        .collect()
}

/// A serial port stand-in: yields its chunks in order, then times out like an idle
/// line would.
pub struct FakePort {
    chunks: Vec<Vec<u8>>,
}

impl FakePort {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        FakePort { chunks }
    }
}

impl Read for FakePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.chunks.is_empty() {
            thread::sleep(Duration::from_millis(5));
            return Err(io::ErrorKind::TimedOut.into());
        }
        let chunk = &mut self.chunks[0];
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.chunks.remove(0);
        }
        Ok(n)
    }
}

/// Records every message instead of sending it.
#[derive(Default)]
pub struct Outbox {
    pub sent: Mutex<Vec<MailMessage>>,
}

impl Outbox {
    pub fn messages(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn factory(outbox: &Arc<Outbox>) -> MailerFactory {
        let outbox = outbox.clone();
        Arc::new(move |_: &MailConfig| outbox.clone() as Arc<dyn Mailer>)
    }
}

impl Mailer for Outbox {
    fn send(&self, message: &MailMessage) -> smtrace::Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while !cond() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
    true
}
