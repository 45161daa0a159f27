// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Loopback status listener. A child installer run (or the companion GUI)
//! connects to `127.0.0.1:19847` and writes newline-delimited JSON messages;
//! each is forwarded into this session's progress model. Binding is
//! loopback-only and unauthenticated; the interface is the boundary.

use std::{
    io::{BufRead, BufReader},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use serde::Deserialize;

use crate::{progress::ProgressTracker, session::CancelToken};

/// Well-known loopback port for status reporting.
pub const STATUS_PORT: u16 = 19847;

/// Synthetic progress item the child run's messages land under.
const CHILD_RUN_ITEM: &str = "ManagedInstaller";

#[derive(Debug, Deserialize)]
struct StatusMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    percent: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// Receives decoded status messages.
pub trait StatusSink: Send + Sync {
    /// Headline status text.
    fn status_message(&self, text: &str);
    /// Secondary detail text.
    fn detail_message(&self, text: &str);
    /// Progress percentage, 0–100; negative means indeterminate.
    fn percent_progress(&self, percent: f64);
    /// A log line to surface verbatim.
    fn display_log(&self, text: &str);
    /// An error reported by the child.
    fn error(&self, text: &str);
    /// The sender is done; the run should wind down.
    fn quit(&self);
}

/// Routes child-run messages into the progress tracker and cancel token.
pub struct TrackerSink {
    tracker: Arc<ProgressTracker>,
    cancel: CancelToken,
}

impl TrackerSink {
    /// A sink that mirrors messages under a synthetic tracker item.
    pub fn new(tracker: Arc<ProgressTracker>, cancel: CancelToken) -> Self {
        tracker.register(CHILD_RUN_ITEM, "Managed install session");
        Self { tracker, cancel }
    }
}

impl StatusSink for TrackerSink {
    fn status_message(&self, text: &str) {
        self.tracker.knowledge(CHILD_RUN_ITEM, text);
    }

    fn detail_message(&self, text: &str) {
        tracing::info!("{text}");
    }

    fn percent_progress(&self, percent: f64) {
        let clamped = percent.clamp(0.0, 100.0) as u64;
        self.tracker
            .download_progress(CHILD_RUN_ITEM, clamped, Some(100));
    }

    fn display_log(&self, text: &str) {
        tracing::info!("{text}");
    }

    fn error(&self, text: &str) {
        self.tracker.fail(CHILD_RUN_ITEM, text);
    }

    fn quit(&self) {
        self.cancel.cancel();
    }
}

/// The loopback listener; accepts until stopped or dropped.
pub struct StatusServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl StatusServer {
    /// Binds `127.0.0.1:port` and starts accepting. Pass port 0 to pick an
    /// ephemeral port (tests).
    pub fn start(port: u16, sink: Arc<dyn StatusSink>) -> crate::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let shutdown_ = shutdown.clone();
        let accept_thread = std::thread::spawn(move || {
            while !shutdown_.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        tracing::debug!("status client connected from {peer}");
                        let sink = sink.clone();
                        std::thread::spawn(move || handle_client(stream, sink));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        tracing::warn!("status listener accept failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    /// The bound address, useful when started on an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting and joins the listener thread.
    pub fn stop(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn handle_client(stream: TcpStream, sink: Arc<dyn StatusSink>) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            // abrupt disconnects are normal; the child just exited
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: StatusMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("dropping malformed status line: {e}");
                continue;
            }
        };
        dispatch_message(&message, sink.as_ref());
        if message.kind == "quit" {
            break;
        }
    }
}

fn dispatch_message(message: &StatusMessage, sink: &dyn StatusSink) {
    if let Some(error) = message.error.as_deref().filter(|e| !e.is_empty()) {
        sink.error(error);
    }
    let data = message.data.as_deref().unwrap_or_default();
    match message.kind.as_str() {
        "statusMessage" => sink.status_message(data),
        "detailMessage" => sink.detail_message(data),
        "percentProgress" => sink.percent_progress(message.percent.unwrap_or(-1.0)),
        "displayLog" => sink.display_log(data),
        "quit" => sink.quit(),
        other => tracing::debug!("ignoring unknown status message type `{other}`"),
    }
}
