//! Shared helpers for integration tests.
//!
//! `MockPeer` plays the runtime instance side of the protocol over real
//! SOCK_SEQPACKET sockets: it binds `<root>/<instance>/telemetry`, reads the
//! Register message, connects back to the announced callback path and
//! answers requests according to its `Behavior`.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dpx_protocol::{Action, ControlMessage};
use dpxd::retry::RetryPolicy;
use dpxd::session::SessionConfig;
use tokio::task::{JoinHandle, JoinSet};
use tokio_seqpacket::{UnixSeqpacket, UnixSeqpacketListener};
use tokio_util::sync::CancellationToken;

/// How the mock answers snapshot requests.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Reply with this payload to every request
    Respond(Vec<u8>),
    /// Close the duplex channel instead of replying
    CloseOnRequest,
}

/// A runtime instance stand-in.
pub struct MockPeer {
    pub dir: PathBuf,
    pub advertiser: PathBuf,
    received: Arc<Mutex<Vec<ControlMessage>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MockPeer {
    /// Binds `<root>/<instance>/telemetry` and starts serving.
    pub fn start(root: &Path, instance: &str, behavior: Behavior) -> Self {
        let dir = root.join(instance);
        std::fs::create_dir_all(&dir).unwrap();
        let advertiser = dir.join("telemetry");
        let _ = std::fs::remove_file(&advertiser);
        let mut listener = UnixSeqpacketListener::bind(&advertiser).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let task = {
            let received = received.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut clients = JoinSet::new();
                loop {
                    let control = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok(conn) => conn,
                            Err(_) => break,
                        },
                    };
                    clients.spawn(serve_client(
                        control,
                        behavior.clone(),
                        received.clone(),
                        cancel.clone(),
                    ));
                }
                while clients.join_next().await.is_some() {}
            })
        };

        Self {
            dir,
            advertiser,
            received,
            cancel,
            task,
        }
    }

    /// Starts a peer answering with one port that has the given stats.
    pub fn cooperative(root: &Path, instance: &str, stats: &[(&str, f64)]) -> Self {
        Self::start(root, instance, Behavior::Respond(snapshot_json(instance, stats)))
    }

    /// Callback path the agent is expected to bind for this peer.
    pub fn callback(&self) -> PathBuf {
        self.dir.join(".client")
    }

    /// Every message received so far, in order.
    pub fn messages(&self) -> Vec<ControlMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, action: Action) -> usize {
        self.messages().iter().filter(|m| m.action == action).count()
    }

    /// Stops serving, closes every connection and removes the advertiser.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
        let _ = std::fs::remove_file(&self.advertiser);
    }
}

async fn serve_client(
    control: UnixSeqpacket,
    behavior: Behavior,
    received: Arc<Mutex<Vec<ControlMessage>>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];

    let n = match control.recv(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };
    let Ok(register) = serde_json::from_slice::<ControlMessage>(&buf[..n]) else {
        return;
    };
    received.lock().unwrap().push(register.clone());
    let Some(data) = register.data else {
        return;
    };

    let Ok(duplex) = UnixSeqpacket::connect(&data.client_path).await else {
        return;
    };

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            result = duplex.recv(&mut buf) => match result {
                Ok(n) if n > 0 => n,
                _ => return,
            },
        };
        let Ok(message) = serde_json::from_slice::<ControlMessage>(&buf[..n]) else {
            continue;
        };
        received.lock().unwrap().push(message.clone());

        match message.action {
            Action::Get => match &behavior {
                Behavior::Respond(payload) => {
                    if duplex.send(payload).await.is_err() {
                        return;
                    }
                }
                Behavior::CloseOnRequest => return,
            },
            Action::Unregister => return,
            Action::Register => {}
        }
    }
}

/// Builds a snapshot response for one port.
pub fn snapshot_json(instance: &str, stats: &[(&str, f64)]) -> Vec<u8> {
    let stats: Vec<serde_json::Value> = stats
        .iter()
        .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
        .collect();
    serde_json::json!({
        "data": [{
            "podName": instance,
            "pci_address": "0000:00:1f.0",
            "namespace": "default",
            "stats": stats,
        }]
    })
    .to_string()
    .into_bytes()
}

/// Session settings that keep tests fast.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        peer_timeout: Duration::from_secs(1),
        max_message_size: dpx_protocol::DEFAULT_MAX_MESSAGE_SIZE,
        bind_retry: RetryPolicy::bounded(Duration::from_millis(10), 3),
    }
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
