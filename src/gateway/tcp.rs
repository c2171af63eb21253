//! Loopback TCP gateway
//!
//! Each connection is a session: a reader loop dispatching the script's
//! requests, and a writer task serializing everything sent back. Once the
//! script calls `register`, the session's outbound link is wrapped as the
//! bridge's consumer; calls through it wait for the script's ack.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use super::protocol::{Call, Inbound, Outbound, PeerEvent};
use super::{Gateway, GatewayBinding};
use crate::bridge::registry::OwnerId;
use crate::bridge::Bridge;
use crate::consumer::Consumer;
use crate::midi::RawEvent;

/// Serves the bridge to scripts over loopback TCP
pub struct TcpGateway {
    bridge: Arc<Bridge>,
    call_timeout: Duration,
}

impl TcpGateway {
    pub fn new(bridge: Arc<Bridge>, call_timeout: Duration) -> Self {
        Self {
            bridge,
            call_timeout,
        }
    }
}

#[async_trait]
impl Gateway for TcpGateway {
    async fn bind(&self, port: u16) -> anyhow::Result<Box<dyn GatewayBinding>> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to bind 127.0.0.1:{}", port))?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            self.bridge.clone(),
            self.call_timeout,
            shutdown_rx,
        ));

        Ok(Box::new(TcpBinding {
            port,
            shutdown_tx,
            task,
        }))
    }
}

struct TcpBinding {
    port: u16,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[async_trait]
impl GatewayBinding for TcpBinding {
    fn port(&self) -> u16 {
        self.port
    }

    async fn shutdown(self: Box<Self>) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Gateway accept loop ended abnormally: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    bridge: Arc<Bridge>,
    call_timeout: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "Script connected");
                    let bridge = bridge.clone();
                    sessions.spawn(async move {
                        if let Err(e) = run_session(stream, peer, bridge, call_timeout).await {
                            warn!(%peer, "Session ended with error: {:#}", e);
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    sessions.shutdown().await;
    debug!("Accept loop stopped");
}

/// Outbound side of a session, shared by the consumer and listener callbacks
struct PeerLink {
    out_tx: mpsc::UnboundedSender<Outbound>,
    pending: DashMap<u64, oneshot::Sender<Result<(), String>>>,
    next_seq: AtomicU64,
    call_timeout: Duration,
}

impl PeerLink {
    fn new(out_tx: mpsc::UnboundedSender<Outbound>, call_timeout: Duration) -> Self {
        Self {
            out_tx,
            pending: DashMap::new(),
            next_seq: AtomicU64::new(1),
            call_timeout,
        }
    }

    fn send(&self, message: Outbound) -> bool {
        self.out_tx.send(message).is_ok()
    }

    /// Send without waiting for an ack
    fn notify(&self, event: PeerEvent) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.send(Outbound::Call { seq, event })
    }

    /// Send and wait for the script to ack
    async fn call(&self, event: PeerEvent) -> anyhow::Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.insert(seq, ack_tx);

        if !self.send(Outbound::Call { seq, event }) {
            self.pending.remove(&seq);
            anyhow::bail!("script disconnected");
        }

        match tokio::time::timeout(self.call_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(error))) => anyhow::bail!("script raised: {}", error),
            Ok(Err(_)) => anyhow::bail!("script disconnected"),
            Err(_) => {
                self.pending.remove(&seq);
                anyhow::bail!("no ack within {:?}", self.call_timeout)
            }
        }
    }

    fn complete(&self, seq: u64, error: Option<String>) {
        match self.pending.remove(&seq) {
            Some((_, ack_tx)) => {
                let _ = ack_tx.send(error.map_or(Ok(()), Err));
            }
            None => trace!(seq, "Ack for a call nobody waits on"),
        }
    }

    /// Fail every outstanding call
    fn close(&self) {
        self.pending.clear();
    }
}

/// The script as a consumer, reached through its session
struct RemoteConsumer {
    link: Arc<PeerLink>,
}

#[async_trait]
impl Consumer for RemoteConsumer {
    async fn on_script_start(&self) -> anyhow::Result<()> {
        self.link.call(PeerEvent::OnScriptStart).await
    }

    async fn on_script_stop(&self) -> anyhow::Result<()> {
        self.link.call(PeerEvent::OnScriptStop).await
    }

    async fn on_project_load(&self) -> anyhow::Result<()> {
        self.link.call(PeerEvent::OnProjectLoad).await
    }

    async fn host_callback(&self, midi: Vec<RawEvent>) -> anyhow::Result<()> {
        self.link.call(PeerEvent::HostCallback { midi }).await
    }
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    bridge: Arc<Bridge>,
    call_timeout: Duration,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(write_half, out_rx));

    let link = Arc::new(PeerLink::new(out_tx, call_timeout));
    let owner = bridge.new_owner();
    let registered: Arc<Mutex<Option<Arc<dyn Consumer>>>> = Arc::new(Mutex::new(None));

    let mut lines = BufReader::new(read_half).lines();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(anyhow::Error::new(e).context("reading from script")),
        };
        if line.trim().is_empty() {
            continue;
        }

        match Inbound::parse(&line) {
            Ok(Inbound::Ack { seq, error }) => link.complete(seq, error),
            Ok(Inbound::Request { id, call }) => {
                trace!(id, method = call.method(), "Request");
                if call.needs_task() {
                    let bridge = bridge.clone();
                    let link = link.clone();
                    let registered = registered.clone();
                    tokio::spawn(async move {
                        let response = respond(&bridge, &link, owner, &registered, id, call).await;
                        link.send(response);
                    });
                } else {
                    let response = respond(&bridge, &link, owner, &registered, id, call).await;
                    link.send(response);
                }
            }
            Err(e) => {
                debug!(%peer, "Bad line from script: {}", e);
                link.send(Outbound::error(e.id, e.message));
            }
        }
    };

    info!(%peer, "Script disconnected");
    link.close();
    let dropped = bridge.drop_listeners(owner);
    if dropped > 0 {
        debug!(%peer, dropped, "Removed the session's listeners");
    }
    let ours = registered.lock().take();
    if let Some(consumer) = ours {
        bridge.detach_consumer(&consumer);
    }
    writer.abort();
    result
}

async fn respond(
    bridge: &Bridge,
    link: &Arc<PeerLink>,
    owner: OwnerId,
    registered: &Mutex<Option<Arc<dyn Consumer>>>,
    id: u64,
    call: Call,
) -> Outbound {
    let method = call.method();
    match dispatch(bridge, link, owner, registered, call).await {
        Ok(result) => Outbound::result(id, result),
        Err(e) => {
            debug!(id, method, "Request failed: {:#}", e);
            Outbound::error(Some(id), format!("{:#}", e))
        }
    }
}

async fn dispatch(
    bridge: &Bridge,
    link: &Arc<PeerLink>,
    owner: OwnerId,
    registered: &Mutex<Option<Arc<dyn Consumer>>>,
    call: Call,
) -> anyhow::Result<Value> {
    let result = match call {
        Call::Register => {
            let consumer: Arc<dyn Consumer> = Arc::new(RemoteConsumer { link: link.clone() });
            *registered.lock() = Some(consumer.clone());
            bridge.register_consumer(consumer).await;
            Value::Null
        }
        Call::AddListener {
            target,
            property,
            listener,
        } => {
            let link = link.clone();
            bridge.add_listener(
                owner,
                target,
                &property,
                listener,
                Arc::new(move || {
                    if !link.notify(PeerEvent::Listener { listener }) {
                        anyhow::bail!("script disconnected");
                    }
                    Ok(())
                }),
            )?;
            Value::Null
        }
        Call::RemoveListener {
            target,
            property,
            listener,
        } => json!(bridge.remove_listener(target, &property, listener)),
        Call::GetTrackBank => serde_json::to_value(bridge.track_bank())?,
        Call::GetDeviceBank { track } => serde_json::to_value(bridge.device_bank(track)?)?,
        Call::GetParameterBank { device } => {
            serde_json::to_value(bridge.parameter_bank(device)?)?
        }
        Call::GetParameterRange { parameter } => {
            serde_json::to_value(bridge.parameter_range(parameter).await?)?
        }
        Call::GetValue { target, property } => bridge.get_value(target, &property)?,
        Call::GetRaw { target, property } => json!(bridge.get_raw(target, &property)?),
        Call::SetValue {
            target,
            property,
            value,
        } => {
            bridge.set_value(target, &property, value)?;
            Value::Null
        }
        Call::Invoke { target, action } => {
            bridge.invoke(target, &action)?;
            Value::Null
        }
        Call::GetTransport => serde_json::to_value(bridge.transport_info())?,
        Call::Log { message } => {
            bridge.log(&message);
            Value::Null
        }
        Call::Notify { message } => {
            bridge.notify(&message);
            Value::Null
        }
    };
    Ok(result)
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
) -> anyhow::Result<()> {
    while let Some(message) = out_rx.recv().await {
        let line = message.to_line().context("encoding message")?;
        writer
            .write_all(line.as_bytes())
            .await
            .context("writing to script")?;
    }
    Ok(())
}
