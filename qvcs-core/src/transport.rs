//! Client side of a connection: request/response correlation and heartbeat
//!
//! A [`RequestBroker`] hands out transaction and request ids and parks each
//! caller on a oneshot channel until the reader task sees the response with
//! the matching id. Closing the broker completes every parked caller with
//! [`QvcsError::ConnectionClosed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{QvcsError, Result};
use crate::notification::ServerNotification;
use crate::protocol::{read_envelope, write_envelope, Envelope, Request, RequestId, Response, TransactionId};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout_multiple: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: DEFAULT_HEARTBEAT_INTERVAL, timeout_multiple: DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLE }
    }
}

impl HeartbeatConfig {
    pub fn new(interval: Duration, timeout_multiple: u32) -> Self {
        Self { interval, timeout_multiple: timeout_multiple.max(1) }
    }

    /// Silence longer than this means the peer is gone.
    pub fn timeout(&self) -> Duration {
        self.interval * self.timeout_multiple
    }
}

/// Time of the last inbound frame on a connection
#[derive(Debug)]
pub struct ActivityMonitor {
    last_inbound: Mutex<Instant>,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self { last_inbound: Mutex::new(Instant::now()) }
    }
}

impl ActivityMonitor {
    pub fn touch(&self) {
        *self.last_inbound.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_inbound.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }
}

/// Periodically queue a heartbeat on `outbound` and return once the peer
/// has been silent past the timeout or `outbound` is gone.
pub async fn run_heartbeat(config: HeartbeatConfig, activity: &ActivityMonitor, outbound: &mpsc::UnboundedSender<Envelope>) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let idle = activity.idle();
        if idle > config.timeout() {
            warn!("No traffic for {:?}, closing connection", idle);
            return;
        }
        if outbound.send(Envelope::Heartbeat).is_err() {
            return;
        }
    }
}

/// Sends one request to the server and waits for its response.
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn request(&self, request: Request) -> Result<Response>;
}

type Waiter = oneshot::Sender<Result<Response>>;

/// Correlates requests with their responses on one connection.
pub struct RequestBroker {
    next_transaction: AtomicU64,
    next_request: AtomicU64,
    pending: Mutex<HashMap<RequestId, Waiter>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for RequestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBroker")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RequestBroker {
    /// Frames produced by the broker are sent on `outbound`.
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            next_transaction: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Some(outbound)),
            closed,
        }
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let sender = outbound.as_ref().ok_or(QvcsError::ConnectionClosed)?;
        sender.send(envelope).map_err(|_| QvcsError::ConnectionClosed)
    }

    pub fn begin_transaction(&self) -> Result<TransactionId> {
        let transaction_id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        self.send_envelope(Envelope::BeginTransaction { transaction_id })?;
        Ok(transaction_id)
    }

    pub fn end_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        self.send_envelope(Envelope::EndTransaction { transaction_id })
    }

    /// Queue `request` inside an open transaction. The returned receiver
    /// completes when the response arrives or the connection closes.
    pub fn send(&self, transaction_id: TransactionId, request: Request) -> Result<oneshot::Receiver<Result<Response>>> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if self.is_closed() {
                return Err(QvcsError::ConnectionClosed);
            }
            pending.insert(request_id, tx);
        }
        debug!("Sending {} as request {} in transaction {}", request.name(), request_id, transaction_id);
        if let Err(e) = self.send_envelope(Envelope::Request { transaction_id, request_id, request }) {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&request_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Wrap one request in its own transaction and wait for the answer.
    /// Error responses come back as errors.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let transaction_id = self.begin_transaction()?;
        let waiter = self.send(transaction_id, request);
        let ended = self.end_transaction(transaction_id);
        let response = Self::wait(waiter?).await?;
        ended?;
        response.into_result()
    }

    pub async fn wait(waiter: oneshot::Receiver<Result<Response>>) -> Result<Response> {
        waiter.await.map_err(|_| QvcsError::ConnectionClosed)?
    }

    /// Deliver a response to whoever is waiting on `request_id`.
    pub fn complete(&self, request_id: RequestId, response: Response) {
        let waiter = self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => warn!("Response for unknown request id {}", request_id),
        }
    }

    /// Stop accepting requests and release every waiter.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        let drained: Vec<Waiter> = self.pending.lock().unwrap_or_else(|e| e.into_inner()).drain().map(|(_, w)| w).collect();
        debug!("Broker closed, releasing {} waiters", drained.len());
        for waiter in drained {
            let _ = waiter.send(Err(QvcsError::ConnectionClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has run.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl RequestSender for RequestBroker {
    async fn request(&self, request: Request) -> Result<Response> {
        RequestBroker::request(self, request).await
    }
}

/// A running client connection: writer, reader and heartbeat tasks around
/// one broker.
pub struct ClientConnection {
    broker: Arc<RequestBroker>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientConnection {
    /// Start the connection tasks on `stream`. Pushed notifications arrive
    /// on the returned receiver.
    pub fn start<S>(stream: S, heartbeat: HeartbeatConfig) -> (Self, mpsc::UnboundedReceiver<ServerNotification>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let broker = Arc::new(RequestBroker::new(outbound_tx.clone()));
        let activity = Arc::new(ActivityMonitor::default());

        let writer_broker = Arc::clone(&broker);
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if let Err(e) = write_envelope(&mut writer, &envelope).await {
                    warn!("Write failed: {}", e);
                    break;
                }
            }
            writer_broker.close();
        });

        let reader_broker = Arc::clone(&broker);
        let reader_activity = Arc::clone(&activity);
        let reader_task = tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = reader_broker.closed() => break,
                    read = read_envelope(&mut reader) => read,
                };
                reader_activity.touch();
                match envelope {
                    Ok(Some(Envelope::Response { request_id, response })) => reader_broker.complete(request_id, response),
                    Ok(Some(Envelope::Notification(notification))) => {
                        let _ = notify_tx.send(notification);
                    }
                    Ok(Some(Envelope::Heartbeat)) => {}
                    Ok(Some(other)) => debug!("Ignoring unexpected frame from server: {:?}", other),
                    Ok(None) => {
                        debug!("Server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Read failed: {}", e);
                        break;
                    }
                }
            }
            reader_broker.close();
        });

        let heartbeat_broker = Arc::clone(&broker);
        let heartbeat_task = tokio::spawn(async move {
            tokio::select! {
                _ = heartbeat_broker.closed() => {}
                _ = run_heartbeat(heartbeat, &activity, &outbound_tx) => {}
            }
            heartbeat_broker.close();
        });

        (Self { broker, tasks: vec![writer_task, reader_task, heartbeat_task] }, notify_rx)
    }

    pub fn broker(&self) -> &Arc<RequestBroker> {
        &self.broker
    }

    pub fn close(&self) {
        self.broker.close();
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.broker.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{DirectoryCoordinate, NotificationKind};
    use crate::skinny::SkinnyLogfileInfo;

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let broker = RequestBroker::new(tx);
        let transaction = broker.begin_transaction().unwrap();
        let waiter = broker.send(transaction, Request::ListProjects).unwrap();
        assert_eq!(broker.pending_count(), 1);
        assert!(matches!(rx.recv().await, Some(Envelope::BeginTransaction { .. })));
        assert!(matches!(rx.recv().await, Some(Envelope::Request { request: Request::ListProjects, .. })));

        broker.close();
        assert!(matches!(RequestBroker::wait(waiter).await, Err(QvcsError::ConnectionClosed)));
        assert!(matches!(broker.begin_transaction(), Err(QvcsError::ConnectionClosed)));
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_routes_by_request_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let broker = RequestBroker::new(tx);
        let first = broker.send(1, Request::ListProjects).unwrap();
        let second = broker.send(1, Request::ListProjects).unwrap();
        broker.complete(2, Response::Projects(vec!["b".into()]));
        broker.complete(1, Response::Projects(vec!["a".into()]));
        broker.complete(99, Response::Ok);
        assert_eq!(RequestBroker::wait(first).await.unwrap(), Response::Projects(vec!["a".into()]));
        assert_eq!(RequestBroker::wait(second).await.unwrap(), Response::Projects(vec!["b".into()]));
    }

    #[tokio::test]
    async fn test_request_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (connection, mut notifications) = ClientConnection::start(client, HeartbeatConfig::default());

        let server_task = tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let mut seen = Vec::new();
            while let Some(envelope) = read_envelope(&mut reader).await.unwrap() {
                match envelope {
                    Envelope::Request { request_id, .. } => {
                        let notification = ServerNotification {
                            coordinate: DirectoryCoordinate::new("demo", "Trunk", ""),
                            kind: NotificationKind::Create(SkinnyLogfileInfo::new("a.c", 1, 1)),
                        };
                        write_envelope(&mut writer, &Envelope::Notification(notification)).await.unwrap();
                        let response = Envelope::Response { request_id, response: Response::Projects(vec!["demo".into()]) };
                        write_envelope(&mut writer, &response).await.unwrap();
                        seen.push("request");
                    }
                    Envelope::BeginTransaction { .. } => seen.push("begin"),
                    Envelope::EndTransaction { .. } => {
                        seen.push("end");
                        break;
                    }
                    _ => {}
                }
            }
            seen
        });

        let response = connection.broker().request(Request::ListProjects).await.unwrap();
        assert_eq!(response, Response::Projects(vec!["demo".into()]));
        assert_eq!(notifications.recv().await.unwrap().kind.short_name(), "a.c");
        assert_eq!(server_task.await.unwrap(), vec!["begin", "request", "end"]);
    }

    #[tokio::test]
    async fn test_error_response_becomes_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (connection, _notifications) = ClientConnection::start(client, HeartbeatConfig::default());
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            while let Ok(Some(envelope)) = read_envelope(&mut reader).await {
                if let Envelope::Request { request_id, .. } = envelope {
                    let response = Response::from_error(&QvcsError::ArchiveNotFound("x.c".into()));
                    write_envelope(&mut writer, &Envelope::Response { request_id, response }).await.unwrap();
                }
            }
        });
        let err = connection.broker().request(Request::ListProjects).await.unwrap_err();
        assert!(matches!(err, QvcsError::ArchiveNotFound(_)));
    }

    #[tokio::test]
    async fn test_peer_disconnect_releases_request() {
        let (client, server) = tokio::io::duplex(4096);
        let (connection, _notifications) = ClientConnection::start(client, HeartbeatConfig::default());
        let broker = Arc::clone(connection.broker());
        let pending = tokio::spawn(async move { broker.request(Request::ListProjects).await });
        tokio::task::yield_now().await;
        drop(server);
        assert!(matches!(pending.await.unwrap(), Err(QvcsError::ConnectionClosed)));
        assert!(connection.broker().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_closes_connection() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let config = HeartbeatConfig::new(Duration::from_secs(10), 3);
        let (connection, _notifications) = ClientConnection::start(client, config);
        let broker = Arc::clone(connection.broker());
        let pending = tokio::spawn(async move { broker.request(Request::ListProjects).await });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!connection.broker().is_closed());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(connection.broker().is_closed());
        assert!(matches!(pending.await.unwrap(), Err(QvcsError::ConnectionClosed)));
        drop(server);
    }

    #[test]
    fn test_heartbeat_timeout_value() {
        assert_eq!(HeartbeatConfig::default().timeout(), Duration::from_secs(30));
        assert_eq!(HeartbeatConfig::new(Duration::from_secs(1), 0).timeout_multiple, 1);
    }
}
