use crate::modbus::{self, ModbusTCPCodec, Request, Response};
use futures::{SinkExt as _, StreamExt as _};
use std::collections::{BTreeMap, VecDeque};
use std::pin;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("`{0}` did not resolve to any address")]
    NoAddress(String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` did not complete in time")]
    ConnectTimeout(String),
    #[error("connection to the modbus server is closed")]
    Disconnected,
    #[error("no response received in {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Whether the TCP link to the server is gone, as opposed to a single request failing.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::LookupHost(..)
            | Error::NoAddress(_)
            | Error::Connect(..)
            | Error::ConnectTimeout(_)
            | Error::Disconnected => true,
            Error::Timeout(_) => false,
        }
    }
}

#[derive(Default)]
pub struct ResponseTracker {
    responses: Mutex<BTreeMap<u16, Option<modbus::Response>>>,
    closed: AtomicBool,
    change_notify: Notify,
}

impl ResponseTracker {
    pub fn mark_timeout(&self, transaction_id: u16) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(transaction_id, None);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub fn add_response(&self, response: modbus::Response) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(response.transaction_id, Some(response));
        self.change_notify.notify_waiters();
        drop(guard);
    }

    /// Fail all current and future waiters that have no response recorded yet.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.change_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn take(&self, transaction_id: u16) -> Option<Option<modbus::Response>> {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&transaction_id)
    }

    /// Wait for the outcome of `transaction_id`. `Ok(None)` means the request timed out.
    pub async fn wait_for(&self, transaction_id: u16) -> Result<Option<modbus::Response>, Error> {
        loop {
            // Register interest before looking at the map so that a notification sent between
            // the check and the await is not lost.
            let mut notified = pin::pin!(self.change_notify.notified());
            notified.as_mut().enable();
            if let Some(outcome) = self.take(transaction_id) {
                return Ok(outcome);
            }
            if self.is_closed() {
                return Err(Error::Disconnected);
            }
            notified.await;
        }
    }
}

/// A Modbus TCP client connection.
///
/// Requests may be issued concurrently; they are pipelined over the single socket and matched
/// back up with their responses by transaction ID. Dropping the connection closes the socket.
pub struct Connection {
    request_queue: tokio::sync::mpsc::UnboundedSender<modbus::Request>,
    response_tracker: Arc<ResponseTracker>,
    transaction_id_generator: AtomicU16,
    peer: String,
    timeout: Duration,
    #[allow(unused)] // exists for its drop handler
    worker: AbortOnDropHandle<()>,
}

impl Connection {
    /// Connect to `address` (`host:port`) and start the worker owning the socket.
    ///
    /// `timeout` bounds both establishing the connection and waiting for each response.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Connection, Error> {
        info!(message = "connecting...", address);
        let addresses = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::LookupHost(e, address.to_string()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        if addresses.is_empty() {
            return Err(Error::NoAddress(address.to_string()));
        }
        let socket = tokio::time::timeout(timeout, TcpStream::connect(&*addresses))
            .await
            .map_err(|_| Error::ConnectTimeout(address.to_string()))?
            .map_err(|e| Error::Connect(e, address.to_string()))?;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected", address);

        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker: Arc<ResponseTracker> = Default::default();
        let worker = TcpWorker {
            timeout,
            responses: Arc::clone(&response_tracker),
            inflight: VecDeque::with_capacity(4),
        };
        let io = Framed::new(socket, ModbusTCPCodec {});
        let worker = AbortOnDropHandle::new(tokio::task::spawn(worker.main_loop(io, jobs)));
        Ok(Self {
            request_queue,
            response_tracker,
            transaction_id_generator: AtomicU16::new(0),
            peer: address.to_string(),
            timeout,
            worker,
        })
    }

    pub fn new_transaction_id(&self) -> u16 {
        // wraps around on overflow
        self.transaction_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        !self.response_tracker.is_closed()
    }

    pub async fn send(
        &self,
        device_id: u8,
        operation: modbus::Operation,
    ) -> Result<modbus::Response, Error> {
        let transaction_id = self.new_transaction_id();
        let request = modbus::Request { device_id, transaction_id, operation };
        self.request_queue.send(request).map_err(|_| Error::Disconnected)?;
        match self.response_tracker.wait_for(transaction_id).await? {
            Some(response) => Ok(response),
            None => Err(Error::Timeout(self.timeout)),
        }
    }
}

struct TcpWorker {
    timeout: Duration,
    responses: Arc<ResponseTracker>,
    /// An in-order list of outstanding requests and their timeout instants.
    ///
    /// Requests time out in the order they were sent, so only the deadline of the first entry is
    /// armed at any given time.
    inflight: VecDeque<(u16, Instant)>,
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

impl TcpWorker {
    async fn main_loop(mut self, io: TcpIo, mut jobs: UnboundedReceiver<Request>) {
        match self.serve(io, &mut jobs).await {
            Ok(()) => debug!("modbus connection closed"),
            Err(e) => warn!(
                message = "modbus connection lost",
                error = (&e as &dyn std::error::Error)
            ),
        }
        self.inflight.clear();
        self.responses.close();
    }

    async fn serve(
        &mut self,
        io: TcpIo,
        jobs: &mut UnboundedReceiver<Request>,
    ) -> Result<(), std::io::Error> {
        let (mut io_sink, mut io_source) = io.split();
        let mut recv_time = pin::pin!(tokio::time::sleep_until(Instant::now()));
        loop {
            tokio::select! {
                biased;
                response = io_source.next() => {
                    let Some(response) = response else {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "the modbus server closed the connection",
                        ));
                    };
                    self.handle_response(response?, recv_time.as_mut());
                }
                _ = &mut recv_time, if !self.inflight.is_empty() => {
                    self.handle_timeout(recv_time.as_mut());
                }
                job = jobs.recv() => {
                    let Some(req) = job else {
                        io_sink.close().await?;
                        return Ok(());
                    };
                    let transaction_id = req.transaction_id;
                    io_sink.send(req).await?;
                    self.inflight.push_back((transaction_id, Instant::now() + self.timeout));
                    if self.inflight.len() == 1 {
                        recv_time.as_mut().reset(self.inflight[0].1);
                    }
                }
            }
        }
    }

    fn handle_response(
        &mut self,
        response: Response,
        recv_time: pin::Pin<&mut tokio::time::Sleep>,
    ) {
        trace!(message = "decoded a response", transaction = response.transaction_id);
        let inflight_index =
            self.inflight.iter().position(|(id, _)| *id == response.transaction_id);
        let Some(inflight_index) = inflight_index else {
            debug!(
                message = "a response we were not expecting",
                transaction = response.transaction_id
            );
            return;
        };
        self.inflight.remove(inflight_index);
        self.responses.add_response(response);
        if let Some((_, deadline)) = self.inflight.front() {
            recv_time.reset(*deadline);
        }
    }

    fn handle_timeout(&mut self, recv_time: pin::Pin<&mut tokio::time::Sleep>) {
        let Some((transaction_id, _)) = self.inflight.pop_front() else {
            return;
        };
        debug!(message = "request timed out", transaction = transaction_id);
        self.responses.mark_timeout(transaction_id);
        if let Some((_, deadline)) = self.inflight.front() {
            recv_time.reset(*deadline);
        }
    }
}
