//! Async serial transport for the FM225 module
//!
//! The module is half-duplex and does not tag replies, so at most one
//! request is outstanding at a time. Reset is the only way to cancel.

use crate::commands::{
    CommandBuilder, CommandId, DeleteUserRequest, EnrollRequest, Request, Transmit, VerifyRequest,
};
use crate::frame;
use crate::idle::{IdleGapAssembler, DEFAULT_CAPACITY};
use crate::responses::{ParsedResponse, ResponseParser};
use crate::types::{MessageKind, Note, Outcome, ProtocolError};

use serial2::SerialPort;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

/// Factory baud rate of the module
pub const BAUD_RATE: u32 = 115200;

/// Wait for commands that carry no device-side timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Silence on the line that ends a message
pub const IDLE_GAP: Duration = Duration::from_millis(20);

/// Added to the device-side timeout before the caller gives up
pub const REPLY_MARGIN: Duration = Duration::from_secs(2);

/// Serial session settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub baud_rate: u32,
    pub idle_gap: Duration,
    pub rx_capacity: usize,
    pub reply_margin: Duration,
    pub default_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            idle_gap: IDLE_GAP,
            rx_capacity: DEFAULT_CAPACITY,
            reply_margin: REPLY_MARGIN,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// How long to wait for the reply to `request`
    #[must_use]
    pub fn wait_for(&self, request: &Request) -> Duration {
        match request.device_timeout() {
            Some(device) => device + self.reply_margin,
            None => self.default_timeout,
        }
    }
}

/// Events from the module that do not answer a pending request
#[derive(Debug, Clone)]
pub enum FaceEvent {
    /// Unsolicited note
    Note(Note),
    /// Reply that belongs to no pending request (late, timed out or cancelled)
    UnsolicitedReply(ParsedResponse),
}

/// Pending request waiting for its reply
struct PendingRequest {
    id: u64,
    command: CommandId,
    response_tx: oneshot::Sender<Result<ParsedResponse, ProtocolError>>,
}

type PendingSlot = Arc<Mutex<Option<PendingRequest>>>;

/// Result of one serial write, reported back by the writer task
type WriteAck = oneshot::Receiver<std::io::Result<()>>;

/// Command to send to the writer task
enum WriteCommand {
    Send {
        data: Vec<u8>,
        done: oneshot::Sender<std::io::Result<()>>,
    },
    Shutdown,
}

/// [`Transmit`] sink that queues frames for the writer task
struct QueueLink {
    tx: mpsc::Sender<WriteCommand>,
    /// Ack for the last queued frame
    written: Option<WriteAck>,
}

impl Transmit for QueueLink {
    fn transmit(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let (done, ack) = oneshot::channel();
        // At most one request is in flight, so the queue only backs up
        // behind a reset and never needs to wait for room
        self.tx
            .try_send(WriteCommand::Send {
                data: frame.to_vec(),
                done,
            })
            .map(|()| self.written = Some(ack))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    std::io::Error::new(std::io::ErrorKind::WouldBlock, "write queue full")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    std::io::Error::new(std::io::ErrorKind::NotConnected, "writer stopped")
                }
            })
    }
}

/// Async transport for communicating with an FM225 module
pub struct FaceTransport {
    /// Channel to send data to the writer task
    write_tx: mpsc::Sender<WriteCommand>,
    /// Request counter
    next_id: AtomicU64,
    /// The single outstanding request, if any
    pending: PendingSlot,
    /// Event sender for unsolicited messages
    event_tx: broadcast::Sender<FaceEvent>,
    /// Tells the reader thread to stop
    shutdown: Arc<AtomicBool>,
    config: TransportConfig,
}

impl FaceTransport {
    /// Connect to a module at the given serial port path
    pub async fn connect(path: &str, config: TransportConfig) -> Result<Self, ProtocolError> {
        tracing::info!("Connecting to FM225 at {} ({} baud)", path, config.baud_rate);

        let mut port = SerialPort::open(path, config.baud_rate)?;

        // A read that times out marks the end of a message
        port.set_read_timeout(config.idle_gap)?;

        let reader_port = port.try_clone()?;

        let (write_tx, write_rx) = mpsc::channel(8);
        let (message_tx, message_rx) = mpsc::channel::<Vec<u8>>(32);

        tokio::spawn(Self::writer_task(port, write_rx));

        let shutdown = Arc::new(AtomicBool::new(false));
        let capacity = config.rx_capacity;
        let reader_shutdown = shutdown.clone();
        std::thread::spawn(move || {
            Self::reader_thread(reader_port, capacity, message_tx, &reader_shutdown);
        });

        let transport = Self::with_channels(write_tx, message_rx, shutdown, config);
        tracing::info!("Connected to FM225");
        Ok(transport)
    }

    /// Build a transport around existing channels and start dispatching
    fn with_channels(
        write_tx: mpsc::Sender<WriteCommand>,
        message_rx: mpsc::Receiver<Vec<u8>>,
        shutdown: Arc<AtomicBool>,
        config: TransportConfig,
    ) -> Self {
        let pending: PendingSlot = Arc::new(Mutex::new(None));
        let (event_tx, _) = broadcast::channel(64);

        tokio::spawn(Self::message_handler_task(
            message_rx,
            pending.clone(),
            event_tx.clone(),
        ));

        Self {
            write_tx,
            next_id: AtomicU64::new(1),
            pending,
            event_tx,
            shutdown,
            config,
        }
    }

    /// Writer task - runs in tokio runtime
    async fn writer_task<T: Transmit + Send>(mut port: T, mut rx: mpsc::Receiver<WriteCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriteCommand::Send { data, done } => {
                    tracing::debug!("Writing {} bytes to serial port", data.len());
                    let result = port
                        .transmit(&data)
                        .inspect_err(|e| tracing::error!("Write error: {}", e));
                    let _ = done.send(result);
                }
                WriteCommand::Shutdown => break,
            }
        }
        tracing::debug!("Writer task shutting down");
    }

    /// Reader thread - blocking reads, the read timeout is the idle gap
    ///
    /// Runs until `shutdown` is set, the port fails, or the dispatcher is gone.
    fn reader_thread<R: Read>(
        mut port: R,
        capacity: usize,
        message_tx: mpsc::Sender<Vec<u8>>,
        shutdown: &AtomicBool,
    ) {
        tracing::debug!("Reader thread started");
        let mut buffer = [0u8; 256];
        let mut assembler = IdleGapAssembler::new(capacity);

        while !shutdown.load(Ordering::Acquire) {
            let messages = match port.read(&mut buffer) {
                Ok(0) => {
                    tracing::warn!("Serial port closed");
                    break;
                }
                Ok(n) => {
                    tracing::trace!("Read {} bytes: {:02X?}", n, &buffer[..n]);
                    assembler.feed(&buffer[..n])
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock
                        || e.raw_os_error() == Some(libc::EAGAIN) =>
                {
                    assembler.on_idle().into_iter().collect()
                }
                Err(e) => {
                    tracing::error!("Serial read error: {}", e);
                    break;
                }
            };

            for message in messages {
                tracing::debug!("Received message: {:02X?}", &message);
                if message_tx.blocking_send(message).is_err() {
                    tracing::warn!("Message channel closed");
                    return;
                }
            }
        }
        tracing::debug!("Reader thread shutting down");
    }

    /// Message handler task - processes messages from the reader thread
    async fn message_handler_task(
        mut message_rx: mpsc::Receiver<Vec<u8>>,
        pending: PendingSlot,
        event_tx: broadcast::Sender<FaceEvent>,
    ) {
        while let Some(message) = message_rx.recv().await {
            Self::dispatch(&message, &pending, &event_tx).await;
        }

        // Nothing more will arrive; fail whoever is still waiting
        if let Some(req) = pending.lock().await.take() {
            let _ = req.response_tx.send(Err(ProtocolError::NotConnected));
        }
        tracing::debug!("Message handler task shutting down");
    }

    /// Route one received message
    async fn dispatch(
        data: &[u8],
        pending: &PendingSlot,
        event_tx: &broadcast::Sender<FaceEvent>,
    ) {
        let response = ResponseParser::parse(data);
        if !response.is_valid() {
            if let Err(e) = frame::check(data) {
                tracing::debug!("Discarding {} bytes: {}", data.len(), e);
            }
            return;
        }

        match response.kind() {
            MessageKind::Reply => {
                let mut pending_guard = pending.lock().await;
                match pending_guard.take() {
                    Some(req) if response.echo_mismatch(req.command) => {
                        // Usually the reply to a command a reset cancelled
                        tracing::warn!(
                            "Reply echoes {:02X?}, expected {:?}",
                            response.command_echo,
                            req.command
                        );
                        *pending_guard = Some(req);
                    }
                    Some(req) => {
                        drop(pending_guard);
                        let _ = req.response_tx.send(Ok(response));
                        return;
                    }
                    None => {
                        tracing::debug!("Reply with no pending request: {:?}", response);
                    }
                }
                drop(pending_guard);

                let _ = event_tx.send(FaceEvent::UnsolicitedReply(response));
            }
            MessageKind::Note => {
                if let Some(note) = response.note() {
                    tracing::debug!("Note received: {:?}", note);
                    let _ = event_tx.send(FaceEvent::Note(note));
                }
            }
            MessageKind::Other(kind) => {
                tracing::debug!("Unhandled message kind {:#04X}", kind);
            }
        }
    }

    /// Send a request and wait for its reply, using the configured wait
    pub async fn request(&self, request: Request) -> Result<ParsedResponse, ProtocolError> {
        let timeout = self.config.wait_for(&request);
        self.request_timeout(request, timeout).await
    }

    /// Send a request with custom timeout
    ///
    /// Fails with `Busy` while another request is outstanding, unless this
    /// is a reset, which cancels the outstanding request.
    pub async fn request_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<ParsedResponse, ProtocolError> {
        let command = request.command_id();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (response_tx, response_rx) = oneshot::channel();

        let written = {
            let mut pending = self.pending.lock().await;
            if let Some(current) = pending.as_ref() {
                if command != CommandId::Reset {
                    return Err(ProtocolError::Busy(current.command));
                }
            }

            let previous = pending.replace(PendingRequest {
                id,
                command,
                response_tx,
            });
            if let Some(previous) = previous {
                tracing::info!("Reset cancels pending {:?}", previous.command);
                let _ = previous.response_tx.send(Err(ProtocolError::Cancelled));
            }

            // Queue while holding the slot so send order matches reply order
            let mut link = QueueLink {
                tx: self.write_tx.clone(),
                written: None,
            };
            if let Err(e) = CommandBuilder::new(&mut link).send(&request) {
                pending.take();
                return Err(e);
            }
            link.written
        };

        let wait = async {
            match written {
                Some(ack) => match ack.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(ProtocolError::TransmitFailed(e)),
                    Err(_) => return Err(ProtocolError::NotConnected),
                },
                None => return Err(ProtocolError::NotConnected),
            }
            tracing::debug!("Sent {:?}, waiting up to {:?}", command, timeout);
            response_rx
                .await
                .unwrap_or(Err(ProtocolError::NotConnected))
        };

        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("No reply to {:?} within {:?}", command, timeout);
                Err(ProtocolError::Timeout)
            }
        };

        if result.is_err() {
            // Free the slot, if it is still ours
            let mut pending = self.pending.lock().await;
            if pending.as_ref().is_some_and(|p| p.id == id) {
                pending.take();
            }
        }
        result
    }

    /// Subscribe to module events
    pub fn subscribe(&self) -> broadcast::Receiver<FaceEvent> {
        self.event_tx.subscribe()
    }

    /// Wait for the module's power-up Ready note
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(FaceEvent::Note(Note::Ready)) => return Ok(()),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ProtocolError::NotConnected)
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    async fn run(&self, request: Request) -> Result<Outcome, ProtocolError> {
        let command = request.command_id();
        let response = self.request(request).await?;
        let outcome = response.outcome();
        tracing::info!("{:?} finished: {:?}", command, outcome);
        Ok(outcome)
    }

    /// Enroll a face
    pub async fn enroll(&self, request: EnrollRequest) -> Result<Outcome, ProtocolError> {
        self.run(Request::Enroll(request)).await
    }

    /// Verify a face against the library
    pub async fn verify(&self, request: VerifyRequest) -> Result<Outcome, ProtocolError> {
        self.run(Request::Verify(request)).await
    }

    /// Delete one user
    pub async fn delete_user(&self, user_id: u16) -> Result<Outcome, ProtocolError> {
        let request = DeleteUserRequest::new(user_id)?;
        self.run(Request::DeleteUser(request)).await
    }

    /// Delete every user
    pub async fn delete_all(&self) -> Result<Outcome, ProtocolError> {
        self.run(Request::DeleteAll).await
    }

    /// Abort the running operation
    pub async fn reset(&self) -> Result<Outcome, ProtocolError> {
        self.run(Request::Reset).await
    }
}

impl Drop for FaceTransport {
    fn drop(&mut self) {
        // Signal shutdown (best effort)
        self.shutdown.store(true, Ordering::Release);
        let _ = self.write_tx.try_send(WriteCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0xEF, 0xAA, 0x00];
        data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data.extend_from_slice(payload);
        data.push(0);
        let bcc = frame::checksum(&data);
        *data.last_mut().unwrap() = bcc;
        data
    }

    struct Harness {
        transport: Arc<FaceTransport>,
        write_rx: mpsc::Receiver<WriteCommand>,
        message_tx: mpsc::Sender<Vec<u8>>,
    }

    fn harness() -> Harness {
        let (write_tx, write_rx) = mpsc::channel(8);
        let (message_tx, message_rx) = mpsc::channel(8);
        let transport = FaceTransport::with_channels(
            write_tx,
            message_rx,
            Arc::new(AtomicBool::new(false)),
            TransportConfig::default(),
        );
        Harness {
            transport: Arc::new(transport),
            write_rx,
            message_tx,
        }
    }

    /// Take the next queued frame and report it as written
    async fn next_frame(rx: &mut mpsc::Receiver<WriteCommand>) -> Vec<u8> {
        match rx.recv().await {
            Some(WriteCommand::Send { data, done }) => {
                let _ = done.send(Ok(()));
                data
            }
            _ => panic!("expected a queued frame"),
        }
    }

    struct BrokenPort;

    impl Transmit for BrokenPort {
        fn transmit(&mut self, _frame: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
        }
    }

    /// Serves queued chunks, then reports an idle line forever
    struct ScriptedPort {
        chunks: std::collections::VecDeque<Vec<u8>>,
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Err(std::io::ErrorKind::TimedOut.into())
                }
            }
        }
    }

    #[tokio::test]
    async fn test_request_gets_reply() {
        let mut h = harness();
        let transport = h.transport.clone();
        let task = tokio::spawn(async move { transport.delete_all().await });

        let sent = next_frame(&mut h.write_rx).await;
        assert_eq!(sent, vec![0xEF, 0xAA, 0x21, 0x00, 0x00, 0x21]);

        // Noise first; it must be ignored
        h.message_tx.send(vec![0x00, 0xFF, 0x13]).await.unwrap();
        h.message_tx.send(reply(&[0x21, 0x00])).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), Outcome::Success);
    }

    #[tokio::test]
    async fn test_verify_reply_with_id() {
        let mut h = harness();
        let transport = h.transport.clone();
        let task =
            tokio::spawn(async move { transport.verify(VerifyRequest::new(true, 10)).await });

        next_frame(&mut h.write_rx).await;
        h.message_tx
            .send(reply(&[0x12, 0x00, 0x00, 0x03]))
            .await
            .unwrap();

        assert_eq!(task.await.unwrap().unwrap(), Outcome::SuccessWithId(3));
    }

    #[tokio::test]
    async fn test_second_request_is_busy() {
        let mut h = harness();
        let transport = h.transport.clone();
        let first = tokio::spawn(async move { transport.delete_all().await });
        next_frame(&mut h.write_rx).await;

        let err = h.transport.delete_user(4).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Busy(CommandId::DeleteAll)));

        h.message_tx.send(reply(&[0x21, 0x00])).await.unwrap();
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_reset_cancels_pending() {
        let mut h = harness();
        let transport = h.transport.clone();
        let verify =
            tokio::spawn(async move { transport.verify(VerifyRequest::new(false, 30)).await });
        next_frame(&mut h.write_rx).await;

        let transport = h.transport.clone();
        let reset = tokio::spawn(async move { transport.reset().await });
        let sent = next_frame(&mut h.write_rx).await;
        assert_eq!(sent, vec![0xEF, 0xAA, 0x10, 0x00, 0x00, 0x10]);

        assert!(matches!(
            verify.await.unwrap(),
            Err(ProtocolError::Cancelled)
        ));

        h.message_tx.send(reply(&[0x10, 0x00])).await.unwrap();
        assert_eq!(reset.await.unwrap().unwrap(), Outcome::Success);
    }

    #[tokio::test]
    async fn test_cancelled_reply_does_not_answer_reset() {
        let mut h = harness();
        let transport = h.transport.clone();
        let verify =
            tokio::spawn(async move { transport.verify(VerifyRequest::new(false, 30)).await });
        next_frame(&mut h.write_rx).await;

        let transport = h.transport.clone();
        let reset = tokio::spawn(async move { transport.reset().await });
        next_frame(&mut h.write_rx).await;
        assert!(matches!(
            verify.await.unwrap(),
            Err(ProtocolError::Cancelled)
        ));

        // The module answers the cancelled verify before the reset
        let mut events = h.transport.subscribe();
        h.message_tx.send(reply(&[0x12, 0x05])).await.unwrap();
        h.message_tx.send(reply(&[0x10, 0x00])).await.unwrap();

        assert_eq!(reset.await.unwrap().unwrap(), Outcome::Success);
        match events.recv().await.unwrap() {
            FaceEvent::UnsolicitedReply(response) => {
                assert_eq!(response.command_echo, Some(0x12));
                assert_eq!(response.outcome(), Outcome::Rejected(0x05));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_transmit_failed() {
        let (write_tx, write_rx) = mpsc::channel(8);
        let (_message_tx, message_rx) = mpsc::channel(8);
        tokio::spawn(FaceTransport::writer_task(BrokenPort, write_rx));
        let transport = FaceTransport::with_channels(
            write_tx,
            message_rx,
            Arc::new(AtomicBool::new(false)),
            TransportConfig::default(),
        );

        let err = transport.delete_all().await.unwrap_err();
        assert!(matches!(err, ProtocolError::TransmitFailed(_)));
        assert!(!err.is_parameter_error());

        // The slot was released, so the next request is not Busy
        let err = transport.reset().await.unwrap_err();
        assert!(matches!(err, ProtocolError::TransmitFailed(_)));
    }

    #[test]
    fn test_reader_stops_on_shutdown() {
        let (message_tx, mut message_rx) = mpsc::channel(8);
        let shutdown = Arc::new(AtomicBool::new(false));
        let port = ScriptedPort {
            chunks: vec![reply(&[0x21, 0x00])].into(),
        };

        let flag = shutdown.clone();
        let reader = std::thread::spawn(move || {
            FaceTransport::reader_thread(port, DEFAULT_CAPACITY, message_tx, &flag);
        });

        assert_eq!(message_rx.blocking_recv(), Some(reply(&[0x21, 0x00])));

        shutdown.store(true, Ordering::Release);
        reader.join().unwrap();
        // The reader owned the only sender, so the dispatcher sees the end
        assert_eq!(message_rx.blocking_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_slot() {
        let mut h = harness();
        let err = h
            .transport
            .request_timeout(Request::DeleteAll, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
        next_frame(&mut h.write_rx).await;

        // Late reply surfaces as an event, and the slot is free again
        let mut events = h.transport.subscribe();
        h.message_tx.send(reply(&[0x21, 0x00])).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            FaceEvent::UnsolicitedReply(_)
        ));

        let transport = h.transport.clone();
        let task = tokio::spawn(async move { transport.reset().await });
        next_frame(&mut h.write_rx).await;
        h.message_tx.send(reply(&[0x10, 0x00])).await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ready_note_event() {
        let h = harness();
        let transport = h.transport.clone();
        let waiter =
            tokio::spawn(async move { transport.wait_ready(Duration::from_secs(1)).await });
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        h.message_tx
            .send(vec![0xEF, 0xAA, 0x01, 0x00, 0x01, 0x00, 0x00])
            .await
            .unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_user_id_not_sent() {
        let mut h = harness();
        let err = h.transport.delete_user(0).await.unwrap_err();
        assert!(err.is_parameter_error());
        assert!(h.write_rx.try_recv().is_err());
    }

    #[test]
    fn test_wait_for() {
        let config = TransportConfig::default();
        assert_eq!(config.wait_for(&Request::Reset), DEFAULT_TIMEOUT);
        let verify = Request::Verify(VerifyRequest::new(false, 0));
        assert_eq!(config.wait_for(&verify), Duration::from_secs(12));
    }
}
