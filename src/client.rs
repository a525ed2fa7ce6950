use crate::config::ClientConfig;
use crate::error::Error;
use crate::frame::{OpCode, WsFrame};
use crate::handshake::connect_async;
use crate::read::ReadStream;
use crate::stream::BlipStream;
use crate::write::Writer;
use log::{debug, error};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::BufReader;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const QUEUE_DEPTH: usize = 64;
const STATUS_MESSAGE_LIMIT: usize = 256;

/// Why the pump stopped. Written once by whichever side fails first; the
/// protocol layer reads it after the read queue closes.
pub(crate) struct PumpStatus {
    code: AtomicU16,
    message: StdMutex<String>,
}

impl PumpStatus {
    fn new() -> Self {
        PumpStatus {
            code: AtomicU16::new(0),
            message: StdMutex::new(String::new()),
        }
    }

    fn record(&self, code: u16, message: &str) {
        if self
            .code
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mut truncated = message.to_string();
        truncated.truncate(STATUS_MESSAGE_LIMIT);
        if let Ok(mut slot) = self.message.lock() {
            *slot = truncated;
        }
    }

    fn get(&self) -> (u16, String) {
        let code = self.code.load(Ordering::Acquire);
        let message = self
            .message
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or_default();
        (code, message)
    }
}

enum WriteCommand {
    Frame(Vec<u8>),
    Close,
}

/// Owns one WebSocket connection and pumps it with a reader task and a
/// writer task. The rest of the crate talks to the socket only through the
/// two queues and the status cell.
///
/// The read queue closing is the failure sentinel: the reader records a
/// status first, so a blocked consumer wakes up and can translate it.
pub struct BlipClient {
    read_rx: Receiver<Vec<u8>>,
    write_tx: Sender<WriteCommand>,
    status: Arc<PumpStatus>,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl BlipClient {
    pub async fn connect(
        url: &str,
        headers: &[(String, String)],
        config: ClientConfig,
    ) -> Result<Self, Error> {
        let stream = connect_async(url, headers, &config).await?;
        Ok(Self::from_stream(stream, config))
    }

    /// Wraps an already-upgraded stream. Split out so tests can drive the
    /// pump over a plain socket pair.
    pub(crate) fn from_stream(stream: BlipStream, config: ClientConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(Writer::new(write_half)));
        let (read_tx, read_rx) = mpsc::channel(QUEUE_DEPTH);
        let (write_tx, mut write_rx) = mpsc::channel::<WriteCommand>(QUEUE_DEPTH);
        let status = Arc::new(PumpStatus::new());

        let mut read_stream =
            ReadStream::new(BufReader::new(read_half), read_tx, writer.clone(), config);
        let reader_status = status.clone();
        let reader_handle = tokio::spawn(async move {
            match read_stream.poll_frames().await {
                Ok(()) => {
                    debug!("connection closed by peer");
                    reader_status.record(1000, "Connection Closed");
                }
                Err(err) => {
                    error!("reader error: {}", err);
                    reader_status.record(500, &err.to_string());
                }
            }
            // read_tx drops here, which is the sentinel consumers see
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(command) = write_rx.recv().await {
                match command {
                    WriteCommand::Frame(data) => {
                        debug!("sending data frame: {} bytes", data.len());
                        let frame = WsFrame::new(true, OpCode::Binary, data);
                        if let Err(err) = writer.lock().await.write_frame(frame).await {
                            error!("writer error: {}", err);
                            break;
                        }
                    }
                    WriteCommand::Close => {
                        let close = WsFrame::new(true, OpCode::Close, Vec::new());
                        let _ = writer.lock().await.write_frame(close).await;
                        break;
                    }
                }
            }
        });

        BlipClient {
            read_rx,
            write_tx,
            status,
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        }
    }

    /// Queues one composed BLIP frame for transmission, in enqueue order.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), Error> {
        self.write_tx
            .send(WriteCommand::Frame(frame))
            .await
            .map_err(|_| Error::CommunicationError)
    }

    /// The next complete inbound frame, or `None` once the pump stopped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.read_rx.recv().await
    }

    pub fn status(&self) -> (u16, String) {
        self.status.get()
    }

    /// Requests a close and waits for both tasks to drain and exit.
    pub async fn stop(&mut self) {
        debug!("received disconnect request");
        let _ = self.write_tx.send(WriteCommand::Close).await;
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.await;
        }
        if let Some(mut handle) = self.reader_handle.take() {
            // The peer should answer our Close; don't wait forever if it
            // doesn't
            if timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}
