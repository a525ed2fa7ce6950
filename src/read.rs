use crate::config::ClientConfig;
use crate::error::Error;
use crate::frame::{OpCode, WsFrame};
use crate::stream::BlipStream;
use crate::write::Writer;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader, ReadHalf};
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

/// The reader half of the pump. Reassembles fragmented messages, answers
/// Ping and Close inline, and pushes every complete payload into the read
/// queue in wire-arrival order.
pub(crate) struct ReadStream {
    buf_reader: BufReader<ReadHalf<BlipStream>>,
    fragments: Option<Vec<u8>>,
    read_tx: Sender<Vec<u8>>,
    writer: Arc<Mutex<Writer>>,
    config: ClientConfig,
}

impl ReadStream {
    pub fn new(
        buf_reader: BufReader<ReadHalf<BlipStream>>,
        read_tx: Sender<Vec<u8>>,
        writer: Arc<Mutex<Writer>>,
        config: ClientConfig,
    ) -> Self {
        Self {
            buf_reader,
            fragments: None,
            read_tx,
            writer,
            config,
        }
    }

    /// Runs until the peer closes or the transport fails. Returning `Ok`
    /// means a clean close.
    pub async fn poll_frames(&mut self) -> Result<(), Error> {
        loop {
            let frame = self.read_frame().await?;
            match frame.opcode {
                // A fragmented message opens with Text or Binary and FIN
                // clear; the rest arrive as Continue frames.
                OpCode::Text | OpCode::Binary if !frame.fin => {
                    if self.fragments.is_none() {
                        self.fragments = Some(frame.payload);
                    } else {
                        Err(Error::FragmentedInProgress)?
                    }
                }
                OpCode::Continue => {
                    if let Some(ref mut fragments) = self.fragments {
                        fragments.extend_from_slice(&frame.payload);
                        if fragments.len() > self.config.max_message_size {
                            Err(Error::MaxMessageSize)?;
                        }
                        if frame.fin {
                            let payload = self.fragments.take().unwrap_or_default();
                            self.deliver(payload).await?;
                        }
                    } else {
                        Err(Error::InvalidContinuationFrame)?
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragments.is_some() {
                        Err(Error::InvalidFrameFragmentation)?
                    }
                    self.deliver(frame.payload).await?;
                }
                OpCode::Close => {
                    // Echo the close so the peer can finish its handshake
                    self.send_close().await?;
                    return Ok(());
                }
                OpCode::Ping => {
                    self.send_pong(frame.payload).await?;
                }
                OpCode::Pong => {}
            }
        }
    }

    async fn read_frame(&mut self) -> Result<WsFrame, Error> {
        let mut header = [0u8; 2];
        self.buf_reader.read_exact(&mut header).await?;

        let fin = (header[0] & 0b1000_0000) != 0;
        let opcode = OpCode::from(header[0] & 0b0000_1111)?;

        // No extension is negotiated on a BLIP connection, so any RSV bit
        // set means the stream is broken
        if header[0] & 0b0111_0000 != 0 {
            return Err(Error::RSVNotZero);
        }

        if !fin && opcode.is_control() {
            Err(Error::ControlFramesFragmented)?;
        }

        let masked = (header[1] & 0b1000_0000) != 0;
        let mut length = (header[1] & 0b0111_1111) as usize;

        if length > 125 && opcode.is_control() {
            Err(Error::ControlFramePayloadSize)?;
        }

        if length == 126 {
            let mut be_bytes = [0u8; 2];
            self.buf_reader.read_exact(&mut be_bytes).await?;
            length = u16::from_be_bytes(be_bytes) as usize;
        } else if length == 127 {
            let mut be_bytes = [0u8; 8];
            self.buf_reader.read_exact(&mut be_bytes).await?;
            length = u64::from_be_bytes(be_bytes) as usize;
        }

        if length > self.config.max_frame_size {
            Err(Error::MaxFrameSize)?;
        }

        // Server frames arrive unmasked per the RFC, but tolerate a masked
        // one rather than tearing the connection down
        let mask = if masked {
            let mut mask = [0u8; 4];
            self.buf_reader.read_exact(&mut mask).await?;
            Some(mask)
        } else {
            None
        };

        let mut payload = vec![0u8; length];

        // Bound the payload read so a stalled peer that already sent a
        // header can't hold the reader forever
        let read_result = timeout(
            Duration::from_secs(5),
            self.buf_reader.read_exact(&mut payload),
        )
        .await;
        match read_result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => Err(e)?,
            Err(elapsed) => Err(elapsed)?,
        }

        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        Ok(WsFrame {
            fin,
            opcode,
            payload,
        })
    }

    async fn deliver(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.read_tx
            .send(payload)
            .await
            .map_err(|_| Error::CommunicationError)
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        let pong = WsFrame::new(true, OpCode::Pong, payload);
        self.writer.lock().await.write_frame(pong).await
    }

    async fn send_close(&mut self) -> Result<(), Error> {
        let close = WsFrame::new(true, OpCode::Close, Vec::new());
        self.writer.lock().await.write_frame(close).await
    }
}
