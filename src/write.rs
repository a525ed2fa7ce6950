use crate::error::Error;
use crate::frame::WsFrame;
use crate::stream::BlipStream;
use tokio::io::{AsyncWriteExt, WriteHalf};

/// The writer half of the pump. Every frame leaving a client must carry a
/// fresh four-byte mask per the RFC.
pub(crate) struct Writer {
    write_half: WriteHalf<BlipStream>,
}

impl Writer {
    pub fn new(write_half: WriteHalf<BlipStream>) -> Self {
        Self { write_half }
    }

    pub async fn write_frame(&mut self, frame: WsFrame) -> Result<(), Error> {
        let mask: [u8; 4] = rand::random();

        let first_byte = (frame.fin as u8) << 7 | frame.opcode.as_u8();
        let payload_len = frame.payload.len();

        self.write_half.write_all(&[first_byte]).await?;

        // The MSB of the length byte signals that a mask follows
        if payload_len <= 125 {
            self.write_half
                .write_all(&[0b1000_0000 | payload_len as u8])
                .await?;
        } else if payload_len <= 65535 {
            self.write_half
                .write_all(&[
                    126 | 0b1000_0000,
                    (payload_len >> 8) as u8,
                    payload_len as u8,
                ])
                .await?;
        } else {
            let bytes = (payload_len as u64).to_be_bytes();
            self.write_half
                .write_all(&[
                    127 | 0b1000_0000,
                    bytes[0],
                    bytes[1],
                    bytes[2],
                    bytes[3],
                    bytes[4],
                    bytes[5],
                    bytes[6],
                    bytes[7],
                ])
                .await?;
        }
        self.write_half.write_all(&mask).await?;

        let mut masked_payload: Vec<u8> = Vec::with_capacity(frame.payload.len());
        for (i, &byte) in frame.payload.iter().enumerate() {
            masked_payload.push(byte ^ mask[i % 4]);
        }
        self.write_half.write_all(&masked_payload).await?;
        self.write_half.flush().await?;

        Ok(())
    }
}
