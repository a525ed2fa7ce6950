use crate::error::Error;
use crate::message::{BlipMessage, COMPRESSED};
use crate::varint::{decode_uvarint, encode_uvarint};
use crc32fast::Hasher;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::trace;

/// Trailer emitted by a raw-DEFLATE sync flush. Stripped before
/// transmission and re-appended by the receiver before inflating.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Composes and parses BLIP wire frames for one connection.
///
/// Owns the per-direction rolling CRC-32s and the per-direction DEFLATE
/// contexts. Neither is ever reset between frames: the CRC covers every
/// payload region sent (or received) on its direction in order, which binds
/// frame order into the integrity check, and the DEFLATE contexts carry
/// their dictionaries across frames.
pub struct Messenger {
    send_crc: Hasher,
    recv_crc: Hasher,
    deflater: Compress,
    inflater: Decompress,
}

impl Default for Messenger {
    fn default() -> Self {
        Messenger::new()
    }
}

impl Messenger {
    pub fn new() -> Self {
        Messenger {
            send_crc: Hasher::new(),
            recv_crc: Hasher::new(),
            deflater: Compress::new(Compression::default(), false),
            inflater: Decompress::new(false),
        }
    }

    /// Serializes a message into one wire frame:
    /// `VLQ(number) || VLQ(flags) || payload || CRC32_BE`.
    ///
    /// The rolling CRC is taken over the uncompressed payload region; when
    /// the message is compressed, only the region between header and CRC is
    /// deflated.
    pub fn compose(&mut self, message: &BlipMessage) -> Result<Vec<u8>, Error> {
        let mut frame = encode_uvarint(message.number);
        frame.extend_from_slice(&encode_uvarint(message.flags() as u64));

        let properties = message.properties.encode();
        let mut payload = encode_uvarint(properties.len() as u64);
        payload.extend_from_slice(&properties);
        payload.extend_from_slice(&message.body);

        self.send_crc.update(&payload);
        let crc = self.send_crc.clone().finalize();

        if message.compressed {
            payload = self.deflate(&payload)?;
        }

        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc.to_be_bytes());
        trace!(
            "composed frame for message #{}: {} bytes",
            message.number,
            frame.len()
        );
        Ok(frame)
    }

    /// Parses one wire frame back into a message, verifying the rolling CRC.
    ///
    /// A mismatch means the stream is out of step with the peer; the frame
    /// is not delivered.
    pub fn parse(&mut self, data: &[u8]) -> Result<BlipMessage, Error> {
        let (number, number_len) = decode_uvarint(data)?;
        let (flags, flags_len) = decode_uvarint(&data[number_len..])?;
        let header_len = number_len + flags_len;
        if data.len() < header_len + 4 {
            return Err(Error::TruncatedFrame);
        }

        let mut declared = [0u8; 4];
        declared.copy_from_slice(&data[data.len() - 4..]);
        let declared = u32::from_be_bytes(declared);

        let region = &data[header_len..data.len() - 4];
        let payload = if flags as u8 & COMPRESSED != 0 {
            self.inflate(region)?
        } else {
            region.to_vec()
        };

        self.recv_crc.update(&payload);
        let actual = self.recv_crc.clone().finalize();
        if actual != declared {
            return Err(Error::CrcMismatch { number });
        }

        let (properties_len, len_len) = decode_uvarint(&payload)?;
        let properties_end = len_len + properties_len as usize;
        if payload.len() < properties_end {
            return Err(Error::TruncatedFrame);
        }

        let mut message = BlipMessage::new();
        message.number = number;
        message.apply_flags(flags as u8);
        message.properties = crate::message::Properties::parse(&payload[len_len..properties_end])?;
        message.body = payload[properties_end..].to_vec();
        Ok(message)
    }

    /// Raw DEFLATE with a sync flush, minus the 4-byte trailer the flush
    /// appends.
    fn deflate(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(data.len() + 16);
        let start = self.deflater.total_in();
        while ((self.deflater.total_in() - start) as usize) < data.len() {
            let consumed = (self.deflater.total_in() - start) as usize;
            out.reserve(256 + data.len() / 2);
            self.deflater
                .compress_vec(&data[consumed..], &mut out, FlushCompress::None)?;
        }
        loop {
            let produced = out.len();
            out.reserve(64);
            self.deflater
                .compress_vec(&[], &mut out, FlushCompress::Sync)?;
            if out.len() == produced {
                break;
            }
        }
        if out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }
        Ok(out)
    }

    fn inflate(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let mut out = Vec::with_capacity(input.len().max(1024) * 4);
        let start = self.inflater.total_in();
        loop {
            let consumed = (self.inflater.total_in() - start) as usize;
            out.reserve(4096);
            let status = self
                .inflater
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)?;
            if status == Status::StreamEnd {
                break;
            }
            // Done once the whole input went in and the last call had spare
            // output room, i.e. nothing is still buffered in the inflater
            if (self.inflater.total_in() - start) as usize == input.len()
                && out.len() < out.capacity()
            {
                break;
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn send_crc(&self) -> u32 {
        self.send_crc.clone().finalize()
    }

    #[cfg(test)]
    pub(crate) fn recv_crc(&self) -> u32 {
        self.recv_crc.clone().finalize()
    }
}
