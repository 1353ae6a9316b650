// Message framing: the envelope every datagram and coordinator frame uses,
// a push-parser for the TCP stream, and the ack-payload packing rules.

use std::collections::VecDeque;

use thiserror::Error;

use crate::constants::{ACK_ENTRY_BYTES, BASE_HEADER_BYTES, UDP_MTU_BYTES};
use crate::opcode::{OpCode, OpCodeError};
use crate::types::{Attempt, SeqNo, WorkerId};
use crate::wire::{WireError, WireReader, WireWriter};

/// Reliability fields (seqNo, tracked, attempt) are present iff this flag
/// bit is set in the envelope.
pub const FLAG_RELIABLE: u8 = 0x01;

/// Errors raised while decoding message frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error(transparent)]
    Opcode(#[from] OpCodeError),
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The flags byte carried bits this build does not define
    #[error("unknown flag bits {flags:#04x}")]
    UnknownFlags { flags: u8 },
    /// A datagram ended in the middle of a frame
    #[error("datagram truncated mid-frame ({trailing} trailing bytes)")]
    TruncatedDatagram { trailing: usize },
}

/// One framed message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender_id: WorkerId,
    pub opcode: OpCode,
    pub reliable: bool,
    pub seq_no: SeqNo,
    pub tracked: bool,
    pub attempt: Attempt,
    pub payload: Vec<u8>,
}

impl Message {
    /// An unreliable message; the reliability fields stay off the wire
    pub fn new(sender_id: WorkerId, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            sender_id,
            opcode,
            reliable: false,
            seq_no: 0,
            tracked: false,
            attempt: 0,
            payload,
        }
    }

    /// A reliable message carrying sequencing metadata
    pub fn reliable(
        sender_id: WorkerId,
        opcode: OpCode,
        payload: Vec<u8>,
        seq_no: SeqNo,
        tracked: bool,
    ) -> Self {
        Self {
            sender_id,
            opcode,
            reliable: true,
            seq_no,
            tracked,
            attempt: 1,
            payload,
        }
    }

    /// Bytes this message occupies on the wire
    pub fn wire_len(&self) -> usize {
        let reliability = if self.reliable { 11 } else { 0 };
        BASE_HEADER_BYTES + reliability + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(self.wire_len());
        writer.put_u32(self.sender_id);
        writer.put_u16(self.opcode.to_u16());
        writer.put_u8(if self.reliable { FLAG_RELIABLE } else { 0 });
        if self.reliable {
            writer.put_u64(self.seq_no);
            writer.put_bool(self.tracked);
            writer.put_u16(self.attempt);
        }
        writer.put_block(&self.payload);
        writer.into_bytes()
    }

    /// Decode one frame from the reader. Returns `Ok(None)` when the buffer
    /// holds only a partial frame; the caller retains the bytes and retries
    /// once more arrive.
    fn decode_partial(reader: &mut WireReader) -> Result<Option<(Self, usize)>, CodecError> {
        let available = reader.remaining();
        if available < BASE_HEADER_BYTES {
            return Ok(None);
        }

        let mut consumed = 0usize;
        let sender_id = reader.u32()?;
        let opcode = OpCode::from_u16(reader.u16()?)?;
        let flags = reader.u8()?;
        if flags & !FLAG_RELIABLE != 0 {
            return Err(CodecError::UnknownFlags { flags });
        }
        let reliable = flags & FLAG_RELIABLE != 0;
        consumed += 7;

        let (seq_no, tracked, attempt) = if reliable {
            if reader.remaining() < 11 {
                return Ok(None);
            }
            let fields = (reader.u64()?, reader.bool()?, reader.u16()?);
            consumed += 11;
            fields
        } else {
            (0, false, 0)
        };

        if reader.remaining() < 4 {
            return Ok(None);
        }
        let payload_len = reader.u32()? as usize;
        consumed += 4;
        if reader.remaining() < payload_len {
            return Ok(None);
        }
        let payload = reader.bytes(payload_len)?.to_vec();
        consumed += payload_len;

        Ok(Some((
            Self {
                sender_id,
                opcode,
                reliable,
                seq_no,
                tracked,
                attempt,
                payload,
            },
            consumed,
        )))
    }
}

/// Parse a UDP datagram, which must hold whole frames only
pub fn parse_datagram(data: &[u8]) -> Result<Vec<Message>, CodecError> {
    let mut messages = Vec::new();
    let mut reader = WireReader::new(data);
    while !reader.is_empty() {
        match Message::decode_partial(&mut reader)? {
            Some((message, _)) => messages.push(message),
            None => {
                return Err(CodecError::TruncatedDatagram {
                    trailing: reader.remaining(),
                })
            }
        }
    }
    Ok(messages)
}

/// Push-parser for the coordinator byte stream. Accepts arbitrary chunks
/// and yields complete messages, retaining any trailing partial frame.
#[derive(Default)]
pub struct MessageParser {
    buffer: Vec<u8>,
    completed: VecDeque<Message>,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, chunk: &[u8]) -> Result<(), CodecError> {
        self.buffer.extend_from_slice(chunk);

        let mut consumed_total = 0usize;
        loop {
            let mut reader = WireReader::new(&self.buffer[consumed_total..]);
            match Message::decode_partial(&mut reader)? {
                Some((message, consumed)) => {
                    self.completed.push_back(message);
                    consumed_total += consumed;
                }
                None => break,
            }
        }

        if consumed_total > 0 {
            self.buffer.drain(..consumed_total);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.completed.pop_front()
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// One acknowledgement triple as carried in an Ack payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEntry {
    pub seq_no: SeqNo,
    pub tracked: bool,
    pub attempt: Attempt,
}

/// Pack ack entries into payloads of at most `UDP_MTU_BYTES` each
pub fn pack_acks(entries: &[AckEntry]) -> Vec<Vec<u8>> {
    let per_payload = UDP_MTU_BYTES / ACK_ENTRY_BYTES;
    let mut payloads = Vec::new();

    for chunk in entries.chunks(per_payload) {
        let mut writer = WireWriter::with_capacity(chunk.len() * ACK_ENTRY_BYTES);
        for entry in chunk {
            writer.put_u64(entry.seq_no);
            writer.put_bool(entry.tracked);
            writer.put_u16(entry.attempt);
        }
        payloads.push(writer.into_bytes());
    }

    payloads
}

/// Unpack an Ack payload into its triples
pub fn parse_acks(payload: &[u8]) -> Result<Vec<AckEntry>, CodecError> {
    let mut reader = WireReader::new(payload);
    let mut entries = Vec::with_capacity(payload.len() / ACK_ENTRY_BYTES);
    while !reader.is_empty() {
        entries.push(AckEntry {
            seq_no: reader.u64()?,
            tracked: reader.bool()?,
            attempt: reader.u16()?,
        });
    }
    Ok(entries)
}
