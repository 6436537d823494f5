//! Wire codec for the ADC feed notifications
//!
//! Two framings exist in the field and are selected by configuration, never sniffed:
//!
//! * [`Framing::Header`]: `[seq: u16][sample 0]...[sample n]`, each sample being four
//!   3-byte channel fields.
//! * [`Framing::Legacy`]: back-to-back 15-byte records of
//!   `[status: u16][ch0..ch3: 3 bytes each][crc: u8]` with no packet header.
//!
//! The byte order of every multi-byte field is a codec parameter because firmware
//! revisions disagree on it for the same logical field.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    CHANNELS,
};

/// Bytes in the header framing's packet header
pub const HEADER_SIZE: usize = 2;
/// Bytes per ADC channel field
pub const FIELD_SIZE: usize = 3;
/// Bytes per multi-channel sample
pub const SAMPLE_SIZE: usize = CHANNELS * FIELD_SIZE;
/// Bytes per legacy record (status + sample + crc)
pub const LEGACY_RECORD_SIZE: usize = 2 + SAMPLE_SIZE + 1;

const SIGN_BIT: u32 = 1 << 23;
const FIELD_MASK: u32 = (1 << 24) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn read_u16(self, bytes: &[u8]) -> u16 {
        let word = [bytes[0], bytes[1]];
        match self {
            ByteOrder::Big => u16::from_be_bytes(word),
            ByteOrder::Little => u16::from_le_bytes(word),
        }
    }

    fn write_u16(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        }
    }

    fn read_u24(self, bytes: &[u8]) -> u32 {
        let (hi, mid, lo) = match self {
            ByteOrder::Big => (bytes[0], bytes[1], bytes[2]),
            ByteOrder::Little => (bytes[2], bytes[1], bytes[0]),
        };
        (hi as u32) << 16 | (mid as u32) << 8 | lo as u32
    }

    fn write_u24(self, value: u32) -> [u8; 3] {
        let [_, hi, mid, lo] = (value & FIELD_MASK).to_be_bytes();
        match self {
            ByteOrder::Big => [hi, mid, lo],
            ByteOrder::Little => [lo, mid, hi],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    Header,
    Legacy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedHeader {
    pub sequence_number: u16,
}

/// One simultaneous reading of every channel, sign-extended to `i32`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSample {
    pub channels: [i32; CHANNELS],
}

impl FeedSample {
    pub fn new(channels: [i32; CHANNELS]) -> Self {
        Self { channels }
    }
}

/// Per-record fields that only the legacy framing carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordTrailer {
    pub status: u16,
    pub crc: u8,
}

/// The decoded content of one notification
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeedPacket {
    /// `None` in legacy framing
    pub header: Option<FeedHeader>,
    pub samples: Vec<FeedSample>,
    /// One per sample in legacy framing, empty otherwise
    pub trailers: Vec<RecordTrailer>,
}

/// Interpret the low 24 bits of `raw` as two's complement
pub fn sign_extend_24(raw: u32) -> i32 {
    let raw = raw & FIELD_MASK;
    if raw & SIGN_BIT != 0 {
        raw as i32 - (1 << 24)
    } else {
        raw as i32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Codec {
    pub framing: Framing,
    /// Byte order of each 3-byte channel field
    pub sample_order: ByteOrder,
    /// Byte order of the sequence number (header) or status word (legacy)
    pub word_order: ByteOrder,
}

impl Default for Codec {
    fn default() -> Self {
        Self::header()
    }
}

impl Codec {
    /// Current firmware: little-endian everything behind a sequence header
    pub fn header() -> Self {
        Self {
            framing: Framing::Header,
            sample_order: ByteOrder::Little,
            word_order: ByteOrder::Little,
        }
    }

    /// Legacy firmware: ADC words passed through untouched (big-endian) with a
    /// little-endian status word
    pub fn legacy() -> Self {
        Self {
            framing: Framing::Legacy,
            sample_order: ByteOrder::Big,
            word_order: ByteOrder::Little,
        }
    }

    pub fn header_size(&self) -> usize {
        match self.framing {
            Framing::Header => HEADER_SIZE,
            Framing::Legacy => 0,
        }
    }

    pub fn record_size(&self) -> usize {
        match self.framing {
            Framing::Header => SAMPLE_SIZE,
            Framing::Legacy => LEGACY_RECORD_SIZE,
        }
    }

    fn unpack_sample(&self, fields: &[u8]) -> FeedSample {
        let mut sample = FeedSample::default();
        for (ch, field) in fields.chunks_exact(FIELD_SIZE).enumerate() {
            sample.channels[ch] = sign_extend_24(self.sample_order.read_u24(field));
        }
        sample
    }

    fn pack_sample(&self, sample: &FeedSample, out: &mut Vec<u8>) {
        for value in sample.channels {
            out.extend_from_slice(&self.sample_order.write_u24(value as u32));
        }
    }

    /// Decode one notification buffer. Fails only for this buffer.
    pub fn decode(&self, buf: &[u8]) -> Result<FeedPacket> {
        let len = buf.len();
        if len < self.header_size() {
            return Err(Error::MalformedPacket {
                len,
                reason: "shorter than packet header",
            });
        }
        let (head, body) = buf.split_at(self.header_size());
        if body.len() % self.record_size() != 0 {
            return Err(Error::MalformedPacket {
                len,
                reason: "payload is not a whole number of samples",
            });
        }
        let count = body.len() / self.record_size();
        let mut packet = FeedPacket {
            header: None,
            samples: Vec::with_capacity(count),
            trailers: Vec::new(),
        };
        match self.framing {
            Framing::Header => {
                packet.header = Some(FeedHeader {
                    sequence_number: self.word_order.read_u16(head),
                });
                packet.samples.extend(
                    body.chunks_exact(SAMPLE_SIZE)
                        .map(|fields| self.unpack_sample(fields)),
                );
            }
            Framing::Legacy => {
                packet.trailers.reserve(count);
                for record in body.chunks_exact(LEGACY_RECORD_SIZE) {
                    packet.samples.push(self.unpack_sample(&record[2..2 + SAMPLE_SIZE]));
                    packet.trailers.push(RecordTrailer {
                        status: self.word_order.read_u16(&record[..2]),
                        crc: record[LEGACY_RECORD_SIZE - 1],
                    });
                }
            }
        }
        Ok(packet)
    }

    /// Inverse of [`Codec::decode`]. Channel values are truncated to 24 bits, missing
    /// headers or trailers are written as zero.
    pub fn encode(&self, packet: &FeedPacket) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(self.header_size() + packet.samples.len() * self.record_size());
        match self.framing {
            Framing::Header => {
                let seq = packet.header.map(|h| h.sequence_number).unwrap_or_default();
                out.extend_from_slice(&self.word_order.write_u16(seq));
                for sample in &packet.samples {
                    self.pack_sample(sample, &mut out);
                }
            }
            Framing::Legacy => {
                for (i, sample) in packet.samples.iter().enumerate() {
                    let trailer = packet.trailers.get(i).copied().unwrap_or_default();
                    out.extend_from_slice(&self.word_order.write_u16(trailer.status));
                    self.pack_sample(sample, &mut out);
                    out.push(trailer.crc);
                }
            }
        }
        out
    }
}
