/// RTP fixed header state for one outgoing stream (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet and
///   never reset while the stream lives.
/// - **Timestamp**: supplied per packet by the media pipeline; the last one
///   written is kept for the `RTP-Info` header.
/// - **SSRC**: random per RFC 3550 §8.1.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug, Clone)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

/// Size of the fixed RTP header.
pub const RTP_HEADER_SIZE: usize = 12;
/// Size of the `$` prefix of an interleaved frame (RFC 2326 §10.12).
pub const INTERLEAVED_PREFIX_SIZE: usize = 4;

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            pt: pt & 0x7f,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Per RFC 3550 §8.1, the SSRC should be chosen randomly to minimize
    /// the probability of collisions between independent sessions.
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::new(pt, rand::random::<u32>())
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp of the last packet written.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Serialize a 12-byte header and advance the sequence number.
    ///
    /// The `marker` bit signals the last packet of a frame.
    pub fn write(&mut self, marker: bool, timestamp: u32) -> [u8; RTP_HEADER_SIZE] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | self.pt;

        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = timestamp;
        header
    }
}

/// `'$' <channel> <u16 length>` prefix for interleaved data.
pub fn interleaved_prefix(channel: u8, len: u16) -> [u8; INTERLEAVED_PREFIX_SIZE] {
    let [hi, lo] = len.to_be_bytes();
    [b'$', channel, hi, lo]
}
