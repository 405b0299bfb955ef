//! Fixed binary frame codec.
//!
//! Every datagram on the wire is `sign:u16, wnd:u16, seq:u32, payload:[u8; mss]`
//! in network byte order, total length `8 + mss`. `wnd` is overloaded: on a
//! sender-to-receiver data frame it is the payload length in bytes (with two
//! sentinels carved out for FIN and the window probe); on a receiver-to-sender
//! ACK frame it is the advertised window in frames. Rather than carry that
//! ambiguity past the wire boundary, [`RawFrame`] captures the literal layout
//! and [`Content`] is the tagged variant the rest of the crate actually
//! reasons about (per the overloaded-`wnd` redesign note).

use crate::error::{Error, Result};

const HEADER_LEN: usize = 2 + 2 + 4;

/// The literal on-wire layout: `sign`, `wnd`, `seq`, `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub sign: u16,
    pub wnd: u16,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl RawFrame {
    /// Encodes into a zero-padded buffer of exactly `8 + mss` bytes.
    ///
    /// Panics if `self.payload.len() > mss`; that would be a bug in the
    /// caller (the codec is never asked to truncate real file data).
    pub fn encode(&self, mss: usize) -> Vec<u8> {
        assert!(self.payload.len() <= mss, "payload exceeds mss");

        let mut buf = Vec::with_capacity(HEADER_LEN + mss);
        buf.extend_from_slice(&self.sign.to_be_bytes());
        buf.extend_from_slice(&self.wnd.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.resize(HEADER_LEN + mss, 0);
        buf
    }

    /// Decodes a raw datagram. Rejects (returns `None`, never panics or
    /// aborts the caller) any buffer whose length differs from `8 + mss` —
    /// the codec drops and logs malformed frames, per §4.1.
    pub fn decode(raw: &[u8], mss: usize) -> Option<RawFrame> {
        if raw.len() != HEADER_LEN + mss {
            return None;
        }

        let sign = u16::from_be_bytes([raw[0], raw[1]]);
        let wnd = u16::from_be_bytes([raw[2], raw[3]]);
        let seq = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let payload = raw[HEADER_LEN..].to_vec();

        Some(RawFrame {
            sign,
            wnd,
            seq,
            payload,
        })
    }
}

/// The tagged meaning of a data-phase frame, with the overloaded `wnd`
/// sentinels resolved into variants so the rest of the engine can never
/// confuse a byte count with a frame count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Sender -> receiver: `len` bytes of file payload (`len <= mss`).
    Data(Vec<u8>),
    /// Sender -> receiver: terminal frame, no payload.
    Fin,
    /// Sender -> receiver: "tell me your current rwnd", no payload.
    WindowProbe,
    /// Receiver -> sender: cumulative ACK, advertising `rwnd_frames`.
    Ack { rwnd_frames: u16 },
}

impl Content {
    pub fn into_sender_frame(self, sign: u16, seq: u32) -> RawFrame {
        match self {
            Content::Data(payload) => RawFrame {
                sign,
                wnd: payload.len() as u16,
                seq,
                payload,
            },
            Content::Fin => RawFrame {
                sign,
                wnd: crate::config::DONE,
                seq,
                payload: Vec::new(),
            },
            Content::WindowProbe => RawFrame {
                sign,
                wnd: crate::config::GETWINDOW,
                seq,
                payload: Vec::new(),
            },
            Content::Ack { .. } => panic!("an Ack is never sent by the sender"),
        }
    }

    pub fn into_ack_frame(self, sign: u16, seq: u32) -> RawFrame {
        match self {
            Content::Ack { rwnd_frames } => RawFrame {
                sign,
                wnd: rwnd_frames,
                seq,
                payload: Vec::new(),
            },
            _ => panic!("only an Ack is sent by the receiver"),
        }
    }

    /// Interprets a received data-phase frame sent by a sender.
    pub fn from_sender_frame(raw: &RawFrame) -> Result<Content> {
        match raw.wnd {
            crate::config::DONE => Ok(Content::Fin),
            crate::config::GETWINDOW => Ok(Content::WindowProbe),
            len if (len as usize) <= raw.payload.len() => {
                Ok(Content::Data(raw.payload[..len as usize].to_vec()))
            }
            _ => Err(Error::MalformedHandshake(format!(
                "wnd {} exceeds payload length {}",
                raw.wnd,
                raw.payload.len()
            ))),
        }
    }

    /// Interprets a received ACK frame sent by a receiver.
    pub fn from_ack_frame(raw: &RawFrame) -> Content {
        Content::Ack {
            rwnd_frames: raw.wnd,
        }
    }
}

/// Internal (never-on-wire) events the sender's rx task reacts to,
/// replacing the original's `TIMEOUT_ACK = -1` / `DUP_ACK = -2` sentinel
/// integers with variants the type system cannot accidentally serialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    /// A normal, in-range cumulative ACK for `through_seq`.
    Ack { through_seq: u32, rwnd_frames: u16 },
    /// A duplicate ACK (`seq == unacked_seq - 1`).
    DupAck,
    /// An ACK for a seq already covered by a prior forward ACK; ignored
    /// aside from resetting the duplicate-ACK count.
    Stale,
    /// The read timed out waiting for an ACK.
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_data_frame() {
        let raw = RawFrame {
            sign: 42,
            wnd: 5,
            seq: 7,
            payload: vec![1, 2, 3, 4, 5],
        };
        let encoded = raw.encode(16);
        assert_eq!(encoded.len(), HEADER_LEN + 16);
        let decoded = RawFrame::decode(&encoded, 16).unwrap();
        assert_eq!(decoded.sign, 42);
        assert_eq!(decoded.wnd, 5);
        assert_eq!(decoded.seq, 7);
        assert_eq!(&decoded.payload[..5], &[1, 2, 3, 4, 5]);
        assert!(decoded.payload[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_wrong_length_frames() {
        let raw = vec![0u8; 4];
        assert!(RawFrame::decode(&raw, 16).is_none());
    }

    #[test]
    fn resolves_fin_and_probe_sentinels() {
        let fin = RawFrame {
            sign: 1,
            wnd: crate::config::DONE,
            seq: 3,
            payload: vec![0; 8],
        };
        assert_eq!(Content::from_sender_frame(&fin).unwrap(), Content::Fin);

        let probe = RawFrame {
            sign: 1,
            wnd: crate::config::GETWINDOW,
            seq: 3,
            payload: vec![0; 8],
        };
        assert_eq!(
            Content::from_sender_frame(&probe).unwrap(),
            Content::WindowProbe
        );
    }

    #[test]
    fn data_frame_round_trips_through_content() {
        let data = Content::Data(vec![9, 9, 9]);
        let raw = data.into_sender_frame(5, 1);
        assert_eq!(raw.wnd, 3);
        let back = Content::from_sender_frame(&raw).unwrap();
        assert_eq!(back, Content::Data(vec![9, 9, 9]));
    }

    #[test]
    fn ack_frame_round_trips() {
        let ack = Content::Ack { rwnd_frames: 99 };
        let raw = ack.into_ack_frame(5, 12);
        assert_eq!(raw.wnd, 99);
        assert_eq!(raw.seq, 12);
        assert_eq!(Content::from_ack_frame(&raw), Content::Ack { rwnd_frames: 99 });
    }
}
