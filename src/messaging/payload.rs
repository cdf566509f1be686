use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf::{put_optional_string, put_string, try_get_optional_string, try_get_string};


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// handshake probe, sent to the discovery conn id of the peer we want to reach
    Join,
    /// graceful close notice
    Bye,
    Signal(Signal),
    Ack(Ack),
}

const ID_JOIN: u8 = 1;
const ID_BYE: u8 = 2;
const ID_SIGNAL: u8 = 3;
const ID_ACK: u8 = 4;

const ID_SIGNAL_SDP: u8 = 1;
const ID_SIGNAL_ICE_CANDIDATE: u8 = 2;

impl Payload {
    pub fn id(&self) -> u8 {
        match self {
            Payload::Join => ID_JOIN,
            Payload::Bye => ID_BYE,
            Payload::Signal(_) => ID_SIGNAL,
            Payload::Ack(_) => ID_ACK,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.id());
        match self {
            Payload::Join | Payload::Bye => {}
            Payload::Signal(signal) => signal.ser(buf),
            Payload::Ack(ack) => ack.ser(buf),
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Payload> {
        match buf.try_get_u8()? {
            ID_JOIN => Ok(Payload::Join),
            ID_BYE => Ok(Payload::Bye),
            ID_SIGNAL => Ok(Payload::Signal(Signal::try_deser(buf)?)),
            ID_ACK => Ok(Payload::Ack(Ack::try_deser(buf)?)),
            id => Err(anyhow!("invalid payload discriminator {}", id)),
        }
    }
}

/// A negotiation envelope. `generation_counter` is the sender's ICE restart generation, signals
///  from older generations are stale.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Signal {
    pub generation_counter: u32,
    pub data: SignalData,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SignalData {
    Sdp(SessionDescription),
    IceCandidate(IceCandidate),
}

impl Signal {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.generation_counter);
        match &self.data {
            SignalData::Sdp(desc) => {
                buf.put_u8(ID_SIGNAL_SDP);
                buf.put_u8(desc.kind.into());
                put_string(buf, &desc.sdp);
            }
            SignalData::IceCandidate(candidate) => {
                buf.put_u8(ID_SIGNAL_ICE_CANDIDATE);
                candidate.ser(buf);
            }
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Signal> {
        let generation_counter = buf.try_get_u32()?;
        let data = match buf.try_get_u8()? {
            ID_SIGNAL_SDP => {
                let kind = SdpKind::try_from_primitive(buf.try_get_u8()?)?;
                let sdp = try_get_string(buf)?;
                SignalData::Sdp(SessionDescription { kind, sdp })
            }
            ID_SIGNAL_ICE_CANDIDATE => SignalData::IceCandidate(IceCandidate::try_deser(buf)?),
            id => return Err(anyhow!("invalid signal discriminator {}", id)),
        };
        Ok(Signal {
            generation_counter,
            data,
        })
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum SdpKind {
    Offer = 1,
    Answer = 2,
    Pranswer = 3,
    Rollback = 4,
}

/// The descriptor body is opaque to this crate
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: sdp.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.candidate);
        put_optional_string(buf, self.sdp_mid.as_deref());
        match self.sdp_m_line_index {
            None => buf.put_u8(0),
            Some(idx) => {
                buf.put_u8(1);
                buf.put_u32_varint(idx);
            }
        }
        put_optional_string(buf, self.username_fragment.as_deref());
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<IceCandidate> {
        let candidate = try_get_string(buf)?;
        let sdp_mid = try_get_optional_string(buf)?;
        let sdp_m_line_index = match buf.try_get_u8()? {
            0 => None,
            1 => Some(buf.try_get_u32_varint()?),
            n => return Err(anyhow!("invalid option discriminator: {}", n)),
        };
        let username_fragment = try_get_optional_string(buf)?;
        Ok(IceCandidate {
            candidate,
            sdp_mid,
            sdp_m_line_index,
            username_fragment,
        })
    }
}

/// Half-open range `[start, end)` of received reliable seqnums
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AckRange {
    pub start: u32,
    pub end: u32,
}

impl AckRange {
    pub fn single(seqnum: u32) -> AckRange {
        AckRange {
            start: seqnum,
            end: seqnum.wrapping_add(1),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ack {
    pub ranges: Vec<AckRange>,
}

impl Ack {
    pub fn single(seqnum: u32) -> Ack {
        Ack {
            ranges: vec![AckRange::single(seqnum)],
        }
    }

    pub fn contains(&self, seqnum: u32) -> bool {
        self.ranges.iter()
            .any(|r| r.start <= seqnum && seqnum < r.end)
    }

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.ranges.len());
        for range in &self.ranges {
            buf.put_u32(range.start);
            buf.put_u32(range.end);
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Ack> {
        let num_ranges = buf.try_get_usize_varint()?;
        // each range takes 8 bytes, so this bounds the allocation by the buffer size
        if num_ranges > buf.remaining() / 8 {
            return Err(anyhow!("ack with {} ranges exceeds remaining buffer", num_ranges));
        }

        let mut ranges = Vec::with_capacity(num_ranges);
        for _ in 0..num_ranges {
            let start = buf.try_get_u32()?;
            let end = buf.try_get_u32()?;
            ranges.push(AckRange { start, end });
        }
        Ok(Ack { ranges })
    }
}
