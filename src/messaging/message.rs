use bytes::{Buf, BufMut};

use crate::messaging::endpoint::EndpointIdentity;
use crate::messaging::payload::Payload;
use crate::util::buf::{put_bool, try_get_bool};


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    pub from: EndpointIdentity,
    pub to: EndpointIdentity,
    /// 0 for unreliable messages
    pub seqnum: u32,
    pub reliable: bool,
}

impl MessageHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.from.ser(buf);
        self.to.ser(buf);
        buf.put_u32(self.seqnum);
        put_bool(buf, self.reliable);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let from = EndpointIdentity::try_deser(buf)?;
        let to = EndpointIdentity::try_deser(buf)?;
        let seqnum = buf.try_get_u32()?;
        let reliable = try_get_bool(buf)?;
        Ok(MessageHeader {
            from,
            to,
            seqnum,
            reliable,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Payload,
}

impl Message {
    pub fn unreliable(from: EndpointIdentity, to: EndpointIdentity, payload: Payload) -> Message {
        Message {
            header: MessageHeader {
                from,
                to,
                seqnum: 0,
                reliable: false,
            },
            payload,
        }
    }

    pub fn reliable(from: EndpointIdentity, to: EndpointIdentity, seqnum: u32, payload: Payload) -> Message {
        Message {
            header: MessageHeader {
                from,
                to,
                seqnum,
                reliable: true,
            },
            payload,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.header.ser(buf);
        self.payload.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let header = MessageHeader::try_deser(buf)?;
        let payload = Payload::try_deser(buf)?;
        Ok(Message {
            header,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use crate::messaging::payload::{Ack, SdpKind, SessionDescription, Signal, SignalData};
    use super::*;

    #[test]
    fn test_ser_deser() {
        let msg = Message::reliable(
            EndpointIdentity::new("g", "a", 1234),
            EndpointIdentity::new("g", "b", 5678),
            7,
            Payload::Signal(Signal {
                generation_counter: 1,
                data: SignalData::Sdp(SessionDescription::new(SdpKind::Answer, "v=0")),
            }),
        );

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(Message::try_deser(&mut b).unwrap(), msg);
        assert!(b.is_empty());
    }

    #[test]
    fn test_deser_truncated() {
        let msg = Message::unreliable(
            EndpointIdentity::new("g", "a", 1234),
            EndpointIdentity::discovery("g", "b"),
            Payload::Ack(Ack::single(3)),
        );

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);

        for len in 0..buf.len() {
            let mut b: &[u8] = &buf[..len];
            assert!(Message::try_deser(&mut b).is_err(), "truncated to {} bytes", len);
        }
    }
}
