//! MQTT 3.1.1 framing for [`Framed`](tokio_util::codec::Framed) transports.
//!
//! Packet parsing and serialization come from `mqttbytes`; this module only adapts
//! it to a tokio codec. The codec is symmetric: the server and the test clients
//! share it.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

pub use mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, Disconnect, Login, Packet, PingReq, PingResp, PubAck,
    PubComp, PubRec, PubRel, Publish, SubAck, Subscribe, SubscribeFilter, SubscribeReasonCode,
    UnsubAck, Unsubscribe,
};
pub use mqttbytes::QoS;

use crate::utils::GsError;

/// The control packet type, for logs and errors.
pub fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PubAck(_) => "PUBACK",
        Packet::PubRec(_) => "PUBREC",
        Packet::PubRel(_) => "PUBREL",
        Packet::PubComp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::SubAck(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::UnsubAck(_) => "UNSUBACK",
        Packet::PingReq => "PINGREQ",
        Packet::PingResp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}

/// A clean-session CONNECT carrying credentials.
pub fn connect_with_login(client_id: &str, username: &str, password: &str) -> Connect {
    let mut connect = Connect::new(client_id);
    connect.login = Some(Login {
        username: username.to_string(),
        password: password.to_string(),
    });
    connect
}

/// Frames MQTT packets on a byte stream.
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    fn too_large(&self, size: usize) -> GsError {
        GsError::InvalidArgument(format!(
            "MQTT packet of {} bytes exceeds {}",
            size, self.max_packet_size
        ))
    }
}

fn malformed(err: mqttbytes::Error) -> GsError {
    GsError::InvalidArgument(format!("malformed MQTT packet: {:?}", err))
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = GsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, GsError> {
        if src.is_empty() {
            return Ok(None);
        }
        // Frames above the limit fail with `PayloadSizeLimitExceeded`.
        match mqttbytes::v4::read(src, self.max_packet_size) {
            Ok(packet) => Ok(Some(packet)),
            Err(mqttbytes::Error::InsufficientBytes(required)) => {
                src.reserve(required);
                Ok(None)
            }
            Err(err) => Err(malformed(err)),
        }
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = GsError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), GsError> {
        let mut frame = BytesMut::new();
        match &packet {
            Packet::Connect(p) => p.write(&mut frame),
            Packet::ConnAck(p) => p.write(&mut frame),
            Packet::Publish(p) => p.write(&mut frame),
            Packet::PubAck(p) => p.write(&mut frame),
            Packet::PubRec(p) => p.write(&mut frame),
            Packet::PubRel(p) => p.write(&mut frame),
            Packet::PubComp(p) => p.write(&mut frame),
            Packet::Subscribe(p) => p.write(&mut frame),
            Packet::SubAck(p) => p.write(&mut frame),
            Packet::Unsubscribe(p) => p.write(&mut frame),
            Packet::UnsubAck(p) => p.write(&mut frame),
            Packet::PingReq => PingReq.write(&mut frame),
            Packet::PingResp => PingResp.write(&mut frame),
            Packet::Disconnect => Disconnect.write(&mut frame),
        }
        .map_err(malformed)?;
        if frame.len() > self.max_packet_size {
            return Err(self.too_large(frame.len()));
        }
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        MqttCodec::new(1024).encode(packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn decodes_connect_with_credentials() {
        let mut buf = encode(Packet::Connect(connect_with_login("client", "gateway-1", "secret")));
        match MqttCodec::new(1024).decode(&mut buf).unwrap() {
            Some(Packet::Connect(connect)) => {
                assert_eq!(connect.client_id, "client");
                let login = connect.login.unwrap();
                assert_eq!(login.username, "gateway-1");
                assert_eq!(login.password, "secret");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_complete_frames() {
        let payload = vec![7u8; 300];
        let mut publish = Publish::new("v3/gw/up", QoS::AtLeastOnce, payload.clone());
        publish.pkid = 9;
        let full = encode(Packet::Publish(publish));
        // 300 bytes of payload need a two byte remaining length.
        assert_eq!(full[1] & 0x80, 0x80);

        let mut codec = MqttCodec::new(1024);
        let mut partial = BytesMut::from(&full[..2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[2..100]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[100..]);
        match codec.decode(&mut partial).unwrap() {
            Some(Packet::Publish(publish)) => {
                assert_eq!(publish.topic, "v3/gw/up");
                assert_eq!(publish.pkid, 9);
                assert_eq!(publish.payload.as_ref(), payload.as_slice());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_oversized_and_unknown_packets() {
        let mut buf = encode(Packet::Publish(Publish::new("t", QoS::AtMostOnce, vec![0u8; 200])));
        assert!(MqttCodec::new(64).decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0xf0u8, 0x00][..]);
        assert!(MqttCodec::new(64).decode(&mut buf).is_err());

        let big = Packet::Publish(Publish::new("t", QoS::AtMostOnce, vec![0u8; 200]));
        assert!(MqttCodec::new(64).encode(big, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn keepalive_packets_have_no_body() {
        let mut buf = encode(Packet::PingReq);
        assert_eq!(buf.as_ref(), &[0xc0, 0x00]);
        assert!(matches!(
            MqttCodec::new(64).decode(&mut buf).unwrap(),
            Some(Packet::PingReq)
        ));
        assert_eq!(packet_name(&Packet::PingResp), "PINGRESP");
    }
}
