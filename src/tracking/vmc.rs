//! VMC protocol receiver
//!
//! VMC (Virtual Motion Capture) carries bone transforms and blend shape
//! values as OSC messages over UDP. Senders include VSeeFace, iFacialMocap,
//! Waidayo and the VMC app itself.

use async_trait::async_trait;
use rosc::{OscMessage, OscPacket, OscType};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::config::VmcConfig;
use crate::error::{ProtocolError, ReceiverError};
use crate::pose::{PoseModel, Quaternion};
use crate::receiver::{Backoff, MotionSource, StopSignal};

/// `/VMC/Ext/Bone/Pos <name> <px> <py> <pz> <qx> <qy> <qz> <qw>`
pub const BONE_POS: &str = "/VMC/Ext/Bone/Pos";
/// `/VMC/Ext/Blend/Val <name> <value>`
pub const BLEND_VAL: &str = "/VMC/Ext/Blend/Val";
/// Sent after a batch of blend values
pub const BLEND_APPLY: &str = "/VMC/Ext/Blend/Apply";

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 65536;

/// A VMC message reduced to what the pose model needs
#[derive(Debug, Clone, PartialEq)]
pub enum VmcMessage {
    Bone { name: String, rotation: Quaternion },
    BlendShape { name: String, weight: f64 },
    Apply,
    Ignored,
}

fn as_f64(arg: &OscType) -> Option<f64> {
    match arg {
        OscType::Float(f) => Some(*f as f64),
        OscType::Double(d) => Some(*d),
        OscType::Int(i) => Some(*i as f64),
        OscType::Long(l) => Some(*l as f64),
        _ => None,
    }
}

/// Classify an OSC message by address
pub fn parse_message(msg: &OscMessage) -> VmcMessage {
    match msg.addr.as_str() {
        BONE_POS => {
            let name = match msg.args.first() {
                Some(OscType::String(name)) => name,
                _ => return VmcMessage::Ignored,
            };
            if msg.args.len() < 8 {
                return VmcMessage::Ignored;
            }

            // Position (args 1..4) is not relayed
            let q: Vec<f64> = msg.args[4..8].iter().filter_map(as_f64).collect();
            if q.len() != 4 {
                return VmcMessage::Ignored;
            }

            VmcMessage::Bone {
                name: name.clone(),
                rotation: Quaternion::new(q[0], q[1], q[2], q[3]),
            }
        }

        BLEND_VAL => match (msg.args.first(), msg.args.get(1).and_then(as_f64)) {
            (Some(OscType::String(name)), Some(weight)) => VmcMessage::BlendShape {
                name: name.clone(),
                weight,
            },
            _ => VmcMessage::Ignored,
        },

        BLEND_APPLY => VmcMessage::Apply,

        // Root transform, tracking status, time, and anything unknown
        other => {
            tracing::trace!("Ignoring VMC message: {}", other);
            VmcMessage::Ignored
        }
    }
}

/// Apply a decoded packet to the pose model, flattening bundles
pub fn handle_packet(packet: &OscPacket, pose: &PoseModel) {
    match packet {
        OscPacket::Message(msg) => match parse_message(msg) {
            VmcMessage::Bone { name, rotation } => pose.write_bone(&name, rotation),
            VmcMessage::BlendShape { name, weight } => pose.write_blend_shape(&name, weight),
            VmcMessage::Apply | VmcMessage::Ignored => {}
        },
        OscPacket::Bundle(bundle) => {
            for packet in &bundle.content {
                handle_packet(packet, pose);
            }
        }
    }
}

/// Decode one datagram and apply it
pub fn handle_datagram(bytes: &[u8], pose: &PoseModel) -> Result<(), ProtocolError> {
    let (_, packet) =
        rosc::decoder::decode_udp(bytes).map_err(|e| ProtocolError::OscDecode(e.to_string()))?;
    handle_packet(&packet, pose);
    Ok(())
}

/// VMC motion source
#[derive(Debug, Clone)]
pub struct Vmc {
    listen_addr: String,
    retry_delay: Duration,
}

impl Vmc {
    pub fn new(config: &VmcConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    async fn bind(&self) -> Result<UdpSocket, ReceiverError> {
        let socket = UdpSocket::bind(&self.listen_addr)
            .await
            .map_err(|source| ReceiverError::Bind {
                addr: self.listen_addr.clone(),
                source,
            })?;
        tracing::info!("VMC receiver listening on {}", self.listen_addr);
        Ok(socket)
    }

    async fn receive(&self, socket: &UdpSocket, pose: &PoseModel) -> ReceiverError {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((0, _)) => {}
                Ok((size, peer)) => {
                    if let Err(e) = handle_datagram(&buf[..size], pose) {
                        tracing::debug!("Dropping datagram from {}: {}", peer, e);
                    }
                }
                Err(e) => return ReceiverError::Read(e),
            }
        }
    }
}

#[async_trait]
impl MotionSource for Vmc {
    fn name(&self) -> &str {
        "vmc"
    }

    async fn run(&self, pose: Arc<PoseModel>, mut stop: StopSignal) {
        let mut backoff = Backoff::fixed(self.retry_delay);

        loop {
            let socket = tokio::select! {
                result = self.bind() => result,
                _ = stop.stopped() => break,
            };

            match socket {
                Ok(socket) => {
                    backoff.reset();
                    tokio::select! {
                        e = self.receive(&socket, &pose) => {
                            tracing::warn!("VMC receive error: {}", e);
                        }
                        _ = stop.stopped() => break,
                    }
                }
                Err(e) => tracing::warn!("VMC receiver error: {}", e),
            }

            if !backoff.wait(&mut stop).await {
                break;
            }
        }

        tracing::info!("VMC receiver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::MotionReceiver;
    use rosc::{encoder, OscBundle, OscTime};

    fn msg(addr: &str, args: Vec<OscType>) -> OscMessage {
        OscMessage {
            addr: addr.to_string(),
            args,
        }
    }

    fn bone_msg(name: &str, q: [f32; 4]) -> OscMessage {
        msg(
            BONE_POS,
            vec![
                OscType::String(name.to_string()),
                OscType::Float(0.0),
                OscType::Float(1.5),
                OscType::Float(0.0),
                OscType::Float(q[0]),
                OscType::Float(q[1]),
                OscType::Float(q[2]),
                OscType::Float(q[3]),
            ],
        )
    }

    #[test]
    fn test_parse_bone() {
        let parsed = parse_message(&bone_msg("Head", [0.0, 0.0, 0.0, 1.0]));
        assert_eq!(
            parsed,
            VmcMessage::Bone {
                name: "Head".to_string(),
                rotation: Quaternion::IDENTITY
            }
        );
    }

    #[test]
    fn test_parse_blend_shape_numeric_types() {
        for value in [OscType::Float(0.5), OscType::Double(0.5), OscType::Int(1)] {
            let parsed = parse_message(&msg(
                BLEND_VAL,
                vec![OscType::String("JawOpen".to_string()), value.clone()],
            ));
            match parsed {
                VmcMessage::BlendShape { name, weight } => {
                    assert_eq!(name, "JawOpen");
                    assert_eq!(weight, as_f64(&value).unwrap());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_parse_malformed_and_unknown() {
        assert_eq!(parse_message(&msg(BLEND_APPLY, vec![])), VmcMessage::Apply);
        assert_eq!(
            parse_message(&msg(BLEND_VAL, vec![OscType::String("A".to_string())])),
            VmcMessage::Ignored
        );
        assert_eq!(
            parse_message(&msg(BONE_POS, vec![OscType::String("Head".to_string())])),
            VmcMessage::Ignored
        );
        assert_eq!(
            parse_message(&msg(BONE_POS, vec![OscType::Int(3); 8])),
            VmcMessage::Ignored
        );
        assert_eq!(
            parse_message(&msg("/VMC/Ext/OK", vec![OscType::Int(1)])),
            VmcMessage::Ignored
        );
        assert_eq!(
            parse_message(&msg("/VMC/Ext/Root/Pos", vec![])),
            VmcMessage::Ignored
        );
    }

    #[test]
    fn test_handle_bundle() {
        let pose = PoseModel::new();
        let packet = OscPacket::Bundle(OscBundle {
            timetag: OscTime {
                seconds: 0,
                fractional: 1,
            },
            content: vec![
                OscPacket::Message(bone_msg("LeftUpperArm", [0.0, 0.0, 2.0, 0.0])),
                OscPacket::Message(msg(
                    BLEND_VAL,
                    vec![OscType::String("Blink".to_string()), OscType::Float(1.4)],
                )),
                OscPacket::Message(msg(BLEND_APPLY, vec![])),
            ],
        });

        handle_packet(&packet, &pose);

        assert_eq!(pose.bone("LeftUpperArm"), Quaternion::new(0.0, 0.0, 1.0, 0.0));
        assert_eq!(pose.blend_shape("Blink"), Some(1.0));
    }

    #[test]
    fn test_handle_garbage_datagram() {
        let pose = PoseModel::new();
        assert!(handle_datagram(b"not osc", &pose).is_err());
        assert_eq!(pose.bone_count(), 0);
    }

    #[tokio::test]
    async fn test_receiver_over_udp() {
        // Reserve a free port, then hand it to the receiver
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = VmcConfig {
            listen_addr: format!("127.0.0.1:{}", port),
            retry_delay_ms: 10,
            ..VmcConfig::default()
        };
        let receiver = MotionReceiver::new(Vmc::new(&config));
        receiver.start();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = OscPacket::Message(msg(
            BLEND_VAL,
            vec![OscType::String("JawOpen".to_string()), OscType::Float(0.25)],
        ));
        let bytes = encoder::encode(&packet).unwrap();

        let pose = Arc::clone(receiver.pose());
        tokio::time::timeout(Duration::from_secs(5), async {
            while pose.blend_shape("JawOpen").is_none() {
                sender
                    .send_to(&bytes, ("127.0.0.1", port))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(pose.blend_shape("JawOpen"), Some(0.25));
        tokio::time::timeout(Duration::from_secs(5), receiver.stop())
            .await
            .unwrap();
    }
}
