//! FaceMotion3D text protocol receiver
//!
//! FaceMotion3D streams face and head tracking over a TCP connection that the
//! phone opens to us after a short UDP handshake. The stream is plain text:
//! each frame ends with the `___FACEMOTION3D` sentinel, and a frame's payload
//! is a `|`-separated list of fields:
//!
//! - blend shapes: `name&value`, value in 0–100
//! - bones: `=name#x,y,z`, Euler angles in device units
//!
//! Only the latest complete frame in the buffer is applied; anything older is
//! dropped along with it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::config::FaceMotion3dConfig;
use crate::error::{ProtocolError, ReceiverError, RelayError};
use crate::pose::{PoseModel, Quaternion};
use crate::receiver::{Backoff, MotionSource, StopSignal};

/// Frame delimiter
pub const SENTINEL: &[u8] = b"___FACEMOTION3D";

/// Asks the device to stop whatever it is currently streaming
pub const STOP_COMMAND: &[u8] = b"StopStreaming_FACEMOTION3D";

/// Asks the device to stream to us over TCP
pub const START_COMMAND: &[u8] = b"FACEMOTION3D_OtherStreaming|protocol=tcp";

/// UDP port the FaceMotion3D app listens on for commands
pub const DEFAULT_DEVICE_PORT: u16 = 49993;

/// Bytes read from the connection per call
pub const READ_CHUNK: usize = 8192;

/// Blend shapes reserved by the app, not part of the ARKit set
const VENDOR_PREFIX: &str = "FM_";

/// The head reports in a different raw unit than the other bones
pub const HEAD_DIVISOR: f64 = 32.0;
pub const BONE_DIVISOR: f64 = 128.0;

const HEAD_BONE: &str = "Head";

/// Location of the latest complete frame inside a [`FrameBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSpan {
    /// Byte range of the payload
    pub payload: std::ops::Range<usize>,
    /// Bytes to drain once the frame is applied. The closing sentinel is kept
    /// because it opens the next frame.
    pub consumed: usize,
}

/// Accumulates stream bytes until a complete frame is available
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl FrameBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK.min(limit)),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append bytes, dropping the NUL padding the transport adds.
    ///
    /// Fails, and clears the buffer, when it grows past the limit without
    /// containing a complete frame.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.buf.extend(bytes.iter().copied().filter(|b| *b != 0));

        if self.buf.len() > self.limit && self.find_frame().is_none() {
            self.buf.clear();
            return Err(ProtocolError::BufferOverflow { limit: self.limit });
        }
        Ok(())
    }

    /// Locate the latest complete frame without consuming anything
    pub fn find_frame(&self) -> Option<FrameSpan> {
        let close = rfind(&self.buf[..], SENTINEL)?;
        let open = rfind(&self.buf[..close], SENTINEL)?;
        Some(FrameSpan {
            payload: open + SENTINEL.len()..close,
            consumed: close,
        })
    }

    /// Remove and return the latest complete frame's payload
    pub fn take_frame(&mut self) -> Option<String> {
        let span = self.find_frame()?;
        let payload = String::from_utf8_lossy(&self.buf[span.payload]).into_owned();
        self.buf.drain(..span.consumed);
        Some(payload)
    }
}

/// Start index of the last occurrence of `needle` in `haystack`
fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// One parsed payload field
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    BlendShape { name: String, weight: f64 },
    Bone { name: String, rotation: Quaternion },
    Skip,
}

/// Parse a single `|`-separated field
pub fn parse_field(field: &str) -> Field {
    let field = field.trim();
    if field.is_empty() {
        return Field::Skip;
    }

    if let Some((raw_name, raw_value)) = field.split_once('&') {
        parse_blend_shape(raw_name, raw_value)
    } else if let Some((raw_name, raw_values)) = field.split_once('#') {
        parse_bone(raw_name, raw_values)
    } else {
        Field::Skip
    }
}

fn parse_blend_shape(raw_name: &str, raw_value: &str) -> Field {
    if raw_name.contains(VENDOR_PREFIX) {
        return Field::Skip;
    }

    // Some app versions qualify the name as `name=index`
    let name = raw_name.split('=').next().unwrap_or_default().trim();
    if name.is_empty() {
        return Field::Skip;
    }

    // Anything after a second `&` is ignored
    let raw_value = raw_value.split('&').next().unwrap_or_default();
    let value = match raw_value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => {
            tracing::trace!("Skipping blend shape {} with value {:?}", name, raw_value);
            return Field::Skip;
        }
    };

    Field::BlendShape {
        name: to_pascal_case(name),
        weight: (value / 100.0).clamp(0.0, 1.0),
    }
}

fn parse_bone(raw_name: &str, raw_values: &str) -> Field {
    let name = raw_name.replace('=', "");
    let name = name.trim();
    if name.is_empty() {
        return Field::Skip;
    }

    let values: Vec<f64> = raw_values
        .split(',')
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .collect();

    if values.len() < 3 {
        tracing::trace!("Skipping bone {} with values {:?}", name, raw_values);
        return Field::Skip;
    }

    let name = to_pascal_case(name);
    let rotation = bone_rotation(&name, [values[0], values[1], values[2]]);
    Field::Bone { name, rotation }
}

/// Convert a raw Euler triple into a bone rotation
pub fn bone_rotation(bone: &str, euler: [f64; 3]) -> Quaternion {
    let divisor = if bone == HEAD_BONE {
        HEAD_DIVISOR
    } else {
        BONE_DIVISOR
    };
    Quaternion::from_euler(euler[0] / divisor, euler[1] / divisor, -euler[2] / divisor)
}

fn to_pascal_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Counts of what a frame contained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub blend_shapes: usize,
    pub bones: usize,
    pub skipped: usize,
}

/// Parse a frame payload and write every valid field into `pose`
pub fn apply_frame(payload: &str, pose: &PoseModel) -> FrameStats {
    let mut stats = FrameStats::default();

    for field in payload.split('|') {
        match parse_field(field) {
            Field::BlendShape { name, weight } => {
                pose.write_blend_shape(&name, weight);
                stats.blend_shapes += 1;
            }
            Field::Bone { name, rotation } => {
                pose.write_bone(&name, rotation);
                stats.bones += 1;
            }
            Field::Skip => stats.skipped += 1,
        }
    }

    stats
}

/// Network side of a FaceMotion3D session: the inbound listener and the
/// command channel to the device.
#[async_trait]
pub trait DeviceLink: Send + Sync + 'static {
    type Listener: Send + Sync;
    type Stream: AsyncRead + Unpin + Send;

    /// Open the inbound listener
    async fn listen(&self) -> Result<Self::Listener, ReceiverError>;

    /// Tell the device to restart its stream towards us
    async fn handshake(&self) -> Result<(), ReceiverError>;

    /// Wait for the device to connect
    async fn accept(&self, listener: &Self::Listener) -> Result<Self::Stream, ReceiverError>;
}

/// TCP listener plus UDP command datagrams
#[derive(Debug, Clone)]
pub struct TcpDeviceLink {
    listen_addr: String,
    device_addr: String,
    device_port: u16,
    handshake_delay: Duration,
}

impl TcpDeviceLink {
    pub fn new(config: &FaceMotion3dConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            device_addr: config.device_addr.clone(),
            device_port: config.device_port,
            handshake_delay: Duration::from_millis(config.handshake_delay_ms),
        }
    }

    fn device(&self) -> String {
        format!("{}:{}", self.device_addr, self.device_port)
    }
}

#[async_trait]
impl DeviceLink for TcpDeviceLink {
    type Listener = TcpListener;
    type Stream = TcpStream;

    async fn listen(&self) -> Result<TcpListener, ReceiverError> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ReceiverError::Bind {
                addr: self.listen_addr.clone(),
                source,
            })?;
        tracing::info!("FaceMotion3D receiver listening on {}", self.listen_addr);
        Ok(listener)
    }

    async fn handshake(&self) -> Result<(), ReceiverError> {
        let handshake_err = |source: std::io::Error| ReceiverError::Handshake {
            addr: self.device(),
            source,
        };

        tracing::info!(
            "Telling device at {} to stream FaceMotion3D data over TCP",
            self.device()
        );

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(handshake_err)?;
        socket
            .connect((self.device_addr.as_str(), self.device_port))
            .await
            .map_err(handshake_err)?;

        socket.send(STOP_COMMAND).await.map_err(handshake_err)?;
        tokio::time::sleep(self.handshake_delay).await;
        socket.send(START_COMMAND).await.map_err(handshake_err)?;

        Ok(())
    }

    async fn accept(&self, listener: &TcpListener) -> Result<TcpStream, ReceiverError> {
        tracing::info!("Waiting for FaceMotion3D client");
        let (stream, peer) = listener.accept().await.map_err(ReceiverError::Accept)?;
        tracing::info!("Accepted FaceMotion3D client {}", peer);
        Ok(stream)
    }
}

/// Session tuning independent of the transport
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub retry_delay: Duration,
    pub max_buffer_bytes: usize,
}

impl From<&FaceMotion3dConfig> for SessionSettings {
    fn from(config: &FaceMotion3dConfig) -> Self {
        Self {
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_buffer_bytes: config.max_buffer_bytes,
        }
    }
}

/// Where the session loop currently is
enum Phase<S> {
    Listen,
    Handshake,
    Accept,
    Stream(S),
    Backoff,
}

impl<S> Phase<S> {
    fn label(&self) -> &'static str {
        match self {
            Phase::Listen => "listen",
            Phase::Handshake => "handshake",
            Phase::Accept => "accept",
            Phase::Stream(_) => "stream",
            Phase::Backoff => "backoff",
        }
    }
}

/// FaceMotion3D motion source
pub struct FaceMotion3d<L = TcpDeviceLink> {
    link: L,
    settings: SessionSettings,
}

impl FaceMotion3d<TcpDeviceLink> {
    pub fn new(config: &FaceMotion3dConfig) -> Self {
        Self::with_link(TcpDeviceLink::new(config), SessionSettings::from(config))
    }
}

impl<L: DeviceLink> FaceMotion3d<L> {
    pub fn with_link(link: L, settings: SessionSettings) -> Self {
        Self { link, settings }
    }

    /// Read frames until the connection fails
    async fn stream_frames(&self, mut stream: L::Stream, pose: &PoseModel) -> RelayError {
        let mut buffer = FrameBuffer::new(self.settings.max_buffer_bytes);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) => return ReceiverError::Disconnected.into(),
                Ok(n) => n,
                Err(e) => return ReceiverError::Read(e).into(),
            };

            if let Err(e) = buffer.push(&chunk[..n]) {
                return e.into();
            }

            if let Some(payload) = buffer.take_frame() {
                let stats = apply_frame(&payload, pose);
                tracing::trace!(
                    "FaceMotion3D frame: {} blend shapes, {} bones, {} skipped",
                    stats.blend_shapes,
                    stats.bones,
                    stats.skipped
                );
            }
        }
    }
}

#[async_trait]
impl<L: DeviceLink> MotionSource for FaceMotion3d<L> {
    fn name(&self) -> &str {
        "facemotion3d"
    }

    async fn run(&self, pose: Arc<PoseModel>, mut stop: StopSignal) {
        let mut backoff = Backoff::fixed(self.settings.retry_delay);
        let mut listener: Option<L::Listener> = None;
        let mut phase: Phase<L::Stream> = Phase::Listen;

        loop {
            if stop.is_stopped() {
                break;
            }
            tracing::trace!("FaceMotion3D session phase: {}", phase.label());

            phase = match phase {
                Phase::Listen => tokio::select! {
                    result = self.link.listen() => match result {
                        Ok(l) => {
                            listener = Some(l);
                            Phase::Handshake
                        }
                        Err(e) => {
                            tracing::warn!("FaceMotion3D listener error: {}", e);
                            Phase::Backoff
                        }
                    },
                    _ = stop.stopped() => break,
                },
                Phase::Handshake => tokio::select! {
                    result = self.link.handshake() => match result {
                        Ok(()) => Phase::Accept,
                        Err(e) => {
                            tracing::warn!("FaceMotion3D source error: {}", e);
                            Phase::Backoff
                        }
                    },
                    _ = stop.stopped() => break,
                },
                Phase::Accept => match listener.as_ref() {
                    Some(l) => tokio::select! {
                        result = self.link.accept(l) => match result {
                            Ok(stream) => {
                                backoff.reset();
                                Phase::Stream(stream)
                            }
                            Err(e) => {
                                tracing::warn!("FaceMotion3D accept error: {}", e);
                                Phase::Backoff
                            }
                        },
                        _ = stop.stopped() => break,
                    },
                    None => Phase::Listen,
                },
                Phase::Stream(stream) => tokio::select! {
                    reason = self.stream_frames(stream, &pose) => {
                        tracing::warn!("FaceMotion3D source disconnected: {}", reason);
                        Phase::Backoff
                    },
                    _ = stop.stopped() => break,
                },
                Phase::Backoff => {
                    if !backoff.wait(&mut stop).await {
                        break;
                    }
                    if listener.is_some() {
                        Phase::Handshake
                    } else {
                        Phase::Listen
                    }
                }
            };
        }

        tracing::info!("FaceMotion3D session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::MotionReceiver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::{mpsc, Mutex};

    fn frame(payload: &str) -> Vec<u8> {
        let mut bytes = payload.as_bytes().to_vec();
        bytes.extend_from_slice(SENTINEL);
        bytes
    }

    #[test]
    fn test_end_to_end_frame() {
        let pose = PoseModel::new();
        let stats = apply_frame("x=0&20|Head=#0,0,0,|", &pose);

        assert_eq!(pose.blend_shape("X"), Some(0.2));
        assert_eq!(pose.bone("Head"), Quaternion::IDENTITY);
        assert_eq!(
            stats,
            FrameStats {
                blend_shapes: 1,
                bones: 1,
                skipped: 1
            }
        );
    }

    #[test]
    fn test_blend_shape_scaling() {
        for raw in [0.0, 1.0, 12.5, 50.0, 99.0, 100.0] {
            match parse_field(&format!("jawOpen&{}", raw)) {
                Field::BlendShape { name, weight } => {
                    assert_eq!(name, "JawOpen");
                    assert!((weight - raw / 100.0).abs() < 1e-12);
                }
                other => panic!("unexpected field {:?}", other),
            }
        }
    }

    #[test]
    fn test_blend_shape_clamped() {
        assert_eq!(
            parse_field("jawOpen&150"),
            Field::BlendShape {
                name: "JawOpen".to_string(),
                weight: 1.0
            }
        );
        assert_eq!(
            parse_field("jawOpen&-5"),
            Field::BlendShape {
                name: "JawOpen".to_string(),
                weight: 0.0
            }
        );
    }

    #[test]
    fn test_blend_shape_extra_separator() {
        assert_eq!(
            parse_field("mouthSmile_L&30&70"),
            Field::BlendShape {
                name: "MouthSmile_L".to_string(),
                weight: 0.3
            }
        );
    }

    #[test]
    fn test_skipped_fields() {
        assert_eq!(parse_field(""), Field::Skip);
        assert_eq!(parse_field("FM_browInnerUp_L&30"), Field::Skip);
        assert_eq!(parse_field("jawOpen&abc"), Field::Skip);
        assert_eq!(parse_field("&40"), Field::Skip);
        assert_eq!(parse_field("=head#1,2"), Field::Skip);
        assert_eq!(parse_field("=#1,2,3"), Field::Skip);
        assert_eq!(parse_field("noSeparator"), Field::Skip);
    }

    #[test]
    fn test_malformed_field_does_not_spoil_frame() {
        let pose = PoseModel::new();
        let stats = apply_frame("jawOpen&abc|mouthClose&40|=head#1,x,2,3", &pose);

        assert_eq!(pose.blend_shape("JawOpen"), None);
        assert_eq!(pose.blend_shape("MouthClose"), Some(0.4));
        assert_ne!(pose.bone("Head"), Quaternion::IDENTITY);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_bone_name_normalized() {
        match parse_field("=head#10,20,30") {
            Field::Bone { name, rotation } => {
                assert_eq!(name, "Head");
                assert_eq!(rotation, bone_rotation("Head", [10.0, 20.0, 30.0]));
            }
            other => panic!("unexpected field {:?}", other),
        }
    }

    #[test]
    fn test_bone_rotation_unit_norm() {
        let inputs = [
            [0.0, 0.0, 0.0],
            [45.0, -30.0, 12.0],
            [-720.0, 360.0, 1080.0],
            [1e4, -1e4, 3.3],
        ];
        for euler in inputs {
            for bone in ["Head", "LeftEye", "Neck"] {
                let q = bone_rotation(bone, euler);
                assert!((q.norm() - 1.0).abs() < 1e-9, "{} {:?}", bone, euler);
            }
        }
    }

    #[test]
    fn test_head_divisor_ratio() {
        let raw = 20.0;
        let head = bone_rotation("Head", [raw, 0.0, 0.0]);
        let eye = bone_rotation("RightEye", [raw, 0.0, 0.0]);

        assert!((head.angle() - raw / HEAD_DIVISOR).abs() < 1e-9);
        assert!((eye.angle() - raw / BONE_DIVISOR).abs() < 1e-9);
        assert!((head.angle() / eye.angle() - BONE_DIVISOR / HEAD_DIVISOR).abs() < 1e-9);
    }

    #[test]
    fn test_third_axis_negated() {
        let q = bone_rotation("Neck", [0.0, 0.0, 64.0]);
        assert!(q.z < 0.0);
        assert!((q.angle() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_buffer_needs_two_sentinels() {
        let mut buffer = FrameBuffer::new(1024);
        buffer.push(&frame("jawOpen&10")).unwrap();
        assert!(buffer.find_frame().is_none());
        assert!(buffer.take_frame().is_none());

        buffer.push(&frame("jawOpen&20")).unwrap();
        assert_eq!(buffer.take_frame().as_deref(), Some("jawOpen&20"));
    }

    #[test]
    fn test_buffer_partial_frame_waits() {
        let mut buffer = FrameBuffer::new(1024);
        buffer.push(&frame("a&1")).unwrap();
        buffer.push(b"b&2|c&").unwrap();
        assert!(buffer.find_frame().is_none());

        buffer.push(b"3___FACE").unwrap();
        assert!(buffer.find_frame().is_none());

        buffer.push(b"MOTION3D").unwrap();
        assert_eq!(buffer.take_frame().as_deref(), Some("b&2|c&3"));
    }

    #[test]
    fn test_buffer_takes_latest_frame() {
        let mut buffer = FrameBuffer::new(1024);
        let mut bytes = frame("old");
        bytes.extend(frame("older"));
        bytes.extend(frame("newest"));
        buffer.push(&bytes).unwrap();

        assert_eq!(buffer.take_frame().as_deref(), Some("newest"));
        assert!(buffer.take_frame().is_none());
    }

    #[test]
    fn test_find_frame_is_idempotent() {
        let mut buffer = FrameBuffer::new(1024);
        let mut bytes = frame("head");
        bytes.extend(frame("jawOpen&30"));
        buffer.push(&bytes).unwrap();

        let first = buffer.find_frame();
        let second = buffer.find_frame();
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn test_consumed_prefix_not_reparsed() {
        let mut buffer = FrameBuffer::new(1024);
        let mut bytes = frame("junk");
        bytes.extend(frame("jawOpen&30"));
        buffer.push(&bytes).unwrap();

        assert_eq!(buffer.take_frame().as_deref(), Some("jawOpen&30"));
        // Only the closing sentinel remains to open the next frame
        assert_eq!(buffer.len(), SENTINEL.len());

        buffer.push(&frame("jawOpen&60")).unwrap();
        assert_eq!(buffer.take_frame().as_deref(), Some("jawOpen&60"));
    }

    #[test]
    fn test_buffer_strips_nul_bytes() {
        let mut buffer = FrameBuffer::new(1024);
        let mut bytes = frame("x");
        bytes.extend_from_slice(b"jaw\0Open&\050");
        bytes.extend_from_slice(SENTINEL);
        bytes.extend_from_slice(&[0u8; 64]);
        buffer.push(&bytes).unwrap();

        assert_eq!(buffer.take_frame().as_deref(), Some("jawOpen&50"));
    }

    #[test]
    fn test_buffer_overflow() {
        let mut buffer = FrameBuffer::new(32);
        let err = buffer.push(&[b'a'; 64]).unwrap_err();
        assert_eq!(err, ProtocolError::BufferOverflow { limit: 32 });
        assert!(buffer.is_empty());
    }

    /// In-memory device link fed with duplex streams
    struct FakeLink {
        handshakes: Arc<AtomicUsize>,
        failing_handshakes: AtomicUsize,
        streams: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    }

    impl FakeLink {
        fn new(failing_handshakes: usize) -> (Self, mpsc::UnboundedSender<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let link = Self {
                handshakes: Arc::new(AtomicUsize::new(0)),
                failing_handshakes: AtomicUsize::new(failing_handshakes),
                streams: Mutex::new(rx),
            };
            (link, tx)
        }
    }

    #[async_trait]
    impl DeviceLink for FakeLink {
        type Listener = ();
        type Stream = DuplexStream;

        async fn listen(&self) -> Result<(), ReceiverError> {
            Ok(())
        }

        async fn handshake(&self) -> Result<(), ReceiverError> {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failing_handshakes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_handshakes.store(remaining - 1, Ordering::SeqCst);
                return Err(ReceiverError::Handshake {
                    addr: "fake".to_string(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            }
            Ok(())
        }

        async fn accept(&self, _listener: &()) -> Result<DuplexStream, ReceiverError> {
            self.streams
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| ReceiverError::Accept(std::io::ErrorKind::NotConnected.into()))
        }
    }

    fn settings(max_buffer_bytes: usize) -> SessionSettings {
        SessionSettings {
            retry_delay: Duration::from_millis(10),
            max_buffer_bytes,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_session_applies_frames_and_reconnects() {
        let (link, streams) = FakeLink::new(0);
        let handshakes = Arc::clone(&link.handshakes);
        let receiver = MotionReceiver::new(FaceMotion3d::with_link(link, settings(4096)));
        receiver.start();

        let (mut device, server) = tokio::io::duplex(4096);
        streams.send(server).unwrap();

        let mut bytes = frame("jawOpen&50");
        bytes.extend(frame("jawOpen&40|=head#0,0,64"));
        device.write_all(&bytes).await.unwrap();

        let pose = Arc::clone(receiver.pose());
        wait_until(|| pose.blend_shape("JawOpen") == Some(0.4)).await;
        assert!((pose.bone("Head").angle() - 2.0).abs() < 1e-9);

        // Disconnect: the session backs off and handshakes again
        drop(device);
        wait_until(|| handshakes.load(Ordering::SeqCst) >= 2).await;

        // Last known pose is kept across the disconnect
        assert_eq!(pose.blend_shape("JawOpen"), Some(0.4));

        tokio::time::timeout(Duration::from_secs(5), receiver.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_session_retries_failed_handshake() {
        let (link, streams) = FakeLink::new(2);
        let handshakes = Arc::clone(&link.handshakes);
        let receiver = MotionReceiver::new(FaceMotion3d::with_link(link, settings(4096)));
        receiver.start();

        wait_until(|| handshakes.load(Ordering::SeqCst) >= 3).await;

        let (mut device, server) = tokio::io::duplex(4096);
        streams.send(server).unwrap();
        let mut bytes = frame("");
        bytes.extend(frame("eyeBlinkLeft&100"));
        device.write_all(&bytes).await.unwrap();

        let pose = Arc::clone(receiver.pose());
        wait_until(|| pose.blend_shape("EyeBlinkLeft") == Some(1.0)).await;

        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_session_drops_connection_on_overflow() {
        let (link, streams) = FakeLink::new(0);
        let handshakes = Arc::clone(&link.handshakes);
        let receiver = MotionReceiver::new(FaceMotion3d::with_link(link, settings(64)));
        receiver.start();

        let (mut device, server) = tokio::io::duplex(4096);
        streams.send(server).unwrap();
        device.write_all(&[b'z'; 200]).await.unwrap();

        wait_until(|| handshakes.load(Ordering::SeqCst) >= 2).await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_stop_while_backing_off() {
        let (link, _streams) = FakeLink::new(usize::MAX);
        let handshakes = Arc::clone(&link.handshakes);
        let source = FaceMotion3d::with_link(
            link,
            SessionSettings {
                retry_delay: Duration::from_secs(3600),
                max_buffer_bytes: 1024,
            },
        );
        let receiver = MotionReceiver::new(source);
        receiver.start();

        wait_until(|| handshakes.load(Ordering::SeqCst) >= 1).await;
        tokio::time::timeout(Duration::from_secs(5), receiver.stop())
            .await
            .expect("stop should interrupt the backoff sleep");
        assert_eq!(handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tcp_link_handshake_sends_commands() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();

        let config = FaceMotion3dConfig {
            device_addr: "127.0.0.1".to_string(),
            device_port: port,
            handshake_delay_ms: 10,
            ..FaceMotion3dConfig::default()
        };
        let link = TcpDeviceLink::new(&config);
        link.handshake().await.unwrap();

        let mut buf = [0u8; 128];
        let n = device.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], STOP_COMMAND);
        let n = device.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], START_COMMAND);
    }
}
