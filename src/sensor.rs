//! Sensor session: owns the three directional sockets for one remote
//! sensor, a control-state cache, and a notification callback chain.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::format::WireFormatVersion;
use crate::formatter::{
    AnnotateFormatter, AnnotateValue, EventFormatter, EventValue, GazeFormatter, GazeValue,
    ImuFormatter, ImuValue, VideoFormatter, VideoValue,
};
use crate::frame::FrameFactory;
use crate::wire::{DataMessage, Notification};

/// Receive high-water mark suggested for data sockets: small, so a slow
/// consumer drops old frames rather than building unbounded backlog.
const DATA_SOCKET_RCVHWM: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorType {
    Hardware,
    Video,
    Annotate,
    Gaze,
    Imu,
    Event,
    Led,
}

impl SensorType {
    /// Parses the wire string for a sensor type. Unknown values cause the
    /// caller (the descriptor parser, or the node's attach handler) to
    /// drop the sensor rather than guess a type.
    pub fn from_wire_str(s: &str) -> Option<SensorType> {
        match s {
            "hardware" => Some(SensorType::Hardware),
            "video" => Some(SensorType::Video),
            "annotate" => Some(SensorType::Annotate),
            "gaze" => Some(SensorType::Gaze),
            "imu" => Some(SensorType::Imu),
            "event" => Some(SensorType::Event),
            "led" => Some(SensorType::Led),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SensorDescriptor {
    pub sensor_uuid: String,
    pub sensor_name: String,
    pub sensor_type: SensorType,
    pub notify_endpoint: String,
    pub command_endpoint: String,
    pub data_endpoint: Option<String>,
    pub host_uuid: String,
    pub host_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDType {
    Bool,
    String,
    Integer,
    Float,
    IntMapping,
    StrMapping,
    Selector,
    Bitmap,
    Unknown,
}

impl ControlDType {
    pub fn from_wire_str(s: &str) -> ControlDType {
        match s {
            "bool" => ControlDType::Bool,
            "string" => ControlDType::String,
            "integer" => ControlDType::Integer,
            "float" => ControlDType::Float,
            "intmapping" => ControlDType::IntMapping,
            "strmapping" => ControlDType::StrMapping,
            "selector" => ControlDType::Selector,
            "bitmap" => ControlDType::Bitmap,
            _ => ControlDType::Unknown,
        }
    }

    /// Coerces a value to this dtype's natural JSON shape before it is
    /// sent in a `set_control_value` command. Unknown dtypes pass through
    /// unchanged.
    pub fn coerce(self, value: Value) -> Value {
        match self {
            ControlDType::Bool => Value::Bool(coerce_bool(&value)),
            ControlDType::String | ControlDType::StrMapping => Value::String(coerce_string(&value)),
            ControlDType::Integer | ControlDType::IntMapping => {
                coerce_int(&value).map(Value::from).unwrap_or(value)
            }
            ControlDType::Float => coerce_float(&value).map(Value::from).unwrap_or(value),
            ControlDType::Selector | ControlDType::Bitmap | ControlDType::Unknown => value,
        }
    }
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        _ => false,
    }
}

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ControlMapEntry {
    pub value: Value,
    pub caption: String,
}

/// One remotely adjustable parameter of a sensor.
///
/// Read-only to consumers by construction: there is no `&mut` accessor
/// anywhere on [`SensorCore`] for this cache; the only way to get
/// a new value into it is through the built-in notification callback
/// reacting to the publisher's own `update`/`remove` messages.
#[derive(Debug, Clone)]
pub struct Control {
    pub control_id: String,
    pub value: Value,
    pub dtype: ControlDType,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub res: Option<Value>,
    pub def: Option<Value>,
    pub caption: Option<String>,
    pub readonly: Option<bool>,
    pub map: Option<Vec<ControlMapEntry>>,
    /// Forward-compatible fields the typed view above doesn't name.
    pub raw: serde_json::Map<String, Value>,
}

impl Control {
    fn merge(existing: Option<&Control>, control_id: &str, changes: &serde_json::Map<String, Value>) -> Control {
        let mut raw = existing.map(|c| c.raw.clone()).unwrap_or_default();
        for (k, v) in changes {
            raw.insert(k.clone(), v.clone());
        }
        let get = |key: &str| raw.get(key).cloned();
        let dtype = raw
            .get("dtype")
            .and_then(Value::as_str)
            .map(ControlDType::from_wire_str)
            .unwrap_or_else(|| existing.map(|c| c.dtype).unwrap_or(ControlDType::Unknown));
        let map = raw.get("map").and_then(Value::as_array).map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    Some(ControlMapEntry {
                        value: e.get("value")?.clone(),
                        caption: e.get("caption")?.as_str()?.to_string(),
                    })
                })
                .collect()
        });
        Control {
            control_id: control_id.to_string(),
            value: get("value").unwrap_or(Value::Null),
            dtype,
            min: get("min"),
            max: get("max"),
            res: get("res"),
            def: get("def"),
            caption: get("caption").and_then(|v| v.as_str().map(str::to_string)),
            readonly: get("readonly").and_then(|v| v.as_bool()),
            map,
            raw,
        }
    }
}

pub type NotificationCallback = Box<dyn FnMut(&SensorCore, &Notification) -> Result<()>>;

/// Fields and operations shared by every sensor kind.
pub struct SensorCore {
    pub descriptor: SensorDescriptor,
    notify_sub: zmq::Socket,
    command_push: zmq::Socket,
    data_sub: Option<zmq::Socket>,
    data_subscribe_prefix: Vec<u8>,
    controls: HashMap<String, Control>,
    callbacks: Vec<NotificationCallback>,
}

impl std::fmt::Display for SensorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Sensor {}@{} [{:?}]>",
            self.descriptor.sensor_name, self.descriptor.host_name, self.descriptor.sensor_type
        )
    }
}

impl SensorCore {
    /// Binds sockets for `descriptor`. `data_subscribe_prefix` is the
    /// sensor uuid for every kind except annotate, which subscribes to
    /// the empty prefix (a protocol compatibility quirk: it receives
    /// every sensor's data on that endpoint and filters at the
    /// application layer instead).
    fn new(
        ctx: &zmq::Context,
        descriptor: SensorDescriptor,
        data_subscribe_prefix: Vec<u8>,
    ) -> Result<SensorCore> {
        let notify_sub = ctx.socket(zmq::SUB)?;
        notify_sub.set_linger(0)?;
        notify_sub.connect(&descriptor.notify_endpoint)?;
        notify_sub.set_subscribe(descriptor.sensor_uuid.as_bytes())?;

        let command_push = ctx.socket(zmq::PUSH)?;
        command_push.set_linger(0)?;
        command_push.connect(&descriptor.command_endpoint)?;

        let data_sub = match &descriptor.data_endpoint {
            Some(endpoint) => {
                let sock = ctx.socket(zmq::SUB)?;
                sock.set_linger(0)?;
                sock.set_rcvhwm(DATA_SOCKET_RCVHWM)?;
                sock.connect(endpoint)?;
                sock.set_subscribe(&data_subscribe_prefix)?;
                Some(sock)
            }
            None => None,
        };

        let mut core = SensorCore {
            descriptor,
            notify_sub,
            command_push,
            data_sub,
            data_subscribe_prefix,
            controls: HashMap::new(),
            callbacks: Vec::new(),
        };
        core.refresh_controls()?;
        Ok(core)
    }

    pub fn register_callback(&mut self, callback: NotificationCallback) {
        self.callbacks.push(callback);
    }

    pub fn controls(&self) -> &HashMap<String, Control> {
        &self.controls
    }

    pub fn control(&self, control_id: &str) -> Option<&Control> {
        self.controls.get(control_id)
    }

    pub fn has_notifications(&self) -> bool {
        has_pending(&self.notify_sub)
    }

    pub fn has_data(&self) -> Result<bool> {
        match &self.data_sub {
            Some(sock) => Ok(has_pending(sock)),
            None => Err(Error::NotDataSubSupported),
        }
    }

    /// Reads one notification, applies the built-in cache reconciliation,
    /// then runs every registered callback in order. Must only be called
    /// after `has_notifications()` is true.
    pub fn handle_notification(&mut self) -> Result<()> {
        let frames = self.notify_sub.recv_multipart(0)?;
        if frames.len() != 2 {
            debug!("dropping notification with {} frames (expected 2)", frames.len());
            return Ok(());
        }
        if frames[0].as_slice() != self.descriptor.sensor_uuid.as_bytes() {
            debug!("dropping notification addressed to a different sensor");
            return Ok(());
        }
        let notification = match Notification::parse(&frames[1]) {
            Some(n) => n,
            None => {
                debug!("dropping malformed or subject-less notification");
                return Ok(());
            }
        };

        match &notification {
            Notification::Update { control_id, changes, .. } => {
                let merged = Control::merge(self.controls.get(control_id), control_id, changes);
                self.controls.insert(control_id.clone(), merged);
            }
            Notification::Remove { control_id, .. } => {
                self.controls.remove(control_id);
            }
            // "error" and any unrecognized subject: left for user callbacks.
            Notification::Error { .. } | Notification::Other { .. } => {}
        }

        let mut callbacks = std::mem::take(&mut self.callbacks);
        for callback in &mut callbacks {
            if let Err(e) = callback(self, &notification) {
                debug!("notification callback failed: {e}");
            }
        }
        self.callbacks = callbacks;
        Ok(())
    }

    fn push_command(&mut self, command: &crate::wire::Command) -> Result<()> {
        let payload = serde_json::to_vec(command).expect("Command always serializes");
        self.command_push
            .send_multipart([self.descriptor.sensor_uuid.as_bytes(), &payload], 0)?;
        Ok(())
    }

    pub fn refresh_controls(&mut self) -> Result<()> {
        self.push_command(&crate::wire::Command::RefreshControls)
    }

    pub fn set_control_value(&mut self, control_id: &str, value: Value) -> Result<()> {
        let value = match self.controls.get(control_id) {
            Some(c) => c.dtype.coerce(value),
            None => value,
        };
        self.push_command(&crate::wire::Command::SetControlValue {
            control_id: control_id.to_string(),
            value,
        })
    }

    pub fn reset_control_value(&mut self, control_id: &str) -> Result<()> {
        match self.controls.get(control_id).and_then(|c| c.def.clone()) {
            Some(def) => self.set_control_value(control_id, def),
            None => {
                tracing::error!("cannot reset control {control_id}: unknown or no default");
                Ok(())
            }
        }
    }

    pub fn reset_all_control_values(&mut self) -> Result<()> {
        let ids: Vec<String> = self.controls.keys().cloned().collect();
        for id in ids {
            self.reset_control_value(&id)?;
        }
        Ok(())
    }

    /// Receives one data-plane message. The subscribe prefix already does
    /// the filtering (the sensor's own uuid for every kind except
    /// annotate, which subscribes to the empty prefix deliberately to
    /// receive every sensor's data on that endpoint) — there is no
    /// additional application-level uuid check here, matching the
    /// reference, which hands back whatever three frames it read without
    /// re-validating frame 0 against its own uuid.
    fn recv_data_message(&mut self) -> Result<Option<DataMessage>> {
        let sock = self.data_sub.as_ref().ok_or(Error::NotDataSubSupported)?;
        let frames = sock.recv_multipart(0)?;
        if frames.len() != 3 {
            debug!("dropping data message with {} frames (expected 3)", frames.len());
            return Ok(None);
        }
        Ok(Some(DataMessage {
            sensor_uuid: String::from_utf8_lossy(&frames[0]).into_owned(),
            header: bytes::Bytes::from(frames[1].clone()),
            body: bytes::Bytes::from(frames[2].clone()),
        }))
    }

    fn unlink(self) {
        let uuid_prefix = self.descriptor.sensor_uuid.as_bytes();
        let _ = self.notify_sub.set_unsubscribe(uuid_prefix);
        if let Some(sock) = &self.data_sub {
            let _ = sock.set_unsubscribe(&self.data_subscribe_prefix);
        }
        // Sockets are already `linger=0`; dropping `self` here closes them.
    }
}

fn has_pending(socket: &zmq::Socket) -> bool {
    let mut items = [socket.as_poll_item(zmq::POLLIN)];
    matches!(zmq::poll(&mut items, 0), Ok(n) if n > 0)
}

pub struct VideoSensor {
    core: SensorCore,
    formatter: VideoFormatter,
}

pub struct AnnotateSensor {
    core: SensorCore,
    formatter: AnnotateFormatter,
}

pub struct GazeSensor {
    core: SensorCore,
    formatter: GazeFormatter,
}

pub struct ImuSensor {
    core: SensorCore,
    formatter: ImuFormatter,
}

pub struct EventSensor {
    core: SensorCore,
    formatter: EventFormatter,
}

/// Closed sensor-kind dispatch: every live session is exactly one of
/// these. `Hardware`/`Led` have no formatter and no data socket use.
pub enum Sensor {
    Hardware(SensorCore),
    Video(VideoSensor),
    Annotate(AnnotateSensor),
    Gaze(GazeSensor),
    Imu(ImuSensor),
    Event(EventSensor),
    Led(SensorCore),
}

/// Values `fetch_data` can yield, tagged by sensor kind.
pub enum FetchedValues {
    Video(Vec<VideoValue>),
    Annotate(Vec<AnnotateValue>),
    Gaze(Vec<GazeValue>),
    Imu(Vec<ImuValue>),
    Event(Vec<EventValue>),
}

impl Sensor {
    /// Constructs the session of the kind matching `descriptor.sensor_type`,
    /// binding its sockets and sending the initial `refresh_controls`.
    pub fn attach(
        ctx: &zmq::Context,
        descriptor: SensorDescriptor,
        format: WireFormatVersion,
        frame_factory: Box<dyn FrameFactory>,
    ) -> Result<Sensor> {
        let kind = descriptor.sensor_type;
        let prefix = if kind == SensorType::Annotate {
            Vec::new()
        } else {
            descriptor.sensor_uuid.as_bytes().to_vec()
        };
        let core = SensorCore::new(ctx, descriptor, prefix)?;
        Ok(match kind {
            SensorType::Hardware => Sensor::Hardware(core),
            SensorType::Led => Sensor::Led(core),
            SensorType::Video => Sensor::Video(VideoSensor {
                core,
                formatter: VideoFormatter::new(format, frame_factory),
            }),
            SensorType::Annotate => Sensor::Annotate(AnnotateSensor {
                core,
                formatter: AnnotateFormatter::for_version(format),
            }),
            SensorType::Gaze => Sensor::Gaze(GazeSensor {
                core,
                formatter: GazeFormatter::for_version(format),
            }),
            SensorType::Imu => Sensor::Imu(ImuSensor {
                core,
                formatter: ImuFormatter::for_version(format),
            }),
            SensorType::Event => Sensor::Event(EventSensor {
                core,
                formatter: EventFormatter::for_version(format),
            }),
        })
    }

    pub fn core(&self) -> &SensorCore {
        match self {
            Sensor::Hardware(c) | Sensor::Led(c) => c,
            Sensor::Video(s) => &s.core,
            Sensor::Annotate(s) => &s.core,
            Sensor::Gaze(s) => &s.core,
            Sensor::Imu(s) => &s.core,
            Sensor::Event(s) => &s.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut SensorCore {
        match self {
            Sensor::Hardware(c) | Sensor::Led(c) => c,
            Sensor::Video(s) => &mut s.core,
            Sensor::Annotate(s) => &mut s.core,
            Sensor::Gaze(s) => &mut s.core,
            Sensor::Imu(s) => &mut s.core,
            Sensor::Event(s) => &mut s.core,
        }
    }

    pub fn has_notifications(&self) -> bool {
        self.core().has_notifications()
    }

    pub fn has_data(&self) -> Result<bool> {
        self.core().has_data()
    }

    pub fn handle_notification(&mut self) -> Result<()> {
        self.core_mut().handle_notification()
    }

    pub fn register_callback(&mut self, callback: NotificationCallback) {
        self.core_mut().register_callback(callback);
    }

    pub fn refresh_controls(&mut self) -> Result<()> {
        self.core_mut().refresh_controls()
    }

    pub fn set_control_value(&mut self, control_id: &str, value: Value) -> Result<()> {
        self.core_mut().set_control_value(control_id, value)
    }

    pub fn reset_control_value(&mut self, control_id: &str) -> Result<()> {
        self.core_mut().reset_control_value(control_id)
    }

    pub fn reset_all_control_values(&mut self) -> Result<()> {
        self.core_mut().reset_all_control_values()
    }

    /// Drains every currently pending data message and decodes it. Only
    /// valid for kinds with a concrete formatter.
    pub fn fetch_data(&mut self) -> Result<FetchedValues> {
        match self {
            Sensor::Hardware(_) | Sensor::Led(_) => Err(Error::NotDataSubSupported),
            Sensor::Video(s) => {
                let mut out = Vec::new();
                while s.core.has_data()? {
                    if let Some(msg) = s.core.recv_data_message()? {
                        out.extend(s.formatter.decode(&msg)?);
                    }
                }
                Ok(FetchedValues::Video(out))
            }
            Sensor::Annotate(s) => {
                let mut out = Vec::new();
                while s.core.has_data()? {
                    if let Some(msg) = s.core.recv_data_message()? {
                        out.extend(s.formatter.decode(&msg)?);
                    }
                }
                Ok(FetchedValues::Annotate(out))
            }
            Sensor::Gaze(s) => {
                let mut out = Vec::new();
                while s.core.has_data()? {
                    if let Some(msg) = s.core.recv_data_message()? {
                        out.extend(s.formatter.decode(&msg)?);
                    }
                }
                Ok(FetchedValues::Gaze(out))
            }
            Sensor::Imu(s) => {
                let mut out = Vec::new();
                while s.core.has_data()? {
                    if let Some(msg) = s.core.recv_data_message()? {
                        out.extend(s.formatter.decode(&msg)?);
                    }
                }
                Ok(FetchedValues::Imu(out))
            }
            Sensor::Event(s) => {
                let mut out = Vec::new();
                while s.core.has_data()? {
                    if let Some(msg) = s.core.recv_data_message()? {
                        out.extend(s.formatter.decode(&msg)?);
                    }
                }
                Ok(FetchedValues::Event(out))
            }
        }
    }

    /// Polls the data socket up to `timeout`; on success, drains every
    /// currently queued frame and returns the last decoded one. Video only.
    pub fn get_newest_data_frame(&mut self, timeout: Duration) -> Result<VideoValue> {
        let Sensor::Video(s) = self else {
            return Err(Error::Capture(
                "get_newest_data_frame is only supported for video sensors".to_string(),
            ));
        };
        let sock = s.core.data_sub.as_ref().ok_or(Error::NotDataSubSupported)?;
        let mut items = [sock.as_poll_item(zmq::POLLIN)];
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let ready = zmq::poll(&mut items, timeout_ms).map_err(Error::from)?;
        if ready == 0 {
            return Err(Error::Stream("timed out waiting for a video frame".to_string()));
        }
        let mut last = None;
        while s.core.has_data()? {
            if let Some(msg) = s.core.recv_data_message()? {
                if let Some(v) = s.formatter.decode(&msg)?.pop() {
                    last = Some(v);
                }
            }
        }
        last.ok_or_else(|| Error::Stream("no video frame could be decoded".to_string()))
    }

    /// Unsubscribes and closes all owned sockets (`linger=0`).
    pub fn unlink(self) {
        match self {
            Sensor::Hardware(c) | Sensor::Led(c) => c.unlink(),
            Sensor::Video(s) => {
                s.core.unlink();
            }
            Sensor::Annotate(s) => s.core.unlink(),
            Sensor::Gaze(s) => s.core.unlink(),
            Sensor::Imu(s) => s.core.unlink(),
            Sensor::Event(s) => s.core.unlink(),
        }
    }
}
