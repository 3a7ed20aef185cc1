//! Network node and façade: peer discovery, group membership, and
//! host/sensor attach-detach reconciliation, one node per wire-format
//! version.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::discovery::{DiscoveryEvent, DiscoveryEventKind, DiscoveryPeer};
use crate::error::{Error, Result};
use crate::format::{group_name_from_format, WireFormatVersion};
use crate::frame::FrameFactory;
use crate::sensor::{Sensor, SensorDescriptor, SensorType};
use crate::wire::GossipPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEventKind {
    Attach,
    Detach,
}

/// A reconciled, fully-resolved attach/detach event handed to callbacks.
/// For detach, `descriptor` is the node's own remembered copy (enriched
/// with `sensor_name`/`host_name`), not whatever the wire detach message
/// carried (which names only `sensor_uuid`).
#[derive(Debug, Clone)]
pub struct NetworkEvent {
    pub kind: NetworkEventKind,
    pub descriptor: SensorDescriptor,
}

pub type NetworkEventCallback<P> = Box<dyn FnMut(&NetworkNode<P>, &NetworkEvent) -> Result<()>>;

#[derive(Debug, Clone)]
struct HostEntry {
    host_name: String,
    sensors: HashMap<String, SensorDescriptor>,
}

/// One node per supported wire-format version: peer discovery membership,
/// host/sensor reconciliation, callback fan-out, sensor factory.
pub struct NetworkNode<P: DiscoveryPeer> {
    name: String,
    version: WireFormatVersion,
    peer: P,
    headers: Vec<(String, String)>,
    hosts: HashMap<String, HostEntry>,
    callbacks: Vec<NetworkEventCallback<P>>,
    running: bool,
}

impl<P: DiscoveryPeer> NetworkNode<P> {
    pub fn new(name: impl Into<String>, version: WireFormatVersion, peer: P) -> Self {
        Self {
            name: name.into(),
            version,
            peer,
            headers: Vec::new(),
            hosts: HashMap::new(),
            callbacks: Vec::new(),
            running: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> WireFormatVersion {
        self.version
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push((key.into(), value.into()));
    }

    pub fn register_callback(&mut self, callback: NetworkEventCallback<P>) {
        self.callbacks.push(callback);
    }

    pub fn sensors(&self) -> impl Iterator<Item = &SensorDescriptor> {
        self.hosts.values().flat_map(|h| h.sensors.values())
    }

    pub fn start(&mut self) -> Result<()> {
        self.peer.start()?;
        for (key, value) in &self.headers {
            self.peer.set_header(key, value);
        }
        self.peer.join(&group_name_from_format(self.version))?;
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.peer.leave(&group_name_from_format(self.version))?;
        self.peer.stop()?;
        self.running = false;
        Ok(())
    }

    /// Synthesizes a detach for every currently-known sensor, then leaves
    /// and re-joins the group. No cross-rejoin state is preserved.
    pub fn rejoin(&mut self) -> Result<()> {
        let known: Vec<SensorDescriptor> = self.sensors().cloned().collect();
        for descriptor in known {
            self.dispatch(NetworkEventKind::Detach, descriptor)?;
        }
        self.hosts.clear();
        self.peer.leave(&group_name_from_format(self.version))?;
        self.peer.join(&group_name_from_format(self.version))?;
        Ok(())
    }

    /// Direct-messages a peer. A no-op on V3 for compatibility; forwards
    /// to the substrate on V4.
    pub fn whisper(&mut self, peer_uuid: Uuid, payload: Vec<Vec<u8>>) -> Result<()> {
        if self.version == WireFormatVersion::V3 {
            return Ok(());
        }
        self.peer.whisper(peer_uuid, payload)
    }

    pub fn has_events(&self) -> bool {
        self.peer.has_events()
    }

    pub fn handle_event(&mut self) -> Result<()> {
        let Some(event) = self.peer.recv_event()? else {
            return Ok(());
        };
        match event.kind {
            DiscoveryEventKind::Shout | DiscoveryEventKind::Whisper => self.handle_gossip(event),
            DiscoveryEventKind::Join => {
                debug!(
                    "{}: peer {} joined group {} (version {})",
                    self.name, event.peer_name, event.group, self.version
                );
                Ok(())
            }
            DiscoveryEventKind::Exit => self.handle_exit(event),
            DiscoveryEventKind::Enter | DiscoveryEventKind::Leave => Ok(()),
        }
    }

    fn handle_gossip(&mut self, event: DiscoveryEvent) -> Result<()> {
        let Some(raw) = event.msg.first() else {
            return Ok(());
        };
        let payload: GossipPayload = match serde_json::from_slice(raw) {
            Ok(p) => p,
            Err(e) => {
                debug!("{}: dropping malformed gossip payload: {e}", self.name);
                return Ok(());
            }
        };
        let host_uuid = event.peer_uuid.simple().to_string();
        let host_name = event.peer_name.clone();

        match payload {
            GossipPayload::Attach {
                sensor_uuid,
                sensor_name,
                sensor_type,
                notify_endpoint,
                command_endpoint,
                data_endpoint,
            } => {
                if self.has_sensor(&sensor_uuid) {
                    debug!("{}: duplicate attach for {sensor_uuid}, dropping", self.name);
                    return Ok(());
                }
                let Some(kind) = SensorType::from_wire_str(&sensor_type) else {
                    debug!(
                        "{}: unsupported sensor_type {sensor_type} for {sensor_uuid}, dropping attach",
                        self.name
                    );
                    return Ok(());
                };
                let descriptor = SensorDescriptor {
                    sensor_uuid,
                    sensor_name,
                    sensor_type: kind,
                    notify_endpoint,
                    command_endpoint,
                    data_endpoint,
                    host_uuid,
                    host_name,
                };
                self.dispatch(NetworkEventKind::Attach, descriptor)
            }
            GossipPayload::Detach { sensor_uuid } => {
                let Some(descriptor) = self.find_sensor(&sensor_uuid) else {
                    debug!("{}: detach for unknown sensor {sensor_uuid}, dropping", self.name);
                    return Ok(());
                };
                self.dispatch(NetworkEventKind::Detach, descriptor)
            }
        }
    }

    fn handle_exit(&mut self, event: DiscoveryEvent) -> Result<()> {
        let host_uuid = event.peer_uuid.simple().to_string();
        let Some(host) = self.hosts.get(&host_uuid).cloned() else {
            return Ok(());
        };
        for descriptor in host.sensors.into_values() {
            self.dispatch(NetworkEventKind::Detach, descriptor)?;
        }
        Ok(())
    }

    /// Runs the built-in reconciliation step (always first, not
    /// configurable) and then every user callback in registration order.
    fn dispatch(&mut self, kind: NetworkEventKind, descriptor: SensorDescriptor) -> Result<()> {
        match kind {
            NetworkEventKind::Attach => {
                self.hosts
                    .entry(descriptor.host_uuid.clone())
                    .or_insert_with(|| HostEntry {
                        host_name: descriptor.host_name.clone(),
                        sensors: HashMap::new(),
                    })
                    .sensors
                    .insert(descriptor.sensor_uuid.clone(), descriptor.clone());
            }
            NetworkEventKind::Detach => {
                let mut drop_host = false;
                if let Some(host) = self.hosts.get_mut(&descriptor.host_uuid) {
                    host.sensors.remove(&descriptor.sensor_uuid);
                    drop_host = host.sensors.is_empty();
                }
                if drop_host {
                    self.hosts.remove(&descriptor.host_uuid);
                }
            }
        }

        let event = NetworkEvent { kind, descriptor };
        let mut callbacks = std::mem::take(&mut self.callbacks);
        for callback in &mut callbacks {
            if let Err(e) = callback(self, &event) {
                debug!("{}: network callback failed: {e}", self.name);
            }
        }
        self.callbacks = callbacks;
        Ok(())
    }

    /// Looks up the descriptor and constructs a new [`Sensor`] session of
    /// the matching kind.
    pub fn sensor(
        &self,
        ctx: &zmq::Context,
        sensor_uuid: &str,
        frame_factory: Box<dyn FrameFactory>,
    ) -> Result<Sensor> {
        let descriptor = self
            .find_sensor(sensor_uuid)
            .ok_or_else(|| Error::UnknownSensor(sensor_uuid.to_string()))?;
        Sensor::attach(ctx, descriptor, self.version, frame_factory)
    }

    /// Resolves a descriptor by `sensor_uuid` across every known host,
    /// regardless of which host a given message named — `sensor_uuid` is
    /// unique node-wide.
    fn find_sensor(&self, sensor_uuid: &str) -> Option<SensorDescriptor> {
        self.hosts
            .values()
            .find_map(|h| h.sensors.get(sensor_uuid))
            .cloned()
    }

    fn has_sensor(&self, sensor_uuid: &str) -> bool {
        self.find_sensor(sensor_uuid).is_some()
    }

    /// Test-only escape hatch into the owned peer, so out-of-crate
    /// integration tests can inject discovery events the way the mock's
    /// `push_event` expects. Not part of the public API surface proper.
    #[cfg(any(test, feature = "test-util"))]
    pub fn peer_mut(&mut self) -> &mut P {
        &mut self.peer
    }
}

/// Aggregates one node per requested wire-format version into a single
/// user-facing surface.
pub struct Network<P: DiscoveryPeer> {
    nodes: Vec<NetworkNode<P>>,
}

impl<P: DiscoveryPeer> Network<P> {
    pub fn new(nodes: Vec<NetworkNode<P>>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NetworkNode<P>] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [NetworkNode<P>] {
        &mut self.nodes
    }

    pub fn start(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.start()?;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.stop()?;
        }
        Ok(())
    }

    pub fn rejoin(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.rejoin()?;
        }
        Ok(())
    }

    pub fn has_events(&self) -> bool {
        self.nodes.iter().any(|n| n.has_events())
    }

    pub fn running(&self) -> bool {
        self.nodes.iter().any(|n| n.running())
    }

    /// Services the first node with a pending event. A caller wanting to
    /// drain all pending events calls this in a `while has_events()` loop.
    pub fn handle_event(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            if node.has_events() {
                return node.handle_event();
            }
        }
        Ok(())
    }

    pub fn whisper(&mut self, peer_uuid: Uuid, payload: Vec<Vec<u8>>) -> Result<()> {
        for node in &mut self.nodes {
            node.whisper(peer_uuid, payload.clone())?;
        }
        Ok(())
    }

    pub fn sensors(&self) -> impl Iterator<Item = &SensorDescriptor> {
        self.nodes.iter().flat_map(|n| n.sensors())
    }

    /// Queries each node in order and returns the first match.
    pub fn sensor(
        &self,
        ctx: &zmq::Context,
        sensor_uuid: &str,
        frame_factory: Box<dyn FrameFactory>,
    ) -> Result<Sensor> {
        for node in &self.nodes {
            if node.has_sensor(sensor_uuid) {
                return node.sensor(ctx, sensor_uuid, frame_factory);
            }
        }
        Err(Error::UnknownSensor(sensor_uuid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::mock::MockDiscoveryPeer;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn attach_event(peer_uuid: Uuid, peer_name: &str, sensor_uuid: &str) -> DiscoveryEvent {
        let payload = serde_json::json!({
            "subject": "attach",
            "sensor_uuid": sensor_uuid,
            "sensor_name": format!("{sensor_uuid}-name"),
            "sensor_type": "gaze",
            "notify_endpoint": "tcp://127.0.0.1:1",
            "command_endpoint": "tcp://127.0.0.1:2",
        });
        DiscoveryEvent {
            kind: DiscoveryEventKind::Shout,
            peer_uuid,
            peer_name: peer_name.to_string(),
            group: "pupil-mobile-v4".to_string(),
            msg: vec![serde_json::to_vec(&payload).unwrap()],
        }
    }

    fn detach_event(peer_uuid: Uuid, peer_name: &str, sensor_uuid: &str) -> DiscoveryEvent {
        let payload = serde_json::json!({"subject": "detach", "sensor_uuid": sensor_uuid});
        DiscoveryEvent {
            kind: DiscoveryEventKind::Shout,
            peer_uuid,
            peer_name: peer_name.to_string(),
            group: "pupil-mobile-v4".to_string(),
            msg: vec![serde_json::to_vec(&payload).unwrap()],
        }
    }

    fn exit_event(peer_uuid: Uuid, peer_name: &str) -> DiscoveryEvent {
        DiscoveryEvent {
            kind: DiscoveryEventKind::Exit,
            peer_uuid,
            peer_name: peer_name.to_string(),
            group: "pupil-mobile-v4".to_string(),
            msg: vec![],
        }
    }

    fn node_with_recording_callback() -> (NetworkNode<MockDiscoveryPeer>, Rc<RefCell<Vec<NetworkEvent>>>) {
        let peer = MockDiscoveryPeer::new("test-node");
        let mut node = NetworkNode::new("test-node", WireFormatVersion::V4, peer);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = seen.clone();
        node.register_callback(Box::new(move |_node, event| {
            seen_cb.borrow_mut().push(event.clone());
            Ok(())
        }));
        (node, seen)
    }

    #[test]
    fn duplicate_attach_yields_one_event() {
        let (mut node, seen) = node_with_recording_callback();
        let peer_uuid = Uuid::new_v4();
        node.peer.push_event(attach_event(peer_uuid, "host-a", "sensor-1"));
        node.peer.push_event(attach_event(peer_uuid, "host-a", "sensor-1"));
        node.handle_event().unwrap();
        node.handle_event().unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(node.sensors().count(), 1);
    }

    #[test]
    fn duplicate_attach_from_a_different_host_is_also_dropped() {
        // sensor_uuid is unique node-wide, not per-host: a second peer
        // claiming the same sensor_uuid must not create a second entry.
        let (mut node, seen) = node_with_recording_callback();
        let host_a = Uuid::new_v4();
        let host_b = Uuid::new_v4();
        node.peer.push_event(attach_event(host_a, "host-a", "sensor-1"));
        node.peer.push_event(attach_event(host_b, "host-b", "sensor-1"));
        node.handle_event().unwrap();
        node.handle_event().unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(node.sensors().count(), 1);
        assert_eq!(node.sensors().next().unwrap().host_name, "host-a");
    }

    #[test]
    fn detach_resolves_sensor_regardless_of_injected_host_uuid() {
        // A detach's host_uuid comes from the sending peer, not necessarily
        // the host that originally attached the sensor; resolution must be
        // by sensor_uuid across all hosts.
        let (mut node, seen) = node_with_recording_callback();
        let host_a = Uuid::new_v4();
        let host_b = Uuid::new_v4();
        node.peer.push_event(attach_event(host_a, "host-a", "sensor-1"));
        node.peer.push_event(detach_event(host_b, "host-b", "sensor-1"));
        node.handle_event().unwrap();
        node.handle_event().unwrap();
        let events = seen.borrow();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, NetworkEventKind::Attach);
        assert_eq!(events[1].kind, NetworkEventKind::Detach);
        assert_eq!(events[1].descriptor.host_name, "host-a");
        assert_eq!(node.sensors().count(), 0);
    }

    #[test]
    fn attach_then_double_detach_yields_one_attach_one_detach() {
        let (mut node, seen) = node_with_recording_callback();
        let peer_uuid = Uuid::new_v4();
        node.peer.push_event(attach_event(peer_uuid, "host-a", "sensor-1"));
        node.peer.push_event(detach_event(peer_uuid, "host-a", "sensor-1"));
        node.peer.push_event(detach_event(peer_uuid, "host-a", "sensor-1"));
        for _ in 0..3 {
            node.handle_event().unwrap();
        }
        let events = seen.borrow();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, NetworkEventKind::Attach);
        assert_eq!(events[1].kind, NetworkEventKind::Detach);
        assert_eq!(node.sensors().count(), 0);
    }

    #[test]
    fn exit_fans_out_a_detach_per_owned_sensor() {
        let (mut node, seen) = node_with_recording_callback();
        let peer_uuid = Uuid::new_v4();
        node.peer.push_event(attach_event(peer_uuid, "host-a", "sensor-1"));
        node.peer.push_event(attach_event(peer_uuid, "host-a", "sensor-2"));
        node.peer.push_event(exit_event(peer_uuid, "host-a"));
        for _ in 0..3 {
            node.handle_event().unwrap();
        }
        let events = seen.borrow();
        let detach_names: std::collections::HashSet<_> = events
            .iter()
            .filter(|e| e.kind == NetworkEventKind::Detach)
            .map(|e| e.descriptor.sensor_name.clone())
            .collect();
        assert_eq!(detach_names.len(), 2);
        assert!(detach_names.contains("sensor-1-name"));
        assert!(detach_names.contains("sensor-2-name"));
        assert_eq!(node.sensors().count(), 0);
    }

    #[test]
    fn whisper_is_a_no_op_on_v3() {
        let peer = MockDiscoveryPeer::new("v3-node");
        let mut node = NetworkNode::new("v3-node", WireFormatVersion::V3, peer);
        node.whisper(Uuid::new_v4(), vec![vec![1, 2, 3]]).unwrap();
        assert!(node.peer.whispers.is_empty());
    }

    #[test]
    fn whisper_forwards_on_v4() {
        let peer = MockDiscoveryPeer::new("v4-node");
        let mut node = NetworkNode::new("v4-node", WireFormatVersion::V4, peer);
        node.whisper(Uuid::new_v4(), vec![vec![1, 2, 3]]).unwrap();
        assert_eq!(node.peer.whispers.len(), 1);
    }

    #[test]
    fn unsupported_sensor_type_attach_is_dropped() {
        let (mut node, seen) = node_with_recording_callback();
        let payload = serde_json::json!({
            "subject": "attach",
            "sensor_uuid": "sensor-x",
            "sensor_name": "x",
            "sensor_type": "thermal-camera",
            "notify_endpoint": "tcp://127.0.0.1:1",
            "command_endpoint": "tcp://127.0.0.1:2",
        });
        node.peer.push_event(DiscoveryEvent {
            kind: DiscoveryEventKind::Shout,
            peer_uuid: Uuid::new_v4(),
            peer_name: "host".to_string(),
            group: "pupil-mobile-v4".to_string(),
            msg: vec![serde_json::to_vec(&payload).unwrap()],
        });
        node.handle_event().unwrap();
        assert!(seen.borrow().is_empty());
        assert_eq!(node.sensors().count(), 0);
    }
}
