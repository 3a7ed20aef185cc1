//! Discovery substrate interface (external collaborator, consumed not
//! implemented). The gossip/beacon peer fabric itself — SHOUT/WHISPER
//! group messaging, JOIN/EXIT/ENTER/LEAVE membership events — lives
//! outside this crate. A [`NetworkNode`](crate::network::NetworkNode)
//! is generic over any [`DiscoveryPeer`] implementation.

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    Shout,
    Whisper,
    Join,
    Exit,
    Enter,
    Leave,
}

/// One event emitted by a peer's event source.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventKind,
    pub peer_uuid: Uuid,
    pub peer_name: String,
    pub group: String,
    pub msg: Vec<Vec<u8>>,
}

/// The contract a discovery substrate peer must satisfy.
pub trait DiscoveryPeer {
    fn start(&mut self) -> crate::Result<()>;
    fn stop(&mut self) -> crate::Result<()>;
    fn join(&mut self, group: &str) -> crate::Result<()>;
    fn leave(&mut self, group: &str) -> crate::Result<()>;
    fn set_header(&mut self, key: &str, value: &str);

    fn whisper(&mut self, peer_uuid: Uuid, payload: Vec<Vec<u8>>) -> crate::Result<()>;
    fn shout(&mut self, group: &str, payload: Vec<Vec<u8>>) -> crate::Result<()>;

    fn endpoint(&self) -> Option<String>;
    fn uuid(&self) -> Uuid;
    fn name(&self) -> String;

    /// Non-blocking: true if `recv_event` would return `Some` right now.
    fn has_events(&self) -> bool;
    /// Pop the next pending event, if any. Must not block.
    fn recv_event(&mut self) -> crate::Result<Option<DiscoveryEvent>>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// A discovery peer test double with an injectable event queue and a
    /// record of outgoing whispers/shouts, for exercising [`NetworkNode`]
    /// reconciliation logic without a real gossip fabric.
    #[derive(Debug, Default)]
    pub struct MockDiscoveryPeer {
        pub uuid: Uuid,
        pub name: String,
        pub started: bool,
        pub joined_groups: Vec<String>,
        pub headers: Vec<(String, String)>,
        pub whispers: Vec<(Uuid, Vec<Vec<u8>>)>,
        pub shouts: Vec<(String, Vec<Vec<u8>>)>,
        pub queue: VecDeque<DiscoveryEvent>,
    }

    impl MockDiscoveryPeer {
        pub fn new(name: &str) -> Self {
            Self {
                uuid: Uuid::new_v4(),
                name: name.to_string(),
                ..Default::default()
            }
        }

        pub fn push_event(&mut self, event: DiscoveryEvent) {
            self.queue.push_back(event);
        }
    }

    impl DiscoveryPeer for MockDiscoveryPeer {
        fn start(&mut self) -> crate::Result<()> {
            self.started = true;
            Ok(())
        }

        fn stop(&mut self) -> crate::Result<()> {
            self.started = false;
            Ok(())
        }

        fn join(&mut self, group: &str) -> crate::Result<()> {
            self.joined_groups.push(group.to_string());
            Ok(())
        }

        fn leave(&mut self, group: &str) -> crate::Result<()> {
            self.joined_groups.retain(|g| g != group);
            Ok(())
        }

        fn set_header(&mut self, key: &str, value: &str) {
            self.headers.push((key.to_string(), value.to_string()));
        }

        fn whisper(&mut self, peer_uuid: Uuid, payload: Vec<Vec<u8>>) -> crate::Result<()> {
            self.whispers.push((peer_uuid, payload));
            Ok(())
        }

        fn shout(&mut self, group: &str, payload: Vec<Vec<u8>>) -> crate::Result<()> {
            self.shouts.push((group.to_string(), payload));
            Ok(())
        }

        fn endpoint(&self) -> Option<String> {
            None
        }

        fn uuid(&self) -> Uuid {
            self.uuid
        }

        fn name(&self) -> String {
            self.name.clone()
        }

        fn has_events(&self) -> bool {
            !self.queue.is_empty()
        }

        fn recv_event(&mut self) -> crate::Result<Option<DiscoveryEvent>> {
            Ok(self.queue.pop_front())
        }
    }
}
