//! Channel and link classification enums.

/// How a channel connects two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Node-to-node, no intermediary.
    Direct,
    /// Via a relay or whiteboard.
    Indirect,
    /// A mix of the two.
    Mixed,
    /// In-process delivery.
    Local,
}

impl ConnectionType {
    /// Whether clients may be exposed to this kind of channel.
    pub fn client_ok(self) -> bool {
        !matches!(self, ConnectionType::Direct)
    }
}

/// Which side initiates a link on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkDirection {
    /// The creator receives; senders load the address.
    CreatorToLoader,
    /// The loader receives; creators send.
    LoaderToCreator,
    /// Either side may send.
    Bidirectional,
}

impl LinkDirection {
    /// Whether a sender can load an address created by the receiver.
    pub fn sender_loaded(self) -> bool {
        matches!(
            self,
            LinkDirection::CreatorToLoader | LinkDirection::Bidirectional
        )
    }

    /// Whether a receiver can load an address created by the sender.
    pub fn receiver_loaded(self) -> bool {
        matches!(
            self,
            LinkDirection::LoaderToCreator | LinkDirection::Bidirectional
        )
    }
}

/// Unicast or multicast semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionType {
    /// One receiver per send.
    Unicast,
    /// Every subscriber receives each send.
    Multicast,
}

/// What a link can do from this node's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// Outbound only.
    Send,
    /// Inbound only.
    Receive,
    /// Both directions.
    Bidi,
}

impl LinkType {
    /// Whether this node can send on the link.
    pub fn can_send(self) -> bool {
        matches!(self, LinkType::Send | LinkType::Bidi)
    }

    /// Whether this node can receive on the link.
    pub fn can_receive(self) -> bool {
        matches!(self, LinkType::Receive | LinkType::Bidi)
    }
}

/// Link liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Connected and carrying traffic.
    Open,
    /// Usable but idle.
    Available,
    /// Torn down.
    Closed,
}

impl ConnectionStatus {
    /// Whether sends may be attempted.
    pub fn usable(self) -> bool {
        matches!(self, ConnectionStatus::Open | ConnectionStatus::Available)
    }
}

/// Channel availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    /// Ready for link creation.
    Available,
    /// Temporarily unusable.
    Unavailable,
}

impl ChannelStatus {
    /// Whether links can be created or loaded right now.
    pub fn usable(self) -> bool {
        matches!(self, ChannelStatus::Available)
    }
}
