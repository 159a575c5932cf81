use std::collections::HashMap;

use tracing::trace;

use crate::wire::{
    Envelope, Message, WireError, PACKET_CHATTER, PACKET_HELLO, PACKET_VALIDATION_REQUEST,
    PACKET_VALIDATION_RESPONSE, PACKET_VALIDATION_RESULT,
};

/// Packet id registry and envelope codec shared by both protocol halves.
pub struct ProtocolEngine {
    packets: HashMap<u16, &'static str>,
}

impl ProtocolEngine {
    pub fn new() -> Self {
        Self {
            packets: HashMap::new(),
        }
    }

    pub fn with_gate_packets() -> Result<Self, WireError> {
        let mut engine = Self::new();
        engine.register(PACKET_HELLO, "Hello")?;
        engine.register(PACKET_CHATTER, "Chatter")?;
        engine.register(PACKET_VALIDATION_REQUEST, "ValidationRequest")?;
        engine.register(PACKET_VALIDATION_RESPONSE, "ValidationResponse")?;
        engine.register(PACKET_VALIDATION_RESULT, "ValidationResult")?;
        Ok(engine)
    }

    pub fn register(&mut self, packet_id: u16, name: &'static str) -> Result<(), WireError> {
        if self.packets.contains_key(&packet_id) {
            return Err(WireError::DuplicatePacket(packet_id));
        }
        self.packets.insert(packet_id, name);
        Ok(())
    }

    pub fn packet_name(&self, packet_id: u16) -> Option<&'static str> {
        self.packets.get(&packet_id).copied()
    }

    /// Parses an envelope, refusing packet ids nobody registered.
    pub fn read_envelope(&self, bytes: &[u8]) -> Result<Envelope, WireError> {
        let envelope = Envelope::from_bytes(bytes)?;
        let name = self
            .packet_name(envelope.packet_id)
            .ok_or(WireError::UnknownPacket(envelope.packet_id))?;
        trace!(packet = name, len = bytes.len(), encrypted = envelope.is_encrypted, "read envelope");
        Ok(envelope)
    }

    pub fn encode(&self, message: &Message, key: Option<&str>) -> Result<Vec<u8>, WireError> {
        let packet_id = message.packet_id();
        if self.packet_name(packet_id).is_none() {
            return Err(WireError::UnknownPacket(packet_id));
        }
        Envelope::wrap(message, key)?.to_bytes()
    }

    pub fn decode(&self, bytes: &[u8], key: Option<&str>) -> Result<Message, WireError> {
        self.read_envelope(bytes)?.open(key)
    }
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ValidationResultCode;
    use crate::transport_adapter::PeerId;
    use crate::wire::{MessageHeader, MessageTarget, ValidationResultPacket};

    fn result_message() -> Message {
        Message::ValidationResult(ValidationResultPacket {
            header: MessageHeader::new(PeerId(1), MessageTarget::Client, PeerId(2)),
            success: false,
            code: ValidationResultCode::RejectedMatch,
            reason: ValidationResultCode::RejectedMatch.reason().to_string(),
            plugin_list: vec!["abc=".into()],
        })
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let mut engine = ProtocolEngine::with_gate_packets().unwrap();
        assert!(matches!(
            engine.register(PACKET_HELLO, "Again"),
            Err(WireError::DuplicatePacket(PACKET_HELLO))
        ));
        assert_eq!(engine.packet_name(PACKET_CHATTER), Some("Chatter"));
    }

    #[test]
    fn routes_registered_packets_only() {
        let full = ProtocolEngine::with_gate_packets().unwrap();
        let bytes = full.encode(&result_message(), Some("t")).unwrap();
        assert_eq!(full.decode(&bytes, Some("t")).unwrap(), result_message());

        let mut partial = ProtocolEngine::new();
        partial.register(PACKET_HELLO, "Hello").unwrap();
        assert!(matches!(
            partial.decode(&bytes, Some("t")),
            Err(WireError::UnknownPacket(PACKET_VALIDATION_RESULT))
        ));
        assert!(partial.encode(&result_message(), None).is_err());
    }
}
