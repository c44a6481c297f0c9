//! Process-wide protocol registry.
//!
//! Protocols are identified on the wire by their leading code byte. The
//! table is built once at first use from a static list and is immutable
//! afterwards; there is no lazy per-use registration.

use std::sync::OnceLock;

use bitflags::bitflags;

/// Protocol code of the v1 framing (no switch byte, no trailer).
pub const PROTOCOL_V1: u8 = 1;
/// Protocol code of the v2 framing (switch byte after the code, optional
/// CRC32 trailer).
pub const PROTOCOL_V2: u8 = 2;

bitflags! {
    /// Option bits carried in the v2 header's switch byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtocolSwitch: u8 {
        /// Append a CRC32 of the frame and verify it on decode.
        const CRC = 0b0000_0001;
    }
}

/// Protocol selection for one connection: code plus active switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolId {
    pub code: u8,
    pub switches: ProtocolSwitch,
}

impl ProtocolId {
    pub fn v1() -> Self {
        Self {
            code: PROTOCOL_V1,
            switches: ProtocolSwitch::empty(),
        }
    }

    pub fn v2(switches: ProtocolSwitch) -> Self {
        Self {
            code: PROTOCOL_V2,
            switches,
        }
    }

    /// Protocol for a given code byte with switches derived from config.
    pub fn for_code(code: u8, crc_enabled: bool) -> Self {
        let switches = if code == PROTOCOL_V2 && crc_enabled {
            ProtocolSwitch::CRC
        } else {
            ProtocolSwitch::empty()
        };
        Self { code, switches }
    }
}

/// Static description of one supported protocol.
#[derive(Debug, Clone, Copy)]
pub struct Protocol {
    pub code: u8,
    pub name: &'static str,
    /// Whether the framing carries a switch byte and may carry a trailer.
    pub has_switch: bool,
}

/// Registry of supported protocols, keyed by code byte.
pub struct ProtocolManager {
    table: Vec<Protocol>,
}

static GLOBAL: OnceLock<ProtocolManager> = OnceLock::new();

impl ProtocolManager {
    /// The process-wide registry. Built on first access, fixed afterwards.
    pub fn global() -> &'static ProtocolManager {
        GLOBAL.get_or_init(|| ProtocolManager {
            table: vec![
                Protocol {
                    code: PROTOCOL_V1,
                    name: "v1",
                    has_switch: false,
                },
                Protocol {
                    code: PROTOCOL_V2,
                    name: "v2",
                    has_switch: true,
                },
            ],
        })
    }

    pub fn get(&self, code: u8) -> Option<&Protocol> {
        self.table.iter().find(|p| p.code == code)
    }

    pub fn contains(&self, code: u8) -> bool {
        self.get(code).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_both_versions() {
        let m = ProtocolManager::global();
        assert!(m.contains(PROTOCOL_V1));
        assert!(m.contains(PROTOCOL_V2));
        assert!(!m.contains(0));
        assert!(!m.contains(77));
        assert!(m.get(PROTOCOL_V2).unwrap().has_switch);
    }

    #[test]
    fn for_code_only_arms_crc_on_v2() {
        assert_eq!(
            ProtocolId::for_code(PROTOCOL_V1, true).switches,
            ProtocolSwitch::empty()
        );
        assert_eq!(
            ProtocolId::for_code(PROTOCOL_V2, true).switches,
            ProtocolSwitch::CRC
        );
        assert_eq!(
            ProtocolId::for_code(PROTOCOL_V2, false).switches,
            ProtocolSwitch::empty()
        );
    }
}
