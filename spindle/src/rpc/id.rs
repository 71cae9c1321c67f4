use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;

/// Provider id carried by identifiers that do not target a specific provider.
pub const DEFAULT_PROVIDER_ID: u16 = u16::MAX;

const PROVIDER_BITS: u32 = 16;
const PROVIDER_MASK: u64 = (1 << PROVIDER_BITS) - 1;

/// Process-local RPC identifier. The low 16 bits hold a provider id so one
/// registered name can be served by several providers on the same instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcId(u64);

impl RpcId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Derives the identifier from a name. Both ends of a call derive the
    /// same value without any negotiation.
    pub fn from_name(name: &str) -> Self {
        let mut hasher = FxHasher::default();
        hasher.write(name.as_bytes());
        Self(hasher.finish()).base()
    }

    pub fn with_provider(self, provider_id: u16) -> Self {
        Self((self.0 & !PROVIDER_MASK) | provider_id as u64)
    }

    pub fn provider_id(&self) -> u16 {
        (self.0 & PROVIDER_MASK) as u16
    }

    /// The identifier with the default provider id.
    pub fn base(&self) -> Self {
        self.with_provider(DEFAULT_PROVIDER_ID)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcId({:#x}:{})", self.0 >> PROVIDER_BITS, self.provider_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_is_stable_and_distinct() {
        assert_eq!(RpcId::from_name("echo"), RpcId::from_name("echo"));
        assert_ne!(RpcId::from_name("echo"), RpcId::from_name("sum"));
        assert_eq!(RpcId::from_name("echo").provider_id(), DEFAULT_PROVIDER_ID);
    }

    #[test]
    fn test_provider_mux_demux() {
        let base = RpcId::from_name("store.put");
        let muxed = base.with_provider(42);

        assert_ne!(muxed, base);
        assert_eq!(muxed.provider_id(), 42);
        assert_eq!(muxed.base(), base);
        assert_eq!(muxed.as_u64() >> 16, base.as_u64() >> 16);
    }

    #[test]
    fn test_serde_is_transparent() -> anyhow::Result<()> {
        let id = RpcId::new(0x1234);
        assert_eq!(serde_json::to_string(&id)?, "4660");
        assert_eq!(serde_json::from_str::<RpcId>("4660")?, id);
        Ok(())
    }
}
