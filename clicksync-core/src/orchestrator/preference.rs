use crate::discovery::DiscoveredPeer;

/// The peer name a controller prefers to dial.
///
/// An empty name means no preference.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PreferredPeer {
    name: Option<String>,
}

impl PreferredPeer {
    pub fn new(name: Option<String>) -> Self {
        let mut preferred = Self::default();
        preferred.set(name);
        preferred
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set(&mut self, name: Option<String>) {
        self.name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
    }

    /// Forget the preference if `peers` no longer contains it.
    ///
    /// Returns `true` only on the call that actually clears it.
    pub fn observe(&mut self, peers: &[DiscoveredPeer]) -> bool {
        match &self.name {
            Some(name) if !peers.iter().any(|p| p.name() == name) => {
                self.name = None;
                true
            }
            _ => false,
        }
    }
}
