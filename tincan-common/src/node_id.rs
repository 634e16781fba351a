//! Node ID types

/// Error returned when a raw value is not a usable node ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidNodeIdError {
    /// The rejected value
    pub value: u8,
}

impl core::fmt::Display for InvalidNodeIdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid node ID {}, must be in 1..=127", self.value)
    }
}
impl core::error::Error for InvalidNodeIdError {}

/// A node ID assigned to a node on the bus, always in the range 1..=127
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeId(u8);

impl NodeId {
    /// The largest valid node ID
    pub const MAX: u8 = 127;

    /// Create a node ID, checking it is in range
    pub const fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if value > 0 && value <= Self::MAX {
            Ok(NodeId(value))
        } else {
            Err(InvalidNodeIdError { value })
        }
    }

    /// Get the raw node ID
    pub const fn raw(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        NodeId::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_range() {
        assert!(NodeId::new(0).is_err());
        assert_eq!(1, NodeId::new(1).unwrap().raw());
        assert_eq!(127, NodeId::new(127).unwrap().raw());
        assert_eq!(Err(InvalidNodeIdError { value: 128 }), NodeId::try_from(128));
        assert_eq!(
            "Invalid node ID 255, must be in 1..=127",
            NodeId::new(255).unwrap_err().to_string()
        );
    }
}
