//! NMT state machine

use defmt_or_log::warn;
use tincan_common::{
    messages::{NmtCommand, NmtCommandSpecifier, NmtState, NMT_CMD_ID},
    CanMessage, NodeId,
};

/// What the node must do after an NMT event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NmtAction {
    /// Nothing changed
    None,
    /// The state changed
    StateChanged {
        /// The previous state
        from: NmtState,
        /// The new state
        to: NmtState,
    },
    /// The node must restart, ending in [`NmtState::BootUp`]
    Restart,
}

/// Result of applying `cmd` while in `state`
///
/// Start, stop and enter pre-operational are accepted in every state; both reset commands
/// restart the node.
pub fn transition(state: NmtState, cmd: NmtCommandSpecifier) -> NmtAction {
    let to = match cmd {
        NmtCommandSpecifier::Start => NmtState::Operational,
        NmtCommandSpecifier::Stop => NmtState::Stopped,
        NmtCommandSpecifier::EnterPreOperational => NmtState::PreOperational,
        NmtCommandSpecifier::ResetNode | NmtCommandSpecifier::ResetCommunication => {
            return NmtAction::Restart
        }
    };
    if to == state {
        NmtAction::None
    } else {
        NmtAction::StateChanged { from: state, to }
    }
}

/// Holds the node's NMT state
#[derive(Debug)]
pub struct Nmt {
    state: NmtState,
}

impl Default for Nmt {
    fn default() -> Self {
        Self::new()
    }
}

impl Nmt {
    /// Create in the BootUp state
    pub const fn new() -> Self {
        Self {
            state: NmtState::BootUp,
        }
    }

    /// The current state
    pub fn state(&self) -> NmtState {
        self.state
    }

    /// Return to BootUp, as part of a restart
    pub fn reset(&mut self) {
        self.state = NmtState::BootUp;
    }

    /// Change state directly
    pub fn set_state(&mut self, to: NmtState) -> NmtAction {
        let from = self.state;
        if from == to {
            return NmtAction::None;
        }
        self.state = to;
        NmtAction::StateChanged { from, to }
    }

    /// Handle a received frame
    ///
    /// Frames which are not NMT commands for `node_id` (or broadcast) are ignored.
    pub fn handle_message(&mut self, msg: &CanMessage, node_id: NodeId) -> NmtAction {
        if msg.id() != NMT_CMD_ID {
            return NmtAction::None;
        }
        let cmd = match NmtCommand::try_from(msg) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Ignoring NMT frame: {:?}", e);
                return NmtAction::None;
            }
        };
        if cmd.node != 0 && cmd.node != node_id.raw() {
            return NmtAction::None;
        }
        let action = transition(self.state, cmd.cmd);
        if let NmtAction::StateChanged { to, .. } = action {
            self.state = to;
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [NmtState; 4] = [
        NmtState::BootUp,
        NmtState::Stopped,
        NmtState::Operational,
        NmtState::PreOperational,
    ];

    #[test]
    fn test_transition_table() {
        for state in STATES {
            for (cmd, expected) in [
                (NmtCommandSpecifier::Start, Some(NmtState::Operational)),
                (NmtCommandSpecifier::Stop, Some(NmtState::Stopped)),
                (
                    NmtCommandSpecifier::EnterPreOperational,
                    Some(NmtState::PreOperational),
                ),
                (NmtCommandSpecifier::ResetNode, None),
                (NmtCommandSpecifier::ResetCommunication, None),
            ] {
                let action = transition(state, cmd);
                match expected {
                    Some(to) if to == state => assert_eq!(NmtAction::None, action),
                    Some(to) => assert_eq!(NmtAction::StateChanged { from: state, to }, action),
                    None => assert_eq!(NmtAction::Restart, action),
                }
            }
        }
    }

    #[test]
    fn test_addressing() {
        let node_id = NodeId::new(4).unwrap();
        let mut nmt = Nmt::new();
        nmt.set_state(NmtState::PreOperational);

        let other: CanMessage = NmtCommand {
            cmd: NmtCommandSpecifier::Start,
            node: 5,
        }
        .into();
        assert_eq!(NmtAction::None, nmt.handle_message(&other, node_id));
        assert_eq!(NmtState::PreOperational, nmt.state());

        let broadcast: CanMessage = NmtCommand {
            cmd: NmtCommandSpecifier::Start,
            node: 0,
        }
        .into();
        assert_eq!(
            NmtAction::StateChanged {
                from: NmtState::PreOperational,
                to: NmtState::Operational
            },
            nmt.handle_message(&broadcast, node_id)
        );

        let reset: CanMessage = NmtCommand {
            cmd: NmtCommandSpecifier::ResetCommunication,
            node: 4,
        }
        .into();
        assert_eq!(NmtAction::Restart, nmt.handle_message(&reset, node_id));

        let garbage = CanMessage::new(NMT_CMD_ID, &[0x55, 4]);
        assert_eq!(NmtAction::None, nmt.handle_message(&garbage, node_id));
    }
}
