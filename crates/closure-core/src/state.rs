use serde::{Deserialize, Serialize};
use std::fmt;

/// The six states of the operational-closure machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmState {
    Safe,
    Initialized,
    Armed,
    EmitReady,
    Emitting,
    Fault,
}

impl FsmState {
    pub const ALL: [FsmState; 6] = [
        FsmState::Safe,
        FsmState::Initialized,
        FsmState::Armed,
        FsmState::EmitReady,
        FsmState::Emitting,
        FsmState::Fault,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FsmState::Safe => "SAFE",
            FsmState::Initialized => "INITIALIZED",
            FsmState::Armed => "ARMED",
            FsmState::EmitReady => "EMIT_READY",
            FsmState::Emitting => "EMITTING",
            FsmState::Fault => "FAULT",
        }
    }

    /// States in which the interlock must stay safe.
    pub fn is_hot(self) -> bool {
        matches!(self, FsmState::Armed | FsmState::EmitReady | FsmState::Emitting)
    }

    pub fn to_u8(self) -> u8 {
        match self {
            FsmState::Safe => 0,
            FsmState::Initialized => 1,
            FsmState::Armed => 2,
            FsmState::EmitReady => 3,
            FsmState::Emitting => 4,
            FsmState::Fault => 5,
        }
    }

    /// Unknown codes decode to `Fault`.
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => FsmState::Safe,
            1 => FsmState::Initialized,
            2 => FsmState::Armed,
            3 => FsmState::EmitReady,
            4 => FsmState::Emitting,
            _ => FsmState::Fault,
        }
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmEvent {
    Initialize,
    Arm,
    ConfirmArm,
    ArmTimeout,
    EmitRequest,
    EmitComplete,
    Stop,
    Reset,
    Fault,
}

impl FsmEvent {
    pub const ALL: [FsmEvent; 9] = [
        FsmEvent::Initialize,
        FsmEvent::Arm,
        FsmEvent::ConfirmArm,
        FsmEvent::ArmTimeout,
        FsmEvent::EmitRequest,
        FsmEvent::EmitComplete,
        FsmEvent::Stop,
        FsmEvent::Reset,
        FsmEvent::Fault,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FsmEvent::Initialize => "initialize",
            FsmEvent::Arm => "arm",
            FsmEvent::ConfirmArm => "confirm_arm",
            FsmEvent::ArmTimeout => "arm_timeout",
            FsmEvent::EmitRequest => "emit_request",
            FsmEvent::EmitComplete => "emit_complete",
            FsmEvent::Stop => "stop",
            FsmEvent::Reset => "reset",
            FsmEvent::Fault => "fault",
        }
    }
}

impl fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition graph. `None` means the event is illegal from `from`.
///
/// FAULT has exactly one exit, `Reset` to SAFE; a second `Fault` while
/// already faulted is not a transition.
pub fn target(from: FsmState, event: FsmEvent) -> Option<FsmState> {
    use FsmEvent as E;
    use FsmState as S;
    match (from, event) {
        (S::Safe, E::Initialize) => Some(S::Initialized),
        (S::Initialized, E::Arm) => Some(S::Armed),
        (S::Armed, E::ConfirmArm) => Some(S::EmitReady),
        (S::Armed, E::ArmTimeout) => Some(S::Initialized),
        (S::EmitReady, E::EmitRequest) => Some(S::Emitting),
        (S::Emitting, E::EmitComplete) => Some(S::EmitReady),
        (S::Initialized | S::Armed | S::EmitReady | S::Emitting, E::Stop) => Some(S::Safe),
        (S::Fault, E::Reset) => Some(S::Safe),
        (S::Fault, E::Fault) => None,
        (_, E::Fault) => Some(S::Fault),
        _ => None,
    }
}
