// SPDX-License-Identifier: GPL-3.0-only

//! Session state machine types

use crate::backends::camera::types::CameraControl;

/// Where the current streaming session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing selected yet
    #[default]
    Idle,
    /// Reading controls before a helper seizes the device
    AcquiringControls,
    /// Waiting for the external streaming helper to report success
    StartingHelper,
    /// Source descriptor handed to the pipeline engine
    BuildingSource,
    Playing,
    /// Last play sequence failed
    Error,
    /// Pull source construction is being retried
    Retrying,
    /// Session was stopped explicitly
    Stopped,
}

impl SessionState {
    /// A play sequence is between request and confirmation
    pub fn is_starting(&self) -> bool {
        matches!(
            self,
            SessionState::AcquiringControls
                | SessionState::StartingHelper
                | SessionState::BuildingSource
                | SessionState::Retrying
        )
    }

    /// Nothing is running; stop has nothing to do
    pub fn is_inactive(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Stopped)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringControls => "acquiring controls",
            SessionState::StartingHelper => "starting helper",
            SessionState::BuildingSource => "building source",
            SessionState::Playing => "playing",
            SessionState::Error => "error",
            SessionState::Retrying => "retrying",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Notifications published by the session controller
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        camera_id: Option<String>,
        state: SessionState,
    },
    /// Controls for the selected camera were read (or served from cache)
    ControlsReady {
        camera_id: String,
        controls: Vec<CameraControl>,
    },
    /// The pipeline confirmed frames are flowing
    Playing { camera_id: String },
    /// Terminal failure with a human readable reason
    Error {
        camera_id: Option<String>,
        message: String,
    },
    Stopped { camera_id: String },
}

/// What a play request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// A full play sequence ran and the pipeline is playing
    Started,
    /// The camera's helper was alive, only the pipeline source was rebuilt
    HotSwapped,
    /// A pull source is retrying in the background; watch events for the result
    Connecting,
    /// Another play sequence was in flight, this request was dropped
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classes() {
        assert!(SessionState::Retrying.is_starting());
        assert!(!SessionState::Playing.is_starting());
        assert!(SessionState::Idle.is_inactive());
        assert!(SessionState::Stopped.is_inactive());
        assert!(!SessionState::Error.is_inactive());
    }
}
