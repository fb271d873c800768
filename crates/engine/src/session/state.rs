// C2T - CPU Testing Tool
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Session lifecycle as an explicit transition table.

use std::fmt;

use crate::{C2tError, C2tResult};

/// Where a debug session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No connection yet
    Idle,
    /// Connected, no program armed
    Connected,
    /// Program loaded and breakpoints installed
    BreakpointsArmed,
    /// Program executing
    Running,
    /// Halted at a breakpoint
    Stopped,
    /// Measurement over; only teardown or reset remain
    Finished,
}

/// What happened to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// Debug connection established
    Connect,
    /// Breakpoints installed for a program
    Arm,
    /// Execution resumed
    Resume,
    /// A breakpoint was hit
    Hit,
    /// The program exited
    Exit,
    /// The session is done measuring
    Finish,
    /// The device was reset for the next program
    Reset,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Next state after `event` in `state`. Anything not in the table is a
/// protocol error.
pub fn transition(state: SessionState, event: SessionEvent) -> C2tResult<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (state, event) {
        (S::Idle, E::Connect) => S::Connected,
        (S::Connected, E::Arm) => S::BreakpointsArmed,
        (S::BreakpointsArmed | S::Stopped, E::Resume) => S::Running,
        (S::Running, E::Hit) => S::Stopped,
        (S::Running, E::Exit) => S::Finished,
        (S::Finished, E::Reset) => S::Connected,
        (s, E::Finish) if s != S::Idle => S::Finished,
        (state, event) => {
            return Err(C2tError::Protocol(format!(
                "session cannot handle {event} while {state}"
            )))
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent as E;
    use SessionState as S;

    #[test]
    fn test_full_lifecycle() {
        let mut state = S::Idle;
        for event in [E::Connect, E::Arm, E::Resume, E::Hit, E::Resume, E::Hit, E::Finish, E::Reset]
        {
            state = transition(state, event).unwrap();
        }
        assert_eq!(state, S::Connected);
        assert_eq!(transition(S::Running, E::Exit).unwrap(), S::Finished);
        assert_eq!(transition(S::Finished, E::Finish).unwrap(), S::Finished);
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(transition(S::Idle, E::Arm).is_err());
        assert!(transition(S::Idle, E::Finish).is_err());
        assert!(transition(S::Connected, E::Resume).is_err());
        assert!(transition(S::Stopped, E::Hit).is_err());
        assert!(transition(S::Running, E::Reset).is_err());
        let err = transition(S::BreakpointsArmed, E::Connect).unwrap_err();
        assert!(err.to_string().contains("Connect while BreakpointsArmed"));
    }
}
