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

//! Error kinds of the testing engine.
//!
//! Every failure is classified so the caller can tell an infrastructure
//! fault (configuration, build, protocol, port) from a genuine divergence
//! between the target and the oracle.

use c2t_common::Arch;
use thiserror::Error;

use crate::comparator::Divergence;

/// Result alias used across the engine.
pub type C2tResult<T> = Result<T, C2tError>;

/// Errors that can occur while building, debugging or comparing tests.
#[derive(Debug, Error)]
pub enum C2tError {
    /// Malformed or contradictory configuration, or an invalid directive
    #[error("configuration error: {0}")]
    Config(String),

    /// A build stage exited unsuccessfully
    #[error("build of `{test}` for {arch} failed in stage `{stage}` ({status})\n{stderr}")]
    Build {
        /// Test being built
        test: String,
        /// Architecture being built for
        arch: Arch,
        /// Name of the failing stage
        stage: String,
        /// Exit status description
        status: String,
        /// Captured stderr of the stage, verbatim
        stderr: String,
    },

    /// Malformed or unexpected remote-debug reply, or a lost connection
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Uploaded code did not read back identically
    #[error("upload verification of {section} failed at {address:#x}: wrote {expected:#04x}, read {actual:#04x}")]
    UploadVerify {
        /// Section being verified
        section: String,
        /// Address of the first mismatching byte
        address: u64,
        /// Byte that was written
        expected: u8,
        /// Byte that was read back
        actual: u8,
    },

    /// A device or debug stub never opened its port
    #[error("{what} did not open port {port} after {attempts} attempts")]
    PortTimeout {
        /// Process that was expected to listen
        what: String,
        /// Port waited on
        port: u16,
        /// Number of connection attempts made
        attempts: u32,
    },

    /// A device or debug stub exited before it became reachable
    #[error("{what} exited before opening its port ({status})")]
    Launch {
        /// Process that exited
        what: String,
        /// Exit status description
        status: String,
    },

    /// Malformed or unsupported ELF/DWARF input
    #[error("debug info error: {0}")]
    DebugInfo(String),

    /// The target and the oracle disagree
    #[error("{0}")]
    Divergence(Box<Divergence>),

    /// I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl C2tError {
    /// Process exit code associated with this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Divergence(_) => 1,
            Self::Config(_) => 2,
            Self::Build { .. } => 3,
            Self::Protocol(_) | Self::UploadVerify { .. } | Self::DebugInfo(_) => 4,
            Self::PortTimeout { .. } | Self::Launch { .. } => 5,
            Self::Io(_) => 6,
        }
    }

    /// Whether this is a test failure rather than an infrastructure fault.
    pub fn is_divergence(&self) -> bool {
        matches!(self, Self::Divergence(_))
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub(crate) fn debug_info(msg: impl Into<String>) -> Self {
        Self::DebugInfo(msg.into())
    }
}

impl From<gimli::Error> for C2tError {
    fn from(err: gimli::Error) -> Self {
        Self::DebugInfo(format!("DWARF: {err}"))
    }
}

impl From<goblin::error::Error> for C2tError {
    fn from(err: goblin::error::Error) -> Self {
        Self::DebugInfo(format!("ELF: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_separate_divergence_from_faults() {
        assert_eq!(C2tError::Config("x".into()).exit_code(), 2);
        assert_eq!(C2tError::protocol("x").exit_code(), 4);
        assert_eq!(
            C2tError::PortTimeout { what: "qemu".into(), port: 1, attempts: 3 }.exit_code(),
            5
        );
        let verify = C2tError::UploadVerify {
            section: ".text".into(),
            address: 0x10,
            expected: 1,
            actual: 2,
        };
        assert_eq!(verify.exit_code(), 4);
        assert!(!verify.is_divergence());
    }

    #[test]
    fn test_build_error_surfaces_stderr() {
        let err = C2tError::Build {
            test: "add".into(),
            arch: Arch::from("arm"),
            stage: "compiler".into(),
            status: "exit status: 1".into(),
            stderr: "add.c:3: error: expected ';'".into(),
        };
        let text = err.to_string();
        assert!(text.contains("stage `compiler`"));
        assert!(text.contains("add.c:3: error: expected ';'"));
    }
}
