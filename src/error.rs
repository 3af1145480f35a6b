/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use miette::Diagnostic;
use rtp_rs::RtpPacketBuildError;
use std::{fmt::Display, io, net::AddrParseError, time::Duration};
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum MessageError {
    #[error("payload size mismatch: expected {expected} bytes, got {actual}")]
    PayloadSizeMismatch { expected: usize, actual: usize },
    #[error("frame dimensions overflow the payload size calculation")]
    FrameDimensionsOverflow,
}

#[derive(Error, Debug, Diagnostic)]
pub enum StageError {
    #[error("unsupported message: type 0x{msg_type:08x}, subtype {subtype}")]
    BadMessage { msg_type: u32, subtype: u32 },
    #[error("stage is already driven by a different chain (pushed from '{0}')")]
    WrongChain(String),
    #[error("stage mutex is poisoned")]
    Poisoned,
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("output queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("RTP session error: {0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug, Diagnostic)]
pub enum QueueError {
    #[error("a state is already present for source {0}")]
    StateExists(u64),
}

#[derive(Error, Debug, Diagnostic)]
pub enum ChainError {
    #[error("chain is already running")]
    AlreadyRunning,
    #[error("chain is not running")]
    NotRunning,
    #[error("chain is running, stop it first")]
    Running,
    #[error("no start stage has been set")]
    NoStartStage,
    #[error("an identical connection already exists")]
    DuplicateConnection,
    #[error("no such connection")]
    NoSuchConnection,
    #[error("cycle detected in the non-feedback connection graph")]
    Cycle,
    #[error("stages unreachable from the start stage: {}", .0.join(", "))]
    UnreachableStages(Vec<String>),
    #[error("chain worker did not exit within {0:?}")]
    StopTimeout(Duration),
    #[error("could not spawn chain worker: {0}")]
    IoError(#[from] io::Error),
}

#[derive(Error, Debug, Diagnostic)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("RTP packet builder error: {0:?}")]
    RtpPacketBuildError(#[from] WrappedRtpPacketBuildError),
    #[error("RTCP error: {0}")]
    RtcpError(String),
    #[error("session is not active")]
    Inactive,
    #[error("session worker channel closed")]
    ChannelClosed,
    #[error("config error: {0}")]
    ConfigError(#[from] ConfigError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum SyncError {
    #[error("stream {0} is not registered")]
    UnknownStream(u64),
    #[error("an empty CNAME is not allowed")]
    InvalidCname,
}

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("invalid IP address: {0}")]
    InvalidIp(#[from] AddrParseError),
    #[error("no free RTP/RTCP port pair found")]
    NoFreePortPair,
}

pub type MessageResult<T> = Result<T, MessageError>;
pub type StageResult<T> = Result<T, StageError>;
pub type QueueResult<T> = Result<T, QueueError>;
pub type ChainResult<T> = Result<T, ChainError>;
pub type SessionResult<T> = Result<T, SessionError>;
pub type SyncResult<T> = Result<T, SyncError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug, Diagnostic)]
pub struct WrappedRtpPacketBuildError(pub RtpPacketBuildError);

impl Display for WrappedRtpPacketBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
