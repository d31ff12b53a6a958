//! Kernel notification records and the messaging transport interface.
//!
//! The kernel-resident interceptor and this process exchange one fixed-layout
//! record over the messaging transport. The transport itself is an external
//! collaborator; this module only defines the record, its exact binary
//! layout, and the send/receive surface the coordinator drives.

use crate::result::{Error, Result};
use serde::Serialize;

/// Upper bound on additional stop addresses one record carries.
pub const MAX_STOPS: usize = 20;
/// Capacity of each text field, terminator included.
pub const TEXT_LEN: usize = 256;
/// Exact encoded record size.
pub const RECORD_LEN: usize = 4 + 4 + 8 + MAX_STOPS * 8 + 8 + 8 + 8 + 4 + TEXT_LEN * 2;

/// Message kinds, shared with the kernel side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum MessageKind {
    /// Sent by this side: detaching from the interceptor.
    Disconnect = 0,
    /// Sent by this side: attaching to the interceptor.
    Connect = 1,
    /// Sent by this side: buffer 1 generated, new pc enclosed.
    Variant1Ready = 2,
    /// Sent by this side: buffer 2 generated, new pc enclosed.
    Variant2Ready = 3,
    /// Sent by this side: signal handler address translated.
    SigactionHandled = 4,
    /// Sent by this side: shadow-stack request serviced.
    ShadowStackHandled = 5,
    /// Sent by this side: dlopen/dlclose serviced.
    DlOperationHandled = 6,
    /// Kernel: buffer 2 is active, regenerate and swap to buffer 1.
    NeedVariant1 = 7,
    /// Kernel: buffer 1 is active, regenerate and swap to buffer 2.
    NeedVariant2 = 8,
    /// Kernel: protected process appeared.
    ProcessIn = 9,
    /// Kernel: protected process exited.
    ProcessOut = 10,
    /// Kernel: sigaction installed a handler.
    SigactionDetected = 11,
    /// Kernel: shadow stack created.
    CreateShadowStack = 12,
    /// Kernel: shadow stack freed.
    FreeShadowStack = 13,
    /// Kernel: dlopen observed.
    Dlopen = 14,
    /// Kernel: dlclose observed.
    Dlclose = 15,
    /// Kernel: the process is not the expected application.
    WrongApp = 16,
}

impl MessageKind {
    fn from_u32(v: u32) -> Result<Self> {
        use MessageKind::*;
        Ok(match v {
            0 => Disconnect,
            1 => Connect,
            2 => Variant1Ready,
            3 => Variant2Ready,
            4 => SigactionHandled,
            5 => ShadowStackHandled,
            6 => DlOperationHandled,
            7 => NeedVariant1,
            8 => NeedVariant2,
            9 => ProcessIn,
            10 => ProcessOut,
            11 => SigactionDetected,
            12 => CreateShadowStack,
            13 => FreeShadowStack,
            14 => Dlopen,
            15 => Dlclose,
            16 => WrongApp,
            other => return Err(Error::UnknownMessageKind(other)),
        })
    }
}

/// How the protected process addresses its shadow stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum SsMode {
    /// Fixed offset from the native stack; gs base is zero.
    Offset = 0,
    /// gs-segment addressed.
    GsSegment = 1,
    /// gs-segment addressed with paired index section.
    GsSegmentPp = 2,
}

impl SsMode {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => SsMode::Offset,
            1 => SsMode::GsSegment,
            2 => SsMode::GsSegmentPp,
            other => return Err(Error::UnknownSsMode(other)),
        })
    }
}

/// One fixed-layout notification record.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: MessageKind,
    pub pid: i32,
    /// Current (incoming) or translated (outgoing) instruction pointer.
    pub new_ip: u64,
    /// Additional stop addresses; unused slots are zero.
    pub stop_ips: [u64; MAX_STOPS],
    /// Offset from a module's executable mapping to its code cache.
    pub cc_offset: u64,
    /// Offset from the native stack to the shadow stack.
    pub ss_offset: u64,
    pub gs_base: u64,
    pub ss_mode: SsMode,
    pub app_name: String,
    pub message: String,
}

impl Notification {
    /// A zeroed record of the given kind.
    pub fn new(kind: MessageKind, pid: i32) -> Self {
        Self {
            kind,
            pid,
            new_ip: 0,
            stop_ips: [0; MAX_STOPS],
            cc_offset: 0,
            ss_offset: 0,
            gs_base: 0,
            ss_mode: SsMode::Offset,
            app_name: String::new(),
            message: String::new(),
        }
    }

    /// Reply carrying a translated program counter and stop addresses.
    pub fn reply(
        kind: MessageKind,
        pid: i32,
        new_ip: u64,
        stop_ips: [u64; MAX_STOPS],
        message: &str,
    ) -> Self {
        let mut n = Self::new(kind, pid);
        n.new_ip = new_ip;
        n.stop_ips = stop_ips;
        n.message = message.to_string();
        n
    }

    /// Encodes the record into its exact wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_LEN);
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.new_ip.to_le_bytes());
        for ip in &self.stop_ips {
            out.extend_from_slice(&ip.to_le_bytes());
        }
        out.extend_from_slice(&self.cc_offset.to_le_bytes());
        out.extend_from_slice(&self.ss_offset.to_le_bytes());
        out.extend_from_slice(&self.gs_base.to_le_bytes());
        out.extend_from_slice(&(self.ss_mode as u32).to_le_bytes());
        push_text(&mut out, &self.app_name);
        push_text(&mut out, &self.message);
        debug_assert_eq!(out.len(), RECORD_LEN);
        out
    }

    /// Decodes a record from its wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_LEN {
            return Err(Error::TruncatedRecord(bytes.len()));
        }
        let kind = MessageKind::from_u32(u32_at(bytes, 0))?;
        let pid = u32_at(bytes, 4) as i32;
        let new_ip = u64_at(bytes, 8);
        let mut stop_ips = [0u64; MAX_STOPS];
        for (i, slot) in stop_ips.iter_mut().enumerate() {
            *slot = u64_at(bytes, 16 + i * 8);
        }
        let tail = 16 + MAX_STOPS * 8;
        let cc_offset = u64_at(bytes, tail);
        let ss_offset = u64_at(bytes, tail + 8);
        let gs_base = u64_at(bytes, tail + 16);
        let ss_mode = SsMode::from_u32(u32_at(bytes, tail + 24))?;
        let app_name = pull_text(&bytes[tail + 28..tail + 28 + TEXT_LEN]);
        let message = pull_text(&bytes[tail + 28 + TEXT_LEN..tail + 28 + 2 * TEXT_LEN]);
        Ok(Self {
            kind,
            pid,
            new_ip,
            stop_ips,
            cc_offset,
            ss_offset,
            gs_base,
            ss_mode,
            app_name,
            message,
        })
    }
}

fn u32_at(bytes: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], pos: usize) -> u64 {
    u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap())
}

fn push_text(out: &mut Vec<u8>, text: &str) {
    let bytes = text.as_bytes();
    let take = bytes.len().min(TEXT_LEN - 1);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + TEXT_LEN - take, 0);
}

fn pull_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// The messaging transport the kernel collaborator provides.
pub trait Transport {
    fn send(&mut self, notification: &Notification) -> Result<()>;
    fn recv(&mut self) -> Result<Notification>;
}
