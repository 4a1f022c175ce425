//! sys_enter_connect filter and emitter
//!
//! The probe body is written against two seams so it can run both inside the
//! eBPF program and in host unit tests:
//! - [`ProbeContext`]: the tracepoint arguments plus the helpers the program
//!   is allowed to call (fault-tolerant user reads, current task metadata)
//! - [`EventSink`]: the per-CPU transport the record is copied into
//!
//! Every invocation is independent. Nothing here ever reports a failure to the
//! traced syscall: unreadable memory means "no record", a full buffer means
//! "dropped record".

use crate::{
    AF_INET, COMM_LEN, ConnectEvent, SIN_ADDR_OFFSET, SIN_FAMILY_OFFSET, SysEnterConnectArgs,
};

/// A user or context read that faulted. Carries the helper's error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadFault(pub i64);

/// Everything the probe reads during one syscall entry
pub trait ProbeContext {
    /// Raw tracepoint argument block
    fn connect_args(&self) -> Result<SysEnterConnectArgs, ReadFault>;

    /// Fault-tolerant 2-byte read from the caller's address space
    fn read_user_u16(&self, addr: u64) -> Result<u16, ReadFault>;

    /// Fault-tolerant 4-byte read from the caller's address space
    fn read_user_u32(&self, addr: u64) -> Result<u32, ReadFault>;

    /// `tgid << 32 | pid` of the current task
    fn current_pid_tgid(&self) -> u64;

    /// Short name of the current task, NUL-terminated within the buffer
    fn current_comm(&self) -> [u8; COMM_LEN];
}

/// Per-CPU transport for finished records
///
/// `output` copies the record into the buffer of the CPU running the probe.
/// It must not block; when that buffer is full the record is discarded.
pub trait EventSink {
    fn output(&self, event: &ConnectEvent);
}

/// Assemble the record for one `connect()` entry, or `None` if the call
/// does not target an IPv4 address.
#[inline(always)]
pub fn build_event<C: ProbeContext>(ctx: &C) -> Option<ConnectEvent> {
    let args = ctx.connect_args().ok()?;
    let sockaddr = args.uservaddr;

    // Family gates emission: an unreadable family is the same as "not IPv4".
    let family = ctx
        .read_user_u16(sockaddr.wrapping_add(SIN_FAMILY_OFFSET))
        .ok()?;
    if family != AF_INET {
        return None;
    }

    let mut event = ConnectEvent::zeroed();
    event.pid = (ctx.current_pid_tgid() >> 32) as u32;
    event.comm = ctx.current_comm();

    // Destination is best effort: the helper zero-fills on fault and the
    // record is still emitted.
    event.daddr = ctx
        .read_user_u32(sockaddr.wrapping_add(SIN_ADDR_OFFSET))
        .unwrap_or(0);

    Some(event)
}

/// Tracepoint body: build the record and hand it to the sink.
///
/// Always returns 0; the traced syscall proceeds unchanged.
#[inline(always)]
pub fn handle_sys_enter_connect<C: ProbeContext, S: EventSink>(ctx: &C, sink: &S) -> u32 {
    if let Some(event) = build_event(ctx) {
        sink.output(&event);
    }
    0
}
