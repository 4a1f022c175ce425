#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_probe_read_user},
    macros::{map, tracepoint},
    maps::PerfEventArray,
    programs::TracePointContext,
};
use connwatch_common::{
    COMM_LEN, ConnectEvent, SysEnterConnectArgs,
    probe::{EventSink, ProbeContext, ReadFault, handle_sys_enter_connect},
};

// =============================================================================
// Maps
// =============================================================================

/// Per-CPU perf buffer for connect events.
/// Userspace sizes each CPU's ring when it opens the buffers; a full ring
/// drops new samples and bumps the kernel's lost counter.
#[map]
static EVENTS: PerfEventArray<ConnectEvent> = PerfEventArray::new(0);

// =============================================================================
// Helper bindings
// =============================================================================

/// Tracepoint context plus the helpers the probe body may call
struct TracepointProbe<'a> {
    ctx: &'a TracePointContext,
}

impl ProbeContext for TracepointProbe<'_> {
    #[inline(always)]
    fn connect_args(&self) -> Result<SysEnterConnectArgs, ReadFault> {
        unsafe { self.ctx.read_at::<SysEnterConnectArgs>(0) }.map_err(ReadFault)
    }

    #[inline(always)]
    fn read_user_u16(&self, addr: u64) -> Result<u16, ReadFault> {
        unsafe { bpf_probe_read_user(addr as *const u16) }.map_err(|e| ReadFault(e as i64))
    }

    #[inline(always)]
    fn read_user_u32(&self, addr: u64) -> Result<u32, ReadFault> {
        unsafe { bpf_probe_read_user(addr as *const u32) }.map_err(|e| ReadFault(e as i64))
    }

    #[inline(always)]
    fn current_pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn current_comm(&self) -> [u8; COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0u8; COMM_LEN])
    }
}

/// Writes to the current CPU's ring (aya sets BPF_F_CURRENT_CPU)
struct PerfSink<'a> {
    ctx: &'a TracePointContext,
}

impl EventSink for PerfSink<'_> {
    #[inline(always)]
    fn output(&self, event: &ConnectEvent) {
        EVENTS.output(self.ctx, event, 0);
    }
}

// =============================================================================
// Network Connect Tracepoint
// =============================================================================

/// sys_enter_connect tracepoint - one record per IPv4 connect() attempt
/// int connect(int sockfd, const struct sockaddr *addr, socklen_t addrlen);
#[tracepoint]
pub fn sys_enter_connect(ctx: TracePointContext) -> u32 {
    let probe = TracepointProbe { ctx: &ctx };
    let sink = PerfSink { ctx: &ctx };
    handle_sys_enter_connect(&probe, &sink)
}

// =============================================================================
// Required for eBPF programs
// =============================================================================

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
