#![cfg_attr(not(test), no_std)]

pub mod probe;

use core::mem::{offset_of, size_of};

/// Command name length (TASK_COMM_LEN)
pub const COMM_LEN: usize = 16;

/// AF_INET - IPv4
pub const AF_INET: u16 = 2;

/// Name of the perf event array map in the eBPF object
pub const EVENTS_MAP: &str = "EVENTS";

/// Name of the tracepoint program in the eBPF object
pub const PROGRAM_NAME: &str = "sys_enter_connect";

/// Tracepoint category and event the program attaches to
pub const TRACEPOINT_CATEGORY: &str = "syscalls";
pub const TRACEPOINT_NAME: &str = "sys_enter_connect";

// =============================================================================
// Wire record
// =============================================================================

/// Outbound IPv4 connect event sent from kernel to userspace via perf buffer
///
/// This struct is shared between eBPF (kernel) and userspace code.
/// It must be:
/// - `#[repr(C)]` for consistent memory layout
/// - `Copy` for eBPF map operations
/// - Fixed size (no dynamic allocation, no pointers)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectEvent {
    /// Process ID (tgid, not the thread id)
    pub pid: u32,
    /// Process command name (null-terminated, zero-padded)
    pub comm: [u8; COMM_LEN],
    /// Destination IPv4 address - network byte order, stored verbatim
    pub daddr: u32,
}

impl ConnectEvent {
    /// Size of the record on the wire
    pub const SIZE: usize = size_of::<Self>();

    /// Create a new zeroed event
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            comm: [0u8; COMM_LEN],
            daddr: 0,
        }
    }

    /// Destination address octets in the order they appear on the wire
    pub fn daddr_octets(&self) -> [u8; 4] {
        self.daddr.to_ne_bytes()
    }

    /// Bytes of `comm` before the first NUL (all 16 if there is none)
    pub fn comm_bytes(&self) -> &[u8] {
        let end = self
            .comm
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.comm.len());
        &self.comm[..end]
    }
}

const _: () = assert!(ConnectEvent::SIZE == 24);
const _: () = assert!(offset_of!(ConnectEvent, pid) == 0);
const _: () = assert!(offset_of!(ConnectEvent, comm) == 4);
const _: () = assert!(offset_of!(ConnectEvent, daddr) == 20);

// Implement Pod trait for aya userspace when the "user" feature is enabled
#[cfg(feature = "user")]
unsafe impl aya::Pod for ConnectEvent {}

// =============================================================================
// Tracepoint / socket ABI
// =============================================================================

/// Tracepoint arguments for sys_enter_connect
/// See: /sys/kernel/tracing/events/syscalls/sys_enter_connect/format
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SysEnterConnectArgs {
    /// Common tracepoint fields
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
    /// Syscall number
    pub syscall_nr: i32,
    /// Padding
    pub _pad: i32,
    /// Socket file descriptor
    pub fd: i64,
    /// Pointer to sockaddr structure (caller address space)
    pub uservaddr: u64,
    /// Address length
    pub addrlen: i64,
}

const _: () = assert!(offset_of!(SysEnterConnectArgs, uservaddr) == 24);

/// Offset of `sin_family` within `struct sockaddr_in`
pub const SIN_FAMILY_OFFSET: u64 = 0;

/// Offset of `sin_addr.s_addr` within `struct sockaddr_in`
pub const SIN_ADDR_OFFSET: u64 = 4;
