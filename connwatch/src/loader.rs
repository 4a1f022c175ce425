//! Load the connect probe, attach it and hand out its per-CPU buffers
//!
//! [`ConnectProbe`] owns the loaded object. The tracepoint stays attached and
//! the `EVENTS` map stays open for as long as it lives; dropping it detaches
//! the program.

use aya::{
    Ebpf, EbpfError,
    maps::{
        MapData, MapError,
        perf::{PerfBufferError, PerfEventArray, PerfEventArrayBuffer},
    },
    programs::{ProgramError, TracePoint},
};
use connwatch_common::{EVENTS_MAP, PROGRAM_NAME, TRACEPOINT_CATEGORY, TRACEPOINT_NAME};
use log::{debug, info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to load eBPF object: {0}")]
    Ebpf(#[from] EbpfError),

    #[error("program {0} not found in eBPF object")]
    MissingProgram(&'static str),

    #[error("map {0} not found in eBPF object")]
    MissingMap(&'static str),

    #[error("program error: {0}")]
    Program(#[from] ProgramError),

    #[error("map error: {0}")]
    Map(#[from] MapError),

    #[error("failed to open perf buffer for cpu {cpu}: {source}")]
    PerfBuffer {
        cpu: u32,
        #[source]
        source: PerfBufferError,
    },

    #[error("failed to enumerate online cpus ({path}): {source}")]
    OnlineCpus {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// One opened per-CPU ring
pub struct CpuBuffer<S = PerfEventArrayBuffer<MapData>> {
    pub cpu: u32,
    pub buffer: S,
}

/// The attached sys_enter_connect probe and its transport
pub struct ConnectProbe {
    // Keeps the program and its link alive.
    _ebpf: Ebpf,
    events: PerfEventArray<MapData>,
}

impl ConnectProbe {
    /// Load `object`, attach the tracepoint and take the events map.
    pub fn attach(object: &[u8]) -> Result<Self, LoadError> {
        let mut ebpf = Ebpf::load(object)?;

        let program: &mut TracePoint = ebpf
            .program_mut(PROGRAM_NAME)
            .ok_or(LoadError::MissingProgram(PROGRAM_NAME))?
            .try_into()?;
        program.load()?;
        program.attach(TRACEPOINT_CATEGORY, TRACEPOINT_NAME)?;
        info!("Attached tracepoint {TRACEPOINT_CATEGORY}/{TRACEPOINT_NAME}");

        let map = ebpf
            .take_map(EVENTS_MAP)
            .ok_or(LoadError::MissingMap(EVENTS_MAP))?;
        let events = PerfEventArray::try_from(map)?;

        Ok(Self {
            _ebpf: ebpf,
            events,
        })
    }

    /// Open a ring of `pages` pages for every online CPU.
    pub fn open_buffers(&mut self, pages: usize) -> Result<Vec<CpuBuffer>, LoadError> {
        let cpus = aya::util::online_cpus()
            .map_err(|(path, source)| LoadError::OnlineCpus { path, source })?;

        let mut buffers = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            let buffer = self
                .events
                .open(cpu, Some(pages))
                .map_err(|source| LoadError::PerfBuffer { cpu, source })?;
            buffers.push(CpuBuffer { cpu, buffer });
        }
        debug!("Opened {} per-cpu buffers ({pages} pages each)", buffers.len());
        Ok(buffers)
    }
}

/// Bump the memlock rlimit for older kernels that account map memory there
pub fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

/// Log what we can tell about the host before loading
pub fn preflight() {
    if !is_root() {
        warn!("not running as root - loading the probe will likely fail");
    }
    match std::fs::read_to_string("/proc/sys/kernel/osrelease") {
        Ok(release) => match parse_kernel_version(&release) {
            Some((major, minor, patch)) => info!("Kernel {major}.{minor}.{patch}"),
            None => debug!("unrecognized kernel release: {}", release.trim()),
        },
        Err(e) => debug!("could not read kernel release: {e}"),
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Parse `major.minor[.patch][-suffix]` from a kernel release string
fn parse_kernel_version(release: &str) -> Option<(u32, u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.split('-').next()?.parse().ok()?;
    let patch = parts
        .next()
        .and_then(|p| p.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(parse_kernel_version("6.8.0-45-generic\n"), Some((6, 8, 0)));
        assert_eq!(parse_kernel_version("5.15.153.1-microsoft-standard-WSL2"), Some((5, 15, 153)));
        assert_eq!(parse_kernel_version("6.1-rc3"), Some((6, 1, 0)));
        assert_eq!(parse_kernel_version("garbage"), None);
    }
}
