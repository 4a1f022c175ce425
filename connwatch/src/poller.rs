//! Drain the per-CPU perf buffers
//!
//! Records from one CPU come out in the order the probe wrote them. CPUs are
//! visited in ascending order on every poll; there is no ordering across CPUs.

use aya::maps::{
    MapData,
    perf::{PerfBufferError, PerfEventArrayBuffer},
};
use bytes::BytesMut;
use connwatch_common::ConnectEvent;
use log::{trace, warn};

use crate::event::{ConnectRecord, decode};
use crate::loader::CpuBuffer;

/// Samples read from one CPU ring per `read_events` call
const BATCH: usize = 64;

/// `read_events` calls allowed per CPU on each poll. A ring that is refilled
/// faster than it is drained must not keep the loop away from the other CPUs
/// or from the shutdown check.
const MAX_BATCHES_PER_CPU: usize = 4;

/// Running totals since the poller was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Records decoded and handed to the handler
    pub received: u64,
    /// Samples the kernel dropped because a ring was full
    pub lost: u64,
    /// Samples too short to hold a record
    pub malformed: u64,
}

/// Outcome of one batched read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Batch {
    /// Samples written to the front of the scratch buffers
    pub read: usize,
    /// Samples the producer dropped since the previous read
    pub lost: usize,
}

/// A single CPU's ring as seen by the drain loop
pub trait SampleSource {
    type Error: std::fmt::Display;

    fn readable(&self) -> bool;

    fn read_batch(&mut self, scratch: &mut [BytesMut]) -> Result<Batch, Self::Error>;
}

impl SampleSource for PerfEventArrayBuffer<MapData> {
    type Error = PerfBufferError;

    fn readable(&self) -> bool {
        PerfEventArrayBuffer::readable(self)
    }

    fn read_batch(&mut self, scratch: &mut [BytesMut]) -> Result<Batch, Self::Error> {
        let events = self.read_events(scratch)?;
        Ok(Batch {
            read: events.read,
            lost: events.lost,
        })
    }
}

pub struct Poller<S = PerfEventArrayBuffer<MapData>> {
    buffers: Vec<CpuBuffer<S>>,
    scratch: Vec<BytesMut>,
    stats: PollStats,
}

impl<S: SampleSource> Poller<S> {
    pub fn new(mut buffers: Vec<CpuBuffer<S>>) -> Self {
        buffers.sort_by_key(|b| b.cpu);
        let scratch = (0..BATCH)
            // perf pads each sample to 8 bytes
            .map(|_| BytesMut::with_capacity(ConnectEvent::SIZE + 8))
            .collect();
        Self {
            buffers,
            scratch,
            stats: PollStats::default(),
        }
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// Visit every CPU once, reading at most `MAX_BATCHES_PER_CPU` batches
    /// from each. Returns the number of records passed to `handler`.
    pub fn poll(&mut self, mut handler: impl FnMut(ConnectRecord)) -> u64 {
        let before = self.stats.received;

        for CpuBuffer { cpu, buffer } in self.buffers.iter_mut() {
            drain_cpu(
                *cpu,
                buffer,
                &mut self.scratch,
                &mut self.stats,
                &mut handler,
                MAX_BATCHES_PER_CPU,
            );
        }

        self.stats.received - before
    }
}

/// Read up to `max_batches` batches from one CPU ring.
fn drain_cpu<S: SampleSource>(
    cpu: u32,
    source: &mut S,
    scratch: &mut [BytesMut],
    stats: &mut PollStats,
    handler: &mut impl FnMut(ConnectRecord),
    max_batches: usize,
) {
    for _ in 0..max_batches {
        if !source.readable() {
            break;
        }
        let batch = match source.read_batch(scratch) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("cpu {cpu}: failed to read perf buffer: {e}");
                break;
            }
        };
        if batch.lost > 0 {
            warn!("cpu {cpu}: {} events lost (buffer full)", batch.lost);
            stats.lost += batch.lost as u64;
        }
        dispatch(cpu, &scratch[..batch.read], stats, handler);
        if batch.read == 0 {
            break;
        }
    }
}

/// Decode one batch of raw samples from `cpu` in order
fn dispatch<S: AsRef<[u8]>>(
    cpu: u32,
    samples: &[S],
    stats: &mut PollStats,
    handler: &mut impl FnMut(ConnectRecord),
) {
    for sample in samples {
        match decode(sample.as_ref()) {
            Ok(event) => {
                stats.received += 1;
                handler(ConnectRecord::from_event(cpu, &event));
            }
            Err(e) => {
                stats.malformed += 1;
                trace!("cpu {cpu}: dropping sample: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample(pid: u32, octets: [u8; 4]) -> Vec<u8> {
        let mut event = ConnectEvent::zeroed();
        event.pid = pid;
        event.comm[..4].copy_from_slice(b"test");
        event.daddr = u32::from_ne_bytes(octets);

        let mut raw = vec![0u8; ConnectEvent::SIZE + 4];
        raw[0..4].copy_from_slice(&event.pid.to_ne_bytes());
        raw[4..20].copy_from_slice(&event.comm);
        raw[20..24].copy_from_slice(&event.daddr.to_ne_bytes());
        raw
    }

    #[test]
    fn test_dispatch_preserves_order() {
        let samples: Vec<Vec<u8>> = (0..10u32)
            .map(|i| sample(i, [10, 0, 0, i as u8]))
            .collect();
        let mut stats = PollStats::default();
        let mut seen = Vec::new();

        dispatch(3, &samples, &mut stats, &mut |record| seen.push(record));

        assert_eq!(stats.received, 10);
        assert_eq!(seen.len(), 10);
        for (i, record) in seen.iter().enumerate() {
            assert_eq!(record.cpu, 3);
            assert_eq!(record.pid, i as u32);
            assert_eq!(record.daddr, Ipv4Addr::new(10, 0, 0, i as u8));
            assert_eq!(record.comm, "test");
        }
    }

    #[test]
    fn test_dispatch_counts_malformed_samples() {
        let samples = vec![sample(1, [1, 1, 1, 1]), vec![0u8; 7], sample(2, [2, 2, 2, 2])];
        let mut stats = PollStats::default();
        let mut pids = Vec::new();

        dispatch(0, &samples, &mut stats, &mut |record| pids.push(record.pid));

        assert_eq!(pids, vec![1, 2]);
        assert_eq!(
            stats,
            PollStats {
                received: 2,
                lost: 0,
                malformed: 1
            }
        );
    }

    /// Ring that is refilled as fast as it is read
    struct FloodedRing {
        next_pid: u32,
        reads: usize,
        lost_per_read: usize,
    }

    impl FloodedRing {
        fn new(first_pid: u32) -> Self {
            Self {
                next_pid: first_pid,
                reads: 0,
                lost_per_read: 0,
            }
        }
    }

    impl SampleSource for FloodedRing {
        type Error = String;

        fn readable(&self) -> bool {
            true
        }

        fn read_batch(&mut self, scratch: &mut [BytesMut]) -> Result<Batch, String> {
            self.reads += 1;
            for buf in scratch.iter_mut() {
                buf.clear();
                buf.extend_from_slice(&sample(self.next_pid, [10, 0, 0, 1]));
                self.next_pid += 1;
            }
            Ok(Batch {
                read: scratch.len(),
                lost: self.lost_per_read,
            })
        }
    }

    /// Ring whose reads always fail
    struct BrokenRing;

    impl SampleSource for BrokenRing {
        type Error = String;

        fn readable(&self) -> bool {
            true
        }

        fn read_batch(&mut self, _scratch: &mut [BytesMut]) -> Result<Batch, String> {
            Err("mmap gone".to_string())
        }
    }

    #[test]
    fn test_drain_cpu_stops_after_max_batches() {
        let mut ring = FloodedRing::new(0);
        let mut scratch = vec![BytesMut::new(); 8];
        let mut stats = PollStats::default();
        let mut pids = Vec::new();

        drain_cpu(0, &mut ring, &mut scratch, &mut stats, &mut |r| pids.push(r.pid), 3);

        assert!(ring.readable());
        assert_eq!(ring.reads, 3);
        assert_eq!(stats.received, 24);
        assert_eq!(pids, (0..24).collect::<Vec<u32>>());
    }

    #[test]
    fn test_poll_returns_while_rings_stay_readable() {
        let buffers = vec![
            CpuBuffer {
                cpu: 1,
                buffer: FloodedRing::new(1_000),
            },
            CpuBuffer {
                cpu: 0,
                buffer: FloodedRing::new(0),
            },
        ];
        let mut poller = Poller::new(buffers);
        let mut per_cpu = [0u64; 2];

        let handled = poller.poll(|record| per_cpu[record.cpu as usize] += 1);

        let per_cpu_limit = (BATCH * MAX_BATCHES_PER_CPU) as u64;
        assert_eq!(per_cpu, [per_cpu_limit, per_cpu_limit]);
        assert_eq!(handled, 2 * per_cpu_limit);

        // The next pass picks up where the previous one stopped.
        let mut first = None;
        poller.poll(|record| {
            if record.cpu == 0 && first.is_none() {
                first = Some(record.pid);
            }
        });
        assert_eq!(first, Some(per_cpu_limit as u32));
    }

    #[test]
    fn test_lost_samples_are_counted() {
        let mut ring = FloodedRing::new(0);
        ring.lost_per_read = 5;
        let mut scratch = vec![BytesMut::new(); 2];
        let mut stats = PollStats::default();

        drain_cpu(0, &mut ring, &mut scratch, &mut stats, &mut |_| {}, 2);

        assert_eq!(stats.lost, 10);
        assert_eq!(stats.received, 4);
    }

    #[test]
    fn test_read_error_moves_on_to_next_cpu() {
        let mut poller = Poller::new(vec![CpuBuffer {
            cpu: 0,
            buffer: BrokenRing,
        }]);
        assert_eq!(poller.poll(|_| panic!("no records expected")), 0);
        assert_eq!(poller.stats(), PollStats::default());
    }
}
