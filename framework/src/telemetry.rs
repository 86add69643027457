//! Chunked IMU telemetry reassembly (finish gate).
//!
//! A telemetry car streams a whole run as HEADER → CHUNK… → END over the
//! radio. The header sizes the receive buffer, chunks land at fixed sample
//! offsets (`chunk_index × 14`), and the end marker carries the declared
//! sample count plus a CRC-16 over the raw sample bytes. Verification
//! failures are warnings, never discards — a slightly torn run is still
//! worth keeping. The buffer is freed on END either way, and a fresh
//! HEADER abandons any run in progress.

use log::{info, warn};

use crate::peers::{format_mac, Mac};
use crate::wire::{crc16, ImuSample, TelemChunk, TelemEnd, TelemHeader, TELEM_SAMPLES_PER_CHUNK};

/// Accelerometer LSB → g, at the ±16 g range the car records with.
pub const ACCEL_LSB_TO_G: f64 = 0.000_488;
/// Gyro LSB → degrees/second.
pub const GYRO_LSB_TO_DPS: f64 = 0.070;

/// A fully reassembled run, ready for CSV export and acknowledgement.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub run_id: u32,
    pub sample_rate: u16,
    pub duration_ms: u32,
    pub src: Mac,
    /// Samples actually received; echoed back in the acknowledgement.
    pub received_samples: u16,
    pub samples: Vec<ImuSample>,
    /// Sample count and CRC matched the end marker.
    pub verified: bool,
}

impl CompletedRun {
    /// Physical-unit CSV rows for the dashboard download.
    pub const CSV_HEADER: &'static str =
        "timestamp_ms,accel_x_g,accel_y_g,accel_z_g,gyro_x_dps,gyro_y_dps,gyro_z_dps";

    pub fn csv_rows(&self) -> impl Iterator<Item = String> + '_ {
        self.samples.iter().map(|s| {
            format!(
                "{:.3},{:.4},{:.4},{:.4},{:.2},{:.2},{:.2}",
                s.t_us as f64 / 1000.0,
                s.ax as f64 * ACCEL_LSB_TO_G,
                s.ay as f64 * ACCEL_LSB_TO_G,
                s.az as f64 * ACCEL_LSB_TO_G,
                s.gx as f64 * GYRO_LSB_TO_DPS,
                s.gy as f64 * GYRO_LSB_TO_DPS,
                s.gz as f64 * GYRO_LSB_TO_DPS,
            )
        })
    }
}

struct RunInProgress {
    run_id: u32,
    expected_samples: u16,
    received_samples: u16,
    expected_chunks: u8,
    received_chunks: u8,
    sample_rate: u16,
    duration_ms: u32,
    src: Mac,
    samples: Vec<ImuSample>,
}

/// Reassembles one run at a time.
#[derive(Default)]
pub struct Reassembler {
    current: Option<RunInProgress>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// A new run announcement. Any run in progress is abandoned — its
    /// buffer freed — and a buffer for the announced sample count is
    /// allocated. Allocation failure drops the run (the radio will not
    /// retry; the car re-sends on the next race).
    pub fn on_header(&mut self, src: Mac, header: &TelemHeader) {
        if self.current.is_some() {
            warn!("[TELEM] New header while run in progress, dropping old run");
        }
        self.current = None;

        info!(
            "[TELEM] Header: run={} {} samples @{}Hz, {}ms from {}",
            header.run_id,
            header.sample_count,
            header.sample_rate,
            header.duration_ms,
            format_mac(&src)
        );

        let mut samples = Vec::new();
        if samples
            .try_reserve_exact(header.sample_count as usize)
            .is_err()
        {
            warn!(
                "[TELEM] Allocation failed for {} samples, dropping run",
                header.sample_count
            );
            return;
        }
        samples.resize(header.sample_count as usize, ImuSample::default());

        self.current = Some(RunInProgress {
            run_id: header.run_id,
            expected_samples: header.sample_count,
            received_samples: 0,
            expected_chunks: 0,
            received_chunks: 0,
            sample_rate: header.sample_rate,
            duration_ms: header.duration_ms,
            src,
            samples,
        });
    }

    /// One chunk. Stale run ids (a late chunk from an abandoned run) are
    /// dropped; in-range samples are copied to `chunk_index × 14`.
    pub fn on_chunk(&mut self, chunk: &TelemChunk) {
        let Some(run) = self.current.as_mut() else {
            warn!("[TELEM] Chunk with no run in progress");
            return;
        };
        if chunk.run_id != run.run_id {
            warn!(
                "[TELEM] Stale chunk (run {}, expected {})",
                chunk.run_id, run.run_id
            );
            return;
        }

        if run.expected_chunks == 0 {
            run.expected_chunks = chunk.total_chunks;
        }

        let offset = chunk.chunk_index as usize * TELEM_SAMPLES_PER_CHUNK;
        let mut count = chunk.samples_in_chunk as usize;
        if count > TELEM_SAMPLES_PER_CHUNK {
            count = TELEM_SAMPLES_PER_CHUNK;
        }
        if offset + count > run.samples.len() {
            warn!(
                "[TELEM] Chunk {} overflows buffer ({} + {} > {})",
                chunk.chunk_index,
                offset,
                count,
                run.samples.len()
            );
            count = run.samples.len().saturating_sub(offset);
        }

        run.samples[offset..offset + count].copy_from_slice(&chunk.samples[..count]);
        run.received_samples += count as u16;
        run.received_chunks += 1;

        if run.received_chunks % 10 == 0 || run.received_chunks == run.expected_chunks {
            info!(
                "[TELEM] Chunk {}/{} ({}/{} samples)",
                run.received_chunks, run.expected_chunks, run.received_samples, run.expected_samples
            );
        }
    }

    /// The end marker. Verifies the declared count and the CRC over the
    /// raw sample bytes; mismatches are logged but the data is still
    /// returned. The caller acknowledges with the received sample count.
    pub fn on_end(&mut self, end: &TelemEnd) -> Option<CompletedRun> {
        let run = self.current.take()?;
        if end.run_id != run.run_id {
            warn!("[TELEM] Stale end marker (run {})", end.run_id);
            self.current = Some(run);
            return None;
        }

        let mut verified = true;
        if run.received_samples != end.sample_count {
            warn!(
                "[TELEM] Received {} samples, end marker says {}",
                run.received_samples, end.sample_count
            );
            verified = false;
        }

        let mut raw = Vec::with_capacity(run.received_samples as usize * 16);
        for s in &run.samples[..run.received_samples as usize] {
            raw.extend_from_slice(&s.to_bytes());
        }
        let local_crc = crc16(&raw);
        if local_crc != end.checksum {
            warn!(
                "[TELEM] CRC mismatch (local={:#06X}, remote={:#06X})",
                local_crc, end.checksum
            );
            verified = false;
        } else {
            info!("[TELEM] CRC OK: {local_crc:#06X}");
        }

        Some(CompletedRun {
            run_id: run.run_id,
            sample_rate: run.sample_rate,
            duration_ms: run.duration_ms,
            src: run.src,
            received_samples: run.received_samples,
            samples: run.samples,
            verified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAR_MAC: Mac = [0xC0, 0, 0, 0, 0, 7];

    fn header(run_id: u32, sample_count: u16) -> TelemHeader {
        TelemHeader {
            run_id,
            sample_count,
            sample_rate: 200,
            accel_range: 16,
            gyro_range_div100: 20,
            duration_ms: sample_count as u32 * 5,
            start_ts: 1_000_000,
        }
    }

    fn sample(n: u16) -> ImuSample {
        ImuSample {
            t_us: n as u32 * 5_000,
            ax: n as i16,
            ay: -(n as i16),
            az: 2048,
            gx: 3,
            gy: -3,
            gz: 0,
        }
    }

    fn chunk(run_id: u32, index: u8, total: u8, count: u8, first_sample: u16) -> TelemChunk {
        let mut samples = [ImuSample::default(); TELEM_SAMPLES_PER_CHUNK];
        for i in 0..count as usize {
            samples[i] = sample(first_sample + i as u16);
        }
        TelemChunk {
            chunk_index: index,
            total_chunks: total,
            samples_in_chunk: count,
            run_id,
            samples,
        }
    }

    fn crc_of(samples: &[ImuSample]) -> u16 {
        let mut raw = Vec::new();
        for s in samples {
            raw.extend_from_slice(&s.to_bytes());
        }
        crc16(&raw)
    }

    #[test]
    fn reassembles_two_chunks_with_valid_crc() {
        let mut r = Reassembler::new();
        r.on_header(CAR_MAC, &header(1, 20));
        r.on_chunk(&chunk(1, 0, 2, 14, 0));
        r.on_chunk(&chunk(1, 1, 2, 6, 14));

        let expected: Vec<ImuSample> = (0..20).map(sample).collect();
        let run = r
            .on_end(&TelemEnd {
                run_id: 1,
                sample_count: 20,
                checksum: crc_of(&expected),
            })
            .expect("completed run");

        assert!(run.verified);
        assert_eq!(run.samples, expected);
        assert!(!r.in_progress(), "buffer freed on end");
    }

    #[test]
    fn crc_mismatch_warns_but_keeps_data() {
        let mut r = Reassembler::new();
        r.on_header(CAR_MAC, &header(2, 14));
        r.on_chunk(&chunk(2, 0, 1, 14, 0));

        let run = r
            .on_end(&TelemEnd {
                run_id: 2,
                sample_count: 14,
                checksum: 0xDEAD,
            })
            .expect("data still emitted");
        assert!(!run.verified);
        assert_eq!(run.samples.len(), 14);
    }

    #[test]
    fn stale_chunk_is_dropped() {
        let mut r = Reassembler::new();
        r.on_header(CAR_MAC, &header(3, 14));
        r.on_chunk(&chunk(99, 0, 1, 14, 0)); // wrong run id

        let run = r
            .on_end(&TelemEnd {
                run_id: 3,
                sample_count: 0,
                checksum: crc16(&[]),
            })
            .unwrap();
        assert_eq!(run.samples, vec![ImuSample::default(); 14]);
    }

    #[test]
    fn out_of_range_chunk_is_clamped() {
        let mut r = Reassembler::new();
        r.on_header(CAR_MAC, &header(4, 10));
        // Chunk claims 14 samples but only 10 fit.
        r.on_chunk(&chunk(4, 0, 1, 14, 0));

        let expected: Vec<ImuSample> = (0..10).map(sample).collect();
        let run = r
            .on_end(&TelemEnd {
                run_id: 4,
                sample_count: 10,
                checksum: crc_of(&expected),
            })
            .unwrap();
        assert!(run.verified);
    }

    #[test]
    fn fresh_header_abandons_run_in_progress() {
        let mut r = Reassembler::new();
        r.on_header(CAR_MAC, &header(5, 14));
        r.on_chunk(&chunk(5, 0, 1, 14, 0));

        // A new run starts before the old one ended.
        r.on_header(CAR_MAC, &header(6, 14));
        assert!(r.on_end(&TelemEnd { run_id: 5, sample_count: 14, checksum: 0 }).is_none());

        r.on_chunk(&chunk(6, 0, 1, 14, 0));
        let expected: Vec<ImuSample> = (0..14).map(sample).collect();
        let run = r
            .on_end(&TelemEnd {
                run_id: 6,
                sample_count: 14,
                checksum: crc_of(&expected),
            })
            .unwrap();
        assert_eq!(run.run_id, 6);
        assert!(run.verified);
    }

    #[test]
    fn csv_rows_convert_to_physical_units() {
        let run = CompletedRun {
            run_id: 1,
            sample_rate: 200,
            duration_ms: 5,
            src: CAR_MAC,
            received_samples: 1,
            samples: vec![ImuSample {
                t_us: 5_000,
                ax: 2048, // ≈ 1 g at 0.000488 g/LSB
                ay: 0,
                az: -2048,
                gx: 100, // 7 dps
                gy: 0,
                gz: -100,
            }],
            verified: true,
        };

        let row = run.csv_rows().next().unwrap();
        assert_eq!(row, "5.000,0.9994,0.0000,-0.9994,7.00,0.00,-7.00");
    }
}
