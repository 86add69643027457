//! Start-gate arming pipeline.
//!
//! Three ways a car on the pad can arm the gate, OR-ed together each loop
//! iteration while the race is IDLE:
//!
//! - an explicit `ARM_CMD` from the finish gate,
//! - a LiDAR rangefinder seeing a car staged for one second,
//! - a reflectance proximity sensor seeing a car dwell for half a second.
//!
//! The proximity path carries the re-arm interlock: once a dwell has armed
//! the gate, the sensor must observe the car physically removed before a
//! new dwell may begin. That keeps the same car from re-arming the gate
//! over and over without a human touching the track. On boot and after
//! every race the interlock defaults to "must see clear first".

use log::info;

/// Proximity dwell before arming: the car has to sit still on the pad.
pub const PROX_ARM_DWELL_MS: u64 = 500;
/// LiDAR staging dwell before the one-shot auto-arm fires.
pub const LIDAR_STAGE_DWELL_MS: u64 = 1_000;
/// LiDAR returns below this signal amplitude are unreliable → no target.
pub const LIDAR_MIN_AMPLITUDE: u16 = 100;
/// Distance sentinel substituted for out-of-range / unreliable readings.
pub const LIDAR_NO_TARGET_MM: u16 = 9_999;

/// Which source asked to arm; carried into logs and cues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmRequest {
    Explicit,
    Lidar,
    Proximity,
}

/// Reflectance proximity sensor with dwell and the clear interlock.
///
/// Fed a debounce-free "car present" level each loop; produces at most one
/// arm request per clear→detect→dwell cycle.
#[derive(Debug)]
pub struct ProxSensor {
    car_present: bool,
    detect_start_ms: u64,
    /// The sensor has been seen clear since the last arm (or boot).
    eligible: bool,
}

impl ProxSensor {
    pub fn new() -> Self {
        Self {
            car_present: false,
            detect_start_ms: 0,
            eligible: false, // Must see the pad clear once after boot
        }
    }

    /// Re-lock after an arm or a race: the car must be removed before the
    /// next dwell may start.
    pub fn reset_interlock(&mut self) {
        self.car_present = false;
        self.detect_start_ms = 0;
        self.eligible = false;
    }

    pub fn car_present(&self) -> bool {
        self.car_present
    }

    /// Feed the current sensor level (true = car detected). Returns an arm
    /// request once the dwell completes on an eligible cycle.
    pub fn update(&mut self, car_now: bool, now_ms: u64) -> Option<ArmRequest> {
        if car_now && !self.car_present {
            // Rising edge: a car just appeared.
            self.car_present = true;
            if self.eligible {
                self.detect_start_ms = now_ms;
            }
        } else if !car_now && self.car_present {
            // Falling edge: car removed — the human action that unlocks the
            // next arm cycle.
            self.car_present = false;
            self.detect_start_ms = 0;
            self.eligible = true;
        } else if !car_now && !self.car_present && !self.eligible {
            // Pad already clear after boot/reset: that counts as seen-clear.
            self.eligible = true;
        }

        if self.eligible
            && self.car_present
            && self.detect_start_ms > 0
            && now_ms.saturating_sub(self.detect_start_ms) >= PROX_ARM_DWELL_MS
        {
            info!("[ARM] Proximity dwell complete");
            self.detect_start_ms = 0;
            self.eligible = false;
            return Some(ArmRequest::Proximity);
        }
        None
    }
}

impl Default for ProxSensor {
    fn default() -> Self {
        Self::new()
    }
}

/// LiDAR staging states: is there a car on the pad, and did it launch?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LidarState {
    NoCar,
    CarStaged,
    CarLaunched,
}

impl LidarState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LidarState::NoCar => "empty",
            LidarState::CarStaged => "staged",
            LidarState::CarLaunched => "launched",
        }
    }
}

/// 10 Hz staging machine over the LiDAR distance stream.
///
/// `NO_CAR → CAR_STAGED` below the threshold; back out when the car creeps
/// away; `CAR_LAUNCHED` when the distance jumps past three thresholds (the
/// car left at speed), clearing back to `NO_CAR` once the pad is empty.
#[derive(Debug)]
pub struct LidarStaging {
    state: LidarState,
    threshold_mm: u16,
    staged_since_ms: u64,
    auto_arm_sent: bool,
    last_distance_mm: u16,
}

impl LidarStaging {
    pub fn new(threshold_mm: u16) -> Self {
        Self {
            state: LidarState::NoCar,
            threshold_mm,
            staged_since_ms: 0,
            auto_arm_sent: false,
            last_distance_mm: LIDAR_NO_TARGET_MM,
        }
    }

    pub fn state(&self) -> LidarState {
        self.state
    }

    pub fn distance_mm(&self) -> u16 {
        self.last_distance_mm
    }

    /// Feed one validated rangefinder reading. Weak returns (amplitude
    /// below [`LIDAR_MIN_AMPLITUDE`]) and zero distances are replaced with
    /// the no-target sentinel — transient noise, not worth a log line.
    /// Returns true when the staging state changed (dashboard update).
    pub fn on_reading(&mut self, distance_mm: u16, amplitude: u16, now_ms: u64) -> bool {
        let distance = if amplitude < LIDAR_MIN_AMPLITUDE || distance_mm == 0 {
            LIDAR_NO_TARGET_MM
        } else {
            distance_mm
        };
        self.last_distance_mm = distance;

        let next = match self.state {
            LidarState::NoCar => {
                if distance < self.threshold_mm {
                    self.staged_since_ms = now_ms;
                    self.auto_arm_sent = false;
                    info!("[LIDAR] Car detected at {distance}mm");
                    LidarState::CarStaged
                } else {
                    LidarState::NoCar
                }
            }
            LidarState::CarStaged => {
                if distance > self.threshold_mm * 3 {
                    info!("[LIDAR] Car launched, distance jumped to {distance}mm");
                    LidarState::CarLaunched
                } else if distance >= self.threshold_mm {
                    info!("[LIDAR] Car removed");
                    LidarState::NoCar
                } else {
                    LidarState::CarStaged
                }
            }
            LidarState::CarLaunched => {
                if distance >= self.threshold_mm {
                    LidarState::NoCar
                } else {
                    LidarState::CarLaunched
                }
            }
        };

        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// One-shot: true once when the car has been staged past the dwell.
    pub fn auto_arm_ready(&mut self, now_ms: u64) -> bool {
        if self.state != LidarState::CarStaged || self.auto_arm_sent {
            return false;
        }
        if now_ms.saturating_sub(self.staged_since_ms) > LIDAR_STAGE_DWELL_MS {
            self.auto_arm_sent = true;
            info!("[LIDAR] Auto-arm ready, car staged for 1+ second");
            return true;
        }
        false
    }
}

/// The OR of all fitted arm sources, polled once per loop while IDLE.
#[derive(Debug, Default)]
pub struct ArmingPipeline {
    pub prox: Option<ProxSensor>,
    pub lidar: Option<LidarStaging>,
}

impl ArmingPipeline {
    pub fn new(prox_fitted: bool, lidar_threshold_mm: Option<u16>) -> Self {
        Self {
            prox: prox_fitted.then(ProxSensor::new),
            lidar: lidar_threshold_mm.map(LidarStaging::new),
        }
    }

    /// Poll the passive sources. `prox_level` is the current sensor level
    /// when a proximity sensor is fitted (true = car present); LiDAR
    /// readings arrive separately through [`LidarStaging::on_reading`].
    pub fn poll(&mut self, prox_level: Option<bool>, now_ms: u64) -> Option<ArmRequest> {
        if let (Some(prox), Some(level)) = (self.prox.as_mut(), prox_level) {
            if let Some(req) = prox.update(level, now_ms) {
                return Some(req);
            }
        }
        if let Some(lidar) = self.lidar.as_mut() {
            if lidar.auto_arm_ready(now_ms) {
                return Some(ArmRequest::Lidar);
            }
        }
        None
    }

    /// Every transition into IDLE and every arm re-locks the interlock.
    pub fn reset_interlock(&mut self) {
        if let Some(prox) = self.prox.as_mut() {
            prox.reset_interlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prox_arms_after_dwell() {
        let mut prox = ProxSensor::new();
        // Boot with a clear pad → eligible.
        assert_eq!(prox.update(false, 0), None);

        assert_eq!(prox.update(true, 1_000), None); // car appears
        assert_eq!(prox.update(true, 1_400), None); // dwelling
        assert_eq!(prox.update(true, 1_500), Some(ArmRequest::Proximity));
        // One-shot: still present, no second request.
        assert_eq!(prox.update(true, 2_000), None);
    }

    #[test]
    fn rearm_interlock_requires_clear() {
        // Scenario: car A dwells, arms, races; car A is still on the pad
        // after reset — no re-arm until it is removed and car B placed.
        let mut prox = ProxSensor::new();
        prox.update(false, 0);
        prox.update(true, 1_000);
        assert_eq!(prox.update(true, 1_600), Some(ArmRequest::Proximity));

        // Race over, back to IDLE.
        prox.reset_interlock();

        // Car A still sitting there: dwell must not restart.
        assert_eq!(prox.update(true, 10_000), None);
        assert_eq!(prox.update(true, 20_000), None);

        // Car A removed → interlock releases.
        assert_eq!(prox.update(false, 21_000), None);

        // Car B placed → fresh dwell → arm.
        assert_eq!(prox.update(true, 22_000), None);
        assert_eq!(prox.update(true, 22_500), Some(ArmRequest::Proximity));
    }

    #[test]
    fn boot_with_car_on_pad_requires_removal_first() {
        let mut prox = ProxSensor::new();
        // Car already present at boot: ineligible, never arms.
        assert_eq!(prox.update(true, 100), None);
        assert_eq!(prox.update(true, 5_000), None);
        // Removed, replaced → arms.
        prox.update(false, 6_000);
        prox.update(true, 7_000);
        assert_eq!(prox.update(true, 7_600), Some(ArmRequest::Proximity));
    }

    #[test]
    fn lidar_staging_transitions() {
        let mut lidar = LidarStaging::new(300);

        assert!(!lidar.on_reading(800, 500, 0)); // pad empty
        assert_eq!(lidar.state(), LidarState::NoCar);

        assert!(lidar.on_reading(150, 500, 100)); // car staged
        assert_eq!(lidar.state(), LidarState::CarStaged);

        // Distance jumps past 3× threshold → launched.
        assert!(lidar.on_reading(950, 500, 200));
        assert_eq!(lidar.state(), LidarState::CarLaunched);

        // Pad clears → back to empty.
        assert!(lidar.on_reading(950, 500, 300));
        assert_eq!(lidar.state(), LidarState::NoCar);
    }

    #[test]
    fn lidar_slow_removal_goes_back_to_no_car() {
        let mut lidar = LidarStaging::new(300);
        lidar.on_reading(150, 500, 0);
        // Car drifts just past the threshold but below 3×: removed, not launched.
        assert!(lidar.on_reading(400, 500, 100));
        assert_eq!(lidar.state(), LidarState::NoCar);
    }

    #[test]
    fn lidar_amplitude_filter_boundary() {
        let mut lidar = LidarStaging::new(300);

        // Amplitude 99 → treated as no target even at close distance.
        lidar.on_reading(150, 99, 0);
        assert_eq!(lidar.state(), LidarState::NoCar);
        assert_eq!(lidar.distance_mm(), LIDAR_NO_TARGET_MM);

        // Amplitude 100 → used.
        lidar.on_reading(150, 100, 100);
        assert_eq!(lidar.state(), LidarState::CarStaged);

        // Zero distance is also a no-target sentinel.
        let mut lidar2 = LidarStaging::new(300);
        lidar2.on_reading(0, 500, 0);
        assert_eq!(lidar2.state(), LidarState::NoCar);
    }

    #[test]
    fn lidar_auto_arm_is_one_shot_per_staging() {
        let mut lidar = LidarStaging::new(300);
        lidar.on_reading(150, 500, 0);

        assert!(!lidar.auto_arm_ready(500)); // dwell not elapsed
        assert!(lidar.auto_arm_ready(1_100));
        assert!(!lidar.auto_arm_ready(2_000)); // one-shot

        // Car leaves and a new one stages → a fresh one-shot.
        lidar.on_reading(800, 500, 3_000);
        lidar.on_reading(150, 500, 4_000);
        assert!(lidar.auto_arm_ready(5_100));
    }

    #[test]
    fn pipeline_ors_sources() {
        let mut pipeline = ArmingPipeline::new(true, Some(300));
        pipeline.poll(Some(false), 0); // pad clear → prox eligible

        // LiDAR stages a car; prox still clear.
        pipeline.lidar.as_mut().unwrap().on_reading(150, 500, 0);
        assert_eq!(pipeline.poll(Some(false), 500), None);
        assert_eq!(pipeline.poll(Some(false), 1_200), Some(ArmRequest::Lidar));

        // After the interlock reset, the prox path can arm independently.
        pipeline.reset_interlock();
        pipeline.poll(Some(false), 2_000);
        pipeline.poll(Some(true), 3_000);
        assert_eq!(pipeline.poll(Some(true), 3_600), Some(ArmRequest::Proximity));
    }
}
