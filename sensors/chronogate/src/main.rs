//! Chronogate firmware entry point.
//!
//! One binary, three roles: the persisted configuration decides whether
//! this board is a start gate, a finish gate or a speed trap. Boot mounts
//! the filesystem, loads config and peers, brings up the radio, wires the
//! beam ISRs, then runs the role's cooperative main loop — strictly
//! non-blocking, every wait a deadline on the monotonic clock.

mod events;
mod node;
mod radio;
mod storage;

use std::sync::{Arc, Mutex};

use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{AnyIOPin, InterruptType, Output, PinDriver, Pull};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::uart::{config::Config as UartConfig, UartDriver};
use esp_idf_hal::units::Hertz;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{ClientConfiguration, Configuration, EspWifi};
use log::{info, warn};

use race_timing::arming::ArmingPipeline;
use race_timing::config::{DeviceConfig, FIRMWARE_MAJOR, FIRMWARE_MINOR};
use race_timing::discovery::Discovery;
use race_timing::finish_gate::FinishGate;
use race_timing::race::RaceState;
use race_timing::speed_trap::SpeedTrap;
use race_timing::start_gate::StartGate;
use race_timing::sync::ClockSync;
use race_timing::telemetry::Reassembler;
use race_timing::{EventSink, PeerRegistry, Role};
use tfluna::TfLunaParser;

use events::{CuePlayer, DashboardSink};
use node::{now_ms, now_us, Core, GateNode, RoleCore};
use radio::Radio;
use storage::Storage;

fn main() {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("=== Chronogate v{FIRMWARE_MAJOR}.{FIRMWARE_MINOR} ===");

    // Filesystem first: everything else depends on config.json.
    storage::mount().expect("storage partition mount failed");
    let store = Storage::new();

    let Some(cfg) = store.load_config() else {
        // No valid configuration: the captive-portal setup layer owns the
        // device from here. The core just stays out of the way.
        warn!("[BOOT] No valid config — waiting in setup mode");
        loop {
            FreeRtos::delay_ms(1_000);
        }
    };
    info!(
        "[BOOT] Role {}, hostname {}, device {}",
        cfg.role.as_str(),
        cfg.hostname,
        cfg.device_id
    );

    let peripherals = Peripherals::take().unwrap();
    let sysloop = EspSystemEventLoop::take().unwrap();
    let nvs = EspDefaultNvsPartition::take().ok();

    // Split out the peripherals the roles need before the modem is consumed.
    let uart_lidar = peripherals.uart1;
    let uart_audio = peripherals.uart2;

    // ESP-NOW rides the Wi-Fi radio; station mode up, no association needed.
    let mut wifi = EspWifi::new(peripherals.modem, sysloop.clone(), nvs).expect("wifi init");
    wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))
        .expect("wifi config");
    wifi.start().expect("wifi start");

    // Restore the peer table and pre-register every saved MAC with the
    // radio so a rebooted gate reconnects within one beacon cycle.
    let mut registry = PeerRegistry::new();
    registry.restore(&store.load_peers());
    if let Some(mac) = cfg.manual_peer_mac() {
        registry.adopt_manual_peer(mac);
    }

    let role_core = match cfg.role {
        Role::Start => RoleCore::Start(StartGate::new(ArmingPipeline::new(
            cfg.sensor_pin_2 != 0,
            cfg.lidar_enabled.then_some(cfg.lidar_threshold_mm),
        ))),
        Role::Finish => RoleCore::Finish {
            gate: FinishGate::new(cfg.track_length_m, cfg.scale_factor),
            telemetry: Reassembler::new(),
            completed_run: None,
        },
        Role::SpeedTrap => RoleCore::Trap(SpeedTrap::new(cfg.sensor_spacing_m)),
        other => {
            warn!("[BOOT] Unusable role '{}' — setup mode", other.as_str());
            loop {
                FreeRtos::delay_ms(1_000);
            }
        }
    };

    let node = Arc::new(GateNode::new(
        cfg.clone(),
        Core {
            registry,
            discovery: Discovery::new(),
            sync: ClockSync::new(),
            role: role_core,
        },
    ));

    let mut radio = Radio::new().expect("ESP-NOW init");
    {
        let core = node.core.lock().unwrap();
        for peer in core.registry.iter() {
            radio.ensure_peer(&peer.mac);
        }
        info!(
            "[BOOT] Brother's Six active, {} peer(s) in registry",
            core.registry.len()
        );
    }
    // Restored rows are now registered with the radio.
    {
        let mut core = node.core.lock().unwrap();
        for i in 0..core.registry.len() {
            if let Some(p) = core.registry.get_mut(i) {
                p.registered = true;
            }
        }
    }

    // Audio cue module, when wired.
    let audio = if cfg.audio_enabled {
        let uart = UartDriver::new(
            uart_audio,
            unsafe { AnyIOPin::new(cfg.audio_tx_pin as i32) },
            unsafe { AnyIOPin::new(20) }, // unused RX, any free pin
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &UartConfig::new().baudrate(Hertz(9_600)),
        )
        .map(CuePlayer::new);
        match uart {
            Ok(player) => Some(player),
            Err(e) => {
                warn!("[BOOT] Audio UART init failed: {e}");
                None
            }
        }
    } else {
        None
    };
    let sink = Arc::new(Mutex::new(DashboardSink::new(audio)));

    // TF-Luna staging rangefinder (start gate only).
    let lidar_uart = (cfg.role == Role::Start && cfg.lidar_enabled).then(|| {
        UartDriver::new(
            uart_lidar,
            unsafe { AnyIOPin::new(cfg.lidar_tx_pin as i32) },
            unsafe { AnyIOPin::new(cfg.lidar_rx_pin as i32) },
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &UartConfig::new().baudrate(Hertz(115_200)),
        )
        .expect("LiDAR UART")
    });

    let radio = {
        let rx_node = node.clone();
        let rx_sink = sink.clone();
        // The receive path needs the radio for replies; tie the knot with
        // a second Arc set after registration.
        let radio_cell: Arc<Mutex<Option<Arc<Radio>>>> = Arc::new(Mutex::new(None));
        let rx_radio_cell = radio_cell.clone();
        radio
            .set_receiver(move |src, data| {
                if let Some(radio) = rx_radio_cell.lock().unwrap().as_ref() {
                    rx_node.on_receive(src, data, radio, &rx_sink);
                }
            })
            .expect("ESP-NOW receive callback");
        let radio = Arc::new(radio);
        *radio_cell.lock().unwrap() = Some(radio.clone());
        radio
    };

    // Status LED.
    let mut led = PinDriver::output(unsafe { AnyIOPin::new(cfg.led_pin as i32) }).unwrap();

    match cfg.role {
        Role::Start => run_start(&cfg, node, radio, sink, store, lidar_uart, &mut led),
        Role::Finish => run_finish(&cfg, node, radio, sink, store, &mut led),
        Role::SpeedTrap => run_trap(&cfg, node, radio, sink, store, &mut led),
        _ => unreachable!(),
    }
}

/// Blink patterns per race state, shared by all roles.
fn update_led(led: &mut PinDriver<'_, AnyIOPin, Output>, state: RaceState, now_ms: u64) {
    let on = match state {
        RaceState::Idle => now_ms % 2_000 < 100,
        RaceState::Armed | RaceState::Finished => true,
        RaceState::Racing => now_ms % 200 < 100,
    };
    let _ = led.set_level(on.into());
}

fn run_start(
    cfg: &DeviceConfig,
    node: Arc<GateNode>,
    radio: Arc<Radio>,
    sink: Arc<Mutex<DashboardSink>>,
    store: Storage,
    mut lidar_uart: Option<UartDriver<'static>>,
    led: &mut PinDriver<'_, AnyIOPin, Output>,
) -> ! {
    // Beam sensor: falling edge = beam broken. The ISR only latches a
    // timestamp; the latch ignores every edge after the first.
    let mut beam = PinDriver::input(unsafe { AnyIOPin::new(cfg.sensor_pin as i32) }).unwrap();
    beam.set_pull(Pull::Up).unwrap();
    beam.set_interrupt_type(InterruptType::NegEdge).unwrap();
    let isr_node = node.clone();
    unsafe {
        beam.subscribe(move || {
            isr_node.trigger.fire(now_us());
        })
        .unwrap();
    }

    // Reflectance arm pad: LOW = car present. Plain polled input.
    let prox = (cfg.sensor_pin_2 != 0).then(|| {
        PinDriver::input(unsafe { AnyIOPin::new(cfg.sensor_pin_2 as i32) }).unwrap()
    });

    let mut lidar_parser = TfLunaParser::new();
    let mut last_lidar_poll_ms: u64 = 0;
    let mut last_lidar_reading: Option<tfluna::LidarReading> = None;

    info!(
        "[START] Ready. Trigger=GPIO{}, ProxArm={}, LiDAR={}",
        cfg.sensor_pin,
        if cfg.sensor_pin_2 != 0 { "on" } else { "off" },
        if cfg.lidar_enabled { "on" } else { "off" }
    );

    let mut beam_live = false;
    loop {
        let (now_ms, now_us) = (now_ms(), now_us());

        // Drain LiDAR bytes; the sensor streams ~100 Hz but the staging
        // machine runs at 10 Hz on the freshest frame.
        if let Some(uart) = lidar_uart.as_mut() {
            let mut byte = [0u8; 1];
            while uart.read(&mut byte, 0).unwrap_or(0) > 0 {
                if let Some(reading) = lidar_parser.feed_byte(byte[0]) {
                    last_lidar_reading = Some(reading);
                }
            }
            if now_ms.saturating_sub(last_lidar_poll_ms) >= 100 {
                last_lidar_poll_ms = now_ms;
                if let Some(reading) = last_lidar_reading.take() {
                    let changed = {
                        let mut core = node.core.lock().unwrap();
                        match &mut core.role {
                            RoleCore::Start(gate) => gate.pipeline.lidar.as_mut().map(|staging| {
                                staging.on_reading(reading.distance_mm, reading.amplitude, now_ms)
                            }),
                            _ => None,
                        }
                    };
                    if changed == Some(true) {
                        let snapshot = node.snapshot();
                        sink.lock().unwrap().broadcast_state(&snapshot);
                    }
                }
            }
        }

        let prox_level = prox.as_ref().map(|p| p.is_low());

        let effects = {
            let mut core = node.core.lock().unwrap();
            let diag = node.diag();
            core.discovery.poll(&node.ident, diag, now_ms, now_us)
        };
        node.execute_effects(effects, &radio, Some(&store));

        let actions = {
            let mut core = node.core.lock().unwrap();
            let peer_online = core.registry.has_online_peer(now_ms);
            match &mut core.role {
                RoleCore::Start(gate) => gate.poll(
                    &node.shared.state,
                    &node.trigger,
                    prox_level,
                    peer_online,
                    &node.ident,
                    now_ms,
                    now_us,
                ),
                _ => unreachable!(),
            }
        };
        node.execute_actions(actions, &radio, &sink, Some(&store));

        // The beam interrupt tracks ARMED. esp-idf GPIO interrupts are
        // one-shot per enable, so re-enable every pass while armed.
        if node.beam_interrupt_wanted() {
            beam.enable_interrupt().ok();
            beam_live = true;
        } else if beam_live {
            beam.disable_interrupt().ok();
            beam_live = false;
        }

        update_led(led, node.shared.state.load(), now_ms);
        FreeRtos::delay_ms(2);
    }
}

fn run_finish(
    cfg: &DeviceConfig,
    node: Arc<GateNode>,
    radio: Arc<Radio>,
    sink: Arc<Mutex<DashboardSink>>,
    store: Storage,
    led: &mut PinDriver<'_, AnyIOPin, Output>,
) -> ! {
    // Finish beam stays attached for the whole session; the ISR itself is
    // gated on RACING.
    let mut beam = PinDriver::input(unsafe { AnyIOPin::new(cfg.sensor_pin as i32) }).unwrap();
    beam.set_pull(Pull::Up).unwrap();
    beam.set_interrupt_type(InterruptType::NegEdge).unwrap();
    let isr_node = node.clone();
    unsafe {
        beam.subscribe(move || {
            isr_node.shared.finish_trigger(now_us());
        })
        .unwrap();
    }

    // "User ARM": the boot button stands in for the dashboard's arm
    // control when no dashboard is attached.
    let arm_button = PinDriver::input(unsafe { AnyIOPin::new(0) }).ok();
    let mut button_was_down = false;

    info!("[FINISH] Ready. Sensor=GPIO{}", cfg.sensor_pin);

    loop {
        let (now_ms, now_us) = (now_ms(), now_us());

        let effects = {
            let mut core = node.core.lock().unwrap();
            let diag = node.diag();
            core.discovery.poll(&node.ident, diag, now_ms, now_us)
        };
        node.execute_effects(effects, &radio, Some(&store));

        // Edge-triggered user arm.
        if let Some(button) = arm_button.as_ref() {
            let down = button.is_low();
            if down && !button_was_down {
                let actions = {
                    let mut core = node.core.lock().unwrap();
                    let core = &mut *core;
                    match &mut core.role {
                        RoleCore::Finish { gate, .. } => {
                            gate.arm(&node.shared, &mut core.sync, &node.ident, now_us)
                        }
                        _ => unreachable!(),
                    }
                };
                node.execute_actions(actions, &radio, &sink, Some(&store));
            }
            button_was_down = down;
        }

        let actions = {
            let mut core = node.core.lock().unwrap();
            let peer_online = core.registry.has_online_peer(now_ms);
            let core = &mut *core;
            match &mut core.role {
                RoleCore::Finish { gate, .. } => gate.poll(
                    &node.shared,
                    &mut core.sync,
                    peer_online,
                    &node.ident,
                    now_ms,
                    now_us,
                ),
                _ => unreachable!(),
            }
        };
        node.execute_actions(actions, &radio, &sink, Some(&store));

        // Completed telemetry runs: CSV + ACK, main loop only.
        node.service_telemetry(&radio, &store);

        beam.enable_interrupt().ok();
        update_led(led, node.shared.state.load(), now_ms);
        FreeRtos::delay_ms(2);
    }
}

fn run_trap(
    cfg: &DeviceConfig,
    node: Arc<GateNode>,
    radio: Arc<Radio>,
    sink: Arc<Mutex<DashboardSink>>,
    store: Storage,
    led: &mut PinDriver<'_, AnyIOPin, Output>,
) -> ! {
    // Two beams, two ISRs, strict entry→exit ordering enforced by the
    // cells themselves.
    let mut beam1 = PinDriver::input(unsafe { AnyIOPin::new(cfg.sensor_pin as i32) }).unwrap();
    beam1.set_pull(Pull::Up).unwrap();
    beam1.set_interrupt_type(InterruptType::NegEdge).unwrap();
    let isr1 = node.clone();
    unsafe {
        beam1
            .subscribe(move || {
                isr1.trap_cells.sensor1(now_us());
            })
            .unwrap();
    }

    let mut beam2 = PinDriver::input(unsafe { AnyIOPin::new(cfg.sensor_pin_2 as i32) }).unwrap();
    beam2.set_pull(Pull::Up).unwrap();
    beam2.set_interrupt_type(InterruptType::NegEdge).unwrap();
    let isr2 = node.clone();
    unsafe {
        beam2
            .subscribe(move || {
                isr2.trap_cells.sensor2(now_us());
            })
            .unwrap();
    }

    info!(
        "[TRAP] Ready. Sensors=GPIO{}/GPIO{}, spacing {:.3} m",
        cfg.sensor_pin, cfg.sensor_pin_2, cfg.sensor_spacing_m
    );

    loop {
        let (now_ms, now_us) = (now_ms(), now_us());

        let effects = {
            let mut core = node.core.lock().unwrap();
            let diag = node.diag();
            core.discovery.poll(&node.ident, diag, now_ms, now_us)
        };
        node.execute_effects(effects, &radio, Some(&store));

        let actions = {
            let mut core = node.core.lock().unwrap();
            let peer_online = core.registry.has_online_peer(now_ms);
            match &mut core.role {
                RoleCore::Trap(trap) => {
                    trap.poll(&node.trap_cells, peer_online, &node.ident, now_ms, now_us)
                }
                _ => unreachable!(),
            }
        };
        node.execute_actions(actions, &radio, &sink, Some(&store));

        // Trap beams are always live.
        beam1.enable_interrupt().ok();
        beam2.enable_interrupt().ok();

        update_led(led, node.shared.state.load(), now_ms);
        FreeRtos::delay_ms(2);
    }
}
