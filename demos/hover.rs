//! Closed-loop hover against a simulated motion-capture feed.
//!
//! A toy vertical model stands in for the vehicle: thrust above 50% climbs,
//! below it sinks. The capture bridge runs at ~125 Hz on its own thread.
//!
//! Usage: RUST_LOG=info cargo run --example hover

use mocap_ctrl::link::{self, PeerLinks};
use mocap_ctrl::{protocol, Command, ControlConfig, LoopOrchestrator, RawSample, SetPoints};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const FRAME_PERIOD: Duration = Duration::from_millis(8);
const GRAVITY: f64 = 9.81;

fn main() {
    env_logger::init();

    let mut config = match ControlConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    // Desktop schedulers jitter well past the flight window.
    config.min_step_s = 0.004;
    config.max_step_s = 0.020;
    config.wind_up.increment = 0.5;
    config.wind_up.interval_ms = 1;

    let (links, peer) = link::channels(256);
    let kill = Arc::new(AtomicBool::new(false));
    let mut orchestrator = match LoopOrchestrator::new(config, links) {
        Ok(o) => o.with_kill_switch(kill.clone()),
        Err(e) => {
            eprintln!("Failed to build control loop: {}", e);
            std::process::exit(1);
        }
    };

    let bridge = {
        let kill = kill.clone();
        thread::spawn(move || simulate(peer, kill))
    };

    let timer = {
        let kill = kill.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(4));
            kill.store(true, Ordering::Relaxed);
        })
    };

    println!("Hovering for 4s...");
    if let Err(e) = orchestrator.run() {
        eprintln!("Control loop stopped: {}", e);
    }
    println!("Control loop ran {} cycles", orchestrator.cycles());

    drop(orchestrator);
    let _ = timer.join();
    let _ = bridge.join();
}

/// Capture bridge, operator and actuator in one: integrates the commanded
/// thrust into altitude and feeds the resulting pose back.
fn simulate(peer: PeerLinks, kill: Arc<AtomicBool>) {
    let start = Instant::now();
    let mut z = 0.3;
    let mut vz = 0.0;
    let mut thrust = 0.0;
    let mut frames: u64 = 0;
    let mut operator_sent = false;

    while !kill.load(Ordering::Relaxed) {
        // Control frame (x, y, z) lands in the capture frame as (x, z, -y).
        let sample = RawSample::tracked([0.0, z, 0.0], start.elapsed().as_secs_f64());
        if peer.feedback.send(protocol::encode_frame(&sample)).is_err() {
            break;
        }
        if peer.reply.recv_timeout(Duration::from_millis(100)).is_err() {
            eprintln!("No reply from control loop");
            break;
        }

        for json in peer.commands.try_iter() {
            if let Ok(command) = serde_json::from_str::<Command>(&json) {
                thrust = command.ctrl.thrust;
            }
        }
        let _ = peer.telemetry.try_iter().count();

        let dt = FRAME_PERIOD.as_secs_f64();
        let accel = if thrust > 0.0 {
            GRAVITY * (thrust / 50.0 - 1.0)
        } else {
            -GRAVITY
        };
        vz += accel * dt;
        z += vz * dt;
        if z <= 0.0 {
            z = 0.0;
            vz = 0.0;
        }

        if !operator_sent && start.elapsed() > Duration::from_secs(1) {
            let sp = SetPoints {
                yaw: 30.0,
                ..SetPoints::default()
            };
            let _ = peer.set_points.send(protocol::encode_set_points(&sp));
            operator_sent = true;
        }

        frames += 1;
        if frames % 125 == 0 {
            println!(
                "t={:.1}s  z={:+.3}m  vz={:+.3}m/s  thrust={:.1}%",
                start.elapsed().as_secs_f64(),
                z,
                vz,
                thrust
            );
        }
        thread::sleep(FRAME_PERIOD);
    }
}
