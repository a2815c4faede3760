//! The watchdog: a higher-priority thread that checks, every five
//! seconds, that the cycle thread has run since the last check. A stalled
//! cycle thread means some client is wedged inside the graph with the
//! lock held; nothing recoverable remains, so the watchdog kills the
//! offending client's process group and then the engine's own.

use crate::driver::become_real_time;
use crate::engine::Engine;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub fn spawn(engine: Arc<Engine>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("timbre-watchdog".into())
        .spawn(move || watch(engine))
        .expect("cannot spawn watchdog thread")
}

fn watch(engine: Arc<Engine>) {
    let priority = (engine.config().clamped_rtpriority() + 10).min(99);
    if let Err(e) = become_real_time(priority) {
        tracing::warn!(error = %e, "watchdog cannot acquire realtime priority");
        return;
    }

    engine.watchdog_check.store(false, Ordering::Release);

    loop {
        std::thread::sleep(CHECK_INTERVAL);
        if engine.is_shutting_down() {
            return;
        }

        if !engine.watchdog_check.swap(false, Ordering::AcqRel) {
            tracing::error!("watchdog: timeout - killing engine");

            let client_pid = engine.current_client_pid.load(Ordering::Relaxed);
            if client_pid > 0 {
                // the wedged client's whole process group goes first
                let _ = kill(Pid::from_raw(-client_pid), Signal::SIGKILL);
            }
            let own_group = nix::unistd::getpgrp();
            let _ = kill(Pid::from_raw(-own_group.as_raw()), Signal::SIGKILL);
            std::process::exit(1);
        }
    }
}
