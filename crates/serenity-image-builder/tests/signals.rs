//! Runs in its own test binary: the handlers are process-wide and the test
//! signals itself.
#![cfg(unix)]

use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use serenity_image_builder::executor::{CommandRunner, ProcessRunner};
use serenity_image_builder::signal;

fn terminate_self_after(delay: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(delay);
        unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
    })
}

#[test]
fn sigterm_stops_the_running_command_and_keeps_the_driver_alive() {
    signal::install_handlers().expect("install handlers");
    assert!(!signal::interrupted());

    let killer = terminate_self_after(Duration::from_millis(300));
    let mut cmd = Command::new("sleep");
    cmd.arg("5");
    let start = Instant::now();
    let out = ProcessRunner
        .run(&mut cmd, &mut |_| {})
        .expect("sleep should spawn");
    let took = start.elapsed();
    killer.join().expect("join");

    assert!(
        took < Duration::from_secs(3),
        "child kept running for {took:?} after SIGTERM"
    );
    assert_eq!(out.code, None, "child should have died from the forwarded signal");
    assert!(signal::interrupted());

    // A repeated SIGTERM only re-raises the flag; the driver gets to report.
    terminate_self_after(Duration::ZERO).join().expect("join");
    thread::sleep(Duration::from_millis(50));
    assert!(signal::interrupted());

    // Commands started after the interrupt are stopped right away.
    let mut cmd = Command::new("sleep");
    cmd.arg("5");
    let start = Instant::now();
    let out = ProcessRunner
        .run(&mut cmd, &mut |_| {})
        .expect("sleep should spawn");
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(!out.success());
}
