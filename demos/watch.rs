use std::env::args;
use std::sync::Arc;
use std::time::Duration;

use ddcmon::{Core, Dispatcher, EventClass, Settings};

fn main() {
    tracing_subscriber::fmt::init();

    let seconds: u64 = args().nth(1).and_then(|v| v.parse().ok()).unwrap_or(60);

    let core = Arc::new(Core::new(Settings::default()));
    let count = core.detect().expect("display detection failed");
    println!("detected {} displays", count);
    for dref in core.displays().all() {
        let d = dref.lock().unwrap();
        println!("   {}", d.repr());
    }

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register(|event| println!("event: {}", event));

    let watcher = ddcmon::watch::start_watch(
        Arc::clone(&core),
        dispatcher,
        EventClass::CONNECTION | EventClass::DPMS,
    )
    .expect("failed to start watcher");

    println!("watching for display changes for {} seconds", seconds);
    std::thread::sleep(Duration::from_secs(seconds));
    watcher.stop(true);

    print!("{}", core.stats().report());
}
