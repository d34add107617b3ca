use std::{env, thread};

/// Blocks forever when `PGCLONE_TEST_STOP` names this label, after printing
/// a marker line so the integration harness can wait for the exact stop
/// point before delivering signals.
pub fn stop_if(label: &str) {
    if env::var("PGCLONE_TEST_STOP").as_deref() != Ok(label) {
        return;
    }
    eprintln!("TEST_stop_point_{label}");
    loop {
        thread::park();
    }
}
