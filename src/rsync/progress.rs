use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::format::{format_hms, format_size};

/// How the transfer engine reports progress to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Single-line bar keyed by module name.
    Bar,
    /// One timestamped line every N seconds, for logs without a terminal.
    Plain,
    /// Counters only, no rendering.
    None,
}

const BAR_REFRESH: Duration = Duration::from_millis(100);
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Samples the shared byte counter and renders it in the selected mode.
/// The counter itself is always maintained; the renderer only decides what
/// the operator sees.
pub(crate) struct Renderer {
    counter: Arc<AtomicU64>,
    total: u64,
    bar: Option<ProgressBar>,
    ticker: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

impl Renderer {
    pub fn start(
        mode: ProgressMode,
        module: &str,
        total: u64,
        interval_secs: u64,
        counter: Arc<AtomicU64>,
    ) -> Renderer {
        let stop = CancellationToken::new();
        let (bar, ticker) = match mode {
            ProgressMode::Bar => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{prefix} {percent:>3}% |{bar:40}| {decimal_bytes} / {decimal_total_bytes}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar.set_prefix(module.to_string());
                bar.enable_steady_tick(BAR_REFRESH);

                let ticker = tokio::spawn(flush_bar(bar.clone(), counter.clone(), stop.clone()));
                (Some(bar), Some(ticker))
            }
            ProgressMode::Plain => {
                let interval = if interval_secs == 0 { 30 } else { interval_secs };
                let ticker = tokio::spawn(plain_lines(
                    total,
                    Duration::from_secs(interval),
                    counter.clone(),
                    stop.clone(),
                ));
                (None, Some(ticker))
            }
            ProgressMode::None => (None, None),
        };

        Renderer {
            counter,
            total,
            bar,
            ticker,
            stop,
        }
    }

    /// Stops the ticker and forces the bar to exactly 100%.
    pub async fn finish(mut self) {
        self.stop.cancel();
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.await;
        }
        if let Some(bar) = self.bar.take() {
            bar.set_position(self.total);
            bar.finish();
        }
    }

    /// Stops rendering without completing the bar (failure or cancel path).
    pub async fn abandon(mut self) {
        self.stop.cancel();
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.await;
        }
        if let Some(bar) = self.bar.take() {
            bar.set_position(self.counter.load(Ordering::Relaxed));
            bar.abandon();
        }
    }
}

async fn flush_bar(bar: ProgressBar, counter: Arc<AtomicU64>, stop: CancellationToken) {
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = tick.tick() => {
                bar.set_position(counter.load(Ordering::Relaxed));
            }
        }
    }
}

async fn plain_lines(
    total: u64,
    interval: Duration,
    counter: Arc<AtomicU64>,
    stop: CancellationToken,
) {
    let start = Instant::now();
    let mut tick = tokio::time::interval(interval);
    tick.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = tick.tick() => {
                let current = counter.load(Ordering::Relaxed);
                let percent = if total > 0 {
                    ((current * 100) / total).min(100)
                } else {
                    0
                };

                let elapsed = start.elapsed().as_secs_f64();
                let speed = if elapsed > 0.0 {
                    (current as f64 / elapsed) as u64
                } else {
                    0
                };
                let remaining = total.saturating_sub(current);
                let eta = if speed > 0 { remaining / speed } else { 0 };

                eprintln!(
                    "[{}] {percent:>3} %  ({} / {}, {}/s, ETA {})",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    format_size(current),
                    format_size(total),
                    format_size(speed),
                    format_hms(eta),
                );

                if current >= total {
                    return;
                }
            }
        }
    }
}

/// Parses the leading decimal digits of a progress line without allocating.
/// Returns `None` when the line does not start with a digit.
pub(crate) fn parse_leading_size(line: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut seen = false;
    for byte in line {
        if byte.is_ascii_digit() {
            value = value * 10 + u64::from(byte - b'0');
            seen = true;
        } else {
            break;
        }
    }
    seen.then_some(value)
}
