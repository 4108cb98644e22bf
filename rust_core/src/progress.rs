use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const REFRESH: Duration = Duration::from_millis(100);
const BAR_WIDTH: usize = 30;

/// Counters shared by every chain (or by the ensemble loop) of one run.
///
/// Samplers only bump atomics; rendering happens on a separate thread
/// owned by a [`ProgressBar`].
#[derive(Debug)]
pub struct ProgressState {
    label: String,
    total: usize,
    completed: AtomicUsize,
    divergences: AtomicUsize,
    /// Log-probability or gradient evaluations, depending on the sampler.
    evals: AtomicUsize,
    done: AtomicBool,
    started: Instant,
}

impl ProgressState {
    /// `num_chains` independent chains of `iters_per_chain` iterations.
    pub fn new(label: &str, num_chains: usize, iters_per_chain: usize) -> Self {
        Self {
            label: label.to_string(),
            total: num_chains * iters_per_chain,
            completed: AtomicUsize::new(0),
            divergences: AtomicUsize::new(0),
            evals: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub fn increment(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_evals(&self, n: usize) {
        self.evals.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_divergence(&self) {
        self.divergences.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn evals(&self) -> usize {
        self.evals.load(Ordering::Relaxed)
    }

    pub fn divergences(&self) -> usize {
        self.divergences.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }

    /// One status line, without carriage return or ANSI codes.
    pub fn status_line(&self) -> String {
        let completed = self.completed().min(self.total);
        let elapsed = self.started.elapsed().as_secs_f64();
        let filled = if self.total > 0 {
            BAR_WIDTH * completed / self.total
        } else {
            0
        };
        let bar = "━".repeat(filled) + &"╌".repeat(BAR_WIDTH - filled);
        let pct = if self.total > 0 {
            completed * 100 / self.total
        } else {
            0
        };
        let head = format!(
            "{} {} {:>3}% │ {}/{} │ {} div │ {} evals",
            self.label,
            bar,
            pct,
            fmt_count(completed),
            fmt_count(self.total),
            self.divergences(),
            fmt_count(self.evals()),
        );

        if self.is_done() {
            return format!("{} │ {}", head, fmt_time(elapsed));
        }
        let rate = if elapsed > 0.05 {
            completed as f64 / elapsed
        } else {
            0.0
        };
        let eta = if rate > 0.0 {
            (self.total - completed) as f64 / rate
        } else {
            0.0
        };
        format!(
            "{} │ {} it/s │ {} < ~{}",
            head,
            fmt_count(rate as usize),
            fmt_time(elapsed),
            fmt_time(eta)
        )
    }
}

fn fmt_count(n: usize) -> String {
    match n {
        n if n >= 1_000_000 => format!("{:.1}M", n as f64 / 1e6),
        n if n >= 10_000 => format!("{:.1}k", n as f64 / 1e3),
        n => n.to_string(),
    }
}

fn fmt_time(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let whole = secs as u64;
        format!("{}:{:02}", whole / 60, whole % 60)
    }
}

/// Renders a [`ProgressState`] on stderr about ten times a second until
/// it is finished or dropped. A disabled bar draws nothing.
pub struct ProgressBar {
    state: Arc<ProgressState>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressBar {
    pub fn start(state: Arc<ProgressState>, enabled: bool) -> Self {
        let handle = enabled.then(|| {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                while !state.is_done() {
                    draw(&state, false);
                    std::thread::sleep(REFRESH);
                }
                draw(&state, true);
            })
        });
        Self { state, handle }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Mark the run complete and wait for the final line to be drawn.
    pub fn finish(self) {
        drop(self);
    }
}

// Also runs when a sampler bails out early with an error.
impl Drop for ProgressBar {
    fn drop(&mut self) {
        self.state.finish();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn draw(state: &ProgressState, last: bool) {
    let mut err = std::io::stderr().lock();
    let end = if last { "\n" } else { "" };
    let _ = write!(err, "\r{}\x1b[K{}", state.status_line(), end);
    let _ = err.flush();
}
