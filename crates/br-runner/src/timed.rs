//! Wall-clock bounded execution of a unit of work.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use crossbeam_channel::RecvTimeoutError;
use thiserror::Error;

const THREAD_NAME: &str = "timed-run";

thread_local! {
    /// Location and trace of the last panic raised on a timed-run thread.
    static PANIC_SITE: RefCell<Option<(String, Backtrace)>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Outcome of [`timed_run`] when the work did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedRun<T> {
    /// The work's value; `None` when the deadline passed first.
    pub result: Option<T>,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Convert a timeout in seconds to a deadline. Zero, negative and
/// non-finite values mean "no deadline".
pub fn timeout_from_secs(seconds: f64) -> Option<Duration> {
    if seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        None
    }
}

/// An error or panic raised by timed work.
///
/// Displays as the short message. `detail` adds the cause chain, the panic
/// location and a stack trace captured on the work's thread.
#[derive(Debug, Error)]
#[error("{summary}")]
pub struct RunFailure {
    pub summary: String,
    pub detail: String,
}

impl RunFailure {
    fn from_error(err: anyhow::Error) -> Self {
        let summary = err.to_string();
        let detail = if err.backtrace().status() == BacktraceStatus::Captured {
            format!("{err:?}")
        } else {
            format!("{err:?}\n\nstack backtrace:\n{}", Backtrace::force_capture())
        };
        Self { summary, detail }
    }

    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = panic_message(payload);
        let summary = format!("run function panicked: {message}");
        let detail = match PANIC_SITE.with(|site| site.borrow_mut().take()) {
            Some((location, trace)) => {
                format!("run function panicked at {location}: {message}\n\nstack backtrace:\n{trace}")
            }
            None => summary.clone(),
        };
        Self { summary, detail }
    }
}

/// Chains onto the current panic hook to remember where timed work panicked.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if thread::current().name() == Some(THREAD_NAME) {
                let location = info
                    .location()
                    .map_or_else(|| "<unknown>".to_string(), |l| l.to_string());
                PANIC_SITE.with(|site| {
                    *site.borrow_mut() = Some((location, Backtrace::force_capture()));
                });
            }
            previous(info);
        }));
    });
}

/// Run `work` on its own thread and wait for it until `timeout` elapses.
///
/// On timeout the thread is abandoned, not interrupted: it keeps running
/// until the work returns or the process exits, and anything it started
/// (such as a child process) keeps running with it. Errors and panics raised
/// by the work come back as `Err` wrapping a [`RunFailure`], which is
/// distinct from a timeout.
pub fn timed_run<T, F>(work: F, timeout: Option<Duration>) -> anyhow::Result<TimedRun<T>>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    install_panic_hook();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let start = Instant::now();

    thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(RunFailure::from_error(err)),
                Err(payload) => Err(RunFailure::from_panic(&*payload)),
            };
            // Fails only when the caller already gave up waiting.
            let _ = tx.send(outcome);
        })
        .context("failed to spawn timed-run thread")?;

    let received = match timeout {
        Some(limit) => rx.recv_timeout(limit),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    let duration = start.elapsed();

    match received {
        Ok(Ok(value)) => Ok(TimedRun {
            result: Some(value),
            duration,
            timed_out: false,
        }),
        Ok(Err(failure)) => Err(failure.into()),
        Err(RecvTimeoutError::Timeout) => {
            tracing::debug!("Timed run abandoned after {:?}", duration);
            Ok(TimedRun {
                result: None,
                duration,
                timed_out: true,
            })
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(anyhow!("timed-run thread exited without reporting a result"))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_work_returns_its_value() {
        let run = timed_run(|| Ok(21 * 2), Some(Duration::from_secs(5))).unwrap();
        assert_eq!(run.result, Some(42));
        assert!(!run.timed_out);
        assert!(run.duration < Duration::from_secs(5));
    }

    #[test]
    fn slow_work_times_out_and_unblocks_the_caller() {
        let deadline = Duration::from_millis(100);
        let run = timed_run(
            || {
                thread::sleep(Duration::from_secs(3));
                Ok("finished")
            },
            Some(deadline),
        )
        .unwrap();

        assert!(run.timed_out);
        assert_eq!(run.result, None);
        assert!(run.duration >= deadline);
        assert!(run.duration < Duration::from_secs(3));
    }

    #[test]
    fn no_deadline_waits_for_completion() {
        let run = timed_run(
            || {
                thread::sleep(Duration::from_millis(50));
                Ok(())
            },
            None,
        )
        .unwrap();

        assert!(!run.timed_out);
        assert_eq!(run.result, Some(()));
        assert!(run.duration >= Duration::from_millis(50));
    }

    #[test]
    fn errors_propagate_instead_of_timing_out() {
        let err = timed_run::<(), _>(|| Err(anyhow!("boom")), Some(Duration::from_secs(5)))
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn panics_become_errors() {
        let err = timed_run::<(), _>(|| panic!("exploded"), None).unwrap_err();
        assert!(err.to_string().contains("panicked: exploded"));
    }

    #[test]
    fn failures_carry_location_and_trace() {
        let err = timed_run::<(), _>(|| panic!("exploded"), None).unwrap_err();
        let failure = err.downcast_ref::<RunFailure>().unwrap();
        assert!(failure.detail.contains("timed.rs:"), "{}", failure.detail);
        assert!(failure.detail.contains("stack backtrace"));

        let err = timed_run::<(), _>(|| Err(anyhow!("boom")), None).unwrap_err();
        let failure = err.downcast_ref::<RunFailure>().unwrap();
        assert_eq!(failure.summary, "boom");
        assert!(failure.detail.to_lowercase().contains("stack backtrace"));
    }

    #[cfg(unix)]
    #[test]
    fn abandoned_work_keeps_its_child_process() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("done");
        let script = format!("sleep 0.3; touch '{}'", marker.display());

        let run = timed_run(
            move || Ok(std::process::Command::new("sh").args(["-c", &script]).status()?),
            Some(Duration::from_millis(50)),
        )
        .unwrap();
        assert!(run.timed_out);

        let deadline = Instant::now() + Duration::from_secs(3);
        while !marker.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(marker.exists());
    }

    #[test]
    fn timeout_seconds_conversion() {
        assert_eq!(timeout_from_secs(0.0), None);
        assert_eq!(timeout_from_secs(-3.0), None);
        assert_eq!(timeout_from_secs(f64::NAN), None);
        assert_eq!(timeout_from_secs(f64::INFINITY), None);
        assert_eq!(timeout_from_secs(1.5), Some(Duration::from_millis(1500)));
    }
}
