//! Multi-session outer loop for `foreman run`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::warn;

use crate::core::breaker::Breaker;
use crate::core::types::SessionStatus;
use crate::io::config::OrchestratorConfig;
use crate::io::executor::AgentExecutor;
use crate::io::paths::ProjectPaths;
use crate::io::store::Store;
use crate::session::{SessionOutcome, SessionRequest, run_session};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No feature is pending or in progress.
    Complete,
    /// Too many consecutive failed sessions and the force flag is unset.
    BreakerTripped { consecutive_failures: u32 },
    /// The configured iteration cap was reached.
    MaxIterationsReached { max_iterations: u32 },
    /// SIGINT/SIGTERM was observed.
    Interrupted,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub sessions: u32,
    pub verified: u32,
    pub total_cost: f64,
    pub stop: LoopStop,
}

/// Per-run options layered over the persisted config.
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    pub max_iterations: Option<u32>,
    /// Disables the circuit breaker for the lifetime of the process.
    pub force: bool,
    pub model: Option<String>,
    pub headless: bool,
}

/// Run sessions until the queue completes, the breaker trips, the iteration
/// cap is reached, or a termination signal arrives.
///
/// Failed sessions are absorbed (breaker + backoff); only store-level errors
/// outside a session propagate.
pub fn run_loop<E: AgentExecutor, F: FnMut(&SessionOutcome)>(
    store: &mut Store,
    executor: &E,
    paths: &ProjectPaths,
    config: &OrchestratorConfig,
    options: &LoopOptions,
    shutdown: &AtomicBool,
    mut on_session: F,
) -> Result<LoopOutcome> {
    let mut breaker = Breaker::new(config.breaker_threshold, options.force);
    let mut sessions = 0u32;
    let mut verified = 0u32;
    let mut total_cost = 0.0f64;

    let stop = loop {
        if shutdown.load(Ordering::SeqCst) {
            break LoopStop::Interrupted;
        }
        if breaker.tripped() {
            break LoopStop::BreakerTripped {
                consecutive_failures: breaker.consecutive_failures(),
            };
        }
        if let Some(max_iterations) = options.max_iterations {
            if sessions >= max_iterations {
                break LoopStop::MaxIterationsReached { max_iterations };
            }
        }
        if !store.has_incomplete()? {
            break LoopStop::Complete;
        }

        let request = SessionRequest {
            paths,
            config,
            model: options.model.clone(),
            headless: options.headless,
        };
        sessions += 1;
        match run_session(store, executor, &request) {
            Ok(outcome) => {
                verified += outcome.verified;
                total_cost += outcome.cost;
                let failed = outcome.status == SessionStatus::Failed;
                on_session(&outcome);
                if failed {
                    breaker.record_failure();
                    backoff(config.failure_backoff_secs, shutdown);
                } else {
                    breaker.record_success();
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "iteration failed outside the session");
                breaker.record_failure();
                backoff(config.failure_backoff_secs, shutdown);
            }
        }
    };

    Ok(LoopOutcome {
        sessions,
        verified,
        total_cost,
        stop,
    })
}

/// Fixed backoff between a failed session and the next attempt, sliced so a
/// termination signal is honored promptly.
fn backoff(secs: u64, shutdown: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(200)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::write_config;
    use crate::test_support::{
        ScriptedExecutor, completing_session, crashing_session, init_project, spec,
    };

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            failure_backoff_secs: 0,
            ..OrchestratorConfig::default()
        }
    }

    /// B1: an empty queue exits immediately without opening a session.
    #[test]
    fn empty_queue_completes_without_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &[]).expect("init");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let executor = ScriptedExecutor::new(Vec::new());
        let shutdown = AtomicBool::new(false);

        let outcome = run_loop(
            &mut store,
            &executor,
            &paths,
            &fast_config(),
            &LoopOptions::default(),
            &shutdown,
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.sessions, 0);
        assert_eq!(outcome.stop, LoopStop::Complete);
    }

    #[test]
    fn loop_runs_one_session_then_completes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(
            temp.path(),
            &[spec(1, "a", "cat-x"), spec(2, "b", "cat-x")],
        )
        .expect("init");
        let config = fast_config();
        write_config(&paths.config_path, &config).expect("config");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let executor = ScriptedExecutor::new(vec![completing_session(&[1, 2])]);
        let shutdown = AtomicBool::new(false);

        let mut seen = Vec::new();
        let outcome = run_loop(
            &mut store,
            &executor,
            &paths,
            &config,
            &LoopOptions::default(),
            &shutdown,
            |session| seen.push(session.session_id),
        )
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.sessions, 1);
        assert_eq!(outcome.verified, 2);
        assert_eq!(seen.len(), 1);
    }

    /// S5: three consecutive failures trip the breaker before iteration 4.
    #[test]
    fn breaker_trips_after_three_consecutive_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &[spec(1, "a", "cat-x")]).expect("init");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let executor = ScriptedExecutor::new(vec![
            crashing_session("boom"),
            crashing_session("boom"),
            crashing_session("boom"),
        ]);
        let shutdown = AtomicBool::new(false);

        let outcome = run_loop(
            &mut store,
            &executor,
            &paths,
            &fast_config(),
            &LoopOptions::default(),
            &shutdown,
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.sessions, 3);
        assert_eq!(
            outcome.stop,
            LoopStop::BreakerTripped {
                consecutive_failures: 3
            }
        );
    }

    #[test]
    fn force_flag_keeps_looping_until_the_iteration_cap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &[spec(1, "a", "cat-x")]).expect("init");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let executor = ScriptedExecutor::new(vec![
            crashing_session("boom"),
            crashing_session("boom"),
            crashing_session("boom"),
            crashing_session("boom"),
            crashing_session("boom"),
        ]);
        let shutdown = AtomicBool::new(false);

        let outcome = run_loop(
            &mut store,
            &executor,
            &paths,
            &fast_config(),
            &LoopOptions {
                max_iterations: Some(5),
                force: true,
                ..LoopOptions::default()
            },
            &shutdown,
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.sessions, 5);
        assert_eq!(
            outcome.stop,
            LoopStop::MaxIterationsReached { max_iterations: 5 }
        );
    }

    #[test]
    fn shutdown_flag_stops_before_opening_a_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &[spec(1, "a", "cat-x")]).expect("init");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let executor = ScriptedExecutor::new(Vec::new());
        let shutdown = AtomicBool::new(true);

        let outcome = run_loop(
            &mut store,
            &executor,
            &paths,
            &fast_config(),
            &LoopOptions::default(),
            &shutdown,
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.sessions, 0);
        assert_eq!(outcome.stop, LoopStop::Interrupted);
    }
}
