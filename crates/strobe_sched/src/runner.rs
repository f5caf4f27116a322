//! Sequential regression runner: named test cases, per-test schedulers,
//! timeouts, and machine-readable reports.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use strobe_common::TimeUnit;

use crate::backend::SimulatorBackend;
use crate::combine::first;
use crate::error::SchedError;
use crate::scheduler::Scheduler;
use crate::task::{TaskOutcome, TaskResult, TestFail};

/// The final status of one test run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestOutcome {
    /// The test body returned `Ok`.
    Passed,
    /// An assertion-style check failed.
    Failed {
        /// The assertion message.
        message: String,
    },
    /// An infrastructure or usage error occurred.
    Error {
        /// Description of the error.
        message: String,
    },
    /// The test exceeded its timeout budget.
    Timeout,
    /// The test task was cancelled before completing.
    Cancelled,
}

impl TestOutcome {
    /// Returns true for a passing outcome.
    pub fn passed(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Passed => write!(f, "PASS"),
            TestOutcome::Failed { message } => write!(f, "FAIL ({message})"),
            TestOutcome::Error { message } => write!(f, "ERROR ({message})"),
            TestOutcome::Timeout => write!(f, "TIMEOUT"),
            TestOutcome::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One test's entry in the regression report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    /// The test's name.
    pub name: String,
    /// Its final status.
    pub outcome: TestOutcome,
}

/// A boxed test body future.
pub type TestFuture = Pin<Box<dyn Future<Output = TaskResult>>>;

/// A named test with an optional simulated-time budget.
pub struct TestCase {
    name: String,
    timeout: Option<(u64, TimeUnit)>,
    body: Box<dyn Fn(Scheduler) -> TestFuture>,
}

impl TestCase {
    /// Creates a test case from a name and a body constructor.
    ///
    /// The constructor is invoked once per run with that run's scheduler.
    pub fn new(name: impl Into<String>, body: impl Fn(Scheduler) -> TestFuture + 'static) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            body: Box::new(body),
        }
    }

    /// Sets a simulated-time budget; exceeding it records a
    /// [`TestOutcome::Timeout`] and kills the test body.
    pub fn with_timeout(mut self, amount: u64, unit: TimeUnit) -> Self {
        self.timeout = Some((amount, unit));
        self
    }

    /// Returns the test's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Drives a simulation session until no work remains.
///
/// Implemented by whatever owns the simulator event loop: the
/// `strobe_harness` wheel in unit regressions, or an adapter pumping a
/// real simulator. `drive` returns when the backend has run out of
/// registered callbacks (the scheduler finishing a test unprimes
/// everything except one final bookkeeping timer).
pub trait SessionDriver {
    /// Runs the simulation until no registered work remains.
    fn drive(&mut self);
}

/// The backend/driver pair for one test run.
///
/// Each test gets a fresh session so no state leaks between tests.
pub struct Session {
    /// The backend handed to the scheduler.
    pub backend: Box<dyn SimulatorBackend>,
    /// The event loop driving that backend.
    pub driver: Box<dyn SessionDriver>,
}

/// Runs an ordered list of test cases, one scheduler per test.
#[derive(Default)]
pub struct Runner {
    tests: Vec<TestCase>,
}

impl Runner {
    /// Creates an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a test case; tests run in insertion order.
    pub fn add(&mut self, test: TestCase) {
        self.tests.push(test);
    }

    /// Returns the number of registered tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns true if no tests are registered.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Runs every test with a fresh session from `make_session` and
    /// returns the reports in run order.
    pub fn run_all(&self, mut make_session: impl FnMut(&TestCase) -> Session) -> Vec<TestReport> {
        self.tests
            .iter()
            .map(|test| {
                let session = make_session(test);
                run_one(test, session)
            })
            .collect()
    }
}

fn run_one(test: &TestCase, session: Session) -> TestReport {
    let sched = Scheduler::new(session.backend);
    let name = test.name.clone();
    let body = (test.body)(sched.clone());
    let fut: TestFuture = match test.timeout {
        None => body,
        Some((amount, unit)) => {
            // The budget races a timer against the body in a wrapper task;
            // on timeout the body is killed so teardown is orderly.
            let sched = sched.clone();
            let body_name = format!("{name}::body");
            Box::pin(async move {
                let inner = sched.spawn(body_name.clone(), body);
                let timer = sched.timer(amount, unit);
                let winner = first(vec![inner.join_trigger(), timer.clone()]).await?;
                if winner == timer {
                    inner.kill();
                    return Err(TestFail::Timeout);
                }
                match inner.join().await {
                    TaskOutcome::Completed(result) => result,
                    TaskOutcome::Cancelled => Err(TestFail::Error(SchedError::TaskFailed {
                        name: body_name,
                        message: "test body cancelled".into(),
                    })),
                }
            })
        }
    };
    log::info!("running test '{name}'");
    let mut driver = session.driver;
    sched.start_test(name.clone(), fut);
    driver.drive();
    // No outcome after the driver ran dry means every task is still blocked
    // on triggers that can never fire again: a hang, not a pass.
    let outcome = sched.outcome().unwrap_or_else(|| TestOutcome::Error {
        message: "test did not complete: simulator ran out of work".into(),
    });
    log::info!("test '{name}': {outcome}");
    TestReport { name, outcome }
}
