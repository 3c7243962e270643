#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt as _;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::lock::{LeadershipLost, SchedulerLock};

pub const TICK: Duration = Duration::from_secs(1);

/// Work the runner executes on a fixed interval while leading.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
	fn name(&self) -> &'static str;

	fn interval(&self) -> Duration;

	async fn run(&self) -> anyhow::Result<()>;
}

struct Scheduled {
	task: Arc<dyn PeriodicTask>,
	next_due: Instant,
}

/// Outcome of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
	Ok,
	Failed,
	Panicked,
}

impl TaskOutcome {
	fn as_str(self) -> &'static str {
		match self {
			TaskOutcome::Ok => "ok",
			TaskOutcome::Failed => "error",
			TaskOutcome::Panicked => "panic",
		}
	}
}

/// One-second tick loop driving registered tasks under the scheduler lock.
pub struct TickRunner {
	lock: Arc<SchedulerLock>,
	tasks: Vec<Scheduled>,
	tick: Duration,
}

impl TickRunner {
	pub fn new(lock: Arc<SchedulerLock>) -> Self {
		Self {
			lock,
			tasks: Vec::new(),
			tick: TICK,
		}
	}

	/// Register a task; it first runs on the first tick.
	pub fn with_task(mut self, task: Arc<dyn PeriodicTask>) -> Self {
		self.tasks.push(Scheduled {
			task,
			next_due: Instant::now(),
		});
		self
	}

	pub fn task_names(&self) -> Vec<&'static str> {
		self.tasks.iter().map(|s| s.task.name()).collect()
	}

	/// Tick until shutdown (`Ok`) or until a renewal fails (`Err`). The lock must already
	/// be held.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), LeadershipLost> {
		let renew_every = self.lock.renew_every();
		let mut next_renew = Instant::now() + renew_every;
		info!(tasks = ?self.task_names(), renew_every = ?renew_every, "tick runner started");

		loop {
			if *shutdown.borrow() {
				info!("tick runner stopping");
				return Ok(());
			}

			let now = Instant::now();
			if now >= next_renew {
				self.lock.renew().await?;
				next_renew = now + renew_every;
			}

			for scheduled in &mut self.tasks {
				if now >= scheduled.next_due {
					run_task(scheduled.task.as_ref()).await;
					scheduled.next_due = now + scheduled.task.interval();
				}
			}

			tokio::select! {
				_ = tokio::time::sleep(self.tick) => {}
				changed = shutdown.changed() => {
					if changed.is_err() {
						return Ok(());
					}
				}
			}
		}
	}
}

/// Run one task, containing errors and panics.
pub async fn run_task(task: &dyn PeriodicTask) -> TaskOutcome {
	let name = task.name();
	let started = Instant::now();

	let outcome = match AssertUnwindSafe(task.run()).catch_unwind().await {
		Ok(Ok(())) => {
			debug!(task = name, "task ok");
			TaskOutcome::Ok
		}
		Ok(Err(e)) => {
			warn!(task = name, error = %format!("{e:#}"), "task failed");
			TaskOutcome::Failed
		}
		Err(_) => {
			error!(task = name, "task panicked");
			TaskOutcome::Panicked
		}
	};

	metrics::counter!("dispatch_worker_task_runs_total", "task" => name, "result" => outcome.as_str()).increment(1);
	metrics::histogram!("dispatch_worker_task_seconds", "task" => name).record(started.elapsed().as_secs_f64());
	outcome
}
