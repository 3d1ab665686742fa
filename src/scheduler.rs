//! Single serialized background scheduler.
//!
//! All timer-driven work (the key refresh tick and the token refresh chain) goes through one
//! queue drained by one task, so scheduled jobs never overlap. Scheduling only pushes onto an
//! unbounded channel and never blocks the caller.

// std
use std::{
	cmp::Ordering as CmpOrdering,
	collections::BinaryHeap,
	fmt::{Debug, Formatter, Result as FmtResult},
	future::Future,
	pin::Pin,
	sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
// crates.io
use tokio::{
	sync::mpsc,
	task::{AbortHandle, JoinError},
	time,
};
// self
use crate::_prelude::*;

/// Boxed unit of scheduled work.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to the serialized scheduler task. Clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
	sender: mpsc::UnboundedSender<Task>,
	sequence: Arc<AtomicU64>,
	pending: Arc<AtomicUsize>,
	abort: AbortHandle,
}
impl Scheduler {
	/// Spawn the scheduler task on the current Tokio runtime.
	pub fn spawn() -> Self {
		let (sender, receiver) = mpsc::unbounded_channel();
		let pending = Arc::new(AtomicUsize::new(0));
		let handle = tokio::spawn(run(receiver, pending.clone()));

		Self { sender, sequence: Arc::new(AtomicU64::new(0)), pending, abort: handle.abort_handle() }
	}

	/// Run `job` after `delay`.
	pub fn schedule_in<F>(&self, delay: Duration, label: &'static str, job: F) -> bool
	where
		F: Future<Output = ()> + Send + 'static,
	{
		self.schedule_at(Instant::now() + delay, label, job)
	}

	/// Run `job` at `due`. Returns `false` once the scheduler has shut down.
	pub fn schedule_at<F>(&self, due: Instant, label: &'static str, job: F) -> bool
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let task = Task {
			due,
			sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
			label,
			job: Box::pin(job),
		};

		self.pending.fetch_add(1, Ordering::AcqRel);

		if self.sender.send(task).is_err() {
			self.pending.fetch_sub(1, Ordering::AcqRel);

			tracing::warn!(label, "scheduler is shut down; job dropped");

			return false;
		}

		tracing::trace!(label, "job scheduled");

		true
	}

	/// Run `job` after `first_delay` and then every `period`, measured from each due time.
	pub fn schedule_fixed_rate<F, Fut>(
		&self,
		first_delay: Duration,
		period: Duration,
		label: &'static str,
		job: F,
	) -> bool
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		self.enqueue_periodic(Instant::now() + first_delay, period, label, Arc::new(job))
	}

	/// Jobs queued but not yet started.
	pub fn pending(&self) -> usize {
		self.pending.load(Ordering::Acquire)
	}

	/// Stop the scheduler; queued jobs are dropped without running.
	pub fn shutdown(&self) {
		if !self.abort.is_finished() {
			tracing::info!("scheduler shutting down");
		}

		self.abort.abort();
	}

	/// Whether the scheduler task has stopped.
	pub fn is_shut_down(&self) -> bool {
		self.abort.is_finished() || self.sender.is_closed()
	}

	fn enqueue_periodic<F, Fut>(
		&self,
		due: Instant,
		period: Duration,
		label: &'static str,
		job: Arc<F>,
	) -> bool
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let scheduler = self.clone();
		let next = job.clone();

		self.schedule_at(due, label, async move {
			job().await;

			scheduler.enqueue_periodic(due + period, period, label, next);
		})
	}
}
impl Debug for Scheduler {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("Scheduler")
			.field("pending", &self.pending())
			.field("shut_down", &self.is_shut_down())
			.finish()
	}
}

struct Task {
	due: Instant,
	sequence: u64,
	label: &'static str,
	job: Job,
}
impl PartialEq for Task {
	fn eq(&self, other: &Self) -> bool {
		self.cmp(other) == CmpOrdering::Equal
	}
}
impl Eq for Task {}
impl PartialOrd for Task {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}
impl Ord for Task {
	// Reversed so the max-heap yields the earliest due time, then the earliest submission.
	fn cmp(&self, other: &Self) -> CmpOrdering {
		other.due.cmp(&self.due).then_with(|| other.sequence.cmp(&self.sequence))
	}
}

async fn run(mut receiver: mpsc::UnboundedReceiver<Task>, pending: Arc<AtomicUsize>) {
	let mut queue = BinaryHeap::new();
	let mut open = true;

	loop {
		let next_due = queue.peek().map(|task: &Task| task.due);

		if !open && next_due.is_none() {
			break;
		}

		tokio::select! {
			biased;
			received = receiver.recv(), if open => match received {
				Some(task) => queue.push(task),
				None => open = false,
			},
			_ = time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
				if let Some(task) = queue.pop() {
					pending.fetch_sub(1, Ordering::AcqRel);

					execute(task).await;
				}
			},
		}
	}

	tracing::debug!("scheduler drained");
}

async fn execute(task: Task) {
	let Task { label, job, .. } = task;

	tracing::debug!(label, "running scheduled job");

	// A panicking job must not take the queue down with it.
	if let Err(err) = tokio::spawn(job).await {
		tracing::error!(label, error = %panic_message(err), "scheduled job failed");
	}
}

fn panic_message(err: JoinError) -> String {
	if !err.is_panic() {
		return err.to_string();
	}

	let payload = err.into_panic();

	payload
		.downcast_ref::<&str>()
		.map(|message| (*message).to_owned())
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "non-string panic payload".into())
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::Mutex;
	// self
	use super::*;

	fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Job) {
		let log = Arc::new(Mutex::new(Vec::new()));
		let factory = {
			let log = log.clone();

			move |name: &'static str| -> Job {
				let log = log.clone();

				Box::pin(async move { log.lock().unwrap().push(name) })
			}
		};

		(log, factory)
	}

	#[tokio::test(start_paused = true)]
	async fn jobs_run_in_due_order() {
		let scheduler = Scheduler::spawn();
		let (log, job) = recorder();

		scheduler.schedule_in(Duration::from_secs(30), "late", job("late"));
		scheduler.schedule_in(Duration::from_secs(5), "early", job("early"));
		scheduler.schedule_in(Duration::from_secs(5), "early-second", job("early-second"));

		assert_eq!(scheduler.pending(), 3);

		time::sleep(Duration::from_secs(10)).await;

		assert_eq!(*log.lock().unwrap(), vec!["early", "early-second"]);

		time::sleep(Duration::from_secs(30)).await;

		assert_eq!(*log.lock().unwrap(), vec!["early", "early-second", "late"]);
		assert_eq!(scheduler.pending(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn jobs_never_overlap() {
		let scheduler = Scheduler::spawn();
		let active = Arc::new(AtomicUsize::new(0));
		let peak = Arc::new(AtomicUsize::new(0));

		for _ in 0..3 {
			let active = active.clone();
			let peak = peak.clone();

			scheduler.schedule_in(Duration::from_secs(1), "overlap", async move {
				let now = active.fetch_add(1, Ordering::SeqCst) + 1;

				peak.fetch_max(now, Ordering::SeqCst);
				time::sleep(Duration::from_secs(10)).await;
				active.fetch_sub(1, Ordering::SeqCst);
			});
		}

		time::sleep(Duration::from_secs(60)).await;

		assert_eq!(peak.load(Ordering::SeqCst), 1);
		assert_eq!(scheduler.pending(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn fixed_rate_runs_immediately_then_every_period() {
		let scheduler = Scheduler::spawn();
		let runs = Arc::new(AtomicUsize::new(0));
		let counter = runs.clone();

		scheduler.schedule_fixed_rate(Duration::ZERO, Duration::from_secs(3_600), "tick", move || {
			let counter = counter.clone();

			async move {
				counter.fetch_add(1, Ordering::SeqCst);
			}
		});

		time::sleep(Duration::from_secs(1)).await;

		assert_eq!(runs.load(Ordering::SeqCst), 1);

		time::sleep(Duration::from_secs(2 * 3_600)).await;

		assert_eq!(runs.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn jobs_may_reschedule_themselves() {
		let scheduler = Scheduler::spawn();
		let (log, job) = recorder();
		let chained = {
			let scheduler = scheduler.clone();
			let follow_up = job("second");

			async move {
				scheduler.schedule_in(Duration::from_secs(5), "second", follow_up);
			}
		};

		scheduler.schedule_in(Duration::from_secs(1), "first", chained);
		time::sleep(Duration::from_secs(3)).await;

		assert!(log.lock().unwrap().is_empty());
		assert_eq!(scheduler.pending(), 1);

		time::sleep(Duration::from_secs(5)).await;

		assert_eq!(*log.lock().unwrap(), vec!["second"]);
	}

	#[tokio::test(start_paused = true)]
	async fn panicking_job_does_not_stop_the_queue() {
		let scheduler = Scheduler::spawn();
		let (log, job) = recorder();

		scheduler.schedule_in(Duration::from_secs(1), "boom", async { panic!("boom") });
		scheduler.schedule_in(Duration::from_secs(2), "after", job("after"));
		time::sleep(Duration::from_secs(5)).await;

		assert_eq!(*log.lock().unwrap(), vec!["after"]);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_drops_queued_jobs() {
		let scheduler = Scheduler::spawn();
		let (log, job) = recorder();

		scheduler.schedule_in(Duration::from_secs(5), "never", job("never"));
		scheduler.shutdown();
		time::sleep(Duration::from_secs(10)).await;

		assert!(log.lock().unwrap().is_empty());
		assert!(scheduler.is_shut_down());
		assert!(!scheduler.schedule_in(Duration::ZERO, "rejected", async {}));
	}
}
