//! Single-slot wait handle used for single-flight refreshes and pending deliveries.
//!
//! A [`Gate`] holds at most one in-flight operation. The holder of the [`Ticket`] owns the flight;
//! anyone else can obtain a [`Waiter`] and is released, together with every other waiter, when the
//! flight completes. The slot is always cleared before waiters are released so a released waiter
//! can immediately open the next flight.

// std
use std::sync::{
	Mutex, MutexGuard, PoisonError,
	atomic::{AtomicU64, Ordering},
};
// crates.io
use tokio::{sync::watch, time};
// self
use crate::_prelude::*;

/// How a flight ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
	/// The operation produced its result.
	Succeeded,
	/// The operation ran and failed.
	Failed,
	/// The ticket was dropped or superseded without completing.
	Abandoned,
}

/// Result of [`Gate::enter`].
#[derive(Debug)]
pub enum Admission<'a> {
	/// The caller opened the flight and must perform the work.
	Leader(Ticket<'a>),
	/// Another flight is active; wait for it instead.
	Follower(Waiter),
}

/// Single-slot in-flight marker.
#[derive(Debug)]
pub struct Gate {
	name: &'static str,
	slot: Mutex<Option<Flight>>,
	generation: AtomicU64,
}
impl Gate {
	/// Create an idle gate; `name` only appears in logs.
	pub fn new(name: &'static str) -> Self {
		Self { name, slot: Mutex::new(None), generation: AtomicU64::new(0) }
	}

	/// Open a new flight, superseding any flight already in the slot.
	///
	/// Waiters of a superseded flight observe [`Completion::Abandoned`].
	pub fn open(&self) -> Ticket<'_> {
		let mut slot = self.lock();
		let ticket = self.install(&mut slot);

		drop(slot);

		ticket
	}

	/// Join the active flight or open one when the slot is empty.
	pub fn enter(&self) -> Admission<'_> {
		let mut slot = self.lock();

		if let Some(flight) = slot.as_ref() {
			return Admission::Follower(flight.waiter());
		}

		Admission::Leader(self.install(&mut slot))
	}

	/// Waiter for the active flight, if any.
	pub fn in_flight(&self) -> Option<Waiter> {
		self.lock().as_ref().map(Flight::waiter)
	}

	/// Complete whichever flight is active from outside its ticket.
	///
	/// Returns `false` when the slot was empty, in which case nothing is signalled.
	pub fn release(&self, completion: Completion) -> bool {
		let flight = self.lock().take();

		match flight {
			Some(flight) => {
				tracing::debug!(gate = self.name, generation = flight.generation, ?completion, "gate released");

				flight.signal.send_replace(Some(completion));

				true
			},
			None => false,
		}
	}

	/// Number of flights opened so far.
	pub fn generation(&self) -> u64 {
		self.generation.load(Ordering::Acquire)
	}

	fn install(&self, slot: &mut Option<Flight>) -> Ticket<'_> {
		let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
		let (signal, _) = watch::channel(None);
		let flight = Flight { generation, signal };
		let waiter = flight.waiter();

		if let Some(previous) = slot.replace(flight) {
			tracing::debug!(gate = self.name, generation = previous.generation, "flight superseded");
		}

		Ticket { gate: self, generation, waiter: Some(waiter) }
	}

	fn finish(&self, generation: u64, completion: Completion) {
		let flight = {
			let mut slot = self.lock();

			match slot.as_ref() {
				Some(flight) if flight.generation == generation => slot.take(),
				_ => None,
			}
		};

		if let Some(flight) = flight {
			flight.signal.send_replace(Some(completion));
		}
	}

	fn lock(&self) -> MutexGuard<'_, Option<Flight>> {
		self.slot.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Ownership of an open flight. Dropping it without [`Ticket::complete`] abandons the flight.
#[derive(Debug)]
pub struct Ticket<'a> {
	gate: &'a Gate,
	generation: u64,
	waiter: Option<Waiter>,
}
impl Ticket<'_> {
	/// Generation number of this flight.
	pub fn generation(&self) -> u64 {
		self.generation
	}

	/// Waiter released when this flight completes, from any side.
	pub fn waiter(&mut self) -> Waiter {
		match self.waiter.take() {
			Some(waiter) => waiter,
			None => Waiter::closed(),
		}
	}

	/// Clear the slot and release every waiter with `completion`.
	pub fn complete(self, completion: Completion) {
		self.gate.finish(self.generation, completion);
	}
}
impl Drop for Ticket<'_> {
	fn drop(&mut self) {
		self.gate.finish(self.generation, Completion::Abandoned);
	}
}

/// Handle that resolves once its flight completes.
#[derive(Debug)]
pub struct Waiter {
	receiver: watch::Receiver<Option<Completion>>,
}
impl Waiter {
	fn closed() -> Self {
		let (_, receiver) = watch::channel(Some(Completion::Abandoned));

		Self { receiver }
	}

	/// Wait until the flight completes.
	pub async fn wait(mut self) -> Completion {
		match self.receiver.wait_for(Option::is_some).await {
			Ok(value) => (*value).unwrap_or(Completion::Abandoned),
			Err(_) => Completion::Abandoned,
		}
	}

	/// Wait at most `timeout`; `None` means the wait timed out.
	pub async fn wait_timeout(self, timeout: Duration) -> Option<Completion> {
		time::timeout(timeout, self.wait()).await.ok()
	}
}

#[derive(Debug)]
struct Flight {
	generation: u64,
	signal: watch::Sender<Option<Completion>>,
}
impl Flight {
	fn waiter(&self) -> Waiter {
		Waiter { receiver: self.signal.subscribe() }
	}
}
