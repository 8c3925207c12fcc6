//! Port: directional endpoint with a capability set, a negotiated
//! format, and the send/receive entrypoints the link data-plane drives.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use smallvec::SmallVec;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::format::{CapabilitySet, Format};
use crate::global::GlobalObject;
use crate::signal::Signal;

/// A port's direction, fixed for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// A port's position in the create→configure→stream lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PortState {
    Idle = 0,
    Configured = 1,
    Active = 2,
}

impl PortState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => PortState::Idle,
            1 => PortState::Configured,
            _ => PortState::Active,
        }
    }
}

/// Identifies one registered send-buffer callback, stable until explicitly
/// removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type SendCb = dyn Fn(&Buffer) -> Result<()> + Send + Sync;
type ReceiveFn = dyn Fn(&Buffer) -> Result<()> + Send + Sync;
type SendCbList = SmallVec<[(CallbackId, Arc<SendCb>); 1]>;

/// A directional endpoint of a node.
///
/// Every field touched by buffer relay on the data loop (`format`, `state`,
/// the send-callback list) uses lock-free primitives (`arc_swap`, atomics)
/// precisely because the control loop may mutate them concurrently with a
/// buffer in flight; anything the control loop alone touches (the
/// `possible_formats` negotiation input, the fan-out flag) can afford a
/// plain atomic too, since nothing on the data loop reads it.
pub struct Port {
    direction: Direction,
    possible_formats: ArcSwap<CapabilitySet>,
    format: ArcSwapOption<Format>,
    state: AtomicU32,
    // Most ports carry zero or one send callback (the link that claimed
    // them); fan-out ports are the exception, not the common case.
    // Copy-on-write: `add`/`remove` clone the list and swap in a fresh
    // `Arc`, so `send_buffer` reads a snapshot with `load_full()` instead of
    // allocating on every call.
    send_cbs: ArcSwap<SendCbList>,
    next_cb_id: AtomicU64,
    receive: ArcSwapOption<ReceiveFn>,
    allow_fanout: AtomicBool,
    linked: AtomicBool,
    on_activate: Signal<()>,
    on_deactivate: Signal<()>,
    on_format_changed: Signal<Option<Format>>,
    on_possible_formats_changed: Signal<()>,
    on_destroyed: Signal<()>,
}

impl GlobalObject for Port {}

impl Port {
    pub fn new(direction: Direction, possible_formats: CapabilitySet) -> Self {
        Self {
            direction,
            possible_formats: ArcSwap::from_pointee(possible_formats),
            format: ArcSwapOption::empty(),
            state: AtomicU32::new(PortState::Idle as u32),
            send_cbs: ArcSwap::from_pointee(SmallVec::new()),
            next_cb_id: AtomicU64::new(0),
            receive: ArcSwapOption::empty(),
            allow_fanout: AtomicBool::new(false),
            linked: AtomicBool::new(false),
            on_activate: Signal::new(),
            on_deactivate: Signal::new(),
            on_format_changed: Signal::new(),
            on_possible_formats_changed: Signal::new(),
            on_destroyed: Signal::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn possible_formats(&self) -> Arc<CapabilitySet> {
        self.possible_formats.load_full()
    }

    /// Control-loop-only: replaces the capability set and fires the change
    /// notification.
    pub fn set_possible_formats(&self, formats: CapabilitySet) {
        self.possible_formats.store(Arc::new(formats));
        self.on_possible_formats_changed.emit(&());
    }

    pub fn format(&self) -> Option<Arc<Format>> {
        self.format.load_full()
    }

    /// Control-loop-only: writes the negotiated format, at the activation
    /// barrier between the control and data loops. Readable lock-free from the data loop.
    pub fn set_format(&self, format: Option<Format>) {
        self.format.store(format.clone().map(Arc::new));
        self.on_format_changed.emit(&format);
    }

    pub fn state(&self) -> PortState {
        PortState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Whether this port currently has any link attached (used to enforce
    /// the default 1:1 invariant; see [`Self::allow_fanout`]).
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    /// Opts this port into the fan-out extension: once enabled, more
    /// than one link may attach and `send_buffer` delivers to all of them.
    pub fn allow_fanout(&self) {
        self.allow_fanout.store(true, Ordering::Release);
    }

    pub fn fanout_allowed(&self) -> bool {
        self.allow_fanout.load(Ordering::Acquire)
    }

    /// Claims this port for a new link attachment, enforcing the 1:1
    /// default. Returns `Err(PortBusy)` if the port is already linked and
    /// has not opted into fan-out.
    pub fn claim_link(&self) -> Result<()> {
        if self.linked.load(Ordering::Acquire) && !self.fanout_allowed() {
            return Err(Error::PortBusy);
        }
        self.linked.store(true, Ordering::Release);
        Ok(())
    }

    /// Releases this port's link attachment. Must be balanced with
    /// `claim_link`; safe to call when no link remains (fan-out ports may
    /// have several outstanding claims, tracked by their owning links, not
    /// by a count here).
    pub fn release_link(&self) {
        self.linked.store(false, Ordering::Release);
    }

    /// Registers a callback invoked, in registration order, every time this
    /// port must emit a buffer. Returns a stable id for later removal.
    ///
    /// Control-loop-only: clones the current callback list and swaps in the
    /// extended copy, same copy-on-write pattern as [`Self::set_format`].
    pub fn add_send_buffer_cb<F>(&self, f: F) -> CallbackId
    where
        F: Fn(&Buffer) -> Result<()> + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_cb_id.fetch_add(1, Ordering::Relaxed));
        let mut next = (*self.send_cbs.load_full()).clone();
        next.push((id, Arc::new(f)));
        self.send_cbs.store(Arc::new(next));
        id
    }

    /// Removes a previously registered callback. Leaves the relative order
    /// of the remaining callbacks unchanged (invariant 4). Control-loop-only,
    /// same copy-on-write pattern as [`Self::add_send_buffer_cb`].
    pub fn remove_send_buffer_cb(&self, id: CallbackId) {
        let mut next = (*self.send_cbs.load_full()).clone();
        next.retain(|(cid, _)| *cid != id);
        self.send_cbs.store(Arc::new(next));
    }

    pub fn send_buffer_cb_ids(&self) -> Vec<CallbackId> {
        self.send_cbs.load_full().iter().map(|(id, _)| *id).collect()
    }

    /// Emits `buf` to every registered send callback, in registration
    /// order. With zero callbacks (unlinked port) this is a synchronous,
    /// allocation-free no-op returning `Ok(())` for a port with zero
    /// consumers.
    ///
    /// On fan-out ports with more than one callback, the first error
    /// short-circuits delivery to the rest, which are treated as
    /// cancelled rather than attempted.
    ///
    /// Loads the callback list with `load_full`, an `Arc` clone (a refcount
    /// bump), not a heap allocation, so this stays allocation-free on the
    /// data path regardless of how many callbacks are attached.
    pub fn send_buffer(&self, buf: &Buffer) -> Result<()> {
        let cbs = self.send_cbs.load_full();
        for (_, cb) in cbs.iter() {
            cb(buf)?;
        }
        Ok(())
    }

    /// Installs the node's actual buffer sink. Only one sink may be
    /// installed per port; installing a new one replaces the old.
    pub fn set_receive<F>(&self, f: F)
    where
        F: Fn(&Buffer) -> Result<()> + Send + Sync + 'static,
    {
        self.receive.store(Some(Arc::new(f)));
    }

    /// The port's entrypoint for an incoming buffer from its peer. Must not
    /// allocate; returns `WouldBlock` rather than queue indefinitely if no
    /// sink is installed or the sink cannot proceed synchronously.
    pub fn receive_buffer(&self, buf: &Buffer) -> Result<()> {
        match self.receive.load_full() {
            Some(sink) => sink(buf),
            None => Err(Error::WouldBlock),
        }
    }

    /// Configured → Active. Idempotent; emits `activate` only on the actual
    /// transition.
    pub fn activate(&self) {
        let prev = self.state.swap(PortState::Active as u32, Ordering::AcqRel);
        if prev != PortState::Active as u32 {
            self.on_activate.emit(&());
        }
    }

    /// Active → Configured. Idempotent; emits `deactivate` only on the
    /// actual transition.
    pub fn deactivate(&self) {
        let prev = self.state.swap(PortState::Configured as u32, Ordering::AcqRel);
        if prev == PortState::Active as u32 {
            self.on_deactivate.emit(&());
        }
    }

    pub fn on_activate<F>(&self, f: F) -> crate::signal::SignalHandle<()>
    where
        F: FnMut(&()) + Send + 'static,
    {
        self.on_activate.connect(f)
    }

    pub fn on_deactivate<F>(&self, f: F) -> crate::signal::SignalHandle<()>
    where
        F: FnMut(&()) + Send + 'static,
    {
        self.on_deactivate.connect(f)
    }

    pub fn on_format_changed<F>(&self, f: F) -> crate::signal::SignalHandle<Option<Format>>
    where
        F: FnMut(&Option<Format>) + Send + 'static,
    {
        self.on_format_changed.connect(f)
    }

    pub fn on_possible_formats_changed<F>(&self, f: F) -> crate::signal::SignalHandle<()>
    where
        F: FnMut(&()) + Send + 'static,
    {
        self.on_possible_formats_changed.connect(f)
    }

    pub fn on_destroyed<F>(&self, f: F) -> crate::signal::SignalHandle<()>
    where
        F: FnMut(&()) + Send + 'static,
    {
        self.on_destroyed.connect(f)
    }

    /// Must be called before a port is dropped while `Active`, so its
    /// paired link observes the `deactivate` event and can clean up
    /// before it is dropped. Idempotent.
    pub fn prepare_destroy(&self) {
        self.deactivate();
    }

    /// Announces that this port is about to be dropped, so any link
    /// referencing it can unwind (unregister callbacks, deactivate its
    /// peer, remove itself) before the reference actually dangles. Must be
    /// called after [`Self::prepare_destroy`].
    pub fn notify_destroyed(&self) {
        self.on_destroyed.emit(&());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_port(dir: Direction) -> Port {
        Port::new(dir, CapabilitySet::empty())
    }

    #[test]
    fn callback_add_remove_restores_prior_state() {
        let port = empty_port(Direction::Output);
        let a = port.add_send_buffer_cb(|_| Ok(()));
        let b = port.add_send_buffer_cb(|_| Ok(()));
        let before = port.send_buffer_cb_ids();
        port.add_send_buffer_cb(|_| Ok(()));
        port.remove_send_buffer_cb(port.send_buffer_cb_ids()[2]);
        let after = port.send_buffer_cb_ids();
        assert_eq!(before, after);
        assert_eq!(after, vec![a, b]);
    }

    #[test]
    fn send_with_zero_consumers_is_ok() {
        let port = empty_port(Direction::Output);
        assert!(port.send_buffer(&Buffer::new(1, vec![0u8; 4])).is_ok());
    }

    #[test]
    fn activate_deactivate_are_idempotent_and_emit_once() {
        let port = empty_port(Direction::Input);
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let _h = port.on_activate(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        port.activate();
        port.activate();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(port.state(), PortState::Active);
    }

    #[test]
    fn claim_link_enforces_default_one_to_one() {
        let port = empty_port(Direction::Output);
        port.claim_link().unwrap();
        assert!(matches!(port.claim_link(), Err(Error::PortBusy)));
        port.allow_fanout();
        port.claim_link().unwrap();
    }
}
