//! Link: the state machine binding an output port to an input port,
//! owning format negotiation and buffer relay between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::format::{CapabilitySet, Format};
use crate::global::GlobalObject;
use crate::negotiate::negotiate;
use crate::port::{CallbackId, Direction, Port};
use crate::signal::Signal;

/// The link's position in its lifecycle state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Created,
    Configured,
    Active,
    Removed,
}

/// A directional connection between an output port and an input port.
pub struct Link {
    output: Arc<Port>,
    input: Arc<Port>,
    filter: Vec<CapabilitySet>,
    format: ArcSwapOption<Format>,
    active: AtomicBool,
    state: Mutex<LinkState>,
    output_cb_id: CallbackId,
    input_cb_id: CallbackId,
    subscriptions: Mutex<Vec<Box<dyn Send>>>,
    on_format_changed: Signal<Option<Format>>,
    on_state_changed: Signal<LinkState>,
    on_removed: Signal<()>,
}

impl GlobalObject for Link {}

impl Link {
    /// Creates a link between `a` and `b`, normalizing argument order if
    /// they were passed input-first. Registers the
    /// cross-forwarding send callbacks and activation pairing, then claims
    /// both ports (failing with `PortBusy` if either is already linked and
    /// does not allow fan-out). Does not negotiate a format; call
    /// [`Self::negotiate_and_configure`] next.
    pub fn new(a: Arc<Port>, b: Arc<Port>, filter: Vec<CapabilitySet>) -> Result<Arc<Link>> {
        let (output, input) = Self::normalize(a, b)?;

        output.claim_link()?;
        if let Err(e) = input.claim_link() {
            output.release_link();
            return Err(e);
        }

        let fwd_to_input = input.clone();
        let output_cb_id = output.add_send_buffer_cb(move |buf| fwd_to_input.receive_buffer(buf));
        let fwd_to_output = output.clone();
        let input_cb_id = input.add_send_buffer_cb(move |buf| fwd_to_output.receive_buffer(buf));

        let link = Arc::new(Link {
            output,
            input,
            filter,
            format: ArcSwapOption::empty(),
            active: AtomicBool::new(false),
            state: Mutex::new(LinkState::Created),
            output_cb_id,
            input_cb_id,
            subscriptions: Mutex::new(Vec::new()),
            on_format_changed: Signal::new(),
            on_state_changed: Signal::new(),
            on_removed: Signal::new(),
        });
        link.wire();

        Ok(link)
    }

    /// Determines which of `a`/`b` is the output and which is the input,
    /// swapping if they were passed input-first. Exposed at
    /// `pub(crate)` so `Core::create_link` can negotiate a format *before*
    /// constructing the `Link` (and therefore before any callback gets
    /// registered on either port), so an `IncompatibleFormats` failure
    /// leaves both ports untouched.
    pub(crate) fn normalize(a: Arc<Port>, b: Arc<Port>) -> Result<(Arc<Port>, Arc<Port>)> {
        let (output, input) = if a.direction() == Direction::Output { (a, b) } else { (b, a) };
        if output.direction() != Direction::Output || input.direction() != Direction::Input {
            return Err(Error::InvalidArguments("link requires exactly one Output and one Input port"));
        }
        Ok((output, input))
    }

    fn wire(self: &Arc<Self>) {
        let mut subs = self.subscriptions.lock();
        let weak = Arc::downgrade(self);

        let w = weak.clone();
        subs.push(Box::new(self.output.on_activate(move |_| {
            if let Some(link) = w.upgrade() {
                link.on_peer_activated(&link.input.clone());
            }
        })));
        let w = weak.clone();
        subs.push(Box::new(self.output.on_deactivate(move |_| {
            if let Some(link) = w.upgrade() {
                link.on_peer_deactivated(&link.input.clone());
            }
        })));
        let w = weak.clone();
        subs.push(Box::new(self.input.on_activate(move |_| {
            if let Some(link) = w.upgrade() {
                link.on_peer_activated(&link.output.clone());
            }
        })));
        let w = weak.clone();
        subs.push(Box::new(self.input.on_deactivate(move |_| {
            if let Some(link) = w.upgrade() {
                link.on_peer_deactivated(&link.output.clone());
            }
        })));
        let w = weak.clone();
        subs.push(Box::new(self.output.on_destroyed(move |_| {
            if let Some(link) = w.upgrade() {
                link.remove();
            }
        })));
        let w = weak.clone();
        subs.push(Box::new(self.input.on_destroyed(move |_| {
            if let Some(link) = w.upgrade() {
                link.remove();
            }
        })));
    }

    /// One side activated; activates the other unless this link already
    /// guarded the re-entrant call.
    fn on_peer_activated(&self, other: &Arc<Port>) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        other.activate();
        let mut state = self.state.lock();
        if *state != LinkState::Removed {
            *state = LinkState::Active;
            drop(state);
            self.on_state_changed.emit(&LinkState::Active);
        }
    }

    fn on_peer_deactivated(&self, other: &Arc<Port>) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        other.deactivate();
        let mut state = self.state.lock();
        if *state == LinkState::Active {
            *state = LinkState::Configured;
            drop(state);
            self.on_state_changed.emit(&LinkState::Configured);
        }
    }

    pub fn output(&self) -> &Arc<Port> {
        &self.output
    }

    pub fn input(&self) -> &Arc<Port> {
        &self.input
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn format(&self) -> Option<Arc<Format>> {
        self.format.load_full()
    }

    /// Runs the negotiator over the filter supplied at creation and both
    /// ports' current capability sets, and on success writes the result to
    /// both ports' `format` (negotiation itself has no side effects, the
    /// caller, here, commits). This is the default path; it does not read or write
    /// either port's `possible_formats`, unlike [`Self::seed_cross_constraints`].
    pub fn negotiate_and_configure(&self) -> Result<Format> {
        let output_formats = self.output.possible_formats();
        let input_formats = self.input.possible_formats();
        let chosen = negotiate(&output_formats, &input_formats, &self.filter)?;
        self.commit_format(chosen.clone());
        Ok(chosen)
    }

    /// Writes an already-negotiated format to both ports and this link,
    /// advancing `created` → `configured`. Used directly by
    /// [`Self::negotiate_and_configure`], and by `Core::create_link`, which
    /// runs the negotiator ahead of constructing the `Link` at all (see
    /// [`Self::normalize`]) and just needs to commit the result here.
    pub(crate) fn commit_format(&self, chosen: Format) {
        self.output.set_format(Some(chosen.clone()));
        self.input.set_format(Some(chosen.clone()));
        self.format.store(Some(Arc::new(chosen.clone())));

        let mut state = self.state.lock();
        if *state == LinkState::Created {
            *state = LinkState::Configured;
        }
        drop(state);
        self.on_format_changed.emit(&Some(chosen.clone()));
        self.on_state_changed.emit(&LinkState::Configured);
    }

    /// Preserves the historical source's behavior of unconditionally
    /// copying the input's capability set onto the output and the output's
    /// chosen format onto the input, *before* negotiation runs. This is a
    /// deliberate deviation flagged rather than silently dropped;
    /// `Core::create_link` does not call this by default, because it
    /// can overwrite genuinely different capabilities on either side.
    pub fn seed_cross_constraints(&self) {
        self.output.set_possible_formats((*self.input.possible_formats()).clone());
        if let Some(format) = self.output.format() {
            self.input.set_format(Some((*format).clone()));
        }
    }

    /// Kicks off the data path by activating the output port; the
    /// activation pairing wired in [`Self::new`] propagates to the input,
    /// so the link activates both ports.
    pub fn activate(&self) {
        self.output.activate();
    }

    pub fn deactivate(&self) {
        self.output.deactivate();
    }

    pub fn on_format_changed<F>(&self, f: F) -> crate::signal::SignalHandle<Option<Format>>
    where
        F: FnMut(&Option<Format>) + Send + 'static,
    {
        self.on_format_changed.connect(f)
    }

    pub fn on_state_changed<F>(&self, f: F) -> crate::signal::SignalHandle<LinkState>
    where
        F: FnMut(&LinkState) + Send + 'static,
    {
        self.on_state_changed.connect(f)
    }

    pub fn on_removed<F>(&self, f: F) -> crate::signal::SignalHandle<()>
    where
        F: FnMut(&()) + Send + 'static,
    {
        self.on_removed.connect(f)
    }

    /// Tears the link down: deactivates both ports if active, unregisters
    /// the forwarding callbacks, releases each port's link claim, drops the
    /// activation-pairing subscriptions, and emits `remove`. Idempotent.
    pub fn remove(&self) {
        {
            let mut state = self.state.lock();
            if *state == LinkState::Removed {
                return;
            }
            *state = LinkState::Removed;
        }

        if self.active.swap(false, Ordering::AcqRel) {
            self.output.deactivate();
            self.input.deactivate();
        }

        self.output.remove_send_buffer_cb(self.output_cb_id);
        self.input.remove_send_buffer_cb(self.input_cb_id);
        self.output.release_link();
        self.input.release_link();
        // Dropping the subscriptions unsubscribes them, so neither port's
        // activate/deactivate/destroyed signal can re-enter this link.
        self.subscriptions.lock().clear();

        self.on_state_changed.emit(&LinkState::Removed);
        self.on_removed.emit(&());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::format::Format;
    use std::sync::atomic::AtomicUsize;

    fn set(strs: &[&str]) -> CapabilitySet {
        CapabilitySet::new(strs.iter().map(|s| Format::from(*s)))
    }

    #[test]
    fn negotiates_and_relays_buffers() {
        let output = Arc::new(Port::new(Direction::Output, set(&["A", "B"])));
        let input = Arc::new(Port::new(Direction::Input, set(&["B", "C"])));

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        input.set_receive(move |buf| {
            r.lock().push(buf.clone());
            Ok(())
        });

        let link = Link::new(output.clone(), input.clone(), vec![]).unwrap();
        let format = link.negotiate_and_configure().unwrap();
        assert_eq!(format, Format::from("B"));

        link.activate();
        assert_eq!(output.state(), crate::port::PortState::Active);
        assert_eq!(input.state(), crate::port::PortState::Active);

        let buf = Buffer::new(1, vec![1, 2, 3]);
        assert!(output.send_buffer(&buf).is_ok());
        assert_eq!(received.lock().len(), 1);
        assert_eq!(received.lock()[0].sequence(), 1);
    }

    #[test]
    fn swapped_arguments_behave_identically() {
        let output = Arc::new(Port::new(Direction::Output, set(&["A", "B"])));
        let input = Arc::new(Port::new(Direction::Input, set(&["B", "C"])));
        // Pass input first, output second.
        let link = Link::new(input.clone(), output.clone(), vec![]).unwrap();
        assert!(std::ptr::eq(link.output().as_ref(), output.as_ref()));
        assert!(std::ptr::eq(link.input().as_ref(), input.as_ref()));
        let format = link.negotiate_and_configure().unwrap();
        assert_eq!(format, Format::from("B"));
    }

    #[test]
    fn negotiate_and_configure_rejects_incompatible_formats() {
        let output = Arc::new(Port::new(Direction::Output, set(&["A"])));
        let input = Arc::new(Port::new(Direction::Input, set(&["B"])));
        let link = Link::new(output, input, vec![]).unwrap();
        let err = link.negotiate_and_configure().unwrap_err();
        assert!(matches!(err, Error::IncompatibleFormats(_)));
    }

    #[test]
    fn port_destruction_deactivates_and_removes_link() {
        let output = Arc::new(Port::new(Direction::Output, set(&["A", "B"])));
        let input = Arc::new(Port::new(Direction::Input, set(&["A", "B"])));
        input.set_receive(|_| Ok(()));

        let link = Link::new(output.clone(), input.clone(), vec![]).unwrap();
        link.negotiate_and_configure().unwrap();
        link.activate();
        assert!(link.is_active());

        let deactivated = Arc::new(AtomicUsize::new(0));
        let d = deactivated.clone();
        let _h = output.on_deactivate(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let removed = Arc::new(AtomicUsize::new(0));
        let r = removed.clone();
        let _h2 = link.on_removed(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        input.prepare_destroy();
        input.notify_destroyed();

        assert_eq!(deactivated.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(link.state(), LinkState::Removed);

        let buf = Buffer::new(2, vec![9]);
        assert!(output.send_buffer(&buf).is_ok());
    }

    #[test]
    fn port_busy_without_fanout() {
        let output = Arc::new(Port::new(Direction::Output, set(&["A"])));
        let input1 = Arc::new(Port::new(Direction::Input, set(&["A"])));
        let input2 = Arc::new(Port::new(Direction::Input, set(&["A"])));
        let _link1 = Link::new(output.clone(), input1, vec![]).unwrap();
        let err = Link::new(output, input2, vec![]).unwrap_err();
        assert!(matches!(err, Error::PortBusy));
    }

    #[test]
    fn fanout_output_delivers_one_buffer_to_every_attached_link() {
        let output = Arc::new(Port::new(Direction::Output, set(&["A"])));
        output.allow_fanout();
        let input1 = Arc::new(Port::new(Direction::Input, set(&["A"])));
        let input2 = Arc::new(Port::new(Direction::Input, set(&["A"])));

        let received1 = Arc::new(Mutex::new(Vec::new()));
        let r1 = received1.clone();
        input1.set_receive(move |buf| {
            r1.lock().push(buf.clone());
            Ok(())
        });
        let received2 = Arc::new(Mutex::new(Vec::new()));
        let r2 = received2.clone();
        input2.set_receive(move |buf| {
            r2.lock().push(buf.clone());
            Ok(())
        });

        let link1 = Link::new(output.clone(), input1.clone(), vec![]).unwrap();
        let link2 = Link::new(output.clone(), input2.clone(), vec![]).unwrap();
        link1.negotiate_and_configure().unwrap();
        link2.negotiate_and_configure().unwrap();

        // Activating either link activates the shared output once, which in
        // turn activates both of its attached inputs independently.
        link1.activate();
        assert_eq!(input1.state(), crate::port::PortState::Active);
        assert_eq!(input2.state(), crate::port::PortState::Active);

        let buf = Buffer::new(1, vec![7, 7]);
        assert!(output.send_buffer(&buf).is_ok());
        assert_eq!(received1.lock().len(), 1);
        assert_eq!(received2.lock().len(), 1);
    }

    #[test]
    fn fanout_first_error_short_circuits_remaining_deliveries() {
        let output = Arc::new(Port::new(Direction::Output, set(&["A"])));
        output.allow_fanout();
        let input1 = Arc::new(Port::new(Direction::Input, set(&["A"])));
        let input2 = Arc::new(Port::new(Direction::Input, set(&["A"])));
        input1.set_receive(|_| Err(Error::WouldBlock));
        let received2 = Arc::new(AtomicUsize::new(0));
        let r2 = received2.clone();
        input2.set_receive(move |_| {
            r2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let _link1 = Link::new(output.clone(), input1, vec![]).unwrap();
        let _link2 = Link::new(output.clone(), input2, vec![]).unwrap();

        let buf = Buffer::new(1, vec![1]);
        let err = output.send_buffer(&buf).unwrap_err();
        assert!(matches!(err, Error::WouldBlock));
        // The callback registered first (input1's) failed, so the second
        // attached link's delivery never ran.
        assert_eq!(received2.load(Ordering::SeqCst), 0);
    }
}
